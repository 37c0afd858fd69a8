//! Built-in logger wiring.
//!
//! The collector logs through the `log` facade. When the default Cargo
//! feature "builtin_env_logger" is enabled, `gc_init` installs an
//! `env_logger` showing INFO and below so embedders get output without any
//! configuration. Embedders with their own logging stack disable the feature
//! and register their own `log` implementation.

/// Attempt to init an env_logger. Does nothing if the "builtin_env_logger"
/// feature is disabled.
pub(crate) fn try_init() {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let result = env_logger::try_init_from_env(
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            );
            match result {
                Ok(()) => debug!("gengc initialized the built-in logger."),
                // The only current failure mode is that a logger was already set.
                Err(e) => debug!("gengc failed to initialize the built-in env_logger: {e}"),
            }
        } else {
            debug!("built-in env_logger not compiled in.");
        }
    }
}
