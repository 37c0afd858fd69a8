//! Runtime configuration.
//!
//! Two environment variables are read once during `gc_init`:
//! `GENGC_PARAMS` carries tuning options, `GENGC_DEBUG` carries debug flags.
//! Both are comma-separated `key[=value]` lists. A malformed `GENGC_PARAMS`
//! prints the usage table and terminates the process; debug flags are
//! diagnostics and only warn.

use std::str::FromStr;
use strum_macros::EnumString;

use crate::util::constants::*;

/// Major-heap backend selection.
#[derive(Copy, Clone, Debug, Eq, PartialEq, EnumString)]
pub enum MajorSelector {
    #[strum(serialize = "marksweep")]
    MarkSweep,
    #[strum(serialize = "marksweep-par")]
    MarkSweepPar,
    #[strum(serialize = "marksweep-fixed")]
    MarkSweepFixed,
    #[strum(serialize = "marksweep-fixed-par")]
    MarkSweepFixedPar,
    #[strum(serialize = "copying")]
    Copying,
}

/// Write-barrier backend selection.
#[derive(Copy, Clone, Debug, Eq, PartialEq, EnumString)]
pub enum WBarrierSelector {
    #[strum(serialize = "remset")]
    Remset,
    #[strum(serialize = "cardtable")]
    Cardtable,
}

/// Stack scanning mode. `Precise` still falls back to conservative scanning
/// for threads whose runtime cannot enumerate their frames.
#[derive(Copy, Clone, Debug, Eq, PartialEq, EnumString)]
pub enum StackMarkSelector {
    #[strum(serialize = "precise")]
    Precise,
    #[strum(serialize = "conservative")]
    Conservative,
}

/// A byte count parsed with optional `k`/`m`/`g` suffix.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Bytes(pub usize);

impl FromStr for Bytes {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty size".to_string());
        }
        let (digits, shift) = match s.as_bytes()[s.len() - 1].to_ascii_lowercase() {
            b'k' => (&s[..s.len() - 1], LOG_BYTES_IN_KBYTE),
            b'm' => (&s[..s.len() - 1], LOG_BYTES_IN_MBYTE),
            b'g' => (&s[..s.len() - 1], LOG_BYTES_IN_MBYTE + 10),
            _ => (s, 0),
        };
        let n: usize = digits
            .parse()
            .map_err(|_| format!("invalid size '{}'", s))?;
        n.checked_mul(1 << shift)
            .map(Bytes)
            .ok_or_else(|| format!("size '{}' overflows", s))
    }
}

fn always_valid<T>(_: &T) -> bool {
    true
}

/// One configuration option: a value plus its validator.
#[derive(Clone)]
pub struct GcOption<T: std::fmt::Debug + Clone> {
    value: T,
    validator: fn(&T) -> bool,
}

impl<T: std::fmt::Debug + Clone> GcOption<T> {
    fn new(value: T, validator: fn(&T) -> bool) -> Self {
        GcOption { value, validator }
    }

    /// Set the option. Returns false (leaving the value alone) if the new
    /// value fails validation.
    pub fn set(&mut self, value: T) -> bool {
        if (self.validator)(&value) {
            self.value = value;
            return true;
        }
        false
    }
}

impl<T: std::fmt::Debug + Clone> std::ops::Deref for GcOption<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

macro_rules! options {
    ($($(#[$outer:meta])* $name:ident: $type:ty [$validator:expr] = $default:expr),*,) => {
        options!($($(#[$outer])* $name: $type [$validator] = $default),*);
    };
    ($($(#[$outer:meta])* $name:ident: $type:ty [$validator:expr] = $default:expr),*) => {
        #[derive(Clone)]
        pub struct Options {
            $($(#[$outer])* pub $name: GcOption<$type>),*
        }

        impl Options {
            /// Set one option from its `GENGC_PARAMS` key (dashes allowed).
            /// Returns false on an unknown key, an unparsable value, or a
            /// value that fails validation.
            pub fn set_from_str(&mut self, key: &str, val: &str) -> bool {
                match key.replace('-', "_").as_str() {
                    $(stringify!($name) => match val.parse::<$type>() {
                        Ok(typed) => self.$name.set(typed),
                        Err(_) => false,
                    },)*
                    _ => false,
                }
            }

            fn new() -> Self {
                Options {
                    $($name: GcOption::new($default, $validator)),*
                }
            }
        }

        impl Default for Options {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

options! {
    /// Old-generation backend.
    major: MajorSelector [always_valid] = MajorSelector::MarkSweep,
    /// Write-barrier style.
    wbarrier: WBarrierSelector [always_valid] = WBarrierSelector::Remset,
    /// Hard upper bound on the managed heap.
    max_heap_size: Bytes [|v: &Bytes| v.0 >= MIN_HEAP_SIZE] = Bytes(default_max_heap_size()),
    /// Soft target the allowance logic steers towards.
    soft_heap_limit: Bytes [|v: &Bytes| v.0 >= MIN_HEAP_SIZE] = Bytes(default_max_heap_size()),
    /// Nursery section size; power of two, at least the minimum waste.
    nursery_size: Bytes [|v: &Bytes| v.0.is_power_of_two() && v.0 >= MIN_NURSERY_SIZE]
        = Bytes(DEFAULT_NURSERY_SIZE),
    /// Stack scanning mode.
    stack_mark: StackMarkSelector [always_valid] = StackMarkSelector::Conservative,
    /// Parallel marking worker count.
    workers: usize [|v: &usize| (1..=MAX_WORKERS).contains(v)] = default_workers(),
}

fn default_workers() -> usize {
    num_cpus::get().clamp(1, MAX_WORKERS)
}

/// Default hard heap bound: a quarter of physical memory.
fn default_max_heap_size() -> usize {
    ((crate::util::memory::get_system_total_memory() as usize) / 4).max(MIN_HEAP_SIZE)
}

impl Options {
    /// Parse `GENGC_PARAMS`. Any failure prints usage and terminates the
    /// process: a misconfigured collector must not come up.
    pub fn read_from_env() -> Options {
        let mut options = Options::default();
        if let Ok(params) = std::env::var("GENGC_PARAMS") {
            if !options.apply(&params) {
                print_usage(&params);
                std::process::exit(1);
            }
        }
        options
    }

    /// Apply a comma-separated `key=value` list. Returns false on the first
    /// invalid entry.
    pub fn apply(&mut self, params: &str) -> bool {
        for entry in params.split(',').filter(|e| !e.is_empty()) {
            let Some((key, val)) = entry.split_once('=') else {
                return false;
            };
            if !self.set_from_str(key.trim(), val.trim()) {
                return false;
            }
        }
        true
    }
}

fn print_usage(params: &str) {
    eprintln!("gengc: invalid GENGC_PARAMS '{}'", params);
    eprintln!("supported options (comma-separated key=value):");
    eprintln!("  major=marksweep|marksweep-par|marksweep-fixed|marksweep-fixed-par|copying");
    eprintln!("  wbarrier=remset|cardtable");
    eprintln!("  max-heap-size=N[k|m|g]");
    eprintln!("  soft-heap-limit=N[k|m|g]");
    eprintln!("  nursery-size=N[k|m|g]   (power of two, >= {}k)", MIN_NURSERY_SIZE >> 10);
    eprintln!("  stack-mark=precise|conservative");
    eprintln!("  workers=1..{}", MAX_WORKERS);
}

/// Diagnostics toggles from `GENGC_DEBUG`. Unknown flags warn and are
/// skipped; a debug variable must never keep the collector from starting.
#[derive(Clone, Debug, Default)]
pub struct DebugFlags {
    /// Force a minor collection before every Nth allocation.
    pub collect_before_allocs: Option<usize>,
    pub check_at_minor_collections: bool,
    pub clear_at_gc: bool,
    pub xdomain_checks: bool,
    pub verify_nursery_at_minor_gc: bool,
    pub dump_nursery_at_minor_gc: bool,
    pub disable_minor: bool,
    pub disable_major: bool,
    pub heap_dump: Option<String>,
    pub print_allowance: bool,
    pub print_pinning: bool,
}

impl DebugFlags {
    pub fn read_from_env() -> DebugFlags {
        let mut flags = DebugFlags::default();
        if let Ok(debug) = std::env::var("GENGC_DEBUG") {
            flags.apply(&debug);
        }
        flags
    }

    pub fn apply(&mut self, debug: &str) {
        for entry in debug.split(',').filter(|e| !e.is_empty()) {
            let (key, val) = match entry.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (entry.trim(), None),
            };
            match key {
                "collect-before-allocs" => {
                    let n = val.and_then(|v| v.parse().ok()).unwrap_or(1);
                    self.collect_before_allocs = Some(n.max(1));
                }
                "check-at-minor-collections" => self.check_at_minor_collections = true,
                "clear-at-gc" => self.clear_at_gc = true,
                "xdomain-checks" => self.xdomain_checks = true,
                "verify-nursery-at-minor-gc" => self.verify_nursery_at_minor_gc = true,
                "dump-nursery-at-minor-gc" => self.dump_nursery_at_minor_gc = true,
                "disable-minor" => self.disable_minor = true,
                "disable-major" => self.disable_major = true,
                "heap-dump" => match val {
                    Some(file) if !file.is_empty() => self.heap_dump = Some(file.to_string()),
                    _ => warn!("heap-dump requires a file name; ignored"),
                },
                "print-allowance" => self.print_allowance = true,
                "print-pinning" => self.print_pinning = true,
                other => warn!("unknown GENGC_DEBUG flag '{}'; ignored", other),
            }
        }
    }
}
