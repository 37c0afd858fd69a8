//! The collection plan: driver, tracing, pinning, barriers, and the mutator
//! context.

pub mod barriers;
pub mod driver;
pub mod mutator;
pub mod pinning;
pub mod tracing;

pub use driver::CollectReason;
pub use mutator::Mutator;
pub use tracing::{CollectionKind, Tracer};
