//! Utilities: address types, layout constants, OS memory, object headers,
//! gray queues, configuration, and the consistency checker.

pub mod address;
pub mod constants;
pub mod conversions;
pub mod finalizable_processor;
pub mod gray;
pub mod heap;
pub mod logger;
pub mod memory;
pub mod object_header;
pub mod options;
pub mod reference_processor;
pub mod sanity;
#[cfg(test)]
pub mod test_util;

pub use address::{Address, ByteOffset, ByteSize, ObjectReference};
