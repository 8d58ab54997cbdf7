//! RESP frame types.
//!
//! Frames are the values exchanged with a cluster node: simple strings,
//! errors, integers, bulk strings, arrays and null.

/// Frame type definitions.
pub mod types;

pub use types::Frame;
