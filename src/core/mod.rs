//! Node-level building blocks.
//!
//! ## Modules
//!
//! - [`connection`] - The [`Connection`](connection::Connection) trait and single-node connections
//! - [`command`] - Command builders
//! - [`builder`] - Dial options and the cluster builder

pub use crate::proto::error::{Error, Result};

/// Dial options and cluster builder.
pub mod builder;
/// Command construction helpers.
pub mod command;
/// Single-node connection management.
pub mod connection;

cfg_if::cfg_if! {
    if #[cfg(feature = "tls")] {
        mod tls;
        pub use tls::TlsConnectorInner;
    }
}
