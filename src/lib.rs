//! # slotlink
//!
//! A Redis Cluster client that routes every command to the node owning its
//! hash slot and follows the cluster redirect protocol.
//!
//! - [`Cluster`] keeps the slot to node mapping and a connection pool per
//!   node, and reloads the mapping with CLUSTER SLOTS on
//!   [`refresh`](Cluster::refresh).
//! - [`ClusterConn`] is bound to the slot of one or more keys. It reports
//!   MOVED, ASK, TRYAGAIN and CLUSTERDOWN as typed errors and corrects the
//!   mapping on MOVED, but never retries.
//! - [`RetryConn`] wraps a `ClusterConn` and follows redirects, with bounded
//!   attempts and a pause on TRYAGAIN and CLUSTERDOWN.
//!
//! ## Features
//!
//! - `tls` - TLS connections (`rediss://` startup nodes)
//! - `test-utils` - the [`testing`] module with an in-process mock node
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use slotlink::{command, Cluster, RetryConn};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cluster = Cluster::new(["127.0.0.1:7000", "127.0.0.1:7001"])?;
//!     cluster.refresh().await?;
//!
//!     let mut conn = cluster.get()?;
//!     conn.bind(["{user:42}:name", "{user:42}:email"]).await?;
//!     let mut conn = RetryConn::new(conn, 5, Duration::from_millis(100))?;
//!
//!     conn.execute(&command::set("{user:42}:name", "ada")).await?;
//!     let name = conn.execute(&command::get("{user:42}:name")).await?;
//!     println!("{name:?}");
//!
//!     cluster.close().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub(crate) mod core;
pub mod proto;

pub mod cluster;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use crate::cluster::{
    classify, is_cluster_down, is_crossslot, is_try_again, key_slot, keys_slot,
    parse_redirect, parse_redis_error, retry_conn, Cluster, ClusterConn, PoolConfig,
    PoolStats, Redirect, RedirectKind, RetryConn, SLOT_COUNT,
};
pub use crate::core::builder::{ClusterBuilder, DialOptions};
pub use crate::core::command::{self, Cmd};
pub use crate::core::connection::{Connection, NodeConnection};
pub use crate::core::{Error, Result};
pub use crate::proto::error::DecodeError;
pub use crate::proto::frame::Frame;
