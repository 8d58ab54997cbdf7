//! Redis Cluster support: slot hashing, redirect parsing, topology
//! discovery, per-node pools and the cluster connections built on them.
//!
//! ## Redirects
//!
//! | Reply | Meaning | [`ClusterConn`] | [`RetryConn`] |
//! |---|---|---|---|
//! | `MOVED <slot> <addr>` | slot owned by another node | corrects the mapping, returns the error | switches node, retries |
//! | `ASK <slot> <addr>` | slot migrating | returns the error | retries on `addr` after ASKING |
//! | `TRYAGAIN` | node briefly busy | returns the error | waits, retries |
//! | `CLUSTERDOWN` | cluster unavailable | returns the error | waits, retries |
//!
//! ## Hash tags
//!
//! Keys sharing the content of their first non-empty `{...}` hash to the
//! same slot, which is how multi-key commands stay on one node:
//!
//! ```
//! use slotlink::key_slot;
//!
//! assert_eq!(key_slot("{user1000}.following"), key_slot("{user1000}.followers"));
//! ```

mod client;
pub mod commands;
mod conn;
mod pool;
mod redirect;
mod retry;
mod slot;
mod topology;

pub use client::Cluster;
pub use conn::ClusterConn;
pub use pool::{PoolConfig, PoolStats};
pub use redirect::{
    classify, into_cluster_error, is_cluster_down, is_crossslot, is_try_again, parse_redirect,
    parse_redis_error, Redirect, RedirectKind,
};
pub(crate) use redirect::join_host_port;
pub use retry::{retry_conn, RetryConn};
pub use slot::{key_slot, keys_slot, SLOT_COUNT};
pub use topology::{parse_cluster_slots, SlotRange};
