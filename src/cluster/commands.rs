//! Redis Cluster command builders.
//!
//! Commands used for topology discovery and redirect handling.

use crate::core::command::Cmd;

/// Creates a CLUSTER SLOTS command.
///
/// Returns the slot ranges of the cluster with their primary and replica
/// nodes. This is how the slot mapping is discovered.
pub fn cluster_slots() -> Cmd {
    Cmd::new("CLUSTER").arg("SLOTS")
}

/// Creates an ASKING command.
///
/// Sent before retrying a command that received an ASK redirect. The flag
/// only affects the immediately following command.
pub fn asking() -> Cmd {
    Cmd::new("ASKING")
}

/// Creates a READONLY command, which allows reads from a replica on this
/// connection.
pub fn readonly() -> Cmd {
    Cmd::new("READONLY")
}
