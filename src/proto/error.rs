use std::io;

use thiserror::Error;

/// Result type alias for slotlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to a Redis Cluster.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An IO error occurred.
    #[error("IO error: {source}")]
    Io {
        /// The underlying IO error.
        #[from]
        source: io::Error,
    },

    /// A protocol error occurred.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the error.
        message: String,
    },

    /// The server returned an error that carries no routing information.
    #[error("server error: {message}")]
    Server {
        /// Error message from server.
        message: String,
    },

    /// Authentication failed.
    #[error("authentication failed")]
    Auth,

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of invalid argument.
        message: String,
    },

    /// Decoding failed.
    #[error("decode error: {source}")]
    Decode {
        /// Underlying decode error.
        #[from]
        source: DecodeError,
    },

    /// Key moved to another node (permanent redirect).
    ///
    /// The slot has been reassigned. The cluster mapping for the slot is
    /// corrected as soon as this error is observed by a cluster connection.
    #[error("MOVED {slot} {address}")]
    Moved {
        /// The slot number (0-16383).
        slot: u16,
        /// The address of the node owning this slot (e.g., "127.0.0.1:7001").
        address: String,
    },

    /// Temporary redirect during migration (ASK redirect).
    ///
    /// The next command for this slot should go to `address`, preceded by
    /// ASKING. The slot mapping is NOT updated.
    #[error("ASK {slot} {address}")]
    Ask {
        /// The slot number (0-16383).
        slot: u16,
        /// The address of the node temporarily handling this slot.
        address: String,
    },

    /// The node cannot serve the request right now; retry on the same node.
    #[error("TRYAGAIN {message}")]
    TryAgain {
        /// Remainder of the server message.
        message: String,
    },

    /// The cluster (or the reachable part of it) is down.
    #[error("CLUSTERDOWN {message}")]
    ClusterDown {
        /// Remainder of the server message.
        message: String,
    },

    /// Keys in a multi-key operation map to different slots.
    ///
    /// Use hash tags `{...}` to ensure keys are in the same slot.
    #[error("CROSSSLOT keys in multi-key operation map to different slots")]
    CrossSlot,

    /// The connection is already bound to a slot.
    #[error("connection already bound to slot {slot}")]
    AlreadyBound {
        /// The slot the connection is bound to.
        slot: u16,
    },

    /// Operation attempted on a connection that was closed.
    #[error("use of closed connection")]
    ClosedConnection,

    /// Operation attempted on a cluster that was closed.
    #[error("cluster is closed")]
    ClusterClosed,

    /// The pool for a node already has `max_active` connections checked out.
    #[error("connection pool exhausted for {address}")]
    PoolExhausted {
        /// Address of the node.
        address: String,
    },

    /// The cluster topology could not be discovered from any candidate node.
    #[error("topology error: {message}")]
    Topology {
        /// Description of the failure.
        message: String,
    },

    /// The retry budget of a [`RetryConn`](crate::RetryConn) was spent.
    #[error("too many attempts ({attempts}): {source}")]
    TooManyAttempts {
        /// Number of attempts made.
        attempts: usize,
        /// Error returned by the last attempt.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Returns true for transport-level failures after which the
    /// connection cannot be reused.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io { .. } | Error::Decode { .. } | Error::Protocol { .. }
        )
    }
}

/// Error returned when frame decoding fails.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    /// The first byte is not a known RESP type marker.
    #[error("unknown frame type: {0:?}")]
    UnknownType(char),

    /// A length or integer line could not be parsed.
    #[error("invalid number: {0}")]
    InvalidNumber(String),

    /// A declared length is larger than the configured maximum.
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    TooLarge {
        /// Declared size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A bulk string payload was not terminated by CRLF.
    #[error("missing CRLF terminator")]
    MissingTerminator,

    /// Arrays are nested deeper than the decoder accepts.
    #[error("frame nesting exceeds maximum depth of {max}")]
    TooDeep {
        /// Maximum accepted depth.
        max: usize,
    },
}
