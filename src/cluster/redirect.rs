//! Parsing of cluster redirection and availability errors.
//!
//! Redis Cluster signals routing changes through error replies:
//! - `MOVED <slot> <host>:<port>` - permanent redirect
//! - `ASK <slot> <host>:<port>` - one-shot redirect during migration
//! - `TRYAGAIN <msg>` - resubmit to the same node after a pause
//! - `CLUSTERDOWN <msg>` - the cluster cannot serve requests right now
//!
//! Reply errors are turned into typed [`Error`] variants once, by
//! [`into_cluster_error`]; everything downstream branches on the variant.

use crate::cluster::slot::SLOT_COUNT;
use crate::Error;

/// The routing meaning of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// Slot permanently owned by another node.
    Moved,
    /// Slot migrating; send the next command to another node after ASKING.
    Ask,
    /// Node briefly unable to serve; retry on the same node.
    TryAgain,
    /// Cluster unavailable; retry after a pause.
    ClusterDown,
    /// Not a cluster condition.
    None,
}

impl RedirectKind {
    /// Returns true for every kind a retrying connection can resolve.
    pub fn is_retryable(self) -> bool {
        !matches!(self, RedirectKind::None)
    }
}

/// A MOVED or ASK redirection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    /// [`RedirectKind::Moved`] or [`RedirectKind::Ask`].
    pub kind: RedirectKind,
    /// The slot being redirected.
    pub slot: u16,
    /// Target address (`host:port`).
    pub address: String,
}

/// Parses a Redis error message into a typed error.
///
/// Malformed MOVED/ASK payloads are kept as [`Error::Server`] with the
/// original message.
///
/// # Examples
///
/// ```
/// use slotlink::{parse_redis_error, Error};
///
/// let err = parse_redis_error(b"MOVED 3999 127.0.0.1:7000");
/// assert!(matches!(err, Error::Moved { slot: 3999, .. }));
/// ```
pub fn parse_redis_error(error_msg: &[u8]) -> Error {
    let msg = String::from_utf8_lossy(error_msg);
    let msg = msg.trim();

    if let Some(stripped) = msg.strip_prefix("MOVED ") {
        if let Some((slot, address)) = parse_redirect_args(stripped) {
            return Error::Moved { slot, address };
        }
    }

    if let Some(stripped) = msg.strip_prefix("ASK ") {
        if let Some((slot, address)) = parse_redirect_args(stripped) {
            return Error::Ask { slot, address };
        }
    }

    if let Some(rest) = strip_code(msg, "TRYAGAIN") {
        return Error::TryAgain {
            message: rest.to_string(),
        };
    }

    if let Some(rest) = strip_code(msg, "CLUSTERDOWN") {
        return Error::ClusterDown {
            message: rest.to_string(),
        };
    }

    if strip_code(msg, "CROSSSLOT").is_some() {
        return Error::CrossSlot;
    }

    Error::Server {
        message: msg.to_string(),
    }
}

/// Converts a raw reply error into its typed cluster form. Other errors are
/// returned unchanged.
pub fn into_cluster_error(err: Error) -> Error {
    match err {
        Error::Server { message } => parse_redis_error(message.as_bytes()),
        other => other,
    }
}

/// Classifies an error.
pub fn classify(err: &Error) -> RedirectKind {
    match err {
        Error::Moved { .. } => RedirectKind::Moved,
        Error::Ask { .. } => RedirectKind::Ask,
        Error::TryAgain { .. } => RedirectKind::TryAgain,
        Error::ClusterDown { .. } => RedirectKind::ClusterDown,
        Error::Server { message } => match parse_redis_error(message.as_bytes()) {
            Error::Server { .. } | Error::CrossSlot => RedirectKind::None,
            parsed => classify(&parsed),
        },
        _ => RedirectKind::None,
    }
}

/// Extracts the MOVED or ASK redirection carried by an error, if any.
///
/// # Examples
///
/// ```
/// use slotlink::{parse_redirect, Error, RedirectKind};
///
/// let err = Error::Ask { slot: 1234, address: "10.0.0.2:7001".to_string() };
/// let redirect = parse_redirect(&err).unwrap();
/// assert_eq!(redirect.kind, RedirectKind::Ask);
/// assert_eq!(redirect.address, "10.0.0.2:7001");
/// ```
pub fn parse_redirect(err: &Error) -> Option<Redirect> {
    match err {
        Error::Moved { slot, address } => Some(Redirect {
            kind: RedirectKind::Moved,
            slot: *slot,
            address: address.clone(),
        }),
        Error::Ask { slot, address } => Some(Redirect {
            kind: RedirectKind::Ask,
            slot: *slot,
            address: address.clone(),
        }),
        Error::Server { message } => match parse_redis_error(message.as_bytes()) {
            parsed @ (Error::Moved { .. } | Error::Ask { .. }) => parse_redirect(&parsed),
            _ => None,
        },
        _ => None,
    }
}

/// Returns true if the error is a TRYAGAIN reply.
pub fn is_try_again(err: &Error) -> bool {
    classify(err) == RedirectKind::TryAgain
}

/// Returns true if the error is a CLUSTERDOWN reply.
pub fn is_cluster_down(err: &Error) -> bool {
    classify(err) == RedirectKind::ClusterDown
}

/// Returns true if the error reports keys in different slots.
pub fn is_crossslot(err: &Error) -> bool {
    match err {
        Error::CrossSlot => true,
        Error::Server { message } => strip_code(message.trim(), "CROSSSLOT").is_some(),
        _ => false,
    }
}

/// Fills in the host of a redirect target that only carries a port
/// (`:7001`), using the host of the node that sent it. Unbracketed IPv6
/// targets (`::1:7001`) are bracketed so they can be dialed.
pub(crate) fn resolve_address(target: &str, current: Option<&str>) -> String {
    if let (Some(port), Some(current)) = (target.strip_prefix(':'), current) {
        if let Ok(port) = port.parse::<u16>() {
            return join_host_port(host_of(current), port);
        }
    }
    match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
            Ok(port) => join_host_port(host, port),
            Err(_) => target.to_string(),
        },
        _ => target.to_string(),
    }
}

/// Formats `host:port`, bracketing IPv6 hosts.
pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Returns the host part of a `host:port` address, brackets kept.
pub(crate) fn host_of(address: &str) -> &str {
    address.rsplit_once(':').map_or(address, |(host, _)| host)
}

/// Parses redirect arguments: "<slot> <host>:<port>"
fn parse_redirect_args(args: &str) -> Option<(u16, String)> {
    let mut parts = args.split_whitespace();
    let slot: u16 = parts.next()?.parse().ok()?;
    let address = parts.next()?;
    if parts.next().is_some() || slot >= SLOT_COUNT {
        return None;
    }

    let (_, port) = address.rsplit_once(':')?;
    port.parse::<u16>().ok()?;

    Some((slot, address.to_string()))
}

/// Matches an error code followed by end of message or a space.
fn strip_code<'a>(msg: &'a str, code: &str) -> Option<&'a str> {
    let rest = msg.strip_prefix(code)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix(' ')
    }
}
