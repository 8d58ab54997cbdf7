//! Cluster topology data structures and parsers.
//!
//! A CLUSTER SLOTS reply is parsed into [`SlotRange`]s, which are then
//! expanded into a [`SlotMap`]: one entry per slot holding the addresses
//! serving it, primary first.

use std::sync::Arc;

use crate::cluster::redirect::{host_of, join_host_port};
use crate::cluster::slot::SLOT_COUNT;
use crate::proto::frame::Frame;
use crate::{Error, Result};

/// A range of hash slots and the nodes serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    /// Start of the slot range (inclusive)
    pub start: u16,
    /// End of the slot range (inclusive)
    pub end: u16,
    /// Node addresses (`host:port`), primary first, replicas after
    pub addresses: Vec<String>,
}

impl SlotRange {
    /// Returns true if the given slot is within this range.
    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Returns the number of slots in this range.
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    /// Always false: a parsed range covers at least one slot.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Returns the primary address.
    pub fn primary(&self) -> Option<&str> {
        self.addresses.first().map(String::as_str)
    }
}

/// Parses a CLUSTER SLOTS reply.
///
/// Each entry is `[start, end, [host, port, id?, ...], replicas...]`. A node
/// entry with an empty host (or `?`) is given the host of `queried`, the
/// node that answered.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the reply does not have that shape or a
/// slot lies outside `0..16384`.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use slotlink::cluster::parse_cluster_slots;
/// use slotlink::Frame;
///
/// let reply = Frame::Array(vec![Frame::Array(vec![
///     Frame::Integer(0),
///     Frame::Integer(16383),
///     Frame::Array(vec![Frame::BulkString(Some(Bytes::from(""))), Frame::Integer(7000)]),
/// ])]);
/// let ranges = parse_cluster_slots(reply, "10.0.0.5:7000").unwrap();
/// assert_eq!(ranges[0].addresses, ["10.0.0.5:7000"]);
/// ```
pub fn parse_cluster_slots(frame: Frame, queried: &str) -> Result<Vec<SlotRange>> {
    let entries = match frame {
        Frame::Array(arr) => arr,
        _ => return Err(protocol("CLUSTER SLOTS response must be an array")),
    };

    let fallback_host = host_of(queried);

    let mut ranges = Vec::with_capacity(entries.len());
    for entry in &entries {
        let fields = entry
            .as_array()
            .ok_or_else(|| protocol("slot range must be an array"))?;
        if fields.len() < 3 {
            return Err(protocol("slot range must have a start, an end and a primary"));
        }

        let start = parse_slot(&fields[0])?;
        let end = parse_slot(&fields[1])?;
        if start > end {
            return Err(protocol(format!("slot range {start}-{end} is inverted")));
        }

        let mut addresses = Vec::with_capacity(fields.len() - 2);
        for node in &fields[2..] {
            let address = parse_node(node, fallback_host)?;
            if !addresses.contains(&address) {
                addresses.push(address);
            }
        }

        ranges.push(SlotRange {
            start,
            end,
            addresses,
        });
    }

    Ok(ranges)
}

fn parse_slot(frame: &Frame) -> Result<u16> {
    let value = match frame {
        Frame::Integer(n) => *n,
        other => other
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| protocol("slot must be an integer"))?,
    };
    u16::try_from(value)
        .ok()
        .filter(|slot| *slot < SLOT_COUNT)
        .ok_or_else(|| protocol(format!("slot {value} out of range")))
}

fn parse_node(frame: &Frame, fallback_host: &str) -> Result<String> {
    let fields = frame
        .as_array()
        .ok_or_else(|| protocol("node info must be an array"))?;
    if fields.len() < 2 {
        return Err(protocol("node info must have a host and a port"));
    }

    let host = fields[0]
        .as_str()
        .ok_or_else(|| protocol("node host must be a string"))?;
    let host = if host.is_empty() || host == "?" {
        fallback_host
    } else {
        host
    };

    let port = match &fields[1] {
        Frame::Integer(n) => u16::try_from(*n).ok(),
        other => other.as_str().and_then(|s| s.parse().ok()),
    }
    .ok_or_else(|| protocol("node port must be an integer in 0..65536"))?;

    Ok(join_host_port(host, port))
}

fn protocol(message: impl Into<String>) -> Error {
    Error::Protocol {
        message: message.into(),
    }
}

/// Per-slot address lists.
///
/// Entries are shared slices so that a range of thousands of slots served by
/// the same nodes costs one allocation, and copying an entry out is cheap.
#[derive(Clone)]
pub(crate) struct SlotMap {
    slots: Vec<Option<Arc<[String]>>>,
}

impl SlotMap {
    /// Creates a mapping with every slot unassigned.
    pub(crate) fn new() -> Self {
        Self {
            slots: vec![None; SLOT_COUNT as usize],
        }
    }

    /// Expands parsed ranges into per-slot entries. Later ranges win on
    /// overlap.
    pub(crate) fn from_ranges(ranges: &[SlotRange]) -> Self {
        let mut map = Self::new();
        for range in ranges {
            if range.addresses.is_empty() {
                continue;
            }
            let addresses: Arc<[String]> = range.addresses.clone().into();
            for slot in range.start..=range.end {
                map.slots[slot as usize] = Some(addresses.clone());
            }
        }
        map
    }

    /// Returns the addresses serving `slot`, primary first.
    pub(crate) fn get(&self, slot: u16) -> Option<&Arc<[String]>> {
        self.slots.get(slot as usize).and_then(Option::as_ref)
    }

    /// Overwrites one slot. An empty list marks the slot unassigned.
    pub(crate) fn set(&mut self, slot: u16, addresses: Vec<String>) {
        if let Some(entry) = self.slots.get_mut(slot as usize) {
            *entry = if addresses.is_empty() {
                None
            } else {
                Some(addresses.into())
            };
        }
    }

    /// Returns the distinct primary addresses, in slot order.
    pub(crate) fn primaries(&self) -> Vec<String> {
        let mut primaries: Vec<String> = Vec::new();
        let mut last: Option<&Arc<[String]>> = None;
        for entry in self.slots.iter().flatten() {
            if last.is_some_and(|prev| Arc::ptr_eq(prev, entry)) {
                continue;
            }
            last = Some(entry);
            if let Some(primary) = entry.first() {
                if !primaries.contains(primary) {
                    primaries.push(primary.clone());
                }
            }
        }
        primaries
    }

    /// Returns the primary of the lowest assigned slot.
    pub(crate) fn first_address(&self) -> Option<&str> {
        self.slots
            .iter()
            .flatten()
            .find_map(|entry| entry.first())
            .map(String::as_str)
    }

    /// Copies the whole mapping out.
    pub(crate) fn to_vec(&self) -> Vec<Vec<String>> {
        self.slots
            .iter()
            .map(|entry| entry.as_ref().map(|a| a.to_vec()).unwrap_or_default())
            .collect()
    }

    /// Counts the slots that have an owner.
    pub(crate) fn assigned(&self) -> usize {
        self.slots.iter().filter(|entry| entry.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn node(host: &str, port: i64, id: &str) -> Frame {
        Frame::Array(vec![
            Frame::BulkString(Some(Bytes::from(host.to_string()))),
            Frame::Integer(port),
            Frame::BulkString(Some(Bytes::from(id.to_string()))),
        ])
    }

    fn range(start: i64, end: i64, nodes: Vec<Frame>) -> Frame {
        let mut fields = vec![Frame::Integer(start), Frame::Integer(end)];
        fields.extend(nodes);
        Frame::Array(fields)
    }

    #[test]
    fn test_slot_range_contains() {
        let range = SlotRange {
            start: 0,
            end: 5460,
            addresses: vec!["127.0.0.1:7000".to_string()],
        };

        assert!(range.contains(0));
        assert!(range.contains(5460));
        assert!(!range.contains(5461));
        assert_eq!(range.len(), 5461);
        assert_eq!(range.primary(), Some("127.0.0.1:7000"));
    }

    #[test]
    fn test_parse_simple() {
        let frame = Frame::Array(vec![range(0, 5460, vec![node("127.0.0.1", 7000, "n1")])]);

        let ranges = parse_cluster_slots(frame, "127.0.0.1:7000").unwrap();

        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[0].end, 5460);
        assert_eq!(ranges[0].addresses, ["127.0.0.1:7000"]);
    }

    #[test]
    fn test_parse_with_replicas() {
        let frame = Frame::Array(vec![range(
            0,
            5460,
            vec![node("127.0.0.1", 7000, "m1"), node("127.0.0.1", 7003, "r1")],
        )]);

        let ranges = parse_cluster_slots(frame, "127.0.0.1:7000").unwrap();
        assert_eq!(ranges[0].addresses, ["127.0.0.1:7000", "127.0.0.1:7003"]);
    }

    #[test]
    fn test_parse_empty_host_uses_queried_node() {
        let frame = Frame::Array(vec![range(0, 100, vec![node("", 7001, "m1")])]);
        let ranges = parse_cluster_slots(frame, "10.1.2.3:7000").unwrap();
        assert_eq!(ranges[0].addresses, ["10.1.2.3:7001"]);

        let frame = Frame::Array(vec![range(0, 100, vec![node("?", 7002, "m1")])]);
        let ranges = parse_cluster_slots(frame, "10.1.2.3:7000").unwrap();
        assert_eq!(ranges[0].addresses, ["10.1.2.3:7002"]);
    }

    #[test]
    fn test_parse_ipv6_hosts() {
        let frame = Frame::Array(vec![range(
            0,
            100,
            vec![node("::1", 7000, "m1"), node("", 7001, "r1")],
        )]);
        let ranges = parse_cluster_slots(frame, "[::1]:7000").unwrap();
        assert_eq!(ranges[0].addresses, ["[::1]:7000", "[::1]:7001"]);
    }

    #[test]
    fn test_parse_invalid_frames() {
        assert!(parse_cluster_slots(Frame::SimpleString(b"invalid".to_vec()), "a:1").is_err());

        let short = Frame::Array(vec![Frame::Array(vec![Frame::Integer(0), Frame::Integer(1)])]);
        assert!(parse_cluster_slots(short, "a:1").is_err());

        let out_of_range = Frame::Array(vec![range(0, 16384, vec![node("h", 1, "x")])]);
        assert!(parse_cluster_slots(out_of_range, "a:1").is_err());

        let inverted = Frame::Array(vec![range(10, 5, vec![node("h", 1, "x")])]);
        assert!(parse_cluster_slots(inverted, "a:1").is_err());

        let bad_port = Frame::Array(vec![range(0, 5, vec![node("h", 70000, "x")])]);
        assert!(parse_cluster_slots(bad_port, "a:1").is_err());
    }

    #[test]
    fn test_slot_map_from_ranges() {
        let ranges = vec![
            SlotRange {
                start: 0,
                end: 8191,
                addresses: vec!["a:1".to_string(), "a:2".to_string()],
            },
            SlotRange {
                start: 8192,
                end: 16383,
                addresses: vec!["b:1".to_string()],
            },
        ];
        let map = SlotMap::from_ranges(&ranges);

        assert_eq!(map.get(0).unwrap().to_vec(), ["a:1", "a:2"]);
        assert_eq!(map.get(8191).unwrap().to_vec(), ["a:1", "a:2"]);
        assert_eq!(map.get(8192).unwrap().to_vec(), ["b:1"]);
        assert_eq!(map.assigned(), SLOT_COUNT as usize);
        assert_eq!(map.primaries(), ["a:1", "b:1"]);
        assert_eq!(map.first_address(), Some("a:1"));
    }

    #[test]
    fn test_slot_map_set_only_touches_one_slot() {
        let ranges = vec![SlotRange {
            start: 0,
            end: 16383,
            addresses: vec!["a:1".to_string()],
        }];
        let mut map = SlotMap::from_ranges(&ranges);
        let before = map.to_vec();

        map.set(42, vec!["b:1".to_string()]);

        let after = map.to_vec();
        for slot in 0..SLOT_COUNT as usize {
            if slot == 42 {
                assert_eq!(after[slot], ["b:1"]);
            } else {
                assert_eq!(after[slot], before[slot]);
            }
        }

        map.set(42, Vec::new());
        assert!(map.get(42).is_none());
        assert_eq!(map.assigned(), SLOT_COUNT as usize - 1);
    }

    #[test]
    fn test_empty_map() {
        let map = SlotMap::new();
        assert!(map.get(0).is_none());
        assert!(map.first_address().is_none());
        assert!(map.primaries().is_empty());
        assert_eq!(map.to_vec().len(), SLOT_COUNT as usize);
    }
}
