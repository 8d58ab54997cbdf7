//! The cluster handle: slot mapping, node pools and topology discovery.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::cluster::commands::cluster_slots;
use crate::cluster::conn::ClusterConn;
use crate::cluster::pool::{NodePool, PoolConfig, PoolStats, PooledConn};
use crate::cluster::slot::SLOT_COUNT;
use crate::cluster::topology::{parse_cluster_slots, SlotMap, SlotRange};
use crate::core::builder::{ClusterBuilder, DialOptions};
use crate::{Error, Result};

/// A Redis Cluster.
///
/// `Cluster` owns the slot to node mapping and one connection pool per
/// known node address. It is cheap to clone and safe to share between
/// tasks; every clone refers to the same state.
///
/// Connections obtained with [`get`](Cluster::get) are not shared: each one
/// serves a single caller at a time.
///
/// # Example
///
/// ```no_run
/// use slotlink::{command, Cluster};
///
/// # #[tokio::main]
/// # async fn main() -> slotlink::Result<()> {
/// let cluster = Cluster::new(["127.0.0.1:7000", "127.0.0.1:7001"])?;
/// cluster.refresh().await?;
///
/// let mut conn = cluster.get()?;
/// conn.bind(["user:{42}:name"]).await?;
/// conn.execute(&command::set("user:{42}:name", "ada")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<Inner>,
}

struct Inner {
    startup_nodes: Vec<String>,
    dial_options: Arc<DialOptions>,
    pool_config: PoolConfig,
    closed: AtomicBool,
    state: Mutex<State>,
}

struct State {
    mapping: SlotMap,
    pools: HashMap<String, Arc<NodePool>>,
}

impl Cluster {
    /// Creates a cluster with default dial and pool options.
    ///
    /// No network I/O happens until [`refresh`](Cluster::refresh) or the
    /// first command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `nodes` is empty or contains an
    /// address that cannot be parsed.
    pub fn new<I, S>(nodes: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClusterBuilder::new().startup_nodes(nodes).build()
    }

    /// Returns a [`ClusterBuilder`].
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::new()
    }

    pub(crate) fn from_parts(
        startup_nodes: Vec<String>,
        dial_options: DialOptions,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                startup_nodes,
                dial_options: Arc::new(dial_options),
                pool_config,
                closed: AtomicBool::new(false),
                state: Mutex::new(State {
                    mapping: SlotMap::new(),
                    pools: HashMap::new(),
                }),
            }),
        }
    }

    /// Returns the normalized startup addresses.
    pub fn startup_nodes(&self) -> &[String] {
        &self.inner.startup_nodes
    }

    /// Reloads the slot mapping with CLUSTER SLOTS.
    ///
    /// Candidates are tried in order until one answers: primaries from the
    /// current mapping first, then the startup nodes. On success the whole
    /// mapping is replaced; on failure it is left as it was.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Topology`] if no candidate answered and
    /// [`Error::ClusterClosed`] after [`close`](Cluster::close).
    #[instrument(skip(self), level = "debug")]
    pub async fn refresh(&self) -> Result<()> {
        self.ensure_open()?;

        let mut candidates = self.inner.state.lock().await.mapping.primaries();
        for node in &self.inner.startup_nodes {
            if !candidates.contains(node) {
                candidates.push(node.clone());
            }
        }

        let mut last_error = None;
        for address in &candidates {
            match self.fetch_slots(address).await {
                Ok(ranges) => {
                    let mapping = SlotMap::from_ranges(&ranges);
                    let mut state = self.inner.state.lock().await;
                    self.ensure_open()?;
                    state.mapping = mapping;
                    debug!(%address, ranges = ranges.len(), "cluster topology refreshed");
                    return Ok(());
                }
                Err(Error::ClusterClosed) => return Err(Error::ClusterClosed),
                Err(e) => {
                    warn!(%address, error = %e, "CLUSTER SLOTS failed");
                    last_error = Some(e);
                }
            }
        }

        let message = match last_error {
            Some(e) => format!("no node answered CLUSTER SLOTS (last error: {e})"),
            None => "no node to query".to_string(),
        };
        Err(Error::Topology { message })
    }

    async fn fetch_slots(&self, address: &str) -> Result<Vec<SlotRange>> {
        let mut conn = self.connect(address).await?;
        let reply = conn.get_mut()?.execute(&cluster_slots()).await?;
        let ranges = parse_cluster_slots(reply, address)?;
        if ranges.is_empty() {
            return Err(Error::Topology {
                message: format!("{address} reported no slot ranges"),
            });
        }
        Ok(ranges)
    }

    /// Returns a new, unbound connection.
    ///
    /// Nothing is dialed until the connection is bound or used.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClusterClosed`] after [`close`](Cluster::close).
    pub fn get(&self) -> Result<ClusterConn> {
        self.ensure_open()?;
        Ok(ClusterConn::new(self.clone()))
    }

    /// Overwrites the addresses serving one slot, primary first. Every other
    /// slot is left untouched. An empty list marks the slot unassigned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `slot` is out of range.
    pub async fn update_slot(&self, slot: u16, addresses: Vec<String>) -> Result<()> {
        if slot >= SLOT_COUNT {
            return Err(Error::InvalidArgument {
                message: format!("slot {slot} out of range"),
            });
        }
        self.inner.state.lock().await.mapping.set(slot, addresses);
        Ok(())
    }

    /// Returns a copy of the addresses serving `slot`. Empty if the slot is
    /// unassigned or out of range.
    pub async fn slot_addresses(&self, slot: u16) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state
            .mapping
            .get(slot)
            .map(|addresses| addresses.to_vec())
            .unwrap_or_default()
    }

    /// Returns a copy of the whole mapping, indexed by slot.
    pub async fn mapping_snapshot(&self) -> Vec<Vec<String>> {
        self.inner.state.lock().await.mapping.to_vec()
    }

    /// Returns connection counts for every known node.
    pub async fn stats(&self) -> HashMap<String, PoolStats> {
        let state = self.inner.state.lock().await;
        state
            .pools
            .iter()
            .map(|(address, pool)| (address.clone(), pool.stats()))
            .collect()
    }

    /// Returns true once [`close`](Cluster::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Closes every pooled connection. Connections still held by callers
    /// are discarded when they are released.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClusterClosed`] if the cluster is already closed.
    pub async fn close(&self) -> Result<()> {
        let pools = {
            let mut state = self.inner.state.lock().await;
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return Err(Error::ClusterClosed);
            }
            std::mem::take(&mut state.pools)
        };

        for (address, pool) in pools {
            for mut conn in pool.close() {
                if let Err(e) = conn.close().await {
                    debug!(%address, error = %e, "error closing idle connection");
                }
            }
        }
        debug!("cluster closed");
        Ok(())
    }

    /// Picks the node for `slot`: its primary, else the first mapped
    /// primary, else the first startup node.
    pub(crate) async fn address_for_slot(&self, slot: Option<u16>) -> Result<String> {
        let state = self.inner.state.lock().await;
        let mapped = slot
            .and_then(|slot| state.mapping.get(slot))
            .and_then(|addresses| addresses.first())
            .map(String::as_str);
        mapped
            .or_else(|| state.mapping.first_address())
            .or_else(|| self.inner.startup_nodes.first().map(String::as_str))
            .map(str::to_string)
            .ok_or_else(|| Error::Topology {
                message: "no known node address".to_string(),
            })
    }

    /// Checks out a connection to `address`, creating its pool on first use.
    pub(crate) async fn connect(&self, address: &str) -> Result<PooledConn> {
        let pool = {
            let mut state = self.inner.state.lock().await;
            self.ensure_open()?;
            state
                .pools
                .entry(address.to_string())
                .or_insert_with(|| {
                    Arc::new(NodePool::new(
                        address.to_string(),
                        self.inner.dial_options.clone(),
                        self.inner.pool_config.clone(),
                    ))
                })
                .clone()
        };
        pool.get().await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClusterClosed);
        }
        Ok(())
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("startup_nodes", &self.inner.startup_nodes)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::slot::key_slot;
    use crate::proto::frame::Frame;
    use crate::testing::{error, slots_reply, MockListener, MockServer};

    fn cluster(nodes: &[&str]) -> Cluster {
        Cluster::new(nodes.iter().copied()).unwrap()
    }

    #[tokio::test]
    async fn test_refresh_builds_mapping() {
        let listener = MockListener::bind();
        let me = listener.addr().to_string();
        let server = listener.serve(move |cmd, _| match cmd {
            "CLUSTER" => slots_reply(&[
                (0, 8191, &[me.as_str(), "127.0.0.1:1"]),
                (8192, 16383, &["127.0.0.1:2"]),
            ]),
            _ => error("ERR unexpected"),
        });

        let cluster = cluster(&[server.addr()]);
        cluster.refresh().await.unwrap();

        assert_eq!(cluster.slot_addresses(0).await, [server.addr(), "127.0.0.1:1"]);
        assert_eq!(cluster.slot_addresses(16383).await, ["127.0.0.1:2"]);
        assert_eq!(server.count("CLUSTER"), 1);

        let snapshot = cluster.mapping_snapshot().await;
        assert_eq!(snapshot.len(), SLOT_COUNT as usize);
        assert_eq!(snapshot[8191][0], server.addr());
    }

    #[tokio::test]
    async fn test_refresh_tries_next_startup_node() {
        let down = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let down_addr = down.local_addr().unwrap().to_string();
        drop(down);

        let listener = MockListener::bind();
        let me = listener.addr().to_string();
        let server = listener.serve(move |_, _| slots_reply(&[(0, 16383, &[me.as_str()])]));

        let cluster = cluster(&[down_addr.as_str(), server.addr()]);
        cluster.refresh().await.unwrap();
        assert_eq!(cluster.slot_addresses(100).await, [server.addr()]);
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_mapping() {
        let server = MockServer::start(|_, _| error("ERR This instance has cluster support disabled"));
        let cluster = cluster(&[server.addr()]);
        cluster
            .update_slot(7, vec!["127.0.0.1:9".to_string()])
            .await
            .unwrap();

        let err = cluster.refresh().await.unwrap_err();
        assert!(matches!(err, Error::Topology { .. }));
        assert_eq!(cluster.slot_addresses(7).await, ["127.0.0.1:9"]);
    }

    #[tokio::test]
    async fn test_refresh_prefers_known_primaries() {
        let listener = MockListener::bind();
        let me = listener.addr().to_string();
        let primary = listener.serve(move |_, _| slots_reply(&[(0, 16383, &[me.as_str()])]));
        let startup = MockServer::start(|_, _| error("ERR should not be asked"));

        let cluster = cluster(&[startup.addr()]);
        cluster
            .update_slot(0, vec![primary.addr().to_string()])
            .await
            .unwrap();
        cluster.refresh().await.unwrap();

        assert_eq!(primary.count("CLUSTER"), 1);
        assert_eq!(startup.count("CLUSTER"), 0);
    }

    #[tokio::test]
    async fn test_update_slot_leaves_other_slots() {
        let cluster = cluster(&["127.0.0.1:7000"]);
        for slot in [0u16, 1, 16383] {
            cluster
                .update_slot(slot, vec!["127.0.0.1:7000".to_string()])
                .await
                .unwrap();
        }
        let before = cluster.mapping_snapshot().await;

        cluster
            .update_slot(1, vec!["127.0.0.1:7001".to_string(), "127.0.0.1:7004".to_string()])
            .await
            .unwrap();

        let after = cluster.mapping_snapshot().await;
        for slot in 0..SLOT_COUNT as usize {
            if slot != 1 {
                assert_eq!(before[slot], after[slot], "slot {slot} changed");
            }
        }
        assert_eq!(after[1], ["127.0.0.1:7001", "127.0.0.1:7004"]);
        assert!(cluster.update_slot(SLOT_COUNT, Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_address_for_slot_fallbacks() {
        let cluster = cluster(&["127.0.0.1:7000"]);
        let slot = key_slot("k");
        assert_eq!(cluster.address_for_slot(Some(slot)).await.unwrap(), "127.0.0.1:7000");
        assert_eq!(cluster.address_for_slot(None).await.unwrap(), "127.0.0.1:7000");

        cluster
            .update_slot(5, vec!["127.0.0.1:7005".to_string()])
            .await
            .unwrap();
        assert_eq!(cluster.address_for_slot(Some(slot)).await.unwrap(), "127.0.0.1:7005");

        cluster
            .update_slot(slot, vec!["127.0.0.1:7002".to_string()])
            .await
            .unwrap();
        assert_eq!(cluster.address_for_slot(Some(slot)).await.unwrap(), "127.0.0.1:7002");
    }

    #[tokio::test]
    async fn test_close() {
        let server = MockServer::start(|_, _| Frame::SimpleString(b"PONG".to_vec()));
        let cluster = cluster(&[server.addr()]);
        drop(cluster.connect(server.addr()).await.unwrap());
        assert_eq!(
            cluster.stats().await[server.addr()],
            PoolStats { active: 0, idle: 1 }
        );

        cluster.close().await.unwrap();
        assert!(cluster.is_closed());
        assert!(matches!(cluster.get(), Err(Error::ClusterClosed)));
        assert!(matches!(cluster.refresh().await, Err(Error::ClusterClosed)));
        assert!(matches!(cluster.close().await, Err(Error::ClusterClosed)));
        assert!(cluster.stats().await.is_empty());
    }

    #[test]
    fn test_cluster_is_send_sync() {
        fn assert_send_sync<T: Send + Sync + Clone>() {}
        assert_send_sync::<Cluster>();
    }
}
