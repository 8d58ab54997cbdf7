//! Slot-bound cluster connections.

use std::any::Any;
use std::fmt;

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, warn};

use crate::cluster::client::Cluster;
use crate::cluster::commands::asking;
use crate::cluster::pool::PooledConn;
use crate::cluster::redirect::{into_cluster_error, resolve_address};
use crate::cluster::slot::keys_slot;
use crate::core::command::Cmd;
use crate::core::connection::{Connection, NodeConnection};
use crate::proto::frame::Frame;
use crate::{Error, Result};

/// A connection obtained from [`Cluster::get`].
///
/// A `ClusterConn` is bound to at most one slot with [`bind`](Self::bind)
/// and talks to the node serving it. Reply errors are returned typed:
/// MOVED, ASK, TRYAGAIN and CLUSTERDOWN come back as [`Error::Moved`],
/// [`Error::Ask`], [`Error::TryAgain`] and [`Error::ClusterDown`].
///
/// On MOVED the cluster mapping for the slot is corrected before the error
/// is returned, so the next connection bound to that slot goes to the right
/// node. The command itself is never retried here; wrap the connection in a
/// [`RetryConn`](crate::RetryConn) for that.
///
/// The underlying node connection is dialed on first use and returned to
/// its pool on [`close`](Self::close) or drop.
pub struct ClusterConn {
    cluster: Cluster,
    conn: Option<PooledConn>,
    slot: Option<u16>,
    closed: bool,
}

impl ClusterConn {
    pub(crate) fn new(cluster: Cluster) -> Self {
        Self {
            cluster,
            conn: None,
            slot: None,
            closed: false,
        }
    }

    /// Binds the connection to the slot of `keys` and connects to the node
    /// serving it.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyBound`] if the connection is already bound
    /// - [`Error::CrossSlot`] if the keys hash to different slots
    /// - [`Error::InvalidArgument`] if no key is given
    /// - [`Error::ClosedConnection`] after [`close`](Self::close)
    pub async fn bind<I, K>(&mut self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        self.ensure_open()?;
        if let Some(slot) = self.slot {
            return Err(Error::AlreadyBound { slot });
        }
        let slot = keys_slot(keys)?;
        self.slot = Some(slot);

        if self.conn.is_none() {
            self.acquire().await?;
        }
        Ok(())
    }

    /// Returns the bound slot.
    pub fn bound_slot(&self) -> Option<u16> {
        self.slot
    }

    /// Returns the address of the node currently in use, if one has been
    /// connected.
    pub fn address(&self) -> Option<&str> {
        self.conn.as_ref().map(PooledConn::address)
    }

    /// Returns the cluster this connection belongs to.
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Sends a command and returns its reply.
    pub async fn execute(&mut self, cmd: &Cmd) -> Result<Frame> {
        let (address, result) = {
            let conn = self.node().await?;
            let address = conn.address().to_string();
            (address, conn.execute(cmd).await)
        };
        match result {
            Ok(frame) => Ok(frame),
            Err(e) => Err(self.observe(e, &address).await),
        }
    }

    /// Queues a command without waiting for the reply.
    pub async fn send(&mut self, cmd: &Cmd) -> Result<()> {
        self.node().await?.send(cmd)
    }

    /// Writes every queued command.
    pub async fn flush(&mut self) -> Result<()> {
        self.node().await?.flush().await
    }

    /// Reads the next reply.
    pub async fn receive(&mut self) -> Result<Frame> {
        let (address, result) = {
            let conn = self.node().await?;
            let address = conn.address().to_string();
            (address, conn.receive().await)
        };
        match result {
            Ok(frame) => Ok(frame),
            Err(e) => Err(self.observe(e, &address).await),
        }
    }

    /// Releases the node connection to its pool (or discards it if broken).
    /// Every later operation, including a second `close`, fails with
    /// [`Error::ClosedConnection`].
    pub async fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.closed = true;
        self.conn = None;
        Ok(())
    }

    /// Returns an error if the connection is closed or broken.
    pub fn err(&self) -> Result<()> {
        self.ensure_open()?;
        match &self.conn {
            Some(conn) => conn.get()?.err(),
            None => Ok(()),
        }
    }

    /// Sends `cmd` to `address` preceded by ASKING, on a separate pooled
    /// connection, in one round trip. This follows an ASK redirect without
    /// touching the slot mapping or the node this connection is using.
    pub async fn execute_asking(&mut self, address: &str, cmd: &Cmd) -> Result<Frame> {
        self.ensure_open()?;
        debug!(%address, "following ASK redirect");
        let mut target = self.cluster.connect(address).await?;
        let result = {
            let conn = target.get_mut()?;
            conn.send(&asking())?;
            conn.execute(cmd).await
        };
        drop(target);
        match result {
            Ok(frame) => Ok(frame),
            Err(e) => Err(self.observe(e, address).await),
        }
    }

    /// Switches to a connection to `address`, returning the current one to
    /// its pool. Does nothing if already connected there.
    pub(crate) async fn redirect(&mut self, address: &str) -> Result<()> {
        self.ensure_open()?;
        if self.address() == Some(address) {
            return Ok(());
        }
        self.conn = None;
        self.conn = Some(self.cluster.connect(address).await?);
        Ok(())
    }

    async fn node(&mut self) -> Result<&mut NodeConnection> {
        self.ensure_open()?;
        if self.conn.is_none() {
            self.acquire().await?;
        }
        match self.conn.as_mut() {
            Some(conn) => conn.get_mut(),
            None => Err(Error::ClosedConnection),
        }
    }

    async fn acquire(&mut self) -> Result<()> {
        let address = self.cluster.address_for_slot(self.slot).await?;
        self.conn = Some(self.cluster.connect(&address).await?);
        Ok(())
    }

    /// Types a reply error and applies the MOVED correction.
    async fn observe(&self, err: Error, current: &str) -> Error {
        match into_cluster_error(err) {
            Error::Moved { slot, address } => {
                let address = resolve_address(&address, Some(current));
                debug!(slot, %address, "slot moved");
                if let Err(e) = self.cluster.update_slot(slot, vec![address.clone()]).await {
                    warn!(slot, error = %e, "could not record MOVED redirect");
                }
                Error::Moved { slot, address }
            }
            Error::Ask { slot, address } => Error::Ask {
                slot,
                address: resolve_address(&address, Some(current)),
            },
            other => other,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::ClosedConnection);
        }
        Ok(())
    }
}

impl fmt::Debug for ClusterConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConn")
            .field("slot", &self.slot)
            .field("address", &self.address())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Connection for ClusterConn {
    fn execute<'a>(&'a mut self, cmd: &'a Cmd) -> BoxFuture<'a, Result<Frame>> {
        ClusterConn::execute(self, cmd).boxed()
    }

    fn send<'a>(&'a mut self, cmd: &'a Cmd) -> BoxFuture<'a, Result<()>> {
        ClusterConn::send(self, cmd).boxed()
    }

    fn flush(&mut self) -> BoxFuture<'_, Result<()>> {
        ClusterConn::flush(self).boxed()
    }

    fn receive(&mut self) -> BoxFuture<'_, Result<Frame>> {
        ClusterConn::receive(self).boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        ClusterConn::close(self).boxed()
    }

    fn err(&self) -> Result<()> {
        ClusterConn::err(self)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}
