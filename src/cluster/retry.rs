//! Redirect-following retries.
//!
//! [`RetryConn`] runs each command through a bounded loop. Each attempt
//! either succeeds, fails for good, or leads to one of three transitions:
//!
//! - MOVED: switch the bound connection to the new owner and retry at once
//! - ASK: retry at once on the ASK target, preceded by ASKING
//! - TRYAGAIN / CLUSTERDOWN: wait, then retry on the same node
//!
//! After `max_attempts` attempts the last error is wrapped in
//! [`Error::TooManyAttempts`].

use std::any::Any;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, warn};

use crate::cluster::conn::ClusterConn;
use crate::cluster::redirect::{classify, RedirectKind};
use crate::core::command::Cmd;
use crate::core::connection::Connection;
use crate::proto::frame::Frame;
use crate::{Error, Result};

/// Where the next attempt goes.
#[derive(Debug)]
enum Route {
    /// The node the wrapped connection is bound to.
    Bound,
    /// An ASK target, with ASKING sent first.
    Asking(String),
}

/// A [`ClusterConn`] that follows redirects and retries transient errors.
///
/// Only [`execute`](Self::execute) retries. `send`, `flush`, `receive`,
/// `close` and `err` go straight to the wrapped connection.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use slotlink::{command, Cluster, RetryConn};
///
/// # #[tokio::main]
/// # async fn main() -> slotlink::Result<()> {
/// let cluster = Cluster::new(["127.0.0.1:7000"])?;
/// cluster.refresh().await?;
///
/// let mut conn = cluster.get()?;
/// conn.bind(["counter"]).await?;
/// let mut conn = RetryConn::new(conn, 5, Duration::from_millis(50))?;
/// conn.execute(&command::get("counter")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RetryConn {
    conn: ClusterConn,
    max_attempts: usize,
    wait: Duration,
}

impl RetryConn {
    /// Wraps `conn`. Each command gets at most `max_attempts` attempts;
    /// `wait` is the pause before retrying after TRYAGAIN or CLUSTERDOWN.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `max_attempts` is zero.
    pub fn new(conn: ClusterConn, max_attempts: usize, wait: Duration) -> Result<Self> {
        if max_attempts == 0 {
            return Err(Error::InvalidArgument {
                message: "max_attempts must be at least 1".to_string(),
            });
        }
        Ok(Self {
            conn,
            max_attempts,
            wait,
        })
    }

    /// Returns the maximum number of attempts per command.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Returns the wait between retries of transient errors.
    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Returns the wrapped connection.
    pub fn get_ref(&self) -> &ClusterConn {
        &self.conn
    }

    /// Returns the wrapped connection mutably.
    pub fn get_mut(&mut self) -> &mut ClusterConn {
        &mut self.conn
    }

    /// Unwraps the connection.
    pub fn into_inner(self) -> ClusterConn {
        self.conn
    }

    /// Binds the wrapped connection. See [`ClusterConn::bind`].
    pub async fn bind<I, K>(&mut self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        self.conn.bind(keys).await
    }

    /// Sends a command, following MOVED and ASK redirects and retrying
    /// TRYAGAIN and CLUSTERDOWN.
    ///
    /// # Errors
    ///
    /// Errors that are not cluster conditions are returned as they are,
    /// without retry. When the attempts run out, returns
    /// [`Error::TooManyAttempts`] wrapping the last error.
    pub async fn execute(&mut self, cmd: &Cmd) -> Result<Frame> {
        let mut route = Route::Bound;
        let mut attempt = 1;

        loop {
            let result = match &route {
                Route::Bound => self.conn.execute(cmd).await,
                Route::Asking(address) => self.conn.execute_asking(address, cmd).await,
            };
            let err = match result {
                Ok(frame) => return Ok(frame),
                Err(e) => e,
            };

            let kind = classify(&err);
            if kind == RedirectKind::None {
                return Err(err);
            }
            if attempt >= self.max_attempts {
                warn!(attempts = attempt, error = %err, "giving up");
                return Err(Error::TooManyAttempts {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            match err {
                Error::Moved { address, .. } => {
                    debug!(attempt, %address, "retrying on new owner");
                    self.conn.redirect(&address).await?;
                    route = Route::Bound;
                }
                Error::Ask { address, .. } => {
                    debug!(attempt, %address, "retrying with ASKING");
                    route = Route::Asking(address);
                }
                _ => {
                    debug!(attempt, ?kind, wait = ?self.wait, "cluster busy, backing off");
                    tokio::time::sleep(self.wait).await;
                }
            }
            attempt += 1;
        }
    }

    /// Queues a command on the wrapped connection.
    pub async fn send(&mut self, cmd: &Cmd) -> Result<()> {
        self.conn.send(cmd).await
    }

    /// Flushes the wrapped connection.
    pub async fn flush(&mut self) -> Result<()> {
        self.conn.flush().await
    }

    /// Reads the next reply from the wrapped connection.
    pub async fn receive(&mut self) -> Result<Frame> {
        self.conn.receive().await
    }

    /// Closes the wrapped connection.
    pub async fn close(&mut self) -> Result<()> {
        self.conn.close().await
    }

    /// Returns the wrapped connection's error state.
    pub fn err(&self) -> Result<()> {
        self.conn.err()
    }
}

/// Wraps a boxed connection in a [`RetryConn`].
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if `conn` is not a [`ClusterConn`] or
/// `max_attempts` is zero.
pub fn retry_conn(
    conn: Box<dyn Connection>,
    max_attempts: usize,
    wait: Duration,
) -> Result<RetryConn> {
    match conn.into_any().downcast::<ClusterConn>() {
        Ok(conn) => RetryConn::new(*conn, max_attempts, wait),
        Err(_) => Err(Error::InvalidArgument {
            message: "retry_conn requires a connection obtained from Cluster::get".to_string(),
        }),
    }
}

impl Connection for RetryConn {
    fn execute<'a>(&'a mut self, cmd: &'a Cmd) -> BoxFuture<'a, Result<Frame>> {
        RetryConn::execute(self, cmd).boxed()
    }

    fn send<'a>(&'a mut self, cmd: &'a Cmd) -> BoxFuture<'a, Result<()>> {
        RetryConn::send(self, cmd).boxed()
    }

    fn flush(&mut self) -> BoxFuture<'_, Result<()>> {
        RetryConn::flush(self).boxed()
    }

    fn receive(&mut self) -> BoxFuture<'_, Result<Frame>> {
        RetryConn::receive(self).boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        RetryConn::close(self).boxed()
    }

    fn err(&self) -> Result<()> {
        RetryConn::err(self)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}
