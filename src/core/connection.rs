use std::any::Any;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::core::builder::DialOptions;
use crate::core::command::{self, Cmd};
use crate::proto::codec::{Decoder, Encoder};
use crate::proto::frame::Frame;
use crate::{Error, Result};

/// A request/response channel to a Redis node.
///
/// This mirrors the classic connection surface: `execute` sends a command
/// and waits for its reply, while `send`, `flush` and `receive` allow
/// pipelining. Reply errors are returned as `Err`.
///
/// The trait is object safe so connections can be handled as
/// `Box<dyn Connection>`; [`retry_conn`](crate::retry_conn) relies on
/// [`into_any`](Connection::into_any) to recover the concrete type.
pub trait Connection: Send + 'static {
    /// Sends a command and returns its reply (Do).
    fn execute<'a>(&'a mut self, cmd: &'a Cmd) -> BoxFuture<'a, Result<Frame>>;

    /// Queues a command without waiting for the reply.
    fn send<'a>(&'a mut self, cmd: &'a Cmd) -> BoxFuture<'a, Result<()>>;

    /// Writes every queued command to the node.
    fn flush(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Reads the next reply.
    fn receive(&mut self) -> BoxFuture<'_, Result<Frame>>;

    /// Closes the connection. Closing twice is an error.
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Returns an error if the connection is closed or broken.
    fn err(&self) -> Result<()>;

    /// Converts the boxed connection into `Any` for downcasting.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// The byte stream underneath a [`NodeConnection`].
pub(crate) enum NodeStream {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for NodeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NodeStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            NodeStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NodeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            NodeStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            NodeStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NodeStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            NodeStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NodeStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            NodeStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A single connection to one cluster node.
///
/// Commands are buffered by [`send`](NodeConnection::send) and written by
/// [`flush`](NodeConnection::flush). [`execute`](NodeConnection::execute)
/// flushes, then reads every pending reply and returns the last one, or the
/// first error reply among them. Transport failures mark the connection as
/// broken; [`err`](NodeConnection::err) reports it and pools discard it.
pub struct NodeConnection {
    address: String,
    stream: NodeStream,
    decoder: Decoder,
    encoder: Encoder,
    pending: usize,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    broken: Option<String>,
    closed: bool,
}

impl NodeConnection {
    /// Dials `address` (`host:port`) and runs the handshake commands the
    /// options ask for (AUTH, CLIENT SETNAME).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the node cannot be reached in time and
    /// [`Error::Auth`] if the credentials are rejected.
    #[instrument(skip(options), level = "debug")]
    pub async fn dial(address: &str, options: &DialOptions) -> Result<Self> {
        let tcp = with_timeout(options.connect_timeout, TcpStream::connect(address)).await?;
        tcp.set_nodelay(true)?;
        let stream = upgrade(tcp, address, options).await?;

        let mut conn = Self {
            address: address.to_string(),
            stream,
            decoder: Decoder::new(),
            encoder: Encoder::new(),
            pending: 0,
            read_timeout: options.read_timeout,
            write_timeout: options.write_timeout,
            broken: None,
            closed: false,
        };

        if let Some(password) = &options.password {
            let cmd = match &options.username {
                Some(user) => command::auth_with_username(user.clone(), password.clone()),
                None => command::auth(password.clone()),
            };
            conn.execute(&cmd).await.map_err(|e| match e {
                Error::Server { .. } => Error::Auth,
                other => other,
            })?;
        }

        if let Some(name) = &options.client_name {
            conn.execute(&command::client_setname(name.clone())).await?;
        }

        debug!(address, "dialed node");
        Ok(conn)
    }

    /// Returns the `host:port` this connection was dialed with.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sends a command and returns its reply.
    pub async fn execute(&mut self, cmd: &Cmd) -> Result<Frame> {
        self.send(cmd)?;
        self.flush().await?;

        let mut first_error = None;
        let mut last = Frame::Null;
        while self.pending > 0 {
            let frame = self.read_frame().await?;
            self.pending -= 1;
            if let Frame::Error(message) = &frame {
                if first_error.is_none() {
                    first_error = Some(reply_error(message));
                }
            }
            last = frame;
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(last),
        }
    }

    /// Queues a command in the write buffer.
    pub fn send(&mut self, cmd: &Cmd) -> Result<()> {
        self.err()?;
        self.encoder.encode_command(cmd.args());
        self.pending += 1;
        Ok(())
    }

    /// Writes every queued command to the node.
    pub async fn flush(&mut self) -> Result<()> {
        self.err()?;
        if self.encoder.is_empty() {
            return Ok(());
        }
        let data = self.encoder.take();
        let result = with_timeout(self.write_timeout, async {
            self.stream.write_all(&data).await?;
            self.stream.flush().await
        })
        .await;
        result.map_err(|e| self.fatal(e.into()))
    }

    /// Reads the next reply. Reply errors are returned as `Err`.
    pub async fn receive(&mut self) -> Result<Frame> {
        self.flush().await?;
        let frame = self.read_frame().await?;
        self.pending = self.pending.saturating_sub(1);
        match frame {
            Frame::Error(message) => Err(reply_error(&message)),
            frame => Ok(frame),
        }
    }

    /// Shuts the stream down. Closing twice returns
    /// [`Error::ClosedConnection`].
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::ClosedConnection);
        }
        self.closed = true;
        if self.broken.is_some() {
            return Ok(());
        }
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Returns an error if the connection is closed or broken.
    pub fn err(&self) -> Result<()> {
        if self.closed {
            return Err(Error::ClosedConnection);
        }
        match &self.broken {
            Some(reason) => Err(Error::Io {
                source: io::Error::new(io::ErrorKind::BrokenPipe, reason.clone()),
            }),
            None => Ok(()),
        }
    }

    /// True if the connection is healthy and has no unread replies or
    /// unflushed commands, so it can be handed to another caller.
    pub(crate) fn is_reusable(&self) -> bool {
        self.err().is_ok() && self.pending == 0 && self.encoder.is_empty()
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            match self.decoder.decode() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) => return Err(self.fatal(e.into())),
            }

            let mut buf = [0u8; 4096];
            let read = with_timeout(self.read_timeout, self.stream.read(&mut buf)).await;
            match read {
                Ok(0) => {
                    let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed");
                    return Err(self.fatal(eof.into()));
                }
                Ok(n) => self.decoder.append(&buf[..n]),
                Err(e) => return Err(self.fatal(e.into())),
            }
        }
    }

    fn fatal(&mut self, err: Error) -> Error {
        if err.is_fatal() && self.broken.is_none() {
            self.broken = Some(err.to_string());
        }
        err
    }
}

impl fmt::Debug for NodeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConnection")
            .field("address", &self.address)
            .field("pending", &self.pending)
            .field("broken", &self.broken)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Connection for NodeConnection {
    fn execute<'a>(&'a mut self, cmd: &'a Cmd) -> BoxFuture<'a, Result<Frame>> {
        NodeConnection::execute(self, cmd).boxed()
    }

    fn send<'a>(&'a mut self, cmd: &'a Cmd) -> BoxFuture<'a, Result<()>> {
        future::ready(NodeConnection::send(self, cmd)).boxed()
    }

    fn flush(&mut self) -> BoxFuture<'_, Result<()>> {
        NodeConnection::flush(self).boxed()
    }

    fn receive(&mut self) -> BoxFuture<'_, Result<Frame>> {
        NodeConnection::receive(self).boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        NodeConnection::close(self).boxed()
    }

    fn err(&self) -> Result<()> {
        NodeConnection::err(self)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

fn reply_error(message: &[u8]) -> Error {
    Error::Server {
        message: String::from_utf8_lossy(message).into_owned(),
    }
}

async fn with_timeout<F, T>(limit: Option<Duration>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "operation timed out"))?,
        None => fut.await,
    }
}

async fn upgrade(tcp: TcpStream, address: &str, options: &DialOptions) -> Result<NodeStream> {
    if !options.tls {
        return Ok(NodeStream::Tcp(tcp));
    }

    cfg_if::cfg_if! {
        if #[cfg(feature = "tls")] {
            let connector = crate::core::TlsConnectorInner::shared();
            let handshake = async {
                connector
                    .connect(tcp, address)
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, e.to_string()))
            };
            let stream = with_timeout(options.connect_timeout, handshake).await?;
            Ok(NodeStream::Tls(Box::new(stream)))
        } else {
            let _ = (tcp, address);
            Err(Error::InvalidArgument {
                message: "TLS requested but the `tls` feature is disabled".to_string(),
            })
        }
    }
}
