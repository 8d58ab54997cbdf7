//! In-process mock cluster node for tests.
//!
//! A [`MockServer`] accepts RESP connections on a loopback port and answers
//! every command with the frame returned by a handler closure. Commands are
//! logged so tests can assert on ordering (for example that ASKING preceded
//! the redirected command).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::proto::codec::{Decoder, Encoder};
use crate::proto::frame::Frame;

type Handler = dyn Fn(&str, &[String]) -> Frame + Send + Sync;

/// A bound but not yet serving mock node.
///
/// Binding first lets a handler refer to the node's own address.
#[derive(Debug)]
pub struct MockListener {
    listener: std::net::TcpListener,
    addr: String,
}

impl MockListener {
    /// Binds a loopback port.
    ///
    /// # Panics
    ///
    /// Panics if no port can be bound.
    pub fn bind() -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind mock listener");
        let addr = listener.local_addr().expect("mock local addr").to_string();
        Self { listener, addr }
    }

    /// Returns the `host:port` of this node.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Starts answering commands with `handler`. Must be called inside a
    /// tokio runtime.
    ///
    /// The handler gets the upper-cased command name and its arguments.
    pub fn serve<F>(self, handler: F) -> MockServer
    where
        F: Fn(&str, &[String]) -> Frame + Send + Sync + 'static,
    {
        self.listener
            .set_nonblocking(true)
            .expect("nonblocking mock listener");
        let listener = TcpListener::from_std(self.listener).expect("register mock listener");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(State {
            handler: Box::new(handler),
            log: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            let mut shutdown = shutdown_rx.clone();
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((socket, _)) = accepted else { return };
                        accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(serve_socket(socket, accept_state.clone(), shutdown_rx.clone()));
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });

        MockServer {
            addr: self.addr,
            state,
            shutdown: shutdown_tx,
        }
    }
}

/// A running mock node. Dropping it stops the node.
pub struct MockServer {
    addr: String,
    state: Arc<State>,
    shutdown: watch::Sender<bool>,
}

struct State {
    handler: Box<Handler>,
    log: Mutex<Vec<String>>,
    accepted: AtomicUsize,
}

impl State {
    fn log(&self) -> MutexGuard<'_, Vec<String>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MockServer {
    /// Binds a loopback port and starts serving immediately.
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&str, &[String]) -> Frame + Send + Sync + 'static,
    {
        MockListener::bind().serve(handler)
    }

    /// Returns the `host:port` of this node.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Returns every command received so far, as `NAME arg1 arg2`.
    pub fn commands(&self) -> Vec<String> {
        self.state.log().clone()
    }

    /// Counts received commands with the given name.
    pub fn count(&self, name: &str) -> usize {
        self.state
            .log()
            .iter()
            .filter(|line| line.split(' ').next() == Some(name))
            .count()
    }

    /// Returns how many connections were accepted.
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Stops accepting and drops every open connection.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn serve_socket(mut socket: TcpStream, state: Arc<State>, mut shutdown: watch::Receiver<bool>) {
    let mut decoder = Decoder::new();
    let mut encoder = Encoder::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = tokio::select! {
            read = socket.read(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            },
            _ = shutdown.changed() => return,
        };
        decoder.append(&buf[..n]);

        while let Ok(Some(frame)) = decoder.decode() {
            let reply = match command_parts(frame) {
                Some((cmd, args)) => {
                    let mut line = cmd.clone();
                    for arg in &args {
                        line.push(' ');
                        line.push_str(arg);
                    }
                    state.log().push(line);
                    (state.handler)(&cmd, &args)
                }
                None => Frame::Error(b"ERR protocol error".to_vec()),
            };
            encoder.encode(&reply);
        }

        let data = encoder.take();
        if socket.write_all(&data).await.is_err() {
            return;
        }
    }
}

fn command_parts(frame: Frame) -> Option<(String, Vec<String>)> {
    let Frame::Array(items) = frame else {
        return None;
    };
    let mut parts = items
        .iter()
        .map(|item| item.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned()));
    let cmd = parts.next()??.to_ascii_uppercase();
    let args = parts.collect::<Option<Vec<_>>>()?;
    Some((cmd, args))
}

/// Builds a CLUSTER SLOTS reply.
///
/// Each range is `(start, end, addresses)` with the primary first.
pub fn slots_reply(ranges: &[(u16, u16, &[&str])]) -> Frame {
    Frame::Array(
        ranges
            .iter()
            .map(|(start, end, addrs)| {
                let mut entry = vec![Frame::Integer(*start as i64), Frame::Integer(*end as i64)];
                for &addr in addrs.iter() {
                    let (host, port) = addr.rsplit_once(':').unwrap_or((addr, "0"));
                    entry.push(Frame::Array(vec![
                        Frame::BulkString(Some(Bytes::from(host.to_string()))),
                        Frame::Integer(port.parse().unwrap_or(0)),
                    ]));
                }
                Frame::Array(entry)
            })
            .collect(),
    )
}

/// A bulk string reply.
pub fn bulk(value: &str) -> Frame {
    Frame::BulkString(Some(Bytes::from(value.to_string())))
}

/// The `+OK` reply.
pub fn ok() -> Frame {
    Frame::SimpleString(b"OK".to_vec())
}

/// An error reply.
pub fn error(message: &str) -> Frame {
    Frame::Error(message.as_bytes().to_vec())
}
