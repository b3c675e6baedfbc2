//! A single accepted connection and its request/response loop.
//!
//! Each connection runs as its own task:
//!
//! ```text
//! Idle ──bytes──▶ Reading ──full frame──▶ Processing ──written──▶ Idle
//!   │                │                        │
//!   └── idle timeout, peer EOF, stop(), shutdown(), terminate ──▶ Closing ──▶ Closed
//! ```
//!
//! The idle timer is rearmed by every successful read. `stop()` cancels any
//! in-flight read or write and drops the transport; `shutdown()` half-closes
//! the write side and waits for the peer to close.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::audit::{AuditTrail, ConnectionId, Direction};
use super::framing::{FrameDecoder, MAX_FRAME_LEN, encode_frame};
use super::pool::ConnectionPool;
use crate::error::Result;

/// Upper bound for [`ConnectionOptions::read_max`]; each connection
/// allocates a read buffer of that size.
pub const MAX_READ_SIZE: usize = 1024 * 1024;

/// Byte stream a connection runs over: TCP in production, an in-memory
/// duplex in tests. A TLS stream plugs in here as well.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

/// What the handler wants written back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub payload: Vec<u8>,
    /// Close the connection once the payload is written.
    pub terminate: bool,
}

impl Response {
    pub fn reply(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            terminate: false,
        }
    }

    pub fn terminate(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            terminate: true,
        }
    }
}

/// Produces a response for each complete request.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, connection_id: ConnectionId, request: &[u8]) -> Response;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Reading,
    Processing,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Reading => "reading",
            ConnectionState::Processing => "processing",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Inactivity after which the connection is closed.
    pub idle_timeout: Duration,
    /// Upper bound on a single read.
    pub read_max: usize,
    /// Largest accepted request payload.
    pub max_request_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            read_max: 32 * 1024,
            max_request_size: MAX_FRAME_LEN,
        }
    }
}

/// How the serve loop ended.
enum Close {
    /// `stop()`: drop the transport right away.
    Stopped,
    /// Peer already sent EOF: close our side, nothing left to drain.
    PeerClosed,
    /// Half-close and wait for the peer to go away.
    Drain,
}

pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    state: Mutex<ConnectionState>,
    /// Present until the connection is started or closed unstarted.
    transport: Mutex<Option<Box<dyn Transport>>>,
    handler: Arc<dyn RequestHandler>,
    audit: Arc<AuditTrail>,
    options: ConnectionOptions,
    stop: CancellationToken,
    shutdown: CancellationToken,
    pool: Mutex<Weak<ConnectionPool>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        transport: impl Transport,
        peer: Option<SocketAddr>,
        handler: Arc<dyn RequestHandler>,
        audit: Arc<AuditTrail>,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            id,
            peer,
            state: Mutex::new(ConnectionState::Idle),
            transport: Mutex::new(Some(Box::new(transport))),
            handler,
            audit,
            options,
            stop: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            pool: Mutex::new(Weak::new()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub(crate) fn attach_pool(&self, pool: Weak<ConnectionPool>) {
        *self.pool.lock() = pool;
    }

    /// Spawns the request loop. Does nothing if already started or closed.
    pub fn start(self: &Arc<Self>) {
        let Some(transport) = self.transport.lock().take() else {
            warn!("Connection {} cannot be started twice", self.id);
            return;
        };

        let connection = Arc::clone(self);
        tokio::spawn(async move {
            connection.run(transport).await;
        });
    }

    /// Closes the connection immediately, cancelling any pending I/O.
    ///
    /// Safe to call more than once.
    pub fn stop(&self) {
        self.stop.cancel();

        let unstarted = self.transport.lock().take();
        let mut state = self.state.lock();
        if unstarted.is_some() {
            *state = ConnectionState::Closed;
        } else if *state != ConnectionState::Closed {
            *state = ConnectionState::Closing;
        }
    }

    /// Half-closes the connection and lets the peer finish.
    ///
    /// A request already being processed is answered first.
    pub fn shutdown(self: &Arc<Self>) {
        self.shutdown.cancel();
        self.close_unstarted();
    }

    /// Closes a connection the listener refused, without reading from it.
    pub(crate) fn reject(self: &Arc<Self>) {
        debug!("Connection {} rejected by filter", self.id);
        self.close_unstarted();
    }

    fn close_unstarted(self: &Arc<Self>) {
        let Some(mut transport) = self.transport.lock().take() else {
            return;
        };
        self.set_state(ConnectionState::Closing);

        let connection = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = transport.shutdown().await {
                debug!("Connection {} shutdown failed: {}", connection.id, error);
            }
            drop(transport);
            connection.set_state(ConnectionState::Closed);
        });
    }

    async fn run(self: Arc<Self>, mut transport: Box<dyn Transport>) {
        let outcome = self.serve(&mut transport).await;
        self.set_state(ConnectionState::Closing);

        match outcome {
            Ok(Close::Stopped) => {
                debug!("Connection {} stopped", self.id);
            }
            Ok(Close::PeerClosed) => {
                debug!("Connection {} closed by peer", self.id);
                let _ = transport.shutdown().await;
            }
            Ok(Close::Drain) => self.drain(&mut transport).await,
            Err(error) => {
                debug!("Connection {} failed: {}", self.id, error);
            }
        }

        drop(transport);
        self.set_state(ConnectionState::Closed);

        let pool = self.pool.lock().upgrade();
        if let Some(pool) = pool {
            pool.remove(self.id);
        }
    }

    async fn serve(&self, transport: &mut Box<dyn Transport>) -> Result<Close> {
        let mut decoder = FrameDecoder::new(self.options.max_request_size);
        let mut buffer = vec![0u8; self.options.read_max.max(1)];

        loop {
            while let Some(request) = decoder.decode()? {
                self.set_state(ConnectionState::Processing);
                let terminate = tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => return Ok(Close::Stopped),
                    result = self.process(transport, &request) => result?,
                };
                if terminate {
                    return Ok(Close::Drain);
                }
            }

            self.set_state(if decoder.is_empty() {
                ConnectionState::Idle
            } else {
                ConnectionState::Reading
            });

            let read = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(Close::Stopped),
                _ = self.shutdown.cancelled() => return Ok(Close::Drain),
                read = tokio::time::timeout(self.options.idle_timeout, transport.read(&mut buffer)) => read,
            };

            match read {
                Err(_) => {
                    debug!(
                        "Connection {} idle for {:?}, closing",
                        self.id, self.options.idle_timeout
                    );
                    return Ok(Close::Drain);
                }
                Ok(Ok(0)) => return Ok(Close::PeerClosed),
                Ok(Ok(count)) => decoder.extend(&buffer[..count]),
                Ok(Err(error)) => return Err(error.into()),
            }
        }
    }

    /// Handles one request. Returns whether the connection should close.
    async fn process(&self, transport: &mut Box<dyn Transport>, request: &[u8]) -> Result<bool> {
        self.audit.add_entry(self.id, Direction::Inbound, request);

        let response = self.handler.handle(self.id, request).await;
        let frame = match encode_frame(&response.payload) {
            Ok(frame) => frame,
            Err(error) => {
                warn!("Connection {} response dropped: {}", self.id, error);
                return Err(error);
            }
        };

        self.audit
            .add_entry(self.id, Direction::Outbound, &response.payload);

        transport.write_all(&frame).await?;
        transport.flush().await?;

        Ok(response.terminate)
    }

    async fn drain(&self, transport: &mut Box<dyn Transport>) {
        if let Err(error) = transport.shutdown().await {
            debug!("Connection {} half-close failed: {}", self.id, error);
            return;
        }

        // One deadline for the whole drain, not per read.
        let deadline = tokio::time::sleep(self.options.idle_timeout);
        tokio::pin!(deadline);

        let mut scratch = vec![0u8; self.options.read_max.clamp(1, 4096)];
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return,
                _ = &mut deadline => {
                    debug!("Connection {} did not close within {:?}", self.id, self.options.idle_timeout);
                    return;
                }
                read = transport.read(&mut scratch) => match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                },
            }
        }
    }
}
