//! Passive socket, accept loop and connection filtering.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::audit::{AuditTrail, ConnectionId};
use super::connection::{Connection, ConnectionOptions, MAX_READ_SIZE, RequestHandler};
use super::framing::MAX_FRAME_LEN;
use super::pool::ConnectionPool;
use crate::config::ListenerConfig;
use crate::error::{Error, Result};

/// Delay before accepting again after a failed accept.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Decides whether an accepted peer may talk to the server.
pub type ConnectionFilter = Arc<dyn Fn(&SocketAddr) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub address: IpAddr,
    /// 0 binds an ephemeral port.
    pub port: u16,
    pub idle_timeout: Duration,
    pub read_max: usize,
    pub max_request_size: usize,
    pub backlog: i32,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        let connection = ConnectionOptions::default();
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            idle_timeout: connection.idle_timeout,
            read_max: connection.read_max,
            max_request_size: connection.max_request_size,
            backlog: 128,
        }
    }
}

impl From<&ListenerConfig> for ListenerOptions {
    fn from(config: &ListenerConfig) -> Self {
        Self {
            address: config.address,
            port: config.port,
            idle_timeout: config.idle_timeout(),
            read_max: config.read_max,
            max_request_size: config.max_request_size,
            ..Default::default()
        }
    }
}

impl ListenerOptions {
    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            idle_timeout: self.idle_timeout,
            read_max: self.read_max,
            max_request_size: self.max_request_size,
        }
    }
}

/// State the accept loop needs, cloned out of the listener.
struct AcceptContext {
    handler: Arc<dyn RequestHandler>,
    filter: Option<ConnectionFilter>,
    audit: Arc<AuditTrail>,
    pool: Arc<ConnectionPool>,
    options: ConnectionOptions,
    cancel: CancellationToken,
}

/// Accepts TCP connections and hands them to a [`ConnectionPool`].
///
/// Connection ids start at 1 and increase with every accepted socket,
/// including those refused by the filter. A refused peer sees the socket
/// closed without any data exchanged.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use leasehold::tcp::{ConnectionId, Listener, ListenerOptions, RequestHandler, Response};
///
/// struct Hello;
///
/// #[async_trait]
/// impl RequestHandler for Hello {
///     async fn handle(&self, _id: ConnectionId, _request: &[u8]) -> Response {
///         Response::reply("hello")
///     }
/// }
///
/// # async fn example() -> leasehold::Result<()> {
/// let listener = Listener::new(ListenerOptions::default(), Arc::new(Hello))?;
/// let address = listener.start()?;
/// println!("listening on {}", address);
/// listener.stop();
/// # Ok(())
/// # }
/// ```
pub struct Listener {
    options: ListenerOptions,
    handler: Arc<dyn RequestHandler>,
    filter: Option<ConnectionFilter>,
    audit: Arc<AuditTrail>,
    pool: Arc<ConnectionPool>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero idle timeout, a
    /// `read_max` outside `1..=MAX_READ_SIZE` or a request size limit
    /// outside `1..=65535`.
    pub fn new(options: ListenerOptions, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        if options.idle_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "idle timeout must be greater than 0".to_string(),
            ));
        }
        if options.read_max == 0 || options.read_max > MAX_READ_SIZE {
            return Err(Error::InvalidConfig(format!(
                "read_max must be between 1 and {}",
                MAX_READ_SIZE
            )));
        }
        if options.max_request_size == 0 || options.max_request_size > MAX_FRAME_LEN {
            return Err(Error::InvalidConfig(format!(
                "max_request_size must be between 1 and {}",
                MAX_FRAME_LEN
            )));
        }

        Ok(Self {
            options,
            handler,
            filter: None,
            audit: Arc::new(AuditTrail::new()),
            pool: Arc::new(ConnectionPool::new()),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
        })
    }

    /// Installs a predicate consulted for every accepted peer before any
    /// data is read.
    pub fn with_filter(mut self, filter: ConnectionFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    fn create_socket(&self) -> Result<std::net::TcpListener> {
        let address = SocketAddr::new(self.options.address, self.options.port);
        let domain = if address.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        socket.bind(&address.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", address, error))
        })?;

        socket.listen(self.options.backlog).map_err(|error| {
            Error::Socket(format!("Failed to listen on {}: {}", address, error))
        })?;

        Ok(socket.into())
    }

    /// Binds and starts accepting. Returns the bound address.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Socket`] if binding fails or the listener was
    /// already started or stopped.
    pub fn start(&self) -> Result<SocketAddr> {
        let mut accept_task = self.accept_task.lock();
        if accept_task.is_some() {
            return Err(Error::Socket("listener is already running".to_string()));
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Socket("listener has been stopped".to_string()));
        }

        let listener = TcpListener::from_std(self.create_socket()?).map_err(|error| {
            Error::Socket(format!("Failed to register listener: {}", error))
        })?;
        let local_addr = listener.local_addr()?;

        let context = AcceptContext {
            handler: Arc::clone(&self.handler),
            filter: self.filter.clone(),
            audit: Arc::clone(&self.audit),
            pool: Arc::clone(&self.pool),
            options: self.options.connection_options(),
            cancel: self.cancel.clone(),
        };
        *accept_task = Some(tokio::spawn(accept_loop(listener, context)));
        *self.local_addr.lock() = Some(local_addr);

        info!("Listening for lease queries on {}", local_addr);
        Ok(local_addr)
    }

    /// Stops accepting and stops every live connection. Idempotent.
    pub fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        self.pool.stop_all();
        debug!("Listener stopped");
    }

    /// Half-closes every live connection without stopping the accept loop.
    pub fn shutdown_connections(&self) {
        self.pool.shutdown_all();
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn is_running(&self) -> bool {
        self.accept_task.lock().is_some() && !self.cancel.is_cancelled()
    }

    pub fn audit_trail(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Number of connections currently served.
    pub fn connection_count(&self) -> usize {
        self.pool.len()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(listener: TcpListener, context: AcceptContext) {
    let mut next_id: ConnectionId = 1;

    loop {
        let accepted = tokio::select! {
            biased;
            _ = context.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!("Failed to accept connection: {}", error);
                tokio::select! {
                    biased;
                    _ = context.cancel.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                }
                continue;
            }
        };

        let id = next_id;
        next_id += 1;

        if let Err(error) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on connection {}: {}", id, error);
        }

        let connection = Arc::new(Connection::new(
            id,
            stream,
            Some(peer),
            Arc::clone(&context.handler),
            Arc::clone(&context.audit),
            context.options.clone(),
        ));

        if let Some(filter) = &context.filter
            && !filter(&peer)
        {
            connection.reject();
            continue;
        }

        debug!("Accepted connection {} from {}", id, peer);
        context.pool.start(connection);
    }

    debug!("Accept loop exited");
}
