//! TCP connection listener
//!
//! Accepts inbound connections and spawns one server-role
//! [`TcpInterface`] per connection, handing each to a device collector.
//! A failed accept is logged and swallowed; one bad connection attempt
//! must never take the listener down.

use super::{TcpInterface, TransportError, DEFAULT_MAX_DATA_LENGTH};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Bound on joining the accept task during shutdown
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default maximum pending connections
const DEFAULT_BACKLOG: u32 = 5;

/// Receives every interface the listener spawns
///
/// Called from the accept task, so implementations must be safe to share
/// across threads.
pub trait DeviceCollector: Send + Sync {
    /// Register a freshly accepted interface
    fn add_interface(&self, interface: TcpInterface);
}

impl DeviceCollector for mpsc::Sender<TcpInterface> {
    fn add_interface(&self, interface: TcpInterface) {
        if let Err(e) = self.try_send(interface) {
            tracing::warn!("collector queue rejected a connection: {}", e);
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Address to bind
    pub host: String,
    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,
    /// Maximum pending connections
    pub backlog: u32,
    /// Payload ceiling handed to every spawned interface
    pub max_data_length: usize,
}

impl ListenerConfig {
    /// Create a listener configuration for the given port
    pub fn new(port: u16) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port,
            backlog: DEFAULT_BACKLOG,
            max_data_length: DEFAULT_MAX_DATA_LENGTH,
        }
    }

    /// Set the bind address
    #[must_use]
    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// Set the maximum number of pending connections
    #[must_use]
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the payload ceiling for spawned interfaces
    #[must_use]
    pub fn max_data_length(mut self, length: usize) -> Self {
        self.max_data_length = length;
        self
    }
}

/// TCP connection listener owning the accept task
pub struct ConnectionListener {
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl ConnectionListener {
    /// Bind the listening socket and start accepting
    pub async fn bind(
        config: ListenerConfig,
        collector: Arc<dyn DeviceCollector>,
    ) -> Result<Self, TransportError> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| TransportError::ConnectionFailed(format!("invalid listen address: {}", e)))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(config.backlog)?;
        let local_addr = listener.local_addr()?;

        tracing::info!("listening on {}", local_addr);

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(accept_loop(
            listener,
            stop_rx,
            collector,
            config.max_data_length,
        ));

        Ok(Self {
            local_addr,
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Address the listener is bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and join the accept task with a bounded wait
    pub async fn shutdown(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!("accept task did not stop in time, aborting it");
                handle.abort();
            }
        }
    }
}

impl Drop for ConnectionListener {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut stop_rx: watch::Receiver<bool>,
    collector: Arc<dyn DeviceCollector>,
    max_data_length: usize,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::info!("accepted connection from {}", peer);
                    collector.add_interface(TcpInterface::from_stream(stream, max_data_length));
                }
                Err(e) => tracing::warn!("accept failed: {}", e),
            },
        }
    }
    tracing::info!("listener stopped");
}
