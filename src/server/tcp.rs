//! TCP listener and per-connection state machine
//!
//! Length-prefixed DNS over TCP with the three inbound limits: at most
//! `max_tcp_per_client` simultaneous connections per client address, at
//! most `max_tcp_queries_per_connection` queries on one connection, and
//! an idle timeout of `client_tcp_timeout` between queries. Each
//! connection reads `length -> payload -> handle -> write` in sequence,
//! which is all the state machine plain DNS-over-TCP needs.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::config::TcpConfig;
use crate::error::{ResolverError, Result};
use crate::server::handler::{IngressProtocol, QueryHandler};
use crate::server::worker::TaskGauge;

/// TCP listener statistics
#[derive(Debug, Default)]
pub struct TcpServerStats {
    connections_accepted: AtomicU64,
    connections_refused: AtomicU64,
    queries_served: AtomicU64,
}

impl TcpServerStats {
    /// Connections accepted
    #[must_use]
    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    /// Connections refused by the per-client cap
    #[must_use]
    pub fn connections_refused(&self) -> u64 {
        self.connections_refused.load(Ordering::Relaxed)
    }

    /// Queries served over TCP
    #[must_use]
    pub fn queries_served(&self) -> u64 {
        self.queries_served.load(Ordering::Relaxed)
    }
}

/// Per-client connection accounting shared by a worker's listeners
#[derive(Debug, Default)]
pub struct ClientConnTable {
    counts: DashMap<IpAddr, usize>,
}

impl ClientConnTable {
    /// Try to take a connection slot for `client`
    fn try_acquire(table: &Arc<Self>, client: IpAddr, max: usize) -> Option<ConnSlot> {
        let mut count = table.counts.entry(client).or_insert(0);
        if *count >= max {
            return None;
        }
        *count += 1;
        drop(count);
        Some(ConnSlot {
            table: Arc::clone(table),
            client,
        })
    }
}

/// Releases its connection slot on drop
struct ConnSlot {
    table: Arc<ClientConnTable>,
    client: IpAddr,
}

impl Drop for ConnSlot {
    fn drop(&mut self) {
        if let Some(mut count) = self.table.counts.get_mut(&self.client) {
            *count = count.saturating_sub(1);
        }
        self.table
            .counts
            .remove_if(&self.client, |_, count| *count == 0);
    }
}

/// Bind a TCP listener with SO_REUSEPORT
pub fn bind_reuseport(addr: SocketAddr) -> Result<std::net::TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ResolverError::network_io("creating TCP listener", e))?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| ResolverError::network_io("setting SO_REUSEPORT", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| ResolverError::network_io("setting nonblocking", e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| ResolverError::network_io(format!("binding TCP {addr}"), e))?;
    socket
        .listen(128)
        .map_err(|e| ResolverError::network_io("listen", e))?;
    Ok(socket.into())
}

/// The per-worker TCP server
pub struct TcpServer {
    listener: TcpListener,
    handler: Arc<QueryHandler>,
    gauge: Arc<TaskGauge>,
    conns: Arc<ClientConnTable>,
    config: TcpConfig,
    stats: Arc<TcpServerStats>,
    shutdown: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl TcpServer {
    /// Wrap an already-bound std listener
    ///
    /// # Errors
    ///
    /// Fails when the listener cannot be registered with the runtime.
    pub fn from_std(
        listener: std::net::TcpListener,
        handler: Arc<QueryHandler>,
        gauge: Arc<TaskGauge>,
        config: TcpConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| ResolverError::network_io("local_addr", e))?;
        let listener = TcpListener::from_std(listener)
            .map_err(|e| ResolverError::network_io("registering TCP listener", e))?;
        Ok(Self {
            listener,
            handler,
            gauge,
            conns: Arc::new(ClientConnTable::default()),
            config,
            stats: Arc::new(TcpServerStats::default()),
            shutdown,
            local_addr,
        })
    }

    /// The bound address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Server statistics
    #[must_use]
    pub fn stats(&self) -> &Arc<TcpServerStats> {
        &self.stats
    }

    /// Accept and serve until shutdown
    pub async fn run(&self) {
        info!(addr = %self.local_addr, "TCP listener running");
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!(addr = %self.local_addr, "TCP listener stopping");
                return;
            }
            let (stream, client) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!(error = %e, "TCP accept error");
                    continue;
                }
            };

            let Some(slot) = ClientConnTable::try_acquire(
                &self.conns,
                client.ip(),
                self.config.max_tcp_per_client,
            ) else {
                self.stats.connections_refused.fetch_add(1, Ordering::Relaxed);
                debug!(client = %client, "per-client TCP connection cap hit");
                continue;
            };
            self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);

            let handler = Arc::clone(&self.handler);
            let gauge = Arc::clone(&self.gauge);
            let stats = Arc::clone(&self.stats);
            let config = self.config.clone();
            tokio::spawn(async move {
                let _slot = slot;
                if let Err(e) = serve_connection(stream, client, handler, gauge, &config, &stats).await {
                    trace!(client = %client, error = %e, "TCP connection closed");
                }
            });
        }
    }
}

/// Serve queries on one connection until a cap or timeout closes it
async fn serve_connection(
    mut stream: TcpStream,
    client: SocketAddr,
    handler: Arc<QueryHandler>,
    gauge: Arc<TaskGauge>,
    config: &TcpConfig,
    stats: &TcpServerStats,
) -> Result<()> {
    let idle = Duration::from_secs(config.client_tcp_timeout.max(1));

    for _ in 0..config.max_tcp_queries_per_connection {
        // BYTE0/BYTE1: the length prefix, bounded by the idle timeout
        let mut len_buf = [0u8; 2];
        match timeout(idle, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => return Ok(()), // closed or idled out
        }
        let len = usize::from(u16::from_be_bytes(len_buf));
        if len == 0 {
            return Ok(());
        }

        // GETQUESTION: the payload
        let mut payload = vec![0u8; len];
        match timeout(idle, stream.read_exact(&mut payload)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(ResolverError::network_io("TCP payload read", e));
            }
            Err(_) => {
                return Err(ResolverError::timeout("TCP payload read", idle));
            }
        }

        let Some(_task) = TaskGauge::try_acquire(&gauge) else {
            handler.global_overload_drop();
            return Ok(());
        };

        if let Some(response) = handler
            .handle_query(client, &payload, IngressProtocol::Tcp)
            .await
        {
            let mut framed = Vec::with_capacity(2 + response.len());
            framed.extend_from_slice(&(response.len() as u16).to_be_bytes());
            framed.extend_from_slice(&response);
            stream
                .write_all(&framed)
                .await
                .map_err(|e| ResolverError::network_io("TCP response write", e))?;
            stats.queries_served.fetch_add(1, Ordering::Relaxed);
        }
    }
    Ok(())
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}
