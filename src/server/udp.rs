//! UDP listener loop
//!
//! One instance runs per worker, on its own SO_REUSEPORT socket, so the
//! kernel spreads clients across workers and a query never migrates
//! between them. Each accepted datagram becomes one resolution task;
//! when the worker's task gauge is full the datagram is dropped with a
//! counter, which beats queueing work the deadline has already eaten.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::error::{ResolverError, Result};
use crate::server::handler::{IngressProtocol, QueryHandler};
use crate::server::worker::TaskGauge;

/// Receive buffer; large enough for any EDNS query we accept
const RECV_BUFFER_SIZE: usize = 4096;

/// UDP listener statistics
#[derive(Debug, Default)]
pub struct UdpServerStats {
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    overload_drops: AtomicU64,
}

impl UdpServerStats {
    /// Packets received
    #[must_use]
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    /// Packets sent
    #[must_use]
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    /// Queries dropped because the worker was saturated
    #[must_use]
    pub fn overload_drops(&self) -> u64 {
        self.overload_drops.load(Ordering::Relaxed)
    }
}

/// Bind a UDP socket with SO_REUSEPORT so sibling workers share the port
pub fn bind_reuseport(addr: SocketAddr) -> Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| ResolverError::network_io("creating UDP listener", e))?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| ResolverError::network_io("setting SO_REUSEPORT", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| ResolverError::network_io("setting nonblocking", e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| ResolverError::network_io(format!("binding UDP {addr}"), e))?;
    Ok(socket.into())
}

/// The per-worker UDP server
pub struct UdpServer {
    socket: Arc<UdpSocket>,
    handler: Arc<QueryHandler>,
    gauge: Arc<TaskGauge>,
    stats: Arc<UdpServerStats>,
    shutdown: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl UdpServer {
    /// Wrap an already-bound std socket
    ///
    /// # Errors
    ///
    /// Fails when the socket cannot be registered with the runtime.
    pub fn from_std(
        socket: std::net::UdpSocket,
        handler: Arc<QueryHandler>,
        gauge: Arc<TaskGauge>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let local_addr = socket
            .local_addr()
            .map_err(|e| ResolverError::network_io("local_addr", e))?;
        let socket = UdpSocket::from_std(socket)
            .map_err(|e| ResolverError::network_io("registering UDP socket", e))?;
        Ok(Self {
            socket: Arc::new(socket),
            handler,
            gauge,
            stats: Arc::new(UdpServerStats::default()),
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
    pub fn stats(&self) -> &Arc<UdpServerStats> {
        &self.stats
    }

    /// Receive and dispatch until shutdown
    pub async fn run(&self) {
        info!(addr = %self.local_addr, "UDP listener running");
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!(addr = %self.local_addr, "UDP listener stopping");
                return;
            }

            let (len, client) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    debug!(error = %e, "UDP receive error");
                    continue;
                }
            };
            self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
            trace!(client = %client, len, "datagram in");

            let Some(task) = TaskGauge::try_acquire(&self.gauge) else {
                self.stats.overload_drops.fetch_add(1, Ordering::Relaxed);
                self.handler.global_overload_drop();
                warn!(client = %client, "worker saturated, dropping query");
                continue;
            };

            let payload = buf[..len].to_vec();
            let socket = Arc::clone(&self.socket);
            let handler = Arc::clone(&self.handler);
            let stats = Arc::clone(&self.stats);
            tokio::spawn(async move {
                let _task = task;
                if let Some(response) = handler
                    .handle_query(client, &payload, IngressProtocol::Udp)
                    .await
                {
                    match socket.send_to(&response, client).await {
                        Ok(_) => {
                            stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => debug!(client = %client, error = %e, "UDP send failed"),
                    }
                }
            });
        }
    }
}

impl std::fmt::Debug for UdpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpServer")
            .field("addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}
