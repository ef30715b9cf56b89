//! Worker threads and task accounting
//!
//! Each worker is one OS thread running a single-threaded tokio runtime:
//! inside a worker, tasks interleave only at await points, so resolution
//! state never needs locking against its neighbors and a query never
//! migrates off the thread it arrived on. Workers share the caches, the
//! throttle state and the outbound transport through `Arc`s.
//!
//! The [`TaskGauge`] enforces `max_mthreads`: a query only becomes a task
//! while a slot is free, and the slot frees itself when the task's guard
//! drops. At startup the configured ceiling is derated against the
//! process's file-descriptor limit, since every in-flight resolution can
//! hold a socket or two.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::server::handler::QueryHandler;
use crate::server::{tcp, udp};

/// File descriptors reserved for listeners, caches and sundry
const FD_HEADROOM: u64 = 64;

/// Base period of the cache-prune tick
const PRUNE_INTERVAL: Duration = Duration::from_secs(5);

/// Bounds concurrent resolution tasks on one worker
#[derive(Debug)]
pub struct TaskGauge {
    active: AtomicUsize,
    max: usize,
}

impl TaskGauge {
    /// Create a gauge admitting at most `max` tasks
    #[must_use]
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max,
        })
    }

    /// Currently running tasks
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// The admission ceiling
    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }

    /// Take a task slot, or `None` when the worker is saturated
    #[must_use]
    pub fn try_acquire(gauge: &Arc<Self>) -> Option<TaskSlot> {
        let mut current = gauge.active.load(Ordering::Relaxed);
        loop {
            if current >= gauge.max {
                return None;
            }
            match gauge.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(TaskSlot(Arc::clone(gauge))),
                Err(seen) => current = seen,
            }
        }
    }
}

/// Releases its gauge slot on drop
#[derive(Debug)]
pub struct TaskSlot(Arc<TaskGauge>);

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Derate the task ceiling against the fd limit
///
/// Every cooperative task can pin a socket, so admitting more tasks than
/// spare descriptors converts overload into accept-loop failures.
#[must_use]
pub fn derate_mthreads(configured: usize, fd_soft_limit: u64) -> usize {
    let available = fd_soft_limit.saturating_sub(FD_HEADROOM);
    let available = usize::try_from(available).unwrap_or(usize::MAX);
    configured.min(available).max(1)
}

/// The process's soft fd limit, when the platform exposes one
#[must_use]
pub fn fd_soft_limit() -> Option<u64> {
    #[cfg(unix)]
    {
        use nix::sys::resource::{getrlimit, Resource};
        match getrlimit(Resource::RLIMIT_NOFILE) {
            Ok((soft, _hard)) => Some(soft),
            Err(e) => {
                warn!(error = %e, "cannot read RLIMIT_NOFILE");
                None
            }
        }
    }
    #[cfg(not(unix))]
    {
        None
    }
}

/// Spawn the worker threads and block until they finish
///
/// # Errors
///
/// Fails when a worker cannot bind its listen sockets.
pub fn run_workers(
    config: Arc<Config>,
    handler: Arc<QueryHandler>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let max_mthreads = match fd_soft_limit() {
        Some(limit) => {
            let derated = derate_mthreads(config.max_mthreads, limit);
            if derated < config.max_mthreads {
                warn!(
                    configured = config.max_mthreads,
                    derated,
                    fd_limit = limit,
                    "max_mthreads reduced to fit the fd limit"
                );
            }
            derated
        }
        None => config.max_mthreads,
    };

    let mut handles = Vec::with_capacity(config.threads);
    for worker_id in 0..config.threads {
        let config = Arc::clone(&config);
        let handler = Arc::clone(&handler);
        let shutdown = Arc::clone(&shutdown);

        // Bind on the spawning thread so bind errors fail startup loudly.
        let mut udp_sockets = Vec::new();
        let mut tcp_listeners = Vec::new();
        for addr in &config.listen {
            udp_sockets.push(udp::bind_reuseport(*addr)?);
            tcp_listeners.push(tcp::bind_reuseport(*addr)?);
        }

        let handle = std::thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                worker_main(
                    worker_id,
                    config,
                    handler,
                    shutdown,
                    max_mthreads,
                    udp_sockets,
                    tcp_listeners,
                );
            })
            .map_err(|e| crate::error::ResolverError::internal(format!("spawning worker: {e}")))?;
        handles.push(handle);
    }

    for handle in handles {
        if handle.join().is_err() {
            error!("worker thread panicked");
        }
    }
    Ok(())
}

/// One worker's whole life
fn worker_main(
    worker_id: usize,
    config: Arc<Config>,
    handler: Arc<QueryHandler>,
    shutdown: Arc<AtomicBool>,
    max_mthreads: usize,
    udp_sockets: Vec<std::net::UdpSocket>,
    tcp_listeners: Vec<std::net::TcpListener>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(worker_id, error = %e, "cannot build worker runtime");
            return;
        }
    };

    runtime.block_on(async move {
        let gauge = TaskGauge::new(max_mthreads);
        info!(worker_id, max_mthreads, "worker up");

        let mut servers = Vec::new();
        for socket in udp_sockets {
            match udp::UdpServer::from_std(
                socket,
                Arc::clone(&handler),
                Arc::clone(&gauge),
                Arc::clone(&shutdown),
            ) {
                Ok(server) => servers.push(server),
                Err(e) => {
                    error!(worker_id, error = %e, "UDP server setup failed");
                    return;
                }
            }
        }
        let mut tcp_servers = Vec::new();
        for listener in tcp_listeners {
            match tcp::TcpServer::from_std(
                listener,
                Arc::clone(&handler),
                Arc::clone(&gauge),
                config.tcp.clone(),
                Arc::clone(&shutdown),
            ) {
                Ok(server) => tcp_servers.push(server),
                Err(e) => {
                    error!(worker_id, error = %e, "TCP server setup failed");
                    return;
                }
            }
        }

        // Maintenance: cache pruning with per-worker jitter; worker 0 also
        // re-primes the root NS set on its interval.
        let resolver = handler.resolver();
        let maintenance = {
            let config = Arc::clone(&config);
            let shutdown = Arc::clone(&shutdown);
            async move {
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..2_000));
                tokio::time::sleep(jitter).await;
                let mut prune_tick = tokio::time::interval(PRUNE_INTERVAL);
                let mut root_tick = tokio::time::interval(Duration::from_secs(
                    config.resolution.root_refresh_interval.max(60),
                ));
                root_tick.tick().await; // the first tick fires immediately
                loop {
                    tokio::select! {
                        _ = prune_tick.tick() => {
                            if shutdown.load(Ordering::SeqCst) {
                                return;
                            }
                            resolver.env().caches.prune(Instant::now());
                        }
                        _ = root_tick.tick(), if worker_id == 0 => {
                            if let Err(e) = resolver.refresh_root().await {
                                debug!(error = %e, "root refresh failed");
                            }
                        }
                    }
                }
            }
        };

        let mut tasks = tokio::task::JoinSet::new();
        for server in servers {
            let server = Arc::new(server);
            tasks.spawn(async move { server.run().await });
        }
        for server in tcp_servers {
            let server = Arc::new(server);
            tasks.spawn(async move { server.run().await });
        }
        tasks.spawn(maintenance);
        while tasks.join_next().await.is_some() {}
    });
}
