//! rust-recursor daemon entry point
//!
//! Wires the components together: configuration, tracing, caches, the
//! outbound transport, the resolver, and finally the worker threads that
//! carry the listeners. `SIGINT`/`SIGTERM` flip the shutdown flag the
//! workers poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rust_recursor::resolver::hints::RootHints;
use rust_recursor::resolver::throttle::ServerState;
use rust_recursor::resolver::validate::{ChainValidator, NoopValidator, Validator};
use rust_recursor::transport::UdpExchanger;
use rust_recursor::{
    Config, IterativeResolver, PacketCache, QueryHandler, ResolverCaches, ResolverEnv,
    ResolverStats,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match load_config() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "configuration rejected");
            std::process::exit(1);
        }
    };
    info!(
        version = rust_recursor::VERSION,
        threads = config.threads,
        listen = ?config.listen,
        dnssec = %config.dnssec,
        "starting"
    );

    let stats = Arc::new(ResolverStats::new());
    let caches = Arc::new(ResolverCaches::new(&config));
    let packet_cache = Arc::new(PacketCache::new(config.packet_cache.clone()));
    let servers = Arc::new(ServerState::new(config.throttle.clone()));

    let hints = match &config.root_hints_path {
        Some(path) => match RootHints::load(path) {
            Ok(hints) => hints,
            Err(e) => {
                error!(error = %e, "root hints file rejected");
                std::process::exit(1);
            }
        },
        None => RootHints::builtin(),
    };
    hints.prime(&caches, Instant::now());
    servers.set_roots(hints.all_addrs());

    let exchanger = Arc::new(UdpExchanger::new(
        config.transport.clone(),
        config.edns.clone(),
        Arc::clone(&stats),
    ));
    let validator: Arc<dyn Validator> = if config.dnssec.validates() {
        Arc::new(ChainValidator)
    } else {
        Arc::new(NoopValidator)
    };

    let resolver = Arc::new(IterativeResolver::new(ResolverEnv {
        config: Arc::clone(&config),
        caches,
        servers,
        exchanger,
        validator,
        stats: Arc::clone(&stats),
        hints: Arc::new(hints),
    }));
    let handler = Arc::new(QueryHandler::new(
        Arc::clone(&config),
        resolver,
        packet_cache,
        Arc::clone(&stats),
    ));

    let shutdown = Arc::new(AtomicBool::new(false));
    install_signal_handlers(&shutdown);

    if let Err(e) = rust_recursor::run_workers(config, handler, Arc::clone(&shutdown)) {
        error!(error = %e, "server failed");
        std::process::exit(1);
    }

    let snapshot = stats.snapshot();
    info!(
        answers = snapshot.total_answers(),
        outqueries = snapshot.outqueries,
        "stopped"
    );
}

/// Configuration: first CLI argument as a path, or defaults
fn load_config() -> rust_recursor::Result<Config> {
    match std::env::args().nth(1) {
        Some(path) => Config::load(path),
        None => {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Flip the shutdown flag on SIGINT/SIGTERM
///
/// Workers poll the flag between accepts, so a dedicated thread running a
/// minimal runtime around `tokio::signal` is all the plumbing needed.
fn install_signal_handlers(shutdown: &Arc<AtomicBool>) {
    let flag = Arc::clone(shutdown);
    let spawned = std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || signal_thread(&flag));
    if let Err(e) = spawned {
        error!(error = %e, "cannot spawn signal thread; kill the process to stop it");
    }
}

/// Wait for SIGINT or SIGTERM, then request shutdown
fn signal_thread(shutdown: &AtomicBool) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot build signal runtime");
            return;
        }
    };

    runtime.block_on(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = terminate.recv() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGTERM, handling SIGINT only");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    });

    info!("shutdown signal received");
    shutdown.store(true, Ordering::SeqCst);
}
