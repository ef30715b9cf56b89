//! Per-server bookkeeping: throttles, speeds, EDNS memory
//!
//! Three maps the resolver consults before and after every outbound
//! query:
//!
//! - **throttle**: servers (or `(server, qname, qtype)` triples) that
//!   failed enough to be benched for a while;
//! - **speeds**: a decaying EWMA of response times, used to order the
//!   candidate servers of a zone cut;
//! - **EDNS status**: servers known to choke on OPT records, so the
//!   retry-without-EDNS lesson is remembered for a while.
//!
//! Failure counting uses a sliding window: crossing
//! `server_down_max_fails` inside `server_down_throttle_time` benches the
//! server for that same duration. Root servers are registered at priming
//! time and never benched, whatever their failure count: they are the
//! fixed point resolution restarts from.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::ThrottleConfig;

/// How long a NOEDNS verdict sticks before the server is probed again
const EDNS_STATUS_LIFETIME: Duration = Duration::from_secs(3_600);

/// EWMA blend factor: weight of the newest sample
const SPEED_BLEND: f64 = 0.3;

/// Key of one throttle entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThrottleKey {
    /// The benched server
    pub server: IpAddr,
    /// A specific question, or `None` for a server-wide bench
    pub question: Option<(String, u16)>,
}

#[derive(Debug, Clone)]
struct ThrottleEntry {
    until: Instant,
    reason: String,
}

#[derive(Debug, Clone, Copy, Default)]
struct SpeedEntry {
    ewma_usec: f64,
    samples: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct FailWindow {
    count: u32,
    window_start: Option<Instant>,
}

/// What we know about a server's EDNS support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EdnsMode {
    /// Never probed (or the verdict aged out): send OPT
    #[default]
    Unknown,
    /// Answered an EDNS query properly
    EdnsOk,
    /// FORMERR/NOTIMP'd an EDNS probe: skip OPT until re-probe time
    NoEdns,
}

#[derive(Debug, Clone, Copy)]
struct EdnsEntry {
    mode: EdnsMode,
    set_at: Instant,
}

/// The shared per-server state
#[derive(Debug)]
pub struct ServerState {
    throttle: DashMap<ThrottleKey, ThrottleEntry>,
    speeds: DashMap<IpAddr, SpeedEntry>,
    fails: DashMap<IpAddr, FailWindow>,
    edns: DashMap<IpAddr, EdnsEntry>,
    roots: RwLock<HashSet<IpAddr>>,
    config: ThrottleConfig,
}

impl ServerState {
    /// Create empty state under the given throttle policy
    #[must_use]
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            throttle: DashMap::new(),
            speeds: DashMap::new(),
            fails: DashMap::new(),
            edns: DashMap::new(),
            roots: RwLock::new(HashSet::new()),
            config,
        }
    }

    /// Register the root server addresses; they are exempt from benching
    pub fn set_roots(&self, roots: impl IntoIterator<Item = IpAddr>) {
        let mut set = self.roots.write();
        set.clear();
        set.extend(roots);
    }

    /// Whether `server` is a registered root
    #[must_use]
    pub fn is_root(&self, server: IpAddr) -> bool {
        self.roots.read().contains(&server)
    }

    // ========================================================================
    // Throttling
    // ========================================================================

    /// Whether `server` is benched for `(qname, qtype)` at `now`
    #[must_use]
    pub fn is_throttled(&self, server: IpAddr, qname: &str, qtype: u16, now: Instant) -> bool {
        self.throttle_live(
            &ThrottleKey {
                server,
                question: None,
            },
            now,
        ) || self.throttle_live(
            &ThrottleKey {
                server,
                question: Some((qname.to_string(), qtype)),
            },
            now,
        )
    }

    /// Check one throttle entry, dropping it when expired
    fn throttle_live(&self, key: &ThrottleKey, now: Instant) -> bool {
        // the guard must be released before the expired-entry removal
        let status = self.throttle.get(key).map(|entry| entry.until > now);
        match status {
            Some(true) => true,
            Some(false) => {
                self.throttle.remove(key);
                false
            }
            None => false,
        }
    }

    /// Bench `server` for one specific question
    pub fn throttle_question(
        &self,
        server: IpAddr,
        qname: &str,
        qtype: u16,
        duration: Duration,
        reason: &str,
        now: Instant,
    ) {
        if self.is_root(server) {
            return;
        }
        self.throttle.insert(
            ThrottleKey {
                server,
                question: Some((qname.to_string(), qtype)),
            },
            ThrottleEntry {
                until: now + duration,
                reason: reason.to_string(),
            },
        );
        debug!(server = %server, qname, qtype, reason, "throttled for question");
    }

    /// Record a failed exchange; benches the server when the window fills
    ///
    /// Returns whether the server is now benched.
    pub fn record_failure(&self, server: IpAddr, now: Instant) -> bool {
        if self.is_root(server) {
            // the fixed point: failures are counted nowhere and roots are
            // never marked down
            return false;
        }

        let window = self.config.throttle_duration();
        let mut entry = self.fails.entry(server).or_default();
        match entry.window_start {
            Some(start) if now.saturating_duration_since(start) <= window => {
                entry.count += 1;
            }
            _ => {
                entry.window_start = Some(now);
                entry.count = 1;
            }
        }

        if entry.count >= self.config.server_down_max_fails {
            entry.count = 0;
            entry.window_start = None;
            drop(entry);
            self.throttle.insert(
                ThrottleKey {
                    server,
                    question: None,
                },
                ThrottleEntry {
                    until: now + window,
                    reason: "too many failures".to_string(),
                },
            );
            info!(server = %server, window = ?window, "server marked down");
            true
        } else {
            false
        }
    }

    /// Record a successful exchange and fold its RTT into the EWMA
    pub fn record_success(&self, server: IpAddr, rtt: Duration) {
        let usec = rtt.as_micros().min(u128::from(u64::MAX)) as f64;
        let mut entry = self.speeds.entry(server).or_default();
        if entry.samples == 0 {
            entry.ewma_usec = usec;
        } else {
            entry.ewma_usec = entry.ewma_usec * (1.0 - SPEED_BLEND) + usec * SPEED_BLEND;
        }
        entry.samples += 1;
        self.fails.remove(&server);
    }

    /// Order candidate servers fastest-first
    ///
    /// Servers never measured sort ahead of measured ones so new servers
    /// get explored.
    #[must_use]
    pub fn rank(&self, mut servers: Vec<IpAddr>) -> Vec<IpAddr> {
        servers.sort_by_key(|server| {
            self.speeds
                .get(server)
                .map_or(0u64, |entry| entry.ewma_usec as u64 + 1)
        });
        servers
    }

    /// The measured EWMA for a server, if any
    #[must_use]
    pub fn speed_usec(&self, server: IpAddr) -> Option<f64> {
        self.speeds.get(&server).map(|entry| entry.ewma_usec)
    }

    // ========================================================================
    // EDNS memory
    // ========================================================================

    /// What we currently believe about `server`'s EDNS support
    #[must_use]
    pub fn edns_mode(&self, server: IpAddr, now: Instant) -> EdnsMode {
        // the guard must be released before the aged-entry removal
        let status = self.edns.get(&server).map(|entry| {
            (
                entry.mode,
                now.saturating_duration_since(entry.set_at) < EDNS_STATUS_LIFETIME,
            )
        });
        match status {
            Some((mode, true)) => mode,
            Some((_, false)) => {
                self.edns.remove(&server);
                EdnsMode::Unknown
            }
            None => EdnsMode::Unknown,
        }
    }

    /// Record an EDNS verdict for `server`
    pub fn set_edns_mode(&self, server: IpAddr, mode: EdnsMode, now: Instant) {
        self.edns.insert(server, EdnsEntry { mode, set_at: now });
    }

    /// A throttle entry's reason, for diagnostics
    #[must_use]
    pub fn throttle_reason(&self, server: IpAddr) -> Option<String> {
        self.throttle
            .get(&ThrottleKey {
                server,
                question: None,
            })
            .map(|entry| entry.reason.clone())
    }
}
