//! Process-wide resolver statistics
//!
//! Counters that cross component boundaries live here; component-local
//! counters (cache hit rates, per-listener packet counts) stay with their
//! component. Everything is a relaxed atomic so the hot path never locks.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global resolution statistics
///
/// # Example
///
/// ```
/// use rust_recursor::stats::ResolverStats;
///
/// let stats = ResolverStats::new();
/// stats.record_outquery();
/// assert_eq!(stats.snapshot().outqueries, 1);
/// ```
#[derive(Debug, Default)]
pub struct ResolverStats {
    /// Client queries answered, by outcome
    no_errors: AtomicU64,
    nx_domains: AtomicU64,
    servfails: AtomicU64,
    /// Outgoing queries sent
    outqueries: AtomicU64,
    /// Outgoing queries that went over TCP
    tcp_outqueries: AtomicU64,
    /// Queries answered by piggy-backing on an identical in-flight query
    chain_resends: AtomicU64,
    /// Replies that matched no outstanding query at all
    unexpected_replies: AtomicU64,
    /// Pending queries aborted because near misses crossed the threshold
    spoof_aborts: AtomicU64,
    /// Queries dropped because a worker was at its task limit
    overload_drops: AtomicU64,
    /// Queries dropped by the ingress ACL
    policy_drops: AtomicU64,
    /// Upstream replies that failed to parse
    server_parse_errors: AtomicU64,
    /// Outgoing-query budget exhaustions
    qperq_limits: AtomicU64,
    /// Answers served from the packet cache
    packetcache_hits: AtomicU64,
    /// Root re-priming rounds completed
    root_refreshes: AtomicU64,
}

impl ResolverStats {
    /// Create a zeroed statistics block
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a client answer by its RCODE
    pub fn record_answer(&self, rcode: u16) {
        match rcode {
            0 => self.no_errors.fetch_add(1, Ordering::Relaxed),
            3 => self.nx_domains.fetch_add(1, Ordering::Relaxed),
            2 => self.servfails.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    /// Count an outgoing query
    pub fn record_outquery(&self) {
        self.outqueries.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an outgoing TCP fallback
    pub fn record_tcp_outquery(&self) {
        self.tcp_outqueries.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a chained resend (one network reply fanned out to a waiter)
    pub fn record_chain_resend(&self) {
        self.chain_resends.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a reply with no matching waiter
    pub fn record_unexpected(&self) {
        self.unexpected_replies.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a spoof-triggered abort
    pub fn record_spoof_abort(&self) {
        self.spoof_aborts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an overload drop
    pub fn record_overload_drop(&self) {
        self.overload_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an ACL drop
    pub fn record_policy_drop(&self) {
        self.policy_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an unparseable upstream reply
    pub fn record_server_parse_error(&self) {
        self.server_parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an exhausted outgoing-query budget
    pub fn record_qperq_limit(&self) {
        self.qperq_limits.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a packet-cache hit
    pub fn record_packetcache_hit(&self) {
        self.packetcache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a root re-priming round
    pub fn record_root_refresh(&self) {
        self.root_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent-enough snapshot for reporting
    #[must_use]
    pub fn snapshot(&self) -> ResolverStatsSnapshot {
        ResolverStatsSnapshot {
            no_errors: self.no_errors.load(Ordering::Relaxed),
            nx_domains: self.nx_domains.load(Ordering::Relaxed),
            servfails: self.servfails.load(Ordering::Relaxed),
            outqueries: self.outqueries.load(Ordering::Relaxed),
            tcp_outqueries: self.tcp_outqueries.load(Ordering::Relaxed),
            chain_resends: self.chain_resends.load(Ordering::Relaxed),
            unexpected_replies: self.unexpected_replies.load(Ordering::Relaxed),
            spoof_aborts: self.spoof_aborts.load(Ordering::Relaxed),
            overload_drops: self.overload_drops.load(Ordering::Relaxed),
            policy_drops: self.policy_drops.load(Ordering::Relaxed),
            server_parse_errors: self.server_parse_errors.load(Ordering::Relaxed),
            qperq_limits: self.qperq_limits.load(Ordering::Relaxed),
            packetcache_hits: self.packetcache_hits.load(Ordering::Relaxed),
            root_refreshes: self.root_refreshes.load(Ordering::Relaxed),
        }
    }
}

/// Plain snapshot of [`ResolverStats`] for serialization and logging
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolverStatsSnapshot {
    pub no_errors: u64,
    pub nx_domains: u64,
    pub servfails: u64,
    pub outqueries: u64,
    pub tcp_outqueries: u64,
    pub chain_resends: u64,
    pub unexpected_replies: u64,
    pub spoof_aborts: u64,
    pub overload_drops: u64,
    pub policy_drops: u64,
    pub server_parse_errors: u64,
    pub qperq_limits: u64,
    pub packetcache_hits: u64,
    pub root_refreshes: u64,
}

impl ResolverStatsSnapshot {
    /// Total answered client queries
    #[must_use]
    pub fn total_answers(&self) -> u64 {
        self.no_errors + self.nx_domains + self.servfails
    }
}
