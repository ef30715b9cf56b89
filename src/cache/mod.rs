//! Resolver caches
//!
//! Three caches front the resolution engine:
//!
//! - [`record::RecordCache`]: structured RRsets keyed by `(name, type)`,
//!   with ECS-scope variants and validation states;
//! - [`negative::NegativeCache`]: proofs of non-existence with
//!   SOA-derived TTLs;
//! - [`packet::PacketCache`]: whole serialized responses keyed by a query
//!   fingerprint, for the cheap hit path in the server loop.
//!
//! [`ResolverCaches`] bundles the first two and enforces the coupling law
//! between them: a positive insert disproves (and evicts) the matching
//! negative entries, and a negative insert is refused while a live
//! positive entry exists.

pub mod key;
pub mod negative;
pub mod packet;
pub mod record;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub use key::{canonical_name, canonical_str, RrKey, QTYPE_ANY};
pub use negative::{classify_negative, negative_ttl, soa_minimum, NegativeCache, NegativeEntry, NegativeKind};
pub use packet::{PacketCache, PacketCacheKey};
pub use record::{CachedRrset, RecordCache, RrsetInsert};

use crate::config::Config;
use crate::resolver::validate::ValidationState;

/// Shared cache statistics
///
/// All counters are relaxed atomics; readers take a [`CacheStatsSnapshot`].
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl CacheStats {
    /// Create zeroed statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hit
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a miss
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an insertion
    pub fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a capacity or coupling eviction
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a TTL expiration
    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    /// Hit count
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Miss count
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Insert count
    #[must_use]
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    /// Hit rate as a percentage
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }

    /// Snapshot all counters
    #[must_use]
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Plain snapshot of [`CacheStats`]
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// The record and negative caches, coupled
///
/// # Example
///
/// ```
/// use rust_recursor::cache::ResolverCaches;
/// use rust_recursor::config::Config;
///
/// let caches = ResolverCaches::new(&Config::default());
/// assert!(caches.records.is_empty());
/// ```
#[derive(Debug)]
pub struct ResolverCaches {
    /// The record cache
    pub records: RecordCache,
    /// The negative cache
    pub negative: NegativeCache,
}

impl ResolverCaches {
    /// Build both caches from configuration
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            records: RecordCache::new(config.cache.clone()),
            negative: NegativeCache::new(config.cache.negative.clone()),
        }
    }

    /// Store a positive RRset, evicting whatever negatives it disproves
    pub fn store_positive(&self, qname: &str, rtype: u16, insert: RrsetInsert, now: Instant) {
        self.negative.evict_for(qname, rtype);
        self.records.insert(qname, rtype, insert, now);
    }

    /// Store a proof of non-existence, unless a live positive entry
    /// contradicts it
    ///
    /// Returns whether the proof was stored.
    pub fn store_negative(
        &self,
        qname: &str,
        qtype: Option<u16>,
        kind: NegativeKind,
        soa: Option<hickory_proto::rr::Record>,
        state: ValidationState,
        now: Instant,
    ) -> bool {
        if let Some(rtype) = qtype {
            if self.records.has_live(qname, rtype, now) {
                return false;
            }
        }
        self.negative.insert(qname, qtype, kind, soa, state, now);
        true
    }

    /// Run one maintenance round over both caches
    pub fn prune(&self, now: Instant) {
        self.records.prune(now);
        let budget = self.records.len() / 10 + 32;
        self.negative.prune(budget, now);
    }

    /// Wipe one name (or subtree) from both caches
    pub fn wipe(&self, qname: &str, subtree: bool) -> usize {
        self.records.wipe(qname, subtree) + self.negative.wipe(qname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
    use std::str::FromStr;

    fn a_record(owner: &str) -> Record {
        let mut record = Record::new();
        record.set_name(Name::from_str(owner).unwrap());
        record.set_record_type(RecordType::A);
        record.set_dns_class(DNSClass::IN);
        record.set_ttl(60);
        record.set_data(Some(RData::A(A(std::net::Ipv4Addr::new(192, 0, 2, 1)))));
        record
    }

    #[test]
    fn test_stats_hit_rate() {
        let stats = CacheStats::new();
        assert!((stats.hit_rate() - 0.0).abs() < f64::EPSILON);
        stats.record_hit();
        stats.record_miss();
        assert!((stats.hit_rate() - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_positive_insert_evicts_negative() {
        let caches = ResolverCaches::new(&Config::default());
        let t0 = Instant::now();

        caches.negative.insert(
            "www.example.com.",
            Some(1),
            NegativeKind::NoData,
            None,
            ValidationState::Indeterminate,
            t0,
        );
        assert!(caches.negative.lookup("www.example.com.", 1, t0).is_some());

        caches.store_positive(
            "www.example.com.",
            1,
            RrsetInsert::auth(vec![a_record("www.example.com.")], 60),
            t0,
        );

        assert!(caches.negative.lookup("www.example.com.", 1, t0).is_none());
        assert!(caches.records.lookup("www.example.com.", 1, None, t0).is_some());
    }

    #[test]
    fn test_negative_rejected_while_positive_live() {
        let caches = ResolverCaches::new(&Config::default());
        let t0 = Instant::now();

        caches.store_positive(
            "www.example.com.",
            1,
            RrsetInsert::auth(vec![a_record("www.example.com.")], 60),
            t0,
        );

        let stored = caches.store_negative(
            "www.example.com.",
            Some(1),
            NegativeKind::NoData,
            None,
            ValidationState::Indeterminate,
            t0,
        );
        assert!(!stored);
        assert!(caches.negative.lookup("www.example.com.", 1, t0).is_none());
    }

    #[test]
    fn test_negative_accepted_after_positive_expired() {
        let caches = ResolverCaches::new(&Config::default());
        let t0 = Instant::now();

        caches.store_positive(
            "www.example.com.",
            1,
            RrsetInsert::auth(vec![a_record("www.example.com.")], 60),
            t0,
        );

        let later = t0 + std::time::Duration::from_secs(61);
        let stored = caches.store_negative(
            "www.example.com.",
            Some(1),
            NegativeKind::NoData,
            None,
            ValidationState::Indeterminate,
            later,
        );
        assert!(stored);
    }
}
