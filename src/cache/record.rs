//! The record cache
//!
//! A sharded map of `(name, type)` to RRset variants with the cache
//! discipline the resolver depends on:
//!
//! - insertion with a fresher RRset replaces, equal-or-staler is ignored,
//!   and authoritative data is never displaced by additional-section data;
//! - a lookup that finds only expired variants reports a miss and evicts
//!   them on the spot; a periodic [`RecordCache::prune`] does the same in
//!   bulk, with a full sweep every 40th round;
//! - when the resolver forwarded ECS, the variant is keyed by the *scope*
//!   the authority returned, and a lookup only hits when the client falls
//!   inside that scope;
//! - capacity overruns evict least-recently-used variants.
//!
//! All operations take an explicit `now` so the TTL arithmetic is exact
//! and testable.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use hickory_proto::rr::Record;
use ipnet::IpNet;
use tracing::debug;

use crate::cache::key::{canonical_str, is_part_of};
use crate::cache::CacheStats;
use crate::config::CacheConfig;
use crate::resolver::validate::ValidationState;

/// Every Nth prune round walks the whole cache instead of a sample
const FULL_SWEEP_INTERVAL: u64 = 40;

/// One cached RRset variant
///
/// A `(name, type)` key can hold several variants when ECS is in play:
/// one generic variant plus one per scope returned by the authority.
#[derive(Debug, Clone)]
pub struct CachedRrset {
    /// The records, carrying their original TTLs
    pub records: Vec<Record>,
    /// RRSIGs covering the set
    pub sigs: Vec<Record>,
    /// Absolute expiry
    pub valid_until: Instant,
    /// The TTL the set was stored with, after clamping
    pub orig_ttl: u32,
    /// Whether the set came from an authoritative answer section
    pub auth: bool,
    /// DNSSEC validation state
    pub state: ValidationState,
    /// ECS scope this variant answers for; `None` is the generic variant
    pub scope: Option<IpNet>,
    /// Refreshed on every hit, drives LRU eviction
    last_used: Instant,
}

impl CachedRrset {
    /// Seconds of validity left at `now`; 0 once expired
    #[must_use]
    pub fn remaining_ttl(&self, now: Instant) -> u32 {
        self.valid_until
            .saturating_duration_since(now)
            .as_secs()
            .min(u64::from(u32::MAX)) as u32
    }

    /// Whether the variant is expired at `now` (`now >= expiry` is absent)
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.valid_until
    }

    /// Whether this variant answers for `client`
    #[must_use]
    pub fn matches_client(&self, client: Option<IpAddr>) -> bool {
        match (&self.scope, client) {
            (None, _) => true,
            (Some(scope), Some(addr)) => scope.contains(&addr),
            (Some(_), None) => false,
        }
    }

    /// Clone the records with TTLs decayed to the time left at `now`
    #[must_use]
    pub fn records_at(&self, now: Instant) -> Vec<Record> {
        let remaining = self.remaining_ttl(now);
        self.records
            .iter()
            .map(|r| {
                let mut record = r.clone();
                record.set_ttl(r.ttl().min(remaining));
                record
            })
            .collect()
    }
}

/// Everything needed to insert one RRset
#[derive(Debug, Clone)]
pub struct RrsetInsert {
    pub records: Vec<Record>,
    pub sigs: Vec<Record>,
    pub ttl: u32,
    pub auth: bool,
    pub state: ValidationState,
    pub scope: Option<IpNet>,
}

impl RrsetInsert {
    /// A plain authoritative set with no signatures or scope
    #[must_use]
    pub fn auth(records: Vec<Record>, ttl: u32) -> Self {
        Self {
            records,
            sigs: Vec::new(),
            ttl,
            auth: true,
            state: ValidationState::Indeterminate,
            scope: None,
        }
    }

    /// A glue/additional set
    #[must_use]
    pub fn additional(records: Vec<Record>, ttl: u32) -> Self {
        Self {
            auth: false,
            ..Self::auth(records, ttl)
        }
    }

    /// Attach an ECS scope
    #[must_use]
    pub fn with_scope(mut self, scope: IpNet) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Attach signatures
    #[must_use]
    pub fn with_sigs(mut self, sigs: Vec<Record>) -> Self {
        self.sigs = sigs;
        self
    }

    /// Set the validation state
    #[must_use]
    pub fn with_state(mut self, state: ValidationState) -> Self {
        self.state = state;
        self
    }
}

type VariantList = Vec<CachedRrset>;

/// The sharded record cache
pub struct RecordCache {
    /// name -> (type -> scope variants); dashmap supplies the per-shard
    /// locks the workers contend on
    map: DashMap<String, std::collections::HashMap<u16, VariantList>>,
    config: CacheConfig,
    stats: CacheStats,
    entries: AtomicUsize,
    prune_rounds: AtomicU64,
}

impl RecordCache {
    /// Create a cache with the given configuration
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            map: DashMap::new(),
            config,
            stats: CacheStats::new(),
            entries: AtomicUsize::new(0),
            prune_rounds: AtomicU64::new(0),
        }
    }

    /// Number of live RRset variants
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    /// Whether the cache holds nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache statistics
    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Look up `(name, type)` for `client` at `now`
    ///
    /// Expired variants found along the way are evicted. Among live
    /// variants the most specific matching scope wins; the generic
    /// variant is the fallback.
    #[must_use]
    pub fn lookup(
        &self,
        qname: &str,
        rtype: u16,
        client: Option<IpAddr>,
        now: Instant,
    ) -> Option<CachedRrset> {
        let key = canonical_str(qname);
        let mut bucket = match self.map.get_mut(&key) {
            Some(bucket) => bucket,
            None => {
                self.stats.record_miss();
                return None;
            }
        };

        let hit = {
            let Some(variants) = bucket.get_mut(&rtype) else {
                self.stats.record_miss();
                return None;
            };
            self.evict_expired(variants, now);

            let mut best: Option<&mut CachedRrset> = None;
            for variant in variants.iter_mut() {
                if !variant.matches_client(client) {
                    continue;
                }
                let better = match (&best, &variant.scope) {
                    (None, _) => true,
                    (Some(current), Some(scope)) => current
                        .scope
                        .map_or(true, |s| scope.prefix_len() > s.prefix_len()),
                    (Some(_), None) => false,
                };
                if better {
                    best = Some(variant);
                }
            }
            best.map(|variant| {
                variant.last_used = now;
                variant.clone()
            })
        };

        if bucket.get(&rtype).is_some_and(|v| v.is_empty()) {
            bucket.remove(&rtype);
        }
        let drop_name = bucket.is_empty();
        drop(bucket);
        if drop_name {
            self.map.remove_if(&key, |_, b| b.is_empty());
        }

        match hit {
            Some(found) => {
                self.stats.record_hit();
                Some(found)
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Everything cached under `name`, the ANY wildcard view
    #[must_use]
    pub fn lookup_any(&self, qname: &str, client: Option<IpAddr>, now: Instant) -> Vec<CachedRrset> {
        let key = canonical_str(qname);
        let mut out = Vec::new();
        if let Some(mut bucket) = self.map.get_mut(&key) {
            for variants in bucket.values_mut() {
                self.evict_expired(variants, now);
                if let Some(variant) = variants
                    .iter_mut()
                    .find(|v| v.matches_client(client))
                {
                    variant.last_used = now;
                    out.push(variant.clone());
                }
            }
        }
        if out.is_empty() {
            self.stats.record_miss();
        } else {
            self.stats.record_hit();
        }
        out
    }

    /// Insert an RRset, honoring fresher-wins and the auth barrier
    ///
    /// Returns whether the set was stored.
    pub fn insert(&self, qname: &str, rtype: u16, insert: RrsetInsert, now: Instant) -> bool {
        let key = canonical_str(qname);
        let ttl = self.config.clamp_ttl(insert.ttl);
        let fresh = CachedRrset {
            records: insert.records,
            sigs: insert.sigs,
            valid_until: now + Duration::from_secs(u64::from(ttl)),
            orig_ttl: ttl,
            auth: insert.auth,
            state: insert.state,
            scope: insert.scope,
            last_used: now,
        };

        let mut bucket = self.map.entry(key).or_default();
        let variants = bucket.entry(rtype).or_default();

        if let Some(existing) = variants.iter_mut().find(|v| v.scope == fresh.scope) {
            let replace = existing.is_expired(now)
                || (fresh.auth && !existing.auth)
                || (fresh.auth == existing.auth && fresh.valid_until > existing.valid_until);
            if !replace {
                return false;
            }
            *existing = fresh;
            return true;
        }

        variants.push(fresh);
        self.entries.fetch_add(1, Ordering::Relaxed);
        self.stats.record_insert();
        true
    }

    /// Whether a live (non-expired) entry exists for `(name, type)`
    #[must_use]
    pub fn has_live(&self, qname: &str, rtype: u16, now: Instant) -> bool {
        let key = canonical_str(qname);
        self.map.get(&key).is_some_and(|bucket| {
            bucket
                .get(&rtype)
                .is_some_and(|variants| variants.iter().any(|v| !v.is_expired(now)))
        })
    }

    /// Remove all entries for `name`, or its whole subtree
    ///
    /// Returns the number of variants removed.
    pub fn wipe(&self, qname: &str, subtree: bool) -> usize {
        let target = canonical_str(qname);
        let mut removed = 0usize;
        if subtree {
            let keys: Vec<String> = self
                .map
                .iter()
                .filter(|entry| is_part_of(entry.key(), &target))
                .map(|entry| entry.key().clone())
                .collect();
            for key in keys {
                if let Some((_, bucket)) = self.map.remove(&key) {
                    removed += bucket.values().map(Vec::len).sum::<usize>();
                }
            }
        } else if let Some((_, bucket)) = self.map.remove(&target) {
            removed = bucket.values().map(Vec::len).sum();
        }
        self.entries.fetch_sub(removed, Ordering::Relaxed);
        removed
    }

    /// Periodic maintenance: drop expired variants, then enforce capacity
    ///
    /// Regular rounds examine a sample of the cache; every
    /// [`FULL_SWEEP_INTERVAL`]th round walks everything, which also
    /// reclaims entries that are never looked up again.
    pub fn prune(&self, now: Instant) {
        let round = self.prune_rounds.fetch_add(1, Ordering::Relaxed) + 1;
        let full_sweep = round % FULL_SWEEP_INTERVAL == 0;
        let budget = if full_sweep {
            usize::MAX
        } else {
            self.len() / 10 + 100
        };

        let mut examined = 0usize;
        let mut empty_names = Vec::new();
        for mut entry in self.map.iter_mut() {
            if examined >= budget {
                break;
            }
            let bucket = entry.value_mut();
            bucket.retain(|_, variants| {
                examined += variants.len();
                self.evict_expired(variants, now);
                !variants.is_empty()
            });
            if bucket.is_empty() {
                empty_names.push(entry.key().clone());
            }
        }
        for name in empty_names {
            self.map.remove_if(&name, |_, bucket| bucket.is_empty());
        }

        self.enforce_capacity();
        if full_sweep {
            debug!(entries = self.len(), "record cache full sweep done");
        }
    }

    /// Evict least-recently-used variants while over capacity
    fn enforce_capacity(&self) {
        let over = self
            .len()
            .saturating_sub(self.config.max_cache_entries);
        if over == 0 {
            return;
        }

        // Oldest-used first; collecting (stamp, name, type, scope) triples
        // is O(n) but runs only from the prune path.
        let mut candidates: Vec<(Instant, String, u16, Option<IpNet>)> = self
            .map
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .flat_map(|(rtype, variants)| {
                        variants
                            .iter()
                            .map(|v| (v.last_used, entry.key().clone(), *rtype, v.scope))
                            .collect::<Vec<_>>()
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        candidates.sort_by_key(|(stamp, _, _, _)| *stamp);

        for (_, name, rtype, scope) in candidates.into_iter().take(over) {
            if let Some(mut bucket) = self.map.get_mut(&name) {
                if let Some(variants) = bucket.get_mut(&rtype) {
                    let before = variants.len();
                    variants.retain(|v| v.scope != scope);
                    let dropped = before - variants.len();
                    if dropped > 0 {
                        self.entries.fetch_sub(dropped, Ordering::Relaxed);
                        self.stats.record_eviction();
                    }
                    if variants.is_empty() {
                        bucket.remove(&rtype);
                    }
                }
            }
        }
    }

    /// Drop expired variants from a list, keeping the entry counter honest
    fn evict_expired(&self, variants: &mut VariantList, now: Instant) {
        let before = variants.len();
        variants.retain(|v| !v.is_expired(now));
        let dropped = before - variants.len();
        if dropped > 0 {
            self.entries.fetch_sub(dropped, Ordering::Relaxed);
            for _ in 0..dropped {
                self.stats.record_expiration();
            }
        }
    }
}

impl std::fmt::Debug for RecordCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCache")
            .field("entries", &self.len())
            .field("capacity", &self.config.max_cache_entries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
    use std::str::FromStr;

    // ========================================================================
    // Helper Functions
    // ========================================================================

    fn a_record(owner: &str, last: u8, ttl: u32) -> Record {
        let mut record = Record::new();
        record.set_name(Name::from_str(owner).unwrap());
        record.set_record_type(RecordType::A);
        record.set_dns_class(DNSClass::IN);
        record.set_ttl(ttl);
        record.set_data(Some(RData::A(A(std::net::Ipv4Addr::new(192, 0, 2, last)))));
        record
    }

    fn cache() -> RecordCache {
        RecordCache::new(CacheConfig::default())
    }

    fn small_cache(max: usize) -> RecordCache {
        RecordCache::new(CacheConfig::default().with_max_entries(max))
    }

    // ========================================================================
    // TTL Invariant
    // ========================================================================

    #[test]
    fn test_lookup_within_ttl_hits_after_ttl_misses() {
        let cache = cache();
        let t0 = Instant::now();
        cache.insert(
            "www.example.com.",
            1,
            RrsetInsert::auth(vec![a_record("www.example.com.", 1, 60)], 60),
            t0,
        );

        assert!(cache
            .lookup("www.example.com.", 1, None, t0 + Duration::from_secs(59))
            .is_some());
        assert!(cache
            .lookup("www.example.com.", 1, None, t0 + Duration::from_secs(60))
            .is_none());
        // the expired variant was evicted as a side effect
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remaining_ttl_decays() {
        let cache = cache();
        let t0 = Instant::now();
        cache.insert(
            "www.example.com.",
            1,
            RrsetInsert::auth(vec![a_record("www.example.com.", 1, 300)], 300),
            t0,
        );

        let hit = cache
            .lookup("www.example.com.", 1, None, t0 + Duration::from_secs(100))
            .unwrap();
        assert_eq!(hit.remaining_ttl(t0 + Duration::from_secs(100)), 200);

        let records = hit.records_at(t0 + Duration::from_secs(100));
        assert_eq!(records[0].ttl(), 200);
    }

    #[test]
    fn test_ttl_clamped_to_ceiling() {
        let config = CacheConfig {
            max_cache_ttl: 100,
            ..CacheConfig::default()
        };
        let cache = RecordCache::new(config);
        let t0 = Instant::now();
        cache.insert(
            "www.example.com.",
            1,
            RrsetInsert::auth(vec![a_record("www.example.com.", 1, 86_400)], 86_400),
            t0,
        );

        let hit = cache.lookup("www.example.com.", 1, None, t0).unwrap();
        assert_eq!(hit.orig_ttl, 100);
    }

    // ========================================================================
    // Insert Semantics
    // ========================================================================

    #[test]
    fn test_idempotent_insert() {
        let cache = cache();
        let t0 = Instant::now();
        let set = RrsetInsert::auth(vec![a_record("www.example.com.", 1, 60)], 60);

        assert!(cache.insert("www.example.com.", 1, set.clone(), t0));
        // same freshness: ignored, cache state unchanged
        assert!(!cache.insert("www.example.com.", 1, set, t0));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_fresher_replaces_staler_ignored() {
        let cache = cache();
        let t0 = Instant::now();
        cache.insert(
            "www.example.com.",
            1,
            RrsetInsert::auth(vec![a_record("www.example.com.", 1, 60)], 60),
            t0,
        );

        // fresher (longer expiry) replaces
        assert!(cache.insert(
            "www.example.com.",
            1,
            RrsetInsert::auth(vec![a_record("www.example.com.", 2, 120)], 120),
            t0,
        ));
        let hit = cache.lookup("www.example.com.", 1, None, t0).unwrap();
        assert_eq!(hit.orig_ttl, 120);

        // staler is ignored
        assert!(!cache.insert(
            "www.example.com.",
            1,
            RrsetInsert::auth(vec![a_record("www.example.com.", 3, 10)], 10),
            t0,
        ));
    }

    #[test]
    fn test_additional_never_displaces_auth() {
        let cache = cache();
        let t0 = Instant::now();
        cache.insert(
            "ns1.example.com.",
            1,
            RrsetInsert::auth(vec![a_record("ns1.example.com.", 1, 60)], 60),
            t0,
        );

        assert!(!cache.insert(
            "ns1.example.com.",
            1,
            RrsetInsert::additional(vec![a_record("ns1.example.com.", 9, 600)], 600),
            t0,
        ));
        let hit = cache.lookup("ns1.example.com.", 1, None, t0).unwrap();
        assert!(hit.auth);
        assert_eq!(hit.orig_ttl, 60);
    }

    #[test]
    fn test_auth_displaces_additional() {
        let cache = cache();
        let t0 = Instant::now();
        cache.insert(
            "ns1.example.com.",
            1,
            RrsetInsert::additional(vec![a_record("ns1.example.com.", 1, 600)], 600),
            t0,
        );

        assert!(cache.insert(
            "ns1.example.com.",
            1,
            RrsetInsert::auth(vec![a_record("ns1.example.com.", 2, 60)], 60),
            t0,
        ));
        assert!(cache.lookup("ns1.example.com.", 1, None, t0).unwrap().auth);
    }

    // ========================================================================
    // ECS Scopes
    // ========================================================================

    #[test]
    fn test_scoped_lookup_requires_containment() {
        let cache = cache();
        let t0 = Instant::now();
        let scope: IpNet = "192.0.2.0/24".parse().unwrap();
        cache.insert(
            "geo.example.com.",
            1,
            RrsetInsert::auth(vec![a_record("geo.example.com.", 1, 60)], 60).with_scope(scope),
            t0,
        );

        let inside: IpAddr = "192.0.2.99".parse().unwrap();
        let outside: IpAddr = "203.0.113.1".parse().unwrap();
        assert!(cache.lookup("geo.example.com.", 1, Some(inside), t0).is_some());
        assert!(cache.lookup("geo.example.com.", 1, Some(outside), t0).is_none());
        // no client context never matches a scoped variant
        assert!(cache.lookup("geo.example.com.", 1, None, t0).is_none());
    }

    #[test]
    fn test_most_specific_scope_wins() {
        let cache = cache();
        let t0 = Instant::now();
        cache.insert(
            "geo.example.com.",
            1,
            RrsetInsert::auth(vec![a_record("geo.example.com.", 1, 60)], 60)
                .with_scope("192.0.0.0/16".parse().unwrap()),
            t0,
        );
        cache.insert(
            "geo.example.com.",
            1,
            RrsetInsert::auth(vec![a_record("geo.example.com.", 2, 60)], 60)
                .with_scope("192.0.2.0/24".parse().unwrap()),
            t0,
        );

        let client: IpAddr = "192.0.2.50".parse().unwrap();
        let hit = cache.lookup("geo.example.com.", 1, Some(client), t0).unwrap();
        assert_eq!(hit.scope.unwrap().prefix_len(), 24);
    }

    // ========================================================================
    // ANY Wildcard
    // ========================================================================

    #[test]
    fn test_lookup_any_returns_all_types() {
        let cache = cache();
        let t0 = Instant::now();
        cache.insert(
            "multi.example.com.",
            1,
            RrsetInsert::auth(vec![a_record("multi.example.com.", 1, 60)], 60),
            t0,
        );
        cache.insert(
            "multi.example.com.",
            28,
            RrsetInsert::auth(vec![a_record("multi.example.com.", 2, 60)], 60),
            t0,
        );

        let all = cache.lookup_any("multi.example.com.", None, t0);
        assert_eq!(all.len(), 2);
    }

    // ========================================================================
    // Wipe and Prune
    // ========================================================================

    #[test]
    fn test_wipe_exact_and_subtree() {
        let cache = cache();
        let t0 = Instant::now();
        for owner in ["example.com.", "www.example.com.", "mail.example.com."] {
            cache.insert(
                owner,
                1,
                RrsetInsert::auth(vec![a_record(owner, 1, 60)], 60),
                t0,
            );
        }

        assert_eq!(cache.wipe("www.example.com.", false), 1);
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.wipe("example.com.", true), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_prune_drops_expired() {
        let cache = cache();
        let t0 = Instant::now();
        cache.insert(
            "short.example.com.",
            1,
            RrsetInsert::auth(vec![a_record("short.example.com.", 1, 5)], 5),
            t0,
        );
        cache.insert(
            "long.example.com.",
            1,
            RrsetInsert::auth(vec![a_record("long.example.com.", 1, 600)], 600),
            t0,
        );

        // a full sweep is guaranteed after FULL_SWEEP_INTERVAL rounds
        for _ in 0..FULL_SWEEP_INTERVAL {
            cache.prune(t0 + Duration::from_secs(10));
        }
        assert_eq!(cache.len(), 1);
        assert!(cache
            .lookup("long.example.com.", 1, None, t0 + Duration::from_secs(10))
            .is_some());
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let cache = small_cache(2);
        let t0 = Instant::now();
        for (i, owner) in ["a.test.", "b.test.", "c.test."].iter().enumerate() {
            cache.insert(
                owner,
                1,
                RrsetInsert::auth(vec![a_record(owner, 1, 600)], 600),
                t0 + Duration::from_secs(i as u64),
            );
        }
        // touch "a.test." so "b.test." becomes the oldest-used
        cache.lookup("a.test.", 1, None, t0 + Duration::from_secs(10));

        cache.prune(t0 + Duration::from_secs(11));
        assert!(cache.len() <= 2);
        assert!(cache
            .lookup("a.test.", 1, None, t0 + Duration::from_secs(12))
            .is_some());
        assert!(cache
            .lookup("b.test.", 1, None, t0 + Duration::from_secs(12))
            .is_none());
    }

    #[test]
    fn test_has_live() {
        let cache = cache();
        let t0 = Instant::now();
        cache.insert(
            "www.example.com.",
            1,
            RrsetInsert::auth(vec![a_record("www.example.com.", 1, 60)], 60),
            t0,
        );
        assert!(cache.has_live("www.example.com.", 1, t0));
        assert!(!cache.has_live("www.example.com.", 1, t0 + Duration::from_secs(61)));
        assert!(!cache.has_live("other.example.com.", 1, t0));
    }
}
