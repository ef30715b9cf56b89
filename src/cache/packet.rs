//! The packet cache
//!
//! Whole serialized responses keyed by a query fingerprint: policy tag,
//! canonical qname, qtype, qclass, and the client's ECS source network
//! when one was used. This is the cheap hit path the server loop tries
//! before spawning a resolution task.
//!
//! On a hit the stored response is replayed with its TTLs aged by the time
//! since insertion and the transaction id rewritten to the new query's.
//! An entry whose aged TTL reaches zero is evicted instead of served.
//!
//! Responses marked *variable* (client-specific contents) are never
//! inserted; SERVFAIL responses are held only for
//! `packetcache_servfail_ttl`, which set to zero disables SERVFAIL
//! caching entirely.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use ipnet::IpNet;
use moka::sync::Cache;
use moka::Expiry;

use crate::cache::key::canonical_str;
use crate::cache::CacheStats;
use crate::config::PacketCacheConfig;

/// Fingerprint of a client query
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PacketCacheKey {
    /// Policy tag assigned at ingress (0 when untagged)
    pub tag: u32,
    /// Canonical qname
    pub qname: String,
    /// Query type
    pub qtype: u16,
    /// Query class
    pub qclass: u16,
    /// ECS source network the answer was resolved under, if any
    pub ecs: Option<IpNet>,
}

impl PacketCacheKey {
    /// Create a fingerprint
    #[must_use]
    pub fn new(tag: u32, qname: &str, qtype: u16, qclass: u16, ecs: Option<IpNet>) -> Self {
        Self {
            tag,
            qname: canonical_str(qname),
            qtype,
            qclass,
            ecs,
        }
    }
}

/// One cached response
#[derive(Debug, Clone)]
struct PacketEntry {
    /// Serialized response, id field as stored
    response: Vec<u8>,
    /// When the entry was created
    inserted_at: Instant,
    /// Seconds the entry may be replayed
    ttl: u32,
}

impl PacketEntry {
    fn age(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.inserted_at).as_secs()
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.age(now) >= u64::from(self.ttl)
    }
}

/// Per-entry TTL for moka's bookkeeping; the authoritative expiry check
/// happens in [`PacketCache::lookup`] against the caller's clock.
struct PacketEntryExpiry;

impl Expiry<PacketCacheKey, PacketEntry> for PacketEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &PacketCacheKey,
        value: &PacketEntry,
        _current_time: Instant,
    ) -> Option<Duration> {
        Some(Duration::from_secs(u64::from(value.ttl)))
    }
}

/// The packet cache
pub struct PacketCache {
    cache: Cache<PacketCacheKey, PacketEntry>,
    config: PacketCacheConfig,
    stats: Arc<CacheStats>,
}

impl PacketCache {
    /// Create a packet cache
    #[must_use]
    pub fn new(config: PacketCacheConfig) -> Self {
        let stats = Arc::new(CacheStats::new());
        let stats_for_listener = Arc::clone(&stats);
        let cache = Cache::builder()
            .max_capacity(config.max_packetcache_entries as u64)
            .expire_after(PacketEntryExpiry)
            .eviction_listener(move |_key, _value, cause| {
                use moka::notification::RemovalCause;
                match cause {
                    RemovalCause::Size => stats_for_listener.record_eviction(),
                    RemovalCause::Expired => stats_for_listener.record_expiration(),
                    RemovalCause::Explicit | RemovalCause::Replaced => {}
                }
            })
            .build();
        Self {
            cache,
            config,
            stats,
        }
    }

    /// Whether the cache is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Cache statistics
    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Approximate number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.entry_count() as usize
    }

    /// Whether the cache is (approximately) empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a fingerprint, replaying the response for `query_id`
    ///
    /// The replayed bytes are identical to the stored response except for
    /// the transaction id and the TTLs, which are aged by the time since
    /// insertion.
    #[must_use]
    pub fn lookup(&self, key: &PacketCacheKey, query_id: u16, now: Instant) -> Option<Vec<u8>> {
        if !self.config.enabled {
            return None;
        }
        let entry = match self.cache.get(key) {
            Some(entry) => entry,
            None => {
                self.stats.record_miss();
                return None;
            }
        };
        if entry.is_expired(now) {
            self.cache.invalidate(key);
            self.stats.record_miss();
            return None;
        }

        let aged = Self::replay(&entry, query_id, now);
        if aged.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        aged
    }

    /// Insert a response under its fingerprint
    ///
    /// `variable` responses and disabled caches skip insertion; SERVFAIL
    /// responses use the dedicated (possibly zero) TTL.
    pub fn insert(&self, key: PacketCacheKey, response: &Message, variable: bool, now: Instant) {
        if !self.config.enabled || variable {
            return;
        }

        let rcode: u16 = response.response_code().into();
        let ttl = if rcode == 2 {
            if self.config.packetcache_servfail_ttl == 0 {
                return;
            }
            self.config.packetcache_servfail_ttl
        } else {
            let min_record_ttl = response
                .answers()
                .iter()
                .chain(response.name_servers())
                .map(hickory_proto::rr::Record::ttl)
                .min()
                .unwrap_or(self.config.packetcache_ttl);
            min_record_ttl.min(self.config.packetcache_ttl)
        };
        if ttl == 0 {
            return;
        }

        let Ok(bytes) = response.to_vec() else {
            return;
        };
        self.cache.insert(
            key,
            PacketEntry {
                response: bytes,
                inserted_at: now,
                ttl,
            },
        );
        self.stats.record_insert();
    }

    /// Drop every cached response
    pub fn wipe_all(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }

    /// Drop cached responses for one name
    pub fn wipe_name(&self, qname: &str) -> usize {
        let target = canonical_str(qname);
        let keys: Vec<PacketCacheKey> = self
            .cache
            .iter()
            .filter(|(key, _)| key.qname == target)
            .map(|(key, _)| (*key).clone())
            .collect();
        let count = keys.len();
        for key in keys {
            self.cache.invalidate(&key);
        }
        self.cache.run_pending_tasks();
        count
    }

    /// Run pending moka maintenance
    pub fn run_maintenance(&self) {
        self.cache.run_pending_tasks();
    }

    /// Rewrite id and TTLs of a stored response
    fn replay(entry: &PacketEntry, query_id: u16, now: Instant) -> Option<Vec<u8>> {
        let mut message = Message::from_vec(&entry.response).ok()?;
        message.set_id(query_id);

        let age = u32::try_from(entry.age(now)).unwrap_or(u32::MAX);
        if age > 0 {
            for mut record in message.take_answers() {
                record.set_ttl(record.ttl().saturating_sub(age));
                message.add_answer(record);
            }
            for mut record in message.take_name_servers() {
                record.set_ttl(record.ttl().saturating_sub(age));
                message.add_name_server(record);
            }
            for mut record in message.take_additionals() {
                record.set_ttl(record.ttl().saturating_sub(age));
                message.add_additional(record);
            }
        }
        message.to_vec().ok()
    }
}

impl std::fmt::Debug for PacketCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCache")
            .field("enabled", &self.config.enabled)
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
    use std::str::FromStr;

    // ========================================================================
    // Helper Functions
    // ========================================================================

    fn response(domain: &str, ttl: u32, rcode: ResponseCode) -> Message {
        let name = Name::from_str(domain).unwrap();
        let mut message = Message::new();
        message.set_id(0x1111);
        message.set_message_type(MessageType::Response);
        message.set_response_code(rcode);
        message.add_query(Query::query(name.clone(), RecordType::A));
        if rcode == ResponseCode::NoError {
            let mut record = Record::new();
            record.set_name(name);
            record.set_record_type(RecordType::A);
            record.set_dns_class(DNSClass::IN);
            record.set_ttl(ttl);
            record.set_data(Some(RData::A(A(std::net::Ipv4Addr::new(192, 0, 2, 1)))));
            message.add_answer(record);
        }
        message
    }

    fn key(domain: &str) -> PacketCacheKey {
        PacketCacheKey::new(0, domain, 1, 1, None)
    }

    fn cache() -> PacketCache {
        PacketCache::new(PacketCacheConfig::default())
    }

    // ========================================================================
    // Fingerprints
    // ========================================================================

    #[test]
    fn test_fingerprint_case_insensitive() {
        assert_eq!(key("WWW.Example.COM."), key("www.example.com."));
    }

    #[test]
    fn test_fingerprint_distinguishes_tag_and_ecs() {
        let plain = PacketCacheKey::new(0, "www.example.com.", 1, 1, None);
        let tagged = PacketCacheKey::new(7, "www.example.com.", 1, 1, None);
        let scoped = PacketCacheKey::new(
            0,
            "www.example.com.",
            1,
            1,
            Some("192.0.2.0/24".parse().unwrap()),
        );
        assert_ne!(plain, tagged);
        assert_ne!(plain, scoped);
    }

    // ========================================================================
    // Hit Path
    // ========================================================================

    #[test]
    fn test_hit_rewrites_id_and_ages_ttls() {
        let cache = cache();
        let t0 = Instant::now();
        cache.insert(key("www.example.com."), &response("www.example.com.", 300, ResponseCode::NoError), false, t0);

        let bytes = cache
            .lookup(&key("www.example.com."), 0xBEEF, t0 + Duration::from_secs(100))
            .unwrap();
        let replayed = Message::from_vec(&bytes).unwrap();
        assert_eq!(replayed.id(), 0xBEEF);
        assert_eq!(replayed.answers()[0].ttl(), 200);
    }

    #[test]
    fn test_identical_fingerprint_identical_bytes_modulo_aging() {
        let cache = cache();
        let t0 = Instant::now();
        cache.insert(key("www.example.com."), &response("www.example.com.", 300, ResponseCode::NoError), false, t0);

        let a = cache.lookup(&key("www.example.com."), 0x1234, t0).unwrap();
        let b = cache.lookup(&key("www.example.com."), 0x1234, t0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = cache();
        let t0 = Instant::now();
        cache.insert(key("www.example.com."), &response("www.example.com.", 30, ResponseCode::NoError), false, t0);

        assert!(cache
            .lookup(&key("www.example.com."), 1, t0 + Duration::from_secs(29))
            .is_some());
        assert!(cache
            .lookup(&key("www.example.com."), 1, t0 + Duration::from_secs(30))
            .is_none());
    }

    #[test]
    fn test_ttl_capped_by_packetcache_ttl() {
        let config = PacketCacheConfig {
            packetcache_ttl: 10,
            ..PacketCacheConfig::default()
        };
        let cache = PacketCache::new(config);
        let t0 = Instant::now();
        cache.insert(key("www.example.com."), &response("www.example.com.", 3600, ResponseCode::NoError), false, t0);

        assert!(cache
            .lookup(&key("www.example.com."), 1, t0 + Duration::from_secs(11))
            .is_none());
    }

    // ========================================================================
    // Insertion Policy
    // ========================================================================

    #[test]
    fn test_variable_response_not_cached() {
        let cache = cache();
        let t0 = Instant::now();
        cache.insert(key("www.example.com."), &response("www.example.com.", 300, ResponseCode::NoError), true, t0);
        assert!(cache.lookup(&key("www.example.com."), 1, t0).is_none());
    }

    #[test]
    fn test_disabled_cache_never_hits() {
        let config = PacketCacheConfig {
            enabled: false,
            ..PacketCacheConfig::default()
        };
        let cache = PacketCache::new(config);
        let t0 = Instant::now();
        cache.insert(key("www.example.com."), &response("www.example.com.", 300, ResponseCode::NoError), false, t0);
        assert!(cache.lookup(&key("www.example.com."), 1, t0).is_none());
    }

    #[test]
    fn test_servfail_uses_servfail_ttl() {
        let cache = cache();
        let t0 = Instant::now();
        cache.insert(key("down.example.com."), &response("down.example.com.", 300, ResponseCode::ServFail), false, t0);

        // default servfail ttl is 60
        assert!(cache
            .lookup(&key("down.example.com."), 1, t0 + Duration::from_secs(59))
            .is_some());
        assert!(cache
            .lookup(&key("down.example.com."), 1, t0 + Duration::from_secs(60))
            .is_none());
    }

    #[test]
    fn test_servfail_caching_disabled_by_zero_ttl() {
        let config = PacketCacheConfig {
            packetcache_servfail_ttl: 0,
            ..PacketCacheConfig::default()
        };
        let cache = PacketCache::new(config);
        let t0 = Instant::now();
        cache.insert(key("down.example.com."), &response("down.example.com.", 300, ResponseCode::ServFail), false, t0);
        assert!(cache.lookup(&key("down.example.com."), 1, t0).is_none());
    }

    // ========================================================================
    // Wipe
    // ========================================================================

    #[test]
    fn test_wipe_name() {
        let cache = cache();
        let t0 = Instant::now();
        cache.insert(key("a.example.com."), &response("a.example.com.", 300, ResponseCode::NoError), false, t0);
        cache.insert(key("b.example.com."), &response("b.example.com.", 300, ResponseCode::NoError), false, t0);
        cache.run_maintenance();

        assert_eq!(cache.wipe_name("a.example.com."), 1);
        assert!(cache.lookup(&key("a.example.com."), 1, t0).is_none());
        assert!(cache.lookup(&key("b.example.com."), 1, t0).is_some());
    }

    #[test]
    fn test_wipe_all() {
        let cache = cache();
        let t0 = Instant::now();
        cache.insert(key("a.example.com."), &response("a.example.com.", 300, ResponseCode::NoError), false, t0);
        cache.wipe_all();
        assert!(cache.lookup(&key("a.example.com."), 1, t0).is_none());
    }
}
