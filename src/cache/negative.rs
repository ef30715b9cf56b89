//! The negative cache
//!
//! Caches proven non-existence per RFC 2308: NXDOMAIN for a name, or
//! NODATA for one `(name, type)`. Entries carry the proving SOA and expire
//! at `min(SOA TTL, SOA MINIMUM, max_negative_ttl)` from insertion.
//!
//! Blanketing rules:
//!
//! - an NXDOMAIN entry has no type and answers for every type;
//! - an explicit ANY insert blankets the same way;
//! - a NODATA entry answers only its own type, and an ANY lookup does
//!   *not* hit it;
//! - a positive insert for `(name, type)` evicts the same-type NODATA
//!   entry and any blanket for the name.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use hickory_proto::rr::{RData, Record, RecordType};

use crate::cache::key::{canonical_str, QTYPE_ANY};
use crate::cache::CacheStats;
use crate::config::NegativeCacheConfig;
use crate::resolver::validate::ValidationState;

/// What kind of non-existence was proven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegativeKind {
    /// The name does not exist at all
    NxDomain,
    /// The name exists but has no records of the asked type
    NoData,
}

impl std::fmt::Display for NegativeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NxDomain => write!(f, "NXDOMAIN"),
            Self::NoData => write!(f, "NODATA"),
        }
    }
}

/// One cached proof of non-existence
#[derive(Debug, Clone)]
pub struct NegativeEntry {
    /// NXDOMAIN or NODATA
    pub kind: NegativeKind,
    /// The type this entry answers for; `None` blankets every type
    pub qtype: Option<u16>,
    /// Absolute expiry
    pub valid_until: Instant,
    /// The SOA that proved it, replayed in the authority section
    pub soa: Option<Record>,
    /// DNSSEC validation state of the proof
    pub state: ValidationState,
}

impl NegativeEntry {
    /// Whether the entry is expired at `now`
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.valid_until
    }

    /// Whether this entry answers a lookup for `qtype`
    ///
    /// A blanket entry answers everything, including ANY; a typed entry
    /// answers only its own type and never an ANY lookup.
    #[must_use]
    pub fn answers(&self, qtype: u16) -> bool {
        match self.qtype {
            None => true,
            Some(t) => qtype != QTYPE_ANY && t == qtype,
        }
    }

    /// Seconds of validity left at `now`
    #[must_use]
    pub fn remaining_ttl(&self, now: Instant) -> u32 {
        self.valid_until
            .saturating_duration_since(now)
            .as_secs()
            .min(u64::from(u32::MAX)) as u32
    }
}

/// Pull the MINIMUM field out of a SOA record
#[must_use]
pub fn soa_minimum(record: &Record) -> Option<u32> {
    record.data().and_then(RData::as_soa).map(|soa| soa.minimum())
}

/// Negative TTL per RFC 2308: the smaller of the SOA's own TTL and its
/// MINIMUM field, capped by configuration
#[must_use]
pub fn negative_ttl(soa: Option<&Record>, config: &NegativeCacheConfig) -> u32 {
    let from_soa = soa
        .map(|record| soa_minimum(record).map_or(record.ttl(), |min| min.min(record.ttl())))
        .unwrap_or(config.default_ttl);
    from_soa.min(config.max_negative_ttl)
}

/// Classify a reply's negative outcome, if it has one
///
/// NXDOMAIN qualifies by rcode alone; NODATA needs an empty answer section
/// with a SOA in authority. Returns the proving SOA when present.
#[must_use]
pub fn classify_negative(
    rcode: u16,
    answers: &[Record],
    authorities: &[Record],
) -> Option<(NegativeKind, Option<Record>)> {
    let soa = authorities
        .iter()
        .find(|r| r.record_type() == RecordType::SOA)
        .cloned();
    match rcode {
        3 => Some((NegativeKind::NxDomain, soa)),
        0 if answers.is_empty() && soa.is_some() => Some((NegativeKind::NoData, soa)),
        _ => None,
    }
}

/// The negative cache proper
pub struct NegativeCache {
    map: DashMap<String, Vec<NegativeEntry>>,
    config: NegativeCacheConfig,
    stats: CacheStats,
    entries: AtomicUsize,
}

impl NegativeCache {
    /// Create a cache with the given TTL policy
    #[must_use]
    pub fn new(config: NegativeCacheConfig) -> Self {
        Self {
            map: DashMap::new(),
            config,
            stats: CacheStats::new(),
            entries: AtomicUsize::new(0),
        }
    }

    /// Number of live entries
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

    /// Insert a proof of non-existence
    ///
    /// `qtype` of `None` (an NXDOMAIN, or an explicit ANY answer) blankets
    /// the whole name. The TTL is derived from the SOA via
    /// [`negative_ttl`].
    pub fn insert(
        &self,
        qname: &str,
        qtype: Option<u16>,
        kind: NegativeKind,
        soa: Option<Record>,
        state: ValidationState,
        now: Instant,
    ) {
        let ttl = negative_ttl(soa.as_ref(), &self.config);
        let entry = NegativeEntry {
            kind,
            qtype: if qtype == Some(QTYPE_ANY) { None } else { qtype },
            valid_until: now + Duration::from_secs(u64::from(ttl)),
            soa,
            state,
        };

        let key = canonical_str(qname);
        let mut list = self.map.entry(key).or_default();
        // A fresh entry for the same coverage replaces the old one.
        let before = list.len();
        list.retain(|e| e.qtype != entry.qtype);
        let replaced = before - list.len();
        list.push(entry);
        if replaced == 0 {
            self.entries.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.record_insert();
    }

    /// Look up a proof covering `(name, type)` at `now`
    ///
    /// Expired entries found along the way are dropped.
    #[must_use]
    pub fn lookup(&self, qname: &str, qtype: u16, now: Instant) -> Option<NegativeEntry> {
        let key = canonical_str(qname);
        let found = {
            let mut list = self.map.get_mut(&key)?;
            let before = list.len();
            list.retain(|e| !e.is_expired(now));
            self.note_removed(before - list.len(), true);
            list.iter().find(|e| e.answers(qtype)).cloned()
        };
        match found {
            Some(entry) => {
                self.stats.record_hit();
                Some(entry)
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Evict whatever a positive insert for `(name, type)` disproves: the
    /// same-type NODATA entry and any blanket for the name
    pub fn evict_for(&self, qname: &str, qtype: u16) {
        let key = canonical_str(qname);
        if let Some(mut list) = self.map.get_mut(&key) {
            let before = list.len();
            list.retain(|e| matches!(e.qtype, Some(t) if t != qtype));
            self.note_removed(before - list.len(), false);
        }
        self.map.remove_if(&key, |_, list| list.is_empty());
    }

    /// Remove every entry for `name`
    pub fn wipe(&self, qname: &str) -> usize {
        let key = canonical_str(qname);
        match self.map.remove(&key) {
            Some((_, list)) => {
                self.entries.fetch_sub(list.len(), Ordering::Relaxed);
                list.len()
            }
            None => 0,
        }
    }

    /// Drop expired entries, examining at most `budget` of them
    pub fn prune(&self, budget: usize, now: Instant) {
        let mut examined = 0usize;
        let mut empty = Vec::new();
        for mut entry in self.map.iter_mut() {
            if examined >= budget {
                break;
            }
            let list = entry.value_mut();
            examined += list.len();
            let before = list.len();
            list.retain(|e| !e.is_expired(now));
            self.note_removed(before - list.len(), true);
            if list.is_empty() {
                empty.push(entry.key().clone());
            }
        }
        for key in empty {
            self.map.remove_if(&key, |_, list| list.is_empty());
        }
    }

    /// Account for entries removed from a list
    fn note_removed(&self, count: usize, expired: bool) {
        if count == 0 {
            return;
        }
        self.entries.fetch_sub(count, Ordering::Relaxed);
        for _ in 0..count {
            if expired {
                self.stats.record_expiration();
            } else {
                self.stats.record_eviction();
            }
        }
    }
}

impl std::fmt::Debug for NegativeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegativeCache")
            .field("entries", &self.len())
            .finish()
    }
}
