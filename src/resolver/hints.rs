//! Root hints
//!
//! The compiled-in addresses of the thirteen root servers, an optional
//! hints-file override, and the priming routine that seeds the record
//! cache with them. Priming follows the usual convention: the address
//! records go in as authoritative data, the root NS set itself as
//! non-authoritative (a real root answer will replace it).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

use hickory_proto::rr::rdata::{A, AAAA, NS};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use tracing::{info, warn};

use crate::cache::{ResolverCaches, RrsetInsert};
use crate::error::{ResolverError, Result};

/// TTL the hints are primed with; clamped by the cache's own ceiling
const HINTS_TTL: u32 = 518_400;

/// The thirteen root servers: letter, IPv4, IPv6
const ROOT_SERVERS: [(&str, &str, &str); 13] = [
    ("a", "198.41.0.4", "2001:503:ba3e::2:30"),
    ("b", "199.9.14.201", "2001:500:200::b"),
    ("c", "192.33.4.12", "2001:500:2::c"),
    ("d", "199.7.91.13", "2001:500:2d::d"),
    ("e", "192.203.230.10", "2001:500:a8::e"),
    ("f", "192.5.5.241", "2001:500:2f::f"),
    ("g", "192.112.36.4", "2001:500:12::d0d"),
    ("h", "198.97.190.53", "2001:500:1::53"),
    ("i", "192.36.148.17", "2001:7fe::53"),
    ("j", "192.58.128.30", "2001:503:c27::2:30"),
    ("k", "193.0.14.129", "2001:7fd::1"),
    ("l", "199.7.83.42", "2001:500:9f::42"),
    ("m", "202.12.27.33", "2001:dc3::35"),
];

/// One primed nameserver
#[derive(Debug, Clone)]
pub struct RootHint {
    /// `x.root-servers.net.`
    pub name: Name,
    /// Its addresses
    pub addrs: Vec<IpAddr>,
}

/// The hint set used for priming
#[derive(Debug, Clone)]
pub struct RootHints {
    hints: Vec<RootHint>,
}

impl Default for RootHints {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RootHints {
    /// The compiled-in root set
    #[must_use]
    pub fn builtin() -> Self {
        let hints = ROOT_SERVERS
            .iter()
            .map(|(letter, v4, v6)| RootHint {
                name: Name::from_str(&format!("{letter}.root-servers.net."))
                    .expect("builtin root server name"),
                addrs: vec![
                    IpAddr::V4(v4.parse::<Ipv4Addr>().expect("builtin root v4")),
                    IpAddr::V6(v6.parse::<Ipv6Addr>().expect("builtin root v6")),
                ],
            })
            .collect();
        Self { hints }
    }

    /// Build a hint set from explicit servers (tests, lab setups)
    #[must_use]
    pub fn from_servers(hints: Vec<RootHint>) -> Self {
        Self { hints }
    }

    /// Load hints from a root.hints-style file
    ///
    /// Accepts the subset of zone-file syntax such files actually use:
    /// whitespace-separated `name ttl [class] type rdata` lines, `;`
    /// comments. Unparseable lines are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or yields no usable NS set.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ResolverError::config(format!("cannot read hints file {}: {e}", path.display()))
        })?;

        let mut ns_names: Vec<Name> = Vec::new();
        let mut addrs: Vec<(Name, IpAddr)> = Vec::new();

        for line in raw.lines() {
            let line = line.split(';').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                warn!(line, "skipping short hints line");
                continue;
            }
            // optional class column between ttl and type
            let (rtype_idx, rdata_idx) = if fields[2].eq_ignore_ascii_case("in") {
                (3, 4)
            } else {
                (2, 3)
            };
            if fields.len() <= rdata_idx {
                warn!(line, "skipping short hints line");
                continue;
            }

            let owner = match Name::from_str(fields[0]) {
                Ok(name) => name,
                Err(e) => {
                    warn!(line, error = %e, "skipping hints line with bad owner");
                    continue;
                }
            };
            match fields[rtype_idx].to_ascii_uppercase().as_str() {
                "NS" => match Name::from_str(fields[rdata_idx]) {
                    Ok(target) if owner.is_root() => ns_names.push(target),
                    Ok(_) => warn!(line, "NS hint not at the root, skipped"),
                    Err(e) => warn!(line, error = %e, "bad NS target in hints"),
                },
                "A" => match fields[rdata_idx].parse::<Ipv4Addr>() {
                    Ok(v4) => addrs.push((owner, IpAddr::V4(v4))),
                    Err(e) => warn!(line, error = %e, "bad A address in hints"),
                },
                "AAAA" => match fields[rdata_idx].parse::<Ipv6Addr>() {
                    Ok(v6) => addrs.push((owner, IpAddr::V6(v6))),
                    Err(e) => warn!(line, error = %e, "bad AAAA address in hints"),
                },
                other => warn!(line, rtype = other, "unexpected type in hints, skipped"),
            }
        }

        if ns_names.is_empty() {
            return Err(ResolverError::config(format!(
                "hints file {} holds no root NS records",
                path.display()
            )));
        }

        let hints = ns_names
            .into_iter()
            .map(|name| {
                let server_addrs = addrs
                    .iter()
                    .filter(|(owner, _)| owner == &name)
                    .map(|(_, addr)| *addr)
                    .collect();
                RootHint {
                    name,
                    addrs: server_addrs,
                }
            })
            .collect();
        Ok(Self { hints })
    }

    /// The hint list
    #[must_use]
    pub fn servers(&self) -> &[RootHint] {
        &self.hints
    }

    /// Every root address in the set
    #[must_use]
    pub fn all_addrs(&self) -> Vec<IpAddr> {
        self.hints.iter().flat_map(|h| h.addrs.clone()).collect()
    }

    /// Seed the record cache with this hint set
    pub fn prime(&self, caches: &ResolverCaches, now: Instant) {
        let mut ns_set = Vec::new();
        for hint in &self.hints {
            let mut ns = Record::new();
            ns.set_name(Name::root());
            ns.set_record_type(RecordType::NS);
            ns.set_dns_class(DNSClass::IN);
            ns.set_ttl(HINTS_TTL);
            ns.set_data(Some(RData::NS(NS(hint.name.clone()))));
            ns_set.push(ns);

            let mut v4 = Vec::new();
            let mut v6 = Vec::new();
            for addr in &hint.addrs {
                let mut record = Record::new();
                record.set_name(hint.name.clone());
                record.set_dns_class(DNSClass::IN);
                record.set_ttl(HINTS_TTL);
                match addr {
                    IpAddr::V4(a) => {
                        record.set_record_type(RecordType::A);
                        record.set_data(Some(RData::A(A(*a))));
                        v4.push(record);
                    }
                    IpAddr::V6(a) => {
                        record.set_record_type(RecordType::AAAA);
                        record.set_data(Some(RData::AAAA(AAAA(*a))));
                        v6.push(record);
                    }
                }
            }
            let owner = crate::cache::canonical_name(&hint.name);
            if !v4.is_empty() {
                caches.store_positive(&owner, RecordType::A.into(), RrsetInsert::auth(v4, HINTS_TTL), now);
            }
            if !v6.is_empty() {
                caches.store_positive(&owner, RecordType::AAAA.into(), RrsetInsert::auth(v6, HINTS_TTL), now);
            }
        }

        caches.store_positive(
            ".",
            RecordType::NS.into(),
            RrsetInsert::additional(ns_set, HINTS_TTL),
            now,
        );
        info!(servers = self.hints.len(), "root hints primed");
    }
}
