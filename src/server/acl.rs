//! Netmask-group filters
//!
//! Two filters guard the resolver's edges: `allow_from` decides which
//! clients may ask questions at all, and `dont_query` lists networks the
//! resolver refuses to send queries to (loopback, RFC 1918 and the other
//! ranges that cannot host a public authoritative server).

use std::net::IpAddr;

use ipnet::IpNet;

/// An ordered set of networks matched by containment
#[derive(Debug, Clone, Default)]
pub struct AddressFilter {
    nets: Vec<IpNet>,
}

impl AddressFilter {
    /// Create a filter over the given networks
    #[must_use]
    pub fn new(nets: Vec<IpNet>) -> Self {
        Self { nets }
    }

    /// Whether `addr` falls inside any member network
    #[must_use]
    pub fn matches(&self, addr: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&addr))
    }

    /// Whether the filter has no members (matches nothing)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    /// Number of member networks
    #[must_use]
    pub fn len(&self) -> usize {
        self.nets.len()
    }
}
