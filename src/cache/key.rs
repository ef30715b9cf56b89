//! Cache key types
//!
//! Record-cache entries are indexed by the canonical lowercase FQDN plus
//! the record type; names compare case-insensitively per RFC 4343 and the
//! trailing dot is always present so `example.com` and `example.com.`
//! cannot diverge into two entries.

use hickory_proto::rr::{Name, RecordType};

/// The `ANY` qtype, treated as a wildcard over a name's cached types
pub const QTYPE_ANY: u16 = 255;

/// Canonical form of a name for cache keying: lowercase, trailing dot
#[must_use]
pub fn canonical_name(name: &Name) -> String {
    let mut out = name.to_ascii().to_lowercase();
    if !out.ends_with('.') {
        out.push('.');
    }
    out
}

/// Canonicalize an already-rendered name
#[must_use]
pub fn canonical_str(name: &str) -> String {
    let mut out = name.to_lowercase();
    if !out.ends_with('.') {
        out.push('.');
    }
    out
}

/// Whether `name` equals `ancestor` or sits below it
///
/// Both arguments must be canonical per [`canonical_name`].
#[must_use]
pub fn is_part_of(name: &str, ancestor: &str) -> bool {
    if ancestor == "." {
        return true;
    }
    if name == ancestor {
        return true;
    }
    name.ends_with(&format!(".{ancestor}"))
}

/// Key of one record-cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RrKey {
    /// Canonical owner name
    pub qname: String,
    /// Record type
    pub rtype: u16,
}

impl RrKey {
    /// Create a key from raw parts
    #[must_use]
    pub fn new(qname: impl AsRef<str>, rtype: u16) -> Self {
        Self {
            qname: canonical_str(qname.as_ref()),
            rtype,
        }
    }

    /// Create a key from hickory types
    #[must_use]
    pub fn from_name(name: &Name, rtype: RecordType) -> Self {
        Self {
            qname: canonical_name(name),
            rtype: rtype.into(),
        }
    }

    /// Whether this key is the ANY wildcard
    #[must_use]
    pub fn is_any(&self) -> bool {
        self.rtype == QTYPE_ANY
    }
}
