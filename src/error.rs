//! Error types for the resolver
//!
//! This module defines the error hierarchy for the whole resolution path,
//! from wire parsing through outbound transport to the iterative resolver
//! itself.
//!
//! # Error Categories
//!
//! - **Parse/Serialize errors**: DNS message encoding/decoding failures
//! - **Network errors**: socket I/O, unreachable networks, fd exhaustion
//! - **Timeouts**: an outbound query that never got a matching reply
//! - **Protocol rejections**: REFUSED/NOTAUTH from an upstream server
//! - **EDNS rejections**: FORMERR/NOTIMP in response to an EDNS probe
//! - **Limits**: per-query budgets (outgoing queries, wall clock, depth)
//! - **Policy drops**: ACL rejections, no response emitted
//! - **Validation failures**: DNSSEC chain came back Bogus
//! - **Spoof attempts**: near-miss threshold crossed on a pending query
//!
//! Every error maps to exactly one client-visible outcome (an RCODE or a
//! silent drop); that mapping happens once, in the server handler.
//!
//! # Example
//!
//! ```
//! use rust_recursor::error::ResolverError;
//!
//! let err = ResolverError::timeout("query to 192.0.2.1:53", std::time::Duration::from_secs(2));
//! assert!(err.is_transient());
//! assert!(err.to_string().contains("timed out"));
//! ```

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Which per-query budget was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    /// Outgoing queries per client query (`max_qperq`)
    OutQueries,
    /// Wall-clock time per client query (`max_total_msec`)
    WallClock,
    /// Recursion depth (CNAME chases plus nested NS resolutions)
    Depth,
    /// CNAME chain length
    CnameChain,
}

impl std::fmt::Display for Budget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutQueries => write!(f, "outgoing-query budget"),
            Self::WallClock => write!(f, "wall-clock budget"),
            Self::Depth => write!(f, "recursion depth"),
            Self::CnameChain => write!(f, "CNAME chain length"),
        }
    }
}

/// Error type for all resolution operations
///
/// The variants follow the failure taxonomy of the resolution pipeline.
/// `is_transient()` distinguishes failures worth retrying against another
/// nameserver from failures that are final for this query.
#[derive(Debug, Error)]
pub enum ResolverError {
    /// Malformed wire data; never retriable against the same payload.
    #[error("failed to parse DNS message: {reason}")]
    Parse {
        /// What was wrong with the packet
        reason: String,
    },

    /// A message could not be encoded for transmission.
    #[error("failed to serialize DNS message: {reason}")]
    Serialize {
        /// What prevented encoding
        reason: String,
    },

    /// Socket-level failure. `transient` failures are retried by picking
    /// another server at the current zone cut.
    #[error("network error: {reason}")]
    Network {
        /// Description of the failure
        reason: String,
        /// Whether picking another server may help
        transient: bool,
        /// The underlying I/O error, if available
        #[source]
        source: Option<io::Error>,
    },

    /// No matching reply arrived before the deadline.
    #[error("query timed out after {timeout:?}: {context}")]
    Timeout {
        /// What timed out
        context: String,
        /// The deadline that was exceeded
        timeout: Duration,
    },

    /// The upstream refused to serve us (REFUSED, NOTAUTH). The server is
    /// unsuitable for this query; the next candidate is tried.
    #[error("server {server} rejected the query: rcode {rcode}")]
    ProtocolReject {
        /// The rejecting server
        server: SocketAddr,
        /// The rejection RCODE
        rcode: u16,
    },

    /// FORMERR/NOTIMP in response to an EDNS probe. The server is demoted
    /// to no-EDNS mode and the query retried without OPT.
    #[error("server {server} does not speak EDNS")]
    NoEdns {
        /// The server that rejected the OPT record
        server: SocketAddr,
    },

    /// A per-query budget was exhausted; surfaced as SERVFAIL.
    #[error("{budget} exceeded resolving {qname}")]
    LimitExceeded {
        /// Which budget ran out
        budget: Budget,
        /// The name being resolved when it happened
        qname: String,
    },

    /// The query was rejected by policy (ingress ACL); no response is sent.
    #[error("query from {client} dropped by policy: {reason}")]
    PolicyDrop {
        /// The client that was refused
        client: SocketAddr,
        /// Which policy fired
        reason: String,
    },

    /// DNSSEC validation returned Bogus and the client demanded validation.
    #[error("DNSSEC validation failed for {qname}: {reason}")]
    ValidationBogus {
        /// The name that failed to validate
        qname: String,
        /// What the validator objected to
        reason: String,
    },

    /// Too many near-miss replies while a query was pending; the attempt
    /// is aborted and the client gets SERVFAIL.
    #[error("spoof attempt suspected for {qname} from {server}: {near_misses} near misses")]
    SpoofAttempt {
        /// The name under resolution
        qname: String,
        /// The server we were talking to
        server: SocketAddr,
        /// How many near misses were observed
        near_misses: u32,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    Config {
        /// Description of the problem
        reason: String,
        /// The offending field, if known
        field: Option<String>,
    },

    /// An invariant was violated. The current task fails; the server keeps
    /// running.
    #[error("internal error: {reason}")]
    Internal {
        /// Description of the violated invariant
        reason: String,
    },
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, ResolverError>;

impl ResolverError {
    /// Create a parse error
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    /// Create a serialization error
    pub fn serialize(reason: impl Into<String>) -> Self {
        Self::Serialize {
            reason: reason.into(),
        }
    }

    /// Create a non-transient network error
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
            transient: false,
            source: None,
        }
    }

    /// Create a network error from an I/O error, classifying transience
    ///
    /// `ENETUNREACH`/`EHOSTUNREACH` and fd exhaustion are transient: the
    /// resolver moves on to the next candidate server.
    pub fn network_io(reason: impl Into<String>, source: io::Error) -> Self {
        let transient = matches!(
            source.raw_os_error(),
            Some(code) if code == NETUNREACH || code == HOSTUNREACH || code == MFILE
        ) || matches!(
            source.kind(),
            io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
        );
        Self::Network {
            reason: reason.into(),
            transient,
            source: Some(source),
        }
    }

    /// Create a timeout error
    pub fn timeout(context: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            context: context.into(),
            timeout,
        }
    }

    /// Create a protocol rejection error
    pub fn protocol_reject(server: SocketAddr, rcode: u16) -> Self {
        Self::ProtocolReject { server, rcode }
    }

    /// Create a budget-exceeded error
    pub fn limit(budget: Budget, qname: impl Into<String>) -> Self {
        Self::LimitExceeded {
            budget,
            qname: qname.into(),
        }
    }

    /// Create a policy drop error
    pub fn policy_drop(client: SocketAddr, reason: impl Into<String>) -> Self {
        Self::PolicyDrop {
            client,
            reason: reason.into(),
        }
    }

    /// Create a validation failure error
    pub fn bogus(qname: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationBogus {
            qname: qname.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn config_field(reason: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    // ========================================================================
    // Classification
    // ========================================================================

    /// Whether trying another server at the same zone cut may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::ProtocolReject { .. } => true,
            Self::Network { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Whether this error means the packet itself was malformed
    #[must_use]
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse { .. })
    }

    /// Whether this is a timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this error must produce no response at all
    #[must_use]
    pub fn is_drop(&self) -> bool {
        matches!(self, Self::PolicyDrop { .. })
    }

    /// Whether the failed server should be charged a failure point
    ///
    /// Parse errors, timeouts, rejections and transient network errors all
    /// count against the server; budget and policy errors are ours.
    #[must_use]
    pub fn counts_against_server(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. }
                | Self::Timeout { .. }
                | Self::ProtocolReject { .. }
                | Self::Network { .. }
        )
    }
}

// Raw errno values used for transience classification; `io::ErrorKind` has
// no stable mapping for these.
const NETUNREACH: i32 = 101;
const HOSTUNREACH: i32 = 113;
const MFILE: i32 = 24;
