//! DNSSEC validation boundary
//!
//! The resolver labels every RRset that transits it with a
//! [`ValidationState`] and hands the cryptographic work to a [`Validator`]
//! implementation. The validator may fetch DS/DNSKEY records at ancestor
//! zones through the [`ChainFetcher`] callback; those fetches are ordinary
//! resolutions with validation disabled, which is what keeps the recursion
//! from biting its own tail.
//!
//! The crate ships [`NoopValidator`] (for the `off` and
//! `process-no-validate` modes) and [`ChainValidator`], which walks the
//! chain of trust structurally (presence of DS at the parent, DNSKEY at
//! the apex, RRSIGs covering the set, the NSEC3 iteration cap) and
//! delegates actual signature verification to [`Validator::verify_rrsig`].
//! A deployment with a crypto backend overrides that one method.

use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::rr::{Name, Record, RecordType};
use tracing::{debug, warn};

use crate::config::DnssecMode;
use crate::error::Result;

/// NSEC3 iteration counts above this yield Insecure instead of Bogus
pub const MAX_NSEC3_ITERATIONS: u16 = 2_500;

/// The validation state attached to every RRset the resolver handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationState {
    /// Validation was not attempted (or not applicable)
    #[default]
    Indeterminate,
    /// The chain of trust verifies down to this RRset
    Secure,
    /// A provably unsigned span covers this RRset
    Insecure,
    /// Validation was attempted and failed
    Bogus,
}

impl ValidationState {
    /// Whether this state may be served to a validation-demanding client
    #[must_use]
    pub fn servable(self) -> bool {
        !matches!(self, Self::Bogus)
    }

    /// Combine states along a resolution chain: the weakest link wins
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        use ValidationState::{Bogus, Indeterminate, Insecure, Secure};
        match (self, other) {
            (Bogus, _) | (_, Bogus) => Bogus,
            (Insecure, _) | (_, Insecure) => Insecure,
            (Indeterminate, _) | (_, Indeterminate) => Indeterminate,
            (Secure, Secure) => Secure,
        }
    }
}

impl std::fmt::Display for ValidationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Indeterminate => "Indeterminate",
            Self::Secure => "Secure",
            Self::Insecure => "Insecure",
            Self::Bogus => "Bogus",
        };
        write!(f, "{s}")
    }
}

/// What the client asked for, distilled from DO/AD bits and policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationRequest {
    /// The client set the DO bit
    pub dnssec_ok: bool,
    /// The client set AD on its query
    pub ad_requested: bool,
}

impl ValidationRequest {
    /// Whether validation must run under `mode` for this request
    #[must_use]
    pub fn wants_validation(&self, mode: DnssecMode) -> bool {
        match mode {
            DnssecMode::Off | DnssecMode::ProcessNoValidate => false,
            DnssecMode::Process => self.dnssec_ok || self.ad_requested,
            DnssecMode::ValidateAll | DnssecMode::LogFail => true,
        }
    }
}

/// Fetches records on behalf of the validator
///
/// Implemented by the resolver core; fetches run with validation disabled.
#[async_trait]
pub trait ChainFetcher: Send + Sync {
    /// Resolve `(name, rtype)` and return the answer RRset with its
    /// signatures, or an empty pair for a negative answer.
    async fn fetch(&self, name: &Name, rtype: RecordType) -> Result<(Vec<Record>, Vec<Record>)>;
}

/// The validation boundary
///
/// `validate` classifies one RRset; implementations may call back into the
/// resolver through `fetcher` to obtain DS/DNSKEY material.
#[async_trait]
pub trait Validator: Send + Sync + std::fmt::Debug {
    /// Classify `records` (with `sigs` covering them) under `owner`'s chain
    /// of trust.
    async fn validate(
        &self,
        owner: &Name,
        records: &[Record],
        sigs: &[Record],
        fetcher: &dyn ChainFetcher,
    ) -> ValidationState;

    /// Verify one RRSIG over an RRset against a DNSKEY set.
    ///
    /// The default refuses to vouch for anything: structural walks alone
    /// yield at most Insecure/Indeterminate, never Secure.
    fn verify_rrsig(&self, _rrset: &[Record], _sig: &Record, _keys: &[Record]) -> bool {
        false
    }
}

/// Validator for the non-validating modes: everything is Indeterminate
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopValidator;

#[async_trait]
impl Validator for NoopValidator {
    async fn validate(
        &self,
        _owner: &Name,
        _records: &[Record],
        _sigs: &[Record],
        _fetcher: &dyn ChainFetcher,
    ) -> ValidationState {
        ValidationState::Indeterminate
    }
}

/// Structural chain-of-trust walker
///
/// Walks from the owner toward the root looking for the deepest zone with
/// a DS at its parent. No DS anywhere on the path proves an unsigned
/// delegation: Insecure. A DS without a fetchable DNSKEY, or signatures
/// that fail [`Validator::verify_rrsig`], is Bogus. An NSEC3 denial whose
/// iteration count exceeds [`MAX_NSEC3_ITERATIONS`] is downgraded to
/// Insecure rather than Bogus.
#[derive(Debug, Default)]
pub struct ChainValidator;

impl ChainValidator {
    /// Shared handle with the default (non-verifying) crypto
    #[must_use]
    pub fn shared() -> Arc<dyn Validator> {
        Arc::new(Self)
    }

    /// NSEC3 iteration count from an NSEC3/NSEC3PARAM record's RDATA
    ///
    /// Iterations live at bytes 2..4 of both layouts. `None` when the
    /// record is too short to carry them.
    fn nsec3_iterations(record: &Record) -> Option<u16> {
        use hickory_proto::serialize::binary::BinEncodable;
        let rdata = record.data()?;
        let bytes = rdata.to_bytes().ok()?;
        if bytes.len() < 4 {
            return None;
        }
        Some(u16::from_be_bytes([bytes[2], bytes[3]]))
    }
}

#[async_trait]
impl Validator for ChainValidator {
    async fn validate(
        &self,
        owner: &Name,
        records: &[Record],
        sigs: &[Record],
        fetcher: &dyn ChainFetcher,
    ) -> ValidationState {
        if records.is_empty() {
            return ValidationState::Indeterminate;
        }

        // NSEC3 denials over the iteration cap: treat the zone as opted out.
        for record in records {
            if matches!(record.record_type(), RecordType::NSEC3 | RecordType::NSEC3PARAM) {
                if let Some(iterations) = Self::nsec3_iterations(record) {
                    if iterations > MAX_NSEC3_ITERATIONS {
                        debug!(
                            owner = %owner,
                            iterations,
                            "NSEC3 iteration count over cap, treating as Insecure"
                        );
                        return ValidationState::Insecure;
                    }
                }
            }
        }

        // Find the deepest ancestor with a DS record: the signed entry point.
        let mut zone = owner.clone();
        let signed_apex = loop {
            match fetcher.fetch(&zone, RecordType::DS).await {
                Ok((ds, _)) if !ds.is_empty() => break Some(zone.clone()),
                Ok(_) => {}
                Err(e) => {
                    debug!(owner = %owner, zone = %zone, error = %e, "DS fetch failed");
                    return ValidationState::Indeterminate;
                }
            }
            if zone.is_root() {
                break None;
            }
            zone = zone.base_name();
        };

        let Some(apex) = signed_apex else {
            // No DS anywhere between owner and root: unsigned territory.
            return ValidationState::Insecure;
        };

        if sigs.is_empty() {
            warn!(owner = %owner, apex = %apex, "signed zone but unsigned RRset");
            return ValidationState::Bogus;
        }

        let keys = match fetcher.fetch(&apex, RecordType::DNSKEY).await {
            Ok((keys, _)) if !keys.is_empty() => keys,
            Ok(_) => {
                warn!(apex = %apex, "DS present but no DNSKEY at apex");
                return ValidationState::Bogus;
            }
            Err(e) => {
                debug!(apex = %apex, error = %e, "DNSKEY fetch failed");
                return ValidationState::Indeterminate;
            }
        };

        for sig in sigs {
            if self.verify_rrsig(records, sig, &keys) {
                return ValidationState::Secure;
            }
        }
        ValidationState::Bogus
    }
}

/// Apply the mode policy to a finished validation
///
/// Returns `Err` only when the answer must be withheld (SERVFAIL); the
/// `Ok` state is what gets attached to the response.
pub fn apply_policy(
    state: ValidationState,
    mode: DnssecMode,
    request: ValidationRequest,
    qname: &Name,
) -> Result<ValidationState> {
    if state != ValidationState::Bogus {
        return Ok(state);
    }
    if mode == DnssecMode::LogFail {
        warn!(qname = %qname, "DNSSEC validation failed, serving anyway (log-fail mode)");
        return Ok(ValidationState::Insecure);
    }
    if mode.hard_fail() || request.wants_validation(mode) {
        return Err(crate::error::ResolverError::bogus(
            qname.to_string(),
            "chain of trust did not verify",
        ));
    }
    Ok(ValidationState::Insecure)
}
