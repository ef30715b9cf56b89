//! Client query processing
//!
//! The pipeline between a raw datagram and its response bytes:
//!
//! ```text
//! Incoming query bytes
//!     |
//!     v
//! Ingress ACL (allow_from)  --- outside ---> silent drop
//!     |
//!     v
//! Raw header checks (QR=0, OPCODE=QUERY, qdcount=1)
//!     |
//!     v
//! Packet cache  --- hit ---> replayed response (TTLs aged)
//!     | miss
//!     v
//! IterativeResolver::resolve
//!     |
//!     v
//! Response composition (EDNS sizing, TC truncation, AD bit)
//!     |
//!     v
//! Packet cache insert
//! ```
//!
//! Error-to-RCODE mapping happens here and nowhere else: parse errors are
//! FORMERR, policy drops emit nothing, and every resolution dead end is
//! SERVFAIL.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};
use hickory_proto::rr::{Name, Record, RecordType};
use tracing::{debug, trace, warn};

use crate::cache::{PacketCache, PacketCacheKey};
use crate::config::Config;
use crate::resolver::validate::{ValidationRequest, ValidationState};
use crate::resolver::{IterativeResolver, ResolveOutcome, ResolveRequest};
use crate::server::acl::AddressFilter;
use crate::stats::ResolverStats;
use crate::wire::ecs::{ClientSubnet, OPTION_CODE_ECS};
use crate::wire::{peek_header, truncate_to_size, DNS_HEADER_SIZE};

/// Maximum plain-UDP query size without EDNS (RFC 1035)
const MAX_PLAIN_UDP_QUERY: usize = 512;

/// Handler statistics
#[derive(Debug, Default)]
pub struct HandlerStats {
    queries_received: AtomicU64,
    parse_errors: AtomicU64,
    acl_drops: AtomicU64,
    cache_hits: AtomicU64,
    error_responses: AtomicU64,
}

impl HandlerStats {
    /// Queries received
    #[must_use]
    pub fn queries_received(&self) -> u64 {
        self.queries_received.load(Ordering::Relaxed)
    }

    /// Malformed queries
    #[must_use]
    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    /// Queries dropped by the ACL
    #[must_use]
    pub fn acl_drops(&self) -> u64 {
        self.acl_drops.load(Ordering::Relaxed)
    }

    /// Packet-cache hits
    #[must_use]
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Error responses generated
    #[must_use]
    pub fn error_responses(&self) -> u64 {
        self.error_responses.load(Ordering::Relaxed)
    }
}

/// Transport the query arrived over; decides size limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressProtocol {
    /// Plain UDP, truncation applies
    Udp,
    /// TCP, the two-byte length prefix is the only limit
    Tcp,
}

/// The per-worker query handler
pub struct QueryHandler {
    config: Arc<Config>,
    resolver: Arc<IterativeResolver>,
    packet_cache: Arc<PacketCache>,
    allow_from: AddressFilter,
    stats: HandlerStats,
    global_stats: Arc<ResolverStats>,
}

impl QueryHandler {
    /// Create a handler
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        resolver: Arc<IterativeResolver>,
        packet_cache: Arc<PacketCache>,
        global_stats: Arc<ResolverStats>,
    ) -> Self {
        let allow_from = AddressFilter::new(config.allow_from.clone());
        Self {
            config,
            resolver,
            packet_cache,
            allow_from,
            stats: HandlerStats::default(),
            global_stats,
        }
    }

    /// Handler statistics
    #[must_use]
    pub fn stats(&self) -> &HandlerStats {
        &self.stats
    }

    /// Count an overload drop against the global statistics
    pub fn global_overload_drop(&self) {
        self.global_stats.record_overload_drop();
    }

    /// The resolver this handler dispatches into
    #[must_use]
    pub fn resolver(&self) -> Arc<IterativeResolver> {
        Arc::clone(&self.resolver)
    }

    /// Process one client query; `None` means "send nothing back"
    pub async fn handle_query(
        &self,
        client: SocketAddr,
        payload: &[u8],
        protocol: IngressProtocol,
    ) -> Option<Vec<u8>> {
        self.stats.queries_received.fetch_add(1, Ordering::Relaxed);

        if !self.allow_from.matches(client.ip()) {
            self.stats.acl_drops.fetch_add(1, Ordering::Relaxed);
            self.global_stats.record_policy_drop();
            if self.config.log_common_errors {
                debug!(client = %client, "query dropped by allow_from");
            }
            return None;
        }

        let header = match peek_header(payload) {
            Ok(header) => header,
            Err(_) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if header.qr() {
            // responses sent at our listening socket are noise
            self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        if header.opcode() != 0 {
            return self.error_response(payload, ResponseCode::NotImp);
        }
        if header.qdcount != 1 {
            self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
            return self.error_response(payload, ResponseCode::FormErr);
        }
        if protocol == IngressProtocol::Udp
            && payload.len() > MAX_PLAIN_UDP_QUERY
            && header.arcount == 0
        {
            // large datagrams are only legitimate with EDNS
            self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
            return self.error_response(payload, ResponseCode::FormErr);
        }

        let query = match Message::from_vec(payload) {
            Ok(query) => query,
            Err(e) => {
                trace!(client = %client, error = %e, "unparseable query");
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                return self.error_response(payload, ResponseCode::FormErr);
            }
        };
        let question = query.queries().first()?.clone();

        // Client EDNS state
        let client_edns = query.extensions().clone();
        let dnssec_ok = client_edns.as_ref().is_some_and(Edns::dnssec_ok);
        let validation = ValidationRequest {
            dnssec_ok,
            ad_requested: query.authentic_data(),
        };

        // ECS: a malformed option is treated as absent
        let incoming_ecs = client_edns.as_ref().and_then(|edns| {
            match edns.option(EdnsCode::Subnet) {
                Some(EdnsOption::Unknown(OPTION_CODE_ECS, payload)) => {
                    let parsed = ClientSubnet::parse(payload);
                    if parsed.is_none() {
                        debug!(client = %client, "malformed ECS option ignored");
                    }
                    parsed
                }
                _ => None,
            }
        });
        let ecs_seed = self.ecs_seed(client, incoming_ecs.as_ref());

        // Packet cache
        let now = Instant::now();
        let fingerprint = PacketCacheKey::new(
            0,
            &question.name().to_ascii(),
            question.query_type().into(),
            question.query_class().into(),
            ecs_seed.as_ref().and_then(ClientSubnet::source_net),
        );
        if let Some(bytes) = self.packet_cache.lookup(&fingerprint, header.id, now) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            self.global_stats.record_packetcache_hit();
            return Some(bytes);
        }

        // Resolve
        let request = ResolveRequest {
            qname: question.name().clone(),
            qtype: question.query_type(),
            client: Some(client.ip()),
            ecs: ecs_seed,
            validation,
        };
        let outcome = match self.resolver.resolve(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_drop() {
                    self.global_stats.record_policy_drop();
                    return None;
                }
                self.stats.error_responses.fetch_add(1, Ordering::Relaxed);
                warn!(client = %client, qname = %request.qname, error = %e, "resolution failed");
                ResolveOutcome::servfail()
            }
        };
        self.global_stats.record_answer(outcome.rcode);

        // Compose, truncate, cache
        let mut response =
            self.build_response(&query, &question, &outcome, client_edns.as_ref(), dnssec_ok);
        let limit = self.response_size_limit(protocol, client_edns.as_ref());
        let bytes = match truncate_to_size(&mut response, limit) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "response serialization failed");
                self.stats.error_responses.fetch_add(1, Ordering::Relaxed);
                return self.error_response(payload, ResponseCode::ServFail);
            }
        };

        // a truncated rendering is client-specific, never cache it
        self.packet_cache
            .insert(fingerprint, &response, response.truncated(), now);
        Some(bytes)
    }

    /// The ECS option to send upstream for this client, if any
    fn ecs_seed(&self, client: SocketAddr, incoming: Option<&ClientSubnet>) -> Option<ClientSubnet> {
        let edns = &self.config.edns;
        if edns.edns_subnet_whitelist.is_empty() {
            return None;
        }
        if edns.use_incoming_edns_subnet {
            if let Some(subnet) = incoming {
                // cap the client-supplied prefix at our own policy
                let cap = match subnet.family {
                    crate::wire::ecs::FAMILY_IPV4 => edns.ecs_ipv4_bits,
                    _ => edns.ecs_ipv6_bits,
                };
                let addr = subnet.padded_addr()?;
                return Some(ClientSubnet::for_client(
                    addr,
                    cap.min(subnet.source_prefix),
                    cap.min(subnet.source_prefix),
                ));
            }
        }
        Some(ClientSubnet::for_client(
            client.ip(),
            edns.ecs_ipv4_bits,
            edns.ecs_ipv6_bits,
        ))
    }

    /// The byte budget for a response on this transport
    fn response_size_limit(&self, protocol: IngressProtocol, client_edns: Option<&Edns>) -> usize {
        match protocol {
            IngressProtocol::Tcp => usize::from(u16::MAX),
            IngressProtocol::Udp => client_edns.map_or(MAX_PLAIN_UDP_QUERY, |edns| {
                usize::from(
                    edns.max_payload()
                        .clamp(512, self.config.edns.udp_truncation_threshold),
                )
            }),
        }
    }

    /// Compose the response message for an outcome
    fn build_response(
        &self,
        query: &Message,
        question: &Query,
        outcome: &ResolveOutcome,
        client_edns: Option<&Edns>,
        dnssec_ok: bool,
    ) -> Message {
        let mut response = Message::new();
        response.set_id(query.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(OpCode::Query);
        response.set_recursion_desired(query.recursion_desired());
        response.set_recursion_available(true);
        response.set_checking_disabled(query.checking_disabled());
        response.set_response_code(ResponseCode::from(0, outcome.rcode as u8));
        response.set_authentic_data(
            dnssec_ok_or_ad(query, dnssec_ok) && outcome.state == ValidationState::Secure,
        );
        response.add_query(question.clone());

        let keep_dnssec = dnssec_ok;
        for record in &outcome.answers {
            if keep_dnssec || !is_dnssec_type(record) {
                response.add_answer(record.clone());
            }
        }
        if keep_dnssec {
            for sig in &outcome.sigs {
                response.add_answer(sig.clone());
            }
        }
        for record in &outcome.authorities {
            if keep_dnssec || !is_dnssec_type(record) {
                response.add_name_server(record.clone());
            }
        }
        for record in &outcome.additionals {
            response.add_additional(record.clone());
        }

        if client_edns.is_some() {
            let mut edns = Edns::new();
            edns.set_max_payload(self.config.edns.udp_truncation_threshold);
            edns.set_version(0);
            edns.set_dnssec_ok(dnssec_ok);
            response.set_edns(edns);
        }
        response
    }

    /// A minimal error response echoing whatever of the query is usable
    fn error_response(&self, payload: &[u8], rcode: ResponseCode) -> Option<Vec<u8>> {
        self.stats.error_responses.fetch_add(1, Ordering::Relaxed);
        let header = peek_header(payload).ok()?;

        let mut response = Message::new();
        response.set_id(header.id);
        response.set_message_type(MessageType::Response);
        response.set_op_code(OpCode::Query);
        response.set_recursion_desired(header.rd());
        response.set_recursion_available(true);
        response.set_response_code(rcode);

        // echo the question when it parses
        if payload.len() > DNS_HEADER_SIZE {
            if let Ok(question) = crate::wire::sniff_question(payload) {
                if let Ok(name) = Name::from_ascii(&question.qname) {
                    response.add_query(Query::query(
                        name,
                        RecordType::from(question.qtype),
                    ));
                }
            }
        }
        response.to_vec().ok()
    }
}

/// Whether the client signalled any interest in validation results
fn dnssec_ok_or_ad(query: &Message, dnssec_ok: bool) -> bool {
    dnssec_ok || query.authentic_data()
}

/// DNSSEC record types stripped for clients that did not set DO
fn is_dnssec_type(record: &Record) -> bool {
    matches!(
        record.record_type(),
        RecordType::RRSIG
            | RecordType::NSEC
            | RecordType::NSEC3
            | RecordType::NSEC3PARAM
            | RecordType::DNSKEY
            | RecordType::DS
    )
}

impl std::fmt::Debug for QueryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandler")
            .field("allow_from", &self.allow_from.len())
            .finish_non_exhaustive()
    }
}
