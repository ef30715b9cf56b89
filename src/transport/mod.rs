//! Outbound transport
//!
//! The resolver core talks to the world through one async boundary, the
//! [`Exchanger`] trait: given a server address, a question, and the EDNS
//! and ECS decorations the resolver decided on, produce an [`Exchange`]:
//! the sectioned, already-parsed reply plus the header bits the resolver
//! classifies on. Production uses [`udp::UdpExchanger`] (with its TCP
//! fallback); tests inject a mock.
//!
//! A [`PacketId`] identifies one pending outbound query for reply
//! matching: a reply is accepted only when its source, transaction id and
//! question tuple all agree with the pending entry, and it arrived on the
//! socket the query left from. Anything that matches except the id is a
//! *near miss* and counts toward the spoof threshold.

pub mod inflight;
pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};
use hickory_proto::rr::{Name, Record, RecordType};

use crate::cache::canonical_name;
use crate::error::Result;
use crate::wire::ecs::ClientSubnet;

pub use inflight::{ChainedReply, FlightKey, FlightOutcome, InflightTable};
pub use udp::UdpExchanger;

/// One outbound query, fully decorated
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    /// The nameserver to ask
    pub server: SocketAddr,
    /// The question name
    pub qname: Name,
    /// The question type
    pub qtype: RecordType,
    /// Force TCP (the TC=1 fallback)
    pub tcp: bool,
    /// Attach an OPT record
    pub edns: bool,
    /// Set the DO bit (only meaningful with `edns`)
    pub dnssec_ok: bool,
    /// Attach this ECS option
    pub ecs: Option<ClientSubnet>,
}

impl ExchangeRequest {
    /// A plain EDNS UDP request
    #[must_use]
    pub fn new(server: SocketAddr, qname: Name, qtype: RecordType) -> Self {
        Self {
            server,
            qname,
            qtype,
            tcp: false,
            edns: true,
            dnssec_ok: false,
            ecs: None,
        }
    }

    /// Retry without EDNS (the FORMERR/NOTIMP fallback)
    #[must_use]
    pub fn without_edns(mut self) -> Self {
        self.edns = false;
        self.dnssec_ok = false;
        self.ecs = None;
        self
    }

    /// Retry over TCP (the TC=1 fallback)
    #[must_use]
    pub fn over_tcp(mut self) -> Self {
        self.tcp = true;
        self
    }
}

/// A parsed upstream reply, sectioned for classification
#[derive(Debug, Clone, Default)]
pub struct Exchange {
    /// Response code (with extended bits folded in when EDNS was present)
    pub rcode: u16,
    /// AA bit
    pub aa: bool,
    /// TC bit
    pub tc: bool,
    /// Whether the reply carried an OPT record
    pub have_edns: bool,
    /// Answer section
    pub answers: Vec<Record>,
    /// Authority section
    pub authorities: Vec<Record>,
    /// Additional section (OPT excluded)
    pub additionals: Vec<Record>,
    /// The ECS option the server returned, scope included
    pub ecs: Option<ClientSubnet>,
    /// Round-trip time of the exchange
    pub rtt: Duration,
}

impl Exchange {
    /// Build from a parsed reply message
    #[must_use]
    pub fn from_message(message: Message, rtt: Duration) -> Self {
        let ecs = message.extensions().as_ref().and_then(|edns| {
            match edns.option(EdnsCode::Subnet) {
                Some(EdnsOption::Unknown(_, payload)) => ClientSubnet::parse(payload),
                _ => None,
            }
        });
        let have_edns = message.extensions().is_some();
        let rcode: u16 = message.response_code().into();
        let aa = message.authoritative();
        let tc = message.truncated();

        let mut message = message;
        Self {
            rcode,
            aa,
            tc,
            have_edns,
            answers: message.take_answers(),
            authorities: message.take_name_servers(),
            additionals: message.take_additionals(),
            ecs,
            rtt,
        }
    }

    /// All records of `rtype` in the answer section
    #[must_use]
    pub fn answers_of(&self, rtype: RecordType) -> Vec<&Record> {
        self.answers
            .iter()
            .filter(|r| r.record_type() == rtype)
            .collect()
    }
}

/// Identity of one pending outbound query
///
/// The socket itself is not part of the struct: the issuing task owns its
/// connected socket exclusively, so "arrived on the right socket" holds by
/// construction and the kernel has already checked the source address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketId {
    /// The server the query went to
    pub remote: SocketAddr,
    /// Transaction id we sent
    pub id: u16,
    /// Canonical question name
    pub qname: String,
    /// Question type
    pub qtype: u16,
}

impl PacketId {
    /// Create a pending-query identity
    #[must_use]
    pub fn new(remote: SocketAddr, id: u16, qname: &Name, qtype: RecordType) -> Self {
        Self {
            remote,
            id,
            qname: canonical_name(qname),
            qtype: qtype.into(),
        }
    }
}

/// How a received datagram relates to a pending query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMatch {
    /// id and question both agree: accept
    Match,
    /// question agrees, id does not: spoof evidence
    NearMiss,
    /// a reply we cannot attribute at all
    Unexpected,
    /// unparseable, but the id agrees: treat as a failed reply from the
    /// server (the permissive matcher for broken implementations)
    MalformedFromServer,
}

impl PacketId {
    /// Classify a datagram received on this query's socket
    #[must_use]
    pub fn classify_reply(&self, packet: &[u8]) -> ReplyMatch {
        let Ok(header) = crate::wire::peek_header(packet) else {
            return ReplyMatch::Unexpected;
        };
        if !header.qr() {
            return ReplyMatch::Unexpected;
        }
        match crate::wire::sniff_question(packet) {
            Ok(question) => {
                if question.qname == self.qname && question.qtype == self.qtype {
                    if question.id == self.id {
                        ReplyMatch::Match
                    } else {
                        ReplyMatch::NearMiss
                    }
                } else {
                    ReplyMatch::Unexpected
                }
            }
            // Some servers return FORMERR with an empty question section.
            Err(_) if header.qdcount == 0 && header.id == self.id => {
                ReplyMatch::MalformedFromServer
            }
            Err(_) => ReplyMatch::Unexpected,
        }
    }
}

/// The async boundary between the resolver core and the network
#[async_trait]
pub trait Exchanger: Send + Sync + std::fmt::Debug {
    /// Send one query and await its classified reply
    async fn exchange(&self, request: &ExchangeRequest) -> Result<Exchange>;
}
