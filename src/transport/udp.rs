//! UDP exchange with spoof resistance
//!
//! Each outbound query gets its own connected UDP socket, bound to a
//! source port drawn uniformly from the configured window (minus the
//! avoid-set); after nine failed binds the kernel picks. The connect()
//! makes the kernel drop datagrams from anyone but the queried server, so
//! what reaches the receive loop has the right source by construction;
//! matching then comes down to transaction id and question tuple.
//!
//! A reply with the right question but the wrong id is a near miss.
//! Crossing `spoof_nearmiss_max` of those aborts the whole attempt: at
//! that point someone on-path or lucky is racing us and any "matching"
//! reply that follows deserves no trust.
//!
//! Identical `(server, qname, qtype)` lookups already in flight are not
//! re-sent; the request chains onto the existing flight through
//! [`InflightTable`] and receives a copy of its reply.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::{EdnsConfig, TransportConfig};
use crate::error::{ResolverError, Result};
use crate::stats::ResolverStats;
use crate::transport::inflight::{ChainedReply, FlightKey, FlightOutcome, InflightTable};
use crate::transport::{tcp, Exchange, ExchangeRequest, Exchanger, PacketId, ReplyMatch};
use crate::wire::ecs::splice_ecs;

/// Bind attempts with a randomized port before falling back to the kernel
const PORT_BIND_TRIES: usize = 9;

/// Receive buffer; covers any EDNS payload we advertise
const RECV_BUFFER_SIZE: usize = 4096;

/// The production UDP exchanger with TCP fallback
#[derive(Debug)]
pub struct UdpExchanger {
    transport: TransportConfig,
    edns: EdnsConfig,
    inflight: Arc<InflightTable>,
    stats: Arc<ResolverStats>,
}

impl UdpExchanger {
    /// Create an exchanger
    #[must_use]
    pub fn new(transport: TransportConfig, edns: EdnsConfig, stats: Arc<ResolverStats>) -> Self {
        Self {
            transport,
            edns,
            inflight: Arc::new(InflightTable::new()),
            stats,
        }
    }

    /// The in-flight table (exposed for tests and stats)
    #[must_use]
    pub fn inflight(&self) -> &Arc<InflightTable> {
        &self.inflight
    }

    /// Compose the wire form of a request under the given transaction id
    pub(crate) fn compose_query(&self, request: &ExchangeRequest, id: u16) -> Result<Vec<u8>> {
        let mut message = Message::new();
        message.set_id(id);
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.set_recursion_desired(false);
        message.add_query(Query::query(request.qname.clone(), request.qtype));

        if request.edns {
            let mut edns = Edns::new();
            edns.set_max_payload(self.edns.edns_outgoing_bufsize);
            edns.set_version(0);
            edns.set_dnssec_ok(request.dnssec_ok);
            message.set_edns(edns);
        }

        let mut packet = message
            .to_vec()
            .map_err(|e| ResolverError::serialize(e.to_string()))?;

        if let Some(subnet) = &request.ecs {
            if request.edns {
                splice_ecs(&mut packet, subnet, self.edns.edns_outgoing_bufsize)?;
            }
        }
        Ok(packet)
    }

    /// Bind a socket on a randomized source port and connect it
    async fn make_client_socket(&self, server: SocketAddr) -> Result<UdpSocket> {
        let local_any: std::net::IpAddr = if server.is_ipv4() {
            std::net::Ipv4Addr::UNSPECIFIED.into()
        } else {
            std::net::Ipv6Addr::UNSPECIFIED.into()
        };

        let mut last_err: Option<std::io::Error> = None;
        for attempt in 0..=PORT_BIND_TRIES {
            let port = if attempt == PORT_BIND_TRIES {
                0
            } else {
                pick_source_port(&self.transport, &mut rand::thread_rng())
            };
            match UdpSocket::bind((local_any, port)).await {
                Ok(socket) => {
                    socket.connect(server).await.map_err(|e| {
                        ResolverError::network_io(format!("connect to {server}"), e)
                    })?;
                    return Ok(socket);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(ResolverError::network_io(
            "binding outbound socket",
            last_err.unwrap_or_else(|| std::io::Error::other("no bind attempt ran")),
        ))
    }

    /// One owner-side UDP exchange: send, then match replies until the
    /// deadline, counting near misses
    async fn exchange_udp(&self, request: &ExchangeRequest) -> Result<Exchange> {
        let id: u16 = rand::thread_rng().gen();
        let packet = self.compose_query(request, id)?;
        let pid = PacketId::new(request.server, id, &request.qname, request.qtype);

        let socket = self.make_client_socket(request.server).await?;
        let started = Instant::now();
        socket.send(&packet).await.map_err(|e| {
            ResolverError::network_io(format!("send to {}", request.server), e)
        })?;
        self.stats.record_outquery();

        let deadline = started + self.transport.network_timeout();
        let mut near_misses = 0u32;
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ResolverError::timeout(
                    format!("query to {} for {}", request.server, pid.qname),
                    self.transport.network_timeout(),
                ));
            }

            let len = match timeout(remaining, socket.recv(&mut buf)).await {
                Ok(Ok(len)) => len,
                Ok(Err(e)) => {
                    return Err(ResolverError::network_io(
                        format!("recv from {}", request.server),
                        e,
                    ));
                }
                Err(_) => {
                    return Err(ResolverError::timeout(
                        format!("query to {} for {}", request.server, pid.qname),
                        self.transport.network_timeout(),
                    ));
                }
            };
            let reply = &buf[..len];

            match pid.classify_reply(reply) {
                ReplyMatch::Match => {
                    let message = Message::from_vec(reply).map_err(|e| {
                        self.stats.record_server_parse_error();
                        ResolverError::parse(format!(
                            "reply from {}: {e}",
                            request.server
                        ))
                    })?;
                    return Ok(Exchange::from_message(message, started.elapsed()));
                }
                ReplyMatch::NearMiss => {
                    near_misses += 1;
                    trace!(
                        server = %request.server,
                        qname = %pid.qname,
                        near_misses,
                        "near-miss reply (id mismatch)"
                    );
                    if self.transport.spoof_nearmiss_max > 0
                        && near_misses > self.transport.spoof_nearmiss_max
                    {
                        warn!(
                            server = %request.server,
                            qname = %pid.qname,
                            near_misses,
                            "too many bogus answers, assuming spoof attempt"
                        );
                        self.stats.record_spoof_abort();
                        return Err(ResolverError::SpoofAttempt {
                            qname: pid.qname.clone(),
                            server: request.server,
                            near_misses,
                        });
                    }
                }
                ReplyMatch::MalformedFromServer => {
                    self.stats.record_server_parse_error();
                    return Err(ResolverError::parse(format!(
                        "unparseable reply from {}",
                        request.server
                    )));
                }
                ReplyMatch::Unexpected => {
                    self.stats.record_unexpected();
                    debug!(server = %request.server, "discarding unexpected packet");
                }
            }
        }
    }

    /// Owner-side dispatch: UDP, or the length-prefixed TCP fallback
    async fn exchange_owner(&self, request: &ExchangeRequest) -> Result<Exchange> {
        if request.tcp {
            let id: u16 = rand::thread_rng().gen();
            let packet = self.compose_query(request, id)?;
            self.stats.record_outquery();
            self.stats.record_tcp_outquery();
            let started = Instant::now();
            let reply = tcp::exchange(
                request.server,
                &packet,
                self.transport.network_timeout(),
            )
            .await?;

            let pid = PacketId::new(request.server, id, &request.qname, request.qtype);
            match pid.classify_reply(&reply) {
                ReplyMatch::Match => {
                    let message = Message::from_vec(&reply).map_err(|e| {
                        ResolverError::parse(format!("TCP reply from {}: {e}", request.server))
                    })?;
                    Ok(Exchange::from_message(message, started.elapsed()))
                }
                _ => Err(ResolverError::parse(format!(
                    "TCP reply from {} does not match the query",
                    request.server
                ))),
            }
        } else {
            self.exchange_udp(request).await
        }
    }
}

#[async_trait]
impl Exchanger for UdpExchanger {
    async fn exchange(&self, request: &ExchangeRequest) -> Result<Exchange> {
        // TCP fallbacks are rare and already deduplicated by their UDP
        // leg having been chained; only UDP flights register.
        if request.tcp {
            return self.exchange_owner(request).await;
        }

        let key = FlightKey {
            server: request.server,
            qname: crate::cache::canonical_name(&request.qname),
            qtype: request.qtype.into(),
        };

        match InflightTable::begin(&self.inflight, key) {
            FlightOutcome::Owner(guard) => {
                let outcome = self.exchange_owner(request).await;
                match &outcome {
                    Ok(exchange) => {
                        let resumed =
                            guard.publish(ChainedReply::Answer(Box::new(exchange.clone())));
                        for _ in 0..resumed {
                            self.stats.record_chain_resend();
                        }
                    }
                    Err(e) => {
                        guard.publish(ChainedReply::Failed(e.to_string()));
                    }
                }
                outcome
            }
            FlightOutcome::Chained(mut rx) => {
                let wait = timeout(self.transport.network_timeout(), rx.recv()).await;
                match wait {
                    Ok(Ok(ChainedReply::Answer(exchange))) => Ok(*exchange),
                    Ok(Ok(ChainedReply::Failed(reason))) => Err(ResolverError::network(format!(
                        "chained flight failed: {reason}"
                    ))),
                    Ok(Err(_)) => Err(ResolverError::network(
                        "chained flight abandoned by its owner",
                    )),
                    Err(_) => Err(ResolverError::timeout(
                        format!("chained wait on {}", request.server),
                        self.transport.network_timeout(),
                    )),
                }
            }
        }
    }
}

/// Draw a source port uniformly from the configured window, skipping the
/// avoid-set
pub fn pick_source_port<R: Rng>(config: &TransportConfig, rng: &mut R) -> u16 {
    loop {
        let port = rng.gen_range(config.udp_source_port_min..=config.udp_source_port_max);
        if !config.udp_source_port_avoid.contains(&port) {
            return port;
        }
    }
}
