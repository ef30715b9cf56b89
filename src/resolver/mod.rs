//! The iterative resolution engine
//!
//! Given a question, walk the DNS hierarchy from the deepest cached zone
//! cut (bootstrapping from the root hints when the cache is cold) down to
//! an authoritative server, classifying every reply as an answer, a CNAME
//! to chase, a referral to follow, a proof of non-existence, or a failure
//! that moves on to the next candidate server.
//!
//! The walk is budgeted three ways: outgoing queries (`max_qperq`), wall
//! clock (`max_total_msec`), and recursion depth (`max_recursion_depth`,
//! shared between CNAME chases and nested nameserver-address
//! resolutions). Exceeding any budget surfaces as SERVFAIL.
//!
//! Everything the engine needs is handed in through [`ResolverEnv`]:
//! caches, per-server state, the outbound [`Exchanger`], the DNSSEC
//! validator, and statistics. Tests exercise the whole state machine by
//! injecting a mock exchanger.

pub mod hints;
pub mod throttle;
pub mod validate;

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use ipnet::IpNet;
use tracing::{debug, trace, warn};

use crate::cache::{canonical_name, classify_negative, NegativeEntry, NegativeKind, ResolverCaches, RrsetInsert};
use crate::config::{Config, DnssecMode};
use crate::error::{Budget as BudgetKind, ResolverError, Result};
use crate::stats::ResolverStats;
use crate::transport::{Exchange, ExchangeRequest, Exchanger};
use crate::wire::ecs::ClientSubnet;

use hints::RootHints;
use throttle::{EdnsMode, ServerState};
use validate::{ChainFetcher, ValidationRequest, ValidationState, Validator};

/// Everything a resolver instance depends on
#[derive(Clone)]
pub struct ResolverEnv {
    /// Full configuration
    pub config: Arc<Config>,
    /// Record + negative caches
    pub caches: Arc<ResolverCaches>,
    /// Throttle, speed and EDNS state
    pub servers: Arc<ServerState>,
    /// The outbound transport
    pub exchanger: Arc<dyn Exchanger>,
    /// The DNSSEC boundary
    pub validator: Arc<dyn Validator>,
    /// Global statistics
    pub stats: Arc<ResolverStats>,
    /// The root hint set
    pub hints: Arc<RootHints>,
}

impl std::fmt::Debug for ResolverEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverEnv").finish_non_exhaustive()
    }
}

/// One client question, decorated with its client context
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    /// The question name
    pub qname: Name,
    /// The question type
    pub qtype: RecordType,
    /// The asking client, for ECS-scoped cache matching
    pub client: Option<IpAddr>,
    /// The ECS option to forward to whitelisted authorities
    pub ecs: Option<ClientSubnet>,
    /// What the client signalled about DNSSEC
    pub validation: ValidationRequest,
}

impl ResolveRequest {
    /// A plain request with no client context
    #[must_use]
    pub fn new(qname: Name, qtype: RecordType) -> Self {
        Self {
            qname,
            qtype,
            client: None,
            ecs: None,
            validation: ValidationRequest {
                dnssec_ok: false,
                ad_requested: false,
            },
        }
    }
}

/// What a resolution produced
#[derive(Debug, Clone, Default)]
pub struct ResolveOutcome {
    /// Response code for the client
    pub rcode: u16,
    /// Answer section
    pub answers: Vec<Record>,
    /// Authority section (the SOA of negative answers)
    pub authorities: Vec<Record>,
    /// Additional section
    pub additionals: Vec<Record>,
    /// RRSIGs covering the records above, for clients that set DO
    pub sigs: Vec<Record>,
    /// Combined validation state of everything above
    pub state: ValidationState,
}

impl ResolveOutcome {
    /// The all-purpose failure outcome
    #[must_use]
    pub fn servfail() -> Self {
        Self {
            rcode: 2,
            ..Self::default()
        }
    }
}

/// Per-client-query spending record
#[derive(Debug)]
struct QueryBudget {
    started: Instant,
    outqueries: AtomicU32,
}

impl QueryBudget {
    fn new(started: Instant) -> Self {
        Self {
            started,
            outqueries: AtomicU32::new(0),
        }
    }

    fn spend_outquery(&self, max: u32) -> bool {
        self.outqueries.fetch_add(1, Ordering::Relaxed) + 1 <= max
    }
}

/// Internal resolution context threaded through the walk
#[derive(Debug, Clone)]
struct ResolveCtx {
    client: Option<IpAddr>,
    ecs: Option<ClientSubnet>,
    validate: bool,
}

/// How one reply moves the state machine
#[derive(Debug)]
enum ReplyClass {
    /// Records answering `(final_name, qtype)`, CNAME chain included
    Answer { records: Vec<Record> },
    /// A CNAME chain that ends without the final answer
    Cname { chain: Vec<Record>, target: Name },
    /// NS records delegating a deeper zone
    Referral { zone: Name },
    /// A proof of non-existence
    Negative {
        kind: NegativeKind,
        soa: Option<Record>,
    },
    /// None of the above; the server is useless for this question
    Lame,
}

type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<ResolveOutcome>> + Send + 'a>>;

/// The resolver core
#[derive(Debug, Clone)]
pub struct IterativeResolver {
    env: ResolverEnv,
}

impl IterativeResolver {
    /// Create a resolver over its environment
    #[must_use]
    pub fn new(env: ResolverEnv) -> Self {
        Self { env }
    }

    /// The environment (exposed for the server loop and tests)
    #[must_use]
    pub fn env(&self) -> &ResolverEnv {
        &self.env
    }

    /// Resolve one client question end to end
    ///
    /// # Errors
    ///
    /// Budget violations, spoof aborts and hard validation failures come
    /// back as errors; the handler maps each to its RCODE. Ordinary
    /// resolution dead-ends come back as `Ok` with RCODE SERVFAIL.
    pub async fn resolve(&self, request: &ResolveRequest) -> Result<ResolveOutcome> {
        let budget = QueryBudget::new(Instant::now());
        let ctx = ResolveCtx {
            client: request.client,
            ecs: request.ecs.clone(),
            validate: self.env.config.dnssec.validates()
                && request.validation.wants_validation(self.env.config.dnssec),
        };

        let outcome = self
            .resolve_step(request.qname.clone(), request.qtype, 0, 0, &budget, &ctx)
            .await?;

        let state = validate::apply_policy(
            outcome.state,
            self.env.config.dnssec,
            request.validation,
            &request.qname,
        )?;
        Ok(ResolveOutcome { state, ..outcome })
    }

    /// Re-prime the root NS set from a live root server
    ///
    /// # Errors
    ///
    /// Propagates the underlying resolution failure.
    pub async fn refresh_root(&self) -> Result<()> {
        self.env.caches.records.wipe(".", false);
        let request = ResolveRequest::new(Name::root(), RecordType::NS);
        self.resolve(&request).await?;
        self.env.stats.record_root_refresh();
        Ok(())
    }

    /// One step of the state machine, boxed for recursion
    fn resolve_step<'a>(
        &'a self,
        qname: Name,
        qtype: RecordType,
        depth: u32,
        chase: u32,
        budget: &'a QueryBudget,
        ctx: &'a ResolveCtx,
    ) -> StepFuture<'a> {
        Box::pin(async move {
            let limits = &self.env.config.resolution;
            let now = Instant::now();
            if now.saturating_duration_since(budget.started) > limits.total_budget() {
                return Err(ResolverError::limit(BudgetKind::WallClock, qname.to_string()));
            }
            if depth > limits.max_recursion_depth {
                return Err(ResolverError::limit(BudgetKind::Depth, qname.to_string()));
            }

            // ConsultCaches
            if let Some(outcome) = self.consult_caches(&qname, qtype, chase, depth, budget, ctx, now).await? {
                return Ok(outcome);
            }

            // ChooseZoneCut
            let (mut cut, mut ns_names) = self.best_ns(&qname, now);
            trace!(qname = %qname, cut = %cut, "starting walk");

            loop {
                let now = Instant::now();
                if now.saturating_duration_since(budget.started) > limits.total_budget() {
                    return Err(ResolverError::limit(BudgetKind::WallClock, qname.to_string()));
                }

                // PickNameserver
                let addrs = self
                    .nameserver_addresses(&cut, &ns_names, &qname, depth, budget, ctx)
                    .await;
                let key_name = canonical_name(&qname);
                let qtype_u16: u16 = qtype.into();
                let candidates: Vec<IpAddr> = self.env.servers.rank(
                    addrs
                        .into_iter()
                        .filter(|addr| !self.blocked_by_dont_query(*addr))
                        .filter(|addr| {
                            !self.env.servers.is_throttled(*addr, &key_name, qtype_u16, now)
                        })
                        .collect(),
                );
                if candidates.is_empty() {
                    debug!(cut = %cut, qname = %qname, "no reachable nameserver at zone cut");
                    return Ok(ResolveOutcome::servfail());
                }

                // DispatchQuery over the ranked candidates
                let mut referral: Option<(Name, Vec<Name>)> = None;
                for server in candidates {
                    let exchange = match self.ask_server(server, &qname, qtype, budget, ctx).await {
                        Ok(exchange) => exchange,
                        Err(e) if matches!(e, ResolverError::SpoofAttempt { .. }) => {
                            return Err(e);
                        }
                        Err(e) if matches!(e, ResolverError::LimitExceeded { .. }) => {
                            return Err(e);
                        }
                        Err(e) => {
                            if e.counts_against_server() {
                                self.env.servers.record_failure(server, Instant::now());
                            }
                            debug!(server = %server, error = %e, "exchange failed, next candidate");
                            continue;
                        }
                    };

                    // ClassifyReply
                    match self
                        .handle_reply(server, exchange, &qname, qtype, &cut, depth, chase, budget, ctx)
                        .await?
                    {
                        StepResult::Done(outcome) => return Ok(outcome),
                        StepResult::Referral { zone, ns_names: names } => {
                            referral = Some((zone, names));
                            break;
                        }
                        StepResult::NextServer => continue,
                    }
                }

                match referral.take() {
                    Some((zone, names)) => {
                        cut = zone;
                        ns_names = names;
                    }
                    // every candidate at this cut failed
                    None => return Ok(ResolveOutcome::servfail()),
                }
            }
        })
    }

    /// Record-cache, CNAME and negative-cache consultation
    #[allow(clippy::too_many_arguments)]
    async fn consult_caches(
        &self,
        qname: &Name,
        qtype: RecordType,
        chase: u32,
        depth: u32,
        budget: &QueryBudget,
        ctx: &ResolveCtx,
        now: Instant,
    ) -> Result<Option<ResolveOutcome>> {
        let caches = &self.env.caches;
        let key_name = canonical_name(qname);
        let qtype_u16: u16 = qtype.into();

        if qtype_u16 == crate::cache::QTYPE_ANY {
            let sets = caches.records.lookup_any(&key_name, ctx.client, now);
            if !sets.is_empty() {
                let mut state = ValidationState::Indeterminate;
                let mut answers = Vec::new();
                let mut sigs = Vec::new();
                let mut first = true;
                for set in sets {
                    state = if first { set.state } else { state.combine(set.state) };
                    first = false;
                    answers.extend(set.records_at(now));
                    sigs.extend(set.sigs.clone());
                }
                return Ok(Some(ResolveOutcome {
                    rcode: 0,
                    answers,
                    sigs,
                    state,
                    ..ResolveOutcome::default()
                }));
            }
        } else if let Some(hit) = caches.records.lookup(&key_name, qtype_u16, ctx.client, now) {
            return Ok(Some(ResolveOutcome {
                rcode: 0,
                answers: hit.records_at(now),
                sigs: hit.sigs.clone(),
                state: hit.state,
                ..ResolveOutcome::default()
            }));
        }

        if qtype != RecordType::CNAME && qtype_u16 != crate::cache::QTYPE_ANY {
            if let Some(cname_set) =
                caches.records.lookup(&key_name, RecordType::CNAME.into(), ctx.client, now)
            {
                if let Some(target) = cname_set
                    .records
                    .first()
                    .and_then(|r| r.data())
                    .and_then(RData::as_cname)
                    .map(|c| c.0.clone())
                {
                    let chain = cname_set.records_at(now);
                    let outcome = self
                        .chase(chain, cname_set.state, target, qtype, depth, chase, budget, ctx)
                        .await?;
                    return Ok(Some(outcome));
                }
            }
        }

        if let Some(neg) = caches.negative.lookup(&key_name, qtype_u16, now) {
            return Ok(Some(Self::negative_outcome(&neg, now)));
        }

        Ok(None)
    }

    /// Continue resolution at a CNAME target, prepending the chain
    #[allow(clippy::too_many_arguments)]
    async fn chase(
        &self,
        chain: Vec<Record>,
        chain_state: ValidationState,
        target: Name,
        qtype: RecordType,
        depth: u32,
        chase: u32,
        budget: &QueryBudget,
        ctx: &ResolveCtx,
    ) -> Result<ResolveOutcome> {
        let limits = &self.env.config.resolution;
        if chase + 1 > limits.max_cname_chases {
            warn!(target = %target, chase, "CNAME chain too long");
            return Err(ResolverError::limit(BudgetKind::CnameChain, target.to_string()));
        }

        let tail = self
            .resolve_step(target, qtype, depth + 1, chase + 1, budget, ctx)
            .await?;
        let mut answers = chain;
        answers.extend(tail.answers);
        Ok(ResolveOutcome {
            rcode: tail.rcode,
            answers,
            authorities: tail.authorities,
            additionals: tail.additionals,
            sigs: tail.sigs,
            state: chain_state.combine(tail.state),
        })
    }

    /// Walk from `qname` up to the deepest cached NS set; prime the root
    /// hints when nothing at all is cached
    fn best_ns(&self, qname: &Name, now: Instant) -> (Name, Vec<Name>) {
        let caches = &self.env.caches;
        let mut cursor = qname.clone();
        loop {
            let key = canonical_name(&cursor);
            if let Some(set) = caches.records.lookup(&key, RecordType::NS.into(), None, now) {
                let names = ns_target_names(&set.records);
                if !names.is_empty() {
                    return (cursor, names);
                }
            }
            if cursor.is_root() {
                break;
            }
            cursor = cursor.base_name();
        }

        // Cold cache: prime and restart from the root.
        self.env.hints.prime(caches, now);
        self.env.servers.set_roots(self.env.hints.all_addrs());
        let names = self.env.hints.servers().iter().map(|h| h.name.clone()).collect();
        (Name::root(), names)
    }

    /// Addresses for a zone cut's NS names: cached or glue first,
    /// recursively resolved when nothing is at hand
    async fn nameserver_addresses(
        &self,
        cut: &Name,
        ns_names: &[Name],
        qname: &Name,
        depth: u32,
        budget: &QueryBudget,
        ctx: &ResolveCtx,
    ) -> Vec<IpAddr> {
        let now = Instant::now();
        let caches = &self.env.caches;
        let mut addrs = Vec::new();
        let mut uncached = Vec::new();

        for ns in ns_names {
            let key = canonical_name(ns);
            let mut found = false;
            for rtype in [RecordType::A, RecordType::AAAA] {
                if let Some(set) = caches.records.lookup(&key, rtype.into(), None, now) {
                    addrs.extend(record_addrs(&set.records));
                    found = true;
                }
            }
            if !found {
                uncached.push(ns.clone());
            }
        }

        if addrs.is_empty() {
            // Glueless cut: resolve a couple of NS names out of band. A
            // nameserver named inside the very name under resolution is
            // skipped; asking it for its own address goes nowhere.
            let fallback_ctx = ResolveCtx {
                ecs: None,
                ..ctx.clone()
            };
            for ns in uncached.into_iter().filter(|ns| ns != qname).take(2) {
                match self
                    .resolve_step(ns.clone(), RecordType::A, depth + 1, 0, budget, &fallback_ctx)
                    .await
                {
                    Ok(outcome) if outcome.rcode == 0 => {
                        addrs.extend(record_addrs(&outcome.answers));
                        if !addrs.is_empty() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(ns = %ns, cut = %cut, error = %e, "nameserver address resolution failed");
                    }
                }
            }
        }

        addrs.sort_unstable();
        addrs.dedup();
        addrs
    }

    /// Whether egress to `addr` is forbidden
    fn blocked_by_dont_query(&self, addr: IpAddr) -> bool {
        self.env
            .config
            .dont_query
            .iter()
            .any(|net| net.contains(&addr))
    }

    /// One server conversation: EDNS probe handling and TC fallback
    async fn ask_server(
        &self,
        server: IpAddr,
        qname: &Name,
        qtype: RecordType,
        budget: &QueryBudget,
        ctx: &ResolveCtx,
    ) -> Result<Exchange> {
        let limits = &self.env.config.resolution;
        let target = SocketAddr::new(server, 53);
        let now = Instant::now();

        let mut request = ExchangeRequest::new(target, qname.clone(), qtype);
        request.dnssec_ok = self.env.config.dnssec != DnssecMode::Off;
        if self.env.servers.edns_mode(server, now) == EdnsMode::NoEdns {
            request = request.without_edns();
        } else if ctx.ecs.is_some() && self.env.config.edns.forwards_ecs_to(server) {
            request.ecs = ctx.ecs.clone();
        }

        if !budget.spend_outquery(limits.max_qperq) {
            self.env.stats.record_qperq_limit();
            return Err(ResolverError::limit(BudgetKind::OutQueries, qname.to_string()));
        }
        let mut exchange = self.env.exchanger.exchange(&request).await?;

        // NoEDNS fallback: FORMERR/NOTIMP answering an EDNS probe
        if request.edns && matches!(exchange.rcode, 1 | 4) {
            debug!(server = %server, rcode = exchange.rcode, "EDNS probe rejected, retrying without OPT");
            self.env
                .servers
                .set_edns_mode(server, EdnsMode::NoEdns, Instant::now());
            if !budget.spend_outquery(limits.max_qperq) {
                self.env.stats.record_qperq_limit();
                return Err(ResolverError::limit(BudgetKind::OutQueries, qname.to_string()));
            }
            request = request.without_edns();
            exchange = self.env.exchanger.exchange(&request).await?;
        } else if request.edns && exchange.have_edns {
            self.env
                .servers
                .set_edns_mode(server, EdnsMode::EdnsOk, Instant::now());
        }

        // TC fallback: same query, length-prefixed over TCP
        if exchange.tc {
            debug!(server = %server, "truncated reply, retrying over TCP");
            if !budget.spend_outquery(limits.max_qperq) {
                self.env.stats.record_qperq_limit();
                return Err(ResolverError::limit(BudgetKind::OutQueries, qname.to_string()));
            }
            exchange = self.env.exchanger.exchange(&request.over_tcp()).await?;
        }

        // Success is not recorded here: a reply is only a success once
        // handle_reply has ruled out SERVFAIL, rejections and lameness,
        // otherwise a server that answers every query with SERVFAIL would
        // wipe its fail window on every round trip and never be benched.
        Ok(exchange)
    }

    /// Classify one reply and perform its caching side effects
    #[allow(clippy::too_many_arguments)]
    async fn handle_reply(
        &self,
        server: IpAddr,
        exchange: Exchange,
        qname: &Name,
        qtype: RecordType,
        cut: &Name,
        depth: u32,
        chase: u32,
        budget: &QueryBudget,
        ctx: &ResolveCtx,
    ) -> Result<StepResult> {
        let now = Instant::now();
        let key_name = canonical_name(qname);
        let qtype_u16: u16 = qtype.into();

        // ProtocolReject and upstream SERVFAIL: unusable server, move on
        match exchange.rcode {
            5 | 9 => {
                self.env.servers.record_failure(server, now);
                debug!(server = %server, rcode = exchange.rcode, "server rejected the query");
                return Ok(StepResult::NextServer);
            }
            2 => {
                self.env.servers.record_failure(server, now);
                self.env.servers.throttle_question(
                    server,
                    &key_name,
                    qtype_u16,
                    Duration::from_secs(60),
                    "upstream servfail",
                    now,
                );
                return Ok(StepResult::NextServer);
            }
            _ => {}
        }

        let class = classify_reply(&exchange, qname, qtype, cut);
        if !matches!(class, ReplyClass::Lame) {
            self.env.servers.record_success(server, exchange.rtt);
        }

        match class {
            ReplyClass::Answer { records } => {
                let state = self
                    .cache_answer_sets(&exchange, &records, ctx, now)
                    .await;
                self.cache_authority_sets(&exchange, cut, now);
                let sigs = sig_records(&exchange.answers);
                Ok(StepResult::Done(ResolveOutcome {
                    rcode: 0,
                    answers: records,
                    sigs,
                    state,
                    ..ResolveOutcome::default()
                }))
            }
            ReplyClass::Cname { chain, target } => {
                let state = self.cache_answer_sets(&exchange, &chain, ctx, now).await;
                let outcome = self
                    .chase(chain, state, target, qtype, depth, chase, budget, ctx)
                    .await?;
                Ok(StepResult::Done(outcome))
            }
            ReplyClass::Referral { zone } => {
                let names = self.cache_referral(&exchange, &zone, now);
                trace!(zone = %zone, servers = names.len(), "following referral");
                Ok(StepResult::Referral {
                    zone,
                    ns_names: names,
                })
            }
            ReplyClass::Negative { kind, soa } => {
                let state = if ctx.validate {
                    // Denial proofs validate through the same chain walk.
                    let denial: Vec<Record> = exchange
                        .authorities
                        .iter()
                        .filter(|r| {
                            matches!(r.record_type(), RecordType::NSEC | RecordType::NSEC3)
                        })
                        .cloned()
                        .collect();
                    let sigs = sig_records(&exchange.authorities);
                    self.env
                        .validator
                        .validate(qname, &denial, &sigs, self)
                        .await
                } else {
                    ValidationState::Indeterminate
                };

                let blanket = kind == NegativeKind::NxDomain;
                self.env.caches.store_negative(
                    &key_name,
                    if blanket { None } else { Some(qtype_u16) },
                    kind,
                    soa.clone(),
                    state,
                    now,
                );
                let rcode = match kind {
                    NegativeKind::NxDomain => 3,
                    NegativeKind::NoData => 0,
                };
                let authorities: Vec<Record> = exchange
                    .authorities
                    .iter()
                    .filter(|r| r.record_type() != RecordType::RRSIG)
                    .cloned()
                    .collect();
                let sigs = sig_records(&exchange.authorities);
                Ok(StepResult::Done(ResolveOutcome {
                    rcode,
                    authorities,
                    sigs,
                    state,
                    ..ResolveOutcome::default()
                }))
            }
            ReplyClass::Lame => {
                self.env.servers.record_failure(server, now);
                self.env.servers.throttle_question(
                    server,
                    &key_name,
                    qtype_u16,
                    Duration::from_secs(60),
                    "lame response",
                    now,
                );
                debug!(server = %server, qname = %qname, "lame response");
                Ok(StepResult::NextServer)
            }
        }
    }

    /// Cache the answer-section RRsets of a reply, validating when asked;
    /// returns the combined validation state
    async fn cache_answer_sets(
        &self,
        exchange: &Exchange,
        records: &[Record],
        ctx: &ResolveCtx,
        now: Instant,
    ) -> ValidationState {
        let scope = answer_scope(exchange);
        let sigs = sig_records(&exchange.answers);
        let mut combined: Option<ValidationState> = None;

        for ((owner, rtype), set) in group_rrsets(records) {
            let set_sigs: Vec<Record> = sigs
                .iter()
                .filter(|s| {
                    canonical_name(s.name()) == owner
                        && rrsig_type_covered(s) == Some(rtype)
                })
                .cloned()
                .collect();

            let state = if ctx.validate {
                let owner_name = set
                    .first()
                    .map_or_else(Name::root, |r| r.name().clone());
                self.env
                    .validator
                    .validate(&owner_name, &set, &set_sigs, self)
                    .await
            } else {
                ValidationState::Indeterminate
            };
            combined = Some(match combined {
                Some(existing) => existing.combine(state),
                None => state,
            });

            let ttl = set.iter().map(Record::ttl).min().unwrap_or(0);
            let mut insert = RrsetInsert::auth(set, ttl)
                .with_sigs(set_sigs)
                .with_state(state);
            insert.auth = exchange.aa;
            if let Some(net) = scope {
                insert = insert.with_scope(net);
            }
            self.env.caches.store_positive(&owner, rtype, insert, now);
        }

        combined.unwrap_or_default()
    }

    /// Cache NS/glue data arriving alongside an answer
    fn cache_authority_sets(&self, exchange: &Exchange, cut: &Name, now: Instant) {
        for ((owner, rtype), set) in group_rrsets(&exchange.authorities) {
            if rtype != u16::from(RecordType::NS) {
                continue;
            }
            if let Some(first) = set.first() {
                if cut.zone_of(first.name()) {
                    let ttl = set.iter().map(Record::ttl).min().unwrap_or(0);
                    self.env.caches.store_positive(
                        &owner,
                        rtype,
                        RrsetInsert::additional(set, ttl),
                        now,
                    );
                }
            }
        }
    }

    /// Cache a referral's NS set and its glue; returns the NS names
    fn cache_referral(&self, exchange: &Exchange, zone: &Name, now: Instant) -> Vec<Name> {
        let zone_key = canonical_name(zone);
        let mut ns_names = Vec::new();

        let ns_records: Vec<Record> = exchange
            .authorities
            .iter()
            .filter(|r| r.record_type() == RecordType::NS && r.name() == zone)
            .cloned()
            .collect();
        ns_names.extend(ns_target_names(&ns_records));
        if !ns_records.is_empty() {
            let ttl = ns_records.iter().map(Record::ttl).min().unwrap_or(0);
            self.env.caches.store_positive(
                &zone_key,
                RecordType::NS.into(),
                RrsetInsert::additional(ns_records, ttl),
                now,
            );
        }

        // Glue: address records for the delegated zone's nameservers.
        for ((owner, rtype), set) in group_rrsets(&exchange.additionals) {
            let is_address =
                rtype == u16::from(RecordType::A) || rtype == u16::from(RecordType::AAAA);
            let for_ns = ns_names
                .iter()
                .any(|ns| canonical_name(ns) == owner);
            if is_address && for_ns {
                let ttl = set.iter().map(Record::ttl).min().unwrap_or(0);
                self.env.caches.store_positive(
                    &owner,
                    rtype,
                    RrsetInsert::additional(set, ttl),
                    now,
                );
            }
        }

        ns_names
    }

    /// Build an outcome from a cached proof of non-existence
    fn negative_outcome(neg: &NegativeEntry, now: Instant) -> ResolveOutcome {
        let rcode = match neg.kind {
            NegativeKind::NxDomain => 3,
            NegativeKind::NoData => 0,
        };
        let authorities = neg
            .soa
            .iter()
            .map(|soa| {
                let mut record = soa.clone();
                record.set_ttl(record.ttl().min(neg.remaining_ttl(now)));
                record
            })
            .collect();
        ResolveOutcome {
            rcode,
            authorities,
            state: neg.state,
            ..ResolveOutcome::default()
        }
    }
}

/// What one server conversation concluded
enum StepResult {
    Done(ResolveOutcome),
    Referral { zone: Name, ns_names: Vec<Name> },
    NextServer,
}

/// The DS/DNSKEY fetch callback: ordinary resolutions with validation off
#[async_trait]
impl ChainFetcher for IterativeResolver {
    async fn fetch(&self, name: &Name, rtype: RecordType) -> Result<(Vec<Record>, Vec<Record>)> {
        let budget = QueryBudget::new(Instant::now());
        let ctx = ResolveCtx {
            client: None,
            ecs: None,
            validate: false,
        };
        let outcome = self
            .resolve_step(name.clone(), rtype, 0, 0, &budget, &ctx)
            .await?;
        let sigs = sig_records(&outcome.answers);
        let records = outcome
            .answers
            .into_iter()
            .filter(|r| r.record_type() == rtype)
            .collect();
        Ok((records, sigs))
    }
}

// ============================================================================
// Reply classification helpers
// ============================================================================

/// Classify one reply against the current question and zone cut
fn classify_reply(exchange: &Exchange, qname: &Name, qtype: RecordType, cut: &Name) -> ReplyClass {
    // Follow any CNAME chain inside the answer section first. An ANY
    // question accepts whatever record types the server put at the name.
    let wildcard = u16::from(qtype) == crate::cache::QTYPE_ANY;
    let mut current = qname.clone();
    let mut chain: Vec<Record> = Vec::new();
    loop {
        let finals: Vec<Record> = exchange
            .answers
            .iter()
            .filter(|r| {
                r.name() == &current
                    && (r.record_type() == qtype
                        || (wildcard && r.record_type() != RecordType::RRSIG))
            })
            .cloned()
            .collect();
        if !finals.is_empty() {
            chain.extend(finals);
            return ReplyClass::Answer { records: chain };
        }

        let cname = exchange
            .answers
            .iter()
            .find(|r| r.record_type() == RecordType::CNAME && r.name() == &current);
        match cname {
            Some(record) => {
                let Some(target) = record.data().and_then(RData::as_cname).map(|c| c.0.clone())
                else {
                    return ReplyClass::Lame;
                };
                chain.push(record.clone());
                // a chain looping inside one reply is hostile nonsense
                if chain.len() > 32 {
                    return ReplyClass::Lame;
                }
                current = target;
            }
            None => break,
        }
    }

    if !chain.is_empty() {
        return ReplyClass::Cname {
            chain,
            target: current,
        };
    }

    if let Some((kind, soa)) =
        classify_negative(exchange.rcode, &exchange.answers, &exchange.authorities)
    {
        return ReplyClass::Negative { kind, soa };
    }

    // Referral: NS records delegating a zone deeper than the current cut
    // that still contains the question.
    if exchange.answers.is_empty() {
        let deeper = exchange
            .authorities
            .iter()
            .filter(|r| r.record_type() == RecordType::NS)
            .map(hickory_proto::rr::Record::name)
            .find(|zone| *zone != cut && cut.zone_of(zone) && zone.zone_of(qname));
        if let Some(zone) = deeper {
            return ReplyClass::Referral { zone: zone.clone() };
        }
    }

    ReplyClass::Lame
}

/// Group records into RRsets by canonical owner and type, signatures
/// excluded
fn group_rrsets(records: &[Record]) -> Vec<((String, u16), Vec<Record>)> {
    let mut out: Vec<((String, u16), Vec<Record>)> = Vec::new();
    for record in records {
        if record.record_type() == RecordType::RRSIG {
            continue;
        }
        let key = (canonical_name(record.name()), record.record_type().into());
        match out.iter_mut().find(|(k, _)| *k == key) {
            Some((_, set)) => set.push(record.clone()),
            None => out.push((key, vec![record.clone()])),
        }
    }
    out
}

/// The RRSIG records of a section
fn sig_records(records: &[Record]) -> Vec<Record> {
    records
        .iter()
        .filter(|r| r.record_type() == RecordType::RRSIG)
        .cloned()
        .collect()
}

/// The type-covered field of an RRSIG (first two RDATA octets)
fn rrsig_type_covered(record: &Record) -> Option<u16> {
    use hickory_proto::serialize::binary::BinEncodable;
    let bytes = record.data()?.to_bytes().ok()?;
    if bytes.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Target names of an NS RRset
fn ns_target_names(records: &[Record]) -> Vec<Name> {
    records
        .iter()
        .filter_map(|r| r.data().and_then(RData::as_ns).map(|ns| ns.0.clone()))
        .collect()
}

/// Addresses contained in A/AAAA records
fn record_addrs(records: &[Record]) -> Vec<IpAddr> {
    records
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

/// The cache scope of an answer: the returned ECS scope when it narrows
/// the audience, `None` for an answer good for everyone
fn answer_scope(exchange: &Exchange) -> Option<IpNet> {
    exchange
        .ecs
        .as_ref()
        .filter(|subnet| subnet.scope_prefix > 0)
        .and_then(|subnet| IpNet::new(subnet.padded_addr()?, subnet.scope_prefix).ok())
}
