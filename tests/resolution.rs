//! End-to-end resolution scenarios against a scripted transport
//!
//! The resolver core is exercised through a mock [`Exchanger`] that plays
//! the part of the whole public DNS: root, TLD and authoritative servers
//! are closures over `(server, question)`. Every test builds its own
//! little world and asserts on both the outcome and the outbound queries
//! the resolver actually spent.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::rr::rdata::{A, CNAME, NS, SOA};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};

use rust_recursor::resolver::hints::{RootHint, RootHints};
use rust_recursor::resolver::throttle::ServerState;
use rust_recursor::resolver::validate::NoopValidator;
use rust_recursor::transport::{Exchange, ExchangeRequest, Exchanger};
use rust_recursor::{
    Config, IterativeResolver, ResolveRequest, ResolverCaches, ResolverEnv, ResolverError,
    ResolverStats,
};

// ============================================================================
// World building
// ============================================================================

fn name(s: &str) -> Name {
    Name::from_str(s).unwrap()
}

fn record(owner: &str, rdata: RData, ttl: u32) -> Record {
    let rtype = rdata.record_type();
    let mut r = Record::new();
    r.set_name(name(owner));
    r.set_record_type(rtype);
    r.set_dns_class(DNSClass::IN);
    r.set_ttl(ttl);
    r.set_data(Some(rdata));
    r
}

fn a(owner: &str, addr: [u8; 4]) -> Record {
    record(owner, RData::A(A(addr.into())), 60)
}

fn ns(zone: &str, target: &str) -> Record {
    record(zone, RData::NS(NS(name(target))), 172_800)
}

fn soa(zone: &str) -> Record {
    record(
        zone,
        RData::SOA(SOA::new(
            name(&format!("ns1.{zone}")),
            name(&format!("hostmaster.{zone}")),
            1,
            7_200,
            900,
            1_209_600,
            300,
        )),
        3_600,
    )
}

fn answer(records: Vec<Record>) -> Exchange {
    Exchange {
        rcode: 0,
        aa: true,
        answers: records,
        rtt: Duration::from_millis(5),
        ..Exchange::default()
    }
}

fn referral(zone: &str, server_name: &str, glue: [u8; 4]) -> Exchange {
    Exchange {
        rcode: 0,
        aa: false,
        authorities: vec![ns(zone, server_name)],
        additionals: vec![a(server_name, glue)],
        rtt: Duration::from_millis(5),
        ..Exchange::default()
    }
}

fn nxdomain(zone: &str) -> Exchange {
    Exchange {
        rcode: 3,
        aa: true,
        authorities: vec![soa(zone)],
        rtt: Duration::from_millis(5),
        ..Exchange::default()
    }
}

type Script = dyn Fn(&ExchangeRequest) -> Option<Exchange> + Send + Sync;

/// Transport playing a scripted hierarchy; `None` from the script means
/// "this server never answers" (a timeout)
struct MockExchanger {
    script: Box<Script>,
    log: Mutex<Vec<ExchangeRequest>>,
}

impl std::fmt::Debug for MockExchanger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockExchanger").finish_non_exhaustive()
    }
}

impl MockExchanger {
    fn new(script: impl Fn(&ExchangeRequest) -> Option<Exchange> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            log: Mutex::new(Vec::new()),
        })
    }

    fn queries(&self) -> Vec<ExchangeRequest> {
        self.log.lock().unwrap().clone()
    }

    fn query_count(&self) -> usize {
        self.log.lock().unwrap().len()
    }
}

#[async_trait]
impl Exchanger for MockExchanger {
    async fn exchange(&self, request: &ExchangeRequest) -> rust_recursor::Result<Exchange> {
        self.log.lock().unwrap().push(request.clone());
        match (self.script)(request) {
            Some(exchange) => Ok(exchange),
            None => Err(ResolverError::timeout(
                format!("mock server {}", request.server),
                Duration::from_millis(10),
            )),
        }
    }
}

/// One root server called `test-root.invalid.` at 10.255.0.1
fn single_root_hints() -> RootHints {
    RootHints::from_servers(vec![RootHint {
        name: name("test-root.invalid."),
        addrs: vec!["10.255.0.1".parse().unwrap()],
    }])
}

const ROOT: &str = "10.255.0.1";

fn test_config() -> Config {
    let mut config = Config::default();
    // the scripted world lives in ranges the default egress filter blocks
    config.dont_query = Vec::new();
    config
}

struct TestSetup {
    resolver: IterativeResolver,
    exchanger: Arc<MockExchanger>,
    stats: Arc<ResolverStats>,
}

fn setup_with(config: Config, hints: RootHints, exchanger: Arc<MockExchanger>) -> TestSetup {
    let config = Arc::new(config);
    let stats = Arc::new(ResolverStats::new());
    let caches = Arc::new(ResolverCaches::new(&config));
    let servers = Arc::new(ServerState::new(config.throttle.clone()));

    let resolver = IterativeResolver::new(ResolverEnv {
        config,
        caches,
        servers,
        exchanger: exchanger.clone(),
        validator: Arc::new(NoopValidator),
        stats: Arc::clone(&stats),
        hints: Arc::new(hints),
    });
    TestSetup {
        resolver,
        exchanger,
        stats,
    }
}

fn setup(script: impl Fn(&ExchangeRequest) -> Option<Exchange> + Send + Sync + 'static) -> TestSetup {
    setup_with(test_config(), single_root_hints(), MockExchanger::new(script))
}

fn server_ip(request: &ExchangeRequest) -> IpAddr {
    request.server.ip()
}

// ============================================================================
// Root priming
// ============================================================================

#[tokio::test]
async fn primed_root_answers_root_ns_without_queries() {
    let setup = setup(|_| None);
    let env = setup.resolver.env();
    env.hints.prime(&env.caches, Instant::now());

    let outcome = setup
        .resolver
        .resolve(&ResolveRequest::new(Name::root(), RecordType::NS))
        .await
        .unwrap();

    assert_eq!(outcome.rcode, 0);
    assert_eq!(outcome.answers.len(), 1);
    assert_eq!(setup.exchanger.query_count(), 0);
}

#[tokio::test]
async fn cold_cache_bootstraps_from_hints() {
    let setup = setup(|request| {
        if request.qname == Name::root() && request.qtype == RecordType::NS {
            Some(answer(vec![
                ns(".", "test-root.invalid."),
                // address rides along in the answer section like a real
                // priming response carries it in additional
            ]))
        } else {
            None
        }
    });

    let outcome = setup
        .resolver
        .resolve(&ResolveRequest::new(Name::root(), RecordType::NS))
        .await
        .unwrap();

    assert_eq!(outcome.rcode, 0);
    assert!(setup.exchanger.query_count() >= 1);
    assert_eq!(
        server_ip(&setup.exchanger.queries()[0]),
        ROOT.parse::<IpAddr>().unwrap()
    );
}

// ============================================================================
// The full delegation walk
// ============================================================================

fn three_tier_script(request: &ExchangeRequest) -> Option<Exchange> {
    const TLD: &str = "10.255.1.1";
    const AUTH: &str = "10.255.2.1";
    match request.server.ip().to_string().as_str() {
        ROOT => Some(referral("com.", "a.gtld.invalid.", [10, 255, 1, 1])),
        TLD => Some(referral("example.com.", "ns1.example.com.", [10, 255, 2, 1])),
        AUTH => {
            if request.qname == name("www.example.com.") && request.qtype == RecordType::A {
                Some(answer(vec![a("www.example.com.", [203, 0, 113, 80])]))
            } else {
                Some(nxdomain("example.com."))
            }
        }
        _ => None,
    }
}

#[tokio::test]
async fn walks_root_tld_auth_and_caches() {
    let setup = setup(three_tier_script);

    let outcome = setup
        .resolver
        .resolve(&ResolveRequest::new(name("www.example.com."), RecordType::A))
        .await
        .unwrap();

    assert_eq!(outcome.rcode, 0);
    assert_eq!(outcome.answers.len(), 1);

    // one query per tier: root referral, TLD referral, authoritative answer
    let servers: Vec<String> = setup
        .exchanger
        .queries()
        .iter()
        .map(|q| q.server.ip().to_string())
        .collect();
    assert_eq!(servers, vec!["10.255.0.1", "10.255.1.1", "10.255.2.1"]);

    // the second identical question is served from cache
    let before = setup.exchanger.query_count();
    let again = setup
        .resolver
        .resolve(&ResolveRequest::new(name("www.example.com."), RecordType::A))
        .await
        .unwrap();
    assert_eq!(again.rcode, 0);
    assert_eq!(setup.exchanger.query_count(), before);

    // so is a sibling name: the delegation chain is already known
    let sibling = setup
        .resolver
        .resolve(&ResolveRequest::new(name("mail.example.com."), RecordType::A))
        .await
        .unwrap();
    assert_eq!(sibling.rcode, 3);
    let sibling_servers: Vec<String> = setup.exchanger.queries()[before..]
        .iter()
        .map(|q| q.server.ip().to_string())
        .collect();
    assert_eq!(sibling_servers, vec!["10.255.2.1"]);
}

// ============================================================================
// EDNS fallback
// ============================================================================

#[tokio::test]
async fn edns_formerr_falls_back_and_is_remembered() {
    let with_edns = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let without_edns = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let with_clone = Arc::clone(&with_edns);
    let without_clone = Arc::clone(&without_edns);

    let setup = setup(move |request| {
        if request.edns {
            with_clone.fetch_add(1, Ordering::SeqCst);
            return Some(Exchange {
                rcode: 1, // FORMERR
                rtt: Duration::from_millis(2),
                ..Exchange::default()
            });
        }
        without_clone.fetch_add(1, Ordering::SeqCst);
        if request.qtype == RecordType::A {
            Some(answer(vec![a(&request.qname.to_ascii(), [203, 0, 113, 1])]))
        } else {
            None
        }
    });

    let outcome = setup
        .resolver
        .resolve(&ResolveRequest::new(name("one.example.com."), RecordType::A))
        .await
        .unwrap();
    assert_eq!(outcome.rcode, 0);
    assert_eq!(with_edns.load(Ordering::SeqCst), 1);
    assert_eq!(without_edns.load(Ordering::SeqCst), 1);

    // the verdict sticks: the next query skips the OPT probe entirely
    setup
        .resolver
        .resolve(&ResolveRequest::new(name("two.example.com."), RecordType::A))
        .await
        .unwrap();
    assert_eq!(with_edns.load(Ordering::SeqCst), 1);
    assert_eq!(without_edns.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn edns_notimp_falls_back_too() {
    let setup = setup(|request| {
        if request.edns {
            Some(Exchange {
                rcode: 4, // NOTIMP
                rtt: Duration::from_millis(2),
                ..Exchange::default()
            })
        } else {
            Some(answer(vec![a(&request.qname.to_ascii(), [203, 0, 113, 2])]))
        }
    });

    let outcome = setup
        .resolver
        .resolve(&ResolveRequest::new(name("host.example.com."), RecordType::A))
        .await
        .unwrap();
    assert_eq!(outcome.rcode, 0);

    let queries = setup.exchanger.queries();
    assert_eq!(queries.len(), 2);
    assert!(queries[0].edns);
    assert!(!queries[1].edns);
}

// ============================================================================
// TC fallback
// ============================================================================

#[tokio::test]
async fn truncated_udp_reply_retries_over_tcp() {
    let setup = setup(|request| {
        if request.tcp {
            Some(answer(vec![a("big.example.com.", [203, 0, 113, 3])]))
        } else {
            Some(Exchange {
                rcode: 0,
                tc: true,
                rtt: Duration::from_millis(2),
                ..Exchange::default()
            })
        }
    });

    let outcome = setup
        .resolver
        .resolve(&ResolveRequest::new(name("big.example.com."), RecordType::A))
        .await
        .unwrap();
    assert_eq!(outcome.rcode, 0);
    assert_eq!(outcome.answers.len(), 1);

    let queries = setup.exchanger.queries();
    assert_eq!(queries.len(), 2);
    assert!(!queries[0].tcp);
    assert!(queries[1].tcp);
}

// ============================================================================
// CNAME handling
// ============================================================================

#[tokio::test]
async fn dangling_cname_is_chased() {
    let setup = setup(|request| {
        if request.qname == name("www.example.com.") {
            Some(answer(vec![record(
                "www.example.com.",
                RData::CNAME(CNAME(name("cdn.example.net."))),
                60,
            )]))
        } else if request.qname == name("cdn.example.net.") {
            Some(answer(vec![a("cdn.example.net.", [203, 0, 113, 9])]))
        } else {
            None
        }
    });

    let outcome = setup
        .resolver
        .resolve(&ResolveRequest::new(name("www.example.com."), RecordType::A))
        .await
        .unwrap();

    assert_eq!(outcome.rcode, 0);
    assert_eq!(outcome.answers.len(), 2);
    assert_eq!(outcome.answers[0].record_type(), RecordType::CNAME);
    assert_eq!(outcome.answers[1].record_type(), RecordType::A);
}

#[tokio::test]
async fn cname_loop_fails_within_budget() {
    let setup = setup(|request| {
        if request.qname == name("a.example.") {
            Some(answer(vec![record(
                "a.example.",
                RData::CNAME(CNAME(name("b.example."))),
                60,
            )]))
        } else if request.qname == name("b.example.") {
            Some(answer(vec![record(
                "b.example.",
                RData::CNAME(CNAME(name("a.example."))),
                60,
            )]))
        } else {
            None
        }
    });

    let result = setup
        .resolver
        .resolve(&ResolveRequest::new(name("a.example."), RecordType::A))
        .await;

    assert!(matches!(
        result,
        Err(ResolverError::LimitExceeded { .. })
    ));
    assert!(setup.exchanger.query_count() <= 50);
}

// ============================================================================
// Negative caching
// ============================================================================

#[tokio::test]
async fn nxdomain_is_cached_with_its_proof() {
    let setup = setup(|_| Some(nxdomain("example.com.")));

    let outcome = setup
        .resolver
        .resolve(&ResolveRequest::new(name("gone.example.com."), RecordType::A))
        .await
        .unwrap();
    assert_eq!(outcome.rcode, 3);
    assert!(outcome
        .authorities
        .iter()
        .any(|r| r.record_type() == RecordType::SOA));

    // a second query for any type hits the blanket negative entry
    let before = setup.exchanger.query_count();
    let again = setup
        .resolver
        .resolve(&ResolveRequest::new(name("gone.example.com."), RecordType::AAAA))
        .await
        .unwrap();
    assert_eq!(again.rcode, 3);
    assert_eq!(setup.exchanger.query_count(), before);
}

#[tokio::test]
async fn nodata_is_per_type() {
    let setup = setup(|request| {
        if request.qtype == RecordType::AAAA {
            Some(Exchange {
                rcode: 0,
                aa: true,
                authorities: vec![soa("example.com.")],
                rtt: Duration::from_millis(2),
                ..Exchange::default()
            })
        } else {
            Some(answer(vec![a("dual.example.com.", [203, 0, 113, 4])]))
        }
    });

    let no_aaaa = setup
        .resolver
        .resolve(&ResolveRequest::new(name("dual.example.com."), RecordType::AAAA))
        .await
        .unwrap();
    assert_eq!(no_aaaa.rcode, 0);
    assert!(no_aaaa.answers.is_empty());

    // the NODATA for AAAA must not blanket the A lookup
    let has_a = setup
        .resolver
        .resolve(&ResolveRequest::new(name("dual.example.com."), RecordType::A))
        .await
        .unwrap();
    assert_eq!(has_a.answers.len(), 1);
}

// ============================================================================
// Throttling and failure handling
// ============================================================================

#[tokio::test]
async fn dead_server_is_skipped_after_enough_failures() {
    const DEAD: &str = "10.255.3.1";
    const ALIVE: &str = "10.255.3.2";

    let hints = RootHints::from_servers(vec![
        RootHint {
            name: name("dead.invalid."),
            addrs: vec![DEAD.parse().unwrap()],
        },
        RootHint {
            name: name("alive.invalid."),
            addrs: vec![ALIVE.parse().unwrap()],
        },
    ]);
    let mut config = test_config();
    config.throttle.server_down_max_fails = 2;

    let exchanger = MockExchanger::new(move |request| {
        if request.server.ip().to_string() == DEAD {
            None // timeout, forever
        } else {
            Some(answer(vec![a(&request.qname.to_ascii(), [203, 0, 113, 5])]))
        }
    });
    let setup = setup_with(config, hints, exchanger);

    // burn through the dead server's allowance with distinct names
    for i in 0..3 {
        let outcome = setup
            .resolver
            .resolve(&ResolveRequest::new(
                name(&format!("n{i}.example.com.")),
                RecordType::A,
            ))
            .await
            .unwrap();
        assert_eq!(outcome.rcode, 0, "the live sibling still answers");
    }

    let throttled_phase_start = setup.exchanger.query_count();
    setup
        .resolver
        .resolve(&ResolveRequest::new(name("later.example.com."), RecordType::A))
        .await
        .unwrap();

    // once benched, the dead server sees no more traffic at all
    let late_servers: Vec<String> = setup.exchanger.queries()[throttled_phase_start..]
        .iter()
        .map(|q| q.server.ip().to_string())
        .collect();
    assert!(!late_servers.iter().any(|s| s == DEAD));
}

#[tokio::test]
async fn servfail_replies_accumulate_into_the_throttle() {
    const SICK: &str = "10.255.4.1";
    const ALIVE: &str = "10.255.4.2";

    let hints = RootHints::from_servers(vec![
        RootHint {
            name: name("sick.invalid."),
            addrs: vec![SICK.parse().unwrap()],
        },
        RootHint {
            name: name("alive.invalid."),
            addrs: vec![ALIVE.parse().unwrap()],
        },
    ]);
    let mut config = test_config();
    config.throttle.server_down_max_fails = 2;

    // the sick server answers every single query, but always with SERVFAIL;
    // each reply must count as a failure, not reset the window
    let exchanger = MockExchanger::new(move |request| {
        if request.server.ip().to_string() == SICK {
            Some(Exchange {
                rcode: 2,
                rtt: Duration::from_millis(2),
                ..Exchange::default()
            })
        } else {
            Some(answer(vec![a(&request.qname.to_ascii(), [203, 0, 113, 6])]))
        }
    });
    let setup = setup_with(config, hints, exchanger);

    for i in 0..3 {
        let outcome = setup
            .resolver
            .resolve(&ResolveRequest::new(
                name(&format!("s{i}.example.com.")),
                RecordType::A,
            ))
            .await
            .unwrap();
        assert_eq!(outcome.rcode, 0, "the healthy sibling still answers");
    }

    // two SERVFAIL replies crossed the threshold: server-wide bench
    let sick_ip: IpAddr = SICK.parse().unwrap();
    assert!(setup
        .resolver
        .env()
        .servers
        .is_throttled(sick_ip, "unrelated.example.org.", 1, Instant::now()));

    let benched_phase_start = setup.exchanger.query_count();
    setup
        .resolver
        .resolve(&ResolveRequest::new(name("after.example.com."), RecordType::A))
        .await
        .unwrap();
    let late_servers: Vec<String> = setup.exchanger.queries()[benched_phase_start..]
        .iter()
        .map(|q| q.server.ip().to_string())
        .collect();
    assert!(!late_servers.iter().any(|s| s == SICK));
}

#[tokio::test]
async fn unreachable_cut_returns_servfail() {
    let setup = setup(|_| None);

    let outcome = setup
        .resolver
        .resolve(&ResolveRequest::new(name("www.example.com."), RecordType::A))
        .await
        .unwrap();
    assert_eq!(outcome.rcode, 2);
}

#[tokio::test]
async fn endless_referrals_hit_the_query_budget() {
    // a 60-label question lets the script delegate one label deeper on
    // every query, outrunning the 50-outquery allowance
    let deep = (0..60).map(|i| format!("l{i}")).collect::<Vec<_>>().join(".") + ".test.";
    let deep_name = name(&deep);

    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter_clone = Arc::clone(&counter);
    let deep_for_script = deep_name.clone();
    let setup = setup(move |_request| {
        let step = counter_clone.fetch_add(1, Ordering::SeqCst) + 1;
        // zone = the last (step+1) labels of the question
        let labels: Vec<&[u8]> = deep_for_script.iter().collect();
        let keep = (step + 1).min(labels.len());
        let zone_name = Name::from_labels(labels[labels.len() - keep..].to_vec()).unwrap();
        let zone = zone_name.to_ascii();
        let glue_ip = [10, 254, (step / 250) as u8, (step % 250) as u8];
        Some(referral(&zone, &format!("ns.{zone}"), glue_ip))
    });

    let result = setup
        .resolver
        .resolve(&ResolveRequest::new(deep_name, RecordType::A))
        .await;

    match result {
        Err(ResolverError::LimitExceeded { .. }) => {}
        other => panic!("expected a budget violation, got {other:?}"),
    }
    assert!(setup.exchanger.query_count() <= 51);
    assert_eq!(setup.stats.snapshot().qperq_limits, 1);
}

// ============================================================================
// ECS
// ============================================================================

#[tokio::test]
async fn ecs_forwarded_only_to_whitelisted_servers_and_scoped() {
    use rust_recursor::ClientSubnet;

    let mut config = test_config();
    config.edns.edns_subnet_whitelist = vec!["10.255.0.1/32".parse().unwrap()];

    let exchanger = MockExchanger::new(|request| {
        let mut exchange = answer(vec![a("geo.example.com.", [203, 0, 113, 7])]);
        // echo the option back with a /16 scope
        exchange.ecs = request.ecs.clone().map(|mut subnet| {
            subnet.scope_prefix = 16;
            subnet
        });
        Some(exchange)
    });
    let setup = setup_with(config, single_root_hints(), exchanger);

    let client_a: IpAddr = "172.16.5.9".parse().unwrap();
    let mut request = ResolveRequest::new(name("geo.example.com."), RecordType::A);
    request.client = Some(client_a);
    request.ecs = Some(ClientSubnet::for_client(client_a, 24, 56));

    let outcome = setup.resolver.resolve(&request).await.unwrap();
    assert_eq!(outcome.rcode, 0);
    assert!(setup.exchanger.queries()[0].ecs.is_some());

    // same /16: served from the scoped cache entry
    let client_b: IpAddr = "172.16.200.1".parse().unwrap();
    let mut request_b = ResolveRequest::new(name("geo.example.com."), RecordType::A);
    request_b.client = Some(client_b);
    request_b.ecs = Some(ClientSubnet::for_client(client_b, 24, 56));
    let before = setup.exchanger.query_count();
    setup.resolver.resolve(&request_b).await.unwrap();
    assert_eq!(setup.exchanger.query_count(), before);

    // different /16: the scope does not cover it, a new query goes out
    let client_c: IpAddr = "172.31.0.1".parse().unwrap();
    let mut request_c = ResolveRequest::new(name("geo.example.com."), RecordType::A);
    request_c.client = Some(client_c);
    request_c.ecs = Some(ClientSubnet::for_client(client_c, 24, 56));
    setup.resolver.resolve(&request_c).await.unwrap();
    assert_eq!(setup.exchanger.query_count(), before + 1);
}

#[tokio::test]
async fn ecs_not_forwarded_without_whitelist() {
    use rust_recursor::ClientSubnet;

    let setup = setup(|request| {
        assert!(request.ecs.is_none(), "ECS must not leave without a whitelist");
        Some(answer(vec![a("plain.example.com.", [203, 0, 113, 8])]))
    });

    let client: IpAddr = "172.16.5.9".parse().unwrap();
    let mut request = ResolveRequest::new(name("plain.example.com."), RecordType::A);
    request.client = Some(client);
    request.ecs = Some(ClientSubnet::for_client(client, 24, 56));

    let outcome = setup.resolver.resolve(&request).await.unwrap();
    assert_eq!(outcome.rcode, 0);
}

// ============================================================================
// Root refresh
// ============================================================================

#[tokio::test]
async fn root_refresh_reprimes_from_a_live_root() {
    let asked_root_ns = Arc::new(AtomicBool::new(false));
    let asked_clone = Arc::clone(&asked_root_ns);
    let setup = setup(move |request| {
        if request.qname == Name::root() && request.qtype == RecordType::NS {
            asked_clone.store(true, Ordering::SeqCst);
            Some(answer(vec![ns(".", "test-root.invalid.")]))
        } else {
            None
        }
    });
    let env = setup.resolver.env();
    env.hints.prime(&env.caches, Instant::now());

    setup.resolver.refresh_root().await.unwrap();

    assert!(asked_root_ns.load(Ordering::SeqCst));
    assert_eq!(setup.stats.snapshot().root_refreshes, 1);
}
