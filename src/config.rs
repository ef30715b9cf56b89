//! Resolver configuration
//!
//! This module defines the full configuration surface of the resolver and
//! its loader. Configuration is a serde tree loaded from a JSON file (or
//! built programmatically with the `with_*` methods), then checked once
//! with [`Config::validate`] before any worker starts.
//!
//! # Sections
//!
//! - [`Config`]: top level: listen addresses, worker count, ACLs
//! - [`CacheConfig`]: record cache sizing and TTL clamps
//! - [`NegativeCacheConfig`]: negative-answer TTL policy
//! - [`PacketCacheConfig`]: whole-response cache TTLs
//! - [`ResolutionConfig`]: per-query budgets (qperq, wall clock, depth)
//! - [`TransportConfig`]: outbound timeouts and source-port window
//! - [`EdnsConfig`]: EDNS buffer sizes and the ECS forwarding policy
//! - [`ThrottleConfig`]: server-down accounting
//! - [`TcpConfig`]: inbound TCP connection caps
//!
//! # Example
//!
//! ```
//! use rust_recursor::config::Config;
//!
//! let config = Config::new().with_threads(4);
//! config.validate().expect("valid config");
//! assert_eq!(config.threads, 4);
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{ResolverError, Result};

/// Default UDP/TCP listen address
pub const DEFAULT_LISTEN: &str = "127.0.0.1:53";

/// How the resolver treats DNSSEC
///
/// The ladder mirrors the classic recursor modes: from completely off, via
/// passthrough of DNSSEC records without validating, to hard validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DnssecMode {
    /// Strip all DNSSEC records, never set DO upstream
    Off,
    /// Forward DNSSEC records when asked, never validate
    #[default]
    ProcessNoValidate,
    /// Validate when the client asks (DO or AD)
    Process,
    /// Validate everything; Bogus answers become SERVFAIL
    #[serde(rename = "validate")]
    ValidateAll,
    /// Validate everything, log failures, but serve the answer anyway
    LogFail,
}

impl DnssecMode {
    /// Whether validation machinery runs at all in this mode
    #[must_use]
    pub fn validates(self) -> bool {
        matches!(self, Self::Process | Self::ValidateAll | Self::LogFail)
    }

    /// Whether a Bogus result must be converted to SERVFAIL regardless of
    /// what the client asked for
    #[must_use]
    pub fn hard_fail(self) -> bool {
        matches!(self, Self::ValidateAll)
    }
}

impl std::fmt::Display for DnssecMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Off => "off",
            Self::ProcessNoValidate => "process-no-validate",
            Self::Process => "process",
            Self::ValidateAll => "validate",
            Self::LogFail => "log-fail",
        };
        write!(f, "{s}")
    }
}

/// Record-cache sizing and TTL discipline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of record-cache entries before LRU eviction
    pub max_cache_entries: usize,
    /// Ceiling applied to every cached TTL (seconds)
    pub max_cache_ttl: u32,
    /// Floor applied to every cached TTL (seconds)
    pub min_cache_ttl: u32,
    /// Negative-cache policy
    pub negative: NegativeCacheConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_entries: 1_000_000,
            max_cache_ttl: 86_400,
            min_cache_ttl: 0,
            negative: NegativeCacheConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Set the record-cache capacity
    #[must_use]
    pub fn with_max_entries(mut self, max_cache_entries: usize) -> Self {
        self.max_cache_entries = max_cache_entries;
        self
    }

    /// Clamp a TTL into the configured window
    #[must_use]
    pub fn clamp_ttl(&self, ttl: u32) -> u32 {
        ttl.clamp(self.min_cache_ttl, self.max_cache_ttl)
    }

    /// Validate this section
    pub fn validate(&self) -> Result<()> {
        if self.max_cache_entries == 0 {
            return Err(ResolverError::config_field(
                "must be positive",
                "cache.max_cache_entries",
            ));
        }
        if self.min_cache_ttl > self.max_cache_ttl {
            return Err(ResolverError::config_field(
                "min TTL exceeds max TTL",
                "cache.min_cache_ttl",
            ));
        }
        self.negative.validate()
    }
}

/// Negative-cache TTL policy
///
/// Negative answers are cached for `min(SOA.minimum, max_negative_ttl)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegativeCacheConfig {
    /// Ceiling for negative-answer TTLs (seconds)
    pub max_negative_ttl: u32,
    /// Fallback TTL when the proof carries no usable SOA
    pub default_ttl: u32,
}

impl Default for NegativeCacheConfig {
    fn default() -> Self {
        Self {
            max_negative_ttl: 3_600,
            default_ttl: 60,
        }
    }
}

impl NegativeCacheConfig {
    /// Validate this section
    pub fn validate(&self) -> Result<()> {
        if self.max_negative_ttl == 0 {
            return Err(ResolverError::config_field(
                "must be positive",
                "cache.negative.max_negative_ttl",
            ));
        }
        Ok(())
    }
}

/// Packet-cache sizing and TTLs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketCacheConfig {
    /// Whether the packet cache is consulted at all
    pub enabled: bool,
    /// Maximum number of cached responses
    pub max_packetcache_entries: usize,
    /// Ceiling on how long a response may be replayed (seconds)
    pub packetcache_ttl: u32,
    /// Ceiling for cached SERVFAIL responses; 0 disables SERVFAIL caching
    pub packetcache_servfail_ttl: u32,
}

impl Default for PacketCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_packetcache_entries: 500_000,
            packetcache_ttl: 3_600,
            packetcache_servfail_ttl: 60,
        }
    }
}

impl PacketCacheConfig {
    /// Validate this section
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.max_packetcache_entries == 0 {
            return Err(ResolverError::config_field(
                "must be positive when the packet cache is enabled",
                "packet_cache.max_packetcache_entries",
            ));
        }
        Ok(())
    }
}

/// Per-query resolution budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Maximum outgoing queries spent on one client query
    pub max_qperq: u32,
    /// Maximum wall-clock per client query (milliseconds)
    pub max_total_msec: u64,
    /// Maximum recursion depth (CNAME chases + nested NS resolutions)
    pub max_recursion_depth: u32,
    /// Maximum CNAME chain length before giving up
    pub max_cname_chases: u32,
    /// Root NS refresh interval (seconds)
    pub root_refresh_interval: u64,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            max_qperq: 50,
            max_total_msec: 7_000,
            max_recursion_depth: 40,
            max_cname_chases: 10,
            root_refresh_interval: 7_200,
        }
    }
}

impl ResolutionConfig {
    /// The wall-clock budget as a `Duration`
    #[must_use]
    pub fn total_budget(&self) -> Duration {
        Duration::from_millis(self.max_total_msec)
    }

    /// Validate this section
    pub fn validate(&self) -> Result<()> {
        if self.max_qperq == 0 {
            return Err(ResolverError::config_field(
                "must be positive",
                "resolution.max_qperq",
            ));
        }
        if self.max_recursion_depth == 0 {
            return Err(ResolverError::config_field(
                "must be positive",
                "resolution.max_recursion_depth",
            ));
        }
        Ok(())
    }
}

/// Outbound transport tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Per-outbound-query timeout (milliseconds)
    pub network_timeout_msec: u64,
    /// Lowest source port the randomizer may pick
    pub udp_source_port_min: u16,
    /// Highest source port the randomizer may pick
    pub udp_source_port_max: u16,
    /// Ports never picked even when inside the window
    pub udp_source_port_avoid: Vec<u16>,
    /// Near-miss count after which a pending query is treated as spoofed
    pub spoof_nearmiss_max: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            network_timeout_msec: 1_500,
            udp_source_port_min: 1_024,
            udp_source_port_max: 65_535,
            udp_source_port_avoid: Vec::new(),
            spoof_nearmiss_max: 20,
        }
    }
}

impl TransportConfig {
    /// The outbound timeout as a `Duration`
    #[must_use]
    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_msec)
    }

    /// Validate this section
    pub fn validate(&self) -> Result<()> {
        if self.udp_source_port_min > self.udp_source_port_max {
            return Err(ResolverError::config_field(
                "source-port window is inverted",
                "transport.udp_source_port_min",
            ));
        }
        if self.udp_source_port_min < 1024 {
            return Err(ResolverError::config_field(
                "refusing to use privileged source ports",
                "transport.udp_source_port_min",
            ));
        }
        let window = usize::from(self.udp_source_port_max - self.udp_source_port_min) + 1;
        if self.udp_source_port_avoid.len() >= window {
            return Err(ResolverError::config_field(
                "avoid list covers the whole port window",
                "transport.udp_source_port_avoid",
            ));
        }
        Ok(())
    }
}

/// EDNS sizing and the Client Subnet forwarding policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdnsConfig {
    /// Buffer size advertised on outgoing queries
    pub edns_outgoing_bufsize: u16,
    /// Client-advertised sizes are honored up to this threshold
    pub udp_truncation_threshold: u16,
    /// IPv4 source prefix length sent in ECS options
    pub ecs_ipv4_bits: u8,
    /// IPv6 source prefix length sent in ECS options
    pub ecs_ipv6_bits: u8,
    /// Whether an ECS option on the client query seeds the outgoing one
    pub use_incoming_edns_subnet: bool,
    /// Authoritative servers that receive ECS (empty disables forwarding)
    pub edns_subnet_whitelist: Vec<IpNet>,
}

impl Default for EdnsConfig {
    fn default() -> Self {
        Self {
            edns_outgoing_bufsize: 1_680,
            udp_truncation_threshold: 1_680,
            ecs_ipv4_bits: 24,
            ecs_ipv6_bits: 56,
            use_incoming_edns_subnet: false,
            edns_subnet_whitelist: Vec::new(),
        }
    }
}

impl EdnsConfig {
    /// Whether ECS should be attached to a query for `server`
    #[must_use]
    pub fn forwards_ecs_to(&self, server: IpAddr) -> bool {
        self.edns_subnet_whitelist.iter().any(|net| net.contains(&server))
    }

    /// Validate this section
    pub fn validate(&self) -> Result<()> {
        if self.edns_outgoing_bufsize < 512 {
            return Err(ResolverError::config_field(
                "must be at least 512",
                "edns.edns_outgoing_bufsize",
            ));
        }
        if self.udp_truncation_threshold < 512 {
            return Err(ResolverError::config_field(
                "must be at least 512",
                "edns.udp_truncation_threshold",
            ));
        }
        if self.ecs_ipv4_bits > 32 {
            return Err(ResolverError::config_field(
                "IPv4 prefix length out of range",
                "edns.ecs_ipv4_bits",
            ));
        }
        if self.ecs_ipv6_bits > 128 {
            return Err(ResolverError::config_field(
                "IPv6 prefix length out of range",
                "edns.ecs_ipv6_bits",
            ));
        }
        Ok(())
    }
}

/// Server-down throttling policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Failures inside the window before a server is throttled
    pub server_down_max_fails: u32,
    /// How long a throttled server is skipped (seconds)
    pub server_down_throttle_time: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            server_down_max_fails: 64,
            server_down_throttle_time: 60,
        }
    }
}

impl ThrottleConfig {
    /// The throttle window as a `Duration`
    #[must_use]
    pub fn throttle_duration(&self) -> Duration {
        Duration::from_secs(self.server_down_throttle_time)
    }
}

/// Inbound TCP limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Maximum simultaneous connections per client address
    pub max_tcp_per_client: usize,
    /// Maximum queries served on one connection before closing it
    pub max_tcp_queries_per_connection: usize,
    /// Idle timeout for client connections (seconds)
    pub client_tcp_timeout: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_tcp_per_client: 128,
            max_tcp_queries_per_connection: 64,
            client_tcp_timeout: 2,
        }
    }
}

/// Top-level resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Addresses the resolver listens on (UDP and TCP)
    pub listen: Vec<SocketAddr>,
    /// Number of worker threads
    pub threads: usize,
    /// Maximum concurrent resolution tasks per worker
    pub max_mthreads: usize,
    /// Record cache
    pub cache: CacheConfig,
    /// Packet cache
    pub packet_cache: PacketCacheConfig,
    /// Resolution budgets
    pub resolution: ResolutionConfig,
    /// Outbound transport
    pub transport: TransportConfig,
    /// EDNS and ECS policy
    pub edns: EdnsConfig,
    /// Server-down throttling
    pub throttle: ThrottleConfig,
    /// Inbound TCP limits
    pub tcp: TcpConfig,
    /// DNSSEC mode
    pub dnssec: DnssecMode,
    /// Networks allowed to query the resolver
    pub allow_from: Vec<IpNet>,
    /// Networks the resolver refuses to send queries to
    pub dont_query: Vec<IpNet>,
    /// Optional root-hints file consulted at startup
    pub root_hints_path: Option<PathBuf>,
    /// Whether routinely-noisy client errors are logged
    pub log_common_errors: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: vec![DEFAULT_LISTEN.parse().expect("default listen address")],
            threads: 2,
            max_mthreads: 2_048,
            cache: CacheConfig::default(),
            packet_cache: PacketCacheConfig::default(),
            resolution: ResolutionConfig::default(),
            transport: TransportConfig::default(),
            edns: EdnsConfig::default(),
            throttle: ThrottleConfig::default(),
            tcp: TcpConfig::default(),
            dnssec: DnssecMode::default(),
            allow_from: default_allow_from(),
            dont_query: default_dont_query(),
            root_hints_path: None,
            log_common_errors: false,
        }
    }
}

/// Networks allowed to query by default: loopback plus private ranges
fn default_allow_from() -> Vec<IpNet> {
    [
        "127.0.0.0/8",
        "10.0.0.0/8",
        "100.64.0.0/10",
        "169.254.0.0/16",
        "192.168.0.0/16",
        "172.16.0.0/12",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
    ]
    .iter()
    .map(|s| s.parse().expect("builtin allow_from network"))
    .collect()
}

/// Networks never queried by default: addresses that cannot host a public
/// authoritative server
fn default_dont_query() -> Vec<IpNet> {
    [
        "127.0.0.0/8",
        "10.0.0.0/8",
        "100.64.0.0/10",
        "169.254.0.0/16",
        "192.168.0.0/16",
        "172.16.0.0/12",
        "0.0.0.0/8",
        "192.0.0.0/24",
        "192.0.2.0/24",
        "198.51.100.0/24",
        "203.0.113.0/24",
        "240.0.0.0/4",
        "::1/128",
        "::/96",
        "fc00::/7",
        "fe80::/10",
        "2001:db8::/32",
    ]
    .iter()
    .map(|s| s.parse().expect("builtin dont_query network"))
    .collect()
}

impl Config {
    /// Create a configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker-thread count
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Replace the listen addresses
    #[must_use]
    pub fn with_listen(mut self, listen: Vec<SocketAddr>) -> Self {
        self.listen = listen;
        self
    }

    /// Replace the record-cache section
    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set the DNSSEC mode
    #[must_use]
    pub fn with_dnssec(mut self, dnssec: DnssecMode) -> Self {
        self.dnssec = dnssec;
        self
    }

    /// Load a configuration from a JSON file
    ///
    /// # Errors
    ///
    /// Returns a `Config` error when the file cannot be read or parsed,
    /// or when the parsed tree fails validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ResolverError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            ResolverError::config(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole tree
    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            return Err(ResolverError::config_field("no listen addresses", "listen"));
        }
        if self.threads == 0 {
            return Err(ResolverError::config_field("must be positive", "threads"));
        }
        if self.max_mthreads == 0 {
            return Err(ResolverError::config_field("must be positive", "max_mthreads"));
        }
        self.cache.validate()?;
        self.packet_cache.validate()?;
        self.resolution.validate()?;
        self.transport.validate()?;
        self.edns.validate()?;
        Ok(())
    }
}
