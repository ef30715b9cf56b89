//! rust-recursor: a caching, validating recursive DNS resolver
//!
//! This crate answers DNS queries by walking the public hierarchy from
//! the root down to an authoritative server, validating DNSSEC where
//! asked, caching aggressively, and defending the outbound path against
//! spoofed replies.
//!
//! # Architecture
//!
//! ```text
//! Client datagram
//!     │
//!     ▼
//! ┌──────────────┐     hit     ┌──────────────┐
//! │ Server loop  │────────────▶│ Packet cache │
//! └──────┬───────┘             └──────────────┘
//!        │ miss
//!        ▼
//! ┌──────────────┐  consults  ┌───────────────────────┐
//! │   Resolver   │───────────▶│ Record/negative cache │
//! └──────┬───────┘            └───────────────────────┘
//!        │ outbound
//!        ▼
//! ┌──────────────┐   TC=1    ┌──────────────┐
//! │ UDP exchange │──────────▶│ TCP fallback │
//! └──────────────┘           └──────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`]: the full configuration surface and its loader
//! - [`error`]: the failure taxonomy of the resolution pipeline
//! - [`wire`]: raw wire helpers (question sniffing, ECS surgery,
//!   truncation) on top of `hickory_proto` message handling
//! - [`cache`]: record, negative and packet caches
//! - [`transport`]: the outbound exchanger with spoof resistance and
//!   chained-query suppression
//! - [`resolver`]: the iterative resolution state machine, root hints,
//!   per-server throttling and the DNSSEC boundary
//! - [`server`]: listeners, the query pipeline and worker threads
//! - [`stats`]: process-wide counters

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

pub mod cache;
pub mod config;
pub mod error;
pub mod resolver;
pub mod server;
pub mod stats;
pub mod transport;
pub mod wire;

// Re-export the types a consumer wires together
pub use cache::{
    CacheStats, CacheStatsSnapshot, NegativeCache, NegativeKind, PacketCache, PacketCacheKey,
    RecordCache, ResolverCaches, RrsetInsert,
};
pub use config::{Config, DnssecMode};
pub use error::{Budget, ResolverError, Result};
pub use resolver::hints::RootHints;
pub use resolver::throttle::{EdnsMode, ServerState};
pub use resolver::validate::{
    ChainFetcher, ChainValidator, NoopValidator, ValidationRequest, ValidationState, Validator,
};
pub use resolver::{IterativeResolver, ResolveOutcome, ResolveRequest, ResolverEnv};
pub use server::{run_workers, IngressProtocol, QueryHandler, TaskGauge};
pub use stats::{ResolverStats, ResolverStatsSnapshot};
pub use transport::{Exchange, ExchangeRequest, Exchanger, UdpExchanger};
pub use wire::ecs::ClientSubnet;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
