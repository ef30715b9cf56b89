//! The server loop
//!
//! Per-worker UDP and TCP listeners, the query-processing pipeline that
//! fronts the resolver, the ingress/egress address filters, and the
//! worker threads that tie them together.

pub mod acl;
pub mod handler;
pub mod tcp;
pub mod udp;
pub mod worker;

pub use acl::AddressFilter;
pub use handler::{HandlerStats, IngressProtocol, QueryHandler};
pub use tcp::{TcpServer, TcpServerStats};
pub use udp::{UdpServer, UdpServerStats};
pub use worker::{derate_mthreads, run_workers, TaskGauge, TaskSlot};
