//! typemesh query gateway: hosts providers, the node-local consolidator and
//! the query front on NATS.

pub mod nats;
pub mod providers;
pub mod serve;

pub use nats::{local_subject, NatsClusterMap, NatsDispatcher, NatsLockManager, WireResult};
pub use providers::{build as build_provider, expand_types, HandlerKind};
pub use serve::{serve_provider, serve_queries, Delivery};
