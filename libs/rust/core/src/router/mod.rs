//! Query routing by type name.
//!
//! The router asks the capability directory who serves a type, then sends the
//! envelope straight to the only provider or, when several serve it, to the
//! node-local consolidator tagged with the resolved type name.

pub mod consolidator;
pub mod local;
pub mod query;

use std::collections::BTreeMap;
use std::sync::Arc;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

pub use consolidator::{Consolidator, MergePolicy};
pub use local::LocalDispatcher;
pub use query::{execute, QueryRequest, QueryResponse};

use crate::metrics_ext::CORE_METRICS;
use crate::registry::{CapabilityDirectory, RegistryError};

/// Header carrying the resolved type name on consolidator dispatches.
pub const TYPE_NAME_HEADER: &str = "x-typemesh-type";
pub const DEFAULT_CONSOLIDATOR_ADDRESS: &str = "typemesh.consolidator";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Restrict delivery to the dispatching node.
    #[serde(default)]
    pub local_only: bool,
}

impl Envelope {
    pub fn new(payload: serde_json::Value) -> Self { Self { payload, ..Default::default() } }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> { self.headers.get(name).map(String::as_str) }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Reply {
    pub fn new(body: serde_json::Value) -> Self { Self { headers: BTreeMap::new(), body } }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no provider found for type {0}")]
    NoProviderFound(String),
    #[error("unexpected result type for {type_name}: expected {expected}")]
    UnexpectedResultType { type_name: String, expected: String },
    #[error("consolidator request without x-typemesh-type header")]
    MissingTypeHeader,
    #[error("dispatch to {address} failed: {reason}")]
    Dispatch { address: String, reason: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Sends an envelope to an address and waits for the reply.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, address: &str, envelope: Envelope) -> Result<Reply, RouteError>;
}

/// A handler serving one or more entity types.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Result<Reply, RouteError>;
}

pub struct Router {
    directory: Arc<dyn CapabilityDirectory>,
    dispatcher: Arc<dyn Dispatcher>,
    consolidator_address: String,
}

impl Router {
    pub fn new(directory: Arc<dyn CapabilityDirectory>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { directory, dispatcher, consolidator_address: DEFAULT_CONSOLIDATOR_ADDRESS.to_string() }
    }

    pub fn with_consolidator_address(mut self, address: impl Into<String>) -> Self { self.consolidator_address = address.into(); self }

    #[instrument(skip(self, envelope), fields(type_name = %type_name))]
    pub async fn route(&self, type_name: &str, mut envelope: Envelope) -> Result<Reply, RouteError> {
        let providers = self.directory.get(type_name).await?;
        let (arity, result) = match providers.len() {
            0 => ("none", Err(RouteError::NoProviderFound(type_name.to_string()))),
            1 => {
                let address = providers.iter().next().map(String::as_str).unwrap_or_default();
                debug!(%address, "route_direct");
                ("single", self.dispatcher.dispatch(address, envelope).await)
            }
            n => {
                debug!(providers = n, consolidator = %self.consolidator_address, "route_consolidated");
                envelope.headers.insert(TYPE_NAME_HEADER.to_string(), type_name.to_string());
                envelope.local_only = true;
                ("multi", self.dispatcher.dispatch(&self.consolidator_address, envelope).await)
            }
        };
        CORE_METRICS.router.requests_total.add(1, &[KeyValue::new("arity", arity)]);
        if result.is_err() { CORE_METRICS.router.failures_total.add(1, &[KeyValue::new("arity", arity)]); }
        result
    }

    /// Routes and decodes the reply body as `T`.
    pub async fn route_as<T: DeserializeOwned>(&self, type_name: &str, envelope: Envelope) -> Result<T, RouteError> {
        let reply = self.route(type_name, envelope).await?;
        decode_reply(type_name, reply)
    }
}

pub fn decode_reply<T: DeserializeOwned>(type_name: &str, reply: Reply) -> Result<T, RouteError> {
    serde_json::from_value(reply.body).map_err(|_| RouteError::UnexpectedResultType {
        type_name: type_name.to_string(),
        expected: std::any::type_name::<T>().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_mismatch_is_unexpected_result_type() {
        let err = decode_reply::<Vec<u32>>("acme.Order", Reply::new(json!({"count": 3}))).unwrap_err();
        assert!(matches!(err, RouteError::UnexpectedResultType { ref type_name, .. } if type_name == "acme.Order"));
        let ok: Vec<u32> = decode_reply("acme.Order", Reply::new(json!([1, 2]))).unwrap();
        assert_eq!(ok, vec![1, 2]);
    }

    #[test]
    fn envelope_defaults_from_json() {
        let env: Envelope = serde_json::from_value(json!({"payload": {"filter": "id eq 1"}})).unwrap();
        assert!(env.headers.is_empty());
        assert!(!env.local_only);
    }
}
