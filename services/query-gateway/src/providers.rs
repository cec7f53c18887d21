//! Built-in provider handlers selected by tag from configuration.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use typemesh_core::model::ModelSnapshot;
use typemesh_core::router::{Envelope, Provider, Reply, RouteError};
use typemesh_core::ProviderConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind { Static, Echo }

impl FromStr for HandlerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        HANDLERS.iter().find(|(name, _, _)| *name == s).map(|(_, kind, _)| *kind).ok_or_else(|| anyhow!("unknown provider kind {s:?}"))
    }
}

type Constructor = fn(&ProviderConfig) -> Arc<dyn Provider>;

const HANDLERS: &[(&str, HandlerKind, Constructor)] = &[
    ("static", HandlerKind::Static, static_records),
    ("echo", HandlerKind::Echo, echo),
];

fn static_records(cfg: &ProviderConfig) -> Arc<dyn Provider> { Arc::new(StaticRecords::new(cfg.records.clone())) }

fn echo(_: &ProviderConfig) -> Arc<dyn Provider> { Arc::new(Echo) }

pub fn build(cfg: &ProviderConfig) -> Result<(HandlerKind, Arc<dyn Provider>)> {
    let kind: HandlerKind = cfg.kind.parse()?;
    let ctor = HANDLERS.iter().find(|(_, k, _)| *k == kind).map(|(_, _, c)| *c).ok_or_else(|| anyhow!("no constructor for {kind:?}"))?;
    Ok((kind, ctor(cfg)))
}

/// Expands `namespace.*` patterns against the entity types in `snapshot`;
/// other entries pass through unchanged.
pub fn expand_types(patterns: &[String], snapshot: Option<&ModelSnapshot>) -> BTreeSet<String> {
    let known: Vec<String> = snapshot
        .map(|s| s.artifacts.values().flat_map(|a| a.model.qualified_types().collect::<Vec<_>>()).collect())
        .unwrap_or_default();
    let mut out = BTreeSet::new();
    for pattern in patterns {
        match pattern.strip_suffix(".*") {
            Some(ns) => out.extend(known.iter().filter(|t| t.strip_prefix(ns).is_some_and(|rest| rest.starts_with('.') && !rest[1..].contains('.'))).cloned()),
            None => { out.insert(pattern.clone()); }
        }
    }
    out
}

/// Serves a fixed record set; `payload.where` narrows it to records whose
/// fields equal every given value.
pub struct StaticRecords { records: Vec<Value> }

impl StaticRecords {
    pub fn new(records: Vec<Value>) -> Self { Self { records } }
}

#[async_trait]
impl Provider for StaticRecords {
    async fn handle(&self, envelope: Envelope) -> Result<Reply, RouteError> {
        let filter = envelope.payload.get("where").and_then(Value::as_object);
        let hits = self.records.iter()
            .filter(|r| filter.map_or(true, |f| f.iter().all(|(k, v)| r.get(k) == Some(v))))
            .cloned()
            .collect();
        Ok(Reply::new(Value::Array(hits)))
    }
}

/// Replies with the request payload wrapped in a one-element array.
pub struct Echo;

#[async_trait]
impl Provider for Echo {
    async fn handle(&self, envelope: Envelope) -> Result<Reply, RouteError> { Ok(Reply::new(json!([envelope.payload]))) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use typemesh_core::model::{ModelArtifact, ModelDocument, SchemaDecl};

    fn cfg(kind: &str, records: Vec<Value>) -> ProviderConfig {
        ProviderConfig { kind: kind.into(), address: "svc.test".into(), types: vec!["acme.Order".into()], records }
    }

    #[tokio::test]
    async fn static_provider_filters_by_where() {
        let (kind, p) = build(&cfg("static", vec![json!({"id": 1, "state": "open"}), json!({"id": 2, "state": "closed"})])).unwrap();
        assert_eq!(kind, HandlerKind::Static);
        let reply = p.handle(Envelope::new(json!({"where": {"state": "open"}}))).await.unwrap();
        assert_eq!(reply.body, json!([{"id": 1, "state": "open"}]));
        let all = p.handle(Envelope::default()).await.unwrap();
        assert_eq!(all.body.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(build(&cfg("grpc", Vec::new())).is_err());
    }

    #[test]
    fn namespace_patterns_expand_from_models() {
        let model = ModelDocument { schemas: vec![SchemaDecl { namespace: "acme.orders".into(), services: vec!["OrderService".into()], entity_types: vec!["Order".into(), "Line".into()] }] };
        let artifact = ModelArtifact { namespace: "acme.orders".into(), origin: "orders.model.json".into(), document: Default::default(), model, derived: BTreeMap::new() };
        let snapshot = ModelSnapshot { generation: 1, artifacts: BTreeMap::from([("acme.orders".to_string(), Arc::new(artifact))]) };
        let got = expand_types(&["acme.orders.*".into(), "acme.Invoice".into()], Some(&snapshot));
        assert_eq!(got.into_iter().collect::<Vec<_>>(), vec!["acme.Invoice", "acme.orders.Line", "acme.orders.Order"]);
        assert_eq!(expand_types(&["acme.orders.*".into()], None).len(), 0);
    }
}
