//! Fan-out and merge for types served by several providers.

use std::sync::Arc;
use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use super::{Dispatcher, Envelope, Provider, Reply, RouteError, TYPE_NAME_HEADER};
use crate::registry::CapabilityDirectory;

/// How provider results are combined.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Append provider arrays in provider address order.
    #[default]
    Concatenate,
    /// Records sharing a value for the field become one record; fields from
    /// earlier providers win. Records without the field are appended as-is.
    MergeByKey(String),
}

impl MergePolicy {
    pub fn merge(&self, parts: Vec<Vec<Value>>) -> Vec<Value> {
        match self {
            MergePolicy::Concatenate => parts.into_iter().flatten().collect(),
            MergePolicy::MergeByKey(field) => merge_by_key(field, parts),
        }
    }
}

fn merge_by_key(field: &str, parts: Vec<Vec<Value>>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    let mut index: Vec<(Value, usize)> = Vec::new();
    for record in parts.into_iter().flatten() {
        let key = record.get(field).cloned();
        let slot = key.as_ref().and_then(|k| index.iter().find(|(v, _)| v == k).map(|(_, i)| *i));
        match (slot, record) {
            (Some(i), Value::Object(fields)) => {
                if let Value::Object(existing) = &mut out[i] { fill_missing(existing, fields); }
            }
            (None, record) => {
                if let Some(k) = key { index.push((k, out.len())); }
                out.push(record);
            }
            (Some(_), other) => out.push(other),
        }
    }
    out
}

fn fill_missing(existing: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (k, v) in incoming { existing.entry(k).or_insert(v); }
}

/// Node-local handler that queries every provider of the tagged type and
/// merges their array results.
pub struct Consolidator {
    directory: Arc<dyn CapabilityDirectory>,
    dispatcher: Arc<dyn Dispatcher>,
    policy: MergePolicy,
}

impl Consolidator {
    pub fn new(directory: Arc<dyn CapabilityDirectory>, dispatcher: Arc<dyn Dispatcher>, policy: MergePolicy) -> Self {
        Self { directory, dispatcher, policy }
    }

    pub fn policy(&self) -> &MergePolicy { &self.policy }
}

#[async_trait]
impl Provider for Consolidator {
    #[instrument(skip_all, fields(type_name = tracing::field::Empty))]
    async fn handle(&self, mut envelope: Envelope) -> Result<Reply, RouteError> {
        let type_name = envelope.headers.remove(TYPE_NAME_HEADER).ok_or(RouteError::MissingTypeHeader)?;
        tracing::Span::current().record("type_name", type_name.as_str());
        envelope.local_only = false;
        let providers = self.directory.get(&type_name).await?;
        if providers.is_empty() { return Err(RouteError::NoProviderFound(type_name)); }
        debug!(providers = providers.len(), "consolidator_fan_out");
        let replies = try_join_all(providers.iter().map(|address| {
            let envelope = envelope.clone();
            async move { self.dispatcher.dispatch(address, envelope).await.map(|r| (address, r)) }
        })).await?;
        let mut parts = Vec::with_capacity(replies.len());
        for (address, reply) in replies {
            match reply.body {
                Value::Array(records) => parts.push(records),
                other => {
                    debug!(%address, kind = value_kind(&other), "consolidator_non_array_reply");
                    return Err(RouteError::UnexpectedResultType { type_name, expected: "array".into() });
                }
            }
        }
        Ok(Reply::new(Value::Array(self.policy.merge(parts))))
    }
}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_by_key_fills_missing_fields() {
        let policy = MergePolicy::MergeByKey("id".into());
        let merged = policy.merge(vec![
            vec![json!({"id": 1, "name": "a"}), json!({"note": "keyless"})],
            vec![json!({"id": 1, "name": "z", "total": 5}), json!({"id": 2})],
        ]);
        assert_eq!(merged, vec![
            json!({"id": 1, "name": "a", "total": 5}),
            json!({"note": "keyless"}),
            json!({"id": 2}),
        ]);
    }

    #[test]
    fn concatenate_keeps_order() {
        let merged = MergePolicy::Concatenate.merge(vec![vec![json!(1)], vec![json!(2), json!(3)]]);
        assert_eq!(merged, vec![json!(1), json!(2), json!(3)]);
    }
}
