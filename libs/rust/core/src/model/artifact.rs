//! Model artifacts and their parsed representation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ModelError;

/// File suffix of primary model documents.
pub const MODEL_EXTENSION: &str = ".model.json";
/// File suffix of per-service derived-schema documents (`<stem>.<Service>.schema.json`).
pub const SCHEMA_EXTENSION: &str = ".schema.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ModelDocument {
    #[serde(default)]
    pub schemas: Vec<SchemaDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SchemaDecl {
    pub namespace: String,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub entity_types: Vec<String>,
}

impl ModelDocument {
    /// Schema of the first declared service; it names the artifact.
    pub fn service_schema(&self) -> Option<&SchemaDecl> {
        self.schemas.iter().find(|s| !s.services.is_empty() && !s.namespace.is_empty())
    }

    /// Qualified names (`namespace.Type`) of every declared entity type.
    pub fn qualified_types(&self) -> impl Iterator<Item = String> + '_ {
        self.schemas.iter().flat_map(|s| s.entity_types.iter().map(move |t| format!("{}.{}", s.namespace, t)))
    }
}

/// One loaded model: the primary document plus its derived schemas. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifact {
    pub namespace: String,
    pub origin: String,
    pub document: Bytes,
    pub model: ModelDocument,
    /// sub-namespace (`<namespace>.<Service>`) -> derived-schema document
    pub derived: BTreeMap<String, Bytes>,
}

/// A caller-registered model, participating in every reload until removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalDefinition {
    pub name: String,
    pub primary: Bytes,
    pub associated: BTreeMap<String, Bytes>,
}

impl ExternalDefinition {
    pub fn new(name: impl Into<String>, primary: impl Into<Bytes>) -> Self {
        Self { name: name.into(), primary: primary.into(), associated: BTreeMap::new() }
    }

    pub fn with_associated(mut self, key: impl Into<String>, doc: impl Into<Bytes>) -> Self {
        self.associated.insert(key.into(), doc.into());
        self
    }
}

/// Point-in-time view of every loaded model. Replaced wholesale, never mutated.
#[derive(Debug, Clone, Default)]
pub struct ModelSnapshot {
    pub generation: u64,
    pub artifacts: BTreeMap<String, Arc<ModelArtifact>>,
}

impl ModelSnapshot {
    pub fn get(&self, namespace: &str) -> Option<&Arc<ModelArtifact>> { self.artifacts.get(namespace) }
    pub fn namespaces(&self) -> impl Iterator<Item = &str> { self.artifacts.keys().map(String::as_str) }
    pub fn len(&self) -> usize { self.artifacts.len() }
    pub fn is_empty(&self) -> bool { self.artifacts.is_empty() }

    /// Same namespace -> artifact content, ignoring the generation.
    pub fn same_content(&self, other: &ModelSnapshot) -> bool {
        self.artifacts.len() == other.artifacts.len()
            && self.artifacts.iter().zip(other.artifacts.iter()).all(|((ka, a), (kb, b))| ka == kb && a == b)
    }
}

/// Lenient lookup of associated documents: map keys under either separator
/// convention first, then the filesystem. A key only matches from the
/// requested document's own directory, or as a bare file name.
#[derive(Debug, Default, Clone)]
pub struct AssociatedResolver {
    map: BTreeMap<String, Bytes>,
    root: Option<PathBuf>,
}

impl AssociatedResolver {
    pub fn from_map(map: BTreeMap<String, Bytes>) -> Self { Self { map, root: None } }
    pub fn from_dir(root: impl Into<PathBuf>) -> Self { Self { map: BTreeMap::new(), root: Some(root.into()) } }

    pub fn resolve(&self, rel: &str) -> std::io::Result<Option<Bytes>> {
        if let Some(b) = self.map.get(rel) { return Ok(Some(b.clone())); }
        let normalized = normalize_key(rel);
        if let Some(b) = self.map.get(&normalized) { return Ok(Some(b.clone())); }
        let (dir, file_name) = split_dir(&normalized);
        let mut bare = None;
        for (k, b) in &self.map {
            let k = normalize_key(k);
            match split_dir(&k) {
                (d, f) if f == file_name && d == dir => return Ok(Some(b.clone())),
                ("", f) if f == file_name => bare = Some(b.clone()),
                _ => {}
            }
        }
        if bare.is_some() { return Ok(bare); }
        let Some(root) = &self.root else { return Ok(None) };
        let path = root.join(&normalized);
        match std::fs::read(&path) {
            Ok(b) => Ok(Some(Bytes::from(b))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

pub(crate) fn normalize_key(key: &str) -> String {
    let key = key.replace('\\', "/");
    key.strip_prefix("./").unwrap_or(key.as_str()).trim_start_matches('/').to_string()
}

/// `a/b/orders.S.schema.json` -> (`a/b`, `orders.S.schema.json`)
fn split_dir(key: &str) -> (&str, &str) { key.rsplit_once('/').unwrap_or(("", key)) }

/// `orders/sales.model.json` -> `orders/sales`
pub(crate) fn model_stem(path: &str) -> &str { path.strip_suffix(MODEL_EXTENSION).unwrap_or(path) }

/// Parses a primary document and attaches its derived schemas. Blocking; callers offload it.
pub fn parse_artifact(origin: &str, document: Bytes, resolver: &AssociatedResolver) -> Result<ModelArtifact, ModelError> {
    let model: ModelDocument = serde_json::from_slice(&document)
        .map_err(|source| ModelError::Malformed { origin: origin.to_string(), source })?;
    let schema = model.service_schema().ok_or_else(|| ModelError::NoNamespace { origin: origin.to_string() })?;
    let namespace = schema.namespace.clone();
    let origin_key = normalize_key(origin);
    let stem = model_stem(&origin_key);
    let mut derived = BTreeMap::new();
    for service in &schema.services {
        let rel = format!("{stem}.{service}{SCHEMA_EXTENSION}");
        match resolver.resolve(&rel) {
            Ok(Some(doc)) => { derived.insert(format!("{namespace}.{service}"), doc); }
            Ok(None) => debug!(%origin, %service, "derived_schema_absent"),
            Err(source) => return Err(ModelError::SourceUnavailable { path: rel.into(), source }),
        }
    }
    Ok(ModelArtifact { namespace, origin: origin.to_string(), document, model, derived })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDERS: &str = r#"{"schemas":[{"namespace":"acme.common","entity_types":["Money"]},{"namespace":"acme.orders","services":["OrderService"],"entity_types":["Order"]}]}"#;

    #[test]
    fn namespace_comes_from_first_service_schema() {
        let art = parse_artifact("orders.model.json", Bytes::from_static(ORDERS.as_bytes()), &AssociatedResolver::default()).unwrap();
        assert_eq!(art.namespace, "acme.orders");
        assert!(art.derived.is_empty());
        let types: Vec<String> = art.model.qualified_types().collect();
        assert_eq!(types, vec!["acme.common.Money".to_string(), "acme.orders.Order".to_string()]);
    }

    #[test]
    fn document_without_service_is_rejected() {
        let doc = Bytes::from_static(br#"{"schemas":[{"namespace":"acme.common","entity_types":["Money"]}]}"#);
        let err = parse_artifact("common.model.json", doc, &AssociatedResolver::default()).unwrap_err();
        assert!(matches!(err, ModelError::NoNamespace { .. }));
    }

    #[test]
    fn resolver_tolerates_separator_conventions() {
        let mut map = BTreeMap::new();
        map.insert("models\\orders.OrderService.schema.json".to_string(), Bytes::from_static(b"{}"));
        let resolver = AssociatedResolver::from_map(map);
        let art = parse_artifact("models/orders.model.json", Bytes::from_static(ORDERS.as_bytes()), &resolver).unwrap();
        assert_eq!(art.derived.get("acme.orders.OrderService").map(|b| b.as_ref()), Some(&b"{}"[..]));
    }

    #[test]
    fn derived_schema_never_comes_from_another_directory() {
        let mut map = BTreeMap::new();
        map.insert("b/orders.OrderService.schema.json".to_string(), Bytes::from_static(b"{\"from\":\"b\"}"));
        let art = parse_artifact("a/orders.model.json", Bytes::from_static(ORDERS.as_bytes()), &AssociatedResolver::from_map(map.clone())).unwrap();
        assert!(art.derived.is_empty());

        map.insert("./a/orders.OrderService.schema.json".to_string(), Bytes::from_static(b"{\"from\":\"a\"}"));
        let art = parse_artifact("a/orders.model.json", Bytes::from_static(ORDERS.as_bytes()), &AssociatedResolver::from_map(map)).unwrap();
        assert_eq!(art.derived.get("acme.orders.OrderService").map(|b| b.as_ref()), Some(&br#"{"from":"a"}"#[..]));
    }

    #[test]
    fn flat_map_matches_bare_file_name() {
        let mut map = BTreeMap::new();
        map.insert("orders.OrderService.schema.json".to_string(), Bytes::from_static(b"{}"));
        let art = parse_artifact("models/orders.model.json", Bytes::from_static(ORDERS.as_bytes()), &AssociatedResolver::from_map(map)).unwrap();
        assert!(art.derived.contains_key("acme.orders.OrderService"));
    }

    #[test]
    fn malformed_json_is_reported() {
        let err = parse_artifact("bad.model.json", Bytes::from_static(b"{not json"), &AssociatedResolver::default()).unwrap_err();
        assert!(matches!(err, ModelError::Malformed { .. }));
    }
}
