//! Model sources: a directory tree, an embedded resource index and
//! explicitly registered definitions.
//!
//! Parsing is CPU/IO heavy, so every entry point hops onto the blocking pool
//! before touching the filesystem.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::artifact::{normalize_key, parse_artifact, AssociatedResolver, ExternalDefinition, ModelArtifact, MODEL_EXTENSION};
use super::ModelError;

/// Loader seam used by the cache.
#[async_trait]
pub trait ModelLoader: Send + Sync + 'static {
    /// Every artifact from the static sources (directory + embedded index).
    async fn scan(&self) -> Result<Vec<ModelArtifact>, ModelError>;
    async fn load_external(&self, definition: &ExternalDefinition) -> Result<ModelArtifact, ModelError>;
}

/// Resources compiled into the binary, addressed by logical path.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedResources {
    files: BTreeMap<String, Bytes>,
    manifest: Vec<String>,
}

impl EmbeddedResources {
    pub fn new() -> Self { Self::default() }

    pub fn with_file(mut self, path: &str, doc: impl Into<Bytes>) -> Self {
        self.files.insert(normalize_key(path), doc.into());
        self
    }

    /// Extra logical paths to load even when they lack the model extension.
    pub fn with_manifest<I, S>(mut self, paths: I) -> Self where I: IntoIterator<Item = S>, S: Into<String> {
        self.manifest.extend(paths.into_iter().map(|p| normalize_key(&p.into())));
        self
    }

    fn primaries(&self) -> Vec<String> {
        let mut out: Vec<String> = self.files.keys().filter(|k| k.ends_with(MODEL_EXTENSION)).cloned().collect();
        for path in &self.manifest { if !out.contains(path) { out.push(path.clone()); } }
        out
    }
}

#[derive(Debug, Clone)]
pub struct ModelSource {
    root: PathBuf,
    embedded: Arc<EmbeddedResources>,
}

impl ModelSource {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into(), embedded: Arc::new(EmbeddedResources::default()) } }

    pub fn with_embedded(mut self, embedded: EmbeddedResources) -> Self { self.embedded = Arc::new(embedded); self }
}

#[async_trait]
impl ModelLoader for ModelSource {
    async fn scan(&self) -> Result<Vec<ModelArtifact>, ModelError> {
        let root = self.root.clone();
        let embedded = self.embedded.clone();
        offload(move || {
            let mut artifacts = scan_directory(&root)?;
            artifacts.extend(scan_embedded(&embedded));
            Ok(artifacts)
        }).await
    }

    async fn load_external(&self, definition: &ExternalDefinition) -> Result<ModelArtifact, ModelError> {
        let def = definition.clone();
        offload(move || {
            let resolver = AssociatedResolver::from_map(def.associated.clone());
            parse_artifact(&def.name, def.primary.clone(), &resolver)
        }).await
    }
}

async fn offload<T, F>(f: F) -> Result<T, ModelError>
where F: FnOnce() -> Result<T, ModelError> + Send + 'static, T: Send + 'static {
    tokio::task::spawn_blocking(f).await.map_err(|e| ModelError::Worker(e.to_string()))?
}

/// Recursive scan of `root`. A missing root is an empty source; unparseable
/// documents are skipped; any other I/O failure aborts the scan.
pub fn scan_directory(root: &Path) -> Result<Vec<ModelArtifact>, ModelError> {
    match std::fs::metadata(root) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(root = %root.display(), "model_dir_missing");
            return Ok(Vec::new());
        }
        Err(source) => return Err(ModelError::SourceUnavailable { path: root.to_path_buf(), source }),
    }
    let resolver = AssociatedResolver::from_dir(root);
    let mut artifacts = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            let source = e.into_io_error().unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop"));
            ModelError::SourceUnavailable { path, source }
        })?;
        if !entry.file_type().is_file() { continue; }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path()).to_string_lossy().into_owned();
        if !rel.ends_with(MODEL_EXTENSION) { continue; }
        let doc = std::fs::read(entry.path()).map_err(|source| ModelError::SourceUnavailable { path: entry.path().to_path_buf(), source })?;
        match parse_artifact(&rel, Bytes::from(doc), &resolver) {
            Ok(a) => { debug!(namespace = %a.namespace, origin = %rel, "model_artifact_loaded"); artifacts.push(a); }
            Err(e @ (ModelError::NoNamespace { .. } | ModelError::Malformed { .. })) => warn!(error = %e, "model_document_skipped"),
            Err(e) => return Err(e),
        }
    }
    Ok(artifacts)
}

/// Embedded resources are optional: every failure is logged and skipped.
pub fn scan_embedded(embedded: &EmbeddedResources) -> Vec<ModelArtifact> {
    let resolver = AssociatedResolver::from_map(embedded.files.clone());
    let mut artifacts = Vec::new();
    for path in embedded.primaries() {
        let Some(doc) = embedded.files.get(&path).cloned() else {
            warn!(%path, "manifest_entry_missing");
            continue;
        };
        match parse_artifact(&path, doc, &resolver) {
            Ok(a) => artifacts.push(a),
            Err(e) => warn!(error = %e, %path, "embedded_model_skipped"),
        }
    }
    artifacts
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVENTORY: &str = r#"{"schemas":[{"namespace":"acme.inventory","services":["StockService"],"entity_types":["Item"]}]}"#;

    #[tokio::test]
    async fn missing_root_is_empty() {
        let src = ModelSource::new("/definitely/not/here/typemesh-models");
        assert!(src.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn embedded_models_join_the_scan() {
        let src = ModelSource::new("/definitely/not/here/typemesh-models")
            .with_embedded(EmbeddedResources::new().with_file("builtin/inventory.model.json", INVENTORY.as_bytes().to_vec()));
        let arts = src.scan().await.unwrap();
        assert_eq!(arts.len(), 1);
        assert_eq!(arts[0].origin, "builtin/inventory.model.json");
    }

    #[test]
    fn embedded_manifest_adds_paths_and_skips_missing() {
        let embedded = EmbeddedResources::new()
            .with_file("builtin/inventory.json", INVENTORY.as_bytes().to_vec())
            .with_manifest(["builtin/inventory.json", "builtin/absent.json"]);
        let arts = scan_embedded(&embedded);
        assert_eq!(arts.len(), 1);
        assert_eq!(arts[0].namespace, "acme.inventory");
    }

    #[test]
    fn embedded_failures_are_skipped() {
        let embedded = EmbeddedResources::new()
            .with_file("a.model.json", b"{".to_vec())
            .with_file("b.model.json", INVENTORY.as_bytes().to_vec());
        let arts = scan_embedded(&embedded);
        assert_eq!(arts.len(), 1);
    }

    #[tokio::test]
    async fn external_definition_without_namespace_fails() {
        let src = ModelSource::new("/nonexistent");
        let def = ExternalDefinition::new("x.model.json", br#"{"schemas":[]}"#.to_vec());
        assert!(matches!(src.load_external(&def).await, Err(ModelError::NoNamespace { .. })));
    }
}
