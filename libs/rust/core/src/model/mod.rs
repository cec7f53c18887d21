//! Model cache: loads schema/model artifacts from every source and serves
//! one immutable snapshot to all readers.

pub mod artifact;
pub mod cache;
pub mod source;
pub mod watch;

use std::path::PathBuf;
use thiserror::Error;

pub use artifact::{AssociatedResolver, ExternalDefinition, ModelArtifact, ModelDocument, ModelSnapshot, SchemaDecl, MODEL_EXTENSION, SCHEMA_EXTENSION};
pub use cache::{ModelCache, ModelsChanged};
pub use source::{EmbeddedResources, ModelLoader, ModelSource};
pub use watch::ModelWatcher;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no service declared in {origin}; cannot derive a namespace")]
    NoNamespace { origin: String },
    #[error("malformed model document {origin}: {source}")]
    Malformed { origin: String, #[source] source: serde_json::Error },
    #[error("model source {} unavailable: {source}", .path.display())]
    SourceUnavailable { path: PathBuf, #[source] source: std::io::Error },
    #[error("model loading worker failed: {0}")]
    Worker(String),
}
