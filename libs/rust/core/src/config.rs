//! Layered gateway configuration: defaults, optional file, then `TYPEMESH__*` env.

use std::path::Path;
use std::time::Duration;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::registry::LockScope;
use crate::router::{MergePolicy, DEFAULT_CONSOLIDATOR_ADDRESS};

pub const CONFIG_FILE_ENV: &str = "TYPEMESH_CONFIG_FILE";
pub const ENV_PREFIX: &str = "TYPEMESH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub service: String,
    pub node_id: String,
    pub nats_url: String,
    pub model_dir: String,
    pub watch_models: bool,
    pub registry_bucket: String,
    pub lock_bucket: String,
    pub lock_scope: LockScope,
    /// Enables expiring write locks when set.
    pub lock_deadline_ms: Option<u64>,
    pub consolidator_address: String,
    pub merge_key: Option<String>,
    pub health_port: u16,
    pub reannounce_secs: u64,
    pub query_subject: String,
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: String,
    pub address: String,
    pub types: Vec<String>,
    #[serde(default)]
    pub records: Vec<serde_json::Value>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            service: "typemesh-gateway".into(),
            node_id: uuid::Uuid::new_v4().simple().to_string(),
            nats_url: "127.0.0.1:4222".into(),
            model_dir: "models".into(),
            watch_models: true,
            registry_bucket: "typemesh_registry".into(),
            lock_bucket: "typemesh_locks".into(),
            lock_scope: LockScope::PerKey,
            lock_deadline_ms: None,
            consolidator_address: DEFAULT_CONSOLIDATOR_ADDRESS.into(),
            merge_key: None,
            health_port: 8080,
            reannounce_secs: 30,
            query_subject: "typemesh.query".into(),
            providers: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn lock_deadline(&self) -> Option<Duration> { self.lock_deadline_ms.map(Duration::from_millis) }

    pub fn reannounce_interval(&self) -> Duration { Duration::from_secs(self.reannounce_secs) }

    pub fn merge_policy(&self) -> MergePolicy {
        match &self.merge_key { Some(k) => MergePolicy::MergeByKey(k.clone()), None => MergePolicy::Concatenate }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() { bail!("node_id must not be empty"); }
        if self.reannounce_secs == 0 { bail!("reannounce_secs must be > 0"); }
        if self.lock_deadline_ms == Some(0) { bail!("lock_deadline_ms must be > 0 when set"); }
        for p in &self.providers {
            if p.address.is_empty() || p.types.is_empty() { bail!("provider {:?} needs an address and at least one type", p.kind); }
        }
        Ok(())
    }
}

/// Loads configuration for `service`, reading the file named by
/// `TYPEMESH_CONFIG_FILE` when set.
pub fn load_config(service: &str) -> Result<GatewayConfig> {
    let file = std::env::var(CONFIG_FILE_ENV).ok();
    load_config_from(service, file.as_deref().map(Path::new))
}

pub fn load_config_from(service: &str, file: Option<&Path>) -> Result<GatewayConfig> {
    let mut builder = config::Config::builder().set_default("service", service)?;
    if let Some(path) = file {
        builder = builder.add_source(config::File::from(path).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true));
    let cfg: GatewayConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;
    tracing::info!(service = %cfg.service, node_id = %cfg.node_id, providers = cfg.providers.len(), "config_loaded");
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_overrides_defaults() {
        let mut f = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(f, r#"{{
            "node_id": "n1",
            "lock_scope": "global",
            "lock_deadline_ms": 250,
            "merge_key": "id",
            "providers": [{{"kind": "static", "address": "svc.orders", "types": ["acme.Order"]}}]
        }}"#).unwrap();
        let cfg = load_config_from("gw-test", Some(f.path())).unwrap();
        assert_eq!(cfg.service, "gw-test");
        assert_eq!(cfg.node_id, "n1");
        assert_eq!(cfg.lock_scope, LockScope::Global);
        assert_eq!(cfg.lock_deadline(), Some(Duration::from_millis(250)));
        assert_eq!(cfg.merge_policy(), MergePolicy::MergeByKey("id".into()));
        assert_eq!(cfg.providers[0].types, vec!["acme.Order".to_string()]);
        assert_eq!(cfg.query_subject, "typemesh.query");
    }

    #[test]
    fn zero_reannounce_is_rejected() {
        let cfg = GatewayConfig { reannounce_secs: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }
}
