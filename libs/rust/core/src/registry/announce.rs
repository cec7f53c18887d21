//! Provider-side registration: announce served types, withdraw stale ones.
//!
//! The registry never expires entries, so a provider that stops serving a type
//! must unregister it itself, on re-announcement or on shutdown.

use std::collections::BTreeSet;
use std::sync::Arc;
use parking_lot::Mutex;
use tracing::{info, warn};
use typemesh_resilience::{retry_async_if, RetryConfig};

use super::{CapabilityDirectory, RegistryError};

pub struct ProviderAnnouncer {
    directory: Arc<dyn CapabilityDirectory>,
    address: String,
    retry: RetryConfig,
    announced: Mutex<BTreeSet<String>>,
}

impl ProviderAnnouncer {
    pub fn new(directory: Arc<dyn CapabilityDirectory>, address: impl Into<String>) -> Self {
        Self { directory, address: address.into(), retry: RetryConfig::default(), announced: Mutex::new(BTreeSet::new()) }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self { self.retry = retry; self }

    pub fn address(&self) -> &str { &self.address }

    pub fn announced(&self) -> BTreeSet<String> { self.announced.lock().clone() }

    /// Registers every type in `types` and unregisters types from the
    /// previous announcement that are no longer served.
    pub async fn announce<I, S>(&self, types: I) -> Result<(), RegistryError>
    where I: IntoIterator<Item = S>, S: Into<String> {
        let wanted: BTreeSet<String> = types.into_iter().map(Into::into).collect();
        let stale: Vec<String> = self.announced.lock().difference(&wanted).cloned().collect();
        for type_name in &wanted {
            self.retrying(|| self.directory.register(type_name, &self.address)).await?;
            self.announced.lock().insert(type_name.clone());
        }
        for type_name in &stale {
            self.retrying(|| self.directory.unregister(type_name, &self.address)).await?;
            self.announced.lock().remove(type_name);
        }
        info!(address = %self.address, types = wanted.len(), withdrawn = stale.len(), "provider_announced");
        Ok(())
    }

    /// Unregisters everything this provider announced; best effort.
    pub async fn withdraw(&self) {
        let types: Vec<String> = self.announced.lock().iter().cloned().collect();
        for type_name in types {
            match self.retrying(|| self.directory.unregister(&type_name, &self.address)).await {
                Ok(()) => { self.announced.lock().remove(&type_name); }
                Err(e) => warn!(address = %self.address, %type_name, error = %e, "provider_withdraw_failed"),
            }
        }
    }

    async fn retrying<F, Fut>(&self, mut op: F) -> Result<(), RegistryError>
    where F: FnMut() -> Fut, Fut: std::future::Future<Output = Result<(), RegistryError>> {
        retry_async_if(&self.retry, RegistryError::is_lock_timeout, |_| op()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CapabilityRegistry;

    #[tokio::test]
    async fn reannounce_withdraws_stale_types() {
        let reg: Arc<dyn CapabilityDirectory> = Arc::new(CapabilityRegistry::local());
        let announcer = ProviderAnnouncer::new(reg.clone(), "svc.a");
        announcer.announce(["acme.Order", "acme.Invoice"]).await.unwrap();
        assert_eq!(reg.get("acme.Invoice").await.unwrap().len(), 1);
        announcer.announce(["acme.Order"]).await.unwrap();
        assert!(reg.get("acme.Invoice").await.unwrap().is_empty());
        assert_eq!(announcer.announced().len(), 1);
        announcer.withdraw().await;
        assert!(reg.get("acme.Order").await.unwrap().is_empty());
        assert!(announcer.announced().is_empty());
    }
}
