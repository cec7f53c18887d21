use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Dispatcher, Envelope, Provider, Reply, RouteError};

/// In-process dispatcher: addresses map straight to provider handlers.
#[derive(Default)]
pub struct LocalDispatcher {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl LocalDispatcher {
    pub fn new() -> Self { Self::default() }

    pub fn bind(&self, address: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.write().insert(address.into(), provider);
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn dispatch(&self, address: &str, envelope: Envelope) -> Result<Reply, RouteError> {
        let provider = self.providers.read().get(address).cloned();
        match provider {
            Some(p) => p.handle(envelope).await,
            None => Err(RouteError::Dispatch { address: address.to_string(), reason: "no handler bound".into() }),
        }
    }
}
