//! Subscription loops answering NATS requests.

use std::sync::Arc;
use bytes::Bytes;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use typemesh_core::router::{execute, Envelope, Provider, QueryRequest, Router};

use crate::nats::WireResult;

/// Who receives a request published on the subject.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// One member of the queue group per request (shared provider addresses).
    Queue(String),
    /// Every subscriber (node-local subjects).
    Direct,
}

/// Answers each request on `subject` with the handler's result.
pub async fn serve<Req, Resp, H, Fut>(client: async_nats::Client, subject: String, delivery: Delivery, handler: H) -> anyhow::Result<JoinHandle<()>>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    H: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Resp, String>> + Send + 'static,
{
    let mut sub = match &delivery {
        Delivery::Queue(group) => client.queue_subscribe(subject.clone(), group.clone()).await?,
        Delivery::Direct => client.subscribe(subject.clone()).await?,
    };
    info!(%subject, ?delivery, "subscription_started");
    let handler = Arc::new(handler);
    Ok(tokio::spawn(async move {
        while let Some(msg) = sub.next().await {
            let Some(reply_to) = msg.reply.clone() else { debug!(subject = %msg.subject, "request_without_reply_subject"); continue };
            let (client, handler) = (client.clone(), handler.clone());
            tokio::spawn(async move {
                let outcome = match serde_json::from_slice::<Req>(&msg.payload) {
                    Ok(req) => (*handler)(req).await,
                    Err(e) => Err(format!("undecodable request: {e}")),
                };
                let body = match serde_json::to_vec(&WireResult::from_result(outcome)) {
                    Ok(b) => b,
                    Err(e) => { warn!(error = %e, "reply_encode_failed"); return; }
                };
                if let Err(e) = client.publish(reply_to, Bytes::from(body)).await { warn!(error = %e, "reply_publish_failed"); }
            });
        }
        info!(%subject, "subscription_ended");
    }))
}

/// Hosts a provider handler on `subject`.
pub async fn serve_provider(client: async_nats::Client, subject: String, delivery: Delivery, provider: Arc<dyn Provider>) -> anyhow::Result<JoinHandle<()>> {
    serve(client, subject, delivery, move |envelope: Envelope| {
        let provider = provider.clone();
        async move { provider.handle(envelope).await.map_err(|e| e.to_string()) }
    }).await
}

/// Query front: JSON request trees in, response trees out.
pub async fn serve_queries(client: async_nats::Client, subject: String, router: Arc<Router>) -> anyhow::Result<JoinHandle<()>> {
    let group = subject.clone();
    serve(client, subject, Delivery::Queue(group), move |request: QueryRequest| {
        let router = router.clone();
        async move { execute(router, request).await.map_err(|e| e.to_string()) }
    }).await
}
