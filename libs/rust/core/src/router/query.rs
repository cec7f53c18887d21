//! Batched queries: a request tree whose parts run concurrently and resolve
//! as one unit through the batch coordinator.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use futures::FutureExt;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{Envelope, Reply, Router};
use crate::batch::{settle, BatchContext, BatchError, BatchFailure, CallSite};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryRequest {
    Single { type_name: String, #[serde(default)] envelope: Envelope },
    Batch { parts: Vec<QueryRequest> },
}

impl QueryRequest {
    pub fn single(type_name: impl Into<String>, envelope: Envelope) -> Self {
        QueryRequest::Single { type_name: type_name.into(), envelope }
    }

    pub fn batch(parts: Vec<QueryRequest>) -> Self { QueryRequest::Batch { parts } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryResponse {
    Single { type_name: String, reply: Reply },
    Batch { parts: Vec<QueryResponse> },
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query failed: {0}")]
    Failed(#[from] BatchFailure),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("query part {0} settled without a reply")]
    Incomplete(String),
}

enum Plan {
    Single { type_name: String, slot: Arc<OnceCell<Reply>> },
    Batch(Vec<Plan>),
}

/// Runs every part of `request` concurrently. Resolves once all parts succeed
/// or as soon as one fails.
pub async fn execute(router: Arc<Router>, request: QueryRequest) -> Result<QueryResponse, QueryError> {
    let mut ctx = BatchContext::new();
    let plan = plan(&router, &mut ctx, request, &mut CallSite::new())?;
    let root = ctx.root().clone();
    root.wait().await?;
    info!(handle = root.id(), "query_completed");
    collect(plan)
}

fn plan(router: &Arc<Router>, ctx: &mut BatchContext, request: QueryRequest, site: &mut CallSite) -> Result<Plan, BatchError> {
    match request {
        QueryRequest::Single { type_name, envelope } => {
            let handle = ctx.current_handle(site);
            let slot = Arc::new(OnceCell::new());
            let (router, task_slot, task_type) = (router.clone(), slot.clone(), type_name.clone());
            tokio::spawn(async move {
                // a panicking provider must still settle its handle
                match AssertUnwindSafe(router.route(&task_type, envelope)).catch_unwind().await {
                    Ok(Ok(reply)) => {
                        let _ = task_slot.set(reply);
                        handle.succeed();
                    }
                    Ok(Err(e)) => {
                        debug!(type_name = %task_type, error = %e, "query_part_failed");
                        handle.fail(format!("{task_type}: {e}"));
                    }
                    Err(_) => {
                        warn!(type_name = %task_type, "query_part_panicked");
                        handle.fail(format!("{task_type}: provider panicked"));
                    }
                }
            });
            Ok(Plan::Single { type_name, slot })
        }
        QueryRequest::Batch { parts } => {
            let target = ctx.enter(site);
            let mut planned = Vec::with_capacity(parts.len());
            for part in parts { planned.push(plan(router, ctx, part, &mut CallSite::new())?); }
            let children = ctx.exit()?;
            tokio::spawn(settle(target, children));
            Ok(Plan::Batch(planned))
        }
    }
}

fn collect(plan: Plan) -> Result<QueryResponse, QueryError> {
    match plan {
        Plan::Single { type_name, slot } => match slot.get() {
            Some(reply) => Ok(QueryResponse::Single { reply: reply.clone(), type_name }),
            None => Err(QueryError::Incomplete(type_name)),
        },
        Plan::Batch(parts) => Ok(QueryResponse::Batch { parts: parts.into_iter().map(collect).collect::<Result<_, _>>()? }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_tree_from_json() {
        let req: QueryRequest = serde_json::from_value(json!({
            "kind": "batch",
            "parts": [
                {"kind": "single", "type_name": "acme.Order"},
                {"kind": "batch", "parts": []}
            ]
        })).unwrap();
        assert_eq!(req, QueryRequest::batch(vec![
            QueryRequest::single("acme.Order", Envelope::default()),
            QueryRequest::batch(Vec::new()),
        ]));
    }
}
