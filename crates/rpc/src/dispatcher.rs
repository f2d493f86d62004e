//! Execution algorithm for one request (§4.F).

use crate::overrides::OverrideTable;
use crate::registry::MethodRegistry;
use crate::types::{RpcRequest, RpcResponse};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, warn};
use vda_core::error::AgentError;

pub struct Dispatcher {
    registry: MethodRegistry,
    overrides: OverrideTable,
    /// Set while the composition root is still replaying recovered VM
    /// state (§4.F step 1, §6). Cleared once recovery completes.
    recovering: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(registry: MethodRegistry, overrides: OverrideTable, recovering: Arc<AtomicBool>) -> Self {
        Self {
            registry,
            overrides,
            recovering,
        }
    }

    pub fn mark_recovery_complete(&self) {
        self.recovering.store(false, Ordering::SeqCst);
    }

    /// Dispatches one request. Returns `None` for notifications (executed
    /// but no response entry, per §4.F batch semantics — also applied to
    /// lone notification calls).
    pub async fn dispatch(&self, req: RpcRequest) -> Option<RpcResponse> {
        let id = req.id.clone();
        let result = self.execute(&req).await;
        if req.is_notification() {
            if let Err(err) = result {
                warn!(method = %req.method, error = %err, "notification failed");
            }
            return None;
        }
        Some(match result {
            Ok(value) => RpcResponse::success(value, id),
            Err(err) => RpcResponse::error(err.rpc_code(), err.to_string(), id),
        })
    }

    /// Runs a batch. An empty batch is `InvalidRequest`; notifications in
    /// the batch produce no response entry.
    pub async fn dispatch_batch(&self, reqs: Vec<RpcRequest>) -> Vec<RpcResponse> {
        if reqs.is_empty() {
            return vec![RpcResponse::error(-32600, "Invalid Request", None)];
        }
        let mut responses = Vec::with_capacity(reqs.len());
        for req in reqs {
            if let Some(resp) = self.dispatch(req).await {
                responses.push(resp);
            }
        }
        responses
    }

    async fn execute(&self, req: &RpcRequest) -> Result<Value, AgentError> {
        if self.recovering.load(Ordering::SeqCst) {
            return Err(AgentError::RecoveryInProgress);
        }

        let (class, method) = split_method(&req.method)?;

        let entry = self
            .registry
            .get(class, method)
            .ok_or_else(|| AgentError::MethodNotFound(req.method.clone()))?;

        let keyed = entry
            .schema
            .name_align(req.params.as_ref())
            .map_err(|field| AgentError::InvalidParams(format!("missing argument: {field}")))?;

        let override_ = self.overrides.get(class, method);

        let raw_result = if let Some(pre_call) = override_.and_then(|o| o.pre_call.as_ref()) {
            pre_call.call(&keyed).await
        } else {
            entry.handler.call(&keyed).await
        };

        let value = match raw_result {
            Ok(v) => v,
            Err(AgentError::Business { code, message }) => {
                return Err(AgentError::Business { code, message });
            }
            Err(AgentError::Internal(msg)) => {
                error!(method = %req.method, error = %msg, "internal error executing RPC method");
                return Err(AgentError::Internal(msg));
            }
            Err(other) => return Err(other),
        };

        let extracted = match override_ {
            Some(o) => o.post_extract.apply(&value),
            None => value,
        };

        Ok(extracted)
    }
}

fn split_method(method: &str) -> Result<(&str, &str), AgentError> {
    method
        .split_once('.')
        .ok_or_else(|| AgentError::MethodNotFound(method.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MethodHandler;
    use crate::overrides::{MethodOverride, PostExtract};
    use crate::schema::{MethodArg, MethodSchema};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    struct Echo;

    #[async_trait]
    impl MethodHandler for Echo {
        async fn call(&self, args: &HashMap<String, Value>) -> Result<Value, AgentError> {
            Ok(json!({ "echoed": args.get("text").cloned().unwrap_or(Value::Null) }))
        }
    }

    fn dispatcher_with_echo() -> Dispatcher {
        let mut registry = MethodRegistry::new();
        registry.register(
            MethodSchema::new("Host", "echo").arg(MethodArg::required("text")),
            Arc::new(Echo),
        );
        Dispatcher::new(registry, OverrideTable::new(), Arc::new(AtomicBool::new(false)))
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let dispatcher = dispatcher_with_echo();
        let req = RpcRequest {
            jsonrpc: "2.0".into(),
            method: "Host.missing".into(),
            params: None,
            id: Some(json!(1)),
        };
        let resp = dispatcher.dispatch(req).await.unwrap();
        assert_eq!(resp.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn host_dot_echo_dispatches_to_the_registered_handler() {
        let dispatcher = dispatcher_with_echo();
        let req = RpcRequest {
            jsonrpc: "2.0".into(),
            method: "Host.echo".into(),
            params: Some(json!({ "text": "hi" })),
            id: Some(json!(1)),
        };
        let resp = dispatcher.dispatch(req).await.unwrap();
        assert_eq!(resp.result.unwrap()["echoed"], json!("hi"));
    }

    #[tokio::test]
    async fn recovery_in_progress_short_circuits() {
        let mut registry = MethodRegistry::new();
        registry.register(
            MethodSchema::new("Host", "echo").arg(MethodArg::required("text")),
            Arc::new(Echo),
        );
        let dispatcher = Dispatcher::new(registry, OverrideTable::new(), Arc::new(AtomicBool::new(true)));
        let req = RpcRequest {
            jsonrpc: "2.0".into(),
            method: "Host.echo".into(),
            params: Some(json!({ "text": "hi" })),
            id: Some(json!(1)),
        };
        let resp = dispatcher.dispatch(req).await.unwrap();
        assert!(resp.error.is_some());
    }

    #[tokio::test]
    async fn notification_executes_without_response() {
        let dispatcher = dispatcher_with_echo();
        let req = RpcRequest {
            jsonrpc: "2.0".into(),
            method: "Host.echo".into(),
            params: Some(json!({ "text": "hi" })),
            id: None,
        };
        assert!(dispatcher.dispatch(req).await.is_none());
    }

    #[tokio::test]
    async fn empty_batch_is_invalid_request() {
        let dispatcher = dispatcher_with_echo();
        let resp = dispatcher.dispatch_batch(vec![]).await;
        assert_eq!(resp.len(), 1);
        assert_eq!(resp[0].error.as_ref().unwrap().code, -32600);
    }

    #[tokio::test]
    async fn post_extract_field_reshapes_result() {
        let mut registry = MethodRegistry::new();
        registry.register(
            MethodSchema::new("Host", "echo").arg(MethodArg::required("text")),
            Arc::new(Echo),
        );
        let mut overrides = OverrideTable::new();
        overrides.insert(
            "Host",
            "echo",
            MethodOverride {
                pre_call: None,
                post_extract: PostExtract::Field("echoed".to_string()),
            },
        );
        let dispatcher = Dispatcher::new(registry, overrides, Arc::new(AtomicBool::new(false)));
        let req = RpcRequest {
            jsonrpc: "2.0".into(),
            method: "Host.echo".into(),
            params: Some(json!({ "text": "hi" })),
            id: Some(json!(1)),
        };
        let resp = dispatcher.dispatch(req).await.unwrap();
        assert_eq!(resp.result.unwrap(), json!("hi"));
    }
}
