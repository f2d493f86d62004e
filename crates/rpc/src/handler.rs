//! The handler seam a method registers behind (§4.F step 6).

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use vda_core::error::AgentResult;

#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn call(&self, args: &HashMap<String, Value>) -> AgentResult<Value>;
}

#[async_trait]
impl<F, Fut> MethodHandler for F
where
    F: Fn(HashMap<String, Value>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = AgentResult<Value>> + Send,
{
    async fn call(&self, args: &HashMap<String, Value>) -> AgentResult<Value> {
        (self)(args.clone()).await
    }
}
