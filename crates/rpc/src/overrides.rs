//! Per-method overrides: `pre_call` replaces default dispatch entirely,
//! `post_extract` reshapes the result before it reaches the client (§4.F).

use crate::handler::MethodHandler;
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone)]
pub enum PostExtract {
    /// Return the method result verbatim.
    Identity,
    /// Return a single named field of the result object.
    Field(String),
    /// Reshape the result through an arbitrary function.
    Func(Arc<dyn Fn(&Value) -> Value + Send + Sync>),
}

impl PostExtract {
    pub fn apply(&self, result: &Value) -> Value {
        match self {
            PostExtract::Identity => result.clone(),
            PostExtract::Field(name) => result.get(name).cloned().unwrap_or(Value::Null),
            PostExtract::Func(f) => f(result),
        }
    }
}

#[derive(Clone)]
pub struct MethodOverride {
    pub pre_call: Option<Arc<dyn MethodHandler>>,
    pub post_extract: PostExtract,
}

impl Default for MethodOverride {
    fn default() -> Self {
        Self {
            pre_call: None,
            post_extract: PostExtract::Identity,
        }
    }
}

#[derive(Default)]
pub struct OverrideTable {
    overrides: std::collections::HashMap<String, MethodOverride>,
}

impl OverrideTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(class: &str, method: &str) -> String {
        format!("{}_{}", class, method)
    }

    pub fn insert(&mut self, class: &str, method: &str, override_: MethodOverride) {
        self.overrides.insert(Self::key(class, method), override_);
    }

    pub fn get(&self, class: &str, method: &str) -> Option<&MethodOverride> {
        self.overrides.get(&Self::key(class, method))
    }
}
