//! Method registry: maps `(class, method)` to its schema and handler
//! (§4.F "Method registry").

use crate::handler::MethodHandler;
use crate::schema::MethodSchema;
use std::collections::HashMap;
use std::sync::Arc;

pub struct RegisteredMethod {
    pub schema: MethodSchema,
    pub handler: Arc<dyn MethodHandler>,
}

#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<(String, String), RegisteredMethod>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: MethodSchema, handler: Arc<dyn MethodHandler>) {
        let key = (schema.class.clone(), schema.method.clone());
        self.methods.insert(key, RegisteredMethod { schema, handler });
    }

    pub fn get(&self, class: &str, method: &str) -> Option<&RegisteredMethod> {
        self.methods.get(&(class.to_string(), method.to_string()))
    }
}
