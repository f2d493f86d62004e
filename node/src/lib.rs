//! Composition-root building blocks exposed for integration testing
//! (§4.O): the VM registry and the `Host.*` method handlers, wired
//! together the same way `main` wires them but reachable from
//! `tests/` without spawning the listener.

pub mod vm_registry;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use vda_core::error::{AgentError, AgentResult};
use vda_rpc::{MethodArg, MethodHandler, MethodRegistry, MethodSchema};
use vm_registry::VmRegistry;

struct Echo;

#[async_trait]
impl MethodHandler for Echo {
    async fn call(&self, args: &HashMap<String, Value>) -> AgentResult<Value> {
        Ok(args.get("message").cloned().unwrap_or(Value::Null))
    }
}

struct Ping;

#[async_trait]
impl MethodHandler for Ping {
    async fn call(&self, _args: &HashMap<String, Value>) -> AgentResult<Value> {
        Ok(Value::Null)
    }
}

struct GetVmList {
    vms: Arc<VmRegistry>,
}

#[async_trait]
impl MethodHandler for GetVmList {
    async fn call(&self, _args: &HashMap<String, Value>) -> AgentResult<Value> {
        let list: Vec<_> = self
            .vms
            .list()
            .into_iter()
            .map(|vm| {
                serde_json::json!({
                    "uuid": vm.id.to_string(),
                    "status": format!("{:?}", vm.status),
                })
            })
            .collect();
        Ok(Value::Array(list))
    }
}

struct GetVmInfo {
    vms: Arc<VmRegistry>,
}

#[async_trait]
impl MethodHandler for GetVmInfo {
    async fn call(&self, args: &HashMap<String, Value>) -> AgentResult<Value> {
        let vm_id = args
            .get("vmID")
            .and_then(|v| v.as_str())
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
            .ok_or_else(|| AgentError::InvalidValue("vmID must be a UUID".to_string()))?;
        let vm = self
            .vms
            .get(vm_id)
            .ok_or_else(|| AgentError::business(1, "no such VM"))?;
        Ok(serde_json::json!({
            "uuid": vm.id.to_string(),
            "status": format!("{:?}", vm.status),
            "channelState": format!("{:?}", vm.channel_state),
        }))
    }
}

/// Registers every `Host.*` method the agent serves (§8 scenarios 1-3).
pub fn register_vm_methods(registry: &mut MethodRegistry, vms: Arc<VmRegistry>) {
    registry.register(
        MethodSchema::new("Host", "echo").arg(MethodArg::required("message")),
        Arc::new(Echo),
    );
    registry.register(MethodSchema::new("Host", "ping"), Arc::new(Ping));
    registry.register(
        MethodSchema::new("Host", "getVMList"),
        Arc::new(GetVmList { vms: vms.clone() }),
    );
    registry.register(
        MethodSchema::new("Host", "getVMInfo").arg(MethodArg::required("vmID")),
        Arc::new(GetVmInfo { vms }),
    );
}
