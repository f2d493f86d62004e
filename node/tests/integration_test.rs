//! End-to-end scenarios against the composition root's method registry
//! (§8): built on the same `register_vm_methods` wiring `main` uses, just
//! without the listener.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use vda_core::vm::VmStatus;
use vda_node::vm_registry::VmRegistry;
use vda_node::register_vm_methods;
use vda_recovery::RecoveryStore;
use vda_rpc::{Dispatcher, MethodRegistry, OverrideTable, RpcRequest};

fn dispatcher_with_empty_registry() -> (Dispatcher, Arc<VmRegistry>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let recovery = Arc::new(RecoveryStore::open(dir.path().join("recovery.db")).unwrap());
    let vms = Arc::new(VmRegistry::new(recovery));

    let mut registry = MethodRegistry::new();
    register_vm_methods(&mut registry, vms.clone());
    let dispatcher = Dispatcher::new(registry, OverrideTable::new(), Arc::new(AtomicBool::new(false)));
    dispatcher.mark_recovery_complete();
    (dispatcher, vms, dir)
}

fn req(method: &str, params: Option<serde_json::Value>, id: Option<serde_json::Value>) -> RpcRequest {
    RpcRequest {
        jsonrpc: "2.0".to_string(),
        method: method.to_string(),
        params,
        id,
    }
}

#[tokio::test]
async fn echo_rpc_returns_the_message_verbatim() {
    let (dispatcher, _vms, _dir) = dispatcher_with_empty_registry();
    let resp = dispatcher
        .dispatch(req(
            "Host.echo",
            Some(serde_json::json!({ "message": "hi" })),
            Some(serde_json::json!("1")),
        ))
        .await
        .unwrap();
    assert_eq!(resp.result.unwrap(), serde_json::json!("hi"));
    assert!(resp.error.is_none());
}

#[tokio::test]
async fn batch_with_one_notification_returns_a_single_response() {
    let (dispatcher, _vms, _dir) = dispatcher_with_empty_registry();
    let batch = vec![
        req("Host.echo", Some(serde_json::json!({ "message": "x" })), None),
        req("Host.ping", None, Some(serde_json::json!("2"))),
    ];
    let responses = dispatcher.dispatch_batch(batch).await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].id, Some(serde_json::json!("2")));
    assert_eq!(responses[0].result, Some(serde_json::Value::Null));
}

#[tokio::test]
async fn unknown_method_is_rejected_with_method_not_found() {
    let (dispatcher, _vms, _dir) = dispatcher_with_empty_registry();
    let resp = dispatcher
        .dispatch(req("Nope.nope", None, Some(serde_json::json!("9"))))
        .await
        .unwrap();
    let error = resp.error.unwrap();
    assert_eq!(error.code, -32601);
}

#[tokio::test]
async fn get_vm_list_and_get_vm_info_reflect_registry_state() {
    let (dispatcher, vms, _dir) = dispatcher_with_empty_registry();
    let vm_id = uuid::Uuid::new_v4();
    vms.set_status(vm_id, VmStatus::Up);

    let list_resp = dispatcher
        .dispatch(req("Host.getVMList", None, Some(serde_json::json!(1))))
        .await
        .unwrap();
    let list = list_resp.result.unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);

    let info_resp = dispatcher
        .dispatch(req(
            "Host.getVMInfo",
            Some(serde_json::json!({ "vmID": vm_id.to_string() })),
            Some(serde_json::json!(2)),
        ))
        .await
        .unwrap();
    let info = info_resp.result.unwrap();
    assert_eq!(info["uuid"], serde_json::json!(vm_id.to_string()));
    assert_eq!(info["status"], serde_json::json!("Up"));
}

#[tokio::test]
async fn get_vm_info_for_unknown_vm_is_a_business_error() {
    let (dispatcher, _vms, _dir) = dispatcher_with_empty_registry();
    let resp = dispatcher
        .dispatch(req(
            "Host.getVMInfo",
            Some(serde_json::json!({ "vmID": uuid::Uuid::new_v4().to_string() })),
            Some(serde_json::json!(3)),
        ))
        .await
        .unwrap();
    assert!(resp.error.is_some());
}
