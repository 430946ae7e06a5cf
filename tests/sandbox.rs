//! Sandbox behavior through the full relay path

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{MARK, client_for, dispatcher_for, sandbox_with_tools};
use courier_relay::relay::types::{RelayRequest, ResponseStatus};
use courier_relay::sandbox::{ExecutionResult, Outcome};
use courier_relay::MemoryStore;

const HOST: &str = "host-1";

fn tool_call(tool: &str, args: serde_json::Value) -> RelayRequest {
    RelayRequest::new(
        HOST,
        None,
        "/tools/run",
        "POST",
        json!({ "tool": tool, "args": args }).to_string().into_bytes(),
    )
}

#[tokio::test]
async fn remote_rejection_leaves_no_side_effects() {
    let store = MemoryStore::new();
    let (_tools, sandbox) = sandbox_with_tools(&[MARK]);
    let dispatcher = dispatcher_for(&store, HOST, sandbox);
    let dispatch_task = tokio::spawn(Arc::clone(&dispatcher).run());

    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("marker");

    // Path traversal in the argument: rejected, and the marker file proves
    // no subprocess ever ran
    let client = client_for(&store, Duration::from_secs(10));
    let evil = format!("{}/../marker", marker.display());
    let response = client
        .send(tool_call("mark", json!({ "path": evil })))
        .await
        .unwrap();

    assert_eq!(response.status, ResponseStatus::Error);
    let result: ExecutionResult = serde_json::from_slice(&response.payload).unwrap();
    assert_eq!(result.outcome, Outcome::Rejected);
    assert!(!marker.exists());
    assert!(!scratch.path().join("..").join("marker").exists());

    dispatch_task.abort();
}

#[tokio::test]
async fn missing_required_argument_never_executes() {
    let store = MemoryStore::new();
    let (_tools, sandbox) = sandbox_with_tools(&[MARK]);
    let dispatcher = dispatcher_for(&store, HOST, sandbox);
    let dispatch_task = tokio::spawn(Arc::clone(&dispatcher).run());

    let client = client_for(&store, Duration::from_secs(10));
    let response = client.send(tool_call("mark", json!({}))).await.unwrap();

    assert_eq!(response.status_code, 422);
    let result: ExecutionResult = serde_json::from_slice(&response.payload).unwrap();
    assert_eq!(result.outcome, Outcome::Rejected);
    assert!(result.stderr.contains("path"));

    dispatch_task.abort();
}

#[tokio::test]
async fn well_formed_invocation_executes() {
    let store = MemoryStore::new();
    let (_tools, sandbox) = sandbox_with_tools(&[MARK]);
    let dispatcher = dispatcher_for(&store, HOST, sandbox);
    let dispatch_task = tokio::spawn(Arc::clone(&dispatcher).run());

    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("marker");

    let client = client_for(&store, Duration::from_secs(10));
    let response = client
        .send(tool_call("mark", json!({ "path": marker.display().to_string() })))
        .await
        .unwrap();

    assert_eq!(response.status, ResponseStatus::Success);
    assert!(marker.exists());

    dispatch_task.abort();
}

#[tokio::test]
async fn malformed_invocation_payload_is_a_validation_error() {
    let store = MemoryStore::new();
    let (_tools, sandbox) = sandbox_with_tools(&[MARK]);
    let dispatcher = dispatcher_for(&store, HOST, sandbox);
    let dispatch_task = tokio::spawn(Arc::clone(&dispatcher).run());

    let client = client_for(&store, Duration::from_secs(10));
    let request = RelayRequest::new(HOST, None, "/tools/run", "POST", b"not json".to_vec());
    let response = client.send(request).await.unwrap();

    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.status_code, 400);

    dispatch_task.abort();
}

#[tokio::test]
async fn tools_list_endpoint_describes_the_registry() {
    let store = MemoryStore::new();
    let (_tools, sandbox) = sandbox_with_tools(&[MARK]);
    let dispatcher = dispatcher_for(&store, HOST, sandbox);
    let dispatch_task = tokio::spawn(Arc::clone(&dispatcher).run());

    let client = client_for(&store, Duration::from_secs(10));
    let request = RelayRequest::new(HOST, None, "/tools/list", "GET", vec![]);
    let response = client.send(request).await.unwrap();

    assert_eq!(response.status, ResponseStatus::Success);
    let listed: serde_json::Value = serde_json::from_slice(&response.payload).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["name"], "mark");

    dispatch_task.abort();
}
