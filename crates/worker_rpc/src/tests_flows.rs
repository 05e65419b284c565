use std::time::Duration;

use serde_json::{json, Value};
use tokio::time;

use crate::{
    test_support::{fake_worker_config, write_fake_worker},
    BridgeError, BridgeEvent, BridgeStatus, RpcId, WorkerBridge,
};

async fn started_bridge() -> (tempfile::TempDir, WorkerBridge) {
    let (dir, script) = write_fake_worker();
    let bridge = WorkerBridge::new(fake_worker_config(script));
    bridge.start().await.expect("bridge start");
    (dir, bridge)
}

#[tokio::test]
async fn handshake_reaches_initialized_and_bumps_generation() {
    let (_dir, bridge) = started_bridge().await;
    let report = bridge.status().await;
    assert_eq!(report.status, BridgeStatus::Initialized);
    assert_eq!(report.generation, 1);
    assert!(report.error_message.is_none());

    bridge.start().await.expect("restart");
    assert_eq!(bridge.generation(), 2);
}

#[tokio::test]
async fn request_gets_correlated_response() {
    let (_dir, bridge) = started_bridge().await;
    let result = bridge
        .request("thread/read", json!({"threadId": "T"}))
        .await
        .expect("request");
    assert_eq!(result, json!({"echo": {"threadId": "T"}}));
}

#[tokio::test]
async fn concurrent_requests_do_not_cross_wires() {
    let (_dir, bridge) = started_bridge().await;
    let bridge = std::sync::Arc::new(bridge);

    let mut handles = Vec::new();
    for n in 0..8 {
        let bridge = bridge.clone();
        handles.push(tokio::spawn(async move {
            bridge.request("echo", json!({"n": n})).await
        }));
    }
    for (n, handle) in handles.into_iter().enumerate() {
        let result = handle.await.expect("join").expect("request");
        assert_eq!(result, json!({"echo": {"n": n}}));
    }
}

#[tokio::test]
async fn unanswered_request_times_out_and_frees_slot() {
    let (_dir, bridge) = started_bridge().await;
    let err = bridge
        .request("test/noReply", Value::Null)
        .await
        .expect_err("should time out");
    assert!(matches!(err, BridgeError::Timeout(_)));

    // The transport is still healthy for later calls.
    let result = bridge.request("echo", json!({})).await.expect("request");
    assert_eq!(result, json!({"echo": {}}));
}

#[tokio::test]
async fn server_initiated_request_fans_out_and_respond_round_trips() {
    let (_dir, bridge) = started_bridge().await;
    let mut events = bridge.subscribe().await;

    bridge
        .request("test/serverRequest", Value::Null)
        .await
        .expect("trigger");

    let message = loop {
        let event = time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event timeout")
            .expect("event value");
        if let BridgeEvent::Message(message) = event {
            break message;
        }
    };
    assert_eq!(message.method, "item/commandExecution/requestApproval");
    assert_eq!(message.id, Some(RpcId::Str("srv-1".to_string())));
    assert_eq!(
        message.params.get("command").and_then(Value::as_str),
        Some("npm test")
    );

    bridge
        .respond(&RpcId::Str("srv-1".to_string()), json!({"decision": "accept"}))
        .await
        .expect("respond");

    let echoed = loop {
        let event = time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("echo timeout")
            .expect("echo value");
        if let BridgeEvent::Message(message) = event {
            if message.method == "test/respondEcho" {
                break message;
            }
        }
    };
    assert_eq!(
        echoed.params.get("result"),
        Some(&json!({"decision": "accept"}))
    );
}

#[tokio::test]
async fn stderr_lines_are_forwarded() {
    let (dir, script) = write_fake_worker();
    let bridge = WorkerBridge::new(fake_worker_config(script));
    let mut events = bridge.subscribe().await;
    bridge.start().await.expect("bridge start");

    let line = loop {
        let event = time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("stderr timeout")
            .expect("stderr value");
        if let BridgeEvent::Stderr(line) = event {
            break line;
        }
    };
    assert_eq!(line, "fake worker ready");
    drop(dir);
}

#[tokio::test]
async fn child_exit_rejects_pending_and_reports_not_ready() {
    let (_dir, bridge) = started_bridge().await;
    let mut events = bridge.subscribe().await;

    // The exit request never gets an answer; the slot must be rejected
    // when the stream closes rather than waiting out the timeout.
    let err = bridge
        .request("test/exit", Value::Null)
        .await
        .expect_err("exit rejects");
    assert!(matches!(
        err,
        BridgeError::ChannelClosed | BridgeError::Timeout(_)
    ));

    let status = loop {
        let event = time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("status timeout")
            .expect("status value");
        if let BridgeEvent::Status { status, .. } = event {
            if status == BridgeStatus::Disconnected {
                break status;
            }
        }
    };
    assert_eq!(status, BridgeStatus::Disconnected);

    let err = bridge
        .request("echo", Value::Null)
        .await
        .expect_err("not ready");
    assert!(matches!(err, BridgeError::NotReady));
}
