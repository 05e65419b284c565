use std::{fs, os::unix::fs::PermissionsExt, path::PathBuf, sync::Arc, time::Duration};

use gateway::{
    config::GatewayConfig,
    state::{build_gateway, AppState},
    store::Store,
};
use worker_rpc::{ClientInfo, WorkerBridge, WorkerConfig};

/// Fake app-server speaking the worker protocol. Threads whose id starts
/// with `cold` reject until resumed; special input markers trigger
/// server-initiated approval/interaction requests and turn completion.
/// Pass `--collab-unsupported` as an argument to make it reject
/// `collaborationMode/list` the way older workers do.
pub fn write_fake_app_server() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("fake-app-server");
    let script = r#"#!/usr/bin/env python3
import json
import sys

collab_unsupported = "--collab-unsupported" in sys.argv
resumed = set()
turn_counter = 0

def send(payload):
    sys.stdout.write(json.dumps(payload) + "\n")
    sys.stdout.flush()

def error(req_id, message):
    send({"id": req_id, "error": {"code": -32000, "message": message}})

for line in sys.stdin:
    if not line.strip():
        continue
    msg = json.loads(line)
    method = msg.get("method")
    req_id = msg.get("id")
    params = msg.get("params") or {}
    if method == "initialize":
        send({"id": req_id, "result": {}})
    elif method == "initialized":
        pass
    elif method == "thread/start":
        send({"id": req_id, "result": {"thread": {"id": "th-1"}}})
    elif method == "thread/fork":
        send({"id": req_id, "result": {"thread": {"id": "th-fork"}}})
    elif method == "thread/resume":
        resumed.add(params.get("threadId"))
        send({"id": req_id, "result": {"thread": {"id": params.get("threadId")}}})
    elif method == "thread/read":
        tid = params.get("threadId") or ""
        if tid == "gone":
            error(req_id, "no rollout found")
        elif tid.startswith("cold") and tid not in resumed:
            error(req_id, "thread not loaded: " + tid)
        else:
            send({"id": req_id, "result": {"thread": {"id": tid}}})
    elif method == "turn/start":
        tid = params.get("threadId") or ""
        if tid.startswith("cold") and tid not in resumed:
            error(req_id, "thread not loaded: " + tid)
            continue
        turn_counter += 1
        turn_id = "turn-%d" % turn_counter
        send({"id": req_id, "result": {"turn": {"id": turn_id}, "echoParams": params}})
        texts = " ".join(
            item.get("text", "")
            for item in params.get("input", [])
            if isinstance(item, dict)
        )
        if "needs-approval" in texts:
            send({"id": 99, "method": "item/commandExecution/requestApproval",
                  "params": {"threadId": tid, "turnId": turn_id, "command": "npm test"}})
        if "needs-input" in texts:
            send({"id": 199, "method": "item/tool/requestUserInput",
                  "params": {"threadId": tid, "turnId": turn_id, "questions": [
                      {"id": "q1", "header": "Env", "question": "Which environment?",
                       "isOther": False, "isSecret": False,
                       "options": [{"label": "Staging"}, {"label": "Prod"}]}]}})
        if "then-complete" in texts:
            send({"method": "turn/completed",
                  "params": {"threadId": tid, "turnId": turn_id}})
    elif method == "turn/interrupt":
        send({"id": req_id, "result": {}})
    elif method == "review/start":
        send({"id": req_id, "result": {"review": {"id": "rev-1"}, "echoParams": params}})
    elif method == "collaborationMode/list":
        if collab_unsupported:
            error(req_id, "unsupported method: collaborationMode/list")
        else:
            send({"id": req_id, "result": {"items": [
                {"name": "Plan", "mode": "plan", "model": "planner-1",
                 "reasoning_effort": "high", "developer_instructions": "plan first"},
                {"name": "Default", "mode": "default"}]}})
    elif method == "skills/list":
        send({"id": req_id, "result": {"skills": [
            {"name": "same-token", "path": "/skills/same-token", "enabled": True}]}})
    elif method == "app/list":
        send({"id": req_id, "result": {"items": [
            {"id": "same-token", "name": "Same Token", "isAccessible": True, "isEnabled": True},
            {"id": "other-app", "name": "Other", "isAccessible": True, "isEnabled": True}]}})
    elif method == "model/list":
        if params.get("cursor") == "p2":
            send({"id": req_id, "result": {"items": [{"id": "m2"}, {"id": "m3"}]}})
        else:
            send({"id": req_id, "result": {"items": [{"id": "m1"}, {"id": "m2"}],
                                           "nextCursor": "p2"}})
    elif method == "account/rateLimits/read":
        send({"id": req_id, "result": {"rateLimits": {"remaining": 10}}})
    elif method == "thread/list":
        send({"id": req_id, "result": {"items": [
            {"id": "th-1", "title": "First", "status": "idle",
             "updatedAt": "2026-01-01T00:00:00Z"}]}})
    elif method is not None and req_id is not None:
        send({"id": req_id, "result": {}})
    elif method is None and req_id is not None:
        send({"method": "test/respondEcho",
              "params": {"id": req_id, "result": msg.get("result")}})
"#;

    fs::write(&script_path, script).expect("write script");
    let mut perms = fs::metadata(&script_path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms).expect("chmod");
    (dir, script_path)
}

/// Full gateway state over an in-memory store and the fake worker.
pub async fn start_gateway(collab_unsupported: bool) -> (tempfile::TempDir, AppState) {
    let (dir, script) = write_fake_app_server();

    let mut worker_config = WorkerConfig::new(&script);
    if collab_unsupported {
        worker_config.args = vec!["--collab-unsupported".into()];
    }
    worker_config.client_info = ClientInfo {
        name: "gateway-tests".to_string(),
        version: "0.0.0".to_string(),
    };
    worker_config.startup_timeout = Duration::from_secs(5);
    worker_config.request_timeout = Duration::from_secs(2);

    let bridge = Arc::new(WorkerBridge::new(worker_config));
    bridge.start().await.expect("bridge start");

    let store = Store::open_in_memory().expect("store");
    let state = build_gateway(GatewayConfig::default(), store, bridge)
        .await
        .expect("gateway state");
    (dir, state)
}

/// Polls until `probe` yields `Some`, failing after ~2 s. Worker
/// notifications reach the dispatcher asynchronously.
pub async fn wait_for<T, F, Fut>(mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for _ in 0..100 {
        if let Some(value) = probe().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within timeout");
}
