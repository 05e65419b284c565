use std::{fs, os::unix::fs::PermissionsExt, path::PathBuf, time::Duration};

use crate::{ClientInfo, WorkerConfig};

/// Writes a fake worker that speaks the newline-JSON protocol well enough
/// to exercise the bridge: handshake, echo responses, a server-initiated
/// approval request, a request that never answers, and a hard exit.
pub(crate) fn write_fake_worker() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("fake-worker");
    let script = r#"#!/usr/bin/env python3
import json
import sys

def send(payload):
    sys.stdout.write(json.dumps(payload) + "\n")
    sys.stdout.flush()

for line in sys.stdin:
    if not line.strip():
        continue
    msg = json.loads(line)
    method = msg.get("method")
    req_id = msg.get("id")
    params = msg.get("params") or {}
    if method == "initialize":
        sys.stderr.write("fake worker ready\n")
        sys.stderr.flush()
        send({"id": req_id, "result": {"ok": True}})
    elif method == "initialized":
        pass
    elif method == "test/noReply":
        pass
    elif method == "test/serverRequest":
        send({"id": "srv-1", "method": "item/commandExecution/requestApproval",
              "params": {"threadId": "T", "turnId": "U", "command": "npm test"}})
        send({"id": req_id, "result": {"ok": True}})
    elif method == "test/exit":
        sys.exit(0)
    elif method is not None and req_id is not None:
        send({"id": req_id, "result": {"echo": params}})
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

pub(crate) fn fake_worker_config(binary: PathBuf) -> WorkerConfig {
    WorkerConfig {
        binary,
        args: Vec::new(),
        current_dir: None,
        env: Vec::new(),
        client_info: ClientInfo {
            name: "bridge-tests".to_string(),
            version: "0.0.0".to_string(),
        },
        startup_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_millis(500),
    }
}
