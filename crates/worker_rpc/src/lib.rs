#![forbid(unsafe_code)]
//! Stdio JSON-RPC bridge to the coding-agent worker process.
//!
//! The gateway spawns one worker subprocess that speaks newline-delimited
//! JSON over its standard streams. [`WorkerBridge`] owns the child and
//! exposes three surfaces:
//!
//! - `request(method, params)`: correlated request/response with a fresh
//!   positive integer id and a 30 s timeout per call.
//! - `notify(method, params)` and `respond(id, result)`: fire-and-forget
//!   writes, the latter answering a server-initiated request.
//! - `subscribe()`: a stream of [`BridgeEvent`]s covering status
//!   transitions, worker stderr lines, and every inbound object carrying
//!   a `method`.
//!
//! `start()` performs the `initialize` → `initialized` handshake and bumps
//! the worker **generation**; consumers holding per-request state (pending
//! approvals, interactions) key it by generation so entries from a dead
//! worker are recognizably stale. Child spawn failure and child exit both
//! transition the bridge to `Disconnected` and reject in-flight requests;
//! callers then see [`BridgeError::NotReady`] until the next `start()`.

mod bridge;
mod error;
mod protocol;
mod transport;

pub use bridge::{BridgeStatusReport, WorkerBridge};
pub use error::BridgeError;
pub use protocol::{
    BridgeEvent, BridgeEventStream, BridgeStatus, ClientInfo, InitializeParams, RpcId,
    ServerMessage, WorkerConfig, METHOD_APP_LIST, METHOD_COLLABORATION_MODE_LIST,
    METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_MODEL_LIST, METHOD_RATE_LIMITS_READ,
    METHOD_REVIEW_START, METHOD_SKILLS_LIST, METHOD_THREAD_FORK, METHOD_THREAD_LIST,
    METHOD_THREAD_READ, METHOD_THREAD_RESUME, METHOD_THREAD_START, METHOD_TURN_INTERRUPT,
    METHOD_TURN_START,
};

#[cfg(test)]
pub(crate) mod test_support;
#[cfg(test)]
mod tests_flows;
