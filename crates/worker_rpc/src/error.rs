use std::{io, time::Duration};

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced while managing the worker transport.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("worker did not complete initialize: {0}")]
    Handshake(String),
    #[error("app-server not ready")]
    NotReady,
    #[error("transport task failed: {0}")]
    Transport(String),
    #[error("worker returned JSON-RPC error: {message}")]
    Rpc {
        code: Option<i64>,
        message: String,
        data: Option<Value>,
    },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("transport channel closed unexpectedly")]
    ChannelClosed,
}

impl BridgeError {
    /// Worker-reported error message, when there is one. The turn
    /// controller classifies recoverable failures off this string.
    pub fn rpc_message(&self) -> Option<&str> {
        match self {
            BridgeError::Rpc { message, .. } => Some(message),
            _ => None,
        }
    }
}
