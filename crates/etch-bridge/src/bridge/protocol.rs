//! Wire protocol types for bridge-debuggee communication.
//!
//! The debuggee reads requests on stdin and writes events/responses on stdout,
//! one JSON record per line:
//! - **Outgoing**: `{"seq":1,"type":"request","command":"...","arguments":{...}}`
//! - **Incoming**: `{"type":"event",...}` or `{"type":"response",...}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request sent to the debuggee. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingRequest {
    pub seq: u64,
    #[serde(rename = "type")]
    kind: RequestKind,
    pub command: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum RequestKind {
    Request,
}

impl OutgoingRequest {
    /// Build a request. `null` arguments are normalized to `{}`.
    pub fn new(seq: u64, command: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        Self {
            seq,
            kind: RequestKind::Request,
            command: command.into(),
            arguments,
        }
    }
}

/// A record produced by the debuggee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IncomingMessage {
    Event {
        event: String,
        #[serde(default)]
        body: Value,
    },

    Response {
        command: String,
        #[serde(default)]
        body: Value,
        #[serde(default = "default_success")]
        success: bool,
        /// Present when the debuggee echoes the request's sequence number.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_seq: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

fn default_success() -> bool {
    true
}

impl IncomingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Event { .. } => "event",
            Self::Response { .. } => "response",
        }
    }

    /// Event name or response command.
    pub fn name(&self) -> &str {
        match self {
            Self::Event { event, .. } => event,
            Self::Response { command, .. } => command,
        }
    }
}
