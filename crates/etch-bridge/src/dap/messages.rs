//! Debug Adapter Protocol message shapes exchanged with the front end.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub seq: u64,
    #[serde(rename = "type")]
    pub type_: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

impl Request {
    pub fn new(seq: u64, command: impl Into<String>, arguments: Value) -> Self {
        Self {
            seq,
            type_: "request".to_string(),
            command: command.into(),
            arguments,
        }
    }
}

/// A response to a front-end request. `seq` is stamped by the writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub seq: u64,
    #[serde(rename = "type")]
    pub type_: String,
    pub request_seq: u64,
    pub success: bool,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Response {
    pub fn success(request: &Request, body: Option<Value>) -> Self {
        Self::for_request(request.seq, &request.command, body)
    }

    /// Successful response built from a request's identity, for deferred replies.
    pub fn for_request(request_seq: u64, command: &str, body: Option<Value>) -> Self {
        Self {
            seq: 0,
            type_: "response".to_string(),
            request_seq,
            success: true,
            command: command.to_string(),
            message: None,
            body,
        }
    }

    /// Error response carrying a numeric error id, as DAP clients expect.
    pub fn error(request: &Request, id: u32, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            seq: 0,
            type_: "response".to_string(),
            request_seq: request.seq,
            success: false,
            command: request.command.clone(),
            body: Some(json!({
                "error": {
                    "id": id,
                    "format": message,
                    "showUser": true,
                }
            })),
            message: Some(message),
        }
    }
}

/// An event sent to the front end. `seq` is stamped by the writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    #[serde(rename = "type")]
    pub type_: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Event {
    pub fn new(event: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            seq: 0,
            type_: "event".to_string(),
            event: event.into(),
            body,
        }
    }

    pub fn initialized() -> Self {
        Self::new("initialized", None)
    }

    pub fn terminated() -> Self {
        Self::new("terminated", None)
    }

    pub fn exited(exit_code: i32) -> Self {
        Self::new("exited", Some(json!({ "exitCode": exit_code })))
    }

    pub fn stopped(reason: &str, thread_id: i64) -> Self {
        Self::new(
            "stopped",
            Some(json!({ "reason": reason, "threadId": thread_id })),
        )
    }

    pub fn output(output: &str, category: &str) -> Self {
        Self::new(
            "output",
            Some(json!({ "category": category, "output": output })),
        )
    }
}

/// Anything the adapter writes to the front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutgoingMessage {
    Response(Response),
    Event(Event),
}

impl OutgoingMessage {
    pub fn set_seq(&mut self, seq: u64) {
        match self {
            Self::Response(r) => r.seq = seq,
            Self::Event(e) => e.seq = seq,
        }
    }

    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Self::Event(e) => Some(e),
            Self::Response(_) => None,
        }
    }
}

impl From<Response> for OutgoingMessage {
    fn from(value: Response) -> Self {
        Self::Response(value)
    }
}

impl From<Event> for OutgoingMessage {
    fn from(value: Event) -> Self {
        Self::Event(value)
    }
}
