//! Request and response payloads carried inside frames.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Kind of request a client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// Liveness probe, answered with a PONG.
    #[serde(rename = "PING", alias = "ping")]
    Ping,
    /// Anything else; answered with an acknowledgement of `data`.
    #[serde(rename = "GENERIC", other)]
    Generic,
}

/// A client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: RequestKind,
    #[serde(default)]
    pub client_id: String,
    /// Milliseconds since the Unix epoch when the request was built.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub data: String,
}

impl Request {
    /// Build a PING for `client_id` stamped with the current time.
    pub fn ping(client_id: &str, sequence: u64) -> Self {
        Self {
            kind: RequestKind::Ping,
            client_id: client_id.to_string(),
            timestamp: now_millis(),
            sequence,
            data: format!("PING {sequence} from client {client_id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    #[serde(rename = "PONG")]
    Pong,
    #[serde(rename = "GENERIC_RESPONSE")]
    GenericResponse,
    #[serde(rename = "ERROR")]
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// A server response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub status: ResponseStatus,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default)]
    pub message: String,
}

impl Response {
    /// Compute the reply for a well-formed request.
    pub fn reply_to(request: &Request) -> Self {
        match request.kind {
            RequestKind::Ping => Self {
                kind: ResponseKind::Pong,
                status: ResponseStatus::Success,
                timestamp: now_millis(),
                original_timestamp: Some(request.timestamp),
                client_id: Some(request.client_id.clone()),
                sequence: Some(request.sequence),
                message: format!("PONG for {}", request.client_id),
            },
            RequestKind::Generic => Self {
                kind: ResponseKind::GenericResponse,
                status: ResponseStatus::Success,
                timestamp: now_millis(),
                original_timestamp: None,
                client_id: None,
                sequence: None,
                message: format!("Processed: {}", request.data),
            },
        }
    }

    /// An error reply for a frame that could not be decoded.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Error,
            status: ResponseStatus::Error,
            timestamp: now_millis(),
            original_timestamp: None,
            client_id: None,
            sequence: None,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
