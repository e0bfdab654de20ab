//! Wire protocol shared by the server and the client.
//!
//! Every frame is a JSON text message of the form:
//!
//! ```json
//! {"type": "clone_repo", "payload": {"owner": "acme", "repo": "widgets"}, "id": "7"}
//! ```
//!
//! - `type` is the message kind (`kind` is accepted as an alias when reading)
//! - `payload` is any JSON value and may be omitted
//! - `id` is optional; when a request carries one, the server echoes it on every
//!   `progress`, `<kind>_result` and `error` message it produces for that request
//!
//! A request of kind `K` succeeds with a `K_result` message and fails with an
//! `error` message whose payload carries `originalKind: K`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message kinds used by the protocol.
pub mod kinds {
    pub const AUTH: &str = "auth";
    pub const AUTH_SUCCESS: &str = "auth_success";
    pub const AUTH_FAILED: &str = "auth_failed";
    pub const WELCOME: &str = "welcome";
    pub const PROGRESS: &str = "progress";
    pub const ERROR: &str = "error";
    pub const SERVER_SHUTDOWN: &str = "server_shutdown";

    pub const CLONE_REPO: &str = "clone_repo";
    pub const GET_COMMITS: &str = "get_commits";
    pub const GET_DIFF: &str = "get_diff";
    pub const EXECUTE_COMMAND: &str = "execute_command";
    pub const COMMIT_CHANGES: &str = "commit_changes";
    pub const ROLLBACK: &str = "rollback";
    pub const CANCEL: &str = "cancel";

    /// Subscription kind that matches every inbound message.
    pub const WILDCARD: &str = "*";
}

/// Kind of the success response paired with a request kind.
pub fn result_kind(kind: &str) -> String {
    format!("{kind}_result")
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message kind (e.g., "execute_command", "progress").
    #[serde(rename = "type", alias = "kind")]
    pub kind: String,

    /// Kind-specific payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,

    /// Optional request identifier used for correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Message {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            id: None,
        }
    }

    /// Attach (or clear) a correlation id.
    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    /// Parse a raw text frame.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Serialize to a text frame.
    pub fn to_json(&self) -> String {
        // A Message only contains strings and JSON values, so this cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Build the `error` message for a failed request.
    pub fn error(message: impl Into<String>, original_kind: Option<&str>) -> Self {
        let payload = ErrorPayload {
            message: message.into(),
            original_kind: original_kind.map(str::to_string),
        };
        Self::new(kinds::ERROR, serde_json::to_value(payload).unwrap_or_default())
    }

    /// Build a `progress` message.
    pub fn progress(event: &ProgressEvent) -> Self {
        Self::new(kinds::PROGRESS, serde_json::to_value(event).unwrap_or_default())
    }

    /// Read `originalKind` from an `error` payload, if present.
    pub fn original_kind(&self) -> Option<&str> {
        self.payload.get("originalKind").and_then(Value::as_str)
    }
}

/// Payload of an `error` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_kind: Option<String>,
}

/// Payload of an `auth` message.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthPayload {
    pub secret: String,
}

/// Ephemeral status notification emitted while a request is in flight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Coarse stage name (e.g., "cloning", "output", "complete").
    pub stage: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Output stream name ("stdout" or "stderr") for output chunks.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ProgressEvent {
    pub fn stage(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ..Default::default()
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Output chunk from the AI tool.
    pub fn output(stream: &str, text: impl Into<String>) -> Self {
        Self {
            stage: "output".to_string(),
            message: None,
            stream: Some(stream.to_string()),
            text: Some(text.into()),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_type_field() {
        let msg = Message::parse(r#"{"type":"cancel","payload":{"owner":"a","repo":"b"}}"#)
            .unwrap();
        assert_eq!(msg.kind, "cancel");
        assert_eq!(msg.payload["owner"], "a");
        assert_eq!(msg.id, None);
    }

    #[test]
    fn parses_kind_alias_and_missing_payload() {
        let msg = Message::parse(r#"{"kind":"auth_success"}"#).unwrap();
        assert_eq!(msg.kind, "auth_success");
        assert!(msg.payload.is_null());
    }

    #[test]
    fn rejects_missing_kind() {
        assert!(Message::parse(r#"{"payload":{}}"#).is_err());
        assert!(Message::parse("not json").is_err());
    }

    #[test]
    fn serializes_without_empty_fields() {
        let json = Message::new(kinds::AUTH_SUCCESS, Value::Null).to_json();
        assert_eq!(json, r#"{"type":"auth_success"}"#);

        let json = Message::new("x", json!({"a": 1}))
            .with_id(Some("9".into()))
            .to_json();
        assert!(json.contains(r#""id":"9""#));
    }

    #[test]
    fn error_message_carries_original_kind() {
        let msg = Message::error("boom", Some(kinds::GET_DIFF));
        assert_eq!(msg.kind, "error");
        assert_eq!(msg.payload["message"], "boom");
        assert_eq!(msg.original_kind(), Some("get_diff"));

        let msg = Message::error("bad frame", None);
        assert!(msg.payload.get("originalKind").is_none());
    }

    #[test]
    fn result_kind_appends_suffix() {
        assert_eq!(result_kind("rollback"), "rollback_result");
    }

    #[test]
    fn progress_output_uses_type_field() {
        let msg = Message::progress(&ProgressEvent::output("stderr", "warn"));
        assert_eq!(msg.payload["stage"], "output");
        assert_eq!(msg.payload["type"], "stderr");
        assert_eq!(msg.payload["text"], "warn");
        assert!(msg.payload.get("message").is_none());
    }
}
