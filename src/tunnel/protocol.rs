//! Wire frames exchanged with the control plane.
//!
//! Every tunnel carries JSON text messages. Binary bodies are base64-encoded
//! so frames stay valid UTF-8.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved command URL answered by the agent itself.
pub const HEALTHCHECK_COMMAND: &str = "healthcheck";

/// Header multimap: name → all values in arrival order.
pub type HeaderMultimap = BTreeMap<String, Vec<String>>;

/// Remote invocation of the local request handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub message_id: String,
    #[serde(default)]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HeaderMultimap,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

/// Reply to an [`ExecuteRequest`]; `message_id` is echoed verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub message_id: String,
    pub status: i64,
    #[serde(default)]
    pub headers: HeaderMultimap,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    Text,
    Healthcheck,
}

/// Outbound-only frame of the event tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFrame {
    pub opcode: Opcode,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

impl EventFrame {
    pub fn healthcheck() -> Self {
        Self {
            opcode: Opcode::Healthcheck,
            body: Vec::new(),
        }
    }

    pub fn text(body: Vec<u8>) -> Self {
        Self {
            opcode: Opcode::Text,
            body,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamRequestType {
    #[default]
    Normal,
    Healthcheck,
}

/// Request to open one logical push-stream on a relay tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub stream_id: String,
    #[serde(default)]
    pub execution_id: String,
    #[serde(default)]
    pub request_type: StreamRequestType,
}

impl StreamRequest {
    pub fn is_healthcheck(&self) -> bool {
        self.request_type == StreamRequestType::Healthcheck
    }
}

/// One response unit of a logical stream. `seq_no` starts at 0 per `stream_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFrame<P> {
    pub stream_id: String,
    pub seq_no: u32,
    pub payload: P,
    #[serde(default)]
    pub is_error: bool,
}

/// Payload types a relay can carry. The relay needs to synthesize the
/// health-check reply and the resolution-error frame itself.
pub trait FramePayload: Serialize + Send + Sync + 'static {
    fn empty() -> Self;
    fn error(message: String) -> Self;
}

/// A single line of execution log output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogLine(pub String);

impl FramePayload for LogLine {
    fn empty() -> Self {
        Self::default()
    }

    fn error(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for LogLine {
    fn from(line: &str) -> Self {
        Self(line.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    #[default]
    Log,
    Output,
    Result,
    Error,
}

/// Workflow notification as sent on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, rename = "ref")]
    pub reference: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    #[serde(default)]
    pub message: String,
}

impl FramePayload for Notification {
    fn empty() -> Self {
        Self::default()
    }

    fn error(message: String) -> Self {
        Self {
            timestamp: format_timestamp(Utc::now()),
            reference: String::new(),
            kind: NotificationType::Error,
            message,
        }
    }
}

/// Notification as produced by the execution side, before typing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionNotification {
    pub ts: DateTime<Utc>,
    #[serde(default, rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub log: Option<String>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
}

impl From<ExecutionNotification> for Notification {
    /// A result wins over an output, an output wins over a log line.
    fn from(n: ExecutionNotification) -> Self {
        let (kind, message) = if let Some(result) = n.result {
            (NotificationType::Result, result.to_string())
        } else if let Some(output) = n.output {
            (NotificationType::Output, output.to_string())
        } else {
            (NotificationType::Log, n.log.unwrap_or_default())
        };
        Self {
            timestamp: format_timestamp(n.ts),
            reference: n.reference,
            kind,
            message,
        }
    }
}

/// RFC 3339 with nanoseconds, the format used for every timestamp on the wire.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn execute_request_decodes_camel_case_and_base64_body() {
        let req: ExecuteRequest = serde_json::from_value(json!({
            "messageId": "m-1",
            "method": "POST",
            "url": "/v1/tests",
            "headers": {"Content-Type": ["application/json"]},
            "body": "eyJhIjoxfQ==",
        }))
        .unwrap();
        assert_eq!(req.message_id, "m-1");
        assert_eq!(req.headers["Content-Type"], vec!["application/json"]);
        assert_eq!(req.body, br#"{"a":1}"#);
    }

    #[test]
    fn healthcheck_request_needs_only_id_and_url() {
        let req: ExecuteRequest =
            serde_json::from_str(r#"{"messageId":"hs1","url":"healthcheck"}"#).unwrap();
        assert_eq!(req.url, HEALTHCHECK_COMMAND);
        assert!(req.method.is_empty());
        assert!(req.body.is_empty());
    }

    #[test]
    fn stream_request_type_defaults_to_normal() {
        let req: StreamRequest =
            serde_json::from_str(r#"{"streamId":"s","executionId":"e"}"#).unwrap();
        assert!(!req.is_healthcheck());
        let req: StreamRequest =
            serde_json::from_str(r#"{"streamId":"ping","executionId":"ping","requestType":"HEALTHCHECK"}"#)
                .unwrap();
        assert!(req.is_healthcheck());
    }

    #[test]
    fn event_frame_uses_uppercase_opcodes() {
        let encoded = serde_json::to_value(EventFrame::healthcheck()).unwrap();
        assert_eq!(encoded, json!({"opcode": "HEALTHCHECK", "body": ""}));
    }

    #[test]
    fn log_frame_payload_is_a_plain_string() {
        let frame = StreamFrame {
            stream_id: "s1".into(),
            seq_no: 3,
            payload: LogLine::from("hello"),
            is_error: false,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"streamId": "s1", "seqNo": 3, "payload": "hello", "isError": false})
        );
    }

    #[test]
    fn notification_type_prefers_result_then_output() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let base = ExecutionNotification {
            ts,
            reference: "step1".into(),
            log: Some("line".into()),
            output: Some(json!({"progress": 1})),
            result: Some(json!({"status": "passed"})),
        };

        let n = Notification::from(base.clone());
        assert_eq!(n.kind, NotificationType::Result);
        assert_eq!(n.message, r#"{"status":"passed"}"#);
        assert_eq!(n.reference, "step1");
        assert_eq!(n.timestamp, "2024-05-01T10:00:00.000000000Z");

        let n = Notification::from(ExecutionNotification {
            result: None,
            ..base.clone()
        });
        assert_eq!(n.kind, NotificationType::Output);

        let n = Notification::from(ExecutionNotification {
            result: None,
            output: None,
            ..base
        });
        assert_eq!(n.kind, NotificationType::Log);
        assert_eq!(n.message, "line");
    }

    #[test]
    fn error_notification_is_typed_error() {
        let n = Notification::error("boom".into());
        assert_eq!(n.kind, NotificationType::Error);
        assert_eq!(n.message, "boom");
    }
}
