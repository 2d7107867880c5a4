//! Outbound message envelope.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// The kind of a message sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Connection and lifecycle notices.
    System,
    /// A chunk of program stdout.
    Output,
    /// Program stderr, request rejections and execution faults.
    Error,
    /// Natural completion of an execution. Always the last message of a run.
    End,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::System => "system",
            MessageType::Output => "output",
            MessageType::Error => "error",
            MessageType::End => "end",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message sent from the execution service to the client.
///
/// `timestamp` is serialized as RFC 3339 and omitted when absent. High
/// frequency `output` frames carry no timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl ClientMessage {
    /// Create a message stamped with the current time.
    pub fn new(message_type: MessageType, data: impl Into<String>) -> Self {
        Self {
            message_type,
            data: data.into(),
            timestamp: Some(now_rfc3339()),
        }
    }

    /// Create a message without a timestamp.
    pub fn untimed(message_type: MessageType, data: impl Into<String>) -> Self {
        Self {
            message_type,
            data: data.into(),
            timestamp: None,
        }
    }

    pub fn system(data: impl Into<String>) -> Self {
        Self::new(MessageType::System, data)
    }

    /// Program stdout. Never timestamped.
    pub fn output(data: impl Into<String>) -> Self {
        Self::untimed(MessageType::Output, data)
    }

    pub fn error(data: impl Into<String>) -> Self {
        Self::new(MessageType::Error, data)
    }

    pub fn end(data: impl Into<String>) -> Self {
        Self::new(MessageType::End, data)
    }

    /// Attach an explicit timestamp.
    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at.to_rfc3339_opts(SecondsFormat::Millis, true));
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_output_omits_timestamp() {
        let msg = ClientMessage::output("2\n");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "output", "data": "2\n"}));
    }

    #[test]
    fn test_error_carries_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let msg = ClientMessage::error("boom").with_timestamp(at);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["timestamp"], "2024-03-01T12:30:00.000Z");
    }

    #[test]
    fn test_constructors_set_timestamp_by_kind() {
        assert!(ClientMessage::system("hi").timestamp.is_some());
        assert!(ClientMessage::end("done").timestamp.is_some());
        assert!(ClientMessage::output("x").timestamp.is_none());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let parsed: Result<ClientMessage, _> =
            serde_json::from_str(r#"{"type": "progress", "data": "50%"}"#);
        assert!(parsed.is_err());
    }
}
