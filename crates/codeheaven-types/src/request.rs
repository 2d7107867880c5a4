//! Inbound request envelope.

use serde::{Deserialize, Serialize};

/// A request to run a snippet of code.
///
/// Only the shape is checked during deserialization. Whether `language`
/// names a supported runtime and whether `code` is non-empty is decided by
/// the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: String,
    /// Collaboration room the request originates from. Used for logging and
    /// container labels.
    #[serde(rename = "sessionId", default)]
    pub session_id: String,
}

impl ExecutionRequest {
    pub fn new(
        code: impl Into<String>,
        language: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
            session_id: session_id.into(),
        }
    }

    /// Parse a request from a raw text frame.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// True when the code is empty or whitespace only.
    pub fn is_blank(&self) -> bool {
        self.code.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_envelope() {
        let req = ExecutionRequest::from_json(
            r#"{"code": "print(1+1)", "language": "python", "sessionId": "room-42"}"#,
        )
        .unwrap();
        assert_eq!(req.code, "print(1+1)");
        assert_eq!(req.language, "python");
        assert_eq!(req.session_id, "room-42");
    }

    #[test]
    fn test_session_id_is_optional() {
        let req = ExecutionRequest::from_json(r#"{"code": "x", "language": "c"}"#).unwrap();
        assert_eq!(req.session_id, "");
    }

    #[test]
    fn test_missing_code_fails() {
        assert!(ExecutionRequest::from_json(r#"{"language": "python"}"#).is_err());
        assert!(ExecutionRequest::from_json("not json").is_err());
    }

    #[test]
    fn test_blank_code() {
        assert!(ExecutionRequest::new("  \n\t", "python", "s").is_blank());
        assert!(!ExecutionRequest::new("x", "python", "s").is_blank());
    }
}
