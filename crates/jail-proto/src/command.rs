//! Command frames and replies.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::value::Value;

/// A command as sent by a client: a vector of string tokens.
///
/// The first token selects the verb (`"status"`, `"set"`, ...); the meaning
/// of the remaining tokens depends on the verb.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandFrame(pub Vec<String>);

impl CommandFrame {
    /// Build a frame from tokens.
    pub fn new(tokens: Vec<String>) -> Self {
        CommandFrame(tokens)
    }

    /// The verb token, if any.
    pub fn verb(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// All tokens after the verb.
    pub fn args(&self) -> &[String] {
        if self.0.is_empty() { &[] } else { &self.0[1..] }
    }

    /// Whether the frame carries no tokens at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> From<[&str; N]> for CommandFrame {
    fn from(tokens: [&str; N]) -> Self {
        CommandFrame(tokens.iter().map(|t| t.to_string()).collect())
    }
}

impl From<&[&str]> for CommandFrame {
    fn from(tokens: &[&str]) -> Self {
        CommandFrame(tokens.iter().map(|t| t.to_string()).collect())
    }
}

impl From<Vec<String>> for CommandFrame {
    fn from(tokens: Vec<String>) -> Self {
        CommandFrame(tokens)
    }
}

/// The server's answer to one command frame.
///
/// On the wire this is the two-element array `[code, value]`; code 0 means
/// success, anything else failure with the error text as value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(i32, Value)", into = "(i32, Value)")]
pub struct Reply {
    /// 0 on success, 1 on failure.
    pub code: i32,
    /// The payload (or error text).
    pub value: Value,
}

impl Reply {
    /// A successful reply carrying `value`.
    pub fn ok(value: impl Into<Value>) -> Self {
        Reply {
            code: 0,
            value: value.into(),
        }
    }

    /// A failed reply carrying the error text.
    pub fn err(message: impl std::fmt::Display) -> Self {
        Reply {
            code: 1,
            value: Value::Str(message.to_string()),
        }
    }

    /// Whether the command succeeded.
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

impl From<(i32, Value)> for Reply {
    fn from((code, value): (i32, Value)) -> Self {
        Reply { code, value }
    }
}

impl From<Reply> for (i32, Value) {
    fn from(reply: Reply) -> Self {
        (reply.code, reply.value)
    }
}

/// Parse a boolean token: `1/yes/true/on` and `0/no/false/off`,
/// case-insensitive.
pub fn parse_bool(token: &str) -> Result<bool, ProtocolError> {
    match token.to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Ok(true),
        "0" | "no" | "false" | "off" => Ok(false),
        _ => Err(ProtocolError::InvalidBoolean(token.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_tokens() {
        let cmd = CommandFrame::from(["set", "ssh", "maxretry", "5"]);
        assert_eq!(cmd.verb(), Some("set"));
        assert_eq!(cmd.args(), &["ssh", "maxretry", "5"]);
        assert!(CommandFrame::default().verb().is_none());
    }

    #[test]
    fn test_reply_wire_shape() {
        let reply = Reply::ok(Value::from("pong"));
        assert_eq!(serde_json::to_string(&reply).unwrap(), r#"[0,"pong"]"#);

        let decoded: Reply = serde_json::from_str(r#"[1,"no such jail"]"#).unwrap();
        assert!(!decoded.is_ok());
        assert_eq!(decoded.value.as_str(), Some("no such jail"));
    }

    #[test]
    fn test_parse_bool() {
        for t in ["yes", "YES", "true", "on", "1"] {
            assert!(parse_bool(t).unwrap());
        }
        for t in ["no", "False", "OFF", "0"] {
            assert!(!parse_bool(t).unwrap());
        }
        assert!(parse_bool("maybe").is_err());
    }
}
