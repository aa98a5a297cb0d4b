//! Push messages and their payload.

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, warn};

/// A push message delivered by the push service.
#[derive(Debug, Clone, Default)]
pub struct PushMessage {
    data: Option<Bytes>,
}

impl PushMessage {
    /// A message carrying raw payload bytes.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: Some(data.into()),
        }
    }

    /// A message without a payload.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A message carrying a JSON payload.
    pub fn json(value: &Value) -> Self {
        Self::new(value.to_string())
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }
}

/// The fields a push payload may carry. Anything else is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub url: Option<String>,
}

impl PushPayload {
    /// Read the payload of a push message.
    ///
    /// A missing body, malformed JSON or a non-object value all yield the
    /// empty payload. Fields that are not non-empty strings count as absent.
    pub fn parse(data: Option<&[u8]>) -> Self {
        let Some(bytes) = data else {
            return Self::default();
        };

        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(map)) => {
                let field = |name: &str| {
                    map.get(name)
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                };
                Self {
                    title: field("title"),
                    body: field("body"),
                    url: field("url"),
                }
            }
            Ok(other) => {
                debug!(kind = json_kind(&other), "Push payload is not an object, using defaults");
                Self::default()
            }
            Err(e) => {
                warn!(error = %e, len = bytes.len(), "Malformed push payload, using defaults");
                Self::default()
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
