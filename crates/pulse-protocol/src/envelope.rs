//! Outbound JSON envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorBody, HandlerError};

/// A single outbound frame body.
///
/// Serializes as `{"data": <payload>}` or
/// `{"error": {"message": "...", "stack": "..."}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Envelope {
    Data(Value),
    Error(ErrorBody),
}

impl Envelope {
    pub fn data(value: impl Into<Value>) -> Self {
        Self::Data(value.into())
    }

    pub fn error(err: &HandlerError) -> Self {
        Self::Error(err.to_body())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<Result<Value, HandlerError>> for Envelope {
    fn from(result: Result<Value, HandlerError>) -> Self {
        match result {
            Ok(value) => Self::Data(value),
            Err(err) => Self::error(&err),
        }
    }
}
