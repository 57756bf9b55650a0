//! Error taxonomy for the store, query, and indexing subsystems.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error type used for driver failures, matching what storage and
/// search backends naturally produce. Surfaced verbatim; the core never
/// retries.
pub type DriverError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    /// Caller bug: an update node with edges or children has no author id.
    #[error("no source specified for id: {id} kind: {kind}")]
    NoSource { kind: String, id: String },

    /// Caller bug: a pending child carried a pre-assigned id.
    #[error("child id must be empty before execute, found: {id}")]
    NonEmptyChildId { id: String },

    /// Caller bug: `Context::num_chars_unique` was zero at execute time.
    #[error("invalid number of chars for generating unique ids")]
    InvalidNumCharsUnique,

    /// An update tree flattened to nothing.
    #[error("no instructions generated")]
    EmptyBatch,

    /// Id-candidate exhaustion; the id space for the configured length is
    /// close to full.
    #[error("unable to find a new id after {0} attempts")]
    IdExhausted(usize),

    #[error("empty entity id")]
    EmptyId,

    /// No `_parent_` edge found for the entity.
    #[error("no parent found for id: {0}")]
    NoParent(String),

    /// A doc presented to a search engine was not strictly newer than the
    /// version already held for its `(kind, id)`.
    #[error("version conflict for {kind}/{id}")]
    VersionConflict { kind: String, id: String },

    #[error("json encoding: {0}")]
    Json(#[from] serde_json::Error),

    #[error("instruction codec: {0}")]
    Codec(#[from] bincode::Error),

    #[error("driver: {0}")]
    Driver(#[from] DriverError),
}

pub const E_OK: &str = "E_OK";
pub const E_ERROR: &str = "E_ERROR";
pub const E_INVALID_METHOD: &str = "E_INVALID_METHOD";
pub const E_INVALID_REQUEST: &str = "E_INVALID_REQUEST";
pub const E_INVALID_USER: &str = "E_INVALID_USER";
pub const E_MISSING_REQUIRED: &str = "E_MISSING_REQUIRED";
pub const E_UNAUTHORIZED: &str = "E_UNAUTHORIZED";

/// Status object served at the HTTP boundary. The facade itself lives outside
/// this crate; the wire shape is fixed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub code: String,
    pub message: String,
}

impl Status {
    pub fn new(code: &str, message: impl Into<String>) -> Status {
        Status {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn ok(message: impl Into<String>) -> Status {
        Status::new(E_OK, message)
    }
}

impl From<&Error> for Status {
    fn from(err: &Error) -> Status {
        let code = match err {
            Error::NoSource { .. } | Error::EmptyId | Error::InvalidNumCharsUnique => {
                E_MISSING_REQUIRED
            }
            Error::NonEmptyChildId { .. } => E_INVALID_REQUEST,
            _ => E_ERROR,
        };
        Status::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_to_code_message_json() {
        let status = Status::ok("Stored");
        let js = serde_json::to_value(&status).unwrap();
        assert_eq!(js, serde_json::json!({"code": "E_OK", "message": "Stored"}));
    }

    #[test]
    fn build_errors_map_to_missing_required() {
        let err = Error::NoSource {
            kind: "Post".into(),
            id: "p1".into(),
        };
        assert_eq!(Status::from(&err).code, E_MISSING_REQUIRED);
    }
}
