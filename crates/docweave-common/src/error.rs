//! Error types for docweave

use thiserror::Error;

/// Result type alias for docweave operations
pub type Result<T> = std::result::Result<T, DocweaveError>;

/// MongoDB server code for a duplicate key on a unique index
pub const DUPLICATE_KEY_CODE: i32 = 11000;

/// Pre-flight document validation failure.
///
/// Raised locally before any request reaches the store. Never retryable:
/// the caller has to fix the document.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// A required field is absent (or null) and has no default
    #[error("field '{field}' is required")]
    MissingField { field: String },

    /// A field value has a runtime type the schema does not allow
    #[error("field '{field}' expected type '{expected}', got '{actual}'")]
    TypeMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    /// A field is not declared and the schema rejects unknown fields
    #[error("field '{field}' is not declared in schema '{schema}'")]
    UnknownField { field: String, schema: String },

    /// A collection or field name is not well-formed
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
}

impl ValidationError {
    /// Name of the offending field (or the rejected name itself)
    pub fn field(&self) -> &str {
        match self {
            ValidationError::MissingField { field }
            | ValidationError::TypeMismatch { field, .. }
            | ValidationError::UnknownField { field, .. } => field,
            ValidationError::InvalidName { name, .. } => name,
        }
    }
}

/// Unified error type for all docweave operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DocweaveError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The store refused the request (constraint or query error).
    /// `code` carries the server error code when one was reported.
    #[error("Store rejected operation: {message}")]
    StoreRejected { code: Option<i32>, message: String },

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Unsupported aggregator: {0}")]
    UnsupportedAggregator(String),

    #[error("Unsupported field type: {0}")]
    UnsupportedFieldType(String),

    #[error("Malformed pipeline: {0}")]
    MalformedPipeline(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The per-call deadline elapsed before the store replied
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl DocweaveError {
    /// Shorthand for a store rejection without a server code
    pub fn rejected(message: impl Into<String>) -> Self {
        DocweaveError::StoreRejected {
            code: None,
            message: message.into(),
        }
    }

    /// Returns true if the store reported a constraint violation
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, DocweaveError::StoreRejected { code: Some(_), .. })
    }

    /// Returns true if the store rejected a duplicate key on a unique index
    pub fn is_duplicate_key(&self) -> bool {
        matches!(
            self,
            DocweaveError::StoreRejected {
                code: Some(DUPLICATE_KEY_CODE),
                ..
            }
        )
    }

    /// Returns the validation failure, if this is one
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            DocweaveError::Validation(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for DocweaveError {
    fn from(err: serde_json::Error) -> Self {
        DocweaveError::Serialization(err.to_string())
    }
}

// MongoDB-specific error conversions (when mongodb-errors feature is enabled)
#[cfg(feature = "mongodb-errors")]
impl From<mongodb::error::Error> for DocweaveError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::{ErrorKind, WriteFailure};

        let message = err.to_string();
        match err.kind.as_ref() {
            ErrorKind::ServerSelection { .. }
            | ErrorKind::Io(_)
            | ErrorKind::ConnectionPoolCleared { .. } => DocweaveError::NotConnected(message),
            ErrorKind::Write(WriteFailure::WriteError(write_error)) => {
                DocweaveError::StoreRejected {
                    code: Some(write_error.code),
                    message,
                }
            }
            ErrorKind::Command(command_error) => DocweaveError::StoreRejected {
                code: Some(command_error.code),
                message,
            },
            ErrorKind::InsertMany(insert_error) => DocweaveError::StoreRejected {
                code: insert_error
                    .write_errors
                    .as_ref()
                    .and_then(|errors| errors.first())
                    .map(|first| first.code),
                message,
            },
            _ => DocweaveError::StoreRejected {
                code: None,
                message,
            },
        }
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::ser::Error> for DocweaveError {
    fn from(err: bson::ser::Error) -> Self {
        DocweaveError::Serialization(format!("BSON serialization error: {}", err))
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::de::Error> for DocweaveError {
    fn from(err: bson::de::Error) -> Self {
        DocweaveError::Deserialization(format!("BSON deserialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_validation() {
        let err: DocweaveError = ValidationError::MissingField {
            field: "title".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "Validation error: field 'title' is required");
    }

    #[test]
    fn test_error_display_type_mismatch() {
        let err = ValidationError::TypeMismatch {
            field: "likes".to_string(),
            expected: "integer".to_string(),
            actual: "string".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "field 'likes' expected type 'integer', got 'string'"
        );
        assert_eq!(err.field(), "likes");
    }

    #[test]
    fn test_error_display_store_rejected() {
        let err = DocweaveError::rejected("duplicate key");
        assert_eq!(err.to_string(), "Store rejected operation: duplicate key");
    }

    #[test]
    fn test_error_display_not_connected() {
        let err = DocweaveError::NotConnected("session closed".to_string());
        assert_eq!(err.to_string(), "Not connected: session closed");
    }

    #[test]
    fn test_error_display_timeout() {
        let err = DocweaveError::Timeout("find on posts".to_string());
        assert_eq!(err.to_string(), "Timeout: find on posts");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: DocweaveError = json_err.into();
        assert!(matches!(err, DocweaveError::Serialization(_)));
    }

    #[test]
    fn test_is_duplicate_key() {
        let dup = DocweaveError::StoreRejected {
            code: Some(crate::DUPLICATE_KEY_CODE),
            message: "E11000".to_string(),
        };
        assert!(dup.is_duplicate_key());
        assert!(dup.is_constraint_violation());

        let other = DocweaveError::StoreRejected {
            code: Some(2),
            message: "bad value".to_string(),
        };
        assert!(!other.is_duplicate_key());
        assert!(!DocweaveError::rejected("no code").is_constraint_violation());
    }

    #[test]
    fn test_as_validation() {
        let err: DocweaveError = ValidationError::MissingField {
            field: "id".to_string(),
        }
        .into();
        assert_eq!(err.as_validation().map(|v| v.field()), Some("id"));
        assert!(DocweaveError::NotConnected("x".to_string())
            .as_validation()
            .is_none());
    }
}
