//! Collection and field name validation
//!
//! Names reach the store verbatim, so they are checked before any filter,
//! update, or pipeline stage is built from them.

use docweave_common::ValidationError;
use tracing::warn;

/// Maximum allowed length for collection names (MongoDB limit is 255, we're more conservative)
pub const MAX_COLLECTION_NAME_LENGTH: usize = 120;

/// Maximum allowed length for field names
pub const MAX_FIELD_NAME_LENGTH: usize = 1024;

fn invalid(name: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidName {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Validated collection name
///
/// # Guarantees
/// - Not empty
/// - Maximum 120 characters
/// - No null bytes
/// - No "system." prefix (system collections)
/// - No $ characters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValidatedCollectionName {
    name: String,
}

impl ValidatedCollectionName {
    /// Creates a new validated collection name
    pub fn new(name: &str) -> Result<Self, ValidationError> {
        if name.is_empty() {
            return Err(invalid(name, "collection name cannot be empty"));
        }

        if name.len() > MAX_COLLECTION_NAME_LENGTH {
            return Err(invalid(
                name,
                format!(
                    "collection name exceeds maximum length of {} characters",
                    MAX_COLLECTION_NAME_LENGTH
                ),
            ));
        }

        if name.contains('\0') {
            return Err(invalid(name, "collection name cannot contain null bytes"));
        }

        if name.starts_with("system.") {
            return Err(invalid(name, "collection name cannot start with 'system.' (reserved)"));
        }

        if name.contains('$') {
            return Err(invalid(name, "collection name cannot contain '$' character"));
        }

        // Suspicious but legal
        if name.contains("..") || name.contains("//") {
            warn!(collection = %name, "Collection name contains suspicious pattern");
        }

        Ok(ValidatedCollectionName {
            name: name.to_string(),
        })
    }

    /// Returns the validated collection name as a string slice
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Consumes the ValidatedCollectionName and returns the inner String
    pub fn into_string(self) -> String {
        self.name
    }
}

impl AsRef<str> for ValidatedCollectionName {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for ValidatedCollectionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Validated field name or dotted field path
///
/// # Guarantees
/// - Not empty
/// - Maximum 1024 characters
/// - No null bytes
/// - No $ prefix (operators are never field names)
/// - No empty segment in a dotted path ("a..b", ".a", "a.")
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValidatedFieldName {
    name: String,
}

impl ValidatedFieldName {
    /// Creates a new validated field name
    pub fn new(name: &str) -> Result<Self, ValidationError> {
        if name.is_empty() {
            return Err(invalid(name, "field name cannot be empty"));
        }

        if name.len() > MAX_FIELD_NAME_LENGTH {
            return Err(invalid(
                name,
                format!(
                    "field name exceeds maximum length of {} characters",
                    MAX_FIELD_NAME_LENGTH
                ),
            ));
        }

        if name.contains('\0') {
            return Err(invalid(name, "field name cannot contain null bytes"));
        }

        if name.starts_with('$') {
            return Err(invalid(
                name,
                "field name cannot start with '$' (reserved for operators)",
            ));
        }

        if name.split('.').any(str::is_empty) {
            return Err(invalid(name, "field path contains an empty segment"));
        }

        Ok(ValidatedFieldName {
            name: name.to_string(),
        })
    }

    /// Returns the validated field name as a string slice
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// First segment of a dotted path ("address" for "address.city")
    pub fn root(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }

    /// Consumes the ValidatedFieldName and returns the inner String
    pub fn into_string(self) -> String {
        self.name
    }
}

impl AsRef<str> for ValidatedFieldName {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for ValidatedFieldName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason_of(err: ValidationError) -> String {
        match err {
            ValidationError::InvalidName { reason, .. } => reason,
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_valid_collection_names() {
        for name in ["users", "posts", "my_collection", "test123"] {
            assert!(
                ValidatedCollectionName::new(name).is_ok(),
                "Should accept valid name: {}",
                name
            );
        }
    }

    #[test]
    fn test_empty_collection_name() {
        let result = ValidatedCollectionName::new("");
        assert!(reason_of(result.unwrap_err()).contains("empty"));
    }

    #[test]
    fn test_collection_name_too_long() {
        let long_name = "a".repeat(MAX_COLLECTION_NAME_LENGTH + 1);
        let result = ValidatedCollectionName::new(&long_name);
        assert!(reason_of(result.unwrap_err()).contains("maximum length"));
    }

    #[test]
    fn test_system_collection_blocked() {
        let result = ValidatedCollectionName::new("system.users");
        assert!(reason_of(result.unwrap_err()).contains("system."));
    }

    #[test]
    fn test_collection_name_with_dollar_sign() {
        let result = ValidatedCollectionName::new("$users");
        assert!(reason_of(result.unwrap_err()).contains("$"));
    }

    #[test]
    fn test_collection_name_with_null_byte() {
        let result = ValidatedCollectionName::new("test\0collection");
        assert!(reason_of(result.unwrap_err()).contains("null bytes"));
    }

    #[test]
    fn test_validated_collection_name_display() {
        let validated = ValidatedCollectionName::new("users").unwrap();
        assert_eq!(validated.as_str(), "users");
        assert_eq!(validated.to_string(), "users");
    }

    #[test]
    fn test_valid_field_names() {
        for name in ["email", "authorId", "_id", "address.city", "POSTS"] {
            assert!(
                ValidatedFieldName::new(name).is_ok(),
                "Should accept valid field name: {}",
                name
            );
        }
    }

    #[test]
    fn test_field_name_with_operator_prefix() {
        let result = ValidatedFieldName::new("$where");
        assert!(reason_of(result.unwrap_err()).contains("$"));
    }

    #[test]
    fn test_field_path_with_empty_segment() {
        for name in ["a..b", ".a", "a."] {
            let result = ValidatedFieldName::new(name);
            assert!(reason_of(result.unwrap_err()).contains("empty segment"));
        }
    }

    #[test]
    fn test_field_name_too_long() {
        let long_name = "a".repeat(MAX_FIELD_NAME_LENGTH + 1);
        assert!(ValidatedFieldName::new(&long_name).is_err());
    }

    #[test]
    fn test_field_name_root() {
        let field = ValidatedFieldName::new("address.city").unwrap();
        assert_eq!(field.root(), "address");
        assert_eq!(ValidatedFieldName::new("likes").unwrap().root(), "likes");
    }
}
