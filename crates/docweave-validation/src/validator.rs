//! Pre-flight document validation
//!
//! Pure functions: nothing here touches the store. A document that passes
//! [`validate`] carries every required field (defaults filled in) with a
//! value whose runtime type matches its declaration.

use std::ops::Deref;

use bson::{Bson, Document};
use docweave_common::ValidationError;

use crate::schema::{FieldConstraint, FieldType, Schema, UnknownFields};

/// A document that satisfied its schema, with defaults applied
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedDocument(Document);

impl ValidatedDocument {
    pub fn as_document(&self) -> &Document {
        &self.0
    }

    pub fn into_inner(self) -> Document {
        self.0
    }
}

impl Deref for ValidatedDocument {
    type Target = Document;

    fn deref(&self) -> &Document {
        &self.0
    }
}

impl From<ValidatedDocument> for Document {
    fn from(validated: ValidatedDocument) -> Self {
        validated.0
    }
}

/// Get the BSON type name for error messages
pub fn bson_type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Array(_) => "array",
        Bson::Document(_) => "object",
        Bson::Boolean(_) => "bool",
        Bson::Null => "null",
        Bson::Int32(_) => "int32",
        Bson::Int64(_) => "int64",
        Bson::Timestamp(_) => "timestamp",
        Bson::Binary(_) => "binary",
        Bson::ObjectId(_) => "objectid",
        Bson::DateTime(_) => "datetime",
        Bson::Symbol(_) => "symbol",
        Bson::Decimal128(_) => "decimal128",
        _ => "unknown",
    }
}

fn mismatch(field_path: &str, expected: &FieldType, value: &Bson) -> ValidationError {
    ValidationError::TypeMismatch {
        field: field_path.to_string(),
        expected: expected.type_name(),
        actual: bson_type_name(value).to_string(),
    }
}

/// Validate a single value against its declared type
///
/// Array items are checked one by one and reported as `field[index]`.
pub fn validate_value(
    field_path: &str,
    value: &Bson,
    expected: &FieldType,
) -> Result<(), ValidationError> {
    let matches = match expected {
        FieldType::Any => true,
        FieldType::Integer => matches!(value, Bson::Int32(_) | Bson::Int64(_)),
        FieldType::Number => matches!(value, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)),
        FieldType::Double => matches!(value, Bson::Double(_)),
        FieldType::String => matches!(value, Bson::String(_)),
        FieldType::Boolean => matches!(value, Bson::Boolean(_)),
        FieldType::DateTime => matches!(value, Bson::DateTime(_)),
        FieldType::ObjectId => matches!(value, Bson::ObjectId(_)),
        FieldType::Document => matches!(value, Bson::Document(_)),
        FieldType::Array(items) => match value {
            Bson::Array(elements) => {
                for (index, item) in elements.iter().enumerate() {
                    let item_path = format!("{}[{}]", field_path, index);
                    validate_value(&item_path, item, items)?;
                }
                true
            }
            _ => false,
        },
    };

    if matches {
        Ok(())
    } else {
        Err(mismatch(field_path, expected, value))
    }
}

/// Validate a whole document against a schema
///
/// Field order of the input is preserved; defaults for absent fields are
/// appended in schema order. `unique` is not checked here.
///
/// # Errors
/// Returns the first failure found: `UnknownField` (reject policy),
/// `TypeMismatch`, or `MissingField`.
pub fn validate(schema: &Schema, document: Document) -> Result<ValidatedDocument, ValidationError> {
    let mut normalized = Document::new();

    for (key, value) in document {
        let Some(field) = schema.field(&key) else {
            if key == "_id" {
                normalized.insert(key, value);
                continue;
            }
            match schema.unknown_fields() {
                UnknownFields::Keep => {
                    normalized.insert(key, value);
                }
                UnknownFields::Drop => {}
                UnknownFields::Reject => {
                    return Err(ValidationError::UnknownField {
                        field: key,
                        schema: schema.model().to_string(),
                    });
                }
            }
            continue;
        };

        // null counts as absent; defaults and the required check below apply
        if matches!(value, Bson::Null) {
            continue;
        }

        validate_value(&key, &value, field.field_type())?;
        normalized.insert(key, value);
    }

    for field in schema.fields() {
        if normalized.contains_key(field.name()) {
            continue;
        }
        match field.default() {
            Some(default) => {
                normalized.insert(field.name(), default.resolve());
            }
            None if field.is_required() => {
                return Err(ValidationError::MissingField {
                    field: field.name().to_string(),
                });
            }
            None => {}
        }
    }

    Ok(ValidatedDocument(normalized))
}

/// Validate the field values of a partial (`$set`) update
///
/// Absent fields are fine; setting a required field to null is not. Dotted
/// paths are checked against their root field: only `object` and `any`
/// roots can be entered. Returns the update with unknown fields handled per
/// the schema's policy.
pub fn validate_partial(schema: &Schema, fields: Document) -> Result<Document, ValidationError> {
    let mut checked = Document::new();

    for (key, value) in fields {
        let root = key.split('.').next().unwrap_or(&key);

        let Some(field) = schema.field(root) else {
            match schema.unknown_fields() {
                UnknownFields::Keep => {
                    checked.insert(key, value);
                }
                UnknownFields::Drop => {}
                UnknownFields::Reject => {
                    return Err(ValidationError::UnknownField {
                        field: key,
                        schema: schema.model().to_string(),
                    });
                }
            }
            continue;
        };

        if root != key {
            if !matches!(field.field_type(), FieldType::Document | FieldType::Any) {
                return Err(ValidationError::TypeMismatch {
                    field: key,
                    expected: field.field_type().type_name(),
                    actual: "object".to_string(),
                });
            }
        } else if matches!(value, Bson::Null) {
            if field.is_required() {
                return Err(ValidationError::MissingField { field: key });
            }
        } else {
            validate_value(&key, &value, field.field_type())?;
        }

        checked.insert(key, value);
    }

    Ok(checked)
}

/// How the schema treats the root of an update path
enum UpdatePath<'a> {
    Declared(&'a FieldConstraint),
    Undeclared,
    Dropped,
}

fn update_path<'a>(schema: &'a Schema, path: &str) -> Result<UpdatePath<'a>, ValidationError> {
    let root = path.split('.').next().unwrap_or(path);
    if let Some(field) = schema.field(root) {
        return Ok(UpdatePath::Declared(field));
    }
    match schema.unknown_fields() {
        UnknownFields::Keep => Ok(UpdatePath::Undeclared),
        UnknownFields::Drop => Ok(UpdatePath::Dropped),
        UnknownFields::Reject => Err(ValidationError::UnknownField {
            field: path.to_string(),
            schema: schema.model().to_string(),
        }),
    }
}

/// Check that a field may be removed (`$unset`)
///
/// Returns `false` when the schema drops the field from the update.
pub fn check_unset(schema: &Schema, field: &str) -> Result<bool, ValidationError> {
    match update_path(schema, field)? {
        UpdatePath::Dropped => Ok(false),
        UpdatePath::Declared(constraint) if constraint.name() == field && constraint.is_required() => {
            Err(ValidationError::MissingField {
                field: field.to_string(),
            })
        }
        _ => Ok(true),
    }
}

/// Check that a field may be incremented by `amount` (`$inc`)
///
/// Returns `false` when the schema drops the field from the update.
pub fn check_increment(schema: &Schema, field: &str, amount: &Bson) -> Result<bool, ValidationError> {
    if !matches!(amount, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) {
        return Err(mismatch(field, &FieldType::Number, amount));
    }

    let constraint = match update_path(schema, field)? {
        UpdatePath::Dropped => return Ok(false),
        UpdatePath::Undeclared => return Ok(true),
        UpdatePath::Declared(constraint) => constraint,
    };

    if constraint.name() != field {
        // dotted path: only object and any roots can be entered
        return match constraint.field_type() {
            FieldType::Document | FieldType::Any => Ok(true),
            other => Err(ValidationError::TypeMismatch {
                field: field.to_string(),
                expected: other.type_name(),
                actual: "object".to_string(),
            }),
        };
    }

    match constraint.field_type() {
        FieldType::Integer if matches!(amount, Bson::Double(_)) => {
            Err(mismatch(field, &FieldType::Integer, amount))
        }
        other if !other.is_numeric() => Err(ValidationError::TypeMismatch {
            field: field.to_string(),
            expected: other.type_name(),
            actual: bson_type_name(amount).to_string(),
        }),
        _ => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldConstraint;
    use bson::{doc, oid::ObjectId};

    fn post_schema() -> Schema {
        Schema::builder("Post")
            .field(FieldConstraint::new("id", FieldType::Integer).required().unique())
            .field(FieldConstraint::new("title", FieldType::String).required())
            .field(FieldConstraint::new("authorId", FieldType::Integer).required())
            .field(FieldConstraint::new("likes", FieldType::Integer).default_value(0))
            .field(FieldConstraint::new("tags", FieldType::Array(Box::new(FieldType::String))))
            .field(FieldConstraint::new("meta", FieldType::Document))
            .build()
            .unwrap()
    }

    #[test]
    fn test_valid_document_gets_defaults() {
        let validated =
            validate(&post_schema(), doc! { "id": 1, "title": "A", "authorId": 2 }).unwrap();
        assert_eq!(
            validated.into_inner(),
            doc! { "id": 1, "title": "A", "authorId": 2, "likes": 0 }
        );
    }

    #[test]
    fn test_valid_document_unchanged_when_complete() {
        let input = doc! { "id": 1, "title": "A", "authorId": 2, "likes": 7, "tags": ["x"] };
        let validated = validate(&post_schema(), input.clone()).unwrap();
        assert_eq!(validated.as_document(), &input);
    }

    #[test]
    fn test_missing_required_field() {
        let err = validate(&post_schema(), doc! { "id": 1, "authorId": 2 }).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingField {
                field: "title".to_string()
            }
        );
    }

    #[test]
    fn test_null_required_field_is_missing() {
        let err = validate(
            &post_schema(),
            doc! { "id": 1, "title": Bson::Null, "authorId": 2 },
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::MissingField { .. }));
    }

    #[test]
    fn test_required_field_with_default_is_filled() {
        let schema = Schema::builder("Flag")
            .field(FieldConstraint::new("enabled", FieldType::Boolean).required().default_value(false))
            .build()
            .unwrap();
        let validated = validate(&schema, doc! {}).unwrap();
        assert_eq!(validated.get_bool("enabled").unwrap(), false);
    }

    #[test]
    fn test_type_mismatch() {
        let err = validate(
            &post_schema(),
            doc! { "id": "one", "title": "A", "authorId": 2 },
        )
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::TypeMismatch {
                field: "id".to_string(),
                expected: "integer".to_string(),
                actual: "string".to_string(),
            }
        );
    }

    #[test]
    fn test_array_item_mismatch_reports_index() {
        let err = validate(
            &post_schema(),
            doc! { "id": 1, "title": "A", "authorId": 2, "tags": ["ok", 3] },
        )
        .unwrap_err();
        assert_eq!(err.field(), "tags[1]");
    }

    #[test]
    fn test_number_accepts_all_numerics() {
        for value in [Bson::Int32(1), Bson::Int64(2), Bson::Double(3.5)] {
            assert!(validate_value("n", &value, &FieldType::Number).is_ok());
        }
        assert!(validate_value("n", &Bson::Double(1.0), &FieldType::Integer).is_err());
        assert!(validate_value("n", &Bson::Int32(1), &FieldType::Double).is_err());
    }

    #[test]
    fn test_id_always_accepted() {
        let id = ObjectId::new();
        let validated = validate(
            &post_schema(),
            doc! { "_id": id, "id": 1, "title": "A", "authorId": 2 },
        )
        .unwrap();
        assert_eq!(validated.get_object_id("_id").unwrap(), id);
    }

    #[test]
    fn test_unknown_fields_policies() {
        let input = doc! { "id": 1, "title": "A", "authorId": 2, "extra": true };

        let dropped = validate(&post_schema(), input.clone()).unwrap();
        assert!(!dropped.contains_key("extra"));

        let keep = Schema::builder("Post")
            .field(FieldConstraint::new("id", FieldType::Integer))
            .unknown_fields(UnknownFields::Keep)
            .build()
            .unwrap();
        assert!(validate(&keep, input.clone()).unwrap().contains_key("extra"));

        let reject = Schema::builder("Post")
            .field(FieldConstraint::new("id", FieldType::Integer))
            .unknown_fields(UnknownFields::Reject)
            .build()
            .unwrap();
        let err = validate(&reject, input).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownField { .. }));
    }

    #[test]
    fn test_validate_partial() {
        let schema = post_schema();
        let checked = validate_partial(&schema, doc! { "title": "B", "junk": 1 }).unwrap();
        assert_eq!(checked, doc! { "title": "B" });

        let err = validate_partial(&schema, doc! { "likes": "lots" }).unwrap_err();
        assert!(matches!(err, ValidationError::TypeMismatch { .. }));

        let err = validate_partial(&schema, doc! { "title": Bson::Null }).unwrap_err();
        assert!(matches!(err, ValidationError::MissingField { .. }));

        assert!(validate_partial(&schema, doc! { "meta.source": "import" }).is_ok());
        assert!(validate_partial(&schema, doc! { "title.sub": "x" }).is_err());
    }

    #[test]
    fn test_check_unset_and_increment() {
        let schema = post_schema();
        assert_eq!(check_unset(&schema, "tags"), Ok(true));
        assert!(check_unset(&schema, "title").is_err());

        assert_eq!(check_increment(&schema, "likes", &Bson::Int32(1)), Ok(true));
        assert_eq!(check_increment(&schema, "meta.views", &Bson::Int32(1)), Ok(true));
        assert!(check_increment(&schema, "title.n", &Bson::Int32(1)).is_err());
        assert!(check_increment(&schema, "likes", &Bson::Double(0.5)).is_err());
        assert!(check_increment(&schema, "title", &Bson::Int32(1)).is_err());
        assert!(check_increment(&schema, "likes", &Bson::String("1".into())).is_err());
    }

    #[test]
    fn test_update_paths_follow_unknown_field_policy() {
        let policy = |unknown| {
            Schema::builder("Post")
                .field(FieldConstraint::new("id", FieldType::Integer).required())
                .field(FieldConstraint::new("likes", FieldType::Integer))
                .unknown_fields(unknown)
                .build()
                .unwrap()
        };

        let drop = policy(UnknownFields::Drop);
        assert_eq!(check_increment(&drop, "colour", &Bson::Int32(1)), Ok(false));
        assert_eq!(check_unset(&drop, "colour"), Ok(false));

        let keep = policy(UnknownFields::Keep);
        assert_eq!(check_increment(&keep, "colour", &Bson::Int32(1)), Ok(true));
        assert_eq!(check_unset(&keep, "colour.shade"), Ok(true));

        let reject = policy(UnknownFields::Reject);
        let err = check_increment(&reject, "colour", &Bson::Int32(1)).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownField { ref field, .. } if field == "colour"));
        let err = check_unset(&reject, "colour").unwrap_err();
        assert!(matches!(err, ValidationError::UnknownField { .. }));
    }
}
