//! Docweave Validation
//!
//! Schema declarations and pre-flight document validation.
//!
//! A [`Schema`] is an ordered set of [`FieldConstraint`]s bound to one
//! collection. [`validate`] checks a document against it before anything is
//! written to the store, substituting defaults for absent fields.
//!
//! # Example
//!
//! ```rust
//! use bson::doc;
//! use docweave_validation::{validate, FieldConstraint, FieldType, Schema};
//!
//! let schema = Schema::builder("Post")
//!     .field(FieldConstraint::new("id", FieldType::Integer).required().unique())
//!     .field(FieldConstraint::new("title", FieldType::String).required())
//!     .field(FieldConstraint::new("likes", FieldType::Integer).default_value(0))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(schema.collection(), "posts");
//!
//! let validated = validate(&schema, doc! { "id": 1, "title": "A" }).unwrap();
//! assert_eq!(validated.get_i32("likes").unwrap(), 0);
//!
//! assert!(validate(&schema, doc! { "id": 2 }).is_err());
//! ```

pub mod names;
pub mod schema;
pub mod validator;

pub use docweave_common::{DocweaveError, Result, ValidationError};
pub use names::{ValidatedCollectionName, ValidatedFieldName};
pub use schema::{
    default_collection_name, DefaultValue, FieldConstraint, FieldType, Schema, SchemaBuilder,
    UnknownFields,
};
pub use validator::{
    bson_type_name, check_increment, check_unset, validate, validate_partial, validate_value,
    ValidatedDocument,
};
