//! Schema declarations
//!
//! Field types form a closed set; every declaration is checked when the
//! schema is built, never at first use.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bson::Bson;
use docweave_common::{DocweaveError, Result};

use crate::names::{ValidatedCollectionName, ValidatedFieldName};
use crate::validator::validate_value;

/// Semantic type of a schema field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    /// Int32 or Int64
    Integer,
    /// Any numeric value (Int32, Int64, Double)
    Number,
    /// Double-precision float
    Double,
    String,
    Boolean,
    DateTime,
    ObjectId,
    /// Array whose items all have the inner type
    Array(Box<FieldType>),
    /// Embedded document (contents unchecked)
    Document,
    /// Any value
    Any,
}

impl FieldType {
    /// Parse a declared type name.
    ///
    /// Accepts the usual ODM spellings (`Number`, `String`, `Boolean`,
    /// `Date`, `ObjectId`, `Mixed`, ...) case-insensitively, plus `[T]` for
    /// arrays. Anything else is an `UnsupportedFieldType` error.
    pub fn parse(name: &str) -> Result<Self> {
        let trimmed = name.trim();

        if let Some(inner) = trimmed
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
        {
            let items = if inner.trim().is_empty() {
                FieldType::Any
            } else {
                FieldType::parse(inner)?
            };
            return Ok(FieldType::Array(Box::new(items)));
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "integer" | "int" | "int32" | "int64" | "long" => Ok(FieldType::Integer),
            "number" => Ok(FieldType::Number),
            "double" | "float" | "decimal" => Ok(FieldType::Double),
            "string" | "str" => Ok(FieldType::String),
            "boolean" | "bool" => Ok(FieldType::Boolean),
            "date" | "datetime" => Ok(FieldType::DateTime),
            "objectid" => Ok(FieldType::ObjectId),
            "array" => Ok(FieldType::Array(Box::new(FieldType::Any))),
            "object" | "document" | "map" => Ok(FieldType::Document),
            "mixed" | "any" => Ok(FieldType::Any),
            _ => Err(DocweaveError::UnsupportedFieldType(name.to_string())),
        }
    }

    /// Get the human-readable type name
    pub fn type_name(&self) -> String {
        match self {
            FieldType::Integer => "integer".to_string(),
            FieldType::Number => "number".to_string(),
            FieldType::Double => "double".to_string(),
            FieldType::String => "string".to_string(),
            FieldType::Boolean => "bool".to_string(),
            FieldType::DateTime => "datetime".to_string(),
            FieldType::ObjectId => "objectid".to_string(),
            FieldType::Array(items) => format!("array<{}>", items.type_name()),
            FieldType::Document => "object".to_string(),
            FieldType::Any => "any".to_string(),
        }
    }

    /// True for types `$inc` may be applied to
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldType::Integer | FieldType::Number | FieldType::Double | FieldType::Any
        )
    }
}

impl FromStr for FieldType {
    type Err = DocweaveError;

    fn from_str(s: &str) -> Result<Self> {
        FieldType::parse(s)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Value substituted when a field is absent
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    /// A literal value
    Value(Bson),
    /// The current time, resolved on each validation
    Now,
}

impl DefaultValue {
    /// Produce the concrete value to insert
    pub fn resolve(&self) -> Bson {
        match self {
            DefaultValue::Value(value) => value.clone(),
            DefaultValue::Now => Bson::DateTime(bson::DateTime::from_chrono(chrono::Utc::now())),
        }
    }
}

/// One declared attribute of a schema
#[derive(Debug, Clone, PartialEq)]
pub struct FieldConstraint {
    name: String,
    field_type: FieldType,
    required: bool,
    unique: bool,
    default: Option<DefaultValue>,
}

impl FieldConstraint {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            unique: false,
            default: None,
        }
    }

    /// Declare a field from a type name such as `"Number"` or `"[String]"`
    pub fn typed(name: impl Into<String>, type_name: &str) -> Result<Self> {
        Ok(Self::new(name, FieldType::parse(type_name)?))
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Mark the field unique. Enforced by the store's unique index only.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Bson>) -> Self {
        self.default = Some(DefaultValue::Value(value.into()));
        self
    }

    /// Default to the current timestamp
    pub fn default_now(mut self) -> Self {
        self.default = Some(DefaultValue::Now);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> &FieldType {
        &self.field_type
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn default(&self) -> Option<&DefaultValue> {
        self.default.as_ref()
    }

    fn check(&self) -> Result<()> {
        ValidatedFieldName::new(&self.name)?;

        if self.name.contains('.') {
            return Err(DocweaveError::InvalidSchema(format!(
                "field '{}' must be a top-level name, not a dotted path",
                self.name
            )));
        }

        match &self.default {
            Some(DefaultValue::Value(value)) => {
                validate_value(&self.name, value, &self.field_type).map_err(|err| {
                    DocweaveError::InvalidSchema(format!(
                        "default for field '{}' does not match its type: {}",
                        self.name, err
                    ))
                })
            }
            Some(DefaultValue::Now)
                if !matches!(self.field_type, FieldType::DateTime | FieldType::Any) =>
            {
                Err(DocweaveError::InvalidSchema(format!(
                    "field '{}' of type '{}' cannot default to the current time",
                    self.name, self.field_type
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Policy for fields a document carries but the schema does not declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownFields {
    /// Silently remove them before writing
    #[default]
    Drop,
    /// Write them through untouched
    Keep,
    /// Fail validation with `UnknownField`
    Reject,
}

/// Ordered set of field constraints bound to one collection
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    model: String,
    collection: String,
    fields: Vec<FieldConstraint>,
    positions: HashMap<String, usize>,
    unknown_fields: UnknownFields,
}

impl Schema {
    /// Start declaring a schema for the given model name
    pub fn builder(model: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder::new(model)
    }

    /// Model name ("Post")
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Collection name ("posts")
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Field constraints in declaration order
    pub fn fields(&self) -> &[FieldConstraint] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldConstraint> {
        self.positions.get(name).map(|&index| &self.fields[index])
    }

    pub fn unknown_fields(&self) -> UnknownFields {
        self.unknown_fields
    }

    /// Names of fields that need a unique index in the store
    pub fn unique_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|field| field.is_unique())
            .map(|field| field.name())
    }
}

/// Builder for [`Schema`]
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    model: String,
    collection: Option<String>,
    fields: Vec<FieldConstraint>,
    unknown_fields: UnknownFields,
}

impl SchemaBuilder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            collection: None,
            fields: Vec::new(),
            unknown_fields: UnknownFields::default(),
        }
    }

    /// Override the collection name derived from the model name
    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collection = Some(name.into());
        self
    }

    pub fn field(mut self, field: FieldConstraint) -> Self {
        self.fields.push(field);
        self
    }

    pub fn unknown_fields(mut self, policy: UnknownFields) -> Self {
        self.unknown_fields = policy;
        self
    }

    /// Check every declaration and freeze the schema
    pub fn build(self) -> Result<Schema> {
        if self.model.trim().is_empty() {
            return Err(DocweaveError::InvalidSchema(
                "model name cannot be empty".to_string(),
            ));
        }

        let collection = match self.collection {
            Some(name) => name,
            None => default_collection_name(&self.model),
        };
        let collection = ValidatedCollectionName::new(&collection)?.into_string();

        let mut positions = HashMap::with_capacity(self.fields.len());
        for (index, field) in self.fields.iter().enumerate() {
            field.check()?;
            if positions.insert(field.name.clone(), index).is_some() {
                return Err(DocweaveError::InvalidSchema(format!(
                    "field '{}' declared twice in schema '{}'",
                    field.name, self.model
                )));
            }
        }

        Ok(Schema {
            model: self.model,
            collection,
            fields: self.fields,
            positions,
            unknown_fields: self.unknown_fields,
        })
    }
}

/// Collection name for a model: lowercased and pluralised ("Post" -> "posts")
pub fn default_collection_name(model: &str) -> String {
    let lower = model.trim().to_lowercase();

    if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with('z')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        return format!("{}es", lower);
    }

    if let Some(stem) = lower.strip_suffix('y') {
        let before_y = stem.chars().last();
        if before_y.map_or(false, |c| !"aeiou".contains(c)) {
            return format!("{}ies", stem);
        }
    }

    format!("{}s", lower)
}
