//! Schema registry
//!
//! Maps collection names to their schemas. Handles are built from it and
//! `$lookup` targets are checked against it; there is no global instance.

use std::collections::HashMap;
use std::sync::Arc;

use docweave_common::{DocweaveError, Result};
use docweave_validation::Schema;
use parking_lot::RwLock;
use tracing::debug;

use crate::collection::CollectionHandle;
use crate::session::Session;

/// Schemas known to an application, keyed by collection name
///
/// Passed explicitly to every handle; there is no process-wide instance.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Arc<Schema>>>,
}

impl SchemaRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema under its collection name
    pub fn register(&self, schema: Schema) -> Result<Arc<Schema>> {
        let collection = schema.collection().to_string();
        let mut schemas = self.schemas.write();

        if schemas.contains_key(&collection) {
            return Err(DocweaveError::InvalidSchema(format!(
                "collection '{}' is already registered",
                collection
            )));
        }

        debug!(model = %schema.model(), collection = %collection, "schema registered");
        let schema = Arc::new(schema);
        schemas.insert(collection, schema.clone());
        Ok(schema)
    }

    /// Get a schema by collection name
    pub fn get(&self, collection: &str) -> Option<Arc<Schema>> {
        self.schemas.read().get(collection).cloned()
    }

    /// Get a schema by model name
    pub fn by_model(&self, model: &str) -> Option<Arc<Schema>> {
        self.schemas
            .read()
            .values()
            .find(|schema| schema.model() == model)
            .cloned()
    }

    /// Check if a collection is registered
    pub fn contains(&self, collection: &str) -> bool {
        self.schemas.read().contains_key(collection)
    }

    /// Registered collection names, sorted
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.schemas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.read().is_empty()
    }

    /// Build a handle for a registered collection
    pub fn handle(
        self: &Arc<Self>,
        session: Arc<dyn Session>,
        collection: &str,
    ) -> Result<CollectionHandle> {
        CollectionHandle::new(session, self.clone(), collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docweave_validation::{FieldConstraint, FieldType};

    fn user_schema() -> Schema {
        Schema::builder("User")
            .field(FieldConstraint::new("username", FieldType::String).required())
            .build()
            .unwrap()
    }

    #[test]
    fn test_registry() {
        let registry = SchemaRegistry::new();
        assert!(registry.is_empty());

        let schema = registry.register(user_schema()).unwrap();
        assert_eq!(schema.collection(), "users");
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("users"));
        assert_eq!(registry.by_model("User").unwrap().collection(), "users");
        assert!(registry.get("posts").is_none());
        assert_eq!(registry.collections(), vec!["users".to_string()]);
    }

    #[test]
    fn test_duplicate_collection_rejected() {
        let registry = SchemaRegistry::new();
        registry.register(user_schema()).unwrap();

        let err = registry.register(user_schema()).unwrap_err();
        assert!(matches!(err, DocweaveError::InvalidSchema(_)));
    }
}
