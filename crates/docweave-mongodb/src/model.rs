//! Typed models over schema-validated collections
//!
//! A [`Model`] is a serde type bound to a [`Schema`]. Writes still go
//! through the schema, so serde and the schema must agree on field names.
//!
//! # Example
//!
//! ```ignore
//! use serde::{Deserialize, Serialize};
//! use docweave_mongodb::{Model, Schema, FieldConstraint, FieldType, Result};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Post {
//!     id: i32,
//!     title: String,
//!     #[serde(default)]
//!     likes: i32,
//! }
//!
//! impl Model for Post {
//!     fn schema() -> Result<Schema> {
//!         Schema::builder("Post")
//!             .field(FieldConstraint::new("id", FieldType::Integer).required())
//!             .field(FieldConstraint::new("title", FieldType::String).required())
//!             .field(FieldConstraint::new("likes", FieldType::Integer).default_value(0))
//!             .build()
//!     }
//! }
//! ```

use std::marker::PhantomData;

use bson::{Bson, Document};
use docweave_common::{DocweaveError, Result};
use docweave_validation::Schema;
use serde::{de::DeserializeOwned, Serialize};

use crate::collection::CollectionHandle;
use crate::query::{Filter, Projection};

/// Serde type stored in a schema-validated collection
pub trait Model: Serialize + DeserializeOwned + Send + Sync + Sized {
    /// Schema describing this model's collection
    fn schema() -> Result<Schema>;

    /// Convert to BSON
    fn to_document(&self) -> Result<Document> {
        Ok(bson::to_document(self)?)
    }

    /// Create from BSON; fields the type does not declare (like `_id`)
    /// are ignored unless serde is told otherwise
    fn from_document(document: Document) -> Result<Self> {
        Ok(bson::from_document(document)?)
    }
}

/// Collection handle reading and writing `M` values
#[derive(Debug, Clone)]
pub struct TypedCollection<M: Model> {
    handle: CollectionHandle,
    _model: PhantomData<fn() -> M>,
}

impl CollectionHandle {
    /// View this handle through a model type
    ///
    /// Fails with `InvalidSchema` when the model's schema targets another
    /// collection.
    pub fn typed<M: Model>(&self) -> Result<TypedCollection<M>> {
        let schema = M::schema()?;
        if schema.collection() != self.collection_name() {
            return Err(DocweaveError::InvalidSchema(format!(
                "model '{}' maps to collection '{}', not '{}'",
                schema.model(),
                schema.collection(),
                self.collection_name()
            )));
        }

        Ok(TypedCollection {
            handle: self.clone(),
            _model: PhantomData,
        })
    }
}

impl<M: Model> TypedCollection<M> {
    pub fn handle(&self) -> &CollectionHandle {
        &self.handle
    }

    pub async fn insert_one(&self, value: &M) -> Result<Bson> {
        self.handle.insert_one(value.to_document()?).await
    }

    pub async fn insert_many(&self, values: &[M]) -> Result<Vec<Bson>> {
        let documents = values
            .iter()
            .map(M::to_document)
            .collect::<Result<Vec<_>>>()?;
        self.handle.insert_many(documents).await
    }

    /// All values matching `filter`, whole documents decoded as `M`
    pub async fn find(&self, filter: Filter) -> Result<Vec<M>> {
        self.handle
            .find_many(filter, Projection::all())
            .to_list()
            .await?
            .into_iter()
            .map(M::from_document)
            .collect()
    }

    pub async fn find_one(&self, filter: Filter) -> Result<Option<M>> {
        self.handle
            .find_one(filter, Projection::all())
            .await?
            .map(M::from_document)
            .transpose()
    }
}
