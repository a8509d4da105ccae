//! Schema-validated document collections over MongoDB
//!
//! This crate binds [`Schema`]s to collections and runs typed queries
//! against a [`Session`].
//!
//! # Features
//! - Pre-flight validation of every insert and update
//! - Typed filter, update and projection builders
//! - Closed set of aggregation stages with checked constructors
//! - Lazy, restartable find queries
//! - Unique index management
//! - In-memory session for tests and offline use
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use docweave_mongodb::*;
//!
//! let registry = Arc::new(SchemaRegistry::new());
//! registry.register(
//!     Schema::builder("Post")
//!         .field(FieldConstraint::new("id", FieldType::Integer).required().unique())
//!         .field(FieldConstraint::new("title", FieldType::String).required())
//!         .build()?,
//! )?;
//!
//! let session: Arc<dyn Session> = Arc::new(MongoSession::connect("mongodb://127.0.0.1:27017/blog").await?);
//! let posts = registry.handle(session, "posts")?;
//! posts.insert_one(bson::doc! { "id": 1, "title": "Hello" }).await?;
//! let titles = posts
//!     .find_many(Filter::all(), Projection::include(["title"]))
//!     .to_list()
//!     .await?;
//! ```

pub mod collection;
pub mod connection;
mod eval;
pub mod find;
pub mod memory;
pub mod model;
pub mod pipeline;
pub mod query;
pub mod registry;
pub mod session;

pub use collection::CollectionHandle;
pub use connection::{connect, MongoSession, PoolConfig};
pub use docweave_common::{DocweaveError, Result, ValidationError};
pub use docweave_validation::{
    validate, validate_partial, DefaultValue, FieldConstraint, FieldType, Schema, SchemaBuilder,
    UnknownFields, ValidatedDocument,
};
pub use find::FindQuery;
pub use memory::MemorySession;
pub use model::{Model, TypedCollection};
pub use pipeline::{Aggregator, Lookup, Pipeline, SortDirection, Stage};
pub use query::{Comparison, Filter, Projection, Update};
pub use registry::SchemaRegistry;
pub use session::{DocumentStream, FindOptions, Session, UpdateOutcome, WriteScope};
