//! Store session seam
//!
//! A [`Session`] is the driver-facing contract: it takes already-translated
//! BSON filters, updates and pipelines and runs them against one database.
//! [`crate::MongoSession`] implements it over the official driver,
//! [`crate::MemorySession`] in-process.

use async_trait::async_trait;
use bson::{Bson, Document};
use docweave_common::Result;
use futures::stream::BoxStream;

/// Finite stream of documents produced by one store call
pub type DocumentStream = BoxStream<'static, Result<Document>>;

/// How many matched documents a write may touch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteScope {
    /// The first match in the store's natural order
    One,
    /// Every match
    Many,
}

impl WriteScope {
    pub fn is_multi(&self) -> bool {
        matches!(self, WriteScope::Many)
    }
}

/// Result of an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateOutcome {
    /// Documents selected by the filter
    pub matched: u64,
    /// Documents whose content actually changed
    pub modified: u64,
}

/// Read options for a find call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
}

/// Driver contract used by collection handles
///
/// Implementations never validate documents; that happens before a call
/// reaches the session. Errors are surfaced verbatim and never retried.
#[async_trait]
pub trait Session: Send + Sync {
    /// Short backend name for logs ("mongodb", "memory")
    fn backend(&self) -> &'static str;

    /// Check the session can reach the store
    async fn ping(&self) -> Result<()>;

    /// Insert documents in order; returns their `_id`s
    async fn insert(&self, collection: &str, documents: Vec<Document>) -> Result<Vec<Bson>>;

    async fn find(&self, collection: &str, filter: Document, options: FindOptions)
        -> Result<DocumentStream>;

    async fn count(&self, collection: &str, filter: Document) -> Result<u64>;

    async fn update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        scope: WriteScope,
    ) -> Result<UpdateOutcome>;

    /// Returns the number of deleted documents
    async fn delete(&self, collection: &str, filter: Document, scope: WriteScope) -> Result<u64>;

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> Result<DocumentStream>;

    /// Create (or confirm) a unique single-field index
    async fn create_unique_index(&self, collection: &str, field: &str) -> Result<()>;
}
