//! Schema-bound collection handle
//!
//! A [`CollectionHandle`] is the query executor: it validates writes
//! against the collection's schema, translates typed filters, updates and
//! pipelines to BSON, and forwards them to the [`Session`]. Nothing is
//! sent to the store when validation fails.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bson::{oid::ObjectId, Bson, Document};
use docweave_common::{DocweaveError, Result};
use docweave_validation::{check_increment, check_unset, validate, validate_partial, Schema};
use futures::TryStreamExt;
use tracing::{debug, info, instrument};

use crate::find::FindQuery;
use crate::pipeline::Pipeline;
use crate::query::{Filter, Projection, Update};
use crate::registry::SchemaRegistry;
use crate::session::{DocumentStream, Session, UpdateOutcome, WriteScope};

/// Handle on one collection of one session
///
/// Cheap to clone; clones share the session and registry.
#[derive(Clone)]
pub struct CollectionHandle {
    session: Arc<dyn Session>,
    schema: Arc<Schema>,
    registry: Arc<SchemaRegistry>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for CollectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionHandle")
            .field("backend", &self.session.backend())
            .field("collection", &self.schema.collection())
            .field("model", &self.schema.model())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CollectionHandle {
    /// Bind a registered collection to a session
    pub fn new(
        session: Arc<dyn Session>,
        registry: Arc<SchemaRegistry>,
        collection: &str,
    ) -> Result<Self> {
        let schema = registry.get(collection).ok_or_else(|| {
            DocweaveError::InvalidSchema(format!("collection '{}' is not registered", collection))
        })?;

        Ok(Self {
            session,
            schema,
            registry,
            timeout: None,
        })
    }

    /// Fail store calls that take longer than `timeout` with `Timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn collection_name(&self) -> &str {
        self.schema.collection()
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Run one store call under the handle's deadline
    pub(crate) async fn call<T, F>(&self, operation: &'static str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.timeout {
            None => future.await,
            Some(limit) => tokio::time::timeout(limit, future).await.map_err(|_| {
                DocweaveError::Timeout(format!(
                    "{} on '{}' did not complete within {:?}",
                    operation,
                    self.collection_name(),
                    limit
                ))
            })?,
        }
    }

    /// Validate a document for insertion and give it an `_id`
    fn prepare(&self, document: Document) -> Result<Document> {
        let validated = validate(&self.schema, document)?.into_inner();
        if validated.contains_key("_id") {
            return Ok(validated);
        }

        let mut prepared = Document::new();
        prepared.insert("_id", ObjectId::new());
        for (key, value) in validated {
            prepared.insert(key, value);
        }
        Ok(prepared)
    }

    /// Validate and insert one document; returns its `_id`
    #[instrument(skip(self, document), fields(collection = %self.collection_name()))]
    pub async fn insert_one(&self, document: Document) -> Result<Bson> {
        let prepared = self.prepare(document)?;
        let mut ids = self
            .call("insert_one", self.session.insert(self.collection_name(), vec![prepared]))
            .await?;
        ids.pop()
            .ok_or_else(|| DocweaveError::rejected("store returned no inserted id"))
    }

    /// Validate every document, then insert them in order
    ///
    /// A single invalid document fails the whole batch before anything is
    /// sent. Once sent, a store rejection (e.g. a duplicate key) leaves the
    /// documents ahead of it in place.
    #[instrument(skip(self, documents), fields(collection = %self.collection_name(), count = documents.len()))]
    pub async fn insert_many(&self, documents: Vec<Document>) -> Result<Vec<Bson>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let prepared = documents
            .into_iter()
            .map(|document| self.prepare(document))
            .collect::<Result<Vec<_>>>()?;

        let ids = self
            .call("insert_many", self.session.insert(self.collection_name(), prepared))
            .await?;
        info!(inserted = ids.len(), "documents inserted");
        Ok(ids)
    }

    /// Lazy query over matching documents
    pub fn find_many(&self, filter: Filter, projection: Projection) -> FindQuery {
        FindQuery::new(self.clone(), filter, projection)
    }

    /// First matching document, if any
    pub async fn find_one(&self, filter: Filter, projection: Projection) -> Result<Option<Document>> {
        self.find_many(filter, projection).first().await
    }

    /// Number of documents matching `filter`
    #[instrument(skip(self, filter), fields(collection = %self.collection_name()))]
    pub async fn count(&self, filter: Filter) -> Result<u64> {
        let filter = filter.to_document()?;
        self.call("count", self.session.count(self.collection_name(), filter))
            .await
    }

    /// Update the first matching document
    pub async fn update_one(&self, filter: Filter, update: Update) -> Result<UpdateOutcome> {
        self.update_with(filter, update, WriteScope::One).await
    }

    /// Update every matching document
    pub async fn update_many(&self, filter: Filter, update: Update) -> Result<UpdateOutcome> {
        self.update_with(filter, update, WriteScope::Many).await
    }

    /// Check every part of an update against the schema
    ///
    /// Fields the schema drops are removed; an update left empty fails
    /// with a `Query` error before reaching the store.
    fn check_update(&self, update: Update) -> Result<Document> {
        let set = validate_partial(&self.schema, update.set_values().clone())?;

        let mut unset = Vec::new();
        for field in update.unset_fields() {
            if check_unset(&self.schema, field)? {
                unset.push(field.clone());
            }
        }

        let mut inc = Document::new();
        for (field, amount) in update.increments() {
            if check_increment(&self.schema, field, amount)? {
                inc.insert(field.clone(), amount.clone());
            }
        }

        Update::checked(set, unset, inc).to_document()
    }

    #[instrument(skip(self, filter, update), fields(collection = %self.collection_name(), scope = ?scope))]
    async fn update_with(
        &self,
        filter: Filter,
        update: Update,
        scope: WriteScope,
    ) -> Result<UpdateOutcome> {
        let update = self.check_update(update)?;
        let filter = filter.to_document()?;
        debug!(filter = %filter, update = %update, "update");

        let outcome = self
            .call(
                "update",
                self.session.update(self.collection_name(), filter, update, scope),
            )
            .await?;
        debug!(matched = outcome.matched, modified = outcome.modified, "update applied");
        Ok(outcome)
    }

    /// Delete the first matching document; returns 0 or 1
    pub async fn delete_one(&self, filter: Filter) -> Result<u64> {
        self.delete_with(filter, WriteScope::One).await
    }

    /// Delete every matching document; returns how many were removed
    pub async fn delete_many(&self, filter: Filter) -> Result<u64> {
        self.delete_with(filter, WriteScope::Many).await
    }

    #[instrument(skip(self, filter), fields(collection = %self.collection_name(), scope = ?scope))]
    async fn delete_with(&self, filter: Filter, scope: WriteScope) -> Result<u64> {
        let filter = filter.to_document()?;
        debug!(filter = %filter, "delete");

        let deleted = self
            .call("delete", self.session.delete(self.collection_name(), filter, scope))
            .await?;
        debug!(deleted, "documents deleted");
        Ok(deleted)
    }

    fn check_pipeline(&self, pipeline: &Pipeline) -> Result<Vec<Document>> {
        for stage in pipeline.stages() {
            stage.validate()?;
        }
        for target in pipeline.lookup_targets() {
            if !self.registry.contains(target) {
                return Err(DocweaveError::MalformedPipeline(format!(
                    "lookup target '{}' is not a registered collection",
                    target
                )));
            }
        }
        pipeline.to_documents()
    }

    #[instrument(skip(self, pipeline), fields(collection = %self.collection_name(), stages = pipeline.len()))]
    async fn open_aggregate(&self, pipeline: &Pipeline) -> Result<DocumentStream> {
        let stages = self.check_pipeline(pipeline)?;
        debug!(pipeline = ?stages, "aggregate");
        self.session.aggregate(self.collection_name(), stages).await
    }

    /// Run an aggregation pipeline and stream its results
    pub async fn aggregate_stream(&self, pipeline: &Pipeline) -> Result<DocumentStream> {
        self.call("aggregate", self.open_aggregate(pipeline)).await
    }

    /// Run an aggregation pipeline and collect its results
    ///
    /// The deadline covers opening the cursor and draining it.
    pub async fn aggregate(&self, pipeline: &Pipeline) -> Result<Vec<Document>> {
        self.call("aggregate", async {
            self.open_aggregate(pipeline).await?.try_collect::<Vec<_>>().await
        })
        .await
    }

    /// Create a unique index for every `unique` field of the schema
    ///
    /// Returns the indexed field names. Fails with a duplicate-key
    /// rejection if stored documents already collide.
    #[instrument(skip(self), fields(collection = %self.collection_name()))]
    pub async fn ensure_indexes(&self) -> Result<Vec<String>> {
        let fields: Vec<String> = self.schema.unique_fields().map(str::to_string).collect();
        for field in &fields {
            self.call(
                "create_index",
                self.session.create_unique_index(self.collection_name(), field),
            )
            .await?;
        }
        info!(indexes = ?fields, "unique indexes ensured");
        Ok(fields)
    }
}
