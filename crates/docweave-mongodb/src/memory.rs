//! In-process session
//!
//! `MemorySession` keeps every collection as an ordered `Vec<Document>` and
//! evaluates translated queries with the rules a MongoDB server applies:
//! ordered inserts, unique indexes with `E11000` rejections, array-aware
//! filters, `$set`/`$unset`/`$inc` updates and the supported pipeline
//! stages. It backs the test-suite and the offline CLI mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bson::{oid::ObjectId, Bson, Document};
use docweave_common::{DocweaveError, Result, DUPLICATE_KEY_CODE};
use futures::{stream, StreamExt};
use parking_lot::RwLock;
use tracing::{debug, info, instrument};

use crate::eval::{self, Projector};
use crate::session::{DocumentStream, FindOptions, Session, UpdateOutcome, WriteScope};

#[derive(Debug, Default)]
struct MemoryState {
    collections: HashMap<String, Vec<Document>>,
    /// collection -> fields carrying a unique index (besides `_id`)
    unique_indexes: HashMap<String, Vec<String>>,
}

impl MemoryState {
    fn unique_fields(&self, collection: &str) -> Vec<String> {
        let mut fields = vec!["_id".to_string()];
        if let Some(extra) = self.unique_indexes.get(collection) {
            fields.extend(extra.iter().cloned());
        }
        fields
    }
}

/// In-memory [`Session`]
#[derive(Debug)]
pub struct MemorySession {
    database: String,
    state: RwLock<MemoryState>,
    connected: AtomicBool,
}

impl Default for MemorySession {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySession {
    pub fn new() -> Self {
        Self::with_database("memory")
    }

    /// Name used in duplicate-key messages (`<database>.<collection>`)
    pub fn with_database(database: impl Into<String>) -> Self {
        let database = database.into();
        info!(database = %database, "memory session created");
        Self {
            database,
            state: RwLock::new(MemoryState::default()),
            connected: AtomicBool::new(true),
        }
    }

    pub fn database_name(&self) -> &str {
        &self.database
    }

    /// Simulate a lost connection: every call fails with `NotConnected`
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Snapshot of a collection in insertion order
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.state
            .read()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Names of collections holding at least one document
    pub fn collection_names(&self) -> Vec<String> {
        let state = self.state.read();
        let mut names: Vec<String> = state
            .collections
            .iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Fields with a unique index on `collection` (excluding `_id`)
    pub fn unique_indexes(&self, collection: &str) -> Vec<String> {
        self.state
            .read()
            .unique_indexes
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DocweaveError::NotConnected(
                "memory session is disconnected".to_string(),
            ))
        }
    }

    fn duplicate_key(&self, collection: &str, field: &str, value: &Bson) -> DocweaveError {
        let index = if field == "_id" {
            "_id_".to_string()
        } else {
            format!("{}_1", field)
        };
        DocweaveError::StoreRejected {
            code: Some(DUPLICATE_KEY_CODE),
            message: format!(
                "E11000 duplicate key error collection: {}.{} index: {} dup key: {{ {}: {} }}",
                self.database, collection, index, field, value
            ),
        }
    }

    /// First unique field on which `candidate` collides with a document in
    /// `existing` (skipping position `skip`)
    fn find_collision(
        fields: &[String],
        existing: &[Document],
        candidate: &Document,
        skip: Option<usize>,
    ) -> Option<(String, Bson)> {
        for field in fields {
            let value = eval::get_path(candidate, field).cloned().unwrap_or(Bson::Null);
            let taken = existing.iter().enumerate().any(|(i, other)| {
                Some(i) != skip
                    && eval::values_equal(
                        eval::get_path(other, field).unwrap_or(&Bson::Null),
                        &value,
                    )
            });
            if taken {
                return Some((field.clone(), value));
            }
        }
        None
    }

    fn matching_positions(docs: &[Document], filter: &Document) -> Result<Vec<usize>> {
        let mut positions = Vec::new();
        for (i, doc) in docs.iter().enumerate() {
            if eval::matches(doc, filter)? {
                positions.push(i);
            }
        }
        Ok(positions)
    }
}

#[async_trait]
impl Session for MemorySession {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_connected()
    }

    #[instrument(level = "debug", skip(self, documents), fields(collection = %collection, count = documents.len()))]
    async fn insert(&self, collection: &str, documents: Vec<Document>) -> Result<Vec<Bson>> {
        self.ensure_connected()?;

        let mut state = self.state.write();
        let fields = state.unique_fields(collection);
        let stored = state.collections.entry(collection.to_string()).or_default();

        // Ordered insert: documents before a rejected one stay written
        let mut ids = Vec::with_capacity(documents.len());
        for mut doc in documents {
            if !doc.contains_key("_id") {
                let mut with_id = Document::new();
                with_id.insert("_id", ObjectId::new());
                for (key, value) in doc {
                    with_id.insert(key, value);
                }
                doc = with_id;
            }
            if let Some((field, value)) = Self::find_collision(&fields, stored, &doc, None) {
                return Err(self.duplicate_key(collection, &field, &value));
            }
            ids.push(doc.get("_id").cloned().unwrap_or(Bson::Null));
            stored.push(doc);
        }
        Ok(ids)
    }

    #[instrument(level = "debug", skip(self, filter, options), fields(collection = %collection))]
    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> Result<DocumentStream> {
        self.ensure_connected()?;
        debug!(filter = %filter, "find");

        let projector = options
            .projection
            .as_ref()
            .map(Projector::compile)
            .transpose()?;

        let mut found = {
            let state = self.state.read();
            let docs = state.collections.get(collection).map(Vec::as_slice).unwrap_or(&[]);
            let mut found = Vec::new();
            for doc in docs {
                if eval::matches(doc, &filter)? {
                    found.push(doc.clone());
                }
            }
            found
        };

        if let Some(sort) = &options.sort {
            eval::sort_documents(&mut found, sort);
        }
        let skip = options.skip.unwrap_or(0) as usize;
        let limit = match options.limit {
            None | Some(0) => usize::MAX,
            Some(n) => n.unsigned_abs() as usize,
        };

        let results: Vec<Result<Document>> = found
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|doc| match &projector {
                Some(projector) => projector.apply(&doc),
                None => doc,
            })
            .map(Ok)
            .collect();
        Ok(stream::iter(results).boxed())
    }

    async fn count(&self, collection: &str, filter: Document) -> Result<u64> {
        self.ensure_connected()?;
        let state = self.state.read();
        let docs = state.collections.get(collection).map(Vec::as_slice).unwrap_or(&[]);
        Ok(Self::matching_positions(docs, &filter)?.len() as u64)
    }

    #[instrument(level = "debug", skip(self, filter, update), fields(collection = %collection, scope = ?scope))]
    async fn update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        scope: WriteScope,
    ) -> Result<UpdateOutcome> {
        self.ensure_connected()?;
        debug!(filter = %filter, update = %update, "update");

        let mut state = self.state.write();
        let fields = state.unique_fields(collection);
        let Some(docs) = state.collections.get_mut(collection) else {
            return Ok(UpdateOutcome::default());
        };

        let mut positions = Self::matching_positions(docs, &filter)?;
        if !scope.is_multi() {
            positions.truncate(1);
        }

        let mut outcome = UpdateOutcome {
            matched: positions.len() as u64,
            modified: 0,
        };
        for position in positions {
            let mut next = docs[position].clone();
            if !eval::apply_update(&mut next, &update)? {
                continue;
            }
            if let Some((field, value)) = Self::find_collision(&fields, docs, &next, Some(position)) {
                return Err(self.duplicate_key(collection, &field, &value));
            }
            docs[position] = next;
            outcome.modified += 1;
        }
        Ok(outcome)
    }

    #[instrument(level = "debug", skip(self, filter), fields(collection = %collection, scope = ?scope))]
    async fn delete(&self, collection: &str, filter: Document, scope: WriteScope) -> Result<u64> {
        self.ensure_connected()?;
        debug!(filter = %filter, "delete");

        let mut state = self.state.write();
        let Some(docs) = state.collections.get_mut(collection) else {
            return Ok(0);
        };

        let mut positions = Self::matching_positions(docs, &filter)?;
        if !scope.is_multi() {
            positions.truncate(1);
        }
        for position in positions.iter().rev() {
            docs.remove(*position);
        }
        Ok(positions.len() as u64)
    }

    #[instrument(level = "debug", skip(self, pipeline), fields(collection = %collection, stages = pipeline.len()))]
    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> Result<DocumentStream> {
        self.ensure_connected()?;
        debug!(pipeline = ?pipeline, "aggregate");

        let results = {
            let state = self.state.read();
            let docs = state.collections.get(collection).cloned().unwrap_or_default();
            eval::run_pipeline(docs, &pipeline, &state.collections)?
        };
        Ok(stream::iter(results.into_iter().map(Ok)).boxed())
    }

    #[instrument(level = "debug", skip(self), fields(collection = %collection))]
    async fn create_unique_index(&self, collection: &str, field: &str) -> Result<()> {
        self.ensure_connected()?;

        let mut state = self.state.write();
        if field == "_id" {
            return Ok(());
        }
        if let Some(docs) = state.collections.get(collection) {
            for (i, doc) in docs.iter().enumerate() {
                let single = [field.to_string()];
                if let Some((field, value)) = Self::find_collision(&single, &docs[..i], doc, None) {
                    return Err(self.duplicate_key(collection, &field, &value));
                }
            }
        }
        let indexes = state.unique_indexes.entry(collection.to_string()).or_default();
        if !indexes.iter().any(|existing| existing == field) {
            indexes.push(field.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use futures::TryStreamExt;

    async fn collect(stream: DocumentStream) -> Vec<Document> {
        stream.try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_missing_ids() {
        let session = MemorySession::new();
        let ids = session
            .insert("users", vec![doc! { "id": 1 }, doc! { "_id": 7, "id": 2 }])
            .await
            .unwrap();
        assert!(matches!(ids[0], Bson::ObjectId(_)));
        assert_eq!(ids[1], Bson::Int32(7));

        let stored = session.documents("users");
        assert_eq!(stored[0].keys().next().map(String::as_str), Some("_id"));
        assert_eq!(stored[1], doc! { "_id": 7, "id": 2 });
    }

    #[tokio::test]
    async fn test_unique_index_rejects_duplicates_in_order() {
        let session = MemorySession::with_database("tutorial");
        session.create_unique_index("users", "username").await.unwrap();
        session.insert("users", vec![doc! { "username": "alice" }]).await.unwrap();

        let err = session
            .insert(
                "users",
                vec![doc! { "username": "bob" }, doc! { "username": "alice" }, doc! { "username": "carol" }],
            )
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());
        assert!(err.to_string().contains("tutorial.users index: username_1"));

        // bob made it in before the rejection, carol did not
        let names: Vec<String> = session
            .documents("users")
            .iter()
            .map(|d| d.get_str("username").unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_create_index_over_duplicates_fails() {
        let session = MemorySession::new();
        session
            .insert("users", vec![doc! { "email": "a@x" }, doc! { "email": "a@x" }])
            .await
            .unwrap();
        let err = session.create_unique_index("users", "email").await.unwrap_err();
        assert!(err.is_duplicate_key());
        assert!(session.unique_indexes("users").is_empty());
    }

    #[tokio::test]
    async fn test_find_with_options() {
        let session = MemorySession::new();
        let docs = (1..=5).map(|i| doc! { "_id": i, "n": i, "even": i % 2 == 0 }).collect();
        session.insert("nums", docs).await.unwrap();

        let options = FindOptions {
            projection: Some(doc! { "n": 1, "_id": 0 }),
            sort: Some(doc! { "n": -1 }),
            skip: Some(1),
            limit: Some(2),
        };
        let found = collect(session.find("nums", doc! {}, options).await.unwrap()).await;
        assert_eq!(found, vec![doc! { "n": 4 }, doc! { "n": 3 }]);

        let evens = session.count("nums", doc! { "even": true }).await.unwrap();
        assert_eq!(evens, 2);
    }

    #[tokio::test]
    async fn test_update_scopes_and_outcome() {
        let session = MemorySession::new();
        let docs = (1..=3).map(|i| doc! { "_id": i, "likes": i * 3 }).collect();
        session.insert("posts", docs).await.unwrap();

        let one = session
            .update("posts", doc! { "likes": { "$gt": 2 } }, doc! { "$inc": { "likes": 1 } }, WriteScope::One)
            .await
            .unwrap();
        assert_eq!(one, UpdateOutcome { matched: 1, modified: 1 });

        let many = session
            .update("posts", doc! {}, doc! { "$set": { "likes": 4 } }, WriteScope::Many)
            .await
            .unwrap();
        assert_eq!(many, UpdateOutcome { matched: 3, modified: 2 });

        let none = session
            .update("posts", doc! { "likes": 100 }, doc! { "$set": { "likes": 0 } }, WriteScope::Many)
            .await
            .unwrap();
        assert_eq!(none, UpdateOutcome::default());
    }

    #[tokio::test]
    async fn test_update_into_duplicate_rejected() {
        let session = MemorySession::new();
        session.create_unique_index("users", "email").await.unwrap();
        session
            .insert("users", vec![doc! { "_id": 1, "email": "a@x" }, doc! { "_id": 2, "email": "b@x" }])
            .await
            .unwrap();

        let err = session
            .update("users", doc! { "_id": 2 }, doc! { "$set": { "email": "a@x" } }, WriteScope::One)
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());
        assert_eq!(session.documents("users")[1], doc! { "_id": 2, "email": "b@x" });
    }

    #[tokio::test]
    async fn test_delete_scopes() {
        let session = MemorySession::new();
        let docs = (1..=4).map(|i| doc! { "_id": i, "group": i % 2 }).collect();
        session.insert("items", docs).await.unwrap();

        assert_eq!(session.delete("items", doc! { "group": 1 }, WriteScope::One).await.unwrap(), 1);
        assert_eq!(session.delete("items", doc! { "group": 0 }, WriteScope::Many).await.unwrap(), 2);
        assert_eq!(session.delete("missing", doc! {}, WriteScope::Many).await.unwrap(), 0);
        assert_eq!(session.documents("items"), vec![doc! { "_id": 3, "group": 1 }]);
    }

    #[tokio::test]
    async fn test_disconnect_fails_every_call() {
        let session = MemorySession::new();
        session.disconnect();
        assert!(matches!(session.ping().await, Err(DocweaveError::NotConnected(_))));
        assert!(matches!(
            session.insert("users", vec![doc! {}]).await,
            Err(DocweaveError::NotConnected(_))
        ));
        session.reconnect();
        assert!(session.ping().await.is_ok());
    }
}
