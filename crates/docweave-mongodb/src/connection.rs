//! MongoDB session with pool configuration and health checking

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use docweave_common::{DocweaveError, Result};
use futures::{StreamExt, TryStreamExt};
use mongodb::{
    options::{ClientOptions, IndexOptions, ServerApi, ServerApiVersion},
    Client, Collection, Database, IndexModel,
};
use tracing::{debug, info, instrument};

use crate::session::{DocumentStream, FindOptions, Session, UpdateOutcome, WriteScope};

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of connections in the pool
    pub min_pool_size: Option<u32>,
    /// Maximum number of connections in the pool
    pub max_pool_size: Option<u32>,
    /// Maximum time a connection can remain idle before being closed (default: none)
    pub max_idle_time: Option<Duration>,
    /// Connection timeout (default: 10s)
    pub connect_timeout: Option<Duration>,
    /// Server selection timeout (default: 30s)
    pub server_selection_timeout: Option<Duration>,
    /// Application name for server logs
    pub app_name: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: Some(0),
            max_pool_size: Some(10),
            max_idle_time: None,
            connect_timeout: Some(Duration::from_secs(10)),
            server_selection_timeout: Some(Duration::from_secs(30)),
            app_name: Some("docweave".to_string()),
        }
    }
}

impl PoolConfig {
    fn apply(self, client_options: &mut ClientOptions) {
        if let Some(min) = self.min_pool_size {
            client_options.min_pool_size = Some(min);
        }
        if let Some(max) = self.max_pool_size {
            client_options.max_pool_size = Some(max);
        }
        if let Some(idle) = self.max_idle_time {
            client_options.max_idle_time = Some(idle);
        }
        if let Some(connect) = self.connect_timeout {
            client_options.connect_timeout = Some(connect);
        }
        if let Some(server_sel) = self.server_selection_timeout {
            client_options.server_selection_timeout = Some(server_sel);
        }
        if let Some(app) = self.app_name {
            client_options.app_name = Some(app);
        }
    }
}

/// Session over a MongoDB deployment
///
/// The database is taken from the connection string
/// (`mongodb://host:port/<database>`).
pub struct MongoSession {
    client: Client,
    database: Database,
    closed: AtomicBool,
}

impl std::fmt::Debug for MongoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoSession")
            .field("database", &self.database.name())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Connect with default pool settings
pub async fn connect(uri: &str) -> Result<MongoSession> {
    MongoSession::connect(uri).await
}

impl MongoSession {
    /// Create a new MongoDB session with default pool settings
    pub async fn connect(uri: &str) -> Result<Self> {
        Self::connect_with(uri, PoolConfig::default()).await
    }

    /// Create a new MongoDB session with custom pool configuration
    #[instrument(skip(uri, config), fields(max_pool_size = ?config.max_pool_size))]
    pub async fn connect_with(uri: &str, config: PoolConfig) -> Result<Self> {
        if uri.is_empty() {
            return Err(DocweaveError::NotConnected(
                "Connection string cannot be empty".to_string(),
            ));
        }

        let mut client_options = ClientOptions::parse(uri)
            .await
            .map_err(|e| DocweaveError::NotConnected(format!("Invalid connection string: {}", e)))?;
        config.apply(&mut client_options);

        // Set stable API version for compatibility
        let server_api = ServerApi::builder().version(ServerApiVersion::V1).build();
        client_options.server_api = Some(server_api);

        let client = Client::with_options(client_options)?;

        let database = client.default_database().ok_or_else(|| {
            DocweaveError::NotConnected(
                "No default database specified in connection string".to_string(),
            )
        })?;

        info!(database = %database.name(), "MongoDB session created");

        Ok(Self {
            client,
            database,
            closed: AtomicBool::new(false),
        })
    }

    /// Get a reference to the database
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Get the database name
    pub fn database_name(&self) -> &str {
        self.database.name()
    }

    /// Get a reference to the client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Close the session; every later call fails with `NotConnected`
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.client.clone().shutdown().await;
            info!("MongoDB session closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn collection(&self, name: &str) -> Result<Collection<Document>> {
        if self.is_closed() {
            return Err(DocweaveError::NotConnected("session closed".to_string()));
        }
        Ok(self.database.collection(name))
    }
}

#[async_trait]
impl Session for MongoSession {
    fn backend(&self) -> &'static str {
        "mongodb"
    }

    async fn ping(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DocweaveError::NotConnected("session closed".to_string()));
        }
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| DocweaveError::NotConnected(format!("Ping failed: {}", e)))?;
        Ok(())
    }

    #[instrument(skip(self, documents), fields(collection = %collection, count = documents.len()))]
    async fn insert(&self, collection: &str, documents: Vec<Document>) -> Result<Vec<Bson>> {
        let coll = self.collection(collection)?;
        let result = coll.insert_many(documents).await?;

        // inserted_ids is keyed by batch position
        let ordered: BTreeMap<usize, Bson> = result.inserted_ids.into_iter().collect();
        Ok(ordered.into_values().collect())
    }

    #[instrument(skip(self, filter, options), fields(collection = %collection))]
    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> Result<DocumentStream> {
        let coll = self.collection(collection)?;
        debug!(filter = %filter, "find");

        let mut action = coll.find(filter);
        if let Some(projection) = options.projection {
            action = action.projection(projection);
        }
        if let Some(sort) = options.sort {
            action = action.sort(sort);
        }
        if let Some(skip) = options.skip {
            action = action.skip(skip);
        }
        if let Some(limit) = options.limit {
            action = action.limit(limit);
        }

        let cursor = action.await?;
        Ok(cursor.map_err(DocweaveError::from).boxed())
    }

    #[instrument(skip(self, filter), fields(collection = %collection))]
    async fn count(&self, collection: &str, filter: Document) -> Result<u64> {
        let coll = self.collection(collection)?;
        Ok(coll.count_documents(filter).await?)
    }

    #[instrument(skip(self, filter, update), fields(collection = %collection, scope = ?scope))]
    async fn update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        scope: WriteScope,
    ) -> Result<UpdateOutcome> {
        let coll = self.collection(collection)?;
        debug!(filter = %filter, update = %update, "update");

        let result = match scope {
            WriteScope::One => coll.update_one(filter, update).await?,
            WriteScope::Many => coll.update_many(filter, update).await?,
        };
        Ok(UpdateOutcome {
            matched: result.matched_count,
            modified: result.modified_count,
        })
    }

    #[instrument(skip(self, filter), fields(collection = %collection, scope = ?scope))]
    async fn delete(&self, collection: &str, filter: Document, scope: WriteScope) -> Result<u64> {
        let coll = self.collection(collection)?;
        debug!(filter = %filter, "delete");

        let result = match scope {
            WriteScope::One => coll.delete_one(filter).await?,
            WriteScope::Many => coll.delete_many(filter).await?,
        };
        Ok(result.deleted_count)
    }

    #[instrument(skip(self, pipeline), fields(collection = %collection, stages = pipeline.len()))]
    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> Result<DocumentStream> {
        let coll = self.collection(collection)?;
        debug!(pipeline = ?pipeline, "aggregate");

        let cursor = coll.aggregate(pipeline).await?;
        Ok(cursor.map_err(DocweaveError::from).boxed())
    }

    #[instrument(skip(self), fields(collection = %collection))]
    async fn create_unique_index(&self, collection: &str, field: &str) -> Result<()> {
        let coll = self.collection(collection)?;
        let model = IndexModel::builder()
            .keys(doc! { field: 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        coll.create_index(model).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_config() {
        let config = PoolConfig::default();
        assert_eq!(config.min_pool_size, Some(0));
        assert_eq!(config.max_pool_size, Some(10));
        assert_eq!(config.app_name, Some("docweave".to_string()));
    }

    #[test]
    fn test_custom_pool_config() {
        let config = PoolConfig {
            min_pool_size: Some(5),
            max_pool_size: Some(50),
            max_idle_time: Some(Duration::from_secs(300)),
            connect_timeout: Some(Duration::from_secs(5)),
            server_selection_timeout: Some(Duration::from_secs(10)),
            app_name: Some("my-app".to_string()),
        };
        let mut options = ClientOptions::default();
        config.apply(&mut options);
        assert_eq!(options.min_pool_size, Some(5));
        assert_eq!(options.max_pool_size, Some(50));
        assert_eq!(options.app_name, Some("my-app".to_string()));
    }

    #[tokio::test]
    async fn test_empty_uri_is_not_connected() {
        let err = MongoSession::connect("").await.unwrap_err();
        assert!(matches!(err, DocweaveError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_invalid_uri_is_not_connected() {
        let err = MongoSession::connect("not-a-uri").await.unwrap_err();
        assert!(matches!(err, DocweaveError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_uri_without_database_rejected() {
        // Parsing and client creation do not touch the network
        let err = MongoSession::connect("mongodb://127.0.0.1:27017").await.unwrap_err();
        assert!(err.to_string().contains("No default database"));
    }

    #[tokio::test]
    async fn test_closed_session_is_not_connected() {
        let session = MongoSession::connect("mongodb://127.0.0.1:27017/docweave_test")
            .await
            .unwrap();
        assert_eq!(session.database_name(), "docweave_test");
        session.close().await;

        let err = session.count("posts", Document::new()).await.unwrap_err();
        assert!(matches!(err, DocweaveError::NotConnected(_)));
        assert!(matches!(session.ping().await, Err(DocweaveError::NotConnected(_))));
    }
}
