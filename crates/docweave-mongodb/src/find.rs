//! Lazy find queries

use bson::Document;
use docweave_common::Result;
use futures::TryStreamExt;
use tracing::{debug, instrument};

use crate::collection::CollectionHandle;
use crate::pipeline::SortDirection;
use crate::query::{check_field, Filter, Projection};
use crate::session::{DocumentStream, FindOptions};

/// Query for the documents matching a filter
///
/// Nothing is sent until [`to_list`](Self::to_list),
/// [`stream`](Self::stream), [`first`](Self::first) or
/// [`count`](Self::count) is awaited. Each of those re-runs the query, so
/// one `FindQuery` can be executed any number of times and always reflects
/// the store's current contents.
#[derive(Debug, Clone)]
#[must_use = "a FindQuery does nothing until it is executed"]
pub struct FindQuery {
    handle: CollectionHandle,
    filter: Filter,
    projection: Projection,
    sort: Vec<(String, SortDirection)>,
    skip: Option<u64>,
    limit: Option<i64>,
}

impl FindQuery {
    pub(crate) fn new(handle: CollectionHandle, filter: Filter, projection: Projection) -> Self {
        Self {
            handle,
            filter,
            projection,
            sort: Vec::new(),
            skip: None,
            limit: None,
        }
    }

    /// Add a sort key; earlier keys take precedence
    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push((field.into(), direction));
        self
    }

    /// Set the number of documents to skip
    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Set the maximum number of documents to return
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn get_filter(&self) -> &Filter {
        &self.filter
    }

    pub fn get_projection(&self) -> &Projection {
        &self.projection
    }

    pub fn get_sort(&self) -> &[(String, SortDirection)] {
        &self.sort
    }

    pub fn get_skip(&self) -> Option<u64> {
        self.skip
    }

    pub fn get_limit(&self) -> Option<i64> {
        self.limit
    }

    fn options(&self) -> Result<FindOptions> {
        let sort = if self.sort.is_empty() {
            None
        } else {
            let mut sort = Document::new();
            for (field, direction) in &self.sort {
                check_field(field)?;
                sort.insert(field.clone(), direction.to_bson());
            }
            Some(sort)
        };

        Ok(FindOptions {
            projection: self.projection.to_document()?,
            sort,
            skip: self.skip,
            limit: self.limit,
        })
    }

    #[instrument(skip(self), fields(collection = %self.handle.collection_name()))]
    async fn open(&self) -> Result<DocumentStream> {
        let filter = self.filter.to_document()?;
        let options = self.options()?;
        debug!(filter = %filter, options = ?options, "find");

        let collection = self.handle.collection_name();
        self.handle.session().find(collection, filter, options).await
    }

    /// Execute the query and stream matching documents
    pub async fn stream(&self) -> Result<DocumentStream> {
        self.handle.call("find", self.open()).await
    }

    /// Execute the query and return all matching documents
    ///
    /// The deadline covers opening the cursor and draining it.
    pub async fn to_list(&self) -> Result<Vec<Document>> {
        self.handle
            .call("find", async { self.open().await?.try_collect::<Vec<_>>().await })
            .await
    }

    /// Execute the query and return the first matching document
    pub async fn first(&self) -> Result<Option<Document>> {
        let docs = self.clone().limit(1).to_list().await?;
        Ok(docs.into_iter().next())
    }

    /// Count documents matching the filter (skip and limit are not applied)
    pub async fn count(&self) -> Result<u64> {
        self.handle.count(self.filter.clone()).await
    }
}
