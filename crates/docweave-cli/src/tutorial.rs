//! Blog tutorial: users, posts and comments
//!
//! Three schemas and the canned operations run against them. Every
//! operation is an ordinary handle call; nothing here talks to the store
//! directly.

use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Bson, Document};
use docweave_mongodb::{
    Aggregator, CollectionHandle, FieldConstraint, FieldType, Filter, Model, Pipeline,
    Projection, Result, Schema, SchemaRegistry, Session, SortDirection, Stage, Update,
    UpdateOutcome,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

pub fn user_schema() -> Result<Schema> {
    Schema::builder("User")
        .field(FieldConstraint::new("id", FieldType::Number).required().unique())
        .field(FieldConstraint::new("username", FieldType::String).required().unique())
        .field(FieldConstraint::new("email", FieldType::String).required().unique())
        .field(FieldConstraint::new("subscribers", FieldType::Number).default_value(0))
        .build()
}

pub fn post_schema() -> Result<Schema> {
    Schema::builder("Post")
        .field(FieldConstraint::new("id", FieldType::Number).required().unique())
        .field(FieldConstraint::new("title", FieldType::String).required())
        .field(FieldConstraint::new("content", FieldType::String).required())
        .field(FieldConstraint::new("authorId", FieldType::Number).required())
        .field(FieldConstraint::new("likes", FieldType::Number).default_value(0))
        .build()
}

pub fn comment_schema() -> Result<Schema> {
    Schema::builder("Comment")
        .field(FieldConstraint::new("id", FieldType::Number).required().unique())
        .field(FieldConstraint::new("text", FieldType::String).required())
        .field(FieldConstraint::new("postId", FieldType::Number).required())
        .field(FieldConstraint::new("likes", FieldType::Number).default_value(0))
        .build()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: i32,
    pub title: String,
    pub content: String,
    #[serde(rename = "authorId")]
    pub author_id: i32,
    #[serde(default)]
    pub likes: i32,
}

impl Model for Post {
    fn schema() -> Result<Schema> {
        post_schema()
    }
}

const ORDINALS: [&str; 10] = [
    "First", "Second", "Third", "Fourth", "Fifth", "Sixth", "Seventh", "Eighth", "Ninth", "Tenth",
];

fn seed_users() -> Vec<Document> {
    let names = ["alice", "bob", "carol", "dave", "erin"];
    names
        .iter()
        .zip(1..)
        .map(|(name, id)| {
            doc! {
                "id": id,
                "username": *name,
                "email": format!("{}@example.com", name),
                "subscribers": id * 20,
            }
        })
        .collect()
}

fn seed_posts() -> Vec<Document> {
    let authors = [1, 2, 1, 3, 2, 4, 5, 3, 1, 2];
    let likes = [3, 14, 8, 20, 1, 13, 6, 17, 0, 9];
    ORDINALS
        .iter()
        .zip(authors.iter().zip(likes.iter()))
        .zip(1..)
        .map(|((ordinal, (author, like)), id)| {
            doc! {
                "id": id,
                "title": format!("{} Post", ordinal),
                "content": format!("Content for the {} post.", ordinal.to_lowercase()),
                "authorId": *author,
                "likes": *like,
            }
        })
        .collect()
}

fn seed_comments() -> Vec<Document> {
    let post_ids = [1, 1, 2, 3, 4, 4, 5, 6, 8, 10];
    let likes = [0, 2, 5, 7, 1, 9, 3, 6, 4, 12];
    post_ids
        .iter()
        .zip(likes.iter())
        .zip(1..)
        .map(|((post, like), id)| {
            doc! {
                "id": id,
                "text": format!("Comment {} on post {}", id, post),
                "postId": *post,
                "likes": *like,
            }
        })
        .collect()
}

/// Document counts written by [`Tutorial::seed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub users: usize,
    pub posts: usize,
    pub comments: usize,
}

/// Handles on the tutorial's three collections
#[derive(Debug, Clone)]
pub struct Tutorial {
    registry: Arc<SchemaRegistry>,
    users: CollectionHandle,
    posts: CollectionHandle,
    comments: CollectionHandle,
}

impl Tutorial {
    pub fn new(session: Arc<dyn Session>) -> Result<Self> {
        let registry = Arc::new(SchemaRegistry::new());
        let users = registry.register(user_schema()?)?;
        let posts = registry.register(post_schema()?)?;
        let comments = registry.register(comment_schema()?)?;

        Ok(Self {
            users: registry.handle(session.clone(), users.collection())?,
            posts: registry.handle(session.clone(), posts.collection())?,
            comments: registry.handle(session, comments.collection())?,
            registry,
        })
    }

    /// Apply a per-call timeout to every handle
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            users: self.users.with_timeout(timeout),
            posts: self.posts.with_timeout(timeout),
            comments: self.comments.with_timeout(timeout),
            registry: self.registry,
        }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn users(&self) -> &CollectionHandle {
        &self.users
    }

    pub fn posts(&self) -> &CollectionHandle {
        &self.posts
    }

    pub fn comments(&self) -> &CollectionHandle {
        &self.comments
    }

    /// Create the unique indexes declared by the schemas
    pub async fn ensure_indexes(&self) -> Result<()> {
        for handle in [&self.users, &self.posts, &self.comments] {
            handle.ensure_indexes().await?;
        }
        Ok(())
    }

    /// Replace the contents of all three collections with sample data
    #[instrument(skip(self))]
    pub async fn seed(&self) -> Result<SeedSummary> {
        let mut counts = [0usize; 3];
        let batches = [
            (&self.users, seed_users()),
            (&self.posts, seed_posts()),
            (&self.comments, seed_comments()),
        ];
        for (slot, (handle, documents)) in counts.iter_mut().zip(batches) {
            handle.delete_many(Filter::all()).await?;
            *slot = handle.insert_many(documents).await?.len();
        }

        let summary = SeedSummary {
            users: counts[0],
            posts: counts[1],
            comments: counts[2],
        };
        info!(?summary, "sample data seeded");
        Ok(summary)
    }

    /// Create two posts through the typed model
    pub async fn creating(&self) -> Result<Vec<Bson>> {
        let posts = [
            Post {
                id: 11,
                title: "First Post".to_string(),
                content: "Content for the first post.".to_string(),
                author_id: 1,
                likes: 10,
            },
            Post {
                id: 12,
                title: "Second Post".to_string(),
                content: "Content for the second post.".to_string(),
                author_id: 2,
                likes: 15,
            },
        ];
        self.posts.typed::<Post>()?.insert_many(&posts).await
    }

    pub async fn deleting_one(&self) -> Result<u64> {
        self.posts.delete_one(Filter::eq("id", 7)).await
    }

    pub async fn deleting_many(&self) -> Result<u64> {
        self.posts
            .delete_many(Filter::eq("id", 4).and_also(Filter::eq("title", "Fourth Post")))
            .await
    }

    pub async fn find_all(&self) -> Result<Vec<Document>> {
        self.comments
            .find_many(Filter::all(), Projection::include(["text", "likes"]))
            .to_list()
            .await
    }

    pub async fn find_some(&self) -> Result<Vec<Document>> {
        self.comments
            .find_many(Filter::gt("likes", 4), Projection::include(["text", "likes"]))
            .to_list()
            .await
    }

    pub async fn inserting_many(&self) -> Result<Vec<Bson>> {
        self.users
            .insert_many(vec![
                doc! { "id": 6, "username": "emma", "email": "emma@example.com", "subscribers": 80 },
                doc! { "id": 7, "username": "frank", "email": "frank@example.com", "subscribers": 110 },
            ])
            .await
    }

    pub async fn updating_one(&self) -> Result<UpdateOutcome> {
        self.comments
            .update_one(Filter::eq("id", 7), Update::set("text", "Hello, Mongoose"))
            .await
    }

    pub async fn updating_many(&self) -> Result<UpdateOutcome> {
        self.comments
            .update_many(Filter::gt("likes", 5), Update::set("text", "Hello, Mongoose"))
            .await
    }

    /// Plain documents with only title, content and likes
    pub async fn leaning(&self) -> Result<Vec<Document>> {
        self.posts
            .find_many(
                Filter::all(),
                Projection::include(["title", "content", "likes"]),
            )
            .to_list()
            .await
    }

    /// Number of posts with more than 12 likes, per author, highest author first
    pub async fn grouping(&self) -> Result<Vec<Document>> {
        let pipeline = Pipeline::new()
            .stage(Stage::match_stage(Filter::gt("likes", 12))?)
            .stage(Stage::group("authorId", [("total", Aggregator::Count)])?)
            .stage(Stage::sort("_id", SortDirection::Descending)?);
        self.posts.aggregate(&pipeline).await
    }

    /// Every user with their posts attached as `POSTS`
    pub async fn looking_up(&self) -> Result<Vec<Document>> {
        let pipeline = Pipeline::new()
            .stage(Stage::lookup("posts", "id", "authorId", "POSTS")?)
            .stage(Stage::project(Projection::include([
                "id",
                "username",
                "subscribers",
                "POSTS",
            ]))?);
        self.users.aggregate(&pipeline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docweave_mongodb::{validate, MemorySession};

    #[test]
    fn test_schemas_map_to_plural_collections() {
        assert_eq!(user_schema().unwrap().collection(), "users");
        assert_eq!(post_schema().unwrap().collection(), "posts");
        assert_eq!(comment_schema().unwrap().collection(), "comments");
    }

    #[test]
    fn test_unique_fields() {
        let users = user_schema().unwrap();
        let unique: Vec<&str> = users.unique_fields().collect();
        assert_eq!(unique, vec!["id", "username", "email"]);
    }

    #[test]
    fn test_seed_documents_validate() {
        let posts = post_schema().unwrap();
        for document in seed_posts() {
            validate(&posts, document).unwrap();
        }
        assert_eq!(seed_posts()[3].get_str("title").unwrap(), "Fourth Post");
        assert_eq!(seed_users().len(), 5);
        assert_eq!(seed_comments().len(), 10);
    }

    #[tokio::test]
    async fn test_with_timeout_applies_to_every_handle() {
        let tutorial = Tutorial::new(Arc::new(MemorySession::new()))
            .unwrap()
            .with_timeout(Duration::from_secs(2));
        for handle in [tutorial.users(), tutorial.posts(), tutorial.comments()] {
            assert_eq!(handle.timeout(), Some(Duration::from_secs(2)));
        }
    }
}
