//! Docweave CLI library
//!
//! The blog tutorial and the operations the `docweave` binary runs.

pub mod tutorial;

use bson::{Bson, Document};
use clap::ValueEnum;
use docweave_mongodb::{Result, UpdateOutcome};
use serde_json::{json, Value};

pub use tutorial::{Post, SeedSummary, Tutorial};

/// One canned tutorial operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Operation {
    /// Replace all collections with sample data
    Seed,
    /// Insert posts 11 and 12
    Create,
    /// Delete the post with id 7
    DeleteOne,
    /// Delete posts with id 4 titled "Fourth Post"
    DeleteMany,
    /// Every comment's text and likes
    FindAll,
    /// Text and likes of comments with more than 4 likes
    FindSome,
    /// Insert users emma and frank
    InsertMany,
    /// Rewrite the text of comment 7
    UpdateOne,
    /// Rewrite the text of comments with more than 5 likes
    UpdateMany,
    /// Title, content and likes of every post
    Lean,
    /// Popular posts counted per author
    Group,
    /// Users joined with their posts
    Lookup,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Seed => "seed",
            Operation::Create => "create",
            Operation::DeleteOne => "delete-one",
            Operation::DeleteMany => "delete-many",
            Operation::FindAll => "find-all",
            Operation::FindSome => "find-some",
            Operation::InsertMany => "insert-many",
            Operation::UpdateOne => "update-one",
            Operation::UpdateMany => "update-many",
            Operation::Lean => "lean",
            Operation::Group => "group",
            Operation::Lookup => "lookup",
        }
    }

    /// Run against the tutorial collections and render the result as JSON
    pub async fn run(&self, tutorial: &Tutorial) -> Result<Value> {
        let value = match self {
            Operation::Seed => {
                let summary = tutorial.seed().await?;
                serde_json::to_value(summary)?
            }
            Operation::Create => ids_json(tutorial.creating().await?),
            Operation::DeleteOne => deleted_json(tutorial.deleting_one().await?),
            Operation::DeleteMany => deleted_json(tutorial.deleting_many().await?),
            Operation::FindAll => documents_json(tutorial.find_all().await?),
            Operation::FindSome => documents_json(tutorial.find_some().await?),
            Operation::InsertMany => ids_json(tutorial.inserting_many().await?),
            Operation::UpdateOne => outcome_json(tutorial.updating_one().await?),
            Operation::UpdateMany => outcome_json(tutorial.updating_many().await?),
            Operation::Lean => documents_json(tutorial.leaning().await?),
            Operation::Group => documents_json(tutorial.grouping().await?),
            Operation::Lookup => documents_json(tutorial.looking_up().await?),
        };
        Ok(value)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Relaxed extended JSON for a list of documents
pub fn documents_json(documents: Vec<Document>) -> Value {
    Value::Array(
        documents
            .into_iter()
            .map(|document| Bson::Document(document).into_relaxed_extjson())
            .collect(),
    )
}

fn ids_json(ids: Vec<Bson>) -> Value {
    json!({ "insertedIds": ids.into_iter().map(Bson::into_relaxed_extjson).collect::<Vec<_>>() })
}

fn deleted_json(deleted: u64) -> Value {
    json!({ "deletedCount": deleted })
}

fn outcome_json(outcome: UpdateOutcome) -> Value {
    json!({ "matchedCount": outcome.matched, "modifiedCount": outcome.modified })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_operation_names_match_value_enum() {
        for operation in Operation::value_variants() {
            let parsed = Operation::from_str(operation.name(), false).unwrap();
            assert_eq!(&parsed, operation);
        }
    }

    #[test]
    fn test_documents_json_is_relaxed() {
        let value = documents_json(vec![doc! { "_id": 2, "total": 2_i64, "avg": 1.5 }]);
        assert_eq!(value, json!([{ "_id": 2, "total": 2, "avg": 1.5 }]));
    }

    #[test]
    fn test_outcome_json() {
        let value = outcome_json(UpdateOutcome {
            matched: 3,
            modified: 2,
        });
        assert_eq!(value, json!({ "matchedCount": 3, "modifiedCount": 2 }));
    }
}
