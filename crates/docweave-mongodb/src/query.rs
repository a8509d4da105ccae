//! Typed filter, update and projection expressions
//!
//! Everything here is inert data: no I/O and no store coupling. Values are
//! translated to the store's BSON form with `to_document()`, which is also
//! where field names are checked.

use bson::{doc, Bson, Document};
use docweave_common::{DocweaveError, Result};
use docweave_validation::ValidatedFieldName;
use serde::Serialize;

pub(crate) fn check_field(name: &str) -> Result<()> {
    ValidatedFieldName::new(name)
        .map(|_| ())
        .map_err(|e| DocweaveError::Query(e.to_string()))
}

/// Comparison operators usable in a filter condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Value is one of the operand array
    In,
    /// Value is none of the operand array
    Nin,
    /// Field presence (operand is a bool)
    Exists,
}

impl Comparison {
    /// Returns the query operator string.
    pub fn operator(&self) -> &'static str {
        match self {
            Comparison::Eq => "$eq",
            Comparison::Ne => "$ne",
            Comparison::Gt => "$gt",
            Comparison::Gte => "$gte",
            Comparison::Lt => "$lt",
            Comparison::Lte => "$lte",
            Comparison::In => "$in",
            Comparison::Nin => "$nin",
            Comparison::Exists => "$exists",
        }
    }
}

/// Filter expression selecting documents
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub enum Filter {
    /// Matches every document
    #[default]
    All,
    /// `field <op> value`
    Condition {
        field: String,
        op: Comparison,
        value: Bson,
    },
    /// Every sub-filter matches
    And(Vec<Filter>),
    /// At least one sub-filter matches
    Or(Vec<Filter>),
}

impl Filter {
    pub fn all() -> Self {
        Filter::All
    }

    fn condition(field: impl Into<String>, op: Comparison, value: Bson) -> Self {
        Filter::Condition {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::condition(field, Comparison::Eq, value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::condition(field, Comparison::Ne, value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::condition(field, Comparison::Gt, value.into())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::condition(field, Comparison::Gte, value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::condition(field, Comparison::Lt, value.into())
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::condition(field, Comparison::Lte, value.into())
    }

    pub fn in_<V: Into<Bson>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        let values: Vec<Bson> = values.into_iter().map(Into::into).collect();
        Self::condition(field, Comparison::In, Bson::Array(values))
    }

    pub fn nin<V: Into<Bson>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        let values: Vec<Bson> = values.into_iter().map(Into::into).collect();
        Self::condition(field, Comparison::Nin, Bson::Array(values))
    }

    pub fn exists(field: impl Into<String>, present: bool) -> Self {
        Self::condition(field, Comparison::Exists, Bson::Boolean(present))
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Or(filters.into_iter().collect())
    }

    /// Combine with another filter, flattening nested conjunctions
    pub fn and_also(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, other) => other,
            (this, Filter::All) => this,
            (Filter::And(mut left), Filter::And(right)) => {
                left.extend(right);
                Filter::And(left)
            }
            (Filter::And(mut left), other) => {
                left.push(other);
                Filter::And(left)
            }
            (this, other) => Filter::And(vec![this, other]),
        }
    }

    /// Field names referenced anywhere in the filter
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Filter::All => Vec::new(),
            Filter::Condition { field, .. } => vec![field.as_str()],
            Filter::And(filters) | Filter::Or(filters) => {
                filters.iter().flat_map(|f| f.fields()).collect()
            }
        }
    }

    /// Translate to the store's native filter document
    pub fn to_document(&self) -> Result<Document> {
        match self {
            Filter::All => Ok(Document::new()),
            Filter::Condition { field, op, value } => {
                check_field(field)?;
                match op {
                    // Plain equality keeps the literal form unless the value is
                    // itself a document, which would read as an operator map
                    Comparison::Eq if !matches!(value, Bson::Document(_)) => {
                        Ok(doc! { field.as_str(): value.clone() })
                    }
                    Comparison::In | Comparison::Nin if !matches!(value, Bson::Array(_)) => {
                        Err(DocweaveError::Query(format!(
                            "'{}' on field '{}' requires an array operand",
                            op.operator(),
                            field
                        )))
                    }
                    Comparison::Exists if !matches!(value, Bson::Boolean(_)) => {
                        Err(DocweaveError::Query(format!(
                            "'$exists' on field '{}' requires a boolean operand",
                            field
                        )))
                    }
                    _ => Ok(doc! { field.as_str(): { op.operator(): value.clone() } }),
                }
            }
            Filter::And(filters) => {
                let parts = filters
                    .iter()
                    .filter(|f| **f != Filter::All)
                    .map(Filter::to_document)
                    .collect::<Result<Vec<_>>>()?;

                // Merge into one document when no key repeats; {$and: [...]} otherwise
                let mut merged = Document::new();
                let mut collision = false;
                for part in &parts {
                    for (key, value) in part {
                        if merged.insert(key.clone(), value.clone()).is_some() {
                            collision = true;
                        }
                    }
                }
                if collision {
                    Ok(doc! { "$and": parts })
                } else {
                    Ok(merged)
                }
            }
            Filter::Or(filters) => {
                if filters.is_empty() {
                    return Err(DocweaveError::Query(
                        "or() requires at least one condition".to_string(),
                    ));
                }
                let parts = filters
                    .iter()
                    .map(Filter::to_document)
                    .collect::<Result<Vec<_>>>()?;
                Ok(doc! { "$or": parts })
            }
        }
    }
}

/// Partial update applied to matched documents
///
/// Fields not mentioned are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Update {
    set: Document,
    unset: Vec<String>,
    inc: Document,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace one field's value
    pub fn set(field: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::new().and_set(field, value)
    }

    /// Replace every field present in `fields`
    pub fn set_fields(fields: Document) -> Self {
        Self {
            set: fields,
            ..Self::default()
        }
    }

    pub fn and_set(mut self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.set.insert(field.into(), value.into());
        self
    }

    /// Remove a field
    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.unset.push(field.into());
        self
    }

    /// Add `amount` to a numeric field
    pub fn inc(mut self, field: impl Into<String>, amount: impl Into<Bson>) -> Self {
        self.inc.insert(field.into(), amount.into());
        self
    }

    pub fn set_values(&self) -> &Document {
        &self.set
    }

    pub fn unset_fields(&self) -> &[String] {
        &self.unset
    }

    pub fn increments(&self) -> &Document {
        &self.inc
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty() && self.inc.is_empty()
    }

    /// Replace every part with its schema-checked counterpart
    pub(crate) fn checked(set: Document, unset: Vec<String>, inc: Document) -> Self {
        Self { set, unset, inc }
    }

    /// Translate to the store's update document (`$set`, `$unset`, `$inc`)
    pub fn to_document(&self) -> Result<Document> {
        if self.is_empty() {
            return Err(DocweaveError::Query("update has no fields to change".to_string()));
        }

        let mut update = Document::new();
        if !self.set.is_empty() {
            for key in self.set.keys() {
                check_field(key)?;
            }
            update.insert("$set", self.set.clone());
        }
        if !self.unset.is_empty() {
            let mut unset = Document::new();
            for field in &self.unset {
                check_field(field)?;
                unset.insert(field.clone(), "");
            }
            update.insert("$unset", unset);
        }
        if !self.inc.is_empty() {
            for key in self.inc.keys() {
                check_field(key)?;
            }
            update.insert("$inc", self.inc.clone());
        }
        Ok(update)
    }
}

/// Field selection for returned documents
///
/// An inclusion projection returns only the listed fields; `_id` comes back
/// only when it is listed. An exclusion projection returns everything else.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub enum Projection {
    /// Whole documents
    #[default]
    All,
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl Projection {
    pub fn all() -> Self {
        Projection::All
    }

    pub fn include<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        Projection::Include(fields.into_iter().map(Into::into).collect())
    }

    pub fn exclude<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        Projection::Exclude(fields.into_iter().map(Into::into).collect())
    }

    /// Drop `_id` from the results
    pub fn without_id(self) -> Self {
        match self {
            Projection::All => Projection::Exclude(vec!["_id".to_string()]),
            Projection::Include(fields) => {
                Projection::Include(fields.into_iter().filter(|f| f != "_id").collect())
            }
            Projection::Exclude(mut fields) => {
                if !fields.iter().any(|f| f == "_id") {
                    fields.push("_id".to_string());
                }
                Projection::Exclude(fields)
            }
        }
    }

    pub fn fields(&self) -> &[String] {
        match self {
            Projection::All => &[],
            Projection::Include(fields) | Projection::Exclude(fields) => fields,
        }
    }

    /// Translate to the store's projection document; `None` means whole documents
    pub fn to_document(&self) -> Result<Option<Document>> {
        match self {
            Projection::All => Ok(None),
            Projection::Include(fields) => {
                if fields.is_empty() {
                    return Err(DocweaveError::Query(
                        "inclusion projection needs at least one field".to_string(),
                    ));
                }
                let mut projection = Document::new();
                for field in fields {
                    check_field(field)?;
                    projection.insert(field.clone(), true);
                }
                if !projection.contains_key("_id") {
                    projection.insert("_id", false);
                }
                Ok(Some(projection))
            }
            Projection::Exclude(fields) => {
                if fields.is_empty() {
                    return Ok(None);
                }
                let mut projection = Document::new();
                for field in fields {
                    check_field(field)?;
                    projection.insert(field.clone(), false);
                }
                Ok(Some(projection))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_all_is_empty() {
        assert!(Filter::all().to_document().unwrap().is_empty());
    }

    #[test]
    fn test_filter_eq_is_literal() {
        let filter = Filter::eq("id", 7);
        assert_eq!(filter.to_document().unwrap(), doc! { "id": 7 });
    }

    #[test]
    fn test_filter_eq_document_uses_operator() {
        let filter = Filter::eq("meta", doc! { "a": 1 });
        assert_eq!(
            filter.to_document().unwrap(),
            doc! { "meta": { "$eq": { "a": 1 } } }
        );
    }

    #[test]
    fn test_filter_comparisons() {
        assert_eq!(
            Filter::gt("likes", 4).to_document().unwrap(),
            doc! { "likes": { "$gt": 4 } }
        );
        assert_eq!(
            Filter::in_("id", [1, 2]).to_document().unwrap(),
            doc! { "id": { "$in": [1, 2] } }
        );
        assert_eq!(
            Filter::exists("email", false).to_document().unwrap(),
            doc! { "email": { "$exists": false } }
        );
    }

    #[test]
    fn test_filter_and_merges_distinct_fields() {
        let filter = Filter::and([Filter::eq("id", 4), Filter::eq("title", "Fourth Post")]);
        assert_eq!(
            filter.to_document().unwrap(),
            doc! { "id": 4, "title": "Fourth Post" }
        );
    }

    #[test]
    fn test_filter_and_keeps_repeated_fields_apart() {
        let filter = Filter::gt("likes", 1).and_also(Filter::lt("likes", 9));
        assert_eq!(
            filter.to_document().unwrap(),
            doc! { "$and": [ { "likes": { "$gt": 1 } }, { "likes": { "$lt": 9 } } ] }
        );
    }

    #[test]
    fn test_filter_and_also_with_all() {
        let filter = Filter::all().and_also(Filter::eq("id", 1));
        assert_eq!(filter, Filter::eq("id", 1));
    }

    #[test]
    fn test_filter_or() {
        let filter = Filter::or([Filter::eq("id", 1), Filter::eq("id", 2)]);
        assert_eq!(
            filter.to_document().unwrap(),
            doc! { "$or": [ { "id": 1 }, { "id": 2 } ] }
        );
        assert!(Filter::or(Vec::new()).to_document().is_err());
    }

    #[test]
    fn test_filter_rejects_operator_field() {
        let err = Filter::eq("$where", "1 == 1").to_document().unwrap_err();
        assert!(matches!(err, DocweaveError::Query(_)));
    }

    #[test]
    fn test_filter_rejects_non_array_in() {
        let filter = Filter::Condition {
            field: "id".to_string(),
            op: Comparison::In,
            value: Bson::Int32(1),
        };
        assert!(filter.to_document().is_err());
    }

    #[test]
    fn test_filter_fields() {
        let filter = Filter::or([Filter::eq("a", 1), Filter::and([Filter::gt("b", 2)])]);
        assert_eq!(filter.fields(), vec!["a", "b"]);
    }

    #[test]
    fn test_filter_is_serializable_for_logging() {
        let logged = bson::to_bson(&Filter::gt("likes", 12)).unwrap().to_string();
        assert!(logged.contains("likes"));
    }

    #[test]
    fn test_update_set() {
        let update = Update::set("text", "Hello, Mongoose");
        assert_eq!(
            update.to_document().unwrap(),
            doc! { "$set": { "text": "Hello, Mongoose" } }
        );
    }

    #[test]
    fn test_update_combined() {
        let update = Update::set_fields(doc! { "title": "B" })
            .unset("tags")
            .inc("likes", 1);
        assert_eq!(
            update.to_document().unwrap(),
            doc! {
                "$set": { "title": "B" },
                "$unset": { "tags": "" },
                "$inc": { "likes": 1 },
            }
        );
    }

    #[test]
    fn test_empty_update_rejected() {
        assert!(Update::new().to_document().is_err());
    }

    #[test]
    fn test_projection_include_hides_id() {
        let projection = Projection::include(["text", "likes"]);
        assert_eq!(
            projection.to_document().unwrap(),
            Some(doc! { "text": true, "likes": true, "_id": false })
        );
    }

    #[test]
    fn test_projection_include_with_id() {
        let projection = Projection::include(["_id", "title"]);
        assert_eq!(
            projection.to_document().unwrap(),
            Some(doc! { "_id": true, "title": true })
        );
        assert_eq!(
            projection.without_id().to_document().unwrap(),
            Some(doc! { "title": true, "_id": false })
        );
    }

    #[test]
    fn test_projection_exclude() {
        assert_eq!(Projection::all().to_document().unwrap(), None);
        assert_eq!(
            Projection::all().without_id().to_document().unwrap(),
            Some(doc! { "_id": false })
        );
        assert_eq!(
            Projection::exclude(["content"]).to_document().unwrap(),
            Some(doc! { "content": false })
        );
    }
}
