//! Aggregation pipeline stages
//!
//! Stages are a closed set built through checked constructors, so a
//! malformed stage fails where it is written instead of inside the store.
//! The executor still re-checks every stage before sending it, since the
//! enum variants are public and can be built by hand.

use bson::{doc, Bson, Document};
use docweave_common::{DocweaveError, Result};
use docweave_validation::{ValidatedCollectionName, ValidatedFieldName};
use serde::Serialize;

use crate::query::{Filter, Projection};

fn check_field(name: &str) -> Result<()> {
    ValidatedFieldName::new(name)
        .map(|_| ())
        .map_err(|e| DocweaveError::MalformedPipeline(e.to_string()))
}

/// Field reference expression ("$authorId")
fn field_ref(field: &str) -> Bson {
    Bson::String(format!("${}", field))
}

/// Sort order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    /// Returns the store's numeric direction (1 / -1).
    pub fn to_bson(&self) -> Bson {
        match self {
            SortDirection::Ascending => Bson::Int32(1),
            SortDirection::Descending => Bson::Int32(-1),
        }
    }
}

/// Group accumulators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Aggregator {
    /// Number of documents in the group
    Count,
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
    First(String),
    Last(String),
    /// All values of the field, as an array
    Push(String),
}

impl Aggregator {
    /// Build an aggregator from its kind name.
    ///
    /// Unknown kinds fail here with `UnsupportedAggregator`; kinds that read a
    /// field fail with `MalformedPipeline` when none (or a bad one) is given.
    pub fn parse(kind: &str, field: Option<&str>) -> Result<Self> {
        let kind = kind.trim().trim_start_matches('$').to_ascii_lowercase();
        if kind == "count" {
            return Ok(Aggregator::Count);
        }

        let build: fn(String) -> Aggregator = match kind.as_str() {
            "sum" => Aggregator::Sum,
            "avg" | "average" => Aggregator::Avg,
            "min" => Aggregator::Min,
            "max" => Aggregator::Max,
            "first" => Aggregator::First,
            "last" => Aggregator::Last,
            "push" => Aggregator::Push,
            _ => return Err(DocweaveError::UnsupportedAggregator(kind.clone())),
        };

        let field = field.ok_or_else(|| {
            DocweaveError::MalformedPipeline(format!("aggregator '{}' needs a field", kind))
        })?;
        check_field(field)?;
        Ok(build(field.to_string()))
    }

    /// Field read by the aggregator, if any
    pub fn field(&self) -> Option<&str> {
        match self {
            Aggregator::Count => None,
            Aggregator::Sum(f)
            | Aggregator::Avg(f)
            | Aggregator::Min(f)
            | Aggregator::Max(f)
            | Aggregator::First(f)
            | Aggregator::Last(f)
            | Aggregator::Push(f) => Some(f),
        }
    }

    /// Returns the accumulator expression (`{"$sum": 1}`, `{"$avg": "$likes"}`, ...)
    pub fn to_document(&self) -> Document {
        match self {
            Aggregator::Count => doc! { "$sum": 1 },
            Aggregator::Sum(f) => doc! { "$sum": field_ref(f) },
            Aggregator::Avg(f) => doc! { "$avg": field_ref(f) },
            Aggregator::Min(f) => doc! { "$min": field_ref(f) },
            Aggregator::Max(f) => doc! { "$max": field_ref(f) },
            Aggregator::First(f) => doc! { "$first": field_ref(f) },
            Aggregator::Last(f) => doc! { "$last": field_ref(f) },
            Aggregator::Push(f) => doc! { "$push": field_ref(f) },
        }
    }
}

/// Join specification for a lookup stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lookup {
    /// Collection joined against
    pub from: String,
    pub local_field: String,
    pub foreign_field: String,
    /// Output array field
    pub as_field: String,
}

/// One aggregation stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Stage {
    Match(Filter),
    Group {
        /// Grouping field; `None` groups every document together
        key: Option<String>,
        accumulators: Vec<(String, Aggregator)>,
    },
    Sort(Vec<(String, SortDirection)>),
    Project(Projection),
    Lookup(Lookup),
    Limit(u64),
    Skip(u64),
}

impl Stage {
    /// Keep documents matching `filter`
    pub fn match_stage(filter: Filter) -> Result<Self> {
        Self::checked(Stage::Match(filter))
    }

    /// Group by `key`, computing each named accumulator
    pub fn group<S: Into<String>>(
        key: &str,
        accumulators: impl IntoIterator<Item = (S, Aggregator)>,
    ) -> Result<Self> {
        Self::checked(Stage::Group {
            key: Some(key.to_string()),
            accumulators: accumulators
                .into_iter()
                .map(|(name, agg)| (name.into(), agg))
                .collect(),
        })
    }

    /// Group every document into one result
    pub fn group_all<S: Into<String>>(
        accumulators: impl IntoIterator<Item = (S, Aggregator)>,
    ) -> Result<Self> {
        Self::checked(Stage::Group {
            key: None,
            accumulators: accumulators
                .into_iter()
                .map(|(name, agg)| (name.into(), agg))
                .collect(),
        })
    }

    pub fn sort(key: &str, direction: SortDirection) -> Result<Self> {
        Self::sort_by([(key, direction)])
    }

    /// Sort on several keys, in priority order
    pub fn sort_by<S: Into<String>>(
        keys: impl IntoIterator<Item = (S, SortDirection)>,
    ) -> Result<Self> {
        Self::checked(Stage::Sort(
            keys.into_iter().map(|(k, d)| (k.into(), d)).collect(),
        ))
    }

    pub fn project(projection: Projection) -> Result<Self> {
        Self::checked(Stage::Project(projection))
    }

    /// Left outer join: documents of `from` whose `foreign_field` equals this
    /// document's `local_field` are collected into `as_field`
    pub fn lookup(from: &str, local_field: &str, foreign_field: &str, as_field: &str) -> Result<Self> {
        Self::checked(Stage::Lookup(Lookup {
            from: from.to_string(),
            local_field: local_field.to_string(),
            foreign_field: foreign_field.to_string(),
            as_field: as_field.to_string(),
        }))
    }

    pub fn limit(count: u64) -> Result<Self> {
        Self::checked(Stage::Limit(count))
    }

    pub fn skip(count: u64) -> Result<Self> {
        Self::checked(Stage::Skip(count))
    }

    fn checked(stage: Stage) -> Result<Self> {
        stage.validate()?;
        Ok(stage)
    }

    /// Returns the stage's operator name
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Group { .. } => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Project(_) => "$project",
            Stage::Lookup(_) => "$lookup",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
        }
    }

    /// Check that every referenced name is well-formed
    pub fn validate(&self) -> Result<()> {
        match self {
            Stage::Match(filter) => {
                for field in filter.fields() {
                    check_field(field)?;
                }
                filter
                    .to_document()
                    .map(|_| ())
                    .map_err(|e| DocweaveError::MalformedPipeline(e.to_string()))
            }
            Stage::Group { key, accumulators } => {
                if let Some(key) = key {
                    check_field(key)?;
                }
                for (index, (name, aggregator)) in accumulators.iter().enumerate() {
                    check_field(name)?;
                    if name == "_id" || name.contains('.') {
                        return Err(DocweaveError::MalformedPipeline(format!(
                            "group output '{}' must be a plain name other than '_id'",
                            name
                        )));
                    }
                    if accumulators[..index].iter().any(|(prior, _)| prior == name) {
                        return Err(DocweaveError::MalformedPipeline(format!(
                            "group output '{}' declared twice",
                            name
                        )));
                    }
                    if let Some(field) = aggregator.field() {
                        check_field(field)?;
                    }
                }
                Ok(())
            }
            Stage::Sort(keys) => {
                if keys.is_empty() {
                    return Err(DocweaveError::MalformedPipeline(
                        "sort stage needs at least one key".to_string(),
                    ));
                }
                keys.iter().try_for_each(|(key, _)| check_field(key))
            }
            Stage::Project(projection) => {
                if matches!(projection, Projection::All) || projection.fields().is_empty() {
                    return Err(DocweaveError::MalformedPipeline(
                        "project stage needs at least one field".to_string(),
                    ));
                }
                projection.fields().iter().try_for_each(|f| check_field(f))
            }
            Stage::Lookup(lookup) => {
                ValidatedCollectionName::new(&lookup.from)
                    .map_err(|e| DocweaveError::MalformedPipeline(e.to_string()))?;
                check_field(&lookup.local_field)?;
                check_field(&lookup.foreign_field)?;
                check_field(&lookup.as_field)
            }
            Stage::Limit(0) => Err(DocweaveError::MalformedPipeline(
                "limit must be positive".to_string(),
            )),
            Stage::Limit(count) | Stage::Skip(count) => stage_count(*count).map(|_| ()),
        }
    }

    /// Translate to the store's stage document
    pub fn to_document(&self) -> Result<Document> {
        self.validate()?;

        let stage = match self {
            Stage::Match(filter) => doc! { "$match": filter.to_document()? },
            Stage::Group { key, accumulators } => {
                let mut group = Document::new();
                group.insert("_id", key.as_deref().map_or(Bson::Null, field_ref));
                for (name, aggregator) in accumulators {
                    group.insert(name.clone(), aggregator.to_document());
                }
                doc! { "$group": group }
            }
            Stage::Sort(keys) => {
                let mut sort = Document::new();
                for (key, direction) in keys {
                    sort.insert(key.clone(), direction.to_bson());
                }
                doc! { "$sort": sort }
            }
            Stage::Project(projection) => {
                let fields = projection.to_document()?.unwrap_or_default();
                doc! { "$project": fields }
            }
            Stage::Lookup(lookup) => doc! {
                "$lookup": {
                    "from": lookup.from.as_str(),
                    "localField": lookup.local_field.as_str(),
                    "foreignField": lookup.foreign_field.as_str(),
                    "as": lookup.as_field.as_str(),
                }
            },
            Stage::Limit(count) => doc! { "$limit": stage_count(*count)? },
            Stage::Skip(count) => doc! { "$skip": stage_count(*count)? },
        };
        Ok(stage)
    }
}

/// Limit and skip counts travel as BSON int64
fn stage_count(count: u64) -> Result<i64> {
    i64::try_from(count).map_err(|_| {
        DocweaveError::MalformedPipeline(format!("count {} exceeds the int64 range", count))
    })
}

/// Ordered sequence of stages
///
/// Stages are sent in declaration order; nothing is reordered or merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Collections referenced by lookup stages
    pub fn lookup_targets(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().filter_map(|stage| match stage {
            Stage::Lookup(lookup) => Some(lookup.from.as_str()),
            _ => None,
        })
    }

    /// Translate every stage, in order
    pub fn to_documents(&self) -> Result<Vec<Document>> {
        self.stages.iter().map(Stage::to_document).collect()
    }
}

impl From<Vec<Stage>> for Pipeline {
    fn from(stages: Vec<Stage>) -> Self {
        Self { stages }
    }
}

impl FromIterator<Stage> for Pipeline {
    fn from_iter<I: IntoIterator<Item = Stage>>(iter: I) -> Self {
        Self {
            stages: iter.into_iter().collect(),
        }
    }
}
