//! BSON evaluation for the in-memory store
//!
//! Interprets the same translated filter, update, projection and pipeline
//! documents a MongoDB server would receive. Rejections carry the server's
//! error codes so callers see the same `StoreRejected` shape on both backends.

use std::cmp::Ordering;
use std::collections::HashMap;

use bson::{Bson, Document};
use docweave_common::{DocweaveError, Result};

pub(crate) const BAD_VALUE: i32 = 2;
pub(crate) const FAILED_TO_PARSE: i32 = 9;
pub(crate) const TYPE_MISMATCH: i32 = 14;
pub(crate) const PATH_NOT_VIABLE: i32 = 28;
pub(crate) const IMMUTABLE_FIELD: i32 = 66;
pub(crate) const UNKNOWN_GROUP_OPERATOR: i32 = 15952;
pub(crate) const GROUP_WITHOUT_ID: i32 = 15955;
pub(crate) const PROJECTION_MIX: i32 = 31254;
pub(crate) const UNKNOWN_STAGE: i32 = 40324;

pub(crate) fn store_error(code: i32, message: impl Into<String>) -> DocweaveError {
    DocweaveError::StoreRejected {
        code: Some(code),
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Canonical BSON sort bracket
fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => 13,
        _ => 12,
    }
}

pub(crate) fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(*v as f64),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

fn is_numeric(value: &Bson) -> bool {
    matches!(value, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_))
}

/// Total order over BSON values, numbers compared across widths
pub(crate) fn compare(a: &Bson, b: &Bson) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => x.cmp(y),
        (Bson::Int64(x), Bson::Int64(y)) => x.cmp(y),
        _ if is_numeric(a) && is_numeric(b) => {
            let (x, y) = (as_f64(a).unwrap_or(f64::NAN), as_f64(b).unwrap_or(f64::NAN));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Symbol(x), Bson::Symbol(y)) => x.cmp(y),
        (Bson::Document(x), Bson::Document(y)) => {
            for ((ka, va), (kb, vb)) in x.iter().zip(y.iter()) {
                let ord = compare(va, vb).then_with(|| ka.cmp(kb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Array(x), Bson::Array(y)) => {
            for (va, vb) in x.iter().zip(y.iter()) {
                let ord = compare(va, vb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            (x.time, x.increment).cmp(&(y.time, y.increment))
        }
        _ => Ordering::Equal,
    }
}

pub(crate) fn values_equal(a: &Bson, b: &Bson) -> bool {
    type_rank(a) == type_rank(b) && compare(a, b) == Ordering::Equal
}

/// Value at a dotted path; no array traversal
pub(crate) fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Bson::Document(inner) => inner.get(segment)?,
            Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Candidate values a query predicate tests at `path`.
///
/// Arrays met along the path fan out; an array at the leaf contributes
/// itself and each of its elements.
fn candidates(doc: &Document, path: &str) -> Vec<Bson> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some((head, rest)) = segments.split_first() {
        if let Some(value) = doc.get(*head) {
            collect_candidates(value, rest, &mut out);
        }
    }
    out
}

fn collect_candidates(value: &Bson, segments: &[&str], out: &mut Vec<Bson>) {
    let Some((head, rest)) = segments.split_first() else {
        if let Bson::Array(items) = value {
            out.extend(items.iter().cloned());
        }
        out.push(value.clone());
        return;
    };
    match value {
        Bson::Document(inner) => {
            if let Some(next) = inner.get(*head) {
                collect_candidates(next, rest, out);
            }
        }
        Bson::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(next) = items.get(index) {
                    collect_candidates(next, rest, out);
                }
            }
            for item in items {
                if matches!(item, Bson::Document(_)) {
                    collect_candidates(item, segments, out);
                }
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Evaluate a query document against one stored document
pub(crate) fn matches(doc: &Document, filter: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(key, condition)? {
                    if !matches(doc, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in clauses(key, condition)? {
                    if matches(doc, clause)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for clause in clauses(key, condition)? {
                    if matches(doc, clause)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            op if op.starts_with('$') => {
                return Err(store_error(
                    BAD_VALUE,
                    format!("unknown top level operator: {}", op),
                ))
            }
            field => field_matches(doc, field, condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(operator: &str, value: &'a Bson) -> Result<Vec<&'a Document>> {
    let items = match value {
        Bson::Array(items) if !items.is_empty() => items,
        _ => {
            return Err(store_error(
                BAD_VALUE,
                format!("{} must be a nonempty array", operator),
            ))
        }
    };
    items
        .iter()
        .map(|item| match item {
            Bson::Document(clause) => Ok(clause),
            _ => Err(store_error(
                BAD_VALUE,
                format!("{} argument's entries must be objects", operator),
            )),
        })
        .collect()
}

fn is_operator_document(value: &Bson) -> Option<&Document> {
    match value {
        Bson::Document(inner) if inner.keys().next().is_some_and(|k| k.starts_with('$')) => {
            Some(inner)
        }
        _ => None,
    }
}

fn field_matches(doc: &Document, field: &str, condition: &Bson) -> Result<bool> {
    let values = candidates(doc, field);
    match is_operator_document(condition) {
        Some(operators) => {
            for (op, operand) in operators {
                if !operator_matches(&values, op, operand)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        None => Ok(equals_any(&values, condition)),
    }
}

fn equals_any(values: &[Bson], target: &Bson) -> bool {
    if matches!(target, Bson::Null) && values.is_empty() {
        return true;
    }
    values.iter().any(|v| values_equal(v, target))
}

fn operator_matches(values: &[Bson], op: &str, operand: &Bson) -> Result<bool> {
    let ordered = |accept: fn(Ordering) -> bool| {
        values
            .iter()
            .any(|v| type_rank(v) == type_rank(operand) && accept(compare(v, operand)))
    };
    let matched = match op {
        "$eq" => equals_any(values, operand),
        "$ne" => !equals_any(values, operand),
        "$gt" => ordered(|o| o == Ordering::Greater),
        "$gte" => ordered(|o| o != Ordering::Less),
        "$lt" => ordered(|o| o == Ordering::Less),
        "$lte" => ordered(|o| o != Ordering::Greater),
        "$in" | "$nin" => {
            let Bson::Array(options) = operand else {
                return Err(store_error(BAD_VALUE, format!("{} needs an array", op)));
            };
            let found = options.iter().any(|option| equals_any(values, option));
            if op == "$in" {
                found
            } else {
                !found
            }
        }
        "$exists" => {
            let wanted = match operand {
                Bson::Boolean(b) => *b,
                other => as_f64(other).map(|n| n != 0.0).unwrap_or(true),
            };
            wanted == !values.is_empty()
        }
        "$not" => {
            let Bson::Document(inner) = operand else {
                return Err(store_error(BAD_VALUE, "$not needs a regex or a document"));
            };
            let mut all = true;
            for (inner_op, inner_operand) in inner {
                if !operator_matches(values, inner_op, inner_operand)? {
                    all = false;
                    break;
                }
            }
            !all
        }
        other => {
            return Err(store_error(BAD_VALUE, format!("unknown operator: {}", other)));
        }
    };
    Ok(matched)
}

// ---------------------------------------------------------------------------
// Projections
// ---------------------------------------------------------------------------

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Null | Bson::Undefined => false,
        other => as_f64(other).map(|n| n != 0.0).unwrap_or(true),
    }
}

/// Compiled projection
#[derive(Debug, Clone)]
pub(crate) struct Projector {
    inclusion: bool,
    include_id: bool,
    fields: Vec<String>,
}

impl Projector {
    pub(crate) fn compile(projection: &Document) -> Result<Self> {
        let mut included = Vec::new();
        let mut excluded = Vec::new();
        let mut include_id = true;

        for (field, flag) in projection {
            if field == "_id" {
                include_id = truthy(flag);
            } else if truthy(flag) {
                included.push(field.clone());
            } else {
                excluded.push(field.clone());
            }
        }

        match (included.is_empty(), excluded.is_empty()) {
            (false, false) => Err(store_error(
                PROJECTION_MIX,
                format!(
                    "Cannot do exclusion on field {} in inclusion projection",
                    excluded[0]
                ),
            )),
            (false, true) => Ok(Self {
                inclusion: true,
                include_id,
                fields: included,
            }),
            (true, _) => {
                // `{_id: 1}` alone is an inclusion of `_id` only
                let id_only = projection.contains_key("_id") && include_id;
                Ok(Self {
                    inclusion: id_only,
                    include_id,
                    fields: excluded,
                })
            }
        }
    }

    pub(crate) fn apply(&self, doc: &Document) -> Document {
        if self.inclusion {
            let mut out = Document::new();
            for (key, value) in doc {
                if key == "_id" {
                    if self.include_id {
                        out.insert(key.clone(), value.clone());
                    }
                    continue;
                }
                for field in &self.fields {
                    if field == key {
                        out.insert(key.clone(), value.clone());
                    } else if let Some(rest) =
                        field.strip_prefix(key.as_str()).and_then(|r| r.strip_prefix('.'))
                    {
                        if let Some(nested) = get_path_in(value, rest) {
                            merge_nested(&mut out, key, rest, nested.clone());
                        }
                    }
                }
            }
            out
        } else {
            let mut out = doc.clone();
            if !self.include_id {
                out.remove("_id");
            }
            for field in &self.fields {
                unset_path(&mut out, field);
            }
            out
        }
    }
}

fn get_path_in<'a>(value: &'a Bson, path: &str) -> Option<&'a Bson> {
    match value {
        Bson::Document(inner) => get_path(inner, path),
        _ => None,
    }
}

fn merge_nested(out: &mut Document, key: &str, rest: &str, value: Bson) {
    let entry = out
        .entry(key.to_string())
        .or_insert_with(|| Bson::Document(Document::new()));
    if let Bson::Document(inner) = entry {
        let _ = set_path(inner, rest, value);
    }
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<()> {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
            Ok(())
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Bson::Document(Document::new()));
            match entry {
                Bson::Document(inner) => set_path(inner, rest, value),
                other => Err(store_error(
                    PATH_NOT_VIABLE,
                    format!("Cannot create field '{}' in element {{{}: {}}}", rest, head, other),
                )),
            }
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) -> bool {
    match path.split_once('.') {
        None => doc.remove(path).is_some(),
        Some((head, rest)) => match doc.get_mut(head) {
            Some(Bson::Document(inner)) => unset_path(inner, rest),
            _ => false,
        },
    }
}

/// Result of adding two BSON values
enum Addition {
    Sum(Bson),
    Overflow,
    NotNumeric,
}

fn add_numbers(current: &Bson, amount: &Bson) -> Addition {
    let wide = |sum: Option<i64>| sum.map_or(Addition::Overflow, |n| Addition::Sum(Bson::Int64(n)));
    match (current, amount) {
        (Bson::Int32(a), Bson::Int32(b)) => Addition::Sum(
            a.checked_add(*b)
                .map_or(Bson::Int64(i64::from(*a) + i64::from(*b)), Bson::Int32),
        ),
        (Bson::Int32(a), Bson::Int64(b)) => wide(i64::from(*a).checked_add(*b)),
        (Bson::Int64(a), Bson::Int32(b)) => wide(a.checked_add(i64::from(*b))),
        (Bson::Int64(a), Bson::Int64(b)) => wide(a.checked_add(*b)),
        _ => match (as_f64(current), as_f64(amount)) {
            (Some(a), Some(b)) => Addition::Sum(Bson::Double(a + b)),
            _ => Addition::NotNumeric,
        },
    }
}

/// Apply an update document; returns whether the document changed
pub(crate) fn apply_update(doc: &mut Document, update: &Document) -> Result<bool> {
    let before = doc.clone();

    for (operator, body) in update {
        let Bson::Document(fields) = body else {
            return Err(store_error(
                FAILED_TO_PARSE,
                format!("Modifiers operate on fields but we found type {} instead", type_name(body)),
            ));
        };
        for (path, value) in fields {
            if path == "_id" || path.starts_with("_id.") {
                let unchanged =
                    operator == "$set" && before.get("_id").is_some_and(|id| values_equal(id, value));
                if !unchanged {
                    return Err(store_error(
                        IMMUTABLE_FIELD,
                        "Performing an update on the path '_id' would modify the immutable field '_id'",
                    ));
                }
                continue;
            }
            match operator.as_str() {
                "$set" => set_path(doc, path, value.clone())?,
                "$unset" => {
                    unset_path(doc, path);
                }
                "$inc" => {
                    if !is_numeric(value) {
                        return Err(store_error(
                            TYPE_MISMATCH,
                            format!("Cannot increment with non-numeric argument: {{{}: {}}}", path, value),
                        ));
                    }
                    let next = match get_path(doc, path) {
                        None => value.clone(),
                        Some(current) => match add_numbers(current, value) {
                            Addition::Sum(sum) => sum,
                            Addition::Overflow => {
                                return Err(store_error(
                                    BAD_VALUE,
                                    format!(
                                        "Failed to apply $inc operations to current value ({}) for document {{{}: {}}}: integer overflow",
                                        current, path, value
                                    ),
                                ))
                            }
                            Addition::NotNumeric => {
                                return Err(store_error(
                                    TYPE_MISMATCH,
                                    format!(
                                        "Cannot apply $inc to a value of non-numeric type. The field '{}' is of type {}",
                                        path,
                                        type_name(current)
                                    ),
                                ))
                            }
                        },
                    };
                    set_path(doc, path, next)?;
                }
                other => {
                    return Err(store_error(
                        FAILED_TO_PARSE,
                        format!("Unknown modifier: {}", other),
                    ))
                }
            }
        }
    }

    Ok(*doc != before)
}

fn type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Document(_) => "object",
        Bson::Array(_) => "array",
        Bson::Boolean(_) => "bool",
        Bson::Null => "null",
        Bson::Int32(_) => "int",
        Bson::Int64(_) => "long",
        Bson::ObjectId(_) => "objectId",
        Bson::DateTime(_) => "date",
        _ => "other",
    }
}

// ---------------------------------------------------------------------------
// Sorting
// ---------------------------------------------------------------------------

pub(crate) fn sort_documents(docs: &mut [Document], spec: &Document) {
    let keys: Vec<(String, bool)> = spec
        .iter()
        .map(|(field, direction)| (field.clone(), as_f64(direction).unwrap_or(1.0) < 0.0))
        .collect();

    docs.sort_by(|a, b| {
        for (field, descending) in &keys {
            let left = get_path(a, field).unwrap_or(&Bson::Null);
            let right = get_path(b, field).unwrap_or(&Bson::Null);
            let ord = compare(left, right);
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Evaluate a group key or accumulator operand
fn evaluate(doc: &Document, expression: &Bson) -> Option<Bson> {
    match expression {
        Bson::String(path) if path.starts_with('$') => get_path(doc, &path[1..]).cloned(),
        Bson::Document(fields) => {
            let mut out = Document::new();
            for (key, value) in fields {
                if let Some(v) = evaluate(doc, value) {
                    out.insert(key.clone(), v);
                }
            }
            Some(Bson::Document(out))
        }
        literal => Some(literal.clone()),
    }
}

#[derive(Debug)]
enum Accumulator {
    Sum(Bson),
    Avg { total: f64, count: u64 },
    Min(Option<Bson>),
    Max(Option<Bson>),
    First(Option<Bson>),
    Last(Bson),
    Push(Vec<Bson>),
}

impl Accumulator {
    fn start(operator: &str) -> Result<Self> {
        Ok(match operator {
            "$sum" | "$count" => Accumulator::Sum(Bson::Int32(0)),
            "$avg" => Accumulator::Avg { total: 0.0, count: 0 },
            "$min" => Accumulator::Min(None),
            "$max" => Accumulator::Max(None),
            "$first" => Accumulator::First(None),
            "$last" => Accumulator::Last(Bson::Null),
            "$push" => Accumulator::Push(Vec::new()),
            other => {
                return Err(store_error(
                    UNKNOWN_GROUP_OPERATOR,
                    format!("unknown group operator '{}'", other),
                ))
            }
        })
    }

    fn feed(&mut self, value: Option<Bson>) {
        match self {
            Accumulator::Sum(total) => {
                if let Some(v) = value.filter(is_numeric) {
                    *total = match add_numbers(total, &v) {
                        Addition::Sum(next) => next,
                        // integer overflow continues as a double
                        Addition::Overflow => Bson::Double(
                            as_f64(total).unwrap_or_default() + as_f64(&v).unwrap_or_default(),
                        ),
                        Addition::NotNumeric => return,
                    };
                }
            }
            Accumulator::Avg { total, count } => {
                if let Some(n) = value.as_ref().and_then(as_f64) {
                    *total += n;
                    *count += 1;
                }
            }
            Accumulator::Min(slot) => keep_extreme(slot, value, Ordering::Less),
            Accumulator::Max(slot) => keep_extreme(slot, value, Ordering::Greater),
            Accumulator::First(slot) => {
                if slot.is_none() {
                    *slot = Some(value.unwrap_or(Bson::Null));
                }
            }
            Accumulator::Last(slot) => *slot = value.unwrap_or(Bson::Null),
            Accumulator::Push(items) => items.extend(value),
        }
    }

    fn finish(self) -> Bson {
        match self {
            Accumulator::Sum(total) => total,
            Accumulator::Avg { total, count } => {
                if count == 0 {
                    Bson::Null
                } else {
                    Bson::Double(total / count as f64)
                }
            }
            Accumulator::Min(slot) | Accumulator::Max(slot) | Accumulator::First(slot) => {
                slot.unwrap_or(Bson::Null)
            }
            Accumulator::Last(value) => value,
            Accumulator::Push(items) => Bson::Array(items),
        }
    }
}

/// `$min`/`$max` ignore null and missing inputs
fn keep_extreme(slot: &mut Option<Bson>, value: Option<Bson>, wanted: Ordering) {
    let Some(value) = value.filter(|v| !matches!(v, Bson::Null | Bson::Undefined)) else {
        return;
    };
    let replace = match slot {
        None => true,
        Some(existing) => compare(&value, existing) == wanted,
    };
    if replace {
        *slot = Some(value);
    }
}

fn group(docs: Vec<Document>, spec: &Document) -> Result<Vec<Document>> {
    let key_expr = spec.get("_id").ok_or_else(|| {
        store_error(GROUP_WITHOUT_ID, "a group specification must include an _id")
    })?;

    let mut outputs: Vec<(String, String, Bson)> = Vec::new();
    for (name, body) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
        let operator_doc = match body {
            Bson::Document(d) if d.len() == 1 => d,
            _ => {
                return Err(store_error(
                    40234,
                    format!("The field '{}' must be an accumulator object", name),
                ))
            }
        };
        let (operator, operand) = operator_doc
            .iter()
            .next()
            .ok_or_else(|| store_error(40234, format!("The field '{}' is empty", name)))?;
        Accumulator::start(operator)?;
        let operand = if operator == "$count" {
            Bson::Int32(1)
        } else {
            operand.clone()
        };
        outputs.push((name.clone(), operator.clone(), operand));
    }

    let mut groups: Vec<(Bson, Vec<Accumulator>)> = Vec::new();
    for doc in &docs {
        let key = evaluate(doc, key_expr).unwrap_or(Bson::Null);
        let index = match groups.iter().position(|(k, _)| values_equal(k, &key)) {
            Some(index) => index,
            None => {
                let accumulators = outputs
                    .iter()
                    .map(|(_, operator, _)| Accumulator::start(operator))
                    .collect::<Result<Vec<_>>>()?;
                groups.push((key, accumulators));
                groups.len() - 1
            }
        };
        for (accumulator, (_, _, operand)) in groups[index].1.iter_mut().zip(&outputs) {
            accumulator.feed(evaluate(doc, operand));
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, accumulators)| {
            let mut out = Document::new();
            out.insert("_id", key);
            for (accumulator, (name, _, _)) in accumulators.into_iter().zip(&outputs) {
                out.insert(name.clone(), accumulator.finish());
            }
            out
        })
        .collect())
}

fn lookup(
    docs: Vec<Document>,
    spec: &Document,
    collections: &HashMap<String, Vec<Document>>,
) -> Result<Vec<Document>> {
    let field = |name: &str| -> Result<&str> {
        spec.get_str(name)
            .map_err(|_| store_error(FAILED_TO_PARSE, format!("$lookup requires '{}' as a string", name)))
    };
    let from = field("from")?;
    let local = field("localField")?;
    let foreign = field("foreignField")?;
    let target = field("as")?;

    let empty = Vec::new();
    let foreign_docs = collections.get(from).unwrap_or(&empty);

    Ok(docs
        .into_iter()
        .map(|mut doc| {
            let mut locals = candidates(&doc, local);
            if locals.is_empty() {
                locals.push(Bson::Null);
            }
            let joined: Vec<Bson> = foreign_docs
                .iter()
                .filter(|other| locals.iter().any(|value| equals_any(&candidates(other, foreign), value)))
                .cloned()
                .map(Bson::Document)
                .collect();
            let _ = set_path(&mut doc, target, Bson::Array(joined));
            doc
        })
        .collect())
}

fn count_arg(stage: &str, value: &Bson) -> Result<usize> {
    match value {
        Bson::Int32(n) if *n >= 0 => Ok(*n as usize),
        Bson::Int64(n) if *n >= 0 => Ok(*n as usize),
        Bson::Double(n) if *n >= 0.0 && n.fract() == 0.0 => Ok(*n as usize),
        other => Err(store_error(
            BAD_VALUE,
            format!("invalid argument to {} stage: {}", stage, other),
        )),
    }
}

const STAGES: [&str; 7] = ["$match", "$group", "$sort", "$project", "$lookup", "$limit", "$skip"];

/// Run a pipeline over `docs`; `collections` backs `$lookup`
pub(crate) fn run_pipeline(
    mut docs: Vec<Document>,
    pipeline: &[Document],
    collections: &HashMap<String, Vec<Document>>,
) -> Result<Vec<Document>> {
    for stage in pipeline {
        let mut entries = stage.iter();
        let (name, body) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => {
                return Err(store_error(
                    40323,
                    "A pipeline stage specification object must contain exactly one field.",
                ))
            }
        };
        if !STAGES.contains(&name.as_str()) {
            return Err(store_error(
                UNKNOWN_STAGE,
                format!("Unrecognized pipeline stage name: '{}'", name),
            ));
        }
        let spec = match (name.as_str(), body) {
            ("$limit" | "$skip", _) => None,
            (_, Bson::Document(spec)) => Some(spec),
            _ => {
                return Err(store_error(
                    FAILED_TO_PARSE,
                    format!("the {} stage specification must be an object", name),
                ))
            }
        };
        let spec_doc = || spec.cloned().unwrap_or_default();

        docs = match name.as_str() {
            "$match" => {
                let filter = spec_doc();
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches(&doc, &filter)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$group" => group(docs, &spec_doc())?,
            "$sort" => {
                let spec = spec_doc();
                if spec.is_empty() {
                    return Err(store_error(15976, "$sort stage must have at least one sort key"));
                }
                sort_documents(&mut docs, &spec);
                docs
            }
            "$project" => {
                let projector = Projector::compile(&spec_doc())?;
                docs.iter().map(|doc| projector.apply(doc)).collect()
            }
            "$lookup" => lookup(docs, &spec_doc(), collections)?,
            "$limit" => {
                let n = count_arg("$limit", body)?;
                if n == 0 {
                    return Err(store_error(15958, "the limit must be positive"));
                }
                docs.truncate(n);
                docs
            }
            "$skip" => {
                let n = count_arg("$skip", body)?;
                docs.into_iter().skip(n).collect()
            }
            other => {
                return Err(store_error(
                    UNKNOWN_STAGE,
                    format!("Unrecognized pipeline stage name: '{}'", other),
                ))
            }
        };
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_compare_numbers_across_widths() {
        assert_eq!(compare(&Bson::Int32(3), &Bson::Double(3.0)), Ordering::Equal);
        assert_eq!(compare(&Bson::Int64(2), &Bson::Int32(3)), Ordering::Less);
        assert!(values_equal(&Bson::Int32(1), &Bson::Int64(1)));
        // numbers sort before strings
        assert_eq!(compare(&Bson::Int32(99), &Bson::String("1".into())), Ordering::Less);
    }

    #[test]
    fn test_matches_comparisons() {
        let post = doc! { "id": 3, "title": "Third", "likes": 13, "authorId": 2 };
        assert!(matches(&post, &doc! { "likes": { "$gt": 12 } }).unwrap());
        assert!(!matches(&post, &doc! { "likes": { "$lt": 12 } }).unwrap());
        assert!(matches(&post, &doc! { "id": 3, "title": "Third" }).unwrap());
        assert!(matches(&post, &doc! { "authorId": { "$in": [1, 2] } }).unwrap());
        assert!(matches(&post, &doc! { "authorId": { "$nin": [1] } }).unwrap());
        assert!(matches(&post, &doc! { "missing": { "$exists": false } }).unwrap());
        assert!(matches(&post, &doc! { "missing": Bson::Null }).unwrap());
        // a string never compares greater than a number
        assert!(!matches(&post, &doc! { "title": { "$gt": 1 } }).unwrap());
    }

    #[test]
    fn test_matches_logical_operators() {
        let post = doc! { "id": 4, "likes": 2 };
        assert!(matches(&post, &doc! { "$or": [{ "id": 1 }, { "likes": 2 }] }).unwrap());
        assert!(!matches(&post, &doc! { "$and": [{ "id": 4 }, { "likes": 3 }] }).unwrap());
        assert!(matches(&post, &doc! { "$nor": [{ "id": 1 }] }).unwrap());
        assert!(matches(&post, &doc! { "likes": { "$not": { "$gt": 5 } } }).unwrap());
    }

    #[test]
    fn test_matches_array_elements() {
        let doc = doc! { "tags": ["a", "b"], "items": [{ "n": 1 }, { "n": 5 }] };
        assert!(matches(&doc, &doc! { "tags": "b" }).unwrap());
        assert!(matches(&doc, &doc! { "items.n": { "$gt": 4 } }).unwrap());
        assert!(matches(&doc, &doc! { "tags": ["a", "b"] }).unwrap());
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let err = matches(&doc! { "a": 1 }, &doc! { "a": { "$near": 1 } }).unwrap_err();
        assert!(matches!(err, DocweaveError::StoreRejected { code: Some(BAD_VALUE), .. }));
    }

    #[test]
    fn test_inclusion_projection() {
        let comment = doc! { "_id": 1, "id": 7, "text": "Hi", "likes": 3, "postId": 2 };
        let projector = Projector::compile(&doc! { "text": true, "likes": true }).unwrap();
        assert_eq!(projector.apply(&comment), doc! { "_id": 1, "text": "Hi", "likes": 3 });

        let projector = Projector::compile(&doc! { "text": true, "_id": false }).unwrap();
        assert_eq!(projector.apply(&comment), doc! { "text": "Hi" });
    }

    #[test]
    fn test_exclusion_projection() {
        let doc = doc! { "_id": 1, "a": 1, "b": 2 };
        let projector = Projector::compile(&doc! { "b": 0 }).unwrap();
        assert_eq!(projector.apply(&doc), doc! { "_id": 1, "a": 1 });
    }

    #[test]
    fn test_mixed_projection_rejected() {
        let err = Projector::compile(&doc! { "a": 1, "b": 0 }).unwrap_err();
        assert!(matches!(err, DocweaveError::StoreRejected { code: Some(PROJECTION_MIX), .. }));
    }

    #[test]
    fn test_apply_update_set_unset_inc() {
        let mut doc = doc! { "_id": 1, "text": "Hi", "likes": 3, "old": true };
        let changed = apply_update(
            &mut doc,
            &doc! { "$set": { "text": "Hello" }, "$unset": { "old": "" }, "$inc": { "likes": 2 } },
        )
        .unwrap();
        assert!(changed);
        assert_eq!(doc, doc! { "_id": 1, "text": "Hello", "likes": 5 });

        let unchanged = apply_update(&mut doc, &doc! { "$set": { "text": "Hello" } }).unwrap();
        assert!(!unchanged);
    }

    #[test]
    fn test_apply_update_dotted_set() {
        let mut doc = doc! { "_id": 1 };
        apply_update(&mut doc, &doc! { "$set": { "meta.views": 1 } }).unwrap();
        assert_eq!(doc, doc! { "_id": 1, "meta": { "views": 1 } });
    }

    #[test]
    fn test_apply_update_rejections() {
        let mut doc = doc! { "_id": 1, "text": "Hi" };
        let err = apply_update(&mut doc, &doc! { "$set": { "_id": 2 } }).unwrap_err();
        assert!(matches!(err, DocweaveError::StoreRejected { code: Some(IMMUTABLE_FIELD), .. }));

        let err = apply_update(&mut doc, &doc! { "$inc": { "text": 1 } }).unwrap_err();
        assert!(matches!(err, DocweaveError::StoreRejected { code: Some(TYPE_MISMATCH), .. }));

        let err = apply_update(&mut doc, &doc! { "$rename": { "text": "body" } }).unwrap_err();
        assert!(matches!(err, DocweaveError::StoreRejected { code: Some(FAILED_TO_PARSE), .. }));
    }

    #[test]
    fn test_apply_update_inc_overflow() {
        let mut doc = doc! { "_id": 1, "likes": i64::MAX, "small": i32::MAX };
        let err = apply_update(&mut doc, &doc! { "$inc": { "likes": 1_i64 } }).unwrap_err();
        assert!(matches!(err, DocweaveError::StoreRejected { code: Some(BAD_VALUE), .. }));
        assert_eq!(doc.get_i64("likes").unwrap(), i64::MAX);

        // Int32 overflow widens instead
        apply_update(&mut doc, &doc! { "$inc": { "small": 1 } }).unwrap();
        assert_eq!(doc.get_i64("small").unwrap(), i64::from(i32::MAX) + 1);
    }

    #[test]
    fn test_sort_documents_multi_key() {
        let mut docs = vec![
            doc! { "a": 1, "b": 1 },
            doc! { "a": 2, "b": 0 },
            doc! { "a": 1, "b": 2 },
            doc! { "b": 5 },
        ];
        sort_documents(&mut docs, &doc! { "a": -1, "b": 1 });
        assert_eq!(
            docs,
            vec![
                doc! { "a": 2, "b": 0 },
                doc! { "a": 1, "b": 1 },
                doc! { "a": 1, "b": 2 },
                doc! { "b": 5 },
            ]
        );
    }

    #[test]
    fn test_group_pipeline() {
        let posts = vec![
            doc! { "id": 1, "likes": 10, "authorId": 1 },
            doc! { "id": 2, "likes": 15, "authorId": 2 },
            doc! { "id": 3, "likes": 13, "authorId": 2 },
            doc! { "id": 4, "likes": 20, "authorId": 3 },
        ];
        let pipeline = vec![
            doc! { "$match": { "likes": { "$gt": 12 } } },
            doc! { "$group": { "_id": "$authorId", "total": { "$sum": 1 }, "avg": { "$avg": "$likes" } } },
            doc! { "$sort": { "_id": -1 } },
        ];
        let out = run_pipeline(posts, &pipeline, &HashMap::new()).unwrap();
        assert_eq!(
            out,
            vec![
                doc! { "_id": 3, "total": 1, "avg": 20.0 },
                doc! { "_id": 2, "total": 2, "avg": 14.0 },
            ]
        );
    }

    #[test]
    fn test_group_accumulators() {
        let docs = vec![
            doc! { "k": "a", "v": 3 },
            doc! { "k": "a", "v": 1 },
            doc! { "k": "a" },
        ];
        let pipeline = vec![doc! { "$group": {
            "_id": Bson::Null,
            "min": { "$min": "$v" },
            "max": { "$max": "$v" },
            "first": { "$first": "$v" },
            "last": { "$last": "$v" },
            "all": { "$push": "$v" },
            "n": { "$count": {} },
        } }];
        let out = run_pipeline(docs, &pipeline, &HashMap::new()).unwrap();
        assert_eq!(
            out,
            vec![doc! {
                "_id": Bson::Null,
                "min": 1,
                "max": 3,
                "first": 3,
                "last": Bson::Null,
                "all": [3, 1],
                "n": 3,
            }]
        );
    }

    #[test]
    fn test_group_sum_overflow_becomes_double() {
        let docs = vec![doc! { "likes": i64::MAX }, doc! { "likes": 1 }];
        let pipeline = vec![doc! { "$group": { "_id": Bson::Null, "s": { "$sum": "$likes" } } }];
        let out = run_pipeline(docs, &pipeline, &HashMap::new()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_f64("s").unwrap(), i64::MAX as f64 + 1.0);
    }

    #[test]
    fn test_lookup_left_outer_join() {
        let users = vec![doc! { "id": 1, "username": "alice" }, doc! { "id": 9, "username": "zoe" }];
        let mut collections = HashMap::new();
        collections.insert(
            "posts".to_string(),
            vec![
                doc! { "id": 1, "authorId": 1 },
                doc! { "id": 2, "authorId": 1 },
                doc! { "id": 3, "authorId": 2 },
            ],
        );
        let pipeline = vec![doc! { "$lookup": {
            "from": "posts", "localField": "id", "foreignField": "authorId", "as": "POSTS"
        } }];
        let out = run_pipeline(users, &pipeline, &collections).unwrap();
        assert_eq!(
            out[0].get_array("POSTS").unwrap().len(),
            2
        );
        assert!(out[1].get_array("POSTS").unwrap().is_empty());
    }

    #[test]
    fn test_limit_skip_and_unknown_stage() {
        let docs: Vec<Document> = (1..=5).map(|i| doc! { "i": i }).collect();
        let out = run_pipeline(
            docs.clone(),
            &[doc! { "$skip": 1_i64 }, doc! { "$limit": 2_i64 }],
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(out, vec![doc! { "i": 2 }, doc! { "i": 3 }]);

        let err = run_pipeline(docs.clone(), &[doc! { "$out": "x" }], &HashMap::new()).unwrap_err();
        assert!(matches!(err, DocweaveError::StoreRejected { code: Some(UNKNOWN_STAGE), .. }));

        let err = run_pipeline(docs, &[doc! { "$match": "x" }], &HashMap::new()).unwrap_err();
        assert!(matches!(err, DocweaveError::StoreRejected { code: Some(FAILED_TO_PARSE), .. }));
    }
}
