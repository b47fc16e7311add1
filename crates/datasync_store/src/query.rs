//! Query model: filters, patches and sort orders.
//!
//! The model is a deliberately small subset of what document databases
//! offer: top-level field comparisons combined with `and`/`or`, and
//! patches made of `set`/`unset`/`inc`/`add_to_set`/`set_on_insert`, plus a
//! whole-document `replace`.
//! Nested field paths are not supported.

use serde_json::{Map, Value};
use std::cmp::Ordering;

/// A stored document: a JSON object.
pub type Document = Map<String, Value>;

/// Name of the primary key field of every document.
pub const ID_FIELD: &str = "_id";

/// Converts a JSON value into a [`Document`].
///
/// Non-object values produce an empty document.
pub fn document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

/// Orders two JSON values of the same kind.
///
/// Numbers compare numerically, strings lexicographically and booleans
/// `false < true`. Values of different kinds are unordered.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                Some(x.cmp(&y))
            } else {
                x.as_f64()?.partial_cmp(&y.as_f64()?)
            }
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// A predicate over documents.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document.
    All,
    /// Field equals value. A missing field equals `null`.
    Eq(String, Value),
    /// Field does not equal value. A missing field equals `null`.
    Ne(String, Value),
    /// Field is strictly less than value.
    Lt(String, Value),
    /// Field is less than or equal to value.
    Lte(String, Value),
    /// Field is strictly greater than value.
    Gt(String, Value),
    /// Field is greater than or equal to value.
    Gte(String, Value),
    /// Field equals one of the values.
    In(String, Vec<Value>),
    /// Field presence (`true`) or absence (`false`).
    Exists(String, bool),
    /// All sub-filters match.
    And(Vec<Filter>),
    /// At least one sub-filter matches.
    Or(Vec<Filter>),
}

impl Filter {
    /// Field equals value.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    /// Field does not equal value.
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ne(field.into(), value.into())
    }

    /// Field is strictly less than value.
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt(field.into(), value.into())
    }

    /// Field is less than or equal to value.
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lte(field.into(), value.into())
    }

    /// Field is strictly greater than value.
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt(field.into(), value.into())
    }

    /// Field is greater than or equal to value.
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gte(field.into(), value.into())
    }

    /// Field equals one of the values.
    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In(field.into(), values)
    }

    /// Field is present (`true`) or absent (`false`).
    pub fn exists(field: impl Into<String>, present: bool) -> Self {
        Filter::Exists(field.into(), present)
    }

    /// Matches the document with the given `_id`.
    pub fn id(id: impl Into<String>) -> Self {
        Filter::Eq(ID_FIELD.to_string(), Value::String(id.into()))
    }

    /// Combines this filter with another one; both must match.
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut left), Filter::And(right)) => {
                left.extend(right);
                Filter::And(left)
            }
            (Filter::And(mut left), f) => {
                left.push(f);
                Filter::And(left)
            }
            (f, Filter::And(mut right)) => {
                right.insert(0, f);
                Filter::And(right)
            }
            (a, b) => Filter::And(vec![a, b]),
        }
    }

    /// Combines this filter with another one; either may match.
    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut left) => {
                left.push(other);
                Filter::Or(left)
            }
            f => Filter::Or(vec![f, other]),
        }
    }

    /// Evaluates the filter against a document.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, value) => field_value(doc, field) == *value,
            Filter::Ne(field, value) => field_value(doc, field) != *value,
            Filter::Lt(field, value) => compare_field(doc, field, value, |o| o.is_lt()),
            Filter::Lte(field, value) => compare_field(doc, field, value, |o| o.is_le()),
            Filter::Gt(field, value) => compare_field(doc, field, value, |o| o.is_gt()),
            Filter::Gte(field, value) => compare_field(doc, field, value, |o| o.is_ge()),
            Filter::In(field, values) => {
                let actual = field_value(doc, field);
                values.iter().any(|v| *v == actual)
            }
            Filter::Exists(field, present) => doc.contains_key(field) == *present,
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(doc)),
        }
    }

    /// Returns the equality constraints that hold for every match.
    ///
    /// Used to seed a document created by an upsert.
    pub fn equality_fields(&self) -> Document {
        let mut fields = Document::new();
        self.collect_equality_fields(&mut fields);
        fields
    }

    fn collect_equality_fields(&self, fields: &mut Document) {
        match self {
            Filter::Eq(field, value) => {
                fields.insert(field.clone(), value.clone());
            }
            Filter::And(filters) => {
                for f in filters {
                    f.collect_equality_fields(fields);
                }
            }
            _ => {}
        }
    }
}

fn field_value(doc: &Document, field: &str) -> Value {
    doc.get(field).cloned().unwrap_or(Value::Null)
}

fn compare_field(
    doc: &Document,
    field: &str,
    value: &Value,
    accept: impl Fn(Ordering) -> bool,
) -> bool {
    doc.get(field)
        .and_then(|actual| compare_values(actual, value))
        .map(accept)
        .unwrap_or(false)
}

/// A set of modifications applied to a matched document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    replace: bool,
    set: Document,
    unset: Vec<String>,
    inc: Vec<(String, i64)>,
    add_to_set: Vec<(String, Value)>,
    set_on_insert: Document,
}

impl Patch {
    /// Creates an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(field.into(), value.into());
        self
    }

    /// Replaces the whole document with `fields`, keeping its `_id`.
    ///
    /// Further operations chained onto the patch apply after the
    /// replacement.
    pub fn replace(fields: Document) -> Self {
        let mut patch = Self::new().set_all(fields);
        patch.set.remove(ID_FIELD);
        patch.replace = true;
        patch
    }

    /// Sets every field of the given document.
    pub fn set_all(mut self, fields: Document) -> Self {
        self.set.extend(fields);
        self
    }

    /// Removes a field.
    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.unset.push(field.into());
        self
    }

    /// Increments a numeric field (missing counts as zero).
    pub fn inc(mut self, field: impl Into<String>, by: i64) -> Self {
        self.inc.push((field.into(), by));
        self
    }

    /// Adds a value to an array field unless already present.
    pub fn add_to_set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.add_to_set.push((field.into(), value.into()));
        self
    }

    /// Sets a field only when the patch creates the document (upsert).
    pub fn set_on_insert(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_on_insert.insert(field.into(), value.into());
        self
    }

    /// Returns true if the patch modifies nothing.
    pub fn is_empty(&self) -> bool {
        !self.replace
            && self.set.is_empty()
            && self.unset.is_empty()
            && self.inc.is_empty()
            && self.add_to_set.is_empty()
            && self.set_on_insert.is_empty()
    }

    /// Applies the patch to a document.
    ///
    /// `inserting` is true when the document is being created by an upsert.
    pub fn apply(&self, doc: &mut Document, inserting: bool) {
        if self.replace {
            let id = doc.remove(ID_FIELD);
            doc.clear();
            if let Some(id) = id {
                doc.insert(ID_FIELD.to_string(), id);
            }
        }
        if inserting {
            for (k, v) in &self.set_on_insert {
                doc.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in &self.set {
            doc.insert(k.clone(), v.clone());
        }
        for k in &self.unset {
            doc.remove(k);
        }
        for (k, by) in &self.inc {
            let current = doc.get(k).and_then(Value::as_i64).unwrap_or(0);
            doc.insert(k.clone(), Value::from(current.saturating_add(*by)));
        }
        for (k, v) in &self.add_to_set {
            let entry = doc.entry(k.clone()).or_insert_with(|| Value::Array(Vec::new()));
            match entry {
                Value::Array(items) => {
                    if !items.contains(v) {
                        items.push(v.clone());
                    }
                }
                other => *other = Value::Array(vec![v.clone()]),
            }
        }
    }
}

/// Direction of a sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// A multi-key sort order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sort {
    keys: Vec<(String, SortDirection)>,
}

impl Sort {
    /// Sorts ascending by a field.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            keys: vec![(field.into(), SortDirection::Ascending)],
        }
    }

    /// Sorts descending by a field.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            keys: vec![(field.into(), SortDirection::Descending)],
        }
    }

    /// Adds an ascending tie-breaker.
    pub fn then_asc(mut self, field: impl Into<String>) -> Self {
        self.keys.push((field.into(), SortDirection::Ascending));
        self
    }

    /// Adds a descending tie-breaker.
    pub fn then_desc(mut self, field: impl Into<String>) -> Self {
        self.keys.push((field.into(), SortDirection::Descending));
        self
    }

    /// Compares two documents under this order.
    ///
    /// Missing or incomparable fields sort last.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for (field, direction) in &self.keys {
            let ordering = match (a.get(field), b.get(field)) {
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ordering = match direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}
