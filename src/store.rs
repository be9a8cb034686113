//! Document store contract.
//!
//! Everything above this module talks to collections through
//! [`DocumentStore`]; [`crate::sqlite_store::SqliteStore`] is the embedded
//! implementation.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::mapping::CollectionSchema;
use crate::merge::MergeParams;

/// Document predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    MatchAll,
    /// Field equals value; on an array field, any element equals value.
    Term { field: String, value: Value },
    /// Field equals any of the values.
    Terms { field: String, values: TermSet },
    Ids(HashSet<String>),
    /// Numeric range, both bounds inclusive.
    Range {
        field: String,
        gte: Option<i64>,
        lte: Option<i64>,
    },
    Or(Vec<Filter>),
    And(Vec<Filter>),
}

impl Filter {
    pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn terms<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::Terms {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn ids<S: Into<String>>(ids: impl IntoIterator<Item = S>) -> Self {
        Self::Ids(ids.into_iter().map(Into::into).collect())
    }

    pub fn gte(field: impl Into<String>, bound: i64) -> Self {
        Self::Range {
            field: field.into(),
            gte: Some(bound),
            lte: None,
        }
    }

    /// Evaluate against a stored document.
    #[must_use]
    pub fn matches(&self, id: &str, source: &Value) -> bool {
        match self {
            Self::MatchAll => true,
            Self::Term { field, value } => field_matches(source.get(field), |v| v == value),
            Self::Terms { field, values } => {
                field_matches(source.get(field), |v| values.contains(v))
            }
            Self::Ids(ids) => ids.contains(id),
            Self::Range { field, gte, lte } => source
                .get(field)
                .and_then(Value::as_i64)
                .is_some_and(|n| gte.is_none_or(|lo| n >= lo) && lte.is_none_or(|hi| n <= hi)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(id, source)),
            Self::And(filters) => filters.iter().all(|f| f.matches(id, source)),
        }
    }
}

/// Values of a terms filter. String values are hashed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TermSet {
    strings: HashSet<String>,
    others: Vec<Value>,
}

impl TermSet {
    #[must_use]
    pub fn contains(&self, value: &Value) -> bool {
        match value {
            Value::String(s) => self.strings.contains(s),
            other => self.others.contains(other),
        }
    }

    /// String values, when there are no others.
    #[must_use]
    pub fn only_strings(&self) -> Option<&HashSet<String>> {
        self.others.is_empty().then_some(&self.strings)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len() + self.others.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Into<Value>> FromIterator<V> for TermSet {
    fn from_iter<T: IntoIterator<Item = V>>(iter: T) -> Self {
        let mut set = Self::default();
        for value in iter {
            match value.into() {
                Value::String(s) => {
                    set.strings.insert(s);
                }
                other => {
                    if !set.others.contains(&other) {
                        set.others.push(other);
                    }
                }
            }
        }
        set
    }
}

fn field_matches(field: Option<&Value>, pred: impl Fn(&Value) -> bool) -> bool {
    match field {
        Some(Value::Array(items)) => items.iter().any(&pred),
        Some(value) => pred(value),
        None => false,
    }
}

/// One write in a bulk request.
#[derive(Debug, Clone)]
pub enum BulkOp {
    /// Insert `document` if `id` is absent, else merge `params` into the
    /// stored document.
    Upsert {
        collection: String,
        id: String,
        params: MergeParams,
        document: Value,
    },
    /// Full-document write.
    Index {
        collection: String,
        id: String,
        document: Value,
    },
    /// Partial update; fails when the document is absent.
    Update {
        collection: String,
        id: String,
        patch: Map<String, Value>,
    },
}

impl BulkOp {
    #[must_use]
    pub fn collection(&self) -> &str {
        match self {
            Self::Upsert { collection, .. }
            | Self::Index { collection, .. }
            | Self::Update { collection, .. } => collection,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Upsert { id, .. } | Self::Index { id, .. } | Self::Update { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Created,
    Updated,
    Failed(String),
}

/// Result of one bulk item, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemResult {
    pub collection: String,
    pub id: String,
    pub outcome: ItemOutcome,
}

/// A matching document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hit {
    pub collection: String,
    pub id: String,
    pub source: Value,
}

/// Collection listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketStatus {
    pub name: String,
    pub docs: u64,
    pub open: bool,
}

pub type HitIter<'a> = Box<dyn Iterator<Item = Result<Hit>> + 'a>;

/// Collection-oriented document store.
///
/// Closed collections are invisible to reads and reject writes per item.
/// Reads over collections that do not exist return nothing.
pub trait DocumentStore: Send + Sync {
    fn exists(&self, name: &str) -> Result<bool>;

    /// Create-if-absent. Returns `true` if the collection was created.
    fn create(&self, name: &str, schema: &CollectionSchema) -> Result<bool>;

    fn close(&self, name: &str) -> Result<()>;

    fn delete(&self, name: &str) -> Result<()>;

    /// Collections whose name starts with `prefix`, sorted by name.
    fn list(&self, prefix: &str) -> Result<Vec<BucketStatus>>;

    /// Apply writes; per-item failures are reported, not raised.
    fn bulk(&self, ops: Vec<BulkOp>) -> Result<Vec<ItemResult>>;

    /// At most `size` hits. An empty `fields` returns whole sources.
    fn search(
        &self,
        collections: &[String],
        filter: &Filter,
        fields: &[&str],
        size: usize,
    ) -> Result<Vec<Hit>>;

    /// Every hit, fetched lazily page by page.
    fn scan<'a>(&'a self, collections: &[String], filter: &Filter) -> Result<HitIter<'a>>;

    fn get(&self, collection: &str, id: &str) -> Result<Option<Hit>>;

    fn multi_get(&self, collection: &str, ids: &[String]) -> Result<Vec<Hit>>;

    fn count(&self, collections: &[String], filter: &Filter) -> Result<u64>;
}

/// Keep only `fields` of a source. Empty `fields` keeps everything.
#[must_use]
pub fn project(source: Value, fields: &[&str]) -> Value {
    if fields.is_empty() {
        return source;
    }
    match source {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| fields.contains(&key.as_str()))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "id": "7",
            "in_reply_to_id": "3",
            "collected_via": ["search", "thread"],
            "timestamp_utc": 1_000,
            "links_to_resolve": true
        })
    }

    #[test]
    fn test_term_matches_scalar_and_array() {
        assert!(Filter::term("in_reply_to_id", "3").matches("7", &doc()));
        assert!(Filter::term("collected_via", "thread").matches("7", &doc()));
        assert!(!Filter::term("collected_via", "quote").matches("7", &doc()));
        assert!(!Filter::term("missing", "x").matches("7", &doc()));
        assert!(Filter::term("links_to_resolve", true).matches("7", &doc()));
    }

    #[test]
    fn test_ids_and_boolean_combinators() {
        let thread = Filter::Or(vec![
            Filter::ids(["1", "2"]),
            Filter::terms("in_reply_to_id", ["1", "3"]),
        ]);
        assert!(thread.matches("7", &doc()));
        assert!(thread.matches("2", &json!({})));
        assert!(!thread.matches("9", &json!({"in_reply_to_id": "8"})));

        let both = Filter::And(vec![Filter::ids(["7"]), Filter::gte("timestamp_utc", 1_001)]);
        assert!(!both.matches("7", &doc()));
    }

    #[test]
    fn test_term_set_mixes_strings_and_scalars() {
        let set: TermSet = [json!("1"), json!(2), json!("1"), json!(true)].into_iter().collect();
        assert_eq!(set.len(), 3);
        assert!(set.contains(&json!("1")));
        assert!(set.contains(&json!(2)));
        assert!(!set.contains(&json!("2")));
        assert!(set.only_strings().is_none());

        let strings: TermSet = ["a", "b"].into_iter().collect();
        assert_eq!(strings.only_strings().map(HashSet::len), Some(2));
    }

    #[test]
    fn test_range_bounds_inclusive() {
        let range = Filter::Range {
            field: "timestamp_utc".to_string(),
            gte: Some(1_000),
            lte: Some(1_000),
        };
        assert!(range.matches("7", &doc()));
        assert!(!Filter::gte("timestamp_utc", 1_001).matches("7", &doc()));
        assert!(!Filter::gte("text", 0).matches("7", &json!({"text": "x"})));
    }

    #[test]
    fn test_project_keeps_requested_fields() {
        let projected = project(doc(), &["links_to_resolve", "id"]);
        assert_eq!(projected, json!({"id": "7", "links_to_resolve": true}));
        assert_eq!(project(doc(), &[]), doc());
    }
}
