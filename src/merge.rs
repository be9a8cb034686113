//! Merge policy applied when a record id is observed again.
//!
//! The store never decides how two observations combine: an upsert carries
//! [`MergeParams`] and the store calls [`MergeParams::apply`] on the existing
//! document. Everything not named here keeps its first-written value.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, XgError};
use crate::model::{Provenance, Record};

/// How one field combines an existing value with an incoming one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPolicy {
    /// Boolean OR; once true, stays true.
    Or,
    /// Incoming value replaces the existing one.
    LastWrite,
    /// Array that only grows; incoming elements are added if absent.
    AppendUnique,
}

/// Combine one field.
#[must_use]
pub fn merge_field(existing: Option<&Value>, incoming: &Value, policy: FieldPolicy) -> Value {
    match policy {
        FieldPolicy::Or => {
            let before = existing.and_then(Value::as_bool).unwrap_or(false);
            Value::Bool(before || incoming.as_bool().unwrap_or(false))
        }
        FieldPolicy::LastWrite => incoming.clone(),
        FieldPolicy::AppendUnique => {
            let mut items = match existing {
                Some(Value::Array(items)) => items.clone(),
                Some(Value::Null) | None => Vec::new(),
                Some(scalar) => vec![scalar.clone()],
            };
            let additions = match incoming {
                Value::Array(values) => values.clone(),
                Value::Null => Vec::new(),
                scalar => vec![scalar.clone()],
            };
            for value in additions {
                if !items.contains(&value) {
                    items.push(value);
                }
            }
            Value::Array(items)
        }
    }
}

/// Mutable fields of one observation, sent alongside every upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeParams {
    pub collected_via: Provenance,
    pub match_query: bool,
    pub retweet_count: i64,
    pub favorite_count: i64,
    /// `None` when the observation carried no reply count; the stored value
    /// is then left alone.
    pub reply_count: Option<i64>,
}

impl MergeParams {
    /// Take the mutable fields of a freshly normalized record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record has no provenance tag.
    pub fn from_record(record: &Record) -> Result<Self> {
        let collected_via = record.provenance().ok_or_else(|| {
            XgError::invalid_payload(format!("record {} has no provenance tag", record.id))
        })?;
        Ok(Self {
            collected_via,
            match_query: record.match_query,
            retweet_count: record.retweet_count,
            favorite_count: record.favorite_count,
            reply_count: record.reply_count,
        })
    }

    /// Fields touched by this merge, with their policies.
    #[must_use]
    pub fn fields(&self) -> Vec<(&'static str, Value, FieldPolicy)> {
        let mut fields = vec![
            (
                "match_query",
                Value::Bool(self.match_query),
                FieldPolicy::Or,
            ),
            (
                "retweet_count",
                Value::from(self.retweet_count),
                FieldPolicy::LastWrite,
            ),
            (
                "favorite_count",
                Value::from(self.favorite_count),
                FieldPolicy::LastWrite,
            ),
            (
                "collected_via",
                Value::from(self.collected_via.as_str()),
                FieldPolicy::AppendUnique,
            ),
        ];
        if let Some(reply_count) = self.reply_count {
            fields.push((
                "reply_count",
                Value::from(reply_count),
                FieldPolicy::LastWrite,
            ));
        }
        fields
    }

    /// Merge into an existing stored document.
    pub fn apply(&self, document: &mut Map<String, Value>) {
        for (name, incoming, policy) in self.fields() {
            let merged = merge_field(document.get(name), &incoming, policy);
            document.insert(name.to_string(), merged);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(via: Provenance, match_query: bool, reply_count: Option<i64>) -> MergeParams {
        MergeParams {
            collected_via: via,
            match_query,
            retweet_count: 5,
            favorite_count: 7,
            reply_count,
        }
    }

    fn stored() -> Map<String, Value> {
        json!({
            "text": "original text",
            "match_query": true,
            "collected_via": ["search"],
            "retweet_count": 1,
            "favorite_count": 2,
            "reply_count": 9
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn or_never_reverts() {
        assert_eq!(
            merge_field(Some(&json!(true)), &json!(false), FieldPolicy::Or),
            json!(true)
        );
        assert_eq!(merge_field(None, &json!(true), FieldPolicy::Or), json!(true));
        assert_eq!(merge_field(None, &json!(false), FieldPolicy::Or), json!(false));
    }

    #[test]
    fn append_unique_only_grows() {
        let existing = json!(["search", "quote"]);
        assert_eq!(
            merge_field(Some(&existing), &json!("quote"), FieldPolicy::AppendUnique),
            existing
        );
        assert_eq!(
            merge_field(Some(&existing), &json!("thread"), FieldPolicy::AppendUnique),
            json!(["search", "quote", "thread"])
        );
        assert_eq!(
            merge_field(None, &json!("thread"), FieldPolicy::AppendUnique),
            json!(["thread"])
        );
    }

    #[test]
    fn apply_merges_mutable_fields_only() {
        let mut doc = stored();
        params(Provenance::Quote, false, Some(11)).apply(&mut doc);

        assert_eq!(doc["text"], json!("original text"));
        assert_eq!(doc["match_query"], json!(true));
        assert_eq!(doc["collected_via"], json!(["search", "quote"]));
        assert_eq!(doc["retweet_count"], json!(5));
        assert_eq!(doc["favorite_count"], json!(7));
        assert_eq!(doc["reply_count"], json!(11));
    }

    #[test]
    fn absent_reply_count_does_not_clobber() {
        let mut doc = stored();
        params(Provenance::Stream, true, None).apply(&mut doc);
        assert_eq!(doc["reply_count"], json!(9));
    }

    #[test]
    fn apply_twice_is_idempotent() {
        let p = params(Provenance::Thread, false, Some(3));
        let mut once = stored();
        p.apply(&mut once);
        let mut twice = once.clone();
        p.apply(&mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn from_record_requires_provenance() {
        let record = Record {
            id: "1".to_string(),
            ..Record::default()
        };
        assert!(MergeParams::from_record(&record).is_err());

        let record = Record {
            id: "1".to_string(),
            collected_via: vec![Provenance::Stream],
            match_query: true,
            retweet_count: 4,
            ..Record::default()
        };
        let p = MergeParams::from_record(&record).unwrap();
        assert_eq!(p.collected_via, Provenance::Stream);
        assert_eq!(p.retweet_count, 4);
        assert_eq!(p.reply_count, None);
    }
}
