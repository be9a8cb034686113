//! Conversation reconstruction over the reply relation.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::buckets::IndexLifecycleManager;
use crate::error::Result;
use crate::model::Record;
use crate::store::Filter;

/// Expands seed ids to every record reachable through reply edges, in
/// either direction, across all open buckets.
#[derive(Debug)]
pub struct ThreadResolver {
    buckets: Arc<IndexLifecycleManager>,
}

impl ThreadResolver {
    #[must_use]
    pub const fn new(buckets: Arc<IndexLifecycleManager>) -> Self {
        Self { buckets }
    }

    /// Transitive closure of the seeds under the reply relation.
    ///
    /// Each round asks every open bucket for records whose id is in the
    /// frontier or whose reply target is in the frontier. Ids not seen before
    /// form the next frontier; the loop stops on an empty frontier. Bucket
    /// enumeration is repeated each round.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn resolve_thread_ids<I, S>(&self, seeds: I) -> Result<HashSet<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all: HashSet<String> = seeds.into_iter().map(Into::into).collect();
        let mut frontier: Vec<String> = all.iter().cloned().collect();
        let mut round = 0usize;

        while !frontier.is_empty() {
            round += 1;
            let buckets = self.buckets.record_buckets()?;
            let filter = Filter::Or(vec![
                Filter::ids(frontier.iter().cloned()),
                Filter::terms("in_reply_to_id", frontier.iter().cloned()),
            ]);

            let mut next = Vec::new();
            for hit in self.buckets.store().scan(&buckets, &filter)? {
                let hit = hit?;
                if all.insert(hit.id.clone()) {
                    next.push(hit.id.clone());
                }
                if let Some(target) = hit
                    .source
                    .get("in_reply_to_id")
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                {
                    if all.insert(target.to_string()) {
                        next.push(target.to_string());
                    }
                }
            }
            debug!(round, discovered = next.len(), total = all.len(), "Thread round");
            frontier = next;
        }
        Ok(all)
    }

    /// Stored records of the thread, oldest first.
    ///
    /// Ids in the closure that are not stored (reply targets never
    /// collected) are left out.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or a source does not decode.
    pub fn resolve_thread<I, S>(&self, seeds: I) -> Result<Vec<Record>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = self.resolve_thread_ids(seeds)?.into_iter().collect();
        let buckets = self.buckets.record_buckets()?;
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for hit in self.buckets.store().scan(&buckets, &Filter::ids(ids))? {
            let hit = hit?;
            if seen.insert(hit.id.clone()) {
                records.push(Record::from_source(&hit.id, hit.source)?);
            }
        }
        records.sort_by(|a, b| {
            a.timestamp_utc
                .cmp(&b.timestamp_utc)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(records)
    }
}
