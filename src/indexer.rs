//! Idempotent bulk writes of records and links.

use std::sync::Arc;

use chrono::NaiveDateTime;
use itertools::Itertools;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::buckets::IndexLifecycleManager;
use crate::error::Result;
use crate::merge::MergeParams;
use crate::model::{LOCAL_TIME_FORMAT, Link, Record};
use crate::store::{BulkOp, Filter, ItemOutcome, ItemResult};

/// Default number of operations per bulk request.
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// One item the store rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PerItemError {
    pub collection: String,
    pub id: String,
    pub reason: String,
}

/// Outcome of a bulk run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    /// Items written, created or merged.
    pub success: usize,
    /// Items that did not exist before.
    pub created: usize,
    /// Records dropped before writing (past the retention horizon).
    pub skipped: usize,
    pub errors: Vec<PerItemError>,
}

impl BulkReport {
    fn record(&mut self, results: Vec<ItemResult>) {
        for item in results {
            match item.outcome {
                ItemOutcome::Created => {
                    self.success += 1;
                    self.created += 1;
                }
                ItemOutcome::Updated => self.success += 1,
                ItemOutcome::Failed(reason) => self.errors.push(PerItemError {
                    collection: item.collection,
                    id: item.id,
                    reason,
                }),
            }
        }
    }

    fn reject(&mut self, collection: &str, id: &str, reason: impl std::fmt::Display) {
        self.errors.push(PerItemError {
            collection: collection.to_string(),
            id: id.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: Self) {
        self.success += other.success;
        self.created += other.created;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }
}

/// Resolved links to write back onto one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkPatch {
    pub id: String,
    pub local_time: String,
    pub proper_links: Vec<String>,
    pub domains: Vec<String>,
}

impl LinkPatch {
    fn fields(&self) -> Map<String, Value> {
        let mut patch = Map::new();
        patch.insert("proper_links".to_string(), json!(self.proper_links));
        patch.insert("domains".to_string(), json!(self.domains));
        patch.insert("links_to_resolve".to_string(), Value::Bool(false));
        patch
    }
}

/// Turns records into upsert-with-merge operations against the buckets the
/// lifecycle manager names.
#[derive(Debug)]
pub struct BulkMergeIndexer {
    buckets: Arc<IndexLifecycleManager>,
    batch_size: usize,
}

impl BulkMergeIndexer {
    #[must_use]
    pub fn new(buckets: Arc<IndexLifecycleManager>, batch_size: usize) -> Self {
        Self {
            buckets,
            batch_size: batch_size.max(1),
        }
    }

    #[must_use]
    pub fn buckets(&self) -> &IndexLifecycleManager {
        &self.buckets
    }

    /// Upsert records, `batch_size` at a time.
    ///
    /// Buckets are checked with `ensure_current` before each chunk. Per-item
    /// failures land in the report; only a store-level failure aborts.
    ///
    /// # Errors
    ///
    /// Returns an error if preparing buckets or a bulk call fails outright.
    pub fn apply<I>(&self, records: I, now: NaiveDateTime) -> Result<BulkReport>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut report = BulkReport::default();
        let chunks = records.into_iter().chunks(self.batch_size);
        for chunk in &chunks {
            self.buckets.ensure_current(now)?;
            let mut ops = Vec::with_capacity(self.batch_size);
            for record in chunk {
                if let Some(op) = self.upsert_op(record, now, &mut report)? {
                    ops.push(op);
                }
            }
            if ops.is_empty() {
                continue;
            }
            let sent = ops.len();
            report.record(self.buckets.store().bulk(ops)?);
            debug!(sent, "Bulk chunk applied");
        }

        if !report.errors.is_empty() {
            warn!(
                errors = report.errors.len(),
                "Some records could not be indexed"
            );
        }
        info!(
            success = report.success,
            created = report.created,
            skipped = report.skipped,
            "Indexed records"
        );
        Ok(report)
    }

    fn upsert_op(
        &self,
        record: Record,
        now: NaiveDateTime,
        report: &mut BulkReport,
    ) -> Result<Option<BulkOp>> {
        let base = self.buckets.base_name().to_string();
        let local = match NaiveDateTime::parse_from_str(&record.local_time, LOCAL_TIME_FORMAT) {
            Ok(local) => local,
            Err(e) => {
                report.reject(&base, &record.id, format!("invalid local_time: {e}"));
                return Ok(None);
            }
        };
        if self.buckets.multi_index() && self.buckets.is_too_old(local, now) {
            debug!(id = %record.id, local_time = %record.local_time, "Record past retention, skipping");
            report.skipped += 1;
            return Ok(None);
        }

        let collection = match self.buckets.bucket_for(&record.local_time) {
            Ok(collection) => collection,
            Err(e) => {
                report.reject(&base, &record.id, e);
                return Ok(None);
            }
        };
        let params = match MergeParams::from_record(&record) {
            Ok(params) => params,
            Err(e) => {
                report.reject(&collection, &record.id, e);
                return Ok(None);
            }
        };
        let document = self
            .buckets
            .mappings()
            .records
            .project(record.to_document()?);

        Ok(Some(BulkOp::Upsert {
            collection,
            id: record.id,
            params,
            document,
        }))
    }

    /// Write link documents into the links collection, keyed by URL.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or a bulk call fails.
    pub fn index_links(&self, links: &[Link]) -> Result<BulkReport> {
        let mut report = BulkReport::default();
        let collection = self.buckets.links_collection().to_string();
        let schema = &self.buckets.mappings().links;
        for chunk in links.chunks(self.batch_size) {
            let ops = chunk
                .iter()
                .map(|link| {
                    Ok(BulkOp::Index {
                        collection: collection.clone(),
                        id: link.url.clone(),
                        document: schema.project(serde_json::to_value(link)?),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            report.record(self.buckets.store().bulk(ops)?);
        }
        Ok(report)
    }

    /// Store resolved links on records and clear `links_to_resolve`.
    ///
    /// # Errors
    ///
    /// Returns an error if a bulk call fails.
    pub fn patch_links(&self, patches: &[LinkPatch]) -> Result<BulkReport> {
        let mut report = BulkReport::default();
        for chunk in patches.chunks(self.batch_size) {
            let mut ops = Vec::with_capacity(chunk.len());
            for patch in chunk {
                match self.buckets.bucket_for(&patch.local_time) {
                    Ok(collection) => ops.push(BulkOp::Update {
                        collection,
                        id: patch.id.clone(),
                        patch: patch.fields(),
                    }),
                    Err(e) => report.reject(self.buckets.base_name(), &patch.id, e),
                }
            }
            if !ops.is_empty() {
                report.record(self.buckets.store().bulk(ops)?);
            }
        }
        Ok(report)
    }

    /// Copy resolved links onto every stored repost of `original_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan or a bulk call fails.
    pub fn update_reposts_with_links(
        &self,
        original_id: &str,
        proper_links: &[String],
        domains: &[String],
    ) -> Result<BulkReport> {
        let buckets = self.buckets.record_buckets()?;
        let filter = Filter::term("retweet_id", original_id);
        let mut patches = Vec::new();
        for hit in self.buckets.store().scan(&buckets, &filter)? {
            let hit = hit?;
            let local_time = hit
                .source
                .get("local_time")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            patches.push(LinkPatch {
                id: hit.id,
                local_time,
                proper_links: proper_links.to_vec(),
                domains: domains.to_vec(),
            });
        }
        if patches.is_empty() {
            return Ok(BulkReport::default());
        }
        self.patch_links(&patches)
    }

    /// Mark a record deleted in the first open bucket holding it.
    ///
    /// Returns `false` when no bucket holds the id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn set_deleted(&self, id: &str) -> Result<bool> {
        let store = self.buckets.store();
        for bucket in self.buckets.record_buckets()? {
            if store.get(&bucket, id)?.is_none() {
                continue;
            }
            let mut patch = Map::new();
            patch.insert("deleted".to_string(), Value::Bool(true));
            let results = store.bulk(vec![BulkOp::Update {
                collection: bucket.clone(),
                id: id.to_string(),
                patch,
            }])?;
            if results
                .iter()
                .all(|r| r.outcome == ItemOutcome::Updated)
            {
                info!(id, bucket = %bucket, "Marked record deleted");
                return Ok(true);
            }
        }
        debug!("post {id} was not found while trying to mark it as deleted");
        Ok(false)
    }

    /// Look a record up across all open buckets.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the source does not decode.
    pub fn find_record(&self, id: &str) -> Result<Option<Record>> {
        let store = self.buckets.store();
        for bucket in self.buckets.record_buckets()? {
            if let Some(hit) = store.get(&bucket, id)? {
                return Record::from_source(&hit.id, hit.source).map(Some);
            }
        }
        Ok(None)
    }

    /// Number of stored records whose `field` equals `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn count_records(&self, field: &str, value: Value) -> Result<u64> {
        let buckets = self.buckets.record_buckets()?;
        self.buckets
            .store()
            .count(&buckets, &Filter::term(field, value))
    }
}
