//! One ingestion batch, end to end.
//!
//! Raw payloads are flattened by the [`RecordNormalizer`] (in parallel), then
//! written through the [`BulkMergeIndexer`] into the buckets chosen by the
//! [`IndexLifecycleManager`]. The same wiring backs thread reconstruction and
//! link resolution so the CLI and the tests share one entry point.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::buckets::{IndexLifecycleManager, civil_now};
use crate::config::Config;
use crate::error::{ExtractionWarning, Result, XgError};
use crate::indexer::{BulkMergeIndexer, BulkReport};
use crate::links::{LinkQueue, LinkResolver, LinkRunReport};
use crate::mapping::MappingSet;
use crate::model::{Provenance, Record};
use crate::normalize::{Normalized, RecordNormalizer};
use crate::sqlite_store::SqliteStore;
use crate::store::DocumentStore;
use crate::thread::ThreadResolver;
use crate::urls::{DefaultUrlNormalizer, UrlNormalizer};

/// A payload the normalizer refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedPayload {
    /// Position in the input batch.
    pub index: usize,
    pub reason: String,
}

/// Outcome of [`Pipeline::ingest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub payloads: usize,
    /// Records produced, embedded originals included.
    pub records: usize,
    pub rejected: Vec<RejectedPayload>,
    pub warnings: Vec<ExtractionWarning>,
    pub bulk: BulkReport,
}

impl IngestReport {
    /// Fold in the report of a later slice of the same input, which started
    /// at `offset`.
    pub fn merge(&mut self, other: Self, offset: usize) {
        self.payloads += other.payloads;
        self.records += other.records;
        self.rejected
            .extend(other.rejected.into_iter().map(|mut rejected| {
                rejected.index += offset;
                rejected
            }));
        self.warnings.extend(other.warnings);
        self.bulk.merge(other.bulk);
    }
}

pub struct Pipeline {
    normalizer: RecordNormalizer,
    buckets: Arc<IndexLifecycleManager>,
    indexer: Arc<BulkMergeIndexer>,
    threads: ThreadResolver,
    links: LinkQueue,
    parallel: bool,
    pool: Option<rayon::ThreadPool>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("buckets", &self.buckets)
            .field("parallel", &self.parallel)
            .field("threads", &self.pool.as_ref().map(rayon::ThreadPool::current_num_threads))
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Wire every component over `store`.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if the configuration is invalid or the mapping
    /// document cannot be loaded.
    pub fn new(store: Arc<dyn DocumentStore>, config: &Config) -> Result<Self> {
        config.validate()?;
        let mappings = match &config.store.mappings {
            Some(path) => MappingSet::from_path(path)?,
            None => MappingSet::load()?,
        };
        let urls: Arc<dyn UrlNormalizer> = Arc::new(DefaultUrlNormalizer);

        let buckets = Arc::new(IndexLifecycleManager::new(
            store,
            Arc::new(mappings),
            &config.bucket_policy(),
        ));
        let indexer = Arc::new(BulkMergeIndexer::new(
            Arc::clone(&buckets),
            config.indexing.batch_size,
        ));
        let links = LinkQueue::new(
            Arc::clone(&indexer),
            Arc::clone(&urls),
            config.links.batch_size,
            config.links.retry_days,
        );

        let pool = if config.indexing.parallel && config.indexing.threads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.indexing.threads)
                .thread_name(|i| format!("xgrab-normalize-{i}"))
                .build()
                .map_err(|e| {
                    XgError::config(format!(
                        "cannot start {} normalizer threads: {e}",
                        config.indexing.threads
                    ))
                })?;
            Some(pool)
        } else {
            None
        };

        Ok(Self {
            normalizer: RecordNormalizer::new(config.locale()?, urls),
            threads: ThreadResolver::new(Arc::clone(&buckets)),
            buckets,
            indexer,
            links,
            parallel: config.indexing.parallel,
            pool,
        })
    }

    /// Open the configured SQLite database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the configuration
    /// is invalid.
    pub fn open(config: &Config) -> Result<Self> {
        let store = SqliteStore::open(config.db_path())?;
        Self::new(Arc::new(store), config)
    }

    /// Pipeline over a fresh in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn in_memory(config: &Config) -> Result<Self> {
        Self::new(Arc::new(SqliteStore::open_memory()?), config)
    }

    #[must_use]
    pub const fn normalizer(&self) -> &RecordNormalizer {
        &self.normalizer
    }

    #[must_use]
    pub fn buckets(&self) -> &IndexLifecycleManager {
        &self.buckets
    }

    #[must_use]
    pub fn indexer(&self) -> &BulkMergeIndexer {
        &self.indexer
    }

    #[must_use]
    pub const fn threads(&self) -> &ThreadResolver {
        &self.threads
    }

    #[must_use]
    pub const fn links(&self) -> &LinkQueue {
        &self.links
    }

    /// Current civil time in the configured offset.
    #[must_use]
    pub fn now(&self) -> NaiveDateTime {
        civil_now(self.normalizer.locale())
    }

    /// Normalize and store one batch of raw payloads.
    ///
    /// Payloads the normalizer rejects are reported, not fatal. Per-item
    /// store failures land in `bulk.errors`.
    ///
    /// # Errors
    ///
    /// Returns an error if bucket preparation or the store fails.
    pub fn ingest(&self, payloads: &[Value], via: Provenance, now: NaiveDateTime) -> Result<IngestReport> {
        let mut report = IngestReport {
            payloads: payloads.len(),
            ..IngestReport::default()
        };

        let mut records: Vec<Record> = Vec::new();
        for (index, result) in self.normalize(payloads, via).into_iter().enumerate() {
            match result {
                Ok(Normalized {
                    records: produced,
                    warnings,
                }) => {
                    records.extend(produced);
                    report.warnings.extend(warnings);
                }
                Err(e) if e.is_recoverable() => {
                    warn!(index, error = %e, "Rejected payload");
                    report.rejected.push(RejectedPayload {
                        index,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        report.records = records.len();
        debug!(
            payloads = report.payloads,
            records = report.records,
            rejected = report.rejected.len(),
            "Normalized batch"
        );

        report.bulk = self.indexer.apply(records, now)?;
        info!(
            via = %via,
            success = report.bulk.success,
            created = report.bulk.created,
            skipped = report.bulk.skipped,
            errors = report.bulk.errors.len(),
            warnings = report.warnings.len(),
            "Ingested batch"
        );
        Ok(report)
    }

    /// One pass of the link-resolution queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or the resolver fails.
    pub fn resolve_links(&self, resolver: &dyn LinkResolver, now: DateTime<Utc>) -> Result<LinkRunReport> {
        self.links.run_once(resolver, now)
    }

    fn normalize(&self, payloads: &[Value], via: Provenance) -> Vec<Result<Normalized>> {
        if !self.parallel {
            return payloads
                .iter()
                .map(|raw| self.normalizer.normalize(raw, via))
                .collect();
        }
        match &self.pool {
            Some(pool) => pool.install(|| self.normalizer.normalize_batch(payloads, via)),
            None => self.normalizer.normalize_batch(payloads, via),
        }
    }
}

/// Split input text into raw payloads.
///
/// Accepts a JSON array, a single object, or concatenated values such as
/// JSON lines.
///
/// # Errors
///
/// Returns [`XgError::InvalidPayload`] with the byte offset of the first
/// value that does not parse.
pub fn read_payloads(content: &str) -> Result<Vec<Value>> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        return match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Array(items)) => Ok(items),
            Ok(other) => Ok(vec![other]),
            Err(e) => Err(XgError::invalid_payload(format!("input is not a JSON array: {e}"))),
        };
    }

    let mut stream = serde_json::Deserializer::from_str(content).into_iter::<Value>();
    let mut payloads = Vec::new();
    loop {
        let offset = stream.byte_offset();
        match stream.next() {
            Some(Ok(value)) => payloads.push(value),
            Some(Err(e)) => {
                return Err(XgError::invalid_payload(format!(
                    "invalid JSON at byte {offset}: {e}"
                )));
            }
            None => break,
        }
    }
    Ok(payloads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn post(id: &str, user: &str, created_at: &str) -> Value {
        json!({
            "id_str": id,
            "created_at": created_at,
            "text": format!("post {id} https://t.co/x"),
            "user": {"id_str": format!("u-{user}"), "screen_name": user},
            "entities": {
                "urls": [{"url": "https://t.co/x", "expanded_url": "https://example.com/a"}],
                "hashtags": [],
                "user_mentions": []
            }
        })
    }

    fn now() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2024-05-15T12:00:00", "%Y-%m-%dT%H:%M:%S").unwrap()
    }

    fn pipeline(config: &Config) -> Pipeline {
        Pipeline::in_memory(config).unwrap()
    }

    #[test]
    fn test_ingest_counts_embedded_records() {
        let p = pipeline(&Config::default());
        let mut repost = post("2", "bob", "Tue May 14 10:00:00 +0000 2024");
        repost["retweeted_status"] = post("1", "alice", "Mon May 13 10:00:00 +0000 2024");

        let report = p.ingest(&[repost], Provenance::Stream, now()).unwrap();
        assert_eq!(report.payloads, 1);
        assert_eq!(report.records, 2);
        assert_eq!(report.bulk.created, 2);
        assert!(report.rejected.is_empty());

        let original = p.indexer().find_record("1").unwrap().unwrap();
        assert_eq!(original.collected_via, vec![Provenance::Retweet]);
        assert_eq!(original.links, vec!["https://example.com/a"]);
        assert!(original.links_to_resolve);
    }

    #[test]
    fn test_ingest_rejects_bad_payloads_and_keeps_going() {
        let p = pipeline(&Config::default());
        let payloads = vec![
            json!({"text": "no id"}),
            post("7", "carol", "Tue May 14 10:00:00 +0000 2024"),
            json!({"id_str": "8", "created_at": "yesterday"}),
        ];
        let report = p.ingest(&payloads, Provenance::Search, now()).unwrap();
        assert_eq!(report.records, 1);
        assert_eq!(
            report.rejected.iter().map(|r| r.index).collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert_eq!(report.bulk.success, 1);
    }

    #[test]
    fn test_reingest_merges_provenance() {
        let p = pipeline(&Config::default());
        let payload = post("3", "dave", "Tue May 14 10:00:00 +0000 2024");
        p.ingest(std::slice::from_ref(&payload), Provenance::Thread, now())
            .unwrap();
        let second = p.ingest(&[payload], Provenance::Search, now()).unwrap();
        assert_eq!(second.bulk.created, 0);

        let stored = p.indexer().find_record("3").unwrap().unwrap();
        assert_eq!(stored.collected_via, vec![Provenance::Thread, Provenance::Search]);
        assert!(stored.match_query);
    }

    #[test]
    fn test_sequential_and_pooled_modes_agree() {
        let payloads: Vec<Value> = (0..20)
            .map(|i| post(&i.to_string(), "erin", "Tue May 14 10:00:00 +0000 2024"))
            .collect();

        let mut sequential = Config::default();
        sequential.indexing.parallel = false;
        let mut pooled = Config::default();
        pooled.indexing.threads = 2;

        let a = pipeline(&sequential)
            .ingest(&payloads, Provenance::Stream, now())
            .unwrap();
        let b = pipeline(&pooled)
            .ingest(&payloads, Provenance::Stream, now())
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.bulk.created, 20);
    }

    #[test]
    fn test_multi_index_routes_by_month() {
        let mut config = Config::default();
        config.collection.multi_index = true;
        config.collection.retention_months = Some(6);
        let p = pipeline(&config);
        p.ingest(
            &[
                post("a", "f", "Mon Apr 01 10:00:00 +0000 2024"),
                post("b", "f", "Tue May 14 10:00:00 +0000 2024"),
                post("old", "f", "Mon Jan 02 10:00:00 +0000 2023"),
            ],
            Provenance::Search,
            now(),
        )
        .unwrap();

        let store = p.buckets().store();
        assert!(store.get("xgrab_tweets_2024_04", "a").unwrap().is_some());
        assert!(store.get("xgrab_tweets_2024_05", "b").unwrap().is_some());
        assert!(p.indexer().find_record("old").unwrap().is_none());
    }

    #[test]
    fn test_report_merge_offsets_rejections() {
        let p = pipeline(&Config::default());
        let first = p
            .ingest(&[json!({"bad": true})], Provenance::Search, now())
            .unwrap();
        let second = p
            .ingest(
                &[
                    post("9", "gus", "Tue May 14 10:00:00 +0000 2024"),
                    json!({"bad": true}),
                ],
                Provenance::Search,
                now(),
            )
            .unwrap();
        let mut total = first;
        total.merge(second, 1);
        assert_eq!(total.payloads, 3);
        assert_eq!(total.records, 1);
        assert_eq!(
            total.rejected.iter().map(|r| r.index).collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert_eq!(total.bulk.created, 1);
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let mut config = Config::default();
        config.collection.timezone = "Mars/Olympus".to_string();
        let err = Pipeline::in_memory(&config).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_read_payloads_formats() {
        let array = read_payloads(r#"[{"id_str": "1"}, {"id_str": "2"}]"#).unwrap();
        assert_eq!(array.len(), 2);

        let lines = read_payloads("{\"id_str\": \"1\"}\n\n{\"id_str\": \"2\"}\n").unwrap();
        assert_eq!(lines.len(), 2);

        let single = read_payloads("{\n  \"id_str\": \"1\"\n}").unwrap();
        assert_eq!(single.len(), 1);

        assert!(read_payloads("").unwrap().is_empty());
        assert!(read_payloads("{\"id_str\": \"1\"}\n{oops").is_err());
        assert!(read_payloads("[1, 2").is_err());
    }
}
