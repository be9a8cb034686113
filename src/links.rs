//! Link-resolution queue.
//!
//! Records created with links are flagged `links_to_resolve`. A resolution
//! pass picks a batch of them, reuses links already in the links collection,
//! hands the rest to a [`LinkResolver`], and writes `proper_links` and
//! `domains` back onto the records and their reposts. Fetching URLs is the
//! resolver's business.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Result, XgError};
use crate::indexer::{BulkMergeIndexer, BulkReport, LinkPatch};
use crate::model::{Link, LinkResolution};
use crate::store::Filter;
use crate::urls::{UrlNormalizer, domain_of};

/// Resolves URLs to their final destination.
pub trait LinkResolver {
    /// Resolve a batch. URLs missing from the answer are taken as final.
    ///
    /// # Errors
    ///
    /// Implementations return an error when the batch cannot be resolved.
    fn resolve(&self, urls: &[String]) -> Result<Vec<LinkResolution>>;
}

/// Resolutions known ahead of time, e.g. produced by an external crawler.
///
/// The file form is a JSON object mapping each original URL to its final
/// destination.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    answers: HashMap<String, String>,
}

impl StaticResolver {
    #[must_use]
    pub const fn new(answers: HashMap<String, String>) -> Self {
        Self { answers }
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a JSON object of
    /// strings.
    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| XgError::path_error("read resolutions", path, e))?;
        let answers: HashMap<String, String> = serde_json::from_str(&content)?;
        Ok(Self::new(answers))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.answers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }
}

impl LinkResolver for StaticResolver {
    fn resolve(&self, urls: &[String]) -> Result<Vec<LinkResolution>> {
        Ok(urls
            .iter()
            .filter_map(|url| {
                self.answers.get(url).map(|resolved| LinkResolution {
                    original: url.clone(),
                    resolved: resolved.clone(),
                })
            })
            .collect())
    }
}

/// A record waiting for its links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingRecord {
    pub id: String,
    pub links: Vec<String>,
    pub retweet_id: Option<String>,
    pub local_time: String,
}

/// Outcome of one resolution pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkRunReport {
    pub records: usize,
    pub known_links: usize,
    pub new_links: usize,
    pub writes: BulkReport,
}

pub struct LinkQueue {
    indexer: Arc<BulkMergeIndexer>,
    urls: Arc<dyn UrlNormalizer>,
    batch_size: usize,
    retry_days: u32,
}

impl std::fmt::Debug for LinkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkQueue")
            .field("batch_size", &self.batch_size)
            .field("retry_days", &self.retry_days)
            .finish_non_exhaustive()
    }
}

impl LinkQueue {
    /// `retry_days == 0` disables the age limit on pending records.
    #[must_use]
    pub fn new(
        indexer: Arc<BulkMergeIndexer>,
        urls: Arc<dyn UrlNormalizer>,
        batch_size: usize,
        retry_days: u32,
    ) -> Self {
        Self {
            indexer,
            urls,
            batch_size: batch_size.max(1),
            retry_days,
        }
    }

    /// Up to `batch_size` records still flagged `links_to_resolve`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn pending(&self, now: DateTime<Utc>) -> Result<Vec<PendingRecord>> {
        let mut filters = vec![Filter::term("links_to_resolve", true)];
        if self.retry_days > 0 {
            let since = now - Duration::days(i64::from(self.retry_days));
            filters.push(Filter::gte("timestamp_utc", since.timestamp()));
        }
        let buckets = self.indexer.buckets().record_buckets()?;
        let hits = self.indexer.buckets().store().search(
            &buckets,
            &Filter::And(filters),
            &["links", "retweet_id", "local_time"],
            self.batch_size,
        )?;

        Ok(hits
            .into_iter()
            .map(|hit| {
                let source = &hit.source;
                PendingRecord {
                    links: source
                        .get("links")
                        .and_then(Value::as_array)
                        .map(|links| {
                            links
                                .iter()
                                .filter_map(Value::as_str)
                                .map(String::from)
                                .collect()
                        })
                        .unwrap_or_default(),
                    retweet_id: source
                        .get("retweet_id")
                        .and_then(Value::as_str)
                        .map(String::from),
                    local_time: source
                        .get("local_time")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    id: hit.id,
                }
            })
            .collect())
    }

    /// Links already stored, keyed by URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn known_links(&self, urls: &[String]) -> Result<HashMap<String, Link>> {
        let buckets = self.indexer.buckets();
        let hits = buckets
            .store()
            .multi_get(buckets.links_collection(), urls)?;
        let mut known = HashMap::with_capacity(hits.len());
        for hit in hits {
            let link: Link = serde_json::from_value(hit.source)?;
            known.insert(hit.id, link);
        }
        Ok(known)
    }

    /// One resolution pass over the pending batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the resolver or the store fails.
    pub fn run_once(&self, resolver: &dyn LinkResolver, now: DateTime<Utc>) -> Result<LinkRunReport> {
        let pending = self.pending(now)?;
        let mut report = LinkRunReport {
            records: pending.len(),
            ..LinkRunReport::default()
        };
        if pending.is_empty() {
            debug!("No records waiting for link resolution");
            return Ok(report);
        }

        let urls: Vec<String> = pending
            .iter()
            .flat_map(|p| p.links.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut known = self.known_links(&urls)?;
        report.known_links = known.len();

        let unknown: Vec<String> = urls
            .iter()
            .filter(|u| !known.contains_key(*u))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            let answers: HashMap<String, String> = resolver
                .resolve(&unknown)?
                .into_iter()
                .map(|r| (r.original, r.resolved))
                .collect();
            let new_links: Vec<Link> = unknown
                .into_iter()
                .map(|url| {
                    let resolved = answers
                        .get(&url)
                        .map_or_else(|| url.clone(), |r| self.urls.normalize(r));
                    Link {
                        domain: domain_of(&resolved),
                        resolved: Some(resolved),
                        url,
                    }
                })
                .collect();
            report.new_links = new_links.len();
            report.writes.merge(self.indexer.index_links(&new_links)?);
            for link in new_links {
                known.insert(link.url.clone(), link);
            }
        }

        let mut patches = Vec::with_capacity(pending.len());
        for record in &pending {
            let proper_links: Vec<String> = record
                .links
                .iter()
                .map(|url| {
                    known
                        .get(url)
                        .and_then(|link| link.resolved.clone())
                        .unwrap_or_else(|| url.clone())
                })
                .collect();
            let mut domains: Vec<String> = Vec::new();
            for domain in proper_links.iter().filter_map(|u| domain_of(u)) {
                if !domains.contains(&domain) {
                    domains.push(domain);
                }
            }
            patches.push(LinkPatch {
                id: record.id.clone(),
                local_time: record.local_time.clone(),
                proper_links,
                domains,
            });
        }

        report.writes.merge(self.indexer.patch_links(&patches)?);
        for (record, patch) in pending.iter().zip(&patches) {
            if record.retweet_id.is_none() {
                report.writes.merge(self.indexer.update_reposts_with_links(
                    &record.id,
                    &patch.proper_links,
                    &patch.domains,
                )?);
            }
        }

        info!(
            records = report.records,
            known = report.known_links,
            new = report.new_links,
            "Resolved links"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buckets::{BucketPolicy, IndexLifecycleManager};
    use crate::mapping::MappingSet;
    use crate::model::{Provenance, Record};
    use crate::sqlite_store::SqliteStore;
    use crate::store::DocumentStore;
    use crate::urls::DefaultUrlNormalizer;
    use chrono::{NaiveDateTime, TimeZone};
    use parking_lot::Mutex;

    struct FakeResolver {
        answers: Vec<(&'static str, &'static str)>,
        asked: Mutex<Vec<String>>,
    }

    impl LinkResolver for FakeResolver {
        fn resolve(&self, urls: &[String]) -> Result<Vec<LinkResolution>> {
            self.asked.lock().extend(urls.iter().cloned());
            Ok(self
                .answers
                .iter()
                .filter(|(from, _)| urls.iter().any(|u| u == from))
                .map(|(from, to)| LinkResolution {
                    original: (*from).to_string(),
                    resolved: (*to).to_string(),
                })
                .collect())
        }
    }

    fn queue(retry_days: u32) -> LinkQueue {
        let store: Arc<dyn DocumentStore> = Arc::new(SqliteStore::open_memory().unwrap());
        let buckets = Arc::new(IndexLifecycleManager::new(
            store,
            Arc::new(MappingSet::load().unwrap()),
            &BucketPolicy {
                db_name: "links".to_string(),
                multi_index: true,
                retention_months: Some(24),
                links_collection: None,
            },
        ));
        LinkQueue::new(
            Arc::new(BulkMergeIndexer::new(buckets, 50)),
            Arc::new(DefaultUrlNormalizer),
            10,
            retry_days,
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, 12, 0, 0).unwrap()
    }

    fn record(id: &str, links: &[&str], ts: DateTime<Utc>) -> Record {
        Record {
            id: id.to_string(),
            timestamp_utc: ts.timestamp(),
            local_time: ts.format("%Y-%m-%dT%H:%M:%S").to_string(),
            links: links.iter().map(|l| (*l).to_string()).collect(),
            links_to_resolve: !links.is_empty(),
            collected_via: vec![Provenance::Search],
            match_query: true,
            ..Record::default()
        }
    }

    fn ingest(q: &LinkQueue, records: Vec<Record>) {
        q.indexer.apply(records, now().naive_utc()).unwrap();
    }

    #[test]
    fn test_pending_respects_retry_window() {
        let q = queue(30);
        ingest(
            &q,
            vec![
                record("fresh", &["https://a.example"], now() - Duration::days(2)),
                record("stale", &["https://b.example"], now() - Duration::days(90)),
                record("nolinks", &[], now()),
            ],
        );
        let pending = q.pending(now()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "fresh");
        assert_eq!(pending[0].links, vec!["https://a.example"]);

        assert_eq!(queue_all(&q).len(), 2);
    }

    fn queue_all(q: &LinkQueue) -> Vec<PendingRecord> {
        let unbounded = LinkQueue::new(Arc::clone(&q.indexer), Arc::clone(&q.urls), 10, 0);
        unbounded.pending(now()).unwrap()
    }

    #[test]
    fn test_run_once_resolves_and_patches() {
        let q = queue(0);
        let mut original = record(
            "1",
            &["https://t.example/a", "https://t.example/b"],
            now() - Duration::days(1),
        );
        original.collected_via = vec![Provenance::Retweet];
        let mut repost = record("2", &["https://t.example/a"], now());
        repost.retweet_id = Some("1".to_string());
        ingest(&q, vec![original, repost]);

        q.indexer
            .index_links(&[Link {
                url: "https://t.example/b".to_string(),
                resolved: Some("https://known.example/b".to_string()),
                domain: Some("known.example".to_string()),
            }])
            .unwrap();

        let resolver = FakeResolver {
            answers: vec![("https://t.example/a", "https://www.news.example/a?utm_source=x")],
            asked: Mutex::new(Vec::new()),
        };
        let report = q.run_once(&resolver, now()).unwrap();
        assert_eq!(report.records, 2);
        assert_eq!(report.known_links, 1);
        assert_eq!(report.new_links, 1);
        assert!(report.writes.errors.is_empty());
        assert_eq!(*resolver.asked.lock(), vec!["https://t.example/a"]);

        let stored = q.indexer.find_record("1").unwrap().unwrap();
        assert_eq!(
            stored.proper_links,
            vec!["https://news.example/a", "https://known.example/b"]
        );
        assert_eq!(stored.domains, vec!["news.example", "known.example"]);
        assert!(!stored.links_to_resolve);

        let repost = q.indexer.find_record("2").unwrap().unwrap();
        assert!(!repost.links_to_resolve);
        assert_eq!(repost.proper_links, stored.proper_links);

        assert!(q.pending(now()).unwrap().is_empty());
        let known = q.known_links(&["https://t.example/a".to_string()]).unwrap();
        assert_eq!(
            known["https://t.example/a"].domain.as_deref(),
            Some("news.example")
        );
    }

    #[test]
    fn test_unresolved_url_maps_to_itself() {
        let q = queue(0);
        ingest(&q, vec![record("1", &["https://dead.example/x"], now())]);
        let resolver = FakeResolver {
            answers: vec![],
            asked: Mutex::new(Vec::new()),
        };
        q.run_once(&resolver, now()).unwrap();
        let stored = q.indexer.find_record("1").unwrap().unwrap();
        assert_eq!(stored.proper_links, vec!["https://dead.example/x"]);
        assert_eq!(stored.domains, vec!["dead.example"]);
    }

    #[test]
    fn test_empty_queue_is_a_no_op() {
        let q = queue(0);
        q.indexer.buckets().prepare(NaiveDateTime::default()).unwrap();
        let resolver = FakeResolver {
            answers: vec![],
            asked: Mutex::new(Vec::new()),
        };
        assert_eq!(q.run_once(&resolver, now()).unwrap(), LinkRunReport::default());
    }

    #[test]
    fn test_static_resolver_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolved.json");
        std::fs::write(&path, r#"{"https://t.example/a": "https://news.example/a"}"#).unwrap();
        let resolver = StaticResolver::from_path(&path).unwrap();
        assert_eq!(resolver.len(), 1);

        let answers = resolver
            .resolve(&["https://t.example/a".to_string(), "https://t.example/z".to_string()])
            .unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].resolved, "https://news.example/a");

        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(StaticResolver::from_path(&path).is_err());
    }
}
