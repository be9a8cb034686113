//! `SQLite` implementation of [`DocumentStore`].
//!
//! Collections are rows in a registry table; documents are JSON sources keyed
//! by `(collection, id)`. Filters run over the decoded source. Id and string
//! term predicates are also pushed into the query so scans only decode
//! candidate rows.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{Result, XgError};
use crate::mapping::CollectionSchema;
use crate::store::{
    BucketStatus, BulkOp, DocumentStore, Filter, Hit, HitIter, ItemOutcome, ItemResult, project,
};

const SCHEMA_VERSION: i32 = 1;
// SQLite default limit on host parameters is usually 999 or 32766.
const SQLITE_BATCH_SIZE: usize = 900;
const SCAN_PAGE_SIZE: i64 = 500;

/// `SQLite`-backed document store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open or create the database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| XgError::path_error("create directory", parent, e))?;
        }
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be initialized.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA temp_store = MEMORY;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current < SCHEMA_VERSION {
            info!(
                "Migrating document store from version {} to {}",
                current, SCHEMA_VERSION
            );
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS collections (
                    name TEXT PRIMARY KEY,
                    schema_json TEXT NOT NULL,
                    closed INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS documents (
                    collection TEXT NOT NULL,
                    id TEXT NOT NULL,
                    source TEXT NOT NULL,
                    PRIMARY KEY (collection, id)
                );

                CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);
                ",
            )?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        Ok(())
    }

    /// Open collections among `requested`, in request order.
    fn open_collections(conn: &Connection, requested: &[String]) -> Result<Vec<String>> {
        let mut stmt = conn.prepare_cached("SELECT name FROM collections WHERE closed = 0")?;
        let open: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(requested
            .iter()
            .filter(|name| open.contains(name))
            .cloned()
            .collect())
    }

    fn fetch_page(
        &self,
        collections: &[String],
        after_rowid: i64,
        prefilter: Option<&SqlPredicate>,
    ) -> Result<Vec<(i64, String, String, String)>> {
        let conn = self.conn.lock();
        let placeholders = vec!["?"; collections.len()].join(",");
        let extra = prefilter.map_or_else(String::new, |p| format!(" AND ({})", p.clause));
        let sql = format!(
            "SELECT rowid, collection, id, source FROM documents
             WHERE rowid > ? AND collection IN ({placeholders}){extra}
             ORDER BY rowid LIMIT {SCAN_PAGE_SIZE}"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut args: Vec<rusqlite::types::Value> = vec![after_rowid.into()];
        args.extend(collections.iter().map(|c| c.clone().into()));
        if let Some(p) = prefilter {
            args.extend(p.args.iter().map(|a| a.clone().into()));
        }
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn scan_iter(&self, collections: &[String], filter: &Filter) -> Result<ScanIter<'_>> {
        let open = {
            let conn = self.conn.lock();
            Self::open_collections(&conn, collections)?
        };
        let prefilter = SqlPredicate::from_filter(filter)?;
        if prefilter.is_some() {
            debug!("Scan narrowed in SQL");
        }
        Ok(ScanIter {
            store: self,
            exhausted: open.is_empty(),
            collections: open,
            filter: filter.clone(),
            prefilter,
            cursor: 0,
            buffer: VecDeque::new(),
        })
    }
}

/// Lazy scan over open collections, one page of rows per fetch.
struct ScanIter<'a> {
    store: &'a SqliteStore,
    collections: Vec<String>,
    filter: Filter,
    prefilter: Option<SqlPredicate>,
    cursor: i64,
    buffer: VecDeque<Hit>,
    exhausted: bool,
}

impl ScanIter<'_> {
    fn refill(&mut self) -> Result<()> {
        while self.buffer.is_empty() && !self.exhausted {
            let prefilter = self.prefilter.as_ref();
            let rows = self.store.fetch_page(&self.collections, self.cursor, prefilter)?;
            if rows.len() < usize::try_from(SCAN_PAGE_SIZE).unwrap_or(usize::MAX) {
                self.exhausted = true;
            }
            for (rowid, collection, id, source) in rows {
                self.cursor = rowid;
                let source: Value = serde_json::from_str(&source)?;
                if self.filter.matches(&id, &source) {
                    self.buffer.push_back(Hit {
                        collection,
                        id,
                        source,
                    });
                }
            }
        }
        Ok(())
    }
}

impl Iterator for ScanIter<'_> {
    type Item = Result<Hit>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.refill() {
            self.exhausted = true;
            self.buffer.clear();
            return Some(Err(e));
        }
        self.buffer.pop_front().map(Ok)
    }
}

/// SQL narrowing of a [`Filter`]. It may admit rows the filter rejects,
/// never the reverse; the filter still runs on every row returned.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SqlPredicate {
    clause: String,
    args: Vec<String>,
}

impl SqlPredicate {
    /// `None` when no part of the filter can be expressed in SQL.
    fn from_filter(filter: &Filter) -> Result<Option<Self>> {
        Ok(match filter {
            Filter::Ids(ids) => Some(Self {
                clause: "id IN (SELECT value FROM json_each(?))".to_string(),
                args: vec![serde_json::to_string(ids)?],
            }),
            Filter::Term {
                field,
                value: Value::String(value),
            } => Self::any_element(field, std::iter::once(value))?,
            Filter::Terms { field, values } => match values.only_strings() {
                Some(strings) => Self::any_element(field, strings.iter())?,
                None => None,
            },
            Filter::Or(filters) => {
                let mut parts = Vec::with_capacity(filters.len());
                for f in filters {
                    match Self::from_filter(f)? {
                        Some(part) => parts.push(part),
                        None => return Ok(None),
                    }
                }
                Self::join(parts, " OR ")
            }
            Filter::And(filters) => {
                let mut parts = Vec::with_capacity(filters.len());
                for f in filters {
                    if let Some(part) = Self::from_filter(f)? {
                        parts.push(part);
                    }
                }
                Self::join(parts, " AND ")
            }
            _ => None,
        })
    }

    /// Field is, or is an array containing, one of `values`.
    fn any_element<'v>(
        field: &str,
        values: impl Iterator<Item = &'v String>,
    ) -> Result<Option<Self>> {
        if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Ok(None);
        }
        let values: Vec<&String> = values.collect();
        Ok(Some(Self {
            clause: "EXISTS (SELECT 1 FROM json_each(documents.source, ?) AS e
                     WHERE e.type = 'text' AND e.value IN (SELECT value FROM json_each(?)))"
                .to_string(),
            args: vec![format!("$.{field}"), serde_json::to_string(&values)?],
        }))
    }

    fn join(parts: Vec<Self>, op: &str) -> Option<Self> {
        if parts.is_empty() {
            return None;
        }
        let clause = parts
            .iter()
            .map(|p| format!("({})", p.clause))
            .collect::<Vec<_>>()
            .join(op);
        let args = parts.into_iter().flat_map(|p| p.args).collect();
        Some(Self { clause, args })
    }
}

fn read_source(conn: &Connection, collection: &str, id: &str) -> Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT source FROM documents WHERE collection = ? AND id = ?",
            params![collection, id],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|s| serde_json::from_str(&s).map_err(XgError::from))
        .transpose()
}

fn write_source(conn: &Connection, collection: &str, id: &str, source: &Value) -> Result<()> {
    conn.execute(
        "INSERT INTO documents (collection, id, source) VALUES (?1, ?2, ?3)
         ON CONFLICT(collection, id) DO UPDATE SET source = excluded.source",
        params![collection, id, serde_json::to_string(source)?],
    )?;
    Ok(())
}

fn into_object(source: Value) -> Map<String, Value> {
    match source {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl DocumentStore for SqliteStore {
    fn exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM collections WHERE name = ?",
                params![name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn create(&self, name: &str, schema: &CollectionSchema) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO collections (name, schema_json, closed, created_at)
             VALUES (?, ?, 0, ?)",
            params![
                name,
                serde_json::to_string(schema)?,
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        if inserted > 0 {
            debug!(collection = name, "Created collection");
        }
        Ok(inserted > 0)
    }

    fn close(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE collections SET closed = 1 WHERE name = ?",
            params![name],
        )?;
        if updated == 0 {
            return Err(XgError::CollectionMissing {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM collections WHERE name = ?", params![name])?;
        if removed == 0 {
            return Err(XgError::CollectionMissing {
                name: name.to_string(),
            });
        }
        tx.execute("DELETE FROM documents WHERE collection = ?", params![name])?;
        tx.commit()?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<BucketStatus>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT c.name, c.closed, COUNT(d.id)
             FROM collections c LEFT JOIN documents d ON d.collection = c.name
             WHERE substr(c.name, 1, ?1) = ?2
             GROUP BY c.name
             ORDER BY c.name",
        )?;
        let prefix_len = i64::try_from(prefix.chars().count()).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![prefix_len, prefix], |row| {
                let closed: bool = row.get(1)?;
                let docs: i64 = row.get(2)?;
                Ok(BucketStatus {
                    name: row.get(0)?,
                    docs: u64::try_from(docs).unwrap_or(0),
                    open: !closed,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn bulk(&self, ops: Vec<BulkOp>) -> Result<Vec<ItemResult>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let states: HashMap<String, bool> = {
            let mut stmt = tx.prepare_cached("SELECT name, closed FROM collections")?;
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<_, _>>()?
        };

        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let collection = op.collection().to_string();
            let id = op.id().to_string();

            let outcome = match states.get(&collection) {
                None => ItemOutcome::Failed(
                    XgError::CollectionMissing {
                        name: collection.clone(),
                    }
                    .to_string(),
                ),
                Some(true) => ItemOutcome::Failed(
                    XgError::CollectionClosed {
                        name: collection.clone(),
                    }
                    .to_string(),
                ),
                Some(false) => match op {
                    BulkOp::Upsert {
                        params, document, ..
                    } => {
                        if let Some(existing) = read_source(&tx, &collection, &id)? {
                            let mut merged = into_object(existing);
                            params.apply(&mut merged);
                            write_source(&tx, &collection, &id, &Value::Object(merged))?;
                            ItemOutcome::Updated
                        } else {
                            write_source(&tx, &collection, &id, &document)?;
                            ItemOutcome::Created
                        }
                    }
                    BulkOp::Index { document, .. } => {
                        let existed = read_source(&tx, &collection, &id)?.is_some();
                        write_source(&tx, &collection, &id, &document)?;
                        if existed {
                            ItemOutcome::Updated
                        } else {
                            ItemOutcome::Created
                        }
                    }
                    BulkOp::Update { patch, .. } => {
                        if let Some(existing) = read_source(&tx, &collection, &id)? {
                            let mut merged = into_object(existing);
                            merged.extend(patch);
                            write_source(&tx, &collection, &id, &Value::Object(merged))?;
                            ItemOutcome::Updated
                        } else {
                            ItemOutcome::Failed(format!("document {id} missing"))
                        }
                    }
                },
            };
            results.push(ItemResult {
                collection,
                id,
                outcome,
            });
        }

        tx.commit()?;
        Ok(results)
    }

    fn search(
        &self,
        collections: &[String],
        filter: &Filter,
        fields: &[&str],
        size: usize,
    ) -> Result<Vec<Hit>> {
        let mut hits = Vec::new();
        for hit in self.scan_iter(collections, filter)?.take(size) {
            let mut hit = hit?;
            hit.source = project(hit.source, fields);
            hits.push(hit);
        }
        Ok(hits)
    }

    fn scan<'a>(&'a self, collections: &[String], filter: &Filter) -> Result<HitIter<'a>> {
        Ok(Box::new(self.scan_iter(collections, filter)?))
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<Hit>> {
        let conn = self.conn.lock();
        if Self::open_collections(&conn, &[collection.to_string()])?.is_empty() {
            return Ok(None);
        }
        Ok(read_source(&conn, collection, id)?.map(|source| Hit {
            collection: collection.to_string(),
            id: id.to_string(),
            source,
        }))
    }

    fn multi_get(&self, collection: &str, ids: &[String]) -> Result<Vec<Hit>> {
        let conn = self.conn.lock();
        if ids.is_empty() || Self::open_collections(&conn, &[collection.to_string()])?.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(SQLITE_BATCH_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT id, source FROM documents WHERE collection = ? AND id IN ({placeholders})"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let args = std::iter::once(collection).chain(chunk.iter().map(String::as_str));
            let rows = stmt
                .query_map(params_from_iter(args), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for (id, source) in rows {
                hits.push(Hit {
                    collection: collection.to_string(),
                    id,
                    source: serde_json::from_str(&source)?,
                });
            }
        }
        Ok(hits)
    }

    fn count(&self, collections: &[String], filter: &Filter) -> Result<u64> {
        let mut total = 0;
        for hit in self.scan_iter(collections, filter)? {
            hit?;
            total += 1;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingSet;
    use crate::merge::MergeParams;
    use crate::model::Provenance;
    use serde_json::json;

    fn store_with(names: &[&str]) -> SqliteStore {
        let store = SqliteStore::open_memory().unwrap();
        let schema = MappingSet::load().unwrap().records;
        for name in names {
            store.create(name, &schema).unwrap();
        }
        store
    }

    fn upsert(collection: &str, id: &str, via: Provenance, retweets: i64) -> BulkOp {
        BulkOp::Upsert {
            collection: collection.to_string(),
            id: id.to_string(),
            params: MergeParams {
                collected_via: via,
                match_query: via.matches_query(),
                retweet_count: retweets,
                favorite_count: 0,
                reply_count: None,
            },
            document: json!({
                "id": id,
                "text": format!("post {id}"),
                "collected_via": [via],
                "match_query": via.matches_query(),
                "retweet_count": retweets
            }),
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_create_is_idempotent() {
        let store = store_with(&[]);
        let schema = MappingSet::load().unwrap().links;
        assert!(store.create("db_links", &schema).unwrap());
        assert!(!store.create("db_links", &schema).unwrap());
        assert!(store.exists("db_links").unwrap());
        assert!(!store.exists("other").unwrap());
    }

    #[test]
    fn test_upsert_creates_then_merges() {
        let store = store_with(&["t_2024_01"]);
        let results = store
            .bulk(vec![upsert("t_2024_01", "1", Provenance::Quote, 1)])
            .unwrap();
        assert_eq!(results[0].outcome, ItemOutcome::Created);

        let results = store
            .bulk(vec![upsert("t_2024_01", "1", Provenance::Search, 8)])
            .unwrap();
        assert_eq!(results[0].outcome, ItemOutcome::Updated);

        let hit = store.get("t_2024_01", "1").unwrap().unwrap();
        assert_eq!(hit.source["text"], json!("post 1"));
        assert_eq!(hit.source["collected_via"], json!(["quote", "search"]));
        assert_eq!(hit.source["match_query"], json!(true));
        assert_eq!(hit.source["retweet_count"], json!(8));
    }

    #[test]
    fn test_closed_and_missing_collections_fail_per_item() {
        let store = store_with(&["t_2024_01", "t_2024_02"]);
        store.close("t_2024_01").unwrap();
        let results = store
            .bulk(vec![
                upsert("t_2024_01", "1", Provenance::Search, 0),
                upsert("t_2024_02", "2", Provenance::Search, 0),
                upsert("t_2030_01", "3", Provenance::Search, 0),
            ])
            .unwrap();
        assert_eq!(
            results[0].outcome,
            ItemOutcome::Failed("Collection 't_2024_01' is closed".to_string())
        );
        assert_eq!(results[1].outcome, ItemOutcome::Created);
        assert_eq!(
            results[2].outcome,
            ItemOutcome::Failed("Collection 't_2030_01' does not exist".to_string())
        );
    }

    #[test]
    fn test_update_requires_existing_document() {
        let store = store_with(&["t"]);
        store.bulk(vec![upsert("t", "1", Provenance::Search, 0)]).unwrap();
        let mut patch = Map::new();
        patch.insert("deleted".to_string(), json!(true));
        let results = store
            .bulk(vec![
                BulkOp::Update {
                    collection: "t".to_string(),
                    id: "1".to_string(),
                    patch: patch.clone(),
                },
                BulkOp::Update {
                    collection: "t".to_string(),
                    id: "404".to_string(),
                    patch,
                },
            ])
            .unwrap();
        assert_eq!(results[0].outcome, ItemOutcome::Updated);
        assert!(matches!(results[1].outcome, ItemOutcome::Failed(_)));
        let hit = store.get("t", "1").unwrap().unwrap();
        assert_eq!(hit.source["deleted"], json!(true));
        assert_eq!(hit.source["text"], json!("post 1"));
    }

    #[test]
    fn test_closed_collections_are_invisible_to_reads() {
        let store = store_with(&["t_2024_01", "t_2024_02"]);
        store
            .bulk(vec![
                upsert("t_2024_01", "1", Provenance::Search, 0),
                upsert("t_2024_02", "2", Provenance::Search, 0),
            ])
            .unwrap();
        store.close("t_2024_01").unwrap();

        let all = names(&["t_2024_01", "t_2024_02"]);
        assert_eq!(store.count(&all, &Filter::MatchAll).unwrap(), 1);
        assert!(store.get("t_2024_01", "1").unwrap().is_none());

        let listed = store.list("t_").unwrap();
        assert_eq!(listed.len(), 2);
        assert!(!listed[0].open);
        assert_eq!(listed[1].docs, 1);
    }

    #[test]
    fn test_prefilter_translation() {
        let thread = Filter::Or(vec![
            Filter::ids(["1"]),
            Filter::terms("in_reply_to_id", ["1"]),
        ]);
        let sql = SqlPredicate::from_filter(&thread).unwrap().unwrap();
        assert!(sql.clause.contains(" OR "));
        assert_eq!(sql.args, vec![r#"["1"]"#, "$.in_reply_to_id", r#"["1"]"#]);

        let with_range = Filter::Or(vec![Filter::ids(["1"]), Filter::gte("timestamp_utc", 0)]);
        assert!(SqlPredicate::from_filter(&with_range).unwrap().is_none());
        let narrowed = Filter::And(vec![
            Filter::term("links_to_resolve", true),
            Filter::ids(["1"]),
        ]);
        assert_eq!(SqlPredicate::from_filter(&narrowed).unwrap().unwrap().args.len(), 1);
        assert!(SqlPredicate::from_filter(&Filter::term("odd field", "x")).unwrap().is_none());
    }

    #[test]
    fn test_prefiltered_scan_matches_in_memory_semantics() {
        let store = store_with(&["t"]);
        let mut ops: Vec<BulkOp> = (1..=6)
            .map(|i| upsert("t", &i.to_string(), Provenance::Search, 0))
            .collect();
        if let BulkOp::Upsert { document, .. } = &mut ops[1] {
            document["in_reply_to_id"] = json!("1");
        }
        if let BulkOp::Upsert { document, .. } = &mut ops[2] {
            document["in_reply_to_id"] = json!(1);
        }
        if let BulkOp::Upsert { document, .. } = &mut ops[3] {
            document["in_reply_to_id"] = Value::Null;
        }
        ops.push(upsert("t", "7", Provenance::Thread, 0));
        store.bulk(ops).unwrap();
        let collections = names(&["t"]);

        let thread = Filter::Or(vec![
            Filter::ids(["1"]),
            Filter::terms("in_reply_to_id", ["1"]),
        ]);
        let mut ids: Vec<String> = store
            .scan(&collections, &thread)
            .unwrap()
            .map(|h| h.unwrap().id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "2"]);

        // Array fields match on any element.
        let via = Filter::term("collected_via", "thread");
        assert_eq!(store.count(&collections, &via).unwrap(), 1);
        assert_eq!(
            store
                .count(&collections, &Filter::ids((1..=900).map(|i| i.to_string())))
                .unwrap(),
            7
        );
    }

    #[test]
    fn test_list_prefix_is_literal() {
        let store = store_with(&["a_b_2024_01", "axb_2024_01"]);
        let listed = store.list("a_b").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "a_b_2024_01");
    }

    #[test]
    fn test_delete_removes_documents() {
        let store = store_with(&["t"]);
        store.bulk(vec![upsert("t", "1", Provenance::Search, 0)]).unwrap();
        store.delete("t").unwrap();
        assert!(!store.exists("t").unwrap());
        assert!(matches!(
            store.delete("t").unwrap_err(),
            XgError::CollectionMissing { .. }
        ));
        let schema = MappingSet::load().unwrap().records;
        store.create("t", &schema).unwrap();
        assert_eq!(store.count(&names(&["t"]), &Filter::MatchAll).unwrap(), 0);
    }

    #[test]
    fn test_scan_pages_through_everything() {
        let store = store_with(&["t"]);
        let total = 1_234;
        let ops: Vec<BulkOp> = (0..total)
            .map(|i| upsert("t", &i.to_string(), Provenance::Stream, i))
            .collect();
        store.bulk(ops).unwrap();

        let seen = store
            .scan(&names(&["t"]), &Filter::MatchAll)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(seen.len(), 1_234);

        let filtered = store
            .scan(&names(&["t"]), &Filter::gte("retweet_count", 1_200))
            .unwrap()
            .count();
        assert_eq!(filtered, 34);
    }

    #[test]
    fn test_search_limits_and_projects() {
        let store = store_with(&["t"]);
        store
            .bulk(vec![
                upsert("t", "1", Provenance::Search, 0),
                upsert("t", "2", Provenance::Search, 0),
            ])
            .unwrap();
        let hits = store
            .search(&names(&["t"]), &Filter::MatchAll, &["text"], 1)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, json!({"text": "post 1"}));
    }

    #[test]
    fn test_multi_get_skips_unknown_ids() {
        let store = store_with(&["t"]);
        store
            .bulk(vec![
                upsert("t", "1", Provenance::Search, 0),
                upsert("t", "2", Provenance::Search, 0),
            ])
            .unwrap();
        let hits = store
            .multi_get("t", &names(&["2", "404"]))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "2");
    }

    #[test]
    fn test_open_file_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("xgrab.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            let schema = MappingSet::load().unwrap().records;
            store.create("t", &schema).unwrap();
            store.bulk(vec![upsert("t", "1", Provenance::Search, 0)]).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get("t", "1").unwrap().is_some());
    }
}
