//! xgrab - social post collection into time-bucketed document stores
//!
//! This library flattens raw post payloads into canonical records, routes
//! them to monthly buckets, merges re-collected posts, reconstructs reply
//! threads and drives link resolution.
//!
//! # Modules
//!
//! - [`normalize`] - Payload flattening ([`RecordNormalizer`])
//! - [`buckets`] - Bucket naming, creation and retirement
//! - [`indexer`] - Batched upsert-with-merge writes
//! - [`thread`] - Reply-graph closure
//! - [`links`] - Link resolution queue
//! - [`store`] / [`sqlite_store`] - Document store contract and its `SQLite` implementation
//! - [`pipeline`] - The components wired together

pub mod buckets;
pub mod cli;
pub mod config;
pub mod error;
pub mod indexer;
pub mod links;
pub mod logging;
pub mod mapping;
pub mod merge;
pub mod model;
pub mod normalize;
pub mod payload;
pub mod pipeline;
pub mod sqlite_store;
pub mod store;
pub mod thread;
pub mod urls;

pub use buckets::{BucketPolicy, IndexLifecycleManager};
pub use cli::*;
pub use config::Config;
pub use error::{ExtractionWarning, Result, XgError, format_error};
pub use indexer::{BulkMergeIndexer, BulkReport};
pub use links::{LinkQueue, LinkResolver};
pub use mapping::MappingSet;
pub use model::*;
pub use normalize::RecordNormalizer;
pub use pipeline::{IngestReport, Pipeline};
pub use sqlite_store::SqliteStore;
pub use store::DocumentStore;
pub use thread::ThreadResolver;

/// Default database filename
pub const DEFAULT_DB_NAME: &str = "xgrab.db";

/// Standard width for content dividers in CLI output
pub const CONTENT_DIVIDER_WIDTH: usize = 60;

/// Get the default data directory for xgrab
#[must_use]
pub fn default_data_dir() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("xgrab")
}

/// Get the default database path
#[must_use]
pub fn default_db_path() -> std::path::PathBuf {
    default_data_dir().join(DEFAULT_DB_NAME)
}

/// Format an unsigned integer with thousands separators.
#[must_use]
pub fn format_number(value: u64) -> String {
    let mut out = String::with_capacity(24);

    for (idx, ch) in value.to_string().chars().rev().enumerate() {
        if idx > 0 && idx % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }

    out.chars().rev().collect()
}

/// Format a usize with thousands separators.
#[must_use]
pub fn format_number_usize(value: usize) -> String {
    format_number(u64::try_from(value).unwrap_or(u64::MAX))
}

/// Shorten text to `max_chars` characters, marking the cut with `...`.
#[must_use]
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use super::{format_number, format_number_usize, truncate};

    #[test]
    fn format_number_adds_separators() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(12_345_678), "12,345,678");
        assert_eq!(format_number_usize(1_000_000), "1,000,000");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
        assert_eq!(truncate("ééééééé", 5), "éé...");
    }
}
