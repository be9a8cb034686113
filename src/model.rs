//! Data models for collected posts.
//!
//! A [`Record`] is the flat, canonical form of one post after normalization.
//! Field names double as document field names in the store, so renaming a
//! field is a mapping change (see `data/db_mappings.json`).

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, XgError};

/// Civil timestamp layout used for `local_time`.
pub const LOCAL_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Zone in which civil times (`local_time`, bucket months) are expressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Locale {
    #[default]
    Utc,
    Fixed(FixedOffset),
    /// IANA zone; follows daylight saving.
    Named(chrono_tz::Tz),
}

impl Locale {
    /// Wall-clock time of `instant` in this zone.
    #[must_use]
    pub fn civil(self, instant: DateTime<Utc>) -> NaiveDateTime {
        match self {
            Self::Utc => instant.naive_utc(),
            Self::Fixed(offset) => instant.with_timezone(&offset).naive_local(),
            Self::Named(tz) => instant.with_timezone(&tz).naive_local(),
        }
    }
}

/// Why a record was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Matched the search API query.
    Search,
    /// Matched the streaming API filter.
    Stream,
    /// Pulled in to complete a conversation.
    Thread,
    /// Embedded as the original of a repost.
    Retweet,
    /// Embedded as a quoted post.
    Quote,
}

impl Provenance {
    /// Whether a record collected this way matched the query itself.
    #[must_use]
    pub const fn matches_query(self) -> bool {
        !matches!(self, Self::Thread | Self::Quote)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Stream => "stream",
            Self::Thread => "thread",
            Self::Retweet => "retweet",
            Self::Quote => "quote",
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provenance {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "search" => Ok(Self::Search),
            "stream" => Ok(Self::Stream),
            "thread" => Ok(Self::Thread),
            "retweet" | "repost" => Ok(Self::Retweet),
            "quote" => Ok(Self::Quote),
            _ => Err(format!("Invalid provenance: {s}")),
        }
    }
}

/// A collected post, flattened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Record {
    pub id: String,
    pub text: String,
    pub url: String,
    pub timestamp_utc: i64,
    pub local_time: String,
    pub lang: Option<String>,

    pub retweet_id: Option<String>,
    pub retweet_user: Option<String>,
    pub retweet_user_id: Option<String>,
    pub retweet_timestamp_utc: Option<i64>,
    pub quoted_id: Option<String>,
    pub quoted_user: Option<String>,
    pub quoted_user_id: Option<String>,
    pub quoted_timestamp_utc: Option<i64>,
    pub in_reply_to_id: Option<String>,
    pub in_reply_to_user: Option<String>,
    pub in_reply_to_user_id: Option<String>,

    pub user_id: Option<String>,
    pub user_screen_name: Option<String>,
    pub user_name: Option<String>,
    pub user_followers: Option<i64>,
    pub user_friends: Option<i64>,
    pub user_statuses: Option<i64>,
    pub user_verified: Option<bool>,
    pub user_location: Option<String>,
    pub user_description: Option<String>,
    pub user_url: Option<String>,

    pub possibly_sensitive: Option<bool>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub place_country: Option<String>,
    pub place_name: Option<String>,
    pub place_type: Option<String>,
    pub source_name: Option<String>,
    pub source_url: Option<String>,

    pub media_urls: Vec<String>,
    pub media_files: Vec<String>,
    pub links: Vec<String>,
    pub links_to_resolve: bool,
    pub proper_links: Vec<String>,
    pub domains: Vec<String>,
    pub hashtags: Vec<String>,
    pub mentions_ids: Vec<String>,
    pub mentions_names: Vec<String>,

    pub collection_time: String,
    pub collected_via: Vec<Provenance>,
    pub match_query: bool,
    pub deleted: bool,

    pub retweet_count: i64,
    pub favorite_count: i64,
    pub reply_count: Option<i64>,
}

impl Record {
    /// Rebuild a record from a stored document.
    ///
    /// # Errors
    ///
    /// Returns an error if the source does not deserialize into a record.
    pub fn from_source(id: &str, source: Value) -> Result<Self> {
        let mut record: Self = serde_json::from_value(source)?;
        if record.id.is_empty() {
            record.id = id.to_string();
        }
        Ok(record)
    }

    /// Serialize into a store document.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_document(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(XgError::from)
    }

    /// The single provenance tag this observation was collected under.
    #[must_use]
    pub fn provenance(&self) -> Option<Provenance> {
        self.collected_via.first().copied()
    }
}

/// A link entity, keyed by its normalized URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub url: String,
    pub resolved: Option<String>,
    pub domain: Option<String>,
}

/// Result handed back by an external link resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkResolution {
    pub original: String,
    pub resolved: String,
}
