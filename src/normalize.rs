//! Payload → record normalization.
//!
//! One payload may embed a reposted and/or a quoted post. Each embedded post
//! is normalized first and emitted as its own record; the outer record comes
//! last and inherits the embedded entity lists.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ExtractionWarning, Result, XgError};
use crate::model::{LOCAL_TIME_FORMAT, Locale, Provenance, Record};
use crate::payload::{Embedded, Entities, RawPost};
use crate::urls::{DefaultUrlNormalizer, UrlNormalizer};

/// Point `record` at an embedded repost or quote.
fn link_embedded(record: &mut Record, inner: &Record, tag: Provenance) {
    if tag == Provenance::Retweet {
        record.retweet_id = Some(inner.id.clone());
        record.retweet_user = inner.user_screen_name.clone();
        record.retweet_user_id = inner.user_id.clone();
        record.retweet_timestamp_utc = Some(inner.timestamp_utc);
    } else {
        record.quoted_id = Some(inner.id.clone());
        record.quoted_user = inner.user_screen_name.clone();
        record.quoted_user_id = inner.user_id.clone();
        record.quoted_timestamp_utc = Some(inner.timestamp_utc);
    }
}

/// Source timestamp layout: `Wed Oct 10 20:19:24 +0000 2018`.
pub const SOURCE_TIME_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

static ENTITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#[xX][0-9a-fA-F]+|#[0-9]+|[a-zA-Z]+);").expect("valid entity regex"));

/// Records produced from one payload, outer record last.
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub records: Vec<Record>,
    pub warnings: Vec<ExtractionWarning>,
}

/// What a nested call hands back to its parent.
struct Produced {
    index: usize,
    entities: Entities,
    extended_entities: Option<Entities>,
}

/// Flattens raw payloads into [`Record`]s.
pub struct RecordNormalizer {
    locale: Locale,
    urls: Arc<dyn UrlNormalizer>,
}

impl std::fmt::Debug for RecordNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordNormalizer")
            .field("locale", &self.locale)
            .finish_non_exhaustive()
    }
}

impl Default for RecordNormalizer {
    fn default() -> Self {
        Self::new(Locale::Utc, Arc::new(DefaultUrlNormalizer))
    }
}

impl RecordNormalizer {
    /// `locale` is the zone used for `local_time`.
    #[must_use]
    pub fn new(locale: Locale, urls: Arc<dyn UrlNormalizer>) -> Self {
        Self { locale, urls }
    }

    #[must_use]
    pub const fn locale(&self) -> Locale {
        self.locale
    }

    /// Normalize one payload collected under `via`.
    ///
    /// # Errors
    ///
    /// Returns [`XgError::InvalidPayload`] when the outer payload has no id or
    /// no parseable `created_at`.
    pub fn normalize(&self, raw: &Value, via: Provenance) -> Result<Normalized> {
        let mut out = Normalized::default();
        let mut visited = HashSet::new();
        self.normalize_into(raw, via, &mut visited, &mut out)?;
        Ok(out)
    }

    /// Normalize many payloads in parallel; results keep input order.
    #[must_use]
    pub fn normalize_batch(&self, payloads: &[Value], via: Provenance) -> Vec<Result<Normalized>> {
        payloads
            .par_iter()
            .map(|raw| self.normalize(raw, via))
            .collect()
    }

    #[allow(clippy::too_many_lines)]
    fn normalize_into(
        &self,
        raw: &Value,
        via: Provenance,
        visited: &mut HashSet<String>,
        out: &mut Normalized,
    ) -> Result<Produced> {
        let mut post = RawPost::from_value(raw, &mut out.warnings)?;
        visited.insert(post.id.clone());

        let (timestamp_utc, local_time) = self.dates(&post)?;
        let mut text = post.text.clone().unwrap_or_default();
        let mut record = Record::default();

        for embedded in post.embedded() {
            let (inner, tag) = match embedded {
                Embedded::Repost(inner) => (inner, Provenance::Retweet),
                Embedded::Quote(inner) => (inner, Provenance::Quote),
            };
            if let Some(seen_id) = RawPost::peek_id(inner).filter(|id| visited.contains(id)) {
                debug!(post = %post.id, embedded = %seen_id, "Embedded post already visited, not recursing");
                if let Some(seen) = out.records.iter().find(|r| r.id == seen_id) {
                    link_embedded(&mut record, seen, tag);
                }
                continue;
            }
            let produced = match self.normalize_into(inner, tag, visited, out) {
                Ok(produced) => produced,
                Err(e) => {
                    warn!(post = %post.id, error = %e, "Skipping unreadable embedded {tag}");
                    continue;
                }
            };

            post.entities.splice(&produced.entities);
            if let Some(inner_extended) = &produced.extended_entities {
                post.extended_entities
                    .get_or_insert_with(Entities::default)
                    .splice(inner_extended);
            }

            let inner = &out.records[produced.index];
            let inner_user = inner.user_screen_name.clone().unwrap_or_default();
            match tag {
                Provenance::Retweet => {
                    text = format!("RT @{inner_user}: {}", inner.text);
                }
                _ => {
                    let permalink = post
                        .quote_permalink
                        .clone()
                        .unwrap_or_else(|| inner.url.clone());
                    let rendered = format!("« {inner_user}: {} — {permalink} »", inner.text);
                    text = text.replace(&permalink, &rendered);
                }
            }
            link_embedded(&mut record, inner, tag);
        }

        let source_id = record
            .retweet_id
            .clone()
            .or_else(|| record.quoted_id.clone())
            .unwrap_or_else(|| post.id.clone());

        // Media
        let media = post
            .extended_entities
            .as_ref()
            .map_or(&post.entities.media, |ext| &ext.media);
        let mut media_names = HashSet::new();
        for entity in media {
            self.substitute(&mut text, entity.url.as_deref(), entity.expanded_url.as_deref(), &post.id, out);
            let Some(media_url) = entity.best_url() else {
                continue;
            };
            let name = media_name(media_url);
            if media_names.insert(name.clone()) {
                record.media_urls.push(media_url.to_string());
                record.media_files.push(format!("{source_id}_{name}"));
            }
        }

        // Links
        let mut links = BTreeSet::new();
        for entity in &post.entities.urls {
            self.substitute(&mut text, entity.url.as_deref(), entity.expanded_url.as_deref(), &post.id, out);
            let target = entity
                .expanded_url
                .as_deref()
                .filter(|u| !u.is_empty())
                .or(entity.url.as_deref());
            if let Some(target) = target {
                links.insert(self.urls.normalize(target));
            }
        }

        let hashtags: BTreeSet<String> = post
            .entities
            .hashtags
            .iter()
            .filter(|h| !h.text.is_empty())
            .map(|h| h.text.to_lowercase())
            .collect();
        let mentions: BTreeMap<String, String> = post
            .entities
            .user_mentions
            .iter()
            .filter(|m| !m.screen_name.is_empty())
            .map(|m| {
                (
                    m.screen_name.to_lowercase(),
                    m.resolved_id().unwrap_or_default(),
                )
            })
            .collect();

        let text = unescape_html(&text);
        if text.is_empty() {
            let warning = ExtractionWarning::MissingText {
                id: post.id.clone(),
            };
            warn!("{warning}");
            out.warnings.push(warning);
        }

        let screen_name = post.user.screen_name.clone();
        record.url = format!(
            "https://twitter.com/{}/statuses/{}",
            screen_name.as_deref().unwrap_or("i"),
            post.id
        );
        record.id = post.id;
        record.text = text;
        record.timestamp_utc = timestamp_utc;
        record.local_time = local_time;
        record.lang = post.lang;
        record.in_reply_to_id = post.in_reply_to_id;
        record.in_reply_to_user = post.in_reply_to_user;
        record.in_reply_to_user_id = post.in_reply_to_user_id;

        record.user_id = post.user.id;
        record.user_screen_name = screen_name;
        record.user_name = post.user.name;
        record.user_followers = post.user.followers;
        record.user_friends = post.user.friends;
        record.user_statuses = post.user.statuses;
        record.user_verified = post.user.verified;
        record.user_location = post.user.location;
        record.user_description = post.user.description;
        record.user_url = post.user.url;

        record.possibly_sensitive = post.possibly_sensitive;
        if let Some((lng, lat)) = post.coordinates {
            record.lat = Some(lat);
            record.lng = Some(lng);
        }
        if let Some(place) = post.place {
            record.place_country = place.country;
            record.place_name = place.full_name;
            record.place_type = place.place_type;
        }
        record.source_name = post.source_name;
        record.source_url = post.source_url;

        record.links_to_resolve = !links.is_empty();
        record.links = links.into_iter().collect();
        record.hashtags = hashtags.into_iter().collect();
        let (names, ids): (Vec<String>, Vec<String>) = mentions.into_iter().unzip();
        record.mentions_names = names;
        record.mentions_ids = ids;

        record.collection_time = self.collection_time();
        record.collected_via = vec![via];
        record.match_query = via.matches_query();
        record.retweet_count = post.retweet_count.unwrap_or(0);
        record.favorite_count = post.favorite_count.unwrap_or(0);
        record.reply_count = post.reply_count;

        out.records.push(record);
        Ok(Produced {
            index: out.records.len() - 1,
            entities: post.entities,
            extended_entities: post.extended_entities,
        })
    }

    /// Replace a short URL with its expanded form in `text`.
    fn substitute(
        &self,
        text: &mut String,
        url: Option<&str>,
        expanded: Option<&str>,
        id: &str,
        out: &mut Normalized,
    ) {
        let (Some(url), Some(expanded)) = (url, expanded) else {
            return;
        };
        if url.is_empty() || expanded.is_empty() {
            return;
        }
        if text.contains(url) {
            *text = text.replace(url, expanded);
        } else if !text.contains(expanded) {
            debug!(post = id, url, "Entity not found in text");
            out.warnings.push(ExtractionWarning::UnsubstitutedEntity {
                id: id.to_string(),
                url: url.to_string(),
            });
        }
    }

    /// `(epoch seconds, civil local time)` of a post.
    fn dates(&self, post: &RawPost<'_>) -> Result<(i64, String)> {
        let raw = post.created_at.as_deref().ok_or_else(|| {
            XgError::invalid_payload(format!("post {} has no created_at", post.id))
        })?;
        let parsed = DateTime::parse_from_str(raw, SOURCE_TIME_FORMAT).map_err(|e| {
            XgError::invalid_payload(format!("post {} has invalid created_at '{raw}': {e}", post.id))
        })?;
        Ok((parsed.timestamp(), self.civil(parsed.with_timezone(&Utc))))
    }

    fn civil(&self, instant: DateTime<Utc>) -> String {
        self.locale.civil(instant).format(LOCAL_TIME_FORMAT).to_string()
    }

    fn collection_time(&self) -> String {
        self.locale
            .civil(Utc::now())
            .format("%Y-%m-%dT%H:%M:%S%.6f")
            .to_string()
    }
}

/// Final path segment of a media URL, query stripped.
fn media_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// Decode HTML character references. Unknown named entities are kept as is.
#[must_use]
pub fn unescape_html(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    ENTITY_RE
        .replace_all(text, |caps: &Captures<'_>| {
            decode_entity(&caps[1]).map_or_else(|| caps[0].to_string(), |c| c.to_string())
        })
        .into_owned()
}

fn decode_entity(name: &str) -> Option<char> {
    if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse().ok()?,
        };
        return char::from_u32(code);
    }
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        "hellip" => Some('…'),
        "mdash" => Some('—'),
        "ndash" => Some('–'),
        "laquo" => Some('«'),
        "raquo" => Some('»'),
        _ => None,
    }
}
