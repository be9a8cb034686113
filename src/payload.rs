//! Raw post payload schema.
//!
//! Source payloads are loosely typed: ids come as `id_str` or as numbers,
//! long posts hide their text and entities under `extended_tweet`, and
//! metadata fields occasionally arrive as objects. [`RawPost::from_value`]
//! resolves every fallback in one place so the normalizer only ever sees
//! resolved values.
//!
//! Fallback order per field:
//!
//! | field        | tried in order                                        |
//! |--------------|-------------------------------------------------------|
//! | id           | `id_str`, `id`                                        |
//! | text         | `extended_tweet.full_text`, `full_text`, `text`       |
//! | entities     | `extended_tweet.entities`, `entities`                 |
//! | `*_str` ids  | `x_str`, `x`                                          |
//! | counters     | number, numeric string                                |

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{ExtractionWarning, Result, XgError};

static SOURCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<a href="([^"]*)"[^>]*>([^<]*)</a>"#).expect("valid source regex")
});

/// URL entity as found under `entities.urls`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UrlEntity {
    pub url: Option<String>,
    pub expanded_url: Option<String>,
}

/// One rendition of a video.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VideoVariant {
    pub bitrate: Option<u64>,
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VideoInfo {
    pub variants: Vec<VideoVariant>,
}

/// Media entity as found under `entities.media` / `extended_entities.media`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MediaEntity {
    pub url: Option<String>,
    pub expanded_url: Option<String>,
    pub media_url: Option<String>,
    pub media_url_https: Option<String>,
    pub video_info: Option<VideoInfo>,
}

impl MediaEntity {
    /// Best available URL: highest-bitrate video variant, else the photo URL.
    #[must_use]
    pub fn best_url(&self) -> Option<&str> {
        if let Some(info) = &self.video_info {
            if let Some(best) = info
                .variants
                .iter()
                .max_by_key(|variant| variant.bitrate.unwrap_or(0))
            {
                return Some(best.url.as_str());
            }
        }
        self.media_url_https
            .as_deref()
            .or(self.media_url.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HashtagEntity {
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MentionEntity {
    pub screen_name: String,
    pub id_str: Option<String>,
    pub id: Option<u64>,
}

impl MentionEntity {
    #[must_use]
    pub fn resolved_id(&self) -> Option<String> {
        self.id_str
            .clone()
            .or_else(|| self.id.map(|id| id.to_string()))
    }
}

/// Entity lists of one payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Entities {
    pub urls: Vec<UrlEntity>,
    pub media: Vec<MediaEntity>,
    pub hashtags: Vec<HashtagEntity>,
    pub user_mentions: Vec<MentionEntity>,
}

impl Entities {
    /// Append another payload's lists after ours.
    pub fn splice(&mut self, other: &Self) {
        self.urls.extend(other.urls.iter().cloned());
        self.media.extend(other.media.iter().cloned());
        self.hashtags.extend(other.hashtags.iter().cloned());
        self.user_mentions.extend(other.user_mentions.iter().cloned());
    }
}

/// Author fields.
#[derive(Debug, Clone, Default)]
pub struct Author {
    pub id: Option<String>,
    pub screen_name: Option<String>,
    pub name: Option<String>,
    pub followers: Option<i64>,
    pub friends: Option<i64>,
    pub statuses: Option<i64>,
    pub verified: Option<bool>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Place {
    pub country: Option<String>,
    pub full_name: Option<String>,
    pub place_type: Option<String>,
}

/// A post embedded in another one.
#[derive(Debug, Clone, Copy)]
pub enum Embedded<'a> {
    Repost(&'a Value),
    Quote(&'a Value),
}

/// One payload with every field fallback resolved.
#[derive(Debug, Clone)]
pub struct RawPost<'a> {
    pub id: String,
    pub text: Option<String>,
    pub created_at: Option<String>,
    pub user: Author,
    pub entities: Entities,
    pub extended_entities: Option<Entities>,
    pub quote_permalink: Option<String>,
    pub in_reply_to_id: Option<String>,
    pub in_reply_to_user: Option<String>,
    pub in_reply_to_user_id: Option<String>,
    pub lang: Option<String>,
    pub possibly_sensitive: Option<bool>,
    /// `(lng, lat)` of a point geometry.
    pub coordinates: Option<(f64, f64)>,
    pub place: Option<Place>,
    pub source_url: Option<String>,
    pub source_name: Option<String>,
    pub retweet_count: Option<i64>,
    pub favorite_count: Option<i64>,
    pub reply_count: Option<i64>,
    repost: Option<&'a Value>,
    quote: Option<&'a Value>,
}

impl<'a> RawPost<'a> {
    /// Resolve a raw JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`XgError::InvalidPayload`] when the payload is not an object
    /// or carries no id.
    pub fn from_value(value: &'a Value, warnings: &mut Vec<ExtractionWarning>) -> Result<Self> {
        if !value.is_object() {
            return Err(XgError::invalid_payload("payload is not a JSON object"));
        }
        let id = Self::peek_id(value)
            .ok_or_else(|| XgError::invalid_payload("payload has no id_str or id"))?;

        let extended = value.get("extended_tweet").filter(|v| v.is_object());
        let pick = |key: &str| -> Option<&'a Value> {
            extended
                .and_then(|ext| ext.get(key))
                .or_else(|| value.get(key))
                .filter(|v| !v.is_null())
        };

        let text = pick("full_text")
            .or_else(|| value.get("text"))
            .and_then(Value::as_str)
            .map(String::from);

        let entities = pick("entities")
            .map(|v| parse_entities(v, &id, "entities"))
            .unwrap_or_default();
        let extended_entities =
            pick("extended_entities").map(|v| parse_entities(v, &id, "extended_entities"));

        let mut fields = FieldReader {
            value,
            id: &id,
            warnings,
        };

        let (source_url, source_name) = value
            .get("source")
            .and_then(Value::as_str)
            .map_or((None, None), parse_source);

        let post = Self {
            text,
            created_at: value
                .get("created_at")
                .and_then(Value::as_str)
                .map(String::from),
            user: parse_author(value.get("user")),
            entities,
            extended_entities,
            quote_permalink: value
                .get("quoted_status_permalink")
                .and_then(|p| p.get("url"))
                .and_then(Value::as_str)
                .map(String::from),
            in_reply_to_id: fields.id_string("in_reply_to_status_id_str"),
            in_reply_to_user: fields.string("in_reply_to_screen_name"),
            in_reply_to_user_id: fields.id_string("in_reply_to_user_id_str"),
            lang: fields.string("lang"),
            possibly_sensitive: fields.scalar("possibly_sensitive").and_then(Value::as_bool),
            coordinates: parse_coordinates(value.get("coordinates")),
            place: parse_place(value.get("place")),
            source_url,
            source_name,
            retweet_count: fields.counter("retweet_count"),
            favorite_count: fields.counter("favorite_count"),
            reply_count: fields.counter("reply_count"),
            repost: value.get("retweeted_status").filter(|v| v.is_object()),
            quote: value.get("quoted_status").filter(|v| v.is_object()),
            id,
        };
        Ok(post)
    }

    /// Id of a payload without resolving anything else.
    #[must_use]
    pub fn peek_id(value: &Value) -> Option<String> {
        match value.get("id_str") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => value.get("id").and_then(value_to_id),
        }
    }

    /// Embedded posts in processing order: repost first, then quote.
    ///
    /// An embedded payload carrying the outer id is left out.
    #[must_use]
    pub fn embedded(&self) -> Vec<Embedded<'a>> {
        let mut out = Vec::with_capacity(2);
        if let Some(inner) = self.repost {
            if Self::peek_id(inner).as_deref() != Some(self.id.as_str()) {
                out.push(Embedded::Repost(inner));
            }
        }
        if let Some(inner) = self.quote {
            if Self::peek_id(inner).as_deref() != Some(self.id.as_str()) {
                out.push(Embedded::Quote(inner));
            }
        }
        out
    }
}

/// Reads scalar metadata fields, reporting object-shaped values.
struct FieldReader<'v, 'w> {
    value: &'v Value,
    id: &'w str,
    warnings: &'w mut Vec<ExtractionWarning>,
}

impl<'v> FieldReader<'v, '_> {
    fn scalar(&mut self, key: &str) -> Option<&'v Value> {
        let field = self.value.get(key).filter(|v| !v.is_null())?;
        if let Value::Object(map) = field {
            let mut keys: Vec<String> = map.keys().cloned().collect();
            keys.sort();
            let warning = ExtractionWarning::DictField {
                id: self.id.to_string(),
                field: key.to_string(),
                keys,
            };
            warn!("{warning}");
            self.warnings.push(warning);
            return None;
        }
        Some(field)
    }

    fn string(&mut self, key: &str) -> Option<String> {
        self.scalar(key).and_then(Value::as_str).map(String::from)
    }

    /// `x_str`, falling back to `x` rendered as a string.
    fn id_string(&mut self, key: &str) -> Option<String> {
        if let Some(value) = self.scalar(key).and_then(value_to_id) {
            return Some(value);
        }
        let bare = key.strip_suffix("_str")?;
        self.scalar(bare).and_then(value_to_id)
    }

    fn counter(&mut self, key: &str) -> Option<i64> {
        self.scalar(key).and_then(value_to_count)
    }
}

fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_to_count(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_entities(value: &Value, id: &str, field: &str) -> Entities {
    match serde_json::from_value(value.clone()) {
        Ok(entities) => entities,
        Err(e) => {
            warn!(post = id, field, error = %e, "Unreadable entity list, ignoring it");
            Entities::default()
        }
    }
}

fn parse_author(user: Option<&Value>) -> Author {
    let Some(user) = user.filter(|u| u.is_object()) else {
        return Author::default();
    };
    let string = |key: &str| user.get(key).and_then(Value::as_str).map(String::from);
    let count = |key: &str| user.get(key).and_then(value_to_count);

    let url = user
        .pointer("/entities/url/urls/0/expanded_url")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| string("url"));

    Author {
        id: RawPost::peek_id(user),
        screen_name: string("screen_name"),
        name: string("name"),
        followers: count("followers_count"),
        friends: count("friends_count"),
        statuses: count("statuses_count"),
        verified: user.get("verified").and_then(Value::as_bool),
        location: string("location"),
        description: string("description"),
        url,
    }
}

fn parse_coordinates(value: Option<&Value>) -> Option<(f64, f64)> {
    let coords = value?.get("coordinates")?.as_array()?;
    let lng = coords.first()?.as_f64()?;
    let lat = coords.get(1)?.as_f64()?;
    Some((lng, lat))
}

fn parse_place(value: Option<&Value>) -> Option<Place> {
    let place = value.filter(|p| p.is_object())?;
    let string = |key: &str| place.get(key).and_then(Value::as_str).map(String::from);
    Some(Place {
        country: string("country"),
        full_name: string("full_name"),
        place_type: string("place_type"),
    })
}

/// Split `<a href="URL" rel="nofollow">NAME</a>` into its parts.
fn parse_source(source: &str) -> (Option<String>, Option<String>) {
    SOURCE_RE.captures(source).map_or_else(
        || (None, Some(source.to_string()).filter(|s| !s.is_empty())),
        |caps| (Some(caps[1].to_string()), Some(caps[2].to_string())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_falls_back_to_number() {
        assert_eq!(RawPost::peek_id(&json!({"id": 42})).as_deref(), Some("42"));
        assert_eq!(
            RawPost::peek_id(&json!({"id_str": "7", "id": 42})).as_deref(),
            Some("7")
        );
        assert_eq!(RawPost::peek_id(&json!({"text": "x"})), None);
    }

    #[test]
    fn missing_id_is_invalid() {
        let mut warnings = Vec::new();
        let err = RawPost::from_value(&json!({"text": "x"}), &mut warnings).unwrap_err();
        assert!(matches!(err, XgError::InvalidPayload { .. }));
        let err = RawPost::from_value(&json!([1, 2]), &mut warnings).unwrap_err();
        assert!(matches!(err, XgError::InvalidPayload { .. }));
    }

    #[test]
    fn extended_tweet_overrides_text_and_entities() {
        let payload = json!({
            "id_str": "1",
            "text": "short…",
            "entities": {"hashtags": [{"text": "old"}]},
            "extended_tweet": {
                "full_text": "the full long text",
                "entities": {"hashtags": [{"text": "new"}]}
            }
        });
        let mut warnings = Vec::new();
        let post = RawPost::from_value(&payload, &mut warnings).unwrap();
        assert_eq!(post.text.as_deref(), Some("the full long text"));
        assert_eq!(post.entities.hashtags[0].text, "new");
    }

    #[test]
    fn str_suffix_falls_back_to_numeric_field() {
        let payload = json!({"id_str": "1", "in_reply_to_status_id": 99, "reply_count": "4"});
        let mut warnings = Vec::new();
        let post = RawPost::from_value(&payload, &mut warnings).unwrap();
        assert_eq!(post.in_reply_to_id.as_deref(), Some("99"));
        assert_eq!(post.reply_count, Some(4));
        assert_eq!(post.retweet_count, None);
    }

    #[test]
    fn dict_shaped_counter_is_reported() {
        let payload = json!({"id_str": "1", "retweet_count": {"b": 1, "a": 2}});
        let mut warnings = Vec::new();
        let post = RawPost::from_value(&payload, &mut warnings).unwrap();
        assert_eq!(post.retweet_count, None);
        assert_eq!(
            warnings,
            vec![ExtractionWarning::DictField {
                id: "1".to_string(),
                field: "retweet_count".to_string(),
                keys: vec!["a".to_string(), "b".to_string()],
            }]
        );
    }

    #[test]
    fn embedded_skips_self_reference() {
        let payload = json!({
            "id_str": "1",
            "retweeted_status": {"id_str": "1"},
            "quoted_status": {"id_str": "2"}
        });
        let mut warnings = Vec::new();
        let post = RawPost::from_value(&payload, &mut warnings).unwrap();
        let embedded = post.embedded();
        assert_eq!(embedded.len(), 1);
        assert!(matches!(embedded[0], Embedded::Quote(_)));
    }

    #[test]
    fn best_media_url_prefers_highest_bitrate() {
        let media: MediaEntity = serde_json::from_value(json!({
            "media_url_https": "https://pbs.example/thumb.jpg",
            "video_info": {"variants": [
                {"url": "https://video.example/low.mp4", "bitrate": 320},
                {"url": "https://video.example/playlist.m3u8"},
                {"url": "https://video.example/high.mp4", "bitrate": 2176}
            ]}
        }))
        .unwrap();
        assert_eq!(media.best_url(), Some("https://video.example/high.mp4"));
    }

    #[test]
    fn source_anchor_is_split() {
        assert_eq!(
            parse_source(r#"<a href="https://mobile.example" rel="nofollow">Example App</a>"#),
            (
                Some("https://mobile.example".to_string()),
                Some("Example App".to_string())
            )
        );
    }

    #[test]
    fn author_url_prefers_expanded_entity() {
        let author = parse_author(Some(&json!({
            "id": 5,
            "screen_name": "alice",
            "url": "https://t.co/abc",
            "entities": {"url": {"urls": [{"expanded_url": "https://alice.example"}]}}
        })));
        assert_eq!(author.id.as_deref(), Some("5"));
        assert_eq!(author.url.as_deref(), Some("https://alice.example"));
    }
}
