//! Configuration system for xgrab.
//!
//! Provides layered configuration from multiple sources:
//!
//! 1. **Compiled defaults** - Sensible defaults built into the binary
//! 2. **User config file** - `~/.config/xgrab/config.toml` (or `--config`)
//! 3. **Environment variables** - `XGRAB_*` prefix
//! 4. **CLI arguments** - Highest priority, always wins
//!
//! # Example Configuration File
//!
//! ```toml
//! [store]
//! db = "~/.local/share/xgrab/xgrab.db"
//!
//! [collection]
//! db_name = "climate"
//! multi_index = true
//! retention_months = 6
//! timezone = "Europe/Paris"
//!
//! [indexing]
//! batch_size = 1000
//!
//! [links]
//! batch_size = 600
//! retry_days = 30
//!
//! [output]
//! format = "text"
//! colors = true
//! ```

use chrono::FixedOffset;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::buckets::BucketPolicy;
use crate::error::{Result, XgError};
use crate::model::Locale;

/// Main configuration structure for xgrab.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Document store location.
    pub store: StoreConfig,
    /// Collection naming and retention.
    pub collection: CollectionConfig,
    /// Bulk indexing behavior.
    pub indexing: IndexingConfig,
    /// Link-resolution queue.
    pub links: LinksConfig,
    /// Output formatting configuration.
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the `SQLite` document store.
    /// Environment variable: `XGRAB_DB`
    pub db: Option<PathBuf>,

    /// Mapping file replacing the compiled-in `db_mappings.json`.
    pub mappings: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Prefix of every collection name.
    /// Environment variable: `XGRAB_DB_NAME`
    pub db_name: String,

    /// One bucket per month instead of a single collection.
    /// Environment variable: `XGRAB_MULTI_INDEX`
    pub multi_index: bool,

    /// Months of records kept open; unset keeps everything.
    /// Environment variable: `XGRAB_RETENTION_MONTHS`
    pub retention_months: Option<u32>,

    /// Links collection name; defaults to `{db_name}_links`.
    pub links_collection: Option<String>,

    /// Zone for civil times: `UTC`, a fixed offset such as `+02:00`, or an
    /// IANA name such as `Europe/Paris`.
    /// Environment variable: `XGRAB_TIMEZONE`
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Operations per bulk request.
    /// Environment variable: `XGRAB_BATCH_SIZE`
    pub batch_size: usize,

    /// Normalize payloads in parallel.
    pub parallel: bool,

    /// Number of threads for parallel normalization (0 = auto).
    /// Environment variable: `XGRAB_THREADS`
    pub threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinksConfig {
    /// Records fetched per resolution pass.
    pub batch_size: usize,

    /// Only records younger than this many days are retried; 0 retries all.
    /// Environment variable: `XGRAB_RETRY_DAYS`
    pub retry_days: u32,
}

/// Output formatting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Default output format: text, json.
    pub format: String,

    /// Enable colored output.
    pub colors: bool,

    /// Suppress non-essential output (progress bars, etc.).
    pub quiet: bool,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            db_name: "xgrab".to_string(),
            multi_index: false,
            retention_months: None,
            links_collection: None,
            timezone: "UTC".to_string(),
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: crate::indexer::DEFAULT_BATCH_SIZE,
            parallel: true,
            threads: 0,
        }
    }
}

impl Default for LinksConfig {
    fn default() -> Self {
        Self {
            batch_size: 600,
            retry_days: 30,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: "text".to_string(),
            colors: true,
            quiet: false,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// `explicit` replaces the user config file; unlike the user file it
    /// must exist.
    ///
    /// # Errors
    ///
    /// Returns [`XgError::ConfigFile`] if a config file cannot be read or
    /// parsed, and [`XgError::Config`] if an environment override is
    /// malformed.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        let file = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(XgError::ConfigFile {
                        path: path.to_path_buf(),
                        reason: "file does not exist".to_string(),
                    });
                }
                Self::load_from_file(path)?
            }
            None => match Self::user_config_path() {
                Some(path) => Self::load_from_file(&path)?,
                None => None,
            },
        };
        if let Some(file) = file {
            config = file;
        }

        config.apply_env_overrides()?;
        config.validate()?;

        debug!("Configuration loaded: {:?}", config);
        Ok(config)
    }

    /// Load configuration from a specific file. A missing file is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`XgError::ConfigFile`] if the file exists but cannot be read
    /// or parsed.
    pub fn load_from_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            debug!("Config file not found: {}", path.display());
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| XgError::ConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config = toml::from_str(&content).map_err(|e| XgError::ConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        info!("Loaded config from: {}", path.display());
        Ok(Some(config))
    }

    /// Get the path to the user configuration file.
    #[must_use]
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("xgrab").join("config.toml"))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `XGRAB_*` overrides read through `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        // Store
        if let Some(db) = lookup("XGRAB_DB") {
            self.store.db = Some(PathBuf::from(db));
        }

        // Collection
        if let Some(name) = lookup("XGRAB_DB_NAME") {
            self.collection.db_name = name;
        }
        if let Some(flag) = lookup("XGRAB_MULTI_INDEX") {
            self.collection.multi_index = parse_flag("XGRAB_MULTI_INDEX", &flag)?;
        }
        if let Some(months) = lookup("XGRAB_RETENTION_MONTHS") {
            self.collection.retention_months = if months.trim().is_empty() {
                None
            } else {
                Some(parse_number("XGRAB_RETENTION_MONTHS", &months)?)
            };
        }
        if let Some(tz) = lookup("XGRAB_TIMEZONE") {
            self.collection.timezone = tz;
        }

        // Indexing
        if let Some(size) = lookup("XGRAB_BATCH_SIZE") {
            self.indexing.batch_size = parse_number("XGRAB_BATCH_SIZE", &size)?;
        }
        if let Some(threads) = lookup("XGRAB_THREADS") {
            self.indexing.threads = parse_number("XGRAB_THREADS", &threads)?;
        }

        // Links
        if let Some(days) = lookup("XGRAB_RETRY_DAYS") {
            self.links.retry_days = parse_number("XGRAB_RETRY_DAYS", &days)?;
        }

        // Output
        if let Some(format) = lookup("XGRAB_FORMAT") {
            self.output.format = format;
        }
        if lookup("XGRAB_NO_COLOR").is_some() || lookup("NO_COLOR").is_some() {
            self.output.colors = false;
        }
        if lookup("XGRAB_QUIET").is_some() {
            self.output.quiet = true;
        }
        Ok(())
    }

    /// Check values that would otherwise fail later, deep in a command.
    ///
    /// # Errors
    ///
    /// Returns [`XgError::Config`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.collection.db_name.trim().is_empty() {
            return Err(XgError::config("collection.db_name must not be empty"));
        }
        if self.indexing.batch_size == 0 {
            return Err(XgError::config("indexing.batch_size must be at least 1"));
        }
        if self.links.batch_size == 0 {
            return Err(XgError::config("links.batch_size must be at least 1"));
        }
        self.locale()?;
        Ok(())
    }

    /// The configured civil zone.
    ///
    /// # Errors
    ///
    /// Returns [`XgError::Config`] if the timezone is not `UTC`, a `±HH:MM`
    /// offset or a known IANA zone name.
    pub fn locale(&self) -> Result<Locale> {
        parse_locale(&self.collection.timezone)
    }

    /// Bucket layout for the lifecycle manager.
    #[must_use]
    pub fn bucket_policy(&self) -> BucketPolicy {
        BucketPolicy {
            db_name: self.collection.db_name.clone(),
            multi_index: self.collection.multi_index,
            retention_months: self.collection.retention_months,
            links_collection: self.collection.links_collection.clone(),
        }
    }

    /// Get the database path, using defaults if not configured.
    pub fn db_path(&self) -> PathBuf {
        self.store
            .db
            .clone()
            .unwrap_or_else(crate::default_db_path)
    }

    /// Save the current configuration to the user config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined,
    /// the parent directory cannot be created, or the file cannot be written.
    pub fn save(&self) -> std::io::Result<PathBuf> {
        let config_path = Self::user_config_path().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine config directory",
            )
        })?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        std::fs::write(&config_path, content)?;
        info!("Saved config to: {}", config_path.display());
        Ok(config_path)
    }

    /// Generate a default configuration file content.
    #[must_use]
    pub fn default_config_content() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(XgError::config(format!("{key}: expected a boolean, got '{other}'"))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| XgError::config(format!("{key}: expected a number, got '{value}'")))
}

/// Parse `UTC`, `Z`, `+HH:MM`, `-HHMM` or `+HH`.
fn parse_locale(raw: &str) -> Result<Locale> {
    let tz = raw.trim();
    if tz.is_empty() || tz.eq_ignore_ascii_case("utc") || tz.eq_ignore_ascii_case("z") {
        return Ok(Locale::Utc);
    }
    let invalid = || {
        XgError::config(format!(
            "invalid timezone '{raw}': use UTC, an offset like +02:00 or a zone like Europe/Paris"
        ))
    };

    let (sign, rest) = match tz.as_bytes().first() {
        Some(b'+') => (1, &tz[1..]),
        Some(b'-') => (-1, &tz[1..]),
        _ => return tz.parse::<Tz>().map(Locale::Named).map_err(|_| invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.as_str(), "0"),
        4 => digits.split_at(2),
        _ => return Err(invalid()),
    };
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }
    let seconds = sign * (hours * 3600 + minutes * 60);
    FixedOffset::east_opt(seconds)
        .map(Locale::Fixed)
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn with_env(pairs: &[(&str, &str)]) -> Result<Config> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).cloned())?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.collection.db_name, "xgrab");
        assert!(!config.collection.multi_index);
        assert_eq!(config.collection.retention_months, None);
        assert_eq!(config.indexing.batch_size, 1_000);
        assert_eq!(config.links.retry_days, 30);
        assert!(config.output.colors);
        assert_eq!(config.locale().unwrap(), Locale::Utc);
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.collection.retention_months = Some(6);
        let toml = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.collection.retention_months, Some(6));
        assert_eq!(parsed.indexing.batch_size, config.indexing.batch_size);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [collection]
            db_name = "climate"
            multi_index = true
            "#,
        )
        .unwrap();
        assert_eq!(parsed.collection.db_name, "climate");
        assert!(parsed.collection.multi_index);
        assert_eq!(parsed.collection.timezone, "UTC");
        assert_eq!(parsed.links.batch_size, 600);
    }

    #[test]
    fn test_env_overrides() {
        let config = with_env(&[
            ("XGRAB_DB", "/tmp/x.db"),
            ("XGRAB_DB_NAME", "elections"),
            ("XGRAB_MULTI_INDEX", "yes"),
            ("XGRAB_RETENTION_MONTHS", "3"),
            ("XGRAB_TIMEZONE", "+02:00"),
            ("XGRAB_BATCH_SIZE", "50"),
            ("NO_COLOR", "1"),
        ])
        .unwrap();
        assert_eq!(config.db_path(), PathBuf::from("/tmp/x.db"));
        assert_eq!(config.collection.db_name, "elections");
        assert!(config.collection.multi_index);
        assert_eq!(config.collection.retention_months, Some(3));
        assert_eq!(config.indexing.batch_size, 50);
        assert!(!config.output.colors);
        assert_eq!(
            config.locale().unwrap(),
            Locale::Fixed(FixedOffset::east_opt(7200).unwrap())
        );

        let policy = config.bucket_policy();
        assert_eq!(policy.db_name, "elections");
        assert_eq!(policy.retention_months, Some(3));
    }

    #[test]
    fn test_malformed_env_is_config_error() {
        let err = with_env(&[("XGRAB_BATCH_SIZE", "lots")]).unwrap_err();
        assert!(matches!(err, XgError::Config { .. }));
        assert!(with_env(&[("XGRAB_MULTI_INDEX", "maybe")]).is_err());
        assert!(with_env(&[("XGRAB_BATCH_SIZE", "0")]).is_err());
    }

    #[test]
    fn test_timezone_parsing() {
        assert_eq!(parse_locale("UTC").unwrap(), Locale::Utc);
        assert_eq!(
            parse_locale("+0530").unwrap(),
            Locale::Fixed(FixedOffset::east_opt(19_800).unwrap())
        );
        assert_eq!(
            parse_locale("-03").unwrap(),
            Locale::Fixed(FixedOffset::west_opt(10_800).unwrap())
        );
        assert_eq!(
            parse_locale("Europe/Paris").unwrap(),
            Locale::Named(chrono_tz::Europe::Paris)
        );
        assert!(parse_locale("+25:00").is_err());
        let err = with_env(&[("XGRAB_TIMEZONE", "Mars/Olympus")]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[links]\nretry_days = 0\n").unwrap();
        let config = Config::load_from_file(&path).unwrap().unwrap();
        assert_eq!(config.links.retry_days, 0);

        std::fs::write(&path, "[links\nbroken").unwrap();
        assert!(matches!(
            Config::load_from_file(&path).unwrap_err(),
            XgError::ConfigFile { .. }
        ));
        assert!(Config::load_from_file(&dir.path().join("absent.toml"))
            .unwrap()
            .is_none());
        assert!(Config::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_default_config_content() {
        let content = Config::default_config_content();
        assert!(content.contains("[store]"));
        assert!(content.contains("[collection]"));
        assert!(content.contains("[indexing]"));
        assert!(content.contains("[links]"));
        assert!(content.contains("[output]"));
    }
}
