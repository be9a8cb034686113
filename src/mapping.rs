//! Versioned collection mappings.
//!
//! The record and link collections are created from `data/db_mappings.json`,
//! compiled into the binary. A different file can be supplied through
//! `store.mappings` in the config.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, XgError};

const DEFAULT_MAPPINGS: &str = include_str!("../data/db_mappings.json");

/// Field mapping of one collection kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    #[serde(default)]
    pub settings: Value,
    pub mappings: FieldMappings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMappings {
    pub properties: BTreeMap<String, Value>,
}

impl CollectionSchema {
    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.mappings.properties.contains_key(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.mappings.properties.keys().map(String::as_str)
    }

    /// Drop every top-level key that is not a mapped field.
    #[must_use]
    pub fn project(&self, document: Value) -> Value {
        match document {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .filter(|(key, _)| self.has_field(key))
                    .collect(),
            ),
            other => other,
        }
    }
}

#[derive(Deserialize)]
struct MappingFile {
    version: u32,
    tweets_mapping: Option<CollectionSchema>,
    links_mapping: Option<CollectionSchema>,
}

/// Record and link mappings, loaded once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingSet {
    pub version: u32,
    pub records: CollectionSchema,
    pub links: CollectionSchema,
}

impl MappingSet {
    /// The compiled-in mappings.
    ///
    /// # Errors
    ///
    /// Returns [`XgError::MissingMapping`] if the embedded file is invalid.
    pub fn load() -> Result<Self> {
        Self::parse(DEFAULT_MAPPINGS)
    }

    /// Load mappings from a file on disk.
    ///
    /// # Errors
    ///
    /// Returns [`XgError::MissingMapping`] if the file is unreadable or
    /// malformed.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| XgError::MissingMapping {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::parse(&content)
    }

    /// Parse and validate a mapping document.
    ///
    /// # Errors
    ///
    /// Returns [`XgError::MissingMapping`] if either mapping is absent or
    /// has no fields.
    pub fn parse(content: &str) -> Result<Self> {
        let file: MappingFile =
            serde_json::from_str(content).map_err(|e| XgError::MissingMapping {
                reason: format!("malformed mapping file: {e}"),
            })?;

        let records = require(file.tweets_mapping, "tweets_mapping")?;
        let links = require(file.links_mapping, "links_mapping")?;
        if !records.has_field("id") {
            return Err(XgError::MissingMapping {
                reason: "tweets_mapping has no id field".to_string(),
            });
        }
        if !links.has_field("url") {
            return Err(XgError::MissingMapping {
                reason: "links_mapping has no url field".to_string(),
            });
        }

        Ok(Self {
            version: file.version,
            records,
            links,
        })
    }
}

fn require(schema: Option<CollectionSchema>, name: &str) -> Result<CollectionSchema> {
    match schema {
        Some(schema) if !schema.mappings.properties.is_empty() => Ok(schema),
        Some(_) => Err(XgError::MissingMapping {
            reason: format!("{name} declares no properties"),
        }),
        None => Err(XgError::MissingMapping {
            reason: format!("{name} is missing"),
        }),
    }
}
