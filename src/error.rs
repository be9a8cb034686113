//! Custom error types for xgrab.
//!
//! Fatal configuration problems, recoverable lookups, and the non-fatal
//! diagnostics produced while flattening payloads all live here so callers
//! can decide programmatically whether to stop, skip, or just log.

use std::path::PathBuf;
use thiserror::Error;

/// Primary error type for xgrab operations.
#[derive(Error, Debug)]
pub enum XgError {
    // =========================================================================
    // Configuration Errors (fatal)
    // =========================================================================
    /// Configuration value is missing or malformed.
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    /// Configuration file could not be parsed.
    #[error("Invalid configuration in '{path}': {reason}")]
    ConfigFile { path: PathBuf, reason: String },

    /// The collection mapping document is missing or malformed.
    #[error("Could not load collection mappings: {reason}")]
    MissingMapping { reason: String },

    /// A bucket name does not follow `{base}_{YYYY}_{MM}`.
    #[error("Malformed bucket name '{name}': buckets must be named {base}_YYYY_MM")]
    MalformedBucketName { name: String, base: String },

    // =========================================================================
    // Payload Errors
    // =========================================================================
    /// Raw payload cannot be turned into a record at all.
    #[error("Invalid payload: {reason}")]
    InvalidPayload { reason: String },

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Target collection does not exist.
    #[error("Collection '{name}' does not exist")]
    CollectionMissing { name: String },

    /// Target collection exists but is closed.
    #[error("Collection '{name}' is closed")]
    CollectionClosed { name: String },

    /// Data not found.
    #[error("{item_type} with ID '{id}' not found")]
    NotFound { item_type: &'static str, id: String },

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    /// Document (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    /// File read/write error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Path-specific IO error with context.
    #[error("Failed to {operation} '{path}': {source}")]
    PathError {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // CLI Errors
    // =========================================================================
    /// Invalid command-line argument.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Wrapped anyhow error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for xgrab operations.
pub type Result<T> = std::result::Result<T, XgError>;

impl XgError {
    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create an invalid payload error.
    pub fn invalid_payload(reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(item_type: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            item_type,
            id: id.into(),
        }
    }

    /// Create a path error with context.
    pub fn path_error(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::PathError {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Configuration problems the process cannot continue past.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::ConfigFile { .. }
                | Self::MissingMapping { .. }
                | Self::MalformedBucketName { .. }
        )
    }

    /// Check if this error is expected during normal operation.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::InvalidPayload { .. }
                | Self::CollectionMissing { .. }
                | Self::CollectionClosed { .. }
                | Self::InvalidArgument { .. }
        )
    }

    /// Get a suggestion for how to fix this error, if applicable.
    #[must_use]
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::ConfigFile { .. } | Self::Config { .. } => {
                Some("Check ~/.config/xgrab/config.toml or run 'xgrab config --init'.")
            }
            Self::MissingMapping { .. } => {
                Some("Reinstall xgrab: data/db_mappings.json is compiled into the binary.")
            }
            Self::MalformedBucketName { .. } => {
                Some("List existing buckets with 'xgrab buckets list'.")
            }
            Self::CollectionMissing { .. } => {
                Some("Run 'xgrab buckets prepare' to create the collections.")
            }
            Self::CollectionClosed { .. } => {
                Some("Closed buckets are read-only; reopen or re-create them in the store.")
            }
            _ => None,
        }
    }
}

/// Non-fatal problems found while flattening one payload.
///
/// The record is still produced; these are returned next to it and logged.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionWarning {
    /// Payload carried no text at all.
    MissingText { id: String },
    /// A URL entity was not found verbatim in the text.
    UnsubstitutedEntity { id: String, url: String },
    /// A metadata field held an object where a scalar was expected.
    DictField {
        id: String,
        field: String,
        keys: Vec<String>,
    },
}

impl std::fmt::Display for ExtractionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingText { id } => write!(f, "no text for post {id}"),
            Self::UnsubstitutedEntity { id, url } => {
                write!(f, "entity {url} not found in text of post {id}")
            }
            Self::DictField { id, field, keys } => write!(
                f,
                "field {field} of post {id} is a dict ({}), it will not be indexed",
                keys.join(" ")
            ),
        }
    }
}

// =============================================================================
// CLI Error Formatting
// =============================================================================

use colored::Colorize;

/// Format a structured CLI error with explanation and suggestions.
#[must_use]
pub fn format_error(title: &str, explanation: &str, suggestions: &[&str]) -> String {
    use std::fmt::Write;

    let mut output = format!("{} {}", "✗".red().bold(), title.bold());

    if !explanation.is_empty() {
        let _ = write!(output, "\n\n   {explanation}");
    }

    if !suggestions.is_empty() {
        output.push_str("\n\n   ");
        if suggestions.len() == 1 {
            let _ = write!(output, "{} {}", "Hint:".cyan(), suggestions[0]);
        } else {
            let _ = write!(output, "{}:", "Try".cyan());
            for suggestion in suggestions {
                let _ = write!(output, "\n     {} {}", "•".dimmed(), suggestion);
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = XgError::MalformedBucketName {
            name: "gazou_tweets_2024".to_string(),
            base: "gazou_tweets".to_string(),
        };
        assert!(err.to_string().contains("gazou_tweets_2024"));
        assert!(err.is_fatal());
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn test_not_found_is_recoverable() {
        let err = XgError::not_found("record", "42");
        assert!(err.is_recoverable());
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "record with ID '42' not found");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: XgError = io_err.into();
        assert!(matches!(err, XgError::IoError(_)));
    }

    #[test]
    fn test_from_rusqlite_error() {
        fn accepts(_: XgError) {}
        accepts(rusqlite::Error::InvalidQuery.into());
    }

    #[test]
    fn test_collection_errors_are_recoverable() {
        let err = XgError::CollectionClosed {
            name: "a_tweets_2024_01".to_string(),
        };
        assert_eq!(err.to_string(), "Collection 'a_tweets_2024_01' is closed");
        assert!(err.is_recoverable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_warning_display() {
        let warning = ExtractionWarning::DictField {
            id: "1".to_string(),
            field: "retweet_count".to_string(),
            keys: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            warning.to_string(),
            "field retweet_count of post 1 is a dict (a b), it will not be indexed"
        );
    }

    #[test]
    fn format_error_multiple_suggestions() {
        let output = format_error(
            "Test Error",
            "Something went wrong",
            &["First option", "Second option"],
        );
        assert!(output.contains("Something went wrong"));
        assert!(output.contains("First option"));
        assert!(output.contains("Second option"));
    }
}
