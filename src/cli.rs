//! CLI definitions for xgrab.
//!
//! Uses clap for argument parsing with derive macros.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::buckets::BucketPosition;
use crate::model::Provenance;

/// xgrab - collect social posts into monthly document buckets
#[derive(Parser, Debug)]
#[command(name = "xgrab")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ingest social posts into time-bucketed document collections")]
#[command(long_about = r"
xgrab flattens raw post payloads from the search or streaming API into
canonical records and stores them in monthly buckets of a document store,
merging re-collected posts instead of overwriting them.

Quick start:
  1. Run: xgrab buckets prepare
  2. Run: xgrab ingest payloads.jsonl --via stream
  3. Run: xgrab thread <ID>
")]
pub struct Cli {
    /// Path to the database file
    #[arg(long, env = "XGRAB_DB", global = true)]
    pub db: Option<PathBuf>,

    /// Configuration file to use instead of ~/.config/xgrab/config.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'f', global = true)]
    pub format: Option<OutputFormat>,

    /// Be verbose (-vv for trace output)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Be quiet (suppress non-error output)
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Normalize and store raw post payloads
    Ingest(IngestArgs),

    /// Reconstruct the conversation around one or more posts
    Thread(ThreadArgs),

    /// Show one stored record
    Get(GetArgs),

    /// Flag a stored record as deleted
    Delete(DeleteArgs),

    /// Count records whose field equals a value
    Count(CountArgs),

    /// Resolve pending links
    Links(LinksArgs),

    /// Inspect and manage index buckets
    Buckets(BucketsArgs),

    /// Show or manage configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// File holding a JSON array or JSON lines of payloads ('-' for stdin)
    pub input: PathBuf,

    /// How the payloads were collected
    #[arg(long, default_value = "search")]
    pub via: Via,
}

#[derive(Args, Debug)]
pub struct ThreadArgs {
    /// Seed post ids
    #[arg(required = true)]
    pub ids: Vec<String>,

    /// Print full records instead of ids
    #[arg(long, short = 'r')]
    pub records: bool,
}

#[derive(Args, Debug)]
pub struct GetArgs {
    /// Post id
    pub id: String,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Post id
    pub id: String,
}

#[derive(Args, Debug)]
pub struct CountArgs {
    /// Record field, e.g. `user_screen_name` or `hashtags`
    pub field: String,

    /// Value to match; `true`, `false` and integers are typed
    pub value: String,
}

#[derive(Args, Debug)]
pub struct LinksArgs {
    #[command(subcommand)]
    pub action: LinksAction,
}

#[derive(Subcommand, Debug)]
pub enum LinksAction {
    /// List records waiting for link resolution
    Pending,

    /// Apply known resolutions to pending records
    Resolve {
        /// JSON object mapping original URLs to their destination
        #[arg(long, short = 'r')]
        resolutions: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
pub struct BucketsArgs {
    #[command(subcommand)]
    pub action: BucketsAction,
}

#[derive(Subcommand, Debug)]
pub enum BucketsAction {
    /// List buckets with document counts
    List,

    /// Create the buckets needed for the current month
    Prepare,

    /// Close (or delete) buckets past the retention horizon
    Close {
        /// Bucket names
        #[arg(required = true)]
        names: Vec<String>,

        /// Delete instead of closing
        #[arg(long)]
        delete: bool,

        /// Retire even inside the retention window
        #[arg(long)]
        force: bool,
    },

    /// Print the bucket at a position
    Position {
        /// Which bucket
        position: Position,
    },

    /// Delete every record bucket (or the links collection)
    Drop {
        /// Drop the links collection instead of the record buckets
        #[arg(long)]
        links: bool,

        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Show current configuration
    #[arg(long)]
    pub show: bool,

    /// Write a default config file to ~/.config/xgrab/config.toml
    #[arg(long)]
    pub init: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(s, true)
    }
}

/// Collection channel of an ingested batch.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Via {
    Search,
    Stream,
    Thread,
}

impl From<Via> for Provenance {
    fn from(via: Via) -> Self {
        match via {
            Via::Search => Self::Search,
            Via::Stream => Self::Stream,
            Via::Thread => Self::Thread,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Position {
    First,
    Last,
    Inactive,
}

impl From<Position> for BucketPosition {
    fn from(position: Position) -> Self {
        match position {
            Position::First => Self::First,
            Position::Last => Self::Last,
            Position::Inactive => Self::Inactive,
        }
    }
}
