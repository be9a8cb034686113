//! xgrab - social post collector CLI
//!
//! Main entry point for the xgrab command-line tool.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use serde_json::Value;
use std::io::{self, Read};
use std::path::Path;
use tracing::{debug, info};

use xgrab::buckets::{CollectionKind, RetireMode, RetireOutcome};
use xgrab::cli::{BucketsAction, LinksAction};
use xgrab::links::StaticResolver;
use xgrab::logging::{LogConfig, OperationGuard, init_logging};
use xgrab::pipeline::read_payloads;
use xgrab::*;

/// Exit code for configuration problems the process cannot run past.
const EXIT_FATAL: i32 = 2;

struct App {
    config: Config,
    format: OutputFormat,
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        std::process::exit(report_error(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        return cmd_completions(args);
    }

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.store.db = Some(db.clone());
    }
    if !config.output.colors {
        colored::control::set_override(false);
    }
    let quiet = cli.quiet || config.output.quiet;
    init_logging(&LogConfig::from_flags(quiet, cli.verbose, config.output.colors));

    let format = match cli.format {
        Some(format) => format,
        None => config
            .output
            .format
            .parse::<OutputFormat>()
            .map_err(|e: String| XgError::config(format!("output.format: {e}")))?,
    };
    debug!(db = %config.db_path().display(), ?format, "Loaded configuration");

    let ctx = App {
        config,
        format,
        quiet,
    };

    match &cli.command {
        Commands::Ingest(args) => cmd_ingest(&ctx, args),
        Commands::Thread(args) => cmd_thread(&ctx, args),
        Commands::Get(args) => cmd_get(&ctx, args),
        Commands::Delete(args) => cmd_delete(&ctx, args),
        Commands::Count(args) => cmd_count(&ctx, args),
        Commands::Links(args) => cmd_links(&ctx, &args.action),
        Commands::Buckets(args) => cmd_buckets(&ctx, &args.action),
        Commands::Config(args) => cmd_config(&ctx, args),
        Commands::Completions(args) => cmd_completions(args),
    }
}

/// Print the error and pick the exit code.
fn report_error(err: &anyhow::Error) -> i32 {
    let xg = err.downcast_ref::<XgError>();
    let suggestions: Vec<&str> = xg.and_then(XgError::suggestion).into_iter().collect();
    let explanation = err
        .chain()
        .skip(1)
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ");
    eprintln!("{}", format_error(&err.to_string(), &explanation, &suggestions));
    if xg.is_some_and(XgError::is_fatal) {
        EXIT_FATAL
    } else {
        1
    }
}

/// Open the database, refusing to create one for read-only commands.
fn open_existing(ctx: &App) -> Result<Pipeline> {
    let db_path = ctx.config.db_path();
    if !db_path.exists() {
        anyhow::bail!(
            "No database found. Run 'xgrab ingest <FILE>' first.\n\
             Expected database at: {}",
            db_path.display()
        );
    }
    Ok(Pipeline::open(&ctx.config)?)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_input(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut content = String::new();
        io::stdin()
            .read_to_string(&mut content)
            .context("Failed to read payloads from stdin")?;
        return Ok(content);
    }
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read payloads from {}", path.display()))
}

fn cmd_ingest(ctx: &App, args: &cli::IngestArgs) -> Result<()> {
    let payloads = read_payloads(&read_input(&args.input)?)?;
    let pipeline = Pipeline::open(&ctx.config)?;
    let via = Provenance::from(args.via);
    let chunk_size = ctx.config.indexing.batch_size.max(1);

    let pb = if ctx.quiet || ctx.format == OutputFormat::Json {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(payloads.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
                .progress_chars("##-"),
        );
        pb
    };
    pb.set_message(format!("Ingesting ({via})..."));

    let guard = OperationGuard::new("ingest");
    let mut report = IngestReport::default();
    for (n, chunk) in payloads.chunks(chunk_size).enumerate() {
        match pipeline.ingest(chunk, via, pipeline.now()) {
            Ok(part) => report.merge(part, n * chunk_size),
            Err(e) => {
                pb.abandon();
                guard.fail(&e);
                return Err(e.into());
            }
        }
        pb.inc(chunk.len() as u64);
    }
    pb.finish_and_clear();
    guard.complete();

    if ctx.format == OutputFormat::Json {
        return print_json(&report);
    }
    if ctx.quiet {
        return Ok(());
    }

    println!(
        "{} Ingested {} payloads into {} records",
        "✓".green(),
        format_number_usize(report.payloads).cyan(),
        format_number_usize(report.records).cyan()
    );
    println!("  {:<10} {:>10}", "Success:", format_number_usize(report.bulk.success));
    println!("  {:<10} {:>10}", "Created:", format_number_usize(report.bulk.created));
    println!("  {:<10} {:>10}", "Skipped:", format_number_usize(report.bulk.skipped));
    println!("  {:<10} {:>10}", "Errors:", format_number_usize(report.bulk.errors.len()));
    if !report.warnings.is_empty() {
        println!(
            "  {} {} extraction warnings",
            "!".yellow(),
            format_number_usize(report.warnings.len())
        );
    }
    for rejected in &report.rejected {
        println!(
            "  {} payload #{}: {}",
            "✗".red(),
            rejected.index,
            rejected.reason.dimmed()
        );
    }
    for error in report.bulk.errors.iter().take(10) {
        println!(
            "  {} {} in {}: {}",
            "✗".red(),
            error.id,
            error.collection,
            error.reason.dimmed()
        );
    }
    Ok(())
}

fn cmd_thread(ctx: &App, args: &cli::ThreadArgs) -> Result<()> {
    let pipeline = open_existing(ctx)?;

    if args.records {
        let records = pipeline.threads().resolve_thread(args.ids.iter().cloned())?;
        if ctx.format == OutputFormat::Json {
            return print_json(&records);
        }
        if records.is_empty() {
            println!("{}", "No stored posts in this thread.".yellow());
            return Ok(());
        }
        for record in &records {
            print_record_line(record);
        }
        return Ok(());
    }

    let mut ids: Vec<String> = pipeline
        .threads()
        .resolve_thread_ids(args.ids.iter().cloned())?
        .into_iter()
        .collect();
    ids.sort();
    if ctx.format == OutputFormat::Json {
        return print_json(&ids);
    }
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

fn print_record_line(record: &Record) {
    let user = record.user_screen_name.as_deref().unwrap_or("?");
    println!(
        "{} {} {}",
        record.local_time.dimmed(),
        format!("@{user}").green(),
        truncate(&record.text.replace('\n', " "), 100)
    );
}

fn cmd_get(ctx: &App, args: &cli::GetArgs) -> Result<()> {
    let pipeline = open_existing(ctx)?;
    let record = pipeline
        .indexer()
        .find_record(&args.id)?
        .ok_or_else(|| XgError::not_found("post", &args.id))?;

    if ctx.format == OutputFormat::Json {
        return print_json(&record);
    }

    println!("{}", "─".repeat(CONTENT_DIVIDER_WIDTH));
    println!("{}", record.text);
    println!("{}", "─".repeat(CONTENT_DIVIDER_WIDTH));
    println!(
        "  ID: {}  Date: {}",
        record.id.dimmed(),
        record.local_time.dimmed()
    );
    if let Some(user) = &record.user_screen_name {
        println!("  Author: @{}", user.green());
    }
    println!("  URL: {}", record.url);
    println!(
        "  {} retweets  {} likes",
        record.retweet_count.to_string().cyan(),
        record.favorite_count.to_string().cyan()
    );
    if let Some(reply_to) = &record.in_reply_to_user {
        println!("  Reply to: @{}", reply_to.green());
    }
    if !record.hashtags.is_empty() {
        println!("  Hashtags: {}", record.hashtags.join(", ").blue());
    }
    let links = if record.proper_links.is_empty() {
        &record.links
    } else {
        &record.proper_links
    };
    for link in links {
        println!("  Link: {}", link.blue());
    }
    let via: Vec<&str> = record.collected_via.iter().map(|p| p.as_str()).collect();
    println!("  Collected via: {}", via.join(", ").dimmed());
    if record.deleted {
        println!("  {}", "Deleted by its author".red());
    }
    Ok(())
}

fn cmd_delete(ctx: &App, args: &cli::DeleteArgs) -> Result<()> {
    let pipeline = open_existing(ctx)?;
    let deleted = pipeline.indexer().set_deleted(&args.id)?;

    if ctx.format == OutputFormat::Json {
        return print_json(&serde_json::json!({"id": args.id, "deleted": deleted}));
    }
    if deleted {
        println!("{} Marked {} as deleted", "✓".green(), args.id);
    } else {
        println!("{}", format!("Post {} not found.", args.id).yellow());
    }
    Ok(())
}

/// Typed value for a term filter: booleans and integers as such.
fn parse_term_value(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => raw
            .parse::<i64>()
            .map_or_else(|_| Value::String(raw.to_string()), Value::from),
    }
}

fn cmd_count(ctx: &App, args: &cli::CountArgs) -> Result<()> {
    let pipeline = open_existing(ctx)?;
    let field = args.field.as_str();
    if !pipeline.buckets().mappings().records.has_field(field) {
        return Err(XgError::invalid_argument(format!("unknown record field '{field}'")).into());
    }
    let count = pipeline
        .indexer()
        .count_records(field, parse_term_value(&args.value))?;

    if ctx.format == OutputFormat::Json {
        return print_json(&serde_json::json!({
            "field": field,
            "value": args.value,
            "count": count,
        }));
    }
    println!("{}", format_number(count));
    Ok(())
}

fn cmd_links(ctx: &App, action: &LinksAction) -> Result<()> {
    let pipeline = open_existing(ctx)?;
    match action {
        LinksAction::Pending => {
            let pending = pipeline.links().pending(Utc::now())?;
            if ctx.format == OutputFormat::Json {
                return print_json(&pending);
            }
            if pending.is_empty() {
                println!("{}", "No records are waiting for links.".green());
            }
            for record in &pending {
                println!("{} {}", record.id.dimmed(), record.links.join(" "));
            }
        }
        LinksAction::Resolve { resolutions } => {
            let resolver = match resolutions {
                Some(path) => StaticResolver::from_path(path)?,
                None => StaticResolver::default(),
            };
            info!(known = resolver.len(), "Resolving pending links");
            let report = pipeline.resolve_links(&resolver, Utc::now())?;
            if ctx.format == OutputFormat::Json {
                return print_json(&report);
            }
            println!(
                "{} Resolved links for {} records ({} known, {} new links)",
                "✓".green(),
                format_number_usize(report.records).cyan(),
                format_number_usize(report.known_links),
                format_number_usize(report.new_links)
            );
            for error in &report.writes.errors {
                println!(
                    "  {} {} in {}: {}",
                    "✗".red(),
                    error.id,
                    error.collection,
                    error.reason.dimmed()
                );
            }
        }
    }
    Ok(())
}

fn cmd_buckets(ctx: &App, action: &BucketsAction) -> Result<()> {
    match action {
        BucketsAction::List => {
            let pipeline = open_existing(ctx)?;
            let buckets = pipeline.buckets();
            let store = buckets.store();
            let mut statuses = store.list(buckets.base_name())?;
            statuses.extend(
                store
                    .list(buckets.links_collection())?
                    .into_iter()
                    .filter(|s| s.name == buckets.links_collection()),
            );
            if ctx.format == OutputFormat::Json {
                return print_json(&statuses);
            }
            if statuses.is_empty() {
                println!("{}", "No buckets yet. Run 'xgrab buckets prepare'.".yellow());
                return Ok(());
            }
            for status in &statuses {
                let state = if status.open {
                    "open".green()
                } else {
                    "closed".red()
                };
                println!(
                    "  {:<32} {:>12}  {}",
                    status.name,
                    format_number(status.docs),
                    state
                );
            }
        }
        BucketsAction::Prepare => {
            let pipeline = Pipeline::open(&ctx.config)?;
            let created = pipeline.buckets().prepare(pipeline.now())?;
            if ctx.format == OutputFormat::Json {
                return print_json(&created);
            }
            if created.is_empty() {
                println!("{} All buckets already exist", "✓".green());
            }
            for name in &created {
                println!("{} Created {}", "✓".green(), name);
            }
        }
        BucketsAction::Close {
            names,
            delete,
            force,
        } => {
            let pipeline = open_existing(ctx)?;
            let mode = if *delete {
                RetireMode::Delete
            } else {
                RetireMode::Close
            };
            let reports = pipeline
                .buckets()
                .retire(names, mode, *force, pipeline.now())?;
            if ctx.format == OutputFormat::Json {
                return print_json(&reports);
            }
            for report in &reports {
                let outcome = match report.outcome {
                    RetireOutcome::Closed => "closed".green(),
                    RetireOutcome::Deleted => "deleted".green(),
                    RetireOutcome::Refused => "refused (inside retention window)".yellow(),
                    RetireOutcome::Missing => "missing".dimmed(),
                    RetireOutcome::Skipped => "skipped (monthly buckets disabled)".dimmed(),
                };
                println!("  {:<32} {}", report.name, outcome);
            }
        }
        BucketsAction::Position { position } => {
            let pipeline = open_existing(ctx)?;
            let name = pipeline
                .buckets()
                .positional_bucket((*position).into(), pipeline.now())?;
            if ctx.format == OutputFormat::Json {
                return print_json(&serde_json::json!({"bucket": name}));
            }
            println!("{name}");
        }
        BucketsAction::Drop { links, yes } => {
            if !*yes {
                anyhow::bail!("Refusing to drop without --yes");
            }
            let pipeline = open_existing(ctx)?;
            let kind = if *links {
                CollectionKind::Links
            } else {
                CollectionKind::Records
            };
            let dropped = pipeline.buckets().delete_collection(kind)?;
            if ctx.format == OutputFormat::Json {
                return print_json(&dropped);
            }
            if dropped.is_empty() {
                println!("{}", "Nothing to drop.".yellow());
            }
            for name in &dropped {
                println!("{} Dropped {}", "✓".green(), name);
            }
        }
    }
    Ok(())
}

fn cmd_config(ctx: &App, args: &cli::ConfigArgs) -> Result<()> {
    if args.init {
        match Config::user_config_path() {
            Some(path) if path.exists() => {
                println!(
                    "{} Config already exists at {}",
                    "!".yellow(),
                    path.display()
                );
            }
            _ => {
                let path = Config::default()
                    .save()
                    .context("Failed to write default configuration")?;
                println!("{} Wrote {}", "✓".green(), path.display());
            }
        }
    }

    if args.show || !args.init {
        if ctx.format == OutputFormat::Json {
            return print_json(&ctx.config);
        }
        println!("{}", "Current Configuration".bold().cyan());
        println!("  Database: {}", ctx.config.db_path().display());
        if let Some(path) = Config::user_config_path() {
            println!("  Config file: {}", path.display());
        }
        println!("{}", "─".repeat(CONTENT_DIVIDER_WIDTH));
        print!("{}", toml::to_string_pretty(&ctx.config)?);
    }
    Ok(())
}

fn cmd_completions(args: &cli::CompletionsArgs) -> Result<()> {
    let mut cmd = Cli::command();
    generate(args.shell, &mut cmd, "xgrab", &mut io::stdout());
    Ok(())
}
