//! Monthly bucket lifecycle.
//!
//! Records land in `{base}_{YYYY}_{MM}` chosen from their civil `local_time`,
//! or in a single `{base}` collection when monthly buckets are disabled.
//! Buckets are created one month ahead of need and retired once every record
//! they may hold is older than the retention horizon.

use std::sync::Arc;

use chrono::{Datelike, Months, NaiveDate, NaiveDateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, XgError};
use crate::mapping::MappingSet;
use crate::model::Locale;
use crate::store::DocumentStore;

/// First month worth preparing when no retention horizon is set.
const EPOCH_MONTH: (i32, u32) = (2006, 3);

/// Current civil time in the configured zone.
#[must_use]
pub fn civil_now(locale: Locale) -> NaiveDateTime {
    locale.civil(Utc::now())
}

/// How buckets are laid out and retired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketPolicy {
    pub db_name: String,
    pub multi_index: bool,
    /// Months of data to keep open; `None` keeps everything.
    pub retention_months: Option<u32>,
    /// Links collection name; defaults to `{db_name}_links`.
    pub links_collection: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireMode {
    Close,
    Delete,
}

impl RetireMode {
    const fn verb(self) -> &'static str {
        match self {
            Self::Close => "close",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetireOutcome {
    Closed,
    Deleted,
    /// Bucket may still hold records inside the retention horizon.
    Refused,
    Missing,
    /// Single-bucket mode; nothing to retire.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetireReport {
    pub name: String,
    pub outcome: RetireOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketPosition {
    First,
    Last,
    /// Newest bucket already past the retention horizon.
    Inactive,
}

impl std::str::FromStr for BucketPosition {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            "inactive" => Ok(Self::Inactive),
            _ => Err(format!("Invalid bucket position: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Records,
    Links,
}

/// Owns bucket naming, creation and retirement.
pub struct IndexLifecycleManager {
    store: Arc<dyn DocumentStore>,
    mappings: Arc<MappingSet>,
    base: String,
    links: String,
    multi_index: bool,
    retention_months: Option<u32>,
    prepared_month: Mutex<Option<(i32, u32)>>,
}

impl std::fmt::Debug for IndexLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexLifecycleManager")
            .field("base", &self.base)
            .field("links", &self.links)
            .field("multi_index", &self.multi_index)
            .field("retention_months", &self.retention_months)
            .finish_non_exhaustive()
    }
}

impl IndexLifecycleManager {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, mappings: Arc<MappingSet>, policy: &BucketPolicy) -> Self {
        let db_name = policy.db_name.replace(' ', "_");
        let links = policy
            .links_collection
            .clone()
            .unwrap_or_else(|| format!("{db_name}_links"));
        Self {
            store,
            mappings,
            base: format!("{db_name}_tweets"),
            links,
            multi_index: policy.multi_index,
            retention_months: policy.retention_months,
            prepared_month: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn base_name(&self) -> &str {
        &self.base
    }

    #[must_use]
    pub fn links_collection(&self) -> &str {
        &self.links
    }

    #[must_use]
    pub const fn multi_index(&self) -> bool {
        self.multi_index
    }

    #[must_use]
    pub const fn retention_months(&self) -> Option<u32> {
        self.retention_months
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    #[must_use]
    pub fn mappings(&self) -> &MappingSet {
        &self.mappings
    }

    /// Bucket holding a record with this civil `local_time`.
    ///
    /// # Errors
    ///
    /// Returns [`XgError::InvalidPayload`] if `local_time` does not start with
    /// `YYYY-MM`.
    pub fn bucket_for(&self, local_time: &str) -> Result<String> {
        if !self.multi_index {
            return Ok(self.base.clone());
        }
        let (year, month) = parse_year_month(local_time)
            .ok_or_else(|| XgError::invalid_payload(format!("invalid local_time '{local_time}'")))?;
        Ok(self.month_bucket(year, month))
    }

    fn month_bucket(&self, year: i32, month: u32) -> String {
        format!("{}_{year:04}_{month:02}", self.base)
    }

    /// Create every bucket that may receive records at `now`, plus the links
    /// collection. Returns the names actually created.
    ///
    /// # Errors
    ///
    /// Returns an error if the store refuses a create.
    pub fn prepare(&self, now: NaiveDateTime) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if self.multi_index {
            let this_month = first_of_month(now.date());
            let ahead = this_month
                .checked_add_months(Months::new(1))
                .unwrap_or(this_month);
            let count = self.retention_months.map_or_else(
                || months_between(EPOCH_MONTH, (ahead.year(), ahead.month())) + 1,
                |m| m + 2,
            );
            for back in 0..count {
                let Some(day) = ahead.checked_sub_months(Months::new(back)) else {
                    break;
                };
                names.push(self.month_bucket(day.year(), day.month()));
            }
        } else {
            names.push(self.base.clone());
        }

        let mut created = Vec::new();
        for name in names {
            if self.store.create(&name, &self.mappings.records)? {
                created.push(name);
            }
        }
        if self.store.create(&self.links, &self.mappings.links)? {
            created.push(self.links.clone());
        }

        if created.is_empty() {
            debug!(base = %self.base, "All buckets already present");
        } else {
            info!(base = %self.base, created = created.len(), "Prepared buckets");
        }
        *self.prepared_month.lock() = Some((now.year(), now.month()));
        Ok(created)
    }

    /// Re-run [`Self::prepare`] when the civil month changed since the last
    /// run. Returns whether a prepare happened.
    ///
    /// # Errors
    ///
    /// Returns an error if preparing fails.
    pub fn ensure_current(&self, now: NaiveDateTime) -> Result<bool> {
        let month = (now.year(), now.month());
        if *self.prepared_month.lock() == Some(month) {
            return Ok(false);
        }
        self.prepare(now)?;
        Ok(true)
    }

    /// Whether `instant` falls before the retention horizon at `now`.
    #[must_use]
    pub fn is_too_old(&self, instant: NaiveDateTime, now: NaiveDateTime) -> bool {
        self.retention_months
            .and_then(|m| now.checked_sub_months(Months::new(m)))
            .is_some_and(|horizon| instant < horizon)
    }

    /// Close or delete the named buckets.
    ///
    /// A bucket is retired only if the last day of its month (at `now`'s
    /// clock time) is past the retention horizon, or `force` is set.
    ///
    /// # Errors
    ///
    /// Returns [`XgError::MalformedBucketName`] for a name that is not
    /// `{base}_YYYY_MM`; nothing after it is processed.
    pub fn retire(
        &self,
        names: &[String],
        mode: RetireMode,
        force: bool,
        now: NaiveDateTime,
    ) -> Result<Vec<RetireReport>> {
        if !self.multi_index {
            warn!(
                base = %self.base,
                "Monthly buckets are disabled, nothing to {}",
                mode.verb()
            );
            return Ok(names
                .iter()
                .map(|name| RetireReport {
                    name: name.clone(),
                    outcome: RetireOutcome::Skipped,
                })
                .collect());
        }

        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            let (year, month) = self.parse_bucket_name(name)?;
            let last_day = last_day_of_month(year, month).ok_or_else(|| XgError::MalformedBucketName {
                name: name.clone(),
                base: self.base.clone(),
            })?;
            let horizon_check = last_day.and_time(now.time());
            let bucket = self.month_bucket(year, month);

            let outcome = if !(force || self.is_too_old(horizon_check, now)) {
                match self.retention_months {
                    Some(months) => warn!(
                        "{bucket} may contain posts from less than {months} months ago, use --force to {} it anyway",
                        mode.verb()
                    ),
                    None => warn!(
                        "No retention horizon is configured, use --force to {} {bucket}",
                        mode.verb()
                    ),
                }
                RetireOutcome::Refused
            } else if !self.store.exists(&bucket)? {
                warn!("{bucket} does not exist and could not be {}d", mode.verb());
                RetireOutcome::Missing
            } else {
                match mode {
                    RetireMode::Close => {
                        self.store.close(&bucket)?;
                        info!("{bucket} successfully closed");
                        RetireOutcome::Closed
                    }
                    RetireMode::Delete => {
                        self.store.delete(&bucket)?;
                        info!("{bucket} successfully deleted");
                        RetireOutcome::Deleted
                    }
                }
            };
            reports.push(RetireReport {
                name: bucket,
                outcome,
            });
        }
        Ok(reports)
    }

    fn parse_bucket_name(&self, name: &str) -> Result<(i32, u32)> {
        let malformed = || XgError::MalformedBucketName {
            name: name.to_string(),
            base: self.base.clone(),
        };
        let suffix = name
            .strip_prefix(&self.base)
            .and_then(|rest| rest.strip_prefix('_'))
            .unwrap_or(name);
        let (year, month) = suffix.split_once('_').ok_or_else(malformed)?;
        let year: i32 = year.parse().map_err(|_| malformed())?;
        let month: u32 = month.parse().map_err(|_| malformed())?;
        if !(1..=12).contains(&month) {
            return Err(malformed());
        }
        Ok((year, month))
    }

    /// Open record buckets, sorted by name. Enumerated fresh on every call.
    ///
    /// # Errors
    ///
    /// Returns an error if the store listing fails.
    pub fn record_buckets(&self) -> Result<Vec<String>> {
        let nested = format!("{}_", self.base);
        Ok(self
            .store
            .list(&self.base)?
            .into_iter()
            .filter(|b| b.open && (b.name == self.base || b.name.starts_with(&nested)))
            .map(|b| b.name)
            .collect())
    }

    /// Bucket at a position among open, non-empty buckets.
    ///
    /// # Errors
    ///
    /// Returns [`XgError::InvalidArgument`] in single-bucket mode or, for
    /// `Inactive`, without a retention horizon; [`XgError::NotFound`] when no
    /// bucket qualifies.
    pub fn positional_bucket(&self, position: BucketPosition, now: NaiveDateTime) -> Result<String> {
        if !self.multi_index {
            return Err(XgError::invalid_argument(
                "monthly buckets are disabled, bucket positions are meaningless",
            ));
        }
        let nested = format!("{}_", self.base);
        let populated: Vec<String> = self
            .store
            .list(&nested)?
            .into_iter()
            .filter(|b| b.open && b.docs > 0)
            .map(|b| b.name)
            .collect();

        match position {
            BucketPosition::First => populated
                .first()
                .cloned()
                .ok_or_else(|| XgError::not_found("bucket", "first")),
            BucketPosition::Last => populated
                .last()
                .cloned()
                .ok_or_else(|| XgError::not_found("bucket", "last")),
            BucketPosition::Inactive => {
                let months = self.retention_months.ok_or_else(|| {
                    XgError::invalid_argument(
                        "no retention horizon is configured, every bucket is active",
                    )
                })?;
                let day = now
                    .date()
                    .checked_sub_months(Months::new(months + 1))
                    .ok_or_else(|| XgError::invalid_argument("retention horizon out of range"))?;
                let name = self.month_bucket(day.year(), day.month());
                if populated.contains(&name) {
                    Ok(name)
                } else {
                    Err(XgError::not_found("open bucket", name))
                }
            }
        }
    }

    /// Delete every record bucket, or the links collection.
    ///
    /// # Errors
    ///
    /// Returns an error if a store delete fails.
    pub fn delete_collection(&self, kind: CollectionKind) -> Result<Vec<String>> {
        let targets: Vec<String> = match kind {
            CollectionKind::Links => {
                if self.store.exists(&self.links)? {
                    vec![self.links.clone()]
                } else {
                    Vec::new()
                }
            }
            CollectionKind::Records => {
                let nested = format!("{}_", self.base);
                self.store
                    .list(&self.base)?
                    .into_iter()
                    .filter(|b| b.name == self.base || b.name.starts_with(&nested))
                    .map(|b| b.name)
                    .collect()
            }
        };
        if targets.is_empty() {
            warn!(base = %self.base, "Nothing to delete for {kind:?}");
        }
        for name in &targets {
            self.store.delete(name)?;
            info!("{name} successfully deleted");
        }
        *self.prepared_month.lock() = None;
        Ok(targets)
    }
}

fn parse_year_month(local_time: &str) -> Option<(i32, u32)> {
    let year: i32 = local_time.get(0..4)?.parse().ok()?;
    if local_time.get(4..5)? != "-" {
        return None;
    }
    let month: u32 = local_time.get(5..7)?.parse().ok()?;
    (1..=12).contains(&month).then_some((year, month))
}

fn first_of_month(day: NaiveDate) -> NaiveDate {
    day.with_day(1).unwrap_or(day)
}

fn months_between(from: (i32, u32), to: (i32, u32)) -> u32 {
    let diff = (to.0 - from.0) * 12 + (i32::try_from(to.1).unwrap_or(0) - i32::try_from(from.1).unwrap_or(0));
    u32::try_from(diff).unwrap_or(0)
}

fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = first.checked_add_months(Months::new(1))?;
    next.pred_opt()
}
