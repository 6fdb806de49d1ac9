//! The migration pass: read every event row, re-host its icon, rewrite the row.
//!
//! Rows are handled strictly one after another. Each row ends in exactly one
//! [`RowOutcome`]; failures inside a row never escape it. Only failures while
//! scoping the schema or selecting the rows abort the run, and even then the
//! database connection is closed and the summary is logged before returning.

use crate::database_ops::events::{EventIconRow, EventStore};
use crate::fetch::IconFetcher;
use crate::progress::Progress;
use crate::sniff;
use crate::storage::{icon_object_key, ObjectStore};
use anyhow::Result;
use std::fmt;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct MigrateOptions {
    pub schema: String,
    /// Fetch and classify every row but write nothing.
    pub dry_run: bool,
}

/// Why a row was deliberately skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    NoIcon,
    NoImageType,
    UnsupportedExtension { ext: String, mime: String },
    SameUrl,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::NoIcon => write!(f, "no icon"),
            IgnoreReason::NoImageType => write!(f, "no image type"),
            IgnoreReason::UnsupportedExtension { ext, mime } => {
                write!(f, "unsupported extension {ext} and type {mime}")
            }
            IgnoreReason::SameUrl => write!(f, "same url"),
        }
    }
}

/// Terminal disposition of one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Migrated { url: String },
    Ignored(IgnoreReason),
    Errored { message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub total: usize,
    pub completed: usize,
    pub ignored: usize,
    pub ignored_ids: Vec<i64>,
    /// Rows that failed unexpectedly. Not part of `completed` or `ignored`.
    pub errored_ids: Vec<i64>,
}

impl MigrationReport {
    pub fn processed(&self) -> usize {
        self.completed + self.ignored
    }

    fn record(&mut self, id: i64, outcome: &RowOutcome) {
        match outcome {
            RowOutcome::Migrated { .. } => self.completed += 1,
            RowOutcome::Ignored(_) => {
                self.ignored += 1;
                self.ignored_ids.push(id);
            }
            RowOutcome::Errored { .. } => self.errored_ids.push(id),
        }
    }
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Wires the run's dependencies together. Construct once per run.
pub struct Migrator<'a, S, F, O> {
    store: S,
    fetcher: &'a F,
    bucket: &'a O,
    progress: &'a mut dyn Progress,
    options: MigrateOptions,
}

impl<'a, S, F, O> Migrator<'a, S, F, O>
where
    S: EventStore,
    F: IconFetcher,
    O: ObjectStore,
{
    pub fn new(
        store: S,
        fetcher: &'a F,
        bucket: &'a O,
        progress: &'a mut dyn Progress,
        options: MigrateOptions,
    ) -> Self {
        Self {
            store,
            fetcher,
            bucket,
            progress,
            options,
        }
    }

    /// Run the whole pass. The store is closed exactly once before returning,
    /// whichever way the run ends.
    pub async fn run(mut self) -> Result<MigrationReport> {
        let mut report = MigrationReport::default();
        let outcome = self.migrate_all(&mut report).await;

        if let Err(e) = &outcome {
            error!(error = %format!("{e:#}"), "error during migration");
        }
        if let Err(e) = self.store.close().await {
            warn!(error = %format!("{e:#}"), "failed to close database connection");
        }
        self.progress.finish();
        self.progress.log(&format!(
            "Ignored {} rows: with Ids: [{}]",
            report.ignored,
            join_ids(&report.ignored_ids)
        ));
        if !report.errored_ids.is_empty() {
            self.progress.log(&format!(
                "Errored {} rows: with Ids: [{}]",
                report.errored_ids.len(),
                join_ids(&report.errored_ids)
            ));
        }

        outcome.map(|_| report)
    }

    async fn migrate_all(&mut self, report: &mut MigrationReport) -> Result<()> {
        self.store.set_schema(&self.options.schema).await?;
        let rows = self.store.select_candidates().await?;
        report.total = rows.len();
        self.progress.log(&format!("Found {} rows", rows.len()));
        self.progress.start(rows.len(), 0);

        for row in &rows {
            let outcome = self.migrate_row(row).await;
            report.record(row.id, &outcome);
            match &outcome {
                RowOutcome::Migrated { url } => {
                    if self.options.dry_run {
                        self.progress
                            .log(&format!("Would migrate row {} to {}", row.id, url));
                    }
                    self.progress.update(report.processed());
                }
                RowOutcome::Ignored(reason) => {
                    self.progress
                        .log(&format!("Ignoring row {} with {}", row.id, reason));
                    self.progress.update(report.processed());
                }
                RowOutcome::Errored { message } => {
                    warn!(row_id = row.id, error = %message, "Error during row {}: {}", row.id, message);
                }
            }
        }

        self.progress.log("Migration complete");
        info!(
            total = report.total,
            completed = report.completed,
            ignored = report.ignored,
            errored = report.errored_ids.len(),
            dry_run = self.options.dry_run,
            "migration finished"
        );
        Ok(())
    }

    async fn migrate_row(&mut self, row: &EventIconRow) -> RowOutcome {
        let Some(icon) = row.icon_url() else {
            return RowOutcome::Ignored(IgnoreReason::NoIcon);
        };
        match self.rehost_icon(row.id, icon).await {
            Ok(outcome) => outcome,
            Err(e) => RowOutcome::Errored {
                message: format!("{e:#}"),
            },
        }
    }

    async fn rehost_icon(&mut self, id: i64, icon: &str) -> Result<RowOutcome> {
        let bytes = self.fetcher.fetch(icon).await?;

        let Some(image_type) = sniff::detect(&bytes) else {
            return Ok(RowOutcome::Ignored(IgnoreReason::NoImageType));
        };
        if !image_type.is_supported() {
            return Ok(RowOutcome::Ignored(IgnoreReason::UnsupportedExtension {
                ext: image_type.ext.to_string(),
                mime: image_type.mime.to_string(),
            }));
        }

        let key = icon_object_key(id, image_type.ext);
        let url = self.bucket.public_url(&key);
        if icon == url {
            return Ok(RowOutcome::Ignored(IgnoreReason::SameUrl));
        }

        if !self.options.dry_run {
            self.bucket
                .write_object(&key, bytes, image_type.mime)
                .await?;
            self.store.update_icon(id, &url).await?;
        }
        Ok(RowOutcome::Migrated { url })
    }
}
