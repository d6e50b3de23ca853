//! Bulk import pipeline
//!
//! Imports one interval file, an optional cell file and one signal file
//! into a single transaction. Stages run strictly in order (intervals,
//! cells, signals, finalize) and any fatal error rolls the whole import
//! back, so a failed job leaves no rows behind.
//!
//! Files are parsed on a blocking thread and handed to the writer in
//! batches over a bounded channel.

use crate::dedup::DedupIndex;
use crate::errors::IngestionError;
use crate::locks::ImportLocks;
use crate::parser::{
    CellRecord, CellRef, IntervalRecord, IntervalRef, ParseCounters, ParsePolicy, RowOutcome,
    RowSchema, RowSource, SignalRecord,
};
use bminty_common::config::ImportConfig;
use bminty_common::db::models::*;
use bminty_common::db::Repository;
use bminty_common::errors::AppError;
use bminty_common::jobs::{ImportSummary, JobHandle, JobPhase, PhaseProgress, ProgressSink};
use bminty_common::metrics;
use regex_lite::Regex;
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, DatabaseTransaction, DbBackend, EntityTrait, Set,
    Statement,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, instrument, warn};

/// Flags of one import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    pub omit_zero_signals: bool,
    pub ignore_optional_type_errors: bool,
    pub ignore_row_errors: bool,
    pub deduplicate_intervals: bool,
}

impl ImportOptions {
    pub fn policy(&self) -> ParsePolicy {
        ParsePolicy {
            ignore_row_errors: self.ignore_row_errors,
            ignore_optional_type_errors: self.ignore_optional_type_errors,
        }
    }
}

/// Files and targets of one import
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub assembly_id: i64,
    pub assay_id: i64,
    pub interval_file: PathBuf,
    pub cell_file: Option<PathBuf>,
    pub signal_file: PathBuf,
    pub options: ImportOptions,
}

/// Whether an assay measures individual cells or spots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssayKind {
    Bulk,
    CellResolved,
}

impl AssayKind {
    /// Classify an assay by its `type`
    pub fn from_type(kind: &str) -> Self {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(r"(?i)^sc|single|spatial|srt|visium").expect("assay type pattern is valid")
        });
        if pattern.is_match(kind) {
            AssayKind::CellResolved
        } else {
            AssayKind::Bulk
        }
    }

    pub fn is_cell_resolved(&self) -> bool {
        matches!(self, AssayKind::CellResolved)
    }
}

#[derive(Debug, Clone, Copy)]
struct ImportSettings {
    progress_every: u64,
    batch_size: usize,
    channel_capacity: usize,
}

impl From<&ImportConfig> for ImportSettings {
    fn from(config: &ImportConfig) -> Self {
        Self {
            progress_every: config.progress_interval_rows.max(1) as u64,
            batch_size: config.signal_batch_size.max(1),
            channel_capacity: config.channel_capacity.max(1),
        }
    }
}

/// Runs bulk imports against the catalog
#[derive(Clone)]
pub struct BulkImporter {
    repo: Repository,
    locks: ImportLocks,
    settings: ImportSettings,
}

impl BulkImporter {
    pub fn new(repo: Repository, locks: ImportLocks, config: &ImportConfig) -> Self {
        Self {
            repo,
            locks,
            settings: ImportSettings::from(config),
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Run an import and record its outcome in a job status document
    pub async fn run_tracked(
        &self,
        request: &ImportRequest,
        job: &JobHandle,
    ) -> Result<ImportSummary, IngestionError> {
        match self.run(request, job).await {
            Ok(summary) => {
                job.complete(summary.clone()).await?;
                Ok(summary)
            }
            Err(e) => {
                if let Err(store_err) = job.fail(e.to_string()).await {
                    warn!(job_id = %job.job_id(), error = %store_err, "Failed to record job failure");
                }
                Err(e)
            }
        }
    }

    /// Run an import, reporting progress to `sink`
    #[instrument(skip(self, request, sink), fields(assembly_id = request.assembly_id, assay_id = request.assay_id))]
    pub async fn run(
        &self,
        request: &ImportRequest,
        sink: &dyn ProgressSink,
    ) -> Result<ImportSummary, IngestionError> {
        let started = Instant::now();
        let result = self.import(request, sink, started).await;

        metrics::record_import(started.elapsed().as_secs_f64(), result.is_ok());
        match &result {
            Ok(summary) => info!(
                intervals = summary.intervals,
                cells = summary.cells,
                signals = summary.signals,
                duration_ms = summary.duration_ms,
                "Import completed"
            ),
            Err(e) => error!(error = %e, "Import failed"),
        }
        result
    }

    async fn import(
        &self,
        request: &ImportRequest,
        sink: &dyn ProgressSink,
        started: Instant,
    ) -> Result<ImportSummary, IngestionError> {
        let assembly = self
            .repo
            .find_assembly(request.assembly_id)
            .await?
            .ok_or(IngestionError::NotFound { resource: "assembly", id: request.assembly_id })?;
        let assay = self
            .repo
            .find_assay(request.assay_id)
            .await?
            .ok_or(IngestionError::NotFound { resource: "assay", id: request.assay_id })?;

        let sources = Sources::new(request);
        let totals = sources.preflight(request.options.policy()).await?;
        debug!(?totals, "Files validated");

        let _assembly_lock = self.locks.acquire(assembly.id).await;
        let _permit = self.repo.pool().write_permit().await?;

        let interval_keys = self.repo.interval_keys(assembly.id).await?;
        let cell_keys = self.repo.cell_keys(assay.id).await?;

        let txn = self.repo.begin().await?;
        let mut run = ImportRun {
            txn: &txn,
            sink,
            settings: self.settings,
            options: request.options,
            assembly_id: assembly.id,
            assay: &assay,
            dedup: DedupIndex::new(interval_keys, request.options.deduplicate_intervals),
            interval_refs: HashMap::new(),
            existing_cells: cell_keys.into_iter().rev().collect(),
            imported_cells: HashMap::new(),
            cell_refs: HashMap::new(),
            cells_supplied: request.cell_file.is_some(),
            first_interval_id: 0,
            first_cell_id: 0,
            summary: ImportSummary::default(),
        };

        match run.execute(&sources, totals).await {
            Ok(mut summary) => {
                txn.commit()
                    .await
                    .map_err(|e| IngestionError::Transaction(format!("commit failed: {}", e)))?;
                summary.duration_ms = started.elapsed().as_millis() as u64;
                Ok(summary)
            }
            Err(e) => {
                if let Err(rollback) = txn.rollback().await {
                    error!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

/// Row totals of each file, for progress reporting
#[derive(Debug, Clone, Copy, Default)]
struct Totals {
    intervals: u64,
    cells: Option<u64>,
    signals: u64,
}

struct Sources {
    intervals: RowSource,
    cells: Option<RowSource>,
    signals: RowSource,
}

impl Sources {
    fn new(request: &ImportRequest) -> Self {
        Self {
            intervals: RowSource::new(&request.interval_file, "interval_file"),
            cells: request
                .cell_file
                .as_ref()
                .map(|path| RowSource::new(path, "cell_file")),
            signals: RowSource::new(&request.signal_file, "signal_file"),
        }
    }

    /// Check every file exists with the mandatory columns, and count rows
    async fn preflight(&self, policy: ParsePolicy) -> Result<Totals, IngestionError> {
        let intervals = self.intervals.clone();
        let cells = self.cells.clone();
        let signals = self.signals.clone();

        tokio::task::spawn_blocking(move || {
            for source in std::iter::once(&intervals).chain(cells.iter()).chain(std::iter::once(&signals)) {
                if !source.path().is_file() {
                    return Err(IngestionError::structural(source.label(), "file not found"));
                }
            }
            intervals.rows::<IntervalRecord>(policy)?;
            if let Some(cells) = &cells {
                cells.rows::<CellRecord>(policy)?;
            }
            signals.rows::<SignalRecord>(policy)?;

            Ok(Totals {
                intervals: intervals.count_rows()?,
                cells: cells.as_ref().map(RowSource::count_rows).transpose()?,
                signals: signals.count_rows()?,
            })
        })
        .await
        .map_err(join_error)?
    }
}

type Batch<T> = Result<Vec<RowOutcome<T>>, IngestionError>;

/// Parse `source` on a blocking thread, sending batches of rows.
///
/// The reader stops early when the receiver is dropped. The handle yields
/// the parser's counters.
fn spawn_reader<T: RowSchema>(
    source: RowSource,
    policy: ParsePolicy,
    batch_size: usize,
    capacity: usize,
) -> (mpsc::Receiver<Batch<T>>, JoinHandle<ParseCounters>) {
    let (tx, rx) = mpsc::channel(capacity);

    let handle = tokio::task::spawn_blocking(move || {
        let mut rows = match source.rows::<T>(policy) {
            Ok(rows) => rows,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return ParseCounters::default();
            }
        };

        let mut batch = Vec::with_capacity(batch_size);
        while let Some(item) = rows.next() {
            match item {
                Ok(outcome) => {
                    batch.push(outcome);
                    if batch.len() >= batch_size {
                        let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                        if tx.blocking_send(Ok(full)).is_err() {
                            return rows.counters();
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return rows.counters();
                }
            }
        }
        if !batch.is_empty() {
            let _ = tx.blocking_send(Ok(batch));
        }
        rows.counters()
    });

    (rx, handle)
}

fn join_error(e: JoinError) -> IngestionError {
    IngestionError::App(AppError::Internal {
        message: format!("reader task failed: {}", e),
    })
}

/// Live counters of one phase, published every `every` rows
struct PhaseTracker {
    phase: JobPhase,
    progress: PhaseProgress,
    every: u64,
    reported_at: u64,
}

impl PhaseTracker {
    fn new(phase: JobPhase, total: Option<u64>, every: u64) -> Self {
        Self {
            phase,
            progress: PhaseProgress {
                total,
                ..Default::default()
            },
            every,
            reported_at: 0,
        }
    }

    async fn advance(&mut self, sink: &dyn ProgressSink, processed: u64, skipped: u64) {
        self.progress.processed += processed;
        self.progress.skipped += skipped;
        self.progress.errors += skipped;
        if self.progress.processed - self.reported_at >= self.every {
            self.reported_at = self.progress.processed;
            sink.progress(self.phase, self.progress).await;
        }
    }

    async fn finish(&mut self, sink: &dyn ProgressSink) {
        self.reported_at = self.progress.processed;
        sink.progress(self.phase, self.progress).await;
    }
}

/// State of one import inside its transaction
struct ImportRun<'a> {
    txn: &'a DatabaseTransaction,
    sink: &'a dyn ProgressSink,
    settings: ImportSettings,
    options: ImportOptions,
    assembly_id: i64,
    assay: &'a Assay,
    dedup: DedupIndex,
    /// Stored interval id by the interval file's reference key
    interval_refs: HashMap<i64, i64>,
    /// Name to id of cells already stored for the assay; the earliest id wins
    existing_cells: HashMap<String, i64>,
    imported_cells: HashMap<String, i64>,
    /// Stored cell id by the cell file's reference key
    cell_refs: HashMap<i64, i64>,
    cells_supplied: bool,
    first_interval_id: i64,
    first_cell_id: i64,
    summary: ImportSummary,
}

impl ImportRun<'_> {
    async fn execute(&mut self, sources: &Sources, totals: Totals) -> Result<ImportSummary, IngestionError> {
        self.import_intervals(&sources.intervals, totals.intervals).await?;
        match &sources.cells {
            Some(cells) => self.import_cells(cells, totals.cells).await?,
            None => {
                self.sink
                    .phase(JobPhase::Cells, "No cell file supplied, skipping cells".into())
                    .await;
                self.sink
                    .progress(JobPhase::Cells, PhaseProgress { total: Some(0), ..Default::default() })
                    .await;
            }
        }
        self.import_signals(&sources.signals, totals.signals).await?;
        self.finalize().await?;
        Ok(self.summary.clone())
    }

    fn reader<T: RowSchema>(&self, source: &RowSource) -> (mpsc::Receiver<Batch<T>>, JoinHandle<ParseCounters>) {
        spawn_reader(
            source.clone(),
            self.options.policy(),
            self.settings.batch_size,
            self.settings.channel_capacity,
        )
    }

    // ========================================================================
    // Intervals
    // ========================================================================

    async fn import_intervals(&mut self, source: &RowSource, total: u64) -> Result<(), IngestionError> {
        self.sink.phase(JobPhase::Intervals, "Importing intervals".into()).await;
        let mut tracker = PhaseTracker::new(JobPhase::Intervals, Some(total), self.settings.progress_every);

        let mut next_id = next_id(self.txn, "interval").await?;
        self.first_interval_id = next_id;

        let (mut rx, reader) = self.reader::<IntervalRecord>(source);
        while let Some(batch) = rx.recv().await {
            let batch = batch?;
            let processed = batch.len() as u64;
            let mut skipped = 0;
            let mut pending = Vec::with_capacity(batch.len());

            for outcome in batch {
                let record = match outcome {
                    RowOutcome::Valid(record) => record,
                    RowOutcome::Skipped { .. } => {
                        skipped += 1;
                        continue;
                    }
                };
                if let Some(key) = record.key {
                    if self.interval_refs.contains_key(&key) {
                        self.duplicate_key(IntervalRecord::TABLE, record.row, key)?;
                        skipped += 1;
                        continue;
                    }
                }
                self.summary.original_interval_count += 1;
                let key = record.key;

                let id = match self.dedup.resolve(&record.external_id) {
                    Some(id) => {
                        self.summary.deduplicated_intervals += 1;
                        id
                    }
                    None => {
                        let id = next_id;
                        next_id += 1;
                        self.dedup.record(&record.external_id, id);
                        pending.push(interval_model(record, id, self.assembly_id));
                        self.summary.intervals += 1;
                        id
                    }
                };
                if let Some(key) = key {
                    self.interval_refs.insert(key, id);
                }
            }

            insert_intervals(self.txn, pending).await?;
            tracker.advance(self.sink, processed, skipped).await;
        }
        drop(rx);

        let counters = reader.await.map_err(join_error)?;
        self.summary.skipped_rows.intervals = tracker.progress.skipped;
        self.summary.nulled_optional_values += counters.nulled;
        tracker.finish(self.sink).await;

        metrics::record_rows("interval", "valid", counters.valid);
        metrics::record_rows("interval", "skipped", self.summary.skipped_rows.intervals);
        info!(
            created = self.summary.intervals,
            deduplicated = self.summary.deduplicated_intervals,
            skipped = self.summary.skipped_rows.intervals,
            "Intervals imported"
        );
        Ok(())
    }

    // ========================================================================
    // Cells
    // ========================================================================

    async fn import_cells(&mut self, source: &RowSource, total: Option<u64>) -> Result<(), IngestionError> {
        self.sink.phase(JobPhase::Cells, "Importing cells".into()).await;
        let mut tracker = PhaseTracker::new(JobPhase::Cells, total, self.settings.progress_every);

        let mut next_id = next_id(self.txn, "cell").await?;
        self.first_cell_id = next_id;

        let (mut rx, reader) = self.reader::<CellRecord>(source);
        while let Some(batch) = rx.recv().await {
            let batch = batch?;
            let processed = batch.len() as u64;
            let mut skipped = 0;
            let mut pending = Vec::with_capacity(batch.len());

            for outcome in batch {
                let record = match outcome {
                    RowOutcome::Valid(record) => record,
                    RowOutcome::Skipped { .. } => {
                        skipped += 1;
                        continue;
                    }
                };
                if let Some(key) = record.key {
                    if self.cell_refs.contains_key(&key) {
                        self.duplicate_key(CellRecord::TABLE, record.row, key)?;
                        skipped += 1;
                        continue;
                    }
                }
                let id = next_id;
                next_id += 1;
                self.imported_cells.entry(record.name.clone()).or_insert(id);
                if let Some(key) = record.key {
                    self.cell_refs.insert(key, id);
                }
                pending.push(cell_model(record, id, self.assay.id));
                self.summary.cells += 1;
            }

            insert_cells(self.txn, pending).await?;
            tracker.advance(self.sink, processed, skipped).await;
        }
        drop(rx);

        let counters = reader.await.map_err(join_error)?;
        self.summary.skipped_rows.cells = tracker.progress.skipped;
        self.summary.nulled_optional_values += counters.nulled;
        tracker.finish(self.sink).await;

        metrics::record_rows("cell", "valid", counters.valid);
        metrics::record_rows("cell", "skipped", self.summary.skipped_rows.cells);
        info!(created = self.summary.cells, skipped = self.summary.skipped_rows.cells, "Cells imported");
        Ok(())
    }

    // ========================================================================
    // Signals
    // ========================================================================

    async fn import_signals(&mut self, source: &RowSource, total: u64) -> Result<(), IngestionError> {
        self.sink.phase(JobPhase::Signals, "Importing signals".into()).await;
        let mut tracker = PhaseTracker::new(JobPhase::Signals, Some(total), self.settings.progress_every);

        let cell_resolved = AssayKind::from_type(&self.assay.kind).is_cell_resolved();
        let mut unresolved = 0u64;

        let (mut rx, reader) = self.reader::<SignalRecord>(source);
        while let Some(batch) = rx.recv().await {
            let batch = batch?;
            let processed = batch.len() as u64;
            let mut skipped = 0;
            let mut pending = Vec::with_capacity(batch.len());

            for outcome in batch {
                let record = match outcome {
                    RowOutcome::Valid(record) => record,
                    RowOutcome::Skipped { .. } => {
                        skipped += 1;
                        continue;
                    }
                };

                let resolved = self.resolve_interval(&record).and_then(|interval_id| {
                    self.resolve_cell(&record, cell_resolved)
                        .map(|cell_id| (interval_id, cell_id))
                });
                let (interval_id, cell_id) = match resolved {
                    Ok(ids) => ids,
                    Err(e) if self.options.ignore_row_errors && e.is_row_level() => {
                        debug!(error = %e, "Signal row skipped");
                        skipped += 1;
                        unresolved += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                if record.value == 0.0 {
                    self.summary.zero_signals += 1;
                    if self.options.omit_zero_signals {
                        continue;
                    }
                } else {
                    self.summary.non_zero_signals += 1;
                }

                pending.push(SignalActiveModel {
                    signal: Set(record.value),
                    p_value: Set(record.p_value),
                    padj_value: Set(record.padj_value),
                    assay_id: Set(self.assay.id),
                    interval_id: Set(interval_id),
                    cell_id: Set(cell_id),
                    ..Default::default()
                });
            }

            self.summary.signals += pending.len() as u64;
            if !pending.is_empty() {
                SignalEntity::insert_many(pending)
                    .exec_without_returning(self.txn)
                    .await?;
            }
            tracker.advance(self.sink, processed, skipped).await;
        }
        drop(rx);

        let counters = reader.await.map_err(join_error)?;
        self.summary.skipped_rows.signals = counters.skipped + unresolved;
        self.summary.nulled_optional_values += counters.nulled;
        tracker.finish(self.sink).await;

        metrics::record_rows("signal", "valid", self.summary.signals);
        metrics::record_rows("signal", "skipped", self.summary.skipped_rows.signals);
        info!(
            persisted = self.summary.signals,
            zero = self.summary.zero_signals,
            skipped = self.summary.skipped_rows.signals,
            "Signals imported"
        );
        Ok(())
    }

    fn resolve_interval(&self, record: &SignalRecord) -> Result<i64, IngestionError> {
        let found = match &record.interval {
            IntervalRef::Key(key) => self.interval_refs.get(key).copied(),
            IntervalRef::External(external_id) => self.dedup.lookup(external_id),
        };
        found.ok_or_else(|| IngestionError::Referential {
            table: SignalRecord::TABLE,
            row: record.row,
            message: match &record.interval {
                IntervalRef::Key(key) => format!("interval_id {} does not name an imported interval", key),
                IntervalRef::External(id) => format!("unknown interval '{}'", id),
            },
        })
    }

    fn resolve_cell(&self, record: &SignalRecord, cell_resolved: bool) -> Result<Option<i64>, IngestionError> {
        let referential = |message: String| IngestionError::Referential {
            table: SignalRecord::TABLE,
            row: record.row,
            message,
        };

        let Some(cell) = &record.cell else {
            if cell_resolved {
                return Err(referential("missing cell reference for a cell-resolved assay".into()));
            }
            return Ok(None);
        };

        let found = match cell {
            CellRef::Key(key) => self.cell_refs.get(key).copied(),
            CellRef::Name(name) => self
                .imported_cells
                .get(name)
                .or_else(|| self.existing_cells.get(name))
                .copied(),
        };

        match found {
            Some(id) => Ok(Some(id)),
            // Bulk assays imported without a cell file keep the signal
            None if !cell_resolved && !self.cells_supplied => Ok(None),
            None => Err(referential(match cell {
                CellRef::Key(key) => format!("cell_id {} does not name an imported cell", key),
                CellRef::Name(name) => format!("unknown cell '{}'", name),
            })),
        }
    }

    /// A repeated reference key is a row error
    fn duplicate_key(&self, table: &'static str, row: u64, key: i64) -> Result<(), IngestionError> {
        let err = IngestionError::Row {
            table,
            row,
            message: format!("duplicate id {}", key),
        };
        if self.options.ignore_row_errors {
            debug!(error = %err, "Row skipped");
            Ok(())
        } else {
            Err(err)
        }
    }

    // ========================================================================
    // Finalize
    // ========================================================================

    async fn finalize(&mut self) -> Result<(), IngestionError> {
        self.sink.phase(JobPhase::Finalize, "Updating assay statistics".into()).await;

        if self.options.omit_zero_signals {
            self.prune_orphans().await?;
        }

        let assay = AssayEntity::find_by_id(self.assay.id)
            .one(self.txn)
            .await?
            .ok_or(IngestionError::NotFound { resource: "assay", id: self.assay.id })?;

        let mut assemblies = assay.assembly_ids();
        if !assemblies.contains(&self.assembly_id) {
            assemblies.push(self.assembly_id);
        }
        let assemblies = assemblies
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let add = |current: Option<i64>, delta: u64| Some(current.unwrap_or(0) + delta as i64);
        let mut active: AssayActiveModel = assay.clone().into();
        active.interval_count = Set(add(assay.interval_count, self.summary.intervals));
        active.signal_nonzero = Set(add(assay.signal_nonzero, self.summary.non_zero_signals));
        active.signal_zero = Set(add(assay.signal_zero, self.summary.zero_signals));
        active.cell_total = Set(add(assay.cell_total, self.summary.cells));
        active.assemblies = Set(Some(assemblies));
        active.update(self.txn).await?;

        Ok(())
    }

    /// Drop intervals and cells of this import that no signal references
    async fn prune_orphans(&mut self) -> Result<(), IngestionError> {
        if self.summary.intervals > 0 {
            let pruned = self
                .txn
                .execute(Statement::from_sql_and_values(
                    DbBackend::Sqlite,
                    r#"DELETE FROM "interval" WHERE "assembly_id" = ? AND "id" >= ?
                       AND NOT EXISTS (SELECT 1 FROM "signal" s WHERE s."interval_id" = "interval"."id")"#,
                    [self.assembly_id.into(), self.first_interval_id.into()],
                ))
                .await?
                .rows_affected();
            self.summary.orphan_intervals_filtered = pruned;
            self.summary.intervals -= pruned.min(self.summary.intervals);
        }

        if self.summary.cells > 0 {
            let pruned = self
                .txn
                .execute(Statement::from_sql_and_values(
                    DbBackend::Sqlite,
                    r#"DELETE FROM "cell" WHERE "assay_id" = ? AND "id" >= ?
                       AND NOT EXISTS (SELECT 1 FROM "signal" s WHERE s."cell_id" = "cell"."id")"#,
                    [self.assay.id.into(), self.first_cell_id.into()],
                ))
                .await?
                .rows_affected();
            self.summary.orphan_cells_filtered = pruned;
            self.summary.cells -= pruned.min(self.summary.cells);
        }

        info!(
            intervals = self.summary.orphan_intervals_filtered,
            cells = self.summary.orphan_cells_filtered,
            "Pruned orphans"
        );
        Ok(())
    }
}

/// Next free id of an AUTOINCREMENT table, never reusing a deleted one
async fn next_id(txn: &DatabaseTransaction, table: &str) -> Result<i64, IngestionError> {
    let sql = format!(
        r#"SELECT MAX(
               COALESCE((SELECT "seq" FROM "sqlite_sequence" WHERE "name" = ?), 0),
               COALESCE((SELECT MAX("id") FROM "{}"), 0)
           ) + 1 AS next_id"#,
        table
    );
    let row = txn
        .query_one(Statement::from_sql_and_values(DbBackend::Sqlite, sql, [table.into()]))
        .await?
        .ok_or_else(|| IngestionError::Transaction(format!("no id for {}", table)))?;
    Ok(row.try_get::<i64>("", "next_id")?)
}

fn interval_model(record: IntervalRecord, id: i64, assembly_id: i64) -> IntervalActiveModel {
    IntervalActiveModel {
        id: Set(id),
        external_id: Set(record.external_id),
        parental_id: Set(record.parental_id),
        name: Set(record.name),
        kind: Set(record.kind),
        biotype: Set(record.biotype),
        chromosome: Set(record.chromosome),
        start: Set(record.start),
        end: Set(Some(record.end)),
        strand: Set(record.strand),
        summit: Set(record.summit),
        assembly_id: Set(assembly_id),
    }
}

fn cell_model(record: CellRecord, id: i64, assay_id: i64) -> CellActiveModel {
    CellActiveModel {
        id: Set(id),
        name: Set(record.name),
        kind: Set(record.kind.as_str().to_string()),
        label: Set(record.label),
        x_coordinate: Set(record.x),
        y_coordinate: Set(record.y),
        z_coordinate: Set(record.z),
        assay_id: Set(assay_id),
    }
}

async fn insert_intervals(txn: &DatabaseTransaction, models: Vec<IntervalActiveModel>) -> Result<(), IngestionError> {
    if !models.is_empty() {
        IntervalEntity::insert_many(models).exec_without_returning(txn).await?;
    }
    Ok(())
}

async fn insert_cells(txn: &DatabaseTransaction, models: Vec<CellActiveModel>) -> Result<(), IngestionError> {
    if !models.is_empty() {
        CellEntity::insert_many(models).exec_without_returning(txn).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bminty_common::db::{DbPool, NewAssay, NewStudy};
    use bminty_common::jobs::{JobStatus, JobStore};
    use std::fmt::Write as _;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    struct Fixture {
        dir: tempfile::TempDir,
        importer: BulkImporter,
        assembly_id: i64,
        assay_id: i64,
    }

    async fn fixture(assay_type: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool = DbPool::open(dir.path().join("catalog.sqlite3")).await.unwrap();
        let repo = Repository::new(pool);

        let study = repo
            .create_study(NewStudy { external_id: "GSE1".into(), name: "study".into(), ..Default::default() })
            .await
            .unwrap();
        let pipeline = repo.get_or_create_pipeline("https://example.org/p", "p", None).await.unwrap();
        let assay = repo
            .create_assay(
                study.id,
                pipeline.id,
                NewAssay {
                    external_id: "A1".into(),
                    name: "assay".into(),
                    kind: assay_type.into(),
                    treatment: "none".into(),
                    platform: "Illumina".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let assembly = repo.get_or_create_assembly("GRCh38", "p14", None).await.unwrap();

        let config = ImportConfig { progress_interval_rows: 10, signal_batch_size: 7, ..Default::default() };
        Fixture {
            dir,
            importer: BulkImporter::new(repo, ImportLocks::new(), &config),
            assembly_id: assembly.id,
            assay_id: assay.id,
        }
    }

    impl Fixture {
        fn write(&self, name: &str, content: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            path
        }

        fn request(&self, intervals: &Path, cells: Option<&Path>, signals: &Path, options: ImportOptions) -> ImportRequest {
            ImportRequest {
                assembly_id: self.assembly_id,
                assay_id: self.assay_id,
                interval_file: intervals.to_path_buf(),
                cell_file: cells.map(Path::to_path_buf),
                signal_file: signals.to_path_buf(),
                options,
            }
        }

        fn repo(&self) -> &Repository {
            self.importer.repository()
        }
    }

    #[derive(Default)]
    struct Recorder {
        phases: Mutex<Vec<JobPhase>>,
        updates: Mutex<Vec<(JobPhase, PhaseProgress)>>,
    }

    #[async_trait]
    impl ProgressSink for Recorder {
        async fn phase(&self, phase: JobPhase, _message: String) {
            self.phases.lock().unwrap().push(phase);
        }

        async fn progress(&self, phase: JobPhase, progress: PhaseProgress) {
            self.updates.lock().unwrap().push((phase, progress));
        }
    }

    /// `n` intervals; rows past `n - dups` repeat the first external ids
    fn interval_csv(n: usize, dups: usize) -> String {
        let mut csv = String::from("external_id,type,chromosome,start,end,strand\n");
        for i in 0..n {
            let id = if i >= n - dups { i - (n - dups) } else { i };
            writeln!(csv, "g{},gene,chr1,{},{},+", id, i * 100, i * 100 + 50).unwrap();
        }
        csv
    }

    #[tokio::test]
    async fn test_dedup_collapses_repeated_ids() {
        let fx = fixture("Bulk RNA-seq").await;
        let intervals = fx.write("intervals.csv", &interval_csv(100, 5));
        let signals = fx.write("signals.csv", "signal,interval_id\n1.5,1\n2.5,100\n");

        let options = ImportOptions { deduplicate_intervals: true, ..Default::default() };
        let summary = fx
            .importer
            .run(&fx.request(&intervals, None, &signals, options), &Recorder::default())
            .await
            .unwrap();

        assert_eq!(summary.intervals, 95);
        assert_eq!(summary.original_interval_count, 100);
        assert_eq!(summary.deduplicated_intervals, 5);
        assert_eq!(summary.signals, 2);

        let counts = fx.repo().table_counts().await.unwrap();
        assert_eq!(counts.interval, 95);
        assert_eq!(counts.signal, 2);
    }

    #[tokio::test]
    async fn test_zero_signals_are_omitted_and_orphans_pruned() {
        let fx = fixture("Bulk RNA-seq").await;
        let intervals = fx.write("intervals.csv", &interval_csv(1000, 0));
        let mut signals = String::from("signal,interval_id\n");
        for row in 1..=1000 {
            let value = if row % 5 == 0 { "0" } else { "3.25" };
            writeln!(signals, "{},{}", value, row).unwrap();
        }
        let signals = fx.write("signals.csv", &signals);

        let options = ImportOptions { omit_zero_signals: true, ..Default::default() };
        let sink = Recorder::default();
        let summary = fx
            .importer
            .run(&fx.request(&intervals, None, &signals, options), &sink)
            .await
            .unwrap();

        assert_eq!(summary.signals, 800);
        assert_eq!(summary.zero_signals, 200);
        assert_eq!(summary.non_zero_signals, 800);
        assert_eq!(summary.orphan_intervals_filtered, 200);
        assert_eq!(summary.intervals, 800);

        let counts = fx.repo().table_counts().await.unwrap();
        assert_eq!(counts.signal, 800);
        assert_eq!(counts.interval, 800);

        let assay = fx.repo().find_assay(fx.assay_id).await.unwrap().unwrap();
        assert_eq!(assay.signal_nonzero, Some(800));
        assert_eq!(assay.signal_zero, Some(200));
        assert_eq!(assay.interval_count, Some(800));
        assert_eq!(assay.assembly_ids(), vec![fx.assembly_id]);

        let phases = sink.phases.lock().unwrap().clone();
        assert_eq!(
            phases,
            vec![JobPhase::Intervals, JobPhase::Cells, JobPhase::Signals, JobPhase::Finalize]
        );
        let last_signal = sink
            .updates
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(phase, _)| *phase == JobPhase::Signals)
            .map(|(_, p)| *p)
            .unwrap();
        assert_eq!(last_signal.processed, 1000);
        assert_eq!(last_signal.total, Some(1000));
    }

    #[tokio::test]
    async fn test_signal_failure_rolls_back_every_stage() {
        let fx = fixture("scRNA-seq").await;
        let intervals = fx.write("intervals.csv", &interval_csv(10, 0));
        let cells = fx.write("cells.csv", "name,type\nc1,cell\nc2,cell\n");
        let signals = fx.write("signals.csv", "signal,interval_id,cell_name\n1,1,c1\n2,2,c2\nbroken,3,c1\n");

        let before = fx.repo().table_counts().await.unwrap();
        let err = fx
            .importer
            .run(&fx.request(&intervals, Some(&cells), &signals, ImportOptions::default()), &Recorder::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Row { table: "signal", row: 3, .. }));

        let after = fx.repo().table_counts().await.unwrap();
        assert_eq!(before, after);
        let assay = fx.repo().find_assay(fx.assay_id).await.unwrap().unwrap();
        assert_eq!(assay.interval_count, None);
    }

    #[tokio::test]
    async fn test_reimport_is_idempotent_only_with_dedup() {
        let fx = fixture("Bulk RNA-seq").await;
        let intervals = fx.write("intervals.csv", &interval_csv(20, 0));
        let signals = fx.write("signals.csv", "signal,interval_external_id\n1,g0\n2,g19\n");

        let dedup = ImportOptions { deduplicate_intervals: true, ..Default::default() };
        let request = fx.request(&intervals, None, &signals, dedup);
        fx.importer.run(&request, &Recorder::default()).await.unwrap();
        let second = fx.importer.run(&request, &Recorder::default()).await.unwrap();
        assert_eq!(second.intervals, 0);
        assert_eq!(second.deduplicated_intervals, 20);
        assert_eq!(fx.repo().table_counts().await.unwrap().interval, 20);

        let plain = fx.request(&intervals, None, &signals, ImportOptions::default());
        fx.importer.run(&plain, &Recorder::default()).await.unwrap();
        assert_eq!(fx.repo().table_counts().await.unwrap().interval, 40);
        assert_eq!(fx.repo().table_counts().await.unwrap().signal, 6);
    }

    #[tokio::test]
    async fn test_unknown_interval_is_skipped_only_when_ignoring_errors() {
        let fx = fixture("Bulk RNA-seq").await;
        let intervals = fx.write("intervals.csv", &interval_csv(3, 0));
        let signals = fx.write("signals.csv", "signal,interval_external_id\n1,g0\n2,missing\n3,g2\n");

        let err = fx
            .importer
            .run(&fx.request(&intervals, None, &signals, ImportOptions::default()), &Recorder::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Referential { row: 2, .. }));
        assert_eq!(fx.repo().table_counts().await.unwrap().interval, 0);

        let options = ImportOptions { ignore_row_errors: true, ..Default::default() };
        let summary = fx
            .importer
            .run(&fx.request(&intervals, None, &signals, options), &Recorder::default())
            .await
            .unwrap();
        assert_eq!(summary.signals, 2);
        assert_eq!(summary.skipped_rows.signals, 1);
    }

    #[tokio::test]
    async fn test_cell_references_resolve_by_name_and_row() {
        let fx = fixture("Visium spatial").await;
        let intervals = fx.write("intervals.csv", &interval_csv(2, 0));
        let cells = fx.write("cells.csv", "name,type,x_coordinate\nAAAC,spot,1\nAAAG,spot,2\n");
        let signals = fx.write("signals.csv", "signal,interval_id,cell_id,cell_name\n1,1,2,\n2,2,,AAAC\n");

        let summary = fx
            .importer
            .run(&fx.request(&intervals, Some(&cells), &signals, ImportOptions::default()), &Recorder::default())
            .await
            .unwrap();
        assert_eq!(summary.cells, 2);
        assert_eq!(summary.signals, 2);

        let assay = fx.repo().find_assay(fx.assay_id).await.unwrap().unwrap();
        assert_eq!(assay.cell_total, Some(2));
    }

    #[tokio::test]
    async fn test_signals_follow_file_ids_not_row_order() {
        let fx = fixture("Visium spatial").await;
        let intervals = fx.write(
            "intervals.csv",
            "id,external_id,type,chromosome,start,end,strand
2,gB,gene,chr1,1,5,+
1,gA,gene,chr1,9,15,+
",
        );
        let cells = fx.write("cells.csv", "id,name,type
20,spotB,spot
10,spotA,spot
");
        let signals = fx.write("signals.csv", "signal,interval_id,cell_id
9.5,1,10
");

        fx.importer
            .run(&fx.request(&intervals, Some(&cells), &signals, ImportOptions::default()), &Recorder::default())
            .await
            .unwrap();

        let conn = fx.repo().pool().conn();
        let signal = SignalEntity::find().one(conn).await.unwrap().unwrap();
        let interval = IntervalEntity::find_by_id(signal.interval_id).one(conn).await.unwrap().unwrap();
        assert_eq!(interval.external_id, "gA");
        let cell = CellEntity::find_by_id(signal.cell_id.unwrap()).one(conn).await.unwrap().unwrap();
        assert_eq!(cell.name, "spotA");
    }

    #[tokio::test]
    async fn test_duplicate_file_id_is_a_row_error() {
        let fx = fixture("Bulk RNA-seq").await;
        let intervals = fx.write(
            "intervals.csv",
            "id,external_id,type,chromosome,start,end,strand
5,gA,gene,chr1,1,5,+
5,gB,gene,chr1,9,15,+
",
        );
        let signals = fx.write("signals.csv", "signal,interval_id
1,5
");

        let err = fx
            .importer
            .run(&fx.request(&intervals, None, &signals, ImportOptions::default()), &Recorder::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Row { table: "interval", row: 2, .. }));

        let options = ImportOptions { ignore_row_errors: true, ..Default::default() };
        let summary = fx
            .importer
            .run(&fx.request(&intervals, None, &signals, options), &Recorder::default())
            .await
            .unwrap();
        assert_eq!(summary.intervals, 1);
        assert_eq!(summary.skipped_rows.intervals, 1);
        assert_eq!(summary.signals, 1);
    }

    #[tokio::test]
    async fn test_cell_resolved_assay_needs_cell_reference() {
        let fx = fixture("scATAC-seq").await;
        let intervals = fx.write("intervals.csv", &interval_csv(2, 0));
        let signals = fx.write("signals.csv", "signal,interval_id\n1,1\n");

        let err = fx
            .importer
            .run(&fx.request(&intervals, None, &signals, ImportOptions::default()), &Recorder::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Referential { .. }));
    }

    #[tokio::test]
    async fn test_bulk_assay_without_cell_file_nulls_cell() {
        let fx = fixture("Bulk RNA-seq").await;
        let intervals = fx.write("intervals.csv", &interval_csv(2, 0));
        let signals = fx.write("signals.csv", "signal,interval_id,cell_name\n1,1,ghost\n");

        let summary = fx
            .importer
            .run(&fx.request(&intervals, None, &signals, ImportOptions::default()), &Recorder::default())
            .await
            .unwrap();
        assert_eq!(summary.signals, 1);
    }

    #[tokio::test]
    async fn test_missing_file_and_unknown_targets_fail_before_writing() {
        let fx = fixture("Bulk RNA-seq").await;
        let intervals = fx.write("intervals.csv", &interval_csv(2, 0));
        let missing = fx.dir.path().join("absent.csv");

        let err = fx
            .importer
            .run(&fx.request(&intervals, None, &missing, ImportOptions::default()), &Recorder::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Structural { ref file, .. } if file == "signal_file"));

        let mut request = fx.request(&intervals, None, &intervals, ImportOptions::default());
        request.assay_id = 404;
        let err = fx.importer.run(&request, &Recorder::default()).await.unwrap_err();
        assert!(matches!(err, IngestionError::NotFound { resource: "assay", id: 404 }));
    }

    #[tokio::test]
    async fn test_run_tracked_records_terminal_state() {
        let fx = fixture("Bulk RNA-seq").await;
        let intervals = fx.write("intervals.csv", &interval_csv(2, 0));
        let signals = fx.write("signals.csv", "signal,interval_id\n1,1\n");

        let store = Arc::new(JobStore::default());
        let job_id = store.create().await;
        let handle = JobHandle::new(store.clone(), job_id);
        fx.importer
            .run_tracked(&fx.request(&intervals, None, &signals, ImportOptions::default()), &handle)
            .await
            .unwrap();

        let doc = store.get(job_id).await.unwrap();
        assert_eq!(doc.status, JobStatus::Completed);
        assert_eq!(doc.result.unwrap().signals, 1);
        assert_eq!(doc.progress.intervals.processed, 2);
    }

    #[test]
    fn test_assay_kind_heuristic() {
        assert!(AssayKind::from_type("scRNA-seq").is_cell_resolved());
        assert!(AssayKind::from_type("Single-cell ATAC").is_cell_resolved());
        assert!(AssayKind::from_type("10x Visium").is_cell_resolved());
        assert!(!AssayKind::from_type("Bulk RNA-seq").is_cell_resolved());
        assert!(!AssayKind::from_type("ChIP-seq").is_cell_resolved());
    }
}
