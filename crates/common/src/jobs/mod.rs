//! Job status store for asynchronous bulk imports
//!
//! A process-wide map from job id to status document. Writers are the
//! import task and the upload handler; readers are polling clients.
//! Documents are evicted after clients have observed a terminal state,
//! after a TTL when nobody polls, or when a job stops making progress.

use crate::config::JobsConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Total number of steps an import walks through
pub const TOTAL_STEPS: u8 = 5;

/// Job status enum
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Uploading,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Uploading => "uploading",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Check if the job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Import phase, one per step
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Upload,
    Intervals,
    Cells,
    Signals,
    Finalize,
}

impl JobPhase {
    /// 1-based step index
    pub fn step(&self) -> u8 {
        match self {
            JobPhase::Upload => 1,
            JobPhase::Intervals => 2,
            JobPhase::Cells => 3,
            JobPhase::Signals => 4,
            JobPhase::Finalize => 5,
        }
    }

    pub fn step_name(&self) -> &'static str {
        match self {
            JobPhase::Upload => "Uploading files",
            JobPhase::Intervals => "Importing intervals",
            JobPhase::Cells => "Importing cells",
            JobPhase::Signals => "Importing signals",
            JobPhase::Finalize => "Finalizing",
        }
    }
}

/// Row counters of one phase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub processed: u64,
    pub total: Option<u64>,
    pub skipped: u64,
    pub errors: u64,
}

impl PhaseProgress {
    /// Percentage of `total` processed, if known
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(100.0),
            Some(total) => Some((self.processed as f64 / total as f64 * 100.0).min(100.0)),
            None => None,
        }
    }
}

/// Per-phase progress of an import
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub intervals: PhaseProgress,
    pub cells: PhaseProgress,
    pub signals: PhaseProgress,
}

impl Progress {
    pub fn phase_mut(&mut self, phase: JobPhase) -> Option<&mut PhaseProgress> {
        match phase {
            JobPhase::Intervals => Some(&mut self.intervals),
            JobPhase::Cells => Some(&mut self.cells),
            JobPhase::Signals => Some(&mut self.signals),
            JobPhase::Upload | JobPhase::Finalize => None,
        }
    }
}

/// Rows skipped under `ignore_row_errors`, per phase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRows {
    pub intervals: u64,
    pub cells: u64,
    pub signals: u64,
}

/// Result of a completed bulk import
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    /// Interval rows created
    pub intervals: u64,
    /// Valid interval rows read from the file
    pub original_interval_count: u64,
    /// Interval rows that reused an existing interval
    pub deduplicated_intervals: u64,
    /// Cell rows created
    pub cells: u64,
    /// Signal rows persisted
    pub signals: u64,
    pub zero_signals: u64,
    pub non_zero_signals: u64,
    pub orphan_intervals_filtered: u64,
    pub orphan_cells_filtered: u64,
    pub skipped_rows: SkippedRows,
    pub nulled_optional_values: u64,
    pub duration_ms: u64,
}

/// Status document served to polling clients
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobStatusDocument {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub phase: JobPhase,
    pub step: u8,
    pub total_steps: u8,
    pub step_name: String,
    pub message: String,
    pub progress: Progress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ImportSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobStatusDocument {
    fn new(job_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            status: JobStatus::Queued,
            phase: JobPhase::Upload,
            step: JobPhase::Upload.step(),
            total_steps: TOTAL_STEPS,
            step_name: JobPhase::Upload.step_name().to_string(),
            message: "Job queued".to_string(),
            progress: Progress::default(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Move to `phase`, keeping the step fields in sync
    pub fn enter(&mut self, status: JobStatus, phase: JobPhase, message: impl Into<String>) {
        self.status = status;
        self.phase = phase;
        self.step = phase.step();
        self.step_name = phase.step_name().to_string();
        self.message = message.into();
    }

    /// Mark completed with a summary
    pub fn complete(&mut self, summary: ImportSummary) {
        self.enter(JobStatus::Completed, JobPhase::Finalize, "Import completed");
        self.result = Some(summary);
        self.error = None;
    }

    /// Mark failed with a human-readable cause; the phase stays where it failed
    pub fn fail(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.status = JobStatus::Failed;
        self.message = format!("Import failed during {}", self.step_name.to_lowercase());
        self.error = Some(error);
        self.result = None;
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

struct Entry {
    doc: JobStatusDocument,
    touched: Instant,
    terminal_at: Option<Instant>,
    observed_at: Option<Instant>,
}

/// Eviction windows
#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
    pub completed_ttl: Duration,
    pub observed_grace: Duration,
    pub stale_after: Duration,
}

impl From<&JobsConfig> for EvictionPolicy {
    fn from(config: &JobsConfig) -> Self {
        Self {
            completed_ttl: Duration::from_secs(config.completed_ttl_secs),
            observed_grace: Duration::from_secs(config.observed_grace_secs),
            stale_after: Duration::from_secs(config.stale_after_secs),
        }
    }
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::from(&JobsConfig::default())
    }
}

/// Process-wide job status store
pub struct JobStore {
    entries: RwLock<HashMap<Uuid, Entry>>,
    policy: EvictionPolicy,
}

impl JobStore {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Register a new queued job
    pub async fn create(&self) -> Uuid {
        let job_id = Uuid::now_v7();
        let mut entries = self.entries.write().await;
        entries.insert(
            job_id,
            Entry {
                doc: JobStatusDocument::new(job_id),
                touched: Instant::now(),
                terminal_at: None,
                observed_at: None,
            },
        );
        crate::metrics::record_jobs_tracked(entries.len());
        debug!(%job_id, "Job created");
        job_id
    }

    /// Apply `change` to a job's document. Terminal documents are frozen.
    pub async fn update<F>(&self, job_id: Uuid, change: F) -> Result<()>
    where
        F: FnOnce(&mut JobStatusDocument),
    {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&job_id).ok_or_else(|| AppError::JobNotFound {
            id: job_id.to_string(),
        })?;

        if entry.doc.is_terminal() {
            warn!(%job_id, status = entry.doc.status.as_str(), "Ignoring update to finished job");
            return Ok(());
        }

        change(&mut entry.doc);

        let now = Instant::now();
        entry.doc.updated_at = Utc::now();
        entry.touched = now;
        if entry.doc.is_terminal() {
            entry.doc.finished_at = Some(entry.doc.updated_at);
            entry.terminal_at = Some(now);
        }
        Ok(())
    }

    /// Read a job's document, recording the first terminal observation
    pub async fn get(&self, job_id: Uuid) -> Result<JobStatusDocument> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&job_id).ok_or_else(|| AppError::JobNotFound {
            id: job_id.to_string(),
        })?;

        if entry.doc.is_terminal() && entry.observed_at.is_none() {
            entry.observed_at = Some(Instant::now());
        }
        Ok(entry.doc.clone())
    }

    /// Drop a job immediately
    pub async fn remove(&self, job_id: Uuid) -> bool {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(&job_id).is_some();
        crate::metrics::record_jobs_tracked(entries.len());
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Evict documents whose window has passed at `now`
    pub async fn evict_expired_at(&self, now: Instant) -> usize {
        let policy = self.policy;
        let mut entries = self.entries.write().await;
        let before = entries.len();

        entries.retain(|_, entry| {
            let elapsed = |at: Instant| now.saturating_duration_since(at);
            match (entry.terminal_at, entry.observed_at) {
                (Some(_), Some(observed)) => elapsed(observed) < policy.observed_grace,
                (Some(terminal), None) => elapsed(terminal) < policy.completed_ttl,
                (None, _) => elapsed(entry.touched) < policy.stale_after,
            }
        });

        let evicted = before - entries.len();
        crate::metrics::record_jobs_tracked(entries.len());
        if evicted > 0 {
            info!(evicted, remaining = entries.len(), "Evicted job status documents");
        }
        evicted
    }

    pub async fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now()).await
    }

    /// Run eviction every `period` until the store is dropped elsewhere
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.evict_expired().await;
            }
        })
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new(EvictionPolicy::default())
    }
}

/// Receives progress from a running import
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// A new phase has started
    async fn phase(&self, phase: JobPhase, message: String);

    /// Counters of the current phase changed
    async fn progress(&self, phase: JobPhase, progress: PhaseProgress);
}

/// Progress sink writing into a `JobStore` entry
#[derive(Clone)]
pub struct JobHandle {
    store: Arc<JobStore>,
    job_id: Uuid,
}

impl JobHandle {
    pub fn new(store: Arc<JobStore>, job_id: Uuid) -> Self {
        Self { store, job_id }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub async fn complete(&self, summary: ImportSummary) -> Result<()> {
        self.store.update(self.job_id, |doc| doc.complete(summary)).await
    }

    pub async fn fail(&self, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.store.update(self.job_id, |doc| doc.fail(error)).await
    }
}

#[async_trait]
impl ProgressSink for JobHandle {
    async fn phase(&self, phase: JobPhase, message: String) {
        let status = match phase {
            JobPhase::Upload => JobStatus::Uploading,
            _ => JobStatus::Processing,
        };
        if let Err(e) = self
            .store
            .update(self.job_id, |doc| doc.enter(status, phase, message))
            .await
        {
            warn!(job_id = %self.job_id, error = %e, "Failed to record phase");
        }
    }

    async fn progress(&self, phase: JobPhase, progress: PhaseProgress) {
        let result = self
            .store
            .update(self.job_id, |doc| {
                if let Some(slot) = doc.progress.phase_mut(phase) {
                    *slot = progress;
                }
            })
            .await;
        if let Err(e) = result {
            warn!(job_id = %self.job_id, error = %e, "Failed to record progress");
        }
    }
}
