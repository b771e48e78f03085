//! Run controller
//!
//! Drives packed batches strictly one at a time: prompt, dispatch, extract,
//! classify, apply. A quota error or an operator interrupt stops the run and
//! writes a checkpoint holding every unfinished batch. Any other failure is
//! confined to its batch and the loop moves on.

use crate::artifacts::ArtifactWriter;
use crate::backend::{BackendDescriptor, DispatchError, DispatchOptions, Dispatcher};
use crate::cancel::CancellationToken;
use crate::checkpoint::{
    split_for_retry, CheckpointError, CheckpointManager, CheckpointStatus, RetryConfig,
    RunCheckpoint,
};
use crate::classify::{apply, classify, ApplyReport, Classification, StoreLookup, Thresholds};
use crate::config::{Config, ConfigError, RepairConfig};
use crate::extract::{parse_candidates, Repairer};
use crate::model::{Batch, TargetItem};
use crate::packer::{BatchPacker, PackOptions, PackingConfig};
use crate::pacing::{NoPacing, PacingPolicy};
use crate::prompt::{CompactFingerprinter, Fingerprinter, PromptBuilder};
use crate::storage::{RecordStore, StorageError, StorageResult};
use chrono::Utc;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Run-level failures. Quota and interrupt aborts are not errors; they are
/// reported through `RunStatus::Aborted`.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("no backends selected")]
    NoBackends,

    #[error("store error: {0}")]
    Storage(#[from] StorageError),

    #[error("cannot write checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Lifecycle of one batch.
///
/// `Pending -> Dispatched -> Extracted -> Classified -> Done`, with
/// `Dispatched -> ExtractFailed -> RepairAttempted -> {Extracted | Failed}`
/// on a malformed response. `QuotaAborted` ends the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    Dispatched,
    Extracted,
    Classified,
    Done,
    ExtractFailed,
    RepairAttempted,
    Failed,
    QuotaAborted,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::QuotaAborted)
    }

    fn can_advance_to(self, next: BatchState) -> bool {
        use BatchState::*;
        matches!(
            (self, next),
            (Pending, Dispatched)
                | (Pending, Done)
                | (Pending, Failed)
                | (Pending, QuotaAborted)
                | (Dispatched, Extracted)
                | (Dispatched, ExtractFailed)
                | (Extracted, Classified)
                | (Classified, Done)
                | (ExtractFailed, RepairAttempted)
                | (ExtractFailed, Failed)
                | (RepairAttempted, Extracted)
                | (RepairAttempted, Failed)
                | (RepairAttempted, QuotaAborted)
        )
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Extracted => "extracted",
            Self::Classified => "classified",
            Self::Done => "done",
            Self::ExtractFailed => "extract_failed",
            Self::RepairAttempted => "repair_attempted",
            Self::Failed => "failed",
            Self::QuotaAborted => "quota_aborted",
        };
        f.write_str(name)
    }
}

struct BatchTracker {
    label: String,
    state: BatchState,
}

impl BatchTracker {
    fn new(batch: &Batch) -> Self {
        Self {
            label: batch.label(),
            state: BatchState::Pending,
        }
    }

    fn advance(&mut self, next: BatchState) {
        if !self.state.can_advance_to(next) {
            warn!(batch = %self.label, from = %self.state, to = %next, "unexpected batch transition");
        }
        debug!(batch = %self.label, from = %self.state, to = %next, "batch state");
        self.state = next;
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Batches handed to the run
    pub batches_total: usize,
    /// Dispatches made, sub-batches included
    pub batches_attempted: usize,
    pub batches_succeeded: usize,
    pub batches_failed: usize,
    /// Batches whose collections had nothing left to match
    pub batches_skipped: usize,
    pub batches_split: usize,
    pub sub_batches: usize,
    pub applied: usize,
    pub queued: usize,
    pub created: usize,
    pub invalid: usize,
    pub rejected: usize,
    pub already_applied: usize,
    /// Writes the store declined because the item was already assigned
    pub declined_writes: usize,
    pub write_failures: usize,
}

impl RunStats {
    fn absorb(&mut self, classification: &Classification, report: &ApplyReport) {
        self.applied += report.applied;
        self.created += report.created;
        self.declined_writes += report.skipped;
        self.write_failures += report.write_failures;
        self.queued += classification.review.len();
        self.invalid += classification.invalid.len();
        self.rejected += classification.rejected.len();
        self.already_applied += classification.already_applied.len();
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "batches: {} total, {} dispatched, {} succeeded, {} failed, {} skipped",
            self.batches_total,
            self.batches_attempted,
            self.batches_succeeded,
            self.batches_failed,
            self.batches_skipped
        )?;
        if self.batches_split > 0 {
            writeln!(
                f,
                "retries: {} batches split into {} sub-batches",
                self.batches_split, self.sub_batches
            )?;
        }
        write!(
            f,
            "matches: {} applied, {} queued for review, {} created, {} invalid, {} rejected, {} already applied",
            self.applied, self.queued, self.created, self.invalid, self.rejected, self.already_applied
        )?;
        if self.declined_writes + self.write_failures > 0 {
            write!(
                f,
                "\nwrites: {} declined, {} failed",
                self.declined_writes, self.write_failures
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Aborted {
        status: CheckpointStatus,
        reason: String,
    },
}

/// Terminal state of one batch or sub-batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub label: String,
    pub is_retry: bool,
    pub state: BatchState,
    /// Sub-batches the batch was split into after exhausting every backend
    pub split_into: usize,
}

#[derive(Debug)]
pub struct RunReport {
    pub stats: RunStats,
    pub status: RunStatus,
    pub checkpoint_path: Option<PathBuf>,
    /// Review record files written at the end of the run
    pub artifacts: Vec<PathBuf>,
    /// Set when the review records could not be written
    pub artifact_error: Option<String>,
    pub batches: Vec<BatchOutcome>,
}

impl RunReport {
    pub fn is_aborted(&self) -> bool {
        matches!(self.status, RunStatus::Aborted { .. })
    }
}

enum Attempt {
    Finished(BatchState),
    /// Nothing pending in the batch's collections; no dispatch made
    Skipped,
    Exhausted(DispatchError),
    QuotaAborted(String),
}

enum Flow {
    Continue,
    Stop {
        status: CheckpointStatus,
        reason: String,
        unfinished: Vec<Batch>,
    },
}

struct RunContext {
    stats: RunStats,
    artifacts: ArtifactWriter,
    outcomes: Vec<BatchOutcome>,
    /// Whether the previous dispatched batch failed; `None` before the first
    last_failed: Option<bool>,
}

impl RunContext {
    fn finish(&mut self, batch: &Batch, state: BatchState) {
        match state {
            BatchState::Done => self.stats.batches_succeeded += 1,
            BatchState::Failed => self.stats.batches_failed += 1,
            _ => {}
        }
        self.outcome(batch, state, 0);
    }

    fn outcome(&mut self, batch: &Batch, state: BatchState, split_into: usize) {
        self.outcomes.push(BatchOutcome {
            label: batch.label(),
            is_retry: batch.is_retry,
            state,
            split_into,
        });
    }
}

const INTERRUPTED: &str = "interrupted by operator";

pub struct RunController {
    store: Arc<dyn RecordStore>,
    backends: Vec<BackendDescriptor>,
    dispatcher: Dispatcher,
    dispatch: DispatchOptions,
    thresholds: Thresholds,
    retry: RetryConfig,
    repair: RepairConfig,
    large_threshold: usize,
    pack_threshold: usize,
    pacing: Box<dyn PacingPolicy>,
    fingerprinter: Box<dyn Fingerprinter>,
    checkpoints: CheckpointManager,
    output_dir: PathBuf,
    dry_run: bool,
    cancel: CancellationToken,
}

impl RunController {
    /// A controller with default thresholds, no pacing and the default
    /// quota patterns.
    pub fn new(
        store: Arc<dyn RecordStore>,
        backends: Vec<BackendDescriptor>,
        checkpoint_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        let packing = PackingConfig::default();
        Self {
            store,
            backends: BackendDescriptor::ordered(backends),
            dispatcher: Dispatcher::default(),
            dispatch: DispatchOptions::default(),
            thresholds: Thresholds::default(),
            retry: RetryConfig::default(),
            repair: RepairConfig::default(),
            large_threshold: packing.large_threshold,
            pack_threshold: packing.pack_threshold,
            pacing: Box::new(NoPacing),
            fingerprinter: Box::new(CompactFingerprinter::default()),
            checkpoints: CheckpointManager::new(checkpoint_dir),
            output_dir: output_dir.into(),
            dry_run: false,
            cancel: CancellationToken::new(),
        }
    }

    /// A controller configured from `config`, dispatching to `backends`.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn RecordStore>,
        backends: Vec<BackendDescriptor>,
    ) -> Result<Self, ConfigError> {
        let mut controller = Self::new(
            store,
            backends,
            &config.paths.checkpoint_dir,
            &config.paths.output_dir,
        );
        controller.dispatcher = config.dispatcher()?;
        controller.dispatch = config.dispatch_options();
        controller.thresholds = config.thresholds;
        controller.retry = config.retry;
        controller.repair = config.repair;
        controller.large_threshold = config.packing.large_threshold;
        controller.pack_threshold = config.packing.pack_threshold;
        controller.pacing = Box::new(config.pacing);
        Ok(controller)
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_dispatch_options(mut self, options: DispatchOptions) -> Self {
        self.dispatch = options;
        self
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_repair(mut self, repair: RepairConfig) -> Self {
        self.repair = repair;
        self
    }

    pub fn with_pacing(mut self, pacing: Box<dyn PacingPolicy>) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_fingerprinter(mut self, fingerprinter: Box<dyn Fingerprinter>) -> Self {
        self.fingerprinter = fingerprinter;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Token that stops the run at the next batch boundary.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Derive work from the store, pack it, and run it.
    pub async fn run_pending(
        &self,
        packer: &BatchPacker,
        filter: Option<&[String]>,
        opts: &PackOptions<'_>,
    ) -> Result<RunReport, RunError> {
        let work = self.store.work_items(filter)?;
        let batches = packer.pack(&work, opts);
        info!(work_items = work.len(), batches = batches.len(), "work packed");
        self.run(batches).await
    }

    /// Re-enter the batch loop at a checkpoint's unfinished batches.
    ///
    /// Work is not re-derived from the store, so items written before the
    /// interruption are not counted again.
    pub async fn resume(&self, checkpoint: &RunCheckpoint) -> Result<RunReport, RunError> {
        info!(
            stopped_at = checkpoint.stopped_at_index,
            reason = %checkpoint.reason,
            remaining = checkpoint.remaining_batches.len(),
            previously_completed = checkpoint.completed_count,
            previously_failed = checkpoint.failed_count,
            "resuming from checkpoint"
        );
        self.run(checkpoint.resume()).await
    }

    pub async fn run(&self, batches: Vec<Batch>) -> Result<RunReport, RunError> {
        if self.backends.is_empty() {
            return Err(RunError::NoBackends);
        }

        let started = Utc::now();
        let mut ctx = RunContext {
            stats: RunStats {
                batches_total: batches.len(),
                ..RunStats::default()
            },
            artifacts: ArtifactWriter::new(&self.output_dir, started),
            outcomes: Vec::new(),
            last_failed: None,
        };
        info!(
            batches = batches.len(),
            backends = self.backends.len(),
            dry_run = self.dry_run,
            "run started"
        );

        let mut status = RunStatus::Completed;
        let mut checkpoint_path = None;

        for (index, batch) in batches.iter().enumerate() {
            if let Flow::Stop {
                status: stop,
                reason,
                mut unfinished,
            } = self.process(batch, &mut ctx).await
            {
                unfinished.extend(batches[index + 1..].iter().cloned());
                let checkpoint = RunCheckpoint {
                    remaining_batches: unfinished,
                    completed_count: ctx.stats.batches_succeeded + ctx.stats.batches_skipped,
                    failed_count: ctx.stats.batches_failed,
                    total_batches: batches.len(),
                    stopped_at_index: index,
                    status: stop,
                    reason: reason.clone(),
                    timestamp: Utc::now(),
                };
                let path = self.checkpoints.save(&checkpoint)?;
                warn!(
                    path = %path.display(),
                    remaining = checkpoint.remaining_batches.len(),
                    reason = %reason,
                    "run aborted, checkpoint written"
                );
                status = RunStatus::Aborted {
                    status: stop,
                    reason,
                };
                checkpoint_path = Some(path);
                break;
            }
        }

        let (artifacts, artifact_error) = match ctx.artifacts.finish() {
            Ok(paths) => (paths, None),
            Err(e) => {
                error!(
                    dir = %self.output_dir.display(),
                    error = %e,
                    "cannot write review records"
                );
                (Vec::new(), Some(e.to_string()))
            }
        };
        info!(
            succeeded = ctx.stats.batches_succeeded,
            failed = ctx.stats.batches_failed,
            applied = ctx.stats.applied,
            queued = ctx.stats.queued,
            "run finished"
        );

        Ok(RunReport {
            stats: ctx.stats,
            status,
            checkpoint_path,
            artifacts,
            artifact_error,
            batches: ctx.outcomes,
        })
    }

    fn interrupted(&self, unfinished: &[Batch]) -> Option<Flow> {
        if !self.cancel.is_cancelled() {
            return None;
        }
        Some(Flow::Stop {
            status: CheckpointStatus::Interrupted,
            reason: INTERRUPTED.to_string(),
            unfinished: unfinished.to_vec(),
        })
    }

    /// Run one packed batch, splitting it once if every backend failed.
    async fn process(&self, batch: &Batch, ctx: &mut RunContext) -> Flow {
        if let Some(stop) = self.interrupted(std::slice::from_ref(batch)) {
            return stop;
        }

        let error = match self.attempt(batch, ctx).await {
            Attempt::Finished(state) => {
                ctx.finish(batch, state);
                ctx.last_failed = Some(state == BatchState::Failed);
                return Flow::Continue;
            }
            Attempt::Skipped => {
                ctx.stats.batches_skipped += 1;
                ctx.outcome(batch, BatchState::Done, 0);
                return Flow::Continue;
            }
            Attempt::QuotaAborted(reason) => {
                ctx.outcome(batch, BatchState::QuotaAborted, 0);
                return Flow::Stop {
                    status: CheckpointStatus::QuotaExhausted,
                    reason,
                    unfinished: vec![batch.clone()],
                };
            }
            Attempt::Exhausted(error) => error,
        };

        let Some(subs) =
            split_for_retry(batch, &self.retry, self.large_threshold, self.pack_threshold)
        else {
            warn!(batch = %batch.label(), error = %error, "batch failed on every backend");
            ctx.finish(batch, BatchState::Failed);
            ctx.last_failed = Some(true);
            return Flow::Continue;
        };

        info!(
            batch = %batch.label(),
            items = batch.len(),
            sub_batches = subs.len(),
            error = %error,
            "batch failed on every backend, retrying as sub-batches"
        );
        ctx.stats.batches_split += 1;
        ctx.outcome(batch, BatchState::Failed, subs.len());
        ctx.last_failed = Some(true);

        for (position, sub) in subs.iter().enumerate() {
            if let Some(stop) = self.interrupted(&subs[position..]) {
                return stop;
            }
            ctx.stats.sub_batches += 1;
            match self.attempt(sub, ctx).await {
                Attempt::Finished(state) => {
                    ctx.finish(sub, state);
                    ctx.last_failed = Some(state == BatchState::Failed);
                }
                Attempt::Skipped => {
                    ctx.stats.batches_skipped += 1;
                    ctx.outcome(sub, BatchState::Done, 0);
                }
                Attempt::Exhausted(error) => {
                    warn!(batch = %sub.label(), error = %error, "sub-batch failed, not split again");
                    ctx.finish(sub, BatchState::Failed);
                    ctx.last_failed = Some(true);
                }
                Attempt::QuotaAborted(reason) => {
                    ctx.outcome(sub, BatchState::QuotaAborted, 0);
                    return Flow::Stop {
                        status: CheckpointStatus::QuotaExhausted,
                        reason,
                        unfinished: subs[position..].to_vec(),
                    };
                }
            }
        }
        Flow::Continue
    }

    fn pending_items(&self, batch: &Batch) -> StorageResult<Vec<TargetItem>> {
        let mut items = Vec::new();
        for work_item in &batch.items {
            items.extend(self.store.pending_items(&work_item.id)?);
        }
        Ok(items)
    }

    /// One pass of a batch through the state machine.
    async fn attempt(&self, batch: &Batch, ctx: &mut RunContext) -> Attempt {
        let mut tracker = BatchTracker::new(batch);
        let label = tracker.label.clone();

        let items = match self.pending_items(batch) {
            Ok(items) => items,
            Err(e) => {
                error!(batch = %label, error = %e, "cannot read pending items");
                tracker.advance(BatchState::Failed);
                return Attempt::Finished(BatchState::Failed);
            }
        };
        if items.is_empty() {
            info!(batch = %label, "nothing pending, skipping");
            tracker.advance(BatchState::Done);
            return Attempt::Skipped;
        }
        let references = match self.store.canonical_entries() {
            Ok(references) => references,
            Err(e) => {
                error!(batch = %label, error = %e, "cannot read canonical entries");
                tracker.advance(BatchState::Failed);
                return Attempt::Finished(BatchState::Failed);
            }
        };

        let prompt = PromptBuilder::new(self.fingerprinter.as_ref()).build(batch, &references, &items);
        // the gap goes between dispatches, never after the last one
        if let Some(last_failed) = ctx.last_failed {
            self.pace(last_failed).await;
        }
        ctx.stats.batches_attempted += 1;
        info!(
            batch = %label,
            items = items.len(),
            references = references.len(),
            retry = batch.is_retry,
            "dispatching batch"
        );

        let reply = match self.dispatcher.dispatch(&prompt, &self.backends, self.dispatch).await {
            Ok(reply) => reply,
            Err(e) if e.is_quota() => {
                tracker.advance(BatchState::QuotaAborted);
                return Attempt::QuotaAborted(e.to_string());
            }
            Err(e @ DispatchError::Exhausted { .. }) => {
                tracker.advance(BatchState::Failed);
                return Attempt::Exhausted(e);
            }
            Err(e) => {
                error!(batch = %label, error = %e, "dispatch failed");
                tracker.advance(BatchState::Failed);
                return Attempt::Finished(BatchState::Failed);
            }
        };
        tracker.advance(BatchState::Dispatched);

        let candidates = match parse_candidates(&reply.text) {
            Ok(candidates) => {
                tracker.advance(BatchState::Extracted);
                candidates
            }
            Err(e) => {
                warn!(batch = %label, backend = %reply.backend, error = %e, "response not extractable");
                tracker.advance(BatchState::ExtractFailed);
                if !self.repair.enabled {
                    save_raw(ctx, batch, &reply.text);
                    tracker.advance(BatchState::Failed);
                    return Attempt::Finished(BatchState::Failed);
                }

                tracker.advance(BatchState::RepairAttempted);
                let repairer = Repairer::new(&self.dispatcher)
                    .with_attempts(self.repair.attempts)
                    .with_options(self.dispatch);
                match repairer.repair(&reply.text, &self.backends).await {
                    Ok(candidates) => {
                        tracker.advance(BatchState::Extracted);
                        candidates
                    }
                    Err(e) => {
                        save_raw(ctx, batch, &reply.text);
                        if e.is_quota() {
                            tracker.advance(BatchState::QuotaAborted);
                            return Attempt::QuotaAborted(e.to_string());
                        }
                        warn!(batch = %label, error = %e, "repair failed");
                        tracker.advance(BatchState::Failed);
                        return Attempt::Finished(BatchState::Failed);
                    }
                }
            }
        };

        let lookup = StoreLookup::new(self.store.as_ref());
        let classification = classify(candidates, batch, &lookup, &self.thresholds);
        tracker.advance(BatchState::Classified);

        let report = apply(&classification, self.store.as_ref(), self.dry_run);
        ctx.stats.absorb(&classification, &report);
        ctx.artifacts.record(batch, &classification);
        info!(
            batch = %label,
            backend = %reply.backend,
            applied = report.applied,
            queued = classification.review.len(),
            created = report.created,
            invalid = classification.invalid.len(),
            "batch done"
        );
        tracker.advance(BatchState::Done);
        Attempt::Finished(BatchState::Done)
    }

    async fn pace(&self, last_failed: bool) {
        let delay = self.pacing.delay(last_failed);
        if !delay.is_zero() {
            debug!(ms = delay.as_millis() as u64, last_failed, "pacing");
            tokio::time::sleep(delay).await;
        }
    }
}

fn save_raw(ctx: &RunContext, batch: &Batch, raw: &str) {
    match ctx.artifacts.save_failed_response(batch, raw) {
        Ok(path) => info!(batch = %batch.label(), path = %path.display(), "raw response saved"),
        Err(e) => error!(batch = %batch.label(), error = %e, "cannot save raw response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, MockBackend, MockReply};
    use crate::model::{CanonicalEntry, WorkItem};
    use crate::storage::{OpenStore, SqliteStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn store() -> Arc<SqliteStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        for (id, text) in [("r1", "Alpha"), ("r2", "Beta"), ("r3", "Gamma")] {
            store.insert_canonical(&CanonicalEntry::new(id, text)).unwrap();
        }
        for (id, coll, text) in [
            ("i1", "c1", "alpha"),
            ("i2", "c1", "beta"),
            ("j1", "c2", "gamma"),
            ("j2", "c2", "delta"),
        ] {
            store.upsert_target_item(&TargetItem::new(id, coll, text)).unwrap();
        }
        Arc::new(store)
    }

    fn batch(collections: &[&str]) -> Batch {
        Batch::new(
            collections.iter().map(|c| WorkItem::new(*c, 2, 2)).collect(),
            50,
            150,
        )
    }

    fn reply(matches: &[(&str, &str, &str, &str, f64)]) -> String {
        let matches: Vec<serde_json::Value> = matches
            .iter()
            .map(|(reference, item, collection, kind, confidence)| {
                serde_json::json!({
                    "reference_id": reference,
                    "target_item_id": item,
                    "target_collection_id": collection,
                    "match_kind": kind,
                    "confidence": confidence,
                })
            })
            .collect();
        format!("Here you go:\n```json\n{}\n```", serde_json::json!({ "matches": matches }))
    }

    fn controller(
        store: Arc<SqliteStore>,
        backends: Vec<(&str, u32, Arc<MockBackend>)>,
        dir: &TempDir,
    ) -> RunController {
        let descriptors = backends
            .into_iter()
            .map(|(name, priority, mock)| BackendDescriptor::new(name, priority, mock))
            .collect();
        RunController::new(
            store,
            descriptors,
            dir.path().join("checkpoints"),
            dir.path().join("out"),
        )
    }

    fn correspondence(store: &SqliteStore, item: &str) -> Option<String> {
        store.target_item(item).unwrap().and_then(|i| i.correspondence)
    }

    #[tokio::test]
    async fn applies_confident_matches_and_queues_the_rest() {
        let dir = TempDir::new().unwrap();
        let store = store();
        let mock = Arc::new(MockBackend::replying(reply(&[
            ("r1", "i1", "c1", "EXACT", 98.0),
            ("r2", "i2", "c1", "AMBIGUOUS", 99.0),
        ])));
        let run = controller(store.clone(), vec![("primary", 1, mock.clone())], &dir);

        let report = run.run(vec![batch(&["c1"])]).await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.stats.applied, 1);
        assert_eq!(report.stats.queued, 1);
        assert_eq!(report.batches[0].state, BatchState::Done);
        assert_eq!(correspondence(&store, "i1").as_deref(), Some("r1"));
        assert_eq!(correspondence(&store, "i2"), None);
        assert_eq!(report.artifacts.len(), 1);
        assert!(mock.prompts()[0].contains("alpha"));
    }

    #[tokio::test]
    async fn quota_error_checkpoints_current_and_remaining_batches() {
        let dir = TempDir::new().unwrap();
        let store = store();
        let limited = Arc::new(MockBackend::failing("429 Too Many Requests"));
        let fallback = Arc::new(MockBackend::replying(reply(&[])));
        let run = controller(
            store,
            vec![("limited", 1, limited.clone()), ("fallback", 2, fallback.clone())],
            &dir,
        );

        let report = run.run(vec![batch(&["c1"]), batch(&["c2"])]).await.unwrap();

        assert!(report.is_aborted());
        assert!(matches!(
            report.status,
            RunStatus::Aborted { status: CheckpointStatus::QuotaExhausted, .. }
        ));
        assert_eq!(fallback.calls(), 0);
        assert_eq!(limited.calls(), 1);

        let checkpoint = CheckpointManager::load(report.checkpoint_path.unwrap()).unwrap();
        assert_eq!(checkpoint.remaining_batches.len(), 2);
        assert_eq!(checkpoint.stopped_at_index, 0);
        assert_eq!(checkpoint.completed_count, 0);
    }

    #[tokio::test]
    async fn malformed_response_is_repaired_once_then_run_continues() {
        let dir = TempDir::new().unwrap();
        let store = store();
        let mock = Arc::new(MockBackend::scripted(vec![
            MockReply::Text("I could not decide {".to_string()),
            MockReply::Text("still no json".to_string()),
            MockReply::Text(reply(&[("r3", "j1", "c2", "EXACT", 99.0)])),
        ]));
        let run = controller(store.clone(), vec![("primary", 1, mock.clone())], &dir);

        let report = run.run(vec![batch(&["c1"]), batch(&["c2"])]).await.unwrap();

        assert_eq!(mock.calls(), 3);
        assert_eq!(report.status, RunStatus::Completed);
        let states: Vec<BatchState> = report.batches.iter().map(|b| b.state).collect();
        assert_eq!(states, vec![BatchState::Failed, BatchState::Done]);
        assert_eq!(report.stats.batches_failed, 1);
        assert_eq!(correspondence(&store, "j1").as_deref(), Some("r3"));

        let failed: Vec<_> = std::fs::read_dir(dir.path().join("out"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("failed_c1_"))
            .collect();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn repair_disabled_fails_without_second_call() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockBackend::replying("nothing structured"));
        let run = controller(store(), vec![("primary", 1, mock.clone())], &dir).with_repair(
            RepairConfig {
                enabled: false,
                attempts: 1,
            },
        );

        let report = run.run(vec![batch(&["c1"])]).await.unwrap();

        assert_eq!(mock.calls(), 1);
        assert_eq!(report.batches[0].state, BatchState::Failed);
    }

    #[tokio::test]
    async fn exhausted_batch_splits_once_and_sub_batches_are_not_split_again() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open_in_memory().unwrap();
        let collections: Vec<String> = (0..12).map(|n| format!("c{:02}", n)).collect();
        for collection in &collections {
            store
                .upsert_target_item(&TargetItem::new(format!("{}-a", collection), collection.as_str(), "x"))
                .unwrap();
        }
        let big = Batch::new(
            collections.iter().map(|c| WorkItem::new(c.as_str(), 1, 1)).collect(),
            50,
            150,
        );
        let mock = Arc::new(MockBackend::failing("connection reset"));
        let run = controller(Arc::new(store), vec![("primary", 1, mock.clone())], &dir);

        let report = run.run(vec![big]).await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        // one original dispatch plus one per sub-batch of 5, 5 and 2 items
        assert_eq!(mock.calls(), 4);
        assert_eq!(report.stats.batches_split, 1);
        assert_eq!(report.stats.sub_batches, 3);
        assert_eq!(report.stats.batches_failed, 3);
        assert_eq!(report.batches[0].split_into, 3);
        assert!(report.batches[1..].iter().all(|b| b.is_retry && b.state == BatchState::Failed));
    }

    #[tokio::test]
    async fn small_exhausted_batch_is_not_split() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockBackend::failing("connection reset"));
        let run = controller(store(), vec![("primary", 1, mock.clone())], &dir);

        let report = run.run(vec![batch(&["c1", "c2"])]).await.unwrap();

        assert_eq!(mock.calls(), 1);
        assert_eq!(report.stats.batches_split, 0);
        assert_eq!(report.stats.batches_failed, 1);
    }

    #[tokio::test]
    async fn cancelled_run_checkpoints_everything_without_dispatching() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockBackend::replying(reply(&[])));
        let run = controller(store(), vec![("primary", 1, mock.clone())], &dir);
        run.cancellation().cancel();

        let report = run.run(vec![batch(&["c1"]), batch(&["c2"])]).await.unwrap();

        assert_eq!(mock.calls(), 0);
        assert!(matches!(
            report.status,
            RunStatus::Aborted { status: CheckpointStatus::Interrupted, .. }
        ));
        let checkpoint = CheckpointManager::load(report.checkpoint_path.unwrap()).unwrap();
        assert_eq!(checkpoint.remaining_batches.len(), 2);
    }

    #[tokio::test]
    async fn resume_never_reapplies_or_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = store();
        // applied before the interruption
        assert!(store.set_correspondence("i1", "c1", "r1").unwrap());

        let checkpoint = RunCheckpoint {
            remaining_batches: vec![batch(&["c1"])],
            completed_count: 1,
            failed_count: 0,
            total_batches: 2,
            stopped_at_index: 1,
            status: CheckpointStatus::QuotaExhausted,
            reason: "quota".to_string(),
            timestamp: Utc::now(),
        };
        let mock = Arc::new(MockBackend::scripted(vec![MockReply::Text(reply(&[
            ("r1", "i1", "c1", "EXACT", 99.0),
            ("r2", "i2", "c1", "EXACT", 99.0),
        ]))]));
        let run = controller(store.clone(), vec![("primary", 1, mock.clone())], &dir);

        let report = run.resume(&checkpoint).await.unwrap();

        assert_eq!(report.stats.already_applied, 1);
        assert_eq!(report.stats.applied, 1);
        assert_eq!(correspondence(&store, "i1").as_deref(), Some("r1"));
        assert_eq!(correspondence(&store, "i2").as_deref(), Some("r2"));
        // the prompt only lists what is still pending
        assert!(!mock.prompts()[0].contains("\"i1\""));
    }

    #[tokio::test]
    async fn dry_run_counts_without_writing() {
        let dir = TempDir::new().unwrap();
        let store = store();
        let mock = Arc::new(MockBackend::replying(reply(&[
            ("r1", "i1", "c1", "EXACT", 99.0),
            ("", "i2", "c1", "NEW", 90.0),
        ])));
        let run = controller(store.clone(), vec![("primary", 1, mock)], &dir).dry_run(true);

        let report = run.run(vec![batch(&["c1"])]).await.unwrap();

        assert_eq!(report.stats.applied, 1);
        assert_eq!(report.stats.created, 1);
        assert_eq!(correspondence(&store, "i1"), None);
        assert_eq!(store.canonical_entries().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn batch_with_nothing_pending_is_skipped() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockBackend::replying(reply(&[])));
        let run = controller(store(), vec![("primary", 1, mock.clone())], &dir);

        let report = run.run(vec![batch(&["gone"])]).await.unwrap();

        assert_eq!(mock.calls(), 0);
        assert_eq!(report.stats.batches_skipped, 1);
        assert_eq!(report.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn quota_during_repair_aborts_the_run() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockBackend::scripted(vec![
            MockReply::Text("garbled".to_string()),
            MockReply::Error(BackendError::Failed("monthly quota exceeded".to_string())),
        ]));
        let run = controller(store(), vec![("primary", 1, mock.clone())], &dir);

        let report = run.run(vec![batch(&["c1"]), batch(&["c2"])]).await.unwrap();

        assert_eq!(mock.calls(), 2);
        assert_eq!(report.batches[0].state, BatchState::QuotaAborted);
        let checkpoint = CheckpointManager::load(report.checkpoint_path.unwrap()).unwrap();
        assert_eq!(checkpoint.remaining_batches.len(), 2);
    }

    #[tokio::test]
    async fn repair_falls_through_quota_when_stop_on_quota_is_off() {
        let dir = TempDir::new().unwrap();
        let store = store();
        let limited = Arc::new(MockBackend::scripted(vec![
            MockReply::Text("garbled {".to_string()),
            MockReply::Error(BackendError::Failed("quota exceeded".to_string())),
        ]));
        let spare = Arc::new(MockBackend::replying(reply(&[("r1", "i1", "c1", "EXACT", 98.0)])));
        let run = controller(
            store.clone(),
            vec![("limited", 1, limited.clone()), ("spare", 2, spare.clone())],
            &dir,
        )
        .with_dispatch_options(DispatchOptions { stop_on_quota: false });

        let report = run.run(vec![batch(&["c1"])]).await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(limited.calls(), 2);
        assert_eq!(spare.calls(), 1);
        assert_eq!(report.batches[0].state, BatchState::Done);
        assert_eq!(correspondence(&store, "i1").as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn unwritable_output_dir_keeps_the_report() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let store = store();
        let mock = Arc::new(MockBackend::scripted(vec![
            MockReply::Text(reply(&[
                ("r1", "i1", "c1", "EXACT", 98.0),
                ("r2", "i2", "c1", "AMBIGUOUS", 99.0),
            ])),
            MockReply::Error(BackendError::Failed("quota exceeded".to_string())),
        ]));
        let run = RunController::new(
            store.clone(),
            vec![BackendDescriptor::new("primary", 1, mock.clone())],
            dir.path().join("checkpoints"),
            blocker.join("out"),
        );

        let report = run.run(vec![batch(&["c1"]), batch(&["c2"])]).await.unwrap();

        assert!(report.is_aborted());
        assert!(report.artifact_error.is_some());
        assert!(report.artifacts.is_empty());
        assert_eq!(report.stats.applied, 1);
        assert_eq!(report.stats.queued, 1);
        let checkpoint = CheckpointManager::load(report.checkpoint_path.unwrap()).unwrap();
        assert_eq!(checkpoint.remaining_batches.len(), 1);
        assert_eq!(correspondence(&store, "i1").as_deref(), Some("r1"));
    }

    /// Delegates to a SQLite store but fails every write to one item.
    struct RefusingStore {
        inner: Arc<SqliteStore>,
        refused_item: String,
    }

    impl RecordStore for RefusingStore {
        fn work_items(&self, filter: Option<&[String]>) -> StorageResult<Vec<WorkItem>> {
            self.inner.work_items(filter)
        }

        fn pending_items(&self, collection_id: &str) -> StorageResult<Vec<TargetItem>> {
            self.inner.pending_items(collection_id)
        }

        fn canonical_entries(&self) -> StorageResult<Vec<CanonicalEntry>> {
            self.inner.canonical_entries()
        }

        fn target_item(&self, item_id: &str) -> StorageResult<Option<TargetItem>> {
            self.inner.target_item(item_id)
        }

        fn has_canonical(&self, reference_id: &str) -> StorageResult<bool> {
            self.inner.has_canonical(reference_id)
        }

        fn item_for_reference(
            &self,
            collection_id: &str,
            reference_id: &str,
        ) -> StorageResult<Option<String>> {
            self.inner.item_for_reference(collection_id, reference_id)
        }

        fn set_correspondence(
            &self,
            item_id: &str,
            collection_id: &str,
            reference_id: &str,
        ) -> StorageResult<bool> {
            if item_id == self.refused_item {
                return Err(StorageError::LockPoisoned);
            }
            self.inner.set_correspondence(item_id, collection_id, reference_id)
        }

        fn insert_canonical(&self, entry: &CanonicalEntry) -> StorageResult<()> {
            self.inner.insert_canonical(entry)
        }

        fn create_and_link(
            &self,
            entry: &CanonicalEntry,
            item_id: &str,
            collection_id: &str,
        ) -> StorageResult<bool> {
            if item_id == self.refused_item {
                return Err(StorageError::LockPoisoned);
            }
            self.inner.create_and_link(entry, item_id, collection_id)
        }

        fn upsert_target_item(&self, item: &TargetItem) -> StorageResult<()> {
            self.inner.upsert_target_item(item)
        }
    }

    #[tokio::test]
    async fn failed_write_is_counted_and_the_batch_still_finishes() {
        let dir = TempDir::new().unwrap();
        let inner = store();
        let refusing = Arc::new(RefusingStore {
            inner: inner.clone(),
            refused_item: "i1".to_string(),
        });
        let mock = Arc::new(MockBackend::replying(reply(&[
            ("r1", "i1", "c1", "EXACT", 98.0),
            ("r2", "i2", "c1", "EXACT", 97.0),
        ])));
        let run = RunController::new(
            refusing,
            vec![BackendDescriptor::new("primary", 1, mock)],
            dir.path().join("checkpoints"),
            dir.path().join("out"),
        );

        let report = run.run(vec![batch(&["c1"])]).await.unwrap();

        assert_eq!(report.stats.write_failures, 1);
        assert_eq!(report.stats.applied, 1);
        assert_eq!(report.batches[0].state, BatchState::Done);
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(correspondence(&inner, "i1"), None);
        assert_eq!(correspondence(&inner, "i2").as_deref(), Some("r2"));
    }

    struct CountingPacing(Arc<AtomicUsize>);

    impl PacingPolicy for CountingPacing {
        fn delay(&self, _last_failed: bool) -> Duration {
            self.0.fetch_add(1, Ordering::SeqCst);
            Duration::ZERO
        }
    }

    #[tokio::test]
    async fn pacing_only_between_dispatches() {
        let dir = TempDir::new().unwrap();
        let consulted = Arc::new(AtomicUsize::new(0));
        let mock = Arc::new(MockBackend::replying(reply(&[])));
        let run = controller(store(), vec![("primary", 1, mock.clone())], &dir)
            .with_pacing(Box::new(CountingPacing(consulted.clone())));

        let report = run.run(vec![batch(&["c1"]), batch(&["c2"])]).await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(mock.calls(), 2);
        assert_eq!(consulted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_backends_is_a_run_error() {
        let dir = TempDir::new().unwrap();
        let run = controller(store(), vec![], &dir);
        assert!(matches!(run.run(vec![batch(&["c1"])]).await, Err(RunError::NoBackends)));
    }

    #[test]
    fn state_machine_edges() {
        assert!(BatchState::Pending.can_advance_to(BatchState::Dispatched));
        assert!(BatchState::ExtractFailed.can_advance_to(BatchState::RepairAttempted));
        assert!(!BatchState::Done.can_advance_to(BatchState::Dispatched));
        assert!(!BatchState::RepairAttempted.can_advance_to(BatchState::RepairAttempted));
        assert!(BatchState::QuotaAborted.is_terminal());
        assert!(!BatchState::Classified.is_terminal());
    }
}
