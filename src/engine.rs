// src/engine.rs

//! `AofEngine`: the single owned facade tying together the Manifest Store,
//! Writer, Loader, and Rewriter (spec.md §6, Design Notes §9 "a dispatch
//! context parameter rather than a 'client' subtype" (the engine itself is
//! the other half of that note, "implement as a single owned value"). The
//! shared-mutable-state shape (`Arc<Mutex<...>>` plus atomics read outside
//! the lock) is grounded in the teacher's `core/state/persistence.rs`.

use crate::bio::{BackgroundIo, BioJob, TokioBio};
use crate::collaborators::{DatasetSource, Dispatcher, ReplOffsetWatermark};
use crate::config::AofConfig;
use crate::error::{AofError, FatalPolicy};
use crate::events::{DegradationSink, EventBus, PropagatedWork, UnitOfWork};
use crate::loader::{LoadOutcome, Loader, SnapshotSource};
use crate::manifest::AofManifest;
use crate::rewriter::{RewriteState, Rewriter};
use crate::writer::Writer;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{error, info, warn};

/// A point-in-time report of engine health (spec.md §6 `status()`), plus
/// the supplemented footprint fields from `aof.c`'s
/// `getBaseAndIncrAppendOnlyFilesSize`/`*FilesNum` (SPEC_FULL.md §9 item 2).
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub state: RewriteState,
    pub current_incr_size: u64,
    pub rewrite_base_size: u64,
    pub total_size_bytes: u64,
    pub file_count: usize,
    pub fsynced_reploff_pending: u64,
    pub fsynced_reploff: u64,
    pub read_only: bool,
}

/// Inner, lock-protected engine state. Everything that must change
/// atomically together (manifest, writer, rewriter) lives here; cheap
/// cross-cutting flags live as atomics beside it, readable without the lock.
struct Inner {
    manifest: AofManifest,
    writer: Writer,
    rewriter: Rewriter,
}

pub struct AofEngine {
    config: AofConfig,
    inner: Mutex<Inner>,
    repl_offset: Arc<ReplOffsetWatermark>,
    bio: Arc<dyn BackgroundIo>,
    events: EventBus,
    read_only: Arc<AtomicBool>,
    fatal_policy: FatalPolicy,
    rewrite_complete_tx: watch::Sender<()>,
    /// Registered by the host via [`AofEngine::set_dataset_source`] so the
    /// writer task can self-trigger a ratio/scheduled-retry rewrite
    /// (spec.md §4.4) without the host having to poll `status()` itself.
    /// `None` until registered, in which case automatic rewrites don't fire
    /// and only [`AofEngine::trigger_rewrite`] (host- or command-driven) can
    /// start one.
    dataset: Mutex<Option<Arc<dyn DatasetSource>>>,
}

impl AofEngine {
    /// `configure(options)` (spec.md §6): builds a freshly-configured,
    /// disabled engine. Callers that want to restore from disk should
    /// follow with [`AofEngine::load`].
    pub fn configure(config: AofConfig, fatal_policy: FatalPolicy) -> (Self, mpsc::Receiver<PropagatedWork>) {
        let (events, aof_rx) = EventBus::new(true);
        let repl_offset = Arc::new(ReplOffsetWatermark::new());
        let (rewrite_complete_tx, _rx) = watch::channel(());
        let bio: Arc<dyn BackgroundIo> = Arc::new(TokioBio::spawn());

        let engine = Self {
            config: config.clone(),
            inner: Mutex::new(Inner {
                manifest: AofManifest::empty(),
                writer: Writer::new(config.clone(), repl_offset.clone(), fatal_policy, bio.clone()),
                rewriter: Rewriter::new(config),
            }),
            repl_offset,
            bio,
            events,
            read_only: Arc::new(AtomicBool::new(false)),
            fatal_policy,
            rewrite_complete_tx,
            dataset: Mutex::new(None),
        };
        (engine, aof_rx.expect("AOF channel always created by EventBus::new(true)"))
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    /// Registers the collaborator [`AofEngine::run_writer_task`] exports a
    /// dataset snapshot through when it self-triggers a rewrite. A host that
    /// never calls this still gets explicit [`AofEngine::trigger_rewrite`]
    /// calls; it just doesn't get automatic ratio/scheduled-retry rewrites.
    pub async fn set_dataset_source(&self, dataset: Arc<dyn DatasetSource>) {
        *self.dataset.lock().await = Some(dataset);
    }

    /// A `watch` receiver that fires once per completed rewrite (success
    /// path only; see [`Self::status`] for the state after a failed one).
    /// Hosts use this the same way the teacher's `AofWriterTask` watches
    /// `aof_rewrite_complete_rx`; tests use it to wait for a triggered
    /// rewrite to land instead of polling `status()` on a timer.
    pub fn subscribe_rewrite_complete(&self) -> watch::Receiver<()> {
        self.rewrite_complete_tx.subscribe()
    }

    fn degradation_sink(&self) -> LoggingSink {
        LoggingSink(self.read_only.clone())
    }

    /// On startup: loads the manifest and replays the file-set (spec.md
    /// §4.3), then opens the last INCR (or none, if `NotExist`) for append.
    /// Per spec.md §7, any failure here is a startup error and must
    /// terminate the process; `fatal_policy` decides how.
    pub async fn load(&self, dispatcher: &dyn Dispatcher, snapshot: Option<&dyn SnapshotSource>) -> Result<LoadOutcome, AofError> {
        let loader = Loader::new(&self.config);
        let (manifest, outcome) = match loader.load(dispatcher, snapshot) {
            Ok(v) => v,
            Err(e) => return Err(self.fatal_policy.handle(e.into_fatal())),
        };

        let mut inner = self.inner.lock().await;
        if let Some(last_incr) = manifest.last_incr() {
            let path = self.config.path_in_dir(&last_incr.file_name);
            if let Err(e) = inner.writer.open_for_append(path) {
                return Err(self.fatal_policy.handle(e.into_fatal()));
            }
            inner.rewriter.state = RewriteState::On;
        }
        inner.manifest = manifest;
        Ok(outcome)
    }

    /// `enable()` (spec.md §6): State must be OFF. Transitions to
    /// WAIT_REWRITE; the caller is expected to follow with a manual
    /// [`AofEngine::trigger_rewrite`] to produce the initial BASE.
    pub async fn enable(&self) -> Result<(), AofError> {
        let mut inner = self.inner.lock().await;
        if inner.rewriter.state != RewriteState::Off {
            return Err(AofError::InvalidState("enable() requires state OFF".into()));
        }
        inner.rewriter.state = RewriteState::WaitRewrite;
        info!("AOF enabled; transitioning OFF -> WAIT_REWRITE");
        Ok(())
    }

    /// `disable()` (spec.md §6): State must not already be OFF. Forces a
    /// flush+fsync, closes the fd via the background close worker, and
    /// transitions to OFF.
    pub async fn disable(&self) -> Result<(), AofError> {
        let mut inner = self.inner.lock().await;
        if inner.rewriter.state == RewriteState::Off {
            return Err(AofError::InvalidState("disable() requires state != OFF".into()));
        }
        let sink = self.degradation_sink();
        inner.writer.flush(true, &sink)?;
        inner.rewriter.state = RewriteState::Off;
        info!("AOF disabled");
        Ok(())
    }

    /// `append(db, argv)` (spec.md §6): enqueues a unit of work onto the
    /// AOF channel; the Writer task (see [`Self::run_writer_task`]) is the
    /// only consumer, matching the teacher's dispatcher-calls-publish shape.
    pub fn publish(&self, uow: UnitOfWork) {
        let sink = self.degradation_sink();
        self.events.publish(uow, &sink);
    }

    /// `flush(force)` (spec.md §6): drains the buffer per the configured
    /// policy. Called by the writer task before each event-loop iteration.
    pub async fn flush(&self, force: bool) -> Result<(), AofError> {
        let mut inner = self.inner.lock().await;
        let sink = self.degradation_sink();
        if inner.rewriter.is_in_progress() && self.config.no_fsync_on_rewrite {
            // Documented tradeoff (SPEC_FULL.md Open Question decision): under
            // `ALWAYS` this still means a flush during an active rewrite skips
            // the synchronous fsync a client reply already promised. This is
            // surfaced here, not hidden: operators combining `no_fsync_on_rewrite`
            // with `ALWAYS` accept a narrower durability window during rewrites.
            return inner.writer.write_buffer_only(&sink);
        }
        inner.writer.flush(force, &sink)
    }

    /// The Writer task's main consumption loop: drains `aof_rx` and appends
    /// each unit of work, periodically flushing. Mirrors the teacher's
    /// `AofWriterTask::run` select loop, generalized to the manifest-based Writer.
    pub async fn run_writer_task(
        self: Arc<Self>,
        mut aof_rx: mpsc::Receiver<PropagatedWork>,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) {
        let mut fsync_interval = tokio::time::interval(std::time::Duration::from_millis(100));
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("AOF writer task shutting down; draining and syncing");
                    while let Ok(work) = aof_rx.try_recv() {
                        self.append_work(work).await;
                    }
                    if let Err(e) = self.flush(true).await {
                        warn!("final AOF flush on shutdown failed: {e}");
                    }
                    return;
                }
                _ = fsync_interval.tick() => {
                    if let Err(e) = self.flush(false).await {
                        warn!("periodic AOF flush failed: {e}");
                    }
                    self.maybe_auto_rewrite().await;
                }
                maybe_work = aof_rx.recv() => {
                    match maybe_work {
                        Some(work) => self.append_work(work).await,
                        None => {
                            info!("AOF channel closed; writer task shutting down");
                            let _ = self.flush(true).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Evaluates the ratio trigger and the failure-backoff scheduled retry
    /// (spec.md §4.4) and starts a rewrite if both the condition and the
    /// backoff window allow it. A no-op if no dataset source was registered
    /// via [`AofEngine::set_dataset_source`].
    async fn maybe_auto_rewrite(self: &Arc<Self>) {
        let dataset = self.dataset.lock().await.clone();
        let Some(dataset) = dataset else {
            return;
        };

        let should_trigger = {
            let inner = self.inner.lock().await;
            !inner.rewriter.is_in_progress()
                && !inner.rewriter.backoff.is_blocked()
                && inner.rewriter.should_trigger_by_ratio(inner.writer.current_size())
        };
        if !should_trigger {
            return;
        }

        if let Err(e) = self.trigger_rewrite(false, dataset).await {
            warn!("automatic AOF rewrite trigger failed: {e}");
        }
    }

    async fn append_work(&self, work: PropagatedWork) {
        let mut inner = self.inner.lock().await;
        let now = now_unix_secs();
        inner.writer.append_unit_of_work(&work.uow, now);
        let sink = self.degradation_sink();
        if let Err(e) = inner.writer.flush(false, &sink) {
            warn!("AOF flush after append failed: {e}");
        }
    }

    /// `triggerRewrite(manual)` (spec.md §6): no rewrite may already be in
    /// progress. Spawns the reconstruction child and, once it resolves,
    /// drives the child-done handler.
    pub async fn trigger_rewrite(
        self: &Arc<Self>,
        manual: bool,
        dataset: Arc<dyn crate::collaborators::DatasetSource>,
    ) -> Result<(), AofError> {
        let (dup, incr_path, old_fd) = {
            let mut inner = self.inner.lock().await;
            if inner.rewriter.is_in_progress() {
                return Err(AofError::InvalidState("rewrite already in progress".into()));
            }
            if manual {
                inner.rewriter.backoff.record_manual_trigger();
            } else if inner.rewriter.backoff.is_blocked() {
                return Err(AofError::InvalidState("rewrite backoff window active".into()));
            }

            let sink = self.degradation_sink();
            inner.writer.flush(true, &sink)?;

            let manifest_snapshot = inner.manifest.clone();
            let (dup, incr_path) = inner.rewriter.begin(&manifest_snapshot)?;

            // Parent protocol step 5: hand the previous INCR fd to the
            // background close-and-fsync worker before swapping the new one
            // in, so anything already queued for fsync lands first.
            let old_fd = inner.writer.take_current_fd();
            inner.writer.open_for_append(incr_path.clone())?;
            (dup, incr_path, old_fd)
        };

        if let Some(fd) = old_fd {
            self.bio.submit(BioJob::CloseAof { fd });
        }

        let use_snapshot_preamble = self.config.use_snapshot_preamble;
        let (child_id, handle) = {
            let inner = self.inner.lock().await;
            inner.rewriter.spawn_child(dataset, use_snapshot_preamble)
        };

        let engine = self.clone();
        let temp_base_path = self.config.path_in_dir(&self.config.child_temp_name(child_id));
        tokio::spawn(async move {
            match handle.await {
                Ok(outcome) => engine.on_child_exit(dup, outcome).await,
                Err(join_err) => {
                    // A panicked "child" is still a rewrite failure (spec.md
                    // §7 "fork fails"): the failure counter must advance and
                    // `in_progress` must clear, or every later rewrite is
                    // permanently blocked.
                    error!("AOF rewrite child task panicked: {join_err}");
                    let failure_outcome = crate::rewriter::RewriteOutcome {
                        child_id,
                        temp_base_path,
                        success: false,
                    };
                    engine.on_child_exit(dup, failure_outcome).await;
                }
            }
        });

        let _ = incr_path;
        Ok(())
    }

    /// `onChildExit(code, signal)` (spec.md §6): runs the success or
    /// failure completion handler.
    async fn on_child_exit(self: Arc<Self>, dup: AofManifest, outcome: crate::rewriter::RewriteOutcome) {
        let mut inner = self.inner.lock().await;
        if outcome.success {
            let was_wait_rewrite = inner.rewriter.state == RewriteState::WaitRewrite;
            match inner.rewriter.complete_success(dup, &outcome, self.bio.as_ref()) {
                Ok(new_manifest) => {
                    inner.manifest = new_manifest;
                    if was_wait_rewrite {
                        // spec.md §5: the WAIT_REWRITE -> ON transition is a
                        // controlled drain point, wait for every fsync job
                        // enqueued before this point to land so a reader of
                        // `fsynced_reploff` never observes it out of order.
                        if let Err(e) = inner.writer.drain_fsync().await {
                            warn!("fsync drain at WAIT_REWRITE -> ON transition failed: {e}");
                        }
                    }
                    let _ = self.rewrite_complete_tx.send(());
                }
                Err(e) => {
                    error!("failed to persist manifest after successful rewrite: {e}");
                    self.degradation_sink().mark_degraded("AOF manifest persist failure after rewrite");
                }
            }
        } else {
            inner.rewriter.complete_failure(&outcome, self.bio.as_ref());
        }
    }

    /// `status()` (spec.md §6), extended with the footprint fields
    /// supplemented from `aof.c` (SPEC_FULL.md §9 item 2).
    pub async fn status(&self) -> EngineStatus {
        let inner = self.inner.lock().await;
        let file_count = inner.manifest.base.is_some() as usize
            + inner.manifest.incr_list.len()
            + inner.manifest.history_list.len();
        EngineStatus {
            state: inner.rewriter.state,
            current_incr_size: inner.writer.current_size(),
            rewrite_base_size: inner.rewriter.rewrite_base_size,
            total_size_bytes: inner.rewriter.rewrite_base_size + inner.writer.current_size(),
            file_count,
            fsynced_reploff_pending: self.repl_offset.pending(),
            fsynced_reploff: self.repl_offset.committed(),
            read_only: self.is_read_only(),
        }
    }

    /// Exposes the manifest's HISTORY entries for sweeping (SPEC_FULL.md §9
    /// item 3, `aof.c`'s `aofDelHistoryFiles`).
    pub async fn sweep_history(&self) {
        let mut inner = self.inner.lock().await;
        if self.config.disable_auto_gc {
            return;
        }
        for history in inner.manifest.take_history() {
            self.bio.submit(BioJob::Unlink {
                path: self.config.path_in_dir(&history.file_name),
            });
        }
    }
}

fn now_unix_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct LoggingSink(Arc<AtomicBool>);
impl DegradationSink for LoggingSink {
    fn mark_degraded(&self, reason: &str) {
        error!("{reason}");
        self.0.store(true, Ordering::Relaxed);
    }
}
