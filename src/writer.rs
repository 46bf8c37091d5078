// src/writer.rs

//! The Writer (spec.md §4.2): buffers encoded commands and flushes them to
//! the current INCR file under a configured durability policy. Grounded in
//! the teacher's `aof_writer.rs` (the task shape: one owned file handle, a
//! buffer, a durability-policy branch on flush) and in `aof.c`'s
//! `flushAppendOnlyFile` (aof.c:1217) for the exact short-write recovery and
//! `EVERY_SEC` postponement semantics, which the teacher's own
//! `tokio::io::BufWriter`-based writer does not reproduce (it relies on the
//! OS/runtime to retry, whereas spec.md requires the engine to own that
//! recovery explicitly).

use crate::bio::BackgroundIo;
use crate::collaborators::ReplOffsetWatermark;
use crate::config::{AofConfig, AppendFsync};
use crate::error::{AofError, FatalPolicy};
use crate::events::{DegradationSink, UnitOfWork};
use crate::resp::{encode_argv, encode_timestamp_annotation};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write as _};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// How long `EVERY_SEC` may postpone a flush while a previous fsync is still
/// outstanding before giving up and proceeding anyway (spec.md §4.2; matches
/// `aof.c`'s `AOF_FLUSH_POSTPONE_TIME_LIMIT` of two seconds).
const FLUSH_POSTPONE_LIMIT: Duration = Duration::from_secs(2);

/// Observable write status, mirroring `aof.c`'s `server.aof_last_write_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Ok,
    Err,
}

/// Everything the Writer tracks about the currently-open append file
/// (spec.md §4.2 "State tracked by the Writer").
pub struct Writer {
    config: AofConfig,
    current_fd: Option<Arc<File>>,
    current_path: Option<PathBuf>,
    buffer: Vec<u8>,
    current_size: u64,
    last_incr_size: u64,
    /// How many bytes of the current INCR are known to be fsynced. Shared
    /// with the background fsync completion task spawned by
    /// [`Self::enqueue_background_fsync`], since that task updates it after
    /// the Writer's own call has already returned.
    last_incr_fsync_offset: Arc<AtomicU64>,
    last_fsync_time: Option<Instant>,
    /// Set while a background `EVERY_SEC` fsync job is in flight; cleared by
    /// the completion task. Read-modify-write happens only under the
    /// engine's single writer-task ownership, but the flag itself is shared
    /// with a detached task, hence the atomic.
    fsync_outstanding: Arc<AtomicBool>,
    flush_postponed_since: Option<Instant>,
    pub last_write_status: WriteStatus,
    last_selected_db: Option<usize>,
    last_annotated_second: Option<i64>,
    pub repl_offset: Arc<ReplOffsetWatermark>,
    fatal_policy: FatalPolicy,
    bio: Arc<dyn BackgroundIo>,
}

impl Writer {
    pub fn new(
        config: AofConfig,
        repl_offset: Arc<ReplOffsetWatermark>,
        fatal_policy: FatalPolicy,
        bio: Arc<dyn BackgroundIo>,
    ) -> Self {
        Self {
            config,
            current_fd: None,
            current_path: None,
            buffer: Vec::new(),
            current_size: 0,
            last_incr_size: 0,
            last_incr_fsync_offset: Arc::new(AtomicU64::new(0)),
            last_fsync_time: None,
            fsync_outstanding: Arc::new(AtomicBool::new(false)),
            flush_postponed_since: None,
            last_write_status: WriteStatus::Ok,
            last_selected_db: None,
            last_annotated_second: None,
            repl_offset,
            fatal_policy,
            bio,
        }
    }

    /// Opens `path` for append, seeding `current_size` from its existing
    /// length (used both at startup, once the Loader has positioned the last
    /// INCR, and whenever the Rewriter splices in a fresh one).
    pub fn open_for_append(&mut self, path: PathBuf) -> Result<(), AofError> {
        let fd = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AofError::Open(format!("{}: {e}", path.display())))?;
        let size = fd.metadata().map(|m| m.len()).unwrap_or(0);
        self.current_fd = Some(Arc::new(fd));
        self.current_size = size;
        self.last_incr_size = size;
        self.last_incr_fsync_offset = Arc::new(AtomicU64::new(0));
        self.fsync_outstanding = Arc::new(AtomicBool::new(false));
        self.current_path = Some(path);
        Ok(())
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    /// How many bytes of the current INCR are known to be fsynced so far.
    pub fn last_incr_fsync_offset(&self) -> u64 {
        self.last_incr_fsync_offset.load(Ordering::SeqCst)
    }

    /// Takes ownership of the currently-open append fd, leaving the Writer
    /// with none open. Used by the Rewriter's parent protocol step 5: the
    /// previous INCR fd is handed to the background close-and-fsync worker
    /// rather than dropped directly, so anything already queued for fsync
    /// against it lands before the fd is actually closed.
    pub fn take_current_fd(&mut self) -> Option<Arc<File>> {
        self.current_path = None;
        self.current_fd.take()
    }

    /// Writes the buffer without applying the durability policy (spec.md §9's
    /// documented `no_fsync_on_rewrite` tradeoff: the buffer still must reach
    /// the file so replay sees it, but no fsync is issued while a rewrite
    /// child is running).
    pub fn write_buffer_only(&mut self, _sink: &dyn DegradationSink) -> Result<(), AofError> {
        if !self.buffer.is_empty() {
            self.write_buffer()?;
        }
        Ok(())
    }

    /// `append(db_index, argv)` (spec.md §4.2): non-blocking, never touches
    /// the file. Emits a `SELECT` first on a database change, and a
    /// `#TS:<unix_seconds>` annotation first if enabled and the wall-clock
    /// second has advanced.
    pub fn append(&mut self, db_index: usize, argv: &[bytes::Bytes], now_unix_secs: i64) {
        if self.config.timestamp_enabled
            && self.last_annotated_second != Some(now_unix_secs)
        {
            self.buffer
                .extend_from_slice(&encode_timestamp_annotation(now_unix_secs));
            self.last_annotated_second = Some(now_unix_secs);
        }

        if self.last_selected_db != Some(db_index) {
            let select = vec![
                bytes::Bytes::from_static(b"SELECT"),
                bytes::Bytes::from(db_index.to_string()),
            ];
            self.buffer.extend_from_slice(&encode_argv(&select));
            self.last_selected_db = Some(db_index);
        }

        self.buffer.extend_from_slice(&encode_argv(argv));
    }

    /// Appends every command of a [`UnitOfWork`], wrapping more than one
    /// command in `MULTI`/`EXEC` the way the Loader expects to read it back
    /// (spec.md §4.3 "if inside a MULTI, enqueue; if EXEC, execute").
    pub fn append_unit_of_work(&mut self, uow: &UnitOfWork, now_unix_secs: i64) {
        let wrap = uow.commands.len() > 1;
        if wrap {
            self.append(uow.db_index, &[bytes::Bytes::from_static(b"MULTI")], now_unix_secs);
        }
        for cmd in &uow.commands {
            self.append(uow.db_index, cmd, now_unix_secs);
        }
        if wrap {
            self.append(uow.db_index, &[bytes::Bytes::from_static(b"EXEC")], now_unix_secs);
        }
    }

    /// `flush(force)` (spec.md §4.2). Under `EVERY_SEC`, a flush may itself
    /// be postponed (write included) for up to two seconds while a previous
    /// background fsync is still in flight, mirroring `aof.c`'s
    /// `aof_flush_postponed_start` window, since the `write()` call can
    /// contend with an in-flight `fsync()` on the same fd. `force` bypasses
    /// postponement entirely: callers asking for a forced flush need the
    /// bytes on disk now, not after the next tick.
    pub fn flush(&mut self, force: bool, sink: &dyn DegradationSink) -> Result<(), AofError> {
        if !force
            && self.config.fsync_policy == AppendFsync::EverySec
            && self.should_postpone_for_outstanding_fsync()
        {
            return Ok(());
        }
        if !self.buffer.is_empty() {
            self.write_buffer()?;
        }
        self.apply_fsync_policy(force, sink)
    }

    /// Returns `true` if the whole flush should be skipped this call because
    /// a previous `EVERY_SEC` background fsync job is still outstanding and
    /// the two-second postponement window hasn't elapsed yet.
    fn should_postpone_for_outstanding_fsync(&mut self) -> bool {
        if !self.fsync_outstanding.load(Ordering::SeqCst) {
            self.flush_postponed_since = None;
            return false;
        }
        let postponed_for = self.flush_postponed_since.get_or_insert_with(Instant::now).elapsed();
        if postponed_for < FLUSH_POSTPONE_LIMIT {
            return true;
        }
        warn!(
            "AOF flush postponed for {:?} by an outstanding fsync; proceeding anyway (delayed-fsync event)",
            postponed_for
        );
        self.flush_postponed_since = None;
        false
    }

    fn write_buffer(&mut self) -> Result<(), AofError> {
        let Some(fd) = self.current_fd.as_ref() else {
            return Err(AofError::InvalidState("flush called with no file open".into()));
        };
        let pre_call_size = self.current_size;
        let requested = self.buffer.len();
        let mut offset = pre_call_size;
        let mut remaining: &[u8] = &self.buffer;

        loop {
            if remaining.is_empty() {
                self.current_size = offset;
                self.last_write_status = WriteStatus::Ok;
                self.buffer.clear();
                return Ok(());
            }
            match fd.write_at(remaining, offset) {
                Ok(0) => {
                    let written = (offset - pre_call_size) as usize;
                    return self.recover_from_short_write(pre_call_size, written, requested, remaining.to_vec());
                }
                Ok(n) => {
                    offset += n as u64;
                    remaining = &remaining[n..];
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let written = (offset - pre_call_size) as usize;
                    if written > 0 {
                        return self.recover_from_short_write(pre_call_size, written, requested, remaining.to_vec());
                    }
                    return self.recover_from_hard_error(e);
                }
            }
        }
    }

    /// Mirrors `flushAppendOnlyFile`'s short-write branch (aof.c:1217):
    /// truncate back to the pre-call size so the file stays parseable; the
    /// data is then treated as fully lost and the whole buffer is retained
    /// for retry. If truncation itself fails, the written prefix is
    /// accepted and only the remaining suffix is retained.
    fn recover_from_short_write(
        &mut self,
        pre_call_size: u64,
        written: usize,
        requested: usize,
        remaining_suffix: Vec<u8>,
    ) -> Result<(), AofError> {
        self.last_write_status = WriteStatus::Err;
        let err = AofError::ShortWrite { written, requested };
        warn!("{err}");

        let Some(fd) = &self.current_fd else {
            self.buffer = remaining_suffix;
            return Ok(());
        };

        if fd.set_len(pre_call_size).is_ok() {
            // Truncate succeeded: the partial write is undone, so the whole
            // buffer (already intact in `self.buffer`, untouched by this path)
            // is retried on the next flush.
            self.current_size = pre_call_size;
            return Ok(());
        }

        error!("AOF truncate-after-short-write failed; accepting partial write of {written} bytes");
        self.current_size = pre_call_size + written as u64;
        self.buffer = remaining_suffix;
        Ok(())
    }

    fn recover_from_hard_error(&mut self, e: std::io::Error) -> Result<(), AofError> {
        self.last_write_status = WriteStatus::Err;
        let err = AofError::HardWrite(e.to_string());
        if self.config.fsync_policy == AppendFsync::Always {
            return Err(self.fatal_policy.handle(err.into_fatal()));
        }
        warn!("AOF write error absorbed under non-ALWAYS policy: {err}");
        Ok(())
    }

    /// Applies the configured durability policy after a (possibly empty)
    /// buffer flush (spec.md §4.2's policy table; `aof.c:1217`'s trailing
    /// fsync branches, which fsync even when nothing was just written).
    fn apply_fsync_policy(&mut self, force: bool, _sink: &dyn DegradationSink) -> Result<(), AofError> {
        match self.config.fsync_policy {
            AppendFsync::No => Ok(()),
            AppendFsync::Always => self.sync_now(),
            AppendFsync::EverySec => self.apply_every_sec(force),
        }
    }

    /// `EVERY_SEC` (spec.md §4.2): if due and nothing is currently
    /// outstanding, enqueues a background fsync via [`BackgroundIo`] rather
    /// than blocking the writer's own thread. `force` (a caller that needs
    /// durability immediately, e.g. `disable()`) bypasses the cadence check
    /// and the background queue entirely, syncing synchronously instead,
    /// the same thing `ALWAYS` does.
    fn apply_every_sec(&mut self, force: bool) -> Result<(), AofError> {
        if force {
            return self.sync_now();
        }

        let due = self
            .last_fsync_time
            .map(|t| t.elapsed() >= Duration::from_secs(1))
            .unwrap_or(true);
        if !due {
            return Ok(());
        }
        if self.fsync_outstanding.load(Ordering::SeqCst) {
            // A previous job hasn't completed yet; `flush` already applied
            // the postponement window before we got here, so don't stack a
            // second job on top of it; the next due tick will check again.
            return Ok(());
        }

        self.enqueue_background_fsync();
        Ok(())
    }

    /// Submits an FSYNC job to the [`BackgroundIo`] worker pool and returns
    /// immediately; a detached task awaits the result and updates
    /// `last_incr_fsync_offset` / `fsynced_reploff` once it lands (spec.md
    /// §5: "`fsynced_reploff_pending` is advanced at fsync-job enqueue time;
    /// `fsynced_reploff` is advanced when the job reports success").
    fn enqueue_background_fsync(&mut self) {
        let Some(fd) = self.current_fd.clone() else {
            return;
        };
        self.fsync_outstanding.store(true, Ordering::SeqCst);
        self.last_fsync_time = Some(Instant::now());
        let target_offset = self.current_size;
        self.repl_offset.advance_pending(target_offset);

        let rx = self.bio.submit_fsync_and_wait(fd);
        let outstanding = self.fsync_outstanding.clone();
        let last_synced = self.last_incr_fsync_offset.clone();
        let repl_offset = self.repl_offset.clone();
        tokio::spawn(async move {
            let result = rx.await;
            outstanding.store(false, Ordering::SeqCst);
            match result {
                Ok(Ok(())) => {
                    last_synced.fetch_max(target_offset, Ordering::SeqCst);
                    repl_offset.advance_committed(target_offset);
                }
                Ok(Err(e)) => warn!("background AOF fsync failed: {e}"),
                Err(_) => warn!("background AOF fsync task was dropped before it completed"),
            }
        });
    }

    /// A synchronous fsync on the writer's own thread, used by `ALWAYS`
    /// (spec.md requires it happen "synchronously on the writer thread") and
    /// by `EVERY_SEC` when `force` is set.
    fn sync_now(&mut self) -> Result<(), AofError> {
        let Some(fd) = self.current_fd.as_ref() else {
            return Ok(());
        };
        self.fsync_outstanding.store(true, Ordering::SeqCst);
        let result = fd.sync_all();
        self.fsync_outstanding.store(false, Ordering::SeqCst);
        self.last_fsync_time = Some(Instant::now());

        match result {
            Ok(()) => {
                self.last_incr_fsync_offset.store(self.current_size, Ordering::SeqCst);
                self.repl_offset.advance_pending(self.current_size);
                self.repl_offset.advance_committed(self.current_size);
                Ok(())
            }
            Err(e) => {
                let err = AofError::Fsync(e.to_string());
                error!("{err}");
                if self.config.fsync_policy == AppendFsync::Always {
                    Err(self.fatal_policy.handle(err.into_fatal()))
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Drains the background FSYNC queue by submitting one more fsync-and-
    /// wait job and awaiting it: jobs in the FSYNC category run strictly
    /// FIFO (spec.md §5), so once this resolves, every fsync enqueued
    /// before it, including whatever `EVERY_SEC` job was still outstanding,
    /// has completed. Used at the WAIT_REWRITE -> ON transition so
    /// `fsynced_reploff` is never read while a prior job could still land
    /// and reorder it (spec.md §5's "controlled drain point").
    pub async fn drain_fsync(&mut self) -> Result<(), AofError> {
        let Some(fd) = self.current_fd.clone() else {
            return Ok(());
        };
        let rx = self.bio.submit_fsync_and_wait(fd);
        match rx.await {
            Ok(Ok(())) => {
                self.fsync_outstanding.store(false, Ordering::SeqCst);
                self.last_incr_fsync_offset.store(self.current_size, Ordering::SeqCst);
                self.last_fsync_time = Some(Instant::now());
                self.repl_offset.advance_pending(self.current_size);
                self.repl_offset.advance_committed(self.current_size);
                Ok(())
            }
            Ok(Err(e)) => Err(AofError::Fsync(e.to_string())),
            // The channel was dropped (worker task gone); nothing left to drain.
            Err(_) => Ok(()),
        }
    }

    /// Truncates the current file to `len`, used by the Loader's truncation
    /// policy and by `aof-check --truncate-to-last-valid` (spec.md §4.3).
    pub fn truncate_current(&mut self, len: u64) -> Result<(), AofError> {
        if let Some(fd) = &self.current_fd {
            fd.set_len(len).map_err(|e| AofError::HardWrite(e.to_string()))?;
            let mut f = fd.try_clone().map_err(|e| AofError::Io(Arc::new(e)))?;
            f.seek(SeekFrom::Start(len))
                .map_err(|e| AofError::HardWrite(e.to_string()))?;
            self.current_size = len;
        }
        Ok(())
    }
}
