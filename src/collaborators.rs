// src/collaborators.rs

//! The seams spec.md §1 calls out as external collaborators: the command
//! dispatcher and data-type encodings, and the replication offset tracker.
//! The engine only consumes these through traits / opaque types; a host
//! (the full SpinelDB server, or a test harness) supplies the real thing.
//!
//! Design Notes §9: "Implement as a dispatch context parameter rather than
//! a 'client' subtype". `ReplayContext` is exactly that parameter.

use crate::error::AofError;
use crate::resp::CommandArgv;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};

/// A replay context passed to [`Dispatcher::dispatch`]. It stands in for the
/// "synthetic client" in spec.md §4.3/§9: non-blocking, replies discarded,
/// identified only by the database index currently selected.
#[derive(Debug, Clone, Copy)]
pub struct ReplayContext {
    pub db_index: usize,
}

/// The command dispatcher collaborator. A host implements this to actually
/// apply a decoded command argv to its in-memory dataset. The engine itself
/// never interprets command semantics beyond the structural ones it must
/// recognize to track transactions: `SELECT`, `MULTI`, `EXEC`, `DISCARD`
/// (see [`crate::command`]).
pub trait Dispatcher: Send + Sync {
    /// Applies one command. Returning `Err(AofError::UnknownCommand(..))`
    /// aborts the whole load per spec.md §4.3.
    fn dispatch(&self, ctx: &ReplayContext, argv: &CommandArgv) -> Result<(), AofError>;

    /// How many logical databases the host has. Used by the Loader to
    /// validate `SELECT` targets and by the Rewriter to iterate databases.
    fn database_count(&self) -> usize;
}

/// The minimal reconstruction of one key, as the Rewriter's child needs to
/// emit it (spec.md §4.4). `commands` is already the *minimal* command
/// sequence, already chunked to `AOF_REWRITE_ITEMS_PER_CMD`-sized pieces if
/// the value is a large collection, already expanded to the
/// `XADD`/`XSETID`/`XGROUP CREATE`/`XCLAIM` sequence if the value is a
/// stream (producing that sequence requires knowing the concrete
/// data-type encoding, which is out of scope here, spec.md §1 non-goals).
#[derive(Debug, Clone)]
pub struct KeyExport {
    pub key: Bytes,
    pub commands: Vec<CommandArgv>,
    /// Millisecond Unix timestamp; emitted as a trailing `PEXPIREAT` if present.
    pub expire_at_ms: Option<i64>,
}

/// The data-type collaborator the Rewriter's child uses to produce a
/// minimal reconstruction of the current dataset (spec.md §4.4).
pub trait DatasetSource: Send + Sync {
    fn database_count(&self) -> usize;
    /// Every live (non-expired) key in `db_index`, already expressed as the
    /// commands needed to recreate it. Order is unspecified; the Rewriter
    /// wraps the whole database in one `SELECT` before emitting these.
    fn export_database(&self, db_index: usize) -> Vec<KeyExport>;
}

/// An opaque, monotonically-increasing replication offset. The engine only
/// ever stores and compares these (spec.md §4.2, §9); it never interprets
/// what a unit of offset actually represents. Backed by a pair of atomics so
/// the "pending" and "committed" watermarks can be read independently
/// without a lock (spec.md §5: "readers must tolerate pending >= committed").
#[derive(Debug, Default)]
pub struct ReplOffsetWatermark {
    pending: AtomicU64,
    committed: AtomicU64,
}

impl ReplOffsetWatermark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when a fsync job is enqueued, advancing the "pending" mark.
    pub fn advance_pending(&self, offset: u64) {
        self.pending.fetch_max(offset, Ordering::Relaxed);
    }

    /// Called when a fsync job reports success, advancing the "committed" mark.
    pub fn advance_committed(&self, offset: u64) {
        self.committed.fetch_max(offset, Ordering::Relaxed);
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }
}
