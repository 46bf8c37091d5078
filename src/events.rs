// src/events.rs

//! The event bus feeding the Writer (spec.md §2 "steady state" data flow:
//! "command dispatcher → Writer.append"). Generalizes the teacher's
//! `core/events.rs` by carrying an already-encoded [`CommandArgv`] instead
//! of a concrete `Command` enum (command *types* are a host concern this
//! crate never needs to know about).

use crate::resp::CommandArgv;
use tokio::sync::mpsc::{self, Sender as MpscSender, error::TrySendError};
use tracing::{debug, error};

/// Matches the teacher's `AOF_CHANNEL_CAPACITY`: large enough that slow disk
/// I/O never blocks or rejects write commands at the publish site.
const AOF_CHANNEL_CAPACITY: usize = 65536;

/// All commands queued by one logical unit, paired with which database they
/// target. A lone command is `all_commands.len() == 1`; a transaction is the
/// full queued block, mirroring the teacher's `TransactionData` split
/// between "all" and "write-only" (the write-only distinction is a
/// replication concern out of scope here, so only the full command list is kept).
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    pub db_index: usize,
    pub commands: Vec<CommandArgv>,
}

impl UnitOfWork {
    pub fn single(db_index: usize, argv: CommandArgv) -> Self {
        Self {
            db_index,
            commands: vec![argv],
        }
    }
}

/// A unit of work in flight to the Writer task.
#[derive(Debug, Clone)]
pub struct PropagatedWork {
    pub uow: UnitOfWork,
}

/// Reports backpressure or channel closure back to the host, so it can flip
/// whatever "read-only" surface it exposes (spec.md §4.2's monitoring flag).
/// The engine itself has no such surface; it only observes the AOF channel.
pub trait DegradationSink: Send + Sync {
    fn mark_degraded(&self, reason: &str);
}

/// A sink that only logs; used where the host doesn't need a read-only flag
/// (tests, `aof-check`).
pub struct LoggingDegradationSink;

impl DegradationSink for LoggingDegradationSink {
    fn mark_degraded(&self, reason: &str) {
        error!("{reason}");
    }
}

/// The distribution point from command dispatch to the AOF Writer task. The
/// teacher's `EventBus` also fans out to replication; that fan-out is a
/// replication-collaborator concern out of scope here (spec.md §1), so this
/// type only owns the AOF-bound side of the teacher's bus.
pub struct EventBus {
    aof_sender: Option<MpscSender<PropagatedWork>>,
}

impl EventBus {
    /// Creates a bus and, if `aof_enabled`, the receiver the Writer task
    /// should be spawned against.
    pub fn new(aof_enabled: bool) -> (Self, Option<mpsc::Receiver<PropagatedWork>>) {
        let (aof_sender, aof_receiver) = if aof_enabled {
            let (tx, rx) = mpsc::channel(AOF_CHANNEL_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        (Self { aof_sender }, aof_receiver)
    }

    /// Publishes a unit of work to the Writer task. A full or closed channel
    /// is reported to `sink` rather than blocking the publisher; a slow AOF
    /// disk must never stall command dispatch.
    pub fn publish(&self, uow: UnitOfWork, sink: &dyn DegradationSink) {
        let Some(sender) = &self.aof_sender else {
            debug!("published a UnitOfWork with AOF disabled; dropping");
            return;
        };
        match sender.try_send(PropagatedWork { uow }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                sink.mark_degraded("AOF channel is full; persistence is lagging behind writes");
            }
            Err(TrySendError::Closed(_)) => {
                sink.mark_degraded("AOF channel is closed; persistence has stopped");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.aof_sender.as_ref().is_some_and(|s| s.is_closed())
    }
}
