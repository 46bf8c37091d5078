// src/error.rs

//! The error type for the AOF persistence engine.

use std::sync::Arc;
use thiserror::Error;

/// All failure modes the engine can produce, grouped the way spec §7 groups them.
#[derive(Error, Debug, Clone)]
pub enum AofError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("short write: wrote {written} of {requested} requested bytes")]
    ShortWrite { written: usize, requested: usize },

    #[error("hard write error: {0}")]
    HardWrite(String),

    #[error("fsync failed: {0}")]
    Fsync(String),

    #[error("rename failed: {0}")]
    Rename(String),

    #[error("open failed: {0}")]
    Open(String),

    #[error("invalid AOF manifest: {0}")]
    InvalidManifest(String),

    #[error("unknown command '{0}' in AOF stream")]
    UnknownCommand(String),

    #[error("truncated AOF tail: {0}")]
    TruncatedTail(String),

    #[error("failed to spawn rewrite child: {0}")]
    ChildSpawnFailed(String),

    #[error("rewrite child exited with non-zero status: {0}")]
    ChildExitedNonZero(i32),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation invalid in current engine state: {0}")]
    InvalidState(String),

    /// Marks an error that spec.md requires to terminate the host process
    /// (a corrupt manifest at startup, a failed `ALWAYS`-policy write or
    /// fsync, an enable-AOF retry budget exhausted). The engine itself never
    /// calls `std::process::exit`; see [`FatalPolicy`] for how the host is
    /// expected to react.
    #[error("fatal: {0}")]
    Fatal(Box<AofError>),
}

impl AofError {
    /// Wraps `self` as a [`AofError::Fatal`], unless it already is one.
    pub fn into_fatal(self) -> Self {
        match self {
            AofError::Fatal(_) => self,
            other => AofError::Fatal(Box::new(other)),
        }
    }

    /// True if spec.md requires this error to terminate the host process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AofError::Fatal(_))
    }
}

impl From<std::io::Error> for AofError {
    fn from(e: std::io::Error) -> Self {
        AofError::Io(Arc::new(e))
    }
}

impl From<toml::de::Error> for AofError {
    fn from(e: toml::de::Error) -> Self {
        AofError::InvalidConfig(e.to_string())
    }
}

/// What the host does when the engine reports a [`AofError::Fatal`].
///
/// spec.md §7 says these errors "terminate the process". The engine cannot
/// unit-test that by actually exiting, so the policy is a seam: production
/// hosts install [`FatalPolicy::Abort`], tests install
/// [`FatalPolicy::Propagate`] and assert on the returned error instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FatalPolicy {
    /// Call `std::process::exit(1)` after logging. Matches `aof.c`'s `exit(1)`.
    Abort,
    /// Return the error to the caller. Used by tests and by hosts that want
    /// to manage their own shutdown sequence.
    #[default]
    Propagate,
}

impl FatalPolicy {
    /// Applies the policy to a fatal error: aborts the process, or returns
    /// the error unchanged for the caller to propagate.
    pub fn handle(self, err: AofError) -> AofError {
        match self {
            FatalPolicy::Abort => {
                tracing::error!("fatal AOF error, terminating process: {err}");
                std::process::exit(1);
            }
            FatalPolicy::Propagate => err,
        }
    }
}
