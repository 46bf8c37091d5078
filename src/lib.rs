// src/lib.rs

//! The Append-Only File (AOF) persistence engine: a multi-file, manifest-
//! tracked durability layer that records every state-mutating command so the
//! in-memory dataset can be reconstructed after a crash or restart.
//!
//! This crate owns the manifest/file-set lifecycle, the write/flush/fsync
//! pipeline, and background rewrite (compaction). It never opens a network
//! socket, authenticates a client, or encodes a data-type value: those are
//! external collaborators a host process supplies through the
//! [`collaborators`] traits.

pub mod bio;
pub mod collaborators;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod loader;
pub mod manifest;
pub mod resp;
pub mod rewriter;
pub mod writer;

pub use collaborators::{DatasetSource, Dispatcher, KeyExport, ReplayContext, ReplOffsetWatermark};
pub use config::{AofConfig, AppendFsync};
pub use engine::{AofEngine, EngineStatus};
pub use error::{AofError, FatalPolicy};
pub use events::UnitOfWork;
pub use loader::LoadOutcome;
pub use manifest::{AofFileType, AofInfo, AofManifest};
pub use rewriter::RewriteState;
