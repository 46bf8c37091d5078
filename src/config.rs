// src/config.rs

//! Configuration for the AOF engine: durability policy, paths, rewrite
//! thresholds. Mirrors the teacher's `PersistenceConfig`/`Config::from_file`
//! conventions (serde + toml, `anyhow::Context` on load errors) but scoped to
//! just the AOF engine's own options (spec.md §6).

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Defines the frequency of the `fsync` system call for AOF persistence.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AppendFsync {
    Always,
    #[default]
    EverySec,
    No,
}

/// The resolved, validated configuration for the AOF engine.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AofConfig {
    /// Whether the engine is enabled at startup.
    #[serde(default)]
    pub enabled: bool,
    /// The directory all AOF files and the manifest live under.
    #[serde(default = "default_dir")]
    pub dir: PathBuf,
    /// The base name files and the manifest are derived from, e.g.
    /// `appendonly.aof` produces `appendonly.aof.manifest`,
    /// `appendonly.aof.1.base.aof`, etc.
    #[serde(default = "default_filename")]
    pub filename: String,
    #[serde(default)]
    pub fsync_policy: AppendFsync,
    /// If true, a rewrite may embed a full snapshot stream as the BASE file
    /// instead of a RESP command sequence (spec.md §4.4, "snapshot-preamble mode").
    #[serde(default)]
    pub use_snapshot_preamble: bool,
    /// Ratio trigger: rewrite when `current_size / rewrite_base_size >= 1 + pct/100`.
    #[serde(default = "default_rewrite_pct")]
    pub rewrite_pct: u64,
    /// Ratio trigger only applies once `current_size >= rewrite_min_size`.
    #[serde(default = "default_rewrite_min_size")]
    pub rewrite_min_size: u64,
    /// Whether a truncated tail on the *last* file in replay order is
    /// recovered from (spec.md §4.3) instead of treated as fatal.
    #[serde(default = "default_load_truncated")]
    pub load_truncated: bool,
    /// If true, HISTORY files are never swept by the background deletion path.
    #[serde(default)]
    pub disable_auto_gc: bool,
    /// If true, a `#TS:<unix_seconds>` annotation line precedes the next
    /// command whenever the wall-clock second advances.
    #[serde(default)]
    pub timestamp_enabled: bool,
    /// If true, fsyncs are skipped for the duration of an active rewrite
    /// child, to avoid contending for disk bandwidth with it.
    #[serde(default)]
    pub no_fsync_on_rewrite: bool,
}

fn default_dir() -> PathBuf {
    PathBuf::from("appendonlydir")
}
fn default_filename() -> String {
    "appendonly.aof".to_string()
}
fn default_rewrite_pct() -> u64 {
    100
}
fn default_rewrite_min_size() -> u64 {
    64 * 1024 * 1024
}
fn default_load_truncated() -> bool {
    true
}

impl Default for AofConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_dir(),
            filename: default_filename(),
            fsync_policy: AppendFsync::default(),
            use_snapshot_preamble: false,
            rewrite_pct: default_rewrite_pct(),
            rewrite_min_size: default_rewrite_min_size(),
            load_truncated: default_load_truncated(),
            disable_auto_gc: false,
            timestamp_enabled: false,
            no_fsync_on_rewrite: false,
        }
    }
}

impl AofConfig {
    /// Loads and validates an `AofConfig` from a standalone TOML file.
    /// Hosts that embed this crate alongside a larger `Config` typically
    /// deserialize `AofConfig` as one field of their own struct instead; this
    /// helper exists for the engine's own tests and for the `aof-check`
    /// binary, which wants to load configuration the same way the server does.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read AOF config file at '{path}'"))?;
        let config: AofConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.filename.trim().is_empty() {
            return Err(anyhow!("persistence.filename cannot be empty"));
        }
        if self.filename.contains('/') || self.filename.contains('\\') {
            return Err(anyhow!("persistence.filename cannot contain a path separator"));
        }
        if self.rewrite_pct == 0 {
            return Err(anyhow!("persistence.rewrite_pct cannot be 0"));
        }
        Ok(())
    }

    /// The manifest file's name, e.g. `appendonly.aof.manifest`.
    pub fn manifest_name(&self) -> String {
        format!("{}.manifest", self.filename)
    }

    /// The manifest's full path under `dir`.
    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(self.manifest_name())
    }

    /// The legacy (pre-manifest) single-file AOF path, a sibling of `dir`.
    pub fn legacy_path(&self) -> PathBuf {
        match self.dir.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(&self.filename),
            _ => PathBuf::from(&self.filename),
        }
    }

    /// Names a BASE file for the given sequence, honoring `use_snapshot_preamble`.
    pub fn base_name(&self, seq: u64) -> String {
        let ext = if self.use_snapshot_preamble { "rdb" } else { "aof" };
        format!("{}.{}.base.{}", self.filename, seq, ext)
    }

    /// Names an INCR file for the given sequence.
    pub fn incr_name(&self, seq: u64) -> String {
        format!("{}.{}.incr.aof", self.filename, seq)
    }

    /// The reserved temporary INCR name used while `WAIT_REWRITE`.
    pub fn temp_incr_name(&self) -> String {
        format!("temp-{}.incr.aof", self.filename)
    }

    /// The transient manifest name used while persisting.
    pub fn temp_manifest_name(&self) -> String {
        format!("temp-{}", self.manifest_name())
    }

    /// The working file a rewrite child writes its reconstruction into.
    pub fn child_temp_name(&self, child_id: u64) -> String {
        format!("temp-rewriteaof-bg-{child_id}.aof")
    }

    pub fn path_in_dir(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

/// Returns true if `name` is a bare file name with no path component;
/// the manifest's `file_name` field must satisfy this (spec.md §3, §6).
pub fn is_bare_file_name(name: &str) -> bool {
    let path = Path::new(name);
    path.file_name().map(|f| f == path.as_os_str()).unwrap_or(false) && !name.is_empty()
}
