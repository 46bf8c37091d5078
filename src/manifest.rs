// src/manifest.rs

//! The Manifest Store (spec.md §3, §4.1): the ordered file-set describing
//! which BASE/INCR/HISTORY files currently make up the AOF, serialized as a
//! small line-oriented text format and swapped atomically. Grounded in
//! `aof.c`'s `aofInfoCreate`/`aofInfoFormat`/`aofLoadManifestFromFile`/
//! `persistAofManifest`/`aofManifestDup` (aof.c:121-650).

use crate::config::{AofConfig, is_bare_file_name};
use crate::error::AofError;
use std::collections::HashSet;
use std::io::Write as _;
use std::path::Path;

/// One of the three roles an AOF file can hold (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AofFileType {
    Base,
    Incr,
    History,
}

impl AofFileType {
    fn as_char(self) -> char {
        match self {
            AofFileType::Base => 'b',
            AofFileType::Incr => 'i',
            AofFileType::History => 'h',
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            'b' => Some(AofFileType::Base),
            'i' => Some(AofFileType::Incr),
            'h' => Some(AofFileType::History),
            _ => None,
        }
    }
}

/// Descriptor of one AOF file (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AofInfo {
    pub file_name: String,
    pub file_seq: u64,
    pub file_type: AofFileType,
}

impl AofInfo {
    pub fn new(file_name: impl Into<String>, file_seq: u64, file_type: AofFileType) -> Self {
        Self {
            file_name: file_name.into(),
            file_seq,
            file_type,
        }
    }

    /// Formats this entry as one manifest line, quoting the name if it
    /// contains whitespace or control characters (`aof.c`'s `sdsneedsrepr`).
    fn format_line(&self) -> String {
        let name = if needs_quoting(&self.file_name) {
            quote(&self.file_name)
        } else {
            self.file_name.clone()
        };
        format!(
            "file {} seq {} type {}",
            name,
            self.file_seq,
            self.file_type.as_char()
        )
    }
}

fn needs_quoting(s: &str) -> bool {
    s.is_empty() || s.chars().any(|c| c.is_whitespace() || c.is_control() || c == '"')
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Reverses [`quote`]. Returns `None` if `s` is not a well-formed quoted token.
fn unquote(s: &str) -> Option<String> {
    let inner = s.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next()? {
                '"' => out.push('"'),
                '\\' => out.push('\\'),
                'n' => out.push('\n'),
                'r' => out.push('\r'),
                other => out.push(other),
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// The ordered file-set (spec.md §3).
#[derive(Debug, Clone, Default)]
pub struct AofManifest {
    pub base: Option<AofInfo>,
    pub incr_list: Vec<AofInfo>,
    pub history_list: Vec<AofInfo>,
    pub curr_base_seq: u64,
    pub curr_incr_seq: u64,
    pub dirty: bool,
}

impl AofManifest {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The file currently open for append: the last INCR entry, per
    /// invariant 6 in spec.md §3.
    pub fn last_incr(&self) -> Option<&AofInfo> {
        self.incr_list.last()
    }

    /// Allocates the next BASE sequence and marks the manifest dirty.
    pub fn next_base_seq(&mut self) -> u64 {
        self.curr_base_seq += 1;
        self.dirty = true;
        self.curr_base_seq
    }

    /// Allocates the next INCR sequence and marks the manifest dirty.
    pub fn next_incr_seq(&mut self) -> u64 {
        self.curr_incr_seq += 1;
        self.dirty = true;
        self.curr_incr_seq
    }

    /// Demotes the current BASE (if any) and every current INCR entry except
    /// the last one (the one the parent is still writing into) to HISTORY,
    /// then installs `new_base` as the BASE. Mirrors
    /// `backgroundRewriteDoneHandler`'s HISTORY-demotion walk (aof.c:2877),
    /// which skips only the last `incr_list` entry.
    pub fn splice_rewrite_result(&mut self, new_base: AofInfo, new_incr: Option<AofInfo>) {
        if let Some(old_base) = self.base.take() {
            self.history_list.push(AofInfo {
                file_type: AofFileType::History,
                ..old_base
            });
        }
        let keep_last = self.incr_list.pop();
        for demoted in self.incr_list.drain(..) {
            self.history_list.push(AofInfo {
                file_type: AofFileType::History,
                ..demoted
            });
        }
        self.base = Some(new_base);
        if let Some(kept) = keep_last {
            self.incr_list.push(kept);
        }
        if let Some(incr) = new_incr {
            self.incr_list.push(incr);
        }
        self.dirty = true;
    }

    /// Removes and returns every HISTORY entry, leaving none behind. Used by
    /// [`ManifestStore::sweep_history`] once the caller has unlinked the
    /// underlying files (`aof.c`'s `aofDelHistoryFiles`, aof.c:729).
    pub fn take_history(&mut self) -> Vec<AofInfo> {
        if self.history_list.is_empty() {
            return Vec::new();
        }
        self.dirty = true;
        std::mem::take(&mut self.history_list)
    }

    /// Serializes to the manifest line format (spec.md §4.1): BASE first,
    /// then HISTORY, then INCR in sequence order.
    fn serialize(&self) -> String {
        let mut out = String::new();
        if let Some(base) = &self.base {
            out.push_str(&base.format_line());
            out.push('\n');
        }
        for h in &self.history_list {
            out.push_str(&h.format_line());
            out.push('\n');
        }
        for i in &self.incr_list {
            out.push_str(&i.format_line());
            out.push('\n');
        }
        out
    }

    /// Parses the manifest line format. Fails on any non-comment line that
    /// lacks the three required keys, names an unknown type, duplicates the
    /// BASE role, or breaks INCR's strictly-ascending sequence requirement
    /// (spec.md §4.1; `aof.c:336-460`).
    fn parse(text: &str) -> Result<Self, AofError> {
        let mut manifest = AofManifest::empty();
        let mut seen: HashSet<(AofFileType, u64)> = HashSet::new();
        let mut last_incr_seq: Option<u64> = None;

        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let entry = parse_line(line)
                .ok_or_else(|| AofError::InvalidManifest(format!("line {}: malformed entry", lineno + 1)))?;

            if !is_bare_file_name(&entry.file_name) {
                return Err(AofError::InvalidManifest(format!(
                    "line {}: file name '{}' must not contain a path separator",
                    lineno + 1,
                    entry.file_name
                )));
            }
            if entry.file_seq == 0 {
                return Err(AofError::InvalidManifest(format!(
                    "line {}: file_seq must be strictly positive",
                    lineno + 1
                )));
            }
            if !seen.insert((entry.file_type, entry.file_seq)) {
                return Err(AofError::InvalidManifest(format!(
                    "line {}: duplicate (type, file_seq) entry",
                    lineno + 1
                )));
            }

            match entry.file_type {
                AofFileType::Base => {
                    if manifest.base.is_some() {
                        return Err(AofError::InvalidManifest(
                            "manifest contains more than one BASE entry".into(),
                        ));
                    }
                    manifest.curr_base_seq = manifest.curr_base_seq.max(entry.file_seq);
                    manifest.base = Some(entry);
                }
                AofFileType::Incr => {
                    if let Some(prev) = last_incr_seq {
                        if entry.file_seq <= prev {
                            return Err(AofError::InvalidManifest(format!(
                                "line {}: INCR sequence {} is not strictly greater than previous {}",
                                lineno + 1,
                                entry.file_seq,
                                prev
                            )));
                        }
                    }
                    last_incr_seq = Some(entry.file_seq);
                    manifest.curr_incr_seq = manifest.curr_incr_seq.max(entry.file_seq);
                    manifest.incr_list.push(entry);
                }
                AofFileType::History => {
                    manifest.history_list.push(entry);
                }
            }
        }

        Ok(manifest)
    }
}

fn parse_line(line: &str) -> Option<AofInfo> {
    let tokens: Vec<&str> = tokenize(line);
    if tokens.len() < 6 || tokens.len() % 2 != 0 {
        return None;
    }

    let mut file_name: Option<String> = None;
    let mut file_seq: Option<u64> = None;
    let mut file_type: Option<AofFileType> = None;

    let mut it = tokens.chunks_exact(2);
    for pair in &mut it {
        let (key, value) = (pair[0], pair[1]);
        match key {
            "file" => {
                file_name = Some(if value.starts_with('"') {
                    unquote(value)?
                } else {
                    value.to_string()
                });
            }
            "seq" => file_seq = value.parse().ok(),
            "type" => {
                let c = value.chars().next()?;
                file_type = AofFileType::from_char(c);
            }
            _ => {}
        }
    }

    Some(AofInfo::new(file_name?, file_seq?, file_type?))
}

/// Splits a manifest line into whitespace-separated tokens, treating a
/// double-quoted run (with `\"`/`\\`/`\n`/`\r` escapes) as one token.
fn tokenize(line: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let start = i;
        if bytes[i] == b'"' {
            i += 1;
            while i < bytes.len() && bytes[i] != b'"' {
                if bytes[i] == b'\\' && i + 1 < bytes.len() {
                    i += 2;
                } else {
                    i += 1;
                }
            }
            if i < bytes.len() {
                i += 1;
            }
        } else {
            while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                i += 1;
            }
        }
        tokens.push(&line[start..i]);
    }
    tokens
}

/// Loads, persists, and deep-copies [`AofManifest`] values against disk.
/// Grounded in `aof.c`'s `aofLoadManifestFromFile` / `persistAofManifest` /
/// `aofManifestDup`.
pub struct ManifestStore;

impl ManifestStore {
    /// Reads and parses the manifest at `path`. Per spec.md §4.1, any
    /// failure here must be treated by the caller as fatal at startup;
    /// this function itself only returns the error, it does not abort.
    pub fn load(path: &Path) -> Result<AofManifest, AofError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AofError::Io(std::sync::Arc::new(e)))?;
        AofManifest::parse(&text)
    }

    /// Returns `true` if `path` exists at all, used by the Loader to
    /// distinguish "no manifest, fresh start" from "no manifest, but a
    /// legacy single AOF file exists" (spec.md §4.3 step 1).
    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    /// Writes `manifest` only if `dirty`. Writes to a temp file in `dir`,
    /// fsyncs it, renames over the live manifest path, then fsyncs the
    /// containing directory; clears `dirty` only once every step succeeds
    /// (spec.md §4.1). Any failure leaves the live manifest file untouched.
    pub fn persist(manifest: &mut AofManifest, config: &AofConfig) -> Result<(), AofError> {
        if !manifest.dirty {
            return Ok(());
        }

        let dir = &config.dir;
        let temp_path = config.path_in_dir(&config.temp_manifest_name());
        let live_path = config.manifest_path();

        let mut file = std::fs::File::create(&temp_path)
            .map_err(|e| AofError::Open(format!("temp manifest '{}': {e}", temp_path.display())))?;
        file.write_all(manifest.serialize().as_bytes())
            .map_err(|e| AofError::HardWrite(format!("temp manifest: {e}")))?;
        file.sync_all()
            .map_err(|e| AofError::Fsync(format!("temp manifest: {e}")))?;
        drop(file);

        std::fs::rename(&temp_path, &live_path)
            .map_err(|e| AofError::Rename(format!("{} -> {}: {e}", temp_path.display(), live_path.display())))?;

        if let Ok(dir_handle) = std::fs::File::open(dir) {
            let _ = dir_handle.sync_all();
        }

        manifest.dirty = false;
        Ok(())
    }

    /// Deep-copies `manifest`, producing an owned twin the caller may mutate
    /// and roll back freely; the live manifest is only swapped once the twin
    /// has been validated and persisted (spec.md §4.1).
    pub fn dup(manifest: &AofManifest) -> AofManifest {
        manifest.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> AofManifest {
        let mut m = AofManifest::empty();
        m.base = Some(AofInfo::new("appendonly.aof.1.base.aof", 1, AofFileType::Base));
        m.incr_list.push(AofInfo::new("appendonly.aof.1.incr.aof", 1, AofFileType::Incr));
        m.curr_base_seq = 1;
        m.curr_incr_seq = 1;
        m.dirty = true;
        m
    }

    #[test]
    fn round_trips_through_serialize_and_parse() {
        let m = sample();
        let text = m.serialize();
        let parsed = AofManifest::parse(&text).unwrap();
        assert_eq!(parsed.base, m.base);
        assert_eq!(parsed.incr_list, m.incr_list);
    }

    #[test]
    fn rejects_duplicate_base() {
        let text = "file a seq 1 type b\nfile b seq 2 type b\n";
        assert!(AofManifest::parse(text).is_err());
    }

    #[test]
    fn rejects_non_monotonic_incr() {
        let text = "file a seq 2 type i\nfile b seq 1 type i\n";
        assert!(AofManifest::parse(text).is_err());
    }

    #[test]
    fn rejects_fewer_than_six_tokens() {
        let text = "file a seq 1\n";
        assert!(AofManifest::parse(text).is_err());
    }

    #[test]
    fn ignores_comment_lines() {
        let text = "# comment\nfile a seq 1 type b\n";
        let m = AofManifest::parse(text).unwrap();
        assert!(m.base.is_some());
    }

    #[test]
    fn quotes_names_with_whitespace() {
        let info = AofInfo::new("has space.aof", 1, AofFileType::Base);
        let line = info.format_line();
        assert!(line.contains('"'));
        let mut m = AofManifest::empty();
        m.base = Some(info.clone());
        let parsed = AofManifest::parse(&m.serialize()).unwrap();
        assert_eq!(parsed.base.unwrap().file_name, "has space.aof");
    }

    #[test]
    fn splice_rewrite_result_demotes_old_base_and_all_but_last_incr() {
        let mut m = AofManifest::empty();
        m.base = Some(AofInfo::new("base.1", 1, AofFileType::Base));
        m.incr_list.push(AofInfo::new("incr.1", 1, AofFileType::Incr));
        m.incr_list.push(AofInfo::new("incr.2", 2, AofFileType::Incr));

        let new_base = AofInfo::new("base.2", 2, AofFileType::Base);
        m.splice_rewrite_result(new_base.clone(), None);

        assert_eq!(m.base, Some(new_base));
        assert_eq!(m.incr_list.len(), 1);
        assert_eq!(m.incr_list[0].file_name, "incr.2");
        assert_eq!(m.history_list.len(), 2);
        assert!(m.history_list.iter().all(|h| h.file_type == AofFileType::History));
    }

    #[test]
    fn persist_writes_rename_and_clears_dirty() {
        let dir = tempdir().unwrap();
        let mut config = AofConfig::default();
        config.dir = dir.path().to_path_buf();
        let mut m = sample();

        ManifestStore::persist(&mut m, &config).unwrap();
        assert!(!m.dirty);
        assert!(config.manifest_path().exists());

        let reloaded = ManifestStore::load(&config.manifest_path()).unwrap();
        assert_eq!(reloaded.base, m.base);
    }

    #[test]
    fn persist_is_noop_when_not_dirty() {
        let dir = tempdir().unwrap();
        let mut config = AofConfig::default();
        config.dir = dir.path().to_path_buf();
        let mut m = sample();
        m.dirty = false;

        ManifestStore::persist(&mut m, &config).unwrap();
        assert!(!config.manifest_path().exists());
    }

    #[test]
    fn dup_produces_an_independently_mutable_twin() {
        let m = sample();
        let mut twin = ManifestStore::dup(&m);
        twin.next_incr_seq();
        assert_ne!(twin.curr_incr_seq, m.curr_incr_seq);
    }
}
