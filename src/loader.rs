// src/loader.rs

//! The Loader (spec.md §4.3): on startup, rebuild the in-memory dataset by
//! replaying BASE then every INCR file in sequence order. Grounded in the
//! teacher's `aof_loader.rs` for the MULTI/EXEC/SELECT state machine and
//! streaming-chunked-read shape, generalized from its single-file loop to
//! the manifest's ordered file-set, and in `aof.c`'s
//! `loadSingleAppendOnlyFile`/`loadAppendOnlyFiles` (aof.c:1617, aof.c:1880)
//! for the exact truncation and legacy-upgrade semantics.

use crate::collaborators::{Dispatcher, ReplayContext};
use crate::command::{GenericCommand, classify};
use crate::config::AofConfig;
use crate::error::AofError;
use crate::manifest::{AofFileType, AofInfo, AofManifest, ManifestStore};
use crate::resp::{AofLine, decode_line};
use bytes::BytesMut;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Peeked at the front of a BASE file to detect a full-image snapshot
/// prefix (spec.md §4.3). Reproduced verbatim from the original format's
/// magic, per SPEC_FULL.md §4.3.
const SNAPSHOT_MAGIC: &[u8; 5] = b"REDIS";

/// Outcome of [`Loader::load`].
#[derive(Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Neither BASE nor any INCR was listed; caller treats this as an empty database.
    NotExist,
    Loaded { commands_replayed: u64, total_size_bytes: u64 },
}

/// Decodes an opaque snapshot-format byte stream into dataset state. A
/// concrete snapshot codec is out of scope here (spec.md §1 non-goals); a
/// host that uses `use_snapshot_preamble` supplies one.
pub trait SnapshotSource: Send + Sync {
    fn load_snapshot(&self, ctx: &ReplayContext, bytes: &[u8]) -> Result<(), AofError>;
}

pub struct Loader<'a> {
    config: &'a AofConfig,
}

impl<'a> Loader<'a> {
    pub fn new(config: &'a AofConfig) -> Self {
        Self { config }
    }

    /// True if there is no manifest on disk but a legacy single-file AOF
    /// exists at the sibling path (the precondition for upgrade mode,
    /// spec.md §4.3 step 1; SPEC_FULL.md's "Legacy single-file upgrade
    /// companion check").
    pub fn needs_legacy_migration(&self) -> bool {
        !ManifestStore::exists(&self.config.manifest_path()) && self.config.legacy_path().exists()
    }

    /// Performs the legacy-to-manifest upgrade: creates the AOF directory,
    /// synthesizes a BASE entry pointing at the legacy file, persists the
    /// new manifest, then moves the legacy file into the directory. Per
    /// spec.md §4.3, the manifest is written before the file move is
    /// observable, so re-running startup after a crash mid-upgrade is safe:
    /// either the manifest write never landed (next boot tries upgrade
    /// again, legacy file is still in place) or it did (next boot finds the
    /// manifest and the moved file both present).
    pub fn migrate_legacy(&self) -> Result<AofManifest, AofError> {
        std::fs::create_dir_all(&self.config.dir)
            .map_err(|e| AofError::Open(format!("creating AOF dir: {e}")))?;

        let mut manifest = AofManifest::empty();
        let seq = manifest.next_base_seq();
        let base_name = self.config.base_name(seq);
        manifest.base = Some(AofInfo::new(base_name.clone(), seq, AofFileType::Base));

        ManifestStore::persist(&mut manifest, self.config)?;

        let legacy_path = self.config.legacy_path();
        let dest = self.config.path_in_dir(&base_name);
        std::fs::rename(&legacy_path, &dest)
            .map_err(|e| AofError::Rename(format!("{} -> {}: {e}", legacy_path.display(), dest.display())))?;

        info!("migrated legacy AOF '{}' into manifest BASE '{}'", legacy_path.display(), base_name);
        Ok(manifest)
    }

    /// Loads the manifest (migrating first if needed) and replays every
    /// listed file in order: BASE, then each INCR by ascending sequence.
    pub fn load(
        &self,
        dispatcher: &dyn Dispatcher,
        snapshot: Option<&dyn SnapshotSource>,
    ) -> Result<(AofManifest, LoadOutcome), AofError> {
        let manifest = if self.needs_legacy_migration() {
            self.migrate_legacy()?
        } else if ManifestStore::exists(&self.config.manifest_path()) {
            ManifestStore::load(&self.config.manifest_path())?
        } else {
            return Ok((AofManifest::empty(), LoadOutcome::NotExist));
        };

        if manifest.base.is_none() && manifest.incr_list.is_empty() {
            return Ok((manifest, LoadOutcome::NotExist));
        }

        let mut total_size_bytes = 0u64;
        let mut ordered: Vec<(&AofInfo, bool)> = Vec::new();
        if let Some(base) = &manifest.base {
            ordered.push((base, false));
        }
        for (i, incr) in manifest.incr_list.iter().enumerate() {
            ordered.push((incr, i + 1 == manifest.incr_list.len()));
        }
        for (info, _) in &ordered {
            let path = self.config.path_in_dir(&info.file_name);
            if let Ok(meta) = std::fs::metadata(&path) {
                total_size_bytes += meta.len();
            }
        }

        let mut commands_replayed = 0u64;
        let mut ctx = ReplayContext { db_index: 0 };

        for (info, is_last) in ordered {
            let path = self.config.path_in_dir(&info.file_name);
            let replayed = self.replay_file(&path, is_last, dispatcher, snapshot, &mut ctx)?;
            commands_replayed += replayed;
        }

        Ok((
            manifest,
            LoadOutcome::Loaded {
                commands_replayed,
                total_size_bytes,
            },
        ))
    }

    /// Replays one file: peeks for the snapshot magic, then parses the
    /// (possibly remaining) bytes as a RESP command stream.
    fn replay_file(
        &self,
        path: &Path,
        is_last: bool,
        dispatcher: &dyn Dispatcher,
        snapshot: Option<&dyn SnapshotSource>,
        ctx: &mut ReplayContext,
    ) -> Result<u64, AofError> {
        let mut file = std::fs::File::open(path).map_err(|e| AofError::Open(format!("{}: {e}", path.display())))?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .map_err(|e| AofError::Io(std::sync::Arc::new(e)))?;

        if contents.is_empty() {
            // spec.md §4.3: "An empty non-last INCR is accepted; an empty tail INCR is accepted."
            return Ok(0);
        }

        if contents.len() >= SNAPSHOT_MAGIC.len() && &contents[..SNAPSHOT_MAGIC.len()] == SNAPSHOT_MAGIC {
            let Some(src) = snapshot else {
                return Err(AofError::InvalidManifest(format!(
                    "{}: snapshot-prefixed file but no SnapshotSource configured",
                    path.display()
                )));
            };
            // The original format embeds its own length; here the whole
            // remainder is handed to the collaborator, which is expected to
            // report how much of it it consumed via its own framing. Since
            // that framing is out of scope (spec.md §1 non-goals), the
            // common case, legacy files with no RESP tail, is handled by
            // treating the entire body as the snapshot.
            src.load_snapshot(ctx, &contents)?;
            return Ok(1);
        }

        self.replay_resp_stream(path, &contents, is_last, dispatcher, ctx)
    }

    fn replay_resp_stream(
        &self,
        path: &Path,
        body: &[u8],
        is_last: bool,
        dispatcher: &dyn Dispatcher,
        ctx: &mut ReplayContext,
    ) -> Result<u64, AofError> {
        let mut buf = BytesMut::from(body);
        let mut commands_replayed = 0u64;
        let mut in_multi = false;
        let mut tx_commands: Vec<Vec<bytes::Bytes>> = Vec::new();

        let mut valid_up_to = 0usize;
        let mut valid_before_multi = 0usize;
        let mut consumed = 0usize;

        loop {
            let before = buf.len();
            match decode_line(&mut buf) {
                Ok(Some(AofLine::TimestampAnnotation(_))) => {
                    consumed += before - buf.len();
                    if !in_multi {
                        valid_up_to = consumed;
                    }
                }
                Ok(Some(AofLine::Command(argv))) => {
                    consumed += before - buf.len();
                    match classify(argv) {
                        GenericCommand::Select(db) => {
                            ctx.db_index = db;
                            if !in_multi {
                                valid_up_to = consumed;
                            }
                        }
                        GenericCommand::Multi => {
                            if in_multi {
                                return Err(AofError::InvalidManifest(format!(
                                    "{}: nested MULTI in AOF",
                                    path.display()
                                )));
                            }
                            in_multi = true;
                            valid_before_multi = consumed - (before - buf.len());
                            tx_commands.clear();
                        }
                        GenericCommand::Exec => {
                            if !in_multi {
                                return Err(AofError::InvalidManifest(format!(
                                    "{}: EXEC without MULTI in AOF",
                                    path.display()
                                )));
                            }
                            in_multi = false;
                            for cmd in tx_commands.drain(..) {
                                dispatcher.dispatch(ctx, &cmd).map_err(|_| {
                                    AofError::UnknownCommand(command_label(&cmd))
                                })?;
                            }
                            commands_replayed += 1;
                            valid_up_to = consumed;
                        }
                        GenericCommand::Discard => {
                            if !in_multi {
                                return Err(AofError::InvalidManifest(format!(
                                    "{}: DISCARD without MULTI in AOF",
                                    path.display()
                                )));
                            }
                            in_multi = false;
                            tx_commands.clear();
                            valid_up_to = consumed;
                        }
                        GenericCommand::Opaque(argv) => {
                            if in_multi {
                                tx_commands.push(argv);
                            } else {
                                dispatcher.dispatch(ctx, &argv).map_err(|_| {
                                    AofError::UnknownCommand(command_label(&argv))
                                })?;
                                commands_replayed += 1;
                                valid_up_to = consumed;
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    return self.handle_malformed_tail(path, is_last, valid_up_to, valid_before_multi, in_multi, e);
                }
            }
        }

        if !buf.is_empty() {
            return self.handle_malformed_tail(
                path,
                is_last,
                valid_up_to,
                valid_before_multi,
                in_multi,
                AofError::TruncatedTail("unexpected EOF mid-record".into()),
            );
        }

        if in_multi {
            warn!("{}: file ends with an unclosed MULTI block; transaction discarded", path.display());
        }

        Ok(commands_replayed)
    }

    /// Truncation policy (spec.md §4.3): acceptable only if `load_truncated`
    /// is enabled and this is the last file in replay order; truncates to
    /// `valid_up_to`, or `valid_before_multi` if inside an open MULTI.
    fn handle_malformed_tail(
        &self,
        path: &Path,
        is_last: bool,
        valid_up_to: usize,
        valid_before_multi: usize,
        in_multi: bool,
        cause: AofError,
    ) -> Result<u64, AofError> {
        if !self.config.load_truncated || !is_last {
            return Err(cause.into_fatal());
        }
        let truncate_to = if in_multi { valid_before_multi } else { valid_up_to };
        warn!(
            "{}: truncated tail ({cause}); truncating to {truncate_to} bytes and accepting load",
            path.display()
        );
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| AofError::Open(format!("{}: {e}", path.display())))?;
        file.set_len(truncate_to as u64)
            .map_err(|e| AofError::HardWrite(format!("truncating {}: {e}", path.display())))?;
        Ok(0)
    }
}

/// Names a command argv for an error message, without panicking on the
/// zero-element array a corrupt or truncated AOF can produce (`*0\r\n`).
fn command_label(argv: &crate::resp::CommandArgv) -> String {
    argv.first()
        .map(|verb| String::from_utf8_lossy(verb).to_string())
        .unwrap_or_else(|| "<empty>".to_string())
}

/// The full-image-snapshot byte at the start of a legacy single-file AOF,
/// should the caller need it without constructing a [`Loader`].
pub fn peek_is_snapshot(path: &PathBuf) -> std::io::Result<bool> {
    let mut file = std::fs::File::open(path)?;
    let mut head = [0u8; 5];
    match file.read_exact(&mut head) {
        Ok(()) => Ok(&head == SNAPSHOT_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ReplayContext as Ctx;
    use crate::resp::encode_argv;
    use bytes::Bytes;
    use std::cell::RefCell;
    use tempfile::tempdir;

    struct RecordingDispatcher {
        seen: RefCell<Vec<Vec<String>>>,
    }
    impl Dispatcher for RecordingDispatcher {
        fn dispatch(&self, _ctx: &Ctx, argv: &Vec<Bytes>) -> Result<(), AofError> {
            self.seen.borrow_mut().push(
                argv.iter().map(|b| String::from_utf8_lossy(b).to_string()).collect(),
            );
            Ok(())
        }
        fn database_count(&self) -> usize {
            16
        }
    }

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn loads_an_empty_directory_as_not_exist() {
        let dir = tempdir().unwrap();
        let mut config = AofConfig::default();
        config.dir = dir.path().to_path_buf();
        let loader = Loader::new(&config);
        let dispatcher = RecordingDispatcher { seen: RefCell::new(Vec::new()) };
        let (_manifest, outcome) = loader.load(&dispatcher, None).unwrap();
        assert_eq!(outcome, LoadOutcome::NotExist);
    }

    #[test]
    fn replays_base_then_incr_in_order() {
        let dir = tempdir().unwrap();
        let mut config = AofConfig::default();
        config.dir = dir.path().to_path_buf();
        std::fs::create_dir_all(&config.dir).unwrap();

        let base_name = config.base_name(1);
        std::fs::write(config.path_in_dir(&base_name), encode_argv(&[b("SET"), b("a"), b("1")])).unwrap();

        let incr_name = config.incr_name(1);
        std::fs::write(config.path_in_dir(&incr_name), encode_argv(&[b("SET"), b("b"), b("2")])).unwrap();

        let manifest_text = format!(
            "file {base_name} seq 1 type b\nfile {incr_name} seq 1 type i\n"
        );
        std::fs::write(config.manifest_path(), manifest_text).unwrap();

        let loader = Loader::new(&config);
        let dispatcher = RecordingDispatcher { seen: RefCell::new(Vec::new()) };
        let (_manifest, outcome) = loader.load(&dispatcher, None).unwrap();
        assert!(matches!(outcome, LoadOutcome::Loaded { commands_replayed: 2, .. }));
        assert_eq!(dispatcher.seen.borrow().len(), 2);
    }

    #[test]
    fn replays_a_transaction_block() {
        let dir = tempdir().unwrap();
        let mut config = AofConfig::default();
        config.dir = dir.path().to_path_buf();
        std::fs::create_dir_all(&config.dir).unwrap();

        let incr_name = config.incr_name(1);
        let mut body = Vec::new();
        body.extend(encode_argv(&[b("MULTI")]));
        body.extend(encode_argv(&[b("SET"), b("a"), b("1")]));
        body.extend(encode_argv(&[b("SET"), b("b"), b("2")]));
        body.extend(encode_argv(&[b("EXEC")]));
        std::fs::write(config.path_in_dir(&incr_name), body).unwrap();
        std::fs::write(config.manifest_path(), format!("file {incr_name} seq 1 type i\n")).unwrap();

        let loader = Loader::new(&config);
        let dispatcher = RecordingDispatcher { seen: RefCell::new(Vec::new()) };
        let (_m, outcome) = loader.load(&dispatcher, None).unwrap();
        assert!(matches!(outcome, LoadOutcome::Loaded { commands_replayed: 1, .. }));
        assert_eq!(dispatcher.seen.borrow().len(), 2);
    }

    #[test]
    fn truncated_tail_on_last_file_is_recovered_when_enabled() {
        let dir = tempdir().unwrap();
        let mut config = AofConfig::default();
        config.dir = dir.path().to_path_buf();
        config.load_truncated = true;
        std::fs::create_dir_all(&config.dir).unwrap();

        let incr_name = config.incr_name(1);
        let mut body = encode_argv(&[b("SET"), b("a"), b("1")]);
        body.extend_from_slice(b"*2\r\n$3\r\nSET\r\n$1\r\n");
        std::fs::write(config.path_in_dir(&incr_name), &body).unwrap();
        std::fs::write(config.manifest_path(), format!("file {incr_name} seq 1 type i\n")).unwrap();

        let loader = Loader::new(&config);
        let dispatcher = RecordingDispatcher { seen: RefCell::new(Vec::new()) };
        let (_m, outcome) = loader.load(&dispatcher, None).unwrap();
        assert!(matches!(outcome, LoadOutcome::Loaded { commands_replayed: 1, .. }));
    }

    #[test]
    fn unknown_command_aborts_the_whole_load() {
        let dir = tempdir().unwrap();
        let mut config = AofConfig::default();
        config.dir = dir.path().to_path_buf();
        std::fs::create_dir_all(&config.dir).unwrap();

        struct RejectingDispatcher;
        impl Dispatcher for RejectingDispatcher {
            fn dispatch(&self, _ctx: &Ctx, _argv: &Vec<Bytes>) -> Result<(), AofError> {
                Err(AofError::UnknownCommand("NOPE".into()))
            }
            fn database_count(&self) -> usize {
                1
            }
        }

        let incr_name = config.incr_name(1);
        std::fs::write(config.path_in_dir(&incr_name), encode_argv(&[b("NOPE")])).unwrap();
        std::fs::write(config.manifest_path(), format!("file {incr_name} seq 1 type i\n")).unwrap();

        let loader = Loader::new(&config);
        let result = loader.load(&RejectingDispatcher, None);
        assert!(result.is_err());
    }

    #[test]
    fn migrates_a_legacy_single_file_aof() {
        let dir = tempdir().unwrap();
        let mut config = AofConfig::default();
        config.dir = dir.path().join("appendonlydir");
        std::fs::write(dir.path().join(&config.filename), encode_argv(&[b("SET"), b("a"), b("1")])).unwrap();

        let loader = Loader::new(&config);
        assert!(loader.needs_legacy_migration());
        let dispatcher = RecordingDispatcher { seen: RefCell::new(Vec::new()) };
        let (_manifest, outcome) = loader.load(&dispatcher, None).unwrap();
        assert!(matches!(outcome, LoadOutcome::Loaded { commands_replayed: 1, .. }));
        assert!(config.manifest_path().exists());
    }
}
