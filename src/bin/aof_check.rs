// src/bin/aof_check.rs

//! `aof-check`: an offline manifest/AOF inspector and repair tool, in the
//! spirit of `redis-check-aof`. spec.md §7 says a corrupt manifest must
//! abort the engine at startup and be "repaired offline"; this binary is
//! that offline path. It never loads `spineldb_aof::AofEngine` itself (which
//! would require a live `Dispatcher`); it walks the manifest and files
//! directly.

use anyhow::{Context, Result, bail};
use spineldb_aof::config::AofConfig;
use spineldb_aof::manifest::{AofFileType, ManifestStore};
use std::env;
use std::path::Path;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!(
            "Usage: aof-check <aof_dir> [--truncate-to-last-valid <file_name>]\n\n\
             Loads the manifest under <aof_dir> and reports every file's role, \
             sequence, and on-disk size. With --truncate-to-last-valid, truncates \
             the named file to the last byte offset that parses as a complete RESP \
             command, the same recovery `Loader` performs at startup for the last \
             file in replay order."
        );
        std::process::exit(2);
    }

    let dir = Path::new(&args[1]);
    let mut config = AofConfig::default();
    config.dir = dir.to_path_buf();

    let manifest_path = config.manifest_path();
    if !manifest_path.exists() {
        bail!("no manifest found at {}", manifest_path.display());
    }

    let manifest = ManifestStore::load(&manifest_path)
        .with_context(|| format!("loading manifest at {}", manifest_path.display()))?;

    println!("manifest: {}", manifest_path.display());
    if let Some(base) = &manifest.base {
        report_file(&config, base.file_name.as_str(), base.file_seq, "BASE");
    } else {
        println!("  (no BASE file)");
    }
    for incr in &manifest.incr_list {
        report_file(&config, &incr.file_name, incr.file_seq, "INCR");
    }
    for history in &manifest.history_list {
        report_file(&config, &history.file_name, history.file_seq, "HISTORY");
    }

    if args.len() >= 4 && args[2] == "--truncate-to-last-valid" {
        let target_name = &args[3];
        let target_entry = manifest
            .base
            .iter()
            .chain(manifest.incr_list.iter())
            .find(|info| &info.file_name == target_name)
            .ok_or_else(|| anyhow::anyhow!("'{target_name}' is not listed in the manifest"))?;
        truncate_to_last_valid(&config, target_entry.file_name.as_str(), target_entry.file_type)?;
    }

    Ok(())
}

fn report_file(config: &AofConfig, file_name: &str, file_seq: u64, role: &str) {
    let path = config.path_in_dir(file_name);
    let size = std::fs::metadata(&path).map(|m| m.len()).ok();
    match size {
        Some(bytes) => println!("  [{role}] seq={file_seq} {file_name} ({bytes} bytes)"),
        None => println!("  [{role}] seq={file_seq} {file_name} (MISSING on disk)"),
    }
}

/// Applies the same truncation `Loader` performs internally for a malformed
/// trailing record on the last file in replay order (spec.md §4.3), as a
/// standalone repair operation.
fn truncate_to_last_valid(config: &AofConfig, file_name: &str, file_type: AofFileType) -> Result<()> {
    use bytes::BytesMut;
    use spineldb_aof::resp::{AofLine, decode_line};

    let path = config.path_in_dir(file_name);
    let body = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    let mut buf = BytesMut::from(&body[..]);
    let mut valid_up_to = 0usize;
    let mut in_multi = false;
    let mut valid_before_multi = 0usize;
    let mut consumed = 0usize;

    loop {
        let before = buf.len();
        match decode_line(&mut buf) {
            Ok(Some(AofLine::Command(argv))) => {
                consumed += before - buf.len();
                if let Some(verb) = argv.first() {
                    if verb.eq_ignore_ascii_case(b"MULTI") {
                        valid_before_multi = consumed - (before - buf.len());
                        in_multi = true;
                        continue;
                    }
                    if verb.eq_ignore_ascii_case(b"EXEC") || verb.eq_ignore_ascii_case(b"DISCARD") {
                        in_multi = false;
                    }
                }
                if !in_multi {
                    valid_up_to = consumed;
                }
            }
            Ok(Some(AofLine::TimestampAnnotation(_))) => {
                consumed += before - buf.len();
                if !in_multi {
                    valid_up_to = consumed;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }

    let truncate_to = if in_multi { valid_before_multi } else { valid_up_to };
    println!(
        "[{file_type:?}] {file_name}: truncating to {truncate_to} bytes (of {} on disk)",
        body.len()
    );
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .with_context(|| format!("opening {} for truncation", path.display()))?;
    file.set_len(truncate_to as u64)
        .with_context(|| format!("truncating {}", path.display()))?;
    Ok(())
}
