// src/resp.rs

//! The on-disk envelope AOF files are written in: RESP arrays of bulk
//! strings, one per command, plus the `#TS:<seconds>` timestamp annotation
//! comment line (spec.md §6). This is a restricted subset of the full RESP
//! protocol, only what's needed to frame a command argv, grounded in the
//! teacher's `core/protocol/resp_frame.rs` encode/decode shape.

use crate::error::AofError;
use bytes::{Buf, Bytes, BytesMut};

const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;
const MAX_ARGV_ELEMENTS: usize = 1024 * 1024;
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// A single encoded command: an ordered list of byte-string arguments.
/// `["SET", "k", "v"]` is one `CommandArgv`.
pub type CommandArgv = Vec<Bytes>;

/// Encodes one command argv as a RESP array of bulk strings, e.g.
/// `*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n`.
pub fn encode_argv(argv: &[Bytes]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"*");
    buf.extend_from_slice(argv.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    for arg in argv {
        buf.extend_from_slice(b"$");
        buf.extend_from_slice(arg.len().to_string().as_bytes());
        buf.extend_from_slice(CRLF);
        buf.extend_from_slice(arg);
        buf.extend_from_slice(CRLF);
    }
    buf
}

/// Encodes the `#TS:<unix_seconds>\n` annotation line (spec.md §4.2).
pub fn encode_timestamp_annotation(unix_seconds: i64) -> Vec<u8> {
    format!("#TS:{unix_seconds}\n").into_bytes()
}

/// Tries to decode one command argv from the front of `src`, advancing past
/// it on success. Returns `Ok(None)` if `src` does not yet contain a full
/// frame (the caller should read more and retry), mirroring
/// `tokio_util::codec::Decoder`'s convention, though this type isn't wired
/// into a `Framed` stream since AOF replay reads whole files, not a socket.
pub fn decode_argv(src: &mut BytesMut) -> Result<Option<CommandArgv>, AofError> {
    match parse_array(src) {
        Ok((argv, len)) => {
            src.advance(len);
            Ok(Some(argv))
        }
        Err(DecodeErr::Incomplete) => Ok(None),
        Err(DecodeErr::Invalid(msg)) => Err(AofError::TruncatedTail(msg)),
    }
}

enum DecodeErr {
    Incomplete,
    Invalid(String),
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    if src.len() < CRLF_LEN {
        return None;
    }
    src.windows(CRLF_LEN).position(|w| w == CRLF)
}

fn parse_line(src: &[u8]) -> Result<(&[u8], usize), DecodeErr> {
    find_crlf(src)
        .map(|pos| (&src[..pos], pos + CRLF_LEN))
        .ok_or(DecodeErr::Incomplete)
}

fn parse_array(src: &[u8]) -> Result<(CommandArgv, usize), DecodeErr> {
    if src.is_empty() {
        return Err(DecodeErr::Incomplete);
    }
    if src[0] != b'*' {
        return Err(DecodeErr::Invalid(format!(
            "expected array prefix '*', got {:?}",
            src[0] as char
        )));
    }
    let (line, len_of_line) = parse_line(&src[1..])?;
    let count: i64 = std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DecodeErr::Invalid("malformed array length".into()))?;
    if count < 0 {
        return Err(DecodeErr::Invalid("negative array length in AOF".into()));
    }
    let count = count as usize;
    if count > MAX_ARGV_ELEMENTS {
        return Err(DecodeErr::Invalid("array length exceeds limit".into()));
    }

    let mut cursor = 1 + len_of_line;
    let mut argv = Vec::with_capacity(count);
    for _ in 0..count {
        let (arg, arg_len) = parse_bulk_string(&src[cursor..])?;
        argv.push(arg);
        cursor += arg_len;
    }
    Ok((argv, cursor))
}

fn parse_bulk_string(src: &[u8]) -> Result<(Bytes, usize), DecodeErr> {
    if src.is_empty() {
        return Err(DecodeErr::Incomplete);
    }
    if src[0] != b'$' {
        return Err(DecodeErr::Invalid(format!(
            "expected bulk string prefix '$', got {:?}",
            src[0] as char
        )));
    }
    let (line, len_of_line) = parse_line(&src[1..])?;
    let str_len: i64 = std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DecodeErr::Invalid("malformed bulk string length".into()))?;
    if str_len < 0 || str_len as usize > MAX_BULK_LEN {
        return Err(DecodeErr::Invalid("invalid bulk string length".into()));
    }
    let str_len = str_len as usize;
    let prefix_len = 1 + len_of_line;
    if src.len() < prefix_len + str_len + CRLF_LEN {
        return Err(DecodeErr::Incomplete);
    }
    if &src[prefix_len + str_len..prefix_len + str_len + CRLF_LEN] != CRLF {
        return Err(DecodeErr::Invalid("missing trailing CRLF on bulk string".into()));
    }
    let data = Bytes::copy_from_slice(&src[prefix_len..prefix_len + str_len]);
    Ok((data, prefix_len + str_len + CRLF_LEN))
}

/// A single line read from an AOF/INCR file body: either a command argv, or
/// a timestamp annotation comment. `#TS:` lines never participate in command
/// replay; the Loader consumes and discards them (spec.md §4.3, §6).
pub enum AofLine {
    Command(CommandArgv),
    TimestampAnnotation(i64),
}

/// Decodes the next `AofLine` from the front of `src`. A `#`-prefixed line
/// that isn't a well-formed `#TS:<seconds>` annotation is treated as an
/// unparseable trailing record (the Loader's truncation policy then applies).
pub fn decode_line(src: &mut BytesMut) -> Result<Option<AofLine>, AofError> {
    if src.is_empty() {
        return Ok(None);
    }
    if src[0] == b'#' {
        let Some(nl) = src.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let line = src[..nl].to_vec();
        src.advance(nl + 1);
        let text = String::from_utf8_lossy(&line);
        let seconds = text
            .strip_prefix("#TS:")
            .and_then(|s| s.trim_end_matches('\r').parse::<i64>().ok())
            .ok_or_else(|| AofError::TruncatedTail(format!("malformed annotation line: {text}")))?;
        return Ok(Some(AofLine::TimestampAnnotation(seconds)));
    }
    match decode_argv(src)? {
        Some(argv) => Ok(Some(AofLine::Command(argv))),
        None => Ok(None),
    }
}
