//! Incremental (checkpointed) parsing of line-delimited logs.
//!
//! [`IncrementalParser`] wraps a [`LineDecoder`] and reads only the bytes
//! between a stored [`ParseCheckpoint`] and the current end of file:
//!
//! 1. If the file shrank below the checkpoint offset, or the bytes just before
//!    the offset no longer hash to `partial_hash`, the file was truncated or
//!    rewritten: the checkpoint is discarded and the pass restarts at 0.
//! 2. Only newline-terminated records are consumed. An unterminated trailing
//!    line is left for the next pass and does not move the offset.
//! 3. A record that is not valid JSON (or that the decoder does not recognise)
//!    is skipped and counted; it never aborts the pass.
//!
//! The unread tail is streamed line by line through a [`READ_CHUNK`] buffer,
//! so memory stays bounded by the longest record rather than the file size.
//!
//! A full parse is an incremental pass from a fresh checkpoint, so both paths
//! decode identical message sequences.

use chrono::Utc;
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::IngestError;
use crate::fingerprint::sha256_hex;
use crate::models::{ParseCheckpoint, ParsedConversation};
use crate::parsers::{LogParser, Probe};

/// Size of the window before the offset covered by `partial_hash`.
pub const PARTIAL_HASH_WINDOW: u64 = 4096;

/// Read buffer size for the unread tail.
pub const READ_CHUNK: usize = 64 * 1024;

/// Decodes one JSON record of a line-delimited format.
pub trait LineDecoder: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        0
    }

    fn extensions(&self) -> &[&'static str] {
        &["jsonl"]
    }

    /// Content sniff on the first record of the file.
    fn sniff(&self, record: &Value) -> bool;

    /// Fold `record` into `out`. Returns `false` when the record is not
    /// something this format knows, so the caller counts it as skipped.
    fn decode(&self, record: &Value, out: &mut ParsedConversation) -> bool;
}

/// Result of one incremental pass.
#[derive(Debug, Clone)]
pub struct IncrementalParse {
    /// Messages decoded in this pass only; indices start at 0.
    pub conversation: ParsedConversation,
    pub checkpoint: ParseCheckpoint,
    /// The stored checkpoint was invalid and the pass started from 0.
    pub reset: bool,
}

impl IncrementalParse {
    pub fn is_empty(&self) -> bool {
        self.conversation.messages.is_empty()
    }
}

/// Adapter giving any [`LineDecoder`] full and incremental parsing.
pub struct IncrementalParser<D> {
    decoder: D,
}

impl<D: LineDecoder> IncrementalParser<D> {
    pub fn new(decoder: D) -> Self {
        Self { decoder }
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }
}

impl<D: LineDecoder> LogParser for IncrementalParser<D> {
    fn name(&self) -> &str {
        self.decoder.name()
    }

    fn priority(&self) -> i32 {
        self.decoder.priority()
    }

    fn extensions(&self) -> &[&'static str] {
        self.decoder.extensions()
    }

    fn can_parse(&self, probe: &Probe<'_>) -> bool {
        probe.has_extension(self.extensions())
            && probe
                .first_json()
                .map(|record| self.decoder.sniff(&record))
                .unwrap_or(false)
    }

    fn parse(&self, path: &Path) -> Result<ParsedConversation, IngestError> {
        read_increment(path, &ParseCheckpoint::start(path), &self.decoder)
            .map(|pass| pass.conversation)
    }

    fn supports_incremental(&self) -> bool {
        true
    }

    fn parse_incremental(
        &self,
        path: &Path,
        checkpoint: &ParseCheckpoint,
    ) -> Result<IncrementalParse, IngestError> {
        read_increment(path, checkpoint, &self.decoder)
    }
}

/// Run one pass of `decoder` over `path` starting at `checkpoint`.
pub fn read_increment(
    path: &Path,
    checkpoint: &ParseCheckpoint,
    decoder: &dyn LineDecoder,
) -> Result<IncrementalParse, IngestError> {
    let mut file = File::open(path).map_err(|e| IngestError::io(path, e))?;
    let size = file.metadata().map_err(|e| IngestError::io(path, e))?.len();

    let mut start = checkpoint.clone();
    let mut reset = false;
    if size < checkpoint.offset {
        tracing::info!(
            path = %path.display(),
            offset = checkpoint.offset,
            size,
            "file shrank below checkpoint; re-parsing from start"
        );
        reset = true;
    } else if checkpoint.offset > 0 && !checkpoint.partial_hash.is_empty() {
        let current = hash_window(&mut file, checkpoint.offset).map_err(|e| IngestError::io(path, e))?;
        if current != checkpoint.partial_hash {
            tracing::info!(
                path = %path.display(),
                offset = checkpoint.offset,
                "content before checkpoint changed; re-parsing from start"
            );
            reset = true;
        }
    }
    if reset {
        start = ParseCheckpoint::start(path);
    }

    let mut conversation = ParsedConversation::new(decoder.name());

    if size == start.offset {
        return Ok(IncrementalParse {
            conversation,
            checkpoint: start,
            reset,
        });
    }

    file.seek(SeekFrom::Start(start.offset))
        .map_err(|e| IngestError::io(path, e))?;
    let mut line_number = start.line_number;
    let mut consumed: u64 = 0;
    {
        let mut reader = BufReader::with_capacity(READ_CHUNK, (&file).take(size - start.offset));
        let mut raw = Vec::new();
        loop {
            raw.clear();
            let n = reader
                .read_until(b'\n', &mut raw)
                .map_err(|e| IngestError::io(path, e))?;
            // Only whole lines are consumed.
            if n == 0 || raw.last() != Some(&b'\n') {
                break;
            }
            consumed += n as u64;
            line_number += 1;
            decode_line(&raw[..n - 1], decoder, &mut conversation, path, line_number);
        }
    }
    if consumed == 0 {
        return Ok(IncrementalParse {
            conversation,
            checkpoint: start,
            reset,
        });
    }

    let offset = start.offset + consumed;
    let partial_hash = hash_window(&mut file, offset).map_err(|e| IngestError::io(path, e))?;

    Ok(IncrementalParse {
        conversation,
        checkpoint: ParseCheckpoint {
            path: path.to_path_buf(),
            offset,
            line_number,
            file_size: size,
            partial_hash,
            conversation_id: start.conversation_id,
            updated_at: Utc::now(),
        },
        reset,
    })
}

fn decode_line(
    raw: &[u8],
    decoder: &dyn LineDecoder,
    conversation: &mut ParsedConversation,
    path: &Path,
    line_number: u64,
) {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let text = match std::str::from_utf8(raw) {
        Ok(t) => t.trim(),
        Err(_) => {
            conversation.skipped_records += 1;
            return;
        }
    };
    if text.is_empty() {
        return;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(record) => {
            if !decoder.decode(&record, conversation) {
                conversation.skipped_records += 1;
            }
        }
        Err(err) => {
            tracing::debug!(path = %path.display(), line = line_number, error = %err, "skipping malformed record");
            conversation.skipped_records += 1;
        }
    }
}

/// SHA-256 of the `PARTIAL_HASH_WINDOW` bytes ending at `end`.
fn hash_window(file: &mut File, end: u64) -> std::io::Result<String> {
    let len = end.min(PARTIAL_HASH_WINDOW);
    file.seek(SeekFrom::Start(end - len))?;
    let mut window = vec![0u8; len as usize];
    file.read_exact(&mut window)?;
    Ok(sha256_hex(&window))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::ChatJsonlDecoder;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use tempfile::TempDir;

    fn line(role: &str, content: &str) -> String {
        format!("{{\"role\":\"{}\",\"content\":\"{}\"}}\n", role, content)
    }

    fn append(path: &Path, text: &str) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    fn contents(conv: &ParsedConversation) -> Vec<(String, String)> {
        conv.messages
            .iter()
            .map(|m| (m.role.clone(), m.content.clone()))
            .collect()
    }

    #[test]
    fn test_full_parse_skips_malformed_and_reaches_eof() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.jsonl");
        let body = line("user", "one") + "{not json\n" + &line("assistant", "two") + &line("user", "three");
        fs::write(&path, &body).unwrap();

        let pass = read_increment(&path, &ParseCheckpoint::start(&path), &ChatJsonlDecoder).unwrap();
        assert_eq!(pass.conversation.messages.len(), 3);
        assert_eq!(pass.conversation.skipped_records, 1);
        assert_eq!(pass.checkpoint.offset, body.len() as u64);
        assert_eq!(pass.checkpoint.line_number, 4);
        assert!(!pass.reset);
    }

    #[test]
    fn test_partial_trailing_line_not_consumed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.jsonl");
        let complete = line("user", "one");
        fs::write(&path, format!("{}{{\"role\":\"assistant\",\"con", complete)).unwrap();

        let pass = read_increment(&path, &ParseCheckpoint::start(&path), &ChatJsonlDecoder).unwrap();
        assert_eq!(pass.conversation.messages.len(), 1);
        assert_eq!(pass.conversation.skipped_records, 0);
        assert_eq!(pass.checkpoint.offset, complete.len() as u64);
        assert_eq!(pass.checkpoint.line_number, 1);

        // Finish the line; the next pass picks up exactly that record.
        append(&path, "tent\":\"two\"}\n");
        let next = read_increment(&path, &pass.checkpoint, &ChatJsonlDecoder).unwrap();
        assert_eq!(contents(&next.conversation), vec![("assistant".into(), "two".into())]);
        assert_eq!(next.checkpoint.line_number, 2);
    }

    #[test]
    fn test_records_spanning_read_buffer() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("long.jsonl");
        let long = "x".repeat(READ_CHUNK + 100);
        let body = line("user", "short") + &line("assistant", &long) + &line("user", "after");
        fs::write(&path, &body).unwrap();

        let pass = read_increment(&path, &ParseCheckpoint::start(&path), &ChatJsonlDecoder).unwrap();
        let got = contents(&pass.conversation);
        assert_eq!(got.len(), 3);
        assert_eq!(got[1].1.len(), long.len());
        assert_eq!(got[2].1, "after");
        assert_eq!(pass.checkpoint.offset, body.len() as u64);
        assert_eq!(pass.checkpoint.line_number, 3);
    }

    #[test]
    fn test_incremental_equivalence() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("grow.jsonl");
        let lines: Vec<String> = (0..10).map(|i| line("user", &format!("m{}", i))).collect();

        fs::write(&path, lines[..7].concat()).unwrap();
        let first = read_increment(&path, &ParseCheckpoint::start(&path), &ChatJsonlDecoder).unwrap();
        append(&path, &lines[7..].concat());
        let second = read_increment(&path, &first.checkpoint, &ChatJsonlDecoder).unwrap();

        let mut stitched = contents(&first.conversation);
        stitched.extend(contents(&second.conversation));

        let full = read_increment(&path, &ParseCheckpoint::start(&path), &ChatJsonlDecoder).unwrap();
        assert_eq!(stitched, contents(&full.conversation));
        assert_eq!(second.checkpoint.offset, full.checkpoint.offset);
        assert_eq!(second.checkpoint.partial_hash, full.checkpoint.partial_hash);
    }

    #[test]
    fn test_no_new_content_leaves_checkpoint_unchanged() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.jsonl");
        fs::write(&path, line("user", "one")).unwrap();

        let first = read_increment(&path, &ParseCheckpoint::start(&path), &ChatJsonlDecoder).unwrap();
        let again = read_increment(&path, &first.checkpoint, &ChatJsonlDecoder).unwrap();
        assert!(again.is_empty());
        assert_eq!(again.checkpoint, first.checkpoint);
    }

    #[test]
    fn test_truncation_forces_full_reparse() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.jsonl");
        fs::write(&path, line("user", "one") + &line("user", "two")).unwrap();
        let mut first = read_increment(&path, &ParseCheckpoint::start(&path), &ChatJsonlDecoder).unwrap();
        first.checkpoint.conversation_id = Some("conv-1".into());

        fs::write(&path, line("user", "x")).unwrap();
        let pass = read_increment(&path, &first.checkpoint, &ChatJsonlDecoder).unwrap();
        assert!(pass.reset);
        assert_eq!(contents(&pass.conversation), vec![("user".into(), "x".into())]);
        assert_eq!(pass.checkpoint.conversation_id, None);
    }

    #[test]
    fn test_in_place_rewrite_detected_by_partial_hash() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.jsonl");
        fs::write(&path, line("user", "aaa")).unwrap();
        let first = read_increment(&path, &ParseCheckpoint::start(&path), &ChatJsonlDecoder).unwrap();

        // Same length prefix, different bytes, plus growth.
        fs::write(&path, line("user", "bbb") + &line("user", "ccc")).unwrap();
        let pass = read_increment(&path, &first.checkpoint, &ChatJsonlDecoder).unwrap();
        assert!(pass.reset);
        assert_eq!(pass.conversation.messages.len(), 2);
    }

    #[test]
    fn test_missing_file_reports_not_found() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gone.jsonl");
        let err = read_increment(&path, &ParseCheckpoint::start(&path), &ChatJsonlDecoder).unwrap_err();
        assert!(matches!(err, IngestError::FileNotFound(_)));
    }

    #[test]
    fn test_crlf_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.jsonl");
        fs::write(&path, "{\"role\":\"user\",\"content\":\"hi\"}\r\n").unwrap();
        let pass = read_increment(&path, &ParseCheckpoint::start(&path), &ChatJsonlDecoder).unwrap();
        assert_eq!(pass.conversation.messages.len(), 1);
        assert_eq!(pass.conversation.skipped_records, 0);
    }
}
