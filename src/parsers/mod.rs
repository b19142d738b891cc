//! Pluggable log format parsers and the registry that selects between them.
//!
//! Every format implements [`LogParser`]. The [`ParserRegistry`] keeps parsers
//! sorted by descending [`priority`](LogParser::priority) and, for a given
//! file, reads a small head once and offers it to each parser's
//! [`can_parse`](LogParser::can_parse) probe. The first match wins.
//!
//! ```text
//! ┌───────────────────────────── ParserRegistry ─────────────────────────────┐
//! │ claude-code (30) │ codex (20) │ chat-jsonl (10) │ chat-export (0) │ ... │
//! └──────────────────────────────────┬───────────────────────────────────────┘
//!                                    ▼
//!                     select(path) → Some(parser) | None
//! ```
//!
//! Line-delimited formats only provide a [`LineDecoder`](crate::incremental::LineDecoder);
//! the [`IncrementalParser`](crate::incremental::IncrementalParser) adapter turns
//! that into a full `LogParser` with checkpointed re-parsing.

mod chat_export;
mod chat_jsonl;
mod claude_code;
mod codex;

pub use chat_export::ChatExportParser;
pub use chat_jsonl::ChatJsonlDecoder;
pub use claude_code::ClaudeCodeDecoder;
pub use codex::CodexDecoder;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::error::IngestError;
use crate::incremental::{IncrementalParse, IncrementalParser};
use crate::models::{ParseCheckpoint, ParsedConversation};

/// Bytes read from the start of a file for capability probing.
const PROBE_HEAD_BYTES: u64 = 64 * 1024;

/// Cheap view of a file offered to [`LogParser::can_parse`].
pub struct Probe<'a> {
    pub path: &'a Path,
    /// Up to the first 64 KiB of the file, lossily decoded.
    pub head: &'a str,
}

impl<'a> Probe<'a> {
    /// First non-blank line of the head.
    pub fn first_record(&self) -> Option<&'a str> {
        self.head.lines().map(str::trim).find(|l| !l.is_empty())
    }

    /// First record parsed as JSON, if it is valid JSON.
    pub fn first_json(&self) -> Option<Value> {
        self.first_record()
            .and_then(|line| serde_json::from_str(line).ok())
    }

    pub fn has_extension(&self, extensions: &[&str]) -> bool {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| extensions.iter().any(|x| x.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }
}

/// A conversation log format.
pub trait LogParser: Send + Sync {
    /// Stable identifier, also stored as the conversation source.
    fn name(&self) -> &str;

    /// Higher priorities are probed first.
    fn priority(&self) -> i32 {
        0
    }

    /// File extensions (without the dot) this format is written with.
    fn extensions(&self) -> &[&'static str];

    /// Extension match plus a content sniff of the first record.
    fn can_parse(&self, probe: &Probe<'_>) -> bool;

    /// Full scan of the file.
    fn parse(&self, path: &Path) -> Result<ParsedConversation, IngestError>;

    fn supports_incremental(&self) -> bool {
        false
    }

    /// Parse only what was appended after `checkpoint`.
    fn parse_incremental(
        &self,
        path: &Path,
        checkpoint: &ParseCheckpoint,
    ) -> Result<IncrementalParse, IngestError> {
        let _ = (path, checkpoint);
        Err(IngestError::Parse(format!(
            "{} does not support incremental parsing",
            self.name()
        )))
    }
}

/// Explicit registry of parsers, probed in descending priority.
#[derive(Clone, Default)]
pub struct ParserRegistry {
    parsers: Vec<Arc<dyn LogParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated with every built-in format.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(IncrementalParser::new(ClaudeCodeDecoder)));
        registry.register(Arc::new(IncrementalParser::new(CodexDecoder)));
        registry.register(Arc::new(IncrementalParser::new(ChatJsonlDecoder)));
        registry.register(Arc::new(ChatExportParser));
        registry
    }

    /// Add a parser. Equal priorities keep registration order.
    pub fn register(&mut self, parser: Arc<dyn LogParser>) {
        let pos = self
            .parsers
            .iter()
            .position(|p| p.priority() < parser.priority())
            .unwrap_or(self.parsers.len());
        self.parsers.insert(pos, parser);
    }

    pub fn parsers(&self) -> &[Arc<dyn LogParser>] {
        &self.parsers
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LogParser>> {
        self.parsers.iter().find(|p| p.name() == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }

    /// Pick the parser for `path`, or `None` when no format recognises it.
    ///
    /// Reads at most 64 KiB once; no other side effects.
    pub fn select(&self, path: &Path) -> Result<Option<Arc<dyn LogParser>>, IngestError> {
        let head = read_head(path)?;
        let probe = Probe { path, head: &head };
        Ok(self.parsers.iter().find(|p| p.can_parse(&probe)).cloned())
    }
}

fn read_head(path: &Path) -> Result<String, IngestError> {
    let file = std::fs::File::open(path).map_err(|e| IngestError::io(path, e))?;
    let mut buf = Vec::new();
    file.take(PROBE_HEAD_BYTES)
        .read_to_end(&mut buf)
        .map_err(|e| IngestError::io(path, e))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

// ═══════════════════════════════════════════════════════════════════════
// Shared decoding helpers
// ═══════════════════════════════════════════════════════════════════════

/// Accepts RFC 3339 strings and epoch numbers (seconds or milliseconds).
pub(crate) fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let raw = n.as_i64()?;
            // Anything past year ~2286 in seconds is really milliseconds.
            if raw > 10_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}

pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

/// Flatten string-or-blocks content into plain text.
pub(crate) fn flatten_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                other => str_field(other, "text").map(String::from),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub(crate) fn truncate_title(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    if first_line.chars().count() > 80 {
        let cut: String = first_line.chars().take(77).collect();
        format!("{}...", cut)
    } else {
        first_line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct Fixed {
        name: &'static str,
        priority: i32,
        accept: bool,
    }

    impl LogParser for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn extensions(&self) -> &[&'static str] {
            &["log"]
        }
        fn can_parse(&self, probe: &Probe<'_>) -> bool {
            self.accept && probe.has_extension(self.extensions())
        }
        fn parse(&self, _path: &Path) -> Result<ParsedConversation, IngestError> {
            Ok(ParsedConversation::new(self.name))
        }
    }

    #[test]
    fn test_select_prefers_higher_priority() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.log");
        fs::write(&path, "x\n").unwrap();

        let mut registry = ParserRegistry::new();
        registry.register(Arc::new(Fixed { name: "low", priority: 1, accept: true }));
        registry.register(Arc::new(Fixed { name: "high", priority: 9, accept: true }));
        registry.register(Arc::new(Fixed { name: "never", priority: 20, accept: false }));

        let chosen = registry.select(&path).unwrap().unwrap();
        assert_eq!(chosen.name(), "high");
        assert_eq!(registry.parsers()[0].name(), "never");
    }

    #[test]
    fn test_unknown_format_yields_none() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("notes.txt");
        fs::write(&path, "just some text\n").unwrap();

        let registry = ParserRegistry::with_builtins();
        assert!(registry.select(&path).unwrap().is_none());
    }

    #[test]
    fn test_select_missing_file_is_not_found() {
        let registry = ParserRegistry::with_builtins();
        let err = registry.select(Path::new("/definitely/not/here.jsonl")).err().unwrap();
        assert!(matches!(err, IngestError::FileNotFound(_)));
    }

    #[test]
    fn test_builtins_dispatch_by_content() {
        let tmp = TempDir::new().unwrap();
        let claude = tmp.path().join("c.jsonl");
        fs::write(
            &claude,
            r#"{"type":"user","sessionId":"s1","message":{"role":"user","content":"hi"}}"#.to_string() + "\n",
        )
        .unwrap();
        let codex = tmp.path().join("x.jsonl");
        fs::write(
            &codex,
            r#"{"type":"session_meta","payload":{"id":"r1","cwd":"/w"}}"#.to_string() + "\n",
        )
        .unwrap();
        let generic = tmp.path().join("g.jsonl");
        fs::write(&generic, "{\"role\":\"user\",\"content\":\"hey\"}\n").unwrap();
        let export = tmp.path().join("e.json");
        fs::write(&export, r#"{"title":"t","messages":[]}"#).unwrap();

        let registry = ParserRegistry::with_builtins();
        let name = |p: &Path| registry.select(p).unwrap().unwrap().name().to_string();
        assert_eq!(name(&claude), "claude-code");
        assert_eq!(name(&codex), "codex");
        assert_eq!(name(&generic), "chat-jsonl");
        assert_eq!(name(&export), "chat-export");
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let rfc = parse_timestamp(&Value::String("2025-01-02T03:04:05Z".into())).unwrap();
        assert_eq!(rfc.timestamp(), 1_735_787_045);
        let secs = parse_timestamp(&serde_json::json!(1_735_787_045)).unwrap();
        let millis = parse_timestamp(&serde_json::json!(1_735_787_045_000i64)).unwrap();
        assert_eq!(secs, millis);
        assert!(parse_timestamp(&Value::Bool(true)).is_none());
    }

    #[test]
    fn test_truncate_title() {
        assert_eq!(truncate_title("short\nsecond"), "short");
        let long = "x".repeat(120);
        assert_eq!(truncate_title(&long).chars().count(), 80);
    }
}
