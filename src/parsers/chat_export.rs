//! Whole-document chat exports.
//!
//! A single JSON object holding the full transcript. The document is only
//! meaningful once complete, so this format supports full parses only.
//!
//! ```json
//! { "id": "conv-1", "title": "Refactor", "messages": [ {"role": "user", "content": "..."} ] }
//! ```

use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

use super::{flatten_text, parse_timestamp, truncate_title, LogParser, Probe};
use crate::error::IngestError;
use crate::models::{ParsedConversation, ParsedMessage};

#[derive(Deserialize)]
struct ExportDocument {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    project_path: Option<String>,
    messages: Vec<Value>,
}

pub struct ChatExportParser;

impl LogParser for ChatExportParser {
    fn name(&self) -> &str {
        "chat-export"
    }

    fn extensions(&self) -> &[&'static str] {
        &["json"]
    }

    fn can_parse(&self, probe: &Probe<'_>) -> bool {
        probe.has_extension(self.extensions())
            && probe.head.trim_start().starts_with('{')
            && probe.head.contains("\"messages\"")
    }

    fn parse(&self, path: &Path) -> Result<ParsedConversation, IngestError> {
        let raw = std::fs::read(path).map_err(|e| IngestError::io(path, e))?;
        let doc: ExportDocument = serde_json::from_slice(&raw)
            .map_err(|e| IngestError::Parse(format!("{}: {}", path.display(), e)))?;

        let mut out = ParsedConversation::new(self.name());
        out.external_id = doc.id;
        out.project_path = doc.project_path;

        for entry in &doc.messages {
            let (Some(role), Some(content)) =
                (entry.get("role").and_then(|v| v.as_str()), entry.get("content"))
            else {
                out.skipped_records += 1;
                continue;
            };
            out.messages.push(ParsedMessage {
                index: out.messages.len() as i64,
                role: role.to_string(),
                content: flatten_text(content),
                timestamp: entry.get("timestamp").and_then(parse_timestamp),
            });
        }

        out.title = doc.title.or_else(|| {
            out.messages
                .iter()
                .find(|m| m.role == "user")
                .map(|m| truncate_title(&m.content))
        });
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_parse_export() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("export.json");
        fs::write(
            &path,
            r#"{"id":"conv-7","messages":[
                {"role":"user","content":"Why is CI red?","timestamp":"2025-02-02T00:00:00Z"},
                {"content":"orphan"},
                {"role":"assistant","content":[{"type":"text","text":"A flaky test."}]}
            ]}"#,
        )
        .unwrap();

        let conv = ChatExportParser.parse(&path).unwrap();
        assert_eq!(conv.external_id.as_deref(), Some("conv-7"));
        assert_eq!(conv.title.as_deref(), Some("Why is CI red?"));
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.skipped_records, 1);
        assert_eq!(conv.messages[1].content, "A flaky test.");
        assert!(!ChatExportParser.supports_incremental());
    }

    #[test]
    fn test_invalid_document_is_parse_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.json");
        fs::write(&path, r#"{"messages": [ "#).unwrap();
        let err = ChatExportParser.parse(&path).unwrap_err();
        assert!(matches!(err, IngestError::Parse(_)));
    }
}
