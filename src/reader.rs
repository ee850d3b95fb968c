//! File readers that turn an input file into raw records.
//!
//! | Format | Extensions | Shape |
//! |--------|------------|-------|
//! | `json` | `.json` | array of objects, a wrapper object holding one, or a single object |
//! | `csv` | `.csv` | header row, one record per row, all values strings |
//! | `jsonl` | `.jsonl`, `.ndjson` | one object per non-blank line |
//! | `text` | `.txt`, `.text`, `.md` | one record per non-blank line |
//!
//! A file whose top-level structure cannot be parsed fails with
//! [`KbError::Parse`] before any record reaches the normalizer.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;

use semantic_kb_core::ingest::RecordSource;
use semantic_kb_core::models::RawRecord;
use semantic_kb_core::{KbError, Result};

/// Keys checked, in order, for an array of records inside a JSON object.
const JSON_CONTAINER_KEYS: &[&str] = &["items", "data", "documents", "entries", "results", "records"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Json,
    Csv,
    Jsonl,
    Text,
}

impl InputFormat {
    /// Pick the format from the file extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "json" => Ok(InputFormat::Json),
            "csv" => Ok(InputFormat::Csv),
            "jsonl" | "ndjson" => Ok(InputFormat::Jsonl),
            "txt" | "text" | "md" => Ok(InputFormat::Text),
            "" => Err(KbError::UnsupportedFormat(format!(
                "{} (no extension)",
                path.display()
            ))),
            other => Err(KbError::UnsupportedFormat(format!(".{}", other))),
        }
    }
}

impl FromStr for InputFormat {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(InputFormat::Json),
            "csv" => Ok(InputFormat::Csv),
            "jsonl" | "ndjson" => Ok(InputFormat::Jsonl),
            "text" | "txt" => Ok(InputFormat::Text),
            other => Err(KbError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InputFormat::Json => "json",
            InputFormat::Csv => "csv",
            InputFormat::Jsonl => "jsonl",
            InputFormat::Text => "text",
        })
    }
}

/// A file on disk read as a [`RecordSource`].
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    format: InputFormat,
}

impl FileSource {
    /// Use `format` when given, otherwise infer it from the extension.
    pub fn new(path: impl Into<PathBuf>, format: Option<InputFormat>) -> Result<Self> {
        let path = path.into();
        let format = match format {
            Some(f) => f,
            None => InputFormat::from_path(&path)?,
        };
        Ok(Self { path, format })
    }

    pub fn format(&self) -> InputFormat {
        self.format
    }

    fn parse_error(&self, detail: impl fmt::Display) -> KbError {
        KbError::Parse {
            source_name: self.path.display().to_string(),
            detail: detail.to_string(),
        }
    }
}

#[async_trait]
impl RecordSource for FileSource {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    async fn read(&self) -> Result<Vec<RawRecord>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.parse_error(e))?;

        let records = match self.format {
            InputFormat::Json => parse_json(&content).map_err(|e| self.parse_error(e))?,
            InputFormat::Csv => parse_csv(&content).map_err(|e| self.parse_error(e))?,
            InputFormat::Jsonl => parse_jsonl(&content).map_err(|e| self.parse_error(e))?,
            InputFormat::Text => parse_text(&content, &self.name()),
        };

        tracing::debug!(
            path = %self.path.display(),
            format = %self.format,
            records = records.len(),
            "read input file"
        );
        Ok(records)
    }
}

/// Parse a JSON document into records.
pub fn parse_json(content: &str) -> std::result::Result<Vec<RawRecord>, String> {
    let value: Value = serde_json::from_str(content).map_err(|e| e.to_string())?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            let key = JSON_CONTAINER_KEYS
                .iter()
                .find(|k| matches!(map.get(**k), Some(Value::Array(_))));
            match key {
                Some(key) => match map.remove(*key) {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                },
                None => return Ok(vec![map]),
            }
        }
        other => {
            return Err(format!(
                "expected an array or object at top level, found {}",
                json_kind(&other)
            ))
        }
    };

    let mut records = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        match item {
            Value::Object(map) => records.push(map),
            other => tracing::warn!(
                element = i,
                kind = json_kind(&other),
                "skipping non-object array element"
            ),
        }
    }
    Ok(records)
}

/// Parse CSV with a header row. Every value is kept as a string.
pub fn parse_csv(content: &str) -> std::result::Result<Vec<RawRecord>, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(content.as_bytes());

    let headers = reader.headers().map_err(|e| e.to_string())?.clone();
    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| e.to_string())?;
        let mut record = RawRecord::new();
        for (header, value) in headers.iter().zip(row.iter()) {
            if header.is_empty() {
                continue;
            }
            record.insert(header.to_string(), Value::String(value.to_string()));
        }
        if !record.is_empty() {
            records.push(record);
        }
    }
    Ok(records)
}

/// Parse one JSON object per line. A bad line fails the whole file.
pub fn parse_jsonl(content: &str) -> std::result::Result<Vec<RawRecord>, String> {
    let mut records = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => records.push(map),
            Ok(other) => {
                return Err(format!(
                    "line {}: expected an object, found {}",
                    i + 1,
                    json_kind(&other)
                ))
            }
            Err(e) => return Err(format!("line {}: {}", i + 1, e)),
        }
    }
    Ok(records)
}

/// One record per non-blank line, tagged with its line number and file.
pub fn parse_text(content: &str, source_file: &str) -> Vec<RawRecord> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            let mut record = RawRecord::new();
            record.insert("text".into(), Value::String(line.trim().to_string()));
            record.insert("line_number".into(), Value::from(i + 1));
            record.insert("source_file".into(), Value::String(source_file.to_string()));
            record
        })
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(InputFormat::from_path(Path::new("a.JSON")).unwrap(), InputFormat::Json);
        assert_eq!(InputFormat::from_path(Path::new("a.ndjson")).unwrap(), InputFormat::Jsonl);
        assert_eq!(InputFormat::from_path(Path::new("notes.md")).unwrap(), InputFormat::Text);
        assert!(matches!(
            InputFormat::from_path(Path::new("data.xlsx")),
            Err(KbError::UnsupportedFormat(_))
        ));
        assert!(InputFormat::from_path(Path::new("README")).is_err());
    }

    #[test]
    fn test_json_array_skips_non_objects() {
        let records = parse_json(r#"[{"title": "a"}, 3, "x", {"title": "b"}]"#).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["title"], "b");
    }

    #[test]
    fn test_json_container_keys() {
        let records = parse_json(r#"{"meta": {"v": 1}, "documents": [{"id": 1}, {"id": 2}]}"#)
            .unwrap();
        assert_eq!(records.len(), 2);

        let single = parse_json(r#"{"title": "only", "body": "one"}"#).unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0]["title"], "only");
    }

    #[test]
    fn test_json_scalar_top_level_is_error() {
        assert!(parse_json("42").is_err());
        assert!(parse_json("{not json").is_err());
    }

    #[test]
    fn test_csv_rows_are_strings() {
        let records = parse_csv("id,title,price\n1,Widget,9.99\n2,\"Gadget, large\",20\n").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["price"], "9.99");
        assert_eq!(records[1]["title"], "Gadget, large");
    }

    #[test]
    fn test_jsonl_bad_line_names_line() {
        let err = parse_jsonl("{\"a\": 1}\n\n{oops}\n").unwrap_err();
        assert!(err.starts_with("line 3"), "{err}");
        assert!(parse_jsonl("{\"a\": 1}\n[1]\n").unwrap_err().contains("line 2"));
        assert_eq!(parse_jsonl("{\"a\": 1}\n\n{\"a\": 2}\n").unwrap().len(), 2);
    }

    #[test]
    fn test_text_lines() {
        let records = parse_text("first line\n\n  second  \n", "notes.txt");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["text"], "second");
        assert_eq!(records[1]["line_number"], 3);
        assert_eq!(records[0]["source_file"], "notes.txt");
    }

    #[tokio::test]
    async fn test_file_source_missing_file_is_parse_error() {
        let source = FileSource::new("/nonexistent/data.json", None).unwrap();
        assert!(matches!(source.read().await, Err(KbError::Parse { .. })));
    }
}
