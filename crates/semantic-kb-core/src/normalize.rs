//! Record normalization: raw key/value records → [`Document`]s.
//!
//! [`normalize`] is total. Records with no usable content field fall back
//! to a deterministic description of the structured record, so a
//! document's `body` is never empty.
//!
//! # Field policy
//!
//! | Field | Source |
//! |-------|--------|
//! | `id` | `options.id_field` (string or number), else `doc_{index}_{millis}` |
//! | `title` | `title` |
//! | `body` | `options.text_field`, then `content`, `body`, `text`, `description` |
//! | `tags` | `tags`, as a list or a comma-delimited string |
//! | `metadata` | every other scalar field |
//! | `extra` | every other non-scalar field, kept as JSON |
//!
//! The embedding text is `"{title}\n\n{body}"` when both a title and a
//! content field are present, otherwise just the body.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::{Document, MetadataValue, RawRecord};

const BODY_FIELDS: &[&str] = &["content", "body", "text", "description"];
const TITLE_FIELD: &str = "title";
const TAGS_FIELD: &str = "tags";

/// Characters of the serialized record appended after a name/title prefix.
const DESCRIPTION_PREFIXED_CHARS: usize = 200;
/// Characters of the serialized record used when nothing else is known.
const DESCRIPTION_BARE_CHARS: usize = 500;

/// Which fields of a raw record carry the id and the text content.
#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    /// Field holding the primary text. Checked before the built-in names.
    pub text_field: Option<String>,
    /// Field holding a stable external id.
    pub id_field: String,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            text_field: None,
            id_field: "id".to_string(),
        }
    }
}

/// Normalize a raw record, stamping it with the current time.
pub fn normalize(raw: &RawRecord, source_index: usize, options: &NormalizeOptions) -> Document {
    normalize_at(raw, source_index, options, Utc::now())
}

/// The stable id `raw` carries in `id_field`, if any.
///
/// `None` when the field is missing, blank, null, or not a scalar; the
/// normalizer then generates an id that changes on every import.
pub fn record_id(raw: &RawRecord, id_field: &str) -> Option<String> {
    raw.get(id_field).and_then(scalar_text)
}

/// Normalize a raw record with an explicit import timestamp.
pub fn normalize_at(
    raw: &RawRecord,
    source_index: usize,
    options: &NormalizeOptions,
    now: DateTime<Utc>,
) -> Document {
    let mut consumed: Vec<&str> = Vec::new();

    let id = match record_id(raw, &options.id_field) {
        Some(id) => {
            consumed.push(options.id_field.as_str());
            id
        }
        None => format!("doc_{}_{}", source_index, now.timestamp_millis()),
    };

    let title = raw.get(TITLE_FIELD).and_then(scalar_text);
    if title.is_some() {
        consumed.push(TITLE_FIELD);
    }

    let body_field = options
        .text_field
        .iter()
        .map(String::as_str)
        .chain(BODY_FIELDS.iter().copied())
        .find(|f| raw.get(*f).and_then(scalar_text).is_some());

    let (body, embedding_text) = match body_field {
        Some(field) => {
            consumed.push(field);
            let body = raw.get(field).and_then(scalar_text).unwrap_or_default();
            let text = match &title {
                Some(t) => format!("{}\n\n{}", t, body),
                None => body.clone(),
            };
            (body, text)
        }
        None => {
            let description = describe_record(raw);
            (description.clone(), description)
        }
    };

    let tags = raw.get(TAGS_FIELD).map(normalize_tags).unwrap_or_default();
    if raw.contains_key(TAGS_FIELD) {
        consumed.push(TAGS_FIELD);
    }

    let mut metadata = BTreeMap::new();
    let mut extra = BTreeMap::new();
    for (key, value) in raw {
        if consumed.contains(&key.as_str()) {
            continue;
        }
        match MetadataValue::from_json(value) {
            Some(scalar) => {
                metadata.insert(key.clone(), scalar);
            }
            None if value.is_null() => {}
            None => {
                extra.insert(key.clone(), value.clone());
            }
        }
    }

    Document {
        id,
        source_index,
        title,
        body,
        tags,
        metadata,
        extra,
        import_timestamp: now,
        embedding_text,
    }
}

/// Normalize a tag field into an ordered, de-duplicated list.
///
/// Strings are split on commas; lists are taken element-wise. Tokens are
/// trimmed and empty tokens dropped. The first occurrence of a tag wins.
///
/// ```rust
/// use semantic_kb_core::normalize::normalize_tags;
/// use serde_json::json;
///
/// assert_eq!(normalize_tags(&json!("a, b ,c")), vec!["a", "b", "c"]);
/// assert_eq!(normalize_tags(&json!(["a", "b"])), vec!["a", "b"]);
/// ```
pub fn normalize_tags(value: &Value) -> Vec<String> {
    let raw: Vec<String> = match value {
        Value::String(s) => s.split(',').map(str::to_string).collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(scalar_text)
            .flat_map(|s| s.split(',').map(str::to_string).collect::<Vec<_>>())
            .collect(),
        Value::Null => Vec::new(),
        other => scalar_text(other).into_iter().collect(),
    };

    let mut tags: Vec<String> = Vec::with_capacity(raw.len());
    for token in raw {
        let token = token.trim();
        if token.is_empty() || tags.iter().any(|t| t == token) {
            continue;
        }
        tags.push(token.to_string());
    }
    tags
}

/// Render a best-effort description of a record with no content field.
///
/// Product-like records (`brand` + `model`) get a sentence built from
/// their fields; records with a `name` or `title` get that as a prefix
/// followed by the start of the serialized record; anything else is the
/// first 500 characters of the serialized record.
pub fn describe_record(raw: &RawRecord) -> String {
    let field = |k: &str| raw.get(k).and_then(scalar_text);

    if let (Some(brand), Some(model)) = (field("brand"), field("model")) {
        let mut out = format!("{} {}", brand, model);
        if let Some(kind) = field("type") {
            out.push_str(&format!(" - {}", kind));
        }
        out.push('.');
        for list_field in ["powertrain", "key_selling_points", "features"] {
            if let Some(items) = raw.get(list_field).map(list_preview) {
                if !items.is_empty() {
                    out.push_str(&format!(" {}: {}.", list_field.replace('_', " "), items));
                }
            }
        }
        return out;
    }

    let json = Value::Object(raw.clone()).to_string();
    if let Some(name) = field("name") {
        format!("Item: {}. {}", name, truncate_chars(&json, DESCRIPTION_PREFIXED_CHARS))
    } else if let Some(title) = field(TITLE_FIELD) {
        format!("Title: {}. {}", title, truncate_chars(&json, DESCRIPTION_PREFIXED_CHARS))
    } else {
        truncate_chars(&json, DESCRIPTION_BARE_CHARS).to_string()
    }
}

/// Up to three items of a list (or nested lists inside an object), comma-joined.
fn list_preview(value: &Value) -> String {
    let items: Vec<String> = match value {
        Value::Array(items) => items.iter().filter_map(scalar_text).collect(),
        Value::Object(groups) => groups
            .values()
            .filter_map(Value::as_array)
            .flat_map(|items| items.iter().take(2).filter_map(scalar_text))
            .collect(),
        other => scalar_text(other).into_iter().collect(),
    };
    items.into_iter().take(3).collect::<Vec<_>>().join(", ")
}

/// Render a scalar JSON value as trimmed, non-empty text.
fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Slice `s` to at most `max` characters, on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_record_id_requires_non_blank_scalar() {
        assert_eq!(record_id(&record(json!({"id": " a1 "})), "id").as_deref(), Some("a1"));
        assert_eq!(record_id(&record(json!({"id": 7})), "id").as_deref(), Some("7"));
        assert_eq!(record_id(&record(json!({"id": ""})), "id"), None);
        assert_eq!(record_id(&record(json!({"id": null})), "id"), None);
        assert_eq!(record_id(&record(json!({"id": [1]})), "id"), None);
        assert_eq!(record_id(&record(json!({"sku": "x"})), "id"), None);
    }

    #[test]
    fn test_title_and_content_concatenated() {
        let raw = record(json!({"title": "A", "content": "apple pie recipe"}));
        let doc = normalize_at(&raw, 0, &NormalizeOptions::default(), fixed_now());
        assert_eq!(doc.title.as_deref(), Some("A"));
        assert_eq!(doc.body, "apple pie recipe");
        assert_eq!(doc.embedding_text, "A\n\napple pie recipe");
        assert!(doc.metadata.is_empty());
    }

    #[test]
    fn test_body_without_title() {
        let raw = record(json!({"text": "just text", "source": "notes"}));
        let doc = normalize_at(&raw, 0, &NormalizeOptions::default(), fixed_now());
        assert_eq!(doc.title, None);
        assert_eq!(doc.embedding_text, "just text");
        assert_eq!(
            doc.metadata.get("source"),
            Some(&MetadataValue::String("notes".into()))
        );
    }

    #[test]
    fn test_custom_text_field_wins() {
        let raw = record(json!({"summary": "short", "content": "long"}));
        let opts = NormalizeOptions {
            text_field: Some("summary".into()),
            ..Default::default()
        };
        let doc = normalize_at(&raw, 0, &opts, fixed_now());
        assert_eq!(doc.body, "short");
        assert_eq!(
            doc.metadata.get("content"),
            Some(&MetadataValue::String("long".into()))
        );
    }

    #[test]
    fn test_external_id_used() {
        let raw = record(json!({"id": 42, "content": "x"}));
        let doc = normalize_at(&raw, 7, &NormalizeOptions::default(), fixed_now());
        assert_eq!(doc.id, "42");
        assert!(!doc.metadata.contains_key("id"));
    }

    #[test]
    fn test_auto_id_from_index_and_timestamp() {
        let raw = record(json!({"content": "x"}));
        let doc = normalize_at(&raw, 3, &NormalizeOptions::default(), fixed_now());
        assert_eq!(doc.id, "doc_3_1700000000000");
        assert_eq!(doc.import_timestamp, fixed_now());
    }

    #[test]
    fn test_tags_string_and_list() {
        assert_eq!(normalize_tags(&json!("a, b ,c")), vec!["a", "b", "c"]);
        assert_eq!(normalize_tags(&json!(["a", "b"])), vec!["a", "b"]);
        assert_eq!(normalize_tags(&json!(" , a,,a , b")), vec!["a", "b"]);
        assert_eq!(normalize_tags(&json!(null)), Vec::<String>::new());
    }

    #[test]
    fn test_fallback_with_name() {
        let raw = record(json!({"name": "Widget", "price": 10}));
        let doc = normalize_at(&raw, 0, &NormalizeOptions::default(), fixed_now());
        assert!(doc.body.starts_with("Item: Widget. {"));
        assert_eq!(doc.embedding_text, doc.body);
        assert_eq!(doc.metadata.get("price"), Some(&MetadataValue::Integer(10)));
    }

    #[test]
    fn test_fallback_with_title_only() {
        let raw = record(json!({"title": "Lonely"}));
        let doc = normalize_at(&raw, 0, &NormalizeOptions::default(), fixed_now());
        assert!(doc.body.starts_with("Title: Lonely. "));
    }

    #[test]
    fn test_fallback_product_description() {
        let raw = record(json!({
            "brand": "BYD",
            "model": "Han EV",
            "type": "sedan",
            "powertrain": ["electric"],
            "key_selling_points": ["range", "comfort", "price", "style"]
        }));
        let doc = normalize_at(&raw, 0, &NormalizeOptions::default(), fixed_now());
        assert!(doc.body.starts_with("BYD Han EV - sedan."));
        assert!(doc.body.contains("powertrain: electric."));
        assert!(doc.body.contains("key selling points: range, comfort, price."));
        assert!(!doc.body.contains("style"));
    }

    #[test]
    fn test_fallback_bare_json_truncated() {
        let long = "x".repeat(2000);
        let raw = record(json!({"blob": long}));
        let doc = normalize_at(&raw, 0, &NormalizeOptions::default(), fixed_now());
        assert_eq!(doc.body.chars().count(), 500);
    }

    #[test]
    fn test_empty_record_still_has_body() {
        let doc = normalize_at(&RawRecord::new(), 0, &NormalizeOptions::default(), fixed_now());
        assert!(!doc.body.is_empty());
    }

    #[test]
    fn test_blank_content_falls_back() {
        let raw = record(json!({"content": "   ", "name": "n"}));
        let doc = normalize_at(&raw, 0, &NormalizeOptions::default(), fixed_now());
        assert!(doc.body.starts_with("Item: n."));
    }

    #[test]
    fn test_non_scalar_fields_preserved_in_extra() {
        let raw = record(json!({"content": "c", "specs": {"hp": 300}, "nothing": null}));
        let doc = normalize_at(&raw, 0, &NormalizeOptions::default(), fixed_now());
        assert_eq!(doc.extra.get("specs"), Some(&json!({"hp": 300})));
        assert!(!doc.metadata.contains_key("nothing"));
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        assert_eq!(truncate_chars("比亚迪汉", 2), "比亚");
        assert_eq!(truncate_chars("ab", 5), "ab");
    }
}
