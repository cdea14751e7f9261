//! Tolerant JSON extraction for model output.
//!
//! Models wrap JSON in prose, cut it off at the token limit, or leave
//! trailing commas. Extraction first isolates the outermost object
//! (closing whatever is still open), then tries a light repair.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

static TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",(\s*[}\]])").unwrap());

/// Pass-1 output for one chunk of conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Extraction {
    pub facts: Vec<String>,
    pub decisions: Vec<String>,
    pub open_items: Vec<String>,
    pub entities: Vec<String>,
    pub contradictions: Vec<String>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
            && self.decisions.is_empty()
            && self.open_items.is_empty()
            && self.entities.is_empty()
            && self.contradictions.is_empty()
    }

    /// Append `other`, skipping entries already present verbatim.
    pub fn merge(&mut self, other: Extraction) {
        fn extend_unique(into: &mut Vec<String>, from: Vec<String>) {
            for item in from {
                if !into.contains(&item) {
                    into.push(item);
                }
            }
        }
        extend_unique(&mut self.facts, other.facts);
        extend_unique(&mut self.decisions, other.decisions);
        extend_unique(&mut self.open_items, other.open_items);
        extend_unique(&mut self.entities, other.entities);
        extend_unique(&mut self.contradictions, other.contradictions);
    }

    pub fn render(&self) -> String {
        let sections = [
            ("Facts", &self.facts),
            ("Decisions", &self.decisions),
            ("Open items", &self.open_items),
            ("Entities", &self.entities),
            ("Contradictions", &self.contradictions),
        ];
        let mut out = String::new();
        for (title, items) in sections {
            if items.is_empty() {
                continue;
            }
            out.push_str(&format!("## {}\n", title));
            for item in items {
                out.push_str(&format!("- {}\n", item));
            }
        }
        out
    }
}

/// Parse an [`Extraction`] from raw model text. Unusable output yields an
/// empty extraction and a warning.
pub fn parse_extraction(raw: &str) -> Extraction {
    let Some(value) = extract_json(raw) else {
        warn!(len = raw.len(), "[Distill] No parseable JSON in extraction output");
        return Extraction::default();
    };
    match serde_json::from_value::<Extraction>(lenient_lists(value)) {
        Ok(extraction) => extraction,
        Err(e) => {
            warn!(error = %e, "[Distill] Extraction JSON had the wrong shape");
            Extraction::default()
        }
    }
}

/// Coerce non-string list items (objects, numbers) to strings.
fn lenient_lists(value: Value) -> Value {
    let Value::Object(map) = value else {
        return value;
    };
    let map = map
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                Value::Array(items) => Value::Array(
                    items
                        .into_iter()
                        .map(|item| match item {
                            Value::String(s) => Value::String(s),
                            other => Value::String(other.to_string()),
                        })
                        .collect(),
                ),
                other => other,
            };
            (k, v)
        })
        .collect();
    Value::Object(map)
}

/// Find and parse the first JSON object in `raw`.
pub fn extract_json(raw: &str) -> Option<Value> {
    let candidate = balanced_object(raw)?;
    if let Ok(v) = serde_json::from_str::<Value>(&candidate) {
        return Some(v);
    }
    let repaired = repair(&candidate);
    serde_json::from_str::<Value>(&repaired).ok()
}

/// Slice from the first `{` to its matching `}`. If the text ends first,
/// close the open string and every open brace/bracket in order.
fn balanced_object(raw: &str) -> Option<String> {
    let start = raw.find('{')?;
    let body = &raw[start..];
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in body.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(c) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(body[..=i].to_string());
                }
            }
            _ => {}
        }
    }

    let mut closed = body.trim_end().to_string();
    if in_string {
        if escaped {
            closed.pop();
        }
        closed.push('"');
    }
    // A dangling key or separator cannot be closed meaningfully.
    let trimmed = closed.trim_end_matches(|c: char| c.is_whitespace() || c == ',' || c == ':');
    let mut closed = trimmed.to_string();
    drop_dangling_key(&mut closed, &stack);
    while let Some(closer) = stack.pop() {
        closed.push(closer);
    }
    Some(closed)
}

/// Inside an object, a trailing string after `{` or `,` is a key with no
/// value; remove it along with its comma.
fn drop_dangling_key(s: &mut String, stack: &[char]) {
    if stack.last() != Some(&'}') || !s.ends_with('"') || s.len() < 2 {
        return;
    }
    let bytes = s.as_bytes();
    let mut open = s.len() - 1;
    loop {
        if open == 0 {
            return;
        }
        open -= 1;
        if bytes[open] == b'"' && !is_escaped(bytes, open) {
            break;
        }
    }
    let before = s[..open].trim_end();
    let keep = if let Some(stripped) = before.strip_suffix(',') {
        stripped.trim_end().len()
    } else if before.ends_with('{') {
        before.len()
    } else {
        return;
    };
    s.truncate(keep);
}

fn is_escaped(bytes: &[u8], pos: usize) -> bool {
    let backslashes = bytes[..pos].iter().rev().take_while(|&&b| b == b'\\').count();
    backslashes % 2 == 1
}

fn repair(candidate: &str) -> String {
    let quotes_normalized: String = candidate
        .chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect();
    let single_quoted = if quotes_normalized.contains('"') {
        quotes_normalized
    } else {
        quotes_normalized.replace('\'', "\"")
    };
    TRAILING_COMMA.replace_all(&single_quoted, "$1").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extracts_object_from_prose() {
        let raw = "Sure! Here you go:\n```json\n{\"facts\": [\"a\"], \"decisions\": []}\n```\nAnything else?";
        assert_eq!(extract_json(raw), Some(json!({"facts": ["a"], "decisions": []})));
    }

    #[test]
    fn test_closes_truncated_output() {
        let raw = r#"{"facts": ["user lives in Oslo", "prefers tea"], "openItems": ["book fli"#;
        let v = extract_json(raw).unwrap();
        assert_eq!(v["facts"][1], "prefers tea");
        assert_eq!(v["openItems"][0], "book fli");
    }

    #[test]
    fn test_drops_dangling_key_separator() {
        let v = extract_json(r#"{"facts": ["a"], "decisions":"#).unwrap();
        assert_eq!(v, json!({"facts": ["a"]}));
    }

    #[test]
    fn test_repairs_trailing_commas_and_quotes() {
        let v = extract_json("{\u{201C}facts\u{201D}: [\u{201C}x\u{201D},],}").unwrap();
        assert_eq!(v, json!({"facts": ["x"]}));
        let v = extract_json("{'facts': ['y']}").unwrap();
        assert_eq!(v, json!({"facts": ["y"]}));
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let v = extract_json(r#"{"facts": ["use {curly} braces", "a ] bracket"]}"#).unwrap();
        assert_eq!(v["facts"][0], "use {curly} braces");
    }

    #[test]
    fn test_gives_up_on_garbage() {
        assert!(extract_json("no json here").is_none());
        assert_eq!(parse_extraction("{]"), Extraction::default());
    }

    #[test]
    fn test_parse_extraction_coerces_items() {
        let e = parse_extraction(r#"{"facts": ["a", {"k": 1}], "entities": ["Oslo"]}"#);
        assert_eq!(e.facts, vec!["a".to_string(), "{\"k\":1}".to_string()]);
        assert_eq!(e.entities, vec!["Oslo".to_string()]);
    }

    #[test]
    fn test_merge_dedupes_exact_strings() {
        let mut a = Extraction {
            facts: vec!["x".into(), "y".into()],
            ..Default::default()
        };
        a.merge(Extraction {
            facts: vec!["y".into(), "z".into(), "Y".into()],
            decisions: vec!["ship it".into()],
            ..Default::default()
        });
        assert_eq!(a.facts, vec!["x", "y", "z", "Y"]);
        assert_eq!(a.decisions, vec!["ship it"]);
    }
}
