//! Embedded JSON extraction
//!
//! Tool results sometimes arrive as prose wrapping a JSON object ("Query done:
//! {...}"). This is the fallback used when no `structured_data` was sent: find
//! the first `{`, then parse either the whole remainder or the balanced object
//! starting there.

use serde_json::{Map, Value};

/// Returns the balanced `{...}` span starting at `start`, honoring strings and escapes.
fn balanced_object(text: &str, start: usize) -> Option<&str> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (offset, ch) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Locates a JSON object inside free text. Never fails loudly: no object, no result.
pub fn extract_embedded_object(text: &str) -> Option<Map<String, Value>> {
    let start = text.find('{')?;

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text[start..]) {
        return Some(map);
    }

    let span = balanced_object(text, start)?;
    match serde_json::from_str::<Value>(span) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(
                "[EXTRACT] Embedded object rejected ({} chars): {}",
                span.len(),
                e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_is_whole_remainder() {
        let map = extract_embedded_object(r#"Result: {"total_rows": 2, "rows": []}"#);
        assert_eq!(map.map(|m| m["total_rows"].clone()), Some(Value::from(2)));
    }

    #[test]
    fn test_object_followed_by_prose() {
        let text = r#"Rows below {"rows":[{"name":"a}b"}],"total_rows":1} -- 12ms"#;
        let map = extract_embedded_object(text).expect("object should be found");
        assert_eq!(map["total_rows"], 1);
        assert_eq!(map["rows"][0]["name"], "a}b");
    }

    #[test]
    fn test_no_object_or_truncated_object() {
        assert!(extract_embedded_object("no json here").is_none());
        assert!(extract_embedded_object(r#"partial {"rows": [1, 2"#).is_none());
    }

    #[test]
    fn test_multibyte_prefix() {
        let map = extract_embedded_object(r#"查询完成：{"total_rows":3}。"#);
        assert_eq!(map.map(|m| m["total_rows"].clone()), Some(Value::from(3)));
    }
}
