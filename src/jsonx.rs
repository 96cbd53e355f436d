//! Brace-balanced JSON-object extraction, shared by the planner (parsing an
//! LLM's plan decomposition) and the action loop (parsing an LLM's next
//! action). Grounded on the shape of the teacher's
//! `services::extract_json_from_response`, which tried fenced blocks, plain
//! blocks, direct objects, and embedded `find`/`rfind` in sequence; here a
//! single brace-counting scan that respects string literals handles all of
//! those forms in one pass, since fence markers and surrounding prose never
//! contain an unescaped `{` or `}`.

/// Scans for the first top-level `{...}` object in `text`, respecting
/// string literals and escapes so braces inside quoted strings don't throw
/// off the count. Returns the matching slice, unparsed.
pub fn extract_balanced_json(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;

    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + 1;
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_fenced_block() {
        let text = "```json\n{\"action\": \"bash\", \"command\": \"ls\"}\n```";
        assert_eq!(
            extract_balanced_json(text).unwrap(),
            r#"{"action": "bash", "command": "ls"}"#
        );
    }

    #[test]
    fn extracts_direct_object() {
        let text = r#"{"a": {"b": 1}}"#;
        assert_eq!(extract_balanced_json(text).unwrap(), text);
    }

    #[test]
    fn ignores_braces_in_strings() {
        let text = r#"{"note": "use { and } carefully"}"#;
        assert_eq!(extract_balanced_json(text).unwrap(), text);
    }

    #[test]
    fn none_when_absent() {
        assert!(extract_balanced_json("plain text, no json").is_none());
    }
}
