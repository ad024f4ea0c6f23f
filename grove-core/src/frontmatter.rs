use serde_yaml::{Mapping, Value};

use crate::error::{GroveError, Result};

const DELIMITER: &str = "---";

/// Split an optional leading `---` block from a Markdown buffer.
///
/// Returns the parsed mapping and the body that follows it. A buffer
/// without delimiters parses as an empty mapping with the whole input as
/// body. Invalid UTF-8 in the body is replaced with U+FFFD.
pub fn parse(input: &[u8]) -> Result<(Mapping, String)> {
    let text = String::from_utf8_lossy(input).into_owned();

    let mut lines = text.split_inclusive('\n');
    let first = match lines.next() {
        Some(line) => line,
        None => return Ok((Mapping::new(), String::new())),
    };

    if first.trim_end() != DELIMITER {
        return Ok((Mapping::new(), text));
    }

    let mut block = String::new();
    let mut closed = false;
    let mut body_offset = first.len();
    for line in lines {
        body_offset += line.len();
        if line.trim_end() == DELIMITER {
            closed = true;
            break;
        }
        block.push_str(line);
    }

    if !closed {
        return Err(GroveError::UnterminatedFrontmatter(Default::default()));
    }

    let mapping = if block.trim().is_empty() {
        Mapping::new()
    } else {
        match serde_yaml::from_str::<Value>(&block)? {
            Value::Mapping(mapping) => mapping,
            other => {
                return Err(GroveError::other(format!(
                    "frontmatter must be a YAML mapping, got {}",
                    yaml_kind(&other)
                )));
            }
        }
    };

    Ok((mapping, text[body_offset..].to_string()))
}

/// Serialize a mapping + body back into delimited form. An empty mapping
/// renders as the bare body with no delimiters.
pub fn render(mapping: &Mapping, body: &str) -> Result<String> {
    if mapping.is_empty() {
        return Ok(body.to_string());
    }
    let block = serde_yaml::to_string(mapping)?;
    Ok(format!("{DELIMITER}\n{block}{DELIMITER}\n{body}"))
}

/// Shallow-merge `updates` into `mapping`.
///
/// A null, empty-string, or zero value removes its key; any other value
/// overwrites. Existing keys keep their position; new keys append. Nested
/// mappings are replaced as wholes.
pub fn merge(mapping: &mut Mapping, updates: Mapping) {
    for (key, value) in updates {
        if removes_key(&value) {
            mapping.remove(&key);
        } else {
            mapping.insert(key, value);
        }
    }
}

/// Rewrite a buffer's frontmatter by merging `updates` into whatever block
/// is present, leaving the body untouched.
pub fn merge_buffer(input: &[u8], updates: Mapping) -> Result<String> {
    let (mut mapping, body) = parse(input)?;
    merge(&mut mapping, updates);
    render(&mapping, &body)
}

/// Substitute the entire frontmatter block verbatim, keeping the body.
/// `block` is raw YAML without delimiters.
pub fn replace_block(input: &[u8], block: &str) -> Result<String> {
    let (_, body) = parse(input)?;
    let block = block.strip_suffix('\n').unwrap_or(block);
    Ok(format!("{DELIMITER}\n{block}\n{DELIMITER}\n{body}"))
}

fn removes_key(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => {
            n.as_u64() == Some(0) || n.as_i64() == Some(0) || n.as_f64() == Some(0.0)
        }
        _ => false,
    }
}

fn yaml_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping_of(pairs: &[(&str, Value)]) -> Mapping {
        let mut mapping = Mapping::new();
        for (key, value) in pairs {
            mapping.insert(Value::String(key.to_string()), value.clone());
        }
        mapping
    }

    #[test]
    fn parse_without_delimiters_returns_whole_body() {
        let (mapping, body) = parse(b"just some markdown\n").unwrap();
        assert!(mapping.is_empty());
        assert_eq!(body, "just some markdown\n");
    }

    #[test]
    fn parse_splits_block_and_body() {
        let input = b"---\nid: a\ntitle: Alpha\n---\nThe body.\n";
        let (mapping, body) = parse(input).unwrap();
        assert_eq!(mapping.len(), 2);
        assert_eq!(
            mapping.get(Value::String("id".into())),
            Some(&Value::String("a".into()))
        );
        assert_eq!(body, "The body.\n");
    }

    #[test]
    fn parse_unterminated_block_errors() {
        let err = parse(b"---\nid: a\nno closing line\n").unwrap_err();
        assert!(matches!(err, GroveError::UnterminatedFrontmatter(_)));
    }

    #[test]
    fn parse_invalid_yaml_errors() {
        let err = parse(b"---\n{ not: [valid\n---\nbody\n").unwrap_err();
        assert!(matches!(err, GroveError::Yaml(_)));
    }

    #[test]
    fn parse_empty_block_is_empty_mapping() {
        let (mapping, body) = parse(b"---\n---\nbody\n").unwrap();
        assert!(mapping.is_empty());
        assert_eq!(body, "body\n");
    }

    #[test]
    fn merge_overwrites_and_removes() {
        let mut base = mapping_of(&[
            ("id", Value::String("a".into())),
            ("status", Value::String("pending".into())),
            ("retry_count", Value::Number(2.into())),
        ]);
        let updates = mapping_of(&[
            ("status", Value::String("running".into())),
            ("retry_count", Value::Number(0.into())),
            ("last_error", Value::Null),
        ]);
        merge(&mut base, updates);

        assert_eq!(
            base.get(Value::String("status".into())),
            Some(&Value::String("running".into()))
        );
        assert!(!base.contains_key(Value::String("retry_count".into())));
        assert!(!base.contains_key(Value::String("last_error".into())));

        // id stays first: existing keys keep their position
        let first_key = base.keys().next().unwrap();
        assert_eq!(first_key, &Value::String("id".into()));
    }

    #[test]
    fn merge_buffer_keeps_body() {
        let input = b"---\nid: a\nstatus: pending\n---\nBody text.\n";
        let updates = mapping_of(&[("status", Value::String("completed".into()))]);
        let rewritten = merge_buffer(input, updates).unwrap();

        let (mapping, body) = parse(rewritten.as_bytes()).unwrap();
        assert_eq!(
            mapping.get(Value::String("status".into())),
            Some(&Value::String("completed".into()))
        );
        assert_eq!(body, "Body text.\n");
    }

    #[test]
    fn replace_block_is_verbatim() {
        let input = b"---\nid: a\n---\nBody.\n";
        let rewritten = replace_block(input, "id: b\ntitle: Beta\n").unwrap();
        assert_eq!(rewritten, "---\nid: b\ntitle: Beta\n---\nBody.\n");
    }

    #[test]
    fn render_roundtrips_through_parse() {
        let mapping = mapping_of(&[
            ("id", Value::String("a".into())),
            ("title", Value::String("Alpha".into())),
        ]);
        let rendered = render(&mapping, "Body.\n").unwrap();
        let (reparsed, body) = parse(rendered.as_bytes()).unwrap();
        assert_eq!(reparsed, mapping);
        assert_eq!(body, "Body.\n");
    }
}
