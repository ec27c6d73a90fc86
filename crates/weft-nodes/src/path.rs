//! Structured-path extraction over JSON values.
//!
//! Paths look like `$.data.items[0].name`; the `$` root and leading dot are
//! optional, and a bare numeric segment (`items.0`) also indexes arrays.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
}

fn parse(path: &str) -> Option<Vec<Segment>> {
    let trimmed = path.trim();
    let trimmed = trimmed.strip_prefix('$').unwrap_or(trimmed);
    let trimmed = trimmed.strip_prefix('.').unwrap_or(trimmed);

    let mut segments = Vec::new();
    if trimmed.is_empty() {
        return Some(segments);
    }

    for part in trimmed.split('.') {
        let (name, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !name.is_empty() {
            match name.parse::<usize>() {
                Ok(idx) => segments.push(Segment::Index(idx)),
                Err(_) => segments.push(Segment::Field(name.to_string())),
            }
        }
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped.find(']')?;
            let inner = stripped[..close].trim().trim_matches(|c| c == '"' || c == '\'');
            match inner.parse::<usize>() {
                Ok(idx) => segments.push(Segment::Index(idx)),
                Err(_) => segments.push(Segment::Field(inner.to_string())),
            }
            rest = &stripped[close + 1..];
        }
        if !rest.is_empty() {
            return None;
        }
    }
    Some(segments)
}

/// Follow `path` into `value`. Returns `None` when any step is missing.
pub fn extract<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in parse(path)? {
        current = match (&segment, current) {
            (Segment::Field(name), Value::Object(map)) => map.get(name)?,
            (Segment::Index(idx), Value::Array(items)) => items.get(*idx)?,
            (Segment::Index(idx), Value::Object(map)) => map.get(&idx.to_string())?,
            _ => return None,
        };
    }
    Some(current)
}

/// Whether `path` is syntactically valid.
pub fn is_valid(path: &str) -> bool {
    parse(path).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_fields() {
        let v = json!({"a": {"b": {"c": 3}}});
        assert_eq!(extract(&v, "$.a.b.c"), Some(&json!(3)));
        assert_eq!(extract(&v, "a.b"), Some(&json!({"c": 3})));
    }

    #[test]
    fn bracket_and_numeric_indexing() {
        let v = json!({"items": [{"name": "x"}, {"name": "y"}]});
        assert_eq!(extract(&v, "$.items[1].name"), Some(&json!("y")));
        assert_eq!(extract(&v, "items.0.name"), Some(&json!("x")));
    }

    #[test]
    fn root_path_returns_whole_value() {
        let v = json!([1, 2]);
        assert_eq!(extract(&v, "$"), Some(&v));
    }

    #[test]
    fn missing_steps_are_none() {
        let v = json!({"a": [1]});
        assert_eq!(extract(&v, "a[3]"), None);
        assert_eq!(extract(&v, "b.c"), None);
        assert_eq!(extract(&v, "a.x"), None);
    }

    #[test]
    fn malformed_brackets_rejected() {
        assert!(!is_valid("a[0"));
        assert!(!is_valid("a[0]x"));
        assert!(is_valid("a['key']"));
    }
}
