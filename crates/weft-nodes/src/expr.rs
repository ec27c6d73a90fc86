//! Tiny pipeline language used by the transform node's `expression` mode.
//!
//! An expression is a chain of stages separated by `|`, applied left to
//! right to the node input:
//!
//! ```text
//! get(items) | filter(status == "open") | map(title) | join(", ") | upper
//! ```

use serde_json::{Map, Value};

use crate::path;
use crate::template::value_to_text;

/// Evaluate `expression` against `input`.
pub fn evaluate(expression: &str, input: Value) -> Result<Value, String> {
    let mut value = input;
    for stage in split_top_level(expression, '|') {
        let stage = stage.trim();
        if stage.is_empty() || stage == "." {
            continue;
        }
        value = apply(stage, value)?;
    }
    Ok(value)
}

fn apply(stage: &str, value: Value) -> Result<Value, String> {
    let (name, arg) = match stage.find('(') {
        Some(open) => {
            let close = stage
                .rfind(')')
                .filter(|c| *c > open)
                .ok_or_else(|| format!("unclosed '(' in stage '{stage}'"))?;
            (stage[..open].trim(), Some(stage[open + 1..close].trim()))
        }
        None => (stage, None),
    };

    match (name, arg) {
        ("upper", None) => Ok(Value::String(value_to_text(&value).to_uppercase())),
        ("lower", None) => Ok(Value::String(value_to_text(&value).to_lowercase())),
        ("trim", None) => Ok(Value::String(value_to_text(&value).trim().to_string())),
        ("length", None) => Ok(Value::from(match &value {
            Value::Array(a) => a.len(),
            Value::Object(m) => m.len(),
            Value::String(s) => s.chars().count(),
            Value::Null => 0,
            other => other.to_string().len(),
        })),
        ("keys", None) => match value {
            Value::Object(m) => Ok(Value::Array(m.keys().cloned().map(Value::String).collect())),
            _ => Err("keys expects an object".into()),
        },
        ("values", None) => match value {
            Value::Object(m) => Ok(Value::Array(m.into_iter().map(|(_, v)| v).collect())),
            _ => Err("values expects an object".into()),
        },
        ("first", None) => Ok(as_array(value, "first")?.into_iter().next().unwrap_or(Value::Null)),
        ("last", None) => Ok(as_array(value, "last")?.pop().unwrap_or(Value::Null)),
        ("reverse", None) => match value {
            Value::String(s) => Ok(Value::String(s.chars().rev().collect())),
            other => {
                let mut items = as_array(other, "reverse")?;
                items.reverse();
                Ok(Value::Array(items))
            }
        },
        ("sort", None) => {
            let mut items = as_array(value, "sort")?;
            items.sort_by(compare_values);
            Ok(Value::Array(items))
        }
        ("unique", None) => {
            let mut seen: Vec<Value> = Vec::new();
            for item in as_array(value, "unique")? {
                if !seen.contains(&item) {
                    seen.push(item);
                }
            }
            Ok(Value::Array(seen))
        }
        ("json", None) => Ok(Value::String(value.to_string())),
        ("parse_json", None) => match value {
            Value::String(s) => serde_json::from_str(&s).map_err(|e| format!("parse_json: {e}")),
            other => Ok(other),
        },
        ("split", Some(arg)) => {
            let sep = literal_text(arg);
            Ok(Value::Array(
                value_to_text(&value)
                    .split(sep.as_str())
                    .map(|s| Value::String(s.to_string()))
                    .collect(),
            ))
        }
        ("join", Some(arg)) => {
            let sep = literal_text(arg);
            let parts: Vec<String> = as_array(value, "join")?.iter().map(value_to_text).collect();
            Ok(Value::String(parts.join(&sep)))
        }
        ("get", Some(arg)) => Ok(path::extract(&value, arg).cloned().unwrap_or(Value::Null)),
        ("map", Some(arg)) => Ok(Value::Array(
            as_array(value, "map")?
                .iter()
                .map(|item| path::extract(item, arg).cloned().unwrap_or(Value::Null))
                .collect(),
        )),
        ("default", Some(arg)) => Ok(if value.is_null() {
            literal(arg)
        } else {
            value
        }),
        ("filter", Some(arg)) => {
            let condition = Condition::parse(arg)?;
            Ok(Value::Array(
                as_array(value, "filter")?
                    .into_iter()
                    .filter(|item| condition.matches(item))
                    .collect(),
            ))
        }
        ("pick", Some(arg)) => {
            let mut out = Map::new();
            for key in arg.split(',').map(str::trim).filter(|k| !k.is_empty()) {
                if let Some(v) = path::extract(&value, key) {
                    out.insert(key.to_string(), v.clone());
                }
            }
            Ok(Value::Object(out))
        }
        (name, _) => Err(format!("unknown expression stage '{name}'")),
    }
}

fn as_array(value: Value, stage: &str) -> Result<Vec<Value>, String> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        _ => Err(format!("{stage} expects an array")),
    }
}

fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => value_to_text(a).cmp(&value_to_text(b)),
    }
}

/// Parse an argument literal: quoted string, number, bool, null, else raw text.
fn literal(raw: &str) -> Value {
    let raw = raw.trim();
    if let Some(inner) = unquote(raw) {
        return Value::String(inner.to_string());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn literal_text(raw: &str) -> String {
    value_to_text(&literal(raw))
}

fn unquote(raw: &str) -> Option<&str> {
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' || first == b'\'') && first == last {
            return Some(&raw[1..raw.len() - 1]);
        }
    }
    None
}

/// Split on `sep` outside quotes and parentheses.
fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth -= 1,
            (None, c) if c == sep && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,
    NotEq,
    Contains,
    Gt,
    Lt,
    Gte,
    Lte,
}

/// `field op value` comparison used by `filter(...)`.
#[derive(Debug, Clone)]
struct Condition {
    field: String,
    op: Operator,
    expected: Value,
}

impl Condition {
    fn parse(raw: &str) -> Result<Self, String> {
        let (field, op, rest) =
            parse_operator(raw).ok_or_else(|| format!("unparseable condition '{raw}'"))?;
        Ok(Self {
            field: field.trim().to_string(),
            op,
            expected: literal(rest),
        })
    }

    fn matches(&self, item: &Value) -> bool {
        let actual = match self.field.as_str() {
            "." | "item" => Some(item),
            field => path::extract(item, field),
        };
        let Some(actual) = actual else {
            return self.op == Operator::NotEq;
        };
        match self.op {
            Operator::Eq => loosely_equal(actual, &self.expected),
            Operator::NotEq => !loosely_equal(actual, &self.expected),
            Operator::Contains => match actual {
                Value::Array(items) => items.iter().any(|v| loosely_equal(v, &self.expected)),
                other => value_to_text(other).contains(&value_to_text(&self.expected)),
            },
            Operator::Gt | Operator::Lt | Operator::Gte | Operator::Lte => {
                let ord = compare_values(actual, &self.expected);
                match self.op {
                    Operator::Gt => ord.is_gt(),
                    Operator::Lt => ord.is_lt(),
                    Operator::Gte => ord.is_ge(),
                    _ => ord.is_le(),
                }
            }
        }
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    a == b || value_to_text(a) == value_to_text(b)
}

fn parse_operator(raw: &str) -> Option<(&str, Operator, &str)> {
    // Longer operators first so ">=" is not read as ">"
    for (token, op) in [
        (" contains ", Operator::Contains),
        ("==", Operator::Eq),
        ("!=", Operator::NotEq),
        (">=", Operator::Gte),
        ("<=", Operator::Lte),
        (">", Operator::Gt),
        ("<", Operator::Lt),
    ] {
        if let Some(pos) = raw.find(token) {
            return Some((&raw[..pos], op, &raw[pos + token.len()..]));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_stages_chain() {
        assert_eq!(evaluate("trim | upper", json!("  hi ")).unwrap(), json!("HI"));
        assert_eq!(evaluate("split(\",\") | length", json!("a,b,c")).unwrap(), json!(3));
    }

    #[test]
    fn filter_map_join() {
        let input = json!({"items": [
            {"title": "a", "status": "open", "n": 3},
            {"title": "b", "status": "closed", "n": 1},
            {"title": "c", "status": "open", "n": 7}
        ]});
        assert_eq!(
            evaluate("get(items) | filter(status == \"open\") | map(title) | join(\", \")", input.clone())
                .unwrap(),
            json!("a, c")
        );
        assert_eq!(
            evaluate("get(items) | filter(n > 2) | length", input).unwrap(),
            json!(2)
        );
    }

    #[test]
    fn separator_containing_pipe_is_not_split() {
        assert_eq!(
            evaluate("join(\"|\")", json!(["x", "y"])).unwrap(),
            json!("x|y")
        );
    }

    #[test]
    fn default_replaces_null_only() {
        assert_eq!(evaluate("get(x) | default(5)", json!({})).unwrap(), json!(5));
        assert_eq!(evaluate("get(x) | default(5)", json!({"x": 1})).unwrap(), json!(1));
    }

    #[test]
    fn sort_unique_and_contains() {
        assert_eq!(evaluate("sort", json!([3, 1, 2])).unwrap(), json!([1, 2, 3]));
        assert_eq!(evaluate("unique", json!([1, 1, 2])).unwrap(), json!([1, 2]));
        assert_eq!(
            evaluate("filter(tags contains \"x\") | length", json!([{"tags": ["x"]}, {"tags": []}]))
                .unwrap(),
            json!(1)
        );
    }

    #[test]
    fn unknown_stage_is_error() {
        assert!(evaluate("explode", json!(1)).is_err());
        assert!(evaluate("keys", json!([1])).is_err());
    }
}
