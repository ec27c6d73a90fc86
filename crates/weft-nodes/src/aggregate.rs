use serde_json::{Map, Value};

use crate::template::value_to_text;

/// How an aggregator combines the values it collects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    /// Join the text of each value with a separator.
    Concat,
    /// Ordered array of the raw values.
    #[default]
    Collect,
    /// Shallow merge of object values; later keys win.
    Merge,
}

impl Strategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "concat" | "join" => Some(Self::Concat),
            "collect" | "array" | "list" => Some(Self::Collect),
            "merge" => Some(Self::Merge),
            _ => None,
        }
    }

    /// Read `strategy` from a node config, defaulting to `collect`.
    pub fn from_config(config: &Value) -> Self {
        config
            .get("strategy")
            .and_then(|v| v.as_str())
            .and_then(Self::parse)
            .unwrap_or_default()
    }
}

/// Separator for `concat`, from a node config (default newline).
pub fn separator(config: &Value) -> String {
    config
        .get("separator")
        .and_then(|v| v.as_str())
        .unwrap_or("\n")
        .to_string()
}

/// Combine `values` in order.
pub fn combine(strategy: Strategy, separator: &str, values: &[Value]) -> Value {
    match strategy {
        Strategy::Concat => Value::String(
            values
                .iter()
                .map(value_to_text)
                .collect::<Vec<_>>()
                .join(separator),
        ),
        Strategy::Collect => Value::Array(values.to_vec()),
        Strategy::Merge => {
            let mut merged = Map::new();
            for value in values {
                if let Value::Object(map) = value {
                    for (k, v) in map {
                        merged.insert(k.clone(), v.clone());
                    }
                }
            }
            Value::Object(merged)
        }
    }
}

/// Combine using the strategy and separator found in `config`.
pub fn combine_with_config(config: &Value, values: &[Value]) -> Value {
    combine(Strategy::from_config(config), &separator(config), values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn concat_joins_text_in_order() {
        let values = vec![json!("a"), json!(2), json!("c")];
        assert_eq!(combine(Strategy::Concat, ",", &values), json!("a,2,c"));
    }

    #[test]
    fn collect_keeps_raw_values() {
        let values = vec![json!({"x": 1}), json!("b")];
        assert_eq!(
            combine(Strategy::Collect, "", &values),
            json!([{"x": 1}, "b"])
        );
    }

    #[test]
    fn merge_later_keys_win() {
        let values = vec![json!({"a": 1, "b": 1}), json!("skip"), json!({"b": 2})];
        assert_eq!(
            combine(Strategy::Merge, "", &values),
            json!({"a": 1, "b": 2})
        );
    }

    #[test]
    fn config_defaults() {
        assert_eq!(Strategy::from_config(&json!({})), Strategy::Collect);
        assert_eq!(Strategy::from_config(&json!({"strategy": "array"})), Strategy::Collect);
        assert_eq!(separator(&json!({})), "\n");
        assert_eq!(
            combine_with_config(&json!({"strategy": "concat", "separator": "-"}), &[json!("x"), json!("y")]),
            json!("x-y")
        );
    }

    #[test]
    fn empty_input_yields_empty_value() {
        assert_eq!(combine(Strategy::Concat, ",", &[]), json!(""));
        assert_eq!(combine(Strategy::Collect, ",", &[]), json!([]));
        assert_eq!(combine(Strategy::Merge, ",", &[]), json!({}));
    }
}
