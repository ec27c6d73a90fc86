use futures::future::BoxFuture;
use serde_json::Value;

use weft_core::error::Result;
use weft_core::traits::NodeExecutor;
use weft_core::types::{NodeContext, NodeInput, NodeOutput};

use crate::path;

/// Produces the item list for an iteration region. The engine runs the region
/// once per item; this executor only decides what the items are.
pub struct IteratorExecutor;

/// Pull the collection out of `incoming`: its `items` field or the whole value,
/// optionally narrowed by `path`. Scalars become a one-item list.
pub fn extract_items(incoming: &Value, item_path: Option<&str>) -> std::result::Result<Vec<Value>, String> {
    let base = match incoming {
        Value::Object(map) if map.contains_key("items") => &map["items"],
        other => other,
    };
    let target = match item_path.filter(|p| !p.trim().is_empty()) {
        Some(p) => path::extract(base, p)
            .or_else(|| path::extract(incoming, p))
            .ok_or_else(|| format!("path '{p}' not found in iterator input"))?,
        None => base,
    };

    Ok(match target {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => items,
            _ => vec![target.clone()],
        },
        other => vec![other.clone()],
    })
}

impl NodeExecutor for IteratorExecutor {
    fn node_type(&self) -> &str {
        "iterator"
    }

    fn execute(&self, input: NodeInput, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let incoming = input.value().unwrap_or(Value::Null);
            let item_path = ctx.config_str("path").or_else(|| ctx.config_str("expression"));
            let items = extract_items(&incoming, item_path).map_err(|msg| ctx.fail(msg))?;
            Ok(NodeOutput::value(Value::Array(items)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn items_field_or_whole_value() {
        assert_eq!(
            extract_items(&json!({"items": [1, 2]}), None).unwrap(),
            vec![json!(1), json!(2)]
        );
        assert_eq!(extract_items(&json!(["a"]), None).unwrap(), vec![json!("a")]);
    }

    #[test]
    fn path_narrows_collection() {
        let v = json!({"data": {"list": [{"n": 1}, {"n": 2}]}});
        assert_eq!(extract_items(&v, Some("$.data.list")).unwrap().len(), 2);
        assert!(extract_items(&v, Some("$.missing")).is_err());
    }

    #[test]
    fn scalars_and_json_strings() {
        assert_eq!(extract_items(&json!(5), None).unwrap(), vec![json!(5)]);
        assert_eq!(
            extract_items(&json!("[1,2,3]"), None).unwrap(),
            vec![json!(1), json!(2), json!(3)]
        );
        assert!(extract_items(&Value::Null, None).unwrap().is_empty());
    }
}
