//! `{{placeholder}}` substitution shared by transform, llm, http and shell nodes.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use weft_core::types::NodeContext;

use crate::path;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("static regex"))
}

/// Values a template may refer to.
pub struct TemplateScope<'a> {
    /// The node's own combined input (`{{input}}`).
    pub input: Option<&'a Value>,
    /// Completed node outputs (`{{node_id}}`, `{{node_id.field}}`).
    pub outputs: &'a HashMap<String, Value>,
    /// Run variables (`{{inputs.name}}`, `{{name}}`).
    pub variables: &'a HashMap<String, Value>,
}

impl<'a> TemplateScope<'a> {
    pub fn new(ctx: &'a NodeContext, input: Option<&'a Value>) -> Self {
        Self {
            input,
            outputs: &ctx.outputs,
            variables: &ctx.variables,
        }
    }

    fn lookup(&self, key: &str) -> Option<Value> {
        let (head, rest) = match key.split_once('.') {
            Some((h, r)) => (h, Some(r)),
            None => (key, None),
        };

        match (head, rest) {
            ("input", None) => self
                .input
                .cloned()
                .or_else(|| self.variables.get("input").cloned()),
            ("input", Some(rest)) => self
                .input
                .and_then(|v| path::extract(v, rest).cloned())
                .or_else(|| self.variables.get(rest).cloned()),
            ("inputs" | "vars", Some(rest)) => self.variables.get(rest).cloned(),
            (head, None) => self
                .outputs
                .get(head)
                .or_else(|| self.variables.get(head))
                .cloned(),
            (head, Some(rest)) => match self.outputs.get(head) {
                Some(output) => path::extract(output, rest).cloned(),
                None => self
                    .variables
                    .get(head)
                    .and_then(|v| path::extract(v, rest).cloned()),
            },
        }
    }
}

/// Whether `s` contains at least one placeholder.
pub fn has_placeholders(s: &str) -> bool {
    placeholder_re().is_match(s)
}

/// Substitute every resolvable placeholder; unresolved ones are kept verbatim.
pub fn render(template: &str, scope: &TemplateScope<'_>) -> String {
    placeholder_re()
        .replace_all(template, |caps: &Captures<'_>| match scope.lookup(&caps[1]) {
            Some(value) => value_to_text(&value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Render against a node context and its combined input.
pub fn render_in(template: &str, ctx: &NodeContext, input: Option<&Value>) -> String {
    render(template, &TemplateScope::new(ctx, input))
}

/// Strings verbatim, everything else as compact JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Best human-readable text of a node output.
pub fn primary_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => ["response", "content", "result", "text", "output"]
            .iter()
            .find_map(|k| map.get(*k).and_then(|v| v.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => value_to_text(other),
    }
}

/// Cut `s` to at most `max` characters, marking the cut.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope_parts() -> (HashMap<String, Value>, HashMap<String, Value>) {
        let mut outputs = HashMap::new();
        outputs.insert("llm1".to_string(), json!({"response": "hi", "n": [1, 2]}));
        outputs.insert("plain".to_string(), json!("text"));
        let mut vars = HashMap::new();
        vars.insert("topic".to_string(), json!("rust"));
        (outputs, vars)
    }

    #[test]
    fn renders_input_outputs_and_variables() {
        let (outputs, variables) = scope_parts();
        let input = json!({"name": "ann"});
        let scope = TemplateScope {
            input: Some(&input),
            outputs: &outputs,
            variables: &variables,
        };
        assert_eq!(
            render(
                "{{input.name}} {{llm1.response}} {{plain}} {{inputs.topic}} {{topic}} {{llm1.n[1]}}",
                &scope
            ),
            "ann hi text rust rust 2"
        );
    }

    #[test]
    fn unresolved_placeholders_survive() {
        let (outputs, variables) = scope_parts();
        let scope = TemplateScope {
            input: None,
            outputs: &outputs,
            variables: &variables,
        };
        assert_eq!(render("a {{ nope }} b", &scope), "a {{ nope }} b");
    }

    #[test]
    fn whole_input_object_renders_as_json() {
        let outputs = HashMap::new();
        let variables = HashMap::new();
        let input = json!({"k": 1});
        let scope = TemplateScope {
            input: Some(&input),
            outputs: &outputs,
            variables: &variables,
        };
        assert_eq!(render("{{input}}", &scope), r#"{"k":1}"#);
    }

    #[test]
    fn primary_text_prefers_response_fields() {
        assert_eq!(primary_text(&json!({"content": "c", "x": 1})), "c");
        assert_eq!(primary_text(&json!("s")), "s");
        assert_eq!(primary_text(&json!(3)), "3");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("ok", 5), "ok");
    }
}
