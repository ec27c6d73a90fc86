use std::str::FromStr;

use chrono::Utc;
use cron::Schedule;
use futures::future::BoxFuture;
use serde_json::{json, Value};

use weft_core::error::Result;
use weft_core::traits::NodeExecutor;
use weft_core::types::{NodeContext, NodeInput, NodeOutput};

/// Exposes the tick that fired the run. Timers live in the host, which passes
/// the tick in as `__cron_*` run variables.
pub struct CronExecutor;

/// Parse a cron expression, accepting the common five-field form.
pub fn parse_schedule(expr: &str) -> std::result::Result<Schedule, cron::error::Error> {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        Schedule::from_str(&format!("0 {expr}"))
    } else {
        Schedule::from_str(expr)
    }
}

impl NodeExecutor for CronExecutor {
    fn node_type(&self) -> &str {
        "cron"
    }

    fn execute(&self, _input: NodeInput, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let var = |key: &str| ctx.variables.get(key).cloned();
            let schedule = ctx
                .config_str("schedule")
                .map(str::to_string)
                .or_else(|| var("__cron_schedule").and_then(|v| v.as_str().map(str::to_string)));

            let next_fire = match schedule.as_deref() {
                Some(expr) => {
                    let parsed = parse_schedule(expr)
                        .map_err(|e| ctx.fail(format!("invalid cron schedule '{expr}': {e}")))?;
                    parsed
                        .upcoming(Utc)
                        .next()
                        .map(|t| Value::String(t.to_rfc3339()))
                        .unwrap_or(Value::Null)
                }
                None => Value::Null,
            };

            Ok(NodeOutput::value(json!({
                "timestamp": var("__cron_timestamp").unwrap_or_else(|| json!(Utc::now().to_rfc3339())),
                "iteration": var("__cron_iteration").unwrap_or(json!(0)),
                "schedule": schedule,
                "input": var("__cron_input").unwrap_or(Value::Null),
                "nextFire": next_fire,
            })))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::testing::ctx;

    #[test]
    fn five_field_expressions_accepted() {
        assert!(parse_schedule("*/5 * * * *").is_ok());
        assert!(parse_schedule("0 0 9 * * *").is_ok());
        assert!(parse_schedule("not a schedule").is_err());
    }

    #[tokio::test]
    async fn tick_variables_and_next_fire() {
        let c = ctx(
            json!({"schedule": "0 * * * *"}),
            &[("__cron_iteration", json!(4)), ("__cron_input", json!("payload"))],
        );
        let out = CronExecutor.execute(NodeInput::new(), c).await.unwrap();
        assert_eq!(out.value["iteration"], json!(4));
        assert_eq!(out.value["input"], json!("payload"));
        assert!(out.value["nextFire"].is_string());
    }

    #[tokio::test]
    async fn invalid_schedule_is_node_error() {
        let c = ctx(json!({"schedule": "bogus"}), &[]);
        assert!(CronExecutor.execute(NodeInput::new(), c).await.is_err());
    }
}
