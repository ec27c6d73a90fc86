use std::collections::HashMap;
use std::sync::Arc;

use weft_core::error::{Result, WeftError};
use weft_core::traits::NodeExecutor;

use crate::builtin;

/// Registry of node executors keyed by node type id.
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor under its own type id, replacing any previous one.
    pub fn register(&mut self, executor: impl NodeExecutor) {
        let node_type = executor.node_type().to_string();
        self.executors.insert(node_type, Arc::new(executor));
    }

    /// Register an already shared executor.
    pub fn register_arc(&mut self, executor: Arc<dyn NodeExecutor>) {
        let node_type = executor.node_type().to_string();
        self.executors.insert(node_type, executor);
    }

    /// Unregister an executor by type id.
    pub fn unregister(&mut self, node_type: &str) -> bool {
        self.executors.remove(node_type).is_some()
    }

    /// Get an executor by type id.
    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(node_type).cloned()
    }

    /// Like [`get`](Self::get) but reports a missing type as an error.
    pub fn resolve(&self, node_type: &str) -> Result<Arc<dyn NodeExecutor>> {
        self.get(node_type)
            .ok_or_else(|| WeftError::UnknownNodeType(node_type.to_string()))
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.executors.contains_key(node_type)
    }

    /// Registered type ids, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.executors.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    /// Create a registry with all built-in executors registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        // ── Entry points ────────────────────────────────────────
        registry.register(builtin::input::InputExecutor);
        registry.register(builtin::webhook::WebhookExecutor);
        registry.register(builtin::cron::CronExecutor);

        // ── Model and tool calls ────────────────────────────────
        registry.register(builtin::llm::LlmExecutor);
        registry.register(builtin::tool::ToolExecutor);
        registry.register(builtin::subworkflow::SubworkflowExecutor);

        // ── Control flow ────────────────────────────────────────
        registry.register(builtin::router::RouterExecutor);
        registry.register(builtin::approval::ApprovalExecutor);
        registry.register(builtin::iterator::IteratorExecutor);
        registry.register(builtin::aggregator::AggregatorExecutor);
        registry.register(builtin::loop_node::LoopExecutor);
        registry.register(builtin::loop_node::ExitExecutor);

        // ── Data ────────────────────────────────────────────────
        registry.register(builtin::transform::TransformExecutor);
        registry.register(builtin::validator::ValidatorExecutor);
        registry.register(builtin::output::OutputExecutor);

        // ── I/O ─────────────────────────────────────────────────
        registry.register(builtin::http_request::HttpRequestExecutor::new());
        registry.register(builtin::file_io::FileReadExecutor);
        registry.register(builtin::file_io::FileWriteExecutor);
        registry.register(builtin::shell_exec::ShellExecExecutor);

        registry
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_cover_every_node_type() {
        let registry = ExecutorRegistry::with_builtins();
        for t in [
            "input",
            "output",
            "llm",
            "tool",
            "router",
            "approval",
            "transform",
            "iterator",
            "aggregator",
            "subworkflow",
            "http_request",
            "file_read",
            "file_write",
            "shell_exec",
            "validator",
            "webhook",
            "cron",
            "loop",
            "exit",
        ] {
            assert!(registry.contains(t), "missing executor for {t}");
        }
        assert_eq!(registry.list().len(), 19);
    }

    #[test]
    fn unknown_type_is_an_error() {
        let registry = ExecutorRegistry::with_builtins();
        assert!(matches!(
            registry.resolve("teleport"),
            Err(WeftError::UnknownNodeType(t)) if t == "teleport"
        ));
    }

    #[test]
    fn unregister_removes_executor() {
        let mut registry = ExecutorRegistry::with_builtins();
        assert!(registry.unregister("shell_exec"));
        assert!(!registry.contains("shell_exec"));
        assert!(!registry.unregister("shell_exec"));
    }
}
