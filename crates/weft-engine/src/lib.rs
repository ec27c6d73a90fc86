pub mod approval;
mod construct;
mod context;
pub mod engine;
pub mod graph;
pub mod live;
pub mod plan;
mod resolve;
mod scheduler;
pub mod subworkflow;
pub mod validate;

pub use approval::ApprovalBroker;
pub use engine::{Engine, EngineBuilder, RunHandle};
pub use graph::{Edge, Graph, Node, NodeKind, Variable};
pub use live::{LiveHandle, LiveMode, LiveOptions, LiveSummary};
pub use plan::{ConstructSummary, ExecutionPlan, PlanSummary};
pub use subworkflow::{DirGraphSource, GraphSource, MemoryGraphSource};
pub use validate::{ConstructKind, ValidationReport};
