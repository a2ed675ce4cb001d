//! Graph workflow engine.
//!
//! Units of work go through prepare, compute (with retry and fallback) and
//! finalize. A [`Flow`] walks a [`Graph`] of units, routing on the outcome key
//! each finalize phase returns, until no successor matches. Units and flows can
//! run once, per item sequentially, or per item concurrently, and may suspend
//! when run through [`Flow::run_async`].

mod batch;
pub mod definition;
pub mod flow;
pub mod graph;
pub mod node;
pub mod report;
pub mod retry;
mod suspend;

pub use definition::{DefinitionReport, EdgeDefinition, GraphDefinition, NodeDefinition, NodeRegistry};
pub use flow::{AsyncFlowHooks, Flow, FlowHooks};
pub use graph::{ActionBinder, Graph, GraphBuilder, NodeDef};
pub use node::{AsyncNode, FnNode, Node};
pub use report::{FlowOutcome, NodeRun, Orchestration, Termination};
pub use retry::RetryPolicy;
