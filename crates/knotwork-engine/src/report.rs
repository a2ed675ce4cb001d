use chrono::{DateTime, Utc};
use uuid::Uuid;

use knotwork_core::types::{Action, NodeId};

/// Record of one unit's lifecycle inside an orchestration.
#[derive(Debug, Clone)]
pub struct NodeRun {
    pub node: NodeId,
    pub name: String,
    /// Outcome key returned by the unit's finalize phase.
    pub action: Action,
    /// Compute invocations, summed over items for batch units.
    pub attempts: u32,
    /// How many computes (items) were resolved by fallback.
    pub fallbacks: u32,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Why an orchestration stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The last unit has no successors.
    Leaf { node: NodeId, name: String },
    /// The last unit has successors but none for the key it returned.
    RouteNotFound {
        node: NodeId,
        name: String,
        action: Action,
    },
}

impl Termination {
    pub fn node(&self) -> NodeId {
        match self {
            Termination::Leaf { node, .. } | Termination::RouteNotFound { node, .. } => *node,
        }
    }

    pub fn is_route_not_found(&self) -> bool {
        matches!(self, Termination::RouteNotFound { .. })
    }
}

/// One walk of the graph from the start unit to termination.
#[derive(Debug, Clone)]
pub struct Orchestration {
    /// Batch item index, when the flow ran once per item.
    pub item: Option<usize>,
    pub steps: Vec<NodeRun>,
    pub last_action: Action,
    pub termination: Termination,
}

/// Result of a flow run.
#[derive(Debug, Clone)]
pub struct FlowOutcome {
    pub run_id: Uuid,
    /// The flow's own finalize result.
    pub action: Action,
    /// One orchestration, or one per batch item in input order.
    pub runs: Vec<Orchestration>,
    pub elapsed_ms: u64,
}

impl FlowOutcome {
    /// All node-runs in execution order (item order for parallel batches).
    pub fn steps(&self) -> impl Iterator<Item = &NodeRun> {
        self.runs.iter().flat_map(|r| r.steps.iter())
    }

    pub fn step_count(&self) -> usize {
        self.runs.iter().map(|r| r.steps.len()).sum()
    }

    /// Names of executed units, in order.
    pub fn trace(&self) -> Vec<&str> {
        self.steps().map(|s| s.name.as_str()).collect()
    }

    /// Termination of the last orchestration.
    pub fn termination(&self) -> Option<&Termination> {
        self.runs.last().map(|r| &r.termination)
    }
}
