//! Graph arena and successor tables.
//!
//! Units live in an immutable arena addressed by [`NodeId`]. Each unit owns a
//! successor table mapping outcome keys to other ids in the same arena; edges are
//! references, never ownership. Per-run state lives in the orchestrator, so one
//! `Arc<Graph>` can back any number of concurrent runs.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use knotwork_core::context::Params;
use knotwork_core::error::{FlowError, Result};
use knotwork_core::types::{Action, BatchMode, NodeId};

use crate::flow::Flow;
use crate::node::{AsyncNode, Node};
use crate::retry::RetryPolicy;

/// The behaviour behind one arena slot.
pub(crate) enum Unit {
    Blocking(Arc<dyn Node>),
    Suspending(Arc<dyn AsyncNode>),
    Flow(Flow),
}

impl Unit {
    fn kind(&self) -> &'static str {
        match self {
            Unit::Blocking(_) => "blocking",
            Unit::Suspending(_) => "suspending",
            Unit::Flow(_) => "flow",
        }
    }

    fn is_blocking(&self) -> bool {
        match self {
            Unit::Blocking(_) => true,
            Unit::Suspending(_) => false,
            Unit::Flow(flow) => flow.is_blocking(),
        }
    }
}

/// Declaration of a unit before it is added to a graph.
pub struct NodeDef {
    name: String,
    unit: Unit,
    params: Params,
    retry: Option<RetryPolicy>,
    batch: BatchMode,
}

impl NodeDef {
    fn with_unit(name: impl Into<String>, unit: Unit) -> Self {
        Self {
            name: name.into(),
            unit,
            params: Params::new(),
            retry: None,
            batch: BatchMode::Single,
        }
    }

    /// A unit with blocking phases.
    pub fn blocking(name: impl Into<String>, node: impl Node) -> Self {
        Self::with_unit(name, Unit::Blocking(Arc::new(node)))
    }

    pub fn blocking_shared(name: impl Into<String>, node: Arc<dyn Node>) -> Self {
        Self::with_unit(name, Unit::Blocking(node))
    }

    /// A unit whose phases may suspend.
    pub fn suspending(name: impl Into<String>, node: impl AsyncNode) -> Self {
        Self::with_unit(name, Unit::Suspending(Arc::new(node)))
    }

    pub fn suspending_shared(name: impl Into<String>, node: Arc<dyn AsyncNode>) -> Self {
        Self::with_unit(name, Unit::Suspending(node))
    }

    /// A nested flow. Its orchestration stands in for the compute phase.
    pub fn flow(name: impl Into<String>, flow: Flow) -> Self {
        Self::with_unit(name, Unit::Flow(flow))
    }

    /// Set the retry policy (otherwise the builder's default applies).
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Set the unit's own params. These win over flow and batch-item params.
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Apply compute once per prepared item. For a nested flow this batches the
    /// whole flow over the item overrides its prepare hook returns.
    pub fn batched(mut self, mode: BatchMode) -> Self {
        match &mut self.unit {
            Unit::Flow(flow) => flow.batch = mode,
            _ => self.batch = mode,
        }
        self
    }
}

/// One arena slot: a unit plus its configuration and successor table.
pub(crate) struct UnitDef {
    pub name: String,
    pub unit: Unit,
    pub params: Params,
    pub retry: RetryPolicy,
    pub batch: BatchMode,
    pub successors: HashMap<Action, NodeId>,
}

/// Where the orchestrator goes after a unit returns `action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Next(NodeId),
    /// Empty successor table: the unit is a terminal point.
    Leaf,
    /// Non-empty table with no entry for the key: benign termination.
    Gap,
}

impl UnitDef {
    pub(crate) fn route(&self, action: &Action) -> Route {
        match self.successors.get(action) {
            Some(next) => Route::Next(*next),
            None if self.successors.is_empty() => Route::Leaf,
            None => Route::Gap,
        }
    }
}

/// Immutable graph of units.
pub struct Graph {
    units: Vec<UnitDef>,
}

impl Graph {
    pub(crate) fn unit(&self, id: NodeId) -> Result<&UnitDef> {
        self.units
            .get(id.index())
            .ok_or_else(|| FlowError::UnknownNode(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.units.len()).map(NodeId)
    }

    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.units.get(id.index()).map(|u| u.name.as_str())
    }

    /// First unit registered under `name`.
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.units.iter().position(|u| u.name == name).map(NodeId)
    }

    pub fn successor(&self, id: NodeId, action: &str) -> Option<NodeId> {
        self.units
            .get(id.index())
            .and_then(|u| u.successors.get(&Action::from(action)).copied())
    }

    /// Successor table of `id`, sorted by outcome key.
    pub fn successors(&self, id: NodeId) -> Vec<(Action, NodeId)> {
        let mut edges: Vec<(Action, NodeId)> = self
            .units
            .get(id.index())
            .map(|u| u.successors.iter().map(|(a, n)| (a.clone(), *n)).collect())
            .unwrap_or_default();
        edges.sort();
        edges
    }

    pub fn retry_policy(&self, id: NodeId) -> Option<RetryPolicy> {
        self.units.get(id.index()).map(|u| u.retry)
    }

    /// Whether every unit, including those of nested flows, can run without suspending.
    pub fn is_blocking(&self) -> bool {
        self.units.iter().all(|u| u.unit.is_blocking())
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_list();
        for (i, u) in self.units.iter().enumerate() {
            list.entry(&format_args!(
                "{} {} ({}, {:?}) -> {:?}",
                NodeId(i),
                u.name,
                u.unit.kind(),
                u.batch,
                self.successors(NodeId(i))
            ));
        }
        list.finish()
    }
}

/// Builds a [`Graph`]. Edges are registered between ids the builder handed out.
pub struct GraphBuilder {
    units: Vec<UnitDef>,
    default_retry: RetryPolicy,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            units: Vec::new(),
            default_retry: RetryPolicy::once(),
        }
    }

    /// Retry policy for units added after this call that do not set their own.
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Add a unit to the arena.
    pub fn add(&mut self, def: NodeDef) -> NodeId {
        let id = NodeId(self.units.len());
        self.units.push(UnitDef {
            name: def.name,
            unit: def.unit,
            params: def.params,
            retry: def.retry.unwrap_or(self.default_retry),
            batch: def.batch,
            successors: HashMap::new(),
        });
        id
    }

    /// Register `to` as the successor of `from` under `action`. Returns `to` so
    /// chains read left to right.
    ///
    /// Re-registering an action already present on `from` is rejected and the
    /// original edge stays in place.
    pub fn add_successor(
        &mut self,
        from: NodeId,
        to: NodeId,
        action: impl Into<Action>,
    ) -> Result<NodeId> {
        let action = action.into();
        if to.index() >= self.units.len() {
            return Err(FlowError::UnknownNode(to.to_string()));
        }
        let unit = self
            .units
            .get_mut(from.index())
            .ok_or_else(|| FlowError::UnknownNode(from.to_string()))?;
        if unit.successors.contains_key(&action) {
            return Err(FlowError::DuplicateSuccessor {
                node: unit.name.clone(),
                action: action.to_string(),
            });
        }
        debug!(from = %unit.name, to = %to, action = %action, "Successor registered");
        unit.successors.insert(action, to);
        Ok(to)
    }

    /// `add_successor(from, to, "default")`.
    pub fn then(&mut self, from: NodeId, to: NodeId) -> Result<NodeId> {
        self.add_successor(from, to, Action::default())
    }

    /// Bind an outcome key on `from`; finish with [`ActionBinder::then`].
    pub fn with_action(&mut self, from: NodeId, action: impl Into<Action>) -> ActionBinder<'_> {
        ActionBinder {
            builder: self,
            from,
            action: action.into(),
        }
    }

    pub fn build(self) -> Arc<Graph> {
        Arc::new(Graph { units: self.units })
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending edge created by [`GraphBuilder::with_action`].
pub struct ActionBinder<'a> {
    builder: &'a mut GraphBuilder,
    from: NodeId,
    action: Action,
}

impl ActionBinder<'_> {
    pub fn then(self, to: NodeId) -> Result<NodeId> {
        self.builder.add_successor(self.from, to, self.action)
    }
}
