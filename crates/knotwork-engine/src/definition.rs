//! Declarative graph definitions loaded from TOML.
//!
//! ```toml
//! name = "review"
//! start = "draft"
//!
//! [[nodes]]
//! name = "draft"
//! kind = "writer"
//! retry = { max_attempts = 3, wait_ms = 100 }
//!
//! [[nodes]]
//! name = "check"
//! kind = "reviewer"
//!
//! [[edges]]
//! from = "draft"
//! to = "check"
//!
//! [[edges]]
//! from = "check"
//! to = "draft"
//! action = "revise"
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use knotwork_core::config::{EngineConfig, RetryConfig};
use knotwork_core::context::Params;
use knotwork_core::error::{FlowError, Result};
use knotwork_core::types::{Action, BatchMode};

use crate::flow::Flow;
use crate::graph::{GraphBuilder, NodeDef};
use crate::node::{AsyncNode, Node};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(default)]
    pub name: Option<String>,
    /// Name of the start node.
    pub start: String,
    /// Flow-level params.
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub name: String,
    /// Registry key of the implementation.
    pub kind: String,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub batch: BatchMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub action: Action,
}

/// Problems found by [`GraphDefinition::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefinitionReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl DefinitionReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Clone)]
enum Registered {
    Blocking(Arc<dyn Node>),
    Suspending(Arc<dyn AsyncNode>),
}

/// Named node implementations that definitions refer to by `kind`.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    kinds: HashMap<String, Registered>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, node: impl Node) {
        self.kinds
            .insert(kind.into(), Registered::Blocking(Arc::new(node)));
    }

    pub fn register_async(&mut self, kind: impl Into<String>, node: impl AsyncNode) {
        self.kinds
            .insert(kind.into(), Registered::Suspending(Arc::new(node)));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.kinds.keys().map(|k| k.as_str()).collect();
        kinds.sort();
        kinds
    }
}

impl GraphDefinition {
    /// Load a definition from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("flow")
    }

    /// Structural checks that need no node implementations.
    pub fn validate(&self) -> DefinitionReport {
        let mut report = DefinitionReport::default();

        if self.nodes.is_empty() {
            report.errors.push("definition has no nodes".into());
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                report
                    .errors
                    .push(format!("duplicate node name '{}'", node.name));
            }
            if let Some(retry) = &node.retry {
                if retry.max_attempts == 0 {
                    report.errors.push(format!(
                        "node '{}': retry.max_attempts must be at least 1",
                        node.name
                    ));
                }
            }
        }

        if !names.contains(self.start.as_str()) {
            report
                .errors
                .push(format!("start node '{}' is not defined", self.start));
        }

        let mut seen_edges = HashSet::new();
        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !names.contains(end.as_str()) {
                    report.errors.push(format!(
                        "edge {} -[{}]-> {} references unknown node '{}'",
                        edge.from, edge.action, edge.to, end
                    ));
                }
            }
            if !seen_edges.insert((edge.from.as_str(), edge.action.as_str())) {
                report.errors.push(format!(
                    "duplicate successor on '{}' for action '{}'",
                    edge.from, edge.action
                ));
            }
        }

        for name in self.unreachable() {
            report
                .warnings
                .push(format!("node '{}' is unreachable from '{}'", name, self.start));
        }

        report
    }

    /// Nodes no edge path from `start` leads to, in declaration order.
    fn unreachable(&self) -> Vec<&str> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            adjacency
                .entry(edge.from.as_str())
                .or_default()
                .push(edge.to.as_str());
        }

        let mut reached = HashSet::new();
        let mut queue = VecDeque::from([self.start.as_str()]);
        while let Some(name) = queue.pop_front() {
            if !reached.insert(name) {
                continue;
            }
            if let Some(next) = adjacency.get(name) {
                queue.extend(next.iter().copied());
            }
        }

        self.nodes
            .iter()
            .map(|n| n.name.as_str())
            .filter(|n| !reached.contains(n))
            .collect()
    }

    /// Build a runnable [`Flow`], resolving each node's `kind` in `registry`.
    pub fn instantiate(&self, registry: &NodeRegistry, config: &EngineConfig) -> Result<Flow> {
        let report = self.validate();
        for warning in &report.warnings {
            warn!(flow = %self.display_name(), "{}", warning);
        }
        if !report.is_ok() {
            return Err(FlowError::Config(report.errors.join("; ")));
        }

        let mut builder = GraphBuilder::new().with_default_retry(RetryPolicy::try_from(&config.retry)?);
        let mut ids = HashMap::new();
        for node in &self.nodes {
            let registered = registry.kinds.get(&node.kind).ok_or_else(|| {
                FlowError::Config(format!(
                    "node '{}' has unregistered kind '{}'",
                    node.name, node.kind
                ))
            })?;
            let mut def = match registered {
                Registered::Blocking(n) => NodeDef::blocking_shared(&node.name, n.clone()),
                Registered::Suspending(n) => NodeDef::suspending_shared(&node.name, n.clone()),
            }
            .with_params(node.params.clone())
            .batched(node.batch);
            if let Some(retry) = &node.retry {
                def = def.with_retry(RetryPolicy::try_from(retry)?);
            }
            ids.insert(node.name.as_str(), builder.add(def));
        }

        for edge in &self.edges {
            builder.add_successor(ids[edge.from.as_str()], ids[edge.to.as_str()], edge.action.clone())?;
        }

        info!(
            flow = %self.display_name(),
            nodes = self.nodes.len(),
            edges = self.edges.len(),
            "Graph definition instantiated"
        );
        Ok(Flow::new(builder.build(), ids[self.start.as_str()])
            .named(self.display_name())
            .with_params(self.params.clone())
            .with_config(config))
    }
}
