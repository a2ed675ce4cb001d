use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use knotwork_core::config::EngineConfig;
use knotwork_core::context::{merge_params, Params, SharedContext};
use knotwork_core::error::{FlowError, Result};
use knotwork_core::types::{Action, BatchMode, NodeId};

use crate::batch::{batch_items, item_overrides, merge_branches, scoped_map, ExecOutput};
use crate::graph::{Graph, Route, Unit, UnitDef};
use crate::node::Node;
use crate::report::{FlowOutcome, NodeRun, Orchestration, Termination};
use crate::retry::retry_blocking;

/// Flow-level prepare/finalize phases, run once around orchestration.
///
/// For a batch flow, `prep` returns the per-item param overrides as an array of
/// objects.
pub trait FlowHooks: Send + Sync + 'static {
    fn prep(&self, ctx: &mut SharedContext, params: &Params) -> Result<Value> {
        let _ = (ctx, params);
        Ok(Value::Null)
    }

    /// Produces the flow's result. `last` is the final outcome key of the (last)
    /// orchestration.
    fn post(
        &self,
        ctx: &mut SharedContext,
        params: &Params,
        prep: Value,
        last: Action,
    ) -> Result<Action> {
        let _ = (ctx, params, prep);
        Ok(last)
    }
}

/// Suspension-capable counterpart of [`FlowHooks`].
pub trait AsyncFlowHooks: Send + Sync + 'static {
    fn prep<'a>(
        &'a self,
        ctx: &'a mut SharedContext,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Value>> {
        let _ = (ctx, params);
        Box::pin(async { Ok(Value::Null) })
    }

    fn post<'a>(
        &'a self,
        ctx: &'a mut SharedContext,
        params: &'a Params,
        prep: Value,
        last: Action,
    ) -> BoxFuture<'a, Result<Action>> {
        let _ = (ctx, params, prep);
        Box::pin(async move { Ok(last) })
    }
}

#[derive(Clone)]
pub(crate) enum Hooks {
    None,
    Blocking(Arc<dyn FlowHooks>),
    Suspending(Arc<dyn AsyncFlowHooks>),
}

/// Sequential orchestrator: walks a graph from `start`, following the outcome key
/// each unit returns, until no successor matches.
///
/// A `Flow` is cheap to clone and holds no per-run state.
#[derive(Clone)]
pub struct Flow {
    pub(crate) name: String,
    pub(crate) graph: Arc<Graph>,
    pub(crate) start: NodeId,
    pub(crate) params: Params,
    pub(crate) hooks: Hooks,
    pub(crate) batch: BatchMode,
    pub(crate) max_steps: Option<usize>,
    pub(crate) max_concurrency: Option<NonZeroUsize>,
    pub(crate) run_timeout: Option<Duration>,
}

impl Flow {
    pub fn new(graph: Arc<Graph>, start: NodeId) -> Self {
        Self {
            name: "flow".to_string(),
            graph,
            start,
            params: Params::new(),
            hooks: Hooks::None,
            batch: BatchMode::Single,
            max_steps: None,
            max_concurrency: None,
            run_timeout: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Flow-level params: the lowest layer of every unit's effective params.
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_hooks(mut self, hooks: impl FlowHooks) -> Self {
        self.hooks = Hooks::Blocking(Arc::new(hooks));
        self
    }

    /// Hooks that may suspend. The flow then only runs through `run_async`.
    pub fn with_async_hooks(mut self, hooks: impl AsyncFlowHooks) -> Self {
        self.hooks = Hooks::Suspending(Arc::new(hooks));
        self
    }

    /// Run the whole flow once per item override returned by the prepare hook.
    pub fn batched(mut self, mode: BatchMode) -> Self {
        self.batch = mode;
        self
    }

    /// Fail a run that executes more than `limit` units in one orchestration.
    pub fn with_max_steps(mut self, limit: usize) -> Self {
        self.max_steps = Some(limit);
        self
    }

    /// Bound items in flight for parallel batches run by this flow.
    pub fn with_max_concurrency(mut self, limit: NonZeroUsize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Timeout applied by `run_async` around the whole run.
    pub fn with_run_timeout(mut self, limit: Duration) -> Self {
        self.run_timeout = Some(limit);
        self
    }

    /// Apply the engine's flow and batch settings.
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.max_steps = config.flow.max_steps;
        self.run_timeout = config.flow.run_timeout();
        self.max_concurrency = config.batch.max_concurrency;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn start(&self) -> NodeId {
        self.start
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn batch_mode(&self) -> BatchMode {
        self.batch
    }

    /// Whether the flow can run through the blocking [`Flow::run`].
    pub fn is_blocking(&self) -> bool {
        !matches!(self.hooks, Hooks::Suspending(_)) && self.graph.is_blocking()
    }

    /// Run the flow to completion on the current thread.
    pub fn run(&self, ctx: &mut SharedContext) -> Result<FlowOutcome> {
        self.run_with(ctx, &Params::new())
    }

    /// Run with caller overrides layered over the flow-level params.
    pub fn run_with(&self, ctx: &mut SharedContext, overrides: &Params) -> Result<FlowOutcome> {
        if !self.is_blocking() {
            return Err(FlowError::Config(format!(
                "flow '{}' has suspending units or hooks; use run_async",
                self.name
            )));
        }

        let run_id = Uuid::new_v4();
        let span = info_span!("flow_run", run_id = %run_id, flow = %self.name);
        let _enter = span.enter();
        let start = Instant::now();
        info!(start = %self.start, batch = ?self.batch, "Flow run started");

        match self.execute_blocking(ctx, overrides) {
            Ok((action, runs)) => Ok(self.finish(run_id, action, runs, start)),
            Err(e) => {
                error!(error = %e, "Flow run failed");
                Err(e)
            }
        }
    }

    pub(crate) fn finish(
        &self,
        run_id: Uuid,
        action: Action,
        runs: Vec<Orchestration>,
        start: Instant,
    ) -> FlowOutcome {
        let outcome = FlowOutcome {
            run_id,
            action,
            runs,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            action = %outcome.action,
            steps = outcome.step_count(),
            elapsed_ms = outcome.elapsed_ms,
            "Flow run complete"
        );
        outcome
    }

    pub(crate) fn check_step_limit(&self, taken: usize) -> Result<()> {
        match self.max_steps {
            Some(limit) if taken >= limit => {
                warn!(flow = %self.name, limit, "Step limit reached");
                Err(FlowError::StepLimit { limit })
            }
            _ => Ok(()),
        }
    }

    /// Prepare, orchestrate (once or per item), finalize.
    pub(crate) fn execute_blocking(
        &self,
        ctx: &mut SharedContext,
        overrides: &Params,
    ) -> Result<(Action, Vec<Orchestration>)> {
        let base = merge_params(&[&self.params, overrides]);
        let prep = match &self.hooks {
            Hooks::None => Value::Null,
            Hooks::Blocking(h) => h.prep(ctx, &base)?,
            Hooks::Suspending(_) => return Err(self.suspending_hooks()),
        };

        let runs = match self.batch {
            BatchMode::Single => vec![self.orchestrate_blocking(ctx, &base, None)?],
            BatchMode::Sequential => {
                let items = item_overrides(&self.name, &prep)?;
                let mut runs = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let params = merge_params(&[&base, item]);
                    runs.push(self.orchestrate_blocking(ctx, &params, Some(i))?);
                }
                runs
            }
            BatchMode::Parallel => {
                let items = item_overrides(&self.name, &prep)?;
                let snapshot = ctx.clone();
                let mut branches: Vec<(SharedContext, Params)> = items
                    .iter()
                    .map(|item| (snapshot.clone(), merge_params(&[&base, item])))
                    .collect();
                let runs = scoped_map(&mut branches, self.max_concurrency, |i, (branch, params)| {
                    self.orchestrate_blocking(branch, params, Some(i))
                })?
                .into_iter()
                .collect::<Result<Vec<_>>>()?;
                merge_branches(ctx, &snapshot, branches.into_iter().map(|(c, _)| c));
                runs
            }
        };

        let last = last_action(&runs);
        let action = match &self.hooks {
            Hooks::None => last,
            Hooks::Blocking(h) => h.post(ctx, &base, prep, last)?,
            Hooks::Suspending(_) => return Err(self.suspending_hooks()),
        };
        Ok((action, runs))
    }

    fn orchestrate_blocking(
        &self,
        ctx: &mut SharedContext,
        base: &Params,
        item: Option<usize>,
    ) -> Result<Orchestration> {
        debug!(flow = %self.name, item = ?item, "Orchestration started");
        let mut steps = Vec::new();
        let mut current = self.start;
        loop {
            self.check_step_limit(steps.len())?;
            let def = self.graph.unit(current)?;
            let params = merge_params(&[base, &def.params]);
            let step = self.run_unit_blocking(current, def, ctx, &params)?;
            let action = step.action.clone();
            steps.push(step);
            match route_after(current, def, &action) {
                ControlFlow::Continue(next) => current = next,
                ControlFlow::Break(termination) => {
                    return Ok(Orchestration {
                        item,
                        steps,
                        last_action: action,
                        termination,
                    })
                }
            }
        }
    }

    fn run_unit_blocking(
        &self,
        id: NodeId,
        def: &UnitDef,
        ctx: &mut SharedContext,
        params: &Params,
    ) -> Result<NodeRun> {
        let started_at = Utc::now();
        let start = Instant::now();
        debug!(node = %def.name, id = %id, "Running unit");

        let (action, attempts, fallbacks) = match &def.unit {
            Unit::Blocking(node) => {
                let node = node.as_ref();
                let prep = node.prep(ctx, params)?;
                let out = self.compute_blocking(node, def, &prep, params)?;
                let action = node.post(ctx, params, prep, out.value)?;
                (action, out.attempts, out.fallbacks)
            }
            Unit::Suspending(_) => {
                return Err(FlowError::Config(format!(
                    "unit '{}' suspends and cannot run in a blocking flow",
                    def.name
                )))
            }
            Unit::Flow(flow) => {
                let (action, _) = flow.execute_blocking(ctx, params)?;
                (action, 1, 0)
            }
        };

        Ok(NodeRun {
            node: id,
            name: def.name.clone(),
            action,
            attempts,
            fallbacks,
            started_at,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn compute_blocking(
        &self,
        node: &dyn Node,
        def: &UnitDef,
        prep: &Value,
        params: &Params,
    ) -> Result<ExecOutput> {
        let once = |input: &Value| {
            retry_blocking(
                &def.name,
                &def.retry,
                || node.exec(input, params),
                |e| node.exec_fallback(input, params, e),
            )
        };

        match def.batch {
            BatchMode::Single => Ok(once(prep)?.into()),
            BatchMode::Sequential => {
                let items = batch_items(&def.name, prep)?;
                let mut done = Vec::with_capacity(items.len());
                for item in items {
                    done.push(once(item)?);
                }
                Ok(ExecOutput::from_batch(done))
            }
            BatchMode::Parallel => {
                let mut slots: Vec<&Value> = batch_items(&def.name, prep)?.iter().collect();
                let done = scoped_map(&mut slots, self.max_concurrency, |_, item| {
                    let item: &Value = item;
                    once(item)
                })?
                .into_iter()
                .collect::<Result<Vec<_>>>()?;
                Ok(ExecOutput::from_batch(done))
            }
        }
    }

    pub(crate) fn suspending_hooks(&self) -> FlowError {
        FlowError::Config(format!(
            "flow '{}' has suspending hooks and cannot run in a blocking flow",
            self.name
        ))
    }
}

/// A flow's job is orchestration; computing it directly is a configuration error.
impl Node for Flow {
    fn exec(&self, _input: &Value, _params: &Params) -> Result<Value> {
        Err(FlowError::NotComputable(self.name.clone()))
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("batch", &self.batch)
            .field("params", &self.params)
            .field("graph", &self.graph)
            .finish()
    }
}

pub(crate) fn last_action(runs: &[Orchestration]) -> Action {
    runs.last()
        .map(|r| r.last_action.clone())
        .unwrap_or_default()
}

/// Pick the next unit, or report why the walk ends.
pub(crate) fn route_after(
    current: NodeId,
    def: &UnitDef,
    action: &Action,
) -> ControlFlow<Termination, NodeId> {
    match def.route(action) {
        Route::Next(next) => ControlFlow::Continue(next),
        Route::Leaf => {
            debug!(node = %def.name, action = %action, "No successors, flow complete");
            ControlFlow::Break(Termination::Leaf {
                node: current,
                name: def.name.clone(),
            })
        }
        Route::Gap => {
            let known: Vec<&str> = def.successors.keys().map(|a| a.as_str()).collect();
            warn!(
                node = %def.name,
                action = %action,
                known = ?known,
                "No successor for action, flow ends"
            );
            ControlFlow::Break(Termination::RouteNotFound {
                node: current,
                name: def.name.clone(),
                action: action.clone(),
            })
        }
    }
}
