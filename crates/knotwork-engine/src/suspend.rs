//! Suspension-capable execution of flows, units, and batches.
//!
//! Same shapes as the blocking path. Phases may await external completion and
//! retry waits use the tokio timer. Parallel batches are driven with
//! `StreamExt::buffered`, so results come back in input order regardless of
//! which item finishes first. Blocking units are accepted: their prepare and
//! finalize phases run inline, their compute runs on the blocking thread pool.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use knotwork_core::context::{merge_params, Params, SharedContext};
use knotwork_core::error::{FlowError, Result};
use knotwork_core::types::{Action, BatchMode, NodeId};

use crate::batch::{batch_items, concurrency, item_overrides, merge_branches, ExecOutput};
use crate::flow::{last_action, route_after, Flow, Hooks};
use crate::graph::{Unit, UnitDef};
use crate::node::{AsyncNode, Node};
use crate::report::{FlowOutcome, NodeRun, Orchestration};
use crate::retry::{retry_async, retry_blocking, Computed, RetryPolicy};

/// Lifecycle phases of either unit flavour, awaited uniformly.
#[derive(Clone, Copy)]
enum Phases<'a> {
    Blocking(&'a Arc<dyn Node>),
    Suspending(&'a dyn AsyncNode),
}

impl Phases<'_> {
    async fn prep(self, ctx: &mut SharedContext, params: &Params) -> Result<Value> {
        match self {
            Phases::Blocking(n) => n.prep(ctx, params),
            Phases::Suspending(n) => n.prep(ctx, params).await,
        }
    }

    async fn compute(
        self,
        name: &str,
        policy: &RetryPolicy,
        input: &Value,
        params: &Params,
    ) -> Result<Computed> {
        match self {
            Phases::Blocking(n) => {
                let (node, name, policy) = (Arc::clone(n), name.to_string(), *policy);
                let (input, params) = (input.clone(), params.clone());
                let span = Span::current();
                tokio::task::spawn_blocking(move || {
                    let _enter = span.enter();
                    retry_blocking(
                        &name,
                        &policy,
                        || node.exec(&input, &params),
                        |e| node.exec_fallback(&input, &params, e),
                    )
                })
                .await
                .map_err(|e| FlowError::Join(e.to_string()))?
            }
            Phases::Suspending(n) => {
                retry_async(
                    name,
                    policy,
                    || n.exec(input, params),
                    |e| n.exec_fallback(input, params, e),
                )
                .await
            }
        }
    }

    async fn post(
        self,
        ctx: &mut SharedContext,
        params: &Params,
        prep: Value,
        exec: Value,
    ) -> Result<Action> {
        match self {
            Phases::Blocking(n) => n.post(ctx, params, prep, exec),
            Phases::Suspending(n) => n.post(ctx, params, prep, exec).await,
        }
    }
}

impl Flow {
    /// Run the flow, suspending wherever a phase or retry wait does.
    ///
    /// When a run timeout is configured the whole run is wrapped in it.
    pub async fn run_async(&self, ctx: &mut SharedContext) -> Result<FlowOutcome> {
        self.run_async_with(ctx, &Params::new()).await
    }

    /// Run with caller overrides layered over the flow-level params.
    pub async fn run_async_with(
        &self,
        ctx: &mut SharedContext,
        overrides: &Params,
    ) -> Result<FlowOutcome> {
        match self.run_timeout {
            Some(limit) => self.run_bounded(ctx, overrides, limit).await,
            None => self.run_traced(ctx, overrides).await,
        }
    }

    /// Run under a caller-level timeout. The run is dropped at its next
    /// suspension point once `limit` elapses; there is no mid-phase cancellation.
    pub async fn run_async_with_timeout(
        &self,
        ctx: &mut SharedContext,
        limit: Duration,
    ) -> Result<FlowOutcome> {
        self.run_bounded(ctx, &Params::new(), limit).await
    }

    async fn run_bounded(
        &self,
        ctx: &mut SharedContext,
        overrides: &Params,
        limit: Duration,
    ) -> Result<FlowOutcome> {
        match tokio::time::timeout(limit, self.run_traced(ctx, overrides)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(flow = %self.name, timeout_ms = limit.as_millis() as u64, "Flow run timed out");
                Err(FlowError::Timeout(limit))
            }
        }
    }

    async fn run_traced(&self, ctx: &mut SharedContext, overrides: &Params) -> Result<FlowOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!("flow_run", run_id = %run_id, flow = %self.name);
        async move {
            let start = Instant::now();
            info!(start = %self.start, batch = ?self.batch, "Flow run started");
            match self.execute_async(ctx, overrides).await {
                Ok((action, runs)) => Ok(self.finish(run_id, action, runs, start)),
                Err(e) => {
                    error!(error = %e, "Flow run failed");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Prepare, orchestrate (once or per item), finalize.
    pub(crate) fn execute_async<'a>(
        &'a self,
        ctx: &'a mut SharedContext,
        overrides: &'a Params,
    ) -> BoxFuture<'a, Result<(Action, Vec<Orchestration>)>> {
        Box::pin(async move {
            let base = merge_params(&[&self.params, overrides]);
            let prep = match &self.hooks {
                Hooks::None => Value::Null,
                Hooks::Blocking(h) => h.prep(ctx, &base)?,
                Hooks::Suspending(h) => h.prep(ctx, &base).await?,
            };

            let runs = match self.batch {
                BatchMode::Single => vec![self.orchestrate_async(ctx, &base, None).await?],
                BatchMode::Sequential => {
                    let items = item_overrides(&self.name, &prep)?;
                    let mut runs = Vec::with_capacity(items.len());
                    for (i, item) in items.iter().enumerate() {
                        let params = merge_params(&[&base, item]);
                        runs.push(self.orchestrate_async(ctx, &params, Some(i)).await?);
                    }
                    runs
                }
                BatchMode::Parallel => {
                    let items = item_overrides(&self.name, &prep)?;
                    let width = concurrency(self.max_concurrency, items.len());
                    let snapshot = ctx.clone();
                    let mut branches: Vec<(SharedContext, Params)> = items
                        .iter()
                        .map(|item| (snapshot.clone(), merge_params(&[&base, item])))
                        .collect();
                    let mut futs = Vec::with_capacity(branches.len());
                    for (i, (branch, params)) in branches.iter_mut().enumerate() {
                        futs.push(self.orchestrate_async(branch, &*params, Some(i)));
                    }
                    let results: Vec<Result<Orchestration>> =
                        stream::iter(futs).buffered(width).collect().await;
                    let runs = results.into_iter().collect::<Result<Vec<_>>>()?;
                    merge_branches(ctx, &snapshot, branches.into_iter().map(|(c, _)| c));
                    runs
                }
            };

            let last = last_action(&runs);
            let action = match &self.hooks {
                Hooks::None => last,
                Hooks::Blocking(h) => h.post(ctx, &base, prep, last)?,
                Hooks::Suspending(h) => h.post(ctx, &base, prep, last).await?,
            };
            Ok((action, runs))
        })
    }

    fn orchestrate_async<'a>(
        &'a self,
        ctx: &'a mut SharedContext,
        base: &'a Params,
        item: Option<usize>,
    ) -> BoxFuture<'a, Result<Orchestration>> {
        Box::pin(async move {
            debug!(flow = %self.name, item = ?item, "Orchestration started");
            let mut steps = Vec::new();
            let mut current = self.start;
            loop {
                self.check_step_limit(steps.len())?;
                let def = self.graph.unit(current)?;
                let params = merge_params(&[base, &def.params]);
                let step = self.run_unit_async(current, def, ctx, &params).await?;
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
        })
    }

    async fn run_unit_async(
        &self,
        id: NodeId,
        def: &UnitDef,
        ctx: &mut SharedContext,
        params: &Params,
    ) -> Result<NodeRun> {
        let started_at = Utc::now();
        let start = Instant::now();
        debug!(node = %def.name, id = %id, "Running unit");

        let phases = match &def.unit {
            Unit::Blocking(node) => Phases::Blocking(node),
            Unit::Suspending(node) => Phases::Suspending(node.as_ref()),
            Unit::Flow(flow) => {
                let (action, _) = flow.execute_async(ctx, params).await?;
                return Ok(NodeRun {
                    node: id,
                    name: def.name.clone(),
                    action,
                    attempts: 1,
                    fallbacks: 0,
                    started_at,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                });
            }
        };

        let prep = phases.prep(ctx, params).await?;
        let out = self.compute_async(phases, def, &prep, params).await?;
        let action = phases.post(ctx, params, prep, out.value).await?;

        Ok(NodeRun {
            node: id,
            name: def.name.clone(),
            action,
            attempts: out.attempts,
            fallbacks: out.fallbacks,
            started_at,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn compute_async(
        &self,
        phases: Phases<'_>,
        def: &UnitDef,
        prep: &Value,
        params: &Params,
    ) -> Result<ExecOutput> {
        match def.batch {
            BatchMode::Single => Ok(phases
                .compute(&def.name, &def.retry, prep, params)
                .await?
                .into()),
            BatchMode::Sequential => {
                let items = batch_items(&def.name, prep)?;
                let mut done = Vec::with_capacity(items.len());
                for item in items {
                    done.push(phases.compute(&def.name, &def.retry, item, params).await?);
                }
                Ok(ExecOutput::from_batch(done))
            }
            BatchMode::Parallel => {
                let items = batch_items(&def.name, prep)?;
                let width = concurrency(self.max_concurrency, items.len());
                let mut futs = Vec::with_capacity(items.len());
                for item in items {
                    futs.push(phases.compute(&def.name, &def.retry, item, params).boxed());
                }
                let results: Vec<Result<Computed>> =
                    stream::iter(futs).buffered(width).collect().await;
                let done = results.into_iter().collect::<Result<Vec<_>>>()?;
                Ok(ExecOutput::from_batch(done))
            }
        }
    }
}
