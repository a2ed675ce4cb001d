use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use knotwork_core::{Action, BatchMode, FlowError, Params, Result, SharedContext};
use knotwork_engine::{AsyncNode, Flow, FlowHooks, FnNode, GraphBuilder, Node, NodeDef, RetryPolicy};

/// Logs `name` (or `name:item` inside a batch flow) and returns `action`.
fn step(
    name: &'static str,
    action: &'static str,
) -> FnNode<impl Fn(&mut SharedContext, &Params) -> Result<Action> + Send + Sync + 'static> {
    FnNode::new(move |ctx: &mut SharedContext, params: &Params| {
        let tag = match params.get("item").and_then(|v| v.as_str()) {
            Some(item) => format!("{}:{}", name, item),
            None => name.to_string(),
        };
        ctx.push("log", json!(tag));
        Ok(Action::from(action))
    })
}

/// Stores the effective `mode` param under `key`.
fn record_mode(
    key: &'static str,
) -> FnNode<impl Fn(&mut SharedContext, &Params) -> Result<Action> + Send + Sync + 'static> {
    FnNode::new(move |ctx: &mut SharedContext, params: &Params| {
        ctx.set(key, params.get("mode").cloned().unwrap_or(Value::Null));
        Ok(Action::default())
    })
}

fn log(ctx: &SharedContext) -> Vec<String> {
    ctx.get("log")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

impl Flaky {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

impl Node for Flaky {
    fn exec(&self, _input: &Value, _params: &Params) -> Result<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(FlowError::node(format!("failure {}", call)))
        } else {
            Ok(json!(call))
        }
    }

    fn post(
        &self,
        ctx: &mut SharedContext,
        _params: &Params,
        _prep: Value,
        exec: Value,
    ) -> Result<Action> {
        ctx.set("result", exec);
        Ok(Action::default())
    }
}

#[test]
fn test_retry_succeeds_on_last_attempt() {
    let flaky = Arc::new(Flaky::new(2));
    let mut b = GraphBuilder::new();
    let a = b.add(
        NodeDef::blocking_shared("flaky", flaky.clone())
            .with_retry(RetryPolicy::new(3, Duration::from_millis(1)).unwrap()),
    );
    let flow = Flow::new(b.build(), a);

    let mut ctx = SharedContext::new();
    let outcome = flow.run(&mut ctx).unwrap();

    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    assert_eq!(ctx.get("result"), Some(&json!(3)));
    let run = outcome.steps().next().unwrap();
    assert_eq!(run.attempts, 3);
    assert_eq!(run.fallbacks, 0);
}

struct AlwaysFails {
    calls: AtomicU32,
    fallback_errors: Mutex<Vec<String>>,
}

impl Node for AlwaysFails {
    fn exec(&self, _input: &Value, _params: &Params) -> Result<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Err(FlowError::node(format!("failure {}", call)))
    }

    fn exec_fallback(&self, _input: &Value, _params: &Params, error: FlowError) -> Result<Value> {
        self.fallback_errors.lock().unwrap().push(error.to_string());
        Ok(json!("fallback"))
    }

    fn post(
        &self,
        ctx: &mut SharedContext,
        _params: &Params,
        _prep: Value,
        exec: Value,
    ) -> Result<Action> {
        ctx.set("result", exec);
        Ok(Action::default())
    }
}

#[test]
fn test_fallback_receives_final_error_once() {
    let node = Arc::new(AlwaysFails {
        calls: AtomicU32::new(0),
        fallback_errors: Mutex::new(Vec::new()),
    });
    let mut b = GraphBuilder::new();
    let a = b.add(
        NodeDef::blocking_shared("fails", node.clone())
            .with_retry(RetryPolicy::new(3, Duration::ZERO).unwrap()),
    );
    let flow = Flow::new(b.build(), a);

    let mut ctx = SharedContext::new();
    let outcome = flow.run(&mut ctx).unwrap();

    assert_eq!(node.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        *node.fallback_errors.lock().unwrap(),
        vec!["Node error: failure 3".to_string()]
    );
    assert_eq!(ctx.get_str("result"), Some("fallback"));
    let run = outcome.steps().next().unwrap();
    assert_eq!(run.attempts, 3);
    assert_eq!(run.fallbacks, 1);
}

#[test]
fn test_default_fallback_surfaces_error() {
    let mut b = GraphBuilder::new();
    let a = b.add(
        NodeDef::blocking("flaky", Flaky::new(5))
            .with_retry(RetryPolicy::new(2, Duration::ZERO).unwrap()),
    );
    let flow = Flow::new(b.build(), a);

    let err = flow.run(&mut SharedContext::new()).unwrap_err();
    match err {
        FlowError::Fallback { node, source } => {
            assert_eq!(node, "flaky");
            assert_eq!(source.to_string(), "Node error: failure 2");
        }
        other => panic!("unexpected error: {other}"),
    }
}

struct Misconfigured {
    calls: AtomicU32,
}

impl Node for Misconfigured {
    fn exec(&self, _input: &Value, _params: &Params) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(FlowError::Config("missing endpoint".into()))
    }
}

#[test]
fn test_configuration_errors_skip_retries() {
    let node = Arc::new(Misconfigured {
        calls: AtomicU32::new(0),
    });
    let mut b = GraphBuilder::new();
    let a = b.add(
        NodeDef::blocking_shared("misconfigured", node.clone())
            .with_retry(RetryPolicy::new(4, Duration::ZERO).unwrap()),
    );
    let flow = Flow::new(b.build(), a);

    let err = flow.run(&mut SharedContext::new()).unwrap_err();
    match err {
        FlowError::Fallback { node, source } => {
            assert_eq!(node, "misconfigured");
            assert!(matches!(*source, FlowError::Config(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(node.calls.load(Ordering::SeqCst), 1);
}

struct TimesOut {
    calls: AtomicU32,
    fallbacks: AtomicU32,
}

impl Node for TimesOut {
    fn exec(&self, _input: &Value, _params: &Params) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(FlowError::Timeout(Duration::from_millis(5)))
    }

    fn exec_fallback(&self, _input: &Value, _params: &Params, error: FlowError) -> Result<Value> {
        assert!(matches!(error, FlowError::Timeout(_)));
        self.fallbacks.fetch_add(1, Ordering::SeqCst);
        Ok(json!("cached"))
    }

    fn post(
        &self,
        ctx: &mut SharedContext,
        _params: &Params,
        _prep: Value,
        exec: Value,
    ) -> Result<Action> {
        ctx.set("result", exec);
        Ok(Action::default())
    }
}

#[test]
fn test_non_retryable_compute_error_reaches_fallback() {
    let node = Arc::new(TimesOut {
        calls: AtomicU32::new(0),
        fallbacks: AtomicU32::new(0),
    });
    let mut b = GraphBuilder::new();
    let a = b.add(
        NodeDef::blocking_shared("times_out", node.clone())
            .with_retry(RetryPolicy::new(3, Duration::ZERO).unwrap()),
    );
    let flow = Flow::new(b.build(), a);

    let mut ctx = SharedContext::new();
    let outcome = flow.run(&mut ctx).unwrap();

    assert_eq!(node.calls.load(Ordering::SeqCst), 1);
    assert_eq!(node.fallbacks.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.get_str("result"), Some("cached"));
    assert_eq!(outcome.steps().next().unwrap().fallbacks, 1);
}

/// Batch unit over `[1, "bad", 3]`; the string item fails, the numbers are recorded.
struct PartlyBad {
    done: Mutex<Vec<u64>>,
}

impl Node for PartlyBad {
    fn prep(&self, _ctx: &mut SharedContext, _params: &Params) -> Result<Value> {
        Ok(json!([1, "bad", 3]))
    }

    fn exec(&self, input: &Value, _params: &Params) -> Result<Value> {
        let n = input
            .as_u64()
            .ok_or_else(|| FlowError::node("not a number"))?;
        std::thread::sleep(Duration::from_millis(20));
        self.done.lock().unwrap().push(n);
        Ok(json!(n))
    }
}

#[test]
fn test_failed_parallel_item_does_not_stop_siblings() {
    let node = Arc::new(PartlyBad {
        done: Mutex::new(Vec::new()),
    });
    let mut b = GraphBuilder::new();
    let a = b.add(NodeDef::blocking_shared("partly_bad", node.clone()).batched(BatchMode::Parallel));
    let flow = Flow::new(b.build(), a);

    let err = flow.run(&mut SharedContext::new()).unwrap_err();
    assert!(matches!(err, FlowError::Fallback { .. }));
    let mut done = node.done.lock().unwrap().clone();
    done.sort();
    assert_eq!(done, vec![1, 3]);
}

#[test]
fn test_unmatched_action_ends_without_error() {
    let mut b = GraphBuilder::new();
    let a = b.add(NodeDef::blocking("a", step("a", "other")));
    let next = b.add(NodeDef::blocking("b", step("b", "default")));
    b.with_action(a, "success").then(next).unwrap();
    let flow = Flow::new(b.build(), a);

    let mut ctx = SharedContext::new();
    let outcome = flow.run(&mut ctx).unwrap();

    assert_eq!(outcome.action, "other");
    assert_eq!(outcome.trace(), vec!["a"]);
    let termination = outcome.termination().unwrap();
    assert!(termination.is_route_not_found());
    assert_eq!(termination.node(), a);
    assert_eq!(log(&ctx), vec!["a"]);
}

#[test]
fn test_flow_result_is_last_action() {
    let mut b = GraphBuilder::new();
    let a = b.add(NodeDef::blocking("nodeA", step("nodeA", "default")));
    let done = b.add(NodeDef::blocking("nodeB", step("nodeB", "done")));
    b.then(a, done).unwrap();
    let flow = Flow::new(b.build(), a);

    let mut ctx = SharedContext::new();
    let outcome = flow.run(&mut ctx).unwrap();

    assert_eq!(outcome.action, "done");
    assert_eq!(outcome.step_count(), 2);
    assert_eq!(outcome.trace(), vec!["nodeA", "nodeB"]);
    assert!(!outcome.termination().unwrap().is_route_not_found());
}

#[test]
fn test_branching_and_loops() {
    let counter = FnNode::new(|ctx: &mut SharedContext, _: &Params| {
        let n = ctx.get("n").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
        ctx.set("n", json!(n));
        Ok(Action::from(if n < 3 { "again" } else { "enough" }))
    });

    let mut b = GraphBuilder::new();
    let count = b.add(NodeDef::blocking("count", counter));
    let finish = b.add(NodeDef::blocking("finish", step("finish", "default")));
    b.with_action(count, "again").then(count).unwrap();
    b.with_action(count, "enough").then(finish).unwrap();
    let flow = Flow::new(b.build(), count);

    let mut ctx = SharedContext::new();
    let outcome = flow.run(&mut ctx).unwrap();
    assert_eq!(outcome.trace(), vec!["count", "count", "count", "finish"]);
    assert_eq!(ctx.get("n"), Some(&json!(3)));
}

#[test]
fn test_duplicate_successor_rejected() {
    let mut b = GraphBuilder::new();
    let a = b.add(NodeDef::blocking("a", step("a", "default")));
    let x = b.add(NodeDef::blocking("x", step("x", "default")));
    let y = b.add(NodeDef::blocking("y", step("y", "default")));
    b.then(a, x).unwrap();
    assert!(matches!(
        b.then(a, y),
        Err(FlowError::DuplicateSuccessor { .. })
    ));

    let flow = Flow::new(b.build(), a);
    let mut ctx = SharedContext::new();
    flow.run(&mut ctx).unwrap();
    assert_eq!(log(&ctx), vec!["a", "x"]);
}

#[test]
fn test_step_limit() {
    let mut b = GraphBuilder::new();
    let a = b.add(NodeDef::blocking("spin", step("spin", "default")));
    b.then(a, a).unwrap();
    let flow = Flow::new(b.build(), a).with_max_steps(5);

    let mut ctx = SharedContext::new();
    let err = flow.run(&mut ctx).unwrap_err();
    assert!(matches!(err, FlowError::StepLimit { limit: 5 }));
    assert_eq!(log(&ctx).len(), 5);
}

struct Items(Vec<&'static str>);

impl FlowHooks for Items {
    fn prep(&self, _ctx: &mut SharedContext, _params: &Params) -> Result<Value> {
        Ok(Value::Array(
            self.0.iter().map(|item| json!({ "item": item })).collect(),
        ))
    }
}

fn two_step_flow() -> Flow {
    let mut b = GraphBuilder::new();
    let first = b.add(NodeDef::blocking("n1", step("n1", "default")));
    let second = b.add(NodeDef::blocking("n2", step("n2", "default")));
    b.then(first, second).unwrap();
    Flow::new(b.build(), first)
}

#[test]
fn test_sequential_batch_flow() {
    let flow = two_step_flow()
        .with_hooks(Items(vec!["a", "b", "c"]))
        .batched(BatchMode::Sequential);

    let mut ctx = SharedContext::new();
    let outcome = flow.run(&mut ctx).unwrap();

    assert_eq!(
        log(&ctx),
        vec!["n1:a", "n2:a", "n1:b", "n2:b", "n1:c", "n2:c"]
    );
    assert_eq!(outcome.runs.len(), 3);
    assert_eq!(outcome.step_count(), 6);
    let items: Vec<Option<usize>> = outcome.runs.iter().map(|r| r.item).collect();
    assert_eq!(items, vec![Some(0), Some(1), Some(2)]);
}

#[test]
fn test_parallel_batch_flow_merges_by_index() {
    let writer = FnNode::new(|ctx: &mut SharedContext, params: &Params| {
        let item = params
            .get("item")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        ctx.set(format!("seen_{}", item), json!(true));
        ctx.set_str("last", item);
        Ok(Action::default())
    });
    let mut b = GraphBuilder::new();
    let a = b.add(NodeDef::blocking("writer", writer));
    let flow = Flow::new(b.build(), a)
        .with_hooks(Items(vec!["a", "b", "c"]))
        .batched(BatchMode::Parallel)
        .with_max_concurrency(NonZeroUsize::new(2).unwrap());

    let mut ctx = SharedContext::new();
    ctx.set_str("untouched", "yes");
    let outcome = flow.run(&mut ctx).unwrap();

    assert_eq!(outcome.runs.len(), 3);
    for key in ["seen_a", "seen_b", "seen_c"] {
        assert_eq!(ctx.get(key), Some(&json!(true)), "{key}");
    }
    assert_eq!(ctx.get_str("last"), Some("c"));
    assert_eq!(ctx.get_str("untouched"), Some("yes"));
}

#[test]
fn test_failed_parallel_batch_flow_leaves_context_untouched() {
    let writer = FnNode::new(|ctx: &mut SharedContext, params: &Params| {
        let item = params
            .get("item")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        ctx.set(format!("seen_{}", item), json!(true));
        if item == "b" {
            return Err(FlowError::node("item b rejected"));
        }
        Ok(Action::default())
    });
    let mut b = GraphBuilder::new();
    let a = b.add(NodeDef::blocking("writer", writer));
    let flow = Flow::new(b.build(), a)
        .with_hooks(Items(vec!["a", "b", "c"]))
        .batched(BatchMode::Parallel);

    let mut ctx = SharedContext::new();
    ctx.set_str("untouched", "yes");
    let before = ctx.clone();
    let err = flow.run(&mut ctx).unwrap_err();

    assert!(matches!(err, FlowError::Node(_)));
    assert_eq!(ctx, before);
}

#[test]
fn test_empty_batch_flow() {
    let flow = two_step_flow()
        .with_hooks(Items(Vec::new()))
        .batched(BatchMode::Sequential);
    let mut ctx = SharedContext::new();
    let outcome = flow.run(&mut ctx).unwrap();
    assert!(outcome.runs.is_empty());
    assert_eq!(outcome.action, "default");
    assert!(log(&ctx).is_empty());
}

struct Delays;

impl Node for Delays {
    fn prep(&self, _ctx: &mut SharedContext, _params: &Params) -> Result<Value> {
        Ok(json!([30, 1, 15]))
    }

    fn exec(&self, input: &Value, _params: &Params) -> Result<Value> {
        let ms = input.as_u64().unwrap_or(0);
        std::thread::sleep(Duration::from_millis(ms));
        Ok(json!(ms * 2))
    }

    fn post(
        &self,
        ctx: &mut SharedContext,
        _params: &Params,
        _prep: Value,
        exec: Value,
    ) -> Result<Action> {
        ctx.set("doubled", exec);
        Ok(Action::default())
    }
}

#[test]
fn test_batch_units_keep_input_order() {
    for mode in [BatchMode::Sequential, BatchMode::Parallel] {
        let mut b = GraphBuilder::new();
        let a = b.add(NodeDef::blocking("delays", Delays).batched(mode));
        let flow = Flow::new(b.build(), a);

        let mut ctx = SharedContext::new();
        let outcome = flow.run(&mut ctx).unwrap();
        assert_eq!(ctx.get("doubled"), Some(&json!([60, 2, 30])), "{mode:?}");
        assert_eq!(outcome.steps().next().unwrap().attempts, 3);
    }
}

#[test]
fn test_params_precedence() {
    let mut b = GraphBuilder::new();
    let plain = b.add(NodeDef::blocking("plain", record_mode("plain")));
    let pinned = b.add(
        NodeDef::blocking("pinned", record_mode("pinned")).with_param("mode", json!("unit")),
    );
    b.then(plain, pinned).unwrap();
    let flow = Flow::new(b.build(), plain).with_param("mode", json!("flow"));

    let mut ctx = SharedContext::new();
    flow.run(&mut ctx).unwrap();
    assert_eq!(ctx.get_str("plain"), Some("flow"));
    assert_eq!(ctx.get_str("pinned"), Some("unit"));

    let overrides: Params = [("mode".to_string(), json!("caller"))].into_iter().collect();
    let mut ctx = SharedContext::new();
    flow.run_with(&mut ctx, &overrides).unwrap();
    assert_eq!(ctx.get_str("plain"), Some("caller"));
    assert_eq!(ctx.get_str("pinned"), Some("unit"));
}

struct Modes;

impl FlowHooks for Modes {
    fn prep(&self, _ctx: &mut SharedContext, _params: &Params) -> Result<Value> {
        Ok(json!([{ "mode": "item" }]))
    }
}

#[test]
fn test_item_params_override_flow_params() {
    let mut b = GraphBuilder::new();
    let plain = b.add(NodeDef::blocking("plain", record_mode("plain")));
    let flow = Flow::new(b.build(), plain)
        .with_param("mode", json!("flow"))
        .with_hooks(Modes)
        .batched(BatchMode::Sequential);

    let mut ctx = SharedContext::new();
    flow.run(&mut ctx).unwrap();
    assert_eq!(ctx.get_str("plain"), Some("item"));
}

#[test]
fn test_nested_flow_routes_on_inner_result() {
    let mut inner = GraphBuilder::new();
    let i1 = inner.add(NodeDef::blocking("inner1", step("inner1", "default")));
    let i2 = inner.add(NodeDef::blocking("inner2", step("inner2", "finished")));
    inner.then(i1, i2).unwrap();
    let sub = Flow::new(inner.build(), i1).named("sub");

    let mut outer = GraphBuilder::new();
    let nested = outer.add(NodeDef::flow("sub", sub));
    let after = outer.add(NodeDef::blocking("after", step("after", "default")));
    outer.with_action(nested, "finished").then(after).unwrap();
    let flow = Flow::new(outer.build(), nested);

    let mut ctx = SharedContext::new();
    let outcome = flow.run(&mut ctx).unwrap();
    assert_eq!(outcome.trace(), vec!["sub", "after"]);
    assert_eq!(log(&ctx), vec!["inner1", "inner2", "after"]);
}

struct Summary;

impl FlowHooks for Summary {
    fn post(
        &self,
        ctx: &mut SharedContext,
        _params: &Params,
        _prep: Value,
        last: Action,
    ) -> Result<Action> {
        ctx.set_str("summary", format!("ended with {}", last));
        Ok(Action::from("summarized"))
    }
}

#[test]
fn test_flow_hooks_finalize_result() {
    let flow = two_step_flow().with_hooks(Summary);
    let mut ctx = SharedContext::new();
    let outcome = flow.run(&mut ctx).unwrap();
    assert_eq!(outcome.action, "summarized");
    assert_eq!(ctx.get_str("summary"), Some("ended with default"));
}

struct Waits;

impl AsyncNode for Waits {}

#[test]
fn test_suspending_unit_rejected_by_blocking_run() {
    let mut b = GraphBuilder::new();
    let a = b.add(NodeDef::suspending("waits", Waits));
    let flow = Flow::new(b.build(), a);
    assert!(!flow.is_blocking());
    let err = flow.run(&mut SharedContext::new()).unwrap_err();
    assert!(matches!(err, FlowError::Config(_)));
}

#[test]
fn test_flow_cannot_be_computed_directly() {
    let flow = two_step_flow().named("pipeline");
    let err = Node::exec(&flow, &Value::Null, &Params::new()).unwrap_err();
    assert!(matches!(err, FlowError::NotComputable(ref name) if name == "pipeline"));
}

#[test]
fn test_flow_reusable_across_runs() {
    let flow = two_step_flow();
    for _ in 0..2 {
        let mut ctx = SharedContext::new();
        let outcome = flow.run(&mut ctx).unwrap();
        assert_eq!(outcome.trace(), vec!["n1", "n2"]);
        assert_eq!(log(&ctx), vec!["n1", "n2"]);
    }
}
