use futures::future::BoxFuture;
use serde_json::Value;

use knotwork_core::context::{Params, SharedContext};
use knotwork_core::error::{FlowError, Result};
use knotwork_core::types::Action;

/// Unit of work with a blocking three-phase lifecycle.
///
/// `prep` reads the shared context and produces the compute input, `exec` does the
/// work (and is the only phase subject to retry), `post` writes results back and
/// returns the outcome key that selects the next unit.
pub trait Node: Send + Sync + 'static {
    fn prep(&self, ctx: &mut SharedContext, params: &Params) -> Result<Value> {
        let _ = (ctx, params);
        Ok(Value::Null)
    }

    /// Compute phase. For batch units this is called once per prepared item.
    fn exec(&self, input: &Value, params: &Params) -> Result<Value> {
        let _ = (input, params);
        Ok(Value::Null)
    }

    /// Called once, with the final error, after every attempt has failed.
    ///
    /// The returned value stands in for a successful compute result.
    fn exec_fallback(&self, input: &Value, params: &Params, error: FlowError) -> Result<Value> {
        let _ = (input, params);
        Err(error)
    }

    fn post(
        &self,
        ctx: &mut SharedContext,
        params: &Params,
        prep: Value,
        exec: Value,
    ) -> Result<Action> {
        let _ = (ctx, params, prep, exec);
        Ok(Action::default())
    }
}

/// Unit of work whose phases may suspend on external completion.
pub trait AsyncNode: Send + Sync + 'static {
    fn prep<'a>(
        &'a self,
        ctx: &'a mut SharedContext,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Value>> {
        let _ = (ctx, params);
        Box::pin(async { Ok(Value::Null) })
    }

    fn exec<'a>(&'a self, input: &'a Value, params: &'a Params) -> BoxFuture<'a, Result<Value>> {
        let _ = (input, params);
        Box::pin(async { Ok(Value::Null) })
    }

    fn exec_fallback<'a>(
        &'a self,
        input: &'a Value,
        params: &'a Params,
        error: FlowError,
    ) -> BoxFuture<'a, Result<Value>> {
        let _ = (input, params);
        Box::pin(async move { Err(error) })
    }

    fn post<'a>(
        &'a self,
        ctx: &'a mut SharedContext,
        params: &'a Params,
        prep: Value,
        exec: Value,
    ) -> BoxFuture<'a, Result<Action>> {
        let _ = (ctx, params, prep, exec);
        Box::pin(async { Ok(Action::default()) })
    }
}

/// A unit whose whole job is a closure over the shared context.
///
/// The closure runs in the finalize phase, so it never retries.
pub struct FnNode<F> {
    f: F,
}

impl<F> FnNode<F>
where
    F: Fn(&mut SharedContext, &Params) -> Result<Action> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Node for FnNode<F>
where
    F: Fn(&mut SharedContext, &Params) -> Result<Action> + Send + Sync + 'static,
{
    fn post(
        &self,
        ctx: &mut SharedContext,
        params: &Params,
        _prep: Value,
        _exec: Value,
    ) -> Result<Action> {
        (self.f)(ctx, params)
    }
}
