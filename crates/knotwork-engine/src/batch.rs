//! Helpers shared by the sequential and parallel batch forms.

use std::num::NonZeroUsize;

use serde_json::Value;
use tracing::{dispatcher, Span};

use knotwork_core::context::{Params, SharedContext};
use knotwork_core::error::{FlowError, Result};

use crate::retry::Computed;

/// Items a batch unit's prepare phase produced. `null` means no items.
pub(crate) fn batch_items<'v>(unit: &str, prep: &'v Value) -> Result<&'v [Value]> {
    match prep {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(&[]),
        other => Err(FlowError::Config(format!(
            "batch unit '{}' must prepare an array, got {}",
            unit,
            kind_of(other)
        ))),
    }
}

/// Per-item param overrides a batch flow's prepare hook produced.
pub(crate) fn item_overrides(flow: &str, prep: &Value) -> Result<Vec<Params>> {
    batch_items(flow, prep)?
        .iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(map) => Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            other => Err(FlowError::Config(format!(
                "batch flow '{}' item {} must be an object of params, got {}",
                flow,
                i,
                kind_of(other)
            ))),
        })
        .collect()
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Items in flight for a parallel batch of `len` items.
pub(crate) fn concurrency(limit: Option<NonZeroUsize>, len: usize) -> usize {
    limit.map_or(len, NonZeroUsize::get).max(1)
}

/// Compute output of a unit, with retry bookkeeping summed over items.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ExecOutput {
    pub value: Value,
    pub attempts: u32,
    pub fallbacks: u32,
}

impl From<Computed> for ExecOutput {
    fn from(c: Computed) -> Self {
        Self {
            value: c.value,
            attempts: c.attempts,
            fallbacks: u32::from(c.fell_back),
        }
    }
}

impl ExecOutput {
    /// Collect per-item results, keeping input order.
    pub(crate) fn from_batch(results: Vec<Computed>) -> Self {
        let attempts = results.iter().map(|c| c.attempts).sum();
        let fallbacks = results.iter().filter(|c| c.fell_back).count() as u32;
        Self {
            value: Value::Array(results.into_iter().map(|c| c.value).collect()),
            attempts,
            fallbacks,
        }
    }
}

/// Run `f` over `items` on scoped threads, at most `limit` at a time.
///
/// Output is in input order. Every item in a window runs to completion before
/// the first failure is reported. Each thread runs inside the caller's span.
pub(crate) fn scoped_map<T, R, F>(
    items: &mut [T],
    limit: Option<NonZeroUsize>,
    f: F,
) -> Result<Vec<R>>
where
    T: Send,
    R: Send,
    F: Fn(usize, &mut T) -> R + Sync,
{
    let width = concurrency(limit, items.len());
    let f = &f;
    let dispatch = dispatcher::get_default(|d| d.clone());
    let span = Span::current();
    let (dispatch, span) = (&dispatch, &span);
    let mut out = Vec::with_capacity(items.len());
    for (window, chunk) in items.chunks_mut(width).enumerate() {
        let offset = window * width;
        let joined: Vec<std::thread::Result<R>> = std::thread::scope(|s| {
            let handles: Vec<_> = chunk
                .iter_mut()
                .enumerate()
                .map(|(i, item)| {
                    s.spawn(move || {
                        dispatcher::with_default(dispatch, || {
                            let _enter = span.enter();
                            f(offset + i, item)
                        })
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join()).collect()
        });
        for (i, result) in joined.into_iter().enumerate() {
            let value = result
                .map_err(|_| FlowError::Join(format!("item {} panicked", offset + i)))?;
            out.push(value);
        }
    }
    Ok(out)
}

/// Fold isolated branch contexts back into `ctx` in input order.
///
/// Only keys a branch inserted, changed, or removed are applied, so a later
/// branch overrides an earlier one only where both wrote.
pub(crate) fn merge_branches(
    ctx: &mut SharedContext,
    snapshot: &SharedContext,
    branches: impl IntoIterator<Item = SharedContext>,
) {
    for branch in branches {
        ctx.apply(branch.delta_since(snapshot));
    }
}
