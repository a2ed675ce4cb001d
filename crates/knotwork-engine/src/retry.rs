use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{error, warn};

use knotwork_core::config::RetryConfig;
use knotwork_core::error::{FlowError, Result};

/// Bounded retry for a unit's compute phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    wait: Duration,
}

impl RetryPolicy {
    /// `max_attempts` counts the first attempt and must be at least 1.
    pub fn new(max_attempts: u32, wait: Duration) -> Result<Self> {
        if max_attempts == 0 {
            return Err(FlowError::InvalidRetry(
                "max_attempts must be at least 1".into(),
            ));
        }
        Ok(Self { max_attempts, wait })
    }

    /// A single attempt with no wait.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            wait: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}

impl TryFrom<&RetryConfig> for RetryPolicy {
    type Error = FlowError;

    fn try_from(config: &RetryConfig) -> Result<Self> {
        Self::new(config.max_attempts, config.wait())
    }
}

/// A compute result together with how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Computed {
    pub value: Value,
    pub attempts: u32,
    pub fell_back: bool,
}

/// What to do after a failed attempt.
enum Next {
    Retry(Duration),
    Fallback,
    Abort,
}

fn after_failure(node: &str, policy: &RetryPolicy, attempt: u32, error: &FlowError) -> Next {
    if matches!(error, FlowError::NotComputable(_)) {
        return Next::Abort;
    }
    if !error.is_retryable() {
        warn!(
            node,
            attempt = attempt + 1,
            error = %error,
            "Compute error is not retryable, falling back"
        );
        return Next::Fallback;
    }
    if attempt + 1 < policy.max_attempts {
        warn!(
            node,
            attempt = attempt + 1,
            max_attempts = policy.max_attempts,
            wait_ms = policy.wait.as_millis() as u64,
            error = %error,
            "Retrying compute"
        );
        Next::Retry(policy.wait)
    } else {
        Next::Fallback
    }
}

fn fallback_failed(node: &str, source: FlowError) -> FlowError {
    error!(node, error = %source, "Fallback failed");
    FlowError::Fallback {
        node: node.to_string(),
        source: Box::new(source),
    }
}

/// Drive the retry state machine with blocking waits.
pub(crate) fn retry_blocking<E, F>(
    node: &str,
    policy: &RetryPolicy,
    mut exec: E,
    fallback: F,
) -> Result<Computed>
where
    E: FnMut() -> Result<Value>,
    F: FnOnce(FlowError) -> Result<Value>,
{
    let mut attempt = 0;
    loop {
        let err = match exec() {
            Ok(value) => {
                return Ok(Computed {
                    value,
                    attempts: attempt + 1,
                    fell_back: false,
                })
            }
            Err(e) => e,
        };
        match after_failure(node, policy, attempt, &err) {
            Next::Retry(wait) => {
                if !wait.is_zero() {
                    std::thread::sleep(wait);
                }
                attempt += 1;
            }
            Next::Fallback => {
                let value = fallback(err).map_err(|e| fallback_failed(node, e))?;
                return Ok(Computed {
                    value,
                    attempts: attempt + 1,
                    fell_back: true,
                });
            }
            Next::Abort => return Err(err),
        }
    }
}

/// Drive the retry state machine, suspending on the timer between attempts.
pub(crate) async fn retry_async<'a, E, F>(
    node: &str,
    policy: &RetryPolicy,
    mut exec: E,
    fallback: F,
) -> Result<Computed>
where
    E: FnMut() -> BoxFuture<'a, Result<Value>>,
    F: FnOnce(FlowError) -> BoxFuture<'a, Result<Value>>,
{
    let mut attempt = 0;
    loop {
        let err = match exec().await {
            Ok(value) => {
                return Ok(Computed {
                    value,
                    attempts: attempt + 1,
                    fell_back: false,
                })
            }
            Err(e) => e,
        };
        match after_failure(node, policy, attempt, &err) {
            Next::Retry(wait) => {
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                attempt += 1;
            }
            Next::Fallback => {
                let value = fallback(err).await.map_err(|e| fallback_failed(node, e))?;
                return Ok(Computed {
                    value,
                    attempts: attempt + 1,
                    fell_back: true,
                });
            }
            Next::Abort => return Err(err),
        }
    }
}
