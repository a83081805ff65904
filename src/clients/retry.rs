//! Deadline and retry policy for remote model calls.
//!
//! Every call runs under a model-class deadline: models matched by the
//! thinking-class prefix list get ten minutes, everything else two. The
//! retry budget depends on the failure kind: rate limits back off
//! exponentially with jitter (up to five attempts), content filters get
//! two short retries, max-tokens and unknown failures are surfaced
//! immediately.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Completion, CompletionRequest, LlmClient};
use crate::errors::LlmError;

/// Model-id prefixes treated as "thinking-class" for timeout purposes.
/// This is a substring heuristic; provider metadata would be better once
/// it exists.
pub const THINKING_MODEL_PREFIXES: &[&str] =
    &["o1", "o3", "o4-mini", "deepseek-r1", "qwq", "gpt-5"];

const THINKING_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

pub fn is_thinking_class(model_id: &str) -> bool {
    let id = model_id.to_ascii_lowercase();
    THINKING_MODEL_PREFIXES.iter().any(|p| id.starts_with(p)) || id.contains("-thinking")
}

/// Per-call deadline for a model.
pub fn call_timeout(model_id: &str) -> Duration {
    if is_thinking_class(model_id) {
        THINKING_TIMEOUT
    } else {
        DEFAULT_TIMEOUT
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_rate_limit_retries: u32,
    pub max_content_filter_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: 5,
            max_content_filter_retries: 2,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given attempt (1-based) with ±20%
    /// jitter, capped at `max_backoff`.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_backoff);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        exp.mul_f64(jitter)
    }
}

/// Issue a completion under the model's deadline, retrying per policy.
/// Cancellation wins over any pending retry or in-flight call.
pub async fn complete_with_retry(
    client: &Arc<dyn LlmClient>,
    request: CompletionRequest,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Completion, LlmError> {
    let budget = call_timeout(client.model_id());
    let mut rate_limit_attempts = 0u32;
    let mut content_filter_attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
            timed = tokio::time::timeout(budget, client.complete(request.clone(), cancel)) => {
                match timed {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout {
                        budget_secs: budget.as_secs(),
                    }),
                }
            }
        };

        match outcome {
            Ok(completion) => return Ok(completion),
            Err(LlmError::RateLimited { retry_after_ms })
                if rate_limit_attempts < policy.max_rate_limit_retries =>
            {
                rate_limit_attempts += 1;
                let wait = retry_after_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| policy.backoff(rate_limit_attempts));
                debug!(
                    model = client.model_id(),
                    attempt = rate_limit_attempts,
                    wait_ms = wait.as_millis() as u64,
                    "rate limited, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            Err(LlmError::ContentFilter)
                if content_filter_attempts < policy.max_content_filter_retries =>
            {
                content_filter_attempts += 1;
                debug!(
                    model = client.model_id(),
                    attempt = content_filter_attempts,
                    "content filtered, short retry"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
            }
            Err(err) => {
                if !matches!(err, LlmError::Cancelled) {
                    warn!(model = client.model_id(), error = %err, "model call failed");
                }
                return Err(err);
            }
        }
    }
}
