//! The template algorithm applied uniformly around any handler's core logic.
//!
//! One `execute` call is one logical async flow: validate, derive the merged
//! cancellation source, then run strictly sequential attempts with
//! interruptible backoff in between. Attempts within a call never overlap;
//! distinct calls share nothing but the loader's cache.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use conflux_providers::DynProvider;
use conflux_types::{ExecutionContext, ExecutionResult, ProviderError, RetryPolicy};

// ---------------------------------------------------------------------------
// execute
// ---------------------------------------------------------------------------

/// Run `handler`'s core logic under the engine's execution envelope.
///
/// Never returns an error: bad input, cooperative handler failures,
/// timeouts, and exhausted retries all come back as a failed
/// [`ExecutionResult`] with a classified code. `durationMeasured` covers the
/// full wall-clock span, backoff waits included.
pub async fn execute(handler: &DynProvider, context: ExecutionContext) -> ExecutionResult {
    let started = Instant::now();

    // 1. Validation: rejection consumes no attempts.
    if let Some(message) = handler.validate(&context.input) {
        tracing::warn!(
            task = %context.task_id,
            provider = %handler.key(),
            %message,
            "Input rejected by validation"
        );
        return ExecutionResult::err(ProviderError::validation(message), started.elapsed())
            .with_metadata(context.metadata);
    }

    // 2. Merged cancellation: one source fired by whichever of the timeout
    //    timer and the caller's token goes first, irreversibly. The handler
    //    only ever sees children of this source, never the raw caller token.
    let effective_timeout = context
        .timeout_override
        .unwrap_or_else(|| handler.default_timeout());
    let merged = match &context.cancellation {
        Some(token) => token.child_token(),
        None => CancellationToken::new(),
    };
    let timer = tokio::spawn({
        let merged = merged.clone();
        async move {
            tokio::time::sleep(effective_timeout).await;
            merged.cancel();
        }
    });

    // 3. Retry loop.
    let policy = handler.retry_policy().clone();
    let outcome = run_attempts(handler, &context, &policy, &merged, effective_timeout).await;
    timer.abort();

    // 4. One result, duration stamped on every path.
    let duration = started.elapsed();
    let result = match outcome {
        Ok(data) => ExecutionResult::ok(data, duration),
        Err(error) => ExecutionResult::err(error, duration),
    };
    result.with_metadata(context.metadata)
}

/// Strictly sequential attempts `0..=max_retries` with interruptible backoff.
async fn run_attempts(
    handler: &DynProvider,
    context: &ExecutionContext,
    policy: &RetryPolicy,
    merged: &CancellationToken,
    budget: Duration,
) -> Result<serde_json::Value, ProviderError> {
    let mut attempt = 0u32;
    loop {
        let invoked = tokio::select! {
            biased;
            _ = merged.cancelled() => Err(ProviderError::timed_out(budget)),
            result = handler.invoke(context, merged.child_token()) => result,
        };

        let error = match invoked {
            Ok(data) => {
                if attempt > 0 {
                    tracing::info!(
                        task = %context.task_id,
                        provider = %handler.key(),
                        attempt,
                        "Retry succeeded"
                    );
                }
                return Ok(data);
            }
            Err(error) => error,
        };

        // Cancellation takes priority over whatever code the handler reported.
        if merged.is_cancelled() {
            tracing::warn!(
                task = %context.task_id,
                provider = %handler.key(),
                attempt,
                "Execution cancelled mid-attempt"
            );
            return Err(ProviderError::timed_out(budget));
        }

        if !policy.is_retryable(error.code) {
            tracing::warn!(
                task = %context.task_id,
                provider = %handler.key(),
                code = %error.code,
                "Non-retryable failure"
            );
            return Err(error);
        }

        if attempt >= policy.max_retries {
            tracing::warn!(
                task = %context.task_id,
                provider = %handler.key(),
                attempts = attempt + 1,
                "Retry budget exhausted"
            );
            return Err(ProviderError::retries_exhausted(attempt + 1, &error));
        }

        let delay = policy.backoff_delay(attempt + 1);
        tracing::info!(
            task = %context.task_id,
            provider = %handler.key(),
            attempt,
            delay_ms = %delay.as_millis(),
            "Retryable failure, backing off"
        );
        tokio::select! {
            biased;
            _ = merged.cancelled() => return Err(ProviderError::timed_out(budget)),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
