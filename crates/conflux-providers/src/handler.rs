//! Provider handler contract and the object-safe dynamic dispatch wrapper.

use std::time::Duration;

use async_trait::async_trait;

use conflux_types::{ExecutionContext, Result, RetryPolicy};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// ProviderHandler trait
// ---------------------------------------------------------------------------

/// The contract every integration must satisfy.
///
/// Implementations own their transport (HTTP client, credentials) and any
/// handler-local state that should persist across invocations — the loader
/// caches one instance per key, so counters such as circuit-breaker state
/// survive between calls.
#[async_trait]
pub trait ProviderHandler: Send + Sync {
    /// The whitelist key this handler is registered under (e.g. "http_endpoint").
    fn key(&self) -> &str;

    /// Human-readable display name.
    fn name(&self) -> &str;

    /// Retry configuration for this instance, fixed at construction.
    fn retry_policy(&self) -> &RetryPolicy;

    /// Timeout applied when the context carries no override.
    fn default_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Check the input payload before any attempt is made. A returned message
    /// means the input is invalid and no attempt will be consumed.
    fn validate(&self, input: &serde_json::Value) -> Option<String>;

    /// The core integration logic for one attempt. `cancel` is the engine's
    /// merged cancellation source (timeout + caller token); multi-step
    /// handlers must observe it between steps.
    async fn invoke(
        &self,
        context: &ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value>;

    /// Liveness check run once at load time, before the instance is cached.
    async fn health_check(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// DynProvider — object-safe wrapper
// ---------------------------------------------------------------------------

pub struct DynProvider(Box<dyn ProviderHandler>);

impl std::fmt::Debug for DynProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynProvider")
            .field("key", &self.0.key())
            .field("name", &self.0.name())
            .finish()
    }
}

impl DynProvider {
    pub fn new(handler: impl ProviderHandler + 'static) -> Self {
        Self(Box::new(handler))
    }

    pub fn key(&self) -> &str {
        self.0.key()
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.0.retry_policy()
    }

    pub fn default_timeout(&self) -> Duration {
        self.0.default_timeout()
    }

    pub fn validate(&self, input: &serde_json::Value) -> Option<String> {
        self.0.validate(input)
    }

    pub async fn invoke(
        &self,
        context: &ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        self.0.invoke(context, cancel).await
    }

    pub async fn health_check(&self) -> bool {
        self.0.health_check().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
