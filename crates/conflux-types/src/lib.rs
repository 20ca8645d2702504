//! Shared types for the Conflux provider execution subsystem.
//!
//! This crate provides the foundational types used across all other Conflux crates:
//! - `ProviderError` / `ErrorCode` — the closed failure taxonomy
//! - `ExecutionContext` — per-invocation input, cancellation, and metadata
//! - `ExecutionResult` — the uniform result shape returned by the engine
//! - `RetryPolicy` — bounded exponential backoff configuration
//! - `ProviderDescriptor` — configuration record for a registered provider

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// ErrorCode — closed set of classified failure kinds
// ---------------------------------------------------------------------------

/// Classified failure codes shared by the loader and the execution engine.
///
/// The set is closed: orchestrators switch on these codes for UI and logging
/// decisions, so new codes are a reviewed API change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Requested provider key is outside the whitelist (loader).
    NotAllowed,
    /// Provider construction or structural verification failed (loader).
    LoadFailed,
    /// Provider failed its liveness check during loading (loader).
    Unhealthy,
    /// Input rejected by the handler's validation, no attempt consumed (engine).
    ValidationFailed,
    /// The merged cancellation source fired: timeout or caller cancellation (engine).
    Timeout,
    /// The handler's core logic failed (engine).
    ExecutionFailed,
    /// Every attempt failed with a retryable code and the budget ran out (engine).
    MaxRetriesExceeded,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotAllowed => "not_allowed",
            ErrorCode::LoadFailed => "load_failed",
            ErrorCode::Unhealthy => "unhealthy",
            ErrorCode::ValidationFailed => "validation_failed",
            ErrorCode::Timeout => "timeout",
            ErrorCode::ExecutionFailed => "execution_failed",
            ErrorCode::MaxRetriesExceeded => "max_retries_exceeded",
        }
    }

    /// Whether this code is eligible for retry under a policy that lists no
    /// explicit codes. Retrying a malformed request or one that already spent
    /// its time budget burns attempts for nothing, so those two are excluded.
    pub fn retryable_by_default(&self) -> bool {
        !matches!(self, ErrorCode::Timeout | ErrorCode::ValidationFailed)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ProviderError
// ---------------------------------------------------------------------------

/// A classified provider failure: code, operator-facing message, and
/// free-form structured details kept for logs rather than end-user display.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct ProviderError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ProviderError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Loader rejection for a key outside the whitelist. Details carry the
    /// attempted key and the full allowed set — safe diagnostics, nothing
    /// sensitive.
    pub fn not_allowed(attempted: &str, allowed: &[&str]) -> Self {
        Self::new(
            ErrorCode::NotAllowed,
            format!("provider '{}' is not in the whitelist", attempted),
        )
        .with_details(serde_json::json!({
            "attempted": attempted,
            "allowed": allowed,
        }))
    }

    pub fn load_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::LoadFailed, message)
    }

    pub fn unhealthy(key: &str) -> Self {
        Self::new(
            ErrorCode::Unhealthy,
            format!("provider '{}' failed its liveness check", key),
        )
        .with_details(serde_json::json!({ "provider": key }))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExecutionFailed, message)
    }

    /// Raised by a handler that observed the merged token mid-flight. The
    /// engine reports the same `Timeout` code for its own cancellation path,
    /// so handlers cannot distinguish timeout from external cancellation.
    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Timeout, "operation cancelled")
    }

    pub fn timed_out(budget: Duration) -> Self {
        Self::new(
            ErrorCode::Timeout,
            "execution timed out or was cancelled by the caller",
        )
        .with_details(serde_json::json!({ "budget_ms": budget.as_millis() as u64 }))
    }

    /// Terminal error after the attempt budget is exhausted purely by count.
    /// The last classified failure is preserved in the details.
    pub fn retries_exhausted(attempts: u32, last: &ProviderError) -> Self {
        Self::new(
            ErrorCode::MaxRetriesExceeded,
            format!("all {} attempts failed: {}", attempts, last.message),
        )
        .with_details(serde_json::json!({
            "attempts": attempts,
            "last_error": { "code": last.code, "message": last.message },
        }))
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::new(ErrorCode::ExecutionFailed, format!("JSON error: {}", err))
    }
}

/// A convenience alias for `Result<T, ProviderError>`.
pub type Result<T> = std::result::Result<T, ProviderError>;

// ---------------------------------------------------------------------------
// Duration serde helpers
// ---------------------------------------------------------------------------

/// Human-readable duration strings for configuration files: `"250ms"`,
/// `"30s"`, `"5m"`, `"1h"`. Serializes back as milliseconds.
pub mod duration_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration_str(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse_duration_str(s: &str) -> std::result::Result<Duration, String> {
        if let Some(val) = s.strip_suffix("ms") {
            let n: u64 = val.parse().map_err(|e| format!("invalid duration: {}", e))?;
            Ok(Duration::from_millis(n))
        } else if let Some(val) = s.strip_suffix('s') {
            let n: u64 = val.parse().map_err(|e| format!("invalid duration: {}", e))?;
            Ok(Duration::from_secs(n))
        } else if let Some(val) = s.strip_suffix('m') {
            let n: u64 = val.parse().map_err(|e| format!("invalid duration: {}", e))?;
            Ok(Duration::from_secs(n * 60))
        } else if let Some(val) = s.strip_suffix('h') {
            let n: u64 = val.parse().map_err(|e| format!("invalid duration: {}", e))?;
            Ok(Duration::from_secs(n * 3600))
        } else {
            Err(format!("unknown duration format: {}", s))
        }
    }
}

/// Integer-milliseconds duration encoding for the telemetry wire shape.
pub mod duration_ms {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff configuration, fixed per handler instance at
/// construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the initial attempt; 3 means up to 4 invocations total.
    pub max_retries: u32,
    #[serde(with = "duration_serde")]
    pub initial_delay: Duration,
    #[serde(with = "duration_serde")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Codes eligible for retry. Empty means every code except `Timeout` and
    /// `ValidationFailed`.
    pub retryable_codes: Vec<ErrorCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            retryable_codes: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry attempt `attempt` (1-indexed):
    /// `min(initial_delay * multiplier^(attempt-1), max_delay)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(63) as i32;
        let raw = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn is_retryable(&self, code: ErrorCode) -> bool {
        if self.retryable_codes.is_empty() {
            code.retryable_by_default()
        } else {
            self.retryable_codes.contains(&code)
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Per-invocation context created by the orchestrator and consumed by the
/// engine. The engine derives its own merged cancellation source from
/// `cancellation`; handlers never see the raw caller token.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Opaque correlation id, present in every log line for this call.
    pub task_id: String,
    /// Handler-specific payload.
    pub input: serde_json::Value,
    /// Caller-supplied cancellation, e.g. an upstream request abort.
    pub cancellation: Option<CancellationToken>,
    /// Overrides the handler's default timeout for this call only.
    pub timeout_override: Option<Duration>,
    /// Free-form key/value pairs, echoed into the result.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExecutionContext {
    pub fn new(input: serde_json::Value) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            input,
            cancellation: None,
            timeout_override: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// The uniform result of one `execute` call. Produced exactly once per call,
/// never partially populated: `data` is present iff `success`, `error` iff
/// not.
///
/// Serializes to the camelCase telemetry shape:
/// `{success, data?, error?: {code, message, details?}, durationMeasured, metadata?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProviderError>,
    /// Wall-clock span of the whole call, backoff waits included.
    #[serde(rename = "durationMeasured", with = "duration_ms")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExecutionResult {
    pub fn ok(data: serde_json::Value, duration: Duration) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            duration,
            metadata: HashMap::new(),
        }
    }

    pub fn err(error: ProviderError, duration: Duration) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            duration,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// The classified code of a failed result, `None` on success.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

// ---------------------------------------------------------------------------
// ProviderDescriptor
// ---------------------------------------------------------------------------

/// Configuration record for one registered provider: which whitelist key to
/// load and which runtime parameters to construct it with. Supplied by
/// configuration; never the source of the whitelist itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_provider_timeout", with = "duration_serde")]
    pub default_timeout: Duration,
    /// Handler-specific construction parameters (base URLs, auth, …).
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

fn default_provider_timeout() -> Duration {
    Duration::from_secs(30)
}

impl ProviderDescriptor {
    /// A descriptor with defaults for every runtime parameter.
    pub fn for_key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: None,
            retry: RetryPolicy::default(),
            default_timeout: default_provider_timeout(),
            params: HashMap::new(),
        }
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// LoaderStats
// ---------------------------------------------------------------------------

/// Monotonic loader counters plus a cache snapshot, for operational tooling.
#[derive(Debug, Clone, Serialize)]
pub struct LoaderStats {
    pub load_count: u64,
    pub cache_hit_count: u64,
    pub error_count: u64,
    pub cache_size: usize,
    pub cached_keys: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
