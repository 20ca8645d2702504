//! Cloud function invocation handler: POST a payload to a deployed function
//! by name and surface its JSON result.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use conflux_types::{
    ErrorCode, ExecutionContext, ProviderDescriptor, ProviderError, Result, RetryPolicy,
};

use crate::handler::ProviderHandler;
use crate::valid_resource_name;

pub const BASE_URL_ENV: &str = "CONFLUX_FUNCTIONS_BASE_URL";
pub const AUTH_TOKEN_ENV: &str = "CONFLUX_FUNCTIONS_TOKEN";

// ---------------------------------------------------------------------------
// CloudFunctionHandler
// ---------------------------------------------------------------------------

/// Invokes `{base}/functions/{name}:invoke`. Input: `{function, payload?}`.
///
/// The base URL comes from descriptor params (`base_url`) or the environment;
/// a missing base URL is a construction failure, while one that does not
/// parse as an http(s) URL fails the load-time liveness check instead.
#[derive(Debug)]
pub struct CloudFunctionHandler {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    retry: RetryPolicy,
    default_timeout: Duration,
}

impl CloudFunctionHandler {
    pub fn from_descriptor(descriptor: &ProviderDescriptor) -> Result<Self> {
        let base_url = descriptor
            .param_str("base_url")
            .map(String::from)
            .or_else(|| std::env::var(BASE_URL_ENV).ok())
            .ok_or_else(|| {
                ProviderError::load_failed(format!(
                    "cloud function base URL not configured (set params.base_url or {})",
                    BASE_URL_ENV
                ))
            })?;
        let auth_token = descriptor
            .param_str("auth_token")
            .map(String::from)
            .or_else(|| std::env::var(AUTH_TOKEN_ENV).ok());
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::load_failed(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
            retry: descriptor.retry.clone(),
            default_timeout: descriptor.default_timeout,
        })
    }
}

#[async_trait]
impl ProviderHandler for CloudFunctionHandler {
    fn key(&self) -> &str {
        "cloud_function"
    }

    fn name(&self) -> &str {
        "Cloud Function Invocation"
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn validate(&self, input: &serde_json::Value) -> Option<String> {
        let obj = match input.as_object() {
            Some(obj) => obj,
            None => return Some("input must be a JSON object".to_string()),
        };
        match obj.get("function").and_then(|v| v.as_str()) {
            Some(name) if valid_resource_name(name) => None,
            Some(name) => Some(format!("invalid function name '{}'", name)),
            None => Some("missing required field 'function'".to_string()),
        }
    }

    async fn invoke(
        &self,
        context: &ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        let function = context
            .input
            .get("function")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::execution("missing 'function' in input"))?;
        let payload = context
            .input
            .get("payload")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let url = format!("{}/functions/{}:invoke", self.base_url, function);

        tracing::info!(task = %context.task_id, function = %function, "Invoking cloud function");

        let mut request = self.client.post(&url).json(&payload);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::cancelled()),
            result = request.send() => result.map_err(|e| {
                if e.is_timeout() {
                    ProviderError::new(ErrorCode::Timeout, format!("function '{}' timed out", function))
                } else {
                    ProviderError::execution(format!("function '{}' request failed: {}", function, e))
                }
            })?,
        };

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::execution(format!("failed to read function response: {}", e)))?;

        if !(200..300).contains(&status) {
            let snippet: String = text.chars().take(512).collect();
            return Err(ProviderError::execution(format!(
                "function '{}' returned HTTP {}",
                function, status
            ))
            .with_details(serde_json::json!({
                "function": function,
                "status": status,
                "body": snippet,
            })));
        }

        let result = serde_json::from_str::<serde_json::Value>(&text)
            .unwrap_or(serde_json::Value::String(text));
        tracing::info!(task = %context.task_id, function = %function, status, "Cloud function completed");
        Ok(result)
    }

    async fn health_check(&self) -> bool {
        match reqwest::Url::parse(&self.base_url) {
            Ok(url) => matches!(url.scheme(), "http" | "https"),
            Err(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
