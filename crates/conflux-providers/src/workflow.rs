//! External workflow handler: trigger a run on a third-party workflow
//! service, then poll its state until it finishes.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use conflux_types::{
    duration_serde, ErrorCode, ExecutionContext, ProviderDescriptor, ProviderError, Result,
    RetryPolicy,
};

use crate::handler::ProviderHandler;
use crate::valid_resource_name;

pub const BASE_URL_ENV: &str = "CONFLUX_WORKFLOWS_BASE_URL";
pub const AUTH_TOKEN_ENV: &str = "CONFLUX_WORKFLOWS_TOKEN";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_MAX_POLLS: u64 = 30;

// ---------------------------------------------------------------------------
// Run states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Normalize the state vocabulary across workflow services.
fn parse_run_state(raw: &str) -> Option<RunState> {
    match raw.to_ascii_lowercase().as_str() {
        "pending" | "queued" => Some(RunState::Pending),
        "running" | "in_progress" => Some(RunState::Running),
        "succeeded" | "success" | "completed" => Some(RunState::Succeeded),
        "failed" | "error" | "cancelled" => Some(RunState::Failed),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// ExternalWorkflowHandler
// ---------------------------------------------------------------------------

/// Triggers `POST {base}/workflows/{name}/runs` and polls
/// `GET {base}/workflows/{name}/runs/{run_id}` until the run reaches a
/// terminal state. Input: `{workflow, payload?, poll_interval?, max_polls?}`.
///
/// The poll budget is a courtesy bound; the engine's effective timeout is
/// the hard limit either way.
#[derive(Debug)]
pub struct ExternalWorkflowHandler {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    retry: RetryPolicy,
    default_timeout: Duration,
    poll_interval: Duration,
    max_polls: u64,
}

impl ExternalWorkflowHandler {
    pub fn from_descriptor(descriptor: &ProviderDescriptor) -> Result<Self> {
        let base_url = descriptor
            .param_str("base_url")
            .map(String::from)
            .or_else(|| std::env::var(BASE_URL_ENV).ok())
            .ok_or_else(|| {
                ProviderError::load_failed(format!(
                    "workflow service base URL not configured (set params.base_url or {})",
                    BASE_URL_ENV
                ))
            })?;
        let auth_token = descriptor
            .param_str("auth_token")
            .map(String::from)
            .or_else(|| std::env::var(AUTH_TOKEN_ENV).ok());
        let poll_interval = match descriptor.param_str("poll_interval") {
            Some(raw) => duration_serde::parse_duration_str(raw).map_err(|e| {
                ProviderError::load_failed(format!("invalid poll_interval param: {}", e))
            })?,
            None => DEFAULT_POLL_INTERVAL,
        };
        let max_polls = descriptor
            .params
            .get("max_polls")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_MAX_POLLS);
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::load_failed(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
            retry: descriptor.retry.clone(),
            default_timeout: descriptor.default_timeout,
            poll_interval,
            max_polls,
        })
    }

    async fn request_json(
        &self,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
        what: &str,
    ) -> Result<serde_json::Value> {
        let request = match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::cancelled()),
            result = request.send() => result.map_err(|e| {
                if e.is_timeout() {
                    ProviderError::new(ErrorCode::Timeout, format!("{} timed out", what))
                } else {
                    ProviderError::execution(format!("{} failed: {}", what, e))
                }
            })?,
        };

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::execution(format!("{} body read failed: {}", what, e)))?;
        if !(200..300).contains(&status) {
            let snippet: String = text.chars().take(512).collect();
            return Err(
                ProviderError::execution(format!("{} returned HTTP {}", what, status))
                    .with_details(serde_json::json!({ "status": status, "body": snippet })),
            );
        }
        serde_json::from_str(&text)
            .map_err(|e| ProviderError::execution(format!("{} returned invalid JSON: {}", what, e)))
    }
}

#[async_trait]
impl ProviderHandler for ExternalWorkflowHandler {
    fn key(&self) -> &str {
        "external_workflow"
    }

    fn name(&self) -> &str {
        "External Workflow Trigger"
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
        match obj.get("workflow").and_then(|v| v.as_str()) {
            Some(name) if valid_resource_name(name) => {}
            Some(name) => return Some(format!("invalid workflow name '{}'", name)),
            None => return Some("missing required field 'workflow'".to_string()),
        }
        if let Some(interval) = obj.get("poll_interval") {
            match interval.as_str() {
                Some(raw) if duration_serde::parse_duration_str(raw).is_ok() => {}
                _ => return Some("'poll_interval' must be a duration string like \"2s\"".to_string()),
            }
        }
        if let Some(max_polls) = obj.get("max_polls") {
            match max_polls.as_u64() {
                Some(n) if n > 0 => {}
                _ => return Some("'max_polls' must be a positive integer".to_string()),
            }
        }
        None
    }

    async fn invoke(
        &self,
        context: &ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        let workflow = context
            .input
            .get("workflow")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::execution("missing 'workflow' in input"))?;
        let payload = context
            .input
            .get("payload")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let poll_interval = context
            .input
            .get("poll_interval")
            .and_then(|v| v.as_str())
            .and_then(|raw| duration_serde::parse_duration_str(raw).ok())
            .unwrap_or(self.poll_interval);
        let max_polls = context
            .input
            .get("max_polls")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.max_polls);

        // Trigger
        let trigger_url = format!("{}/workflows/{}/runs", self.base_url, workflow);
        let body = self
            .request_json(
                self.client.post(&trigger_url).json(&payload),
                &cancel,
                "workflow trigger",
            )
            .await?;
        let run_id = body
            .get("run_id")
            .or_else(|| body.get("id"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ProviderError::execution("workflow trigger response missing run id")
                    .with_details(serde_json::json!({ "workflow": workflow, "response": body }))
            })?
            .to_string();

        tracing::info!(task = %context.task_id, workflow = %workflow, run = %run_id, "Workflow run triggered");

        // Poll
        let status_url = format!("{}/workflows/{}/runs/{}", self.base_url, workflow, run_id);
        for poll in 0..max_polls {
            let status_body = self
                .request_json(self.client.get(&status_url), &cancel, "workflow status")
                .await?;
            let state_raw = status_body
                .get("state")
                .or_else(|| status_body.get("status"))
                .and_then(|v| v.as_str())
                .unwrap_or("");

            match parse_run_state(state_raw) {
                Some(RunState::Succeeded) => {
                    tracing::info!(task = %context.task_id, run = %run_id, polls = poll + 1, "Workflow run succeeded");
                    return Ok(status_body
                        .get("output")
                        .cloned()
                        .unwrap_or(serde_json::Value::Null));
                }
                Some(RunState::Failed) => {
                    return Err(ProviderError::execution(format!(
                        "workflow run '{}' finished as '{}'",
                        run_id, state_raw
                    ))
                    .with_details(serde_json::json!({
                        "run_id": run_id,
                        "state": state_raw,
                        "error": status_body.get("error"),
                    })));
                }
                Some(RunState::Pending) | Some(RunState::Running) => {
                    tracing::debug!(task = %context.task_id, run = %run_id, state = %state_raw, poll, "Workflow run still in flight");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ProviderError::cancelled()),
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
                None => {
                    return Err(ProviderError::execution(format!(
                        "workflow run '{}' reported unknown state '{}'",
                        run_id, state_raw
                    )));
                }
            }
        }

        Err(ProviderError::execution(format!(
            "workflow run '{}' did not finish within {} polls",
            run_id, max_polls
        ))
        .with_details(serde_json::json!({ "run_id": run_id, "polls": max_polls })))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::canned_http_server;

    fn descriptor_with_base(base_url: &str) -> ProviderDescriptor {
        let mut descriptor = ProviderDescriptor::for_key("external_workflow");
        descriptor
            .params
            .insert("base_url".to_string(), serde_json::json!(base_url));
        descriptor
            .params
            .insert("poll_interval".to_string(), serde_json::json!("10ms"));
        descriptor
    }

    fn handler(base_url: &str) -> ExternalWorkflowHandler {
        ExternalWorkflowHandler::from_descriptor(&descriptor_with_base(base_url)).unwrap()
    }

    // --- run state parsing ---

    #[test]
    fn run_state_vocabulary_is_normalized() {
        assert_eq!(parse_run_state("queued"), Some(RunState::Pending));
        assert_eq!(parse_run_state("RUNNING"), Some(RunState::Running));
        assert_eq!(parse_run_state("in_progress"), Some(RunState::Running));
        assert_eq!(parse_run_state("completed"), Some(RunState::Succeeded));
        assert_eq!(parse_run_state("failed"), Some(RunState::Failed));
        assert_eq!(parse_run_state("cancelled"), Some(RunState::Failed));
        assert_eq!(parse_run_state("banana"), None);
    }

    // --- construction ---

    #[test]
    fn construction_fails_without_base_url() {
        std::env::remove_var(BASE_URL_ENV);
        let err = ExternalWorkflowHandler::from_descriptor(&ProviderDescriptor::for_key(
            "external_workflow",
        ))
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::LoadFailed);
    }

    #[test]
    fn construction_rejects_bad_poll_interval() {
        let mut descriptor = descriptor_with_base("https://flows.internal");
        descriptor
            .params
            .insert("poll_interval".to_string(), serde_json::json!("whenever"));
        let err = ExternalWorkflowHandler::from_descriptor(&descriptor).unwrap_err();
        assert_eq!(err.code, ErrorCode::LoadFailed);
        assert!(err.message.contains("poll_interval"));
    }

    // --- validate ---

    #[test]
    fn validate_checks_workflow_name_and_poll_settings() {
        let handler = handler("https://flows.internal");
        assert!(handler.validate(&serde_json::json!({})).is_some());
        assert!(handler
            .validate(&serde_json::json!({"workflow": "has spaces"}))
            .is_some());
        assert!(handler
            .validate(&serde_json::json!({"workflow": "sync", "poll_interval": 500}))
            .is_some());
        assert!(handler
            .validate(&serde_json::json!({"workflow": "sync", "max_polls": 0}))
            .is_some());
        assert!(handler
            .validate(&serde_json::json!({
                "workflow": "nightly-sync",
                "poll_interval": "1s",
                "max_polls": 10
            }))
            .is_none());
    }

    // --- invoke ---

    #[tokio::test]
    async fn trigger_then_poll_until_success() {
        let base = canned_http_server(vec![
            (201, "application/json", r#"{"run_id":"r-17"}"#),
            (200, "application/json", r#"{"state":"running"}"#),
            (200, "application/json", r#"{"state":"succeeded","output":{"rows":42}}"#),
        ])
        .await;
        let ctx = ExecutionContext::new(serde_json::json!({ "workflow": "nightly-sync" }));

        let data = handler(&base)
            .invoke(&ctx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(data["rows"], 42);
    }

    #[tokio::test]
    async fn failed_run_surfaces_run_id_and_service_error() {
        let base = canned_http_server(vec![
            (201, "application/json", r#"{"run_id":"r-18"}"#),
            (200, "application/json", r#"{"state":"failed","error":"step 3 crashed"}"#),
        ])
        .await;
        let ctx = ExecutionContext::new(serde_json::json!({ "workflow": "nightly-sync" }));

        let err = handler(&base)
            .invoke(&ctx, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ExecutionFailed);
        let details = err.details.unwrap();
        assert_eq!(details["run_id"], "r-18");
        assert_eq!(details["error"], "step 3 crashed");
    }

    #[tokio::test]
    async fn trigger_response_without_run_id_is_an_error() {
        let base = canned_http_server(vec![(200, "application/json", r#"{"accepted":true}"#)]).await;
        let ctx = ExecutionContext::new(serde_json::json!({ "workflow": "nightly-sync" }));

        let err = handler(&base)
            .invoke(&ctx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.message.contains("run id"));
    }

    #[tokio::test]
    async fn poll_budget_exhaustion_is_an_error() {
        let base = canned_http_server(vec![
            (201, "application/json", r#"{"run_id":"r-19"}"#),
            (200, "application/json", r#"{"state":"running"}"#),
            (200, "application/json", r#"{"state":"running"}"#),
        ])
        .await;
        let ctx = ExecutionContext::new(serde_json::json!({
            "workflow": "nightly-sync",
            "max_polls": 2
        }));

        let err = handler(&base)
            .invoke(&ctx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.message.contains("2 polls"));
        assert_eq!(err.details.unwrap()["run_id"], "r-19");
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_poll_sleep() {
        let base = canned_http_server(vec![
            (201, "application/json", r#"{"run_id":"r-20"}"#),
            (200, "application/json", r#"{"state":"running"}"#),
        ])
        .await;
        let ctx = ExecutionContext::new(serde_json::json!({
            "workflow": "nightly-sync",
            "poll_interval": "60s"
        }));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = handler(&base).invoke(&ctx, cancel).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
