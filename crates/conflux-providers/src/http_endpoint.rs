//! Generic HTTP endpoint handler: one arbitrary HTTP call per invocation.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use conflux_types::{ExecutionContext, ProviderDescriptor, ProviderError, Result, RetryPolicy};

use crate::handler::ProviderHandler;

const KNOWN_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"];

// ---------------------------------------------------------------------------
// HttpEndpointHandler
// ---------------------------------------------------------------------------

/// Calls an arbitrary HTTP(S) endpoint described entirely by the input
/// payload: `{url, method?, headers?, query?, body?}`.
pub struct HttpEndpointHandler {
    client: reqwest::Client,
    retry: RetryPolicy,
    default_timeout: Duration,
}

impl HttpEndpointHandler {
    pub fn from_descriptor(descriptor: &ProviderDescriptor) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(user_agent) = descriptor.param_str("user_agent") {
            builder = builder.user_agent(user_agent.to_string());
        }
        let client = builder
            .build()
            .map_err(|e| ProviderError::load_failed(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            retry: descriptor.retry.clone(),
            default_timeout: descriptor.default_timeout,
        })
    }
}

fn parse_method(method: &str) -> Option<reqwest::Method> {
    let upper = method.to_ascii_uppercase();
    if KNOWN_METHODS.contains(&upper.as_str()) {
        reqwest::Method::from_bytes(upper.as_bytes()).ok()
    } else {
        None
    }
}

fn transport_error(err: reqwest::Error, url: &str) -> ProviderError {
    if err.is_timeout() {
        ProviderError::new(
            conflux_types::ErrorCode::Timeout,
            format!("request to {} timed out", url),
        )
    } else {
        ProviderError::execution(format!("request to {} failed: {}", url, err))
            .with_details(serde_json::json!({ "url": url }))
    }
}

#[async_trait]
impl ProviderHandler for HttpEndpointHandler {
    fn key(&self) -> &str {
        "http_endpoint"
    }

    fn name(&self) -> &str {
        "Generic HTTP Endpoint"
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

        let url = match obj.get("url").and_then(|v| v.as_str()) {
            Some(url) if !url.is_empty() => url,
            _ => return Some("missing required field 'url'".to_string()),
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Some(format!("'{}' is not an http(s) URL", url));
        }

        if let Some(method) = obj.get("method") {
            match method.as_str() {
                Some(m) if parse_method(m).is_some() => {}
                Some(m) => return Some(format!("unsupported HTTP method '{}'", m)),
                None => return Some("'method' must be a string".to_string()),
            }
        }

        if let Some(headers) = obj.get("headers") {
            match headers.as_object() {
                Some(map) if map.values().all(|v| v.is_string()) => {}
                _ => return Some("'headers' must be an object of string values".to_string()),
            }
        }

        if let Some(query) = obj.get("query") {
            if !query.is_object() {
                return Some("'query' must be an object".to_string());
            }
        }

        None
    }

    async fn invoke(
        &self,
        context: &ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        let input = &context.input;
        let url = input
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::execution("missing 'url' in input"))?;
        let method_str = input.get("method").and_then(|v| v.as_str()).unwrap_or("GET");
        let method = parse_method(method_str)
            .ok_or_else(|| ProviderError::execution(format!("unsupported HTTP method '{}'", method_str)))?;

        tracing::info!(task = %context.task_id, method = %method, url = %url, "HTTP endpoint request");

        let mut request = self.client.request(method, url);
        if let Some(headers) = input.get("headers").and_then(|v| v.as_object()) {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key.as_str(), value);
                }
            }
        }
        if let Some(query) = input.get("query").and_then(|v| v.as_object()) {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| {
                    let v = v.as_str().map(String::from).unwrap_or_else(|| v.to_string());
                    (k.clone(), v)
                })
                .collect();
            request = request.query(&pairs);
        }
        if let Some(body) = input.get("body") {
            request = request.json(body);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::cancelled()),
            result = request.send() => result.map_err(|e| transport_error(e, url))?,
        };

        let status = response.status().as_u16();
        let headers: serde_json::Map<String, serde_json::Value> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), serde_json::Value::String(v.to_string())))
            })
            .collect();
        let is_json = headers
            .get("content-type")
            .and_then(|v| v.as_str())
            .map(|ct| ct.contains("json"))
            .unwrap_or(false);
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::execution(format!("failed to read response body: {}", e)))?;

        tracing::info!(task = %context.task_id, status, body_len = text.len(), "HTTP endpoint response");

        if !(200..300).contains(&status) {
            let snippet: String = text.chars().take(512).collect();
            return Err(ProviderError::execution(format!(
                "endpoint returned HTTP {}",
                status
            ))
            .with_details(serde_json::json!({
                "status": status,
                "url": url,
                "body": snippet,
            })));
        }

        let body = if is_json {
            serde_json::from_str::<serde_json::Value>(&text)
                .unwrap_or(serde_json::Value::String(text))
        } else {
            serde_json::Value::String(text)
        };

        Ok(serde_json::json!({
            "status": status,
            "headers": headers,
            "body": body,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{canned_http_server, stalled_http_server};
    use conflux_types::ErrorCode;

    fn handler() -> HttpEndpointHandler {
        HttpEndpointHandler::from_descriptor(&ProviderDescriptor::for_key("http_endpoint")).unwrap()
    }

    // --- validate ---

    #[test]
    fn validate_rejects_non_object_input() {
        let msg = handler().validate(&serde_json::json!("just a string")).unwrap();
        assert!(msg.contains("JSON object"));
    }

    #[test]
    fn validate_requires_url() {
        assert!(handler()
            .validate(&serde_json::json!({"method": "GET"}))
            .unwrap()
            .contains("'url'"));
        assert!(handler()
            .validate(&serde_json::json!({"url": ""}))
            .unwrap()
            .contains("'url'"));
    }

    #[test]
    fn validate_rejects_non_http_schemes() {
        let msg = handler()
            .validate(&serde_json::json!({"url": "file:///etc/passwd"}))
            .unwrap();
        assert!(msg.contains("http(s)"));
    }

    #[test]
    fn validate_rejects_unknown_methods() {
        let msg = handler()
            .validate(&serde_json::json!({"url": "https://example.com", "method": "TRACE"}))
            .unwrap();
        assert!(msg.contains("TRACE"));
    }

    #[test]
    fn validate_rejects_non_string_header_values() {
        let msg = handler()
            .validate(&serde_json::json!({
                "url": "https://example.com",
                "headers": {"x-count": 5}
            }))
            .unwrap();
        assert!(msg.contains("headers"));
    }

    #[test]
    fn validate_accepts_well_formed_input() {
        let input = serde_json::json!({
            "url": "https://example.com/hook",
            "method": "post",
            "headers": {"x-api-key": "k"},
            "query": {"page": "1"},
            "body": {"event": "ping"}
        });
        assert_eq!(handler().validate(&input), None);
    }

    // --- invoke ---

    #[tokio::test]
    async fn invoke_returns_status_headers_and_parsed_body() {
        let base = canned_http_server(vec![(200, "application/json", r#"{"ok":true}"#)]).await;
        let ctx = ExecutionContext::new(serde_json::json!({ "url": base }));

        let data = handler()
            .invoke(&ctx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(data["status"], 200);
        assert_eq!(data["body"]["ok"], true);
        assert!(data["headers"]["content-type"]
            .as_str()
            .unwrap()
            .contains("json"));
    }

    #[tokio::test]
    async fn invoke_returns_plain_text_body_as_string() {
        let base = canned_http_server(vec![(200, "text/plain", "pong")]).await;
        let ctx = ExecutionContext::new(serde_json::json!({ "url": base }));

        let data = handler()
            .invoke(&ctx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(data["body"], "pong");
    }

    #[tokio::test]
    async fn invoke_maps_http_error_status_to_execution_failed() {
        let base = canned_http_server(vec![(500, "text/plain", "upstream exploded")]).await;
        let ctx = ExecutionContext::new(serde_json::json!({ "url": base }));

        let err = handler()
            .invoke(&ctx, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ExecutionFailed);
        let details = err.details.unwrap();
        assert_eq!(details["status"], 500);
        assert!(details["body"].as_str().unwrap().contains("exploded"));
    }

    #[tokio::test]
    async fn invoke_observes_cancellation_mid_request() {
        let base = stalled_http_server().await;
        let ctx = ExecutionContext::new(serde_json::json!({ "url": base }));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = handler().invoke(&ctx, cancel).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn invoke_maps_connection_refused_to_execution_failed() {
        // Nothing listens on this port; bind-then-drop guarantees it was free.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let ctx = ExecutionContext::new(serde_json::json!({ "url": format!("http://{}", addr) }));
        let err = handler()
            .invoke(&ctx, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ExecutionFailed);
    }
}
