//! HTTP request tool.
//!
//! Async-native: it drives `reqwest` on the event loop instead of the
//! blocking pool, so it overrides [`Tool::ainvoke`] and flips
//! [`Tool::is_async`]. The synchronous [`Tool::run`] path (used by workflow
//! tool nodes) blocks on a freshly created current-thread runtime, which is
//! acceptable because workflow executors already run on the blocking pool.

use crate::overmind::tool_protocol::{Tool, ToolError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_BODY_PREVIEW: usize = 64 * 1024;

/// Performs GET/POST requests and returns status, headers and a bounded body.
pub struct HttpRequestTool {
    client: reqwest::Client,
}

impl HttpRequestTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let url = args
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("missing required field 'url'".into()))?;
        let method = args
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_ascii_uppercase();

        let request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => {
                let body = args.get("body").cloned().unwrap_or(Value::Null);
                self.client.post(url).json(&body)
            }
            other => {
                return Err(ToolError::InvalidArguments(format!(
                    "unsupported method {:?}",
                    other
                )))
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("request failed: {}", e)))?;
        let status = response.status().as_u16();
        let mut body = response
            .text()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("body read failed: {}", e)))?;
        if body.len() > MAX_BODY_PREVIEW {
            body.truncate(MAX_BODY_PREVIEW);
        }

        Ok(json!({ "status": status, "body": body }))
    }
}

impl Default for HttpRequestTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpRequestTool {
    fn name(&self) -> &str {
        "http_request"
    }

    fn description(&self) -> &str {
        "Perform an HTTP GET or POST request and return status and body."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "Absolute URL to request" },
                "method": { "type": "string", "enum": ["GET", "POST"], "default": "GET" },
                "body": { "type": "object", "description": "JSON body for POST requests" }
            },
            "required": ["url"]
        })
    }

    fn is_async(&self) -> bool {
        true
    }

    fn run(&self, args: Value) -> Result<Value, ToolError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ToolError::ExecutionFailed(format!("runtime build failed: {}", e)))?;
        runtime.block_on(self.execute(args))
    }

    async fn ainvoke(&self, args: Value) -> Result<Value, ToolError> {
        self.execute(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_url_is_invalid_arguments() {
        let tool = HttpRequestTool::new();
        assert!(matches!(
            tool.ainvoke(json!({})).await,
            Err(ToolError::InvalidArguments(_))
        ));
    }

    #[tokio::test]
    async fn test_unsupported_method_is_rejected() {
        let tool = HttpRequestTool::new();
        assert!(matches!(
            tool.ainvoke(json!({"url": "http://localhost", "method": "DELETE"}))
                .await,
            Err(ToolError::InvalidArguments(_))
        ));
    }
}
