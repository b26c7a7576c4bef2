// SPDX-License-Identifier: MIT OR Apache-2.0
//! Model invocation seam, HTTP invoker, and payload normalization.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use vp_config::LlmConfig;
use vp_core::{CancelToken, LlmResponse};
use vp_error::{ErrorCode, RetryStrategy, VerifyError, VerifyResult};

use crate::request::ModelRequest;

/// Default provider endpoint when `LLM_BASE_URL` is unset.
const DEFAULT_BASE_URL: &str = "https://bedrock-runtime.us-east-1.amazonaws.com";

// ---------------------------------------------------------------------------
// Seam
// ---------------------------------------------------------------------------

/// Invokes a model and returns the normalized response.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Send `request`, honoring `cancel` and the configured hard timeout.
    async fn invoke(
        &self,
        request: &ModelRequest,
        cancel: &CancelToken,
    ) -> VerifyResult<LlmResponse>;
}

// ---------------------------------------------------------------------------
// HTTP invoker
// ---------------------------------------------------------------------------

/// HTTP invoker for the provider's converse endpoint.
pub struct HttpModelInvoker {
    client: reqwest::Client,
    base_url: String,
    call_timeout: Duration,
}

impl HttpModelInvoker {
    /// Build an invoker from the invocation settings.
    pub fn new(config: &LlmConfig) -> VerifyResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| {
                VerifyError::new(
                    ErrorCode::LlmInvocationFailed,
                    format!("failed to build HTTP client: {e}"),
                )
                .with_retry(false, RetryStrategy::None)
            })?;
        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            call_timeout: config.call_timeout(),
        })
    }

    /// The converse endpoint URL for a model.
    #[must_use]
    pub fn converse_url(&self, model_id: &str) -> String {
        format!("{}/model/{model_id}/converse", self.base_url)
    }
}

#[async_trait]
impl ModelInvoker for HttpModelInvoker {
    async fn invoke(
        &self,
        request: &ModelRequest,
        cancel: &CancelToken,
    ) -> VerifyResult<LlmResponse> {
        request.validate()?;
        if cancel.is_cancelled() {
            return Err(VerifyError::cancelled("converse"));
        }

        let url = self.converse_url(&request.model_id);
        debug!(target: "vp.llm", url = %url, model_id = %request.model_id, "invoking model");

        let started = Instant::now();
        let send = self
            .client
            .post(&url)
            .timeout(self.call_timeout)
            .json(request)
            .send();
        let response = tokio::select! {
            result = send => result.map_err(map_reqwest_error)?,
            () = cancel.cancelled() => return Err(VerifyError::cancelled("converse")),
        };

        let status = response.status();
        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = response.text().await.map_err(map_reqwest_error)?;
        let latency_ms = started.elapsed().as_millis() as u64;

        if !status.is_success() {
            return Err(map_http_status(status, &body));
        }

        let payload: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            VerifyError::new(
                ErrorCode::LlmResponseInvalid,
                format!("provider returned invalid JSON: {e}"),
            )
            .with_api_source("converse")
        })?;
        let fallback_request_id = request_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        normalize_response(payload, &request.model_id, &fallback_request_id, latency_ms)
    }
}

/// Map an HTTP status from the provider to the pipeline taxonomy.
fn map_http_status(status: reqwest::StatusCode, body: &str) -> VerifyError {
    let code = match status.as_u16() {
        401 | 403 => ErrorCode::LlmAuthFailed,
        429 => ErrorCode::LlmThrottled,
        500..=599 => ErrorCode::LlmUnavailable,
        _ => ErrorCode::LlmInvocationFailed,
    };
    VerifyError::new(code, format!("provider returned HTTP {status}"))
        .with_detail("status", status.as_u16())
        .with_detail("body", body.chars().take(512).collect::<String>())
        .with_api_source("converse")
}

/// Map a transport-level [`reqwest::Error`] to the pipeline taxonomy.
fn map_reqwest_error(err: reqwest::Error) -> VerifyError {
    if err.is_timeout() {
        VerifyError::new(ErrorCode::LlmTimeout, "model call exceeded its hard timeout")
            .with_api_source("converse")
            .with_source(err)
    } else {
        VerifyError::new(ErrorCode::LlmUnavailable, format!("transport failure: {err}"))
            .with_api_source("converse")
            .with_source(err)
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Normalize a provider payload into an [`LlmResponse`].
///
/// The measured latency is authoritative unless the payload reports its own
/// `metrics.latencyMs`; a placeholder is never emitted. The full payload is
/// retained in `raw` for audit.
pub fn normalize_response(
    payload: serde_json::Value,
    model_id: &str,
    request_id_fallback: &str,
    measured_latency_ms: u64,
) -> VerifyResult<LlmResponse> {
    let content_blocks = payload
        .pointer("/output/message/content")
        .and_then(|v| v.as_array())
        .ok_or_else(|| {
            VerifyError::new(
                ErrorCode::LlmResponseInvalid,
                "provider payload has no output message content",
            )
            .with_api_source("converse")
        })?;
    let content: String = content_blocks
        .iter()
        .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("");
    if content.is_empty() {
        return Err(VerifyError::new(
            ErrorCode::LlmResponseInvalid,
            "provider payload contains no text content",
        )
        .with_api_source("converse"));
    }

    let usage = |field: &str| {
        payload
            .pointer(&format!("/usage/{field}"))
            .and_then(serde_json::Value::as_u64)
    };
    let input_tokens = usage("inputTokens").unwrap_or(0);
    let output_tokens = usage("outputTokens").unwrap_or(0);
    let thinking_tokens = usage("thinkingTokens");
    let total_tokens = usage("totalTokens")
        .unwrap_or(input_tokens + output_tokens + thinking_tokens.unwrap_or(0));

    let latency_ms = payload
        .pointer("/metrics/latencyMs")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(measured_latency_ms);
    let stop_reason = payload
        .get("stopReason")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let request_id = payload
        .get("requestId")
        .and_then(|v| v.as_str())
        .unwrap_or(request_id_fallback)
        .to_string();
    let model_id = payload
        .get("modelId")
        .and_then(|v| v.as_str())
        .unwrap_or(model_id)
        .to_string();

    Ok(LlmResponse {
        content,
        input_tokens,
        output_tokens,
        thinking_tokens,
        total_tokens,
        request_id,
        model_id,
        stop_reason,
        latency_ms,
        raw: payload,
    })
}
