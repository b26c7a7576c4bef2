// SPDX-License-Identifier: MIT OR Apache-2.0
//! Scripted [`ModelInvoker`] for tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use vp_core::{CancelToken, LlmResponse};
use vp_error::{ErrorCode, VerifyError, VerifyResult};

use crate::invoke::ModelInvoker;
use crate::request::ModelRequest;

/// Scripted invoker: returns queued responses in order and records every
/// request for assertions.
#[derive(Default)]
pub struct MockModelInvoker {
    responses: Mutex<VecDeque<VerifyResult<LlmResponse>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl MockModelInvoker {
    /// Create an empty mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response.
    pub fn enqueue_response(&self, response: LlmResponse) {
        self.responses
            .lock()
            .expect("mock lock poisoned")
            .push_back(Ok(response));
    }

    /// Queue an error.
    pub fn enqueue_error(&self, error: VerifyError) {
        self.responses
            .lock()
            .expect("mock lock poisoned")
            .push_back(Err(error));
    }

    /// Every request received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().expect("mock lock poisoned").clone()
    }

    /// A canned text response with the given usage and latency.
    #[must_use]
    pub fn text_response(
        content: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
        latency_ms: u64,
    ) -> LlmResponse {
        let content = content.into();
        LlmResponse {
            raw: serde_json::json!({
                "output": {"message": {"role": "assistant", "content": [{"text": content}]}},
                "stopReason": "end_turn",
                "usage": {
                    "inputTokens": input_tokens,
                    "outputTokens": output_tokens,
                    "totalTokens": input_tokens + output_tokens
                },
                "metrics": {"latencyMs": latency_ms}
            }),
            content,
            input_tokens,
            output_tokens,
            thinking_tokens: None,
            total_tokens: input_tokens + output_tokens,
            request_id: "mock-request-1".to_string(),
            model_id: "mock-model".to_string(),
            stop_reason: "end_turn".to_string(),
            latency_ms,
        }
    }
}

#[async_trait]
impl ModelInvoker for MockModelInvoker {
    async fn invoke(
        &self,
        request: &ModelRequest,
        cancel: &CancelToken,
    ) -> VerifyResult<LlmResponse> {
        request.validate()?;
        if cancel.is_cancelled() {
            return Err(VerifyError::cancelled("converse"));
        }
        self.requests
            .lock()
            .expect("mock lock poisoned")
            .push(request.clone());
        self.responses
            .lock()
            .expect("mock lock poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                Err(VerifyError::new(
                    ErrorCode::Internal,
                    "mock invoker has no queued response",
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestBuilder;
    use vp_config::{LlmConfig, ReasoningMode};

    fn request() -> ModelRequest {
        let config = LlmConfig {
            model_id: "m".into(),
            base_url: None,
            max_tokens: 64,
            temperature: 0.0,
            reasoning: ReasoningMode::Disable,
            reasoning_budget_tokens: 0,
            connect_timeout_secs: 1,
            call_timeout_secs: 1,
        };
        RequestBuilder::new(&config)
            .build_turn1("system", "prompt", "iVBORw0KGgoAAAA")
            .unwrap()
    }

    #[tokio::test]
    async fn responses_are_consumed_in_order() {
        let mock = MockModelInvoker::new();
        mock.enqueue_response(MockModelInvoker::text_response("one", 1, 1, 10));
        mock.enqueue_response(MockModelInvoker::text_response("two", 2, 2, 20));
        let cancel = CancelToken::new();
        assert_eq!(mock.invoke(&request(), &cancel).await.unwrap().content, "one");
        assert_eq!(mock.invoke(&request(), &cancel).await.unwrap().content, "two");
        assert_eq!(mock.requests().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_mock_errors() {
        let mock = MockModelInvoker::new();
        let err = mock.invoke(&request(), &CancelToken::new()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
    }

    #[tokio::test]
    async fn cancellation_respected() {
        let mock = MockModelInvoker::new();
        mock.enqueue_response(MockModelInvoker::text_response("x", 1, 1, 1));
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = mock.invoke(&request(), &cancel).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Cancelled);
    }
}
