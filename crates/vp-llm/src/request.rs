// SPDX-License-Identifier: MIT OR Apache-2.0
//! Model request types and builders.
//!
//! The wire shape mirrors the provider's converse API: a system prompt,
//! role-tagged messages whose content is a list of text/image blocks, an
//! inference config, and — when extended reasoning is on — `reasoning =
//! "enable"` on both the outer request and the inference config plus a
//! `thinking` block carrying the token budget.

use serde::{Deserialize, Serialize};

use vp_config::LlmConfig;
use vp_core::ImageFormat;
use vp_error::{ErrorCode, VerifyError, VerifyResult};

/// Value of the reasoning toggle on the wire.
pub const REASONING_ENABLE: &str = "enable";

/// Value of the `thinking.type` field when reasoning is on.
pub const THINKING_ENABLED: &str = "enabled";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A user turn.
    User,
    /// An assistant reply.
    Assistant,
}

/// Base64 image source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    /// The base64 payload.
    pub bytes: String,
}

/// Image content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBlock {
    /// Wire format (`"png"` / `"jpeg"`).
    pub format: String,
    /// Payload source.
    pub source: ImageSource,
}

/// One content block of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentBlock {
    /// Text content.
    Text {
        /// The text.
        text: String,
    },
    /// Image content.
    Image {
        /// The image.
        image: ImageBlock,
    },
}

impl ContentBlock {
    /// A text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// An image block with the format detected from the payload.
    #[must_use]
    pub fn image(base64: impl Into<String>) -> Self {
        let bytes = base64.into();
        let format = ImageFormat::detect(&bytes);
        Self::Image {
            image: ImageBlock {
                format: format.as_str().to_string(),
                source: ImageSource { bytes },
            },
        }
    }
}

/// A message in the model request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMessage {
    /// Who produced the message.
    pub role: Role,
    /// Content blocks in order.
    pub content: Vec<ContentBlock>,
}

/// Inference configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfig {
    /// Maximum output tokens.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
    /// Reasoning toggle, mirrored from the outer request when enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// Extended-reasoning configuration block. Wire keys are `type` and
/// `budget_tokens`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingConfig {
    /// Always `"enabled"` when present.
    #[serde(rename = "type")]
    pub kind: String,
    /// Token budget the model may spend before the final answer.
    pub budget_tokens: u32,
}

/// A complete model request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRequest {
    /// Model identifier.
    pub model_id: String,
    /// System prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Conversation messages.
    pub messages: Vec<ModelMessage>,
    /// Inference configuration.
    pub inference_config: InferenceConfig,
    /// Reasoning toggle on the outer request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Extended-reasoning block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
}

impl ModelRequest {
    /// Validate the reasoning/temperature combination.
    ///
    /// With reasoning the temperature may be exactly 1; without it the valid
    /// range is `[0, 1)`. Invalid combinations fail before invocation.
    pub fn validate(&self) -> VerifyResult<()> {
        let t = self.inference_config.temperature;
        let reasoning = self.reasoning.as_deref() == Some(REASONING_ENABLE);
        let valid = if reasoning {
            (0.0..=1.0).contains(&t)
        } else {
            (0.0..1.0).contains(&t)
        };
        if !valid {
            return Err(VerifyError::new(
                ErrorCode::LlmConfigInvalid,
                format!(
                    "temperature {t} invalid for reasoning={}",
                    if reasoning { "enable" } else { "disable" }
                ),
            )
            .with_detail("temperature", t));
        }
        if reasoning && self.thinking.is_none() {
            return Err(VerifyError::new(
                ErrorCode::LlmConfigInvalid,
                "reasoning enabled without a thinking block",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds validated [`ModelRequest`]s from the turn inputs.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    config: LlmConfig,
}

impl RequestBuilder {
    /// Create a builder over the invocation settings.
    #[must_use]
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Build the Turn-1 request: system prompt plus a single user message of
    /// `[text, image]`.
    pub fn build_turn1(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        image_base64: &str,
    ) -> VerifyResult<ModelRequest> {
        let messages = vec![ModelMessage {
            role: Role::User,
            content: vec![
                ContentBlock::text(user_prompt),
                ContentBlock::image(image_base64),
            ],
        }];
        self.finish(system_prompt, messages)
    }

    /// Build the Turn-2 request: the system prompt, the prior user+assistant
    /// pair, then the new user message — the model sees the full two-turn
    /// conversation. The prior user turn is replayed as text; the reference
    /// image is not re-embedded.
    pub fn build_turn2(
        &self,
        system_prompt: &str,
        prior_user_prompt: &str,
        prior_assistant_text: &str,
        user_prompt: &str,
        image_base64: &str,
    ) -> VerifyResult<ModelRequest> {
        let messages = vec![
            ModelMessage {
                role: Role::User,
                content: vec![ContentBlock::text(prior_user_prompt)],
            },
            ModelMessage {
                role: Role::Assistant,
                content: vec![ContentBlock::text(prior_assistant_text)],
            },
            ModelMessage {
                role: Role::User,
                content: vec![
                    ContentBlock::text(user_prompt),
                    ContentBlock::image(image_base64),
                ],
            },
        ];
        self.finish(system_prompt, messages)
    }

    fn finish(&self, system_prompt: &str, messages: Vec<ModelMessage>) -> VerifyResult<ModelRequest> {
        let reasoning = self.config.reasoning.is_enabled();
        let request = ModelRequest {
            model_id: self.config.model_id.clone(),
            system: Some(system_prompt.to_string()),
            messages,
            inference_config: InferenceConfig {
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
                reasoning: reasoning.then(|| REASONING_ENABLE.to_string()),
            },
            reasoning: reasoning.then(|| REASONING_ENABLE.to_string()),
            thinking: reasoning.then(|| ThinkingConfig {
                kind: THINKING_ENABLED.to_string(),
                budget_tokens: self.config.reasoning_budget_tokens,
            }),
        };
        request.validate()?;
        Ok(request)
    }
}
