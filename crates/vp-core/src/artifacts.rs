// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persisted artifact document bodies.
//!
//! These are the JSON documents the persister writes under
//! `<datePartition>/<verificationId>/` and the Turn-2 loader reads back, so
//! they live in the contract crate: Turn 2 must parse exactly what Turn 1
//! wrote.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    ArtifactReference, Discrepancy, ImageFormat, TokenUsage, TurnNumber, VerificationOutcome,
    VerificationType,
};

// ---------------------------------------------------------------------------
// Raw response
// ---------------------------------------------------------------------------

/// The model's reply body inside a raw-response artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawResponseBody {
    /// The model's text output.
    pub content: String,
    /// Why generation stopped.
    pub stop_reason: String,
}

/// Provider metadata captured alongside the raw response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BedrockMetadata {
    /// Model that served the request.
    pub model_id: String,
    /// Provider request identifier.
    pub request_id: String,
    /// Measured invocation latency in milliseconds.
    pub latency_ms: u64,
}

/// Prompt metadata captured alongside the raw response.
///
/// `user_prompt` carries the rendered turn prompt and `image_format` the
/// detected format of the image sent with it, so that Turn 2 can rebuild
/// the exact two-turn conversation without re-rendering Turn 1's template
/// or re-reading the reference image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptMetadata {
    /// Template the prompt was rendered from.
    pub template_id: String,
    /// Version of the template set.
    pub template_version: String,
    /// The rendered user prompt text.
    pub user_prompt: String,
    /// Detected format of the image embedded in the turn's user message.
    pub image_format: ImageFormat,
    /// Rough token estimate for the rendered prompt (`len / 4`).
    pub token_estimate: u64,
}

/// `responses/turn{N}-raw-response.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawResponseArtifact {
    /// Verification identifier.
    pub verification_id: String,
    /// Turn the response belongs to.
    pub turn_number: TurnNumber,
    /// The model's reply.
    pub response: RawResponseBody,
    /// Token usage for the call.
    pub token_usage: TokenUsage,
    /// Provider metadata.
    pub bedrock_metadata: BedrockMetadata,
    /// Prompt metadata.
    pub prompt_metadata: PromptMetadata,
    /// When the artifact was written.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Processed response
// ---------------------------------------------------------------------------

/// `responses/turn{N}-processed-response.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedResponseArtifact {
    /// Verification identifier.
    pub verification_id: String,
    /// Turn the response belongs to.
    pub turn_number: TurnNumber,
    /// Final outcome after interpretation. Absent when the turn is a pure
    /// analysis turn or only the markdown pass succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_outcome: Option<VerificationOutcome>,
    /// Comparison summary, including any interpreter annotation.
    pub comparison_summary: String,
    /// Structured discrepancies, deduplicated.
    #[serde(default)]
    pub discrepancies: Vec<Discrepancy>,
    /// `true` when only the markdown pass succeeded and the structured
    /// fields are defaults.
    #[serde(default)]
    pub partial: bool,
    /// When the artifact was written.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Prompt bundle
// ---------------------------------------------------------------------------

/// Shape summary of one message in the request, for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    /// Message role (`"system"` / `"user"` / `"assistant"`).
    pub role: String,
    /// Content block types in order (e.g. `["text", "image"]`).
    pub content_types: Vec<String>,
}

/// Generation metadata attached to a prompt bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationMetadata {
    /// Template the prompt was rendered from.
    pub template_id: String,
    /// Render time in milliseconds.
    pub processing_time_ms: u64,
    /// Rough token estimate for the rendered prompt.
    pub token_estimate: u64,
    /// Extra generation annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, serde_json::Value>,
}

/// `prompts/turn{N}-prompt.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptBundle {
    /// Verification identifier.
    pub verification_id: String,
    /// Which turn's prompt this is (`"turn1"` / `"turn2"`).
    pub prompt_type: String,
    /// Verification type the template was selected for.
    pub verification_type: VerificationType,
    /// Shape of the messages sent to the model.
    pub message_structure: Vec<MessageSummary>,
    /// The rendered user prompt.
    pub contextual_instructions: String,
    /// The image artifact the request embedded.
    pub image_reference: ArtifactReference,
    /// Version of the template set.
    pub template_version: String,
    /// Render metadata.
    pub generation_metadata: GenerationMetadata,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
    /// System prompt.
    System,
    /// User turn.
    User,
    /// Assistant reply.
    Assistant,
}

/// One content block of a conversation message. Images are stored by
/// reference; the base64 payload is never duplicated into the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConversationContent {
    /// Text content.
    Text {
        /// The text.
        text: String,
    },
    /// Image content, by reference.
    Image {
        /// Wire format (`"png"` / `"jpeg"`).
        format: String,
        /// Where the payload lives.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference: Option<ArtifactReference>,
    },
}

/// One message of the conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    /// Who produced the message.
    pub role: ConversationRole,
    /// Content blocks in order.
    pub content: Vec<ConversationContent>,
}

/// `conversation/turn{N}.json` — `[system, user(text+image), assistant]` for
/// Turn 1, extended by the Turn-2 pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationArtifact {
    /// Verification identifier.
    pub verification_id: String,
    /// Turn the transcript covers up to.
    pub turn_number: TurnNumber,
    /// The transcript.
    pub messages: Vec<ConversationMessage>,
}
