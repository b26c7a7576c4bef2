// SPDX-License-Identifier: MIT OR Apache-2.0
//! Metadata-store client for verification and conversation records.
//!
//! [`MetadataStore`] is the backend seam the coordinator and the historical
//! resolver call. Each operation is independently retryable under the
//! caller's policy but is **not** transactional with its siblings — the
//! coordinator assembles overall success from the individual outcomes.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// In-memory store used by tests and local runs.
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vp_core::{
    ArtifactReference, LayoutMetadata, PreviousVerification, StatusHistoryEntry, TokenUsage,
    TurnNumber, VerificationOutcome,
};
use vp_error::{ErrorCode, VerifyError, VerifyErrorDto};

pub use memory::{InMemoryMetadataStore, MetadataOp};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Prompt/response summary recorded for one conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurnRecord {
    /// Which turn the record covers.
    pub turn_number: TurnNumber,
    /// Leading excerpt of the rendered prompt.
    pub prompt_summary: String,
    /// Leading excerpt of the model's reply.
    pub response_summary: String,
    /// Token usage for the call.
    pub token_usage: TokenUsage,
    /// When the record was written.
    pub recorded_at: DateTime<Utc>,
}

/// Metrics attached to a turn-completion update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnMetrics {
    /// Total wall-clock processing time in milliseconds.
    pub processing_time_ms: u64,
    /// Measured model-invocation latency in milliseconds.
    pub bedrock_latency_ms: u64,
    /// Token usage for the call.
    pub token_usage: TokenUsage,
    /// Final outcome, when the turn produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_outcome: Option<VerificationOutcome>,
    /// Discrepancy count, when the turn produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discrepancies_found: Option<u64>,
}

/// One error-tracking entry: the current error plus when it occurred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Snapshot of the error.
    pub error: VerifyErrorDto,
    /// When the error occurred.
    pub occurred_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// Errors surfaced by a [`MetadataStore`] backend.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// A transient failure; the operation may succeed on retry.
    #[error("transient metadata failure on {table}: {reason}")]
    Transient {
        /// Table involved.
        table: String,
        /// Backend detail.
        reason: String,
    },

    /// A conditional-update conflict.
    #[error("metadata write conflict on {table}: {reason}")]
    Conflict {
        /// Table involved.
        table: String,
        /// Backend detail.
        reason: String,
    },

    /// A non-retryable failure.
    #[error("metadata failure on {table}: {reason}")]
    Other {
        /// Table involved.
        table: String,
        /// Backend detail.
        reason: String,
    },
}

/// Idempotent updates to verification and conversation records.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Append an entry to the verification's status history.
    async fn update_verification_status(
        &self,
        verification_id: &str,
        verification_at: DateTime<Utc>,
        entry: &StatusHistoryEntry,
    ) -> Result<(), MetadataError>;

    /// Record the prompt/response summary for a turn.
    async fn update_conversation_turn(
        &self,
        verification_id: &str,
        record: &ConversationTurnRecord,
    ) -> Result<(), MetadataError>;

    /// Finalize a turn: status entry, metrics, and artifact pointers.
    async fn update_turn_completion(
        &self,
        verification_id: &str,
        verification_at: DateTime<Utc>,
        entry: &StatusHistoryEntry,
        metrics: &TurnMetrics,
        processed_markdown_ref: &ArtifactReference,
        conversation_ref: Option<&ArtifactReference>,
    ) -> Result<(), MetadataError>;

    /// Record the current error and append it to the error history.
    async fn update_error_tracking(
        &self,
        verification_id: &str,
        record: &ErrorRecord,
    ) -> Result<(), MetadataError>;

    /// Find the most recent previous verification for a checking image.
    async fn query_previous_verification(
        &self,
        checking_image_key: &str,
    ) -> Result<Option<PreviousVerification>, MetadataError>;

    /// Fetch layout metadata by `(layout_id, layout_prefix)`.
    async fn get_layout_metadata(
        &self,
        layout_id: i64,
        layout_prefix: &str,
    ) -> Result<Option<LayoutMetadata>, MetadataError>;
}

/// Map a backend [`MetadataError`] to the pipeline taxonomy, tagging the
/// originating operation.
#[must_use]
pub fn map_metadata_error(err: MetadataError, api_source: &str, is_query: bool) -> VerifyError {
    let (code, table, retryable) = match &err {
        MetadataError::Transient { table, .. } => (
            if is_query {
                ErrorCode::MetadataQueryFailed
            } else {
                ErrorCode::MetadataUpdateFailed
            },
            table.clone(),
            true,
        ),
        MetadataError::Conflict { table, .. } => (ErrorCode::MetadataConflict, table.clone(), true),
        MetadataError::Other { table, .. } => (
            if is_query {
                ErrorCode::MetadataQueryFailed
            } else {
                ErrorCode::MetadataUpdateFailed
            },
            table.clone(),
            false,
        ),
    };
    let mut mapped = VerifyError::new(code, err.to_string())
        .with_table_name(table)
        .with_api_source(api_source);
    if !retryable {
        mapped = mapped.with_retry(false, vp_error::RetryStrategy::None);
    }
    mapped
}
