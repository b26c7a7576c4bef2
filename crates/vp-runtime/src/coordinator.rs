// SPDX-License-Identifier: MIT OR Apache-2.0
//! Metadata write coordination.
//!
//! The three mandatory writes (status history, conversation turn, completion
//! details) run sequentially. A failure is logged with its taxonomy tags and
//! appended to error tracking, but never aborts the turn: the overall
//! `dynamo_ok` flag is the AND of the three outcomes. No cross-store
//! transaction exists; partial success is an accepted state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use vp_core::{ArtifactReference, CancelToken, StatusHistoryEntry};
use vp_error::VerifyError;
use vp_metadata::{
    ConversationTurnRecord, ErrorRecord, MetadataStore, TurnMetrics, map_metadata_error,
};

/// Outcome of the three mandatory metadata writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataOutcome {
    /// The status-history append succeeded.
    pub status_ok: bool,
    /// The conversation-turn record succeeded.
    pub conversation_ok: bool,
    /// The completion-details update succeeded.
    pub completion_ok: bool,
}

impl MetadataOutcome {
    /// `status_ok ∧ conversation_ok ∧ completion_ok`.
    #[must_use]
    pub fn dynamo_ok(&self) -> bool {
        self.status_ok && self.conversation_ok && self.completion_ok
    }
}

/// Batches the mandatory metadata writes for a turn.
pub struct MetadataCoordinator {
    store: Arc<dyn MetadataStore>,
}

impl MetadataCoordinator {
    /// Create a coordinator over the metadata store.
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Run the three mandatory writes sequentially, recording failures in
    /// error tracking.
    #[allow(clippy::too_many_arguments)]
    pub async fn finalize_turn(
        &self,
        verification_id: &str,
        verification_at: DateTime<Utc>,
        status_entry: &StatusHistoryEntry,
        conversation: &ConversationTurnRecord,
        metrics: &TurnMetrics,
        processed_markdown_ref: &ArtifactReference,
        conversation_ref: Option<&ArtifactReference>,
        _cancel: &CancelToken,
    ) -> MetadataOutcome {
        let status_ok = match self
            .store
            .update_verification_status(verification_id, verification_at, status_entry)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                self.report(verification_id, map_metadata_error(err, "update-status", false))
                    .await;
                false
            }
        };

        let conversation_ok = match self
            .store
            .update_conversation_turn(verification_id, conversation)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                self.report(
                    verification_id,
                    map_metadata_error(err, "update-conversation", false),
                )
                .await;
                false
            }
        };

        let completion_ok = match self
            .store
            .update_turn_completion(
                verification_id,
                verification_at,
                status_entry,
                metrics,
                processed_markdown_ref,
                conversation_ref,
            )
            .await
        {
            Ok(()) => true,
            Err(err) => {
                self.report(
                    verification_id,
                    map_metadata_error(err, "update-completion", false),
                )
                .await;
                false
            }
        };

        MetadataOutcome {
            status_ok,
            conversation_ok,
            completion_ok,
        }
    }

    /// Record an error in the tracking history, best-effort.
    pub async fn report(&self, verification_id: &str, error: VerifyError) {
        warn!(
            target: "vp.coordinator",
            code = %error.code,
            category = error.category(),
            retryable = error.retryable,
            verification_id,
            "metadata write failed: {error}"
        );
        let record = ErrorRecord {
            error: (&error).into(),
            occurred_at: Utc::now(),
        };
        if let Err(tracking_err) = self
            .store
            .update_error_tracking(verification_id, &record)
            .await
        {
            warn!(
                target: "vp.coordinator",
                verification_id,
                "error tracking update failed: {tracking_err}"
            );
        }
    }
}
