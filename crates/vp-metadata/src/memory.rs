// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory [`MetadataStore`] for tests and local runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

use vp_core::{
    ArtifactReference, LayoutMetadata, PreviousVerification, StatusHistoryEntry,
};

use crate::{ConversationTurnRecord, ErrorRecord, MetadataError, MetadataStore, TurnMetrics};

/// One recorded turn-completion update, kept for assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRecord {
    /// The final status entry.
    pub entry: StatusHistoryEntry,
    /// The turn metrics.
    pub metrics: TurnMetrics,
    /// Pointer to the processed markdown artifact.
    pub processed_markdown_ref: ArtifactReference,
    /// Pointer to the conversation artifact, when tracked.
    pub conversation_ref: Option<ArtifactReference>,
}

/// Identifies a [`MetadataStore`] operation for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MetadataOp {
    /// `update_verification_status`.
    UpdateStatus,
    /// `update_conversation_turn`.
    UpdateConversation,
    /// `update_turn_completion`.
    UpdateCompletion,
    /// `update_error_tracking`.
    UpdateErrorTracking,
    /// `query_previous_verification`.
    QueryPrevious,
    /// `get_layout_metadata`.
    GetLayout,
}

#[derive(Debug, Clone, Copy)]
enum InjectedFailure {
    Transient,
    Conflict,
}

#[derive(Debug, Default)]
struct Inner {
    status_history: BTreeMap<String, Vec<StatusHistoryEntry>>,
    conversations: BTreeMap<String, Vec<ConversationTurnRecord>>,
    completions: BTreeMap<String, Vec<CompletionRecord>>,
    error_tracking: BTreeMap<String, Vec<ErrorRecord>>,
    previous_by_image: BTreeMap<String, PreviousVerification>,
    layouts: BTreeMap<(i64, String), LayoutMetadata>,
    failures: BTreeMap<MetadataOp, (InjectedFailure, u32)>,
}

/// In-memory metadata store with per-operation failure injection.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    verification_table: String,
    inner: Mutex<Inner>,
}

impl InMemoryMetadataStore {
    /// Create an empty store with a default table name.
    #[must_use]
    pub fn new() -> Self {
        Self {
            verification_table: "verification-results".to_string(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Make the next `times` calls of `op` fail transiently.
    pub fn fail_times(&self, op: MetadataOp, times: u32) {
        self.inner
            .lock()
            .expect("metadata lock poisoned")
            .failures
            .insert(op, (InjectedFailure::Transient, times));
    }

    /// Make the next `times` calls of `op` fail with a conflict.
    pub fn fail_with_conflict(&self, op: MetadataOp, times: u32) {
        self.inner
            .lock()
            .expect("metadata lock poisoned")
            .failures
            .insert(op, (InjectedFailure::Conflict, times));
    }

    /// Seed the previous-verification index for the historical resolver.
    pub fn seed_previous_verification(&self, checking_image_key: &str, record: PreviousVerification) {
        self.inner
            .lock()
            .expect("metadata lock poisoned")
            .previous_by_image
            .insert(checking_image_key.to_string(), record);
    }

    /// Seed a layout metadata record.
    pub fn seed_layout(&self, layout_id: i64, layout_prefix: &str, metadata: LayoutMetadata) {
        self.inner
            .lock()
            .expect("metadata lock poisoned")
            .layouts
            .insert((layout_id, layout_prefix.to_string()), metadata);
    }

    /// Status history recorded for a verification.
    #[must_use]
    pub fn status_history_of(&self, verification_id: &str) -> Vec<StatusHistoryEntry> {
        self.inner
            .lock()
            .expect("metadata lock poisoned")
            .status_history
            .get(verification_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Conversation records for a verification.
    #[must_use]
    pub fn conversations_of(&self, verification_id: &str) -> Vec<ConversationTurnRecord> {
        self.inner
            .lock()
            .expect("metadata lock poisoned")
            .conversations
            .get(verification_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Completion records for a verification.
    #[must_use]
    pub fn completions_of(&self, verification_id: &str) -> Vec<CompletionRecord> {
        self.inner
            .lock()
            .expect("metadata lock poisoned")
            .completions
            .get(verification_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Error-tracking records for a verification.
    #[must_use]
    pub fn errors_of(&self, verification_id: &str) -> Vec<ErrorRecord> {
        self.inner
            .lock()
            .expect("metadata lock poisoned")
            .error_tracking
            .get(verification_id)
            .cloned()
            .unwrap_or_default()
    }

    fn take_failure(&self, op: MetadataOp) -> Option<MetadataError> {
        let mut inner = self.inner.lock().expect("metadata lock poisoned");
        let (failure, remaining) = inner.failures.remove(&op)?;
        if remaining == 0 {
            return None;
        }
        if remaining > 1 {
            inner.failures.insert(op, (failure, remaining - 1));
        }
        let table = self.verification_table.clone();
        Some(match failure {
            InjectedFailure::Transient => MetadataError::Transient {
                table,
                reason: "injected transient failure".to_string(),
            },
            InjectedFailure::Conflict => MetadataError::Conflict {
                table,
                reason: "injected conflict".to_string(),
            },
        })
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn update_verification_status(
        &self,
        verification_id: &str,
        _verification_at: DateTime<Utc>,
        entry: &StatusHistoryEntry,
    ) -> Result<(), MetadataError> {
        if let Some(err) = self.take_failure(MetadataOp::UpdateStatus) {
            return Err(err);
        }
        self.inner
            .lock()
            .expect("metadata lock poisoned")
            .status_history
            .entry(verification_id.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn update_conversation_turn(
        &self,
        verification_id: &str,
        record: &ConversationTurnRecord,
    ) -> Result<(), MetadataError> {
        if let Some(err) = self.take_failure(MetadataOp::UpdateConversation) {
            return Err(err);
        }
        self.inner
            .lock()
            .expect("metadata lock poisoned")
            .conversations
            .entry(verification_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn update_turn_completion(
        &self,
        verification_id: &str,
        _verification_at: DateTime<Utc>,
        entry: &StatusHistoryEntry,
        metrics: &TurnMetrics,
        processed_markdown_ref: &ArtifactReference,
        conversation_ref: Option<&ArtifactReference>,
    ) -> Result<(), MetadataError> {
        if let Some(err) = self.take_failure(MetadataOp::UpdateCompletion) {
            return Err(err);
        }
        self.inner
            .lock()
            .expect("metadata lock poisoned")
            .completions
            .entry(verification_id.to_string())
            .or_default()
            .push(CompletionRecord {
                entry: entry.clone(),
                metrics: metrics.clone(),
                processed_markdown_ref: processed_markdown_ref.clone(),
                conversation_ref: conversation_ref.cloned(),
            });
        Ok(())
    }

    async fn update_error_tracking(
        &self,
        verification_id: &str,
        record: &ErrorRecord,
    ) -> Result<(), MetadataError> {
        if let Some(err) = self.take_failure(MetadataOp::UpdateErrorTracking) {
            return Err(err);
        }
        self.inner
            .lock()
            .expect("metadata lock poisoned")
            .error_tracking
            .entry(verification_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn query_previous_verification(
        &self,
        checking_image_key: &str,
    ) -> Result<Option<PreviousVerification>, MetadataError> {
        if let Some(err) = self.take_failure(MetadataOp::QueryPrevious) {
            return Err(err);
        }
        Ok(self
            .inner
            .lock()
            .expect("metadata lock poisoned")
            .previous_by_image
            .get(checking_image_key)
            .cloned())
    }

    async fn get_layout_metadata(
        &self,
        layout_id: i64,
        layout_prefix: &str,
    ) -> Result<Option<LayoutMetadata>, MetadataError> {
        if let Some(err) = self.take_failure(MetadataOp::GetLayout) {
            return Err(err);
        }
        Ok(self
            .inner
            .lock()
            .expect("metadata lock poisoned")
            .layouts
            .get(&(layout_id, layout_prefix.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vp_core::TokenUsage;
    use vp_core::TurnNumber;

    fn entry(status: &str) -> StatusHistoryEntry {
        StatusHistoryEntry {
            status: status.to_string(),
            timestamp: Utc::now(),
            function_name: "turn1".to_string(),
            processing_time_ms: 10,
            stage: "validation".to_string(),
            metrics: None,
        }
    }

    #[tokio::test]
    async fn status_history_appends_in_order() {
        let store = InMemoryMetadataStore::new();
        store
            .update_verification_status("verif-1", Utc::now(), &entry("TURN1_STARTED"))
            .await
            .unwrap();
        store
            .update_verification_status("verif-1", Utc::now(), &entry("TURN1_COMPLETED"))
            .await
            .unwrap();
        let history = store.status_history_of("verif-1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, "TURN1_STARTED");
        assert_eq!(history[1].status, "TURN1_COMPLETED");
    }

    #[tokio::test]
    async fn injected_failure_consumed_then_succeeds() {
        let store = InMemoryMetadataStore::new();
        store.fail_times(MetadataOp::UpdateStatus, 1);
        let err = store
            .update_verification_status("verif-1", Utc::now(), &entry("X"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Transient { .. }));
        store
            .update_verification_status("verif-1", Utc::now(), &entry("X"))
            .await
            .unwrap();
        assert_eq!(store.status_history_of("verif-1").len(), 1);
    }

    #[tokio::test]
    async fn conflict_injection() {
        let store = InMemoryMetadataStore::new();
        store.fail_with_conflict(MetadataOp::UpdateCompletion, 1);
        let metrics = TurnMetrics {
            processing_time_ms: 1,
            bedrock_latency_ms: 1,
            token_usage: TokenUsage::default(),
            verification_outcome: None,
            discrepancies_found: None,
        };
        let err = store
            .update_turn_completion(
                "verif-1",
                Utc::now(),
                &entry("TURN1_COMPLETED"),
                &metrics,
                &ArtifactReference::new("state", "k"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Conflict { .. }));
    }

    #[tokio::test]
    async fn previous_verification_lookup() {
        let store = InMemoryMetadataStore::new();
        assert!(store
            .query_previous_verification("checking.b64")
            .await
            .unwrap()
            .is_none());
        let record: PreviousVerification = serde_json::from_value(serde_json::json!({
            "verificationId": "verif-prev",
            "verificationAt": "2025-06-10T09:00:00Z",
            "verificationStatus": "CORRECT"
        }))
        .unwrap();
        store.seed_previous_verification("checking.b64", record.clone());
        assert_eq!(
            store.query_previous_verification("checking.b64").await.unwrap(),
            Some(record)
        );
    }

    #[tokio::test]
    async fn layout_lookup_by_id_and_prefix() {
        let store = InMemoryMetadataStore::new();
        store.seed_layout(42, "row-major", LayoutMetadata::default());
        assert!(store.get_layout_metadata(42, "row-major").await.unwrap().is_some());
        assert!(store.get_layout_metadata(42, "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conversation_records_append() {
        let store = InMemoryMetadataStore::new();
        let record = ConversationTurnRecord {
            turn_number: TurnNumber::One,
            prompt_summary: "p".into(),
            response_summary: "r".into(),
            token_usage: TokenUsage::default(),
            recorded_at: Utc::now(),
        };
        store.update_conversation_turn("verif-1", &record).await.unwrap();
        assert_eq!(store.conversations_of("verif-1"), vec![record]);
    }
}
