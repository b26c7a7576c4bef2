// SPDX-License-Identifier: MIT OR Apache-2.0
//! Artifact persistence in the canonical key layout.
//!
//! Writes land under `<datePartition>/<verificationId>/` in order: raw
//! response, processed response (JSON + markdown copy), prompt bundle,
//! conversation transcript. Keys embed the verification id and turn number,
//! so re-execution overwrites deterministically.

use vp_core::{
    ArtifactCategory, ArtifactReference, CancelToken, TurnNumber,
    artifacts::{ConversationArtifact, ProcessedResponseArtifact, PromptBundle, RawResponseArtifact},
};
use vp_error::VerifyResult;
use vp_store::ArtifactStoreClient;

/// References produced by the response-persistence pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedResponses {
    /// `responses/turn{N}-raw-response.json`.
    pub raw: ArtifactReference,
    /// `responses/turn{N}-processed-response.json`.
    pub processed: ArtifactReference,
    /// `responses/turn{N}-processed-response.md`.
    pub processed_markdown: ArtifactReference,
}

/// Writes turn artifacts back to the state bucket.
#[derive(Clone)]
pub struct ArtifactPersister {
    client: ArtifactStoreClient,
}

impl ArtifactPersister {
    /// Create a persister over the artifact store client.
    #[must_use]
    pub fn new(client: ArtifactStoreClient) -> Self {
        Self { client }
    }

    /// Persist the raw and processed responses (JSON + markdown copy).
    pub async fn persist_responses(
        &self,
        verification_id: &str,
        date_partition: Option<&str>,
        turn: TurnNumber,
        raw: &RawResponseArtifact,
        processed: &ProcessedResponseArtifact,
        markdown: &str,
        cancel: &CancelToken,
    ) -> VerifyResult<PersistedResponses> {
        let n = turn.as_u8();
        let raw_ref = self
            .client
            .store_json(
                verification_id,
                date_partition,
                ArtifactCategory::Responses,
                &format!("turn{n}-raw-response.json"),
                raw,
                cancel,
            )
            .await?;
        let processed_ref = self
            .client
            .store_json(
                verification_id,
                date_partition,
                ArtifactCategory::Responses,
                &format!("turn{n}-processed-response.json"),
                processed,
                cancel,
            )
            .await?;
        let markdown_ref = self
            .client
            .store_text(
                verification_id,
                date_partition,
                ArtifactCategory::Responses,
                &format!("turn{n}-processed-response.md"),
                markdown,
                "text/markdown",
                cancel,
            )
            .await?;
        Ok(PersistedResponses {
            raw: raw_ref,
            processed: processed_ref,
            processed_markdown: markdown_ref,
        })
    }

    /// Persist the prompt bundle for a turn.
    pub async fn persist_prompt_bundle(
        &self,
        verification_id: &str,
        date_partition: Option<&str>,
        turn: TurnNumber,
        bundle: &PromptBundle,
        cancel: &CancelToken,
    ) -> VerifyResult<ArtifactReference> {
        self.client
            .store_json(
                verification_id,
                date_partition,
                ArtifactCategory::Prompts,
                &format!("turn{}-prompt.json", turn.as_u8()),
                bundle,
                cancel,
            )
            .await
    }

    /// Persist the conversation transcript for a turn.
    pub async fn persist_conversation(
        &self,
        verification_id: &str,
        date_partition: Option<&str>,
        turn: TurnNumber,
        conversation: &ConversationArtifact,
        cancel: &CancelToken,
    ) -> VerifyResult<ArtifactReference> {
        self.client
            .store_json(
                verification_id,
                date_partition,
                ArtifactCategory::Conversation,
                &format!("turn{}.json", turn.as_u8()),
                conversation,
                cancel,
            )
            .await
    }

    /// Persist the resolved historical context.
    pub async fn persist_historical_context<T: serde::Serialize>(
        &self,
        verification_id: &str,
        date_partition: Option<&str>,
        historical: &T,
        cancel: &CancelToken,
    ) -> VerifyResult<ArtifactReference> {
        self.client
            .store_json(
                verification_id,
                date_partition,
                ArtifactCategory::Processing,
                "historical-context.json",
                historical,
                cancel,
            )
            .await
    }
}
