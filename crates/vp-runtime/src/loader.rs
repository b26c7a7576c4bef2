// SPDX-License-Identifier: MIT OR Apache-2.0
//! Concurrent context loading with retry and a first-error latch.
//!
//! Turn 1 fans out over {system prompt, reference image}; Turn 2 over
//! {system prompt, checking image, Turn-1 raw, Turn-1 processed}. The
//! futures run concurrently under a join; the first failure is stored in a
//! mutex-guarded latch and cancels the shared token so the remaining tasks
//! abort their retry loops. The loader never partial-returns.

use std::sync::Mutex;

use tracing::debug;

use vp_core::{
    ArtifactReference, CancelToken, ImageFormat, TurnRequest,
    artifacts::{ProcessedResponseArtifact, RawResponseArtifact},
};
use vp_error::{ErrorCode, VerifyError, VerifyResult};
use vp_retry::{RetryPolicy, run_with_retry};
use vp_store::ArtifactStoreClient;

// ---------------------------------------------------------------------------
// First-error latch
// ---------------------------------------------------------------------------

/// Atomically stores the first error produced by the fan-out tasks; readable
/// after all producers have joined.
#[derive(Debug, Default)]
pub struct FirstErrorLatch {
    slot: Mutex<Option<VerifyError>>,
}

impl FirstErrorLatch {
    /// Create an empty latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `err` if no error has been recorded yet.
    pub fn record(&self, err: VerifyError) {
        let mut slot = self.slot.lock().expect("latch lock poisoned");
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Take the recorded error, if any.
    pub fn take(&self) -> Option<VerifyError> {
        self.slot.lock().expect("latch lock poisoned").take()
    }
}

// ---------------------------------------------------------------------------
// Loaded contexts
// ---------------------------------------------------------------------------

/// Everything Turn 1 needs from storage.
#[derive(Debug, Clone)]
pub struct LoadedContextTurn1 {
    /// The system prompt text.
    pub system_prompt: String,
    /// The reference image payload.
    pub reference_image: String,
    /// Detected image format.
    pub reference_format: ImageFormat,
}

/// Everything Turn 2 needs from storage.
#[derive(Debug, Clone)]
pub struct LoadedContextTurn2 {
    /// The system prompt text.
    pub system_prompt: String,
    /// The checking image payload.
    pub checking_image: String,
    /// Detected image format.
    pub checking_format: ImageFormat,
    /// The Turn-1 raw-response artifact.
    pub turn1_raw: RawResponseArtifact,
    /// The Turn-1 processed-response artifact.
    pub turn1_processed: ProcessedResponseArtifact,
}

// ---------------------------------------------------------------------------
// ContextLoader
// ---------------------------------------------------------------------------

/// Concurrently fetches the inputs required by the current turn.
#[derive(Clone)]
pub struct ContextLoader {
    client: ArtifactStoreClient,
    policy: RetryPolicy,
}

impl ContextLoader {
    /// Create a loader with the standard retry policy (base 100 ms, cap 2 s,
    /// 3 attempts).
    #[must_use]
    pub fn new(client: ArtifactStoreClient) -> Self {
        Self {
            client,
            policy: RetryPolicy::loader_default(),
        }
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Load the Turn-1 context: {system prompt, reference image}.
    pub async fn load_context_turn1(
        &self,
        request: &TurnRequest,
        cancel: &CancelToken,
    ) -> VerifyResult<LoadedContextTurn1> {
        let image_ref = request
            .images
            .reference_base64
            .as_ref()
            .ok_or_else(|| missing_reference("images.referenceBase64"))?;

        let shared = CancelToken::new();
        let latch = FirstErrorLatch::new();

        let (system_prompt, image) = tokio::join!(
            self.load_system_prompt_task(&request.prompts.system, cancel, &shared, &latch),
            self.load_image_task(image_ref, cancel, &shared, &latch),
        );

        if let Some(err) = latch.take() {
            return Err(err);
        }
        match (system_prompt, image) {
            (Some(system_prompt), Some((reference_image, reference_format))) => {
                debug!(target: "vp.loader", turn = 1, "context loaded");
                Ok(LoadedContextTurn1 {
                    system_prompt,
                    reference_image,
                    reference_format,
                })
            }
            _ => Err(VerifyError::new(
                ErrorCode::Internal,
                "context loader joined without results or a recorded error",
            )),
        }
    }

    /// Load the Turn-2 context: {system prompt, checking image, Turn-1 raw,
    /// Turn-1 processed}.
    pub async fn load_context_turn2(
        &self,
        request: &TurnRequest,
        cancel: &CancelToken,
    ) -> VerifyResult<LoadedContextTurn2> {
        let image_ref = request
            .images
            .checking_base64
            .as_ref()
            .ok_or_else(|| missing_reference("images.checkingBase64"))?;
        let turn1 = request
            .turn1
            .as_ref()
            .ok_or_else(|| missing_reference("turn1"))?;

        let shared = CancelToken::new();
        let latch = FirstErrorLatch::new();

        let (system_prompt, image, turn1_raw, turn1_processed) = tokio::join!(
            self.load_system_prompt_task(&request.prompts.system, cancel, &shared, &latch),
            self.load_image_task(image_ref, cancel, &shared, &latch),
            self.load_json_task::<RawResponseArtifact>(
                &turn1.raw_response,
                "turn1_raw_load",
                cancel,
                &shared,
                &latch,
            ),
            self.load_json_task::<ProcessedResponseArtifact>(
                &turn1.processed_response,
                "turn1_processed_load",
                cancel,
                &shared,
                &latch,
            ),
        );

        if let Some(err) = latch.take() {
            return Err(err);
        }
        match (system_prompt, image, turn1_raw, turn1_processed) {
            (
                Some(system_prompt),
                Some((checking_image, checking_format)),
                Some(turn1_raw),
                Some(turn1_processed),
            ) => {
                debug!(target: "vp.loader", turn = 2, "context loaded");
                Ok(LoadedContextTurn2 {
                    system_prompt,
                    checking_image,
                    checking_format,
                    turn1_raw,
                    turn1_processed,
                })
            }
            _ => Err(VerifyError::new(
                ErrorCode::Internal,
                "context loader joined without results or a recorded error",
            )),
        }
    }

    async fn load_system_prompt_task(
        &self,
        reference: &ArtifactReference,
        ambient: &CancelToken,
        shared: &CancelToken,
        latch: &FirstErrorLatch,
    ) -> Option<String> {
        let client = self.client.clone();
        let key = reference.key.clone();
        let reference = reference.clone();
        let ambient = ambient.clone();
        let shared_clone = shared.clone();
        let outcome = run_with_retry(&self.policy, shared, "system_prompt_load", move || {
            let client = client.clone();
            let reference = reference.clone();
            let ambient = ambient.clone();
            let shared = shared_clone.clone();
            async move {
                if ambient.is_cancelled() {
                    return Err(VerifyError::cancelled("system_prompt_load"));
                }
                load_system_prompt(&client, &reference, &shared).await
            }
        })
        .await;
        self.settle(outcome, "system_prompt_load", &key, shared, latch)
    }

    async fn load_image_task(
        &self,
        reference: &ArtifactReference,
        ambient: &CancelToken,
        shared: &CancelToken,
        latch: &FirstErrorLatch,
    ) -> Option<(String, ImageFormat)> {
        let client = self.client.clone();
        let key = reference.key.clone();
        let reference = reference.clone();
        let ambient = ambient.clone();
        let shared_clone = shared.clone();
        let outcome = run_with_retry(&self.policy, shared, "base64_image_load", move || {
            let client = client.clone();
            let reference = reference.clone();
            let ambient = ambient.clone();
            let shared = shared_clone.clone();
            async move {
                if ambient.is_cancelled() {
                    return Err(VerifyError::cancelled("base64_image_load"));
                }
                client.load_base64_image(&reference, &shared).await
            }
        })
        .await;
        self.settle(outcome, "base64_image_load", &key, shared, latch)
    }

    async fn load_json_task<T: serde::de::DeserializeOwned>(
        &self,
        reference: &ArtifactReference,
        operation: &'static str,
        ambient: &CancelToken,
        shared: &CancelToken,
        latch: &FirstErrorLatch,
    ) -> Option<T> {
        let client = self.client.clone();
        let key = reference.key.clone();
        let reference = reference.clone();
        let ambient = ambient.clone();
        let shared_clone = shared.clone();
        let outcome = run_with_retry(&self.policy, shared, operation, move || {
            let client = client.clone();
            let reference = reference.clone();
            let ambient = ambient.clone();
            let shared = shared_clone.clone();
            async move {
                if ambient.is_cancelled() {
                    return Err(VerifyError::cancelled(operation));
                }
                client.load_json::<T>(&reference, &shared).await
            }
        })
        .await;
        self.settle(outcome, operation, &key, shared, latch)
    }

    /// First error wins: enrich it with the loading context, latch it, and
    /// cancel the sibling tasks.
    fn settle<T>(
        &self,
        outcome: VerifyResult<T>,
        operation: &str,
        key: &str,
        shared: &CancelToken,
        latch: &FirstErrorLatch,
    ) -> Option<T> {
        match outcome {
            Ok(value) => Some(value),
            Err(err) => {
                let enriched = err
                    .with_detail("stage", "context_loading")
                    .with_detail("operation", operation)
                    .with_detail("s3_key", key);
                latch.record(enriched);
                shared.cancel();
                None
            }
        }
    }

}

/// A system prompt artifact is either a JSON record with a `content` field
/// or bare text.
async fn load_system_prompt(
    client: &ArtifactStoreClient,
    reference: &ArtifactReference,
    cancel: &CancelToken,
) -> VerifyResult<String> {
    let text = client.load_text(reference, cancel).await?;
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text)
        && let Some(content) = value.get("content").and_then(|v| v.as_str())
    {
        return Ok(content.to_string());
    }
    Ok(text)
}

fn missing_reference(field: &str) -> VerifyError {
    VerifyError::new(
        ErrorCode::MissingRequiredField,
        format!("turn request lacks {field}"),
    )
    .with_detail("field", field)
}
