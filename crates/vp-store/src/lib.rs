// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed load/store of JSON, text, and base64 objects in the state bucket.
//!
//! [`ObjectStore`] is the narrow backend seam; [`ArtifactStoreClient`] adds
//! the typed operations and the deterministic key layout the pipeline uses.
//! A `NotFound` result is typed and distinct from transient failures so the
//! retry layer never spins on a missing object.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// In-memory store used by tests and local runs.
pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

use vp_core::{
    ArtifactCategory, ArtifactReference, CancelToken, ImageFormat, MAX_BASE64_IMAGE_BYTES,
    artifact_key,
};
use vp_error::{ErrorCode, VerifyError, VerifyResult};

pub use memory::InMemoryObjectStore;

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// Errors surfaced by an [`ObjectStore`] backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The object does not exist. Never retried.
    #[error("object not found: s3://{bucket}/{key}")]
    NotFound {
        /// Bucket that was queried.
        bucket: String,
        /// Key that was queried.
        key: String,
    },

    /// A transient failure; the operation may succeed on retry.
    #[error("transient object-store failure on {key}: {reason}")]
    Transient {
        /// Key involved.
        key: String,
        /// Backend detail.
        reason: String,
    },

    /// A non-transient I/O failure.
    #[error("object-store I/O failure on {key}: {reason}")]
    Io {
        /// Key involved.
        key: String,
        /// Backend detail.
        reason: String,
    },
}

/// Raw byte-level access to an object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object's bytes.
    async fn get(&self, reference: &ArtifactReference) -> Result<Vec<u8>, StoreError>;

    /// Store an object's bytes under the given content type.
    async fn put(
        &self,
        reference: &ArtifactReference,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// ArtifactStoreClient
// ---------------------------------------------------------------------------

/// Typed artifact operations over an [`ObjectStore`] backend.
///
/// Keys are computed deterministically from
/// `(verificationId, datePartition, category, filename)`; all operations
/// honor the ambient [`CancelToken`] and perform no caching.
#[derive(Clone)]
pub struct ArtifactStoreClient {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl ArtifactStoreClient {
    /// Create a client for the given state bucket.
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    /// The state bucket this client writes to.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Load and deserialize a JSON object.
    pub async fn load_json<T: DeserializeOwned>(
        &self,
        reference: &ArtifactReference,
        cancel: &CancelToken,
    ) -> VerifyResult<T> {
        let bytes = self.get_bytes(reference, cancel).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            VerifyError::new(
                ErrorCode::ObjectReadFailed,
                format!("object is not valid JSON: {e}"),
            )
            .with_retry(false, vp_error::RetryStrategy::None)
            .with_detail("s3_key", &reference.key)
            .with_api_source("object-get")
        })
    }

    /// Load an object as UTF-8 text.
    pub async fn load_text(
        &self,
        reference: &ArtifactReference,
        cancel: &CancelToken,
    ) -> VerifyResult<String> {
        let bytes = self.get_bytes(reference, cancel).await?;
        String::from_utf8(bytes).map_err(|e| {
            VerifyError::new(
                ErrorCode::ObjectReadFailed,
                format!("object is not valid UTF-8: {e}"),
            )
            .with_retry(false, vp_error::RetryStrategy::None)
            .with_detail("s3_key", &reference.key)
            .with_api_source("object-get")
        })
    }

    /// Load a base64 image payload and detect its format.
    pub async fn load_base64_image(
        &self,
        reference: &ArtifactReference,
        cancel: &CancelToken,
    ) -> VerifyResult<(String, ImageFormat)> {
        let text = self.load_text(reference, cancel).await?;
        let payload = text.trim().to_string();
        let format = ImageFormat::detect(&payload);
        debug!(
            target: "vp.store",
            key = %reference.key,
            format = %format,
            bytes = payload.len(),
            "loaded base64 image"
        );
        Ok((payload, format))
    }

    /// Serialize and store a JSON artifact, returning its reference.
    pub async fn store_json<T: Serialize>(
        &self,
        verification_id: &str,
        date_partition: Option<&str>,
        category: ArtifactCategory,
        filename: &str,
        value: &T,
        cancel: &CancelToken,
    ) -> VerifyResult<ArtifactReference> {
        let bytes = serde_json::to_vec(value).map_err(|e| {
            VerifyError::new(ErrorCode::ObjectWriteFailed, format!("serialization failed: {e}"))
                .with_retry(false, vp_error::RetryStrategy::None)
        })?;
        self.put_bytes(
            verification_id,
            date_partition,
            category,
            filename,
            bytes,
            "application/json",
            cancel,
        )
        .await
    }

    /// Store a text artifact under the given content type.
    pub async fn store_text(
        &self,
        verification_id: &str,
        date_partition: Option<&str>,
        category: ArtifactCategory,
        filename: &str,
        text: &str,
        content_type: &str,
        cancel: &CancelToken,
    ) -> VerifyResult<ArtifactReference> {
        self.put_bytes(
            verification_id,
            date_partition,
            category,
            filename,
            text.as_bytes().to_vec(),
            content_type,
            cancel,
        )
        .await
    }

    /// Store a base64 image payload, rejecting payloads over 20 MiB before
    /// upload.
    pub async fn store_base64_image(
        &self,
        verification_id: &str,
        date_partition: Option<&str>,
        filename: &str,
        payload: &str,
        cancel: &CancelToken,
    ) -> VerifyResult<ArtifactReference> {
        if payload.len() > MAX_BASE64_IMAGE_BYTES {
            return Err(VerifyError::new(
                ErrorCode::ImageTooLarge,
                format!(
                    "base64 image payload is {} bytes (limit {})",
                    payload.len(),
                    MAX_BASE64_IMAGE_BYTES
                ),
            )
            .with_detail("filename", filename)
            .with_verification_id(verification_id));
        }
        self.put_bytes(
            verification_id,
            date_partition,
            ArtifactCategory::Images,
            filename,
            payload.as_bytes().to_vec(),
            "text/plain",
            cancel,
        )
        .await
    }

    async fn get_bytes(
        &self,
        reference: &ArtifactReference,
        cancel: &CancelToken,
    ) -> VerifyResult<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(VerifyError::cancelled("object-get"));
        }
        self.store
            .get(reference)
            .await
            .map_err(|e| map_store_error(e, true))
    }

    #[allow(clippy::too_many_arguments)]
    async fn put_bytes(
        &self,
        verification_id: &str,
        date_partition: Option<&str>,
        category: ArtifactCategory,
        filename: &str,
        bytes: Vec<u8>,
        content_type: &str,
        cancel: &CancelToken,
    ) -> VerifyResult<ArtifactReference> {
        if cancel.is_cancelled() {
            return Err(VerifyError::cancelled("object-put"));
        }
        let key = artifact_key(date_partition, verification_id, category, filename);
        let reference =
            ArtifactReference::new(self.bucket.clone(), key).with_size(bytes.len() as u64);
        debug!(
            target: "vp.store",
            key = %reference.key,
            content_type,
            bytes = bytes.len(),
            "storing artifact"
        );
        self.store
            .put(&reference, bytes, content_type)
            .await
            .map_err(|e| map_store_error(e, false))?;
        Ok(reference)
    }
}

/// Map a backend [`StoreError`] to the pipeline taxonomy.
fn map_store_error(err: StoreError, is_read: bool) -> VerifyError {
    let api_source = if is_read { "object-get" } else { "object-put" };
    match err {
        StoreError::NotFound { ref key, .. } => {
            let key = key.clone();
            VerifyError::new(ErrorCode::ObjectNotFound, err.to_string())
                .with_detail("s3_key", key)
                .with_api_source(api_source)
        }
        StoreError::Transient { ref key, .. } | StoreError::Io { ref key, .. } => {
            let code = if is_read {
                ErrorCode::ObjectReadFailed
            } else {
                ErrorCode::ObjectWriteFailed
            };
            let key = key.clone();
            VerifyError::new(code, err.to_string())
                .with_detail("s3_key", key)
                .with_api_source(api_source)
        }
    }
}
