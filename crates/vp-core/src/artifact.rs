// SPDX-License-Identifier: MIT OR Apache-2.0
//! Artifact references and the date-partitioned object key layout.
//!
//! Keys follow `YYYY/MM/DD/<verificationId>/<category>/<filename>`; the
//! initialization record sits directly under the verification prefix. The
//! date partition is extracted from a key when present and omitted otherwise.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum accepted size for a base64 image payload (20 MiB). Enforced
/// before upload; a payload of exactly this size passes.
pub const MAX_BASE64_IMAGE_BYTES: usize = 20 * 1024 * 1024;

// ---------------------------------------------------------------------------
// ArtifactReference
// ---------------------------------------------------------------------------

/// Immutable identity of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactReference {
    /// Bucket the object lives in.
    pub bucket: String,
    /// Object key within the bucket.
    pub key: String,
    /// Object size in bytes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Entity tag, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl ArtifactReference {
    /// Create a reference from a bucket and key.
    #[must_use]
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            size: None,
            etag: None,
        }
    }

    /// Attach the object size.
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Extract the `YYYY/MM/DD` date partition from the key, when the key
    /// starts with one.
    #[must_use]
    pub fn date_partition(&self) -> Option<String> {
        let mut segments = self.key.split('/');
        let year = segments.next()?;
        let month = segments.next()?;
        let day = segments.next()?;
        let numeric = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_digit());
        if numeric(year, 4) && numeric(month, 2) && numeric(day, 2) {
            Some(format!("{year}/{month}/{day}"))
        } else {
            None
        }
    }

    /// The final path segment of the key.
    #[must_use]
    pub fn filename(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

// ---------------------------------------------------------------------------
// ArtifactCategory & key computation
// ---------------------------------------------------------------------------

/// Category segment of an artifact key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactCategory {
    /// The verification's initialization record. Stored directly under the
    /// verification prefix, without a category directory.
    Initialization,
    /// Image payloads and their metadata.
    Images,
    /// System and rendered turn prompts.
    Prompts,
    /// Raw and processed model responses.
    Responses,
    /// Intermediate processing artifacts (layout metadata, historical context).
    Processing,
    /// Conversation transcripts per turn.
    Conversation,
}

impl ArtifactCategory {
    /// Key-segment string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialization => "initialization",
            Self::Images => "images",
            Self::Prompts => "prompts",
            Self::Responses => "responses",
            Self::Processing => "processing",
            Self::Conversation => "conversation",
        }
    }
}

impl fmt::Display for ArtifactCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute the deterministic object key for an artifact.
///
/// With a date partition the key is
/// `<YYYY/MM/DD>/<verificationId>/<category>/<filename>`; without one the
/// partition segment is omitted. [`ArtifactCategory::Initialization`] never
/// gets a category directory — its filename sits directly under the
/// verification prefix.
#[must_use]
pub fn artifact_key(
    date_partition: Option<&str>,
    verification_id: &str,
    category: ArtifactCategory,
    filename: &str,
) -> String {
    let mut key = String::new();
    if let Some(partition) = date_partition {
        key.push_str(partition);
        key.push('/');
    }
    key.push_str(verification_id);
    key.push('/');
    if category != ArtifactCategory::Initialization {
        key.push_str(category.as_str());
        key.push('/');
    }
    key.push_str(filename);
    key
}

/// Format the date partition for a timestamp (`YYYY/MM/DD`).
#[must_use]
pub fn date_partition_for(at: &DateTime<Utc>) -> String {
    at.format("%Y/%m/%d").to_string()
}
