// SPDX-License-Identifier: MIT OR Apache-2.0
//! Best-effort historical context resolution for `PREVIOUS_VS_CURRENT`.
//!
//! Failures never block the turn: a miss or a lookup error leaves the
//! context absent and logs a single warning. The machine structure is
//! recovered from the previous verification's typed field first, then its
//! untyped projection, then the layout-metadata table.

use std::sync::Arc;

use tracing::warn;

use vp_core::{CancelToken, HistoricalContext, VerificationContext};
use vp_metadata::MetadataStore;

/// Resolves `historicalContext` for `PREVIOUS_VS_CURRENT` verifications.
pub struct HistoricalContextResolver {
    metadata: Arc<dyn MetadataStore>,
}

impl HistoricalContextResolver {
    /// Create a resolver over the metadata store.
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }

    /// Derive the checking-image key from an image S3 key: the last path
    /// segment after `/images/`.
    #[must_use]
    pub fn derive_checking_image_key(image_key: &str) -> Option<String> {
        let (_, tail) = image_key.split_once("/images/")?;
        tail.rsplit('/').next().map(ToString::to_string)
    }

    /// Populate `context.historical_context`, best-effort.
    ///
    /// `image_key` is the current turn's image S3 key. The context is either
    /// fully populated or left absent — never partially defaulted.
    pub async fn resolve(
        &self,
        context: &mut VerificationContext,
        image_key: &str,
        _cancel: &CancelToken,
    ) {
        let Some(checking_key) = Self::derive_checking_image_key(image_key) else {
            warn!(
                target: "vp.historical",
                code = "historical_lookup_miss",
                image_key,
                "image key has no /images/ segment; skipping historical lookup"
            );
            return;
        };

        let previous = match self.metadata.query_previous_verification(&checking_key).await {
            Ok(Some(previous)) => previous,
            Ok(None) => {
                warn!(
                    target: "vp.historical",
                    code = "historical_lookup_miss",
                    checking_image_key = %checking_key,
                    verification_id = %context.verification_id,
                    "no previous verification found"
                );
                return;
            }
            Err(err) => {
                warn!(
                    target: "vp.historical",
                    code = "historical_lookup_failed",
                    checking_image_key = %checking_key,
                    error = %err,
                    "previous-verification query failed; continuing without history"
                );
                return;
            }
        };

        let hours = (context.verification_at - previous.verification_at).num_seconds() as f64
            / 3600.0;
        let mut historical = HistoricalContext {
            previous_verification_at: previous.verification_at,
            previous_verification_status: previous.verification_status.clone(),
            previous_verification_id: previous.verification_id.clone(),
            hours_since_last_verification: hours,
            layout_id: previous.layout_id,
            layout_prefix: previous.layout_prefix.clone(),
            row_count: None,
            column_count: None,
            row_labels: None,
        };

        // Machine structure: typed field, then the untyped projection, then
        // the layout-metadata table.
        let structure = match previous.probe_machine_structure() {
            Some(structure) => Some(structure),
            None => {
                let layout_id = previous.layout_id.or(context.layout_id);
                let layout_prefix = previous
                    .layout_prefix
                    .clone()
                    .or_else(|| context.layout_prefix.clone());
                match (layout_id, layout_prefix) {
                    (Some(id), Some(prefix)) => {
                        match self.metadata.get_layout_metadata(id, &prefix).await {
                            Ok(Some(metadata)) => metadata.machine_structure,
                            Ok(None) => None,
                            Err(err) => {
                                warn!(
                                    target: "vp.historical",
                                    code = "layout_metadata_lookup_failed",
                                    layout_id = id,
                                    layout_prefix = %prefix,
                                    error = %err,
                                    "layout metadata lookup failed"
                                );
                                None
                            }
                        }
                    }
                    _ => None,
                }
            }
        };
        if let Some(structure) = structure {
            historical.row_count = Some(structure.row_count);
            historical.column_count = Some(structure.column_count);
            historical.row_labels = Some(structure.row_labels);
        }

        context.historical_context = Some(historical);
    }
}
