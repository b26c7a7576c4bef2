// SPDX-License-Identifier: MIT OR Apache-2.0
//! Template store, selection, and the processor facade.

use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use vp_core::{TurnNumber, VerificationType};
use vp_error::{ErrorCode, VerifyError, VerifyResult};

use crate::engine;

/// Select the template id for a `(verification type, turn)` pair.
#[must_use]
pub fn template_id(verification_type: VerificationType, turn: TurnNumber) -> &'static str {
    match (verification_type, turn) {
        (VerificationType::LayoutVsChecking, TurnNumber::One) => "turn1-layout-vs-checking",
        (VerificationType::PreviousVsCurrent, TurnNumber::One) => "turn1-previous-vs-current",
        (VerificationType::LayoutVsChecking, TurnNumber::Two) => "turn2-layout-vs-checking",
        (VerificationType::PreviousVsCurrent, TurnNumber::Two) => "turn2-previous-vs-current",
    }
}

/// The embedded default for a template id.
#[must_use]
pub fn embedded(id: &str) -> Option<&'static str> {
    match id {
        "turn1-layout-vs-checking" => Some(include_str!("templates/turn1-layout-vs-checking.tmpl")),
        "turn1-previous-vs-current" => Some(include_str!("templates/turn1-previous-vs-current.tmpl")),
        "turn2-layout-vs-checking" => Some(include_str!("templates/turn2-layout-vs-checking.tmpl")),
        "turn2-previous-vs-current" => Some(include_str!("templates/turn2-previous-vs-current.tmpl")),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// TemplateStore
// ---------------------------------------------------------------------------

/// Loads versioned template sources from disk, falling back to the embedded
/// defaults when no base path is configured.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    base_path: Option<PathBuf>,
    version: String,
}

impl TemplateStore {
    /// Create a store over `base_path` (templates live at
    /// `<base>/<version>/<id>.tmpl`) or the embedded defaults when `None`.
    #[must_use]
    pub fn new(base_path: Option<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            base_path,
            version: version.into(),
        }
    }

    /// The template set version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Load a template's source text.
    pub fn source(&self, id: &str) -> VerifyResult<String> {
        match &self.base_path {
            Some(base) => {
                let path = base.join(&self.version).join(format!("{id}.tmpl"));
                std::fs::read_to_string(&path).map_err(|e| {
                    VerifyError::new(
                        ErrorCode::TemplateNotFound,
                        format!("template {id} (version {}) unreadable: {e}", self.version),
                    )
                    .with_detail("path", path.display().to_string())
                })
            }
            None => embedded(id)
                .map(ToString::to_string)
                .ok_or_else(|| {
                    VerifyError::new(
                        ErrorCode::TemplateNotFound,
                        format!("no embedded template named {id}"),
                    )
                }),
        }
    }
}

// ---------------------------------------------------------------------------
// TemplateProcessor
// ---------------------------------------------------------------------------

/// The rendered turn prompt plus its provenance.
///
/// Input/output token counts are populated on the persisted prompt record
/// only after the model call; this struct carries the render-time estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedPrompt {
    /// The rendered prompt text.
    pub rendered_prompt: String,
    /// Template the prompt came from.
    pub template_id: String,
    /// Version of the template set.
    pub template_version: String,
    /// Render time in milliseconds.
    pub processing_time_ms: u64,
    /// Rough token estimate (`len / 4`).
    pub token_estimate: u64,
}

/// Selects and renders turn-specific prompt templates.
#[derive(Debug, Clone)]
pub struct TemplateProcessor {
    store: TemplateStore,
}

impl TemplateProcessor {
    /// Create a processor over a template store.
    #[must_use]
    pub fn new(store: TemplateStore) -> Self {
        Self { store }
    }

    /// Select the template for `(verification_type, turn)` and render it
    /// against `context`.
    pub fn render_turn_prompt(
        &self,
        verification_type: VerificationType,
        turn: TurnNumber,
        context: &Value,
    ) -> VerifyResult<RenderedPrompt> {
        let id = template_id(verification_type, turn);
        let started = Instant::now();
        let source = self.store.source(id)?;
        let rendered = engine::render(&source, context).map_err(|e| {
            VerifyError::new(ErrorCode::TemplateRenderFailed, e.to_string())
                .with_detail("template_id", id)
                .with_detail("template_version", self.store.version())
        })?;
        let token_estimate = (rendered.len() / 4) as u64;
        Ok(RenderedPrompt {
            rendered_prompt: rendered,
            template_id: id.to_string(),
            template_version: self.store.version().to_string(),
            processing_time_ms: started.elapsed().as_millis() as u64,
            token_estimate,
        })
    }
}
