// SPDX-License-Identifier: MIT OR Apache-2.0
//! vp-core
//!
//! The stable contract for the verify-pipeline turn engine: verification
//! context and typing, artifact references and key layout, normalized LLM
//! responses, append-only histories, discrepancies, and the output envelope
//! handed to the workflow controller.
//!
//! If you only take one dependency, take this one.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Artifact references, categories, and the date-partitioned key layout.
pub mod artifact;
/// Persisted artifact document bodies (raw / processed / prompt / conversation).
pub mod artifacts;
/// Cooperative cancellation token shared by every I/O boundary.
pub mod cancel;
/// Base64 image format detection.
pub mod image;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use artifact::{ArtifactCategory, ArtifactReference, MAX_BASE64_IMAGE_BYTES, artifact_key};
pub use cancel::CancelToken;
pub use image::ImageFormat;

/// Schema version embedded in every output envelope.
pub const SCHEMA_VERSION: &str = "2.1.0";

/// Schema versions accepted on input. Anything older than the current
/// version is processed with a warning; anything outside this list is a
/// validation error.
pub const ACCEPTED_SCHEMA_VERSIONS: &[&str] = &["1.1.0", "2.0.0", "2.1.0"];

// ---------------------------------------------------------------------------
// Verification identity & typing
// ---------------------------------------------------------------------------

/// What a verification compares the checking image against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationType {
    /// Compare the image to a stored planogram layout.
    LayoutVsChecking,
    /// Compare the image to a prior verification of the same slot.
    PreviousVsCurrent,
}

impl VerificationType {
    /// Wire-format string (e.g. `"LAYOUT_VS_CHECKING"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LayoutVsChecking => "LAYOUT_VS_CHECKING",
            Self::PreviousVsCurrent => "PREVIOUS_VS_CURRENT",
        }
    }
}

impl fmt::Display for VerificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the two sequential LLM-invocation turns is executing.
///
/// Serialized as the bare number `1` or `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TurnNumber {
    /// Turn 1: reference analysis.
    One,
    /// Turn 2: checking analysis + comparison.
    Two,
}

impl TurnNumber {
    /// The numeric turn value used in artifact keys and statuses.
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }
}

impl TryFrom<u8> for TurnNumber {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            other => Err(format!("invalid turn number {other} (expected 1 or 2)")),
        }
    }
}

impl From<TurnNumber> for u8 {
    fn from(value: TurnNumber) -> Self {
        value.as_u8()
    }
}

impl fmt::Display for TurnNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Machine-structure description for a specific vending-machine layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStructure {
    /// Number of rows in the machine.
    pub row_count: u32,
    /// Number of columns in the machine.
    pub column_count: u32,
    /// Row labels in top-to-bottom order (e.g. `["A", "B", "C"]`).
    #[serde(default)]
    pub row_labels: Vec<String>,
}

/// A single slot → product assignment within a layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProductPosition {
    /// Slot coordinate (e.g. `"A3"`).
    pub position: String,
    /// Expected product name.
    pub product_name: String,
    /// Optional product identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<i64>,
}

/// Layout metadata: machine structure plus the product position mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LayoutMetadata {
    /// Layout identifier, when the metadata record carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_id: Option<i64>,
    /// Layout prefix, when the metadata record carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_prefix: Option<String>,
    /// Machine rows/columns/labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_structure: Option<MachineStructure>,
    /// Slot → expected product assignments.
    #[serde(default)]
    pub product_positions: Vec<ProductPosition>,
    /// Physical location of the machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Fields the typed model does not know about.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Historical context attached to `PREVIOUS_VS_CURRENT` verifications.
///
/// Wire keys are PascalCase (`PreviousVerificationAt`, ...). The struct is
/// only ever fully populated or absent — a failed lookup leaves the context
/// off the verification entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HistoricalContext {
    /// When the previous verification ran.
    pub previous_verification_at: DateTime<Utc>,
    /// Final status of the previous verification.
    pub previous_verification_status: String,
    /// Identifier of the previous verification.
    pub previous_verification_id: String,
    /// Hours elapsed since the previous verification.
    pub hours_since_last_verification: f64,
    /// Layout identifier carried over from the previous verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_id: Option<i64>,
    /// Layout prefix carried over from the previous verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_prefix: Option<String>,
    /// Machine row count, when recoverable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u32>,
    /// Machine column count, when recoverable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_count: Option<u32>,
    /// Machine row labels, when recoverable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_labels: Option<Vec<String>>,
}

/// A previous verification record as returned by the metadata store.
///
/// Historical records written by older deployments embed the machine
/// structure under varying keys, so the typed field is backed by an untyped
/// projection: [`PreviousVerification::probe_machine_structure`] tries the
/// strongly-typed path first, then the map, then gives up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviousVerification {
    /// Identifier of the previous verification.
    pub verification_id: String,
    /// When the previous verification ran.
    pub verification_at: DateTime<Utc>,
    /// Final status of the previous verification.
    pub verification_status: String,
    /// Layout identifier, when recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_id: Option<i64>,
    /// Layout prefix, when recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_prefix: Option<String>,
    /// Machine structure, when the record carries the current shape.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_structure: Option<MachineStructure>,
    /// Everything else on the record.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl PreviousVerification {
    /// Recover the machine structure: typed field first, then an untyped
    /// probe of the legacy keys, then `None`.
    #[must_use]
    pub fn probe_machine_structure(&self) -> Option<MachineStructure> {
        if let Some(ms) = &self.machine_structure {
            return Some(ms.clone());
        }
        for key in ["machineStructure", "MachineStructure", "machine_structure"] {
            if let Some(value) = self.extra.get(key)
                && let Ok(ms) = serde_json::from_value::<MachineStructure>(value.clone())
            {
                return Some(ms);
            }
        }
        None
    }
}

/// The identity and typing of a verification run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationContext {
    /// Globally unique verification identifier.
    pub verification_id: String,
    /// When the verification was initiated.
    pub verification_at: DateTime<Utc>,
    /// What the verification compares against.
    pub verification_type: VerificationType,
    /// Layout identifier; required for `LAYOUT_VS_CHECKING`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_id: Option<i64>,
    /// Layout prefix; required for `LAYOUT_VS_CHECKING`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_prefix: Option<String>,
    /// Identifier of the vending machine under verification.
    #[serde(default)]
    pub vending_machine_id: String,
    /// Layout metadata, when loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_metadata: Option<LayoutMetadata>,
    /// Historical context; populated only for `PREVIOUS_VS_CURRENT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub historical_context: Option<HistoricalContext>,
}

impl VerificationContext {
    /// Validate structural invariants, returning every problem found.
    ///
    /// The `(layout_id, layout_prefix)` pair must be either both empty or
    /// both populated, and `LAYOUT_VS_CHECKING` requires the pair.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        if self.verification_id.trim().is_empty() {
            problems.push("verificationId must not be empty".to_string());
        }
        let has_prefix = self
            .layout_prefix
            .as_deref()
            .is_some_and(|p| !p.is_empty());
        if self.layout_id.is_some() != has_prefix {
            problems.push(
                "layoutId and layoutPrefix must be both empty or both populated".to_string(),
            );
        }
        if self.verification_type == VerificationType::LayoutVsChecking
            && (self.layout_id.is_none() || !has_prefix)
        {
            problems.push("LAYOUT_VS_CHECKING requires layoutId and layoutPrefix".to_string());
        }
        if problems.is_empty() { Ok(()) } else { Err(problems) }
    }

    /// Back-fill `layout_id` / `layout_prefix` from the layout metadata when
    /// both are initially empty. Populated values are never overwritten.
    pub fn backfill_layout_identity(&mut self) {
        if self.layout_id.is_some() || self.layout_prefix.is_some() {
            return;
        }
        if let Some(meta) = &self.layout_metadata
            && let (Some(id), Some(prefix)) = (meta.layout_id, meta.layout_prefix.clone())
        {
            self.layout_id = Some(id);
            self.layout_prefix = Some(prefix);
        }
    }
}

// ---------------------------------------------------------------------------
// Turn request
// ---------------------------------------------------------------------------

/// Prompt artifact references on a turn request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptReferences {
    /// The system prompt artifact.
    pub system: ArtifactReference,
}

/// Image artifact references on a turn request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageReferences {
    /// Reference-state image (Turn 1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_base64: Option<ArtifactReference>,
    /// Checking-state image (Turn 2).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checking_base64: Option<ArtifactReference>,
}

/// Turn-1 output references consumed by Turn 2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorTurnReferences {
    /// The Turn-1 raw-response artifact.
    pub raw_response: ArtifactReference,
    /// The Turn-1 processed-response artifact.
    pub processed_response: ArtifactReference,
}

/// Optional processing artifact references on a turn request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingReferences {
    /// Layout metadata artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_metadata: Option<ArtifactReference>,
    /// Historical context artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub historical_context: Option<ArtifactReference>,
}

/// Input to a single turn execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    /// Verification identifier (duplicated from the context for convenience).
    pub verification_id: String,
    /// Which turn to execute.
    pub turn_number: TurnNumber,
    /// Full verification context.
    pub verification_context: VerificationContext,
    /// Prompt references.
    pub prompts: PromptReferences,
    /// Image references, grouped by purpose.
    #[serde(default)]
    pub images: ImageReferences,
    /// Turn-1 output references (Turn 2 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn1: Option<PriorTurnReferences>,
    /// Optional processing references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing: Option<ProcessingReferences>,
}

// ---------------------------------------------------------------------------
// Normalized LLM response
// ---------------------------------------------------------------------------

/// Token usage for a single model call, as reported in the envelope summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct TokenUsage {
    /// Input tokens consumed.
    pub input: u64,
    /// Output tokens generated.
    pub output: u64,
    /// Extended-reasoning tokens spent, when reasoning was enabled.
    pub thinking: u64,
    /// Total tokens.
    pub total: u64,
}

/// Provider response normalized to the shape the pipeline consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmResponse {
    /// The model's text output.
    pub content: String,
    /// Input tokens consumed.
    pub input_tokens: u64,
    /// Output tokens generated.
    pub output_tokens: u64,
    /// Extended-reasoning tokens, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_tokens: Option<u64>,
    /// Total tokens.
    pub total_tokens: u64,
    /// Provider request identifier.
    pub request_id: String,
    /// Model that served the request.
    pub model_id: String,
    /// Why generation stopped.
    pub stop_reason: String,
    /// Measured invocation latency in milliseconds.
    pub latency_ms: u64,
    /// Full serialized provider payload, kept for audit.
    pub raw: serde_json::Value,
}

impl LlmResponse {
    /// Token usage in the envelope-summary shape.
    #[must_use]
    pub fn token_usage(&self) -> TokenUsage {
        TokenUsage {
            input: self.input_tokens,
            output: self.output_tokens,
            thinking: self.thinking_tokens.unwrap_or(0),
            total: self.total_tokens,
        }
    }
}

// ---------------------------------------------------------------------------
// Append-only histories
// ---------------------------------------------------------------------------

/// Lifecycle state of a processing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    /// The stage has begun.
    Started,
    /// The stage finished successfully.
    Completed,
    /// The stage failed.
    Failed,
}

/// One instrumented pipeline stage. Append-only within a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStage {
    /// Stage name (e.g. `"context_loading"`).
    pub stage_name: String,
    /// When the stage started.
    pub start_time: DateTime<Utc>,
    /// When the stage ended.
    pub end_time: DateTime<Utc>,
    /// Monotonically measured duration in milliseconds.
    pub duration_ms: u64,
    /// Outcome of the stage.
    pub status: StageStatus,
    /// Stage-specific metrics and annotations.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// One status transition. Append-only across turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusHistoryEntry {
    /// Status string (e.g. `"TURN1_COMPLETED"`).
    pub status: String,
    /// When the transition was recorded.
    pub timestamp: DateTime<Utc>,
    /// Name of the function that recorded the transition.
    pub function_name: String,
    /// Processing time elapsed since turn start, in milliseconds.
    pub processing_time_ms: u64,
    /// Pipeline stage the transition belongs to.
    pub stage: String,
    /// Optional metrics attached to the transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, serde_json::Value>>,
}

// ---------------------------------------------------------------------------
// Discrepancies & outcomes
// ---------------------------------------------------------------------------

/// Discrepancy severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Cosmetic or low-impact difference.
    Low,
    /// Noticeable difference.
    Medium,
    /// Difference that invalidates the verification on its own.
    High,
}

/// Kind of structured difference between expected and observed contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyType {
    /// Expected product absent from its slot.
    Missing,
    /// Product present but in the wrong slot.
    Misplaced,
    /// Product present that the layout does not expect.
    Extra,
    /// A different product occupies the slot.
    WrongProduct,
    /// Right product, wrong count.
    Quantity,
    /// Downgrade target for unrecognized values from the model.
    Unknown,
}

impl DiscrepancyType {
    /// Whether this type counts toward the mismatch threshold.
    #[must_use]
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::Missing | Self::Misplaced)
    }
}

/// A structured difference between expected and observed slot contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discrepancy {
    /// The item or slot the discrepancy concerns.
    pub item: String,
    /// Kind of discrepancy.
    #[serde(rename = "type")]
    pub kind: DiscrepancyType,
    /// What the reference state expected.
    pub expected: String,
    /// What the model observed.
    pub found: String,
    /// How severe the difference is.
    pub severity: Severity,
}

/// Final categorical result for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationOutcome {
    /// The checking state matches the reference state.
    Correct,
    /// The checking state does not match.
    Incorrect,
    /// The model could not decide.
    Inconclusive,
    /// The verification failed to run.
    Failed,
}

impl VerificationOutcome {
    /// Wire-format string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Correct => "CORRECT",
            Self::Incorrect => "INCORRECT",
            Self::Inconclusive => "INCONCLUSIVE",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Exit statuses & output envelope
// ---------------------------------------------------------------------------

/// String-valued `status` emitted in the output envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnStatus {
    /// Turn 1 finished successfully.
    Turn1Completed,
    /// Turn 2 finished successfully.
    Turn2Completed,
    /// Turn 1 failed.
    Turn1Error,
    /// Turn 2 failed.
    Turn2Error,
    /// Prompt template selection or rendering failed.
    TemplateProcessingError,
    /// The request failed validation.
    ValidationError,
    /// The model invocation failed.
    BedrockError,
}

impl TurnStatus {
    /// The completion status for the given turn.
    #[must_use]
    pub fn completed(turn: TurnNumber) -> Self {
        match turn {
            TurnNumber::One => Self::Turn1Completed,
            TurnNumber::Two => Self::Turn2Completed,
        }
    }

    /// The generic error status for the given turn.
    #[must_use]
    pub fn turn_error(turn: TurnNumber) -> Self {
        match turn {
            TurnNumber::One => Self::Turn1Error,
            TurnNumber::Two => Self::Turn2Error,
        }
    }

    /// Whether this status is an error variant.
    #[must_use]
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Turn1Completed | Self::Turn2Completed)
    }

    /// Wire-format string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Turn1Completed => "TURN1_COMPLETED",
            Self::Turn2Completed => "TURN2_COMPLETED",
            Self::Turn1Error => "TURN1_ERROR",
            Self::Turn2Error => "TURN2_ERROR",
            Self::TemplateProcessingError => "TEMPLATE_PROCESSING_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::BedrockError => "BEDROCK_ERROR",
        }
    }
}

impl fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which analysis the turn performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStage {
    /// Turn 1: analysis of the reference state.
    ReferenceAnalysis,
    /// Turn 2: analysis of the checking state and comparison.
    CheckingAnalysis,
}

impl From<TurnNumber> for AnalysisStage {
    fn from(turn: TurnNumber) -> Self {
        match turn {
            TurnNumber::One => Self::ReferenceAnalysis,
            TurnNumber::Two => Self::CheckingAnalysis,
        }
    }
}

/// A value in the envelope's `s3References` map: either a single reference
/// or a named group of references (e.g. the `responses` group).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReferenceValue {
    /// A single artifact reference.
    Single(ArtifactReference),
    /// A named group of artifact references.
    Group(BTreeMap<String, ArtifactReference>),
}

/// Summary block of the output envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSummary {
    /// Which analysis the turn performed.
    pub analysis_stage: AnalysisStage,
    /// Total wall-clock processing time in milliseconds.
    pub processing_time_ms: u64,
    /// Measured model-invocation latency in milliseconds.
    pub bedrock_latency_ms: u64,
    /// Token usage for the model call.
    pub token_usage: TokenUsage,
    /// Provider request identifier.
    pub bedrock_request_id: String,
    /// Final verification outcome (Turn 2, or Turn 1 when the model emits one).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_outcome: Option<VerificationOutcome>,
    /// Number of discrepancies found (Turn 2).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discrepancies_found: Option<u64>,
    /// Whether all three metadata writes succeeded.
    pub dynamodb_updated: bool,
    /// Whether the conversation turn was recorded.
    pub conversation_tracked: bool,
    /// Whether artifact storage completed.
    pub s3_storage_completed: bool,
}

/// Output of a turn execution, consumable by the next turn or the final
/// aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEnvelope {
    /// Verification identifier.
    pub verification_id: String,
    /// Exit status.
    pub status: TurnStatus,
    /// Named reference groups for downstream stages.
    pub s3_references: BTreeMap<String, ReferenceValue>,
    /// Execution summary.
    pub summary: TurnSummary,
    /// Schema version of this envelope.
    pub schema_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn context(vtype: VerificationType) -> VerificationContext {
        VerificationContext {
            verification_id: "verif-20250611120000-a1b2".into(),
            verification_at: Utc.with_ymd_and_hms(2025, 6, 11, 12, 0, 0).unwrap(),
            verification_type: vtype,
            layout_id: Some(42),
            layout_prefix: Some("row-major".into()),
            vending_machine_id: "vm-17".into(),
            layout_metadata: None,
            historical_context: None,
        }
    }

    #[test]
    fn verification_type_wire_strings() {
        assert_eq!(
            serde_json::to_string(&VerificationType::LayoutVsChecking).unwrap(),
            r#""LAYOUT_VS_CHECKING""#
        );
        assert_eq!(
            serde_json::to_string(&VerificationType::PreviousVsCurrent).unwrap(),
            r#""PREVIOUS_VS_CURRENT""#
        );
    }

    #[test]
    fn turn_number_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&TurnNumber::One).unwrap(), "1");
        assert_eq!(serde_json::to_string(&TurnNumber::Two).unwrap(), "2");
        let two: TurnNumber = serde_json::from_str("2").unwrap();
        assert_eq!(two, TurnNumber::Two);
    }

    #[test]
    fn turn_number_rejects_out_of_range() {
        assert!(serde_json::from_str::<TurnNumber>("3").is_err());
        assert!(serde_json::from_str::<TurnNumber>("0").is_err());
    }

    #[test]
    fn context_validates_layout_pair() {
        let mut ctx = context(VerificationType::LayoutVsChecking);
        ctx.validate().expect("populated pair is valid");

        ctx.layout_prefix = None;
        let problems = ctx.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("both")));
    }

    #[test]
    fn layout_vs_checking_requires_pair() {
        let mut ctx = context(VerificationType::LayoutVsChecking);
        ctx.layout_id = None;
        ctx.layout_prefix = None;
        let problems = ctx.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("LAYOUT_VS_CHECKING")));
    }

    #[test]
    fn previous_vs_current_allows_empty_pair() {
        let mut ctx = context(VerificationType::PreviousVsCurrent);
        ctx.layout_id = None;
        ctx.layout_prefix = None;
        ctx.validate().expect("pair is optional for PREVIOUS_VS_CURRENT");
    }

    #[test]
    fn backfill_layout_identity_from_metadata() {
        let mut ctx = context(VerificationType::PreviousVsCurrent);
        ctx.layout_id = None;
        ctx.layout_prefix = None;
        ctx.layout_metadata = Some(LayoutMetadata {
            layout_id: Some(7),
            layout_prefix: Some("compact".into()),
            ..Default::default()
        });
        ctx.backfill_layout_identity();
        assert_eq!(ctx.layout_id, Some(7));
        assert_eq!(ctx.layout_prefix.as_deref(), Some("compact"));
    }

    #[test]
    fn backfill_never_overwrites() {
        let mut ctx = context(VerificationType::LayoutVsChecking);
        ctx.layout_metadata = Some(LayoutMetadata {
            layout_id: Some(99),
            layout_prefix: Some("other".into()),
            ..Default::default()
        });
        ctx.backfill_layout_identity();
        assert_eq!(ctx.layout_id, Some(42));
    }

    #[test]
    fn historical_context_uses_pascal_case_keys() {
        let hc = HistoricalContext {
            previous_verification_at: Utc.with_ymd_and_hms(2025, 6, 10, 9, 0, 0).unwrap(),
            previous_verification_status: "CORRECT".into(),
            previous_verification_id: "verif-prev".into(),
            hours_since_last_verification: 27.0,
            layout_id: None,
            layout_prefix: None,
            row_count: Some(6),
            column_count: Some(8),
            row_labels: None,
        };
        let json = serde_json::to_value(&hc).unwrap();
        assert!(json.get("PreviousVerificationAt").is_some());
        assert!(json.get("HoursSinceLastVerification").is_some());
        assert_eq!(json["RowCount"], 6);
    }

    #[test]
    fn previous_verification_probe_prefers_typed_field() {
        let pv: PreviousVerification = serde_json::from_value(serde_json::json!({
            "verificationId": "verif-prev",
            "verificationAt": "2025-06-10T09:00:00Z",
            "verificationStatus": "CORRECT",
            "machineStructure": {"rowCount": 6, "columnCount": 8, "rowLabels": ["A", "B"]}
        }))
        .unwrap();
        let ms = pv.probe_machine_structure().unwrap();
        assert_eq!(ms.row_count, 6);
    }

    #[test]
    fn previous_verification_probe_falls_back_to_untyped_map() {
        let mut pv: PreviousVerification = serde_json::from_value(serde_json::json!({
            "verificationId": "verif-prev",
            "verificationAt": "2025-06-10T09:00:00Z",
            "verificationStatus": "CORRECT"
        }))
        .unwrap();
        assert!(pv.probe_machine_structure().is_none());
        pv.extra.insert(
            "MachineStructure".into(),
            serde_json::json!({"rowCount": 4, "columnCount": 5}),
        );
        let ms = pv.probe_machine_structure().unwrap();
        assert_eq!(ms.column_count, 5);
    }

    #[test]
    fn discrepancy_serde_uses_type_key() {
        let d = Discrepancy {
            item: "A3".into(),
            kind: DiscrepancyType::Missing,
            expected: "Cola".into(),
            found: "empty".into(),
            severity: Severity::High,
        };
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["type"], "MISSING");
        assert_eq!(json["severity"], "HIGH");
    }

    #[test]
    fn mismatch_types() {
        assert!(DiscrepancyType::Missing.is_mismatch());
        assert!(DiscrepancyType::Misplaced.is_mismatch());
        assert!(!DiscrepancyType::Extra.is_mismatch());
        assert!(!DiscrepancyType::WrongProduct.is_mismatch());
        assert!(!DiscrepancyType::Quantity.is_mismatch());
    }

    #[test]
    fn turn_status_wire_strings() {
        assert_eq!(TurnStatus::Turn1Completed.as_str(), "TURN1_COMPLETED");
        assert_eq!(TurnStatus::Turn2Error.as_str(), "TURN2_ERROR");
        assert_eq!(
            serde_json::to_string(&TurnStatus::TemplateProcessingError).unwrap(),
            r#""TEMPLATE_PROCESSING_ERROR""#
        );
        assert_eq!(
            TurnStatus::completed(TurnNumber::Two),
            TurnStatus::Turn2Completed
        );
        assert!(TurnStatus::BedrockError.is_error());
        assert!(!TurnStatus::Turn1Completed.is_error());
    }

    #[test]
    fn reference_value_untagged_roundtrip() {
        let single = ReferenceValue::Single(ArtifactReference::new("bucket", "2025/06/11/v/x.json"));
        let json = serde_json::to_string(&single).unwrap();
        let back: ReferenceValue = serde_json::from_str(&json).unwrap();
        assert_eq!(single, back);

        let mut group = BTreeMap::new();
        group.insert(
            "turn1Raw".to_string(),
            ArtifactReference::new("bucket", "2025/06/11/v/responses/turn1-raw-response.json"),
        );
        let group = ReferenceValue::Group(group);
        let json = serde_json::to_string(&group).unwrap();
        let back: ReferenceValue = serde_json::from_str(&json).unwrap();
        assert_eq!(group, back);
    }

    #[test]
    fn llm_response_token_usage() {
        let resp = LlmResponse {
            content: "ok".into(),
            input_tokens: 500,
            output_tokens: 42,
            thinking_tokens: None,
            total_tokens: 542,
            request_id: "req-1".into(),
            model_id: "model-x".into(),
            stop_reason: "end_turn".into(),
            latency_ms: 1500,
            raw: serde_json::json!({}),
        };
        let usage = resp.token_usage();
        assert_eq!(usage.input, 500);
        assert_eq!(usage.thinking, 0);
        assert_eq!(usage.total, 542);
    }

    #[test]
    fn output_envelope_roundtrip() {
        let envelope = OutputEnvelope {
            verification_id: "verif-1".into(),
            status: TurnStatus::Turn1Completed,
            s3_references: BTreeMap::new(),
            summary: TurnSummary {
                analysis_stage: AnalysisStage::ReferenceAnalysis,
                processing_time_ms: 2100,
                bedrock_latency_ms: 1500,
                token_usage: TokenUsage { input: 500, output: 42, thinking: 0, total: 542 },
                bedrock_request_id: "req-1".into(),
                verification_outcome: None,
                discrepancies_found: None,
                dynamodb_updated: true,
                conversation_tracked: true,
                s3_storage_completed: true,
            },
            schema_version: SCHEMA_VERSION.to_string(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["schemaVersion"], "2.1.0");
        assert_eq!(json["summary"]["analysisStage"], "REFERENCE_ANALYSIS");
        let back: OutputEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }
}
