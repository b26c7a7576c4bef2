// SPDX-License-Identifier: MIT OR Apache-2.0
//! Input/output envelope codec.
//!
//! Two input shapes are accepted, discriminated by the presence of
//! `schemaVersion`: a direct [`TurnRequest`] or a workflow event carrying
//! named artifact references. Workflow events are dereferenced into the
//! strongly-typed request by loading `initialization.json` and
//! `images/metadata.json` and projecting their fields.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

use vp_core::{
    ACCEPTED_SCHEMA_VERSIONS, ArtifactReference, CancelToken, ImageReferences, LayoutMetadata,
    OutputEnvelope, PriorTurnReferences, ProcessingReferences, PromptReferences, SCHEMA_VERSION,
    TurnNumber, TurnRequest, VerificationContext, VerificationType,
};
use vp_error::{ErrorCode, VerifyError, VerifyResult};
use vp_store::ArtifactStoreClient;

/// Reference name of the initialization record in a workflow event.
pub const REF_INITIALIZATION: &str = "processing_initialization";
/// Reference name of the images metadata record.
pub const REF_IMAGES_METADATA: &str = "images_metadata";
/// Reference name of the system prompt.
pub const REF_SYSTEM_PROMPT: &str = "prompts_system";
/// Reference name of the layout metadata artifact.
pub const REF_LAYOUT_METADATA: &str = "processing_layout-metadata";
/// Reference name of the Turn-1 raw response (present on Turn-2 events).
pub const REF_TURN1_RAW: &str = "responses_turn1-raw";
/// Reference name of the Turn-1 processed response (present on Turn-2 events).
pub const REF_TURN1_PROCESSED: &str = "responses_turn1-processed";

// ---------------------------------------------------------------------------
// Input shapes
// ---------------------------------------------------------------------------

/// A workflow event: schema version, status, and named artifact references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    /// Envelope schema version.
    pub schema_version: String,
    /// Verification identifier.
    pub verification_id: String,
    /// Status the workflow observed before this invocation.
    #[serde(default)]
    pub status: String,
    /// Named artifact references.
    #[serde(default)]
    pub s3_references: BTreeMap<String, ArtifactReference>,
}

impl WorkflowEvent {
    /// Which turn this event selects: `TURN1_COMPLETED` means Turn 1 is
    /// done and this invocation runs Turn 2; anything else runs Turn 1.
    #[must_use]
    pub fn turn_number(&self) -> TurnNumber {
        if self.status == "TURN1_COMPLETED" {
            TurnNumber::Two
        } else {
            TurnNumber::One
        }
    }
}

/// A decoded input: either a direct request or a workflow event.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEnvelope {
    /// A fully-formed turn request.
    Direct(Box<TurnRequest>),
    /// A workflow event that needs dereferencing.
    Workflow(WorkflowEvent),
}

/// The initialization record stored at
/// `<datePartition>/<verificationId>/initialization.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializationRecord {
    /// Verification identifier.
    pub verification_id: String,
    /// When the verification was initiated.
    pub verification_at: DateTime<Utc>,
    /// Verification type.
    pub verification_type: VerificationType,
    /// Vending machine under verification.
    #[serde(default)]
    pub vending_machine_id: String,
    /// Layout identifier, when typed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_id: Option<i64>,
    /// Layout prefix, when typed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_prefix: Option<String>,
    /// Current verification status.
    #[serde(default)]
    pub status: String,
}

/// The images metadata record stored at
/// `<datePartition>/<verificationId>/images/metadata.json`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagesMetadata {
    /// Reference-state image artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_image: Option<ArtifactReference>,
    /// Checking-state image artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checking_image: Option<ArtifactReference>,
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode an input value into one of the two accepted shapes.
///
/// The presence of `schemaVersion` selects the workflow shape. Down-level
/// schema versions are accepted with a warning; unknown versions fail
/// validation.
pub fn decode_input(value: &Value) -> VerifyResult<InputEnvelope> {
    let Some(object) = value.as_object() else {
        return Err(VerifyError::new(
            ErrorCode::InvalidRequest,
            "input envelope must be a JSON object",
        ));
    };

    if object.contains_key("schemaVersion") {
        let event: WorkflowEvent = serde_json::from_value(value.clone()).map_err(|e| {
            VerifyError::new(ErrorCode::InvalidRequest, format!("malformed workflow event: {e}"))
        })?;
        if !ACCEPTED_SCHEMA_VERSIONS.contains(&event.schema_version.as_str()) {
            return Err(VerifyError::new(
                ErrorCode::SchemaVersionUnsupported,
                format!("schema version {} is not accepted", event.schema_version),
            )
            .with_detail("accepted", ACCEPTED_SCHEMA_VERSIONS)
            .with_severity(vp_error::ErrorSeverity::High));
        }
        if event.schema_version != SCHEMA_VERSION {
            warn!(
                target: "vp.envelope",
                code = "schema_version_downlevel",
                received = %event.schema_version,
                current = SCHEMA_VERSION,
                "accepting down-level schema version"
            );
        }
        return Ok(InputEnvelope::Workflow(event));
    }

    let request: TurnRequest = serde_json::from_value(value.clone()).map_err(|e| {
        VerifyError::new(ErrorCode::InvalidRequest, format!("malformed turn request: {e}"))
    })?;
    Ok(InputEnvelope::Direct(Box::new(request)))
}

// ---------------------------------------------------------------------------
// Workflow resolution
// ---------------------------------------------------------------------------

/// Dereference a workflow event into a [`TurnRequest`].
///
/// Loads the initialization and images-metadata records and projects their
/// fields. Missing mandatory references fail with a validation error that
/// lists the reference names that WERE present.
pub async fn resolve_turn_request(
    event: &WorkflowEvent,
    client: &ArtifactStoreClient,
    cancel: &CancelToken,
) -> VerifyResult<TurnRequest> {
    let turn = event.turn_number();

    let mut mandatory = vec![REF_INITIALIZATION, REF_IMAGES_METADATA, REF_SYSTEM_PROMPT];
    if turn == TurnNumber::Two {
        mandatory.push(REF_TURN1_RAW);
        mandatory.push(REF_TURN1_PROCESSED);
    }
    let missing: Vec<&str> = mandatory
        .iter()
        .copied()
        .filter(|name| !event.s3_references.contains_key(*name))
        .collect();
    if !missing.is_empty() {
        let present: Vec<&String> = event.s3_references.keys().collect();
        return Err(VerifyError::new(
            ErrorCode::MissingRequiredField,
            format!("workflow event lacks mandatory references: {missing:?}"),
        )
        .with_detail("present_references", present)
        .with_verification_id(&event.verification_id));
    }

    let init_ref = &event.s3_references[REF_INITIALIZATION];
    let initialization: InitializationRecord = client.load_json(init_ref, cancel).await?;
    let images: ImagesMetadata = client
        .load_json(&event.s3_references[REF_IMAGES_METADATA], cancel)
        .await?;

    let layout_metadata_ref = event.s3_references.get(REF_LAYOUT_METADATA).cloned();
    let layout_metadata: Option<LayoutMetadata> = match &layout_metadata_ref {
        Some(reference) => Some(client.load_json(reference, cancel).await?),
        None => None,
    };

    let mut context = VerificationContext {
        verification_id: initialization.verification_id.clone(),
        verification_at: initialization.verification_at,
        verification_type: initialization.verification_type,
        layout_id: initialization.layout_id,
        layout_prefix: initialization.layout_prefix.clone(),
        vending_machine_id: initialization.vending_machine_id.clone(),
        layout_metadata,
        historical_context: None,
    };
    context.backfill_layout_identity();

    let images_refs = match turn {
        TurnNumber::One => ImageReferences {
            reference_base64: Some(images.reference_image.clone().ok_or_else(|| {
                missing_image_error(&event.verification_id, "referenceImage")
            })?),
            checking_base64: images.checking_image.clone(),
        },
        TurnNumber::Two => ImageReferences {
            reference_base64: images.reference_image.clone(),
            checking_base64: Some(images.checking_image.clone().ok_or_else(|| {
                missing_image_error(&event.verification_id, "checkingImage")
            })?),
        },
    };

    let turn1 = if turn == TurnNumber::Two {
        Some(PriorTurnReferences {
            raw_response: event.s3_references[REF_TURN1_RAW].clone(),
            processed_response: event.s3_references[REF_TURN1_PROCESSED].clone(),
        })
    } else {
        None
    };

    Ok(TurnRequest {
        verification_id: initialization.verification_id,
        turn_number: turn,
        verification_context: context,
        prompts: PromptReferences {
            system: event.s3_references[REF_SYSTEM_PROMPT].clone(),
        },
        images: images_refs,
        turn1,
        processing: Some(ProcessingReferences {
            layout_metadata: layout_metadata_ref,
            historical_context: None,
        }),
    })
}

fn missing_image_error(verification_id: &str, field: &str) -> VerifyError {
    VerifyError::new(
        ErrorCode::MissingRequiredField,
        format!("images metadata lacks {field}"),
    )
    .with_detail("field", field)
    .with_verification_id(verification_id)
}

/// Serialize an output envelope for the workflow controller.
pub fn encode_output(envelope: &OutputEnvelope) -> VerifyResult<Value> {
    serde_json::to_value(envelope).map_err(|e| {
        VerifyError::new(ErrorCode::Internal, format!("output envelope serialization failed: {e}"))
    })
}
