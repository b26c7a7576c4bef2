// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end turn execution over the in-memory stores and the scripted
//! model invoker.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::json;

use verify_pipeline::core::artifacts::{
    BedrockMetadata, ProcessedResponseArtifact, PromptMetadata, RawResponseArtifact,
    RawResponseBody,
};
use verify_pipeline::core::{
    ImageFormat, ReferenceValue, TokenUsage, TurnNumber, VerificationOutcome,
};
use verify_pipeline::llm::MockModelInvoker;
use verify_pipeline::metadata::{InMemoryMetadataStore, MetadataOp};
use verify_pipeline::store::{ArtifactStoreClient, InMemoryObjectStore};
use verify_pipeline::{CancelToken, PipelineConfig, TurnDeps, TurnOrchestrator, TurnStatus};

const VERIF_ID: &str = "verif-20250611120000-a1b2";
const PARTITION: &str = "2025/06/11";
const PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAAB";

fn prefixed(suffix: &str) -> String {
    format!("{PARTITION}/{VERIF_ID}/{suffix}")
}

fn config(threshold: u32) -> PipelineConfig {
    let vars = BTreeMap::from([
        ("STATE_BUCKET".to_string(), "state".to_string()),
        ("METADATA_VERIFICATION_TABLE".to_string(), "verification-results".to_string()),
        ("METADATA_CONVERSATION_TABLE".to_string(), "conversation-history".to_string()),
        ("LLM_MODEL_ID".to_string(), "vision-model-v2".to_string()),
        ("DISCREPANCY_THRESHOLD".to_string(), threshold.to_string()),
    ]);
    PipelineConfig::from_map(&vars).unwrap()
}

fn seed_store(verification_type: &str) -> Arc<InMemoryObjectStore> {
    let store = Arc::new(InMemoryObjectStore::new());
    let mut initialization = json!({
        "verificationId": VERIF_ID,
        "verificationAt": "2025-06-11T12:00:00Z",
        "verificationType": verification_type,
        "vendingMachineId": "vm-17",
        "status": "VERIFICATION_INITIALIZED"
    });
    if verification_type == "LAYOUT_VS_CHECKING" {
        initialization["layoutId"] = json!(42);
        initialization["layoutPrefix"] = json!("row-major");
    }
    store.put_object(
        "state",
        &prefixed("initialization.json"),
        serde_json::to_vec(&initialization).unwrap(),
        "application/json",
    );
    store.put_object(
        "state",
        &prefixed("images/metadata.json"),
        serde_json::to_vec(&json!({
            "referenceImage": {"bucket": "state", "key": prefixed("images/reference.b64")},
            "checkingImage": {"bucket": "state", "key": prefixed("images/checking.b64")}
        }))
        .unwrap(),
        "application/json",
    );
    store.put_object(
        "state",
        &prefixed("prompts/system-prompt.json"),
        serde_json::to_vec(&json!({"content": "You are a vending machine auditor."})).unwrap(),
        "application/json",
    );
    store.put_object("state", &prefixed("images/reference.b64"), PNG_B64.into(), "text/plain");
    store.put_object("state", &prefixed("images/checking.b64"), PNG_B64.into(), "text/plain");
    store.put_object(
        "state",
        &prefixed("processing/layout-metadata.json"),
        serde_json::to_vec(&json!({
            "layoutId": 42,
            "layoutPrefix": "row-major",
            "machineStructure": {"rowCount": 6, "columnCount": 8, "rowLabels": ["A", "B", "C", "D", "E", "F"]},
            "productPositions": [
                {"position": "A1", "productName": "Cola"},
                {"position": "A2", "productName": "Water"}
            ]
        }))
        .unwrap(),
        "application/json",
    );
    store
}

fn seed_turn1_artifacts(store: &InMemoryObjectStore) {
    let raw = RawResponseArtifact {
        verification_id: VERIF_ID.to_string(),
        turn_number: TurnNumber::One,
        response: RawResponseBody {
            content: "Row A holds Cola in A1 and Water in A2; all rows fully stocked.".to_string(),
            stop_reason: "end_turn".to_string(),
        },
        token_usage: TokenUsage { input: 500, output: 42, thinking: 0, total: 542 },
        bedrock_metadata: BedrockMetadata {
            model_id: "vision-model-v2".to_string(),
            request_id: "req-turn1".to_string(),
            latency_ms: 1500,
        },
        prompt_metadata: PromptMetadata {
            template_id: "turn1-layout-vs-checking".to_string(),
            template_version: "1.0.0".to_string(),
            user_prompt: "Describe the reference state.".to_string(),
            // Turn 1 ran against a JPEG reference image.
            image_format: ImageFormat::Jpeg,
            token_estimate: 7,
        },
        created_at: Utc.with_ymd_and_hms(2025, 6, 11, 12, 0, 0).unwrap(),
    };
    let processed = ProcessedResponseArtifact {
        verification_id: VERIF_ID.to_string(),
        turn_number: TurnNumber::One,
        verification_outcome: None,
        comparison_summary: "All rows fully stocked.".to_string(),
        discrepancies: vec![],
        partial: true,
        created_at: Utc.with_ymd_and_hms(2025, 6, 11, 12, 0, 0).unwrap(),
    };
    store.put_object(
        "state",
        &prefixed("responses/turn1-raw-response.json"),
        serde_json::to_vec(&raw).unwrap(),
        "application/json",
    );
    store.put_object(
        "state",
        &prefixed("responses/turn1-processed-response.json"),
        serde_json::to_vec(&processed).unwrap(),
        "application/json",
    );
}

fn workflow_event(status: &str, include_layout: bool, include_turn1: bool) -> serde_json::Value {
    let mut refs = json!({
        "processing_initialization": {"bucket": "state", "key": prefixed("initialization.json")},
        "images_metadata": {"bucket": "state", "key": prefixed("images/metadata.json")},
        "prompts_system": {"bucket": "state", "key": prefixed("prompts/system-prompt.json")}
    });
    if include_layout {
        refs["processing_layout-metadata"] =
            json!({"bucket": "state", "key": prefixed("processing/layout-metadata.json")});
    }
    if include_turn1 {
        refs["responses_turn1-raw"] =
            json!({"bucket": "state", "key": prefixed("responses/turn1-raw-response.json")});
        refs["responses_turn1-processed"] =
            json!({"bucket": "state", "key": prefixed("responses/turn1-processed-response.json")});
    }
    json!({
        "schemaVersion": "2.1.0",
        "verificationId": VERIF_ID,
        "status": status,
        "s3References": refs
    })
}

fn orchestrator(
    store: Arc<InMemoryObjectStore>,
    metadata: Arc<InMemoryMetadataStore>,
    invoker: Arc<MockModelInvoker>,
    config: PipelineConfig,
) -> TurnOrchestrator {
    TurnOrchestrator::new(TurnDeps {
        store: ArtifactStoreClient::new(store, "state"),
        metadata,
        invoker,
        config,
    })
}

fn turn2_reply(outcome: &str, discrepancies: serde_json::Value) -> String {
    format!(
        "The checking image differs in a few slots.\n\n```json\n{}\n```\n",
        json!({
            "verificationOutcome": outcome,
            "comparisonSummary": "Compared against the reference analysis.",
            "discrepancies": discrepancies
        })
    )
}

// -- Scenario A: Turn 1, LAYOUT_VS_CHECKING, happy path ----------------------

#[tokio::test]
async fn turn1_layout_vs_checking_happy_path() {
    let store = seed_store("LAYOUT_VS_CHECKING");
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let invoker = Arc::new(MockModelInvoker::new());
    invoker.enqueue_response(MockModelInvoker::text_response(
        r#"{"overallAccuracy": 0.98, "rowsAnalyzed": 6}"#,
        500,
        42,
        1500,
    ));
    let orchestrator = orchestrator(store.clone(), metadata.clone(), invoker.clone(), config(0));

    let (envelope, trace) = orchestrator
        .execute_value_traced(&workflow_event("VERIFICATION_INITIALIZED", true, false), &CancelToken::new())
        .await;

    assert_eq!(envelope.status, TurnStatus::Turn1Completed);
    assert_eq!(
        trace.stage_names(),
        vec![
            "validation",
            "context_loading",
            "prompt_generation",
            "bedrock_invocation",
            "response_processing",
            "prompt_storage"
        ]
    );

    let ReferenceValue::Group(responses) = &envelope.s3_references["responses"] else {
        panic!("responses must be a reference group");
    };
    assert!(responses["turn1Raw"].key.ends_with("responses/turn1-raw-response.json"));
    assert!(responses["turn1Processed"].key.ends_with("responses/turn1-processed-response.json"));
    // The referenced objects exist.
    assert!(store.object_bytes("state", &responses["turn1Raw"].key).is_some());
    assert!(store.object_bytes("state", &responses["turn1Processed"].key).is_some());

    assert!(envelope.summary.dynamodb_updated);
    assert!(envelope.summary.s3_storage_completed);
    assert_eq!(envelope.summary.token_usage.input, 500);
    assert_eq!(envelope.summary.token_usage.output, 42);
    assert_eq!(envelope.summary.token_usage.total, 542);
    assert_eq!(envelope.summary.bedrock_latency_ms, 1500);
    assert_eq!(envelope.schema_version, "2.1.0");

    // Stage timestamps are monotonically non-decreasing.
    for pair in trace.stages.windows(2) {
        assert!(pair[0].end_time <= pair[1].end_time);
    }

    // The prompt rendered from the layout template reached the model.
    let requests = invoker.requests();
    assert_eq!(requests.len(), 1);

    // The initialization record now carries the final status.
    let init = store
        .object_bytes("state", &prefixed("initialization.json"))
        .unwrap();
    let init: serde_json::Value = serde_json::from_slice(&init).unwrap();
    assert_eq!(init["status"], "TURN1_COMPLETED");
}

// -- Scenario B: Turn 2, PREVIOUS_VS_CURRENT, historical lookup miss ---------

#[tokio::test]
async fn turn2_previous_vs_current_historical_miss() {
    let store = seed_store("PREVIOUS_VS_CURRENT");
    seed_turn1_artifacts(&store);
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let invoker = Arc::new(MockModelInvoker::new());
    invoker.enqueue_response(MockModelInvoker::text_response(
        turn2_reply("CORRECT", json!([])),
        600,
        80,
        1200,
    ));
    let orchestrator = orchestrator(store.clone(), metadata.clone(), invoker.clone(), config(0));

    let (envelope, trace) = orchestrator
        .execute_value_traced(&workflow_event("TURN1_COMPLETED", false, true), &CancelToken::new())
        .await;

    assert_eq!(envelope.status, TurnStatus::Turn2Completed);
    assert_eq!(envelope.summary.verification_outcome, Some(VerificationOutcome::Correct));
    assert_eq!(envelope.summary.discrepancies_found, Some(0));
    // Historical lookup missed: no historical-context artifact was produced.
    assert!(!envelope.s3_references.contains_key("processing_historical-context"));
    assert!(store.object_bytes("state", &prefixed("processing/historical-context.json")).is_none());
    // The historical stage still ran (best-effort, non-blocking).
    assert!(trace.stage_names().contains(&"historical_context"));

    // The transcript replays the prior user turn with the reference image's
    // real format, carried over from Turn 1's prompt metadata.
    let conversation = store.object_bytes("state", &prefixed("conversation/turn2.json")).unwrap();
    let conversation: serde_json::Value = serde_json::from_slice(&conversation).unwrap();
    assert_eq!(conversation["messages"][1]["role"], "user");
    assert_eq!(conversation["messages"][1]["content"][1]["type"], "image");
    assert_eq!(conversation["messages"][1]["content"][1]["format"], "jpeg");
}

// -- Scenario C: Turn 2, discrepancy threshold trips -------------------------

#[tokio::test]
async fn turn2_discrepancy_threshold_trips() {
    let store = seed_store("LAYOUT_VS_CHECKING");
    seed_turn1_artifacts(&store);
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let invoker = Arc::new(MockModelInvoker::new());
    let discrepancies = json!([
        {"item": "A1", "type": "MISSING", "expected": "Cola", "found": "empty", "severity": "MEDIUM"},
        {"item": "A2", "type": "MISSING", "expected": "Water", "found": "empty", "severity": "MEDIUM"},
        {"item": "B1", "type": "EXTRA", "expected": "", "found": "Chips", "severity": "LOW"},
        {"item": "B2", "type": "EXTRA", "expected": "", "found": "Candy", "severity": "LOW"}
    ]);
    invoker.enqueue_response(MockModelInvoker::text_response(
        turn2_reply("CORRECT", discrepancies),
        700,
        120,
        1400,
    ));
    let orchestrator = orchestrator(store.clone(), metadata.clone(), invoker, config(2));

    let envelope = orchestrator
        .execute_value(&workflow_event("TURN1_COMPLETED", true, true), &CancelToken::new())
        .await;

    assert_eq!(envelope.status, TurnStatus::Turn2Completed);
    assert_eq!(envelope.summary.verification_outcome, Some(VerificationOutcome::Incorrect));
    assert_eq!(envelope.summary.discrepancies_found, Some(4));

    let processed = store
        .object_bytes("state", &prefixed("responses/turn2-processed-response.json"))
        .unwrap();
    let processed: serde_json::Value = serde_json::from_slice(&processed).unwrap();
    assert_eq!(processed["verificationOutcome"], "INCORRECT");
    let summary = processed["comparisonSummary"].as_str().unwrap();
    assert!(
        summary.ends_with("Assessment: INCORRECT due to 2 discrepancies."),
        "unexpected summary: {summary}"
    );
}

// -- Scenario E: LLM call succeeds, metadata write fails ---------------------

#[tokio::test]
async fn metadata_failure_degrades_dynamo_ok_only() {
    let store = seed_store("LAYOUT_VS_CHECKING");
    let metadata = Arc::new(InMemoryMetadataStore::new());
    metadata.fail_with_conflict(MetadataOp::UpdateCompletion, 1);
    let invoker = Arc::new(MockModelInvoker::new());
    invoker.enqueue_response(MockModelInvoker::text_response(
        r#"{"overallAccuracy": 0.98}"#,
        500,
        42,
        1500,
    ));
    let orchestrator = orchestrator(store.clone(), metadata.clone(), invoker, config(0));

    let envelope = orchestrator
        .execute_value(&workflow_event("VERIFICATION_INITIALIZED", true, false), &CancelToken::new())
        .await;

    assert_eq!(envelope.status, TurnStatus::Turn1Completed);
    assert!(!envelope.summary.dynamodb_updated);
    assert!(envelope.summary.conversation_tracked);
    assert!(envelope.summary.s3_storage_completed);
    // One error-tracking entry for the failed write; artifacts persisted.
    assert_eq!(metadata.errors_of(VERIF_ID).len(), 1);
    assert!(store.object_bytes("state", &prefixed("responses/turn1-raw-response.json")).is_some());
    assert!(store.object_bytes("state", &prefixed("conversation/turn1.json")).is_some());
}

// -- Scenario F: image-format detection and reasoning toggle -----------------

#[tokio::test]
async fn reasoning_toggle_and_image_format_reach_the_request() {
    let store = seed_store("LAYOUT_VS_CHECKING");
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let invoker = Arc::new(MockModelInvoker::new());
    invoker.enqueue_response(MockModelInvoker::text_response("analysis text", 10, 5, 100));

    let mut config = config(0);
    config.llm.reasoning = verify_pipeline::config::ReasoningMode::Enable;
    config.llm.reasoning_budget_tokens = 8192;
    config.llm.temperature = 1.0;
    let orchestrator = orchestrator(store, metadata, invoker.clone(), config);

    let envelope = orchestrator
        .execute_value(&workflow_event("VERIFICATION_INITIALIZED", true, false), &CancelToken::new())
        .await;
    assert_eq!(envelope.status, TurnStatus::Turn1Completed);

    let request = serde_json::to_value(&invoker.requests()[0]).unwrap();
    assert_eq!(request["reasoning"], "enable");
    assert_eq!(request["inferenceConfig"]["reasoning"], "enable");
    assert_eq!(request["inferenceConfig"]["temperature"], 1.0);
    assert_eq!(request["thinking"]["type"], "enabled");
    assert_eq!(request["thinking"]["budget_tokens"], 8192);
    assert_eq!(request["messages"][0]["content"][1]["image"]["format"], "png");
}

// -- Idempotence: identical inputs produce identical processed artifacts -----

#[tokio::test]
async fn rerunning_a_turn_overwrites_identical_artifacts() {
    let store = seed_store("LAYOUT_VS_CHECKING");
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let invoker = Arc::new(MockModelInvoker::new());
    let reply = turn2_reply(
        "CORRECT",
        json!([{"item": "A1", "type": "QUANTITY", "expected": "3", "found": "2", "severity": "LOW"}]),
    );
    invoker.enqueue_response(MockModelInvoker::text_response(reply.clone(), 10, 5, 100));
    invoker.enqueue_response(MockModelInvoker::text_response(reply, 10, 5, 100));
    seed_turn1_artifacts(&store);
    let orchestrator = orchestrator(store.clone(), metadata, invoker, config(0));

    let event = workflow_event("TURN1_COMPLETED", true, true);
    let cancel = CancelToken::new();
    let first = orchestrator.execute_value(&event, &cancel).await;
    let first_bytes = store
        .object_bytes("state", &prefixed("responses/turn2-processed-response.json"))
        .unwrap();
    let second = orchestrator.execute_value(&event, &cancel).await;
    let second_bytes = store
        .object_bytes("state", &prefixed("responses/turn2-processed-response.json"))
        .unwrap();

    assert_eq!(first.status, second.status);
    // Byte-identical processed JSON once the write timestamp is excluded.
    let mut first_json: serde_json::Value = serde_json::from_slice(&first_bytes).unwrap();
    let mut second_json: serde_json::Value = serde_json::from_slice(&second_bytes).unwrap();
    first_json.as_object_mut().unwrap().remove("createdAt");
    second_json.as_object_mut().unwrap().remove("createdAt");
    assert_eq!(first_json, second_json);
    // Same artifact key set.
    let keys = |envelope: &verify_pipeline::OutputEnvelope| -> Vec<String> {
        envelope
            .s3_references
            .values()
            .flat_map(|value| match value {
                ReferenceValue::Single(reference) => vec![reference.key.clone()],
                ReferenceValue::Group(group) => group.values().map(|r| r.key.clone()).collect(),
            })
            .collect()
    };
    assert_eq!(keys(&first), keys(&second));
}

// -- Validation failures produce VALIDATION_ERROR ----------------------------

#[tokio::test]
async fn invalid_context_yields_validation_error() {
    let store = seed_store("LAYOUT_VS_CHECKING");
    // Break the layout pair invariant in the initialization record.
    let mut init: serde_json::Value = serde_json::from_slice(
        &store.object_bytes("state", &prefixed("initialization.json")).unwrap(),
    )
    .unwrap();
    init.as_object_mut().unwrap().remove("layoutPrefix");
    store.put_object(
        "state",
        &prefixed("initialization.json"),
        serde_json::to_vec(&init).unwrap(),
        "application/json",
    );

    let metadata = Arc::new(InMemoryMetadataStore::new());
    let invoker = Arc::new(MockModelInvoker::new());
    let orchestrator = orchestrator(store, metadata.clone(), invoker.clone(), config(0));

    let envelope = orchestrator
        .execute_value(&workflow_event("VERIFICATION_INITIALIZED", true, false), &CancelToken::new())
        .await;
    assert_eq!(envelope.status, TurnStatus::ValidationError);
    assert!(!envelope.summary.s3_storage_completed);
    assert!(invoker.requests().is_empty());
    // The terminal transition wrote a status history entry.
    let history = metadata.status_history_of(VERIF_ID);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, "VALIDATION_ERROR");
    assert_eq!(history[0].stage, "validation_failed");
}

// -- Parse failure of both passes fails the turn -----------------------------

#[tokio::test]
async fn empty_model_reply_fails_response_processing() {
    let store = seed_store("LAYOUT_VS_CHECKING");
    seed_turn1_artifacts(&store);
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let invoker = Arc::new(MockModelInvoker::new());
    // Whitespace only: no structured payload and no markdown body.
    invoker.enqueue_response(MockModelInvoker::text_response("   \n  ", 10, 1, 50));
    let orchestrator = orchestrator(store.clone(), metadata.clone(), invoker, config(0));

    let (envelope, trace) = orchestrator
        .execute_value_traced(&workflow_event("TURN1_COMPLETED", true, true), &CancelToken::new())
        .await;

    assert_eq!(envelope.status, TurnStatus::Turn2Error);
    let failed = trace.stages.last().unwrap();
    assert_eq!(failed.stage_name, "response_processing");
    // No turn-2 artifacts were written.
    assert!(store.object_bytes("state", &prefixed("responses/turn2-raw-response.json")).is_none());
}
