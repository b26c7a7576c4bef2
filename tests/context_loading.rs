// SPDX-License-Identifier: MIT OR Apache-2.0
//! Context-loader fault behavior: retries, first-error surfacing, and the
//! no-partial-return guarantee.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use verify_pipeline::llm::MockModelInvoker;
use verify_pipeline::metadata::InMemoryMetadataStore;
use verify_pipeline::store::{ArtifactStoreClient, InMemoryObjectStore};
use verify_pipeline::{CancelToken, PipelineConfig, TurnDeps, TurnOrchestrator, TurnStatus};

const VERIF_ID: &str = "verif-20250611120000-d4d4";
const PARTITION: &str = "2025/06/11";
const PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAAB";

fn prefixed(suffix: &str) -> String {
    format!("{PARTITION}/{VERIF_ID}/{suffix}")
}

fn config() -> PipelineConfig {
    let vars = BTreeMap::from([
        ("STATE_BUCKET".to_string(), "state".to_string()),
        ("METADATA_VERIFICATION_TABLE".to_string(), "verification-results".to_string()),
        ("METADATA_CONVERSATION_TABLE".to_string(), "conversation-history".to_string()),
        ("LLM_MODEL_ID".to_string(), "vision-model-v2".to_string()),
    ]);
    PipelineConfig::from_map(&vars).unwrap()
}

fn seed_store() -> Arc<InMemoryObjectStore> {
    let store = Arc::new(InMemoryObjectStore::new());
    store.put_object(
        "state",
        &prefixed("initialization.json"),
        serde_json::to_vec(&json!({
            "verificationId": VERIF_ID,
            "verificationAt": "2025-06-11T12:00:00Z",
            "verificationType": "LAYOUT_VS_CHECKING",
            "vendingMachineId": "vm-17",
            "layoutId": 42,
            "layoutPrefix": "row-major",
            "status": "VERIFICATION_INITIALIZED"
        }))
        .unwrap(),
        "application/json",
    );
    store.put_object(
        "state",
        &prefixed("images/metadata.json"),
        serde_json::to_vec(&json!({
            "referenceImage": {"bucket": "state", "key": prefixed("images/reference.b64")}
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
    store
}

fn workflow_event() -> serde_json::Value {
    json!({
        "schemaVersion": "2.1.0",
        "verificationId": VERIF_ID,
        "status": "VERIFICATION_INITIALIZED",
        "s3References": {
            "processing_initialization": {"bucket": "state", "key": prefixed("initialization.json")},
            "images_metadata": {"bucket": "state", "key": prefixed("images/metadata.json")},
            "prompts_system": {"bucket": "state", "key": prefixed("prompts/system-prompt.json")}
        }
    })
}

fn orchestrator(
    store: Arc<InMemoryObjectStore>,
    metadata: Arc<InMemoryMetadataStore>,
    invoker: Arc<MockModelInvoker>,
) -> TurnOrchestrator {
    TurnOrchestrator::new(TurnDeps {
        store: ArtifactStoreClient::new(store, "state"),
        metadata,
        invoker,
        config: config(),
    })
}

// -- Scenario D: persistent transient failure on the image load --------------

#[tokio::test]
async fn image_load_exhausts_retries_and_fails_the_turn() {
    let store = seed_store();
    // Three transient failures: every attempt of the 3-attempt policy fails.
    store.fail_get_times("state", &prefixed("images/reference.b64"), 3);
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let invoker = Arc::new(MockModelInvoker::new());
    let orchestrator = orchestrator(store, metadata.clone(), invoker.clone());

    let (envelope, trace) = orchestrator
        .execute_value_traced(&workflow_event(), &CancelToken::new())
        .await;

    assert_eq!(envelope.status, TurnStatus::Turn1Error);
    // No LLM call was made.
    assert!(invoker.requests().is_empty());

    // The failed stage is recorded.
    let failed = trace.stages.last().unwrap();
    assert_eq!(failed.stage_name, "context_loading");

    // Exactly one status history entry with stage context_loading_failed.
    let history = metadata.status_history_of(VERIF_ID);
    let failures: Vec<_> = history.iter().filter(|e| e.stage == "context_loading_failed").collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].status, "TURN1_ERROR");

    // The surfaced error carries the loading context and the attempt count.
    let errors = metadata.errors_of(VERIF_ID);
    assert_eq!(errors.len(), 1);
    let details = &errors[0].error.details;
    assert_eq!(details["stage"], json!("context_loading"));
    assert_eq!(details["operation"], json!("base64_image_load"));
    assert_eq!(details["s3_key"], json!(prefixed("images/reference.b64")));
    assert_eq!(details["attempts"], json!(3));
}

// -- Transient failures within the retry budget recover ----------------------

#[tokio::test]
async fn transient_image_failures_recover_within_retry_budget() {
    let store = seed_store();
    store.fail_get_times("state", &prefixed("images/reference.b64"), 2);
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let invoker = Arc::new(MockModelInvoker::new());
    invoker.enqueue_response(MockModelInvoker::text_response("reference described", 10, 5, 100));
    let orchestrator = orchestrator(store, metadata, invoker.clone());

    let envelope = orchestrator
        .execute_value(&workflow_event(), &CancelToken::new())
        .await;

    assert_eq!(envelope.status, TurnStatus::Turn1Completed);
    assert_eq!(invoker.requests().len(), 1);
}

// -- Missing object short-circuits without retries ---------------------------

#[tokio::test]
async fn missing_image_fails_without_retries() {
    let store = seed_store();
    // Point the metadata at an image that does not exist.
    store.put_object(
        "state",
        &prefixed("images/metadata.json"),
        serde_json::to_vec(&json!({
            "referenceImage": {"bucket": "state", "key": prefixed("images/not-there.b64")}
        }))
        .unwrap(),
        "application/json",
    );
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let invoker = Arc::new(MockModelInvoker::new());
    let orchestrator = orchestrator(store, metadata.clone(), invoker.clone());

    let envelope = orchestrator
        .execute_value(&workflow_event(), &CancelToken::new())
        .await;

    assert_eq!(envelope.status, TurnStatus::Turn1Error);
    assert!(invoker.requests().is_empty());
    let errors = metadata.errors_of(VERIF_ID);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error.code, verify_pipeline::ErrorCode::ObjectNotFound);
    // A non-retryable error is surfaced after a single attempt.
    assert_eq!(errors[0].error.details["attempts"], json!(1));
}
