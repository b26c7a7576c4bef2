// SPDX-License-Identifier: MIT OR Apache-2.0
//! The turn orchestrator state machine.
//!
//! INIT → VALIDATED → CONTEXT_LOADED → (HIST_LOADED) → PROMPT_READY →
//! LLM_DONE → PARSED[_PARTIAL] → INTERPRETED → STORED → COMPLETED, with
//! every transition recording a processing stage and a status history
//! entry. Terminal transitions persist a final status entry and best-effort
//! patch the initialization record so downstream stages observe the final
//! outcome. Metadata failures after a successful model call only degrade
//! `dynamodbUpdated`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use vp_config::PipelineConfig;
use vp_core::{
    ArtifactCategory, ArtifactReference, CancelToken, OutputEnvelope, PriorTurnReferences,
    ReferenceValue, SCHEMA_VERSION, StageStatus, TokenUsage, TurnNumber, TurnRequest, TurnStatus,
    TurnSummary, VerificationType,
    artifact::{artifact_key, date_partition_for},
    artifacts::{
        BedrockMetadata, ConversationArtifact, ConversationContent, ConversationMessage,
        ConversationRole, GenerationMetadata, MessageSummary, ProcessedResponseArtifact,
        PromptBundle, PromptMetadata, RawResponseArtifact, RawResponseBody,
    },
};
use vp_envelope::{InputEnvelope, WorkflowEvent, decode_input, resolve_turn_request};
use vp_error::{ErrorCode, ErrorKind, VerifyError};
use vp_llm::{ContentBlock, ModelInvoker, ModelRequest, RequestBuilder};
use vp_metadata::{ConversationTurnRecord, MetadataStore, TurnMetrics};
use vp_parser::{extract_markdown, extract_structured, interpret_discrepancies};
use vp_store::ArtifactStoreClient;
use vp_template::{TemplateProcessor, TemplateStore, build_context};

use crate::coordinator::MetadataCoordinator;
use crate::historical::HistoricalContextResolver;
use crate::loader::{ContextLoader, LoadedContextTurn1, LoadedContextTurn2};
use crate::persister::ArtifactPersister;
use crate::tracker::{TurnTrace, TurnTracker};

/// External collaborators a turn execution needs.
pub struct TurnDeps {
    /// Artifact store client over the state bucket.
    pub store: ArtifactStoreClient,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Model invoker.
    pub invoker: Arc<dyn ModelInvoker>,
    /// Runtime configuration.
    pub config: PipelineConfig,
}

/// Wires the pipeline and produces the output envelope.
pub struct TurnOrchestrator {
    deps: TurnDeps,
    loader: ContextLoader,
    resolver: HistoricalContextResolver,
    persister: ArtifactPersister,
    coordinator: MetadataCoordinator,
    templates: TemplateProcessor,
    request_builder: RequestBuilder,
}

enum LoadedContext {
    One(LoadedContextTurn1),
    Two(Box<LoadedContextTurn2>),
}

impl TurnOrchestrator {
    /// Build an orchestrator from its dependencies.
    #[must_use]
    pub fn new(deps: TurnDeps) -> Self {
        let loader = ContextLoader::new(deps.store.clone());
        let resolver = HistoricalContextResolver::new(deps.metadata.clone());
        let persister = ArtifactPersister::new(deps.store.clone());
        let coordinator = MetadataCoordinator::new(deps.metadata.clone());
        let templates = TemplateProcessor::new(TemplateStore::new(
            deps.config.template_base_path.as_ref().map(PathBuf::from),
            deps.config.template_version.clone(),
        ));
        let request_builder = RequestBuilder::new(&deps.config.llm);
        Self {
            deps,
            loader,
            resolver,
            persister,
            coordinator,
            templates,
            request_builder,
        }
    }

    /// Decode an input value (direct request or workflow event) and execute
    /// the selected turn.
    pub async fn execute_value(&self, input: &Value, cancel: &CancelToken) -> OutputEnvelope {
        self.execute_value_traced(input, cancel).await.0
    }

    /// [`execute_value`](Self::execute_value), also returning the turn trace.
    pub async fn execute_value_traced(
        &self,
        input: &Value,
        cancel: &CancelToken,
    ) -> (OutputEnvelope, TurnTrace) {
        match decode_input(input) {
            Ok(InputEnvelope::Direct(request)) => self.execute_traced(*request, cancel).await,
            Ok(InputEnvelope::Workflow(event)) => {
                match resolve_turn_request(&event, &self.deps.store, cancel).await {
                    Ok(request) => self.execute_traced(request, cancel).await,
                    Err(err) => (
                        self.decode_failure_envelope(Some(&event), err).await,
                        TurnTrace::default(),
                    ),
                }
            }
            Err(err) => (
                self.decode_failure_envelope(None, err).await,
                TurnTrace::default(),
            ),
        }
    }

    /// Execute one verification turn.
    pub async fn execute(&self, request: TurnRequest, cancel: &CancelToken) -> OutputEnvelope {
        self.execute_traced(request, cancel).await.0
    }

    /// Execute one verification turn, also returning the turn trace.
    pub async fn execute_traced(
        &self,
        request: TurnRequest,
        cancel: &CancelToken,
    ) -> (OutputEnvelope, TurnTrace) {
        let turn = request.turn_number;
        let n = turn.as_u8();
        let mut tracker = TurnTracker::new(format!("execute-turn{n}"));
        let mut context = request.verification_context.clone();
        context.backfill_layout_identity();
        let date_partition = date_partition_for(&context.verification_at);

        info!(
            target: "vp.runtime",
            verification_id = %request.verification_id,
            turn = n,
            verification_type = %context.verification_type,
            "turn started"
        );

        // -- validation ------------------------------------------------------
        let stage_start = Instant::now();
        let image_ref = match validate_request(&request, &context) {
            Ok(image_ref) => {
                tracker.record_stage(
                    "validation",
                    StageStatus::Completed,
                    stage_start.elapsed(),
                    BTreeMap::new(),
                );
                tracker.update_status(&format!("TURN{n}_VALIDATED"), "validation", None);
                image_ref
            }
            Err(err) => {
                tracker.record_stage(
                    "validation",
                    StageStatus::Failed,
                    stage_start.elapsed(),
                    error_metadata(&err),
                );
                return self
                    .terminal_error(&mut tracker, &request, &date_partition, "validation", err, cancel)
                    .await;
            }
        };

        // -- context_loading -------------------------------------------------
        let stage_start = Instant::now();
        let loaded = match turn {
            TurnNumber::One => self
                .loader
                .load_context_turn1(&request, cancel)
                .await
                .map(LoadedContext::One),
            TurnNumber::Two => self
                .loader
                .load_context_turn2(&request, cancel)
                .await
                .map(|loaded| LoadedContext::Two(Box::new(loaded))),
        };
        let loaded = match loaded {
            Ok(loaded) => {
                tracker.record_stage(
                    "context_loading",
                    StageStatus::Completed,
                    stage_start.elapsed(),
                    BTreeMap::new(),
                );
                tracker.update_status(&format!("TURN{n}_CONTEXT_LOADED"), "context_loading", None);
                loaded
            }
            Err(err) => {
                tracker.record_stage(
                    "context_loading",
                    StageStatus::Failed,
                    stage_start.elapsed(),
                    error_metadata(&err),
                );
                return self
                    .terminal_error(
                        &mut tracker,
                        &request,
                        &date_partition,
                        "context_loading",
                        err,
                        cancel,
                    )
                    .await;
            }
        };

        // -- historical context (PREVIOUS_VS_CURRENT only, best-effort) -----
        let mut historical_ref: Option<ArtifactReference> = None;
        if context.verification_type == VerificationType::PreviousVsCurrent {
            let stage_start = Instant::now();
            self.resolver.resolve(&mut context, &image_ref.key, cancel).await;
            if let Some(historical) = &context.historical_context {
                match self
                    .persister
                    .persist_historical_context(
                        &request.verification_id,
                        Some(&date_partition),
                        historical,
                        cancel,
                    )
                    .await
                {
                    Ok(reference) => historical_ref = Some(reference),
                    Err(err) => warn!(
                        target: "vp.runtime",
                        verification_id = %request.verification_id,
                        "historical context persistence failed: {err}"
                    ),
                }
            }
            let mut metadata = BTreeMap::new();
            metadata.insert(
                "historical_found".to_string(),
                json!(context.historical_context.is_some()),
            );
            tracker.record_stage(
                "historical_context",
                StageStatus::Completed,
                stage_start.elapsed(),
                metadata,
            );
            tracker.update_status(
                &format!("TURN{n}_HISTORICAL_RESOLVED"),
                "historical_context",
                None,
            );
        }

        // -- prompt_generation ----------------------------------------------
        let stage_start = Instant::now();
        let turn1_summary = match &loaded {
            LoadedContext::Two(loaded) => Some(turn1_facts(loaded)),
            LoadedContext::One(_) => None,
        };
        let template_context = build_context(&context, turn1_summary.as_deref());
        let rendered = match self.templates.render_turn_prompt(
            context.verification_type,
            turn,
            &template_context,
        ) {
            Ok(rendered) => {
                let mut metadata = BTreeMap::new();
                metadata.insert("template_id".to_string(), json!(rendered.template_id.clone()));
                metadata.insert("token_estimate".to_string(), json!(rendered.token_estimate));
                tracker.record_stage(
                    "prompt_generation",
                    StageStatus::Completed,
                    stage_start.elapsed(),
                    metadata,
                );
                tracker.update_status(&format!("TURN{n}_PROMPT_READY"), "prompt_generation", None);
                rendered
            }
            Err(err) => {
                tracker.record_stage(
                    "prompt_generation",
                    StageStatus::Failed,
                    stage_start.elapsed(),
                    error_metadata(&err),
                );
                return self
                    .terminal_error(
                        &mut tracker,
                        &request,
                        &date_partition,
                        "prompt_generation",
                        err,
                        cancel,
                    )
                    .await;
            }
        };

        // -- bedrock_invocation ---------------------------------------------
        let stage_start = Instant::now();
        let model_request = match &loaded {
            LoadedContext::One(loaded) => self.request_builder.build_turn1(
                &loaded.system_prompt,
                &rendered.rendered_prompt,
                &loaded.reference_image,
            ),
            LoadedContext::Two(loaded) => self.request_builder.build_turn2(
                &loaded.system_prompt,
                &loaded.turn1_raw.prompt_metadata.user_prompt,
                &loaded.turn1_raw.response.content,
                &rendered.rendered_prompt,
                &loaded.checking_image,
            ),
        };
        let model_request = match model_request {
            Ok(model_request) => model_request,
            Err(err) => {
                tracker.record_stage(
                    "bedrock_invocation",
                    StageStatus::Failed,
                    stage_start.elapsed(),
                    error_metadata(&err),
                );
                return self
                    .terminal_error(
                        &mut tracker,
                        &request,
                        &date_partition,
                        "bedrock_invocation",
                        err,
                        cancel,
                    )
                    .await;
            }
        };
        let response = match self.deps.invoker.invoke(&model_request, cancel).await {
            Ok(response) => {
                let mut metadata = BTreeMap::new();
                metadata.insert("model_id".to_string(), json!(response.model_id.clone()));
                metadata.insert("input_tokens".to_string(), json!(response.input_tokens));
                metadata.insert("output_tokens".to_string(), json!(response.output_tokens));
                metadata.insert("latency_ms".to_string(), json!(response.latency_ms));
                tracker.record_stage(
                    "bedrock_invocation",
                    StageStatus::Completed,
                    stage_start.elapsed(),
                    metadata,
                );
                let mut metrics = BTreeMap::new();
                metrics.insert("totalTokens".to_string(), json!(response.total_tokens));
                tracker.update_status(
                    &format!("TURN{n}_LLM_COMPLETED"),
                    "bedrock_invocation",
                    Some(metrics),
                );
                response
            }
            Err(err) => {
                tracker.record_stage(
                    "bedrock_invocation",
                    StageStatus::Failed,
                    stage_start.elapsed(),
                    error_metadata(&err),
                );
                return self
                    .terminal_error(
                        &mut tracker,
                        &request,
                        &date_partition,
                        "bedrock_invocation",
                        err,
                        cancel,
                    )
                    .await;
            }
        };

        // -- response_processing --------------------------------------------
        let stage_start = Instant::now();
        let markdown = extract_markdown(&response.content);
        let threshold = self.deps.config.discrepancy_threshold;
        let (outcome, summary, discrepancies, partial, warning_count) =
            match extract_structured(&response.content) {
                Ok(report) => {
                    let warning_count = report.warnings.len();
                    let structured = report.structured;
                    if turn == TurnNumber::Two {
                        let (final_outcome, refined) = interpret_discrepancies(
                            structured.verification_outcome,
                            &structured.comparison_summary,
                            &structured.discrepancies,
                            threshold,
                        );
                        (
                            Some(final_outcome),
                            refined,
                            structured.discrepancies,
                            false,
                            warning_count,
                        )
                    } else {
                        (
                            Some(structured.verification_outcome),
                            structured.comparison_summary,
                            structured.discrepancies,
                            false,
                            warning_count,
                        )
                    }
                }
                Err(parse_err) if markdown.is_some() => {
                    warn!(
                        target: "vp.runtime",
                        verification_id = %request.verification_id,
                        turn = n,
                        "structured pass failed, keeping markdown-only result: {parse_err}"
                    );
                    (None, String::new(), Vec::new(), true, 0)
                }
                Err(parse_err) => {
                    tracker.record_stage(
                        "response_processing",
                        StageStatus::Failed,
                        stage_start.elapsed(),
                        error_metadata(&parse_err),
                    );
                    return self
                        .terminal_error(
                            &mut tracker,
                            &request,
                            &date_partition,
                            "response_processing",
                            parse_err,
                            cancel,
                        )
                        .await;
                }
            };

        let created_at = Utc::now();
        let image_format = match &loaded {
            LoadedContext::One(loaded) => loaded.reference_format,
            LoadedContext::Two(loaded) => loaded.checking_format,
        };
        let raw_artifact = RawResponseArtifact {
            verification_id: request.verification_id.clone(),
            turn_number: turn,
            response: RawResponseBody {
                content: response.content.clone(),
                stop_reason: response.stop_reason.clone(),
            },
            token_usage: response.token_usage(),
            bedrock_metadata: BedrockMetadata {
                model_id: response.model_id.clone(),
                request_id: response.request_id.clone(),
                latency_ms: response.latency_ms,
            },
            prompt_metadata: PromptMetadata {
                template_id: rendered.template_id.clone(),
                template_version: rendered.template_version.clone(),
                user_prompt: rendered.rendered_prompt.clone(),
                image_format,
                token_estimate: rendered.token_estimate,
            },
            created_at,
        };
        let processed_artifact = ProcessedResponseArtifact {
            verification_id: request.verification_id.clone(),
            turn_number: turn,
            verification_outcome: outcome,
            comparison_summary: summary.clone(),
            discrepancies: discrepancies.clone(),
            partial,
            created_at,
        };
        let markdown_copy = markdown.clone().unwrap_or_else(|| summary.clone());

        let responses = match self
            .persister
            .persist_responses(
                &request.verification_id,
                Some(&date_partition),
                turn,
                &raw_artifact,
                &processed_artifact,
                &markdown_copy,
                cancel,
            )
            .await
        {
            Ok(responses) => {
                let mut metadata = BTreeMap::new();
                metadata.insert("discrepancies".to_string(), json!(discrepancies.len()));
                metadata.insert("parse_warnings".to_string(), json!(warning_count));
                metadata.insert("partial".to_string(), json!(partial));
                tracker.record_stage(
                    "response_processing",
                    StageStatus::Completed,
                    stage_start.elapsed(),
                    metadata,
                );
                tracker.update_status(
                    &format!("TURN{n}_RESPONSE_PROCESSED"),
                    "response_processing",
                    None,
                );
                responses
            }
            Err(err) => {
                tracker.record_stage(
                    "response_processing",
                    StageStatus::Failed,
                    stage_start.elapsed(),
                    error_metadata(&err),
                );
                return self
                    .terminal_error(
                        &mut tracker,
                        &request,
                        &date_partition,
                        "response_processing",
                        err,
                        cancel,
                    )
                    .await;
            }
        };

        // -- prompt_storage ---------------------------------------------------
        let stage_start = Instant::now();
        let bundle = PromptBundle {
            verification_id: request.verification_id.clone(),
            prompt_type: format!("turn{n}"),
            verification_type: context.verification_type,
            message_structure: summarize_messages(&model_request),
            contextual_instructions: rendered.rendered_prompt.clone(),
            image_reference: image_ref.clone(),
            template_version: rendered.template_version.clone(),
            generation_metadata: GenerationMetadata {
                template_id: rendered.template_id.clone(),
                processing_time_ms: rendered.processing_time_ms,
                token_estimate: rendered.token_estimate,
                annotations: BTreeMap::new(),
            },
        };
        let conversation = build_conversation(&request, &loaded, &rendered.rendered_prompt, &response.content, &image_ref);
        let stored_prompt = self
            .persister
            .persist_prompt_bundle(
                &request.verification_id,
                Some(&date_partition),
                turn,
                &bundle,
                cancel,
            )
            .await;
        let stored_conversation = match stored_prompt {
            Ok(_) => {
                self.persister
                    .persist_conversation(
                        &request.verification_id,
                        Some(&date_partition),
                        turn,
                        &conversation,
                        cancel,
                    )
                    .await
            }
            Err(err) => Err(err),
        };
        let conversation_ref = match stored_conversation {
            Ok(reference) => {
                tracker.record_stage(
                    "prompt_storage",
                    StageStatus::Completed,
                    stage_start.elapsed(),
                    BTreeMap::new(),
                );
                tracker.update_status(&format!("TURN{n}_ARTIFACTS_STORED"), "prompt_storage", None);
                reference
            }
            Err(err) => {
                tracker.record_stage(
                    "prompt_storage",
                    StageStatus::Failed,
                    stage_start.elapsed(),
                    error_metadata(&err),
                );
                return self
                    .terminal_error(
                        &mut tracker,
                        &request,
                        &date_partition,
                        "prompt_storage",
                        err,
                        cancel,
                    )
                    .await;
            }
        };

        // -- metadata updates --------------------------------------------------
        let completed_status = TurnStatus::completed(turn);
        let mut metrics = BTreeMap::new();
        metrics.insert("inputTokens".to_string(), json!(response.input_tokens));
        metrics.insert("outputTokens".to_string(), json!(response.output_tokens));
        metrics.insert("totalTokens".to_string(), json!(response.total_tokens));
        metrics.insert("bedrockLatencyMs".to_string(), json!(response.latency_ms));
        let completion_entry =
            tracker.update_status(completed_status.as_str(), "completed", Some(metrics));

        let conversation_record = ConversationTurnRecord {
            turn_number: turn,
            prompt_summary: excerpt(&rendered.rendered_prompt, 256),
            response_summary: excerpt(&response.content, 256),
            token_usage: response.token_usage(),
            recorded_at: Utc::now(),
        };
        let turn_metrics = TurnMetrics {
            processing_time_ms: tracker.elapsed_ms(),
            bedrock_latency_ms: response.latency_ms,
            token_usage: response.token_usage(),
            verification_outcome: outcome,
            discrepancies_found: (turn == TurnNumber::Two).then(|| discrepancies.len() as u64),
        };
        let metadata_outcome = self
            .coordinator
            .finalize_turn(
                &request.verification_id,
                context.verification_at,
                &completion_entry,
                &conversation_record,
                &turn_metrics,
                &responses.processed_markdown,
                Some(&conversation_ref),
                cancel,
            )
            .await;

        self.patch_initialization_status(
            &date_partition,
            &request.verification_id,
            completed_status.as_str(),
            cancel,
        )
        .await;

        info!(
            target: "vp.runtime",
            verification_id = %request.verification_id,
            turn = n,
            status = completed_status.as_str(),
            processing_time_ms = tracker.elapsed_ms(),
            dynamo_ok = metadata_outcome.dynamo_ok(),
            "turn completed"
        );

        // -- output envelope ---------------------------------------------------
        let mut references: BTreeMap<String, ReferenceValue> = BTreeMap::new();
        references.insert(
            "prompts_system".to_string(),
            ReferenceValue::Single(request.prompts.system.clone()),
        );
        match turn {
            TurnNumber::One => {
                references.insert(
                    "images_reference".to_string(),
                    ReferenceValue::Single(image_ref.clone()),
                );
            }
            TurnNumber::Two => {
                references.insert(
                    "images_checking".to_string(),
                    ReferenceValue::Single(image_ref.clone()),
                );
            }
        }
        let mut response_group = BTreeMap::new();
        match (turn, &request.turn1) {
            (TurnNumber::Two, Some(PriorTurnReferences { raw_response, processed_response })) => {
                response_group.insert("turn1Raw".to_string(), raw_response.clone());
                response_group.insert("turn1Processed".to_string(), processed_response.clone());
                response_group.insert("turn2Raw".to_string(), responses.raw.clone());
                response_group.insert("turn2Processed".to_string(), responses.processed.clone());
            }
            _ => {
                response_group.insert("turn1Raw".to_string(), responses.raw.clone());
                response_group.insert("turn1Processed".to_string(), responses.processed.clone());
            }
        }
        references.insert("responses".to_string(), ReferenceValue::Group(response_group));
        if let Some(layout_ref) = request
            .processing
            .as_ref()
            .and_then(|p| p.layout_metadata.clone())
        {
            references.insert(
                "processing_layout-metadata".to_string(),
                ReferenceValue::Single(layout_ref),
            );
        }
        if let Some(historical) = historical_ref {
            references.insert(
                "processing_historical-context".to_string(),
                ReferenceValue::Single(historical),
            );
        }

        let envelope = OutputEnvelope {
            verification_id: request.verification_id.clone(),
            status: completed_status,
            s3_references: references,
            summary: TurnSummary {
                analysis_stage: turn.into(),
                processing_time_ms: tracker.elapsed_ms(),
                bedrock_latency_ms: response.latency_ms,
                token_usage: response.token_usage(),
                bedrock_request_id: response.request_id.clone(),
                verification_outcome: outcome,
                discrepancies_found: (turn == TurnNumber::Two).then(|| discrepancies.len() as u64),
                dynamodb_updated: metadata_outcome.dynamo_ok(),
                conversation_tracked: metadata_outcome.conversation_ok,
                s3_storage_completed: true,
            },
            schema_version: SCHEMA_VERSION.to_string(),
        };
        (envelope, tracker.trace())
    }

    /// Terminal error path: final status entry, error tracking, and the
    /// best-effort initialization patch, then the error envelope with the
    /// trace recorded so far.
    async fn terminal_error(
        &self,
        tracker: &mut TurnTracker,
        request: &TurnRequest,
        date_partition: &str,
        stage: &str,
        error: VerifyError,
        cancel: &CancelToken,
    ) -> (OutputEnvelope, TurnTrace) {
        let turn = request.turn_number;
        let status = exit_status_for(&error, turn);
        let error = if error.verification_id.is_none() {
            error.with_verification_id(&request.verification_id)
        } else {
            error
        };

        error!(
            target: "vp.runtime",
            verification_id = %request.verification_id,
            turn = turn.as_u8(),
            stage,
            code = %error.code,
            status = status.as_str(),
            "turn failed: {error}"
        );

        let mut metrics = BTreeMap::new();
        metrics.insert("error_code".to_string(), json!(error.code.as_str()));
        metrics.insert("error_message".to_string(), json!(error.message.clone()));
        let entry = tracker.update_status(status.as_str(), &format!("{stage}_failed"), Some(metrics));

        if let Err(status_err) = self
            .deps
            .metadata
            .update_verification_status(&request.verification_id, request.verification_context.verification_at, &entry)
            .await
        {
            warn!(
                target: "vp.runtime",
                verification_id = %request.verification_id,
                "terminal status write failed: {status_err}"
            );
        }
        self.coordinator.report(&request.verification_id, error).await;
        self.patch_initialization_status(
            date_partition,
            &request.verification_id,
            status.as_str(),
            cancel,
        )
        .await;

        let mut references: BTreeMap<String, ReferenceValue> = BTreeMap::new();
        references.insert(
            "prompts_system".to_string(),
            ReferenceValue::Single(request.prompts.system.clone()),
        );
        if let Some(reference) = &request.images.reference_base64 {
            references.insert(
                "images_reference".to_string(),
                ReferenceValue::Single(reference.clone()),
            );
        }
        if let Some(checking) = &request.images.checking_base64 {
            references.insert(
                "images_checking".to_string(),
                ReferenceValue::Single(checking.clone()),
            );
        }

        let envelope = OutputEnvelope {
            verification_id: request.verification_id.clone(),
            status,
            s3_references: references,
            summary: empty_summary(turn, tracker.elapsed_ms()),
            schema_version: SCHEMA_VERSION.to_string(),
        };
        (envelope, tracker.trace())
    }

    /// Error envelope for inputs that never became a turn request.
    async fn decode_failure_envelope(
        &self,
        event: Option<&WorkflowEvent>,
        error: VerifyError,
    ) -> OutputEnvelope {
        let (verification_id, turn) = match event {
            Some(event) => (event.verification_id.clone(), event.turn_number()),
            None => ("unknown".to_string(), TurnNumber::One),
        };
        let status = exit_status_for(&error, turn);
        error!(
            target: "vp.runtime",
            verification_id = %verification_id,
            code = %error.code,
            status = status.as_str(),
            "input envelope rejected: {error}"
        );
        if verification_id != "unknown" {
            self.coordinator.report(&verification_id, error).await;
        }

        let references = event
            .map(|event| {
                event
                    .s3_references
                    .iter()
                    .map(|(name, reference)| {
                        (name.clone(), ReferenceValue::Single(reference.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        OutputEnvelope {
            verification_id,
            status,
            s3_references: references,
            summary: empty_summary(turn, 0),
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }

    /// Best-effort patch of the initialization record's `status` field so
    /// downstream observers see the final outcome.
    async fn patch_initialization_status(
        &self,
        date_partition: &str,
        verification_id: &str,
        status: &str,
        cancel: &CancelToken,
    ) {
        let key = artifact_key(
            Some(date_partition),
            verification_id,
            ArtifactCategory::Initialization,
            "initialization.json",
        );
        let reference = ArtifactReference::new(self.deps.store.bucket().to_string(), key);
        let mut record = match self.deps.store.load_json::<Value>(&reference, cancel).await {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    target: "vp.runtime",
                    verification_id,
                    "initialization record unreadable, status patch skipped: {err}"
                );
                return;
            }
        };
        let Some(object) = record.as_object_mut() else {
            warn!(
                target: "vp.runtime",
                verification_id,
                "initialization record is not an object, status patch skipped"
            );
            return;
        };
        object.insert("status".to_string(), json!(status));
        if let Err(err) = self
            .deps
            .store
            .store_json(
                verification_id,
                Some(date_partition),
                ArtifactCategory::Initialization,
                "initialization.json",
                &record,
                cancel,
            )
            .await
        {
            warn!(
                target: "vp.runtime",
                verification_id,
                "initialization status patch failed: {err}"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Validate the request and return the turn's image reference.
fn validate_request(
    request: &TurnRequest,
    context: &vp_core::VerificationContext,
) -> Result<ArtifactReference, VerifyError> {
    if let Err(problems) = context.validate() {
        return Err(VerifyError::new(
            ErrorCode::InvalidRequest,
            "verification context failed validation",
        )
        .with_detail("problems", problems));
    }
    if request.verification_id != context.verification_id {
        return Err(VerifyError::new(
            ErrorCode::InvalidRequest,
            "request and context verification ids disagree",
        ));
    }
    match request.turn_number {
        TurnNumber::One => request.images.reference_base64.clone().ok_or_else(|| {
            VerifyError::new(
                ErrorCode::MissingRequiredField,
                "Turn 1 requires images.referenceBase64",
            )
        }),
        TurnNumber::Two => {
            if request.turn1.is_none() {
                return Err(VerifyError::new(
                    ErrorCode::MissingRequiredField,
                    "Turn 2 requires the turn1 response references",
                ));
            }
            request.images.checking_base64.clone().ok_or_else(|| {
                VerifyError::new(
                    ErrorCode::MissingRequiredField,
                    "Turn 2 requires images.checkingBase64",
                )
            })
        }
    }
}

/// Turn-1 facts for the Turn-2 template: the processed summary when present,
/// otherwise the raw analysis text.
fn turn1_facts(loaded: &LoadedContextTurn2) -> String {
    if loaded.turn1_processed.comparison_summary.is_empty() {
        loaded.turn1_raw.response.content.clone()
    } else {
        loaded.turn1_processed.comparison_summary.clone()
    }
}

fn exit_status_for(error: &VerifyError, turn: TurnNumber) -> TurnStatus {
    match error.kind {
        ErrorKind::Template => TurnStatus::TemplateProcessingError,
        ErrorKind::Validation => TurnStatus::ValidationError,
        ErrorKind::Llm => TurnStatus::BedrockError,
        _ => TurnStatus::turn_error(turn),
    }
}

fn error_metadata(error: &VerifyError) -> BTreeMap<String, Value> {
    let mut metadata = BTreeMap::new();
    metadata.insert("error_code".to_string(), json!(error.code.as_str()));
    metadata.insert("error_category".to_string(), json!(error.category()));
    metadata.insert("retryable".to_string(), json!(error.retryable));
    metadata
}

fn empty_summary(turn: TurnNumber, processing_time_ms: u64) -> TurnSummary {
    TurnSummary {
        analysis_stage: turn.into(),
        processing_time_ms,
        bedrock_latency_ms: 0,
        token_usage: TokenUsage::default(),
        bedrock_request_id: String::new(),
        verification_outcome: None,
        discrepancies_found: None,
        dynamodb_updated: false,
        conversation_tracked: false,
        s3_storage_completed: false,
    }
}

fn summarize_messages(request: &ModelRequest) -> Vec<MessageSummary> {
    let mut structure = Vec::with_capacity(request.messages.len() + 1);
    if request.system.is_some() {
        structure.push(MessageSummary {
            role: "system".to_string(),
            content_types: vec!["text".to_string()],
        });
    }
    for message in &request.messages {
        let role = match message.role {
            vp_llm::Role::User => "user",
            vp_llm::Role::Assistant => "assistant",
        };
        let content_types = message
            .content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { .. } => "text".to_string(),
                ContentBlock::Image { .. } => "image".to_string(),
            })
            .collect();
        structure.push(MessageSummary {
            role: role.to_string(),
            content_types,
        });
    }
    structure
}

fn build_conversation(
    request: &TurnRequest,
    loaded: &LoadedContext,
    rendered_prompt: &str,
    assistant_text: &str,
    image_ref: &ArtifactReference,
) -> ConversationArtifact {
    let mut messages = Vec::new();
    match loaded {
        LoadedContext::One(loaded) => {
            messages.push(ConversationMessage {
                role: ConversationRole::System,
                content: vec![ConversationContent::Text {
                    text: loaded.system_prompt.clone(),
                }],
            });
            messages.push(ConversationMessage {
                role: ConversationRole::User,
                content: vec![
                    ConversationContent::Text {
                        text: rendered_prompt.to_string(),
                    },
                    ConversationContent::Image {
                        format: loaded.reference_format.as_str().to_string(),
                        reference: Some(image_ref.clone()),
                    },
                ],
            });
        }
        LoadedContext::Two(loaded) => {
            messages.push(ConversationMessage {
                role: ConversationRole::System,
                content: vec![ConversationContent::Text {
                    text: loaded.system_prompt.clone(),
                }],
            });
            let mut turn1_content = vec![ConversationContent::Text {
                text: loaded.turn1_raw.prompt_metadata.user_prompt.clone(),
            }];
            if let Some(reference) = &request.images.reference_base64 {
                // The reference image's format was detected in Turn 1 and
                // travels in the raw artifact's prompt metadata.
                turn1_content.push(ConversationContent::Image {
                    format: loaded.turn1_raw.prompt_metadata.image_format.as_str().to_string(),
                    reference: Some(reference.clone()),
                });
            }
            messages.push(ConversationMessage {
                role: ConversationRole::User,
                content: turn1_content,
            });
            messages.push(ConversationMessage {
                role: ConversationRole::Assistant,
                content: vec![ConversationContent::Text {
                    text: loaded.turn1_raw.response.content.clone(),
                }],
            });
            messages.push(ConversationMessage {
                role: ConversationRole::User,
                content: vec![
                    ConversationContent::Text {
                        text: rendered_prompt.to_string(),
                    },
                    ConversationContent::Image {
                        format: loaded.checking_format.as_str().to_string(),
                        reference: Some(image_ref.clone()),
                    },
                ],
            });
        }
    }
    messages.push(ConversationMessage {
        role: ConversationRole::Assistant,
        content: vec![ConversationContent::Text {
            text: assistant_text.to_string(),
        }],
    });
    ConversationArtifact {
        verification_id: request.verification_id.clone(),
        turn_number: request.turn_number,
        messages,
    }
}

fn excerpt(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
