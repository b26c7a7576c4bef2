// SPDX-License-Identifier: MIT OR Apache-2.0
//! verify-pipeline
//!
//! Per-turn execution engine for a two-turn vision-LLM verification
//! pipeline: deterministic, observable, fault-tolerant orchestration of
//! context loading, prompt rendering, model invocation, response
//! processing, artifact persistence, and metadata updates.
//!
//! The workspace is split into focused crates; this package re-exports the
//! public surface. [`TurnOrchestrator`] is the entry point: feed it a
//! decoded [`vp_core::TurnRequest`] or a raw input value and receive the
//! output envelope for the workflow controller.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub use vp_config as config;
pub use vp_core as core;
pub use vp_envelope as envelope;
pub use vp_error as error;
pub use vp_llm as llm;
pub use vp_metadata as metadata;
pub use vp_parser as parser;
pub use vp_retry as retry;
pub use vp_runtime as runtime;
pub use vp_store as store;
pub use vp_template as template;

pub use vp_config::PipelineConfig;
pub use vp_core::{CancelToken, OutputEnvelope, TurnNumber, TurnRequest, TurnStatus};
pub use vp_envelope::{InputEnvelope, decode_input};
pub use vp_error::{ErrorCode, VerifyError, VerifyResult};
pub use vp_runtime::{TurnDeps, TurnOrchestrator, TurnTrace};
