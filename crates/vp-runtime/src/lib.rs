// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-turn orchestration runtime.
//!
//! Wires the pipeline: concurrent context loading with retry, best-effort
//! historical resolution, prompt rendering, model invocation, response
//! processing, artifact persistence, and the coordinated metadata writes —
//! all instrumented through the append-only status/stage tracker and
//! terminating in the output envelope the workflow controller consumes.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Metadata write coordination.
pub mod coordinator;
/// Best-effort historical context resolution.
pub mod historical;
/// Concurrent context loading with retry and a first-error latch.
pub mod loader;
/// The turn orchestrator state machine.
pub mod orchestrator;
/// Artifact persistence in the canonical key layout.
pub mod persister;
/// Append-only status and stage tracking.
pub mod tracker;

pub use coordinator::{MetadataCoordinator, MetadataOutcome};
pub use historical::HistoricalContextResolver;
pub use loader::{ContextLoader, LoadedContextTurn1, LoadedContextTurn2};
pub use orchestrator::{TurnDeps, TurnOrchestrator};
pub use persister::{ArtifactPersister, PersistedResponses};
pub use tracker::{TurnTrace, TurnTracker};
