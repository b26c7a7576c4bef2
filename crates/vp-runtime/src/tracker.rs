// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only status and stage tracking for a single turn.
//!
//! Two owned sequences scoped to the orchestrator's lifetime. Timestamps are
//! computed from a fixed turn start plus monotonically measured elapsed
//! time, so entries are totally ordered even across wall-clock adjustments.
//! Not concurrency-safe — invoked only from the main execution path.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use vp_core::{ProcessingStage, StageStatus, StatusHistoryEntry};

/// Immutable snapshot of a turn's stages and status transitions, returned
/// alongside the output envelope for logging and tests.
#[derive(Debug, Clone, Default)]
pub struct TurnTrace {
    /// Recorded stages, in order.
    pub stages: Vec<ProcessingStage>,
    /// Recorded status transitions, in order.
    pub history: Vec<StatusHistoryEntry>,
}

impl TurnTrace {
    /// Names of the recorded stages, in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.stage_name.as_str()).collect()
    }
}

/// Tracks processing stages and status transitions within one turn.
#[derive(Debug)]
pub struct TurnTracker {
    function_name: String,
    started_wall: DateTime<Utc>,
    started: Instant,
    stages: Vec<ProcessingStage>,
    history: Vec<StatusHistoryEntry>,
}

impl TurnTracker {
    /// Start tracking a turn executed by `function_name`.
    #[must_use]
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            started_wall: Utc::now(),
            started: Instant::now(),
            stages: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Milliseconds elapsed since the turn started.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// When the turn started.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_wall
    }

    /// The executing function's name.
    #[must_use]
    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Append a processing stage that just finished with `status` after
    /// running for `duration`.
    pub fn record_stage(
        &mut self,
        stage_name: &str,
        status: StageStatus,
        duration: Duration,
        metadata: BTreeMap<String, serde_json::Value>,
    ) {
        let end_time = self.now();
        let start_time = end_time
            - chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        self.stages.push(ProcessingStage {
            stage_name: stage_name.to_string(),
            start_time,
            end_time,
            duration_ms: duration.as_millis() as u64,
            status,
            metadata,
        });
    }

    /// Append a status transition and return the entry for persistence.
    pub fn update_status(
        &mut self,
        status: &str,
        stage: &str,
        metrics: Option<BTreeMap<String, serde_json::Value>>,
    ) -> StatusHistoryEntry {
        let entry = StatusHistoryEntry {
            status: status.to_string(),
            timestamp: self.now(),
            function_name: self.function_name.clone(),
            processing_time_ms: self.elapsed_ms(),
            stage: stage.to_string(),
            metrics,
        };
        self.history.push(entry.clone());
        entry
    }

    /// Recorded stages, in order.
    #[must_use]
    pub fn stages(&self) -> &[ProcessingStage] {
        &self.stages
    }

    /// Recorded status transitions, in order.
    #[must_use]
    pub fn history(&self) -> &[StatusHistoryEntry] {
        &self.history
    }

    /// Number of recorded stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Snapshot of the recorded stages and history.
    #[must_use]
    pub fn trace(&self) -> TurnTrace {
        TurnTrace {
            stages: self.stages.clone(),
            history: self.history.clone(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.started_wall
            + chrono::Duration::from_std(self.started.elapsed())
                .unwrap_or_else(|_| chrono::Duration::zero())
    }
}
