// SPDX-License-Identifier: MIT OR Apache-2.0
//! Severity/threshold outcome refinement.
//!
//! Pure function, no I/O. Rules, in order:
//! 1. Any `HIGH`-severity discrepancy forces `INCORRECT`.
//! 2. With `threshold > 0`, `count(MISSING | MISPLACED) >= threshold` forces
//!    `INCORRECT`; `threshold = 0` disables the rule.
//! 3. Otherwise the model's outcome stands.
//!
//! When a rule changes the outcome the summary gains
//! `"Assessment: <OUTCOME> due to <N> discrepancies."` where `N` counts the
//! discrepancies that triggered the rule.

use vp_core::{Discrepancy, Severity, VerificationOutcome};

/// Apply the refinement rules, returning the final outcome and the possibly
/// annotated summary.
#[must_use]
pub fn interpret_discrepancies(
    model_outcome: VerificationOutcome,
    summary: &str,
    discrepancies: &[Discrepancy],
    threshold: u32,
) -> (VerificationOutcome, String) {
    let high_count = discrepancies
        .iter()
        .filter(|d| d.severity == Severity::High)
        .count() as u32;
    let mismatch_count = discrepancies.iter().filter(|d| d.kind.is_mismatch()).count() as u32;

    let (final_outcome, trigger_count) = if high_count > 0 {
        (VerificationOutcome::Incorrect, high_count)
    } else if threshold > 0 && mismatch_count >= threshold {
        (VerificationOutcome::Incorrect, mismatch_count)
    } else {
        return (model_outcome, summary.to_string());
    };

    if final_outcome == model_outcome {
        return (model_outcome, summary.to_string());
    }

    let annotation = format!(
        "Assessment: {final_outcome} due to {trigger_count} discrepancies."
    );
    let refined = if summary.is_empty() {
        annotation
    } else {
        format!("{summary} {annotation}")
    };
    (final_outcome, refined)
}
