// SPDX-License-Identifier: MIT OR Apache-2.0
//! Markdown and structured extraction passes.

use serde_json::Value;
use tracing::warn;

use vp_core::{Discrepancy, DiscrepancyType, Severity, VerificationOutcome};
use vp_error::{ErrorCode, VerifyError, VerifyResult};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// The structured payload extracted from a model reply.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredResponse {
    /// The model's verdict.
    pub verification_outcome: VerificationOutcome,
    /// The model's comparison summary.
    pub comparison_summary: String,
    /// Deduplicated discrepancies.
    pub discrepancies: Vec<Discrepancy>,
}

/// A tolerated irregularity in the structured payload. Each warning is also
/// logged with a stable `code` so the counts are observable as metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseWarning {
    /// An unrecognized severity was downgraded to `MEDIUM`.
    UnknownSeverity {
        /// The discrepancy's item.
        item: String,
        /// The value the model emitted.
        value: String,
    },
    /// An unrecognized type was downgraded to `UNKNOWN`.
    UnknownType {
        /// The discrepancy's item.
        item: String,
        /// The value the model emitted.
        value: String,
    },
    /// A repeated `(item, type)` entry was dropped.
    DuplicateDiscrepancy {
        /// The discrepancy's item.
        item: String,
    },
    /// A discrepancy entry without an `item` was dropped.
    MissingItem,
}

/// The structured pass result: payload plus tolerated irregularities.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseReport {
    /// The extracted payload.
    pub structured: StructuredResponse,
    /// Irregularities tolerated during extraction.
    pub warnings: Vec<ParseWarning>,
}

// ---------------------------------------------------------------------------
// Markdown pass
// ---------------------------------------------------------------------------

/// Extract the comparison markdown body: the reply text with structured
/// JSON fences removed. Returns `None` when nothing readable remains.
#[must_use]
pub fn extract_markdown(content: &str) -> Option<String> {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(open) = rest.find("```") {
        let (before, fence) = rest.split_at(open);
        out.push_str(before);
        match fence_body(fence) {
            Some((body, after)) => {
                // Keep fences that are not structured JSON (tables, samples).
                if serde_json::from_str::<Value>(body.trim()).is_err() {
                    out.push_str(&fence[..fence.len() - after.len()]);
                }
                rest = after;
            }
            None => {
                out.push_str(fence);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    let trimmed = out.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Split a string starting with ``` into (fence body, remainder after the
/// closing fence). Returns `None` when the fence never closes.
fn fence_body(fence: &str) -> Option<(&str, &str)> {
    let after_open = &fence[3..];
    let newline = after_open.find('\n')?;
    let body_and_rest = &after_open[newline + 1..];
    let close = body_and_rest.find("```")?;
    Some((&body_and_rest[..close], &body_and_rest[close + 3..]))
}

// ---------------------------------------------------------------------------
// Structured pass
// ---------------------------------------------------------------------------

/// Extract the structured payload from a model reply.
///
/// Candidates are tried in order: every fenced code block, then every
/// balanced JSON object found in the raw text. The first candidate that
/// parses as an object with a recognizable `verificationOutcome` wins.
pub fn extract_structured(content: &str) -> VerifyResult<ParseReport> {
    for candidate in candidates(content) {
        if let Some(report) = parse_candidate(&candidate) {
            for warning in &report.warnings {
                log_warning(warning);
            }
            return Ok(report);
        }
    }
    Err(VerifyError::new(
        ErrorCode::StructuredParseFailed,
        "no structured verification payload found in model reply",
    )
    .with_detail("content_length", content.len()))
}

fn candidates(content: &str) -> Vec<String> {
    let mut found = Vec::new();

    // Fenced blocks first; the templates instruct the model to use one.
    let mut rest = content;
    while let Some(open) = rest.find("```") {
        match fence_body(&rest[open..]) {
            Some((body, after)) => {
                found.push(body.trim().to_string());
                rest = after;
            }
            None => break,
        }
    }

    // Balanced objects anywhere in the surrounding prose.
    for (index, byte) in content.bytes().enumerate() {
        if byte == b'{' {
            let mut stream =
                serde_json::Deserializer::from_str(&content[index..]).into_iter::<Value>();
            if let Some(Ok(value)) = stream.next()
                && value.is_object()
            {
                found.push(value.to_string());
            }
        }
    }

    found
}

fn parse_candidate(candidate: &str) -> Option<ParseReport> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    let object = value.as_object()?;
    let outcome = parse_outcome(object.get("verificationOutcome")?.as_str()?)?;
    let comparison_summary = object
        .get("comparisonSummary")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let mut warnings = Vec::new();
    let mut discrepancies: Vec<Discrepancy> = Vec::new();
    if let Some(entries) = object.get("discrepancies").and_then(|v| v.as_array()) {
        for entry in entries {
            let Some(item) = entry.get("item").and_then(|v| v.as_str()) else {
                warnings.push(ParseWarning::MissingItem);
                continue;
            };
            let kind = match entry.get("type").and_then(|v| v.as_str()) {
                Some(raw) => parse_type(raw).unwrap_or_else(|| {
                    warnings.push(ParseWarning::UnknownType {
                        item: item.to_string(),
                        value: raw.to_string(),
                    });
                    DiscrepancyType::Unknown
                }),
                None => {
                    warnings.push(ParseWarning::UnknownType {
                        item: item.to_string(),
                        value: String::new(),
                    });
                    DiscrepancyType::Unknown
                }
            };
            let severity = match entry.get("severity").and_then(|v| v.as_str()) {
                Some(raw) => parse_severity(raw).unwrap_or_else(|| {
                    warnings.push(ParseWarning::UnknownSeverity {
                        item: item.to_string(),
                        value: raw.to_string(),
                    });
                    Severity::Medium
                }),
                None => {
                    warnings.push(ParseWarning::UnknownSeverity {
                        item: item.to_string(),
                        value: String::new(),
                    });
                    Severity::Medium
                }
            };

            if discrepancies
                .iter()
                .any(|d| d.item == item && d.kind == kind)
            {
                warnings.push(ParseWarning::DuplicateDiscrepancy {
                    item: item.to_string(),
                });
                continue;
            }

            discrepancies.push(Discrepancy {
                item: item.to_string(),
                kind,
                expected: entry
                    .get("expected")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                found: entry
                    .get("found")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                severity,
            });
        }
    }

    Some(ParseReport {
        structured: StructuredResponse {
            verification_outcome: outcome,
            comparison_summary,
            discrepancies,
        },
        warnings,
    })
}

fn parse_outcome(raw: &str) -> Option<VerificationOutcome> {
    match raw.to_ascii_uppercase().as_str() {
        "CORRECT" => Some(VerificationOutcome::Correct),
        "INCORRECT" => Some(VerificationOutcome::Incorrect),
        "INCONCLUSIVE" => Some(VerificationOutcome::Inconclusive),
        "FAILED" => Some(VerificationOutcome::Failed),
        _ => None,
    }
}

fn parse_type(raw: &str) -> Option<DiscrepancyType> {
    match raw.to_ascii_uppercase().as_str() {
        "MISSING" => Some(DiscrepancyType::Missing),
        "MISPLACED" => Some(DiscrepancyType::Misplaced),
        "EXTRA" => Some(DiscrepancyType::Extra),
        "WRONG_PRODUCT" => Some(DiscrepancyType::WrongProduct),
        "QUANTITY" => Some(DiscrepancyType::Quantity),
        _ => None,
    }
}

fn parse_severity(raw: &str) -> Option<Severity> {
    match raw.to_ascii_uppercase().as_str() {
        "LOW" => Some(Severity::Low),
        "MEDIUM" => Some(Severity::Medium),
        "HIGH" => Some(Severity::High),
        _ => None,
    }
}

fn log_warning(warning: &ParseWarning) {
    match warning {
        ParseWarning::UnknownSeverity { item, value } => warn!(
            target: "vp.parser",
            code = "unknown_severity",
            item = %item,
            value = %value,
            "downgraded unknown severity to MEDIUM"
        ),
        ParseWarning::UnknownType { item, value } => warn!(
            target: "vp.parser",
            code = "unknown_type",
            item = %item,
            value = %value,
            "downgraded unknown discrepancy type to UNKNOWN"
        ),
        ParseWarning::DuplicateDiscrepancy { item } => warn!(
            target: "vp.parser",
            code = "duplicate_discrepancy",
            item = %item,
            "dropped duplicate discrepancy"
        ),
        ParseWarning::MissingItem => warn!(
            target: "vp.parser",
            code = "missing_item",
            "dropped discrepancy without an item"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const REPLY: &str = r#"The checking image matches the reference closely.

```json
{
  "verificationOutcome": "CORRECT",
  "comparisonSummary": "All slots match.",
  "discrepancies": []
}
```

No further action needed."#;

    #[test]
    fn extracts_structured_from_fenced_block() {
        let report = extract_structured(REPLY).unwrap();
        assert_eq!(report.structured.verification_outcome, VerificationOutcome::Correct);
        assert_eq!(report.structured.comparison_summary, "All slots match.");
        assert!(report.structured.discrepancies.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn markdown_pass_strips_json_fence() {
        let markdown = extract_markdown(REPLY).unwrap();
        assert!(markdown.contains("matches the reference"));
        assert!(markdown.contains("No further action needed."));
        assert!(!markdown.contains("verificationOutcome"));
    }

    #[test]
    fn markdown_keeps_non_json_fences() {
        let content = "Before\n```text\nrow A: ok\n```\nAfter";
        let markdown = extract_markdown(content).unwrap();
        assert!(markdown.contains("row A: ok"));
    }

    #[test]
    fn markdown_of_empty_reply_is_none() {
        assert_eq!(extract_markdown("   \n"), None);
    }

    #[test]
    fn extracts_bare_object_from_prose() {
        let content = r#"Verdict follows. {"verificationOutcome": "INCORRECT", "comparisonSummary": "B2 differs.", "discrepancies": [{"item": "B2", "type": "WRONG_PRODUCT", "expected": "Water", "found": "Cola", "severity": "HIGH"}]} End."#;
        let report = extract_structured(content).unwrap();
        assert_eq!(report.structured.verification_outcome, VerificationOutcome::Incorrect);
        assert_eq!(report.structured.discrepancies.len(), 1);
        assert_eq!(report.structured.discrepancies[0].kind, DiscrepancyType::WrongProduct);
    }

    #[test]
    fn unknown_severity_downgrades_to_medium() {
        let content = r#"{"verificationOutcome": "INCORRECT", "comparisonSummary": "", "discrepancies": [{"item": "A1", "type": "MISSING", "expected": "Cola", "found": "", "severity": "SEVERE"}]}"#;
        let report = extract_structured(content).unwrap();
        assert_eq!(report.structured.discrepancies[0].severity, Severity::Medium);
        assert!(matches!(
            report.warnings[0],
            ParseWarning::UnknownSeverity { ref value, .. } if value == "SEVERE"
        ));
    }

    #[test]
    fn unknown_type_downgrades_to_unknown() {
        let content = r#"{"verificationOutcome": "INCORRECT", "comparisonSummary": "", "discrepancies": [{"item": "A1", "type": "VANISHED", "expected": "", "found": "", "severity": "LOW"}]}"#;
        let report = extract_structured(content).unwrap();
        assert_eq!(report.structured.discrepancies[0].kind, DiscrepancyType::Unknown);
    }

    #[test]
    fn duplicates_are_dropped() {
        let content = r#"{"verificationOutcome": "INCORRECT", "comparisonSummary": "", "discrepancies": [
            {"item": "A1", "type": "MISSING", "expected": "Cola", "found": "", "severity": "LOW"},
            {"item": "A1", "type": "MISSING", "expected": "Cola", "found": "", "severity": "HIGH"},
            {"item": "A1", "type": "EXTRA", "expected": "", "found": "Chips", "severity": "LOW"}
        ]}"#;
        let report = extract_structured(content).unwrap();
        assert_eq!(report.structured.discrepancies.len(), 2);
        assert!(report
            .warnings
            .iter()
            .any(|w| matches!(w, ParseWarning::DuplicateDiscrepancy { .. })));
    }

    #[test]
    fn entry_without_item_is_dropped() {
        let content = r#"{"verificationOutcome": "CORRECT", "comparisonSummary": "", "discrepancies": [{"type": "MISSING", "severity": "LOW"}]}"#;
        let report = extract_structured(content).unwrap();
        assert!(report.structured.discrepancies.is_empty());
        assert_eq!(report.warnings, vec![ParseWarning::MissingItem]);
    }

    #[test]
    fn reply_without_payload_fails_non_retryable() {
        let err = extract_structured("just prose, no JSON").unwrap_err();
        assert_eq!(err.code, ErrorCode::StructuredParseFailed);
        assert!(!err.retryable);
    }

    #[test]
    fn unknown_outcome_is_rejected() {
        let err = extract_structured(r#"{"verificationOutcome": "MAYBE"}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::StructuredParseFailed);
    }

    #[test]
    fn case_insensitive_enums() {
        let content = r#"{"verificationOutcome": "correct", "comparisonSummary": "", "discrepancies": [{"item": "A1", "type": "missing", "expected": "", "found": "", "severity": "low"}]}"#;
        let report = extract_structured(content).unwrap();
        assert_eq!(report.structured.verification_outcome, VerificationOutcome::Correct);
        assert_eq!(report.structured.discrepancies[0].severity, Severity::Low);
        assert!(report.warnings.is_empty());
    }

    proptest! {
        // Arbitrary surrounding prose never breaks extraction of a valid fenced payload.
        #[test]
        fn prose_around_fence_is_tolerated(prefix in "[a-zA-Z0-9 .,\n]{0,200}", suffix in "[a-zA-Z0-9 .,\n]{0,200}") {
            let content = format!(
                "{prefix}\n```json\n{{\"verificationOutcome\": \"CORRECT\", \"comparisonSummary\": \"ok\", \"discrepancies\": []}}\n```\n{suffix}"
            );
            let report = extract_structured(&content).unwrap();
            prop_assert_eq!(report.structured.verification_outcome, VerificationOutcome::Correct);
        }

        // The parser never panics on arbitrary input.
        #[test]
        fn never_panics(content in ".{0,400}") {
            let _ = extract_structured(&content);
            let _ = extract_markdown(&content);
        }
    }
}
