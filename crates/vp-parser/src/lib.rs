// SPDX-License-Identifier: MIT OR Apache-2.0
//! Model response parsing and discrepancy interpretation.
//!
//! Two passes over the model's text output: [`extract_markdown`] recovers
//! the comparison narrative for human review, and [`extract_structured`]
//! recovers `{verificationOutcome, comparisonSummary, discrepancies[]}` from
//! a fenced JSON block or the first balanced JSON object. The passes are
//! independent — a structured failure can still leave a usable markdown
//! body. [`interpret::interpret_discrepancies`] then applies the
//! severity/threshold rules.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Severity/threshold outcome refinement.
pub mod interpret;
/// Markdown and structured extraction passes.
pub mod parser;

pub use interpret::interpret_discrepancies;
pub use parser::{ParseReport, ParseWarning, StructuredResponse, extract_markdown, extract_structured};
