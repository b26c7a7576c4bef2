// SPDX-License-Identifier: MIT OR Apache-2.0
//! Turn-specific prompt template selection and rendering.
//!
//! Templates are versioned text files using `{{var}}` substitution and
//! `{{#each list}}…{{/each}}` iteration. A template is selected by
//! `(verification type, turn number)`; the four defaults ship embedded and a
//! `TEMPLATE_BASE_PATH` directory overrides them on disk.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Template context binding.
pub mod context;
/// The `{{var}}` / `{{#each}}` rendering engine.
pub mod engine;
/// Template store, selection, and the processor facade.
pub mod processor;

pub use context::build_context;
pub use engine::{TemplateError, render};
pub use processor::{RenderedPrompt, TemplateProcessor, TemplateStore, template_id};
