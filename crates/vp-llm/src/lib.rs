// SPDX-License-Identifier: MIT OR Apache-2.0
//! Multimodal model invocation adapter.
//!
//! Builds model requests from (system prompt, user prompt, base64 image,
//! optional prior turn pair), validates the reasoning/temperature
//! combination before invocation, invokes the model behind the
//! [`ModelInvoker`] seam, and normalizes provider payloads into
//! [`vp_core::LlmResponse`] with the full raw payload retained for audit.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// HTTP invoker and provider-payload normalization.
pub mod invoke;
/// Scripted invoker for tests.
pub mod mock;
/// Request model and builders.
pub mod request;

pub use invoke::{HttpModelInvoker, ModelInvoker, normalize_response};
pub use mock::MockModelInvoker;
pub use request::{
    ContentBlock, ImageBlock, ImageSource, InferenceConfig, ModelMessage, ModelRequest,
    RequestBuilder, Role, ThinkingConfig,
};
