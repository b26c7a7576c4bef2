// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for the verify-pipeline.
//!
//! Every pipeline error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag), its [`ErrorKind`], a human-readable message, retry
//! classification, and arbitrary key-value details. Use the builder returned
//! by [`VerifyError::new`] to construct errors fluently; code-level defaults
//! (kind, severity, retryability) come from the catalog and can be
//! overridden per error.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request or context validation failures.
    Validation,
    /// Object-store read/write failures.
    ObjectStore,
    /// Model invocation failures.
    Llm,
    /// Response parsing failures.
    Parse,
    /// Metadata-store failures.
    Metadata,
    /// Template selection or rendering failures.
    Template,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorKind {
    /// Category string used in persisted error records.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::ObjectStore => "object_store",
            Self::Llm => "llm",
            Self::Parse => "parse",
            Self::Metadata => "metadata",
            Self::Template => "template",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ErrorSeverity & RetryStrategy
// ---------------------------------------------------------------------------

/// How serious an error is for the turn's final status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    /// Logged and ignored.
    Low,
    /// Degrades the result without failing the turn.
    Medium,
    /// Fails the turn.
    High,
    /// Fails the turn and deserves operator attention.
    Critical,
}

/// How a retryable error should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Retry without delay.
    Immediate,
    /// Retry with exponential backoff.
    Backoff,
    /// Do not retry.
    None,
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Validation --
    /// The turn request is structurally invalid.
    InvalidRequest,
    /// A required field or reference is missing.
    MissingRequiredField,
    /// The input schema version is not accepted.
    SchemaVersionUnsupported,
    /// A base64 image payload exceeds the upload bound.
    ImageTooLarge,

    // -- Object store --
    /// The requested object does not exist.
    ObjectNotFound,
    /// An object read failed.
    ObjectReadFailed,
    /// An object write failed.
    ObjectWriteFailed,

    // -- LLM --
    /// The provider rejected the request.
    LlmInvocationFailed,
    /// The call exceeded its hard timeout.
    LlmTimeout,
    /// The provider throttled the request.
    LlmThrottled,
    /// The provider is temporarily unavailable.
    LlmUnavailable,
    /// Authentication with the provider failed.
    LlmAuthFailed,
    /// The provider payload could not be normalized.
    LlmResponseInvalid,
    /// The inference configuration is invalid (temperature/reasoning combination).
    LlmConfigInvalid,

    // -- Parse --
    /// The structured extraction pass failed.
    StructuredParseFailed,
    /// The markdown extraction pass failed.
    MarkdownParseFailed,

    // -- Metadata --
    /// A metadata write failed.
    MetadataUpdateFailed,
    /// A metadata query failed.
    MetadataQueryFailed,
    /// A metadata write hit a conditional-update conflict.
    MetadataConflict,

    // -- Template --
    /// No template exists for the requested (type, turn) pair.
    TemplateNotFound,
    /// Template rendering failed.
    TemplateRenderFailed,

    // -- Internal --
    /// The ambient cancellation signal fired.
    Cancelled,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the [`ErrorKind`] this code belongs to.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest
            | Self::MissingRequiredField
            | Self::SchemaVersionUnsupported
            | Self::ImageTooLarge => ErrorKind::Validation,

            Self::ObjectNotFound | Self::ObjectReadFailed | Self::ObjectWriteFailed => {
                ErrorKind::ObjectStore
            }

            Self::LlmInvocationFailed
            | Self::LlmTimeout
            | Self::LlmThrottled
            | Self::LlmUnavailable
            | Self::LlmAuthFailed
            | Self::LlmResponseInvalid
            | Self::LlmConfigInvalid => ErrorKind::Llm,

            Self::StructuredParseFailed | Self::MarkdownParseFailed => ErrorKind::Parse,

            Self::MetadataUpdateFailed | Self::MetadataQueryFailed | Self::MetadataConflict => {
                ErrorKind::Metadata
            }

            Self::TemplateNotFound | Self::TemplateRenderFailed => ErrorKind::Template,

            Self::Cancelled | Self::Internal => ErrorKind::Internal,
        }
    }

    /// Default severity for the code.
    #[must_use]
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::InvalidRequest
            | Self::MissingRequiredField
            | Self::ImageTooLarge
            | Self::LlmConfigInvalid
            | Self::TemplateNotFound
            | Self::TemplateRenderFailed => ErrorSeverity::High,

            Self::SchemaVersionUnsupported => ErrorSeverity::Medium,

            Self::ObjectNotFound | Self::ObjectReadFailed | Self::ObjectWriteFailed => {
                ErrorSeverity::High
            }

            Self::LlmInvocationFailed
            | Self::LlmTimeout
            | Self::LlmThrottled
            | Self::LlmUnavailable
            | Self::LlmResponseInvalid => ErrorSeverity::High,
            Self::LlmAuthFailed => ErrorSeverity::Critical,

            Self::StructuredParseFailed | Self::MarkdownParseFailed => ErrorSeverity::Medium,

            Self::MetadataUpdateFailed | Self::MetadataQueryFailed | Self::MetadataConflict => {
                ErrorSeverity::Medium
            }

            Self::Cancelled => ErrorSeverity::Medium,
            Self::Internal => ErrorSeverity::Critical,
        }
    }

    /// Default retryability for the code.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::ObjectReadFailed
                | Self::ObjectWriteFailed
                | Self::LlmTimeout
                | Self::LlmThrottled
                | Self::LlmUnavailable
                | Self::MetadataUpdateFailed
                | Self::MetadataQueryFailed
                | Self::MetadataConflict
        )
    }

    /// Default retry strategy for the code.
    #[must_use]
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            Self::MetadataConflict => RetryStrategy::Immediate,
            _ if self.retryable() => RetryStrategy::Backoff,
            _ => RetryStrategy::None,
        }
    }

    /// Stable `&'static str` representation of the code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::MissingRequiredField => "MISSING_REQUIRED_FIELD",
            Self::SchemaVersionUnsupported => "SCHEMA_VERSION_UNSUPPORTED",
            Self::ImageTooLarge => "IMAGE_TOO_LARGE",
            Self::ObjectNotFound => "OBJECT_NOT_FOUND",
            Self::ObjectReadFailed => "OBJECT_READ_FAILED",
            Self::ObjectWriteFailed => "OBJECT_WRITE_FAILED",
            Self::LlmInvocationFailed => "LLM_INVOCATION_FAILED",
            Self::LlmTimeout => "LLM_TIMEOUT",
            Self::LlmThrottled => "LLM_THROTTLED",
            Self::LlmUnavailable => "LLM_UNAVAILABLE",
            Self::LlmAuthFailed => "LLM_AUTH_FAILED",
            Self::LlmResponseInvalid => "LLM_RESPONSE_INVALID",
            Self::LlmConfigInvalid => "LLM_CONFIG_INVALID",
            Self::StructuredParseFailed => "STRUCTURED_PARSE_FAILED",
            Self::MarkdownParseFailed => "MARKDOWN_PARSE_FAILED",
            Self::MetadataUpdateFailed => "METADATA_UPDATE_FAILED",
            Self::MetadataQueryFailed => "METADATA_QUERY_FAILED",
            Self::MetadataConflict => "METADATA_CONFLICT",
            Self::TemplateNotFound => "TEMPLATE_NOT_FOUND",
            Self::TemplateRenderFailed => "TEMPLATE_RENDER_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All error codes, in definition order.
pub const ALL_CODES: &[ErrorCode] = &[
    ErrorCode::InvalidRequest,
    ErrorCode::MissingRequiredField,
    ErrorCode::SchemaVersionUnsupported,
    ErrorCode::ImageTooLarge,
    ErrorCode::ObjectNotFound,
    ErrorCode::ObjectReadFailed,
    ErrorCode::ObjectWriteFailed,
    ErrorCode::LlmInvocationFailed,
    ErrorCode::LlmTimeout,
    ErrorCode::LlmThrottled,
    ErrorCode::LlmUnavailable,
    ErrorCode::LlmAuthFailed,
    ErrorCode::LlmResponseInvalid,
    ErrorCode::LlmConfigInvalid,
    ErrorCode::StructuredParseFailed,
    ErrorCode::MarkdownParseFailed,
    ErrorCode::MetadataUpdateFailed,
    ErrorCode::MetadataQueryFailed,
    ErrorCode::MetadataConflict,
    ErrorCode::TemplateNotFound,
    ErrorCode::TemplateRenderFailed,
    ErrorCode::Cancelled,
    ErrorCode::Internal,
];

/// Static catalog providing lookup and enumeration of [`ErrorCode`]s.
pub struct ErrorCatalog;

impl ErrorCatalog {
    /// Look up an [`ErrorCode`] by its stable string (e.g. `"LLM_TIMEOUT"`).
    #[must_use]
    pub fn lookup(code: &str) -> Option<ErrorCode> {
        ALL_CODES.iter().find(|c| c.as_str() == code).copied()
    }

    /// Return all codes belonging to `kind`.
    #[must_use]
    pub fn by_kind(kind: ErrorKind) -> Vec<ErrorCode> {
        ALL_CODES.iter().filter(|c| c.kind() == kind).copied().collect()
    }
}

// ---------------------------------------------------------------------------
// VerifyError
// ---------------------------------------------------------------------------

/// Unified pipeline error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, retry
/// classification, structured details, and an optional source error for
/// cause-chaining.
///
/// # Builder usage
///
/// ```
/// use vp_error::{ErrorCode, VerifyError};
///
/// let err = VerifyError::new(ErrorCode::ObjectReadFailed, "get timed out")
///     .with_detail("s3_key", "2025/06/11/verif-1/images/reference.b64")
///     .with_api_source("object-get")
///     .with_verification_id("verif-1");
/// assert!(err.retryable);
/// ```
pub struct VerifyError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Error family (derived from the code, overridable).
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Arbitrary structured details for diagnostics.
    pub details: BTreeMap<String, serde_json::Value>,
    /// Severity toward the turn's final status.
    pub severity: ErrorSeverity,
    /// Whether a retry may succeed.
    pub retryable: bool,
    /// How to retry, when retryable.
    pub retry_strategy: RetryStrategy,
    /// The API the error originated from (e.g. `"converse"`, `"object-get"`).
    pub api_source: Option<String>,
    /// Verification the error belongs to.
    pub verification_id: Option<String>,
    /// Metadata table involved, when applicable.
    pub table_name: Option<String>,
    /// Actionable suggestions for the operator.
    pub suggestions: Vec<String>,
    /// Hints for automated recovery.
    pub recovery_hints: Vec<String>,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl VerifyError {
    /// Create a new error with the code's default classification.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            kind: code.kind(),
            message: message.into(),
            details: BTreeMap::new(),
            severity: code.severity(),
            retryable: code.retryable(),
            retry_strategy: code.retry_strategy(),
            api_source: None,
            verification_id: None,
            table_name: None,
            suggestions: Vec::new(),
            recovery_hints: Vec::new(),
            source: None,
        }
    }

    /// Shorthand for a cancellation error.
    #[must_use]
    pub fn cancelled(operation: &str) -> Self {
        Self::new(ErrorCode::Cancelled, format!("{operation} cancelled"))
    }

    /// Attach a key-value pair to the diagnostic details.
    ///
    /// The value is converted via [`serde_json::to_value`]; entries that fail
    /// to serialise are skipped.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.into(), v);
        }
        self
    }

    /// Override the severity.
    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Override retryability and strategy together.
    #[must_use]
    pub fn with_retry(mut self, retryable: bool, strategy: RetryStrategy) -> Self {
        self.retryable = retryable;
        self.retry_strategy = strategy;
        self
    }

    /// Record the originating API.
    #[must_use]
    pub fn with_api_source(mut self, api_source: impl Into<String>) -> Self {
        self.api_source = Some(api_source.into());
        self
    }

    /// Record the verification the error belongs to.
    #[must_use]
    pub fn with_verification_id(mut self, id: impl Into<String>) -> Self {
        self.verification_id = Some(id.into());
        self
    }

    /// Record the metadata table involved.
    #[must_use]
    pub fn with_table_name(mut self, table: impl Into<String>) -> Self {
        self.table_name = Some(table.into());
        self
    }

    /// Add an operator suggestion.
    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    /// Add an automated-recovery hint.
    #[must_use]
    pub fn with_recovery_hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery_hints.push(hint.into());
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Category string (`self.kind.as_str()`).
    #[must_use]
    pub fn category(&self) -> &'static str {
        self.kind.as_str()
    }
}

impl fmt::Debug for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("VerifyError");
        d.field("code", &self.code);
        d.field("kind", &self.kind);
        d.field("message", &self.message);
        d.field("severity", &self.severity);
        d.field("retryable", &self.retryable);
        if !self.details.is_empty() {
            d.field("details", &self.details);
        }
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        d.finish()
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.details.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(details) = serde_json::to_string(&self.details) {
                write!(f, " {details}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for VerifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Convenience result type for pipeline operations.
pub type VerifyResult<T> = Result<T, VerifyError>;

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`VerifyError`] (without the opaque source),
/// as persisted into error-tracking records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerifyErrorDto {
    /// Error family.
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    /// Stable error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured details.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
    /// Severity.
    pub severity: ErrorSeverity,
    /// Category string (mirrors `type` for downstream filters).
    pub category: String,
    /// Whether a retry may succeed.
    pub retryable: bool,
    /// Retry strategy.
    pub retry_strategy: RetryStrategy,
    /// Originating API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_source: Option<String>,
    /// Verification the error belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_id: Option<String>,
    /// Metadata table involved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    /// Operator suggestions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    /// Automated-recovery hints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery_hints: Vec<String>,
    /// String representation of the source error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&VerifyError> for VerifyErrorDto {
    fn from(err: &VerifyError) -> Self {
        Self {
            kind: err.kind,
            code: err.code,
            message: err.message.clone(),
            details: err.details.clone(),
            severity: err.severity,
            category: err.category().to_string(),
            retryable: err.retryable,
            retry_strategy: err.retry_strategy,
            api_source: err.api_source.clone(),
            verification_id: err.verification_id.clone(),
            table_name: err.table_name.clone(),
            suggestions: err.suggestions.clone(),
            recovery_hints: err.recovery_hints.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}
