// SPDX-License-Identifier: MIT OR Apache-2.0
//! Environment-derived configuration for the verify-pipeline.
//!
//! This crate provides [`PipelineConfig`] — the per-invocation runtime
//! settings — parsed from an environment snapshot, together with semantic
//! validation that separates hard [`ConfigError`]s from advisory
//! [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Environment variable names
// ---------------------------------------------------------------------------

/// Artifact store bucket.
pub const ENV_STATE_BUCKET: &str = "STATE_BUCKET";
/// Verification metadata table.
pub const ENV_VERIFICATION_TABLE: &str = "METADATA_VERIFICATION_TABLE";
/// Conversation metadata table.
pub const ENV_CONVERSATION_TABLE: &str = "METADATA_CONVERSATION_TABLE";
/// Model identifier.
pub const ENV_LLM_MODEL_ID: &str = "LLM_MODEL_ID";
/// Provider endpoint override (testing / proxies).
pub const ENV_LLM_BASE_URL: &str = "LLM_BASE_URL";
/// Maximum output tokens.
pub const ENV_LLM_MAX_TOKENS: &str = "LLM_MAX_TOKENS";
/// Sampling temperature.
pub const ENV_LLM_TEMPERATURE: &str = "LLM_TEMPERATURE";
/// Extended-reasoning toggle (`enable` / `disable`).
pub const ENV_LLM_REASONING: &str = "LLM_REASONING";
/// Extended-reasoning token budget.
pub const ENV_LLM_REASONING_BUDGET: &str = "LLM_REASONING_BUDGET_TOKENS";
/// HTTP connect timeout in seconds.
pub const ENV_LLM_CONNECT_TIMEOUT: &str = "LLM_CONNECT_TIMEOUT_SEC";
/// Per-call hard timeout in seconds.
pub const ENV_LLM_CALL_TIMEOUT: &str = "LLM_CALL_TIMEOUT_SEC";
/// Mismatch-count threshold; `0` disables the rule.
pub const ENV_DISCREPANCY_THRESHOLD: &str = "DISCREPANCY_THRESHOLD";
/// Template set version.
pub const ENV_TEMPLATE_VERSION: &str = "TEMPLATE_VERSION";
/// Template base directory on disk.
pub const ENV_TEMPLATE_BASE_PATH: &str = "TEMPLATE_BASE_PATH";
/// Log level.
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error"];

/// Call timeouts above this many seconds generate a warning.
const LARGE_CALL_TIMEOUT_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Errors & warnings
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable {var}")]
    MissingVar {
        /// The variable name.
        var: &'static str,
    },

    /// A variable's value could not be parsed.
    #[error("failed to parse {var}: {reason}")]
    ParseError {
        /// The variable name.
        var: &'static str,
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The per-call timeout is unusually large.
    LargeCallTimeout {
        /// Timeout value in seconds.
        secs: u64,
    },
    /// The discrepancy-count rule is disabled.
    ThresholdDisabled,
    /// No template base path was configured; the embedded defaults apply.
    EmbeddedTemplates,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::LargeCallTimeout { secs } => {
                write!(f, "LLM call timeout is unusually large ({secs}s)")
            }
            ConfigWarning::ThresholdDisabled => {
                write!(f, "discrepancy threshold is 0; the mismatch-count rule is disabled")
            }
            ConfigWarning::EmbeddedTemplates => {
                write!(f, "no TEMPLATE_BASE_PATH set; using embedded template defaults")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Extended-reasoning toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningMode {
    /// Extended reasoning on; temperature may be 1.
    Enable,
    /// Extended reasoning off.
    Disable,
}

impl ReasoningMode {
    /// Whether reasoning is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enable)
    }
}

impl FromStr for ReasoningMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enable" => Ok(Self::Enable),
            "disable" => Ok(Self::Disable),
            other => Err(format!("expected 'enable' or 'disable', got '{other}'")),
        }
    }
}

/// Model invocation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LlmConfig {
    /// Model identifier.
    pub model_id: String,
    /// Endpoint override; `None` uses the provider default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Maximum output tokens.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
    /// Extended-reasoning toggle.
    pub reasoning: ReasoningMode,
    /// Extended-reasoning token budget.
    pub reasoning_budget_tokens: u32,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Per-call hard timeout in seconds.
    pub call_timeout_secs: u64,
}

impl LlmConfig {
    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Per-call timeout as a [`Duration`].
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Top-level runtime configuration for a turn invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineConfig {
    /// Artifact store bucket.
    pub state_bucket: String,
    /// Verification metadata table.
    pub verification_table: String,
    /// Conversation metadata table.
    pub conversation_table: String,
    /// Model invocation settings.
    pub llm: LlmConfig,
    /// Mismatch-count threshold; `0` disables the rule.
    pub discrepancy_threshold: u32,
    /// Template set version.
    pub template_version: String,
    /// Template base directory; `None` uses embedded defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_base_path: Option<String>,
    /// Log level.
    pub log_level: String,
}

impl PipelineConfig {
    /// Parse a configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: BTreeMap<String, String> = std::env::vars().collect();
        Self::from_map(&vars)
    }

    /// Parse a configuration from an environment snapshot.
    pub fn from_map(vars: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let required = |var: &'static str| -> Result<String, ConfigError> {
            vars.get(var)
                .filter(|v| !v.trim().is_empty())
                .cloned()
                .ok_or(ConfigError::MissingVar { var })
        };
        let parsed = |var: &'static str, default: &str| -> Result<String, ConfigError> {
            Ok(vars.get(var).cloned().unwrap_or_else(|| default.to_string()))
        };

        fn parse<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError>
        where
            T::Err: std::fmt::Display,
        {
            value.parse::<T>().map_err(|e| ConfigError::ParseError {
                var,
                reason: e.to_string(),
            })
        }

        let llm = LlmConfig {
            model_id: required(ENV_LLM_MODEL_ID)?,
            base_url: vars.get(ENV_LLM_BASE_URL).cloned(),
            max_tokens: parse(ENV_LLM_MAX_TOKENS, &parsed(ENV_LLM_MAX_TOKENS, "4096")?)?,
            temperature: parse(ENV_LLM_TEMPERATURE, &parsed(ENV_LLM_TEMPERATURE, "0.0")?)?,
            reasoning: parse(ENV_LLM_REASONING, &parsed(ENV_LLM_REASONING, "disable")?)?,
            reasoning_budget_tokens: parse(
                ENV_LLM_REASONING_BUDGET,
                &parsed(ENV_LLM_REASONING_BUDGET, "4096")?,
            )?,
            connect_timeout_secs: parse(
                ENV_LLM_CONNECT_TIMEOUT,
                &parsed(ENV_LLM_CONNECT_TIMEOUT, "5")?,
            )?,
            call_timeout_secs: parse(ENV_LLM_CALL_TIMEOUT, &parsed(ENV_LLM_CALL_TIMEOUT, "120")?)?,
        };

        Ok(Self {
            state_bucket: required(ENV_STATE_BUCKET)?,
            verification_table: required(ENV_VERIFICATION_TABLE)?,
            conversation_table: required(ENV_CONVERSATION_TABLE)?,
            llm,
            discrepancy_threshold: parse(
                ENV_DISCREPANCY_THRESHOLD,
                &parsed(ENV_DISCREPANCY_THRESHOLD, "0")?,
            )?,
            template_version: parsed(ENV_TEMPLATE_VERSION, "1.0.0")?,
            template_base_path: vars.get(ENV_TEMPLATE_BASE_PATH).cloned(),
            log_level: parsed(ENV_LOG_LEVEL, "info")?,
        })
    }

    /// Validate a parsed configuration, returning advisory warnings.
    ///
    /// Hard errors (temperature outside the range the reasoning mode allows,
    /// zero token limits, invalid log level, zero timeouts) come back as a
    /// [`ConfigError::ValidationError`]; soft issues as warnings.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut errors: Vec<String> = Vec::new();
        let mut warnings: Vec<ConfigWarning> = Vec::new();

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            errors.push(format!("invalid log level '{}'", self.log_level));
        }

        if self.llm.max_tokens == 0 {
            errors.push("LLM_MAX_TOKENS must be positive".into());
        }

        // With reasoning the temperature may be exactly 1; without it the
        // valid range is [0, 1).
        let t = self.llm.temperature;
        if self.llm.reasoning.is_enabled() {
            if !(0.0..=1.0).contains(&t) {
                errors.push(format!("temperature {t} out of range [0, 1] for reasoning mode"));
            }
            if self.llm.reasoning_budget_tokens == 0 {
                errors.push("LLM_REASONING_BUDGET_TOKENS must be positive when reasoning is enabled".into());
            }
        } else if !(0.0..1.0).contains(&t) {
            errors.push(format!("temperature {t} out of range [0, 1)"));
        }

        if self.llm.connect_timeout_secs == 0 || self.llm.call_timeout_secs == 0 {
            errors.push("LLM timeouts must be positive".into());
        } else if self.llm.call_timeout_secs > LARGE_CALL_TIMEOUT_SECS {
            warnings.push(ConfigWarning::LargeCallTimeout {
                secs: self.llm.call_timeout_secs,
            });
        }

        if self.discrepancy_threshold == 0 {
            warnings.push(ConfigWarning::ThresholdDisabled);
        }
        if self.template_base_path.is_none() {
            warnings.push(ConfigWarning::EmbeddedTemplates);
        }

        if errors.is_empty() {
            Ok(warnings)
        } else {
            Err(ConfigError::ValidationError { reasons: errors })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_vars() -> BTreeMap<String, String> {
        BTreeMap::from([
            (ENV_STATE_BUCKET.to_string(), "verification-state".to_string()),
            (ENV_VERIFICATION_TABLE.to_string(), "verification-results".to_string()),
            (ENV_CONVERSATION_TABLE.to_string(), "conversation-history".to_string()),
            (ENV_LLM_MODEL_ID.to_string(), "vision-model-v2".to_string()),
        ])
    }

    #[test]
    fn minimal_environment_parses_with_defaults() {
        let config = PipelineConfig::from_map(&minimal_vars()).unwrap();
        assert_eq!(config.state_bucket, "verification-state");
        assert_eq!(config.llm.max_tokens, 4096);
        assert_eq!(config.llm.reasoning, ReasoningMode::Disable);
        assert_eq!(config.discrepancy_threshold, 0);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.llm.call_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn missing_required_var_is_reported() {
        let mut vars = minimal_vars();
        vars.remove(ENV_STATE_BUCKET);
        let err = PipelineConfig::from_map(&vars).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar { var: ENV_STATE_BUCKET }));
    }

    #[test]
    fn blank_required_var_counts_as_missing() {
        let mut vars = minimal_vars();
        vars.insert(ENV_LLM_MODEL_ID.to_string(), "  ".to_string());
        let err = PipelineConfig::from_map(&vars).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar { var: ENV_LLM_MODEL_ID }));
    }

    #[test]
    fn unparsable_number_is_a_parse_error() {
        let mut vars = minimal_vars();
        vars.insert(ENV_LLM_MAX_TOKENS.to_string(), "lots".to_string());
        let err = PipelineConfig::from_map(&vars).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { var: ENV_LLM_MAX_TOKENS, .. }));
    }

    #[test]
    fn reasoning_mode_parses() {
        let mut vars = minimal_vars();
        vars.insert(ENV_LLM_REASONING.to_string(), "enable".to_string());
        let config = PipelineConfig::from_map(&vars).unwrap();
        assert!(config.llm.reasoning.is_enabled());

        vars.insert(ENV_LLM_REASONING.to_string(), "on".to_string());
        assert!(PipelineConfig::from_map(&vars).is_err());
    }

    #[test]
    fn default_config_validates_with_warnings() {
        let config = PipelineConfig::from_map(&minimal_vars()).unwrap();
        let warnings = config.validate().unwrap();
        assert!(warnings.contains(&ConfigWarning::ThresholdDisabled));
        assert!(warnings.contains(&ConfigWarning::EmbeddedTemplates));
    }

    #[test]
    fn temperature_one_requires_reasoning() {
        let mut vars = minimal_vars();
        vars.insert(ENV_LLM_TEMPERATURE.to_string(), "1.0".to_string());
        let config = PipelineConfig::from_map(&vars).unwrap();
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::ValidationError { .. }
        ));

        vars.insert(ENV_LLM_REASONING.to_string(), "enable".to_string());
        let config = PipelineConfig::from_map(&vars).unwrap();
        config.validate().expect("temperature 1 is valid with reasoning");
    }

    #[test]
    fn temperature_above_one_rejected_even_with_reasoning() {
        let mut vars = minimal_vars();
        vars.insert(ENV_LLM_TEMPERATURE.to_string(), "1.5".to_string());
        vars.insert(ENV_LLM_REASONING.to_string(), "enable".to_string());
        let config = PipelineConfig::from_map(&vars).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_reasoning_budget_rejected_when_enabled() {
        let mut vars = minimal_vars();
        vars.insert(ENV_LLM_REASONING.to_string(), "enable".to_string());
        vars.insert(ENV_LLM_REASONING_BUDGET.to_string(), "0".to_string());
        let config = PipelineConfig::from_map(&vars).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_log_level_rejected() {
        let mut vars = minimal_vars();
        vars.insert(ENV_LOG_LEVEL.to_string(), "verbose".to_string());
        let config = PipelineConfig::from_map(&vars).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn large_call_timeout_warns() {
        let mut vars = minimal_vars();
        vars.insert(ENV_LLM_CALL_TIMEOUT.to_string(), "900".to_string());
        let config = PipelineConfig::from_map(&vars).unwrap();
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| matches!(w, ConfigWarning::LargeCallTimeout { secs: 900 })));
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut vars = minimal_vars();
        vars.insert(ENV_LLM_CALL_TIMEOUT.to_string(), "0".to_string());
        let config = PipelineConfig::from_map(&vars).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_serde_roundtrip() {
        let config = PipelineConfig::from_map(&minimal_vars()).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn warning_display() {
        assert!(ConfigWarning::LargeCallTimeout { secs: 900 }.to_string().contains("900"));
        assert!(ConfigWarning::ThresholdDisabled.to_string().contains("disabled"));
        assert!(ConfigWarning::EmbeddedTemplates.to_string().contains("embedded"));
    }
}
