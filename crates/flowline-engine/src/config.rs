//! Run configuration: parsing, defaults, and semantic validation.
//!
//! [`ExecuteConfig`] is the construction boundary with the caller's CLI or
//! config layer. It can be built directly, or parsed from YAML with `${VAR}`
//! environment substitution.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use flowline_types::RetryPolicy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default bound on batches buffered between adjacent stages.
pub const DEFAULT_QUEUE_CAPACITY: usize = 8;
/// Default records per batch.
pub const DEFAULT_BATCH_SIZE: usize = 64;
/// Upper bound on records per batch.
pub const MAX_BATCH_SIZE: usize = 1000;

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

/// Options recognized by [`crate::execute`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteConfig {
    /// Bounded capacity (in batches) of every inter-stage queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Records accumulated per batch by the source worker.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Retry policy applied to every stage's unit of work.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Overall deadline for the run; expiry cancels every stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_timeout_ms: Option<u64>,
}

impl Default for ExecuteConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
            overall_timeout_ms: None,
        }
    }
}

impl ExecuteConfig {
    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a message listing all violations found, not just the first.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut errors = Vec::new();

        if self.queue_capacity == 0 {
            errors.push("queue_capacity must be at least 1".to_string());
        }
        if self.batch_size == 0 {
            errors.push("batch_size must be at least 1".to_string());
        }
        if self.batch_size > MAX_BATCH_SIZE {
            errors.push(format!(
                "batch_size {} exceeds the maximum of {MAX_BATCH_SIZE}",
                self.batch_size
            ));
        }
        if self.overall_timeout_ms == Some(0) {
            errors.push("overall_timeout_ms must be positive when set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// `${VAR}` references in a config string that are not set in the
/// environment.
#[derive(Debug, thiserror::Error)]
#[error("missing environment variable(s): {}", missing.join(", "))]
pub struct MissingEnvVars {
    pub missing: Vec<String>,
}

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns [`MissingEnvVars`] listing every referenced variable that is not
/// set, not just the first.
pub fn substitute_env_vars(input: &str) -> std::result::Result<String, MissingEnvVars> {
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_else(|_| {
            missing.push(cap[1].to_string());
            String::new()
        })
    });

    if missing.is_empty() {
        Ok(result.into_owned())
    } else {
        Err(MissingEnvVars { missing })
    }
}

/// Parse an [`ExecuteConfig`] from a YAML string (after env substitution).
///
/// # Errors
///
/// Returns an error if env substitution fails or the YAML is invalid.
pub fn parse_config_str(yaml_str: &str) -> Result<ExecuteConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    let config: ExecuteConfig =
        serde_yaml::from_str(&substituted).context("Failed to parse execute config YAML")?;
    Ok(config)
}
