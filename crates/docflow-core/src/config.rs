use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::WorkflowError;

/// Longest deadline either hour setting may ask for (one hundred years).
pub const MAX_DEADLINE_HOURS: i64 = 24 * 366 * 100;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Deadline stamped on delegate instances created by a query.
    pub delegate_deadline_hours: i64,
    /// Advisory deadline for materialized instances; escalation tooling reads it.
    pub step_deadline_hours: Option<i64>,
    pub max_ancestor_depth: usize,
    pub busy_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delegate_deadline_hours: 48,
            step_deadline_hours: None,
            max_ancestor_depth: 256,
            busy_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// Validates numeric bounds.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Configuration`] when a field is outside its
    /// allowed range.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if !(1..=MAX_DEADLINE_HOURS).contains(&self.delegate_deadline_hours) {
            return Err(WorkflowError::Configuration(format!(
                "delegate_deadline_hours MUST be within 1..={MAX_DEADLINE_HOURS}"
            )));
        }
        if self
            .step_deadline_hours
            .is_some_and(|hours| !(1..=MAX_DEADLINE_HOURS).contains(&hours))
        {
            return Err(WorkflowError::Configuration(format!(
                "step_deadline_hours MUST be within 1..={MAX_DEADLINE_HOURS} when set"
            )));
        }
        if self.max_ancestor_depth == 0 {
            return Err(WorkflowError::Configuration(
                "max_ancestor_depth MUST be >= 1".to_string(),
            ));
        }
        if self.busy_timeout_ms == 0 {
            return Err(WorkflowError::Configuration(
                "busy_timeout_ms MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Decodes and validates a config from JSON.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Configuration`] when decoding fails or values
    /// violate [`EngineConfig::validate`].
    pub fn from_json(value: &Value) -> Result<Self, WorkflowError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            WorkflowError::Configuration(format!("invalid engine config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON or YAML config file.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Configuration`] when the file cannot be read,
    /// decoded or validated.
    pub fn from_path(path: &Path) -> Result<Self, WorkflowError> {
        let content = fs::read_to_string(path).map_err(|err| {
            WorkflowError::Configuration(format!(
                "failed to read engine config {}: {err}",
                path.display()
            ))
        })?;
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
        let config: Self = if is_yaml {
            serde_yaml::from_str(&content).map_err(|err| {
                WorkflowError::Configuration(format!("invalid engine config YAML: {err}"))
            })?
        } else {
            serde_json::from_str(&content).map_err(|err| {
                WorkflowError::Configuration(format!("invalid engine config JSON: {err}"))
            })?
        };
        config.validate()?;
        Ok(config)
    }
}
