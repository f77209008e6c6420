use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::assignment::{AccessType, ActionType, Assignment};
use crate::WorkflowError;

fn default_access_types() -> Vec<AccessType> {
    vec![AccessType::Read, AccessType::Edit]
}

/// Authoring payload for one workflow version. Steps are numbered 1..n in
/// the order they appear.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StepDefinition {
    pub step_name: String,
    /// Stored with the step for authoring tools. Parallelism is decided per
    /// assignment by `HierarchyConfig::allow_parallel`.
    #[serde(default)]
    pub allow_parallel: bool,
    #[serde(default)]
    pub requires_document: bool,
    pub assignments: Vec<AssignmentDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AssignmentDefinition {
    pub assignee: Assignment,
    #[serde(default)]
    pub action_type: ActionType,
    #[serde(default = "default_access_types")]
    pub access_types: Vec<AccessType>,
}

impl WorkflowDefinition {
    /// Loads a definition from a `.json`, `.yaml` or `.yml` file.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Validation`] when the file cannot be read,
    /// decoded or fails [`WorkflowDefinition::validate`].
    pub fn from_path(path: &Path) -> Result<Self, WorkflowError> {
        let content = fs::read_to_string(path).map_err(|err| {
            WorkflowError::Validation(format!(
                "failed to read workflow definition {}: {err}",
                path.display()
            ))
        })?;
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

        let definition: Self = if is_yaml {
            serde_yaml::from_str(&content).map_err(|err| {
                WorkflowError::Validation(format!("invalid workflow YAML structure: {err}"))
            })?
        } else {
            serde_json::from_str(&content).map_err(|err| {
                WorkflowError::Validation(format!("invalid workflow JSON structure: {err}"))
            })?
        };
        definition.validate()?;
        Ok(definition)
    }

    /// Structural checks that need no directory lookups.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Validation`] for naming problems and
    /// [`WorkflowError::InvalidAssignment`] for empty assignment targets.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        ensure_non_empty("name", &self.name)?;
        if self.steps.is_empty() {
            return Err(WorkflowError::Validation(
                "workflow MUST define at least one step".to_string(),
            ));
        }

        let mut step_names = BTreeSet::new();
        for step in &self.steps {
            ensure_non_empty("step_name", &step.step_name)?;
            if !step_names.insert(step.step_name.as_str()) {
                return Err(WorkflowError::Validation(format!(
                    "duplicate step_name: {}",
                    step.step_name
                )));
            }
            if step.assignments.is_empty() {
                return Err(WorkflowError::Validation(format!(
                    "step {} MUST define at least one assignment",
                    step.step_name
                )));
            }
            for assignment in &step.assignments {
                assignment.assignee.validate()?;
                if assignment.access_types.is_empty() {
                    return Err(WorkflowError::Validation(format!(
                        "step {} has an assignment without access_types",
                        step.step_name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Hex SHA-256 over the canonical JSON encoding.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Validation`] when serialization fails.
    pub fn definition_hash(&self) -> Result<String, WorkflowError> {
        let bytes = serde_json::to_vec(self).map_err(|err| {
            WorkflowError::Validation(format!("failed to encode workflow definition: {err}"))
        })?;
        Ok(hex::encode(Sha256::digest(bytes)))
    }
}

fn ensure_non_empty(field: &str, value: &str) -> Result<(), WorkflowError> {
    if value.trim().is_empty() {
        return Err(WorkflowError::Validation(format!(
            "{field} MUST be non-empty"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HierarchyConfig, RoleId, UserId};

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "contract-review".to_string(),
            description: None,
            steps: vec![
                StepDefinition {
                    step_name: "draft".to_string(),
                    allow_parallel: false,
                    requires_document: true,
                    assignments: vec![AssignmentDefinition {
                        assignee: Assignment::User {
                            user_ids: vec![UserId::new()],
                        },
                        action_type: ActionType::Review,
                        access_types: vec![AccessType::Edit],
                    }],
                },
                StepDefinition {
                    step_name: "sign-off".to_string(),
                    allow_parallel: false,
                    requires_document: false,
                    assignments: vec![AssignmentDefinition {
                        assignee: Assignment::Role {
                            role_ids: vec![RoleId::new()],
                            hierarchy: HierarchyConfig::default(),
                        },
                        action_type: ActionType::Approval,
                        access_types: default_access_types(),
                    }],
                },
            ],
        }
    }

    #[test]
    fn valid_definition_passes() {
        must_ok(fixture_definition().validate());
    }

    #[test]
    fn duplicate_step_names_are_rejected() {
        let mut definition = fixture_definition();
        definition.steps[1].step_name = "draft".to_string();
        assert!(definition.validate().is_err());
    }

    #[test]
    fn definition_without_steps_is_rejected() {
        let mut definition = fixture_definition();
        definition.steps.clear();
        assert!(definition.validate().is_err());
    }

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let definition = fixture_definition();
        let first = must_ok(definition.definition_hash());
        assert_eq!(first, must_ok(definition.definition_hash()));
        assert_eq!(first.len(), 64);

        let mut edited = definition;
        edited.description = Some("edited".to_string());
        assert_ne!(first, must_ok(edited.definition_hash()));
    }

    #[test]
    fn yaml_and_json_files_decode_to_the_same_definition() {
        let definition = fixture_definition();
        let dir = std::env::temp_dir();
        let stem = ulid::Ulid::new();
        let json_path = dir.join(format!("docflow-definition-{stem}.json"));
        let yaml_path = dir.join(format!("docflow-definition-{stem}.yaml"));
        must_ok(fs::write(&json_path, must_ok(serde_json::to_string(&definition))));
        must_ok(fs::write(&yaml_path, must_ok(serde_yaml::to_string(&definition))));

        assert_eq!(must_ok(WorkflowDefinition::from_path(&json_path)), definition);
        assert_eq!(must_ok(WorkflowDefinition::from_path(&yaml_path)), definition);

        let _ = fs::remove_file(&json_path);
        let _ = fs::remove_file(&yaml_path);
    }
}
