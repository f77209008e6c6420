use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{DepartmentId, RoleId, UserId, WorkflowError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeType {
    User,
    Role,
    Department,
}

impl AssigneeType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Role => "role",
            Self::Department => "department",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "role" => Some(Self::Role),
            "department" => Some(Self::Department),
            _ => None,
        }
    }
}

/// Escalation direction across a role hierarchy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Start at the most junior level and move toward seniors.
    Upwards,
    #[default]
    Downwards,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upwards => "upwards",
            Self::Downwards => "downwards",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "upwards" => Some(Self::Upwards),
            "downwards" => Some(Self::Downwards),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct HierarchyConfig {
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub allow_parallel: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    #[default]
    Approval,
    Review,
    Signature,
}

impl ActionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approval => "approval",
            Self::Review => "review",
            Self::Signature => "signature",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approval" => Some(Self::Approval),
            "review" => Some(Self::Review),
            "signature" => Some(Self::Signature),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Read,
    Edit,
    Download,
}

impl AccessType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Edit => "edit",
            Self::Download => "download",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "read" => Some(Self::Read),
            "edit" => Some(Self::Edit),
            "download" => Some(Self::Download),
            _ => None,
        }
    }
}

/// Sorted, de-duplicated access set. Every grant implies READ.
#[must_use]
pub fn normalize_access(access_types: &[AccessType]) -> Vec<AccessType> {
    let mut set: BTreeSet<AccessType> = access_types.iter().copied().collect();
    set.insert(AccessType::Read);
    set.into_iter().collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct DepartmentScope {
    pub department_id: DepartmentId,
    pub role_ids: Vec<RoleId>,
}

/// Who must act on a workflow step.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "assignee_type", rename_all = "snake_case")]
pub enum Assignment {
    User {
        user_ids: Vec<UserId>,
    },
    Role {
        role_ids: Vec<RoleId>,
        #[serde(default)]
        hierarchy: HierarchyConfig,
    },
    Department {
        departments: Vec<DepartmentScope>,
        #[serde(default)]
        hierarchy: HierarchyConfig,
    },
}

impl Assignment {
    #[must_use]
    pub fn assignee_type(&self) -> AssigneeType {
        match self {
            Self::User { .. } => AssigneeType::User,
            Self::Role { .. } => AssigneeType::Role,
            Self::Department { .. } => AssigneeType::Department,
        }
    }

    #[must_use]
    pub fn hierarchy(&self) -> Option<HierarchyConfig> {
        match self {
            Self::User { .. } => None,
            Self::Role { hierarchy, .. } | Self::Department { hierarchy, .. } => Some(*hierarchy),
        }
    }

    /// True for ROLE/DEPARTMENT assignments that escalate level by level.
    #[must_use]
    pub fn is_hierarchical(&self) -> bool {
        self.hierarchy()
            .is_some_and(|hierarchy| !hierarchy.allow_parallel)
    }

    /// Union of every role the assignment selects, in ascending order.
    #[must_use]
    pub fn selected_role_ids(&self) -> Vec<RoleId> {
        let set: BTreeSet<RoleId> = match self {
            Self::User { .. } => BTreeSet::new(),
            Self::Role { role_ids, .. } => role_ids.iter().copied().collect(),
            Self::Department { departments, .. } => departments
                .iter()
                .flat_map(|scope| scope.role_ids.iter().copied())
                .collect(),
        };
        set.into_iter().collect()
    }

    /// Rejects empty target sets.
    ///
    /// # Errors
    /// Returns [`WorkflowError::InvalidAssignment`] when the assignment names
    /// no targets or a department scope selects no roles.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        match self {
            Self::User { user_ids } if user_ids.is_empty() => Err(
                WorkflowError::InvalidAssignment("user assignment lists no users".to_string()),
            ),
            Self::Role { role_ids, .. } if role_ids.is_empty() => Err(
                WorkflowError::InvalidAssignment("empty role set".to_string()),
            ),
            Self::Department { departments, .. } => {
                if departments.is_empty() {
                    return Err(WorkflowError::InvalidAssignment(
                        "department assignment lists no departments".to_string(),
                    ));
                }
                if let Some(scope) = departments.iter().find(|scope| scope.role_ids.is_empty()) {
                    return Err(WorkflowError::InvalidAssignment(format!(
                        "department {} selects no roles",
                        scope.department_id
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn assignment_decodes_from_tagged_json() {
        let role = RoleId::new();
        let raw = format!(
            r#"{{"assignee_type":"role","role_ids":["{role}"],
                "hierarchy":{{"direction":"upwards"}}}}"#
        );
        let assignment: Assignment = must_ok(serde_json::from_str(&raw));

        assert_eq!(assignment.assignee_type(), AssigneeType::Role);
        assert!(assignment.is_hierarchical());
        assert_eq!(
            assignment.hierarchy().map(|config| config.direction),
            Some(Direction::Upwards)
        );
        assert_eq!(assignment.selected_role_ids(), vec![role]);
    }

    #[test]
    fn unknown_assignee_type_is_rejected_at_decode() {
        let raw = r#"{"assignee_type":"team","team_ids":[]}"#;
        assert!(serde_json::from_str::<Assignment>(raw).is_err());
    }

    #[test]
    fn empty_targets_are_invalid() {
        let err = match (Assignment::Role {
            role_ids: Vec::new(),
            hierarchy: HierarchyConfig::default(),
        })
        .validate()
        {
            Ok(()) => panic!("expected invalid assignment"),
            Err(err) => err,
        };
        assert_eq!(err.code(), "invalid_assignment");

        let department = Assignment::Department {
            departments: vec![DepartmentScope {
                department_id: DepartmentId::new(),
                role_ids: Vec::new(),
            }],
            hierarchy: HierarchyConfig::default(),
        };
        assert!(department.validate().is_err());
    }

    #[test]
    fn access_sets_always_include_read() {
        assert_eq!(
            normalize_access(&[AccessType::Edit, AccessType::Edit]),
            vec![AccessType::Read, AccessType::Edit]
        );
        assert_eq!(normalize_access(&[]), vec![AccessType::Read]);
    }
}
