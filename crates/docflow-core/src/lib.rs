//! Domain model for the document approval engine.
//!
//! This crate is I/O free apart from loading definition and config files. It
//! owns the identifier newtypes, the closed status enums persisted by the
//! store, the [`Assignment`] sum type, the role hierarchy resolver and the
//! error taxonomy every engine operation reports through.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod assignment;
pub mod collaborators;
pub mod config;
pub mod definition;
pub mod hierarchy;

pub use assignment::{
    normalize_access, AccessType, ActionType, AssigneeType, Assignment, DepartmentScope,
    Direction, HierarchyConfig,
};
pub use collaborators::{
    Actor, IdentityProvider, MemorySink, NoopSink, NotificationSink, SinkError, StaticIdentity,
};
pub use config::{EngineConfig, MAX_DEADLINE_HOURS};
pub use definition::{AssignmentDefinition, StepDefinition, WorkflowDefinition};
pub use hierarchy::{resolve_role_hierarchy, RoleDirectory, RoleHierarchy};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum WorkflowError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("step instance {0} was already claimed")]
    AlreadyClaimed(StepInstanceId),
    #[error("step instance {0} is parked for recirculation")]
    RecirculationPending(StepInstanceId),
    #[error("step instance {0} is not in progress for this assignee")]
    InvalidStepOrAssignee(StepInstanceId),
    #[error("invalid assignment: {0}")]
    InvalidAssignment(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl WorkflowError {
    pub fn not_found(entity: &'static str, id: impl Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable code surfaced to callers.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::AlreadyClaimed(_) => "already_claimed",
            Self::RecirculationPending(_) => "recirculation_pending",
            Self::InvalidStepOrAssignee(_) => "invalid_step_or_assignee",
            Self::InvalidAssignment(_) => "invalid_assignment",
            Self::Validation(_) => "validation",
            Self::Configuration(_) => "configuration",
        }
    }
}

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = WorkflowError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(value).map(Self).map_err(|err| {
                    WorkflowError::Validation(format!(
                        "invalid {} ULID `{value}`: {err}",
                        stringify!($name)
                    ))
                })
            }
        }
    };
}

ulid_id!(WorkflowId);
ulid_id!(
    /// Identifies a step inside one workflow version.
    WorkflowStepId
);
ulid_id!(AssignmentId);
ulid_id!(ProcessId);
ulid_id!(StepInstanceId);
ulid_id!(ProgressId);
ulid_id!(QueryId);
ulid_id!(DocumentId);
ulid_id!(UserId);
ulid_id!(RoleId);
ulid_id!(DepartmentId);
ulid_id!(GrantId);
ulid_id!(NotificationId);
ulid_id!(HistoryId);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Pending,
    InProgress,
    Completed,
}

impl ProcessStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Lifecycle of one unit of work.
///
/// `Pending -> InProgress -> Approved`, with `InProgress | Approved ->
/// ForRecirculation -> Pending` driven by queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Approved,
    ForRecirculation,
}

impl StepStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Approved => "approved",
            Self::ForRecirculation => "for_recirculation",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "approved" => Some(Self::Approved),
            "for_recirculation" => Some(Self::ForRecirculation),
            _ => None,
        }
    }

    /// True while the instance still holds up its step.
    #[must_use]
    pub fn is_open(self) -> bool {
        !matches!(self, Self::Approved)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Open,
    Resolved,
}

impl QueryStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Standard,
    Full,
}

impl AccessLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Full => "full",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "standard" => Some(Self::Standard),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    StepAssignment,
    StepAssigned,
    DocumentQuery,
    QueryResolved,
    StepCompleted,
}

impl NotificationType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StepAssignment => "step_assignment",
            Self::StepAssigned => "step_assigned",
            Self::DocumentQuery => "document_query",
            Self::QueryResolved => "query_resolved",
            Self::StepCompleted => "step_completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "step_assignment" => Some(Self::StepAssignment),
            "step_assigned" => Some(Self::StepAssigned),
            "document_query" => Some(Self::DocumentQuery),
            "query_resolved" => Some(Self::QueryResolved),
            "step_completed" => Some(Self::StepCompleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Active,
    Claimed,
    Completed,
}

impl NotificationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "claimed" => Some(Self::Claimed),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocumentAction {
    Uploaded,
    Replaced,
    Feedback,
}

impl DocumentAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Replaced => "replaced",
            Self::Feedback => "feedback",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "uploaded" => Some(Self::Uploaded),
            "replaced" => Some(Self::Replaced),
            "feedback" => Some(Self::Feedback),
            _ => None,
        }
    }
}

/// Holder of a document grant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(tag = "subject_type", content = "subject_id", rename_all = "snake_case")]
pub enum Subject {
    User(UserId),
    Role(RoleId),
    Department(DepartmentId),
}

impl Subject {
    #[must_use]
    pub fn kind_str(self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Role(_) => "role",
            Self::Department(_) => "department",
        }
    }

    #[must_use]
    pub fn ulid(self) -> Ulid {
        match self {
            Self::User(id) => id.0,
            Self::Role(id) => id.0,
            Self::Department(id) => id.0,
        }
    }

    #[must_use]
    pub fn from_parts(kind: &str, id: Ulid) -> Option<Self> {
        match kind {
            "user" => Some(Self::User(UserId(id))),
            "role" => Some(Self::Role(RoleId(id))),
            "department" => Some(Self::Department(DepartmentId(id))),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Department {
    pub department_id: DepartmentId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Role {
    pub role_id: RoleId,
    pub name: String,
    pub parent_role_id: Option<RoleId>,
    pub department_id: Option<DepartmentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct User {
    pub user_id: UserId,
    pub username: String,
}

/// Document metadata. Content lives with the storage collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Document {
    pub document_id: DocumentId,
    pub name: String,
    pub parent_id: Option<DocumentId>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRecord {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub description: Option<String>,
    pub version: u32,
    pub is_active: bool,
    pub previous_workflow_id: Option<WorkflowId>,
    pub created_by: Option<UserId>,
    pub definition_hash: String,
    pub created_at: OffsetDateTime,
    pub steps: Vec<WorkflowStepRecord>,
}

impl WorkflowRecord {
    #[must_use]
    pub fn step(&self, step_id: WorkflowStepId) -> Option<&WorkflowStepRecord> {
        self.steps.iter().find(|step| step.step_id == step_id)
    }

    #[must_use]
    pub fn step_by_name(&self, step_name: &str) -> Option<&WorkflowStepRecord> {
        self.steps.iter().find(|step| step.step_name == step_name)
    }

    #[must_use]
    pub fn first_step(&self) -> Option<&WorkflowStepRecord> {
        self.steps.iter().min_by_key(|step| step.step_number)
    }

    /// Next step by `step_number`, skipping gaps.
    #[must_use]
    pub fn next_step(&self, step_number: u32) -> Option<&WorkflowStepRecord> {
        self.steps
            .iter()
            .filter(|step| step.step_number > step_number)
            .min_by_key(|step| step.step_number)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStepRecord {
    pub step_id: WorkflowStepId,
    pub workflow_id: WorkflowId,
    pub step_number: u32,
    pub step_name: String,
    /// Informational; the engine never reads it.
    pub allow_parallel: bool,
    pub requires_document: bool,
    pub assignments: Vec<WorkflowAssignmentRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowAssignmentRecord {
    pub assignment_id: AssignmentId,
    pub step_id: WorkflowStepId,
    pub assignment: Assignment,
    pub action_type: ActionType,
    pub access_types: Vec<AccessType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessInstance {
    pub process_id: ProcessId,
    pub workflow_id: WorkflowId,
    pub initiator_id: UserId,
    pub name: String,
    pub current_step_id: Option<WorkflowStepId>,
    pub status: ProcessStatus,
    pub is_recirculated: bool,
    pub created_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepInstance {
    pub step_instance_id: StepInstanceId,
    pub process_id: ProcessId,
    pub step_id: WorkflowStepId,
    /// `None` for ad-hoc delegate instances created by a query.
    pub assignment_id: Option<AssignmentId>,
    pub progress_id: Option<ProgressId>,
    pub assigned_to: UserId,
    pub role_id: Option<RoleId>,
    pub department_id: Option<DepartmentId>,
    pub level: u32,
    pub status: StepStatus,
    pub picked_by_id: Option<UserId>,
    pub claimed_at: Option<OffsetDateTime>,
    pub decision_at: Option<OffsetDateTime>,
    pub deadline: Option<OffsetDateTime>,
    pub recirculation_reason: Option<String>,
    pub recirculation_cycle: u32,
    pub is_recirculated: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DepartmentStepProgress {
    pub required_roles: Vec<RoleId>,
    pub completed_roles: Vec<RoleId>,
}

impl DepartmentStepProgress {
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.required_roles
            .iter()
            .all(|role| self.completed_roles.contains(role))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentProgress {
    pub progress_id: ProgressId,
    pub process_id: ProcessId,
    pub assignment_id: AssignmentId,
    pub step_id: WorkflowStepId,
    pub role_hierarchy: Option<RoleHierarchy>,
    pub current_level: u32,
    pub completed: bool,
    pub completed_at: Option<OffsetDateTime>,
    pub department: Option<DepartmentStepProgress>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessQuery {
    pub query_id: QueryId,
    pub process_id: ProcessId,
    pub step_instance_id: StepInstanceId,
    pub raised_by: UserId,
    pub addressed_to: UserId,
    pub question: String,
    pub answer: Option<String>,
    pub status: QueryStatus,
    pub delegated_step_name: Option<String>,
    pub details: Value,
    pub created_at: OffsetDateTime,
    pub answered_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentAccessGrant {
    pub grant_id: GrantId,
    pub document_id: DocumentId,
    pub subject: Subject,
    pub process_id: Option<ProcessId>,
    pub assignment_id: Option<AssignmentId>,
    pub step_instance_id: Option<StepInstanceId>,
    pub access_types: Vec<AccessType>,
    pub access_level: AccessLevel,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub notification_id: NotificationId,
    pub process_id: ProcessId,
    pub step_instance_id: Option<StepInstanceId>,
    pub user_id: UserId,
    pub notification_type: NotificationType,
    pub status: NotificationStatus,
    pub metadata: Value,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentHistoryEntry {
    pub history_id: HistoryId,
    pub process_id: ProcessId,
    pub document_id: DocumentId,
    pub action: DocumentAction,
    pub actor_id: UserId,
    pub replaced_document_id: Option<DocumentId>,
    pub is_recirculation_trigger: bool,
    pub note: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Parses an RFC3339 timestamp and requires a UTC offset.
///
/// # Errors
/// Returns [`WorkflowError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, WorkflowError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| WorkflowError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(WorkflowError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`WorkflowError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, WorkflowError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            WorkflowError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
