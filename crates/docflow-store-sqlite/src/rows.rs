//! Column lists and row decoders shared by every query module.

use anyhow::{Context, Result};
use docflow_core::{
    format_rfc3339, parse_rfc3339_utc, AccessLevel, AccessType, ActionType, Assignment,
    AssignmentId, AssignmentProgress, DepartmentId, DepartmentStepProgress, Document,
    DocumentAccessGrant, DocumentAction, DocumentHistoryEntry, DocumentId, GrantId, HistoryId,
    Notification, NotificationId, NotificationStatus, NotificationType, ProcessId,
    ProcessInstance, ProcessQuery, ProcessStatus, ProgressId, QueryId, QueryStatus, RoleHierarchy,
    RoleId, StepInstance, StepInstanceId, StepStatus, Subject, UserId, WorkflowAssignmentRecord,
    WorkflowId, WorkflowRecord, WorkflowStepId, WorkflowStepRecord,
};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use ulid::Ulid;

pub(crate) const PROCESS_COLUMNS: &str = "process_id, workflow_id, initiator_id, name, \
     current_step_id, status, is_recirculated, created_at, completed_at";

pub(crate) const STEP_INSTANCE_COLUMNS: &str = "step_instance_id, process_id, step_id, \
     assignment_id, progress_id, assigned_to, role_id, department_id, level, status, \
     picked_by_id, claimed_at, decision_at, deadline, recirculation_reason, \
     recirculation_cycle, is_recirculated, created_at";

pub(crate) const PROGRESS_SELECT: &str = "SELECT p.progress_id, p.process_id, p.assignment_id, \
     p.step_id, p.role_hierarchy_json, p.current_level, p.completed, p.completed_at, \
     d.required_roles_json, d.completed_roles_json \
     FROM assignment_progress p \
     LEFT JOIN department_step_progress d ON d.progress_id = p.progress_id";

pub(crate) const QUERY_COLUMNS: &str = "query_id, process_id, step_instance_id, raised_by, \
     addressed_to, question, answer, status, delegated_step_name, details_json, created_at, \
     answered_at";

pub(crate) const GRANT_COLUMNS: &str = "grant_id, document_id, subject_type, subject_id, \
     process_id, assignment_id, step_instance_id, access_types_json, access_level, created_at";

pub(crate) const NOTIFICATION_COLUMNS: &str = "notification_id, process_id, step_instance_id, \
     user_id, notification_type, status, metadata_json, created_at";

pub(crate) const DOCUMENT_COLUMNS: &str = "document_id, name, parent_id, path";

pub(crate) const HISTORY_COLUMNS: &str = "history_id, process_id, document_id, action, \
     actor_id, replaced_document_id, is_recirculation_trigger, note, created_at";

pub(crate) const WORKFLOW_COLUMNS: &str = "workflow_id, name, description, version, is_active, \
     previous_workflow_id, created_by, definition_hash, created_at";

pub(crate) const WORKFLOW_STEP_COLUMNS: &str =
    "step_id, workflow_id, step_number, step_name, allow_parallel, requires_document";

pub(crate) const WORKFLOW_ASSIGNMENT_COLUMNS: &str =
    "assignment_id, step_id, assignment_json, action_type, access_types_json";

pub(crate) fn parse_process_row(row: &Row<'_>) -> rusqlite::Result<ProcessInstance> {
    Ok(ProcessInstance {
        process_id: ProcessId(ulid_at(row, 0)?),
        workflow_id: WorkflowId(ulid_at(row, 1)?),
        initiator_id: UserId(ulid_at(row, 2)?),
        name: row.get(3)?,
        current_step_id: opt_ulid_at(row, 4)?.map(WorkflowStepId),
        status: enum_at(row, 5, ProcessStatus::parse, "process status")?,
        is_recirculated: row.get::<_, i64>(6)? != 0,
        created_at: ts_at(row, 7)?,
        completed_at: opt_ts_at(row, 8)?,
    })
}

pub(crate) fn parse_step_instance_row(row: &Row<'_>) -> rusqlite::Result<StepInstance> {
    Ok(StepInstance {
        step_instance_id: StepInstanceId(ulid_at(row, 0)?),
        process_id: ProcessId(ulid_at(row, 1)?),
        step_id: WorkflowStepId(ulid_at(row, 2)?),
        assignment_id: opt_ulid_at(row, 3)?.map(AssignmentId),
        progress_id: opt_ulid_at(row, 4)?.map(ProgressId),
        assigned_to: UserId(ulid_at(row, 5)?),
        role_id: opt_ulid_at(row, 6)?.map(RoleId),
        department_id: opt_ulid_at(row, 7)?.map(DepartmentId),
        level: u32_at(row, 8)?,
        status: enum_at(row, 9, StepStatus::parse, "step status")?,
        picked_by_id: opt_ulid_at(row, 10)?.map(UserId),
        claimed_at: opt_ts_at(row, 11)?,
        decision_at: opt_ts_at(row, 12)?,
        deadline: opt_ts_at(row, 13)?,
        recirculation_reason: row.get(14)?,
        recirculation_cycle: u32_at(row, 15)?,
        is_recirculated: row.get::<_, i64>(16)? != 0,
        created_at: ts_at(row, 17)?,
    })
}

pub(crate) fn parse_progress_row(row: &Row<'_>) -> rusqlite::Result<AssignmentProgress> {
    let role_hierarchy = match row.get::<_, Option<String>>(4)? {
        Some(raw) => Some(decode_json::<RoleHierarchy>(4, &raw)?),
        None => None,
    };
    let department = match (
        row.get::<_, Option<String>>(8)?,
        row.get::<_, Option<String>>(9)?,
    ) {
        (Some(required), Some(completed)) => Some(DepartmentStepProgress {
            required_roles: decode_json(8, &required)?,
            completed_roles: decode_json(9, &completed)?,
        }),
        _ => None,
    };

    Ok(AssignmentProgress {
        progress_id: ProgressId(ulid_at(row, 0)?),
        process_id: ProcessId(ulid_at(row, 1)?),
        assignment_id: AssignmentId(ulid_at(row, 2)?),
        step_id: WorkflowStepId(ulid_at(row, 3)?),
        role_hierarchy,
        current_level: u32_at(row, 5)?,
        completed: row.get::<_, i64>(6)? != 0,
        completed_at: opt_ts_at(row, 7)?,
        department,
    })
}

pub(crate) fn parse_query_row(row: &Row<'_>) -> rusqlite::Result<ProcessQuery> {
    Ok(ProcessQuery {
        query_id: QueryId(ulid_at(row, 0)?),
        process_id: ProcessId(ulid_at(row, 1)?),
        step_instance_id: StepInstanceId(ulid_at(row, 2)?),
        raised_by: UserId(ulid_at(row, 3)?),
        addressed_to: UserId(ulid_at(row, 4)?),
        question: row.get(5)?,
        answer: row.get(6)?,
        status: enum_at(row, 7, QueryStatus::parse, "query status")?,
        delegated_step_name: row.get(8)?,
        details: decode_json(9, &row.get::<_, String>(9)?)?,
        created_at: ts_at(row, 10)?,
        answered_at: opt_ts_at(row, 11)?,
    })
}

pub(crate) fn parse_grant_row(row: &Row<'_>) -> rusqlite::Result<DocumentAccessGrant> {
    let subject_type: String = row.get(2)?;
    let subject = Subject::from_parts(&subject_type, ulid_at(row, 3)?).ok_or_else(|| {
        conversion_error(2, Type::Text, format!("invalid subject_type: {subject_type}"))
    })?;

    Ok(DocumentAccessGrant {
        grant_id: GrantId(ulid_at(row, 0)?),
        document_id: DocumentId(ulid_at(row, 1)?),
        subject,
        process_id: opt_ulid_at(row, 4)?.map(ProcessId),
        assignment_id: opt_ulid_at(row, 5)?.map(AssignmentId),
        step_instance_id: opt_ulid_at(row, 6)?.map(StepInstanceId),
        access_types: decode_json::<Vec<AccessType>>(7, &row.get::<_, String>(7)?)?,
        access_level: enum_at(row, 8, AccessLevel::parse, "access level")?,
        created_at: ts_at(row, 9)?,
    })
}

pub(crate) fn parse_notification_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        notification_id: NotificationId(ulid_at(row, 0)?),
        process_id: ProcessId(ulid_at(row, 1)?),
        step_instance_id: opt_ulid_at(row, 2)?.map(StepInstanceId),
        user_id: UserId(ulid_at(row, 3)?),
        notification_type: enum_at(row, 4, NotificationType::parse, "notification type")?,
        status: enum_at(row, 5, NotificationStatus::parse, "notification status")?,
        metadata: decode_json(6, &row.get::<_, String>(6)?)?,
        created_at: ts_at(row, 7)?,
    })
}

pub(crate) fn parse_document_row(row: &Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        document_id: DocumentId(ulid_at(row, 0)?),
        name: row.get(1)?,
        parent_id: opt_ulid_at(row, 2)?.map(DocumentId),
        path: row.get(3)?,
    })
}

pub(crate) fn parse_history_row(row: &Row<'_>) -> rusqlite::Result<DocumentHistoryEntry> {
    Ok(DocumentHistoryEntry {
        history_id: HistoryId(ulid_at(row, 0)?),
        process_id: ProcessId(ulid_at(row, 1)?),
        document_id: DocumentId(ulid_at(row, 2)?),
        action: enum_at(row, 3, DocumentAction::parse, "document action")?,
        actor_id: UserId(ulid_at(row, 4)?),
        replaced_document_id: opt_ulid_at(row, 5)?.map(DocumentId),
        is_recirculation_trigger: row.get::<_, i64>(6)? != 0,
        note: row.get(7)?,
        created_at: ts_at(row, 8)?,
    })
}

pub(crate) fn parse_workflow_row(row: &Row<'_>) -> rusqlite::Result<WorkflowRecord> {
    Ok(WorkflowRecord {
        workflow_id: WorkflowId(ulid_at(row, 0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        version: u32_at(row, 3)?,
        is_active: row.get::<_, i64>(4)? != 0,
        previous_workflow_id: opt_ulid_at(row, 5)?.map(WorkflowId),
        created_by: opt_ulid_at(row, 6)?.map(UserId),
        definition_hash: row.get(7)?,
        created_at: ts_at(row, 8)?,
        steps: Vec::new(),
    })
}

pub(crate) fn parse_workflow_step_row(row: &Row<'_>) -> rusqlite::Result<WorkflowStepRecord> {
    Ok(WorkflowStepRecord {
        step_id: WorkflowStepId(ulid_at(row, 0)?),
        workflow_id: WorkflowId(ulid_at(row, 1)?),
        step_number: u32_at(row, 2)?,
        step_name: row.get(3)?,
        allow_parallel: row.get::<_, i64>(4)? != 0,
        requires_document: row.get::<_, i64>(5)? != 0,
        assignments: Vec::new(),
    })
}

pub(crate) fn parse_workflow_assignment_row(
    row: &Row<'_>,
) -> rusqlite::Result<WorkflowAssignmentRecord> {
    Ok(WorkflowAssignmentRecord {
        assignment_id: AssignmentId(ulid_at(row, 0)?),
        step_id: WorkflowStepId(ulid_at(row, 1)?),
        assignment: decode_json::<Assignment>(2, &row.get::<_, String>(2)?)?,
        action_type: enum_at(row, 3, ActionType::parse, "action type")?,
        access_types: decode_json(4, &row.get::<_, String>(4)?)?,
    })
}

pub(crate) fn ulid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Ulid> {
    let raw: String = row.get(idx)?;
    Ulid::from_string(&raw)
        .map_err(|_| conversion_error(idx, Type::Text, format!("invalid ULID: {raw}")))
}

pub(crate) fn opt_ulid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Ulid>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => Ulid::from_string(&raw)
            .map(Some)
            .map_err(|_| conversion_error(idx, Type::Text, format!("invalid ULID: {raw}"))),
        None => Ok(None),
    }
}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(idx)?;
    parse_rfc3339_utc(&raw).map_err(|err| conversion_error(idx, Type::Text, err.to_string()))
}

fn opt_ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<OffsetDateTime>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => parse_rfc3339_utc(&raw)
            .map(Some)
            .map_err(|err| conversion_error(idx, Type::Text, err.to_string())),
        None => Ok(None),
    }
}

fn u32_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<u32> {
    let value: i64 = row.get(idx)?;
    u32::try_from(value)
        .map_err(|_| conversion_error(idx, Type::Integer, format!("invalid u32 column: {value}")))
}

fn enum_at<T>(
    row: &Row<'_>,
    idx: usize,
    parse: fn(&str) -> Option<T>,
    what: &str,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, Type::Text, format!("invalid {what}: {raw}")))
}

fn decode_json<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|err| conversion_error(idx, Type::Text, format!("invalid JSON column: {err}")))
}

fn conversion_error(idx: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

pub(crate) fn ts(value: OffsetDateTime) -> Result<String> {
    Ok(format_rfc3339(value)?)
}

pub(crate) fn opt_ts(value: Option<OffsetDateTime>) -> Result<Option<String>> {
    value.map(ts).transpose()
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("failed to encode JSON column")
}

pub(crate) fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

pub(crate) fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
