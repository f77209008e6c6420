//! Process initiation and read models.

use anyhow::{Context, Result};
use docflow_core::{
    AccessLevel, AccessType, AssignmentProgress, DocumentHistoryEntry, DocumentId, Notification,
    ProcessId, ProcessInstance, ProcessQuery, ProcessStatus, StepInstance, Subject,
    UserId, WorkflowError, WorkflowId,
};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::access::{grant, GrantRequest};
use crate::advance::check_and_advance;
use crate::directory::{ensure_user, load_document};
use crate::materialize::materialize;
use crate::rows::{
    collect_rows, parse_history_row, parse_notification_row, parse_step_instance_row,
    HISTORY_COLUMNS, NOTIFICATION_COLUMNS, STEP_INSTANCE_COLUMNS,
};
use crate::scope::TxScope;
use crate::SqliteProcessStore;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct InitiateProcess {
    pub workflow_id: WorkflowId,
    pub initiator_id: UserId,
    pub name: String,
    #[serde(default)]
    pub document_ids: Vec<DocumentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CurrentStep {
    pub step_number: u32,
    pub step_name: String,
}

/// Everything a caller needs to render one process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessView {
    pub process: ProcessInstance,
    pub workflow_name: String,
    pub workflow_version: u32,
    pub current_step: Option<CurrentStep>,
    pub documents: Vec<DocumentId>,
    pub progress: Vec<AssignmentProgress>,
    pub instances: Vec<StepInstance>,
    pub queries: Vec<ProcessQuery>,
    pub blocked_by_query: bool,
}

impl SqliteProcessStore {
    /// Starts a process on an active workflow version and materializes its
    /// first step.
    pub fn initiate_process(&mut self, request: &InitiateProcess) -> Result<ProcessView> {
        let process_id = self.write("initiate_process", |scope| initiate(scope, request))?;
        self.get_process(process_id)
    }

    pub fn get_process(&self, process_id: ProcessId) -> Result<ProcessView> {
        let view = self.read(|scope| {
            let process = scope.load_process(process_id)?;
            let workflow = scope.load_workflow(process.workflow_id)?;
            let current_step = process
                .current_step_id
                .and_then(|step_id| workflow.step(step_id))
                .map(|step| CurrentStep {
                    step_number: step.step_number,
                    step_name: step.step_name.clone(),
                });
            let open_queries = scope.open_query_count(process_id)?;
            Ok(ProcessView {
                workflow_name: workflow.name.clone(),
                workflow_version: workflow.version,
                current_step,
                documents: scope.process_documents(process_id)?,
                progress: scope.progress_for_process(process_id)?,
                instances: scope.instances_for_process(process_id)?,
                queries: Vec::new(),
                blocked_by_query: open_queries > 0,
                process,
            })
        })?;
        Ok(ProcessView {
            queries: self.list_queries(process_id)?,
            ..view
        })
    }

    /// Open work assigned to `user_id`, oldest first.
    pub fn list_inbox(&self, user_id: UserId) -> Result<Vec<StepInstance>> {
        let sql = format!(
            "SELECT {STEP_INSTANCE_COLUMNS} FROM process_step_instances
             WHERE assigned_to = ?1 AND status IN ('pending', 'in_progress', 'for_recirculation')
             ORDER BY created_at ASC, step_instance_id ASC"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("failed to prepare inbox query")?;
        let rows = stmt
            .query_map(params![user_id.to_string()], parse_step_instance_row)
            .context("failed to query inbox")?;
        collect_rows(rows)
    }

    pub fn list_notifications(&self, user_id: UserId) -> Result<Vec<Notification>> {
        let sql = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM process_notifications
             WHERE user_id = ?1
             ORDER BY created_at ASC, notification_id ASC"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("failed to prepare notification query")?;
        let rows = stmt
            .query_map(params![user_id.to_string()], parse_notification_row)
            .context("failed to query notifications")?;
        collect_rows(rows)
    }

    pub fn list_document_history(
        &self,
        process_id: ProcessId,
    ) -> Result<Vec<DocumentHistoryEntry>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM document_history
             WHERE process_id = ?1
             ORDER BY created_at ASC, history_id ASC"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("failed to prepare document history query")?;
        let rows = stmt
            .query_map(params![process_id.to_string()], parse_history_row)
            .context("failed to query document history")?;
        collect_rows(rows)
    }
}

fn initiate(scope: &mut TxScope<'_>, request: &InitiateProcess) -> Result<ProcessId> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(WorkflowError::Validation("process name MUST be non-empty".to_string()).into());
    }
    ensure_user(scope.conn, request.initiator_id)?;
    let workflow = scope.load_workflow(request.workflow_id)?;
    if !workflow.is_active {
        return Err(WorkflowError::Validation(format!(
            "workflow {} version {} is not active",
            workflow.name, workflow.version
        ))
        .into());
    }
    let Some(first) = workflow.first_step() else {
        return Err(WorkflowError::Validation(format!(
            "workflow {} has no steps",
            workflow.workflow_id
        ))
        .into());
    };
    if first.requires_document && request.document_ids.is_empty() {
        return Err(WorkflowError::Validation(format!(
            "step `{}` requires at least one document",
            first.step_name
        ))
        .into());
    }
    let mut documents: Vec<DocumentId> = Vec::new();
    for document_id in &request.document_ids {
        load_document(scope.conn, *document_id)?;
        if !documents.contains(document_id) {
            documents.push(*document_id);
        }
    }

    let process_id = ProcessId::new();
    let now = scope.now_str()?;
    scope
        .conn
        .execute(
            "INSERT INTO process_instances(
                process_id, workflow_id, initiator_id, name, current_step_id,
                status, is_recirculated, created_at, completed_at
             ) VALUES (?1, ?2, ?3, ?4, NULL, ?5, 0, ?6, NULL)",
            params![
                process_id.to_string(),
                workflow.workflow_id.to_string(),
                request.initiator_id.to_string(),
                name,
                ProcessStatus::Pending.as_str(),
                now,
            ],
        )
        .context("failed to insert process")?;

    for document_id in &documents {
        scope
            .conn
            .execute(
                "INSERT INTO process_documents(
                    process_id, document_id, is_replacement, replaced_document_id,
                    added_by, created_at
                 ) VALUES (?1, ?2, 0, NULL, ?3, ?4)",
                params![
                    process_id.to_string(),
                    document_id.to_string(),
                    request.initiator_id.to_string(),
                    now,
                ],
            )
            .context("failed to attach process document")?;
        grant(
            scope,
            &GrantRequest {
                document_id: *document_id,
                subject: Subject::User(request.initiator_id),
                process_id: Some(process_id),
                assignment_id: None,
                step_instance_id: None,
                access_types: vec![AccessType::Read, AccessType::Edit, AccessType::Download],
                access_level: AccessLevel::Full,
            },
        )?;
    }

    scope
        .conn
        .execute(
            "UPDATE process_instances SET status = ?2, current_step_id = ?3 WHERE process_id = ?1",
            params![
                process_id.to_string(),
                ProcessStatus::InProgress.as_str(),
                first.step_id.to_string(),
            ],
        )
        .context("failed to start process")?;

    let process = scope.load_process(process_id)?;
    for assignment in &first.assignments {
        materialize(scope, &process, first, assignment, &documents)?;
    }
    let advance = check_and_advance(scope, process_id)?;

    info!(
        process_id = %process_id,
        workflow_id = %workflow.workflow_id,
        initiator_id = %request.initiator_id,
        documents = documents.len(),
        state = ?advance.state,
        "process initiated"
    );
    Ok(process_id)
}
