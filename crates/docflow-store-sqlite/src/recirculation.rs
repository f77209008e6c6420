//! Queries, delegation and recirculation.
//!
//! Raising a query parks the raiser's instance at FOR_RECIRCULATION and
//! sends the first step's engaged assignees back to PENDING. The process
//! cannot leave its current step while any query on it is open.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use docflow_core::{
    AccessLevel, AccessType, DocumentAction, DocumentId, HistoryId, NotificationType,
    ProcessId, ProcessInstance, ProcessQuery, ProcessStatus, QueryId, QueryStatus, StepInstance,
    StepInstanceId, StepStatus, Subject, UserId, WorkflowError,
};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::access::{grant, GrantRequest};
use crate::advance::{
    check_and_advance, evaluate_progress, return_to_pending, AdvanceReport, Trigger,
};
use crate::directory::{ensure_user, load_document};
use crate::materialize::insert_instance;
use crate::rows::{bool_to_sql, collect_rows, parse_query_row, to_json, QUERY_COLUMNS};
use crate::scope::TxScope;
use crate::SqliteProcessStore;

/// A document added to the process, optionally replacing one already linked.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DocumentChange {
    pub document_id: DocumentId,
    #[serde(default)]
    pub replaces_document_id: Option<DocumentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DocumentSummary {
    pub document_id: DocumentId,
    pub feedback: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Delegation {
    pub assignee_id: UserId,
    /// Step the delegate works at. Without it the delegate only answers the
    /// query and gets no step instance.
    #[serde(default)]
    pub step_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RaiseQuery {
    pub process_id: ProcessId,
    pub step_instance_id: StepInstanceId,
    pub actor_id: UserId,
    pub text: String,
    #[serde(default)]
    pub document_changes: Vec<DocumentChange>,
    #[serde(default)]
    pub document_summaries: Vec<DocumentSummary>,
    #[serde(default)]
    pub delegate: Option<Delegation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RaiseQueryOutcome {
    pub query: ProcessQuery,
    /// True when the call answered an open query instead of opening one.
    pub resolved: bool,
    pub instance: StepInstance,
    pub delegate_instance: Option<StepInstance>,
    /// First-step instances sent back to PENDING.
    pub reset: Vec<StepInstanceId>,
    pub advance: AdvanceReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolveQueryOutcome {
    pub query: ProcessQuery,
    pub advance: AdvanceReport,
}

impl SqliteProcessStore {
    pub fn raise_query(&mut self, request: &RaiseQuery) -> Result<RaiseQueryOutcome> {
        self.write("raise_query", |scope| raise_query(scope, request))
    }

    /// Answers an open query directly, without going through a step instance.
    pub fn resolve_query(
        &mut self,
        query_id: QueryId,
        actor_id: UserId,
        answer: &str,
        document_changes: &[DocumentChange],
    ) -> Result<ResolveQueryOutcome> {
        self.write("resolve_query", |scope| {
            let query = load_query(scope, query_id)?;
            if query.status != QueryStatus::Open {
                return Err(WorkflowError::Validation(format!(
                    "query {query_id} is already resolved"
                ))
                .into());
            }
            if actor_id != query.addressed_to && actor_id != query.raised_by {
                return Err(WorkflowError::Forbidden(format!(
                    "query {query_id} is not addressed to {actor_id}"
                ))
                .into());
            }
            let answer = required_text("answer", answer)?;
            let process = active_process(scope, query.process_id)?;

            record_document_changes(scope, &process, actor_id, None, document_changes, false)?;
            answer_query(scope, &query, actor_id, &answer)?;

            let advance = check_and_advance(scope, process.process_id)?;
            info!(
                process_id = %process.process_id,
                query_id = %query_id,
                actor_id = %actor_id,
                "query resolved"
            );
            Ok(ResolveQueryOutcome {
                query: load_query(scope, query_id)?,
                advance,
            })
        })
    }

    pub fn list_queries(&self, process_id: ProcessId) -> Result<Vec<ProcessQuery>> {
        let sql = format!(
            "SELECT {QUERY_COLUMNS} FROM process_queries
             WHERE process_id = ?1
             ORDER BY created_at ASC, query_id ASC"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("failed to prepare query list")?;
        let rows = stmt
            .query_map(params![process_id.to_string()], parse_query_row)
            .context("failed to list queries")?;
        collect_rows(rows)
    }
}

pub(crate) fn raise_query(
    scope: &mut TxScope<'_>,
    request: &RaiseQuery,
) -> Result<RaiseQueryOutcome> {
    let text = required_text("query text", &request.text)?;
    let instance = scope.load_instance(request.step_instance_id)?;
    if instance.process_id != request.process_id {
        return Err(WorkflowError::Validation(format!(
            "step instance {} does not belong to process {}",
            instance.step_instance_id, request.process_id
        ))
        .into());
    }
    if instance.status != StepStatus::InProgress || instance.assigned_to != request.actor_id {
        return Err(WorkflowError::InvalidStepOrAssignee(instance.step_instance_id).into());
    }
    let process = active_process(scope, request.process_id)?;
    let workflow = scope.load_workflow(process.workflow_id)?;

    let delegate_step = match &request.delegate {
        Some(delegation) => {
            ensure_user(scope.conn, delegation.assignee_id)?;
            match &delegation.step_name {
                Some(step_name) => Some(workflow.step_by_name(step_name).cloned().ok_or_else(
                    || WorkflowError::not_found("workflow step", step_name),
                )?),
                None => None,
            }
        }
        None => None,
    };

    let pending_answer = find_query_for(scope, process.process_id, request.actor_id)?;
    let resolving = pending_answer.is_some();

    let query = match pending_answer {
        Some(query) => {
            answer_query(scope, &query, request.actor_id, &text)?;
            load_query(scope, query.query_id)?
        }
        None => open_query(scope, &process, &instance, request, &text)?,
    };

    record_document_changes(
        scope,
        &process,
        request.actor_id,
        Some(&instance),
        &request.document_changes,
        !resolving,
    )?;
    for summary in &request.document_summaries {
        load_document(scope.conn, summary.document_id)?;
        insert_history(
            scope,
            process.process_id,
            summary.document_id,
            DocumentAction::Feedback,
            request.actor_id,
            None,
            false,
            Some(&summary.feedback),
        )?;
    }

    let approved = resolving && !request.document_changes.is_empty();
    if approved {
        scope
            .conn
            .execute(
                "UPDATE process_step_instances
                 SET status = 'approved', decision_at = ?2, is_recirculated = 1
                 WHERE step_instance_id = ?1",
                params![instance.step_instance_id.to_string(), scope.now_str()?],
            )
            .context("failed to approve resolving step instance")?;
        if let Some(progress_id) = instance.progress_id {
            evaluate_progress(scope, &process, &workflow, progress_id, Trigger::Decision)?;
        }
    } else {
        scope
            .conn
            .execute(
                "UPDATE process_step_instances
                 SET status = 'for_recirculation', recirculation_reason = ?2, is_recirculated = 1
                 WHERE step_instance_id = ?1",
                params![instance.step_instance_id.to_string(), text],
            )
            .context("failed to park step instance for recirculation")?;
        if let Some(progress_id) = instance.progress_id {
            scope.reopen_progress(progress_id)?;
        }
    }
    scope
        .conn
        .execute(
            "UPDATE process_instances SET is_recirculated = 1 WHERE process_id = ?1",
            params![process.process_id.to_string()],
        )
        .context("failed to flag process as recirculated")?;

    let delegate_instance = match (&request.delegate, delegate_step) {
        (Some(delegation), Some(step)) => Some(create_delegate_instance(
            scope,
            &process,
            &step,
            &instance,
            delegation.assignee_id,
            &query,
        )?),
        _ => None,
    };

    let reset = reset_first_step(scope, &process, &workflow, instance.step_instance_id, &text)?;
    let advance = check_and_advance(scope, process.process_id)?;

    info!(
        process_id = %process.process_id,
        query_id = %query.query_id,
        step_instance_id = %instance.step_instance_id,
        resolved = resolving,
        reset = reset.len(),
        delegated = delegate_instance.is_some(),
        "query raised"
    );

    Ok(RaiseQueryOutcome {
        query,
        resolved: resolving,
        instance: scope.load_instance(instance.step_instance_id)?,
        delegate_instance,
        reset,
        advance,
    })
}

fn required_text(what: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(WorkflowError::Validation(format!("{what} MUST be non-empty")).into());
    }
    Ok(trimmed.to_string())
}

fn active_process(scope: &TxScope<'_>, process_id: ProcessId) -> Result<ProcessInstance> {
    let process = scope.load_process(process_id)?;
    if process.status != ProcessStatus::InProgress {
        return Err(WorkflowError::Validation(format!(
            "process {process_id} is {}",
            process.status.as_str()
        ))
        .into());
    }
    Ok(process)
}

fn load_query(scope: &TxScope<'_>, query_id: QueryId) -> Result<ProcessQuery> {
    let sql = format!("SELECT {QUERY_COLUMNS} FROM process_queries WHERE query_id = ?1");
    scope
        .conn
        .query_row(&sql, params![query_id.to_string()], parse_query_row)
        .optional()
        .context("failed to load query")?
        .ok_or_else(|| WorkflowError::not_found("query", query_id).into())
}

/// Oldest open query someone else addressed to `actor_id` in the process.
fn find_query_for(
    scope: &TxScope<'_>,
    process_id: ProcessId,
    actor_id: UserId,
) -> Result<Option<ProcessQuery>> {
    let sql = format!(
        "SELECT {QUERY_COLUMNS} FROM process_queries
         WHERE process_id = ?1 AND addressed_to = ?2 AND raised_by != ?2 AND status = 'open'
         ORDER BY created_at ASC, query_id ASC
         LIMIT 1"
    );
    scope
        .conn
        .query_row(
            &sql,
            params![process_id.to_string(), actor_id.to_string()],
            parse_query_row,
        )
        .optional()
        .context("failed to find open query")
}

fn open_query(
    scope: &mut TxScope<'_>,
    process: &ProcessInstance,
    instance: &StepInstance,
    request: &RaiseQuery,
    text: &str,
) -> Result<ProcessQuery> {
    let addressed_to = request
        .delegate
        .as_ref()
        .map_or(request.actor_id, |delegation| delegation.assignee_id);
    let query = ProcessQuery {
        query_id: QueryId::new(),
        process_id: process.process_id,
        step_instance_id: instance.step_instance_id,
        raised_by: request.actor_id,
        addressed_to,
        question: text.to_string(),
        answer: None,
        status: QueryStatus::Open,
        delegated_step_name: request
            .delegate
            .as_ref()
            .and_then(|delegation| delegation.step_name.clone()),
        details: json!({
            "document_changes": request.document_changes,
            "document_summaries": request.document_summaries,
        }),
        created_at: scope.now,
        answered_at: None,
    };
    scope
        .conn
        .execute(
            "INSERT INTO process_queries(
                query_id, process_id, step_instance_id, raised_by, addressed_to, question,
                answer, status, delegated_step_name, details_json, created_at, answered_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, 'open', ?7, ?8, ?9, NULL)",
            params![
                query.query_id.to_string(),
                query.process_id.to_string(),
                query.step_instance_id.to_string(),
                query.raised_by.to_string(),
                query.addressed_to.to_string(),
                query.question,
                query.delegated_step_name,
                to_json(&query.details)?,
                scope.now_str()?,
            ],
        )
        .context("failed to insert query")?;

    if addressed_to != request.actor_id {
        scope.notify(
            process.process_id,
            Some(instance.step_instance_id),
            addressed_to,
            NotificationType::DocumentQuery,
            json!({
                "process_name": process.name,
                "query_id": query.query_id.to_string(),
                "question": query.question,
                "raised_by": request.actor_id.to_string(),
            }),
        )?;
    }
    Ok(query)
}

fn answer_query(
    scope: &mut TxScope<'_>,
    query: &ProcessQuery,
    actor_id: UserId,
    answer: &str,
) -> Result<()> {
    scope
        .conn
        .execute(
            "UPDATE process_queries SET status = 'resolved', answer = ?2, answered_at = ?3
             WHERE query_id = ?1 AND status = 'open'",
            params![query.query_id.to_string(), answer, scope.now_str()?],
        )
        .context("failed to resolve query")?;
    if query.raised_by != actor_id {
        scope.notify(
            query.process_id,
            Some(query.step_instance_id),
            query.raised_by,
            NotificationType::QueryResolved,
            json!({
                "query_id": query.query_id.to_string(),
                "answer": answer,
                "answered_by": actor_id.to_string(),
            }),
        )?;
    }
    Ok(())
}

fn record_document_changes(
    scope: &TxScope<'_>,
    process: &ProcessInstance,
    actor_id: UserId,
    instance: Option<&StepInstance>,
    changes: &[DocumentChange],
    triggers_recirculation: bool,
) -> Result<()> {
    let linked: BTreeSet<DocumentId> = scope
        .process_documents(process.process_id)?
        .into_iter()
        .collect();
    for change in changes {
        load_document(scope.conn, change.document_id)?;
        if let Some(replaced) = change.replaces_document_id {
            if !linked.contains(&replaced) {
                return Err(WorkflowError::Validation(format!(
                    "document {replaced} is not attached to process {}",
                    process.process_id
                ))
                .into());
            }
        }

        scope
            .conn
            .execute(
                "INSERT OR IGNORE INTO process_documents(
                    process_id, document_id, is_replacement, replaced_document_id,
                    added_by, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    process.process_id.to_string(),
                    change.document_id.to_string(),
                    bool_to_sql(change.replaces_document_id.is_some()),
                    change.replaces_document_id.map(|id| id.to_string()),
                    actor_id.to_string(),
                    scope.now_str()?,
                ],
            )
            .context("failed to attach document to process")?;

        let action = if change.replaces_document_id.is_some() {
            DocumentAction::Replaced
        } else {
            DocumentAction::Uploaded
        };
        insert_history(
            scope,
            process.process_id,
            change.document_id,
            action,
            actor_id,
            change.replaces_document_id,
            triggers_recirculation,
            None,
        )?;

        grant(
            scope,
            &GrantRequest {
                document_id: change.document_id,
                subject: Subject::User(actor_id),
                process_id: Some(process.process_id),
                assignment_id: instance.and_then(|value| value.assignment_id),
                step_instance_id: instance.map(|value| value.step_instance_id),
                access_types: vec![AccessType::Read, AccessType::Edit],
                access_level: AccessLevel::Standard,
            },
        )?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn insert_history(
    scope: &TxScope<'_>,
    process_id: ProcessId,
    document_id: DocumentId,
    action: DocumentAction,
    actor_id: UserId,
    replaced_document_id: Option<DocumentId>,
    is_recirculation_trigger: bool,
    note: Option<&str>,
) -> Result<()> {
    scope
        .conn
        .execute(
            "INSERT INTO document_history(
                history_id, process_id, document_id, action, actor_id,
                replaced_document_id, is_recirculation_trigger, note, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                HistoryId::new().to_string(),
                process_id.to_string(),
                document_id.to_string(),
                action.as_str(),
                actor_id.to_string(),
                replaced_document_id.map(|id| id.to_string()),
                bool_to_sql(is_recirculation_trigger),
                note,
                scope.now_str()?,
            ],
        )
        .context("failed to insert document history")?;
    Ok(())
}

fn create_delegate_instance(
    scope: &mut TxScope<'_>,
    process: &ProcessInstance,
    step: &docflow_core::WorkflowStepRecord,
    raising: &StepInstance,
    assignee_id: UserId,
    query: &ProcessQuery,
) -> Result<StepInstance> {
    let deadline = scope.deadline_after(scope.config.delegate_deadline_hours)?;
    let instance = StepInstance {
        step_instance_id: StepInstanceId::new(),
        process_id: process.process_id,
        step_id: step.step_id,
        assignment_id: None,
        progress_id: None,
        assigned_to: assignee_id,
        role_id: None,
        department_id: None,
        level: 0,
        status: StepStatus::Pending,
        picked_by_id: None,
        claimed_at: None,
        decision_at: None,
        deadline: Some(deadline),
        recirculation_reason: Some(query.question.clone()),
        recirculation_cycle: 0,
        is_recirculated: true,
        created_at: scope.now,
    };
    insert_instance(scope, &instance)?;

    for document_id in scope.process_documents(process.process_id)? {
        grant(
            scope,
            &GrantRequest {
                document_id,
                subject: Subject::User(assignee_id),
                process_id: Some(process.process_id),
                assignment_id: None,
                step_instance_id: Some(instance.step_instance_id),
                access_types: vec![AccessType::Read, AccessType::Edit],
                access_level: AccessLevel::Standard,
            },
        )?;
    }

    scope.notify(
        process.process_id,
        Some(instance.step_instance_id),
        assignee_id,
        NotificationType::DocumentQuery,
        json!({
            "process_name": process.name,
            "query_id": query.query_id.to_string(),
            "step_name": step.step_name,
            "delegated_by": raising.assigned_to.to_string(),
        }),
    )?;
    Ok(instance)
}

/// Sends every first-step instance someone already claimed or decided back
/// to PENDING, except the one raising the query.
fn reset_first_step(
    scope: &mut TxScope<'_>,
    process: &ProcessInstance,
    workflow: &docflow_core::WorkflowRecord,
    raising: StepInstanceId,
    reason: &str,
) -> Result<Vec<StepInstanceId>> {
    let Some(first) = workflow.first_step() else {
        return Ok(Vec::new());
    };
    let engaged: Vec<StepInstance> = scope
        .instances_for_step(process.process_id, first.step_id)?
        .into_iter()
        .filter(|instance| {
            instance.step_instance_id != raising
                && matches!(
                    instance.status,
                    StepStatus::InProgress | StepStatus::Approved
                )
        })
        .collect();
    for instance in &engaged {
        return_to_pending(scope, process, instance, Some(reason), true)?;
    }
    Ok(engaged
        .iter()
        .map(|instance| instance.step_instance_id)
        .collect())
}
