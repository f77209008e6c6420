//! Turns a workflow assignment into per-user step instances for one process.
//!
//! Hierarchical ROLE and DEPARTMENT assignments open one level at a time.
//! Levels whose roles have no members are skipped; an assignment with
//! nobody left to act is recorded as complete straight away.

use anyhow::{Context, Result};
use docflow_core::{
    resolve_role_hierarchy, AccessLevel, Assignment, AssignmentProgress, DepartmentId,
    DocumentId, NotificationType, ProcessInstance, ProgressId, RoleHierarchy, RoleId,
    StepInstance, StepInstanceId, StepStatus, Subject, UserId, WorkflowAssignmentRecord,
    WorkflowStepRecord,
};
use rusqlite::params;
use serde_json::json;
use tracing::{debug, info};

use crate::access::{grant, GrantRequest};
use crate::directory::{department_role_members, load_role_directory, role_members};
use crate::rows::{opt_ts, to_json, ts};
use crate::scope::TxScope;
use crate::SqliteProcessStore;

/// One person who must act, and the role slot they fill.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct Candidate {
    user_id: UserId,
    role_id: Option<RoleId>,
    department_id: Option<DepartmentId>,
}

impl SqliteProcessStore {
    /// Materializes `assignment_id` for a process whose current step owns it.
    /// Returns the existing progress when the assignment was already
    /// materialized.
    pub fn materialize_assignment(
        &mut self,
        process_id: docflow_core::ProcessId,
        assignment_id: docflow_core::AssignmentId,
    ) -> Result<AssignmentProgress> {
        self.write("materialize_assignment", |scope| {
            let process = scope.load_process(process_id)?;
            let workflow = scope.load_workflow(process.workflow_id)?;
            let assignment = scope.load_assignment(&workflow, assignment_id)?;
            let Some(step) = workflow.step(assignment.step_id) else {
                return Err(docflow_core::WorkflowError::not_found(
                    "workflow step",
                    assignment.step_id,
                )
                .into());
            };
            if process.current_step_id != Some(step.step_id) {
                return Err(docflow_core::WorkflowError::Validation(format!(
                    "assignment {assignment_id} does not belong to the current step \
                     of process {process_id}"
                ))
                .into());
            }
            let documents = scope.process_documents(process_id)?;
            materialize(scope, &process, step, &assignment, &documents)
        })
    }
}

/// Creates or fetches progress for `assignment` and opens its first level.
pub(crate) fn materialize(
    scope: &mut TxScope<'_>,
    process: &ProcessInstance,
    step: &WorkflowStepRecord,
    assignment: &WorkflowAssignmentRecord,
    document_ids: &[DocumentId],
) -> Result<AssignmentProgress> {
    if let Some(existing) = scope.find_progress(process.process_id, assignment.assignment_id)? {
        return Ok(existing);
    }
    assignment.assignment.validate()?;

    let hierarchy = match assignment.assignment.hierarchy() {
        Some(config) => {
            let directory = load_role_directory(scope.conn)?;
            Some(resolve_role_hierarchy(
                &directory,
                &assignment.assignment.selected_role_ids(),
                config,
            )?)
        }
        None => None,
    };

    let progress_id = ProgressId::new();
    scope
        .conn
        .execute(
            "INSERT INTO assignment_progress(
                progress_id, process_id, assignment_id, step_id,
                role_hierarchy_json, current_level, completed
             ) VALUES (?1, ?2, ?3, ?4, ?5, 0, 0)",
            params![
                progress_id.to_string(),
                process.process_id.to_string(),
                assignment.assignment_id.to_string(),
                step.step_id.to_string(),
                hierarchy.as_ref().map(to_json).transpose()?,
            ],
        )
        .context("failed to insert assignment progress")?;

    if let Assignment::Department { departments, .. } = &assignment.assignment {
        let mut required_roles = Vec::new();
        for role_id in assignment.assignment.selected_role_ids() {
            let mut staffed = false;
            for department in departments
                .iter()
                .filter(|entry| entry.role_ids.contains(&role_id))
            {
                if !department_role_members(scope.conn, department.department_id, role_id)?
                    .is_empty()
                {
                    staffed = true;
                    break;
                }
            }
            if staffed {
                required_roles.push(role_id);
            }
        }
        scope
            .conn
            .execute(
                "INSERT INTO department_step_progress(
                    progress_id, required_roles_json, completed_roles_json
                 ) VALUES (?1, ?2, '[]')",
                params![progress_id.to_string(), to_json(&required_roles)?],
            )
            .context("failed to insert department progress")?;
    }

    let progress = scope.load_progress(progress_id)?;
    open_level(scope, process, step, assignment, &progress, 0, document_ids)?;

    let progress = scope.load_progress(progress_id)?;
    info!(
        process_id = %process.process_id,
        step = step.step_number,
        assignment_id = %assignment.assignment_id,
        assignee_type = assignment.assignment.assignee_type().as_str(),
        levels = progress.role_hierarchy.as_ref().map_or(0, RoleHierarchy::len),
        completed = progress.completed,
        "assignment materialized"
    );
    Ok(progress)
}

/// Opens the first staffed level at or after `start_level`. When no level
/// has members the progress is completed at its last level.
pub(crate) fn open_level(
    scope: &mut TxScope<'_>,
    process: &ProcessInstance,
    step: &WorkflowStepRecord,
    assignment: &WorkflowAssignmentRecord,
    progress: &AssignmentProgress,
    start_level: u32,
    document_ids: &[DocumentId],
) -> Result<Vec<StepInstance>> {
    let hierarchical = assignment.assignment.is_hierarchical();
    let mut level = start_level;
    loop {
        let candidates =
            level_candidates(scope, assignment, progress.role_hierarchy.as_ref(), level)?;
        let exhausted = !hierarchical
            || progress
                .role_hierarchy
                .as_ref()
                .map_or(true, |hierarchy| hierarchy.is_last_level(level));

        if !candidates.is_empty() || exhausted {
            set_level(scope, progress.progress_id, level)?;
            if candidates.is_empty() {
                scope.mark_progress_completed(progress.progress_id)?;
                debug!(
                    progress_id = %progress.progress_id,
                    level,
                    "assignment has no members left and completes vacuously"
                );
                return Ok(Vec::new());
            }
            let mut created = Vec::with_capacity(candidates.len());
            for candidate in candidates {
                created.push(create_instance(
                    scope,
                    process,
                    step,
                    assignment,
                    progress.progress_id,
                    level,
                    candidate,
                    document_ids,
                )?);
            }
            return Ok(created);
        }

        debug!(
            progress_id = %progress.progress_id,
            level,
            "hierarchy level has no members, escalating"
        );
        level += 1;
    }
}

fn set_level(scope: &TxScope<'_>, progress_id: ProgressId, level: u32) -> Result<()> {
    scope
        .conn
        .execute(
            "UPDATE assignment_progress SET current_level = ?2 WHERE progress_id = ?1",
            params![progress_id.to_string(), i64::from(level)],
        )
        .context("failed to update assignment level")?;
    Ok(())
}

fn level_candidates(
    scope: &TxScope<'_>,
    assignment: &WorkflowAssignmentRecord,
    hierarchy: Option<&RoleHierarchy>,
    level: u32,
) -> Result<Vec<Candidate>> {
    let mut candidates: Vec<Candidate> = Vec::new();
    let mut push = |candidate: Candidate| {
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    };

    match &assignment.assignment {
        Assignment::User { user_ids } => {
            for user_id in user_ids {
                push(Candidate {
                    user_id: *user_id,
                    role_id: None,
                    department_id: None,
                });
            }
        }
        Assignment::Role { .. } => {
            let roles = hierarchy.and_then(|value| value.level(level)).unwrap_or(&[]);
            for role_id in roles {
                for user_id in role_members(scope.conn, *role_id)? {
                    push(Candidate {
                        user_id,
                        role_id: Some(*role_id),
                        department_id: None,
                    });
                }
            }
        }
        Assignment::Department { departments, .. } => {
            let roles = hierarchy.and_then(|value| value.level(level)).unwrap_or(&[]);
            for department in departments {
                for role_id in roles.iter().filter(|role| department.role_ids.contains(role)) {
                    for user_id in
                        department_role_members(scope.conn, department.department_id, *role_id)?
                    {
                        push(Candidate {
                            user_id,
                            role_id: Some(*role_id),
                            department_id: Some(department.department_id),
                        });
                    }
                }
            }
        }
    }
    Ok(candidates)
}

#[allow(clippy::too_many_arguments)]
fn create_instance(
    scope: &mut TxScope<'_>,
    process: &ProcessInstance,
    step: &WorkflowStepRecord,
    assignment: &WorkflowAssignmentRecord,
    progress_id: ProgressId,
    level: u32,
    candidate: Candidate,
    document_ids: &[DocumentId],
) -> Result<StepInstance> {
    let deadline = scope
        .config
        .step_deadline_hours
        .map(|hours| scope.deadline_after(hours))
        .transpose()?;
    let instance = StepInstance {
        step_instance_id: StepInstanceId::new(),
        process_id: process.process_id,
        step_id: step.step_id,
        assignment_id: Some(assignment.assignment_id),
        progress_id: Some(progress_id),
        assigned_to: candidate.user_id,
        role_id: candidate.role_id,
        department_id: candidate.department_id,
        level,
        status: StepStatus::Pending,
        picked_by_id: None,
        claimed_at: None,
        decision_at: None,
        deadline,
        recirculation_reason: None,
        recirculation_cycle: 0,
        is_recirculated: false,
        created_at: scope.now,
    };
    insert_instance(scope, &instance)?;

    for document_id in document_ids {
        grant(
            scope,
            &GrantRequest {
                document_id: *document_id,
                subject: Subject::User(candidate.user_id),
                process_id: Some(process.process_id),
                assignment_id: Some(assignment.assignment_id),
                step_instance_id: Some(instance.step_instance_id),
                access_types: assignment.access_types.clone(),
                access_level: AccessLevel::Standard,
            },
        )?;
    }

    scope.notify(
        process.process_id,
        Some(instance.step_instance_id),
        candidate.user_id,
        NotificationType::StepAssignment,
        json!({
            "process_name": process.name,
            "step_name": step.step_name,
            "step_number": step.step_number,
            "action_type": assignment.action_type.as_str(),
            "level": level,
        }),
    )?;

    Ok(instance)
}

pub(crate) fn insert_instance(scope: &TxScope<'_>, instance: &StepInstance) -> Result<()> {
    scope
        .conn
        .execute(
            "INSERT INTO process_step_instances(
                step_instance_id, process_id, step_id, assignment_id, progress_id,
                assigned_to, role_id, department_id, level, status,
                picked_by_id, claimed_at, decision_at, deadline, recirculation_reason,
                recirculation_cycle, is_recirculated, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                       ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                instance.step_instance_id.to_string(),
                instance.process_id.to_string(),
                instance.step_id.to_string(),
                instance.assignment_id.map(|id| id.to_string()),
                instance.progress_id.map(|id| id.to_string()),
                instance.assigned_to.to_string(),
                instance.role_id.map(|id| id.to_string()),
                instance.department_id.map(|id| id.to_string()),
                i64::from(instance.level),
                instance.status.as_str(),
                instance.picked_by_id.map(|id| id.to_string()),
                opt_ts(instance.claimed_at)?,
                opt_ts(instance.decision_at)?,
                opt_ts(instance.deadline)?,
                instance.recirculation_reason,
                i64::from(instance.recirculation_cycle),
                crate::rows::bool_to_sql(instance.is_recirculated),
                ts(instance.created_at)?,
            ],
        )
        .context("failed to insert step instance")?;
    Ok(())
}
