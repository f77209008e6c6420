//! Assignment completion, hierarchy escalation and step advancement.

use anyhow::{Context, Result};
use docflow_core::{
    Assignment, DepartmentStepProgress, NotificationStatus, NotificationType, ProcessId,
    ProcessInstance, ProcessStatus, ProgressId, StepInstance, StepInstanceId, StepStatus, UserId,
    WorkflowAssignmentRecord, WorkflowError, WorkflowRecord, WorkflowStepRecord,
};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::materialize::{materialize, open_level};
use crate::scope::TxScope;
use crate::SqliteProcessStore;

/// What caused a progress re-evaluation. Hierarchical assignments only
/// escalate after a decision, never after a bare claim.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum Trigger {
    Claim,
    Decision,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AdvanceState {
    /// The process has not started.
    Inactive,
    /// Some visited step still has open work.
    Waiting { step_number: u32 },
    /// Every visited step is done but a query is still open.
    BlockedByQuery { step_number: u32, open_queries: usize },
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AdvanceReport {
    pub state: AdvanceState,
    /// Step numbers entered during this evaluation, in order.
    pub advanced_to: Vec<u32>,
    /// Parked instances returned to PENDING during this evaluation.
    pub resumed: Vec<StepInstanceId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionOutcome {
    pub instance: StepInstance,
    pub progress_completed: bool,
    pub advance: AdvanceReport,
}

impl SqliteProcessStore {
    pub fn check_and_advance(&mut self, process_id: ProcessId) -> Result<AdvanceReport> {
        self.write("check_and_advance", |scope| {
            scope.load_process(process_id)?;
            check_and_advance(scope, process_id)
        })
    }

    pub fn complete_step(
        &mut self,
        step_instance_id: StepInstanceId,
        actor_id: UserId,
    ) -> Result<CompletionOutcome> {
        self.write("complete_step", |scope| {
            complete_step(scope, step_instance_id, actor_id)
        })
    }

    /// Skips the current level of a hierarchical assignment: unclaimed
    /// instances at the level are withdrawn and the next staffed level opens.
    pub fn escalate_assignment(
        &mut self,
        progress_id: ProgressId,
    ) -> Result<docflow_core::AssignmentProgress> {
        self.write("escalate_assignment", |scope| {
            let progress = scope.load_progress(progress_id)?;
            if progress.completed {
                return Err(WorkflowError::Validation(format!(
                    "assignment progress {progress_id} is already completed"
                ))
                .into());
            }
            let process = scope.load_process(progress.process_id)?;
            if process.status != ProcessStatus::InProgress {
                return Err(WorkflowError::Validation(format!(
                    "process {} is {}",
                    process.process_id,
                    process.status.as_str()
                ))
                .into());
            }
            let workflow = scope.load_workflow(process.workflow_id)?;
            let assignment = scope.load_assignment(&workflow, progress.assignment_id)?;
            if !assignment.assignment.is_hierarchical() {
                return Err(WorkflowError::Validation(format!(
                    "assignment {} has no hierarchy to escalate",
                    assignment.assignment_id
                ))
                .into());
            }
            let busy = scope
                .instances_for_progress(progress_id)?
                .iter()
                .any(|instance| {
                    instance.level == progress.current_level
                        && instance.status == StepStatus::InProgress
                });
            if busy {
                return Err(WorkflowError::Validation(format!(
                    "level {} of assignment progress {progress_id} has claimed work in progress",
                    progress.current_level
                ))
                .into());
            }
            let step = workflow_step(&workflow, progress.step_id)?;

            advance_level(scope, &process, step, &assignment, &progress)?;
            check_and_advance(scope, process.process_id)?;
            scope.load_progress(progress_id)
        })
    }
}

fn workflow_step(
    workflow: &WorkflowRecord,
    step_id: docflow_core::WorkflowStepId,
) -> Result<&WorkflowStepRecord> {
    workflow
        .step(step_id)
        .ok_or_else(|| WorkflowError::not_found("workflow step", step_id).into())
}

pub(crate) fn complete_step(
    scope: &mut TxScope<'_>,
    step_instance_id: StepInstanceId,
    actor_id: UserId,
) -> Result<CompletionOutcome> {
    let instance = scope.load_instance(step_instance_id)?;
    if instance.status == StepStatus::ForRecirculation && instance.assigned_to == actor_id {
        return Err(WorkflowError::RecirculationPending(step_instance_id).into());
    }
    if instance.status != StepStatus::InProgress || instance.assigned_to != actor_id {
        return Err(WorkflowError::InvalidStepOrAssignee(step_instance_id).into());
    }

    let decided = scope
        .conn
        .execute(
            "UPDATE process_step_instances SET status = 'approved', decision_at = ?3
             WHERE step_instance_id = ?1 AND status = 'in_progress' AND assigned_to = ?2",
            params![
                step_instance_id.to_string(),
                actor_id.to_string(),
                scope.now_str()?,
            ],
        )
        .context("failed to approve step instance")?;
    if decided == 0 {
        return Err(WorkflowError::InvalidStepOrAssignee(step_instance_id).into());
    }
    scope.set_notification_status(step_instance_id, NotificationStatus::Completed)?;

    let process = scope.load_process(instance.process_id)?;
    let workflow = scope.load_workflow(process.workflow_id)?;
    let step = workflow_step(&workflow, instance.step_id)?;
    if process.initiator_id != actor_id {
        scope.notify(
            process.process_id,
            Some(step_instance_id),
            process.initiator_id,
            NotificationType::StepCompleted,
            json!({
                "process_name": process.name,
                "step_name": step.step_name,
                "step_number": step.step_number,
                "decided_by": actor_id.to_string(),
            }),
        )?;
    }

    let progress_completed = match instance.progress_id {
        Some(progress_id) => {
            evaluate_progress(scope, &process, &workflow, progress_id, Trigger::Decision)?
        }
        None => false,
    };
    let advance = check_and_advance(scope, process.process_id)?;

    info!(
        process_id = %process.process_id,
        step_instance_id = %step_instance_id,
        actor_id = %actor_id,
        progress_completed,
        "step instance approved"
    );

    Ok(CompletionOutcome {
        instance: scope.load_instance(step_instance_id)?,
        progress_completed,
        advance,
    })
}

/// Re-evaluates one assignment's progress and reports whether it is now
/// complete.
///
/// USER assignments finish when nobody assigned still has open work.
/// Parallel ROLE assignments finish once every role slot is claimed, and
/// parallel DEPARTMENT assignments once every staffed role has claimed.
/// Hierarchical assignments escalate after the current level's last
/// decision and finish after the last level.
pub(crate) fn evaluate_progress(
    scope: &mut TxScope<'_>,
    process: &ProcessInstance,
    workflow: &WorkflowRecord,
    progress_id: ProgressId,
    trigger: Trigger,
) -> Result<bool> {
    let progress = scope.load_progress(progress_id)?;
    if progress.completed {
        return Ok(true);
    }
    let assignment = scope.load_assignment(workflow, progress.assignment_id)?;
    let step = workflow_step(workflow, progress.step_id)?;
    let instances = scope.instances_for_progress(progress_id)?;
    let pending = instances
        .iter()
        .filter(|instance| instance.status == StepStatus::Pending)
        .count();
    let open = instances
        .iter()
        .filter(|instance| instance.status.is_open())
        .count();
    let hierarchical = assignment.assignment.is_hierarchical();

    let complete = match &assignment.assignment {
        Assignment::User { .. } => open == 0,
        Assignment::Role { .. } if !hierarchical => pending == 0,
        Assignment::Department { .. } if !hierarchical => progress
            .department
            .as_ref()
            .map_or(true, DepartmentStepProgress::is_satisfied),
        _ => {
            let last = progress
                .role_hierarchy
                .as_ref()
                .map_or(true, |hierarchy| hierarchy.is_last_level(progress.current_level));
            match trigger {
                Trigger::Claim => {
                    matches!(assignment.assignment, Assignment::Role { .. }) && last && pending == 0
                }
                Trigger::Decision if open > 0 => false,
                Trigger::Decision if last => true,
                Trigger::Decision => {
                    advance_level(scope, process, step, &assignment, &progress)?;
                    return Ok(scope.load_progress(progress_id)?.completed);
                }
            }
        }
    };

    if complete {
        scope.mark_progress_completed(progress_id)?;
        debug!(
            process_id = %process.process_id,
            progress_id = %progress_id,
            "assignment progress completed"
        );
    }
    Ok(complete)
}

/// Withdraws unclaimed work at the current level and opens the next one,
/// completing the progress when the hierarchy is exhausted.
pub(crate) fn advance_level(
    scope: &mut TxScope<'_>,
    process: &ProcessInstance,
    step: &WorkflowStepRecord,
    assignment: &WorkflowAssignmentRecord,
    progress: &docflow_core::AssignmentProgress,
) -> Result<()> {
    let stale: Vec<StepInstance> = scope
        .instances_for_progress(progress.progress_id)?
        .into_iter()
        .filter(|instance| {
            instance.level == progress.current_level && instance.status == StepStatus::Pending
        })
        .collect();
    scope.supersede_instances(&stale, None)?;

    let last = progress
        .role_hierarchy
        .as_ref()
        .map_or(true, |hierarchy| hierarchy.is_last_level(progress.current_level));
    if last {
        scope.mark_progress_completed(progress.progress_id)?;
        return Ok(());
    }

    let documents = scope.process_documents(process.process_id)?;
    let opened = open_level(
        scope,
        process,
        step,
        assignment,
        progress,
        progress.current_level + 1,
        &documents,
    )?;
    info!(
        process_id = %process.process_id,
        progress_id = %progress.progress_id,
        from_level = progress.current_level,
        instances = opened.len(),
        "hierarchy level advanced"
    );
    Ok(())
}

fn step_complete(
    scope: &TxScope<'_>,
    process_id: ProcessId,
    step: &WorkflowStepRecord,
) -> Result<bool> {
    let progress = scope.progress_for_step(process_id, step.step_id)?;
    if progress.iter().any(|entry| !entry.completed) {
        return Ok(false);
    }
    let open = scope
        .instances_for_step(process_id, step.step_id)?
        .iter()
        .any(|instance| instance.status.is_open());
    Ok(!open)
}

/// Moves an instance back to PENDING and reopens the progress it counts
/// toward. The assignee is notified with STEP_ASSIGNED.
pub(crate) fn return_to_pending(
    scope: &mut TxScope<'_>,
    process: &ProcessInstance,
    instance: &StepInstance,
    reason: Option<&str>,
    new_cycle: bool,
) -> Result<()> {
    scope
        .conn
        .execute(
            "UPDATE process_step_instances
             SET status = 'pending', picked_by_id = NULL, claimed_at = NULL, decision_at = NULL,
                 recirculation_reason = ?2, is_recirculated = 1,
                 recirculation_cycle = recirculation_cycle + ?3
             WHERE step_instance_id = ?1",
            params![
                instance.step_instance_id.to_string(),
                reason,
                i64::from(new_cycle),
            ],
        )
        .context("failed to return step instance to pending")?;

    if let Some(progress_id) = instance.progress_id {
        scope.reopen_progress(progress_id)?;
        let progress = scope.load_progress(progress_id)?;
        if let (Some(mut department), Some(role_id)) = (progress.department, instance.role_id) {
            let before = department.completed_roles.len();
            department.completed_roles.retain(|role| *role != role_id);
            if department.completed_roles.len() != before {
                scope.save_completed_roles(progress_id, &department.completed_roles)?;
            }
        }
    }

    scope.notify(
        process.process_id,
        Some(instance.step_instance_id),
        instance.assigned_to,
        NotificationType::StepAssigned,
        json!({
            "process_name": process.name,
            "reason": reason,
            "recirculated": true,
        }),
    )?;
    Ok(())
}

fn resume_parked(
    scope: &mut TxScope<'_>,
    process: &ProcessInstance,
    step: &WorkflowStepRecord,
) -> Result<Vec<StepInstanceId>> {
    let parked: Vec<StepInstance> = scope
        .instances_for_step(process.process_id, step.step_id)?
        .into_iter()
        .filter(|instance| instance.status == StepStatus::ForRecirculation)
        .collect();
    for instance in &parked {
        return_to_pending(scope, process, instance, None, false)?;
    }
    Ok(parked
        .iter()
        .map(|instance| instance.step_instance_id)
        .collect())
}

/// Advances the process as far as its state allows.
///
/// Visited steps are re-checked in order so work reopened by a query is
/// finished before the process moves on. Parked instances resume once no
/// query is open and every earlier step is done. `current_step_id` only
/// ever moves forward.
pub(crate) fn check_and_advance(
    scope: &mut TxScope<'_>,
    process_id: ProcessId,
) -> Result<AdvanceReport> {
    let mut advanced_to = Vec::new();
    let mut resumed = Vec::new();

    loop {
        let process = scope.load_process(process_id)?;
        let current_step_id = match (process.status, process.current_step_id) {
            (ProcessStatus::InProgress, Some(step_id)) => step_id,
            (ProcessStatus::Completed, _) => {
                return Ok(AdvanceReport {
                    state: AdvanceState::Completed,
                    advanced_to,
                    resumed,
                });
            }
            _ => {
                return Ok(AdvanceReport {
                    state: AdvanceState::Inactive,
                    advanced_to,
                    resumed,
                });
            }
        };
        let workflow = scope.load_workflow(process.workflow_id)?;
        let current_number = workflow_step(&workflow, current_step_id)?.step_number;
        let open_queries = scope.open_query_count(process_id)?;

        for step in workflow
            .steps
            .iter()
            .filter(|step| step.step_number <= current_number)
        {
            if open_queries == 0 {
                resumed.extend(resume_parked(scope, &process, step)?);
            }
            if !step_complete(scope, process_id, step)? {
                return Ok(AdvanceReport {
                    state: AdvanceState::Waiting {
                        step_number: step.step_number,
                    },
                    advanced_to,
                    resumed,
                });
            }
        }

        if open_queries > 0 {
            debug!(process_id = %process_id, open_queries, "advancement blocked by open query");
            return Ok(AdvanceReport {
                state: AdvanceState::BlockedByQuery {
                    step_number: current_number,
                    open_queries,
                },
                advanced_to,
                resumed,
            });
        }

        let Some(next) = workflow.next_step(current_number) else {
            scope
                .conn
                .execute(
                    "UPDATE process_instances
                     SET status = 'completed', current_step_id = NULL, completed_at = ?2
                     WHERE process_id = ?1",
                    params![process_id.to_string(), scope.now_str()?],
                )
                .context("failed to complete process")?;
            scope.notify(
                process_id,
                None,
                process.initiator_id,
                NotificationType::StepCompleted,
                json!({ "process_name": process.name, "process_completed": true }),
            )?;
            info!(process_id = %process_id, "process completed");
            return Ok(AdvanceReport {
                state: AdvanceState::Completed,
                advanced_to,
                resumed,
            });
        };

        resumed.extend(resume_parked(scope, &process, next)?);
        scope
            .conn
            .execute(
                "UPDATE process_instances SET current_step_id = ?2 WHERE process_id = ?1",
                params![process_id.to_string(), next.step_id.to_string()],
            )
            .context("failed to advance process step")?;

        let process = scope.load_process(process_id)?;
        let documents = scope.process_documents(process_id)?;
        for assignment in &next.assignments {
            materialize(scope, &process, next, assignment, &documents)?;
        }
        advanced_to.push(next.step_number);
        info!(
            process_id = %process_id,
            from_step = current_number,
            to_step = next.step_number,
            "process advanced"
        );
    }
}
