//! Claiming a pending step instance.
//!
//! The guarded `UPDATE ... WHERE status = 'pending'` is the only
//! compare-and-set point. Whoever changes the row wins; every other caller
//! sees zero affected rows and gets `already_claimed`. Instances parked by a
//! query answer `recirculation_pending` until the query is settled.

use anyhow::{Context, Result};
use docflow_core::{
    Assignment, NotificationStatus, ProcessStatus, StepInstance, StepInstanceId, StepStatus,
    UserId, WorkflowError,
};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::advance::{check_and_advance, evaluate_progress, AdvanceReport, Trigger};
use crate::scope::TxScope;
use crate::SqliteProcessStore;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaimOutcome {
    pub instance: StepInstance,
    /// Sibling instances removed because this claim took their role slot.
    pub superseded: Vec<StepInstanceId>,
    pub progress_completed: bool,
    pub advance: AdvanceReport,
}

impl SqliteProcessStore {
    pub fn claim_step(
        &mut self,
        step_instance_id: StepInstanceId,
        actor_id: UserId,
    ) -> Result<ClaimOutcome> {
        self.write("claim_step", |scope| claim(scope, step_instance_id, actor_id))
    }
}

pub(crate) fn claim(
    scope: &mut TxScope<'_>,
    step_instance_id: StepInstanceId,
    actor_id: UserId,
) -> Result<ClaimOutcome> {
    let Some(instance) = scope.find_instance(step_instance_id)? else {
        if scope.is_superseded(step_instance_id)? {
            return Err(WorkflowError::AlreadyClaimed(step_instance_id).into());
        }
        return Err(WorkflowError::not_found("step instance", step_instance_id).into());
    };
    if instance.assigned_to != actor_id {
        return Err(WorkflowError::Forbidden(format!(
            "step instance {step_instance_id} is assigned to another user"
        ))
        .into());
    }
    if instance.status == StepStatus::ForRecirculation {
        return Err(WorkflowError::RecirculationPending(step_instance_id).into());
    }
    let process = scope.load_process(instance.process_id)?;
    if process.status != ProcessStatus::InProgress {
        return Err(WorkflowError::Validation(format!(
            "process {} is {}",
            process.process_id,
            process.status.as_str()
        ))
        .into());
    }

    let claimed = scope
        .conn
        .execute(
            "UPDATE process_step_instances
             SET status = 'in_progress', picked_by_id = ?2, claimed_at = ?3
             WHERE step_instance_id = ?1 AND status = 'pending' AND assigned_to = ?2",
            params![
                step_instance_id.to_string(),
                actor_id.to_string(),
                scope.now_str()?,
            ],
        )
        .context("failed to claim step instance")?;
    if claimed == 0 {
        return Err(WorkflowError::AlreadyClaimed(step_instance_id).into());
    }
    scope.set_notification_status(step_instance_id, NotificationStatus::Claimed)?;

    let mut superseded = Vec::new();
    let mut progress_completed = false;
    if let (Some(progress_id), Some(assignment_id)) = (instance.progress_id, instance.assignment_id)
    {
        let workflow = scope.load_workflow(process.workflow_id)?;
        let assignment = scope.load_assignment(&workflow, assignment_id)?;

        if let (Assignment::Role { .. } | Assignment::Department { .. }, Some(role_id)) =
            (&assignment.assignment, instance.role_id)
        {
            let siblings: Vec<StepInstance> = scope
                .instances_for_progress(progress_id)?
                .into_iter()
                .filter(|sibling| {
                    sibling.step_instance_id != step_instance_id
                        && sibling.status == StepStatus::Pending
                        && sibling.role_id == Some(role_id)
                        && sibling.department_id == instance.department_id
                        && sibling.step_id == instance.step_id
                })
                .collect();
            scope.supersede_instances(&siblings, Some(step_instance_id))?;
            superseded = siblings
                .iter()
                .map(|sibling| sibling.step_instance_id)
                .collect();

            if matches!(assignment.assignment, Assignment::Department { .. })
                && !assignment.assignment.is_hierarchical()
            {
                let progress = scope.load_progress(progress_id)?;
                if let Some(mut department) = progress.department {
                    if !department.completed_roles.contains(&role_id) {
                        department.completed_roles.push(role_id);
                        department.completed_roles.sort();
                        scope.save_completed_roles(progress_id, &department.completed_roles)?;
                    }
                }
            }
        }

        progress_completed =
            evaluate_progress(scope, &process, &workflow, progress_id, Trigger::Claim)?;
    }

    let advance = check_and_advance(scope, process.process_id)?;
    let instance = scope.load_instance(step_instance_id)?;

    info!(
        process_id = %process.process_id,
        step_instance_id = %step_instance_id,
        actor_id = %actor_id,
        superseded = superseded.len(),
        progress_completed,
        "step instance claimed"
    );

    Ok(ClaimOutcome {
        instance,
        superseded,
        progress_completed,
        advance,
    })
}
