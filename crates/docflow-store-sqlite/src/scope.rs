//! Per-transaction working set: the connection, the clock reading every write
//! in the transaction shares, and the notifications waiting for commit.

use anyhow::{Context, Result};
use docflow_core::{
    AssignmentId, AssignmentProgress, DocumentId, EngineConfig, Notification, NotificationId,
    NotificationStatus, NotificationType, ProcessId, ProcessInstance, ProgressId, StepInstance,
    StepInstanceId, UserId, WorkflowAssignmentRecord, WorkflowError, WorkflowId, WorkflowRecord,
    WorkflowStepId,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::rows::{
    collect_rows, parse_process_row, parse_progress_row, parse_step_instance_row, to_json, ts,
    ulid_at, PROCESS_COLUMNS, PROGRESS_SELECT, STEP_INSTANCE_COLUMNS,
};

pub(crate) struct TxScope<'a> {
    pub(crate) conn: &'a Connection,
    pub(crate) config: &'a EngineConfig,
    pub(crate) now: OffsetDateTime,
    notifications: Vec<Notification>,
}

impl<'a> TxScope<'a> {
    pub(crate) fn new(conn: &'a Connection, config: &'a EngineConfig) -> Self {
        Self {
            conn,
            config,
            now: docflow_core::now_utc(),
            notifications: Vec::new(),
        }
    }

    pub(crate) fn into_notifications(self) -> Vec<Notification> {
        self.notifications
    }

    pub(crate) fn now_str(&self) -> Result<String> {
        ts(self.now)
    }

    /// `now` shifted by `hours`, or a configuration error when the result
    /// falls outside the representable calendar.
    pub(crate) fn deadline_after(&self, hours: i64) -> Result<OffsetDateTime> {
        hours
            .checked_mul(3_600)
            .map(Duration::seconds)
            .and_then(|span| self.now.checked_add(span))
            .ok_or_else(|| {
                anyhow::Error::from(WorkflowError::Configuration(format!(
                    "deadline of {hours} hours is out of range"
                )))
            })
    }

    pub(crate) fn notify(
        &mut self,
        process_id: ProcessId,
        step_instance_id: Option<StepInstanceId>,
        user_id: UserId,
        notification_type: NotificationType,
        metadata: Value,
    ) -> Result<()> {
        let notification = Notification {
            notification_id: NotificationId::new(),
            process_id,
            step_instance_id,
            user_id,
            notification_type,
            status: NotificationStatus::Active,
            metadata,
            created_at: self.now,
        };

        self.conn
            .execute(
                "INSERT INTO process_notifications(
                    notification_id, process_id, step_instance_id, user_id,
                    notification_type, status, metadata_json, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    notification.notification_id.to_string(),
                    notification.process_id.to_string(),
                    notification.step_instance_id.map(|id| id.to_string()),
                    notification.user_id.to_string(),
                    notification.notification_type.as_str(),
                    notification.status.as_str(),
                    to_json(&notification.metadata)?,
                    ts(notification.created_at)?,
                ],
            )
            .context("failed to insert notification")?;

        self.notifications.push(notification);
        Ok(())
    }

    /// Moves every notification tied to `step_instance_id` to `status`.
    pub(crate) fn set_notification_status(
        &self,
        step_instance_id: StepInstanceId,
        status: NotificationStatus,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE process_notifications SET status = ?2 WHERE step_instance_id = ?1",
                params![step_instance_id.to_string(), status.as_str()],
            )
            .context("failed to update notification status")?;
        Ok(())
    }

    pub(crate) fn load_process(&self, process_id: ProcessId) -> Result<ProcessInstance> {
        let sql = format!("SELECT {PROCESS_COLUMNS} FROM process_instances WHERE process_id = ?1");
        self.conn
            .query_row(&sql, params![process_id.to_string()], parse_process_row)
            .optional()
            .context("failed to load process")?
            .ok_or_else(|| WorkflowError::not_found("process", process_id).into())
    }

    pub(crate) fn find_instance(
        &self,
        step_instance_id: StepInstanceId,
    ) -> Result<Option<StepInstance>> {
        let sql = format!(
            "SELECT {STEP_INSTANCE_COLUMNS} FROM process_step_instances WHERE step_instance_id = ?1"
        );
        self.conn
            .query_row(
                &sql,
                params![step_instance_id.to_string()],
                parse_step_instance_row,
            )
            .optional()
            .context("failed to load step instance")
    }

    pub(crate) fn load_instance(&self, step_instance_id: StepInstanceId) -> Result<StepInstance> {
        self.find_instance(step_instance_id)?
            .ok_or_else(|| WorkflowError::not_found("step instance", step_instance_id).into())
    }

    /// Whether `step_instance_id` was removed because a sibling claimed its slot.
    pub(crate) fn is_superseded(&self, step_instance_id: StepInstanceId) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM superseded_step_instances WHERE step_instance_id = ?1",
                params![step_instance_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read superseded step instances")?;
        Ok(found.is_some())
    }

    pub(crate) fn instances_for_progress(
        &self,
        progress_id: ProgressId,
    ) -> Result<Vec<StepInstance>> {
        let sql = format!(
            "SELECT {STEP_INSTANCE_COLUMNS} FROM process_step_instances
             WHERE progress_id = ?1
             ORDER BY level ASC, step_instance_id ASC"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("failed to prepare progress instance query")?;
        let rows = stmt
            .query_map(params![progress_id.to_string()], parse_step_instance_row)
            .context("failed to query progress instances")?;
        collect_rows(rows)
    }

    pub(crate) fn instances_for_step(
        &self,
        process_id: ProcessId,
        step_id: WorkflowStepId,
    ) -> Result<Vec<StepInstance>> {
        let sql = format!(
            "SELECT {STEP_INSTANCE_COLUMNS} FROM process_step_instances
             WHERE process_id = ?1 AND step_id = ?2
             ORDER BY created_at ASC, step_instance_id ASC"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("failed to prepare step instance query")?;
        let rows = stmt
            .query_map(
                params![process_id.to_string(), step_id.to_string()],
                parse_step_instance_row,
            )
            .context("failed to query step instances")?;
        collect_rows(rows)
    }

    pub(crate) fn instances_for_process(&self, process_id: ProcessId) -> Result<Vec<StepInstance>> {
        let sql = format!(
            "SELECT {STEP_INSTANCE_COLUMNS} FROM process_step_instances
             WHERE process_id = ?1
             ORDER BY created_at ASC, step_instance_id ASC"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("failed to prepare process instance query")?;
        let rows = stmt
            .query_map(params![process_id.to_string()], parse_step_instance_row)
            .context("failed to query process instances")?;
        collect_rows(rows)
    }

    pub(crate) fn find_progress(
        &self,
        process_id: ProcessId,
        assignment_id: AssignmentId,
    ) -> Result<Option<AssignmentProgress>> {
        let sql = format!("{PROGRESS_SELECT} WHERE p.process_id = ?1 AND p.assignment_id = ?2");
        self.conn
            .query_row(
                &sql,
                params![process_id.to_string(), assignment_id.to_string()],
                parse_progress_row,
            )
            .optional()
            .context("failed to load assignment progress")
    }

    pub(crate) fn load_progress(&self, progress_id: ProgressId) -> Result<AssignmentProgress> {
        let sql = format!("{PROGRESS_SELECT} WHERE p.progress_id = ?1");
        self.conn
            .query_row(&sql, params![progress_id.to_string()], parse_progress_row)
            .optional()
            .context("failed to load assignment progress")?
            .ok_or_else(|| WorkflowError::not_found("assignment progress", progress_id).into())
    }

    pub(crate) fn progress_for_step(
        &self,
        process_id: ProcessId,
        step_id: WorkflowStepId,
    ) -> Result<Vec<AssignmentProgress>> {
        let sql = format!(
            "{PROGRESS_SELECT} WHERE p.process_id = ?1 AND p.step_id = ?2
             ORDER BY p.progress_id ASC"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("failed to prepare progress query")?;
        let rows = stmt
            .query_map(
                params![process_id.to_string(), step_id.to_string()],
                parse_progress_row,
            )
            .context("failed to query step progress")?;
        collect_rows(rows)
    }

    pub(crate) fn progress_for_process(
        &self,
        process_id: ProcessId,
    ) -> Result<Vec<AssignmentProgress>> {
        let sql = format!("{PROGRESS_SELECT} WHERE p.process_id = ?1 ORDER BY p.progress_id ASC");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("failed to prepare progress query")?;
        let rows = stmt
            .query_map(params![process_id.to_string()], parse_progress_row)
            .context("failed to query process progress")?;
        collect_rows(rows)
    }

    pub(crate) fn load_workflow(&self, workflow_id: WorkflowId) -> Result<WorkflowRecord> {
        crate::workflows::load_workflow(self.conn, workflow_id)?
            .ok_or_else(|| WorkflowError::not_found("workflow", workflow_id).into())
    }

    pub(crate) fn load_assignment(
        &self,
        workflow: &WorkflowRecord,
        assignment_id: AssignmentId,
    ) -> Result<WorkflowAssignmentRecord> {
        workflow
            .steps
            .iter()
            .flat_map(|step| step.assignments.iter())
            .find(|assignment| assignment.assignment_id == assignment_id)
            .cloned()
            .ok_or_else(|| WorkflowError::not_found("workflow assignment", assignment_id).into())
    }

    pub(crate) fn process_documents(&self, process_id: ProcessId) -> Result<Vec<DocumentId>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT document_id FROM process_documents
                 WHERE process_id = ?1
                 ORDER BY created_at ASC, document_id ASC",
            )
            .context("failed to prepare process document query")?;
        let rows = stmt
            .query_map(params![process_id.to_string()], |row| {
                ulid_at(row, 0).map(DocumentId)
            })
            .context("failed to query process documents")?;
        collect_rows(rows)
    }

    pub(crate) fn open_query_count(&self, process_id: ProcessId) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM process_queries WHERE process_id = ?1 AND status = 'open'",
                params![process_id.to_string()],
                |row| row.get(0),
            )
            .context("failed to count open queries")?;
        usize::try_from(count).context("open query count out of range")
    }

    /// Deletes unclaimed instances and leaves a tombstone for each so a late
    /// claim reports a lost race instead of a missing row.
    pub(crate) fn supersede_instances(
        &self,
        instances: &[StepInstance],
        superseded_by: Option<StepInstanceId>,
    ) -> Result<()> {
        let now = self.now_str()?;
        for instance in instances {
            let id = instance.step_instance_id.to_string();
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO superseded_step_instances(
                        step_instance_id, process_id, superseded_by, superseded_at
                     ) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        id,
                        instance.process_id.to_string(),
                        superseded_by.map(|value| value.to_string()),
                        now,
                    ],
                )
                .context("failed to record superseded step instance")?;
            self.conn
                .execute(
                    "DELETE FROM process_notifications WHERE step_instance_id = ?1",
                    params![id],
                )
                .context("failed to delete superseded notifications")?;
            self.conn
                .execute(
                    "DELETE FROM process_step_instances
                     WHERE step_instance_id = ?1 AND status = 'pending'",
                    params![id],
                )
                .context("failed to delete superseded step instance")?;
        }
        Ok(())
    }

    pub(crate) fn mark_progress_completed(&self, progress_id: ProgressId) -> Result<()> {
        self.conn
            .execute(
                "UPDATE assignment_progress SET completed = 1, completed_at = ?2
                 WHERE progress_id = ?1 AND completed = 0",
                params![progress_id.to_string(), self.now_str()?],
            )
            .context("failed to complete assignment progress")?;
        Ok(())
    }

    pub(crate) fn reopen_progress(&self, progress_id: ProgressId) -> Result<()> {
        self.conn
            .execute(
                "UPDATE assignment_progress SET completed = 0, completed_at = NULL
                 WHERE progress_id = ?1",
                params![progress_id.to_string()],
            )
            .context("failed to reopen assignment progress")?;
        Ok(())
    }

    pub(crate) fn save_completed_roles(
        &self,
        progress_id: ProgressId,
        completed_roles: &[docflow_core::RoleId],
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE department_step_progress SET completed_roles_json = ?2
                 WHERE progress_id = ?1",
                params![progress_id.to_string(), to_json(&completed_roles)?],
            )
            .context("failed to update department progress")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlines_outside_the_calendar_are_configuration_errors() {
        let conn = match Connection::open_in_memory() {
            Ok(conn) => conn,
            Err(err) => panic!("test failure: {err}"),
        };
        let config = EngineConfig::default();
        let scope = TxScope::new(&conn, &config);

        match scope.deadline_after(48) {
            Ok(deadline) => assert_eq!(deadline - scope.now, Duration::hours(48)),
            Err(err) => panic!("test failure: {err}"),
        }
        for hours in [i64::MAX, i64::MIN, i64::MAX / 3_600] {
            match scope.deadline_after(hours) {
                Ok(deadline) => panic!("expected rejection, got {deadline}"),
                Err(err) => assert_eq!(crate::error_code(&err), "configuration"),
            }
        }
    }
}
