//! Versioned workflow definitions.
//!
//! Publishing a name that already exists creates the next version and
//! deactivates the older ones; running processes keep pointing at the
//! version they started on.

use anyhow::{Context, Result};
use docflow_core::{
    normalize_access, resolve_role_hierarchy, AssignmentId, UserId, WorkflowAssignmentRecord,
    WorkflowDefinition, WorkflowError, WorkflowId, WorkflowRecord, WorkflowStepId,
    WorkflowStepRecord,
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::directory::{ensure_department, ensure_user, load_role_directory};
use crate::rows::{
    bool_to_sql, collect_rows, parse_workflow_assignment_row, parse_workflow_row,
    parse_workflow_step_row, to_json, WORKFLOW_ASSIGNMENT_COLUMNS, WORKFLOW_COLUMNS,
    WORKFLOW_STEP_COLUMNS,
};
use crate::scope::TxScope;
use crate::SqliteProcessStore;

impl SqliteProcessStore {
    pub fn publish_workflow(
        &mut self,
        definition: &WorkflowDefinition,
        created_by: Option<UserId>,
    ) -> Result<WorkflowRecord> {
        definition.validate()?;
        self.write("publish_workflow", |scope| {
            let previous = latest_version_id(scope.conn, &definition.name)?;
            insert_version(scope, definition, created_by, previous)
        })
    }

    /// Publishes `definition` as the next version of `workflow_id`'s lineage.
    pub fn edit_workflow(
        &mut self,
        workflow_id: WorkflowId,
        definition: &WorkflowDefinition,
        edited_by: Option<UserId>,
    ) -> Result<WorkflowRecord> {
        definition.validate()?;
        self.write("edit_workflow", |scope| {
            let existing = scope.load_workflow(workflow_id)?;
            if existing.name != definition.name {
                return Err(WorkflowError::Validation(format!(
                    "workflow name `{}` does not match lineage `{}`",
                    definition.name, existing.name
                ))
                .into());
            }
            insert_version(scope, definition, edited_by, Some(workflow_id))
        })
    }

    pub fn get_workflow(&self, workflow_id: WorkflowId) -> Result<WorkflowRecord> {
        self.read(|scope| scope.load_workflow(workflow_id))
    }

    pub fn list_workflows(&self, active_only: bool) -> Result<Vec<WorkflowRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT workflow_id FROM workflows
                 WHERE (?1 = 0 OR is_active = 1)
                 ORDER BY name ASC, version DESC",
            )
            .context("failed to prepare workflow list query")?;
        let rows = stmt
            .query_map(params![bool_to_sql(active_only)], |row| {
                crate::rows::ulid_at(row, 0).map(WorkflowId)
            })
            .context("failed to list workflows")?;

        let mut workflows = Vec::new();
        for workflow_id in collect_rows(rows)? {
            if let Some(workflow) = load_workflow(&self.conn, workflow_id)? {
                workflows.push(workflow);
            }
        }
        Ok(workflows)
    }

    /// Removes a workflow version that no process references. The newest
    /// remaining version of the lineage becomes active.
    pub fn delete_workflow(&mut self, workflow_id: WorkflowId) -> Result<()> {
        self.write("delete_workflow", |scope| {
            let workflow = scope.load_workflow(workflow_id)?;
            let processes: i64 = scope
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM process_instances WHERE workflow_id = ?1",
                    params![workflow_id.to_string()],
                    |row| row.get(0),
                )
                .context("failed to count workflow processes")?;
            if processes > 0 {
                return Err(WorkflowError::Validation(format!(
                    "workflow {workflow_id} has {processes} process(es) and cannot be deleted"
                ))
                .into());
            }

            let id = workflow_id.to_string();
            scope
                .conn
                .execute(
                    "UPDATE workflows SET previous_workflow_id = NULL
                     WHERE previous_workflow_id = ?1",
                    params![id],
                )
                .context("failed to detach workflow lineage")?;
            scope
                .conn
                .execute(
                    "DELETE FROM workflow_assignments
                     WHERE step_id IN (SELECT step_id FROM workflow_steps WHERE workflow_id = ?1)",
                    params![id],
                )
                .context("failed to delete workflow assignments")?;
            scope
                .conn
                .execute("DELETE FROM workflow_steps WHERE workflow_id = ?1", params![id])
                .context("failed to delete workflow steps")?;
            scope
                .conn
                .execute("DELETE FROM workflows WHERE workflow_id = ?1", params![id])
                .context("failed to delete workflow")?;

            if workflow.is_active {
                if let Some(latest) = latest_version_id(scope.conn, &workflow.name)? {
                    scope
                        .conn
                        .execute(
                            "UPDATE workflows SET is_active = 1 WHERE workflow_id = ?1",
                            params![latest.to_string()],
                        )
                        .context("failed to reactivate workflow version")?;
                }
            }

            info!(workflow_id = %workflow_id, name = %workflow.name, "workflow deleted");
            Ok(())
        })
    }
}

fn latest_version_id(conn: &Connection, name: &str) -> Result<Option<WorkflowId>> {
    conn.query_row(
        "SELECT workflow_id FROM workflows WHERE name = ?1 ORDER BY version DESC LIMIT 1",
        params![name],
        |row| crate::rows::ulid_at(row, 0).map(WorkflowId),
    )
    .optional()
    .context("failed to read latest workflow version")
}

/// Checks that every user, role and department an assignment names exists
/// and that role selections resolve to a hierarchy.
fn validate_references(conn: &Connection, definition: &WorkflowDefinition) -> Result<()> {
    let directory = load_role_directory(conn)?;
    for step in &definition.steps {
        for assignment in &step.assignments {
            match &assignment.assignee {
                docflow_core::Assignment::User { user_ids } => {
                    for user_id in user_ids {
                        ensure_user(conn, *user_id).map_err(|_| {
                            WorkflowError::InvalidAssignment(format!(
                                "step `{}` names unknown user {user_id}",
                                step.step_name
                            ))
                        })?;
                    }
                }
                docflow_core::Assignment::Department { departments, .. } => {
                    for scope in departments {
                        ensure_department(conn, scope.department_id).map_err(|_| {
                            WorkflowError::InvalidAssignment(format!(
                                "step `{}` names unknown department {}",
                                step.step_name, scope.department_id
                            ))
                        })?;
                    }
                }
                docflow_core::Assignment::Role { .. } => {}
            }
            if let Some(hierarchy) = assignment.assignee.hierarchy() {
                resolve_role_hierarchy(
                    &directory,
                    &assignment.assignee.selected_role_ids(),
                    hierarchy,
                )?;
            }
        }
    }
    Ok(())
}

fn insert_version(
    scope: &TxScope<'_>,
    definition: &WorkflowDefinition,
    created_by: Option<UserId>,
    previous_workflow_id: Option<WorkflowId>,
) -> Result<WorkflowRecord> {
    validate_references(scope.conn, definition)?;
    let definition_hash = definition.definition_hash()?;
    let now = scope.now_str()?;

    let version: i64 = scope
        .conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM workflows WHERE name = ?1",
            params![definition.name],
            |row| row.get(0),
        )
        .context("failed to compute next workflow version")?;

    scope
        .conn
        .execute(
            "UPDATE workflows SET is_active = 0 WHERE name = ?1",
            params![definition.name],
        )
        .context("failed to deactivate older workflow versions")?;

    let workflow_id = WorkflowId::new();
    scope
        .conn
        .execute(
            "INSERT INTO workflows(
                workflow_id, name, description, version, is_active,
                previous_workflow_id, created_by, definition_hash, created_at
             ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?8)",
            params![
                workflow_id.to_string(),
                definition.name,
                definition.description,
                version,
                previous_workflow_id.map(|id| id.to_string()),
                created_by.map(|id| id.to_string()),
                definition_hash,
                now,
            ],
        )
        .context("failed to insert workflow")?;

    for (step_index, step) in definition.steps.iter().enumerate() {
        let step_id = WorkflowStepId::new();
        let step_number = i64::try_from(step_index + 1).context("step number out of range")?;
        scope
            .conn
            .execute(
                "INSERT INTO workflow_steps(
                    step_id, workflow_id, step_number, step_name, allow_parallel, requires_document
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    step_id.to_string(),
                    workflow_id.to_string(),
                    step_number,
                    step.step_name,
                    bool_to_sql(step.allow_parallel),
                    bool_to_sql(step.requires_document),
                ],
            )
            .context("failed to insert workflow step")?;

        for (position, assignment) in step.assignments.iter().enumerate() {
            let position = i64::try_from(position).context("assignment position out of range")?;
            scope
                .conn
                .execute(
                    "INSERT INTO workflow_assignments(
                        assignment_id, step_id, position, assignee_type,
                        assignment_json, action_type, access_types_json
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        AssignmentId::new().to_string(),
                        step_id.to_string(),
                        position,
                        assignment.assignee.assignee_type().as_str(),
                        to_json(&assignment.assignee)?,
                        assignment.action_type.as_str(),
                        to_json(&normalize_access(&assignment.access_types))?,
                    ],
                )
                .context("failed to insert workflow assignment")?;
        }
    }

    info!(
        workflow_id = %workflow_id,
        name = %definition.name,
        version,
        steps = definition.steps.len(),
        "workflow version published"
    );

    scope.load_workflow(workflow_id)
}

/// Loads a workflow with its steps ordered by number and assignments by
/// declaration order.
pub(crate) fn load_workflow(
    conn: &Connection,
    workflow_id: WorkflowId,
) -> Result<Option<WorkflowRecord>> {
    let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE workflow_id = ?1");
    let Some(mut workflow) = conn
        .query_row(&sql, params![workflow_id.to_string()], parse_workflow_row)
        .optional()
        .context("failed to load workflow")?
    else {
        return Ok(None);
    };

    let sql = format!(
        "SELECT {WORKFLOW_STEP_COLUMNS} FROM workflow_steps
         WHERE workflow_id = ?1
         ORDER BY step_number ASC"
    );
    let mut stmt = conn
        .prepare(&sql)
        .context("failed to prepare workflow step query")?;
    let rows = stmt
        .query_map(params![workflow_id.to_string()], parse_workflow_step_row)
        .context("failed to query workflow steps")?;
    let mut steps: Vec<WorkflowStepRecord> = collect_rows(rows)?;

    let sql = format!(
        "SELECT {WORKFLOW_ASSIGNMENT_COLUMNS} FROM workflow_assignments
         WHERE step_id = ?1
         ORDER BY position ASC"
    );
    let mut stmt = conn
        .prepare(&sql)
        .context("failed to prepare workflow assignment query")?;
    for step in &mut steps {
        let rows = stmt
            .query_map(params![step.step_id.to_string()], parse_workflow_assignment_row)
            .context("failed to query workflow assignments")?;
        let assignments: Vec<WorkflowAssignmentRecord> = collect_rows(rows)?;
        step.assignments = assignments;
    }

    workflow.steps = steps;
    Ok(Some(workflow))
}
