//! Departments, roles, users and document metadata.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use docflow_core::{
    Actor, Department, DepartmentId, Document, DocumentId, Role, RoleDirectory, RoleId, User,
    UserId, WorkflowError,
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::rows::{collect_rows, opt_ulid_at, parse_document_row, ulid_at, DOCUMENT_COLUMNS};
use crate::SqliteProcessStore;

impl SqliteProcessStore {
    pub fn create_department(&mut self, name: &str) -> Result<Department> {
        let name = required_name("department", name)?;
        self.write("create_department", |scope| {
            let department = Department {
                department_id: DepartmentId::new(),
                name,
            };
            scope
                .conn
                .execute(
                    "INSERT INTO departments(department_id, name, created_at) VALUES (?1, ?2, ?3)",
                    params![
                        department.department_id.to_string(),
                        department.name,
                        scope.now_str()?,
                    ],
                )
                .context("failed to insert department")?;
            Ok(department)
        })
    }

    pub fn create_role(
        &mut self,
        name: &str,
        parent_role_id: Option<RoleId>,
        department_id: Option<DepartmentId>,
    ) -> Result<Role> {
        let name = required_name("role", name)?;
        self.write("create_role", |scope| {
            if let Some(parent) = parent_role_id {
                ensure_role(scope.conn, parent)?;
            }
            if let Some(department) = department_id {
                ensure_department(scope.conn, department)?;
            }
            let role = Role {
                role_id: RoleId::new(),
                name,
                parent_role_id,
                department_id,
            };
            scope
                .conn
                .execute(
                    "INSERT INTO roles(role_id, name, parent_role_id, department_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        role.role_id.to_string(),
                        role.name,
                        role.parent_role_id.map(|id| id.to_string()),
                        role.department_id.map(|id| id.to_string()),
                        scope.now_str()?,
                    ],
                )
                .context("failed to insert role")?;
            Ok(role)
        })
    }

    pub fn create_user(&mut self, username: &str) -> Result<User> {
        let username = required_name("user", username)?;
        self.write("create_user", |scope| {
            let user = User {
                user_id: UserId::new(),
                username,
            };
            scope
                .conn
                .execute(
                    "INSERT INTO users(user_id, username, created_at) VALUES (?1, ?2, ?3)",
                    params![user.user_id.to_string(), user.username, scope.now_str()?],
                )
                .context("failed to insert user")?;
            Ok(user)
        })
    }

    /// Adds `user_id` to `role_id`, optionally scoped to a department.
    /// Re-granting an existing membership is a no-op.
    pub fn assign_user_role(
        &mut self,
        user_id: UserId,
        role_id: RoleId,
        department_id: Option<DepartmentId>,
    ) -> Result<()> {
        self.write("assign_user_role", |scope| {
            ensure_user(scope.conn, user_id)?;
            ensure_role(scope.conn, role_id)?;
            if let Some(department) = department_id {
                ensure_department(scope.conn, department)?;
            }
            scope
                .conn
                .execute(
                    "INSERT INTO user_roles(user_id, role_id, department_id)
                     SELECT ?1, ?2, ?3
                     WHERE NOT EXISTS (
                        SELECT 1 FROM user_roles
                        WHERE user_id = ?1 AND role_id = ?2 AND department_id IS ?3
                     )",
                    params![
                        user_id.to_string(),
                        role_id.to_string(),
                        department_id.map(|id| id.to_string()),
                    ],
                )
                .context("failed to insert user role")?;
            Ok(())
        })
    }

    pub fn create_document(
        &mut self,
        name: &str,
        parent_id: Option<DocumentId>,
        path: Option<&str>,
    ) -> Result<Document> {
        let name = required_name("document", name)?;
        self.write("create_document", |scope| {
            if let Some(parent) = parent_id {
                load_document(scope.conn, parent)?;
            }
            let document = Document {
                document_id: DocumentId::new(),
                name,
                parent_id,
                path: path.map(str::to_string),
            };
            scope
                .conn
                .execute(
                    "INSERT INTO documents(document_id, name, parent_id, path, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        document.document_id.to_string(),
                        document.name,
                        document.parent_id.map(|id| id.to_string()),
                        document.path,
                        scope.now_str()?,
                    ],
                )
                .context("failed to insert document")?;
            Ok(document)
        })
    }

    /// Re-parents a document. Cycles are accepted here; the ancestor walk
    /// stops at the first revisit.
    pub fn set_document_parent(
        &mut self,
        document_id: DocumentId,
        parent_id: Option<DocumentId>,
    ) -> Result<Document> {
        self.write("set_document_parent", |scope| {
            load_document(scope.conn, document_id)?;
            if let Some(parent) = parent_id {
                load_document(scope.conn, parent)?;
            }
            scope
                .conn
                .execute(
                    "UPDATE documents SET parent_id = ?2 WHERE document_id = ?1",
                    params![document_id.to_string(), parent_id.map(|id| id.to_string())],
                )
                .context("failed to update document parent")?;
            load_document(scope.conn, document_id)
        })
    }

    pub fn get_document(&self, document_id: DocumentId) -> Result<Document> {
        load_document(&self.conn, document_id)
    }

    /// Actor view of a user: identity plus every role membership.
    pub fn actor_for(&self, user_id: UserId) -> Result<Actor> {
        load_actor(&self.conn, user_id)
    }
}

pub(crate) fn load_actor(conn: &Connection, user_id: UserId) -> Result<Actor> {
    ensure_user(conn, user_id)?;
    let mut stmt = conn
        .prepare("SELECT DISTINCT role_id FROM user_roles WHERE user_id = ?1 ORDER BY role_id ASC")
        .context("failed to prepare user role query")?;
    let rows = stmt
        .query_map(params![user_id.to_string()], |row| ulid_at(row, 0).map(RoleId))
        .context("failed to query user roles")?;
    Ok(Actor {
        user_id,
        role_ids: collect_rows(rows)?,
    })
}

fn required_name(entity: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(WorkflowError::Validation(format!("{entity} name MUST be non-empty")).into());
    }
    Ok(trimmed.to_string())
}

pub(crate) fn load_document(conn: &Connection, document_id: DocumentId) -> Result<Document> {
    find_document(conn, document_id)?
        .ok_or_else(|| WorkflowError::not_found("document", document_id).into())
}

pub(crate) fn find_document(
    conn: &Connection,
    document_id: DocumentId,
) -> Result<Option<Document>> {
    let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE document_id = ?1");
    conn.query_row(&sql, params![document_id.to_string()], parse_document_row)
        .optional()
        .context("failed to load document")
}

fn exists(conn: &Connection, sql: &str, id: String) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(sql, params![id], |row| row.get(0))
        .optional()
        .context("failed to check directory entry")?;
    Ok(found.is_some())
}

pub(crate) fn ensure_user(conn: &Connection, user_id: UserId) -> Result<()> {
    if exists(conn, "SELECT 1 FROM users WHERE user_id = ?1", user_id.to_string())? {
        Ok(())
    } else {
        Err(WorkflowError::not_found("user", user_id).into())
    }
}

pub(crate) fn ensure_role(conn: &Connection, role_id: RoleId) -> Result<()> {
    if exists(conn, "SELECT 1 FROM roles WHERE role_id = ?1", role_id.to_string())? {
        Ok(())
    } else {
        Err(WorkflowError::not_found("role", role_id).into())
    }
}

pub(crate) fn ensure_department(conn: &Connection, department_id: DepartmentId) -> Result<()> {
    if exists(
        conn,
        "SELECT 1 FROM departments WHERE department_id = ?1",
        department_id.to_string(),
    )? {
        Ok(())
    } else {
        Err(WorkflowError::not_found("department", department_id).into())
    }
}

/// Parent links for every role.
pub(crate) fn load_role_directory(conn: &Connection) -> Result<RoleDirectory> {
    let mut stmt = conn
        .prepare("SELECT role_id, parent_role_id FROM roles")
        .context("failed to prepare role directory query")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                RoleId(ulid_at(row, 0)?),
                opt_ulid_at(row, 1)?.map(RoleId),
            ))
        })
        .context("failed to query role directory")?;
    let directory: RoleDirectory = collect_rows(rows)?.into_iter().collect();
    debug!(roles = directory.len(), "loaded role directory");
    Ok(directory)
}

/// Users holding `role_id` in any department, ascending by id.
pub(crate) fn role_members(conn: &Connection, role_id: RoleId) -> Result<Vec<UserId>> {
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT user_id FROM user_roles WHERE role_id = ?1 ORDER BY user_id ASC",
        )
        .context("failed to prepare role member query")?;
    let rows = stmt
        .query_map(params![role_id.to_string()], |row| ulid_at(row, 0).map(UserId))
        .context("failed to query role members")?;
    collect_rows(rows)
}

/// Users holding `role_id` inside `department_id`, ascending by id.
pub(crate) fn department_role_members(
    conn: &Connection,
    department_id: DepartmentId,
    role_id: RoleId,
) -> Result<Vec<UserId>> {
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT user_id FROM user_roles
             WHERE role_id = ?1 AND department_id = ?2
             ORDER BY user_id ASC",
        )
        .context("failed to prepare department member query")?;
    let rows = stmt
        .query_map(
            params![role_id.to_string(), department_id.to_string()],
            |row| ulid_at(row, 0).map(UserId),
        )
        .context("failed to query department members")?;
    collect_rows(rows)
}

/// Role and department subjects `user_id` belongs to, for access checks.
pub(crate) fn memberships(
    conn: &Connection,
    user_id: UserId,
) -> Result<(BTreeSet<RoleId>, BTreeSet<DepartmentId>)> {
    let mut stmt = conn
        .prepare("SELECT role_id, department_id FROM user_roles WHERE user_id = ?1")
        .context("failed to prepare membership query")?;
    let rows = stmt
        .query_map(params![user_id.to_string()], |row| {
            Ok((
                RoleId(ulid_at(row, 0)?),
                opt_ulid_at(row, 1)?.map(DepartmentId),
            ))
        })
        .context("failed to query memberships")?;

    let mut roles = BTreeSet::new();
    let mut departments = BTreeSet::new();
    for (role, department) in collect_rows(rows)? {
        roles.insert(role);
        if let Some(department) = department {
            departments.insert(department);
        }
    }
    Ok((roles, departments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn store() -> SqliteProcessStore {
        let store = must(SqliteProcessStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    #[test]
    fn duplicate_role_grants_are_ignored() {
        let mut store = store();
        let department = must(store.create_department("Finance"));
        let role = must(store.create_role("Clerk", None, Some(department.department_id)));
        let user = must(store.create_user("ada"));

        must(store.assign_user_role(user.user_id, role.role_id, Some(department.department_id)));
        must(store.assign_user_role(user.user_id, role.role_id, Some(department.department_id)));

        let actor = must(store.actor_for(user.user_id));
        assert_eq!(actor.role_ids, vec![role.role_id]);
        assert_eq!(
            must(department_role_members(
                store.connection(),
                department.department_id,
                role.role_id
            )),
            vec![user.user_id]
        );
    }

    #[test]
    fn unknown_parent_role_is_not_found() {
        let mut store = store();
        let err = match store.create_role("Orphan", Some(RoleId::new()), None) {
            Ok(role) => panic!("expected failure, got {role:?}"),
            Err(err) => err,
        };
        assert_eq!(crate::error_code(&err), "not_found");
    }

    #[test]
    fn blank_names_are_rejected() {
        let mut store = store();
        let err = match store.create_user("   ") {
            Ok(user) => panic!("expected failure, got {user:?}"),
            Err(err) => err,
        };
        assert_eq!(crate::error_code(&err), "validation");
    }

    #[test]
    fn role_directory_reflects_parent_links() {
        let mut store = store();
        let head = must(store.create_role("Head", None, None));
        let lead = must(store.create_role("Lead", Some(head.role_id), None));

        let directory = must(load_role_directory(store.connection()));
        assert_eq!(directory.get(&lead.role_id), Some(&Some(head.role_id)));
        assert_eq!(directory.get(&head.role_id), Some(&None));
    }
}
