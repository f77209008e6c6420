//! Document grants and their propagation up the folder tree.
//!
//! Granting a document also grants READ on every ancestor so the holder can
//! navigate to it. Ancestor grants are only created where the subject holds
//! nothing for that document in the same process.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use docflow_core::{
    normalize_access, AccessLevel, AccessType, AssignmentId, DocumentAccessGrant, DocumentId,
    GrantId, ProcessId, StepInstanceId, Subject, UserId,
};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::directory::{find_document, load_document, memberships};
use crate::rows::{collect_rows, parse_grant_row, to_json, GRANT_COLUMNS};
use crate::scope::TxScope;
use crate::SqliteProcessStore;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GrantRequest {
    pub document_id: DocumentId,
    pub subject: Subject,
    pub process_id: Option<ProcessId>,
    pub assignment_id: Option<AssignmentId>,
    pub step_instance_id: Option<StepInstanceId>,
    pub access_types: Vec<AccessType>,
    pub access_level: AccessLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GrantReport {
    /// Grant covering the requested document, new or reused.
    pub grant_id: GrantId,
    pub created: bool,
    /// Ancestors that received a new READ grant, nearest first.
    pub ancestors_granted: Vec<DocumentId>,
    /// True when the walk stopped at a cycle or at the depth limit.
    pub truncated: bool,
}

impl SqliteProcessStore {
    pub fn grant_document_access(&mut self, request: &GrantRequest) -> Result<GrantReport> {
        self.write("grant_document_access", |scope| grant(scope, request))
    }

    pub fn list_document_grants(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<DocumentAccessGrant>> {
        let sql = format!(
            "SELECT {GRANT_COLUMNS} FROM document_access
             WHERE document_id = ?1
             ORDER BY created_at ASC, grant_id ASC"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("failed to prepare document grant query")?;
        let rows = stmt
            .query_map(params![document_id.to_string()], parse_grant_row)
            .context("failed to query document grants")?;
        collect_rows(rows)
    }

    /// Whether `user_id` holds `access` on `document_id` directly or through
    /// one of their roles or departments. FULL grants imply every access type.
    pub fn check_document_access(
        &self,
        user_id: UserId,
        document_id: DocumentId,
        access: AccessType,
    ) -> Result<bool> {
        load_document(&self.conn, document_id)?;
        let (roles, departments) = memberships(&self.conn, user_id)?;
        let subjects: BTreeSet<Subject> = std::iter::once(Subject::User(user_id))
            .chain(roles.into_iter().map(Subject::Role))
            .chain(departments.into_iter().map(Subject::Department))
            .collect();

        let allowed = self
            .list_document_grants(document_id)?
            .into_iter()
            .filter(|grant| subjects.contains(&grant.subject))
            .any(|grant| {
                grant.access_level == AccessLevel::Full || grant.access_types.contains(&access)
            });
        Ok(allowed)
    }
}

/// Grants `request` and READ on every reachable ancestor.
///
/// Safe to repeat: a second call with the same request creates nothing.
pub(crate) fn grant(scope: &TxScope<'_>, request: &GrantRequest) -> Result<GrantReport> {
    let leaf = load_document(scope.conn, request.document_id)?;

    let mut ancestors = Vec::new();
    let mut visited = BTreeSet::from([leaf.document_id]);
    let mut cursor = leaf.parent_id;
    let mut truncated = false;
    while let Some(parent_id) = cursor {
        if !visited.insert(parent_id) {
            warn!(document_id = %leaf.document_id, "document ancestry contains a cycle");
            truncated = true;
            break;
        }
        if ancestors.len() >= scope.config.max_ancestor_depth {
            warn!(
                document_id = %leaf.document_id,
                max_depth = scope.config.max_ancestor_depth,
                "document ancestry exceeds depth limit"
            );
            truncated = true;
            break;
        }
        let Some(parent) = find_document(scope.conn, parent_id)? else {
            break;
        };
        ancestors.push(parent.document_id);
        cursor = parent.parent_id;
    }

    let existing = existing_grants(scope, request.subject, request.process_id)?;

    let mut ancestors_granted = Vec::new();
    for ancestor in ancestors {
        if existing.contains_key(&ancestor) {
            continue;
        }
        insert_grant(
            scope,
            &GrantRequest {
                document_id: ancestor,
                access_types: vec![AccessType::Read],
                access_level: AccessLevel::Standard,
                ..request.clone()
            },
        )?;
        ancestors_granted.push(ancestor);
    }

    let requested: BTreeSet<AccessType> = normalize_access(&request.access_types)
        .into_iter()
        .collect();
    let reusable = existing.get(&leaf.document_id).and_then(|grants| {
        grants.iter().find(|grant| {
            let covers_level = grant.access_level == AccessLevel::Full
                || request.access_level == AccessLevel::Standard;
            let held: BTreeSet<AccessType> = grant.access_types.iter().copied().collect();
            covers_level && held.is_superset(&requested)
        })
    });

    let (grant_id, created) = match reusable {
        Some(grant) => (grant.grant_id, false),
        None => (insert_grant(scope, request)?, true),
    };

    debug!(
        document_id = %leaf.document_id,
        subject = request.subject.kind_str(),
        created,
        ancestors = ancestors_granted.len(),
        "document access granted"
    );

    Ok(GrantReport {
        grant_id,
        created,
        ancestors_granted,
        truncated,
    })
}

fn existing_grants(
    scope: &TxScope<'_>,
    subject: Subject,
    process_id: Option<ProcessId>,
) -> Result<BTreeMap<DocumentId, Vec<DocumentAccessGrant>>> {
    let sql = format!(
        "SELECT {GRANT_COLUMNS} FROM document_access
         WHERE subject_type = ?1 AND subject_id = ?2 AND process_id IS ?3"
    );
    let mut stmt = scope
        .conn
        .prepare(&sql)
        .context("failed to prepare existing grant query")?;
    let rows = stmt
        .query_map(
            params![
                subject.kind_str(),
                subject.ulid().to_string(),
                process_id.map(|id| id.to_string()),
            ],
            parse_grant_row,
        )
        .context("failed to query existing grants")?;

    let mut grouped: BTreeMap<DocumentId, Vec<DocumentAccessGrant>> = BTreeMap::new();
    for grant in collect_rows(rows)? {
        grouped.entry(grant.document_id).or_default().push(grant);
    }
    Ok(grouped)
}

fn insert_grant(scope: &TxScope<'_>, request: &GrantRequest) -> Result<GrantId> {
    let grant_id = GrantId::new();
    scope
        .conn
        .execute(
            "INSERT INTO document_access(
                grant_id, document_id, subject_type, subject_id, process_id,
                assignment_id, step_instance_id, access_types_json, access_level, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                grant_id.to_string(),
                request.document_id.to_string(),
                request.subject.kind_str(),
                request.subject.ulid().to_string(),
                request.process_id.map(|id| id.to_string()),
                request.assignment_id.map(|id| id.to_string()),
                request.step_instance_id.map(|id| id.to_string()),
                to_json(&normalize_access(&request.access_types))?,
                request.access_level.as_str(),
                scope.now_str()?,
            ],
        )
        .context("failed to insert document grant")?;
    Ok(grant_id)
}
