//! Authenticated entry points over the store.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use docflow_core::{
    Actor, DocumentId, IdentityProvider, Notification, ProcessId, QueryId, RoleId,
    StepInstance, StepInstanceId, UserId, WorkflowError, WorkflowId,
};
use tracing::debug;

use crate::rows::{collect_rows, ulid_at};
use crate::{
    ClaimOutcome, CompletionOutcome, DocumentChange, InitiateProcess, ProcessView, RaiseQuery,
    RaiseQueryOutcome, ResolveQueryOutcome, SqliteProcessStore,
};

/// Identity backed by the user directory. A credential is either the user's
/// ULID or their username.
#[derive(Debug, Clone, Default)]
pub struct DirectoryIdentity {
    actors: BTreeMap<String, Actor>,
}

impl DirectoryIdentity {
    /// Snapshots every user and their roles.
    pub fn load(store: &SqliteProcessStore) -> Result<Self> {
        let mut stmt = store
            .conn
            .prepare("SELECT user_id, username FROM users ORDER BY user_id ASC")
            .context("failed to prepare user directory query")?;
        let rows = stmt
            .query_map([], |row| Ok((UserId(ulid_at(row, 0)?), row.get::<_, String>(1)?)))
            .context("failed to query user directory")?;

        let mut actors = BTreeMap::new();
        for (user_id, username) in collect_rows(rows)? {
            let actor = store.actor_for(user_id)?;
            actors.insert(user_id.to_string(), actor.clone());
            actors.insert(username, actor);
        }
        Ok(Self { actors })
    }
}

impl IdentityProvider for DirectoryIdentity {
    fn authenticate(&self, credential: &str) -> Result<Actor, WorkflowError> {
        self.actors
            .get(credential.trim())
            .cloned()
            .ok_or(WorkflowError::Unauthenticated)
    }
}

pub struct ProcessEngine<I: IdentityProvider> {
    store: SqliteProcessStore,
    identity: I,
}

impl<I: IdentityProvider> ProcessEngine<I> {
    pub fn new(store: SqliteProcessStore, identity: I) -> Self {
        Self { store, identity }
    }

    #[must_use]
    pub fn store(&self) -> &SqliteProcessStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SqliteProcessStore {
        &mut self.store
    }

    pub fn authenticate(&self, credential: &str) -> Result<Actor> {
        let actor = self.identity.authenticate(credential)?;
        debug!(user_id = %actor.user_id, roles = actor.role_ids.len(), "actor authenticated");
        Ok(actor)
    }

    pub fn initiate(
        &mut self,
        credential: &str,
        workflow_id: WorkflowId,
        name: &str,
        document_ids: Vec<DocumentId>,
    ) -> Result<ProcessView> {
        let actor = self.authenticate(credential)?;
        self.store.initiate_process(&InitiateProcess {
            workflow_id,
            initiator_id: actor.user_id,
            name: name.to_string(),
            document_ids,
        })
    }

    pub fn claim(
        &mut self,
        credential: &str,
        step_instance_id: StepInstanceId,
    ) -> Result<ClaimOutcome> {
        let actor = self.authenticate(credential)?;
        self.store.claim_step(step_instance_id, actor.user_id)
    }

    pub fn complete(
        &mut self,
        credential: &str,
        step_instance_id: StepInstanceId,
    ) -> Result<CompletionOutcome> {
        let actor = self.authenticate(credential)?;
        self.store.complete_step(step_instance_id, actor.user_id)
    }

    /// Raises a query as the authenticated actor; `request.actor_id` is
    /// overwritten.
    pub fn raise_query(
        &mut self,
        credential: &str,
        mut request: RaiseQuery,
    ) -> Result<RaiseQueryOutcome> {
        let actor = self.authenticate(credential)?;
        request.actor_id = actor.user_id;
        self.store.raise_query(&request)
    }

    pub fn resolve_query(
        &mut self,
        credential: &str,
        query_id: QueryId,
        answer: &str,
        document_changes: &[DocumentChange],
    ) -> Result<ResolveQueryOutcome> {
        let actor = self.authenticate(credential)?;
        self.store
            .resolve_query(query_id, actor.user_id, answer, document_changes)
    }

    pub fn inbox(&self, credential: &str) -> Result<Vec<StepInstance>> {
        let actor = self.authenticate(credential)?;
        self.store.list_inbox(actor.user_id)
    }

    pub fn notifications(&self, credential: &str) -> Result<Vec<Notification>> {
        let actor = self.authenticate(credential)?;
        self.store.list_notifications(actor.user_id)
    }

    pub fn process(&self, credential: &str, process_id: ProcessId) -> Result<ProcessView> {
        self.authenticate(credential)?;
        self.store.get_process(process_id)
    }

    /// Roles the actor holds; convenience for callers rendering permissions.
    pub fn roles(&self, credential: &str) -> Result<Vec<RoleId>> {
        Ok(self.authenticate(credential)?.role_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_core::{
        AccessType, ActionType, Assignment, AssignmentDefinition, StaticIdentity, StepDefinition,
        WorkflowDefinition,
    };
    use std::path::Path;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn unknown_credentials_are_unauthenticated() {
        let store = must(SqliteProcessStore::open(Path::new(":memory:")));
        must(store.migrate());
        let mut engine = ProcessEngine::new(store, StaticIdentity::new());

        let err = match engine.claim("nobody", StepInstanceId::new()) {
            Ok(outcome) => panic!("expected rejection, got {outcome:?}"),
            Err(err) => err,
        };
        assert_eq!(crate::error_code(&err), "unauthenticated");
    }

    #[test]
    fn directory_identity_accepts_ids_and_usernames() {
        let mut store = must(SqliteProcessStore::open(Path::new(":memory:")));
        must(store.migrate());
        let initiator = must(store.create_user("init"));
        let reviewer = must(store.create_user("reviewer"));
        let role = must(store.create_role("Reviewer", None, None));
        must(store.assign_user_role(reviewer.user_id, role.role_id, None));
        let workflow = must(store.publish_workflow(
            &WorkflowDefinition {
                name: "Engine".to_string(),
                description: None,
                steps: vec![StepDefinition {
                    step_name: "Review".to_string(),
                    allow_parallel: false,
                    requires_document: false,
                    assignments: vec![AssignmentDefinition {
                        assignee: Assignment::User {
                            user_ids: vec![reviewer.user_id],
                        },
                        action_type: ActionType::Review,
                        access_types: vec![AccessType::Read],
                    }],
                }],
            },
            None,
        ));

        let identity = must(DirectoryIdentity::load(&store));
        let mut engine = ProcessEngine::new(store, identity);
        assert_eq!(must(engine.roles("reviewer")), vec![role.role_id]);

        let view = must(engine.initiate(
            &initiator.user_id.to_string(),
            workflow.workflow_id,
            "Engine run",
            Vec::new(),
        ));
        assert_eq!(view.process.initiator_id, initiator.user_id);

        let inbox = must(engine.inbox("reviewer"));
        assert_eq!(inbox.len(), 1);
        must(engine.claim("reviewer", inbox[0].step_instance_id));
        let outcome = must(engine.complete("reviewer", inbox[0].step_instance_id));
        assert_eq!(outcome.advance.state, crate::AdvanceState::Completed);

        let finished = must(engine.process("init", view.process.process_id));
        assert_eq!(finished.process.status, docflow_core::ProcessStatus::Completed);
        assert!(engine.process("ghost", view.process.process_id).is_err());
    }
}
