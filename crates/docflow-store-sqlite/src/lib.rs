//! `SQLite` persistence for the approval engine.
//!
//! Every state-changing operation runs inside one `BEGIN IMMEDIATE`
//! transaction: instances, progress rows, grants and notifications commit
//! together or not at all. Notifications reach the configured
//! [`NotificationSink`] only after the commit.
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use docflow_core::{
    format_rfc3339, now_utc, EngineConfig, NoopSink, Notification, NotificationSink,
    WorkflowError,
};
use rusqlite::{params, Connection, TransactionBehavior};
use tracing::warn;

mod access;
mod advance;
mod claim;
mod directory;
mod engine;
mod materialize;
mod process;
mod recirculation;
mod rows;
mod scope;
mod workflows;

pub use access::{GrantReport, GrantRequest};
pub use advance::{AdvanceReport, AdvanceState, CompletionOutcome};
pub use claim::ClaimOutcome;
pub use engine::{DirectoryIdentity, ProcessEngine};
pub use process::{CurrentStep, InitiateProcess, ProcessView};
pub use recirculation::{
    Delegation, DocumentChange, DocumentSummary, RaiseQuery, RaiseQueryOutcome,
    ResolveQueryOutcome,
};

use scope::TxScope;

const MIGRATION_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS departments (
  department_id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS roles (
  role_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  parent_role_id TEXT REFERENCES roles(role_id),
  department_id TEXT REFERENCES departments(department_id),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  username TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_roles (
  user_id TEXT NOT NULL REFERENCES users(user_id),
  role_id TEXT NOT NULL REFERENCES roles(role_id),
  department_id TEXT REFERENCES departments(department_id)
);

CREATE INDEX IF NOT EXISTS idx_user_roles_role_department
  ON user_roles(role_id, department_id);

CREATE TABLE IF NOT EXISTS documents (
  document_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  parent_id TEXT REFERENCES documents(document_id),
  path TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflows (
  workflow_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  description TEXT,
  version INTEGER NOT NULL CHECK (version >= 1),
  is_active INTEGER NOT NULL CHECK (is_active IN (0, 1)),
  previous_workflow_id TEXT REFERENCES workflows(workflow_id),
  created_by TEXT,
  definition_hash TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE(name, version)
);

CREATE TABLE IF NOT EXISTS workflow_steps (
  step_id TEXT PRIMARY KEY,
  workflow_id TEXT NOT NULL REFERENCES workflows(workflow_id) ON DELETE CASCADE,
  step_number INTEGER NOT NULL CHECK (step_number >= 1),
  step_name TEXT NOT NULL,
  allow_parallel INTEGER NOT NULL CHECK (allow_parallel IN (0, 1)),
  requires_document INTEGER NOT NULL CHECK (requires_document IN (0, 1)),
  UNIQUE(workflow_id, step_number),
  UNIQUE(workflow_id, step_name)
);

CREATE TABLE IF NOT EXISTS workflow_assignments (
  assignment_id TEXT PRIMARY KEY,
  step_id TEXT NOT NULL REFERENCES workflow_steps(step_id) ON DELETE CASCADE,
  position INTEGER NOT NULL,
  assignee_type TEXT NOT NULL CHECK (assignee_type IN ('user', 'role', 'department')),
  assignment_json TEXT NOT NULL,
  action_type TEXT NOT NULL CHECK (action_type IN ('approval', 'review', 'signature')),
  access_types_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS process_instances (
  process_id TEXT PRIMARY KEY,
  workflow_id TEXT NOT NULL REFERENCES workflows(workflow_id),
  initiator_id TEXT NOT NULL REFERENCES users(user_id),
  name TEXT NOT NULL,
  current_step_id TEXT REFERENCES workflow_steps(step_id),
  status TEXT NOT NULL CHECK (status IN ('pending', 'in_progress', 'completed')),
  is_recirculated INTEGER NOT NULL DEFAULT 0 CHECK (is_recirculated IN (0, 1)),
  created_at TEXT NOT NULL,
  completed_at TEXT,
  CHECK ((status = 'in_progress') = (current_step_id IS NOT NULL))
);

CREATE TABLE IF NOT EXISTS process_documents (
  process_id TEXT NOT NULL REFERENCES process_instances(process_id),
  document_id TEXT NOT NULL REFERENCES documents(document_id),
  is_replacement INTEGER NOT NULL DEFAULT 0 CHECK (is_replacement IN (0, 1)),
  replaced_document_id TEXT REFERENCES documents(document_id),
  added_by TEXT NOT NULL REFERENCES users(user_id),
  created_at TEXT NOT NULL,
  PRIMARY KEY (process_id, document_id)
);

CREATE TABLE IF NOT EXISTS assignment_progress (
  progress_id TEXT PRIMARY KEY,
  process_id TEXT NOT NULL REFERENCES process_instances(process_id),
  assignment_id TEXT NOT NULL REFERENCES workflow_assignments(assignment_id),
  step_id TEXT NOT NULL REFERENCES workflow_steps(step_id),
  role_hierarchy_json TEXT,
  current_level INTEGER NOT NULL DEFAULT 0 CHECK (current_level >= 0),
  completed INTEGER NOT NULL DEFAULT 0 CHECK (completed IN (0, 1)),
  completed_at TEXT,
  UNIQUE(process_id, assignment_id)
);

CREATE TABLE IF NOT EXISTS department_step_progress (
  progress_id TEXT PRIMARY KEY REFERENCES assignment_progress(progress_id),
  required_roles_json TEXT NOT NULL,
  completed_roles_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS process_step_instances (
  step_instance_id TEXT PRIMARY KEY,
  process_id TEXT NOT NULL REFERENCES process_instances(process_id),
  step_id TEXT NOT NULL REFERENCES workflow_steps(step_id),
  assignment_id TEXT REFERENCES workflow_assignments(assignment_id),
  progress_id TEXT REFERENCES assignment_progress(progress_id),
  assigned_to TEXT NOT NULL REFERENCES users(user_id),
  role_id TEXT REFERENCES roles(role_id),
  department_id TEXT REFERENCES departments(department_id),
  level INTEGER NOT NULL DEFAULT 0 CHECK (level >= 0),
  status TEXT NOT NULL CHECK (
    status IN ('pending', 'in_progress', 'approved', 'for_recirculation')
  ),
  picked_by_id TEXT REFERENCES users(user_id),
  claimed_at TEXT,
  decision_at TEXT,
  deadline TEXT,
  recirculation_reason TEXT,
  recirculation_cycle INTEGER NOT NULL DEFAULT 0 CHECK (recirculation_cycle >= 0),
  is_recirculated INTEGER NOT NULL DEFAULT 0 CHECK (is_recirculated IN (0, 1)),
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_step_instances_process_step
  ON process_step_instances(process_id, step_id, status);
CREATE INDEX IF NOT EXISTS idx_step_instances_progress
  ON process_step_instances(progress_id, status);
CREATE INDEX IF NOT EXISTS idx_step_instances_assignee
  ON process_step_instances(assigned_to, status);

CREATE TABLE IF NOT EXISTS superseded_step_instances (
  step_instance_id TEXT PRIMARY KEY,
  process_id TEXT NOT NULL,
  superseded_by TEXT,
  superseded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS process_queries (
  query_id TEXT PRIMARY KEY,
  process_id TEXT NOT NULL REFERENCES process_instances(process_id),
  step_instance_id TEXT NOT NULL,
  raised_by TEXT NOT NULL REFERENCES users(user_id),
  addressed_to TEXT NOT NULL REFERENCES users(user_id),
  question TEXT NOT NULL,
  answer TEXT,
  status TEXT NOT NULL CHECK (status IN ('open', 'resolved')),
  delegated_step_name TEXT,
  details_json TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL,
  answered_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_process_queries_status
  ON process_queries(process_id, status);

CREATE TABLE IF NOT EXISTS document_access (
  grant_id TEXT PRIMARY KEY,
  document_id TEXT NOT NULL REFERENCES documents(document_id),
  subject_type TEXT NOT NULL CHECK (subject_type IN ('user', 'role', 'department')),
  subject_id TEXT NOT NULL,
  process_id TEXT REFERENCES process_instances(process_id),
  assignment_id TEXT,
  step_instance_id TEXT,
  access_types_json TEXT NOT NULL,
  access_level TEXT NOT NULL CHECK (access_level IN ('standard', 'full')),
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_document_access_subject
  ON document_access(subject_type, subject_id, process_id);
CREATE INDEX IF NOT EXISTS idx_document_access_document
  ON document_access(document_id);

CREATE TABLE IF NOT EXISTS process_notifications (
  notification_id TEXT PRIMARY KEY,
  process_id TEXT NOT NULL REFERENCES process_instances(process_id),
  step_instance_id TEXT,
  user_id TEXT NOT NULL REFERENCES users(user_id),
  notification_type TEXT NOT NULL CHECK (
    notification_type IN (
      'step_assignment',
      'step_assigned',
      'document_query',
      'query_resolved',
      'step_completed'
    )
  ),
  status TEXT NOT NULL CHECK (status IN ('active', 'claimed', 'completed')),
  metadata_json TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_process_notifications_user
  ON process_notifications(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_process_notifications_instance
  ON process_notifications(step_instance_id);

CREATE TABLE IF NOT EXISTS document_history (
  history_id TEXT PRIMARY KEY,
  process_id TEXT NOT NULL REFERENCES process_instances(process_id),
  document_id TEXT NOT NULL REFERENCES documents(document_id),
  action TEXT NOT NULL CHECK (action IN ('uploaded', 'replaced', 'feedback')),
  actor_id TEXT NOT NULL REFERENCES users(user_id),
  replaced_document_id TEXT REFERENCES documents(document_id),
  is_recirculation_trigger INTEGER NOT NULL DEFAULT 0 CHECK (is_recirculation_trigger IN (0, 1)),
  note TEXT,
  created_at TEXT NOT NULL
);
";

pub struct SqliteProcessStore {
    conn: Connection,
    config: EngineConfig,
    sink: Arc<dyn NotificationSink>,
}

impl SqliteProcessStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, EngineConfig::default())
    }

    pub fn open_with_config(path: &Path, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            config.busy_timeout_ms
        ))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            config,
            sink: Arc::new(NoopSink),
        })
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply engine schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![MIGRATION_VERSION, now],
            )
            .context("failed to register engine schema migration")?;

        Ok(())
    }

    /// Runs `op` in one immediate transaction and hands the notifications it
    /// persisted to the sink after commit.
    ///
    /// `BEGIN IMMEDIATE` takes the write lock up front, so concurrent writers
    /// queue on `busy_timeout` instead of failing mid-transaction on upgrade.
    pub(crate) fn write<T>(
        &mut self,
        label: &str,
        op: impl FnOnce(&mut TxScope<'_>) -> Result<T>,
    ) -> Result<T> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("failed to start {label} transaction"))?;

        let mut scope = TxScope::new(&tx, &self.config);
        let value = op(&mut scope)?;
        let notifications = scope.into_notifications();

        tx.commit()
            .with_context(|| format!("failed to commit {label} transaction"))?;

        self.deliver(label, &notifications);
        Ok(value)
    }

    pub(crate) fn read<T>(&self, op: impl FnOnce(&TxScope<'_>) -> Result<T>) -> Result<T> {
        let scope = TxScope::new(&self.conn, &self.config);
        op(&scope)
    }

    fn deliver(&self, label: &str, notifications: &[Notification]) {
        if notifications.is_empty() {
            return;
        }
        if let Err(err) = self.sink.deliver(notifications) {
            warn!(
                operation = label,
                count = notifications.len(),
                error = %err,
                "notification delivery failed"
            );
        }
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Stable code for an engine error, `storage` when the failure did not come
/// from the domain taxonomy.
#[must_use]
pub fn error_code(err: &anyhow::Error) -> &'static str {
    domain_error(err).map_or("storage", WorkflowError::code)
}

#[must_use]
pub fn domain_error(err: &anyhow::Error) -> Option<&WorkflowError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<WorkflowError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = must(SqliteProcessStore::open(Path::new(":memory:")));
        must(store.migrate());
        must(store.migrate());

        let versions: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(versions, 1);
    }

    #[test]
    fn process_status_check_rejects_in_progress_without_step() {
        let store = must(SqliteProcessStore::open(Path::new(":memory:")));
        must(store.migrate());
        let user = docflow_core::UserId::new().to_string();
        let workflow = docflow_core::WorkflowId::new().to_string();
        must(
            store
                .connection()
                .execute_batch("PRAGMA foreign_keys = OFF;")
                .map_err(Into::into),
        );

        let result = store.connection().execute(
            "INSERT INTO process_instances(
                process_id, workflow_id, initiator_id, name, current_step_id, status, created_at
             )
             VALUES (?1, ?2, ?3, 'bad', NULL, 'in_progress', '2026-02-07T12:00:00Z')",
            params![docflow_core::ProcessId::new().to_string(), workflow, user],
        );
        assert!(result.is_err());
    }

    #[test]
    fn error_code_reads_domain_errors_through_context() {
        let err = anyhow::Error::from(WorkflowError::Forbidden("nope".to_string()))
            .context("failed to claim");
        assert_eq!(error_code(&err), "forbidden");
        assert_eq!(error_code(&anyhow!("disk I/O error")), "storage");
    }

    #[test]
    fn invalid_config_is_rejected_on_open() {
        let config = EngineConfig {
            busy_timeout_ms: 0,
            ..EngineConfig::default()
        };
        let err = match SqliteProcessStore::open_with_config(Path::new(":memory:"), config) {
            Ok(_) => panic!("expected config rejection"),
            Err(err) => err,
        };
        assert_eq!(error_code(&err), "configuration");
    }

    struct FailingSink;

    impl NotificationSink for FailingSink {
        fn deliver(&self, _notifications: &[Notification]) -> Result<(), docflow_core::SinkError> {
            Err("mail relay offline".into())
        }
    }

    fn start_review(store: &mut SqliteProcessStore) -> Result<ProcessView> {
        use docflow_core::{
            AccessType, ActionType, Assignment, AssignmentDefinition, StepDefinition,
            WorkflowDefinition,
        };

        store.migrate()?;
        let initiator = store.create_user("initiator")?;
        let reviewer = store.create_user("reviewer")?;
        let workflow = store.publish_workflow(
            &WorkflowDefinition {
                name: "Sink".to_string(),
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
        )?;
        store.initiate_process(&InitiateProcess {
            workflow_id: workflow.workflow_id,
            initiator_id: initiator.user_id,
            name: "Sink run".to_string(),
            document_ids: Vec::new(),
        })
    }

    #[test]
    fn committed_notifications_reach_the_sink() {
        use docflow_core::MemorySink;

        let sink = Arc::new(MemorySink::new());
        let mut store = must(SqliteProcessStore::open(Path::new(":memory:")))
            .with_sink(Arc::clone(&sink) as Arc<dyn NotificationSink>);
        let view = must(start_review(&mut store));

        let delivered = sink.take();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].process_id, view.process.process_id);
        let stored: Vec<_> = must(store.list_notifications(delivered[0].user_id))
            .into_iter()
            .map(|notification| notification.notification_id)
            .collect();
        assert_eq!(stored, vec![delivered[0].notification_id]);

        let missing = docflow_core::StepInstanceId::new();
        let err = match store.claim_step(missing, view.process.initiator_id) {
            Ok(outcome) => panic!("expected failure, got {outcome:?}"),
            Err(err) => err,
        };
        assert_eq!(error_code(&err), "not_found");
        assert!(sink.take().is_empty());
    }

    #[test]
    fn sink_failures_do_not_roll_back() {
        let mut store = must(SqliteProcessStore::open(Path::new(":memory:")))
            .with_sink(Arc::new(FailingSink));
        let view = must(start_review(&mut store));

        let stored = must(store.get_process(view.process.process_id));
        assert_eq!(stored.instances.len(), 1);
        assert_eq!(
            must(store.list_notifications(stored.instances[0].assigned_to)).len(),
            1
        );
    }
}
