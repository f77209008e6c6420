//! Command surface for the approval engine.
//!
//! Hosts embed the CLI through [`run_cli`] or execute a single parsed
//! [`Command`] against an open store with [`run_command`]. Every command
//! prints one pretty JSON document on stdout. Operations performed on
//! behalf of a user take `--as <user id or username>` and are authenticated
//! through [`DirectoryIdentity`] before they touch the store.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use docflow_core::{
    AccessLevel, AccessType, DepartmentId, DocumentId, EngineConfig, ProcessId, ProgressId,
    QueryId, RoleId, StepInstanceId, Subject, UserId, WorkflowDefinition, WorkflowError,
    WorkflowId,
};
use docflow_store_sqlite::{
    Delegation, DirectoryIdentity, DocumentChange, DocumentSummary, GrantRequest, ProcessEngine,
    RaiseQuery, SqliteProcessStore,
};
use serde_json::{json, Value};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "docflow")]
#[command(about = "Document approval workflow engine")]
pub struct Cli {
    #[arg(long, default_value = "./docflow.sqlite3")]
    db: PathBuf,

    /// Engine config file (JSON or YAML).
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Directory {
        #[command(subcommand)]
        command: DirectoryCommand,
    },
    Document {
        #[command(subcommand)]
        command: DocumentCommand,
    },
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommand,
    },
    Process {
        #[command(subcommand)]
        command: ProcessCommand,
    },
    Step {
        #[command(subcommand)]
        command: StepCommand,
    },
    Query {
        #[command(subcommand)]
        command: QueryCommand,
    },
    Notifications {
        #[command(subcommand)]
        command: NotificationsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum DirectoryCommand {
    Department {
        #[arg(long)]
        name: String,
    },
    Role {
        #[arg(long)]
        name: String,
        #[arg(long)]
        parent: Option<String>,
        #[arg(long)]
        department: Option<String>,
    },
    User {
        #[arg(long)]
        username: String,
    },
    GrantRole {
        #[arg(long)]
        user: String,
        #[arg(long)]
        role: String,
        #[arg(long)]
        department: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum DocumentCommand {
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        parent: Option<String>,
        #[arg(long)]
        path: Option<String>,
    },
    SetParent {
        #[arg(long)]
        id: String,
        #[arg(long)]
        parent: Option<String>,
    },
    Grant(GrantArgs),
    Access {
        #[arg(long)]
        user: String,
        #[arg(long)]
        document: String,
        #[arg(long, value_enum)]
        access: AccessArg,
    },
}

#[derive(Debug, Args)]
pub struct GrantArgs {
    #[arg(long)]
    document: String,
    #[arg(long)]
    user: String,
    #[arg(long = "access", value_enum, required = true)]
    access: Vec<AccessArg>,
    #[arg(long)]
    full: bool,
    #[arg(long)]
    process: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum WorkflowCommand {
    Publish {
        #[arg(long)]
        file: PathBuf,
        #[arg(long = "as")]
        actor: Option<String>,
    },
    Edit {
        #[arg(long)]
        id: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long = "as")]
        actor: Option<String>,
    },
    Show {
        #[arg(long)]
        id: String,
    },
    List {
        #[arg(long)]
        active_only: bool,
    },
    Delete {
        #[arg(long)]
        id: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum ProcessCommand {
    Initiate {
        #[arg(long = "as")]
        actor: String,
        #[arg(long)]
        workflow: String,
        #[arg(long)]
        name: String,
        #[arg(long = "document")]
        documents: Vec<String>,
    },
    Show {
        #[arg(long)]
        id: String,
    },
    History {
        #[arg(long)]
        id: String,
    },
    Advance {
        #[arg(long)]
        id: String,
    },
    Escalate {
        #[arg(long)]
        progress: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum StepCommand {
    Claim {
        #[arg(long = "as")]
        actor: String,
        #[arg(long)]
        id: String,
    },
    Complete {
        #[arg(long = "as")]
        actor: String,
        #[arg(long)]
        id: String,
    },
    Inbox {
        #[arg(long = "as")]
        actor: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum QueryCommand {
    Raise(RaiseArgs),
    Resolve {
        #[arg(long = "as")]
        actor: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        answer: String,
        /// `<document>` or `<document>:<replaced document>`.
        #[arg(long = "document")]
        documents: Vec<String>,
    },
    List {
        #[arg(long)]
        process: String,
    },
}

#[derive(Debug, Args)]
pub struct RaiseArgs {
    #[arg(long = "as")]
    actor: String,
    #[arg(long)]
    process: String,
    #[arg(long)]
    step_instance: String,
    #[arg(long)]
    text: String,
    #[arg(long)]
    delegate: Option<String>,
    #[arg(long, requires = "delegate")]
    delegate_step: Option<String>,
    /// `<document>` or `<document>:<replaced document>`.
    #[arg(long = "document")]
    documents: Vec<String>,
    /// `<document>=<feedback>`.
    #[arg(long = "summary")]
    summaries: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum NotificationsCommand {
    List {
        #[arg(long = "as")]
        actor: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AccessArg {
    Read,
    Edit,
    Download,
}

impl From<AccessArg> for AccessType {
    fn from(value: AccessArg) -> Self {
        match value {
            AccessArg::Read => Self::Read,
            AccessArg::Edit => Self::Edit,
            AccessArg::Download => Self::Download,
        }
    }
}

/// Installs the stderr log subscriber. `RUST_LOG` overrides the default
/// `warn` filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Opens the store named by `cli`, runs the command and prints its JSON.
///
/// # Errors
/// Returns an error when config loading, store open/migrate, authentication
/// or the command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let store = open_store(&cli.db, cli.config.as_deref())?;
    let output = run_command(cli.command, store)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Opens and migrates a store, applying an optional engine config file.
///
/// # Errors
/// Returns an error when the config is invalid or the database cannot be
/// opened or migrated.
pub fn open_store(db: &Path, config: Option<&Path>) -> Result<SqliteProcessStore> {
    let config = match config {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::default(),
    };
    let store = SqliteProcessStore::open_with_config(db, config)?;
    store.migrate()?;
    debug!(db = %db.display(), "store ready");
    Ok(store)
}

/// Executes one parsed command and returns the JSON it would print.
///
/// # Errors
/// Returns an error when identifiers do not parse, the actor does not
/// authenticate, or the store operation fails.
pub fn run_command(command: Command, store: SqliteProcessStore) -> Result<Value> {
    let identity = DirectoryIdentity::load(&store)?;
    let mut engine = ProcessEngine::new(store, identity);
    match command {
        Command::Directory { command } => run_directory(command, engine.store_mut()),
        Command::Document { command } => run_document(command, engine.store_mut()),
        Command::Workflow { command } => run_workflow(command, &mut engine),
        Command::Process { command } => run_process(command, &mut engine),
        Command::Step { command } => run_step(command, &mut engine),
        Command::Query { command } => run_query(command, &mut engine),
        Command::Notifications { command } => match command {
            NotificationsCommand::List { actor } => to_value(engine.notifications(&actor)?),
        },
    }
}

fn run_directory(command: DirectoryCommand, store: &mut SqliteProcessStore) -> Result<Value> {
    match command {
        DirectoryCommand::Department { name } => to_value(store.create_department(&name)?),
        DirectoryCommand::Role {
            name,
            parent,
            department,
        } => {
            let parent = parse_optional::<RoleId>(parent.as_deref())?;
            let department = parse_optional::<DepartmentId>(department.as_deref())?;
            to_value(store.create_role(&name, parent, department)?)
        }
        DirectoryCommand::User { username } => to_value(store.create_user(&username)?),
        DirectoryCommand::GrantRole {
            user,
            role,
            department,
        } => {
            let user_id = parse_id::<UserId>(&user)?;
            let role_id = parse_id::<RoleId>(&role)?;
            let department_id = parse_optional::<DepartmentId>(department.as_deref())?;
            store.assign_user_role(user_id, role_id, department_id)?;
            to_value(store.actor_for(user_id)?)
        }
    }
}

fn run_document(command: DocumentCommand, store: &mut SqliteProcessStore) -> Result<Value> {
    match command {
        DocumentCommand::Create { name, parent, path } => {
            let parent = parse_optional::<DocumentId>(parent.as_deref())?;
            to_value(store.create_document(&name, parent, path.as_deref())?)
        }
        DocumentCommand::SetParent { id, parent } => {
            let document_id = parse_id::<DocumentId>(&id)?;
            let parent = parse_optional::<DocumentId>(parent.as_deref())?;
            store.set_document_parent(document_id, parent)?;
            to_value(store.get_document(document_id)?)
        }
        DocumentCommand::Grant(args) => {
            let request = GrantRequest {
                document_id: parse_id(&args.document)?,
                subject: Subject::User(parse_id(&args.user)?),
                process_id: parse_optional::<ProcessId>(args.process.as_deref())?,
                assignment_id: None,
                step_instance_id: None,
                access_types: args.access.into_iter().map(AccessType::from).collect(),
                access_level: if args.full {
                    AccessLevel::Full
                } else {
                    AccessLevel::Standard
                },
            };
            to_value(store.grant_document_access(&request)?)
        }
        DocumentCommand::Access {
            user,
            document,
            access,
        } => {
            let user_id = parse_id::<UserId>(&user)?;
            let document_id = parse_id::<DocumentId>(&document)?;
            let access = AccessType::from(access);
            let allowed = store.check_document_access(user_id, document_id, access)?;
            Ok(json!({
                "user_id": user_id,
                "document_id": document_id,
                "access": access,
                "allowed": allowed,
            }))
        }
    }
}

fn run_workflow(
    command: WorkflowCommand,
    engine: &mut ProcessEngine<DirectoryIdentity>,
) -> Result<Value> {
    match command {
        WorkflowCommand::Publish { file, actor } => {
            let definition = WorkflowDefinition::from_path(&file)?;
            let created_by = optional_actor(engine, actor.as_deref())?;
            to_value(engine.store_mut().publish_workflow(&definition, created_by)?)
        }
        WorkflowCommand::Edit { id, file, actor } => {
            let workflow_id = parse_id::<WorkflowId>(&id)?;
            let definition = WorkflowDefinition::from_path(&file)?;
            let edited_by = optional_actor(engine, actor.as_deref())?;
            to_value(
                engine
                    .store_mut()
                    .edit_workflow(workflow_id, &definition, edited_by)?,
            )
        }
        WorkflowCommand::Show { id } => to_value(engine.store().get_workflow(parse_id(&id)?)?),
        WorkflowCommand::List { active_only } => {
            to_value(engine.store().list_workflows(active_only)?)
        }
        WorkflowCommand::Delete { id } => {
            let workflow_id = parse_id::<WorkflowId>(&id)?;
            engine.store_mut().delete_workflow(workflow_id)?;
            Ok(json!({ "deleted": workflow_id }))
        }
    }
}

fn run_process(
    command: ProcessCommand,
    engine: &mut ProcessEngine<DirectoryIdentity>,
) -> Result<Value> {
    match command {
        ProcessCommand::Initiate {
            actor,
            workflow,
            name,
            documents,
        } => {
            let document_ids = documents
                .iter()
                .map(|raw| parse_id::<DocumentId>(raw))
                .collect::<Result<Vec<_>>>()?;
            to_value(engine.initiate(&actor, parse_id(&workflow)?, &name, document_ids)?)
        }
        ProcessCommand::Show { id } => to_value(engine.store().get_process(parse_id(&id)?)?),
        ProcessCommand::History { id } => {
            to_value(engine.store().list_document_history(parse_id(&id)?)?)
        }
        ProcessCommand::Advance { id } => {
            to_value(engine.store_mut().check_and_advance(parse_id(&id)?)?)
        }
        ProcessCommand::Escalate { progress } => to_value(
            engine
                .store_mut()
                .escalate_assignment(parse_id::<ProgressId>(&progress)?)?,
        ),
    }
}

fn run_step(command: StepCommand, engine: &mut ProcessEngine<DirectoryIdentity>) -> Result<Value> {
    match command {
        StepCommand::Claim { actor, id } => {
            to_value(engine.claim(&actor, parse_id::<StepInstanceId>(&id)?)?)
        }
        StepCommand::Complete { actor, id } => {
            to_value(engine.complete(&actor, parse_id::<StepInstanceId>(&id)?)?)
        }
        StepCommand::Inbox { actor } => to_value(engine.inbox(&actor)?),
    }
}

fn run_query(
    command: QueryCommand,
    engine: &mut ProcessEngine<DirectoryIdentity>,
) -> Result<Value> {
    match command {
        QueryCommand::Raise(args) => {
            let actor = engine.authenticate(&args.actor)?;
            let delegate = match args.delegate.as_deref() {
                Some(raw) => Some(Delegation {
                    assignee_id: parse_id(raw)?,
                    step_name: args.delegate_step,
                }),
                None => None,
            };
            let request = RaiseQuery {
                process_id: parse_id(&args.process)?,
                step_instance_id: parse_id(&args.step_instance)?,
                actor_id: actor.user_id,
                text: args.text,
                document_changes: parse_document_changes(&args.documents)?,
                document_summaries: parse_summaries(&args.summaries)?,
                delegate,
            };
            to_value(engine.raise_query(&args.actor, request)?)
        }
        QueryCommand::Resolve {
            actor,
            id,
            answer,
            documents,
        } => {
            let changes = parse_document_changes(&documents)?;
            to_value(engine.resolve_query(&actor, parse_id::<QueryId>(&id)?, &answer, &changes)?)
        }
        QueryCommand::List { process } => {
            to_value(engine.store().list_queries(parse_id(&process)?)?)
        }
    }
}

fn optional_actor(
    engine: &ProcessEngine<DirectoryIdentity>,
    credential: Option<&str>,
) -> Result<Option<UserId>> {
    credential
        .map(|value| engine.authenticate(value).map(|actor| actor.user_id))
        .transpose()
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn parse_id<T>(raw: &str) -> Result<T>
where
    T: std::str::FromStr<Err = WorkflowError>,
{
    Ok(raw.trim().parse::<T>()?)
}

fn parse_optional<T>(raw: Option<&str>) -> Result<Option<T>>
where
    T: std::str::FromStr<Err = WorkflowError>,
{
    raw.map(parse_id::<T>).transpose()
}

fn parse_document_changes(raw: &[String]) -> Result<Vec<DocumentChange>> {
    raw.iter()
        .map(|entry| {
            let (document, replaced) = match entry.split_once(':') {
                Some((document, replaced)) => (document, Some(replaced)),
                None => (entry.as_str(), None),
            };
            Ok(DocumentChange {
                document_id: parse_id(document)?,
                replaces_document_id: parse_optional(replaced)?,
            })
        })
        .collect()
}

fn parse_summaries(raw: &[String]) -> Result<Vec<DocumentSummary>> {
    raw.iter()
        .map(|entry| {
            let Some((document, feedback)) = entry.split_once('=') else {
                return Err(WorkflowError::Validation(format!(
                    "summary `{entry}` MUST look like <document>=<feedback>"
                ))
                .into());
            };
            Ok(DocumentSummary {
                document_id: parse_id(document)?,
                feedback: feedback.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn execute(store: SqliteProcessStore, args: &[&str]) -> Result<Value> {
        let mut argv = vec!["docflow"];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv)?;
        run_command(cli.command, store)
    }

    #[test]
    fn document_changes_accept_optional_replacement() {
        let new_doc = DocumentId::new();
        let old_doc = DocumentId::new();
        let changes = must(parse_document_changes(&[
            new_doc.to_string(),
            format!("{new_doc}:{old_doc}"),
        ]));
        assert_eq!(changes[0].replaces_document_id, None);
        assert_eq!(changes[1].replaces_document_id, Some(old_doc));
    }

    #[test]
    fn malformed_summary_is_a_validation_error() {
        let err = match parse_summaries(&["no separator".to_string()]) {
            Ok(value) => panic!("expected failure, got {value:?}"),
            Err(err) => err,
        };
        assert_eq!(docflow_store_sqlite::error_code(&err), "validation");
    }

    #[test]
    fn malformed_ids_are_validation_errors() {
        let err = match parse_id::<UserId>("not-a-ulid") {
            Ok(value) => panic!("expected failure, got {value:?}"),
            Err(err) => err,
        };
        assert_eq!(docflow_store_sqlite::error_code(&err), "validation");
    }

    #[test]
    fn directory_commands_return_created_records() {
        let store = must(open_store(Path::new(":memory:"), None));
        let value = must(execute(store, &["directory", "user", "--username", "alice"]));
        assert_eq!(value["username"], json!("alice"));
        assert!(value["user_id"].is_string());
    }

    #[test]
    fn unknown_actor_is_unauthenticated() {
        let store = must(open_store(Path::new(":memory:"), None));
        let err = match execute(store, &["step", "inbox", "--as", "nobody"]) {
            Ok(value) => panic!("expected failure, got {value}"),
            Err(err) => err,
        };
        assert_eq!(docflow_store_sqlite::error_code(&err), "unauthenticated");
    }
}
