use std::path::Path;

use anyhow::Result;
use docflow_core::{
    AccessType, ActionType, Assignment, AssignmentDefinition, DepartmentScope, Direction,
    HierarchyConfig, NotificationType, ProcessId, ProcessStatus, QueryStatus, RoleId,
    StepDefinition, StepInstance, StepInstanceId, StepStatus, UserId, WorkflowDefinition,
};
use docflow_store_sqlite::{
    error_code, AdvanceState, Delegation, InitiateProcess, ProcessView, RaiseQuery,
    SqliteProcessStore,
};

fn must<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err:#}"),
    }
}

fn expect_code<T: std::fmt::Debug>(result: Result<T>, code: &str) {
    match result {
        Ok(value) => panic!("expected {code}, got {value:?}"),
        Err(err) => assert_eq!(error_code(&err), code, "{err:#}"),
    }
}

fn store() -> SqliteProcessStore {
    let store = must(SqliteProcessStore::open(Path::new(":memory:")));
    must(store.migrate());
    store
}

fn user_step(name: &str, users: Vec<UserId>) -> StepDefinition {
    StepDefinition {
        step_name: name.to_string(),
        allow_parallel: false,
        requires_document: false,
        assignments: vec![AssignmentDefinition {
            assignee: Assignment::User { user_ids: users },
            action_type: ActionType::Approval,
            access_types: vec![AccessType::Read],
        }],
    }
}

fn initiate(
    store: &mut SqliteProcessStore,
    definition: &WorkflowDefinition,
    initiator: UserId,
) -> ProcessView {
    let workflow = must(store.publish_workflow(definition, Some(initiator)));
    must(store.initiate_process(&InitiateProcess {
        workflow_id: workflow.workflow_id,
        initiator_id: initiator,
        name: format!("{} run", definition.name),
        document_ids: Vec::new(),
    }))
}

fn open_instance(store: &SqliteProcessStore, process_id: ProcessId, user: UserId) -> StepInstance {
    let view = must(store.get_process(process_id));
    let mut matching = view
        .instances
        .into_iter()
        .filter(|instance| instance.assigned_to == user && instance.status.is_open());
    match (matching.next(), matching.next()) {
        (Some(instance), None) => instance,
        _ => panic!("expected exactly one open instance for {user}"),
    }
}

fn step_number(view: &ProcessView) -> Option<u32> {
    view.current_step.as_ref().map(|step| step.step_number)
}

fn decide(store: &mut SqliteProcessStore, instance: StepInstanceId, user: UserId) {
    must(store.claim_step(instance, user));
    must(store.complete_step(instance, user));
}

#[test]
fn linear_user_workflow_advances_then_completes() {
    let mut store = store();
    let initiator = must(store.create_user("initiator")).user_id;
    let u1 = must(store.create_user("u1")).user_id;
    let u2 = must(store.create_user("u2")).user_id;
    let view = initiate(
        &mut store,
        &WorkflowDefinition {
            name: "Linear".to_string(),
            description: None,
            steps: vec![user_step("Draft", vec![u1]), user_step("Sign", vec![u2])],
        },
        initiator,
    );
    let process_id = view.process.process_id;
    assert_eq!(step_number(&view), Some(1));
    assert!(must(store.list_inbox(u2)).is_empty());

    let first = open_instance(&store, process_id, u1);
    must(store.claim_step(first.step_instance_id, u1));
    let outcome = must(store.complete_step(first.step_instance_id, u1));
    assert_eq!(outcome.advance.advanced_to, vec![2]);
    assert_eq!(outcome.advance.state, AdvanceState::Waiting { step_number: 2 });

    let view = must(store.get_process(process_id));
    assert_eq!(view.process.status, ProcessStatus::InProgress);
    assert_eq!(step_number(&view), Some(2));

    let second = open_instance(&store, process_id, u2);
    must(store.claim_step(second.step_instance_id, u2));
    let outcome = must(store.complete_step(second.step_instance_id, u2));
    assert_eq!(outcome.advance.state, AdvanceState::Completed);

    let view = must(store.get_process(process_id));
    assert_eq!(view.process.status, ProcessStatus::Completed);
    assert_eq!(view.process.current_step_id, None);
    assert!(view.process.completed_at.is_some());
    assert!(view.progress.iter().all(|progress| progress.completed));

    let initiator_notes = must(store.list_notifications(initiator));
    assert!(initiator_notes.iter().any(|note| {
        note.notification_type == NotificationType::StepCompleted
            && note.metadata.get("process_completed") == Some(&serde_json::json!(true))
    }));
}

#[test]
fn role_claim_is_exclusive_and_completes_the_assignment() {
    let mut store = store();
    let initiator = must(store.create_user("initiator")).user_id;
    let role = must(store.create_role("Approver", None, None));
    let u1 = must(store.create_user("u1")).user_id;
    let u2 = must(store.create_user("u2")).user_id;
    must(store.assign_user_role(u1, role.role_id, None));
    must(store.assign_user_role(u2, role.role_id, None));

    let view = initiate(
        &mut store,
        &WorkflowDefinition {
            name: "Role".to_string(),
            description: None,
            steps: vec![StepDefinition {
                step_name: "Approve".to_string(),
                allow_parallel: false,
                requires_document: false,
                assignments: vec![AssignmentDefinition {
                    assignee: Assignment::Role {
                        role_ids: vec![role.role_id],
                        hierarchy: HierarchyConfig::default(),
                    },
                    action_type: ActionType::Approval,
                    access_types: vec![AccessType::Read],
                }],
            }],
        },
        initiator,
    );
    let process_id = view.process.process_id;
    let first = open_instance(&store, process_id, u1);
    let second = open_instance(&store, process_id, u2);

    let outcome = must(store.claim_step(second.step_instance_id, u2));
    assert_eq!(outcome.superseded, vec![first.step_instance_id]);
    assert!(outcome.progress_completed);
    assert_eq!(outcome.advance.state, AdvanceState::Waiting { step_number: 1 });

    let view = must(store.get_process(process_id));
    assert_eq!(view.instances.len(), 1);
    assert!(view.progress.iter().all(|progress| progress.completed));
    assert!(!view.instances.iter().any(|instance| {
        instance.role_id == Some(role.role_id) && instance.status == StepStatus::Pending
    }));
    expect_code(store.claim_step(first.step_instance_id, u1), "already_claimed");

    let outcome = must(store.complete_step(second.step_instance_id, u2));
    assert_eq!(outcome.advance.state, AdvanceState::Completed);
}

#[test]
fn query_recirculates_first_step_and_resumes_after_resolution() {
    let mut store = store();
    let initiator = must(store.create_user("initiator")).user_id;
    let u1 = must(store.create_user("u1")).user_id;
    let u3 = must(store.create_user("u3")).user_id;
    let view = initiate(
        &mut store,
        &WorkflowDefinition {
            name: "Recirculate".to_string(),
            description: None,
            steps: vec![user_step("Prepare", vec![u1]), user_step("Check", vec![u3])],
        },
        initiator,
    );
    let process_id = view.process.process_id;
    let prepare = open_instance(&store, process_id, u1);
    decide(&mut store, prepare.step_instance_id, u1);

    let check = open_instance(&store, process_id, u3);
    must(store.claim_step(check.step_instance_id, u3));
    let raised = must(store.raise_query(&RaiseQuery {
        process_id,
        step_instance_id: check.step_instance_id,
        actor_id: u3,
        text: "Totals on page 3 do not match".to_string(),
        document_changes: Vec::new(),
        document_summaries: Vec::new(),
        delegate: Some(Delegation {
            assignee_id: u1,
            step_name: None,
        }),
    }));
    assert_eq!(raised.instance.status, StepStatus::ForRecirculation);
    assert_eq!(raised.reset, vec![prepare.step_instance_id]);
    assert_eq!(raised.query.addressed_to, u1);
    assert_eq!(raised.advance.state, AdvanceState::Waiting { step_number: 1 });

    let view = must(store.get_process(process_id));
    assert_eq!(step_number(&view), Some(2));
    assert!(view.blocked_by_query);
    let reopened = open_instance(&store, process_id, u1);
    assert_eq!(reopened.step_instance_id, prepare.step_instance_id);
    assert_eq!(reopened.status, StepStatus::Pending);
    assert_eq!(reopened.recirculation_cycle, 1);
    assert_eq!(reopened.picked_by_id, None);
    expect_code(
        store.complete_step(check.step_instance_id, u3),
        "recirculation_pending",
    );
    expect_code(
        store.claim_step(check.step_instance_id, u3),
        "recirculation_pending",
    );

    let resolved = must(store.resolve_query(raised.query.query_id, u1, "Fixed the totals", &[]));
    assert_eq!(resolved.query.status, QueryStatus::Resolved);
    assert_eq!(resolved.advance.state, AdvanceState::Waiting { step_number: 1 });
    assert!(resolved.advance.resumed.is_empty());

    must(store.claim_step(prepare.step_instance_id, u1));
    let redecided = must(store.complete_step(prepare.step_instance_id, u1));
    assert_eq!(redecided.advance.resumed, vec![check.step_instance_id]);
    assert_eq!(redecided.advance.state, AdvanceState::Waiting { step_number: 2 });
    assert!(redecided.advance.advanced_to.is_empty());

    let resumed = open_instance(&store, process_id, u3);
    assert_eq!(resumed.status, StepStatus::Pending);
    assert_eq!(resumed.recirculation_reason, None);
    decide(&mut store, resumed.step_instance_id, u3);

    let view = must(store.get_process(process_id));
    assert_eq!(view.process.status, ProcessStatus::Completed);
    assert!(view.process.is_recirculated);
    assert!(!view.blocked_by_query);
}

#[test]
fn open_query_holds_the_current_step() {
    let mut store = store();
    let initiator = must(store.create_user("initiator")).user_id;
    let reviewer = must(store.create_user("reviewer")).user_id;
    let helper = must(store.create_user("helper")).user_id;
    let signer = must(store.create_user("signer")).user_id;
    let view = initiate(
        &mut store,
        &WorkflowDefinition {
            name: "Blocked".to_string(),
            description: None,
            steps: vec![
                user_step("Review", vec![reviewer]),
                user_step("Sign", vec![signer]),
            ],
        },
        initiator,
    );
    let process_id = view.process.process_id;
    let review = open_instance(&store, process_id, reviewer);
    must(store.claim_step(review.step_instance_id, reviewer));

    let raised = must(store.raise_query(&RaiseQuery {
        process_id,
        step_instance_id: review.step_instance_id,
        actor_id: reviewer,
        text: "Need the signed annex".to_string(),
        document_changes: Vec::new(),
        document_summaries: Vec::new(),
        delegate: Some(Delegation {
            assignee_id: helper,
            step_name: Some("Review".to_string()),
        }),
    }));
    let helper_instance = match raised.delegate_instance {
        Some(instance) => instance,
        None => panic!("expected a delegate instance"),
    };

    decide(&mut store, helper_instance.step_instance_id, helper);
    let before = must(store.get_process(process_id));
    let advance = must(store.check_and_advance(process_id));
    assert_eq!(advance.state, AdvanceState::Waiting { step_number: 1 });
    let after = must(store.get_process(process_id));
    assert_eq!(before.process.current_step_id, after.process.current_step_id);
    assert!(must(store.list_inbox(signer)).is_empty());

    must(store.resolve_query(raised.query.query_id, helper, "Annex attached", &[]));
    let parked = open_instance(&store, process_id, reviewer);
    assert_eq!(parked.status, StepStatus::Pending);
    decide(&mut store, parked.step_instance_id, reviewer);

    let view = must(store.get_process(process_id));
    assert_eq!(step_number(&view), Some(2));
    assert_eq!(must(store.list_inbox(signer)).len(), 1);
}

#[test]
fn department_hierarchy_escalates_upwards_one_level_at_a_time() {
    let mut store = store();
    let initiator = must(store.create_user("initiator")).user_id;
    let finance = must(store.create_department("Finance")).department_id;
    let director = must(store.create_role("Director", None, Some(finance))).role_id;
    let manager = must(store.create_role("Manager", Some(director), Some(finance))).role_id;
    let clerk_a = must(store.create_role("Payables Clerk", Some(manager), Some(finance))).role_id;
    let clerk_b =
        must(store.create_role("Receivables Clerk", Some(manager), Some(finance))).role_id;

    let staff = |store: &mut SqliteProcessStore, name: &str, role| {
        let user = must(store.create_user(name)).user_id;
        must(store.assign_user_role(user, role, Some(finance)));
        user
    };
    let payables_1 = staff(&mut store, "payables-1", clerk_a);
    let payables_2 = staff(&mut store, "payables-2", clerk_a);
    let receivables = staff(&mut store, "receivables", clerk_b);
    let manager_user = staff(&mut store, "manager", manager);
    let director_user = staff(&mut store, "director", director);

    let view = initiate(
        &mut store,
        &WorkflowDefinition {
            name: "Invoice".to_string(),
            description: None,
            steps: vec![StepDefinition {
                step_name: "Finance sign-off".to_string(),
                allow_parallel: false,
                requires_document: false,
                assignments: vec![AssignmentDefinition {
                    assignee: Assignment::Department {
                        departments: vec![DepartmentScope {
                            department_id: finance,
                            role_ids: vec![director, manager, clerk_a, clerk_b],
                        }],
                        hierarchy: HierarchyConfig {
                            direction: Direction::Upwards,
                            allow_parallel: false,
                        },
                    },
                    action_type: ActionType::Approval,
                    access_types: vec![AccessType::Read],
                }],
            }],
        },
        initiator,
    );
    let process_id = view.process.process_id;
    let levels = match view.progress[0].role_hierarchy.as_ref() {
        Some(hierarchy) => hierarchy.levels().to_vec(),
        None => panic!("expected a role hierarchy"),
    };
    assert_eq!(levels.len(), 3);
    assert_eq!(levels[1], vec![manager]);
    assert_eq!(levels[2], vec![director]);
    assert_eq!(view.instances.len(), 3);
    assert!(view.instances.iter().all(|instance| instance.level == 0));

    let claim = open_instance(&store, process_id, payables_1);
    let outcome = must(store.claim_step(claim.step_instance_id, payables_1));
    assert_eq!(outcome.superseded.len(), 1);
    assert!(!outcome.progress_completed);
    expect_code(
        store.claim_step(open_instance_id(&outcome.superseded), payables_2),
        "already_claimed",
    );
    must(store.complete_step(claim.step_instance_id, payables_1));
    assert!(must(store.list_inbox(manager_user)).is_empty());

    let receivables_instance = open_instance(&store, process_id, receivables);
    decide(&mut store, receivables_instance.step_instance_id, receivables);

    let view = must(store.get_process(process_id));
    assert_eq!(view.progress[0].current_level, 1);
    let pending: Vec<&StepInstance> = view
        .instances
        .iter()
        .filter(|instance| instance.status == StepStatus::Pending)
        .collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].assigned_to, manager_user);
    assert_eq!(pending[0].role_id, Some(manager));
    assert_eq!(pending[0].level, 1);
    assert!(must(store.list_inbox(director_user)).is_empty());

    decide(&mut store, pending[0].step_instance_id, manager_user);
    let top = open_instance(&store, process_id, director_user);
    assert_eq!(top.level, 2);
    decide(&mut store, top.step_instance_id, director_user);

    let view = must(store.get_process(process_id));
    assert_eq!(view.process.status, ProcessStatus::Completed);
    assert!(view.progress[0].completed);
}

fn open_instance_id(superseded: &[StepInstanceId]) -> StepInstanceId {
    match superseded {
        [only] => *only,
        _ => panic!("expected exactly one superseded instance"),
    }
}

#[test]
fn role_without_members_completes_vacuously() {
    let mut store = store();
    let initiator = must(store.create_user("initiator")).user_id;
    let signer = must(store.create_user("signer")).user_id;
    let empty_role = must(store.create_role("Auditor", None, None)).role_id;

    let view = initiate(
        &mut store,
        &WorkflowDefinition {
            name: "Vacuous".to_string(),
            description: None,
            steps: vec![
                StepDefinition {
                    step_name: "Audit".to_string(),
                    allow_parallel: false,
                    requires_document: false,
                    assignments: vec![AssignmentDefinition {
                        assignee: Assignment::Role {
                            role_ids: vec![empty_role],
                            hierarchy: HierarchyConfig::default(),
                        },
                        action_type: ActionType::Review,
                        access_types: vec![AccessType::Read],
                    }],
                },
                user_step("Sign", vec![signer]),
            ],
        },
        initiator,
    );
    assert_eq!(step_number(&view), Some(2));
    assert_eq!(must(store.list_inbox(signer)).len(), 1);
}

/// Completion flag and completed roles of the process's DEPARTMENT progress.
fn department_progress(store: &SqliteProcessStore, process_id: ProcessId) -> (bool, Vec<RoleId>) {
    let view = must(store.get_process(process_id));
    let mut rows = view.progress.into_iter().filter_map(|progress| {
        progress
            .department
            .map(|department| (progress.completed, department))
    });
    match (rows.next(), rows.next()) {
        (Some((completed, department)), None) => (completed, department.completed_roles),
        _ => panic!("expected exactly one department progress row"),
    }
}

#[test]
fn department_roles_accumulate_until_every_required_role_claims() {
    let mut store = store();
    let initiator = must(store.create_user("initiator")).user_id;
    let reviewer = must(store.create_user("reviewer")).user_id;
    let finance = must(store.create_department("Finance")).department_id;
    let clerk = must(store.create_role("Clerk", None, Some(finance))).role_id;
    let auditor = must(store.create_role("Auditor", None, Some(finance))).role_id;
    let clerk_user = must(store.create_user("clerk")).user_id;
    let auditor_user = must(store.create_user("auditor")).user_id;
    must(store.assign_user_role(clerk_user, clerk, Some(finance)));
    must(store.assign_user_role(auditor_user, auditor, Some(finance)));

    let view = initiate(
        &mut store,
        &WorkflowDefinition {
            name: "Sign-off".to_string(),
            description: None,
            steps: vec![
                StepDefinition {
                    step_name: "Finance".to_string(),
                    allow_parallel: false,
                    requires_document: false,
                    assignments: vec![AssignmentDefinition {
                        assignee: Assignment::Department {
                            departments: vec![DepartmentScope {
                                department_id: finance,
                                role_ids: vec![clerk, auditor],
                            }],
                            hierarchy: HierarchyConfig {
                                direction: Direction::Downwards,
                                allow_parallel: true,
                            },
                        },
                        action_type: ActionType::Approval,
                        access_types: vec![AccessType::Read],
                    }],
                },
                user_step("Review", vec![reviewer]),
            ],
        },
        initiator,
    );
    let process_id = view.process.process_id;
    assert_eq!(view.instances.len(), 2);
    assert_eq!(department_progress(&store, process_id), (false, Vec::new()));

    let clerk_instance = open_instance(&store, process_id, clerk_user).step_instance_id;
    let outcome = must(store.claim_step(clerk_instance, clerk_user));
    assert!(!outcome.progress_completed);
    assert_eq!(department_progress(&store, process_id), (false, vec![clerk]));

    let auditor_instance = open_instance(&store, process_id, auditor_user).step_instance_id;
    let outcome = must(store.claim_step(auditor_instance, auditor_user));
    assert!(outcome.progress_completed);
    assert_eq!(outcome.advance.state, AdvanceState::Waiting { step_number: 1 });
    let (completed, mut roles) = department_progress(&store, process_id);
    roles.sort();
    let mut required = vec![clerk, auditor];
    required.sort();
    assert!(completed);
    assert_eq!(roles, required);

    must(store.complete_step(clerk_instance, clerk_user));
    let outcome = must(store.complete_step(auditor_instance, auditor_user));
    assert_eq!(outcome.advance.state, AdvanceState::Waiting { step_number: 2 });

    let review = open_instance(&store, process_id, reviewer).step_instance_id;
    must(store.claim_step(review, reviewer));
    let raised = must(store.raise_query(&RaiseQuery {
        process_id,
        step_instance_id: review,
        actor_id: reviewer,
        text: "Totals disagree with the ledger".to_string(),
        document_changes: Vec::new(),
        document_summaries: Vec::new(),
        delegate: None,
    }));
    let mut reset = raised.reset.clone();
    reset.sort();
    let mut expected_reset = vec![clerk_instance, auditor_instance];
    expected_reset.sort();
    assert_eq!(reset, expected_reset);
    assert_eq!(department_progress(&store, process_id), (false, Vec::new()));

    must(store.claim_step(clerk_instance, clerk_user));
    assert_eq!(department_progress(&store, process_id), (false, vec![clerk]));
}
