mod common;

use common::*;
use serde_json::json;
use uuid::Uuid;

use compass_backend::services::Entity;
use compass_backend::workflows::{ExecutionContext, SaveWorkflow};
use compass_shared::{AlertSeverity, ApprovalStatus, Event, ExecutionStatus, StepKind};

async fn only_execution(h: &Harness, event: Event) -> compass_shared::Execution {
    let ids = h.engine.handle_event(&event).await;
    assert_eq!(ids.len(), 1, "expected exactly one execution");
    h.engine.get_execution(ids[0]).await.unwrap()
}

fn approval_flow(third: serde_json::Value) -> serde_json::Value {
    chain(
        "lead.created",
        vec![
            set_field("s1", "stage", json!("review")),
            node("s2", "approval", json!({"message": "Manager sign-off"})),
            third,
        ],
    )
}

fn notify(id: &str) -> serde_json::Value {
    node(
        id,
        "send_email",
        json!({"to": "{{ object.email }}", "subject": "Lead {{ object.name }} approved", "body": "Score {{ score }}"}),
    )
}

#[tokio::test]
async fn test_trigger_condition_matches_on_score() {
    let h = harness();
    let nodes = vec![
        trigger("lead.created", json!({"score": {"operator": "gt", "value": 50}})),
        set_field("s1", "hot", json!(true)),
    ];
    let workflow = h.save("Hot leads", graph(nodes, vec![edge("trigger", "s1")])).await;

    let hot = h.engine.evaluate_trigger(&Event::new("lead.created", json!({"score": 85}))).await;
    assert_eq!(hot.iter().map(|w| w.id).collect::<Vec<_>>(), vec![workflow.id]);

    let cold = Event::new("lead.created", json!({"score": 10}));
    assert!(h.engine.evaluate_trigger(&cold).await.is_empty());
    // evaluating again gives the same answer
    assert!(h.engine.evaluate_trigger(&cold).await.is_empty());

    assert!(h
        .engine
        .evaluate_trigger(&Event::new("lead.updated", json!({"score": 85})))
        .await
        .is_empty());
    assert!(h
        .engine
        .evaluate_trigger(&Event::new("lead.created", json!({"score": 85})).for_tenant(Uuid::new_v4()))
        .await
        .is_empty());
}

#[tokio::test]
async fn test_empty_conditions_match_on_event_type_alone() {
    let h = harness();
    h.save("Any case", chain("case.created", vec![])).await;

    assert_eq!(h.engine.evaluate_trigger(&Event::new("case.created", json!({}))).await.len(), 1);
    assert_eq!(
        h.engine
            .evaluate_trigger(&Event::new("case.created", json!({"anything": [1, 2]})))
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn test_inactive_workflow_never_triggers() {
    let h = harness();
    h.engine
        .save(SaveWorkflow {
            name: "Paused".to_string(),
            builder_data: chain("lead.created", vec![set_field("s1", "x", json!(1))]),
            is_active: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(h.engine.handle_event(&Event::new("lead.created", json!({}))).await.is_empty());
}

#[tokio::test]
async fn test_approval_then_approve_completes_once() {
    let h = harness();
    h.entities
        .insert(Entity::new("lead", "1", json!({"name": "Ada", "email": "ada@example.com"})))
        .await;
    h.save("Approval flow", approval_flow(notify("s3"))).await;

    let execution = only_execution(&h, Event::new("lead.created", json!({"lead_id": "1", "score": 85}))).await;
    assert_eq!(execution.status, ExecutionStatus::WaitingForApproval);
    assert_eq!(execution.current_step_pointer, Some(2));
    assert!(h.mailer.sent().is_empty());

    let approvals = h.engine.approvals(execution.id).await.unwrap();
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].status, ApprovalStatus::Pending);

    let approval = h.engine.approve(execution.id, Some(Uuid::new_v4()), None).await.unwrap();
    assert_eq!(approval.status, ApprovalStatus::Approved);
    assert!(h.engine.resume_workflow(execution.id).await);

    let finished = h.engine.get_execution(execution.id).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert!(finished.completed_at.is_some());
    assert!(finished.execution_time_ms.is_some());
    assert_eq!(finished.executed_labels(), vec!["s1".to_string(), "s3".to_string()]);

    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec!["ada@example.com".to_string()]);
    assert_eq!(sent[0].subject, "Lead Ada approved");
    assert_eq!(sent[0].body, "Score 85");

    // second resume of the same execution does nothing
    assert!(!h.engine.resume_workflow(execution.id).await);
    assert_eq!(h.mailer.sent().len(), 1);
}

#[tokio::test]
async fn test_resume_before_decision_is_refused() {
    let h = harness();
    h.entities.insert(Entity::new("lead", "1", json!({}))).await;
    h.save("Approval flow", approval_flow(set_field("s3", "done", json!(true)))).await;

    let execution = only_execution(&h, Event::new("lead.created", json!({"lead_id": "1"}))).await;
    assert!(!h.engine.resume_workflow(execution.id).await);
    assert_eq!(
        h.engine.get_execution(execution.id).await.unwrap().status,
        ExecutionStatus::WaitingForApproval
    );
}

#[tokio::test]
async fn test_reject_fails_execution_without_running_later_steps() {
    let h = harness();
    h.entities.insert(Entity::new("lead", "1", json!({}))).await;
    h.save("Approval flow", approval_flow(set_field("s3", "done", json!(true)))).await;

    let execution = only_execution(&h, Event::new("lead.created", json!({"lead_id": "1"}))).await;
    let approver = Uuid::new_v4();
    h.engine
        .reject(execution.id, Some(approver), Some("Budget".to_string()))
        .await
        .unwrap();

    assert!(!h.engine.resume_workflow(execution.id).await);

    let failed = h.engine.get_execution(execution.id).await.unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(
        failed.error_message,
        Some(format!("Rejected by {}: Budget", approver))
    );
    assert!(h.entities.get("lead", "1").await.unwrap().get("done").is_none());

    let alerts = h.engine.alerts(execution.id).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, AlertSeverity::High);
}

#[tokio::test]
async fn test_double_decision_conflicts() {
    let h = harness();
    h.entities.insert(Entity::new("lead", "1", json!({}))).await;
    h.save("Approval flow", approval_flow(set_field("s3", "done", json!(true)))).await;

    let execution = only_execution(&h, Event::new("lead.created", json!({"lead_id": "1"}))).await;
    h.engine.approve(execution.id, None, None).await.unwrap();
    assert!(matches!(
        h.engine.reject(execution.id, None, None).await,
        Err(compass_backend::workflows::EngineError::Conflict(_))
    ));
}

#[tokio::test]
async fn test_update_field_on_missing_instance_fails_execution() {
    let h = harness();
    h.save(
        "Qualify",
        chain("lead.created", vec![set_field("s1", "status", json!("qualified"))]),
    )
    .await;

    let execution = only_execution(&h, Event::new("lead.created", json!({"lead_id": "404"}))).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error_message.unwrap_or_default().contains("s1"));

    let log = h.engine.get_execution(execution.id).await.unwrap().logged_steps();
    assert_eq!(log.len(), 1);
    assert!(!log[0].success);
}

#[tokio::test]
async fn test_branch_runs_exactly_one_path() {
    let h = harness();
    h.entities.insert(Entity::new("lead", "1", json!({}))).await;
    let nodes = vec![
        trigger("lead.created", json!({})),
        node("check", "condition", json!({"field": "score", "operator": "gt", "value": 50})),
        set_field("hot", "temperature", json!("hot")),
        set_field("cold", "temperature", json!("cold")),
        set_field("tail", "seen", json!(true)),
    ];
    let edges = vec![
        edge("trigger", "check"),
        branch_edge("check", "hot", true),
        branch_edge("check", "cold", false),
        edge("hot", "tail"),
        edge("cold", "tail"),
    ];
    h.save("Temperature", graph(nodes, edges)).await;

    let hot = only_execution(&h, Event::new("lead.created", json!({"lead_id": "1", "score": 85}))).await;
    assert_eq!(hot.status, ExecutionStatus::Completed);
    assert_eq!(hot.executed_labels(), vec!["hot".to_string(), "tail".to_string()]);
    let branch = hot
        .logged_steps()
        .into_iter()
        .find(|e| e.kind == StepKind::Branch)
        .unwrap();
    assert!(branch.success);

    let cold = only_execution(&h, Event::new("lead.created", json!({"lead_id": "1", "score": 10}))).await;
    assert_eq!(cold.executed_labels(), vec!["cold".to_string(), "tail".to_string()]);
    assert_eq!(
        h.entities.get("lead", "1").await.unwrap().get("temperature"),
        Some(&json!("cold"))
    );
}

#[tokio::test]
async fn test_branch_on_context_object() {
    let h = harness();
    h.entities.insert(Entity::new("opportunity", "9", json!({"amount": 20000}))).await;
    let nodes = vec![
        trigger("opportunity.created", json!({})),
        node("big", "condition", json!({"field": "object.amount", "operator": "gte", "value": 10000})),
        node("task", "create_task", json!({"title": "Review large deal", "require_related_object": true})),
    ];
    let edges = vec![edge("trigger", "big"), branch_edge("big", "task", true)];
    h.save("Large deals", graph(nodes, edges)).await;

    let execution =
        only_execution(&h, Event::new("opportunity.created", json!({"opportunity_id": "9"}))).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let tasks = h.entities.tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].related_type.as_deref(), Some("opportunity"));
}

#[tokio::test]
async fn test_resave_bumps_version_and_pins_running_execution() {
    let h = harness();
    h.entities.insert(Entity::new("lead", "1", json!({}))).await;
    let v1 = h
        .save("Versioned", approval_flow(set_field("s3", "tag", json!("v1"))))
        .await;
    assert_eq!(v1.version, 1);

    let execution = only_execution(&h, Event::new("lead.created", json!({"lead_id": "1"}))).await;
    assert_eq!(execution.workflow_version, 1);

    let v2 = h
        .engine
        .save(SaveWorkflow {
            id: Some(v1.id),
            name: "Versioned".to_string(),
            builder_data: chain("lead.created", vec![set_field("s9", "tag", json!("v2"))]),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(v2.id, v1.id);
    assert_eq!(v2.version, 2);

    h.engine.approve(execution.id, None, None).await.unwrap();
    assert!(h.engine.resume_workflow(execution.id).await);
    assert_eq!(
        h.entities.get("lead", "1").await.unwrap().get("tag"),
        Some(&json!("v1"))
    );

    let fresh = only_execution(&h, Event::new("lead.created", json!({"lead_id": "1"}))).await;
    assert_eq!(fresh.workflow_version, 2);
    assert_eq!(fresh.status, ExecutionStatus::Completed);
    assert_eq!(
        h.entities.get("lead", "1").await.unwrap().get("tag"),
        Some(&json!("v2"))
    );
}

#[tokio::test]
async fn test_resave_unknown_workflow_is_not_found() {
    let h = harness();
    let result = h
        .engine
        .save(SaveWorkflow {
            id: Some(Uuid::new_v4()),
            name: "Ghost".to_string(),
            builder_data: chain("lead.created", vec![]),
            ..Default::default()
        })
        .await;
    assert!(matches!(result, Err(compass_backend::workflows::EngineError::NotFound(_))));
}

#[tokio::test]
async fn test_execute_workflow_directly() {
    let h = harness();
    h.entities.insert(Entity::new("lead", "1", json!({}))).await;
    let workflow = h
        .save("Direct", chain("lead.created", vec![set_field("s1", "direct", json!(true))]))
        .await;

    let ctx = ExecutionContext::new("lead.created", json!({"lead_id": "1"}));
    assert!(h.engine.execute_workflow(workflow.id, &ctx).await);
    assert_eq!(
        h.entities.get("lead", "1").await.unwrap().get("direct"),
        Some(&json!(true))
    );
    assert_eq!(h.engine.list_executions(workflow.id, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_out_of_range_due_date_fails_execution_with_alert() {
    let h = harness();
    h.save(
        "Far future",
        chain(
            "case.created",
            vec![node(
                "task",
                "create_task",
                json!({"title": "Someday", "due_date": {"type": "relative", "value": 1_000_000_000, "unit": "days"}}),
            )],
        ),
    )
    .await;

    let execution = only_execution(&h, Event::new("case.created", json!({}))).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.completed_at.is_some());
    assert!(execution
        .error_message
        .unwrap_or_default()
        .contains("Due date out of range"));
    assert_eq!(h.engine.alerts(execution.id).await.unwrap().len(), 1);
    assert!(h.entities.tasks().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resumes_run_the_tail_once() {
    let h = harness();
    h.entities
        .insert(Entity::new("lead", "1", json!({"name": "Ada", "email": "ada@example.com"})))
        .await;
    h.save("Approval flow", approval_flow(notify("s3"))).await;

    let execution = only_execution(&h, Event::new("lead.created", json!({"lead_id": "1", "score": 85}))).await;
    h.engine.approve(execution.id, None, None).await.unwrap();

    let (first, second) = tokio::join!(
        h.engine.resume_workflow(execution.id),
        h.engine.resume_workflow(execution.id)
    );
    assert!(first ^ second, "exactly one resume should win: {} {}", first, second);

    let finished = h.engine.get_execution(execution.id).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert_eq!(finished.executed_labels(), vec!["s1".to_string(), "s3".to_string()]);
    assert_eq!(h.mailer.sent().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resumes_on_spawned_tasks() {
    let h = harness();
    h.entities.insert(Entity::new("lead", "1", json!({}))).await;
    h.save("Approval flow", approval_flow(set_field("s3", "done", json!(true)))).await;

    let execution = only_execution(&h, Event::new("lead.created", json!({"lead_id": "1"}))).await;
    h.engine.approve(execution.id, None, None).await.unwrap();

    let engine = std::sync::Arc::new(h.engine.clone());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            let id = execution.id;
            tokio::spawn(async move { engine.resume_workflow(id).await })
        })
        .collect();

    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(
        h.engine.get_execution(execution.id).await.unwrap().status,
        ExecutionStatus::Completed
    );
}
