use crate::InMemoryStateStore;
use chrono::{Duration, Utc};
use conduit_core::{
    domain::repository::{
        ConnectorInstanceRepository, FlowNodeInstanceRepository, Guard,
        ProcessDefinitionRepository, ProcessInstanceRepository, UnitOfWorkRepository,
        WorkItemRepository,
    },
    domain::work_item::WorkStatus,
    ActivationEvent, ConnectorDefinition, ConnectorInstance, ConnectorState, ContainerRef,
    ContainerState, CoreError, ExecutorId, FlowNodeInstance, ProcessDefinition,
    ProcessDefinitionId, ProcessInstance, UnitOfWork, WorkItem,
};
use serde_json::{json, Map};
use std::collections::HashMap;

fn process() -> ProcessInstance {
    let mut variables = Map::new();
    variables.insert("order".to_string(), json!(42));
    ProcessInstance::new(ProcessDefinitionId("orders".into()), variables)
}

fn connector(process: &ProcessInstance, container: &ContainerRef, name: &str, index: u32) -> ConnectorInstance {
    let definition = ConnectorDefinition {
        name: name.to_string(),
        connector_id: "noop".to_string(),
        version: "1.0.0".to_string(),
        activation_event: ActivationEvent::OnEnter,
        inputs: HashMap::new(),
        outputs: Vec::new(),
    };
    ConnectorInstance::new(process.id.clone(), container, &definition, index)
}

#[tokio::test]
async fn test_failed_guard_writes_nothing() -> Result<(), CoreError> {
    let store = InMemoryStateStore::new();
    let process = process();
    store.commit(UnitOfWork::new().save_process(process.clone())).await?;

    let node = FlowNodeInstance::new(process.id.clone(), "review");
    let unit = UnitOfWork::new()
        .guard(Guard::ProcessState {
            id: process.id.clone(),
            expected: ContainerState::Executing,
        })
        .save_flow_node(node.clone())
        .enqueue(WorkItem::advance(process.id.clone(), node.container()))
        .set_variable(process.id.clone(), "order", json!(7));

    let result = store.commit(unit).await;
    assert!(matches!(result, Err(CoreError::ConcurrentModification(_))));
    assert!(store.find_flow_node(&node.id).await?.is_none());
    assert_eq!(store.count_pending_work().await?, 0);
    let stored = store.find_process_instance(&process.id).await?.unwrap();
    assert_eq!(stored.variable("order"), Some(&json!(42)));
    Ok(())
}

#[tokio::test]
async fn test_process_upsert_keeps_merged_variables() -> Result<(), CoreError> {
    let store = InMemoryStateStore::new();
    let mut process = process();
    store.commit(UnitOfWork::new().save_process(process.clone())).await?;

    store
        .commit(UnitOfWork::new().set_variable(process.id.clone(), "approved", json!(true)))
        .await?;

    // A stale copy of the process must not wipe the merged variable
    process.transition_to(ContainerState::ExecutingOnEnterConnectors)?;
    store.commit(UnitOfWork::new().save_process(process.clone())).await?;

    let stored = store.find_process_instance(&process.id).await?.unwrap();
    assert_eq!(stored.state, ContainerState::ExecutingOnEnterConnectors);
    assert_eq!(stored.variable("approved"), Some(&json!(true)));
    assert_eq!(stored.variable("order"), Some(&json!(42)));

    let unknown = ProcessInstance::new(ProcessDefinitionId("orders".into()), Map::new());
    let result = store
        .commit(UnitOfWork::new().set_variable(unknown.id.clone(), "x", json!(1)))
        .await;
    assert!(matches!(result, Err(CoreError::ProcessInstanceNotFound(_))));
    Ok(())
}

#[tokio::test]
async fn test_claims_are_fifo_and_serialized_per_sequence() -> Result<(), CoreError> {
    let store = InMemoryStateStore::new();
    let process = process();
    let first = FlowNodeInstance::new(process.id.clone(), "a");
    let second = FlowNodeInstance::new(process.id.clone(), "b");
    let c1 = connector(&process, &first.container(), "c1", 0);

    store
        .commit(
            UnitOfWork::new()
                .save_process(process.clone())
                .enqueue(WorkItem::advance(process.id.clone(), first.container()))
                .enqueue(WorkItem::execute_connector(process.id.clone(), first.container(), c1.id.clone()))
                .enqueue(WorkItem::advance(process.id.clone(), second.container())),
        )
        .await?;

    let executor = ExecutorId::generate();
    let claimed = store.claim_next_work_item(&executor).await?.unwrap();
    assert_eq!(claimed.kind.container(), &first.container());
    assert_eq!(claimed.attempts, 1);
    assert_eq!(claimed.claimed_by.as_ref(), Some(&executor));

    // The connector work of the same flow node must wait
    let next = store.claim_next_work_item(&executor).await?.unwrap();
    assert_eq!(next.kind.container(), &second.container());
    assert!(store.claim_next_work_item(&executor).await?.is_none());

    store
        .commit(
            UnitOfWork::new()
                .guard(Guard::WorkClaimedBy {
                    id: claimed.id.clone(),
                    executor: executor.clone(),
                })
                .complete(claimed.id.clone()),
        )
        .await?;
    let third = store.claim_next_work_item(&executor).await?.unwrap();
    assert!(matches!(third.kind, conduit_core::WorkKind::ExecuteConnector { .. }));
    Ok(())
}

#[tokio::test]
async fn test_identical_pending_work_is_enqueued_once() -> Result<(), CoreError> {
    let store = InMemoryStateStore::new();
    let process = process();
    let container = process.container();

    store
        .commit(
            UnitOfWork::new()
                .save_process(process.clone())
                .enqueue(WorkItem::advance(process.id.clone(), container.clone()))
                .enqueue(WorkItem::advance(process.id.clone(), container.clone())),
        )
        .await?;
    assert_eq!(store.count_pending_work().await?, 1);

    // Once claimed, a new advance is queued behind it
    let executor = ExecutorId::generate();
    store.claim_next_work_item(&executor).await?.unwrap();
    store
        .commit(UnitOfWork::new().enqueue(WorkItem::advance(process.id.clone(), container.clone())))
        .await?;
    let queued = store.find_work_for_sequence(&container.sequence_key()).await?;
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[0].status, WorkStatus::Claimed);
    assert_eq!(queued[1].status, WorkStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn test_claim_guard_and_release() -> Result<(), CoreError> {
    let store = InMemoryStateStore::new();
    let process = process();
    store
        .commit(
            UnitOfWork::new()
                .save_process(process.clone())
                .enqueue(WorkItem::advance(process.id.clone(), process.container())),
        )
        .await?;

    let owner = ExecutorId::generate();
    let other = ExecutorId::generate();
    let item = store.claim_next_work_item(&owner).await?.unwrap();

    let stolen = UnitOfWork::new()
        .guard(Guard::WorkClaimedBy {
            id: item.id.clone(),
            executor: other.clone(),
        })
        .complete(item.id.clone());
    assert!(store.commit(stolen).await.is_err());

    store
        .commit(
            UnitOfWork::new()
                .guard(Guard::WorkClaimedBy {
                    id: item.id.clone(),
                    executor: owner.clone(),
                })
                .release(item.id.clone()),
        )
        .await?;
    let released = store.find_work_item(&item.id).await?.unwrap();
    assert_eq!(released.status, WorkStatus::Pending);
    assert!(released.claimed_by.is_none());

    let reclaimed = store.claim_next_work_item(&other).await?.unwrap();
    assert_eq!(reclaimed.id, item.id);
    assert_eq!(reclaimed.attempts, 2);
    Ok(())
}

#[tokio::test]
async fn test_only_the_claimant_refreshes_a_claim() -> Result<(), CoreError> {
    let store = InMemoryStateStore::new();
    let process = process();
    store
        .commit(
            UnitOfWork::new()
                .save_process(process.clone())
                .enqueue(WorkItem::advance(process.id.clone(), process.container())),
        )
        .await?;

    let owner = ExecutorId::generate();
    let other = ExecutorId::generate();
    let item = store.claim_next_work_item(&owner).await?.unwrap();
    let long_ago = Utc::now() - Duration::minutes(10);
    store.backdate(long_ago).await;

    assert!(!store.touch_claim(&item.id, &other).await?);
    assert_eq!(store.find_work_item(&item.id).await?.unwrap().updated_at, long_ago);

    assert!(store.touch_claim(&item.id, &owner).await?);
    let refreshed = store.find_work_item(&item.id).await?.unwrap();
    assert!(refreshed.updated_at > long_ago);
    assert!(store
        .find_stale_work_items(Utc::now() - Duration::minutes(1))
        .await?
        .is_empty());

    store.commit(UnitOfWork::new().release(item.id.clone())).await?;
    assert!(!store.touch_claim(&item.id, &owner).await?);
    Ok(())
}

#[tokio::test]
async fn test_connector_queries_and_state_guard() -> Result<(), CoreError> {
    let store = InMemoryStateStore::new();
    let process = process();
    let node = FlowNodeInstance::new(process.id.clone(), "a");
    let container = node.container();
    let second = connector(&process, &container, "second", 1);
    let first = connector(&process, &container, "first", 0);
    let elsewhere = connector(&process, &process.container(), "process-level", 0);

    store
        .commit(
            UnitOfWork::new()
                .save_process(process.clone())
                .save_flow_node(node.clone())
                .save_connector(second.clone())
                .save_connector(first.clone())
                .save_connector(elsewhere),
        )
        .await?;

    let names: Vec<String> = store
        .find_connectors_of_container(&container)
        .await?
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names, vec!["first", "second"]);

    let mut running = first.clone();
    running.start_execution()?;
    let guarded = |expected| {
        UnitOfWork::new()
            .guard(Guard::ConnectorState {
                id: first.id.clone(),
                expected,
            })
            .save_connector(running.clone())
    };
    assert!(store.commit(guarded(ConnectorState::Executing)).await.is_err());
    store.commit(guarded(ConnectorState::ToBeExecuted)).await?;
    assert!(store.commit(guarded(ConnectorState::ToBeExecuted)).await.is_err());

    let stored = store.find_connector_instance(&first.id).await?.unwrap();
    assert_eq!(stored.state, ConnectorState::Executing);
    Ok(())
}

#[tokio::test]
async fn test_stale_queries_and_no_work_guard() -> Result<(), CoreError> {
    let store = InMemoryStateStore::new();
    let process = process();
    let node = FlowNodeInstance::new(process.id.clone(), "a");
    store
        .commit(
            UnitOfWork::new()
                .save_process(process.clone())
                .save_flow_node(node.clone())
                .enqueue(WorkItem::advance(process.id.clone(), node.container())),
        )
        .await?;

    let cutoff = Utc::now() - Duration::seconds(60);
    assert!(store.find_stale_flow_nodes(cutoff).await?.is_empty());
    assert!(store.find_stale_work_items(cutoff).await?.is_empty());

    store.backdate(Utc::now() - Duration::seconds(120)).await;
    assert_eq!(store.find_stale_flow_nodes(cutoff).await?.len(), 1);
    assert_eq!(store.find_stale_process_instances(cutoff).await?.len(), 1);
    assert_eq!(store.find_stale_work_items(cutoff).await?.len(), 1);

    let resubmit = UnitOfWork::new()
        .guard(Guard::NoWorkFor {
            sequence_key: node.container().sequence_key(),
        })
        .enqueue(WorkItem::advance(process.id.clone(), node.container()));
    assert!(store.commit(resubmit).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_delete_cascades() -> Result<(), CoreError> {
    let store = InMemoryStateStore::new();
    let process = process();
    let keep = ProcessInstance::new(ProcessDefinitionId("orders".into()), Map::new());
    let node = FlowNodeInstance::new(process.id.clone(), "a");
    let c = connector(&process, &node.container(), "c", 0);

    store
        .commit(
            UnitOfWork::new()
                .save_process(process.clone())
                .save_process(keep.clone())
                .save_flow_node(node.clone())
                .save_connector(c.clone())
                .enqueue(WorkItem::advance(process.id.clone(), node.container()))
                .enqueue(WorkItem::advance(keep.id.clone(), keep.container())),
        )
        .await?;

    assert!(store.delete_process_instance(&process.id).await?);
    assert!(!store.delete_process_instance(&process.id).await?);
    assert!(store.find_flow_node(&node.id).await?.is_none());
    assert!(store.find_connector_instance(&c.id).await?.is_none());
    assert_eq!(store.work_items().await.len(), 1);
    assert!(store.find_process_instance(&keep.id).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_definitions() -> Result<(), CoreError> {
    let store = InMemoryStateStore::new();
    let definition = ProcessDefinition::from_yaml(
        r#"
id: orders
name: Orders
flow_nodes:
  - name: review
"#,
    )?;
    store.save_definition(&definition).await?;
    assert_eq!(store.list_definitions().await?, vec![ProcessDefinitionId("orders".into())]);
    assert_eq!(
        store.find_definition(&definition.id).await?.map(|d| d.name),
        Some("Orders".to_string())
    );
    Ok(())
}
