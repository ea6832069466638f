//! Integration tests against a live PostgreSQL database.
//!
//! Skipped unless `DATABASE_URL` points at a scratch database.

use conduit_core::{
    domain::repository::{
        ConnectorInstanceRepository, FlowNodeInstanceRepository, Guard,
        ProcessInstanceRepository, UnitOfWorkRepository, WorkItemRepository,
    },
    domain::work_item::WorkStatus,
    ActivationEvent, ConnectorDefinition, ConnectorInstance, ContainerState, CoreError,
    ExecutorId, FlowNodeInstance, ProcessDefinitionId, ProcessInstance, UnitOfWork, WorkItem,
};
use conduit_state_postgres::{PostgresConfig, PostgresStateStore};
use serde_json::{json, Map};
use std::collections::HashMap;

async fn store() -> Option<PostgresStateStore> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let config = PostgresConfig {
        connection_string: url,
        ..PostgresConfig::default()
    };
    match PostgresStateStore::connect(&config).await {
        Ok(store) => Some(store),
        Err(e) => panic!("DATABASE_URL is set but unusable: {}", e),
    }
}

fn process() -> ProcessInstance {
    let mut variables = Map::new();
    variables.insert("order".to_string(), json!(42));
    ProcessInstance::new(ProcessDefinitionId("orders".into()), variables)
}

#[tokio::test]
async fn test_guarded_commit_is_atomic() -> Result<(), CoreError> {
    let Some(store) = store().await else {
        return Ok(());
    };
    let process = process();
    store.commit(UnitOfWork::new().save_process(process.clone())).await?;

    let node = FlowNodeInstance::new(process.id.clone(), "review");
    let rejected = UnitOfWork::new()
        .guard(Guard::ProcessState {
            id: process.id.clone(),
            expected: ContainerState::Completed,
        })
        .save_flow_node(node.clone())
        .enqueue(WorkItem::advance(process.id.clone(), node.container()));
    assert!(matches!(
        store.commit(rejected).await,
        Err(CoreError::ConcurrentModification(_))
    ));
    assert!(store.find_flow_node(&node.id).await?.is_none());
    assert!(store
        .find_work_for_sequence(&node.container().sequence_key())
        .await?
        .is_empty());

    store.delete_process_instance(&process.id).await?;
    Ok(())
}

#[tokio::test]
async fn test_variable_merge_survives_process_upsert() -> Result<(), CoreError> {
    let Some(store) = store().await else {
        return Ok(());
    };
    let mut process = process();
    store.commit(UnitOfWork::new().save_process(process.clone())).await?;
    store
        .commit(UnitOfWork::new().set_variable(process.id.clone(), "approved", json!(true)))
        .await?;

    process.transition_to(ContainerState::ExecutingOnEnterConnectors)?;
    store.commit(UnitOfWork::new().save_process(process.clone())).await?;

    let stored = store.find_process_instance(&process.id).await?.unwrap();
    assert_eq!(stored.state, ContainerState::ExecutingOnEnterConnectors);
    assert_eq!(stored.variable("approved"), Some(&json!(true)));
    assert_eq!(stored.variable("order"), Some(&json!(42)));

    store.delete_process_instance(&process.id).await?;
    Ok(())
}

#[tokio::test]
async fn test_work_queue_claims_and_releases() -> Result<(), CoreError> {
    let Some(store) = store().await else {
        return Ok(());
    };
    let process = process();
    let node = FlowNodeInstance::new(process.id.clone(), "a");
    let definition = ConnectorDefinition {
        name: "c1".to_string(),
        connector_id: "noop".to_string(),
        version: "1.0.0".to_string(),
        activation_event: ActivationEvent::OnEnter,
        inputs: HashMap::new(),
        outputs: Vec::new(),
    };
    let connector = ConnectorInstance::new(process.id.clone(), &node.container(), &definition, 0);

    store
        .commit(
            UnitOfWork::new()
                .save_process(process.clone())
                .save_flow_node(node.clone())
                .save_connector(connector.clone())
                .enqueue(WorkItem::advance(process.id.clone(), node.container()))
                .enqueue(WorkItem::advance(process.id.clone(), node.container()))
                .enqueue(WorkItem::execute_connector(
                    process.id.clone(),
                    node.container(),
                    connector.id.clone(),
                )),
        )
        .await?;

    let queued = store.find_work_for_sequence(&node.container().sequence_key()).await?;
    assert_eq!(queued.len(), 2);

    let executor = ExecutorId::generate();
    let claimed = loop {
        // Other tests may share the queue
        let item = store.claim_next_work_item(&executor).await?.unwrap();
        if item.process_instance_id == process.id {
            break item;
        }
    };
    assert_eq!(claimed.status, WorkStatus::Claimed);
    assert_eq!(claimed.attempts, 1);

    store
        .commit(
            UnitOfWork::new()
                .guard(Guard::WorkClaimedBy {
                    id: claimed.id.clone(),
                    executor: executor.clone(),
                })
                .release(claimed.id.clone()),
        )
        .await?;
    let released = store.find_work_item(&claimed.id).await?.unwrap();
    assert_eq!(released.status, WorkStatus::Pending);
    assert!(released.claimed_by.is_none());

    let connectors = store.find_connectors_of_container(&node.container()).await?;
    assert_eq!(connectors.len(), 1);

    assert!(store.delete_process_instance(&process.id).await?);
    assert!(store.find_work_item(&claimed.id).await?.is_none());
    assert!(store.find_connector_instance(&connector.id).await?.is_none());
    Ok(())
}
