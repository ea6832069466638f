use std::collections::HashMap;
use std::sync::Arc;

use conduit_core::{
    ConnectorInstance, ConnectorInstanceId, ConnectorSortCriterion, ConnectorState,
    ConnectorStateReset, ContainerState, ContainerType, CoreError, FailureKind, FlowNodeInstance,
    ProcessInstanceId,
};
use conduit_test_utils::{
    assertions::{assert_connector_states, assert_failed_with, assert_failure_info_consistent},
    connectors::{AlwaysFailingConnector, CountingConnector},
    data_generators::{
        failing_process_connector_definition, finish_fails_definition, noop_fail_noop_definition,
        ACTIVITY,
    },
    TestEngine, TestError,
};
use pretty_assertions::assert_eq;

/// Run `noop-fail-noop` until its activity fails
async fn failed_activity(
    engine: &TestEngine,
) -> Result<(ProcessInstanceId, FlowNodeInstance, ConnectorInstance), TestError> {
    let process_id = engine.run(noop_fail_noop_definition()).await?;
    let node = engine
        .wait_for_flow_node_state(&process_id, ACTIVITY, ContainerState::Failed)
        .await?;
    engine.wait_until_idle().await?;

    let failed = engine
        .connectors_of(&node)
        .await?
        .into_iter()
        .find(|c| c.state == ConnectorState::Failed)
        .ok_or_else(|| TestError::Assertion("no failed connector".to_string()))?;
    Ok((process_id, node, failed))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reset_of_unknown_connector_is_not_found() -> Result<(), TestError> {
    let engine = TestEngine::builder().start().await?;

    let result = engine
        .admin
        .set_connector_instance_state(
            &ConnectorInstanceId::from("-123456789"),
            ConnectorStateReset::Skipped,
        )
        .await;
    assert!(matches!(result, Err(CoreError::ConnectorInstanceNotFound(id)) if id == "-123456789"));

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replay_is_refused_while_a_connector_is_failed() -> Result<(), TestError> {
    let engine = TestEngine::builder().start().await?;
    let (process_id, node, _) = failed_activity(&engine).await?;
    let before = engine.connectors_of(&node).await?;

    let result = engine.admin.replay_activity(&node.id).await;
    assert!(matches!(result, Err(CoreError::InvalidStateTransition(_))));

    // Nothing moved
    let after = engine.admin.get_flow_node_instance(&node.id).await?;
    assert_eq!(after.state, ContainerState::Failed);
    assert_eq!(engine.connectors_of(&node).await?, before);
    assert!(engine.store.work_items().await.is_empty());
    assert_eq!(engine.events.count("flow_node.replayed"), 0);

    let process = engine.admin.get_process_instance(&process_id).await?;
    assert_eq!(process.state, ContainerState::Executing);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reset_replay_until_the_process_completes() -> Result<(), TestError> {
    let failing = Arc::new(AlwaysFailingConnector::new());
    let engine = TestEngine::builder()
        .with_connector(failing.clone())
        .start()
        .await?;
    let (process_id, node, failed) = failed_activity(&engine).await?;
    assert_eq!(failing.calls(), 1);

    // Re-execute: the connector fails again
    engine
        .admin
        .set_connector_instance_state(&failed.id, ConnectorStateReset::ToReExecute)
        .await?;
    let reset = engine
        .admin
        .get_connector_instance_with_failure_information(&failed.id)
        .await?;
    assert_eq!(reset.state, ConnectorState::ToReExecute);
    assert!(reset.failure_info.is_none());

    engine.admin.replay_activity(&node.id).await?;
    engine
        .wait_for("the connector to run again", || failing.calls() == 2)
        .await?;
    engine
        .wait_for_flow_node_state(&process_id, ACTIVITY, ContainerState::Failed)
        .await?;
    engine.wait_until_idle().await?;

    let connectors = engine.connectors_of(&node).await?;
    assert_connector_states(
        &connectors,
        &[
            ConnectorState::Done,
            ConnectorState::Failed,
            ConnectorState::ToBeExecuted,
        ],
    )?;
    assert_failed_with(&connectors[1], FailureKind::Execution, Some("remote system"))?;

    // Skip it: the activity and the process finish
    engine
        .admin
        .set_connector_instance_state(&failed.id, ConnectorStateReset::Skipped)
        .await?;
    engine.admin.replay_activity(&node.id).await?;
    engine
        .wait_for_process_state(&process_id, ContainerState::Completed)
        .await?;
    engine.wait_until_idle().await?;

    let connectors = engine.connectors_of(&node).await?;
    assert_connector_states(
        &connectors,
        &[
            ConnectorState::Done,
            ConnectorState::Skipped,
            ConnectorState::Done,
        ],
    )?;
    assert!(connectors[1].failure_info.is_none());
    assert_failure_info_consistent(&connectors)?;
    assert_eq!(failing.calls(), 2);

    assert_eq!(engine.events.count("flow_node.replayed"), 2);
    assert_eq!(engine.events.count("connector.state_reset"), 2);
    assert_eq!(engine.events.count("process_instance.completed"), 1);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replay_with_resets_in_one_call() -> Result<(), TestError> {
    let engine = TestEngine::builder().start().await?;
    let (process_id, node, failed) = failed_activity(&engine).await?;

    let resets = HashMap::from([(failed.id.clone(), ConnectorStateReset::Skipped)]);
    engine
        .admin
        .replay_activity_with_resets(&node.id, &resets)
        .await?;

    let process = engine
        .wait_for_process_state(&process_id, ContainerState::Completed)
        .await?;
    assert!(process.previous_state.is_none());

    let node = engine.admin.get_flow_node_instance(&node.id).await?;
    assert_eq!(node.state, ContainerState::Completed);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replay_with_resets_refuses_foreign_connectors() -> Result<(), TestError> {
    let engine = TestEngine::builder().start().await?;
    let (_, node, _) = failed_activity(&engine).await?;
    let (_, _, other_failed) = failed_activity(&engine).await?;

    let resets = HashMap::from([(other_failed.id.clone(), ConnectorStateReset::Skipped)]);
    let result = engine
        .admin
        .replay_activity_with_resets(&node.id, &resets)
        .await;
    assert!(matches!(result, Err(CoreError::InvalidStateTransition(_))));

    let untouched = engine
        .admin
        .get_connector_instance_with_failure_information(&other_failed.id)
        .await?;
    assert_eq!(untouched.state, ConnectorState::Failed);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_reset_with_unknown_id_changes_nothing() -> Result<(), TestError> {
    let engine = TestEngine::builder().start().await?;
    let (_, _, failed) = failed_activity(&engine).await?;

    let resets = HashMap::from([
        (failed.id.clone(), ConnectorStateReset::Skipped),
        (ConnectorInstanceId::from("unknown"), ConnectorStateReset::Skipped),
    ]);
    let result = engine.admin.set_connector_instance_states(&resets).await;
    assert!(matches!(result, Err(CoreError::ConnectorInstanceNotFound(_))));

    let unchanged = engine
        .admin
        .get_connector_instance_with_failure_information(&failed.id)
        .await?;
    assert_eq!(unchanged.state, ConnectorState::Failed);
    assert_eq!(unchanged.failure_info, failed.failure_info);
    assert_eq!(engine.events.count("connector.state_reset"), 0);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_only_failed_connectors_can_be_reset() -> Result<(), TestError> {
    let engine = TestEngine::builder().start().await?;
    let (_, node, _) = failed_activity(&engine).await?;
    let connectors = engine.connectors_of(&node).await?;

    for connector in [&connectors[0], &connectors[2]] {
        let result = engine
            .admin
            .set_connector_instance_state(&connector.id, ConnectorStateReset::ToReExecute)
            .await;
        assert!(matches!(result, Err(CoreError::InvalidStateTransition(_))));
        assert!(result.is_err_and(|e| e.is_update_rejection()));
    }
    assert_eq!(engine.connectors_of(&node).await?, connectors);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_finish_failure_replays_without_rerunning_enter() -> Result<(), TestError> {
    let counting = Arc::new(CountingConnector::new("counting"));
    let engine = TestEngine::builder()
        .with_connector(counting.clone())
        .start()
        .await?;
    let process_id = engine
        .run(finish_fails_definition("finish-fails", "counting"))
        .await?;

    let node = engine
        .wait_for_flow_node_state(&process_id, ACTIVITY, ContainerState::Failed)
        .await?;
    engine.wait_until_idle().await?;
    assert_eq!(node.previous_state, Some(ContainerState::ExecutingOnFinishConnectors));

    let connectors = engine.connectors_of(&node).await?;
    let names: Vec<&str> = connectors.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["enter", "finish", "finish-more"]);
    assert_connector_states(
        &connectors,
        &[
            ConnectorState::Done,
            ConnectorState::Failed,
            ConnectorState::ToBeExecuted,
        ],
    )?;
    assert_eq!(counting.calls(), 1);

    let resets = HashMap::from([(connectors[1].id.clone(), ConnectorStateReset::Skipped)]);
    engine
        .admin
        .replay_activity_with_resets(&node.id, &resets)
        .await?;
    engine
        .wait_for_process_state(&process_id, ContainerState::Completed)
        .await?;
    engine.wait_until_idle().await?;

    assert_connector_states(
        &engine.connectors_of(&node).await?,
        &[
            ConnectorState::Done,
            ConnectorState::Skipped,
            ConnectorState::Done,
        ],
    )?;
    assert_eq!(counting.calls(), 1);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_process_connector_can_only_be_skipped() -> Result<(), TestError> {
    let engine = TestEngine::builder().start().await?;
    let process_id = engine
        .run(failing_process_connector_definition("notify-fails"))
        .await?;
    engine
        .wait_for_process_state(&process_id, ContainerState::Failed)
        .await?;
    engine.wait_until_idle().await?;

    let page = engine
        .admin
        .get_connector_instances_of_container(
            &process_id.to_string(),
            ContainerType::Process,
            0,
            10,
            ConnectorSortCriterion::Default,
        )
        .await?;
    let failed = page.items[0].clone();
    assert_eq!(failed.state, ConnectorState::Failed);

    let result = engine
        .admin
        .set_connector_instance_state(&failed.id, ConnectorStateReset::ToReExecute)
        .await;
    assert!(matches!(result, Err(CoreError::InvalidStateTransition(_))));
    assert!(result.is_err_and(|e| e.is_update_rejection()));
    let unchanged = engine
        .admin
        .get_connector_instance_with_failure_information(&failed.id)
        .await?;
    assert_eq!(unchanged, failed);

    engine
        .admin
        .set_connector_instance_state(&failed.id, ConnectorStateReset::Skipped)
        .await?;
    let skipped = engine
        .admin
        .get_connector_instance_with_failure_information(&failed.id)
        .await?;
    assert_eq!(skipped.state, ConnectorState::Skipped);
    assert!(skipped.failure_info.is_none());

    let process = engine.admin.get_process_instance(&process_id).await?;
    assert_eq!(process.state, ContainerState::Failed);

    engine.shutdown().await;
    Ok(())
}
