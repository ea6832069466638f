use std::sync::Arc;

use conduit_core::{
    ConnectorSortCriterion, ConnectorState, ContainerState, ContainerType, ExecutorLifecycle,
    FailureKind,
};
use conduit_test_utils::{
    assertions::{assert_connector_states, assert_failed_with, assert_failure_info_consistent},
    connectors::{AlwaysFailingConnector, OutputConnector, PanickingConnector, NOOP},
    data_generators::{
        connector, failing_process_connector_definition, flow_node, noop_fail_noop_definition,
        process, single_activity_definition, with_input, with_output, ACTIVITY,
    },
    TestEngine, TestError,
};
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connectors_after_a_failure_stay_to_be_executed() -> Result<(), TestError> {
    let failing = Arc::new(AlwaysFailingConnector::new());
    let engine = TestEngine::builder()
        .with_connector(failing.clone())
        .start()
        .await?;

    let process_id = engine.run(noop_fail_noop_definition()).await?;
    let node = engine
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
    assert_failed_with(&connectors[1], FailureKind::Execution, Some("remote endpoint refused"))?;
    assert_failure_info_consistent(&connectors)?;
    assert_eq!(failing.calls(), 1);

    // The failure stays on the flow node
    let process = engine
        .admin
        .get_process_instance(&process_id)
        .await?;
    assert_eq!(process.state, ContainerState::Executing);
    assert_eq!(node.previous_state, Some(ContainerState::ExecutingOnEnterConnectors));

    assert_eq!(engine.events.count("connector.failed"), 1);
    assert_eq!(engine.events.count("flow_node.failed"), 1);
    assert_eq!(engine.events.count("process_instance.failed"), 0);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_records_the_whole_cause_chain() -> Result<(), TestError> {
    let engine = TestEngine::builder().start().await?;

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
    let failed = engine
        .admin
        .get_connector_instance_with_failure_information(&failed.id)
        .await?;

    let info = failed
        .failure_info
        .ok_or_else(|| TestError::Assertion("failure info missing".to_string()))?;
    assert_eq!(info.message, "connector always fails");
    assert_eq!(
        info.causes,
        vec![
            "call to remote system failed".to_string(),
            "remote endpoint refused the request".to_string(),
        ]
    );
    assert!(info.stack_trace().contains("Caused by: remote endpoint refused the request"));

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_connector_does_not_take_down_the_pool() -> Result<(), TestError> {
    let engine = TestEngine::builder()
        .with_connector(Arc::new(PanickingConnector::new("panics")))
        .with_workers(2)
        .start()
        .await?;

    let panicking = engine.run(single_activity_definition("panicking", &["panics"])).await?;
    let healthy = engine.run(single_activity_definition("healthy", &[NOOP, NOOP])).await?;

    let node = engine
        .wait_for_flow_node_state(&panicking, ACTIVITY, ContainerState::Failed)
        .await?;
    engine
        .wait_for_process_state(&healthy, ContainerState::Completed)
        .await?;

    let connectors = engine.connectors_of(&node).await?;
    assert_failed_with(&connectors[0], FailureKind::Execution, Some("blew up"))?;
    assert_eq!(
        connectors[0].failure_info.as_ref().map(|f| f.message.as_str()),
        Some("connector panicked")
    );

    // Later work still runs on the same pool
    let after = engine.run(single_activity_definition("after-panic", &[NOOP])).await?;
    engine
        .wait_for_process_state(&after, ContainerState::Completed)
        .await?;
    assert_eq!(engine.executor.lifecycle(), ExecutorLifecycle::Running);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_output_is_a_serialization_failure() -> Result<(), TestError> {
    let producer = OutputConnector::new("producer").with_output("big", json!("x".repeat(256)));
    let engine = TestEngine::builder()
        .with_connector(Arc::new(producer))
        .with_max_output_bytes(64)
        .start()
        .await?;

    let definition = process(
        "oversized",
        vec![flow_node(
            ACTIVITY,
            &[],
            vec![with_output(connector("produce", "producer"), "big", "big")],
        )],
    );
    let process_id = engine.run(definition).await?;
    let node = engine
        .wait_for_flow_node_state(&process_id, ACTIVITY, ContainerState::Failed)
        .await?;
    engine.wait_until_idle().await?;

    let connectors = engine.connectors_of(&node).await?;
    assert_failed_with(&connectors[0], FailureKind::Serialization, None)?;

    let process = engine.admin.get_process_instance(&process_id).await?;
    assert!(!process.variables.contains_key("big"));

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_declared_output_is_a_serialization_failure() -> Result<(), TestError> {
    let engine = TestEngine::builder()
        .with_connector(Arc::new(OutputConnector::new("producer")))
        .start()
        .await?;

    let definition = process(
        "missing-output",
        vec![flow_node(
            ACTIVITY,
            &[],
            vec![with_output(connector("produce", "producer"), "absent", "result")],
        )],
    );
    let process_id = engine.run(definition).await?;
    let node = engine
        .wait_for_flow_node_state(&process_id, ACTIVITY, ContainerState::Failed)
        .await?;
    engine.wait_until_idle().await?;

    let connectors = engine.connectors_of(&node).await?;
    assert_failed_with(&connectors[0], FailureKind::Serialization, None)?;

    let process = engine.admin.get_process_instance(&process_id).await?;
    assert!(!process.variables.contains_key("result"));

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_outputs_flow_into_later_inputs() -> Result<(), TestError> {
    let engine = TestEngine::builder()
        .with_connector(Arc::new(
            OutputConnector::new("producer").with_output("greeting", json!("hello")),
        ))
        .start()
        .await?;

    let definition = process(
        "outputs",
        vec![
            flow_node(
                "first",
                &[],
                vec![with_output(connector("produce", "producer"), "greeting", "greeting")],
            ),
            flow_node(
                "second",
                &["first"],
                vec![with_output(
                    with_input(connector("echo", "producer"), "value", json!("$greeting")),
                    "echo",
                    "echoed",
                )],
            ),
        ],
    );
    let process_id = engine.run(definition).await?;
    let process = engine
        .wait_for_process_state(&process_id, ContainerState::Completed)
        .await?;

    assert_eq!(process.variables.get("greeting"), Some(&json!("hello")));
    assert_eq!(process.variables.get("echoed"), Some(&json!("hello")));

    engine.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_level_failure_fails_the_process() -> Result<(), TestError> {
    let engine = TestEngine::builder().start().await?;
    let process_id = engine
        .run(failing_process_connector_definition("notify-fails"))
        .await?;

    let process = engine
        .wait_for_process_state(&process_id, ContainerState::Failed)
        .await?;
    engine.wait_until_idle().await?;
    assert_eq!(process.previous_state, Some(ContainerState::ExecutingOnFinishConnectors));

    // The activity itself finished normally
    let node = engine
        .flow_node(&process_id, ACTIVITY)
        .await?
        .ok_or_else(|| TestError::Assertion("activity missing".to_string()))?;
    assert_eq!(node.state, ContainerState::Completed);

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
    assert_eq!(page.total, 1);
    assert_failed_with(&page.items[0], FailureKind::Execution, Some("remote endpoint refused"))?;

    assert_eq!(engine.events.count("process_instance.failed"), 1);
    assert_eq!(engine.events.count("process_instance.completed"), 0);
    assert_eq!(engine.events.count("flow_node.failed"), 0);

    engine.shutdown().await;
    Ok(())
}
