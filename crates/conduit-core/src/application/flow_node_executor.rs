//! Drives containers (flow nodes and process instances) through their
//! lifecycle and runs their connectors strictly in order.
//!
//! Every call handles exactly one [`WorkItem`]. The effect of the step and
//! the next work item are committed together, so a crash between two steps
//! leaves the queue pointing at the step that has not happened yet.

use crate::application::connector_invoker::{ConnectorInvoker, InvocationOutcome};
use crate::application::work_executor::WorkHandler;
use crate::domain::connector_instance::{
    ActivationEvent, ConnectorInstance, ConnectorInstanceId, ConnectorState,
};
use crate::domain::container::{ContainerRef, ContainerState};
use crate::domain::events::{
    ConnectorExecuted, ConnectorFailed, DomainEvent, DomainEventHandler, FlowNodeCompleted,
    FlowNodeFailed, ProcessInstanceCompleted, ProcessInstanceFailed, ProcessInstanceStarted,
};
use crate::domain::failure::FailureInfo;
use crate::domain::flow_node_instance::{FlowNodeInstance, FlowNodeInstanceId};
use crate::domain::process_definition::{
    ConnectorDefinition, ProcessDefinition, ProcessDefinitionId,
};
use crate::domain::process_instance::{ProcessInstance, ProcessInstanceId};
use crate::domain::repository::{Guard, StateStore, UnitOfWork};
use crate::domain::work_item::{ExecutorId, WorkItem, WorkKind};
use crate::CoreError;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Where a connector sequence stands
enum NextConnector<'a> {
    /// Every connector is DONE or SKIPPED
    AllSatisfied,
    /// This connector runs next
    Dispatch(&'a ConnectorInstance),
    /// This connector failed and blocks the sequence
    Failed(&'a ConnectorInstance),
}

fn next_connector(connectors: &[ConnectorInstance], event: ActivationEvent) -> NextConnector<'_> {
    let mut sequence: Vec<&ConnectorInstance> = connectors
        .iter()
        .filter(|c| c.activation_event == event)
        .collect();
    sequence.sort_by_key(|c| c.execution_index);

    for connector in sequence {
        match connector.state {
            ConnectorState::Done | ConnectorState::Skipped => continue,
            ConnectorState::Failed => return NextConnector::Failed(connector),
            // EXECUTING here means its work was lost; dispatching again re-runs it
            _ => return NextConnector::Dispatch(connector),
        }
    }
    NextConnector::AllSatisfied
}

/// Create the connector instances of a container, indexed per activation event
fn materialize_connectors(
    process_instance_id: &ProcessInstanceId,
    container: &ContainerRef,
    definitions: &[ConnectorDefinition],
) -> Vec<ConnectorInstance> {
    [ActivationEvent::OnEnter, ActivationEvent::OnFinish]
        .into_iter()
        .flat_map(|event| {
            definitions
                .iter()
                .filter(move |d| d.activation_event == event)
                .enumerate()
                .map(|(index, d)| {
                    ConnectorInstance::new(process_instance_id.clone(), container, d, index as u32)
                })
        })
        .collect()
}

/// The changes every handled work item commits: delete the item, provided
/// this executor still holds it
fn work_unit(item: &WorkItem, executor: &ExecutorId) -> UnitOfWork {
    UnitOfWork::new()
        .guard(Guard::WorkClaimedBy {
            id: item.id.clone(),
            executor: executor.clone(),
        })
        .complete(item.id.clone())
}

/// Service that executes containers and their connectors
#[derive(Clone)]
pub struct FlowNodeExecutor {
    store: Arc<dyn StateStore>,
    invoker: Arc<ConnectorInvoker>,
    event_handler: Arc<dyn DomainEventHandler>,
}

impl FlowNodeExecutor {
    /// Create a new flow node executor
    pub fn new(
        store: Arc<dyn StateStore>,
        invoker: Arc<ConnectorInvoker>,
        event_handler: Arc<dyn DomainEventHandler>,
    ) -> Self {
        Self {
            store,
            invoker,
            event_handler,
        }
    }

    /// Create a process instance with its process-level connectors and
    /// queue its first step
    pub async fn start_process(
        &self,
        definition_id: &ProcessDefinitionId,
        variables: Map<String, Value>,
    ) -> Result<ProcessInstanceId, CoreError> {
        let definition = self
            .store
            .find_definition(definition_id)
            .await?
            .ok_or_else(|| CoreError::ProcessDefinitionNotFound(definition_id.0.clone()))?;

        let process = ProcessInstance::new(definition.id.clone(), variables);
        let process_id = process.id.clone();
        let container = process.container();

        let mut unit = UnitOfWork::new().save_process(process);
        for connector in materialize_connectors(&process_id, &container, &definition.connectors) {
            unit = unit.save_connector(connector);
        }
        unit = unit.enqueue(WorkItem::advance(process_id.clone(), container));
        self.store.commit(unit).await?;

        info!(
            process_instance_id = %process_id,
            definition_id = %definition.id,
            "Started process instance"
        );
        self.publish(vec![Box::new(ProcessInstanceStarted {
            process_instance_id: process_id.clone(),
            definition_id: definition.id.clone(),
            timestamp: Utc::now(),
        })])
        .await;

        Ok(process_id)
    }

    async fn advance_flow_node(
        &self,
        item: &WorkItem,
        executor: &ExecutorId,
        id: &FlowNodeInstanceId,
    ) -> Result<(), CoreError> {
        let Some(mut node) = self.store.find_flow_node(id).await? else {
            debug!(flow_node_id = %id, "Flow node no longer exists, dropping work");
            return self.store.commit(work_unit(item, executor)).await;
        };

        let original = node.state;
        if !original.is_active() {
            debug!(flow_node_id = %id, state = %original, "Flow node is not active, dropping work");
            return self.store.commit(work_unit(item, executor)).await;
        }

        let container = node.container();
        let connectors = self.store.find_connectors_of_container(&container).await?;
        let mut unit = work_unit(item, executor);
        let mut events: Vec<Box<dyn DomainEvent>> = Vec::new();

        loop {
            match node.state {
                ContainerState::Initializing => {
                    node.transition_to(ContainerState::ExecutingOnEnterConnectors)?
                }
                ContainerState::ExecutingOnEnterConnectors
                | ContainerState::ExecutingOnFinishConnectors => {
                    let event = match node.state.connector_phase() {
                        Some(event) => event,
                        None => break,
                    };
                    match next_connector(&connectors, event) {
                        NextConnector::AllSatisfied => {
                            let next = match event {
                                ActivationEvent::OnEnter => ContainerState::Executing,
                                ActivationEvent::OnFinish => ContainerState::Completed,
                            };
                            node.transition_to(next)?;
                        }
                        NextConnector::Dispatch(connector) => {
                            debug!(
                                flow_node_id = %node.id,
                                connector_instance_id = %connector.id,
                                execution_index = connector.execution_index,
                                activation_event = %event,
                                "Dispatching connector"
                            );
                            unit = unit.enqueue(WorkItem::execute_connector(
                                node.process_instance_id.clone(),
                                container.clone(),
                                connector.id.clone(),
                            ));
                            break;
                        }
                        NextConnector::Failed(connector) => {
                            node.fail()?;
                            events.push(Box::new(FlowNodeFailed {
                                process_instance_id: node.process_instance_id.clone(),
                                flow_node_id: node.id.clone(),
                                connector_instance_id: Some(connector.id.clone()),
                                timestamp: Utc::now(),
                            }));
                            break;
                        }
                    }
                }
                // Automatic activities have no behaviour of their own
                ContainerState::Executing => {
                    node.transition_to(ContainerState::ExecutingOnFinishConnectors)?
                }
                ContainerState::Completed => {
                    info!(flow_node_id = %node.id, name = %node.name, "Flow node completed");
                    unit = unit.enqueue(WorkItem::advance(
                        node.process_instance_id.clone(),
                        ContainerRef::Process(node.process_instance_id.clone()),
                    ));
                    events.push(Box::new(FlowNodeCompleted {
                        process_instance_id: node.process_instance_id.clone(),
                        flow_node_id: node.id.clone(),
                        name: node.name.clone(),
                        timestamp: Utc::now(),
                    }));
                    break;
                }
                ContainerState::Failed => break,
            }
        }

        node.touch();
        unit = unit
            .guard(Guard::FlowNodeState {
                id: node.id.clone(),
                expected: original,
            })
            .save_flow_node(node);
        self.store.commit(unit).await?;
        self.publish(events).await;
        Ok(())
    }

    async fn advance_process(
        &self,
        item: &WorkItem,
        executor: &ExecutorId,
        id: &ProcessInstanceId,
    ) -> Result<(), CoreError> {
        let Some(mut process) = self.store.find_process_instance(id).await? else {
            debug!(process_instance_id = %id, "Process instance no longer exists, dropping work");
            return self.store.commit(work_unit(item, executor)).await;
        };

        let original = process.state;
        if !original.is_active() {
            return self.store.commit(work_unit(item, executor)).await;
        }

        let definition = self.definition_of(&process).await?;
        let container = process.container();
        let connectors = self.store.find_connectors_of_container(&container).await?;
        let mut unit = work_unit(item, executor);
        let mut events: Vec<Box<dyn DomainEvent>> = Vec::new();

        loop {
            match process.state {
                ContainerState::Initializing => {
                    process.transition_to(ContainerState::ExecutingOnEnterConnectors)?
                }
                ContainerState::ExecutingOnEnterConnectors
                | ContainerState::ExecutingOnFinishConnectors => {
                    let event = match process.state.connector_phase() {
                        Some(event) => event,
                        None => break,
                    };
                    match next_connector(&connectors, event) {
                        NextConnector::AllSatisfied => {
                            let next = match event {
                                ActivationEvent::OnEnter => ContainerState::Executing,
                                ActivationEvent::OnFinish => ContainerState::Completed,
                            };
                            process.transition_to(next)?;
                        }
                        NextConnector::Dispatch(connector) => {
                            unit = unit.enqueue(WorkItem::execute_connector(
                                process.id.clone(),
                                container.clone(),
                                connector.id.clone(),
                            ));
                            break;
                        }
                        NextConnector::Failed(connector) => {
                            process.fail()?;
                            events.push(Box::new(ProcessInstanceFailed {
                                process_instance_id: process.id.clone(),
                                connector_instance_id: Some(connector.id.clone()),
                                timestamp: Utc::now(),
                            }));
                            break;
                        }
                    }
                }
                ContainerState::Executing => {
                    let nodes = self.store.find_flow_nodes_of_process(&process.id).await?;
                    let created: HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
                    let completed: HashSet<&str> = nodes
                        .iter()
                        .filter(|n| n.state == ContainerState::Completed)
                        .map(|n| n.name.as_str())
                        .collect();

                    let ready = definition.ready_flow_nodes(&created, &completed);
                    if !ready.is_empty() {
                        for node_definition in ready {
                            let node = FlowNodeInstance::new(process.id.clone(), &node_definition.name);
                            let node_container = node.container();
                            debug!(
                                process_instance_id = %process.id,
                                flow_node_id = %node.id,
                                name = %node.name,
                                "Creating flow node"
                            );
                            for connector in materialize_connectors(
                                &process.id,
                                &node_container,
                                &node_definition.connectors,
                            ) {
                                unit = unit.save_connector(connector);
                            }
                            unit = unit
                                .enqueue(WorkItem::advance(process.id.clone(), node_container))
                                .save_flow_node(node);
                        }
                        break;
                    }

                    if completed.len() == definition.flow_nodes.len() {
                        process.transition_to(ContainerState::ExecutingOnFinishConnectors)?;
                    } else {
                        break;
                    }
                }
                ContainerState::Completed => {
                    info!(process_instance_id = %process.id, "Process instance completed");
                    events.push(Box::new(ProcessInstanceCompleted {
                        process_instance_id: process.id.clone(),
                        timestamp: Utc::now(),
                    }));
                    break;
                }
                ContainerState::Failed => break,
            }
        }

        process.touch();
        unit = unit
            .guard(Guard::ProcessState {
                id: process.id.clone(),
                expected: original,
            })
            .save_process(process);
        self.store.commit(unit).await?;
        self.publish(events).await;
        Ok(())
    }

    async fn execute_connector(
        &self,
        item: &WorkItem,
        executor: &ExecutorId,
        connector_instance_id: &ConnectorInstanceId,
        container: &ContainerRef,
    ) -> Result<(), CoreError> {
        let Some(mut connector) = self.store.find_connector_instance(connector_instance_id).await?
        else {
            debug!(connector_instance_id = %connector_instance_id, "Connector no longer exists, dropping work");
            return self.store.commit(work_unit(item, executor)).await;
        };

        let phase = ContainerState::phase_for(connector.activation_event);
        let container_state = self.container_state(container).await?;
        if container_state != Some(phase) {
            warn!(
                connector_instance_id = %connector.id,
                container = %container,
                container_state = ?container_state,
                "Container is not running this connector's phase, dropping work"
            );
            return self.store.commit(work_unit(item, executor)).await;
        }

        match connector.state {
            ConnectorState::Done | ConnectorState::Skipped => {
                debug!(connector_instance_id = %connector.id, "Connector already satisfied");
                let unit = work_unit(item, executor)
                    .enqueue(WorkItem::advance(connector.process_instance_id.clone(), container.clone()));
                return self.store.commit(unit).await;
            }
            ConnectorState::Failed => {
                debug!(connector_instance_id = %connector.id, "Connector is failed, waiting for an operator");
                return self.store.commit(work_unit(item, executor)).await;
            }
            ConnectorState::ToBeExecuted | ConnectorState::ToReExecute => {
                let siblings = self.store.find_connectors_of_container(container).await?;
                if let Some(blocking) = siblings.iter().find(|c| {
                    c.activation_event == connector.activation_event
                        && c.execution_index < connector.execution_index
                        && !c.is_satisfied()
                }) {
                    error!(
                        connector_instance_id = %connector.id,
                        blocking_connector = %blocking.id,
                        blocking_state = %blocking.state,
                        "Connector dispatched before its predecessor was satisfied"
                    );
                    let unit = work_unit(item, executor)
                        .enqueue(WorkItem::advance(connector.process_instance_id.clone(), container.clone()));
                    return self.store.commit(unit).await;
                }

                let previous = connector.state;
                connector.start_execution()?;
                self.store
                    .commit(
                        UnitOfWork::new()
                            .guard(Guard::WorkClaimedBy {
                                id: item.id.clone(),
                                executor: executor.clone(),
                            })
                            .guard(Guard::ConnectorState {
                                id: connector.id.clone(),
                                expected: previous,
                            })
                            .save_connector(connector.clone()),
                    )
                    .await?;
            }
            ConnectorState::Executing => {
                info!(
                    connector_instance_id = %connector.id,
                    attempts = item.attempts,
                    "Re-executing connector whose previous run did not finish"
                );
            }
        }

        let process = self
            .store
            .find_process_instance(&connector.process_instance_id)
            .await?
            .ok_or_else(|| CoreError::ProcessInstanceNotFound(connector.process_instance_id.0.clone()))?;
        let definition = self.definition_of(&process).await?;
        let connector_definition = self
            .connector_definition(&definition, container, &connector)
            .await?;

        match self.invoker.invoke(&connector, &connector_definition, &process).await {
            InvocationOutcome::Completed { variables } => {
                connector.complete()?;
                let mut unit = work_unit(item, executor)
                    .guard(Guard::ConnectorState {
                        id: connector.id.clone(),
                        expected: ConnectorState::Executing,
                    })
                    .save_connector(connector.clone())
                    .enqueue(WorkItem::advance(process.id.clone(), container.clone()));
                for (name, value) in variables {
                    unit = unit.set_variable(process.id.clone(), name, value);
                }
                self.store.commit(unit).await?;

                info!(
                    connector_instance_id = %connector.id,
                    name = %connector.name,
                    container = %container,
                    "Connector executed"
                );
                self.publish(vec![Box::new(ConnectorExecuted {
                    process_instance_id: process.id.clone(),
                    connector_instance_id: connector.id.clone(),
                    name: connector.name.clone(),
                    timestamp: Utc::now(),
                })])
                .await;
                Ok(())
            }
            InvocationOutcome::Failed(failure) => {
                self.record_connector_failure(item, executor, connector, failure)
                    .await
            }
        }
    }

    /// Persist a connector failure and halt its container, in one commit
    async fn record_connector_failure(
        &self,
        item: &WorkItem,
        executor: &ExecutorId,
        mut connector: ConnectorInstance,
        failure: FailureInfo,
    ) -> Result<(), CoreError> {
        let persisted = connector.state;
        if persisted != ConnectorState::Executing {
            connector.start_execution()?;
        }
        connector.fail(failure.clone())?;

        warn!(
            connector_instance_id = %connector.id,
            name = %connector.name,
            kind = %failure.kind,
            message = %failure.message,
            "Connector failed"
        );

        let container = connector.container();
        let mut unit = work_unit(item, executor)
            .guard(Guard::ConnectorState {
                id: connector.id.clone(),
                expected: persisted,
            })
            .save_connector(connector.clone());
        let mut events: Vec<Box<dyn DomainEvent>> = vec![Box::new(ConnectorFailed {
            process_instance_id: connector.process_instance_id.clone(),
            connector_instance_id: connector.id.clone(),
            failure,
            timestamp: Utc::now(),
        })];

        let (halt, event) = self.halt_container(&container, Some(&connector.id)).await?;
        unit.guards.extend(halt.guards);
        unit.flow_nodes.extend(halt.flow_nodes);
        unit.process_instances.extend(halt.process_instances);
        events.extend(event);

        self.store.commit(unit).await?;
        self.publish(events).await;
        Ok(())
    }

    /// Changes that move an active container to FAILED
    async fn halt_container(
        &self,
        container: &ContainerRef,
        connector_instance_id: Option<&ConnectorInstanceId>,
    ) -> Result<(UnitOfWork, Option<Box<dyn DomainEvent>>), CoreError> {
        let mut unit = UnitOfWork::new();
        let event: Option<Box<dyn DomainEvent>> = match container {
            ContainerRef::FlowNode(id) => match self.store.find_flow_node(id).await? {
                Some(mut node) if node.state.is_active() => {
                    let expected = node.state;
                    node.fail()?;
                    let event = FlowNodeFailed {
                        process_instance_id: node.process_instance_id.clone(),
                        flow_node_id: node.id.clone(),
                        connector_instance_id: connector_instance_id.cloned(),
                        timestamp: Utc::now(),
                    };
                    unit = unit
                        .guard(Guard::FlowNodeState {
                            id: node.id.clone(),
                            expected,
                        })
                        .save_flow_node(node);
                    Some(Box::new(event) as Box<dyn DomainEvent>)
                }
                _ => None,
            },
            ContainerRef::Process(id) => match self.store.find_process_instance(id).await? {
                Some(mut process) if process.state.is_active() => {
                    let expected = process.state;
                    process.fail()?;
                    let event = ProcessInstanceFailed {
                        process_instance_id: process.id.clone(),
                        connector_instance_id: connector_instance_id.cloned(),
                        timestamp: Utc::now(),
                    };
                    unit = unit
                        .guard(Guard::ProcessState {
                            id: process.id.clone(),
                            expected,
                        })
                        .save_process(process);
                    Some(Box::new(event) as Box<dyn DomainEvent>)
                }
                _ => None,
            },
        };
        Ok((unit, event))
    }

    async fn container_state(
        &self,
        container: &ContainerRef,
    ) -> Result<Option<ContainerState>, CoreError> {
        Ok(match container {
            ContainerRef::FlowNode(id) => self.store.find_flow_node(id).await?.map(|n| n.state),
            ContainerRef::Process(id) => self
                .store
                .find_process_instance(id)
                .await?
                .map(|p| p.state),
        })
    }

    async fn definition_of(&self, process: &ProcessInstance) -> Result<ProcessDefinition, CoreError> {
        self.store
            .find_definition(&process.definition_id)
            .await?
            .ok_or_else(|| CoreError::ProcessDefinitionNotFound(process.definition_id.0.clone()))
    }

    async fn connector_definition(
        &self,
        definition: &ProcessDefinition,
        container: &ContainerRef,
        connector: &ConnectorInstance,
    ) -> Result<ConnectorDefinition, CoreError> {
        let candidates = match container {
            ContainerRef::Process(_) => definition.connectors.as_slice(),
            ContainerRef::FlowNode(id) => {
                let node = self
                    .store
                    .find_flow_node(id)
                    .await?
                    .ok_or_else(|| CoreError::FlowNodeInstanceNotFound(id.0.clone()))?;
                definition
                    .flow_node(&node.name)
                    .map(|n| n.connectors.as_slice())
                    .ok_or_else(|| {
                        CoreError::ValidationError(format!(
                            "Process definition {} has no flow node {}",
                            definition.id, node.name
                        ))
                    })?
            }
        };
        candidates
            .iter()
            .find(|c| c.name == connector.name)
            .cloned()
            .ok_or_else(|| {
                CoreError::ValidationError(format!(
                    "Process definition {} has no connector {} on {}",
                    definition.id, connector.name, container
                ))
            })
    }

    async fn publish(&self, events: Vec<Box<dyn DomainEvent>>) {
        for event in events {
            let event_type = event.event_type();
            if let Err(e) = self.event_handler.handle_event(event).await {
                warn!(event_type, error = %e, "Domain event handler failed");
            }
        }
    }
}

#[async_trait]
impl WorkHandler for FlowNodeExecutor {
    async fn handle(&self, item: &WorkItem, executor: &ExecutorId) -> Result<(), CoreError> {
        match &item.kind {
            WorkKind::ExecuteConnector {
                connector_instance_id,
                container,
            } => {
                self.execute_connector(item, executor, connector_instance_id, container)
                    .await
            }
            WorkKind::AdvanceContainer { container } => match container {
                ContainerRef::FlowNode(id) => self.advance_flow_node(item, executor, id).await,
                ContainerRef::Process(id) => self.advance_process(item, executor, id).await,
            },
        }
    }

    async fn handle_failure(
        &self,
        item: &WorkItem,
        executor: &ExecutorId,
        failure: FailureInfo,
    ) -> Result<(), CoreError> {
        if let WorkKind::ExecuteConnector {
            connector_instance_id,
            ..
        } = &item.kind
        {
            if let Some(connector) = self.store.find_connector_instance(connector_instance_id).await? {
                if matches!(
                    connector.state,
                    ConnectorState::Executing | ConnectorState::ToBeExecuted | ConnectorState::ToReExecute
                ) {
                    return self
                        .record_connector_failure(item, executor, connector, failure)
                        .await;
                }
            }
            return self.store.commit(work_unit(item, executor)).await;
        }

        error!(
            work_item_id = %item.id,
            container = %item.kind.container(),
            failure = %failure,
            "Work failed outside of a connector, halting container"
        );
        let (halt, event) = self.halt_container(item.kind.container(), None).await?;
        let mut unit = work_unit(item, executor);
        unit.guards.extend(halt.guards);
        unit.flow_nodes.extend(halt.flow_nodes);
        unit.process_instances.extend(halt.process_instances);
        self.store.commit(unit).await?;
        self.publish(event.into_iter().collect()).await;
        Ok(())
    }
}
