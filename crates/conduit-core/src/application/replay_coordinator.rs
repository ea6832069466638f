//! Operator tooling for failed connectors: resetting them and replaying the
//! flow node they halted.

use crate::domain::connector_instance::{
    ConnectorInstance, ConnectorInstanceId, ConnectorState, ConnectorStateReset,
};
use crate::domain::container::{ContainerState, ContainerType};
use crate::domain::events::{
    ActivityReplayed, ConnectorStateWasReset, DomainEvent, DomainEventHandler,
};
use crate::domain::flow_node_instance::FlowNodeInstanceId;
use crate::domain::repository::{Guard, StateStore, UnitOfWork};
use crate::domain::work_item::WorkItem;
use crate::CoreError;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Resets failed connectors and resumes halted flow nodes
#[derive(Clone)]
pub struct ReplayCoordinator {
    store: Arc<dyn StateStore>,
    event_handler: Arc<dyn DomainEventHandler>,
}

impl ReplayCoordinator {
    /// Create a new replay coordinator
    pub fn new(store: Arc<dyn StateStore>, event_handler: Arc<dyn DomainEventHandler>) -> Self {
        Self {
            store,
            event_handler,
        }
    }

    /// Reset one failed connector
    pub async fn set_connector_instance_state(
        &self,
        id: &ConnectorInstanceId,
        reset: ConnectorStateReset,
    ) -> Result<(), CoreError> {
        self.set_connector_instance_states(&HashMap::from([(id.clone(), reset)]))
            .await
    }

    /// Reset several failed connectors. Either every reset is applied or,
    /// when any id is unknown or any connector is not FAILED, none is.
    ///
    /// A failed process-level connector can only be SKIPPED: its process
    /// instance is FAILED for good and would never run it again.
    pub async fn set_connector_instance_states(
        &self,
        resets: &HashMap<ConnectorInstanceId, ConnectorStateReset>,
    ) -> Result<(), CoreError> {
        let prepared = self.prepare_resets(resets).await?;
        if prepared.is_empty() {
            return Ok(());
        }

        let mut unit = UnitOfWork::new();
        for connector in &prepared {
            unit = unit
                .guard(Guard::ConnectorState {
                    id: connector.id.clone(),
                    expected: ConnectorState::Failed,
                })
                .save_connector(connector.clone());
        }
        self.store.commit(unit).await?;

        let events = prepared.iter().map(reset_event).collect();
        self.publish(events).await;
        Ok(())
    }

    /// Resume a failed flow node. Fails without changing anything while
    /// any of its connectors is still FAILED.
    pub async fn replay_activity(&self, flow_node_id: &FlowNodeInstanceId) -> Result<(), CoreError> {
        self.replay_activity_with_resets(flow_node_id, &HashMap::new())
            .await
    }

    /// Apply resets to connectors of a failed flow node and resume it, in a
    /// single commit
    pub async fn replay_activity_with_resets(
        &self,
        flow_node_id: &FlowNodeInstanceId,
        resets: &HashMap<ConnectorInstanceId, ConnectorStateReset>,
    ) -> Result<(), CoreError> {
        let mut node = self
            .store
            .find_flow_node(flow_node_id)
            .await?
            .ok_or_else(|| CoreError::FlowNodeInstanceNotFound(flow_node_id.0.clone()))?;

        if node.state != ContainerState::Failed {
            return Err(CoreError::InvalidStateTransition(format!(
                "Flow node instance {} is {}, only failed flow nodes can be replayed",
                node.id, node.state
            )));
        }

        let container = node.container();
        let mut connectors = self.store.find_connectors_of_container(&container).await?;
        let prepared = self.prepare_resets(resets).await?;
        for reset in &prepared {
            let slot = connectors
                .iter_mut()
                .find(|c| c.id == reset.id)
                .ok_or_else(|| {
                    CoreError::InvalidStateTransition(format!(
                        "Connector instance {} does not belong to flow node instance {}",
                        reset.id, node.id
                    ))
                })?;
            *slot = reset.clone();
        }

        if let Some(failed) = connectors.iter().find(|c| c.state == ConnectorState::Failed) {
            warn!(
                flow_node_id = %node.id,
                connector_instance_id = %failed.id,
                "Replay refused while a connector is still failed"
            );
            return Err(CoreError::InvalidStateTransition(format!(
                "Connector instance {} of flow node instance {} is still FAILED; reset it first",
                failed.id, node.id
            )));
        }

        let resumed = node.resume_after_failure()?;
        node.touch();

        let mut unit = UnitOfWork::new()
            .guard(Guard::FlowNodeState {
                id: node.id.clone(),
                expected: ContainerState::Failed,
            })
            .enqueue(WorkItem::advance(node.process_instance_id.clone(), container));
        for connector in &prepared {
            unit = unit
                .guard(Guard::ConnectorState {
                    id: connector.id.clone(),
                    expected: ConnectorState::Failed,
                })
                .save_connector(connector.clone());
        }
        unit = unit.save_flow_node(node.clone());
        self.store.commit(unit).await?;

        info!(
            flow_node_id = %node.id,
            process_instance_id = %node.process_instance_id,
            resumed_state = %resumed,
            resets = prepared.len(),
            "Replaying flow node"
        );

        let mut events: Vec<Box<dyn DomainEvent>> = prepared.iter().map(reset_event).collect();
        events.push(Box::new(ActivityReplayed {
            process_instance_id: node.process_instance_id.clone(),
            flow_node_id: node.id.clone(),
            timestamp: Utc::now(),
        }));
        self.publish(events).await;
        Ok(())
    }

    /// Load and reset every connector in memory, rejecting the whole batch
    /// on the first unknown id or illegal reset
    async fn prepare_resets(
        &self,
        resets: &HashMap<ConnectorInstanceId, ConnectorStateReset>,
    ) -> Result<Vec<ConnectorInstance>, CoreError> {
        let mut ids: Vec<&ConnectorInstanceId> = resets.keys().collect();
        ids.sort();

        let mut prepared = Vec::with_capacity(ids.len());
        for id in ids {
            let mut connector = self
                .store
                .find_connector_instance(id)
                .await?
                .ok_or_else(|| CoreError::ConnectorInstanceNotFound(id.0.clone()))?;
            if connector.container_type == ContainerType::Process
                && resets[id] == ConnectorStateReset::ToReExecute
            {
                return Err(CoreError::InvalidStateTransition(format!(
                    "Connector instance {} belongs to terminal process {}; it can only be skipped",
                    connector.id, connector.process_instance_id
                )));
            }
            connector.reset(resets[id])?;
            prepared.push(connector);
        }
        Ok(prepared)
    }

    async fn publish(&self, events: Vec<Box<dyn DomainEvent>>) {
        for event in events {
            if let Err(e) = self.event_handler.handle_event(event).await {
                warn!(error = %e, "Domain event handler failed");
            }
        }
    }
}

fn reset_event(connector: &ConnectorInstance) -> Box<dyn DomainEvent> {
    info!(
        connector_instance_id = %connector.id,
        state = %connector.state,
        "Connector state reset"
    );
    Box::new(ConnectorStateWasReset {
        process_instance_id: connector.process_instance_id.clone(),
        connector_instance_id: connector.id.clone(),
        state: connector.state,
        timestamp: Utc::now(),
    })
}
