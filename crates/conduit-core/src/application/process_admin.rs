use crate::application::flow_node_executor::FlowNodeExecutor;
use crate::application::recovery_service::{RecoveryReport, RecoveryService};
use crate::application::replay_coordinator::ReplayCoordinator;
use crate::application::work_executor::{ExecutorLifecycle, WorkExecutorService};
use crate::domain::connector_instance::{ConnectorInstance, ConnectorInstanceId, ConnectorStateReset};
use crate::domain::container::{ContainerRef, ContainerType};
use crate::domain::flow_node_instance::{FlowNodeInstance, FlowNodeInstanceId};
use crate::domain::process_definition::{ProcessDefinition, ProcessDefinitionId};
use crate::domain::process_instance::{ProcessInstance, ProcessInstanceId};
use crate::domain::repository::{ConnectorSortCriterion, Page, PageRequest, StateStore};
use crate::CoreError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// The administrative API of the engine
#[derive(Clone)]
pub struct ProcessAdmin {
    store: Arc<dyn StateStore>,
    flow_node_executor: Arc<FlowNodeExecutor>,
    replay: ReplayCoordinator,
    recovery: Arc<RecoveryService>,
    executor: WorkExecutorService,
}

impl ProcessAdmin {
    /// Create a new process admin
    pub fn new(
        store: Arc<dyn StateStore>,
        flow_node_executor: Arc<FlowNodeExecutor>,
        replay: ReplayCoordinator,
        recovery: Arc<RecoveryService>,
        executor: WorkExecutorService,
    ) -> Self {
        Self {
            store,
            flow_node_executor,
            replay,
            recovery,
            executor,
        }
    }

    /// Deploy a process definition
    pub async fn deploy_definition(&self, definition: ProcessDefinition) -> Result<(), CoreError> {
        definition.validate()?;
        self.store.save_definition(&definition).await?;
        info!(definition_id = %definition.id, version = %definition.version, "Deployed process definition");
        Ok(())
    }

    /// Ids of every deployed definition
    pub async fn list_definitions(&self) -> Result<Vec<ProcessDefinitionId>, CoreError> {
        self.store.list_definitions().await
    }

    /// Start a process instance
    pub async fn start_process(
        &self,
        definition_id: &ProcessDefinitionId,
        variables: Map<String, Value>,
    ) -> Result<ProcessInstanceId, CoreError> {
        let id = self
            .flow_node_executor
            .start_process(definition_id, variables)
            .await?;
        self.executor.notify_work_available();
        Ok(id)
    }

    /// Get a process instance
    pub async fn get_process_instance(
        &self,
        id: &ProcessInstanceId,
    ) -> Result<ProcessInstance, CoreError> {
        self.store
            .find_process_instance(id)
            .await?
            .ok_or_else(|| CoreError::ProcessInstanceNotFound(id.0.clone()))
    }

    /// Get a flow node instance
    pub async fn get_flow_node_instance(
        &self,
        id: &FlowNodeInstanceId,
    ) -> Result<FlowNodeInstance, CoreError> {
        self.store
            .find_flow_node(id)
            .await?
            .ok_or_else(|| CoreError::FlowNodeInstanceNotFound(id.0.clone()))
    }

    /// Flow nodes created so far for a process instance
    pub async fn get_flow_nodes_of_process(
        &self,
        id: &ProcessInstanceId,
    ) -> Result<Vec<FlowNodeInstance>, CoreError> {
        self.store.find_flow_nodes_of_process(id).await
    }

    /// One page of a container's connectors. An unknown container has none.
    pub async fn get_connector_instances_of_container(
        &self,
        container_id: &str,
        container_type: ContainerType,
        from: usize,
        count: usize,
        sort: ConnectorSortCriterion,
    ) -> Result<Page<ConnectorInstance>, CoreError> {
        let container = ContainerRef::from_parts(container_id, container_type);
        self.store
            .search_connectors_of_container(&container, &PageRequest::new(from, count, sort))
            .await
    }

    /// A connector instance including the diagnostics of its last failure
    pub async fn get_connector_instance_with_failure_information(
        &self,
        id: &ConnectorInstanceId,
    ) -> Result<ConnectorInstance, CoreError> {
        self.store
            .find_connector_instance(id)
            .await?
            .ok_or_else(|| CoreError::ConnectorInstanceNotFound(id.0.clone()))
    }

    /// Reset one failed connector
    pub async fn set_connector_instance_state(
        &self,
        id: &ConnectorInstanceId,
        reset: ConnectorStateReset,
    ) -> Result<(), CoreError> {
        self.replay.set_connector_instance_state(id, reset).await
    }

    /// Reset several failed connectors, all or nothing
    pub async fn set_connector_instance_states(
        &self,
        resets: &HashMap<ConnectorInstanceId, ConnectorStateReset>,
    ) -> Result<(), CoreError> {
        self.replay.set_connector_instance_states(resets).await
    }

    /// Resume a failed flow node
    pub async fn replay_activity(&self, flow_node_id: &FlowNodeInstanceId) -> Result<(), CoreError> {
        self.replay.replay_activity(flow_node_id).await?;
        self.executor.notify_work_available();
        Ok(())
    }

    /// Reset connectors of a failed flow node and resume it
    pub async fn replay_activity_with_resets(
        &self,
        flow_node_id: &FlowNodeInstanceId,
        resets: &HashMap<ConnectorInstanceId, ConnectorStateReset>,
    ) -> Result<(), CoreError> {
        self.replay
            .replay_activity_with_resets(flow_node_id, resets)
            .await?;
        self.executor.notify_work_available();
        Ok(())
    }

    /// Run one recovery pass now
    pub async fn recover_all_elements(&self) -> Result<RecoveryReport, CoreError> {
        self.recovery.recover_all_elements().await
    }

    /// Set the recovery staleness threshold
    pub fn set_consider_elements_older_than(&self, threshold: Duration) {
        self.recovery.set_consider_elements_older_than(threshold)
    }

    /// Stop claiming work and wait for in-flight work
    pub async fn pause(&self) {
        self.executor.pause().await
    }

    /// Resume claiming work
    pub fn resume(&self) {
        self.executor.resume()
    }

    /// Current executor lifecycle
    pub fn lifecycle(&self) -> ExecutorLifecycle {
        self.executor.lifecycle()
    }

    /// Delete a process instance with everything it owns
    pub async fn delete_process_instance(&self, id: &ProcessInstanceId) -> Result<(), CoreError> {
        if !self.store.delete_process_instance(id).await? {
            return Err(CoreError::ProcessInstanceNotFound(id.0.clone()));
        }
        info!(process_instance_id = %id, "Deleted process instance");
        Ok(())
    }
}
