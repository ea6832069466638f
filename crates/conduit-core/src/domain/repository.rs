//! Repository traits for the Conduit core
//!
//! This module defines the persistence interfaces used by the engine.
//! Reads go through the per-entity repositories. Every mutation goes
//! through [`UnitOfWorkRepository::commit`], which applies a whole
//! [`UnitOfWork`] atomically or not at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use super::connector_instance::{ConnectorInstance, ConnectorInstanceId, ConnectorState};
use super::container::{ContainerRef, ContainerState};
use super::flow_node_instance::{FlowNodeInstance, FlowNodeInstanceId};
use super::process_definition::{ProcessDefinition, ProcessDefinitionId};
use super::process_instance::{ProcessInstance, ProcessInstanceId};
use super::work_item::{ExecutorId, WorkItem, WorkItemId};
use crate::CoreError;

/// Precondition checked inside the commit, before anything is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// The connector exists and is in the given state
    ConnectorState {
        /// Connector to check
        id: ConnectorInstanceId,
        /// Required state
        expected: ConnectorState,
    },
    /// The flow node exists and is in the given state
    FlowNodeState {
        /// Flow node to check
        id: FlowNodeInstanceId,
        /// Required state
        expected: ContainerState,
    },
    /// The process instance exists and is in the given state
    ProcessState {
        /// Process to check
        id: ProcessInstanceId,
        /// Required state
        expected: ContainerState,
    },
    /// The work item exists and is claimed by the given executor
    WorkClaimedBy {
        /// Work item to check
        id: WorkItemId,
        /// Required claimant
        executor: ExecutorId,
    },
    /// No work item at all exists for the sequence key
    NoWorkFor {
        /// Sequence key to check
        sequence_key: String,
    },
}

/// Merge of a single process variable
#[derive(Debug, Clone, PartialEq)]
pub struct VariableUpdate {
    /// Target process instance
    pub process_instance_id: ProcessInstanceId,
    /// Variable name
    pub name: String,
    /// New value
    pub value: Value,
}

/// A set of changes committed in one transaction
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    /// Preconditions; any failing guard aborts the whole unit
    pub guards: Vec<Guard>,
    /// Process instances to insert or replace
    pub process_instances: Vec<ProcessInstance>,
    /// Flow node instances to insert or replace
    pub flow_nodes: Vec<FlowNodeInstance>,
    /// Connector instances to insert or replace
    pub connectors: Vec<ConnectorInstance>,
    /// Process variables to merge
    pub variable_updates: Vec<VariableUpdate>,
    /// Work to enqueue; dropped when identical work is already pending
    pub enqueue: Vec<WorkItem>,
    /// Finished work to delete
    pub complete_work: Vec<WorkItemId>,
    /// Claimed work to put back in the queue
    pub release_work: Vec<WorkItemId>,
}

impl UnitOfWork {
    /// Empty unit
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a precondition
    pub fn guard(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    /// Insert or replace a process instance
    pub fn save_process(mut self, instance: ProcessInstance) -> Self {
        self.process_instances.push(instance);
        self
    }

    /// Insert or replace a flow node instance
    pub fn save_flow_node(mut self, node: FlowNodeInstance) -> Self {
        self.flow_nodes.push(node);
        self
    }

    /// Insert or replace a connector instance
    pub fn save_connector(mut self, connector: ConnectorInstance) -> Self {
        self.connectors.push(connector);
        self
    }

    /// Merge a process variable
    pub fn set_variable(
        mut self,
        process_instance_id: ProcessInstanceId,
        name: impl Into<String>,
        value: Value,
    ) -> Self {
        self.variable_updates.push(VariableUpdate {
            process_instance_id,
            name: name.into(),
            value,
        });
        self
    }

    /// Enqueue work
    pub fn enqueue(mut self, item: WorkItem) -> Self {
        self.enqueue.push(item);
        self
    }

    /// Delete finished work
    pub fn complete(mut self, id: WorkItemId) -> Self {
        self.complete_work.push(id);
        self
    }

    /// Put claimed work back in the queue
    pub fn release(mut self, id: WorkItemId) -> Self {
        self.release_work.push(id);
        self
    }

    /// Whether the unit changes nothing
    pub fn is_empty(&self) -> bool {
        self.process_instances.is_empty()
            && self.flow_nodes.is_empty()
            && self.connectors.is_empty()
            && self.variable_updates.is_empty()
            && self.enqueue.is_empty()
            && self.complete_work.is_empty()
            && self.release_work.is_empty()
    }
}

/// Sort order for connector instance queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorSortCriterion {
    /// Activation event, then execution index
    #[default]
    Default,
    /// Execution index ascending
    ExecutionOrderAsc,
    /// Execution index descending
    ExecutionOrderDesc,
    /// Name ascending
    NameAsc,
    /// Name descending
    NameDesc,
    /// State name ascending
    StateAsc,
    /// State name descending
    StateDesc,
    /// Activation event ascending
    ActivationEventAsc,
    /// Activation event descending
    ActivationEventDesc,
}

impl ConnectorSortCriterion {
    /// Compare two connectors; ties fall back to the id so pages are stable
    pub fn compare(&self, a: &ConnectorInstance, b: &ConnectorInstance) -> Ordering {
        let execution_order = |a: &ConnectorInstance, b: &ConnectorInstance| {
            a.execution_index
                .cmp(&b.execution_index)
                .then(a.activation_event.cmp(&b.activation_event))
        };
        let ordering = match self {
            ConnectorSortCriterion::Default => a
                .activation_event
                .cmp(&b.activation_event)
                .then(a.execution_index.cmp(&b.execution_index)),
            ConnectorSortCriterion::ExecutionOrderAsc => execution_order(a, b),
            ConnectorSortCriterion::ExecutionOrderDesc => execution_order(b, a),
            ConnectorSortCriterion::NameAsc => a.name.cmp(&b.name),
            ConnectorSortCriterion::NameDesc => b.name.cmp(&a.name),
            ConnectorSortCriterion::StateAsc => a.state.as_str().cmp(b.state.as_str()),
            ConnectorSortCriterion::StateDesc => b.state.as_str().cmp(a.state.as_str()),
            ConnectorSortCriterion::ActivationEventAsc => a.activation_event.cmp(&b.activation_event),
            ConnectorSortCriterion::ActivationEventDesc => b.activation_event.cmp(&a.activation_event),
        };
        ordering.then_with(|| a.id.cmp(&b.id))
    }
}

/// Paging parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Index of the first result
    pub from: usize,
    /// Maximum number of results
    pub count: usize,
    /// Sort order
    pub sort: ConnectorSortCriterion,
}

impl PageRequest {
    /// Build a page request
    pub fn new(from: usize, count: usize, sort: ConnectorSortCriterion) -> Self {
        Self { from, count, sort }
    }

    /// Sort and slice a full result set
    pub fn apply(&self, mut all: Vec<ConnectorInstance>) -> Page<ConnectorInstance> {
        all.sort_by(|a, b| self.sort.compare(a, b));
        let total = all.len();
        let items = all.into_iter().skip(self.from).take(self.count).collect();
        Page {
            items,
            total,
            from: self.from,
        }
    }
}

/// One page of results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Results on this page
    pub items: Vec<T>,
    /// Number of results across all pages
    pub total: usize,
    /// Index of the first result
    pub from: usize,
}

/// Repository for process definitions
#[async_trait]
pub trait ProcessDefinitionRepository: Send + Sync {
    /// Find a definition by ID
    async fn find_definition(
        &self,
        id: &ProcessDefinitionId,
    ) -> Result<Option<ProcessDefinition>, CoreError>;

    /// Save a definition
    async fn save_definition(&self, definition: &ProcessDefinition) -> Result<(), CoreError>;

    /// List all deployed definitions
    async fn list_definitions(&self) -> Result<Vec<ProcessDefinitionId>, CoreError>;
}

/// Repository for process instances
#[async_trait]
pub trait ProcessInstanceRepository: Send + Sync {
    /// Find a process instance by ID
    async fn find_process_instance(
        &self,
        id: &ProcessInstanceId,
    ) -> Result<Option<ProcessInstance>, CoreError>;

    /// Active process instances not updated since `older_than`
    async fn find_stale_process_instances(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ProcessInstance>, CoreError>;

    /// Delete a process instance with its flow nodes, connectors and work.
    /// Returns false when nothing was deleted.
    async fn delete_process_instance(&self, id: &ProcessInstanceId) -> Result<bool, CoreError>;
}

/// Repository for flow node instances
#[async_trait]
pub trait FlowNodeInstanceRepository: Send + Sync {
    /// Find a flow node by ID
    async fn find_flow_node(
        &self,
        id: &FlowNodeInstanceId,
    ) -> Result<Option<FlowNodeInstance>, CoreError>;

    /// All flow nodes of a process, oldest first
    async fn find_flow_nodes_of_process(
        &self,
        process_instance_id: &ProcessInstanceId,
    ) -> Result<Vec<FlowNodeInstance>, CoreError>;

    /// Active flow nodes not updated since `older_than`
    async fn find_stale_flow_nodes(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<FlowNodeInstance>, CoreError>;
}

/// Repository for connector instances
#[async_trait]
pub trait ConnectorInstanceRepository: Send + Sync {
    /// Find a connector instance by ID
    async fn find_connector_instance(
        &self,
        id: &ConnectorInstanceId,
    ) -> Result<Option<ConnectorInstance>, CoreError>;

    /// Every connector of a container, in default order
    async fn find_connectors_of_container(
        &self,
        container: &ContainerRef,
    ) -> Result<Vec<ConnectorInstance>, CoreError>;

    /// One page of a container's connectors
    async fn search_connectors_of_container(
        &self,
        container: &ContainerRef,
        page: &PageRequest,
    ) -> Result<Page<ConnectorInstance>, CoreError> {
        let all = self.find_connectors_of_container(container).await?;
        Ok(page.apply(all))
    }
}

/// Repository for the persisted work queue
#[async_trait]
pub trait WorkItemRepository: Send + Sync {
    /// Atomically claim the oldest pending item whose sequence has no
    /// claimed item
    async fn claim_next_work_item(
        &self,
        executor: &ExecutorId,
    ) -> Result<Option<WorkItem>, CoreError>;

    /// Find a work item by ID
    async fn find_work_item(&self, id: &WorkItemId) -> Result<Option<WorkItem>, CoreError>;

    /// All work queued or claimed for a sequence key
    async fn find_work_for_sequence(&self, sequence_key: &str)
        -> Result<Vec<WorkItem>, CoreError>;

    /// Work not claimed, released or created since `older_than`
    async fn find_stale_work_items(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>, CoreError>;

    /// Number of items waiting to be claimed
    async fn count_pending_work(&self) -> Result<usize, CoreError>;

    /// Refresh `updated_at` of an item `executor` still holds, so recovery
    /// does not take it for abandoned. Returns false when the claim is gone.
    async fn touch_claim(&self, id: &WorkItemId, executor: &ExecutorId) -> Result<bool, CoreError>;
}

/// Transactional writes
#[async_trait]
pub trait UnitOfWorkRepository: Send + Sync {
    /// Apply every change of the unit atomically.
    ///
    /// Fails with [`CoreError::ConcurrentModification`] and writes nothing
    /// when a guard does not hold.
    async fn commit(&self, unit: UnitOfWork) -> Result<(), CoreError>;
}

/// Everything the engine needs from a persistence backend
pub trait StateStore:
    ProcessDefinitionRepository
    + ProcessInstanceRepository
    + FlowNodeInstanceRepository
    + ConnectorInstanceRepository
    + WorkItemRepository
    + UnitOfWorkRepository
{
}

impl<T> StateStore for T where
    T: ProcessDefinitionRepository
        + ProcessInstanceRepository
        + FlowNodeInstanceRepository
        + ConnectorInstanceRepository
        + WorkItemRepository
        + UnitOfWorkRepository
{
}
