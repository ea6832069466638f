use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use conduit_core::{
    domain::repository::{
        ConnectorInstanceRepository, FlowNodeInstanceRepository, Guard,
        ProcessDefinitionRepository, ProcessInstanceRepository, UnitOfWork,
        UnitOfWorkRepository, WorkItemRepository,
    },
    domain::work_item::WorkStatus,
    ConnectorInstance, ConnectorInstanceId, ConnectorSortCriterion, ContainerRef, CoreError,
    ExecutorId, FlowNodeInstance, FlowNodeInstanceId, ProcessDefinition, ProcessDefinitionId,
    ProcessInstance, ProcessInstanceId, WorkItem, WorkItemId,
};

use crate::{InMemoryStateStore, QueuedWork, StoreState};

impl StoreState {
    fn check_guard(&self, guard: &Guard) -> Result<(), CoreError> {
        let holds = match guard {
            Guard::ConnectorState { id, expected } => {
                self.connectors.get(&id.0).map(|c| c.state) == Some(*expected)
            }
            Guard::FlowNodeState { id, expected } => {
                self.flow_nodes.get(&id.0).map(|n| n.state) == Some(*expected)
            }
            Guard::ProcessState { id, expected } => {
                self.processes.get(&id.0).map(|p| p.state) == Some(*expected)
            }
            Guard::WorkClaimedBy { id, executor } => self
                .work
                .get(&id.0)
                .map(|q| q.item.status == WorkStatus::Claimed && q.item.claimed_by.as_ref() == Some(executor))
                .unwrap_or(false),
            Guard::NoWorkFor { sequence_key } => {
                !self.work.values().any(|q| &q.item.sequence_key == sequence_key)
            }
        };
        if holds {
            Ok(())
        } else {
            Err(CoreError::ConcurrentModification(format!(
                "Guard failed: {:?}",
                guard
            )))
        }
    }

    fn apply(&mut self, unit: UnitOfWork) {
        for process in unit.process_instances {
            match self.processes.get_mut(&process.id.0) {
                // Variables of a stored process change only through merges
                Some(existing) => {
                    existing.state = process.state;
                    existing.previous_state = process.previous_state;
                    existing.last_update = process.last_update;
                }
                None => {
                    self.processes.insert(process.id.0.clone(), process);
                }
            }
        }
        for node in unit.flow_nodes {
            self.flow_nodes.insert(node.id.0.clone(), node);
        }
        for connector in unit.connectors {
            self.connectors.insert(connector.id.0.clone(), connector);
        }
        for update in unit.variable_updates {
            if let Some(process) = self.processes.get_mut(&update.process_instance_id.0) {
                process.variables.insert(update.name, update.value);
            }
        }
        for id in unit.complete_work {
            self.work.remove(&id.0);
        }
        for id in unit.release_work {
            let Some(released) = self.work.get(&id.0).map(|q| q.item.clone()) else {
                continue;
            };
            let superseded = self.work.values().any(|q| {
                q.item.status == WorkStatus::Pending
                    && q.item.sequence_key == released.sequence_key
                    && q.item.kind == released.kind
            });
            if superseded {
                self.work.remove(&id.0);
            } else if let Some(queued) = self.work.get_mut(&id.0) {
                queued.item.release();
            }
        }
        for item in unit.enqueue {
            let duplicate = self.work.values().any(|q| {
                q.item.status == WorkStatus::Pending
                    && q.item.sequence_key == item.sequence_key
                    && q.item.kind == item.kind
            });
            if duplicate {
                debug!(sequence_key = %item.sequence_key, "Identical work already queued");
                continue;
            }
            let position = self.next_position;
            self.next_position += 1;
            self.work
                .insert(item.id.0.clone(), QueuedWork { position, item });
        }
    }
}

#[async_trait]
impl UnitOfWorkRepository for InMemoryStateStore {
    async fn commit(&self, unit: UnitOfWork) -> Result<(), CoreError> {
        let mut state = self.state.write().await;

        for guard in &unit.guards {
            state.check_guard(guard)?;
        }
        for update in &unit.variable_updates {
            let known = state.processes.contains_key(&update.process_instance_id.0)
                || unit
                    .process_instances
                    .iter()
                    .any(|p| p.id == update.process_instance_id);
            if !known {
                return Err(CoreError::ProcessInstanceNotFound(
                    update.process_instance_id.0.clone(),
                ));
            }
        }

        state.apply(unit);
        Ok(())
    }
}

#[async_trait]
impl ProcessDefinitionRepository for InMemoryStateStore {
    async fn find_definition(
        &self,
        id: &ProcessDefinitionId,
    ) -> Result<Option<ProcessDefinition>, CoreError> {
        let state = self.state.read().await;
        Ok(state.definitions.get(&id.0).cloned())
    }

    async fn save_definition(&self, definition: &ProcessDefinition) -> Result<(), CoreError> {
        let mut state = self.state.write().await;
        state
            .definitions
            .insert(definition.id.0.clone(), definition.clone());
        Ok(())
    }

    async fn list_definitions(&self) -> Result<Vec<ProcessDefinitionId>, CoreError> {
        let state = self.state.read().await;
        let mut ids: Vec<ProcessDefinitionId> =
            state.definitions.values().map(|d| d.id.clone()).collect();
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(ids)
    }
}

#[async_trait]
impl ProcessInstanceRepository for InMemoryStateStore {
    async fn find_process_instance(
        &self,
        id: &ProcessInstanceId,
    ) -> Result<Option<ProcessInstance>, CoreError> {
        let state = self.state.read().await;
        Ok(state.processes.get(&id.0).cloned())
    }

    async fn find_stale_process_instances(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ProcessInstance>, CoreError> {
        let state = self.state.read().await;
        Ok(state
            .processes
            .values()
            .filter(|p| p.state.is_active() && p.last_update < older_than)
            .cloned()
            .collect())
    }

    async fn delete_process_instance(&self, id: &ProcessInstanceId) -> Result<bool, CoreError> {
        let mut state = self.state.write().await;
        if state.processes.remove(&id.0).is_none() {
            return Ok(false);
        }
        state.flow_nodes.retain(|_, n| &n.process_instance_id != id);
        state.connectors.retain(|_, c| &c.process_instance_id != id);
        state.work.retain(|_, q| &q.item.process_instance_id != id);
        Ok(true)
    }
}

#[async_trait]
impl FlowNodeInstanceRepository for InMemoryStateStore {
    async fn find_flow_node(
        &self,
        id: &FlowNodeInstanceId,
    ) -> Result<Option<FlowNodeInstance>, CoreError> {
        let state = self.state.read().await;
        Ok(state.flow_nodes.get(&id.0).cloned())
    }

    async fn find_flow_nodes_of_process(
        &self,
        process_instance_id: &ProcessInstanceId,
    ) -> Result<Vec<FlowNodeInstance>, CoreError> {
        let state = self.state.read().await;
        let mut nodes: Vec<FlowNodeInstance> = state
            .flow_nodes
            .values()
            .filter(|n| &n.process_instance_id == process_instance_id)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.0.cmp(&b.id.0)));
        Ok(nodes)
    }

    async fn find_stale_flow_nodes(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<FlowNodeInstance>, CoreError> {
        let state = self.state.read().await;
        Ok(state
            .flow_nodes
            .values()
            .filter(|n| n.state.is_active() && n.last_update < older_than)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ConnectorInstanceRepository for InMemoryStateStore {
    async fn find_connector_instance(
        &self,
        id: &ConnectorInstanceId,
    ) -> Result<Option<ConnectorInstance>, CoreError> {
        let state = self.state.read().await;
        Ok(state.connectors.get(&id.0).cloned())
    }

    async fn find_connectors_of_container(
        &self,
        container: &ContainerRef,
    ) -> Result<Vec<ConnectorInstance>, CoreError> {
        let state = self.state.read().await;
        let mut connectors: Vec<ConnectorInstance> = state
            .connectors
            .values()
            .filter(|c| {
                c.container_type == container.container_type()
                    && c.container_id == container.container_id()
            })
            .cloned()
            .collect();
        connectors.sort_by(|a, b| ConnectorSortCriterion::Default.compare(a, b));
        Ok(connectors)
    }
}

#[async_trait]
impl WorkItemRepository for InMemoryStateStore {
    async fn claim_next_work_item(
        &self,
        executor: &ExecutorId,
    ) -> Result<Option<WorkItem>, CoreError> {
        let mut state = self.state.write().await;

        let busy: Vec<String> = state
            .work
            .values()
            .filter(|q| q.item.status == WorkStatus::Claimed)
            .map(|q| q.item.sequence_key.clone())
            .collect();

        let next = state
            .work
            .values()
            .filter(|q| q.item.status == WorkStatus::Pending && !busy.contains(&q.item.sequence_key))
            .min_by_key(|q| q.position)
            .map(|q| q.item.id.0.clone());

        Ok(next.and_then(|id| {
            state.work.get_mut(&id).map(|queued| {
                queued.item.claim(executor);
                queued.item.clone()
            })
        }))
    }

    async fn find_work_item(&self, id: &WorkItemId) -> Result<Option<WorkItem>, CoreError> {
        let state = self.state.read().await;
        Ok(state.work.get(&id.0).map(|q| q.item.clone()))
    }

    async fn find_work_for_sequence(
        &self,
        sequence_key: &str,
    ) -> Result<Vec<WorkItem>, CoreError> {
        let state = self.state.read().await;
        let mut queued: Vec<&QueuedWork> = state
            .work
            .values()
            .filter(|q| q.item.sequence_key == sequence_key)
            .collect();
        queued.sort_by_key(|q| q.position);
        Ok(queued.into_iter().map(|q| q.item.clone()).collect())
    }

    async fn find_stale_work_items(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>, CoreError> {
        let state = self.state.read().await;
        let mut queued: Vec<&QueuedWork> = state
            .work
            .values()
            .filter(|q| q.item.updated_at < older_than)
            .collect();
        queued.sort_by_key(|q| q.position);
        Ok(queued.into_iter().map(|q| q.item.clone()).collect())
    }

    async fn count_pending_work(&self) -> Result<usize, CoreError> {
        let state = self.state.read().await;
        Ok(state
            .work
            .values()
            .filter(|q| q.item.status == WorkStatus::Pending)
            .count())
    }

    async fn touch_claim(&self, id: &WorkItemId, executor: &ExecutorId) -> Result<bool, CoreError> {
        let mut state = self.state.write().await;
        match state.work.get_mut(&id.0) {
            Some(queued)
                if queued.item.status == WorkStatus::Claimed
                    && queued.item.claimed_by.as_ref() == Some(executor) =>
            {
                queued.item.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
