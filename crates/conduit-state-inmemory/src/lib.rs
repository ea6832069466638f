//! In-memory state store implementation for Conduit
//!
//! This crate provides an in-memory implementation of the repository
//! interfaces defined in conduit-core. All state lives behind a single
//! lock so every `UnitOfWork` is applied atomically. It is primarily useful
//! for development, testing, and single-process deployments where
//! persistence is not required.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use conduit_core::{
    ConnectorInstance, FlowNodeInstance, ProcessDefinition, ProcessInstance, WorkItem,
};

pub mod repositories;

#[cfg(test)]
mod tests;

/// A queued work item with its position in the queue
#[derive(Debug, Clone)]
pub(crate) struct QueuedWork {
    pub(crate) position: u64,
    pub(crate) item: WorkItem,
}

/// Everything the store holds
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub(crate) definitions: HashMap<String, ProcessDefinition>,
    pub(crate) processes: HashMap<String, ProcessInstance>,
    pub(crate) flow_nodes: HashMap<String, FlowNodeInstance>,
    pub(crate) connectors: HashMap<String, ConnectorInstance>,
    pub(crate) work: HashMap<String, QueuedWork>,
    pub(crate) next_position: u64,
}

/// In-memory state store
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStore {
    pub(crate) state: Arc<RwLock<StoreState>>,
}

impl InMemoryStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Every queued or claimed work item, oldest first
    pub async fn work_items(&self) -> Vec<WorkItem> {
        let state = self.state.read().await;
        let mut queued: Vec<&QueuedWork> = state.work.values().collect();
        queued.sort_by_key(|q| q.position);
        queued.into_iter().map(|q| q.item.clone()).collect()
    }

    /// Overwrite the timestamps recovery looks at, as if nothing had
    /// touched these elements since `at`
    pub async fn backdate(&self, at: chrono::DateTime<chrono::Utc>) {
        let mut state = self.state.write().await;
        for queued in state.work.values_mut() {
            queued.item.updated_at = at;
        }
        for node in state.flow_nodes.values_mut() {
            node.last_update = at;
        }
        for process in state.processes.values_mut() {
            process.last_update = at;
        }
    }
}
