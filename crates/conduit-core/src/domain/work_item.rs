use crate::domain::connector_instance::ConnectorInstanceId;
use crate::domain::container::ContainerRef;
use crate::domain::process_instance::ProcessInstanceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Value object: Work Item ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItemId(pub String);

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value object: identity of a work executor that claims work
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutorId(pub String);

impl ExecutorId {
    /// Generate a fresh executor identity
    pub fn generate() -> Self {
        Self(format!("executor-{}", Uuid::new_v4()))
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a work item asks the engine to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkKind {
    /// Run one connector instance
    ExecuteConnector {
        /// The connector to run
        connector_instance_id: ConnectorInstanceId,
        /// Its container
        container: ContainerRef,
    },
    /// Move a container to its next lifecycle step
    AdvanceContainer {
        /// The container to advance
        container: ContainerRef,
    },
}

impl WorkKind {
    /// Container this work touches
    pub fn container(&self) -> &ContainerRef {
        match self {
            WorkKind::ExecuteConnector { container, .. } => container,
            WorkKind::AdvanceContainer { container } => container,
        }
    }
}

/// Queue status of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Waiting to be claimed
    Pending,
    /// Held by an executor
    Claimed,
}

impl WorkStatus {
    /// Persisted name
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Claimed => "claimed",
        }
    }
}

/// A persisted unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier
    pub id: WorkItemId,

    /// What to do
    pub kind: WorkKind,

    /// Owning process instance
    pub process_instance_id: ProcessInstanceId,

    /// Work sharing a key is executed one item at a time
    pub sequence_key: String,

    /// Queue status
    pub status: WorkStatus,

    /// Executor holding the claim
    pub claimed_by: Option<ExecutorId>,

    /// Number of times the item was claimed
    pub attempts: u32,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last claim, release or creation
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    fn new(process_instance_id: ProcessInstanceId, kind: WorkKind) -> Self {
        let now = Utc::now();
        Self {
            id: WorkItemId(Uuid::new_v4().to_string()),
            sequence_key: kind.container().sequence_key(),
            kind,
            process_instance_id,
            status: WorkStatus::Pending,
            claimed_by: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Work that runs one connector
    pub fn execute_connector(
        process_instance_id: ProcessInstanceId,
        container: ContainerRef,
        connector_instance_id: ConnectorInstanceId,
    ) -> Self {
        Self::new(
            process_instance_id,
            WorkKind::ExecuteConnector {
                connector_instance_id,
                container,
            },
        )
    }

    /// Work that advances a container
    pub fn advance(process_instance_id: ProcessInstanceId, container: ContainerRef) -> Self {
        Self::new(process_instance_id, WorkKind::AdvanceContainer { container })
    }

    /// Mark the item as held by an executor
    pub fn claim(&mut self, executor: &ExecutorId) {
        self.status = WorkStatus::Claimed;
        self.claimed_by = Some(executor.clone());
        self.attempts += 1;
        self.updated_at = Utc::now();
    }

    /// Put a claimed item back in the queue
    pub fn release(&mut self) {
        self.status = WorkStatus::Pending;
        self.claimed_by = None;
        self.updated_at = Utc::now();
    }

    /// Whether an executor holds the item
    pub fn is_claimed(&self) -> bool {
        self.status == WorkStatus::Claimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow_node_instance::FlowNodeInstanceId;

    #[test]
    fn test_claim_and_release() {
        let container = ContainerRef::FlowNode(FlowNodeInstanceId("n1".into()));
        let mut item = WorkItem::advance(ProcessInstanceId("p1".into()), container);
        assert_eq!(item.sequence_key, "flow_node:n1");
        assert!(!item.is_claimed());

        let executor = ExecutorId("e1".into());
        item.claim(&executor);
        assert!(item.is_claimed());
        assert_eq!(item.claimed_by, Some(executor));
        assert_eq!(item.attempts, 1);

        item.release();
        assert_eq!(item.status, WorkStatus::Pending);
        assert!(item.claimed_by.is_none());
        assert_eq!(item.attempts, 1);
    }

    #[test]
    fn test_connector_work_shares_container_key() {
        let container = ContainerRef::FlowNode(FlowNodeInstanceId("n1".into()));
        let item = WorkItem::execute_connector(
            ProcessInstanceId("p1".into()),
            container.clone(),
            ConnectorInstanceId("c1".into()),
        );
        assert_eq!(item.sequence_key, container.sequence_key());
        let json = serde_json::to_value(&item.kind).unwrap();
        assert_eq!(json["kind"], "execute_connector");
    }
}
