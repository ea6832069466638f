use crate::domain::container::{self, ContainerRef, ContainerState};
use crate::domain::process_instance::ProcessInstanceId;
use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Value object: Flow Node Instance ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowNodeInstanceId(pub String);

impl FlowNodeInstanceId {
    /// Generate a fresh id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for FlowNodeInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Aggregate: one executing activity of a process instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNodeInstance {
    /// Unique identifier
    pub id: FlowNodeInstanceId,

    /// Owning process instance
    pub process_instance_id: ProcessInstanceId,

    /// Flow node definition name
    pub name: String,

    /// Current lifecycle state
    pub state: ContainerState,

    /// Phase the node was in when it failed
    pub previous_state: Option<ContainerState>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last persisted change, used by recovery to find stuck nodes
    pub last_update: DateTime<Utc>,
}

impl FlowNodeInstance {
    /// Create a new flow node instance
    pub fn new(process_instance_id: ProcessInstanceId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: FlowNodeInstanceId::generate(),
            process_instance_id,
            name: name.into(),
            state: ContainerState::Initializing,
            previous_state: None,
            created_at: now,
            last_update: now,
        }
    }

    /// Typed container reference
    pub fn container(&self) -> ContainerRef {
        ContainerRef::FlowNode(self.id.clone())
    }

    /// Move to the next lifecycle state
    pub fn transition_to(&mut self, next: ContainerState) -> Result<(), CoreError> {
        let container = self.container();
        container::transition(&container, &mut self.state, &mut self.previous_state, next)?;
        self.touch();
        Ok(())
    }

    /// Halt the node after a connector failure
    pub fn fail(&mut self) -> Result<(), CoreError> {
        self.transition_to(ContainerState::Failed)
    }

    /// Return a failed node to the phase it was halted in
    pub fn resume_after_failure(&mut self) -> Result<ContainerState, CoreError> {
        let container = self.container();
        let resumed =
            container::resume_after_failure(&container, &mut self.state, &mut self.previous_state)?;
        self.touch();
        Ok(resumed)
    }

    /// Refresh the last update timestamp
    #[inline]
    pub fn touch(&mut self) {
        self.last_update = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_and_resume() {
        let mut node = FlowNodeInstance::new(ProcessInstanceId("p1".into()), "review");
        node.transition_to(ContainerState::ExecutingOnEnterConnectors).unwrap();
        node.fail().unwrap();
        assert_eq!(node.state, ContainerState::Failed);
        assert_eq!(node.previous_state, Some(ContainerState::ExecutingOnEnterConnectors));

        let resumed = node.resume_after_failure().unwrap();
        assert_eq!(resumed, ContainerState::ExecutingOnEnterConnectors);
        assert!(node.previous_state.is_none());
        assert!(node.resume_after_failure().is_err());
    }
}
