//! Connector containers: flow node instances and process instances.
//!
//! Both kinds of container share one lifecycle. They run their ON_ENTER
//! connectors, then their own behaviour, then their ON_FINISH connectors,
//! and complete. A failed connector moves the container to `Failed`, which
//! remembers the phase it was halted in.

use crate::domain::connector_instance::ActivationEvent;
use crate::domain::flow_node_instance::FlowNodeInstanceId;
use crate::domain::process_instance::ProcessInstanceId;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of entity a connector instance is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerType {
    /// Attached to a flow node instance
    FlowNode,
    /// Attached to a process instance
    Process,
}

impl ContainerType {
    /// Persisted name
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerType::FlowNode => "FLOW_NODE",
            ContainerType::Process => "PROCESS",
        }
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FLOW_NODE" => Ok(ContainerType::FlowNode),
            "PROCESS" => Ok(ContainerType::Process),
            other => Err(CoreError::ValidationError(format!(
                "Unknown container type: {}",
                other
            ))),
        }
    }
}

/// Typed reference to a connector container
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ContainerRef {
    /// A flow node instance
    FlowNode(FlowNodeInstanceId),
    /// A process instance
    Process(ProcessInstanceId),
}

impl ContainerRef {
    /// Build a reference from the persisted `(container_id, container_type)` pair
    pub fn from_parts(container_id: &str, container_type: ContainerType) -> Self {
        match container_type {
            ContainerType::FlowNode => {
                ContainerRef::FlowNode(FlowNodeInstanceId(container_id.to_string()))
            }
            ContainerType::Process => {
                ContainerRef::Process(ProcessInstanceId(container_id.to_string()))
            }
        }
    }

    /// The kind of container
    pub fn container_type(&self) -> ContainerType {
        match self {
            ContainerRef::FlowNode(_) => ContainerType::FlowNode,
            ContainerRef::Process(_) => ContainerType::Process,
        }
    }

    /// The raw container id
    pub fn container_id(&self) -> &str {
        match self {
            ContainerRef::FlowNode(id) => &id.0,
            ContainerRef::Process(id) => &id.0,
        }
    }

    /// Queue key serializing all work that touches this container
    pub fn sequence_key(&self) -> String {
        match self {
            ContainerRef::FlowNode(id) => format!("flow_node:{}", id.0),
            ContainerRef::Process(id) => format!("process:{}", id.0),
        }
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sequence_key())
    }
}

/// Lifecycle state shared by flow node and process instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// Created, nothing run yet
    Initializing,
    /// Running ON_ENTER connectors
    ExecutingOnEnterConnectors,
    /// Running the container's own behaviour
    Executing,
    /// Running ON_FINISH connectors
    ExecutingOnFinishConnectors,
    /// Finished
    Completed,
    /// Halted by a failure; waits for an operator
    Failed,
}

impl ContainerState {
    /// Stable numeric id, persisted as `state_id`
    pub fn state_id(&self) -> i32 {
        match self {
            ContainerState::Initializing => 0,
            ContainerState::ExecutingOnEnterConnectors => 1,
            ContainerState::Executing => 2,
            ContainerState::ExecutingOnFinishConnectors => 3,
            ContainerState::Completed => 4,
            ContainerState::Failed => 5,
        }
    }

    /// Stable name, persisted as `state_name`
    pub fn state_name(&self) -> &'static str {
        match self {
            ContainerState::Initializing => "initializing",
            ContainerState::ExecutingOnEnterConnectors => "executing_on_enter_connectors",
            ContainerState::Executing => "executing",
            ContainerState::ExecutingOnFinishConnectors => "executing_on_finish_connectors",
            ContainerState::Completed => "completed",
            ContainerState::Failed => "failed",
        }
    }

    /// Inverse of [`ContainerState::state_id`]
    pub fn from_state_id(id: i32) -> Option<Self> {
        match id {
            0 => Some(ContainerState::Initializing),
            1 => Some(ContainerState::ExecutingOnEnterConnectors),
            2 => Some(ContainerState::Executing),
            3 => Some(ContainerState::ExecutingOnFinishConnectors),
            4 => Some(ContainerState::Completed),
            5 => Some(ContainerState::Failed),
            _ => None,
        }
    }

    /// The connector phase for a given activation event
    pub fn phase_for(event: ActivationEvent) -> Self {
        match event {
            ActivationEvent::OnEnter => ContainerState::ExecutingOnEnterConnectors,
            ActivationEvent::OnFinish => ContainerState::ExecutingOnFinishConnectors,
        }
    }

    /// Which connectors run in this state, if any
    pub fn connector_phase(&self) -> Option<ActivationEvent> {
        match self {
            ContainerState::ExecutingOnEnterConnectors => Some(ActivationEvent::OnEnter),
            ContainerState::ExecutingOnFinishConnectors => Some(ActivationEvent::OnFinish),
            _ => None,
        }
    }

    /// Still making progress: neither completed nor failed
    pub fn is_active(&self) -> bool {
        !matches!(self, ContainerState::Completed | ContainerState::Failed)
    }

    fn can_transition_to(&self, next: ContainerState) -> bool {
        use ContainerState::*;
        match (self, next) {
            (Initializing, ExecutingOnEnterConnectors) => true,
            (ExecutingOnEnterConnectors, Executing) => true,
            (Executing, ExecutingOnFinishConnectors) => true,
            (ExecutingOnFinishConnectors, Completed) => true,
            (current, Failed) => current.is_active(),
            _ => false,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

/// Apply a lifecycle transition to a container's state fields.
///
/// Failing records the phase that was interrupted in `previous`.
pub(crate) fn transition(
    container: &ContainerRef,
    state: &mut ContainerState,
    previous: &mut Option<ContainerState>,
    next: ContainerState,
) -> Result<(), CoreError> {
    if !state.can_transition_to(next) {
        return Err(CoreError::InvalidStateTransition(format!(
            "{} cannot move from {} to {}",
            container, state, next
        )));
    }
    if next == ContainerState::Failed {
        *previous = Some(*state);
    }
    *state = next;
    Ok(())
}

/// Move a failed container back to the phase it was halted in.
pub(crate) fn resume_after_failure(
    container: &ContainerRef,
    state: &mut ContainerState,
    previous: &mut Option<ContainerState>,
) -> Result<ContainerState, CoreError> {
    if *state != ContainerState::Failed {
        return Err(CoreError::InvalidStateTransition(format!(
            "{} is {} and cannot be replayed, only failed elements can",
            container, state
        )));
    }
    // A failure recorded without a phase resumes from the start of the lifecycle
    let resumed = previous.take().unwrap_or(ContainerState::Initializing);
    *state = resumed;
    Ok(resumed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> ContainerRef {
        ContainerRef::FlowNode(FlowNodeInstanceId("n1".to_string()))
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let mut state = ContainerState::Initializing;
        let mut previous = None;
        for next in [
            ContainerState::ExecutingOnEnterConnectors,
            ContainerState::Executing,
            ContainerState::ExecutingOnFinishConnectors,
            ContainerState::Completed,
        ] {
            transition(&node(), &mut state, &mut previous, next).unwrap();
        }
        assert_eq!(state, ContainerState::Completed);
        assert!(previous.is_none());
    }

    #[test]
    fn test_failure_remembers_phase_and_resumes() {
        let mut state = ContainerState::ExecutingOnFinishConnectors;
        let mut previous = None;
        transition(&node(), &mut state, &mut previous, ContainerState::Failed).unwrap();
        assert_eq!(previous, Some(ContainerState::ExecutingOnFinishConnectors));

        let resumed = resume_after_failure(&node(), &mut state, &mut previous).unwrap();
        assert_eq!(resumed, ContainerState::ExecutingOnFinishConnectors);
        assert_eq!(state, ContainerState::ExecutingOnFinishConnectors);
        assert!(previous.is_none());
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let mut state = ContainerState::Completed;
        let mut previous = None;
        let err = transition(&node(), &mut state, &mut previous, ContainerState::Failed)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition(_)));

        let mut state = ContainerState::Initializing;
        assert!(transition(&node(), &mut state, &mut previous, ContainerState::Completed).is_err());
        assert!(resume_after_failure(&node(), &mut state, &mut previous).is_err());
    }

    #[test]
    fn test_state_ids_round_trip_and_keys() {
        for id in 0..6 {
            let state = ContainerState::from_state_id(id).unwrap();
            assert_eq!(state.state_id(), id);
        }
        assert!(ContainerState::from_state_id(42).is_none());
        assert_eq!(node().sequence_key(), "flow_node:n1");
        assert_eq!(
            ContainerRef::from_parts("p1", ContainerType::Process).sequence_key(),
            "process:p1"
        );
    }
}
