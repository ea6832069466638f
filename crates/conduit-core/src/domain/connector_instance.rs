use crate::domain::container::{ContainerRef, ContainerType};
use crate::domain::failure::FailureInfo;
use crate::domain::process_definition::ConnectorDefinition;
use crate::domain::process_instance::ProcessInstanceId;
use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Value object: Connector Instance ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectorInstanceId(pub String);

impl ConnectorInstanceId {
    /// Generate a fresh id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ConnectorInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectorInstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle point at which a connector fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivationEvent {
    /// Before the container's behaviour
    OnEnter,
    /// After the container's behaviour
    OnFinish,
}

impl ActivationEvent {
    /// Persisted name
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationEvent::OnEnter => "ON_ENTER",
            ActivationEvent::OnFinish => "ON_FINISH",
        }
    }
}

impl fmt::Display for ActivationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivationEvent {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ON_ENTER" => Ok(ActivationEvent::OnEnter),
            "ON_FINISH" => Ok(ActivationEvent::OnFinish),
            other => Err(CoreError::ValidationError(format!(
                "Unknown activation event: {}",
                other
            ))),
        }
    }
}

/// Execution state of a connector instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorState {
    /// Created, waiting for its turn
    ToBeExecuted,
    /// Dispatched to a worker
    Executing,
    /// Finished, outputs applied
    Done,
    /// Failed, waits for an operator
    Failed,
    /// Operator asked for another attempt
    ToReExecute,
    /// Operator gave up on it; outputs never applied
    Skipped,
}

impl ConnectorState {
    /// Persisted name
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorState::ToBeExecuted => "TO_BE_EXECUTED",
            ConnectorState::Executing => "EXECUTING",
            ConnectorState::Done => "DONE",
            ConnectorState::Failed => "FAILED",
            ConnectorState::ToReExecute => "TO_RE_EXECUTE",
            ConnectorState::Skipped => "SKIPPED",
        }
    }

    /// Satisfied connectors no longer block the ones after them
    pub fn is_satisfied(&self) -> bool {
        matches!(self, ConnectorState::Done | ConnectorState::Skipped)
    }

    /// Waiting to be dispatched
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, ConnectorState::ToBeExecuted | ConnectorState::ToReExecute)
    }

    /// The legal edges of the connector state machine
    pub fn can_transition_to(&self, next: ConnectorState) -> bool {
        use ConnectorState::*;
        matches!(
            (self, next),
            (ToBeExecuted, Executing)
                | (ToReExecute, Executing)
                | (Executing, Done)
                | (Executing, Failed)
                | (Failed, ToReExecute)
                | (Failed, Skipped)
        )
    }
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectorState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TO_BE_EXECUTED" => Ok(ConnectorState::ToBeExecuted),
            "EXECUTING" => Ok(ConnectorState::Executing),
            "DONE" => Ok(ConnectorState::Done),
            "FAILED" => Ok(ConnectorState::Failed),
            "TO_RE_EXECUTE" => Ok(ConnectorState::ToReExecute),
            "SKIPPED" => Ok(ConnectorState::Skipped),
            other => Err(CoreError::ValidationError(format!(
                "Unknown connector state: {}",
                other
            ))),
        }
    }
}

/// Target of an administrative reset of a failed connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorStateReset {
    /// Run the connector again on replay
    ToReExecute,
    /// Treat the connector as satisfied without applying outputs
    Skipped,
}

impl ConnectorStateReset {
    /// Resulting connector state
    pub fn target_state(&self) -> ConnectorState {
        match self {
            ConnectorStateReset::ToReExecute => ConnectorState::ToReExecute,
            ConnectorStateReset::Skipped => ConnectorState::Skipped,
        }
    }
}

/// Aggregate: one connector attached to a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorInstance {
    /// Unique identifier
    pub id: ConnectorInstanceId,

    /// Connector name within its container
    pub name: String,

    /// Connector implementation id
    pub connector_id: String,

    /// Connector implementation version
    pub version: String,

    /// When the connector fires
    pub activation_event: ActivationEvent,

    /// Owning container id
    pub container_id: String,

    /// Owning container kind
    pub container_type: ContainerType,

    /// Owning process instance, used for cascade deletion
    pub process_instance_id: ProcessInstanceId,

    /// Current state
    pub state: ConnectorState,

    /// Position within `(container, activation_event)`, dense from zero
    pub execution_index: u32,

    /// Present exactly when `state` is `Failed`
    pub failure_info: Option<FailureInfo>,

    /// Last state change
    pub updated_at: DateTime<Utc>,
}

impl ConnectorInstance {
    /// Materialize a connector definition for a container
    pub fn new(
        process_instance_id: ProcessInstanceId,
        container: &ContainerRef,
        definition: &ConnectorDefinition,
        execution_index: u32,
    ) -> Self {
        Self {
            id: ConnectorInstanceId::generate(),
            name: definition.name.clone(),
            connector_id: definition.connector_id.clone(),
            version: definition.version.clone(),
            activation_event: definition.activation_event,
            container_id: container.container_id().to_string(),
            container_type: container.container_type(),
            process_instance_id,
            state: ConnectorState::ToBeExecuted,
            execution_index,
            failure_info: None,
            updated_at: Utc::now(),
        }
    }

    /// Typed reference to the owning container
    pub fn container(&self) -> ContainerRef {
        ContainerRef::from_parts(&self.container_id, self.container_type)
    }

    /// Satisfied connectors no longer block the sequence
    pub fn is_satisfied(&self) -> bool {
        self.state.is_satisfied()
    }

    /// Dispatch the connector to a worker
    pub fn start_execution(&mut self) -> Result<(), CoreError> {
        self.transition(ConnectorState::Executing)
    }

    /// Record a successful run
    pub fn complete(&mut self) -> Result<(), CoreError> {
        self.transition(ConnectorState::Done)
    }

    /// Record a failed run with its diagnostics
    pub fn fail(&mut self, failure: FailureInfo) -> Result<(), CoreError> {
        self.transition(ConnectorState::Failed)?;
        self.failure_info = Some(failure);
        Ok(())
    }

    /// Administrative reset of a failed connector
    pub fn reset(&mut self, reset: ConnectorStateReset) -> Result<(), CoreError> {
        if self.state != ConnectorState::Failed {
            return Err(CoreError::InvalidStateTransition(format!(
                "Connector instance {} is {}, only FAILED connectors can be reset",
                self.id, self.state
            )));
        }
        self.transition(reset.target_state())
    }

    fn transition(&mut self, next: ConnectorState) -> Result<(), CoreError> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition(format!(
                "Connector instance {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        if next != ConnectorState::Failed {
            self.failure_info = None;
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}
