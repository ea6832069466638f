use crate::domain::container::{self, ContainerRef, ContainerState};
use crate::domain::process_definition::ProcessDefinitionId;
use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Value object: Process Instance ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessInstanceId(pub String);

impl ProcessInstanceId {
    /// Generate a fresh id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ProcessInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Aggregate: a running process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    /// Unique identifier
    pub id: ProcessInstanceId,

    /// Definition this instance runs
    pub definition_id: ProcessDefinitionId,

    /// Current lifecycle state
    pub state: ContainerState,

    /// Phase the process was in when it failed
    pub previous_state: Option<ContainerState>,

    /// Process data; connector output operations write here
    pub variables: Map<String, Value>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last persisted change
    pub last_update: DateTime<Utc>,
}

impl ProcessInstance {
    /// Create a new process instance
    pub fn new(definition_id: ProcessDefinitionId, variables: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: ProcessInstanceId::generate(),
            definition_id,
            state: ContainerState::Initializing,
            previous_state: None,
            variables,
            created_at: now,
            last_update: now,
        }
    }

    /// Typed container reference
    pub fn container(&self) -> ContainerRef {
        ContainerRef::Process(self.id.clone())
    }

    /// Move to the next lifecycle state
    pub fn transition_to(&mut self, next: ContainerState) -> Result<(), CoreError> {
        let container = self.container();
        container::transition(&container, &mut self.state, &mut self.previous_state, next)?;
        self.touch();
        Ok(())
    }

    /// Halt the process after a process-level connector failure
    pub fn fail(&mut self) -> Result<(), CoreError> {
        self.transition_to(ContainerState::Failed)
    }

    /// Read a process variable
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Refresh the last update timestamp
    #[inline]
    pub fn touch(&mut self) {
        self.last_update = Utc::now();
    }
}
