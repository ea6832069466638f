use crate::domain::connector_instance::{ConnectorInstanceId, ConnectorState};
use crate::domain::failure::FailureInfo;
use crate::domain::flow_node_instance::FlowNodeInstanceId;
use crate::domain::process_definition::ProcessDefinitionId;
use crate::domain::process_instance::ProcessInstanceId;
use crate::CoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Domain event trait for all events in the system
pub trait DomainEvent: Debug + Send + Sync {
    /// Returns the type of the event as a string
    fn event_type(&self) -> &'static str;

    /// Returns the process instance this event is associated with
    fn process_instance_id(&self) -> &ProcessInstanceId;

    /// Returns the timestamp when the event occurred
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Receives events after the change they describe has been committed
#[async_trait]
pub trait DomainEventHandler: Send + Sync {
    /// Handle a domain event
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError>;
}

/// Default handler: writes every event to the log
#[derive(Debug, Default, Clone)]
pub struct TracingEventHandler;

#[async_trait]
impl DomainEventHandler for TracingEventHandler {
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError> {
        tracing::debug!(
            event_type = event.event_type(),
            process_instance_id = %event.process_instance_id(),
            event = ?event,
            "domain event"
        );
        Ok(())
    }
}

macro_rules! impl_domain_event {
    ($event:ty, $name:literal) => {
        impl DomainEvent for $event {
            fn event_type(&self) -> &'static str {
                $name
            }

            fn process_instance_id(&self) -> &ProcessInstanceId {
                &self.process_instance_id
            }

            fn timestamp(&self) -> DateTime<Utc> {
                self.timestamp
            }
        }
    };
}

/// Event: process instance started
#[derive(Debug)]
pub struct ProcessInstanceStarted {
    /// The process instance
    pub process_instance_id: ProcessInstanceId,
    /// Its definition
    pub definition_id: ProcessDefinitionId,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}
impl_domain_event!(ProcessInstanceStarted, "process_instance.started");

/// Event: process instance completed
#[derive(Debug)]
pub struct ProcessInstanceCompleted {
    /// The process instance
    pub process_instance_id: ProcessInstanceId,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}
impl_domain_event!(ProcessInstanceCompleted, "process_instance.completed");

/// Event: a process-level connector failed and halted the process
#[derive(Debug)]
pub struct ProcessInstanceFailed {
    /// The process instance
    pub process_instance_id: ProcessInstanceId,
    /// The connector that failed
    pub connector_instance_id: Option<ConnectorInstanceId>,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}
impl_domain_event!(ProcessInstanceFailed, "process_instance.failed");

/// Event: flow node completed
#[derive(Debug)]
pub struct FlowNodeCompleted {
    /// The owning process instance
    pub process_instance_id: ProcessInstanceId,
    /// The flow node
    pub flow_node_id: FlowNodeInstanceId,
    /// Flow node name
    pub name: String,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}
impl_domain_event!(FlowNodeCompleted, "flow_node.completed");

/// Event: flow node halted by a failure
#[derive(Debug)]
pub struct FlowNodeFailed {
    /// The owning process instance
    pub process_instance_id: ProcessInstanceId,
    /// The flow node
    pub flow_node_id: FlowNodeInstanceId,
    /// The connector that failed, if the failure came from one
    pub connector_instance_id: Option<ConnectorInstanceId>,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}
impl_domain_event!(FlowNodeFailed, "flow_node.failed");

/// Event: connector finished successfully
#[derive(Debug)]
pub struct ConnectorExecuted {
    /// The owning process instance
    pub process_instance_id: ProcessInstanceId,
    /// The connector
    pub connector_instance_id: ConnectorInstanceId,
    /// Connector name
    pub name: String,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}
impl_domain_event!(ConnectorExecuted, "connector.executed");

/// Event: connector failed
#[derive(Debug)]
pub struct ConnectorFailed {
    /// The owning process instance
    pub process_instance_id: ProcessInstanceId,
    /// The connector
    pub connector_instance_id: ConnectorInstanceId,
    /// Recorded diagnostics
    pub failure: FailureInfo,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}
impl_domain_event!(ConnectorFailed, "connector.failed");

/// Event: an operator reset a failed connector
#[derive(Debug)]
pub struct ConnectorStateWasReset {
    /// The owning process instance
    pub process_instance_id: ProcessInstanceId,
    /// The connector
    pub connector_instance_id: ConnectorInstanceId,
    /// The state it was reset to
    pub state: ConnectorState,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}
impl_domain_event!(ConnectorStateWasReset, "connector.state_reset");

/// Event: an operator replayed a failed flow node
#[derive(Debug)]
pub struct ActivityReplayed {
    /// The owning process instance
    pub process_instance_id: ProcessInstanceId,
    /// The flow node
    pub flow_node_id: FlowNodeInstanceId,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}
impl_domain_event!(ActivityReplayed, "flow_node.replayed");

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracing_handler_accepts_events() {
        let handler = TracingEventHandler;
        let event = ActivityReplayed {
            process_instance_id: ProcessInstanceId("p1".into()),
            flow_node_id: FlowNodeInstanceId("n1".into()),
            timestamp: Utc::now(),
        };
        assert_eq!(event.event_type(), "flow_node.replayed");
        assert_eq!(event.process_instance_id().0, "p1");
        handler.handle_event(Box::new(event)).await.unwrap();
    }
}
