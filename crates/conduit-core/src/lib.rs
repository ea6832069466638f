//!
//! Conduit Core - connector execution engine
//!
//! This crate holds the domain model (connector instances, flow nodes,
//! process instances, the persisted work queue), the repository
//! interfaces, and the application services that drive connectors: the
//! flow node executor, replay coordinator, work executor and recovery
//! service.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

/// Domain layer - core business models, entities, and rules
pub mod domain;

/// Application services - core application logic
pub mod application;

/// Engine configuration
pub mod config;

/// Core types
pub mod types;

/// Error types
pub mod error;

// Re-export key types
pub use config::EngineConfig;
pub use error::CoreError;
pub use types::{BoxError, DataPacket, LogLevel};

pub use application::connector_invoker::{
    ConnectorInvoker, ConnectorRegistry, ExpressionContext, InMemoryConnectorRegistry,
    LiteralExpressionContext,
};
pub use application::flow_node_executor::FlowNodeExecutor;
pub use application::process_admin::ProcessAdmin;
pub use application::recovery_service::{RecoveryReport, RecoveryService};
pub use application::replay_coordinator::ReplayCoordinator;
pub use application::work_executor::{
    ExecutorLifecycle, WorkExecutorConfig, WorkExecutorService, WorkHandler,
};

pub use domain::connector_instance::{
    ActivationEvent, ConnectorInstance, ConnectorInstanceId, ConnectorState, ConnectorStateReset,
};
pub use domain::container::{ContainerRef, ContainerState, ContainerType};
pub use domain::events::{DomainEvent, DomainEventHandler, TracingEventHandler};
pub use domain::failure::{FailureInfo, FailureKind};
pub use domain::flow_node_instance::{FlowNodeInstance, FlowNodeInstanceId};
pub use domain::process_definition::{
    ConnectorDefinition, FlowNodeDefinition, OutputOperation, ProcessDefinition,
    ProcessDefinitionId,
};
pub use domain::process_instance::{ProcessInstance, ProcessInstanceId};
pub use domain::repository::{ConnectorSortCriterion, Page, PageRequest, StateStore, UnitOfWork};
pub use domain::work_item::{ExecutorId, WorkItem, WorkItemId, WorkKind};

/// A connector implementation
#[async_trait]
pub trait ConnectorExecutor: Send + Sync {
    /// Implementation id, as referenced by connector definitions
    fn connector_id(&self) -> &str;

    /// Run the connector.
    ///
    /// Inputs are read and outputs written through `api`. An error fails
    /// the connector instance; its `source()` chain is kept as diagnostics.
    async fn execute(&self, api: Arc<dyn ConnectorRuntimeApi>) -> Result<(), BoxError>;
}

/// Runtime API handed to a connector for one invocation
pub trait ConnectorRuntimeApi: Send + Sync {
    /// The connector instance being executed
    fn connector_instance_id(&self) -> &ConnectorInstanceId;

    /// The owning process instance
    fn process_instance_id(&self) -> &ProcessInstanceId;

    /// Get an evaluated input by name
    fn get_input(&self, name: &str) -> Result<DataPacket, CoreError>;

    /// All evaluated inputs
    fn inputs(&self) -> HashMap<String, DataPacket>;

    /// Set an output value by name
    fn set_output(&self, name: &str, value: DataPacket) -> Result<(), CoreError>;

    /// Log with the connector context attached
    fn log(&self, level: LogLevel, message: &str);
}
