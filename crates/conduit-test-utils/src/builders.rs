//! TestEngine builder and handles for integration testing.

use async_trait::async_trait;
use conduit_core::{
    domain::repository::{
        ConnectorInstanceRepository, FlowNodeInstanceRepository, ProcessInstanceRepository,
    },
    ConnectorExecutor, ConnectorInstance, ConnectorInvoker, ContainerState, CoreError,
    DomainEvent, DomainEventHandler, FlowNodeExecutor, FlowNodeInstance,
    InMemoryConnectorRegistry, LiteralExpressionContext, ProcessAdmin, ProcessDefinition,
    ProcessInstance, ProcessInstanceId, RecoveryService, ReplayCoordinator, StateStore,
    WorkExecutorConfig, WorkExecutorService,
};
use conduit_state_inmemory::InMemoryStateStore;
use serde_json::Map;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::connectors::{AlwaysFailingConnector, NoOpConnector};
use crate::util::{init_test_logging, Deadline, DEFAULT_TIMEOUT};
use crate::TestError;

/// Remembers the type of every published domain event
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<&'static str>>,
}

impl RecordingEventHandler {
    /// Event types in publication order
    pub fn events(&self) -> Vec<&'static str> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// How many events of `event_type` were published
    pub fn count(&self, event_type: &str) -> usize {
        self.events().iter().filter(|e| **e == event_type).count()
    }
}

#[async_trait]
impl DomainEventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| CoreError::Other("event log poisoned".to_string()))?;
        events.push(event.event_type());
        Ok(())
    }
}

/// Builds a [`TestEngine`].
///
/// `noop` and `always-fails` are registered by default.
pub struct TestEngineBuilder {
    store: InMemoryStateStore,
    registry: InMemoryConnectorRegistry,
    executor_config: WorkExecutorConfig,
    max_output_bytes: usize,
    consider_older_than: Duration,
}

impl Default for TestEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEngineBuilder {
    /// Builder with the default connectors and a fast poll interval
    pub fn new() -> Self {
        let registry = InMemoryConnectorRegistry::new();
        registry.register_any_version(Arc::new(NoOpConnector));
        registry.register_any_version(Arc::new(AlwaysFailingConnector::new()));
        Self {
            store: InMemoryStateStore::new(),
            registry,
            executor_config: WorkExecutorConfig {
                poll_interval: Duration::from_millis(20),
                shutdown_grace: Duration::from_secs(5),
                ..WorkExecutorConfig::default()
            },
            max_output_bytes: 1024 * 1024,
            consider_older_than: Duration::from_secs(60),
        }
    }

    /// Register a connector for every version
    pub fn with_connector(self, connector: Arc<dyn ConnectorExecutor>) -> Self {
        self.registry.register_any_version(connector);
        self
    }

    /// Share an existing store, e.g. to simulate a restart
    pub fn with_store(mut self, store: InMemoryStateStore) -> Self {
        self.store = store;
        self
    }

    /// Number of concurrent workers
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.executor_config.worker_count = worker_count;
        self
    }

    /// Claims of one item before a lost race counts as a failure
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.executor_config.max_attempts = max_attempts;
        self
    }

    /// How often running work refreshes its claim
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.executor_config.heartbeat_interval = interval;
        self
    }

    /// Largest accepted connector output
    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    /// Recovery staleness threshold
    pub fn with_consider_older_than(mut self, threshold: Duration) -> Self {
        self.consider_older_than = threshold;
        self
    }

    /// Wire every service without starting the worker pool
    pub fn build(self) -> TestEngine {
        init_test_logging();

        let store = self.store;
        let shared: Arc<dyn StateStore> = Arc::new(store.clone());
        let events = Arc::new(RecordingEventHandler::default());
        let invoker = Arc::new(ConnectorInvoker::new(
            Arc::new(self.registry),
            Arc::new(LiteralExpressionContext),
            self.max_output_bytes,
        ));

        let flow_node_executor = Arc::new(FlowNodeExecutor::new(
            shared.clone(),
            invoker,
            events.clone(),
        ));
        let executor = WorkExecutorService::new(
            shared.clone(),
            flow_node_executor.clone(),
            self.executor_config,
        );
        let recovery = Arc::new(RecoveryService::new(
            shared.clone(),
            executor.clone(),
            self.consider_older_than,
        ));
        let replay = ReplayCoordinator::new(shared.clone(), events.clone());
        let admin = ProcessAdmin::new(
            shared,
            flow_node_executor.clone(),
            replay,
            recovery.clone(),
            executor.clone(),
        );

        TestEngine {
            store,
            admin,
            executor,
            recovery,
            flow_node_executor,
            events,
        }
    }

    /// Wire every service and start the worker pool
    pub async fn start(self) -> Result<TestEngine, CoreError> {
        let engine = self.build();
        engine.executor.start().await?;
        Ok(engine)
    }
}

/// A fully wired engine over the in-memory store
pub struct TestEngine {
    /// The store, for direct inspection
    pub store: InMemoryStateStore,
    /// Administrative API
    pub admin: ProcessAdmin,
    /// Worker pool
    pub executor: WorkExecutorService,
    /// Recovery service
    pub recovery: Arc<RecoveryService>,
    /// Flow node executor
    pub flow_node_executor: Arc<FlowNodeExecutor>,
    /// Every published event
    pub events: Arc<RecordingEventHandler>,
}

impl TestEngine {
    /// Builder with the default connectors
    pub fn builder() -> TestEngineBuilder {
        TestEngineBuilder::new()
    }

    /// Deploy a definition and start one instance of it
    pub async fn run(&self, definition: ProcessDefinition) -> Result<ProcessInstanceId, CoreError> {
        let id = definition.id.clone();
        self.admin.deploy_definition(definition).await?;
        self.admin.start_process(&id, Map::new()).await
    }

    /// Flow node of a process by definition name
    pub async fn flow_node(
        &self,
        process_id: &ProcessInstanceId,
        name: &str,
    ) -> Result<Option<FlowNodeInstance>, CoreError> {
        Ok(self
            .store
            .find_flow_nodes_of_process(process_id)
            .await?
            .into_iter()
            .find(|node| node.name == name))
    }

    /// Connectors of a flow node in default order
    pub async fn connectors_of(&self, node: &FlowNodeInstance) -> Result<Vec<ConnectorInstance>, CoreError> {
        self.store.find_connectors_of_container(&node.container()).await
    }

    /// Wait until the process reaches `state`
    pub async fn wait_for_process_state(
        &self,
        id: &ProcessInstanceId,
        state: ContainerState,
    ) -> Result<ProcessInstance, TestError> {
        let deadline = Deadline::after(
            DEFAULT_TIMEOUT,
            format!("process {} to reach {}", id, state.state_name()),
        );
        loop {
            if let Some(process) = self.store.find_process_instance(id).await? {
                if process.state == state {
                    return Ok(process);
                }
            }
            deadline.tick().await?;
        }
    }

    /// Wait until the named flow node of a process reaches `state`
    pub async fn wait_for_flow_node_state(
        &self,
        process_id: &ProcessInstanceId,
        name: &str,
        state: ContainerState,
    ) -> Result<FlowNodeInstance, TestError> {
        let deadline = Deadline::after(
            DEFAULT_TIMEOUT,
            format!("flow node {} to reach {}", name, state.state_name()),
        );
        loop {
            if let Some(node) = self.flow_node(process_id, name).await? {
                if node.state == state {
                    return Ok(node);
                }
            }
            deadline.tick().await?;
        }
    }

    /// Wait until the queue is empty and no work is in flight
    pub async fn wait_until_idle(&self) -> Result<(), TestError> {
        let deadline = Deadline::after(DEFAULT_TIMEOUT, "the engine to become idle");
        loop {
            if self.store.work_items().await.is_empty() && self.executor.active_count() == 0 {
                return Ok(());
            }
            deadline.tick().await?;
        }
    }

    /// Wait until `condition` returns true
    pub async fn wait_for<F>(&self, what: &str, mut condition: F) -> Result<(), TestError>
    where
        F: FnMut() -> bool,
    {
        let deadline = Deadline::after(DEFAULT_TIMEOUT, what);
        while !condition() {
            deadline.tick().await?;
        }
        Ok(())
    }

    /// Stop the worker pool
    pub async fn shutdown(&self) {
        self.executor.shutdown().await
    }
}
