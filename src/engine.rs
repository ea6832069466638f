use std::path::Path;
use std::sync::Arc;

use conduit_core::{
    config::StoreBackend, ConnectorExecutor, ConnectorInvoker, CoreError, EngineConfig,
    FlowNodeExecutor, InMemoryConnectorRegistry, LiteralExpressionContext, ProcessAdmin,
    ProcessDefinition, RecoveryService, ReplayCoordinator, StateStore, TracingEventHandler,
    WorkExecutorConfig, WorkExecutorService,
};
use conduit_state_inmemory::InMemoryStateStore;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connectors::register_builtins;

/// A configured engine: store, worker pool, recovery and admin API
pub struct Engine {
    config: EngineConfig,
    registry: Arc<InMemoryConnectorRegistry>,
    admin: ProcessAdmin,
    executor: WorkExecutorService,
    recovery: Arc<RecoveryService>,
    cancel: CancellationToken,
    recovery_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Create the configured store and wire the engine over it
    pub async fn build(config: EngineConfig) -> Result<Self, CoreError> {
        let store = create_store(&config).await?;
        Ok(Self::with_store(config, store))
    }

    /// Wire the engine over an existing store
    pub fn with_store(config: EngineConfig, store: Arc<dyn StateStore>) -> Self {
        let registry = Arc::new(InMemoryConnectorRegistry::new());
        register_builtins(&registry);

        let events = Arc::new(TracingEventHandler);
        let invoker = Arc::new(ConnectorInvoker::new(
            registry.clone(),
            Arc::new(LiteralExpressionContext),
            config.max_output_bytes,
        ));
        let flow_node_executor = Arc::new(FlowNodeExecutor::new(
            store.clone(),
            invoker,
            events.clone(),
        ));
        let executor = WorkExecutorService::new(
            store.clone(),
            flow_node_executor.clone(),
            WorkExecutorConfig::from(&config),
        );
        let recovery = Arc::new(RecoveryService::new(
            store.clone(),
            executor.clone(),
            config.recovery.consider_older_than(),
        ));
        let replay = ReplayCoordinator::new(store.clone(), events);
        let admin = ProcessAdmin::new(
            store,
            flow_node_executor,
            replay,
            recovery.clone(),
            executor.clone(),
        );

        Self {
            config,
            registry,
            admin,
            executor,
            recovery,
            cancel: CancellationToken::new(),
            recovery_task: Mutex::new(None),
        }
    }

    /// Register a connector implementation for every version
    pub fn register_connector(&self, connector: Arc<dyn ConnectorExecutor>) {
        self.registry.register_any_version(connector);
    }

    /// The administrative API
    pub fn admin(&self) -> &ProcessAdmin {
        &self.admin
    }

    /// Deploy every `.yaml` / `.yml` process definition in `dir`
    pub async fn deploy_definitions_dir(&self, dir: &Path) -> Result<usize, CoreError> {
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
            CoreError::ConfigurationError(format!(
                "Cannot read definitions directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext == "yaml" || ext == "yml")
                .unwrap_or(false);
            if is_yaml {
                paths.push(path);
            }
        }
        paths.sort();

        for path in &paths {
            let source = tokio::fs::read_to_string(path).await?;
            let definition = ProcessDefinition::from_yaml(&source).map_err(|e| {
                CoreError::ValidationError(format!("{}: {}", path.display(), e))
            })?;
            self.admin.deploy_definition(definition).await?;
        }

        info!(count = paths.len(), dir = %dir.display(), "Deployed process definitions");
        Ok(paths.len())
    }

    /// Deploy configured definitions, start the worker pool and, when
    /// enabled, periodic recovery with an immediate first pass
    pub async fn start(&self) -> Result<(), CoreError> {
        if let Some(dir) = &self.config.definitions_dir {
            self.deploy_definitions_dir(dir).await?;
        }

        self.executor.start().await?;

        if self.config.recovery.enabled {
            let handle = self
                .recovery
                .clone()
                .spawn_periodic(self.config.recovery.interval(), self.cancel.child_token());
            *self.recovery_task.lock().await = Some(handle);
        }

        info!(
            executor_id = %self.executor.executor_id(),
            worker_count = self.config.worker_count,
            "Engine started"
        );
        Ok(())
    }

    /// Pause, stop recovery and shut the worker pool down
    pub async fn shutdown(&self) {
        self.admin.pause().await;
        self.cancel.cancel();
        if let Some(handle) = self.recovery_task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Recovery task ended abnormally");
            }
        }
        self.executor.shutdown().await;
        info!("Engine stopped");
    }
}

async fn create_store(config: &EngineConfig) -> Result<Arc<dyn StateStore>, CoreError> {
    match config.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory state store");
            Ok(Arc::new(InMemoryStateStore::new()))
        }
        StoreBackend::Postgres => create_postgres_store(config).await,
    }
}

#[cfg(feature = "postgres")]
async fn create_postgres_store(config: &EngineConfig) -> Result<Arc<dyn StateStore>, CoreError> {
    use conduit_state_postgres::{PostgresConfig, PostgresStateStore};

    let pg_config = PostgresConfig::from_store_config(&config.store)?;
    let store = PostgresStateStore::connect(&pg_config).await?;
    info!("Using PostgreSQL state store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn create_postgres_store(_config: &EngineConfig) -> Result<Arc<dyn StateStore>, CoreError> {
    Err(CoreError::ConfigurationError(
        "this build has no PostgreSQL support; rebuild with --features postgres".to_string(),
    ))
}
