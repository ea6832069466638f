//! Resolving, running and post-processing a single connector.

use crate::domain::connector_instance::{ConnectorInstance, ConnectorInstanceId};
use crate::domain::failure::{FailureInfo, FailureKind};
use crate::domain::process_definition::ConnectorDefinition;
use crate::domain::process_instance::{ProcessInstance, ProcessInstanceId};
use crate::{ConnectorExecutor, ConnectorRuntimeApi, CoreError, DataPacket, LogLevel};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Version key matching any requested version
pub const ANY_VERSION: &str = "*";

/// Resolves connector implementations by definition id and version
#[cfg_attr(test, mockall::automock)]
pub trait ConnectorRegistry: Send + Sync {
    /// Find the implementation for `connector_id` at `version`
    fn resolve(
        &self,
        connector_id: &str,
        version: &str,
    ) -> Result<Arc<dyn ConnectorExecutor>, CoreError>;
}

/// Registry backed by a concurrent map
#[derive(Default)]
pub struct InMemoryConnectorRegistry {
    connectors: DashMap<(String, String), Arc<dyn ConnectorExecutor>>,
}

impl InMemoryConnectorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementation for one version
    pub fn register(&self, version: &str, executor: Arc<dyn ConnectorExecutor>) {
        let key = (executor.connector_id().to_string(), version.to_string());
        debug!(connector_id = %key.0, version = %key.1, "registering connector");
        self.connectors.insert(key, executor);
    }

    /// Register an implementation that serves every version
    pub fn register_any_version(&self, executor: Arc<dyn ConnectorExecutor>) {
        self.register(ANY_VERSION, executor);
    }

    /// Number of registrations
    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

impl ConnectorRegistry for InMemoryConnectorRegistry {
    fn resolve(
        &self,
        connector_id: &str,
        version: &str,
    ) -> Result<Arc<dyn ConnectorExecutor>, CoreError> {
        let exact = (connector_id.to_string(), version.to_string());
        if let Some(executor) = self.connectors.get(&exact) {
            return Ok(executor.value().clone());
        }
        let any = (connector_id.to_string(), ANY_VERSION.to_string());
        self.connectors
            .get(&any)
            .map(|executor| executor.value().clone())
            .ok_or_else(|| CoreError::ConnectorNotFound(format!("{}@{}", connector_id, version)))
    }
}

/// Computes connector inputs from their definitions
#[async_trait]
pub trait ExpressionContext: Send + Sync {
    /// Evaluate every input of `definition` in the context of `process`
    async fn evaluate_inputs(
        &self,
        definition: &ConnectorDefinition,
        process: &ProcessInstance,
    ) -> Result<HashMap<String, DataPacket>, CoreError>;
}

/// Inputs are literal JSON values, except strings of the form `"$name"`
/// which read the process variable `name`. `"$$"` escapes a leading `$`.
#[derive(Debug, Default, Clone)]
pub struct LiteralExpressionContext;

#[async_trait]
impl ExpressionContext for LiteralExpressionContext {
    async fn evaluate_inputs(
        &self,
        definition: &ConnectorDefinition,
        process: &ProcessInstance,
    ) -> Result<HashMap<String, DataPacket>, CoreError> {
        let mut inputs = HashMap::with_capacity(definition.inputs.len());
        for (name, expression) in &definition.inputs {
            let value = match expression.as_str() {
                Some(s) if s.starts_with("$$") => Value::String(s[1..].to_string()),
                Some(s) if s.starts_with('$') => {
                    let variable = &s[1..];
                    process.variable(variable).cloned().ok_or_else(|| {
                        CoreError::ExpressionError(format!(
                            "Input {} of connector {} references unknown variable {}",
                            name, definition.name, variable
                        ))
                    })?
                }
                _ => expression.clone(),
            };
            inputs.insert(name.clone(), DataPacket::new(value));
        }
        Ok(inputs)
    }
}

/// Result of one connector invocation
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    /// The connector returned normally and every output operation resolved
    Completed {
        /// Process variables to write, in output-operation order
        variables: Vec<(String, Value)>,
    },
    /// The connector failed; nothing is to be written
    Failed(FailureInfo),
}

/// Per-invocation runtime API
struct InvocationContext {
    connector_instance_id: ConnectorInstanceId,
    process_instance_id: ProcessInstanceId,
    connector_name: String,
    inputs: HashMap<String, DataPacket>,
    outputs: Mutex<HashMap<String, DataPacket>>,
}

impl InvocationContext {
    fn take_outputs(&self) -> HashMap<String, DataPacket> {
        match self.outputs.lock() {
            Ok(mut outputs) => std::mem::take(&mut *outputs),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl ConnectorRuntimeApi for InvocationContext {
    fn connector_instance_id(&self) -> &ConnectorInstanceId {
        &self.connector_instance_id
    }

    fn process_instance_id(&self) -> &ProcessInstanceId {
        &self.process_instance_id
    }

    fn get_input(&self, name: &str) -> Result<DataPacket, CoreError> {
        self.inputs.get(name).cloned().ok_or_else(|| {
            CoreError::ExecutionFailure(format!(
                "Connector {} has no input named {}",
                self.connector_name, name
            ))
        })
    }

    fn inputs(&self) -> HashMap<String, DataPacket> {
        self.inputs.clone()
    }

    fn set_output(&self, name: &str, value: DataPacket) -> Result<(), CoreError> {
        let mut outputs = self
            .outputs
            .lock()
            .map_err(|_| CoreError::ExecutionFailure("output map poisoned".to_string()))?;
        outputs.insert(name.to_string(), value);
        Ok(())
    }

    fn log(&self, level: LogLevel, message: &str) {
        let id = &self.connector_instance_id.0;
        let name = self.connector_name.as_str();
        match tracing::Level::from(level) {
            tracing::Level::ERROR => tracing::error!(connector_instance_id = %id, connector = name, "{}", message),
            tracing::Level::WARN => tracing::warn!(connector_instance_id = %id, connector = name, "{}", message),
            tracing::Level::INFO => tracing::info!(connector_instance_id = %id, connector = name, "{}", message),
            tracing::Level::DEBUG => tracing::debug!(connector_instance_id = %id, connector = name, "{}", message),
            _ => tracing::trace!(connector_instance_id = %id, connector = name, "{}", message),
        }
    }
}

/// Runs connectors and turns every way they can go wrong into a
/// [`FailureInfo`]. Never panics and never returns an error to the caller.
pub struct ConnectorInvoker {
    registry: Arc<dyn ConnectorRegistry>,
    expressions: Arc<dyn ExpressionContext>,
    max_output_bytes: usize,
}

impl ConnectorInvoker {
    /// Create a new invoker
    pub fn new(
        registry: Arc<dyn ConnectorRegistry>,
        expressions: Arc<dyn ExpressionContext>,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            registry,
            expressions,
            max_output_bytes,
        }
    }

    /// Run one connector instance
    pub async fn invoke(
        &self,
        connector: &ConnectorInstance,
        definition: &ConnectorDefinition,
        process: &ProcessInstance,
    ) -> InvocationOutcome {
        let inputs = match self.expressions.evaluate_inputs(definition, process).await {
            Ok(inputs) => inputs,
            Err(e) => return InvocationOutcome::Failed(FailureInfo::from_core_error(&e)),
        };

        let executor = match self.registry.resolve(&connector.connector_id, &connector.version) {
            Ok(executor) => executor,
            Err(e) => return InvocationOutcome::Failed(FailureInfo::from_core_error(&e)),
        };

        let context = Arc::new(InvocationContext {
            connector_instance_id: connector.id.clone(),
            process_instance_id: connector.process_instance_id.clone(),
            connector_name: connector.name.clone(),
            inputs,
            outputs: Mutex::new(HashMap::new()),
        });
        let api: Arc<dyn ConnectorRuntimeApi> = context.clone();

        debug!(
            connector_instance_id = %connector.id,
            connector_id = %connector.connector_id,
            version = %connector.version,
            "invoking connector"
        );

        match AssertUnwindSafe(executor.execute(api)).catch_unwind().await {
            Ok(Ok(())) => match self.apply_output_operations(definition, context.take_outputs()) {
                Ok(variables) => InvocationOutcome::Completed { variables },
                Err(failure) => InvocationOutcome::Failed(failure),
            },
            Ok(Err(e)) => {
                InvocationOutcome::Failed(FailureInfo::from_error(FailureKind::Execution, e.as_ref()))
            }
            Err(panic) => {
                warn!(connector_instance_id = %connector.id, "connector panicked");
                InvocationOutcome::Failed(FailureInfo::from_panic(panic))
            }
        }
    }

    /// Resolve every output operation before anything is written; a single
    /// bad output fails the whole set.
    fn apply_output_operations(
        &self,
        definition: &ConnectorDefinition,
        mut outputs: HashMap<String, DataPacket>,
    ) -> Result<Vec<(String, Value)>, FailureInfo> {
        let mut variables = Vec::with_capacity(definition.outputs.len());
        for operation in &definition.outputs {
            let value = outputs.remove(&operation.output).ok_or_else(|| {
                FailureInfo::new(
                    FailureKind::Serialization,
                    format!(
                        "Connector {} did not produce output {}",
                        definition.name, operation.output
                    ),
                )
            })?;
            let encoded = serde_json::to_vec(&value).map_err(|e| {
                FailureInfo::new(
                    FailureKind::Serialization,
                    format!("Output {} is not serializable", operation.output),
                )
                .with_cause(e.to_string())
            })?;
            if encoded.len() > self.max_output_bytes {
                return Err(FailureInfo::new(
                    FailureKind::Serialization,
                    format!(
                        "Output {} is {} bytes, above the {} byte limit",
                        operation.output,
                        encoded.len(),
                        self.max_output_bytes
                    ),
                ));
            }
            variables.push((operation.variable.clone(), value.into_value()));
        }
        Ok(variables)
    }
}
