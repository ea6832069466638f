//! Connector implementations with scripted behaviour.

use async_trait::async_trait;
use conduit_core::{BoxError, ConnectorExecutor, ConnectorRuntimeApi, DataPacket, LogLevel};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Connector id of [`NoOpConnector`]
pub const NOOP: &str = "noop";

/// Connector id of [`AlwaysFailingConnector`]
pub const ALWAYS_FAILS: &str = "always-fails";

/// Does nothing and succeeds
#[derive(Debug, Default, Clone)]
pub struct NoOpConnector;

#[async_trait]
impl ConnectorExecutor for NoOpConnector {
    fn connector_id(&self) -> &str {
        NOOP
    }

    async fn execute(&self, api: Arc<dyn ConnectorRuntimeApi>) -> Result<(), BoxError> {
        api.log(LogLevel::Debug, "noop");
        Ok(())
    }
}

/// Innermost cause raised by [`AlwaysFailingConnector`]
#[derive(Debug, Error)]
#[error("remote endpoint refused the request")]
pub struct RemoteRefused;

/// Middle of the cause chain
#[derive(Debug, Error)]
#[error("call to remote system failed")]
pub struct RemoteCallFailed(#[source] pub RemoteRefused);

/// Top-level error of [`AlwaysFailingConnector`]
#[derive(Debug, Error)]
#[error("connector always fails")]
pub struct AlwaysFails(#[source] pub RemoteCallFailed);

/// Fails every time with a three-level error chain
#[derive(Debug, Default, Clone)]
pub struct AlwaysFailingConnector {
    calls: Arc<AtomicUsize>,
}

impl AlwaysFailingConnector {
    /// Create a new failing connector
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of invocations so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectorExecutor for AlwaysFailingConnector {
    fn connector_id(&self) -> &str {
        ALWAYS_FAILS
    }

    async fn execute(&self, _api: Arc<dyn ConnectorRuntimeApi>) -> Result<(), BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AlwaysFails(RemoteCallFailed(RemoteRefused)).into())
    }
}

/// Succeeds and counts its invocations
#[derive(Debug, Clone)]
pub struct CountingConnector {
    id: String,
    calls: Arc<AtomicUsize>,
}

impl CountingConnector {
    /// Create a counting connector registered under `id`
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of invocations so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectorExecutor for CountingConnector {
    fn connector_id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, _api: Arc<dyn ConnectorRuntimeApi>) -> Result<(), BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Panics inside the connector body
#[derive(Debug, Clone)]
pub struct PanickingConnector {
    id: String,
}

impl PanickingConnector {
    /// Create a panicking connector registered under `id`
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl ConnectorExecutor for PanickingConnector {
    fn connector_id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, _api: Arc<dyn ConnectorRuntimeApi>) -> Result<(), BoxError> {
        panic!("connector {} blew up", self.id);
    }
}

/// Sets fixed outputs, plus `echo` holding the `value` input when present
#[derive(Debug, Clone)]
pub struct OutputConnector {
    id: String,
    outputs: HashMap<String, Value>,
}

impl OutputConnector {
    /// Create an output connector registered under `id`
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outputs: HashMap::new(),
        }
    }

    /// Add an output the connector will set
    pub fn with_output(mut self, name: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(name.into(), value);
        self
    }
}

#[async_trait]
impl ConnectorExecutor for OutputConnector {
    fn connector_id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, api: Arc<dyn ConnectorRuntimeApi>) -> Result<(), BoxError> {
        for (name, value) in &self.outputs {
            api.set_output(name, DataPacket::new(value.clone()))?;
        }
        if let Ok(value) = api.get_input("value") {
            api.set_output("echo", value)?;
        }
        Ok(())
    }
}

/// Blocks every invocation until the gate is opened
#[derive(Debug, Clone)]
pub struct GatedConnector {
    id: String,
    gate: Arc<watch::Sender<bool>>,
    entered: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl GatedConnector {
    /// Create a closed gated connector registered under `id`
    pub fn new(id: impl Into<String>) -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            id: id.into(),
            gate: Arc::new(gate),
            entered: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Release every waiting and future invocation
    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    /// Block future invocations again
    pub fn close(&self) {
        self.gate.send_replace(false);
    }

    /// Invocations that reached the gate
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Invocations that passed the gate
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectorExecutor for GatedConnector {
    fn connector_id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, _api: Arc<dyn ConnectorRuntimeApi>) -> Result<(), BoxError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open).await?;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Error raised by [`FlakyConnector`] while it still has failures left
#[derive(Debug, Error)]
#[error("transient failure, {remaining} left")]
pub struct TransientFailure {
    /// Failures still to come
    pub remaining: usize,
}

/// Fails a fixed number of times, then succeeds
#[derive(Debug, Clone)]
pub struct FlakyConnector {
    id: String,
    failures_left: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl FlakyConnector {
    /// Create a connector that fails `failures` times before succeeding
    pub fn new(id: impl Into<String>, failures: usize) -> Self {
        Self {
            id: id.into(),
            failures_left: Arc::new(AtomicUsize::new(failures)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of invocations so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectorExecutor for FlakyConnector {
    fn connector_id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, _api: Arc<dyn ConnectorRuntimeApi>) -> Result<(), BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let previous = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match previous {
            Ok(before) => Err(TransientFailure {
                remaining: before - 1,
            }
            .into()),
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_always_fails_chain() {
        let err = AlwaysFails(RemoteCallFailed(RemoteRefused));
        let cause = err.source().unwrap();
        assert_eq!(cause.to_string(), "call to remote system failed");
        assert_eq!(
            cause.source().unwrap().to_string(),
            "remote endpoint refused the request"
        );
    }

    #[test]
    fn test_gate_state() {
        let gated = GatedConnector::new("gated");
        assert!(!*gated.gate.borrow());
        gated.open();
        assert!(*gated.gate.borrow());
        gated.close();
        assert!(!*gated.gate.borrow());
    }
}
