use async_trait::async_trait;
use conduit_core::{
    BoxError, ConnectorExecutor, ConnectorRuntimeApi, InMemoryConnectorRegistry, LogLevel,
};
use std::sync::Arc;

/// Connector that does nothing
#[derive(Debug, Default, Clone)]
pub struct NoOpConnector;

#[async_trait]
impl ConnectorExecutor for NoOpConnector {
    fn connector_id(&self) -> &str {
        "noop"
    }

    async fn execute(&self, _api: Arc<dyn ConnectorRuntimeApi>) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Writes its `message` input to the log.
///
/// The optional `level` input is one of `trace`, `debug`, `info`, `warn`,
/// `error`; it defaults to `info`.
#[derive(Debug, Default, Clone)]
pub struct LogConnector;

#[async_trait]
impl ConnectorExecutor for LogConnector {
    fn connector_id(&self) -> &str {
        "log"
    }

    async fn execute(&self, api: Arc<dyn ConnectorRuntimeApi>) -> Result<(), BoxError> {
        let message = api.get_input("message")?;
        let level = match api.get_input("level") {
            Ok(level) => parse_level(level.as_str().unwrap_or_default())?,
            Err(_) => LogLevel::Info,
        };
        let text = match message.as_str() {
            Some(s) => s.to_string(),
            None => message.as_value().to_string(),
        };
        api.log(level, &text);
        Ok(())
    }
}

fn parse_level(level: &str) -> Result<LogLevel, BoxError> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" | "warning" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        other => Err(format!("unknown log level: {}", other).into()),
    }
}

/// Register every built-in connector for all versions
pub fn register_builtins(registry: &InMemoryConnectorRegistry) {
    registry.register_any_version(Arc::new(NoOpConnector));
    registry.register_any_version(Arc::new(LogConnector));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("WARN").unwrap(), LogLevel::Warn);
        assert_eq!(parse_level("debug").unwrap(), LogLevel::Debug);
        assert!(parse_level("loud").is_err());
    }

    #[test]
    fn test_register_builtins() {
        let registry = InMemoryConnectorRegistry::new();
        register_builtins(&registry);
        assert_eq!(registry.len(), 2);
    }
}
