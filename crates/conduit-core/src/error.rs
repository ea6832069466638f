use thiserror::Error;

/// Core error type for the Conduit engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Connector instance not found
    #[error("Connector instance not found: {0}")]
    ConnectorInstanceNotFound(String),

    /// Flow node instance not found
    #[error("Flow node instance not found: {0}")]
    FlowNodeInstanceNotFound(String),

    /// Process instance not found
    #[error("Process instance not found: {0}")]
    ProcessInstanceNotFound(String),

    /// Process definition not found
    #[error("Process definition not found: {0}")]
    ProcessDefinitionNotFound(String),

    /// No connector implementation registered for a definition id and version
    #[error("Connector not found: {0}")]
    ConnectorNotFound(String),

    /// Requested state change is not a legal transition
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// Connector body failed
    #[error("Connector execution failure: {0}")]
    ExecutionFailure(String),

    /// Connector outputs could not be serialized or applied
    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    /// A transaction precondition no longer holds
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Expression evaluation error
    #[error("Expression evaluation error: {0}")]
    ExpressionError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Input/output error
    #[error("Input/output error: {0}")]
    IOError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// True for the "entity does not exist" family
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CoreError::ConnectorInstanceNotFound(_)
                | CoreError::FlowNodeInstanceNotFound(_)
                | CoreError::ProcessInstanceNotFound(_)
                | CoreError::ProcessDefinitionNotFound(_)
                | CoreError::ConnectorNotFound(_)
        )
    }

    /// True when an administrative update was rejected without mutating anything
    pub fn is_update_rejection(&self) -> bool {
        self.is_not_found() || matches!(self, CoreError::InvalidStateTransition(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationFailure(err.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::ValidationError(format!("Invalid YAML: {}", err))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::IOError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_error_display() {
        let errors = vec![
            (CoreError::ConnectorInstanceNotFound("-1".to_string()), "Connector instance not found: -1"),
            (CoreError::FlowNodeInstanceNotFound("fn1".to_string()), "Flow node instance not found: fn1"),
            (CoreError::ProcessInstanceNotFound("p1".to_string()), "Process instance not found: p1"),
            (CoreError::ProcessDefinitionNotFound("d1".to_string()), "Process definition not found: d1"),
            (CoreError::ConnectorNotFound("http@1.0".to_string()), "Connector not found: http@1.0"),
            (CoreError::InvalidStateTransition("DONE -> SKIPPED".to_string()), "Invalid state transition: DONE -> SKIPPED"),
            (CoreError::ExecutionFailure("boom".to_string()), "Connector execution failure: boom"),
            (CoreError::SerializationFailure("ser".to_string()), "Serialization failure: ser"),
            (CoreError::ConcurrentModification("guard".to_string()), "Concurrent modification: guard"),
            (CoreError::ValidationError("invalid".to_string()), "Validation error: invalid"),
            (CoreError::StateStoreError("db_err".to_string()), "State store error: db_err"),
            (CoreError::ExpressionError("expr".to_string()), "Expression evaluation error: expr"),
            (CoreError::ConfigurationError("cfg".to_string()), "Configuration error: cfg"),
            (CoreError::IOError("io_err".to_string()), "Input/output error: io_err"),
            (CoreError::Other("other_err".to_string()), "other_err"),
        ];

        for (error, expected_msg) in errors {
            assert_eq!(error.to_string(), expected_msg);
        }
    }

    #[test]
    fn test_not_found_family() {
        assert!(CoreError::ConnectorInstanceNotFound("x".into()).is_not_found());
        assert!(CoreError::FlowNodeInstanceNotFound("x".into()).is_update_rejection());
        assert!(CoreError::InvalidStateTransition("x".into()).is_update_rejection());
        assert!(!CoreError::InvalidStateTransition("x".into()).is_not_found());
        assert!(!CoreError::StateStoreError("x".into()).is_update_rejection());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: CoreError = json_error.into();

        match error {
            CoreError::SerializationFailure(msg) => {
                assert!(msg.contains("expected value"));
            }
            _ => panic!("Expected SerializationFailure variant"),
        }
    }

    #[test]
    fn test_from_io_error() {
        let io_error = IoError::new(ErrorKind::NotFound, "file not found");
        let error: CoreError = io_error.into();

        match error {
            CoreError::IOError(msg) => {
                assert!(msg.contains("file not found"));
            }
            _ => panic!("Expected IOError variant"),
        }
    }

    #[test]
    fn test_from_str() {
        let error: CoreError = "test error message".into();
        assert_eq!(error, CoreError::Other("test error message".to_string()));
    }
}
