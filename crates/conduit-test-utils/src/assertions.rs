//! Assertion utilities for connector and container state.

use conduit_core::{ConnectorInstance, ConnectorState, FailureKind};

use crate::TestError;

/// Asserts that connectors, in the given order, have exactly the expected states.
///
/// # Returns
///
/// * `Ok(())` - If every state matches
/// * `Err(TestError::Assertion)` - Naming the first mismatch
pub fn assert_connector_states(
    connectors: &[ConnectorInstance],
    expected: &[ConnectorState],
) -> Result<(), TestError> {
    let actual: Vec<ConnectorState> = connectors.iter().map(|c| c.state).collect();
    if actual != expected {
        return Err(TestError::Assertion(format!(
            "connector states: expected {:?}, got {:?}",
            expected, actual
        )));
    }
    Ok(())
}

/// Asserts that a connector is failed and its diagnostics match.
///
/// `cause` must appear somewhere in the recorded causal chain when given.
pub fn assert_failed_with(
    connector: &ConnectorInstance,
    kind: FailureKind,
    cause: Option<&str>,
) -> Result<(), TestError> {
    if connector.state != ConnectorState::Failed {
        return Err(TestError::Assertion(format!(
            "connector {} is {:?}, not FAILED",
            connector.name, connector.state
        )));
    }
    let info = connector.failure_info.as_ref().ok_or_else(|| {
        TestError::Assertion(format!("connector {} has no failure info", connector.name))
    })?;
    if info.kind != kind {
        return Err(TestError::Assertion(format!(
            "connector {} failed with {}, expected {}",
            connector.name, info.kind, kind
        )));
    }
    if let Some(cause) = cause {
        if !info.causes.iter().any(|c| c.contains(cause)) {
            return Err(TestError::Assertion(format!(
                "connector {} causes {:?} do not mention {:?}",
                connector.name, info.causes, cause
            )));
        }
    }
    Ok(())
}

/// Asserts that no connector carries failure diagnostics unless it is failed.
pub fn assert_failure_info_consistent(connectors: &[ConnectorInstance]) -> Result<(), TestError> {
    for connector in connectors {
        let failed = connector.state == ConnectorState::Failed;
        if failed != connector.failure_info.is_some() {
            return Err(TestError::Assertion(format!(
                "connector {} is {:?} with failure info present = {}",
                connector.name,
                connector.state,
                connector.failure_info.is_some()
            )));
        }
    }
    Ok(())
}
