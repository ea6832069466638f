//! Mock implementation of the ConnectorExecutor trait.

use async_trait::async_trait;
use conduit_core::{BoxError, ConnectorExecutor, ConnectorRuntimeApi};
use mockall::mock;
use std::sync::Arc;

// Generate the mock implementation for ConnectorExecutor
mock! {
    pub Connector {}

    #[async_trait]
    impl ConnectorExecutor for Connector {
        fn connector_id(&self) -> &str;
        async fn execute(&self, api: Arc<dyn ConnectorRuntimeApi>) -> Result<(), BoxError>;
    }
}

/// Creates a mock connector registered under `id`; `execute` expectations are left to the caller.
pub fn create_mock_connector(id: &str) -> MockConnector {
    let mut mock = MockConnector::new();
    mock.expect_connector_id().return_const(id.to_string());
    mock
}

/// Creates a mock connector that expects exactly `times` successful calls.
pub fn create_expecting_connector(id: &str, times: usize) -> MockConnector {
    let mut mock = create_mock_connector(id);
    mock.expect_execute().times(times).returning(|_| Ok(()));
    mock
}
