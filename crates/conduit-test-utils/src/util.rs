//! Polling and logging helpers.

use std::sync::Once;
use std::time::Duration;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use crate::TestError;

/// Default time a wait helper gives the engine
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

static INIT_LOGGING: Once = Once::new();

/// Install a test-friendly tracing subscriber once per process.
///
/// Honours `RUST_LOG`; output goes through the test harness capture.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn,conduit_core=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A point in time after which a polled condition counts as failed
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    what: String,
}

impl Deadline {
    /// Deadline `timeout` from now, described by `what` in the timeout error
    pub fn after(timeout: Duration, what: impl Into<String>) -> Self {
        Self {
            at: Instant::now() + timeout,
            what: what.into(),
        }
    }

    /// Whether the deadline has passed
    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Sleep one polling interval, or fail if the deadline has passed
    pub async fn tick(&self) -> Result<(), TestError> {
        if self.expired() {
            return Err(TestError::Timeout(self.what.clone()));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
        Ok(())
    }
}
