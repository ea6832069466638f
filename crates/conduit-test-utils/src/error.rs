//! Error type shared by the test helpers.

use conduit_core::CoreError;
use thiserror::Error;

/// Errors raised by test helpers
#[derive(Debug, Error)]
pub enum TestError {
    /// A polled condition did not hold in time
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// An assertion helper found an unexpected value
    #[error("Assertion failed: {0}")]
    Assertion(String),

    /// The engine returned an error
    #[error("Engine error: {0}")]
    Core(#[from] CoreError),
}
