//! Testing utilities for the Conduit engine.
//!
//! This crate provides test connectors, a `mockall` connector mock, process
//! definition generators, a fully wired engine over the in-memory store,
//! polling helpers and assertion utilities.

pub mod assertions;
pub mod builders;
pub mod connectors;
pub mod data_generators;
pub mod error;
pub mod mocks;
pub mod util;

/// Re-export commonly used types for convenience
pub use mockall;

pub use builders::{RecordingEventHandler, TestEngine, TestEngineBuilder};
pub use error::TestError;
pub use util::{init_test_logging, Deadline, DEFAULT_TIMEOUT};
