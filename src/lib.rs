//!
//! Conduit - flow-node connector execution engine
//!
//! This crate wires the core services to a state store chosen by
//! configuration and provides the built-in connectors and logging setup
//! used by the `conduit` binary.

/// Built-in connectors
pub mod connectors;

/// Engine bootstrap
pub mod engine;

/// Logging setup
pub mod telemetry;

// Re-export key types
pub use engine::Engine;
