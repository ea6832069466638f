/// Connector resolution and invocation
pub mod connector_invoker;

/// Container lifecycle and connector sequencing
pub mod flow_node_executor;

/// Administrative API
pub mod process_admin;

/// Crash recovery
pub mod recovery_service;

/// Connector resets and flow node replay
pub mod replay_coordinator;

/// Worker pool over the persisted queue
pub mod work_executor;
