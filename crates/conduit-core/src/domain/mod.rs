/// Connector instance aggregate and its state machine
pub mod connector_instance;

/// Lifecycle shared by flow nodes and process instances
pub mod container;

/// Domain events
pub mod events;

/// Structured failure diagnostics
pub mod failure;

/// Flow node instance aggregate
pub mod flow_node_instance;

/// Process definition domain models
pub mod process_definition;

/// Process instance aggregate
pub mod process_instance;

/// Repository interfaces
pub mod repository;

/// Persisted work queue items
pub mod work_item;
