use crate::domain::connector_instance::ActivationEvent;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Value object: Process Definition ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessDefinitionId(pub String);

impl fmt::Display for ProcessDefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProcessDefinitionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A deployed, validated process definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// ID of the process
    pub id: ProcessDefinitionId,

    /// Human-readable name
    pub name: String,

    /// Definition version
    #[serde(default = "default_version")]
    pub version: String,

    /// Description of the process
    #[serde(default)]
    pub description: Option<String>,

    /// The flow nodes of this process
    pub flow_nodes: Vec<FlowNodeDefinition>,

    /// Connectors attached to the process itself
    #[serde(default)]
    pub connectors: Vec<ConnectorDefinition>,
}

/// One activity of a process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNodeDefinition {
    /// Name, unique within the process
    pub name: String,

    /// Flow nodes that must complete before this one is created
    #[serde(default)]
    pub run_after: Vec<String>,

    /// Attached connectors, in execution order per activation event
    #[serde(default)]
    pub connectors: Vec<ConnectorDefinition>,
}

/// A connector attached to a flow node or process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorDefinition {
    /// Name, unique within its container
    pub name: String,

    /// Implementation id resolved through the connector registry
    pub connector_id: String,

    /// Implementation version
    #[serde(default = "default_version")]
    pub version: String,

    /// When the connector fires
    pub activation_event: ActivationEvent,

    /// Input expressions, evaluated by the expression context
    #[serde(default)]
    pub inputs: HashMap<String, serde_json::Value>,

    /// Output operations applied when the connector succeeds
    #[serde(default)]
    pub outputs: Vec<OutputOperation>,
}

/// Copies one connector output into a process variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputOperation {
    /// Output name set by the connector
    pub output: String,

    /// Target process variable
    pub variable: String,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl ProcessDefinition {
    /// Parse and validate a YAML definition
    pub fn from_yaml(source: &str) -> Result<Self, CoreError> {
        let definition: ProcessDefinition = serde_yaml::from_str(source)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Parse and validate a JSON definition
    pub fn from_json(source: &str) -> Result<Self, CoreError> {
        let definition: ProcessDefinition = serde_json::from_str(source)
            .map_err(|e| CoreError::ValidationError(format!("Invalid JSON: {}", e)))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Validate the process definition
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.flow_nodes.is_empty() {
            return Err(CoreError::ValidationError(format!(
                "Process {} must have at least one flow node",
                self.id
            )));
        }

        let mut names = HashSet::new();
        for node in &self.flow_nodes {
            if !names.insert(node.name.as_str()) {
                return Err(CoreError::ValidationError(format!(
                    "Duplicate flow node name: {}",
                    node.name
                )));
            }
        }

        for node in &self.flow_nodes {
            for dep in &node.run_after {
                if !names.contains(dep.as_str()) {
                    return Err(CoreError::ValidationError(format!(
                        "Flow node {} references non-existent dependency: {}",
                        node.name, dep
                    )));
                }
            }
            check_connector_names(&node.name, &node.connectors)?;
        }
        check_connector_names(&self.name, &self.connectors)?;

        self.check_for_cycles()
    }

    /// Look up a flow node definition by name
    pub fn flow_node(&self, name: &str) -> Option<&FlowNodeDefinition> {
        self.flow_nodes.iter().find(|node| node.name == name)
    }

    /// Process-level connectors for one activation event, in execution order
    pub fn connectors_for(&self, event: ActivationEvent) -> Vec<&ConnectorDefinition> {
        ordered_connectors(&self.connectors, event)
    }

    /// Flow nodes that may be created now: not yet created, and every
    /// `run_after` predecessor completed
    pub fn ready_flow_nodes<'a>(
        &'a self,
        created: &HashSet<&str>,
        completed: &HashSet<&str>,
    ) -> Vec<&'a FlowNodeDefinition> {
        self.flow_nodes
            .iter()
            .filter(|node| !created.contains(node.name.as_str()))
            .filter(|node| node.run_after.iter().all(|dep| completed.contains(dep.as_str())))
            .collect()
    }

    /// Check for cycles in the flow node dependencies
    fn check_for_cycles(&self) -> Result<(), CoreError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();

        let dep_map: HashMap<&str, &Vec<String>> = self
            .flow_nodes
            .iter()
            .map(|node| (node.name.as_str(), &node.run_after))
            .collect();

        for node in &self.flow_nodes {
            if is_cyclic(node.name.as_str(), &dep_map, &mut visited, &mut rec_stack) {
                return Err(CoreError::ValidationError(format!(
                    "Cycle detected in flow node dependencies involving: {}",
                    node.name
                )));
            }
        }

        Ok(())
    }
}

impl FlowNodeDefinition {
    /// Connectors for one activation event, in execution order
    pub fn connectors_for(&self, event: ActivationEvent) -> Vec<&ConnectorDefinition> {
        ordered_connectors(&self.connectors, event)
    }
}

fn ordered_connectors(
    connectors: &[ConnectorDefinition],
    event: ActivationEvent,
) -> Vec<&ConnectorDefinition> {
    connectors
        .iter()
        .filter(|c| c.activation_event == event)
        .collect()
}

fn check_connector_names(container: &str, connectors: &[ConnectorDefinition]) -> Result<(), CoreError> {
    let mut names = HashSet::new();
    for connector in connectors {
        if !names.insert(connector.name.as_str()) {
            return Err(CoreError::ValidationError(format!(
                "Duplicate connector name {} on {}",
                connector.name, container
            )));
        }
        if connector.connector_id.is_empty() {
            return Err(CoreError::ValidationError(format!(
                "Connector {} on {} has no connector id",
                connector.name, container
            )));
        }
    }
    Ok(())
}

fn is_cyclic<'a>(
    name: &'a str,
    dep_map: &HashMap<&'a str, &'a Vec<String>>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
) -> bool {
    if visited.insert(name) {
        rec_stack.insert(name);

        if let Some(deps) = dep_map.get(name) {
            for dep in deps.iter() {
                let dep = dep.as_str();
                if (!visited.contains(dep) && is_cyclic(dep, dep_map, visited, rec_stack))
                    || rec_stack.contains(dep)
                {
                    return true;
                }
            }
        }
    }

    rec_stack.remove(name);
    false
}
