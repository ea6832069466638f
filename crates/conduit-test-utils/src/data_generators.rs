//! Generators for process definitions used across tests.

use conduit_core::{
    ActivationEvent, ConnectorDefinition, FlowNodeDefinition, OutputOperation, ProcessDefinition,
    ProcessDefinitionId,
};
use serde_json::Value;
use std::collections::HashMap;

use crate::connectors::{ALWAYS_FAILS, NOOP};

/// Id of [`noop_fail_noop_definition`]
pub const NOOP_FAIL_NOOP: &str = "noop-fail-noop";

/// Name of the flow node in single-node definitions
pub const ACTIVITY: &str = "activity";

/// An ON_ENTER connector definition
pub fn connector(name: &str, connector_id: &str) -> ConnectorDefinition {
    connector_on(name, connector_id, ActivationEvent::OnEnter)
}

/// A connector definition for the given activation event
pub fn connector_on(name: &str, connector_id: &str, event: ActivationEvent) -> ConnectorDefinition {
    ConnectorDefinition {
        name: name.to_string(),
        connector_id: connector_id.to_string(),
        version: "1.0.0".to_string(),
        activation_event: event,
        inputs: HashMap::new(),
        outputs: Vec::new(),
    }
}

/// Add an output operation copying `output` into process variable `variable`
pub fn with_output(mut definition: ConnectorDefinition, output: &str, variable: &str) -> ConnectorDefinition {
    definition.outputs.push(OutputOperation {
        output: output.to_string(),
        variable: variable.to_string(),
    });
    definition
}

/// Add an input expression
pub fn with_input(mut definition: ConnectorDefinition, name: &str, expression: Value) -> ConnectorDefinition {
    definition.inputs.insert(name.to_string(), expression);
    definition
}

/// A flow node definition
pub fn flow_node(name: &str, run_after: &[&str], connectors: Vec<ConnectorDefinition>) -> FlowNodeDefinition {
    FlowNodeDefinition {
        name: name.to_string(),
        run_after: run_after.iter().map(|s| s.to_string()).collect(),
        connectors,
    }
}

/// A process definition without process-level connectors
pub fn process(id: &str, flow_nodes: Vec<FlowNodeDefinition>) -> ProcessDefinition {
    ProcessDefinition {
        id: ProcessDefinitionId(id.to_string()),
        name: id.to_string(),
        version: "1.0.0".to_string(),
        description: None,
        flow_nodes,
        connectors: Vec::new(),
    }
}

/// One flow node named [`ACTIVITY`] with the given ON_ENTER connectors
/// (connector ids), named `c0`, `c1`, ...
pub fn single_activity_definition(id: &str, connector_ids: &[&str]) -> ProcessDefinition {
    let connectors = connector_ids
        .iter()
        .enumerate()
        .map(|(i, connector_id)| connector(&format!("c{}", i), connector_id))
        .collect();
    process(id, vec![flow_node(ACTIVITY, &[], connectors)])
}

/// One activity running `noop`, `always-fails`, `noop` on enter
pub fn noop_fail_noop_definition() -> ProcessDefinition {
    single_activity_definition(NOOP_FAIL_NOOP, &[NOOP, ALWAYS_FAILS, NOOP])
}

/// `steps` flow nodes in a chain, each running `connector_id` once
pub fn sequential_definition(id: &str, steps: usize, connector_id: &str) -> ProcessDefinition {
    let nodes = (0..steps)
        .map(|i| {
            let name = format!("step-{}", i);
            let previous = if i == 0 { None } else { Some(format!("step-{}", i - 1)) };
            let run_after: Vec<&str> = previous.iter().map(|s| s.as_str()).collect();
            flow_node(&name, &run_after, vec![connector("run", connector_id)])
        })
        .collect();
    process(id, nodes)
}

/// `start`, then `left` and `right` in parallel, then `join`.
///
/// Branches run `branch_connector`; every other node runs `noop`.
pub fn parallel_join_definition(id: &str, branch_connector: &str) -> ProcessDefinition {
    process(
        id,
        vec![
            flow_node("start", &[], vec![connector("run", NOOP)]),
            flow_node("left", &["start"], vec![connector("run", branch_connector)]),
            flow_node("right", &["start"], vec![connector("run", branch_connector)]),
            flow_node("join", &["left", "right"], vec![connector("run", NOOP)]),
        ],
    )
}

/// One activity running `enter_connector` on enter, then `always-fails`
/// and `noop` on finish
pub fn finish_fails_definition(id: &str, enter_connector: &str) -> ProcessDefinition {
    process(
        id,
        vec![flow_node(
            ACTIVITY,
            &[],
            vec![
                connector("enter", enter_connector),
                connector_on("finish", ALWAYS_FAILS, ActivationEvent::OnFinish),
                connector_on("finish-more", NOOP, ActivationEvent::OnFinish),
            ],
        )],
    )
}

/// One `noop` activity and a process-level ON_FINISH connector that always
/// fails
pub fn failing_process_connector_definition(id: &str) -> ProcessDefinition {
    let mut definition = single_activity_definition(id, &[NOOP]);
    definition.connectors = vec![connector_on("notify", ALWAYS_FAILS, ActivationEvent::OnFinish)];
    definition
}

/// YAML for a definition with ON_ENTER and ON_FINISH connectors on a flow
/// node and a process-level ON_FINISH connector
pub fn lifecycle_definition_yaml(id: &str) -> String {
    format!(
        r#"
id: {id}
name: Lifecycle
flow_nodes:
  - name: review
    connectors:
      - name: before
        connector_id: noop
        activation_event: ON_ENTER
      - name: after
        connector_id: noop
        activation_event: ON_FINISH
connectors:
  - name: notify
    connector_id: noop
    activation_event: ON_FINISH
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_definitions_validate() {
        assert!(noop_fail_noop_definition().validate().is_ok());
        assert!(sequential_definition("seq", 3, NOOP).validate().is_ok());
        assert!(parallel_join_definition("par", NOOP).validate().is_ok());
        assert!(finish_fails_definition("fin", NOOP).validate().is_ok());
        assert!(failing_process_connector_definition("proc").validate().is_ok());
        let lifecycle = ProcessDefinition::from_yaml(&lifecycle_definition_yaml("life")).unwrap();
        assert_eq!(lifecycle.connectors_for(ActivationEvent::OnFinish).len(), 1);
    }

    #[test]
    fn test_sequential_chain() {
        let definition = sequential_definition("seq", 3, NOOP);
        assert!(definition.flow_node("step-0").unwrap().run_after.is_empty());
        assert_eq!(definition.flow_node("step-2").unwrap().run_after, vec!["step-1"]);
    }
}
