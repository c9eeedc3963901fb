use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::protocol::order::Order;
use crate::protocol::{Payload, ProtocolVersion};
use crate::topic::Topic;

/// Failure to validate a message payload against the configured protocol
/// version and topic schema.
#[derive(Debug, Clone, thiserror::Error)]
#[error("validation of {topic} payload failed: {details}")]
pub struct ValidationError {
    pub topic: String,
    pub details: String,
}

impl ValidationError {
    pub fn new(topic: &Topic, details: impl Into<String>) -> Self {
        ValidationError {
            topic: topic.name().to_string(),
            details: details.into(),
        }
    }
}

fn parse_typed<T: DeserializeOwned>(topic: &Topic, payload: &Value) -> Result<T, ValidationError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| ValidationError::new(topic, e.to_string()))
}

/// Version gate: the payload's `version` field must agree with the client's
/// configured protocol version on major and minor.
fn check_version(
    topic: &Topic,
    version: ProtocolVersion,
    payload: &Value,
) -> Result<(), ValidationError> {
    let declared = payload
        .get("version")
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::new(topic, "missing version header field"))?;
    if !version.matches_payload(declared) {
        return Err(ValidationError::new(
            topic,
            format!(
                "payload version {:?} does not match configured protocol version {}",
                declared,
                version.as_str()
            ),
        ));
    }
    Ok(())
}

fn check_header(topic: &Topic, payload: &Value) -> Result<(), ValidationError> {
    let object = payload
        .as_object()
        .ok_or_else(|| ValidationError::new(topic, "payload is not a JSON object"))?;
    for key in ["headerId", "timestamp", "manufacturer", "serialNumber"] {
        if !object.contains_key(key) {
            return Err(ValidationError::new(
                topic,
                format!("missing header field {:?}", key),
            ));
        }
    }
    Ok(())
}

/// Validates a core-topic payload against the configured protocol version and
/// produces the typed rendition on success.
pub fn validate_core_payload(
    topic: &Topic,
    version: ProtocolVersion,
    payload: &Value,
) -> Result<Payload, ValidationError> {
    check_header(topic, payload)?;
    check_version(topic, version, payload)?;
    match topic {
        Topic::Connection => parse_typed(topic, payload).map(Payload::Connection),
        Topic::Order => parse_typed(topic, payload).map(Payload::Order),
        Topic::InstantActions => parse_typed(topic, payload).map(Payload::InstantActions),
        Topic::State => parse_typed(topic, payload).map(Payload::State),
        Topic::Visualization => parse_typed(topic, payload).map(Payload::Visualization),
        Topic::Factsheet => {
            if !version.supports_factsheet() {
                return Err(ValidationError::new(
                    topic,
                    format!("factsheet is not part of protocol version {}", version.as_str()),
                ));
            }
            parse_typed(topic, payload).map(Payload::Factsheet)
        }
        Topic::Extension(_) => Ok(Payload::Extension(payload.clone())),
    }
}

/// Checks the structural order invariants beyond the schema: sequence id
/// numbering, node/edge interleaving, and base/horizon shape. Returns every
/// violation found, empty when the order is well-formed.
pub fn order_constraint_violations(order: &Order) -> Vec<String> {
    let mut violations = Vec::new();

    if order.nodes.is_empty() {
        violations.push("order contains no nodes".to_string());
        return violations;
    }
    if order.edges.len() + 1 != order.nodes.len() {
        violations.push(format!(
            "order must contain exactly one edge less than nodes, got {} nodes and {} edges",
            order.nodes.len(),
            order.edges.len()
        ));
    }

    let first_sequence_id = order.nodes[0].sequence_id;
    if first_sequence_id % 2 != 0 {
        violations.push(format!(
            "first node sequenceId {} is not even",
            first_sequence_id
        ));
    }
    for (i, node) in order.nodes.iter().enumerate() {
        let expected = first_sequence_id.wrapping_add(2 * i as u32);
        if node.sequence_id != expected {
            violations.push(format!(
                "node {} has sequenceId {}, expected {}",
                node.node_id, node.sequence_id, expected
            ));
        }
    }
    for (i, edge) in order.edges.iter().enumerate() {
        let Some(start) = order.nodes.get(i) else {
            break;
        };
        let expected = start.sequence_id.wrapping_add(1);
        if edge.sequence_id != expected {
            violations.push(format!(
                "edge {} has sequenceId {}, expected {}",
                edge.edge_id, edge.sequence_id, expected
            ));
        }
        if edge.start_node_id != start.node_id {
            violations.push(format!(
                "edge {} starts at {:?} but node {} is {:?}",
                edge.edge_id, edge.start_node_id, i, start.node_id
            ));
        }
        if let Some(end) = order.nodes.get(i + 1) {
            if edge.end_node_id != end.node_id {
                violations.push(format!(
                    "edge {} ends at {:?} but node {} is {:?}",
                    edge.edge_id,
                    edge.end_node_id,
                    i + 1,
                    end.node_id
                ));
            }
        }
    }

    // Base/horizon shape: released nodes and edges each form a contiguous
    // prefix, the order carries at least one released node, and a released
    // edge always ends in a released node.
    let released_nodes = contiguous_released_prefix(order.nodes.iter().map(|n| n.released));
    let released_edges = contiguous_released_prefix(order.edges.iter().map(|e| e.released));
    match (released_nodes, released_edges) {
        (Some(node_count), Some(edge_count)) => {
            if node_count == 0 {
                violations.push("order contains only horizon nodes".to_string());
            } else if edge_count + 1 != node_count {
                violations.push(format!(
                    "base of {} released nodes must be connected by {} released edges, got {}",
                    node_count,
                    node_count - 1,
                    edge_count
                ));
            }
        }
        _ => violations.push("released nodes/edges do not form a contiguous prefix".to_string()),
    }

    let mut seen_action_ids = std::collections::HashSet::new();
    let node_actions = order.nodes.iter().flat_map(|n| n.actions.iter());
    let edge_actions = order.edges.iter().flat_map(|e| e.actions.iter());
    for action in node_actions.chain(edge_actions) {
        if !seen_action_ids.insert(action.action_id.as_str()) {
            violations.push(format!("duplicate actionId {:?}", action.action_id));
        }
    }

    violations
}

/// Length of the released prefix, or `None` when a released element follows
/// an unreleased one.
fn contiguous_released_prefix(released: impl Iterator<Item = bool>) -> Option<usize> {
    let mut count = 0;
    let mut in_horizon = false;
    for flag in released {
        match (flag, in_horizon) {
            (true, false) => count += 1,
            (true, true) => return None,
            (false, _) => in_horizon = true,
        }
    }
    Some(count)
}
