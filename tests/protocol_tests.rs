mod common;

use rstest::rstest;
use serde_json::json;

use common::{action, edge, node, order, two_node_order};
use vda5050_fleet::protocol::validation::{order_constraint_violations, validate_core_payload};
use vda5050_fleet::protocol::{
    ActionParameter, ActionParameterValue, BlockingType, Order, Payload, ProtocolVersion,
};
use vda5050_fleet::topic::Topic;

#[test]
fn test_order_wire_shape() {
    let mut order = two_node_order("order-1");
    order.nodes[0].actions.push(action("a1", "pick", BlockingType::Hard));
    let value = serde_json::to_value(&order).unwrap();

    // Header fields are flattened into the payload and keys are camelCase.
    assert_eq!(value["orderId"], "order-1");
    assert_eq!(value["orderUpdateId"], 0);
    assert_eq!(value["manufacturer"], "RobotCo");
    assert_eq!(value["serialNumber"], "AGV-001");
    assert_eq!(value["nodes"][0]["nodeId"], "n1");
    assert_eq!(value["nodes"][0]["sequenceId"], 0);
    assert_eq!(value["nodes"][0]["actions"][0]["blockingType"], "HARD");
    assert_eq!(value["edges"][0]["startNodeId"], "n1");

    // Unset optional fields are skipped entirely.
    assert!(value.get("zoneSetId").is_none());
    assert!(value["nodes"][0].get("nodePosition").is_none());

    let back: Order = serde_json::from_value(value).unwrap();
    assert_eq!(back, order);
}

#[test]
fn test_action_parameter_value_forms() {
    let json = json!({"key": "duration", "value": 5});
    let parameter: ActionParameter = serde_json::from_value(json).unwrap();
    assert_eq!(parameter.value, ActionParameterValue::Int(5));

    let json = json!({"key": "direction", "value": "left"});
    let parameter: ActionParameter = serde_json::from_value(json).unwrap();
    assert_eq!(parameter.value.as_str(), Some("left"));

    let json = json!({"key": "threshold", "value": 0.25});
    let parameter: ActionParameter = serde_json::from_value(json).unwrap();
    assert_eq!(parameter.value.as_f64(), Some(0.25));
}

#[test]
fn test_version_gate() {
    let order = two_node_order("order-1");
    let mut value = serde_json::to_value(&order).unwrap();

    let parsed = validate_core_payload(&Topic::Order, ProtocolVersion::V2_0, &value);
    assert!(matches!(parsed, Ok(Payload::Order(_))));

    // Patch level differences are tolerated; minor differences are not.
    value["version"] = json!("2.0.3");
    assert!(validate_core_payload(&Topic::Order, ProtocolVersion::V2_0, &value).is_ok());
    value["version"] = json!("2.1.0");
    assert!(validate_core_payload(&Topic::Order, ProtocolVersion::V2_0, &value).is_err());
    value["version"] = json!("1.1.0");
    assert!(validate_core_payload(&Topic::Order, ProtocolVersion::V2_0, &value).is_err());
}

#[test]
fn test_factsheet_not_available_before_v2() {
    let payload = json!({
        "headerId": 0,
        "timestamp": "2024-05-01T10:00:00.000Z",
        "version": "1.1.0",
        "manufacturer": "RobotCo",
        "serialNumber": "AGV-001",
        "typeSpecification": {},
        "physicalParameters": {}
    });
    let result = validate_core_payload(&Topic::Factsheet, ProtocolVersion::V1_1, &payload);
    assert!(result.is_err());
}

#[test]
fn test_malformed_order_update_id_fails_validation() {
    let mut value = serde_json::to_value(&two_node_order("o42")).unwrap();
    value["orderUpdateId"] = json!("foo");
    let result = validate_core_payload(&Topic::Order, ProtocolVersion::V2_0, &value);
    assert!(result.is_err());
}

#[test]
fn test_valid_order_has_no_violations() {
    assert!(order_constraint_violations(&two_node_order("order-1")).is_empty());
}

#[rstest]
#[case::odd_first_sequence(order(
    "o",
    0,
    vec![node("n1", 1, true), node("n2", 3, true)],
    vec![edge("e", 2, true, "n1", "n2")],
))]
#[case::non_contiguous_sequence(order(
    "o",
    0,
    vec![node("n1", 0, true), node("n2", 4, true)],
    vec![edge("e", 1, true, "n1", "n2")],
))]
#[case::wrong_edge_count(order(
    "o",
    0,
    vec![node("n1", 0, true), node("n2", 2, true)],
    vec![],
))]
#[case::mismatched_endpoints(order(
    "o",
    0,
    vec![node("n1", 0, true), node("n2", 2, true)],
    vec![edge("e", 1, true, "n1", "n9")],
))]
#[case::horizon_only(order(
    "o",
    0,
    vec![node("n1", 0, false), node("n2", 2, false)],
    vec![edge("e", 1, false, "n1", "n2")],
))]
#[case::released_after_horizon(order(
    "o",
    0,
    vec![node("n1", 0, true), node("n2", 2, false), node("n3", 4, true)],
    vec![edge("e1", 1, true, "n1", "n2"), edge("e2", 3, false, "n2", "n3")],
))]
#[case::released_edge_into_horizon_node(order(
    "o",
    0,
    vec![node("n1", 0, true), node("n2", 2, false)],
    vec![edge("e", 1, true, "n1", "n2")],
))]
fn test_order_constraint_violations(#[case] order: Order) {
    assert!(!order_constraint_violations(&order).is_empty());
}

#[test]
fn test_duplicate_action_ids_rejected() {
    let mut bad = two_node_order("o");
    bad.nodes[0].actions.push(action("dup", "pick", BlockingType::None));
    bad.nodes[1].actions.push(action("dup", "drop", BlockingType::None));
    assert!(!order_constraint_violations(&bad).is_empty());
}
