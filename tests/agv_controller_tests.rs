mod common;

use std::time::Duration;

use common::*;
use vda5050_fleet::adapter::{ActionStatusChange, AdapterEvent, StateUpdate};
use vda5050_fleet::agv_controller::{AgvController, AgvControllerOptions, AgvOutbound};
use vda5050_fleet::protocol::state::{error_types, reference_keys, ActionStatus, BatteryState};
use vda5050_fleet::protocol::{BlockingType, ProtocolVersion};

#[test]
fn test_two_node_order_traversal() {
    let mut bench = Bench::new();
    bench.send_order(two_node_order("order-1"));

    let states = bench.drain_states();
    assert!(states.len() >= 4);

    // Acceptance: both nodes and the edge pending.
    assert_eq!(states[0].order_id, "order-1");
    assert_eq!(states[0].node_states.len(), 2);
    assert_eq!(states[0].edge_states.len(), 1);

    // First node traversed immediately.
    assert_eq!(states[1].last_node_id, "n1");
    assert_eq!(states[1].node_states.len(), 1);

    // Driving along the edge.
    let driving = states.iter().find(|s| s.driving).expect("a driving state");
    assert_eq!(driving.last_node_id, "n1");

    // Arrived: everything worked off.
    let last = states.last().unwrap();
    assert_eq!(last.last_node_id, "n2");
    assert_eq!(last.last_node_sequence_id, 2);
    assert!(last.node_states.is_empty());
    assert!(last.edge_states.is_empty());
    assert!(!last.driving);
    assert!(!bench.controller.has_active_order());

    let log = bench.script.lock().unwrap().log.clone();
    assert!(log.contains(&"traverse:e12".to_string()));
}

#[test]
fn test_hard_actions_run_sequentially_and_stop_driving() {
    let mut bench = Bench::new();
    let mut order = two_node_order("order-1");
    order.nodes[0].actions.push(action("pick-1", "pick", BlockingType::Hard));
    order.nodes[0].actions.push(action("drop-1", "drop", BlockingType::Hard));
    bench.send_order(order);

    let log = bench.script.lock().unwrap().log.clone();
    let pick_index = log.iter().position(|l| l.starts_with("execute:pick-1")).unwrap();
    let drop_index = log.iter().position(|l| l.starts_with("execute:drop-1")).unwrap();
    assert!(pick_index < drop_index);
    assert!(log[pick_index].ends_with(":stop"));
    assert!(log[drop_index].ends_with(":stop"));

    // Every status transition was published, in order, per action.
    let states = bench.drain_states();
    let pick_statuses: Vec<ActionStatus> = states
        .iter()
        .filter_map(|s| Bench::action_status(s, "pick-1"))
        .collect();
    assert_eq!(pick_statuses.first(), Some(&ActionStatus::Waiting));
    assert_eq!(pick_statuses.last(), Some(&ActionStatus::Finished));
    let last = states.last().unwrap();
    assert_eq!(Bench::action_status(last, "drop-1"), Some(ActionStatus::Finished));
    assert!(!bench.controller.has_active_order());
}

#[test]
fn test_none_actions_do_not_stop_driving() {
    let mut bench = Bench::new();
    let mut order = two_node_order("order-1");
    order.nodes[0].actions.push(action("beep", "beep", BlockingType::None));
    bench.send_order(order);

    let log = bench.script.lock().unwrap().log.clone();
    assert!(log.contains(&"execute:beep".to_string()));
}

#[test]
fn test_soft_action_stops_driving() {
    let mut bench = Bench::new();
    let mut order = two_node_order("order-1");
    order.nodes[0].actions.push(action("lift", "lift", BlockingType::Soft));
    bench.send_order(order);

    let log = bench.script.lock().unwrap().log.clone();
    assert!(log.contains(&"execute:lift:stop".to_string()));
}

#[test]
fn test_trailing_soft_action_gates_edge_traversal() {
    let script = ScriptedState::default().with_behavior("lift", Behavior::Hold);
    let mut bench = Bench::with_script(script);
    let mut order = two_node_order("order-1");
    order.nodes[0].actions.push(action("lift-1", "lift", BlockingType::Soft));
    bench.send_order(order);

    // Traversal waits for the SOFT action to end.
    assert!(!bench
        .script
        .lock()
        .unwrap()
        .log
        .contains(&"traverse:e12".to_string()));

    bench.release_held_actions(ActionStatusChange::to(ActionStatus::Finished));
    let log = bench.script.lock().unwrap().log.clone();
    assert!(log.contains(&"traverse:e12".to_string()));
    assert_eq!(bench.latest_state().last_node_id, "n2");
}

#[test]
fn test_trailing_none_action_outlives_node() {
    let script = ScriptedState::default().with_behavior("beep", Behavior::Hold);
    let mut bench = Bench::with_script(script);
    let mut order = two_node_order("order-1");
    order.nodes[0].actions.push(action("beep-1", "beep", BlockingType::None));
    bench.send_order(order);

    // The NONE action is still running but traversal went ahead.
    let state = bench.latest_state();
    assert_eq!(state.last_node_id, "n2");
    assert_eq!(Bench::action_status(&state, "beep-1"), Some(ActionStatus::Running));
    assert!(bench.controller.has_active_order());

    bench.release_held_actions(ActionStatusChange::to(ActionStatus::Finished));
    assert!(!bench.controller.has_active_order());
}

#[test]
fn test_waiting_states_precede_dispatch() {
    // Every released order action appears WAITING in the acceptance state
    // before the adapter sees any dispatch.
    let mut bench = Bench::new();
    let mut order = two_node_order("order-1");
    order.nodes[0].actions.push(action("a1", "pick", BlockingType::Hard));
    order.edges[0].actions.push(action("a2", "blink", BlockingType::None));
    bench.send_order(order);

    let states = bench.drain_states();
    let acceptance = &states[0];
    assert_eq!(Bench::action_status(acceptance, "a1"), Some(ActionStatus::Waiting));
    assert_eq!(Bench::action_status(acceptance, "a2"), Some(ActionStatus::Waiting));
}

#[test]
fn test_lower_order_update_id_rejected() {
    let mut bench = Bench::new();
    let mut order = two_node_order("order-1");
    order.order_update_id = 3;
    bench.send_order(order.clone());
    bench.drain_states();

    order.order_update_id = 2;
    bench.send_order(order);
    let states = bench.drain_states();
    let error = &states.last().unwrap().errors[0];
    assert_eq!(error.error_type, error_types::ORDER_UPDATE_ERROR);
    assert_eq!(error.reference(reference_keys::ORDER_ID), Some("order-1"));
    assert_eq!(error.reference(reference_keys::ORDER_UPDATE_ID), Some("2"));
}

#[test]
fn test_duplicate_order_republishes_state_unchanged() {
    let mut bench = Bench::new();
    let order = two_node_order("order-1");
    bench.send_order(order.clone());
    let before = bench.latest_state();

    bench.send_order(order);
    let states = bench.drain_states();
    assert_eq!(states.len(), 1);
    assert!(states[0].errors.is_empty());
    assert_eq!(states[0].last_node_id, before.last_node_id);
    assert_eq!(states[0].order_update_id, before.order_update_id);
}

#[test]
fn test_order_rejected_while_charging() {
    let mut bench = Bench::new();
    bench.controller.handle_adapter_event(AdapterEvent::StateUpdated {
        update: StateUpdate {
            battery_state: Some(BatteryState {
                battery_charge: 40.0,
                battery_voltage: None,
                battery_health: None,
                charging: true,
                reach: None,
            }),
            ..StateUpdate::default()
        },
    });
    bench.drain_states();

    bench.send_order(two_node_order("order-1"));
    let states = bench.drain_states();
    let error = &states.last().unwrap().errors[0];
    assert_eq!(error.error_type, error_types::ORDER_ERROR);
    assert!(!bench.controller.has_active_order());
}

#[test]
fn test_structurally_invalid_order_rejected() {
    let mut bench = Bench::new();
    let mut order = two_node_order("order-1");
    order.edges.clear();
    bench.send_order(order);

    let states = bench.drain_states();
    let error = &states.last().unwrap().errors[0];
    assert_eq!(error.error_type, error_types::ORDER_VALIDATION_ERROR);
}

#[test]
fn test_invalid_order_payload_reports_raw_references() {
    let mut bench = Bench::new();
    let raw = serde_json::json!({
        "headerId": 7,
        "orderId": "o42",
        "orderUpdateId": "foo"
    });
    bench.controller.report_invalid_order(&raw);

    let states = bench.drain_states();
    let error = &states.last().unwrap().errors[0];
    assert_eq!(error.error_type, error_types::ORDER_VALIDATION_ERROR);
    assert_eq!(error.reference(reference_keys::TOPIC), Some("order"));
    assert_eq!(error.reference(reference_keys::ORDER_ID), Some("o42"));
    assert_eq!(error.reference(reference_keys::ORDER_UPDATE_ID), Some("foo"));
}

#[test]
fn test_acceptance_clears_rejection_errors() {
    let mut bench = Bench::new();
    let mut bad = two_node_order("order-1");
    bad.edges.clear();
    bench.send_order(bad);
    bench.drain_states();

    bench.send_order(two_node_order("order-2"));
    let states = bench.drain_states();
    assert!(states.last().unwrap().errors.is_empty());
}

#[test]
fn test_empty_instant_action_batch_is_a_noop() {
    let mut bench = Bench::new();
    bench.send_instant_actions(vec![]);
    let states = bench.drain_states();
    assert!(states.iter().all(|s| s.errors.is_empty()));
    assert!(states.iter().all(|s| s.action_states.is_empty()));
}

#[test]
fn test_state_request_finishes_immediately() {
    let mut bench = Bench::new();
    bench.send_instant_actions(vec![action("sr-1", "stateRequest", BlockingType::None)]);
    let states = bench.drain_states();
    assert_eq!(
        Bench::action_status(&states[0], "sr-1"),
        Some(ActionStatus::Finished)
    );
}

#[test]
fn test_instant_action_state_purged_after_final_publish_count() {
    let options = AgvControllerOptions {
        final_instant_action_state_change_publish_count: 1,
        ..AgvControllerOptions::default()
    };
    let mut bench = Bench::with_setup(ScriptedState::default(), options);
    bench.send_instant_actions(vec![action("sr-1", "stateRequest", BlockingType::None)]);

    // The terminal status is visible in exactly one publication.
    let states = bench.drain_states();
    assert_eq!(
        Bench::action_status(&states[0], "sr-1"),
        Some(ActionStatus::Finished)
    );
    bench.controller.publish_state_now();
    let state = bench.drain_states().pop().unwrap();
    assert!(Bench::action_status(&state, "sr-1").is_none());
}

#[test]
fn test_cancel_order_without_active_order() {
    let mut bench = Bench::new();
    bench.send_instant_actions(vec![action("c-1", "cancelOrder", BlockingType::None)]);
    let states = bench.drain_states();
    let error = &states.last().unwrap().errors[0];
    assert_eq!(
        error.error_type,
        error_types::INSTANT_ACTION_NO_ORDER_TO_CANCEL
    );
    assert_eq!(error.reference(reference_keys::ACTION_ID), Some("c-1"));
}

#[test]
fn test_cancel_order_fails_waiting_actions_and_preserves_last_node() {
    let script = ScriptedState {
        hold_traversal: true,
        ..ScriptedState::default()
    };
    let mut bench = Bench::with_script(script);
    let mut order = two_node_order("order-1");
    order.nodes[1].actions.push(action("late", "drop", BlockingType::Hard));
    bench.send_order(order);
    bench.drain_states();

    bench.send_instant_actions(vec![action("c-1", "cancelOrder", BlockingType::None)]);
    let states = bench.drain_states();

    // The cancelOrder action was published RUNNING alongside the failed
    // waiting action before completing.
    let running = states
        .iter()
        .find(|s| Bench::action_status(s, "c-1") == Some(ActionStatus::Running))
        .expect("cancelOrder RUNNING state");
    assert_eq!(Bench::action_status(running, "late"), Some(ActionStatus::Failed));

    let last = states.last().unwrap();
    assert_eq!(Bench::action_status(last, "c-1"), Some(ActionStatus::Finished));
    assert!(last.node_states.is_empty());
    assert!(last.edge_states.is_empty());
    assert_eq!(last.last_node_id, "n1");
    assert_eq!(last.order_id, "order-1");
    assert!(!bench.controller.has_active_order());
    assert!(bench
        .script
        .lock()
        .unwrap()
        .log
        .contains(&"stop-traverse".to_string()));
}

#[test]
fn test_cancel_interrupts_running_action() {
    let script = ScriptedState::default().with_behavior("pick", Behavior::Hold);
    let mut bench = Bench::with_script(script);
    let mut order = two_node_order("order-1");
    order.nodes[0].actions.push(action("pick-1", "pick", BlockingType::Hard));
    bench.send_order(order);
    bench.drain_states();

    bench.send_instant_actions(vec![action("c-1", "cancelOrder", BlockingType::None)]);
    let last = bench.latest_state();
    assert_eq!(Bench::action_status(&last, "pick-1"), Some(ActionStatus::Failed));
    assert_eq!(Bench::action_status(&last, "c-1"), Some(ActionStatus::Finished));
    let log = bench.script.lock().unwrap().log.clone();
    assert!(log.contains(&"cancel:pick-1".to_string()));
}

#[test]
fn test_order_rejected_while_cancel_pending() {
    let script = ScriptedState {
        hold_stop: true,
        ..ScriptedState::default()
    };
    let mut bench = Bench::with_script(script);
    bench.send_order(two_node_order("order-1"));
    // The order is done already, so make a fresh active one with a held
    // traversal to keep the cancel pending.
    let mut order = two_node_order("order-2");
    order.order_update_id = 0;
    bench.script.lock().unwrap().hold_traversal = true;
    bench.send_order(order);
    bench.send_instant_actions(vec![action("c-1", "cancelOrder", BlockingType::None)]);
    bench.drain_states();

    bench.send_order(two_node_order("order-3"));
    let states = bench.drain_states();
    let error = &states.last().unwrap().errors[0];
    assert_eq!(error.error_type, error_types::ORDER_ERROR);
}

#[test]
fn test_pause_defers_node_entry_until_stop_pause() {
    let script = ScriptedState {
        hold_traversal: true,
        ..ScriptedState::default()
    };
    let mut bench = Bench::with_script(script);
    bench.send_order(two_node_order("order-1"));
    bench.drain_states();

    bench.send_instant_actions(vec![action("p-1", "startPause", BlockingType::Hard)]);
    let paused = bench.latest_state();
    assert_eq!(paused.paused, Some(true));

    // Arrival at n2 is deferred while paused.
    bench.release_held_traversals();
    let state = bench.latest_state();
    assert_eq!(state.last_node_id, "n1");
    assert_eq!(state.node_states.len(), 1);

    bench.send_instant_actions(vec![action("p-2", "stopPause", BlockingType::Hard)]);
    let resumed = bench.latest_state();
    assert_eq!(resumed.paused, Some(false));
    assert_eq!(resumed.last_node_id, "n2");
    assert!(resumed.node_states.is_empty());
}

#[test]
fn test_stitching_extends_active_order() {
    let script = ScriptedState {
        hold_traversal: true,
        ..ScriptedState::default()
    };
    let mut bench = Bench::with_script(script);
    let mut order_a = two_node_order("order-a");
    order_a.nodes[1].actions.push(action("pick-1", "pick", BlockingType::None));
    bench.send_order(order_a);
    bench.drain_states();

    // Stitch while traversing e12: order B starts at the current base end n2.
    let mut stitch_node = node_at("n2", 2, true, 10.0, 10.0);
    stitch_node.actions.push(action("drop-1", "drop", BlockingType::None));
    let order_b = order(
        "order-b",
        0,
        vec![stitch_node, node_at("n3", 4, true, 20.0, 10.0)],
        vec![edge("e23", 3, true, "n2", "n3")],
    );
    bench.send_order(order_b);
    let stitched = bench.latest_state();
    assert_eq!(stitched.order_id, "order-b");
    assert_eq!(stitched.node_states.len(), 2);
    assert_eq!(stitched.edge_states.len(), 2);

    bench.release_held_traversals();
    bench.script.lock().unwrap().hold_traversal = false;
    bench.release_held_traversals();

    let last = bench.latest_state();
    assert_eq!(last.last_node_id, "n3");
    assert!(last.node_states.is_empty());
    assert!(!bench.controller.has_active_order());

    // Both the original and the stitched action ran on n2.
    let log = bench.script.lock().unwrap().log.clone();
    assert!(log.iter().any(|l| l.starts_with("execute:pick-1")));
    assert!(log.iter().any(|l| l.starts_with("execute:drop-1")));
}

#[test]
fn test_non_stitching_order_rejected_while_active() {
    let script = ScriptedState {
        hold_traversal: true,
        ..ScriptedState::default()
    };
    let mut bench = Bench::with_script(script);
    bench.send_order(two_node_order("order-a"));
    bench.drain_states();

    // order-b starts at a node that is not the current base end.
    let order_b = order(
        "order-b",
        0,
        vec![node("n7", 0, true), node("n8", 2, true)],
        vec![edge("e78", 1, true, "n7", "n8")],
    );
    bench.send_order(order_b);
    let states = bench.drain_states();
    let error = &states.last().unwrap().errors[0];
    assert_eq!(error.error_type, error_types::ORDER_ERROR);
}

#[test]
fn test_first_node_outside_deviation_range_rejected() {
    let script = ScriptedState {
        deviation_errors: vec![vda5050_fleet::protocol::ErrorReference {
            reference_key: "nodeId".to_string(),
            reference_value: "n1".to_string(),
        }],
        ..ScriptedState::default()
    };
    let mut bench = Bench::with_script(script);
    bench.send_order(two_node_order("order-1"));
    let states = bench.drain_states();
    let error = &states.last().unwrap().errors[0];
    assert_eq!(error.error_type, error_types::NO_ROUTE_ERROR);
}

#[test]
fn test_factsheet_request_without_factsheet_fails() {
    let mut bench = Bench::new();
    bench.send_instant_actions(vec![action("f-1", "factsheetRequest", BlockingType::None)]);
    let states = bench.drain_states();
    assert_eq!(
        Bench::action_status(&states[0], "f-1"),
        Some(ActionStatus::Failed)
    );
}

#[test]
fn test_factsheet_request_fails_on_v1_1() {
    let script = std::sync::Arc::new(std::sync::Mutex::new(ScriptedState::default()));
    let adapter = Box::new(ScriptedAdapter {
        state: script.clone(),
    });
    let (mut controller, _events, mut outbound) = AgvController::new(
        agv_id(),
        ProtocolVersion::V1_1,
        AgvControllerOptions::default(),
        adapter,
    )
    .unwrap();
    controller.process_instant_actions(instant_message(vec![action(
        "f-1",
        "factsheetRequest",
        BlockingType::None,
    )]));
    let mut failed = false;
    while let Ok(message) = outbound.try_recv() {
        if let AgvOutbound::State(state) = message {
            if Bench::action_status(&state, "f-1") == Some(ActionStatus::Failed) {
                failed = true;
            }
        }
    }
    assert!(failed);
}

#[test]
fn test_order_execution_time_estimate() {
    // Two pick/drop actions at 1s init + 5s duration each, plus a 10 unit
    // edge at 0.2 units/s: 2 * 6s + 50s = 62s.
    let script = ScriptedState {
        action_init_seconds: 1.0,
        action_duration_seconds: 5.0,
        speed: 0.2,
        ..ScriptedState::default()
    };
    let mut bench = Bench::with_script(script);
    let mut order = order(
        "order-1",
        0,
        vec![node_at("n1", 0, true, 0.0, 0.0), node_at("n2", 2, true, 10.0, 0.0)],
        vec![edge("e12", 1, true, "n1", "n2")],
    );
    order.nodes[0].actions.push(action("pick-1", "pick", BlockingType::Hard));
    order.nodes[1].actions.push(action("drop-1", "drop", BlockingType::Hard));
    bench.send_order(order);
    bench.drain_states();

    bench.send_instant_actions(vec![action(
        "t-1",
        "orderExecutionTime",
        BlockingType::None,
    )]);
    let state = bench.latest_state();
    let result = state
        .action_states
        .iter()
        .find(|a| a.action_id == "t-1")
        .and_then(|a| a.result_description.clone());
    assert_eq!(result.as_deref(), Some("62.0"));
}

#[test]
fn test_visualization_carries_position_only() {
    let mut bench = Bench::new();
    bench.controller.publish_visualization();
    let outbound = bench.drain_outbound();
    let visualization = outbound
        .iter()
        .find_map(|m| match m {
            AgvOutbound::Visualization(v) => Some(v.clone()),
            _ => None,
        })
        .expect("visualization message");
    assert!(visualization.agv_position.is_some());
    assert!(visualization.velocity.is_none());
}

#[test]
fn test_default_options_match_contract() {
    let options = AgvControllerOptions::default();
    assert_eq!(options.publish_state_interval, Duration::from_millis(30_000));
    assert_eq!(
        options.publish_visualization_interval,
        Duration::from_millis(1_000)
    );
    assert_eq!(options.final_instant_action_state_change_publish_count, 5);
}
