mod common;

use common::*;
use vda5050_fleet::master_controller::{MasterController, MasterControllerOptions};
use vda5050_fleet::protocol::state::{
    error_types, ActionStatus, Error, ErrorLevel, ErrorReference, State,
};
use vda5050_fleet::protocol::BlockingType;

fn master() -> MasterController {
    MasterController::new(MasterControllerOptions::default())
}

fn feed(master: &mut MasterController, states: &[State]) {
    let agv = agv_id();
    for state in states {
        master.handle_state(&agv, state);
    }
}

#[test]
fn test_two_node_order_event_sequence() {
    let mut bench = Bench::new();
    let mut master = master();
    let sink = RecordingOrderSink::new();
    let order = two_node_order("order-1");
    assert!(master.begin_assignment(&agv_id(), &order, sink.clone()));

    bench.send_order(order);
    feed(&mut master, &bench.drain_states());

    let events = sink.take();
    assert_eq!(
        events,
        vec![
            OrderEvent::NodeTraversed {
                node_id: "n1".to_string()
            },
            OrderEvent::EdgeTraversing {
                edge_id: "e12".to_string(),
                invocation_count: 1,
                keys: vec![
                    "distanceSinceLastNode".to_string(),
                    "driving".to_string(),
                    "newBaseRequest".to_string(),
                    "operatingMode".to_string(),
                    "paused".to_string(),
                    "safetyState".to_string(),
                ],
            },
            OrderEvent::EdgeTraversed {
                edge_id: "e12".to_string()
            },
            OrderEvent::NodeTraversed {
                node_id: "n2".to_string()
            },
            OrderEvent::Processed {
                order_id: "order-1".to_string(),
                error_type: None,
                by_cancelation: false,
                active: false,
            },
        ]
    );
}

#[test]
fn test_hard_action_status_events() {
    let mut bench = Bench::new();
    let mut master = master();
    let sink = RecordingOrderSink::new();
    let mut order = two_node_order("order-1");
    order.nodes[0].actions.push(action("pick-1", "pick", BlockingType::Hard));
    order.nodes[0].actions.push(action("drop-1", "drop", BlockingType::Hard));
    assert!(master.begin_assignment(&agv_id(), &order, sink.clone()));

    bench.send_order(order);
    feed(&mut master, &bench.drain_states());

    let events = sink.take();
    let pick_changes: Vec<ActionStatus> = events
        .iter()
        .filter_map(|e| match e {
            OrderEvent::ActionChanged {
                action_id, status, ..
            } if action_id == "pick-1" => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(
        pick_changes,
        vec![
            ActionStatus::Waiting,
            ActionStatus::Initializing,
            ActionStatus::Running,
            ActionStatus::Finished,
        ]
    );
    // pick finished before drop left WAITING.
    let pick_finished = events
        .iter()
        .position(|e| {
            matches!(e, OrderEvent::ActionChanged { action_id, status, .. }
                if action_id == "pick-1" && *status == ActionStatus::Finished)
        })
        .unwrap();
    let drop_initializing = events
        .iter()
        .position(|e| {
            matches!(e, OrderEvent::ActionChanged { action_id, status, .. }
                if action_id == "drop-1" && *status == ActionStatus::Initializing)
        })
        .unwrap();
    assert!(pick_finished < drop_initializing);
    assert!(matches!(
        events.last(),
        Some(OrderEvent::Processed {
            by_cancelation: false,
            active: false,
            ..
        })
    ));
}

#[test]
fn test_failed_action_carries_correlated_error() {
    let script = ScriptedState::default().with_behavior("pick", Behavior::Fail("gripper jam".into()));
    let mut bench = Bench::with_script(script);
    let mut master = master();
    let sink = RecordingOrderSink::new();
    let mut order = two_node_order("order-1");
    order.nodes[0].actions.push(action("pick-1", "pick", BlockingType::Hard));
    assert!(master.begin_assignment(&agv_id(), &order, sink.clone()));

    bench.send_order(order);
    feed(&mut master, &bench.drain_states());

    let events = sink.take();
    assert!(events.iter().any(|e| matches!(
        e,
        OrderEvent::ActionChanged {
            action_id,
            status: ActionStatus::Failed,
            error_type: Some(error_type),
            ..
        } if action_id == "pick-1" && error_type == error_types::ORDER_ACTION_ERROR
    )));
}

#[test]
fn test_cancel_while_traversing() {
    let script = ScriptedState {
        hold_traversal: true,
        ..ScriptedState::default()
    };
    let mut bench = Bench::with_script(script);
    let mut master = master();
    let order_sink = RecordingOrderSink::new();
    let instant_sink = RecordingInstantSink::new();
    let order = two_node_order("order-1");
    assert!(master.begin_assignment(&agv_id(), &order, order_sink.clone()));

    bench.send_order(order);
    feed(&mut master, &bench.drain_states());

    let cancel = action("c-1", "cancelOrder", BlockingType::None);
    master.register_instant_actions(&agv_id(), &[cancel.clone()], instant_sink.clone());
    bench.send_instant_actions(vec![cancel]);
    feed(&mut master, &bench.drain_states());

    let instant_events = instant_sink.take();
    assert_eq!(
        instant_events,
        vec![
            InstantEvent::StatusChanged {
                action_id: "c-1".to_string(),
                status: ActionStatus::Running,
                error_type: None,
            },
            InstantEvent::StatusChanged {
                action_id: "c-1".to_string(),
                status: ActionStatus::Finished,
                error_type: None,
            },
        ]
    );

    let order_events = order_sink.take();
    // No onEdgeTraversed for the interrupted edge; the order completes by
    // cancelation.
    assert!(!order_events
        .iter()
        .any(|e| matches!(e, OrderEvent::EdgeTraversed { .. })));
    assert!(matches!(
        order_events.last(),
        Some(OrderEvent::Processed {
            by_cancelation: true,
            active: false,
            ..
        })
    ));
}

#[test]
fn test_stitching_absorbs_previous_cache() {
    let script = ScriptedState {
        hold_traversal: true,
        ..ScriptedState::default()
    };
    let mut bench = Bench::with_script(script);
    let mut master = master();
    let sink_a = RecordingOrderSink::new();
    let sink_b = RecordingOrderSink::new();

    let mut order_a = two_node_order("order-a");
    order_a.nodes[1].actions.push(action("pick-1", "pick", BlockingType::None));
    assert!(master.begin_assignment(&agv_id(), &order_a, sink_a.clone()));
    bench.send_order(order_a);
    feed(&mut master, &bench.drain_states());

    let mut stitch_node = node_at("n2", 2, true, 10.0, 10.0);
    stitch_node.actions.push(action("drop-1", "drop", BlockingType::None));
    let order_b = order(
        "order-b",
        0,
        vec![stitch_node, node_at("n3", 4, true, 20.0, 10.0)],
        vec![edge("e23", 3, true, "n2", "n3")],
    );
    assert!(master.begin_assignment(&agv_id(), &order_b, sink_b.clone()));
    bench.send_order(order_b);
    feed(&mut master, &bench.drain_states());

    // The absorbed order reports processed-but-active on its own sink.
    let events_a = sink_a.take();
    assert!(matches!(
        events_a.last(),
        Some(OrderEvent::Processed {
            active: true,
            by_cancelation: false,
            ..
        })
    ));

    bench.release_held_traversals();
    bench.script.lock().unwrap().hold_traversal = false;
    bench.release_held_traversals();
    feed(&mut master, &bench.drain_states());

    let events_b = sink_b.take();
    // The stitch node's action events target the merged node carrying both
    // the original and the appended action.
    assert!(events_b.iter().any(|e| matches!(
        e,
        OrderEvent::ActionChanged {
            action_id,
            status: ActionStatus::Finished,
            target_action_count: 2,
            ..
        } if action_id == "pick-1"
    )));
    assert!(events_b.iter().any(|e| matches!(
        e,
        OrderEvent::ActionChanged {
            action_id,
            status: ActionStatus::Finished,
            target_action_count: 2,
            ..
        } if action_id == "drop-1"
    )));
    assert!(matches!(
        events_b.last(),
        Some(OrderEvent::Processed {
            order_id,
            active: false,
            by_cancelation: false,
            error_type: None,
        }) if order_id == "order-b"
    ));
}

#[test]
fn test_order_rejection_correlates_by_references() {
    let mut bench = Bench::new();
    let mut master = master();
    let sink = RecordingOrderSink::new();

    // An order the AGV rejects: structurally fine but charging blocks it.
    bench.controller.handle_adapter_event(
        vda5050_fleet::adapter::AdapterEvent::StateUpdated {
            update: vda5050_fleet::adapter::StateUpdate {
                battery_state: Some(vda5050_fleet::protocol::state::BatteryState {
                    battery_charge: 30.0,
                    battery_voltage: None,
                    battery_health: None,
                    charging: true,
                    reach: None,
                }),
                ..Default::default()
            },
        },
    );
    bench.drain_states();

    let order = two_node_order("order-1");
    assert!(master.begin_assignment(&agv_id(), &order, sink.clone()));
    bench.send_order(order);
    feed(&mut master, &bench.drain_states());

    let events = sink.take();
    assert_eq!(
        events,
        vec![OrderEvent::Processed {
            order_id: "order-1".to_string(),
            error_type: Some(error_types::ORDER_ERROR.to_string()),
            by_cancelation: false,
            active: false,
        }]
    );

    // The same error in the next periodic state does not fire twice.
    bench.controller.publish_state_now();
    feed(&mut master, &bench.drain_states());
    assert!(sink.take().is_empty());
}

#[test]
fn test_order_rejection_without_references_falls_back_to_last_assigned() {
    let mut master = master();
    let sink = RecordingOrderSink::new();
    let order = two_node_order("order-1");
    assert!(master.begin_assignment(&agv_id(), &order, sink.clone()));

    let mut bench = Bench::new();
    let mut state = bench.controller.current_state();
    state.errors = vec![Error::new(
        error_types::ORDER_ERROR,
        "rejected",
        ErrorLevel::Warning,
        vec![ErrorReference::new("topic", "order")],
    )];
    master.handle_state(&agv_id(), &state);

    let events = sink.take();
    assert_eq!(
        events,
        vec![OrderEvent::Processed {
            order_id: "order-1".to_string(),
            error_type: Some(error_types::ORDER_ERROR.to_string()),
            by_cancelation: false,
            active: false,
        }]
    );
}

#[test]
fn test_unparseable_order_update_id_cannot_be_correlated() {
    // Assign order o42, then deliver it with a malformed orderUpdateId. The
    // AGV publishes an orderValidationError whose orderUpdateId reference is
    // not a number, so the master must not guess an attribution.
    let mut bench = Bench::new();
    let mut master = master();
    let sink = RecordingOrderSink::new();
    let order = two_node_order("o42");
    assert!(master.begin_assignment(&agv_id(), &order, sink.clone()));

    let raw = serde_json::json!({
        "headerId": 1,
        "orderId": "o42",
        "orderUpdateId": "foo"
    });
    bench.controller.report_invalid_order(&raw);
    feed(&mut master, &bench.drain_states());

    assert!(sink.take().is_empty());
}

#[test]
fn test_duplicate_assignment_is_discarded() {
    let mut master = master();
    let sink = RecordingOrderSink::new();
    let order = two_node_order("order-1");
    assert!(master.begin_assignment(&agv_id(), &order, sink.clone()));
    assert!(!master.begin_assignment(&agv_id(), &order, sink.clone()));
}

#[test]
fn test_edge_traversal_deltas_report_changed_keys_only() {
    let script = ScriptedState {
        hold_traversal: true,
        ..ScriptedState::default()
    };
    let mut bench = Bench::with_script(script);
    let mut master = master();
    let sink = RecordingOrderSink::new();
    let order = two_node_order("order-1");
    assert!(master.begin_assignment(&agv_id(), &order, sink.clone()));
    bench.send_order(order);
    feed(&mut master, &bench.drain_states());

    // Mid-edge the vehicle pauses: only the changed keys are reported.
    bench.controller.handle_adapter_event(
        vda5050_fleet::adapter::AdapterEvent::StateUpdated {
            update: vda5050_fleet::adapter::StateUpdate {
                paused: Some(Some(true)),
                driving: Some(false),
                ..Default::default()
            },
        },
    );
    feed(&mut master, &bench.drain_states());

    let events = sink.take();
    let traversing: Vec<&OrderEvent> = events
        .iter()
        .filter(|e| matches!(e, OrderEvent::EdgeTraversing { .. }))
        .collect();
    assert_eq!(traversing.len(), 2);
    if let OrderEvent::EdgeTraversing {
        invocation_count,
        keys,
        ..
    } = traversing[1]
    {
        assert_eq!(*invocation_count, 2);
        let mut keys = keys.clone();
        keys.sort();
        assert_eq!(keys, vec!["driving".to_string(), "paused".to_string()]);
    } else {
        unreachable!();
    }
}

#[test]
fn test_instant_action_events_and_cleanup() {
    let mut bench = Bench::new();
    let mut master = master();
    let sink = RecordingInstantSink::new();
    let request = action("sr-1", "stateRequest", BlockingType::None);
    master.register_instant_actions(&agv_id(), &[request.clone()], sink.clone());

    bench.send_instant_actions(vec![request]);
    feed(&mut master, &bench.drain_states());

    let events = sink.take();
    assert_eq!(
        events,
        vec![InstantEvent::StatusChanged {
            action_id: "sr-1".to_string(),
            status: ActionStatus::Finished,
            error_type: None,
        }]
    );

    // Terminal: the cache is gone, further states fire nothing.
    bench.controller.publish_state_now();
    feed(&mut master, &bench.drain_states());
    assert!(sink.take().is_empty());
}

#[test]
fn test_rejected_instant_action_reports_error() {
    let mut bench = Bench::new();
    let mut master = master();
    let sink = RecordingInstantSink::new();
    let cancel = action("c-1", "cancelOrder", BlockingType::None);
    master.register_instant_actions(&agv_id(), &[cancel.clone()], sink.clone());

    // No active order: the AGV reports instantActionNoOrderToCancel and no
    // action state ever appears.
    bench.send_instant_actions(vec![cancel]);
    feed(&mut master, &bench.drain_states());

    let events = sink.take();
    assert_eq!(
        events,
        vec![InstantEvent::ActionError {
            action_id: "c-1".to_string(),
            error_type: error_types::INSTANT_ACTION_NO_ORDER_TO_CANCEL.to_string(),
        }]
    );
}

#[test]
fn test_validation_error_attributed_to_oldest_issuance() {
    let mut bench = Bench::new();
    let mut master = master();
    let sink = RecordingInstantSink::new();
    let ghost = action("ghost-1", "beep", BlockingType::None);
    master.register_instant_actions(&agv_id(), &[ghost], sink.clone());

    // The message never reached the queue: the AGV reports a validation
    // error carrying no actionId reference.
    bench
        .controller
        .report_invalid_instant_actions(&serde_json::json!({"headerId": 9}));
    feed(&mut master, &bench.drain_states());

    let events = sink.take();
    assert_eq!(
        events,
        vec![InstantEvent::ActionError {
            action_id: "ghost-1".to_string(),
            error_type: error_types::INSTANT_ACTION_VALIDATION_ERROR.to_string(),
        }]
    );
}
