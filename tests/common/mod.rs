//! Shared test support: message builders, a scripted vehicle adapter, a
//! bench that drives the AGV controller the way its runtime task would, and
//! recording sinks for master-side event assertions.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;

use vda5050_fleet::adapter::{
    ActionContext, ActionScope, ActionStatusChange, AdapterEvent, AgvAdapter, AttachContext,
    DetachContext, RouteSection, StateUpdate, StopTraverseContext, TraverseEdgeContext,
    ADAPTER_API_VERSION,
};
use vda5050_fleet::agv_controller::{AgvController, AgvControllerOptions, AgvOutbound};
use vda5050_fleet::agv_id::AgvId;
use vda5050_fleet::master_controller::{
    ActionTarget, EdgeTraversalChange, InstantActionSink, OrderEventSink, OrderRef,
};
use vda5050_fleet::protocol::state::{ActionState, ActionStatus, Error, State};
use vda5050_fleet::protocol::{
    Action, AgvPosition, BlockingType, Edge, Header, InstantActions, Node, NodePosition, Order,
    ProtocolVersion,
};

pub fn agv_id() -> AgvId {
    AgvId::new("RobotCo", "AGV-001").unwrap()
}

pub fn test_header() -> Header {
    Header {
        header_id: 1,
        timestamp: chrono::Utc::now(),
        version: "2.0.0".to_string(),
        manufacturer: "RobotCo".to_string(),
        serial_number: "AGV-001".to_string(),
    }
}

pub fn node_position(x: f32, y: f32) -> NodePosition {
    NodePosition {
        x,
        y,
        theta: None,
        allowed_deviation_xy: Some(0.5),
        allowed_deviation_theta: None,
        map_id: "local".to_string(),
        map_description: None,
    }
}

pub fn node(node_id: &str, sequence_id: u32, released: bool) -> Node {
    Node {
        node_id: node_id.to_string(),
        sequence_id,
        node_description: None,
        released,
        node_position: None,
        actions: Vec::new(),
    }
}

pub fn node_at(node_id: &str, sequence_id: u32, released: bool, x: f32, y: f32) -> Node {
    Node {
        node_position: Some(node_position(x, y)),
        ..node(node_id, sequence_id, released)
    }
}

pub fn edge(edge_id: &str, sequence_id: u32, released: bool, from: &str, to: &str) -> Edge {
    Edge {
        edge_id: edge_id.to_string(),
        sequence_id,
        edge_description: None,
        released,
        start_node_id: from.to_string(),
        end_node_id: to.to_string(),
        max_speed: None,
        max_height: None,
        min_height: None,
        orientation: None,
        direction: None,
        rotation_allowed: None,
        max_rotation_speed: None,
        length: None,
        trajectory: None,
        actions: Vec::new(),
    }
}

pub fn action(action_id: &str, action_type: &str, blocking_type: BlockingType) -> Action {
    Action {
        action_type: action_type.to_string(),
        action_id: action_id.to_string(),
        action_description: None,
        blocking_type,
        action_parameters: None,
    }
}

pub fn order(order_id: &str, order_update_id: u32, nodes: Vec<Node>, edges: Vec<Edge>) -> Order {
    Order {
        header: test_header(),
        order_id: order_id.to_string(),
        order_update_id,
        zone_set_id: None,
        nodes,
        edges,
    }
}

/// Two released nodes at (0,0) and (10,10) connected by one released edge.
pub fn two_node_order(order_id: &str) -> Order {
    order(
        order_id,
        0,
        vec![
            node("n1", 0, true),
            node_at("n2", 2, true, 10.0, 10.0),
        ],
        vec![edge("e12", 1, true, "n1", "n2")],
    )
}

pub fn instant_message(actions: Vec<Action>) -> InstantActions {
    InstantActions {
        header: test_header(),
        actions,
    }
}

/// How the scripted adapter handles an action type.
#[derive(Clone, Debug)]
pub enum Behavior {
    /// INITIALIZING, RUNNING, FINISHED in one go.
    Finish,
    /// Like `Finish` but with a result description.
    FinishWith(String),
    /// INITIALIZING, then FAILED with the given description.
    Fail(String),
    /// Keep the context; the test completes the action later.
    Hold,
}

#[derive(Default)]
pub struct ScriptedState {
    pub behaviors: HashMap<String, Behavior>,
    pub hold_traversal: bool,
    pub hold_stop: bool,
    /// When set, `cancel_action` lets the action run to completion instead
    /// of failing it.
    pub cancel_declines: bool,
    pub held_actions: Vec<ActionContext>,
    pub held_traversals: Vec<TraverseEdgeContext>,
    pub held_stops: Vec<StopTraverseContext>,
    pub deviation_errors: Vec<vda5050_fleet::protocol::ErrorReference>,
    pub route_errors: Vec<vda5050_fleet::protocol::ErrorReference>,
    pub executable_errors: HashMap<String, Vec<vda5050_fleet::protocol::ErrorReference>>,
    pub log: Vec<String>,
    /// Deterministic timings used by the `orderExecutionTime` estimate.
    pub action_init_seconds: f64,
    pub action_duration_seconds: f64,
    pub speed: f64,
    pub last_route: Option<(Vec<Node>, Vec<Edge>)>,
}

impl ScriptedState {
    pub fn with_behavior(mut self, action_type: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(action_type.to_string(), behavior);
        self
    }
}

/// Test vehicle: executes whatever the script says, immediately and
/// deterministically.
pub struct ScriptedAdapter {
    pub state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedAdapter {
    fn behavior(&self, action_type: &str) -> Behavior {
        self.state
            .lock()
            .unwrap()
            .behaviors
            .get(action_type)
            .cloned()
            .unwrap_or(Behavior::Finish)
    }

    /// Straight-line travel time over the released route, plus the scripted
    /// per-action init and duration times.
    fn order_execution_seconds(&self) -> f64 {
        let state = self.state.lock().unwrap();
        let Some((nodes, edges)) = &state.last_route else {
            return 0.0;
        };
        let action_count: usize = nodes.iter().map(|n| n.actions.len()).sum::<usize>()
            + edges.iter().map(|e| e.actions.len()).sum::<usize>();
        let action_seconds =
            action_count as f64 * (state.action_init_seconds + state.action_duration_seconds);
        let mut travel = 0.0;
        for pair in nodes.windows(2) {
            if let (Some(a), Some(b)) = (&pair[0].node_position, &pair[1].node_position) {
                let dx = (a.x - b.x) as f64;
                let dy = (a.y - b.y) as f64;
                travel += (dx * dx + dy * dy).sqrt();
            }
        }
        let travel_seconds = if state.speed > 0.0 {
            travel / state.speed
        } else {
            0.0
        };
        action_seconds + travel_seconds
    }
}

impl AgvAdapter for ScriptedAdapter {
    fn api_version(&self) -> u32 {
        ADAPTER_API_VERSION
    }

    fn name(&self) -> &str {
        "scripted-vehicle"
    }

    fn attach(&mut self, context: AttachContext) {
        context.attached(StateUpdate {
            agv_position: Some(Some(AgvPosition {
                x: 0.0,
                y: 0.0,
                theta: 0.0,
                map_id: "local".to_string(),
                map_description: None,
                position_initialized: true,
                localization_score: None,
                deviation_range: None,
            })),
            ..StateUpdate::default()
        })
    }

    fn detach(&mut self, context: DetachContext) {
        context.detached(StateUpdate::default())
    }

    fn is_action_executable(
        &self,
        action: &Action,
        _scope: &ActionScope,
    ) -> Vec<vda5050_fleet::protocol::ErrorReference> {
        self.state
            .lock()
            .unwrap()
            .executable_errors
            .get(&action.action_type)
            .cloned()
            .unwrap_or_default()
    }

    fn execute_action(&mut self, context: ActionContext) {
        self.state.lock().unwrap().log.push(format!(
            "execute:{}{}",
            context.action.action_id,
            if context.stop_driving { ":stop" } else { "" }
        ));
        if context.action.action_type == "orderExecutionTime" {
            let seconds = self.order_execution_seconds();
            context.update_action_status(ActionStatusChange::finished_with(format!(
                "{seconds:.1}"
            )));
            return;
        }
        match self.behavior(&context.action.action_type) {
            Behavior::Finish => {
                context.update_action_status(ActionStatusChange::to(ActionStatus::Initializing));
                context.update_action_status(ActionStatusChange::to(ActionStatus::Running));
                context.update_action_status(ActionStatusChange::to(ActionStatus::Finished));
            }
            Behavior::FinishWith(result) => {
                context.update_action_status(ActionStatusChange::to(ActionStatus::Initializing));
                context.update_action_status(ActionStatusChange::to(ActionStatus::Running));
                context.update_action_status(ActionStatusChange::finished_with(result));
            }
            Behavior::Fail(description) => {
                context.update_action_status(ActionStatusChange::to(ActionStatus::Initializing));
                context.update_action_status(ActionStatusChange::failed_with(description));
            }
            Behavior::Hold => {
                context.update_action_status(ActionStatusChange::to(ActionStatus::Running));
                self.state.lock().unwrap().held_actions.push(context);
            }
        }
    }

    fn cancel_action(&mut self, context: ActionContext) {
        let declines = {
            let mut state = self.state.lock().unwrap();
            state.log.push(format!("cancel:{}", context.action.action_id));
            state
                .held_actions
                .retain(|held| held.action.action_id != context.action.action_id);
            state.cancel_declines
        };
        if declines {
            context.update_action_status(ActionStatusChange::to(ActionStatus::Finished));
        } else {
            context.update_action_status(ActionStatusChange::failed_with("canceled"));
        }
    }

    fn finish_edge_action(&mut self, context: ActionContext) {
        let mut state = self.state.lock().unwrap();
        state
            .log
            .push(format!("finish-edge:{}", context.action.action_id));
        state
            .held_actions
            .retain(|held| held.action.action_id != context.action.action_id);
        drop(state);
        context.update_action_status(ActionStatusChange::to(ActionStatus::Finished));
    }

    fn is_node_within_deviation_range(
        &self,
        _node: &Node,
    ) -> Vec<vda5050_fleet::protocol::ErrorReference> {
        self.state.lock().unwrap().deviation_errors.clone()
    }

    fn is_route_traversable(
        &self,
        route: &RouteSection<'_>,
    ) -> Vec<vda5050_fleet::protocol::ErrorReference> {
        let mut state = self.state.lock().unwrap();
        state.last_route = Some((route.nodes.to_vec(), route.edges.to_vec()));
        state.route_errors.clone()
    }

    fn traverse_edge(&mut self, context: TraverseEdgeContext) {
        let hold = {
            let mut state = self.state.lock().unwrap();
            state
                .log
                .push(format!("traverse:{}", context.edge.edge_id));
            state.hold_traversal
        };
        if hold {
            self.state.lock().unwrap().held_traversals.push(context);
        } else {
            context.edge_traversed();
        }
    }

    fn stop_traverse(&mut self, context: StopTraverseContext) {
        let hold = {
            let mut state = self.state.lock().unwrap();
            state.log.push("stop-traverse".to_string());
            state.hold_stop
        };
        if hold {
            self.state.lock().unwrap().held_stops.push(context);
        } else {
            context.stopped();
        }
    }
}

/// Drives the controller core the way its runtime task would: adapter events
/// are pumped back in until quiescence, outbound messages are collected for
/// assertions.
pub struct Bench {
    pub controller: AgvController,
    pub script: Arc<Mutex<ScriptedState>>,
    events: UnboundedReceiver<AdapterEvent>,
    outbound: UnboundedReceiver<AgvOutbound>,
}

impl Bench {
    pub fn new() -> Self {
        Self::with_setup(ScriptedState::default(), AgvControllerOptions::default())
    }

    pub fn with_script(script: ScriptedState) -> Self {
        Self::with_setup(script, AgvControllerOptions::default())
    }

    pub fn with_setup(script: ScriptedState, options: AgvControllerOptions) -> Self {
        let script = Arc::new(Mutex::new(script));
        let adapter = Box::new(ScriptedAdapter {
            state: script.clone(),
        });
        let (mut controller, events, outbound) =
            AgvController::new(agv_id(), ProtocolVersion::V2_0, options, adapter).unwrap();
        controller.attach_adapter();
        let mut bench = Bench {
            controller,
            script,
            events,
            outbound,
        };
        bench.pump();
        bench.drain_states();
        bench
    }

    /// Processes queued adapter events until the controller is quiescent.
    pub fn pump(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.controller.handle_adapter_event(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    pub fn send_order(&mut self, order: Order) {
        self.controller.process_order(order);
        self.pump();
    }

    pub fn send_instant_actions(&mut self, actions: Vec<Action>) {
        self.controller.process_instant_actions(instant_message(actions));
        self.pump();
    }

    /// Completes every held action with the given change.
    pub fn release_held_actions(&mut self, change: ActionStatusChange) {
        let held: Vec<ActionContext> = self.script.lock().unwrap().held_actions.drain(..).collect();
        for context in held {
            context.update_action_status(change.clone());
        }
        self.pump();
    }

    /// Finishes every held edge traversal.
    pub fn release_held_traversals(&mut self) {
        let held: Vec<TraverseEdgeContext> = self
            .script
            .lock()
            .unwrap()
            .held_traversals
            .drain(..)
            .collect();
        for context in held {
            context.edge_traversed();
        }
        self.pump();
    }

    pub fn drain_outbound(&mut self) -> Vec<AgvOutbound> {
        let mut messages = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// All state messages published since the last drain.
    pub fn drain_states(&mut self) -> Vec<State> {
        self.drain_outbound()
            .into_iter()
            .filter_map(|message| match message {
                AgvOutbound::State(state) => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn latest_state(&mut self) -> State {
        self.drain_states()
            .into_iter()
            .last()
            .unwrap_or_else(|| self.controller.current_state())
    }

    pub fn action_status(state: &State, action_id: &str) -> Option<ActionStatus> {
        state
            .action_states
            .iter()
            .find(|a| a.action_id == action_id)
            .map(|a| a.action_status)
    }
}

/// Recorded master-side order event, flattened for assertions.
#[derive(Clone, Debug, PartialEq)]
pub enum OrderEvent {
    Processed {
        order_id: String,
        error_type: Option<String>,
        by_cancelation: bool,
        active: bool,
    },
    ActionChanged {
        action_id: String,
        status: ActionStatus,
        target_action_count: usize,
        error_type: Option<String>,
    },
    NodeTraversed {
        node_id: String,
    },
    EdgeTraversing {
        edge_id: String,
        invocation_count: u32,
        keys: Vec<String>,
    },
    EdgeTraversed {
        edge_id: String,
    },
}

#[derive(Default)]
pub struct RecordingOrderSink {
    pub events: Mutex<Vec<OrderEvent>>,
}

impl RecordingOrderSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<OrderEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }
}

impl OrderEventSink for RecordingOrderSink {
    fn order_processed(
        &self,
        order: &OrderRef,
        error: Option<&Error>,
        by_cancelation: bool,
        active: bool,
    ) {
        self.events.lock().unwrap().push(OrderEvent::Processed {
            order_id: order.order_id.clone(),
            error_type: error.map(|e| e.error_type.clone()),
            by_cancelation,
            active,
        });
    }

    fn action_state_changed(
        &self,
        _order: &OrderRef,
        action_state: &ActionState,
        _action: &Action,
        target: &ActionTarget,
        error: Option<&Error>,
    ) {
        let target_action_count = match target {
            ActionTarget::Node(node) => node.actions.len(),
            ActionTarget::Edge(edge) => edge.actions.len(),
        };
        self.events.lock().unwrap().push(OrderEvent::ActionChanged {
            action_id: action_state.action_id.clone(),
            status: action_state.action_status,
            target_action_count,
            error_type: error.map(|e| e.error_type.clone()),
        });
    }

    fn node_traversed(&self, _order: &OrderRef, node: &Node) {
        self.events.lock().unwrap().push(OrderEvent::NodeTraversed {
            node_id: node.node_id.clone(),
        });
    }

    fn edge_traversing(
        &self,
        _order: &OrderRef,
        edge: &Edge,
        changes: &[EdgeTraversalChange],
        invocation_count: u32,
    ) {
        self.events
            .lock()
            .unwrap()
            .push(OrderEvent::EdgeTraversing {
                edge_id: edge.edge_id.clone(),
                invocation_count,
                keys: changes.iter().map(|c| c.key.to_string()).collect(),
            });
    }

    fn edge_traversed(&self, _order: &OrderRef, edge: &Edge) {
        self.events.lock().unwrap().push(OrderEvent::EdgeTraversed {
            edge_id: edge.edge_id.clone(),
        });
    }
}

/// Recorded master-side instant action event.
#[derive(Clone, Debug, PartialEq)]
pub enum InstantEvent {
    StatusChanged {
        action_id: String,
        status: ActionStatus,
        error_type: Option<String>,
    },
    ActionError {
        action_id: String,
        error_type: String,
    },
}

#[derive(Default)]
pub struct RecordingInstantSink {
    pub events: Mutex<Vec<InstantEvent>>,
}

impl RecordingInstantSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<InstantEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }
}

impl InstantActionSink for RecordingInstantSink {
    fn action_state_changed(
        &self,
        _agv_id: &AgvId,
        action_state: &ActionState,
        _action: &Action,
        error: Option<&Error>,
    ) {
        self.events.lock().unwrap().push(InstantEvent::StatusChanged {
            action_id: action_state.action_id.clone(),
            status: action_state.action_status,
            error_type: error.map(|e| e.error_type.clone()),
        });
    }

    fn action_error(&self, _agv_id: &AgvId, action: &Action, error: &Error) {
        self.events.lock().unwrap().push(InstantEvent::ActionError {
            action_id: action.action_id.clone(),
            error_type: error.error_type.clone(),
        });
    }
}
