use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::adapter::{
    ActionContext, ActionScope, ActionStatusChange, AdapterEvent, AdapterLink, AgvAdapter,
    AttachContext, DetachContext, RouteSection, StateUpdate, StopTraverseContext,
    TraverseEdgeContext, ADAPTER_API_VERSION,
};
use crate::agv_client::AgvClient;
use crate::agv_id::AgvId;
use crate::client::InboundEnvelope;
use crate::error::ClientError;
use crate::protocol::instant_actions::instant_action_types;
use crate::protocol::state::{
    error_types, reference_keys, ActionState, ActionStatus, BatteryState, EStop, Error,
    ErrorLevel, ErrorReference, NodeState, OperatingMode, SafetyState, State,
};
use crate::protocol::validation::order_constraint_violations;
use crate::protocol::{
    Action, BlockingType, Edge, Factsheet, Header, InstantActions, Node, Order, Payload,
    ProtocolVersion, Visualization,
};
use crate::topic::Topic;

/// AGV controller settings.
#[derive(Clone, Debug)]
pub struct AgvControllerOptions {
    /// Latest interval between two state publications; state-mutating events
    /// publish immediately in addition.
    pub publish_state_interval: Duration,
    /// Interval of visualization publications; zero disables them.
    pub publish_visualization_interval: Duration,
    /// How many state publications an instant action state (and its errors)
    /// survives after reaching a terminal status. Minimum 1.
    pub final_instant_action_state_change_publish_count: u32,
    /// Factsheet served on `factsheetRequest` (protocol version 2.0+).
    pub factsheet: Option<Factsheet>,
}

impl Default for AgvControllerOptions {
    fn default() -> Self {
        AgvControllerOptions {
            publish_state_interval: Duration::from_millis(30_000),
            publish_visualization_interval: Duration::from_millis(1_000),
            final_instant_action_state_change_publish_count: 5,
            factsheet: None,
        }
    }
}

/// Messages the controller emits; the runtime forwards them to the
/// [`AgvClient`].
#[derive(Clone, Debug)]
pub enum AgvOutbound {
    State(State),
    Visualization(Visualization),
    Factsheet(Factsheet),
}

/// Where a tracked action is anchored.
#[derive(Clone, Debug, PartialEq, Eq)]
enum ActionAnchor {
    Node { node_id: String, sequence_id: u32 },
    Edge { edge_id: String, sequence_id: u32 },
    Instant,
}

impl ActionAnchor {
    fn is_order_action(&self) -> bool {
        !matches!(self, ActionAnchor::Instant)
    }
}

#[derive(Clone, Debug)]
struct TrackedAction {
    action: Action,
    anchor: ActionAnchor,
    status: ActionStatus,
    result_description: Option<String>,
    dispatched: bool,
    /// State publications seen since the terminal status (instant actions
    /// only; drives the retention window).
    terminal_publish_count: u32,
}

impl TrackedAction {
    fn to_action_state(&self) -> ActionState {
        ActionState {
            action_id: self.action.action_id.clone(),
            action_type: Some(self.action.action_type.clone()),
            action_description: self.action.action_description.clone(),
            action_status: self.status,
            result_description: self.result_description.clone(),
        }
    }
}

/// One blocking-aware dispatch unit: either a run of NONE/SOFT actions that
/// may execute in parallel, or a single HARD action.
#[derive(Clone, Debug)]
struct Chunk {
    action_ids: Vec<String>,
    has_soft: bool,
    hard: bool,
    dispatched: bool,
}

#[derive(Clone, Debug, Default)]
struct ChunkPlan {
    chunks: VecDeque<Chunk>,
}

fn build_chunk_plan(actions: &[Action]) -> ChunkPlan {
    let mut chunks = VecDeque::new();
    let mut parallel: Vec<&Action> = Vec::new();
    for action in actions {
        match action.blocking_type {
            BlockingType::Hard => {
                if !parallel.is_empty() {
                    chunks.push_back(parallel_chunk(&parallel));
                    parallel.clear();
                }
                chunks.push_back(Chunk {
                    action_ids: vec![action.action_id.clone()],
                    has_soft: false,
                    hard: true,
                    dispatched: false,
                });
            }
            _ => parallel.push(action),
        }
    }
    if !parallel.is_empty() {
        chunks.push_back(parallel_chunk(&parallel));
    }
    ChunkPlan { chunks }
}

fn parallel_chunk(actions: &[&Action]) -> Chunk {
    Chunk {
        action_ids: actions.iter().map(|a| a.action_id.clone()).collect(),
        has_soft: actions
            .iter()
            .any(|a| a.blocking_type == BlockingType::Soft),
        hard: false,
        dispatched: false,
    }
}

/// Where the order execution currently stands. Indexes refer to the node and
/// edge lists of the current (merged) order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    NodeActions { index: usize },
    EdgeActions { index: usize },
    Traversing { index: usize },
    PausedBeforeNode { index: usize },
}

#[derive(Clone, Debug)]
struct CancelRun {
    /// actionId of the triggering `cancelOrder` instant action.
    action_id: String,
    stop_requested: bool,
}

struct RetainedError {
    error: Error,
    publish_count: u32,
}

enum Classification {
    Duplicate,
    NewOrder,
    Stitch,
    Update,
}

/// Order and action execution engine of the AGV plane. The struct is a plain
/// synchronous state machine: inbound messages, adapter callbacks and timer
/// ticks re-enter it through [`AgvController::start`]'s runtime task, and
/// everything it emits leaves through the outbound channel.
pub struct AgvController {
    agv_id: AgvId,
    version: ProtocolVersion,
    options: AgvControllerOptions,
    adapter: Box<dyn AgvAdapter>,
    link: AdapterLink,
    outbound: UnboundedSender<AgvOutbound>,

    state: State,
    current_order: Option<Order>,
    order_canceled: bool,
    phase: Phase,
    plan: Option<ChunkPlan>,
    cancel: Option<CancelRun>,

    actions: Vec<TrackedAction>,
    instant_queue: VecDeque<Action>,

    order_errors: Vec<Error>,
    action_errors: Vec<Error>,
    instant_errors: Vec<RetainedError>,

    attached: bool,
}

impl AgvController {
    /// Builds the controller core together with the adapter event channel and
    /// the outbound message channel its runtime drives it with. Fails when
    /// the adapter speaks a different interface version.
    pub fn new(
        agv_id: AgvId,
        version: ProtocolVersion,
        options: AgvControllerOptions,
        adapter: Box<dyn AgvAdapter>,
    ) -> Result<
        (
            AgvController,
            UnboundedReceiver<AdapterEvent>,
            UnboundedReceiver<AgvOutbound>,
        ),
        ClientError,
    > {
        if adapter.api_version() != ADAPTER_API_VERSION {
            return Err(ClientError::AdapterApiVersion {
                expected: ADAPTER_API_VERSION,
                actual: adapter.api_version(),
            });
        }
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let controller = AgvController {
            state: initial_state(&agv_id, version),
            agv_id,
            version,
            options,
            adapter,
            link: AdapterLink::new(event_tx),
            outbound: outbound_tx,
            current_order: None,
            order_canceled: false,
            phase: Phase::Idle,
            plan: None,
            cancel: None,
            actions: Vec::new(),
            instant_queue: VecDeque::new(),
            order_errors: Vec::new(),
            action_errors: Vec::new(),
            instant_errors: Vec::new(),
            attached: false,
        };
        Ok((controller, event_rx, outbound_rx))
    }

    pub fn agv_id(&self) -> &AgvId {
        &self.agv_id
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Immutable snapshot of the current state as it would be published.
    pub fn current_state(&mut self) -> State {
        self.compose_state();
        self.state.clone()
    }

    /// There is at most one active order; an order stays active until all its
    /// base nodes and edges are traversed and every order action ended, or it
    /// is canceled.
    pub fn has_active_order(&self) -> bool {
        if self.current_order.is_none() || self.order_canceled {
            return false;
        }
        if self.cancel.is_some() || self.phase != Phase::Idle {
            return true;
        }
        let base_pending = self.state.node_states.iter().any(|n| n.released);
        let actions_pending = self
            .actions
            .iter()
            .any(|a| a.anchor.is_order_action() && !a.status.is_terminal());
        base_pending || actions_pending
    }

    /// Hands the adapter its attach context; the adapter answers with an
    /// `Attached` event carrying the initial vehicle state.
    pub fn attach_adapter(&mut self) {
        info!(adapter = self.adapter.name(), "attaching adapter");
        let context = AttachContext::new(self.link.clone());
        self.adapter.attach(context);
    }

    pub fn detach_adapter(&mut self) {
        info!(adapter = self.adapter.name(), "detaching adapter");
        let context = DetachContext::new(self.link.clone());
        self.adapter.detach(context);
    }

    /// Entry point for messages delivered by the client subscriptions.
    pub fn handle_inbound(&mut self, envelope: InboundEnvelope) {
        match (&envelope.topic, envelope.payload) {
            (Topic::Order, Some(Payload::Order(order))) => self.process_order(order),
            (Topic::Order, _) => self.report_invalid_order(&envelope.raw),
            (Topic::InstantActions, Some(Payload::InstantActions(actions))) => {
                self.process_instant_actions(actions)
            }
            (Topic::InstantActions, _) => self.report_invalid_instant_actions(&envelope.raw),
            (topic, _) => debug!(%topic, "ignoring inbound message"),
        }
    }

    /// Entry point for adapter callbacks.
    pub fn handle_adapter_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::Attached { initial } => {
                self.attached = true;
                self.merge_state_update(initial);
                self.publish_state_now();
            }
            AdapterEvent::Detached { last } => {
                self.attached = false;
                self.merge_state_update(last);
            }
            AdapterEvent::StateUpdated { update } => {
                let position_only = is_position_only(&update);
                let resumed = self.merge_state_update(update);
                if resumed {
                    self.resume_after_pause();
                }
                if !position_only {
                    self.publish_state_now();
                }
            }
            AdapterEvent::ActionStatusChanged { action_id, change } => {
                self.handle_action_status_change(&action_id, change);
            }
            AdapterEvent::EdgeTraversed {
                edge_id,
                sequence_id,
            } => self.handle_edge_traversed(&edge_id, sequence_id),
            AdapterEvent::TraverseStopped => self.handle_traverse_stopped(),
            AdapterEvent::DrivingToNextNode {
                node_id,
                sequence_id,
            } => self.handle_driving_to_next_node(&node_id, sequence_id),
        }
    }

    // ------------------------------------------------------------------
    // Order intake
    // ------------------------------------------------------------------

    /// Order intake: structural validation, cancelation guard, adapter
    /// feasibility, vehicle condition, then classification against the
    /// current order.
    pub fn process_order(&mut self, order: Order) {
        let violations = order_constraint_violations(&order);
        if !violations.is_empty() {
            self.reject_order(
                &order,
                error_types::ORDER_VALIDATION_ERROR,
                "order is structurally invalid",
                vec![ErrorReference::new(
                    reference_keys::ERROR_DESCRIPTION_DETAIL,
                    violations.join("; "),
                )],
            );
            return;
        }

        if self.cancel.is_some() {
            self.reject_order(
                &order,
                error_types::ORDER_ERROR,
                "order rejected while an order cancelation is pending",
                Vec::new(),
            );
            return;
        }

        let released_node_count = order.nodes.iter().filter(|n| n.released).count();
        let released_edge_count = order.edges.iter().filter(|e| e.released).count();
        let route = RouteSection {
            nodes: &order.nodes[..released_node_count],
            edges: &order.edges[..released_edge_count],
        };
        let route_errors = self.adapter.is_route_traversable(&route);
        if !route_errors.is_empty() {
            self.reject_order(
                &order,
                error_types::NO_ROUTE_ERROR,
                "order route is not traversable",
                route_errors,
            );
            return;
        }
        for node in order.nodes.iter().filter(|n| n.released) {
            for action in &node.actions {
                let scope = ActionScope::Node { node: node.clone() };
                let errors = self.adapter.is_action_executable(action, &scope);
                if !errors.is_empty() {
                    let mut references =
                        vec![ErrorReference::new(reference_keys::ACTION_ID, &action.action_id)];
                    references.extend(errors);
                    self.reject_order(
                        &order,
                        error_types::ORDER_ERROR,
                        "order action is not executable",
                        references,
                    );
                    return;
                }
            }
        }
        for edge in order.edges.iter().filter(|e| e.released) {
            for action in &edge.actions {
                let scope = ActionScope::Edge { edge: edge.clone() };
                let errors = self.adapter.is_action_executable(action, &scope);
                if !errors.is_empty() {
                    let mut references =
                        vec![ErrorReference::new(reference_keys::ACTION_ID, &action.action_id)];
                    references.extend(errors);
                    self.reject_order(
                        &order,
                        error_types::ORDER_ERROR,
                        "order action is not executable",
                        references,
                    );
                    return;
                }
            }
        }

        if let Some(reason) = self.vehicle_condition_block() {
            self.reject_order(&order, error_types::ORDER_ERROR, reason, Vec::new());
            return;
        }

        match self.classify_order(&order) {
            Err((error_type, description)) => {
                self.reject_order(&order, error_type, description, Vec::new());
            }
            Ok(Classification::Duplicate) => {
                debug!(order_id = %order.order_id, "discarding duplicate order; republishing state");
                self.publish_state_now();
            }
            Ok(Classification::NewOrder) => {
                let first_node = &order.nodes[0];
                let deviation_errors = self.adapter.is_node_within_deviation_range(first_node);
                if !deviation_errors.is_empty() {
                    let mut references =
                        vec![ErrorReference::new(reference_keys::NODE_ID, &first_node.node_id)];
                    references.extend(deviation_errors);
                    self.reject_order(
                        &order,
                        error_types::NO_ROUTE_ERROR,
                        "first order node is outside the deviation range",
                        references,
                    );
                    return;
                }
                self.accept_new_order(order);
            }
            Ok(Classification::Stitch) => self.accept_stitch_order(order),
            Ok(Classification::Update) => self.accept_update_order(order),
        }
    }

    fn vehicle_condition_block(&self) -> Option<&'static str> {
        if self.state.battery_state.charging {
            return Some("order rejected while battery is charging");
        }
        if self.state.safety_state.e_stop != EStop::None {
            return Some("order rejected while e-stop is active");
        }
        if self.state.safety_state.field_violation {
            return Some("order rejected while protective field is violated");
        }
        if !matches!(
            self.state.operating_mode,
            OperatingMode::Automatic | OperatingMode::Semiautomatic
        ) {
            return Some("order rejected outside AUTOMATIC/SEMIAUTOMATIC operating mode");
        }
        None
    }

    fn classify_order(
        &self,
        order: &Order,
    ) -> Result<Classification, (&'static str, &'static str)> {
        let Some(current) = &self.current_order else {
            return Ok(Classification::NewOrder);
        };
        let first_base = &order.nodes[0];
        if order.order_id == current.order_id {
            if order.order_update_id < current.order_update_id {
                return Err((
                    error_types::ORDER_UPDATE_ERROR,
                    "orderUpdateId is lower than the current one",
                ));
            }
            if order.order_update_id == current.order_update_id {
                return Ok(Classification::Duplicate);
            }
            if self.has_active_order() {
                if !self.stitches_onto_base_end(first_base) {
                    return Err((
                        error_types::ORDER_UPDATE_ERROR,
                        "order update does not start at the end of the current base",
                    ));
                }
                Ok(Classification::Stitch)
            } else {
                if first_base.node_id != self.state.last_node_id
                    || first_base.sequence_id != self.state.last_node_sequence_id
                {
                    return Err((
                        error_types::ORDER_UPDATE_ERROR,
                        "order update does not start at the last traversed node",
                    ));
                }
                Ok(Classification::Update)
            }
        } else if self.has_active_order() {
            if !self.stitches_onto_base_end(first_base) {
                return Err((
                    error_types::ORDER_ERROR,
                    "order does not stitch onto the active order's base end",
                ));
            }
            Ok(Classification::Stitch)
        } else {
            Ok(Classification::NewOrder)
        }
    }

    fn stitches_onto_base_end(&self, first_base: &Node) -> bool {
        self.current_order
            .as_ref()
            .and_then(|o| o.base_end())
            .is_some_and(|end| {
                end.node_id == first_base.node_id && end.sequence_id == first_base.sequence_id
            })
    }

    fn reject_order(
        &mut self,
        order: &Order,
        error_type: &str,
        description: &str,
        mut references: Vec<ErrorReference>,
    ) {
        warn!(order_id = %order.order_id, error_type, description, "rejecting order");
        let mut all = vec![
            ErrorReference::new(reference_keys::TOPIC, Topic::Order.name()),
            ErrorReference::new(reference_keys::HEADER_ID, order.header.header_id.to_string()),
            ErrorReference::new(reference_keys::ORDER_ID, &order.order_id),
            ErrorReference::new(
                reference_keys::ORDER_UPDATE_ID,
                order.order_update_id.to_string(),
            ),
        ];
        all.append(&mut references);
        let error = Error::new(error_type, description, ErrorLevel::Warning, all);
        self.order_errors.push(error);
        self.publish_state_now();
    }

    /// An order message that did not survive validation still gets an error
    /// entry with whatever references the raw payload yields.
    pub fn report_invalid_order(&mut self, raw: &Value) {
        let mut references = vec![ErrorReference::new(
            reference_keys::TOPIC,
            Topic::Order.name(),
        )];
        append_raw_reference(&mut references, raw, "headerId", reference_keys::HEADER_ID);
        append_raw_reference(&mut references, raw, "orderId", reference_keys::ORDER_ID);
        append_raw_reference(
            &mut references,
            raw,
            "orderUpdateId",
            reference_keys::ORDER_UPDATE_ID,
        );
        warn!("received structurally invalid order message");
        self.order_errors.push(Error::new(
            error_types::ORDER_VALIDATION_ERROR,
            "order message failed validation",
            ErrorLevel::Warning,
            references,
        ));
        self.publish_state_now();
    }

    fn accept_new_order(&mut self, order: Order) {
        info!(order_id = %order.order_id, order_update_id = order.order_update_id, "accepting new order");
        self.order_errors.clear();
        self.action_errors.clear();
        self.actions.retain(|a| a.anchor == ActionAnchor::Instant);
        self.order_canceled = false;

        self.state.order_id = order.order_id.clone();
        self.state.order_update_id = order.order_update_id;
        self.state.zone_set_id = order.zone_set_id.clone();
        self.rebuild_route_states(&order, 0);
        self.track_order_actions(&order);
        self.current_order = Some(order);
        self.publish_state_now();
        self.enter_node(0);
    }

    /// Update of an inactive order: the first new base node is the node the
    /// vehicle already stands on. Its (new) actions run without re-traversal.
    fn accept_update_order(&mut self, order: Order) {
        info!(order_id = %order.order_id, order_update_id = order.order_update_id, "accepting order update");
        self.order_errors.clear();
        self.actions.retain(|a| a.anchor == ActionAnchor::Instant);
        self.order_canceled = false;

        self.state.order_update_id = order.order_update_id;
        self.state.zone_set_id = order.zone_set_id.clone();
        self.rebuild_route_states(&order, 1);
        self.track_order_actions(&order);
        self.current_order = Some(order);
        self.publish_state_now();
        self.begin_node_actions(0, None);
    }

    /// Stitch: extend the current order in place. The new order's first-node
    /// actions are appended to the current base end; the old horizon is
    /// replaced by the new nodes and edges.
    fn accept_stitch_order(&mut self, order: Order) {
        info!(
            order_id = %order.order_id,
            onto = %self.state.order_id,
            "stitching order onto active base"
        );
        self.order_errors.clear();

        let mut current = self.current_order.take().expect("stitch requires an order");
        let base_end_index = current
            .nodes
            .iter()
            .rposition(|n| n.released)
            .expect("active order has a base");

        // Drop the old horizon.
        let dropped_nodes: Vec<Node> = current.nodes.drain(base_end_index + 1..).collect();
        current.edges.truncate(base_end_index);
        for node in &dropped_nodes {
            self.state
                .node_states
                .retain(|s| s.sequence_id != node.sequence_id);
        }
        self.state.edge_states.retain(|s| s.released);

        let mut incoming = order;
        let appended_actions: Vec<Action> = incoming.nodes[0].actions.clone();
        current.nodes[base_end_index]
            .actions
            .extend(appended_actions.iter().cloned());
        current.nodes.extend(incoming.nodes.drain(1..));
        current.edges.append(&mut incoming.edges);
        current.order_id = incoming.order_id.clone();
        current.order_update_id = incoming.order_update_id;
        current.header = incoming.header.clone();

        self.state.order_id = current.order_id.clone();
        self.state.order_update_id = current.order_update_id;

        // Track the states and actions the stitch added.
        for node in current.nodes.iter().skip(base_end_index + 1) {
            self.state.node_states.push(node_state_of(node));
        }
        for edge in current.edges.iter().skip(base_end_index) {
            self.state.edge_states.push(edge_state_of(edge));
        }
        for node in current.nodes.iter().skip(base_end_index + 1).filter(|n| n.released) {
            for action in &node.actions {
                self.track_action(
                    action.clone(),
                    ActionAnchor::Node {
                        node_id: node.node_id.clone(),
                        sequence_id: node.sequence_id,
                    },
                );
            }
        }
        for edge in current.edges.iter().skip(base_end_index).filter(|e| e.released) {
            for action in &edge.actions {
                self.track_action(
                    action.clone(),
                    ActionAnchor::Edge {
                        edge_id: edge.edge_id.clone(),
                        sequence_id: edge.sequence_id,
                    },
                );
            }
        }
        let stitch_node = current.nodes[base_end_index].clone();
        for action in &appended_actions {
            self.track_action(
                action.clone(),
                ActionAnchor::Node {
                    node_id: stitch_node.node_id.clone(),
                    sequence_id: stitch_node.sequence_id,
                },
            );
        }

        let stitch_already_traversed = self.state.last_node_sequence_id >= stitch_node.sequence_id
            && self.state.last_node_id == stitch_node.node_id;
        self.current_order = Some(current);
        self.publish_state_now();

        if stitch_already_traversed && self.phase == Phase::Idle {
            // The vehicle already stands on the stitch node: run the appended
            // actions, then continue onto the new edges.
            self.begin_node_actions(base_end_index, Some(appended_actions));
        }
    }

    fn rebuild_route_states(&mut self, order: &Order, skip_nodes: usize) {
        self.state.node_states = order
            .nodes
            .iter()
            .skip(skip_nodes)
            .map(node_state_of)
            .collect();
        self.state.edge_states = order.edges.iter().map(edge_state_of).collect();
    }

    fn track_order_actions(&mut self, order: &Order) {
        for node in order.nodes.iter().filter(|n| n.released) {
            for action in &node.actions {
                self.track_action(
                    action.clone(),
                    ActionAnchor::Node {
                        node_id: node.node_id.clone(),
                        sequence_id: node.sequence_id,
                    },
                );
            }
        }
        for edge in order.edges.iter().filter(|e| e.released) {
            for action in &edge.actions {
                self.track_action(
                    action.clone(),
                    ActionAnchor::Edge {
                        edge_id: edge.edge_id.clone(),
                        sequence_id: edge.sequence_id,
                    },
                );
            }
        }
    }

    fn track_action(&mut self, action: Action, anchor: ActionAnchor) {
        self.actions.push(TrackedAction {
            action,
            anchor,
            status: ActionStatus::Waiting,
            result_description: None,
            dispatched: false,
            terminal_publish_count: 0,
        });
    }

    // ------------------------------------------------------------------
    // Node and edge progression
    // ------------------------------------------------------------------

    fn enter_node(&mut self, index: usize) {
        if self.state.paused == Some(true) {
            debug!(index, "pausing before node entry");
            self.phase = Phase::PausedBeforeNode { index };
            return;
        }
        let Some(order) = &self.current_order else {
            return;
        };
        let Some(node) = order.nodes.get(index) else {
            self.phase = Phase::Idle;
            return;
        };
        if !node.released {
            // End of base; the horizon waits for an order update.
            self.phase = Phase::Idle;
            return;
        }
        let node = node.clone();
        debug!(node_id = %node.node_id, sequence_id = node.sequence_id, "node traversed");
        self.state.last_node_id = node.node_id.clone();
        self.state.last_node_sequence_id = node.sequence_id;
        self.state
            .node_states
            .retain(|s| s.sequence_id != node.sequence_id);
        self.publish_state_now();
        self.begin_node_actions(index, None);
    }

    /// Starts processing node actions; `subset` restricts the plan to a
    /// slice of the node's actions (used for stitch-appended actions when
    /// the node itself was already traversed).
    fn begin_node_actions(&mut self, index: usize, subset: Option<Vec<Action>>) {
        let Some(order) = &self.current_order else {
            return;
        };
        let actions = match subset {
            Some(actions) => actions,
            None => order
                .nodes
                .get(index)
                .map(|n| n.actions.clone())
                .unwrap_or_default(),
        };
        self.phase = Phase::NodeActions { index };
        self.plan = Some(build_chunk_plan(&actions));
        self.advance_plan();
    }

    fn begin_edge_actions(&mut self, index: usize) {
        let Some(order) = &self.current_order else {
            return;
        };
        let actions = order
            .edges
            .get(index)
            .map(|e| e.actions.clone())
            .unwrap_or_default();
        self.phase = Phase::EdgeActions { index };
        self.plan = Some(build_chunk_plan(&actions));
        self.advance_plan();
    }

    /// Drives the current chunk plan: dispatches the front chunk when it has
    /// not been dispatched yet, pops it once its completion condition is met,
    /// and transitions the phase when the plan runs dry.
    fn advance_plan(&mut self) {
        if self.cancel.is_some() {
            return;
        }
        loop {
            let Some(plan) = &self.plan else {
                return;
            };
            let Some(front) = plan.chunks.front() else {
                self.plan = None;
                self.plan_finished();
                return;
            };

            if !front.dispatched {
                let next_is_hard = plan.chunks.get(1).map(|c| c.hard).unwrap_or(false);
                let stop_driving = front.hard || front.has_soft || next_is_hard;
                let action_ids = front.action_ids.clone();
                if let Some(plan) = &mut self.plan {
                    if let Some(front) = plan.chunks.front_mut() {
                        front.dispatched = true;
                    }
                }
                self.dispatch_order_chunk(&action_ids, stop_driving);
                // Adapter callbacks arrive as events; fall through to check
                // whether the chunk is already complete (e.g. empty chunk).
                continue;
            }

            let is_trailing = plan.chunks.len() == 1 && !front.hard;
            let complete = if front.hard {
                self.all_terminal(&front.action_ids, false)
            } else if is_trailing {
                // NONE actions may outlive the node/edge; only SOFT actions
                // gate progression in the trailing group.
                self.all_terminal(&front.action_ids, true)
            } else {
                self.all_terminal(&front.action_ids, false)
            };
            if complete {
                if let Some(plan) = &mut self.plan {
                    plan.chunks.pop_front();
                }
                continue;
            }
            return;
        }
    }

    /// Whether every referenced action has ended; with `soft_only`, NONE
    /// actions are ignored.
    fn all_terminal(&self, action_ids: &[String], soft_only: bool) -> bool {
        action_ids.iter().all(|id| {
            self.actions
                .iter()
                .find(|a| a.action.action_id == *id)
                .map(|a| {
                    if soft_only && a.action.blocking_type == BlockingType::None {
                        true
                    } else {
                        a.status.is_terminal()
                    }
                })
                .unwrap_or(true)
        })
    }

    fn dispatch_order_chunk(&mut self, action_ids: &[String], stop_driving: bool) {
        for action_id in action_ids {
            let Some(tracked) = self
                .actions
                .iter_mut()
                .find(|a| a.action.action_id == *action_id)
            else {
                continue;
            };
            tracked.dispatched = true;
            let action = tracked.action.clone();
            let anchor = tracked.anchor.clone();
            let scope = self.scope_of(&anchor);
            debug!(action_id = %action.action_id, action_type = %action.action_type, "dispatching order action");
            let context = ActionContext::new(action, scope, stop_driving, self.link.clone());
            self.adapter.execute_action(context);
        }
    }

    fn scope_of(&self, anchor: &ActionAnchor) -> ActionScope {
        let order = self.current_order.as_ref();
        match anchor {
            ActionAnchor::Node { sequence_id, .. } => order
                .and_then(|o| o.nodes.iter().find(|n| n.sequence_id == *sequence_id))
                .map(|n| ActionScope::Node { node: n.clone() })
                .unwrap_or(ActionScope::Instant),
            ActionAnchor::Edge { sequence_id, .. } => order
                .and_then(|o| o.edges.iter().find(|e| e.sequence_id == *sequence_id))
                .map(|e| ActionScope::Edge { edge: e.clone() })
                .unwrap_or(ActionScope::Instant),
            ActionAnchor::Instant => ActionScope::Instant,
        }
    }

    /// Called when the current chunk plan has been worked off.
    fn plan_finished(&mut self) {
        match self.phase {
            Phase::NodeActions { index } => {
                let has_released_edge = self
                    .current_order
                    .as_ref()
                    .and_then(|o| o.edges.get(index))
                    .map(|e| e.released)
                    .unwrap_or(false);
                if has_released_edge {
                    self.begin_edge_actions(index);
                } else {
                    self.phase = Phase::Idle;
                    self.check_order_completion();
                }
            }
            Phase::EdgeActions { index } => self.traverse_edge(index),
            _ => {}
        }
    }

    fn traverse_edge(&mut self, index: usize) {
        let Some(order) = &self.current_order else {
            return;
        };
        let (Some(edge), Some(start_node), Some(end_node)) = (
            order.edges.get(index),
            order.nodes.get(index),
            order.nodes.get(index + 1),
        ) else {
            self.phase = Phase::Idle;
            return;
        };
        let edge = edge.clone();
        let start_node = start_node.clone();
        let end_node = end_node.clone();
        debug!(edge_id = %edge.edge_id, "traversing edge");
        self.phase = Phase::Traversing { index };
        self.state.driving = true;
        self.publish_state_now();
        let trajectory = edge
            .trajectory
            .clone()
            .or_else(|| self.adapter.trajectory(&edge));
        let context = TraverseEdgeContext::new(
            edge,
            start_node,
            end_node,
            trajectory,
            self.link.clone(),
        );
        self.adapter.traverse_edge(context);
    }

    fn handle_edge_traversed(&mut self, edge_id: &str, sequence_id: u32) {
        if self.cancel.is_some() {
            // stop_traverse is in flight; the stopped/drivingToNextNode
            // callbacks own the remaining bookkeeping.
            debug!(edge_id, "ignoring edge traversal during cancelation");
            return;
        }
        let Phase::Traversing { index } = self.phase else {
            debug!(edge_id, "ignoring edge traversal outside a traversal phase");
            return;
        };
        debug!(edge_id, sequence_id, "edge traversed");
        self.state
            .edge_states
            .retain(|s| s.sequence_id != sequence_id);
        self.state.driving = false;

        // Edge actions that outlived the traversal are finished now.
        let leftovers: Vec<(Action, ActionAnchor)> = self
            .actions
            .iter()
            .filter(|a| {
                a.dispatched
                    && !a.status.is_terminal()
                    && matches!(&a.anchor, ActionAnchor::Edge { sequence_id: s, .. } if *s == sequence_id)
            })
            .map(|a| (a.action.clone(), a.anchor.clone()))
            .collect();
        for (action, anchor) in leftovers {
            let scope = self.scope_of(&anchor);
            let context = ActionContext::new(action, scope, false, self.link.clone());
            self.adapter.finish_edge_action(context);
        }

        self.enter_node(index + 1);
    }

    // ------------------------------------------------------------------
    // Instant actions
    // ------------------------------------------------------------------

    pub fn process_instant_actions(&mut self, message: InstantActions) {
        for action in message.actions {
            match self.instant_action_block(&action) {
                Some((error_type, description, references)) => {
                    let mut all = vec![
                        ErrorReference::new(reference_keys::TOPIC, Topic::InstantActions.name()),
                        ErrorReference::new(
                            reference_keys::HEADER_ID,
                            message.header.header_id.to_string(),
                        ),
                        ErrorReference::new(reference_keys::ACTION_ID, &action.action_id),
                        ErrorReference::new(reference_keys::ACTION_TYPE, &action.action_type),
                    ];
                    all.extend(references);
                    warn!(action_id = %action.action_id, error_type, "rejecting instant action");
                    self.instant_errors.push(RetainedError {
                        error: Error::new(error_type, description, ErrorLevel::Warning, all),
                        publish_count: 0,
                    });
                }
                None => {
                    self.track_action(action.clone(), ActionAnchor::Instant);
                    self.instant_queue.push_back(action);
                }
            }
        }
        self.drain_instant_queue();
        self.publish_state_now();
    }

    /// Executability check of a single instant action; `None` means
    /// executable.
    fn instant_action_block(
        &mut self,
        action: &Action,
    ) -> Option<(&'static str, &'static str, Vec<ErrorReference>)> {
        if self
            .actions
            .iter()
            .any(|a| a.action.action_id == action.action_id)
        {
            return Some((
                error_types::INSTANT_ACTION_ERROR,
                "actionId is already in use",
                Vec::new(),
            ));
        }
        match action.action_type.as_str() {
            instant_action_types::CANCEL_ORDER => {
                if self.cancel.is_some() {
                    Some((
                        error_types::INSTANT_ACTION_ERROR,
                        "an order cancelation is already pending",
                        Vec::new(),
                    ))
                } else if !self.has_active_order() {
                    Some((
                        error_types::INSTANT_ACTION_NO_ORDER_TO_CANCEL,
                        "there is no active order to cancel",
                        Vec::new(),
                    ))
                } else {
                    None
                }
            }
            instant_action_types::STATE_REQUEST | instant_action_types::FACTSHEET_REQUEST => None,
            _ => {
                let errors = self
                    .adapter
                    .is_action_executable(action, &ActionScope::Instant);
                if errors.is_empty() {
                    None
                } else {
                    Some((
                        error_types::INSTANT_ACTION_ERROR,
                        "instant action is not executable",
                        errors,
                    ))
                }
            }
        }
    }

    /// Dispatches queued instant actions in blocking-aware batches across the
    /// live queue: NONE/SOFT runs dispatch together, a HARD action waits for
    /// every outstanding instant action and then runs alone.
    fn drain_instant_queue(&mut self) {
        loop {
            if self.instant_hard_active() {
                return;
            }
            let Some(front) = self.instant_queue.front() else {
                return;
            };
            if front.blocking_type == BlockingType::Hard {
                if self.instant_active_count() > 0 {
                    return;
                }
                let action = self.instant_queue.pop_front().expect("front exists");
                self.dispatch_instant_action(action, true);
            } else {
                let mut batch = Vec::new();
                while let Some(front) = self.instant_queue.front() {
                    if front.blocking_type == BlockingType::Hard {
                        break;
                    }
                    batch.push(self.instant_queue.pop_front().expect("front exists"));
                }
                let next_is_hard = self
                    .instant_queue
                    .front()
                    .map(|a| a.blocking_type == BlockingType::Hard)
                    .unwrap_or(false);
                let stop_driving = next_is_hard
                    || batch.iter().any(|a| a.blocking_type == BlockingType::Soft);
                for action in batch {
                    self.dispatch_instant_action(action, stop_driving);
                }
            }
        }
    }

    fn instant_active_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| a.anchor == ActionAnchor::Instant && a.dispatched && !a.status.is_terminal())
            .count()
    }

    fn instant_hard_active(&self) -> bool {
        self.actions.iter().any(|a| {
            a.anchor == ActionAnchor::Instant
                && a.dispatched
                && !a.status.is_terminal()
                && a.action.blocking_type == BlockingType::Hard
        })
    }

    fn dispatch_instant_action(&mut self, action: Action, stop_driving: bool) {
        if let Some(tracked) = self
            .actions
            .iter_mut()
            .find(|a| a.action.action_id == action.action_id)
        {
            tracked.dispatched = true;
        }
        debug!(action_id = %action.action_id, action_type = %action.action_type, "dispatching instant action");
        match action.action_type.as_str() {
            instant_action_types::STATE_REQUEST => {
                self.set_action_status(&action.action_id, ActionStatus::Finished, None, None);
                self.publish_state_now();
            }
            instant_action_types::FACTSHEET_REQUEST => {
                if !self.version.supports_factsheet() {
                    self.set_action_status(
                        &action.action_id,
                        ActionStatus::Failed,
                        None,
                        Some("factsheet is not available in this protocol version".to_string()),
                    );
                } else if let Some(factsheet) = self.options.factsheet.clone() {
                    let _ = self.outbound.send(AgvOutbound::Factsheet(factsheet));
                    self.set_action_status(&action.action_id, ActionStatus::Finished, None, None);
                } else {
                    self.set_action_status(
                        &action.action_id,
                        ActionStatus::Failed,
                        None,
                        Some("no factsheet has been configured".to_string()),
                    );
                }
                self.publish_state_now();
            }
            instant_action_types::CANCEL_ORDER => self.begin_cancel(action),
            _ => {
                // startPause/stopPause and custom actions are the adapter's
                // business; pause bookkeeping happens on their FINISHED.
                let context = ActionContext::new(
                    action,
                    ActionScope::Instant,
                    stop_driving,
                    self.link.clone(),
                );
                self.adapter.execute_action(context);
            }
        }
    }

    /// A message whose instant actions did not survive validation.
    pub fn report_invalid_instant_actions(&mut self, raw: &Value) {
        let mut references = vec![ErrorReference::new(
            reference_keys::TOPIC,
            Topic::InstantActions.name(),
        )];
        append_raw_reference(&mut references, raw, "headerId", reference_keys::HEADER_ID);
        warn!("received structurally invalid instantActions message");
        self.instant_errors.push(RetainedError {
            error: Error::new(
                error_types::INSTANT_ACTION_VALIDATION_ERROR,
                "instantActions message failed validation",
                ErrorLevel::Warning,
                references,
            ),
            publish_count: 0,
        });
        self.publish_state_now();
    }

    // ------------------------------------------------------------------
    // Cancelation
    // ------------------------------------------------------------------

    fn begin_cancel(&mut self, action: Action) {
        info!(order_id = %self.state.order_id, "canceling active order");
        self.cancel = Some(CancelRun {
            action_id: action.action_id.clone(),
            stop_requested: false,
        });
        self.plan = None;

        // Waiting order actions fail immediately, without an adapter call.
        for tracked in self
            .actions
            .iter_mut()
            .filter(|a| a.anchor.is_order_action() && a.status == ActionStatus::Waiting)
        {
            tracked.status = ActionStatus::Failed;
            tracked.result_description = None;
        }
        self.set_action_status(&action.action_id, ActionStatus::Running, None, None);
        self.publish_state_now();

        // Interrupt whatever is still running; the adapter may decline and
        // let an action run to completion.
        let active: Vec<(Action, ActionAnchor)> = self
            .actions
            .iter()
            .filter(|a| a.anchor.is_order_action() && a.dispatched && !a.status.is_terminal())
            .map(|a| (a.action.clone(), a.anchor.clone()))
            .collect();
        for (action, anchor) in active {
            let scope = self.scope_of(&anchor);
            let context = ActionContext::new(action, scope, false, self.link.clone());
            self.adapter.cancel_action(context);
        }
        self.check_cancel_progress();
    }

    fn check_cancel_progress(&mut self) {
        let Some(cancel) = &self.cancel else {
            return;
        };
        if cancel.stop_requested {
            return;
        }
        let actions_pending = self
            .actions
            .iter()
            .any(|a| a.anchor.is_order_action() && !a.status.is_terminal());
        if actions_pending {
            return;
        }
        if let Some(cancel) = &mut self.cancel {
            cancel.stop_requested = true;
        }
        let context = StopTraverseContext::new(self.link.clone());
        self.adapter.stop_traverse(context);
    }

    fn handle_driving_to_next_node(&mut self, node_id: &str, sequence_id: u32) {
        if self.cancel.is_none() {
            return;
        }
        debug!(node_id, sequence_id, "stopping at next node during cancelation");
        self.state
            .node_states
            .retain(|s| s.sequence_id == sequence_id);
        self.publish_state_now();
    }

    fn handle_traverse_stopped(&mut self) {
        let Some(cancel) = self.cancel.take() else {
            return;
        };
        info!(order_id = %self.state.order_id, "order cancelation completed");
        self.state.node_states.clear();
        self.state.edge_states.clear();
        self.state.driving = false;
        self.phase = Phase::Idle;
        self.order_canceled = true;
        // lastNodeId, orderId/orderUpdateId and instant action states are
        // preserved so a follow-up order can stitch.
        self.set_action_status(&cancel.action_id, ActionStatus::Finished, None, None);
        self.publish_state_now();
    }

    // ------------------------------------------------------------------
    // Action status changes
    // ------------------------------------------------------------------

    fn handle_action_status_change(&mut self, action_id: &str, change: ActionStatusChange) {
        let Some(tracked) = self
            .actions
            .iter()
            .find(|a| a.action.action_id == action_id)
        else {
            debug!(action_id, "status change for unknown action");
            return;
        };
        let action_type = tracked.action.action_type.clone();
        let anchor = tracked.anchor.clone();

        self.set_action_status(
            action_id,
            change.action_status,
            change.result_description.clone(),
            change.error_description.clone(),
        );
        if let Some(update) = change.state_update {
            self.merge_state_update(update);
        }

        if change.action_status == ActionStatus::Finished {
            match action_type.as_str() {
                instant_action_types::START_PAUSE => {
                    self.state.paused = Some(true);
                }
                instant_action_types::STOP_PAUSE => {
                    self.state.paused = Some(false);
                    self.resume_after_pause();
                }
                _ => {}
            }
        }

        if self.cancel.is_some() {
            self.publish_state_now();
            self.check_cancel_progress();
            return;
        }
        self.publish_state_now();
        if anchor.is_order_action() {
            self.advance_plan();
            self.check_order_completion();
        } else {
            self.drain_instant_queue();
        }
    }

    /// Updates a tracked action's status; a FAILED order action additionally
    /// produces an `orderActionError`, a FAILED instant action an
    /// `instantActionError`, both carrying the adapter's error description.
    fn set_action_status(
        &mut self,
        action_id: &str,
        status: ActionStatus,
        result_description: Option<String>,
        error_description: Option<String>,
    ) {
        let Some(tracked) = self
            .actions
            .iter_mut()
            .find(|a| a.action.action_id == action_id)
        else {
            return;
        };
        if tracked.status == status {
            return;
        }
        tracked.status = status;
        if result_description.is_some() {
            tracked.result_description = result_description;
        }
        if status != ActionStatus::Failed {
            return;
        }
        let references = vec![
            ErrorReference::new(reference_keys::ACTION_ID, &tracked.action.action_id),
            ErrorReference::new(reference_keys::ACTION_TYPE, &tracked.action.action_type),
        ];
        let description = error_description.unwrap_or_else(|| "action failed".to_string());
        if tracked.anchor.is_order_action() {
            self.action_errors.push(Error::new(
                error_types::ORDER_ACTION_ERROR,
                &description,
                ErrorLevel::Warning,
                references,
            ));
        } else {
            self.instant_errors.push(RetainedError {
                error: Error::new(
                    error_types::INSTANT_ACTION_ERROR,
                    &description,
                    ErrorLevel::Warning,
                    references,
                ),
                publish_count: 0,
            });
        }
    }

    fn resume_after_pause(&mut self) {
        if self.cancel.is_some() {
            return;
        }
        if let Phase::PausedBeforeNode { index } = self.phase {
            debug!(index, "resuming node entry after pause");
            self.phase = Phase::Idle;
            self.enter_node(index);
        }
    }

    fn check_order_completion(&mut self) {
        if self.phase != Phase::Idle || self.cancel.is_some() {
            return;
        }
        if self.current_order.is_none() {
            return;
        }
        if !self.has_active_order() {
            debug!(order_id = %self.state.order_id, "order fully processed");
        }
    }

    // ------------------------------------------------------------------
    // State publication
    // ------------------------------------------------------------------

    /// Shallow merge of a partial state patch; a cleared key disappears from
    /// the published state. Returns true when the patch resumed from pause.
    fn merge_state_update(&mut self, update: StateUpdate) -> bool {
        let mut resumed = false;
        if let Some(driving) = update.driving {
            self.state.driving = driving;
        }
        if let Some(paused) = update.paused {
            if self.state.paused == Some(true) && paused != Some(true) {
                resumed = true;
            }
            self.state.paused = paused;
        }
        if let Some(new_base_request) = update.new_base_request {
            self.state.new_base_request = new_base_request;
        }
        if let Some(distance) = update.distance_since_last_node {
            self.state.distance_since_last_node = distance;
        }
        if let Some(operating_mode) = update.operating_mode {
            self.state.operating_mode = operating_mode;
        }
        if let Some(battery_state) = update.battery_state {
            self.state.battery_state = battery_state;
        }
        if let Some(safety_state) = update.safety_state {
            self.state.safety_state = safety_state;
        }
        if let Some(agv_position) = update.agv_position {
            self.state.agv_position = agv_position;
        }
        if let Some(velocity) = update.velocity {
            self.state.velocity = velocity;
        }
        if let Some(loads) = update.loads {
            self.state.loads = loads;
        }
        if let Some(information) = update.information {
            self.state.information = information;
        }
        resumed
    }

    fn compose_state(&mut self) {
        self.state.action_states = self.actions.iter().map(TrackedAction::to_action_state).collect();
        let mut errors = self.order_errors.clone();
        errors.extend(self.action_errors.iter().cloned());
        errors.extend(self.instant_errors.iter().map(|e| e.error.clone()));
        self.state.errors = errors;
    }

    /// Publishes the current state and advances the post-terminal retention
    /// window of instant action states and errors.
    pub fn publish_state_now(&mut self) {
        self.compose_state();
        let _ = self.outbound.send(AgvOutbound::State(self.state.clone()));
        self.expire_instant_traces();
    }

    fn expire_instant_traces(&mut self) {
        let retention = self
            .options
            .final_instant_action_state_change_publish_count
            .max(1);
        for tracked in self
            .actions
            .iter_mut()
            .filter(|a| a.anchor == ActionAnchor::Instant && a.status.is_terminal())
        {
            tracked.terminal_publish_count += 1;
        }
        self.actions.retain(|a| {
            a.anchor != ActionAnchor::Instant || a.terminal_publish_count < retention
        });
        for retained in &mut self.instant_errors {
            retained.publish_count += 1;
        }
        self.instant_errors.retain(|e| e.publish_count < retention);
    }

    /// Emits a visualization message carrying position and velocity only.
    pub fn publish_visualization(&mut self) {
        let visualization = Visualization {
            header: Header::unstamped(),
            agv_position: self.state.agv_position.clone(),
            velocity: self.state.velocity.clone(),
        };
        let _ = self
            .outbound
            .send(AgvOutbound::Visualization(visualization));
    }

    /// Runs the controller against a started client: subscribes the inbound
    /// topics, attaches the adapter, and spawns the runtime tasks that feed
    /// the state machine and forward its outbound messages.
    pub async fn start(
        client: AgvClient,
        adapter: Box<dyn AgvAdapter>,
        options: AgvControllerOptions,
    ) -> Result<AgvControllerHandle, ClientError> {
        let version = client.inner().version();
        let (core, mut adapter_rx, mut outbound_rx) =
            AgvController::new(client.agv_id().clone(), version, options.clone(), adapter)?;
        let core = Arc::new(Mutex::new(core));

        client.start().await?;
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<InboundEnvelope>();
        let order_tx = inbound_tx.clone();
        client
            .subscribe_orders(move |envelope| {
                let _ = order_tx.send(envelope);
            })
            .await?;
        let instant_tx = inbound_tx;
        client
            .subscribe_instant_actions(move |envelope| {
                let _ = instant_tx.send(envelope);
            })
            .await?;
        core.lock().unwrap().attach_adapter();

        let loop_core = core.clone();
        let state_interval = options.publish_state_interval;
        let visualization_interval = options.publish_visualization_interval;
        let driver = tokio::spawn(async move {
            let mut state_timer = tokio::time::interval(state_interval);
            state_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            state_timer.tick().await;
            let visualization_enabled = !visualization_interval.is_zero();
            let mut visualization_timer = tokio::time::interval(if visualization_enabled {
                visualization_interval
            } else {
                Duration::from_secs(3600)
            });
            visualization_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            visualization_timer.tick().await;
            loop {
                tokio::select! {
                    event = adapter_rx.recv() => match event {
                        Some(event) => loop_core.lock().unwrap().handle_adapter_event(event),
                        None => break,
                    },
                    envelope = inbound_rx.recv() => match envelope {
                        Some(envelope) => loop_core.lock().unwrap().handle_inbound(envelope),
                        None => break,
                    },
                    _ = state_timer.tick() => loop_core.lock().unwrap().publish_state_now(),
                    _ = visualization_timer.tick(), if visualization_enabled => {
                        loop_core.lock().unwrap().publish_visualization()
                    }
                }
            }
        });

        let publish_client = client.clone();
        let publisher = tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                let result = match outbound {
                    AgvOutbound::State(mut state) => {
                        publish_client.publish_state(&mut state).await
                    }
                    AgvOutbound::Visualization(mut visualization) => {
                        publish_client.publish_visualization(&mut visualization).await
                    }
                    AgvOutbound::Factsheet(mut factsheet) => {
                        publish_client.publish_factsheet(&mut factsheet).await
                    }
                };
                if let Err(e) = result {
                    warn!(error = %e, "failed to publish controller message");
                }
            }
        });

        Ok(AgvControllerHandle {
            core,
            client,
            tasks: vec![driver, publisher],
        })
    }
}

/// Running AGV controller: a handle to the core plus its runtime tasks.
pub struct AgvControllerHandle {
    core: Arc<Mutex<AgvController>>,
    client: AgvClient,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl AgvControllerHandle {
    pub fn client(&self) -> &AgvClient {
        &self.client
    }

    /// Deep copy of the state as it would be published right now.
    pub fn current_state(&self) -> State {
        self.core.lock().unwrap().current_state()
    }

    /// Detaches the adapter, announces OFFLINE, and tears the transport down.
    pub async fn stop(&self) -> Result<(), ClientError> {
        self.core.lock().unwrap().detach_adapter();
        tokio::task::yield_now().await;
        self.client.stop().await?;
        for task in &self.tasks {
            task.abort();
        }
        Ok(())
    }
}

fn initial_state(agv_id: &AgvId, version: ProtocolVersion) -> State {
    State {
        header: Header {
            header_id: 0,
            timestamp: chrono::Utc::now(),
            version: version.as_str().to_string(),
            manufacturer: agv_id.manufacturer.clone(),
            serial_number: agv_id.serial_number.clone(),
        },
        order_id: String::new(),
        order_update_id: 0,
        zone_set_id: None,
        last_node_id: String::new(),
        last_node_sequence_id: 0,
        driving: false,
        paused: None,
        new_base_request: None,
        distance_since_last_node: None,
        operating_mode: OperatingMode::Automatic,
        node_states: Vec::new(),
        edge_states: Vec::new(),
        agv_position: None,
        velocity: None,
        loads: None,
        action_states: Vec::new(),
        battery_state: BatteryState {
            battery_charge: 100.0,
            battery_voltage: None,
            battery_health: None,
            charging: false,
            reach: None,
        },
        errors: Vec::new(),
        information: Vec::new(),
        safety_state: SafetyState {
            e_stop: EStop::None,
            field_violation: false,
        },
    }
}

fn node_state_of(node: &Node) -> NodeState {
    NodeState {
        node_id: node.node_id.clone(),
        sequence_id: node.sequence_id,
        node_description: node.node_description.clone(),
        node_position: node.node_position.clone(),
        released: node.released,
    }
}

fn edge_state_of(edge: &Edge) -> crate::protocol::state::EdgeState {
    crate::protocol::state::EdgeState {
        edge_id: edge.edge_id.clone(),
        sequence_id: edge.sequence_id,
        edge_description: edge.edge_description.clone(),
        released: edge.released,
        trajectory: edge.trajectory.clone(),
    }
}

fn is_position_only(update: &StateUpdate) -> bool {
    update.driving.is_none()
        && update.paused.is_none()
        && update.new_base_request.is_none()
        && update.operating_mode.is_none()
        && update.battery_state.is_none()
        && update.safety_state.is_none()
        && update.loads.is_none()
        && update.information.is_none()
        && (update.agv_position.is_some()
            || update.velocity.is_some()
            || update.distance_since_last_node.is_some())
}

fn append_raw_reference(
    references: &mut Vec<ErrorReference>,
    raw: &Value,
    field: &str,
    key: &str,
) {
    if let Some(value) = raw.get(field) {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        references.push(ErrorReference::new(key, rendered));
    }
}
