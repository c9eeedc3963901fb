use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::agv_id::{AgvId, AgvSubject};
use crate::error::ClientError;
use crate::master_client::MasterControlClient;
use crate::protocol::instant_actions::instant_action_types;
use crate::protocol::state::{error_types, reference_keys, ActionState, ActionStatus, Error, State};
use crate::protocol::validation::{order_constraint_violations, ValidationError};
use crate::protocol::{Action, Edge, Header, InstantActions, Node, Order, Payload};
use crate::topic::Topic;

/// Master controller settings.
#[derive(Clone, Debug, Default)]
pub struct MasterControllerOptions {
    /// Restricts the controller to a subset of the fleet; the default
    /// observes and addresses all AGVs.
    pub target_agvs: AgvSubject,
}

/// Identifies the order an event belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderRef {
    pub agv_id: AgvId,
    pub order_id: String,
    pub order_update_id: u32,
}

/// The node or edge an order action is attached to.
#[derive(Clone, Debug)]
pub enum ActionTarget {
    Node(Node),
    Edge(Edge),
}

/// One key of the tracked state subset reported while an edge is being
/// traversed, together with its current value.
#[derive(Clone, Debug, PartialEq)]
pub struct EdgeTraversalChange {
    pub key: &'static str,
    pub value: Value,
}

/// Events reconstructed for an assigned order. Implementations are invoked
/// from the controller's dispatch context; each terminal event fires at most
/// once per order.
pub trait OrderEventSink: Send + Sync {
    /// The order has been processed: completely traversed (`active` false),
    /// processed up to the horizon (`active` true, cache retained for
    /// stitching), canceled (`by_cancelation`), or rejected (`error`).
    fn order_processed(
        &self,
        order: &OrderRef,
        error: Option<&Error>,
        by_cancelation: bool,
        active: bool,
    );

    /// An order action changed status; on FAILED the correlated
    /// `orderActionError` from the same state message rides along.
    fn action_state_changed(
        &self,
        _order: &OrderRef,
        _action_state: &ActionState,
        _action: &Action,
        _target: &ActionTarget,
        _error: Option<&Error>,
    ) {
    }

    fn node_traversed(&self, _order: &OrderRef, _node: &Node) {}

    /// The AGV is traversing an edge. The first invocation reports the
    /// complete tracked subset; later invocations report only changed keys.
    fn edge_traversing(
        &self,
        _order: &OrderRef,
        _edge: &Edge,
        _changes: &[EdgeTraversalChange],
        _invocation_count: u32,
    ) {
    }

    fn edge_traversed(&self, _order: &OrderRef, _edge: &Edge) {}
}

/// Events reconstructed for initiated instant actions.
pub trait InstantActionSink: Send + Sync {
    /// The instant action changed status on the AGV; on FAILED the
    /// correlated error entry rides along.
    fn action_state_changed(
        &self,
        agv_id: &AgvId,
        action_state: &ActionState,
        action: &Action,
        error: Option<&Error>,
    );

    /// The instant action never produced an action state; the AGV reported
    /// an error instead (rejection or validation failure).
    fn action_error(&self, agv_id: &AgvId, action: &Action, error: &Error);
}

/// Values of the tracked state subset reported with edge traversal events.
#[derive(Clone, Debug, PartialEq)]
struct TrackedEdgeState {
    distance_since_last_node: Option<f32>,
    driving: bool,
    new_base_request: Option<bool>,
    operating_mode: Value,
    paused: Option<bool>,
    safety_state: Value,
}

impl TrackedEdgeState {
    fn capture(state: &State) -> Self {
        TrackedEdgeState {
            distance_since_last_node: state.distance_since_last_node,
            driving: state.driving,
            new_base_request: state.new_base_request,
            operating_mode: serde_json::to_value(state.operating_mode).unwrap_or(Value::Null),
            paused: state.paused,
            safety_state: serde_json::to_value(&state.safety_state).unwrap_or(Value::Null),
        }
    }

    fn changes(&self, previous: Option<&TrackedEdgeState>) -> Vec<EdgeTraversalChange> {
        let mut changes = Vec::new();
        let mut push = |key: &'static str, value: Value, changed: bool| {
            if previous.is_none() || changed {
                changes.push(EdgeTraversalChange { key, value });
            }
        };
        push(
            "distanceSinceLastNode",
            serde_json::to_value(self.distance_since_last_node).unwrap_or(Value::Null),
            previous.is_some_and(|p| p.distance_since_last_node != self.distance_since_last_node),
        );
        push(
            "driving",
            Value::Bool(self.driving),
            previous.is_some_and(|p| p.driving != self.driving),
        );
        push(
            "newBaseRequest",
            serde_json::to_value(self.new_base_request).unwrap_or(Value::Null),
            previous.is_some_and(|p| p.new_base_request != self.new_base_request),
        );
        push(
            "operatingMode",
            self.operating_mode.clone(),
            previous.is_some_and(|p| p.operating_mode != self.operating_mode),
        );
        push(
            "paused",
            serde_json::to_value(self.paused).unwrap_or(Value::Null),
            previous.is_some_and(|p| p.paused != self.paused),
        );
        push(
            "safetyState",
            self.safety_state.clone(),
            previous.is_some_and(|p| p.safety_state != self.safety_state),
        );
        changes
    }
}

#[derive(Debug, Default)]
struct EdgeTracker {
    invocation_count: u32,
    started: bool,
    last: Option<TrackedEdgeState>,
    traversed_fired: bool,
}

type OrderKey = (String, u32);

struct OrderCache {
    order: Order,
    sink: Arc<dyn OrderEventSink>,
    /// actionId -> (action, target); unioned across stitched orders under
    /// the assumption that action ids are globally unique.
    actions: HashMap<String, (Action, ActionTarget)>,
    last_action_status: HashMap<String, ActionStatus>,
    edge_trackers: HashMap<u32, EdgeTracker>,
    /// Sequence id of the newest node for which `node_traversed` fired.
    last_fired_node_seq: Option<u32>,
    /// Back-chain to the order assigned before this one; a weak lookup key,
    /// nulled once absorbed.
    previous: Option<OrderKey>,
    processed_active_fired: bool,
    canceling: bool,
}

impl OrderCache {
    fn new(order: Order, sink: Arc<dyn OrderEventSink>, previous: Option<OrderKey>) -> Self {
        let mut cache = OrderCache {
            order,
            sink,
            actions: HashMap::new(),
            last_action_status: HashMap::new(),
            edge_trackers: HashMap::new(),
            last_fired_node_seq: None,
            previous,
            processed_active_fired: false,
            canceling: false,
        };
        cache.index_actions();
        cache
    }

    fn index_actions(&mut self) {
        self.actions.clear();
        for node in &self.order.nodes {
            for action in &node.actions {
                self.actions.insert(
                    action.action_id.clone(),
                    (action.clone(), ActionTarget::Node(node.clone())),
                );
            }
        }
        for edge in &self.order.edges {
            for action in &edge.actions {
                self.actions.insert(
                    action.action_id.clone(),
                    (action.clone(), ActionTarget::Edge(edge.clone())),
                );
            }
        }
    }

    fn order_ref(&self, agv_id: &AgvId) -> OrderRef {
        OrderRef {
            agv_id: agv_id.clone(),
            order_id: self.order.order_id.clone(),
            order_update_id: self.order.order_update_id,
        }
    }
}

struct InstantCache {
    action: Action,
    sink: Arc<dyn InstantActionSink>,
    issue_ref: u64,
    last_status: Option<ActionStatus>,
}

/// Master-plane event reconstructor: maintains per-order state caches and
/// per-action instant caches, and derives lifecycle events from the AGV
/// state reports.
pub struct MasterController {
    options: MasterControllerOptions,
    caches: HashMap<(AgvId, OrderKey), OrderCache>,
    last_assigned: HashMap<AgvId, OrderKey>,
    instant: HashMap<AgvId, Vec<InstantCache>>,
    issue_counter: u64,
}

impl MasterController {
    pub fn new(options: MasterControllerOptions) -> Self {
        MasterController {
            options,
            caches: HashMap::new(),
            last_assigned: HashMap::new(),
            instant: HashMap::new(),
            issue_counter: 0,
        }
    }

    pub fn options(&self) -> &MasterControllerOptions {
        &self.options
    }

    /// Allocates the state cache for an assignment. Returns false when an
    /// identically keyed order is already cached; the assignment is then
    /// discarded without publishing.
    pub fn begin_assignment(
        &mut self,
        agv_id: &AgvId,
        order: &Order,
        sink: Arc<dyn OrderEventSink>,
    ) -> bool {
        let key = (order.order_id.clone(), order.order_update_id);
        if self.caches.contains_key(&(agv_id.clone(), key.clone())) {
            debug!(order_id = %order.order_id, "discarding re-assignment of cached order");
            return false;
        }
        let previous = self.last_assigned.get(agv_id).cloned();
        self.caches.insert(
            (agv_id.clone(), key.clone()),
            OrderCache::new(order.clone(), sink, previous),
        );
        self.last_assigned.insert(agv_id.clone(), key);
        true
    }

    /// Rolls an assignment back after a failed publish.
    pub fn abort_assignment(&mut self, agv_id: &AgvId, order: &Order) {
        let key = (order.order_id.clone(), order.order_update_id);
        let removed = self.caches.remove(&(agv_id.clone(), key.clone()));
        if self.last_assigned.get(agv_id) == Some(&key) {
            match removed.and_then(|c| c.previous) {
                Some(previous) => {
                    self.last_assigned.insert(agv_id.clone(), previous);
                }
                None => {
                    self.last_assigned.remove(agv_id);
                }
            }
        }
    }

    /// Registers instant action caches for one issuance and returns the
    /// monotonic issuance reference used to correlate validation errors.
    pub fn register_instant_actions(
        &mut self,
        agv_id: &AgvId,
        actions: &[Action],
        sink: Arc<dyn InstantActionSink>,
    ) -> u64 {
        self.issue_counter += 1;
        let issue_ref = self.issue_counter;
        let caches = self.instant.entry(agv_id.clone()).or_default();
        for action in actions {
            caches.push(InstantCache {
                action: action.clone(),
                sink: sink.clone(),
                issue_ref,
                last_status: None,
            });
        }
        issue_ref
    }

    /// Rolls an instant action issuance back after a failed publish.
    pub fn abort_instant_actions(&mut self, agv_id: &AgvId, issue_ref: u64) {
        if let Some(caches) = self.instant.get_mut(agv_id) {
            caches.retain(|c| c.issue_ref != issue_ref);
        }
    }

    /// State dispatcher: order-rejection scan, instant-action
    /// reconciliation, then order progress reconstruction. Instant actions
    /// come before order progress so that a `cancelOrder` FINISHED and the
    /// canceled order's completion arriving in one state message fire in
    /// that sequence.
    pub fn handle_state(&mut self, agv_id: &AgvId, state: &State) {
        self.scan_order_rejections(agv_id, state);
        self.reconcile_instant_actions(agv_id, state);
        self.track_order_progress(agv_id, state);
    }

    /// Step 1: errors of an order-level kind referencing the order topic
    /// terminate the matching cache. Without usable `orderId`/`orderUpdateId`
    /// references the most recently assigned order for the AGV is assumed;
    /// that fallback is ambiguous under concurrent masters and kept as
    /// documented behavior.
    fn scan_order_rejections(&mut self, agv_id: &AgvId, state: &State) {
        for error in &state.errors {
            if error.reference(reference_keys::TOPIC) != Some(Topic::Order.name()) {
                continue;
            }
            if !error_types::is_order_rejection(&error.error_type) {
                continue;
            }
            let order_id = error.reference(reference_keys::ORDER_ID);
            let order_update_id = error.reference(reference_keys::ORDER_UPDATE_ID);
            let key = match (order_id, order_update_id) {
                (Some(order_id), Some(order_update_id)) => {
                    match order_update_id.parse::<u32>() {
                        Ok(update) => Some((order_id.to_string(), update)),
                        // An unparseable reference cannot be correlated; do
                        // not guess.
                        Err(_) => None,
                    }
                }
                _ => self.last_assigned.get(agv_id).cloned(),
            };
            let Some(key) = key else {
                warn!(error_type = %error.error_type, "cannot correlate order rejection");
                continue;
            };
            let Some(cache) = self.caches.remove(&(agv_id.clone(), key.clone())) else {
                continue;
            };
            info!(order_id = %key.0, error_type = %error.error_type, "order rejected by AGV");
            if self.last_assigned.get(agv_id) == Some(&key) {
                match cache.previous.clone() {
                    Some(previous) => {
                        self.last_assigned.insert(agv_id.clone(), previous);
                    }
                    None => {
                        self.last_assigned.remove(agv_id);
                    }
                }
            }
            cache
                .sink
                .order_processed(&cache.order_ref(agv_id), Some(error), false, false);
        }
    }

    /// Step 2: reconstruct progress events for the order the state reports.
    fn track_order_progress(&mut self, agv_id: &AgvId, state: &State) {
        let key = (state.order_id.clone(), state.order_update_id);
        if !self.caches.contains_key(&(agv_id.clone(), key.clone())) {
            return;
        }
        self.absorb_previous(agv_id, &key);
        let cache = self
            .caches
            .get_mut(&(agv_id.clone(), key.clone()))
            .expect("cache checked above");
        let order_ref = cache.order_ref(agv_id);

        if !cache.canceling && cancel_running_observed(state) {
            cache.canceling = true;
        }

        // Action status deltas, with same-message error correlation on FAILED.
        for action_state in &state.action_states {
            let Some((action, target)) = cache.actions.get(&action_state.action_id) else {
                continue;
            };
            if cache.last_action_status.get(&action_state.action_id)
                == Some(&action_state.action_status)
            {
                continue;
            }
            cache
                .last_action_status
                .insert(action_state.action_id.clone(), action_state.action_status);
            let error = if action_state.action_status == ActionStatus::Failed {
                state.errors.iter().find(|e| {
                    e.error_type == error_types::ORDER_ACTION_ERROR
                        && e.reference(reference_keys::ACTION_ID)
                            == Some(action_state.action_id.as_str())
                })
            } else {
                None
            };
            cache
                .sink
                .action_state_changed(&order_ref, action_state, action, target, error);
        }

        // Traversal events relative to the last node already reported, then
        // node advances, then a recheck for the new trailing edge.
        Self::check_edge_events(cache, &order_ref, state);
        let newly_traversed = newly_traversed_nodes(cache, state);
        for node in &newly_traversed {
            cache.last_fired_node_seq = Some(node.sequence_id);
            cache.sink.node_traversed(&order_ref, node);
            Self::check_edge_events(cache, &order_ref, state);
        }

        // Completion detection.
        let all_actions_terminal = cache.actions.keys().all(|id| {
            cache
                .last_action_status
                .get(id)
                .map(|s| s.is_terminal())
                .unwrap_or(false)
        });
        let fully_done =
            state.node_states.is_empty() && state.edge_states.is_empty() && all_actions_terminal;
        let base_done = !state.node_states.iter().any(|n| n.released)
            && !state.edge_states.iter().any(|e| e.released)
            && all_actions_terminal;
        if fully_done {
            let by_cancelation = cache.canceling;
            info!(order_id = %order_ref.order_id, by_cancelation, "order fully processed");
            let cache = self
                .caches
                .remove(&(agv_id.clone(), key.clone()))
                .expect("cache present");
            if self.last_assigned.get(agv_id) == Some(&key) {
                self.last_assigned.remove(agv_id);
            }
            cache
                .sink
                .order_processed(&order_ref, None, by_cancelation, false);
        } else if base_done && !cache.processed_active_fired {
            // Base worked off, horizon remains: processed but still active,
            // cache retained so a stitching order can extend it.
            cache.processed_active_fired = true;
            cache.sink.order_processed(&order_ref, None, false, true);
        }
    }

    /// Absorbs the previously assigned cache into the current one when it is
    /// still alive: stitched base prefix, combined action map, preserved
    /// traversal progress. The back link is nulled afterwards.
    fn absorb_previous(&mut self, agv_id: &AgvId, key: &OrderKey) {
        let previous_key = match self
            .caches
            .get(&(agv_id.clone(), key.clone()))
            .and_then(|c| c.previous.clone())
        {
            Some(previous_key) => previous_key,
            None => return,
        };
        let Some(previous) = self.caches.remove(&(agv_id.clone(), previous_key)) else {
            let cache = self
                .caches
                .get_mut(&(agv_id.clone(), key.clone()))
                .expect("cache present");
            cache.previous = None;
            return;
        };
        let cache = self
            .caches
            .get_mut(&(agv_id.clone(), key.clone()))
            .expect("cache present");
        cache.previous = None;

        // The absorbed order will never fire again on its own sink; report it
        // as processed-but-active (extended by the stitching order).
        if !previous.processed_active_fired {
            previous
                .sink
                .order_processed(&previous.order_ref(agv_id), None, false, true);
        }

        let Some(merged) = merge_stitched_orders(previous.order, &cache.order) else {
            warn!(order_id = %cache.order.order_id, "previous order does not stitch; discarding it");
            return;
        };
        cache.order = merged;
        cache.index_actions();
        for (id, status) in previous.last_action_status {
            cache.last_action_status.entry(id).or_insert(status);
        }
        for (seq, tracker) in previous.edge_trackers {
            cache.edge_trackers.entry(seq).or_insert(tracker);
        }
        cache.last_fired_node_seq = match (cache.last_fired_node_seq, previous.last_fired_node_seq)
        {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        cache.canceling = cache.canceling || previous.canceling;
    }

    /// Edge events for the trailing edge of the last reported node: while the
    /// edge state persists and the AGV has started driving it, report
    /// `edge_traversing` with the delta rules; once the edge state is gone
    /// and the end node was reached, report `edge_traversed`.
    fn check_edge_events(cache: &mut OrderCache, order_ref: &OrderRef, state: &State) {
        let Some(node_seq) = cache.last_fired_node_seq else {
            return;
        };
        let edge_seq = node_seq + 1;
        let Some(edge) = cache
            .order
            .edges
            .iter()
            .find(|e| e.sequence_id == edge_seq && e.released)
        else {
            return;
        };
        let edge = edge.clone();
        let tracker = cache.edge_trackers.entry(edge_seq).or_default();
        if tracker.traversed_fired {
            return;
        }
        let present = state
            .edge_states
            .iter()
            .any(|e| e.sequence_id == edge_seq);
        if present {
            if !tracker.started && state.driving {
                tracker.started = true;
            }
            if tracker.started {
                let snapshot = TrackedEdgeState::capture(state);
                let changes = snapshot.changes(tracker.last.as_ref());
                tracker.last = Some(snapshot);
                // The first invocation reports the full tracked subset; later
                // states only produce an invocation when a key changed.
                if tracker.invocation_count == 0 || !changes.is_empty() {
                    tracker.invocation_count += 1;
                    cache
                        .sink
                        .edge_traversing(order_ref, &edge, &changes, tracker.invocation_count);
                }
            }
        } else {
            // Traversed only when the end node was actually reached; an edge
            // cleared by a cancelation reports no traversal.
            let end_reached = cache.order.nodes.iter().any(|n| {
                n.sequence_id == edge_seq + 1
                    && n.node_id == state.last_node_id
                    && n.sequence_id == state.last_node_sequence_id
            });
            if end_reached {
                tracker.traversed_fired = true;
                cache.sink.edge_traversed(order_ref, &edge);
            }
        }
    }

    /// Step 3: reconcile issued instant actions against the reported action
    /// states and errors.
    fn reconcile_instant_actions(&mut self, agv_id: &AgvId, state: &State) {
        let Some(caches) = self.instant.get_mut(agv_id) else {
            return;
        };
        // A validation error carries no actionId reference; it is attributed
        // to the oldest outstanding issuance (documented ambiguity under
        // concurrent masters).
        let validation_error = state.errors.iter().find(|e| {
            e.error_type == error_types::INSTANT_ACTION_VALIDATION_ERROR
                && e.reference(reference_keys::ACTION_ID).is_none()
        });
        let oldest_missing_issue = caches
            .iter()
            .filter(|c| {
                !state
                    .action_states
                    .iter()
                    .any(|s| s.action_id == c.action.action_id)
            })
            .map(|c| c.issue_ref)
            .min();

        let mut retained = Vec::with_capacity(caches.len());
        for mut cache in caches.drain(..) {
            let action_state = state
                .action_states
                .iter()
                .find(|s| s.action_id == cache.action.action_id);
            match action_state {
                Some(action_state) => {
                    if cache.last_status != Some(action_state.action_status) {
                        cache.last_status = Some(action_state.action_status);
                        let error = if action_state.action_status == ActionStatus::Failed {
                            state.errors.iter().find(|e| {
                                error_types::is_instant_action_kind(&e.error_type)
                                    && e.reference(reference_keys::ACTION_ID)
                                        == Some(cache.action.action_id.as_str())
                            })
                        } else {
                            None
                        };
                        cache.sink.action_state_changed(
                            agv_id,
                            action_state,
                            &cache.action,
                            error,
                        );
                    }
                    if !action_state.action_status.is_terminal() {
                        retained.push(cache);
                    }
                }
                None => {
                    let direct_error = state.errors.iter().find(|e| {
                        e.reference(reference_keys::ACTION_ID)
                            == Some(cache.action.action_id.as_str())
                    });
                    if let Some(error) = direct_error {
                        cache.sink.action_error(agv_id, &cache.action, error);
                    } else if let (Some(error), Some(oldest)) =
                        (validation_error, oldest_missing_issue)
                    {
                        if cache.issue_ref == oldest {
                            cache.sink.action_error(agv_id, &cache.action, error);
                        } else {
                            retained.push(cache);
                        }
                    } else {
                        retained.push(cache);
                    }
                }
            }
        }
        *caches = retained;
    }

    /// Starts a master controller against its client: subscribes the state
    /// topic for the configured fleet subset and dispatches every report.
    pub async fn start(
        client: MasterControlClient,
        options: MasterControllerOptions,
    ) -> Result<MasterControllerHandle, ClientError> {
        client.start().await?;
        let core = Arc::new(Mutex::new(MasterController::new(options.clone())));
        let dispatch_core = core.clone();
        client
            .subscribe_states(options.target_agvs.clone(), move |envelope| {
                if let Some(Payload::State(state)) = envelope.payload {
                    dispatch_core
                        .lock()
                        .unwrap()
                        .handle_state(&envelope.subject, &state);
                }
            })
            .await?;
        Ok(MasterControllerHandle { core, client })
    }
}

/// Running master controller: assignment API over the core reconstructor.
pub struct MasterControllerHandle {
    core: Arc<Mutex<MasterController>>,
    client: MasterControlClient,
}

impl MasterControllerHandle {
    pub fn client(&self) -> &MasterControlClient {
        &self.client
    }

    /// Assigns an order to an AGV. Returns `None` when an identically keyed
    /// order is already cached (the assignment is discarded); otherwise the
    /// order as published, headers stamped.
    pub async fn assign_order(
        &self,
        agv_id: &AgvId,
        mut order: Order,
        sink: Arc<dyn OrderEventSink>,
    ) -> Result<Option<Order>, ClientError> {
        let violations = order_constraint_violations(&order);
        if !violations.is_empty() {
            return Err(ClientError::Validation(ValidationError::new(
                &Topic::Order,
                violations.join("; "),
            )));
        }
        {
            let mut core = self.core.lock().unwrap();
            if !core.begin_assignment(agv_id, &order, sink) {
                return Ok(None);
            }
        }
        match self.client.publish_order(agv_id, &mut order).await {
            Ok(_) => Ok(Some(order)),
            Err(e) => {
                self.core.lock().unwrap().abort_assignment(agv_id, &order);
                Err(e)
            }
        }
    }

    /// Initiates instant actions on an AGV and registers their caches for
    /// event reconstruction. Returns the message as published.
    pub async fn initiate_instant_actions(
        &self,
        agv_id: &AgvId,
        actions: Vec<Action>,
        sink: Arc<dyn InstantActionSink>,
    ) -> Result<InstantActions, ClientError> {
        let issue_ref = {
            let mut core = self.core.lock().unwrap();
            core.register_instant_actions(agv_id, &actions, sink)
        };
        let mut message = InstantActions {
            header: Header::unstamped(),
            actions,
        };
        match self
            .client
            .publish_instant_actions(agv_id, &mut message)
            .await
        {
            Ok(_) => Ok(message),
            Err(e) => {
                self.core
                    .lock()
                    .unwrap()
                    .abort_instant_actions(agv_id, issue_ref);
                Err(e)
            }
        }
    }

    /// Direct access to the reconstructor, e.g. to feed states in tests.
    pub fn core(&self) -> &Arc<Mutex<MasterController>> {
        &self.core
    }

    pub async fn stop(&self) -> Result<(), ClientError> {
        self.client.stop().await
    }
}

/// Whether the state shows a `cancelOrder` instant action actually running;
/// used to classify a subsequent completion as canceled.
fn cancel_running_observed(state: &State) -> bool {
    state.action_states.iter().any(|s| {
        s.action_type.as_deref() == Some(instant_action_types::CANCEL_ORDER)
            && matches!(s.action_status, ActionStatus::Running)
    })
}

/// Nodes of the cached order newly covered by the state's last-node fields,
/// oldest first.
fn newly_traversed_nodes(cache: &OrderCache, state: &State) -> Vec<Node> {
    let matches_order_node = cache.order.nodes.iter().any(|n| {
        n.node_id == state.last_node_id && n.sequence_id == state.last_node_sequence_id
    });
    if !matches_order_node {
        return Vec::new();
    }
    cache
        .order
        .nodes
        .iter()
        .filter(|n| {
            n.released
                && n.sequence_id <= state.last_node_sequence_id
                && cache
                    .last_fired_node_seq
                    .map(|fired| n.sequence_id > fired)
                    .unwrap_or(true)
        })
        .cloned()
        .collect()
}

/// Merges a still-alive previous order with the stitched order that follows
/// it: the stitch node keeps its identity and gains the new order's
/// first-node actions, the old horizon is dropped, and the new nodes and
/// edges are appended. Returns `None` when the orders do not stitch.
fn merge_stitched_orders(mut previous: Order, next: &Order) -> Option<Order> {
    let base_end_index = previous.nodes.iter().rposition(|n| n.released)?;
    let first = next.nodes.first()?;
    {
        let base_end = &previous.nodes[base_end_index];
        if base_end.node_id != first.node_id || base_end.sequence_id != first.sequence_id {
            return None;
        }
    }
    previous.nodes.truncate(base_end_index + 1);
    previous.edges.truncate(base_end_index);
    previous.nodes[base_end_index]
        .actions
        .extend(first.actions.iter().cloned());
    previous.nodes.extend(next.nodes.iter().skip(1).cloned());
    previous.edges.extend(next.edges.iter().cloned());
    previous.order_id = next.order_id.clone();
    previous.order_update_id = next.order_update_id;
    previous.header = next.header.clone();
    previous.zone_set_id = next.zone_set_id.clone();
    Some(previous)
}
