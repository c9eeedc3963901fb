use tokio::sync::mpsc::UnboundedSender;

use crate::protocol::state::{
    ActionStatus, BatteryState, ErrorReference, Information, Load, OperatingMode, SafetyState,
};
use crate::protocol::{Action, AgvPosition, Edge, Node, Trajectory, Velocity};

/// Version of the adapter interface the controller consumes. Controller
/// start rejects adapters reporting a different version.
pub const ADAPTER_API_VERSION: u32 = 2;

/// Typed partial patch of the AGV state. `Option` fields replace the current
/// value when set; double-`Option` fields can additionally clear an optional
/// state key (`Some(None)` removes it).
#[derive(Clone, Debug, Default)]
pub struct StateUpdate {
    pub driving: Option<bool>,
    pub paused: Option<Option<bool>>,
    pub new_base_request: Option<Option<bool>>,
    pub distance_since_last_node: Option<Option<f32>>,
    pub operating_mode: Option<OperatingMode>,
    pub battery_state: Option<BatteryState>,
    pub safety_state: Option<SafetyState>,
    pub agv_position: Option<Option<AgvPosition>>,
    pub velocity: Option<Option<Velocity>>,
    pub loads: Option<Option<Vec<Load>>>,
    pub information: Option<Vec<Information>>,
}

/// Re-entry points from the adapter into the controller. Every call is a
/// channel send; the controller task processes them in arrival order, so an
/// adapter may invoke these synchronously from inside an adapter method.
#[derive(Debug)]
pub enum AdapterEvent {
    Attached { initial: StateUpdate },
    Detached { last: StateUpdate },
    StateUpdated { update: StateUpdate },
    ActionStatusChanged {
        action_id: String,
        change: ActionStatusChange,
    },
    EdgeTraversed { edge_id: String, sequence_id: u32 },
    TraverseStopped,
    DrivingToNextNode { node_id: String, sequence_id: u32 },
}

/// Channel handle handed to the adapter; all context callbacks go through it.
#[derive(Clone, Debug)]
pub struct AdapterLink {
    events: UnboundedSender<AdapterEvent>,
}

impl AdapterLink {
    pub fn new(events: UnboundedSender<AdapterEvent>) -> Self {
        AdapterLink { events }
    }

    fn send(&self, event: AdapterEvent) {
        // The controller outliving the adapter is the normal shutdown order;
        // a closed channel only happens mid-teardown.
        let _ = self.events.send(event);
    }

    /// Reports a spontaneous vehicle state change (position, battery, safety
    /// field, ...). The controller merges it and schedules a publication.
    pub fn update_state(&self, update: StateUpdate) {
        self.send(AdapterEvent::StateUpdated { update });
    }
}

/// Status transition reported for a dispatched action.
#[derive(Clone, Debug)]
pub struct ActionStatusChange {
    pub action_status: ActionStatus,
    /// Reported with FINISHED, e.g. the result of a rfid-read.
    pub result_description: Option<String>,
    /// Reported with FAILED; becomes the description of the resulting
    /// `orderActionError` / `instantActionError` entry.
    pub error_description: Option<String>,
    /// Vehicle state that changed together with the action, e.g. a load drop
    /// updating `loads`.
    pub state_update: Option<StateUpdate>,
}

impl ActionStatusChange {
    pub fn to(action_status: ActionStatus) -> Self {
        ActionStatusChange {
            action_status,
            result_description: None,
            error_description: None,
            state_update: None,
        }
    }

    pub fn finished_with(result_description: impl Into<String>) -> Self {
        ActionStatusChange {
            result_description: Some(result_description.into()),
            ..Self::to(ActionStatus::Finished)
        }
    }

    pub fn failed_with(error_description: impl Into<String>) -> Self {
        ActionStatusChange {
            error_description: Some(error_description.into()),
            ..Self::to(ActionStatus::Failed)
        }
    }
}

/// Where a dispatched action is anchored.
#[derive(Clone, Debug)]
pub enum ActionScope {
    Node { node: Node },
    Edge { edge: Edge },
    Instant,
}

/// Handed to `attach`; the adapter reports its initial vehicle state once
/// ready.
pub struct AttachContext {
    link: AdapterLink,
}

impl AttachContext {
    pub fn new(link: AdapterLink) -> Self {
        AttachContext { link }
    }

    pub fn attached(self, initial: StateUpdate) {
        self.link.send(AdapterEvent::Attached { initial });
    }
}

/// Handed to `detach`; the adapter reports the final vehicle state once
/// detached.
pub struct DetachContext {
    link: AdapterLink,
}

impl DetachContext {
    pub fn new(link: AdapterLink) -> Self {
        DetachContext { link }
    }

    pub fn detached(self, last: StateUpdate) {
        self.link.send(AdapterEvent::Detached { last });
    }
}

/// Context of a single action execution, cancelation, or edge-action finish.
#[derive(Clone, Debug)]
pub struct ActionContext {
    pub action: Action,
    pub scope: ActionScope,
    /// True when the vehicle must come to a standstill before the action
    /// starts (a SOFT action in the chunk or a HARD action pending).
    pub stop_driving: bool,
    link: AdapterLink,
}

impl ActionContext {
    pub fn new(action: Action, scope: ActionScope, stop_driving: bool, link: AdapterLink) -> Self {
        ActionContext {
            action,
            scope,
            stop_driving,
            link,
        }
    }

    /// Reports a status transition of this action back to the controller.
    pub fn update_action_status(&self, change: ActionStatusChange) {
        self.link.send(AdapterEvent::ActionStatusChanged {
            action_id: self.action.action_id.clone(),
            change,
        });
    }
}

/// Context of an edge traversal.
#[derive(Clone, Debug)]
pub struct TraverseEdgeContext {
    pub edge: Edge,
    pub start_node: Node,
    pub end_node: Node,
    /// Effective trajectory: the edge's own, or the one the adapter computed
    /// via `AgvAdapter::trajectory`.
    pub trajectory: Option<Trajectory>,
    link: AdapterLink,
}

impl TraverseEdgeContext {
    pub fn new(
        edge: Edge,
        start_node: Node,
        end_node: Node,
        trajectory: Option<Trajectory>,
        link: AdapterLink,
    ) -> Self {
        TraverseEdgeContext {
            edge,
            start_node,
            end_node,
            trajectory,
            link,
        }
    }

    /// Reports that the end node of the edge has been reached.
    pub fn edge_traversed(&self) {
        self.link.send(AdapterEvent::EdgeTraversed {
            edge_id: self.edge.edge_id.clone(),
            sequence_id: self.edge.sequence_id,
        });
    }
}

/// Context of a stop-traversal request issued while canceling an order. The
/// adapter either stops immediately and calls `stopped`, or first reports the
/// single node it must still reach via `driving_to_next_node` and calls
/// `stopped` afterwards.
pub struct StopTraverseContext {
    link: AdapterLink,
}

impl StopTraverseContext {
    pub fn new(link: AdapterLink) -> Self {
        StopTraverseContext { link }
    }

    pub fn stopped(&self) {
        self.link.send(AdapterEvent::TraverseStopped);
    }

    pub fn driving_to_next_node(&self, node: &Node) {
        self.link.send(AdapterEvent::DrivingToNextNode {
            node_id: node.node_id.clone(),
            sequence_id: node.sequence_id,
        });
    }
}

/// A contiguous stretch of an order route handed to traversability checks.
pub struct RouteSection<'a> {
    pub nodes: &'a [Node],
    pub edges: &'a [Edge],
}

/// Abstract vehicle control plane consumed by the AGV controller. The
/// controller drives navigation and action execution exclusively through
/// this trait; implementations bridge to the concrete vehicle.
pub trait AgvAdapter: Send {
    /// Interface version implemented by this adapter; must equal
    /// [`ADAPTER_API_VERSION`].
    fn api_version(&self) -> u32;

    /// Human-readable adapter name for logging.
    fn name(&self) -> &str;

    /// Called once at controller start. The adapter initializes the vehicle
    /// connection and reports the initial state via `context.attached`.
    fn attach(&mut self, context: AttachContext);

    /// Called once at controller stop.
    fn detach(&mut self, context: DetachContext);

    /// Checks whether an action can be executed in the given scope. A
    /// non-empty list of error references rejects the action.
    fn is_action_executable(&self, action: &Action, scope: &ActionScope) -> Vec<ErrorReference>;

    /// Starts executing an action; progress is reported through
    /// `context.update_action_status` until a terminal status.
    fn execute_action(&mut self, context: ActionContext);

    /// Requests cancelation of a running action. The adapter may decline to
    /// interrupt and let the action run to completion; either way it must
    /// drive the action to a terminal status.
    fn cancel_action(&mut self, context: ActionContext);

    /// Finishes an edge action that is still active when its edge has been
    /// traversed.
    fn finish_edge_action(&mut self, context: ActionContext);

    /// Checks whether the vehicle is close enough to the node to accept an
    /// order starting there.
    fn is_node_within_deviation_range(&self, node: &Node) -> Vec<ErrorReference>;

    /// Checks whether the released route section is traversable.
    fn is_route_traversable(&self, route: &RouteSection<'_>) -> Vec<ErrorReference>;

    /// Drives the vehicle along an edge; reports `context.edge_traversed`
    /// when the end node is reached. Pause handling during traversal is the
    /// adapter's responsibility.
    fn traverse_edge(&mut self, context: TraverseEdgeContext);

    /// Stops an ongoing traversal as part of order cancelation.
    fn stop_traverse(&mut self, context: StopTraverseContext);

    /// Optional trajectory computation for an edge without one.
    fn trajectory(&self, _edge: &Edge) -> Option<Trajectory> {
        None
    }
}
