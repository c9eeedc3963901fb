use serde::{Deserialize, Serialize};

use crate::protocol::common::{
    AgvPosition, BoundingBoxReference, Header, LoadDimensions, NodePosition, Trajectory, Velocity,
};

/// All encompassing state of the AGV.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct State {
    #[serde(flatten)]
    pub header: Header,
    /// Unique order identification of the current order or the previous finished order. The order_id is kept until a new order is received. Empty string ("") if no previous order_id is available.
    pub order_id: String,
    /// Order Update Identification to identify that an order update has been accepted by the AGV. 0 if no previous order_update_id is available.
    pub order_update_id: u32,
    /// Unique ID of the zone set that the AGV currently uses for path planning. Must be the same as the one used in the order, otherwise the AGV is to reject the order.
    pub zone_set_id: Option<String>,
    /// nodeId of last reached node or, if AGV is currently on a node, current node. Empty string ("") if no last_node_id is available.
    pub last_node_id: String,
    /// sequence_id of the last reached node or, if the AGV is currently on a node, sequence_id of current node. 0 if no last_node_sequence_id is available.
    pub last_node_sequence_id: u32,
    /// True: indicates that the AGV is driving and/or rotating. False: indicates that the AGV is neither driving nor rotating.
    pub driving: bool,
    /// True: AGV is currently in a paused state. The AGV can resume the order. False: The AGV is currently not in a paused state.
    pub paused: Option<bool>,
    /// True: AGV is almost at the end of the base and will reduce speed if no new base is transmitted. Trigger for MC to send a new base.
    pub new_base_request: Option<bool>,
    /// Used by line guided vehicles to indicate the distance it has been driving past the last_node_id. Distance is in meters.
    pub distance_since_last_node: Option<f32>,
    /// Current operating mode of the AGV.
    pub operating_mode: OperatingMode,
    /// Information about the nodes the AGV still has to drive over. Empty list if idle.
    pub node_states: Vec<NodeState>,
    /// Information about the edges the AGV still has to drive over. Empty list if the AGV is idle.
    pub edge_states: Vec<EdgeState>,
    /// Current position of the AGV on the map. Can only be omitted for AGVs without the capability to localize themselves.
    pub agv_position: Option<AgvPosition>,
    /// The AGVs velocity in vehicle coordinates.
    pub velocity: Option<Velocity>,
    /// Array for information about the loads that an AGV currently carries. Optional: if an AGV cannot reason about its load state, it shall not send this field.
    pub loads: Option<Vec<Load>>,
    /// Contains a list of the current actions and the actions which are yet to be finished. The action_states are kept until a new order is received.
    pub action_states: Vec<ActionState>,
    /// Contains all battery-related information.
    pub battery_state: BatteryState,
    /// Array of error objects. All active errors of the AGV should be in the list. An empty array indicates that the AGV has no active errors.
    pub errors: Vec<Error>,
    /// Array of information objects. Objects are only for visualization/debugging; they must not be used for logic in master control.
    pub information: Vec<Information>,
    /// Object that holds information about the safety status.
    pub safety_state: SafetyState,
}

#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    /// Unique node identification.
    pub node_id: String,
    /// Sequence id of the node.
    pub sequence_id: u32,
    /// Verbose node description.
    pub node_description: Option<String>,
    /// Node position.
    pub node_position: Option<NodePosition>,
    /// True: indicates that the node is part of the base. False: indicates that the node is part of the horizon.
    pub released: bool,
}

#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeState {
    /// Unique edge identification.
    pub edge_id: String,
    /// sequence_id of the edge.
    pub sequence_id: u32,
    /// Verbose edge description.
    pub edge_description: Option<String>,
    /// True: Edge is part of base. False: Edge is part of horizon.
    pub released: bool,
    /// Trajectory segment from the point where the AGV starts to enter the edge until the point where it reports that the next node was traversed.
    pub trajectory: Option<Trajectory>,
}

#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionState {
    /// Unique action_id, e.g. blink_123jdaimoim234
    pub action_id: String,
    /// action_type of the action. Optional: Only for informational or visualization purposes.
    pub action_type: Option<String>,
    /// Additional information on the action.
    pub action_description: Option<String>,
    /// Action status.
    pub action_status: ActionStatus,
    /// Description of the result, e.g. the result of a rfid-read.
    pub result_description: Option<String>,
}

/// Status of an Action.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    /// Action was received by AGV but the node where it triggers was not yet reached or the edge where it is active was not yet entered.
    Waiting,
    /// Action was triggered, preparatory measures are initiated.
    Initializing,
    /// The action is running.
    Running,
    /// The action is paused because of a pause instantAction or external trigger (pause button on AGV).
    Paused,
    /// The action is finished. A result is reported via the result_description.
    Finished,
    /// Action could not be finished for whatever reason.
    Failed,
}

impl ActionStatus {
    /// FINISHED and FAILED are the two terminal statuses.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Finished | ActionStatus::Failed)
    }
}

/// Load object that describes the load if the AGV has information about it.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Load {
    /// Unique identification number of the load (e.g. barcode or RFID). Empty field if the AGV can identify the load but didn't identify the load yet.
    pub load_id: Option<String>,
    /// Type of load.
    pub load_type: Option<String>,
    /// Indicates which load handling/carrying unit of the AGV is used, e.g. in case the AGV has multiple spots/positions to carry loads.
    pub load_position: Option<String>,
    /// This point describes the loads position on the AGV in the vehicle coordinates.
    pub bounding_box_reference: Option<BoundingBoxReference>,
    /// Dimensions of the load's bounding box in meters.
    pub load_dimensions: Option<LoadDimensions>,
    /// Weight of load in kg.
    pub weight: Option<f32>,
}

/// Contains all battery-related information.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatteryState {
    /// State of Charge in percent as a float value.
    pub battery_charge: f32,
    /// Battery voltage.
    pub battery_voltage: Option<f32>,
    /// State of health in percent as an integer within range [0..100].
    pub battery_health: Option<u32>,
    /// If true: Charging in progress. If false: AGV is currently not charging.
    pub charging: bool,
    /// Estimated reach with current State of Charge in meters.
    pub reach: Option<f32>,
}

/// Current operating mode of the AGV.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingMode {
    Automatic,
    Semiautomatic,
    Manual,
    Service,
    Teachin,
}

/// An error object.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Error {
    /// Type / name of error.
    pub error_type: String,
    /// Array of references to identify the source of the error (e.g. header_id, order_id, action_id, ...).
    pub error_references: Vec<ErrorReference>,
    /// Verbose description of error.
    pub error_description: Option<String>,
    /// Error level.
    pub error_level: ErrorLevel,
}

impl Error {
    /// Builds an error entry from a reference list. A reference keyed
    /// `errorDescriptionDetail` is consumed here: its value is appended to the
    /// description after a colon instead of being serialized as a reference.
    pub fn new(
        error_type: &str,
        description: &str,
        level: ErrorLevel,
        references: Vec<ErrorReference>,
    ) -> Self {
        let mut description = description.to_string();
        let mut kept = Vec::with_capacity(references.len());
        for reference in references {
            if reference.reference_key == reference_keys::ERROR_DESCRIPTION_DETAIL {
                description.push_str(": ");
                description.push_str(&reference.reference_value);
            } else {
                kept.push(reference);
            }
        }
        Error {
            error_type: error_type.to_string(),
            error_references: kept,
            error_description: Some(description),
            error_level: level,
        }
    }

    /// Value of the first reference with the given key.
    pub fn reference(&self, key: &str) -> Option<&str> {
        self.error_references
            .iter()
            .find(|r| r.reference_key == key)
            .map(|r| r.reference_value.as_str())
    }
}

/// Object that holds the error reference (e.g. order_id, order_update_id, action_id...) as key-value pairs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReference {
    /// References the type of reference (e.g. header_id, order_id, action_id, ...).
    pub reference_key: String,
    /// References the value, which belongs to the reference key.
    pub reference_value: String,
}

impl ErrorReference {
    pub fn new(key: &str, value: impl Into<String>) -> Self {
        ErrorReference {
            reference_key: key.to_string(),
            reference_value: value.into(),
        }
    }
}

/// Error level.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorLevel {
    /// AGV is ready to start (e.g. maintenance cycle expiration warning).
    Warning,
    /// AGV is not in running condition, user intervention required (e.g. laser scanner is contaminated).
    Fatal,
}

/// Wire values of the `errorType` field.
pub mod error_types {
    pub const ORDER_ERROR: &str = "orderError";
    pub const ORDER_UPDATE_ERROR: &str = "orderUpdateError";
    pub const ORDER_VALIDATION_ERROR: &str = "orderValidationError";
    pub const NO_ROUTE_ERROR: &str = "noRouteError";
    pub const VALIDATION_ERROR: &str = "validationError";
    pub const ORDER_ACTION_ERROR: &str = "orderActionError";
    pub const INSTANT_ACTION_ERROR: &str = "instantActionError";
    pub const INSTANT_ACTION_NO_ORDER_TO_CANCEL: &str = "instantActionNoOrderToCancel";
    pub const INSTANT_ACTION_VALIDATION_ERROR: &str = "instantActionValidationError";

    /// Error types that reject an order as a whole, as opposed to a single
    /// order action.
    pub fn is_order_rejection(error_type: &str) -> bool {
        matches!(
            error_type,
            ORDER_ERROR | ORDER_UPDATE_ERROR | ORDER_VALIDATION_ERROR | NO_ROUTE_ERROR
                | VALIDATION_ERROR
        )
    }

    /// Error types raised while validating or executing instant actions.
    pub fn is_instant_action_kind(error_type: &str) -> bool {
        matches!(
            error_type,
            INSTANT_ACTION_ERROR | INSTANT_ACTION_NO_ORDER_TO_CANCEL
                | INSTANT_ACTION_VALIDATION_ERROR
        )
    }
}

/// Well-known `referenceKey` values used in `errorReferences`.
pub mod reference_keys {
    pub const TOPIC: &str = "topic";
    pub const HEADER_ID: &str = "headerId";
    pub const ORDER_ID: &str = "orderId";
    pub const ORDER_UPDATE_ID: &str = "orderUpdateId";
    pub const NODE_ID: &str = "nodeId";
    pub const NODE_SEQUENCE_ID: &str = "nodeSequenceId";
    pub const EDGE_ID: &str = "edgeId";
    pub const EDGE_SEQUENCE_ID: &str = "edgeSequenceId";
    pub const ACTION_ID: &str = "actionId";
    pub const ACTION_TYPE: &str = "actionType";
    /// Consumed on the sender side; appended to `errorDescription`, never
    /// serialized as a reference.
    pub const ERROR_DESCRIPTION_DETAIL: &str = "errorDescriptionDetail";
}

/// An information object.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Information {
    /// Type / name of information.
    pub info_type: String,
    /// Array of references.
    pub info_references: Vec<InfoReference>,
    /// Info description.
    pub info_description: Option<String>,
    /// Info level.
    pub info_level: InfoLevel,
}

/// Object that holds the info reference as key-value pairs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InfoReference {
    /// References the type of reference (e.g. header_id, order_id, action_id, ...).
    pub reference_key: String,
    /// References the value, which belongs to the reference key.
    pub reference_value: String,
}

/// Info level.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InfoLevel {
    /// Used for visualization.
    Info,
    /// Used for debugging.
    Debug,
}

/// Object that holds information about the safety status.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SafetyState {
    /// Acknowledge type of e_stop.
    pub e_stop: EStop,
    /// Protective field violation. true: field is violated. false: field is not violated.
    pub field_violation: bool,
}

/// Acknowledge type of e_stop.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EStop {
    /// Auto-acknowledgeable e-stop is activated e.g. by bumper or protective field.
    Autoack,
    /// E-stop has to be acknowledged manually at the vehicle.
    Manual,
    /// Facility e-stop has to be acknowledged remotely.
    Remote,
    /// No e-stop activated.
    None,
}
