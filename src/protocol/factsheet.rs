use serde::{Deserialize, Serialize};

use crate::protocol::action::ActionParameterValue;
use crate::protocol::common::Header;

/// The factsheet provides basic information about a specific AGV type series.
/// This information allows comparison of different AGV types and can be used
/// during the integration of AGVs into a master control system. Requested via
/// the `factsheetRequest` instant action (protocol version 2.0 and later).
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Factsheet {
    #[serde(flatten)]
    pub header: Header,
    /// These parameters generally specify the class and the capabilities of the AGV.
    pub type_specification: TypeSpecification,
    /// These parameters specify the basic physical properties of the AGV.
    pub physical_parameters: PhysicalParameters,
    /// Limits for length of identifiers, arrays and strings in the protocol.
    pub protocol_limits: Option<ProtocolLimits>,
    /// Supported features of the VDA 5050 protocol and the supported actions.
    pub protocol_features: Option<ProtocolFeatures>,
    /// Simplified description of the AGV load capabilities.
    pub load_specification: Option<LoadSpecification>,
}

/// These parameters generally specify the class and the capabilities of the AGV.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypeSpecification {
    /// Free text generalized series name as specified by manufacturer.
    pub series_name: String,
    /// Free text human readable description of the AGV type series.
    pub series_description: Option<String>,
    /// Simplified description of AGV kinematics-type.
    pub agv_kinematic: AgvKinematic,
    /// Simplified description of AGV class.
    pub agv_class: AgvClass,
    /// Maximum loadable mass in kg.
    pub max_load_mass: f32,
    /// Simplified description of localization type.
    pub localization_types: Vec<String>,
    /// List of path planning types supported by the AGV, sorted by priority.
    pub navigation_types: Vec<String>,
}

/// Simplified description of AGV kinematics-type.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgvKinematic {
    Diff,
    Omni,
    Threewheel,
}

/// Simplified description of AGV class.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgvClass {
    Forklift,
    Conveyor,
    Tugger,
    Carrier,
}

/// These parameters specify the basic physical properties of the AGV.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalParameters {
    /// Minimal speed of the AGV in m/s.
    pub speed_min: f32,
    /// Maximum speed of the AGV in m/s.
    pub speed_max: f32,
    /// Maximum acceleration with maximum load in m/s^2.
    pub acceleration_max: f32,
    /// Maximum deceleration with maximum load in m/s^2.
    pub deceleration_max: f32,
    /// Minimum height of AGV in meters.
    pub height_min: Option<f32>,
    /// Maximum height of AGV in meters.
    pub height_max: f32,
    /// Width of AGV in meters.
    pub width: f32,
    /// Length of AGV in meters.
    pub length: f32,
}

/// Limits for length of identifiers, arrays and strings in the protocol.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolLimits {
    /// Maximum number of nodes per order processable by the AGV.
    pub max_order_nodes: Option<u32>,
    /// Maximum number of edges per order processable by the AGV.
    pub max_order_edges: Option<u32>,
    /// Maximum number of parallel outstanding instant actions.
    pub max_instant_actions: Option<u32>,
    /// Maximum supported length of serial number strings.
    pub max_serial_number_length: Option<u32>,
    /// Maximum supported length of id strings.
    pub max_id_length: Option<u32>,
}

/// Supported features of the VDA 5050 protocol and the supported actions.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolFeatures {
    /// List of supported and/or required optional parameters.
    pub optional_parameters: Vec<OptionalParameter>,
    /// List of all actions with parameters supported by this AGV.
    pub agv_actions: Vec<AgvAction>,
}

/// An optional protocol parameter together with its support classification.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptionalParameter {
    /// Full name of optional parameter, e.g. "order.nodes.nodePosition.allowedDeviationTheta".
    pub parameter: String,
    /// Type of support for the optional parameter.
    pub support: Support,
    /// Free text description of optional parameter.
    pub description: Option<String>,
}

/// Type of support for an optional protocol parameter.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Support {
    /// Optional parameter is supported like specified.
    Supported,
    /// Optional parameter is required for proper AGV operation.
    Required,
}

/// An action supported by the AGV together with its parameters.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgvAction {
    /// Unique action type corresponding to action.actionType.
    pub action_type: String,
    /// Free text description of the action.
    pub action_description: Option<String>,
    /// List of parameters the action supports.
    pub action_parameters: Option<Vec<AgvActionParameter>>,
    /// List of allowed scopes for using this action type.
    pub action_scopes: Vec<ActionScope>,
    /// Free text description of the resultDescription.
    pub result_description: Option<String>,
}

/// A parameter of an action supported by the AGV.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgvActionParameter {
    /// Key string for the parameter.
    pub key: String,
    /// Data type of the value.
    pub value_data_type: ValueDataType,
    /// Free text description of the parameter.
    pub description: Option<String>,
    /// True: parameter is optional.
    pub is_optional: Option<bool>,
}

/// Data type of an action parameter value.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueDataType {
    Bool,
    Number,
    Integer,
    Float,
    String,
    Object,
    Array,
}

impl ValueDataType {
    /// Whether a concrete parameter value is of this declared type.
    pub fn matches(&self, value: &ActionParameterValue) -> bool {
        match self {
            ValueDataType::Bool => matches!(value, ActionParameterValue::Boolean(_)),
            ValueDataType::Integer => matches!(value, ActionParameterValue::Int(_)),
            ValueDataType::Float | ValueDataType::Number => matches!(
                value,
                ActionParameterValue::Int(_) | ActionParameterValue::Float(_)
            ),
            ValueDataType::String => matches!(value, ActionParameterValue::Str(_)),
            _ => true,
        }
    }
}

/// Scope in which an action may be used.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionScope {
    /// Usable as instant action.
    Instant,
    /// Usable on nodes.
    Node,
    /// Usable on edges.
    Edge,
}

/// Simplified description of the AGV load capabilities.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoadSpecification {
    /// List of load positions / load handling devices.
    pub load_positions: Vec<String>,
}
