use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// header_id of a message. The header_id is defined per topic and incremented
/// by 1 with each sent (but not necessarily received) message. Wraps to 0
/// after u32::MAX.
pub type HeaderId = u32;

/// Timestamp (ISO8601, UTC); YYYY-MM-DDTHH:mm:ss.ssZ; e.g. 2017-04-15T11:40:03.12Z
pub type Timestamp = DateTime<Utc>;

/// Header fields carried by every VDA 5050 message. Stamped by the client on
/// publish; flattened into the topic payload on the wire.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    /// header_id of the message. The header_id is defined per topic and incremented by 1 with each sent (but not necessarily received) message.
    pub header_id: HeaderId,
    /// Timestamp (ISO8601, UTC); YYYY-MM-DDTHH:mm:ss.ssZ; e.g. 2017-04-15T11:40:03.12Z
    pub timestamp: Timestamp,
    /// Version of the protocol [Major].[Minor].[Patch], e.g. 1.3.2
    pub version: String,
    /// Manufacturer of the AGV
    pub manufacturer: String,
    /// Serial number of the AGV
    pub serial_number: String,
}

impl Header {
    /// A zeroed header as placed on messages before the client stamps them.
    pub fn unstamped() -> Self {
        Header {
            header_id: 0,
            timestamp: Utc::now(),
            version: String::new(),
            manufacturer: String::new(),
            serial_number: String::new(),
        }
    }
}

/// Current position of the AGV on the map. Optional: Can only be omitted for
/// AGVs without the capability to localize themselves, e.g. line guided AGVs.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgvPosition {
    /// X-position on the map in reference to the map coordinate system. Precision is up to the specific implementation.
    pub x: f32,
    /// Y-position on the map in reference to the map coordinate system. Precision is up to the specific implementation.
    pub y: f32,
    /// Range: [-pi..pi] Orientation of the AGV.
    pub theta: f32,
    /// Unique identification of the map in which the position is referenced.
    pub map_id: String,
    /// Additional information on the map.
    pub map_description: Option<String>,
    /// True if the AGVs position is initialized, false, if position is not initialized.
    pub position_initialized: bool,
    /// Describes the quality of the localization. 0.0: position unknown 1.0: position known. Optional for vehicles that cannot estimate their localization score. Only for logging and visualization purposes.
    pub localization_score: Option<f32>,
    /// Value for the deviation range of the position in meters. Only for logging and visualization purposes.
    pub deviation_range: Option<f32>,
}

/// Defines the position on a map in world coordinates. Each floor has its own map.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePosition {
    /// X coordinate described in the world coordinate system.
    pub x: f32,
    /// Y coordinate described in the world coordinate system.
    pub y: f32,
    /// Range: [-pi..pi]. Orientation of the AGV on the node. Optional: vehicle can plan the path by itself.
    pub theta: Option<f32>,
    /// Indicates how exact an AGV has to drive over a node in order for it to count as traversed. If > 0: allowed deviation-radius in meters.
    pub allowed_deviation_xy: Option<f32>,
    /// Indicates how big the deviation of theta angle can be.
    pub allowed_deviation_theta: Option<f32>,
    /// Unique identification of the map in which the position is referenced.
    pub map_id: String,
    /// Verbose description of the Map.
    pub map_description: Option<String>,
}

/// The AGVs velocity in vehicle coordinates.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Velocity {
    /// The AGVs velocity in its x direction.
    pub vx: Option<f32>,
    /// The AGVs velocity in its y direction.
    pub vy: Option<f32>,
    /// The AGVs turning speed around its z axis.
    pub omega: Option<f32>,
}

/// The trajectory is to be communicated as a NURBS. Trajectory segments are
/// from the point where the AGV starts to enter the edge until the point where
/// it reports that the next node was traversed.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trajectory {
    /// Defines the number of control points that influence any given point on the curve. Increasing the degree increases continuity. If not defined, the default value is 1.
    pub degree: i64,
    /// Sequence of parameter values that determine where and how the control points affect the NURBS curve. knot_vector has size of number of control points + degree + 1.
    pub knot_vector: Vec<f32>,
    /// List of controlPoint objects defining the control points of the NURBS. This includes the start and end point.
    pub control_points: Vec<ControlPoint>,
}

#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPoint {
    /// X coordinate described in the world coordinate system.
    pub x: f32,
    /// Y coordinate described in the world coordinate system.
    pub y: f32,
    /// Range: (0..Infinity). The weight with which this control point pulls on the curve. When not defined, the default will be 1.0.
    pub weight: Option<f32>,
    /// Range: [-pi..pi]. Orientation of the AGV on this position of the curve. When not defined the orientation of the AGV will be tangential to the curve.
    pub orientation: Option<f32>,
}

/// This point describes the loads position on the AGV in the vehicle
/// coordinates. The bounding_box_reference point is in the middle of the
/// footprint of the load, so length/2 and width/2.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBoxReference {
    /// x-coordinate of the point of reference.
    pub x: f32,
    /// y-coordinate of the point of reference.
    pub y: f32,
    /// z-coordinate of the point of reference.
    pub z: f32,
    /// Orientation of the loads bounding box. Important for tugger trains etc.
    pub theta: Option<f32>,
}

/// Dimensions of the load's bounding box in meters.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadDimensions {
    /// Absolute length of the loads bounding box in meter.
    pub length: f32,
    /// Absolute width of the loads bounding box in meter.
    pub width: f32,
    /// Absolute height of the loads bounding box in meter. Optional: Set value only if known.
    pub height: Option<f32>,
}
