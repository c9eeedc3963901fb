use serde::{Deserialize, Serialize};

use crate::protocol::common::{AgvPosition, Header, Velocity};

/// AGV position and/or velocity for visualization purposes. Can be published
/// at a higher rate if wanted. Since bandwidth may be expensive depending on
/// the update rate for this topic, all fields are optional.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Visualization {
    #[serde(flatten)]
    pub header: Header,
    /// Current position of the AGV on the map.
    pub agv_position: Option<AgvPosition>,
    /// The AGVs velocity in vehicle coordinates.
    pub velocity: Option<Velocity>,
}
