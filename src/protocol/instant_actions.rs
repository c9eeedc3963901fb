use serde::{Deserialize, Serialize};

use crate::protocol::action::Action;
use crate::protocol::common::Header;

/// Instant actions that the AGV is to execute as soon as they arrive.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstantActions {
    #[serde(flatten)]
    pub header: Header,
    /// Array of actions that need to be performed immediately and are not part of the regular order.
    pub actions: Vec<Action>,
}

/// Action types with built-in handling on the AGV plane.
pub mod instant_action_types {
    pub const CANCEL_ORDER: &str = "cancelOrder";
    pub const STATE_REQUEST: &str = "stateRequest";
    pub const FACTSHEET_REQUEST: &str = "factsheetRequest";
    pub const START_PAUSE: &str = "startPause";
    pub const STOP_PAUSE: &str = "stopPause";
}
