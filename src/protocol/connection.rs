use serde::{Deserialize, Serialize};

use crate::protocol::common::Header;

/// AGV connection state reported as a last will message. Has to be sent with
/// retain flag. Once the AGV comes online, it has to send this message on its
/// connect topic, with the connection_state enum set to "ONLINE". The last
/// will message is to be configured with the connection state set to
/// "CONNECTIONBROKEN". Thus, if the AGV disconnects from the broker, master
/// control gets notified via the topic "connection". If the AGV is
/// disconnecting in an orderly fashion (e.g. shutting down, sleeping), the AGV
/// is to publish a message on this topic with the connection_state set to
/// "OFFLINE".
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(flatten)]
    pub header: Header,
    /// Connection state.
    pub connection_state: ConnectionState,
}

/// Connection state.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionState {
    /// The connection between AGV and broker is active.
    Online,
    /// The connection between AGV and broker has gone offline in a coordinated way.
    Offline,
    /// The connection between AGV and broker has unexpectedly ended.
    ConnectionBroken,
}
