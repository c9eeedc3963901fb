//! Typed wire model of the VDA 5050 topics plus the version-gated payload
//! validators. Field sets and wording follow the published VDA 5050 schema;
//! serialization uses the camelCase wire form.

pub mod action;
pub mod common;
pub mod connection;
pub mod factsheet;
pub mod instant_actions;
pub mod order;
pub mod state;
pub mod validation;
pub mod visualization;

pub use action::{Action, ActionParameter, ActionParameterValue, BlockingType};
pub use common::{
    AgvPosition, BoundingBoxReference, ControlPoint, Header, HeaderId, LoadDimensions,
    NodePosition, Timestamp, Trajectory, Velocity,
};
pub use connection::{Connection, ConnectionState};
pub use factsheet::Factsheet;
pub use instant_actions::{instant_action_types, InstantActions};
pub use order::{Edge, Node, Order};
pub use state::{
    error_types, reference_keys, ActionState, ActionStatus, BatteryState, EStop, Error,
    ErrorLevel, ErrorReference, InfoLevel, InfoReference, Information, Load, NodeState,
    OperatingMode, SafetyState, State,
};
pub use visualization::Visualization;

use crate::topic::Topic;

/// The VDA 5050 protocol versions this library speaks. The configured version
/// gates payload validation and the availability of the factsheet topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    V1_1,
    V2_0,
    V2_1,
}

impl ProtocolVersion {
    /// Full version string stamped into message headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V1_1 => "1.1.0",
            ProtocolVersion::V2_0 => "2.0.0",
            ProtocolVersion::V2_1 => "2.1.0",
        }
    }

    pub fn major(&self) -> u32 {
        match self {
            ProtocolVersion::V1_1 => 1,
            ProtocolVersion::V2_0 | ProtocolVersion::V2_1 => 2,
        }
    }

    fn minor(&self) -> u32 {
        match self {
            ProtocolVersion::V1_1 | ProtocolVersion::V2_1 => 1,
            ProtocolVersion::V2_0 => 0,
        }
    }

    /// Topic level for the protocol major version, e.g. `v2`.
    pub fn major_level(&self) -> &'static str {
        match self {
            ProtocolVersion::V1_1 => "v1",
            ProtocolVersion::V2_0 | ProtocolVersion::V2_1 => "v2",
        }
    }

    /// The factsheet topic exists from version 2.0 on.
    pub fn supports_factsheet(&self) -> bool {
        !matches!(self, ProtocolVersion::V1_1)
    }

    /// A payload version agrees with the configured one when major and minor
    /// match; the patch component is not significant.
    pub fn matches_payload(&self, declared: &str) -> bool {
        let mut parts = declared.split('.');
        let major = parts.next().and_then(|p| p.parse::<u32>().ok());
        let minor = parts.next().and_then(|p| p.parse::<u32>().ok());
        major == Some(self.major()) && minor == Some(self.minor())
    }

    /// Parses `"1.1"`, `"2.0.0"`, and similar spellings.
    pub fn parse(s: &str) -> Option<ProtocolVersion> {
        let mut parts = s.split('.');
        let major: u32 = parts.next()?.parse().ok()?;
        let minor: u32 = parts.next()?.parse().ok()?;
        match (major, minor) {
            (1, 1) => Some(ProtocolVersion::V1_1),
            (2, 0) => Some(ProtocolVersion::V2_0),
            (2, 1) => Some(ProtocolVersion::V2_1),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed rendition of an inbound payload, produced by the validators.
#[derive(Clone, Debug)]
pub enum Payload {
    Connection(Connection),
    Order(Order),
    InstantActions(InstantActions),
    State(State),
    Visualization(Visualization),
    Factsheet(Factsheet),
    Extension(serde_json::Value),
}

/// A publishable VDA 5050 message. The client stamps the header in place on
/// publish, so the caller keeps the message exactly as it went out.
pub trait VdaMessage: serde::Serialize + Clone + std::fmt::Debug {
    fn topic(&self) -> Topic;
    fn header(&self) -> &Header;
    fn header_mut(&mut self) -> &mut Header;
}

macro_rules! impl_vda_message {
    ($type:ty, $topic:expr) => {
        impl VdaMessage for $type {
            fn topic(&self) -> Topic {
                $topic
            }
            fn header(&self) -> &Header {
                &self.header
            }
            fn header_mut(&mut self) -> &mut Header {
                &mut self.header
            }
        }
    };
}

impl_vda_message!(Connection, Topic::Connection);
impl_vda_message!(Order, Topic::Order);
impl_vda_message!(InstantActions, Topic::InstantActions);
impl_vda_message!(State, Topic::State);
impl_vda_message!(Visualization, Topic::Visualization);
impl_vda_message!(Factsheet, Topic::Factsheet);
