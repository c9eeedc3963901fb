//! VDA 5050 interoperability between a fleet master control and automated
//! guided vehicles over MQTT.
//!
//! The crate provides both planes of the protocol:
//!
//! - [`AgvController`](agv_controller::AgvController) executes orders and
//!   instant actions on a vehicle through an [`AgvAdapter`](adapter::AgvAdapter)
//!   implementation and reports state.
//! - [`MasterController`](master_controller::MasterController) assigns orders
//!   and instant actions and reconstructs lifecycle events from the AGV state
//!   reports.
//!
//! Both sit on a shared [`Client`](client::Client) layer handling the MQTT
//! lifecycle, wildcard-aware subscriptions, offline buffering, header
//! stamping and version-gated payload validation.

pub mod adapter;
pub mod agv_client;
pub mod agv_controller;
pub mod agv_id;
pub mod client;
pub mod config;
pub mod error;
pub mod master_client;
pub mod master_controller;
pub mod protocol;
pub mod subscription;
pub mod topic;

pub use adapter::{
    ActionContext, ActionScope, ActionStatusChange, AdapterEvent, AdapterLink, AgvAdapter,
    AttachContext, DetachContext, RouteSection, StateUpdate, StopTraverseContext,
    TraverseEdgeContext, ADAPTER_API_VERSION,
};
pub use agv_client::AgvClient;
pub use agv_controller::{AgvController, AgvControllerHandle, AgvControllerOptions, AgvOutbound};
pub use agv_id::{AgvId, AgvIdMap, AgvSubject};
pub use client::{
    Client, ClientOptions, ClientRole, ExtensionDirections, InboundEnvelope, MqttTransportOptions,
    PublishOptions, PublishOutcome, TransportState,
};
pub use error::ClientError;
pub use master_client::MasterControlClient;
pub use master_controller::{
    ActionTarget, EdgeTraversalChange, InstantActionSink, MasterController,
    MasterControllerHandle, MasterControllerOptions, OrderEventSink, OrderRef,
};
pub use protocol::{Payload, ProtocolVersion};
pub use subscription::{SubscriptionId, SubscriptionManager};
pub use topic::{Topic, TopicFormat, DEFAULT_TOPIC_FORMAT};
