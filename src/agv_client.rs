use tracing::warn;

use crate::agv_id::AgvId;
use crate::client::{
    Client, ClientOptions, ClientRole, InboundEnvelope, PublishOptions, PublishOutcome,
    TransportState,
};
use crate::error::ClientError;
use crate::protocol::connection::{Connection, ConnectionState};
use crate::protocol::{Factsheet, Header, State, Visualization};
use crate::subscription::SubscriptionId;
use crate::topic::Topic;

/// AGV-plane facade over the shared client. Publishes `connection`, `state`,
/// `visualization` and `factsheet`; subscribes `order` and `instantActions`
/// for its own subject. Registers a retained CONNECTIONBROKEN last will and
/// brackets its lifetime with retained ONLINE/OFFLINE connection messages.
#[derive(Clone)]
pub struct AgvClient {
    client: Client,
    agv_id: AgvId,
}

impl AgvClient {
    pub fn new(agv_id: AgvId, mut options: ClientOptions) -> Result<Self, ClientError> {
        agv_id.validate()?;
        options.last_will_subject = Some(agv_id.clone());
        // Invalid order/instantActions payloads must reach the controller,
        // which validates its own intake and reports undecodable messages as
        // error entries in the published state. Client-level inbound
        // validation would drop them before dispatch.
        options.validate_inbound = false;
        let client = Client::new(options, ClientRole::Agv)?;
        Ok(AgvClient { client, agv_id })
    }

    pub fn agv_id(&self) -> &AgvId {
        &self.agv_id
    }

    /// The underlying shared client, e.g. for extension topics or the
    /// connection-state observer.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn transport_state(&self) -> TransportState {
        self.client.transport_state()
    }

    /// Connects and announces this AGV with a retained ONLINE connection
    /// message.
    pub async fn start(&self) -> Result<(), ClientError> {
        self.client.start().await?;
        self.publish_connection_state(ConnectionState::Online)
            .await?;
        Ok(())
    }

    /// Publishes a retained OFFLINE connection message, then tears the
    /// transport down.
    pub async fn stop(&self) -> Result<(), ClientError> {
        if let Err(e) = self.publish_connection_state(ConnectionState::Offline).await {
            warn!(error = %e, "failed to announce OFFLINE while stopping");
        }
        self.client.stop().await
    }

    async fn publish_connection_state(
        &self,
        connection_state: ConnectionState,
    ) -> Result<PublishOutcome, ClientError> {
        let mut connection = Connection {
            header: Header::unstamped(),
            connection_state,
        };
        self.client
            .publish(
                &self.agv_id,
                &mut connection,
                PublishOptions {
                    retain: true,
                    ..PublishOptions::default()
                },
            )
            .await
    }

    pub async fn publish_state(&self, state: &mut State) -> Result<PublishOutcome, ClientError> {
        self.client
            .publish(&self.agv_id, state, PublishOptions::default())
            .await
    }

    /// Visualization messages are cheap and frequent; they are dropped
    /// rather than queued while the connection is down.
    pub async fn publish_visualization(
        &self,
        visualization: &mut Visualization,
    ) -> Result<PublishOutcome, ClientError> {
        self.client
            .publish(
                &self.agv_id,
                visualization,
                PublishOptions {
                    drop_if_offline: true,
                    ..PublishOptions::default()
                },
            )
            .await
    }

    /// The factsheet is published retained so late-joining masters see it.
    pub async fn publish_factsheet(
        &self,
        factsheet: &mut Factsheet,
    ) -> Result<PublishOutcome, ClientError> {
        self.client
            .publish(
                &self.agv_id,
                factsheet,
                PublishOptions {
                    retain: true,
                    ..PublishOptions::default()
                },
            )
            .await
    }

    pub async fn subscribe_orders(
        &self,
        handler: impl Fn(InboundEnvelope) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, ClientError> {
        self.client
            .subscribe(Topic::Order, (&self.agv_id).into(), handler)
            .await
    }

    pub async fn subscribe_instant_actions(
        &self,
        handler: impl Fn(InboundEnvelope) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, ClientError> {
        self.client
            .subscribe(Topic::InstantActions, (&self.agv_id).into(), handler)
            .await
    }
}
