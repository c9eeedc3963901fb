use std::sync::{Arc, Mutex};

use crate::agv_id::{AgvId, AgvIdMap, AgvSubject};
use crate::client::{
    Client, ClientOptions, ClientRole, InboundEnvelope, PublishOptions, PublishOutcome,
    TransportState,
};
use crate::error::ClientError;
use crate::protocol::connection::{Connection, ConnectionState};
use crate::protocol::{InstantActions, Order, Payload};
use crate::subscription::SubscriptionId;
use crate::topic::Topic;

/// Observer of per-AGV connection changes.
pub type ConnectionObserver = Arc<dyn Fn(&AgvId, &Connection) + Send + Sync>;

struct TrackingState {
    connections: AgvIdMap<Connection>,
    observers: Vec<ConnectionObserver>,
}

/// Master-plane facade over the shared client. Publishes `order` and
/// `instantActions`; subscribes `connection`, `state`, `visualization` and
/// `factsheet`. Maintains per-AGV connection liveness from a permanent
/// wildcard `connection` subscription.
pub struct MasterControlClient {
    client: Client,
    target_agvs: AgvSubject,
    tracking: Arc<Mutex<TrackingState>>,
}

impl MasterControlClient {
    /// `target_agvs` restricts which AGVs this master observes; the default
    /// (empty) subject observes the whole fleet.
    pub fn new(options: ClientOptions, target_agvs: AgvSubject) -> Result<Self, ClientError> {
        target_agvs.validate()?;
        let client = Client::new(options, ClientRole::MasterControl)?;
        Ok(MasterControlClient {
            client,
            target_agvs,
            tracking: Arc::new(Mutex::new(TrackingState {
                connections: AgvIdMap::new(),
                observers: Vec::new(),
            })),
        })
    }

    pub fn target_agvs(&self) -> &AgvSubject {
        &self.target_agvs
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn transport_state(&self) -> TransportState {
        self.client.transport_state()
    }

    /// Connects and installs the permanent connection-tracking subscription.
    pub async fn start(&self) -> Result<(), ClientError> {
        self.client.start().await?;
        let tracking = self.tracking.clone();
        self.client
            .subscribe(
                Topic::Connection,
                self.target_agvs.clone(),
                move |envelope| {
                    let Some(Payload::Connection(connection)) = envelope.payload else {
                        return;
                    };
                    let observers = {
                        let mut state = tracking.lock().unwrap();
                        state
                            .connections
                            .insert(envelope.subject.clone(), connection.clone());
                        state.observers.clone()
                    };
                    for observer in observers {
                        observer(&envelope.subject, &connection);
                    }
                },
            )
            .await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ClientError> {
        self.client.stop().await
    }

    /// Appends a connection observer to the tracking chain; earlier
    /// registrations keep firing. The current snapshot is delivered to the
    /// new observer synchronously before this call returns.
    pub fn track_agvs(&self, observer: impl Fn(&AgvId, &Connection) + Send + Sync + 'static) {
        let observer: ConnectionObserver = Arc::new(observer);
        let snapshot: Vec<(AgvId, Connection)> = {
            let mut state = self.tracking.lock().unwrap();
            state.observers.push(observer.clone());
            state
                .connections
                .iter()
                .map(|(id, connection)| (id.clone(), connection.clone()))
                .collect()
        };
        for (id, connection) in snapshot {
            observer(&id, &connection);
        }
    }

    /// Last observed connection state of an AGV, if any.
    pub fn connection_state(&self, agv_id: &AgvId) -> Option<ConnectionState> {
        self.tracking
            .lock()
            .unwrap()
            .connections
            .get(agv_id)
            .map(|connection| connection.connection_state)
    }

    /// Snapshot of every tracked AGV connection, in first-seen order.
    pub fn connections(&self) -> Vec<(AgvId, Connection)> {
        self.tracking
            .lock()
            .unwrap()
            .connections
            .iter()
            .map(|(id, connection)| (id.clone(), connection.clone()))
            .collect()
    }

    pub async fn publish_order(
        &self,
        agv_id: &AgvId,
        order: &mut Order,
    ) -> Result<PublishOutcome, ClientError> {
        self.client
            .publish(agv_id, order, PublishOptions::default())
            .await
    }

    pub async fn publish_instant_actions(
        &self,
        agv_id: &AgvId,
        instant_actions: &mut InstantActions,
    ) -> Result<PublishOutcome, ClientError> {
        self.client
            .publish(agv_id, instant_actions, PublishOptions::default())
            .await
    }

    pub async fn subscribe_states(
        &self,
        subject: AgvSubject,
        handler: impl Fn(InboundEnvelope) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, ClientError> {
        self.client.subscribe(Topic::State, subject, handler).await
    }

    pub async fn subscribe_visualizations(
        &self,
        subject: AgvSubject,
        handler: impl Fn(InboundEnvelope) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, ClientError> {
        self.client
            .subscribe(Topic::Visualization, subject, handler)
            .await
    }

    pub async fn subscribe_factsheets(
        &self,
        subject: AgvSubject,
        handler: impl Fn(InboundEnvelope) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, ClientError> {
        self.client
            .subscribe(Topic::Factsheet, subject, handler)
            .await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ClientError> {
        self.client.unsubscribe(id).await
    }
}
