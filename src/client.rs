use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use paho_mqtt as mqtt;
use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::agv_id::{AgvId, AgvSubject};
use crate::error::ClientError;
use crate::protocol::connection::{Connection, ConnectionState};
use crate::protocol::validation::{validate_core_payload, ValidationError};
use crate::protocol::{Header, Payload, ProtocolVersion, VdaMessage};
use crate::subscription::{SubscriptionId, SubscriptionManager};
use crate::topic::{Topic, TopicFormat, DEFAULT_TOPIC_FORMAT};

/// Lifecycle of the transport connection:
/// `Stopped -> Connecting -> Online <-> Offline -> Stopping -> Stopped`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Connecting,
    Online,
    Offline,
    Stopping,
}

impl TransportState {
    fn is_started(&self) -> bool {
        matches!(
            self,
            TransportState::Connecting | TransportState::Online | TransportState::Offline
        )
    }
}

/// Which plane a client serves; constrains publish/subscribe directions on
/// the core topics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientRole {
    Agv,
    MasterControl,
}

impl ClientRole {
    /// Direction constraints of the core topics. Extension topics are
    /// governed by their registration flags instead.
    pub fn allows(&self, topic: &Topic, inbound: bool) -> bool {
        match (self, inbound) {
            (ClientRole::Agv, true) => matches!(topic, Topic::Order | Topic::InstantActions),
            (ClientRole::Agv, false) => matches!(
                topic,
                Topic::Connection | Topic::State | Topic::Visualization | Topic::Factsheet
            ),
            (ClientRole::MasterControl, true) => matches!(
                topic,
                Topic::Connection | Topic::State | Topic::Visualization | Topic::Factsheet
            ),
            (ClientRole::MasterControl, false) => {
                matches!(topic, Topic::Order | Topic::InstantActions)
            }
        }
    }
}

/// Broker transport settings.
#[derive(Clone, Debug)]
pub struct MqttTransportOptions {
    /// Broker URL, e.g. `tcp://localhost:1883`.
    pub broker_url: String,
    /// MQTT keep-alive interval.
    pub keep_alive: Duration,
    /// Delay between reconnection attempts; zero disables reconnection.
    pub reconnect_period: Duration,
    /// Timeout for the initial broker connection.
    pub connect_timeout: Duration,
    /// Topic format template; `None` selects the default format.
    pub topic_format: Option<String>,
}

impl Default for MqttTransportOptions {
    fn default() -> Self {
        MqttTransportOptions {
            broker_url: "tcp://localhost:1883".to_string(),
            keep_alive: Duration::from_secs(15),
            reconnect_period: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            topic_format: None,
        }
    }
}

/// Options common to both client roles.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Name of the interface, the first level of the default topic format.
    pub interface_name: String,
    /// Protocol version spoken and enforced by this client.
    pub version: ProtocolVersion,
    pub transport: MqttTransportOptions,
    /// Validate inbound payloads before dispatch; invalid messages are
    /// dropped and logged.
    pub validate_inbound: bool,
    /// Validate outbound payloads; failures surface synchronously at the
    /// publish call site.
    pub validate_outbound: bool,
    /// When set, a retained CONNECTIONBROKEN connection message for this
    /// subject is registered as the broker last will.
    pub last_will_subject: Option<AgvId>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            interface_name: "uagv".to_string(),
            version: ProtocolVersion::V2_0,
            transport: MqttTransportOptions::default(),
            validate_inbound: true,
            validate_outbound: true,
            last_will_subject: None,
        }
    }
}

/// Per-publish options.
#[derive(Clone, Copy, Debug, Default)]
pub struct PublishOptions {
    /// Discard instead of queueing when the broker connection is down.
    pub drop_if_offline: bool,
    /// Publish with the broker retain flag.
    pub retain: bool,
}

/// How a publish call left the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Acknowledged by the broker.
    Published,
    /// Buffered for transmission on the next reconnect.
    Queued,
    /// Discarded because the connection was down and `drop_if_offline` was
    /// set.
    Dropped,
}

/// An inbound message delivered to subscription handlers.
#[derive(Clone, Debug)]
pub struct InboundEnvelope {
    pub topic: Topic,
    pub subject: AgvId,
    /// Typed payload; `None` only when inbound validation is disabled and
    /// the payload did not parse.
    pub payload: Option<Payload>,
    /// Raw JSON payload as received.
    pub raw: Arc<Value>,
}

pub type Handler = Arc<dyn Fn(InboundEnvelope) + Send + Sync>;
type Observer = Arc<dyn Fn(TransportState) + Send + Sync>;
type ExtensionValidator = Arc<dyn Fn(&Value) -> Result<(), ValidationError> + Send + Sync>;

/// Direction flags of a registered extension topic.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtensionDirections {
    pub inbound: bool,
    pub outbound: bool,
}

struct ExtensionSpec {
    directions: ExtensionDirections,
    validator: Option<ExtensionValidator>,
}

struct QueuedPublish {
    broker_topic: String,
    payload: Vec<u8>,
    retain: bool,
}

struct ClientState {
    lifecycle: TransportState,
    mqtt: Option<mqtt::AsyncClient>,
    subscriptions: SubscriptionManager<Handler>,
    header_ids: HashMap<String, u32>,
    offline_queue: VecDeque<QueuedPublish>,
    observer: Option<Observer>,
    extensions: HashMap<String, ExtensionSpec>,
    dispatcher: Option<tokio::task::JoinHandle<()>>,
}

struct ClientContext {
    options: ClientOptions,
    role: ClientRole,
    format: TopicFormat,
    state: Mutex<ClientState>,
}

/// Shared MQTT transport layer: lifecycle state machine, publish with header
/// stamping and offline buffering, wildcard-aware subscriptions with batch
/// resubscription, and validated inbound dispatch.
#[derive(Clone)]
pub struct Client {
    context: Arc<ClientContext>,
}

impl Client {
    pub fn new(options: ClientOptions, role: ClientRole) -> Result<Self, ClientError> {
        let format = match &options.transport.topic_format {
            Some(template) => TopicFormat::compile(template)?,
            None => TopicFormat::compile(DEFAULT_TOPIC_FORMAT)?,
        };
        let subscriptions = SubscriptionManager::new(
            format.clone(),
            options.interface_name.clone(),
            options.version.major_level(),
        );
        Ok(Client {
            context: Arc::new(ClientContext {
                options,
                role,
                format,
                state: Mutex::new(ClientState {
                    lifecycle: TransportState::Stopped,
                    mqtt: None,
                    subscriptions,
                    header_ids: HashMap::new(),
                    offline_queue: VecDeque::new(),
                    observer: None,
                    extensions: HashMap::new(),
                    dispatcher: None,
                }),
            }),
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.context.options
    }

    pub fn version(&self) -> ProtocolVersion {
        self.context.options.version
    }

    pub fn role(&self) -> ClientRole {
        self.context.role
    }

    /// Current transport lifecycle state.
    pub fn transport_state(&self) -> TransportState {
        self.context.state.lock().unwrap().lifecycle
    }

    /// Registers the single connection-state observer; the current state is
    /// dispatched to it immediately and synchronously.
    pub fn set_connection_observer(&self, observer: impl Fn(TransportState) + Send + Sync + 'static) {
        let observer: Observer = Arc::new(observer);
        let current = {
            let mut state = self.context.state.lock().unwrap();
            state.observer = Some(observer.clone());
            state.lifecycle
        };
        observer(current);
    }

    /// Registers a custom extension topic with its direction flags and an
    /// optional payload validator.
    pub fn register_extension_topic(
        &self,
        name: &str,
        directions: ExtensionDirections,
        validator: Option<ExtensionValidator>,
    ) -> Result<(), ClientError> {
        Topic::Extension(name.to_string()).validate()?;
        let mut state = self.context.state.lock().unwrap();
        state.extensions.insert(
            name.to_string(),
            ExtensionSpec {
                directions,
                validator,
            },
        );
        Ok(())
    }

    /// Connects to the broker, registers the configured last will, replays
    /// retained subscriptions and drains the offline publish queue.
    pub async fn start(&self) -> Result<(), ClientError> {
        let stream = {
            let mut state = self.context.state.lock().unwrap();
            if state.lifecycle != TransportState::Stopped {
                return Err(ClientError::AlreadyStarted);
            }
            let create_opts = mqtt::CreateOptionsBuilder::new()
                .server_uri(&self.context.options.transport.broker_url)
                .client_id(Uuid::new_v4().to_string())
                .finalize();
            let mut mqtt_client = mqtt::AsyncClient::new(create_opts)?;
            let stream = mqtt_client.get_stream(64);
            state.mqtt = Some(mqtt_client);
            state.lifecycle = TransportState::Connecting;
            stream
        };
        self.notify_observer();

        let connect_result = {
            let connect_options = self.connect_options()?;
            let mqtt_client = self.mqtt_handle()?;
            mqtt_client.connect(connect_options).await
        };
        if let Err(e) = connect_result {
            let mut state = self.context.state.lock().unwrap();
            state.lifecycle = TransportState::Stopped;
            state.mqtt = None;
            drop(state);
            self.notify_observer();
            return Err(e.into());
        }

        {
            let mut state = self.context.state.lock().unwrap();
            state.lifecycle = TransportState::Online;
        }
        self.notify_observer();
        self.materialize_subscriptions().await?;
        self.drain_offline_queue().await;

        let context = self.context.clone();
        let client = self.clone();
        let dispatcher = tokio::spawn(async move {
            let mut stream = stream;
            while let Some(message) = stream.next().await {
                match message {
                    Some(message) => context.dispatch(message),
                    None => {
                        if !client.handle_connection_loss().await {
                            break;
                        }
                    }
                }
            }
        });
        self.context.state.lock().unwrap().dispatcher = Some(dispatcher);
        Ok(())
    }

    /// Cooperative stop: tears down the broker connection and destroys all
    /// subscriptions. In-flight publishes may error.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let (mqtt_client, dispatcher) = {
            let mut state = self.context.state.lock().unwrap();
            if state.lifecycle == TransportState::Stopped {
                return Ok(());
            }
            state.lifecycle = TransportState::Stopping;
            (state.mqtt.take(), state.dispatcher.take())
        };
        self.notify_observer();

        if let Some(mqtt_client) = mqtt_client {
            if mqtt_client.is_connected() {
                if let Err(e) = mqtt_client.disconnect(None).await {
                    warn!(error = %e, "broker disconnect failed during stop");
                }
            }
        }
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }

        {
            let mut state = self.context.state.lock().unwrap();
            state.subscriptions.clear();
            state.offline_queue.clear();
            state.lifecycle = TransportState::Stopped;
        }
        self.notify_observer();
        Ok(())
    }

    /// Stamps the header of `message` in place, validates, and publishes it
    /// for `subject`. The caller keeps the message exactly as it was sent.
    pub async fn publish<M: VdaMessage>(
        &self,
        subject: &AgvId,
        message: &mut M,
        options: PublishOptions,
    ) -> Result<PublishOutcome, ClientError> {
        let topic = message.topic();
        if topic.is_extension() {
            return Err(ClientError::InvalidTopic(
                "extension payloads go through publish_extension".to_string(),
            ));
        }
        let (broker_topic, header_id) = self.prepare_publish(&topic, subject)?;
        *message.header_mut() = Header {
            header_id,
            timestamp: Utc::now(),
            version: self.context.options.version.as_str().to_string(),
            manufacturer: subject.manufacturer.clone(),
            serial_number: subject.serial_number.clone(),
        };
        let value = serde_json::to_value(&*message)?;
        if self.context.options.validate_outbound {
            validate_core_payload(&topic, self.context.options.version, &value)?;
        }
        self.transmit(broker_topic, serde_json::to_vec(&value)?, options)
            .await
    }

    /// Publishes a raw JSON object on a registered extension topic. The
    /// header fields are stamped into the object before transmission.
    pub async fn publish_extension(
        &self,
        topic_name: &str,
        subject: &AgvId,
        mut payload: Value,
        options: PublishOptions,
    ) -> Result<PublishOutcome, ClientError> {
        let topic = Topic::Extension(topic_name.to_string());
        let (broker_topic, header_id) = self.prepare_publish(&topic, subject)?;
        let object = payload.as_object_mut().ok_or_else(|| {
            ClientError::Validation(ValidationError::new(&topic, "payload is not a JSON object"))
        })?;
        object.insert("headerId".to_string(), header_id.into());
        object.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        );
        object.insert(
            "version".to_string(),
            Value::String(self.context.options.version.as_str().to_string()),
        );
        object.insert(
            "manufacturer".to_string(),
            Value::String(subject.manufacturer.clone()),
        );
        object.insert(
            "serialNumber".to_string(),
            Value::String(subject.serial_number.clone()),
        );

        if self.context.options.validate_outbound {
            let validator = {
                let state = self.context.state.lock().unwrap();
                state
                    .extensions
                    .get(topic_name)
                    .and_then(|spec| spec.validator.clone())
            };
            if let Some(validator) = validator {
                validator(&payload)?;
            }
        }
        self.transmit(broker_topic, serde_json::to_vec(&payload)?, options)
            .await
    }

    /// Subscribes a handler for a topic and (possibly partial) subject.
    /// Offline subscriptions are recorded and materialized on the next
    /// connect.
    pub async fn subscribe(
        &self,
        topic: Topic,
        subject: AgvSubject,
        handler: impl Fn(InboundEnvelope) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, ClientError> {
        self.check_direction(&topic, true)?;
        let (subscribed, mqtt_client, online) = {
            let mut state = self.context.state.lock().unwrap();
            if !state.lifecycle.is_started() {
                return Err(ClientError::NotStarted);
            }
            let subscribed = state
                .subscriptions
                .add(&topic, &subject, Arc::new(handler))?;
            (
                subscribed,
                state.mqtt.clone(),
                state.lifecycle == TransportState::Online,
            )
        };
        if subscribed.requires_subscribe && online {
            if let Some(mqtt_client) = mqtt_client {
                if let Err(e) = mqtt_client
                    .subscribe(&subscribed.broker_topic, mqtt::QOS_1)
                    .await
                {
                    self.context
                        .state
                        .lock()
                        .unwrap()
                        .subscriptions
                        .remove(subscribed.id);
                    return Err(e.into());
                }
            }
        }
        Ok(subscribed.id)
    }

    /// Removes a subscription; unsubscribes from the broker when the last
    /// handler on the topic is gone.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ClientError> {
        let (removed, mqtt_client, online) = {
            let mut state = self.context.state.lock().unwrap();
            let removed = state.subscriptions.remove(id);
            (
                removed,
                state.mqtt.clone(),
                state.lifecycle == TransportState::Online,
            )
        };
        if let Some(removed) = removed {
            if removed.requires_unsubscribe && online {
                if let Some(mqtt_client) = mqtt_client {
                    mqtt_client.unsubscribe(&removed.broker_topic).await?;
                }
            }
        }
        Ok(())
    }

    /// Constructs the broker topic for a subject, validating everything that
    /// can fail synchronously, and reserves the next header id.
    fn prepare_publish(
        &self,
        topic: &Topic,
        subject: &AgvId,
    ) -> Result<(String, u32), ClientError> {
        self.check_direction(topic, false)?;
        subject.validate()?;
        let mut state = self.context.state.lock().unwrap();
        if !state.lifecycle.is_started() {
            return Err(ClientError::NotStarted);
        }
        let broker_topic = self.context.format.broker_topic(
            &self.context.options.interface_name,
            self.context.options.version.major_level(),
            &subject.into(),
            topic,
        )?;
        let counter = state
            .header_ids
            .entry(topic.name().to_string())
            .or_insert(0);
        let header_id = *counter;
        *counter = counter.wrapping_add(1);
        Ok((broker_topic, header_id))
    }

    fn check_direction(&self, topic: &Topic, inbound: bool) -> Result<(), ClientError> {
        let allowed = match topic {
            Topic::Extension(name) => {
                let state = self.context.state.lock().unwrap();
                state
                    .extensions
                    .get(name)
                    .map(|spec| {
                        if inbound {
                            spec.directions.inbound
                        } else {
                            spec.directions.outbound
                        }
                    })
                    .unwrap_or(false)
            }
            topic => self.context.role.allows(topic, inbound),
        };
        if allowed {
            Ok(())
        } else {
            Err(ClientError::TopicDirection {
                topic: topic.name().to_string(),
                direction: if inbound { "inbound" } else { "outbound" },
            })
        }
    }

    async fn transmit(
        &self,
        broker_topic: String,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<PublishOutcome, ClientError> {
        let (online, mqtt_client) = {
            let state = self.context.state.lock().unwrap();
            (
                state.lifecycle == TransportState::Online,
                state.mqtt.clone(),
            )
        };
        if online {
            if let Some(mqtt_client) = mqtt_client {
                let message = if options.retain {
                    mqtt::Message::new_retained(&broker_topic, payload, mqtt::QOS_1)
                } else {
                    mqtt::Message::new(&broker_topic, payload, mqtt::QOS_1)
                };
                mqtt_client.publish(message).await?;
                return Ok(PublishOutcome::Published);
            }
        }
        if options.drop_if_offline {
            debug!(topic = %broker_topic, "dropping publish while offline");
            return Ok(PublishOutcome::Dropped);
        }
        let mut state = self.context.state.lock().unwrap();
        state.offline_queue.push_back(QueuedPublish {
            broker_topic,
            payload,
            retain: options.retain,
        });
        Ok(PublishOutcome::Queued)
    }

    fn connect_options(&self) -> Result<mqtt::ConnectOptions, ClientError> {
        let transport = &self.context.options.transport;
        let mut builder = mqtt::ConnectOptionsBuilder::with_mqtt_version(mqtt::MQTT_VERSION_5);
        builder
            .clean_start(true)
            .keep_alive_interval(transport.keep_alive)
            .connect_timeout(transport.connect_timeout);
        if let Some(subject) = &self.context.options.last_will_subject {
            let topic = self.context.format.broker_topic(
                &self.context.options.interface_name,
                self.context.options.version.major_level(),
                &subject.into(),
                &Topic::Connection,
            )?;
            let will = Connection {
                header: Header {
                    header_id: 0,
                    timestamp: Utc::now(),
                    version: self.context.options.version.as_str().to_string(),
                    manufacturer: subject.manufacturer.clone(),
                    serial_number: subject.serial_number.clone(),
                },
                connection_state: ConnectionState::ConnectionBroken,
            };
            builder.will_message(mqtt::Message::new_retained(
                topic,
                serde_json::to_vec(&will)?,
                mqtt::QOS_1,
            ));
        }
        Ok(builder.finalize())
    }

    fn mqtt_handle(&self) -> Result<mqtt::AsyncClient, ClientError> {
        self.context
            .state
            .lock()
            .unwrap()
            .mqtt
            .clone()
            .ok_or(ClientError::NotStarted)
    }

    /// Batch-resubscribes every retained broker topic; runs before the first
    /// queued publish drains after a (re)connect.
    async fn materialize_subscriptions(&self) -> Result<(), ClientError> {
        let (topics, mqtt_client) = {
            let state = self.context.state.lock().unwrap();
            (state.subscriptions.broker_topics(), state.mqtt.clone())
        };
        if topics.is_empty() {
            return Ok(());
        }
        if let Some(mqtt_client) = mqtt_client {
            debug!(count = topics.len(), "resubscribing retained broker topics");
            let qos = vec![mqtt::QOS_1; topics.len()];
            mqtt_client.subscribe_many(&topics, &qos).await?;
        }
        Ok(())
    }

    async fn drain_offline_queue(&self) {
        loop {
            let (queued, mqtt_client) = {
                let mut state = self.context.state.lock().unwrap();
                if state.lifecycle != TransportState::Online {
                    return;
                }
                (state.offline_queue.pop_front(), state.mqtt.clone())
            };
            let (Some(queued), Some(mqtt_client)) = (queued, mqtt_client) else {
                return;
            };
            let message = if queued.retain {
                mqtt::Message::new_retained(&queued.broker_topic, queued.payload, mqtt::QOS_1)
            } else {
                mqtt::Message::new(&queued.broker_topic, queued.payload, mqtt::QOS_1)
            };
            if let Err(e) = mqtt_client.publish(message).await {
                error!(topic = %queued.broker_topic, error = %e, "failed to drain queued publish");
            }
        }
    }

    /// Reconnect loop run by the dispatcher when the broker stream signals a
    /// lost connection. Returns false when the dispatcher should exit.
    async fn handle_connection_loss(&self) -> bool {
        let reconnect_period = {
            let mut state = self.context.state.lock().unwrap();
            if state.lifecycle != TransportState::Online {
                return false;
            }
            state.lifecycle = TransportState::Offline;
            self.context.options.transport.reconnect_period
        };
        self.notify_observer();
        if reconnect_period.is_zero() {
            warn!("broker connection lost and reconnection is disabled");
            return false;
        }

        loop {
            tokio::time::sleep(reconnect_period).await;
            let mqtt_client = {
                let state = self.context.state.lock().unwrap();
                if state.lifecycle != TransportState::Offline {
                    return false;
                }
                state.mqtt.clone()
            };
            let Some(mqtt_client) = mqtt_client else {
                return false;
            };
            match mqtt_client.reconnect().await {
                Ok(_) => {
                    {
                        let mut state = self.context.state.lock().unwrap();
                        state.lifecycle = TransportState::Online;
                    }
                    self.notify_observer();
                    if let Err(e) = self.materialize_subscriptions().await {
                        error!(error = %e, "resubscription after reconnect failed");
                    }
                    self.drain_offline_queue().await;
                    return true;
                }
                Err(e) => {
                    debug!(error = %e, "reconnect attempt failed");
                }
            }
        }
    }

    fn notify_observer(&self) {
        let (observer, lifecycle) = {
            let state = self.context.state.lock().unwrap();
            (state.observer.clone(), state.lifecycle)
        };
        if let Some(observer) = observer {
            observer(lifecycle);
        }
    }
}

impl ClientContext {
    /// Inbound dispatch: parse, derive the subject, resolve subscriptions,
    /// validate, then invoke every matching handler sequentially. One message
    /// is fully dispatched before the next is taken from the stream.
    fn dispatch(&self, message: mqtt::Message) {
        let raw: Value = match serde_json::from_slice(message.payload()) {
            Ok(value) => value,
            Err(e) => {
                warn!(topic = message.topic(), error = %e, "dropping non-JSON payload");
                return;
            }
        };
        let Some(parsed) = self.format.parse(
            message.topic(),
            &self.options.interface_name,
            self.options.version.major_level(),
        ) else {
            warn!(topic = message.topic(), "dropping message on unrecognized topic");
            return;
        };

        // Topic levels win; the payload header fills in subject components
        // the topic format does not carry.
        let manufacturer = parsed.manufacturer.or_else(|| {
            raw.get("manufacturer")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        let serial_number = parsed.serial_number.or_else(|| {
            raw.get("serialNumber")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        let (Some(manufacturer), Some(serial_number)) = (manufacturer, serial_number) else {
            warn!(topic = message.topic(), "dropping message without derivable subject");
            return;
        };
        let subject = AgvId {
            manufacturer,
            serial_number,
        };

        let (handlers, extension_validator) = {
            let state = self.state.lock().unwrap();
            let handlers = state.subscriptions.find(
                parsed.topic.name(),
                &subject.manufacturer,
                &subject.serial_number,
            );
            let validator = match &parsed.topic {
                Topic::Extension(name) => state
                    .extensions
                    .get(name)
                    .and_then(|spec| spec.validator.clone()),
                _ => None,
            };
            (handlers, validator)
        };
        if handlers.is_empty() {
            return;
        }

        let validation = match &parsed.topic {
            Topic::Extension(_) => match &extension_validator {
                Some(validator) => validator(&raw).map(|_| Payload::Extension(raw.clone())),
                None => Ok(Payload::Extension(raw.clone())),
            },
            topic => validate_core_payload(topic, self.options.version, &raw),
        };
        let payload = match validation {
            Ok(payload) => Some(payload),
            Err(e) if self.options.validate_inbound => {
                warn!(topic = message.topic(), error = %e, "dropping invalid inbound payload");
                return;
            }
            Err(_) => None,
        };

        let envelope = InboundEnvelope {
            topic: parsed.topic,
            subject,
            payload,
            raw: Arc::new(raw),
        };
        for (id, handler) in handlers {
            debug!(subscription = %id, topic = %envelope.topic, "dispatching inbound message");
            handler(envelope.clone());
        }
    }
}
