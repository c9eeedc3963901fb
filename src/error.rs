use crate::protocol::validation::ValidationError;

/// Errors surfaced synchronously or through the async transport operations of
/// the client layer. Protocol-level faults (rejected orders, non-executable
/// actions) never appear here; they travel as error entries inside the
/// published `state` message.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client is not started")]
    NotStarted,
    #[error("client is already started")]
    AlreadyStarted,
    #[error("invalid topic: {0}")]
    InvalidTopic(String),
    #[error("invalid subject: {0}")]
    InvalidSubject(String),
    #[error("topic {topic} is not {direction} for this client role")]
    TopicDirection { topic: String, direction: &'static str },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("transport failure: {0}")]
    Transport(#[from] paho_mqtt::Error),
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("adapter reports api version {actual}, controller requires {expected}")]
    AdapterApiVersion { expected: u32, actual: u32 },
}
