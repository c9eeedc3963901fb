use std::fmt;

use crate::agv_id::{is_topic_safe, AgvSubject};
use crate::error::ClientError;

/// MQTT topics must not exceed 65535 UTF-8 bytes.
const MAX_BROKER_TOPIC_BYTES: usize = 65_535;

/// Logical VDA 5050 communication topic. The `Extension` variant carries
/// custom topics registered alongside the core ones.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Connection,
    Order,
    InstantActions,
    State,
    Visualization,
    Factsheet,
    Extension(String),
}

impl Topic {
    pub fn name(&self) -> &str {
        match self {
            Topic::Connection => "connection",
            Topic::Order => "order",
            Topic::InstantActions => "instantActions",
            Topic::State => "state",
            Topic::Visualization => "visualization",
            Topic::Factsheet => "factsheet",
            Topic::Extension(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Topic {
        match name {
            "connection" => Topic::Connection,
            "order" => Topic::Order,
            "instantActions" => Topic::InstantActions,
            "state" => Topic::State,
            "visualization" => Topic::Visualization,
            "factsheet" => Topic::Factsheet,
            other => Topic::Extension(other.to_string()),
        }
    }

    pub fn is_extension(&self) -> bool {
        matches!(self, Topic::Extension(_))
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if is_topic_safe(self.name()) {
            Ok(())
        } else {
            Err(ClientError::InvalidTopic(format!(
                "topic name {:?} is empty or not usable as an MQTT level",
                self.name()
            )))
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One compiled level of a topic format template.
#[derive(Clone, Debug, PartialEq, Eq)]
enum FormatLevel {
    Literal(String),
    Interface,
    MajorVersion,
    Manufacturer,
    SerialNumber,
    TopicName,
}

/// Broker topic structure parsed out of a concrete inbound topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedTopic {
    pub topic: Topic,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
}

/// Precompiled topic format. The template is a `/`-separated list of levels
/// where a level is either literal text or exactly one of the placeholders
/// `{interface}`, `{majorVersion}`, `{manufacturer}`, `{serialNumber}`,
/// `{topic}`. Each placeholder may appear at most once and `{topic}` is
/// mandatory; the default format is
/// `{interface}/{majorVersion}/{manufacturer}/{serialNumber}/{topic}`.
#[derive(Clone, Debug)]
pub struct TopicFormat {
    levels: Vec<FormatLevel>,
}

pub const DEFAULT_TOPIC_FORMAT: &str =
    "{interface}/{majorVersion}/{manufacturer}/{serialNumber}/{topic}";

impl Default for TopicFormat {
    fn default() -> Self {
        TopicFormat::compile(DEFAULT_TOPIC_FORMAT).expect("default topic format compiles")
    }
}

impl TopicFormat {
    pub fn compile(template: &str) -> Result<Self, ClientError> {
        let mut levels = Vec::new();
        for raw in template.split('/') {
            let level = match raw {
                "{interface}" => FormatLevel::Interface,
                "{majorVersion}" => FormatLevel::MajorVersion,
                "{manufacturer}" => FormatLevel::Manufacturer,
                "{serialNumber}" => FormatLevel::SerialNumber,
                "{topic}" => FormatLevel::TopicName,
                other if other.contains('{') || other.contains('}') => {
                    return Err(ClientError::InvalidTopic(format!(
                        "placeholder must occupy a full topic level, got {:?}",
                        other
                    )));
                }
                other => FormatLevel::Literal(other.to_string()),
            };
            if !matches!(level, FormatLevel::Literal(_)) && levels.contains(&level) {
                return Err(ClientError::InvalidTopic(format!(
                    "placeholder {:?} appears more than once in topic format",
                    raw
                )));
            }
            levels.push(level);
        }
        if !levels.contains(&FormatLevel::TopicName) {
            return Err(ClientError::InvalidTopic(
                "topic format must contain the {topic} placeholder".to_string(),
            ));
        }
        Ok(TopicFormat { levels })
    }

    /// Materializes a broker topic (or subscription filter). Unset subject
    /// components render as the single-level wildcard `+`.
    pub fn broker_topic(
        &self,
        interface: &str,
        major_version: &str,
        subject: &AgvSubject,
        topic: &Topic,
    ) -> Result<String, ClientError> {
        topic.validate()?;
        subject.validate()?;
        let mut out = String::new();
        for (i, level) in self.levels.iter().enumerate() {
            if i > 0 {
                out.push('/');
            }
            match level {
                FormatLevel::Literal(text) => out.push_str(text),
                FormatLevel::Interface => out.push_str(interface),
                FormatLevel::MajorVersion => out.push_str(major_version),
                FormatLevel::Manufacturer => {
                    out.push_str(subject.manufacturer.as_deref().unwrap_or("+"))
                }
                FormatLevel::SerialNumber => {
                    out.push_str(subject.serial_number.as_deref().unwrap_or("+"))
                }
                FormatLevel::TopicName => out.push_str(topic.name()),
            }
        }
        if out.len() > MAX_BROKER_TOPIC_BYTES {
            return Err(ClientError::InvalidTopic(format!(
                "broker topic exceeds {} bytes",
                MAX_BROKER_TOPIC_BYTES
            )));
        }
        Ok(out)
    }

    /// Parses a concrete inbound broker topic. Returns `None` when the topic
    /// does not belong to this format, interface, or protocol major version.
    /// Subject components come back as `None` when the format carries no
    /// placeholder for them; the payload header fills the gap at dispatch.
    pub fn parse(
        &self,
        broker_topic: &str,
        interface: &str,
        major_version: &str,
    ) -> Option<ParsedTopic> {
        let parts: Vec<&str> = broker_topic.split('/').collect();
        if parts.len() != self.levels.len() {
            return None;
        }
        let mut topic = None;
        let mut manufacturer = None;
        let mut serial_number = None;
        for (level, part) in self.levels.iter().zip(parts) {
            match level {
                FormatLevel::Literal(text) if text != part => return None,
                FormatLevel::Literal(_) => {}
                FormatLevel::Interface if part != interface => return None,
                FormatLevel::Interface => {}
                FormatLevel::MajorVersion if part != major_version => return None,
                FormatLevel::MajorVersion => {}
                FormatLevel::Manufacturer if part != "+" => {
                    manufacturer = Some(part.to_string());
                }
                FormatLevel::Manufacturer => {}
                FormatLevel::SerialNumber if part != "+" => {
                    serial_number = Some(part.to_string());
                }
                FormatLevel::SerialNumber => {}
                FormatLevel::TopicName => topic = Some(Topic::from_name(part)),
            }
        }
        Some(ParsedTopic {
            topic: topic?,
            manufacturer,
            serial_number,
        })
    }
}
