use std::path::Path;
use std::time::Duration;

use config_file::{ConfigFileError, FromConfigFile};
use serde::Deserialize;

use crate::agv_controller::AgvControllerOptions;
use crate::agv_id::AgvId;
use crate::client::{ClientOptions, MqttTransportOptions};
use crate::error::ClientError;
use crate::protocol::ProtocolVersion;

/// Loads a fleet configuration from a TOML file.
pub fn load_config(path: impl AsRef<Path>) -> Result<FleetConfig, ConfigFileError> {
    FleetConfig::from_config_file(path)
}

#[derive(Deserialize, Clone)]
pub struct MqttBrokerConfig {
    pub host: String,
    pub port: String,
    pub vda_interface: String,
    /// Optional topic format template; the default VDA 5050 layout applies
    /// when unset.
    #[serde(default)]
    pub topic_format: Option<String>,
}

#[derive(Deserialize, Clone)]
pub struct VehicleConfig {
    pub manufacturer: String,
    pub serial_number: String,
    /// Protocol version, e.g. "2.0" or "2.0.0".
    pub vda_version: String,
}

#[derive(Deserialize, Clone)]
pub struct ControllerSettings {
    #[serde(default = "default_state_interval_ms")]
    pub publish_state_interval_ms: u64,
    #[serde(default = "default_visualization_interval_ms")]
    pub publish_visualization_interval_ms: u64,
    #[serde(default = "default_final_publish_count")]
    pub final_instant_action_state_change_publish_count: u32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        ControllerSettings {
            publish_state_interval_ms: default_state_interval_ms(),
            publish_visualization_interval_ms: default_visualization_interval_ms(),
            final_instant_action_state_change_publish_count: default_final_publish_count(),
        }
    }
}

fn default_state_interval_ms() -> u64 {
    30_000
}

fn default_visualization_interval_ms() -> u64 {
    1_000
}

fn default_final_publish_count() -> u32 {
    5
}

#[derive(Deserialize, Clone)]
pub struct FleetConfig {
    pub mqtt_broker: MqttBrokerConfig,
    pub vehicle: VehicleConfig,
    #[serde(default)]
    pub controller: ControllerSettings,
}

impl FleetConfig {
    pub fn agv_id(&self) -> Result<AgvId, ClientError> {
        AgvId::new(&self.vehicle.manufacturer, &self.vehicle.serial_number)
    }

    pub fn client_options(&self) -> Result<ClientOptions, ClientError> {
        let version = ProtocolVersion::parse(&self.vehicle.vda_version).ok_or_else(|| {
            ClientError::InvalidSubject(format!(
                "unsupported protocol version {:?}",
                self.vehicle.vda_version
            ))
        })?;
        Ok(ClientOptions {
            interface_name: self.mqtt_broker.vda_interface.clone(),
            version,
            transport: MqttTransportOptions {
                broker_url: format!("tcp://{}:{}", self.mqtt_broker.host, self.mqtt_broker.port),
                topic_format: self.mqtt_broker.topic_format.clone(),
                ..MqttTransportOptions::default()
            },
            ..ClientOptions::default()
        })
    }

    pub fn controller_options(&self) -> AgvControllerOptions {
        AgvControllerOptions {
            publish_state_interval: Duration::from_millis(self.controller.publish_state_interval_ms),
            publish_visualization_interval: Duration::from_millis(
                self.controller.publish_visualization_interval_ms,
            ),
            final_instant_action_state_change_publish_count: self
                .controller
                .final_instant_action_state_change_publish_count,
            factsheet: None,
        }
    }
}
