//! heatsrv configuration
//!
//! Sources, lowest priority first: built-in defaults, YAML file, `HEATSRV_`
//! environment variables (`HEATSRV_MQTT__SERVER_URI=mqtt://broker:1883`).

use common::serde_helpers::{
    deserialize_u16_flexible, deserialize_u16_vec_flexible, serialize_u16_hex,
    serialize_u16_vec_hex,
};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{HeatSrvError, Result};
use crate::protocols::elster::{ELSTER_ADDRESS_MAX, ELSTER_INDEX_MAX};
use crate::transport::SlcanConfig;

/// Default configuration file locations, first match wins
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["config/heatsrv.yaml", "heatsrv.yaml"];

/// Environment variable prefix
pub const ENV_PREFIX: &str = "HEATSRV_";

/// Complete service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub can: CanConfig,
    pub elster: ElsterConfig,
    pub mqtt: MqttConfig,
    pub polling: PollingConfig,
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,
    /// Log level
    pub log_level: String,
    /// Directory for daily rolling log files
    pub log_dir: Option<PathBuf>,
    /// Write log files as JSON lines
    pub log_json: bool,
}

/// CAN adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanConfig {
    /// Serial device of the USBtin
    pub port: String,
    pub baud_rate: u32,
    /// Bus bitrate in kbit/s
    pub bitrate_kbps: u32,
    /// Our own bus address
    #[serde(
        deserialize_with = "deserialize_u16_flexible",
        serialize_with = "serialize_u16_hex"
    )]
    pub sender_id: u16,
    /// Inbound frame buffer
    pub channel_capacity: usize,
    pub write_timeout_ms: u64,
}

/// Elster protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElsterConfig {
    pub request_timeout_ms: u64,
    /// Distinct keys kept in the passive telegram log
    pub passive_capacity: usize,
    /// Period of the passive log report, 0 disables it
    pub passive_report_interval_ms: u64,
    pub scan: ScanConfig,
}

/// Module scan configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Candidate receiver addresses
    #[serde(
        deserialize_with = "deserialize_u16_vec_flexible",
        serialize_with = "serialize_u16_vec_hex"
    )]
    pub receivers: Vec<u16>,
    /// Parameters every module answers
    #[serde(
        deserialize_with = "deserialize_u16_vec_flexible",
        serialize_with = "serialize_u16_vec_hex"
    )]
    pub probe_indices: Vec<u16>,
    pub timeout_ms: u64,
}

/// MQTT configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker address, `mqtt://host:port`
    pub server_uri: String,
    pub client_id: String,
    /// Topic root; readings go to `<topic>/<name>`
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
    /// Delay between reconnect attempts
    pub reconnect_interval_ms: u64,
    /// Multiplier per failed attempt, 1.0 keeps the interval fixed
    pub reconnect_backoff: f64,
    pub reconnect_max_delay_ms: u64,
    /// Spread reconnect attempts by ±25%
    pub reconnect_jitter: bool,
    /// How often the drain loop rechecks the connection while idle
    pub wake_interval_ms: u64,
    /// rumqttc request channel capacity
    pub channel_capacity: usize,
}

/// One value to poll and publish
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadingConfig {
    /// Reading name, also the topic suffix
    pub name: String,
    #[serde(
        deserialize_with = "deserialize_u16_flexible",
        serialize_with = "serialize_u16_hex"
    )]
    pub receiver: u16,
    #[serde(
        deserialize_with = "deserialize_u16_flexible",
        serialize_with = "serialize_u16_hex"
    )]
    pub index: u16,
}

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
    /// Period of forced republishing, 0 disables it
    pub refresh_interval_ms: u64,
    pub readings: Vec<ReadingConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "heatsrv".to_string(),
            log_level: "info".to_string(),
            log_dir: None,
            log_json: false,
        }
    }
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 115_200,
            bitrate_kbps: 20,
            sender_id: 0x680,
            channel_capacity: 256,
            write_timeout_ms: 500,
        }
    }
}

impl Default for ElsterConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 3000,
            passive_capacity: 512,
            passive_report_interval_ms: 3_600_000,
            scan: ScanConfig::default(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            receivers: vec![
                0x180, 0x280, 0x301, 0x302, 0x303, 0x400, 0x480, 0x500, 0x580, 0x601, 0x602,
                0x603, 0x700, 0x780,
            ],
            probe_indices: vec![0x000b, 0x0199],
            timeout_ms: 500,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            server_uri: "mqtt://localhost:1883".to_string(),
            client_id: "heatsrv".to_string(),
            topic: "heating".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            connect_timeout_ms: 5000,
            reconnect_interval_ms: 5000,
            reconnect_backoff: 1.0,
            reconnect_max_delay_ms: 60_000,
            reconnect_jitter: false,
            wake_interval_ms: 1000,
            channel_capacity: 64,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            refresh_interval_ms: 3_600_000,
            readings: Vec::new(),
        }
    }
}

impl CanConfig {
    pub fn slcan(&self) -> SlcanConfig {
        SlcanConfig {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            bitrate_kbps: self.bitrate_kbps,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            ..SlcanConfig::default()
        }
    }
}

impl ElsterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn passive_report_interval(&self) -> Option<Duration> {
        (self.passive_report_interval_ms > 0)
            .then(|| Duration::from_millis(self.passive_report_interval_ms))
    }
}

impl ScanConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl MqttConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn wake_interval(&self) -> Duration {
        Duration::from_millis(self.wake_interval_ms)
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_ms > 0).then(|| Duration::from_millis(self.refresh_interval_ms))
    }
}

impl AppConfig {
    /// Load configuration from defaults, an optional YAML file and the environment
    ///
    /// Without an explicit path the first existing entry of
    /// [`DEFAULT_CONFIG_PATHS`] is used, if any.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let yaml_path = match path {
            Some(path) if !path.exists() => {
                return Err(HeatSrvError::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            },
            Some(path) => Some(path.to_path_buf()),
            None => DEFAULT_CONFIG_PATHS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists()),
        };

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = &yaml_path {
            debug!("Loading configuration from {}", path.display());
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: AppConfig = figment.extract()?;
        Ok(config)
    }

    /// Reject values the gateway cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(HeatSrvError::Config(msg));

        if self.service.name.is_empty() {
            return fail("Service name cannot be empty".to_string());
        }
        if self.can.port.is_empty() {
            return fail("CAN port cannot be empty".to_string());
        }
        if crate::transport::slcan::bitrate_code(self.can.bitrate_kbps).is_none() {
            return fail(format!(
                "Unsupported CAN bitrate {} kbit/s",
                self.can.bitrate_kbps
            ));
        }
        if self.can.sender_id > ELSTER_ADDRESS_MAX {
            return fail(format!("sender_id 0x{:x} exceeds 0x7ff", self.can.sender_id));
        }
        if self.can.channel_capacity == 0 {
            return fail("can.channel_capacity must be > 0".to_string());
        }

        if self.elster.request_timeout_ms == 0 {
            return fail("elster.request_timeout_ms must be > 0".to_string());
        }
        if self.elster.passive_capacity == 0 {
            return fail("elster.passive_capacity must be > 0".to_string());
        }
        if self.elster.scan.timeout_ms == 0 {
            return fail("elster.scan.timeout_ms must be > 0".to_string());
        }
        if self.elster.scan.probe_indices.is_empty() {
            return fail("elster.scan.probe_indices cannot be empty".to_string());
        }
        if let Some(receiver) = self
            .elster
            .scan
            .receivers
            .iter()
            .find(|r| **r > ELSTER_ADDRESS_MAX)
        {
            return fail(format!("scan receiver 0x{:x} exceeds 0x7ff", receiver));
        }

        if self.mqtt.server_uri.is_empty() {
            return fail("mqtt.server_uri cannot be empty".to_string());
        }
        crate::publisher::BrokerAddress::parse(&self.mqtt.server_uri)?;
        if self.mqtt.topic.is_empty() {
            return fail("mqtt.topic cannot be empty".to_string());
        }
        if self.mqtt.client_id.is_empty() {
            return fail("mqtt.client_id cannot be empty".to_string());
        }
        if self.mqtt.reconnect_interval_ms == 0 || self.mqtt.wake_interval_ms == 0 {
            return fail("mqtt reconnect and wake intervals must be > 0".to_string());
        }
        if self.mqtt.channel_capacity == 0 {
            return fail("mqtt.channel_capacity must be > 0".to_string());
        }
        if self.mqtt.connect_timeout_ms == 0 {
            return fail("mqtt.connect_timeout_ms must be > 0".to_string());
        }
        if self.mqtt.reconnect_backoff.is_nan() || self.mqtt.reconnect_backoff < 1.0 {
            return fail("mqtt.reconnect_backoff must be >= 1.0".to_string());
        }

        if self.polling.interval_ms == 0 {
            return fail("polling.interval_ms must be > 0".to_string());
        }
        for reading in &self.polling.readings {
            if reading.name.is_empty() {
                return fail("reading name cannot be empty".to_string());
            }
            if reading.receiver > ELSTER_ADDRESS_MAX || reading.index > ELSTER_INDEX_MAX {
                return fail(format!(
                    "reading '{}' addresses 0x{:x}/0x{:04x}, outside the Elster code space",
                    reading.name, reading.receiver, reading.index
                ));
            }
        }
        let mut names: Vec<_> = self.polling.readings.iter().map(|r| &r.name).collect();
        names.sort();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            return fail(format!("duplicate reading name '{}'", pair[0]));
        }

        Ok(())
    }

    /// Effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.can.sender_id, 0x680);
        assert_eq!(config.elster.request_timeout(), Duration::from_secs(3));
        assert_eq!(config.mqtt.reconnect_interval_ms, 5000);
        assert_eq!(config.mqtt.wake_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
can:
  port: /dev/ttyUSB1
  sender_id: "0x700"
elster:
  scan:
    receivers: [0x180, "0x181"]
mqtt:
  server_uri: mqtt://broker.local:1884
  topic: home/heatpump
polling:
  readings:
    - name: OutdoorTemp
      receiver: "0x180"
      index: "0x000c"
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        config.validate().unwrap();
        assert_eq!(config.can.port, "/dev/ttyUSB1");
        assert_eq!(config.can.sender_id, 0x700);
        assert_eq!(config.elster.scan.receivers, vec![0x180, 0x181]);
        // untouched sections keep their defaults
        assert_eq!(config.elster.scan.probe_indices, vec![0x000b, 0x0199]);
        assert_eq!(config.mqtt.topic, "home/heatpump");
        assert_eq!(
            config.polling.readings,
            vec![ReadingConfig {
                name: "OutdoorTemp".to_string(),
                receiver: 0x180,
                index: 0x000c,
            }]
        );
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/heatsrv.yaml"))).unwrap_err();
        assert!(matches!(err, HeatSrvError::Config(_)));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = AppConfig::default();
        config.mqtt.topic.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.mqtt.server_uri = "https://broker".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.mqtt.channel_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.can.sender_id = 0x800;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.elster.passive_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.can.bitrate_kbps = 33;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        let reading = ReadingConfig {
            name: "Dup".to_string(),
            receiver: 0x180,
            index: 1,
        };
        config.polling.readings = vec![reading.clone(), reading];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_output_round_trips_through_loader() {
        let mut config = AppConfig::default();
        config.polling.readings.push(ReadingConfig {
            name: "Pressure".to_string(),
            receiver: 0x180,
            index: 0x0010,
        });
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("0x680"));

        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        let loaded = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(loaded.polling.readings, config.polling.readings);
        assert_eq!(loaded.can.sender_id, 0x680);
    }
}
