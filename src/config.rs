use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::ConfigError;
use crate::protocol::Qos;

// Serial port configuration
pub const MODEM_BAUD_RATE: u32 = 115_200;
pub const SENSOR_BAUD_RATE: u32 = 115_200;
pub const SERIAL_TIMEOUT_MS: u64 = 100;
pub const AT_COMMAND_TIMEOUT_MS: u64 = 2_000;
pub const INTER_COMMAND_DELAY_MS: u64 = 100;

// NB-IoT carrier (Taiwan Mobile)
pub const DEFAULT_APN: &str = "twm.nbiot";
pub const DEFAULT_BAND: u8 = 28;
pub const ATTACH_TIMEOUT_MS: u64 = 60_000;
pub const REGISTRATION_POLL_MS: u64 = 1_000;

// MQTT broker
pub const DEFAULT_BROKER: &str = "io.adafruit.com";
pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_USERNAME: &str = "<YOUR USERNAME>";
pub const DEFAULT_PASSWORD: &str = "<YOUR AIO KEY>";
pub const DEFAULT_CLIENT_ID: &str = "pulse-uplink";
pub const MQTT_KEEPALIVE_SECS: u16 = 600;
pub const MQTT_BUFFER_SIZE: u16 = 1024;
pub const MQTT_COMMAND_TIMEOUT_MS: u64 = 12_000;

// Sampling
pub const UPLOAD_INTERVAL_MS: u64 = 60_000;
pub const SAMPLE_PERIOD_MS: u64 = 2;
pub const MAX_WINDOW_SAMPLES: usize = 512;
pub const DEFAULT_BEAT_THRESHOLD: u16 = 550;
pub const MIN_PLAUSIBLE_BPM: f32 = 30.0;
pub const MAX_PLAUSIBLE_BPM: f32 = 220.0;

// Attach retry policy
pub const BACKOFF_INITIAL_MS: u64 = 1_000;
pub const BACKOFF_MAX_MS: u64 = 60_000;
pub const MAX_ATTACH_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    pub baud_rate: u32,
    pub apn: String,
    pub band: u8,
    pub command_timeout_ms: u64,
    pub attach_timeout_ms: u64,
    /// Log every AT line sent to and received from the modem.
    pub dump_at_commands: bool,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            baud_rate: MODEM_BAUD_RATE,
            apn: DEFAULT_APN.to_string(),
            band: DEFAULT_BAND,
            command_timeout_ms: AT_COMMAND_TIMEOUT_MS,
            attach_timeout_ms: ATTACH_TIMEOUT_MS,
            dump_at_commands: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keepalive_secs: u16,
    /// Topic for the window maximum. `None` derives `<username>/feeds/pulsesensor.max-hr`.
    pub max_hr_topic: Option<String>,
    pub mid_hr_topic: Option<String>,
    pub min_hr_topic: Option<String>,
    pub qos: Qos,
    pub retained: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: DEFAULT_BROKER.to_string(),
            port: DEFAULT_BROKER_PORT,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            keepalive_secs: MQTT_KEEPALIVE_SECS,
            max_hr_topic: None,
            mid_hr_topic: None,
            min_hr_topic: None,
            qos: Qos::AtMostOnce,
            retained: false,
        }
    }
}

impl MqttConfig {
    fn feed_topic(&self, feed: &str) -> String {
        format!("{}/feeds/pulsesensor.{}", self.username, feed)
    }

    pub fn max_hr_topic(&self) -> String {
        self.max_hr_topic
            .clone()
            .unwrap_or_else(|| self.feed_topic("max-hr"))
    }

    pub fn mid_hr_topic(&self) -> String {
        self.mid_hr_topic
            .clone()
            .unwrap_or_else(|| self.feed_topic("mid-hr"))
    }

    pub fn min_hr_topic(&self) -> String {
        self.min_hr_topic
            .clone()
            .unwrap_or_else(|| self.feed_topic("min-hr"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub sensor_baud_rate: u32,
    pub sample_period_ms: u64,
    pub upload_interval_ms: u64,
    pub beat_threshold: u16,
    pub min_bpm: f32,
    pub max_bpm: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sensor_baud_rate: SENSOR_BAUD_RATE,
            sample_period_ms: SAMPLE_PERIOD_MS,
            upload_interval_ms: UPLOAD_INTERVAL_MS,
            beat_threshold: DEFAULT_BEAT_THRESHOLD,
            min_bpm: MIN_PLAUSIBLE_BPM,
            max_bpm: MAX_PLAUSIBLE_BPM,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Extra random delay as a fraction of the base delay, in `[0, 1]`.
    pub jitter: f64,
    pub max_attach_attempts: u32,
    /// Keep one window whose upload failed and retry it on the next tick.
    pub retain_failed_window: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: BACKOFF_INITIAL_MS,
            max_backoff_ms: BACKOFF_MAX_MS,
            jitter: 0.1,
            max_attach_attempts: MAX_ATTACH_ATTEMPTS,
            retain_failed_window: false,
        }
    }
}

/// Node configuration, loaded once at startup and shared by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    /// Verbose diagnostics on the debug console.
    pub debug: bool,
    pub modem: ModemConfig,
    pub mqtt: MqttConfig,
    pub sampling: SamplingConfig,
    pub retry: RetryConfig,
}

impl NodeConfig {
    /// Load configuration from JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.modem.apn.trim().is_empty() {
            return invalid("modem.apn must not be empty");
        }
        if self.mqtt.broker.trim().is_empty() {
            return invalid("mqtt.broker must not be empty");
        }
        if self.mqtt.client_id.trim().is_empty() {
            return invalid("mqtt.client_id must not be empty");
        }
        if self.modem.command_timeout_ms == 0 || self.modem.attach_timeout_ms == 0 {
            return invalid("modem timeouts must be non-zero");
        }
        if self.sampling.sample_period_ms == 0 || self.sampling.upload_interval_ms == 0 {
            return invalid("sampling intervals must be non-zero");
        }
        if self.sampling.min_bpm >= self.sampling.max_bpm {
            return invalid("sampling.min_bpm must be below sampling.max_bpm");
        }
        if self.retry.initial_backoff_ms == 0
            || self.retry.initial_backoff_ms > self.retry.max_backoff_ms
        {
            return invalid("retry.initial_backoff_ms must be in 1..=max_backoff_ms");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid("retry.jitter must be within [0, 1]");
        }
        if self.retry.max_attach_attempts == 0 {
            return invalid("retry.max_attach_attempts must be at least 1");
        }
        Ok(())
    }
}
