use serde::{Deserialize, Serialize};

use crate::config::MqttConfig;
use crate::telemetry::HeartRateStats;

/// MQTT delivery guarantee, serialized as its numeric level.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(format!("invalid QoS level {other}")),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        qos as u8
    }
}

/// The three statistics published per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HrMetric {
    Max,
    Mid,
    Min,
}

impl HrMetric {
    pub const ALL: [HrMetric; 3] = [HrMetric::Max, HrMetric::Mid, HrMetric::Min];

    pub fn topic(&self, mqtt: &MqttConfig) -> String {
        match self {
            HrMetric::Max => mqtt.max_hr_topic(),
            HrMetric::Mid => mqtt.mid_hr_topic(),
            HrMetric::Min => mqtt.min_hr_topic(),
        }
    }

    pub fn value(&self, stats: &HeartRateStats) -> f32 {
        match self {
            HrMetric::Max => stats.max,
            HrMetric::Mid => stats.mid,
            HrMetric::Min => stats.min,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UplinkMessage {
    pub topic: String,
    pub payload: String,
    pub qos: Qos,
    pub retained: bool,
}

impl UplinkMessage {
    /// Payload as the hex string the modem's publish command expects.
    pub fn hex_payload(&self) -> String {
        hex::encode_upper(self.payload.as_bytes())
    }
}

/// Build the max / mid / min messages for a closed window.
pub fn build_messages(stats: &HeartRateStats, mqtt: &MqttConfig) -> Vec<UplinkMessage> {
    HrMetric::ALL
        .iter()
        .map(|metric| UplinkMessage {
            topic: metric.topic(mqtt),
            payload: format_value(metric.value(stats)),
            qos: mqtt.qos,
            retained: mqtt.retained,
        })
        .collect()
}

// Rounded to one decimal; whole results go out without a fraction
fn format_value(value: f32) -> String {
    let rounded = (value * 10.0).round() / 10.0;
    if rounded.fract() == 0.0 {
        format!("{}", rounded as i64)
    } else {
        format!("{:.1}", rounded)
    }
}
