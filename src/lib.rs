//! NB-IoT pulse-sensor node: samples heart rate, aggregates it into
//! fixed windows and publishes max/mid/min over MQTT through a SIM7020
//! modem.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod mqtt;
pub mod parser;
pub mod protocol;
pub mod pulse;
pub mod scheduler;
pub mod telemetry;
pub mod uart;

#[cfg(test)]
mod testing;
