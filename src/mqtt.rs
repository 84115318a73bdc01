use log::{debug, info, warn};
use std::io::{Read, Write};
use std::time::Duration;

use crate::config::{MQTT_BUFFER_SIZE, MQTT_COMMAND_TIMEOUT_MS, MqttConfig, NodeConfig};
use crate::connectivity::ConnectivityManager;
use crate::error::{AtError, UplinkError};
use crate::parser::{parse_cmqdiscon, parse_cmqnew};
use crate::protocol::UplinkMessage;
use crate::uart::AtModem;

/// Broker session on top of the modem's built-in MQTT client.
pub struct MqttUplink {
    config: MqttConfig,
    timeout: Duration,
    session: Option<u8>,
    session_epoch: u32,
}

impl MqttUplink {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            config: config.mqtt.clone(),
            timeout: Duration::from_millis(MQTT_COMMAND_TIMEOUT_MS),
            session: None,
            session_epoch: 0,
        }
    }

    pub fn is_session_open(&self) -> bool {
        self.session.is_some()
    }

    /// Publish one message, at most once. Never re-attaches the network;
    /// only opens a broker session when none is open.
    pub fn publish<T: Read + Write>(
        &mut self,
        conn: &mut ConnectivityManager<T>,
        message: &UplinkMessage,
    ) -> Result<(), UplinkError> {
        let epoch = conn.link_epoch();
        let modem = conn.channel()?;
        if self.session.is_some() && self.session_epoch != epoch {
            debug!("Network re-attached since the MQTT session was opened");
            self.session = None;
        }
        self.session_epoch = epoch;

        let result = self.publish_on(modem, message);

        if let Err(UplinkError::Transport(e)) = &result {
            warn!("Publish to '{}' failed on transport: {e}", message.topic);
            self.session = None;
            conn.mark_link_lost();
        }
        result
    }

    /// Best-effort close of the broker session.
    pub fn disconnect<T: Read + Write>(&mut self, conn: &mut ConnectivityManager<T>) {
        let Some(id) = self.session.take() else {
            return;
        };
        if let Ok(modem) = conn.channel()
            && let Err(e) = modem.command(&format!("AT+CMQDISCON={id}"))
        {
            debug!("MQTT disconnect failed: {e}");
        }
    }

    fn publish_on<T: Read + Write>(
        &mut self,
        modem: &mut AtModem<T>,
        message: &UplinkMessage,
    ) -> Result<(), UplinkError> {
        self.note_dropped_session(modem);

        let id = match self.session {
            Some(id) => id,
            None => self.open_session(modem)?,
        };

        let hex = message.hex_payload();
        let cmd = format!(
            "AT+CMQPUB={},\"{}\",{},{},0,{},\"{}\"",
            id,
            message.topic,
            u8::from(message.qos),
            message.retained as u8,
            hex.len(),
            hex
        );

        let result = modem
            .command_with_timeout(&cmd, self.timeout)
            .map_err(|e| broker_error(e, &format!("publish to '{}'", message.topic)));
        self.note_dropped_session(modem);
        result?;

        debug!("Published '{}' to {}", message.payload, message.topic);
        Ok(())
    }

    fn open_session<T: Read + Write>(&mut self, modem: &mut AtModem<T>) -> Result<u8, UplinkError> {
        let new_cmd = format!(
            "AT+CMQNEW=\"{}\",\"{}\",{},{}",
            self.config.broker, self.config.port, MQTT_COMMAND_TIMEOUT_MS, MQTT_BUFFER_SIZE
        );
        let lines = modem
            .command_with_timeout(&new_cmd, self.timeout)
            .map_err(|e| broker_error(e, "broker connection"))?;
        let id = lines
            .iter()
            .find_map(|l| parse_cmqnew(l))
            .ok_or_else(|| AtError::Malformed {
                command: "AT+CMQNEW".to_string(),
                line: lines.join(" | "),
            })?;

        let con_cmd = format!(
            "AT+CMQCON={},3,\"{}\",{},1,0,\"{}\",\"{}\"",
            id,
            self.config.client_id,
            self.config.keepalive_secs,
            self.config.username,
            self.config.password
        );
        modem
            .command_with_timeout(&con_cmd, self.timeout)
            .map_err(|e| broker_error(e, "broker login"))?;

        info!(
            "MQTT session {id} open to {}:{}",
            self.config.broker, self.config.port
        );
        self.session = Some(id);
        Ok(id)
    }

    fn note_dropped_session<T: Read + Write>(&mut self, modem: &mut AtModem<T>) {
        for line in modem.take_unsolicited() {
            if let Some(id) = parse_cmqdiscon(&line)
                && self.session == Some(id)
            {
                warn!("Broker dropped MQTT session {id}");
                self.session = None;
            }
        }
    }
}

// A modem-side rejection of an MQTT command is the broker's verdict
fn broker_error(err: AtError, what: &str) -> UplinkError {
    match err {
        AtError::Rejected { detail, .. } => {
            UplinkError::Protocol(format!("{what} rejected: {detail}"))
        }
        other => other.into(),
    }
}
