use log::{debug, info, warn};
use std::io::{Read, Write};
use std::rc::Rc;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::clock::Clock;
use crate::config::{INTER_COMMAND_DELAY_MS, ModemConfig, NodeConfig, REGISTRATION_POLL_MS};
use crate::error::{AtError, UplinkError};
use crate::parser::{RegistrationStatus, SignalQuality, parse_cgatt, parse_cgreg, parse_csq};
use crate::uart::AtModem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Disconnected,
    Attaching,
    Attached,
    Error,
}

/// Owns the modem's serial channel and keeps the NB-IoT attach alive.
pub struct ConnectivityManager<T> {
    modem: AtModem<T>,
    clock: Rc<dyn Clock>,
    config: ModemConfig,
    max_attempts: u32,
    backoff: Backoff,
    state: ConnectivityState,
    attach_attempts: u32,
    link_epoch: u32,
    signal: Option<SignalQuality>,
}

impl<T: Read + Write> ConnectivityManager<T> {
    pub fn new(port: T, clock: Rc<dyn Clock>, config: &NodeConfig) -> Self {
        let modem = AtModem::new(
            port,
            clock.clone(),
            Duration::from_millis(config.modem.command_timeout_ms),
            config.modem.dump_at_commands,
        );
        Self {
            modem,
            clock,
            config: config.modem.clone(),
            max_attempts: config.retry.max_attach_attempts,
            backoff: Backoff::from_config(&config.retry),
            state: ConnectivityState::Disconnected,
            attach_attempts: 0,
            link_epoch: 0,
            signal: None,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn is_online(&self) -> bool {
        self.state == ConnectivityState::Attached
    }

    /// Total attach attempts since startup.
    pub fn attach_attempts(&self) -> u32 {
        self.attach_attempts
    }

    /// Bumped on every successful attach; state tied to an older attach is stale.
    pub fn link_epoch(&self) -> u32 {
        self.link_epoch
    }

    pub fn signal_quality(&self) -> Option<SignalQuality> {
        self.signal
    }

    /// One attach attempt with the configured APN and band.
    pub fn connect(&mut self) -> Result<(), UplinkError> {
        self.state = ConnectivityState::Attaching;
        self.attach_attempts += 1;
        info!(
            "Attaching to NB-IoT network (apn {}, band {}), attempt {}",
            self.config.apn, self.config.band, self.attach_attempts
        );

        match self.attach() {
            Ok(()) => {
                self.state = ConnectivityState::Attached;
                self.link_epoch += 1;
                info!("Network attached");
                Ok(())
            }
            Err(e) => {
                self.state = ConnectivityState::Error;
                warn!("Attach failed: {e}");
                Err(e)
            }
        }
    }

    /// Attach unless already attached, retrying with exponential backoff
    /// until the attempt budget runs out.
    pub fn ensure_connected(&mut self) -> Result<(), UplinkError> {
        if self.is_online() {
            return Ok(());
        }

        let mut last_err = UplinkError::NotConnected;
        for attempt in 1..=self.max_attempts {
            match self.connect() {
                Ok(()) => {
                    self.backoff.reset();
                    return Ok(());
                }
                Err(e) => {
                    last_err = e;
                    if attempt < self.max_attempts {
                        let delay = self.backoff.next_delay();
                        info!("Retrying attach in {:.1}s", delay.as_secs_f64());
                        self.clock.sleep(delay);
                    }
                }
            }
        }

        self.backoff.reset();
        warn!("Giving up on attach after {} attempts", self.max_attempts);
        Err(last_err)
    }

    /// Ask the modem whether the attach still holds. Returns `Ok(false)`
    /// when it does not (or we were not attached to begin with).
    pub fn probe_link(&mut self) -> Result<bool, UplinkError> {
        if !self.is_online() {
            return Ok(false);
        }

        let lines = match self.modem.command("AT+CGATT?") {
            Ok(lines) => lines,
            Err(e) => {
                self.mark_link_lost();
                return Err(e.into());
            }
        };

        if lines.iter().find_map(|l| parse_cgatt(l)) == Some(true) {
            Ok(true)
        } else {
            self.mark_link_lost();
            Ok(false)
        }
    }

    pub fn mark_link_lost(&mut self) {
        if self.state == ConnectivityState::Attached {
            warn!("Network link lost");
            self.state = ConnectivityState::Disconnected;
        }
    }

    /// The AT channel, handed out only while attached.
    pub fn channel(&mut self) -> Result<&mut AtModem<T>, UplinkError> {
        if self.is_online() {
            Ok(&mut self.modem)
        } else {
            Err(UplinkError::NotConnected)
        }
    }

    fn attach(&mut self) -> Result<(), UplinkError> {
        self.modem.handshake()?;

        let commands = vec![
            "ATE0".to_string(),
            "AT+CFUN=0".to_string(),
            format!("AT*MCGDEFCONT=\"IP\",\"{}\"", self.config.apn),
            format!("AT+CBAND={}", self.config.band),
            "AT+CFUN=1".to_string(),
        ];

        for cmd in commands {
            self.modem.command(&cmd)?;
            self.clock
                .sleep(Duration::from_millis(INTER_COMMAND_DELAY_MS));
        }

        self.wait_for_registration()?;

        let lines = self.modem.command("AT+CGATT?")?;
        match lines.iter().find_map(|l| parse_cgatt(l)) {
            Some(true) => {}
            Some(false) => {
                return Err(UplinkError::Network("packet domain not attached".to_string()));
            }
            None => {
                return Err(AtError::Malformed {
                    command: "AT+CGATT?".to_string(),
                    line: lines.join(" | "),
                }
                .into());
            }
        }

        self.signal = self.query_signal();
        Ok(())
    }

    fn wait_for_registration(&mut self) -> Result<(), UplinkError> {
        let started = self.clock.now_ms();

        loop {
            let lines = self.modem.command("AT+CGREG?")?;
            let status = lines
                .iter()
                .find_map(|l| parse_cgreg(l))
                .ok_or_else(|| AtError::Malformed {
                    command: "AT+CGREG?".to_string(),
                    line: lines.join(" | "),
                })?;

            if status.is_registered() {
                debug!("Registered: {status:?}");
                return Ok(());
            }
            if status == RegistrationStatus::Denied {
                return Err(UplinkError::Network("registration denied".to_string()));
            }
            if self.clock.now_ms().saturating_sub(started) >= self.config.attach_timeout_ms {
                return Err(UplinkError::Network(format!(
                    "not registered after {} ms ({status:?})",
                    self.config.attach_timeout_ms
                )));
            }

            self.clock.sleep(Duration::from_millis(REGISTRATION_POLL_MS));
        }
    }

    fn query_signal(&mut self) -> Option<SignalQuality> {
        match self.modem.command("AT+CSQ") {
            Ok(lines) => {
                let quality = lines.iter().find_map(|l| parse_csq(l));
                if let Some(dbm) = quality.and_then(|q| q.dbm()) {
                    info!("Signal quality: {dbm} dBm");
                }
                quality
            }
            Err(e) => {
                debug!("Signal query failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeClock, ScriptedPort, healthy_modem, test_config};

    fn manager(
        port: &ScriptedPort,
        config: &NodeConfig,
    ) -> (ConnectivityManager<ScriptedPort>, Rc<FakeClock>) {
        let clock = Rc::new(FakeClock::new());
        let manager = ConnectivityManager::new(port.clone(), clock.clone(), config);
        (manager, clock)
    }

    fn denied_modem(cmd: &str) -> Vec<String> {
        match cmd {
            "AT+CGREG?" => vec!["+CGREG: 0,3".to_string(), "OK".to_string()],
            _ => healthy_modem(cmd),
        }
    }

    #[test]
    fn test_connect_runs_attach_sequence() {
        let port = ScriptedPort::new(healthy_modem);
        let (mut conn, _) = manager(&port, &test_config());

        conn.connect().unwrap();
        assert_eq!(conn.state(), ConnectivityState::Attached);
        assert!(conn.is_online());
        assert_eq!(
            port.written(),
            vec![
                "AT",
                "ATE0",
                "AT+CFUN=0",
                "AT*MCGDEFCONT=\"IP\",\"twm.nbiot\"",
                "AT+CBAND=28",
                "AT+CFUN=1",
                "AT+CGREG?",
                "AT+CGATT?",
                "AT+CSQ",
            ]
        );
        assert_eq!(conn.signal_quality().and_then(|q| q.dbm()), Some(-73));
    }

    #[test]
    fn test_ensure_connected_is_idempotent() {
        let port = ScriptedPort::new(healthy_modem);
        let (mut conn, _) = manager(&port, &test_config());

        conn.ensure_connected().unwrap();
        assert_eq!(conn.attach_attempts(), 1);
        port.clear_written();

        conn.ensure_connected().unwrap();
        assert_eq!(conn.attach_attempts(), 1);
        assert!(port.written().is_empty());
    }

    #[test]
    fn test_denied_registration_is_network_error() {
        let port = ScriptedPort::new(denied_modem);
        let (mut conn, _) = manager(&port, &test_config());

        assert!(matches!(conn.connect(), Err(UplinkError::Network(_))));
        assert_eq!(conn.state(), ConnectivityState::Error);
    }

    #[test]
    fn test_registration_timeout_is_network_error() {
        let port = ScriptedPort::new(|cmd| match cmd {
            "AT+CGREG?" => vec!["+CGREG: 0,2".to_string(), "OK".to_string()],
            _ => healthy_modem(cmd),
        });
        let (mut conn, clock) = manager(&port, &test_config());

        assert!(matches!(conn.connect(), Err(UplinkError::Network(_))));
        assert!(clock.now_ms() >= 60_000);
    }

    #[test]
    fn test_silent_modem_is_transport_error() {
        let port = ScriptedPort::new(|_| Vec::<String>::new());
        let (mut conn, _) = manager(&port, &test_config());

        assert!(matches!(conn.connect(), Err(UplinkError::Transport(_))));
        assert_eq!(conn.state(), ConnectivityState::Error);
    }

    #[test]
    fn test_backoff_between_failed_attempts() {
        let mut attempts = 0;
        let port = ScriptedPort::new(move |cmd| {
            if cmd == "AT+CFUN=1" {
                attempts += 1;
            }
            if cmd == "AT+CGREG?" && attempts <= 3 {
                return denied_modem(cmd);
            }
            healthy_modem(cmd)
        });
        let (mut conn, clock) = manager(&port, &test_config());

        conn.ensure_connected().unwrap();
        assert_eq!(conn.attach_attempts(), 4);
        let backoff = clock.sleeps_at_least(Duration::from_secs(1));
        assert_eq!(
            backoff,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(backoff.iter().sum::<Duration>(), Duration::from_secs(7));
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let port = ScriptedPort::new(denied_modem);
        let (mut conn, clock) = manager(&port, &test_config());

        assert!(matches!(conn.ensure_connected(), Err(UplinkError::Network(_))));
        assert_eq!(conn.attach_attempts(), 5);
        assert_eq!(clock.sleeps_at_least(Duration::from_secs(1)).len(), 4);

        // A later cycle starts the backoff from the beginning again
        conn.ensure_connected().unwrap_err();
        let sleeps = clock.sleeps_at_least(Duration::from_secs(1));
        assert_eq!(sleeps[4], Duration::from_secs(1));
    }

    #[test]
    fn test_channel_requires_attach() {
        let port = ScriptedPort::new(healthy_modem);
        let (mut conn, _) = manager(&port, &test_config());

        assert!(matches!(conn.channel(), Err(UplinkError::NotConnected)));
        assert!(port.written().is_empty());

        conn.connect().unwrap();
        assert!(conn.channel().is_ok());
    }

    #[test]
    fn test_probe_detects_detach() {
        let mut detached = false;
        let port = ScriptedPort::new(move |cmd| {
            if cmd == "AT+CGATT?" && detached {
                return vec!["+CGATT: 0".to_string(), "OK".to_string()];
            }
            if cmd == "AT+CSQ" {
                detached = true;
            }
            healthy_modem(cmd)
        });
        let (mut conn, _) = manager(&port, &test_config());

        conn.connect().unwrap();
        assert!(!conn.probe_link().unwrap());
        assert_eq!(conn.state(), ConnectivityState::Disconnected);
    }

    #[test]
    fn test_probe_io_failure_marks_link_lost() {
        let port = ScriptedPort::new(healthy_modem);
        let (mut conn, _) = manager(&port, &test_config());

        conn.connect().unwrap();
        port.set_broken(true);
        assert!(matches!(conn.probe_link(), Err(UplinkError::Transport(_))));
        assert_eq!(conn.state(), ConnectivityState::Disconnected);
    }

    #[test]
    fn test_stray_reply_does_not_derail_attach() {
        let port = ScriptedPort::new(healthy_modem).one_line_per_read();
        let (mut conn, _) = manager(&port, &test_config());

        port.inject("OK");
        conn.ensure_connected().unwrap();
        assert!(conn.is_online());
        assert_eq!(conn.attach_attempts(), 1);
    }
}
