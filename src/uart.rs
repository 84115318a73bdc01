use log::{debug, trace, warn};
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::rc::Rc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::SERIAL_TIMEOUT_MS;
use crate::error::{AtError, UplinkError};
use crate::parser::parse_cme_error;

const READ_IDLE_MS: u64 = 10;
const HANDSHAKE_ATTEMPTS: u32 = 5;
// Longest partial line kept while waiting for its terminator
const MAX_PENDING_BYTES: usize = 2048;
// Upper bound on reads spent flushing leftovers before a command
const MAX_DRAIN_READS: usize = 64;

// Lines the modem may emit at any time, independent of the command in flight
const URC_PREFIXES: [&str; 3] = ["+CMQDISCON:", "+CMQPUB:", "*MATREADY"];

pub fn open_port(path: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>, UplinkError> {
    serialport::new(path, baud_rate)
        .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
        .open()
        .map_err(|e| UplinkError::Transport(format!("failed to open port '{path}': {e}")))
}

pub fn available_ports() -> Vec<String> {
    serialport::available_ports()
        .map(|ports| ports.iter().map(|p| p.port_name.clone()).collect())
        .unwrap_or_else(|_| vec![])
}

/// Line-oriented AT command channel over any byte stream.
pub struct AtModem<T> {
    port: T,
    clock: Rc<dyn Clock>,
    command_timeout: Duration,
    dump: bool,
    buffer: String,
    unsolicited: Vec<String>,
}

impl<T: Read + Write> AtModem<T> {
    pub fn new(port: T, clock: Rc<dyn Clock>, command_timeout: Duration, dump: bool) -> Self {
        Self {
            port,
            clock,
            command_timeout,
            dump,
            buffer: String::new(),
            unsolicited: Vec::new(),
        }
    }

    /// Send `cmd` and wait for its final result code. Returns the
    /// intermediate response lines on `OK`.
    pub fn command(&mut self, cmd: &str) -> Result<Vec<String>, AtError> {
        self.command_with_timeout(cmd, self.command_timeout)
    }

    pub fn command_with_timeout(
        &mut self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, AtError> {
        self.drain_port()?;
        self.discard_stale_lines();

        if self.dump {
            debug!(target: "at", ">> {cmd}");
        }
        self.port.write_all(format!("{cmd}\r\n").as_bytes())?;
        self.port.flush()?;

        self.wait_for_result(cmd, timeout)
    }

    /// Poke the modem with `AT` until it answers.
    pub fn handshake(&mut self) -> Result<(), AtError> {
        let mut last_err = AtError::Timeout("AT".to_string());
        for _ in 0..HANDSHAKE_ATTEMPTS {
            match self.command("AT") {
                Ok(_) => return Ok(()),
                Err(AtError::Io(e)) => return Err(AtError::Io(e)),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Unsolicited result codes collected since the last call.
    pub fn take_unsolicited(&mut self) -> Vec<String> {
        std::mem::take(&mut self.unsolicited)
    }

    fn wait_for_result(&mut self, cmd: &str, timeout: Duration) -> Result<Vec<String>, AtError> {
        let started = self.clock.now_ms();
        let timeout_ms = timeout.as_millis() as u64;
        let mut lines = Vec::new();
        let mut serial_buf = [0u8; 256];

        loop {
            while let Some(line) = self.next_line() {
                // Skip blank lines and command echo
                if line.is_empty() || line == cmd {
                    continue;
                }
                if self.dump {
                    debug!(target: "at", "<< {line}");
                }

                if line == "OK" {
                    return Ok(lines);
                }
                if line == "ERROR" {
                    return Err(AtError::Rejected {
                        command: cmd.to_string(),
                        detail: line,
                    });
                }
                if let Some(code) = parse_cme_error(&line) {
                    return Err(AtError::Rejected {
                        command: cmd.to_string(),
                        detail: format!("CME ERROR {code}"),
                    });
                }
                if is_unsolicited(&line) {
                    self.unsolicited.push(line);
                    continue;
                }
                lines.push(line);
            }

            if self.clock.now_ms().saturating_sub(started) > timeout_ms {
                return Err(AtError::Timeout(cmd.to_string()));
            }

            match self.port.read(&mut serial_buf) {
                Ok(n) if n > 0 => self.push_bytes(&serial_buf[..n]),
                Ok(_) => self.clock.sleep(Duration::from_millis(READ_IDLE_MS)),
                Err(ref e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    self.clock.sleep(Duration::from_millis(READ_IDLE_MS));
                }
                Err(e) => return Err(AtError::Io(e)),
            }
        }
    }

    // Late replies to a timed-out command may still sit in the port
    fn drain_port(&mut self) -> Result<(), AtError> {
        let mut serial_buf = [0u8; 256];
        for _ in 0..MAX_DRAIN_READS {
            match self.port.read(&mut serial_buf) {
                Ok(0) => break,
                Ok(n) => self.push_bytes(&serial_buf[..n]),
                Err(ref e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    break;
                }
                Err(e) => return Err(AtError::Io(e)),
            }
        }
        Ok(())
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        if self.buffer.len() > MAX_PENDING_BYTES && !self.buffer.contains('\n') {
            warn!("Dropping {} bytes of unterminated modem output", self.buffer.len());
            self.buffer.clear();
        }
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.find('\n')?;
        let line = self.buffer.drain(..=pos).collect::<String>();
        Some(line.trim().to_string())
    }

    // Leftovers from an earlier exchange must not answer the next command
    fn discard_stale_lines(&mut self) {
        while let Some(line) = self.next_line() {
            if is_unsolicited(&line) {
                self.unsolicited.push(line);
            } else if !line.is_empty() {
                trace!(target: "at", "discarding stale line: {line}");
            }
        }
    }
}

fn is_unsolicited(line: &str) -> bool {
    URC_PREFIXES.iter().any(|prefix| line.starts_with(prefix))
}
