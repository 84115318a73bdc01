//! Test doubles: a scripted serial port and a manually advanced clock.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::time::Duration;

use crate::clock::Clock;

type Responder = Box<dyn FnMut(&str) -> Vec<String>>;

struct PortState {
    responder: Responder,
    pending_write: Vec<u8>,
    written: Vec<String>,
    output: VecDeque<u8>,
    broken: bool,
    line_reads: bool,
}

/// Serial port stand-in. Every complete line written is recorded and handed
/// to the responder, whose lines are queued for reading.
#[derive(Clone)]
pub struct ScriptedPort {
    state: Rc<RefCell<PortState>>,
}

impl ScriptedPort {
    pub fn new<F, S>(mut responder: F) -> Self
    where
        F: FnMut(&str) -> Vec<S> + 'static,
        S: Into<String>,
    {
        let responder: Responder =
            Box::new(move |line| responder(line).into_iter().map(Into::into).collect());
        Self {
            state: Rc::new(RefCell::new(PortState {
                responder,
                pending_write: Vec::new(),
                written: Vec::new(),
                output: VecDeque::new(),
                broken: false,
                line_reads: false,
            })),
        }
    }

    /// Hand out at most one line per `read`, like a UART trickling bytes in.
    pub fn one_line_per_read(self) -> Self {
        self.state.borrow_mut().line_reads = true;
        self
    }

    pub fn written(&self) -> Vec<String> {
        self.state.borrow().written.clone()
    }

    pub fn count_written(&self, prefix: &str) -> usize {
        self.state
            .borrow()
            .written
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    pub fn clear_written(&self) {
        self.state.borrow_mut().written.clear();
    }

    /// Make every subsequent write fail like an unplugged cable.
    pub fn set_broken(&self, broken: bool) {
        self.state.borrow_mut().broken = broken;
    }

    /// Queue bytes as if the modem had sent them unprompted.
    pub fn inject(&self, line: &str) {
        let mut state = self.state.borrow_mut();
        state.output.extend(line.as_bytes());
        state.output.extend(b"\r\n");
    }

    pub fn inject_raw(&self, bytes: &[u8]) {
        self.state.borrow_mut().output.extend(bytes);
    }
}

impl Write for ScriptedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "port unplugged"));
        }
        state.pending_write.extend_from_slice(buf);

        while let Some(pos) = state.pending_write.windows(2).position(|w| w == b"\r\n") {
            let raw: Vec<u8> = state.pending_write.drain(..pos + 2).collect();
            let line = String::from_utf8_lossy(&raw[..pos]).to_string();
            state.written.push(line.clone());

            let replies = (state.responder)(&line);
            for reply in replies {
                state.output.extend(reply.as_bytes());
                state.output.extend(b"\r\n");
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for ScriptedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.output.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let available = if state.line_reads {
            state
                .output
                .iter()
                .position(|b| *b == b'\n')
                .map_or(state.output.len(), |pos| pos + 1)
        } else {
            state.output.len()
        };
        let n = buf.len().min(available);
        for (slot, byte) in buf.iter_mut().zip(state.output.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

/// Clock that only moves when something sleeps on it.
pub struct FakeClock {
    now: Cell<u64>,
    sleeps: RefCell<Vec<Duration>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            now: Cell::new(0),
            sleeps: RefCell::new(Vec::new()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get() + duration.as_millis() as u64);
    }

    /// Sleeps of at least `min`, in order.
    pub fn sleeps_at_least(&self, min: Duration) -> Vec<Duration> {
        self.sleeps
            .borrow()
            .iter()
            .copied()
            .filter(|d| *d >= min)
            .collect()
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
        self.advance(duration);
    }
}

/// Answers of a healthy SIM7020 on a network that accepts the node.
pub fn healthy_modem(cmd: &str) -> Vec<String> {
    let lines: &[&str] = match cmd {
        "AT+CGREG?" => &["+CGREG: 0,1", "OK"],
        "AT+CGATT?" => &["+CGATT: 1", "OK"],
        "AT+CSQ" => &["+CSQ: 20,0", "OK"],
        c if c.starts_with("AT+CMQNEW=") => &["+CMQNEW: 0", "OK"],
        _ => &["OK"],
    };
    lines.iter().map(|l| l.to_string()).collect()
}

/// Config tuned for deterministic tests: no jitter, otherwise defaults.
pub fn test_config() -> crate::config::NodeConfig {
    let mut config = crate::config::NodeConfig::default();
    config.retry.jitter = 0.0;
    config.mqtt.username = "alice".to_string();
    config.mqtt.password = "secret".to_string();
    config
}
