use log::{debug, warn};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::rc::Rc;

use crate::clock::Clock;
use crate::config::SamplingConfig;
use crate::parser::parse_signal;
use crate::telemetry::Reading;

const IBI_HISTORY: usize = 10;
const INITIAL_IBI_MS: u64 = 600;
const SIGNAL_MIDPOINT: i32 = 512;
const REFRACTORY_MS: u64 = 250;
const NO_BEAT_RESET_MS: u64 = 2_500;
// A sample line is a handful of digits; anything longer is line noise
const MAX_SENSOR_LINE_BYTES: usize = 32;
pub const MAX_SYNTHETIC_BPM: u32 = 300;

/// Turns a raw photoplethysmograph signal into heart-rate readings.
///
/// Adaptive threshold detector: tracks the peak and trough of each pulse
/// wave, places the next threshold halfway between them, and averages the
/// last ten inter-beat intervals.
pub struct BeatDetector {
    initial_threshold: i32,
    threshold: i32,
    peak: i32,
    trough: i32,
    last_beat_ms: u64,
    ibi_ms: u64,
    history: [u64; IBI_HISTORY],
    in_pulse: bool,
    first_beat: bool,
    second_beat: bool,
    min_bpm: f32,
    max_bpm: f32,
}

impl BeatDetector {
    pub fn new(config: &SamplingConfig) -> Self {
        let threshold = config.beat_threshold as i32;
        Self {
            initial_threshold: threshold,
            threshold,
            peak: SIGNAL_MIDPOINT,
            trough: SIGNAL_MIDPOINT,
            last_beat_ms: 0,
            ibi_ms: INITIAL_IBI_MS,
            history: [INITIAL_IBI_MS; IBI_HISTORY],
            in_pulse: false,
            first_beat: true,
            second_beat: false,
            min_bpm: config.min_bpm,
            max_bpm: config.max_bpm,
        }
    }

    /// Feed one sample. Returns a reading when a beat completes with a
    /// plausible rate.
    pub fn process(&mut self, now_ms: u64, signal: u16) -> Option<Reading> {
        let signal = signal as i32;
        let since_beat = now_ms.saturating_sub(self.last_beat_ms);
        let settle = self.ibi_ms * 3 / 5;
        let mut reading = None;

        if signal < self.threshold && since_beat > settle && signal < self.trough {
            self.trough = signal;
        }
        if signal > self.threshold && signal > self.peak {
            self.peak = signal;
        }

        if since_beat > REFRACTORY_MS
            && since_beat > settle
            && signal > self.threshold
            && !self.in_pulse
        {
            self.in_pulse = true;
            self.ibi_ms = since_beat;
            self.last_beat_ms = now_ms;

            if self.second_beat {
                self.second_beat = false;
                self.history = [self.ibi_ms; IBI_HISTORY];
            }

            if self.first_beat {
                // Interval to the first beat is meaningless
                self.first_beat = false;
                self.second_beat = true;
            } else {
                self.history.rotate_left(1);
                self.history[IBI_HISTORY - 1] = self.ibi_ms;
                let average = self.history.iter().sum::<u64>() / IBI_HISTORY as u64;
                reading = self.to_reading(now_ms, average);
            }
        }

        if signal < self.threshold && self.in_pulse {
            self.in_pulse = false;
            let amplitude = self.peak - self.trough;
            self.threshold = amplitude / 2 + self.trough;
            self.peak = self.threshold;
            self.trough = self.threshold;
        }

        if since_beat > NO_BEAT_RESET_MS {
            self.reset(now_ms);
        }

        reading
    }

    fn to_reading(&self, now_ms: u64, average_ibi_ms: u64) -> Option<Reading> {
        if average_ibi_ms == 0 {
            return None;
        }
        let bpm = 60_000.0 / average_ibi_ms as f32;
        (self.min_bpm..=self.max_bpm)
            .contains(&bpm)
            .then_some(Reading {
                timestamp_ms: now_ms,
                bpm,
            })
    }

    fn reset(&mut self, now_ms: u64) {
        self.threshold = self.initial_threshold;
        self.peak = SIGNAL_MIDPOINT;
        self.trough = SIGNAL_MIDPOINT;
        self.last_beat_ms = now_ms;
        self.first_beat = true;
        self.second_beat = false;
        self.in_pulse = false;
    }
}

/// Source of raw pulse-sensor samples.
pub trait PulseSource {
    /// The next sample, or `None` when nothing is ready yet.
    fn next_sample(&mut self) -> Option<u16>;
}

impl<P: PulseSource + ?Sized> PulseSource for Box<P> {
    fn next_sample(&mut self) -> Option<u16> {
        (**self).next_sample()
    }
}

/// Sensor board streaming one sample per line over a serial link.
pub struct SerialPulseSource<R> {
    port: R,
    buffer: Vec<u8>,
    samples: VecDeque<u16>,
    skip_partial: bool,
}

impl<R: Read> SerialPulseSource<R> {
    pub fn new(port: R) -> Self {
        Self {
            port,
            buffer: Vec::new(),
            samples: VecDeque::new(),
            skip_partial: false,
        }
    }

    fn fill(&mut self) {
        let mut serial_buf = [0u8; 256];
        match self.port.read(&mut serial_buf) {
            Ok(n) => self.process_bytes(&serial_buf[..n]),
            Err(ref e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
            Err(e) => warn!("sensor read failed: {e}"),
        }
    }

    fn process_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if std::mem::take(&mut self.skip_partial) {
                continue;
            }
            match std::str::from_utf8(&line) {
                Ok(text) => {
                    if let Some(sample) = parse_signal(text.trim()) {
                        self.samples.push_back(sample);
                    }
                }
                Err(_) => debug!("dropping garbled sensor line"),
            }
        }

        // The tail of an overlong line must not pass for a sample
        if self.buffer.len() > MAX_SENSOR_LINE_BYTES {
            debug!("dropping {} bytes of unterminated sensor data", self.buffer.len());
            self.buffer.clear();
            self.skip_partial = true;
        }
    }
}

impl<R: Read> PulseSource for SerialPulseSource<R> {
    fn next_sample(&mut self) -> Option<u16> {
        if self.samples.is_empty() {
            self.fill();
        }
        self.samples.pop_front()
    }
}

/// Square-ish pulse wave at a fixed rate, for bench runs without a sensor.
pub struct SyntheticPulse {
    clock: Rc<dyn Clock>,
    period_ms: u64,
}

impl SyntheticPulse {
    pub fn new(clock: Rc<dyn Clock>, bpm: u32) -> Self {
        Self {
            clock,
            period_ms: 60_000 / u64::from(bpm.clamp(1, MAX_SYNTHETIC_BPM)),
        }
    }
}

impl PulseSource for SyntheticPulse {
    fn next_sample(&mut self) -> Option<u16> {
        let phase = self.clock.now_ms() % self.period_ms;
        Some(if phase < self.period_ms / 8 { 800 } else { 300 })
    }
}
