use log::{debug, info, trace, warn};
use std::io::{Read, Write};
use std::rc::Rc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::NodeConfig;
use crate::connectivity::ConnectivityManager;
use crate::error::UplinkError;
use crate::mqtt::MqttUplink;
use crate::protocol::build_messages;
use crate::pulse::{BeatDetector, PulseSource};
use crate::telemetry::{HeartRateStats, Sampler};

/// What one upload tick achieved.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Nothing to send.
    NoData,
    /// Messages went out; `dropped` counts broker rejections.
    Published { published: usize, dropped: usize },
    /// Gave up on this tick. `retained` tells whether the window was kept
    /// for the next one.
    Abandoned { reason: String, retained: bool },
}

/// Cooperative control loop: samples continuously and uploads the window
/// statistics once per interval.
pub struct UplinkScheduler<T, S> {
    config: NodeConfig,
    clock: Rc<dyn Clock>,
    source: S,
    detector: BeatDetector,
    sampler: Sampler,
    connectivity: ConnectivityManager<T>,
    uplink: MqttUplink,
    next_upload_ms: u64,
    retained: Option<HeartRateStats>,
}

impl<T: Read + Write, S: PulseSource> UplinkScheduler<T, S> {
    pub fn new(config: &NodeConfig, modem_port: T, source: S, clock: Rc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        Self {
            config: config.clone(),
            detector: BeatDetector::new(&config.sampling),
            sampler: Sampler::new(now),
            connectivity: ConnectivityManager::new(modem_port, clock.clone(), config),
            uplink: MqttUplink::new(config),
            next_upload_ms: now + config.sampling.upload_interval_ms,
            retained: None,
            clock,
            source,
        }
    }

    pub fn sampler_mut(&mut self) -> &mut Sampler {
        &mut self.sampler
    }

    pub fn connectivity(&self) -> &ConnectivityManager<T> {
        &self.connectivity
    }

    pub fn run(&mut self) -> ! {
        info!(
            "Sampling every {} ms, uploading every {} ms",
            self.config.sampling.sample_period_ms, self.config.sampling.upload_interval_ms
        );
        loop {
            self.step();
        }
    }

    /// One pass of the loop: take a sample, run the upload cycle when due,
    /// then sleep for the sample period.
    pub fn step(&mut self) -> Option<CycleOutcome> {
        let now = self.clock.now_ms();

        if let Some(sample) = self.source.next_sample()
            && let Some(reading) = self.detector.process(now, sample)
        {
            trace!("Beat: {:.1} bpm", reading.bpm);
            self.sampler.observe(reading);
        }

        let outcome = if now >= self.next_upload_ms {
            self.next_upload_ms = now + self.config.sampling.upload_interval_ms;
            Some(self.upload_cycle())
        } else {
            None
        };

        self.clock
            .sleep(Duration::from_millis(self.config.sampling.sample_period_ms));
        outcome
    }

    /// Flush the window, make sure the network is up and publish the three
    /// statistics.
    pub fn upload_cycle(&mut self) -> CycleOutcome {
        let now = self.clock.now_ms();

        let stats = match (self.sampler.flush(now).stats(), self.retained.take()) {
            (Some(fresh), stale) => {
                if stale.is_some() {
                    debug!("Retained window superseded by a fresh one");
                }
                fresh
            }
            (None, Some(retained)) => {
                info!("Retrying window retained from the previous tick");
                retained
            }
            (None, None) => {
                info!("No heart-rate readings in this window");
                return CycleOutcome::NoData;
            }
        };

        info!(
            "Window closed {}: max {:.1} / mid {:.1} / min {:.1} bpm over {} readings",
            stats.closed_at.format("%H:%M:%S"),
            stats.max,
            stats.mid,
            stats.min,
            stats.count
        );

        if let Err(e) = self.connectivity.probe_link() {
            debug!("Link probe failed: {e}");
        }
        if let Err(e) = self.connectivity.ensure_connected() {
            return self.abandon(stats, format!("network unavailable: {e}"));
        }

        let mut published = 0;
        let mut dropped = 0;
        for message in build_messages(&stats, &self.config.mqtt) {
            match self.uplink.publish(&mut self.connectivity, &message) {
                Ok(()) => published += 1,
                Err(UplinkError::Protocol(e)) => {
                    warn!("Dropping message for {}: {e}", message.topic);
                    dropped += 1;
                }
                Err(e) => return self.abandon(stats, format!("publish interrupted: {e}")),
            }
        }

        if published == 0 && dropped > 0 {
            // Broker refused everything; log in afresh next tick
            self.uplink.disconnect(&mut self.connectivity);
        }

        info!("Upload complete: {published} published, {dropped} dropped");
        CycleOutcome::Published { published, dropped }
    }

    fn abandon(&mut self, stats: HeartRateStats, reason: String) -> CycleOutcome {
        let retained = self.config.retry.retain_failed_window;
        if retained {
            self.retained = Some(stats);
        }
        warn!(
            "Upload cycle abandoned ({reason}), window {}",
            if retained { "kept for next tick" } else { "discarded" }
        );
        CycleOutcome::Abandoned { reason, retained }
    }
}
