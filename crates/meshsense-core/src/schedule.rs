//! Measurement scheduler
//!
//! The periodic cycle coordinator on a sensor node: every
//! `measure_interval_ms` it samples the sensor collaborators, builds a
//! measurement record stamped with synchronized time, and hands it to the
//! reliable link addressed to the gateway.
//!
//! Within a cycle at most one send is in flight. The configuration
//! invariant guarantees the send resolves (Delivered or Exhausted) before
//! the next boundary; if a boundary arrives while still sending the cycle
//! is counted as an overrun and skipped rather than overlapped.

use crate::clock::NetworkClock;
use crate::config::NodeConfig;
use crate::link::{LinkEvent, ReliableLink};
use crate::message::{DeviceId, MeasurementRecord};
use crate::sensors::{BatteryGauge, EnvironmentSensor};
use crate::transport::FrameTransport;
use tracing::{debug, warn};

/// Scheduler state machine. Sampling happens within the tick, so the
/// observable states are idle and waiting-for-outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Idle,
    Sending { sequence: u16 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    /// Measurement cycles started.
    pub cycles: u64,
    /// Cycles whose report was acknowledged.
    pub delivered: u64,
    /// Cycles whose report exhausted its retries.
    pub exhausted: u64,
    /// Cycle boundaries that arrived while a send was unresolved.
    pub overruns: u64,
    /// Sends the link rejected outright.
    pub rejected: u64,
}

/// Periodic measure-and-report driver for one sensor node.
#[derive(Debug)]
pub struct MeasureScheduler {
    device_id: DeviceId,
    measure_interval_ms: u64,
    next_cycle_at_ms: u64,
    state: ScheduleState,
    stats: ScheduleStats,
}

impl MeasureScheduler {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            device_id: config.device_id,
            measure_interval_ms: config.measure_interval_ms,
            next_cycle_at_ms: 0,
            state: ScheduleState::Idle,
            stats: ScheduleStats::default(),
        }
    }

    pub fn state(&self) -> ScheduleState {
        self.state
    }

    pub fn stats(&self) -> ScheduleStats {
        self.stats
    }

    /// Run one pass: start a measurement cycle if one is due.
    pub fn tick<T, E, B>(
        &mut self,
        link: &mut ReliableLink<T>,
        clock: &NetworkClock,
        environment: &mut E,
        battery: &mut B,
        uptime_ms: u64,
    ) where
        T: FrameTransport,
        E: EnvironmentSensor,
        B: BatteryGauge,
    {
        if uptime_ms < self.next_cycle_at_ms {
            return;
        }
        self.advance_cycle(uptime_ms);

        if let ScheduleState::Sending { sequence } = self.state {
            // The invariant ack_timeout * resend_times < send_interval <
            // measure_interval should make this unreachable; a violated
            // deployment degrades to skipped cycles, not overlapped sends.
            self.stats.overruns += 1;
            warn!(sequence, "cycle boundary reached with send unresolved, skipping cycle");
            return;
        }

        let environment_reading = environment.read();
        let battery_reading = battery.read();
        let record = MeasurementRecord {
            device_id: self.device_id,
            serial: link.next_sequence(),
            timestamp_ms: clock.now(uptime_ms),
            battery_voltage: battery_reading.map(|b| b.voltage),
            battery_percentage: battery_reading.map(|b| b.percentage),
            temperature: environment_reading.map(|e| e.temperature),
            pressure: environment_reading.map(|e| e.pressure),
            humidity: environment_reading.map(|e| e.humidity),
        };

        match link.send(
            DeviceId::GATEWAY,
            record.encode(),
            record.timestamp_ms,
            uptime_ms,
        ) {
            Ok(sequence) => {
                debug!(serial = record.serial, "measurement cycle started");
                self.state = ScheduleState::Sending { sequence };
                self.stats.cycles += 1;
            }
            Err(err) => {
                self.stats.rejected += 1;
                warn!(%err, "link rejected measurement send");
            }
        }
    }

    /// Fold a link outcome back into the state machine. Returns true if
    /// the event belonged to this scheduler's in-flight send.
    pub fn on_link_event(&mut self, event: &LinkEvent) -> bool {
        let ScheduleState::Sending { sequence } = self.state else {
            return false;
        };
        match event {
            LinkEvent::Delivered { sequence: seq } if *seq == sequence => {
                self.state = ScheduleState::Idle;
                self.stats.delivered += 1;
                true
            }
            LinkEvent::Exhausted { sequence: seq } if *seq == sequence => {
                self.state = ScheduleState::Idle;
                self.stats.exhausted += 1;
                true
            }
            _ => false,
        }
    }

    fn advance_cycle(&mut self, uptime_ms: u64) {
        while self.next_cycle_at_ms <= uptime_ms {
            self.next_cycle_at_ms += self.measure_interval_ms;
        }
    }
}
