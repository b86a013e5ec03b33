//! Node role composition
//!
//! Two assemblies over the same protocol parts, chosen once at startup
//! from `NodeConfig::role` and never changed at runtime. Both run the
//! single-threaded cooperative loop: the owner calls `on_frame` for every
//! inbound radio frame and `tick` on every pass with the local uptime.

use crate::clock::{NetworkClock, NetworkTimeSource};
use crate::config::NodeConfig;
use crate::link::{LinkEvent, LinkStats, ReliableLink};
use crate::message::MeasurementRecord;
use crate::schedule::{MeasureScheduler, ScheduleStats};
use crate::sensors::{BatteryGauge, EnvironmentSensor};
use crate::transport::FrameTransport;
use crate::upload::{HttpTransport, UploadPipeline, UploadStats};
use tracing::{debug, info, warn};

/// A measuring node: scheduler + reliable link + synchronized clock.
pub struct SensorNode<T, E, B>
where
    T: FrameTransport,
    E: EnvironmentSensor,
    B: BatteryGauge,
{
    pub link: ReliableLink<T>,
    clock: NetworkClock,
    scheduler: MeasureScheduler,
    environment: E,
    battery: B,
}

impl<T, E, B> SensorNode<T, E, B>
where
    T: FrameTransport,
    E: EnvironmentSensor,
    B: BatteryGauge,
{
    pub fn new(config: &NodeConfig, transport: T, environment: E, battery: B) -> Self {
        info!(device = %config.device_id, "sensor node starting");
        Self {
            link: ReliableLink::new(config, transport),
            clock: NetworkClock::new(),
            scheduler: MeasureScheduler::new(config),
            environment,
            battery,
        }
    }

    /// One pass of the cooperative loop.
    pub fn tick(&mut self, uptime_ms: u64) {
        self.link.tick(uptime_ms);
        self.scheduler.tick(
            &mut self.link,
            &self.clock,
            &mut self.environment,
            &mut self.battery,
            uptime_ms,
        );
        self.process_events(uptime_ms);
    }

    /// Feed one inbound radio frame.
    pub fn on_frame(&mut self, bytes: &[u8], uptime_ms: u64) {
        self.link.on_frame(bytes, uptime_ms);
        self.process_events(uptime_ms);
    }

    fn process_events(&mut self, uptime_ms: u64) {
        for event in self.link.poll_events() {
            match event {
                LinkEvent::TimeSync(message) => {
                    self.clock.apply_sync(message.timestamp_ms, uptime_ms);
                }
                LinkEvent::Data(message) => {
                    // Sensor nodes are sources, not sinks.
                    debug!(sender = %message.sender, "ignoring DATA addressed to a sensor node");
                }
                ref outcome => {
                    self.scheduler.on_link_event(outcome);
                }
            }
        }
    }

    pub fn clock(&self) -> &NetworkClock {
        &self.clock
    }

    pub fn link_stats(&self) -> &LinkStats {
        self.link.stats()
    }

    pub fn schedule_stats(&self) -> ScheduleStats {
        self.scheduler.stats()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    /// TIME_SYNC floods originated.
    pub syncs_sent: u64,
    /// Measurement records received over the mesh.
    pub records_received: u64,
    /// DATA payloads that did not decode as records.
    pub records_invalid: u64,
}

/// How long the gateway waits before re-asking an unreachable time source.
const TIME_SOURCE_RETRY_MS: u64 = 60_000;

/// The collecting node: reliable link + time distribution + upload
/// pipeline. DeviceId 0 by definition.
pub struct GatewayNode<T, H, S>
where
    T: FrameTransport,
    H: HttpTransport,
    S: NetworkTimeSource,
{
    pub link: ReliableLink<T>,
    pub pipeline: UploadPipeline<H>,
    clock: NetworkClock,
    time_source: S,
    ntp_interval_ms: u64,
    next_sync_at_ms: u64,
    stats: GatewayStats,
}

impl<T, H, S> GatewayNode<T, H, S>
where
    T: FrameTransport,
    H: HttpTransport,
    S: NetworkTimeSource,
{
    pub fn new(config: &NodeConfig, transport: T, http: H, time_source: S) -> Self {
        info!("gateway node starting");
        Self {
            link: ReliableLink::new(config, transport),
            pipeline: UploadPipeline::new(config.upload.clone(), http),
            clock: NetworkClock::new(),
            time_source,
            ntp_interval_ms: config.ntp_interval_ms,
            next_sync_at_ms: 0,
            stats: GatewayStats::default(),
        }
    }

    /// One pass of the cooperative loop.
    pub fn tick(&mut self, uptime_ms: u64) {
        self.link.tick(uptime_ms);
        if uptime_ms >= self.next_sync_at_ms {
            self.distribute_time(uptime_ms);
        }
        self.process_events(uptime_ms);
    }

    /// Feed one inbound radio frame.
    pub fn on_frame(&mut self, bytes: &[u8], uptime_ms: u64) {
        self.link.on_frame(bytes, uptime_ms);
        self.process_events(uptime_ms);
    }

    /// Fetch network time and flood it mesh-wide. Sync loss is tolerated
    /// end to end, so a failed fetch just reschedules.
    fn distribute_time(&mut self, uptime_ms: u64) {
        match self.time_source.network_time_ms() {
            Some(network_time_ms) => {
                self.clock.apply_sync(network_time_ms, uptime_ms);
                self.link.send_time_sync(network_time_ms);
                self.stats.syncs_sent += 1;
                debug!(network_time_ms, "flooded time sync");
                while self.next_sync_at_ms <= uptime_ms {
                    self.next_sync_at_ms += self.ntp_interval_ms;
                }
            }
            None => {
                warn!("network time source unreachable, will retry");
                self.next_sync_at_ms = uptime_ms + TIME_SOURCE_RETRY_MS;
            }
        }
    }

    fn process_events(&mut self, _uptime_ms: u64) {
        for event in self.link.poll_events() {
            match event {
                LinkEvent::Data(message) => match MeasurementRecord::decode(&message.payload) {
                    Some(record) => {
                        self.stats.records_received += 1;
                        // The record was mesh-delivered the moment we ACKed
                        // it; upload exhaustion is counted, not propagated.
                        let _ = self.pipeline.upload(&record);
                    }
                    None => {
                        self.stats.records_invalid += 1;
                        warn!(sender = %message.sender, "undecodable measurement payload");
                    }
                },
                LinkEvent::TimeSync(_) => {}
                outcome => {
                    debug!(?outcome, "unexpected send outcome on gateway");
                }
            }
        }
    }

    pub fn clock(&self) -> &NetworkClock {
        &self.clock
    }

    pub fn stats(&self) -> GatewayStats {
        self.stats
    }

    pub fn link_stats(&self) -> &LinkStats {
        self.link.stats()
    }

    pub fn upload_stats(&self) -> UploadStats {
        self.pipeline.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedTimeSource;
    use crate::message::{DeviceId, Message, MessageKind};
    use crate::sensors::{BatteryReading, EnvironmentReading, FixedBatteryGauge, FixedEnvironmentSensor};
    use crate::transport::RecordingTransport;
    use crate::upload::RecordingHttpTransport;

    struct SimSource(FixedTimeSource, u64);

    impl NetworkTimeSource for SimSource {
        fn network_time_ms(&mut self) -> Option<u64> {
            Some(self.0.at(self.1))
        }
    }

    struct DeadSource;

    impl NetworkTimeSource for DeadSource {
        fn network_time_ms(&mut self) -> Option<u64> {
            None
        }
    }

    fn gateway_with_source<S: NetworkTimeSource>(
        source: S,
    ) -> GatewayNode<RecordingTransport, RecordingHttpTransport, S> {
        GatewayNode::new(
            &NodeConfig::gateway(),
            RecordingTransport::default(),
            RecordingHttpTransport::default(),
            source,
        )
    }

    fn sensor(
        id: u8,
    ) -> SensorNode<RecordingTransport, FixedEnvironmentSensor, FixedBatteryGauge> {
        SensorNode::new(
            &NodeConfig::sensor(DeviceId(id)),
            RecordingTransport::default(),
            FixedEnvironmentSensor(EnvironmentReading {
                temperature: 20.0,
                pressure: 1000.0,
                humidity: 50.0,
            }),
            FixedBatteryGauge(BatteryReading {
                voltage: 4.0,
                percentage: 100.0,
            }),
        )
    }

    #[test]
    fn test_sensor_applies_time_sync() {
        let mut node = sensor(5);
        let sync = Message::time_sync(DeviceId::GATEWAY, 0, 5_000_000);
        node.on_frame(&sync.to_bytes(), 1_000);

        assert!(node.clock().is_synchronized());
        assert_eq!(node.clock().now(1_000), 5_000_000);
    }

    #[test]
    fn test_gateway_floods_time_at_boundary() {
        let mut gateway = gateway_with_source(SimSource(FixedTimeSource::new(7_000_000), 0));
        gateway.tick(0);

        assert_eq!(gateway.stats().syncs_sent, 1);
        let frame = Message::from_bytes(&gateway.link.transport.frames[0]).unwrap();
        assert_eq!(frame.kind, MessageKind::TimeSync);
        assert_eq!(frame.timestamp_ms, 7_000_000);
        assert!(gateway.clock().is_synchronized());

        // Nothing more until the next interval.
        gateway.tick(1_000);
        assert_eq!(gateway.stats().syncs_sent, 1);
    }

    #[test]
    fn test_gateway_retries_dead_time_source() {
        let mut gateway = gateway_with_source(DeadSource);
        gateway.tick(0);
        assert_eq!(gateway.stats().syncs_sent, 0);
        assert!(gateway.link.transport.frames.is_empty());

        // The retry is rescheduled, not abandoned.
        gateway.tick(TIME_SOURCE_RETRY_MS);
        assert_eq!(gateway.stats().syncs_sent, 0);
    }

    #[test]
    fn test_gateway_acks_and_uploads_record() {
        let mut gateway = gateway_with_source(SimSource(FixedTimeSource::new(0), 0));
        let record = MeasurementRecord {
            device_id: DeviceId(5),
            serial: 12,
            timestamp_ms: 42,
            battery_voltage: Some(3.9),
            battery_percentage: Some(88.0),
            temperature: Some(19.5),
            pressure: Some(1009.0),
            humidity: Some(55.0),
        };
        let mut data = Message::data(DeviceId(5), DeviceId::GATEWAY, 12, 42, record.encode());
        data.hop = DeviceId::GATEWAY;

        gateway.on_frame(&data.to_bytes(), 100);

        assert_eq!(gateway.stats().records_received, 1);
        assert_eq!(gateway.upload_stats().uploaded, 1);
        let url = &gateway.pipeline.transport().requests[0];
        assert!(url.contains("device=5"));
        assert!(url.contains("serial=12"));

        // An ACK went back toward the sensor.
        let acks: Vec<Message> = gateway
            .link
            .transport
            .frames
            .iter()
            .filter_map(|b| Message::from_bytes(b))
            .filter(|m| m.kind == MessageKind::Ack)
            .collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].destination, DeviceId(5));
        assert_eq!(acks[0].sequence, 12);
    }

    #[test]
    fn test_gateway_counts_undecodable_payload() {
        let mut gateway = gateway_with_source(SimSource(FixedTimeSource::new(0), 0));
        let mut data = Message::data(DeviceId(5), DeviceId::GATEWAY, 1, 0, vec![0xFF]);
        data.hop = DeviceId::GATEWAY;

        gateway.on_frame(&data.to_bytes(), 0);

        assert_eq!(gateway.stats().records_invalid, 1);
        assert_eq!(gateway.upload_stats().uploaded, 0);
    }
}
