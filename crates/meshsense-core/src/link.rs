//! Reliable delivery protocol
//!
//! Acknowledgement, timeout, and bounded retransmission on top of the
//! frame transport and the static router. This layer owns the outbound
//! radio exclusively: the scheduler and the time service serialize their
//! sends through one [`ReliableLink`] instance, never the transport.
//!
//! A send terminates in exactly one of two outcomes, reported through the
//! event queue: `Delivered` (a matching ACK arrived) or `Exhausted` (the
//! retry budget is spent). Nothing is dropped silently and nothing is
//! retried beyond `resend_times`; at most `resend_times + 1` DATA frames
//! ever carry a given sequence number.
//!
//! Relayed traffic is fire-and-forget at each hop: end-to-end recovery is
//! the original sender's retry loop, which retries through the same
//! static path. Relays suppress re-forwarding of a (sender, sequence)
//! pair inside a short window so retransmission bursts are not amplified.

use crate::config::NodeConfig;
use crate::message::{DeviceId, Message, MessageKind};
use crate::router::{Router, SeenCache};
use crate::transport::FrameTransport;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Rejections surfaced to the caller at send time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("pending-send table is full ({0} in flight)")]
    PendingFull(usize),
    #[error("payload of {0} bytes exceeds the frame budget")]
    PayloadTooLarge(usize),
}

/// Protocol events drained by the node each cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A DATA send was acknowledged end to end.
    Delivered { sequence: u16 },
    /// A DATA send spent its retry budget without an ACK.
    Exhausted { sequence: u16 },
    /// A DATA message addressed to this node.
    Data(Message),
    /// A TIME_SYNC flood reached this node.
    TimeSync(Message),
}

/// Bookkeeping for one in-flight, not-yet-acknowledged DATA message.
///
/// At most one exists per sequence number; destroyed on ACK match or on
/// exhausting the retry budget.
#[derive(Debug, Clone)]
struct PendingSend {
    message: Message,
    attempts_made: u32,
    deadline_ms: u64,
}

/// Protocol counters. Exhaustion and rejection degrade to counted,
/// observable data loss rather than growth or a crash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_tx: u64,
    pub frames_rx: u64,
    pub frames_invalid: u64,
    pub frames_ignored: u64,
    pub data_rx: u64,
    pub acks_tx: u64,
    pub acks_rx: u64,
    pub duplicate_acks: u64,
    pub forwarded: u64,
    pub duplicates_suppressed: u64,
    pub retransmissions: u64,
    pub delivered: u64,
    pub exhausted: u64,
    pub rejected_sends: u64,
    pub syncs_tx: u64,
    pub syncs_rx: u64,
    pub tx_failures: u64,
}

/// The reliable delivery protocol instance for one node.
pub struct ReliableLink<T: FrameTransport> {
    device_id: DeviceId,
    router: Router,
    pub transport: T,
    ack_timeout_ms: u64,
    resend_times: u32,
    max_pending: usize,
    next_sequence: u16,
    pending: Vec<PendingSend>,
    relay_seen: SeenCache,
    delivery_seen: SeenCache,
    events: VecDeque<LinkEvent>,
    stats: LinkStats,
}

impl<T: FrameTransport> ReliableLink<T> {
    pub fn new(config: &NodeConfig, transport: T) -> Self {
        Self {
            device_id: config.device_id,
            router: Router::new(config.device_id, config.topology.clone()),
            transport,
            ack_timeout_ms: config.ack_timeout_ms,
            resend_times: config.resend_times,
            max_pending: config.max_pending,
            next_sequence: 0,
            pending: Vec::new(),
            relay_seen: SeenCache::new(config.relay_dedup_window_ms, 256),
            delivery_seen: SeenCache::new(config.delivery_dedup_window_ms(), 256),
            events: VecDeque::new(),
            stats: LinkStats::default(),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// The sequence number the next `send` will use.
    pub fn next_sequence(&self) -> u16 {
        self.next_sequence
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Drain protocol events accumulated since the last call.
    pub fn poll_events(&mut self) -> Vec<LinkEvent> {
        self.events.drain(..).collect()
    }

    /// Originate a DATA message toward `destination`.
    ///
    /// The outcome arrives later as a `Delivered` or `Exhausted` event
    /// carrying the returned sequence number. `timestamp_ms` stamps the
    /// frame with synchronized network time; `now_ms` is local uptime and
    /// drives the retry deadline.
    pub fn send(
        &mut self,
        destination: DeviceId,
        payload: Vec<u8>,
        timestamp_ms: u64,
        now_ms: u64,
    ) -> Result<u16, LinkError> {
        if payload.len() > Message::MAX_PAYLOAD_SIZE {
            return Err(LinkError::PayloadTooLarge(payload.len()));
        }
        if self.pending.len() >= self.max_pending {
            self.stats.rejected_sends += 1;
            return Err(LinkError::PendingFull(self.pending.len()));
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let mut message = Message::data(self.device_id, destination, sequence, timestamp_ms, payload);
        message.hop = self.router.next_hop(destination);

        trace!(%destination, sequence, hop = %message.hop, "originating DATA");
        self.transmit(&message);
        self.pending.push(PendingSend {
            message,
            attempts_made: 0,
            deadline_ms: now_ms + self.ack_timeout_ms,
        });
        Ok(sequence)
    }

    /// Flood a TIME_SYNC frame carrying the network time. Unreliable by
    /// design; no PendingSend is registered.
    pub fn send_time_sync(&mut self, network_time_ms: u64) {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let message = Message::time_sync(self.device_id, sequence, network_time_ms);
        self.transmit(&message);
        self.stats.syncs_tx += 1;
    }

    /// Drive retry deadlines. Call on every pass of the cooperative loop.
    pub fn tick(&mut self, now_ms: u64) {
        let mut i = 0;
        while i < self.pending.len() {
            if now_ms < self.pending[i].deadline_ms {
                i += 1;
                continue;
            }
            if self.pending[i].attempts_made < self.resend_times {
                // Same sequence number, so receivers can deduplicate.
                let message = self.pending[i].message.clone();
                self.pending[i].attempts_made += 1;
                self.pending[i].deadline_ms = now_ms + self.ack_timeout_ms;
                self.stats.retransmissions += 1;
                debug!(
                    sequence = message.sequence,
                    attempt = self.pending[i].attempts_made,
                    "ACK timeout, retransmitting"
                );
                self.transmit(&message);
                i += 1;
            } else {
                let pending = self.pending.remove(i);
                self.stats.exhausted += 1;
                warn!(
                    sequence = pending.message.sequence,
                    destination = %pending.message.destination,
                    "retry budget spent, dropping message"
                );
                self.events.push_back(LinkEvent::Exhausted {
                    sequence: pending.message.sequence,
                });
            }
        }
        self.relay_seen.cleanup(now_ms);
        self.delivery_seen.cleanup(now_ms);
    }

    /// Feed one inbound frame from the radio.
    pub fn on_frame(&mut self, bytes: &[u8], now_ms: u64) {
        self.stats.frames_rx += 1;
        let message = match Message::from_bytes(bytes) {
            Some(m) => m,
            None => {
                self.stats.frames_invalid += 1;
                return;
            }
        };
        // Not our hop and not a flood: another link's traffic.
        if message.hop != self.device_id && !message.hop.is_broadcast() {
            self.stats.frames_ignored += 1;
            return;
        }
        match message.kind {
            MessageKind::Ack => self.on_ack(message),
            MessageKind::Data => self.on_data(message, now_ms),
            MessageKind::TimeSync => self.on_time_sync(message, now_ms),
        }
    }

    fn on_ack(&mut self, message: Message) {
        if message.destination != self.device_id {
            // Relay leg of the reverse path.
            self.forward(message);
            return;
        }
        let matched = self.pending.iter().position(|p| {
            p.message.destination == message.sender && p.message.sequence == message.sequence
        });
        match matched {
            Some(idx) => {
                let pending = self.pending.remove(idx);
                self.stats.acks_rx += 1;
                self.stats.delivered += 1;
                debug!(sequence = pending.message.sequence, "delivered");
                self.events.push_back(LinkEvent::Delivered {
                    sequence: pending.message.sequence,
                });
            }
            // Already resolved; a duplicate ACK causes no state change.
            None => self.stats.duplicate_acks += 1,
        }
    }

    fn on_data(&mut self, message: Message, now_ms: u64) {
        if message.destination != self.device_id {
            // Relay hop: fire-and-forget, suppressed inside the dedup
            // window so retransmission bursts are not amplified.
            if self.relay_seen.check_and_add(message.dedup_key(), now_ms) {
                self.forward(message);
            } else {
                self.stats.duplicates_suppressed += 1;
            }
            return;
        }
        // Always re-ACK: the previous ACK may have been lost on the way
        // back. The ACK echoes the DATA timestamp.
        let mut ack = Message::ack(
            self.device_id,
            message.sender,
            message.sequence,
            message.timestamp_ms,
        );
        ack.hop = self.router.next_hop(message.sender);
        self.transmit(&ack);
        self.stats.acks_tx += 1;

        if self.delivery_seen.check_and_add(message.dedup_key(), now_ms) {
            self.stats.data_rx += 1;
            self.events.push_back(LinkEvent::Data(message));
        } else {
            self.stats.duplicates_suppressed += 1;
        }
    }

    fn on_time_sync(&mut self, message: Message, now_ms: u64) {
        if message.sender == self.device_id {
            // Our own flood coming back around.
            return;
        }
        if !self.relay_seen.check_and_add(message.dedup_key(), now_ms) {
            self.stats.duplicates_suppressed += 1;
            return;
        }
        self.stats.syncs_rx += 1;
        // Re-flood once so multi-hop nodes receive time transitively.
        self.transmit(&message);
        self.stats.forwarded += 1;
        self.events.push_back(LinkEvent::TimeSync(message));
    }

    /// Forward a unicast frame one hop along the static route.
    fn forward(&mut self, mut message: Message) {
        message.hop = self.router.next_hop(message.destination);
        self.transmit(&message);
        self.stats.forwarded += 1;
    }

    /// Hand a frame to the radio. A transport failure is a lost frame:
    /// logged and counted, recovered by the sender's retry loop.
    fn transmit(&mut self, message: &Message) {
        match self.transport.send_frame(&message.to_bytes()) {
            Ok(()) => self.stats.frames_tx += 1,
            Err(err) => {
                self.stats.tx_failures += 1;
                warn!(%err, "transport rejected frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::transport::RecordingTransport;

    fn sensor_link(id: u8) -> ReliableLink<RecordingTransport> {
        ReliableLink::new(
            &NodeConfig::sensor(DeviceId(id)),
            RecordingTransport::default(),
        )
    }

    fn frames(link: &ReliableLink<RecordingTransport>) -> Vec<Message> {
        link.transport
            .frames
            .iter()
            .map(|b| Message::from_bytes(b).unwrap())
            .collect()
    }

    #[test]
    fn test_send_then_ack_delivers() {
        let mut link = sensor_link(5);
        let seq = link.send(DeviceId::GATEWAY, vec![1], 100, 0).unwrap();
        assert_eq!(link.pending_len(), 1);

        let ack = Message::ack(DeviceId::GATEWAY, DeviceId(5), seq, 100);
        link.on_frame(&ack.to_bytes(), 50);

        assert_eq!(link.poll_events(), vec![LinkEvent::Delivered { sequence: seq }]);
        assert_eq!(link.pending_len(), 0);
        assert_eq!(link.stats().delivered, 1);
    }

    #[test]
    fn test_retry_schedule_and_exhaustion() {
        // ACK_TIMEOUT=1000, RESEND_TIMES=3: frames at t=0/1000/2000/3000,
        // exhaustion at t=4000 with exactly 4 frames on the wire.
        let mut link = sensor_link(5);
        let seq = link.send(DeviceId::GATEWAY, vec![1], 0, 0).unwrap();

        link.tick(999);
        assert_eq!(link.transport.frames.len(), 1);

        link.tick(1_000);
        assert_eq!(link.transport.frames.len(), 2);
        link.tick(2_000);
        link.tick(3_000);
        assert_eq!(link.transport.frames.len(), 4);
        assert!(link.poll_events().is_empty());

        link.tick(3_999);
        assert!(link.poll_events().is_empty());
        link.tick(4_000);
        assert_eq!(link.poll_events(), vec![LinkEvent::Exhausted { sequence: seq }]);
        assert_eq!(link.transport.frames.len(), 4);
        assert_eq!(link.stats().retransmissions, 3);
        assert_eq!(link.stats().exhausted, 1);
    }

    #[test]
    fn test_retransmission_keeps_sequence() {
        let mut link = sensor_link(5);
        let seq = link.send(DeviceId::GATEWAY, vec![7], 0, 0).unwrap();
        link.tick(1_000);

        let sent = frames(&link);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].sequence, seq);
        assert_eq!(sent[1], sent[0]);
    }

    #[test]
    fn test_duplicate_ack_ignored() {
        let mut link = sensor_link(5);
        let seq = link.send(DeviceId::GATEWAY, vec![1], 0, 0).unwrap();

        let ack = Message::ack(DeviceId::GATEWAY, DeviceId(5), seq, 0);
        link.on_frame(&ack.to_bytes(), 10);
        link.on_frame(&ack.to_bytes(), 20);

        assert_eq!(link.poll_events(), vec![LinkEvent::Delivered { sequence: seq }]);
        assert_eq!(link.stats().duplicate_acks, 1);
        assert_eq!(link.stats().delivered, 1);
    }

    #[test]
    fn test_inbound_data_is_acked_and_delivered() {
        let mut link = sensor_link(5);
        let data = {
            let mut m = Message::data(DeviceId(7), DeviceId(5), 3, 500, vec![9]);
            m.hop = DeviceId(5);
            m
        };
        link.on_frame(&data.to_bytes(), 0);

        let sent = frames(&link);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageKind::Ack);
        assert_eq!(sent[0].destination, DeviceId(7));
        assert_eq!(sent[0].sequence, 3);

        assert_eq!(link.poll_events(), vec![LinkEvent::Data(data)]);
    }

    #[test]
    fn test_duplicate_data_reacked_not_redelivered() {
        let mut link = sensor_link(5);
        let mut data = Message::data(DeviceId(7), DeviceId(5), 3, 0, vec![9]);
        data.hop = DeviceId(5);

        link.on_frame(&data.to_bytes(), 0);
        link.on_frame(&data.to_bytes(), 100);

        // Both copies were ACKed, only one reached the upper layer.
        assert_eq!(link.stats().acks_tx, 2);
        assert_eq!(link.poll_events().len(), 1);
        assert_eq!(link.stats().duplicates_suppressed, 1);
    }

    #[test]
    fn test_relay_forwards_once_per_window() {
        // Node 1 relays for node 2 in a 2 -> 1 -> gateway chain.
        let mut config = NodeConfig::sensor(DeviceId(1));
        config.topology = crate::router::Topology::from_pairs(&[(DeviceId(2), DeviceId(1))]);
        let mut link = ReliableLink::new(&config, RecordingTransport::default());

        let mut data = Message::data(DeviceId(2), DeviceId::GATEWAY, 8, 0, vec![1]);
        data.hop = DeviceId(1);

        link.on_frame(&data.to_bytes(), 0);
        link.on_frame(&data.to_bytes(), 100);

        let sent = frames(&link);
        assert_eq!(sent.len(), 1, "second copy inside the window is suppressed");
        assert_eq!(sent[0].kind, MessageKind::Data);
        assert_eq!(sent[0].hop, DeviceId::GATEWAY);
        assert_eq!(sent[0].sender, DeviceId(2));
        assert_eq!(link.stats().duplicates_suppressed, 1);

        // No PendingSend for relayed traffic.
        assert_eq!(link.pending_len(), 0);

        // After the window a retry from the sender traverses again.
        link.tick(600);
        link.on_frame(&data.to_bytes(), 600);
        assert_eq!(frames(&link).len(), 2);
    }

    #[test]
    fn test_relay_forwards_ack_reverse_path() {
        let mut config = NodeConfig::sensor(DeviceId(1));
        config.topology = crate::router::Topology::from_pairs(&[(DeviceId(2), DeviceId(1))]);
        let mut link = ReliableLink::new(&config, RecordingTransport::default());

        let mut ack = Message::ack(DeviceId::GATEWAY, DeviceId(2), 8, 0);
        ack.hop = DeviceId(1);
        link.on_frame(&ack.to_bytes(), 0);

        let sent = frames(&link);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageKind::Ack);
        assert_eq!(sent[0].hop, DeviceId(2));
    }

    #[test]
    fn test_foreign_hop_ignored() {
        let mut link = sensor_link(5);
        let mut data = Message::data(DeviceId(7), DeviceId::GATEWAY, 3, 0, vec![9]);
        data.hop = DeviceId(6);
        link.on_frame(&data.to_bytes(), 0);

        assert!(link.poll_events().is_empty());
        assert!(link.transport.frames.is_empty());
        assert_eq!(link.stats().frames_ignored, 1);
    }

    #[test]
    fn test_pending_bounded() {
        let mut config = NodeConfig::sensor(DeviceId(5));
        config.max_pending = 2;
        let mut link = ReliableLink::new(&config, RecordingTransport::default());

        link.send(DeviceId::GATEWAY, vec![1], 0, 0).unwrap();
        link.send(DeviceId::GATEWAY, vec![2], 0, 0).unwrap();
        assert_eq!(
            link.send(DeviceId::GATEWAY, vec![3], 0, 0),
            Err(LinkError::PendingFull(2))
        );
        assert_eq!(link.stats().rejected_sends, 1);
    }

    #[test]
    fn test_time_sync_flood_dedup() {
        let mut link = sensor_link(5);
        let sync = Message::time_sync(DeviceId::GATEWAY, 0, 1_000_000);

        link.on_frame(&sync.to_bytes(), 0);
        link.on_frame(&sync.to_bytes(), 10);

        // Delivered upward once, re-flooded once.
        assert_eq!(link.poll_events(), vec![LinkEvent::TimeSync(sync.clone())]);
        let sent = frames(&link);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], sync);
    }

    #[test]
    fn test_own_sync_echo_dropped() {
        let mut config = NodeConfig::gateway();
        config.device_id = DeviceId::GATEWAY;
        let mut link = ReliableLink::new(&config, RecordingTransport::default());
        link.send_time_sync(1_000_000);

        let echo = frames(&link)[0].clone();
        link.on_frame(&echo.to_bytes(), 1);
        assert!(link.poll_events().is_empty());
        assert_eq!(link.transport.frames.len(), 1);
    }

    #[test]
    fn test_payload_too_large() {
        let mut link = sensor_link(5);
        let result = link.send(DeviceId::GATEWAY, vec![0; 300], 0, 0);
        assert_eq!(result, Err(LinkError::PayloadTooLarge(300)));
    }
}
