//! Wire message types and framing
//!
//! This module defines the frame format carried over the radio and the
//! measurement record carried as a DATA payload.
//!
//! ## Frame Structure
//!
//! ```text
//! ┌──────┬────────┬──────┬──────┬─────────┬──────────────┬─────┬─────────┐
//! │ Kind │ Sender │ Dest │ Hop  │ Seq     │ Timestamp    │ Len │ Payload │
//! │ (1B) │ (1B)   │ (1B) │ (1B) │ (2B BE) │ (8B BE, ms)  │(1B) │ (0-208B)│
//! └──────┴────────┴──────┴──────┴─────────┴──────────────┴─────┴─────────┘
//! ```
//!
//! `Dest` is the ultimate destination; `Hop` is the next receiver on the
//! static route. Relays rewrite `Hop` and leave everything else intact, so
//! (sender, seq) identifies a logical message end to end.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Device identifier within the mesh, `[0, number_of_devices)`.
///
/// Device 0 is always the gateway.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u8);

impl DeviceId {
    /// The single sink of the mesh.
    pub const GATEWAY: DeviceId = DeviceId(0);

    /// Hop address for flooded frames (TIME_SYNC).
    pub const BROADCAST: DeviceId = DeviceId(0xFF);

    pub fn is_gateway(&self) -> bool {
        *self == Self::GATEWAY
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "DeviceId(*)")
        } else {
            write!(f, "DeviceId({})", self.0)
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three message kinds carried by the mesh protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Application payload, acknowledged end to end.
    Data = 0,
    /// Acknowledgment for a DATA message, matched by (sender, seq).
    Ack = 1,
    /// Unacknowledged network-time distribution, flooded gateway-out.
    TimeSync = 2,
}

impl MessageKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(MessageKind::Data),
            1 => Some(MessageKind::Ack),
            2 => Some(MessageKind::TimeSync),
            _ => None,
        }
    }
}

/// A complete mesh frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message kind.
    pub kind: MessageKind,
    /// Originating device.
    pub sender: DeviceId,
    /// Ultimate destination (not the next hop).
    pub destination: DeviceId,
    /// Intended next receiver on the route; BROADCAST for floods.
    pub hop: DeviceId,
    /// Per-sender monotonically increasing counter. ACKs carry the
    /// sequence of the DATA they acknowledge.
    pub sequence: u16,
    /// Synchronized network time at creation, milliseconds.
    pub timestamp_ms: u64,
    /// Application payload (empty for ACKs).
    pub payload: Vec<u8>,
}

impl Message {
    /// Frame header size in bytes.
    pub const HEADER_SIZE: usize = 15;

    /// Maximum payload size, bounded by the radio frame budget.
    pub const MAX_PAYLOAD_SIZE: usize = 208;

    /// Create a DATA message. The hop is filled in by the router.
    pub fn data(
        sender: DeviceId,
        destination: DeviceId,
        sequence: u16,
        timestamp_ms: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind: MessageKind::Data,
            sender,
            destination,
            hop: destination,
            sequence,
            timestamp_ms,
            payload,
        }
    }

    /// Create an ACK for a received DATA message.
    pub fn ack(sender: DeviceId, destination: DeviceId, sequence: u16, timestamp_ms: u64) -> Self {
        Self {
            kind: MessageKind::Ack,
            sender,
            destination,
            hop: destination,
            sequence,
            timestamp_ms,
            payload: Vec::new(),
        }
    }

    /// Create a flooded TIME_SYNC message carrying the network time.
    pub fn time_sync(sender: DeviceId, sequence: u16, network_time_ms: u64) -> Self {
        Self {
            kind: MessageKind::TimeSync,
            sender,
            destination: DeviceId::BROADCAST,
            hop: DeviceId::BROADCAST,
            sequence,
            timestamp_ms: network_time_ms,
            payload: Vec::new(),
        }
    }

    /// Identity used for duplicate detection, stable across hops.
    pub fn dedup_key(&self) -> (DeviceId, u16) {
        (self.sender, self.sequence)
    }

    /// Serialize the frame to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::HEADER_SIZE + self.payload.len());
        bytes.push(self.kind as u8);
        bytes.push(self.sender.0);
        bytes.push(self.destination.0);
        bytes.push(self.hop.0);
        bytes.extend_from_slice(&self.sequence.to_be_bytes());
        bytes.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        bytes.push(self.payload.len().min(Self::MAX_PAYLOAD_SIZE) as u8);
        bytes.extend_from_slice(&self.payload[..self.payload.len().min(Self::MAX_PAYLOAD_SIZE)]);
        bytes
    }

    /// Deserialize a frame from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::HEADER_SIZE {
            return None;
        }
        let kind = MessageKind::from_byte(bytes[0])?;
        let len = bytes[14] as usize;
        if bytes.len() < Self::HEADER_SIZE + len {
            return None;
        }
        Some(Self {
            kind,
            sender: DeviceId(bytes[1]),
            destination: DeviceId(bytes[2]),
            hop: DeviceId(bytes[3]),
            sequence: u16::from_be_bytes([bytes[4], bytes[5]]),
            timestamp_ms: u64::from_be_bytes([
                bytes[6], bytes[7], bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13],
            ]),
            payload: bytes[Self::HEADER_SIZE..Self::HEADER_SIZE + len].to_vec(),
        })
    }
}

/// One measurement cycle's worth of readings from a sensor node.
///
/// Immutable after creation; readings a sensor failed to provide are
/// `None` and travel as absent fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// Reporting device.
    pub device_id: DeviceId,
    /// Sample serial, equal to the mesh sequence number of its DATA message.
    pub serial: u16,
    /// Synchronized network time of the sample, milliseconds.
    pub timestamp_ms: u64,
    /// Battery voltage in volts.
    pub battery_voltage: Option<f32>,
    /// Battery charge in percent.
    pub battery_percentage: Option<f32>,
    /// Ambient temperature in degrees Celsius.
    pub temperature: Option<f32>,
    /// Barometric pressure in hPa.
    pub pressure: Option<f32>,
    /// Relative humidity in percent.
    pub humidity: Option<f32>,
}

// Presence bitmask bits, in substitution order.
const F_VOLTAGE: u8 = 1 << 0;
const F_PERCENTAGE: u8 = 1 << 1;
const F_TEMPERATURE: u8 = 1 << 2;
const F_PRESSURE: u8 = 1 << 3;
const F_HUMIDITY: u8 = 1 << 4;

impl MeasurementRecord {
    /// Encode to a compact DATA payload.
    ///
    /// Layout: device (1B), serial (2B BE), timestamp (8B BE), presence
    /// bitmask (1B), then one f32 BE per present field in mask order.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(12 + 20);
        bytes.push(self.device_id.0);
        bytes.extend_from_slice(&self.serial.to_be_bytes());
        bytes.extend_from_slice(&self.timestamp_ms.to_be_bytes());

        let fields = [
            (F_VOLTAGE, self.battery_voltage),
            (F_PERCENTAGE, self.battery_percentage),
            (F_TEMPERATURE, self.temperature),
            (F_PRESSURE, self.pressure),
            (F_HUMIDITY, self.humidity),
        ];
        let mask = fields
            .iter()
            .filter(|(_, v)| v.is_some())
            .fold(0u8, |acc, (bit, _)| acc | bit);
        bytes.push(mask);
        for (_, value) in fields {
            if let Some(v) = value {
                bytes.extend_from_slice(&v.to_be_bytes());
            }
        }
        bytes
    }

    /// Decode from a DATA payload.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 12 {
            return None;
        }
        let device_id = DeviceId(bytes[0]);
        let serial = u16::from_be_bytes([bytes[1], bytes[2]]);
        let timestamp_ms = u64::from_be_bytes([
            bytes[3], bytes[4], bytes[5], bytes[6], bytes[7], bytes[8], bytes[9], bytes[10],
        ]);
        let mask = bytes[11];

        let mut offset = 12;
        let mut take = |bit: u8| -> Option<Option<f32>> {
            if mask & bit == 0 {
                return Some(None);
            }
            if bytes.len() < offset + 4 {
                return None;
            }
            let v = f32::from_be_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ]);
            offset += 4;
            Some(Some(v))
        };

        Some(Self {
            device_id,
            serial,
            timestamp_ms,
            battery_voltage: take(F_VOLTAGE)?,
            battery_percentage: take(F_PERCENTAGE)?,
            temperature: take(F_TEMPERATURE)?,
            pressure: take(F_PRESSURE)?,
            humidity: take(F_HUMIDITY)?,
        })
    }
}
