//! Node configuration
//!
//! Every tunable the firmware used to carry as a compile-time constant
//! lives here as a field of an immutable [`NodeConfig`], constructed once
//! at startup and passed by reference into each component. `validate()`
//! enforces the timing contract the protocol depends on:
//!
//! ```text
//! ack_timeout_ms * resend_times < send_interval_ms < measure_interval_ms
//! ```

use crate::message::DeviceId;
use crate::router::Topology;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role a node plays in the mesh, selected once at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Receives measurements and uploads them over HTTP. Always device 0.
    Gateway,
    /// Samples sensors and reports toward the gateway.
    Sensor,
}

/// Configuration errors detected at startup validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("device id {0} out of range [0, {1})")]
    DeviceIdOutOfRange(u8, u8),
    #[error("device 0 is reserved for the gateway role")]
    GatewayIdMismatch,
    #[error("retry budget does not fit the send interval: ack_timeout {ack_timeout_ms} ms * {resend_times} resends >= send_interval {send_interval_ms} ms")]
    RetryBudgetTooLarge {
        ack_timeout_ms: u64,
        resend_times: u32,
        send_interval_ms: u64,
    },
    #[error("send_interval {send_interval_ms} ms must be shorter than measure_interval {measure_interval_ms} ms")]
    SendIntervalTooLarge {
        send_interval_ms: u64,
        measure_interval_ms: u64,
    },
    #[error("device {0} cannot reach the gateway through the topology table")]
    UnreachableDevice(u8),
    #[error("topology entry for device {0} points at itself")]
    SelfLoop(u8),
}

/// HTTP upload parameters for the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Collection endpoint, scheme through path.
    pub endpoint: String,
    /// Site tag included in every upload.
    pub site: String,
    /// Authorization scheme, e.g. `Basic`.
    pub authorization_scheme: String,
    /// Authorization token presented with every request.
    pub authorization_token: String,
    /// Upload retry bound, independent of the mesh-layer `resend_times`.
    pub max_attempts: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://103.254.119.82:18080/REST/upload".to_string(),
            site: "HKAGE".to_string(),
            authorization_scheme: "Basic".to_string(),
            authorization_token: "THISISTOKEN".to_string(),
            max_attempts: 3,
        }
    }
}

/// Immutable per-node configuration.
///
/// Defaults mirror the deployed firmware constants. All values are
/// read-only inputs at startup; no component mutates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's identity.
    pub device_id: DeviceId,
    /// Size of the device identity space.
    pub number_of_devices: u8,
    /// Gateway or sensor.
    pub role: Role,
    /// Static next-hop-toward-gateway table; empty means single-hop.
    pub topology: Topology,
    /// Retransmissions after the initial attempt.
    pub resend_times: u32,
    /// How long to wait for an ACK before retransmitting, milliseconds.
    pub ack_timeout_ms: u64,
    /// Worst-case budget for one send attempt sequence, milliseconds.
    pub send_interval_ms: u64,
    /// Measurement cycle length, milliseconds.
    pub measure_interval_ms: u64,
    /// Network-time redistribution period, milliseconds.
    pub ntp_interval_ms: u64,
    /// Relay forwarding suppression window, milliseconds.
    pub relay_dedup_window_ms: u64,
    /// Upper bound on concurrent in-flight sends.
    pub max_pending: usize,
    /// Gateway upload parameters.
    pub upload: UploadConfig,
    /// Static shared secret distributed with the firmware image.
    pub secret_key: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_id: DeviceId(10),
            number_of_devices: 20,
            role: Role::Sensor,
            topology: Topology::default(),
            resend_times: 3,
            ack_timeout_ms: 1_000,
            send_interval_ms: 6_000,
            measure_interval_ms: 60_000,
            ntp_interval_ms: 6_543_210,
            relay_dedup_window_ms: 500,
            max_pending: 8,
            upload: UploadConfig::default(),
            secret_key: "Ver 2024-02-24".to_string(),
        }
    }
}

impl NodeConfig {
    /// Convenience constructor for a gateway configuration.
    pub fn gateway() -> Self {
        Self {
            device_id: DeviceId::GATEWAY,
            role: Role::Gateway,
            ..Self::default()
        }
    }

    /// Convenience constructor for a sensor configuration.
    pub fn sensor(device_id: DeviceId) -> Self {
        Self {
            device_id,
            role: Role::Sensor,
            ..Self::default()
        }
    }

    /// Receiver-side delivery dedup window: spans a full retry burst so a
    /// duplicate DATA is re-ACKed but never re-delivered upward.
    pub fn delivery_dedup_window_ms(&self) -> u64 {
        self.send_interval_ms
    }

    /// Validate the configuration before any component starts.
    ///
    /// Rejects timing contracts the scheduler cannot honor, identities
    /// outside the device space, and topology tables that strand a
    /// device away from the gateway.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.as_u8() >= self.number_of_devices {
            return Err(ConfigError::DeviceIdOutOfRange(
                self.device_id.as_u8(),
                self.number_of_devices,
            ));
        }
        match self.role {
            Role::Gateway if !self.device_id.is_gateway() => {
                return Err(ConfigError::GatewayIdMismatch)
            }
            Role::Sensor if self.device_id.is_gateway() => {
                return Err(ConfigError::GatewayIdMismatch)
            }
            _ => {}
        }
        if self.ack_timeout_ms * self.resend_times as u64 >= self.send_interval_ms {
            return Err(ConfigError::RetryBudgetTooLarge {
                ack_timeout_ms: self.ack_timeout_ms,
                resend_times: self.resend_times,
                send_interval_ms: self.send_interval_ms,
            });
        }
        if self.send_interval_ms >= self.measure_interval_ms {
            return Err(ConfigError::SendIntervalTooLarge {
                send_interval_ms: self.send_interval_ms,
                measure_interval_ms: self.measure_interval_ms,
            });
        }
        self.topology.validate(self.number_of_devices)?;
        Ok(())
    }
}
