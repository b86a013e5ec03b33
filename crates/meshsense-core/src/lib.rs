//! # meshsense-core
//!
//! Protocol core for a battery-powered environmental sensor mesh: sensor
//! nodes sample temperature, pressure, humidity, and battery state, then
//! relay the readings (possibly over multiple hops) to a single gateway
//! that uploads them over HTTP.
//!
//! The crate implements:
//!
//! - **Reliable delivery**: per-message ACKs with bounded retransmission
//!   (`resend_times` retries, `ack_timeout_ms` apart); every send resolves
//!   to Delivered or Exhausted, never silence
//! - **Static routing**: a baked-in next-hop-toward-gateway table; the ACK
//!   path is the same table inverted
//! - **Time synchronization**: the gateway floods network time, nodes keep
//!   a signed offset from local uptime
//! - **Measurement scheduling**: one sampled-and-reported cycle per
//!   `measure_interval_ms`, guarded against overlap
//! - **Upload pipeline**: gateway-side URL formatting and HTTP dispatch
//!   with its own retry bound
//!
//! The whole core runs single-threaded on a virtual millisecond clock:
//! callers pass local uptime into `tick`/`on_frame`, which makes the
//! timing behavior deterministic and exactly testable. The [`sim`] module
//! runs a complete network on that clock without hardware.
//!
//! ## Example
//!
//! ```
//! use meshsense_core::sim::{MeshSimulator, SimConfig, SimTopology};
//!
//! let config = SimConfig::default()
//!     .with_sensors(4)
//!     .with_topology(SimTopology::Chain)
//!     .with_drop_rate(0.1);
//! let mut sim = MeshSimulator::new(config);
//! sim.run(130_000);
//!
//! let summary = sim.summary();
//! assert!(summary.records_uploaded > 0);
//! ```

pub mod clock;
pub mod config;
pub mod link;
pub mod message;
pub mod node;
pub mod router;
pub mod schedule;
pub mod sensors;
pub mod sim;
pub mod transport;
pub mod upload;

// Re-export main types
pub use clock::{NetworkClock, NetworkTimeSource, SystemTimeSource};
pub use config::{ConfigError, NodeConfig, Role, UploadConfig};
pub use link::{LinkError, LinkEvent, LinkStats, ReliableLink};
pub use message::{DeviceId, MeasurementRecord, Message, MessageKind};
pub use node::{GatewayNode, SensorNode};
pub use router::{Router, Topology, TopologyLink};
pub use schedule::{MeasureScheduler, ScheduleState, ScheduleStats};
pub use sensors::{BatteryGauge, BatteryReading, EnvironmentReading, EnvironmentSensor};
pub use transport::{FrameTransport, TransportError};
pub use upload::{HttpTransport, UploadError, UploadPipeline};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{NodeConfig, Role, UploadConfig};
    pub use crate::link::{LinkEvent, ReliableLink};
    pub use crate::message::{DeviceId, MeasurementRecord, Message, MessageKind};
    pub use crate::node::{GatewayNode, SensorNode};
    pub use crate::router::Topology;
    pub use crate::transport::FrameTransport;
    pub use crate::upload::HttpTransport;
}
