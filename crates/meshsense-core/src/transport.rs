//! Frame transport seam
//!
//! The physical radio (or the gateway's WiFi link) sits behind this
//! trait. It moves fixed-size frames and nothing more: no retries, no
//! acknowledgements, no routing. The reliable delivery layer owns the
//! outbound side exclusively; inbound frames are pushed into the protocol
//! by whoever services the radio.

use thiserror::Error;

/// Transport-level failures. The protocol treats these as a lost frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("frame exceeds the transport MTU: {0} bytes")]
    FrameTooLarge(usize),
    #[error("radio rejected the frame: {0}")]
    Radio(String),
}

/// Outbound half of the radio.
pub trait FrameTransport {
    /// Hand one frame to the radio. Best-effort; delivery is not implied.
    fn send_frame(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
}

/// Transport double that records every frame, for tests.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub frames: Vec<Vec<u8>>,
}

impl FrameTransport for RecordingTransport {
    fn send_frame(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.frames.push(bytes.to_vec());
        Ok(())
    }
}
