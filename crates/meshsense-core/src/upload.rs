//! Gateway upload pipeline
//!
//! Once the mesh has delivered a measurement to the gateway, this
//! pipeline formats it into the fixed collection-endpoint URL and
//! dispatches it through the HTTP transport collaborator. The pipeline
//! retries on its own bound, independent of the mesh-layer retry budget:
//! a record is mesh-delivered the moment the gateway ACKed it, whatever
//! happens to the upload afterwards.

use crate::config::UploadConfig;
use crate::message::MeasurementRecord;
use chrono::DateTime;
use std::collections::VecDeque;
use std::fmt::Write as _;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("http transport failure: {0}")]
    Transport(String),
    #[error("server returned status {0}")]
    Status(u16),
    #[error("upload failed after {0} attempts")]
    AttemptsExhausted(u32),
}

/// HTTP transport collaborator. The core formats URLs and headers; the
/// mechanics below this boundary are someone else's problem.
pub trait HttpTransport {
    fn request(&mut self, url: &str, headers: &[(String, String)]) -> Result<u16, UploadError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    /// Records successfully uploaded.
    pub uploaded: u64,
    /// Individual request attempts that failed.
    pub attempt_failures: u64,
    /// Records dropped after spending the upload retry bound.
    pub failed: u64,
}

/// Format the fixed upload URL with its ordered substitutions: site,
/// device, serial, time, battery voltage, battery percentage,
/// temperature, pressure, humidity. Readings the sensor did not provide
/// are omitted; parameter order is otherwise fixed.
pub fn format_upload_url(config: &UploadConfig, record: &MeasurementRecord) -> String {
    let mut url = format!(
        "{}?site={}&device={}&serial={}&time={}",
        config.endpoint,
        config.site,
        record.device_id,
        record.serial,
        format_timestamp(record.timestamp_ms),
    );
    if let Some(v) = record.battery_voltage {
        let _ = write!(url, "&battery_voltage={:.2}", v);
    }
    if let Some(v) = record.battery_percentage {
        let _ = write!(url, "&battery_percentage={:.2}", v);
    }
    if let Some(v) = record.temperature {
        let _ = write!(url, "&bme_temperature={:.1}", v);
    }
    if let Some(v) = record.pressure {
        let _ = write!(url, "&bme_pressure={:.1}", v);
    }
    if let Some(v) = record.humidity {
        let _ = write!(url, "&bme_humidity={:.1}", v);
    }
    url
}

/// ISO-ish UTC timestamp, second resolution.
fn format_timestamp(timestamp_ms: u64) -> String {
    match DateTime::from_timestamp_millis(timestamp_ms as i64) {
        Some(t) => t.format("%Y-%m-%dT%H:%M:%S").to_string(),
        None => "1970-01-01T00:00:00".to_string(),
    }
}

/// The gateway-side upload pipeline.
pub struct UploadPipeline<H: HttpTransport> {
    config: UploadConfig,
    transport: H,
    stats: UploadStats,
}

impl<H: HttpTransport> UploadPipeline<H> {
    pub fn new(config: UploadConfig, transport: H) -> Self {
        Self {
            config,
            transport,
            stats: UploadStats::default(),
        }
    }

    pub fn stats(&self) -> UploadStats {
        self.stats
    }

    pub fn transport(&self) -> &H {
        &self.transport
    }

    /// Upload one record, retrying up to the pipeline's own bound.
    ///
    /// Exhaustion is reported to the caller and counted; it never affects
    /// mesh-layer delivery state.
    pub fn upload(&mut self, record: &MeasurementRecord) -> Result<u16, UploadError> {
        let url = format_upload_url(&self.config, record);
        let headers = [(
            "Authorization".to_string(),
            format!(
                "{} {}",
                self.config.authorization_scheme, self.config.authorization_token
            ),
        )];

        for attempt in 1..=self.config.max_attempts {
            match self.transport.request(&url, &headers) {
                Ok(status) if (200..300).contains(&status) => {
                    debug!(device = %record.device_id, serial = record.serial, status, "uploaded");
                    self.stats.uploaded += 1;
                    return Ok(status);
                }
                Ok(status) => {
                    self.stats.attempt_failures += 1;
                    let err = UploadError::Status(status);
                    warn!(attempt, %err, "upload rejected by server");
                }
                Err(err) => {
                    self.stats.attempt_failures += 1;
                    warn!(attempt, %err, "upload transport failure");
                }
            }
        }
        self.stats.failed += 1;
        Err(UploadError::AttemptsExhausted(self.config.max_attempts))
    }
}

/// HTTP transport double recording every request, for tests and the
/// simulator. Responds with queued results, then 200s.
#[derive(Debug, Default)]
pub struct RecordingHttpTransport {
    pub requests: Vec<String>,
    pub headers: Vec<Vec<(String, String)>>,
    pub responses: VecDeque<Result<u16, UploadError>>,
}

impl HttpTransport for RecordingHttpTransport {
    fn request(&mut self, url: &str, headers: &[(String, String)]) -> Result<u16, UploadError> {
        self.requests.push(url.to_string());
        self.headers.push(headers.to_vec());
        self.responses.pop_front().unwrap_or(Ok(200))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DeviceId;

    fn sample_record() -> MeasurementRecord {
        MeasurementRecord {
            device_id: DeviceId(5),
            serial: 12,
            // 2024-02-21T16:00:00 UTC
            timestamp_ms: 1_708_531_200_000,
            battery_voltage: Some(3.87),
            battery_percentage: Some(92.5),
            temperature: Some(21.44),
            pressure: Some(1013.25),
            humidity: Some(61.0),
        }
    }

    #[test]
    fn test_url_substitution_order() {
        let url = format_upload_url(&UploadConfig::default(), &sample_record());
        assert_eq!(
            url,
            "http://103.254.119.82:18080/REST/upload?site=HKAGE&device=5&serial=12\
             &time=2024-02-21T16:00:00&battery_voltage=3.87&battery_percentage=92.50\
             &bme_temperature=21.4&bme_pressure=1013.2&bme_humidity=61.0"
        );
    }

    #[test]
    fn test_url_omits_absent_readings() {
        let record = MeasurementRecord {
            battery_voltage: None,
            pressure: None,
            ..sample_record()
        };
        let url = format_upload_url(&UploadConfig::default(), &record);
        assert!(!url.contains("battery_voltage"));
        assert!(!url.contains("bme_pressure"));
        assert!(url.contains("battery_percentage=92.50"));
        assert!(url.contains("&bme_humidity=61.0"));
    }

    #[test]
    fn test_upload_sends_authorization() {
        let mut pipeline =
            UploadPipeline::new(UploadConfig::default(), RecordingHttpTransport::default());
        pipeline.upload(&sample_record()).unwrap();

        let headers = &pipeline.transport().headers[0];
        assert_eq!(headers[0].0, "Authorization");
        assert_eq!(headers[0].1, "Basic THISISTOKEN");
    }

    #[test]
    fn test_upload_retries_then_succeeds() {
        let mut transport = RecordingHttpTransport::default();
        transport.responses.push_back(Ok(500));
        transport
            .responses
            .push_back(Err(UploadError::Transport("connection reset".into())));
        transport.responses.push_back(Ok(200));

        let mut pipeline = UploadPipeline::new(UploadConfig::default(), transport);
        assert_eq!(pipeline.upload(&sample_record()), Ok(200));
        assert_eq!(pipeline.transport().requests.len(), 3);
        assert_eq!(pipeline.stats().attempt_failures, 2);
        assert_eq!(pipeline.stats().uploaded, 1);
    }

    #[test]
    fn test_upload_exhausts_own_bound() {
        let mut transport = RecordingHttpTransport::default();
        for _ in 0..3 {
            transport.responses.push_back(Ok(503));
        }
        let mut pipeline = UploadPipeline::new(UploadConfig::default(), transport);

        assert_eq!(
            pipeline.upload(&sample_record()),
            Err(UploadError::AttemptsExhausted(3))
        );
        assert_eq!(pipeline.stats().failed, 1);
        // The next record is unaffected.
        assert_eq!(pipeline.upload(&sample_record()), Ok(200));
    }
}
