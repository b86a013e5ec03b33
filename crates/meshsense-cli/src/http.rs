//! Blocking HTTP transport for the gateway upload path.

use meshsense_core::upload::{HttpTransport, UploadError};
use reqwest::blocking::Client;
use std::time::Duration;

/// Upload transport backed by a blocking reqwest client.
pub struct BlockingHttpTransport {
    client: Client,
}

impl BlockingHttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, UploadError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| UploadError::Transport(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpTransport for BlockingHttpTransport {
    fn request(&mut self, url: &str, headers: &[(String, String)]) -> Result<u16, UploadError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .map_err(|err| UploadError::Transport(err.to_string()))?;
        Ok(response.status().as_u16())
    }
}
