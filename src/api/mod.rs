use std::time::Duration;

use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};
use crate::server::RestoreRequest;

/// Inference can take a while on a cold accelerator.
const TIMEOUT: Duration = Duration::from_secs(90);

pub struct Client {
    base_url: Url,
    client: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = if base_url.starts_with("http://") || base_url.starts_with("https://") {
            base_url.to_string()
        } else {
            format!("http://{}", base_url)
        };
        let base_url = Url::parse(&base).map_err(|e| Error::Client(format!("invalid server URL {}: {}", base, e)))?;

        let client = reqwest::Client::builder()
            .connect_timeout(TIMEOUT)
            .timeout(TIMEOUT)
            .build()?;

        Ok(Self { base_url, client })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(&crate::envconfig::server_url())
    }

    pub fn restore_url(&self) -> Result<Url> {
        self.base_url
            .join("restore")
            .map_err(|e| Error::Client(format!("invalid restore URL: {}", e)))
    }

    pub async fn restore(&self, text: &str) -> Result<String> {
        let response = self
            .client
            .post(self.restore_url()?)
            .json(&RestoreRequest { text: Some(text.to_string()) })
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        parse_prediction(&body)
    }
}

/// Accepts both `{"prediction": "..."}` and a bare body.
pub fn parse_prediction(body: &str) -> Result<String> {
    let trimmed = body.trim();
    if !trimmed.starts_with('{') {
        return Ok(trimmed.to_string());
    }

    let value: Value = serde_json::from_str(trimmed)?;
    match value.get("prediction") {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(Error::Client("response has no prediction".to_string())),
    }
}
