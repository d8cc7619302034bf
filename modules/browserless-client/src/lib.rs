pub mod error;

pub use error::{BrowserlessError, Result, TRANSIENT_STATUS_CODES};

use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::debug;

pub struct BrowserlessClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl BrowserlessClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        Self::with_timeout(base_url, token, Duration::from_secs(60))
    }

    pub fn with_timeout(base_url: &str, token: Option<&str>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let mut endpoint = format!("{}/{path}", self.base_url);
        if let Some(ref token) = self.token {
            endpoint.push_str(&format!("?token={token}"));
        }
        endpoint
    }

    /// Fetch fully-rendered HTML content for a URL via Browserless /content endpoint.
    pub async fn content(&self, url: &str) -> Result<String> {
        let body = serde_json::json!({ "url": url });

        let resp = self
            .client
            .post(self.endpoint("content"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserlessError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(resp.text().await?)
    }

    /// Run a Puppeteer function via the /function endpoint and decode its JSON result.
    ///
    /// `code` is an ES module whose default export receives `{ page, context }`.
    pub async fn function<T: DeserializeOwned>(
        &self,
        code: &str,
        context: serde_json::Value,
    ) -> Result<T> {
        let body = serde_json::json!({ "code": code, "context": context });

        let resp = self
            .client
            .post(self.endpoint("function"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserlessError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let text = resp.text().await?;
        debug!(bytes = text.len(), "Browserless function returned");
        Ok(serde_json::from_str(&text)?)
    }
}
