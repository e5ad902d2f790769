use anyhow::{Result, Context};
use async_trait::async_trait;
use reqwest::{header, Client};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::browser::fingerprint::{FingerprintManager, SessionFingerprint};
use crate::cli::config::FetchSettings;
use crate::crawler::error::FetchError;

/// Anything that can return the raw HTML of a listing page
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, url: &Url) -> Result<String, FetchError>;
}

/// Plain HTTP page source carrying session cookies and fingerprint headers
pub struct HttpPageSource {
    client: Client,
    cookie: Option<String>,
    fingerprint: SessionFingerprint,
    timeout: Duration,
}

impl HttpPageSource {
    pub fn new(config: &FetchSettings) -> Result<Self> {
        let fingerprint = FingerprintManager::new(config.fingerprints.clone(), config.user_agent.clone())
            .random_fingerprint();
        let timeout = Duration::from_secs(config.timeout_secs);

        let client = Client::builder()
            .cookie_store(true)
            .user_agent(fingerprint.user_agent.clone())
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        debug!("HTTP page source using fingerprint: {}", fingerprint.name);

        Ok(Self {
            client,
            cookie: config.cookie.clone(),
            fingerprint,
            timeout,
        })
    }

    fn map_error(&self, error: reqwest::Error) -> FetchError {
        if error.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Transport(error.to_string())
        }
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_page(&self, url: &Url) -> Result<String, FetchError> {
        let mut request = self.client.get(url.clone());

        for (name, value) in self.fingerprint.headers() {
            request = request.header(name, value);
        }
        if let Some(cookie) = &self.cookie {
            request = request.header(header::COOKIE, cookie.as_str());
        }

        debug!("Fetching listing page: {}", url);

        let response = request.send().await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        response.text().await
            .map_err(|e| self.map_error(e))
    }
}
