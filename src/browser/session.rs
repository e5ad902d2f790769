use anyhow::{Result, Context};
use async_trait::async_trait;
use thirtyfour::prelude::*;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error};
use url::Url;

use crate::browser::fingerprint::FingerprintManager;
use crate::browser::source::PageSource;
use crate::cli::config::FetchSettings;
use crate::crawler::error::FetchError;

/// Page source backed by a real browser, so the listing sees the
/// browser profile's own cookies and rendering
pub struct BrowserPageSource {
    config: FetchSettings,

    /// Started on first use and reused; navigation and source reads must not interleave
    driver: Mutex<Option<WebDriver>>,
}

impl BrowserPageSource {
    pub fn new(config: FetchSettings) -> Self {
        Self {
            config,
            driver: Mutex::new(None),
        }
    }

    async fn start_driver(&self) -> Result<WebDriver> {
        let fingerprint = FingerprintManager::new(self.config.fingerprints.clone(), self.config.user_agent.clone())
            .random_fingerprint();

        let mut caps = DesiredCapabilities::chrome();
        caps.add_chrome_arg(&format!("--user-agent={}", fingerprint.user_agent))?;
        caps.add_chrome_arg(&format!("--lang={}", fingerprint.language()))?;
        caps.add_chrome_arg("--disable-blink-features=AutomationControlled")?;
        caps.add_chrome_arg("--disable-dev-shm-usage")?;

        if self.config.headless {
            caps.set_headless()?;
        }

        let driver = WebDriver::new(&self.config.webdriver_url, caps).await
            .context("Failed to connect to WebDriver")?;

        driver.set_page_load_timeout(Duration::from_secs(self.config.timeout_secs)).await?;

        debug!("Browser session initialized with fingerprint: {}", fingerprint.name);

        Ok(driver)
    }

    /// Close the browser session
    pub async fn close(&self) {
        if let Some(driver) = self.driver.lock().await.take() {
            if let Err(e) = driver.quit().await {
                error!("Error closing browser session: {}", e);
            }
            debug!("Browser session closed");
        }
    }
}

#[async_trait]
impl PageSource for BrowserPageSource {
    async fn fetch_page(&self, url: &Url) -> Result<String, FetchError> {
        let mut guard = self.driver.lock().await;

        if guard.is_none() {
            let driver = self.start_driver().await
                .map_err(|e| FetchError::Transport(format!("{:#}", e)))?;
            *guard = Some(driver);
        }

        let driver = match guard.as_ref() {
            Some(driver) => driver,
            None => return Err(FetchError::Transport("browser session not initialized".to_string())),
        };

        debug!("Navigating to: {}", url);

        let result: WebDriverResult<String> = async {
            driver.goto(url.as_str()).await?;
            driver.source().await
        }
        .await;

        match result {
            Ok(source) => Ok(source),
            Err(e) => {
                // A broken session is not reused for the retry
                if let Some(driver) = guard.take() {
                    let _ = driver.quit().await;
                }
                Err(FetchError::Transport(e.to_string()))
            }
        }
    }
}

impl Drop for BrowserPageSource {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            tokio::spawn(async move {
                if let Err(e) = driver.quit().await {
                    error!("Error closing browser session during drop: {}", e);
                }
            });
        }
    }
}
