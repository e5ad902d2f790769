use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use tracing::{info, debug, error};

/// Maximum number of identifiers tracked in a single batch
pub const IDENTIFIER_CAP: usize = 3;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RankerConfig {
    pub scan: ScanSettings,
    pub listing: ListingSettings,
    pub fetch: FetchSettings,
    pub pacing: PacingSettings,
    pub channel: ChannelSettings,
}

/// Batch scan settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScanSettings {
    pub max_pages: u32,
    pub page_size: u32,  // Organic slots per listing page
}

/// Where the result listing lives and how to read it
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ListingSettings {
    pub base_url: String,
    pub search_path: String,
    pub keyword_param: String,
    pub page_param: String,
    pub item_selector: String,
    pub identifier_attribute: String,
    pub action_selector: String,
    pub promoted_selector: String,
    pub blocked_selector: Option<String>,
}

/// Page fetch settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FetchSettings {
    pub backend: FetchBackend,
    pub user_agent: String,
    pub cookie: Option<String>,
    pub timeout_secs: u64,
    pub webdriver_url: String,
    pub headless: bool,
    pub fingerprints: Vec<BrowserFingerprint>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FetchBackend {
    Http,
    Webdriver,
}

/// Header set presented to the listing site
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrowserFingerprint {
    pub name: String,
    pub user_agent: String,
    pub accept_language: String,
}

/// Request spacing and retry policy
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PacingSettings {
    pub request_delay_ms: (u64, u64),  // Min and max wait before each request
    pub retry_delay_ms: (u64, u64),    // Min and max backoff after a failure
    pub max_attempts: u32,
}

/// Controller/worker channel settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChannelSettings {
    pub name: String,
    pub origin: String,
    pub resume_delay_ms: u64,
    pub reconnect_delay_ms: u64,
}

impl Default for RankerConfig {
    fn default() -> Self {
        let user_agent = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string();

        Self {
            scan: ScanSettings::default(),
            listing: ListingSettings::default(),
            fetch: FetchSettings {
                backend: FetchBackend::Http,
                user_agent: user_agent.clone(),
                cookie: None,
                timeout_secs: 30,
                webdriver_url: "http://localhost:4444".to_string(),
                headless: true,
                fingerprints: vec![
                    BrowserFingerprint {
                        name: "windows_chrome".to_string(),
                        user_agent,
                        accept_language: "en-US,en;q=0.9".to_string(),
                    },
                    BrowserFingerprint {
                        name: "mac_safari".to_string(),
                        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15".to_string(),
                        accept_language: "en-US,en;q=0.8".to_string(),
                    },
                ],
            },
            pacing: PacingSettings::default(),
            channel: ChannelSettings {
                name: "rank-scanner-port".to_string(),
                origin: "https://www.amazon.com".to_string(),
                resume_delay_ms: 100,
                reconnect_delay_ms: 500,
            },
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            max_pages: 5,
            page_size: 48,
        }
    }
}

impl Default for ListingSettings {
    fn default() -> Self {
        Self {
            base_url: "https://www.amazon.com".to_string(),
            search_path: "/s".to_string(),
            keyword_param: "k".to_string(),
            page_param: "page".to_string(),
            item_selector: "div[data-asin]".to_string(),
            identifier_attribute: "data-asin".to_string(),
            action_selector: "button.a-button-text, a.a-button-text".to_string(),
            promoted_selector: ".puis-sponsored-label-text".to_string(),
            blocked_selector: Some("form[action='/errors/validateCaptcha']".to_string()),
        }
    }
}

impl Default for PacingSettings {
    fn default() -> Self {
        Self {
            request_delay_ms: (3000, 5000),
            retry_delay_ms: (30000, 60000),
            max_attempts: 2,
        }
    }
}

impl RankerConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "rank-scanner", "rank-scanner") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        // Create the sites directory if it doesn't exist
        path.push("sites");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path.pop();
        path
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load a configuration profile
    pub fn load_profile(profile: &str) -> Result<Self> {
        let profile_path = Self::config_dir().join("sites").join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    /// Load the named profile, or the default configuration when none is given
    pub fn load(profile: Option<&str>) -> Result<Self> {
        let config = match profile {
            Some(name) => Self::load_profile(name)
                .context(format!("Failed to load profile: {}", name))?,
            None => Self::load_default()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        Ok(config)
    }

    /// Reject settings the scanner cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.scan.max_pages < 1 {
            anyhow::bail!("scan.max_pages must be at least 1");
        }
        if self.scan.page_size < 1 {
            anyhow::bail!("scan.page_size must be at least 1");
        }
        if self.pacing.max_attempts < 1 {
            anyhow::bail!("pacing.max_attempts must be at least 1");
        }

        let (min, max) = self.pacing.request_delay_ms;
        if min > max {
            anyhow::bail!("pacing.request_delay_ms range is inverted: {} > {}", min, max);
        }
        let (min, max) = self.pacing.retry_delay_ms;
        if min > max {
            anyhow::bail!("pacing.retry_delay_ms range is inverted: {} > {}", min, max);
        }

        Ok(())
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_path = Self::config_dir().join("default.yaml");
        self.save_to_file(&config_path)
    }

    /// Save the configuration as a profile
    pub async fn save_as_profile(&self, profile: &str) -> Result<()> {
        let sites_dir = Self::config_dir().join("sites");

        if !sites_dir.exists() {
            fs::create_dir_all(&sites_dir)
                .context(format!("Failed to create sites directory: {}", sites_dir.display()))?;
        }

        let profile_path = sites_dir.join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)
    }

    /// Save the configuration to a file
    fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List all available profiles
    pub async fn list_profiles() -> Result<Vec<String>> {
        let sites_dir = Self::config_dir().join("sites");

        if !sites_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();

        for entry in fs::read_dir(sites_dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                    profiles.push(name.to_string());
                }
            }
        }

        profiles.sort();
        Ok(profiles)
    }
}
