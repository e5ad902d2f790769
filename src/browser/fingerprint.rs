use rand::{thread_rng, Rng};
use tracing::debug;

use crate::cli::config::BrowserFingerprint;

/// Picks the header set a fetch session presents to the listing site
pub struct FingerprintManager {
    fingerprints: Vec<BrowserFingerprint>,
    fallback_user_agent: String,
}

/// Resolved fingerprint for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFingerprint {
    pub name: String,
    pub user_agent: String,
    pub accept_language: String,
}

impl SessionFingerprint {
    /// Request headers for this fingerprint, user agent excluded
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8".to_string()),
            ("Accept-Language", self.accept_language.clone()),
            ("Upgrade-Insecure-Requests", "1".to_string()),
        ]
    }

    /// Primary language tag, e.g. `en-US`
    pub fn language(&self) -> &str {
        self.accept_language.split(',').next().unwrap_or("en-US")
    }
}

impl FingerprintManager {
    pub fn new(fingerprints: Vec<BrowserFingerprint>, fallback_user_agent: String) -> Self {
        Self { fingerprints, fallback_user_agent }
    }

    /// Select a random fingerprint, or the configured user agent if none are listed
    pub fn random_fingerprint(&self) -> SessionFingerprint {
        if self.fingerprints.is_empty() {
            return SessionFingerprint {
                name: "default".to_string(),
                user_agent: self.fallback_user_agent.clone(),
                accept_language: "en-US,en;q=0.9".to_string(),
            };
        }

        let mut rng = thread_rng();
        let fingerprint = &self.fingerprints[rng.gen_range(0..self.fingerprints.len())];

        debug!("Selected fingerprint: {}", fingerprint.name);

        SessionFingerprint {
            name: fingerprint.name.clone(),
            user_agent: fingerprint.user_agent.clone(),
            accept_language: fingerprint.accept_language.clone(),
        }
    }
}
