//! Per-attempt browser identities.
//!
//! Every attempt presents a fresh user agent and a freshly randomized cookie
//! set so consecutive requests cannot be linked through them.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::UserAgentMode;

/// Fixed text-browser identity used by [`UserAgentMode::Legacy`].
pub const LEGACY_USER_AGENT: &str = "Lynx/2.9.2 libwww-FM/2.14 SSL-MM/1.4.1 OpenSSL/3.4.0";

const DESKTOP_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
];

const MOBILE_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 13; SM-S918B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 13; Pixel 7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36",
];

/// User agent plus cookie set presented with one outbound attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityProfile {
    pub user_agent: String,
    pub cookies: BTreeMap<String, String>,
}

impl IdentityProfile {
    /// Renders the cookies as a `Cookie` header value.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Source of identities for the dispatcher.
pub trait IdentitySource: Send + Sync {
    /// Draws a new identity; `mobile` selects the mobile device class.
    fn next(&self, mobile: bool) -> IdentityProfile;

    /// Identity built around an explicit user agent.
    fn with_user_agent(&self, user_agent: &str) -> IdentityProfile {
        IdentityProfile {
            user_agent: user_agent.to_string(),
            cookies: fresh_cookies(),
        }
    }
}

/// Default identity source driven by [`UserAgentMode`].
#[derive(Debug, Clone, Default)]
pub struct IdentityRotator {
    mode: UserAgentMode,
}

impl IdentityRotator {
    /// Creates a rotator for the given user-agent mode.
    pub fn new(mode: UserAgentMode) -> Self {
        Self { mode }
    }

    /// Configured user-agent mode.
    pub fn mode(&self) -> &UserAgentMode {
        &self.mode
    }

    fn user_agent(&self, mobile: bool) -> String {
        match &self.mode {
            UserAgentMode::Legacy => LEGACY_USER_AGENT.to_string(),
            UserAgentMode::Custom(ua) if !ua.trim().is_empty() => ua.clone(),
            _ => random_user_agent(mobile).to_string(),
        }
    }
}

impl IdentitySource for IdentityRotator {
    fn next(&self, mobile: bool) -> IdentityProfile {
        IdentityProfile {
            user_agent: self.user_agent(mobile),
            cookies: fresh_cookies(),
        }
    }
}

/// Uniform draw from the curated pool of the given device class.
pub fn random_user_agent(mobile: bool) -> &'static str {
    let pool = if mobile {
        MOBILE_USER_AGENTS
    } else {
        DESKTOP_USER_AGENTS
    };
    pool.choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(DESKTOP_USER_AGENTS[0])
}

/// Minimal consent/session cookie set with new random tokens.
pub fn fresh_cookies() -> BTreeMap<String, String> {
    let mut rng = rand::thread_rng();
    let nid: u128 = rng.gen_range(100_000_000_000_000_000_000..=999_999_999_999_999_999_999);
    let aec: u32 = rng.gen_range(10_000_000..=99_999_999);

    BTreeMap::from([
        ("CONSENT".to_string(), "PENDING+987".to_string()),
        ("SOCS".to_string(), "CAESHAgBEhIaAB".to_string()),
        ("NID".to_string(), format!("511={}", nid)),
        ("AEC".to_string(), format!("Ae3NU9M{}", aec)),
    ])
}
