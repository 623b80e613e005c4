//! Dispatcher configuration.
//!
//! Everything here is consumed, not owned: the embedding application decides
//! where values come from. [`DispatchConfig::from_env`] covers the common
//! deployment where settings arrive as environment variables.

use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::proxy::{ProxyConfig, ProxyProtocol};

/// Default number of results requested per page.
pub const DEFAULT_RESULTS_PER_PAGE: u32 = 10;

/// How the user-agent string of each attempt is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserAgentMode {
    /// Uniform draw from the curated browser pool.
    #[default]
    Random,
    /// Fixed text-browser string.
    Legacy,
    /// Caller-supplied string.
    Custom(String),
}

/// Credential used to authenticate to the circuit-control service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ControlAuth {
    /// Authentication cookie written by the anonymity daemon.
    Cookie { path: PathBuf },
    /// Password stored as the last line of a config file.
    Password { conf_path: PathBuf },
}

impl Default for ControlAuth {
    fn default() -> Self {
        ControlAuth::Cookie {
            path: PathBuf::from("/var/lib/tor/control_auth_cookie"),
        }
    }
}

/// What to do when sending a circuit signal fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalFailurePolicy {
    /// Log and carry on to validation.
    #[default]
    FailOpen,
    /// Abort the request with an anonymity error.
    FailClosed,
}

/// Outcome for secondary requests still blocked after the retry bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedFallback {
    /// Return the last (blocked) response as-is.
    #[default]
    LastResponse,
    /// Return the last response with its body emptied.
    Empty,
}

/// Anonymity network settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnonymityConfig {
    /// Route traffic through the anonymity network.
    #[serde(default)]
    pub enabled: bool,
    /// SOCKS address of the anonymity network.
    #[serde(default = "default_socks_addr")]
    pub socks_addr: String,
    /// Address of the circuit-control service.
    #[serde(default = "default_control_addr")]
    pub control_addr: String,
    /// Control-service credential.
    #[serde(default)]
    pub auth: ControlAuth,
    /// Page fetched through the circuit to confirm it works.
    #[serde(default = "default_validation_url")]
    pub validation_url: String,
    /// Substring that marks a successful validation.
    #[serde(default = "default_validation_marker")]
    pub validation_marker: String,
    /// Validation probe timeout in seconds.
    #[serde(default = "default_validation_timeout")]
    pub validation_timeout: u64,
    /// Control-port I/O timeout in seconds.
    #[serde(default = "default_control_timeout")]
    pub control_timeout: u64,
    #[serde(default)]
    pub signal_failure: SignalFailurePolicy,
}

fn default_socks_addr() -> String {
    "127.0.0.1:9050".to_string()
}

fn default_control_addr() -> String {
    "127.0.0.1:9051".to_string()
}

fn default_validation_url() -> String {
    "https://check.torproject.org/".to_string()
}

fn default_validation_marker() -> String {
    "Congratulations".to_string()
}

fn default_validation_timeout() -> u64 {
    10
}

fn default_control_timeout() -> u64 {
    5
}

impl Default for AnonymityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socks_addr: default_socks_addr(),
            control_addr: default_control_addr(),
            auth: ControlAuth::default(),
            validation_url: default_validation_url(),
            validation_marker: default_validation_marker(),
            validation_timeout: default_validation_timeout(),
            control_timeout: default_control_timeout(),
            signal_failure: SignalFailurePolicy::default(),
        }
    }
}

/// A uniformly sampled delay between `min_ms` and `max_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl JitterRange {
    pub const fn from_millis(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub const fn from_secs(min: u64, max: u64) -> Self {
        Self::from_millis(min * 1000, max * 1000)
    }

    /// Draws a delay from the range.
    pub fn sample(&self) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..=self.max_ms))
    }

    pub fn min(&self) -> Duration {
        Duration::from_millis(self.min_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms.max(self.min_ms))
    }
}

/// Backoff ranges and retry bounds of the dispatcher.
///
/// Every branch has its own counter; bounds are retries, not attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Minimum spacing between any two sends sharing a pacer.
    pub pacing: JitterRange,
    pub rate_limited_backoff: JitterRange,
    pub max_rate_limited_retries: u32,
    pub blocked_backoff: JitterRange,
    pub max_blocked_retries: u32,
    pub challenge_backoff: JitterRange,
    pub max_challenge_retries: u32,
    /// One range per timeout retry; the last one repeats.
    pub timeout_backoffs: Vec<JitterRange>,
    pub max_timeout_retries: u32,
    pub connect_backoff: JitterRange,
    pub max_connect_retries: u32,
    /// Upstream request timeout in seconds.
    pub request_timeout: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            pacing: JitterRange::from_secs(1, 3),
            rate_limited_backoff: JitterRange::from_secs(5, 15),
            max_rate_limited_retries: 3,
            blocked_backoff: JitterRange::from_secs(3, 8),
            max_blocked_retries: 3,
            challenge_backoff: JitterRange::from_secs(2, 5),
            max_challenge_retries: 5,
            timeout_backoffs: vec![JitterRange::from_secs(1, 3), JitterRange::from_secs(2, 5)],
            max_timeout_retries: 2,
            connect_backoff: JitterRange::from_secs(2, 5),
            max_connect_retries: 2,
            request_timeout: 30,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the `retry`-th timeout retry (1-based).
    pub fn timeout_backoff(&self, retry: u32) -> JitterRange {
        let index = (retry.saturating_sub(1) as usize).min(self.timeout_backoffs.len().saturating_sub(1));
        self.timeout_backoffs
            .get(index)
            .copied()
            .unwrap_or(JitterRange::from_secs(1, 3))
    }
}

/// Configuration of the dispatch layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_results_per_page")]
    pub results_per_page: u32,
    /// Equivalent search URL templates; the query is appended verbatim.
    /// Empty means the built-in set.
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Suggestion endpoint; encoded parameters are appended.
    #[serde(default = "default_autocomplete_url")]
    pub autocomplete_url: String,
    /// Honour the user agent the client itself sent.
    #[serde(default)]
    pub use_client_user_agent: bool,
    #[serde(default)]
    pub user_agent: UserAgentMode,
    /// Interface language such as `lang_en`.
    #[serde(default)]
    pub lang_interface: String,
    /// Derive `Accept-Language` from the interface language.
    #[serde(default)]
    pub accept_language: bool,
    /// Result language such as `lang_de`.
    #[serde(default)]
    pub lang_search: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub anonymity: AnonymityConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub blocked_fallback: BlockedFallback,
}

fn default_results_per_page() -> u32 {
    DEFAULT_RESULTS_PER_PAGE
}

fn default_autocomplete_url() -> String {
    "https://suggestqueries.google.com/complete/search?client=toolbar&".to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            results_per_page: DEFAULT_RESULTS_PER_PAGE,
            endpoints: Vec::new(),
            autocomplete_url: default_autocomplete_url(),
            use_client_user_agent: false,
            user_agent: UserAgentMode::default(),
            lang_interface: String::new(),
            accept_language: false,
            lang_search: String::new(),
            country: String::new(),
            proxy: None,
            anonymity: AnonymityConfig::default(),
            retry: RetryPolicy::default(),
            blocked_fallback: BlockedFallback::default(),
        }
    }
}

impl DispatchConfig {
    /// Builds a configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let flag = |key: &str| {
            lookup(key)
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false)
        };

        if let Some(n) = lookup("DISPATCH_RESULTS_PER_PAGE").and_then(|v| v.trim().parse().ok()) {
            config.results_per_page = n;
        }
        config.use_client_user_agent = flag("DISPATCH_USE_CLIENT_USER_AGENT");

        if let Some(location) = lookup("DISPATCH_PROXY_LOC").filter(|v| !v.is_empty()) {
            let protocol = lookup("DISPATCH_PROXY_TYPE")
                .and_then(|t| ProxyProtocol::from_scheme(&t))
                .unwrap_or_default();
            let raw = format!("{}://{}", protocol.scheme(), location);
            match ProxyConfig::parse(&raw) {
                Ok(mut proxy) => {
                    if let Some(user) = lookup("DISPATCH_PROXY_USER").filter(|u| !u.is_empty()) {
                        let pass = lookup("DISPATCH_PROXY_PASS").unwrap_or_default();
                        proxy = proxy.with_auth(user, pass);
                    }
                    config.proxy = Some(proxy);
                }
                Err(e) => tracing::warn!("Ignoring DISPATCH_PROXY_LOC: {}", e),
            }
        }

        config.anonymity.enabled = flag("DISPATCH_TOR");
        if let Some(addr) = lookup("DISPATCH_TOR_CONTROL").filter(|v| !v.is_empty()) {
            config.anonymity.control_addr = addr;
        }
        if flag("DISPATCH_TOR_USE_PASS") {
            let conf_path = lookup("DISPATCH_TOR_CONF")
                .map(PathBuf::from)
                .filter(|p| p.is_file())
                .unwrap_or_else(|| PathBuf::from("./misc/tor/control.conf"));
            config.anonymity.auth = ControlAuth::Password { conf_path };
        }

        config
    }

    /// Search URL templates in effect.
    pub fn endpoint_templates(&self) -> Vec<String> {
        if !self.endpoints.is_empty() {
            return self.endpoints.clone();
        }
        let n = self.results_per_page;
        vec![
            format!("https://www.google.com/search?gbv=1&num={}&q=", n),
            format!("https://www.google.com/search?ie=UTF-8&num={}&q=", n),
            format!("https://www.google.com/search?source=hp&num={}&q=", n),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_rate_limited_retries, 3);
        assert_eq!(policy.max_blocked_retries, 3);
        assert_eq!(policy.max_challenge_retries, 5);
        assert_eq!(policy.max_timeout_retries, 2);
        assert_eq!(policy.max_connect_retries, 2);
        assert_eq!(policy.request_timeout, 30);
        assert_eq!(policy.rate_limited_backoff, JitterRange::from_secs(5, 15));
    }

    #[test]
    fn test_timeout_backoff_increases_then_repeats() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.timeout_backoff(1), JitterRange::from_secs(1, 3));
        assert_eq!(policy.timeout_backoff(2), JitterRange::from_secs(2, 5));
        assert_eq!(policy.timeout_backoff(7), JitterRange::from_secs(2, 5));
    }

    #[test]
    fn test_jitter_sample_in_range() {
        let range = JitterRange::from_secs(3, 8);
        for _ in 0..100 {
            let d = range.sample();
            assert!(d >= range.min() && d <= range.max());
        }
    }

    #[test]
    fn test_jitter_degenerate_range() {
        assert_eq!(JitterRange::from_millis(0, 0).sample(), Duration::ZERO);
        assert_eq!(JitterRange::from_millis(50, 10).sample(), Duration::from_millis(50));
    }

    #[test]
    fn test_default_endpoint_templates() {
        let config = DispatchConfig {
            results_per_page: 20,
            ..Default::default()
        };
        let templates = config.endpoint_templates();
        assert_eq!(templates.len(), 3);
        assert!(templates.iter().all(|t| t.contains("num=20") && t.ends_with("&q=")));
    }

    #[test]
    fn test_custom_endpoint_templates() {
        let config = DispatchConfig {
            endpoints: vec!["https://search.local/?q=".to_string()],
            ..Default::default()
        };
        assert_eq!(config.endpoint_templates(), vec!["https://search.local/?q="]);
    }

    #[test]
    fn test_from_lookup_proxy() {
        let config = DispatchConfig::from_lookup(lookup_from(&[
            ("DISPATCH_PROXY_LOC", "10.1.1.1:1080"),
            ("DISPATCH_PROXY_TYPE", "socks5"),
            ("DISPATCH_PROXY_USER", "bob"),
            ("DISPATCH_PROXY_PASS", "pw"),
            ("DISPATCH_RESULTS_PER_PAGE", "25"),
            ("DISPATCH_USE_CLIENT_USER_AGENT", "1"),
        ]));
        let proxy = config.proxy.unwrap();
        assert_eq!(proxy.url(), "socks5://bob:pw@10.1.1.1:1080");
        assert_eq!(config.results_per_page, 25);
        assert!(config.use_client_user_agent);
    }

    #[test]
    fn test_from_lookup_tor_password_mode() {
        let config = DispatchConfig::from_lookup(lookup_from(&[
            ("DISPATCH_TOR", "true"),
            ("DISPATCH_TOR_USE_PASS", "1"),
            ("DISPATCH_TOR_CONF", "/nonexistent/control.conf"),
        ]));
        assert!(config.anonymity.enabled);
        assert_eq!(
            config.anonymity.auth,
            ControlAuth::Password {
                conf_path: PathBuf::from("./misc/tor/control.conf")
            }
        );
    }

    #[test]
    fn test_from_lookup_empty() {
        let config = DispatchConfig::from_lookup(|_| None);
        assert_eq!(config, DispatchConfig::default());
    }

    #[test]
    fn test_config_deserialization_defaults() {
        let json = r#"{"country":"de","user_agent":{"custom":"my-agent/1.0"}}"#;
        let config: DispatchConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.country, "de");
        assert_eq!(config.user_agent, UserAgentMode::Custom("my-agent/1.0".to_string()));
        assert_eq!(config.results_per_page, 10);
        assert_eq!(config.anonymity.socks_addr, "127.0.0.1:9050");
        assert_eq!(config.blocked_fallback, BlockedFallback::LastResponse);
    }

    #[test]
    fn test_partial_retry_policy_keeps_defaults() {
        let json = r#"{"retry":{"max_blocked_retries":5,"rate_limited_backoff":{"min_ms":100,"max_ms":200}}}"#;
        let config: DispatchConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.retry.max_blocked_retries, 5);
        assert_eq!(config.retry.rate_limited_backoff, JitterRange::from_millis(100, 200));
        assert_eq!(config.retry.max_rate_limited_retries, 3);
        assert_eq!(config.retry.pacing, JitterRange::from_secs(1, 3));
        assert_eq!(config.retry.timeout_backoffs.len(), 2);
        assert_eq!(config.retry.request_timeout, 30);
    }

    #[test]
    fn test_control_auth_serialization() {
        let auth = ControlAuth::Password {
            conf_path: PathBuf::from("/etc/tor/control.conf"),
        };
        let json = serde_json::to_string(&auth).unwrap();
        assert!(json.contains("\"mode\":\"password\""));
    }
}
