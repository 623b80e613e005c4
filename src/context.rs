//! Per-session request context.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::config::DispatchConfig;
use crate::proxy::ProxyConfig;

/// Settings of one client session, fixed at construction.
///
/// The anonymity flag is the only mutable part and it can only go from
/// enabled to disabled.
#[derive(Debug)]
pub struct RequestContext {
    /// Result language (`lr`).
    pub language: String,
    /// Country (`gl`).
    pub country: String,
    /// Interface language; empty unless accept-language is enabled.
    pub lang_interface: String,
    /// Whether the client itself is a mobile browser.
    pub mobile: bool,
    /// Operator-configured proxy for the direct route.
    pub proxy: Option<ProxyConfig>,
    /// User agent the client sent; presented upstream when passthrough is on.
    pub client_user_agent: Option<String>,
    anonymity: AtomicBool,
}

impl RequestContext {
    /// Creates a context from configuration and the client's user agent.
    pub fn new(config: &DispatchConfig, client_user_agent: Option<&str>) -> Self {
        let mobile = client_user_agent
            .map(|ua| ua.contains("Android") || ua.contains("iPhone"))
            .unwrap_or(false);
        let lang_interface = if config.accept_language {
            config.lang_interface.clone()
        } else {
            String::new()
        };

        Self {
            language: config.lang_search.clone(),
            country: config.country.clone(),
            lang_interface,
            mobile,
            proxy: config.proxy.clone(),
            client_user_agent: client_user_agent.map(str::to_string),
            anonymity: AtomicBool::new(config.anonymity.enabled),
        }
    }

    /// Whether requests of this session go through the anonymity network.
    pub fn anonymity_enabled(&self) -> bool {
        self.anonymity.load(Ordering::Acquire)
    }

    /// Turns the anonymity network off for the rest of the session.
    pub fn disable_anonymity(&self) {
        if self.anonymity.swap(false, Ordering::AcqRel) {
            warn!("Anonymity network disabled for this session");
        }
    }

    /// Interface language as an `Accept-Language` value, if configured.
    pub fn accept_language(&self) -> Option<String> {
        if self.lang_interface.is_empty() {
            return None;
        }
        Some(format!("{};q=1.0", self.lang_interface.replace("lang_", "")))
    }
}
