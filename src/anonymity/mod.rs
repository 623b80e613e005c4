//! Anonymity-network circuit coordination.
//!
//! Signalling is fail-open: an unreachable or misconfigured control port
//! yields `false` and the caller decides what to do. Validation is
//! fail-closed: a probe that cannot complete is an error.

pub mod control;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::config::{AnonymityConfig, ControlAuth};
use crate::identity::random_user_agent;
use crate::proxy::ProxyConfig;
use crate::transport::{OutboundRequest, ReqwestTransport, Route, Transport};
use crate::{DispatchError, Result};

pub use control::{ControlConnection, ControlError, Signal};

/// Last known circuit state.
///
/// Informational only: the dispatcher validates before every anonymized
/// send and never trusts `valid` on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnonymityState {
    pub valid: bool,
    pub last_signal: Option<Instant>,
}

/// Operations the dispatcher needs from the anonymity network.
#[async_trait]
pub trait CircuitControl: Send + Sync {
    /// Pings the daemon. `false` means it is unreachable or refused us.
    async fn heartbeat(&self) -> bool;

    /// Requests fresh circuits. `false` as for [`heartbeat`](Self::heartbeat).
    async fn new_circuit(&self) -> bool;

    /// Fetches the validation page through the anonymized route.
    ///
    /// `Ok(false)` means traffic is not actually anonymized; `Err` means the
    /// probe itself failed.
    async fn validate(&self) -> Result<bool>;

    /// Whether the last signal reached the daemon.
    fn is_available(&self) -> bool;
}

/// Control-port backed [`CircuitControl`].
pub struct AnonymityController {
    control_addr: String,
    auth: ControlAuth,
    control_timeout: Duration,
    validation_url: String,
    validation_marker: String,
    validation_timeout: Duration,
    transport: Arc<dyn Transport>,
    available: AtomicBool,
    state: Mutex<AnonymityState>,
}

impl AnonymityController {
    /// `transport` must provide the [`Route::Anonymized`] path.
    pub fn new(config: &AnonymityConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            control_addr: config.control_addr.clone(),
            auth: config.auth.clone(),
            control_timeout: Duration::from_secs(config.control_timeout),
            validation_url: config.validation_url.clone(),
            validation_marker: config.validation_marker.clone(),
            validation_timeout: Duration::from_secs(config.validation_timeout),
            transport,
            available: AtomicBool::new(false),
            state: Mutex::new(AnonymityState::default()),
        }
    }

    /// Controller with its own reqwest transport over the SOCKS route.
    ///
    /// Build one per process and share it between dispatchers so every
    /// session sees the same availability.
    pub fn from_config(config: &AnonymityConfig) -> Result<Self> {
        let socks = ProxyConfig::anonymity(&config.socks_addr)?;
        let transport = ReqwestTransport::new(None, Some(&socks))?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    /// Snapshot of the last known circuit state.
    pub fn state(&self) -> AnonymityState {
        *self.lock_state()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AnonymityState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn session(&self, signal: Signal) -> std::result::Result<(), ControlError> {
        let mut conn = ControlConnection::connect(&self.control_addr).await?;
        conn.authenticate(&self.auth).await?;
        conn.signal(signal).await?;
        conn.quit().await;
        Ok(())
    }

    /// Opens a control session, sends `signal` and closes it.
    pub async fn send_signal(&self, signal: Signal) -> bool {
        let outcome = match timeout(self.control_timeout, self.session(signal)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("no answer within {:?}", self.control_timeout)),
        };

        match outcome {
            Ok(()) => {
                debug!("Sent {} to anonymity control port", signal.as_str());
                self.available.store(true, Ordering::Release);
                self.lock_state().last_signal = Some(Instant::now());
                true
            }
            Err(reason) => {
                warn!("Anonymity signal {} failed: {}", signal.as_str(), reason);
                self.available.store(false, Ordering::Release);
                false
            }
        }
    }
}

#[async_trait]
impl CircuitControl for AnonymityController {
    async fn heartbeat(&self) -> bool {
        self.send_signal(Signal::Heartbeat).await
    }

    async fn new_circuit(&self) -> bool {
        self.send_signal(Signal::NewNym).await
    }

    async fn validate(&self) -> Result<bool> {
        let request = OutboundRequest::new(self.validation_url.clone())
            .with_header("User-Agent", random_user_agent(false))
            .with_timeout(self.validation_timeout)
            .with_route(Route::Anonymized);

        match self.transport.get(&request).await {
            Ok(response) => {
                let valid = response.body.contains(&self.validation_marker);
                self.lock_state().valid = valid;
                debug!("Anonymity circuit validation: {}", valid);
                Ok(valid)
            }
            Err(e) => {
                self.lock_state().valid = false;
                Err(DispatchError::anonymity(
                    format!("error during circuit validation: {}", e),
                    true,
                ))
            }
        }
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }
}
