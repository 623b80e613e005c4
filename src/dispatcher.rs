//! Request dispatch with bounded, jittered retries.
//!
//! [`Dispatcher::send`] runs an explicit loop over [`RetryState`]. Each
//! attempt paces, draws a fresh identity, prepares the anonymity circuit if
//! the session uses one, resolves the URL, sends, and hands the outcome to
//! [`Dispatcher::decide`], which either finishes or schedules a retry.
//! Every retry branch has its own counter and bound.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::anonymity::CircuitControl;
use crate::config::{BlockedFallback, DispatchConfig, RetryPolicy, SignalFailurePolicy};
use crate::context::RequestContext;
use crate::endpoint::EndpointRotator;
use crate::error::TransportFailure;
use crate::identity::{IdentityProfile, IdentityRotator, IdentitySource};
use crate::pacing::Pacer;
use crate::proxy::ProxyConfig;
use crate::transport::{OutboundRequest, RawResponse, ReqwestTransport, Route, Transport};
use crate::{DispatchError, Result};

/// Lowercase body substrings that mean upstream is resisting automation.
pub const BLOCKING_INDICATORS: &[&str] = &[
    "captcha",
    "blocked",
    "rate limited",
    "unusual traffic",
    "robots.txt",
    "access denied",
];

/// Challenge form served to traffic arriving from the anonymity network.
pub const ANONYMIZED_CHALLENGE_MARKER: &str = "form id=\"captcha-form\"";

const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.5";

/// What to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Primary search; the encoded query is appended to a rotated endpoint.
    Search { query: String },
    /// Secondary request (suggestions, assets) to a fixed URL.
    Explicit { url: String },
}

impl Target {
    /// Whether this is a primary search rather than a secondary fetch.
    pub fn is_primary(&self) -> bool {
        matches!(self, Target::Search { .. })
    }
}

/// One call into the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub target: Target,
    /// Attempt number to start from; 0 for a fresh request.
    pub attempt: u32,
    /// Use a mobile identity even for a desktop session.
    pub force_mobile: bool,
    /// Client user agent to present, if passthrough is enabled.
    pub user_agent: Option<String>,
    pub cancel: CancellationToken,
}

impl DispatchRequest {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            attempt: 0,
            force_mobile: false,
            user_agent: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Primary search for an already URL-encoded query string.
    pub fn search(query: impl Into<String>) -> Self {
        Self::new(Target::Search {
            query: query.into(),
        })
    }

    /// Secondary request to a fixed URL; bypasses endpoint rotation.
    pub fn explicit(url: impl Into<String>) -> Self {
        Self::new(Target::Explicit { url: url.into() })
    }

    /// Sets the attempt number to start from.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Requests a mobile identity.
    pub fn force_mobile(mut self) -> Self {
        self.force_mobile = true;
        self
    }

    /// Sets the client user agent used when passthrough is enabled.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Sets the token that aborts pacing, sends and backoffs.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Classification of an upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    RateLimited,
    Blocked,
    /// Anonymized-traffic challenge; only reported for anonymized sends.
    Challenge,
    Success,
}

/// Classifies a response.
///
/// The anonymized challenge is checked before the generic indicators because
/// its form also contains "captcha" and is better answered with a new circuit.
pub fn classify(response: &RawResponse, anonymized: bool) -> Verdict {
    if response.status == 429 {
        return Verdict::RateLimited;
    }
    if anonymized && response.body.contains(ANONYMIZED_CHALLENGE_MARKER) {
        return Verdict::Challenge;
    }
    let body = response.body.to_lowercase();
    if BLOCKING_INDICATORS.iter().any(|indicator| body.contains(indicator)) {
        return Verdict::Blocked;
    }
    Verdict::Success
}

/// Accumulated state of one [`Dispatcher::send`] call.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Current attempt number.
    pub attempt: u32,
    pub rate_limited: u32,
    pub blocked: u32,
    pub challenges: u32,
    pub timeouts: u32,
    pub connect_failures: u32,
    pub last_identity: Option<IdentityProfile>,
    pub last_url: Option<String>,
    /// Total time spent in backoff sleeps.
    pub backoff: Duration,
}

impl RetryState {
    fn starting_at(attempt: u32) -> Self {
        Self {
            attempt,
            ..Default::default()
        }
    }
}

/// Next move after an attempt.
#[derive(Debug)]
pub enum Step {
    Done(RawResponse),
    Retry(Duration),
}

/// Sends requests for one session.
pub struct Dispatcher {
    context: Arc<RequestContext>,
    pacer: Arc<Pacer>,
    endpoints: EndpointRotator,
    identities: Arc<dyn IdentitySource>,
    transport: Arc<dyn Transport>,
    circuit: Option<Arc<dyn CircuitControl>>,
    policy: RetryPolicy,
    autocomplete_url: String,
    use_client_user_agent: bool,
    signal_failure: SignalFailurePolicy,
    blocked_fallback: BlockedFallback,
}

impl Dispatcher {
    /// Creates a dispatcher with the reqwest transport.
    ///
    /// `circuit` is the process-wide circuit controller, shared by every
    /// dispatcher like the pacer. It is attached only when the session uses
    /// the anonymity network; an anonymized session without one fails its
    /// sends with an anonymity error.
    pub fn new(
        config: &DispatchConfig,
        context: Arc<RequestContext>,
        pacer: Arc<Pacer>,
        circuit: Option<Arc<dyn CircuitControl>>,
    ) -> Result<Self> {
        let anonymity_route = if context.anonymity_enabled() {
            Some(ProxyConfig::anonymity(&config.anonymity.socks_addr)?)
        } else {
            None
        };
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(
            context.proxy.as_ref(),
            anonymity_route.as_ref(),
        )?);

        let dispatcher = Self::with_transport(config, context, pacer, transport)?;
        Ok(match (anonymity_route, circuit) {
            (Some(_), Some(circuit)) => dispatcher.with_circuit(circuit),
            (Some(_), None) => {
                warn!("Anonymity enabled without a circuit controller");
                dispatcher
            }
            (None, _) => dispatcher,
        })
    }

    /// Creates a dispatcher over an arbitrary transport, without a circuit.
    ///
    /// Attach one with [`with_circuit`](Self::with_circuit) if the context
    /// has the anonymity network enabled.
    pub fn with_transport(
        config: &DispatchConfig,
        context: Arc<RequestContext>,
        pacer: Arc<Pacer>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        Ok(Self {
            context,
            pacer,
            endpoints: EndpointRotator::new(config.endpoint_templates())?,
            identities: Arc::new(IdentityRotator::new(config.user_agent.clone())),
            transport,
            circuit: None,
            policy: config.retry.clone(),
            autocomplete_url: config.autocomplete_url.clone(),
            use_client_user_agent: config.use_client_user_agent,
            signal_failure: config.anonymity.signal_failure,
            blocked_fallback: config.blocked_fallback,
        })
    }

    /// Replaces the identity source.
    pub fn with_identity_source(mut self, identities: Arc<dyn IdentitySource>) -> Self {
        self.identities = identities;
        self
    }

    /// Attaches a circuit controller, usually the shared process-wide one.
    pub fn with_circuit(mut self, circuit: Arc<dyn CircuitControl>) -> Self {
        self.circuit = Some(circuit);
        self
    }

    /// Replaces the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Session context of this dispatcher.
    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Endpoint rotation state.
    pub fn endpoints(&self) -> &EndpointRotator {
        &self.endpoints
    }

    /// Attached circuit controller, if any.
    pub fn circuit(&self) -> Option<&Arc<dyn CircuitControl>> {
        self.circuit.as_ref()
    }

    /// Sends `request`, retrying recoverable failures within their bounds.
    pub async fn send(&self, request: &DispatchRequest) -> Result<RawResponse> {
        let mut state = RetryState::starting_at(request.attempt);
        let result = self.run(request, &mut state).await;

        if let Err(DispatchError::Anonymity { disable: true, .. }) = &result {
            self.context.disable_anonymity();
        }
        result
    }

    async fn run(&self, request: &DispatchRequest, state: &mut RetryState) -> Result<RawResponse> {
        let cancel = &request.cancel;
        loop {
            self.pacer.wait(cancel).await?;

            let identity = self.resolve_identity(request);
            let anonymized = if self.context.anonymity_enabled() {
                let circuit = self.circuit.as_deref().ok_or_else(|| {
                    DispatchError::anonymity("no circuit controller for anonymized session", true)
                })?;
                self.prepare_circuit(circuit, state.attempt, cancel).await?;
                true
            } else {
                false
            };

            let url = self.resolve_url(&request.target);
            let outbound = self.build_request(&url, &identity, anonymized);
            state.last_identity = Some(identity);
            state.last_url = Some(url);

            let outcome = cancellable(cancel, self.transport.get(&outbound)).await?;
            match self.decide(outcome, request.target.is_primary(), anonymized, state)? {
                Step::Done(response) => return Ok(response),
                Step::Retry(delay) => {
                    state.backoff += delay;
                    state.attempt += 1;
                    cancellable(cancel, tokio::time::sleep(delay)).await?;
                }
            }
        }
    }

    /// Applies the retry policy to the outcome of one attempt.
    pub fn decide(
        &self,
        outcome: std::result::Result<RawResponse, TransportFailure>,
        primary: bool,
        anonymized: bool,
        state: &mut RetryState,
    ) -> Result<Step> {
        let policy = &self.policy;
        let response = match outcome {
            Ok(response) => response,
            Err(failure) => return self.retry_transport(failure, state),
        };

        match classify(&response, anonymized) {
            Verdict::Success => Ok(Step::Done(response)),
            Verdict::RateLimited => {
                if state.rate_limited >= policy.max_rate_limited_retries {
                    return Err(DispatchError::RateLimited {
                        attempts: state.rate_limited + 1,
                    });
                }
                state.rate_limited += 1;
                let delay = policy.rate_limited_backoff.sample();
                warn!("Upstream returned 429, retry {} in {:?}", state.rate_limited, delay);
                Ok(Step::Retry(delay))
            }
            Verdict::Challenge => {
                if state.challenges >= policy.max_challenge_retries {
                    return Err(DispatchError::anonymity(
                        "anonymized query failed -- max attempts exceeded",
                        true,
                    ));
                }
                state.challenges += 1;
                let delay = policy.challenge_backoff.sample();
                warn!("Challenge over anonymity network, retry {} in {:?}", state.challenges, delay);
                Ok(Step::Retry(delay))
            }
            Verdict::Blocked => {
                if state.blocked < policy.max_blocked_retries {
                    state.blocked += 1;
                    let delay = policy.blocked_backoff.sample();
                    warn!("Blocking page detected, retry {} in {:?}", state.blocked, delay);
                    return Ok(Step::Retry(delay));
                }
                if primary {
                    return Err(DispatchError::Blocked {
                        attempts: state.blocked + 1,
                    });
                }
                info!("Secondary request still blocked, degrading");
                Ok(Step::Done(self.degrade(response)))
            }
        }
    }

    fn retry_transport(&self, failure: TransportFailure, state: &mut RetryState) -> Result<Step> {
        if !failure.is_retryable() {
            return Err(failure.into());
        }
        let policy = &self.policy;
        let (retry, backoff) = if matches!(failure, TransportFailure::Timeout(_)) {
            if state.timeouts >= policy.max_timeout_retries {
                return Err(failure.into());
            }
            state.timeouts += 1;
            (state.timeouts, policy.timeout_backoff(state.timeouts))
        } else {
            if state.connect_failures >= policy.max_connect_retries {
                return Err(failure.into());
            }
            state.connect_failures += 1;
            (state.connect_failures, policy.connect_backoff)
        };

        let delay = backoff.sample();
        warn!("{}, retry {} in {:?}", failure, retry, delay);
        Ok(Step::Retry(delay))
    }

    fn degrade(&self, mut response: RawResponse) -> RawResponse {
        if self.blocked_fallback == BlockedFallback::Empty {
            response.body.clear();
        }
        response
    }

    fn resolve_identity(&self, request: &DispatchRequest) -> IdentityProfile {
        let client_ua = request
            .user_agent
            .as_deref()
            .or(self.context.client_user_agent.as_deref());
        match client_ua {
            Some(ua) if self.use_client_user_agent && !ua.is_empty() => {
                self.identities.with_user_agent(ua)
            }
            _ => self
                .identities
                .next(request.force_mobile || self.context.mobile),
        }
    }

    fn resolve_url(&self, target: &Target) -> String {
        match target {
            Target::Search { query } => format!("{}{}", self.endpoints.next(), query),
            Target::Explicit { url } => url.clone(),
        }
    }

    async fn prepare_circuit(
        &self,
        circuit: &dyn CircuitControl,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let signalled = if attempt == 0 {
            cancellable(cancel, circuit.heartbeat()).await?
        } else {
            cancellable(cancel, circuit.new_circuit()).await?
        };

        if !signalled {
            match self.signal_failure {
                SignalFailurePolicy::FailClosed => {
                    return Err(DispatchError::anonymity(
                        "anonymity connection dropped, check configuration",
                        true,
                    ));
                }
                SignalFailurePolicy::FailOpen => {
                    warn!("Anonymity control port unreachable, validating circuit anyway")
                }
            }
        }

        if cancellable(cancel, circuit.validate()).await?? {
            debug!("Anonymity circuit validated");
            Ok(())
        } else {
            Err(DispatchError::anonymity(
                "anonymity connection could not be validated",
                true,
            ))
        }
    }

    fn build_request(&self, url: &str, identity: &IdentityProfile, anonymized: bool) -> OutboundRequest {
        let accept_language = self
            .context
            .accept_language()
            .unwrap_or_else(|| DEFAULT_ACCEPT_LANGUAGE.to_string());

        OutboundRequest::new(url)
            .with_header("User-Agent", identity.user_agent.clone())
            .with_header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            )
            .with_header("Accept-Language", accept_language)
            .with_header("DNT", "1")
            .with_header("Upgrade-Insecure-Requests", "1")
            .with_header("Sec-Fetch-Dest", "document")
            .with_header("Sec-Fetch-Mode", "navigate")
            .with_header("Sec-Fetch-Site", "none")
            .with_header("Cache-Control", "max-age=0")
            .with_header("Cookie", identity.cookie_header())
            .with_timeout(Duration::from_secs(self.policy.request_timeout))
            .with_route(if anonymized {
                Route::Anonymized
            } else {
                Route::Direct
            })
    }

    /// Fetches search suggestions for a partial query.
    ///
    /// An empty or malformed reply yields no suggestions.
    pub async fn autocomplete(&self, query: &str, cancel: &CancellationToken) -> Result<Vec<String>> {
        let mut params = vec![("q", query.to_string())];
        if !self.context.language.is_empty() {
            params.push(("lr", self.context.language.clone()));
        }
        if !self.context.country.is_empty() {
            params.push(("gl", self.context.country.clone()));
        }
        if !self.context.lang_interface.is_empty() {
            params.push(("hl", self.context.lang_interface.replace("lang_", "")));
        }
        let encoded = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let request = DispatchRequest::explicit(format!("{}{}", self.autocomplete_url, encoded))
            .with_cancel(cancel.clone());
        let response = self.send(&request).await?;
        Ok(parse_suggestions(&response.body))
    }
}

/// Extracts the `data` attribute of every `suggestion` element.
pub fn parse_suggestions(xml: &str) -> Vec<String> {
    if xml.trim().is_empty() {
        return Vec::new();
    }
    match roxmltree::Document::parse(xml) {
        Ok(doc) => doc
            .descendants()
            .filter(|node| node.has_tag_name("suggestion"))
            .filter_map(|node| node.attribute("data"))
            .map(str::to_string)
            .collect(),
        Err(e) => {
            debug!("Malformed suggestion XML: {}", e);
            Vec::new()
        }
    }
}

async fn cancellable<F: Future>(cancel: &CancellationToken, future: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DispatchError::Cancelled),
        output = future => Ok(output),
    }
}
