//! # a3s-dispatch
//!
//! Outbound request dispatch for a privacy-preserving search front end.
//!
//! Every request to the upstream search provider goes through a
//! [`Dispatcher`], which takes care of:
//!
//! - Pacing sends across the whole process
//! - Rotating search endpoints and browser identities per attempt
//! - Routing through an operator proxy or the anonymity network
//! - Bounded, jittered retries on rate limiting, blocking pages and
//!   transient network failures
//!
//! A separate [`ThrottleTracker`] advises the embedding service on when to
//! slow down its own clients.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use a3s_dispatch::{DispatchConfig, DispatchRequest, Dispatcher, Pacer, RequestContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = DispatchConfig::from_env();
//!     let pacer = Arc::new(Pacer::new(config.retry.pacing));
//!     let context = Arc::new(RequestContext::new(&config, None));
//!     let dispatcher = Dispatcher::new(&config, context, pacer, None)?;
//!
//!     let response = dispatcher.send(&DispatchRequest::search("rust%20programming")).await?;
//!     println!("{} bytes from {}", response.body.len(), response.url);
//!     Ok(())
//! }
//! ```

mod error;

pub mod anonymity;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod endpoint;
pub mod identity;
pub mod pacing;
pub mod proxy;
pub mod throttle;
pub mod transport;

pub use anonymity::{AnonymityController, AnonymityState, CircuitControl};
pub use config::{
    AnonymityConfig, BlockedFallback, ControlAuth, DispatchConfig, JitterRange, RetryPolicy,
    SignalFailurePolicy, UserAgentMode,
};
pub use context::RequestContext;
pub use dispatcher::{parse_suggestions, DispatchRequest, Dispatcher, Target};
pub use endpoint::EndpointRotator;
pub use error::{DispatchError, Result, TransportFailure};
pub use identity::{IdentityProfile, IdentityRotator, IdentitySource};
pub use pacing::Pacer;
pub use proxy::{ProxyConfig, ProxyProtocol};
pub use throttle::ThrottleTracker;
pub use transport::{OutboundRequest, RawResponse, ReqwestTransport, Route, Transport};
