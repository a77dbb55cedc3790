//! # quay-rest
//!
//! Rate-limited REST plumbing shared by exchange adapters.
//!
//! - [`rate_gate::RateGate`]: sliding-window admission (`capacity` calls per `window`)
//! - [`executor::RequestExecutor`]: URL building, admission, signing, deadline, classification
//! - [`payload`]: ordered request parameters and monotonic nonces
//! - [`auth`]: HMAC helpers and a ready-made query signer
//! - [`observer`]: request lifecycle hooks (logging, latency)
//!
//! Adapters own one executor per REST surface and pass a [`executor::RestCall`]
//! per request. The executor never retries; callers decide.

pub mod auth;
pub mod error;
pub mod executor;
pub mod observer;
pub mod payload;
pub mod rate_gate;

pub use error::RestError;
pub use executor::{
    DefaultUrlBuilder, PreparedRequest, RequestExecutor, RequestExecutorBuilder, RestCall, RestResponse, SignHook,
    UrlBuilder,
};
pub use payload::{NonceGenerator, NonceStyle, Payload};
pub use rate_gate::RateGate;
