//! Resilient request execution.
//!
//! This crate provides:
//! - Error classification (network, timeout, server, rate limit, auth, client)
//! - Retry eligibility and exponential backoff with jitter
//! - A circuit breaker that fast-fails while a backend is unhealthy
//! - `ResilientRequestExecutor`, which combines timeout, retry loop and
//!   breaker gating around any async operation

pub mod circuit_breaker;
pub mod classifier;
pub mod executor;
pub mod policy;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use classifier::{ErrorKind, RequestError, classify};
pub use executor::{DEFAULT_REQUEST_TIMEOUT, ResilientRequestExecutor, RetryOptions};
pub use policy::{RetryConfig, compute_delay, should_retry};

/// Retry module result type
pub type Result<T> = std::result::Result<T, RequestError>;
