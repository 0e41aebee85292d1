//! Error classification for retry decisions

use std::time::Duration;

/// Transport-level error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Timeout,
    Server,
    RateLimit,
    Auth,
    Client,
    Unknown,
    /// Rejected locally by an open circuit breaker. Never produced by
    /// [`classify`].
    CircuitOpen,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT_ERROR",
            Self::Server => "SERVER_ERROR",
            Self::RateLimit => "RATE_LIMIT_ERROR",
            Self::Auth => "AUTH_ERROR",
            Self::Client => "CLIENT_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
            Self::CircuitOpen => "CIRCUIT_OPEN",
        }
    }

    /// Transient kinds worth another attempt.
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::Server | Self::RateLimit
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a raw failure. First match wins.
pub fn classify(message: &str, status_code: Option<u16>) -> ErrorKind {
    let lowered = message.to_lowercase();
    if lowered.contains("network") || lowered.contains("fetch") {
        return ErrorKind::Network;
    }
    if lowered.contains("timeout") || lowered.contains("timed out") {
        return ErrorKind::Timeout;
    }
    match status_code {
        Some(code) if code >= 500 => ErrorKind::Server,
        Some(429) => ErrorKind::RateLimit,
        Some(401 | 403) => ErrorKind::Auth,
        Some(400..=499) => ErrorKind::Client,
        _ => ErrorKind::Unknown,
    }
}

/// A classified request failure.
///
/// Retries never wrap this: the error a caller sees is the last one the
/// operation produced, with its status and `Retry-After` hint intact.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RequestError {
    pub kind: ErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
    pub retry_after: Option<Duration>,
}

impl RequestError {
    /// Classify from the message alone.
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify(&message, None),
            message,
            status_code: None,
            retry_after: None,
        }
    }

    /// Classify an HTTP failure.
    pub fn http(status_code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify(&message, Some(status_code)),
            message,
            status_code: Some(status_code),
            retry_after: None,
        }
    }

    pub fn network(message: impl std::fmt::Display) -> Self {
        Self::new(format!("network error: {message}"))
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(format!("request timeout after {}ms", after.as_millis()))
    }

    pub fn circuit_open(retry_in: Duration) -> Self {
        Self {
            kind: ErrorKind::CircuitOpen,
            message: format!("circuit open, next trial in {}ms", retry_in.as_millis()),
            status_code: None,
            retry_after: Some(retry_in),
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_transient()
    }

    pub fn is_auth(&self) -> bool {
        self.kind == ErrorKind::Auth
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code == Some(404)
    }
}
