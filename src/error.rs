//! Error types for the forwarding pipeline.

use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error type used for error chaining across module boundaries.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Context wrapper that preserves an optional underlying source error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ErrorContext {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ErrorContext {
    /// Create context-only error (no underlying source).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create context error with an underlying source.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Errors raised by the forwarding pipeline.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or missing configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(#[source] ErrorContext),

    /// NAT discovery failed entirely. Fatal at startup.
    #[error("NAT probe error: {0}")]
    Probe(#[source] ErrorContext),

    /// Signaling endpoint failure (transient unless a bootstrap deadline elapsed).
    #[error("Signaling error: {0}")]
    Signaling(#[source] ErrorContext),

    /// Ephemeral port allocation failed for a mapping.
    #[error("Port allocation error: {0}")]
    Allocation(#[source] ErrorContext),

    /// Hole punching failed. Always recoverable: fall back to relay.
    #[error("Hole punch error: {0}")]
    HolePunch(#[source] ErrorContext),

    /// Per-stream or per-session forwarding failure. The listener continues.
    #[error("Forwarding error: {0}")]
    Forwarding(#[source] ErrorContext),

    /// Shutdown was requested. Not a failure; propagated silently.
    #[error("Cancelled")]
    Cancelled,
}

macro_rules! ctor {
    ($name:ident, $with_source:ident, $variant:ident) => {
        pub fn $name(message: impl Into<String>) -> Self {
            Self::$variant(ErrorContext::new(message))
        }

        pub fn $with_source<E>(message: impl Into<String>, source: E) -> Self
        where
            E: StdError + Send + Sync + 'static,
        {
            Self::$variant(ErrorContext::with_source(message, source))
        }
    };
}

impl Error {
    ctor!(config, config_with_source, Config);
    ctor!(probe, probe_with_source, Probe);
    ctor!(signaling, signaling_with_source, Signaling);
    ctor!(allocation, allocation_with_source, Allocation);
    ctor!(hole_punch, hole_punch_with_source, HolePunch);
    ctor!(forwarding, forwarding_with_source, Forwarding);

    /// Returns true if this error must abort startup when raised during
    /// bootstrap.
    ///
    /// **Fatal:**
    /// - `Config` - invalid configuration (won't change without user action)
    /// - `Probe` - total NAT discovery failure
    /// - `Allocation` - the initial mapping set could not be allocated
    ///
    /// **Non-fatal (recovered locally):**
    /// - `HolePunch` - fall back to relay for UDP, relay was the plan for TCP
    /// - `Forwarding` - drop the stream/session, keep the listener
    /// - `Signaling` - retried with backoff; only fatal once the bootstrap
    ///   deadline elapses, which the coordinator decides
    /// - `Cancelled` - shutdown, not a failure
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::Probe(_) | Error::Allocation(_)
        )
    }
}

/// Result type alias for forwarding operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::config("bad mode").is_fatal());
        assert!(Error::probe("all STUN servers failed").is_fatal());
        assert!(Error::allocation("no ports").is_fatal());
        assert!(!Error::hole_punch("all strategies failed").is_fatal());
        assert!(!Error::forwarding("stream reset").is_fatal());
        assert!(!Error::signaling("503").is_fatal());
        assert!(!Error::Cancelled.is_fatal());
    }

    #[test]
    fn test_source_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err = Error::allocation_with_source("failed to bind probe socket", io);
        assert!(err.to_string().contains("failed to bind probe socket"));
        let source = StdError::source(&err).expect("context source");
        assert!(StdError::source(source).is_some());
    }
}
