//! Error types for arm-rs.
//!
//! This module defines the [`enum@Error`] enum representing every failure the
//! monitor core can report, plus the [`AuthError`] sub-enum for control port
//! authentication.
//!
//! # Error Categories
//!
//! ```text
//!   Error
//!   ├── Io                  ◄── File / process I/O failures
//!   ├── Config              ◄── Invalid configuration
//!   ├── Transport           ◄── Control socket connect/read/write failure
//!   ├── Disconnected        ◄── Session closed (pending and later requests)
//!   ├── Timeout             ◄── No reply within the request timeout
//!   ├── Protocol            ◄── Malformed reply to one request
//!   ├── Auth                ◄── Bad credential value or form
//!   ├── Resolution          ◄── Every connection lookup tier failed
//!   ├── ReconnectThrottled  ◄── Reconnect attempted inside the rate limit
//!   └── Validation          ◄── Invalid input data
//! ```
//!
//! # Recovery Guide
//!
//! | Error | Fatal to session | Recommended Action |
//! |-------|------------------|-------------------|
//! | [`Transport`](Error::Transport) | Yes | Reconnect (rate limited) |
//! | [`Disconnected`](Error::Disconnected) | Yes | Reconnect, show stale state meanwhile |
//! | [`Timeout`](Error::Timeout) | No | Retry the request or show last value |
//! | [`Protocol`](Error::Protocol) | No | Drop that request's result |
//! | [`Auth`](Error::Auth) | No | Retry with other credentials |
//! | [`Resolution`](Error::Resolution) | No | Keep last connection table |
//! | [`ReconnectThrottled`](Error::ReconnectThrottled) | - | Wait `retry_in` |
//!
//! Two conditions are deliberately *not* errors: a connection whose metadata
//! could not be resolved is kept with a
//! [`Degraded`](crate::resolver::ResolutionSource::Degraded) source, and a
//! log deduplication pass that runs out of time returns a result flagged
//! [`truncated`](crate::logdedup::DedupResult::truncated).
//!
//! # Example
//!
//! ```rust
//! use arm_rs::{AuthError, Error};
//!
//! fn describe(err: &Error) -> &'static str {
//!     match err {
//!         Error::Disconnected => "tor went away",
//!         Error::Auth(AuthError::BadCredentials(_)) => "wrong password or cookie",
//!         Error::Auth(AuthError::ProtocolMismatch(_)) => "tor does not accept that method",
//!         _ => "other failure",
//!     }
//! }
//!
//! assert_eq!(describe(&Error::Disconnected), "tor went away");
//! ```

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during arm-rs operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during file or process operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    ///
    /// Invalid configuration values or parsing failures. Not recoverable
    /// without user intervention.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport failure on the control connection.
    ///
    /// Connect, read and write failures are fatal to the session: it is torn
    /// down and every pending request resolves with [`Error::Disconnected`].
    #[error("control transport error: {0}")]
    Transport(String),

    /// The session is closed.
    ///
    /// Returned to every request that was pending when the session closed and
    /// to every request issued afterwards, until a fresh connect.
    #[error("control session disconnected")]
    Disconnected,

    /// No reply arrived within the request timeout.
    ///
    /// The session stays usable; the late reply is consumed and discarded.
    #[error("control request timed out after {0:?}")]
    Timeout(Duration),

    /// A reply could not be parsed.
    ///
    /// Fails the enclosing request only.
    #[error("control protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Every connection lookup tier failed for this pass.
    #[error("connection resolution failed: {0}")]
    Resolution(String),

    /// A reconnect was attempted before the minimum interval elapsed.
    #[error("reconnect attempted too soon, retry in {retry_in:?}")]
    ReconnectThrottled {
        /// Time left until the next attempt is allowed.
        retry_in: Duration,
    },

    /// Input validation error.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Authentication failures.
///
/// A wrong credential *form* (for instance a cookie offered to a control port
/// that only accepts passwords) is distinct from a wrong credential *value*.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The credential form is acceptable but its value was rejected.
    #[error("bad credentials: {0}")]
    BadCredentials(String),

    /// The credential form is not among the methods Tor advertises.
    #[error("credential form not supported by control port: {0}")]
    ProtocolMismatch(String),

    /// The authentication cookie file could not be read.
    #[error("cannot read authentication cookie: {0}")]
    CookieUnreadable(String),
}

impl Error {
    /// Returns `true` if this error means the session can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Disconnected)
    }
}

/// Result type alias for arm-rs operations.
pub type Result<T> = std::result::Result<T, Error>;
