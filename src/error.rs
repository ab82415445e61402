//! # Error types used by the plugin harness.
//!
//! This module defines two main error enums:
//!
//! - [`PluginError`] errors observed on the host side of a plugin.
//! - [`ServeError`] errors raised inside the child runtime.
//!
//! Both types provide an `as_label` helper for stable snake_case labels.
//! [`PluginError`] additionally maps to and from the structured error codes
//! a plugin may print on its handshake stream.

use thiserror::Error;

/// Wire code printed by a child that could not bind a listener.
pub(crate) const CODE_CONNECTION_FAILED: &str = "err-connection-failed";
/// Wire code printed by a child whose accept loop failed.
pub(crate) const CODE_HTTP_SERVE: &str = "err-http-serve";

/// # Errors observed through a plugin handle.
///
/// A fatal error is latched exactly once per plugin lifetime: after the
/// supervisor records it, every pending and subsequent `call`/`objects`
/// request fails with a clone of the same value, which is why all variants
/// carry owned strings.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// Transport bind or dial failure, on either side of the channel.
    #[error("connection failed: {detail}")]
    ConnectionFailed { detail: String },

    /// The child's accept loop failed after a successful bind.
    #[error("plugin cannot serve: {detail}")]
    HttpServe { detail: String },

    /// The child printed a malformed `ready` line.
    #[error("invalid ready message")]
    InvalidMessage,

    /// The handshake did not complete before the registration deadline.
    #[error("registration timed out")]
    RegistrationTimeout,

    /// The RPC transport reported an error while performing a call.
    #[error("call failed: {detail}")]
    Call { detail: String },

    /// The child exited on its own with a failure status.
    #[error("plugin exited: {detail}")]
    Exited { detail: String },

    /// The handle has no live supervisor behind it.
    #[error("plugin is not running")]
    Stopped,

    /// Free-form error forwarded from the child.
    #[error("{detail}")]
    Generic { detail: String },
}

impl PluginError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            PluginError::ConnectionFailed { .. } => "connection_failed",
            PluginError::HttpServe { .. } => "http_serve",
            PluginError::InvalidMessage => "invalid_message",
            PluginError::RegistrationTimeout => "registration_timeout",
            PluginError::Call { .. } => "call_failed",
            PluginError::Exited { .. } => "plugin_exited",
            PluginError::Stopped => "not_running",
            PluginError::Generic { .. } => "generic",
        }
    }

    /// Parses a `fatal:`/`error:` line value of the form `code: detail`.
    ///
    /// Known codes map to their structured variant; anything else is kept
    /// verbatim as [`PluginError::Generic`].
    pub(crate) fn parse_line(val: &str) -> Self {
        match val.split_once(": ") {
            Some((CODE_CONNECTION_FAILED, detail)) => PluginError::ConnectionFailed {
                detail: detail.to_string(),
            },
            Some((CODE_HTTP_SERVE, detail)) => PluginError::HttpServe {
                detail: detail.to_string(),
            },
            _ => PluginError::Generic {
                detail: val.to_string(),
            },
        }
    }
}

/// # Errors produced by the child runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ServeError {
    /// No listener could be bound within the retry budget.
    #[error("could not listen in {attempts} attempts using {proto} protocol")]
    Bind {
        /// Protocol the bind was attempted for.
        proto: crate::transport::Proto,
        /// Number of attempts made before giving up.
        attempts: usize,
    },

    /// `accept` failed on an established listener.
    #[error("accept failed: {detail}")]
    Accept { detail: String },
}

impl ServeError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            ServeError::Bind { .. } => "bind_failed",
            ServeError::Accept { .. } => "accept_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_codes() {
        assert_eq!(
            PluginError::parse_line("err-connection-failed: no ports left"),
            PluginError::ConnectionFailed {
                detail: "no ports left".to_string()
            }
        );
        assert_eq!(
            PluginError::parse_line("err-http-serve: accept: EMFILE"),
            PluginError::HttpServe {
                detail: "accept: EMFILE".to_string()
            }
        );
    }

    #[test]
    fn parse_free_form_lines() {
        assert_eq!(
            PluginError::parse_line("something broke"),
            PluginError::Generic {
                detail: "something broke".to_string()
            }
        );
        // Unknown code with a separator stays verbatim as well.
        assert_eq!(
            PluginError::parse_line("err-unknown: detail"),
            PluginError::Generic {
                detail: "err-unknown: detail".to_string()
            }
        );
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(
            PluginError::RegistrationTimeout.as_label(),
            "registration_timeout"
        );
        assert_eq!(PluginError::InvalidMessage.as_label(), "invalid_message");
        assert_eq!(
            ServeError::Bind {
                proto: crate::transport::Proto::Tcp,
                attempts: 500
            }
            .as_label(),
            "bind_failed"
        );
    }
}
