//! Central error type for the crate.
//!
//! Every failure surfaced by a public operation carries a stable, dotted
//! `kind()` string (`"auth.key_unreadable"`, `"dial.timeout"`, ...) in
//! addition to its `Display` message, so a caller can branch on failure
//! family without string-matching the message text.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config: {0}")]
    Config(String),

    #[error("auth: identity file unreadable: {0}")]
    AuthKeyUnreadable(String),

    #[error("auth: identity file could not be parsed as a private key: {0}")]
    AuthKeyParseFailed(String),

    #[error("auth: identity file is encrypted and no passphrase was supplied")]
    AuthPassphraseRequired,

    #[error("auth: password auth selected but no password was supplied")]
    AuthPasswordMissing,

    #[error("dial: {0}")]
    Dial(String),

    #[error("dial: connection attempt timed out after {0:?}")]
    DialTimeout(std::time::Duration),

    #[error("health: probe failed: {0}")]
    Health(String),

    #[error("bind: local port {0} is already in use")]
    BindPortInUse(u16),

    #[error("upstream: service {0:?} has no connected transport")]
    UpstreamUnavailable(String),

    #[error("upstream: dial to upstream failed: {0}")]
    UpstreamDialFailed(String),

    #[error("upstream: reading response body failed: {0}")]
    UpstreamBody(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("proxy: already running")]
    ProxyAlreadyRunning,

    #[error("proxy: this instance was stopped; create a new one to restart")]
    ProxyStopped,
}

impl Error {
    /// Stable dotted identifier for the failure family, matching the
    /// taxonomy service consumers are expected to match on.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config.invalid",
            Error::AuthKeyUnreadable(_) => "auth.key_unreadable",
            Error::AuthKeyParseFailed(_) => "auth.key_parse_failed",
            Error::AuthPassphraseRequired => "auth.passphrase_required",
            Error::AuthPasswordMissing => "auth.password_missing",
            Error::Dial(_) => "dial.failed",
            Error::DialTimeout(_) => "dial.timeout",
            Error::Health(_) => "health.probe_failed",
            Error::BindPortInUse(_) => "bind.port_in_use",
            Error::UpstreamUnavailable(_) => "upstream.unavailable",
            Error::UpstreamDialFailed(_) => "upstream.dial_failed",
            Error::UpstreamBody(_) => "upstream.body",
            Error::Io(_) => "io.error",
            Error::ProxyAlreadyRunning => "proxy.already_running",
            Error::ProxyStopped => "proxy.stopped",
        }
    }

    /// Truncates a message to exactly 200 Unicode scalar values (ellipsis
    /// included) when it's longer than that, leaving shorter messages
    /// untouched. Used wherever an error crosses into a status/event
    /// payload that bounds message length.
    pub fn truncated_message(msg: &str) -> String {
        truncate_message(msg, 200)
    }
}

pub(crate) fn truncate_message(msg: &str, max_chars: usize) -> String {
    let char_count = msg.chars().count();
    if char_count <= max_chars {
        return msg.to_string();
    }
    let mut truncated: String = msg.chars().take(max_chars.saturating_sub(3)).collect();
    truncated.push_str("...");
    truncated
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        std::io::Error::other(err.to_string())
    }
}

/// A convenience wrapper so call sites can `.display_kind()` when logging.
pub struct KindedDisplay<'a>(pub &'a Error);

impl fmt::Display for KindedDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.kind(), self.0)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
