//! Shared data types: hop/service descriptors, profile, hop state, and the
//! two event payload shapes that flow through the broker (C1).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a hop authenticates against its SSH server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthMethod {
    PrivateKey {
        path: PathBuf,
        #[serde(default)]
        passphrase: Option<String>,
    },
    Password {
        secret: String,
    },
}

/// An immutable description of one bastion hop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopDescriptor {
    pub order: u32,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    pub auth: AuthMethod,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default, with = "duration_secs_opt")]
    pub timeout: Option<Duration>,
}

fn default_ssh_port() -> u16 {
    22
}

impl HopDescriptor {
    pub fn dial_timeout(&self) -> Duration {
        self.timeout.unwrap_or(Duration::from_secs(30))
    }

    /// Falls back to `host` when no `alias` was declared, for status info
    /// strings and log lines.
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(self.host.as_str())
    }
}

/// An immutable description of one upstream HTTP(S) service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub subdomain: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub tls_server_name: Option<String>,
    #[serde(default)]
    pub remote_host: Option<String>,
    #[serde(default)]
    pub hop_order: Option<u32>,
    #[serde(default)]
    pub pages: Vec<ServicePage>,
}

impl ServiceDescriptor {
    /// The value written into the outgoing `Host` header.
    pub fn effective_remote_host(&self) -> &str {
        self.remote_host.as_deref().unwrap_or(self.host.as_str())
    }

    /// SNI / cert verification name, falling back to the upstream host.
    pub fn effective_tls_server_name(&self) -> &str {
        self.tls_server_name.as_deref().unwrap_or(self.host.as_str())
    }

    pub fn host_port(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

/// A purely informational name/path pair carried on a service descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePage {
    pub name: String,
    pub path: String,
}

/// Name, hops, services, and session-wide settings for one tunnel profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub ssh_hops: Vec<HopDescriptor>,
    pub services: Vec<ServiceDescriptor>,
    /// The external profile format carries this as a decimal string
    /// (spec §6); parsed into a `u16` for everything downstream of the
    /// loader.
    #[serde(default, with = "port_as_string")]
    pub local_http_port: Option<u16>,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
}

fn default_health_check_interval() -> u64 {
    30
}

impl Profile {
    /// `order` must be unique across hops and every service's `subdomain`
    /// must be non-empty; this is the only validation the core performs —
    /// everything else is the external profile parser's responsibility.
    pub fn validate(&self) -> crate::error::Result<()> {
        let mut seen_orders = std::collections::HashSet::new();
        for hop in &self.ssh_hops {
            if !seen_orders.insert(hop.order) {
                return Err(crate::error::Error::Config(format!(
                    "duplicate hop order {}",
                    hop.order
                )));
            }
        }
        for service in &self.services {
            if service.subdomain.is_empty() {
                return Err(crate::error::Error::Config(
                    "service subdomain must be non-empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        if self.health_check_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.health_check_interval_secs))
        }
    }
}

/// Per-hop connectivity state. `checking` is entered just before a health
/// probe and cleared back to `connected` on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HopState {
    Disconnected,
    Connecting,
    Connected,
    Checking,
}

impl std::fmt::Display for HopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HopState::Disconnected => "disconnected",
            HopState::Connecting => "connecting",
            HopState::Connected => "connected",
            HopState::Checking => "checking",
        };
        f.write_str(s)
    }
}

/// The profile session's own state machine (C7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Either a status update (chain/session lifecycle) or a proxy request log
/// record; the two payload shapes the broker carries per spec's data model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Status(StatusEvent),
    ProxyLog(ProxyLogEvent),
}

/// A hop or aggregate-session status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub profile: String,
    /// `None` means the event describes the aggregate session state rather
    /// than a single hop.
    pub hop_index: Option<u32>,
    pub state: String,
    pub info: String,
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// One half of a request's event pair (see spec §3, §8 "event pairing").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyLogEvent {
    pub request_id: u64,
    pub method: String,
    pub url: String,
    pub service_alias: String,
    pub status_code: u16,
    pub response_size: u64,
    pub duration: Option<Duration>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub is_update: bool,
    pub error_message: Option<String>,
}

impl ProxyLogEvent {
    pub fn initial(request_id: u64, method: String, url: String, service_alias: String) -> Self {
        ProxyLogEvent {
            request_id,
            method,
            url,
            service_alias,
            status_code: 0,
            response_size: 0,
            duration: None,
            timestamp: chrono::Utc::now(),
            is_update: false,
            error_message: None,
        }
    }

    pub fn terminal(
        request_id: u64,
        method: String,
        url: String,
        service_alias: String,
        status_code: u16,
        response_size: u64,
        duration: Duration,
        error_message: Option<String>,
    ) -> Self {
        ProxyLogEvent {
            request_id,
            method,
            url,
            service_alias,
            status_code,
            response_size,
            duration: Some(duration),
            timestamp: chrono::Utc::now(),
            is_update: true,
            error_message,
        }
    }
}

/// A snapshot of session + hop state for UI/telemetry consumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub profile: String,
    pub state: SessionState,
    pub hops: Vec<HopSnapshot>,
    pub last_info: String,
    pub last_error: Option<String>,
    pub reconnect_attempts: u64,
    pub last_reconnect_attempt: Option<chrono::DateTime<chrono::Utc>>,
}

/// Per-hop entry of a [`SessionSnapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopSnapshot {
    pub order: u32,
    pub display_name: String,
    pub state: HopState,
    pub last_transition: chrono::DateTime<chrono::Utc>,
}

mod port_as_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<u16>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(port) => serializer.serialize_some(&port.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(s) => s
                .parse::<u16>()
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

mod duration_secs_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs: Option<u64> = Option::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(order: u32) -> HopDescriptor {
        HopDescriptor {
            order,
            host: "bastion".into(),
            port: 22,
            user: "u".into(),
            auth: AuthMethod::Password { secret: "p".into() },
            alias: None,
            timeout: None,
        }
    }

    #[test]
    fn duplicate_hop_order_is_rejected() {
        let profile = Profile {
            name: "p".into(),
            ssh_hops: vec![hop(1), hop(1)],
            services: vec![],
            local_http_port: Some(8080),
            health_check_interval_secs: 30,
        };
        let err = profile.validate().unwrap_err();
        assert_eq!(err.kind(), "config.invalid");
    }

    #[test]
    fn empty_subdomain_is_rejected() {
        let profile = Profile {
            name: "p".into(),
            ssh_hops: vec![hop(1)],
            services: vec![ServiceDescriptor {
                subdomain: "".into(),
                host: "10.0.0.1".into(),
                port: 80,
                use_tls: false,
                tls_server_name: None,
                remote_host: None,
                hop_order: None,
                pages: vec![],
            }],
            local_http_port: Some(8080),
            health_check_interval_secs: 30,
        };
        assert!(profile.validate().is_err());
    }

    #[test]
    fn zero_interval_disables_health_checks() {
        let profile = Profile {
            name: "p".into(),
            ssh_hops: vec![hop(1)],
            services: vec![],
            local_http_port: None,
            health_check_interval_secs: 0,
        };
        assert!(profile.health_check_interval().is_none());
    }

    #[test]
    fn display_name_falls_back_to_host() {
        let h = hop(1);
        assert_eq!(h.display_name(), "bastion");
    }
}
