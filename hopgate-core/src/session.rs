//! C7 — one active profile: orchestrates C3 → C4 → C6 and exposes status
//! snapshots via C1.
//!
//! The start/stop sequencing and the availability pre-check are spelled
//! out in spec §4.7; the graceful teardown (cancel supervisor, drain
//! proxy, tear down chain in reverse) follows the same
//! cancellation-token-then-join shape as the teacher's own shutdown path
//! in `servers/src/restream.rs` (`shutdown_signal` → `handle.graceful_shutdown`),
//! generalized here to also unwind the hop chain afterwards.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::chain::HopChain;
use crate::error::{Error, Result};
use crate::health::{ReconnectStats, Supervisor};
use crate::model::{Event, HopSnapshot, Profile, SessionSnapshot, SessionState, StatusEvent};
use crate::proxy::ReverseProxy;
use crate::ssh::SshConnector;
use crate::transport::TransportCache;

pub struct ProfileSession {
    profile: Profile,
    connector: Arc<dyn SshConnector>,
    chain: Arc<HopChain>,
    broker: Broker<Event>,
    transport_cache: Arc<TransportCache>,
    state: Arc<RwLock<SessionState>>,
    stats: Arc<ReconnectStats>,
    last_info: AsyncMutex<String>,
    last_error: AsyncMutex<Option<String>>,
    supervisor_cancel: AsyncMutex<Option<CancellationToken>>,
    supervisor_task: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
    proxy: AsyncMutex<Option<Arc<ReverseProxy>>>,
}

impl ProfileSession {
    pub fn new(profile: Profile, connector: Arc<dyn SshConnector>) -> Result<Self> {
        profile.validate()?;
        let chain = Arc::new(HopChain::new(profile.name.clone(), profile.ssh_hops.clone()));
        Ok(ProfileSession {
            profile,
            connector,
            chain,
            broker: Broker::new(),
            transport_cache: Arc::new(TransportCache::new()),
            state: Arc::new(RwLock::new(SessionState::Idle)),
            stats: Arc::new(ReconnectStats::default()),
            last_info: AsyncMutex::new(String::new()),
            last_error: AsyncMutex::new(None),
            supervisor_cancel: AsyncMutex::new(None),
            supervisor_task: AsyncMutex::new(None),
            proxy: AsyncMutex::new(None),
        })
    }

    /// Subscribers attach here, matching spec §6: "the broker is the only
    /// egress for observability."
    pub fn broker(&self) -> &Broker<Event> {
        &self.broker
    }

    /// Builds the chain (C3), starts the supervisor (C4), then — if a
    /// local port and at least one service are configured — starts the
    /// proxy (C6). Performs the port availability pre-check first.
    pub async fn start(&self) -> Result<()> {
        if let (Some(port), false) = (self.profile.local_http_port, self.profile.services.is_empty()) {
            if TcpListener::bind(("127.0.0.1", port)).await.is_err() {
                *self.state.write().await = SessionState::Disconnected;
                self.publish_aggregate("disconnected", Some(format!("port {port} is already in use")))
                    .await;
                return Err(Error::BindPortInUse(port));
            }
        }

        *self.state.write().await = SessionState::Connecting;
        self.publish_aggregate("connecting", None).await;

        if let Err(e) = self.chain.connect(self.connector.as_ref(), &self.broker).await {
            *self.state.write().await = SessionState::Disconnected;
            *self.last_error.lock().await = Some(e.to_string());
            self.publish_aggregate("disconnected", Some(e.to_string())).await;
            return Err(e);
        }

        *self.state.write().await = SessionState::Connected;
        *self.last_info.lock().await = "chain connected".to_string();
        self.publish_aggregate("connected", None).await;

        self.start_supervisor().await;

        if let (Some(port), false) = (self.profile.local_http_port, self.profile.services.is_empty()) {
            let proxy = Arc::new(ReverseProxy::new(
                self.profile.name.clone(),
                self.profile.services.clone(),
                self.chain.clone(),
                self.transport_cache.clone(),
                self.broker.clone(),
            ));
            if let Err(e) = proxy.start(port).await {
                *self.state.write().await = SessionState::Disconnected;
                *self.last_error.lock().await = Some(e.to_string());
                self.publish_aggregate("disconnected", Some(e.to_string())).await;
                return Err(e);
            }
            *self.proxy.lock().await = Some(proxy);
        }

        Ok(())
    }

    async fn start_supervisor(&self) {
        let cancel = CancellationToken::new();
        let supervisor = Arc::new(Supervisor::new(
            self.profile.name.clone(),
            self.profile.health_check_interval(),
            None,
        ));
        let task = tokio::spawn(supervisor.run(
            self.chain.clone(),
            self.connector.clone(),
            self.broker.clone(),
            self.transport_cache.clone(),
            self.state.clone(),
            self.stats.clone(),
            cancel.clone(),
        ));
        *self.supervisor_cancel.lock().await = Some(cancel);
        *self.supervisor_task.lock().await = Some(task);
    }

    /// Cancels the supervisor, stops the proxy (which invalidates C5),
    /// then tears the chain down in reverse order.
    pub async fn stop(&self) {
        if let Some(cancel) = self.supervisor_cancel.lock().await.take() {
            cancel.cancel();
        }
        if let Some(task) = self.supervisor_task.lock().await.take() {
            let _ = task.await;
        }
        if let Some(proxy) = self.proxy.lock().await.take() {
            proxy.stop().await;
        }
        self.chain.disconnect(&self.broker).await;
        *self.state.write().await = SessionState::Disconnected;
        self.publish_aggregate("disconnected", None).await;
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let hops: Vec<HopSnapshot> = self.chain.snapshot().await;
        SessionSnapshot {
            profile: self.profile.name.clone(),
            state: *self.state.read().await,
            hops,
            last_info: self.last_info.lock().await.clone(),
            last_error: self.last_error.lock().await.clone(),
            reconnect_attempts: self.stats.attempts.load(std::sync::atomic::Ordering::Relaxed),
            last_reconnect_attempt: *self.stats.last_attempt.read().await,
        }
    }

    async fn publish_aggregate(&self, state: &str, error: Option<String>) {
        let event = Event::Status(StatusEvent {
            profile: self.profile.name.clone(),
            hop_index: None,
            state: state.to_string(),
            info: "session".to_string(),
            error: error.map(|e| Error::truncated_message(&e)),
            timestamp: chrono::Utc::now(),
        });
        self.broker.publish(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuthMethod, HopDescriptor, ServiceDescriptor};
    use crate::ssh::mock::{DialLog, MockConnector};

    fn hop(order: u32) -> HopDescriptor {
        HopDescriptor {
            order,
            host: "b".into(),
            port: 22,
            user: "u".into(),
            auth: AuthMethod::Password { secret: "p".into() },
            alias: None,
            timeout: None,
        }
    }

    #[tokio::test]
    async fn start_without_services_skips_port_precheck_and_proxy() {
        let connector: Arc<dyn SshConnector> = Arc::new(MockConnector::new(DialLog::new()));
        let profile = Profile {
            name: "p".into(),
            ssh_hops: vec![hop(1)],
            services: vec![],
            local_http_port: None,
            health_check_interval_secs: 0,
        };
        let session = ProfileSession::new(profile, connector).unwrap();
        session.start().await.unwrap();
        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.state, SessionState::Connected);
        session.stop().await;
    }

    #[tokio::test]
    async fn port_already_bound_fails_fast_before_any_dial() {
        let connector = Arc::new(MockConnector::new(DialLog::new()));
        let held_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bound_port = held_listener.local_addr().unwrap().port();

        let profile = Profile {
            name: "p".into(),
            ssh_hops: vec![hop(1)],
            services: vec![ServiceDescriptor {
                subdomain: "api".into(),
                host: "10.0.0.5".into(),
                port: 8080,
                use_tls: false,
                tls_server_name: None,
                remote_host: None,
                hop_order: None,
                pages: vec![],
            }],
            local_http_port: Some(bound_port),
            health_check_interval_secs: 0,
        };
        let connector_dyn: Arc<dyn SshConnector> = connector.clone();
        let session = ProfileSession::new(profile, connector_dyn).unwrap();
        let err = session.start().await.unwrap_err();
        assert_eq!(err.kind(), "bind.port_in_use");
        assert!(connector.client_at_order(1).is_none(), "no hop dial should be attempted");
    }
}
