//! C4 — periodic liveness probe of the outermost client and coordinated
//! rebuild of the whole chain on failure.
//!
//! The tick/probe/rebuild shape mirrors the teacher's
//! `UpstreamManager::reconcile_state` loop
//! (`lib_common/src/core/upstream_manager.rs`) and the reconnect-on-failure
//! idiom of `YahooWssIngestor::run`
//! (`lib_common/src/ingestors/yahoo_wss.rs`), generalized from "reconnect a
//! WebSocket ingestor" to "rebuild an SSH hop chain." Per spec §4.4/§9, no
//! backoff is applied between rebuild attempts by default; an optional
//! capped exponential backoff is available as a config knob without
//! changing any other observable behaviour.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::chain::HopChain;
use crate::model::{Event, SessionState, StatusEvent};
use crate::ssh::SshConnector;
use crate::transport::TransportCache;

const PROBE_COMMAND: &str = "echo health_check";

/// Optional capped exponential backoff between rebuild attempts. Disabled
/// by default, matching the spec's documented no-backoff behaviour; an
/// operator may opt in without violating any stated property.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn none() -> Option<Self> {
        None
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        scaled.min(self.max)
    }
}

/// Shared reconnect telemetry, read by [`crate::session::ProfileSession::snapshot`].
#[derive(Default)]
pub struct ReconnectStats {
    pub attempts: AtomicU64,
    pub last_attempt: RwLock<Option<chrono::DateTime<Utc>>>,
}

pub struct Supervisor {
    profile_name: String,
    interval: Option<Duration>,
    backoff: Option<BackoffPolicy>,
    rebuilding: AtomicBool,
}

impl Supervisor {
    pub fn new(profile_name: String, interval: Option<Duration>, backoff: Option<BackoffPolicy>) -> Self {
        Supervisor {
            profile_name,
            interval,
            backoff,
            rebuilding: AtomicBool::new(false),
        }
    }

    pub fn is_rebuilding(&self) -> bool {
        self.rebuilding.load(Ordering::Acquire)
    }

    /// Runs until `cancel` fires. A `None` interval disables health
    /// checks entirely — the task returns immediately, matching spec
    /// §4.4's "interval of zero disables health checks."
    pub async fn run(
        self: Arc<Self>,
        chain: Arc<HopChain>,
        connector: Arc<dyn SshConnector>,
        broker: Broker<Event>,
        transport_cache: Arc<TransportCache>,
        session_state: Arc<RwLock<SessionState>>,
        stats: Arc<ReconnectStats>,
        cancel: CancellationToken,
    ) {
        let Some(interval) = self.interval else {
            return;
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if self.is_rebuilding() {
                        continue;
                    }
                    self.probe_once(&chain, &connector, &broker, &transport_cache, &session_state, &stats).await;
                }
            }
        }
    }

    /// Runs a single probe-and-maybe-rebuild cycle outside the ticker loop.
    /// Exposed beyond this module so integration tests can drive one probe
    /// deterministically instead of racing a real interval.
    pub async fn probe_once(
        &self,
        chain: &Arc<HopChain>,
        connector: &Arc<dyn SshConnector>,
        broker: &Broker<Event>,
        transport_cache: &Arc<TransportCache>,
        session_state: &Arc<RwLock<SessionState>>,
        stats: &Arc<ReconnectStats>,
    ) {
        let Some(outermost) = chain.outermost().await else {
            return;
        };

        chain.mark_checking().await;
        self.publish_aggregate(broker, "checking", None).await;

        match outermost.exec_probe(PROBE_COMMAND).await {
            Ok(()) => {
                chain.mark_connected_after_check().await;
                self.publish_aggregate(broker, "connected", None).await;
            }
            Err(e) => {
                chain.mark_all_disconnected().await;
                self.publish_aggregate(broker, "disconnected", Some(e.to_string())).await;
                self.rebuild(chain, connector, broker, transport_cache, session_state, stats).await;
            }
        }
    }

    /// Equivalent to calling `Disconnect` then `Connect` on C3, with no
    /// backoff by default. Invalidates every cached transport before the
    /// pre-rebuild clients are closed, per spec §4.5.
    async fn rebuild(
        &self,
        chain: &Arc<HopChain>,
        connector: &Arc<dyn SshConnector>,
        broker: &Broker<Event>,
        transport_cache: &Arc<TransportCache>,
        session_state: &Arc<RwLock<SessionState>>,
        stats: &Arc<ReconnectStats>,
    ) {
        self.rebuilding.store(true, Ordering::Release);
        *session_state.write().await = SessionState::Reconnecting;

        let attempt = stats.attempts.fetch_add(1, Ordering::Relaxed) as u32;
        *stats.last_attempt.write().await = Some(Utc::now());

        if let Some(backoff) = self.backoff {
            tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
        }

        transport_cache.invalidate_all().await;
        chain.disconnect(broker).await;
        match chain.connect(connector.as_ref(), broker).await {
            Ok(()) => {
                *session_state.write().await = SessionState::Connected;
                self.publish_aggregate(broker, "connected", None).await;
            }
            Err(e) => {
                *session_state.write().await = SessionState::Disconnected;
                self.publish_aggregate(broker, "disconnected", Some(e.to_string())).await;
            }
        }

        self.rebuilding.store(false, Ordering::Release);
    }

    async fn publish_aggregate(&self, broker: &Broker<Event>, state: &str, error: Option<String>) {
        let event = Event::Status(StatusEvent {
            profile: self.profile_name.clone(),
            hop_index: None,
            state: state.to_string(),
            info: "aggregate chain health".to_string(),
            error: error.map(|e| crate::error::Error::truncated_message(&e)),
            timestamp: Utc::now(),
        });
        broker.publish(event).await;
    }
}
