//! C3 — ordered, cumulative construction of an SSH client chain.
//!
//! Grounded in `original_source/internal/ssh_proxy/proxy.go`'s chained-dial
//! loop (`dial each hop through the previous hop's channel, never close the
//! prior client`) and `internal/ssh_proxy/type.go`'s per-order client map
//! (`hopClients map[int]*ssh.Client`), translated from a `map[int]` lookup
//! into a dense, order-sorted `Vec` since the spec requires the hop-state
//! map to be totally ordered with no gaps.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use tracing::{debug, info, warn};

use crate::auth;
use crate::error::{Error, Result};
use crate::model::{HopDescriptor, HopState, StatusEvent};
use crate::ssh::{SshClient, SshConnector};

struct HopSlot {
    descriptor: HopDescriptor,
    client: Option<Arc<dyn SshClient>>,
    state: HopState,
    last_transition: chrono::DateTime<Utc>,
}

/// The ordered, live chain of SSH clients for one profile session.
/// Position 0 is the entry point; the last position is the outermost
/// client most proxy dialers use.
pub struct HopChain {
    profile_name: String,
    slots: RwLock<Vec<HopSlot>>,
}

impl HopChain {
    /// `hops` must already be validated (unique `order`) by
    /// [`crate::model::Profile::validate`]; this sorts them ascending and
    /// starts every slot `disconnected`.
    pub fn new(profile_name: String, mut hops: Vec<HopDescriptor>) -> Self {
        hops.sort_by_key(|h| h.order);
        let now = Utc::now();
        let slots = hops
            .into_iter()
            .map(|descriptor| HopSlot {
                descriptor,
                client: None,
                state: HopState::Disconnected,
                last_transition: now,
            })
            .collect();
        HopChain {
            profile_name,
            slots: RwLock::new(slots),
        }
    }

    /// Builds every hop's client in ascending order. On any failure at
    /// position *i*, every client at `0..i` is closed in reverse order and
    /// every slot reverts to `disconnected`; the error is returned to the
    /// caller (C7), which is responsible for publishing the aggregate
    /// failure and deciding whether to retry.
    pub async fn connect(
        &self,
        connector: &dyn SshConnector,
        broker: &crate::broker::Broker<crate::model::Event>,
    ) -> Result<()> {
        let mut slots = self.slots.write().await;
        let mut built: Vec<Arc<dyn SshClient>> = Vec::new();

        for (index, slot) in slots.iter_mut().enumerate() {
            slot.state = HopState::Connecting;
            slot.last_transition = Utc::now();
            self.publish_hop_status(broker, slot, "connecting", None)
                .await;

            let credential = match auth::resolve(&slot.descriptor.auth).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(profile = %self.profile_name, hop = slot.descriptor.order, error = %e, "auth resolution failed");
                    self.publish_hop_status(broker, slot, "disconnected", Some(e.to_string()))
                        .await;
                    Self::unwind(&mut built).await;
                    return Err(e);
                }
            };

            let result = if index == 0 {
                connector.connect_direct(&slot.descriptor, credential).await
            } else {
                let parent = built.last().expect("built is non-empty for index > 0").clone();
                connector.connect_via(parent, &slot.descriptor, credential).await
            };

            match result {
                Ok(client) => {
                    slot.client = Some(client.clone());
                    slot.state = HopState::Connected;
                    slot.last_transition = Utc::now();
                    self.publish_hop_status(broker, slot, "connected", None).await;
                    built.push(client);
                }
                Err(e) => {
                    slot.state = HopState::Disconnected;
                    slot.last_transition = Utc::now();
                    warn!(profile = %self.profile_name, hop = slot.descriptor.order, error = %e, "dial failed, unwinding chain");
                    self.publish_hop_status(broker, slot, "disconnected", Some(e.to_string()))
                        .await;
                    Self::unwind(&mut built).await;
                    return Err(e);
                }
            }
        }

        info!(profile = %self.profile_name, hops = slots.len(), "chain fully connected");
        Ok(())
    }

    /// Closes every connected client in strictly decreasing `order`,
    /// never closing a client while its successor is still alive.
    pub async fn disconnect(&self, broker: &crate::broker::Broker<crate::model::Event>) {
        debug!(profile = %self.profile_name, "tearing down chain");
        let mut slots = self.slots.write().await;
        for slot in slots.iter_mut().rev() {
            if let Some(client) = slot.client.take() {
                client.close().await;
            }
            slot.state = HopState::Disconnected;
            slot.last_transition = Utc::now();
            self.publish_hop_status(broker, slot, "disconnected", None).await;
        }
    }

    async fn unwind(built: &mut Vec<Arc<dyn SshClient>>) {
        while let Some(client) = built.pop() {
            client.close().await;
        }
    }

    /// The last (highest-order) connected client, used by request
    /// dialers that don't pin to a specific hop.
    pub async fn outermost(&self) -> Option<Arc<dyn SshClient>> {
        let slots = self.slots.read().await;
        slots
            .iter()
            .rev()
            .find(|s| s.state == HopState::Connected)
            .and_then(|s| s.client.clone())
    }

    /// Looks up the client pinned to a specific hop `order`. Per spec §4.6
    /// step 1, a hop that exists but is not `connected` is a distinct
    /// outcome from "no such hop" — both are `None` here; the caller (C6)
    /// always turns either into `upstream.unavailable`, never a silent
    /// fallback to the outermost client.
    pub async fn client_at_order(&self, order: u32) -> Option<Arc<dyn SshClient>> {
        let slots = self.slots.read().await;
        slots
            .iter()
            .find(|s| s.descriptor.order == order && s.state == HopState::Connected)
            .and_then(|s| s.client.clone())
    }

    pub async fn mark_checking(&self) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.iter_mut().rev().find(|s| s.state == HopState::Connected) {
            slot.state = HopState::Checking;
            slot.last_transition = Utc::now();
        }
    }

    pub async fn mark_connected_after_check(&self) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.iter_mut().rev().find(|s| s.state == HopState::Checking) {
            slot.state = HopState::Connected;
            slot.last_transition = Utc::now();
        }
    }

    /// Marks every hop `disconnected`, without closing the underlying
    /// clients — used when the supervisor has already detected the
    /// outermost link is dead and is about to call [`Self::disconnect`]
    /// followed by [`Self::connect`].
    pub async fn mark_all_disconnected(&self) {
        let mut slots = self.slots.write().await;
        for slot in slots.iter_mut() {
            slot.state = HopState::Disconnected;
            slot.last_transition = Utc::now();
        }
    }

    pub async fn is_fully_connected(&self) -> bool {
        let slots = self.slots.read().await;
        !slots.is_empty() && slots.iter().all(|s| s.state == HopState::Connected)
    }

    pub async fn snapshot(&self) -> Vec<crate::model::HopSnapshot> {
        let slots = self.slots.read().await;
        slots
            .iter()
            .map(|s| crate::model::HopSnapshot {
                order: s.descriptor.order,
                display_name: s.descriptor.display_name().to_string(),
                state: s.state,
                last_transition: s.last_transition,
            })
            .collect()
    }

    async fn publish_hop_status(
        &self,
        broker: &crate::broker::Broker<crate::model::Event>,
        slot: &HopSlot,
        state: &str,
        error: Option<String>,
    ) {
        let event = crate::model::Event::Status(StatusEvent {
            profile: self.profile_name.clone(),
            hop_index: Some(slot.descriptor.order),
            state: state.to_string(),
            info: format!("hop {} ({})", slot.descriptor.order, slot.descriptor.display_name()),
            error: error.map(|e| Error::truncated_message(&e)),
            timestamp: Utc::now(),
        });
        broker.publish(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AuthMethod;
    use crate::ssh::mock::{DialLog, LogEntry, MockConnector};

    fn hop(order: u32, host: &str) -> HopDescriptor {
        HopDescriptor {
            order,
            host: host.to_string(),
            port: 22,
            user: "u".into(),
            auth: AuthMethod::Password { secret: "p".into() },
            alias: None,
            timeout: None,
        }
    }

    #[tokio::test]
    async fn chain_ordering_dials_through_previous_client_exactly_once() {
        let log = DialLog::new();
        let connector = MockConnector::new(log.clone());
        let broker = crate::broker::Broker::new();
        let chain = HopChain::new(
            "p".into(),
            vec![hop(1, "b1"), hop(2, "b2"), hop(3, "b3")],
        );

        chain.connect(&connector, &broker).await.unwrap();

        let entries = log.entries();
        assert!(matches!(entries[0], LogEntry::ConnectDirect { order: 1 }));
        // hop 2 dials through hop 1's client, hop 3 through hop 2's.
        let dial_positions: Vec<_> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, LogEntry::DialTcp { .. }))
            .collect();
        assert_eq!(dial_positions.len(), 2);
    }

    #[tokio::test]
    async fn failure_midway_unwinds_in_reverse_and_leaves_no_client() {
        let log = DialLog::new();
        let connector = MockConnector::new(log.clone());
        connector.fail_at(3);
        let broker = crate::broker::Broker::new();
        let chain = HopChain::new(
            "p".into(),
            vec![hop(1, "b1"), hop(2, "b2"), hop(3, "b3")],
        );

        let err = chain.connect(&connector, &broker).await.unwrap_err();
        assert_eq!(err.kind(), "dial.failed");
        assert!(chain.outermost().await.is_none());

        let closes: Vec<_> = log
            .entries()
            .into_iter()
            .filter(|e| matches!(e, LogEntry::Close { .. }))
            .collect();
        assert_eq!(closes.len(), 2, "hops 1 and 2 must be torn down after hop 3 fails");
    }

    #[tokio::test]
    async fn teardown_closes_in_decreasing_order() {
        let log = DialLog::new();
        let connector = MockConnector::new(log.clone());
        let broker = crate::broker::Broker::new();
        let chain = HopChain::new("p".into(), vec![hop(1, "b1"), hop(2, "b2")]);
        chain.connect(&connector, &broker).await.unwrap();

        chain.disconnect(&broker).await;

        let closes: Vec<u64> = log
            .entries()
            .into_iter()
            .filter_map(|e| match e {
                LogEntry::Close { id } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(closes.len(), 2);
        assert!(closes[0] > closes[1], "hop 2's client (assigned a later id) must close before hop 1's");
        assert!(chain.outermost().await.is_none());
    }

    #[tokio::test]
    async fn hop_order_pins_to_a_specific_non_terminal_client() {
        let log = DialLog::new();
        let connector = MockConnector::new(log.clone());
        let broker = crate::broker::Broker::new();
        let chain = HopChain::new("p".into(), vec![hop(1, "b1"), hop(2, "b2")]);
        chain.connect(&connector, &broker).await.unwrap();

        let pinned = chain.client_at_order(1).await.unwrap();
        let outer = chain.outermost().await.unwrap();
        assert_ne!(pinned.identity(), outer.identity());
    }

    #[tokio::test]
    async fn unconnected_hop_order_resolves_to_none_never_falls_back() {
        let chain = HopChain::new("p".into(), vec![hop(1, "b1")]);
        assert!(chain.client_at_order(1).await.is_none());
    }
}
