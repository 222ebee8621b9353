//! C1 — a generic, typed pub/sub broker.
//!
//! Grounded in the teacher's `Dispatcher` fan-out
//! (`lib_common/src/core/dispatcher.rs`), adapted from unbounded channels
//! plus memory-based eviction to bounded channels plus silent per-subscriber
//! drop, which is the semantics the original `internal/pubsub/broker.go`
//! actually implements. Unsubscribe-on-cancellation follows the
//! `CancellationToken` + linger-task idiom already used in
//! `lib_common/src/core/registry.rs`.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

const DEFAULT_BUFFER_CAPACITY: usize = 64;

struct Subscriber<E> {
    id: u64,
    sender: mpsc::Sender<E>,
}

struct Inner<E> {
    subscribers: RwLock<Vec<Subscriber<E>>>,
    next_id: std::sync::atomic::AtomicU64,
    shutdown: std::sync::atomic::AtomicBool,
}

/// A typed broker instance. Cloning shares the same underlying state
/// (`Arc`), matching the teacher's `Dispatcher` being handed around as
/// `Arc<Dispatcher>`.
pub struct Broker<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for Broker<E> {
    fn clone(&self) -> Self {
        Broker {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for Broker<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Send + 'static> Broker<E> {
    pub fn new() -> Self {
        Broker {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(Vec::new()),
                next_id: std::sync::atomic::AtomicU64::new(0),
                shutdown: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    /// Registers a bounded endpoint; returns its receiver. When `token`
    /// fires the endpoint is removed and dropped — no further delivery is
    /// attempted for it. Registration and the shutdown check happen
    /// together under the writer lock so a shutdown racing a subscribe
    /// cannot leak an endpoint nobody will ever close.
    pub async fn subscribe(&self, token: CancellationToken) -> Option<mpsc::Receiver<E>> {
        self.subscribe_with_capacity(token, DEFAULT_BUFFER_CAPACITY)
            .await
    }

    pub async fn subscribe_with_capacity(
        &self,
        token: CancellationToken,
        capacity: usize,
    ) -> Option<mpsc::Receiver<E>> {
        let mut subscribers = self.inner.subscribers.write().await;
        if self.inner.shutdown.load(std::sync::atomic::Ordering::Acquire) {
            return None;
        }
        let id = self
            .inner
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(capacity);
        subscribers.push(Subscriber { id, sender: tx });
        drop(subscribers);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            let mut subscribers = inner.subscribers.write().await;
            subscribers.retain(|s| s.id != id);
        });

        Some(rx)
    }

    /// Snapshots current endpoints under a reader lock, then attempts a
    /// non-blocking send to each. A full buffer is a silent drop for that
    /// subscriber only; the publisher never awaits.
    pub async fn publish(&self, event: E)
    where
        E: Clone,
    {
        let subscribers = self.inner.subscribers.read().await;
        for subscriber in subscribers.iter() {
            let _ = subscriber.sender.try_send(event.clone());
        }
    }

    /// Idempotent: drops every endpoint and causes future `subscribe` calls
    /// to return `None`.
    pub async fn shutdown(&self) {
        self.inner
            .shutdown
            .store(true, std::sync::atomic::Ordering::Release);
        let mut subscribers = self.inner.subscribers.write().await;
        subscribers.clear();
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().await.len()
    }
}
