//! An in-memory [`SshConnector`]/[`SshClient`] used to test the chain and
//! teardown ordering invariants of spec §8 without a live SSH server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{next_client_id, BoxedIo, SshClient, SshConnector};
use crate::auth::Credential;
use crate::error::{Error, Result};
use crate::model::HopDescriptor;

/// A duplex pipe end used as the mock's "virtual TCP connection" — real
/// bytes never need to flow for these tests, only an `AsyncRead +
/// AsyncWrite` type that satisfies [`BoxedIo`].
fn dummy_io() -> BoxedIo {
    let (a, _b) = tokio::io::duplex(64);
    Box::pin(a)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    ConnectDirect { order: u32 },
    ConnectVia { parent_id: u64, order: u32 },
    DialTcp { by_id: u64, host: String, port: u16 },
    ExecProbe { by_id: u64 },
    Close { id: u64 },
}

#[derive(Clone, Default)]
pub struct DialLog(Arc<Mutex<Vec<LogEntry>>>);

impl DialLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.0.lock().unwrap().clone()
    }

    fn push(&self, entry: LogEntry) {
        self.0.lock().unwrap().push(entry);
    }
}

pub struct MockClient {
    id: u64,
    log: DialLog,
    closed: AtomicBool,
    probe_result: Mutex<std::result::Result<(), String>>,
}

#[async_trait]
impl SshClient for MockClient {
    fn identity(&self) -> u64 {
        self.id
    }

    async fn dial_tcp(&self, host: &str, port: u16) -> Result<BoxedIo> {
        self.log.push(LogEntry::DialTcp {
            by_id: self.id,
            host: host.to_string(),
            port,
        });
        Ok(dummy_io())
    }

    async fn exec_probe(&self, _command: &str) -> Result<()> {
        self.log.push(LogEntry::ExecProbe { by_id: self.id });
        match &*self.probe_result.lock().unwrap() {
            Ok(()) => Ok(()),
            Err(msg) => Err(Error::Health(msg.clone())),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.log.push(LogEntry::Close { id: self.id });
    }
}

impl MockClient {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_probe_result(&self, result: std::result::Result<(), String>) {
        *self.probe_result.lock().unwrap() = result;
    }
}

/// A connector whose `connect_direct`/`connect_via` can be told to fail at
/// a specific hop `order`, to exercise C3's "abort and unwind" failure
/// path deterministically.
pub struct MockConnector {
    log: DialLog,
    fail_at_order: Mutex<Option<u32>>,
    /// Kept alongside the type-erased `Arc<dyn SshClient>` handed back to
    /// callers so tests can reach back into a client's mock-only controls
    /// (e.g. `set_probe_result`) without a downcast.
    registry: Mutex<HashMap<u32, Arc<MockClient>>>,
}

impl MockConnector {
    pub fn new(log: DialLog) -> Self {
        MockConnector {
            log,
            fail_at_order: Mutex::new(None),
            registry: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail_at(&self, order: u32) {
        *self.fail_at_order.lock().unwrap() = Some(order);
    }

    fn should_fail(&self, order: u32) -> bool {
        *self.fail_at_order.lock().unwrap() == Some(order)
    }

    /// Returns the concrete mock client created for a given hop `order`,
    /// once `connect_direct`/`connect_via` has run for it.
    pub fn client_at_order(&self, order: u32) -> Option<Arc<MockClient>> {
        self.registry.lock().unwrap().get(&order).cloned()
    }
}

#[async_trait]
impl SshConnector for MockConnector {
    async fn connect_direct(
        &self,
        hop: &HopDescriptor,
        _credential: Credential,
    ) -> Result<Arc<dyn SshClient>> {
        if self.should_fail(hop.order) {
            return Err(Error::Dial(format!("mock failure at hop {}", hop.order)));
        }
        self.log.push(LogEntry::ConnectDirect { order: hop.order });
        let client = Arc::new(MockClient {
            id: next_client_id(),
            log: self.log.clone(),
            closed: AtomicBool::new(false),
            probe_result: Mutex::new(Ok(())),
        });
        self.registry.lock().unwrap().insert(hop.order, client.clone());
        Ok(client)
    }

    async fn connect_via(
        &self,
        parent: Arc<dyn SshClient>,
        hop: &HopDescriptor,
        _credential: Credential,
    ) -> Result<Arc<dyn SshClient>> {
        if self.should_fail(hop.order) {
            return Err(Error::Dial(format!("mock failure at hop {}", hop.order)));
        }
        // Mirrors the real connector: the parent's channel is what the new
        // hop's handshake travels over, so the parent must observe exactly
        // one `dial_tcp` call per build.
        let _virtual_conn = parent.dial_tcp(&hop.host, hop.port).await?;
        self.log.push(LogEntry::ConnectVia {
            parent_id: parent.identity(),
            order: hop.order,
        });
        let client = Arc::new(MockClient {
            id: next_client_id(),
            log: self.log.clone(),
            closed: AtomicBool::new(false),
            probe_result: Mutex::new(Ok(())),
        });
        self.registry.lock().unwrap().insert(hop.order, client.clone());
        Ok(client)
    }
}

#[allow(dead_code)]
fn assert_is_async_io<T: AsyncRead + AsyncWrite>() {}
