//! A loopback [`SshConnector`]/[`SshClient`] pair used only by the
//! end-to-end tests in this crate. `hopgate_core::ssh::mock` is enough to
//! exercise chain ordering in isolation (see `hopgate-core`'s own unit
//! tests), but the scenarios here drive real bytes through C5/C6 against a
//! `wiremock` server, which needs `dial_tcp` to hand back a genuine TCP
//! socket rather than a dangling duplex pipe.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hopgate_core::auth::Credential;
use hopgate_core::error::{Error, Result};
use hopgate_core::model::HopDescriptor;
use hopgate_core::ssh::{next_client_id, BoxedIo, SshClient, SshConnector};
use tokio::net::TcpStream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRecord {
    pub client_id: u64,
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Default)]
pub struct DialLog(Arc<Mutex<Vec<DialRecord>>>);

impl DialLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DialRecord> {
        self.0.lock().unwrap().clone()
    }
}

pub struct LoopbackClient {
    id: u64,
    upstream: SocketAddr,
    log: DialLog,
    closed: AtomicBool,
}

#[async_trait]
impl SshClient for LoopbackClient {
    fn identity(&self) -> u64 {
        self.id
    }

    /// Ignores the requested `(host, port)` for the actual socket and
    /// always connects to the fixture's real loopback address — a real
    /// tunnel would land the caller at whatever's on the other end of the
    /// forwarded channel, which here is always the `wiremock` server.
    async fn dial_tcp(&self, host: &str, port: u16) -> Result<BoxedIo> {
        self.log.0.lock().unwrap().push(DialRecord {
            client_id: self.id,
            host: host.to_string(),
            port,
        });
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Dial(format!("client {} is closed", self.id)));
        }
        let stream = TcpStream::connect(self.upstream)
            .await
            .map_err(|e| Error::Dial(e.to_string()))?;
        let boxed: BoxedIo = Box::pin(stream);
        Ok(boxed)
    }

    async fn exec_probe(&self, _command: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Health(format!("client {} is closed", self.id)))
        } else {
            Ok(())
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Builds [`LoopbackClient`]s that all resolve to the same fixture
/// address, regardless of how many hops are chained above them.
pub struct LoopbackConnector {
    upstream: SocketAddr,
    log: DialLog,
}

impl LoopbackConnector {
    pub fn new(upstream: SocketAddr, log: DialLog) -> Self {
        LoopbackConnector { upstream, log }
    }
}

#[async_trait]
impl SshConnector for LoopbackConnector {
    async fn connect_direct(
        &self,
        _hop: &HopDescriptor,
        _credential: Credential,
    ) -> Result<Arc<dyn SshClient>> {
        Ok(Arc::new(LoopbackClient {
            id: next_client_id(),
            upstream: self.upstream,
            log: self.log.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn connect_via(
        &self,
        parent: Arc<dyn SshClient>,
        hop: &HopDescriptor,
        credential: Credential,
    ) -> Result<Arc<dyn SshClient>> {
        // A real hop dials the next bastion through its parent's channel;
        // the fixture doesn't need the virtual connection's bytes, only
        // the record that the call happened against the right parent.
        let _virtual_conn = parent.dial_tcp(&hop.host, hop.port).await?;
        self.connect_direct(hop, credential).await
    }
}
