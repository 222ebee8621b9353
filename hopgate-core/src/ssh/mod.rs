//! SSH client/connector abstraction.
//!
//! `SshClient` and `SshConnector` are the seam between C3's chaining
//! algorithm and the actual SSH protocol implementation. Production code
//! dials through [`russh_impl::RusshConnector`]; unit tests exercise the
//! chain/teardown ordering invariants of spec §8 against [`mock`] without a
//! live SSH server — the same seam-for-testability idiom
//! `Tonksthebear-trybotster` uses `wiremock` for at the HTTP boundary.

/// An in-memory [`SshConnector`]/[`SshClient`] test double. Only compiled
/// for this crate's own unit tests or when a dependent explicitly opts in
/// via the `test-util` feature — it never ships as part of an ordinary
/// release build's public API.
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod russh_impl;

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::model::HopDescriptor;

/// A boxed full-duplex byte stream: either a direct TCP connection (hop 0)
/// or a virtual one tunnelled through a parent client's channel (hop >0),
/// or the dialer handed to C5's transport.
pub type BoxedIo = Pin<Box<dyn AsyncIo>>;

pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-wide unique, monotonically increasing client
/// identity — the "stable token" spec §4.5 requires for the transport
/// cache key. A real SSH client's address-in-memory would work just as
/// well; a counter is simpler to reason about and to reproduce in tests.
pub fn next_client_id() -> u64 {
    NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// One connected hop's SSH client. Implementations must be internally
/// thread-safe: `dial_tcp` and `open_exec` may be called concurrently by
/// the proxy's dispatch path and the health supervisor.
#[async_trait]
pub trait SshClient: Send + Sync {
    /// Stable identity used as part of the transport cache key and for
    /// chain-ordering assertions in tests.
    fn identity(&self) -> u64;

    /// Opens a virtual TCP connection to `(host, port)` through this
    /// client's secure channel. Used both to chain the next hop (C3) and
    /// to dial an upstream HTTP(S) service (C5).
    async fn dial_tcp(&self, host: &str, port: u16) -> Result<BoxedIo>;

    /// Opens a session, executes `command`, waits for it to finish, and
    /// reports success only if the remote exit status was zero. Used
    /// exclusively by the health supervisor's probe (C4).
    async fn exec_probe(&self, command: &str) -> Result<()>;

    /// Tears this client down. Must not be called while any client dialed
    /// through it (a higher-order hop) is still alive — C3 enforces the
    /// ordering; this method itself does not re-check it.
    async fn close(&self);
}

/// Builds SSH clients, either directly or tunnelled through a parent.
#[async_trait]
pub trait SshConnector: Send + Sync {
    /// Dials `(hop.host, hop.port)` directly over TCP and completes an SSH
    /// handshake using `credential`.
    async fn connect_direct(
        &self,
        hop: &HopDescriptor,
        credential: crate::auth::Credential,
    ) -> Result<std::sync::Arc<dyn SshClient>>;

    /// Dials `(hop.host, hop.port)` through `parent`'s channel and
    /// completes an SSH handshake over that virtual connection.
    async fn connect_via(
        &self,
        parent: std::sync::Arc<dyn SshClient>,
        hop: &HopDescriptor,
        credential: crate::auth::Credential,
    ) -> Result<std::sync::Arc<dyn SshClient>>;
}
