//! Production [`SshConnector`]/[`SshClient`] implementation on top of
//! `russh`, the async pure-Rust SSH client used throughout this crate
//! (chosen over the thread-blocking `ssh2` crate because every dial,
//! handshake, and channel open must be a tokio suspension point — see
//! `other_examples/manifests/warp-tech-warpgate`'s own choice of `russh`
//! for the same reason, building an SSH bastion product).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::Msg;
use russh::keys::PrivateKeyWithHashAlg;
use russh::{Channel, ChannelMsg};
use tokio::net::TcpStream;

use super::{next_client_id, BoxedIo, SshClient, SshConnector};
use crate::auth::Credential;
use crate::error::{Error, Result};
use crate::model::HopDescriptor;

/// Accepts any server host key — a deliberate, documented trade-off for
/// operator-chosen bastions (spec §6). Never performs known-hosts
/// verification.
struct AcceptAnyHostKey;

#[async_trait]
impl russh::client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Wraps a connected `russh` client handle. `russh::client::Handle` is
/// internally a cheap handle onto the session's own task, so `dial_tcp`
/// and `exec_probe` both take `&self` and may run concurrently.
pub struct RusshClient {
    id: u64,
    handle: russh::client::Handle<AcceptAnyHostKey>,
}

impl RusshClient {
    fn new(handle: russh::client::Handle<AcceptAnyHostKey>) -> Arc<Self> {
        Arc::new(RusshClient {
            id: next_client_id(),
            handle,
        })
    }

    async fn authenticate(&self, user: &str, credential: &Credential) -> Result<()> {
        let auth_ok = match credential {
            Credential::Password(password) => self
                .handle
                .authenticate_password(user, password)
                .await
                .map_err(|e| Error::Dial(format!("password authentication failed: {e}")))?
                .success(),
            Credential::PrivateKey(key) => {
                let hash_alg = self
                    .handle
                    .best_supported_rsa_hash()
                    .await
                    .unwrap_or(None)
                    .flatten();
                let key_with_alg = PrivateKeyWithHashAlg::new(key.clone(), hash_alg);
                self.handle
                    .authenticate_publickey(user, key_with_alg)
                    .await
                    .map_err(|e| Error::Dial(format!("public key authentication failed: {e}")))?
                    .success()
            }
        };
        if auth_ok {
            Ok(())
        } else {
            Err(Error::Dial("SSH authentication rejected by server".into()))
        }
    }
}

#[async_trait]
impl SshClient for RusshClient {
    fn identity(&self) -> u64 {
        self.id
    }

    async fn dial_tcp(&self, host: &str, port: u16) -> Result<BoxedIo> {
        let channel: Channel<Msg> = self
            .handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| Error::Dial(format!("direct-tcpip to {host}:{port} failed: {e}")))?;
        let stream = channel.into_stream();
        Ok(Box::pin(stream))
    }

    async fn exec_probe(&self, command: &str) -> Result<()> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Health(format!("opening probe session failed: {e}")))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::Health(format!("dispatching probe command failed: {e}")))?;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    if exit_status == 0 {
                        return Ok(());
                    }
                    return Err(Error::Health(format!(
                        "probe command exited with status {exit_status}"
                    )));
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => {
                    return Err(Error::Health(
                        "probe channel closed before an exit status arrived".into(),
                    ));
                }
                Some(_) => continue,
                None => {
                    return Err(Error::Health(
                        "probe channel ended without an exit status".into(),
                    ));
                }
            }
        }
    }

    async fn close(&self) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;
    }
}

pub struct RusshConnector;

impl RusshConnector {
    pub fn new() -> Self {
        RusshConnector
    }

    fn config(timeout: Duration) -> Arc<russh::client::Config> {
        Arc::new(russh::client::Config {
            inactivity_timeout: Some(timeout),
            ..Default::default()
        })
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect_direct(
        &self,
        hop: &HopDescriptor,
        credential: Credential,
    ) -> Result<Arc<dyn SshClient>> {
        let timeout = hop.dial_timeout();
        let addr = format!("{}:{}", hop.host, hop.port);
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::DialTimeout(timeout))?
            .map_err(|e| Error::Dial(format!("TCP connect to {addr} failed: {e}")))?;

        let handle = russh::client::connect_stream(Self::config(timeout), tcp, AcceptAnyHostKey)
            .await
            .map_err(|e| Error::Dial(format!("SSH handshake with {addr} failed: {e}")))?;

        let client = RusshClient::new(handle);
        client.authenticate(&hop.user, &credential).await?;
        Ok(client)
    }

    async fn connect_via(
        &self,
        parent: Arc<dyn SshClient>,
        hop: &HopDescriptor,
        credential: Credential,
    ) -> Result<Arc<dyn SshClient>> {
        let timeout = hop.dial_timeout();
        let virtual_conn = tokio::time::timeout(timeout, parent.dial_tcp(&hop.host, hop.port))
            .await
            .map_err(|_| Error::DialTimeout(timeout))??;

        let handle =
            russh::client::connect_stream(Self::config(timeout), virtual_conn, AcceptAnyHostKey)
                .await
                .map_err(|e| {
                    Error::Dial(format!(
                        "SSH handshake with {}:{} (via prior hop) failed: {e}",
                        hop.host, hop.port
                    ))
                })?;

        let client = RusshClient::new(handle);
        client.authenticate(&hop.user, &credential).await?;
        Ok(client)
    }
}
