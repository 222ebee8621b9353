//! Core library: chains SSH bastion hops and reverse-proxies HTTP
//! services reachable from the final hop onto a local listener.
//!
//! Module map mirrors the component table this crate implements:
//! [`broker`] (C1), [`auth`] (C2), [`chain`] (C3), [`health`] (C4),
//! [`transport`] (C5), [`proxy`] (C6), [`session`] (C7). [`model`] holds
//! the shared data types and [`error`] the crate-wide error taxonomy.
//!
//! Profile file parsing, terminal UI, and process-lifecycle wiring are
//! deliberately outside this crate's scope — see `hopgate-cli` for a
//! minimal runnable collaborator.

pub mod auth;
pub mod broker;
pub mod chain;
pub mod error;
pub mod health;
pub mod model;
pub mod proxy;
pub mod session;
pub mod ssh;
pub mod transport;

pub use error::{Error, Result};
pub use model::{
    AuthMethod, Event, HopDescriptor, HopSnapshot, HopState, Profile, ProxyLogEvent,
    ServiceDescriptor, ServicePage, SessionSnapshot, SessionState, StatusEvent,
};
pub use session::ProfileSession;
pub use ssh::russh_impl::RusshConnector;
pub use ssh::{SshClient, SshConnector};
