//! Tracing setup, matching the layered `tracing-subscriber` +
//! `EnvFilter` style `servers/src/server_speak.rs` and
//! `servers/src/restream.rs` both use.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
