//! C6 — the local HTTP reverse proxy.
//!
//! Built by hand over `hyper_util`'s client rather than a reverse-proxy
//! middleware crate, because the custom SSH-channel dialer (C5) has no
//! equivalent in `axum`/`tower-http`'s bundled proxy helpers — the same
//! reason the Go original hand-builds on `httputil.ReverseProxy` with a
//! custom `Transport.Dial` in `internal/proxy/http.go`. The inbound
//! listener itself follows the teacher's own `axum::serve` + graceful
//! shutdown shape (`servers/src/restream.rs`), minus the TLS-termination
//! layer that file adds for its own (unrelated) purpose — inbound is
//! deliberately cleartext-only here (spec §6).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::chain::HopChain;
use crate::error::{Error, Result};
use crate::model::{Event, ProxyLogEvent, ServiceDescriptor};
use crate::transport::TransportCache;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    NotStarted,
    Running,
    Stopped,
}

struct Inner {
    profile_name: String,
    services: Vec<ServiceDescriptor>,
    chain: Arc<HopChain>,
    transport_cache: Arc<TransportCache>,
    broker: Broker<Event>,
    request_id: AtomicU64,
}

/// Owns the local listener for one profile session. `start` is
/// idempotent-reject (spec §4.6 "Lifecycle"): calling it twice on a
/// running instance returns `proxy.already_running`; calling it again
/// after `stop` returns `proxy.stopped` — a stopped proxy can never be
/// restarted, the caller must build a new one.
pub struct ReverseProxy {
    inner: Arc<Inner>,
    lifecycle: AsyncMutex<Lifecycle>,
    shutdown: CancellationToken,
    serve_task: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ReverseProxy {
    pub fn new(
        profile_name: String,
        services: Vec<ServiceDescriptor>,
        chain: Arc<HopChain>,
        transport_cache: Arc<TransportCache>,
        broker: Broker<Event>,
    ) -> Self {
        ReverseProxy {
            inner: Arc::new(Inner {
                profile_name,
                services,
                chain,
                transport_cache,
                broker,
                request_id: AtomicU64::new(1),
            }),
            lifecycle: AsyncMutex::new(Lifecycle::NotStarted),
            shutdown: CancellationToken::new(),
            serve_task: AsyncMutex::new(None),
        }
    }

    pub async fn start(&self, local_port: u16) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Running => return Err(Error::ProxyAlreadyRunning),
            Lifecycle::Stopped => return Err(Error::ProxyStopped),
            Lifecycle::NotStarted => {}
        }

        let addr = SocketAddr::from(([127, 0, 0, 1], local_port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|_| Error::BindPortInUse(local_port))?;

        let app = axum::Router::new()
            .fallback(dispatch)
            .with_state(self.inner.clone());

        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move {
                    shutdown.cancelled().await;
                })
                .await;
        });

        *self.serve_task.lock().await = Some(task);
        *lifecycle = Lifecycle::Running;
        Ok(())
    }

    /// Closes the listener, waits (best-effort) for in-flight handlers to
    /// drain, and invalidates the transport cache.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if *lifecycle != Lifecycle::Running {
            *lifecycle = Lifecycle::Stopped;
            return;
        }
        self.shutdown.cancel();
        if let Some(task) = self.serve_task.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(10), task).await;
        }
        self.inner.transport_cache.invalidate_all().await;
        *lifecycle = Lifecycle::Stopped;
    }
}

/// Derives the routing subdomain from the `Host` header: the `<sub>` of a
/// `<sub>.localhost` host, or otherwise the left-most dot-delimited label.
fn subdomain_from_host(host_header: &str) -> Option<&str> {
    let host_without_port = host_header.split(':').next()?;
    if host_without_port.is_empty() {
        return None;
    }
    host_without_port.split('.').next()
}

/// Path-prefix fallback match. Per spec §9's REDESIGN FLAG, a trailing
/// `/` after the alias is required — a bare `starts_with` would let
/// `/apibar` match an `/api` service, which the source's looser revision
/// is documented to do by mistake.
fn matches_path_prefix(path: &str, subdomain: &str) -> bool {
    let prefix = format!("/{subdomain}/");
    path.starts_with(&prefix)
}

fn resolve_service<'a>(services: &'a [ServiceDescriptor], host_header: Option<&str>, path: &str) -> Option<&'a ServiceDescriptor> {
    if let Some(host) = host_header {
        if let Some(subdomain) = subdomain_from_host(host) {
            if let Some(service) = services.iter().find(|s| s.subdomain == subdomain) {
                return Some(service);
            }
        }
    }
    services.iter().find(|s| matches_path_prefix(path, &s.subdomain))
}

async fn dispatch(State(inner): State<Arc<Inner>>, request: Request<Body>) -> Response {
    let host_header = request
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let method = request.method().clone();
    let inbound_headers = request.headers().clone();

    let Some(service) = resolve_service(&inner.services, host_header.as_deref(), request.uri().path()).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let hop_order = service.hop_order;
    let client = match hop_order {
        Some(order) => inner.chain.client_at_order(order).await,
        None => inner.chain.outermost().await,
    };
    let Some(client) = client else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let request_id = inner.request_id.fetch_add(1, Ordering::Relaxed);
    let service_alias = service.subdomain.clone();

    inner
        .broker
        .publish(Event::ProxyLog(ProxyLogEvent::initial(
            request_id,
            method.to_string(),
            path_and_query.clone(),
            service_alias.clone(),
        )))
        .await;

    let started = Instant::now();

    let transport = match inner
        .transport_cache
        .get_or_create(
            client,
            service.use_tls,
            Some(service.effective_tls_server_name()),
            &service.host,
            service.port,
        )
        .await
    {
        Ok(t) => t,
        Err(e) => {
            return finish_with_error(&inner, request_id, method, path_and_query, service_alias, started, StatusCode::BAD_GATEWAY, e.to_string()).await;
        }
    };

    let body_bytes = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return finish_with_error(&inner, request_id, method, path_and_query, service_alias, started, StatusCode::BAD_GATEWAY, e.to_string()).await;
        }
    };

    let scheme = if service.use_tls { "https" } else { "http" };
    let upstream_uri: Uri = match format!("{scheme}://{}:{}{}", service.host, service.port, path_and_query).parse() {
        Ok(uri) => uri,
        Err(e) => {
            return finish_with_error(&inner, request_id, method, path_and_query, service_alias, started, StatusCode::BAD_GATEWAY, e.to_string()).await;
        }
    };

    let mut upstream_request = Request::builder()
        .method(method.clone())
        .uri(upstream_uri)
        .body(Full::new(body_bytes))
        .expect("method/uri/body assembled above are all valid");
    // Pass every inbound header through unchanged (Authorization, cookies,
    // Content-Type, ...), then rewrite only Host — mirrors the original's
    // Director, which never clears the request before forwarding it.
    *upstream_request.headers_mut() = inbound_headers;
    if let Ok(host_value) = HeaderValue::from_str(service.effective_remote_host()) {
        upstream_request.headers_mut().insert(http::header::HOST, host_value);
    }

    match transport.send(upstream_request).await {
        Ok(upstream_response) => {
            let status = upstream_response.status();
            let (parts, body) = upstream_response.into_parts();
            match body.collect().await {
                Ok(collected) => {
                    let bytes = collected.to_bytes();
                    let response_size = bytes.len() as u64;
                    inner
                        .broker
                        .publish(Event::ProxyLog(ProxyLogEvent::terminal(
                            request_id,
                            method.to_string(),
                            path_and_query,
                            service_alias,
                            status.as_u16(),
                            response_size,
                            started.elapsed(),
                            None,
                        )))
                        .await;
                    let mut response = Response::new(Body::from(bytes));
                    *response.status_mut() = status;
                    *response.headers_mut() = parts.headers;
                    response
                }
                Err(e) => {
                    finish_with_error(&inner, request_id, method, path_and_query, service_alias, started, StatusCode::BAD_GATEWAY, format!("reading upstream body failed: {e}")).await
                }
            }
        }
        Err(e) => {
            finish_with_error(&inner, request_id, method, path_and_query, service_alias, started, StatusCode::BAD_GATEWAY, format!("upstream dial failed: {e}")).await
        }
    }
}

async fn finish_with_error(
    inner: &Arc<Inner>,
    request_id: u64,
    method: http::Method,
    url: String,
    service_alias: String,
    started: Instant,
    status: StatusCode,
    message: String,
) -> Response {
    let truncated = Error::truncated_message(&message);
    inner
        .broker
        .publish(Event::ProxyLog(ProxyLogEvent::terminal(
            request_id,
            method.to_string(),
            url,
            service_alias,
            status.as_u16(),
            0,
            started.elapsed(),
            Some(truncated.clone()),
        )))
        .await;
    (status, truncated).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(subdomain: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            subdomain: subdomain.to_string(),
            host: "10.0.0.5".into(),
            port: 8080,
            use_tls: false,
            tls_server_name: None,
            remote_host: None,
            hop_order: None,
            pages: vec![],
        }
    }

    #[test]
    fn host_header_with_localhost_suffix_routes_by_subdomain() {
        assert_eq!(subdomain_from_host("api.localhost:8080"), Some("api"));
    }

    #[test]
    fn host_header_without_port_still_resolves() {
        assert_eq!(subdomain_from_host("api.localhost"), Some("api"));
    }

    #[test]
    fn path_prefix_requires_trailing_slash() {
        assert!(matches_path_prefix("/api/ping", "api"));
        assert!(!matches_path_prefix("/apibar", "api"));
        assert!(!matches_path_prefix("/api", "api"));
    }

    #[test]
    fn resolve_service_falls_back_to_path_prefix_when_host_does_not_match() {
        let services = vec![service("api")];
        let resolved = resolve_service(&services, Some("nope.localhost"), "/api/ping");
        assert!(resolved.is_some());
    }

    #[test]
    fn resolve_service_returns_none_when_nothing_matches() {
        let services = vec![service("api")];
        assert!(resolve_service(&services, Some("nope.localhost"), "/other").is_none());
    }
}
