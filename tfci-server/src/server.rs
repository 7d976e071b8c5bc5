//! HTTP server bring-up: route table, middleware and graceful serving.

use std::future::Future;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::MethodRouter;
use tfci::registry::Registry;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Target that feature modules register their routes into.
#[derive(Default)]
pub struct RouteTable {
    router: Router<AppState>,
    bindings: Vec<String>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler set to `path`.
    pub fn route(&mut self, path: &str, method_router: MethodRouter<AppState>) -> &mut Self {
        let router = std::mem::take(&mut self.router);
        self.router = router.route(path, method_router);
        self.bindings.push(path.to_string());
        self
    }

    /// Serve files from `dir` under the `prefix` path.
    pub fn serve_dir(&mut self, prefix: &str, dir: impl Into<PathBuf>) -> &mut Self {
        let router = std::mem::take(&mut self.router);
        self.router = router.nest_service(prefix, ServeDir::new(dir.into()));
        self.bindings.push(format!("{prefix}/*"));
        self
    }

    /// Paths bound so far, in binding order.
    pub fn bindings(&self) -> &[String] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn into_router(self) -> Router<AppState> {
        self.router
    }
}

/// Drain the registry and assemble the full application router.
///
/// Fails if the registry was already drained.
pub fn build_router(registry: &Registry<RouteTable>, state: AppState) -> Result<Router> {
    let mut table = RouteTable::new();
    let modules = registry
        .drain_and_apply(&mut table)
        .context("apply route registrations")?;
    info!(modules, routes = ?table.bindings(), "routes registered");

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Ok(table
        .into_router()
        .layer(middleware::from_fn(log_requests))
        .layer(cors)
        .with_state(state))
}

/// Listen on `bind:port` until `shutdown` resolves.
pub async fn serve<F>(bind: &str, port: u16, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind((bind, port))
        .await
        .with_context(|| format!("bind {bind}:{port}"))?;
    let addr = listener.local_addr().context("read listen address")?;
    info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("serve http")?;
    info!("http server stopped");
    Ok(())
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    debug!(%method, %path, "request");

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    if response.status().is_server_error() {
        warn!(%method, %path, status, latency_ms, "request failed");
    } else {
        info!(%method, %path, status, latency_ms, "request");
    }
    response
}
