//! Static dashboard files.

use axum::response::Redirect;
use axum::routing::get;
use tfci::config::ServerConfig;
use tfci::registry::{Registry, RegistryError};
use tracing::{info, warn};

use crate::server::RouteTable;

/// Landing page; the fragment keeps the dashboard's client-side router at its root.
const INDEX_REDIRECT: &str = "/site/index.html#";

pub fn register(
    registry: &Registry<RouteTable>,
    config: &ServerConfig,
) -> Result<(), RegistryError> {
    let site_dir = config.site_dir.clone();
    if site_dir.is_dir() {
        info!(site_dir = %site_dir.display(), "serving dashboard files");
    } else {
        warn!(site_dir = %site_dir.display(), "site directory not found, dashboard routes will 404");
    }

    registry.register("site", move |table: &mut RouteTable| {
        let dist_dir = site_dir.join("dist");
        table
            .route("/", get(|| async { Redirect::temporary(INDEX_REDIRECT) }))
            .serve_dir("/site", site_dir)
            .serve_dir("/dist", dist_dir);
    })
}
