//! Server-Sent Events stream of run transitions.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use futures::stream::Stream;
use tfci::config::ServerConfig;
use tfci::registry::{Registry, RegistryError};
use tokio::sync::broadcast;
use tracing::warn;

use crate::server::RouteTable;
use crate::state::AppState;

pub fn register(
    registry: &Registry<RouteTable>,
    _config: &ServerConfig,
) -> Result<(), RegistryError> {
    registry.register("events", |table: &mut RouteTable| {
        table.route("/events", get(events_handler));
    })
}

/// SSE endpoint handler.
async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(run_event) => {
                    if let Ok(json) = serde_json::to_string(&run_event) {
                        yield Ok(Event::default().event("run").data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
