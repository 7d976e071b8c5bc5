//! Shared application state for the HTTP server.

use std::sync::Arc;

use serde::Serialize;
use tfci::config::ServerConfig;
use tfci::core::types::{RunId, RunKind, RunRecord, RunStatus};
use tfci::io::store::RunStore;
use tfci::scheduler::Scheduler;
use tokio::sync::broadcast;

/// Run transition broadcast to server-sent-event clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunEvent {
    pub id: RunId,
    pub kind: RunKind,
    pub status: RunStatus,
}

impl From<&RunRecord> for RunEvent {
    fn from(record: &RunRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            status: record.status,
        }
    }
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub scheduler: Scheduler,
    /// Broadcast sender for run transitions.
    pub event_tx: Arc<broadcast::Sender<RunEvent>>,
}

impl AppState {
    /// Wire the scheduler's transitions into the event broadcast.
    pub fn new(config: Arc<ServerConfig>, scheduler: Scheduler) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let event_tx = Arc::new(event_tx);
        let sender = event_tx.clone();
        scheduler.subscribe(move |record| {
            // No subscribers is fine.
            let _ = sender.send(RunEvent::from(record));
        });
        Self {
            config,
            scheduler,
            event_tx,
        }
    }

    pub fn store(&self) -> &RunStore {
        self.scheduler.store()
    }
}
