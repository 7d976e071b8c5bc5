//! Run scheduler: one provisioning run at a time against the checkout.
//!
//! Requests arrive from HTTP handlers and the change watcher. The scheduler
//! owns the "current running" slot and the queue of Pending runs, and it is the
//! only writer of run status transitions. Execution happens on a worker thread
//! that drains the queue in request order once the running run finishes.
//!
//! Policy:
//! - Idle: the request is recorded Pending, moved to Running and executed.
//! - Busy + `Manual`: rejected with [`SchedulerError::RunInProgress`], nothing recorded.
//! - Busy + automatic trigger: queued. A queued Pending run of the same kind is
//!   cancelled in favour of the newer request.
//! - Plan runs disabled: plan requests are recorded Succeeded without running.
//! - Running runs are never interrupted.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::core::transition::{InvalidTransition, validate_transition};
use crate::core::types::{RunId, RunKind, RunRecord, RunStatus, Trigger};
use crate::io::git::Git;
use crate::io::process::append_log_line;
use crate::io::provisioner::{ProvisionRequest, Provisioner};
use crate::io::store::{RunStore, StoreError};

pub const INTERRUPTED_NOTE: &str = "interrupted by restart";
pub const DISCARDED_NOTE: &str = "discarded on restart";
pub const PLANS_DISABLED_NOTE: &str = "plan runs disabled";
pub const CANCELLED_NOTE: &str = "cancelled by request";
pub const SHUTDOWN_NOTE: &str = "cancelled by shutdown";
pub const SLOW_NOTE: &str = "exceeded slow-run threshold";

const RESULT_RETRY_START: Duration = Duration::from_millis(100);
const RESULT_RETRY_MAX: Duration = Duration::from_secs(5);

/// Errors returned by [`Scheduler`] operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("run {running} is in progress")]
    RunInProgress { running: RunId },
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error("run {0} not found")]
    NotFound(RunId),
    #[error("run {0} is running and cannot be cancelled")]
    NotCancellable(RunId),
    #[error("run {id} already finished ({status})")]
    AlreadyFinished { id: RunId, status: RunStatus },
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("start run worker: {0}")]
    Worker(#[from] std::io::Error),
}

/// Callback invoked with every persisted status change.
///
/// Observers run while the scheduler lock is held and must not call back into it.
pub type Observer = Box<dyn Fn(&RunRecord) + Send + Sync>;

/// What startup recovery changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Runs found Running and marked Failed.
    pub interrupted: Vec<RunId>,
    /// Runs found Pending and marked Cancelled.
    pub discarded: Vec<RunId>,
}

#[derive(Debug, Clone)]
struct Settings {
    checkout_dir: PathBuf,
    run_plan_enabled: bool,
    slow_after: Duration,
}

#[derive(Debug)]
struct Slot {
    running: Option<RunId>,
    /// Pending runs in request order.
    queue: VecDeque<(RunId, RunKind)>,
    accepting: bool,
}

struct Inner {
    store: Arc<RunStore>,
    provisioner: Arc<dyn Provisioner>,
    settings: Settings,
    git: Option<Git>,
    slot: Mutex<Slot>,
    idle: Condvar,
    observers: RwLock<Vec<Observer>>,
}

/// Handle to the run scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("settings", &self.inner.settings)
            .field("slot", &*self.inner.lock_slot())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Apply clear-state and crash recovery, then return a scheduler ready for requests.
    #[instrument(skip_all, fields(clear_state = config.clear_state, run_plan_enabled = config.run_plan_enabled))]
    pub fn start(
        config: &ServerConfig,
        store: Arc<RunStore>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Result<Self, SchedulerError> {
        if config.clear_state {
            store.clear_all()?;
            info!("cleared run state before start");
        }
        let report = recover(&store)?;
        if !report.interrupted.is_empty() || !report.discarded.is_empty() {
            warn!(
                interrupted = ?report.interrupted,
                discarded = ?report.discarded,
                "recovered runs left by a previous process"
            );
        }

        let git = Git::new(&config.checkout_dir);
        let git = git.is_repository().then_some(git);

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                provisioner,
                settings: Settings {
                    checkout_dir: config.checkout_dir.clone(),
                    run_plan_enabled: config.run_plan_enabled,
                    slow_after: config.provisioner.slow_run_warning(),
                },
                git,
                slot: Mutex::new(Slot {
                    running: None,
                    queue: VecDeque::new(),
                    accepting: true,
                }),
                idle: Condvar::new(),
                observers: RwLock::new(Vec::new()),
            }),
        })
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.inner.store
    }

    /// Register a callback for every persisted status change.
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&RunRecord) + Send + Sync + 'static,
    {
        self.inner
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Box::new(observer));
    }

    /// Request a run. Returns the id of the new record.
    #[instrument(skip(self))]
    pub fn request_run(&self, kind: RunKind, trigger: Trigger) -> Result<RunId, SchedulerError> {
        let revision = self.inner.current_revision();
        let mut slot = self.inner.lock_slot();
        if !slot.accepting {
            return Err(SchedulerError::ShuttingDown);
        }

        if kind == RunKind::Plan && !self.inner.settings.run_plan_enabled {
            let record = self.inner.append_pending(kind, trigger, revision)?;
            let now = Utc::now();
            self.inner.transition(record.id, RunStatus::Succeeded, |r| {
                r.started_at = Some(now);
                r.finished_at = Some(now);
                r.note = Some(PLANS_DISABLED_NOTE.to_string());
            })?;
            info!(run_id = record.id, "plan runs disabled, recorded as succeeded");
            return Ok(record.id);
        }

        if let Some(running) = slot.running {
            if !trigger.is_queueable() {
                info!(running, "rejecting manual run while another is in progress");
                return Err(SchedulerError::RunInProgress { running });
            }
            let record = self.inner.append_pending(kind, trigger, revision)?;
            let superseded: Vec<RunId> = slot
                .queue
                .iter()
                .filter(|(_, queued_kind)| *queued_kind == kind)
                .map(|(id, _)| *id)
                .collect();
            for old in &superseded {
                let note = format!("superseded by run {}", record.id);
                if let Err(err) = self.inner.transition(*old, RunStatus::Cancelled, |r| {
                    r.finished_at = Some(Utc::now());
                    r.note = Some(note);
                }) {
                    error!(run_id = old, err = %err, "failed to cancel superseded run");
                }
            }
            slot.queue.retain(|(_, queued_kind)| *queued_kind != kind);
            slot.queue.push_back((record.id, kind));
            info!(
                run_id = record.id,
                running,
                superseded = ?superseded,
                queued = slot.queue.len(),
                "run queued"
            );
            return Ok(record.id);
        }

        let record = self.inner.append_pending(kind, trigger, revision)?;
        self.inner.start_run(&mut slot, record.id, kind)?;
        Ok(record.id)
    }

    /// Cancel a Pending run. Running runs are never interrupted.
    #[instrument(skip(self))]
    pub fn cancel(&self, id: RunId) -> Result<RunRecord, SchedulerError> {
        let mut slot = self.inner.lock_slot();
        let record = self
            .inner
            .store
            .get(id)
            .ok_or(SchedulerError::NotFound(id))?;
        match record.status {
            RunStatus::Running => Err(SchedulerError::NotCancellable(id)),
            status if status.is_terminal() => Err(SchedulerError::AlreadyFinished { id, status }),
            _ => {
                slot.queue.retain(|(queued, _)| *queued != id);
                let cancelled = self.inner.transition(id, RunStatus::Cancelled, |r| {
                    r.finished_at = Some(Utc::now());
                    r.note = Some(CANCELLED_NOTE.to_string());
                })?;
                info!(run_id = id, "pending run cancelled");
                Ok(cancelled)
            }
        }
    }

    /// The run currently executing, if any.
    pub fn running(&self) -> Option<RunRecord> {
        let slot = self.inner.lock_slot();
        slot.running.and_then(|id| self.inner.store.get(id))
    }

    /// Pending runs waiting for the slot, in start order.
    pub fn queued(&self) -> Vec<RunRecord> {
        let slot = self.inner.lock_slot();
        slot.queue
            .iter()
            .filter_map(|(id, _)| self.inner.store.get(*id))
            .collect()
    }

    /// Block until nothing is running or queued. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let slot = self.inner.lock_slot();
        let (_slot, result) = self
            .inner
            .idle
            .wait_timeout_while(slot, timeout, |s| s.running.is_some() || !s.queue.is_empty())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        !result.timed_out()
    }

    /// Stop accepting requests and cancel queued runs. The running run finishes normally.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        let mut slot = self.inner.lock_slot();
        slot.accepting = false;
        let queued: Vec<RunId> = slot.queue.drain(..).map(|(id, _)| id).collect();
        for id in &queued {
            if let Err(err) = self.inner.transition(*id, RunStatus::Cancelled, |r| {
                r.finished_at = Some(Utc::now());
                r.note = Some(SHUTDOWN_NOTE.to_string());
            }) {
                error!(run_id = id, err = %err, "failed to cancel queued run on shutdown");
            }
        }
        info!(cancelled = queued.len(), running = ?slot.running, "scheduler stopped accepting runs");
        if slot.running.is_none() {
            self.inner.idle.notify_all();
        }
    }
}

impl Inner {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_revision(&self) -> Option<String> {
        let git = self.git.as_ref()?;
        match git.head_short_sha(12) {
            Ok(sha) => Some(sha),
            Err(err) => {
                debug!(err = %err, "could not read checkout revision");
                None
            }
        }
    }

    fn notify(&self, record: &RunRecord) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for observer in observers.iter() {
            observer(record);
        }
    }

    /// Record a new Pending run. Caller holds the slot lock, which serializes id allocation.
    fn append_pending(
        &self,
        kind: RunKind,
        trigger: Trigger,
        revision: Option<String>,
    ) -> Result<RunRecord, SchedulerError> {
        let id = self.store.next_id();
        let mut record = RunRecord::pending(id, kind, trigger, self.store.log_path(id));
        record.revision = revision;
        self.store.append(record.clone())?;
        self.notify(&record);
        Ok(record)
    }

    /// Validate and persist a status change, then tell observers.
    fn transition<F>(&self, id: RunId, to: RunStatus, mutate: F) -> Result<RunRecord, SchedulerError>
    where
        F: FnOnce(&mut RunRecord),
    {
        let current = self.store.get(id).ok_or(SchedulerError::NotFound(id))?;
        validate_transition(current.status, to)?;
        let updated = self.store.update(id, |r| {
            r.status = to;
            mutate(r);
        })?;
        debug!(run_id = id, from = %current.status, to = %to, "run transition");
        self.notify(&updated);
        Ok(updated)
    }

    /// Move `id` to Running and hand it to a worker thread. Caller holds the slot lock.
    fn start_run(
        self: &Arc<Self>,
        slot: &mut Slot,
        id: RunId,
        kind: RunKind,
    ) -> Result<(), SchedulerError> {
        debug_assert!(slot.running.is_none());
        self.transition(id, RunStatus::Running, |r| r.started_at = Some(Utc::now()))?;
        slot.running = Some(id);

        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("tfci-run-{id}"))
            .spawn(move || inner.work(id, kind));
        if let Err(err) = spawned {
            error!(run_id = id, err = %err, "failed to start run worker");
            slot.running = None;
            let note = format!("could not start worker: {err}");
            self.transition(id, RunStatus::Failed, |r| {
                r.finished_at = Some(Utc::now());
                r.note = Some(note);
            })?;
            self.idle.notify_all();
            return Err(SchedulerError::Worker(err));
        }
        info!(run_id = id, kind = %kind, "run started");
        Ok(())
    }

    /// Worker loop: execute `id`, then keep draining the queue.
    fn work(self: Arc<Self>, mut id: RunId, mut kind: RunKind) {
        loop {
            let finished = self.execute(id, kind);
            self.record_result(id, &finished);

            let mut slot = self.lock_slot();
            slot.running = None;
            info!(run_id = id, status = %finished.status, exit_code = ?finished.exit_code, "run finished");

            match self.next_queued(&mut slot) {
                Some((next, next_kind)) => {
                    id = next;
                    kind = next_kind;
                }
                None => {
                    self.idle.notify_all();
                    return;
                }
            }
        }
    }

    /// Persist the terminal status of `id`, retrying while the state directory is unwritable.
    ///
    /// The run keeps the slot until this returns, so no second run can start
    /// while the record still reads Running.
    fn record_result(&self, id: RunId, finished: &Finished) {
        let mut backoff = RESULT_RETRY_START;
        loop {
            let result = self.transition(id, finished.status, |r| {
                r.finished_at = Some(Utc::now());
                r.exit_code = finished.exit_code;
                r.note = finished.note.clone();
            });
            match result {
                Ok(_) => return,
                Err(SchedulerError::Store(StoreError::Persistence(err))) => {
                    warn!(
                        run_id = id,
                        err = %format!("{err:#}"),
                        retry_in_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        "failed to record run result, retrying"
                    );
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(RESULT_RETRY_MAX);
                }
                Err(err) => {
                    error!(run_id = id, err = %err, "failed to record run result");
                    return;
                }
            }
        }
    }

    /// Move the oldest startable queued run into the slot. Caller holds the slot lock.
    fn next_queued(&self, slot: &mut Slot) -> Option<(RunId, RunKind)> {
        if !slot.accepting {
            return None;
        }
        while let Some((id, kind)) = slot.queue.pop_front() {
            match self.transition(id, RunStatus::Running, |r| r.started_at = Some(Utc::now())) {
                Ok(_) => {
                    slot.running = Some(id);
                    info!(run_id = id, kind = %kind, "queued run started");
                    return Some((id, kind));
                }
                Err(err) => error!(run_id = id, err = %err, "failed to start queued run"),
            }
        }
        None
    }

    fn execute(&self, id: RunId, kind: RunKind) -> Finished {
        let request = ProvisionRequest {
            run_id: id,
            kind,
            workdir: self.settings.checkout_dir.clone(),
            log_path: self.store.log_path(id),
            slow_after: self.settings.slow_after,
        };
        match self.provisioner.provision(&request) {
            Ok(outcome) if outcome.succeeded() => Finished {
                status: RunStatus::Succeeded,
                exit_code: outcome.exit_code,
                note: outcome.slow.then(|| SLOW_NOTE.to_string()),
            },
            Ok(outcome) => {
                let mut notes = Vec::new();
                if outcome.exit_code.is_none() {
                    notes.push("terminated by signal");
                }
                if outcome.slow {
                    notes.push(SLOW_NOTE);
                }
                Finished {
                    status: RunStatus::Failed,
                    exit_code: outcome.exit_code,
                    note: (!notes.is_empty()).then(|| notes.join("; ")),
                }
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(run_id = id, err = %message, "provisioner could not run");
                if let Err(log_err) =
                    append_log_line(&request.log_path, &format!("[terraform-ci] {message}"))
                {
                    warn!(run_id = id, err = %log_err, "failed to write run log note");
                }
                Finished {
                    status: RunStatus::Failed,
                    exit_code: None,
                    note: Some(message),
                }
            }
        }
    }
}

struct Finished {
    status: RunStatus,
    exit_code: Option<i32>,
    note: Option<String>,
}

/// Settle records left non-terminal by a previous process.
///
/// Running runs become Failed (their external process state is unknown) and
/// are not resumed. Pending runs become Cancelled.
pub fn recover(store: &RunStore) -> Result<RecoveryReport, StoreError> {
    let mut report = RecoveryReport::default();
    let now = Utc::now();

    for record in store.list_by_status(RunStatus::Running) {
        // The log is sealed once the record is terminal.
        if let Err(err) = append_log_line(
            &record.log_path,
            &format!("[terraform-ci] {INTERRUPTED_NOTE}"),
        ) {
            warn!(run_id = record.id, err = %err, "failed to write run log note");
        }
        store.update(record.id, |r| {
            r.status = RunStatus::Failed;
            r.finished_at = Some(now);
            r.note = Some(INTERRUPTED_NOTE.to_string());
        })?;
        report.interrupted.push(record.id);
    }

    for record in store.list_by_status(RunStatus::Pending) {
        store.update(record.id, |r| {
            r.status = RunStatus::Cancelled;
            r.finished_at = Some(now);
            r.note = Some(DISCARDED_NOTE.to_string());
        })?;
        report.discarded.push(record.id);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::io::provisioner::ProvisionOutcome;
    use crate::test_support::{ScriptedProvisioner, TestCheckout};

    const WAIT: Duration = Duration::from_secs(10);

    fn start(checkout: &TestCheckout, provisioner: &Arc<ScriptedProvisioner>) -> Scheduler {
        Scheduler::start(
            &checkout.config,
            checkout.open_store(),
            provisioner.clone() as Arc<dyn Provisioner>,
        )
        .expect("start")
    }

    #[test]
    fn idle_request_runs_to_success() {
        let checkout = TestCheckout::new();
        let provisioner = Arc::new(ScriptedProvisioner::new(vec![0]));
        let scheduler = start(&checkout, &provisioner);

        let id = scheduler
            .request_run(RunKind::Plan, Trigger::Manual)
            .expect("request");
        assert_eq!(id, 1);
        assert!(scheduler.wait_idle(WAIT));

        let record = scheduler.store().get(id).expect("record");
        assert_eq!(record.status, RunStatus::Succeeded);
        assert_eq!(record.exit_code, Some(0));
        assert!(record.started_at.is_some());
        assert!(record.finished_at.is_some());
        assert_eq!(provisioner.calls(), vec![(1, RunKind::Plan)]);
    }

    #[test]
    fn non_zero_exit_marks_run_failed() {
        let checkout = TestCheckout::new();
        let provisioner = Arc::new(ScriptedProvisioner::new(vec![2]));
        let scheduler = start(&checkout, &provisioner);

        let id = scheduler
            .request_run(RunKind::Apply, Trigger::Manual)
            .expect("request");
        assert!(scheduler.wait_idle(WAIT));

        let record = scheduler.store().get(id).expect("record");
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.exit_code, Some(2));
    }

    #[test]
    fn provisioner_error_marks_run_failed_with_note() {
        let checkout = TestCheckout::new();
        let provisioner = Arc::new(ScriptedProvisioner::failing("terraform not found"));
        let scheduler = start(&checkout, &provisioner);

        let id = scheduler
            .request_run(RunKind::Plan, Trigger::Manual)
            .expect("request");
        assert!(scheduler.wait_idle(WAIT));

        let record = scheduler.store().get(id).expect("record");
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.exit_code, None);
        assert!(record.note.expect("note").contains("terraform not found"));
        let log = scheduler.store().read_log(id).expect("log");
        assert!(log.contains("terraform not found"));
    }

    #[test]
    fn manual_request_while_running_is_rejected() {
        let checkout = TestCheckout::new();
        let provisioner = Arc::new(ScriptedProvisioner::held(vec![0]));
        let scheduler = start(&checkout, &provisioner);

        let id = scheduler
            .request_run(RunKind::Plan, Trigger::Manual)
            .expect("request");
        let err = scheduler
            .request_run(RunKind::Apply, Trigger::Manual)
            .expect_err("busy");

        assert!(matches!(err, SchedulerError::RunInProgress { running } if running == id));
        assert_eq!(scheduler.store().len(), 1);

        provisioner.release();
        assert!(scheduler.wait_idle(WAIT));
    }

    #[test]
    fn change_requests_coalesce_while_running() {
        let checkout = TestCheckout::new();
        let provisioner = Arc::new(ScriptedProvisioner::held(vec![0, 0]));
        let scheduler = start(&checkout, &provisioner);

        let first = scheduler
            .request_run(RunKind::Plan, Trigger::Manual)
            .expect("first");
        let older = scheduler
            .request_run(RunKind::Plan, Trigger::ChangeDetected)
            .expect("older");
        let newer = scheduler
            .request_run(RunKind::Plan, Trigger::ChangeDetected)
            .expect("newer");

        let queued: Vec<RunId> = scheduler.queued().iter().map(|r| r.id).collect();
        assert_eq!(queued, vec![newer]);
        let superseded = scheduler.store().get(older).expect("older record");
        assert_eq!(superseded.status, RunStatus::Cancelled);
        assert_eq!(superseded.note.as_deref(), Some("superseded by run 3"));

        provisioner.release();
        assert!(scheduler.wait_idle(WAIT));
        assert_eq!(
            scheduler.store().get(newer).expect("newer").status,
            RunStatus::Succeeded
        );
        assert_eq!(
            provisioner.calls(),
            vec![(first, RunKind::Plan), (newer, RunKind::Plan)]
        );
    }

    #[test]
    fn coalescing_only_replaces_same_kind() {
        let checkout = TestCheckout::new();
        let provisioner = Arc::new(ScriptedProvisioner::held(vec![]));
        let scheduler = start(&checkout, &provisioner);

        scheduler
            .request_run(RunKind::Plan, Trigger::Manual)
            .expect("running");
        let apply = scheduler
            .request_run(RunKind::Apply, Trigger::ChangeDetected)
            .expect("apply");
        let plan = scheduler
            .request_run(RunKind::Plan, Trigger::StartupRecovery)
            .expect("plan");

        let queued: Vec<RunId> = scheduler.queued().iter().map(|r| r.id).collect();
        assert_eq!(queued, vec![apply, plan]);

        provisioner.release();
        assert!(scheduler.wait_idle(WAIT));
    }

    #[test]
    fn disabled_plans_succeed_without_running() {
        let mut checkout = TestCheckout::new();
        checkout.config.run_plan_enabled = false;
        let provisioner = Arc::new(ScriptedProvisioner::new(vec![]));
        let scheduler = start(&checkout, &provisioner);

        let id = scheduler
            .request_run(RunKind::Plan, Trigger::ChangeDetected)
            .expect("request");

        let record = scheduler.store().get(id).expect("record");
        assert_eq!(record.status, RunStatus::Succeeded);
        assert_eq!(record.note.as_deref(), Some(PLANS_DISABLED_NOTE));
        assert_eq!(record.exit_code, None);
        assert!(scheduler.running().is_none());
        assert!(provisioner.calls().is_empty());
    }

    #[test]
    fn cancel_pending_but_not_running() {
        let checkout = TestCheckout::new();
        let provisioner = Arc::new(ScriptedProvisioner::held(vec![]));
        let scheduler = start(&checkout, &provisioner);

        let running = scheduler
            .request_run(RunKind::Apply, Trigger::Manual)
            .expect("running");
        let pending = scheduler
            .request_run(RunKind::Plan, Trigger::ChangeDetected)
            .expect("pending");

        assert!(matches!(
            scheduler.cancel(running),
            Err(SchedulerError::NotCancellable(id)) if id == running
        ));
        let cancelled = scheduler.cancel(pending).expect("cancel");
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert!(scheduler.queued().is_empty());
        assert!(matches!(
            scheduler.cancel(pending),
            Err(SchedulerError::AlreadyFinished { .. })
        ));
        assert!(matches!(
            scheduler.cancel(99),
            Err(SchedulerError::NotFound(99))
        ));

        provisioner.release();
        assert!(scheduler.wait_idle(WAIT));
        assert_eq!(provisioner.calls().len(), 1);
    }

    #[test]
    fn shutdown_cancels_queue_and_rejects_new_requests() {
        let checkout = TestCheckout::new();
        let provisioner = Arc::new(ScriptedProvisioner::held(vec![]));
        let scheduler = start(&checkout, &provisioner);

        let running = scheduler
            .request_run(RunKind::Plan, Trigger::Manual)
            .expect("running");
        let queued = scheduler
            .request_run(RunKind::Apply, Trigger::ChangeDetected)
            .expect("queued");

        scheduler.shutdown();
        assert!(matches!(
            scheduler.request_run(RunKind::Plan, Trigger::ChangeDetected),
            Err(SchedulerError::ShuttingDown)
        ));
        assert_eq!(
            scheduler.store().get(queued).expect("queued").note.as_deref(),
            Some(SHUTDOWN_NOTE)
        );

        provisioner.release();
        assert!(scheduler.wait_idle(WAIT));
        assert_eq!(
            scheduler.store().get(running).expect("running").status,
            RunStatus::Succeeded
        );
    }

    #[test]
    fn observers_see_every_transition() {
        let checkout = TestCheckout::new();
        let provisioner = Arc::new(ScriptedProvisioner::new(vec![0]));
        let scheduler = start(&checkout, &provisioner);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        scheduler.subscribe(move |record| {
            sink.lock().expect("lock").push(record.status);
        });

        scheduler
            .request_run(RunKind::Plan, Trigger::Manual)
            .expect("request");
        assert!(scheduler.wait_idle(WAIT));

        assert_eq!(
            *seen.lock().expect("lock"),
            vec![RunStatus::Pending, RunStatus::Running, RunStatus::Succeeded]
        );
    }

    #[test]
    fn never_more_than_one_running() {
        let checkout = TestCheckout::new();
        let provisioner = Arc::new(ScriptedProvisioner::new(vec![]));
        let scheduler = start(&checkout, &provisioner);
        let max_running = Arc::new(AtomicUsize::new(0));
        let store = scheduler.store().clone();
        let observed = max_running.clone();
        scheduler.subscribe(move |_| {
            let running = store.list_by_status(RunStatus::Running).len();
            observed.fetch_max(running, Ordering::SeqCst);
        });

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let scheduler = scheduler.clone();
                thread::spawn(move || {
                    let trigger = if i % 2 == 0 {
                        Trigger::Manual
                    } else {
                        Trigger::ChangeDetected
                    };
                    let kind = if i % 3 == 0 { RunKind::Apply } else { RunKind::Plan };
                    let _ = scheduler.request_run(kind, trigger);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert!(scheduler.wait_idle(WAIT));

        assert!(max_running.load(Ordering::SeqCst) <= 1);
        assert_eq!(provisioner.max_concurrent(), 1);
        assert!(scheduler.store().list_by_status(RunStatus::Running).is_empty());
        assert!(scheduler.store().list_by_status(RunStatus::Pending).is_empty());
    }

    #[test]
    fn recover_fails_running_and_discards_pending() {
        let checkout = TestCheckout::new();
        let store = checkout.open_store();
        let mut running = RunRecord::pending(1, RunKind::Apply, Trigger::Manual, store.log_path(1));
        running.status = RunStatus::Running;
        store.append(running).expect("append running");
        store
            .append(RunRecord::pending(
                2,
                RunKind::Plan,
                Trigger::ChangeDetected,
                store.log_path(2),
            ))
            .expect("append pending");

        let report = recover(&store).expect("recover");

        assert_eq!(report.interrupted, vec![1]);
        assert_eq!(report.discarded, vec![2]);
        let failed = store.get(1).expect("run 1");
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.note.as_deref(), Some(INTERRUPTED_NOTE));
        assert!(failed.finished_at.is_some());
        assert!(
            store
                .read_log(1)
                .expect("log")
                .contains(INTERRUPTED_NOTE)
        );
        assert_eq!(store.get(2).expect("run 2").status, RunStatus::Cancelled);
    }

    #[test]
    fn unwritable_result_keeps_slot_until_recorded() {
        let checkout = TestCheckout::new();
        let provisioner = Arc::new(ScriptedProvisioner::held(vec![0]));
        let scheduler = start(&checkout, &provisioner);

        let id = scheduler
            .request_run(RunKind::Apply, Trigger::Manual)
            .expect("request");
        let blocker = checkout.config.state_dir.join("runs.json.tmp");
        std::fs::create_dir(&blocker).expect("block index writes");
        provisioner.release();

        let mut degraded = None;
        for _ in 0..100 {
            degraded = scheduler.store().degraded();
            if degraded.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert!(degraded.is_some(), "store reports the failed write");
        assert_eq!(scheduler.running().map(|r| r.id), Some(id));
        assert!(matches!(
            scheduler.request_run(RunKind::Plan, Trigger::Manual),
            Err(SchedulerError::RunInProgress { running }) if running == id
        ));

        std::fs::remove_dir(&blocker).expect("unblock index writes");
        assert!(scheduler.wait_idle(WAIT));
        let record = scheduler.store().get(id).expect("record");
        assert_eq!(record.status, RunStatus::Succeeded);
        assert!(scheduler.store().list_by_status(RunStatus::Running).is_empty());
        assert!(scheduler.store().degraded().is_none());
        assert_eq!(provisioner.calls(), vec![(id, RunKind::Apply)]);
    }

    struct SlowProvisioner(i32);

    impl Provisioner for SlowProvisioner {
        fn provision(&self, _request: &ProvisionRequest) -> anyhow::Result<ProvisionOutcome> {
            Ok(ProvisionOutcome {
                exit_code: Some(self.0),
                slow: true,
            })
        }
    }

    #[test]
    fn slow_runs_are_noted_on_the_record() {
        let checkout = TestCheckout::new();
        let scheduler = Scheduler::start(
            &checkout.config,
            checkout.open_store(),
            Arc::new(SlowProvisioner(0)),
        )
        .expect("start");
        let id = scheduler
            .request_run(RunKind::Plan, Trigger::Manual)
            .expect("request");
        assert!(scheduler.wait_idle(WAIT));
        let record = scheduler.store().get(id).expect("record");
        assert_eq!(record.status, RunStatus::Succeeded);
        assert_eq!(record.note.as_deref(), Some(SLOW_NOTE));

        let checkout = TestCheckout::new();
        let scheduler = Scheduler::start(
            &checkout.config,
            checkout.open_store(),
            Arc::new(SlowProvisioner(1)),
        )
        .expect("start");
        let id = scheduler
            .request_run(RunKind::Plan, Trigger::Manual)
            .expect("request");
        assert!(scheduler.wait_idle(WAIT));
        let record = scheduler.store().get(id).expect("record");
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.note.as_deref(), Some(SLOW_NOTE));
    }
}
