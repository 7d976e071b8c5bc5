//! Test-only helpers: temporary checkouts and scripted provisioners.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::config::ServerConfig;
use crate::core::types::{RunId, RunKind};
use crate::io::provisioner::{ProvisionOutcome, ProvisionRequest, Provisioner};
use crate::io::store::RunStore;

/// A temporary checkout directory with a matching configuration.
///
/// State lives in `<checkout>/.terraform-ci`, as with the daemon defaults.
pub struct TestCheckout {
    pub temp: TempDir,
    pub config: ServerConfig,
}

impl TestCheckout {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("main.tf"), "# test checkout\n").expect("write main.tf");
        let mut config = ServerConfig::new(temp.path());
        config.site_dir = temp.path().join("site");
        Self { temp, config }
    }

    pub fn open_store(&self) -> Arc<RunStore> {
        Arc::new(RunStore::open(&self.config.state_dir).expect("open store"))
    }
}

impl Default for TestCheckout {
    fn default() -> Self {
        Self::new()
    }
}

/// Provisioner that returns scripted exit codes without spawning processes.
///
/// Exit codes are consumed in call order; once exhausted every call exits 0.
/// A held provisioner blocks every call until [`ScriptedProvisioner::release`],
/// which keeps runs in the Running state for as long as a test needs.
pub struct ScriptedProvisioner {
    exit_codes: Mutex<VecDeque<i32>>,
    failure: Option<String>,
    calls: Mutex<Vec<(RunId, RunKind)>>,
    released: Mutex<bool>,
    gate: Condvar,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedProvisioner {
    pub fn new(exit_codes: Vec<i32>) -> Self {
        Self {
            exit_codes: Mutex::new(exit_codes.into()),
            failure: None,
            calls: Mutex::new(Vec::new()),
            released: Mutex::new(true),
            gate: Condvar::new(),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Like [`ScriptedProvisioner::new`], but calls block until released.
    pub fn held(exit_codes: Vec<i32>) -> Self {
        let provisioner = Self::new(exit_codes);
        *provisioner.released.lock().expect("lock") = false;
        provisioner
    }

    /// Every call fails as if the executable could not be started.
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::new(Vec::new())
        }
    }

    /// Let blocked and future calls proceed.
    pub fn release(&self) {
        *self.released.lock().expect("lock") = true;
        self.gate.notify_all();
    }

    /// Runs that reached the provisioner, in call order.
    pub fn calls(&self) -> Vec<(RunId, RunKind)> {
        self.calls.lock().expect("lock").clone()
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl Provisioner for ScriptedProvisioner {
    fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionOutcome> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.calls
            .lock()
            .expect("lock")
            .push((request.run_id, request.kind));

        if let Some(parent) = request.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut log = fs::File::create(&request.log_path)?;
        writeln!(log, "scripted {} for run {}", request.kind, request.run_id)?;

        let mut released = self.released.lock().expect("lock");
        while !*released {
            released = self.gate.wait(released).expect("wait");
        }
        drop(released);

        self.active.fetch_sub(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            return Err(anyhow!("{message}"));
        }
        let code = self
            .exit_codes
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(0);
        Ok(ProvisionOutcome::exited(code))
    }
}
