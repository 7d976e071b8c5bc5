//! Change watcher: requests a plan whenever the checkout moves.
//!
//! Git checkouts are compared by fingerprint (HEAD, porcelain status and
//! content hashes of changed files) on every tick; the first tick only records
//! the baseline. Plain directories fall back to a `notify` poll watcher that
//! raises a dirty flag.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use tfci::config::ServerConfig;
use tfci::core::types::{RunKind, Trigger};
use tfci::io::git::Git;
use tfci::scheduler::{Scheduler, SchedulerError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Start the watcher loop. It exits once `shutdown` flips or its sender is dropped.
pub fn spawn(
    config: Arc<ServerConfig>,
    scheduler: Scheduler,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(config.provisioner.poll_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut detector: Option<Detector> = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    let Some(active) = ready(&mut detector, &config).await else {
                        continue;
                    };
                    match active.changed().await {
                        Ok(true) => request_plan(&scheduler).await,
                        Ok(false) => {}
                        Err(err) => warn!(err = %format!("{err:#}"), "change check failed"),
                    }
                }
            }
        }
        info!("change watcher stopped");
    })
}

/// The detector, built on first use. A failed build is retried on the next tick.
async fn ready<'a>(
    detector: &'a mut Option<Detector>,
    config: &ServerConfig,
) -> Option<&'a mut Detector> {
    if detector.is_none() {
        match Detector::for_checkout(config).await {
            Ok(built) => {
                info!(
                    mode = built.mode(),
                    interval_secs = config.provisioner.poll_interval_secs,
                    "change watcher started"
                );
                *detector = Some(built);
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "change watcher unavailable, retrying");
                return None;
            }
        }
    }
    detector.as_mut()
}

async fn request_plan(scheduler: &Scheduler) {
    let scheduler = scheduler.clone();
    let result = tokio::task::spawn_blocking(move || {
        scheduler.request_run(RunKind::Plan, Trigger::ChangeDetected)
    })
    .await;
    match result {
        Ok(Ok(id)) => info!(run_id = id, "checkout changed, plan requested"),
        Ok(Err(SchedulerError::ShuttingDown)) => debug!("checkout changed during shutdown"),
        Ok(Err(err)) => warn!(err = %err, "could not request plan for change"),
        Err(err) => warn!(err = %err, "plan request task failed"),
    }
}

enum Detector {
    Git {
        git: Git,
        ignored: Vec<String>,
        baseline: Option<String>,
    },
    Poll {
        dirty: Arc<AtomicBool>,
        _watcher: PollWatcher,
    },
}

impl Detector {
    async fn for_checkout(config: &ServerConfig) -> Result<Self> {
        if !config.checkout_dir.is_dir() {
            bail!("checkout {} is not a directory", config.checkout_dir.display());
        }
        let git = Git::new(&config.checkout_dir);
        let probe = git.clone();
        let is_repository = tokio::task::spawn_blocking(move || probe.is_repository())
            .await
            .context("probe checkout")?;
        if is_repository {
            Ok(Self::Git {
                git,
                ignored: config.ignored_prefixes(),
                baseline: None,
            })
        } else {
            Self::poll(config)
        }
    }

    fn poll(config: &ServerConfig) -> Result<Self> {
        let dirty = Arc::new(AtomicBool::new(false));
        let flag = dirty.clone();
        let root = config.checkout_dir.clone();
        let ignored = config.ignored_prefixes();

        let mut watcher = PollWatcher::new(
            move |res: Result<NotifyEvent, notify::Error>| match res {
                Ok(event) => {
                    if is_content_change(&event)
                        && event.paths.iter().any(|p| !is_ignored(&root, p, &ignored))
                    {
                        flag.store(true, Ordering::SeqCst);
                    }
                }
                Err(err) => warn!(err = %err, "checkout poll failed"),
            },
            notify::Config::default().with_poll_interval(config.provisioner.poll_interval()),
        )
        .context("create poll watcher")?;
        watcher
            .watch(&config.checkout_dir, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", config.checkout_dir.display()))?;

        Ok(Self::Poll {
            dirty,
            _watcher: watcher,
        })
    }

    fn mode(&self) -> &'static str {
        match self {
            Self::Git { .. } => "git",
            Self::Poll { .. } => "poll",
        }
    }

    /// True if the checkout moved since the previous call.
    async fn changed(&mut self) -> Result<bool> {
        match self {
            Self::Git {
                git,
                ignored,
                baseline,
            } => {
                let git = git.clone();
                let ignored = ignored.clone();
                let current = tokio::task::spawn_blocking(move || git.fingerprint(&ignored))
                    .await
                    .context("fingerprint task")??;
                match baseline.replace(current) {
                    None => {
                        debug!("recorded checkout baseline");
                        Ok(false)
                    }
                    Some(previous) => Ok(baseline.as_deref() != Some(previous.as_str())),
                }
            }
            Self::Poll { dirty, .. } => Ok(dirty.swap(false, Ordering::SeqCst)),
        }
    }
}

fn is_content_change(event: &NotifyEvent) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// True if `path` lies under one of the checkout-relative `prefixes`.
fn is_ignored(root: &Path, path: &Path, prefixes: &[String]) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    let candidate = format!("{}/", relative.to_string_lossy().replace('\\', "/"));
    prefixes
        .iter()
        .any(|prefix| candidate.starts_with(prefix.as_str()))
}
