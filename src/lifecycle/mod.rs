//! Cleanup lifecycle.
//!
//! Every termination path (normal exit, fatal error, recovered panic,
//! signal) ends in [`CleanupGuard::fire`], which hands the actual unmount
//! and removal to a detached copy of the bundle started with
//! `--pbundle_internal_Cleanup`. The helper is never waited on, so it
//! outlives this process.

pub mod reclaim;

use anyhow::{Context, Result};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::RuntimeConfig;
use crate::dispatch::INTERNAL_CLEANUP_FLAG;

pub use reclaim::{is_mount_point, reclaim_on_host, DeviceProbe, MountProbe, ReclaimPlan};

/// Signals that trigger cleanup before exiting.
pub const TERMINATION_SIGNALS: [i32; 4] = [SIGINT, SIGTERM, SIGHUP, SIGQUIT];

/// What the detached helper needs to know.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CleanupRequest {
    program: PathBuf,
    plan: ReclaimPlan,
    search_path: OsString,
    enabled: bool,
}

impl CleanupRequest {
    fn from_config(cfg: &RuntimeConfig) -> Self {
        Self {
            program: cfg.self_path.clone(),
            plan: ReclaimPlan {
                mount_dir: cfg.mount_dir.clone(),
                pool_dir: cfg.pool_dir.clone(),
                work_dir: cfg.work_dir.clone(),
            },
            search_path: cfg.search_path.clone(),
            enabled: !cfg.no_cleanup,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(INTERNAL_CLEANUP_FLAG)
            .arg(&self.plan.mount_dir)
            .arg(&self.plan.pool_dir)
            .arg(&self.plan.work_dir)
            .env("PATH", &self.search_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        cmd
    }
}

#[derive(Debug)]
struct GuardState {
    fired: AtomicBool,
    request: Mutex<CleanupRequest>,
}

/// Fires the detached cleanup at most once per process.
///
/// Clones share state, so the signal thread and the main thread can both
/// hold one.
#[derive(Debug, Clone)]
pub struct CleanupGuard {
    state: Arc<GuardState>,
}

impl CleanupGuard {
    pub fn new(cfg: &RuntimeConfig) -> Self {
        Self {
            state: Arc::new(GuardState {
                fired: AtomicBool::new(false),
                request: Mutex::new(CleanupRequest::from_config(cfg)),
            }),
        }
    }

    /// Refresh the paths and search path after the configuration changed.
    pub fn update(&self, cfg: &RuntimeConfig) {
        *self
            .state
            .request
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = CleanupRequest::from_config(cfg);
    }

    /// Start the detached cleanup helper unless it already ran, cleanup is
    /// disabled, or there is no work directory to reclaim.
    pub fn fire(&self) {
        if self.state.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let request = self
            .state
            .request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if !request.enabled {
            tracing::debug!("cleanup disabled, keeping '{}'", request.plan.work_dir.display());
            return;
        }
        if !request.plan.work_dir.exists() {
            return;
        }
        match spawn_detached(&request) {
            Ok(pid) => tracing::debug!("cleanup helper started as pid {pid}"),
            Err(err) => tracing::warn!("{err:#}"),
        }
    }
}

#[cfg(test)]
impl CleanupGuard {
    pub(crate) fn has_fired(&self) -> bool {
        self.state.fired.load(Ordering::SeqCst)
    }
}

fn spawn_detached(request: &CleanupRequest) -> Result<u32> {
    let child = request
        .command()
        .spawn()
        .with_context(|| format!("starting cleanup helper '{}'", request.program.display()))?;
    // Dropping the handle leaves the helper running unsupervised.
    Ok(child.id())
}

/// Run cleanup and exit with `128 + signal` on any termination signal.
pub fn install_signal_handlers(guard: CleanupGuard) -> Result<()> {
    let mut signals =
        Signals::new(TERMINATION_SIGNALS).context("registering termination signal handlers")?;
    std::thread::Builder::new()
        .name("pbundle-signals".into())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                tracing::debug!("received signal {signal}, cleaning up");
                guard.fire();
                std::process::exit(128 + signal);
            }
        })
        .context("spawning signal handler thread")?;
    Ok(())
}
