//! Reclaiming a work directory: unmount, then remove.
//!
//! This runs in the detached cleanup process and takes only the three paths
//! it is handed on the command line.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::process::{Cmd, Runner};

/// Unmount attempts before a lazy unmount is forced.
pub const UNMOUNT_ATTEMPTS: u32 = 5;

/// Answers whether a directory is currently a mount point.
pub trait MountProbe {
    fn is_mounted(&self, dir: &Path) -> bool;
}

/// Compares the device id of a directory with that of its parent.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceProbe;

impl MountProbe for DeviceProbe {
    fn is_mounted(&self, dir: &Path) -> bool {
        is_mount_point(dir)
    }
}

/// True when `dir` lives on a different device than its parent.
///
/// A directory that exists but cannot be stat'ed (a FUSE endpoint whose
/// daemon died) counts as mounted so it still gets unmounted.
pub fn is_mount_point(dir: &Path) -> bool {
    let meta = match fs::metadata(dir) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return false,
        Err(_) => return true,
    };
    let parent = match dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return false,
    };
    fs::metadata(parent)
        .map(|parent_meta| parent_meta.dev() != meta.dev())
        .unwrap_or(false)
}

/// Paths handed to the cleanup process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimPlan {
    pub mount_dir: PathBuf,
    pub pool_dir: PathBuf,
    pub work_dir: PathBuf,
}

impl ReclaimPlan {
    /// Parse `<mountDir> <poolDir> <workDir>`.
    pub fn from_args(args: &[String]) -> Option<Self> {
        match args {
            [mount, pool, work] => Some(Self {
                mount_dir: PathBuf::from(mount),
                pool_dir: PathBuf::from(pool),
                work_dir: PathBuf::from(work),
            }),
            _ => None,
        }
    }
}

/// What a reclaim run did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReclaimReport {
    pub unmount_attempts: u32,
    pub forced_unmount: bool,
    pub work_dir_removed: bool,
    pub pool_dir_removed: bool,
}

/// Unmount `plan.mount_dir` and remove the work directory.
///
/// Every step is best-effort. The n-th unmount attempt is followed by a pause
/// of `n * step` before the mount is checked again.
pub fn reclaim(
    plan: &ReclaimPlan,
    unmount_tool: Option<&Path>,
    runner: &dyn Runner,
    probe: &dyn MountProbe,
    step: Duration,
    pause: &dyn Fn(Duration),
) -> ReclaimReport {
    let mut report = ReclaimReport::default();

    match unmount_tool {
        Some(tool) => {
            for attempt in 1..=UNMOUNT_ATTEMPTS {
                if !probe.is_mounted(&plan.mount_dir) {
                    break;
                }
                report.unmount_attempts = attempt;
                run_quietly(runner, &Cmd::new(tool).arg("-u").arg_path(&plan.mount_dir));
                pause(step * attempt);
            }
            if probe.is_mounted(&plan.mount_dir) {
                tracing::warn!(
                    "'{}' still mounted after {UNMOUNT_ATTEMPTS} attempts, forcing lazy unmount",
                    plan.mount_dir.display()
                );
                report.forced_unmount = true;
                run_quietly(runner, &Cmd::new(tool).arg("-uz").arg_path(&plan.mount_dir));
            }
        }
        None if probe.is_mounted(&plan.mount_dir) => {
            tracing::warn!("no unmount helper available, leaving '{}' mounted", plan.mount_dir.display());
        }
        None => {}
    }

    report.work_dir_removed = match fs::remove_dir_all(&plan.work_dir) {
        Ok(()) => true,
        Err(err) if err.kind() == ErrorKind::NotFound => true,
        Err(err) => {
            tracing::warn!("removing work directory '{}': {err}", plan.work_dir.display());
            false
        }
    };

    // Only succeeds when no sibling work directory remains.
    report.pool_dir_removed = fs::remove_dir(&plan.pool_dir).is_ok();
    report
}

fn run_quietly(runner: &dyn Runner, cmd: &Cmd) {
    match runner.run(cmd) {
        Ok(result) if !result.success() => {
            tracing::debug!("{cmd} exited with {:?}: {}", result.code, result.combined_output());
        }
        Ok(_) => {}
        Err(err) => tracing::debug!("{cmd}: {err:#}"),
    }
}

/// Run a full reclaim with the host runner, real pauses and device probing.
pub fn reclaim_on_host(plan: &ReclaimPlan) -> ReclaimReport {
    let search_path = std::env::var_os("PATH").unwrap_or_default();
    let unmount_tool = crate::tools::resolve_unmount_tool(&search_path).ok();
    reclaim(
        plan,
        unmount_tool.as_deref(),
        &crate::process::HostRunner,
        &DeviceProbe,
        Duration::from_secs(1),
        &std::thread::sleep,
    )
}
