//! Filesystem activation: making the image's contents available on disk.
//!
//! Depending on [`RunBehavior`] the image is FUSE-mounted into the mount
//! directory, extracted into it, or mounted with extraction as a fallback.
//! A successful activation leaves an [`ActivationRecord`] in the work
//! directory; later activations of the same work directory reuse it.

pub mod record;

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::config::{RunBehavior, RuntimeConfig, MAX_EXTRACT_SELF_SIZE};
use crate::error::{classify, BundleError};
use crate::filesystem::ImageRequest;
use crate::lifecycle::MountProbe;
use crate::process::{Cmd, CommandResult, Runner};
use crate::tools;

pub use record::{ActivationMode, ActivationRecord};

/// Activate the bundle's image into `cfg.mount_dir` according to the
/// configured run behavior.
pub fn activate(cfg: &RuntimeConfig, runner: &dyn Runner, probe: &dyn MountProbe) -> Result<ActivationMode> {
    let log = cfg.activation_log();
    if let Some(previous) = ActivationRecord::load(&log) {
        if still_active(cfg, previous.mode, probe) {
            tracing::debug!("work directory already activated ({:?}), skipping", previous.mode);
            return Ok(previous.mode);
        }
        tracing::info!("stale activation log at '{}', activating again", log.display());
    }

    let (mode, output) = match cfg.run_behavior {
        RunBehavior::ExtractOnly => (ActivationMode::Extracted, extract(cfg, runner, &cfg.mount_dir, &[])?),
        RunBehavior::FuseOnly => (ActivationMode::Mounted, mount(cfg, runner, probe, &cfg.mount_dir)?),
        RunBehavior::FuseWithFallback | RunBehavior::FuseWithSizeGatedFallback => {
            match mount(cfg, runner, probe, &cfg.mount_dir) {
                Ok(output) => (ActivationMode::Mounted, output),
                Err(err) => {
                    if !may_fall_back(cfg, &err)? {
                        return Err(err);
                    }
                    tracing::warn!("{err:#}; falling back to extraction");
                    (ActivationMode::Extracted, extract(cfg, runner, &cfg.mount_dir, &[])?)
                }
            }
        }
    };

    ActivationRecord::new(cfg.fs_kind(), mode, output).write(&log)?;
    tracing::info!("activated {} image into '{}' ({mode:?})", cfg.fs_kind(), cfg.mount_dir.display());
    Ok(mode)
}

fn still_active(cfg: &RuntimeConfig, mode: ActivationMode, probe: &dyn MountProbe) -> bool {
    match mode {
        ActivationMode::Mounted => probe.is_mounted(&cfg.mount_dir),
        ActivationMode::Extracted => cfg.mount_dir.is_dir(),
    }
}

fn may_fall_back(cfg: &RuntimeConfig, err: &anyhow::Error) -> Result<bool> {
    if !classify(err).is_some_and(BundleError::is_mount_failure) {
        return Ok(false);
    }
    if cfg.run_behavior != RunBehavior::FuseWithSizeGatedFallback {
        return Ok(true);
    }
    let size = fs::metadata(&cfg.self_path)
        .with_context(|| format!("reading size of '{}'", cfg.self_path.display()))?
        .len();
    if size > MAX_EXTRACT_SELF_SIZE {
        tracing::warn!("bundle is {size} bytes, too large to fall back to extraction");
        return Ok(false);
    }
    Ok(true)
}

/// FUSE-mount the image at `target` and confirm the mount took effect.
///
/// Returns the mount tool's combined output.
pub fn mount(
    cfg: &RuntimeConfig,
    runner: &dyn Runner,
    probe: &dyn MountProbe,
    target: &Path,
) -> Result<String> {
    let kind = cfg.fs_kind();
    let program = tools::resolve_tool(kind.profile().mount_tool, &cfg.search_path)?;
    fs::create_dir_all(target)
        .with_context(|| format!("creating mount directory '{}'", target.display()))?;

    let patterns: &[String] = &[];
    let cmd = kind.mount_command(&program, &image_request(cfg, target, patterns));
    let result = run_helper(cfg, runner, cmd)?;
    let output = result.combined_output();

    if !result.success() {
        return Err(BundleError::MountFailed { fs: kind, output }.into());
    }
    if !probe.is_mounted(target) {
        return Err(BundleError::MountFailed {
            fs: kind,
            output: format!("'{}' is not a mount point after mounting", target.display()),
        }
        .into());
    }
    Ok(output)
}

/// Extract the image (or only `patterns`) into `target`.
///
/// Returns the extract tool's combined output.
pub fn extract(cfg: &RuntimeConfig, runner: &dyn Runner, target: &Path, patterns: &[String]) -> Result<String> {
    let kind = cfg.fs_kind();
    let program = tools::resolve_tool(kind.profile().extract_tool, &cfg.search_path)?;
    fs::create_dir_all(target)
        .with_context(|| format!("creating extraction directory '{}'", target.display()))?;

    let cmd = kind.extract_command(&program, &image_request(cfg, target, patterns));
    let result = run_helper(cfg, runner, cmd)?;
    let output = result.combined_output();

    if !result.success() {
        return Err(BundleError::ExtractFailed { fs: kind, output }.into());
    }
    Ok(output)
}

fn image_request<'a>(cfg: &'a RuntimeConfig, target: &'a Path, patterns: &'a [String]) -> ImageRequest<'a> {
    ImageRequest {
        image: &cfg.self_path,
        offset: cfg.trailer.image_offset,
        target,
        uid: cfg.uid,
        gid: cfg.gid,
        tuning: &cfg.tuning,
        patterns,
    }
}

fn run_helper(cfg: &RuntimeConfig, runner: &dyn Runner, cmd: Cmd) -> Result<CommandResult> {
    let cmd = cmd.env("PATH", &cfg.search_path);
    tracing::debug!("activating with: {cmd}");
    runner.run(&cmd)
}
