//! Reserved-flag dispatch and entrypoint launch.
//!
//! The first argument decides what happens: a reserved flag is serviced by
//! the runtime and yields [`Outcome::Done`] (or [`Outcome::Hold`] for
//! `--pbundle_mount`), anything else activates the image and yields an
//! [`Outcome::Launch`] with every argument passed through unchanged.

pub mod flags;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

use crate::activate;
use crate::config::{RunBehavior, RuntimeConfig};
use crate::environment::Environment;
use crate::error::BundleError;
use crate::filesystem::default_extract_dir;
use crate::lifecycle::MountProbe;
use crate::process::Runner;
use crate::tools::{self, ToolNeeds};

pub use flags::{RuntimeFlag, INTERNAL_CLEANUP_FLAG};

/// Extraction target of `--appimage-extract`.
pub const APPIMAGE_EXTRACT_DIR: &str = "squashfs-root";

/// Collaborators the dispatcher needs besides the configuration.
pub struct Services<'a> {
    pub runner: &'a dyn Runner,
    pub probe: &'a dyn MountProbe,
    /// View of the inherited environment.
    pub lookup: &'a dyn Fn(&str) -> Option<String>,
}

/// What the caller should do once dispatch returns.
#[derive(Debug)]
pub enum Outcome {
    /// A reserved flag was serviced; clean up and exit successfully.
    Done,
    /// Keep the image mounted at this path until signalled.
    Hold(PathBuf),
    /// Execute a program inside the activated bundle.
    Launch(Launch),
}

/// A fully prepared program execution.
#[derive(Debug)]
pub struct Launch {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Environment,
    pub current_dir: Option<PathBuf>,
}

impl Launch {
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        self.env.apply(&mut cmd);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Run to completion with inherited stdio and return the exit code.
    ///
    /// A child killed by a signal maps to `128 + signal`.
    pub fn run(&self) -> Result<i32> {
        tracing::debug!("executing {}", self.program.display());
        let status = self
            .command()
            .status()
            .with_context(|| format!("executing '{}'", self.program.display()))?;
        Ok(status
            .code()
            .or_else(|| status.signal().map(|sig| 128 + sig))
            .unwrap_or(1))
    }
}

/// Service `args` (argv without argv[0]).
pub fn dispatch(
    cfg: &mut RuntimeConfig,
    args: &[OsString],
    services: &Services,
    out: &mut dyn Write,
) -> Result<Outcome> {
    let flag = args
        .first()
        .and_then(|arg| arg.to_str())
        .and_then(RuntimeFlag::parse);

    let Some(flag) = flag else {
        prepare(cfg, services)?;
        let entrypoint = cfg.entrypoint.clone();
        return Ok(Outcome::Launch(launch(cfg, entrypoint, args.to_vec(), services, None)?));
    };
    let rest = &args[1..];
    tracing::debug!("servicing {flag}");

    match flag {
        RuntimeFlag::Help => {
            write_help(cfg, out)?;
            Ok(Outcome::Done)
        }
        RuntimeFlag::List => {
            prepare(cfg, services)?;
            for entry in WalkDir::new(&cfg.work_dir) {
                let entry = entry
                    .with_context(|| format!("listing '{}'", cfg.work_dir.display()))?;
                writeln!(out, "{}", entry.path().display())?;
            }
            Ok(Outcome::Done)
        }
        RuntimeFlag::Link => {
            let Some((name, link_args)) = rest.split_first() else {
                return Err(BundleError::InvalidArguments(format!(
                    "{flag} needs a command to run"
                ))
                .into());
            };
            prepare(cfg, services)?;
            let mount_dir = cfg.mount_dir.clone();
            let launch = launch(
                cfg,
                PathBuf::from(name),
                link_args.to_vec(),
                services,
                Some(mount_dir),
            )?;
            Ok(Outcome::Launch(launch))
        }
        RuntimeFlag::PngIcon => {
            prepare(cfg, services)?;
            emit_asset(&cfg.mount_dir.join(".DirIcon"), "PNG icon", out)
        }
        RuntimeFlag::SvgIcon => {
            prepare(cfg, services)?;
            emit_asset(&cfg.mount_dir.join(".DirIcon.svg"), "SVG icon", out)
        }
        RuntimeFlag::Desktop => {
            prepare(cfg, services)?;
            let found = first_top_level(&cfg.mount_dir, "desktop")?;
            emit_found(found, "desktop entry", out)
        }
        RuntimeFlag::AppStream => {
            prepare(cfg, services)?;
            let found = first_top_level(&cfg.mount_dir, "xml")?;
            emit_found(found, "AppStream metadata", out)
        }
        RuntimeFlag::PortableHome => create_portable(cfg, ".home"),
        RuntimeFlag::PortableConfig => create_portable(cfg, ".config"),
        RuntimeFlag::Extract => {
            let target = default_extract_dir(&cfg.sanitized_id, cfg.fs_kind());
            extract_into(cfg, services, &target, rest, out)
        }
        RuntimeFlag::AppImageExtract => {
            extract_into(cfg, services, Path::new(APPIMAGE_EXTRACT_DIR), rest, out)
        }
        RuntimeFlag::ExtractAndRun => {
            cfg.run_behavior = RunBehavior::ExtractOnly;
            prepare(cfg, services)?;
            let entrypoint = cfg.entrypoint.clone();
            Ok(Outcome::Launch(launch(cfg, entrypoint, rest.to_vec(), services, None)?))
        }
        RuntimeFlag::Mount => {
            if let Some(dir) = rest.first().filter(|dir| !dir.is_empty()) {
                let dir = PathBuf::from(dir);
                if !dir.is_dir() {
                    return Err(BundleError::InvalidArguments(format!(
                        "mount point '{}' is not a directory",
                        dir.display()
                    ))
                    .into());
                }
                cfg.mount_dir = dir;
            }
            cfg.no_cleanup = false;
            cfg.ensure_work_dir()?;
            tools::ensure_tools(cfg, ToolNeeds::Mount)?;
            let mount_dir = cfg.mount_dir.clone();
            activate::mount(cfg, services.runner, services.probe, &mount_dir)?;
            writeln!(out, "{}", mount_dir.display())?;
            Ok(Outcome::Hold(mount_dir))
        }
        RuntimeFlag::Offset => {
            writeln!(out, "{}", cfg.trailer.image_offset)?;
            Ok(Outcome::Done)
        }
        RuntimeFlag::Cleanup => {
            writeln!(out, "A cleanup job has been requested...")?;
            cfg.no_cleanup = false;
            Ok(Outcome::Done)
        }
    }
}

/// Work directory, helper tools, then activation, in that order.
fn prepare(cfg: &mut RuntimeConfig, services: &Services) -> Result<()> {
    cfg.ensure_work_dir()?;
    let needs = ToolNeeds::for_behavior(cfg.run_behavior);
    tools::ensure_tools(cfg, needs)?;
    activate::activate(cfg, services.runner, services.probe)?;
    Ok(())
}

fn launch(
    cfg: &RuntimeConfig,
    program: PathBuf,
    args: Vec<OsString>,
    services: &Services,
    current_dir: Option<PathBuf>,
) -> Result<Launch> {
    let env = Environment::compose(cfg, services.lookup);
    let cwd = match &current_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("reading the current directory")?,
    };
    let program = resolve_program(&program, &env, &cwd)?;
    Ok(Launch {
        program,
        args,
        env,
        current_dir,
    })
}

/// Paths are taken relative to `cwd`, the child's working directory; bare
/// names are looked up on the composed `PATH`.
fn resolve_program(program: &Path, env: &Environment, cwd: &Path) -> Result<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        let candidate = cwd.join(program);
        if !candidate.is_file() {
            anyhow::bail!("unable to find '{}'", program.display());
        }
        return Ok(candidate);
    }
    let path = env.get("PATH").unwrap_or_default();
    which::which_in(program, Some(path), cwd)
        .with_context(|| format!("unable to find '{}' on the bundle PATH", program.display()))
}

fn emit_asset(path: &Path, what: &str, out: &mut dyn Write) -> Result<Outcome> {
    if !path.is_file() {
        return Err(BundleError::AssetNotFound(what.to_string()).into());
    }
    let bytes = fs::read(path).with_context(|| format!("reading '{}'", path.display()))?;
    // No trailing newline: consumers decode stdout verbatim.
    write!(out, "{}", STANDARD.encode(bytes))?;
    out.flush()?;
    Ok(Outcome::Done)
}

fn emit_found(found: Option<PathBuf>, what: &str, out: &mut dyn Write) -> Result<Outcome> {
    match found {
        Some(path) => emit_asset(&path, what, out),
        None => Err(BundleError::AssetNotFound(what.to_string()).into()),
    }
}

/// First file, by name, directly inside `dir` with the given extension.
fn first_top_level(dir: &Path, extension: &str) -> Result<Option<PathBuf>> {
    let mut matches = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading '{}'", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == extension) {
            matches.push(path);
        }
    }
    matches.sort();
    Ok(matches.into_iter().next())
}

fn create_portable(cfg: &RuntimeConfig, suffix: &str) -> Result<Outcome> {
    let dir = cfg.portable_dir(suffix);
    fs::create_dir_all(&dir)
        .with_context(|| format!("creating portable directory '{}'", dir.display()))?;
    tracing::info!("created '{}'", dir.display());
    Ok(Outcome::Done)
}

fn extract_into(
    cfg: &mut RuntimeConfig,
    services: &Services,
    target: &Path,
    patterns: &[OsString],
    out: &mut dyn Write,
) -> Result<Outcome> {
    let patterns: Vec<String> = patterns
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    cfg.ensure_work_dir()?;
    tools::ensure_tools(cfg, ToolNeeds::Extract)?;
    activate::extract(cfg, services.runner, target, &patterns)?;
    writeln!(out, "./{}", target.display())?;
    Ok(Outcome::Done)
}

fn write_help(cfg: &RuntimeConfig, out: &mut dyn Write) -> Result<()> {
    let trailer = &cfg.trailer;
    writeln!(
        out,
        "This bundle was generated by PELF {}, on a machine with the following \"uname -mrsp(v)\":\n {}\n",
        trailer.pelf_version, trailer.pelf_host
    )?;
    writeln!(out, "  Internal variables:")?;
    writeln!(out, "  bundle id: {}", cfg.bundle_id)?;
    writeln!(out, "  sanitized id: {}", cfg.sanitized_id)?;
    writeln!(out, "  mount dir: {}", cfg.mount_dir.display())?;
    writeln!(out, "  work dir: {}", cfg.work_dir.display())?;
    writeln!(out, "  filesystem: {}", cfg.fs_kind())?;
    writeln!(out, "  image offset: {}", trailer.image_offset)?;
    if let Some(update_info) = &trailer.update_info {
        writeln!(out, "  update info: {update_info}")?;
    }
    if let Some(signature) = &trailer.signature {
        writeln!(out, "  signature: {signature}")?;
    }
    let extract_dir = default_extract_dir(&cfg.sanitized_id, cfg.fs_kind());
    write!(
        out,
        "
  Flags:
  --pbundle_help: Show this text
  --pbundle_list: List the contents of the work directory, helper tools included
  --pbundle_link <cmd> [args]: Run <cmd> with the bundle's environment, including its $PATH
                               example: --pbundle_link sh -c \"ls $SELF_TEMPDIR\"
  --pbundle_pngIcon: Print the base64 encoded .DirIcon; exits 1 if there is none
  --pbundle_svgIcon: Print the base64 encoded .DirIcon.svg; exits 1 if there is none
  --pbundle_desktop: Print the first top-level .desktop file, base64 encoded
  --pbundle_appstream: Print the first top-level .xml file, base64 encoded
  --pbundle_portableHome: Create a directory next to the bundle used as $HOME on later runs
  --pbundle_portableConfig: Create a directory next to the bundle used as $XDG_CONFIG_HOME on later runs
  --pbundle_extract [globs]: Extract the filesystem (or the matching paths) to ./{extract_dir}
  --pbundle_extract_and_run [args]: Extract instead of mounting, then run
  --pbundle_mount [dir]: Mount the filesystem on [dir] or the default mount directory and wait
  --pbundle_offset: Print the offset of the filesystem image
  --pbundle_cleanup: Unmount and remove this bundle's work directory

  Compatibility flags:
  --appimage-extract: Same as --pbundle_extract, into ./{APPIMAGE_EXTRACT_DIR}
  --appimage-extract-and-run: Same as --pbundle_extract_and_run
  --appimage-mount: Same as --pbundle_mount
  --appimage-offset: Same as --pbundle_offset
",
        extract_dir = extract_dir.display(),
    )?;
    Ok(())
}
