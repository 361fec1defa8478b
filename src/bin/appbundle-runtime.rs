use std::ffi::OsString;
use std::io;

use anyhow::{Context, Result};
use appbundle_runtime::config::{resolve_self_path, RuntimeConfig};
use appbundle_runtime::dispatch::{Services, INTERNAL_CLEANUP_FLAG};
use appbundle_runtime::lifecycle::{self, reclaim_on_host, CleanupGuard, DeviceProbe, ReclaimPlan};
use appbundle_runtime::process::HostRunner;
use appbundle_runtime::trailer::Trailer;
use appbundle_runtime::{logging, session};

fn usage() -> String {
    format!("Usage:\n  <bundle> {INTERNAL_CLEANUP_FLAG} <mountDir> <poolDir> <workDir>")
}

fn main() {
    let argv: Vec<OsString> = std::env::args_os().collect();
    logging::init();

    let code = if argv.get(1).is_some_and(|arg| arg == INTERNAL_CLEANUP_FLAG) {
        internal_cleanup(&argv[2..])
    } else {
        run(&argv)
    };
    std::process::exit(code);
}

/// Body of the detached cleanup helper.
fn internal_cleanup(args: &[OsString]) -> i32 {
    let args: Vec<String> = args
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    let Some(plan) = ReclaimPlan::from_args(&args) else {
        eprintln!("{}", usage());
        return 1;
    };
    let report = reclaim_on_host(&plan);
    tracing::debug!(?report, "reclaimed '{}'", plan.work_dir.display());
    0
}

fn run(argv: &[OsString]) -> i32 {
    let argv0 = argv
        .first()
        .map(|arg| arg.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut cfg = match load_config(&argv0) {
        Ok(cfg) => cfg,
        Err(err) => {
            session::report(&err);
            return 1;
        }
    };

    let guard = CleanupGuard::new(&cfg);
    if let Err(err) = lifecycle::install_signal_handlers(guard.clone()) {
        tracing::warn!("{err:#}");
    }

    let runner = HostRunner;
    let probe = DeviceProbe;
    let lookup = |key: &str| std::env::var(key).ok();
    let services = Services {
        runner: &runner,
        probe: &probe,
        lookup: &lookup,
    };
    let args = argv.get(1..).unwrap_or_default();
    session::run(&mut cfg, args, &services, &guard, &mut io::stdout())
}

fn load_config(argv0: &str) -> Result<RuntimeConfig> {
    let self_path = resolve_self_path(argv0)?;
    let trailer = Trailer::locate(&self_path)
        .with_context(|| format!("reading bundle trailer of '{}'", self_path.display()))?;
    RuntimeConfig::from_env(self_path, argv0, trailer)
}
