//! One runtime invocation, from dispatch to exit status.
//!
//! Every path out of [`run`] (serviced flag, entrypoint exit, fatal error,
//! recovered panic) fires the cleanup guard exactly once before the status
//! is returned.

use anyhow::Result;
use std::ffi::OsString;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};

use crate::config::RuntimeConfig;
use crate::dispatch::{dispatch, Outcome, Services};
use crate::error::classify;
use crate::lifecycle::CleanupGuard;

/// Service `args` and return the process exit status.
pub fn run(
    cfg: &mut RuntimeConfig,
    args: &[OsString],
    services: &Services,
    guard: &CleanupGuard,
    out: &mut dyn Write,
) -> i32 {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        execute(cfg, args, services, guard, out)
    }));
    let code = match result {
        Ok(Ok(code)) => code,
        Ok(Err(err)) => {
            report(&err);
            1
        }
        Err(_) => {
            tracing::error!("runtime fault, cleaning up");
            1
        }
    };

    guard.fire();
    code
}

fn execute(
    cfg: &mut RuntimeConfig,
    args: &[OsString],
    services: &Services,
    guard: &CleanupGuard,
    out: &mut dyn Write,
) -> Result<i32> {
    let outcome = dispatch(cfg, args, services, out);
    out.flush()?;
    // Dispatch may have moved the mount point or unpacked helper tools.
    guard.update(cfg);

    match outcome? {
        Outcome::Done => Ok(0),
        Outcome::Hold(dir) => {
            tracing::info!("holding mount at '{}' until signalled", dir.display());
            loop {
                std::thread::park();
            }
        }
        Outcome::Launch(launch) => launch.run(),
    }
}

/// Print a fatal error to the log.
pub fn report(err: &anyhow::Error) {
    match classify(err) {
        Some(class) if class.is_asset_not_found() => tracing::error!("{class}"),
        _ => tracing::error!("{err:#}"),
    }
}
