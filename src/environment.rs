//! Environment handed to the entrypoint.
//!
//! Composition is a pure function of the configuration and a view of the
//! inherited environment. The result is applied to the child `Command`; the
//! runtime's own environment is never modified.

use std::path::Path;
use std::process::Command;

use crate::config::RuntimeConfig;

/// Binary directories inside the mount directory, in search order.
pub const BIN_SUBDIRS: &[&str] = &["bin", "usr/bin", "shared/bin"];

/// Library directories inside the mount directory, in search order.
pub const LIB_SUBDIRS: &[&str] = &[
    "lib",
    "usr/lib",
    "shared/lib",
    "lib64",
    "usr/lib64",
    "lib32",
    "usr/lib32",
    "libx32",
    "usr/libx32",
];

/// Ordered set of variables to export to the child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: Vec<(String, String)>,
}

impl Environment {
    /// Compose the child environment for `cfg`.
    ///
    /// `lookup` reads the inherited environment. `PATH` is taken from
    /// `cfg.search_path` so provisioned helper tools stay reachable.
    pub fn compose(cfg: &RuntimeConfig, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut env = Self::default();
        let rid = &cfg.sanitized_id;
        let mount_dir = cfg.mount_dir.to_string_lossy().into_owned();
        let bin_dirs = join_dirs(&cfg.mount_dir, BIN_SUBDIRS);
        let lib_dirs = join_dirs(&cfg.mount_dir, LIB_SUBDIRS);

        env.set(format!("{rid}_binDir"), bin_dirs.clone());
        env.set(format!("{rid}_libDir"), lib_dirs.clone());
        env.set(format!("{rid}_mountDir"), mount_dir.clone());

        let current_path = cfg.search_path.to_string_lossy().into_owned();
        env.set(
            "PATH",
            merge_search_path("PATH", Some(current_path), &bin_dirs, &lookup),
        );
        if lookup("PELF_LD_VAR").as_deref() == Some("1") {
            let current = lookup("LD_LIBRARY_PATH");
            env.set(
                "LD_LIBRARY_PATH",
                merge_search_path("LD_LIBRARY_PATH", current, &lib_dirs, &lookup),
            );
        }

        env.redirect_to_portable(cfg, ".home", "HOME", "OLD_HOME", &lookup);
        env.redirect_to_portable(
            cfg,
            ".config",
            "XDG_CONFIG_HOME",
            "OLD_XDG_CONFIG_HOME",
            &lookup,
        );

        env.set("SELF_TEMPDIR", mount_dir);
        env.set("SELF", cfg.self_path.to_string_lossy().into_owned());
        env.set("ARGV0", cfg.argv0.clone());
        env
    }

    /// Point `var` at the sibling `<bundle><suffix>` directory when it exists,
    /// keeping the previous value under `saved` unless one is already saved.
    fn redirect_to_portable(
        &mut self,
        cfg: &RuntimeConfig,
        suffix: &str,
        var: &str,
        saved: &str,
        lookup: &impl Fn(&str) -> Option<String>,
    ) {
        let dir = cfg.portable_dir(suffix);
        if !dir.is_dir() {
            return;
        }
        if lookup(saved).map_or(true, |v| v.is_empty()) {
            self.set(saved, lookup(var).unwrap_or_default());
        }
        tracing::debug!("using portable {var} '{}'", dir.display());
        self.set(var, dir.to_string_lossy().into_owned());
    }

    fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.vars.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Export every variable to `cmd`.
    pub fn apply(&self, cmd: &mut Command) {
        cmd.envs(self.vars.iter().map(|(k, v)| (k, v)));
    }
}

/// `subdirs` under `root`, colon-joined.
pub fn join_dirs(root: &Path, subdirs: &[&str]) -> String {
    subdirs
        .iter()
        .map(|sub| root.join(sub).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// Merge `dirs` into the current value of a search-path variable.
///
/// Existing entries come first unless `PBUNDLE_OVERTAKE_<var>=1`, in which
/// case `dirs` is prepended. An empty current value yields `dirs` alone.
pub fn merge_search_path(
    var: &str,
    current: Option<String>,
    dirs: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> String {
    let current = current.unwrap_or_default();
    if current.is_empty() {
        return dirs.to_string();
    }
    if lookup(&format!("PBUNDLE_OVERTAKE_{var}")).as_deref() == Some("1") {
        format!("{dirs}:{current}")
    } else {
        format!("{current}:{dirs}")
    }
}
