//! Runtime configuration for one invocation.
//!
//! Built once at startup from the trailer and environment, then passed by
//! reference to every component. Nothing here is global.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::BundleError;
use crate::filesystem::{FsKind, Tuning};
use crate::trailer::{Trailer, ID_KEY};

/// Name of the shared pool directory under the temp dir.
pub const POOL_DIR_NAME: &str = ".pelfbundles";

/// Name of the mount subdirectory of a work directory.
pub const MOUNT_DIR_NAME: &str = "mounted";

/// Name of the helper-tools subdirectory of a work directory.
pub const STATIC_TOOLS_DIR_NAME: &str = "static";

/// Entrypoint executed inside the mount directory.
pub const ENTRYPOINT_NAME: &str = "AppRun";

/// Bundles at or below this size may fall back to extraction under
/// [`RunBehavior::FuseWithSizeGatedFallback`].
pub const MAX_EXTRACT_SELF_SIZE: u64 = 350 * 1024 * 1024;

/// Number of trailing bundle bytes hashed for a fixed work directory.
const FIXED_WORKDIR_TAIL: u64 = 256;

/// How the image is made available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunBehavior {
    /// Mount with FUSE; fail if that does not work.
    FuseOnly,
    /// Always extract into the work directory.
    ExtractOnly,
    /// Mount with FUSE, extract if mounting fails.
    FuseWithFallback,
    /// Mount with FUSE, extract if mounting fails and the bundle is small enough.
    FuseWithSizeGatedFallback,
}

impl RunBehavior {
    /// Parse the numeric policy code (0-3).
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "0" => Some(Self::FuseOnly),
            "1" => Some(Self::ExtractOnly),
            "2" => Some(Self::FuseWithFallback),
            "3" => Some(Self::FuseWithSizeGatedFallback),
            _ => None,
        }
    }

    /// Policy selected by the environment seen through `lookup`.
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Self {
        let forced_extract = ["PBUNDLE_EXTRACT_AND_RUN", "APPIMAGE_EXTRACT_AND_RUN"]
            .iter()
            .any(|key| lookup(key).as_deref() == Some("1"));
        if forced_extract {
            return Self::ExtractOnly;
        }
        match lookup("PBUNDLE_RUN_BEHAVIOR") {
            Some(code) => Self::from_code(&code).unwrap_or_else(|| {
                tracing::warn!("ignoring invalid PBUNDLE_RUN_BEHAVIOR '{code}'");
                Self::default()
            }),
            None => Self::default(),
        }
    }
}

impl Default for RunBehavior {
    fn default() -> Self {
        Self::FuseWithSizeGatedFallback
    }
}

/// The single configuration value of one runtime invocation.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub bundle_id: String,
    /// `bundle_id` restricted to `[A-Za-z0-9_]`; used in names and variables.
    pub sanitized_id: String,
    pub pool_dir: PathBuf,
    pub work_dir: PathBuf,
    pub mount_dir: PathBuf,
    pub entrypoint: PathBuf,
    /// Absolute path of the running bundle.
    pub self_path: PathBuf,
    /// basename of argv[0] as invoked.
    pub argv0: String,
    pub static_tools_dir: PathBuf,
    pub trailer: Trailer,
    pub run_behavior: RunBehavior,
    pub tuning: Tuning,
    pub uid: u32,
    pub gid: u32,
    /// Search path used to resolve helper tools and handed to children.
    pub search_path: OsString,
    /// Launches sharing a fixed work directory never clean it up.
    pub no_cleanup: bool,
}

impl RuntimeConfig {
    /// Build the configuration for the bundle at `self_path` from the
    /// process environment.
    pub fn from_env(self_path: PathBuf, argv0: &str, trailer: Trailer) -> Result<Self> {
        let pool_dir = std::env::temp_dir().join(POOL_DIR_NAME);
        Self::build(
            self_path,
            argv0,
            trailer,
            pool_dir,
            std::process::id(),
            |key| std::env::var(key).ok(),
        )
    }

    /// Build the configuration with an explicit environment view.
    pub fn build(
        self_path: PathBuf,
        argv0: &str,
        trailer: Trailer,
        pool_dir: PathBuf,
        pid: u32,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let Some(bundle_id) = lookup("EXE_NAME")
            .filter(|id| !id.trim().is_empty())
            .or_else(|| trailer.bundle_id.clone())
        else {
            bail!(BundleError::MissingMetadata { field: ID_KEY });
        };
        let sanitized_id = sanitize_id(&bundle_id);

        let fixed_work_dir = trailer.disable_random_work_dir
            || lookup("PBUNDLE_DISABLE_RANDOM_WORKDIR").as_deref() == Some("1");

        let work_dir = match lookup(&format!("{sanitized_id}_workDir")).filter(|d| !d.is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None if fixed_work_dir => {
                let tail = tail_digest(&self_path)?;
                pool_dir.join(format!("pbundle_{sanitized_id}_{tail}"))
            }
            None => pool_dir.join(format!("pbundle_{sanitized_id}_{pid}")),
        };
        let mount_dir = work_dir.join(MOUNT_DIR_NAME);

        Ok(Self {
            entrypoint: mount_dir.join(ENTRYPOINT_NAME),
            static_tools_dir: work_dir.join(STATIC_TOOLS_DIR_NAME),
            argv0: basename(argv0),
            run_behavior: RunBehavior::from_lookup(&lookup),
            tuning: Tuning::from_lookup(&lookup),
            uid: current_uid(),
            gid: current_gid(),
            search_path: lookup("PATH").map(OsString::from).unwrap_or_default(),
            no_cleanup: fixed_work_dir || lookup("PBUNDLE_NO_CLEANUP").as_deref() == Some("1"),
            bundle_id,
            sanitized_id,
            pool_dir,
            work_dir,
            mount_dir,
            self_path,
            trailer,
        })
    }

    pub fn fs_kind(&self) -> FsKind {
        self.trailer.fs_kind
    }

    /// Path of the activation log written after a successful activation.
    pub fn activation_log(&self) -> PathBuf {
        self.work_dir.join(format!(".{}.log", self.fs_kind()))
    }

    /// Sibling portable directory: `<bundle path><suffix>`.
    pub fn portable_dir(&self, suffix: &str) -> PathBuf {
        let mut path = self.self_path.clone().into_os_string();
        path.push(suffix);
        PathBuf::from(path)
    }

    /// Create the work directory (and the pool it lives in).
    pub fn ensure_work_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.work_dir)
            .with_context(|| format!("creating work directory '{}'", self.work_dir.display()))
    }

    /// Prepend `dir` to the helper-tool search path.
    pub fn prepend_search_path(&mut self, dir: &Path) {
        let mut joined = dir.as_os_str().to_os_string();
        if !self.search_path.is_empty() {
            joined.push(":");
            joined.push(&self.search_path);
        }
        self.search_path = joined;
    }
}

/// Keep ASCII letters, digits and underscores only.
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Resolve the path of the running bundle from argv[0], falling back to
/// `/proc/self/exe`.
pub fn resolve_self_path(argv0: &str) -> Result<PathBuf> {
    if argv0.contains('/') {
        if let Ok(path) = fs::canonicalize(argv0) {
            return Ok(path);
        }
    }
    std::env::current_exe().context("resolving path of the running bundle")
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Hex of the first 8 bytes of SHA-256 over the bundle's last 256 bytes.
fn tail_digest(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("opening bundle '{}'", path.display()))?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(FIXED_WORKDIR_TAIL)))?;
    let mut tail = Vec::with_capacity(FIXED_WORKDIR_TAIL as usize);
    file.read_to_end(&mut tail)
        .with_context(|| format!("reading tail of '{}'", path.display()))?;

    let digest = Sha256::digest(&tail);
    Ok(digest[..8].iter().map(|b| format!("{b:02x}")).collect())
}

fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

fn current_gid() -> u32 {
    // SAFETY: getgid has no preconditions and cannot fail.
    unsafe { libc::getgid() }
}


#[cfg(test)]
mod tests {
    use super::testing::{config_in, trailer};
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_id() {
        assert_eq!(sanitize_id("nano-01_01_2025-tester"), "nano01_01_2025tester");
        assert_eq!(sanitize_id("a.b c/d"), "abcd");
    }

    #[test]
    fn test_work_dir_from_sanitized_id_and_pid() {
        let temp = TempDir::new().unwrap();
        let cfg = config_in(temp.path(), Path::new("/opt/apps/nano"), &[]);

        assert_eq!(cfg.sanitized_id, "nano01_01_2025tester");
        assert_eq!(cfg.work_dir, temp.path().join("pbundle_nano01_01_2025tester_4242"));
        assert_eq!(cfg.mount_dir, cfg.work_dir.join("mounted"));
        assert_eq!(cfg.entrypoint, cfg.mount_dir.join("AppRun"));
        assert_eq!(cfg.static_tools_dir, cfg.work_dir.join("static"));
        assert_eq!(cfg.argv0, "nano.dwfs.AppBundle");
        assert_eq!(cfg.activation_log(), cfg.work_dir.join(".dwarfs.log"));
        assert!(!cfg.no_cleanup);
    }

    #[test]
    fn test_distinct_pids_never_collide() {
        let temp = TempDir::new().unwrap();
        let build = |pid| {
            RuntimeConfig::build(
                PathBuf::from("/opt/apps/nano"),
                "nano",
                trailer(FsKind::Dwarfs),
                temp.path().to_path_buf(),
                pid,
                |_| None,
            )
            .unwrap()
        };
        assert_ne!(build(1).work_dir, build(2).work_dir);
    }

    #[test]
    fn test_work_dir_and_id_overrides() {
        let temp = TempDir::new().unwrap();
        let cfg = config_in(
            temp.path(),
            Path::new("/opt/apps/nano"),
            &[("EXE_NAME", "other.app"), ("otherapp_workDir", "/srv/fixed")],
        );
        assert_eq!(cfg.bundle_id, "other.app");
        assert_eq!(cfg.work_dir, PathBuf::from("/srv/fixed"));
        assert_eq!(cfg.mount_dir, PathBuf::from("/srv/fixed/mounted"));
    }

    #[test]
    fn test_id_from_exe_name_when_trailer_has_none() {
        let temp = TempDir::new().unwrap();
        let anonymous = Trailer {
            bundle_id: None,
            ..trailer(FsKind::Squashfs)
        };
        let build = |vars: &'static [(&'static str, &'static str)]| {
            RuntimeConfig::build(
                PathBuf::from("/opt/apps/nano"),
                "nano",
                anonymous.clone(),
                temp.path().to_path_buf(),
                7,
                move |key| {
                    vars.iter()
                        .find(|(k, _)| *k == key)
                        .map(|(_, v)| v.to_string())
                },
            )
        };

        let cfg = build(&[("EXE_NAME", "embedded-id")]).unwrap();
        assert_eq!(cfg.bundle_id, "embedded-id");
        assert_eq!(cfg.work_dir, temp.path().join("pbundle_embeddedid_7"));

        let err = build(&[]).unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(BundleError::MissingMetadata { field: ID_KEY })
        ));
    }

    #[test]
    fn test_fixed_work_dir_is_stable_and_disables_cleanup() {
        let temp = TempDir::new().unwrap();
        let bundle = temp.path().join("nano.AppBundle");
        fs::write(&bundle, vec![7u8; 1024]).unwrap();

        let a = config_in(temp.path(), &bundle, &[("PBUNDLE_DISABLE_RANDOM_WORKDIR", "1")]);
        let b = config_in(temp.path(), &bundle, &[("PBUNDLE_DISABLE_RANDOM_WORKDIR", "1")]);
        assert_eq!(a.work_dir, b.work_dir);
        assert!(a.no_cleanup);

        let name = a.work_dir.file_name().unwrap().to_string_lossy().into_owned();
        let hash = name.strip_prefix("pbundle_nano01_01_2025tester_").unwrap();
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_run_behavior_selection() {
        let none = |_: &str| None;
        assert_eq!(RunBehavior::from_lookup(&none), RunBehavior::FuseWithSizeGatedFallback);

        let code = |key: &str| (key == "PBUNDLE_RUN_BEHAVIOR").then(|| "0".to_string());
        assert_eq!(RunBehavior::from_lookup(&code), RunBehavior::FuseOnly);

        let forced = |key: &str| (key == "APPIMAGE_EXTRACT_AND_RUN").then(|| "1".to_string());
        assert_eq!(RunBehavior::from_lookup(&forced), RunBehavior::ExtractOnly);

        let bogus = |key: &str| (key == "PBUNDLE_RUN_BEHAVIOR").then(|| "9".to_string());
        assert_eq!(RunBehavior::from_lookup(&bogus), RunBehavior::default());
    }

    #[test]
    fn test_prepend_search_path_and_portable_dirs() {
        let temp = TempDir::new().unwrap();
        let mut cfg = config_in(temp.path(), Path::new("/opt/apps/nano"), &[("PATH", "/usr/bin")]);
        cfg.prepend_search_path(Path::new("/tmp/static"));
        assert_eq!(cfg.search_path, OsString::from("/tmp/static:/usr/bin"));
        assert_eq!(cfg.portable_dir(".home"), PathBuf::from("/opt/apps/nano.home"));
    }
}
