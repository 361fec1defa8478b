//! Helper tool resolution and provisioning.
//!
//! Mounting, extracting and unmounting all shell out to FUSE helpers. Host
//! copies are used when present on the search path; otherwise the bundle's
//! embedded copies are unpacked into the work directory and put first.

pub mod static_tools;

use anyhow::{bail, Context, Result};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{RunBehavior, RuntimeConfig};
use crate::error::BundleError;
use crate::filesystem::FsKind;

/// Unmount helpers, in order of preference.
pub const UNMOUNT_TOOLS: &[&str] = &["fusermount3", "fusermount"];

/// Locate `name` on `search_path`.
pub fn find_tool(name: &str, search_path: &OsStr) -> Option<PathBuf> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    which::which_in(name, Some(search_path), cwd).ok()
}

/// Locate `name` on the configured search path, or fail naming the tool.
pub fn resolve_tool(name: &str, search_path: &OsStr) -> Result<PathBuf> {
    find_tool(name, search_path)
        .with_context(|| format!("helper tool '{name}' not found on search path"))
}

/// First available unmount helper.
pub fn resolve_unmount_tool(search_path: &OsStr) -> Result<PathBuf> {
    UNMOUNT_TOOLS
        .iter()
        .find_map(|name| find_tool(name, search_path))
        .with_context(|| format!("none of {} found on search path", UNMOUNT_TOOLS.join(", ")))
}

/// Helper roles an operation relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolNeeds {
    /// Mount and later unmount.
    Mount,
    /// Extract only.
    Extract,
    /// Mount, with extraction as a fallback.
    MountOrExtract,
}

impl ToolNeeds {
    /// Roles used by activation under `behavior`.
    pub fn for_behavior(behavior: RunBehavior) -> Self {
        match behavior {
            RunBehavior::FuseOnly => Self::Mount,
            RunBehavior::ExtractOnly => Self::Extract,
            RunBehavior::FuseWithFallback | RunBehavior::FuseWithSizeGatedFallback => {
                Self::MountOrExtract
            }
        }
    }

    fn mounts(self) -> bool {
        matches!(self, Self::Mount | Self::MountOrExtract)
    }

    fn extracts(self) -> bool {
        matches!(self, Self::Extract | Self::MountOrExtract)
    }
}

/// Tools `kind` needs for `needs` that cannot be found on `search_path`.
///
/// Either unmount helper satisfies the unmount role.
pub fn missing_tools(kind: FsKind, needs: ToolNeeds, search_path: &OsStr) -> Vec<&'static str> {
    let [mount, extract, unmount] = kind.required_tools();
    [
        (mount, needs.mounts()),
        (extract, needs.extracts()),
        (unmount, needs.mounts()),
    ]
    .into_iter()
    .filter(|(_, wanted)| *wanted)
    .map(|(tool, _)| tool)
    .filter(|tool| !available(tool, search_path))
    .collect()
}

fn available(tool: &str, search_path: &OsStr) -> bool {
    if UNMOUNT_TOOLS.contains(&tool) {
        UNMOUNT_TOOLS
            .iter()
            .any(|name| find_tool(name, search_path).is_some())
    } else {
        find_tool(tool, search_path).is_some()
    }
}

/// Make the helper tools `needs` calls for resolvable.
///
/// An existing tools directory is put first on the search path and reused
/// when it covers everything; otherwise the embedded copies are unpacked
/// (again) from the bundle. Tools still missing after that are a
/// [`BundleError::ToolExtractionFailed`].
pub fn ensure_tools(cfg: &mut RuntimeConfig, needs: ToolNeeds) -> Result<()> {
    let dir = cfg.static_tools_dir.clone();
    let kind = cfg.fs_kind();

    let mut prepended = false;
    if has_entries(&dir) {
        cfg.prepend_search_path(&dir);
        prepended = true;
    }

    let missing = missing_tools(kind, needs, &cfg.search_path);
    if missing.is_empty() {
        tracing::debug!("{kind} helper tools resolved");
        return Ok(());
    }
    tracing::info!(
        "helper tools missing ({}), unpacking embedded copies",
        missing.join(", ")
    );
    static_tools::provision(&cfg.self_path, &cfg.trailer, &dir)?;
    if !prepended {
        cfg.prepend_search_path(&dir);
    }

    let missing = missing_tools(kind, needs, &cfg.search_path);
    if !missing.is_empty() {
        bail!(BundleError::ToolExtractionFailed(format!(
            "embedded helper tools lack {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

fn has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::static_tools::testing::tools_blob;
    use super::*;
    use crate::config::testing::config_in;
    use crate::trailer::testing::bundle_bytes;
    use crate::trailer::Trailer;
    use std::ffi::OsString;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn fake_tool(dir: &Path, name: &str) {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_find_tool() {
        let temp = TempDir::new().unwrap();
        fake_tool(temp.path(), "dwarfs");

        let path = temp.path().as_os_str();
        assert_eq!(find_tool("dwarfs", path), Some(temp.path().join("dwarfs")));
        assert!(find_tool("squashfuse", path).is_none());
        assert!(resolve_tool("squashfuse", path).is_err());
    }

    #[test]
    fn test_missing_tools_accepts_either_unmount_helper() {
        let temp = TempDir::new().unwrap();
        fake_tool(temp.path(), "squashfuse");
        fake_tool(temp.path(), "unsquashfs");
        let path = temp.path().as_os_str();

        assert_eq!(
            missing_tools(FsKind::Squashfs, ToolNeeds::MountOrExtract, path),
            vec!["fusermount"]
        );

        fake_tool(temp.path(), "fusermount3");
        assert!(missing_tools(FsKind::Squashfs, ToolNeeds::MountOrExtract, path).is_empty());
        assert_eq!(
            resolve_unmount_tool(path).unwrap(),
            temp.path().join("fusermount3")
        );
    }

    #[test]
    fn test_missing_tools_by_role() {
        let temp = TempDir::new().unwrap();
        fake_tool(temp.path(), "unsquashfs");
        let path = temp.path().as_os_str();

        assert!(missing_tools(FsKind::Squashfs, ToolNeeds::Extract, path).is_empty());
        assert_eq!(
            missing_tools(FsKind::Squashfs, ToolNeeds::Mount, path),
            vec!["squashfuse", "fusermount"]
        );
        assert_eq!(
            ToolNeeds::for_behavior(RunBehavior::ExtractOnly),
            ToolNeeds::Extract
        );
        assert_eq!(
            ToolNeeds::for_behavior(RunBehavior::FuseWithSizeGatedFallback),
            ToolNeeds::MountOrExtract
        );
    }

    fn bundle_with_tools(dir: &Path, tools: &[&str]) -> PathBuf {
        let files: Vec<(&str, &str)> = tools.iter().map(|t| (*t, "#!/bin/sh\n")).collect();
        let bundle = dir.join("nano.AppBundle");
        fs::write(&bundle, bundle_bytes(&tools_blob(&files), "dwarfs", b"IMAGE")).unwrap();
        bundle
    }

    fn config_with_path(temp: &TempDir, bundle: &Path, path: &Path) -> RuntimeConfig {
        let mut cfg = config_in(temp.path(), bundle, &[("PATH", path.to_str().unwrap())]);
        cfg.trailer = Trailer::locate(bundle).unwrap();
        cfg
    }

    #[test]
    fn test_ensure_tools_provisions_once_and_prepends() {
        let temp = TempDir::new().unwrap();
        let bundle = bundle_with_tools(temp.path(), &["dwarfs", "dwarfsextract", "fusermount3"]);
        let empty_path = temp.path().join("empty-bin");
        fs::create_dir(&empty_path).unwrap();
        let mut cfg = config_with_path(&temp, &bundle, &empty_path);

        ensure_tools(&mut cfg, ToolNeeds::MountOrExtract).unwrap();
        assert!(cfg.static_tools_dir.join("dwarfsextract").is_file());
        assert!(missing_tools(FsKind::Dwarfs, ToolNeeds::MountOrExtract, &cfg.search_path).is_empty());

        let mut expected = cfg.static_tools_dir.clone().into_os_string();
        expected.push(":");
        expected.push(&empty_path);
        assert_eq!(cfg.search_path, expected);

        // A second activation in the same work directory reuses the copies.
        fs::remove_file(&bundle).unwrap();
        let mut again = cfg.clone();
        again.search_path = OsString::from(&empty_path);
        ensure_tools(&mut again, ToolNeeds::MountOrExtract).unwrap();
        assert_eq!(again.search_path, expected);
    }

    #[test]
    fn test_incomplete_tools_dir_is_reprovisioned() {
        let temp = TempDir::new().unwrap();
        let bundle = bundle_with_tools(temp.path(), &["dwarfs", "dwarfsextract", "fusermount3"]);
        let empty_path = temp.path().join("empty-bin");
        fs::create_dir(&empty_path).unwrap();
        let mut cfg = config_with_path(&temp, &bundle, &empty_path);

        // Left behind by an interrupted unpack: one truncated, non-executable file.
        fs::create_dir_all(&cfg.static_tools_dir).unwrap();
        fs::write(cfg.static_tools_dir.join("dwarfs"), b"#!/bi").unwrap();

        ensure_tools(&mut cfg, ToolNeeds::MountOrExtract).unwrap();
        assert!(missing_tools(FsKind::Dwarfs, ToolNeeds::MountOrExtract, &cfg.search_path).is_empty());
        assert_eq!(
            fs::read_to_string(cfg.static_tools_dir.join("dwarfs")).unwrap(),
            "#!/bin/sh\n"
        );
        let dirs = cfg.search_path.to_string_lossy().into_owned();
        assert_eq!(dirs.matches(cfg.static_tools_dir.to_str().unwrap()).count(), 1);
    }

    #[test]
    fn test_archive_without_required_tool_fails() {
        let temp = TempDir::new().unwrap();
        let bundle = bundle_with_tools(temp.path(), &["dwarfs", "fusermount3"]);
        let empty_path = temp.path().join("empty-bin");
        fs::create_dir(&empty_path).unwrap();
        let mut cfg = config_with_path(&temp, &bundle, &empty_path);

        let err = ensure_tools(&mut cfg, ToolNeeds::MountOrExtract).unwrap_err();
        match crate::error::classify(&err) {
            Some(BundleError::ToolExtractionFailed(msg)) => assert!(msg.contains("dwarfsextract")),
            other => panic!("unexpected error class: {other:?}"),
        }
    }

    #[test]
    fn test_ensure_tools_skips_provisioning_with_host_tools() {
        let temp = TempDir::new().unwrap();
        let host = temp.path().join("host-bin");
        fs::create_dir(&host).unwrap();
        for tool in ["dwarfs", "dwarfsextract", "fusermount"] {
            fake_tool(&host, tool);
        }
        let mut cfg = config_in(
            temp.path(),
            Path::new("/nonexistent/bundle"),
            &[("PATH", host.to_str().unwrap())],
        );

        ensure_tools(&mut cfg, ToolNeeds::MountOrExtract).unwrap();
        assert_eq!(cfg.search_path.as_os_str(), host.as_os_str());
        assert!(!cfg.static_tools_dir.exists());
    }

    #[test]
    fn test_extraction_needs_only_the_extractor() {
        let temp = TempDir::new().unwrap();
        let host = temp.path().join("host-bin");
        fs::create_dir(&host).unwrap();
        fake_tool(&host, "dwarfsextract");
        let mut cfg = config_in(
            temp.path(),
            Path::new("/nonexistent/bundle"),
            &[("PATH", host.to_str().unwrap())],
        );

        ensure_tools(&mut cfg, ToolNeeds::Extract).unwrap();
        assert!(!cfg.static_tools_dir.exists());
        assert!(ensure_tools(&mut cfg, ToolNeeds::Mount).is_err());
    }
}
