//! Supported filesystem image kinds and their command templates.
//!
//! The set of kinds is closed. Each kind maps to a [`FsProfile`] row naming the
//! external tools it needs and how to build their command lines.

pub mod tuning;

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::BundleError;
use crate::process::Cmd;

pub use tuning::Tuning;

/// Filesystem-type tag recorded in the trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsKind {
    Squashfs,
    Dwarfs,
}

/// Inputs shared by mount and extract templates.
#[derive(Debug, Clone)]
pub struct ImageRequest<'a> {
    /// The bundle file holding the image.
    pub image: &'a Path,
    /// Byte offset of the image within `image`.
    pub offset: u64,
    /// Mount point, or extraction destination.
    pub target: &'a Path,
    pub uid: u32,
    pub gid: u32,
    pub tuning: &'a Tuning,
    /// Extraction patterns; empty means everything.
    pub patterns: &'a [String],
}

/// One row of the filesystem table.
pub struct FsProfile {
    pub kind: FsKind,
    pub tag: &'static str,
    pub mount_tool: &'static str,
    pub extract_tool: &'static str,
    pub unmount_tool: &'static str,
    mount_args: fn(&ImageRequest) -> Vec<OsString>,
    extract_args: fn(&ImageRequest) -> Vec<OsString>,
}

const FILESYSTEMS: &[FsProfile] = &[
    FsProfile {
        kind: FsKind::Squashfs,
        tag: "squashfs",
        mount_tool: "squashfuse",
        extract_tool: "unsquashfs",
        unmount_tool: "fusermount",
        mount_args: squashfuse_args,
        extract_args: unsquashfs_args,
    },
    FsProfile {
        kind: FsKind::Dwarfs,
        tag: "dwarfs",
        mount_tool: "dwarfs",
        extract_tool: "dwarfsextract",
        unmount_tool: "fusermount3",
        mount_args: dwarfs_args,
        extract_args: dwarfsextract_args,
    },
];

impl FsKind {
    pub fn profile(self) -> &'static FsProfile {
        FILESYSTEMS
            .iter()
            .find(|row| row.kind == self)
            .unwrap_or(&FILESYSTEMS[0])
    }

    pub fn tag(self) -> &'static str {
        self.profile().tag
    }

    /// Every tool this kind needs to mount, extract and unmount.
    pub fn required_tools(self) -> [&'static str; 3] {
        let profile = self.profile();
        [profile.mount_tool, profile.extract_tool, profile.unmount_tool]
    }

    /// Mount command for `program` (the resolved mount tool).
    pub fn mount_command(self, program: &Path, request: &ImageRequest) -> Cmd {
        Cmd::new(program).args((self.profile().mount_args)(request))
    }

    /// Extract command for `program` (the resolved extract tool).
    pub fn extract_command(self, program: &Path, request: &ImageRequest) -> Cmd {
        Cmd::new(program).args((self.profile().extract_args)(request))
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for FsKind {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        FILESYSTEMS
            .iter()
            .find(|row| row.tag.eq_ignore_ascii_case(wanted))
            .map(|row| row.kind)
            .ok_or_else(|| BundleError::UnsupportedFilesystem(wanted.to_string()))
    }
}

fn squashfuse_args(req: &ImageRequest) -> Vec<OsString> {
    let mut args = opts([
        "ro,nodev,noatime".to_string(),
        format!("uid={},gid={}", req.uid, req.gid),
        format!("offset={}", req.offset),
    ]);
    args.push(req.image.into());
    args.push(req.target.into());
    args
}

fn dwarfs_args(req: &ImageRequest) -> Vec<OsString> {
    let debuglevel = if req.tuning.fuse_debug { "debug" } else { "error" };
    let mut args = opts([
        "ro,nodev,noatime,auto_unmount".to_string(),
        "cache_files,no_cache_image,clone_fd".to_string(),
        format!("cachesize={}", req.tuning.cachesize),
        format!("blocksize={}", req.tuning.blocksize),
        format!("readahead={}", req.tuning.readahead),
        format!("workers={}", req.tuning.workers),
        format!("offset={}", req.offset),
        format!("debuglevel={debuglevel}"),
    ]);
    args.push(req.image.into());
    args.push(req.target.into());
    args
}

fn unsquashfs_args(req: &ImageRequest) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-f".into(),
        "-d".into(),
        req.target.into(),
        "-o".into(),
        req.offset.to_string().into(),
        req.image.into(),
    ];
    args.extend(req.patterns.iter().map(OsString::from));
    args
}

fn dwarfsextract_args(req: &ImageRequest) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--input".into(),
        req.image.into(),
        "--image-offset".into(),
        req.offset.to_string().into(),
        "--output".into(),
        req.target.into(),
    ];
    for pattern in req.patterns {
        args.push("--pattern".into());
        args.push(pattern.into());
    }
    args
}

fn opts<const N: usize>(values: [String; N]) -> Vec<OsString> {
    values
        .into_iter()
        .flat_map(|value| [OsString::from("-o"), OsString::from(value)])
        .collect()
}

/// Default destination for `--pbundle_extract`: `./<rid>_<fs>`.
pub fn default_extract_dir(sanitized_id: &str, kind: FsKind) -> PathBuf {
    PathBuf::from(format!("{sanitized_id}_{kind}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(tuning: &'a Tuning, patterns: &'a [String]) -> ImageRequest<'a> {
        ImageRequest {
            image: Path::new("/opt/nano.dwfs.AppBundle"),
            offset: 4096,
            target: Path::new("/tmp/.pelfbundles/pbundle_nano_1/mounted"),
            uid: 1000,
            gid: 100,
            tuning,
            patterns,
        }
    }

    fn tuning() -> Tuning {
        Tuning {
            cachesize: "256M".into(),
            blocksize: "256K".into(),
            readahead: "32M".into(),
            workers: "2".into(),
            fuse_debug: false,
        }
    }

    #[test]
    fn test_parse_tags() {
        assert_eq!("dwarfs".parse::<FsKind>().unwrap(), FsKind::Dwarfs);
        assert_eq!(" squashfs ".parse::<FsKind>().unwrap(), FsKind::Squashfs);
        assert!(matches!(
            "erofs".parse::<FsKind>(),
            Err(BundleError::UnsupportedFilesystem(tag)) if tag == "erofs"
        ));
    }

    #[test]
    fn test_squashfuse_template() {
        let tuning = tuning();
        let cmd = FsKind::Squashfs.mount_command(Path::new("squashfuse"), &request(&tuning, &[]));
        assert_eq!(
            cmd.to_string(),
            "squashfuse -o ro,nodev,noatime -o uid=1000,gid=100 -o offset=4096 \
             /opt/nano.dwfs.AppBundle /tmp/.pelfbundles/pbundle_nano_1/mounted"
        );
    }

    #[test]
    fn test_dwarfs_template_uses_tuning() {
        let mut tuning = tuning();
        tuning.fuse_debug = true;
        let cmd = FsKind::Dwarfs.mount_command(Path::new("/usr/bin/dwarfs"), &request(&tuning, &[]));
        let line = cmd.to_string();
        assert!(line.starts_with("/usr/bin/dwarfs -o ro,nodev,noatime,auto_unmount"));
        assert!(line.contains("-o cachesize=256M"));
        assert!(line.contains("-o workers=2"));
        assert!(line.contains("-o offset=4096"));
        assert!(line.contains("-o debuglevel=debug"));
    }

    #[test]
    fn test_extract_templates_forward_patterns() {
        let tuning = tuning();
        let patterns = vec!["usr/bin/*".to_string(), "AppRun".to_string()];

        let cmd = FsKind::Dwarfs.extract_command(Path::new("dwarfsextract"), &request(&tuning, &patterns));
        assert!(cmd
            .to_string()
            .ends_with("--pattern usr/bin/* --pattern AppRun"));

        let cmd = FsKind::Squashfs.extract_command(Path::new("unsquashfs"), &request(&tuning, &patterns));
        assert_eq!(
            cmd.to_string(),
            "unsquashfs -f -d /tmp/.pelfbundles/pbundle_nano_1/mounted -o 4096 \
             /opt/nano.dwfs.AppBundle usr/bin/* AppRun"
        );
    }

    #[test]
    fn test_required_tools() {
        assert_eq!(
            FsKind::Dwarfs.required_tools(),
            ["dwarfs", "dwarfsextract", "fusermount3"]
        );
    }
}
