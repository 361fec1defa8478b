//! Failure classes of a runtime invocation.
//!
//! Components return `anyhow::Result` and raise these through `bail!` so the
//! top-level handler can recover the class with `downcast_ref`.

use thiserror::Error;

use crate::filesystem::FsKind;

/// All classified runtime failures.
#[derive(Debug, Error)]
pub enum BundleError {
    /// One or more structural trailer markers are absent.
    #[error("trailer markers not found: {}", .missing.join(", "))]
    MissingMarker { missing: Vec<&'static str> },

    /// A required metadata line is absent or empty.
    #[error("required bundle metadata missing: {field}")]
    MissingMetadata { field: &'static str },

    /// The filesystem-type tag names a kind this runtime cannot handle.
    #[error("unsupported filesystem type '{0}' (expected 'squashfs' or 'dwarfs')")]
    UnsupportedFilesystem(String),

    /// The embedded helper tools could not be decoded or unpacked.
    #[error("failed to provision helper tools: {0}")]
    ToolExtractionFailed(String),

    /// The FUSE mount command failed. Carries the tool's combined output.
    #[error("failed to mount {fs} image: {output}")]
    MountFailed { fs: FsKind, output: String },

    /// The extraction command failed. Carries the tool's combined output.
    #[error("failed to extract {fs} image: {output}")]
    ExtractFailed { fs: FsKind, output: String },

    /// An optional asset (icon, desktop entry, AppStream metadata) is absent.
    #[error("{0} not found")]
    AssetNotFound(String),

    /// A reserved flag was given malformed arguments.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
}

impl BundleError {
    /// Whether this failure means "optional asset absent" rather than a broken bundle.
    pub fn is_asset_not_found(&self) -> bool {
        matches!(self, BundleError::AssetNotFound(_))
    }

    /// Whether the runtime may fall back to extraction after this failure.
    pub fn is_mount_failure(&self) -> bool {
        matches!(self, BundleError::MountFailed { .. })
    }
}

/// Find the classified failure inside an error chain, if any.
pub fn classify(err: &anyhow::Error) -> Option<&BundleError> {
    err.chain().find_map(|cause| cause.downcast_ref::<BundleError>())
}
