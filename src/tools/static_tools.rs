//! Unpacking the helper tools embedded in the trailer.
//!
//! The segment between the static-tools markers is base64 text (line breaks
//! allowed) of a zstd-compressed tar archive.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::BundleError;
use crate::trailer::Trailer;

/// Unpack the bundle's helper tools into `dest`.
///
/// The archive is unpacked into a sibling staging directory that replaces
/// `dest` only once complete, so an interrupted unpack never leaves a
/// half-filled `dest`. Returns the regular files written, each made
/// executable.
pub fn provision(bundle: &Path, trailer: &Trailer, dest: &Path) -> Result<Vec<PathBuf>> {
    let mut file =
        File::open(bundle).with_context(|| format!("opening bundle '{}'", bundle.display()))?;
    let encoded = trailer.read_static_tools(&mut file)?;
    let archive = decode(&encoded)?;

    let staging = staging_dir(dest);
    if staging.exists() {
        fs::remove_dir_all(&staging)
            .with_context(|| format!("removing stale '{}'", staging.display()))?;
    }
    fs::create_dir_all(&staging)
        .with_context(|| format!("creating helper tools directory '{}'", staging.display()))?;
    let unpacked = match unpack(&archive, &staging) {
        Ok(unpacked) => unpacked,
        Err(err) => {
            let _ = fs::remove_dir_all(&staging);
            return Err(err);
        }
    };

    if dest.exists() {
        fs::remove_dir_all(dest)
            .with_context(|| format!("removing incomplete '{}'", dest.display()))?;
    }
    if let Err(err) = fs::rename(&staging, dest) {
        // A concurrent launch sharing the work directory got there first.
        let _ = fs::remove_dir_all(&staging);
        if !dest.is_dir() {
            return Err(err).with_context(|| format!("installing '{}'", dest.display()));
        }
    }

    let written: Vec<PathBuf> = unpacked.iter().map(|rel| dest.join(rel)).collect();
    tracing::debug!(
        count = written.len(),
        "unpacked helper tools into {}",
        dest.display()
    );
    Ok(written)
}

fn staging_dir(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{name}.{}.partial", std::process::id()))
}

/// Base64 to compressed archive bytes, ignoring any whitespace.
fn decode(encoded: &[u8]) -> Result<Vec<u8>> {
    let compact: Vec<u8> = encoded
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if compact.is_empty() {
        return Err(BundleError::ToolExtractionFailed("helper tools segment is empty".into()).into());
    }
    STANDARD
        .decode(&compact)
        .map_err(|e| BundleError::ToolExtractionFailed(format!("invalid base64: {e}")).into())
}

/// Unpack into `dest`, returning the regular files as paths relative to it.
fn unpack(compressed: &[u8], dest: &Path) -> Result<Vec<PathBuf>> {
    let decoder = zstd::stream::Decoder::new(compressed)
        .map_err(|e| BundleError::ToolExtractionFailed(format!("invalid zstd stream: {e}")))?;
    let mut archive = tar::Archive::new(decoder);
    let entries = archive
        .entries()
        .map_err(|e| BundleError::ToolExtractionFailed(format!("invalid tar archive: {e}")))?;

    let mut written = Vec::new();
    for entry in entries {
        let mut entry =
            entry.map_err(|e| BundleError::ToolExtractionFailed(format!("reading tar entry: {e}")))?;
        let rel = entry
            .path()
            .map_err(|e| BundleError::ToolExtractionFailed(format!("bad tar path: {e}")))?
            .into_owned();
        let is_file = entry.header().entry_type().is_file();

        let unpacked = entry.unpack_in(dest).map_err(|e| {
            BundleError::ToolExtractionFailed(format!("unpacking {}: {e}", rel.display()))
        })?;
        // unpack_in refuses paths escaping dest
        if !unpacked {
            continue;
        }
        if is_file {
            make_executable(&dest.join(&rel))?;
            written.push(rel);
        }
    }
    Ok(written)
}

fn make_executable(path: &Path) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o111);
    fs::set_permissions(path, perms)
        .with_context(|| format!("marking '{}' executable", path.display()))
}
