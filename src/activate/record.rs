use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use time::OffsetDateTime;

use crate::filesystem::FsKind;

/// How a work directory's content was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationMode {
    Mounted,
    Extracted,
}

/// Contents of the activation log written once a work directory is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub fs: String,
    pub mode: ActivationMode,
    pub pid: u32,
    pub activated_at_unix: i64,
    /// Combined output of the mount or extract tool.
    pub output: String,
}

impl ActivationRecord {
    pub fn new(fs: FsKind, mode: ActivationMode, output: String) -> Self {
        Self {
            fs: fs.to_string(),
            mode,
            pid: std::process::id(),
            activated_at_unix: OffsetDateTime::now_utc().unix_timestamp(),
            output,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("serializing activation record")?;
        fs::write(path, json)
            .with_context(|| format!("writing activation log '{}'", path.display()))
    }

    /// Previous record at `path`, if one exists and parses.
    pub fn load(path: &Path) -> Option<Self> {
        let bytes = fs::read(path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!("ignoring unreadable activation log '{}': {err}", path.display());
                None
            }
        }
    }
}
