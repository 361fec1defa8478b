//! Trailer locator.
//!
//! An AppBundle is the runtime ELF followed by a trailer:
//!
//! ```text
//! <runtime ELF segments>
//! __STATIC_TOOLS__
//! <base64 of a zstd-compressed tar of helper tools>
//! __STATIC_TOOLS_EOF__
//! __APPBUNDLE_ID__: <id>
//! __PELF_VERSION__: <version>
//! __PELF_HOST__: <uname string>
//! __APPBUNDLE_FS__: <dwarfs|squashfs>
//! __ARCHIVE_MARKER__
//! <filesystem image bytes to EOF>
//! ```
//!
//! Metadata lines may also appear before `__STATIC_TOOLS__`. Scanning is line
//! based and stops at `__ARCHIVE_MARKER__`; the image is only ever addressed
//! by offset.

pub mod elf;

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::Path;

use crate::error::BundleError;
use crate::filesystem::FsKind;

pub const STATIC_TOOLS_MARKER: &str = "__STATIC_TOOLS__";
pub const STATIC_TOOLS_EOF_MARKER: &str = "__STATIC_TOOLS_EOF__";
pub const ARCHIVE_MARKER: &str = "__ARCHIVE_MARKER__";

/// Metadata key of the bundle identifier.
pub const ID_KEY: &str = "__APPBUNDLE_ID__";
const VERSION_KEY: &str = "__PELF_VERSION__";
const HOST_KEY: &str = "__PELF_HOST__";
const FS_KEY: &str = "__APPBUNDLE_FS__";
const UPDATE_INFO_KEY: &str = "__UPD_INFO__";
const SIGNATURE_KEY: &str = "__SHA256_SIG__";
const OPTS_KEY: &str = "__APPBUNDLE_OPTS__";

const OPT_DISABLE_RANDOM_WORKDIR: &str = "disableRandomWorkDir";

/// Everything recovered from the trailer of a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailer {
    /// Where the runtime's ELF content ends.
    pub elf_end: u64,
    /// Encoded helper-tools archive: after the start marker line, up to the
    /// first byte of the end marker line.
    pub static_tools: Range<u64>,
    /// First byte of the filesystem image.
    pub image_offset: u64,
    /// May be absent when the identifier is supplied through `EXE_NAME`.
    pub bundle_id: Option<String>,
    pub fs_kind: FsKind,
    pub pelf_version: String,
    pub pelf_host: String,
    pub update_info: Option<String>,
    pub signature: Option<String>,
    pub disable_random_work_dir: bool,
}

/// Raw scan state; fields fill in as lines are seen.
#[derive(Debug, Default)]
struct Scan {
    static_tools_start: Option<u64>,
    static_tools_end: Option<u64>,
    image_offset: Option<u64>,
    bundle_id: Option<String>,
    fs_tag: Option<String>,
    pelf_version: Option<String>,
    pelf_host: Option<String>,
    update_info: Option<String>,
    signature: Option<String>,
    disable_random_work_dir: bool,
}

impl Scan {
    fn markers_complete(&self) -> bool {
        self.static_tools_start.is_some()
            && self.static_tools_end.is_some()
            && self.image_offset.is_some()
    }

    fn observe(&mut self, line: &[u8], offset: u64) {
        let line_len = line.len() as u64;
        let Ok(text) = std::str::from_utf8(line) else {
            return;
        };
        let text = text.trim();

        match text {
            STATIC_TOOLS_MARKER if self.static_tools_start.is_none() => {
                self.static_tools_start = Some(offset + line_len);
                return;
            }
            STATIC_TOOLS_EOF_MARKER if self.static_tools_end.is_none() => {
                self.static_tools_end = Some(offset);
                return;
            }
            ARCHIVE_MARKER if self.image_offset.is_none() => {
                self.image_offset = Some(offset + line_len);
                return;
            }
            _ => {}
        }

        let Some((key, value)) = text.split_once(':') else {
            return;
        };
        let value = value.trim();
        let slot = match key.trim() {
            ID_KEY => &mut self.bundle_id,
            FS_KEY => &mut self.fs_tag,
            VERSION_KEY => &mut self.pelf_version,
            HOST_KEY => &mut self.pelf_host,
            UPDATE_INFO_KEY => &mut self.update_info,
            SIGNATURE_KEY => &mut self.signature,
            OPTS_KEY => {
                if value.split(',').any(|opt| opt.trim() == OPT_DISABLE_RANDOM_WORKDIR) {
                    self.disable_random_work_dir = true;
                }
                return;
            }
            _ => return,
        };
        if slot.is_none() && !value.is_empty() {
            *slot = Some(value.to_string());
        }
    }

    fn into_trailer(self, elf_end: u64) -> Result<Trailer, BundleError> {
        let mut missing = Vec::new();
        if self.static_tools_start.is_none() {
            missing.push(STATIC_TOOLS_MARKER);
        }
        if self.static_tools_end.is_none() {
            missing.push(STATIC_TOOLS_EOF_MARKER);
        }
        if self.image_offset.is_none() {
            missing.push(ARCHIVE_MARKER);
        }
        let (Some(start), Some(end), Some(image_offset)) =
            (self.static_tools_start, self.static_tools_end, self.image_offset)
        else {
            return Err(BundleError::MissingMarker { missing });
        };

        let fs_kind = self
            .fs_tag
            .ok_or(BundleError::MissingMetadata { field: FS_KEY })?
            .parse::<FsKind>()?;

        Ok(Trailer {
            elf_end,
            static_tools: start..end.max(start),
            image_offset,
            bundle_id: self.bundle_id,
            fs_kind,
            pelf_version: self.pelf_version.unwrap_or_default(),
            pelf_host: self.pelf_host.unwrap_or_default(),
            update_info: self.update_info,
            signature: self.signature,
            disable_random_work_dir: self.disable_random_work_dir,
        })
    }
}

impl Trailer {
    /// Locate and parse the trailer of the bundle at `path`.
    pub fn locate(path: &Path) -> Result<Self> {
        let mut file =
            File::open(path).with_context(|| format!("opening bundle '{}'", path.display()))?;
        Self::read_from(&mut file)
            .with_context(|| format!("reading trailer of '{}'", path.display()))
    }

    /// Parse the trailer from any seekable source positioned anywhere.
    pub fn read_from<R: Read + Seek>(source: &mut R) -> Result<Self> {
        let elf_end = elf::elf_end(source)?;
        source.seek(SeekFrom::Start(elf_end))?;

        let mut reader = BufReader::new(source);
        let mut scan = Scan::default();
        let mut offset = elf_end;
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .context("scanning trailer lines")?;
            if read == 0 {
                break;
            }
            scan.observe(&line, offset);
            offset += read as u64;

            // Everything after the archive marker is image data.
            if scan.image_offset.is_some() {
                break;
            }
        }

        tracing::debug!(
            elf_end,
            complete = scan.markers_complete(),
            "trailer scan finished at offset {offset}"
        );
        Ok(scan.into_trailer(elf_end)?)
    }

    /// Read the encoded helper-tools segment.
    pub fn read_static_tools<R: Read + Seek>(&self, source: &mut R) -> Result<Vec<u8>> {
        let len = self.static_tools.end - self.static_tools.start;
        let mut buf = vec![0u8; len as usize];
        source.seek(SeekFrom::Start(self.static_tools.start))?;
        source
            .read_exact(&mut buf)
            .context("reading static tools segment")?;
        Ok(buf)
    }
}
