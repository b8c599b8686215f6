//! Composite image archive — a gzip-wrapped tar stream.
//!
//! ```text
//!  ┌────────────┬──────────────┬─────────┬────────────┬─────┬───────────┐
//!  │ header 512 │ payload+pad  │ header  │ payload+pad│ ... │ zero block│
//!  └────────────┴──────────────┴─────────┴────────────┴─────┴───────────┘
//!   name  = bytes[0..100],   NUL-trimmed
//!   size  = bytes[124..136], ASCII octal, NUL/space-trimmed
//! ```
//!
//! The gzip layer is `flate2`; the tar walk is ours. Zero size with a name
//! is a directory; zero size with an empty name, or a short all-zero
//! trailing block, ends the archive. Every file lands under the staging root and is recorded in
//! the returned manifest with its install path under the install root.

use core::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use log::{debug, info};

use super::ports::ManifestEntry;

pub const BLOCK_SIZE: usize = 512;

const NAME_FIELD: core::ops::Range<usize> = 0..100;
const SIZE_FIELD: core::ops::Range<usize> = 124..136;

// ── Error type ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnpackError {
    /// Filesystem or stream error.
    Io(io::ErrorKind, String),
    /// Stream ended inside a header or payload.
    Truncated,
    /// Size field is not ASCII octal.
    BadSize,
    /// Entry name is absolute or escapes the staging root.
    UnsafePath(String),
}

impl fmt::Display for UnpackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(_, msg) => write!(f, "{msg}"),
            Self::Truncated => write!(f, "archive truncated"),
            Self::BadSize => write!(f, "bad entry size field"),
            Self::UnsafePath(name) => write!(f, "unsafe entry path: {name}"),
        }
    }
}

impl From<io::Error> for UnpackError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => Self::Truncated,
            kind => Self::Io(kind, e.to_string()),
        }
    }
}

impl From<UnpackError> for crate::error::Error {
    fn from(e: UnpackError) -> Self {
        Self::UnpackFailure(e.to_string())
    }
}

// ── Header parsing ────────────────────────────────────────────

/// Decoded fields of one 512-byte header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub name: String,
    pub size: u64,
}

impl EntryHeader {
    pub fn parse(block: &[u8; BLOCK_SIZE]) -> Result<Self, UnpackError> {
        let name = trim_field(&block[NAME_FIELD]);
        let name = String::from_utf8_lossy(name).into_owned();

        let size = trim_field(&block[SIZE_FIELD]);
        let size = core::str::from_utf8(size).map_err(|_| UnpackError::BadSize)?;
        let size = size.trim_matches(' ');
        let size = if size.is_empty() {
            0
        } else {
            u64::from_str_radix(size, 8).map_err(|_| UnpackError::BadSize)?
        };

        Ok(Self { name, size })
    }

    pub fn is_end(&self) -> bool {
        self.size == 0 && self.name.is_empty()
    }

    pub fn is_dir(&self) -> bool {
        self.size == 0 && !self.name.is_empty()
    }
}

/// Cut a fixed-width field at its first NUL.
fn trim_field(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

/// Relative path for `name`, or an error if it could escape the root.
fn safe_relative(name: &str) -> Result<PathBuf, UnpackError> {
    let path = Path::new(name);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(UnpackError::UnsafePath(name.to_owned()));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(UnpackError::UnsafePath(name.to_owned()));
    }
    Ok(out)
}

// ── Walker ────────────────────────────────────────────────────

/// Read one header block. `Ok(None)` on a clean or zero-filled end.
fn read_header<R: Read>(r: &mut R) -> Result<Option<[u8; BLOCK_SIZE]>, UnpackError> {
    let mut block = [0u8; BLOCK_SIZE];
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        match r.read(&mut block[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    if filled == BLOCK_SIZE {
        return Ok(Some(block));
    }
    // A short trailing block is only acceptable if it carries nothing.
    if block[..filled].iter().all(|&b| b == 0) {
        Ok(None)
    } else {
        Err(UnpackError::Truncated)
    }
}

/// Unpack a tar stream into `staging_root`.
pub fn unpack<R: Read>(
    mut reader: R,
    staging_root: &Path,
    install_root: &Path,
) -> Result<Vec<ManifestEntry>, UnpackError> {
    fs::create_dir_all(staging_root)?;
    let mut manifest = Vec::new();

    while let Some(block) = read_header(&mut reader)? {
        let header = EntryHeader::parse(&block)?;
        debug!("OTA: entry '{}' ({} bytes)", header.name, header.size);

        if header.is_end() {
            break;
        }

        let relative = safe_relative(&header.name)?;
        let staged = staging_root.join(&relative);

        if header.is_dir() {
            fs::create_dir_all(&staged)?;
            continue;
        }

        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&staged)?;
        let copied = io::copy(&mut reader.by_ref().take(header.size), &mut file)?;
        if copied != header.size {
            return Err(UnpackError::Truncated);
        }
        skip_padding(&mut reader, header.size)?;

        manifest.push(ManifestEntry {
            staged,
            target: install_root.join(&relative),
            size: header.size,
        });
    }

    info!("OTA: unpacked {} files", manifest.len());
    Ok(manifest)
}

/// Skip the zero fill after a payload. A stream that ends inside the
/// padding is left for the next header read to judge.
fn skip_padding<R: Read>(r: &mut R, size: u64) -> Result<(), UnpackError> {
    let rem = (size % BLOCK_SIZE as u64) as usize;
    if rem == 0 {
        return Ok(());
    }
    let pad = (BLOCK_SIZE - rem) as u64;
    io::copy(&mut r.by_ref().take(pad), &mut io::sink())?;
    Ok(())
}

/// Unpack a gzip-compressed archive file, then delete it.
pub fn unpack_gzip_file(
    archive: &Path,
    staging_root: &Path,
    install_root: &Path,
) -> Result<Vec<ManifestEntry>, UnpackError> {
    let manifest = {
        let file = File::open(archive)?;
        let mut reader = GzDecoder::new(BufReader::new(file));
        let manifest = unpack(&mut reader, staging_root, install_root)?;
        // Read through to the trailer so CRC32 and ISIZE are checked.
        io::copy(&mut reader, &mut io::sink())?;
        manifest
    };
    debug!("OTA: removing {}", archive.display());
    fs::remove_file(archive)?;
    Ok(manifest)
}
