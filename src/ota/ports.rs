//! Port traits — the boundary between the OTA state machine and the device.
//!
//! ```text
//!   OtaOrchestrator ──▶ Downloader      (fetch image bytes)
//!                   ──▶ McuFlasher      (companion MCU blocks)
//!                   ──▶ UpdateRegistry  (manifest, update flag, restart)
//!                   ──▶ ProgressReporter (progress steps to the cloud)
//! ```
//!
//! All ports are `Send + Sync`: they are shared between the inbound
//! context and the detached transfer thread.

use core::fmt;
use std::io::{self, Write};
use std::path::PathBuf;

use crate::correlator::CancelToken;

// ───────────────────────────────────────────────────────────────
// Download
// ───────────────────────────────────────────────────────────────

/// Status callbacks emitted by a [`Downloader`] while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Connection set up, no bytes yet.
    Pending,
    /// Integer percent received so far.
    Active(u8),
    /// Every byte was received.
    Complete,
    /// The downloader gave up with a code (see [`codes`](super::codes)).
    Failed(i32),
}

#[derive(Debug)]
pub enum DownloadError {
    /// Downloader-specific failure code.
    Code(i32),
    /// Stopped because the abort token fired.
    Aborted,
    /// The sink or the connection failed.
    Io(io::Error),
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "download failed with code {code}"),
            Self::Aborted => write!(f, "download aborted"),
            Self::Io(e) => write!(f, "download I/O error: {e}"),
        }
    }
}

impl From<io::Error> for DownloadError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Fetches one image part and streams it into `sink`.
///
/// `abort` fires when the transfer is cancelled or its deadline passes,
/// including while no bytes are arriving. Implementations poll it between
/// reads and return [`DownloadError::Aborted`] once it is set.
pub trait Downloader: Send + Sync {
    /// Returns the number of bytes written to `sink`.
    fn download(
        &self,
        url: &str,
        sink: &mut dyn Write,
        status: &mut dyn FnMut(DownloadStatus),
        abort: &CancelToken,
    ) -> Result<u64, DownloadError>;
}

// ───────────────────────────────────────────────────────────────
// Companion MCU flashing
// ───────────────────────────────────────────────────────────────

/// Flashing primitive for the companion microcontroller.
///
/// Blocks arrive in order, each `block_size` bytes except the last.
pub trait McuFlasher: Send + Sync {
    fn begin(&self, total_size: u64) -> io::Result<()>;

    fn write_block(&self, offset: u64, block: &[u8]) -> io::Result<()>;

    /// Make the written image the one applied on next boot.
    fn commit(&self) -> io::Result<()>;

    /// Drop whatever was written since `begin`.
    fn abort(&self);
}

// ───────────────────────────────────────────────────────────────
// Update registration
// ───────────────────────────────────────────────────────────────

/// One staged file awaiting installation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ManifestEntry {
    /// Where the file sits now.
    pub staged: PathBuf,
    /// Where it is installed on the next boot.
    pub target: PathBuf,
    pub size: u64,
}

/// Hands staged files to the platform updater and reboots the device.
pub trait UpdateRegistry: Send + Sync {
    /// Record every entry atomically; either all are registered or none.
    fn register(&self, manifest: &[ManifestEntry]) -> io::Result<()>;

    /// Tell the boot-time updater an update is pending.
    fn set_update_flag(&self) -> io::Result<()>;

    /// Reboot. May return on hosts that cannot restart.
    fn restart(&self);
}

// ───────────────────────────────────────────────────────────────
// Progress reporting
// ───────────────────────────────────────────────────────────────

/// Publishes progress steps (`1..=100`, or a negative failure code).
pub trait ProgressReporter: Send + Sync {
    /// Returns `true` if the report was handed to the transport.
    fn report(&self, module: &str, step: i32, desc: &str) -> bool;
}
