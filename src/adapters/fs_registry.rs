//! File-backed update registry.
//!
//! The boot-time updater reads two files from the registry directory:
//!
//! ```text
//! <dir>/manifest.json   [{"staged": "...", "target": "...", "size": N}, ...]
//! <dir>/update.flag     present ⇒ apply the manifest on next boot
//! ```
//!
//! Both are written with a write-sync-rename sequence so a power cut
//! leaves either the old file or the new one, never a torn write.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use log::info;

use crate::ota::ports::{ManifestEntry, UpdateRegistry};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const FLAG_FILE: &str = "update.flag";

/// Write `buf` to `path` through a sibling temp file and a rename.
fn write_atomic(path: &Path, buf: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(buf)?;
    file.flush()?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)
}

pub struct FsUpdateRegistry {
    dir: PathBuf,
    restart_requested: AtomicBool,
}

impl FsUpdateRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            restart_requested: AtomicBool::new(false),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn flag_path(&self) -> PathBuf {
        self.dir.join(FLAG_FILE)
    }

    /// Entries currently registered; empty when no manifest exists.
    pub fn load_manifest(&self) -> io::Result<Vec<ManifestEntry>> {
        match fs::read(self.manifest_path()) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(io::Error::other),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub fn update_pending(&self) -> bool {
        self.flag_path().exists()
    }

    /// Whether [`restart`](UpdateRegistry::restart) was called on a host
    /// that cannot reboot.
    pub fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::Acquire)
    }
}

impl UpdateRegistry for FsUpdateRegistry {
    fn register(&self, manifest: &[ManifestEntry]) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec_pretty(manifest).map_err(io::Error::other)?;
        write_atomic(&self.manifest_path(), &json)?;
        info!("Registry: {} entries registered", manifest.len());
        Ok(())
    }

    fn set_update_flag(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        write_atomic(&self.flag_path(), b"1")?;
        info!("Registry: update flag set");
        Ok(())
    }

    fn restart(&self) {
        self.restart_requested.store(true, Ordering::Release);
        #[cfg(feature = "espidf")]
        {
            info!("Registry: restarting");
            esp_idf_svc::hal::reset::restart();
        }
        #[cfg(not(feature = "espidf"))]
        log::warn!("Registry: restart requested, host cannot reboot");
    }
}
