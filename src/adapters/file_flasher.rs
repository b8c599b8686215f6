//! MCU flasher that stages the companion image in a file.
//!
//! Blocks land in `<image>.part`; [`commit`](McuFlasher::commit) renames
//! it over the image path, where the companion's bootloader picks it up.
//! Blocks must arrive in order with no gaps.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};

use crate::ota::ports::McuFlasher;

struct Pending {
    file: File,
    written: u64,
    total: u64,
}

pub struct FileFlasher {
    image: PathBuf,
    pending: Mutex<Option<Pending>>,
}

impl FileFlasher {
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            pending: Mutex::new(None),
        }
    }

    pub fn image_path(&self) -> &Path {
        &self.image
    }

    fn part_path(&self) -> PathBuf {
        let mut name = self.image.clone().into_os_string();
        name.push(".part");
        PathBuf::from(name)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl McuFlasher for FileFlasher {
    fn begin(&self, total_size: u64) -> io::Result<()> {
        if let Some(parent) = self.image.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(self.part_path())?;
        info!("MCU: flashing {} bytes to {}", total_size, self.image.display());
        *self.lock() = Some(Pending {
            file,
            written: 0,
            total: total_size,
        });
        Ok(())
    }

    fn write_block(&self, offset: u64, block: &[u8]) -> io::Result<()> {
        let mut guard = self.lock();
        let pending = guard
            .as_mut()
            .ok_or_else(|| io::Error::other("write_block before begin"))?;
        if offset != pending.written {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block at {offset}, expected {}", pending.written),
            ));
        }
        if pending.total > 0 && offset + block.len() as u64 > pending.total {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "block past declared image size",
            ));
        }
        pending.file.write_all(block)?;
        pending.written += block.len() as u64;
        debug!("MCU: block @{} ({} bytes)", offset, block.len());
        Ok(())
    }

    fn commit(&self) -> io::Result<()> {
        let pending = self
            .lock()
            .take()
            .ok_or_else(|| io::Error::other("commit before begin"))?;
        let mut file = pending.file;
        file.flush()?;
        file.sync_all()?;
        drop(file);
        fs::rename(self.part_path(), &self.image)?;
        info!("MCU: image committed ({} bytes)", pending.written);
        Ok(())
    }

    fn abort(&self) {
        if self.lock().take().is_some() {
            if let Err(e) = fs::remove_file(self.part_path()) {
                warn!("MCU: could not remove partial image: {}", e);
            }
            info!("MCU: flashing aborted");
        }
    }
}
