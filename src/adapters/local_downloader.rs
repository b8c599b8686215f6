//! Downloader for images already present on local storage.
//!
//! Accepts `file://` URLs and bare paths. Used when an image was side-loaded
//! (SD card, USB) and for host testing of the OTA pipeline.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use log::debug;

use crate::correlator::CancelToken;
use crate::ota::ports::{DownloadError, DownloadStatus, Downloader};

/// `FOTA_FILE_NOT_EXIST` in the download error table.
const FILE_NOT_EXIST: i32 = 1006;
const CHUNK: usize = 4096;

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileDownloader;

impl LocalFileDownloader {
    pub fn new() -> Self {
        Self
    }
}

fn local_path(url: &str) -> &Path {
    Path::new(url.strip_prefix("file://").unwrap_or(url))
}

impl Downloader for LocalFileDownloader {
    fn download(
        &self,
        url: &str,
        sink: &mut dyn Write,
        status: &mut dyn FnMut(DownloadStatus),
        abort: &CancelToken,
    ) -> Result<u64, DownloadError> {
        let path = local_path(url);
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                status(DownloadStatus::Failed(FILE_NOT_EXIST));
                return Err(DownloadError::Code(FILE_NOT_EXIST));
            }
            Err(e) => return Err(e.into()),
        };
        let total = file.metadata()?.len();
        status(DownloadStatus::Pending);

        let mut buf = [0u8; CHUNK];
        let mut copied = 0u64;
        let mut last_pct = 0u8;
        loop {
            if abort.is_cancelled() {
                debug!("Download: {} aborted after {} bytes", path.display(), copied);
                return Err(DownloadError::Aborted);
            }
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])?;
            copied += n as u64;
            if total > 0 {
                let pct = (copied * 100 / total).min(100) as u8;
                if pct > last_pct {
                    last_pct = pct;
                    status(DownloadStatus::Active(pct));
                }
            }
        }

        debug!("Download: {} bytes from {}", copied, path.display());
        status(DownloadStatus::Complete);
        Ok(copied)
    }
}
