//! HTTP(S) downloader for announced image URLs.
//!
//! ```text
//!  url ──check_url──▶ EspHttpConnection ──GET──▶ status ──▶ body chunks ──▶ sink
//!           │                 │                    │              │
//!           ▼                 ▼                    ▼              ▼
//!         1003              1004          1005/1006/1008/...    1008
//! ```
//!
//! The transport itself only exists on ESP-IDF. The mapping from URLs and
//! HTTP statuses onto the download code table is plain logic and is shared
//! with the host build.

use crate::ota::ports::{DownloadError, DownloadStatus};

pub const DOMAIN_TIMEOUT: i32 = 1002;
pub const DOMAIN_UNKNOWN: i32 = 1003;
pub const SERVER_CONN_FAIL: i32 = 1004;
pub const AUTH_FAILED: i32 = 1005;
pub const FILE_NOT_EXIST: i32 = 1006;
pub const FILE_GET_ERR: i32 = 1008;
pub const FILE_SIZE_TOO_LARGE: i32 = 1013;

/// Body read size and connection buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Reject URLs the HTTP client cannot fetch.
pub fn check_url(url: &str) -> Result<(), i32> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or(DOMAIN_UNKNOWN)?;
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() {
        return Err(DOMAIN_UNKNOWN);
    }
    Ok(())
}

/// Download code for an HTTP status. `None` means the body can be read.
pub fn status_error(status: u16) -> Option<i32> {
    match status {
        200..=299 => None,
        401 | 403 => Some(AUTH_FAILED),
        404 | 410 => Some(FILE_NOT_EXIST),
        408 | 504 => Some(DOMAIN_TIMEOUT),
        413 => Some(FILE_SIZE_TOO_LARGE),
        500..=599 => Some(SERVER_CONN_FAIL),
        _ => Some(FILE_GET_ERR),
    }
}

/// Integer percent of `total`; 0 when the size is unknown.
pub fn percent(copied: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (copied.saturating_mul(100) / total).min(100) as u8
}

/// Report `code` through the status callback and turn it into an error.
pub fn fail(status: &mut dyn FnMut(DownloadStatus), code: i32) -> DownloadError {
    status(DownloadStatus::Failed(code));
    DownloadError::Code(code)
}

#[cfg(feature = "espidf")]
mod esp {
    use std::io::Write;
    use std::time::Duration;

    use embedded_svc::http::client::Client;
    use esp_idf_svc::http::client::{Configuration, EspHttpConnection};
    use log::{debug, info, warn};

    use super::{DEFAULT_BUFFER_SIZE, FILE_GET_ERR, SERVER_CONN_FAIL, check_url, fail, percent, status_error};
    use crate::correlator::CancelToken;
    use crate::ota::ports::{DownloadError, DownloadStatus, Downloader};

    /// Streams an image over HTTP(S) with the IDF client and CA bundle.
    pub struct EspHttpDownloader {
        timeout: Duration,
        buffer_size: usize,
    }

    impl EspHttpDownloader {
        /// `timeout` bounds each network operation, not the whole transfer.
        pub fn new(timeout: Duration) -> Self {
            Self {
                timeout,
                buffer_size: DEFAULT_BUFFER_SIZE,
            }
        }
    }

    impl Downloader for EspHttpDownloader {
        fn download(
            &self,
            url: &str,
            sink: &mut dyn Write,
            status: &mut dyn FnMut(DownloadStatus),
            abort: &CancelToken,
        ) -> Result<u64, DownloadError> {
            check_url(url).map_err(|code| fail(status, code))?;

            let connection = EspHttpConnection::new(&Configuration {
                buffer_size: Some(self.buffer_size),
                buffer_size_tx: Some(512),
                timeout: Some(self.timeout),
                crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
                ..Default::default()
            })
            .map_err(|e| {
                warn!("Download: connection setup failed: {:?}", e);
                fail(status, SERVER_CONN_FAIL)
            })?;

            let mut client = Client::wrap(connection);
            let request = client.get(url).map_err(|e| {
                warn!("Download: GET {} failed: {:?}", url, e);
                fail(status, SERVER_CONN_FAIL)
            })?;
            let mut response = request.submit().map_err(|e| {
                warn!("Download: submit to {} failed: {:?}", url, e);
                fail(status, SERVER_CONN_FAIL)
            })?;

            let code = response.status();
            if let Some(err) = status_error(code) {
                warn!("Download: {} answered HTTP {}", url, code);
                return Err(fail(status, err));
            }
            let total = response
                .header("Content-Length")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(0);
            info!("Download: {} ({} bytes)", url, total);
            status(DownloadStatus::Pending);

            let mut buf = vec![0u8; self.buffer_size];
            let mut copied = 0u64;
            let mut last_pct = 0u8;
            loop {
                if abort.is_cancelled() {
                    debug!("Download: aborted after {} bytes", copied);
                    return Err(DownloadError::Aborted);
                }
                let n = response.read(&mut buf).map_err(|e| {
                    warn!("Download: read failed after {} bytes: {:?}", copied, e);
                    fail(status, FILE_GET_ERR)
                })?;
                if n == 0 {
                    break;
                }
                sink.write_all(&buf[..n])?;
                copied += n as u64;

                let pct = percent(copied, total);
                if pct > last_pct {
                    last_pct = pct;
                    status(DownloadStatus::Active(pct));
                }
            }

            status(DownloadStatus::Complete);
            Ok(copied)
        }
    }
}

#[cfg(feature = "espidf")]
pub use esp::EspHttpDownloader;
