//! Adapters — concrete implementations of the port traits.
//!
//! | Adapter            | Implements       | Connects to                  |
//! |--------------------|------------------|------------------------------|
//! | `log_observer`     | CloudObserver    | Serial / host log output     |
//! | `fs_registry`      | UpdateRegistry   | Manifest + flag files        |
//! | `file_flasher`     | McuFlasher       | Image file on local storage  |
//! | `local_downloader` | Downloader       | `file://` URLs, local paths  |
//! | `http_downloader`  | Downloader       | HTTP(S) image URLs (ESP-IDF) |

pub mod file_flasher;
pub mod fs_registry;
pub mod http_downloader;
pub mod local_downloader;
pub mod log_observer;

/// Install the platform logger.
///
/// On ESP-IDF this routes `log` records to the IDF console. On hosts the
/// caller picks its own `log` implementation and this is a no-op.
pub fn init_logging() -> anyhow::Result<()> {
    #[cfg(feature = "espidf")]
    {
        esp_idf_svc::sys::link_patches();
        esp_idf_logger::init()?;
    }
    log::info!("thinglink v{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
