//! Log-based observer adapter.
//!
//! Implements [`CloudObserver`] by writing one line per [`CloudEvent`] to
//! the logger (UART / USB-CDC on the device, whatever `log` backend the
//! host installed otherwise). Useful as the first subscriber during
//! bring-up.

use log::info;

use crate::dispatcher::CloudObserver;
use crate::events::{Category, CloudEvent};

/// Observer that logs every event, optionally restricted to some categories.
#[derive(Debug, Default)]
pub struct LogObserver {
    only: Option<Vec<Category>>,
}

impl LogObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log only events of the given categories.
    pub fn with_categories(categories: impl IntoIterator<Item = Category>) -> Self {
        Self {
            only: Some(categories.into_iter().collect()),
        }
    }
}

impl CloudObserver for LogObserver {
    fn accepts(&self, category: Category) -> bool {
        self.only.as_ref().is_none_or(|c| c.contains(&category))
    }

    fn on_event(&self, event: &CloudEvent) {
        match event {
            CloudEvent::PropertySet(pairs) => {
                let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
                info!("PROP  | set {}", keys.join(","));
            }
            CloudEvent::RawData(bytes) => {
                info!("RAW   | {} bytes", bytes.len());
            }
            CloudEvent::OtaStatus {
                module,
                version,
                status,
            } => {
                info!("OTA   | {} {} {:?}", module, version, status);
            }
            CloudEvent::OtaConfig { module, details } => {
                info!("OTA   | {} config {}", module, details);
            }
            CloudEvent::RpcRequest { request_id, .. } => {
                info!("RPC   | request {}", request_id);
            }
            CloudEvent::FileDownload(data) => {
                info!("OTA   | file block {}", data);
            }
            CloudEvent::Query(keys) => {
                info!("QUERY | {}", keys.join(","));
            }
            CloudEvent::RestartPending { module } => {
                info!("OTA   | {} installed, restart pending", module);
            }
        }
    }
}
