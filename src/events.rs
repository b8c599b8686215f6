//! Inbound cloud events delivered to local observers.
//!
//! ```text
//! ┌──────────────┐     ┌────────────┐     ┌─────────────────┐
//! │ property set │────▶│            │────▶│ observer #1     │
//! │ raw data     │────▶│ Dispatcher │────▶│ observer #2     │
//! │ OTA status   │────▶│ (in order) │────▶│ ...             │
//! │ RPC request  │────▶│            │     │                 │
//! └──────────────┘     └────────────┘     └─────────────────┘
//! ```
//!
//! Every payload is decoded into one of these variants once, at the
//! session boundary. Observers only ever see semantic keys.

use serde_json::Value;

/// Coarse category used by observers to filter what they receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Object model property push from the cloud.
    Property,
    /// Opaque passthrough bytes.
    Raw,
    /// OTA status or OTA configuration.
    Ota,
    /// Synchronous command expecting a per-request reply.
    Rpc,
    /// Property query or cancellation.
    Query,
}

/// Progress of a transfer as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaStatus {
    /// An image was announced and awaits confirmation.
    Available,
    /// The transfer has started.
    Started,
    /// Integer percent in `0..=100`.
    Progress(u8),
    /// Image installed; a restart may follow.
    Installed,
    /// Transfer failed with a device→cloud progress code (-1 .. -4).
    Failed(i32),
    /// Transfer was cancelled before installation.
    Cancelled,
}

/// Structured event emitted to every subscribed observer.
#[derive(Debug, Clone, PartialEq)]
pub enum CloudEvent {
    /// Cloud wrote one or more properties (semantic keys, decoded values).
    PropertySet(Vec<(String, Value)>),

    /// Opaque bytes delivered on the passthrough topic.
    RawData(Vec<u8>),

    /// OTA status change for a module.
    OtaStatus {
        module: String,
        version: String,
        status: OtaStatus,
    },

    /// Announcement details (download parts, sizes) for an available image.
    OtaConfig { module: String, details: Value },

    /// Cloud invoked a synchronous command. Reply with
    /// `CloudSession::respond_rpc(request_id, ..)`.
    RpcRequest { request_id: String, payload: Value },

    /// Reply data for an OTA file block requested over MQTT.
    FileDownload(Value),

    /// Cloud asked for the current values of these properties.
    Query(Vec<String>),

    /// An installed update will take effect after restart.
    RestartPending { module: String },
}

impl CloudEvent {
    pub fn category(&self) -> Category {
        match self {
            Self::PropertySet(_) => Category::Property,
            Self::RawData(_) => Category::Raw,
            Self::OtaStatus { .. }
            | Self::OtaConfig { .. }
            | Self::FileDownload(_)
            | Self::RestartPending { .. } => Category::Ota,
            Self::RpcRequest { .. } => Category::Rpc,
            Self::Query(_) => Category::Query,
        }
    }
}
