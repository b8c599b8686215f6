//! Transport abstraction — the MQTT-style client the session drives.
//!
//! The session is generic over [`TransportClient`], so a new broker
//! client needs zero changes to encoding, correlation or OTA logic.
//! Connection management (TLS, keepalive, reconnect) lives entirely on
//! the implementation's side.

/// Callback invoked for every inbound message: `(topic, payload)`.
pub type InboundCallback = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Identity and policy handed to [`TransportClient::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub client_id: String,
    pub server: String,
    pub username: String,
    pub password: String,
    pub keepalive_secs: u16,
    pub reconnect: bool,
}

/// Publish/subscribe client consumed by the session.
pub trait TransportClient: Send + Sync {
    fn connect(&self, params: &ConnectParams) -> bool;

    fn subscribe(&self, topic: &str, qos: u8) -> bool;

    fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> bool;

    /// Replace the inbound callback. Messages may arrive on any thread.
    fn set_inbound_callback(&self, callback: InboundCallback);

    fn disconnect(&self);

    fn status(&self) -> bool;
}

/// A transport that refuses every operation.
/// Useful as a placeholder before a real client is wired in.
pub struct NullTransport;

impl TransportClient for NullTransport {
    fn connect(&self, _params: &ConnectParams) -> bool {
        false
    }

    fn subscribe(&self, _topic: &str, _qos: u8) -> bool {
        false
    }

    fn publish(&self, _topic: &str, _payload: &[u8], _qos: u8) -> bool {
        false
    }

    fn set_inbound_callback(&self, _callback: InboundCallback) {}

    fn disconnect(&self) {}

    fn status(&self) -> bool {
        false
    }
}
