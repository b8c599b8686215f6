//! Cloud session — the device-facing façade over a [`TransportClient`].
//!
//! ```text
//!  application ──post_data──▶ ObjectModel.encode ──▶ PostEnvelope ──▶ transport.publish
//!       ▲                                                                  │
//!       │                        correlator.wait_for(id) ◀── post_reply ───┘
//!       │
//!  CloudObserver ◀── EventDispatcher ◀── Router ◀── transport callback
//!                                          │
//!                                          └──▶ OtaOrchestrator ──▶ progress publish
//! ```
//!
//! A session owns one transport, one correlator and one OTA orchestrator.
//! A call that awaits replies blocks for at most `publish_timeout_ms`
//! in total. Inbound handling never waits on the caller.

pub mod envelope;
mod router;
pub mod topics;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::CloudConfig;
use crate::correlator::{MessageCorrelator, MessageId};
use crate::dispatcher::{CloudObserver, EventDispatcher};
use crate::error::{Error, Result};
use crate::model::schema::WireDialect;
use crate::model::{Domain, ObjectModel};
use crate::ota::codes;
use crate::ota::ports::ProgressReporter;
use crate::ota::{FailureCode, OtaOrchestrator, OtaPorts};
use crate::transport::{ConnectParams, TransportClient};

use envelope::{InformParams, OtaEnvelope, PostEnvelope, ProgressParams, RequestEnvelope};
use router::Router;
use topics::Topics;

/// QoS used for every outbound publish.
const PUBLISH_QOS: u8 = 0;

const STEP_CONFIRMED: i32 = 1;
const STEP_USER_CANCEL: i32 = -1;
const CONFIRM_DESC: &str = "Upgrade confirmed.";
const CANCEL_DESC: &str = "User cancels upgrade.";

// ── Shared state ──────────────────────────────────────────────

/// State shared between the session, the inbound router and the OTA
/// progress reporter.
pub(crate) struct Shared<T: TransportClient> {
    transport: T,
    correlator: MessageCorrelator,
    topics: Topics,
    config: CloudConfig,
    model: Arc<ObjectModel>,
    connected: AtomicBool,
}

impl<T: TransportClient> Shared<T> {
    fn publish_json<S: Serialize>(&self, topic: &str, frame: &S) -> Result<()> {
        let payload = serde_json::to_vec(frame)?;
        if self.transport.publish(topic, &payload, PUBLISH_QOS) {
            debug!("Session: published {} bytes to {}", payload.len(), topic);
            Ok(())
        } else {
            warn!("Session: publish to {} failed", topic);
            Err(Error::TransportFailure("publish"))
        }
    }

    fn report_progress(&self, module: &str, step: i32, desc: &str) -> Result<()> {
        let desc = codes::bounded(desc);
        let frame = OtaEnvelope {
            id: self.correlator.next_id().to_string(),
            params: ProgressParams {
                step,
                desc: desc.as_str(),
                module,
            },
        };
        self.publish_json(&self.topics.ota_progress(), &frame)
    }
}

/// Publishes OTA progress on behalf of the orchestrator.
struct SessionReporter<T: TransportClient> {
    shared: Arc<Shared<T>>,
}

impl<T: TransportClient> ProgressReporter for SessionReporter<T> {
    fn report(&self, module: &str, step: i32, desc: &str) -> bool {
        self.shared.report_progress(module, step, desc).is_ok()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Session ───────────────────────────────────────────────────

pub struct CloudSession<T: TransportClient + 'static> {
    shared: Arc<Shared<T>>,
    router: Arc<Router<T>>,
    dispatcher: Arc<EventDispatcher>,
    ota: OtaOrchestrator,
}

impl<T: TransportClient + 'static> CloudSession<T> {
    pub fn new(config: CloudConfig, model: ObjectModel, transport: T, ports: OtaPorts) -> Self {
        let shared = Arc::new(Shared {
            correlator: MessageCorrelator::new(config.poll_interval()),
            topics: Topics::new(config.dialect, &config.product_key, &config.device_name),
            model: Arc::new(model),
            connected: AtomicBool::new(false),
            transport,
            config,
        });

        let dispatcher = Arc::new(EventDispatcher::new());
        let reporter = Arc::new(SessionReporter {
            shared: Arc::clone(&shared),
        });
        let ota = OtaOrchestrator::new(
            shared.config.ota.clone(),
            shared.config.firmware_name.clone(),
            shared.config.mcu_name.clone(),
            ports,
            reporter,
            Arc::clone(&dispatcher),
        );
        let router = Arc::new(Router {
            shared: Arc::clone(&shared),
            dispatcher: Arc::clone(&dispatcher),
            ota: ota.clone(),
        });

        Self {
            shared,
            router,
            dispatcher,
            ota,
        }
    }

    pub fn config(&self) -> &CloudConfig {
        &self.shared.config
    }

    pub fn model(&self) -> &ObjectModel {
        &self.shared.model
    }

    pub fn topics(&self) -> &Topics {
        &self.shared.topics
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn ota(&self) -> &OtaOrchestrator {
        &self.ota
    }

    pub fn subscribe(&self, observer: Arc<dyn CloudObserver>) {
        self.dispatcher.subscribe(observer);
    }

    /// Feed one inbound message through the router by hand.
    ///
    /// Transports normally deliver via the callback installed by
    /// [`connect`](Self::connect).
    pub fn handle_inbound(&self, topic: &str, payload: &[u8]) {
        self.router.handle(topic, payload);
    }

    // ── Connection ────────────────────────────────────────────

    /// Connect and subscribe every session topic.
    ///
    /// A no-op when already connected unless `force` is set. A failed
    /// subscription is logged and does not fail the connect.
    pub fn connect(&self, force: bool) -> Result<()> {
        let shared = &self.shared;
        if !force && shared.connected.load(Ordering::Acquire) && shared.transport.status() {
            debug!("Session: already connected");
            return Ok(());
        }

        let router: Weak<Router<T>> = Arc::downgrade(&self.router);
        shared
            .transport
            .set_inbound_callback(Box::new(move |topic: &str, payload: &[u8]| {
                if let Some(router) = router.upgrade() {
                    router.handle(topic, payload);
                }
            }));

        let cfg = &shared.config;
        let params = ConnectParams {
            client_id: if cfg.client_id.is_empty() {
                format!("{}.{}", cfg.product_key, cfg.device_name)
            } else {
                cfg.client_id.clone()
            },
            server: cfg.server.clone(),
            username: format!("{}&{}", cfg.device_name, cfg.product_key),
            password: cfg.device_secret.clone(),
            keepalive_secs: cfg.keepalive_secs,
            reconnect: cfg.reconnect,
        };

        info!("Session: connecting to {} as {}", params.server, params.client_id);
        if !shared.transport.connect(&params) {
            warn!("Session: connect to {} failed", params.server);
            shared.connected.store(false, Ordering::Release);
            return Err(Error::ConnectFailure);
        }

        let events = shared.model.event_wire_keys();
        let subscriptions = shared
            .topics
            .subscriptions(events.iter().map(String::as_str));
        for topic in &subscriptions {
            if !shared.transport.subscribe(topic, cfg.subscribe_qos) {
                warn!("Session: subscribe to {} failed", topic);
            }
        }

        shared.connected.store(true, Ordering::Release);
        info!("Session: connected, {} subscriptions", subscriptions.len());
        Ok(())
    }

    pub fn disconnect(&self) {
        self.shared.transport.disconnect();
        self.shared.connected.store(false, Ordering::Release);
        info!("Session: disconnected");
    }

    /// Connected according to both the session and the transport.
    pub fn status(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire) && self.shared.transport.status()
    }

    // ── Outbound ──────────────────────────────────────────────

    /// Encode and publish one record of semantic keys.
    ///
    /// Properties share one message; each event goes out on its own
    /// topic. Every message is published before any reply is awaited.
    /// Null values and keys the model does not know are skipped.
    pub fn post_data(&self, record: &Map<String, Value>) -> Result<()> {
        self.ensure_connected()?;
        let shared = &self.shared;
        let named = shared.topics.dialect() == WireDialect::Named;
        let time = now_ms();

        let mut properties = Map::new();
        let mut events = Vec::new();
        for (key, value) in record {
            if value.is_null() {
                debug!("Session: skipping null value for {}", key);
                continue;
            }
            let Some(domain) = shared.model.domain_of(key) else {
                warn!("Session: '{}' is neither a property nor an event, skipped", key);
                continue;
            };
            let (wire, encoded) = shared.model.encode(key, value)?;
            match domain {
                Domain::Property if named => {
                    properties.insert(wire, serde_json::json!({ "value": encoded, "time": time }));
                }
                Domain::Property => {
                    properties.insert(wire, encoded);
                }
                Domain::Event => {
                    let params = if named {
                        serde_json::json!({ "value": encoded, "time": time })
                    } else {
                        let mut m = Map::new();
                        m.insert(wire.clone(), encoded);
                        Value::Object(m)
                    };
                    events.push((wire, params));
                }
            }
        }

        let mut outgoing: Vec<(MessageId, String, PostEnvelope)> =
            Vec::with_capacity(events.len() + 1);
        if !properties.is_empty() {
            let id = shared.correlator.next_id();
            outgoing.push((
                id,
                shared.topics.property_post(),
                PostEnvelope::property(id, Value::Object(properties)),
            ));
        }
        for (wire, params) in events {
            let id = shared.correlator.next_id();
            outgoing.push((
                id,
                shared.topics.event_post(&wire),
                PostEnvelope::event(id, &wire, params),
            ));
        }

        if outgoing.is_empty() {
            debug!("Session: nothing to post");
            return Ok(());
        }

        for (_, topic, frame) in &outgoing {
            shared.publish_json(topic, frame)?;
        }

        let ids: Vec<MessageId> = outgoing.iter().map(|(id, ..)| *id).collect();
        self.await_all(&ids)
    }

    /// Send the reply to an RPC request. String payloads go out verbatim.
    pub fn respond_rpc(&self, request_id: &str, payload: &Value) -> Result<()> {
        if request_id.is_empty() {
            return Err(Error::InvalidState("RPC request id must not be empty"));
        }
        self.ensure_connected()?;
        let topic = self.shared.topics.rpc_response(request_id);
        let bytes = match payload {
            Value::String(s) => s.clone().into_bytes(),
            other => serde_json::to_vec(other)?,
        };
        if self.shared.transport.publish(&topic, &bytes, PUBLISH_QOS) {
            debug!("Session: RPC {} answered", request_id);
            Ok(())
        } else {
            warn!("Session: RPC {} response publish failed", request_id);
            Err(Error::TransportFailure("publish"))
        }
    }

    /// Report the MCU and firmware versions on the OTA inform topic.
    ///
    /// Both reports are attempted; the first failure is returned.
    pub fn report_device_info(&self) -> Result<()> {
        self.ensure_connected()?;
        let cfg = &self.shared.config;
        let topic = self.shared.topics.ota_inform();
        let mut outcome = Ok(());
        for (module, version) in [
            (&cfg.mcu_name, &cfg.mcu_version),
            (&cfg.firmware_name, &cfg.firmware_version),
        ] {
            if module.is_empty() {
                debug!("Session: no module name configured, inform skipped");
                continue;
            }
            let frame = OtaEnvelope {
                id: self.shared.correlator.next_id().to_string(),
                params: InformParams {
                    version: version.as_str(),
                    module: module.as_str(),
                },
            };
            info!("Session: inform {} {}", module, version);
            if let Err(e) = self.shared.publish_json(&topic, &frame) {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }

    /// Ask the cloud for pending upgrade plans of both modules.
    ///
    /// Replies carrying an image are routed like announcements.
    pub fn request_ota(&self) -> Result<()> {
        self.ensure_connected()?;
        let cfg = &self.shared.config;
        let topic = self.shared.topics.firmware_get();
        let mut ids = Vec::new();
        let mut outcome = Ok(());
        for module in [&cfg.mcu_name, &cfg.firmware_name] {
            if module.is_empty() {
                continue;
            }
            let id = self.shared.correlator.next_id();
            match self
                .shared
                .publish_json(&topic, &PostEnvelope::firmware_get(id, module))
            {
                Ok(()) => ids.push(id),
                Err(e) => {
                    if outcome.is_ok() {
                        outcome = Err(e);
                    }
                }
            }
        }
        let awaited = self.await_all(&ids);
        outcome.and(awaited)
    }

    /// Ask the cloud for one block of an OTA file over MQTT.
    ///
    /// `params` carries the file token, file info and block range as the
    /// cloud expects them. Blocks arrive as
    /// [`CloudEvent::FileDownload`](crate::events::CloudEvent::FileDownload).
    pub fn ota_file_download(&self, params: &Value) -> Result<()> {
        self.ensure_connected()?;
        let id = self.shared.correlator.next_id();
        let frame = RequestEnvelope::new(id, params.clone());
        self.shared
            .publish_json(&self.shared.topics.file_download(), &frame)?;
        debug!("Session: file block {} requested", id);
        self.await_all(&[id])
    }

    /// Confirm or cancel the announced upgrade of `module`.
    pub fn ota_action(&self, confirm: bool, module: &str) -> Result<()> {
        if module.is_empty() {
            return Err(Error::InvalidState("OTA module must not be empty"));
        }

        if confirm {
            let image = self.ota.ready_to_start(module)?;
            self.shared
                .report_progress(module, STEP_CONFIRMED, CONFIRM_DESC)?;
            if let Err(e) = self.ota.start() {
                warn!("Session: upgrade of {} confirmed but not started: {}", module, e);
                if let Err(report) = self.shared.report_progress(
                    module,
                    FailureCode::Generic.step(),
                    &e.to_string(),
                ) {
                    warn!("Session: start failure not reported: {}", report);
                }
                return Err(e.into());
            }
            info!("Session: upgrade of {} {} confirmed", module, image.version);
            Ok(())
        } else {
            self.ota.cancel()?;
            info!("Session: upgrade of {} cancelled by user", module);
            self.shared
                .report_progress(module, STEP_USER_CANCEL, CANCEL_DESC)
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.shared.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Wait for every id against a single shared deadline.
    /// Returns the first failure after all ids were waited on.
    fn await_all(&self, ids: &[MessageId]) -> Result<()> {
        let deadline = Instant::now() + self.shared.config.publish_timeout();
        let mut outcome = Ok(());
        for &id in ids {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(e) = self.shared.correlator.wait_for(id, remaining) {
                warn!("Session: message {} not acknowledged: {}", id, e);
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }
}
