//! Inbound routing — one decoded [`Inbound`] in, at most one side effect out.
//!
//! ```text
//!  transport callback ──▶ decode_inbound ──▶ Reply ─────────▶ correlator.resolve
//!                                         ├─ Announcement ─▶ resolve + OTA announce + notify
//!                                         ├─ FileDownload ─▶ resolve + notify
//!                                         ├─ PropertySet ──▶ model.decode ──▶ notify
//!                                         ├─ RpcRequest ───▶ notify
//!                                         ├─ Query ────────▶ reverse_lookup ──▶ notify
//!                                         └─ Raw ──────────▶ notify
//! ```
//!
//! Runs on whatever thread the transport delivers on. Nothing here blocks
//! beyond short lock holds; OTA work is handed to its own thread.

use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::{Map, Value};

use super::envelope::{Inbound, decode_inbound, parse_announcement};
use super::Shared;
use crate::dispatcher::EventDispatcher;
use crate::events::{CloudEvent, OtaStatus};
use crate::model::WireId;
use crate::model::schema::WireDialect;
use crate::ota::OtaOrchestrator;
use crate::transport::TransportClient;

pub(crate) struct Router<T: TransportClient> {
    pub(crate) shared: Arc<Shared<T>>,
    pub(crate) dispatcher: Arc<EventDispatcher>,
    pub(crate) ota: OtaOrchestrator,
}

impl<T: TransportClient> Router<T> {
    pub(crate) fn handle(&self, topic: &str, payload: &[u8]) {
        let inbound = match decode_inbound(topic, payload) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Session: dropping message on {}: {}", topic, e);
                return;
            }
        };

        match inbound {
            Inbound::Reply { id, success } => {
                debug!("Session: reply {} success={}", id, success);
                self.shared.correlator.resolve(id, success);
            }
            Inbound::Announcement { id, success, data } => {
                if let Some(id) = id {
                    self.shared.correlator.resolve(id, success);
                }
                match data {
                    Some(data) if success => self.announce(data),
                    Some(_) => warn!("Session: unsuccessful announcement on {}", topic),
                    None => debug!("Session: announcement without image on {}", topic),
                }
            }
            Inbound::FileDownload { id, success, data } => {
                if let Some(id) = id {
                    self.shared.correlator.resolve(id, success);
                }
                match data {
                    Some(data) if success => self.dispatcher.notify(&CloudEvent::FileDownload(data)),
                    _ => debug!("Session: file download reply without data, success={}", success),
                }
            }
            Inbound::PropertySet(params) => self.property_set(params),
            Inbound::RpcRequest { request_id, payload } => {
                info!("Session: RPC request {}", request_id);
                self.dispatcher
                    .notify(&CloudEvent::RpcRequest { request_id, payload });
            }
            Inbound::Query(ids) => self.query(&ids),
            Inbound::Raw(bytes) => {
                debug!("Session: {} raw bytes", bytes.len());
                self.dispatcher.notify(&CloudEvent::RawData(bytes));
            }
            Inbound::Ignored => debug!("Session: ignoring message on {}", topic),
        }
    }

    fn announce(&self, data: Value) {
        let image = match parse_announcement(&data) {
            Ok(image) => image,
            Err(e) => {
                warn!("Session: bad OTA announcement: {}", e);
                return;
            }
        };

        self.dispatcher.notify(&CloudEvent::OtaStatus {
            module: image.module.clone(),
            version: image.version.clone(),
            status: OtaStatus::Available,
        });
        self.dispatcher.notify(&CloudEvent::OtaConfig {
            module: image.module.clone(),
            details: data,
        });

        if let Err(e) = self.ota.announce(image) {
            warn!("Session: announcement not recorded: {}", e);
        }
    }

    fn property_set(&self, params: Map<String, Value>) {
        let model = &self.shared.model;
        let named = self.shared.topics.dialect() == WireDialect::Named;

        let mut decoded = Vec::with_capacity(params.len());
        for (wire, value) in params {
            match model.decode(&wire, &value) {
                Some(pair) => decoded.push(pair),
                // Named backends may write keys the local model never declared.
                None if named => decoded.push((wire, value)),
                None => debug!("Session: property set for unknown wire key {}", wire),
            }
        }

        if decoded.is_empty() {
            debug!("Session: property set with nothing to deliver");
            return;
        }
        self.dispatcher.notify(&CloudEvent::PropertySet(decoded));
    }

    fn query(&self, ids: &[WireId]) {
        let keys: Vec<String> = ids
            .iter()
            .filter_map(|id| self.shared.model.reverse_lookup(*id))
            .map(|(_, key)| key.to_owned())
            .collect();
        debug!("Session: query for {} of {} ids", keys.len(), ids.len());
        self.dispatcher.notify(&CloudEvent::Query(keys));
    }
}
