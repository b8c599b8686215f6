//! Thinglink — cloud connectivity core for IoT devices.
//!
//! ```text
//!  application ──▶ CloudSession ──▶ ObjectModel (semantic ⇄ wire keys)
//!                      │   ▲
//!                      │   └── MessageCorrelator (id → reply)
//!                      ▼
//!               TransportClient (MQTT-style, pluggable)
//!                      │
//!                      ▼ inbound
//!                   Router ──▶ EventDispatcher ──▶ CloudObserver*
//!                      └────▶ OtaOrchestrator ──▶ Downloader / McuFlasher / UpdateRegistry
//! ```
//!
//! Everything is host-testable. Device-only pieces (logger, restart) sit
//! behind the `espidf` feature inside [`adapters`].

#![deny(unused_must_use)]

pub mod adapters;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod model;
pub mod ota;
pub mod session;
pub mod transport;

pub use config::{CloudConfig, OtaConfig};
pub use correlator::{CancelToken, MessageCorrelator, MessageId};
pub use dispatcher::{CloudObserver, EventDispatcher};
pub use error::{Error, Result};
pub use events::{Category, CloudEvent, OtaStatus};
pub use model::schema::WireDialect;
pub use model::{Domain, ObjectModel, Permission, WireId};
pub use ota::{OtaImage, OtaOrchestrator, OtaPorts, OtaState};
pub use session::CloudSession;
pub use transport::{ConnectParams, InboundCallback, NullTransport, TransportClient};
