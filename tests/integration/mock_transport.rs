//! Recording transport for integration tests.
//!
//! Stores every connect, subscribe and publish so tests can assert on the
//! full wire history. Optionally answers requests the way the cloud does, by
//! calling the inbound callback synchronously from inside `publish`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use thinglink::adapters::file_flasher::FileFlasher;
use thinglink::adapters::fs_registry::FsUpdateRegistry;
use thinglink::adapters::local_downloader::LocalFileDownloader;
use thinglink::events::CloudEvent;
use thinglink::ota::OtaPorts;
use thinglink::ota::ports::Downloader;
use thinglink::session::CloudSession;
use thinglink::config::CloudConfig;
use thinglink::model::{Domain, ObjectModel, Permission};
use thinglink::transport::{ConnectParams, InboundCallback, TransportClient};

type Callback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

#[derive(Default)]
struct Record {
    connects: Vec<ConnectParams>,
    subscribed: Vec<String>,
    published: Vec<(String, Vec<u8>)>,
}

pub struct MockTransport {
    record: Mutex<Record>,
    callback: Mutex<Option<Callback>>,
    connected: AtomicBool,
    pub connect_ok: AtomicBool,
    pub publish_ok: AtomicBool,
    /// Reply code sent back for every post; `None` means stay silent.
    pub reply_code: Mutex<Option<i64>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new() -> Self {
        Self {
            record: Mutex::new(Record::default()),
            callback: Mutex::new(None),
            connected: AtomicBool::new(false),
            connect_ok: AtomicBool::new(true),
            publish_ok: AtomicBool::new(true),
            reply_code: Mutex::new(Some(200)),
        }
    }

    pub fn silent() -> Self {
        let t = Self::new();
        *t.reply_code.lock().unwrap() = None;
        t
    }

    pub fn set_reply_code(&self, code: Option<i64>) {
        *self.reply_code.lock().unwrap() = code;
    }

    /// Push one inbound message through the installed callback.
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        let cb = self.callback.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(topic, payload);
        }
    }

    pub fn deliver_json(&self, topic: &str, payload: &Value) {
        self.deliver(topic, &serde_json::to_vec(payload).unwrap());
    }

    pub fn connects(&self) -> Vec<ConnectParams> {
        self.record.lock().unwrap().connects.clone()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.record.lock().unwrap().subscribed.clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.record.lock().unwrap().published.clone()
    }

    /// Published payloads on `topic`, parsed as JSON.
    pub fn published_json(&self, topic: &str) -> Vec<Value> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| serde_json::from_slice(&p).unwrap())
            .collect()
    }

    /// Every progress frame published on topics containing `/progress/`.
    pub fn progress_steps(&self) -> Vec<(i64, String)> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t.contains("/ota/device/progress/"))
            .map(|(_, p)| {
                let v: Value = serde_json::from_slice(&p).unwrap();
                (
                    v["params"]["step"].as_i64().unwrap(),
                    v["params"]["desc"].as_str().unwrap_or_default().to_owned(),
                )
            })
            .collect()
    }
}

impl TransportClient for MockTransport {
    fn connect(&self, params: &ConnectParams) -> bool {
        self.record.lock().unwrap().connects.push(params.clone());
        let ok = self.connect_ok.load(Ordering::SeqCst);
        self.connected.store(ok, Ordering::SeqCst);
        ok
    }

    fn subscribe(&self, topic: &str, _qos: u8) -> bool {
        self.record.lock().unwrap().subscribed.push(topic.to_owned());
        true
    }

    fn publish(&self, topic: &str, payload: &[u8], _qos: u8) -> bool {
        if !self.publish_ok.load(Ordering::SeqCst) {
            return false;
        }
        self.record
            .lock()
            .unwrap()
            .published
            .push((topic.to_owned(), payload.to_vec()));

        let code = *self.reply_code.lock().unwrap();
        if let Some(code) = code {
            if ["/post", "/firmware/get", "/file/download"]
                .iter()
                .any(|suffix| topic.ends_with(suffix))
            {
                let id = serde_json::from_slice::<Value>(payload)
                    .ok()
                    .and_then(|v| v.get("id").cloned())
                    .unwrap_or(Value::Null);
                let reply = json!({ "id": id, "code": code, "data": {} });
                self.deliver_json(&format!("{topic}_reply"), &reply);
            }
        }
        true
    }

    fn set_inbound_callback(&self, callback: InboundCallback) {
        *self.callback.lock().unwrap() = Some(Arc::from(callback));
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn status(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// ── Fixtures ──────────────────────────────────────────────────

#[allow(dead_code)]
pub fn test_config() -> CloudConfig {
    let mut c = CloudConfig::default();
    c.product_key = "pk".into();
    c.device_name = "dn".into();
    c.device_secret = "secret".into();
    c.server = "mqtt://broker.test".into();
    c.firmware_name = "fw".into();
    c.firmware_version = "1.0.0".into();
    c.mcu_name = "mcu".into();
    c.mcu_version = "0.9".into();
    c.publish_timeout_ms = 300;
    c.poll_interval_ms = 5;
    c
}

#[allow(dead_code)]
pub fn named_model() -> ObjectModel {
    let mut m = ObjectModel::new();
    m.register(Domain::Property, "p1", None, Permission::ReadWrite);
    m.register(Domain::Property, "energy", None, Permission::ReadOnly);
    m.register(Domain::Event, "ev1", None, Permission::ReadOnly);
    m
}

// ── Session harness ───────────────────────────────────────────

/// A session wired to a recording transport, file-backed OTA ports in a
/// temp dir, and an observer that keeps every event.
#[allow(dead_code)]
pub struct Harness {
    pub session: CloudSession<MockTransport>,
    pub registry: Arc<FsUpdateRegistry>,
    pub flasher: Arc<FileFlasher>,
    pub events: Arc<Mutex<Vec<CloudEvent>>>,
    pub dir: tempfile::TempDir,
}

#[allow(dead_code)]
impl Harness {
    pub fn new(config: CloudConfig, model: ObjectModel, transport: MockTransport) -> Self {
        Self::with_downloader(config, model, transport, Arc::new(LocalFileDownloader::new()))
    }

    pub fn with_downloader(
        mut config: CloudConfig,
        model: ObjectModel,
        transport: MockTransport,
        downloader: Arc<dyn Downloader>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        config.ota.staging_root = dir.path().join("stage");
        config.ota.install_root = dir.path().join("install");
        config.ota.archive_path = dir.path().join("download/sota.tar.gz");

        let registry = Arc::new(FsUpdateRegistry::new(dir.path().join("registry")));
        let flasher = Arc::new(FileFlasher::new(dir.path().join("mcu/image.bin")));
        let ports = OtaPorts {
            downloader,
            flasher: flasher.clone(),
            registry: registry.clone(),
        };

        let session = CloudSession::new(config, model, transport, ports);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        session.subscribe(Arc::new(move |e: &CloudEvent| {
            sink.lock().unwrap().push(e.clone());
        }));

        Self {
            session,
            registry,
            flasher,
            events,
            dir,
        }
    }

    pub fn transport(&self) -> &MockTransport {
        self.session.transport()
    }

    pub fn events(&self) -> Vec<CloudEvent> {
        self.events.lock().unwrap().clone()
    }
}
