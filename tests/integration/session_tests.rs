//! Integration tests for the session: connect, post/reply correlation,
//! inbound routing and RPC replies, driven through the recording transport.

use serde_json::{Map, Value, json};
use thinglink::error::Error;
use thinglink::events::{CloudEvent, OtaStatus};
use thinglink::model::schema::WireDialect;
use thinglink::model::{Domain, ObjectModel, Permission};
use thinglink::ota::OtaState;

use super::mock_transport::{Harness, MockTransport, named_model, test_config};

fn record(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        _ => panic!("record must be an object"),
    }
}

fn connected(transport: MockTransport) -> Harness {
    let h = Harness::new(test_config(), named_model(), transport);
    h.session.connect(false).unwrap();
    h
}

// ── Connect ───────────────────────────────────────────────────

#[test]
fn connect_subscribes_every_session_topic() {
    let h = connected(MockTransport::new());
    let t = h.session.topics();
    let subs = h.transport().subscribed();

    for topic in [
        t.property_set(),
        t.property_post_reply(),
        t.event_post("ev1"),
        t.event_post_reply("ev1"),
        t.ota_upgrade(),
        t.firmware_get_reply(),
        t.rpc_request_filter(),
        t.file_download_reply(),
    ] {
        assert!(subs.contains(&topic), "missing subscription {topic}");
    }
    assert!(h.session.status());

    let params = &h.transport().connects()[0];
    assert_eq!(params.username, "dn&pk");
    assert_eq!(params.password, "secret");
    assert_eq!(params.client_id, "pk.dn");
    assert_eq!(params.keepalive_secs, 120);
}

#[test]
fn connect_is_idempotent_unless_forced() {
    let h = connected(MockTransport::new());
    h.session.connect(false).unwrap();
    assert_eq!(h.transport().connects().len(), 1);

    h.session.connect(true).unwrap();
    assert_eq!(h.transport().connects().len(), 2);
}

#[test]
fn connect_failure_leaves_session_down() {
    let transport = MockTransport::new();
    transport
        .connect_ok
        .store(false, std::sync::atomic::Ordering::SeqCst);
    let h = Harness::new(test_config(), named_model(), transport);

    assert_eq!(h.session.connect(false), Err(Error::ConnectFailure));
    assert!(!h.session.status());
    assert!(h.transport().subscribed().is_empty());
}

#[test]
fn operations_before_connect_are_refused() {
    let h = Harness::new(test_config(), named_model(), MockTransport::new());
    assert_eq!(
        h.session.post_data(&record(json!({"p1": 1}))),
        Err(Error::NotConnected)
    );
    assert!(h.transport().published().is_empty());
}

// ── post_data ─────────────────────────────────────────────────

#[test]
fn property_and_event_go_out_as_separate_messages() {
    let h = connected(MockTransport::new());
    let t = h.session.topics().clone();

    h.session
        .post_data(&record(json!({"p1": 10, "ev1": {}})))
        .unwrap();

    let props = h.transport().published_json(&t.property_post());
    let events = h.transport().published_json(&t.event_post("ev1"));
    assert_eq!(props.len(), 1);
    assert_eq!(events.len(), 1);

    assert_eq!(props[0]["params"]["p1"]["value"], 10);
    assert!(props[0]["params"]["p1"]["time"].is_u64());
    assert_eq!(props[0]["method"], "thing.event.property.post");
    assert_eq!(events[0]["method"], "thing.event.ev1.post");
    assert_eq!(events[0]["params"]["value"], json!({}));
    assert_ne!(props[0]["id"], events[0]["id"]);
}

#[test]
fn properties_share_one_message() {
    let h = connected(MockTransport::new());
    let topic = h.session.topics().property_post();

    h.session
        .post_data(&record(json!({"p1": 1, "energy": 2.5})))
        .unwrap();

    let props = h.transport().published_json(&topic);
    assert_eq!(props.len(), 1);
    assert_eq!(props[0]["params"]["energy"]["value"], 2.5);
}

#[test]
fn unknown_and_null_keys_are_skipped() {
    let h = connected(MockTransport::new());

    h.session
        .post_data(&record(json!({"p1": 3, "nope": 1, "energy": null})))
        .unwrap();

    let published = h.transport().published();
    assert_eq!(published.len(), 1);
    let v: Value = serde_json::from_slice(&published[0].1).unwrap();
    assert_eq!(v["params"].as_object().unwrap().len(), 1);
}

#[test]
fn record_with_nothing_known_publishes_nothing() {
    let h = connected(MockTransport::new());
    h.session.post_data(&record(json!({"nope": 1}))).unwrap();
    assert!(h.transport().published().is_empty());
}

#[test]
fn failure_reply_code_is_rejected() {
    let h = connected(MockTransport::new());
    h.transport().set_reply_code(Some(460));

    let err = h.session.post_data(&record(json!({"p1": 1}))).unwrap_err();
    assert!(matches!(err, Error::Rejected(_)), "got {err:?}");
}

#[test]
fn missing_reply_times_out() {
    let h = connected(MockTransport::silent());

    let err = h.session.post_data(&record(json!({"p1": 1}))).unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {err:?}");
}

#[test]
fn publish_refusal_is_transport_failure() {
    let h = connected(MockTransport::new());
    h.transport()
        .publish_ok
        .store(false, std::sync::atomic::Ordering::SeqCst);

    assert_eq!(
        h.session.post_data(&record(json!({"p1": 1}))),
        Err(Error::TransportFailure("publish"))
    );
}

// ── Inbound ───────────────────────────────────────────────────

#[test]
fn property_set_reaches_observers() {
    let h = connected(MockTransport::new());
    let topic = h.session.topics().property_set();

    h.transport().deliver_json(
        &topic,
        &json!({"method": "thing.service.property.set", "params": {"p1": 5}}),
    );

    assert_eq!(
        h.events(),
        vec![CloudEvent::PropertySet(vec![("p1".into(), json!(5))])]
    );
}

#[test]
fn malformed_inbound_is_dropped() {
    let h = connected(MockTransport::new());
    let topic = h.session.topics().property_set();
    h.transport().deliver(&topic, b"{not json");
    assert!(h.events().is_empty());
}

#[test]
fn rpc_request_and_response() {
    let h = connected(MockTransport::new());

    h.transport()
        .deliver("/sys/pk/dn/rrpc/request/1234", br#"{"cmd":"reboot"}"#);
    assert_eq!(
        h.events(),
        vec![CloudEvent::RpcRequest {
            request_id: "1234".into(),
            payload: json!({"cmd": "reboot"}),
        }]
    );

    h.session.respond_rpc("1234", &json!("done")).unwrap();
    let published = h.transport().published();
    let (topic, payload) = published.last().unwrap();
    assert_eq!(topic, "/sys/pk/dn/rrpc/response/1234");
    assert_eq!(payload, b"done");
}

#[test]
fn upgrade_announcement_records_image() {
    let h = connected(MockTransport::new());
    let topic = h.session.topics().ota_upgrade();

    h.transport().deliver_json(
        &topic,
        &json!({"code": "1000", "data": {
            "module": "fw", "version": "2.0", "url": "file:///nope", "size": 10, "md5": "00"
        }}),
    );

    assert_eq!(h.session.ota().state(), OtaState::Announced);
    assert_eq!(h.session.ota().image().unwrap().version, "2.0");
    let events = h.events();
    assert_eq!(
        events[0],
        CloudEvent::OtaStatus {
            module: "fw".into(),
            version: "2.0".into(),
            status: OtaStatus::Available,
        }
    );
    assert!(matches!(&events[1], CloudEvent::OtaConfig { module, .. } if module == "fw"));
}

// ── Device info and OTA plan ──────────────────────────────────

#[test]
fn device_info_reports_both_modules() {
    let h = connected(MockTransport::new());
    h.session.report_device_info().unwrap();

    let informs = h.transport().published_json(&h.session.topics().ota_inform());
    let modules: Vec<&str> = informs
        .iter()
        .map(|v| v["params"]["module"].as_str().unwrap())
        .collect();
    assert_eq!(modules, ["mcu", "fw"]);
    assert_eq!(informs[1]["params"]["version"], "1.0.0");
}

#[test]
fn request_ota_awaits_plan_replies() {
    let h = connected(MockTransport::new());
    h.session.request_ota().unwrap();

    let requests = h.transport().published_json(&h.session.topics().firmware_get());
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0]["method"], "thing.ota.firmware.get");
    // Empty reply data carries no image.
    assert_eq!(h.session.ota().state(), OtaState::Idle);
}

#[test]
fn ota_action_needs_a_module() {
    let h = connected(MockTransport::new());
    assert!(matches!(
        h.session.ota_action(true, ""),
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        h.session.ota_action(true, "fw"),
        Err(Error::InvalidState(_))
    ));
}

// ── OTA file blocks over MQTT ─────────────────────────────────

#[test]
fn file_download_request_waits_for_its_reply() {
    let h = connected(MockTransport::new());
    let params = json!({
        "fileToken": "1bb8",
        "fileInfo": {"streamId": 1234565, "fileId": 1},
        "fileBlock": {"size": 256, "offset": 2}
    });

    h.session.ota_file_download(&params).unwrap();

    let sent = h.transport().published_json(&h.session.topics().file_download());
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["params"], params);
    assert_eq!(sent[0]["version"], "1.0");
    assert!(sent[0].get("method").is_none());
    assert_eq!(h.events(), vec![CloudEvent::FileDownload(json!({}))]);
}

#[test]
fn file_download_failure_reply_is_rejected() {
    let h = connected(MockTransport::new());
    h.transport().set_reply_code(Some(404));

    let err = h.session.ota_file_download(&json!({})).unwrap_err();
    assert!(matches!(err, Error::Rejected(_)), "got {err:?}");
    assert!(h.events().is_empty());
}

#[test]
fn file_download_reply_data_reaches_observers() {
    let h = connected(MockTransport::new());
    let topic = h.session.topics().file_download_reply();
    let data = json!({"fileToken": "1bb8", "fileBlock": {"offset": 2, "size": 256}});

    h.transport()
        .deliver_json(&topic, &json!({"id": "77", "code": 200, "data": data}));

    assert_eq!(h.events(), vec![CloudEvent::FileDownload(data)]);
}

// ── Numeric dialect ───────────────────────────────────────────

fn numeric_harness() -> Harness {
    let mut config = test_config();
    config.dialect = WireDialect::Numeric;
    let mut model = ObjectModel::new();
    model.register(Domain::Property, "temp", Some(4), Permission::ReadWrite);
    model.register(Domain::Event, "alarm", Some(9), Permission::ReadOnly);
    let h = Harness::new(config, model, MockTransport::new());
    h.session.connect(false).unwrap();
    h
}

#[test]
fn numeric_post_uses_wire_ids_without_wrapping() {
    let h = numeric_harness();
    let t = h.session.topics().clone();

    h.session
        .post_data(&record(json!({"temp": 21, "alarm": 1})))
        .unwrap();

    let props = h.transport().published_json(&t.property_post());
    assert_eq!(props[0]["params"], json!({"4": 21}));
    let events = h.transport().published_json(&t.event_post("9"));
    assert_eq!(events[0]["params"], json!({"9": 1}));
}

#[test]
fn numeric_query_and_raw() {
    let h = numeric_harness();
    let t = h.session.topics().clone();
    assert!(h.transport().subscribed().contains(&t.model_query()));

    h.transport().deliver(&t.model_query(), b"[4, 77]");
    h.transport().deliver(&t.raw_down(), &[1, 2, 3]);

    assert_eq!(
        h.events(),
        vec![
            CloudEvent::Query(vec!["temp".into()]),
            CloudEvent::RawData(vec![1, 2, 3]),
        ]
    );
}

#[test]
fn numeric_property_set_drops_unknown_ids() {
    let h = numeric_harness();
    let topic = h.session.topics().property_set();

    h.transport()
        .deliver_json(&topic, &json!({"params": {"4": 30, "55": 1}}));

    assert_eq!(
        h.events(),
        vec![CloudEvent::PropertySet(vec![("temp".into(), json!(30))])]
    );
}
