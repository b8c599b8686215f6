//! Wire envelopes — outbound frames and the inbound tagged decode.
//!
//! Outbound:
//!
//! ```text
//! post     {"id":"7","version":"1.0","sys":{"ack":1},"params":{..},"method":"thing.event.property.post"}
//! ota      {"id":"8","params":{"version":"1.2","module":"fw"}}
//! request  {"id":"9","version":"1.0","params":{..}}
//! reply    {"id":"7","code":200,"data":{..}}
//! ```
//!
//! Inbound payloads are decoded exactly once, here, into [`Inbound`];
//! nothing downstream inspects raw JSON keys. Ids and codes are accepted
//! both as JSON numbers and as numeric strings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::topics::{
    FILE_DOWNLOAD_REPLY_SUFFIX, FIRMWARE_GET_REPLY_SUFFIX, MODEL_QUERY_SUFFIX, POST_REPLY_SUFFIX,
    PROPERTY_SET_SUFFIX, RAW_DOWN_SUFFIX, RPC_REQUEST_MARKER, UPGRADE_PREFIX,
};
use crate::correlator::MessageId;
use crate::error::Error;
use crate::model::WireId;
use crate::ota::{ImagePart, OtaImage};

pub const PROTOCOL_VERSION: &str = "1.0";
pub const METHOD_PROPERTY_POST: &str = "thing.event.property.post";
pub const METHOD_PROPERTY_SET: &str = "thing.service.property.set";
pub const METHOD_FIRMWARE_GET: &str = "thing.ota.firmware.get";

/// Reply code meaning success for posts and plan requests.
pub const CODE_OK: i64 = 200;
/// Reply code meaning success for upgrade announcements.
pub const CODE_UPGRADE_OK: i64 = 1000;

// ── Outbound ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SysFlags {
    pub ack: u8,
}

/// Request envelope for property/event posts and OTA plan requests.
#[derive(Debug, Clone, Serialize)]
pub struct PostEnvelope {
    pub id: String,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sys: Option<SysFlags>,
    pub params: Value,
    pub method: String,
}

impl PostEnvelope {
    pub fn property(id: MessageId, params: Value) -> Self {
        Self {
            id: id.to_string(),
            version: PROTOCOL_VERSION,
            sys: Some(SysFlags { ack: 1 }),
            params,
            method: METHOD_PROPERTY_POST.to_owned(),
        }
    }

    pub fn event(id: MessageId, event: &str, params: Value) -> Self {
        Self {
            id: id.to_string(),
            version: PROTOCOL_VERSION,
            sys: Some(SysFlags { ack: 1 }),
            params,
            method: format!("thing.event.{event}.post"),
        }
    }

    pub fn firmware_get(id: MessageId, module: &str) -> Self {
        Self {
            id: id.to_string(),
            version: PROTOCOL_VERSION,
            sys: None,
            params: serde_json::json!({ "module": module }),
            method: METHOD_FIRMWARE_GET.to_owned(),
        }
    }
}

/// Method-less request, used for OTA file block downloads.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEnvelope {
    pub id: String,
    pub version: &'static str,
    pub params: Value,
}

impl RequestEnvelope {
    pub fn new(id: MessageId, params: Value) -> Self {
        Self {
            id: id.to_string(),
            version: PROTOCOL_VERSION,
            params,
        }
    }
}

/// `{id, params}` envelope used by OTA inform and progress.
#[derive(Debug, Clone, Serialize)]
pub struct OtaEnvelope<P> {
    pub id: String,
    pub params: P,
}

#[derive(Debug, Clone, Serialize)]
pub struct InformParams<'a> {
    pub version: &'a str,
    pub module: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressParams<'a> {
    pub step: i32,
    pub desc: &'a str,
    pub module: &'a str,
}

// ── Inbound ───────────────────────────────────────────────────

/// An inbound message, classified by topic and decoded once.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to a property or event post.
    Reply { id: MessageId, success: bool },
    /// Upgrade announcement or reply to a plan request.
    Announcement {
        id: Option<MessageId>,
        success: bool,
        data: Option<Value>,
    },
    /// Reply to an OTA file block request.
    FileDownload {
        id: Option<MessageId>,
        success: bool,
        data: Option<Value>,
    },
    /// Cloud wrote properties; keys are still wire keys.
    PropertySet(Map<String, Value>),
    /// Synchronous command; `request_id` comes from the topic.
    RpcRequest { request_id: String, payload: Value },
    /// Cloud asked for these properties by wire id.
    Query(Vec<WireId>),
    /// Opaque passthrough bytes.
    Raw(Vec<u8>),
    /// A topic the session does not handle.
    Ignored,
}

#[derive(Deserialize)]
struct Frame {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    code: Value,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QueryFrame {
    Ids(Vec<WireId>),
    Wrapped { params: Vec<WireId> },
}

/// Numeric id from a JSON number or numeric string.
pub fn parse_id(v: &Value) -> Option<MessageId> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_code(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn frame(payload: &[u8]) -> Result<Frame, Error> {
    Ok(serde_json::from_slice(payload)?)
}

/// Classify `topic` and decode `payload` accordingly.
pub fn decode_inbound(topic: &str, payload: &[u8]) -> Result<Inbound, Error> {
    if topic.ends_with(POST_REPLY_SUFFIX) {
        let f = frame(payload)?;
        let id = parse_id(&f.id).ok_or_else(|| Error::Decode("reply without id".into()))?;
        return Ok(Inbound::Reply {
            id,
            success: parse_code(&f.code) == Some(CODE_OK),
        });
    }

    if topic.starts_with(UPGRADE_PREFIX) || topic.ends_with(FIRMWARE_GET_REPLY_SUFFIX) {
        let f = frame(payload)?;
        let ok_code = if topic.starts_with(UPGRADE_PREFIX) {
            CODE_UPGRADE_OK
        } else {
            CODE_OK
        };
        let data = match f.data {
            Value::Object(m) if !m.is_empty() => Some(Value::Object(m)),
            _ => None,
        };
        return Ok(Inbound::Announcement {
            id: parse_id(&f.id),
            success: parse_code(&f.code) == Some(ok_code),
            data,
        });
    }

    if topic.ends_with(FILE_DOWNLOAD_REPLY_SUFFIX) {
        let f = frame(payload)?;
        return Ok(Inbound::FileDownload {
            id: parse_id(&f.id),
            success: parse_code(&f.code) == Some(CODE_OK),
            data: (!f.data.is_null()).then_some(f.data),
        });
    }

    if topic.ends_with(PROPERTY_SET_SUFFIX) {
        let f = frame(payload)?;
        if f.method.as_deref().is_some_and(|m| m != METHOD_PROPERTY_SET) {
            return Ok(Inbound::Ignored);
        }
        return match f.params {
            Value::Object(params) => Ok(Inbound::PropertySet(params)),
            _ => Err(Error::Decode("property set without params object".into())),
        };
    }

    if topic.contains(RPC_REQUEST_MARKER) {
        let request_id = topic.rsplit('/').next().unwrap_or_default().to_owned();
        if request_id.is_empty() {
            return Err(Error::Decode("RPC request without id".into()));
        }
        let payload = serde_json::from_slice(payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()));
        return Ok(Inbound::RpcRequest { request_id, payload });
    }

    if topic.ends_with(MODEL_QUERY_SUFFIX) {
        let ids = match serde_json::from_slice::<QueryFrame>(payload)? {
            QueryFrame::Ids(ids) | QueryFrame::Wrapped { params: ids } => ids,
        };
        return Ok(Inbound::Query(ids));
    }

    if topic.ends_with(RAW_DOWN_SUFFIX) {
        return Ok(Inbound::Raw(payload.to_vec()));
    }

    Ok(Inbound::Ignored)
}

// ── Announcement data ─────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnouncementData {
    #[serde(default)]
    module: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    url: String,
    #[serde(default)]
    md5: String,
    #[serde(default)]
    files: Vec<AnnouncedFile>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnouncedFile {
    #[serde(default)]
    file_size: u64,
    file_url: String,
    #[serde(default)]
    file_md5: String,
}

/// Build an [`OtaImage`] from announcement `data`.
///
/// Multi-file announcements list `files`; single-file ones carry
/// `size`/`url`/`md5` at the top level. A missing module means `"default"`.
pub fn parse_announcement(data: &Value) -> Result<OtaImage, Error> {
    let d = AnnouncementData::deserialize(data)?;
    let module = if d.module.is_empty() {
        "default".to_owned()
    } else {
        d.module
    };

    let parts: Vec<ImagePart> = if d.files.is_empty() {
        if d.url.is_empty() {
            return Err(Error::Decode("announcement without url".into()));
        }
        vec![ImagePart {
            url: d.url,
            size: d.size,
            checksum: d.md5.to_ascii_lowercase(),
        }]
    } else {
        d.files
            .into_iter()
            .map(|f| ImagePart {
                url: f.file_url,
                size: f.file_size,
                checksum: f.file_md5.to_ascii_lowercase(),
            })
            .collect()
    };

    Ok(OtaImage::new(module, d.version, parts)?)
}
