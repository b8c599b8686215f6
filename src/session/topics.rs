//! Topic templates for one device.
//!
//! ```text
//! /sys/{pk}/{dn}/thing/event/property/post(_reply)   property post
//! /sys/{pk}/{dn}/thing/service/property/set          cloud writes
//! /sys/{pk}/{dn}/thing/event/{event}/post(_reply)    event post
//! /ota/device/{inform,upgrade,progress}/{pk}/{dn}    OTA
//! /sys/{pk}/{dn}/thing/ota/firmware/get(_reply)      OTA plan request
//! /sys/{pk}/{dn}/thing/file/download(_reply)         OTA file blocks, named only
//! /sys/{pk}/{dn}/rrpc/request/+                      RPC (wildcard)
//! /sys/{pk}/{dn}/rrpc/response/{request_id}          RPC reply
//! /sys/{pk}/{dn}/thing/model/query                   numeric only
//! /sys/{pk}/{dn}/thing/raw/down                      numeric only
//! ```

use crate::model::schema::WireDialect;

#[derive(Debug, Clone)]
pub struct Topics {
    dialect: WireDialect,
    sys: String,
    ota_suffix: String,
}

/// Topic-classification suffixes and prefixes for inbound routing.
pub(crate) const POST_REPLY_SUFFIX: &str = "/post_reply";
pub(crate) const PROPERTY_SET_SUFFIX: &str = "/thing/service/property/set";
pub(crate) const UPGRADE_PREFIX: &str = "/ota/device/upgrade/";
pub(crate) const FIRMWARE_GET_REPLY_SUFFIX: &str = "/thing/ota/firmware/get_reply";
pub(crate) const FILE_DOWNLOAD_REPLY_SUFFIX: &str = "/thing/file/download_reply";
pub(crate) const RPC_REQUEST_MARKER: &str = "/rrpc/request/";
pub(crate) const MODEL_QUERY_SUFFIX: &str = "/thing/model/query";
pub(crate) const RAW_DOWN_SUFFIX: &str = "/thing/raw/down";

impl Topics {
    pub fn new(dialect: WireDialect, product_key: &str, device_name: &str) -> Self {
        Self {
            dialect,
            sys: format!("/sys/{product_key}/{device_name}"),
            ota_suffix: format!("{product_key}/{device_name}"),
        }
    }

    pub fn dialect(&self) -> WireDialect {
        self.dialect
    }

    pub fn property_post(&self) -> String {
        format!("{}/thing/event/property/post", self.sys)
    }

    pub fn property_post_reply(&self) -> String {
        format!("{}/thing/event/property/post_reply", self.sys)
    }

    pub fn property_set(&self) -> String {
        format!("{}{PROPERTY_SET_SUFFIX}", self.sys)
    }

    /// `event` is the wire key of the event.
    pub fn event_post(&self, event: &str) -> String {
        format!("{}/thing/event/{event}/post", self.sys)
    }

    pub fn event_post_reply(&self, event: &str) -> String {
        format!("{}/thing/event/{event}/post_reply", self.sys)
    }

    pub fn ota_inform(&self) -> String {
        format!("/ota/device/inform/{}", self.ota_suffix)
    }

    pub fn ota_upgrade(&self) -> String {
        format!("{UPGRADE_PREFIX}{}", self.ota_suffix)
    }

    pub fn ota_progress(&self) -> String {
        format!("/ota/device/progress/{}", self.ota_suffix)
    }

    pub fn firmware_get(&self) -> String {
        format!("{}/thing/ota/firmware/get", self.sys)
    }

    pub fn firmware_get_reply(&self) -> String {
        format!("{}{FIRMWARE_GET_REPLY_SUFFIX}", self.sys)
    }

    pub fn file_download(&self) -> String {
        format!("{}/thing/file/download", self.sys)
    }

    pub fn file_download_reply(&self) -> String {
        format!("{}{FILE_DOWNLOAD_REPLY_SUFFIX}", self.sys)
    }

    pub fn rpc_request_filter(&self) -> String {
        format!("{}{RPC_REQUEST_MARKER}+", self.sys)
    }

    pub fn rpc_response(&self, request_id: &str) -> String {
        format!("{}/rrpc/response/{request_id}", self.sys)
    }

    pub fn model_query(&self) -> String {
        format!("{}{MODEL_QUERY_SUFFIX}", self.sys)
    }

    pub fn raw_down(&self) -> String {
        format!("{}{RAW_DOWN_SUFFIX}", self.sys)
    }

    /// Every topic the session subscribes on connect, given the wire keys
    /// of the declared events.
    pub fn subscriptions<'a>(&self, event_keys: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut topics = vec![self.property_post_reply(), self.property_set()];
        for event in event_keys {
            topics.push(self.event_post(event));
            topics.push(self.event_post_reply(event));
        }
        topics.push(self.ota_upgrade());
        topics.push(self.firmware_get_reply());
        topics.push(self.rpc_request_filter());
        match self.dialect {
            WireDialect::Named => topics.push(self.file_download_reply()),
            WireDialect::Numeric => {
                topics.push(self.model_query());
                topics.push(self.raw_down());
            }
        }
        topics
    }
}
