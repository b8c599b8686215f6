//! Fuzz target: inbound topic classification and payload decoding.
//!
//! The first byte picks a topic; the rest is the payload. Announcements
//! that decode are also turned into images.
//!
//! cargo fuzz run fuzz_inbound_envelope

#![no_main]

use libfuzzer_sys::fuzz_target;
use thinglink::session::envelope::{Inbound, decode_inbound, parse_announcement};

const TOPICS: [&str; 8] = [
    "/sys/pk/dn/thing/event/property/post_reply",
    "/sys/pk/dn/thing/service/property/set",
    "/ota/device/upgrade/pk/dn",
    "/sys/pk/dn/thing/ota/firmware/get_reply",
    "/sys/pk/dn/rrpc/request/42",
    "/sys/pk/dn/thing/model/query",
    "/sys/pk/dn/thing/raw/down",
    "/sys/pk/dn/thing/file/download_reply",
];

fuzz_target!(|data: &[u8]| {
    let Some((&selector, payload)) = data.split_first() else {
        return;
    };
    let topic = TOPICS[selector as usize % TOPICS.len()];

    if let Ok(Inbound::Announcement { data: Some(data), .. }) = decode_inbound(topic, payload) {
        if let Ok(image) = parse_announcement(&data) {
            assert!(image.parts.len() <= thinglink::ota::MAX_PARTS);
        }
    }
});
