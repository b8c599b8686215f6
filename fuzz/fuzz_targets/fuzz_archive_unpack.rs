//! Fuzz target: gzip + tar unpacking of OTA archives.
//!
//! Feeds arbitrary bytes through the gzip decoder and the tar walker into a
//! scratch directory. Must never panic and must never write outside the
//! staging root.
//!
//! cargo fuzz run fuzz_archive_unpack

#![no_main]

use std::path::Path;

use flate2::read::GzDecoder;
use libfuzzer_sys::fuzz_target;
use thinglink::ota::archive::unpack;

fuzz_target!(|data: &[u8]| {
    let Ok(dir) = tempfile::tempdir() else {
        return;
    };
    let staging = dir.path().join("stage");

    // Raw tar stream.
    if let Ok(manifest) = unpack(data, &staging, Path::new("/usr")) {
        for entry in &manifest {
            assert!(entry.staged.starts_with(&staging), "escaped staging root");
            assert!(entry.target.starts_with("/usr"), "escaped install root");
        }
    }

    // Same bytes as a gzip member.
    let _ = unpack(GzDecoder::new(data), &staging, Path::new("/usr"));
});
