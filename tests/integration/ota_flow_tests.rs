//! Integration tests for the OTA pipeline: announce → confirm → download →
//! verify → install, over both install paths, with file-backed ports.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use flate2::Compression;
use flate2::write::GzEncoder;
use md5::{Digest, Md5};
use serde_json::json;
use thinglink::adapters::local_downloader::LocalFileDownloader;
use thinglink::correlator::CancelToken;
use thinglink::error::Error;
use thinglink::events::{CloudEvent, OtaStatus};
use thinglink::ota::ports::{DownloadError, DownloadStatus, Downloader, UpdateRegistry};
use thinglink::ota::{FailureCode, ImagePart, OtaError, OtaImage, OtaState};

use super::mock_transport::{Harness, MockTransport, named_model, test_config};

// ── Fixtures ──────────────────────────────────────────────────

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

fn tar_header(name: &str, size: usize) -> [u8; 512] {
    let mut block = [0u8; 512];
    block[..name.len()].copy_from_slice(name.as_bytes());
    let size = format!("{:011o}", size);
    block[124..124 + size.len()].copy_from_slice(size.as_bytes());
    block
}

fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut tar = Vec::new();
    for (name, body) in entries {
        tar.extend_from_slice(&tar_header(name, body.len()));
        tar.extend_from_slice(body);
        tar.resize(tar.len().div_ceil(512) * 512, 0);
    }
    tar.extend_from_slice(&[0u8; 1024]);

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&tar).unwrap();
    gz.finish().unwrap()
}

/// Write `bytes` into the harness dir and announce them for `module`.
fn announce(h: &Harness, module: &str, bytes: &[u8], md5: &str) {
    let path = h.dir.path().join(format!("{module}.img"));
    fs::write(&path, bytes).unwrap();
    let topic = h.session.topics().ota_upgrade();
    h.transport().deliver_json(
        &topic,
        &json!({"id": "1", "code": 1000, "data": {
            "module": module,
            "version": "2.0",
            "size": bytes.len(),
            "url": format!("file://{}", path.display()),
            "md5": md5,
        }}),
    );
}

fn harness() -> Harness {
    let h = Harness::new(test_config(), named_model(), MockTransport::new());
    h.session.connect(false).unwrap();
    h
}

fn statuses(h: &Harness) -> Vec<OtaStatus> {
    h.events()
        .into_iter()
        .filter_map(|e| match e {
            CloudEvent::OtaStatus { status, .. } => Some(status),
            _ => None,
        })
        .collect()
}

// ── Composite path ────────────────────────────────────────────

#[test]
fn wrong_checksum_fails_verification_and_never_installs() {
    let h = harness();
    let image = vec![0x5a_u8; 100];
    announce(&h, "fw", &image, "00000000000000000000000000000000");

    h.session.ota_action(true, "fw").unwrap();
    let end = h.session.ota().join();

    assert_eq!(end, Some(OtaState::Failed(FailureCode::Verification)));
    let statuses = statuses(&h);
    assert!(statuses.contains(&OtaStatus::Failed(-3)));
    assert!(!statuses.contains(&OtaStatus::Installed));
    assert!(h.registry.load_manifest().unwrap().is_empty());
    assert!(!h.registry.update_pending());

    let steps = h.transport().progress_steps();
    assert_eq!(steps.first().map(|(s, _)| *s), Some(1));
    let (step, desc) = steps.last().unwrap();
    assert_eq!(*step, -3);
    assert!(desc.starts_with("MD5 Verification Failed."), "{desc}");
    assert!(h.session.ota().image().is_none());
}

#[test]
fn composite_image_is_staged_registered_and_restarts() {
    let h = harness();
    let archive = tar_gz(&[("bin/app", &b"new firmware"[..]), ("etc/app.conf", &b"k=v\n"[..])]);
    announce(&h, "fw", &archive, &md5_hex(&archive).to_uppercase());

    h.session.ota_action(true, "fw").unwrap();
    assert_eq!(h.session.ota().join(), Some(OtaState::Completed));

    let cfg = &h.session.config().ota;
    assert_eq!(
        fs::read(cfg.staging_root.join("bin/app")).unwrap(),
        b"new firmware"
    );
    assert!(!cfg.archive_path.exists());

    let manifest = h.registry.load_manifest().unwrap();
    assert_eq!(manifest.len(), 2);
    assert!(manifest.iter().any(|e| e.target == cfg.install_root.join("etc/app.conf")));
    assert!(h.registry.update_pending());
    assert!(h.registry.restart_requested());

    assert!(statuses(&h).contains(&OtaStatus::Installed));
    assert!(h.events().contains(&CloudEvent::RestartPending { module: "fw".into() }));
    assert!(h.transport().progress_steps().iter().any(|(s, _)| *s == 100));
}

#[test]
fn corrupt_archive_is_a_program_failure() {
    let h = harness();
    let mut bogus = vec![0x1f, 0x8b, 8, 0, 0, 0, 0, 0, 0, 3];
    bogus.extend_from_slice(&[0xff; 64]);
    announce(&h, "fw", &bogus, &md5_hex(&bogus));

    h.session.ota_action(true, "fw").unwrap();
    assert_eq!(
        h.session.ota().join(),
        Some(OtaState::Failed(FailureCode::Program))
    );
    let (step, desc) = h.transport().progress_steps().pop().unwrap();
    assert_eq!(step, -4);
    assert!(desc.starts_with("Unpack Error"), "{desc}");
}

#[test]
fn missing_download_reports_download_code() {
    let h = harness();
    let topic = h.session.topics().ota_upgrade();
    h.transport().deliver_json(
        &topic,
        &json!({"code": 1000, "data": {
            "module": "fw", "version": "2.0", "size": 10,
            "url": "file:///no/such/image.tar.gz", "md5": "00"
        }}),
    );

    h.session.ota_action(true, "fw").unwrap();
    assert_eq!(
        h.session.ota().join(),
        Some(OtaState::Failed(FailureCode::Download))
    );
    let (step, desc) = h.transport().progress_steps().pop().unwrap();
    assert_eq!(step, -2);
    assert_eq!(desc, "FOTA_FILE_NOT_EXIST");
}

// ── MCU path ──────────────────────────────────────────────────

#[test]
fn mcu_image_streams_through_flasher() {
    let h = harness();
    let image: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
    announce(&h, "mcu", &image, &md5_hex(&image));

    h.session.ota_action(true, "mcu").unwrap();
    assert_eq!(h.session.ota().join(), Some(OtaState::Completed));

    assert_eq!(fs::read(h.flasher.image_path()).unwrap(), image);
    assert!(h.registry.update_pending());
    assert!(!h.registry.restart_requested());
    assert!(h.events().contains(&CloudEvent::RestartPending { module: "mcu".into() }));

    let statuses = statuses(&h);
    assert!(statuses.contains(&OtaStatus::Progress(100)));
    let started = statuses.iter().position(|s| *s == OtaStatus::Started).unwrap();
    let installed = statuses.iter().position(|s| *s == OtaStatus::Installed).unwrap();
    assert!(statuses[started + 1..installed]
        .iter()
        .all(|s| matches!(s, OtaStatus::Progress(_))));
}

#[test]
fn mcu_checksum_mismatch_aborts_flash() {
    let h = harness();
    let image = vec![1u8; 5000];
    announce(&h, "mcu", &image, "ffffffffffffffffffffffffffffffff");

    h.session.ota_action(true, "mcu").unwrap();
    assert_eq!(
        h.session.ota().join(),
        Some(OtaState::Failed(FailureCode::Verification))
    );
    assert!(!h.flasher.image_path().exists());
}

// ── Confirm / cancel rules ────────────────────────────────────

#[test]
fn confirm_for_other_module_is_refused() {
    let h = harness();
    announce(&h, "fw", b"abc", &md5_hex(b"abc"));
    assert!(matches!(
        h.session.ota_action(true, "mcu"),
        Err(Error::InvalidState(_))
    ));
    assert_eq!(h.session.ota().state(), OtaState::Announced);
}

#[test]
fn confirm_for_unknown_module_sends_no_progress() {
    let h = harness();
    announce(&h, "dsp", b"abc", &md5_hex(b"abc"));
    assert_eq!(h.session.ota().state(), OtaState::Announced);

    assert!(matches!(
        h.session.ota_action(true, "dsp"),
        Err(Error::InvalidState(_))
    ));
    assert!(h.transport().progress_steps().is_empty());
    assert_eq!(h.session.ota().state(), OtaState::Announced);
}

#[test]
fn cancel_before_start_discards_image() {
    let h = harness();
    announce(&h, "fw", b"abc", &md5_hex(b"abc"));

    h.session.ota_action(false, "fw").unwrap();

    assert_eq!(h.session.ota().state(), OtaState::Cancelled);
    assert!(h.session.ota().image().is_none());
    assert!(statuses(&h).contains(&OtaStatus::Cancelled));
    assert_eq!(
        h.transport().progress_steps().last().unwrap(),
        &(-1, "User cancels upgrade.".to_owned())
    );
}

/// Feeds bytes slowly until the sink refuses them.
struct TrickleDownloader;

impl Downloader for TrickleDownloader {
    fn download(
        &self,
        _url: &str,
        sink: &mut dyn Write,
        status: &mut dyn FnMut(DownloadStatus),
        _abort: &CancelToken,
    ) -> Result<u64, DownloadError> {
        status(DownloadStatus::Pending);
        let mut sent = 0u64;
        for _ in 0..2_000 {
            sink.write_all(&[0u8; 64]).map_err(DownloadError::Io)?;
            sent += 64;
            thread::sleep(Duration::from_millis(2));
        }
        Ok(sent)
    }
}

#[test]
fn cancel_mid_download_stops_worker() {
    let h = Harness::with_downloader(
        test_config(),
        named_model(),
        MockTransport::new(),
        Arc::new(TrickleDownloader),
    );
    h.session.connect(false).unwrap();
    announce(&h, "fw", b"unused", "00");

    h.session.ota_action(true, "fw").unwrap();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(h.session.ota().state(), OtaState::Downloading);

    h.session.ota_action(false, "fw").unwrap();
    assert_eq!(h.session.ota().join(), Some(OtaState::Cancelled));
    assert!(!statuses(&h).contains(&OtaStatus::Installed));
}

#[test]
fn announcement_while_downloading_is_ignored() {
    let h = Harness::with_downloader(
        test_config(),
        named_model(),
        MockTransport::new(),
        Arc::new(TrickleDownloader),
    );
    h.session.connect(false).unwrap();
    announce(&h, "fw", b"first", "00");
    h.session.ota_action(true, "fw").unwrap();
    thread::sleep(Duration::from_millis(20));

    announce(&h, "fw", b"second", "00");
    assert_eq!(h.session.ota().state(), OtaState::Downloading);
    assert_eq!(
        h.session.ota().image().unwrap().parts[0].size,
        b"first".len() as u64
    );

    h.session.ota_action(false, "fw").unwrap();
    h.session.ota().join();
}

/// First call writes a few bytes and then blocks, deaf to abort, until
/// released. Later calls read local files.
#[derive(Default)]
struct GatedDownloader {
    entered: AtomicBool,
    released: AtomicBool,
}

impl Downloader for GatedDownloader {
    fn download(
        &self,
        url: &str,
        sink: &mut dyn Write,
        status: &mut dyn FnMut(DownloadStatus),
        abort: &CancelToken,
    ) -> Result<u64, DownloadError> {
        if self.entered.swap(true, Ordering::SeqCst) {
            return LocalFileDownloader::new().download(url, sink, status, abort);
        }
        sink.write_all(&[0u8; 100]).map_err(DownloadError::Io)?;
        while !self.released.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(2));
        }
        Ok(100)
    }
}

#[test]
fn new_transfer_waits_for_cancelled_worker_to_exit() {
    let gate = Arc::new(GatedDownloader::default());
    let h = Harness::with_downloader(test_config(), named_model(), MockTransport::new(), gate.clone());
    h.session.connect(false).unwrap();

    announce(&h, "mcu", &[0u8; 200], "00");
    h.session.ota_action(true, "mcu").unwrap();
    while !gate.entered.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(1));
    }
    h.session.ota_action(false, "mcu").unwrap();
    assert_eq!(h.session.ota().state(), OtaState::Cancelled);

    // The first worker is still inside the downloader.
    let image: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
    let path = h.dir.path().join("second.img");
    fs::write(&path, &image).unwrap();
    let second = OtaImage::new(
        "mcu",
        "3.0",
        [ImagePart {
            url: path.display().to_string(),
            size: image.len() as u64,
            checksum: md5_hex(&image),
        }],
    )
    .unwrap();
    assert_eq!(h.session.ota().announce(second.clone()), Err(OtaError::Busy));
    assert_eq!(h.session.ota_action(true, "mcu"), Err(Error::OtaBusy));
    let confirms = h.transport().progress_steps().iter().filter(|(step, _)| *step == 1).count();
    assert_eq!(confirms, 1);

    gate.released.store(true, Ordering::SeqCst);
    assert_eq!(h.session.ota().join(), Some(OtaState::Cancelled));

    h.session.ota().announce(second).unwrap();
    h.session.ota_action(true, "mcu").unwrap();
    assert_eq!(h.session.ota().join(), Some(OtaState::Completed));
    assert_eq!(fs::read(h.flasher.image_path()).unwrap(), image);
}

/// Never sends a byte; only returns once aborted.
struct StalledDownloader;

impl Downloader for StalledDownloader {
    fn download(
        &self,
        _url: &str,
        _sink: &mut dyn Write,
        status: &mut dyn FnMut(DownloadStatus),
        abort: &CancelToken,
    ) -> Result<u64, DownloadError> {
        status(DownloadStatus::Pending);
        let give_up = Instant::now() + Duration::from_secs(10);
        while !abort.is_cancelled() && Instant::now() < give_up {
            thread::sleep(Duration::from_millis(5));
        }
        Err(DownloadError::Aborted)
    }
}

#[test]
fn stalled_download_times_out_with_generic_failure() {
    let mut config = test_config();
    config.ota.download_timeout_secs = 1;
    let h = Harness::with_downloader(config, named_model(), MockTransport::new(), Arc::new(StalledDownloader));
    h.session.connect(false).unwrap();
    announce(&h, "fw", b"never arrives", "00");

    let began = Instant::now();
    h.session.ota_action(true, "fw").unwrap();
    assert_eq!(
        h.session.ota().join(),
        Some(OtaState::Failed(FailureCode::Generic))
    );
    assert!(began.elapsed() < Duration::from_secs(5), "took {:?}", began.elapsed());

    assert_eq!(
        h.transport().progress_steps().last().unwrap(),
        &(-1, "Download File Failed.".to_owned())
    );
    assert!(statuses(&h).contains(&OtaStatus::Failed(-1)));

    // A timed-out transfer frees the session for the next announcement.
    announce(&h, "fw", b"next", "00");
    assert_eq!(h.session.ota().state(), OtaState::Announced);
}

// ── Registry port contract ────────────────────────────────────

#[test]
fn registry_manifest_is_replaced_atomically() {
    let h = harness();
    let entry = |name: &str| thinglink::ota::ports::ManifestEntry {
        staged: Path::new("/s").join(name),
        target: Path::new("/t").join(name),
        size: 1,
    };
    h.registry.register(&[entry("a"), entry("b")]).unwrap();
    h.registry.register(&[entry("c")]).unwrap();
    assert_eq!(h.registry.load_manifest().unwrap(), vec![entry("c")]);
}
