//! Transfer worker — runs on the detached OTA thread.
//!
//! Everything here blocks: downloads, hashing, unpacking and flashing.
//! The worker only touches shared state through [`OtaCore::advance`], so a
//! cancellation that lands mid-download simply makes the next transition
//! fail and the worker unwinds.
//!
//! While a part downloads, a watchdog thread fires the downloader's abort
//! token on cancel or when the transfer deadline passes, so a stalled
//! connection cannot hold the worker past `download_timeout_secs`.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use burster::Limiter;
use log::{debug, error, info, trace, warn};
use md5::{Digest, Md5};

use super::codes::{self, Description, FailureCode};
use super::ports::{DownloadError, DownloadStatus, McuFlasher, ProgressReporter};
use super::{ImagePart, InstallPath, OtaCore, OtaError, OtaImage, OtaState, archive};
use crate::correlator::CancelToken;
use crate::events::{CloudEvent, OtaStatus};

const DOWNLOADING: &str = "Downloading File.";
const DOWNLOAD_DONE: &str = "Download File Over.";
const DOWNLOAD_FAILED: &str = "Download File Failed.";

/// Longest the watchdog sleeps between checks.
const WATCHDOG_TICK: Duration = Duration::from_millis(50);

/// Why a transfer stopped early.
#[derive(Debug)]
enum Halt {
    Failed(FailureCode, Description),
    Cancelled,
}

impl Halt {
    fn failed(code: FailureCode, desc: &str) -> Self {
        Self::Failed(code, codes::bounded(desc))
    }
}

impl From<OtaError> for Halt {
    fn from(e: OtaError) -> Self {
        // The only way a worker transition is refused is a concurrent cancel.
        debug!("OTA: worker stopped: {}", e);
        Self::Cancelled
    }
}

/// Run a whole transfer and return the state it ended in.
pub(super) fn run(core: &OtaCore, image: &OtaImage, path: InstallPath, token: &CancelToken) -> OtaState {
    let on_percent = |pct: u8| core.notify(&image.module, &image.version, OtaStatus::Progress(pct));
    let mut progress = Progress::new(
        core.reporter.as_ref(),
        &image.module,
        core.config.progress_rate_per_sec,
    )
    .with_observer(&on_percent);
    core.notify(&image.module, &image.version, OtaStatus::Started);

    let deadline = Instant::now() + core.config.download_timeout();
    let result = match path {
        InstallPath::Composite => composite(core, image, token, deadline, &mut progress),
        InstallPath::Mcu => mcu(core, image, token, deadline, &mut progress),
    };

    match result {
        Ok(()) => {
            info!("OTA: {} {} installed", image.module, image.version);
            core.notify(&image.module, &image.version, OtaStatus::Installed);
            core.dispatcher.notify(&CloudEvent::RestartPending {
                module: image.module.clone(),
            });
            if path == InstallPath::Composite {
                info!("OTA: restarting to apply update");
                core.ports.registry.restart();
            }
        }
        Err(Halt::Failed(code, desc)) => {
            error!("OTA: {} failed ({}): {}", image.module, code.step(), desc);
            progress.fail(code, &desc);
            if core.advance(OtaState::Failed(code)).is_ok() {
                core.notify(&image.module, &image.version, OtaStatus::Failed(code.step()));
            }
        }
        Err(Halt::Cancelled) => {
            info!("OTA: {} transfer stopped by cancel", image.module);
        }
    }
    core.state()
}

// ── Composite image path ──────────────────────────────────────

fn composite(
    core: &OtaCore,
    image: &OtaImage,
    token: &CancelToken,
    deadline: Instant,
    progress: &mut Progress<'_>,
) -> Result<(), Halt> {
    let cfg = &core.config;
    let mut manifest = Vec::new();

    for (i, part) in image.parts.iter().enumerate() {
        if i > 0 {
            core.advance(OtaState::Downloading)?;
        }

        let digest = {
            let file = create_file(&cfg.archive_path)
                .map_err(|e| Halt::failed(FailureCode::Download, &format!("{DOWNLOAD_FAILED} {e}")))?;
            let mut sink = GuardedSink::new(BufWriter::new(file), token, deadline);
            fetch(core, part, &mut sink, token, progress)?;
            sink.digest()
        };

        core.advance(OtaState::Verifying)?;
        verify(part, &digest).inspect_err(|_| {
            if let Err(e) = fs::remove_file(&cfg.archive_path) {
                warn!("OTA: could not discard archive: {}", e);
            }
        })?;

        core.advance(OtaState::Installing)?;
        let entries = archive::unpack_gzip_file(&cfg.archive_path, &cfg.staging_root, &cfg.install_root)
            .map_err(|e| Halt::failed(FailureCode::Program, &format!("Unpack Error: {e}")))?;
        manifest.extend(entries);
    }

    let registry = &core.ports.registry;
    registry
        .register(&manifest)
        .and_then(|()| registry.set_update_flag())
        .map_err(|e| Halt::failed(FailureCode::Program, &format!("Update registration failed: {e}")))?;

    core.advance(OtaState::Completed)?;
    Ok(())
}

fn create_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(path)
}

// ── Companion MCU path ────────────────────────────────────────

fn mcu(
    core: &OtaCore,
    image: &OtaImage,
    token: &CancelToken,
    deadline: Instant,
    progress: &mut Progress<'_>,
) -> Result<(), Halt> {
    let flasher = core.ports.flasher.as_ref();

    for (i, part) in image.parts.iter().enumerate() {
        if i > 0 {
            core.advance(OtaState::Downloading)?;
        }

        let result = flash_part(core, flasher, part, token, deadline, progress);
        if result.is_err() {
            flasher.abort();
        }
        result?;
    }

    core.ports
        .registry
        .set_update_flag()
        .map_err(|e| Halt::failed(FailureCode::Program, &format!("Set update flag failed: {e}")))?;
    core.advance(OtaState::Completed)?;
    Ok(())
}

fn flash_part(
    core: &OtaCore,
    flasher: &dyn McuFlasher,
    part: &ImagePart,
    token: &CancelToken,
    deadline: Instant,
    progress: &mut Progress<'_>,
) -> Result<(), Halt> {
    let program = |e: io::Error| Halt::failed(FailureCode::Program, &format!("Programming failed: {e}"));

    flasher.begin(part.size).map_err(program)?;
    let digest = {
        let blocks = BlockSink::new(flasher, core.config.block_size, part.size);
        let mut sink = GuardedSink::new(blocks, token, deadline);
        fetch(core, part, &mut sink, token, progress)?;
        sink.digest()
    };

    core.advance(OtaState::Verifying)?;
    verify(part, &digest)?;

    core.advance(OtaState::Installing)?;
    flasher.commit().map_err(program)
}

// ── Shared download/verify steps ──────────────────────────────

/// Stream one part into `sink`, mapping every failure to a progress code.
fn fetch<W: Write>(
    core: &OtaCore,
    part: &ImagePart,
    sink: &mut GuardedSink<'_, W>,
    token: &CancelToken,
    progress: &mut Progress<'_>,
) -> Result<(), Halt> {
    let deadline = sink.deadline;
    let abort = CancelToken::new();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let mut reported_code = None;

    let (result, expired) = thread::scope(|s| {
        let dog = {
            let abort = &abort;
            s.spawn(move || watchdog(token, abort, deadline, &done_rx))
        };
        let result = core.ports.downloader.download(
            &part.url,
            sink,
            &mut |status| match status {
                DownloadStatus::Pending => trace!("OTA: download pending"),
                DownloadStatus::Active(pct) => progress.percent(pct, DOWNLOADING),
                DownloadStatus::Complete => progress.complete(DOWNLOAD_DONE),
                DownloadStatus::Failed(code) => reported_code = Some(code),
            },
            &abort,
        );
        drop(done_tx);
        (result, dog.join().unwrap_or(false))
    });
    let flushed = sink.flush();

    if token.is_cancelled() {
        return Err(Halt::Cancelled);
    }
    if expired || sink.timed_out {
        warn!("OTA: download of {} passed its deadline", part.url);
        return Err(Halt::failed(FailureCode::Generic, DOWNLOAD_FAILED));
    }

    match result {
        Err(DownloadError::Code(code)) => {
            return Err(Halt::Failed(FailureCode::Download, codes::describe_download_error(code)));
        }
        Err(DownloadError::Aborted) => {
            return Err(Halt::failed(FailureCode::Download, DOWNLOAD_FAILED));
        }
        Err(DownloadError::Io(e)) => {
            warn!("OTA: download of {} failed: {}", part.url, e);
            let desc = reported_code
                .map(codes::describe_download_error)
                .unwrap_or_else(|| codes::bounded(DOWNLOAD_FAILED));
            return Err(Halt::Failed(FailureCode::Download, desc));
        }
        Ok(_) => {}
    }
    if let Some(code) = reported_code {
        return Err(Halt::Failed(FailureCode::Download, codes::describe_download_error(code)));
    }
    if let Err(e) = flushed {
        return Err(Halt::failed(FailureCode::Download, &format!("{DOWNLOAD_FAILED} {e}")));
    }
    if part.size > 0 && sink.written != part.size {
        return Err(Halt::failed(
            FailureCode::Download,
            &format!("File size mismatch: expected {}, got {}", part.size, sink.written),
        ));
    }

    progress.complete(DOWNLOAD_DONE);
    Ok(())
}

/// Fire `abort` on user cancel or at `deadline`, until `done` hangs up.
/// Returns `true` if the deadline fired it.
fn watchdog(token: &CancelToken, abort: &CancelToken, deadline: Instant, done: &mpsc::Receiver<()>) -> bool {
    loop {
        let now = Instant::now();
        if now >= deadline {
            abort.cancel();
            return true;
        }
        if token.is_cancelled() {
            abort.cancel();
            return false;
        }
        match done.recv_timeout(WATCHDOG_TICK.min(deadline - now)) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return false,
        }
    }
}

fn verify(part: &ImagePart, digest: &str) -> Result<(), Halt> {
    if part.checksum.eq_ignore_ascii_case(digest) {
        debug!("OTA: MD5 verification passed");
        return Ok(());
    }
    Err(Halt::failed(
        FailureCode::Verification,
        &format!("MD5 Verification Failed. Cloud: {}, Device: {}", part.checksum, digest),
    ))
}

// ── Sinks ─────────────────────────────────────────────────────

/// Hashes and counts bytes; refuses writes once cancelled or past deadline.
struct GuardedSink<'a, W> {
    inner: W,
    hasher: Md5,
    written: u64,
    token: &'a CancelToken,
    deadline: Instant,
    timed_out: bool,
}

impl<'a, W: Write> GuardedSink<'a, W> {
    fn new(inner: W, token: &'a CancelToken, deadline: Instant) -> Self {
        Self {
            inner,
            hasher: Md5::new(),
            written: 0,
            token,
            deadline,
            timed_out: false,
        }
    }

    /// Lower-case hex MD5 of everything written.
    fn digest(self) -> String {
        self.hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

impl<W: Write> Write for GuardedSink<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(io::Error::other("transfer cancelled"));
        }
        if Instant::now() >= self.deadline {
            self.timed_out = true;
            return Err(io::Error::new(io::ErrorKind::TimedOut, "download deadline passed"));
        }
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Cuts the byte stream into flasher blocks; the last one holds the rest.
struct BlockSink<'a> {
    flasher: &'a dyn McuFlasher,
    block: Vec<u8>,
    block_size: usize,
    offset: u64,
    declared: u64,
}

impl<'a> BlockSink<'a> {
    fn new(flasher: &'a dyn McuFlasher, block_size: usize, declared: u64) -> Self {
        let block_size = block_size.max(1);
        Self {
            flasher,
            block: Vec::with_capacity(block_size),
            block_size,
            offset: 0,
            declared,
        }
    }

    fn emit(&mut self) -> io::Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        self.flasher.write_block(self.offset, &self.block)?;
        trace!("OTA: flashed {} bytes at {}", self.block.len(), self.offset);
        self.offset += self.block.len() as u64;
        self.block.clear();
        Ok(())
    }
}

impl Write for BlockSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let total = self.offset + self.block.len() as u64 + buf.len() as u64;
        if self.declared > 0 && total > self.declared {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "image exceeds declared size",
            ));
        }

        let room = self.block_size - self.block.len();
        let n = room.min(buf.len());
        self.block.extend_from_slice(&buf[..n]);
        if self.block.len() == self.block_size {
            self.emit()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit()
    }
}

// ── Progress reporting ────────────────────────────────────────

/// Percent reports, rate-limited; completion and failure always go out.
struct Progress<'a> {
    reporter: &'a dyn ProgressReporter,
    module: &'a str,
    limiter: burster::TokenBucket<fn() -> Duration>,
    last: Option<u8>,
    observer: Option<&'a dyn Fn(u8)>,
}

impl<'a> Progress<'a> {
    fn new(reporter: &'a dyn ProgressReporter, module: &'a str, rate_per_sec: u32) -> Self {
        let rate = rate_per_sec.max(1);
        Self {
            reporter,
            module,
            limiter: burster::TokenBucket::new_with_time_provider(
                rate.into(),
                rate.into(),
                platform_now as fn() -> Duration,
            ),
            last: None,
            observer: None,
        }
    }

    /// Also hand every percent that goes out to `observer`.
    fn with_observer(mut self, observer: &'a dyn Fn(u8)) -> Self {
        self.observer = Some(observer);
        self
    }

    fn percent(&mut self, pct: u8, desc: &str) {
        let pct = pct.min(100);
        if pct == 100 {
            self.complete(desc);
            return;
        }
        if pct == 0 || self.last.is_some_and(|last| last >= pct) {
            return;
        }
        if self.limiter.try_consume(1).is_err() {
            trace!("OTA: progress {}% throttled", pct);
            return;
        }
        self.last = Some(pct);
        self.send(i32::from(pct), desc);
        self.observe(pct);
    }

    fn complete(&mut self, desc: &str) {
        if self.last == Some(100) {
            return;
        }
        self.last = Some(100);
        self.send(100, desc);
        self.observe(100);
    }

    fn observe(&self, pct: u8) {
        if let Some(observer) = self.observer {
            observer(pct);
        }
    }

    fn fail(&mut self, code: FailureCode, desc: &str) {
        self.send(code.step(), desc);
    }

    fn send(&self, step: i32, desc: &str) {
        if !self.reporter.report(self.module, step, desc) {
            warn!("OTA: progress {} for {} not delivered", step, self.module);
        }
    }
}

fn platform_now() -> Duration {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START.get_or_init(Instant::now).elapsed()
}
