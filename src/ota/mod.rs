//! OTA orchestration — announce → download → verify → install → restart.
//!
//! ```text
//!  Idle ──announce──▶ Announced ──start──▶ Downloading ──▶ Verifying ──▶ Installing ──▶ Completed
//!                       │  ▲                   │              │             │ (next part)
//!                       │  └─announce          ├──cancel──▶ Cancelled       └──▶ Downloading
//!                       └──cancel──────────────┘
//!        any non-terminal stage ──error──▶ Failed(code)
//! ```
//!
//! Two install paths exist, chosen by the announced module name:
//!
//! - **Composite** (`firmware_name`): each part is a gzip tar archive,
//!   downloaded to `archive_path`, MD5-checked, unpacked into the staging
//!   root and registered with the platform updater; the device restarts.
//! - **MCU** (`mcu_name`): bytes stream through fixed-size blocks into the
//!   [`McuFlasher`](ports::McuFlasher), are MD5-checked and committed; the
//!   update flag is set and observers learn a restart is pending.
//!
//! The transfer runs on its own thread so inbound dispatch never blocks on
//! network or flash I/O. A new announcement while bytes are moving, or
//! while a cancelled worker is still unwinding, is refused with
//! [`OtaError::Busy`]; the flasher and archive path are only ever touched
//! by one worker.

pub mod archive;
pub mod codes;
pub mod ports;
mod transfer;

use core::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use log::{info, warn};

use crate::config::OtaConfig;
use crate::correlator::CancelToken;
use crate::dispatcher::EventDispatcher;
use crate::error::Error;
use crate::events::{CloudEvent, OtaStatus};

pub use codes::FailureCode;
use ports::{Downloader, McuFlasher, ProgressReporter, UpdateRegistry};

/// Most parts a single announcement may carry.
pub const MAX_PARTS: usize = 2;

// ── Error type ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaError {
    /// A transfer is moving bytes; the request cannot be honoured now.
    Busy,
    /// No image has been announced.
    NoImage,
    /// The announced module is neither the firmware nor the MCU.
    UnknownModule,
    /// The request names a different module than the announced image.
    ModuleMismatch,
    /// The announcement has more parts than supported.
    TooManyParts,
    /// The state machine does not allow this transition.
    InvalidTransition { from: OtaState, to: OtaState },
}

impl fmt::Display for OtaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "OTA transfer already in progress"),
            Self::NoImage => write!(f, "no OTA image announced"),
            Self::UnknownModule => write!(f, "announced module is not updatable"),
            Self::ModuleMismatch => write!(f, "module does not match announced image"),
            Self::TooManyParts => write!(f, "announcement has more than {MAX_PARTS} parts"),
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid OTA transition {from:?} -> {to:?}")
            }
        }
    }
}

impl From<OtaError> for Error {
    fn from(e: OtaError) -> Self {
        match e {
            OtaError::Busy => Self::OtaBusy,
            OtaError::NoImage => Self::InvalidState("no OTA image announced"),
            OtaError::UnknownModule => Self::InvalidState("announced module is not updatable"),
            OtaError::ModuleMismatch => Self::InvalidState("module does not match announced image"),
            OtaError::TooManyParts => Self::InvalidState("too many OTA image parts"),
            OtaError::InvalidTransition { .. } => Self::InvalidState("invalid OTA transition"),
        }
    }
}

// ── State machine ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaState {
    Idle,
    Announced,
    Downloading,
    Verifying,
    Installing,
    Completed,
    Failed(FailureCode),
    Cancelled,
}

impl OtaState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }

    /// Bytes are moving or being applied.
    pub fn in_flight(self) -> bool {
        matches!(self, Self::Downloading | Self::Verifying | Self::Installing)
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        use OtaState::*;
        match (self, next) {
            (Idle | Announced | Completed | Failed(_) | Cancelled, Announced) => true,
            (Announced, Downloading) | (Installing, Downloading) => true,
            (Downloading, Verifying) | (Verifying, Installing) | (Installing, Completed) => true,
            (Announced | Downloading | Verifying | Installing, Failed(_)) => true,
            (Announced | Downloading, Cancelled) => true,
            _ => false,
        }
    }
}

// ── Image description ─────────────────────────────────────────

/// One downloadable piece of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePart {
    pub url: String,
    /// Declared size in bytes; 0 when the server did not say.
    pub size: u64,
    /// Lower-case hex MD5 of the part.
    pub checksum: String,
}

/// An announced image for one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaImage {
    pub module: String,
    pub version: String,
    pub parts: heapless::Vec<ImagePart, MAX_PARTS>,
}

impl OtaImage {
    pub fn new(
        module: impl Into<String>,
        version: impl Into<String>,
        parts: impl IntoIterator<Item = ImagePart>,
    ) -> Result<Self, OtaError> {
        let mut out = heapless::Vec::new();
        for part in parts {
            out.push(part).map_err(|_| OtaError::TooManyParts)?;
        }
        Ok(Self {
            module: module.into(),
            version: version.into(),
            parts: out,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }
}

/// Which install path an image takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPath {
    Composite,
    Mcu,
}

/// Device-side collaborators used by a transfer.
#[derive(Clone)]
pub struct OtaPorts {
    pub downloader: Arc<dyn Downloader>,
    pub flasher: Arc<dyn McuFlasher>,
    pub registry: Arc<dyn UpdateRegistry>,
}

// ── Orchestrator ──────────────────────────────────────────────

struct OtaSession {
    state: OtaState,
    image: Option<OtaImage>,
    token: CancelToken,
}

pub(crate) struct OtaCore {
    config: OtaConfig,
    firmware_name: String,
    mcu_name: String,
    ports: OtaPorts,
    reporter: Arc<dyn ProgressReporter>,
    dispatcher: Arc<EventDispatcher>,
    session: Mutex<OtaSession>,
    worker: Mutex<Option<JoinHandle<OtaState>>>,
}

impl OtaCore {
    fn lock(&self) -> MutexGuard<'_, OtaSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> OtaState {
        self.lock().state
    }

    fn install_path(&self, module: &str) -> Option<InstallPath> {
        if !self.firmware_name.is_empty() && module == self.firmware_name {
            Some(InstallPath::Composite)
        } else if !self.mcu_name.is_empty() && module == self.mcu_name {
            Some(InstallPath::Mcu)
        } else {
            None
        }
    }

    /// The last transfer thread has not exited yet.
    fn worker_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Image and install path `start` would use, if it may run now.
    fn startable(&self, session: &OtaSession) -> Result<(OtaImage, InstallPath), OtaError> {
        if session.state.in_flight() || self.worker_running() {
            return Err(OtaError::Busy);
        }
        let image = session.image.clone().ok_or(OtaError::NoImage)?;
        let path = self
            .install_path(&image.module)
            .ok_or(OtaError::UnknownModule)?;
        if !session.state.can_advance_to(OtaState::Downloading) {
            return Err(OtaError::InvalidTransition {
                from: session.state,
                to: OtaState::Downloading,
            });
        }
        Ok((image, path))
    }

    /// Move to `next` if the machine allows it from the current state.
    fn advance(&self, next: OtaState) -> Result<(), OtaError> {
        let mut session = self.lock();
        let from = session.state;
        if !from.can_advance_to(next) {
            return Err(OtaError::InvalidTransition { from, to: next });
        }
        info!("OTA: {:?} -> {:?}", from, next);
        session.state = next;
        if next.is_terminal() {
            session.image = None;
        }
        Ok(())
    }

    fn notify(&self, module: &str, version: &str, status: OtaStatus) {
        self.dispatcher.notify(&CloudEvent::OtaStatus {
            module: module.to_owned(),
            version: version.to_owned(),
            status,
        });
    }
}

/// Owns the single active OTA session of the device.
#[derive(Clone)]
pub struct OtaOrchestrator {
    core: Arc<OtaCore>,
}

impl OtaOrchestrator {
    pub fn new(
        config: OtaConfig,
        firmware_name: impl Into<String>,
        mcu_name: impl Into<String>,
        ports: OtaPorts,
        reporter: Arc<dyn ProgressReporter>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            core: Arc::new(OtaCore {
                config,
                firmware_name: firmware_name.into(),
                mcu_name: mcu_name.into(),
                ports,
                reporter,
                dispatcher,
                session: Mutex::new(OtaSession {
                    state: OtaState::Idle,
                    image: None,
                    token: CancelToken::new(),
                }),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> OtaState {
        self.core.state()
    }

    /// The announced image, if one is pending or in flight.
    pub fn image(&self) -> Option<OtaImage> {
        self.core.lock().image.clone()
    }

    /// Install path for `module`, if it is one this device updates.
    pub fn install_path(&self, module: &str) -> Option<InstallPath> {
        self.core.install_path(module)
    }

    /// Record a newly announced image.
    ///
    /// Replaces a pending announcement or a finished session; refused while
    /// a transfer is in flight.
    pub fn announce(&self, image: OtaImage) -> Result<(), OtaError> {
        let mut session = self.core.lock();
        if session.state.in_flight() {
            warn!("OTA: announcement for {} ignored, transfer in flight", image.module);
            return Err(OtaError::Busy);
        }
        if self.core.worker_running() {
            warn!("OTA: announcement for {} ignored, previous transfer still stopping", image.module);
            return Err(OtaError::Busy);
        }
        if session.state == OtaState::Announced {
            if let Some(old) = &session.image {
                info!("OTA: replacing pending image {} {}", old.module, old.version);
            }
        }
        info!(
            "OTA: announced {} {} ({} parts, {} bytes)",
            image.module,
            image.version,
            image.parts.len(),
            image.total_size()
        );
        session.state = OtaState::Announced;
        session.image = Some(image);
        Ok(())
    }

    /// Check that [`start`](Self::start) would accept the announced image
    /// for `module` right now, without starting anything.
    pub fn ready_to_start(&self, module: &str) -> Result<OtaImage, OtaError> {
        let session = self.core.lock();
        let (image, _) = self.core.startable(&session)?;
        if image.module != module {
            return Err(OtaError::ModuleMismatch);
        }
        Ok(image)
    }

    /// Start the announced transfer on a dedicated thread.
    ///
    /// Refused with [`OtaError::Busy`] until the previous worker has exited.
    pub fn start(&self) -> Result<(), OtaError> {
        let (image, token, path) = {
            let mut session = self.core.lock();
            let (image, path) = self.core.startable(&session)?;
            session.state = OtaState::Downloading;
            session.token = CancelToken::new();
            (image, session.token.clone(), path)
        };

        info!("OTA: starting {:?} transfer of {} {}", path, image.module, image.version);
        let core = Arc::clone(&self.core);
        let handle = std::thread::spawn(move || transfer::run(&core, &image, path, &token));
        *self.core.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Block until the last started transfer ends and return its final
    /// state. `None` if no transfer was started or the worker panicked.
    pub fn join(&self) -> Option<OtaState> {
        let handle = self
            .core
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        handle.join().ok()
    }

    /// Drop the pending image; stops a download in progress.
    ///
    /// Refused once verification or installation has begun.
    pub fn cancel(&self) -> Result<(), OtaError> {
        let cancelled = {
            let mut session = self.core.lock();
            match session.state {
                OtaState::Announced | OtaState::Downloading => {
                    session.token.cancel();
                    session.state = OtaState::Cancelled;
                    session.image.take()
                }
                OtaState::Verifying | OtaState::Installing => {
                    return Err(OtaError::InvalidTransition {
                        from: session.state,
                        to: OtaState::Cancelled,
                    });
                }
                _ => {
                    session.image = None;
                    None
                }
            }
        };

        if let Some(image) = cancelled {
            info!("OTA: cancelled {} {}", image.module, image.version);
            self.core.notify(&image.module, &image.version, OtaStatus::Cancelled);
        }
        Ok(())
    }
}
