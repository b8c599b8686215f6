//! Unified error type for the cloud connectivity core.
//!
//! Every fallible operation funnels into [`Error`]. Subsystems with a richer
//! vocabulary (OTA, archive unpacking) keep their own enums and convert into
//! this one at the session boundary, so callers only ever match on a single
//! type. Only the variant and its text ever cross the cloud boundary.

use core::fmt;

use crate::correlator::MessageId;

/// Every fallible operation in the crate funnels into this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The semantic key is neither a declared property nor a declared event.
    UnknownKey(String),
    /// No reply arrived for the message before its deadline.
    Timeout(MessageId),
    /// The cloud replied, but with a failure code.
    Rejected(MessageId),
    /// A publish or subscribe call was refused by the transport.
    TransportFailure(&'static str),
    /// Downloaded content did not match the declared checksum.
    VerificationFailure,
    /// The update archive or flash target could not be written.
    UnpackFailure(String),
    /// The transport could not establish a connection.
    ConnectFailure,
    /// An operation needs a connected session.
    NotConnected,
    /// An OTA transfer is in flight and cannot be replaced.
    OtaBusy,
    /// The operation is not valid in the current state.
    InvalidState(&'static str),
    /// The object model schema is malformed.
    Schema(String),
    /// An inbound payload could not be decoded.
    Decode(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKey(key) => write!(f, "unknown object model key: {key}"),
            Self::Timeout(id) => write!(f, "no reply for message {id}"),
            Self::Rejected(id) => write!(f, "cloud rejected message {id}"),
            Self::TransportFailure(op) => write!(f, "transport {op} failed"),
            Self::VerificationFailure => write!(f, "checksum verification failed"),
            Self::UnpackFailure(msg) => write!(f, "unpack failed: {msg}"),
            Self::ConnectFailure => write!(f, "transport connect failed"),
            Self::NotConnected => write!(f, "session not connected"),
            Self::OtaBusy => write!(f, "OTA transfer already in progress"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::Schema(msg) => write!(f, "schema: {msg}"),
            Self::Decode(msg) => write!(f, "decode: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
