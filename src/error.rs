use std::time::Duration;

use thiserror::Error;

use crate::peer::state::ConnectionState;
use crate::peer::types::TrackKind;
use crate::signaling::MessageType;

/// Capture devices could not be opened. Fatal to session start, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaAccessError {
    #[error("permission to use the {0} capture device was denied")]
    PermissionDenied(TrackKind),
    #[error("no {0} capture device available")]
    NoDevice(TrackKind),
    #[error("{kind} capture device failed: {reason}")]
    Device { kind: TrackKind, reason: String },
    #[error("capture devices did not open within {0:?}")]
    TimedOut(Duration),
}

/// Delivery through the signaling relay failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("signaling channel unavailable: {0}")]
    Unavailable(String),
    #[error("signaling relay rejected {kind} message: {reason}")]
    Rejected { kind: MessageType, reason: String },
    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload { kind: MessageType, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("no transport; create_transport must run first")]
    NoTransport,
    #[error("remote description rejected: {0}")]
    RemoteRejected(String),
    #[error("could not produce local description: {0}")]
    LocalFailed(String),
    #[error("connection not established within {0:?}")]
    Timeout(Duration),
    #[error("transport failed: {0}")]
    TransportFailed(String),
}

/// Errors reported by a [`MediaTransport`](crate::peer::media::MediaTransport) backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("description handling failed: {0}")]
    Description(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("statistics unavailable: {0}")]
    StatsUnavailable(String),
    #[error("encoding parameters rejected: {0}")]
    Encoding(String),
    #[error("transport is closed")]
    Closed,
}

/// Failures of the external session / metrics stores.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("record already exists: {0}")]
    AlreadyExists(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    MediaAccess(#[from] MediaAccessError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{op} is not allowed while {state}")]
    InvalidState {
        state: ConnectionState,
        op: &'static str,
    },
    #[error("call already in progress")]
    CallInProgress,
    #[error("session controller has shut down")]
    ControllerClosed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
