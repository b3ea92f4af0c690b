use std::fmt;

use serde::{Deserialize, Serialize};

use crate::adaptation::MediaProfile;
use crate::error::Error;
use crate::peer::media::LocalStream;
use crate::peer::types::{RemoteTrack, TrackKind};
use crate::stats::QualitySample;

/// Lifecycle of one media session.
///
/// `idle -> acquiring-media -> connecting -> connected <-> degraded -> ended`,
/// with `failed` reachable from `acquiring-media`, `connecting`, or a live
/// session whose transport does not recover.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Idle,
    AcquiringMedia,
    Connecting,
    Connected,
    /// Still connected, but forced down to audio-only by the adaptation policy.
    Degraded,
    Ended,
    Failed,
}

impl ConnectionState {
    /// Connected, with or without video.
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Ended | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::AcquiringMedia => "acquiring-media",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Ended => "ended",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrackInfo {
    pub id: String,
    pub kind: TrackKind,
    pub enabled: bool,
}

/// Handle to the local stream as seen by the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStreamInfo {
    pub id: String,
    pub tracks: Vec<LocalTrackInfo>,
}

impl From<&LocalStream> for LocalStreamInfo {
    fn from(stream: &LocalStream) -> Self {
        Self {
            id: stream.id().to_string(),
            tracks: stream
                .tracks()
                .iter()
                .map(|t| LocalTrackInfo {
                    id: t.id().to_string(),
                    kind: t.kind(),
                    enabled: t.is_enabled(),
                })
                .collect(),
        }
    }
}

/// Observable state of a session controller, published on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub profile: MediaProfile,
    pub local_stream: Option<LocalStreamInfo>,
    pub remote_tracks: Vec<RemoteTrack>,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    /// Transport dropped and the grace period is running.
    pub recovering: bool,
    /// Audio-only was forced by the bandwidth policy, not by a failure.
    pub degraded_by_policy: bool,
    pub last_sample: Option<QualitySample>,
    pub last_error: Option<Error>,
}

impl SessionSnapshot {
    pub fn new(profile: MediaProfile) -> Self {
        Self {
            state: ConnectionState::Idle,
            profile,
            local_stream: None,
            remote_tracks: Vec::new(),
            video_enabled: false,
            audio_enabled: false,
            recovering: false,
            degraded_by_policy: false,
            last_sample: None,
            last_error: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_live()
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::AcquiringMedia | ConnectionState::Connecting
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_counts_as_live() {
        assert!(ConnectionState::Degraded.is_live());
        assert!(!ConnectionState::Connecting.is_live());
        assert!(ConnectionState::Failed.is_terminal());
        assert_eq!(ConnectionState::AcquiringMedia.to_string(), "acquiring-media");
    }
}
