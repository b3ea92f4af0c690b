//! Platform boundary: capture sources and the negotiable media transport.
//!
//! The engine never touches devices or sockets directly. It asks a
//! [`LocalMediaSource`] for capture under [`MediaConstraints`] and drives a
//! [`MediaTransport`] built by a [`TransportFactory`]. The webrtc-rs backend
//! lives in [`crate::peer::rtc`]; fakes for tests live in `crate::testing`
//! (behind the `test-util` feature).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::adaptation::MediaConstraints;
use crate::error::{MediaAccessError, TransportError};
use crate::peer::types::{IceCandidate, RemoteTrack, ServerConfig, SessionDescription, TrackKind};

/// Per-track encoding caps, mirroring `RTCRtpEncodingParameters`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EncodingParameters {
    pub max_bitrate_bps: Option<u32>,
    pub scale_resolution_down_by: Option<f64>,
    pub max_framerate: Option<u32>,
}

/// One captured track. Disabling keeps the device open but stops media
/// from flowing; stopping releases the device.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    encoding: Mutex<Option<EncodingParameters>>,
    rtc: Option<Arc<TrackLocalStaticSample>>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            encoding: Mutex::new(None),
            rtc: None,
        }
    }

    pub(crate) fn with_rtc(id: impl Into<String>, kind: TrackKind, rtc: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            rtc: Some(rtc),
            ..Self::new(id, kind)
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// True until the track has been stopped.
    pub fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    /// Release the capture device. Returns false if it was already released.
    pub fn stop(&self) -> bool {
        let first = !self.stopped.swap(true, Ordering::SeqCst);
        if first {
            tracing::debug!(track = %self.id, kind = %self.kind, "capture track stopped");
        }
        first
    }

    /// Encoding caps the capture pipeline should honor, if any were applied.
    pub fn encoding_parameters(&self) -> Option<EncodingParameters> {
        self.encoding.lock().ok().and_then(|g| *g)
    }

    pub(crate) fn apply_encoding(&self, params: EncodingParameters) {
        if let Ok(mut guard) = self.encoding.lock() {
            *guard = Some(params);
        }
    }

    pub(crate) fn rtc_track(&self) -> Option<&Arc<TrackLocalStaticSample>> {
        self.rtc.as_ref()
    }

    /// Push one encoded frame from the capture pipeline. Frames written while
    /// the track is disabled or stopped are dropped; returns whether it was sent.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool, TransportError> {
        if !self.is_enabled() || !self.is_live() {
            return Ok(false);
        }
        let Some(rtc) = &self.rtc else {
            return Ok(false);
        };
        rtc.write_sample(&Sample {
            data,
            duration,
            ..Default::default()
        })
        .await
        .map_err(|e| TransportError::Encoding(e.to_string()))?;
        Ok(true)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Tracks acquired together from the capture layer.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.of_kind(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.of_kind(TrackKind::Video)
    }

    fn of_kind(&self, kind: TrackKind) -> Vec<Arc<LocalTrack>> {
        self.tracks
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Video)
    }

    /// Stop every track; returns how many were actually released by this call.
    pub fn stop(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

#[async_trait]
pub trait LocalMediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaAccessError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks from the transport, delivered in order on one queue.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    RemoteTrack(RemoteTrack),
    LocalCandidate(IceCandidate),
    GatheringComplete,
    StateChanged(TransportState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    pub receive_audio: bool,
    pub receive_video: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundVideoStats {
    /// Cumulative bytes received on the inbound video stream.
    pub bytes_received: u64,
    pub packets_lost: u64,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    pub frames_per_second: Option<f64>,
}

/// Raw transport statistics for one poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    pub inbound_video: Option<InboundVideoStats>,
    /// Round-trip time of the active candidate pair.
    pub round_trip_time: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub ice_candidate_pool_size: u8,
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError>;
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn set_encoding_parameters(
        &self,
        track_id: &str,
        params: EncodingParameters,
    ) -> Result<(), TransportError>;
    async fn stats(&self) -> Result<TransportStats, TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &TransportConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn MediaTransport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_releases_once() {
        let stream = LocalStream::new(
            "s",
            vec![
                Arc::new(LocalTrack::new("a", TrackKind::Audio)),
                Arc::new(LocalTrack::new("v", TrackKind::Video)),
            ],
        );
        assert!(stream.has_video());
        assert_eq!(stream.stop(), 2);
        assert_eq!(stream.stop(), 0);
        assert!(stream.tracks().iter().all(|t| !t.is_live()));
    }

    #[tokio::test]
    async fn disabled_track_drops_samples() {
        let track = LocalTrack::new("v", TrackKind::Video);
        track.set_enabled(false);
        let sent = track
            .write_sample(Bytes::from_static(b"frame"), Duration::from_millis(33))
            .await
            .unwrap();
        assert!(!sent);
    }
}
