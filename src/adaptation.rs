//! Bandwidth adaptation: capture constraints before the call, encoding caps
//! once the transport connects, and the one-way drop to audio-only.

use serde::{Deserialize, Serialize};

use crate::peer::media::{EncodingParameters, LocalStream, MediaTransport};
use crate::peer::types::TrackKind;
use crate::prober::NetworkQuality;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionTier {
    Low,
    Medium,
    High,
}

impl ResolutionTier {
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            ResolutionTier::Low => (320, 240),
            ResolutionTier::Medium => (640, 480),
            ResolutionTier::High => (1280, 720),
        }
    }
}

/// Capture/encoding profile requested for a session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaProfile {
    pub low_bandwidth: bool,
    pub audio_only: bool,
    #[serde(default)]
    pub max_bitrate_bps: Option<u32>,
    #[serde(default)]
    pub resolution: Option<ResolutionTier>,
}

impl Default for MediaProfile {
    fn default() -> Self {
        Self::low_bandwidth()
    }
}

impl MediaProfile {
    pub fn normal() -> Self {
        Self {
            low_bandwidth: false,
            audio_only: false,
            max_bitrate_bps: None,
            resolution: None,
        }
    }

    pub fn low_bandwidth() -> Self {
        Self {
            low_bandwidth: true,
            ..Self::normal()
        }
    }

    pub fn audio_only() -> Self {
        Self {
            low_bandwidth: true,
            audio_only: true,
            ..Self::normal()
        }
    }

    pub fn with_max_bitrate(mut self, bps: u32) -> Self {
        self.max_bitrate_bps = Some(bps);
        self
    }

    pub fn with_resolution(mut self, tier: ResolutionTier) -> Self {
        self.resolution = Some(tier);
        self
    }

    /// Pre-call default derived from the prober's advisory classification.
    pub fn for_quality(quality: NetworkQuality) -> Self {
        match quality {
            NetworkQuality::Excellent => Self::normal(),
            NetworkQuality::Good => Self::low_bandwidth(),
            NetworkQuality::Poor => Self::audio_only(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub ideal_frame_rate: u32,
    pub max_frame_rate: u32,
    pub facing_user: bool,
}

/// What to ask the capture layer for. `video: None` means no camera at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: AudioConstraints,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    pub fn wants_video(&self) -> bool {
        self.video.is_some()
    }
}

pub fn capture_constraints(profile: &MediaProfile) -> MediaConstraints {
    let audio = AudioConstraints {
        echo_cancellation: true,
        noise_suppression: true,
        auto_gain_control: true,
    };
    if profile.audio_only {
        return MediaConstraints { audio, video: None };
    }

    let mut video = if profile.low_bandwidth {
        VideoConstraints {
            ideal_width: 320,
            ideal_height: 240,
            max_width: 640,
            max_height: 480,
            ideal_frame_rate: 15,
            max_frame_rate: 24,
            facing_user: true,
        }
    } else {
        VideoConstraints {
            ideal_width: 640,
            ideal_height: 480,
            max_width: 1280,
            max_height: 720,
            ideal_frame_rate: 24,
            max_frame_rate: 30,
            facing_user: true,
        }
    };
    if let Some(tier) = profile.resolution {
        let (w, h) = tier.dimensions();
        video.ideal_width = w.min(video.max_width);
        video.ideal_height = h.min(video.max_height);
    }

    MediaConstraints {
        audio,
        video: Some(video),
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AdaptationConfig {
    pub default_video_bitrate_bps: u32,
    pub video_scale_down_by: f64,
    pub video_max_framerate: u32,
    pub audio_max_bitrate_bps: u32,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            default_video_bitrate_bps: 300_000,
            video_scale_down_by: 2.0,
            video_max_framerate: 15,
            audio_max_bitrate_bps: 32_000,
        }
    }
}

/// Encoding caps for an outgoing track, or `None` when the profile keeps the
/// transport's native encoding.
pub fn encoding_for(
    kind: TrackKind,
    profile: &MediaProfile,
    config: &AdaptationConfig,
) -> Option<EncodingParameters> {
    if !profile.low_bandwidth {
        return None;
    }
    Some(match kind {
        TrackKind::Video => EncodingParameters {
            max_bitrate_bps: Some(
                profile
                    .max_bitrate_bps
                    .unwrap_or(config.default_video_bitrate_bps),
            ),
            scale_resolution_down_by: Some(config.video_scale_down_by),
            max_framerate: Some(config.video_max_framerate),
        },
        TrackKind::Audio => EncodingParameters {
            max_bitrate_bps: Some(config.audio_max_bitrate_bps),
            scale_resolution_down_by: None,
            max_framerate: None,
        },
    })
}

/// Owns the profile for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct AdaptationController {
    config: AdaptationConfig,
    profile: MediaProfile,
    degraded: bool,
}

impl AdaptationController {
    pub fn new(config: AdaptationConfig, profile: MediaProfile) -> Self {
        Self {
            config,
            profile,
            degraded: false,
        }
    }

    pub fn profile(&self) -> &MediaProfile {
        &self.profile
    }

    pub fn set_profile(&mut self, profile: MediaProfile) {
        self.profile = profile;
    }

    pub fn capture_constraints(&self) -> MediaConstraints {
        capture_constraints(&self.profile)
    }

    /// Whether the session was ever forced down to audio-only.
    pub fn has_degraded(&self) -> bool {
        self.degraded
    }

    /// Cap every outgoing track. Failures are logged and skipped; returns the
    /// number of tracks whose parameters were accepted.
    pub async fn apply_encoding_constraints(
        &self,
        transport: &dyn MediaTransport,
        stream: &LocalStream,
    ) -> usize {
        let mut applied = 0;
        for track in stream.tracks() {
            let Some(params) = encoding_for(track.kind(), &self.profile, &self.config) else {
                continue;
            };
            match transport.set_encoding_parameters(track.id(), params).await {
                Ok(()) => {
                    tracing::info!(
                        track = track.id(),
                        kind = %track.kind(),
                        max_bitrate = ?params.max_bitrate_bps,
                        "applied bandwidth constraints"
                    );
                    applied += 1;
                }
                Err(e) => {
                    tracing::warn!(track = track.id(), error = %e, "failed to set encoding parameters");
                }
            }
        }
        applied
    }

    /// Disable outgoing video and flip the profile to audio-only. One-way:
    /// returns false if already audio-only or already degraded once.
    pub fn degrade_to_audio_only(&mut self, stream: Option<&LocalStream>) -> bool {
        if self.profile.audio_only || self.degraded {
            return false;
        }
        if let Some(stream) = stream {
            for track in stream.video_tracks() {
                track.set_enabled(false);
            }
        }
        self.profile.audio_only = true;
        self.degraded = true;
        tracing::warn!("degrading to audio-only mode due to low bandwidth");
        true
    }

    /// User-initiated return to video after a degrade.
    pub fn restore_video(&mut self) {
        if self.profile.audio_only && self.degraded {
            self.profile.audio_only = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::media::LocalTrack;
    use std::sync::Arc;

    #[test]
    fn video_requested_iff_not_audio_only() {
        for low in [false, true] {
            for audio_only in [false, true] {
                for resolution in [None, Some(ResolutionTier::Low), Some(ResolutionTier::High)] {
                    let p = MediaProfile {
                        low_bandwidth: low,
                        audio_only,
                        max_bitrate_bps: Some(100_000),
                        resolution,
                    };
                    let c = capture_constraints(&p);
                    assert_eq!(c.wants_video(), !audio_only, "{p:?}");
                    assert!(c.audio.echo_cancellation && c.audio.noise_suppression);
                    assert!(c.audio.auto_gain_control);
                }
            }
        }
    }

    #[test]
    fn low_bandwidth_caps_capture() {
        let low = capture_constraints(&MediaProfile::low_bandwidth()).video.unwrap();
        let normal = capture_constraints(&MediaProfile::normal()).video.unwrap();
        assert_eq!((low.ideal_width, low.ideal_height, low.ideal_frame_rate), (320, 240, 15));
        assert_eq!((low.max_width, low.max_frame_rate), (640, 24));
        assert_eq!((normal.ideal_width, normal.max_height, normal.max_frame_rate), (640, 720, 30));
    }

    #[test]
    fn resolution_tier_clamped_to_mode() {
        let p = MediaProfile::low_bandwidth().with_resolution(ResolutionTier::High);
        let v = capture_constraints(&p).video.unwrap();
        assert_eq!((v.ideal_width, v.ideal_height), (640, 480));
    }

    #[test]
    fn encoding_caps_follow_profile() {
        let cfg = AdaptationConfig::default();
        assert_eq!(encoding_for(TrackKind::Video, &MediaProfile::normal(), &cfg), None);

        let v = encoding_for(TrackKind::Video, &MediaProfile::low_bandwidth(), &cfg).unwrap();
        assert_eq!(v.max_bitrate_bps, Some(300_000));
        assert_eq!(v.scale_resolution_down_by, Some(2.0));
        assert_eq!(v.max_framerate, Some(15));

        let custom = MediaProfile::low_bandwidth().with_max_bitrate(150_000);
        let v = encoding_for(TrackKind::Video, &custom, &cfg).unwrap();
        assert_eq!(v.max_bitrate_bps, Some(150_000));

        let a = encoding_for(TrackKind::Audio, &custom, &cfg).unwrap();
        assert_eq!(a.max_bitrate_bps, Some(32_000));
        assert_eq!(a.max_framerate, None);
    }

    #[test]
    fn degrade_is_one_way() {
        let stream = LocalStream::new(
            "local",
            vec![
                Arc::new(LocalTrack::new("a", TrackKind::Audio)),
                Arc::new(LocalTrack::new("v", TrackKind::Video)),
            ],
        );
        let mut ctl = AdaptationController::new(AdaptationConfig::default(), MediaProfile::default());

        assert!(ctl.degrade_to_audio_only(Some(&stream)));
        assert!(ctl.profile().audio_only);
        assert!(!stream.video_tracks()[0].is_enabled());
        assert!(stream.video_tracks()[0].is_live());
        assert!(stream.audio_tracks()[0].is_enabled());

        assert!(!ctl.degrade_to_audio_only(Some(&stream)));

        ctl.restore_video();
        assert!(!ctl.profile().audio_only);
        assert!(!ctl.degrade_to_audio_only(Some(&stream)));
        assert!(ctl.has_degraded());
    }

    #[test]
    fn quality_picks_profile() {
        assert!(MediaProfile::for_quality(NetworkQuality::Poor).audio_only);
        assert!(MediaProfile::for_quality(NetworkQuality::Good).low_bandwidth);
        assert!(!MediaProfile::for_quality(NetworkQuality::Excellent).low_bandwidth);
    }
}
