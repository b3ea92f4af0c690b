//! webrtc-rs backend for [`LocalMediaSource`] and [`TransportFactory`].
//!
//! Encoded frames are pushed into the local tracks by the host capture
//! pipeline through [`LocalTrack::write_sample`]; encoding caps are stored on
//! the track for that pipeline to honor, since webrtc-rs senders do not take
//! per-encoding parameters.
//!
//! webrtc-rs 0.13 inbound RTP stats carry no `packetsLost`, `frameWidth`,
//! `frameHeight` or `framesPerSecond`. Loss is taken from the peer's
//! remote-inbound report for video, and the backend always reports the
//! resolution as `unknown` and 0 fps.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::adaptation::MediaConstraints;
use crate::error::{MediaAccessError, TransportError};
use crate::logger::dump_selected_pair;
use crate::peer::media::{
    EncodingParameters, InboundVideoStats, LocalMediaSource, LocalStream, LocalTrack, MediaTransport,
    OfferOptions, TransportConfig, TransportEvent, TransportFactory, TransportState, TransportStats,
};
use crate::peer::types::{IceCandidate, RemoteTrack, SdpType, ServerConfig, SessionDescription, TrackKind};
use crate::utils::{add_ice_url_scheme, random_id};

/// Whether the host granted a capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAccess {
    Available,
    Denied,
    Missing,
}

/// Capture source producing sample-fed Opus/VP8 tracks.
#[derive(Debug, Clone)]
pub struct RtcMediaSource {
    audio: DeviceAccess,
    video: DeviceAccess,
}

impl Default for RtcMediaSource {
    fn default() -> Self {
        Self::new(DeviceAccess::Available, DeviceAccess::Available)
    }
}

impl RtcMediaSource {
    pub fn new(audio: DeviceAccess, video: DeviceAccess) -> Self {
        Self { audio, video }
    }

    fn check(access: DeviceAccess, kind: TrackKind) -> Result<(), MediaAccessError> {
        match access {
            DeviceAccess::Available => Ok(()),
            DeviceAccess::Denied => Err(MediaAccessError::PermissionDenied(kind)),
            DeviceAccess::Missing => Err(MediaAccessError::NoDevice(kind)),
        }
    }
}

#[async_trait]
impl LocalMediaSource for RtcMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaAccessError> {
        Self::check(self.audio, TrackKind::Audio)?;
        if constraints.wants_video() {
            Self::check(self.video, TrackKind::Video)?;
        }

        let stream_id = format!("medlink-{}", random_id());
        let mut tracks = vec![Arc::new(sample_track(TrackKind::Audio, &stream_id))];
        if let Some(video) = &constraints.video {
            tracks.push(Arc::new(sample_track(TrackKind::Video, &stream_id)));
            tracing::debug!(
                width = video.ideal_width,
                height = video.ideal_height,
                fps = video.ideal_frame_rate,
                "video capture opened"
            );
        }
        Ok(LocalStream::new(stream_id, tracks))
    }
}

fn sample_track(kind: TrackKind, stream_id: &str) -> LocalTrack {
    let mime_type = match kind {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    };
    let id = format!("{kind}-{}", random_id());
    let rtc = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            ..Default::default()
        },
        id.clone(),
        stream_id.to_owned(),
    ));
    LocalTrack::with_rtc(id, kind, rtc)
}

fn rtc_config(config: &TransportConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(&config.ice_servers),
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn build_api() -> Result<API, TransportError> {
    let mut media = MediaEngine::default();
    media
        .register_default_codecs()
        .map_err(|e| TransportError::Setup(e.to_string()))?;
    let registry = register_default_interceptors(Registry::new(), &mut media)
        .map_err(|e| TransportError::Setup(e.to_string()))?;
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RtcTransportFactory;

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        config: &TransportConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let api = build_api()?;
        let pc = Arc::new(
            api.new_peer_connection(rtc_config(config))
                .await
                .map_err(|e| TransportError::Setup(e.to_string()))?,
        );
        wire_callbacks(&pc, events);
        tracing::debug!(ice_servers = config.ice_servers.len(), "peer connection created");

        Ok(Arc::new(RtcTransport {
            pc,
            tracks: Mutex::new(HashMap::new()),
        }))
    }
}

fn wire_callbacks(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<TransportEvent>) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => match c.to_json() {
                Ok(init) => {
                    let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => tracing::warn!(error = %e, "failed to serialize local candidate"),
            },
            // end of gathering
            None => {
                let _ = tx.send(TransportEvent::GatheringComplete);
            }
        }
        Box::pin(async {})
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        tracing::debug!(?state, "ice gathering state changed");
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        };
        if let Some(kind) = kind {
            let _ = tx.send(TransportEvent::RemoteTrack(RemoteTrack {
                id: track.id(),
                kind,
                stream_id: track.stream_id(),
            }));
        }
        Box::pin(async {})
    }));

    // weak so the callback does not keep its own connection alive
    let weak: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    let tx = events;
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        tracing::debug!(state = ?st, "peer connection state changed");
        let state = match st {
            RTCPeerConnectionState::New => TransportState::New,
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
            _ => return Box::pin(async {}),
        };
        let _ = tx.send(TransportEvent::StateChanged(state));

        if matches!(state, TransportState::Disconnected | TransportState::Failed) {
            if let Some(pc) = weak.upgrade() {
                return Box::pin(async move {
                    dump_selected_pair(&pc, "BEFORE-FAIL").await;
                });
            }
        }
        Box::pin(async {})
    }));
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    tracks: Mutex<HashMap<String, Arc<LocalTrack>>>,
}

impl RtcTransport {
    fn has_local_video(&self) -> bool {
        self.tracks
            .lock()
            .map(|t| t.values().any(|track| track.kind() == TrackKind::Video))
            .unwrap_or(false)
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| TransportError::Description(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(TransportError::Description(format!("unsupported sdp type {other:?}"))),
    }
}

#[async_trait]
impl MediaTransport for RtcTransport {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError> {
        let Some(rtc) = track.rtc_track() else {
            return Err(TransportError::Setup(format!("track {} has no rtp source", track.id())));
        };
        let local: Arc<dyn TrackLocal + Send + Sync> = rtc.clone();
        let sender = self
            .pc
            .add_track(local)
            .await
            .map_err(|e| TransportError::Setup(e.to_string()))?;

        // RTCP has to be drained for the interceptors to work
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        if let Ok(mut tracks) = self.tracks.lock() {
            tracks.insert(track.id().to_owned(), track);
        }
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, TransportError> {
        if options.receive_video && !self.has_local_video() {
            self.pc
                .add_transceiver_from_kind(
                    RTPCodecType::Video,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| TransportError::Description(e.to_string()))?;
        }
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn set_encoding_parameters(
        &self,
        track_id: &str,
        params: EncodingParameters,
    ) -> Result<(), TransportError> {
        let track = self
            .tracks
            .lock()
            .ok()
            .and_then(|t| t.get(track_id).cloned())
            .ok_or_else(|| TransportError::Encoding(format!("no sender for track {track_id}")))?;
        track.apply_encoding(params);
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        let report = self.pc.get_stats().await;
        if report.reports.is_empty() {
            return Err(TransportError::StatsUnavailable("empty stats report".into()));
        }

        let stats = fold_stats(report.reports.values().filter_map(|entry| match entry {
            StatsReportType::InboundRTP(rtp) => Some(StatEntry::Inbound {
                video: rtp.kind == "video",
                bytes_received: rtp.bytes_received,
            }),
            StatsReportType::RemoteInboundRTP(remote) => Some(StatEntry::RemoteInbound {
                video: remote.kind == "video",
                packets_lost: u64::try_from(remote.packets_lost).unwrap_or(0),
            }),
            StatsReportType::CandidatePair(pair) if pair.nominated => {
                Some(StatEntry::NominatedPair {
                    current_round_trip_time: pair.current_round_trip_time,
                })
            }
            _ => None,
        }));
        Ok(stats)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc
            .close()
            .await
            .map_err(|e| TransportError::Setup(e.to_string()))
    }
}

/// The parts of a webrtc-rs stats report the monitor reads.
#[derive(Debug, Clone, Copy, PartialEq)]
enum StatEntry {
    Inbound { video: bool, bytes_received: u64 },
    /// The peer's report on what it received from us.
    RemoteInbound { video: bool, packets_lost: u64 },
    NominatedPair { current_round_trip_time: f64 },
}

fn fold_stats(entries: impl IntoIterator<Item = StatEntry>) -> TransportStats {
    let mut stats = TransportStats::default();
    let mut packets_lost = 0u64;
    for entry in entries {
        match entry {
            StatEntry::Inbound { video: true, bytes_received } => {
                let video = stats.inbound_video.get_or_insert_with(InboundVideoStats::default);
                video.bytes_received += bytes_received;
            }
            StatEntry::RemoteInbound { video: true, packets_lost: lost } => {
                packets_lost += lost;
            }
            StatEntry::NominatedPair { current_round_trip_time } if current_round_trip_time > 0.0 => {
                stats.round_trip_time = Some(Duration::from_secs_f64(current_round_trip_time));
            }
            _ => {}
        }
    }
    if let Some(video) = stats.inbound_video.as_mut() {
        video.packets_lost = packets_lost;
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptation::{capture_constraints, MediaProfile};
    use crate::peer::types::IceServerKind;

    #[tokio::test]
    async fn denied_camera_only_matters_when_video_requested() {
        let source = RtcMediaSource::new(DeviceAccess::Available, DeviceAccess::Denied);

        let audio_only = capture_constraints(&MediaProfile::audio_only());
        let stream = source.acquire(&audio_only).await.unwrap();
        assert!(!stream.has_video());

        let err = source
            .acquire(&capture_constraints(&MediaProfile::normal()))
            .await
            .unwrap_err();
        assert_eq!(err, MediaAccessError::PermissionDenied(TrackKind::Video));
    }

    #[tokio::test]
    async fn missing_microphone_fails() {
        let source = RtcMediaSource::new(DeviceAccess::Missing, DeviceAccess::Available);
        let err = source
            .acquire(&capture_constraints(&MediaProfile::normal()))
            .await
            .unwrap_err();
        assert_eq!(err, MediaAccessError::NoDevice(TrackKind::Audio));
    }

    #[test]
    fn only_video_counts_toward_loss_and_bandwidth() {
        let stats = fold_stats([
            StatEntry::Inbound { video: false, bytes_received: 4_000 },
            StatEntry::Inbound { video: true, bytes_received: 90_000 },
            StatEntry::RemoteInbound { video: false, packets_lost: 40 },
            StatEntry::RemoteInbound { video: true, packets_lost: 3 },
            StatEntry::NominatedPair { current_round_trip_time: 0.125 },
        ]);
        let video = stats.inbound_video.unwrap();
        assert_eq!(video.bytes_received, 90_000);
        assert_eq!(video.packets_lost, 3);
        assert_eq!(video.frame_width, None);
        assert_eq!(stats.round_trip_time, Some(Duration::from_millis(125)));
    }

    #[test]
    fn no_inbound_video_means_no_video_stats() {
        let stats = fold_stats([
            StatEntry::RemoteInbound { video: true, packets_lost: 5 },
            StatEntry::NominatedPair { current_round_trip_time: 0.0 },
        ]);
        assert_eq!(stats, TransportStats::default());
    }

    #[test]
    fn turn_servers_keep_credentials() {
        let servers = ice_servers(&[ServerConfig {
            id: "t".into(),
            kind: IceServerKind::Turn,
            url: "turn.example.org:3478".into(),
            username: Some("user".into()),
            credential: Some("secret".into()),
        }]);
        assert_eq!(servers[0].urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(servers[0].username, "user");
        assert_eq!(servers[0].credential, "secret");
    }
}
