//! In-process fakes for the platform boundary, used by the unit and
//! integration tests. Compiled under `#[cfg(test)]` or with the `test-util`
//! feature.
//!
//! `FakeTransport` behaves like a loopback peer connection: it hands out
//! deterministic descriptions, announces the scripted local candidates when
//! the local description is set, and reports `connected` as soon as both
//! descriptions are in place. Stats are scripted per poll.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::adaptation::MediaConstraints;
use crate::error::{MediaAccessError, TransportError};
use crate::peer::media::{
    EncodingParameters, InboundVideoStats, LocalMediaSource, LocalStream, LocalTrack, MediaTransport,
    OfferOptions, TransportConfig, TransportEvent, TransportFactory, TransportState, TransportStats,
};
use crate::peer::types::{IceCandidate, SdpType, SessionDescription, TrackKind};
use crate::utils::random_id;

/// Initialise a tracing subscriber for tests. Respects `RUST_LOG`, defaults
/// to `debug`; repeated calls are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Inbound video counters only, as most stats tests need.
pub fn video_stats(bytes_received: u64) -> TransportStats {
    TransportStats {
        inbound_video: Some(InboundVideoStats {
            bytes_received,
            ..Default::default()
        }),
        round_trip_time: None,
    }
}

/// Host candidate with a recognisable foundation.
pub fn host_candidate(n: u32) -> IceCandidate {
    IceCandidate::new(format!("candidate:{n} 1 udp 2122260223 192.0.2.{n} 5000{n} typ host"))
}

#[derive(Default)]
pub struct FakeMediaSource {
    failure: Mutex<Option<MediaAccessError>>,
    requests: Mutex<Vec<MediaConstraints>>,
    acquired: Mutex<Vec<Arc<LocalTrack>>>,
}

impl FakeMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(err: MediaAccessError) -> Self {
        let source = Self::default();
        source.set_failure(Some(err));
        source
    }

    pub fn set_failure(&self, err: Option<MediaAccessError>) {
        if let Ok(mut f) = self.failure.lock() {
            *f = err;
        }
    }

    /// Constraints of every acquire call, in order.
    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Every track ever handed out.
    pub fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.acquired.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks().iter().filter(|t| t.is_live()).count()
    }
}

#[async_trait]
impl LocalMediaSource for FakeMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaAccessError> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(*constraints);
        }
        if let Some(err) = self.failure.lock().ok().and_then(|f| f.clone()) {
            return Err(err);
        }

        let mut tracks = vec![Arc::new(LocalTrack::new(format!("audio-{}", random_id()), TrackKind::Audio))];
        if constraints.wants_video() {
            tracks.push(Arc::new(LocalTrack::new(format!("video-{}", random_id()), TrackKind::Video)));
        }
        if let Ok(mut acquired) = self.acquired.lock() {
            acquired.extend(tracks.iter().cloned());
        }
        Ok(LocalStream::new(format!("stream-{}", random_id()), tracks))
    }
}

/// Behaviour applied to every transport a [`FakeTransportFactory`] creates.
#[derive(Debug, Clone)]
pub struct FakeScript {
    pub local_candidates: Vec<IceCandidate>,
    pub stats: Vec<TransportStats>,
    pub reject_remote: bool,
    pub auto_connect: bool,
    pub fail_create: bool,
}

impl Default for FakeScript {
    fn default() -> Self {
        Self {
            local_candidates: vec![host_candidate(1)],
            stats: Vec::new(),
            reject_remote: false,
            auto_connect: true,
            fail_create: false,
        }
    }
}

#[derive(Default)]
pub struct FakeTransportFactory {
    script: Mutex<FakeScript>,
    created: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: FakeScript) -> Self {
        Self {
            script: Mutex::new(script),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn update_script(&self, f: impl FnOnce(&mut FakeScript)) {
        if let Ok(mut script) = self.script.lock() {
            f(&mut script);
        }
    }

    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.created.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn last(&self) -> Option<Arc<FakeTransport>> {
        self.transports().pop()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        config: &TransportConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let script = self
            .script
            .lock()
            .map(|s| s.clone())
            .map_err(|_| TransportError::Setup("script lock poisoned".into()))?;
        if script.fail_create {
            return Err(TransportError::Setup("fake transport refused".into()));
        }

        let transport = Arc::new(FakeTransport::new(config.clone(), script, events));
        if let Ok(mut created) = self.created.lock() {
            created.push(transport.clone());
        }
        Ok(transport)
    }
}

#[derive(Default)]
struct FakeState {
    tracks: Vec<Arc<LocalTrack>>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidate>,
    encodings: Vec<(String, EncodingParameters)>,
    offer_options: Vec<OfferOptions>,
    stats: VecDeque<TransportStats>,
    last_stats: Option<TransportStats>,
    connected: bool,
    closed: bool,
}

pub struct FakeTransport {
    id: String,
    config: TransportConfig,
    script: FakeScript,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<FakeState>,
    closes: AtomicUsize,
}

impl FakeTransport {
    fn new(config: TransportConfig, script: FakeScript, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        let state = FakeState {
            stats: script.stats.iter().cloned().collect(),
            ..Default::default()
        };
        Self {
            id: random_id(),
            config,
            script,
            events,
            state: Mutex::new(state),
            closes: AtomicUsize::new(0),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> Result<T, TransportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::Setup("fake state lock poisoned".into()))?;
        if state.closed {
            return Err(TransportError::Closed);
        }
        Ok(f(&mut state))
    }

    fn read<T: Default>(&self, f: impl FnOnce(&FakeState) -> T) -> T {
        self.state.lock().map(|s| f(&s)).unwrap_or_default()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Push a transport state change as if the network produced it.
    pub fn emit_state(&self, state: TransportState) {
        let _ = self.events.send(TransportEvent::StateChanged(state));
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.read(|s| s.applied_candidates.clone())
    }

    pub fn encodings(&self) -> Vec<(String, EncodingParameters)> {
        self.read(|s| s.encodings.clone())
    }

    pub fn offer_options(&self) -> Vec<OfferOptions> {
        self.read(|s| s.offer_options.clone())
    }

    pub fn track_kinds(&self) -> Vec<TrackKind> {
        self.read(|s| s.tracks.iter().map(|t| t.kind()).collect())
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.read(|s| s.remote.clone())
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.read(|s| s.closed)
    }

    fn maybe_connect(&self, state: &mut FakeState) {
        if self.script.auto_connect && !state.connected && state.local.is_some() && state.remote.is_some() {
            state.connected = true;
            self.emit_state(TransportState::Connecting);
            self.emit_state(TransportState::Connected);
        }
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError> {
        self.with_state(|s| s.tracks.push(track))
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, TransportError> {
        self.with_state(|s| {
            s.offer_options.push(options);
            let video = options.receive_video || s.tracks.iter().any(|t| t.kind() == TrackKind::Video);
            SessionDescription::offer(format!("v=0 fake-offer {} video={video}", self.id))
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.with_state(|s| match &s.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => {
                Ok(SessionDescription::answer(format!("v=0 fake-answer {}", self.id)))
            }
            _ => Err(TransportError::Description("no remote offer to answer".into())),
        })?
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.with_state(|s| {
            let first = s.local.is_none();
            s.local = Some(desc);
            if first {
                for candidate in &self.script.local_candidates {
                    self.emit(TransportEvent::LocalCandidate(candidate.clone()));
                }
                self.emit(TransportEvent::GatheringComplete);
            }
            self.maybe_connect(s);
        })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        if self.script.reject_remote {
            return Err(TransportError::Description("remote sdp rejected".into()));
        }
        self.with_state(|s| {
            s.remote = Some(desc);
            self.maybe_connect(s);
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.with_state(|s| {
            if s.remote.is_none() {
                return Err(TransportError::Candidate("remote description not set".into()));
            }
            s.applied_candidates.push(candidate);
            Ok(())
        })?
    }

    async fn set_encoding_parameters(
        &self,
        track_id: &str,
        params: EncodingParameters,
    ) -> Result<(), TransportError> {
        self.with_state(|s| {
            let track = s
                .tracks
                .iter()
                .find(|t| t.id() == track_id)
                .ok_or_else(|| TransportError::Encoding(format!("no sender for track {track_id}")))?;
            track.apply_encoding(params);
            s.encodings.push((track_id.to_string(), params));
            Ok(())
        })?
    }

    /// Scripted entries are consumed in order; the last one repeats.
    async fn stats(&self) -> Result<TransportStats, TransportError> {
        self.with_state(|s| {
            if let Some(next) = s.stats.pop_front() {
                s.last_stats = Some(next);
            }
            s.last_stats
                .clone()
                .ok_or_else(|| TransportError::StatsUnavailable("no stats scripted".into()))
        })?
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut s) = self.state.lock() {
            s.closed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptation::{capture_constraints, MediaProfile};

    #[tokio::test]
    async fn fake_source_honours_video_flag() {
        let source = FakeMediaSource::new();
        let stream = source
            .acquire(&capture_constraints(&MediaProfile::audio_only()))
            .await
            .unwrap();
        assert!(!stream.has_video());
        assert_eq!(source.requests().len(), 1);
        assert_eq!(source.live_tracks(), 1);
    }

    #[tokio::test]
    async fn loopback_connects_once_both_descriptions_set() {
        let factory = FakeTransportFactory::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = TransportConfig {
            ice_servers: Vec::new(),
            ice_candidate_pool_size: 10,
        };
        let transport = factory.create(&config, tx).await.unwrap();

        let offer = transport
            .create_offer(OfferOptions {
                receive_audio: true,
                receive_video: true,
            })
            .await
            .unwrap();
        transport.set_local_description(offer).await.unwrap();
        assert!(matches!(rx.recv().await, Some(TransportEvent::LocalCandidate(_))));
        assert_eq!(rx.recv().await, Some(TransportEvent::GatheringComplete));

        transport
            .set_remote_description(SessionDescription::answer("v=0 remote"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(TransportEvent::StateChanged(TransportState::Connecting)));
        assert_eq!(rx.recv().await, Some(TransportEvent::StateChanged(TransportState::Connected)));

        assert!(transport.stats().await.is_err());
        transport.close().await.unwrap();
        assert_eq!(factory.last().unwrap().close_count(), 1);
    }
}
