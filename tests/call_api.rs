use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use medlink::adaptation::MediaProfile;
use medlink::commands::{CallDeps, CallOptions, CallSession};
use medlink::config::EngineConfig;
use medlink::error::{Error, MediaAccessError};
use medlink::peer::types::TrackKind;
use medlink::peer::ConnectionState;
use medlink::prober::{LinkType, NetworkQuality, NetworkReport};
use medlink::session::{Session, SessionKind, SessionStatus};
use medlink::signaling::{MemorySignaling, SignalingChannel};
use medlink::store::{MemoryMetricsSink, MemorySessionStore, SessionStore};
use medlink::testing::{init_test_tracing, video_stats, FakeMediaSource, FakeScript, FakeTransportFactory};

const SESSION: &str = "consult-42";

struct Stack {
    signaling: SignalingChannel,
    metrics: Arc<MemoryMetricsSink>,
    sessions: Arc<MemorySessionStore>,
    config: Arc<EngineConfig>,
}

impl Stack {
    fn new() -> Self {
        init_test_tracing();
        Self {
            signaling: SignalingChannel::new(Arc::new(MemorySignaling::new())),
            metrics: Arc::new(MemoryMetricsSink::new()),
            sessions: Arc::new(MemorySessionStore::new()),
            config: Arc::new(EngineConfig::default()),
        }
    }

    fn call(&self, me: &str, peer: &str, initiator: bool, kind: SessionKind, stats_bytes: u64) -> (CallSession, Arc<FakeMediaSource>) {
        let media = Arc::new(FakeMediaSource::new());
        let transports = Arc::new(FakeTransportFactory::with_script(FakeScript {
            stats: vec![video_stats(stats_bytes)],
            ..FakeScript::default()
        }));
        let deps = CallDeps {
            media: media.clone(),
            transports,
            signaling: self.signaling.clone(),
            metrics: self.metrics.clone(),
            sessions: self.sessions.clone(),
        };
        let options = CallOptions {
            session_id: SESSION.into(),
            self_id: me.into(),
            remote_id: peer.into(),
            kind,
            is_initiator: initiator,
            profile: MediaProfile::low_bandwidth(),
        };
        (CallSession::new(options, self.config.clone(), deps), media)
    }
}

async fn wait_connected(call: &CallSession) {
    let controller = call.controller().unwrap();
    timeout(Duration::from_secs(10), controller.wait_for(|s| s.state == ConnectionState::Connected))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn start_and_end_updates_session_row() {
    let stack = Stack::new();
    stack
        .sessions
        .create(Session::new(SESSION, "patient", "doctor", SessionKind::Video))
        .await
        .unwrap();

    // 625_000 bytes per 5 s = 1000 kbps
    let (mut doctor, _) = stack.call("doctor", "patient", false, SessionKind::Video, 625_000);
    let (mut patient, _) = stack.call("patient", "doctor", true, SessionKind::Video, 625_000);
    doctor.start_call().await.unwrap();
    patient.start_call().await.unwrap();
    wait_connected(&patient).await;
    wait_connected(&doctor).await;

    let row = stack.sessions.get(SESSION).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Active);
    assert!(row.started_at.is_some());

    assert!(matches!(patient.start_call().await, Err(Error::CallInProgress)));

    timeout(
        Duration::from_secs(6),
        patient.controller().unwrap().wait_for(|s| s.last_sample.is_some()),
    )
    .await
    .unwrap();
    assert_eq!(patient.state().quality, NetworkQuality::Excellent);

    patient.end_call().await.unwrap();
    patient.end_call().await.unwrap();
    doctor.end_call().await.unwrap();

    let row = stack.sessions.get(SESSION).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Ended);
    assert!(row.ended_at.is_some());
    assert_eq!(patient.state().session.state, ConnectionState::Ended);
}

#[tokio::test(start_paused = true)]
async fn audio_only_session_skips_camera() {
    let stack = Stack::new();
    let (mut doctor, doctor_media) = stack.call("doctor", "patient", false, SessionKind::AudioOnly, 0);
    let (mut patient, patient_media) = stack.call("patient", "doctor", true, SessionKind::AudioOnly, 0);
    doctor.start_call().await.unwrap();
    patient.start_call().await.unwrap();
    wait_connected(&patient).await;

    for media in [&doctor_media, &patient_media] {
        assert!(media.requests().iter().all(|c| !c.wants_video()));
    }
    assert!(patient.state().session.profile.audio_only);

    // row was missing; start_call created it
    let row = stack.sessions.get(SESSION).await.unwrap().unwrap();
    assert_eq!(row.kind, SessionKind::AudioOnly);
    assert_eq!(row.initiator_id, "patient");

    patient.end_call().await.unwrap();
    doctor.end_call().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn network_report_feeds_quality_before_stats() {
    let stack = Stack::new();
    let (call, _) = stack.call("patient", "doctor", true, SessionKind::Video, 0);
    assert_eq!(call.state().quality, NetworkQuality::Good);

    call.set_network_quality(NetworkReport {
        quality: NetworkQuality::Poor,
        link_type: LinkType::TwoG,
        bandwidth_kbps: 250,
        latency_ms: 320,
    });
    let state = call.state();
    assert_eq!(state.quality, NetworkQuality::Poor);
    assert_eq!(state.network.unwrap().link_type, LinkType::TwoG);
    assert_eq!(state.session.state, ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn chat_sessions_have_no_media() {
    let stack = Stack::new();
    let (mut call, media) = stack.call("patient", "doctor", true, SessionKind::Chat, 0);
    assert!(matches!(call.start_call().await, Err(Error::InvalidState { .. })));
    assert!(media.requests().is_empty());
    call.end_call().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_setup_cancels_waiting_session() {
    let stack = Stack::new();
    let (mut patient, media) = stack.call("patient", "doctor", true, SessionKind::Video, 0);
    media.set_failure(Some(MediaAccessError::PermissionDenied(TrackKind::Video)));

    assert!(matches!(
        patient.start_call().await,
        Err(Error::MediaAccess(MediaAccessError::PermissionDenied(TrackKind::Video)))
    ));
    let row = stack.sessions.get(SESSION).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Waiting);

    patient.end_call().await.unwrap();
    let row = stack.sessions.get(SESSION).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Cancelled);
    assert!(row.started_at.is_none());
    assert!(row.ended_at.is_some());
    assert_eq!(patient.state().session.state, ConnectionState::Failed);
}
