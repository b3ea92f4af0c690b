//! Peer session controller.
//!
//! One controller owns one media session for one participant. It runs as an
//! actor: API calls, transport callbacks, the signaling subscription, the
//! stats timer and the connect/grace deadline are all drained by a single
//! `select!` loop, so state transitions never race each other.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, Interval, MissedTickBehavior};

use crate::adaptation::{AdaptationController, MediaProfile};
use crate::config::EngineConfig;
use crate::error::{Error, MediaAccessError, NegotiationError, Result, SignalingError};
use crate::logger::dump_candidate;
use crate::peer::ice::{analyze_candidates, PendingCandidates};
use crate::peer::media::{
    LocalMediaSource, LocalStream, MediaTransport, OfferOptions, TransportEvent, TransportFactory,
    TransportState,
};
use crate::peer::state::{ConnectionState, LocalStreamInfo, SessionSnapshot};
use crate::peer::types::{IceCandidate, RemoteTrack, SdpType, SessionDescription, TrackKind};
use crate::signaling::{
    candidate_payload, description_payload, InboundSignal, MessageType, Signal, SignalingChannel,
    Subscription,
};
use crate::stats::{MetricsSink, QualitySample, StatsMonitor};

/// Who this controller speaks for, and to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: String,
    pub self_id: String,
    pub remote_id: String,
}

impl SessionIdentity {
    pub fn new(
        session_id: impl Into<String>,
        self_id: impl Into<String>,
        remote_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            self_id: self_id.into(),
            remote_id: remote_id.into(),
        }
    }
}

/// Collaborators handed to a controller. Owned by the controller for its
/// whole lifetime; nothing here is process-global.
#[derive(Clone)]
pub struct ControllerDeps {
    pub media: Arc<dyn LocalMediaSource>,
    pub transports: Arc<dyn TransportFactory>,
    pub signaling: SignalingChannel,
    pub metrics: Arc<dyn MetricsSink>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    AcquireLocalMedia {
        profile: MediaProfile,
        reply: Reply<()>,
    },
    CreateTransport {
        reply: Reply<()>,
    },
    CreateOffer {
        reply: Reply<SessionDescription>,
    },
    CreateAnswer {
        offer: SessionDescription,
        reply: Reply<SessionDescription>,
    },
    HandleAnswer {
        answer: SessionDescription,
        reply: Reply<()>,
    },
    HandleIceCandidate {
        candidate: IceCandidate,
        reply: Reply<()>,
    },
    Toggle {
        kind: TrackKind,
        enabled: bool,
        reply: Reply<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    Connect,
    Grace,
}

/// Handle to a running session controller. Dropping it tears the session down.
pub struct SessionController {
    identity: SessionIdentity,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl SessionController {
    /// Start the controller task. Must be called inside a tokio runtime.
    pub fn spawn(identity: SessionIdentity, config: Arc<EngineConfig>, deps: ControllerDeps) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let profile = MediaProfile::default();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::new(profile));

        let actor = Actor {
            identity: identity.clone(),
            adaptation: AdaptationController::new(config.adaptation.clone(), profile),
            config,
            deps,
            commands: commands_rx,
            snapshot: snapshot_tx,
            state: ConnectionState::Idle,
            local: None,
            transport: None,
            transport_events: None,
            subscription: None,
            pending: PendingCandidates::default(),
            remote_description: None,
            local_description: None,
            local_candidates: Vec::new(),
            remote_tracks: Vec::new(),
            monitor: None,
            stats_timer: None,
            deadline: None,
            recovering: false,
            last_sample: None,
            last_error: None,
        };
        let task = tokio::spawn(actor.run());

        Self {
            identity,
            commands: commands_tx,
            snapshot: snapshot_rx,
            task,
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| Error::ControllerClosed)?;
        rx.await.map_err(|_| Error::ControllerClosed)?
    }

    /// Open capture devices under the profile's constraints.
    pub async fn acquire_local_media(&self, profile: MediaProfile) -> Result<()> {
        self.request(|reply| Command::AcquireLocalMedia { profile, reply })
            .await
    }

    /// Build the transport, attach local tracks and start listening for signaling.
    pub async fn create_transport(&self) -> Result<()> {
        self.request(|reply| Command::CreateTransport { reply }).await
    }

    pub async fn create_offer(&self) -> Result<SessionDescription> {
        self.request(|reply| Command::CreateOffer { reply }).await
    }

    pub async fn create_answer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        self.request(|reply| Command::CreateAnswer { offer, reply })
            .await
    }

    pub async fn handle_answer(&self, answer: SessionDescription) -> Result<()> {
        self.request(|reply| Command::HandleAnswer { answer, reply })
            .await
    }

    pub async fn handle_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.request(|reply| Command::HandleIceCandidate { candidate, reply })
            .await
    }

    pub async fn toggle_video(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::Toggle {
            kind: TrackKind::Video,
            enabled,
            reply,
        })
        .await
    }

    pub async fn toggle_audio(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::Toggle {
            kind: TrackKind::Audio,
            enabled,
            reply,
        })
        .await
    }

    /// Release everything. Safe from any state and safe to repeat.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Close { reply: tx }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the published snapshot satisfies `pred`.
    pub async fn wait_for<F>(&self, pred: F) -> SessionSnapshot
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let result = rx.wait_for(pred).await.map(|s| s.clone());
        result.unwrap_or_else(|_| rx.borrow().clone())
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct Actor {
    identity: SessionIdentity,
    config: Arc<EngineConfig>,
    deps: ControllerDeps,
    commands: mpsc::UnboundedReceiver<Command>,
    snapshot: watch::Sender<SessionSnapshot>,
    state: ConnectionState,
    adaptation: AdaptationController,
    local: Option<LocalStream>,
    transport: Option<Arc<dyn MediaTransport>>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    subscription: Option<Subscription>,
    pending: PendingCandidates,
    remote_description: Option<SessionDescription>,
    local_description: Option<SessionDescription>,
    local_candidates: Vec<IceCandidate>,
    remote_tracks: Vec<RemoteTrack>,
    monitor: Option<StatsMonitor>,
    stats_timer: Option<Interval>,
    deadline: Option<(Instant, Deadline)>,
    recovering: bool,
    last_sample: Option<QualitySample>,
    last_error: Option<Error>,
}

async fn next_event(rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_signal(sub: &mut Option<Subscription>) -> Option<InboundSignal> {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn expire(deadline: Option<(Instant, Deadline)>) -> Deadline {
    match deadline {
        Some((at, kind)) => {
            tokio::time::sleep_until(at).await;
            kind
        }
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(mut self) {
        tracing::debug!(session = %self.identity.session_id, user = %self.identity.self_id, "session controller started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = next_event(&mut self.transport_events) => self.on_transport_event(event).await,
                Some(signal) = next_signal(&mut self.subscription) => self.on_signal(signal).await,
                _ = next_tick(&mut self.stats_timer) => self.on_stats_tick().await,
                deadline = expire(self.deadline) => self.on_deadline(deadline).await,
            }
        }
        // handle dropped without an explicit close
        self.close().await;
        tracing::debug!(session = %self.identity.session_id, user = %self.identity.self_id, "session controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::AcquireLocalMedia { profile, reply } => {
                let _ = reply.send(self.acquire_local_media(profile).await);
            }
            Command::CreateTransport { reply } => {
                let _ = reply.send(self.create_transport().await);
            }
            Command::CreateOffer { reply } => {
                let _ = reply.send(self.create_offer().await);
            }
            Command::CreateAnswer { offer, reply } => {
                let _ = reply.send(self.create_answer(offer).await);
            }
            Command::HandleAnswer { answer, reply } => {
                let _ = reply.send(self.handle_answer(answer).await);
            }
            Command::HandleIceCandidate { candidate, reply } => {
                let _ = reply.send(self.handle_ice_candidate(candidate).await);
            }
            Command::Toggle {
                kind,
                enabled,
                reply,
            } => {
                let _ = reply.send(self.toggle(kind, enabled));
            }
            Command::Close { reply } => {
                self.close().await;
                let _ = reply.send(());
            }
        }
    }

    async fn acquire_local_media(&mut self, profile: MediaProfile) -> Result<()> {
        if self.state != ConnectionState::Idle || self.local.is_some() {
            return Err(self.invalid("acquire_local_media"));
        }
        self.adaptation.set_profile(profile);
        self.set_state(ConnectionState::AcquiringMedia);

        let constraints = self.adaptation.capture_constraints();
        tracing::info!(
            session = %self.identity.session_id,
            video = constraints.wants_video(),
            low_bandwidth = profile.low_bandwidth,
            "acquiring local media"
        );

        let wait = self.config.media_timeout();
        let acquired = match timeout(wait, self.deps.media.acquire(&constraints)).await {
            Ok(result) => result,
            Err(_) => Err(MediaAccessError::TimedOut(wait)),
        };
        match acquired {
            Ok(stream) => {
                tracing::info!(stream = stream.id(), tracks = stream.tracks().len(), "local media acquired");
                self.local = Some(stream);
                self.publish();
                Ok(())
            }
            Err(e) => Err(self.fail(e.into()).await),
        }
    }

    async fn create_transport(&mut self) -> Result<()> {
        if self.transport.is_some()
            || !matches!(self.state, ConnectionState::Idle | ConnectionState::AcquiringMedia)
        {
            return Err(self.invalid("create_transport"));
        }

        let subscription = match self
            .deps
            .signaling
            .subscribe(&self.identity.session_id, &self.identity.self_id)
            .await
        {
            Ok(sub) => sub,
            Err(e) => return Err(self.fail(e.into()).await),
        };
        self.subscription = Some(subscription);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = match self
            .deps
            .transports
            .create(&self.config.transport_config(), events_tx)
            .await
        {
            Ok(transport) => transport,
            Err(e) => return Err(self.fail(e.into()).await),
        };
        self.transport = Some(transport.clone());
        self.transport_events = Some(events_rx);

        let tracks = self
            .local
            .as_ref()
            .map(|local| local.tracks().to_vec())
            .unwrap_or_default();
        for track in tracks {
            if let Err(e) = transport.add_track(track).await {
                return Err(self.fail(e.into()).await);
            }
        }

        self.set_state(ConnectionState::Connecting);
        self.deadline = Some((Instant::now() + self.config.connect_timeout(), Deadline::Connect));
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription> {
        let transport = self.require_transport("create_offer")?;
        let options = OfferOptions {
            receive_audio: true,
            receive_video: !self.adaptation.profile().audio_only,
        };

        let offer = match transport.create_offer(options).await {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail(NegotiationError::LocalFailed(e.to_string()).into()).await),
        };
        if let Err(e) = transport.set_local_description(offer.clone()).await {
            return Err(self.fail(NegotiationError::LocalFailed(e.to_string()).into()).await);
        }
        self.local_description = Some(offer.clone());

        if let Err(e) = self.send(MessageType::Offer, description_payload(&offer)).await {
            return Err(self.fail(e.into()).await);
        }
        tracing::info!(session = %self.identity.session_id, "offer sent");
        Ok(offer)
    }

    async fn create_answer(&mut self, offer: SessionDescription) -> Result<SessionDescription> {
        let transport = self.require_transport("create_answer")?;

        if self.remote_description.as_ref() == Some(&offer) {
            if let Some(answer) = self.local_description.clone() {
                tracing::debug!("offer already answered; ignoring repeat");
                return Ok(answer);
            }
        }
        if offer.sdp_type != SdpType::Offer {
            let err = NegotiationError::RemoteRejected(format!("expected an offer, got {:?}", offer.sdp_type));
            return Err(self.fail(err.into()).await);
        }

        if let Err(e) = transport.set_remote_description(offer.clone()).await {
            return Err(self.fail(NegotiationError::RemoteRejected(e.to_string()).into()).await);
        }
        self.remote_description = Some(offer);
        self.flush_pending(transport.as_ref()).await;

        let answer = match transport.create_answer().await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail(NegotiationError::LocalFailed(e.to_string()).into()).await),
        };
        if let Err(e) = transport.set_local_description(answer.clone()).await {
            return Err(self.fail(NegotiationError::LocalFailed(e.to_string()).into()).await);
        }
        self.local_description = Some(answer.clone());

        if let Err(e) = self.send(MessageType::Answer, description_payload(&answer)).await {
            return Err(self.fail(e.into()).await);
        }
        tracing::info!(session = %self.identity.session_id, "answer sent");
        Ok(answer)
    }

    async fn handle_answer(&mut self, answer: SessionDescription) -> Result<()> {
        let transport = self.require_transport("handle_answer")?;

        if let Some(current) = &self.remote_description {
            if *current == answer {
                tracing::debug!("answer already applied; ignoring repeat");
            } else {
                tracing::warn!("remote description already set; ignoring unexpected answer");
            }
            return Ok(());
        }
        if self.local_description.is_none() {
            tracing::warn!("answer received before any offer was made");
            return Err(self.invalid("handle_answer"));
        }
        if answer.sdp_type != SdpType::Answer {
            let err = NegotiationError::RemoteRejected(format!("expected an answer, got {:?}", answer.sdp_type));
            return Err(self.fail(err.into()).await);
        }

        if let Err(e) = transport.set_remote_description(answer.clone()).await {
            return Err(self.fail(NegotiationError::RemoteRejected(e.to_string()).into()).await);
        }
        self.remote_description = Some(answer);
        self.flush_pending(transport.as_ref()).await;
        tracing::info!(session = %self.identity.session_id, "answer applied");
        Ok(())
    }

    async fn handle_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if self.state.is_terminal() {
            return Err(self.invalid("handle_ice_candidate"));
        }
        dump_candidate("REMOTE", &candidate);

        match (&self.transport, &self.remote_description) {
            (Some(transport), Some(_)) => {
                let transport = transport.clone();
                transport.add_ice_candidate(candidate).await.map_err(|e| {
                    tracing::warn!(error = %e, "failed to add ice candidate");
                    Error::from(e)
                })
            }
            _ => {
                self.pending.push(candidate);
                tracing::debug!(queued = self.pending.len(), "remote description not set yet, queuing candidate");
                Ok(())
            }
        }
    }

    async fn flush_pending(&mut self, transport: &dyn MediaTransport) {
        let queued = self.pending.drain();
        if queued.is_empty() {
            return;
        }
        tracing::debug!(count = queued.len(), "applying queued candidates");
        for candidate in queued {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                tracing::warn!(error = %e, "failed to apply queued candidate");
            }
        }
    }

    fn toggle(&mut self, kind: TrackKind, enabled: bool) -> Result<()> {
        let Some(local) = &self.local else {
            return Ok(());
        };
        for track in local.tracks().iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
        tracing::info!(%kind, enabled, "local track toggled");

        if kind == TrackKind::Video && enabled && self.state == ConnectionState::Degraded {
            self.adaptation.restore_video();
            self.set_state(ConnectionState::Connected);
        } else {
            self.publish();
        }
        Ok(())
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::RemoteTrack(track) => {
                tracing::info!(track = %track.id, kind = %track.kind, "remote track arrived");
                if !self.remote_tracks.iter().any(|t| t.id == track.id) {
                    self.remote_tracks.push(track);
                }
                self.publish();
            }
            TransportEvent::LocalCandidate(candidate) => {
                dump_candidate("LOCAL", &candidate);
                self.local_candidates.push(candidate.clone());
                if let Err(e) = self
                    .send(MessageType::IceCandidate, candidate_payload(&candidate))
                    .await
                {
                    tracing::debug!(error = %e, "candidate not relayed");
                }
            }
            TransportEvent::GatheringComplete => {
                analyze_candidates(&self.local_candidates);
            }
            TransportEvent::StateChanged(state) => self.on_transport_state(state).await,
        }
    }

    async fn on_transport_state(&mut self, state: TransportState) {
        tracing::debug!(transport = ?state, controller = %self.state, "transport state changed");
        match state {
            TransportState::Connected => {
                if self.state == ConnectionState::Connecting {
                    self.deadline = None;
                    self.set_state(ConnectionState::Connected);
                    self.on_connected().await;
                } else if self.state.is_live() && self.recovering {
                    self.recovering = false;
                    self.deadline = None;
                    tracing::info!(session = %self.identity.session_id, "connection recovered");
                    self.publish();
                }
            }
            TransportState::Disconnected | TransportState::Failed => {
                if self.state == ConnectionState::Connecting && state == TransportState::Failed {
                    let err = NegotiationError::TransportFailed("ice connectivity checks failed".into());
                    self.fail(err.into()).await;
                } else if self.state.is_live() && !self.recovering {
                    self.recovering = true;
                    let grace = self.config.disconnect_grace();
                    self.deadline = Some((Instant::now() + grace, Deadline::Grace));
                    tracing::warn!(
                        session = %self.identity.session_id,
                        grace_secs = grace.as_secs(),
                        "connection problem, waiting for recovery"
                    );
                    self.publish();
                }
            }
            TransportState::Closed => {
                if !self.state.is_terminal() {
                    tracing::info!(session = %self.identity.session_id, "transport closed underneath the session");
                    self.close().await;
                }
            }
            TransportState::New | TransportState::Connecting => {}
        }
    }

    async fn on_connected(&mut self) {
        tracing::info!(session = %self.identity.session_id, user = %self.identity.self_id, "peer connection connected");
        if let (Some(transport), Some(local)) = (self.transport.clone(), self.local.as_ref()) {
            self.adaptation
                .apply_encoding_constraints(transport.as_ref(), local)
                .await;
        }

        let period = self.config.stats.interval();
        let mut timer = tokio::time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.stats_timer = Some(timer);
        self.monitor = Some(StatsMonitor::new(
            self.identity.session_id.clone(),
            self.identity.self_id.clone(),
            self.config.stats.clone(),
        ));
    }

    async fn on_stats_tick(&mut self) {
        if !self.state.is_live() {
            self.stop_stats();
            return;
        }
        let Some(transport) = self.transport.clone() else {
            return;
        };
        let raw = match transport.stats().await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(error = %e, "stats unavailable, skipping tick");
                return;
            }
        };
        let Some(monitor) = self.monitor.as_mut() else {
            return;
        };

        let sample = monitor.derive(&raw, Instant::now());
        let metric = monitor.metric(&sample, Utc::now());
        let degrade = monitor.should_degrade(&sample, self.adaptation.profile().audio_only);

        match timeout(self.config.stats.sink_timeout(), self.deps.metrics.insert(metric)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to persist call quality metric"),
            Err(_) => tracing::warn!("timed out persisting call quality metric"),
        }

        tracing::debug!(
            bandwidth_kbps = ?sample.bandwidth_kbps,
            loss = sample.packet_loss,
            latency_ms = sample.latency_ms,
            resolution = %sample.resolution,
            "call stats sampled"
        );
        self.last_sample = Some(sample);

        if degrade && self.adaptation.degrade_to_audio_only(self.local.as_ref()) {
            self.set_state(ConnectionState::Degraded);
        } else {
            self.publish();
        }
    }

    async fn on_deadline(&mut self, deadline: Deadline) {
        self.deadline = None;
        match deadline {
            Deadline::Connect if self.state == ConnectionState::Connecting => {
                let err = NegotiationError::Timeout(self.config.connect_timeout());
                self.fail(err.into()).await;
            }
            Deadline::Grace if self.recovering => {
                let err = NegotiationError::TransportFailed(format!(
                    "connection did not recover within {:?}",
                    self.config.disconnect_grace()
                ));
                self.fail(err.into()).await;
            }
            _ => {}
        }
    }

    async fn on_signal(&mut self, inbound: InboundSignal) {
        if inbound.sender_id != self.identity.remote_id {
            tracing::debug!(sender = %inbound.sender_id, "ignoring signal from unexpected sender");
            return;
        }
        let outcome = match inbound.signal {
            Signal::Offer(offer) => self.create_answer(offer).await.map(|_| ()),
            Signal::Answer(answer) => self.handle_answer(answer).await,
            Signal::IceCandidate(candidate) => self.handle_ice_candidate(candidate).await,
            Signal::Renegotiate(_) => {
                tracing::info!("peer requested renegotiation; not supported, ignoring");
                Ok(())
            }
            Signal::Malformed(e) if self.remote_description.is_none() && !self.state.is_terminal() => {
                let err = NegotiationError::RemoteRejected(e.to_string());
                Err(self.fail(err.into()).await)
            }
            Signal::Malformed(e) => {
                tracing::warn!(error = %e, "ignoring malformed description after negotiation");
                Ok(())
            }
        };
        if let Err(e) = outcome {
            tracing::warn!(message = %inbound.message_id, error = %e, "failed to handle inbound signal");
        }
    }

    async fn send(&self, kind: MessageType, payload: Value) -> std::result::Result<(), SignalingError> {
        self.deps
            .signaling
            .send(
                &self.identity.session_id,
                &self.identity.self_id,
                &self.identity.remote_id,
                kind,
                payload,
            )
            .await
    }

    fn require_transport(&self, op: &'static str) -> Result<Arc<dyn MediaTransport>> {
        if self.state.is_terminal() {
            return Err(self.invalid(op));
        }
        self.transport
            .clone()
            .ok_or_else(|| NegotiationError::NoTransport.into())
    }

    fn invalid(&self, op: &'static str) -> Error {
        Error::InvalidState {
            state: self.state,
            op,
        }
    }

    fn stop_stats(&mut self) {
        if self.stats_timer.take().is_some() {
            tracing::debug!(session = %self.identity.session_id, "stats monitor stopped");
        }
        self.monitor = None;
    }

    /// Record a fatal error, release everything and move to `failed`.
    async fn fail(&mut self, err: Error) -> Error {
        tracing::error!(session = %self.identity.session_id, state = %self.state, error = %err, "session failed");
        self.last_error = Some(err.clone());
        self.teardown().await;
        self.set_state(ConnectionState::Failed);
        err
    }

    /// Stats and signaling go first so no callback fires against released
    /// devices; every step runs even if an earlier one fails.
    async fn teardown(&mut self) {
        self.stop_stats();
        self.deadline = None;
        self.recovering = false;

        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.transport_events = None;

        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::warn!(error = %e, "transport close failed");
            }
        }
        if let Some(local) = self.local.take() {
            let released = local.stop();
            tracing::debug!(released, "local capture released");
        }

        self.pending.clear();
        self.remote_tracks.clear();
    }

    async fn close(&mut self) {
        if self.state == ConnectionState::Ended {
            return;
        }
        tracing::info!(session = %self.identity.session_id, user = %self.identity.self_id, state = %self.state, "closing session");
        self.teardown().await;
        if self.state == ConnectionState::Failed {
            self.publish();
        } else {
            self.set_state(ConnectionState::Ended);
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            tracing::info!(session = %self.identity.session_id, from = %self.state, to = %next, "connection state changed");
            self.state = next;
        }
        self.publish();
    }

    fn publish(&self) {
        let profile = *self.adaptation.profile();
        let (video_enabled, audio_enabled) = match &self.local {
            Some(local) => (
                local.video_tracks().iter().any(|t| t.is_enabled()),
                local.audio_tracks().iter().any(|t| t.is_enabled()),
            ),
            None => (false, false),
        };
        self.snapshot.send_replace(SessionSnapshot {
            state: self.state,
            profile,
            local_stream: self.local.as_ref().map(LocalStreamInfo::from),
            remote_tracks: self.remote_tracks.clone(),
            video_enabled,
            audio_enabled,
            recovering: self.recovering,
            degraded_by_policy: self.adaptation.has_degraded() && profile.audio_only,
            last_sample: self.last_sample.clone(),
            last_error: self.last_error.clone(),
        });
    }
}
