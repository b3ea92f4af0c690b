//! Caller-facing call API: one `CallSession` per participant per consultation.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use crate::adaptation::MediaProfile;
use crate::config::EngineConfig;
use crate::error::{Error, Result, StoreError};
use crate::peer::connection::{ControllerDeps, SessionController, SessionIdentity};
use crate::peer::media::{LocalMediaSource, TransportFactory};
use crate::peer::rtc::{RtcMediaSource, RtcTransportFactory};
use crate::peer::state::{ConnectionState, SessionSnapshot};
use crate::prober::{NetworkQuality, NetworkQualityProber, NetworkReport, ProberHandle};
use crate::session::{Session, SessionKind, SessionStatus};
use crate::signaling::SignalingChannel;
use crate::stats::MetricsSink;
use crate::store::SessionStore;

#[derive(Debug, Clone, PartialEq)]
pub struct CallOptions {
    pub session_id: String,
    pub self_id: String,
    pub remote_id: String,
    pub kind: SessionKind,
    /// The initiator creates the offer; the responder answers inbound offers.
    pub is_initiator: bool,
    pub profile: MediaProfile,
}

#[derive(Clone)]
pub struct CallDeps {
    pub media: Arc<dyn LocalMediaSource>,
    pub transports: Arc<dyn TransportFactory>,
    pub signaling: SignalingChannel,
    pub metrics: Arc<dyn MetricsSink>,
    pub sessions: Arc<dyn SessionStore>,
}

impl CallDeps {
    /// Wire the webrtc-rs backend.
    pub fn rtc(
        signaling: SignalingChannel,
        metrics: Arc<dyn MetricsSink>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            media: Arc::new(RtcMediaSource::default()),
            transports: Arc::new(RtcTransportFactory),
            signaling,
            metrics,
            sessions,
        }
    }

    fn controller_deps(&self) -> ControllerDeps {
        ControllerDeps {
            media: self.media.clone(),
            transports: self.transports.clone(),
            signaling: self.signaling.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// What the UI renders.
#[derive(Debug, Clone)]
pub struct CallState {
    pub session: SessionSnapshot,
    pub network: Option<NetworkReport>,
    pub quality: NetworkQuality,
}

pub struct CallSession {
    options: CallOptions,
    config: Arc<EngineConfig>,
    deps: CallDeps,
    controller: Option<SessionController>,
    network: Arc<watch::Sender<Option<NetworkReport>>>,
    /// `active` was recorded for the current call.
    activated: bool,
    ended: bool,
}

impl CallSession {
    pub fn new(options: CallOptions, config: Arc<EngineConfig>, deps: CallDeps) -> Self {
        let (network, _) = watch::channel(None);
        Self {
            options,
            config,
            deps,
            controller: None,
            network: Arc::new(network),
            activated: false,
            ended: false,
        }
    }

    pub fn options(&self) -> &CallOptions {
        &self.options
    }

    fn effective_profile(&self) -> MediaProfile {
        let mut profile = self.options.profile;
        if self.options.kind == SessionKind::AudioOnly {
            profile.audio_only = true;
        }
        profile
    }

    /// Acquire media, build the transport and, as initiator, send the offer.
    /// The responder answers as soon as the offer arrives over signaling.
    pub async fn start_call(&mut self) -> Result<()> {
        if let Some(current) = &self.controller {
            let state = current.state();
            if !state.is_terminal() {
                return Err(Error::CallInProgress);
            }
        }
        if self.options.kind == SessionKind::Chat {
            return Err(Error::InvalidState {
                state: ConnectionState::Idle,
                op: "start_call on a chat session",
            });
        }
        if let Some(previous) = self.controller.take() {
            previous.close().await;
        }
        self.activated = false;
        self.ended = false;

        tracing::info!(
            session = %self.options.session_id,
            user = %self.options.self_id,
            initiator = self.options.is_initiator,
            kind = ?self.options.kind,
            "starting call"
        );
        self.ensure_session_row().await;

        let identity = SessionIdentity::new(
            self.options.session_id.clone(),
            self.options.self_id.clone(),
            self.options.remote_id.clone(),
        );
        let controller = SessionController::spawn(identity, self.config.clone(), self.deps.controller_deps());
        let profile = self.effective_profile();

        let started = async {
            controller.acquire_local_media(profile).await?;
            controller.create_transport().await?;
            if self.options.is_initiator {
                controller.create_offer().await?;
            }
            Ok::<_, Error>(())
        }
        .await;
        self.controller = Some(controller);
        started?;

        self.record_status(SessionStatus::Active).await;
        self.activated = true;
        Ok(())
    }

    /// Tear the call down and close the session row: `ended` once the call
    /// went active, `cancelled` if setup never got that far. Safe to repeat.
    pub async fn end_call(&mut self) -> Result<()> {
        let Some(controller) = &self.controller else {
            return Ok(());
        };
        let snapshot = controller.snapshot();
        controller.close().await;
        if self.ended {
            return Ok(());
        }
        self.ended = true;

        let quality = self.quality_of(&snapshot);
        if let Err(e) = self
            .deps
            .sessions
            .update_quality(&self.options.session_id, quality)
            .await
        {
            tracing::warn!(session = %self.options.session_id, error = %e, "failed to store call quality");
        }
        let status = if self.activated {
            SessionStatus::Ended
        } else {
            SessionStatus::Cancelled
        };
        self.record_status(status).await;
        tracing::info!(session = %self.options.session_id, %quality, ?status, "call ended");
        Ok(())
    }

    pub async fn toggle_video(&self, enabled: bool) -> Result<()> {
        match &self.controller {
            Some(controller) => controller.toggle_video(enabled).await,
            None => Ok(()),
        }
    }

    pub async fn toggle_audio(&self, enabled: bool) -> Result<()> {
        match &self.controller {
            Some(controller) => controller.toggle_audio(enabled).await,
            None => Ok(()),
        }
    }

    pub fn state(&self) -> CallState {
        let session = self
            .controller
            .as_ref()
            .map(|c| c.snapshot())
            .unwrap_or_else(|| SessionSnapshot::new(self.effective_profile()));
        let network = self.network.borrow().clone();
        CallState {
            quality: self.quality_of(&session),
            session,
            network,
        }
    }

    /// Session snapshots as they change; `None` before `start_call`.
    pub fn watch(&self) -> Option<watch::Receiver<SessionSnapshot>> {
        self.controller.as_ref().map(|c| c.watch())
    }

    pub fn watch_network(&self) -> watch::Receiver<Option<NetworkReport>> {
        self.network.subscribe()
    }

    pub fn controller(&self) -> Option<&SessionController> {
        self.controller.as_ref()
    }

    /// Feed an ambient network report into the call view.
    pub fn set_network_quality(&self, report: NetworkReport) {
        self.network.send_replace(Some(report));
    }

    /// Run the prober for the lifetime of the returned handle, publishing
    /// every report into this call's view.
    pub fn attach_prober(&self, prober: NetworkQualityProber) -> ProberHandle {
        let network = self.network.clone();
        prober.spawn(move |report| {
            network.send_replace(Some(report));
        })
    }

    /// Live stats win over the ambient prober once a call produces samples.
    fn quality_of(&self, snapshot: &SessionSnapshot) -> NetworkQuality {
        if let Some(sample) = &snapshot.last_sample {
            return sample.quality(self.config.stats.degrade_threshold_kbps);
        }
        self.network
            .borrow()
            .as_ref()
            .map(|r| r.quality)
            .unwrap_or(NetworkQuality::Good)
    }

    async fn ensure_session_row(&self) {
        let (initiator, responder) = if self.options.is_initiator {
            (&self.options.self_id, &self.options.remote_id)
        } else {
            (&self.options.remote_id, &self.options.self_id)
        };
        let row = Session::new(
            self.options.session_id.clone(),
            initiator.clone(),
            responder.clone(),
            self.options.kind,
        );
        match self.deps.sessions.create(row).await {
            Ok(()) => tracing::debug!(session = %self.options.session_id, "session row created"),
            Err(StoreError::AlreadyExists(_)) => {
                tracing::debug!(session = %self.options.session_id, "session row already exists")
            }
            Err(e) => tracing::warn!(session = %self.options.session_id, error = %e, "failed to create session row"),
        }
    }

    async fn record_status(&self, status: SessionStatus) {
        if let Err(e) = self
            .deps
            .sessions
            .update_status(&self.options.session_id, status, Utc::now())
            .await
        {
            tracing::warn!(session = %self.options.session_id, ?status, error = %e, "failed to update session status");
        }
    }
}
