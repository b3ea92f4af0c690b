use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use webrtc::{
    api::APIBuilder,
    ice_transport::{ice_gatherer_state::RTCIceGathererState, ice_server::RTCIceServer},
    peer_connection::{configuration::RTCConfiguration, RTCPeerConnection},
};

use crate::peer::types::{IceCandidate, IceServerKind, ServerConfig};
use crate::utils::add_ice_url_scheme;

/// Remote candidates that arrived before the remote description was set.
/// Flushed in arrival order.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: VecDeque<IceCandidate>,
}

impl PendingCandidates {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Unknown,
}

pub fn candidate_type(candidate: &IceCandidate) -> CandidateType {
    let mut parts = candidate.candidate.split_whitespace();
    while let Some(part) = parts.next() {
        if part == "typ" {
            return match parts.next() {
                Some("host") => CandidateType::Host,
                Some("srflx") => CandidateType::ServerReflexive,
                Some("prflx") => CandidateType::PeerReflexive,
                Some("relay") => CandidateType::Relay,
                _ => CandidateType::Unknown,
            };
        }
    }
    CandidateType::Unknown
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();
    for candidate in candidates {
        match candidate_type(candidate) {
            CandidateType::Host => summary.host += 1,
            CandidateType::ServerReflexive | CandidateType::PeerReflexive => summary.srflx += 1,
            CandidateType::Relay => summary.relay += 1,
            CandidateType::Unknown => {}
        }
    }

    tracing::info!(
        host = summary.host,
        srflx = summary.srflx,
        relay = summary.relay,
        "local candidate gathering finished"
    );
    if summary.relay == 0 {
        tracing::warn!("no TURN relay candidates found; connection through symmetric NAT may fail");
    }
    summary
}

/// Check that a STUN/TURN server answers by gathering against it alone and
/// waiting for a server-reflexive (STUN) or relay (TURN) candidate.
pub async fn check_ice_server(config: &ServerConfig, wait: Duration) -> bool {
    let url = add_ice_url_scheme(config);
    tracing::debug!(server = %config.id, url = %url, "checking ice server availability");

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![url],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
            ..Default::default()
        }],
        ..Default::default()
    };

    let api = APIBuilder::new().build();
    let pc = match api.new_peer_connection(rtc_config).await {
        Ok(pc) => Arc::new(pc),
        Err(e) => {
            tracing::warn!(server = %config.id, error = %e, "failed to create probe peer connection");
            return false;
        }
    };

    let available = gather_against(&pc, config.kind, wait).await;
    if let Err(e) = pc.close().await {
        tracing::debug!(error = %e, "probe peer connection close failed");
    }
    tracing::info!(server = %config.id, available, "ice server check finished");
    available
}

async fn gather_against(pc: &Arc<RTCPeerConnection>, kind: IceServerKind, wait: Duration) -> bool {
    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    pc.on_ice_gathering_state_change(Box::new(move |state| {
        let _ = state_tx.send(state);
        Box::pin(async {})
    }));

    let (found_tx, mut found_rx) = mpsc::unbounded_channel();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            if let Ok(init) = c.to_json() {
                let wanted = match kind {
                    IceServerKind::Stun => "typ srflx",
                    IceServerKind::Turn => "typ relay",
                };
                if init.candidate.contains(wanted) {
                    let _ = found_tx.send(());
                }
            }
        }
        Box::pin(async {})
    }));

    // a data channel is enough to make the agent start gathering
    if let Err(e) = pc.create_data_channel("probe", None).await {
        tracing::warn!(error = %e, "failed to create probe data channel");
        return false;
    }
    let offer = match pc.create_offer(None).await {
        Ok(offer) => offer,
        Err(e) => {
            tracing::warn!(error = %e, "failed to create probe offer");
            return false;
        }
    };
    if let Err(e) = pc.set_local_description(offer).await {
        tracing::warn!(error = %e, "failed to set probe local description");
        return false;
    }

    let outcome = timeout(wait, async {
        tokio::select! {
            found = found_rx.recv() => found.is_some(),
            _ = async {
                while let Some(state) = state_rx.recv().await {
                    if state == RTCIceGathererState::Complete {
                        break;
                    }
                }
            } => {
                // gathering can complete right after the last candidate callback
                found_rx.try_recv().is_ok()
            }
        }
    })
    .await;

    match outcome {
        Ok(found) => found,
        Err(_) => {
            tracing::debug!("timed out waiting for reflexive/relay candidate");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(typ: &str) -> IceCandidate {
        IceCandidate::new(format!("candidate:1 1 udp 2122260223 192.0.2.1 50000 typ {typ}"))
    }

    #[test]
    fn pending_keeps_arrival_order() {
        let mut pending = PendingCandidates::default();
        for i in 0..5 {
            pending.push(IceCandidate::new(format!("candidate:{i} 1 udp 1 10.0.0.1 4000 typ host")));
        }
        assert_eq!(pending.len(), 5);
        let drained = pending.drain();
        let order: Vec<_> = drained
            .iter()
            .map(|c| c.candidate.split(':').nth(1).unwrap().chars().next().unwrap())
            .collect();
        assert_eq!(order, vec!['0', '1', '2', '3', '4']);
        assert!(pending.is_empty());
    }

    #[test]
    fn summary_counts_types() {
        let all = vec![cand("host"), cand("host"), cand("srflx"), cand("relay"), cand("bogus")];
        assert_eq!(
            analyze_candidates(&all),
            CandidateSummary {
                host: 2,
                srflx: 1,
                relay: 1
            }
        );
        assert_eq!(candidate_type(&IceCandidate::new("garbage")), CandidateType::Unknown);
    }
}
