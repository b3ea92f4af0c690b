use tracing_subscriber::EnvFilter;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::peer::ice::candidate_type;
use crate::peer::types::IceCandidate;

/// Install the global fmt subscriber. `RUST_LOG` wins over `default_filter`.
/// Returns false if a subscriber was already installed.
pub fn init_logging(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Trace a trickled candidate as it is gathered or received.
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    tracing::debug!(
        direction = label,
        candidate = %cand.candidate,
        kind = ?candidate_type(cand),
        sdp_mid = ?cand.sdp_mid,
        sdp_mline_index = ?cand.sdp_mline_index,
        "trickle candidate"
    );
}

/// Snapshot of the nominated candidate pair, logged around connection problems.
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for report in stats.reports.values() {
        if let StatsReportType::CandidatePair(pair) = report {
            if pair.nominated {
                tracing::info!(
                    moment,
                    local = %pair.local_candidate_id,
                    remote = %pair.remote_candidate_id,
                    bytes_sent = pair.bytes_sent,
                    bytes_received = pair.bytes_received,
                    state = ?pair.state,
                    "selected candidate pair"
                );
            }
        }
    }
}
