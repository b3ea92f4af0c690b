use std::time::Duration;

use crate::adaptation::MediaProfile;
use crate::config::EngineConfig;
use crate::error::ConfigError;
use crate::peer::ice::check_ice_server;
use crate::peer::types::ServerConfig;
use crate::prober::{NetworkQualityProber, NetworkReport};

/// Availability of each configured STUN/TURN server, in config order.
pub async fn check_ice_servers(servers: &[ServerConfig], wait: Duration) -> Vec<(String, bool)> {
    let mut results = Vec::with_capacity(servers.len());
    for server in servers {
        let available = check_ice_server(server, wait).await;
        results.push((server.id.clone(), available));
    }
    let reachable = results.iter().filter(|(_, ok)| *ok).count();
    tracing::info!(total = results.len(), reachable, "ice server check complete");
    results
}

/// Replace the ICE server list after validating it.
pub fn set_ice_servers(config: &mut EngineConfig, servers: Vec<ServerConfig>) -> Result<(), ConfigError> {
    let candidate = EngineConfig {
        ice_servers: servers,
        ..config.clone()
    };
    candidate.validate()?;
    tracing::info!(count = candidate.ice_servers.len(), "custom ice servers set");
    *config = candidate;
    Ok(())
}

/// Pre-call check: probe once and pick the capture profile for the result.
pub async fn suggest_profile(prober: &NetworkQualityProber) -> (NetworkReport, MediaProfile) {
    let report = prober.check().await;
    let profile = MediaProfile::for_quality(report.quality);
    tracing::info!(
        quality = %report.quality,
        audio_only = profile.audio_only,
        low_bandwidth = profile.low_bandwidth,
        "suggested call profile"
    );
    (report, profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::IceServerKind;

    #[test]
    fn invalid_servers_leave_config_untouched() {
        let mut config = EngineConfig::default();
        let before = config.ice_servers.clone();
        let err = set_ice_servers(
            &mut config,
            vec![ServerConfig {
                id: "t".into(),
                kind: IceServerKind::Turn,
                url: "turn.example.org".into(),
                username: None,
                credential: None,
            }],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert_eq!(config.ice_servers, before);

        set_ice_servers(&mut config, vec![ServerConfig::stun("s", "stun.example.org:3478")]).unwrap();
        assert_eq!(config.ice_servers.len(), 1);
    }
}
