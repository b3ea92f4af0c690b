//! Engine configuration.
//!
//! Every threshold and interval the engine uses is tunable per deployment;
//! the defaults reproduce the field-tested values (5 s stats polling,
//! 200 kbps degrade threshold, 10 s network probing, three public STUN servers).

use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::adaptation::AdaptationConfig;
use crate::error::ConfigError;
use crate::peer::media::TransportConfig;
use crate::peer::types::{IceServerKind, ServerConfig};
use crate::prober::ProberConfig;
use crate::stats::StatsConfig;

static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig::stun("default-stun-0", "stun:stun.l.google.com:19302"),
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
        ServerConfig::stun("default-stun-2", "stun:stun2.l.google.com:19302"),
    ]
});

pub fn default_ice_servers() -> Vec<ServerConfig> {
    DEFAULT_ICE_SERVERS.clone()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub ice_candidate_pool_size: u8,
    /// Upper bound for leaving `connecting`.
    pub connect_timeout_ms: u64,
    /// How long a dropped transport may try to recover before the call fails.
    pub disconnect_grace_ms: u64,
    /// Upper bound for the capture permission prompt and device open.
    pub media_timeout_ms: u64,
    pub stats: StatsConfig,
    pub adaptation: AdaptationConfig,
    pub prober: ProberConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            ice_candidate_pool_size: 10,
            connect_timeout_ms: 30_000,
            disconnect_grace_ms: 10_000,
            media_timeout_ms: 60_000,
            stats: StatsConfig::default(),
            adaptation: AdaptationConfig::default(),
            prober: ProberConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config = Self::from_json_str(&raw)?;
        tracing::info!(path = %path.display(), ice_servers = config.ice_servers.len(), "loaded engine config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ice_servers.is_empty() {
            return Err(ConfigError::Invalid("at least one ICE server is required".into()));
        }
        for server in &self.ice_servers {
            if server.url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("ICE server {} has an empty URL", server.id)));
            }
            if server.kind == IceServerKind::Turn
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::Invalid(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        let intervals = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("disconnect_grace_ms", self.disconnect_grace_ms),
            ("media_timeout_ms", self.media_timeout_ms),
            ("stats.interval_ms", self.stats.interval_ms),
            ("prober.interval_ms", self.prober.interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.adaptation.video_scale_down_by < 1.0 {
            return Err(ConfigError::Invalid("adaptation.video_scale_down_by must be >= 1".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn media_timeout(&self) -> Duration {
        Duration::from_millis(self.media_timeout_ms)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            ice_servers: self.ice_servers.clone(),
            ice_candidate_pool_size: self.ice_candidate_pool_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.ice_servers.len(), 3);
        assert_eq!(cfg.stats.interval(), Duration::from_secs(5));
        assert_eq!(cfg.stats.degrade_threshold_kbps, 200);
        assert_eq!(cfg.prober.interval(), Duration::from_secs(10));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = EngineConfig::from_json_str(
            r#"{"stats": {"degrade_threshold_kbps": 120}, "connect_timeout_ms": 5000}"#,
        )
        .unwrap();
        assert_eq!(cfg.stats.degrade_threshold_kbps, 120);
        assert_eq!(cfg.stats.interval_ms, 5_000);
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.ice_servers, default_ice_servers());
    }

    #[test]
    fn turn_requires_credentials() {
        let err = EngineConfig::from_json_str(
            r#"{"ice_servers": [{"id": "t", "type": "turn", "url": "turn.example.org:3478"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_interval_rejected() {
        let err = EngineConfig::from_json_str(r#"{"stats": {"interval_ms": 0}}"#).unwrap_err();
        assert_eq!(err, ConfigError::Invalid("stats.interval_ms must be greater than zero".into()));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = EngineConfig::from_file("/nonexistent/medlink.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
