//! Call statistics: derivation from raw transport stats, metric rows, and
//! the low-bandwidth degrade trigger.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::StoreError;
use crate::peer::media::TransportStats;
use crate::prober::NetworkQuality;

/// One persisted sample. Append-only.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CallQualityMetric {
    pub session_id: String,
    pub user_id: String,
    pub bandwidth_kbps: u32,
    pub packet_loss: u64,
    pub latency_ms: u32,
    pub video_resolution: String,
    pub frame_rate: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Figures derived from one stats poll.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QualitySample {
    /// Inbound video bitrate; `None` when no inbound video stream exists.
    pub bandwidth_kbps: Option<u32>,
    pub packet_loss: u64,
    pub latency_ms: u32,
    pub resolution: String,
    pub frame_rate: f64,
}

impl QualitySample {
    /// Coarse label stored on the session row.
    pub fn quality(&self, threshold_kbps: u32) -> NetworkQuality {
        let bw = self.bandwidth_kbps.unwrap_or(0);
        if self.latency_ms > 500 || bw < threshold_kbps {
            NetworkQuality::Poor
        } else if self.latency_ms > 200 || bw < threshold_kbps * 3 {
            NetworkQuality::Good
        } else {
            NetworkQuality::Excellent
        }
    }
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn insert(&self, metric: CallQualityMetric) -> Result<(), StoreError>;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StatsConfig {
    pub interval_ms: u64,
    pub degrade_threshold_kbps: u32,
    /// Consecutive low-bandwidth ticks required before degrading.
    pub degrade_after_ticks: u32,
    pub sink_timeout_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            degrade_threshold_kbps: 200,
            degrade_after_ticks: 1,
            sink_timeout_ms: 2_000,
        }
    }
}

impl StatsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }
}

/// Per-session monitor state. The controller owns the timer and calls in on
/// every tick; this type only does the arithmetic and bookkeeping.
#[derive(Debug)]
pub struct StatsMonitor {
    session_id: String,
    user_id: String,
    config: StatsConfig,
    last_bytes: u64,
    last_at: Instant,
    low_ticks: u32,
    triggered: bool,
    last_recorded_at: Option<DateTime<Utc>>,
}

impl StatsMonitor {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>, config: StatsConfig) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            config,
            last_bytes: 0,
            last_at: Instant::now(),
            low_ticks: 0,
            triggered: false,
            last_recorded_at: None,
        }
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    /// Derive bandwidth from the byte delta since the previous poll.
    pub fn derive(&mut self, stats: &TransportStats, now: Instant) -> QualitySample {
        let elapsed = now.saturating_duration_since(self.last_at);
        let latency_ms = stats
            .round_trip_time
            .map(|rtt| rtt.as_millis().min(u128::from(u32::MAX)) as u32)
            .unwrap_or(0);

        let Some(video) = &stats.inbound_video else {
            self.last_at = now;
            return QualitySample {
                bandwidth_kbps: None,
                packet_loss: 0,
                latency_ms,
                resolution: "unknown".into(),
                frame_rate: 0.0,
            };
        };

        // counters restart when the inbound stream is replaced
        let delta = if video.bytes_received >= self.last_bytes {
            video.bytes_received - self.last_bytes
        } else {
            video.bytes_received
        };
        let bandwidth_kbps = if elapsed.is_zero() {
            None
        } else {
            let kbps = (delta as f64 * 8.0) / elapsed.as_secs_f64() / 1000.0;
            Some(kbps.round().min(f64::from(u32::MAX)) as u32)
        };
        self.last_bytes = video.bytes_received;
        self.last_at = now;

        let resolution = match (video.frame_width, video.frame_height) {
            (Some(w), Some(h)) => format!("{w}x{h}"),
            _ => "unknown".into(),
        };

        QualitySample {
            bandwidth_kbps,
            packet_loss: video.packets_lost,
            latency_ms,
            resolution,
            frame_rate: video.frames_per_second.unwrap_or(0.0),
        }
    }

    /// Build the row for a sample, keeping timestamps strictly increasing.
    pub fn metric(&mut self, sample: &QualitySample, now: DateTime<Utc>) -> CallQualityMetric {
        let recorded_at = match self.last_recorded_at {
            Some(prev) if now <= prev => prev + chrono::Duration::milliseconds(1),
            _ => now,
        };
        self.last_recorded_at = Some(recorded_at);
        CallQualityMetric {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            bandwidth_kbps: sample.bandwidth_kbps.unwrap_or(0),
            packet_loss: sample.packet_loss,
            latency_ms: sample.latency_ms,
            video_resolution: sample.resolution.clone(),
            frame_rate: sample.frame_rate,
            recorded_at,
        }
    }

    /// True exactly once per session: when bandwidth stayed under the
    /// threshold for the configured number of ticks while video was still on.
    pub fn should_degrade(&mut self, sample: &QualitySample, audio_only: bool) -> bool {
        if self.triggered || audio_only {
            return false;
        }
        match sample.bandwidth_kbps {
            Some(kbps) if kbps < self.config.degrade_threshold_kbps => {
                self.low_ticks += 1;
                tracing::debug!(
                    kbps,
                    low_ticks = self.low_ticks,
                    threshold = self.config.degrade_threshold_kbps,
                    "bandwidth under degrade threshold"
                );
            }
            Some(_) => self.low_ticks = 0,
            None => {}
        }
        if self.low_ticks >= self.config.degrade_after_ticks.max(1) {
            self.triggered = true;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::media::InboundVideoStats;

    fn video(bytes: u64) -> TransportStats {
        TransportStats {
            inbound_video: Some(InboundVideoStats {
                bytes_received: bytes,
                packets_lost: 3,
                frame_width: Some(320),
                frame_height: Some(240),
                frames_per_second: Some(15.0),
            }),
            round_trip_time: Some(Duration::from_millis(120)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bandwidth_from_byte_delta() {
        let mut m = StatsMonitor::new("s", "u", StatsConfig::default());
        let start = Instant::now();

        // 93_750 bytes over 5 s = 150 kbps
        let s1 = m.derive(&video(93_750), start + Duration::from_secs(5));
        assert_eq!(s1.bandwidth_kbps, Some(150));
        assert_eq!(s1.resolution, "320x240");
        assert_eq!(s1.latency_ms, 120);

        let s2 = m.derive(&video(93_750 + 250_000), start + Duration::from_secs(10));
        assert_eq!(s2.bandwidth_kbps, Some(400));

        let s3 = m.derive(&TransportStats::default(), start + Duration::from_secs(15));
        assert_eq!(s3.bandwidth_kbps, None);
        assert_eq!(s3.resolution, "unknown");
    }

    #[test]
    fn degrade_triggers_once() {
        let mut m = StatsMonitor::new("s", "u", StatsConfig::default());
        let low = QualitySample {
            bandwidth_kbps: Some(150),
            packet_loss: 0,
            latency_ms: 50,
            resolution: "unknown".into(),
            frame_rate: 0.0,
        };
        let fired: Vec<bool> = (0..3).map(|_| m.should_degrade(&low, false)).collect();
        assert_eq!(fired, vec![true, false, false]);
    }

    #[test]
    fn consecutive_ticks_required() {
        let cfg = StatsConfig {
            degrade_after_ticks: 3,
            ..StatsConfig::default()
        };
        let mut m = StatsMonitor::new("s", "u", cfg);
        let mut sample = QualitySample {
            bandwidth_kbps: Some(100),
            packet_loss: 0,
            latency_ms: 0,
            resolution: "unknown".into(),
            frame_rate: 0.0,
        };
        assert!(!m.should_degrade(&sample, false));
        assert!(!m.should_degrade(&sample, false));
        sample.bandwidth_kbps = Some(900);
        assert!(!m.should_degrade(&sample, false));
        sample.bandwidth_kbps = Some(100);
        assert!(!m.should_degrade(&sample, false));
        assert!(!m.should_degrade(&sample, false));
        assert!(m.should_degrade(&sample, false));
        assert!(!m.should_degrade(&sample, false));
    }

    #[test]
    fn audio_only_never_degrades() {
        let mut m = StatsMonitor::new("s", "u", StatsConfig::default());
        let low = QualitySample {
            bandwidth_kbps: Some(10),
            packet_loss: 0,
            latency_ms: 0,
            resolution: "unknown".into(),
            frame_rate: 0.0,
        };
        assert!(!m.should_degrade(&low, true));
    }

    #[test]
    fn metric_timestamps_increase() {
        let mut m = StatsMonitor::new("s", "u", StatsConfig::default());
        let sample = QualitySample {
            bandwidth_kbps: None,
            packet_loss: 0,
            latency_ms: 0,
            resolution: "unknown".into(),
            frame_rate: 0.0,
        };
        let now = Utc::now();
        let a = m.metric(&sample, now);
        let b = m.metric(&sample, now);
        let c = m.metric(&sample, now - chrono::Duration::seconds(1));
        assert!(a.recorded_at < b.recorded_at);
        assert!(b.recorded_at < c.recorded_at);
        assert_eq!(a.bandwidth_kbps, 0);
        assert_eq!(a.session_id, "s");
    }
}
