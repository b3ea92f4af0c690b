//! Ambient network quality classification, independent of any live call.
//!
//! The prober reads the platform's link-type and downlink hints, times a
//! lightweight probe as a latency proxy and folds both into an
//! `excellent` / `good` / `poor` label. The result is advisory: it picks the
//! pre-call profile and feeds the UI, while the stats monitor is authoritative
//! once a call is live.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Poor,
    Good,
    Excellent,
}

impl fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkQuality::Poor => f.write_str("poor"),
            NetworkQuality::Good => f.write_str("good"),
            NetworkQuality::Excellent => f.write_str("excellent"),
        }
    }
}

/// Effective connection type as reported by the platform.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
    #[serde(rename = "unknown")]
    Unknown,
}

impl LinkType {
    pub fn is_low_tier(self) -> bool {
        matches!(self, LinkType::Slow2g | LinkType::TwoG)
    }
}

impl FromStr for LinkType {
    type Err = std::convert::Infallible;

    /// Unrecognised hints map to `Unknown` rather than failing.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "slow-2g" => LinkType::Slow2g,
            "2g" => LinkType::TwoG,
            "3g" => LinkType::ThreeG,
            "4g" => LinkType::FourG,
            _ => LinkType::Unknown,
        })
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkType::Slow2g => "slow-2g",
            LinkType::TwoG => "2g",
            LinkType::ThreeG => "3g",
            LinkType::FourG => "4g",
            LinkType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Platform connection hints.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkHints {
    pub link_type: LinkType,
    /// Downlink estimate in Mbit/s, 0 when unknown.
    pub downlink_mbps: f64,
}

impl Default for NetworkHints {
    fn default() -> Self {
        Self {
            link_type: LinkType::Unknown,
            downlink_mbps: 0.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ProberConfig {
    pub interval_ms: u64,
    pub probe_target: String,
    pub probe_timeout_ms: u64,
    /// Downlink (Mbit/s) above which a 4g link counts as excellent.
    pub excellent_downlink_mbps: f64,
    /// Downlink (Mbit/s) under which an unclassified link counts as poor.
    pub poor_downlink_mbps: f64,
    /// Latency above which the result is capped at good.
    pub moderate_latency_ms: u64,
    /// Latency above which the result is forced to poor.
    pub high_latency_ms: u64,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            probe_target: "www.google.com:443".into(),
            probe_timeout_ms: 3_000,
            excellent_downlink_mbps: 5.0,
            poor_downlink_mbps: 1.0,
            moderate_latency_ms: 200,
            high_latency_ms: 500,
        }
    }
}

impl ProberConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Ordered classification rules followed by the latency override.
pub fn classify(hints: NetworkHints, latency: Duration, config: &ProberConfig) -> NetworkQuality {
    let NetworkHints {
        link_type,
        downlink_mbps,
    } = hints;

    let mut quality = if link_type == LinkType::FourG && downlink_mbps > config.excellent_downlink_mbps {
        NetworkQuality::Excellent
    } else if link_type == LinkType::ThreeG || link_type == LinkType::FourG {
        NetworkQuality::Good
    } else if link_type.is_low_tier() || downlink_mbps < config.poor_downlink_mbps {
        NetworkQuality::Poor
    } else {
        NetworkQuality::Good
    };

    let latency_ms = latency.as_millis();
    if latency_ms > u128::from(config.high_latency_ms) {
        quality = NetworkQuality::Poor;
    } else if latency_ms > u128::from(config.moderate_latency_ms)
        && quality == NetworkQuality::Excellent
    {
        quality = NetworkQuality::Good;
    }
    quality
}

/// Source of link-type / downlink hints.
pub trait NetworkHintSource: Send + Sync {
    fn hints(&self) -> NetworkHints;
}

/// Hints pushed in by the host platform whenever it learns something new.
#[derive(Debug, Default)]
pub struct SharedHints {
    inner: Mutex<NetworkHints>,
}

impl SharedHints {
    pub fn new(hints: NetworkHints) -> Self {
        Self {
            inner: Mutex::new(hints),
        }
    }

    pub fn update(&self, hints: NetworkHints) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = hints;
        }
    }
}

impl NetworkHintSource for SharedHints {
    fn hints(&self) -> NetworkHints {
        self.inner.lock().map(|g| *g).unwrap_or_default()
    }
}

/// A round-trip probe. Only its duration matters; errors are tolerated.
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    async fn probe(&self) -> Result<(), String>;
}

/// Opens (and drops) a TCP connection to the probe target.
pub struct TcpProbe {
    target: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
        }
    }

    pub fn from_config(config: &ProberConfig) -> Self {
        Self::new(config.probe_target.clone(), config.probe_timeout())
    }
}

#[async_trait]
impl LatencyProbe for TcpProbe {
    async fn probe(&self) -> Result<(), String> {
        match timeout(self.timeout, TcpStream::connect(&self.target)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("probe to {} timed out", self.target)),
        }
    }
}

/// Result of one quality check.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NetworkReport {
    pub quality: NetworkQuality,
    pub link_type: LinkType,
    pub bandwidth_kbps: u32,
    pub latency_ms: u64,
}

pub struct NetworkQualityProber {
    hints: Arc<dyn NetworkHintSource>,
    probe: Arc<dyn LatencyProbe>,
    config: ProberConfig,
}

impl NetworkQualityProber {
    pub fn new(
        hints: Arc<dyn NetworkHintSource>,
        probe: Arc<dyn LatencyProbe>,
        config: ProberConfig,
    ) -> Self {
        Self {
            hints,
            probe,
            config,
        }
    }

    /// Run one on-demand check.
    pub async fn check(&self) -> NetworkReport {
        let hints = self.hints.hints();

        let started = Instant::now();
        if let Err(e) = self.probe.probe().await {
            tracing::debug!(error = %e, "network probe failed; keeping elapsed time");
        }
        let latency = started.elapsed();

        let quality = classify(hints, latency, &self.config);
        let report = NetworkReport {
            quality,
            link_type: hints.link_type,
            bandwidth_kbps: (hints.downlink_mbps.max(0.0) * 1000.0).round() as u32,
            latency_ms: latency.as_millis() as u64,
        };
        tracing::debug!(
            quality = %report.quality,
            link = %report.link_type,
            bandwidth_kbps = report.bandwidth_kbps,
            latency_ms = report.latency_ms,
            "network quality checked"
        );
        report
    }

    /// Check immediately and then on every interval, handing each report to `on_report`.
    pub fn spawn<F>(self, mut on_report: F) -> ProberHandle
    where
        F: FnMut(NetworkReport) + Send + 'static,
    {
        let period = self.config.interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = self.check().await;
                on_report(report);
            }
        });
        ProberHandle { task: Some(task) }
    }
}

/// Stops the periodic prober on `stop()` or drop.
pub struct ProberHandle {
    task: Option<JoinHandle<()>>,
}

impl ProberHandle {
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for ProberHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hints(link: &str, downlink: f64) -> NetworkHints {
        NetworkHints {
            link_type: link.parse().unwrap(),
            downlink_mbps: downlink,
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn fast_4g_is_excellent() {
        let cfg = ProberConfig::default();
        assert_eq!(classify(hints("4g", 6.0), ms(50), &cfg), NetworkQuality::Excellent);
    }

    #[test]
    fn moderate_latency_caps_excellent() {
        let cfg = ProberConfig::default();
        assert_eq!(classify(hints("4g", 6.0), ms(250), &cfg), NetworkQuality::Good);
    }

    #[test]
    fn low_tier_link_is_poor_regardless_of_downlink() {
        let cfg = ProberConfig::default();
        for link in ["2g", "slow-2g"] {
            assert_eq!(classify(hints(link, 50.0), ms(10), &cfg), NetworkQuality::Poor);
        }
    }

    #[test]
    fn low_downlink_on_unknown_link_is_poor() {
        let cfg = ProberConfig::default();
        assert_eq!(classify(hints("unknown", 0.5), ms(10), &cfg), NetworkQuality::Poor);
        assert_eq!(classify(hints("wifi", 2.0), ms(10), &cfg), NetworkQuality::Good);
    }

    #[test]
    fn mid_tier_and_slow_4g_are_good() {
        let cfg = ProberConfig::default();
        assert_eq!(classify(hints("3g", 0.2), ms(10), &cfg), NetworkQuality::Good);
        assert_eq!(classify(hints("4g", 5.0), ms(10), &cfg), NetworkQuality::Good);
    }

    #[test]
    fn high_latency_forces_poor() {
        let cfg = ProberConfig::default();
        assert_eq!(classify(hints("4g", 50.0), ms(501), &cfg), NetworkQuality::Poor);
        assert_eq!(classify(hints("3g", 2.0), ms(600), &cfg), NetworkQuality::Poor);
    }

    struct FailingProbe;

    #[async_trait]
    impl LatencyProbe for FailingProbe {
        async fn probe(&self) -> Result<(), String> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Err("connection refused".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_still_measures_latency() {
        let prober = NetworkQualityProber::new(
            Arc::new(SharedHints::new(hints("4g", 8.0))),
            Arc::new(FailingProbe),
            ProberConfig::default(),
        );
        let report = prober.check().await;
        assert!(report.latency_ms >= 300);
        assert_eq!(report.quality, NetworkQuality::Good);
        assert_eq!(report.bandwidth_kbps, 8000);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_checks_until_stopped() {
        let shared = Arc::new(SharedHints::default());
        let prober = NetworkQualityProber::new(
            shared.clone(),
            Arc::new(FailingProbe),
            ProberConfig::default(),
        );
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handle = prober.spawn(move |report| {
            let _ = tx.send(report.quality);
        });

        assert_eq!(rx.recv().await, Some(NetworkQuality::Poor));
        shared.update(hints("4g", 10.0));
        assert_eq!(rx.recv().await, Some(NetworkQuality::Good));

        handle.stop();
        assert!(!handle.is_running());
        assert_eq!(rx.recv().await, None);
    }
}
