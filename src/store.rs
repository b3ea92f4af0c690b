//! External record boundaries: session rows and quality metrics.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::prober::NetworkQuality;
use crate::session::{Session, SessionStatus};
use crate::stats::{CallQualityMetric, MetricsSink};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new row; `AlreadyExists` when the id is taken.
    async fn create(&self, session: Session) -> Result<(), StoreError>;
    async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn update_quality(&self, session_id: &str, quality: NetworkQuality) -> Result<(), StoreError>;
    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    rows: Mutex<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Session>>, StoreError> {
        self.rows
            .lock()
            .map_err(|_| StoreError::Unavailable("session store lock poisoned".into()))
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: Session) -> Result<(), StoreError> {
        let mut rows = self.rows()?;
        if rows.contains_key(&session.id) {
            return Err(StoreError::AlreadyExists(session.id));
        }
        rows.insert(session.id.clone(), session);
        Ok(())
    }

    async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows()?;
        let row = rows
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        if row.status != status && !row.transition(status, at) {
            tracing::debug!(session = session_id, from = ?row.status, to = ?status, "ignoring status regression");
        }
        Ok(())
    }

    async fn update_quality(&self, session_id: &str, quality: NetworkQuality) -> Result<(), StoreError> {
        let mut rows = self.rows()?;
        let row = rows
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        row.connection_quality = quality;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.rows()?.get(session_id).cloned())
    }
}

/// Append-only metric log; can be switched to failing to exercise the
/// non-fatal persistence path.
#[derive(Default)]
pub struct MemoryMetricsSink {
    rows: Mutex<Vec<CallQualityMetric>>,
    failing: Mutex<bool>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut f) = self.failing.lock() {
            *f = failing;
        }
    }

    pub fn rows(&self) -> Vec<CallQualityMetric> {
        self.rows.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn rows_for(&self, session_id: &str, user_id: &str) -> Vec<CallQualityMetric> {
        self.rows()
            .into_iter()
            .filter(|m| m.session_id == session_id && m.user_id == user_id)
            .collect()
    }
}

#[async_trait]
impl MetricsSink for MemoryMetricsSink {
    async fn insert(&self, metric: CallQualityMetric) -> Result<(), StoreError> {
        if self.failing.lock().map(|f| *f).unwrap_or(false) {
            return Err(StoreError::Unavailable("metrics store offline".into()));
        }
        self.rows
            .lock()
            .map_err(|_| StoreError::Unavailable("metrics lock poisoned".into()))?
            .push(metric);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionKind;

    #[tokio::test]
    async fn duplicate_create_reports_exists() {
        let store = MemorySessionStore::new();
        store
            .create(Session::new("s", "p", "d", SessionKind::Video))
            .await
            .unwrap();
        let err = store
            .create(Session::new("s", "p", "d", SessionKind::Video))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists("s".into()));
    }

    #[tokio::test]
    async fn status_updates_follow_lifecycle() {
        let store = MemorySessionStore::new();
        store
            .create(Session::new("s", "p", "d", SessionKind::AudioOnly))
            .await
            .unwrap();
        store.update_status("s", SessionStatus::Active, Utc::now()).await.unwrap();
        store.update_status("s", SessionStatus::Ended, Utc::now()).await.unwrap();
        store.update_status("s", SessionStatus::Active, Utc::now()).await.unwrap();

        let row = store.get("s").await.unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Ended);
        assert!(row.started_at.is_some() && row.ended_at.is_some());

        let missing = store.update_status("x", SessionStatus::Active, Utc::now()).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn failing_sink_rejects() {
        let sink = MemoryMetricsSink::new();
        sink.set_failing(true);
        let metric = CallQualityMetric {
            session_id: "s".into(),
            user_id: "u".into(),
            bandwidth_kbps: 1,
            packet_loss: 0,
            latency_ms: 0,
            video_resolution: "unknown".into(),
            frame_rate: 0.0,
            recorded_at: Utc::now(),
        };
        assert!(sink.insert(metric.clone()).await.is_err());
        sink.set_failing(false);
        sink.insert(metric).await.unwrap();
        assert_eq!(sink.rows_for("s", "u").len(), 1);
    }
}
