//! Consultation session rows as held by the external session store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::prober::NetworkQuality;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    Video,
    AudioOnly,
    Chat,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Waiting,
    Active,
    Ended,
    Cancelled,
}

impl SessionStatus {
    /// `waiting -> active -> ended`, and `waiting -> cancelled`.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Waiting, SessionStatus::Active)
                | (SessionStatus::Waiting, SessionStatus::Cancelled)
                | (SessionStatus::Waiting, SessionStatus::Ended)
                | (SessionStatus::Active, SessionStatus::Ended)
        )
    }

    pub fn is_final(self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Cancelled)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub initiator_id: String,
    pub responder_id: String,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub connection_quality: NetworkQuality,
    pub recording_enabled: bool,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        initiator_id: impl Into<String>,
        responder_id: impl Into<String>,
        kind: SessionKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            initiator_id: initiator_id.into(),
            responder_id: responder_id.into(),
            kind,
            status: SessionStatus::Waiting,
            started_at: None,
            ended_at: None,
            connection_quality: NetworkQuality::Good,
            recording_enabled: false,
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status change, stamping start/end times. Returns false if the
    /// transition is not allowed and leaves the row untouched.
    pub fn transition(&mut self, next: SessionStatus, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        match next {
            SessionStatus::Active => self.started_at = Some(at),
            SessionStatus::Ended | SessionStatus::Cancelled => self.ended_at = Some(at),
            SessionStatus::Waiting => {}
        }
        self.status = next;
        self.updated_at = at;
        true
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.initiator_id == user_id || self.responder_id == user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_stamps_times() {
        let mut s = Session::new("s1", "patient", "doctor", SessionKind::Video);
        assert_eq!(s.status, SessionStatus::Waiting);

        let t1 = Utc::now();
        assert!(s.transition(SessionStatus::Active, t1));
        assert_eq!(s.started_at, Some(t1));

        assert!(!s.transition(SessionStatus::Cancelled, t1));
        assert_eq!(s.status, SessionStatus::Active);

        let t2 = Utc::now();
        assert!(s.transition(SessionStatus::Ended, t2));
        assert_eq!(s.ended_at, Some(t2));
        assert!(s.status.is_final());
        assert!(!s.transition(SessionStatus::Active, t2));
    }

    #[test]
    fn kind_serializes_kebab() {
        let v = serde_json::to_value(SessionKind::AudioOnly).unwrap();
        assert_eq!(v, "audio-only");
    }
}
