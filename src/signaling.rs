//! Out-of-band signaling: offer / answer / ICE candidate relay between the
//! two peers of a session, keyed by session id and receiver id.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::SignalingError;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::utils::random_id;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Offer,
    Answer,
    IceCandidate,
    Renegotiate,
}

impl MessageType {
    /// Offer and answer are required for establishment; losing one aborts the session.
    pub fn is_critical(self) -> bool {
        matches!(self, MessageType::Offer | MessageType::Answer)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Offer => "offer",
            MessageType::Answer => "answer",
            MessageType::IceCandidate => "ice-candidate",
            MessageType::Renegotiate => "renegotiate",
        };
        f.write_str(s)
    }
}

/// A relayed row. Never mutated after creation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignalingMessage {
    pub id: String,
    pub session_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub message_type: MessageType,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl SignalingMessage {
    pub fn new(
        session_id: &str,
        sender_id: &str,
        receiver_id: &str,
        message_type: MessageType,
        payload: Value,
    ) -> Self {
        Self {
            id: random_id(),
            session_id: session_id.to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            message_type,
            payload,
            created_at: Utc::now(),
        }
    }
}

pub fn description_payload(desc: &SessionDescription) -> Value {
    json!({ "type": desc.sdp_type, "sdp": desc.sdp })
}

pub fn candidate_payload(candidate: &IceCandidate) -> Value {
    json!({ "candidate": candidate })
}

/// Storage/relay boundary: append a row, observe rows addressed to a receiver.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn insert(&self, message: SignalingMessage) -> Result<(), SignalingError>;

    /// Push subscription for rows with this session and receiver. Dropping the
    /// receiver ends the subscription.
    async fn observe(
        &self,
        session_id: &str,
        receiver_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, SignalingError>;
}

/// Decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    Renegotiate(Value),
    /// An offer or answer whose payload could not be decoded. Negotiation
    /// cannot proceed without it, so it is handed up instead of dropped.
    Malformed(SignalingError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundSignal {
    pub message_id: String,
    pub sender_id: String,
    pub signal: Signal,
}

impl InboundSignal {
    pub fn decode(message: &SignalingMessage) -> Result<Self, SignalingError> {
        let malformed = |e: serde_json::Error| SignalingError::MalformedPayload {
            kind: message.message_type,
            reason: e.to_string(),
        };
        let signal = match message.message_type {
            MessageType::Offer => {
                Signal::Offer(serde_json::from_value(message.payload.clone()).map_err(malformed)?)
            }
            MessageType::Answer => {
                Signal::Answer(serde_json::from_value(message.payload.clone()).map_err(malformed)?)
            }
            MessageType::IceCandidate => {
                // `{"candidate": {...}}`, bare candidate objects are accepted as well
                let raw = message
                    .payload
                    .get("candidate")
                    .filter(|c| c.is_object())
                    .unwrap_or(&message.payload);
                Signal::IceCandidate(serde_json::from_value(raw.clone()).map_err(malformed)?)
            }
            MessageType::Renegotiate => Signal::Renegotiate(message.payload.clone()),
        };
        Ok(Self {
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            signal,
        })
    }
}

/// Explicitly owned signaling client handed to each session controller.
#[derive(Clone)]
pub struct SignalingChannel {
    transport: Arc<dyn SignalingTransport>,
}

impl SignalingChannel {
    pub fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        Self { transport }
    }

    /// Send one message. Offer/answer failures are returned; failures of
    /// ICE candidates and renegotiation hints are logged and swallowed.
    pub async fn send(
        &self,
        session_id: &str,
        sender_id: &str,
        receiver_id: &str,
        message_type: MessageType,
        payload: Value,
    ) -> Result<(), SignalingError> {
        let message = SignalingMessage::new(session_id, sender_id, receiver_id, message_type, payload);
        let id = message.id.clone();
        match self.transport.insert(message).await {
            Ok(()) => {
                tracing::debug!(session = session_id, kind = %message_type, id = %id, "signaling message sent");
                Ok(())
            }
            Err(e) if message_type.is_critical() => {
                tracing::error!(session = session_id, kind = %message_type, error = %e, "failed to send signaling message");
                Err(e)
            }
            Err(e) => {
                tracing::warn!(session = session_id, kind = %message_type, error = %e, "dropping non-critical signaling message");
                Ok(())
            }
        }
    }

    pub async fn subscribe(&self, session_id: &str, self_id: &str) -> Result<Subscription, SignalingError> {
        let rx = self.transport.observe(session_id, self_id).await?;
        tracing::info!(session = session_id, receiver = self_id, "signaling subscription opened");
        Ok(Subscription {
            session_id: session_id.to_string(),
            self_id: self_id.to_string(),
            rx: Some(rx),
            seen: RecentIds::default(),
        })
    }
}

/// Live push subscription. Unsubscribes on drop.
pub struct Subscription {
    session_id: String,
    self_id: String,
    rx: Option<mpsc::UnboundedReceiver<SignalingMessage>>,
    seen: RecentIds,
}

/// Ids of the last few delivered messages. Redeliveries arrive close to the
/// original, so only a bounded window is kept.
#[derive(Default)]
struct RecentIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl RecentIds {
    const CAPACITY: usize = 256;

    /// False if `id` is already in the window.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == Self::CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

impl Subscription {
    /// Next signal addressed to us. Duplicate deliveries are skipped, as are
    /// malformed ICE candidates and renegotiation hints; a malformed offer or
    /// answer comes back as [`Signal::Malformed`]. `None` once unsubscribed or
    /// closed.
    pub async fn recv(&mut self) -> Option<InboundSignal> {
        loop {
            let message = self.rx.as_mut()?.recv().await?;
            if message.session_id != self.session_id || message.receiver_id != self.self_id {
                continue;
            }
            if !self.seen.insert(&message.id) {
                tracing::debug!(id = %message.id, kind = %message.message_type, "duplicate signaling delivery ignored");
                continue;
            }
            match InboundSignal::decode(&message) {
                Ok(signal) => return Some(signal),
                Err(e) if message.message_type.is_critical() => {
                    tracing::warn!(id = %message.id, error = %e, "malformed signaling message");
                    return Some(InboundSignal {
                        message_id: message.id,
                        sender_id: message.sender_id,
                        signal: Signal::Malformed(e),
                    });
                }
                Err(e) => tracing::warn!(id = %message.id, error = %e, "ignoring malformed signaling message"),
            }
        }
    }

    /// Idempotent.
    pub fn unsubscribe(&mut self) {
        if self.rx.take().is_some() {
            tracing::info!(session = %self.session_id, receiver = %self.self_id, "signaling subscription closed");
        }
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

struct Subscriber {
    session_id: String,
    receiver_id: String,
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

#[derive(Default)]
struct Relay {
    log: Vec<SignalingMessage>,
    subscribers: Vec<Subscriber>,
    unavailable: bool,
    duplicate_deliveries: bool,
}

/// In-process relay: an append-only message log plus live push to matching
/// subscribers. Messages sent while nobody is subscribed are not replayed.
#[derive(Default)]
pub struct MemorySignaling {
    relay: Mutex<Relay>,
}

impl MemorySignaling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: inserts and new subscriptions fail while unavailable.
    pub fn set_available(&self, available: bool) {
        if let Ok(mut relay) = self.relay.lock() {
            relay.unavailable = !available;
        }
    }

    /// Deliver every message twice, as an at-least-once relay may.
    pub fn set_duplicate_deliveries(&self, enabled: bool) {
        if let Ok(mut relay) = self.relay.lock() {
            relay.duplicate_deliveries = enabled;
        }
    }

    /// Every message accepted so far, in insertion order.
    pub fn messages(&self) -> Vec<SignalingMessage> {
        self.relay.lock().map(|r| r.log.clone()).unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.relay
            .lock()
            .map(|r| r.subscribers.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SignalingTransport for MemorySignaling {
    async fn insert(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let mut relay = self
            .relay
            .lock()
            .map_err(|_| SignalingError::Unavailable("relay lock poisoned".into()))?;
        if relay.unavailable {
            return Err(SignalingError::Unavailable("relay offline".into()));
        }
        let copies = if relay.duplicate_deliveries { 2 } else { 1 };
        relay.subscribers.retain(|s| !s.tx.is_closed());
        for sub in relay
            .subscribers
            .iter()
            .filter(|s| s.session_id == message.session_id && s.receiver_id == message.receiver_id)
        {
            for _ in 0..copies {
                let _ = sub.tx.send(message.clone());
            }
        }
        relay.log.push(message);
        Ok(())
    }

    async fn observe(
        &self,
        session_id: &str,
        receiver_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, SignalingError> {
        let mut relay = self
            .relay
            .lock()
            .map_err(|_| SignalingError::Unavailable("relay lock poisoned".into()))?;
        if relay.unavailable {
            return Err(SignalingError::Unavailable("relay offline".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        relay.subscribers.push(Subscriber {
            session_id: session_id.to_string(),
            receiver_id: receiver_id.to_string(),
            tx,
        });
        Ok(rx)
    }
}
