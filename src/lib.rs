//! Adaptive media-session engine for two-party telemedicine calls.
//!
//! A [`commands::CallSession`] drives one participant's side of a
//! consultation: capture under a bandwidth-aware profile, offer/answer and
//! trickled ICE over a pluggable signaling relay, live quality metrics and a
//! one-way fallback to audio-only when the link cannot carry video.

pub mod adaptation;
pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod prober;
pub mod session;
pub mod signaling;
pub mod stats;
pub mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod utils;

pub use commands::{CallDeps, CallOptions, CallSession, CallState};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use peer::{ConnectionState, SessionController, SessionSnapshot};
pub use prober::{NetworkQuality, NetworkQualityProber};
