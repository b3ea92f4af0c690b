pub mod connection;
pub mod ice;
pub mod media;
pub mod rtc;
pub mod state;
pub mod types;

pub use connection::{ControllerDeps, SessionController, SessionIdentity};
pub use media::{LocalMediaSource, LocalStream, LocalTrack, MediaTransport, TransportFactory};
pub use state::{ConnectionState, SessionSnapshot};
pub use types::{IceCandidate, ServerConfig, SessionDescription, TrackKind};
