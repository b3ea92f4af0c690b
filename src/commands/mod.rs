pub mod call_api;
pub mod util_api;

pub use call_api::{CallDeps, CallOptions, CallSession, CallState};
