//! Per-chat playback: queue, session state machine, and session registry

mod queue;
mod registry;
mod session;

pub use queue::TrackQueue;
pub use registry::SessionRegistry;
pub use session::{NowPlaying, SessionHandle, SessionState, SessionStatus};
