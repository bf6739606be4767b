//! vc-jukebox - per-chat audio playback session management
//!
//! Manages one playback session per chat: a bounded request queue, a
//! linearized command surface (play, pause, resume, skip, stop, volume, loop
//! mode, shuffle), and delivery of resolved audio into a live voice call via
//! a pluggable transport. Source lookup and decode priming run on a shared
//! bounded worker pool so a burst in one chat cannot starve the rest.
//!
//! Entry point is [`SessionRegistry`]: give it a [`SourceResolver`] and a
//! [`VoiceTransport`], then drive per-chat [`SessionHandle`]s. Session
//! lifecycle notifications arrive on the registry's [`EventBus`].

pub mod config;
pub mod error;
pub mod events;
pub mod fetch;
pub mod playback;
pub mod resolver;
pub mod sim;
pub mod track;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{EventBus, SessionEvent};
pub use playback::{NowPlaying, SessionHandle, SessionRegistry, SessionState, SessionStatus};
pub use resolver::{ResolveError, SourceResolver};
pub use track::{ChatId, LoopMode, ResolvedSource, Track};
pub use transport::{StreamControl, TransportError, TransportEvent, VoiceTransport};
