//! Voice transport adapter seam
//!
//! The real-time voice-call transport (joining calls, encoding, muxing) is an
//! external collaborator. The core hands it a resolved source and a channel
//! for stream lifecycle events, and keeps a control handle for the active
//! stream.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::track::{ChatId, ResolvedSource};

/// Transport-layer failures
#[derive(Error, Debug)]
pub enum TransportError {
    /// Stream could not be started (no active call, missing permissions, ...)
    #[error("failed to start stream: {0}")]
    StartFailed(String),

    /// A control operation on an active stream failed
    #[error("stream control failed: {0}")]
    Control(String),
}

/// Asynchronous events a live stream reports back to its session
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The stream played to its natural end
    Ended,

    /// The stream failed. `fatal` distinguishes infrastructure failure (the
    /// session must stop) from a transient hiccup (drop the track, advance).
    Error { fatal: bool, message: String },
}

/// Control handle for one active stream
#[async_trait]
pub trait StreamControl: Send + Sync {
    /// Apply a new volume (1-200) without interrupting the stream
    async fn set_volume(&self, volume: u16) -> Result<(), TransportError>;

    async fn pause(&self) -> Result<(), TransportError>;

    async fn resume(&self) -> Result<(), TransportError>;

    /// Tear the stream down. No further events are expected after this.
    async fn cancel(&self) -> Result<(), TransportError>;
}

/// Accepts a decoded audio source and pushes it into the live call
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Start streaming `source` into the chat's live voice session.
    ///
    /// Lifecycle events for this stream are pushed into `events`. The session
    /// tags events with the stream they belong to, so a late event from a
    /// replaced stream is recognized and ignored.
    async fn start_stream(
        &self,
        chat: ChatId,
        source: &ResolvedSource,
        volume: u16,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn StreamControl>, TransportError>;
}
