//! Event system for vc-jukebox
//!
//! The core emits user-facing notification events; the messaging layer
//! renders them. Communication is hybrid:
//! - **EventBus** (tokio::broadcast): one-to-many notification fan-out
//! - **Command channels** (tokio::mpsc): request → single session actor
//!
//! Every command produces exactly one synchronous reply; everything that
//! happens asynchronously afterwards (a track actually starting, a fetch
//! failing) surfaces here as a separate event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::playback::SessionState;
use crate::track::{ChatId, LoopMode};

/// What caused a queue modification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueChangeTrigger {
    Enqueue,
    Dequeue,
    Clear,
    Shuffle,
    LoopReinsert,
}

/// Why a session stopped
///
/// `TransportFailure` is reported distinctly from a user stop so operators
/// can tell infrastructure failure from normal use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCause {
    User,
    TransportFailure,
}

/// Notification events emitted by playback sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// A track started streaming into the chat's voice session
    TrackStarted {
        chat: ChatId,
        request_id: Uuid,
        title: String,
        duration_secs: u64,
        timestamp: DateTime<Utc>,
    },

    /// A track left the playing slot. `completed` is false for a skip.
    TrackFinished {
        chat: ChatId,
        request_id: Uuid,
        title: String,
        completed: bool,
        timestamp: DateTime<Utc>,
    },

    /// A track was dropped without ever playing (resolve failure, timeout,
    /// over-duration source, stream start failure)
    TrackFailed {
        chat: ChatId,
        request_id: Uuid,
        title: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Queue contents changed
    QueueChanged {
        chat: ChatId,
        len: usize,
        trigger: QueueChangeTrigger,
        timestamp: DateTime<Utc>,
    },

    /// Session state machine transitioned
    PlaybackStateChanged {
        chat: ChatId,
        state: SessionState,
        timestamp: DateTime<Utc>,
    },

    /// Volume applied to the active stream
    VolumeChanged {
        chat: ChatId,
        volume: u16,
        timestamp: DateTime<Utc>,
    },

    /// Loop policy changed
    LoopModeChanged {
        chat: ChatId,
        mode: LoopMode,
        timestamp: DateTime<Utc>,
    },

    /// Session reached its terminal state
    SessionStopped {
        chat: ChatId,
        cause: StopCause,
        timestamp: DateTime<Utc>,
    },
}

impl SessionEvent {
    /// The chat this event belongs to
    pub fn chat(&self) -> ChatId {
        match self {
            SessionEvent::TrackStarted { chat, .. }
            | SessionEvent::TrackFinished { chat, .. }
            | SessionEvent::TrackFailed { chat, .. }
            | SessionEvent::QueueChanged { chat, .. }
            | SessionEvent::PlaybackStateChanged { chat, .. }
            | SessionEvent::VolumeChanged { chat, .. }
            | SessionEvent::LoopModeChanged { chat, .. }
            | SessionEvent::SessionStopped { chat, .. } => *chat,
        }
    }
}

/// One-to-many event broadcaster backed by tokio::broadcast
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring the no-subscribers case
    pub fn emit_lossy(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eventbus_subscribe_counts() {
        let bus = EventBus::new(16);
        assert_eq!(bus.capacity(), 16);
        assert_eq!(bus.subscriber_count(), 0);

        let _rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn eventbus_delivers_to_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit_lossy(SessionEvent::VolumeChanged {
            chat: ChatId(7),
            volume: 150,
            timestamp: Utc::now(),
        });

        match rx.recv().await.unwrap() {
            SessionEvent::VolumeChanged { chat, volume, .. } => {
                assert_eq!(chat, ChatId(7));
                assert_eq!(volume, 150);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn eventbus_emit_without_subscribers_is_lossy() {
        let bus = EventBus::new(16);
        bus.emit_lossy(SessionEvent::QueueChanged {
            chat: ChatId(1),
            len: 0,
            trigger: QueueChangeTrigger::Clear,
            timestamp: Utc::now(),
        });
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = SessionEvent::SessionStopped {
            chat: ChatId(9),
            cause: StopCause::TransportFailure,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"SessionStopped\""));
        assert!(json.contains("transport_failure"));
    }
}
