//! Core playback types: chat identity, tracks, loop modes

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identity of one chat room
///
/// Unique key into the session registry. The messaging layer decides what the
/// number means; the core only compares and hashes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Policy for re-inserting a finished track
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    /// Finished tracks are dropped
    #[default]
    Off,
    /// The just-finished track replays immediately (re-inserted at the front)
    Song,
    /// The just-finished track is re-appended at the back of the queue
    Queue,
}

impl FromStr for LoopMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "off" => Ok(LoopMode::Off),
            "song" => Ok(LoopMode::Song),
            "queue" => Ok(LoopMode::Queue),
            other => Err(format!("unknown loop mode '{other}' (use off, song or queue)")),
        }
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopMode::Off => write!(f, "off"),
            LoopMode::Song => write!(f, "song"),
            LoopMode::Queue => write!(f, "queue"),
        }
    }
}

/// A playable audio source as returned by the resolver
///
/// `handle` is opaque to the core; the voice transport knows how to turn it
/// into a live stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedSource {
    pub handle: String,
    pub title: String,
    pub duration_secs: u64,
}

/// One playback request in a queue (resolved or not)
#[derive(Debug, Clone, Serialize)]
pub struct Track {
    /// Unique id of this request, assigned at creation
    pub request_id: Uuid,

    /// The raw query the user supplied (search term or URL)
    pub query: String,

    /// Resolved source, absent until resolution succeeds; never overwritten
    pub source: Option<ResolvedSource>,

    /// Display title (the query until resolution provides a real title)
    pub title: String,

    /// Duration in seconds, if known
    pub duration_secs: Option<u64>,

    /// User id of the requester
    pub requested_by: i64,

    /// When the request was made
    pub added_at: DateTime<Utc>,

    /// Resolve attempts so far, for the bounded auto-retry cap
    #[serde(skip)]
    pub(crate) fetch_attempts: u8,
}

impl Track {
    /// Create a new unresolved track from a raw query
    pub fn new(query: impl Into<String>, requested_by: i64) -> Self {
        let query = query.into();
        Self {
            request_id: Uuid::new_v4(),
            title: query.clone(),
            query,
            source: None,
            duration_secs: None,
            requested_by,
            added_at: Utc::now(),
            fetch_attempts: 0,
        }
    }

    /// Attach metadata known up front (e.g. from a search preview)
    pub fn with_metadata(mut self, title: impl Into<String>, duration_secs: u64) -> Self {
        self.title = title.into();
        self.duration_secs = Some(duration_secs);
        self
    }

    /// Record a successful resolution. The source is immutable once set.
    pub(crate) fn apply_source(&mut self, source: ResolvedSource) {
        if self.source.is_some() {
            return;
        }
        self.title = source.title.clone();
        self.duration_secs = Some(source.duration_secs);
        self.source = Some(source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_mode_round_trip() {
        for mode in [LoopMode::Off, LoopMode::Song, LoopMode::Queue] {
            assert_eq!(mode.to_string().parse::<LoopMode>().unwrap(), mode);
        }
        assert!("shuffle".parse::<LoopMode>().is_err());
    }

    #[test]
    fn track_defaults_title_to_query() {
        let track = Track::new("never gonna give you up", 42);
        assert_eq!(track.title, "never gonna give you up");
        assert!(track.source.is_none());
        assert!(track.duration_secs.is_none());
    }

    #[test]
    fn apply_source_is_write_once() {
        let mut track = Track::new("some song", 1);
        track.apply_source(ResolvedSource {
            handle: "sim://a".into(),
            title: "Some Song".into(),
            duration_secs: 180,
        });
        track.apply_source(ResolvedSource {
            handle: "sim://b".into(),
            title: "Other Song".into(),
            duration_secs: 90,
        });

        let source = track.source.unwrap();
        assert_eq!(source.handle, "sim://a");
        assert_eq!(track.title, "Some Song");
        assert_eq!(track.duration_secs, Some(180));
    }
}
