//! Per-chat track queue
//!
//! Plain data structure owned exclusively by the session actor; the actor's
//! mailbox is the serialization boundary, so the queue itself carries no
//! locking. Insertion order is play order unless shuffled. Loop re-insertion
//! is performed by the session after a track finishes, not by the queue.

use std::collections::VecDeque;

use rand::seq::SliceRandom;
use tracing::warn;

use crate::error::{Error, Result};
use crate::track::{LoopMode, Track};

/// Ordered sequence of pending requests plus loop policy
#[derive(Debug)]
pub struct TrackQueue {
    entries: VecDeque<Track>,
    loop_mode: LoopMode,
    max_size: usize,
    max_duration_secs: u64,
}

impl TrackQueue {
    pub fn new(max_size: usize, max_duration_secs: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            loop_mode: LoopMode::Off,
            max_size,
            max_duration_secs,
        }
    }

    /// Append a track, preserving insertion order
    ///
    /// Fails with `QueueFull` at the size bound and `DurationExceeded` when
    /// the duration is already known and over the cap. Failed enqueues leave
    /// the queue unchanged. Returns the 1-based queue position.
    pub fn enqueue(&mut self, track: Track) -> Result<usize> {
        if self.entries.len() >= self.max_size {
            return Err(Error::QueueFull {
                limit: self.max_size,
            });
        }
        if let Some(duration) = track.duration_secs {
            if duration > self.max_duration_secs {
                return Err(Error::DurationExceeded {
                    actual: duration,
                    limit: self.max_duration_secs,
                });
            }
        }

        self.entries.push_back(track);
        Ok(self.entries.len())
    }

    /// Remove and return the head track
    pub fn dequeue_next(&mut self) -> Option<Track> {
        self.entries.pop_front()
    }

    /// Loop re-insertion at the front (`loop=song`)
    ///
    /// If the queue refilled to its bound while the track was playing, the
    /// re-inserted track is dropped rather than overflowing the limit.
    pub(crate) fn requeue_front(&mut self, track: Track) -> bool {
        if self.entries.len() >= self.max_size {
            warn!("queue full, dropping loop re-insertion of '{}'", track.title);
            return false;
        }
        self.entries.push_front(track);
        true
    }

    /// Loop re-insertion at the back (`loop=queue`)
    pub(crate) fn requeue_back(&mut self, track: Track) -> bool {
        if self.entries.len() >= self.max_size {
            warn!("queue full, dropping loop re-insertion of '{}'", track.title);
            return false;
        }
        self.entries.push_back(track);
        true
    }

    /// Uniformly permute the queued entries (Fisher-Yates)
    ///
    /// Only pending entries are touched; the currently playing track lives in
    /// the session, not here.
    pub fn shuffle(&mut self) {
        self.entries
            .make_contiguous()
            .shuffle(&mut rand::thread_rng());
    }

    /// Drop all entries, returning how many were removed
    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }

    /// Takes effect on the next track-finished transition
    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    /// Cloned snapshot of the first `n` entries, for display
    pub fn peek(&self, n: usize) -> Vec<Track> {
        self.entries.iter().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn track(query: &str) -> Track {
        Track::new(query, 1)
    }

    #[test]
    fn enqueue_preserves_insertion_order() {
        let mut queue = TrackQueue::new(10, 1800);
        assert_eq!(queue.enqueue(track("a")).unwrap(), 1);
        assert_eq!(queue.enqueue(track("b")).unwrap(), 2);
        assert_eq!(queue.enqueue(track("c")).unwrap(), 3);

        assert_eq!(queue.dequeue_next().unwrap().query, "a");
        assert_eq!(queue.dequeue_next().unwrap().query, "b");
        assert_eq!(queue.dequeue_next().unwrap().query, "c");
        assert!(queue.dequeue_next().is_none());
    }

    #[test]
    fn enqueue_beyond_bound_fails_and_leaves_queue_unchanged() {
        let mut queue = TrackQueue::new(3, 1800);
        for i in 0..3 {
            queue.enqueue(track(&format!("t{i}"))).unwrap();
        }

        let err = queue.enqueue(track("overflow")).unwrap_err();
        assert!(matches!(err, Error::QueueFull { limit: 3 }));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peek(1)[0].query, "t0");
    }

    #[test]
    fn enqueue_rejects_over_duration_tracks_when_known() {
        let mut queue = TrackQueue::new(10, 600);

        // Unknown duration is admitted; the session enforces the cap after
        // resolution instead.
        queue.enqueue(track("unknown")).unwrap();

        let long = track("long").with_metadata("Long Mix", 601);
        let err = queue.enqueue(long).unwrap_err();
        assert!(matches!(
            err,
            Error::DurationExceeded {
                actual: 601,
                limit: 600
            }
        ));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn shuffle_preserves_the_multiset() {
        let mut queue = TrackQueue::new(50, 1800);
        for i in 0..20 {
            queue.enqueue(track(&format!("t{i}"))).unwrap();
        }

        let before: HashSet<_> = queue.peek(20).iter().map(|t| t.request_id).collect();
        queue.shuffle();
        let after: HashSet<_> = queue.peek(20).iter().map(|t| t.request_id).collect();

        assert_eq!(queue.len(), 20);
        assert_eq!(before, after);
    }

    #[test]
    fn peek_returns_an_independent_copy() {
        let mut queue = TrackQueue::new(10, 1800);
        queue.enqueue(track("a")).unwrap();
        queue.enqueue(track("b")).unwrap();

        let snapshot = queue.peek(5);
        queue.clear();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].query, "a");
    }

    #[test]
    fn clear_reports_removed_count() {
        let mut queue = TrackQueue::new(10, 1800);
        queue.enqueue(track("a")).unwrap();
        queue.enqueue(track("b")).unwrap();

        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.clear(), 0);
    }

    #[test]
    fn requeue_is_dropped_when_queue_refilled_to_bound() {
        let mut queue = TrackQueue::new(2, 1800);
        queue.enqueue(track("a")).unwrap();
        queue.enqueue(track("b")).unwrap();

        assert!(!queue.requeue_front(track("looped")));
        assert!(!queue.requeue_back(track("looped")));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn requeue_front_plays_next() {
        let mut queue = TrackQueue::new(10, 1800);
        queue.enqueue(track("next")).unwrap();

        assert!(queue.requeue_front(track("looped")));
        assert_eq!(queue.dequeue_next().unwrap().query, "looped");
        assert_eq!(queue.dequeue_next().unwrap().query, "next");
    }
}
