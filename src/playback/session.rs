//! Playback session state machine
//!
//! One session per chat, implemented as an actor: a single task owns the
//! queue and all mutable state, and consumes one mailbox. Processing one
//! message to completion before the next provides the per-chat
//! linearization discipline; commands for different chats proceed fully in
//! parallel.
//!
//! The only asynchronous suspension in a track's life is the fetch: control
//! commands keep being accepted while a fetch is in flight, and a skip or
//! stop during `Resolving` cancels the job (or discards its late result).
//! Worker-pool completions and transport callbacks enter through the same
//! mailbox as commands, tagged with the request id of the track they belong
//! to, so whichever of a racing skip and natural end-of-track reaches the
//! mailbox first wins and the loser is a no-op.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, QueueChangeTrigger, SessionEvent, StopCause};
use crate::fetch::{CancelFlag, FetchError, FetchPool, FetchResult};
use crate::playback::queue::TrackQueue;
use crate::track::{ChatId, LoopMode, ResolvedSource, Track};
use crate::transport::{StreamControl, TransportEvent, VoiceTransport};

/// Initial attempt plus one automatic retry, then drop-and-advance
const MAX_FETCH_ATTEMPTS: u8 = 2;

/// Backoff before re-trying queue advance after pool saturation
const POOL_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Session state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No track loaded; the queue may still hold entries
    Idle,
    /// A fetch job is in flight for the next track
    Resolving,
    Playing,
    Paused,
    /// Terminal transition in progress
    Stopping,
    /// Terminal; the registry may evict this session
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Resolving => "resolving",
            SessionState::Playing => "playing",
            SessionState::Paused => "paused",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

/// Shared status snapshot, read by the registry's eviction sweep
#[derive(Debug, Clone, Copy)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Set while the session sits `Idle` with an empty queue; basis for the
    /// retention window
    pub idle_since: Option<Instant>,
}

/// What is currently streaming, for display
#[derive(Debug, Clone)]
pub struct NowPlaying {
    pub track: Track,
    pub elapsed: Duration,
    pub volume: u16,
    pub state: SessionState,
}

/// Closed command set consumed by the session actor
///
/// Each command carries its own reply channel; the session answers every
/// command with exactly one authoritative outcome.
enum SessionCommand {
    Enqueue {
        track: Track,
        reply: oneshot::Sender<Result<usize>>,
    },
    Pause {
        reply: oneshot::Sender<Result<SessionState>>,
    },
    Resume {
        reply: oneshot::Sender<Result<SessionState>>,
    },
    Skip {
        reply: oneshot::Sender<Result<SessionState>>,
    },
    Stop {
        reply: oneshot::Sender<Result<SessionState>>,
    },
    SetVolume {
        volume: u16,
        reply: oneshot::Sender<Result<u16>>,
    },
    SetLoopMode {
        mode: LoopMode,
        reply: oneshot::Sender<Result<LoopMode>>,
    },
    Shuffle {
        reply: oneshot::Sender<Result<usize>>,
    },
    ClearQueue {
        reply: oneshot::Sender<Result<usize>>,
    },
    QueueSnapshot {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<Track>>>,
    },
    NowPlaying {
        reply: oneshot::Sender<Result<Option<NowPlaying>>>,
    },
}

/// Everything that can enter the session's serialization boundary
enum SessionMessage {
    Command(SessionCommand),
    /// Worker-pool completion for the tagged request
    FetchDone {
        request_id: Uuid,
        result: FetchResult,
    },
    /// Transport callback for the tagged stream
    Stream {
        request_id: Uuid,
        event: TransportEvent,
    },
    /// Deferred queue-advance retry after pool saturation
    Advance,
}

/// Cloneable handle to one chat's session actor
#[derive(Clone)]
pub struct SessionHandle {
    chat: ChatId,
    tx: mpsc::UnboundedSender<SessionMessage>,
    status: Arc<RwLock<SessionStatus>>,
}

impl SessionHandle {
    pub fn chat(&self) -> ChatId {
        self.chat
    }

    /// Queue a play request. Returns the 1-based queue position; position 1
    /// with an idle session means playback starts immediately.
    pub async fn enqueue(&self, track: Track) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Enqueue { track, reply })?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Idempotent; pausing an already paused session reports `Paused`
    pub async fn pause(&self) -> Result<SessionState> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Pause { reply })?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    pub async fn resume(&self) -> Result<SessionState> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Resume { reply })?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    pub async fn skip(&self) -> Result<SessionState> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Skip { reply })?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    pub async fn stop(&self) -> Result<SessionState> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Stop { reply })?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    pub async fn set_volume(&self, volume: u16) -> Result<u16> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::SetVolume { volume, reply })?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    pub async fn set_loop_mode(&self, mode: LoopMode) -> Result<LoopMode> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::SetLoopMode { mode, reply })?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Returns the shuffled queue length
    pub async fn shuffle(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Shuffle { reply })?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Returns how many entries were removed
    pub async fn clear_queue(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::ClearQueue { reply })?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Read-only snapshot of the first `limit` queued tracks
    pub async fn queue_snapshot(&self, limit: usize) -> Result<Vec<Track>> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::QueueSnapshot { limit, reply })?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    pub async fn now_playing(&self) -> Result<Option<NowPlaying>> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::NowPlaying { reply })?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    pub async fn status(&self) -> SessionStatus {
        *self.status.read().await
    }

    /// True once the actor task has exited
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether two handles point at the same session actor
    pub(crate) fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.status, &other.status)
    }

    fn send(&self, command: SessionCommand) -> Result<()> {
        self.tx
            .send(SessionMessage::Command(command))
            .map_err(|_| Error::SessionClosed)
    }
}

/// A fetch job the session is waiting on
struct PendingFetch {
    track: Track,
    cancel: CancelFlag,
}

/// The stream currently feeding the voice call
struct ActiveStream {
    request_id: Uuid,
    control: Box<dyn StreamControl>,
}

/// Per-chat playback session actor state
pub(crate) struct PlaybackSession {
    chat: ChatId,
    queue: TrackQueue,
    state: SessionState,
    current: Option<Track>,
    volume: u16,
    max_duration_secs: u64,
    playing_since: Option<Instant>,
    pending_fetch: Option<PendingFetch>,
    stream: Option<ActiveStream>,
    pool: Arc<FetchPool>,
    transport: Arc<dyn VoiceTransport>,
    events: Arc<EventBus>,
    self_tx: mpsc::UnboundedSender<SessionMessage>,
    status: Arc<RwLock<SessionStatus>>,
}

impl PlaybackSession {
    /// Spawn the session actor and return its handle
    pub(crate) fn spawn(
        chat: ChatId,
        limits: &LimitsConfig,
        pool: Arc<FetchPool>,
        transport: Arc<dyn VoiceTransport>,
        events: Arc<EventBus>,
    ) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(SessionStatus {
            state: SessionState::Idle,
            idle_since: Some(Instant::now()),
        }));

        let session = PlaybackSession {
            chat,
            queue: TrackQueue::new(limits.max_queue_size, limits.max_track_duration_secs),
            state: SessionState::Idle,
            current: None,
            volume: limits.default_volume.clamp(1, 200),
            max_duration_secs: limits.max_track_duration_secs,
            playing_since: None,
            pending_fetch: None,
            stream: None,
            pool,
            transport,
            events,
            self_tx: tx.clone(),
            status: Arc::clone(&status),
        };

        tokio::spawn(session.run(rx));

        SessionHandle { chat, tx, status }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionMessage>) {
        debug!(chat = %self.chat, "playback session started");

        // The loop ends when the registry drops the last handle; a Stopped
        // session keeps answering queue inspection until evicted.
        while let Some(message) = rx.recv().await {
            match message {
                SessionMessage::Command(command) => self.handle_command(command).await,
                SessionMessage::FetchDone { request_id, result } => {
                    self.on_fetch_done(request_id, result).await
                }
                SessionMessage::Stream { request_id, event } => {
                    self.on_stream_event(request_id, event).await
                }
                SessionMessage::Advance => {
                    if self.state == SessionState::Idle {
                        self.advance(None).await.ok();
                    }
                }
            }
            self.publish_status().await;
        }

        debug!(chat = %self.chat, "playback session exited");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Enqueue { track, reply } => {
                let _ = reply.send(self.cmd_enqueue(track).await);
            }
            SessionCommand::Pause { reply } => {
                let _ = reply.send(self.cmd_pause().await);
            }
            SessionCommand::Resume { reply } => {
                let _ = reply.send(self.cmd_resume().await);
            }
            SessionCommand::Skip { reply } => {
                let _ = reply.send(self.cmd_skip().await);
            }
            SessionCommand::Stop { reply } => {
                let _ = reply.send(self.cmd_stop().await);
            }
            SessionCommand::SetVolume { volume, reply } => {
                let _ = reply.send(self.cmd_set_volume(volume).await);
            }
            SessionCommand::SetLoopMode { mode, reply } => {
                let _ = reply.send(self.cmd_set_loop_mode(mode));
            }
            SessionCommand::Shuffle { reply } => {
                let _ = reply.send(self.cmd_shuffle());
            }
            SessionCommand::ClearQueue { reply } => {
                let _ = reply.send(self.cmd_clear_queue());
            }
            SessionCommand::QueueSnapshot { limit, reply } => {
                let _ = reply.send(Ok(self.queue.peek(limit)));
            }
            SessionCommand::NowPlaying { reply } => {
                let _ = reply.send(Ok(self.now_playing()));
            }
        }
    }

    // ========== Commands ==========

    async fn cmd_enqueue(&mut self, track: Track) -> Result<usize> {
        if matches!(self.state, SessionState::Stopping | SessionState::Stopped) {
            return Err(Error::InvalidState("session is stopped".to_string()));
        }

        let request_id = track.request_id;
        let title = track.title.clone();
        let position = self.queue.enqueue(track)?;
        debug!(chat = %self.chat, position, "enqueued '{title}'");
        self.emit_queue_changed(QueueChangeTrigger::Enqueue);

        // If nothing is playing this request starts right now; pool
        // saturation at this point is reported synchronously so the caller
        // can tell the user to retry later.
        self.advance(Some(request_id)).await?;

        Ok(position)
    }

    async fn cmd_pause(&mut self) -> Result<SessionState> {
        match self.state {
            SessionState::Paused => Ok(SessionState::Paused),
            SessionState::Playing => {
                if let Some(stream) = &self.stream {
                    stream
                        .control
                        .pause()
                        .await
                        .map_err(|e| Error::Transport(e.to_string()))?;
                }
                self.set_state(SessionState::Paused);
                Ok(SessionState::Paused)
            }
            _ => Err(Error::InvalidState("nothing is playing".to_string())),
        }
    }

    async fn cmd_resume(&mut self) -> Result<SessionState> {
        match self.state {
            SessionState::Playing => Ok(SessionState::Playing),
            SessionState::Paused => {
                if let Some(stream) = &self.stream {
                    stream
                        .control
                        .resume()
                        .await
                        .map_err(|e| Error::Transport(e.to_string()))?;
                }
                self.set_state(SessionState::Playing);
                Ok(SessionState::Playing)
            }
            _ => Err(Error::InvalidState("nothing is paused".to_string())),
        }
    }

    async fn cmd_skip(&mut self) -> Result<SessionState> {
        match self.state {
            SessionState::Resolving => {
                // Cancel the in-flight fetch; a result that still arrives is
                // recognized as stale and discarded.
                if let Some(pending) = self.cancel_pending_fetch() {
                    self.emit(SessionEvent::TrackFinished {
                        chat: self.chat,
                        request_id: pending.request_id,
                        title: pending.title,
                        completed: false,
                        timestamp: Utc::now(),
                    });
                }
                self.set_state(SessionState::Idle);
                self.advance(None).await.ok();
                Ok(self.state)
            }
            SessionState::Playing | SessionState::Paused => {
                if let Some(stream) = self.stream.take() {
                    if let Err(e) = stream.control.cancel().await {
                        warn!(chat = %self.chat, "stream cancel failed during skip: {e}");
                    }
                }
                self.finish_current(false).await;
                Ok(self.state)
            }
            _ => Err(Error::InvalidState("nothing to skip".to_string())),
        }
    }

    async fn cmd_stop(&mut self) -> Result<SessionState> {
        if self.state == SessionState::Stopped {
            return Ok(SessionState::Stopped);
        }

        self.set_state(SessionState::Stopping);
        self.cancel_pending_fetch();

        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.control.cancel().await {
                warn!(chat = %self.chat, "stream cancel failed during stop: {e}");
            }
        }

        self.current = None;
        self.playing_since = None;
        let removed = self.queue.clear();
        if removed > 0 {
            self.emit_queue_changed(QueueChangeTrigger::Clear);
        }

        self.set_state(SessionState::Stopped);
        self.emit(SessionEvent::SessionStopped {
            chat: self.chat,
            cause: StopCause::User,
            timestamp: Utc::now(),
        });
        info!(chat = %self.chat, "session stopped by user, {removed} queued tracks dropped");

        Ok(SessionState::Stopped)
    }

    async fn cmd_set_volume(&mut self, volume: u16) -> Result<u16> {
        if !(1..=200).contains(&volume) {
            return Err(Error::InvalidVolume(volume));
        }
        match self.state {
            SessionState::Playing | SessionState::Paused => {
                if let Some(stream) = &self.stream {
                    stream
                        .control
                        .set_volume(volume)
                        .await
                        .map_err(|e| Error::Transport(e.to_string()))?;
                }
                self.volume = volume;
                self.emit(SessionEvent::VolumeChanged {
                    chat: self.chat,
                    volume,
                    timestamp: Utc::now(),
                });
                Ok(volume)
            }
            _ => Err(Error::InvalidState(
                "volume can only be set during playback".to_string(),
            )),
        }
    }

    fn cmd_set_loop_mode(&mut self, mode: LoopMode) -> Result<LoopMode> {
        self.queue.set_loop_mode(mode);
        self.emit(SessionEvent::LoopModeChanged {
            chat: self.chat,
            mode,
            timestamp: Utc::now(),
        });
        Ok(mode)
    }

    fn cmd_shuffle(&mut self) -> Result<usize> {
        if self.queue.is_empty() {
            return Err(Error::InvalidState("queue is empty".to_string()));
        }
        self.queue.shuffle();
        self.emit_queue_changed(QueueChangeTrigger::Shuffle);
        Ok(self.queue.len())
    }

    fn cmd_clear_queue(&mut self) -> Result<usize> {
        let removed = self.queue.clear();
        self.emit_queue_changed(QueueChangeTrigger::Clear);
        Ok(removed)
    }

    fn now_playing(&self) -> Option<NowPlaying> {
        let track = self.current.clone()?;
        Some(NowPlaying {
            track,
            elapsed: self
                .playing_since
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO),
            volume: self.volume,
            state: self.state,
        })
    }

    // ========== Queue advance ==========

    /// From `Idle`, pull the next track and start resolving (or replaying a
    /// loop-re-inserted, already-resolved track directly).
    ///
    /// `via_enqueue` carries the request id when the advance runs
    /// synchronously inside that request's enqueue: pool saturation is then
    /// returned to the caller and that track dropped. Any other track hitting
    /// a saturated pool (track finished, retry timer, or a deferred head
    /// reached through someone else's enqueue) is put back at the front and a
    /// deferred retry scheduled instead.
    async fn advance(&mut self, via_enqueue: Option<Uuid>) -> Result<()> {
        while self.state == SessionState::Idle && self.pending_fetch.is_none() {
            let Some(track) = self.queue.dequeue_next() else {
                return Ok(());
            };
            self.emit_queue_changed(QueueChangeTrigger::Dequeue);

            // Loop replays carry their source; no pool round trip needed.
            if let Some(source) = track.source.clone() {
                if self.begin_stream(track, source).await {
                    return Ok(());
                }
                continue;
            }

            match self.begin_fetch(track) {
                Ok(()) => {
                    self.set_state(SessionState::Resolving);
                    return Ok(());
                }
                Err((Error::PoolSaturated, track)) => {
                    if via_enqueue == Some(track.request_id) {
                        warn!(chat = %self.chat, "fetch pool saturated, rejecting '{}'", track.title);
                        return Err(Error::PoolSaturated);
                    }
                    debug!(chat = %self.chat, "fetch pool saturated, deferring '{}'", track.title);
                    self.queue.requeue_front(track);
                    self.schedule_advance_retry();
                    return Ok(());
                }
                Err((e, track)) => {
                    warn!(chat = %self.chat, "fetch submit failed for '{}': {e}", track.title);
                    self.emit_track_failed(&track, &e.to_string());
                }
            }
        }
        Ok(())
    }

    /// Submit the track to the pool and wire its completion back into the
    /// mailbox. On failure the track is handed back to the caller.
    fn begin_fetch(&mut self, mut track: Track) -> std::result::Result<(), (Error, Track)> {
        let request_id = track.request_id;
        let handle = match self.pool.submit(request_id, self.chat, &track.query) {
            Ok(handle) => handle,
            Err(e) => return Err((e, track)),
        };

        track.fetch_attempts += 1;
        let cancel = handle.cancel_flag();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = handle.recv().await;
            let _ = tx.send(SessionMessage::FetchDone { request_id, result });
        });

        self.pending_fetch = Some(PendingFetch { track, cancel });
        Ok(())
    }

    fn schedule_advance_retry(&self) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(POOL_RETRY_DELAY).await;
            let _ = tx.send(SessionMessage::Advance);
        });
    }

    // ========== Pool completions ==========

    async fn on_fetch_done(&mut self, request_id: Uuid, result: FetchResult) {
        let is_pending = self
            .pending_fetch
            .as_ref()
            .is_some_and(|p| p.track.request_id == request_id);
        if !is_pending {
            // Skipped or stopped while the job ran; its result is stale.
            debug!(chat = %self.chat, %request_id, "discarding stale fetch result");
            return;
        }
        let Some(pending) = self.pending_fetch.take() else {
            return;
        };
        let mut track = pending.track;

        match result {
            Ok(source) => {
                // A source enqueued with unknown duration gets the cap
                // enforced here, once the resolver reports it.
                if source.duration_secs > self.max_duration_secs {
                    warn!(
                        chat = %self.chat,
                        "'{}' resolved to {}s, over the {}s limit",
                        track.title,
                        source.duration_secs,
                        self.max_duration_secs
                    );
                    let reason = Error::DurationExceeded {
                        actual: source.duration_secs,
                        limit: self.max_duration_secs,
                    }
                    .to_string();
                    self.emit_track_failed(&track, &reason);
                    self.set_state(SessionState::Idle);
                    self.advance(None).await.ok();
                    return;
                }

                track.apply_source(source.clone());
                if !self.begin_stream(track, source).await {
                    self.set_state(SessionState::Idle);
                    self.advance(None).await.ok();
                }
            }
            Err(FetchError::Canceled) => {
                // Skip/stop unregister the fetch before its result can land,
                // so a cancellation seen here came from the pool side; drop
                // the track and keep the session moving.
                debug!(chat = %self.chat, %request_id, "fetch cancelled by the pool");
                self.emit_track_failed(&track, &FetchError::Canceled.to_string());
                self.set_state(SessionState::Idle);
                self.advance(None).await.ok();
            }
            Err(e) => {
                if track.fetch_attempts < MAX_FETCH_ATTEMPTS
                    && !matches!(e, FetchError::PoolClosed)
                {
                    warn!(
                        chat = %self.chat,
                        attempt = track.fetch_attempts,
                        "fetch failed for '{}', retrying: {e}",
                        track.title
                    );
                    match self.begin_fetch(track) {
                        Ok(()) => return, // still Resolving
                        Err((submit_err, track)) => {
                            warn!(chat = %self.chat, "retry submit failed: {submit_err}");
                            self.emit_track_failed(&track, &e.to_string());
                        }
                    }
                } else {
                    warn!(
                        chat = %self.chat,
                        "dropping '{}' after {} failed attempts: {e}",
                        track.title,
                        track.fetch_attempts
                    );
                    self.emit_track_failed(&track, &e.to_string());
                }
                self.set_state(SessionState::Idle);
                self.advance(None).await.ok();
            }
        }
    }

    // ========== Transport events ==========

    async fn on_stream_event(&mut self, request_id: Uuid, event: TransportEvent) {
        let is_current = self
            .stream
            .as_ref()
            .is_some_and(|s| s.request_id == request_id);
        if !is_current {
            // The session already left this track (skip won the race, or the
            // stream was replaced); accepted don't-care race.
            debug!(chat = %self.chat, %request_id, "ignoring stale stream event");
            return;
        }

        match event {
            TransportEvent::Ended => {
                self.stream = None;
                self.finish_current(true).await;
            }
            TransportEvent::Error { fatal: true, message } => {
                error!(chat = %self.chat, "fatal transport error: {message}");
                self.stream = None;
                self.current = None;
                self.playing_since = None;
                self.cancel_pending_fetch();

                // Queue deliberately preserved for inspection; the session
                // just stops actively playing.
                self.set_state(SessionState::Stopped);
                self.emit(SessionEvent::SessionStopped {
                    chat: self.chat,
                    cause: StopCause::TransportFailure,
                    timestamp: Utc::now(),
                });
            }
            TransportEvent::Error { fatal: false, message } => {
                warn!(chat = %self.chat, "transient stream error, dropping track: {message}");
                if let Some(stream) = self.stream.take() {
                    stream.control.cancel().await.ok();
                }
                if let Some(track) = self.current.take() {
                    self.playing_since = None;
                    self.emit(SessionEvent::TrackFinished {
                        chat: self.chat,
                        request_id: track.request_id,
                        title: track.title,
                        completed: false,
                        timestamp: Utc::now(),
                    });
                }
                self.set_state(SessionState::Idle);
                self.advance(None).await.ok();
            }
        }
    }

    /// Retire the current track (natural end or skip), apply the loop
    /// re-insertion policy, and advance.
    async fn finish_current(&mut self, completed: bool) {
        if let Some(track) = self.current.take() {
            self.playing_since = None;
            self.emit(SessionEvent::TrackFinished {
                chat: self.chat,
                request_id: track.request_id,
                title: track.title.clone(),
                completed,
                timestamp: Utc::now(),
            });

            let reinserted = match self.queue.loop_mode() {
                LoopMode::Song => self.queue.requeue_front(track),
                LoopMode::Queue => self.queue.requeue_back(track),
                LoopMode::Off => false,
            };
            if reinserted {
                self.emit_queue_changed(QueueChangeTrigger::LoopReinsert);
            }
        }

        self.set_state(SessionState::Idle);
        self.advance(None).await.ok();
    }

    // ========== Stream start ==========

    /// Hand the resolved source to the voice transport. Returns false if the
    /// stream could not start (the track is dropped with a notification).
    async fn begin_stream(&mut self, track: Track, source: ResolvedSource) -> bool {
        let request_id = track.request_id;
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        match self
            .transport
            .start_stream(self.chat, &source, self.volume, event_tx)
            .await
        {
            Ok(control) => {
                // Forward this stream's events into the mailbox, tagged so
                // late events from a replaced stream stay recognizable.
                let tx = self.self_tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = event_rx.recv().await {
                        if tx
                            .send(SessionMessage::Stream { request_id, event })
                            .is_err()
                        {
                            break;
                        }
                    }
                });

                info!(
                    chat = %self.chat,
                    "now playing '{}' ({}s)",
                    track.title,
                    source.duration_secs
                );
                self.emit(SessionEvent::TrackStarted {
                    chat: self.chat,
                    request_id,
                    title: track.title.clone(),
                    duration_secs: source.duration_secs,
                    timestamp: Utc::now(),
                });

                self.stream = Some(ActiveStream {
                    request_id,
                    control,
                });
                self.current = Some(track);
                self.playing_since = Some(Instant::now());
                self.set_state(SessionState::Playing);
                true
            }
            Err(e) => {
                warn!(chat = %self.chat, "failed to start stream for '{}': {e}", track.title);
                self.emit_track_failed(&track, &e.to_string());
                false
            }
        }
    }

    // ========== Helpers ==========

    /// Cancel and detach the pending fetch, if any. A late result for it is
    /// discarded as stale by `on_fetch_done`.
    fn cancel_pending_fetch(&mut self) -> Option<Track> {
        let pending = self.pending_fetch.take()?;
        pending.cancel.cancel();
        Some(pending.track)
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!(chat = %self.chat, from = %self.state, to = %state, "state transition");
        self.state = state;
        self.emit(SessionEvent::PlaybackStateChanged {
            chat: self.chat,
            state,
            timestamp: Utc::now(),
        });
    }

    async fn publish_status(&self) {
        let mut status = self.status.write().await;
        status.state = self.state;
        if self.state == SessionState::Idle && self.queue.is_empty() && self.current.is_none() {
            if status.idle_since.is_none() {
                status.idle_since = Some(Instant::now());
            }
        } else {
            status.idle_since = None;
        }
    }

    fn emit(&self, event: SessionEvent) {
        self.events.emit_lossy(event);
    }

    fn emit_queue_changed(&self, trigger: QueueChangeTrigger) {
        self.emit(SessionEvent::QueueChanged {
            chat: self.chat,
            len: self.queue.len(),
            trigger,
            timestamp: Utc::now(),
        });
    }

    fn emit_track_failed(&self, track: &Track, reason: &str) {
        self.emit(SessionEvent::TrackFailed {
            chat: self.chat,
            request_id: track.request_id,
            title: track.title.clone(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use crate::sim::{SimResolver, SimTransport};

    struct Fixture {
        handle: SessionHandle,
        transport: Arc<SimTransport>,
        resolver: Arc<SimResolver>,
        _events: Arc<EventBus>,
    }

    fn fixture() -> Fixture {
        let resolver = Arc::new(SimResolver::new());
        let transport = Arc::new(SimTransport::new());
        let events = Arc::new(EventBus::new(64));
        let pool = Arc::new(FetchPool::new(
            Arc::clone(&resolver) as Arc<dyn crate::resolver::SourceResolver>,
            &FetchConfig::default(),
        ));
        let handle = PlaybackSession::spawn(
            ChatId(1),
            &LimitsConfig::default(),
            pool,
            Arc::clone(&transport) as Arc<dyn VoiceTransport>,
            Arc::clone(&events),
        );
        Fixture {
            handle,
            transport,
            resolver,
            _events: events,
        }
    }

    async fn wait_for_state(handle: &SessionHandle, state: SessionState) {
        for _ in 0..200 {
            if handle.status().await.state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never reached {state}");
    }

    #[tokio::test]
    async fn enqueue_starts_playback() {
        let fx = fixture();
        let position = fx.handle.enqueue(Track::new("song a", 1)).await.unwrap();
        assert_eq!(position, 1);

        wait_for_state(&fx.handle, SessionState::Playing).await;
        assert_eq!(fx.transport.stream_count(), 1);
        let np = fx.handle.now_playing().await.unwrap().unwrap();
        assert_eq!(np.track.title, "song a");
        assert_eq!(np.volume, 100);
    }

    #[tokio::test]
    async fn pause_and_resume_are_idempotent() {
        let fx = fixture();
        fx.handle.enqueue(Track::new("song", 1)).await.unwrap();
        wait_for_state(&fx.handle, SessionState::Playing).await;

        assert_eq!(fx.handle.pause().await.unwrap(), SessionState::Paused);
        assert_eq!(fx.handle.pause().await.unwrap(), SessionState::Paused);
        assert!(fx.transport.stream(0).unwrap().paused);

        assert_eq!(fx.handle.resume().await.unwrap(), SessionState::Playing);
        assert_eq!(fx.handle.resume().await.unwrap(), SessionState::Playing);
        assert!(!fx.transport.stream(0).unwrap().paused);
    }

    #[tokio::test]
    async fn pause_with_nothing_playing_is_an_error() {
        let fx = fixture();
        assert!(matches!(
            fx.handle.pause().await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn volume_validation_and_application() {
        let fx = fixture();
        fx.handle.enqueue(Track::new("song", 1)).await.unwrap();
        wait_for_state(&fx.handle, SessionState::Playing).await;

        assert!(matches!(
            fx.handle.set_volume(250).await,
            Err(Error::InvalidVolume(250))
        ));
        assert!(matches!(
            fx.handle.set_volume(0).await,
            Err(Error::InvalidVolume(0))
        ));

        // Set while paused, reflected on the active stream immediately and
        // still in effect after resume.
        fx.handle.pause().await.unwrap();
        assert_eq!(fx.handle.set_volume(150).await.unwrap(), 150);
        assert_eq!(fx.transport.stream(0).unwrap().volume, 150);
        fx.handle.resume().await.unwrap();
        assert_eq!(fx.transport.stream(0).unwrap().volume, 150);
    }

    #[tokio::test]
    async fn skip_while_resolving_never_delivers_audio() {
        let fx = fixture();
        fx.resolver.pause_resolution();

        fx.handle.enqueue(Track::new("slow one", 1)).await.unwrap();
        fx.handle.enqueue(Track::new("next one", 1)).await.unwrap();
        wait_for_state(&fx.handle, SessionState::Resolving).await;

        fx.handle.skip().await.unwrap();
        fx.resolver.resume_resolution();

        wait_for_state(&fx.handle, SessionState::Playing).await;
        let np = fx.handle.now_playing().await.unwrap().unwrap();
        assert_eq!(np.track.title, "next one");

        // No stream was ever started for the skipped track.
        for i in 0..fx.transport.stream_count() {
            assert_ne!(fx.transport.stream(i).unwrap().handle, "sim://slow one");
        }
    }

    #[tokio::test]
    async fn stop_clears_queue_and_is_terminal() {
        let fx = fixture();
        fx.handle.enqueue(Track::new("a", 1)).await.unwrap();
        wait_for_state(&fx.handle, SessionState::Playing).await;
        fx.handle.enqueue(Track::new("b", 1)).await.unwrap();

        assert_eq!(fx.handle.stop().await.unwrap(), SessionState::Stopped);
        assert!(fx.transport.stream(0).unwrap().canceled);
        assert!(fx.handle.queue_snapshot(10).await.unwrap().is_empty());

        // Playback commands are rejected once stopped; stop stays idempotent.
        assert!(matches!(
            fx.handle.enqueue(Track::new("c", 1)).await,
            Err(Error::InvalidState(_))
        ));
        assert_eq!(fx.handle.stop().await.unwrap(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn pool_side_cancellation_does_not_wedge_the_session() {
        let fx = fixture();
        fx.resolver.pause_resolution();

        let track = Track::new("doomed", 1);
        let request_id = track.request_id;
        fx.handle.enqueue(track).await.unwrap();
        wait_for_state(&fx.handle, SessionState::Resolving).await;

        // A cancellation result arriving for the still-registered fetch
        // (pool winding down) must not leave the session stuck Resolving.
        fx.handle
            .tx
            .send(SessionMessage::FetchDone {
                request_id,
                result: Err(FetchError::Canceled),
            })
            .unwrap();
        wait_for_state(&fx.handle, SessionState::Idle).await;

        // The real result that eventually lands is stale; new requests play.
        fx.resolver.resume_resolution();
        fx.handle.enqueue(Track::new("fresh", 1)).await.unwrap();
        wait_for_state(&fx.handle, SessionState::Playing).await;
        let np = fx.handle.now_playing().await.unwrap().unwrap();
        assert_eq!(np.track.title, "fresh");
    }

    #[tokio::test]
    async fn fatal_transport_error_preserves_queue() {
        let fx = fixture();
        fx.handle.enqueue(Track::new("a", 1)).await.unwrap();
        wait_for_state(&fx.handle, SessionState::Playing).await;
        fx.handle.enqueue(Track::new("b", 1)).await.unwrap();

        fx.transport.fail_active(ChatId(1), true, "voice call lost");
        wait_for_state(&fx.handle, SessionState::Stopped).await;

        let snapshot = fx.handle.queue_snapshot(10).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].title, "b");
    }

    #[tokio::test]
    async fn transient_transport_error_advances() {
        let fx = fixture();
        fx.handle.enqueue(Track::new("a", 1)).await.unwrap();
        wait_for_state(&fx.handle, SessionState::Playing).await;
        fx.handle.enqueue(Track::new("b", 1)).await.unwrap();

        fx.transport.fail_active(ChatId(1), false, "hiccup");

        for _ in 0..200 {
            if let Some(np) = fx.handle.now_playing().await.unwrap() {
                if np.track.title == "b" {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never advanced past the failed track");
    }
}
