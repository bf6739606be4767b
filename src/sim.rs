//! Simulated adapters
//!
//! In-crate harness used by the test suites and the `jukebox-soak` binary: a
//! scriptable resolver and an inspectable voice transport. No audio moves
//! anywhere; streams are bookkeeping entries whose lifecycle events the test
//! (or soak driver) triggers by hand.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::resolver::{ResolveError, SourceResolver};
use crate::track::{ChatId, ResolvedSource};
use crate::transport::{StreamControl, TransportError, TransportEvent, VoiceTransport};

/// Scripted outcome for one resolve call
#[derive(Debug, Clone)]
pub enum SimOutcome {
    Ok { title: String, duration_secs: u64 },
    Fail(ResolveError),
    /// Never completes; pairs with the pool's per-job timeout
    Hang,
}

/// Scriptable resolver
///
/// Unscripted queries resolve to a `sim://<query>` source of 180 seconds.
/// `pause_resolution` gates every in-flight resolve until resumed, which lets
/// tests hold worker slots busy deterministically.
pub struct SimResolver {
    delay: Duration,
    gated: AtomicBool,
    gate: Notify,
    outcomes: Mutex<HashMap<String, VecDeque<SimOutcome>>>,
    resolved: Mutex<Vec<String>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight count even when the resolve future is dropped
/// mid-await (the pool cancels timed-out jobs by dropping them).
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SimResolver {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    /// Add a fixed latency in front of every resolve
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            gated: AtomicBool::new(false),
            gate: Notify::new(),
            outcomes: Mutex::new(HashMap::new()),
            resolved: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Queue a scripted outcome for `query`; outcomes are consumed in order
    pub fn script(&self, query: &str, outcome: SimOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(query.to_owned())
            .or_default()
            .push_back(outcome);
    }

    /// Block all resolves at the gate until `resume_resolution`
    pub fn pause_resolution(&self) {
        self.gated.store(true, Ordering::Release);
    }

    pub fn resume_resolution(&self) {
        self.gated.store(false, Ordering::Release);
        self.gate.notify_waiters();
    }

    /// Number of resolve invocations so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }

    /// Queries in resolver invocation order
    pub fn resolved_queries(&self) -> Vec<String> {
        self.resolved.lock().unwrap().clone()
    }

    /// High-water mark of concurrently running resolves
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::Acquire)
    }
}

impl Default for SimResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceResolver for SimResolver {
    async fn resolve(&self, query: &str) -> Result<ResolvedSource, ResolveError> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        self.resolved.lock().unwrap().push(query.to_owned());
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_in_flight.fetch_max(now, Ordering::AcqRel);
        let _in_flight = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        loop {
            let notified = self.gate.notified();
            if !self.gated.load(Ordering::Acquire) {
                break;
            }
            notified.await;
        }

        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(query)
            .and_then(|queue| queue.pop_front());

        match outcome {
            None => Ok(ResolvedSource {
                handle: format!("sim://{query}"),
                title: query.to_owned(),
                duration_secs: 180,
            }),
            Some(SimOutcome::Ok {
                title,
                duration_secs,
            }) => Ok(ResolvedSource {
                handle: format!("sim://{query}"),
                title,
                duration_secs,
            }),
            Some(SimOutcome::Fail(e)) => Err(e),
            Some(SimOutcome::Hang) => std::future::pending().await,
        }
    }
}

/// Snapshot of one simulated stream's bookkeeping
#[derive(Debug, Clone)]
pub struct SimStreamInfo {
    pub chat: ChatId,
    pub handle: String,
    pub volume: u16,
    pub paused: bool,
    pub canceled: bool,
    pub ended: bool,
}

struct SimStream {
    chat: ChatId,
    handle: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    volume: u16,
    paused: bool,
    canceled: bool,
    ended: bool,
}

#[derive(Default)]
struct SimTransportInner {
    streams: Vec<SimStream>,
}

/// Inspectable voice transport
///
/// Every started stream stays on record (including cancelled ones), so tests
/// can deliver late events on a replaced stream and assert the session
/// ignores them.
#[derive(Default)]
pub struct SimTransport {
    inner: Arc<Mutex<SimTransportInner>>,
    fail_start: AtomicBool,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `start_stream` calls fail (no active voice call)
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::Release);
    }

    /// Total streams ever started
    pub fn stream_count(&self) -> usize {
        self.inner.lock().unwrap().streams.len()
    }

    pub fn stream(&self, index: usize) -> Option<SimStreamInfo> {
        self.inner.lock().unwrap().streams.get(index).map(|s| SimStreamInfo {
            chat: s.chat,
            handle: s.handle.clone(),
            volume: s.volume,
            paused: s.paused,
            canceled: s.canceled,
            ended: s.ended,
        })
    }

    /// Index of the most recent live (not ended, not cancelled) stream
    pub fn active_index(&self, chat: ChatId) -> Option<usize> {
        let inner = self.inner.lock().unwrap();
        inner
            .streams
            .iter()
            .enumerate()
            .rev()
            .find(|(_, s)| s.chat == chat && !s.ended && !s.canceled)
            .map(|(i, _)| i)
    }

    /// Deliver a natural end-of-track event for the chat's active stream
    pub fn end_active(&self, chat: ChatId) -> bool {
        let Some(index) = self.active_index(chat) else {
            return false;
        };
        self.send_event(index, TransportEvent::Ended, true)
    }

    /// Deliver a stream error for the chat's active stream
    pub fn fail_active(&self, chat: ChatId, fatal: bool, message: &str) -> bool {
        let Some(index) = self.active_index(chat) else {
            return false;
        };
        self.send_event(
            index,
            TransportEvent::Error {
                fatal,
                message: message.to_owned(),
            },
            true,
        )
    }

    /// Deliver an event on any past stream, live or not (stale-event tests)
    pub fn send_stale(&self, index: usize, event: TransportEvent) -> bool {
        self.send_event(index, event, false)
    }

    fn send_event(&self, index: usize, event: TransportEvent, mark_ended: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(stream) = inner.streams.get_mut(index) else {
            return false;
        };
        if mark_ended {
            stream.ended = true;
        }
        stream.events.send(event).is_ok()
    }
}

struct SimStreamControl {
    inner: Arc<Mutex<SimTransportInner>>,
    index: usize,
}

#[async_trait]
impl StreamControl for SimStreamControl {
    async fn set_volume(&self, volume: u16) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.streams[self.index].volume = volume;
        Ok(())
    }

    async fn pause(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.streams[self.index].paused = true;
        Ok(())
    }

    async fn resume(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.streams[self.index].paused = false;
        Ok(())
    }

    async fn cancel(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.streams[self.index].canceled = true;
        Ok(())
    }
}

#[async_trait]
impl VoiceTransport for SimTransport {
    async fn start_stream(
        &self,
        chat: ChatId,
        source: &ResolvedSource,
        volume: u16,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn StreamControl>, TransportError> {
        if self.fail_start.load(Ordering::Acquire) {
            return Err(TransportError::StartFailed(
                "no active voice call".to_string(),
            ));
        }

        let mut inner = self.inner.lock().unwrap();
        let index = inner.streams.len();
        inner.streams.push(SimStream {
            chat,
            handle: source.handle.clone(),
            events,
            volume,
            paused: false,
            canceled: false,
            ended: false,
        });

        Ok(Box::new(SimStreamControl {
            inner: Arc::clone(&self.inner),
            index,
        }))
    }
}
