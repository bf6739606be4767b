//! Session registry
//!
//! Chat-keyed map of live session handles plus the shared resources every
//! session draws on (fetch pool, voice transport, event bus). Sessions are
//! created lazily on first use and evicted by a periodic sweep once they have
//! sat idle with an empty queue past the retention window.
//!
//! The map is an `RwLock`: lookups for different chats proceed concurrently,
//! and the write lock is taken only to insert or remove entries. No session
//! status is awaited while a map lock is held; liveness is judged on cloned
//! handles outside the lock, then re-validated by handle identity under the
//! write lock (a session, once `Stopped`, never leaves that state, so a
//! stale judgement can only err towards re-checking).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{Config, LimitsConfig};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::fetch::FetchPool;
use crate::playback::session::{PlaybackSession, SessionHandle, SessionState, SessionStatus};
use crate::resolver::SourceResolver;
use crate::track::ChatId;
use crate::transport::VoiceTransport;

/// Owns all per-chat sessions and the shared worker pool
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ChatId, SessionHandle>>,
    limits: LimitsConfig,
    retention: Duration,
    sweep_interval: Duration,
    pool: Arc<FetchPool>,
    transport: Arc<dyn VoiceTransport>,
    events: Arc<EventBus>,
}

impl SessionRegistry {
    pub fn new(
        config: &Config,
        resolver: Arc<dyn SourceResolver>,
        transport: Arc<dyn VoiceTransport>,
    ) -> Self {
        let events = Arc::new(EventBus::new(256));
        let pool = Arc::new(FetchPool::new(resolver, &config.fetch));

        Self {
            sessions: RwLock::new(HashMap::new()),
            limits: config.limits.clone(),
            retention: config.sessions.retention(),
            sweep_interval: config.sessions.sweep_interval(),
            pool,
            transport,
            events,
        }
    }

    /// Event bus carrying every session's notifications
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    /// Fetch a chat's session, creating it on first use
    ///
    /// A session that stopped (by user or transport failure) is replaced by a
    /// fresh one, so the chat can start playing again without waiting for the
    /// sweep. Exactly one live session per chat even under concurrent calls.
    pub async fn get_or_create(&self, chat: ChatId) -> SessionHandle {
        let seen = self.sessions.read().await.get(&chat).cloned();
        if let Some(handle) = &seen {
            if !handle.is_closed() && handle.status().await.state != SessionState::Stopped {
                return handle.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(current) = sessions.get(&chat) {
            // A concurrent caller may have replaced the entry we judged dead;
            // their replacement is freshly spawned, so take it as is.
            let replaced = match &seen {
                Some(old) => !current.same_session(old),
                None => true,
            };
            if replaced && !current.is_closed() {
                return current.clone();
            }
            debug!(%chat, "replacing stopped session");
        }

        info!(%chat, "creating playback session");
        let handle = PlaybackSession::spawn(
            chat,
            &self.limits,
            Arc::clone(&self.pool),
            Arc::clone(&self.transport),
            Arc::clone(&self.events),
        );
        sessions.insert(chat, handle.clone());
        handle
    }

    /// Look up a chat's session without creating one
    pub async fn get(&self, chat: ChatId) -> Option<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions.get(&chat).filter(|h| !h.is_closed()).cloned()
    }

    /// Remove a chat's session. Only stopped (or dead) sessions may be
    /// removed; an active session must be stopped first.
    pub async fn remove(&self, chat: ChatId) -> Result<()> {
        let Some(handle) = self.sessions.read().await.get(&chat).cloned() else {
            return Ok(());
        };
        if !handle.is_closed() && handle.status().await.state != SessionState::Stopped {
            return Err(Error::SessionBusy);
        }

        let mut sessions = self.sessions.write().await;
        if sessions
            .get(&chat)
            .is_some_and(|current| current.same_session(&handle))
        {
            sessions.remove(&chat);
        }
        Ok(())
    }

    /// Status of every registered session
    pub async fn snapshot(&self) -> Vec<(ChatId, SessionStatus)> {
        let handles: Vec<(ChatId, SessionHandle)> = {
            let sessions = self.sessions.read().await;
            sessions.iter().map(|(c, h)| (*c, h.clone())).collect()
        };

        let mut out = Vec::with_capacity(handles.len());
        for (chat, handle) in handles {
            out.push((chat, handle.status().await));
        }
        out
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// One eviction pass: drop sessions that are stopped, dead, or past the
    /// idle retention window. Returns how many were evicted.
    pub async fn sweep(&self) -> usize {
        let handles: Vec<(ChatId, SessionHandle)> = {
            let sessions = self.sessions.read().await;
            sessions.iter().map(|(c, h)| (*c, h.clone())).collect()
        };

        let mut evict = Vec::new();
        for (chat, handle) in handles {
            if handle.is_closed() {
                evict.push((chat, handle));
                continue;
            }
            let status = handle.status().await;
            let expired = status
                .idle_since
                .is_some_and(|since| since.elapsed() >= self.retention);
            if status.state == SessionState::Stopped || expired {
                evict.push((chat, handle));
            }
        }
        if evict.is_empty() {
            return 0;
        }

        let mut sessions = self.sessions.write().await;
        let mut removed = 0;
        for (chat, handle) in &evict {
            // Only evict the exact session we judged; a replacement that
            // slipped in since is left alone.
            if sessions
                .get(chat)
                .is_some_and(|current| current.same_session(handle))
            {
                debug!(chat = %chat, "evicting session");
                sessions.remove(chat);
                removed += 1;
            }
        }

        if removed > 0 {
            info!("session sweep evicted {removed} of {} sessions", sessions.len() + removed);
        }
        removed
    }

    /// Run the eviction sweep on the configured interval until aborted
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.sweep().await;
            }
        })
    }

    /// Stop every session and drop all handles
    pub async fn shutdown(&self) {
        let drained: Vec<(ChatId, SessionHandle)> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().collect()
        };

        info!("shutting down {} sessions", drained.len());
        for (chat, handle) in drained {
            if let Err(e) = handle.stop().await {
                debug!(%chat, "session already gone at shutdown: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimResolver, SimTransport};
    use crate::track::Track;

    fn registry_with(config: Config) -> (Arc<SessionRegistry>, Arc<SimTransport>) {
        let resolver = Arc::new(SimResolver::new());
        let transport = Arc::new(SimTransport::new());
        let registry = Arc::new(SessionRegistry::new(
            &config,
            resolver as Arc<dyn SourceResolver>,
            Arc::clone(&transport) as Arc<dyn VoiceTransport>,
        ));
        (registry, transport)
    }

    #[tokio::test]
    async fn sessions_are_created_lazily_and_reused() {
        let (registry, _) = registry_with(Config::default());
        assert_eq!(registry.session_count().await, 0);

        let a1 = registry.get_or_create(ChatId(1)).await;
        let a2 = registry.get_or_create(ChatId(1)).await;
        let b = registry.get_or_create(ChatId(2)).await;

        assert!(a1.same_session(&a2));
        assert_eq!(registry.session_count().await, 2);
        assert_eq!(b.chat(), ChatId(2));
    }

    #[tokio::test]
    async fn concurrent_get_or_create_yields_one_session() {
        let (registry, _) = registry_with(Config::default());

        let (a, b) = tokio::join!(
            registry.get_or_create(ChatId(7)),
            registry.get_or_create(ChatId(7))
        );

        assert!(a.same_session(&b));
        assert_eq!(registry.session_count().await, 1);

        // Both handles drive the same actor: the first request starts
        // playing, the second waits in the shared queue.
        a.enqueue(Track::new("one", 1)).await.unwrap();
        b.enqueue(Track::new("two", 1)).await.unwrap();
        assert_eq!(a.queue_snapshot(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stopped_session_is_replaced_on_next_use() {
        let (registry, _) = registry_with(Config::default());

        let handle = registry.get_or_create(ChatId(1)).await;
        handle.stop().await.unwrap();

        let fresh = registry.get_or_create(ChatId(1)).await;
        assert!(!fresh.same_session(&handle));
        fresh.enqueue(Track::new("song", 1)).await.unwrap();
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn remove_rejects_active_sessions() {
        let (registry, _) = registry_with(Config::default());

        let handle = registry.get_or_create(ChatId(1)).await;
        handle.enqueue(Track::new("song", 1)).await.unwrap();

        assert!(matches!(
            registry.remove(ChatId(1)).await,
            Err(Error::SessionBusy)
        ));

        handle.stop().await.unwrap();
        registry.remove(ChatId(1)).await.unwrap();
        assert_eq!(registry.session_count().await, 0);

        // Removing an unknown chat is a no-op.
        registry.remove(ChatId(99)).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_evicts_idle_sessions_past_retention() {
        let mut config = Config::default();
        config.sessions.retention_secs = 0;
        let (registry, _) = registry_with(config);

        registry.get_or_create(ChatId(1)).await;
        registry.get_or_create(ChatId(2)).await;

        // Freshly created sessions are idle with empty queues, and retention
        // is zero, so the sweep takes both.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.sweep().await, 2);
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn sweep_keeps_playing_sessions() {
        let mut config = Config::default();
        config.sessions.retention_secs = 0;
        let (registry, _) = registry_with(config);

        let handle = registry.get_or_create(ChatId(1)).await;
        handle.enqueue(Track::new("song", 1)).await.unwrap();

        for _ in 0..100 {
            if handle.status().await.state == SessionState::Playing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(registry.sweep().await, 0);
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_all_sessions() {
        let (registry, transport) = registry_with(Config::default());

        let handle = registry.get_or_create(ChatId(1)).await;
        handle.enqueue(Track::new("song", 1)).await.unwrap();
        for _ in 0..100 {
            if handle.status().await.state == SessionState::Playing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        registry.shutdown().await;
        assert_eq!(registry.session_count().await, 0);
        assert!(transport.stream(0).unwrap().canceled);
    }
}
