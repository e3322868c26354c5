//! In-memory session store.
//!
//! A session holds the unlocked vault key and the decrypted body for one
//! vault. Sessions expire on a sliding TTL: every read or write through the
//! store pushes `expires_at_epoch_millis` forward. Expired sessions are
//! removed (and their buffers wiped) by a background sweep, and every read
//! path runs the same cleanup first so a stale session is never visible
//! between sweep ticks.
//!
//! A lock deadline (set when the app is backgrounded) drops every session
//! once reached, checked the same way as expiry.
//!
//! All mutations go through one mutex, so the sweep and callers always agree
//! on whether a session is alive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::{oneshot, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use lockbox_common::{Clock, Error, Result, SessionId, VaultId};
use lockbox_crypto::{SecureBuffer, SecureMemory};

/// Sliding expiry window of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTtl {
    pub ttl_millis: i64,
    pub expires_at_epoch_millis: i64,
    pub last_extended_at_epoch_millis: i64,
}

impl SessionTtl {
    pub fn new(ttl_millis: i64, now: i64) -> Self {
        Self {
            ttl_millis,
            expires_at_epoch_millis: now.saturating_add(ttl_millis),
            last_extended_at_epoch_millis: now,
        }
    }

    /// Push the expiry to `now + ttl`.
    pub fn extend(&mut self, now: i64) {
        self.expires_at_epoch_millis = now.saturating_add(self.ttl_millis);
        self.last_extended_at_epoch_millis = now;
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at_epoch_millis <= now
    }
}

/// Secret material owned by a session. Both buffers are wiped on drop.
#[derive(Debug)]
pub struct SessionPayload {
    key: SecureBuffer,
    body: SecureBuffer,
}

impl SessionPayload {
    pub fn new(key: SecureBuffer, body: SecureBuffer) -> Self {
        Self { key, body }
    }

    pub fn key(&self) -> &SecureBuffer {
        &self.key
    }

    /// Serialized vault body.
    pub fn body(&self) -> &SecureBuffer {
        &self.body
    }

    pub fn replace_key(&mut self, key: SecureBuffer) {
        self.key = key;
    }

    pub fn replace_body(&mut self, body: SecureBuffer) {
        self.body = body;
    }
}

/// One unlocked vault.
#[derive(Debug)]
pub struct SessionState {
    pub session_id: SessionId,
    pub vault_id: VaultId,
    pub payload: SessionPayload,
    pub created_at: i64,
    pub last_access_at: i64,
    pub ttl: SessionTtl,
    pub attributes: HashMap<String, String>,
}

impl SessionState {
    pub fn new(vault_id: VaultId, payload: SessionPayload, ttl_millis: i64, now: i64) -> Self {
        Self {
            session_id: SessionId::new(),
            vault_id,
            payload,
            created_at: now,
            last_access_at: now,
            ttl: SessionTtl::new(ttl_millis, now),
            attributes: HashMap::new(),
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            vault_id: self.vault_id,
            created_at: self.created_at,
            last_access_at: self.last_access_at,
            ttl: self.ttl,
            attributes: self.attributes.clone(),
        }
    }

    fn touch(&mut self, now: i64) {
        self.last_access_at = now;
        self.ttl.extend(now);
    }
}

/// Secret-free view of a session, safe to hand out and log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub vault_id: VaultId,
    pub created_at: i64,
    pub last_access_at: i64,
    pub ttl: SessionTtl,
    pub attributes: HashMap<String, String>,
}

#[derive(Default)]
struct Sessions {
    live: HashMap<SessionId, SessionState>,
    /// Sessions reclaimed by expiry, so reads can report `SessionExpired`.
    expired: HashMap<SessionId, VaultId>,
    /// Every session is dropped once this time is reached.
    lock_deadline: Option<i64>,
}

impl Sessions {
    fn cleanup(&mut self, now: i64) -> usize {
        if let Some(deadline) = self.lock_deadline {
            if deadline <= now {
                self.lock_deadline = None;
                let dropped = self.live.len();
                self.live.clear();
                self.expired.clear();
                if dropped > 0 {
                    info!("Lock deadline reached; dropped {} sessions", dropped);
                }
                return dropped;
            }
        }

        let expired: Vec<SessionId> = self
            .live
            .iter()
            .filter(|(_, s)| s.ttl.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(state) = self.live.remove(id) {
                debug!("Session for vault {} expired", state.vault_id);
                self.expired.insert(id.clone(), state.vault_id);
            }
        }
        expired.len()
    }

    fn most_recent_id(&self) -> Option<SessionId> {
        self.live
            .values()
            .max_by_key(|s| s.last_access_at)
            .map(|s| s.session_id.clone())
    }

    fn missing(&self, id: &SessionId) -> Error {
        if self.expired.contains_key(id) {
            Error::SessionExpired(id.to_string())
        } else {
            Error::SessionNotFound(id.to_string())
        }
    }
}

struct StoreInner {
    clock: Arc<dyn Clock>,
    memory: SecureMemory,
    sessions: Mutex<Sessions>,
    active: watch::Sender<Option<SessionInfo>>,
    emergency_wiped: AtomicBool,
}

/// Single source of truth for unlocked sessions. Cheap to clone.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl SessionStore {
    pub fn new(clock: Arc<dyn Clock>, memory: SecureMemory) -> Self {
        let (active, _) = watch::channel(None);
        Self {
            inner: Arc::new(StoreInner {
                clock,
                memory,
                sessions: Mutex::new(Sessions::default()),
                active,
                emergency_wiped: AtomicBool::new(false),
            }),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Allocator for session payload buffers.
    pub fn memory(&self) -> &SecureMemory {
        &self.inner.memory
    }

    fn now(&self) -> i64 {
        self.inner.clock.now_millis()
    }

    async fn lock(&self) -> MutexGuard<'_, Sessions> {
        let mut sessions = self.inner.sessions.lock().await;
        // Buffers were zeroed behind the store's back; nothing in it is usable.
        if self.inner.emergency_wiped.swap(false, Ordering::SeqCst) {
            let dropped = sessions.live.len();
            sessions.live.clear();
            if dropped > 0 {
                warn!("Discarded {} sessions after emergency wipe", dropped);
            }
        }
        sessions
    }

    fn publish(&self, sessions: &Sessions) {
        let active = sessions
            .most_recent_id()
            .and_then(|id| sessions.live.get(&id))
            .map(SessionState::info);
        self.inner.active.send_replace(active);
    }

    /// Read a session, refreshing its TTL.
    ///
    /// # Errors
    /// - `SessionExpired` if the session was reclaimed by expiry
    /// - `SessionNotFound` if it never existed or was removed
    pub async fn read(&self, session_id: &SessionId) -> Result<SessionInfo> {
        let now = self.now();
        let mut sessions = self.lock().await;
        sessions.cleanup(now);

        let info = match sessions.live.get_mut(session_id) {
            Some(state) => {
                state.touch(now);
                state.info()
            }
            None => return Err(sessions.missing(session_id)),
        };
        self.publish(&sessions);
        Ok(info)
    }

    /// The most recently used live session, refreshed.
    pub async fn read_active(&self) -> Option<SessionInfo> {
        let now = self.now();
        let mut sessions = self.lock().await;
        sessions.cleanup(now);

        let id = sessions.most_recent_id()?;
        let info = sessions.live.get_mut(&id).map(|state| {
            state.touch(now);
            state.info()
        });
        self.publish(&sessions);
        info
    }

    /// Stream of the current active session.
    ///
    /// Yields the current value first, then on every change. A value whose
    /// TTL has already run out is yielded as `None`.
    pub fn observe_active(&self) -> impl Stream<Item = Option<SessionInfo>> + Send + 'static {
        let rx = self.inner.active.subscribe();
        let clock = self.inner.clock.clone();
        futures::stream::unfold((rx, true), move |(mut rx, first)| {
            let clock = clock.clone();
            async move {
                if !first && rx.changed().await.is_err() {
                    return None;
                }
                let current = rx.borrow_and_update().clone();
                let now = clock.now_millis();
                let visible = current.filter(|info| !info.ttl.is_expired(now));
                Some((visible, (rx, false)))
            }
        })
    }

    /// Store a new session, replacing (and wiping) any other session for
    /// the same vault.
    pub async fn write(&self, state: SessionState) -> SessionInfo {
        let now = self.now();
        let mut sessions = self.lock().await;
        sessions.cleanup(now);

        let vault_id = state.vault_id;
        let before = sessions.live.len();
        sessions.live.retain(|_, s| s.vault_id != vault_id);
        if sessions.live.len() != before {
            debug!("Replaced existing session for vault {}", vault_id);
        }
        sessions.expired.retain(|_, v| *v != vault_id);

        let info = state.info();
        sessions.live.insert(state.session_id.clone(), state);
        self.publish(&sessions);
        info
    }

    /// Set the access time to `now` and the TTL to `ttl_millis` from `now`.
    ///
    /// # Errors
    /// - `SessionExpired` if the session is already past its expiry at `now`
    /// - `SessionNotFound` if there is no such session
    pub async fn update_timestamps(
        &self,
        session_id: &SessionId,
        now: i64,
        ttl_millis: i64,
    ) -> Result<SessionInfo> {
        let mut sessions = self.lock().await;
        sessions.cleanup(now);

        let info = match sessions.live.get_mut(session_id) {
            Some(state) => {
                state.ttl.ttl_millis = ttl_millis;
                state.touch(now);
                state.info()
            }
            None => return Err(sessions.missing(session_id)),
        };
        self.publish(&sessions);
        Ok(info)
    }

    /// Run `f` against a live session's payload, refreshing its TTL.
    pub async fn with_payload<R>(
        &self,
        session_id: &SessionId,
        f: impl FnOnce(&mut SessionPayload) -> Result<R>,
    ) -> Result<R> {
        let now = self.now();
        let mut sessions = self.lock().await;
        sessions.cleanup(now);

        let result = match sessions.live.get_mut(session_id) {
            Some(state) => {
                state.touch(now);
                f(&mut state.payload)
            }
            None => return Err(sessions.missing(session_id)),
        };
        self.publish(&sessions);
        result
    }

    /// Live session for `vault_id`, without refreshing it.
    pub async fn session_for_vault(&self, vault_id: &VaultId) -> Option<SessionInfo> {
        let now = self.now();
        let mut sessions = self.lock().await;
        if sessions.cleanup(now) > 0 {
            self.publish(&sessions);
        }
        sessions
            .live
            .values()
            .find(|s| s.vault_id == *vault_id)
            .map(SessionState::info)
    }

    /// Whether the last session for `vault_id` ended by expiry.
    pub async fn was_expired(&self, vault_id: &VaultId) -> bool {
        let sessions = self.lock().await;
        sessions.expired.values().any(|v| v == vault_id)
    }

    /// Remove a session. Returns whether it existed.
    pub async fn remove(&self, session_id: &SessionId) -> bool {
        let mut sessions = self.lock().await;
        let removed = sessions.live.remove(session_id).is_some();
        sessions.expired.remove(session_id);
        self.publish(&sessions);
        removed
    }

    /// Remove the session for `vault_id`, if any.
    pub async fn remove_vault(&self, vault_id: &VaultId) -> bool {
        let mut sessions = self.lock().await;
        let before = sessions.live.len();
        sessions.live.retain(|_, s| s.vault_id != *vault_id);
        sessions.expired.retain(|_, v| v != vault_id);
        self.publish(&sessions);
        sessions.live.len() != before
    }

    /// Remove every session. Returns how many were live.
    pub async fn clear(&self) -> usize {
        let mut sessions = self.lock().await;
        let count = sessions.live.len();
        sessions.live.clear();
        sessions.expired.clear();
        self.publish(&sessions);
        count
    }

    /// Drop every session once `deadline` (epoch ms) is reached.
    ///
    /// The deadline is checked by the sweep and by every read path, so no
    /// session is visible past it. Replaces any earlier deadline.
    pub async fn lock_at(&self, deadline: i64) {
        let mut sessions = self.lock().await;
        sessions.lock_deadline = Some(deadline);
        debug!("Sessions will be dropped at {}", deadline);
    }

    /// Cancel a pending [`lock_at`](Self::lock_at) deadline. Returns whether
    /// one was pending.
    pub async fn cancel_lock_at(&self) -> bool {
        self.lock().await.lock_deadline.take().is_some()
    }

    /// Vaults with a live session.
    pub async fn live_vaults(&self) -> Vec<VaultId> {
        let now = self.now();
        let mut sessions = self.lock().await;
        if sessions.cleanup(now) > 0 {
            self.publish(&sessions);
        }
        sessions.live.values().map(|s| s.vault_id).collect()
    }

    /// Remove sessions whose expiry is at or before `now`.
    pub async fn cleanup_expired(&self, now: i64) -> usize {
        let mut sessions = self.lock().await;
        let removed = sessions.cleanup(now);
        if removed > 0 {
            self.publish(&sessions);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.lock().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every session without awaiting.
    ///
    /// Returns `None` when the store is busy. The caller must then fall
    /// back to [`mark_emergency_wiped`](Self::mark_emergency_wiped).
    pub fn try_clear(&self) -> Option<usize> {
        let mut sessions = self.inner.sessions.try_lock().ok()?;
        let count = sessions.live.len();
        sessions.live.clear();
        sessions.expired.clear();
        self.inner.active.send_replace(None);
        Some(count)
    }

    /// Record that payload buffers were wiped out from under the store.
    /// The next access discards every session.
    pub fn mark_emergency_wiped(&self) {
        self.inner.emergency_wiped.store(true, Ordering::SeqCst);
        self.inner.active.send_replace(None);
    }

    /// Start the periodic expiry sweep.
    ///
    /// The first sweep runs immediately. Each sweep runs in its own task; a
    /// failed sweep is logged and the loop keeps going.
    pub fn spawn_sweeper(&self, interval: Duration) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let store = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            info!("Session sweeper started ({:?} interval)", interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sweep = store.clone();
                        let result = tokio::spawn(async move {
                            let now = sweep.now();
                            sweep.cleanup_expired(now).await
                        })
                        .await;

                        match result {
                            Ok(0) => {}
                            Ok(removed) => debug!("Swept {} expired sessions", removed),
                            Err(e) => error!("Session sweep failed: {}", e),
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("Session sweeper stopped");
                        break;
                    }
                }
            }
        });

        SweeperHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a running sweeper. Dropping it also stops the sweep.
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Session sweeper exited abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use lockbox_common::ManualClock;

    const TTL: i64 = 1_000;

    fn store() -> (SessionStore, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let store = SessionStore::new(Arc::new(clock.clone()), SecureMemory::with_passes(1));
        (store, clock)
    }

    fn state(store: &SessionStore, vault_id: VaultId) -> SessionState {
        let payload = SessionPayload::new(
            store.memory().copy_from(&[7u8; 32]),
            store.memory().copy_from(b"{}"),
        );
        SessionState::new(vault_id, payload, TTL, store.clock().now_millis())
    }

    #[tokio::test]
    async fn test_readable_until_expiry() {
        let (store, clock) = store();
        let info = store.write(state(&store, VaultId::generate())).await;

        assert!(store.read(&info.session_id).await.is_ok());
        assert!(store.read_active().await.is_some());

        clock.advance(TTL);
        assert!(matches!(
            store.read(&info.session_id).await,
            Err(Error::SessionExpired(_))
        ));
        assert!(store.read_active().await.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_sliding_expiry() {
        let (store, clock) = store();
        let info = store.write(state(&store, VaultId::generate())).await;

        for _ in 0..5 {
            clock.advance(TTL - 1);
            let refreshed = store.read(&info.session_id).await.unwrap();
            assert_eq!(refreshed.ttl.expires_at_epoch_millis, clock.now_millis() + TTL);
        }
    }

    #[tokio::test]
    async fn test_expired_session_not_resurrected() {
        let (store, clock) = store();
        let info = store.write(state(&store, VaultId::generate())).await;
        clock.advance(TTL + 1);

        let result = store
            .update_timestamps(&info.session_id, clock.now_millis(), TTL)
            .await;
        assert!(matches!(result, Err(Error::SessionExpired(_))));
        assert!(store.read(&info.session_id).await.is_err());
    }

    #[tokio::test]
    async fn test_one_session_per_vault() {
        let (store, _clock) = store();
        let vault_id = VaultId::generate();
        let first = store.write(state(&store, vault_id)).await;
        let second = store.write(state(&store, vault_id)).await;

        assert_eq!(store.len().await, 1);
        assert!(matches!(
            store.read(&first.session_id).await,
            Err(Error::SessionNotFound(_))
        ));
        assert!(store.read(&second.session_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_read_active_picks_most_recent() {
        let (store, clock) = store();
        let a = store.write(state(&store, VaultId::generate())).await;
        clock.advance(10);
        let b = store.write(state(&store, VaultId::generate())).await;
        assert_eq!(store.read_active().await.unwrap().session_id, b.session_id);

        clock.advance(10);
        store.read(&a.session_id).await.unwrap();
        assert_eq!(store.read_active().await.unwrap().session_id, a.session_id);
    }

    #[tokio::test]
    async fn test_cleanup_expired_counts() {
        let (store, clock) = store();
        store.write(state(&store, VaultId::generate())).await;
        clock.advance(TTL / 2);
        store.write(state(&store, VaultId::generate())).await;

        assert_eq!(store.cleanup_expired(clock.now_millis()).await, 0);
        assert_eq!(store.cleanup_expired(clock.now_millis() + TTL / 2).await, 1);
        assert_eq!(store.cleanup_expired(clock.now_millis() + TTL).await, 1);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_remove_and_clear_wipe_payload() {
        let (store, _clock) = store();
        let a = store.write(state(&store, VaultId::generate())).await;
        store.write(state(&store, VaultId::generate())).await;
        assert_eq!(store.memory().tracked_count(), 4);

        assert!(store.remove(&a.session_id).await);
        assert!(!store.remove(&a.session_id).await);
        assert_eq!(store.memory().tracked_count(), 2);

        assert_eq!(store.clear().await, 1);
        assert_eq!(store.memory().tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_with_payload() {
        let (store, _clock) = store();
        let info = store.write(state(&store, VaultId::generate())).await;
        let key_len = store
            .with_payload(&info.session_id, |payload| Ok(payload.key().len()))
            .await
            .unwrap();
        assert_eq!(key_len, 32);
    }

    #[tokio::test]
    async fn test_observe_active_yields_none_after_expiry() {
        let (store, clock) = store();
        let mut stream = Box::pin(store.observe_active());
        assert_eq!(stream.next().await, Some(None));

        let info = store.write(state(&store, VaultId::generate())).await;
        let seen = stream.next().await.unwrap().unwrap();
        assert_eq!(seen.session_id, info.session_id);

        clock.advance(TTL);
        store.cleanup_expired(clock.now_millis()).await;
        assert_eq!(stream.next().await, Some(None));
    }

    #[tokio::test]
    async fn test_try_clear_and_emergency_flag() {
        let (store, _clock) = store();
        store.write(state(&store, VaultId::generate())).await;
        assert_eq!(store.try_clear(), Some(1));

        store.write(state(&store, VaultId::generate())).await;
        store.memory().wipe_all();
        store.mark_emergency_wiped();
        assert!(store.read_active().await.is_none());
    }

    #[tokio::test]
    async fn test_lock_deadline_drops_sessions_on_read() {
        let (store, clock) = store();
        let info = store.write(state(&store, VaultId::generate())).await;
        store.lock_at(clock.now_millis() + 500).await;

        clock.advance(499);
        assert!(store.read(&info.session_id).await.is_ok());

        clock.advance(1);
        assert!(matches!(
            store.read(&info.session_id).await,
            Err(Error::SessionNotFound(_))
        ));
        assert!(store.read_active().await.is_none());
        assert_eq!(store.memory().tracked_count(), 0);
        assert!(!store.cancel_lock_at().await);
    }

    #[tokio::test]
    async fn test_cancelled_deadline_keeps_sessions() {
        let (store, clock) = store();
        let info = store.write(state(&store, VaultId::generate())).await;
        store.lock_at(clock.now_millis() + 100).await;
        assert!(store.cancel_lock_at().await);

        clock.advance(200);
        assert!(store.read(&info.session_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_sweeper_enforces_lock_deadline() {
        let (store, clock) = store();
        let vault_id = VaultId::generate();
        store.write(state(&store, vault_id)).await;
        assert_eq!(store.live_vaults().await, vec![vault_id]);

        store.lock_at(clock.now_millis() + 100).await;
        clock.advance(100);

        let handle = store.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        // `len` does not run cleanup, so only the sweep can have emptied it.
        assert_eq!(store.len().await, 0);
        assert_eq!(store.memory().tracked_count(), 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweeper_runs_immediately_and_stops() {
        let (store, clock) = store();
        store.write(state(&store, VaultId::generate())).await;
        clock.advance(TTL);

        let handle = store.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.is_empty().await);

        handle.shutdown().await;
    }
}
