use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::debug;

use peerlink_types::models::{SessionState, TransferSession};

/// Transfer sessions keyed by room, plus the id of the live connection.
///
/// Every channel connection gets a fresh handle. Sessions record the handle
/// they were joined under, so anything joined on a dropped connection can be
/// told apart from sessions on the current one.
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<SessionTableInner>,
}

#[derive(Default)]
struct SessionTableInner {
    sessions: RwLock<HashMap<String, TransferSession>>,
    next_handle: AtomicU64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the handle for a new channel connection.
    pub fn next_handle(&self) -> u64 {
        self.inner.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record (or refresh) the session for `transfer_room`.
    pub async fn join(
        &self,
        transfer_room: &str,
        device_id: &str,
        username: &str,
        channel_handle: u64,
        state: SessionState,
    ) {
        let mut sessions = self.inner.sessions.write().await;
        let session = sessions
            .entry(transfer_room.to_string())
            .or_insert_with(|| TransferSession {
                device_id: device_id.to_string(),
                username: username.to_string(),
                transfer_room: transfer_room.to_string(),
                channel_handle,
                state,
            });
        if !device_id.is_empty() {
            session.device_id = device_id.to_string();
        }
        session.channel_handle = channel_handle;
        // A relay confirmation never downgrades an active session.
        if session.state != SessionState::Active || state == SessionState::Active {
            session.state = state;
        }
        debug!("Session {} -> {:?} (connection {})", transfer_room, session.state, channel_handle);
    }

    pub async fn get(&self, transfer_room: &str) -> Option<TransferSession> {
        self.inner.sessions.read().await.get(transfer_room).cloned()
    }

    /// Mark every session owned by `channel_handle` invalid. Returns how many.
    pub async fn invalidate(&self, channel_handle: u64) -> usize {
        let mut sessions = self.inner.sessions.write().await;
        let mut count = 0;
        for session in sessions.values_mut() {
            if session.channel_handle == channel_handle
                && session.state != SessionState::Invalidated
            {
                session.state = SessionState::Invalidated;
                count += 1;
            }
        }
        count
    }

    /// Drop invalidated sessions.
    pub async fn prune(&self) -> usize {
        let mut sessions = self.inner.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.state != SessionState::Invalidated);
        before - sessions.len()
    }

    pub async fn active(&self) -> Vec<TransferSession> {
        self.inner
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.state == SessionState::Active)
            .cloned()
            .collect()
    }
}
