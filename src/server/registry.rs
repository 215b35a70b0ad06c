//! Live session tracking and aggregate presence.
//!
//! Presence is best-effort and non-authoritative; nothing here sits on the
//! update log's critical path. Sessions are marked inactive, never deleted,
//! while the underlying credential is valid.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::core::{SessionId, UserId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub last_active_ms: u64,
    pub is_active: bool,
}

/// Aggregate online/offline transition for one user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: UserId,
    pub online: bool,
    pub at_ms: u64,
}

#[derive(Default)]
struct RegistryState {
    by_id: BTreeMap<SessionId, SessionRecord>,
    by_user: BTreeMap<UserId, BTreeSet<SessionId>>,
}

pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    /// A session is "recently active" within this window of its last
    /// heartbeat.
    active_window_ms: u64,
}

impl ConnectionRegistry {
    pub fn new(active_window_ms: u64) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            active_window_ms,
        }
    }

    /// Register an authenticated connection. Returns the presence transition,
    /// if the user just came online.
    pub fn connect(
        &self,
        session_id: SessionId,
        user_id: UserId,
        now_ms: u64,
    ) -> Option<PresenceChange> {
        let mut state = self.lock();
        let was_online = user_online(&state, user_id, now_ms, self.active_window_ms);

        state.by_id.insert(
            session_id,
            SessionRecord {
                session_id,
                user_id,
                last_active_ms: now_ms,
                is_active: true,
            },
        );
        state.by_user.entry(user_id).or_default().insert(session_id);

        (!was_online).then_some(PresenceChange {
            user_id,
            online: true,
            at_ms: now_ms,
        })
    }

    /// Refresh a session's liveness. Unknown sessions return false.
    pub fn heartbeat(&self, session_id: SessionId, now_ms: u64) -> bool {
        let mut state = self.lock();
        match state.by_id.get_mut(&session_id) {
            Some(record) => {
                record.last_active_ms = now_ms;
                record.is_active = true;
                true
            }
            None => false,
        }
    }

    /// Mark a session inactive on close. Returns the presence transition, if
    /// the user just went offline.
    pub fn disconnect(&self, session_id: SessionId, now_ms: u64) -> Option<PresenceChange> {
        let mut state = self.lock();
        let user_id = match state.by_id.get_mut(&session_id) {
            Some(record) => {
                record.is_active = false;
                record.user_id
            }
            None => return None,
        };

        let still_online = user_online(&state, user_id, now_ms, self.active_window_ms);
        (!still_online).then_some(PresenceChange {
            user_id,
            online: false,
            at_ms: now_ms,
        })
    }

    /// Expire sessions whose heartbeat lapsed; returns every user whose
    /// aggregate status flipped to offline.
    pub fn sweep(&self, now_ms: u64) -> Vec<PresenceChange> {
        let mut state = self.lock();
        let mut affected_users = BTreeSet::new();

        for record in state.by_id.values_mut() {
            if record.is_active && stale(record.last_active_ms, now_ms, self.active_window_ms) {
                record.is_active = false;
                affected_users.insert(record.user_id);
            }
        }

        affected_users
            .into_iter()
            .filter(|user_id| !user_online(&state, *user_id, now_ms, self.active_window_ms))
            .map(|user_id| PresenceChange {
                user_id,
                online: false,
                at_ms: now_ms,
            })
            .collect()
    }

    pub fn is_online(&self, user_id: UserId, now_ms: u64) -> bool {
        user_online(&self.lock(), user_id, now_ms, self.active_window_ms)
    }

    pub fn session(&self, session_id: SessionId) -> Option<SessionRecord> {
        self.lock().by_id.get(&session_id).cloned()
    }

    /// Active sessions of one user (multi-device fan-out set).
    pub fn active_sessions(&self, user_id: UserId, now_ms: u64) -> Vec<SessionId> {
        let state = self.lock();
        let Some(sessions) = state.by_user.get(&user_id) else {
            return Vec::new();
        };
        sessions
            .iter()
            .filter(|session_id| {
                state.by_id.get(session_id).is_some_and(|record| {
                    record.is_active
                        && !stale(record.last_active_ms, now_ms, self.active_window_ms)
                })
            })
            .copied()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().expect("registry lock poisoned")
    }
}

fn stale(last_active_ms: u64, now_ms: u64, window_ms: u64) -> bool {
    now_ms.saturating_sub(last_active_ms) > window_ms
}

fn user_online(state: &RegistryState, user_id: UserId, now_ms: u64, window_ms: u64) -> bool {
    state
        .by_user
        .get(&user_id)
        .map(|sessions| {
            sessions.iter().any(|session_id| {
                state.by_id.get(session_id).is_some_and(|record| {
                    record.is_active && !stale(record.last_active_ms, now_ms, window_ms)
                })
            })
        })
        .unwrap_or(false)
}
