//! Fan-out of committed updates to live sessions.
//!
//! Delivery is fire-and-forget: a full or dead outbox is never an error and
//! never blocks the committing path. Durability lives in the log; a session
//! that missed a push recovers through catch-up.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{Sender, TrySendError};
use tracing::{debug, trace};

use crate::core::{SessionId, Update, UpdateKey};
use crate::proto::{Updates, WireMessage};

struct SessionLink {
    outbox: Sender<WireMessage>,
    interests: BTreeSet<UpdateKey>,
}

#[derive(Default)]
struct DispatchState {
    sessions: BTreeMap<SessionId, SessionLink>,
    interest: BTreeMap<UpdateKey, BTreeSet<SessionId>>,
}

/// Cross-bucket ordering is NOT guaranteed: two partitions may reach a
/// session in either order. Within one `(bucket, entity)` the batch order is
/// the commit order.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<Mutex<DispatchState>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live session with its initial subscription set.
    pub fn attach(
        &self,
        session_id: SessionId,
        outbox: Sender<WireMessage>,
        interests: Vec<UpdateKey>,
    ) {
        let mut state = self.lock();
        for key in &interests {
            state.interest.entry(*key).or_default().insert(session_id);
        }
        state.sessions.insert(
            session_id,
            SessionLink {
                outbox,
                interests: interests.into_iter().collect(),
            },
        );
    }

    /// Extend a live session's subscription set. Unknown sessions are ignored
    /// (they pick the key up from `interests` on their next connect).
    pub fn subscribe(&self, session_id: SessionId, key: UpdateKey) {
        let mut state = self.lock();
        let Some(link) = state.sessions.get_mut(&session_id) else {
            return;
        };
        if link.interests.insert(key) {
            state.interest.entry(key).or_default().insert(session_id);
        }
    }

    pub fn detach(&self, session_id: SessionId) {
        let mut state = self.lock();
        detach_locked(&mut state, session_id);
    }

    /// Push a committed batch to every interested session, the acting user's
    /// own sessions included. Never blocks; failures are swallowed.
    pub fn dispatch(&self, rows: &[Update]) {
        if rows.is_empty() {
            return;
        }

        let mut state = self.lock();

        // One UPDATES message per session, batch order preserved.
        let mut per_session: BTreeMap<SessionId, Vec<Update>> = BTreeMap::new();
        for row in rows {
            if let Some(sessions) = state.interest.get(&row.key()) {
                for session_id in sessions {
                    per_session
                        .entry(*session_id)
                        .or_default()
                        .push(row.clone());
                }
            }
        }

        let mut dead = Vec::new();
        for (session_id, updates) in per_session {
            let Some(link) = state.sessions.get(&session_id) else {
                continue;
            };
            match link
                .outbox
                .try_send(WireMessage::Updates(Updates { updates }))
            {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // Lagging session: drop the push, the log keeps the rows.
                    debug!(session = %session_id, "update push dropped, session lagging");
                }
                Err(TrySendError::Disconnected(_)) => {
                    dead.push(session_id);
                }
            }
        }

        for session_id in dead {
            trace!(session = %session_id, "pruning dead session outbox");
            detach_locked(&mut state, session_id);
        }
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DispatchState> {
        self.inner.lock().expect("dispatcher lock poisoned")
    }
}

fn detach_locked(state: &mut DispatchState, session_id: SessionId) {
    if let Some(link) = state.sessions.remove(&session_id) {
        for key in link.interests {
            if let Some(sessions) = state.interest.get_mut(&key) {
                sessions.remove(&session_id);
                if sessions.is_empty() {
                    state.interest.remove(&key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Bucket, EntityId, Seq0};
    use bytes::Bytes;
    use crossbeam::channel::bounded;

    fn chat(entity: i64) -> UpdateKey {
        UpdateKey::new(Bucket::Chat, EntityId::new(entity))
    }

    fn row(entity: i64, seq: u32) -> Update {
        Update {
            bucket: Bucket::Chat,
            entity_id: EntityId::new(entity),
            seq: Seq0::new(seq - 1).next(),
            date_ms: 0,
            payload: Bytes::new(),
        }
    }

    #[test]
    fn delivers_only_to_interested_sessions() {
        let dispatcher = Dispatcher::new();
        let (tx_a, rx_a) = bounded(8);
        let (tx_b, rx_b) = bounded(8);
        let a = SessionId::generate();
        let b = SessionId::generate();
        dispatcher.attach(a, tx_a, vec![chat(10)]);
        dispatcher.attach(b, tx_b, vec![chat(11)]);

        dispatcher.dispatch(&[row(10, 1)]);

        assert!(matches!(rx_a.try_recv(), Ok(WireMessage::Updates(_))));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn all_sessions_of_a_user_receive_the_push() {
        let dispatcher = Dispatcher::new();
        let (tx_a, rx_a) = bounded(8);
        let (tx_b, rx_b) = bounded(8);
        let phone = SessionId::generate();
        let laptop = SessionId::generate();
        dispatcher.attach(phone, tx_a, vec![chat(10)]);
        dispatcher.attach(laptop, tx_b, vec![chat(10)]);

        dispatcher.dispatch(&[row(10, 1)]);

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn full_outbox_is_swallowed() {
        let dispatcher = Dispatcher::new();
        let (tx, rx) = bounded(1);
        let session = SessionId::generate();
        dispatcher.attach(session, tx, vec![chat(10)]);

        dispatcher.dispatch(&[row(10, 1)]);
        dispatcher.dispatch(&[row(10, 2)]);
        dispatcher.dispatch(&[row(10, 3)]);

        // Only the first push fit; the session is still attached.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(dispatcher.session_count(), 1);
    }

    #[test]
    fn dead_session_is_pruned() {
        let dispatcher = Dispatcher::new();
        let (tx, rx) = bounded(1);
        let session = SessionId::generate();
        dispatcher.attach(session, tx, vec![chat(10)]);
        drop(rx);

        dispatcher.dispatch(&[row(10, 1)]);
        assert_eq!(dispatcher.session_count(), 0);
    }

    #[test]
    fn late_subscribe_extends_interests() {
        let dispatcher = Dispatcher::new();
        let (tx, rx) = bounded(8);
        let session = SessionId::generate();
        dispatcher.attach(session, tx, vec![chat(10)]);

        dispatcher.dispatch(&[row(11, 1)]);
        assert!(rx.try_recv().is_err());

        dispatcher.subscribe(session, chat(11));
        dispatcher.dispatch(&[row(11, 2)]);
        assert!(rx.try_recv().is_ok());
    }
}
