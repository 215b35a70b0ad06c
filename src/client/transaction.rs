//! Client transaction: one locally-initiated mutation tracked through its
//! full network lifecycle.

use std::fmt;

use bytes::Bytes;
use crossbeam::channel::{bounded, Receiver, Sender};
use uuid::Uuid;

use crate::core::{MsgId, RpcError};

use super::store::ReplicaStore;

/// Local identity of a transaction, independent of any msg id it is sent
/// under (a requeued transaction is resent under a fresh msg id).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(Uuid);

impl TxnId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxnId({})", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle: `Queued -> Sending -> InFlight -> {Completed | Failed |
/// Cancelled}`. Disconnection moves `InFlight` back to `Queued` (the server
/// outcome is unknown; resends are deduplicated by an idempotency key inside
/// the opaque input).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnState {
    Queued,
    Sending,
    InFlight,
    Completed,
    Failed,
    Cancelled,
}

impl TxnState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TxnState::Completed | TxnState::Failed | TxnState::Cancelled
        )
    }
}

/// Terminal outcome delivered to the submitter.
#[derive(Clone, Debug, PartialEq)]
pub enum TxnOutcome {
    Completed(Bytes),
    Failed(RpcError),
    Cancelled,
}

type OptimisticHook = Box<dyn FnOnce(&ReplicaStore) + Send>;
type ApplyHook = Box<dyn FnOnce(&Bytes, &ReplicaStore) + Send>;
type FailedHook = Box<dyn FnOnce(&RpcError, &ReplicaStore) + Send>;
type CancelledHook = Box<dyn FnOnce(&ReplicaStore) + Send>;

#[derive(Default)]
pub(crate) struct TxnHooks {
    pub optimistic: Option<OptimisticHook>,
    pub apply: Option<ApplyHook>,
    pub failed: Option<FailedHook>,
    pub cancelled: Option<CancelledHook>,
}

pub struct Transaction {
    pub id: TxnId,
    pub method: String,
    pub input: Bytes,
    pub(crate) msg_id: Option<MsgId>,
    pub(crate) state: TxnState,
    pub(crate) local_only: bool,
    pub(crate) hooks: TxnHooks,
    pub(crate) waiter: Option<Sender<TxnOutcome>>,
}

impl Transaction {
    pub fn new(method: impl Into<String>, input: Bytes) -> Self {
        Self {
            id: TxnId::generate(),
            method: method.into(),
            input,
            msg_id: None,
            state: TxnState::Queued,
            local_only: false,
            hooks: TxnHooks::default(),
            waiter: None,
        }
    }

    /// A transaction that skips the network and resolves synchronously
    /// against the store at submit time.
    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }

    /// Speculative local mutation, run synchronously at submit time so the
    /// UI reflects the change regardless of connectivity.
    pub fn on_optimistic(mut self, hook: impl FnOnce(&ReplicaStore) + Send + 'static) -> Self {
        self.hooks.optimistic = Some(Box::new(hook));
        self
    }

    /// Runs when the server confirms the call, before the waiter resolves.
    pub fn on_apply(
        mut self,
        hook: impl FnOnce(&Bytes, &ReplicaStore) + Send + 'static,
    ) -> Self {
        self.hooks.apply = Some(Box::new(hook));
        self
    }

    /// Compensation when the server rejects the call (typically rolling back
    /// the optimistic mutation).
    pub fn on_failed(
        mut self,
        hook: impl FnOnce(&RpcError, &ReplicaStore) + Send + 'static,
    ) -> Self {
        self.hooks.failed = Some(Box::new(hook));
        self
    }

    /// Compensation when the caller cancels before completion.
    pub fn on_cancelled(mut self, hook: impl FnOnce(&ReplicaStore) + Send + 'static) -> Self {
        self.hooks.cancelled = Some(Box::new(hook));
        self
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn msg_id(&self) -> Option<MsgId> {
        self.msg_id
    }

    pub(crate) fn attach_waiter(&mut self) -> Receiver<TxnOutcome> {
        let (tx, rx) = bounded(1);
        self.waiter = Some(tx);
        rx
    }

    pub(crate) fn resolve(&mut self, outcome: TxnOutcome) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(outcome);
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("state", &self.state)
            .field("msg_id", &self.msg_id)
            .field("local_only", &self.local_only)
            .finish_non_exhaustive()
    }
}

/// Caller's handle on a submitted transaction.
pub struct TxnReceipt {
    pub id: TxnId,
    outcome_rx: Receiver<TxnOutcome>,
}

impl TxnReceipt {
    pub(crate) fn new(id: TxnId, outcome_rx: Receiver<TxnOutcome>) -> Self {
        Self { id, outcome_rx }
    }

    /// Block until the transaction reaches a terminal state. An engine that
    /// shut down without resolving reads as cancelled.
    pub fn wait(&self) -> TxnOutcome {
        self.outcome_rx
            .recv()
            .unwrap_or(TxnOutcome::Cancelled)
    }

    pub fn wait_timeout(&self, timeout: std::time::Duration) -> Option<TxnOutcome> {
        match self.outcome_rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => None,
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => Some(TxnOutcome::Cancelled),
        }
    }

    pub fn try_outcome(&self) -> Option<TxnOutcome> {
        self.outcome_rx.try_recv().ok()
    }
}
