//! Transaction engine: FIFO queue, optimistic apply, correlation, requeue.
//!
//! Exactly one engine thread exists per logical connection; it is the single
//! consumer of both caller commands and the connection's inbound events, so
//! every completion/failure/update-apply handler runs sequentially in arrival
//! order and nothing mutates the store concurrently. The flush loop drains
//! the queue only while connected.

use std::collections::{BTreeMap, VecDeque};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::core::{Limits, MsgId};
use crate::error::{Effect, Transience};

use super::conn::{ClientEvent, ProtocolClient};
use super::cursor::CursorStore;
use super::store::ReplicaStore;
use super::transaction::{Transaction, TxnOutcome, TxnReceipt, TxnState};

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input rejected before enqueue; no hook has run.
    #[error("invalid transaction: {reason}")]
    Validation { reason: String },
    #[error("engine stopped")]
    Stopped,
}

impl EngineError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub limits: Limits,
    /// Reconnect automatically after transport loss.
    pub auto_reconnect: bool,
    /// Backoff cap for reconnect attempts.
    pub max_reconnect_delay: Duration,
    /// Cadence of liveness pings while connected.
    pub heartbeat_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            auto_reconnect: true,
            max_reconnect_delay: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

type CancelPredicate = Box<dyn FnMut(&Transaction) -> bool + Send>;

enum EngineCommand {
    Enqueue(Box<Transaction>),
    CancelWhere(CancelPredicate),
    Shutdown,
}

pub struct TransactionEngine {
    cmd_tx: Sender<EngineCommand>,
    store: ReplicaStore,
    limits: Limits,
    join: Option<JoinHandle<()>>,
}

impl TransactionEngine {
    /// Start the engine thread over an existing client and its event stream.
    pub fn start(
        store: ReplicaStore,
        client: ProtocolClient,
        events_rx: Receiver<ClientEvent>,
        cursors: Box<dyn CursorStore>,
        config: EngineConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = unbounded();
        let limits = config.limits.clone();
        let core = EngineCore {
            store: store.clone(),
            client,
            cursors,
            config,
            queue: VecDeque::new(),
            in_flight: BTreeMap::new(),
            connected: false,
            reconnect_pending: false,
        };
        let join = thread::spawn(move || core.run(cmd_rx, events_rx));
        Self {
            cmd_tx,
            store,
            limits,
            join: Some(join),
        }
    }

    pub fn store(&self) -> &ReplicaStore {
        &self.store
    }

    /// Submit a transaction. The optimistic hook runs synchronously on the
    /// calling thread, before this returns, so local state reflects the
    /// mutation regardless of connectivity.
    pub fn submit(&self, mut txn: Transaction) -> Result<TxnReceipt, EngineError> {
        if txn.method.is_empty() {
            return Err(EngineError::Validation {
                reason: "method cannot be empty".into(),
            });
        }
        if txn.input.len() > self.limits.max_frame_bytes {
            return Err(EngineError::Validation {
                reason: format!(
                    "input {} bytes exceeds max frame {}",
                    txn.input.len(),
                    self.limits.max_frame_bytes
                ),
            });
        }

        let outcome_rx = txn.attach_waiter();
        let receipt = TxnReceipt::new(txn.id, outcome_rx);

        if let Some(hook) = txn.hooks.optimistic.take() {
            hook(&self.store);
        }

        if txn.local_only {
            if let Some(apply) = txn.hooks.apply.take() {
                apply(&Bytes::new(), &self.store);
            }
            txn.state = TxnState::Completed;
            txn.resolve(TxnOutcome::Completed(Bytes::new()));
            return Ok(receipt);
        }

        self.cmd_tx
            .send(EngineCommand::Enqueue(Box::new(txn)))
            .map_err(|_| EngineError::Stopped)?;
        Ok(receipt)
    }

    /// Cancel every non-terminal transaction matching the predicate. Each
    /// cancelled transaction runs its `cancelled` hook and resolves its
    /// waiter with `Cancelled`.
    pub fn cancel_where(
        &self,
        predicate: impl FnMut(&Transaction) -> bool + Send + 'static,
    ) -> Result<(), EngineError> {
        self.cmd_tx
            .send(EngineCommand::CancelWhere(Box::new(predicate)))
            .map_err(|_| EngineError::Stopped)
    }

    /// Stop the engine. Remaining non-terminal transactions are cancelled,
    /// never silently dropped.
    pub fn shutdown(mut self) {
        let _ = self.cmd_tx.send(EngineCommand::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

struct EngineCore {
    store: ReplicaStore,
    client: ProtocolClient,
    cursors: Box<dyn CursorStore>,
    config: EngineConfig,
    queue: VecDeque<Box<Transaction>>,
    in_flight: BTreeMap<MsgId, Box<Transaction>>,
    connected: bool,
    reconnect_pending: bool,
}

impl EngineCore {
    fn run(mut self, cmd_rx: Receiver<EngineCommand>, events_rx: Receiver<ClientEvent>) {
        let heartbeat = crossbeam::channel::tick(self.config.heartbeat_interval);
        let mut ping_nonce: u64 = 0;

        loop {
            crossbeam::select! {
                recv(cmd_rx) -> msg => {
                    match msg {
                        Ok(EngineCommand::Enqueue(txn)) => {
                            trace!(txn = %txn.id, method = %txn.method, "queued");
                            self.queue.push_back(txn);
                            self.flush();
                        }
                        Ok(EngineCommand::CancelWhere(mut predicate)) => {
                            self.cancel_matching(predicate.as_mut());
                        }
                        Ok(EngineCommand::Shutdown) | Err(_) => break,
                    }
                }
                recv(events_rx) -> msg => {
                    match msg {
                        Ok(event) => self.handle_event(event),
                        Err(_) => break,
                    }
                }
                recv(heartbeat) -> _ => {
                    if self.connected {
                        ping_nonce += 1;
                        if let Err(e) = self.client.send_ping(ping_nonce) {
                            debug!(error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        }

        // Terminal cleanup: nothing is silently dropped.
        self.cancel_matching(&mut |_| true);
    }

    fn handle_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connecting => {
                trace!("connecting");
            }
            ClientEvent::Open { session_id, .. } => {
                debug!(session = %session_id, "connection open");
                self.connected = true;
                self.reconnect_pending = false;
                if let Err(e) = self.client.send_catchup(self.cursors.load()) {
                    warn!(error = %e, "catch-up request failed");
                }
                self.flush();
            }
            ClientEvent::Ack(msg_id) => {
                // Weak signal only; the transaction stays in flight.
                trace!(msg_id = %msg_id, "acked");
            }
            ClientEvent::Result { msg_id, result } => {
                let Some(mut txn) = self.in_flight.remove(&msg_id) else {
                    debug!(msg_id = %msg_id, "result for unknown msg id ignored");
                    return;
                };
                if let Some(apply) = txn.hooks.apply.take() {
                    apply(&result, &self.store);
                }
                txn.state = TxnState::Completed;
                txn.resolve(TxnOutcome::Completed(result));
            }
            ClientEvent::RpcError { msg_id, error } => {
                let Some(mut txn) = self.in_flight.remove(&msg_id) else {
                    debug!(msg_id = %msg_id, "error for unknown msg id ignored");
                    return;
                };
                if let Some(failed) = txn.hooks.failed.take() {
                    failed(&error, &self.store);
                }
                txn.state = TxnState::Failed;
                txn.resolve(TxnOutcome::Failed(error));
            }
            ClientEvent::Updates(updates) => {
                if let Err(e) = self.store.apply_updates(&updates, &self.config.limits) {
                    warn!(error = %e, "update batch rejected");
                    return;
                }
                for update in &updates {
                    self.cursors.advance(update.key(), update.seq);
                }
            }
            ClientEvent::Resync(keys) => {
                warn!(partitions = keys.len(), "cursor predates retained history, resync required");
                self.cursors.clear(&keys);
            }
            ClientEvent::Closed => {
                self.connected = false;
                self.requeue_in_flight();
                self.maybe_reconnect();
            }
        }
    }

    /// Single flush loop: drains the queue head-first while connected,
    /// preserving submission order.
    fn flush(&mut self) {
        while self.connected {
            let Some(mut txn) = self.queue.pop_front() else {
                return;
            };
            txn.state = TxnState::Sending;
            match self.client.send_call(&txn.method, txn.input.clone()) {
                Ok(msg_id) => {
                    txn.msg_id = Some(msg_id);
                    txn.state = TxnState::InFlight;
                    self.in_flight.insert(msg_id, txn);
                }
                Err(e) => {
                    // Head goes back to the head: later drains keep order.
                    debug!(error = %e, "send failed, requeueing at head");
                    txn.state = TxnState::Queued;
                    txn.msg_id = None;
                    self.queue.push_front(txn);
                    return;
                }
            }
        }
    }

    /// Disconnect: every in-flight outcome is unknown. Requeue them, in
    /// original send order, ahead of anything not yet sent; the resend is
    /// deduplicated server-side by the idempotency key in the input.
    fn requeue_in_flight(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }
        debug!(count = self.in_flight.len(), "requeueing in-flight transactions");
        let in_flight = std::mem::take(&mut self.in_flight);
        for (_, mut txn) in in_flight.into_iter().rev() {
            txn.state = TxnState::Queued;
            txn.msg_id = None;
            self.queue.push_front(txn);
        }
    }

    fn maybe_reconnect(&mut self) {
        if !self.config.auto_reconnect || self.reconnect_pending {
            return;
        }
        self.reconnect_pending = true;
        let client = self.client.clone();
        let max_delay = self.config.max_reconnect_delay;
        thread::spawn(move || client.connect_with_retry(max_delay));
    }

    fn cancel_matching(&mut self, predicate: &mut dyn FnMut(&Transaction) -> bool) {
        let mut kept = VecDeque::with_capacity(self.queue.len());
        while let Some(txn) = self.queue.pop_front() {
            if predicate(&txn) {
                self.cancel(txn);
            } else {
                kept.push_back(txn);
            }
        }
        self.queue = kept;

        let matching: Vec<MsgId> = self
            .in_flight
            .iter()
            .filter(|(_, txn)| predicate(txn))
            .map(|(msg_id, _)| *msg_id)
            .collect();
        for msg_id in matching {
            if let Some(txn) = self.in_flight.remove(&msg_id) {
                self.cancel(txn);
            }
        }
    }

    fn cancel(&mut self, mut txn: Box<Transaction>) {
        if let Some(cancelled) = txn.hooks.cancelled.take() {
            cancelled(&self.store);
        }
        txn.state = TxnState::Cancelled;
        txn.resolve(TxnOutcome::Cancelled);
    }
}

impl std::fmt::Debug for TransactionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionEngine").finish_non_exhaustive()
    }
}
