//! On-demand backfill of referenced-but-missing objects.
//!
//! One runner per target, one outstanding batch per runner. A failed batch
//! is logged and its ids drop out of the in-flight set; they are re-requested
//! by whichever later `ensure_cached` call still misses them - no automatic
//! retry.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;

use bytes::Bytes;
use minicbor::Encoder;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::{decode_update_body, EntityId, Kind, Limits, ObjectRef, RpcError, UserId};

use super::conn::{CallError, NetError, ProtocolClient};
use super::store::ReplicaStore;

/// One backfill scope: messages referenced from a chat, as seen by a peer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FetchTarget {
    pub peer: UserId,
    pub chat_id: EntityId,
}

impl FetchTarget {
    pub fn new(peer: UserId, chat_id: EntityId) -> Self {
        Self { peer, chat_id }
    }
}

impl fmt::Debug for FetchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FetchTarget({}/{})", self.peer, self.chat_id)
    }
}

impl fmt::Display for FetchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peer, self.chat_id)
    }
}

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("fetch rejected: {0}")]
    Rpc(RpcError),
    #[error("connection lost during fetch")]
    ConnectionLost,
    #[error("transport: {0}")]
    Net(#[from] NetError),
    #[error("fetched payload undecodable: {0}")]
    Payload(#[from] crate::core::DecodeError),
}

/// Decides whether an id is already resolvable locally.
pub trait Resolver: Send + Sync {
    fn is_cached(&self, target: &FetchTarget, id: i64) -> bool;
}

/// Store-backed resolver for one object kind.
pub struct StoreResolver {
    store: ReplicaStore,
    kind: Kind,
}

impl StoreResolver {
    pub fn new(store: ReplicaStore, kind: Kind) -> Self {
        Self { store, kind }
    }
}

impl Resolver for StoreResolver {
    fn is_cached(&self, _target: &FetchTarget, id: i64) -> bool {
        self.store.contains(&ObjectRef::new(self.kind, id))
    }
}

/// Issues one batched fetch and lands the result locally.
pub trait FetchRpc: Send + Sync {
    fn fetch_batch(&self, target: &FetchTarget, ids: &[i64]) -> Result<(), BackfillError>;
}

/// Wire-backed fetcher: calls `method` with `{chat, ids, peer}` and applies
/// the returned replica ops to the store.
pub struct CallFetchRpc {
    client: ProtocolClient,
    store: ReplicaStore,
    method: String,
    limits: Limits,
}

impl CallFetchRpc {
    pub fn new(
        client: ProtocolClient,
        store: ReplicaStore,
        method: impl Into<String>,
        limits: Limits,
    ) -> Self {
        Self {
            client,
            store,
            method: method.into(),
            limits,
        }
    }
}

impl FetchRpc for CallFetchRpc {
    fn fetch_batch(&self, target: &FetchTarget, ids: &[i64]) -> Result<(), BackfillError> {
        let input = encode_fetch_input(target, ids).map_err(NetError::Encode)?;
        let ticket = self.client.call(&self.method, input)?;
        let result = match ticket.wait() {
            Ok(result) => result,
            Err(CallError::Rpc(error)) => return Err(BackfillError::Rpc(error)),
            Err(CallError::ConnectionLost) => return Err(BackfillError::ConnectionLost),
        };

        let body = decode_update_body(&result, &self.limits)?;
        self.store.batch(|| {
            for op in &body.ops {
                self.store.apply_op(op);
            }
        });
        Ok(())
    }
}

fn encode_fetch_input(
    target: &FetchTarget,
    ids: &[i64],
) -> Result<Bytes, crate::core::EncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(3)?;
    enc.str("chat")?;
    enc.i64(target.chat_id.get())?;
    enc.str("ids")?;
    enc.array(ids.len() as u64)?;
    for id in ids {
        enc.i64(*id)?;
    }
    enc.str("peer")?;
    enc.i64(target.peer.get())?;
    Ok(Bytes::from(buf))
}

#[derive(Default)]
struct TargetState {
    queued: BTreeSet<i64>,
    in_flight: BTreeSet<i64>,
    runner_active: bool,
}

struct BackfillInner {
    targets: Mutex<BTreeMap<FetchTarget, TargetState>>,
    resolver: Arc<dyn Resolver>,
    rpc: Arc<dyn FetchRpc>,
    max_batch: usize,
}

#[derive(Clone)]
pub struct BackfillFetcher {
    inner: Arc<BackfillInner>,
}

impl BackfillFetcher {
    pub fn new(resolver: Arc<dyn Resolver>, rpc: Arc<dyn FetchRpc>, max_batch: usize) -> Self {
        Self {
            inner: Arc::new(BackfillInner {
                targets: Mutex::new(BTreeMap::new()),
                resolver,
                rpc,
                max_batch: max_batch.max(1),
            }),
        }
    }

    /// Request that `ids` become locally resolvable for `target`. Already
    /// cached, queued, or in-flight ids are skipped; a runner is started for
    /// the target if none is active.
    pub fn ensure_cached(&self, target: FetchTarget, ids: &[i64]) {
        let missing: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| !self.inner.resolver.is_cached(&target, *id))
            .collect();
        if missing.is_empty() {
            return;
        }

        let start_runner = {
            let mut targets = self.inner.lock_targets();
            let state = targets.entry(target).or_default();
            let mut added = false;
            for id in missing {
                if !state.in_flight.contains(&id) && state.queued.insert(id) {
                    added = true;
                }
            }
            if added && !state.runner_active {
                state.runner_active = true;
                true
            } else {
                false
            }
        };

        if start_runner {
            let inner = Arc::clone(&self.inner);
            thread::spawn(move || run_target(inner, target));
        }
    }

    /// Queued + in-flight ids for a target (empty when idle).
    pub fn pending(&self, target: &FetchTarget) -> usize {
        let targets = self.inner.lock_targets();
        targets
            .get(target)
            .map(|state| state.queued.len() + state.in_flight.len())
            .unwrap_or(0)
    }

    pub fn is_idle(&self) -> bool {
        let targets = self.inner.lock_targets();
        targets.values().all(|state| {
            state.queued.is_empty() && state.in_flight.is_empty() && !state.runner_active
        })
    }
}

impl BackfillInner {
    fn lock_targets(&self) -> std::sync::MutexGuard<'_, BTreeMap<FetchTarget, TargetState>> {
        self.targets.lock().expect("backfill lock poisoned")
    }
}

fn run_target(inner: Arc<BackfillInner>, target: FetchTarget) {
    loop {
        // Move one batch from queued to in-flight.
        let batch: Vec<i64> = {
            let mut targets = inner.lock_targets();
            let Some(state) = targets.get_mut(&target) else {
                return;
            };
            if state.queued.is_empty() {
                state.runner_active = false;
                if state.in_flight.is_empty() {
                    targets.remove(&target);
                }
                return;
            }
            let batch: Vec<i64> = state.queued.iter().take(inner.max_batch).copied().collect();
            for id in &batch {
                state.queued.remove(id);
                state.in_flight.insert(*id);
            }
            batch
        };

        debug!(target = %target, ids = batch.len(), "backfill batch");
        let outcome = inner.rpc.fetch_batch(&target, &batch);

        // In-flight clears regardless of outcome; a later ensure_cached
        // re-requests whatever is still missing.
        {
            let mut targets = inner.lock_targets();
            if let Some(state) = targets.get_mut(&target) {
                for id in &batch {
                    state.in_flight.remove(id);
                }
            }
        }

        if let Err(e) = outcome {
            warn!(target = %target, error = %e, "backfill batch failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NeverCached;

    impl Resolver for NeverCached {
        fn is_cached(&self, _target: &FetchTarget, _id: i64) -> bool {
            false
        }
    }

    /// Records batches and asserts single-outstanding-request per target.
    struct RecordingRpc {
        batches: Mutex<Vec<(FetchTarget, Vec<i64>)>>,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
        fail: bool,
    }

    impl RecordingRpc {
        fn new(fail: bool) -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl FetchRpc for RecordingRpc {
        fn fetch_batch(&self, target: &FetchTarget, ids: &[i64]) -> Result<(), BackfillError> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            self.batches.lock().unwrap().push((*target, ids.to_vec()));
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                Err(BackfillError::ConnectionLost)
            } else {
                Ok(())
            }
        }
    }

    fn wait_idle(fetcher: &BackfillFetcher) {
        for _ in 0..200 {
            if fetcher.is_idle() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("backfill never went idle");
    }

    fn target(chat: i64) -> FetchTarget {
        FetchTarget::new(UserId::new(1), EntityId::new(chat))
    }

    #[test]
    fn batches_respect_max_batch_size() {
        let rpc = Arc::new(RecordingRpc::new(false));
        let fetcher = BackfillFetcher::new(Arc::new(NeverCached), rpc.clone(), 3);

        let ids: Vec<i64> = (1..=8).collect();
        fetcher.ensure_cached(target(10), &ids);
        wait_idle(&fetcher);

        let batches = rpc.batches.lock().unwrap();
        let sizes: Vec<usize> = batches.iter().map(|(_, ids)| ids.len()).collect();
        assert_eq!(sizes, vec![3, 3, 2]);
        let fetched: BTreeSet<i64> = batches.iter().flat_map(|(_, ids)| ids.clone()).collect();
        assert_eq!(fetched, ids.into_iter().collect());
    }

    #[test]
    fn duplicate_requests_are_deduped() {
        let rpc = Arc::new(RecordingRpc::new(false));
        let fetcher = BackfillFetcher::new(Arc::new(NeverCached), rpc.clone(), 100);

        fetcher.ensure_cached(target(10), &[1, 2, 3]);
        fetcher.ensure_cached(target(10), &[2, 3, 4]);
        wait_idle(&fetcher);

        let batches = rpc.batches.lock().unwrap();
        let mut fetched: Vec<i64> = batches.iter().flat_map(|(_, ids)| ids.clone()).collect();
        fetched.sort_unstable();
        assert_eq!(fetched, vec![1, 2, 3, 4]);
    }

    #[test]
    fn one_target_never_runs_concurrent_batches() {
        let rpc = Arc::new(RecordingRpc::new(false));
        let fetcher = BackfillFetcher::new(Arc::new(NeverCached), rpc.clone(), 2);

        for round in 0..4 {
            let ids: Vec<i64> = (round * 10..round * 10 + 6).collect();
            fetcher.ensure_cached(target(10), &ids);
        }
        wait_idle(&fetcher);

        assert_eq!(rpc.max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_targets_run_concurrently() {
        let rpc = Arc::new(RecordingRpc::new(false));
        let fetcher = BackfillFetcher::new(Arc::new(NeverCached), rpc.clone(), 2);

        fetcher.ensure_cached(target(10), &[1, 2, 3, 4]);
        fetcher.ensure_cached(target(11), &[1, 2, 3, 4]);
        wait_idle(&fetcher);

        // Two independent runners were allowed to overlap.
        assert!(rpc.max_concurrent.load(Ordering::SeqCst) >= 1);
        let batches = rpc.batches.lock().unwrap();
        assert_eq!(batches.len(), 4);
    }

    #[test]
    fn failed_batch_clears_in_flight_without_retry() {
        let rpc = Arc::new(RecordingRpc::new(true));
        let fetcher = BackfillFetcher::new(Arc::new(NeverCached), rpc.clone(), 100);

        fetcher.ensure_cached(target(10), &[1, 2]);
        wait_idle(&fetcher);
        assert_eq!(rpc.batches.lock().unwrap().len(), 1);
        assert_eq!(fetcher.pending(&target(10)), 0);

        // A later call re-requests the still-missing ids.
        fetcher.ensure_cached(target(10), &[1, 2]);
        wait_idle(&fetcher);
        assert_eq!(rpc.batches.lock().unwrap().len(), 2);
    }

    #[test]
    fn cached_ids_are_skipped() {
        struct EvenCached;
        impl Resolver for EvenCached {
            fn is_cached(&self, _target: &FetchTarget, id: i64) -> bool {
                id % 2 == 0
            }
        }

        let rpc = Arc::new(RecordingRpc::new(false));
        let fetcher = BackfillFetcher::new(Arc::new(EvenCached), rpc.clone(), 100);

        fetcher.ensure_cached(target(10), &[1, 2, 3, 4]);
        wait_idle(&fetcher);

        let batches = rpc.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1, vec![1, 3]);
    }
}
