//! Local replicated object store.
//!
//! Owns every replica object exclusively; other components read and write
//! only through this API. Merge semantics (absolute field values, absent
//! fields preserved) make re-applying any update a no-op, so overlapping
//! delivery via push and backfill cannot double-apply.
//!
//! Notification discipline: listeners fire after the mutation, outside the
//! store lock. A `batch` scope (reentrant) defers all notifications until the
//! outermost scope closes, firing each affected listener exactly once.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tracing::trace;

use crate::core::{
    decode_update_body, DecodeError, Kind, Limits, Object, ObjectRef, Patch, ReplicaOp, Update,
};
use crate::error::{Effect, Transience};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("update payload undecodable: {0}")]
    Payload(#[from] DecodeError),
    /// Defensive only; merge semantics should make this unreachable.
    #[error("store conflict at {reference}: {reason}")]
    Conflict {
        reference: ObjectRef,
        reason: String,
    },
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        match self {
            // A bad payload aborts the whole batch before any op applies.
            StoreError::Payload(_) => Effect::None,
            StoreError::Conflict { .. } => Effect::Unknown,
        }
    }
}

type ObjectListener = Arc<dyn Fn(&ObjectRef) + Send + Sync>;
type QueryListener = Arc<dyn Fn(Kind) + Send + Sync>;

struct StoreInner {
    objects: BTreeMap<ObjectRef, Object>,
    object_subs: BTreeMap<ObjectRef, Vec<(u64, ObjectListener)>>,
    query_subs: BTreeMap<Kind, Vec<(u64, QueryListener)>>,
    /// Bumped on any change to an object of that kind; memoized queries
    /// compare generations instead of re-running predicates.
    generations: BTreeMap<Kind, u64>,
    batch_depth: u32,
    pending_refs: BTreeSet<ObjectRef>,
    pending_kinds: BTreeSet<Kind>,
    next_sub_id: u64,
}

#[derive(Clone)]
pub struct ReplicaStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl Default for ReplicaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                objects: BTreeMap::new(),
                object_subs: BTreeMap::new(),
                query_subs: BTreeMap::new(),
                generations: BTreeMap::new(),
                batch_depth: 0,
                pending_refs: BTreeSet::new(),
                pending_kinds: BTreeSet::new(),
                next_sub_id: 1,
            })),
        }
    }

    pub fn get(&self, reference: &ObjectRef) -> Option<Object> {
        self.lock().objects.get(reference).cloned()
    }

    pub fn contains(&self, reference: &ObjectRef) -> bool {
        self.lock().objects.contains_key(reference)
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().objects.is_empty()
    }

    /// Wholesale replace.
    pub fn insert(&self, object: Object) {
        let mut inner = self.lock();
        let reference = object.reference;
        inner.objects.insert(reference, object);
        touch(&mut inner, reference);
        self.flush_if_idle(inner);
    }

    /// Field-wise merge; behaves as insert when the object is absent.
    pub fn update(&self, patch: Patch) {
        let mut inner = self.lock();
        let reference = patch.reference;
        match inner.objects.get_mut(&reference) {
            Some(existing) => existing.merge(&patch),
            None => {
                inner.objects.insert(reference, patch.into_object());
            }
        }
        touch(&mut inner, reference);
        self.flush_if_idle(inner);
    }

    /// Remove the entry. Removing an absent entry notifies nobody.
    pub fn delete(&self, reference: &ObjectRef) {
        let mut inner = self.lock();
        if inner.objects.remove(reference).is_some() {
            touch(&mut inner, *reference);
        }
        self.flush_if_idle(inner);
    }

    /// Materialized query over one kind.
    pub fn query<F>(&self, kind: Kind, predicate: F) -> Vec<Object>
    where
        F: Fn(&Object) -> bool,
    {
        let inner = self.lock();
        inner
            .objects
            .range(kind_range(kind))
            .map(|(_, object)| object)
            .filter(|object| predicate(object))
            .cloned()
            .collect()
    }

    /// Memoized query handle; the result set is recomputed only after an
    /// object of the kind changed.
    pub fn cached_query<F>(&self, kind: Kind, predicate: F) -> CachedQuery
    where
        F: Fn(&Object) -> bool + Send + Sync + 'static,
    {
        CachedQuery {
            store: self.clone(),
            kind,
            predicate: Arc::new(predicate),
            cache: Mutex::new(None),
        }
    }

    fn generation(&self, kind: Kind) -> u64 {
        self.lock().generations.get(&kind).copied().unwrap_or(0)
    }

    /// Per-object listener: fires after any insert/update/delete of the key.
    pub fn subscribe_object<F>(&self, reference: ObjectRef, listener: F) -> SubscriptionGuard
    where
        F: Fn(&ObjectRef) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = inner.next_sub_id;
        inner.next_sub_id += 1;
        inner
            .object_subs
            .entry(reference)
            .or_default()
            .push((id, Arc::new(listener)));
        SubscriptionGuard {
            store: Arc::downgrade(&self.inner),
            id,
            target: SubTarget::Object(reference),
        }
    }

    /// Per-query listener: fires after any change that could affect a
    /// predicate over the kind (conservatively, any change to that kind).
    pub fn subscribe_query<F>(&self, kind: Kind, listener: F) -> SubscriptionGuard
    where
        F: Fn(Kind) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = inner.next_sub_id;
        inner.next_sub_id += 1;
        inner
            .query_subs
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        SubscriptionGuard {
            store: Arc::downgrade(&self.inner),
            id,
            target: SubTarget::Query(kind),
        }
    }

    /// Run `f` with notifications deferred; nested scopes are flattened and
    /// every affected listener fires exactly once when the outermost scope
    /// closes.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        {
            let mut inner = self.lock();
            inner.batch_depth += 1;
        }
        let result = f();
        let mut inner = self.lock();
        inner.batch_depth -= 1;
        if inner.batch_depth == 0 {
            let notifications = take_notifications(&mut inner);
            drop(inner);
            fire(notifications);
        }
        result
    }

    /// Apply one decoded replica op.
    pub fn apply_op(&self, op: &ReplicaOp) {
        match op {
            ReplicaOp::Insert(object) => self.insert(object.clone()),
            ReplicaOp::Merge(patch) => self.update(patch.clone()),
            ReplicaOp::Delete(reference) => self.delete(reference),
        }
    }

    /// Decode and apply a batch of committed updates under one batch scope.
    ///
    /// Payloads are decoded before anything applies, so an undecodable row
    /// rejects the whole batch without partial application.
    pub fn apply_updates(&self, updates: &[Update], limits: &Limits) -> Result<(), StoreError> {
        let mut bodies = Vec::with_capacity(updates.len());
        for update in updates {
            bodies.push(decode_update_body(&update.payload, limits)?);
        }
        trace!(rows = updates.len(), "applying update batch");
        self.batch(|| {
            for body in &bodies {
                for op in &body.ops {
                    self.apply_op(op);
                }
            }
        });
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("store lock poisoned")
    }

    fn flush_if_idle(&self, mut inner: std::sync::MutexGuard<'_, StoreInner>) {
        if inner.batch_depth == 0 {
            let notifications = take_notifications(&mut inner);
            drop(inner);
            fire(notifications);
        }
    }
}

/// Listener calls collected under the lock, invoked after it is released.
struct Notifications {
    object: Vec<(ObjectRef, ObjectListener)>,
    query: Vec<(Kind, QueryListener)>,
}

fn touch(inner: &mut StoreInner, reference: ObjectRef) {
    inner.pending_refs.insert(reference);
    inner.pending_kinds.insert(reference.kind);
    *inner.generations.entry(reference.kind).or_insert(0) += 1;
}

fn take_notifications(inner: &mut StoreInner) -> Notifications {
    let refs = std::mem::take(&mut inner.pending_refs);
    let kinds = std::mem::take(&mut inner.pending_kinds);

    let mut object = Vec::new();
    for reference in refs {
        if let Some(subs) = inner.object_subs.get(&reference) {
            for (_, listener) in subs {
                object.push((reference, Arc::clone(listener)));
            }
        }
    }
    let mut query = Vec::new();
    for kind in kinds {
        if let Some(subs) = inner.query_subs.get(&kind) {
            for (_, listener) in subs {
                query.push((kind, Arc::clone(listener)));
            }
        }
    }
    Notifications { object, query }
}

fn fire(notifications: Notifications) {
    for (reference, listener) in notifications.object {
        listener(&reference);
    }
    for (kind, listener) in notifications.query {
        listener(kind);
    }
}

fn kind_range(kind: Kind) -> std::ops::RangeInclusive<ObjectRef> {
    ObjectRef::new(kind, i64::MIN)..=ObjectRef::new(kind, i64::MAX)
}

enum SubTarget {
    Object(ObjectRef),
    Query(Kind),
}

/// Disposer: dropping it removes the listener.
pub struct SubscriptionGuard {
    store: Weak<Mutex<StoreInner>>,
    id: u64,
    target: SubTarget,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let Ok(mut inner) = store.lock() else {
            return;
        };
        match self.target {
            SubTarget::Object(reference) => {
                if let Some(subs) = inner.object_subs.get_mut(&reference) {
                    subs.retain(|(id, _)| *id != self.id);
                    if subs.is_empty() {
                        inner.object_subs.remove(&reference);
                    }
                }
            }
            SubTarget::Query(kind) => {
                if let Some(subs) = inner.query_subs.get_mut(&kind) {
                    subs.retain(|(id, _)| *id != self.id);
                    if subs.is_empty() {
                        inner.query_subs.remove(&kind);
                    }
                }
            }
        }
    }
}

/// Materialized result set, recomputed only when the kind's generation moves.
pub struct CachedQuery {
    store: ReplicaStore,
    kind: Kind,
    predicate: Arc<dyn Fn(&Object) -> bool + Send + Sync>,
    cache: Mutex<Option<(u64, Arc<Vec<Object>>)>>,
}

impl CachedQuery {
    pub fn results(&self) -> Arc<Vec<Object>> {
        let generation = self.store.generation(self.kind);
        let mut cache = self.cache.lock().expect("query cache lock poisoned");
        if let Some((cached_generation, results)) = cache.as_ref() {
            if *cached_generation == generation {
                return Arc::clone(results);
            }
        }
        let results = Arc::new(self.store.query(self.kind, |object| (self.predicate)(object)));
        *cache = Some((generation, Arc::clone(&results)));
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{encode_update_body, Bucket, EntityId, FieldValue, Seq0, UpdateBody};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(id: i64, text: &str) -> Object {
        Object::new(ObjectRef::new(Kind::Message, id))
            .with_field("chat_id", FieldValue::Int(10))
            .with_field("text", FieldValue::Text(text.to_string()))
    }

    fn counter_listener() -> (Arc<AtomicUsize>, impl Fn(&ObjectRef) + Send + Sync) {
        let count = Arc::new(AtomicUsize::new(0));
        let captured = Arc::clone(&count);
        (count, move |_: &ObjectRef| {
            captured.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn insert_replaces_wholesale() {
        let store = ReplicaStore::new();
        store.insert(message(1, "a"));
        store.insert(Object::new(ObjectRef::new(Kind::Message, 1)));
        let object = store.get(&ObjectRef::new(Kind::Message, 1)).unwrap();
        assert!(object.fields.is_empty());
    }

    #[test]
    fn update_merges_and_inserts_when_absent() {
        let store = ReplicaStore::new();
        store.update(
            Patch::new(ObjectRef::new(Kind::Message, 1)).with_field("text", FieldValue::Text("a".into())),
        );
        store.update(
            Patch::new(ObjectRef::new(Kind::Message, 1))
                .with_field("edited", FieldValue::Bool(true)),
        );
        let object = store.get(&ObjectRef::new(Kind::Message, 1)).unwrap();
        assert_eq!(object.field("text"), Some(&FieldValue::Text("a".into())));
        assert_eq!(object.field("edited"), Some(&FieldValue::Bool(true)));
    }

    #[test]
    fn object_listener_fires_once_per_mutation() {
        let store = ReplicaStore::new();
        let reference = ObjectRef::new(Kind::Message, 1);
        let (count, listener) = counter_listener();
        let _guard = store.subscribe_object(reference, listener);

        store.insert(message(1, "a"));
        store.delete(&reference);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropped_subscription_stops_firing() {
        let store = ReplicaStore::new();
        let reference = ObjectRef::new(Kind::Message, 1);
        let (count, listener) = counter_listener();
        let guard = store.subscribe_object(reference, listener);
        store.insert(message(1, "a"));
        drop(guard);
        store.insert(message(1, "b"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_batches_notify_exactly_once() {
        let store = ReplicaStore::new();
        let reference = ObjectRef::new(Kind::Message, 1);
        let (count, listener) = counter_listener();
        let _guard = store.subscribe_object(reference, listener);

        store.batch(|| {
            store.insert(message(1, "a"));
            store.batch(|| {
                store.update(
                    Patch::new(reference).with_field("edited", FieldValue::Bool(true)),
                );
            });
            store.insert(message(1, "c"));
            // nothing fired yet
            assert_eq!(count.load(Ordering::SeqCst), 0);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn query_listener_fires_for_kind_changes_only() {
        let store = ReplicaStore::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let captured = Arc::clone(&fired);
        let _guard = store.subscribe_query(Kind::Message, move |_| {
            captured.fetch_add(1, Ordering::SeqCst);
        });

        store.insert(message(1, "a"));
        store.insert(Object::new(ObjectRef::new(Kind::Chat, 10)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn query_filters_by_kind_and_predicate() {
        let store = ReplicaStore::new();
        store.insert(message(1, "keep"));
        store.insert(message(2, "drop"));
        store.insert(Object::new(ObjectRef::new(Kind::Chat, 10)));

        let kept = store.query(Kind::Message, |object| {
            object.field("text").and_then(|v| v.as_text()) == Some("keep")
        });
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].reference.id, 1);
    }

    #[test]
    fn cached_query_recomputes_only_on_kind_change() {
        let store = ReplicaStore::new();
        store.insert(message(1, "a"));
        let query = store.cached_query(Kind::Message, |_| true);

        let first = query.results();
        let second = query.results();
        assert!(Arc::ptr_eq(&first, &second));

        store.insert(Object::new(ObjectRef::new(Kind::Chat, 10)));
        let third = query.results();
        assert!(Arc::ptr_eq(&first, &third));

        store.insert(message(2, "b"));
        let fourth = query.results();
        assert_eq!(fourth.len(), 2);
    }

    #[test]
    fn duplicate_update_application_is_idempotent() {
        let store = ReplicaStore::new();
        let body = UpdateBody::new(vec![
            ReplicaOp::Insert(message(7, "hi")),
            ReplicaOp::Merge(
                Patch::new(ObjectRef::new(Kind::Chat, 10))
                    .with_field("last_msg_id", FieldValue::Int(7)),
            ),
        ]);
        let update = Update {
            bucket: Bucket::Chat,
            entity_id: EntityId::new(10),
            seq: Seq0::ZERO.next(),
            date_ms: 0,
            payload: encode_update_body(&body).unwrap(),
        };
        let limits = Limits::default();

        store.apply_updates(std::slice::from_ref(&update), &limits).unwrap();
        let snapshot: Vec<Object> = store.query(Kind::Message, |_| true);

        store.apply_updates(std::slice::from_ref(&update), &limits).unwrap();
        assert_eq!(store.query(Kind::Message, |_| true), snapshot);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn batched_and_single_application_converge() {
        let rows: Vec<Update> = (1..=3u32)
            .map(|seq| {
                let body = UpdateBody::single(ReplicaOp::Merge(
                    Patch::new(ObjectRef::new(Kind::Chat, 10))
                        .with_field("last_msg_id", FieldValue::Int(seq as i64)),
                ));
                Update {
                    bucket: Bucket::Chat,
                    entity_id: EntityId::new(10),
                    seq: Seq0::new(seq - 1).next(),
                    date_ms: 0,
                    payload: encode_update_body(&body).unwrap(),
                }
            })
            .collect();
        let limits = Limits::default();

        let one_at_a_time = ReplicaStore::new();
        for row in &rows {
            one_at_a_time
                .apply_updates(std::slice::from_ref(row), &limits)
                .unwrap();
        }

        let as_batch = ReplicaStore::new();
        as_batch.apply_updates(&rows, &limits).unwrap();

        assert_eq!(
            one_at_a_time.get(&ObjectRef::new(Kind::Chat, 10)),
            as_batch.get(&ObjectRef::new(Kind::Chat, 10)),
        );
    }
}
