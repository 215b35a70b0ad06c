//! Authoritative per-entity ordered update log.
//!
//! Seq allocation reads-and-increments the partition counter inside a
//! transaction: no two commits for the same entity observe the same seq, and a
//! transaction that never commits allocates nothing. Rows are retained for
//! catch-up until retention raises the partition floor.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use thiserror::Error;

use crate::core::{now_ms, Bucket, CursorMap, EntityId, Seq0, Seq1, Update, UpdateKey};
use crate::error::{Effect, Transience};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("non-contiguous append for {key}: expected {expected}, got {got}")]
    NonContiguous {
        key: UpdateKey,
        expected: Seq1,
        got: Seq1,
    },
    #[error("log storage: {0}")]
    Storage(String),
}

impl LogError {
    pub fn transience(&self) -> Transience {
        match self {
            LogError::NonContiguous { .. } => Transience::Permanent,
            LogError::Storage(_) => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            LogError::NonContiguous { .. } => Effect::None,
            LogError::Storage(_) => Effect::Unknown,
        }
    }
}

/// Answer to a catch-up request for one partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CatchUp {
    /// The gap-free tail after the cursor, ascending seq, possibly empty.
    Rows(Vec<Update>),
    /// Cursor predates retained history; an incremental tail would skip rows.
    ResyncRequired,
}

/// Storage seam for the log. The engine only ever appends contiguously and
/// reads ascending tails; a durable backend implements exactly this surface.
pub trait LogStore: Send + 'static {
    /// Highest committed seq for the partition (zero at genesis).
    fn counter(&self, key: &UpdateKey) -> Seq0;
    /// Cursor below which history is no longer retained.
    fn floor(&self, key: &UpdateKey) -> Seq0;
    /// Durably commit a batch. Rows are grouped by partition, each group
    /// contiguous from the current counter.
    fn commit(&mut self, rows: &[Update]) -> Result<(), LogError>;
    /// Ascending rows with seq greater than the cursor.
    fn read_after(&self, key: &UpdateKey, cursor: Seq0) -> Vec<Update>;
    /// Drop retained rows with seq <= floor and raise the partition floor.
    fn trim_until(&mut self, key: &UpdateKey, floor: Seq0);
}

#[derive(Default)]
pub struct MemoryLogStore {
    rows: BTreeMap<UpdateKey, VecDeque<Update>>,
    counters: BTreeMap<UpdateKey, Seq0>,
    floors: BTreeMap<UpdateKey, Seq0>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryLogStore {
    fn counter(&self, key: &UpdateKey) -> Seq0 {
        self.counters.get(key).copied().unwrap_or(Seq0::ZERO)
    }

    fn floor(&self, key: &UpdateKey) -> Seq0 {
        self.floors.get(key).copied().unwrap_or(Seq0::ZERO)
    }

    fn commit(&mut self, rows: &[Update]) -> Result<(), LogError> {
        // Validate the whole batch before mutating anything, so a failed
        // commit leaves counters untouched.
        let mut next: BTreeMap<UpdateKey, Seq0> = BTreeMap::new();
        for row in rows {
            let key = row.key();
            let cursor = next
                .get(&key)
                .copied()
                .unwrap_or_else(|| self.counter(&key));
            let expected = cursor.next();
            if row.seq != expected {
                return Err(LogError::NonContiguous {
                    key,
                    expected,
                    got: row.seq,
                });
            }
            next.insert(key, Seq0::new(expected.get()));
        }

        for row in rows {
            self.rows.entry(row.key()).or_default().push_back(row.clone());
        }
        for (key, counter) in next {
            self.counters.insert(key, counter);
        }
        Ok(())
    }

    fn read_after(&self, key: &UpdateKey, cursor: Seq0) -> Vec<Update> {
        match self.rows.get(key) {
            Some(rows) => rows
                .iter()
                .filter(|row| row.seq.get() > cursor.get())
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    fn trim_until(&mut self, key: &UpdateKey, floor: Seq0) {
        if let Some(rows) = self.rows.get_mut(key) {
            while rows
                .front()
                .is_some_and(|row| row.seq.get() <= floor.get())
            {
                rows.pop_front();
            }
        }
        let current = self.floor(key);
        if floor > current {
            self.floors.insert(*key, floor);
        }
    }
}

pub struct UpdateLog {
    store: Box<dyn LogStore>,
}

impl UpdateLog {
    pub fn new(store: Box<dyn LogStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryLogStore::new()))
    }

    /// Open a transaction. Appends stage rows and allocate seqs; nothing is
    /// visible (and no seq is consumed) until `commit`.
    pub fn begin(&mut self) -> LogTxn<'_> {
        LogTxn {
            log: self,
            staged: Vec::new(),
            allocated: BTreeMap::new(),
        }
    }

    pub fn counter(&self, key: &UpdateKey) -> Seq0 {
        self.store.counter(key)
    }

    /// Catch-up for one partition.
    pub fn catch_up(&self, key: &UpdateKey, cursor: Seq0) -> CatchUp {
        if cursor < self.store.floor(key) {
            return CatchUp::ResyncRequired;
        }
        CatchUp::Rows(self.store.read_after(key, cursor))
    }

    /// Catch-up for a full cursor set: ordered rows per partition plus the
    /// partitions that need a resync instead.
    pub fn catch_up_all(&self, cursors: &CursorMap) -> (Vec<Update>, Vec<UpdateKey>) {
        let mut rows = Vec::new();
        let mut resync = Vec::new();
        for (key, cursor) in cursors {
            match self.catch_up(key, *cursor) {
                CatchUp::Rows(tail) => rows.extend(tail),
                CatchUp::ResyncRequired => resync.push(*key),
            }
        }
        (rows, resync)
    }

    /// Retention: drop rows at or below `floor` for the partition.
    pub fn trim(&mut self, key: &UpdateKey, floor: Seq0) {
        self.store.trim_until(key, floor);
    }
}

/// In-flight log transaction. Dropping it without `commit` aborts: staged
/// rows vanish and the seqs they would have taken are reused by the next
/// transaction.
pub struct LogTxn<'a> {
    log: &'a mut UpdateLog,
    staged: Vec<Update>,
    allocated: BTreeMap<UpdateKey, Seq0>,
}

impl LogTxn<'_> {
    /// Stage one row, allocating the partition's next seq.
    pub fn append(&mut self, bucket: Bucket, entity_id: EntityId, payload: Bytes) -> &Update {
        let key = UpdateKey::new(bucket, entity_id);
        let cursor = match self.allocated.get(&key) {
            Some(cursor) => *cursor,
            None => self.log.store.counter(&key),
        };
        let seq = cursor.next();
        self.allocated.insert(key, Seq0::new(seq.get()));

        self.staged.push(Update {
            bucket,
            entity_id,
            seq,
            date_ms: now_ms(),
            payload,
        });
        self.staged.last().expect("staged row just pushed")
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Commit the staged batch, returning the committed rows for fan-out.
    pub fn commit(self) -> Result<Vec<Update>, LogError> {
        self.log.store.commit(&self.staged)?;
        Ok(self.staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(entity: i64) -> UpdateKey {
        UpdateKey::new(Bucket::Chat, EntityId::new(entity))
    }

    fn payload(tag: u8) -> Bytes {
        Bytes::copy_from_slice(&[tag])
    }

    #[test]
    fn append_allocates_contiguous_seqs() {
        let mut log = UpdateLog::in_memory();
        let mut txn = log.begin();
        let first = txn.append(Bucket::Chat, EntityId::new(10), payload(1)).seq;
        let second = txn.append(Bucket::Chat, EntityId::new(10), payload(2)).seq;
        assert_eq!(first.get(), 1);
        assert_eq!(second.get(), 2);
        txn.commit().unwrap();
        assert_eq!(log.counter(&chat(10)).get(), 2);
    }

    #[test]
    fn aborted_txn_allocates_nothing() {
        let mut log = UpdateLog::in_memory();
        {
            let mut txn = log.begin();
            txn.append(Bucket::Chat, EntityId::new(10), payload(1));
            // dropped without commit
        }
        assert_eq!(log.counter(&chat(10)).get(), 0);

        let mut txn = log.begin();
        let seq = txn.append(Bucket::Chat, EntityId::new(10), payload(2)).seq;
        assert_eq!(seq.get(), 1);
        txn.commit().unwrap();
    }

    #[test]
    fn independent_entities_interleave() {
        let mut log = UpdateLog::in_memory();
        let mut txn = log.begin();
        txn.append(Bucket::Chat, EntityId::new(10), payload(1));
        txn.append(Bucket::Chat, EntityId::new(11), payload(2));
        txn.append(Bucket::Chat, EntityId::new(10), payload(3));
        let rows = txn.commit().unwrap();
        assert_eq!(rows[0].seq.get(), 1);
        assert_eq!(rows[1].seq.get(), 1);
        assert_eq!(rows[2].seq.get(), 2);
    }

    #[test]
    fn catch_up_returns_ascending_tail() {
        let mut log = UpdateLog::in_memory();
        let mut txn = log.begin();
        for tag in 1..=5 {
            txn.append(Bucket::Chat, EntityId::new(10), payload(tag));
        }
        txn.commit().unwrap();

        match log.catch_up(&chat(10), Seq0::new(3)) {
            CatchUp::Rows(rows) => {
                let seqs: Vec<u32> = rows.iter().map(|r| r.seq.get()).collect();
                assert_eq!(seqs, vec![4, 5]);
            }
            CatchUp::ResyncRequired => panic!("cursor is within retained history"),
        }
    }

    #[test]
    fn cursor_below_floor_requires_resync() {
        let mut log = UpdateLog::in_memory();
        let mut txn = log.begin();
        for tag in 1..=5 {
            txn.append(Bucket::Chat, EntityId::new(10), payload(tag));
        }
        txn.commit().unwrap();
        log.trim(&chat(10), Seq0::new(3));

        assert_eq!(log.catch_up(&chat(10), Seq0::new(2)), CatchUp::ResyncRequired);
        match log.catch_up(&chat(10), Seq0::new(3)) {
            CatchUp::Rows(rows) => assert_eq!(rows.len(), 2),
            CatchUp::ResyncRequired => panic!("cursor equals floor"),
        }
    }

    #[test]
    fn commit_rejects_gap() {
        let mut store = MemoryLogStore::new();
        let row = Update {
            bucket: Bucket::Chat,
            entity_id: EntityId::new(10),
            seq: Seq1::from_u32(2).unwrap(),
            date_ms: 0,
            payload: payload(1),
        };
        assert!(matches!(
            store.commit(std::slice::from_ref(&row)),
            Err(LogError::NonContiguous { .. })
        ));
        // Failed commit left the counter untouched.
        assert_eq!(store.counter(&chat(10)), Seq0::ZERO);
    }
}
