//! Committed update records.

use bytes::Bytes;

use super::identity::{Bucket, EntityId, UpdateKey};
use super::seq::Seq1;

/// One committed row of the server-authoritative log.
///
/// `(bucket, entity_id, seq)` is unique; seq is strictly increasing per entity
/// with no committed gaps. Never mutated once committed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub bucket: Bucket,
    pub entity_id: EntityId,
    pub seq: Seq1,
    pub date_ms: u64,
    pub payload: Bytes,
}

impl Update {
    pub fn key(&self) -> UpdateKey {
        UpdateKey::new(self.bucket, self.entity_id)
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}
