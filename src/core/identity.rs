//! Identity atoms.
//!
//! Bucket: coarse partition of the update log by owning entity type
//! EntityId/UserId: server-assigned int64 identifiers
//! SessionId: one per authenticated connection, multiple per user
//! MsgId: per-connection call correlation id
//! IdempotencyKey: client-chosen dedup key for resend-safe mutations

use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::CoreError;

/// Coarse partition of the update log keyed by owning entity type.
///
/// Discriminants are wire-stable; never renumber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    User = 1,
    Space = 2,
    Chat = 3,
}

impl Bucket {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(raw: u8) -> Result<Self, CoreError> {
        match raw {
            1 => Ok(Bucket::User),
            2 => Ok(Bucket::Space),
            3 => Ok(Bucket::Chat),
            _ => Err(CoreError::InvalidBucket { raw }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::User => "user",
            Bucket::Space => "space",
            Bucket::Chat => "chat",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Server-assigned entity identifier within a bucket.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct EntityId(i64);

impl EntityId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned user identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One authenticated connection. A user holds one per live device.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn new(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-connection call correlation id. Monotonically increasing, never zero.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(NonZeroU64);

impl MsgId {
    pub fn from_u64(value: u64) -> Option<Self> {
        NonZeroU64::new(value).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Debug for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MsgId({})", self.0)
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-chosen key letting the server recognize and deduplicate a resent
/// mutation. Generated once per transaction, stable across resends.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(Uuid);

impl IdempotencyKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn new(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|e| CoreError::InvalidIdempotencyKey {
                raw: raw.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdempotencyKey({})", self.0)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Partition key of the update log: one ordered stream per `(bucket, entity)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UpdateKey {
    pub bucket: Bucket,
    pub entity_id: EntityId,
}

impl UpdateKey {
    pub fn new(bucket: Bucket, entity_id: EntityId) -> Self {
        Self { bucket, entity_id }
    }
}

impl fmt::Debug for UpdateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UpdateKey({}/{})", self.bucket, self.entity_id)
    }
}

impl fmt::Display for UpdateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_roundtrips_wire_discriminant() {
        for bucket in [Bucket::User, Bucket::Space, Bucket::Chat] {
            assert_eq!(Bucket::from_u8(bucket.as_u8()).unwrap(), bucket);
        }
        assert!(Bucket::from_u8(0).is_err());
        assert!(Bucket::from_u8(4).is_err());
    }

    #[test]
    fn msg_id_rejects_zero() {
        assert!(MsgId::from_u64(0).is_none());
        assert_eq!(MsgId::from_u64(7).unwrap().get(), 7);
    }

    #[test]
    fn idempotency_key_parse_rejects_garbage() {
        assert!(IdempotencyKey::parse("not-a-uuid").is_err());
        let key = IdempotencyKey::generate();
        assert_eq!(
            IdempotencyKey::parse(&key.to_string()).unwrap(),
            key
        );
    }

    #[test]
    fn update_key_orders_by_bucket_then_entity() {
        let a = UpdateKey::new(Bucket::User, EntityId::new(9));
        let b = UpdateKey::new(Bucket::Chat, EntityId::new(1));
        assert!(a < b);
    }
}
