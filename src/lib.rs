#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod proto;
pub mod server;
pub mod telemetry;
pub mod test_harness;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    Bucket, CursorMap, EntityId, FieldValue, IdempotencyKey, Kind, Limits, MsgId, Object,
    ObjectRef, Patch, ReplicaOp, RpcError, Seq0, Seq1, SessionId, Update, UpdateBody, UpdateKey,
    UserId,
};
