//! Domain atoms shared by the server log and the client replica.
//!
//! Layering (leaves first): identity -> seq -> update -> object.
//! Nothing in here touches the network or a clock directly; `time` holds the
//! swappable wall-clock source used by both sides.

pub mod cbor;
pub mod error;
pub mod identity;
pub mod limits;
pub mod object;
pub mod seq;
pub mod time;
pub mod update;

pub use cbor::{DecodeError, EncodeError};
pub use error::{CoreError, RpcError, RpcErrorCode};
pub use identity::{Bucket, EntityId, IdempotencyKey, MsgId, SessionId, UpdateKey, UserId};
pub use limits::Limits;
pub use object::{
    decode_update_body, encode_update_body, FieldValue, Fields, Kind, Object, ObjectRef, Patch,
    ReplicaOp, UpdateBody,
};
pub use seq::{CursorMap, Seq0, Seq1, SeqError};
pub use time::{now_ms, set_wall_clock_source_for_tests, WallClockGuard, WallClockSource};
pub use update::Update;
