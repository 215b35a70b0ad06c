//! Wire protocol: binary frames over a persistent bidirectional stream.
//!
//! A frame is `[len u32 le][crc32c u32 le][body]`; the body is a canonical
//! CBOR envelope. Method names, call inputs and results, and update payloads
//! are opaque bytes to this layer.

mod codec;
mod frame;

pub use codec::{
    decode_envelope, encode_envelope, Call, Catchup, Connect, Envelope, Ping, Pong, Resync,
    RpcFailure, RpcResult, Updates, Welcome, WireMessage, PROTOCOL_VERSION,
};
pub use frame::{encode_frame, FrameError, FrameReader, FrameWriter, FRAME_HEADER_LEN};
