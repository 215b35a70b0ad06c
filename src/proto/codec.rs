//! Protocol message schemas and CBOR encoding.

use std::collections::BTreeSet;

use bytes::Bytes;
use minicbor::{Decoder, Encoder};
use uuid::Uuid;

use crate::core::cbor::{
    decode_array_len, decode_byte_string, decode_i64, decode_map_len, decode_text, decode_u32,
    decode_u64, decode_u8, ensure_fully_consumed, ensure_unique_key, skip_value, DecodeError,
    EncodeError,
};
use crate::core::{
    Bucket, CursorMap, EntityId, Limits, MsgId, RpcError, RpcErrorCode, Seq0, Seq1, SessionId,
    Update, UpdateKey,
};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub version: u32,
    pub message: WireMessage,
}

impl Envelope {
    pub fn new(message: WireMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WireMessage {
    Connect(Connect),
    Welcome(Welcome),
    Call(Call),
    Ack(MsgId),
    Result(RpcResult),
    Error(RpcFailure),
    Updates(Updates),
    Catchup(Catchup),
    Resync(Resync),
    Ping(Ping),
    Pong(Pong),
}

/// Handshake. The token is opaque to the engine; the server's auth hook maps
/// it to a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connect {
    pub token: String,
    pub build: u32,
    pub layer: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Welcome {
    pub session_id: SessionId,
    pub server_time_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub msg_id: MsgId,
    pub method: String,
    pub input: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcResult {
    pub msg_id: MsgId,
    pub result: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcFailure {
    pub msg_id: MsgId,
    pub error: RpcError,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Updates {
    pub updates: Vec<Update>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Catchup {
    pub cursors: CursorMap,
}

/// Cursor predates retained history for these partitions; the client must
/// drop its cursors and refetch entity state instead of expecting a gap-free
/// tail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resync {
    pub keys: Vec<UpdateKey>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ping {
    pub nonce: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pong {
    pub nonce: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageType {
    Connect,
    Welcome,
    Call,
    Ack,
    Result,
    Error,
    Updates,
    Catchup,
    Resync,
    Ping,
    Pong,
}

impl MessageType {
    fn as_str(self) -> &'static str {
        match self {
            MessageType::Connect => "CONNECT",
            MessageType::Welcome => "WELCOME",
            MessageType::Call => "CALL",
            MessageType::Ack => "ACK",
            MessageType::Result => "RESULT",
            MessageType::Error => "RPC_ERROR",
            MessageType::Updates => "UPDATES",
            MessageType::Catchup => "CATCHUP",
            MessageType::Resync => "RESYNC",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "CONNECT" => Some(MessageType::Connect),
            "WELCOME" => Some(MessageType::Welcome),
            "CALL" => Some(MessageType::Call),
            "ACK" => Some(MessageType::Ack),
            "RESULT" => Some(MessageType::Result),
            "RPC_ERROR" => Some(MessageType::Error),
            "UPDATES" => Some(MessageType::Updates),
            "CATCHUP" => Some(MessageType::Catchup),
            "RESYNC" => Some(MessageType::Resync),
            "PING" => Some(MessageType::Ping),
            "PONG" => Some(MessageType::Pong),
            _ => None,
        }
    }
}

impl WireMessage {
    fn message_type(&self) -> MessageType {
        match self {
            WireMessage::Connect(_) => MessageType::Connect,
            WireMessage::Welcome(_) => MessageType::Welcome,
            WireMessage::Call(_) => MessageType::Call,
            WireMessage::Ack(_) => MessageType::Ack,
            WireMessage::Result(_) => MessageType::Result,
            WireMessage::Error(_) => MessageType::Error,
            WireMessage::Updates(_) => MessageType::Updates,
            WireMessage::Catchup(_) => MessageType::Catchup,
            WireMessage::Resync(_) => MessageType::Resync,
            WireMessage::Ping(_) => MessageType::Ping,
            WireMessage::Pong(_) => MessageType::Pong,
        }
    }
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);

    enc.map(3)?;
    enc.str("body")?;
    encode_body(&mut enc, &envelope.message)?;
    enc.str("type")?;
    enc.str(envelope.message.message_type().as_str())?;
    enc.str("v")?;
    enc.u32(envelope.version)?;

    Ok(buf)
}

fn encode_body(enc: &mut Encoder<&mut Vec<u8>>, message: &WireMessage) -> Result<(), EncodeError> {
    match message {
        WireMessage::Connect(connect) => {
            enc.map(3)?;
            enc.str("build")?;
            enc.u32(connect.build)?;
            enc.str("layer")?;
            enc.u32(connect.layer)?;
            enc.str("token")?;
            enc.str(&connect.token)?;
        }
        WireMessage::Welcome(welcome) => {
            enc.map(2)?;
            enc.str("server_time_ms")?;
            enc.u64(welcome.server_time_ms)?;
            enc.str("session")?;
            enc.str(&welcome.session_id.to_string())?;
        }
        WireMessage::Call(call) => {
            enc.map(3)?;
            enc.str("input")?;
            enc.bytes(&call.input)?;
            enc.str("method")?;
            enc.str(&call.method)?;
            enc.str("msg_id")?;
            enc.u64(call.msg_id.get())?;
        }
        WireMessage::Ack(msg_id) => {
            enc.map(1)?;
            enc.str("msg_id")?;
            enc.u64(msg_id.get())?;
        }
        WireMessage::Result(result) => {
            enc.map(2)?;
            enc.str("msg_id")?;
            enc.u64(result.msg_id.get())?;
            enc.str("result")?;
            enc.bytes(&result.result)?;
        }
        WireMessage::Error(failure) => {
            enc.map(3)?;
            enc.str("code")?;
            enc.str(failure.error.code.as_str())?;
            enc.str("message")?;
            enc.str(&failure.error.message)?;
            enc.str("msg_id")?;
            enc.u64(failure.msg_id.get())?;
        }
        WireMessage::Updates(updates) => {
            enc.map(1)?;
            enc.str("updates")?;
            enc.array(updates.updates.len() as u64)?;
            for update in &updates.updates {
                encode_update(enc, update)?;
            }
        }
        WireMessage::Catchup(catchup) => {
            enc.map(1)?;
            enc.str("cursors")?;
            enc.array(catchup.cursors.len() as u64)?;
            for (key, seq) in &catchup.cursors {
                enc.map(3)?;
                enc.str("bucket")?;
                enc.u8(key.bucket.as_u8())?;
                enc.str("entity")?;
                enc.i64(key.entity_id.get())?;
                enc.str("seq")?;
                enc.u32(seq.get())?;
            }
        }
        WireMessage::Resync(resync) => {
            enc.map(1)?;
            enc.str("keys")?;
            enc.array(resync.keys.len() as u64)?;
            for key in &resync.keys {
                enc.map(2)?;
                enc.str("bucket")?;
                enc.u8(key.bucket.as_u8())?;
                enc.str("entity")?;
                enc.i64(key.entity_id.get())?;
            }
        }
        WireMessage::Ping(ping) => {
            enc.map(1)?;
            enc.str("nonce")?;
            enc.u64(ping.nonce)?;
        }
        WireMessage::Pong(pong) => {
            enc.map(1)?;
            enc.str("nonce")?;
            enc.u64(pong.nonce)?;
        }
    }
    Ok(())
}

fn encode_update(enc: &mut Encoder<&mut Vec<u8>>, update: &Update) -> Result<(), EncodeError> {
    enc.map(5)?;
    enc.str("bucket")?;
    enc.u8(update.bucket.as_u8())?;
    enc.str("date")?;
    enc.u64(update.date_ms)?;
    enc.str("entity")?;
    enc.i64(update.entity_id.get())?;
    enc.str("payload")?;
    enc.bytes(&update.payload)?;
    enc.str("seq")?;
    enc.u32(update.seq.get())?;
    Ok(())
}

pub fn decode_envelope(bytes: &[u8], limits: &Limits) -> Result<Envelope, DecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits, 0)?;

    let mut seen_keys = BTreeSet::new();
    let mut version = None;
    let mut message_type = None;
    let mut body_position = None;

    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        ensure_unique_key(&mut seen_keys, key)?;
        match key {
            "body" => {
                // Body decoding needs the type tag, which sorts after "body";
                // remember the position and skip past for now.
                body_position = Some(dec.position());
                skip_value(&mut dec, limits, 1)?;
            }
            "type" => {
                let raw = decode_text(&mut dec, limits)?;
                message_type = Some(
                    MessageType::parse(raw)
                        .ok_or_else(|| DecodeError::UnknownMessageType(raw.to_string()))?,
                );
            }
            "v" => {
                version = Some(decode_u32(&mut dec, "v")?);
            }
            other => {
                return Err(DecodeError::InvalidField {
                    field: "envelope",
                    reason: format!("unknown key {other}"),
                });
            }
        }
    }
    ensure_fully_consumed(&mut dec)?;

    let version = version.ok_or(DecodeError::MissingField("v"))?;
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let message_type = message_type.ok_or(DecodeError::MissingField("type"))?;
    let body_position = body_position.ok_or(DecodeError::MissingField("body"))?;

    let mut body_dec = Decoder::new(bytes);
    body_dec.set_position(body_position);
    let message = decode_body(&mut body_dec, message_type, limits)?;

    Ok(Envelope { version, message })
}

fn decode_body(
    dec: &mut Decoder,
    message_type: MessageType,
    limits: &Limits,
) -> Result<WireMessage, DecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut seen_keys = BTreeSet::new();

    let mut token = None;
    let mut build = None;
    let mut layer = None;
    let mut session = None;
    let mut server_time_ms = None;
    let mut msg_id = None;
    let mut method = None;
    let mut input = None;
    let mut result = None;
    let mut code = None;
    let mut message = None;
    let mut updates = None;
    let mut cursors = None;
    let mut keys = None;
    let mut nonce = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        ensure_unique_key(&mut seen_keys, key)?;
        match key {
            "token" => token = Some(decode_text(dec, limits)?.to_string()),
            "build" => build = Some(decode_u32(dec, "build")?),
            "layer" => layer = Some(decode_u32(dec, "layer")?),
            "session" => {
                let raw = decode_text(dec, limits)?;
                let uuid = Uuid::parse_str(raw).map_err(|e| DecodeError::InvalidField {
                    field: "session",
                    reason: e.to_string(),
                })?;
                session = Some(SessionId::new(uuid));
            }
            "server_time_ms" => server_time_ms = Some(decode_u64(dec, "server_time_ms")?),
            "msg_id" => {
                let raw = decode_u64(dec, "msg_id")?;
                msg_id = Some(MsgId::from_u64(raw).ok_or_else(|| DecodeError::InvalidField {
                    field: "msg_id",
                    reason: "must be nonzero".into(),
                })?);
            }
            "method" => method = Some(decode_text(dec, limits)?.to_string()),
            "input" => input = Some(Bytes::copy_from_slice(decode_byte_string(dec, limits)?)),
            "result" => result = Some(Bytes::copy_from_slice(decode_byte_string(dec, limits)?)),
            "code" => code = Some(RpcErrorCode::parse(decode_text(dec, limits)?)),
            "message" => message = Some(decode_text(dec, limits)?.to_string()),
            "updates" => updates = Some(decode_updates(dec, limits)?),
            "cursors" => cursors = Some(decode_cursors(dec, limits)?),
            "keys" => keys = Some(decode_keys(dec, limits)?),
            "nonce" => nonce = Some(decode_u64(dec, "nonce")?),
            other => {
                return Err(DecodeError::InvalidField {
                    field: "body",
                    reason: format!("unknown key {other}"),
                });
            }
        }
    }

    match message_type {
        MessageType::Connect => Ok(WireMessage::Connect(Connect {
            token: token.ok_or(DecodeError::MissingField("token"))?,
            build: build.ok_or(DecodeError::MissingField("build"))?,
            layer: layer.ok_or(DecodeError::MissingField("layer"))?,
        })),
        MessageType::Welcome => Ok(WireMessage::Welcome(Welcome {
            session_id: session.ok_or(DecodeError::MissingField("session"))?,
            server_time_ms: server_time_ms.ok_or(DecodeError::MissingField("server_time_ms"))?,
        })),
        MessageType::Call => Ok(WireMessage::Call(Call {
            msg_id: msg_id.ok_or(DecodeError::MissingField("msg_id"))?,
            method: method.ok_or(DecodeError::MissingField("method"))?,
            input: input.ok_or(DecodeError::MissingField("input"))?,
        })),
        MessageType::Ack => Ok(WireMessage::Ack(
            msg_id.ok_or(DecodeError::MissingField("msg_id"))?,
        )),
        MessageType::Result => Ok(WireMessage::Result(RpcResult {
            msg_id: msg_id.ok_or(DecodeError::MissingField("msg_id"))?,
            result: result.ok_or(DecodeError::MissingField("result"))?,
        })),
        MessageType::Error => Ok(WireMessage::Error(RpcFailure {
            msg_id: msg_id.ok_or(DecodeError::MissingField("msg_id"))?,
            error: RpcError {
                code: code.ok_or(DecodeError::MissingField("code"))?,
                message: message.ok_or(DecodeError::MissingField("message"))?,
            },
        })),
        MessageType::Updates => Ok(WireMessage::Updates(Updates {
            updates: updates.ok_or(DecodeError::MissingField("updates"))?,
        })),
        MessageType::Catchup => Ok(WireMessage::Catchup(Catchup {
            cursors: cursors.ok_or(DecodeError::MissingField("cursors"))?,
        })),
        MessageType::Resync => Ok(WireMessage::Resync(Resync {
            keys: keys.ok_or(DecodeError::MissingField("keys"))?,
        })),
        MessageType::Ping => Ok(WireMessage::Ping(Ping {
            nonce: nonce.ok_or(DecodeError::MissingField("nonce"))?,
        })),
        MessageType::Pong => Ok(WireMessage::Pong(Pong {
            nonce: nonce.ok_or(DecodeError::MissingField("nonce"))?,
        })),
    }
}

fn decode_updates(dec: &mut Decoder, limits: &Limits) -> Result<Vec<Update>, DecodeError> {
    let len = decode_array_len(dec, limits, 2)?;
    if len > limits.max_updates_per_batch {
        return Err(DecodeError::DecodeLimit("max_updates_per_batch"));
    }
    let mut updates = Vec::with_capacity(len);
    for _ in 0..len {
        updates.push(decode_update(dec, limits)?);
    }
    Ok(updates)
}

fn decode_update(dec: &mut Decoder, limits: &Limits) -> Result<Update, DecodeError> {
    let map_len = decode_map_len(dec, limits, 3)?;
    let mut seen_keys = BTreeSet::new();
    let mut bucket = None;
    let mut date_ms = None;
    let mut entity = None;
    let mut payload = None;
    let mut seq = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        ensure_unique_key(&mut seen_keys, key)?;
        match key {
            "bucket" => {
                let raw = decode_u8(dec, "bucket")?;
                bucket = Some(Bucket::from_u8(raw).map_err(|e| DecodeError::InvalidField {
                    field: "bucket",
                    reason: e.to_string(),
                })?);
            }
            "date" => date_ms = Some(decode_u64(dec, "date")?),
            "entity" => entity = Some(EntityId::new(decode_i64(dec, "entity")?)),
            "payload" => payload = Some(Bytes::copy_from_slice(decode_byte_string(dec, limits)?)),
            "seq" => {
                let raw = decode_u32(dec, "seq")?;
                seq = Some(Seq1::from_u32(raw).ok_or_else(|| DecodeError::InvalidField {
                    field: "seq",
                    reason: "must be nonzero".into(),
                })?);
            }
            other => {
                return Err(DecodeError::InvalidField {
                    field: "update",
                    reason: format!("unknown key {other}"),
                });
            }
        }
    }

    Ok(Update {
        bucket: bucket.ok_or(DecodeError::MissingField("bucket"))?,
        entity_id: entity.ok_or(DecodeError::MissingField("entity"))?,
        seq: seq.ok_or(DecodeError::MissingField("seq"))?,
        date_ms: date_ms.ok_or(DecodeError::MissingField("date"))?,
        payload: payload.ok_or(DecodeError::MissingField("payload"))?,
    })
}

fn decode_cursors(dec: &mut Decoder, limits: &Limits) -> Result<CursorMap, DecodeError> {
    let len = decode_array_len(dec, limits, 2)?;
    if len > limits.max_catchup_entries {
        return Err(DecodeError::DecodeLimit("max_catchup_entries"));
    }
    let mut cursors = CursorMap::new();
    for _ in 0..len {
        let (key, seq) = decode_cursor_entry(dec, limits)?;
        cursors.insert(key, seq);
    }
    Ok(cursors)
}

fn decode_cursor_entry(
    dec: &mut Decoder,
    limits: &Limits,
) -> Result<(UpdateKey, Seq0), DecodeError> {
    let map_len = decode_map_len(dec, limits, 3)?;
    let mut seen_keys = BTreeSet::new();
    let mut bucket = None;
    let mut entity = None;
    let mut seq = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        ensure_unique_key(&mut seen_keys, key)?;
        match key {
            "bucket" => {
                let raw = decode_u8(dec, "bucket")?;
                bucket = Some(Bucket::from_u8(raw).map_err(|e| DecodeError::InvalidField {
                    field: "bucket",
                    reason: e.to_string(),
                })?);
            }
            "entity" => entity = Some(EntityId::new(decode_i64(dec, "entity")?)),
            "seq" => seq = Some(Seq0::new(decode_u32(dec, "seq")?)),
            other => {
                return Err(DecodeError::InvalidField {
                    field: "cursor",
                    reason: format!("unknown key {other}"),
                });
            }
        }
    }

    Ok((
        UpdateKey::new(
            bucket.ok_or(DecodeError::MissingField("bucket"))?,
            entity.ok_or(DecodeError::MissingField("entity"))?,
        ),
        seq.ok_or(DecodeError::MissingField("seq"))?,
    ))
}

fn decode_keys(dec: &mut Decoder, limits: &Limits) -> Result<Vec<UpdateKey>, DecodeError> {
    let len = decode_array_len(dec, limits, 2)?;
    if len > limits.max_catchup_entries {
        return Err(DecodeError::DecodeLimit("max_catchup_entries"));
    }
    let mut keys = Vec::with_capacity(len);
    for _ in 0..len {
        let map_len = decode_map_len(dec, limits, 3)?;
        let mut seen_keys = BTreeSet::new();
        let mut bucket = None;
        let mut entity = None;
        for _ in 0..map_len {
            let key = decode_text(dec, limits)?;
            ensure_unique_key(&mut seen_keys, key)?;
            match key {
                "bucket" => {
                    let raw = decode_u8(dec, "bucket")?;
                    bucket =
                        Some(Bucket::from_u8(raw).map_err(|e| DecodeError::InvalidField {
                            field: "bucket",
                            reason: e.to_string(),
                        })?);
                }
                "entity" => entity = Some(EntityId::new(decode_i64(dec, "entity")?)),
                other => {
                    return Err(DecodeError::InvalidField {
                        field: "key",
                        reason: format!("unknown key {other}"),
                    });
                }
            }
        }
        keys.push(UpdateKey::new(
            bucket.ok_or(DecodeError::MissingField("bucket"))?,
            entity.ok_or(DecodeError::MissingField("entity"))?,
        ));
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits::default()
    }

    fn roundtrip(message: WireMessage) -> WireMessage {
        let encoded = encode_envelope(&Envelope::new(message)).unwrap();
        decode_envelope(&encoded, &limits()).unwrap().message
    }

    #[test]
    fn call_roundtrip() {
        let call = WireMessage::Call(Call {
            msg_id: MsgId::from_u64(3).unwrap(),
            method: "chat.sendMessage".into(),
            input: Bytes::from_static(b"\xa0"),
        });
        assert_eq!(roundtrip(call.clone()), call);
    }

    #[test]
    fn updates_roundtrip_preserves_order() {
        let rows = vec![
            Update {
                bucket: Bucket::Chat,
                entity_id: EntityId::new(10),
                seq: Seq1::from_u32(4).unwrap(),
                date_ms: 100,
                payload: Bytes::from_static(b"a"),
            },
            Update {
                bucket: Bucket::Chat,
                entity_id: EntityId::new(10),
                seq: Seq1::from_u32(5).unwrap(),
                date_ms: 101,
                payload: Bytes::from_static(b"b"),
            },
        ];
        let message = WireMessage::Updates(Updates {
            updates: rows.clone(),
        });
        match roundtrip(message) {
            WireMessage::Updates(decoded) => assert_eq!(decoded.updates, rows),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn catchup_roundtrip() {
        let mut cursors = CursorMap::new();
        cursors.insert(
            UpdateKey::new(Bucket::Chat, EntityId::new(10)),
            Seq0::new(3),
        );
        cursors.insert(UpdateKey::new(Bucket::User, EntityId::new(1)), Seq0::ZERO);
        let message = WireMessage::Catchup(Catchup { cursors: cursors.clone() });
        match roundtrip(message) {
            WireMessage::Catchup(decoded) => assert_eq!(decoded.cursors, cursors),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn rpc_error_roundtrip() {
        let message = WireMessage::Error(RpcFailure {
            msg_id: MsgId::from_u64(9).unwrap(),
            error: RpcError::new(RpcErrorCode::NotFound, "no such chat"),
        });
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(3).unwrap();
        enc.str("body").unwrap();
        enc.map(0).unwrap();
        enc.str("type").unwrap();
        enc.str("GOSSIP").unwrap();
        enc.str("v").unwrap();
        enc.u32(PROTOCOL_VERSION).unwrap();

        assert!(matches!(
            decode_envelope(&buf, &limits()).unwrap_err(),
            DecodeError::UnknownMessageType(_)
        ));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let encoded = encode_envelope(&Envelope {
            version: 99,
            message: WireMessage::Ping(Ping { nonce: 1 }),
        })
        .unwrap();
        assert!(matches!(
            decode_envelope(&encoded, &limits()).unwrap_err(),
            DecodeError::UnsupportedVersion(99)
        ));
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let mut small = limits();
        small.max_updates_per_batch = 1;
        let rows = vec![
            Update {
                bucket: Bucket::User,
                entity_id: EntityId::new(1),
                seq: Seq1::from_u32(1).unwrap(),
                date_ms: 0,
                payload: Bytes::new(),
            };
            2
        ];
        let encoded =
            encode_envelope(&Envelope::new(WireMessage::Updates(Updates { updates: rows })))
                .unwrap();
        assert!(matches!(
            decode_envelope(&encoded, &small).unwrap_err(),
            DecodeError::DecodeLimit("max_updates_per_batch")
        ));
    }
}
