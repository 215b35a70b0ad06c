//! Replica object model and update payload encoding.
//!
//! An update payload is canonical CBOR describing replica ops with absolute
//! field values, never relative deltas. Applying the same payload twice leaves
//! a replica unchanged after the first application, which is what makes
//! overlapping push + backfill delivery safe to replay.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use serde::{Deserialize, Serialize};

use super::cbor::{
    decode_array_len, decode_byte_string, decode_i64, decode_map_len, decode_text, decode_u32,
    ensure_fully_consumed, ensure_unique_key, DecodeError, EncodeError,
};
use super::error::CoreError;
use super::limits::Limits;

/// Replica object type. Discriminants are wire-stable; never renumber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    User = 1,
    Space = 2,
    Chat = 3,
    Message = 4,
    Member = 5,
}

impl Kind {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(raw: u32) -> Result<Self, CoreError> {
        match raw {
            1 => Ok(Kind::User),
            2 => Ok(Kind::Space),
            3 => Ok(Kind::Chat),
            4 => Ok(Kind::Message),
            5 => Ok(Kind::Member),
            _ => Err(CoreError::InvalidKind { raw }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::User => "user",
            Kind::Space => "space",
            Kind::Chat => "chat",
            Kind::Message => "message",
            Kind::Member => "member",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Key of one replica object.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: Kind,
    pub id: i64,
}

impl ObjectRef {
    pub fn new(kind: Kind, id: i64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({}/{})", self.kind, self.id)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Scalar field value. Absolute, never a delta.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Blob(Bytes),
}

impl FieldValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

pub type Fields = BTreeMap<String, FieldValue>;

/// One replica object: a keyed bag of scalar fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Object {
    pub reference: ObjectRef,
    pub fields: Fields,
}

impl Object {
    pub fn new(reference: ObjectRef) -> Self {
        Self {
            reference,
            fields: Fields::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Field-wise merge: listed fields overwrite, absent fields are preserved.
    pub fn merge(&mut self, patch: &Patch) {
        for (name, value) in &patch.fields {
            self.fields.insert(name.clone(), value.clone());
        }
    }
}

/// Field-wise patch against one object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Patch {
    pub reference: ObjectRef,
    pub fields: Fields,
}

impl Patch {
    pub fn new(reference: ObjectRef) -> Self {
        Self {
            reference,
            fields: Fields::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// A patch applied to nothing materializes the object.
    pub fn into_object(self) -> Object {
        Object {
            reference: self.reference,
            fields: self.fields,
        }
    }
}

/// One mutation of the local replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicaOp {
    /// Wholesale replace.
    Insert(Object),
    /// Field-wise merge; behaves as insert when the object is absent.
    Merge(Patch),
    /// Remove the entry.
    Delete(ObjectRef),
}

impl ReplicaOp {
    pub fn reference(&self) -> ObjectRef {
        match self {
            ReplicaOp::Insert(obj) => obj.reference,
            ReplicaOp::Merge(patch) => patch.reference,
            ReplicaOp::Delete(reference) => *reference,
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            ReplicaOp::Insert(_) => "insert",
            ReplicaOp::Merge(_) => "merge",
            ReplicaOp::Delete(_) => "delete",
        }
    }
}

/// Decoded update payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateBody {
    pub ops: Vec<ReplicaOp>,
}

impl UpdateBody {
    pub fn new(ops: Vec<ReplicaOp>) -> Self {
        Self { ops }
    }

    pub fn single(op: ReplicaOp) -> Self {
        Self { ops: vec![op] }
    }
}

pub fn encode_update_body(body: &UpdateBody) -> Result<Bytes, EncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);

    enc.map(2)?;
    enc.str("ops")?;
    enc.array(body.ops.len() as u64)?;
    for op in &body.ops {
        encode_op(&mut enc, op)?;
    }
    enc.str("v")?;
    enc.u32(1)?;

    Ok(Bytes::from(buf))
}

fn encode_op(enc: &mut Encoder<&mut Vec<u8>>, op: &ReplicaOp) -> Result<(), EncodeError> {
    let fields = match op {
        ReplicaOp::Insert(obj) => Some(&obj.fields),
        ReplicaOp::Merge(patch) => Some(&patch.fields),
        ReplicaOp::Delete(_) => None,
    };
    let reference = op.reference();

    let len = if fields.is_some() { 4 } else { 3 };
    enc.map(len)?;

    if let Some(fields) = fields {
        enc.str("fields")?;
        enc.map(fields.len() as u64)?;
        for (name, value) in fields {
            enc.str(name)?;
            encode_field_value(enc, value)?;
        }
    }

    enc.str("id")?;
    enc.i64(reference.id)?;
    enc.str("kind")?;
    enc.u32(reference.kind.as_u32())?;
    enc.str("op")?;
    enc.str(op.tag())?;

    Ok(())
}

fn encode_field_value(
    enc: &mut Encoder<&mut Vec<u8>>,
    value: &FieldValue,
) -> Result<(), EncodeError> {
    match value {
        FieldValue::Null => {
            enc.null()?;
        }
        FieldValue::Bool(v) => {
            enc.bool(*v)?;
        }
        FieldValue::Int(v) => {
            enc.i64(*v)?;
        }
        FieldValue::Text(v) => {
            enc.str(v)?;
        }
        FieldValue::Blob(v) => {
            enc.bytes(v)?;
        }
    }
    Ok(())
}

pub fn decode_update_body(bytes: &[u8], limits: &Limits) -> Result<UpdateBody, DecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits, 0)?;

    let mut seen_keys = BTreeSet::new();
    let mut version = None;
    let mut ops = Vec::new();

    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        ensure_unique_key(&mut seen_keys, key)?;
        match key {
            "ops" => {
                let arr_len = decode_array_len(&mut dec, limits, 1)?;
                if arr_len > limits.max_ops_per_update {
                    return Err(DecodeError::DecodeLimit("max_ops_per_update"));
                }
                ops.reserve(arr_len);
                for _ in 0..arr_len {
                    ops.push(decode_op(&mut dec, limits)?);
                }
            }
            "v" => {
                version = Some(decode_u32(&mut dec, "v")?);
            }
            other => {
                return Err(DecodeError::InvalidField {
                    field: "update_body",
                    reason: format!("unknown key {other}"),
                });
            }
        }
    }

    let version = version.ok_or(DecodeError::MissingField("v"))?;
    if version != 1 {
        return Err(DecodeError::InvalidField {
            field: "v",
            reason: format!("unsupported payload version {version}"),
        });
    }

    ensure_fully_consumed(&mut dec)?;
    Ok(UpdateBody { ops })
}

fn decode_op(dec: &mut Decoder, limits: &Limits) -> Result<ReplicaOp, DecodeError> {
    let map_len = decode_map_len(dec, limits, 2)?;
    let mut seen_keys = BTreeSet::new();
    let mut fields: Option<Fields> = None;
    let mut id = None;
    let mut kind = None;
    let mut tag = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        ensure_unique_key(&mut seen_keys, key)?;
        match key {
            "fields" => {
                let field_len = decode_map_len(dec, limits, 3)?;
                if field_len > limits.max_fields_per_object {
                    return Err(DecodeError::DecodeLimit("max_fields_per_object"));
                }
                let mut map = Fields::new();
                let mut seen_fields = BTreeSet::new();
                for _ in 0..field_len {
                    let name = decode_text(dec, limits)?;
                    ensure_unique_key(&mut seen_fields, name)?;
                    let value = decode_field_value(dec, limits)?;
                    map.insert(name.to_string(), value);
                }
                fields = Some(map);
            }
            "id" => {
                id = Some(decode_i64(dec, "id")?);
            }
            "kind" => {
                let raw = decode_u32(dec, "kind")?;
                kind = Some(Kind::from_u32(raw).map_err(|e| DecodeError::InvalidField {
                    field: "kind",
                    reason: e.to_string(),
                })?);
            }
            "op" => {
                tag = Some(decode_text(dec, limits)?.to_string());
            }
            other => {
                return Err(DecodeError::InvalidField {
                    field: "op",
                    reason: format!("unknown key {other}"),
                });
            }
        }
    }

    let id = id.ok_or(DecodeError::MissingField("id"))?;
    let kind = kind.ok_or(DecodeError::MissingField("kind"))?;
    let tag = tag.ok_or(DecodeError::MissingField("op"))?;
    let reference = ObjectRef::new(kind, id);

    match tag.as_str() {
        "insert" => Ok(ReplicaOp::Insert(Object {
            reference,
            fields: fields.ok_or(DecodeError::MissingField("fields"))?,
        })),
        "merge" => Ok(ReplicaOp::Merge(Patch {
            reference,
            fields: fields.ok_or(DecodeError::MissingField("fields"))?,
        })),
        "delete" => {
            if fields.is_some() {
                return Err(DecodeError::InvalidField {
                    field: "fields",
                    reason: "delete carries no fields".into(),
                });
            }
            Ok(ReplicaOp::Delete(reference))
        }
        other => Err(DecodeError::InvalidField {
            field: "op",
            reason: format!("unknown op {other}"),
        }),
    }
}

fn decode_field_value(dec: &mut Decoder, limits: &Limits) -> Result<FieldValue, DecodeError> {
    match dec.datatype()? {
        Type::Null => {
            dec.null()?;
            Ok(FieldValue::Null)
        }
        Type::Bool => Ok(FieldValue::Bool(dec.bool()?)),
        Type::U8 | Type::U16 | Type::U32 | Type::U64 | Type::I8 | Type::I16 | Type::I32
        | Type::I64 | Type::Int => Ok(FieldValue::Int(decode_i64(dec, "field")?)),
        Type::String | Type::StringIndef => {
            Ok(FieldValue::Text(decode_text(dec, limits)?.to_string()))
        }
        Type::Bytes | Type::BytesIndef => Ok(FieldValue::Blob(Bytes::copy_from_slice(
            decode_byte_string(dec, limits)?,
        ))),
        other => Err(DecodeError::InvalidField {
            field: "field",
            reason: format!("unsupported field type {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits::default()
    }

    fn message_insert(id: i64, text: &str) -> ReplicaOp {
        ReplicaOp::Insert(
            Object::new(ObjectRef::new(Kind::Message, id))
                .with_field("chat_id", FieldValue::Int(10))
                .with_field("text", FieldValue::Text(text.to_string())),
        )
    }

    #[test]
    fn body_roundtrip() {
        let body = UpdateBody::new(vec![
            message_insert(7, "hi"),
            ReplicaOp::Merge(
                Patch::new(ObjectRef::new(Kind::Chat, 10))
                    .with_field("last_msg_id", FieldValue::Int(7)),
            ),
            ReplicaOp::Delete(ObjectRef::new(Kind::Message, 3)),
        ]);
        let bytes = encode_update_body(&body).unwrap();
        let decoded = decode_update_body(&bytes, &limits()).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn encoding_is_deterministic() {
        let body = UpdateBody::single(message_insert(1, "a"));
        assert_eq!(
            encode_update_body(&body).unwrap(),
            encode_update_body(&body).unwrap()
        );
    }

    #[test]
    fn delete_with_fields_is_rejected() {
        // Hand-build a delete op that smuggles a fields map.
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(2).unwrap();
        enc.str("ops").unwrap();
        enc.array(1).unwrap();
        enc.map(4).unwrap();
        enc.str("fields").unwrap();
        enc.map(0).unwrap();
        enc.str("id").unwrap();
        enc.i64(1).unwrap();
        enc.str("kind").unwrap();
        enc.u32(4).unwrap();
        enc.str("op").unwrap();
        enc.str("delete").unwrap();
        enc.str("v").unwrap();
        enc.u32(1).unwrap();

        assert!(decode_update_body(&buf, &limits()).is_err());
    }

    #[test]
    fn merge_preserves_absent_fields() {
        let mut obj = Object::new(ObjectRef::new(Kind::Chat, 10))
            .with_field("title", FieldValue::Text("general".into()))
            .with_field("last_msg_id", FieldValue::Int(6));
        let patch =
            Patch::new(ObjectRef::new(Kind::Chat, 10)).with_field("last_msg_id", FieldValue::Int(7));

        obj.merge(&patch);
        assert_eq!(obj.field("last_msg_id"), Some(&FieldValue::Int(7)));
        assert_eq!(
            obj.field("title"),
            Some(&FieldValue::Text("general".into()))
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let mut obj = Object::new(ObjectRef::new(Kind::User, 1));
        let patch = Patch::new(ObjectRef::new(Kind::User, 1))
            .with_field("online", FieldValue::Bool(true));

        obj.merge(&patch);
        let once = obj.clone();
        obj.merge(&patch);
        assert_eq!(obj, once);
    }
}
