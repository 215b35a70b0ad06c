//! In-process harness for integration tests: a reference chat handler, a
//! server wrapper, and client assembly helpers.
//!
//! The chat handler is deliberately tiny - enough surface to exercise the
//! sync engine end to end (idempotent sends, fan-out, catch-up, backfill)
//! without being a product.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use minicbor::{Decoder, Encoder};

use crate::client::{
    ClientConfig, EngineConfig, MemoryCursorStore, ProtocolClient, ReplicaStore, Transaction,
    TransactionEngine,
};
use crate::core::cbor::{
    decode_array_len, decode_i64, decode_map_len, decode_text, ensure_unique_key, DecodeError,
};
use crate::core::{
    encode_update_body, Bucket, EntityId, FieldValue, IdempotencyKey, Kind, Limits, Object,
    ObjectRef, Patch, ReplicaOp, RpcError, UpdateBody, UpdateKey, UserId,
};
use crate::server::{
    CallContext, CallOutcome, LogTxn, RpcHandler, ServerHandle, SyncServer, SyncServerConfig,
    UpdateLog,
};

// =============================================================================
// Reference chat world
// =============================================================================

pub struct ChatState {
    pub members: BTreeSet<UserId>,
    pub next_message_id: i64,
    pub messages: BTreeMap<i64, StoredMessage>,
}

#[derive(Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub chat_id: i64,
    pub sender: i64,
    pub text: String,
}

#[derive(Default)]
pub struct ChatWorld {
    pub chats: BTreeMap<i64, ChatState>,
    /// Resent mutations answer with the original result.
    pub dedup: BTreeMap<IdempotencyKey, Bytes>,
    /// Artificial processing delay, for tests that need a call in flight
    /// long enough to drop the transport under it.
    pub delay_ms: u64,
}

impl ChatWorld {
    pub fn seed_chat(&mut self, chat_id: i64, members: &[i64]) {
        self.chats.insert(
            chat_id,
            ChatState {
                members: members.iter().map(|id| UserId::new(*id)).collect(),
                next_message_id: 1,
                messages: BTreeMap::new(),
            },
        );
    }

    pub fn message_count(&self, chat_id: i64) -> usize {
        self.chats
            .get(&chat_id)
            .map(|chat| chat.messages.len())
            .unwrap_or(0)
    }
}

/// Reference handler: `user:<id>` tokens, `chat.sendMessage` mutations with
/// idempotency-key dedup, and a `messages.getByIds` backfill read.
#[derive(Clone)]
pub struct ChatHandler {
    world: Arc<Mutex<ChatWorld>>,
}

impl ChatHandler {
    pub fn new() -> (Self, Arc<Mutex<ChatWorld>>) {
        let world = Arc::new(Mutex::new(ChatWorld::default()));
        (
            Self {
                world: Arc::clone(&world),
            },
            world,
        )
    }
}

impl RpcHandler for ChatHandler {
    fn authenticate(&mut self, token: &str) -> Result<UserId, RpcError> {
        token
            .strip_prefix("user:")
            .and_then(|raw| raw.parse::<i64>().ok())
            .map(UserId::new)
            .ok_or_else(|| RpcError::unauthorized("unrecognized token"))
    }

    fn interests(&self, user_id: UserId) -> Vec<UpdateKey> {
        let world = self.world.lock().expect("world lock poisoned");
        let mut keys = BTreeSet::new();
        keys.insert(UpdateKey::new(Bucket::User, EntityId::new(user_id.get())));
        for (chat_id, chat) in &world.chats {
            if !chat.members.contains(&user_id) {
                continue;
            }
            keys.insert(UpdateKey::new(Bucket::Chat, EntityId::new(*chat_id)));
            // Chat members watch each other's presence.
            for peer in &chat.members {
                keys.insert(UpdateKey::new(Bucket::User, EntityId::new(peer.get())));
            }
        }
        keys.into_iter().collect()
    }

    fn handle(
        &mut self,
        ctx: &CallContext,
        method: &str,
        input: &[u8],
        txn: &mut LogTxn<'_>,
    ) -> Result<CallOutcome, RpcError> {
        match method {
            "chat.sendMessage" => self.send_message(ctx, input, txn),
            "messages.getByIds" => self.get_by_ids(input),
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

impl ChatHandler {
    fn send_message(
        &mut self,
        ctx: &CallContext,
        input: &[u8],
        txn: &mut LogTxn<'_>,
    ) -> Result<CallOutcome, RpcError> {
        let request = decode_send_message_input(input)
            .map_err(|e| RpcError::bad_request(format!("bad input: {e}")))?;

        let delay_ms = self.world.lock().expect("world lock poisoned").delay_ms;
        if delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(delay_ms));
        }

        let mut world = self.world.lock().expect("world lock poisoned");

        if let Some(result) = world.dedup.get(&request.key) {
            // Replay of a resent mutation: no new rows, original result.
            return Ok(CallOutcome::new(result.clone()));
        }

        let chat = world
            .chats
            .get_mut(&request.chat_id)
            .ok_or_else(|| RpcError::new(crate::core::RpcErrorCode::NotFound, "no such chat"))?;
        if !chat.members.contains(&ctx.user_id) {
            return Err(RpcError::unauthorized("not a member"));
        }

        let message_id = chat.next_message_id;
        chat.next_message_id += 1;
        let message = StoredMessage {
            id: message_id,
            chat_id: request.chat_id,
            sender: ctx.user_id.get(),
            text: request.text.clone(),
        };
        chat.messages.insert(message_id, message.clone());

        let body = UpdateBody::new(vec![
            ReplicaOp::Insert(message_object(&message)),
            ReplicaOp::Merge(
                Patch::new(ObjectRef::new(Kind::Chat, request.chat_id))
                    .with_field("last_msg_id", FieldValue::Int(message_id)),
            ),
        ]);
        let payload = encode_update_body(&body).expect("payload encode cannot fail");
        txn.append(Bucket::Chat, EntityId::new(request.chat_id), payload);

        let result = encode_send_message_result(message_id);
        world.dedup.insert(request.key, result.clone());
        Ok(CallOutcome::new(result))
    }

    fn get_by_ids(&self, input: &[u8]) -> Result<CallOutcome, RpcError> {
        let request = decode_fetch_input(input)
            .map_err(|e| RpcError::bad_request(format!("bad input: {e}")))?;
        let world = self.world.lock().expect("world lock poisoned");
        let Some(chat) = world.chats.get(&request.chat_id) else {
            return Err(RpcError::new(
                crate::core::RpcErrorCode::NotFound,
                "no such chat",
            ));
        };

        // Unknown ids are silently absent; the caller re-requests if it
        // still cares.
        let ops: Vec<ReplicaOp> = request
            .ids
            .iter()
            .filter_map(|id| chat.messages.get(id))
            .map(|message| ReplicaOp::Insert(message_object(message)))
            .collect();
        let body = UpdateBody::new(ops);
        Ok(CallOutcome::new(
            encode_update_body(&body).expect("payload encode cannot fail"),
        ))
    }
}

fn message_object(message: &StoredMessage) -> Object {
    Object::new(ObjectRef::new(Kind::Message, message.id))
        .with_field("chat_id", FieldValue::Int(message.chat_id))
        .with_field("sender", FieldValue::Int(message.sender))
        .with_field("text", FieldValue::Text(message.text.clone()))
}

// =============================================================================
// Wire payload builders (CBOR, canonical key order)
// =============================================================================

pub struct SendMessageInput {
    pub chat_id: i64,
    pub key: IdempotencyKey,
    pub text: String,
}

pub fn encode_send_message_input(chat_id: i64, key: IdempotencyKey, text: &str) -> Bytes {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(3).expect("vec encoder");
    enc.str("chat").expect("vec encoder");
    enc.i64(chat_id).expect("vec encoder");
    enc.str("key").expect("vec encoder");
    enc.str(&key.to_string()).expect("vec encoder");
    enc.str("text").expect("vec encoder");
    enc.str(text).expect("vec encoder");
    Bytes::from(buf)
}

pub fn decode_send_message_input(input: &[u8]) -> Result<SendMessageInput, DecodeError> {
    let limits = Limits::default();
    let mut dec = Decoder::new(input);
    let map_len = decode_map_len(&mut dec, &limits, 0)?;
    let mut seen = BTreeSet::new();
    let mut chat_id = None;
    let mut key = None;
    let mut text = None;
    for _ in 0..map_len {
        let field = decode_text(&mut dec, &limits)?;
        ensure_unique_key(&mut seen, field)?;
        match field {
            "chat" => chat_id = Some(decode_i64(&mut dec, "chat")?),
            "key" => {
                let raw = decode_text(&mut dec, &limits)?;
                key = Some(IdempotencyKey::parse(raw).map_err(|e| {
                    DecodeError::InvalidField {
                        field: "key",
                        reason: e.to_string(),
                    }
                })?);
            }
            "text" => text = Some(decode_text(&mut dec, &limits)?.to_string()),
            other => {
                return Err(DecodeError::InvalidField {
                    field: "send_message",
                    reason: format!("unknown key {other}"),
                })
            }
        }
    }
    Ok(SendMessageInput {
        chat_id: chat_id.ok_or(DecodeError::MissingField("chat"))?,
        key: key.ok_or(DecodeError::MissingField("key"))?,
        text: text.ok_or(DecodeError::MissingField("text"))?,
    })
}

pub fn encode_send_message_result(message_id: i64) -> Bytes {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(1).expect("vec encoder");
    enc.str("message_id").expect("vec encoder");
    enc.i64(message_id).expect("vec encoder");
    Bytes::from(buf)
}

pub fn decode_send_message_result(result: &[u8]) -> Result<i64, DecodeError> {
    let limits = Limits::default();
    let mut dec = Decoder::new(result);
    let map_len = decode_map_len(&mut dec, &limits, 0)?;
    let mut message_id = None;
    for _ in 0..map_len {
        match decode_text(&mut dec, &limits)? {
            "message_id" => message_id = Some(decode_i64(&mut dec, "message_id")?),
            other => {
                return Err(DecodeError::InvalidField {
                    field: "send_message_result",
                    reason: format!("unknown key {other}"),
                })
            }
        }
    }
    message_id.ok_or(DecodeError::MissingField("message_id"))
}

struct FetchInput {
    chat_id: i64,
    ids: Vec<i64>,
}

/// Decodes the `{chat, ids, peer}` shape produced by `CallFetchRpc`.
fn decode_fetch_input(input: &[u8]) -> Result<FetchInput, DecodeError> {
    let limits = Limits::default();
    let mut dec = Decoder::new(input);
    let map_len = decode_map_len(&mut dec, &limits, 0)?;
    let mut seen = BTreeSet::new();
    let mut chat_id = None;
    let mut ids = None;
    for _ in 0..map_len {
        let field = decode_text(&mut dec, &limits)?;
        ensure_unique_key(&mut seen, field)?;
        match field {
            "chat" => chat_id = Some(decode_i64(&mut dec, "chat")?),
            "ids" => {
                let len = decode_array_len(&mut dec, &limits, 1)?;
                let mut list = Vec::with_capacity(len);
                for _ in 0..len {
                    list.push(decode_i64(&mut dec, "ids")?);
                }
                ids = Some(list);
            }
            "peer" => {
                let _ = decode_i64(&mut dec, "peer")?;
            }
            other => {
                return Err(DecodeError::InvalidField {
                    field: "fetch",
                    reason: format!("unknown key {other}"),
                })
            }
        }
    }
    Ok(FetchInput {
        chat_id: chat_id.ok_or(DecodeError::MissingField("chat"))?,
        ids: ids.ok_or(DecodeError::MissingField("ids"))?,
    })
}

// =============================================================================
// Server + client assembly
// =============================================================================

pub struct TestServer {
    pub handle: ServerHandle,
    pub world: Arc<Mutex<ChatWorld>>,
}

impl TestServer {
    /// Loopback server with the reference chat handler and an in-memory log.
    pub fn start() -> Self {
        let (handler, world) = ChatHandler::new();
        let config = SyncServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..SyncServerConfig::default()
        };
        let handle = SyncServer::start(config, Box::new(handler), UpdateLog::in_memory())
            .expect("loopback bind");
        Self { handle, world }
    }

    pub fn addr(&self) -> String {
        self.handle.local_addr().to_string()
    }

    pub fn seed_chat(&self, chat_id: i64, members: &[i64]) {
        self.world
            .lock()
            .expect("world lock poisoned")
            .seed_chat(chat_id, members);
    }
}

pub struct TestClient {
    pub client: ProtocolClient,
    pub engine: TransactionEngine,
    pub store: ReplicaStore,
}

impl TestClient {
    /// Assemble a disconnected client + engine for `user_id`. Reconnects are
    /// manual so tests control the connection lifecycle.
    pub fn build(addr: &str, user_id: i64) -> Self {
        Self::build_with_cursors(addr, user_id, Box::new(MemoryCursorStore::new()))
    }

    pub fn build_with_cursors(
        addr: &str,
        user_id: i64,
        cursors: Box<dyn crate::client::CursorStore>,
    ) -> Self {
        let (client, events_rx) = ProtocolClient::new(ClientConfig::new(
            addr.to_string(),
            format!("user:{user_id}"),
        ));
        let store = ReplicaStore::new();
        let engine = TransactionEngine::start(
            store.clone(),
            client.clone(),
            events_rx,
            cursors,
            EngineConfig {
                auto_reconnect: false,
                ..EngineConfig::default()
            },
        );
        Self {
            client,
            engine,
            store,
        }
    }

    /// Build and connect.
    pub fn connect(addr: &str, user_id: i64) -> Self {
        let test_client = Self::build(addr, user_id);
        test_client.client.connect().expect("loopback connect");
        test_client
    }

    /// A send-message transaction with the standard optimistic texture: a
    /// pending local message under `temp_id`, removed on apply (the real row
    /// arrives via the update stream) or marked failed on rejection.
    pub fn send_message_txn(&self, chat_id: i64, temp_id: i64, text: &str) -> Transaction {
        let key = IdempotencyKey::generate();
        let input = encode_send_message_input(chat_id, key, text);
        let text_owned = text.to_string();

        Transaction::new("chat.sendMessage", input)
            .on_optimistic(move |store| {
                store.insert(
                    Object::new(ObjectRef::new(Kind::Message, temp_id))
                        .with_field("chat_id", FieldValue::Int(chat_id))
                        .with_field("text", FieldValue::Text(text_owned))
                        .with_field("status", FieldValue::Text("pending".into())),
                );
            })
            .on_apply(move |_result, store| {
                store.delete(&ObjectRef::new(Kind::Message, temp_id));
            })
            .on_failed(move |_error, store| {
                store.update(
                    Patch::new(ObjectRef::new(Kind::Message, temp_id))
                        .with_field("status", FieldValue::Text("failed".into())),
                );
            })
            .on_cancelled(move |store| {
                store.delete(&ObjectRef::new(Kind::Message, temp_id));
            })
    }
}

/// Poll until `condition` holds. Panics after `timeout`.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached within {timeout:?}");
}

/// Poll variant that returns instead of panicking.
pub fn try_wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}
