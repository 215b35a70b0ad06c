//! Protocol client: one logical connection, msg-id correlation, and the
//! single inbound event stream.
//!
//! Transport loss emits `Closed` and nothing further for in-flight calls -
//! their outcome is unknown, and it is the TransactionEngine's job to treat
//! them as not-yet-applied and requeue. `Ack` is a weak receipt signal; only
//! `Result`/`RpcError` complete a call.

use std::collections::BTreeMap;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::core::{CursorMap, EncodeError, Limits, MsgId, RpcError, SessionId, Update, UpdateKey};
use crate::error::{Effect, Transience};
use crate::proto::{
    decode_envelope, encode_envelope, Call, Catchup, Connect, Envelope, FrameError, FrameReader,
    FrameWriter, Ping, WireMessage,
};

/// Transport-level failure. Absorbed by the engine (reconnect + requeue),
/// never surfaced to a transaction's caller.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("not connected")]
    NotConnected,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
}

impl NetError {
    pub fn transience(&self) -> Transience {
        Transience::Retryable
    }

    pub fn effect(&self) -> Effect {
        // A send that failed partway may or may not have reached the server.
        Effect::Unknown
    }
}

/// Failure of one correlated call.
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Rpc(RpcError),
    #[error("connection lost before a result arrived")]
    ConnectionLost,
}

/// Inbound event stream, delivered in arrival order on a single channel.
#[derive(Debug)]
pub enum ClientEvent {
    Connecting,
    Open {
        session_id: SessionId,
        server_time_ms: u64,
    },
    Ack(MsgId),
    Result {
        msg_id: MsgId,
        result: Bytes,
    },
    RpcError {
        msg_id: MsgId,
        error: RpcError,
    },
    Updates(Vec<Update>),
    Resync(Vec<UpdateKey>),
    Closed,
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub addr: String,
    pub token: String,
    pub build: u32,
    pub layer: u32,
    pub limits: Limits,
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            token: token.into(),
            build: 1,
            layer: 1,
            limits: Limits::default(),
        }
    }
}

type PendingWaiter = Sender<Result<Bytes, CallError>>;

struct ActiveConn {
    generation: u64,
    writer: FrameWriter<TcpStream>,
    stream: TcpStream,
}

struct ConnInner {
    config: ClientConfig,
    events_tx: Sender<ClientEvent>,
    active: Mutex<Option<ActiveConn>>,
    pending: Mutex<BTreeMap<MsgId, PendingWaiter>>,
    next_msg_id: AtomicU64,
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct ProtocolClient {
    inner: Arc<ConnInner>,
}

impl ProtocolClient {
    /// Returns the client and the single-consumer inbound event stream.
    pub fn new(config: ClientConfig) -> (Self, Receiver<ClientEvent>) {
        let (events_tx, events_rx) = unbounded();
        let client = Self {
            inner: Arc::new(ConnInner {
                config,
                events_tx,
                active: Mutex::new(None),
                pending: Mutex::new(BTreeMap::new()),
                next_msg_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
            }),
        };
        (client, events_rx)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock_active().is_some()
    }

    /// Dial, perform the handshake, and start the reader thread. `Open` is
    /// emitted once the server's WELCOME arrives.
    pub fn connect(&self) -> Result<(), NetError> {
        let inner = &self.inner;
        let _ = inner.events_tx.send(ClientEvent::Connecting);

        let stream = TcpStream::connect(&inner.config.addr)?;
        stream.set_nodelay(true).ok();
        let reader_stream = stream.try_clone()?;

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut writer = FrameWriter::new(stream.try_clone()?, inner.config.limits.max_frame_bytes);

        let connect = encode_envelope(&Envelope::new(WireMessage::Connect(Connect {
            token: inner.config.token.clone(),
            build: inner.config.build,
            layer: inner.config.layer,
        })))?;
        writer.write_frame(&connect)?;

        let previous = {
            let mut active = inner.lock_active();
            let previous = active.take();
            *active = Some(ActiveConn {
                generation,
                writer,
                stream,
            });
            previous
        };

        // A replaced connection is torn down here: its reader sees a stale
        // generation and stays silent, so the Closed for it (requeueing
        // anything in flight) must come from us, before the new Open.
        if let Some(previous) = previous {
            let _ = previous.stream.shutdown(Shutdown::Both);
            fail_pending(inner);
            let _ = inner.events_tx.send(ClientEvent::Closed);
        }

        let reader_inner = Arc::clone(inner);
        thread::spawn(move || run_reader(reader_inner, reader_stream, generation));

        Ok(())
    }

    /// Keep dialing with capped, jittered backoff until connected.
    pub fn connect_with_retry(&self, max_delay: Duration) {
        let mut delay = Duration::from_millis(100);
        loop {
            match self.connect() {
                Ok(()) => return,
                Err(e) => {
                    debug!(error = %e, "reconnect attempt failed");
                    let jitter = rand::rng().random_range(0..=delay.as_millis() as u64 / 2);
                    thread::sleep(delay + Duration::from_millis(jitter));
                    delay = (delay * 2).min(max_delay);
                }
            }
        }
    }

    /// Drop the transport. The reader notices and emits `Closed`.
    pub fn disconnect(&self) {
        if let Some(active) = self.inner.lock_active().as_ref() {
            let _ = active.stream.shutdown(Shutdown::Both);
        }
    }

    /// Fire-and-correlate send used by the transaction engine; completion
    /// arrives as a `Result`/`RpcError` event.
    pub fn send_call(&self, method: &str, input: Bytes) -> Result<MsgId, NetError> {
        let msg_id = self.alloc_msg_id();
        self.write_message(WireMessage::Call(Call {
            msg_id,
            method: method.to_string(),
            input,
        }))?;
        Ok(msg_id)
    }

    /// Correlated call with its own waiter, for callers outside the
    /// transaction queue (backfill fetches). Connection loss resolves the
    /// ticket with `CallError::ConnectionLost`.
    pub fn call(&self, method: &str, input: Bytes) -> Result<CallTicket, NetError> {
        let msg_id = self.alloc_msg_id();
        let (tx, rx) = bounded(1);
        self.inner.lock_pending().insert(msg_id, tx);

        let written = self.write_message(WireMessage::Call(Call {
            msg_id,
            method: method.to_string(),
            input,
        }));
        if let Err(e) = written {
            self.inner.lock_pending().remove(&msg_id);
            return Err(e);
        }

        Ok(CallTicket {
            msg_id,
            outcome_rx: rx,
        })
    }

    pub fn send_catchup(&self, cursors: CursorMap) -> Result<(), NetError> {
        self.write_message(WireMessage::Catchup(Catchup { cursors }))
    }

    pub fn send_ping(&self, nonce: u64) -> Result<(), NetError> {
        self.write_message(WireMessage::Ping(Ping { nonce }))
    }

    fn alloc_msg_id(&self) -> MsgId {
        let raw = self.inner.next_msg_id.fetch_add(1, Ordering::SeqCst);
        MsgId::from_u64(raw).expect("msg id counter starts at 1")
    }

    fn write_message(&self, message: WireMessage) -> Result<(), NetError> {
        let encoded = encode_envelope(&Envelope::new(message))?;
        let mut active = self.inner.lock_active();
        let conn = active.as_mut().ok_or(NetError::NotConnected)?;
        conn.writer.write_frame(&encoded)?;
        Ok(())
    }
}

impl ConnInner {
    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveConn>> {
        self.active.lock().expect("connection lock poisoned")
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, BTreeMap<MsgId, PendingWaiter>> {
        self.pending.lock().expect("pending lock poisoned")
    }
}

/// Waiter for one correlated call.
pub struct CallTicket {
    pub msg_id: MsgId,
    outcome_rx: Receiver<Result<Bytes, CallError>>,
}

impl CallTicket {
    pub fn wait(self) -> Result<Bytes, CallError> {
        self.outcome_rx
            .recv()
            .unwrap_or(Err(CallError::ConnectionLost))
    }
}

fn run_reader(inner: Arc<ConnInner>, stream: TcpStream, generation: u64) {
    let mut reader = FrameReader::new(stream, inner.config.limits.max_frame_bytes);

    loop {
        match reader.read_next() {
            Ok(Some(body)) => match decode_envelope(&body, &inner.config.limits) {
                Ok(envelope) => {
                    if !handle_server_message(&inner, envelope.message) {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "undecodable server frame, closing");
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                if !e.is_disconnect() {
                    debug!(error = %e, "transport read failed");
                }
                break;
            }
        }
    }

    finish_connection(&inner, generation);
}

/// Returns false when the stream should stop.
fn handle_server_message(inner: &Arc<ConnInner>, message: WireMessage) -> bool {
    let event = match message {
        WireMessage::Welcome(welcome) => ClientEvent::Open {
            session_id: welcome.session_id,
            server_time_ms: welcome.server_time_ms,
        },
        WireMessage::Ack(msg_id) => ClientEvent::Ack(msg_id),
        WireMessage::Result(result) => {
            if let Some(waiter) = inner.lock_pending().remove(&result.msg_id) {
                let _ = waiter.send(Ok(result.result));
                return true;
            }
            ClientEvent::Result {
                msg_id: result.msg_id,
                result: result.result,
            }
        }
        WireMessage::Error(failure) => {
            if let Some(waiter) = inner.lock_pending().remove(&failure.msg_id) {
                let _ = waiter.send(Err(CallError::Rpc(failure.error)));
                return true;
            }
            ClientEvent::RpcError {
                msg_id: failure.msg_id,
                error: failure.error,
            }
        }
        WireMessage::Updates(updates) => ClientEvent::Updates(updates.updates),
        WireMessage::Resync(resync) => ClientEvent::Resync(resync.keys),
        WireMessage::Pong(pong) => {
            trace!(nonce = pong.nonce, "pong");
            return true;
        }
        other => {
            warn!(message = ?other, "unexpected server message");
            return true;
        }
    };
    inner.events_tx.send(event).is_ok()
}

/// Tear down one connection generation exactly once: newer generations (a
/// racing reconnect) are left untouched.
fn finish_connection(inner: &Arc<ConnInner>, generation: u64) {
    {
        let mut active = inner.lock_active();
        match active.as_ref() {
            Some(conn) if conn.generation == generation => {
                let conn = active.take().expect("checked above");
                let _ = conn.stream.shutdown(Shutdown::Both);
            }
            _ => return,
        }
    }

    // In-flight correlated calls have unknown outcomes now.
    fail_pending(inner);
    let _ = inner.events_tx.send(ClientEvent::Closed);
}

fn fail_pending(inner: &Arc<ConnInner>) {
    let waiters: Vec<PendingWaiter> = {
        let mut pending = inner.lock_pending();
        std::mem::take(&mut *pending).into_values().collect()
    };
    for waiter in waiters {
        let _ = waiter.send(Err(CallError::ConnectionLost));
    }
}
