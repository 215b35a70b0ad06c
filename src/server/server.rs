//! Accept loop, connection threads, and the state thread.
//!
//! Three thread roles:
//! - Accept thread: accepts connections, spawns per-connection reader/writer
//! - Reader/writer threads (per connection): frame IO only, no state
//! - State thread: owns registry + log + dispatcher + handler, processes
//!   commands sequentially. This is THE serialization point - a mutation's
//!   log append, commit, and fan-out all happen here, in order.

use std::collections::BTreeMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{bounded, tick, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::core::{
    encode_update_body, now_ms, Bucket, EntityId, FieldValue, Kind, Limits, MsgId, ObjectRef,
    Patch, ReplicaOp, RpcError, SessionId, UpdateBody, UpdateKey, UserId,
};
use crate::proto::{
    decode_envelope, encode_envelope, Envelope, FrameReader, FrameWriter, Resync, RpcFailure,
    RpcResult, Updates, Welcome, WireMessage,
};

use super::dispatch::Dispatcher;
use super::log::{LogTxn, UpdateLog};
use super::registry::{ConnectionRegistry, PresenceChange};

#[derive(Clone, Debug)]
pub struct SyncServerConfig {
    pub listen_addr: String,
    pub limits: Limits,
    /// Sessions with no heartbeat inside this window count as offline.
    pub heartbeat_window_ms: u64,
    /// Cadence of the presence sweep.
    pub sweep_interval_ms: u64,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            limits: Limits::default(),
            heartbeat_window_ms: 30_000,
            sweep_interval_ms: 5_000,
        }
    }
}

/// Per-call context handed to the handler.
#[derive(Clone, Copy, Debug)]
pub struct CallContext {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub now_ms: u64,
}

/// What a successful call produced: the opaque result for the caller, plus
/// any partitions newly visible to users (their live sessions are subscribed
/// immediately).
pub struct CallOutcome {
    pub result: Bytes,
    pub grants: Vec<(UserId, UpdateKey)>,
}

impl CallOutcome {
    pub fn new(result: Bytes) -> Self {
        Self {
            result,
            grants: Vec::new(),
        }
    }

    pub fn with_grant(mut self, user_id: UserId, key: UpdateKey) -> Self {
        self.grants.push((user_id, key));
        self
    }
}

/// Application surface. The engine treats methods, inputs and results as
/// opaque; the handler validates, mutates its own state, and stages update
/// rows through the log transaction it is given. Rows stage and commit in the
/// same transaction as the mutation they describe.
///
/// Handlers deduplicate resent mutations themselves (the idempotency key
/// travels inside the opaque input), returning the original result for a
/// replay.
pub trait RpcHandler: Send + 'static {
    /// Map an opaque credential to a user. Failures drop the connection.
    fn authenticate(&mut self, token: &str) -> Result<UserId, RpcError>;

    /// Partitions a user's sessions are subscribed to at connect time.
    fn interests(&self, user_id: UserId) -> Vec<UpdateKey>;

    /// Execute one method.
    fn handle(
        &mut self,
        ctx: &CallContext,
        method: &str,
        input: &[u8],
        txn: &mut LogTxn<'_>,
    ) -> Result<CallOutcome, RpcError>;
}

enum ServerCommand {
    Accepted {
        conn_id: u64,
        stream: TcpStream,
        outbox: Sender<WireMessage>,
    },
    Inbound {
        conn_id: u64,
        message: WireMessage,
    },
    Closed {
        conn_id: u64,
    },
}

pub struct SyncServer;

pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    accept_join: Option<JoinHandle<()>>,
    state_join: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(join) = self.accept_join.take() {
            let _ = join.join();
        }
        if let Some(join) = self.state_join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl SyncServer {
    pub fn start(
        config: SyncServerConfig,
        handler: Box<dyn RpcHandler>,
        log: UpdateLog,
    ) -> io::Result<ServerHandle> {
        let listener = TcpListener::bind(&config.listen_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let (cmd_tx, cmd_rx) = bounded::<ServerCommand>(1024);
        let sweep = tick(Duration::from_millis(config.sweep_interval_ms.max(1)));

        let state = ServerState {
            registry: ConnectionRegistry::new(config.heartbeat_window_ms),
            dispatcher: Dispatcher::new(),
            log,
            handler,
            conns: BTreeMap::new(),
            limits: config.limits.clone(),
        };

        let state_shutdown = Arc::clone(&shutdown);
        let state_join = thread::spawn(move || run_state_loop(state, cmd_rx, sweep, state_shutdown));

        let accept_shutdown = Arc::clone(&shutdown);
        let limits = config.limits;
        let accept_join =
            thread::spawn(move || run_accept_loop(listener, cmd_tx, limits, accept_shutdown));

        info!(addr = %local_addr, "sync server listening");
        Ok(ServerHandle {
            shutdown,
            accept_join: Some(accept_join),
            state_join: Some(state_join),
            local_addr,
        })
    }
}

fn run_accept_loop(
    listener: TcpListener,
    cmd_tx: Sender<ServerCommand>,
    limits: Limits,
    shutdown: Arc<AtomicBool>,
) {
    let mut next_conn_id: u64 = 1;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                let conn_id = next_conn_id;
                next_conn_id += 1;
                debug!(conn = conn_id, peer = %peer, "connection accepted");

                if let Err(e) = spawn_connection(conn_id, stream, &cmd_tx, &limits) {
                    warn!(conn = conn_id, error = %e, "failed to start connection threads");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn spawn_connection(
    conn_id: u64,
    stream: TcpStream,
    cmd_tx: &Sender<ServerCommand>,
    limits: &Limits,
) -> io::Result<()> {
    stream.set_nodelay(true).ok();
    let reader_stream = stream.try_clone()?;
    let writer_stream = stream.try_clone()?;

    let (outbox_tx, outbox_rx) = bounded::<WireMessage>(limits.session_outbox_events);

    if cmd_tx
        .send(ServerCommand::Accepted {
            conn_id,
            stream,
            outbox: outbox_tx,
        })
        .is_err()
    {
        return Ok(()); // state thread gone, server is stopping
    }

    let reader_cmd_tx = cmd_tx.clone();
    let max_frame_bytes = limits.max_frame_bytes;
    let reader_limits = limits.clone();
    thread::spawn(move || {
        run_connection_reader(
            conn_id,
            reader_stream,
            reader_cmd_tx,
            max_frame_bytes,
            reader_limits,
        );
    });

    thread::spawn(move || run_connection_writer(conn_id, writer_stream, outbox_rx, max_frame_bytes));

    Ok(())
}

fn run_connection_reader(
    conn_id: u64,
    stream: TcpStream,
    cmd_tx: Sender<ServerCommand>,
    max_frame_bytes: usize,
    limits: Limits,
) {
    let mut reader = FrameReader::new(stream, max_frame_bytes);
    loop {
        match reader.read_next() {
            Ok(Some(body)) => match decode_envelope(&body, &limits) {
                Ok(envelope) => {
                    if cmd_tx
                        .send(ServerCommand::Inbound {
                            conn_id,
                            message: envelope.message,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    warn!(conn = conn_id, error = %e, "undecodable frame, closing");
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                if !e.is_disconnect() {
                    debug!(conn = conn_id, error = %e, "read failed");
                }
                break;
            }
        }
    }
    let _ = cmd_tx.send(ServerCommand::Closed { conn_id });
}

fn run_connection_writer(
    conn_id: u64,
    stream: TcpStream,
    outbox_rx: Receiver<WireMessage>,
    max_frame_bytes: usize,
) {
    let mut writer = FrameWriter::new(stream, max_frame_bytes);
    for message in outbox_rx {
        let encoded = match encode_envelope(&Envelope::new(message)) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(conn = conn_id, error = %e, "envelope encode failed");
                continue;
            }
        };
        if let Err(e) = writer.write_frame(&encoded) {
            debug!(conn = conn_id, error = %e, "write failed, stopping writer");
            return;
        }
    }
}

struct ConnState {
    stream: TcpStream,
    outbox: Sender<WireMessage>,
    session: Option<(SessionId, UserId)>,
}

struct ServerState {
    registry: ConnectionRegistry,
    dispatcher: Dispatcher,
    log: UpdateLog,
    handler: Box<dyn RpcHandler>,
    conns: BTreeMap<u64, ConnState>,
    limits: Limits,
}

fn run_state_loop(
    mut state: ServerState,
    cmd_rx: Receiver<ServerCommand>,
    sweep: Receiver<std::time::Instant>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        crossbeam::select! {
            recv(cmd_rx) -> msg => {
                match msg {
                    Ok(cmd) => state.handle_command(cmd),
                    Err(_) => break,
                }
            }
            recv(sweep) -> _ => {
                for change in state.registry.sweep(now_ms()) {
                    state.publish_presence(change);
                }
            }
            default(Duration::from_millis(250)) => {}
        }
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
    }

    // Force-close sockets so connection threads unblock.
    for conn in state.conns.values() {
        let _ = conn.stream.shutdown(Shutdown::Both);
    }
}

impl ServerState {
    fn handle_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::Accepted {
                conn_id,
                stream,
                outbox,
            } => {
                self.conns.insert(
                    conn_id,
                    ConnState {
                        stream,
                        outbox,
                        session: None,
                    },
                );
            }
            ServerCommand::Inbound { conn_id, message } => self.handle_message(conn_id, message),
            ServerCommand::Closed { conn_id } => self.handle_closed(conn_id),
        }
    }

    fn handle_message(&mut self, conn_id: u64, message: WireMessage) {
        match message {
            WireMessage::Connect(connect) => self.handle_connect(conn_id, &connect.token),
            WireMessage::Call(call) => {
                self.handle_call(conn_id, call.msg_id, &call.method, &call.input)
            }
            WireMessage::Catchup(catchup) => self.handle_catchup(conn_id, &catchup.cursors),
            WireMessage::Ping(ping) => self.handle_ping(conn_id, ping.nonce),
            other => {
                warn!(conn = conn_id, message = ?other, "unexpected client message");
            }
        }
    }

    fn handle_connect(&mut self, conn_id: u64, token: &str) {
        let now = now_ms();
        let user_id = match self.handler.authenticate(token) {
            Ok(user_id) => user_id,
            Err(e) => {
                warn!(conn = conn_id, error = %e, "handshake rejected, dropping connection");
                self.drop_conn(conn_id);
                return;
            }
        };

        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        let session_id = SessionId::generate();
        conn.session = Some((session_id, user_id));
        let outbox = conn.outbox.clone();

        let presence = self.registry.connect(session_id, user_id, now);
        self.dispatcher
            .attach(session_id, outbox.clone(), self.handler.interests(user_id));

        let _ = outbox.try_send(WireMessage::Welcome(Welcome {
            session_id,
            server_time_ms: now,
        }));
        debug!(conn = conn_id, session = %session_id, user = %user_id, "session opened");

        if let Some(change) = presence {
            self.publish_presence(change);
        }
    }

    fn handle_call(&mut self, conn_id: u64, msg_id: MsgId, method: &str, input: &[u8]) {
        let Some(conn) = self.conns.get(&conn_id) else {
            return;
        };
        let outbox = conn.outbox.clone();
        let Some((session_id, user_id)) = conn.session else {
            let _ = outbox.try_send(WireMessage::Error(RpcFailure {
                msg_id,
                error: RpcError::unauthorized("call before handshake"),
            }));
            return;
        };

        // Weak receipt signal; only RESULT/RPC_ERROR are authoritative.
        let _ = outbox.try_send(WireMessage::Ack(msg_id));

        let ctx = CallContext {
            session_id,
            user_id,
            now_ms: now_ms(),
        };

        let mut txn = self.log.begin();
        match self.handler.handle(&ctx, method, input, &mut txn) {
            Ok(outcome) => {
                let rows = match txn.commit() {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!(method, error = %e, "log commit failed");
                        let _ = outbox.try_send(WireMessage::Error(RpcFailure {
                            msg_id,
                            error: RpcError::new(
                                crate::core::RpcErrorCode::Internal,
                                "commit failed",
                            ),
                        }));
                        return;
                    }
                };

                for (grant_user, key) in &outcome.grants {
                    for session in self.registry.active_sessions(*grant_user, ctx.now_ms) {
                        self.dispatcher.subscribe(session, *key);
                    }
                }

                self.dispatcher.dispatch(&rows);
                let _ = outbox.try_send(WireMessage::Result(RpcResult {
                    msg_id,
                    result: outcome.result,
                }));
            }
            Err(error) => {
                // txn dropped here: nothing committed, no seq consumed.
                debug!(method, code = ?error.code, "call rejected");
                let _ = outbox.try_send(WireMessage::Error(RpcFailure { msg_id, error }));
            }
        }
    }

    fn handle_catchup(&mut self, conn_id: u64, cursors: &crate::core::CursorMap) {
        let Some(conn) = self.conns.get(&conn_id) else {
            return;
        };
        if conn.session.is_none() {
            warn!(conn = conn_id, "catch-up before handshake ignored");
            return;
        }
        let outbox = conn.outbox.clone();

        let (rows, resync) = self.log.catch_up_all(cursors);
        for chunk in rows.chunks(self.limits.max_updates_per_batch.max(1)) {
            let _ = outbox.try_send(WireMessage::Updates(Updates {
                updates: chunk.to_vec(),
            }));
        }
        if !resync.is_empty() {
            let _ = outbox.try_send(WireMessage::Resync(Resync { keys: resync }));
        }
    }

    fn handle_ping(&mut self, conn_id: u64, nonce: u64) {
        let Some(conn) = self.conns.get(&conn_id) else {
            return;
        };
        if let Some((session_id, _)) = conn.session {
            self.registry.heartbeat(session_id, now_ms());
        }
        let _ = conn
            .outbox
            .try_send(WireMessage::Pong(crate::proto::Pong { nonce }));
    }

    fn handle_closed(&mut self, conn_id: u64) {
        let Some(conn) = self.conns.remove(&conn_id) else {
            return;
        };
        let _ = conn.stream.shutdown(Shutdown::Both);
        if let Some((session_id, _)) = conn.session {
            self.dispatcher.detach(session_id);
            if let Some(change) = self.registry.disconnect(session_id, now_ms()) {
                self.publish_presence(change);
            }
            debug!(conn = conn_id, session = %session_id, "session closed");
        }
    }

    fn drop_conn(&mut self, conn_id: u64) {
        if let Some(conn) = self.conns.remove(&conn_id) {
            let _ = conn.stream.shutdown(Shutdown::Both);
        }
    }

    /// Best-effort presence row in the User bucket. Failure is logged and
    /// dropped; presence must never corrupt or block the log path.
    fn publish_presence(&mut self, change: PresenceChange) {
        let body = UpdateBody::single(ReplicaOp::Merge(
            Patch::new(ObjectRef::new(Kind::User, change.user_id.get()))
                .with_field("last_active_ms", FieldValue::Int(change.at_ms as i64))
                .with_field("online", FieldValue::Bool(change.online)),
        ));
        let payload = match encode_update_body(&body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "presence payload encode failed");
                return;
            }
        };

        let mut txn = self.log.begin();
        txn.append(
            Bucket::User,
            EntityId::new(change.user_id.get()),
            payload,
        );
        match txn.commit() {
            Ok(rows) => self.dispatcher.dispatch(&rows),
            Err(e) => warn!(error = %e, "presence publish failed"),
        }
    }
}
