//! Server side: authoritative update log, fan-out, presence, accept loop.

pub mod dispatch;
pub mod log;
pub mod registry;
#[allow(clippy::module_inception)]
pub mod server;

pub use dispatch::Dispatcher;
pub use log::{CatchUp, LogError, LogStore, LogTxn, MemoryLogStore, UpdateLog};
pub use registry::{ConnectionRegistry, PresenceChange, SessionRecord};
pub use server::{
    CallContext, CallOutcome, RpcHandler, ServerHandle, SyncServer, SyncServerConfig,
};
