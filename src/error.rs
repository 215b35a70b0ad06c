use thiserror::Error;

use crate::client::{EngineError, NetError, StoreError};
use crate::core::CoreError;
use crate::core::RpcError;
use crate::server::LogError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
///
/// `Unknown` is the canonical description of an in-flight call at transport
/// loss: it may or may not have reached the server, which is why resends
/// carry idempotency keys.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (locally or remotely).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Core(e) => e.transience(),
            Error::Log(e) => e.transience(),
            Error::Store(e) => e.transience(),
            Error::Net(e) => e.transience(),
            Error::Engine(e) => e.transience(),
            Error::Rpc(e) => e.transience(),
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Core(e) => e.effect(),
            Error::Log(e) => e.effect(),
            Error::Store(e) => e.effect(),
            Error::Net(e) => e.effect(),
            Error::Engine(e) => e.effect(),
            Error::Rpc(e) => e.effect(),
        }
    }
}
