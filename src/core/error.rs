//! Core error types shared across the engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Effect, Transience};

use super::seq::SeqError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid bucket discriminant {raw}")]
    InvalidBucket { raw: u8 },

    #[error("invalid kind discriminant {raw}")]
    InvalidKind { raw: u32 },

    #[error("invalid idempotency key {raw:?}: {reason}")]
    InvalidIdempotencyKey { raw: String, reason: String },

    #[error("invalid field {field}: {reason}")]
    Validation {
        field: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Seq(#[from] SeqError),
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}

/// Stable server-side rejection categories. The string form is what crosses
/// the wire; unknown codes decode as `Other`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorCode {
    BadRequest,
    Unauthorized,
    NotFound,
    MethodNotFound,
    Conflict,
    Internal,
    Other,
}

impl RpcErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            RpcErrorCode::BadRequest => "bad_request",
            RpcErrorCode::Unauthorized => "unauthorized",
            RpcErrorCode::NotFound => "not_found",
            RpcErrorCode::MethodNotFound => "method_not_found",
            RpcErrorCode::Conflict => "conflict",
            RpcErrorCode::Internal => "internal",
            RpcErrorCode::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "bad_request" => RpcErrorCode::BadRequest,
            "unauthorized" => RpcErrorCode::Unauthorized,
            "not_found" => RpcErrorCode::NotFound,
            "method_not_found" => RpcErrorCode::MethodNotFound,
            "conflict" => RpcErrorCode::Conflict,
            "internal" => RpcErrorCode::Internal,
            _ => RpcErrorCode::Other,
        }
    }
}

/// Server rejection of one specific call. Surfaced only to the transaction
/// that issued the call, never to the connection as a whole.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("rpc error {code:?}: {message}")]
pub struct RpcError {
    pub code: RpcErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: RpcErrorCode, message: impl fmt::Display) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: impl fmt::Display) -> Self {
        Self::new(RpcErrorCode::BadRequest, message)
    }

    pub fn unauthorized(message: impl fmt::Display) -> Self {
        Self::new(RpcErrorCode::Unauthorized, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            RpcErrorCode::MethodNotFound,
            format!("unknown method {method}"),
        )
    }

    pub fn transience(&self) -> Transience {
        match self.code {
            RpcErrorCode::Internal => Transience::Unknown,
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        // A rejected call mutated nothing server-side; the caller's own
        // optimistic state is compensated by its failed hook.
        Effect::None
    }
}
