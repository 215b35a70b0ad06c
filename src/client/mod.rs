//! Client side: local replica, transaction queue, protocol connection,
//! backfill.

pub mod backfill;
pub mod conn;
pub mod cursor;
pub mod engine;
pub mod store;
pub mod transaction;

pub use backfill::{
    BackfillError, BackfillFetcher, CallFetchRpc, FetchRpc, FetchTarget, Resolver, StoreResolver,
};
pub use conn::{CallError, CallTicket, ClientConfig, ClientEvent, NetError, ProtocolClient};
pub use cursor::{CursorStore, FileCursorStore, MemoryCursorStore};
pub use engine::{EngineConfig, EngineError, TransactionEngine};
pub use store::{CachedQuery, ReplicaStore, StoreError, SubscriptionGuard};
pub use transaction::{Transaction, TxnId, TxnOutcome, TxnReceipt, TxnState};
