//! Protocol and resource limits, threaded through decode and session paths.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Hard cap on one wire frame (header excluded).
    pub max_frame_bytes: usize,
    /// Updates per UPDATES batch.
    pub max_updates_per_batch: usize,
    /// Replica ops per update payload.
    pub max_ops_per_update: usize,
    /// Fields per object or patch.
    pub max_fields_per_object: usize,
    /// Cursor entries per CATCHUP request.
    pub max_catchup_entries: usize,
    /// Ids per backfill fetch round-trip.
    pub max_backfill_batch: usize,
    /// CBOR guards.
    pub max_cbor_map_entries: usize,
    pub max_cbor_array_entries: usize,
    pub max_cbor_text_len: usize,
    pub max_cbor_bytes_len: usize,
    pub max_cbor_depth: usize,
    /// Per-session outbox capacity; a session that lags past this is dropped
    /// and recovers via catch-up.
    pub session_outbox_events: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1 << 20,
            max_updates_per_batch: 512,
            max_ops_per_update: 64,
            max_fields_per_object: 128,
            max_catchup_entries: 4096,
            max_backfill_batch: 200,
            max_cbor_map_entries: 1024,
            max_cbor_array_entries: 4096,
            max_cbor_text_len: 64 * 1024,
            max_cbor_bytes_len: 1 << 20,
            max_cbor_depth: 16,
            session_outbox_events: 1024,
        }
    }
}
