//! Catch-up cursor persistence.
//!
//! Cursors only move forward; a RESYNC signal clears them so the next
//! connect re-requests entity state instead of an impossible incremental
//! tail.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::{Bucket, CursorMap, EntityId, Seq0, Seq1, UpdateKey};

pub trait CursorStore: Send {
    fn load(&self) -> CursorMap;
    fn advance(&mut self, key: UpdateKey, seq: Seq1);
    fn clear(&mut self, keys: &[UpdateKey]);
}

#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: CursorMap,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CursorStore for MemoryCursorStore {
    fn load(&self) -> CursorMap {
        self.cursors.clone()
    }

    fn advance(&mut self, key: UpdateKey, seq: Seq1) {
        advance_forward(&mut self.cursors, key, seq);
    }

    fn clear(&mut self, keys: &[UpdateKey]) {
        for key in keys {
            self.cursors.remove(key);
        }
    }
}

#[derive(Serialize, Deserialize)]
struct CursorEntry {
    bucket: Bucket,
    entity: i64,
    seq: u32,
}

/// JSON-file-backed cursors, written through on every change.
pub struct FileCursorStore {
    path: PathBuf,
    cursors: CursorMap,
}

impl FileCursorStore {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let cursors = match fs::read(&path) {
            Ok(bytes) => {
                let entries: Vec<CursorEntry> =
                    serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                        warn!(path = %path.display(), error = %e, "cursor file unreadable, starting fresh");
                        Vec::new()
                    });
                entries
                    .into_iter()
                    .map(|entry| {
                        (
                            UpdateKey::new(entry.bucket, EntityId::new(entry.entity)),
                            Seq0::new(entry.seq),
                        )
                    })
                    .collect()
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => CursorMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self { path, cursors })
    }

    fn persist(&self) {
        let entries: Vec<CursorEntry> = self
            .cursors
            .iter()
            .map(|(key, seq)| CursorEntry {
                bucket: key.bucket,
                entity: key.entity_id.get(),
                seq: seq.get(),
            })
            .collect();
        match serde_json::to_vec(&entries) {
            Ok(bytes) => {
                if let Err(e) = fs::write(&self.path, bytes) {
                    warn!(path = %self.path.display(), error = %e, "cursor persist failed");
                }
            }
            Err(e) => warn!(error = %e, "cursor serialize failed"),
        }
    }
}

impl CursorStore for FileCursorStore {
    fn load(&self) -> CursorMap {
        self.cursors.clone()
    }

    fn advance(&mut self, key: UpdateKey, seq: Seq1) {
        if advance_forward(&mut self.cursors, key, seq) {
            self.persist();
        }
    }

    fn clear(&mut self, keys: &[UpdateKey]) {
        let mut changed = false;
        for key in keys {
            changed |= self.cursors.remove(key).is_some();
        }
        if changed {
            self.persist();
        }
    }
}

fn advance_forward(cursors: &mut CursorMap, key: UpdateKey, seq: Seq1) -> bool {
    let seen = Seq0::new(seq.get());
    let current = cursors.get(&key).copied().unwrap_or(Seq0::ZERO);
    if seen > current {
        cursors.insert(key, seen);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(entity: i64) -> UpdateKey {
        UpdateKey::new(Bucket::Chat, EntityId::new(entity))
    }

    #[test]
    fn advance_never_moves_backward() {
        let mut store = MemoryCursorStore::new();
        store.advance(chat(10), Seq1::from_u32(5).unwrap());
        store.advance(chat(10), Seq1::from_u32(3).unwrap());
        assert_eq!(store.load().get(&chat(10)), Some(&Seq0::new(5)));
    }

    #[test]
    fn clear_drops_only_named_keys() {
        let mut store = MemoryCursorStore::new();
        store.advance(chat(10), Seq1::from_u32(5).unwrap());
        store.advance(chat(11), Seq1::from_u32(2).unwrap());
        store.clear(&[chat(10)]);
        let cursors = store.load();
        assert!(!cursors.contains_key(&chat(10)));
        assert!(cursors.contains_key(&chat(11)));
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursors.json");

        let mut store = FileCursorStore::open(&path).unwrap();
        store.advance(chat(10), Seq1::from_u32(7).unwrap());
        drop(store);

        let reopened = FileCursorStore::open(&path).unwrap();
        assert_eq!(reopened.load().get(&chat(10)), Some(&Seq0::new(7)));
    }
}
