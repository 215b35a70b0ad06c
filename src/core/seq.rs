//! Per-entity sequence numbers and catch-up cursors.
//!
//! `Seq0` is a cursor ("everything up to and including this is seen", zero at
//! genesis); `Seq1` is a committed log position and can never be zero. The wire
//! carries seq as int32, so both are u32-backed.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::identity::UpdateKey;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Seq0(u32);

impl Seq0 {
    pub const ZERO: Seq0 = Seq0(0);

    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Seq1 {
        let next = self
            .0
            .checked_add(1)
            .expect("seq0 overflow computing next seq1");
        Seq1(NonZeroU32::new(next).expect("seq1 cannot be zero"))
    }
}

impl fmt::Debug for Seq0 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq0({})", self.0)
    }
}

impl fmt::Display for Seq0 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq1(NonZeroU32);

impl Seq1 {
    pub fn from_u32(value: u32) -> Option<Self> {
        NonZeroU32::new(value).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    pub fn next(self) -> Seq1 {
        let next = self
            .0
            .get()
            .checked_add(1)
            .expect("seq1 overflow computing next");
        Seq1(NonZeroU32::new(next).expect("seq1 cannot be zero"))
    }

    pub fn prev_seq0(self) -> Seq0 {
        Seq0(self.0.get() - 1)
    }
}

impl fmt::Debug for Seq1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq1({})", self.0)
    }
}

impl fmt::Display for Seq1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-side catch-up cursor set: last seen seq per log partition.
pub type CursorMap = BTreeMap<UpdateKey, Seq0>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SeqError {
    #[error("expected contiguous seq {expected}, got {got}")]
    NonContiguous { expected: Seq1, got: Seq1 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_helpers_work() {
        let cursor = Seq0::ZERO;
        let first = cursor.next();
        assert_eq!(first.get(), 1);
        assert_eq!(first.prev_seq0(), Seq0::ZERO);

        let third = Seq1::from_u32(3).unwrap();
        assert_eq!(third.next().get(), 4);
        assert_eq!(third.prev_seq0().get(), 2);
    }

    #[test]
    fn seq1_rejects_zero() {
        assert!(Seq1::from_u32(0).is_none());
    }
}
