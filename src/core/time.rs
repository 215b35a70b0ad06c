//! Wall clock with a process-wide override for tests.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait WallClockSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

struct SystemClock;

impl WallClockSource for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

fn override_slot() -> &'static Mutex<Option<Arc<dyn WallClockSource>>> {
    static SLOT: OnceLock<Mutex<Option<Arc<dyn WallClockSource>>>> = OnceLock::new();
    SLOT.get_or_init(|| Mutex::new(None))
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    let slot = override_slot().lock().expect("wall clock lock poisoned");
    match slot.as_ref() {
        Some(source) => source.now_ms(),
        None => SystemClock.now_ms(),
    }
}

/// Restores the real clock when dropped.
pub struct WallClockGuard(());

impl Drop for WallClockGuard {
    fn drop(&mut self) {
        let mut slot = override_slot().lock().expect("wall clock lock poisoned");
        *slot = None;
    }
}

/// Install a deterministic clock for the duration of a test.
///
/// Tests that install a clock must not run concurrently with tests that rely
/// on real time (the override is process-wide).
pub fn set_wall_clock_source_for_tests(source: Arc<dyn WallClockSource>) -> WallClockGuard {
    let mut slot = override_slot().lock().expect("wall clock lock poisoned");
    *slot = Some(source);
    WallClockGuard(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Fixed(AtomicU64);

    impl WallClockSource for Fixed {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn override_applies_and_restores() {
        {
            let _guard = set_wall_clock_source_for_tests(Arc::new(Fixed(AtomicU64::new(42))));
            assert_eq!(now_ms(), 42);
        }
        assert!(now_ms() > 1_000_000);
    }
}
