//! Shared bridge state for the threaded runtime.
//!
//! `SharedBridge` wraps the single [`BridgeCore`] that the upstream worker,
//! the relay client tasks and the scheduler tick all operate on.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rs_throttle_bridge::bridge::BridgeCore;
//! use rs_throttle_bridge::config::Config;
//! use rs_throttle_bridge::services::SharedBridge;
//!
//! let shared = Arc::new(SharedBridge::new(BridgeCore::new(Config::default())));
//!
//! let now = shared.now_ms();
//! shared.with_core(|core| core.on_connected(now));
//! assert!(!shared.with_core(|core| core.session().is_synchronized()));
//! ```

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crate::bridge::BridgeCore;
use crate::session::SessionState;

/// One bridge core behind one lock, plus the time base every task uses.
///
/// # Thread Safety
///
/// - A `Mutex` rather than an `RwLock`: nearly every access mutates
///   (receive, tick, drain).
/// - Closures passed to [`with_core`](Self::with_core) must not block or
///   await; the lock is released when the closure returns.
/// - A task that panicked while holding the lock does not wedge the others;
///   the poisoned guard is recovered.
pub struct SharedBridge {
    core: Mutex<BridgeCore>,
    start_time: Instant,
}

impl SharedBridge {
    /// Wrap a core. `now_ms()` counts from this call.
    pub fn new(core: BridgeCore) -> Self {
        Self {
            core: Mutex::new(core),
            start_time: Instant::now(),
        }
    }

    /// Milliseconds since creation.
    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// The time base.
    #[inline]
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Run `f` with exclusive access to the core.
    pub fn with_core<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut BridgeCore) -> R,
    {
        let mut guard = self.core.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Current upstream session state.
    pub fn session_state(&self) -> SessionState {
        self.with_core(|core| core.session().state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Arc;

    fn shared() -> SharedBridge {
        SharedBridge::new(BridgeCore::new(Config::default()))
    }

    #[test]
    fn clock_starts_near_zero() {
        assert!(shared().now_ms() < 100);
    }

    #[test]
    fn core_is_reachable_from_threads() {
        let state = Arc::new(shared());
        state.with_core(|c| c.on_connected(0));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || {
                    let now = state.now_ms();
                    state.with_core(|c| {
                        let _ = c.on_upstream_line(if i == 0 { "VN2.0" } else { "*" }, now);
                    });
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_ne!(state.session_state(), SessionState::Connecting);
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let state = Arc::new(shared());
        let clone = Arc::clone(&state);
        let _ = std::thread::spawn(move || {
            clone.with_core(|_| panic!("boom"));
        })
        .join();
        assert_eq!(state.with_core(|c| c.relay().capacity()), 4);
    }
}
