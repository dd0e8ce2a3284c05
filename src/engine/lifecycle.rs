use std::sync::atomic::{AtomicU8, Ordering};

/// The engine's lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active = 0,
    Closing = 1,
    Closed = 2,
}

/// Atomically-updated lifecycle state.
///
/// Every public operation snapshots the state once at entry and fails fast on
/// anything but `Active`; a half-transitioned state is never observable.
#[derive(Debug)]
pub struct LifecycleState(AtomicU8);

impl LifecycleState {
    pub fn new() -> Self {
        Self(AtomicU8::new(Lifecycle::Active as u8))
    }

    /// The state at this instant.
    pub fn snapshot(&self) -> Lifecycle {
        match self.0.load(Ordering::Acquire) {
            0 => Lifecycle::Active,
            1 => Lifecycle::Closing,
            _ => Lifecycle::Closed,
        }
    }

    /// Attempts the `Active -> Closing` transition.
    ///
    /// # Returns
    /// `true` if this caller won the transition; `false` if the engine was
    /// already closing or closed.
    pub fn begin_close(&self) -> bool {
        self.0
            .compare_exchange(
                Lifecycle::Active as u8,
                Lifecycle::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Completes the `Closing -> Closed` transition.
    pub fn finish_close(&self) {
        self.0.store(Lifecycle::Closed as u8, Ordering::Release);
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::new()
    }
}
