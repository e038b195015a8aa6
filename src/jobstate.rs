//! Mutable flags shared across the whole tree, plus walltime bookkeeping.

use std::sync::atomic::{AtomicBool, Ordering};

/// `paused`/`failed`/`aborted` plus the "already signaled" latch that keeps a
/// requeued process's checkpoint from being clobbered by the outgoing one.
#[derive(Default)]
pub struct JobState {
    pub paused: AtomicBool,
    pub failed: AtomicBool,
    pub aborted: AtomicBool,
    pub signaled: AtomicBool,
}

impl JobState {
    pub fn reset(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.failed.store(false, Ordering::SeqCst);
        self.aborted.store(false, Ordering::SeqCst);
        // `signaled` intentionally survives `reset`: it only ever flips once
        // per process lifetime, right before this process hands off to its
        // requeued successor.
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, v: bool) {
        self.paused.store(v, Ordering::SeqCst);
    }
    pub fn set_failed(&self, v: bool) {
        self.failed.store(v, Ordering::SeqCst);
    }
    pub fn set_aborted(&self, v: bool) {
        self.aborted.store(v, Ordering::SeqCst);
    }
    pub fn set_signaled(&self, v: bool) {
        self.signaled.store(v, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_run_flags_but_not_signaled() {
        let state = JobState::default();
        state.set_failed(true);
        state.set_signaled(true);
        state.reset();
        assert!(!state.is_failed());
        assert!(state.is_signaled());
    }
}
