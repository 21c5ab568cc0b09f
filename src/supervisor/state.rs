//! Shared control state between the control plane and a worker thread.
//!
//! All cross-thread signalling goes through this structure: stop and pause
//! flags, the warp target, the last-processed URL cursor, progress and the
//! status message. The "time-travel" warp is a plain atomic the next tick
//! inspects; no message queue is involved.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use parking_lot::Mutex;

/// Sentinel for "no warp requested".
const NO_WARP: i64 = i64::MIN;

#[derive(Debug)]
pub struct ControlState {
    thread_id: i64,
    running: AtomicBool,
    interrupted: AtomicBool,
    paused: AtomicBool,
    offline: AtomicBool,
    warp_target: AtomicI64,
    last_url_id: AtomicI64,
    progress_bits: AtomicU32,
    status: Mutex<String>,
}

impl ControlState {
    pub fn new(thread_id: i64, last_url_id: i64, paused: bool) -> Self {
        Self {
            thread_id,
            running: AtomicBool::new(true),
            interrupted: AtomicBool::new(false),
            paused: AtomicBool::new(paused),
            offline: AtomicBool::new(false),
            warp_target: AtomicI64::new(NO_WARP),
            last_url_id: AtomicI64::new(last_url_id),
            progress_bits: AtomicU32::new(0),
            status: Mutex::new(String::new()),
        }
    }

    pub fn thread_id(&self) -> i64 {
        self.thread_id
    }

    /// Checked before and after every suspension point.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Server shutdown with work left: the worker saves its state and the
    /// thread record stays marked running so it resumes on the next
    /// bring-up.
    pub fn request_interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    /// Request repositioning of the worker's cursor. Idempotent: issuing the
    /// same target twice leaves the same observable state.
    pub fn warp_to(&self, target_url_id: i64) {
        self.warp_target.store(target_url_id, Ordering::Release);
    }

    /// Consume a pending warp. Moves the cursor to the target and returns
    /// how far the cursor jumped (clamped at zero so counters cannot go
    /// negative).
    pub fn take_warp(&self) -> Option<WarpJump> {
        let target = self.warp_target.swap(NO_WARP, Ordering::AcqRel);

        if target == NO_WARP {
            return None;
        }

        let previous = self.last_url_id.swap(target, Ordering::AcqRel);

        Some(WarpJump {
            target,
            skipped: (previous - target).max(0) as u64,
        })
    }

    pub fn last_url_id(&self) -> i64 {
        self.last_url_id.load(Ordering::Acquire)
    }

    pub fn set_last_url_id(&self, id: i64) {
        self.last_url_id.store(id, Ordering::Release);
    }

    /// Progress in `[0.0, 1.0]`.
    pub fn progress(&self) -> f32 {
        f32::from_bits(self.progress_bits.load(Ordering::Acquire))
    }

    pub fn set_progress(&self, progress: f32) {
        self.progress_bits
            .store(progress.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    pub fn status(&self) -> String {
        self.status.lock().clone()
    }

    pub fn set_status(&self, status: impl Into<String>) {
        *self.status.lock() = status.into();
    }
}

/// Result of consuming a warp request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarpJump {
    pub target: i64,
    /// How many ids the cursor jumped backwards over, for tick-counter
    /// adjustment.
    pub skipped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warp_is_consumed_once() {
        let state = ControlState::new(1, 42, false);

        state.warp_to(10);

        let jump = state.take_warp().unwrap();

        assert_eq!(jump.target, 10);
        assert_eq!(jump.skipped, 32);
        assert_eq!(state.last_url_id(), 10);
        assert!(state.take_warp().is_none());
    }

    #[test]
    fn warp_twice_equals_warp_once() {
        let state = ControlState::new(1, 42, false);

        state.warp_to(10);
        state.warp_to(10);

        state.take_warp().unwrap();

        assert!(state.take_warp().is_none());
        assert_eq!(state.last_url_id(), 10);
    }

    #[test]
    fn forward_warp_never_yields_negative_adjustment() {
        let state = ControlState::new(1, 5, false);

        state.warp_to(50);

        assert_eq!(state.take_warp().unwrap().skipped, 0);
        assert_eq!(state.last_url_id(), 50);
    }

    #[test]
    fn progress_is_clamped() {
        let state = ControlState::new(1, 0, false);

        state.set_progress(1.7);

        assert_eq!(state.progress(), 1.0);
    }
}
