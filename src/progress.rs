use indicatif::ProgressBar;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::tools::progress_bar;

/// Cooperative progress and cancellation hooks polled during an attack.
///
/// One unit of work is one key candidate processed for one subkey position
/// in one batch. Implementations use interior mutability so a handle can be
/// shared with the thread that requests cancellation.
pub trait Progress: Sync {
    fn set_total(&self, _units: u64) {}

    fn advance(&self, units: u64);

    /// Called once per batch, before it is ingested.
    fn update_status(&self, _traces: Range<usize>, _subkey: usize) {}

    fn is_cancelled(&self) -> bool;

    fn is_skip_requested(&self) -> bool;

    fn clear_skip(&self);
}

/// Never cancels, never skips.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn advance(&self, _units: u64) {}

    fn is_cancelled(&self) -> bool {
        false
    }

    fn is_skip_requested(&self) -> bool {
        false
    }

    fn clear_skip(&self) {}
}

/// Atomic counters and flags.
#[derive(Debug, Default)]
pub struct ProgressState {
    done: AtomicU64,
    total: AtomicU64,
    cancelled: AtomicBool,
    skip: AtomicBool,
}

impl ProgressState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Clears a previous cancellation so the attack can be resumed.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn request_skip(&self) {
        self.skip.store(true, Ordering::SeqCst);
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl Progress for ProgressState {
    fn set_total(&self, units: u64) {
        self.done.store(0, Ordering::Relaxed);
        self.total.store(units, Ordering::Relaxed);
    }

    fn advance(&self, units: u64) {
        self.done.fetch_add(units, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn is_skip_requested(&self) -> bool {
        self.skip.load(Ordering::SeqCst)
    }

    fn clear_skip(&self) {
        self.skip.store(false, Ordering::SeqCst);
    }
}

/// Terminal progress bar backed by a [`ProgressState`].
pub struct BarProgress {
    bar: ProgressBar,
    state: ProgressState,
}

impl BarProgress {
    pub fn new() -> Self {
        Self {
            bar: progress_bar(0),
            state: ProgressState::new(),
        }
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn finish(&self) {
        self.bar.finish();
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress for BarProgress {
    fn set_total(&self, units: u64) {
        self.state.set_total(units);
        self.bar.set_length(units);
        self.bar.set_position(0);
    }

    fn advance(&self, units: u64) {
        self.state.advance(units);
        self.bar.inc(units);
    }

    fn update_status(&self, traces: Range<usize>, subkey: usize) {
        self.bar.set_message(format!(
            "subkey {subkey}: traces {}..{}",
            traces.start, traces.end
        ));
    }

    fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    fn is_skip_requested(&self) -> bool {
        self.state.is_skip_requested()
    }

    fn clear_skip(&self) {
        self.state.clear_skip();
    }
}
