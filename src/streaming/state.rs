//! Update-loop state and the active streaming slot

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identity of one render canvas
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanvasId(pub u64);

/// Progress of the current refinement loop
#[derive(Clone, Debug, Default)]
pub struct UpdateLoopState {
    mem_swap: bool,
    active: bool,
    interactive: bool,
    started_at: Option<Duration>,
    bricks_total: usize,
    bricks_finished: usize,
    loops_started: u64,
}

impl UpdateLoopState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a loop that must process `total` items
    pub fn begin(&mut self, total: usize, now: Duration) {
        self.active = total > 0;
        self.started_at = Some(now);
        self.bricks_total = total;
        self.bricks_finished = 0;
        self.loops_started += 1;
        log::info!("Update loop {} started with {} bricks", self.loops_started, total);
    }

    pub fn advance(&mut self, finished: usize) {
        self.bricks_finished = (self.bricks_finished + finished).min(self.bricks_total);
    }

    pub fn finish(&mut self, now: Duration) {
        if self.active {
            log::info!(
                "Update loop {} finished {}/{} bricks in {:?}",
                self.loops_started,
                self.bricks_finished,
                self.bricks_total,
                self.elapsed(now)
            );
        }
        self.active = false;
    }

    /// Stop without finishing; the counters of the discarded loop are cleared
    pub fn cancel(&mut self) {
        self.active = false;
        self.bricks_total = 0;
        self.bricks_finished = 0;
        self.started_at = None;
    }

    pub fn elapsed(&self, now: Duration) -> Duration {
        self.started_at.map_or(Duration::ZERO, |s| now.saturating_sub(s))
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn mem_swap(&self) -> bool {
        self.mem_swap
    }

    pub fn set_mem_swap(&mut self, on: bool) {
        self.mem_swap = on;
    }

    pub fn interactive(&self) -> bool {
        self.interactive
    }

    pub fn set_interactive(&mut self, on: bool) {
        self.interactive = on;
    }

    pub fn bricks_total(&self) -> usize {
        self.bricks_total
    }

    pub fn bricks_finished(&self) -> usize {
        self.bricks_finished
    }

    pub fn loops_started(&self) -> u64 {
        self.loops_started
    }

    pub fn flags(&self) -> ProgressFlags {
        ProgressFlags {
            update_loop_active: self.active,
            bricks_finished: self.bricks_finished,
            bricks_total: self.bricks_total,
            interactive: self.interactive,
            mem_swap: self.mem_swap,
        }
    }
}

/// Snapshot polled by the host UI for its progress indicator
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressFlags {
    pub update_loop_active: bool,
    pub bricks_finished: usize,
    pub bricks_total: usize,
    pub interactive: bool,
    pub mem_swap: bool,
}

impl ProgressFlags {
    /// Completed fraction in `0..=1`; an empty loop counts as complete
    pub fn fraction(&self) -> f32 {
        if self.bricks_total == 0 {
            1.0
        } else {
            self.bricks_finished as f32 / self.bricks_total as f32
        }
    }
}

const NO_HOLDER: u64 = u64::MAX;

/// Token allowing one canvas at a time to stream into the shared budget
#[derive(Clone, Debug)]
pub struct StreamingSlot {
    holder: Arc<AtomicU64>,
}

impl StreamingSlot {
    pub fn new() -> Self {
        Self { holder: Arc::new(AtomicU64::new(NO_HOLDER)) }
    }

    /// Take the slot, or keep it if `canvas` already holds it
    pub fn try_acquire(&self, canvas: CanvasId) -> bool {
        match self.holder.compare_exchange(NO_HOLDER, canvas.0, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => true,
            Err(current) => current == canvas.0,
        }
    }

    /// Give the slot back; a canvas that does not hold it changes nothing
    pub fn release(&self, canvas: CanvasId) -> bool {
        self.holder
            .compare_exchange(canvas.0, NO_HOLDER, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn holder(&self) -> Option<CanvasId> {
        match self.holder.load(Ordering::Acquire) {
            NO_HOLDER => None,
            id => Some(CanvasId(id)),
        }
    }
}

impl Default for StreamingSlot {
    fn default() -> Self {
        Self::new()
    }
}
