//! Clocks and frame timing
//!
//! The streaming core never reads wall-clock time directly. Every budget check goes
//! through a [`Clock`], so tests can drive time by hand with a [`ManualClock`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time source
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's epoch
    fn now(&self) -> Duration;

    /// Time elapsed since an earlier reading of this clock
    fn since(&self, earlier: Duration) -> Duration {
        self.now().saturating_sub(earlier)
    }
}

/// Wall clock backed by [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// Hand-driven clock for deterministic tests and offline rendering
///
/// Clones share the same counter, so a worker can advance the clock that the
/// loader is reading.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set(&self, at: Duration) {
        self.nanos.store(at.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Tracks per-frame durations for the FPS readout and the quota heuristic
pub struct FrameTimer {
    last_frame: Option<Duration>,
    delta: Duration,
    frame_count: u64,
    /// Durations of the most recent frames, newest last
    history: VecDeque<Duration>,
    window: usize,
}

impl FrameTimer {
    /// Create a timer that averages over `window` frames
    pub fn new(window: usize) -> Self {
        Self {
            last_frame: None,
            delta: Duration::ZERO,
            frame_count: 0,
            history: VecDeque::with_capacity(window.max(1)),
            window: window.max(1),
        }
    }

    /// Record a frame boundary at `now`
    pub fn tick(&mut self, now: Duration) {
        if let Some(last) = self.last_frame {
            self.delta = now.saturating_sub(last);
            if self.history.len() == self.window {
                self.history.pop_front();
            }
            self.history.push_back(self.delta);
        }
        self.last_frame = Some(now);
        self.frame_count += 1;
    }

    /// Duration of the last complete frame
    pub fn delta(&self) -> Duration {
        self.delta
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Average frames per second over the window, 0 before two ticks
    pub fn fps(&self) -> f32 {
        if self.history.is_empty() {
            return 0.0;
        }
        let total: Duration = self.history.iter().sum();
        let avg = total.as_secs_f32() / self.history.len() as f32;
        if avg > 0.0 { 1.0 / avg } else { 0.0 }
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new(30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new();
        let other = clock.clone();
        other.advance(Duration::from_millis(15));
        assert_eq!(clock.now(), Duration::from_millis(15));
        assert_eq!(clock.since(Duration::from_millis(5)), Duration::from_millis(10));
    }

    #[test]
    fn test_since_saturates() {
        let clock = ManualClock::new();
        assert_eq!(clock.since(Duration::from_secs(1)), Duration::ZERO);
    }

    #[test]
    fn test_frame_timer_fps() {
        let mut timer = FrameTimer::new(4);
        for i in 0..5 {
            timer.tick(Duration::from_millis(i * 20));
        }
        assert_eq!(timer.frame_count(), 5);
        assert_eq!(timer.delta(), Duration::from_millis(20));
        assert!((timer.fps() - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_frame_timer_empty() {
        let timer = FrameTimer::default();
        assert_eq!(timer.fps(), 0.0);
    }
}
