//! Cooperative brick loader
//!
//! The loader owns the queue of an update loop and processes it in bursts.
//! Each call to [`BrickLoader::resume`] runs items front to back until the
//! queue is empty or the next item would overrun the burst's time budget,
//! then returns control to the host's idle tick.

use std::time::Duration;

use crate::core::Clock;
use super::queue::{LoadItem, LoadQueue};

/// Loader lifecycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoaderState {
    #[default]
    Idle,
    /// Queue set, no burst run yet
    Armed,
    Running,
    /// Budget exhausted, waiting for the next idle tick
    Paused,
    Finished,
}

/// Result of one burst
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadStep {
    Pending { remaining: usize },
    Done,
}

/// What happened to one item
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed,
    /// Nothing to do for this item (already drawn, culled, empty)
    Skipped,
    /// Bytes not available yet, retry later in this loop
    Deferred,
    Failed(String),
}

/// Performs decode, upload and draw for one item
pub trait LoadWorker {
    fn process(&mut self, item: &LoadItem) -> ItemOutcome;
}

impl<F: FnMut(&LoadItem) -> ItemOutcome> LoadWorker for F {
    fn process(&mut self, item: &LoadItem) -> ItemOutcome {
        self(item)
    }
}

/// Counters for the current loop
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deferred: usize,
    pub bursts: usize,
}

/// Resumable queue driver
#[derive(Debug, Default)]
pub struct BrickLoader {
    state: LoaderState,
    queue: LoadQueue,
    /// Items deferred during the current pass over the queue
    deferred: Vec<LoadItem>,
    failures: Vec<(LoadItem, String)>,
    stats: LoopStats,
    /// Mean wall time of processed items
    mean_cost: Duration,
    processed: u32,
}

impl BrickLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LoaderState {
        self.state
    }

    pub fn remaining(&self) -> usize {
        self.queue.len() + self.deferred.len()
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Items that failed in the current loop, with their reasons
    pub fn failures(&self) -> &[(LoadItem, String)] {
        &self.failures
    }

    pub fn queue(&self) -> &LoadQueue {
        &self.queue
    }

    /// True while a loop is armed, running or paused
    pub fn is_active(&self) -> bool {
        matches!(self.state, LoaderState::Armed | LoaderState::Running | LoaderState::Paused)
    }

    /// Start a loop over `items`; an empty set finishes immediately
    pub fn arm(&mut self, items: impl IntoIterator<Item = LoadItem>) {
        self.reset();
        self.queue = items.into_iter().collect();
        self.state = if self.queue.is_empty() {
            LoaderState::Finished
        } else {
            LoaderState::Armed
        };
        log::debug!("Loader armed with {} items", self.queue.len());
    }

    /// Discard the queue; resident bricks stay valid
    pub fn cancel(&mut self) {
        if self.is_active() {
            log::debug!("Loader cancelled with {} items left", self.remaining());
        }
        self.reset();
        self.state = LoaderState::Idle;
    }

    fn reset(&mut self) {
        self.queue.clear();
        self.deferred.clear();
        self.failures.clear();
        self.stats = LoopStats::default();
    }

    /// Run one burst
    ///
    /// With a `budget`, an item is only started when the elapsed burst time
    /// plus the mean item cost so far stays within it; the first item of a
    /// burst always runs so every burst makes progress.
    pub fn resume(&mut self, worker: &mut dyn LoadWorker, clock: &dyn Clock, budget: Option<Duration>) -> LoadStep {
        match self.state {
            LoaderState::Idle => return LoadStep::Done,
            LoaderState::Finished => return LoadStep::Done,
            _ => {}
        }
        self.state = LoaderState::Running;
        self.stats.bursts += 1;
        let start = clock.now();
        let mut ran = 0usize;
        let mut progressed = false;

        loop {
            if self.queue.is_empty() {
                if self.deferred.is_empty() {
                    break;
                }
                let stalled = !progressed;
                for item in self.deferred.drain(..) {
                    self.queue.requeue(item);
                }
                if stalled {
                    // Everything left is waiting on streaming; yield until the next tick.
                    self.state = LoaderState::Paused;
                    return self.pending_step(ran, clock.since(start));
                }
                progressed = false;
            }

            if ran > 0 {
                if let Some(budget) = budget {
                    let elapsed = clock.since(start);
                    if elapsed + self.mean_cost > budget {
                        self.state = LoaderState::Paused;
                        return self.pending_step(ran, elapsed);
                    }
                }
            }

            let Some(item) = self.queue.pop() else { break };
            let t0 = clock.now();
            let outcome = worker.process(&item);
            self.record_cost(clock.now().saturating_sub(t0));
            ran += 1;

            match outcome {
                ItemOutcome::Completed => {
                    self.stats.completed += 1;
                    progressed = true;
                }
                ItemOutcome::Skipped => {
                    self.stats.skipped += 1;
                    progressed = true;
                }
                ItemOutcome::Deferred => {
                    self.stats.deferred += 1;
                    self.deferred.push(item);
                }
                ItemOutcome::Failed(reason) => {
                    log::warn!("Load item {:?} failed: {}", item.target, reason);
                    self.stats.failed += 1;
                    progressed = true;
                    self.failures.push((item, reason));
                }
            }
        }

        self.state = LoaderState::Finished;
        log::debug!(
            "Loader finished: {} completed, {} skipped, {} failed in {} bursts",
            self.stats.completed, self.stats.skipped, self.stats.failed, self.stats.bursts
        );
        LoadStep::Done
    }

    fn pending_step(&self, ran: usize, elapsed: Duration) -> LoadStep {
        log::debug!(
            "Loader paused after {} items in {:?}, {} remaining",
            ran, elapsed, self.remaining()
        );
        LoadStep::Pending { remaining: self.remaining() }
    }

    fn record_cost(&mut self, cost: Duration) {
        self.processed = self.processed.saturating_add(1);
        let n = self.processed;
        // Running mean over every item the loader has processed.
        self.mean_cost = (self.mean_cost * (n - 1) + cost) / n;
    }

    /// Mean wall time per item observed so far
    pub fn mean_cost(&self) -> Duration {
        self.mean_cost
    }
}
