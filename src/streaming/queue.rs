//! Ordered queue of brick load items

use std::collections::{HashSet, VecDeque};

use crate::volume::{BrickKey, FileLocation, PassMode};

/// What one load item brings to the screen
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkTarget {
    /// One brick of one volume
    Brick(BrickKey),
    /// One depth slab of the interleaved multi-volume sequence
    Slab(u32),
}

/// One unit of loader work
#[derive(Clone, Debug, PartialEq)]
pub struct LoadItem {
    pub target: WorkTarget,
    pub pass: PassMode,
    /// Byte range for streamed bricks
    pub location: Option<FileLocation>,
    /// Depth-peeling layer the item is drawn in
    pub layer: u32,
}

impl LoadItem {
    pub fn brick(key: BrickKey, pass: PassMode) -> Self {
        Self { target: WorkTarget::Brick(key), pass, location: None, layer: 0 }
    }

    pub fn slab(index: u32, pass: PassMode) -> Self {
        Self { target: WorkTarget::Slab(index), pass, location: None, layer: 0 }
    }

    pub fn with_location(mut self, location: Option<FileLocation>) -> Self {
        self.location = location;
        self
    }

    pub fn with_layer(mut self, layer: u32) -> Self {
        self.layer = layer;
        self
    }

    pub fn brick_key(&self) -> Option<BrickKey> {
        match self.target {
            WorkTarget::Brick(k) => Some(k),
            WorkTarget::Slab(_) => None,
        }
    }

    fn dedup_key(&self) -> (WorkTarget, PassMode, u32) {
        (self.target, self.pass, self.layer)
    }
}

/// FIFO of load items; an item already queued for the same pass is dropped
#[derive(Debug, Default)]
pub struct LoadQueue {
    items: VecDeque<LoadItem>,
    queued: HashSet<(WorkTarget, PassMode, u32)>,
}

impl LoadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item; returns false when it was already queued
    pub fn push(&mut self, item: LoadItem) -> bool {
        if !self.queued.insert(item.dedup_key()) {
            return false;
        }
        self.items.push_back(item);
        true
    }

    /// Put an item back at the end for a later pass
    pub fn requeue(&mut self, item: LoadItem) {
        self.queued.insert(item.dedup_key());
        self.items.push_back(item);
    }

    pub fn pop(&mut self) -> Option<LoadItem> {
        let item = self.items.pop_front()?;
        self.queued.remove(&item.dedup_key());
        Some(item)
    }

    pub fn peek(&self) -> Option<&LoadItem> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.queued.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadItem> {
        self.items.iter()
    }
}

impl FromIterator<LoadItem> for LoadQueue {
    fn from_iter<I: IntoIterator<Item = LoadItem>>(iter: I) -> Self {
        let mut queue = LoadQueue::new();
        for item in iter {
            queue.push(item);
        }
        queue
    }
}
