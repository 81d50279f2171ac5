//! Main-memory LRU of decoded bricks
//!
//! Streamed bricks are decoded once and kept here so a GPU eviction does not
//! force another read from disk. Bounded by bytes; the oldest brick goes first.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::volume::{BrickKey, BrickPayload, VolumeId};
use super::budget::MemoryBudget;

pub struct StagingCache {
    bricks: HashMap<BrickKey, Arc<BrickPayload>>,
    /// Oldest first, newest last
    access_order: VecDeque<BrickKey>,
    budget: MemoryBudget,
}

impl StagingCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            bricks: HashMap::new(),
            access_order: VecDeque::new(),
            budget: MemoryBudget::new(max_bytes, 0),
        }
    }

    /// Get a brick and mark it as recently used
    pub fn get(&mut self, key: &BrickKey) -> Option<Arc<BrickPayload>> {
        let payload = self.bricks.get(key)?.clone();
        self.update_access_order(*key);
        Some(payload)
    }

    pub fn contains(&self, key: &BrickKey) -> bool {
        self.bricks.contains_key(key)
    }

    /// Insert a decoded brick, evicting the oldest until it fits
    ///
    /// Bricks larger than the whole buffer are not kept.
    pub fn insert(&mut self, key: BrickKey, payload: Arc<BrickPayload>) -> bool {
        let bytes = payload.byte_len();
        if bytes > self.budget.cpu_limit() {
            return false;
        }
        self.remove(&key);
        while !self.budget.cpu_fits(bytes) {
            if !self.evict_oldest() {
                break;
            }
        }
        self.budget.add_cpu(bytes);
        self.bricks.insert(key, payload);
        self.access_order.push_back(key);
        true
    }

    pub fn remove(&mut self, key: &BrickKey) -> Option<Arc<BrickPayload>> {
        let payload = self.bricks.remove(key)?;
        self.budget.remove_cpu(payload.byte_len());
        self.remove_from_access_order(*key);
        Some(payload)
    }

    pub fn evict_oldest(&mut self) -> bool {
        match self.access_order.front().copied() {
            Some(key) => self.remove(&key).is_some(),
            None => false,
        }
    }

    /// Change the byte limit, dropping the oldest bricks while over it
    pub fn set_limit(&mut self, max_bytes: u64) -> usize {
        let used = self.budget.cpu_used();
        self.budget = MemoryBudget::new(max_bytes, 0);
        self.budget.add_cpu(used);
        let mut evicted = 0;
        while self.budget.cpu_pressure() > 1.0 && self.evict_oldest() {
            evicted += 1;
        }
        evicted
    }

    pub fn invalidate_volume(&mut self, volume: VolumeId) {
        let keys: Vec<BrickKey> = self.bricks.keys().filter(|k| k.volume == volume).copied().collect();
        for key in keys {
            self.remove(&key);
        }
    }

    pub fn clear(&mut self) {
        self.bricks.clear();
        self.access_order.clear();
        let limit = self.budget.cpu_limit();
        self.budget = MemoryBudget::new(limit, 0);
    }

    pub fn len(&self) -> usize {
        self.bricks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bricks.is_empty()
    }

    pub fn used_bytes(&self) -> u64 {
        self.budget.cpu_used()
    }

    fn update_access_order(&mut self, key: BrickKey) {
        self.remove_from_access_order(key);
        self.access_order.push_back(key);
    }

    fn remove_from_access_order(&mut self, key: BrickKey) {
        if let Some(pos) = self.access_order.iter().position(|&k| k == key) {
            self.access_order.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::UVec3;
    use crate::volume::{BrickId, TexelFormat};

    fn key(i: u32) -> BrickKey {
        BrickKey::new(VolumeId(0), 0, BrickId(i))
    }

    fn payload(n: usize) -> Arc<BrickPayload> {
        Arc::new(BrickPayload { dims: UVec3::new(n as u32, 1, 1), format: TexelFormat::R8, bytes: vec![0; n] })
    }

    #[test]
    fn test_evicts_oldest_by_bytes() {
        let mut cache = StagingCache::new(10);
        cache.insert(key(0), payload(4));
        cache.insert(key(1), payload(4));
        cache.get(&key(0));
        cache.insert(key(2), payload(4));
        assert!(cache.contains(&key(0)));
        assert!(!cache.contains(&key(1)));
        assert_eq!(cache.used_bytes(), 8);
    }

    #[test]
    fn test_shrinking_limit_drops_oldest() {
        let mut cache = StagingCache::new(12);
        for i in 0..3 {
            cache.insert(key(i), payload(4));
        }
        assert_eq!(cache.set_limit(5), 2);
        assert!(cache.contains(&key(2)));
        assert_eq!(cache.used_bytes(), 4);
    }

    #[test]
    fn test_oversized_not_kept() {
        let mut cache = StagingCache::new(3);
        assert!(!cache.insert(key(0), payload(4)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_replace_and_invalidate() {
        let mut cache = StagingCache::new(100);
        cache.insert(key(0), payload(4));
        cache.insert(key(0), payload(6));
        assert_eq!(cache.used_bytes(), 6);
        cache.insert(BrickKey::new(VolumeId(1), 0, BrickId(0)), payload(2));
        cache.invalidate_volume(VolumeId(0));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.used_bytes(), 2);
    }
}
