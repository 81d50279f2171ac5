//! GPU residency cache for brick textures
//!
//! Keeps uploaded brick components under a byte budget (and optionally a
//! brick count). Eviction is strict LRU among unpinned entries; entries
//! pinned by an in-flight composite are never evicted. The per-frame
//! "drawn" ledger lives here as well so every renderer sharing the cache
//! sees the same at-most-once-per-pass state.

use std::collections::HashMap;

use thiserror::Error;

use crate::core::Result;
use crate::render::backend::{Filter, RenderBackend, TextureHandle};
use crate::volume::{BrickKey, BrickPayload, Component, PassMode, PassSet, VolumeId};
use super::budget::MemoryBudget;

/// One uploaded component of one brick
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureKey {
    pub brick: BrickKey,
    pub comp: Component,
}

impl TextureKey {
    pub fn new(brick: BrickKey, comp: Component) -> Self {
        Self { brick, comp }
    }

    pub fn data(brick: BrickKey) -> Self {
        Self::new(brick, Component::Data)
    }
}

/// Why a brick could not be made resident
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("brick needs {needed} bytes, cache can free at most {limit}")]
    ResourceExhausted { needed: u64, limit: u64 },
    #[error("brick bytes are not available yet")]
    Deferred,
    #[error("upload failed: {0}")]
    Upload(String),
}

/// Running counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub uploads: u64,
    pub evictions: u64,
    pub failures: u64,
}

#[derive(Debug)]
struct Entry {
    handle: TextureHandle,
    bytes: u64,
    last_used: u64,
    pins: u32,
    filter: Filter,
}

/// Passes drawn per brick and depth-peeling layer in the current loop
pub type DrawnLedger = HashMap<(BrickKey, u32), PassSet>;

/// Brick texture cache shared by every canvas of a renderer context
pub struct BrickCache {
    entries: HashMap<TextureKey, Entry>,
    budget: MemoryBudget,
    max_entries: Option<usize>,
    /// Monotonic LRU stamp
    stamp: u64,
    /// Handles dropped by `clear_pool`, destroyed at the next safe point
    graveyard: Vec<TextureHandle>,
    /// Keyed by brick and depth-peeling layer
    drawn: DrawnLedger,
    stats: CacheStats,
}

impl BrickCache {
    /// Cache limited to `gpu_bytes` of texture memory
    pub fn new(gpu_bytes: u64) -> Self {
        Self {
            entries: HashMap::new(),
            budget: MemoryBudget::new(0, gpu_bytes),
            max_entries: None,
            stamp: 0,
            graveyard: Vec::new(),
            drawn: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Also cap the number of resident textures
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries.max(1));
        self
    }

    /// Change the byte limit, evicting LRU entries until usage fits again
    ///
    /// Pinned entries stay; usage then remains over the limit until they are released.
    pub fn set_limit(&mut self, backend: &mut dyn RenderBackend, gpu_bytes: u64) -> usize {
        let used = self.budget.gpu_used();
        self.budget = MemoryBudget::new(0, gpu_bytes);
        self.budget.add_gpu(used);

        let mut evicted = 0;
        while self.budget.gpu_pressure() > 1.0 {
            if !self.evict_lru(backend) {
                log::warn!(
                    "Texture cache holds {} bytes of pinned bricks over its {} byte limit",
                    self.budget.gpu_used(),
                    gpu_bytes
                );
                break;
            }
            evicted += 1;
        }
        evicted
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = CacheStats::default();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resident_bytes(&self) -> u64 {
        self.budget.gpu_used()
    }

    pub fn contains(&self, key: &TextureKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Resident handle without touching the LRU stamp
    pub fn lookup(&self, key: &TextureKey) -> Option<TextureHandle> {
        self.entries.get(key).map(|e| e.handle)
    }

    fn next_stamp(&mut self) -> u64 {
        self.stamp += 1;
        self.stamp
    }

    /// Return a resident texture for `key`, uploading it on a miss
    ///
    /// `fetch` produces the texels; `Ok(None)` means the bytes are still being
    /// streamed and yields [`CacheError::Deferred`]. Nothing is evicted unless
    /// the new brick can actually be admitted.
    pub fn ensure_resident(
        &mut self,
        backend: &mut dyn RenderBackend,
        key: TextureKey,
        filter: Filter,
        fetch: impl FnOnce() -> Result<Option<BrickPayload>>,
    ) -> std::result::Result<TextureHandle, CacheError> {
        let stamp = self.next_stamp();
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.last_used = stamp;
            entry.filter = filter;
            self.stats.hits += 1;
            return Ok(entry.handle);
        }
        self.stats.misses += 1;

        let payload = match fetch() {
            Ok(Some(payload)) => payload,
            Ok(None) => return Err(CacheError::Deferred),
            Err(e) => {
                self.stats.failures += 1;
                return Err(CacheError::Upload(e.to_string()));
            }
        };
        let needed = payload.byte_len();

        let evictable: u64 = self.entries.values().filter(|e| e.pins == 0).map(|e| e.bytes).sum();
        let reclaimable = self.budget.gpu_available() + evictable;
        if !self.budget.gpu_can_ever_fit(needed) || reclaimable < needed || !self.count_admissible() {
            self.stats.failures += 1;
            log::warn!(
                "Brick {:?} ({} bytes) does not fit: {} bytes reclaimable of {}",
                key, needed, reclaimable, self.budget.gpu_limit()
            );
            return Err(CacheError::ResourceExhausted { needed, limit: reclaimable });
        }

        while !self.budget.gpu_fits(needed) || self.at_count_limit() {
            if !self.evict_lru(backend) {
                break;
            }
        }

        let handle = backend
            .create_texture(payload.dims, payload.format, filter)
            .map_err(|e| CacheError::Upload(e.to_string()));
        let handle = match handle {
            Ok(h) => h,
            Err(e) => {
                self.stats.failures += 1;
                return Err(e);
            }
        };
        if let Err(e) = backend.upload_texture(handle, &payload) {
            backend.destroy_texture(handle);
            self.stats.failures += 1;
            return Err(CacheError::Upload(e.to_string()));
        }

        self.budget.add_gpu(needed);
        self.stats.uploads += 1;
        log::trace!("Uploaded {:?} as {:?} ({} bytes)", key, handle, needed);
        self.entries.insert(key, Entry { handle, bytes: needed, last_used: stamp, pins: 0, filter });
        Ok(handle)
    }

    fn at_count_limit(&self) -> bool {
        self.max_entries.is_some_and(|max| self.entries.len() >= max)
    }

    /// A new entry can be admitted under the count cap after evicting unpinned ones
    fn count_admissible(&self) -> bool {
        match self.max_entries {
            None => true,
            Some(max) => self.entries.values().filter(|e| e.pins > 0).count() < max,
        }
    }

    /// Evict the least recently used unpinned entry
    fn evict_lru(&mut self, backend: &mut dyn RenderBackend) -> bool {
        let victim = self
            .entries
            .iter()
            .filter(|(_, e)| e.pins == 0)
            .min_by_key(|(k, e)| (e.last_used, **k))
            .map(|(k, _)| *k);
        match victim {
            Some(key) => {
                self.remove(backend, &key);
                self.stats.evictions += 1;
                log::trace!("Evicted {:?}", key);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, backend: &mut dyn RenderBackend, key: &TextureKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.budget.remove_gpu(entry.bytes);
            backend.destroy_texture(entry.handle);
        }
    }

    /// Drop one entry unless it is pinned
    pub fn evict(&mut self, backend: &mut dyn RenderBackend, key: &TextureKey) -> bool {
        match self.entries.get(key) {
            Some(e) if e.pins == 0 => {
                self.remove(backend, key);
                self.stats.evictions += 1;
                true
            }
            _ => false,
        }
    }

    /// Protect an entry from eviction while a draw references it
    pub fn pin(&mut self, key: &TextureKey) -> bool {
        match self.entries.get_mut(key) {
            Some(e) => {
                e.pins += 1;
                true
            }
            None => false,
        }
    }

    pub fn unpin(&mut self, key: &TextureKey) {
        if let Some(e) = self.entries.get_mut(key) {
            e.pins = e.pins.saturating_sub(1);
        }
    }

    pub fn is_pinned(&self, key: &TextureKey) -> bool {
        self.entries.get(key).is_some_and(|e| e.pins > 0)
    }

    /// Drop every unpinned entry of a volume, optionally keeping one level
    pub fn invalidate_volume(&mut self, backend: &mut dyn RenderBackend, volume: VolumeId, keep_level: Option<u32>) -> usize {
        let keys: Vec<TextureKey> = self
            .entries
            .iter()
            .filter(|(k, e)| {
                k.brick.volume == volume && Some(k.brick.level) != keep_level && e.pins == 0
            })
            .map(|(k, _)| *k)
            .collect();
        for key in &keys {
            self.remove(backend, key);
        }
        self.drawn.retain(|(k, _), _| k.volume != volume);
        keys.len()
    }

    /// Drop one component (e.g. a rewritten mask) of every brick of a volume
    pub fn invalidate_component(&mut self, backend: &mut dyn RenderBackend, volume: VolumeId, comp: Component) -> usize {
        let keys: Vec<TextureKey> = self
            .entries
            .iter()
            .filter(|(k, e)| k.brick.volume == volume && k.comp == comp && e.pins == 0)
            .map(|(k, _)| *k)
            .collect();
        for key in &keys {
            self.remove(backend, key);
        }
        keys.len()
    }

    /// Forget all residency state
    ///
    /// Texture objects are only destroyed by [`collect_garbage`](Self::collect_garbage),
    /// which callers run once no draw references them.
    pub fn clear_pool(&mut self) {
        let n = self.entries.len();
        self.graveyard.extend(self.entries.drain().map(|(_, e)| e.handle));
        self.budget.reset_gpu();
        self.drawn.clear();
        log::debug!("Cleared texture pool ({} textures pending destruction)", n);
    }

    /// Destroy textures released by `clear_pool`
    pub fn collect_garbage(&mut self, backend: &mut dyn RenderBackend) -> usize {
        let n = self.graveyard.len();
        for handle in self.graveyard.drain(..) {
            backend.destroy_texture(handle);
        }
        n
    }

    pub fn pending_garbage(&self) -> usize {
        self.graveyard.len()
    }

    // --- Drawn ledger ---

    /// Reset the drawn ledger at the start of an update loop
    pub fn begin_frame(&mut self) {
        self.drawn.clear();
    }

    /// Record or clear a brick as drawn in `pass`
    ///
    /// Returns false when marking a brick that was already drawn.
    pub fn set_drawn(&mut self, brick: BrickKey, pass: PassMode, drawn: bool) -> bool {
        self.set_drawn_in_layer(brick, 0, pass, drawn)
    }

    /// Same as [`set_drawn`](Self::set_drawn) for one depth-peeling layer
    pub fn set_drawn_in_layer(&mut self, brick: BrickKey, layer: u32, pass: PassMode, drawn: bool) -> bool {
        let set = self.drawn.entry((brick, layer)).or_default();
        if drawn {
            set.insert(pass)
        } else {
            set.remove(pass);
            true
        }
    }

    pub fn drawn(&self, brick: &BrickKey, pass: PassMode) -> bool {
        self.drawn_in_layer(brick, 0, pass)
    }

    pub fn drawn_in_layer(&self, brick: &BrickKey, layer: u32, pass: PassMode) -> bool {
        self.drawn.get(&(*brick, layer)).is_some_and(|s| s.contains(pass))
    }

    pub fn drawn_count(&self, pass: PassMode) -> usize {
        self.drawn.values().filter(|s| s.contains(pass)).count()
    }

    /// Exchange the active ledger with a caller's own
    ///
    /// Canvases running loops side by side each keep a ledger and swap it in
    /// for the duration of a burst.
    pub fn swap_ledger(&mut self, ledger: &mut DrawnLedger) {
        std::mem::swap(&mut self.drawn, ledger);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Error;
    use crate::core::types::UVec3;
    use crate::render::software::SoftwareBackend;
    use crate::volume::{BrickId, TexelFormat};

    fn key(i: u32) -> TextureKey {
        TextureKey::data(BrickKey::new(VolumeId(0), 0, BrickId(i)))
    }

    fn payload() -> Option<BrickPayload> {
        Some(BrickPayload {
            dims: UVec3::splat(2),
            format: TexelFormat::R8,
            bytes: vec![1; 8],
        })
    }

    fn load(cache: &mut BrickCache, backend: &mut SoftwareBackend, i: u32) -> std::result::Result<TextureHandle, CacheError> {
        cache.ensure_resident(backend, key(i), Filter::Nearest, || Ok(payload()))
    }

    #[test]
    fn test_hit_after_upload() {
        let mut backend = SoftwareBackend::new();
        let mut cache = BrickCache::new(1024);
        let a = load(&mut cache, &mut backend, 0).unwrap();
        let b = load(&mut cache, &mut backend, 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.stats().uploads, 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.resident_bytes(), 8);
    }

    #[test]
    fn test_lru_evicts_first_accessed() {
        let mut backend = SoftwareBackend::new();
        let capacity = 3;
        let mut cache = BrickCache::new(8 * capacity);
        for i in 0..=capacity as u32 {
            load(&mut cache, &mut backend, i).unwrap();
        }
        assert!(!cache.contains(&key(0)));
        assert!(cache.contains(&key(1)));
        assert_eq!(cache.stats().evictions, 1);

        load(&mut cache, &mut backend, 0).unwrap();
        assert_eq!(cache.stats().uploads, capacity + 2);
        assert_eq!(cache.stats().hits, 0);
        assert!(!cache.contains(&key(1)));
    }

    #[test]
    fn test_touch_refreshes_lru() {
        let mut backend = SoftwareBackend::new();
        let mut cache = BrickCache::new(16);
        load(&mut cache, &mut backend, 0).unwrap();
        load(&mut cache, &mut backend, 1).unwrap();
        load(&mut cache, &mut backend, 0).unwrap();
        load(&mut cache, &mut backend, 2).unwrap();
        assert!(cache.contains(&key(0)));
        assert!(!cache.contains(&key(1)));
    }

    #[test]
    fn test_pinned_entries_survive() {
        let mut backend = SoftwareBackend::new();
        let mut cache = BrickCache::new(8).with_max_entries(1);
        load(&mut cache, &mut backend, 0).unwrap();
        assert!(cache.pin(&key(0)));
        let err = load(&mut cache, &mut backend, 1).unwrap_err();
        assert!(matches!(err, CacheError::ResourceExhausted { needed: 8, .. }));
        assert!(cache.contains(&key(0)));

        cache.unpin(&key(0));
        load(&mut cache, &mut backend, 1).unwrap();
        assert!(!cache.contains(&key(0)));
    }

    #[test]
    fn test_lowering_limit_evicts_down_to_it() {
        let mut backend = SoftwareBackend::new();
        let mut cache = BrickCache::new(64);
        for i in 0..4 {
            load(&mut cache, &mut backend, i).unwrap();
        }
        load(&mut cache, &mut backend, 0).unwrap();

        assert_eq!(cache.set_limit(&mut backend, 8), 3);
        assert_eq!(cache.resident_bytes(), 8);
        assert!(cache.contains(&key(0)));
        assert_eq!(backend.texture_count(), 1);

        load(&mut cache, &mut backend, 0).unwrap();
        assert!(cache.resident_bytes() <= cache.budget().gpu_limit());
    }

    #[test]
    fn test_lowering_limit_keeps_pinned() {
        let mut backend = SoftwareBackend::new();
        let mut cache = BrickCache::new(64);
        load(&mut cache, &mut backend, 0).unwrap();
        load(&mut cache, &mut backend, 1).unwrap();
        cache.pin(&key(0));
        cache.pin(&key(1));
        assert_eq!(cache.set_limit(&mut backend, 8), 0);
        assert_eq!(cache.len(), 2);

        cache.unpin(&key(1));
        assert_eq!(cache.set_limit(&mut backend, 8), 1);
        assert!(cache.contains(&key(0)));
        assert_eq!(cache.resident_bytes(), 8);
    }

    #[test]
    fn test_oversized_brick_fails_without_evicting() {
        let mut backend = SoftwareBackend::new();
        let mut cache = BrickCache::new(4);
        let err = load(&mut cache, &mut backend, 0).unwrap_err();
        assert!(matches!(err, CacheError::ResourceExhausted { .. }));
        assert_eq!(cache.stats().failures, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_deferred_and_failed_fetch() {
        let mut backend = SoftwareBackend::new();
        let mut cache = BrickCache::new(64);
        let deferred = cache.ensure_resident(&mut backend, key(0), Filter::Linear, || Ok(None));
        assert_eq!(deferred, Err(CacheError::Deferred));
        let failed = cache.ensure_resident(&mut backend, key(0), Filter::Linear, || {
            Err(Error::Decode("corrupt".into()))
        });
        assert!(matches!(failed, Err(CacheError::Upload(_))));
        // Not cached as failed: a later fetch succeeds.
        load(&mut cache, &mut backend, 0).unwrap();
    }

    #[test]
    fn test_clear_pool_defers_destruction() {
        let mut backend = SoftwareBackend::new();
        let mut cache = BrickCache::new(64);
        load(&mut cache, &mut backend, 0).unwrap();
        load(&mut cache, &mut backend, 1).unwrap();
        cache.clear_pool();
        assert!(cache.is_empty());
        assert_eq!(backend.texture_count(), 2);
        assert_eq!(cache.collect_garbage(&mut backend), 2);
        assert_eq!(backend.texture_count(), 0);
    }

    #[test]
    fn test_invalidate_volume_keeps_level() {
        let mut backend = SoftwareBackend::new();
        let mut cache = BrickCache::new(64);
        let l0 = TextureKey::data(BrickKey::new(VolumeId(1), 0, BrickId(0)));
        let l1 = TextureKey::data(BrickKey::new(VolumeId(1), 1, BrickId(0)));
        for k in [l0, l1] {
            cache.ensure_resident(&mut backend, k, Filter::Linear, || Ok(payload())).unwrap();
        }
        assert_eq!(cache.invalidate_volume(&mut backend, VolumeId(1), Some(1)), 1);
        assert!(cache.contains(&l1));
        assert!(!cache.contains(&l0));
    }

    #[test]
    fn test_swapped_ledgers_stay_separate() {
        let mut cache = BrickCache::new(1024);
        let b = BrickKey::new(VolumeId(1), 0, BrickId(0));
        let mut other = DrawnLedger::new();
        cache.set_drawn(b, PassMode::Color, true);
        cache.swap_ledger(&mut other);
        assert!(!cache.drawn(&b, PassMode::Color));
        assert_eq!(other.len(), 1);
        cache.swap_ledger(&mut other);
        assert!(cache.drawn(&b, PassMode::Color));
        assert!(other.is_empty());
    }

    #[test]
    fn test_drawn_ledger() {
        let mut cache = BrickCache::new(64);
        let b = key(3).brick;
        assert!(!cache.drawn(&b, PassMode::Color));
        assert!(cache.set_drawn(b, PassMode::Color, true));
        assert!(!cache.set_drawn(b, PassMode::Color, true));
        assert!(!cache.drawn(&b, PassMode::Shadow));
        assert_eq!(cache.drawn_count(PassMode::Color), 1);
        assert!(!cache.drawn_in_layer(&b, 1, PassMode::Color));
        assert!(cache.set_drawn_in_layer(b, 1, PassMode::Color, true));
        cache.begin_frame();
        assert!(!cache.drawn(&b, PassMode::Color));
    }
}
