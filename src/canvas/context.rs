//! Resources shared by every canvas of a host

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::Result;
use crate::render::backend::{RenderBackend, Viewport};
use crate::render::software::SoftwareBackend;
use crate::render::target::RenderTargetPool;
use crate::render::RenderConfig;
use crate::settings::Settings;
use crate::streaming::{
    BrickCache, BrickPrefetcher, CanvasId, FileFetcher, RangeFetcher, StagingCache, StreamingConfig, StreamingSlot,
};
use crate::volume::VolumeId;

/// Backend, residency caches and streaming token shared by all canvases
///
/// Every canvas keeps its own render-target pool here, keyed by its id,
/// so two canvases never share a frame buffer.
pub struct RendererContext {
    pub backend: Box<dyn RenderBackend>,
    pub cache: BrickCache,
    pub staging: StagingCache,
    pub prefetcher: Option<BrickPrefetcher>,
    pub fetcher: Arc<dyn RangeFetcher>,
    pub slot: StreamingSlot,
    pub streaming: StreamingConfig,
    pub render: RenderConfig,
    pub(crate) pools: HashMap<CanvasId, RenderTargetPool>,
    /// Pools of closed canvases that still had guarded targets
    retired: Vec<RenderTargetPool>,
    next_canvas: u64,
}

impl RendererContext {
    pub fn new(backend: Box<dyn RenderBackend>, settings: &Settings) -> Result<Self> {
        let streaming = settings.streaming.clone();
        let prefetcher = match streaming.prefetch_workers {
            0 => None,
            n => Some(BrickPrefetcher::new(n)?),
        };
        log::info!(
            "Renderer context on {} backend (GPU limit {} MiB, {} prefetch workers)",
            backend.name(),
            streaming.gpu_memory_limit / (1024 * 1024),
            streaming.prefetch_workers
        );
        Ok(Self {
            backend,
            cache: BrickCache::new(streaming.gpu_memory_limit),
            staging: StagingCache::new(streaming.main_memory_buffer),
            prefetcher,
            fetcher: Arc::new(FileFetcher),
            slot: StreamingSlot::new(),
            render: settings.render.clone(),
            streaming,
            pools: HashMap::new(),
            retired: Vec::new(),
            next_canvas: 0,
        })
    }

    /// Context on the CPU reference backend
    pub fn software(settings: &Settings) -> Result<Self> {
        Self::new(Box::new(SoftwareBackend::new()), settings)
    }

    /// Context on a headless wgpu device
    pub fn wgpu(settings: &Settings) -> Result<Self> {
        let backend = pollster::block_on(crate::render::gpu::WgpuBackend::new())?;
        Self::new(Box::new(backend), settings)
    }

    /// Replace the reader used for bricks outside local files
    pub fn with_fetcher(mut self, fetcher: Arc<dyn RangeFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Apply changed settings, shrinking both caches to their new limits
    pub fn apply_settings(&mut self, settings: &Settings) {
        let evicted = self.cache.set_limit(self.backend.as_mut(), settings.streaming.gpu_memory_limit);
        self.staging.set_limit(settings.streaming.main_memory_buffer);
        if evicted > 0 {
            log::debug!("Evicted {} textures after lowering the GPU limit", evicted);
        }
        self.streaming = settings.streaming.clone();
        self.render = settings.render.clone();
    }

    pub fn backend(&self) -> &dyn RenderBackend {
        self.backend.as_ref()
    }

    pub(crate) fn register_canvas(&mut self, viewport: Viewport) -> CanvasId {
        let id = CanvasId(self.next_canvas);
        self.next_canvas += 1;
        self.pools.insert(id, RenderTargetPool::new(viewport));
        id
    }

    /// Release a closed canvas's targets and its streaming slot
    ///
    /// Targets still guarded by a running loop are destroyed by
    /// [`collect_garbage`](Self::collect_garbage) once released.
    pub fn close_canvas(&mut self, id: CanvasId) {
        if let Some(mut pool) = self.pools.remove(&id) {
            pool.clear(self.backend.as_mut());
            if !pool.is_empty() {
                log::warn!("Canvas {:?} closed with {} render targets in use", id, pool.len());
                self.retired.push(pool);
            }
        }
        self.slot.release(id);
    }

    pub fn canvas_count(&self) -> usize {
        self.pools.len()
    }

    /// Drop every resident brick of a volume, e.g. when its dataset is replaced
    pub fn remove_volume(&mut self, volume: VolumeId) -> usize {
        self.staging.invalidate_volume(volume);
        self.cache.invalidate_volume(self.backend.as_mut(), volume, None)
    }

    /// Release the whole texture pool; textures are destroyed by [`collect_garbage`](Self::collect_garbage)
    pub fn clear_pool(&mut self) {
        self.cache.clear_pool();
        self.staging.clear();
    }

    /// Destroy released textures and retired render targets; call where no draw is in flight
    pub fn collect_garbage(&mut self) -> usize {
        let backend = self.backend.as_mut();
        let mut destroyed = self.cache.collect_garbage(backend);
        self.retired.retain_mut(|pool| {
            destroyed += pool.clear(backend);
            !pool.is_empty()
        });
        destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.streaming.prefetch_workers = 0;
        settings
    }

    #[test]
    fn test_canvases_get_their_own_pools() {
        let mut ctx = RendererContext::software(&settings()).unwrap();
        let a = ctx.register_canvas(Viewport::new(4, 4));
        let b = ctx.register_canvas(Viewport::new(8, 8));
        assert_ne!(a, b);
        assert_eq!(ctx.canvas_count(), 2);
        assert_eq!(ctx.pools[&b].viewport(), Viewport::new(8, 8));

        assert!(ctx.slot.try_acquire(a));
        ctx.close_canvas(a);
        assert_eq!(ctx.canvas_count(), 1);
        assert_eq!(ctx.slot.holder(), None);
    }

    #[test]
    fn test_prefetcher_follows_worker_count() {
        assert!(RendererContext::software(&settings()).unwrap().prefetcher.is_none());
        let mut with_workers = settings();
        with_workers.streaming.prefetch_workers = 1;
        assert!(RendererContext::software(&with_workers).unwrap().prefetcher.is_some());
    }

    #[test]
    fn test_remove_volume_drops_its_textures() {
        use crate::core::types::UVec3;
        use crate::render::backend::Filter;
        use crate::streaming::TextureKey;
        use crate::volume::{BrickId, BrickKey, BrickPayload, TexelFormat};

        let mut ctx = RendererContext::software(&settings()).unwrap();
        let payload = BrickPayload { dims: UVec3::splat(2), format: TexelFormat::R8, bytes: vec![1; 8] };
        let kept = TextureKey::data(BrickKey::new(VolumeId(2), 0, BrickId(0)));
        for key in [TextureKey::data(BrickKey::new(VolumeId(1), 0, BrickId(0))), kept] {
            let p = payload.clone();
            ctx.cache
                .ensure_resident(ctx.backend.as_mut(), key, Filter::Nearest, || Ok(Some(p)))
                .unwrap();
        }
        assert_eq!(ctx.remove_volume(VolumeId(1)), 1);
        assert_eq!(ctx.cache.len(), 1);
        assert!(ctx.cache.lookup(&kept).is_some());
    }

    #[test]
    fn test_closed_canvas_keeps_guarded_targets_until_released() {
        use crate::render::backend::TargetFormat;
        use crate::render::target::RenderTargetKind;

        let mut ctx = RendererContext::software(&settings()).unwrap();
        let id = ctx.register_canvas(Viewport::new(4, 4));
        let pool = ctx.pools.get_mut(&id).unwrap();
        pool.acquire(ctx.backend.as_mut(), RenderTargetKind::Channel, TargetFormat::Rgba32F).unwrap();
        pool.acquire(ctx.backend.as_mut(), RenderTargetKind::Final, TargetFormat::Rgba32F).unwrap();
        let guard = pool.protect(RenderTargetKind::Channel).unwrap();

        ctx.close_canvas(id);
        assert_eq!(ctx.canvas_count(), 0);
        assert_eq!(ctx.retired.len(), 1);
        assert_eq!(ctx.collect_garbage(), 0);

        drop(guard);
        assert_eq!(ctx.collect_garbage(), 1);
        assert!(ctx.retired.is_empty());
    }

    #[test]
    fn test_apply_settings_updates_limit() {
        let mut ctx = RendererContext::software(&settings()).unwrap();
        let mut changed = settings();
        changed.streaming.gpu_memory_limit = 4096;
        ctx.apply_settings(&changed);
        assert_eq!(ctx.cache.budget().gpu_limit(), 4096);
        assert_eq!(ctx.streaming.gpu_memory_limit, 4096);
    }
}
