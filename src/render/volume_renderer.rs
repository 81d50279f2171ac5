//! Single-volume brick renderer
//!
//! Draws the bricks of one volume for one pass, one brick per loader item.
//! A brick is skipped when it is known empty, rejected by the clip planes or
//! already drawn in this pass and peeling layer; otherwise it is made
//! resident through [`BrickResidency`] and ray-marched into the pass target.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{Error, Result};
use crate::core::types::Vec3;
use crate::math::ClipPlanes;
use crate::streaming::{
    load_brick, BrickCache, BrickPrefetcher, CacheError, ItemOutcome, PrefetchResult, RangeFetcher,
    StagingCache, TextureKey,
};
use crate::volume::{
    Brick, BrickId, BrickKey, BrickPayload, BrickSourcePath, Component, PassMode, Volume,
};
use super::backend::{BlendMode, DrawParams, PeelWindow, RenderBackend, TargetHandle, TextureHandle};
use super::transfer::{MaskMode, RenderMode};
use super::view::FrameView;

/// Everything needed to turn a brick id into a resident texture
pub struct BrickResidency<'a> {
    pub backend: &'a mut dyn RenderBackend,
    pub cache: &'a mut BrickCache,
    pub staging: &'a mut StagingCache,
    pub prefetcher: Option<&'a mut BrickPrefetcher>,
    pub fetcher: &'a dyn RangeFetcher,
    /// Bricks whose bytes failed to load in the current loop
    pub failed: &'a mut HashMap<BrickKey, String>,
}

impl BrickResidency<'_> {
    /// Resident texture for one component of one brick
    ///
    /// In-memory bricks are extracted and uploaded at once. Streamed bricks
    /// come from the staging cache, a synchronous read, or, when a prefetcher
    /// is attached, a background read that yields [`CacheError::Deferred`]
    /// until it lands.
    pub fn texture(&mut self, volume: &Volume, brick: BrickId, comp: Component) -> std::result::Result<TextureHandle, CacheError> {
        let key = TextureKey::new(volume.key(brick), comp);
        let Self { backend, cache, staging, prefetcher, fetcher, failed } = self;
        cache.ensure_resident(&mut **backend, key, volume.filter, || {
            fetch_payload(volume, brick, comp, staging, prefetcher.as_deref_mut(), *fetcher, failed)
        })
    }

    /// Move finished background reads into the staging cache
    pub fn drain_prefetched(&mut self) -> usize {
        let Some(prefetcher) = self.prefetcher.as_deref_mut() else { return 0 };
        let mut landed = 0;
        for result in prefetcher.poll_results() {
            match result {
                PrefetchResult::Loaded(key, payload) => {
                    if self.staging.insert(key, payload) {
                        landed += 1;
                    }
                }
                PrefetchResult::Failed(key, reason) => {
                    log::warn!("Prefetch of {:?} failed: {}", key, reason);
                    self.failed.insert(key, reason);
                }
            }
        }
        landed
    }

    /// Queue background reads for streamed bricks in draw order
    pub fn prefetch(&mut self, volume: &Volume, bricks: &[BrickId]) -> usize {
        let Some(prefetcher) = self.prefetcher.as_deref_mut() else { return 0 };
        let format = volume.descriptor().bit_depth.texel_format();
        let mut queued = 0;
        for (rank, &id) in bricks.iter().enumerate() {
            let key = volume.key(id);
            if self.staging.contains(&key) || self.cache.contains(&TextureKey::data(key)) {
                continue;
            }
            let (Some(brick), Ok(Some(location))) = (volume.catalog().get(id), volume.file_location(id)) else {
                continue;
            };
            if !matches!(location.source, BrickSourcePath::File(_)) {
                continue;
            }
            if prefetcher.request(key, location, brick.size(), format, -(rank as f32)) {
                queued += 1;
            }
        }
        queued
    }
}

fn fetch_payload(
    volume: &Volume,
    brick: BrickId,
    comp: Component,
    staging: &mut StagingCache,
    prefetcher: Option<&mut BrickPrefetcher>,
    fetcher: &dyn RangeFetcher,
    failed: &HashMap<BrickKey, String>,
) -> Result<Option<BrickPayload>> {
    if let Some(payload) = volume.fetch(brick, comp)? {
        return Ok(Some(payload));
    }
    let key = volume.key(brick);
    if let Some(payload) = staging.get(&key) {
        return Ok(Some(payload.as_ref().clone()));
    }
    if let Some(reason) = failed.get(&key) {
        return Err(Error::Streaming(reason.clone()));
    }
    let location = volume
        .file_location(brick)?
        .ok_or_else(|| Error::Streaming(format!("brick {:?} has no file location", key)))?;
    let dims = volume
        .catalog()
        .get(brick)
        .map(Brick::size)
        .ok_or_else(|| Error::Streaming(format!("brick {:?} not in catalog", key)))?;
    let format = volume.descriptor().bit_depth.texel_format();

    if let Some(prefetcher) = prefetcher {
        if matches!(location.source, BrickSourcePath::File(_)) {
            prefetcher.request(key, location, dims, format, f32::MAX);
            return Ok(None);
        }
    }
    let payload = load_brick(fetcher, &location, dims, format)?;
    staging.insert(key, Arc::new(payload.clone()));
    Ok(Some(payload))
}

/// Where one item of a pass is drawn
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PassTarget {
    pub target: TargetHandle,
    /// Depth-peeling layer of the item
    pub layer: u32,
    pub peel: Option<PeelWindow>,
}

/// Draws the bricks of one volume
pub struct VolumeRenderer;

impl VolumeRenderer {
    /// True when a brick can contribute to the view at all
    pub fn is_visible(brick: &Brick, clip: &ClipPlanes, view: &FrameView) -> bool {
        brick.priority() == 0 && !clip.rejects(brick.bbox()) && view.sees(brick.bbox())
    }

    /// Bricks to draw for this view, in compositing order
    ///
    /// With a quota, only the `quota.1` visible bricks nearest to `quota.0`
    /// are returned.
    pub fn required_bricks(volume: &mut Volume, view: &FrameView, quota: Option<(Vec3, usize)>) -> Vec<BrickId> {
        let clip = volume.clip.clone();
        let skip_empty = volume.skip_empty();
        let catalog = volume.catalog_mut();
        match quota {
            Some((center, count)) => catalog
                .closest_bricks(center, count, skip_empty, &view.view_ray, view.orthographic, view.order, |b| {
                    Self::is_visible(b, &clip, view)
                })
                .to_vec(),
            None => {
                let sorted = catalog.sorted_bricks(&view.view_ray, view.orthographic, view.order).to_vec();
                sorted
                    .into_iter()
                    .filter(|id| catalog.get(*id).is_some_and(|b| Self::is_visible(b, &clip, view)))
                    .collect()
            }
        }
    }

    /// Passes a volume needs beyond plain color, in draw order
    pub fn passes(volume: &Volume) -> Vec<PassMode> {
        let mut passes = vec![PassMode::Color];
        if volume.mode == RenderMode::Mip && volume.shading.is_some() {
            passes.push(PassMode::Shading);
        }
        if volume.shadow.is_some() {
            passes.push(PassMode::Shadow);
        }
        let mask_comp = match volume.mask_mode {
            MaskMode::Off => None,
            MaskMode::Mask => Some(Component::Mask),
            MaskMode::Label => Some(Component::Label),
        };
        if mask_comp.is_some_and(|c| volume.has_component(c)) {
            passes.push(PassMode::Mask);
        }
        passes
    }

    /// Sample distance and the distance opacities are defined at
    pub fn step(volume: &Volume, view: &FrameView) -> (f32, f32) {
        let base = volume.descriptor().spacing.min_element().max(1e-6);
        let rate = (view.sample_rate * volume.sample_rate).max(0.01);
        (base / rate, base)
    }

    /// Uniforms for drawing `volume` in `pass`
    pub fn draw_params(volume: &Volume, view: &FrameView, pass: PassMode, peel: Option<PeelWindow>) -> DrawParams {
        let (step, base_step) = Self::step(volume, view);
        let blend = match pass {
            PassMode::Color if volume.mode == RenderMode::Mip => BlendMode::Max,
            PassMode::Color => view.blend(),
            PassMode::Shading => BlendMode::Multiply,
            PassMode::Shadow => BlendMode::Replace,
            PassMode::Mask => BlendMode::Over,
        };
        let shading = match (pass, volume.mode) {
            (PassMode::Color, RenderMode::Over) | (PassMode::Shading, _) => volume.shading,
            _ => None,
        };
        DrawParams {
            view_proj: view.view_proj,
            inv_view_proj: view.inv_view_proj,
            step,
            base_step,
            pass,
            mode: volume.mode,
            mask_mode: volume.mask_mode,
            shading,
            light_dir: view.light_dir,
            fog: if pass == PassMode::Color { view.fog } else { None },
            clip: volume.clip.clone(),
            peel,
            blend,
        }
    }

    /// Draw one brick in one pass
    pub fn draw_brick(
        residency: &mut BrickResidency<'_>,
        volume: &Volume,
        view: &FrameView,
        brick: BrickId,
        pass: PassMode,
        target: PassTarget,
    ) -> ItemOutcome {
        let Some(b) = volume.catalog().get(brick) else {
            return ItemOutcome::Failed(format!("brick {:?} not in volume {:?}", brick, volume.id()));
        };
        let key = volume.key(brick);
        // Clip rejection comes before residency so rejected bricks are never uploaded.
        if b.priority() > 0 || volume.clip.rejects(b.bbox()) {
            return ItemOutcome::Skipped;
        }
        if residency.cache.drawn_in_layer(&key, target.layer, pass) {
            return ItemOutcome::Skipped;
        }

        let data = match residency.texture(volume, brick, Component::Data) {
            Ok(h) => h,
            Err(CacheError::Deferred) => return ItemOutcome::Deferred,
            Err(CacheError::ResourceExhausted { needed, limit }) => {
                log::warn!("Skipping brick {:?}: needs {} bytes, {} reclaimable", key, needed, limit);
                return ItemOutcome::Skipped;
            }
            Err(CacheError::Upload(reason)) => return ItemOutcome::Failed(reason),
        };

        let mask = if pass == PassMode::Mask {
            let comp = match volume.mask_mode {
                MaskMode::Label => Component::Label,
                _ => Component::Mask,
            };
            let data_key = TextureKey::data(key);
            residency.cache.pin(&data_key);
            let mask = residency.texture(volume, brick, comp);
            residency.cache.unpin(&data_key);
            match mask {
                Ok(h) => Some(h),
                Err(CacheError::Deferred) => return ItemOutcome::Deferred,
                Err(CacheError::ResourceExhausted { .. }) => return ItemOutcome::Skipped,
                Err(CacheError::Upload(reason)) => return ItemOutcome::Failed(reason),
            }
        } else {
            None
        };

        let draw = volume.brick_draw(b, data, mask);
        let params = Self::draw_params(volume, view, pass, target.peel);
        if let Err(e) = residency.backend.draw_bricks(target.target, &[draw], &params) {
            return ItemOutcome::Failed(e.to_string());
        }
        residency.cache.set_drawn_in_layer(key, target.layer, pass, true);
        ItemOutcome::Completed
    }
}
