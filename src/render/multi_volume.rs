//! Depth-interleaved rendering of several volumes
//!
//! The bricks of every participating volume are merged into one list
//! ordered by view depth and grouped into slabs of overlapping depth range.
//! Each slab is ray-marched in a single draw so samples of different volumes
//! blend in true depth order.

use crate::core::types::Vec3;
use crate::streaming::{share_quota, CacheError, ItemOutcome, TextureKey};
use crate::volume::{BrickKey, Component, PassMode, UpdateOrder, Volume};
use super::backend::BrickDraw;
use super::config::MixMethod;
use super::view::FrameView;
use super::volume_renderer::{BrickResidency, PassTarget, VolumeRenderer};

/// One brick placed in the global depth order
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SlabBrick {
    pub key: BrickKey,
    pub near: f32,
    pub far: f32,
}

/// Bricks whose depth ranges overlap, drawn together
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Slab {
    pub bricks: Vec<SlabBrick>,
    pub near: f32,
    pub far: f32,
}

impl Slab {
    pub fn len(&self) -> usize {
        self.bricks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bricks.is_empty()
    }
}

pub struct MultiVolumeRenderer;

impl MultiVolumeRenderer {
    /// Interleaving only applies to two or more volumes in `Multi` mode
    pub fn engaged(mix: MixMethod, volume_count: usize) -> bool {
        mix == MixMethod::Multi && volume_count >= 2
    }

    /// Globally ordered brick list of all volumes
    ///
    /// With a quota, each volume gets a share proportional to `weights`
    /// and leftover budget goes to volumes that still have bricks.
    pub fn ordered_bricks(volumes: &mut [&mut Volume], view: &FrameView, quota: Option<(Vec3, usize)>, weights: &[f32]) -> Vec<SlabBrick> {
        let mut lists: Vec<(usize, Vec<crate::volume::BrickId>)> = volumes
            .iter_mut()
            .enumerate()
            .map(|(i, v)| (i, VolumeRenderer::required_bricks(v, view, None)))
            .collect();

        if let Some((center, total)) = quota {
            let available: Vec<usize> = lists.iter().map(|(_, l)| l.len()).collect();
            let mut w = weights.to_vec();
            w.resize(volumes.len(), 1.0);
            let shares = share_quota(total, &w, &available);
            log::debug!("Multi-volume quota {} shared as {:?}", total, shares);
            for ((i, list), share) in lists.iter_mut().zip(shares) {
                *list = VolumeRenderer::required_bricks(&mut *volumes[*i], view, Some((center, share)));
            }
        }

        let mut all: Vec<SlabBrick> = Vec::new();
        for (i, list) in lists {
            let volume = &volumes[i];
            for id in list {
                let Some(brick) = volume.catalog().get(id) else { continue };
                let (near, far) = view.depth_range(brick.bbox());
                all.push(SlabBrick { key: volume.key(id), near, far });
            }
        }
        all.sort_by(|a, b| {
            let by_depth = match view.order {
                UpdateOrder::FrontToBack => a.near.total_cmp(&b.near),
                UpdateOrder::BackToFront => b.far.total_cmp(&a.far),
            };
            by_depth.then(a.key.cmp(&b.key))
        });
        all.dedup_by_key(|b| b.key);
        all
    }

    /// Group an ordered brick list into slabs of overlapping depth
    pub fn slabs(ordered: &[SlabBrick], order: UpdateOrder) -> Vec<Slab> {
        let mut slabs: Vec<Slab> = Vec::new();
        for &b in ordered {
            let joins = slabs.last().is_some_and(|s| match order {
                UpdateOrder::FrontToBack => b.near < s.far,
                UpdateOrder::BackToFront => b.far > s.near,
            });
            match slabs.last_mut() {
                Some(slab) if joins => {
                    slab.near = slab.near.min(b.near);
                    slab.far = slab.far.max(b.far);
                    slab.bricks.push(b);
                }
                _ => slabs.push(Slab { bricks: vec![b], near: b.near, far: b.far }),
            }
        }
        slabs
    }

    /// Draw one slab into the shared target
    ///
    /// Uniforms other than the sample step come from the first volume of the
    /// slab. Every brick stays pinned until the draw is issued.
    pub fn draw_slab(residency: &mut BrickResidency<'_>, volumes: &[&Volume], view: &FrameView, slab: &Slab, target: PassTarget) -> ItemOutcome {
        let mut pinned: Vec<TextureKey> = Vec::with_capacity(slab.len());
        let mut draws: Vec<BrickDraw> = Vec::with_capacity(slab.len());
        let mut keys: Vec<BrickKey> = Vec::with_capacity(slab.len());
        let mut lead: Option<&Volume> = None;
        let mut step = f32::MAX;
        let mut deferred = false;

        for sb in &slab.bricks {
            let Some(volume) = volumes.iter().copied().find(|v| v.id() == sb.key.volume) else { continue };
            let Some(brick) = volume.catalog().get(sb.key.brick) else { continue };
            if brick.priority() > 0
                || volume.clip.rejects(brick.bbox())
                || residency.cache.drawn_in_layer(&sb.key, target.layer, PassMode::Color)
            {
                continue;
            }
            match residency.texture(volume, sb.key.brick, Component::Data) {
                Ok(handle) => {
                    let tk = TextureKey::data(sb.key);
                    residency.cache.pin(&tk);
                    pinned.push(tk);
                    draws.push(volume.brick_draw(brick, handle, None));
                    keys.push(sb.key);
                    step = step.min(VolumeRenderer::step(volume, view).0);
                    lead.get_or_insert(volume);
                }
                Err(CacheError::Deferred) => deferred = true,
                Err(CacheError::ResourceExhausted { needed, limit }) => {
                    log::warn!("Skipping slab brick {:?}: needs {} bytes, {} reclaimable", sb.key, needed, limit);
                }
                Err(CacheError::Upload(reason)) => {
                    log::warn!("Slab brick {:?} failed: {}", sb.key, reason);
                }
            }
        }

        let outcome = if deferred {
            ItemOutcome::Deferred
        } else if let Some(volume) = lead {
            let mut params = VolumeRenderer::draw_params(volume, view, PassMode::Color, target.peel);
            params.step = step;
            match residency.backend.draw_bricks(target.target, &draws, &params) {
                Ok(()) => {
                    for key in &keys {
                        residency.cache.set_drawn_in_layer(*key, target.layer, PassMode::Color, true);
                    }
                    ItemOutcome::Completed
                }
                Err(e) => ItemOutcome::Failed(e.to_string()),
            }
        } else {
            ItemOutcome::Skipped
        };

        for tk in &pinned {
            residency.cache.unpin(tk);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use crate::core::Camera;
    use crate::core::types::UVec3;
    use crate::render::backend::{BlendMode, RenderBackend, TargetFormat, Viewport};
    use crate::render::software::SoftwareBackend;
    use crate::streaming::{BrickCache, FileFetcher, StagingCache};
    use crate::volume::{BitDepth, BrickId, BrickLayout, VolumeData, VolumeDescriptor, VolumeId};

    const VP: Viewport = Viewport { width: 12, height: 12 };

    /// Two bricks along z, one voxel layer overlapping
    fn volume(id: u32, value: u16) -> Volume {
        let desc = VolumeDescriptor::new(UVec3::new(4, 4, 7), Vec3::splat(0.25), BitDepth::U8);
        let data = VolumeData::from_fn(desc, |_| value).unwrap();
        let layout = BrickLayout { max_brick_size: 4, ..Default::default() };
        Volume::from_data(VolumeId(id), format!("v{}", id), Arc::new(data), &layout, false)
    }

    fn view() -> FrameView {
        let camera = Camera::orthographic(Vec3::new(0.5, 0.5, 6.0), Vec3::new(0.5, 0.5, 0.0), Vec3::Y, 1.0);
        FrameView::new(&camera, VP, UpdateOrder::FrontToBack)
    }

    #[test]
    fn test_bypassed_for_single_volume() {
        assert!(!MultiVolumeRenderer::engaged(MixMethod::Multi, 1));
        assert!(!MultiVolumeRenderer::engaged(MixMethod::Composite, 3));
        assert!(MultiVolumeRenderer::engaged(MixMethod::Multi, 2));
    }

    #[test]
    fn test_global_order_interleaves_volumes() {
        let view = view();
        let mut a = volume(1, 10);
        let mut b = volume(2, 10);
        let mut vols = vec![&mut a, &mut b];
        let ordered = MultiVolumeRenderer::ordered_bricks(&mut vols, &view, None, &[]);
        assert_eq!(ordered.len(), 4);
        assert!(ordered.windows(2).all(|w| w[0].near <= w[1].near));
        // Coincident volumes: the nearest brick of each comes before either far brick.
        let first_two: Vec<u32> = ordered[..2].iter().map(|b| b.key.volume.0).collect();
        assert_eq!(first_two, vec![1, 2]);

        let slabs = MultiVolumeRenderer::slabs(&ordered, view.order);
        let total: usize = slabs.iter().map(Slab::len).sum();
        assert_eq!(total, 4);
        assert!(slabs.iter().all(|s| {
            let vols: std::collections::HashSet<_> = s.bricks.iter().map(|b| b.key.volume).collect();
            vols.len() == 2
        }));
    }

    #[test]
    fn test_quota_shared_fairly() {
        let view = view();
        let mut a = volume(1, 10);
        let mut b = volume(2, 10);
        let mut vols = vec![&mut a, &mut b];
        let ordered = MultiVolumeRenderer::ordered_bricks(&mut vols, &view, Some((Vec3::ZERO, 2)), &[1.0, 1.0]);
        assert_eq!(ordered.len(), 2);
        assert_ne!(ordered[0].key.volume, ordered[1].key.volume);
    }

    #[test]
    fn test_slab_grouping_splits_disjoint_ranges() {
        let brick = |i: u32, near: f32, far: f32| SlabBrick {
            key: BrickKey::new(VolumeId(0), 0, BrickId(i)),
            near,
            far,
        };
        let ordered = vec![brick(0, 0.0, 1.0), brick(1, 0.5, 1.5), brick(2, 2.0, 3.0)];
        let slabs = MultiVolumeRenderer::slabs(&ordered, UpdateOrder::FrontToBack);
        assert_eq!(slabs.len(), 2);
        assert_eq!(slabs[0].len(), 2);
        assert_eq!((slabs[0].near, slabs[0].far), (0.0, 1.5));
    }

    #[test]
    fn test_slab_draw_marks_all_bricks() {
        let view = view();
        let mut a = volume(1, 120);
        let mut b = volume(2, 60);
        let ordered = {
            let mut vols = vec![&mut a, &mut b];
            MultiVolumeRenderer::ordered_bricks(&mut vols, &view, None, &[])
        };
        let slabs = MultiVolumeRenderer::slabs(&ordered, view.order);

        let mut backend = SoftwareBackend::new();
        let mut cache = BrickCache::new(1 << 20);
        let mut staging = StagingCache::new(0);
        let mut failed = HashMap::new();
        let target = backend.create_target(VP, TargetFormat::Rgba32F).unwrap();
        let mut res = BrickResidency {
            backend: &mut backend,
            cache: &mut cache,
            staging: &mut staging,
            prefetcher: None,
            fetcher: &FileFetcher,
            failed: &mut failed,
        };
        let vols = [&a, &b];
        let pt = PassTarget { target, layer: 0, peel: None };
        for slab in &slabs {
            assert_eq!(MultiVolumeRenderer::draw_slab(&mut res, &vols, &view, slab, pt), ItemOutcome::Completed);
        }
        for sb in &ordered {
            assert!(res.cache.drawn(&sb.key, PassMode::Color));
            assert!(!res.cache.is_pinned(&TextureKey::data(sb.key)));
        }
        // Drawing the same slab again changes nothing.
        assert_eq!(MultiVolumeRenderer::draw_slab(&mut res, &vols, &view, &slabs[0], pt), ItemOutcome::Skipped);
        assert_eq!(backend.draw_count(), slabs.len() as u64);
        let pixels = backend.read_target(target).unwrap();
        assert!(pixels[6 * 12 + 6][3] > 0.0);
        assert_eq!(VolumeRenderer::draw_params(&a, &view, PassMode::Color, None).blend, BlendMode::Under);
    }
}
