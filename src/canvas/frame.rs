//! Render targets and compositing of one update loop
//!
//! A loop renders into `layers` peeling layers. Volumes accumulate in the
//! channel target, which is flushed into the layer target whenever the
//! loop moves on to another volume or layer. Mesh surfaces are peeled into
//! per-layer color and depth targets up front. [`FramePlan::compose_scene`]
//! folds everything front to back into the scene target.
//!
//! Every target of a plan stays guarded in its pool until the loop finishes
//! or is cancelled, so nothing resizes or destroys it mid-frame.

use crate::core::Result;
use crate::render::backend::{BlendMode, PeelWindow, RenderBackend, TargetFormat, TargetHandle, FAR_DEPTH};
use crate::render::config::MixMethod;
use crate::render::mesh::{peel_surfaces, MeshImage};
use crate::render::target::{RenderTargetKind, RenderTargetPool, TargetGuard};
use crate::render::transfer::ShadowParams;
use crate::render::volume_renderer::PassTarget;
use crate::volume::PassMode;

/// Format of every intermediate buffer
const WORK_FORMAT: TargetFormat = TargetFormat::Rgba32F;

/// What a loop needs from the target pool
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlanSpec {
    /// Volume layers, peeling layers plus the front layer
    pub layers: u32,
    /// Meshes are drawn this frame
    pub meshes: bool,
    pub peeling: bool,
    pub shadow: Option<ShadowParams>,
    pub mix: MixMethod,
    /// Slabs are drawn straight into the layer targets
    pub interleaved: bool,
}

/// Targets of one loop
#[derive(Debug)]
pub struct FramePlan {
    pub layers: u32,
    pub layer_targets: Vec<TargetHandle>,
    /// Ray depth of the mesh surface bounding each layer; empty without peeling
    pub depth_targets: Vec<TargetHandle>,
    pub mesh_targets: Vec<TargetHandle>,
    pub channel: TargetHandle,
    pub shadow: Option<(TargetHandle, ShadowParams)>,
    pub scene: TargetHandle,
    /// How a finished channel joins its layer
    pub flush_blend: BlendMode,
    pub interleaved: bool,
    guards: Vec<TargetGuard>,
}

/// Acquire one work target and guard it for the plan
fn acquire_guarded(
    backend: &mut dyn RenderBackend,
    pool: &mut RenderTargetPool,
    kind: RenderTargetKind,
    guards: &mut Vec<TargetGuard>,
) -> Result<TargetHandle> {
    let handle = pool.acquire(backend, kind, WORK_FORMAT)?;
    guards.extend(pool.protect(kind));
    Ok(handle)
}

impl FramePlan {
    /// Acquire every target of the loop from `pool`
    pub fn acquire(backend: &mut dyn RenderBackend, pool: &mut RenderTargetPool, spec: PlanSpec) -> Result<Self> {
        let layers = spec.layers.max(1);
        let mut guards = Vec::new();
        let mut layer_targets = Vec::with_capacity(layers as usize);
        let mut depth_targets = Vec::new();
        let mut mesh_targets = Vec::new();
        for l in 0..layers {
            layer_targets.push(acquire_guarded(backend, pool, RenderTargetKind::PeelLayer(l), &mut guards)?);
            if spec.meshes || spec.peeling {
                depth_targets.push(acquire_guarded(backend, pool, RenderTargetKind::PeelDepth(l), &mut guards)?);
            }
            if spec.meshes {
                mesh_targets.push(acquire_guarded(backend, pool, RenderTargetKind::MeshLayer(l), &mut guards)?);
            }
        }
        let shadow = match spec.shadow {
            Some(params) => Some((acquire_guarded(backend, pool, RenderTargetKind::Shadow, &mut guards)?, params)),
            None => None,
        };
        let channel = acquire_guarded(backend, pool, RenderTargetKind::Channel, &mut guards)?;
        let scene = acquire_guarded(backend, pool, RenderTargetKind::Temporary, &mut guards)?;
        Ok(Self {
            layers,
            layer_targets,
            depth_targets,
            mesh_targets,
            channel,
            shadow,
            scene,
            flush_blend: match spec.mix {
                MixMethod::Composite => BlendMode::Add,
                _ => BlendMode::Under,
            },
            interleaved: spec.interleaved,
            guards,
        })
    }

    /// Drop the guards once the loop is over; the handles stay usable for recomposition
    pub fn release(&mut self) {
        self.guards.clear();
    }

    pub fn is_protected(&self) -> bool {
        !self.guards.is_empty()
    }

    /// Depth interval layer `layer` may sample
    pub fn peel_window(&self, layer: u32) -> Option<PeelWindow> {
        if self.depth_targets.is_empty() {
            return None;
        }
        let near = layer.checked_sub(1).and_then(|l| self.depth_targets.get(l as usize)).copied();
        let far = self.depth_targets.get(layer as usize).copied();
        Some(PeelWindow { near, far })
    }

    /// Where an item of `pass` in `layer` is drawn
    pub fn pass_target(&self, pass: PassMode, layer: u32) -> PassTarget {
        let target = match (pass, self.shadow) {
            (PassMode::Shadow, Some((shadow, _))) => shadow,
            _ if self.interleaved => self.layer_target(layer),
            _ => self.channel,
        };
        let peel = if pass == PassMode::Shadow { None } else { self.peel_window(layer) };
        PassTarget { target, layer, peel }
    }

    fn layer_target(&self, layer: u32) -> TargetHandle {
        let i = (layer as usize).min(self.layer_targets.len().saturating_sub(1));
        self.layer_targets[i]
    }

    /// Clear the loop's targets and upload the peeled mesh surfaces
    pub fn begin(&self, backend: &mut dyn RenderBackend, meshes: &[MeshImage]) -> Result<()> {
        for &t in &self.layer_targets {
            backend.clear_target(t, [0.0; 4])?;
        }
        backend.clear_target(self.channel, [0.0; 4])?;
        if let Some((shadow, _)) = self.shadow {
            backend.clear_target(shadow, [FAR_DEPTH; 4])?;
        }
        if self.depth_targets.is_empty() {
            return Ok(());
        }
        let Some(viewport) = meshes.first().map(|m| m.viewport) else {
            for &t in &self.depth_targets {
                backend.clear_target(t, [FAR_DEPTH; 4])?;
            }
            for &t in &self.mesh_targets {
                backend.clear_target(t, [0.0; 4])?;
            }
            return Ok(());
        };
        let surfaces = peel_surfaces(meshes, viewport, self.layers as usize);
        for (l, surface) in surfaces.iter().enumerate() {
            backend.write_target(self.depth_targets[l], &surface.depth_pixels())?;
            if let Some(&color) = self.mesh_targets.get(l) {
                backend.write_target(color, &surface.color)?;
            }
        }
        Ok(())
    }

    /// Move the channel's accumulation into its layer
    pub fn flush_channel(&self, backend: &mut dyn RenderBackend, layer: u32) -> Result<()> {
        backend.blend_target(self.channel, self.layer_target(layer), self.flush_blend)?;
        backend.clear_target(self.channel, [0.0; 4])
    }

    /// Fold layers, the open channel and mesh surfaces into the scene target
    ///
    /// `open_channel` is the layer whose volume is still accumulating. The
    /// shadow darkening is only applied once the loop has finished.
    pub fn compose_scene(&self, backend: &mut dyn RenderBackend, open_channel: Option<u32>, finished: bool) -> Result<TargetHandle> {
        backend.clear_target(self.scene, [0.0; 4])?;
        for l in 0..self.layers {
            backend.blend_target(self.layer_target(l), self.scene, BlendMode::Under)?;
            if open_channel == Some(l) {
                backend.blend_target(self.channel, self.scene, self.flush_blend)?;
            }
            if let Some(&mesh) = self.mesh_targets.get(l as usize) {
                backend.blend_target(mesh, self.scene, BlendMode::Under)?;
            }
        }
        if finished {
            if let Some((shadow, params)) = &self.shadow {
                backend.apply_shadow(*shadow, self.scene, params)?;
            }
        }
        Ok(self.scene)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backend::Viewport;
    use crate::render::software::SoftwareBackend;

    const VP: Viewport = Viewport { width: 2, height: 1 };

    fn spec(layers: u32, meshes: bool) -> PlanSpec {
        PlanSpec {
            layers,
            meshes,
            peeling: layers > 1,
            shadow: None,
            mix: MixMethod::Sequential,
            interleaved: false,
        }
    }

    #[test]
    fn test_peel_windows_chain_depth_targets() {
        let mut backend = SoftwareBackend::new();
        let mut pool = RenderTargetPool::new(VP);
        let plan = FramePlan::acquire(&mut backend, &mut pool, spec(3, false)).unwrap();
        assert_eq!(plan.depth_targets.len(), 3);
        assert!(plan.mesh_targets.is_empty());
        let w0 = plan.peel_window(0).unwrap();
        assert_eq!((w0.near, w0.far), (None, Some(plan.depth_targets[0])));
        let w2 = plan.peel_window(2).unwrap();
        assert_eq!((w2.near, w2.far), (Some(plan.depth_targets[1]), Some(plan.depth_targets[2])));

        let flat = FramePlan::acquire(&mut backend, &mut RenderTargetPool::new(VP), spec(1, false)).unwrap();
        assert!(flat.peel_window(0).is_none());
        assert_eq!(flat.pass_target(PassMode::Color, 0).target, flat.channel);
    }

    #[test]
    fn test_mesh_surfaces_split_into_layers() {
        let mut backend = SoftwareBackend::new();
        let mut pool = RenderTargetPool::new(VP);
        let plan = FramePlan::acquire(&mut backend, &mut pool, spec(2, true)).unwrap();
        let mut near = MeshImage::empty(VP);
        near.depth[0] = 1.0;
        near.color[0] = [1.0, 0.0, 0.0, 1.0];
        let mut far = MeshImage::empty(VP);
        far.depth[0] = 3.0;
        far.color[0] = [0.0, 0.0, 1.0, 1.0];
        plan.begin(&mut backend, &[far, near]).unwrap();

        let d0 = backend.read_target(plan.depth_targets[0]).unwrap();
        let d1 = backend.read_target(plan.depth_targets[1]).unwrap();
        assert_eq!((d0[0][0], d1[0][0]), (1.0, 3.0));
        assert_eq!(d0[1][0], FAR_DEPTH);
        let c1 = backend.read_target(plan.mesh_targets[1]).unwrap();
        assert_eq!(c1[0], [0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_compose_puts_front_layer_over_back() {
        let mut backend = SoftwareBackend::new();
        let mut pool = RenderTargetPool::new(VP);
        let plan = FramePlan::acquire(&mut backend, &mut pool, spec(2, false)).unwrap();
        plan.begin(&mut backend, &[]).unwrap();
        backend.write_target(plan.layer_targets[0], &[[0.5, 0.0, 0.0, 0.5]; 2]).unwrap();
        backend.write_target(plan.layer_targets[1], &[[0.0, 0.0, 1.0, 1.0]; 2]).unwrap();
        let scene = plan.compose_scene(&mut backend, None, true).unwrap();
        let px = backend.read_target(scene).unwrap()[0];
        assert_eq!(px, [0.5, 0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_flush_blend_follows_mix_method() {
        let mut backend = SoftwareBackend::new();
        let mut pool = RenderTargetPool::new(VP);
        let additive = FramePlan::acquire(&mut backend, &mut pool, PlanSpec { mix: MixMethod::Composite, ..spec(1, false) }).unwrap();
        assert_eq!(additive.flush_blend, BlendMode::Add);
        additive.begin(&mut backend, &[]).unwrap();
        for _ in 0..2 {
            backend.write_target(additive.channel, &[[0.25, 0.0, 0.0, 0.25]; 2]).unwrap();
            additive.flush_channel(&mut backend, 0).unwrap();
        }
        let px = backend.read_target(additive.layer_targets[0]).unwrap()[0];
        assert_eq!(px, [0.5, 0.0, 0.0, 0.5]);
        assert_eq!(backend.read_target(additive.channel).unwrap()[0], [0.0; 4]);
    }

    #[test]
    fn test_plan_targets_survive_pool_clear() {
        let mut backend = SoftwareBackend::new();
        let mut pool = RenderTargetPool::new(VP);
        let mut plan = FramePlan::acquire(&mut backend, &mut pool, spec(2, false)).unwrap();
        assert!(plan.is_protected());
        assert!(pool.is_protected(RenderTargetKind::Channel));

        pool.clear(&mut backend);
        assert_eq!(pool.handle(RenderTargetKind::Channel), Some(plan.channel));
        backend.clear_target(plan.channel, [1.0; 4]).unwrap();
        pool.set_viewport(Viewport::new(4, 4));
        assert!(pool.acquire(&mut backend, RenderTargetKind::Temporary, WORK_FORMAT).is_err());

        plan.release();
        assert!(!pool.is_protected(RenderTargetKind::Channel));
        pool.clear(&mut backend);
        assert!(pool.is_empty());
        assert_eq!(backend.target_count(), 0);
    }
}
