//! Per-view frame state machine
//!
//! A canvas moves through `Idle -> Drawing -> {InteractiveDraw, ProgressiveDraw}
//! -> BufferSwapped -> Idle`. [`RenderCanvas::draw`] arms an update loop for
//! the current view and presents whatever has been composited so far;
//! [`RenderCanvas::on_idle`] runs one loader burst per host idle tick until
//! the loop finishes. Any change to what is on screen cancels the loop and
//! the next draw starts over.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::core::types::Vec3;
use crate::core::{Camera, Clock, Error, FrameTimer, Result};
use crate::math::Aabb;
use crate::render::backend::{BlendMode, RenderBackend, TargetHandle, Viewport};
use crate::render::mesh::{MeshImage, MeshSource};
use crate::render::multi_volume::{MultiVolumeRenderer, Slab};
use crate::render::overlay::{Hud, OverlayKind, OverlayScene, Overlays};
use crate::render::target::RenderTargetKind;
use crate::render::view::FrameView;
use crate::render::volume_renderer::{BrickResidency, VolumeRenderer};
use crate::streaming::{
    allocate_channel_quotas, corrected_up_time, CanvasId, DrawnLedger, ItemOutcome, LoadItem, LoadStep, LoadWorker, LoopStats, ProgressFlags,
    QuotaEstimator, UpdateLoopState, WorkTarget, BrickLoader,
};
use crate::volume::{select_level, BrickId, BrickKey, Layer, PassMode, Volume, VolumeId};
use super::context::RendererContext;
use super::frame::{FramePlan, PlanSpec};

/// Where a canvas is in its frame sequence
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CanvasState {
    #[default]
    Idle,
    Drawing,
    /// Quota-limited frame while the user manipulates the view
    InteractiveDraw,
    /// Update loop running across idle ticks
    ProgressiveDraw,
    BufferSwapped,
}

/// One view onto a layer list
pub struct RenderCanvas {
    id: CanvasId,
    viewport: Viewport,
    camera: Camera,
    layers: Vec<Layer>,
    overlays: Overlays,
    hud: Hud,
    state: CanvasState,
    clock: Arc<dyn Clock>,
    timer: FrameTimer,

    loader: BrickLoader,
    progress: UpdateLoopState,
    quota: QuotaEstimator,
    quota_center: Option<Vec3>,
    /// Volume served first when a quota is split across volumes
    selected_volume: Option<VolumeId>,
    interacting: bool,
    /// Host-reported manipulation speed of the current interaction
    interaction_speed: Option<f32>,
    /// Wall time of the last burst in milliseconds
    last_burst_ms: f32,

    /// View fingerprint the current loop was armed for
    loop_key: Option<u64>,
    needs_loop: bool,
    /// Final buffer holds a finished frame for the current view
    retain_final: bool,
    waiting_for_slot: bool,
    swap: bool,

    plan: Option<FramePlan>,
    view: Option<FrameView>,
    slabs: Vec<Slab>,
    open_channel: Option<(VolumeId, u32)>,
    failed: HashMap<BrickKey, String>,
    drawn: DrawnLedger,
}

impl RenderCanvas {
    pub fn new(ctx: &mut RendererContext, viewport: Viewport, clock: Arc<dyn Clock>) -> Self {
        let id = ctx.register_canvas(viewport);
        log::debug!("Canvas {:?} created at {}x{}", id, viewport.width, viewport.height);
        Self {
            id,
            viewport,
            camera: Camera::default(),
            layers: Vec::new(),
            overlays: Overlays::default(),
            hud: Hud::default(),
            state: CanvasState::Idle,
            clock,
            timer: FrameTimer::default(),
            loader: BrickLoader::new(),
            progress: UpdateLoopState::new(),
            quota: QuotaEstimator::new(ctx.streaming.quota_history, ctx.streaming.quota_estimate),
            quota_center: None,
            selected_volume: None,
            interacting: false,
            interaction_speed: None,
            last_burst_ms: 0.0,
            loop_key: None,
            needs_loop: true,
            retain_final: false,
            waiting_for_slot: false,
            swap: false,
            plan: None,
            view: None,
            slabs: Vec::new(),
            open_channel: None,
            failed: HashMap::new(),
            drawn: DrawnLedger::new(),
        }
    }

    pub fn id(&self) -> CanvasId {
        self.id
    }

    pub fn state(&self) -> CanvasState {
        self.state
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn hud_mut(&mut self) -> &mut Hud {
        &mut self.hud
    }

    /// Overlay content; changing it recomposes without restarting the loop
    pub fn overlays_mut(&mut self) -> &mut Overlays {
        self.retain_final = false;
        &mut self.overlays
    }

    pub fn progress(&self) -> ProgressFlags {
        self.progress.flags()
    }

    pub fn loop_state(&self) -> &UpdateLoopState {
        &self.progress
    }

    /// Bricks drawn in `pass` by the current loop, counted per peeling layer
    pub fn drawn_count(&self, pass: PassMode) -> usize {
        self.drawn.values().filter(|s| s.contains(pass)).count()
    }

    pub fn loader_stats(&self) -> LoopStats {
        self.loader.stats()
    }

    /// True while the final buffer holds a finished frame for the current view
    pub fn is_retained(&self) -> bool {
        self.retain_final
    }

    pub fn fps(&self) -> f32 {
        self.timer.fps()
    }

    pub fn set_camera(&mut self, ctx: &mut RendererContext, camera: Camera) {
        if camera.fingerprint() != self.camera.fingerprint() {
            self.camera = camera;
            self.invalidate(ctx);
        }
    }

    /// Layers for editing; the current loop is discarded
    pub fn layers_mut(&mut self, ctx: &mut RendererContext) -> &mut Vec<Layer> {
        self.invalidate(ctx);
        &mut self.layers
    }

    pub fn add_layer(&mut self, ctx: &mut RendererContext, layer: Layer) {
        self.layers_mut(ctx).push(layer);
    }

    /// Point bricks are ranked around in quota-limited frames; `None` uses the camera center
    pub fn set_quota_center(&mut self, center: Option<Vec3>) {
        self.quota_center = center;
    }

    /// Volume whose bricks are streamed first in quota-limited frames
    pub fn select_volume(&mut self, volume: Option<VolumeId>) {
        self.selected_volume = volume;
    }

    pub fn begin_interaction(&mut self) {
        self.interacting = true;
    }

    /// Report how fast the view is being manipulated; faster motion shortens interactive frames
    pub fn set_interaction_speed(&mut self, speed: Option<f32>) {
        self.interaction_speed = speed;
    }

    /// Leave interactive mode; the next draw starts a full-quality loop
    pub fn end_interaction(&mut self, ctx: &mut RendererContext) {
        self.interaction_speed = None;
        if self.interacting {
            self.interacting = false;
            self.invalidate(ctx);
        }
    }

    /// Burst time budget in milliseconds, corrected for speed in interactive frames
    fn up_time(&self, ctx: &RendererContext, interactive: bool) -> f32 {
        let up_time = ctx.streaming.up_time as f32;
        match self.interaction_speed {
            Some(speed) if interactive => corrected_up_time(up_time, speed),
            _ => up_time,
        }
    }

    pub fn resize(&mut self, ctx: &mut RendererContext, viewport: Viewport) {
        if viewport == self.viewport {
            return;
        }
        self.viewport = viewport;
        if let Some(pool) = ctx.pools.get_mut(&self.id) {
            pool.set_viewport(viewport);
        }
        self.invalidate(ctx);
    }

    /// Discard the current loop and everything retained for this view
    pub fn invalidate(&mut self, ctx: &mut RendererContext) {
        self.cancel_loop(ctx);
        for layer in &mut self.layers {
            layer.visit_all_volumes_mut(&mut |v| v.catalog_mut().mark_sort_dirty());
        }
        self.needs_loop = true;
        self.retain_final = false;
    }

    fn cancel_loop(&mut self, ctx: &mut RendererContext) {
        if self.loader.is_active() {
            log::debug!("Canvas {:?} cancelled loop at {}/{} bricks", self.id, self.progress.bricks_finished(), self.progress.bricks_total());
        }
        self.loader.cancel();
        self.progress.cancel();
        self.open_channel = None;
        self.waiting_for_slot = false;
        if let Some(plan) = self.plan.as_mut() {
            plan.release();
        }
        if let Some(prefetcher) = ctx.prefetcher.as_mut() {
            prefetcher.cancel_all();
        }
        if self.swap {
            ctx.slot.release(self.id);
        }
    }

    fn view_key(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.camera.fingerprint().hash(&mut hasher);
        self.viewport.hash(&mut hasher);
        hasher.finish()
    }

    /// Draw a frame for the host's paint event
    pub fn draw(&mut self, ctx: &mut RendererContext) -> Result<CanvasState> {
        if self.viewport.is_empty() {
            return Ok(self.state);
        }
        self.state = CanvasState::Drawing;
        if self.loop_key != Some(self.view_key()) {
            self.cancel_loop(ctx);
            self.needs_loop = true;
            self.retain_final = false;
        }

        if self.interacting {
            self.state = CanvasState::InteractiveDraw;
            self.arm_loop(ctx, true)?;
            let finished = if self.loader.is_active() {
                self.run_burst(ctx) == LoadStep::Done
            } else {
                !self.waiting_for_slot
            };
            if finished {
                self.finish_loop(ctx)?;
            }
            self.compose(ctx, finished)?;
            if !finished {
                // Interactive frames never continue in idle time.
                self.cancel_loop(ctx);
                self.needs_loop = true;
            }
        } else if self.needs_loop || self.waiting_for_slot {
            self.arm_loop(ctx, false)?;
            self.state = CanvasState::ProgressiveDraw;
            let finished = !self.waiting_for_slot && !self.loader.is_active();
            if finished {
                self.finish_loop(ctx)?;
            }
            self.compose(ctx, finished)?;
        } else if self.loader.is_active() {
            self.state = CanvasState::ProgressiveDraw;
            self.compose(ctx, false)?;
        } else {
            self.compose(ctx, true)?;
        }
        Ok(self.swap_buffers())
    }

    /// Run one loader burst; returns true while more idle ticks are wanted
    pub fn on_idle(&mut self, ctx: &mut RendererContext) -> Result<bool> {
        if self.waiting_for_slot {
            self.arm_loop(ctx, false)?;
            if self.waiting_for_slot {
                return Ok(true);
            }
            if !self.loader.is_active() {
                self.finish_loop(ctx)?;
                self.compose(ctx, true)?;
                self.swap_buffers();
                return Ok(false);
            }
        }
        if !self.loader.is_active() {
            return Ok(false);
        }
        self.state = CanvasState::ProgressiveDraw;
        let finished = self.run_burst(ctx) == LoadStep::Done;
        if finished {
            self.finish_loop(ctx)?;
        }
        self.compose(ctx, finished)?;
        self.swap_buffers();
        Ok(!finished)
    }

    fn swap_buffers(&mut self) -> CanvasState {
        self.state = CanvasState::BufferSwapped;
        self.timer.tick(self.clock.now());
        self.state = if self.loader.is_active() || self.waiting_for_slot {
            CanvasState::ProgressiveDraw
        } else {
            CanvasState::Idle
        };
        self.state
    }

    fn data_bytes(&self) -> u64 {
        let mut volumes = Vec::new();
        self.layers.iter().for_each(|l| l.collect_volumes(&mut volumes));
        volumes.iter().map(|v| v.data_size()).sum()
    }

    fn scene_bounds(&self) -> Option<Aabb> {
        self.layers
            .iter()
            .filter(|l| l.is_displayed())
            .filter_map(Layer::bounds)
            .reduce(|a, b| a.merged(&b))
    }

    fn mesh_images(&self, view: &FrameView) -> Vec<MeshImage> {
        let mut meshes: Vec<Arc<dyn MeshSource>> = Vec::new();
        self.layers.iter().for_each(|l| l.collect_meshes(&mut meshes));
        meshes.iter().map(|m| m.render(&view.camera, self.viewport)).collect()
    }

    /// Move streamed volumes to the pyramid level matching the on-screen voxel size
    fn select_levels(&mut self, ctx: &mut RendererContext) -> Result<()> {
        let pixel_size = self.camera.pixel_world_size(self.viewport.height);
        let (res_mode, offset) = (ctx.render.resolution_mode, ctx.render.detail_level_offset);
        let mut volumes = Vec::new();
        self.layers.iter_mut().for_each(|l| l.collect_volumes_mut(&mut volumes));
        for volume in volumes.into_iter().filter(|v| v.is_streamed()) {
            let spacings = volume.level_spacings()?;
            let level = select_level(&spacings, pixel_size, res_mode, offset);
            if volume.switch_level(level)? {
                let dropped = ctx.cache.invalidate_volume(ctx.backend.as_mut(), volume.id(), Some(level));
                log::info!("Volume {:?} now at level {} ({} textures released)", volume.id(), level, dropped);
            }
        }
        Ok(())
    }

    /// Build the queue for the current view and clear the loop's targets
    fn arm_loop(&mut self, ctx: &mut RendererContext, interactive: bool) -> Result<()> {
        self.loader.cancel();
        self.open_channel = None;
        if let Some(plan) = self.plan.as_mut() {
            plan.release();
        }
        let data_bytes = self.data_bytes();
        let swap = ctx.streaming.swap_enabled(data_bytes);
        if swap && !ctx.slot.try_acquire(self.id) {
            if !self.waiting_for_slot {
                log::warn!("Canvas {:?} waits for the streaming slot held by {:?}", self.id, ctx.slot.holder());
            }
            self.waiting_for_slot = true;
            return Ok(());
        }
        self.waiting_for_slot = false;
        self.swap = swap;

        let mut view = FrameView::new(&self.camera, self.viewport, ctx.streaming.update_order);
        view.interactive = interactive;
        view.sample_rate = ctx.render.effective_sample_rate(
            interactive,
            false,
            data_bytes,
            ctx.streaming.small_data_bytes,
            ctx.streaming.large_data_bytes,
        );
        view.light_dir = ctx.render.light_dir.try_normalize().unwrap_or(Vec3::Z);
        if let Some(bounds) = self.scene_bounds() {
            view.fog = view.fog_for(&bounds, ctx.render.fog_intensity);
        }
        self.select_levels(ctx)?;
        let meshes = self.mesh_images(&view);
        let layers = ctx.render.peel_layers + 1;
        let quota_center = self.quota_center.unwrap_or(self.camera.center);
        let up_time = self.up_time(ctx, true);

        let mut volumes: Vec<&mut Volume> = Vec::new();
        self.layers.iter_mut().for_each(|l| l.collect_volumes_mut(&mut volumes));
        let interleaved = MultiVolumeRenderer::engaged(ctx.render.mix_method, volumes.len());
        let shadow = volumes.iter().find_map(|v| v.shadow);

        let quota = if interactive && swap && ctx.streaming.interactive_allowed(data_bytes) {
            let total: usize = volumes
                .iter_mut()
                .map(|v| VolumeRenderer::required_bricks(v, &view, None).len())
                .sum();
            let q = self.quota.next_quota(total as u32, self.last_burst_ms, up_time);
            Some((quota_center, q as usize))
        } else {
            None
        };

        let mut items = Vec::new();
        let mut total = 0usize;
        let mut draw_lists: Vec<(VolumeId, Vec<BrickId>)> = Vec::new();
        self.slabs.clear();
        if interleaved {
            let weights: Vec<f32> = volumes.iter().map(|v| v.quota_share).collect();
            let ordered = MultiVolumeRenderer::ordered_bricks(&mut volumes, &view, quota, &weights);
            self.slabs = MultiVolumeRenderer::slabs(&ordered, view.order);
            for v in volumes.iter() {
                let ids = ordered.iter().filter(|b| b.key.volume == v.id()).map(|b| b.key.brick).collect();
                draw_lists.push((v.id(), ids));
            }
            for layer in 0..layers {
                for (i, slab) in self.slabs.iter().enumerate() {
                    items.push(LoadItem::slab(i as u32, PassMode::Color).with_layer(layer));
                    total += slab.len();
                }
                for sb in &ordered {
                    let Some(v) = volumes.iter().find(|v| v.id() == sb.key.volume) else { continue };
                    for pass in VolumeRenderer::passes(v).into_iter().skip(1) {
                        if pass == PassMode::Shadow && layer > 0 {
                            continue;
                        }
                        items.push(LoadItem::brick(sb.key, pass).with_layer(layer));
                        total += 1;
                    }
                }
            }
        } else {
            let mut lists: Vec<Vec<BrickId>> = volumes
                .iter_mut()
                .map(|v| VolumeRenderer::required_bricks(v, &view, None))
                .collect();
            if let Some((center, q)) = quota {
                let counts: Vec<usize> = lists.iter().map(Vec::len).collect();
                let current = self
                    .selected_volume
                    .and_then(|id| volumes.iter().position(|v| v.id() == id))
                    .unwrap_or(0);
                let shares = allocate_channel_quotas(q, current, &counts);
                for ((v, list), share) in volumes.iter_mut().zip(lists.iter_mut()).zip(shares) {
                    *list = VolumeRenderer::required_bricks(v, &view, Some((center, share)));
                }
            }
            for layer in 0..layers {
                for (v, list) in volumes.iter().zip(&lists) {
                    for pass in VolumeRenderer::passes(v) {
                        if pass == PassMode::Shadow && layer > 0 {
                            continue;
                        }
                        for &id in list {
                            let location = if v.is_streamed() { v.file_location(id)? } else { None };
                            items.push(LoadItem::brick(v.key(id), pass).with_location(location).with_layer(layer));
                            total += 1;
                        }
                    }
                }
            }
            draw_lists = volumes.iter().zip(lists).map(|(v, l)| (v.id(), l)).collect();
        }

        self.failed.clear();
        if let Some(prefetcher) = ctx.prefetcher.as_mut() {
            prefetcher.cancel_all();
            let mut residency = BrickResidency {
                backend: ctx.backend.as_mut(),
                cache: &mut ctx.cache,
                staging: &mut ctx.staging,
                prefetcher: Some(prefetcher),
                fetcher: ctx.fetcher.as_ref(),
                failed: &mut self.failed,
            };
            for (id, list) in &draw_lists {
                if let Some(v) = volumes.iter().find(|v| v.id() == *id) {
                    residency.prefetch(v, list);
                }
            }
        }

        let pool = ctx
            .pools
            .get_mut(&self.id)
            .ok_or_else(|| Error::Render(format!("canvas {:?} has no target pool", self.id)))?;
        let plan = FramePlan::acquire(
            ctx.backend.as_mut(),
            pool,
            PlanSpec {
                layers,
                meshes: !meshes.is_empty(),
                peeling: ctx.render.peeling(),
                shadow,
                mix: ctx.render.mix_method,
                interleaved,
            },
        )?;
        plan.begin(ctx.backend.as_mut(), &meshes)?;

        self.drawn.clear();
        self.progress.begin(total, self.clock.now());
        self.progress.set_mem_swap(swap);
        self.progress.set_interactive(interactive);
        self.loader.arm(items);
        self.plan = Some(plan);
        self.view = Some(view);
        self.loop_key = Some(self.view_key());
        self.needs_loop = false;
        self.retain_final = false;
        Ok(())
    }

    fn run_burst(&mut self, ctx: &mut RendererContext) -> LoadStep {
        let (Some(plan), Some(view)) = (self.plan.as_ref(), self.view.as_ref()) else {
            return LoadStep::Done;
        };
        let budget = self.swap.then(|| Duration::from_secs_f32(self.up_time(ctx, view.interactive) / 1000.0));
        let mut volumes: Vec<&Volume> = Vec::new();
        self.layers.iter().for_each(|l| l.collect_volumes(&mut volumes));

        ctx.cache.swap_ledger(&mut self.drawn);
        let start = self.clock.now();
        let mut worker = FrameWorker {
            residency: BrickResidency {
                backend: ctx.backend.as_mut(),
                cache: &mut ctx.cache,
                staging: &mut ctx.staging,
                prefetcher: ctx.prefetcher.as_mut(),
                fetcher: ctx.fetcher.as_ref(),
                failed: &mut self.failed,
            },
            volumes: &volumes,
            view,
            plan,
            slabs: &self.slabs,
            open_channel: &mut self.open_channel,
            progress: &mut self.progress,
        };
        let step = self.loader.resume(&mut worker, self.clock.as_ref(), budget);
        ctx.cache.swap_ledger(&mut self.drawn);
        self.last_burst_ms = self.clock.since(start).as_secs_f32() * 1000.0;
        log::debug!(
            "Canvas {:?} burst: {}/{} bricks, {:.1}ms",
            self.id,
            self.progress.bricks_finished(),
            self.progress.bricks_total(),
            self.last_burst_ms
        );
        step
    }

    fn finish_loop(&mut self, ctx: &mut RendererContext) -> Result<()> {
        if let Some(plan) = self.plan.as_mut() {
            let flushed = match self.open_channel.take() {
                Some((_, layer)) => plan.flush_channel(ctx.backend.as_mut(), layer),
                None => Ok(()),
            };
            plan.release();
            flushed?;
        }
        let failures = self.loader.failures().len();
        if failures > 0 {
            log::warn!("Canvas {:?} finished with {} failed items", self.id, failures);
        }
        self.progress.finish(self.clock.now());
        if self.swap {
            ctx.slot.release(self.id);
        }
        Ok(())
    }

    /// Composite the current state into the final buffer and present it
    fn compose(&mut self, ctx: &mut RendererContext, finished: bool) -> Result<()> {
        let backend = ctx.backend.as_mut();
        let pool = ctx
            .pools
            .get_mut(&self.id)
            .ok_or_else(|| Error::Render(format!("canvas {:?} has no target pool", self.id)))?;
        let final_target = pool.acquire(backend, RenderTargetKind::Final, ctx.render.target_format)?;

        if !(self.retain_final && finished) {
            match ctx.render.gradient_background {
                Some(g) => backend.fill_gradient(final_target, g.top, g.bottom)?,
                None => backend.clear_target(final_target, ctx.render.clear_color)?,
            }
            if let (Some(plan), Some(view)) = (self.plan.as_ref(), self.view.as_ref()) {
                let open = self.open_channel.map(|(_, l)| l);
                let scene = plan.compose_scene(backend, open, finished)?;
                let overlay_scene = self.overlay_scene(ctx.render.show_bounds);
                for kind in OverlayKind::ORDER {
                    match kind {
                        OverlayKind::Volumes => backend.blend_target(scene, final_target, BlendMode::Over)?,
                        _ => self.overlays.draw(backend, final_target, kind, view, &overlay_scene)?,
                    }
                }
            }
            self.retain_final = finished;
        }

        backend.present(final_target, &ctx.render.color_adjust())?;
        let mut hud = self.hud.clone();
        hud.fps |= ctx.render.show_fps;
        hud.draw(backend, self.viewport, &self.legend(), self.camera.pixel_world_size(self.viewport.height), self.timer.fps())
    }

    fn overlay_scene(&self, show_bounds: bool) -> OverlayScene {
        let mut volumes = Vec::new();
        self.layers.iter().for_each(|l| l.collect_volumes(&mut volumes));
        let mut annotations = Vec::new();
        collect_annotations(&self.layers, &mut annotations);
        OverlayScene {
            volume_bounds: volumes.iter().map(|v| v.bounds()).collect(),
            show_bounds,
            annotations,
        }
    }

    fn legend(&self) -> Vec<Vec3> {
        let mut volumes = Vec::new();
        self.layers.iter().for_each(|l| l.collect_volumes(&mut volumes));
        volumes.iter().map(|v| v.transfer.color).collect()
    }

    /// Composited frame before color adjustment
    pub fn read_final(&self, ctx: &mut RendererContext) -> Result<Vec<[f32; 4]>> {
        let handle = self.final_target(ctx)?;
        ctx.backend.read_target(handle)
    }

    fn final_target(&self, ctx: &RendererContext) -> Result<TargetHandle> {
        ctx.pools
            .get(&self.id)
            .and_then(|p| p.handle(RenderTargetKind::Final))
            .ok_or_else(|| Error::Render(format!("canvas {:?} has not drawn a frame", self.id)))
    }

    /// Write the last presented image to a PNG file
    pub fn capture(&self, ctx: &mut RendererContext, path: &Path) -> Result<()> {
        let (viewport, pixels) = ctx.backend.read_window()?;
        if viewport.is_empty() || pixels.len() != viewport.pixel_count() {
            return Err(Error::Render("nothing has been presented yet".into()));
        }
        let bytes: Vec<u8> = pixels.into_iter().flatten().collect();
        let image = image::RgbaImage::from_raw(viewport.width, viewport.height, bytes)
            .ok_or_else(|| Error::Render("window image size mismatch".into()))?;
        image.save(path)?;
        log::info!("Captured {}x{} frame to {:?}", viewport.width, viewport.height, path);
        Ok(())
    }
}

fn collect_annotations(layers: &[Layer], out: &mut Vec<(Vec3, Vec3)>) {
    for layer in layers.iter().filter(|l| l.is_displayed()) {
        match layer {
            Layer::Annotation(a) => out.extend(a.points.iter().map(|(p, _)| (*p, a.color))),
            _ => collect_annotations(layer.children(), out),
        }
    }
}

/// Draws loader items for one burst
struct FrameWorker<'a, 'r> {
    residency: BrickResidency<'r>,
    volumes: &'a [&'a Volume],
    view: &'a FrameView,
    plan: &'a FramePlan,
    slabs: &'a [Slab],
    open_channel: &'a mut Option<(VolumeId, u32)>,
    progress: &'a mut UpdateLoopState,
}

impl FrameWorker<'_, '_> {
    /// Route subsequent draws of `volume` in `layer` to the channel target
    fn open(&mut self, volume: VolumeId, layer: u32) {
        if self.plan.interleaved || *self.open_channel == Some((volume, layer)) {
            return;
        }
        if let Some((_, previous)) = self.open_channel.take() {
            if let Err(e) = self.plan.flush_channel(&mut *self.residency.backend, previous) {
                log::warn!("Channel flush failed: {}", e);
            }
        }
        *self.open_channel = Some((volume, layer));
    }
}

impl LoadWorker for FrameWorker<'_, '_> {
    fn process(&mut self, item: &LoadItem) -> ItemOutcome {
        self.residency.drain_prefetched();
        let (outcome, weight) = match item.target {
            WorkTarget::Brick(key) => {
                let Some(volume) = self.volumes.iter().copied().find(|v| v.id() == key.volume) else {
                    return ItemOutcome::Failed(format!("volume {:?} is no longer displayed", key.volume));
                };
                if item.pass != PassMode::Shadow {
                    self.open(key.volume, item.layer);
                }
                let target = self.plan.pass_target(item.pass, item.layer);
                (VolumeRenderer::draw_brick(&mut self.residency, volume, self.view, key.brick, item.pass, target), 1)
            }
            WorkTarget::Slab(i) => {
                let Some(slab) = self.slabs.get(i as usize) else {
                    return ItemOutcome::Failed(format!("slab {} out of range", i));
                };
                let target = self.plan.pass_target(item.pass, item.layer);
                (MultiVolumeRenderer::draw_slab(&mut self.residency, self.volumes, self.view, slab, target), slab.len())
            }
        };
        if outcome != ItemOutcome::Deferred {
            self.progress.advance(weight);
        }
        outcome
    }
}
