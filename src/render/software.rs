//! CPU reference backend
//!
//! Ray-marches bricks on the host, one rayon task per image row. Results are
//! deterministic, so tests and headless runs use this backend to check the
//! streaming and compositing logic without a GPU.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::core::types::{IVec3, Mat4, UVec3, Vec3};
use crate::core::{Error, Result};
use crate::math::Ray;
use crate::volume::{BrickPayload, PassMode, TexelFormat};
use super::adjust::ColorAdjust;
use super::backend::{
    BlendMode, BrickDraw, DrawParams, Filter, RenderBackend, FAR_DEPTH, TargetFormat, TargetHandle, TextureHandle, Viewport,
};
use super::mesh::pixel_ray;
use super::transfer::{correct_alpha, label_color, MaskMode, RenderMode, ShadingParams, ShadowParams};

/// Accumulated opacity at which the shadow pass records a depth
const SHADOW_HIT_ALPHA: f32 = 0.5;

/// Relative depth difference a neighbour needs to count as an occluder
const SHADOW_EPSILON: f32 = 1e-4;

struct SoftTexture {
    dims: UVec3,
    format: TexelFormat,
    texels: Vec<u16>,
}

impl SoftTexture {
    #[inline]
    fn fetch(&self, p: IVec3) -> f32 {
        let d = self.dims.as_ivec3();
        let x = p.x.clamp(0, d.x - 1) as usize;
        let y = p.y.clamp(0, d.y - 1) as usize;
        let z = p.z.clamp(0, d.z - 1) as usize;
        self.texels[(z * d.y as usize + y) * d.x as usize + x] as f32
    }

    /// Sample at texel-space coordinates; texel centers sit at +0.5
    fn sample(&self, coord: Vec3, filter: Filter) -> f32 {
        match filter {
            Filter::Nearest => self.fetch(coord.floor().as_ivec3()),
            Filter::Linear => {
                let c = coord - Vec3::splat(0.5);
                let base = c.floor();
                let f = c - base;
                let b = base.as_ivec3();
                let mut acc = 0.0;
                for dz in 0..2 {
                    for dy in 0..2 {
                        for dx in 0..2 {
                            let w = if dx == 1 { f.x } else { 1.0 - f.x }
                                * if dy == 1 { f.y } else { 1.0 - f.y }
                                * if dz == 1 { f.z } else { 1.0 - f.z };
                            if w > 0.0 {
                                acc += w * self.fetch(b + IVec3::new(dx, dy, dz));
                            }
                        }
                    }
                }
                acc
            }
        }
    }
}

struct SoftTarget {
    viewport: Viewport,
    format: TargetFormat,
    pixels: Vec<[f32; 4]>,
}

impl SoftTarget {
    fn new(viewport: Viewport, format: TargetFormat) -> Self {
        Self { viewport, format, pixels: vec![[0.0; 4]; viewport.pixel_count()] }
    }

    /// Round stored values to the precision of the target format
    fn settle(&mut self) {
        match self.format {
            TargetFormat::Rgba32F => {}
            TargetFormat::Rgba16F => {
                for px in &mut self.pixels {
                    for c in px.iter_mut() {
                        *c = half::f16::from_f32(*c).to_f32();
                    }
                }
            }
            TargetFormat::Rgba8 => {
                for px in &mut self.pixels {
                    for c in px.iter_mut() {
                        *c = (c.clamp(0.0, 1.0) * 255.0).round() / 255.0;
                    }
                }
            }
        }
    }
}

/// One brick with its textures resolved for a draw call
struct Resolved<'a> {
    draw: &'a BrickDraw,
    data: &'a SoftTexture,
    mask: Option<&'a SoftTexture>,
    inv_spacing: Vec3,
}

impl Resolved<'_> {
    #[inline]
    fn texel_coord(&self, p: Vec3) -> Vec3 {
        (p - self.draw.voxel_origin) * self.inv_spacing
    }

    fn value(&self, coord: Vec3) -> f32 {
        self.data.sample(coord, self.draw.filter) / self.draw.max_value.max(1.0)
    }

    /// Central-difference gradient in normalized intensity per texel
    fn gradient(&self, coord: Vec3) -> Vec3 {
        let h = 1.0;
        Vec3::new(
            self.value(coord + Vec3::X * h) - self.value(coord - Vec3::X * h),
            self.value(coord + Vec3::Y * h) - self.value(coord - Vec3::Y * h),
            self.value(coord + Vec3::Z * h) - self.value(coord - Vec3::Z * h),
        ) * 0.5
    }
}

/// Per-pixel draw state shared by all rows
struct MarchContext<'a> {
    bricks: Vec<Resolved<'a>>,
    params: &'a DrawParams,
    light: Vec3,
    needs_gradient: bool,
}

/// Outcome of marching one pixel
enum PixelResult {
    Color([f32; 4]),
    Depth(f32),
    Nothing,
}

impl MarchContext<'_> {
    fn lighting(&self, shading: &ShadingParams, grad: Vec3, spacing_inv: Vec3, view: Vec3) -> f32 {
        let g = grad * spacing_inv;
        let len = g.length();
        if len < 1e-6 {
            return 1.0;
        }
        let mut n = -g / len;
        if n.dot(view) < 0.0 {
            n = -n;
        }
        let h = (self.light + view).normalize_or_zero();
        shading.ambient
            + shading.diffuse * n.dot(self.light).max(0.0)
            + shading.specular * n.dot(h).max(0.0).powf(shading.shininess)
    }

    fn march(&self, ray: &Ray, near: f32, far: f32) -> PixelResult {
        let params = self.params;
        let step = params.step.max(1e-6);
        let ratio = step / params.base_step.max(1e-6);

        let mut spans: Vec<(usize, f32, f32)> = Vec::with_capacity(self.bricks.len());
        for (i, b) in self.bricks.iter().enumerate() {
            if let Some((t0, t1)) = ray.intersects_aabb(&b.draw.region) {
                if t1 > t0 {
                    spans.push((i, t0, t1));
                }
            }
        }
        if spans.is_empty() {
            return PixelResult::Nothing;
        }
        let t_min = spans.iter().map(|s| s.1).fold(f32::MAX, f32::min);
        let t_max = spans.iter().map(|s| s.2).fold(f32::MIN, f32::max);
        let k_first = (t_min / step - 0.5).ceil().max(0.0) as u64;
        let view = -ray.direction;

        let mut acc = [0.0f32; 4];
        let mut mip: Option<(f32, usize, Vec3)> = None;
        let mut k = k_first;
        loop {
            let t = (k as f32 + 0.5) * step;
            if t >= t_max {
                break;
            }
            k += 1;
            if t <= near || t >= far {
                continue;
            }
            let p = ray.at(t);
            if !params.clip.contains(p) {
                continue;
            }
            for &(i, t0, t1) in &spans {
                if t < t0 || t >= t1 {
                    continue;
                }
                let b = &self.bricks[i];
                let coord = b.texel_coord(p);
                let v = b.value(coord);

                if params.pass == PassMode::Color && params.mode == RenderMode::Mip {
                    if mip.is_none_or(|(best, _, _)| v > best) {
                        mip = Some((v, i, coord));
                    }
                    continue;
                }

                let grad = if self.needs_gradient { b.gradient(coord) } else { Vec3::ZERO };
                let c = b.draw.transfer.classify(v, grad.length());
                if c[3] <= 0.0 {
                    continue;
                }
                let a = correct_alpha(c[3], ratio);
                let scale = a / c[3];

                let src = match params.pass {
                    PassMode::Color => {
                        let mut rgb = Vec3::new(c[0], c[1], c[2]) * scale;
                        if let Some(shading) = &params.shading {
                            rgb *= self.lighting(shading, grad, b.inv_spacing, view);
                        }
                        if let Some(fog) = &params.fog {
                            rgb *= fog.factor(t);
                        }
                        [rgb.x, rgb.y, rgb.z, a]
                    }
                    PassMode::Shading => {
                        let s = match &params.shading {
                            Some(shading) => self.lighting(shading, grad, b.inv_spacing, view),
                            None => 1.0,
                        };
                        [s * a, s * a, s * a, a]
                    }
                    PassMode::Shadow => [0.0, 0.0, 0.0, a],
                    PassMode::Mask => {
                        let Some(mask) = b.mask else { continue };
                        let m = mask.sample(coord, Filter::Nearest);
                        if m <= 0.0 {
                            continue;
                        }
                        let tint = match params.mask_mode {
                            MaskMode::Label => label_color(m as u16),
                            _ => b.draw.mask_color,
                        };
                        [tint.x * a, tint.y * a, tint.z * a, a]
                    }
                };
                acc = BlendMode::Under.apply(src, acc);

                if params.pass == PassMode::Shadow && acc[3] >= SHADOW_HIT_ALPHA {
                    return PixelResult::Depth(t);
                }
            }
        }

        if params.pass == PassMode::Color && params.mode == RenderMode::Mip {
            let Some((v, i, coord)) = mip else { return PixelResult::Nothing };
            let b = &self.bricks[i];
            let grad = if self.needs_gradient { b.gradient(coord).length() } else { 0.0 };
            let c = b.draw.transfer.classify(v, grad);
            return if c[3] > 0.0 { PixelResult::Color(c) } else { PixelResult::Nothing };
        }
        match params.pass {
            PassMode::Shadow => PixelResult::Nothing,
            _ if acc[3] > 0.0 => PixelResult::Color(acc),
            _ => PixelResult::Nothing,
        }
    }
}

/// Deterministic CPU implementation of [`RenderBackend`]
pub struct SoftwareBackend {
    textures: HashMap<u64, SoftTexture>,
    targets: HashMap<u64, SoftTarget>,
    next_id: u64,
    max_texture_size: u32,
    window: (Viewport, Vec<[u8; 4]>),
    uploads: u64,
    draw_calls: u64,
    brick_draws: u64,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::with_max_texture_size(2048)
    }

    pub fn with_max_texture_size(max_texture_size: u32) -> Self {
        Self {
            textures: HashMap::new(),
            targets: HashMap::new(),
            next_id: 1,
            max_texture_size,
            window: (Viewport::default(), Vec::new()),
            uploads: 0,
            draw_calls: 0,
            brick_draws: 0,
        }
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Texture uploads since creation
    pub fn upload_count(&self) -> u64 {
        self.uploads
    }

    /// `draw_bricks` calls since creation
    pub fn draw_count(&self) -> u64 {
        self.draw_calls
    }

    /// Bricks passed to `draw_bricks` since creation
    pub fn brick_draw_count(&self) -> u64 {
        self.brick_draws
    }

    pub fn reset_counters(&mut self) {
        self.uploads = 0;
        self.draw_calls = 0;
        self.brick_draws = 0;
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn target(&self, handle: TargetHandle) -> Result<&SoftTarget> {
        self.targets
            .get(&handle.0)
            .ok_or_else(|| Error::Render(format!("unknown render target {:?}", handle)))
    }

    fn target_mut(&mut self, handle: TargetHandle) -> Result<&mut SoftTarget> {
        self.targets
            .get_mut(&handle.0)
            .ok_or_else(|| Error::Render(format!("unknown render target {:?}", handle)))
    }

    /// Red channel of a depth target, checked against `viewport`
    fn depth_plane(&self, handle: Option<TargetHandle>, viewport: Viewport) -> Result<Option<Vec<f32>>> {
        let Some(handle) = handle else { return Ok(None) };
        let target = self.target(handle)?;
        if target.viewport != viewport {
            return Err(Error::Render(format!(
                "depth target {:?} is {:?}, expected {:?}",
                handle, target.viewport, viewport
            )));
        }
        Ok(Some(target.pixels.iter().map(|p| p[0]).collect()))
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderBackend for SoftwareBackend {
    fn name(&self) -> &str {
        "software"
    }

    fn max_texture_size(&self) -> u32 {
        self.max_texture_size
    }

    fn create_texture(&mut self, dims: UVec3, format: TexelFormat, _filter: Filter) -> Result<TextureHandle> {
        if dims.min_element() == 0 || dims.max_element() > self.max_texture_size {
            return Err(Error::Render(format!(
                "texture {:?} outside 1..={}",
                dims, self.max_texture_size
            )));
        }
        let id = self.alloc_id();
        let len = dims.x as usize * dims.y as usize * dims.z as usize;
        self.textures.insert(id, SoftTexture { dims, format, texels: vec![0; len] });
        Ok(TextureHandle(id))
    }

    fn upload_texture(&mut self, texture: TextureHandle, payload: &BrickPayload) -> Result<()> {
        let tex = self
            .textures
            .get_mut(&texture.0)
            .ok_or_else(|| Error::Render(format!("unknown texture {:?}", texture)))?;
        if tex.dims != payload.dims || tex.format != payload.format {
            return Err(Error::Render(format!(
                "payload {:?}/{:?} does not match texture {:?}/{:?}",
                payload.dims, payload.format, tex.dims, tex.format
            )));
        }
        if payload.bytes.len() != BrickPayload::expected_len(payload.dims, payload.format) {
            return Err(Error::Render(format!("payload holds {} bytes", payload.bytes.len())));
        }
        tex.texels = match payload.format {
            TexelFormat::R8 => payload.bytes.iter().map(|&b| b as u16).collect(),
            TexelFormat::R16 => payload
                .bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
        };
        self.uploads += 1;
        log::trace!("Uploaded texture {:?} {:?}", texture, payload.dims);
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
    }

    fn create_target(&mut self, viewport: Viewport, format: TargetFormat) -> Result<TargetHandle> {
        let id = self.alloc_id();
        self.targets.insert(id, SoftTarget::new(viewport, format));
        Ok(TargetHandle(id))
    }

    fn resize_target(&mut self, target: TargetHandle, viewport: Viewport) -> Result<()> {
        let t = self.target_mut(target)?;
        *t = SoftTarget::new(viewport, t.format);
        Ok(())
    }

    fn destroy_target(&mut self, target: TargetHandle) {
        self.targets.remove(&target.0);
    }

    fn clear_target(&mut self, target: TargetHandle, color: [f32; 4]) -> Result<()> {
        let t = self.target_mut(target)?;
        t.pixels.fill(color);
        t.settle();
        Ok(())
    }

    fn fill_gradient(&mut self, target: TargetHandle, top: [f32; 4], bottom: [f32; 4]) -> Result<()> {
        let t = self.target_mut(target)?;
        let Viewport { width, height } = t.viewport;
        if width == 0 {
            return Ok(());
        }
        for (y, row) in t.pixels.chunks_mut(width as usize).enumerate() {
            let f = (y as f32 + 0.5) / height as f32;
            let c: [f32; 4] = std::array::from_fn(|i| top[i] + (bottom[i] - top[i]) * f);
            row.fill(c);
        }
        t.settle();
        Ok(())
    }

    fn write_target(&mut self, target: TargetHandle, pixels: &[[f32; 4]]) -> Result<()> {
        let t = self.target_mut(target)?;
        if pixels.len() != t.pixels.len() {
            return Err(Error::Render(format!(
                "wrote {} pixels into a {}-pixel target",
                pixels.len(),
                t.pixels.len()
            )));
        }
        t.pixels.copy_from_slice(pixels);
        t.settle();
        Ok(())
    }

    fn draw_bricks(&mut self, target: TargetHandle, bricks: &[BrickDraw], params: &DrawParams) -> Result<()> {
        self.draw_calls += 1;
        self.brick_draws += bricks.len() as u64;
        if bricks.is_empty() {
            return Ok(());
        }
        let viewport = self.target(target)?.viewport;
        if viewport.is_empty() {
            return Ok(());
        }
        let near = self.depth_plane(params.peel.and_then(|p| p.near), viewport)?;
        let far = self.depth_plane(params.peel.and_then(|p| p.far), viewport)?;

        let mut resolved = Vec::with_capacity(bricks.len());
        for draw in bricks {
            let data = self
                .textures
                .get(&draw.data.0)
                .ok_or_else(|| Error::Render(format!("unknown texture {:?}", draw.data)))?;
            let mask = match draw.mask {
                Some(h) => Some(
                    self.textures
                        .get(&h.0)
                        .ok_or_else(|| Error::Render(format!("unknown texture {:?}", h)))?,
                ),
                None => None,
            };
            resolved.push(Resolved { draw, data, mask, inv_spacing: Vec3::ONE / draw.spacing });
        }
        let needs_gradient = params.shading.is_some()
            || params.pass == PassMode::Shading
            || bricks.iter().any(|b| b.transfer.uses_gradient());
        let ctx = MarchContext {
            bricks: resolved,
            params,
            light: params.light_dir.normalize_or_zero(),
            needs_gradient,
        };

        let inv_view_proj = params.inv_view_proj;
        let width = viewport.width as usize;
        let shadow = params.pass == PassMode::Shadow;
        let blend = params.blend;
        let t = self
            .targets
            .get_mut(&target.0)
            .ok_or_else(|| Error::Render(format!("unknown render target {:?}", target)))?;

        t.pixels.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
            for (x, px) in row.iter_mut().enumerate() {
                let i = y * width + x;
                let n = near.as_ref().map_or(f32::MIN, |d| d[i]);
                let f = far.as_ref().map_or(f32::MAX, |d| d[i]);
                let ray = pixel_ray(&inv_view_proj, viewport, x as u32, y as u32);
                match ctx.march(&ray, n, f) {
                    PixelResult::Color(c) => *px = blend.apply(c, *px),
                    PixelResult::Depth(d) if shadow => {
                        let d = d.min(px[0]);
                        *px = [d, d, d, 1.0];
                    }
                    _ => {}
                }
            }
        });
        t.settle();
        Ok(())
    }

    fn draw_lines(&mut self, target: TargetHandle, lines: &[(Vec3, Vec3)], color: [f32; 4], view_proj: &Mat4) -> Result<()> {
        let t = self.target_mut(target)?;
        let Viewport { width, height } = t.viewport;
        let premul = [color[0] * color[3], color[1] * color[3], color[2] * color[3], color[3]];
        let to_screen = |p: Vec3| -> Option<(f32, f32)> {
            let clip = *view_proj * p.extend(1.0);
            if clip.w <= 1e-6 {
                return None;
            }
            let ndc = clip.truncate() / clip.w;
            Some(((ndc.x + 1.0) * 0.5 * width as f32, (1.0 - ndc.y) * 0.5 * height as f32))
        };
        for &(a, b) in lines {
            let (Some((x0, y0)), Some((x1, y1))) = (to_screen(a), to_screen(b)) else { continue };
            let steps = (x1 - x0).abs().max((y1 - y0).abs()).ceil().max(1.0) as u32;
            let mut last = None;
            for s in 0..=steps {
                let f = s as f32 / steps as f32;
                let x = (x0 + (x1 - x0) * f).floor();
                let y = (y0 + (y1 - y0) * f).floor();
                if x < 0.0 || y < 0.0 || x >= width as f32 || y >= height as f32 {
                    continue;
                }
                let i = y as usize * width as usize + x as usize;
                if last == Some(i) {
                    continue;
                }
                last = Some(i);
                t.pixels[i] = BlendMode::Over.apply(premul, t.pixels[i]);
            }
        }
        t.settle();
        Ok(())
    }

    fn blend_target(&mut self, src: TargetHandle, dst: TargetHandle, mode: BlendMode) -> Result<()> {
        let source = self.target(src)?;
        let source_vp = source.viewport;
        let pixels = source.pixels.clone();
        let d = self.target_mut(dst)?;
        if d.viewport != source_vp {
            return Err(Error::Render(format!(
                "cannot blend {:?} into {:?}",
                source_vp, d.viewport
            )));
        }
        d.pixels
            .par_iter_mut()
            .zip(pixels.par_iter())
            .for_each(|(d, s)| *d = mode.apply(*s, *d));
        d.settle();
        Ok(())
    }

    fn apply_shadow(&mut self, depth: TargetHandle, dst: TargetHandle, params: &ShadowParams) -> Result<()> {
        let viewport = self.target(dst)?.viewport;
        let Some(depth) = self.depth_plane(Some(depth), viewport)? else { return Ok(()) };
        let (w, h) = (viewport.width as i64, viewport.height as i64);
        let r = params.radius as i64;
        let intensity = params.intensity.clamp(0.0, 1.0);
        let d = self.target_mut(dst)?;
        d.pixels.par_chunks_mut(w.max(1) as usize).enumerate().for_each(|(y, row)| {
            let y = y as i64;
            for (x, px) in row.iter_mut().enumerate() {
                let x = x as i64;
                let center = depth[(y * w + x) as usize];
                if center >= FAR_DEPTH {
                    continue;
                }
                let mut total = 0u32;
                let mut occluded = 0u32;
                for ny in (y - r).max(0)..=(y + r).min(h - 1) {
                    for nx in (x - r).max(0)..=(x + r).min(w - 1) {
                        if nx == x && ny == y {
                            continue;
                        }
                        total += 1;
                        if depth[(ny * w + nx) as usize] < center * (1.0 - SHADOW_EPSILON) {
                            occluded += 1;
                        }
                    }
                }
                if total == 0 {
                    continue;
                }
                let k = 1.0 - intensity * occluded as f32 / total as f32;
                px[0] *= k;
                px[1] *= k;
                px[2] *= k;
            }
        });
        d.settle();
        Ok(())
    }

    fn present(&mut self, source: TargetHandle, adjust: &ColorAdjust) -> Result<()> {
        let t = self.target(source)?;
        let viewport = t.viewport;
        let pixels = t.pixels.par_iter().map(|&p| adjust.to_rgba8(p)).collect();
        self.window = (viewport, pixels);
        Ok(())
    }

    fn fill_window_rect(&mut self, x: u32, y: u32, width: u32, height: u32, color: [u8; 4]) -> Result<()> {
        let (vp, pixels) = &mut self.window;
        let x1 = x.saturating_add(width).min(vp.width);
        let y1 = y.saturating_add(height).min(vp.height);
        for py in y.min(y1)..y1 {
            for px in x.min(x1)..x1 {
                pixels[(py * vp.width + px) as usize] = color;
            }
        }
        Ok(())
    }

    fn read_target(&mut self, target: TargetHandle) -> Result<Vec<[f32; 4]>> {
        Ok(self.target(target)?.pixels.clone())
    }

    fn read_window(&mut self) -> Result<(Viewport, Vec<[u8; 4]>)> {
        Ok(self.window.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Camera;
    use crate::math::{Aabb, ClipPlanes, Plane};
    use crate::render::transfer::{FogParams, TransferFunction};

    const VP: Viewport = Viewport { width: 16, height: 16 };

    fn camera() -> Camera {
        Camera::orthographic(Vec3::new(0.5, 0.5, 5.0), Vec3::new(0.5, 0.5, 0.0), Vec3::Y, 0.75)
    }

    fn params(camera: &Camera) -> DrawParams {
        let vp = camera.view_projection();
        DrawParams {
            view_proj: vp,
            inv_view_proj: vp.inverse(),
            step: 0.05,
            base_step: 0.05,
            pass: PassMode::Color,
            mode: RenderMode::Over,
            mask_mode: MaskMode::Off,
            shading: None,
            light_dir: Vec3::Z,
            fog: None,
            clip: ClipPlanes::none(),
            peel: None,
            blend: BlendMode::Under,
        }
    }

    /// Unit cube volume made of one brick filled with `value`
    fn cube(backend: &mut SoftwareBackend, dims: u32, f: impl Fn(u32, u32, u32) -> u8) -> BrickDraw {
        let dims3 = UVec3::splat(dims);
        let mut bytes = Vec::new();
        for z in 0..dims {
            for y in 0..dims {
                for x in 0..dims {
                    bytes.push(f(x, y, z));
                }
            }
        }
        let tex = backend.create_texture(dims3, TexelFormat::R8, Filter::Nearest).unwrap();
        backend
            .upload_texture(tex, &BrickPayload { dims: dims3, format: TexelFormat::R8, bytes })
            .unwrap();
        BrickDraw {
            data: tex,
            mask: None,
            dims: dims3,
            voxel_origin: Vec3::ZERO,
            spacing: Vec3::splat(1.0 / dims as f32),
            region: Aabb::new(Vec3::ZERO, Vec3::ONE),
            max_value: 255.0,
            filter: Filter::Nearest,
            transfer: TransferFunction::default(),
            mask_color: Vec3::new(1.0, 0.0, 0.0),
        }
    }

    fn center_pixel(backend: &mut SoftwareBackend, target: TargetHandle) -> [f32; 4] {
        backend.read_target(target).unwrap()[(8 * 16 + 8) as usize]
    }

    #[test]
    fn test_upload_validates_payload() {
        let mut backend = SoftwareBackend::new();
        let tex = backend.create_texture(UVec3::splat(2), TexelFormat::R8, Filter::Linear).unwrap();
        let wrong = BrickPayload { dims: UVec3::splat(3), format: TexelFormat::R8, bytes: vec![0; 27] };
        assert!(backend.upload_texture(tex, &wrong).is_err());
        assert!(backend.create_texture(UVec3::new(4096, 1, 1), TexelFormat::R8, Filter::Linear).is_err());
        assert_eq!(backend.upload_count(), 0);
    }

    #[test]
    fn test_linear_sampling_interpolates() {
        let tex = SoftTexture { dims: UVec3::new(2, 1, 1), format: TexelFormat::R8, texels: vec![0, 100] };
        assert_eq!(tex.sample(Vec3::new(1.0, 0.5, 0.5), Filter::Linear), 50.0);
        assert_eq!(tex.sample(Vec3::new(0.2, 0.5, 0.5), Filter::Linear), 0.0);
        assert_eq!(tex.sample(Vec3::new(1.2, 0.5, 0.5), Filter::Nearest), 100.0);
    }

    #[test]
    fn test_opaque_cube_covers_center() {
        let mut backend = SoftwareBackend::new();
        let brick = cube(&mut backend, 4, |_, _, _| 255);
        let target = backend.create_target(VP, TargetFormat::Rgba32F).unwrap();
        let cam = camera();
        backend.draw_bricks(target, &[brick], &params(&cam)).unwrap();

        let c = center_pixel(&mut backend, target);
        assert!((c[3] - 1.0).abs() < 1e-5);
        assert!((c[0] - 1.0).abs() < 1e-5);
        // Corner pixel lies outside the cube
        assert_eq!(backend.read_target(target).unwrap()[0], [0.0; 4]);
        assert_eq!(backend.draw_count(), 1);
    }

    #[test]
    fn test_mip_matches_over_for_single_voxel() {
        let mut backend = SoftwareBackend::new();
        let brick = cube(&mut backend, 4, |x, y, z| if (x, y, z) == (2, 2, 1) { 255 } else { 0 });
        let cam = camera();

        let over_t = backend.create_target(VP, TargetFormat::Rgba32F).unwrap();
        backend.draw_bricks(over_t, &[brick], &params(&cam)).unwrap();

        let mip_t = backend.create_target(VP, TargetFormat::Rgba32F).unwrap();
        let mut mip = params(&cam);
        mip.mode = RenderMode::Mip;
        mip.blend = BlendMode::Max;
        backend.draw_bricks(mip_t, &[brick], &mip).unwrap();

        let over = backend.read_target(over_t).unwrap();
        assert!(over.iter().any(|p| p[3] > 0.0));
        assert_eq!(over, backend.read_target(mip_t).unwrap());
    }

    #[test]
    fn test_clip_plane_removes_samples() {
        let mut backend = SoftwareBackend::new();
        let brick = cube(&mut backend, 4, |_, _, _| 255);
        let target = backend.create_target(VP, TargetFormat::Rgba32F).unwrap();
        let cam = camera();
        let mut p = params(&cam);
        p.clip.push(Plane::from_point_normal(Vec3::new(0.6, 0.0, 0.0), Vec3::X));
        backend.draw_bricks(target, &[brick], &p).unwrap();

        let pixels = backend.read_target(target).unwrap();
        // Column 8 sits at x ~0.55 and is clipped, column 12 at ~0.92 is kept
        assert_eq!(pixels[8 * 16 + 8][3], 0.0);
        assert!(pixels[8 * 16 + 12][3] > 0.99);
    }

    #[test]
    fn test_fog_darkens_far_samples() {
        let mut backend = SoftwareBackend::new();
        let brick = cube(&mut backend, 4, |_, _, _| 255);
        let cam = camera();
        let plain = backend.create_target(VP, TargetFormat::Rgba32F).unwrap();
        backend.draw_bricks(plain, &[brick], &params(&cam)).unwrap();

        let fogged = backend.create_target(VP, TargetFormat::Rgba32F).unwrap();
        let mut p = params(&cam);
        p.fog = Some(FogParams { intensity: 1.0, start: 0.0, end: 1.0 });
        backend.draw_bricks(fogged, &[brick], &p).unwrap();

        let a = center_pixel(&mut backend, plain);
        let b = center_pixel(&mut backend, fogged);
        assert!(b[0] < a[0]);
        assert_eq!(a[3], b[3]);
    }

    #[test]
    fn test_shadow_pass_writes_nearest_depth() {
        let mut backend = SoftwareBackend::new();
        let brick = cube(&mut backend, 4, |_, _, _| 255);
        let cam = camera();
        let depth = backend.create_target(VP, TargetFormat::Rgba32F).unwrap();
        backend.clear_target(depth, [FAR_DEPTH; 4]).unwrap();
        let mut p = params(&cam);
        p.pass = PassMode::Shadow;
        backend.draw_bricks(depth, &[brick], &p).unwrap();

        let pixels = backend.read_target(depth).unwrap();
        let d = pixels[8 * 16 + 8][0];
        // Near plane of the camera sits in front of the cube's z = 1 face
        assert!(d > 0.0 && d < FAR_DEPTH);
        assert_eq!(pixels[0][0], FAR_DEPTH);
    }

    #[test]
    fn test_peel_window_skips_front_layer() {
        let mut backend = SoftwareBackend::new();
        let brick = cube(&mut backend, 4, |_, _, _| 255);
        let cam = camera();
        let full = backend.create_target(VP, TargetFormat::Rgba32F).unwrap();
        backend.draw_bricks(full, &[brick], &params(&cam)).unwrap();

        let near = backend.create_target(VP, TargetFormat::Rgba32F).unwrap();
        backend.clear_target(near, [1e9; 4]).unwrap();
        let peeled = backend.create_target(VP, TargetFormat::Rgba32F).unwrap();
        let mut p = params(&cam);
        p.peel = Some(crate::render::backend::PeelWindow { near: Some(near), far: None });
        backend.draw_bricks(peeled, &[brick], &p).unwrap();

        assert!(center_pixel(&mut backend, full)[3] > 0.0);
        assert_eq!(center_pixel(&mut backend, peeled)[3], 0.0);
    }

    #[test]
    fn test_apply_shadow_darkens_occluded_pixels() {
        let mut backend = SoftwareBackend::new();
        let vp = Viewport::new(3, 1);
        let depth = backend.create_target(vp, TargetFormat::Rgba32F).unwrap();
        backend
            .write_target(depth, &[[1.0; 4], [2.0; 4], [FAR_DEPTH; 4]])
            .unwrap();
        let color = backend.create_target(vp, TargetFormat::Rgba32F).unwrap();
        backend.clear_target(color, [1.0; 4]).unwrap();
        backend
            .apply_shadow(depth, color, &ShadowParams { intensity: 1.0, radius: 1 })
            .unwrap();

        let out = backend.read_target(color).unwrap();
        assert_eq!(out[0], [1.0; 4]);
        assert_eq!(out[1], [0.5, 0.5, 0.5, 1.0]);
        assert_eq!(out[2], [1.0; 4]);
    }

    #[test]
    fn test_rgba8_target_quantizes() {
        let mut backend = SoftwareBackend::new();
        let t = backend.create_target(Viewport::new(1, 1), TargetFormat::Rgba8).unwrap();
        backend.clear_target(t, [0.5, 2.0, -1.0, 1.0]).unwrap();
        let p = backend.read_target(t).unwrap()[0];
        assert_eq!(p, [128.0 / 255.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_lines_and_present() {
        let mut backend = SoftwareBackend::new();
        let cam = camera();
        let t = backend.create_target(VP, TargetFormat::Rgba32F).unwrap();
        backend
            .draw_lines(t, &[(Vec3::new(0.0, 0.5, 0.5), Vec3::new(1.0, 0.5, 0.5))], [0.0, 1.0, 0.0, 1.0], &cam.view_projection())
            .unwrap();
        assert!(backend.read_target(t).unwrap().iter().any(|p| p[1] == 1.0));

        backend.present(t, &ColorAdjust::default()).unwrap();
        backend.fill_window_rect(14, 14, 10, 10, [9, 9, 9, 255]).unwrap();
        let (vp, window) = backend.read_window().unwrap();
        assert_eq!(vp, VP);
        assert_eq!(window[15 * 16 + 15], [9, 9, 9, 255]);
        assert!(window.iter().any(|p| p[1] == 255));
    }
}
