//! [`RenderBackend`] on wgpu compute shaders
//!
//! Brick textures are integer 3D textures sampled with `textureLoad`, so
//! linear filtering happens in the shader. Render targets are storage
//! buffers of `vec4<f32>`; lower-precision formats are rounded after every
//! write by the settle kernel. The window image is an RGBA8 storage texture
//! read back on demand.

use std::collections::HashMap;

use crate::core::error::Error;
use crate::core::types::{Mat4, UVec3, Vec3};
use crate::core::Result;
use crate::render::adjust::ColorAdjust;
use crate::render::backend::{
    BlendMode, BrickDraw, DrawParams, Filter, RenderBackend, TargetFormat, TargetHandle, TextureHandle, Viewport,
};
use crate::render::program::ShaderKey;
use crate::render::transfer::ShadowParams;
use crate::volume::{BrickPayload, PassMode, TexelFormat};

use super::context::GpuContext;
use super::kernels::{
    tiles, BlendParams, BrickParams, FillParams, Kernels, LineParams, LineSegment, MarchParams, PresentParams,
    RaymarchKernel, SettleParams, ShadowKernelParams, SLAB_SLOTS,
};

const PIXEL_BYTES: u64 = 16;

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    dims: UVec3,
    format: TexelFormat,
}

struct GpuTarget {
    buffer: wgpu::Buffer,
    viewport: Viewport,
    format: TargetFormat,
}

struct WindowImage {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    viewport: Viewport,
}

fn texel_format(format: TexelFormat) -> wgpu::TextureFormat {
    match format {
        TexelFormat::R8 => wgpu::TextureFormat::R8Uint,
        TexelFormat::R16 => wgpu::TextureFormat::R16Uint,
    }
}

fn extent(dims: UVec3) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: dims.x,
        height: dims.y,
        depth_or_array_layers: dims.z,
    }
}

/// Headless GPU implementation of [`RenderBackend`]
pub struct WgpuBackend {
    gpu: GpuContext,
    kernels: Kernels,
    raymarch: RaymarchKernel,
    textures: HashMap<u64, GpuTexture>,
    targets: HashMap<u64, GpuTarget>,
    window: Option<WindowImage>,
    window_viewport: Viewport,
    /// Bound to unused texture slots
    empty_texture: GpuTexture,
    /// Bound when a draw has no peel bound
    empty_depth: wgpu::Buffer,
    next_id: u64,
    uploads: u64,
}

impl WgpuBackend {
    pub async fn new() -> Result<Self> {
        let gpu = GpuContext::new().await?;
        Ok(Self::with_context(gpu))
    }

    pub fn with_context(gpu: GpuContext) -> Self {
        let kernels = Kernels::new(&gpu.device);
        let raymarch = RaymarchKernel::new(&gpu.device);
        let empty_texture = Self::make_texture(&gpu.device, UVec3::ONE, TexelFormat::R8);
        gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &empty_texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &[0u8],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(1),
                rows_per_image: Some(1),
            },
            extent(UVec3::ONE),
        );
        let empty_depth = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("empty_depth"),
            size: PIXEL_BYTES,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        Self {
            gpu,
            kernels,
            raymarch,
            textures: HashMap::new(),
            targets: HashMap::new(),
            window: None,
            window_viewport: Viewport::default(),
            empty_texture,
            empty_depth,
            next_id: 1,
            uploads: 0,
        }
    }

    pub fn context(&self) -> &GpuContext {
        &self.gpu
    }

    /// Texture uploads since creation
    pub fn upload_count(&self) -> u64 {
        self.uploads
    }

    /// Ray-march program variants compiled so far
    pub fn program_count(&self) -> u64 {
        self.raymarch.compiles()
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn make_texture(device: &wgpu::Device, dims: UVec3, format: TexelFormat) -> GpuTexture {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("brick_texture"),
            size: extent(dims),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D3,
            format: texel_format(format),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        GpuTexture {
            texture,
            view,
            dims,
            format,
        }
    }

    fn make_target_buffer(&self, viewport: Viewport) -> wgpu::Buffer {
        self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("render_target"),
            size: viewport.pixel_count().max(1) as u64 * PIXEL_BYTES,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    fn target(&self, handle: TargetHandle) -> Result<&GpuTarget> {
        self.targets
            .get(&handle.0)
            .ok_or_else(|| Error::Render(format!("unknown render target {:?}", handle)))
    }

    fn texture(&self, handle: TextureHandle) -> Result<&GpuTexture> {
        self.textures
            .get(&handle.0)
            .ok_or_else(|| Error::Render(format!("unknown texture {:?}", handle)))
    }

    /// Round a target to its format's precision
    fn settle(&self, handle: TargetHandle) -> Result<()> {
        let t = self.target(handle)?;
        let format = match t.format {
            TargetFormat::Rgba32F => return Ok(()),
            TargetFormat::Rgba16F => 1,
            TargetFormat::Rgba8 => 2,
        };
        if t.viewport.is_empty() {
            return Ok(());
        }
        let Viewport { width, height } = t.viewport;
        self.kernels.settle.dispatch(
            &self.gpu.device,
            &self.gpu.queue,
            &SettleParams { width, height, format, _pad: 0 },
            &[t.buffer.as_entire_binding()],
            tiles(width, height),
        );
        Ok(())
    }

    fn fill(&self, handle: TargetHandle, top: [f32; 4], bottom: [f32; 4]) -> Result<()> {
        let t = self.target(handle)?;
        if t.viewport.is_empty() {
            return Ok(());
        }
        let Viewport { width, height } = t.viewport;
        self.kernels.fill.dispatch(
            &self.gpu.device,
            &self.gpu.queue,
            &FillParams { top, bottom, width, height, _pad: [0; 2] },
            &[t.buffer.as_entire_binding()],
            tiles(width, height),
        );
        self.settle(handle)
    }

    /// Copy a buffer prefix into a mappable buffer and read it
    fn read_back(&self, source: &wgpu::Buffer, size: u64) -> Result<Vec<u8>> {
        let staging = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback_staging"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback_encoder") });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        self.gpu.read_buffer(&staging, size)
    }

    /// Peel bound buffer, checked against the target's viewport
    fn depth_buffer(&self, handle: Option<TargetHandle>, viewport: Viewport) -> Result<&wgpu::Buffer> {
        let Some(handle) = handle else { return Ok(&self.empty_depth) };
        let t = self.target(handle)?;
        if t.viewport != viewport {
            return Err(Error::Render(format!(
                "depth target {:?} is {:?}, expected {:?}",
                handle, t.viewport, viewport
            )));
        }
        Ok(&t.buffer)
    }

    fn brick_params(draw: &BrickDraw, has_mask: bool) -> BrickParams {
        let inv_spacing = Vec3::ONE / draw.spacing;
        let linear = if draw.filter == Filter::Linear { 1.0 } else { 0.0 };
        BrickParams {
            origin: draw.voxel_origin.extend(draw.max_value).to_array(),
            inv_spacing: inv_spacing.extend(linear).to_array(),
            region_min: draw.region.min.extend(0.0).to_array(),
            region_max: draw.region.max.extend(0.0).to_array(),
            mask_color: draw.mask_color.extend(if has_mask { 1.0 } else { 0.0 }).to_array(),
            dims: draw.dims.extend(0).to_array(),
            transfer: draw.transfer.to_uniform(),
        }
    }

    /// One dispatch for up to [`SLAB_SLOTS`] bricks
    fn march_chunk(&mut self, target: TargetHandle, chunk: &[BrickDraw], params: &DrawParams) -> Result<()> {
        let viewport = self.target(target)?.viewport;
        let filter = chunk.first().map_or(Filter::Linear, |b| b.filter);
        let colormap = chunk.iter().any(|b| b.transfer.colormap.is_some());
        let key = ShaderKey::for_draw(params, chunk.len(), filter, colormap);
        self.raymarch.program(&self.gpu.device, key)?;

        let bricks: Vec<BrickParams> = chunk
            .iter()
            .map(|b| Self::brick_params(b, params.pass == PassMode::Mask && b.mask.is_some()))
            .collect();
        let brick_buffer = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("slab_bricks"),
            size: (bricks.len() * std::mem::size_of::<BrickParams>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.gpu.queue.write_buffer(&brick_buffer, 0, bytemuck::cast_slice(&bricks));

        let needs_gradient = params.shading.is_some()
            || params.pass == PassMode::Shading
            || chunk.iter().any(|b| b.transfer.uses_gradient());
        let shading = params.shading.unwrap_or_default();
        let fog = params.fog.map_or([0.0; 4], |f| [f.intensity, f.start, f.end, 0.0]);
        let uniform = MarchParams {
            inv_view_proj: params.inv_view_proj.to_cols_array_2d(),
            clip: params.clip.to_uniform().map(|p| p.to_array()),
            light_dir: params.light_dir.normalize_or_zero().extend(0.0).to_array(),
            shading: [shading.ambient, shading.diffuse, shading.specular, shading.shininess],
            fog,
            width: viewport.width,
            height: viewport.height,
            brick_count: chunk.len() as u32,
            blend: params.blend.index(),
            step: params.step,
            base_step: params.base_step,
            gradient: u32::from(needs_gradient),
            _pad: 0,
        };
        self.gpu
            .queue
            .write_buffer(self.raymarch.params(), 0, bytemuck::bytes_of(&uniform));

        let mut views = Vec::with_capacity(SLAB_SLOTS);
        for slot in 0..SLAB_SLOTS {
            let view = match chunk.get(slot) {
                Some(b) => &self.texture(b.data)?.view,
                None => &self.empty_texture.view,
            };
            views.push(view);
        }
        let mask_view = match chunk.first().and_then(|b| b.mask) {
            Some(h) if params.pass == PassMode::Mask => &self.texture(h)?.view,
            _ => &self.empty_texture.view,
        };
        let near = self.depth_buffer(params.peel.and_then(|p| p.near), viewport)?;
        let far = self.depth_buffer(params.peel.and_then(|p| p.far), viewport)?;
        let dst = &self.target(target)?.buffer;

        let mut entries = vec![
            wgpu::BindGroupEntry { binding: 0, resource: self.raymarch.params().as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: brick_buffer.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 2, resource: dst.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 3, resource: near.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 4, resource: far.as_entire_binding() },
        ];
        for (slot, view) in views.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: 5 + slot as u32,
                resource: wgpu::BindingResource::TextureView(view),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: 5 + SLAB_SLOTS as u32,
            resource: wgpu::BindingResource::TextureView(mask_view),
        });
        let bind_group = self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("raymarch_bg"),
            layout: self.raymarch.layout(),
            entries: &entries,
        });

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("raymarch_encoder") });
        {
            let pipeline = self.raymarch.cached(&key)?;
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("raymarch_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let (x, y) = tiles(viewport.width, viewport.height);
            pass.dispatch_workgroups(x, y, 1);
        }
        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn ensure_window(&mut self, viewport: Viewport) {
        self.window_viewport = viewport;
        if viewport.is_empty() {
            self.window = None;
            return;
        }
        if self.window.as_ref().is_some_and(|w| w.viewport == viewport) {
            return;
        }
        let texture = self.gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("window_image"),
            size: wgpu::Extent3d {
                width: viewport.width,
                height: viewport.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.window = Some(WindowImage { texture, view, viewport });
    }
}

impl RenderBackend for WgpuBackend {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn max_texture_size(&self) -> u32 {
        self.gpu.max_texture_size()
    }

    fn create_texture(&mut self, dims: UVec3, format: TexelFormat, _filter: Filter) -> Result<TextureHandle> {
        let max = self.max_texture_size();
        if dims.min_element() == 0 || dims.max_element() > max {
            return Err(Error::Render(format!("texture {:?} outside 1..={}", dims, max)));
        }
        let id = self.alloc_id();
        let texture = Self::make_texture(&self.gpu.device, dims, format);
        self.textures.insert(id, texture);
        Ok(TextureHandle(id))
    }

    fn upload_texture(&mut self, texture: TextureHandle, payload: &BrickPayload) -> Result<()> {
        let tex = self.texture(texture)?;
        if tex.dims != payload.dims || tex.format != payload.format {
            return Err(Error::Render(format!(
                "payload {:?}/{:?} does not match texture {:?}/{:?}",
                payload.dims, payload.format, tex.dims, tex.format
            )));
        }
        if payload.bytes.len() != BrickPayload::expected_len(payload.dims, payload.format) {
            return Err(Error::Render(format!("payload holds {} bytes", payload.bytes.len())));
        }
        let row = payload.dims.x * payload.format.bytes_per_texel() as u32;
        self.gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &tex.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &payload.bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(row),
                rows_per_image: Some(payload.dims.y),
            },
            extent(payload.dims),
        );
        self.uploads += 1;
        log::trace!("Uploaded texture {:?} {:?}", texture, payload.dims);
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(tex) = self.textures.remove(&texture.0) {
            tex.texture.destroy();
        }
    }

    fn create_target(&mut self, viewport: Viewport, format: TargetFormat) -> Result<TargetHandle> {
        let id = self.alloc_id();
        let buffer = self.make_target_buffer(viewport);
        self.targets.insert(id, GpuTarget { buffer, viewport, format });
        Ok(TargetHandle(id))
    }

    fn resize_target(&mut self, target: TargetHandle, viewport: Viewport) -> Result<()> {
        let buffer = self.make_target_buffer(viewport);
        let t = self
            .targets
            .get_mut(&target.0)
            .ok_or_else(|| Error::Render(format!("unknown render target {:?}", target)))?;
        t.buffer.destroy();
        t.buffer = buffer;
        t.viewport = viewport;
        Ok(())
    }

    fn destroy_target(&mut self, target: TargetHandle) {
        if let Some(t) = self.targets.remove(&target.0) {
            t.buffer.destroy();
        }
    }

    fn clear_target(&mut self, target: TargetHandle, color: [f32; 4]) -> Result<()> {
        self.fill(target, color, color)
    }

    fn fill_gradient(&mut self, target: TargetHandle, top: [f32; 4], bottom: [f32; 4]) -> Result<()> {
        self.fill(target, top, bottom)
    }

    fn write_target(&mut self, target: TargetHandle, pixels: &[[f32; 4]]) -> Result<()> {
        let t = self.target(target)?;
        if pixels.len() != t.viewport.pixel_count() {
            return Err(Error::Render(format!(
                "wrote {} pixels into a {}-pixel target",
                pixels.len(),
                t.viewport.pixel_count()
            )));
        }
        if pixels.is_empty() {
            return Ok(());
        }
        self.gpu.queue.write_buffer(&t.buffer, 0, bytemuck::cast_slice(pixels));
        self.settle(target)
    }

    fn draw_bricks(&mut self, target: TargetHandle, bricks: &[BrickDraw], params: &DrawParams) -> Result<()> {
        if bricks.is_empty() || self.target(target)?.viewport.is_empty() {
            return Ok(());
        }
        // Mask textures bind one at a time
        let chunk = if params.pass == PassMode::Mask { 1 } else { SLAB_SLOTS };
        for slab in bricks.chunks(chunk) {
            self.march_chunk(target, slab, params)?;
        }
        self.settle(target)
    }

    fn draw_lines(&mut self, target: TargetHandle, lines: &[(Vec3, Vec3)], color: [f32; 4], view_proj: &Mat4) -> Result<()> {
        let t = self.target(target)?;
        if lines.is_empty() || t.viewport.is_empty() {
            return Ok(());
        }
        let segments: Vec<LineSegment> = lines
            .iter()
            .map(|(a, b)| LineSegment { a: a.extend(1.0).to_array(), b: b.extend(1.0).to_array() })
            .collect();
        let segment_buffer = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("line_segments"),
            size: (segments.len() * std::mem::size_of::<LineSegment>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.gpu.queue.write_buffer(&segment_buffer, 0, bytemuck::cast_slice(&segments));

        let Viewport { width, height } = t.viewport;
        let params = LineParams {
            view_proj: view_proj.to_cols_array_2d(),
            color: [color[0] * color[3], color[1] * color[3], color[2] * color[3], color[3]],
            width,
            height,
            count: segments.len() as u32,
            _pad: 0,
        };
        self.kernels.lines.dispatch(
            &self.gpu.device,
            &self.gpu.queue,
            &params,
            &[segment_buffer.as_entire_binding(), t.buffer.as_entire_binding()],
            ((segments.len() as u32 + 63) / 64, 1),
        );
        self.settle(target)
    }

    fn blend_target(&mut self, src: TargetHandle, dst: TargetHandle, mode: BlendMode) -> Result<()> {
        let s = self.target(src)?;
        let d = self.target(dst)?;
        if s.viewport != d.viewport {
            return Err(Error::Render(format!("cannot blend {:?} into {:?}", s.viewport, d.viewport)));
        }
        if d.viewport.is_empty() {
            return Ok(());
        }
        // A buffer cannot be bound for reading and writing in one dispatch
        let copy;
        let source = if src == dst {
            let size = d.viewport.pixel_count() as u64 * PIXEL_BYTES;
            copy = self.make_target_buffer(d.viewport);
            let mut encoder = self
                .gpu
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("blend_copy") });
            encoder.copy_buffer_to_buffer(&s.buffer, 0, &copy, 0, size);
            self.gpu.queue.submit(std::iter::once(encoder.finish()));
            &copy
        } else {
            &s.buffer
        };
        let Viewport { width, height } = d.viewport;
        self.kernels.blend.dispatch(
            &self.gpu.device,
            &self.gpu.queue,
            &BlendParams { width, height, mode: mode.index(), _pad: 0 },
            &[source.as_entire_binding(), d.buffer.as_entire_binding()],
            tiles(width, height),
        );
        self.settle(dst)
    }

    fn apply_shadow(&mut self, depth: TargetHandle, dst: TargetHandle, params: &ShadowParams) -> Result<()> {
        let d = self.target(dst)?;
        let viewport = d.viewport;
        if viewport.is_empty() || depth == dst {
            return Ok(());
        }
        let depth_buffer = self.depth_buffer(Some(depth), viewport)?;
        let Viewport { width, height } = viewport;
        self.kernels.shadow.dispatch(
            &self.gpu.device,
            &self.gpu.queue,
            &ShadowKernelParams {
                width,
                height,
                radius: params.radius,
                _pad0: 0,
                intensity: params.intensity,
                _pad1: [0.0; 3],
            },
            &[depth_buffer.as_entire_binding(), d.buffer.as_entire_binding()],
            tiles(width, height),
        );
        self.settle(dst)
    }

    fn present(&mut self, source: TargetHandle, adjust: &ColorAdjust) -> Result<()> {
        let viewport = self.target(source)?.viewport;
        self.ensure_window(viewport);
        let (Some(window), Ok(t)) = (&self.window, self.target(source)) else { return Ok(()) };
        let a = adjust.to_uniform();
        let Viewport { width, height } = viewport;
        self.kernels.present.dispatch(
            &self.gpu.device,
            &self.gpu.queue,
            &PresentParams {
                gamma: a.gamma,
                brightness: a.brightness,
                hdr: a.hdr,
                width,
                height,
                _pad: [0; 2],
            },
            &[t.buffer.as_entire_binding(), wgpu::BindingResource::TextureView(&window.view)],
            tiles(width, height),
        );
        Ok(())
    }

    fn fill_window_rect(&mut self, x: u32, y: u32, width: u32, height: u32, color: [u8; 4]) -> Result<()> {
        let Some(window) = &self.window else { return Ok(()) };
        let vp = window.viewport;
        let x1 = x.saturating_add(width).min(vp.width);
        let y1 = y.saturating_add(height).min(vp.height);
        let (x0, y0) = (x.min(x1), y.min(y1));
        if x1 == x0 || y1 == y0 {
            return Ok(());
        }
        let (w, h) = (x1 - x0, y1 - y0);
        let bytes = color.repeat((w * h) as usize);
        self.gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &window.texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x: x0, y: y0, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            &bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(w * 4),
                rows_per_image: Some(h),
            },
            wgpu::Extent3d { width: w, height: h, depth_or_array_layers: 1 },
        );
        Ok(())
    }

    fn read_target(&mut self, target: TargetHandle) -> Result<Vec<[f32; 4]>> {
        let t = self.target(target)?;
        let count = t.viewport.pixel_count();
        if count == 0 {
            return Ok(Vec::new());
        }
        let bytes = self.read_back(&t.buffer, count as u64 * PIXEL_BYTES)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    fn read_window(&mut self) -> Result<(Viewport, Vec<[u8; 4]>)> {
        let Some(window) = &self.window else {
            return Ok((self.window_viewport, Vec::new()));
        };
        let Viewport { width, height } = window.viewport;
        let unpadded = width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = (unpadded + align - 1) / align * align;
        let size = padded as u64 * height as u64;

        let staging = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("window_staging"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("window_readback") });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &window.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
        );
        self.gpu.queue.submit(std::iter::once(encoder.finish()));

        let data = self.gpu.read_buffer(&staging, size)?;
        let mut pixels = Vec::with_capacity((width * height) as usize);
        for row in data.chunks_exact(padded as usize) {
            for px in row[..unpadded as usize].chunks_exact(4) {
                pixels.push([px[0], px[1], px[2], px[3]]);
            }
        }
        Ok((window.viewport, pixels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Camera;
    use crate::math::{Aabb, ClipPlanes};
    use crate::render::software::SoftwareBackend;
    use crate::render::transfer::{MaskMode, RenderMode, TransferFunction};

    /// None on machines without a usable adapter
    fn gpu() -> Option<WgpuBackend> {
        match pollster::block_on(WgpuBackend::new()) {
            Ok(backend) => Some(backend),
            Err(e) => {
                eprintln!("skipping GPU test: {}", e);
                None
            }
        }
    }

    const VP: Viewport = Viewport { width: 8, height: 8 };

    fn cube(backend: &mut dyn RenderBackend) -> BrickDraw {
        let dims = UVec3::splat(4);
        let bytes: Vec<u8> = (0..64u32).map(|i| if (i / 16) % 2 == 0 { 200 } else { 90 }).collect();
        let data = backend.create_texture(dims, TexelFormat::R8, Filter::Nearest).unwrap();
        backend
            .upload_texture(data, &BrickPayload { dims, format: TexelFormat::R8, bytes })
            .unwrap();
        BrickDraw {
            data,
            mask: None,
            dims,
            voxel_origin: Vec3::ZERO,
            spacing: Vec3::splat(0.25),
            region: Aabb::new(Vec3::ZERO, Vec3::ONE),
            max_value: 255.0,
            filter: Filter::Nearest,
            transfer: TransferFunction { alpha: 0.5, ..Default::default() },
            mask_color: Vec3::ONE,
        }
    }

    fn params() -> DrawParams {
        let camera = Camera::orthographic(Vec3::new(0.5, 0.5, 5.0), Vec3::new(0.5, 0.5, 0.0), Vec3::Y, 0.75);
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

    #[test]
    fn test_clear_blend_and_read_back() {
        let Some(mut gpu) = gpu() else { return };
        let a = gpu.create_target(VP, TargetFormat::Rgba32F).unwrap();
        let b = gpu.create_target(VP, TargetFormat::Rgba32F).unwrap();
        gpu.clear_target(a, [0.5, 0.0, 0.0, 0.5]).unwrap();
        gpu.clear_target(b, [0.0, 0.0, 1.0, 1.0]).unwrap();
        gpu.blend_target(b, a, BlendMode::Under).unwrap();
        let px = gpu.read_target(a).unwrap();
        assert_eq!(px.len(), VP.pixel_count());
        assert_eq!(px[0], [0.5, 0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_rgba8_targets_are_quantized() {
        let Some(mut gpu) = gpu() else { return };
        let t = gpu.create_target(VP, TargetFormat::Rgba8).unwrap();
        gpu.clear_target(t, [0.3, 0.3, 0.3, 1.0]).unwrap();
        let v = gpu.read_target(t).unwrap()[0][0];
        assert!((v - 77.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_present_and_rect_reach_window() {
        let Some(mut gpu) = gpu() else { return };
        let t = gpu.create_target(VP, TargetFormat::Rgba32F).unwrap();
        gpu.clear_target(t, [0.2, 0.2, 0.2, 1.0]).unwrap();
        gpu.present(t, &ColorAdjust::default()).unwrap();
        gpu.fill_window_rect(0, 0, 2, 2, [255, 0, 0, 255]).unwrap();
        let (vp, pixels) = gpu.read_window().unwrap();
        assert_eq!(vp, VP);
        assert_eq!(pixels[0], [255, 0, 0, 255]);
        assert_eq!(pixels[VP.pixel_count() - 1], [51, 51, 51, 255]);
    }

    fn render_cube(backend: &mut dyn RenderBackend, params: &DrawParams) -> Vec<[f32; 4]> {
        let brick = cube(backend);
        let t = backend.create_target(VP, TargetFormat::Rgba32F).unwrap();
        backend.clear_target(t, [0.0; 4]).unwrap();
        backend.draw_bricks(t, &[brick], params).unwrap();
        backend.read_target(t).unwrap()
    }

    #[test]
    fn test_raymarch_matches_software() {
        let Some(mut gpu) = gpu() else { return };
        let params = params();
        let expected = render_cube(&mut SoftwareBackend::new(), &params);
        let actual = render_cube(&mut gpu, &params);
        for (e, a) in expected.iter().zip(&actual) {
            for c in 0..4 {
                assert!((e[c] - a[c]).abs() < 1e-3, "{:?} vs {:?}", e, a);
            }
        }
        assert!(actual[VP.pixel_count() / 2 + 4][3] > 0.0);
        assert_eq!(gpu.program_count(), 1);
    }
}
