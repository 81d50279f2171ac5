//! Compute pipelines of the wgpu backend
//!
//! Every kernel reads a small uniform at binding 0 followed by its buffers
//! and textures. Parameters are written right before each dispatch and the
//! encoder is submitted immediately, so one uniform buffer per kernel is
//! enough.

use bytemuck::{Pod, Zeroable};

use crate::core::error::Error;
use crate::core::Result;
use crate::render::program::{ProgramCache, ShaderKey};
use crate::render::transfer::{MaskMode, RenderMode, TransferUniform};
use crate::volume::PassMode;

/// Brick texture slots of one ray-march dispatch
pub const SLAB_SLOTS: usize = 8;

const TILE: u32 = 8;

/// Workgroups covering a `width` x `height` image with 8x8 tiles
pub fn tiles(width: u32, height: u32) -> (u32, u32) {
    ((width + TILE - 1) / TILE, (height + TILE - 1) / TILE)
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct FillParams {
    pub top: [f32; 4],
    pub bottom: [f32; 4],
    pub width: u32,
    pub height: u32,
    pub _pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct BlendParams {
    pub width: u32,
    pub height: u32,
    pub mode: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct SettleParams {
    pub width: u32,
    pub height: u32,
    /// 1 = rgba16f, 2 = rgba8
    pub format: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ShadowKernelParams {
    pub width: u32,
    pub height: u32,
    pub radius: u32,
    pub _pad0: u32,
    pub intensity: f32,
    pub _pad1: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct LineParams {
    pub view_proj: [[f32; 4]; 4],
    /// Premultiplied
    pub color: [f32; 4],
    pub width: u32,
    pub height: u32,
    pub count: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct LineSegment {
    pub a: [f32; 4],
    pub b: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct PresentParams {
    pub gamma: [f32; 4],
    pub brightness: [f32; 4],
    pub hdr: [f32; 4],
    pub width: u32,
    pub height: u32,
    pub _pad: [u32; 2],
}

/// Per-draw uniform of the ray-march kernel
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct MarchParams {
    pub inv_view_proj: [[f32; 4]; 4],
    pub clip: [[f32; 4]; 6],
    pub light_dir: [f32; 4],
    /// ambient, diffuse, specular, shininess
    pub shading: [f32; 4],
    /// intensity, start, end
    pub fog: [f32; 4],
    pub width: u32,
    pub height: u32,
    pub brick_count: u32,
    pub blend: u32,
    pub step: f32,
    pub base_step: f32,
    pub gradient: u32,
    pub _pad: u32,
}

/// One entry of the ray-march brick array
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct BrickParams {
    /// xyz voxel origin, w max value
    pub origin: [f32; 4],
    /// w = 1 for linear filtering
    pub inv_spacing: [f32; 4],
    pub region_min: [f32; 4],
    pub region_max: [f32; 4],
    /// w = 1 when a mask texture is bound
    pub mask_color: [f32; 4],
    pub dims: [u32; 4],
    pub transfer: TransferUniform,
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn volume_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Uint,
            view_dimension: wgpu::TextureViewDimension::D3,
            multisampled: false,
        },
        count: None,
    }
}

fn window_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: wgpu::TextureFormat::Rgba8Unorm,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        count: None,
    }
}

fn params_buffer(device: &wgpu::Device, label: &str, size: usize) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: size as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Single-entry compute pipeline with a uniform at binding 0
pub struct Kernel {
    name: &'static str,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    params: wgpu::Buffer,
}

impl Kernel {
    fn new(
        device: &wgpu::Device,
        name: &'static str,
        source: &'static str,
        resources: &[wgpu::BindGroupLayoutEntry],
        params_size: usize,
    ) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(name),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let mut entries = vec![uniform_entry(0)];
        entries.extend_from_slice(resources);
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(name),
            entries: &entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(name),
            bind_group_layouts: &[&layout],
            immediate_size: 0,
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(name),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        Self {
            name,
            pipeline,
            layout,
            params: params_buffer(device, name, params_size),
        }
    }

    /// Write `params`, bind `resources` from binding 1 on and submit one dispatch
    pub fn dispatch<P: Pod>(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        params: &P,
        resources: &[wgpu::BindingResource<'_>],
        groups: (u32, u32),
    ) {
        queue.write_buffer(&self.params, 0, bytemuck::bytes_of(params));
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: self.params.as_entire_binding(),
        }];
        for (i, resource) in resources.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: resource.clone(),
            });
        }
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(self.name),
            layout: &self.layout,
            entries: &entries,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(self.name) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(self.name),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups.0.max(1), groups.1.max(1), 1);
        }
        queue.submit(std::iter::once(encoder.finish()));
    }
}

/// The fixed compositing kernels
pub struct Kernels {
    pub fill: Kernel,
    pub blend: Kernel,
    pub settle: Kernel,
    pub shadow: Kernel,
    pub lines: Kernel,
    pub present: Kernel,
}

impl Kernels {
    pub fn new(device: &wgpu::Device) -> Self {
        Self {
            fill: Kernel::new(
                device,
                "fill",
                include_str!("../../../shaders/fill.wgsl"),
                &[storage_entry(1, false)],
                std::mem::size_of::<FillParams>(),
            ),
            blend: Kernel::new(
                device,
                "blend",
                include_str!("../../../shaders/blend.wgsl"),
                &[storage_entry(1, true), storage_entry(2, false)],
                std::mem::size_of::<BlendParams>(),
            ),
            settle: Kernel::new(
                device,
                "settle",
                include_str!("../../../shaders/settle.wgsl"),
                &[storage_entry(1, false)],
                std::mem::size_of::<SettleParams>(),
            ),
            shadow: Kernel::new(
                device,
                "shadow",
                include_str!("../../../shaders/shadow.wgsl"),
                &[storage_entry(1, true), storage_entry(2, false)],
                std::mem::size_of::<ShadowKernelParams>(),
            ),
            lines: Kernel::new(
                device,
                "lines",
                include_str!("../../../shaders/lines.wgsl"),
                &[storage_entry(1, true), storage_entry(2, false)],
                std::mem::size_of::<LineParams>(),
            ),
            present: Kernel::new(
                device,
                "present",
                include_str!("../../../shaders/present.wgsl"),
                &[storage_entry(1, true), window_entry(2)],
                std::mem::size_of::<PresentParams>(),
            ),
        }
    }
}

fn pass_index(pass: PassMode) -> u32 {
    match pass {
        PassMode::Color => 0,
        PassMode::Shading => 1,
        PassMode::Shadow => 2,
        PassMode::Mask => 3,
    }
}

/// Ray-march programs, one per [`ShaderKey`], specialized through override constants
pub struct RaymarchKernel {
    shader: wgpu::ShaderModule,
    layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    params: wgpu::Buffer,
    programs: ProgramCache<wgpu::ComputePipeline>,
}

impl RaymarchKernel {
    pub fn new(device: &wgpu::Device) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("raymarch_shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../../shaders/raymarch.wgsl").into()),
        });

        // 0 params, 1 bricks, 2 target, 3-4 peel depth, 5-12 brick data, 13 mask
        let mut entries = vec![
            uniform_entry(0),
            storage_entry(1, true),
            storage_entry(2, false),
            storage_entry(3, true),
            storage_entry(4, true),
        ];
        for slot in 0..=SLAB_SLOTS as u32 {
            entries.push(volume_entry(5 + slot));
        }
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("raymarch_layout"),
            entries: &entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("raymarch_pipeline_layout"),
            bind_group_layouts: &[&layout],
            immediate_size: 0,
        });

        Self {
            shader,
            layout,
            pipeline_layout,
            params: params_buffer(device, "raymarch_params", std::mem::size_of::<MarchParams>()),
            programs: ProgramCache::new(),
        }
    }

    pub fn layout(&self) -> &wgpu::BindGroupLayout {
        &self.layout
    }

    pub fn params(&self) -> &wgpu::Buffer {
        &self.params
    }

    pub fn compiles(&self) -> u64 {
        self.programs.compiles()
    }

    /// A program compiled earlier by [`program`](Self::program)
    pub fn cached(&self, key: &ShaderKey) -> Result<&wgpu::ComputePipeline> {
        self.programs
            .get(key)
            .ok_or_else(|| Error::Gpu(format!("no program compiled for {:?}", key)))
    }

    /// Pipeline for `key`, compiled on first use
    pub fn program(&mut self, device: &wgpu::Device, key: ShaderKey) -> Result<&wgpu::ComputePipeline> {
        let shader = &self.shader;
        let pipeline_layout = &self.pipeline_layout;
        self.programs.get_or_compile(key, |key| {
            let flag = |b: bool| f64::from(u8::from(b));
            let constants = [
                ("PASS", f64::from(pass_index(key.pass))),
                ("MIP", flag(key.mode == RenderMode::Mip)),
                ("SHADED", flag(key.shading)),
                ("FOG", flag(key.fog)),
                ("CLIP", flag(key.clip)),
                ("LABELS", flag(key.mask == MaskMode::Label)),
                ("HAS_NEAR", flag(key.peel & 1 != 0)),
                ("HAS_FAR", flag(key.peel & 2 != 0)),
            ];
            Ok(device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("raymarch_pipeline"),
                layout: Some(pipeline_layout),
                module: shader,
                entry_point: Some("main"),
                compilation_options: wgpu::PipelineCompilationOptions {
                    constants: &constants,
                    ..Default::default()
                },
                cache: None,
            }))
        })
    }
}
