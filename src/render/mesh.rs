//! Mesh collaborator contract
//!
//! Meshes are drawn outside this crate; the composer only needs a color image
//! and a per-pixel depth to blend volumes against them.

use crate::core::Camera;
use crate::core::types::{Vec2, Vec3};
use crate::math::{Aabb, Ray};
use super::backend::Viewport;

/// Color and depth of a rendered mesh layer
///
/// Depth is the distance along the pixel ray used by the volume renderer,
/// `f32::MAX` where nothing was drawn. Colors are premultiplied.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshImage {
    pub viewport: Viewport,
    pub color: Vec<[f32; 4]>,
    pub depth: Vec<f32>,
}

impl MeshImage {
    pub fn empty(viewport: Viewport) -> Self {
        Self {
            viewport,
            color: vec![[0.0; 4]; viewport.pixel_count()],
            depth: vec![f32::MAX; viewport.pixel_count()],
        }
    }

    /// Depth packed into the red channel, as depth targets store it
    pub fn depth_pixels(&self) -> Vec<[f32; 4]> {
        self.depth.iter().map(|&d| [d, d, d, 1.0]).collect()
    }

    /// Keep the nearer surface of two images
    pub fn merge(&mut self, other: &MeshImage) {
        for i in 0..self.depth.len().min(other.depth.len()) {
            if other.depth[i] < self.depth[i] {
                self.depth[i] = other.depth[i];
                self.color[i] = other.color[i];
            }
        }
    }
}

/// Split mesh images into depth-peeled surface layers
///
/// Layer `l` holds, per pixel, the `l`-th nearest surface over all images.
/// Pixels with fewer surfaces stay empty in the deeper layers.
pub fn peel_surfaces(images: &[MeshImage], viewport: Viewport, count: usize) -> Vec<MeshImage> {
    let mut layers: Vec<MeshImage> = (0..count).map(|_| MeshImage::empty(viewport)).collect();
    let mut hits: Vec<(f32, [f32; 4])> = Vec::with_capacity(images.len());
    for i in 0..viewport.pixel_count() {
        hits.clear();
        for image in images {
            if let Some(&d) = image.depth.get(i) {
                if d < f32::MAX {
                    hits.push((d, image.color[i]));
                }
            }
        }
        hits.sort_by(|a, b| a.0.total_cmp(&b.0));
        for (layer, &(d, c)) in layers.iter_mut().zip(hits.iter()) {
            layer.depth[i] = d;
            layer.color[i] = c;
        }
    }
    layers
}

/// Something that can draw itself for the composer
pub trait MeshSource: Send + Sync {
    fn name(&self) -> &str;

    fn bounds(&self) -> Aabb;

    fn render(&self, camera: &Camera, viewport: Viewport) -> MeshImage;
}

/// Pixel ray through the center of pixel (x, y), row 0 at the top
pub fn pixel_ray(inv_view_proj: &crate::core::types::Mat4, viewport: Viewport, x: u32, y: u32) -> Ray {
    let ndc = Vec2::new(
        (x as f32 + 0.5) / viewport.width as f32 * 2.0 - 1.0,
        1.0 - (y as f32 + 0.5) / viewport.height as f32 * 2.0,
    );
    Ray::from_ndc(inv_view_proj, ndc)
}

/// Opaque axis-aligned box, flat shaded
#[derive(Clone, Debug)]
pub struct BoxMesh {
    pub name: String,
    pub bounds: Aabb,
    pub color: Vec3,
}

impl BoxMesh {
    pub fn new(name: impl Into<String>, bounds: Aabb, color: Vec3) -> Self {
        Self { name: name.into(), bounds, color }
    }
}

impl MeshSource for BoxMesh {
    fn name(&self) -> &str {
        &self.name
    }

    fn bounds(&self) -> Aabb {
        self.bounds
    }

    fn render(&self, camera: &Camera, viewport: Viewport) -> MeshImage {
        let mut image = MeshImage::empty(viewport);
        if viewport.is_empty() {
            return image;
        }
        let inv = camera.view_projection().inverse();
        for y in 0..viewport.height {
            for x in 0..viewport.width {
                let ray = pixel_ray(&inv, viewport, x, y);
                if let Some((t0, _)) = ray.intersects_aabb(&self.bounds) {
                    let i = (y * viewport.width + x) as usize;
                    image.depth[i] = t0;
                    image.color[i] = [self.color.x, self.color.y, self.color.z, 1.0];
                }
            }
        }
        image
    }
}
