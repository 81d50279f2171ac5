//! Camera for volume rendering

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::core::types::{Mat4, Vec3};
use crate::math::Ray;

/// Projection mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Projection {
    #[default]
    Perspective,
    Orthographic,
}

/// Look-at camera with perspective or orthographic projection
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    /// Eye position in world space
    pub eye: Vec3,
    /// Point the camera looks at
    pub center: Vec3,
    pub up: Vec3,
    pub projection: Projection,
    /// Vertical field of view in radians (perspective only)
    pub fov_y: f32,
    /// Half of the visible height in world units (orthographic only)
    pub ortho_half_height: f32,
    /// Aspect ratio (width / height)
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    /// Create a perspective camera looking at a target
    pub fn look_at(eye: Vec3, center: Vec3, up: Vec3) -> Self {
        Self {
            eye,
            center,
            up,
            projection: Projection::Perspective,
            fov_y: 30.0_f32.to_radians(),
            ortho_half_height: 1.0,
            aspect: 1.0,
            near: 0.01,
            far: 1000.0,
        }
    }

    /// Create an orthographic camera looking at a target
    pub fn orthographic(eye: Vec3, center: Vec3, up: Vec3, half_height: f32) -> Self {
        Self {
            projection: Projection::Orthographic,
            ortho_half_height: half_height,
            ..Self::look_at(eye, center, up)
        }
    }

    pub fn is_orthographic(&self) -> bool {
        self.projection == Projection::Orthographic
    }

    /// Normalized viewing direction
    pub fn forward(&self) -> Vec3 {
        (self.center - self.eye).normalize_or_zero()
    }

    /// Get view matrix (world to camera space)
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.eye, self.center, self.up)
    }

    /// Get projection matrix (camera to clip space, depth in 0..1)
    pub fn projection_matrix(&self) -> Mat4 {
        match self.projection {
            Projection::Perspective => {
                Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
            }
            Projection::Orthographic => {
                let h = self.ortho_half_height;
                let w = h * self.aspect;
                Mat4::orthographic_rh(-w, w, -h, h, self.near, self.far)
            }
        }
    }

    /// Get combined view-projection matrix
    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Ray from the eye along the view direction, used for brick sorting
    pub fn view_ray(&self) -> Ray {
        Ray::new(self.eye, self.forward())
    }

    /// World-space height of one pixel at the focus distance
    pub fn pixel_world_size(&self, viewport_height: u32) -> f32 {
        let rows = viewport_height.max(1) as f32;
        match self.projection {
            Projection::Orthographic => 2.0 * self.ortho_half_height / rows,
            Projection::Perspective => {
                let dist = (self.center - self.eye).length();
                2.0 * dist * (self.fov_y * 0.5).tan() / rows
            }
        }
    }

    /// Hash of every field that affects brick ordering or visibility
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for v in [self.eye, self.center, self.up] {
            v.to_array().iter().for_each(|c| c.to_bits().hash(&mut hasher));
        }
        self.projection.hash(&mut hasher);
        for c in [self.fov_y, self.ortho_half_height, self.aspect, self.near, self.far] {
            c.to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl Hash for Projection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (*self as u8).hash(state);
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y)
    }
}
