//! Final-buffer color adjustment applied when presenting

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::core::types::Vec3;

/// Per-channel gamma, brightness and HDR boost
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorAdjust {
    pub gamma: Vec3,
    pub brightness: Vec3,
    /// 0 leaves colors untouched; larger values lift mid-tones
    pub hdr: Vec3,
}

impl Default for ColorAdjust {
    fn default() -> Self {
        Self {
            gamma: Vec3::ONE,
            brightness: Vec3::ONE,
            hdr: Vec3::ZERO,
        }
    }
}

impl ColorAdjust {
    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }

    /// Adjust a straight (non-premultiplied) color, result clamped to 0..1
    pub fn apply(&self, rgb: Vec3) -> Vec3 {
        let c = rgb.clamp(Vec3::ZERO, Vec3::ONE);
        let inv_gamma = Vec3::ONE / self.gamma.max(Vec3::splat(1e-3));
        let c = c.powf_vec(inv_gamma) * self.brightness;
        let c = c.clamp(Vec3::ZERO, Vec3::ONE);
        (c + self.hdr * c * (Vec3::ONE - c)).clamp(Vec3::ZERO, Vec3::ONE)
    }

    /// Quantize to 8 bits after adjustment
    pub fn to_rgba8(&self, rgba: [f32; 4]) -> [u8; 4] {
        let c = self.apply(Vec3::new(rgba[0], rgba[1], rgba[2]));
        let q = |v: f32| (v * 255.0).round().clamp(0.0, 255.0) as u8;
        [q(c.x), q(c.y), q(c.z), q(rgba[3].clamp(0.0, 1.0))]
    }

    pub fn to_uniform(&self) -> AdjustUniform {
        AdjustUniform {
            gamma: self.gamma.extend(0.0).to_array(),
            brightness: self.brightness.extend(0.0).to_array(),
            hdr: self.hdr.extend(0.0).to_array(),
        }
    }
}

trait PowfVec {
    fn powf_vec(self, e: Vec3) -> Vec3;
}

impl PowfVec for Vec3 {
    fn powf_vec(self, e: Vec3) -> Vec3 {
        Vec3::new(self.x.powf(e.x), self.y.powf(e.y), self.z.powf(e.z))
    }
}

/// GPU layout of [`ColorAdjust`]
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct AdjustUniform {
    pub gamma: [f32; 4],
    pub brightness: [f32; 4],
    pub hdr: [f32; 4],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let adjust = ColorAdjust::default();
        assert!(adjust.is_identity());
        let c = Vec3::new(0.2, 0.5, 0.9);
        assert!((adjust.apply(c) - c).length() < 1e-6);
        assert_eq!(adjust.to_rgba8([1.0, 0.0, 0.5, 1.0]), [255, 0, 128, 255]);
    }

    #[test]
    fn test_gamma_brightens_midtones() {
        let adjust = ColorAdjust { gamma: Vec3::splat(2.0), ..Default::default() };
        let c = adjust.apply(Vec3::splat(0.25));
        assert!((c.x - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_brightness_and_hdr_clamp() {
        let adjust = ColorAdjust {
            brightness: Vec3::splat(4.0),
            hdr: Vec3::splat(1.0),
            ..Default::default()
        };
        assert_eq!(adjust.apply(Vec3::splat(0.5)), Vec3::ONE);
        let hdr = ColorAdjust { hdr: Vec3::splat(1.0), ..Default::default() };
        assert!((hdr.apply(Vec3::splat(0.5)).x - 0.75).abs() < 1e-6);
    }
}
