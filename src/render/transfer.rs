//! Transfer function and per-volume shading parameters
//!
//! These values are handed to the shading stage unchanged; both backends
//! evaluate [`TransferFunction::classify`] with the same arithmetic.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::core::types::Vec3;

/// How samples along a ray are combined
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RenderMode {
    /// Alpha compositing
    #[default]
    Over,
    /// Maximum intensity projection
    Mip,
}

/// Built-in color maps
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Colormap {
    Rainbow,
    Hot,
    Cool,
    Gray,
}

impl Colormap {
    fn index(self) -> u32 {
        match self {
            Colormap::Rainbow => 1,
            Colormap::Hot => 2,
            Colormap::Cool => 3,
            Colormap::Gray => 4,
        }
    }

    /// Map t in 0..1 to a color
    pub fn sample(self, t: f32) -> Vec3 {
        colormap_by_index(self.index(), t)
    }
}

fn colormap_by_index(index: u32, t: f32) -> Vec3 {
    let t = t.clamp(0.0, 1.0);
    match index {
        1 => {
            let r = (1.5 - (4.0 * t - 3.0).abs()).clamp(0.0, 1.0);
            let g = (1.5 - (4.0 * t - 2.0).abs()).clamp(0.0, 1.0);
            let b = (1.5 - (4.0 * t - 1.0).abs()).clamp(0.0, 1.0);
            Vec3::new(r, g, b)
        }
        2 => Vec3::new(
            (3.0 * t).clamp(0.0, 1.0),
            (3.0 * t - 1.0).clamp(0.0, 1.0),
            (3.0 * t - 2.0).clamp(0.0, 1.0),
        ),
        3 => Vec3::new(t, 1.0 - t, 1.0),
        _ => Vec3::splat(t),
    }
}

/// Intensity to color/opacity mapping
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferFunction {
    pub gamma: f32,
    /// Normalized intensities below this are transparent
    pub low_threshold: f32,
    /// Normalized intensities above this are transparent
    pub high_threshold: f32,
    /// Gradient magnitude window; disabled when low is 0 and high is `f32::MAX`
    pub gm_low: f32,
    pub gm_high: f32,
    pub color: Vec3,
    pub luminance: f32,
    /// Peak opacity
    pub alpha: f32,
    /// Exponent applied to intensity before scaling by `alpha`
    pub alpha_power: f32,
    pub colormap: Option<Colormap>,
    /// Intensity range mapped onto the color map
    pub colormap_low: f32,
    pub colormap_high: f32,
    pub invert: bool,
}

impl Default for TransferFunction {
    fn default() -> Self {
        Self {
            gamma: 1.0,
            low_threshold: 0.0,
            high_threshold: 1.0,
            gm_low: 0.0,
            gm_high: f32::MAX,
            color: Vec3::ONE,
            luminance: 1.0,
            alpha: 1.0,
            alpha_power: 1.0,
            colormap: None,
            colormap_low: 0.0,
            colormap_high: 1.0,
            invert: false,
        }
    }
}

impl TransferFunction {
    /// True when the gradient-magnitude window rejects anything
    pub fn uses_gradient(&self) -> bool {
        self.gm_low > 0.0 || self.gm_high < f32::MAX
    }

    /// Premultiplied RGBA for a normalized intensity and gradient magnitude
    ///
    /// Returns transparent black outside the thresholds.
    pub fn classify(&self, value: f32, gradient: f32) -> [f32; 4] {
        let v = if self.invert { 1.0 - value } else { value };
        if v <= 0.0 || v < self.low_threshold || v > self.high_threshold {
            return [0.0; 4];
        }
        if self.uses_gradient() && (gradient < self.gm_low || gradient > self.gm_high) {
            return [0.0; 4];
        }
        let span = (self.high_threshold - self.low_threshold).max(1e-6);
        let t = ((v - self.low_threshold) / span).clamp(0.0, 1.0);
        let intensity = t.powf(1.0 / self.gamma.max(1e-3));
        let base = match self.colormap {
            Some(map) => {
                let range = (self.colormap_high - self.colormap_low).max(1e-6);
                map.sample((v - self.colormap_low) / range)
            }
            None => self.color,
        };
        let a = (self.alpha * intensity.powf(self.alpha_power)).clamp(0.0, 1.0);
        let rgb = base * self.luminance * intensity * a;
        [rgb.x, rgb.y, rgb.z, a]
    }

    pub fn to_uniform(&self) -> TransferUniform {
        TransferUniform {
            color: self.color.to_array(),
            gamma: self.gamma,
            low_threshold: self.low_threshold,
            high_threshold: self.high_threshold,
            gm_low: self.gm_low,
            gm_high: self.gm_high,
            luminance: self.luminance,
            alpha: self.alpha,
            alpha_power: self.alpha_power,
            colormap: self.colormap.map_or(0, Colormap::index),
            colormap_low: self.colormap_low,
            colormap_high: self.colormap_high,
            invert: u32::from(self.invert),
            use_gradient: u32::from(self.uses_gradient()),
        }
    }
}

/// GPU layout of [`TransferFunction`]
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TransferUniform {
    pub color: [f32; 3],
    pub gamma: f32,
    pub low_threshold: f32,
    pub high_threshold: f32,
    pub gm_low: f32,
    pub gm_high: f32,
    pub luminance: f32,
    pub alpha: f32,
    pub alpha_power: f32,
    pub colormap: u32,
    pub colormap_low: f32,
    pub colormap_high: f32,
    pub invert: u32,
    pub use_gradient: u32,
}

/// Phong lighting terms for shaded rendering
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadingParams {
    pub ambient: f32,
    pub diffuse: f32,
    pub specular: f32,
    pub shininess: f32,
}

impl Default for ShadingParams {
    fn default() -> Self {
        Self {
            ambient: 0.4,
            diffuse: 0.6,
            specular: 0.2,
            shininess: 10.0,
        }
    }
}

/// Screen-space shadow from the first-hit depth of a volume
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowParams {
    /// 0 = no darkening, 1 = fully black in occluded pixels
    pub intensity: f32,
    /// Neighbourhood radius in pixels
    pub radius: u32,
}

impl Default for ShadowParams {
    fn default() -> Self {
        Self { intensity: 0.5, radius: 3 }
    }
}

/// Depth cue: intensity falls off between `start` and `end` along each ray
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FogParams {
    pub intensity: f32,
    pub start: f32,
    pub end: f32,
}

impl FogParams {
    /// Multiplier applied to a sample at ray distance `t`
    pub fn factor(&self, t: f32) -> f32 {
        let span = (self.end - self.start).max(1e-6);
        let f = ((self.end - t) / span).clamp(0.0, 1.0);
        1.0 - self.intensity * (1.0 - f)
    }
}

/// Which component the mask pass reads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaskMode {
    #[default]
    Off,
    /// Binary selection mask tinted with `mask_color`
    Mask,
    /// Segmentation labels, one color per label id
    Label,
}

/// Stable color for a label id
pub fn label_color(label: u16) -> Vec3 {
    let h = (label as u32).wrapping_mul(2654435761);
    Vec3::new(
        ((h >> 16) & 0xff) as f32 / 255.0,
        ((h >> 8) & 0xff) as f32 / 255.0,
        (h & 0xff) as f32 / 255.0,
    )
    .max(Vec3::splat(0.2))
}

/// Opacity for a step of `ratio` unit samples
#[inline]
pub fn correct_alpha(alpha: f32, ratio: f32) -> f32 {
    if alpha >= 1.0 {
        1.0
    } else {
        1.0 - (1.0 - alpha).powf(ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_make_transparent() {
        let tf = TransferFunction { low_threshold: 0.2, high_threshold: 0.8, ..Default::default() };
        assert_eq!(tf.classify(0.1, 0.0), [0.0; 4]);
        assert_eq!(tf.classify(0.9, 0.0), [0.0; 4]);
        assert!(tf.classify(0.5, 0.0)[3] > 0.0);
        assert_eq!(TransferFunction::default().classify(0.0, 0.0), [0.0; 4]);
    }

    #[test]
    fn test_full_intensity_is_opaque_color() {
        let tf = TransferFunction { color: Vec3::new(1.0, 0.5, 0.0), ..Default::default() };
        let c = tf.classify(1.0, 0.0);
        assert_eq!(c, [1.0, 0.5, 0.0, 1.0]);
    }

    #[test]
    fn test_gradient_window() {
        let tf = TransferFunction { gm_low: 0.1, ..Default::default() };
        assert!(tf.uses_gradient());
        assert_eq!(tf.classify(1.0, 0.05), [0.0; 4]);
        assert!(tf.classify(1.0, 0.5)[3] > 0.0);
        assert!(!TransferFunction::default().uses_gradient());
    }

    #[test]
    fn test_premultiplied_output() {
        let tf = TransferFunction { alpha: 0.5, ..Default::default() };
        let c = tf.classify(1.0, 0.0);
        assert_eq!(c, [0.5, 0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_colormap_endpoints() {
        assert_eq!(Colormap::Gray.sample(0.25), Vec3::splat(0.25));
        assert_eq!(Colormap::Hot.sample(1.0), Vec3::ONE);
        let cold = Colormap::Rainbow.sample(0.0);
        assert!(cold.z > cold.x);
    }

    #[test]
    fn test_correct_alpha() {
        assert_eq!(correct_alpha(1.0, 0.3), 1.0);
        assert!((correct_alpha(0.5, 2.0) - 0.75).abs() < 1e-6);
        assert!((correct_alpha(0.5, 1.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_fog_factor() {
        let fog = FogParams { intensity: 1.0, start: 1.0, end: 3.0 };
        assert_eq!(fog.factor(0.5), 1.0);
        assert!((fog.factor(2.0) - 0.5).abs() < 1e-6);
        assert_eq!(fog.factor(5.0), 0.0);
    }

    #[test]
    fn test_uniform_is_packed() {
        assert_eq!(std::mem::size_of::<TransferUniform>(), 64);
        let u = TransferFunction::default().to_uniform();
        assert_eq!(u.gm_high, f32::MAX);
        assert_eq!(u.use_gradient, 0);
    }
}
