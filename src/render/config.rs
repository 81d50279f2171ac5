//! Rendering configuration

use serde::{Deserialize, Serialize};

use crate::core::types::Vec3;
use super::adjust::ColorAdjust;
use super::backend::TargetFormat;

/// How several displayed volumes are combined
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MixMethod {
    /// Each volume composited straight into the final buffer in layer order
    Sequential,
    /// Each volume rendered into its own channel buffer, then blended
    #[default]
    Composite,
    /// Volumes depth-interleaved slab by slab in one buffer
    Multi,
}

/// Vertical background gradient
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GradientBackground {
    pub top: [f32; 4],
    pub bottom: [f32; 4],
}

/// Rendering configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Extra depth-peeling layers; 0 disables peeling
    pub peel_layers: u32,
    /// Samples per voxel along a ray
    pub sample_rate: f32,
    pub interactive_scale: f32,
    pub small_data_scale: f32,
    pub large_data_scale: f32,
    pub capture_scale: f32,
    /// Precision of the final buffer
    pub target_format: TargetFormat,
    pub clear_color: [f32; 4],
    pub gradient_background: Option<GradientBackground>,
    pub gamma: Vec3,
    pub brightness: Vec3,
    pub hdr: Vec3,
    pub mix_method: MixMethod,
    pub show_bounds: bool,
    pub show_fps: bool,
    /// Largest on-screen voxel footprint in pixels before a finer level is used
    pub resolution_mode: f32,
    pub detail_level_offset: i32,
    /// Direction towards the light in world space
    pub light_dir: Vec3,
    /// Depth cue strength over the scene's depth range, 0 disables fog
    pub fog_intensity: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            peel_layers: 0,
            sample_rate: 1.0,
            interactive_scale: 0.5,
            small_data_scale: 1.5,
            large_data_scale: 0.75,
            capture_scale: 2.0,
            target_format: TargetFormat::Rgba32F,
            clear_color: [0.0, 0.0, 0.0, 0.0],
            gradient_background: None,
            gamma: Vec3::ONE,
            brightness: Vec3::ONE,
            hdr: Vec3::ZERO,
            mix_method: MixMethod::Composite,
            show_bounds: false,
            show_fps: false,
            resolution_mode: 1.0,
            detail_level_offset: 0,
            light_dir: Vec3::new(0.0, 0.0, 1.0),
            fog_intensity: 0.0,
        }
    }
}

impl RenderConfig {
    pub fn color_adjust(&self) -> ColorAdjust {
        ColorAdjust { gamma: self.gamma, brightness: self.brightness, hdr: self.hdr }
    }

    /// True when depth peeling draws more than the front layer
    pub fn peeling(&self) -> bool {
        self.peel_layers > 0
    }

    /// Sample rate after the interaction, capture and dataset-size factors
    pub fn effective_sample_rate(&self, interactive: bool, capture: bool, data_bytes: u64, small_bytes: u64, large_bytes: u64) -> f32 {
        let mut rate = self.sample_rate;
        if data_bytes <= small_bytes {
            rate *= self.small_data_scale;
        } else if data_bytes >= large_bytes {
            rate *= self.large_data_scale;
        }
        if capture {
            rate *= self.capture_scale;
        } else if interactive {
            rate *= self.interactive_scale;
        }
        rate.max(0.01)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rate_factors() {
        let config = RenderConfig { sample_rate: 2.0, ..Default::default() };
        assert_eq!(config.effective_sample_rate(false, false, 50, 10, 100), 2.0);
        assert_eq!(config.effective_sample_rate(true, false, 50, 10, 100), 1.0);
        assert_eq!(config.effective_sample_rate(false, true, 5, 10, 100), 6.0);
        assert_eq!(config.effective_sample_rate(false, false, 500, 10, 100), 1.5);
    }

    #[test]
    fn test_defaults_round_trip_through_partial_json() {
        let config: RenderConfig = serde_json::from_str(r#"{"peel_layers": 2, "mix_method": "Multi"}"#).unwrap();
        assert!(config.peeling());
        assert_eq!(config.mix_method, MixMethod::Multi);
        assert_eq!(config.sample_rate, 1.0);
        assert!(config.color_adjust().is_identity());
    }
}
