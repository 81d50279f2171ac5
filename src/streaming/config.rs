//! Streaming configuration

use serde::{Deserialize, Serialize};

use crate::volume::{BrickLayout, UpdateOrder};

/// Whether bricks are streamed under a memory budget
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemSwap {
    Off,
    On,
    /// Swap when the dataset is large or does not fit the GPU limit
    #[default]
    Auto,
}

/// Which history statistic seeds the next interactive quota
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotaEstimate {
    #[default]
    Mean,
    Trend,
    Regression,
    Last,
    Median,
}

/// When the interactive quota shortcut is allowed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractiveQuality {
    Disabled,
    Enabled,
    #[default]
    LargeDataOnly,
}

/// Streaming configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub mem_swap: MemSwap,
    /// GPU bytes available to brick textures
    pub gpu_memory_limit: u64,
    /// CPU bytes for decoded bricks waiting to be uploaded
    pub main_memory_buffer: u64,
    /// Time budget of one loader burst in milliseconds
    pub up_time: u64,
    pub update_order: UpdateOrder,
    /// Brick edge used in memory-swap mode, 0 to derive from the volume
    pub force_brick_size: u32,
    pub max_texture_size: u32,
    pub force_pow2: bool,
    pub quota_history: usize,
    pub quota_estimate: QuotaEstimate,
    pub skip_empty_bricks: bool,
    /// Background read tasks, 0 disables prefetching
    pub prefetch_workers: usize,
    /// Datasets at least this large count as large
    pub large_data_bytes: u64,
    /// Datasets at most this large count as small
    pub small_data_bytes: u64,
    pub interactive_quality: InteractiveQuality,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            mem_swap: MemSwap::Auto,
            gpu_memory_limit: 1024 * 1024 * 1024,
            main_memory_buffer: 4 * 1024 * 1024 * 1024,
            up_time: 100,
            update_order: UpdateOrder::FrontToBack,
            force_brick_size: 128,
            max_texture_size: 2048,
            force_pow2: false,
            quota_history: 5,
            quota_estimate: QuotaEstimate::Mean,
            skip_empty_bricks: true,
            prefetch_workers: 4,
            large_data_bytes: 200 * 1024 * 1024,
            small_data_bytes: 20 * 1024 * 1024,
            interactive_quality: InteractiveQuality::LargeDataOnly,
        }
    }
}

impl StreamingConfig {
    /// Decide whether memory swap is active for a dataset of `data_bytes`
    pub fn swap_enabled(&self, data_bytes: u64) -> bool {
        match self.mem_swap {
            MemSwap::Off => false,
            MemSwap::On => true,
            MemSwap::Auto => data_bytes >= self.large_data_bytes || data_bytes > self.gpu_memory_limit,
        }
    }

    /// Whether interactive frames may use the shrunk quota
    pub fn interactive_allowed(&self, data_bytes: u64) -> bool {
        match self.interactive_quality {
            InteractiveQuality::Disabled => false,
            InteractiveQuality::Enabled => true,
            InteractiveQuality::LargeDataOnly => data_bytes >= self.large_data_bytes,
        }
    }

    /// Brick layout for building catalogs
    pub fn brick_layout(&self, swap: bool) -> BrickLayout {
        let max_brick_size = if swap && self.force_brick_size > 0 {
            self.force_brick_size
        } else {
            self.max_texture_size
        };
        BrickLayout {
            max_brick_size,
            max_texture_size: self.max_texture_size,
            force_pow2: self.force_pow2,
        }
    }
}
