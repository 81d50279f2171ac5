//! Brick streaming: residency, loading and progressive update loops

pub mod config;
pub mod budget;
pub mod cache;
pub mod staging;
pub mod queue;
pub mod loader;
pub mod decode;
pub mod prefetch;
pub mod quota;
pub mod state;

pub use config::{InteractiveQuality, MemSwap, QuotaEstimate, StreamingConfig};
pub use budget::MemoryBudget;
pub use cache::{BrickCache, CacheError, CacheStats, DrawnLedger, TextureKey};
pub use staging::StagingCache;
pub use queue::{LoadItem, LoadQueue, WorkTarget};
pub use loader::{BrickLoader, ItemOutcome, LoadStep, LoadWorker, LoaderState, LoopStats};
pub use decode::{decode_brick, load_brick, read_range, read_range_async, FileFetcher, RangeFetcher};
pub use prefetch::{BrickPrefetcher, PrefetchRequest, PrefetchResult};
pub use quota::{allocate_channel_quotas, corrected_up_time, share_quota, QuotaEstimator};
pub use state::{CanvasId, ProgressFlags, StreamingSlot, UpdateLoopState};
