//! Background brick prefetching with concurrent async reads

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use crate::core::types::UVec3;
use crate::core::{Error, Result};
use crate::volume::{BrickKey, BrickPayload, BrickSourcePath, FileLocation, TexelFormat};
use super::decode::{decode_brick, read_range_async};

/// Request to read and decode one brick
#[derive(Debug, Clone)]
pub struct PrefetchRequest {
    pub key: BrickKey,
    pub location: FileLocation,
    pub dims: UVec3,
    pub format: TexelFormat,
    /// Higher loads first
    pub priority: f32,
    generation: u64,
}

/// Result of a prefetch
#[derive(Debug)]
pub enum PrefetchResult {
    Loaded(BrickKey, Arc<BrickPayload>),
    Failed(BrickKey, String),
}

impl PrefetchResult {
    pub fn key(&self) -> BrickKey {
        match self {
            PrefetchResult::Loaded(key, _) => *key,
            PrefetchResult::Failed(key, _) => *key,
        }
    }
}

/// Counters shared with the worker
#[derive(Debug, Default)]
struct Shared {
    /// Bumped on cancel; requests and results from older generations are dropped
    generation: AtomicU64,
    started: AtomicU64,
    discarded: AtomicU64,
}

/// Reads brick ranges on a worker runtime so the render thread never blocks on disk
pub struct BrickPrefetcher {
    request_tx: mpsc::UnboundedSender<PrefetchRequest>,
    result_rx: mpsc::UnboundedReceiver<(u64, PrefetchResult)>,
    pending: HashSet<BrickKey>,
    shared: Arc<Shared>,
    _runtime: Runtime,
}

impl BrickPrefetcher {
    /// Create a prefetcher with up to `max_concurrent` reads in flight
    pub fn new(max_concurrent: usize) -> Result<Self> {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<PrefetchRequest>();
        let (result_tx, result_rx) = mpsc::unbounded_channel();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(max_concurrent.clamp(1, 8))
            .thread_name("volstream-prefetch")
            .enable_all()
            .build()
            .map_err(|e| Error::Streaming(format!("Failed to create prefetch runtime: {}", e)))?;

        let max_concurrent = max_concurrent.max(1);
        let shared = Arc::new(Shared::default());
        let worker_shared = shared.clone();
        runtime.spawn(async move {
            Self::worker_loop(max_concurrent, &mut request_rx, result_tx, worker_shared).await;
        });

        Ok(Self {
            request_tx,
            result_rx,
            pending: HashSet::new(),
            shared,
            _runtime: runtime,
        })
    }

    async fn worker_loop(
        max_concurrent: usize,
        request_rx: &mut mpsc::UnboundedReceiver<PrefetchRequest>,
        result_tx: mpsc::UnboundedSender<(u64, PrefetchResult)>,
        shared: Arc<Shared>,
    ) {
        use tokio::task::JoinSet;

        let mut active_tasks = JoinSet::new();
        let mut waiting: Vec<PrefetchRequest> = Vec::new();

        loop {
            tokio::select! {
                Some(request) = request_rx.recv() => {
                    waiting.push(request);
                }

                Some(result) = active_tasks.join_next(), if !active_tasks.is_empty() => {
                    match result {
                        Ok(done) => {
                            let _ = result_tx.send(done);
                        }
                        Err(e) => {
                            log::error!("Prefetch task panicked: {}", e);
                        }
                    }
                }

                else => {
                    if waiting.is_empty() && active_tasks.is_empty() {
                        break;
                    }
                }
            }

            let dropped = drop_stale(&mut waiting, shared.generation.load(Ordering::Acquire));
            if dropped > 0 {
                shared.discarded.fetch_add(dropped as u64, Ordering::Relaxed);
                log::trace!("Dropped {} cancelled prefetch requests", dropped);
            }

            // Highest priority last so pop takes it
            waiting.sort_by(|a, b| a.priority.partial_cmp(&b.priority).unwrap_or(std::cmp::Ordering::Equal));
            while active_tasks.len() < max_concurrent {
                let Some(request) = waiting.pop() else { break };
                shared.started.fetch_add(1, Ordering::Relaxed);
                active_tasks.spawn(async move { (request.generation, Self::load_task(request).await) });
            }
        }
    }

    async fn load_task(request: PrefetchRequest) -> PrefetchResult {
        let key = request.key;
        let loc = &request.location;
        let bytes = match &loc.source {
            BrickSourcePath::File(path) => read_range_async(path, loc.offset, loc.size).await,
            BrickSourcePath::Url(url) => Err(Error::Streaming(format!("no fetcher for remote brick {}", url))),
        };
        match bytes.and_then(|b| decode_brick(&b, loc.encoding, request.dims, request.format)) {
            Ok(payload) => PrefetchResult::Loaded(key, Arc::new(payload)),
            Err(e) => PrefetchResult::Failed(key, e.to_string()),
        }
    }

    /// Queue a brick read
    ///
    /// Returns `false` if the brick is already pending.
    pub fn request(&mut self, key: BrickKey, location: FileLocation, dims: UVec3, format: TexelFormat, priority: f32) -> bool {
        if self.pending.contains(&key) {
            return false;
        }
        let generation = self.generation();
        let request = PrefetchRequest { key, location, dims, format, priority, generation };
        if self.request_tx.send(request).is_err() {
            log::error!("Prefetch worker is gone, dropping request for {:?}", key);
            return false;
        }
        self.pending.insert(key);
        true
    }

    /// Drain finished reads without blocking
    pub fn poll_results(&mut self) -> Vec<PrefetchResult> {
        let mut results = Vec::new();
        let current = self.generation();
        while let Ok((generation, result)) = self.result_rx.try_recv() {
            if generation != current {
                continue;
            }
            self.pending.remove(&result.key());
            results.push(result);
        }
        results
    }

    /// Forget every outstanding request
    ///
    /// Queued requests are dropped by the worker before they start. Reads
    /// already in flight still finish, but their results are discarded.
    pub fn cancel_all(&mut self) {
        if !self.pending.is_empty() {
            log::debug!("Cancelling {} prefetches", self.pending.len());
        }
        self.pending.clear();
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Reads the worker has started
    pub fn reads_started(&self) -> u64 {
        self.shared.started.load(Ordering::Relaxed)
    }

    /// Cancelled requests the worker dropped without reading
    pub fn requests_discarded(&self) -> u64 {
        self.shared.discarded.load(Ordering::Relaxed)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, key: &BrickKey) -> bool {
        self.pending.contains(key)
    }
}

/// Remove requests queued before the last cancel
fn drop_stale(waiting: &mut Vec<PrefetchRequest>, generation: u64) -> usize {
    let before = waiting.len();
    waiting.retain(|r| r.generation == generation);
    before - waiting.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use crate::volume::{BrickEncoding, BrickId, VolumeId};

    fn key(i: u32) -> BrickKey {
        BrickKey::new(VolumeId(0), 0, BrickId(i))
    }

    fn wait_for(prefetcher: &mut BrickPrefetcher, n: usize) -> Vec<PrefetchResult> {
        let start = Instant::now();
        let mut results = Vec::new();
        while results.len() < n && start.elapsed() < Duration::from_secs(5) {
            results.extend(prefetcher.poll_results());
            std::thread::sleep(Duration::from_millis(2));
        }
        results
    }

    #[test]
    fn test_prefetch_reads_and_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bricks.bin");
        let raw: Vec<u8> = (0..8).collect();
        let packed = lz4_flex::compress_prepend_size(&raw);
        let mut file = vec![0xAA; 3];
        file.extend_from_slice(&packed);
        std::fs::write(&path, &file).unwrap();

        let mut prefetcher = BrickPrefetcher::new(2).unwrap();
        let loc = FileLocation {
            source: BrickSourcePath::File(path),
            offset: 3,
            size: packed.len() as u64,
            encoding: BrickEncoding::Lz4,
        };
        assert!(prefetcher.request(key(0), loc.clone(), UVec3::splat(2), TexelFormat::R8, 1.0));
        assert!(!prefetcher.request(key(0), loc, UVec3::splat(2), TexelFormat::R8, 1.0));
        assert!(prefetcher.is_pending(&key(0)));

        let results = wait_for(&mut prefetcher, 1);
        assert_eq!(results.len(), 1);
        match &results[0] {
            PrefetchResult::Loaded(k, payload) => {
                assert_eq!(*k, key(0));
                assert_eq!(payload.bytes, raw);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(prefetcher.pending_count(), 0);
    }

    #[test]
    fn test_missing_file_fails() {
        let mut prefetcher = BrickPrefetcher::new(1).unwrap();
        let loc = FileLocation {
            source: BrickSourcePath::File("/nonexistent/volstream/b.bin".into()),
            offset: 0,
            size: 8,
            encoding: BrickEncoding::Raw,
        };
        prefetcher.request(key(1), loc, UVec3::splat(2), TexelFormat::R8, 0.0);
        let results = wait_for(&mut prefetcher, 1);
        assert!(matches!(results.as_slice(), [PrefetchResult::Failed(k, _)] if *k == key(1)));
    }

    #[test]
    fn test_cancel_drops_stale_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.bin");
        std::fs::write(&path, [1u8; 8]).unwrap();
        let loc = FileLocation {
            source: BrickSourcePath::File(path),
            offset: 0,
            size: 8,
            encoding: BrickEncoding::Raw,
        };

        let mut prefetcher = BrickPrefetcher::new(1).unwrap();
        prefetcher.request(key(2), loc.clone(), UVec3::splat(2), TexelFormat::R8, 0.0);
        prefetcher.cancel_all();
        assert!(!prefetcher.is_pending(&key(2)));

        prefetcher.request(key(3), loc, UVec3::splat(2), TexelFormat::R8, 0.0);
        let results = wait_for(&mut prefetcher, 1);
        std::thread::sleep(Duration::from_millis(20));
        let late = prefetcher.poll_results();
        assert!(results.iter().chain(late.iter()).all(|r| r.key() == key(3)));
    }

    #[test]
    fn test_stale_requests_dropped_before_start() {
        let loc = FileLocation {
            source: BrickSourcePath::File("unused.bin".into()),
            offset: 0,
            size: 8,
            encoding: BrickEncoding::Raw,
        };
        let request = |i: u32, generation: u64| PrefetchRequest {
            key: key(i),
            location: loc.clone(),
            dims: UVec3::splat(2),
            format: TexelFormat::R8,
            priority: 0.0,
            generation,
        };
        let mut waiting = vec![request(0, 0), request(1, 1), request(2, 0)];
        assert_eq!(drop_stale(&mut waiting, 1), 2);
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].key, key(1));
    }

    #[test]
    fn test_cancelled_requests_never_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.bin");
        std::fs::write(&path, [1u8; 8]).unwrap();
        let loc = FileLocation {
            source: BrickSourcePath::File(path),
            offset: 0,
            size: 8,
            encoding: BrickEncoding::Raw,
        };

        let mut prefetcher = BrickPrefetcher::new(1).unwrap();
        for i in 0..20 {
            prefetcher.request(key(i), loc.clone(), UVec3::splat(2), TexelFormat::R8, 0.0);
        }
        prefetcher.cancel_all();
        prefetcher.request(key(100), loc, UVec3::splat(2), TexelFormat::R8, 0.0);
        let results = wait_for(&mut prefetcher, 1);
        assert!(matches!(results.as_slice(), [PrefetchResult::Loaded(k, _)] if *k == key(100)));

        // Every request was either read or dropped, and the new one was read.
        assert_eq!(prefetcher.reads_started() + prefetcher.requests_discarded(), 21);
        assert!(prefetcher.reads_started() >= 1);
    }
}
