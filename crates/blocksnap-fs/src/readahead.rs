//! Background readahead engine
//!
//! One worker thread per filesystem instance prefetches allocated blocks
//! in ascending order ahead of consumer demand. Memory is bounded by a
//! watermark pair: the worker pauses once the cache holds the high mark
//! and resumes when it drains to the low mark or a consumer registers a
//! miss. A miss blocks the consumer until the worker delivers exactly the
//! requested block; typical sequential consumption never blocks.

use crate::fs::FsInner;
use crate::pool::BlockBuf;
use blocksnap_common::{Error, Result, config::ReaderTuning};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// State shared between consumers and the worker, guarded by one mutex
#[derive(Default)]
struct State {
    /// Prefetched blocks owned by the engine until handed to a consumer
    cache: BTreeMap<u64, BlockBuf>,
    /// Next block the worker is scheduled to fetch; `None` when idle
    cursor: Option<u64>,
    /// Teardown requested
    stop: bool,
    /// A consumer is blocked waiting for its requested block
    miss: bool,
    /// Block whose read failed while a miss was pending
    failed: Option<u64>,
}

struct Shared {
    state: Mutex<State>,
    /// Signals the worker to (re)start prefetching or stop
    wake_worker: Condvar,
    /// Signals a waiting consumer that its block arrived or failed
    block_ready: Condvar,
    high: usize,
    low: usize,
}

/// Handle to the engine; dropping it stops and joins the worker
pub(crate) struct Readahead {
    fs: Arc<FsInner>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Readahead {
    pub(crate) fn start(fs: Arc<FsInner>, tuning: &ReaderTuning) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wake_worker: Condvar::new(),
            block_ready: Condvar::new(),
            high: tuning.readahead_high_blocks,
            low: tuning.readahead_low_blocks,
        });

        let worker_shared = Arc::clone(&shared);
        let worker_fs = Arc::clone(&fs);
        let worker = std::thread::spawn(move || worker_loop(&worker_shared, &worker_fs));

        Self {
            fs,
            shared,
            worker: Some(worker),
        }
    }

    /// Take `block` from the cache, or stall until the worker delivers it
    ///
    /// The caller has already checked the bitmap; `block` is allocated.
    pub(crate) fn get_block(&self, block: u64) -> Result<BlockBuf> {
        let mut state = self.shared.state.lock();

        // Prefetching only moves forward; everything below the request
        // is stale and goes back to the pool.
        let keep = state.cache.split_off(&block);
        let stale = std::mem::replace(&mut state.cache, keep);
        for (_, buf) in stale {
            self.fs.pool().release(buf);
        }

        // A leftover failure for some other block belongs to no request.
        state.failed = None;

        if state.cache.len() <= self.shared.low {
            self.shared.wake_worker.notify_all();
        }

        loop {
            if let Some(buf) = state.cache.remove(&block) {
                return Ok(buf);
            }
            if state.stop {
                return Err(Error::EngineStopped);
            }
            if state.failed == Some(block) {
                state.failed = None;
                let reason = self
                    .fs
                    .fault()
                    .map_or_else(|| "device read failed".to_string(), |fault| fault.reason);
                return Err(Error::BlockReadFailed { block, reason });
            }

            state.cursor = Some(block);
            state.miss = true;
            self.shared.wake_worker.notify_all();
            // The worker may deliver other blocks first; re-check on wake.
            self.shared.block_ready.wait(&mut state);
        }
    }

    #[cfg(test)]
    fn cached(&self) -> usize {
        self.shared.state.lock().cache.len()
    }

    #[cfg(test)]
    fn cached_blocks(&self) -> Vec<u64> {
        self.shared.state.lock().cache.keys().copied().collect()
    }
}

impl Drop for Readahead {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
        }
        self.shared.wake_worker.notify_all();
        self.shared.block_ready.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &Shared, fs: &Arc<FsInner>) {
    debug!("readahead worker started");
    let mut state = shared.state.lock();

    loop {
        // Backpressure: pause at the high watermark until the cache
        // drains to the low one, a miss arrives, or stop is requested.
        if state.cache.len() >= shared.high {
            while state.cache.len() > shared.low && !state.miss && !state.stop {
                shared.wake_worker.wait(&mut state);
            }
        }
        if state.stop {
            break;
        }

        while state.cursor.is_none() && !state.stop {
            shared.wake_worker.wait(&mut state);
        }
        if state.stop {
            break;
        }

        // Skip anything already cached and land on the next allocated
        // block; past the end the engine goes idle.
        let mut next = state.cursor;
        while let Some(block) = next {
            if fs.bitmap().has_block(block) && !state.cache.contains_key(&block) {
                break;
            }
            next = fs.bitmap().next_used(block + 1);
        }
        state.cursor = next;
        let Some(block) = next else { continue };

        let result = MutexGuard::unlocked(&mut state, || fs.read_block_direct(block));

        match result {
            Ok(buf) => {
                state.cache.insert(block, buf);
                if state.miss {
                    state.miss = false;
                    shared.block_ready.notify_all();
                }
            }
            Err(err) => {
                warn!(block, %err, "prefetch read failed");
                // Do not clobber a cursor a consumer reset while the
                // read was in flight.
                if state.cursor == Some(block) {
                    state.cursor = fs.bitmap().next_used(block + 1);
                }
                if state.miss {
                    state.failed = Some(block);
                    state.miss = false;
                    shared.block_ready.notify_all();
                }
            }
        }
    }

    // Hand every still-cached buffer back before exiting.
    let cache = std::mem::take(&mut state.cache);
    drop(state);
    for (_, buf) in cache {
        fs.pool().release(buf);
    }
    debug!("readahead worker stopped");
}
