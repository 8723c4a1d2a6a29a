//! The write log cache itself.
//!
//! `WriteLogCache` fronts an [`ImageStore`] with a persistent-memory write
//! log: writes append to the log and complete per the persistence mode,
//! reads are served from the log where it holds the newest data, and a
//! background loop writes dirty entries down and retires clean ones.
//!
//! Lock order, top-down: entry reader > deferred dispatch > append > main >
//! guard/map internal locks. Only the finisher threads hold a lock across a
//! pool drain.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::entry::{LogEntry, PayloadBorrow};
use crate::error::{CacheError, CacheResult};
use crate::extent::{
    all_block_aligned, block_extent_of, image_extent_of, BlockExtent, ExtentsSummary,
    ImageExtent, BLOCK_SIZE,
};
use crate::guard::{BlockGuard, DetainOutcome, GuardCell, GuardedRequest};
use crate::image::{CompareCompletion, Completion, ImageStore, ReadCompletion};
use crate::map::WriteLogMap;
use crate::metrics::{CacheMetrics, CacheMetricsSnapshot};
use crate::pool::LogPool;
use crate::ring::RingState;
use crate::sync::SyncPoint;
use crate::worker::{Finisher, OpTracker};
use crate::write::{LogOperation, UserCompletion, WriteRequest};

/// Everything guarded by the main lock.
pub(crate) struct CoreState {
    pub ring: RingState,
    pub free_lanes: u32,
    pub unpublished_reserves: u32,
    /// Oldest first; retirement pops the front.
    pub log_entries: VecDeque<Arc<LogEntry>>,
    pub dirty_entries: VecDeque<Arc<LogEntry>>,
    pub ops_to_flush: VecDeque<LogOperation>,
    pub ops_to_append: VecDeque<LogOperation>,
    /// Writes that cleared the guard but are waiting for resources.
    pub deferred: VecDeque<WriteRequest>,
    pub current_sync_point: Option<Arc<SyncPoint>>,
    pub current_sync_gen: u64,
    pub last_op_sequence: u64,
    pub persist_on_flush: bool,
    pub flush_seen: bool,
    pub shutting_down: bool,
    pub wake_up_requested: bool,
    pub wake_up_scheduled: bool,
    pub wake_up_enabled: bool,
    pub flush_ops_in_flight: u32,
    pub flush_bytes_in_flight: u64,
    pub flush_complete_waiters: Vec<Completion>,
    pub initialized: bool,
}

impl CoreState {
    fn new(config: &CacheConfig) -> Self {
        Self {
            ring: RingState::new(2),
            free_lanes: config.max_concurrent_writes,
            unpublished_reserves: 0,
            log_entries: VecDeque::new(),
            dirty_entries: VecDeque::new(),
            ops_to_flush: VecDeque::new(),
            ops_to_append: VecDeque::new(),
            deferred: VecDeque::new(),
            current_sync_point: None,
            current_sync_gen: 0,
            last_op_sequence: 0,
            persist_on_flush: config.persist_on_flush,
            flush_seen: false,
            shutting_down: false,
            wake_up_requested: false,
            wake_up_scheduled: false,
            wake_up_enabled: true,
            flush_ops_in_flight: 0,
            flush_bytes_in_flight: 0,
            flush_complete_waiters: Vec::new(),
            initialized: false,
        }
    }
}

pub(crate) struct CacheInner {
    pub config: CacheConfig,
    pub image: Arc<dyn ImageStore>,
    pool: std::sync::OnceLock<Arc<LogPool>>,
    pub guard: BlockGuard,
    pub map: WriteLogMap,
    pub state: Mutex<CoreState>,
    pub append_lock: Mutex<()>,
    /// Shared by borrow creation; exclusive by retirement.
    pub entry_reader: RwLock<()>,
    pub deferred_lock: Mutex<()>,
    pub work_queue: Finisher,
    pub persist_finisher: Finisher,
    pub append_finisher: Finisher,
    pub completion_finisher: Finisher,
    pub tracker: OpTracker,
    pub metrics: Arc<CacheMetrics>,
    weak_self: Weak<CacheInner>,
}

impl CacheInner {
    pub(crate) fn arc(&self) -> Arc<CacheInner> {
        self.weak_self.upgrade().expect("cache inner alive")
    }

    pub(crate) fn pool(&self) -> &Arc<LogPool> {
        self.pool.get().expect("cache is initialized")
    }

    pub(crate) fn detain_guarded_request(&self, request: GuardedRequest) {
        match self.guard.detain(request) {
            DetainOutcome::Acquired(cell, request) => {
                trace!(extent = %cell.extent, "guard acquired");
                let detained = request.detained;
                (request.on_acquire)(cell, detained);
            }
            DetainOutcome::Queued => {
                debug!("detaining guarded request behind in-flight requests");
            }
        }
    }

    pub(crate) fn release_guarded_request(&self, cell: GuardCell) {
        let mut waiters = self.guard.release(cell);
        while let Some(mut waiter) = waiters.pop_front() {
            waiter.detained = true;
            self.detain_guarded_request(waiter);
        }
    }

    /// Begin a new sync point, chaining it behind the current one.
    pub(crate) fn new_sync_point_locked(&self, state: &mut CoreState) {
        let old_sync_point = state.current_sync_point.clone();
        if old_sync_point.is_some() {
            state.current_sync_gen += 1;
        }
        let new_sync_point = SyncPoint::new(state.current_sync_gen);
        self.metrics.sync_points();

        // Once every prior entry persists, append this sync point's own
        // descriptor; off the main lock, since the gather can fire inline.
        let inner = self.arc();
        let appending = new_sync_point.clone();
        new_sync_point
            .prior_persisted
            .set_finisher(Box::new(move |result| {
                let worker = inner.clone();
                inner.tracker.start_op();
                inner.work_queue.queue(move || {
                    worker.append_sync_point(appending, result);
                    worker.tracker.finish_op();
                });
            }));

        if let Some(old) = &old_sync_point {
            old.link_successor(&new_sync_point);
            old.set_final_op_sequence(state.last_op_sequence);
            // The new sync point waits for its predecessor's durability.
            let predecessor_durable = new_sync_point.prior_persisted.new_sub();
            let fire = old.add_on_persisted(predecessor_durable.into_completion());
            debug_assert!(fire.is_none(), "current sync point cannot be persisted");
            // The old sync point acquires no more sub-ops.
            old.prior_persisted.activate();
            debug!(
                gen = new_sync_point.gen(),
                prior = old.gen(),
                "new sync point"
            );
        } else {
            debug!(gen = new_sync_point.gen(), "first sync point");
        }

        state.current_sync_point = Some(new_sync_point);
    }

    /// Append the sync point's descriptor now that its dependencies are
    /// durable.
    pub(crate) fn append_sync_point(
        &self,
        sync_point: Arc<SyncPoint>,
        prior_status: CacheResult<()>,
    ) {
        debug!(
            gen = sync_point.gen(),
            writes = sync_point.writes(),
            completed = sync_point.writes_completed(),
            bytes = sync_point.bytes(),
            "prior log entries persisted for sync point"
        );
        let entry = LogEntry::new_sync_point(sync_point.gen(), sync_point.final_op_sequence());
        let slot_reserved = {
            let mut state = self.state.lock();
            state.ring.reserve(1)
        };
        let inner = self.arc();
        let persisted = sync_point.clone();
        let operation = LogOperation {
            entry,
            reservation: None,
            sync_point: None,
            on_persist: Some(Box::new(move |append_result: CacheResult<()>| {
                let result = prior_status.and(append_result);
                inner.finish_sync_point_persist(persisted, result);
            })),
            slot_reserved,
        };
        self.schedule_append(vec![operation]);
    }

    /// The sync point's descriptor is durable; fire everything waiting.
    pub(crate) fn finish_sync_point_persist(
        &self,
        sync_point: Arc<SyncPoint>,
        result: CacheResult<()>,
    ) {
        debug!(gen = sync_point.gen(), "sync point persisted");
        for callback in sync_point.mark_persisted() {
            callback(result.clone());
        }
    }

    /// Create or open the pool, recover its contents, and go live.
    fn writelog_init(&self) -> CacheResult<()> {
        let existing = self
            .config
            .pool_candidates()
            .into_iter()
            .find(|path| path.exists());
        let pool = match existing {
            Some(path) => {
                debug!(path = %path.display(), "opening existing pool");
                Arc::new(LogPool::open(&path, BLOCK_SIZE as u32)?)
            }
            None => {
                let path = self.config.pool_create_path();
                debug!(path = %path.display(), "creating pool");
                Arc::new(LogPool::create(
                    &path,
                    self.config.pool_size,
                    BLOCK_SIZE as u32,
                )?)
            }
        };

        let root = pool.root();
        let mut recovered = Vec::new();
        let mut max_gen = 0u64;
        let mut max_sequence = 0u64;
        let mut any_recovered = false;
        let mut index = root.first_valid_entry;
        while index != root.first_free_entry {
            let record = pool.read_descriptor(index);
            if !record.entry_valid() {
                return Err(CacheError::corruption(format!(
                    "invalid descriptor inside the valid ring range at {index}"
                )));
            }
            if record.has_data() {
                pool.seed_allocation(record.payload_handle, record.write_bytes)?;
            }
            max_gen = max_gen.max(record.sync_gen_number);
            max_sequence = max_sequence.max(record.write_sequence_number);
            any_recovered = true;
            recovered.push(LogEntry::from_recovered(index, record));
            index = (index + 1) % root.num_log_entries;
        }

        self.pool.set(pool).map_err(|_| {
            CacheError::invalid_config("cache initialized twice")
        })?;

        {
            let mut state = self.state.lock();
            state.ring = RingState::restore(
                root.num_log_entries,
                root.first_free_entry,
                root.first_valid_entry,
                recovered.len() as u32,
            );
            for entry in &recovered {
                if entry.has_data() {
                    // Recovered entries are dirty again: their writeback
                    // state was volatile.
                    self.map.add_log_entry(entry);
                    state.dirty_entries.push_back(entry.clone());
                }
                state.log_entries.push_back(entry.clone());
            }
            if any_recovered {
                state.current_sync_gen = max_gen + 1;
            }
            state.last_op_sequence = max_sequence;
            self.new_sync_point_locked(&mut state);
            state.initialized = true;
            if !state.dirty_entries.is_empty() {
                self.wake_up_locked(&mut state);
            }
        }
        debug!(
            entries = recovered.len(),
            ring = root.num_log_entries,
            "write log initialized"
        );
        Ok(())
    }

    /// Retire everything left, verify the log is clean, flush the mapping.
    fn drain_and_close_pool(&self) -> CacheResult<()> {
        while self.retire_entries() {}
        {
            let _entry_readers = self.entry_reader.write();
            let mut state = self.state.lock();
            debug_assert!(state.dirty_entries.is_empty());
            debug_assert!(state.ops_to_flush.is_empty());
            debug_assert!(state.ops_to_append.is_empty());
            debug_assert!(state.deferred.is_empty());
            debug_assert_eq!(state.flush_ops_in_flight, 0);
            debug_assert_eq!(state.unpublished_reserves, 0);
            // The current sync point's gather finisher references the
            // cache; dropping it here lets everything unwind.
            state.current_sync_point = None;
            let leftovers: Vec<_> = state.log_entries.drain(..).collect();
            drop(state);
            for entry in &leftovers {
                self.map.remove_log_entry(entry);
                debug_assert_eq!(entry.referring_map_entries(), 0);
                debug_assert_eq!(entry.reader_count(), 0);
                debug_assert!(!entry.flushing());
            }
        }
        if let Some(pool) = self.pool.get() {
            debug!("closing pool");
            pool.close()?;
        }
        Ok(())
    }
}

fn chain_status(prior: CacheResult<()>, next: Completion) -> Completion {
    Box::new(move |result| next(prior.and(result)))
}

/// Persistent-memory-backed write-back log cache over an [`ImageStore`].
pub struct WriteLogCache {
    inner: Arc<CacheInner>,
}

impl WriteLogCache {
    /// Build a cache over `image`. Call [`WriteLogCache::init`] before
    /// submitting IO.
    pub fn new(config: CacheConfig, image: Arc<dyn ImageStore>) -> CacheResult<Self> {
        let config = config.validated()?;
        let inner = Arc::new_cyclic(|weak_self| CacheInner {
            state: Mutex::new(CoreState::new(&config)),
            config,
            image,
            pool: std::sync::OnceLock::new(),
            guard: BlockGuard::new(),
            map: WriteLogMap::new(),
            append_lock: Mutex::new(()),
            entry_reader: RwLock::new(()),
            deferred_lock: Mutex::new(()),
            work_queue: Finisher::new("wlog-work"),
            persist_finisher: Finisher::new("wlog-persist"),
            append_finisher: Finisher::new("wlog-append"),
            completion_finisher: Finisher::new("wlog-complete"),
            tracker: OpTracker::default(),
            metrics: Arc::new(CacheMetrics::default()),
            weak_self: weak_self.clone(),
        });
        Ok(Self { inner })
    }

    /// Initialize the lower image, then the write log pool.
    pub fn init(&self, on_done: Completion) {
        let inner = self.inner.clone();
        self.inner.image.init(Box::new(move |result| match result {
            Ok(()) => on_done(inner.writelog_init()),
            Err(err) => on_done(Err(err)),
        }));
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Read `extents`, serving log hits zero-copy and forwarding misses to
    /// the image. The completion receives the extents' bytes concatenated.
    pub fn aio_read(&self, extents: Vec<ImageExtent>, on_done: ReadCompletion) {
        let inner = &self.inner;
        inner.metrics.rd_req();
        if !all_block_aligned(&extents) {
            let bad = extents
                .iter()
                .find(|extent| !crate::extent::is_block_aligned(extent));
            let (offset, length) = bad.map_or((0, 0), |extent| (extent.offset, extent.length));
            on_done(Err(CacheError::Unaligned { offset, length }));
            return;
        }
        let total_bytes: u64 = extents.iter().map(|extent| extent.length).sum();
        inner.metrics.add_rd_bytes(total_bytes);

        struct ReadPart {
            length: u64,
            borrow: Option<PayloadBorrow>,
        }

        let mut parts: Vec<ReadPart> = Vec::new();
        let mut miss_extents: Vec<ImageExtent> = Vec::new();
        let mut hit_bytes = 0u64;
        {
            let _entry_readers = inner.entry_reader.read();
            for extent in &extents {
                let mut extent_offset = 0u64;
                let map_entries = inner.map.find_map_entries(block_extent_of(extent));
                for (map_extent, entry) in map_entries {
                    let entry_image = image_extent_of(&map_extent);
                    let position = extent.offset + extent_offset;
                    if entry_image.offset > position {
                        let miss = ImageExtent::new(position, entry_image.offset - position);
                        miss_extents.push(miss);
                        parts.push(ReadPart {
                            length: miss.length,
                            borrow: None,
                        });
                        extent_offset += miss.length;
                    }
                    let position = extent.offset + extent_offset;
                    debug_assert!(entry_image.offset <= position);
                    let entry_offset = position - entry_image.offset;
                    let hit_length = (entry_image.length - entry_offset)
                        .min(extent.length - extent_offset);
                    let buffer_offset =
                        (entry_image.offset - entry.image_offset_bytes()) + entry_offset;
                    trace!(index = entry.index(), hit_length, "read hit");
                    let borrow = PayloadBorrow::new(
                        inner.pool().clone(),
                        entry,
                        buffer_offset,
                        hit_length,
                    );
                    parts.push(ReadPart {
                        length: hit_length,
                        borrow: Some(borrow),
                    });
                    extent_offset += hit_length;
                    hit_bytes += hit_length;
                }
                if extent.length > extent_offset {
                    let miss =
                        ImageExtent::new(extent.offset + extent_offset, extent.length - extent_offset);
                    miss_extents.push(miss);
                    parts.push(ReadPart {
                        length: miss.length,
                        borrow: None,
                    });
                }
            }
        }

        inner.metrics.add_rd_hit_bytes(hit_bytes);
        if miss_extents.is_empty() {
            inner.metrics.rd_hit_req();
        } else if hit_bytes > 0 {
            inner.metrics.rd_part_hit_req();
        }

        let assemble = move |miss_bytes: Vec<u8>| -> Vec<u8> {
            let mut out = Vec::with_capacity(total_bytes as usize);
            let mut miss_offset = 0usize;
            for part in parts {
                match part.borrow {
                    Some(borrow) => out.extend_from_slice(&borrow),
                    None => {
                        let length = part.length as usize;
                        out.extend_from_slice(&miss_bytes[miss_offset..miss_offset + length]);
                        miss_offset += length;
                    }
                }
            }
            out
        };

        if miss_extents.is_empty() {
            on_done(Ok(assemble(Vec::new())));
        } else {
            self.inner.image.aio_read(
                miss_extents,
                Box::new(move |result| match result {
                    Ok(miss_bytes) => on_done(Ok(assemble(miss_bytes))),
                    Err(err) => on_done(Err(err)),
                }),
            );
        }
    }

    /// Log a write covering `extents`, whose payloads are concatenated in
    /// `data`. Completion timing follows the persistence mode.
    pub fn aio_write(&self, extents: Vec<ImageExtent>, data: Vec<u8>, on_done: Completion) {
        let inner = &self.inner;
        inner.metrics.wr_req();
        if inner.config.read_only {
            on_done(Err(CacheError::ReadOnly));
            return;
        }
        {
            let state = inner.state.lock();
            if state.shutting_down {
                on_done(Err(CacheError::ShuttingDown));
                return;
            }
        }
        if extents.is_empty() || !all_block_aligned(&extents) {
            let bad = extents
                .iter()
                .find(|extent| !crate::extent::is_block_aligned(extent));
            let (offset, length) = bad.map_or((0, 0), |extent| (extent.offset, extent.length));
            on_done(Err(CacheError::Unaligned { offset, length }));
            return;
        }
        let summary = ExtentsSummary::new(&extents);
        inner.metrics.add_wr_bytes(summary.total_bytes);
        if data.len() as u64 != summary.total_bytes {
            on_done(Err(CacheError::BufferSizeMismatch {
                expected: summary.total_bytes,
                found: data.len() as u64,
            }));
            return;
        }

        let user = UserCompletion::new(on_done);
        let guard_extent = summary.block_extent();
        let arrived = std::time::Instant::now();
        let inner = self.inner.clone();
        let guarded = GuardedRequest::new(
            guard_extent,
            Box::new(move |cell, detained| {
                if detained {
                    inner.metrics.wr_detained();
                }
                let request = WriteRequest {
                    extents,
                    data,
                    cell,
                    detained,
                    user,
                    resources: Default::default(),
                    arrived,
                };
                inner.alloc_and_dispatch_io(request);
            }),
        );
        self.inner.detain_guarded_request(guarded);
    }

    /// Flush to the write log. In persist-on-flush mode this creates a sync
    /// point if writes occurred since the last one and completes when it is
    /// durable; in persist-on-write mode completed writes are already
    /// durable. The lower image is not flushed.
    pub fn aio_flush(&self, on_done: Completion) {
        let inner = &self.inner;
        inner.metrics.aio_flush_ops();
        if inner.config.read_only {
            on_done(Err(CacheError::ReadOnly));
            return;
        }

        let mut pending: Option<Completion> = Some(on_done);
        let mut fire_now: Option<Completion> = None;
        {
            let mut state = inner.state.lock();
            if !state.flush_seen {
                state.flush_seen = true;
                if !state.persist_on_flush && inner.config.persist_on_write_until_flush {
                    state.persist_on_flush = true;
                    debug!("now persisting on flush");
                }
            }

            if state.persist_on_flush {
                let current = state
                    .current_sync_point
                    .clone()
                    .expect("cache is initialized");
                if current.writes() > 0 {
                    // Complete this flush with the current sync point and
                    // open a new one.
                    fire_now = current.add_on_persisted(pending.take().expect("pending"));
                    self.inner.new_sync_point_locked(&mut state);
                } else if let Some(earlier) = current.earlier() {
                    // No writes since the last sync point, but it has not
                    // persisted yet.
                    fire_now = earlier.add_on_persisted(pending.take().expect("pending"));
                }
            }
        }
        if let Some(callback) = fire_now {
            callback(Ok(()));
        }
        if let Some(callback) = pending {
            callback(Ok(()));
        }
    }

    /// Discard after flushing the log and invalidating the range in it.
    pub fn aio_discard(
        &self,
        offset: u64,
        length: u64,
        skip_partial_discard: bool,
        on_done: Completion,
    ) {
        let inner = &self.inner;
        inner.metrics.discard_ops();
        if inner.config.read_only {
            on_done(Err(CacheError::ReadOnly));
            return;
        }
        if length == 0 {
            on_done(Ok(()));
            return;
        }
        let discard_extent = ImageExtent::new(offset, length);
        // The guard and the log invalidation use the enclosing block
        // bounds; the image gets the original extent.
        let block_extent = block_extent_of(&discard_extent);

        let inner = self.inner.clone();
        let guarded = GuardedRequest::new(
            block_extent,
            Box::new(move |cell, _detained| {
                let finish_inner = inner.clone();
                let finish: Completion = Box::new(move |result| {
                    on_done(result);
                    finish_inner.release_guarded_request(cell);
                });
                let step_inner = inner.clone();
                inner.flush_dirty(Box::new(move |result| {
                    if let Err(err) = result {
                        finish(Err(err));
                        return;
                    }
                    step_inner.map.invalidate_range(block_extent);
                    step_inner
                        .image
                        .aio_discard(offset, length, skip_partial_discard, finish);
                }));
            }),
        );
        self.inner.detain_guarded_request(guarded);
    }

    /// Pass-through; the log never caches writesame payloads.
    pub fn aio_writesame(&self, offset: u64, length: u64, data: Vec<u8>, on_done: Completion) {
        let inner = &self.inner;
        inner.metrics.writesame_ops();
        if inner.config.read_only {
            on_done(Err(CacheError::ReadOnly));
            return;
        }
        inner.image.aio_writesame(offset, length, data, on_done);
    }

    /// Pass-through to the image.
    pub fn aio_compare_and_write(
        &self,
        extents: Vec<ImageExtent>,
        compare: Vec<u8>,
        data: Vec<u8>,
        on_done: CompareCompletion,
    ) {
        self.inner.metrics.compare_write_ops();
        self.inner
            .image
            .aio_compare_and_write(extents, compare, data, on_done);
    }

    /// Force full writeback of the log to the image.
    pub fn flush(&self, on_done: Completion) {
        self.inner.flush_dirty(on_done);
    }

    /// Flush the log, drop every cached interval, then invalidate below.
    pub fn invalidate(&self, on_done: Completion) {
        self.inner.metrics.invalidate_ops();
        let whole = BlockExtent::whole_image();
        let inner = self.inner.clone();
        let guarded = GuardedRequest::new(
            whole,
            Box::new(move |cell, _detained| {
                let finish_inner = inner.clone();
                let finish: Completion = Box::new(move |result| {
                    on_done(result);
                    finish_inner.release_guarded_request(cell);
                });
                let step_inner = inner.clone();
                inner.flush_dirty(Box::new(move |result| {
                    if let Err(err) = result {
                        finish(Err(err));
                        return;
                    }
                    step_inner.map.invalidate_range(whole);
                    step_inner.image.invalidate(finish);
                }));
            }),
        );
        self.inner.detain_guarded_request(guarded);
    }

    /// Stop admission, drain in-flight work, write everything back, retire
    /// the log, close the pool, then shut the image down.
    pub fn shut_down(&self, on_done: Completion) {
        let inner = self.inner.clone();
        {
            inner.state.lock().shutting_down = true;
        }
        debug!("shutting down");

        // Built in reverse: each step runs after the previous completes,
        // carrying the first error forward.
        let ctx: Completion = on_done;
        let ctx: Completion = {
            let inner = inner.clone();
            Box::new(move |result| {
                debug!("shutting down lower image");
                inner.image.shut_down(chain_status(result, ctx));
            })
        };
        let ctx: Completion = {
            let inner = inner.clone();
            Box::new(move |result| {
                let drained = inner.drain_and_close_pool();
                ctx(result.and(drained))
            })
        };
        let ctx: Completion = {
            let inner = inner.clone();
            Box::new(move |result| {
                {
                    let mut state = inner.state.lock();
                    state.wake_up_enabled = false;
                }
                debug!("waiting for internal async operations");
                inner.tracker.wait(chain_status(result, ctx));
            })
        };
        let ctx: Completion = {
            let inner = inner.clone();
            Box::new(move |result| {
                debug!("flushing remaining dirty entries");
                inner.flush_dirty(chain_status(result, ctx));
            })
        };
        debug!("waiting for in flight operations");
        inner.tracker.wait(ctx);
    }
}

impl std::fmt::Debug for WriteLogCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WriteLogCache")
            .field("initialized", &state.initialized)
            .field("ring_free", &state.ring.free())
            .field("free_lanes", &state.free_lanes)
            .field("dirty", &state.dirty_entries.len())
            .field("deferred", &state.deferred.len())
            .field("sync_gen", &state.current_sync_gen)
            .finish()
    }
}
