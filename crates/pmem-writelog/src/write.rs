//! Write pipeline: admission, resource reservation, deferral and dispatch.
//!
//! A write that clears the block guard reserves one lane, one descriptor
//! slot and one payload buffer per extent in a single critical section;
//! partial reservations are cancelled. Writes that cannot reserve join a
//! FIFO deferred queue drained as completing writes return resources.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::cache::CacheInner;
use crate::descriptor::{FLAG_HAS_DATA, FLAG_SEQUENCED};
use crate::entry::LogEntry;
use crate::error::{CacheError, CacheResult};
use crate::extent::ImageExtent;
use crate::guard::GuardCell;
use crate::image::Completion;
use crate::pool::PayloadReservation;
use crate::sync::{Gather, SyncPoint};

/// Completes the user's callback exactly once.
pub(crate) struct UserCompletion {
    completed: AtomicBool,
    callback: Mutex<Option<Completion>>,
}

impl UserCompletion {
    pub fn new(callback: Completion) -> Arc<Self> {
        Arc::new(Self {
            completed: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
        })
    }

    pub fn complete(&self, result: CacheResult<()>) {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(callback) = self.callback.lock().take() {
                callback(result);
            }
        } else {
            trace!("user request already completed");
        }
    }
}

#[derive(Default)]
pub(crate) struct WriteResources {
    pub allocated: bool,
    pub buffers: Vec<PayloadReservation>,
}

/// Custodian of one user write while it travels the pipeline. Owns the
/// guard cell until the write persists.
pub(crate) struct WriteRequest {
    pub extents: Vec<ImageExtent>,
    pub data: Vec<u8>,
    pub cell: GuardCell,
    pub detained: bool,
    pub user: Arc<UserCompletion>,
    pub resources: WriteResources,
    pub arrived: Instant,
}

/// One log entry travelling the flush/append pipeline.
pub(crate) struct LogOperation {
    pub entry: Arc<LogEntry>,
    pub reservation: Option<PayloadReservation>,
    pub sync_point: Option<Arc<SyncPoint>>,
    pub on_persist: Option<Completion>,
    /// Whether a descriptor slot was reserved at admission. Sync point
    /// operations reserve lazily in the append worker.
    pub slot_reserved: bool,
}

impl CacheInner {
    /// Reserve lanes, descriptor slots and payload buffers for a write.
    /// `Ok(false)` defers the request; an error is user-visible.
    pub(crate) fn alloc_write_resources(&self, request: &mut WriteRequest) -> CacheResult<bool> {
        debug_assert!(!request.resources.allocated);
        let num_extents = request.extents.len() as u32;
        {
            let state = self.state.lock();
            if state.free_lanes < num_extents {
                debug!(
                    need = num_extents,
                    have = state.free_lanes,
                    "not enough free lanes"
                );
                return Ok(false);
            }
            if state.ring.free() < num_extents {
                debug!(
                    need = num_extents,
                    have = state.ring.free(),
                    "not enough free log entries"
                );
                return Ok(false);
            }
        }

        let pool = self.pool().clone();
        let mut buffers = Vec::with_capacity(request.extents.len());
        for extent in &request.extents {
            match pool.reserve(extent.length) {
                Ok(Some(reservation)) => buffers.push(reservation),
                Ok(None) => {
                    debug!(%extent, "can't reserve all payload buffers");
                    for buffer in buffers {
                        pool.cancel(buffer);
                    }
                    return Ok(false);
                }
                Err(err) => {
                    for buffer in buffers {
                        pool.cancel(buffer);
                    }
                    return Err(err);
                }
            }
        }

        let mut state = self.state.lock();
        if state.free_lanes >= num_extents && state.ring.reserve(num_extents) {
            state.free_lanes -= num_extents;
            state.unpublished_reserves += num_extents;
            request.resources.allocated = true;
            request.resources.buffers = buffers;
            Ok(true)
        } else {
            drop(state);
            for buffer in buffers {
                pool.cancel(buffer);
            }
            Ok(false)
        }
    }

    /// Dispatch now if resources allow, otherwise join the deferred FIFO.
    pub(crate) fn alloc_and_dispatch_io(&self, mut request: WriteRequest) {
        let mut dispatch_here = false;
        let mut failed = None;
        {
            // Serialized with the deferred dispatcher: a request mid-pop
            // there must not be overtaken.
            let _dispatch_guard = self.deferred_lock.lock();
            let queue_empty = { self.state.lock().deferred.is_empty() };
            if queue_empty {
                match self.alloc_write_resources(&mut request) {
                    Ok(allocated) => dispatch_here = allocated,
                    Err(err) => failed = Some(err),
                }
            }
        }
        if let Some(err) = failed {
            self.fail_admitted_request(request, err);
            return;
        }

        if dispatch_here {
            self.dispatch_write(request);
        } else {
            self.metrics.wr_deferred();
            let depth = {
                let mut state = self.state.lock();
                state.deferred.push_back(request);
                state.deferred.len()
            };
            debug!(deferred = depth, "write deferred for resources");
            self.dispatch_deferred_writes();
        }
    }

    /// Complete a request that failed before dispatch and release its cell.
    fn fail_admitted_request(&self, request: WriteRequest, err: CacheError) {
        debug_assert!(!request.resources.allocated);
        request.user.complete(Err(err));
        self.release_guarded_request(request.cell);
    }

    /// Dispatch deferred writes in FIFO order until one fails to reserve.
    pub(crate) fn dispatch_deferred_writes(&self) {
        loop {
            let mut to_dispatch = None;
            let mut failed = None;
            {
                let _dispatch_guard = self.deferred_lock.lock();
                let front = { self.state.lock().deferred.pop_front() };
                let Some(mut request) = front else {
                    break;
                };
                match self.alloc_write_resources(&mut request) {
                    Ok(true) => {
                        let mut state = self.state.lock();
                        if !state.deferred.is_empty() {
                            self.wake_up_locked(&mut state);
                        }
                        drop(state);
                        to_dispatch = Some(request);
                    }
                    Ok(false) => {
                        self.state.lock().deferred.push_front(request);
                    }
                    Err(err) => failed = Some((request, err)),
                }
            }
            if let Some((request, err)) = failed {
                self.fail_admitted_request(request, err);
                continue;
            }
            match to_dispatch {
                Some(request) => self.dispatch_write(request),
                None => break,
            }
        }
    }

    /// Return a completed write's lanes and pull the next deferred write in.
    pub(crate) fn release_write_lanes(&self, lanes: u32) {
        {
            let mut state = self.state.lock();
            state.free_lanes += lanes;
        }
        self.dispatch_deferred_writes();
    }

    /// Takes custody of the request. Resources must already be allocated.
    pub(crate) fn dispatch_write(&self, mut request: WriteRequest) {
        debug_assert!(request.resources.allocated);
        debug!(
            extents = request.extents.len(),
            detained = request.detained,
            "dispatching write"
        );
        let pool = self.pool().clone();
        let num_extents = request.extents.len() as u32;
        let extent_ops = Gather::new();
        let mut operations = Vec::with_capacity(request.extents.len());
        let mut log_entries = Vec::with_capacity(request.extents.len());
        let mut payload_ranges = Vec::with_capacity(request.extents.len());
        let persist_on_flush;
        let on_ops_persist;

        {
            let mut state = self.state.lock();
            persist_on_flush = state.persist_on_flush;
            let sync_point = state
                .current_sync_point
                .clone()
                .expect("cache is initialized");
            on_ops_persist = sync_point.prior_persisted.new_sub();

            let mut buffer_offset = 0usize;
            let buffers = std::mem::take(&mut request.resources.buffers);
            for (extent, reservation) in request.extents.iter().zip(buffers) {
                let entry = LogEntry::new_write(extent.offset, extent.length);
                let sequence = if persist_on_flush {
                    // Sequence zero is never used.
                    0
                } else {
                    state.last_op_sequence += 1;
                    state.last_op_sequence
                };
                entry.update_record(|record| {
                    record.payload_handle = reservation.handle();
                    record.set_flag(FLAG_HAS_DATA, true);
                    record.sync_gen_number = state.current_sync_gen;
                    record.write_sequence_number = sequence;
                    record.set_flag(FLAG_SEQUENCED, sequence != 0);
                });
                sync_point.record_write(extent.length);
                self.metrics.log_op(extent.length);
                payload_ranges.push((
                    reservation.handle(),
                    buffer_offset,
                    extent.length as usize,
                ));
                buffer_offset += extent.length as usize;
                operations.push(LogOperation {
                    entry: entry.clone(),
                    reservation: Some(reservation),
                    sync_point: Some(sync_point.clone()),
                    on_persist: Some(extent_ops.new_sub().into_completion()),
                    slot_reserved: true,
                });
                log_entries.push(entry);
            }
        }

        // Completion fan-in: once every extent op persists, feed the sync
        // point, finish the user (persist-on-write) and release resources.
        let inner = self.arc();
        let cell = request.cell;
        let user = request.user.clone();
        let arrived = request.arrived;
        self.tracker.start_op();
        extent_ops.set_finisher(Box::new(move |result| {
            on_ops_persist.complete(result.clone());
            if !persist_on_flush {
                user.complete(result);
            }
            inner
                .metrics
                .add_wr_latency_ns(arrived.elapsed().as_nanos() as u64);
            inner.release_write_lanes(num_extents);
            inner.release_guarded_request(cell);
            inner.tracker.finish_op();
        }));
        extent_ops.activate();

        // Copy payload bytes into their reserved pool regions.
        for (handle, offset, len) in payload_ranges {
            pool.write_payload(handle, &request.data[offset..offset + len]);
        }

        self.map.add_log_entries(&log_entries);

        if persist_on_flush {
            // Done with the caller's buffer; durability is promised by the
            // next sync point.
            request.user.complete(Ok(()));
            self.schedule_flush_and_append(operations);
        } else {
            // The caller is waiting for persistence; use its thread for the
            // payload flush.
            if let Err(err) = self.flush_payload_buffers(&operations) {
                self.fail_unappended_ops(operations, err);
                return;
            }
            self.schedule_append(operations);
        }
    }
}
