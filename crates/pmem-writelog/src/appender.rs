//! Payload flush and descriptor append scheduling.
//!
//! Scheduled operations drain through two queues. The flush worker persists
//! payload buffers in small batches with one drain per batch, then hands the
//! batch to the append worker. The append worker assigns ring indices,
//! copies descriptors into their slots, flushes them (splitting batches at
//! the ring wrap), drains, and atomically publishes the new head together
//! with the batch's payload reservations. An aborted publish fails the
//! whole batch; no partial batch is observable.

use tracing::{debug, error};

use crate::cache::CacheInner;
use crate::error::{CacheError, CacheResult};
use crate::write::LogOperation;

/// Split a batch's ring indices into contiguous `(start, len)` runs. The
/// indices ascend except where the batch wraps past the end of the ring.
fn contiguous_runs(indices: &[u32]) -> Vec<(u32, u32)> {
    let mut runs = Vec::new();
    let mut iter = indices.iter().copied();
    let Some(first) = iter.next() else {
        return runs;
    };
    let mut start = first;
    let mut len = 1u32;
    let mut previous = first;
    for index in iter {
        if index < previous {
            runs.push((start, len));
            start = index;
            len = 0;
        }
        previous = index;
        len += 1;
    }
    runs.push((start, len));
    runs
}

impl CacheInner {
    /// Queue ops for payload flush followed by descriptor append.
    pub(crate) fn schedule_flush_and_append(&self, ops: Vec<LogOperation>) {
        let need_worker = {
            let mut state = self.state.lock();
            let need = state.ops_to_flush.is_empty();
            state.ops_to_flush.extend(ops);
            debug!(ops_to_flush = state.ops_to_flush.len(), "scheduled flush");
            need
        };
        if need_worker {
            let inner = self.arc();
            self.tracker.start_op();
            self.persist_finisher.queue(move || {
                inner.flush_then_append_scheduled_ops();
                inner.tracker.finish_op();
            });
        }
    }

    /// Queue ops whose payloads are already durable for descriptor append.
    pub(crate) fn schedule_append(&self, ops: Vec<LogOperation>) {
        let need_worker = {
            let mut state = self.state.lock();
            let need = state.ops_to_append.is_empty();
            state.ops_to_append.extend(ops);
            debug!(ops_to_append = state.ops_to_append.len(), "scheduled append");
            need
        };
        if need_worker {
            self.kick_append_worker();
        }
    }

    /// Unconditionally run the append worker; duplicate runs drain nothing.
    pub(crate) fn kick_append_worker(&self) {
        let inner = self.arc();
        self.tracker.start_op();
        self.append_finisher.queue(move || {
            inner.append_scheduled_ops();
            inner.tracker.finish_op();
        });
    }

    /// Flush worker: persist payload batches, then feed the append worker.
    pub(crate) fn flush_then_append_scheduled_ops(&self) {
        loop {
            let batch: Vec<LogOperation> = {
                let mut state = self.state.lock();
                if state.ops_to_flush.is_empty() {
                    break;
                }
                let take = state.ops_to_flush.len().min(self.config.flush_batch_ops);
                state.ops_to_flush.drain(..take).collect()
            };
            debug!(flushing = batch.len(), "flushing payload batch");
            match self.flush_payload_buffers(&batch) {
                Ok(()) => self.schedule_append(batch),
                Err(err) => self.fail_unappended_ops(batch, err),
            }
        }
        // The append worker may already have exited; run the drain inline so
        // ops queued by the last batch cannot strand.
        self.append_scheduled_ops();
    }

    /// Flush the payload regions of a batch, with one drain for all.
    pub(crate) fn flush_payload_buffers(&self, ops: &[LogOperation]) -> CacheResult<()> {
        let pool = self.pool();
        for op in ops {
            if op.entry.has_data() {
                pool.flush_payload(op.entry.payload_handle(), op.entry.write_bytes())?;
            }
        }
        pool.drain()
    }

    /// Append worker: drain `ops_to_append` in publish batches.
    pub(crate) fn append_scheduled_ops(&self) {
        loop {
            let mut ops: Vec<LogOperation>;
            let append_result: CacheResult<()>;
            let reserve_count;
            {
                let _append_guard = self.append_lock.lock();
                {
                    let mut state = self.state.lock();
                    let mut taken = Vec::new();
                    while taken.len() < self.config.append_batch_ops {
                        let Some(front) = state.ops_to_append.front() else {
                            break;
                        };
                        if !front.slot_reserved && !state.ring.reserve(1) {
                            // Sync point op with no free slot; retirement
                            // will kick the worker again.
                            break;
                        }
                        let mut op = state.ops_to_append.pop_front().expect("front");
                        op.slot_reserved = true;
                        taken.push(op);
                    }
                    ops = taken;
                }
                if ops.is_empty() {
                    break;
                }
                reserve_count = ops.iter().filter(|op| op.reservation.is_some()).count() as u32;
                debug!(appending = ops.len(), "appending descriptor batch");
                self.alloc_op_log_entries(&mut ops);
                append_result = self.append_op_log_entries(&mut ops);
                if append_result.is_err() {
                    self.rollback_failed_append(&mut ops, reserve_count);
                }
            }

            if append_result.is_ok() {
                let mut state = self.state.lock();
                debug_assert!(state.unpublished_reserves >= reserve_count);
                state.unpublished_reserves -= reserve_count;
            }
            self.complete_op_log_entries(ops, append_result);
        }
    }

    /// Assign ring indices to the batch and list the entries.
    ///
    /// Entries join the dirty list here; writeback skips them until their
    /// persist completes.
    fn alloc_op_log_entries(&self, ops: &mut [LogOperation]) {
        let mut state = self.state.lock();
        for op in ops {
            let index = state.ring.assign_next();
            op.entry.set_index(index);
            op.entry.update_record(|record| {
                record.set_flag(crate::descriptor::FLAG_ENTRY_VALID, true);
            });
            state.log_entries.push_back(op.entry.clone());
            if op.entry.has_data() {
                state.dirty_entries.push_back(op.entry.clone());
            }
        }
    }

    /// Copy descriptors into their slots, persist them and publish the
    /// batch. Requires the append lock.
    fn append_op_log_entries(&self, ops: &mut [LogOperation]) -> CacheResult<()> {
        let pool = self.pool().clone();

        for op in ops.iter() {
            pool.write_descriptor(op.entry.index(), &op.entry.record());
        }
        let indices: Vec<u32> = ops.iter().map(|op| op.entry.index()).collect();
        let runs = contiguous_runs(&indices);
        if runs.len() > 1 {
            debug!(runs = runs.len(), "descriptor batch wraps the ring");
        }
        for (start, len) in runs {
            pool.flush_descriptors(start, len)?;
        }
        pool.drain()?;

        let new_first_free = { self.state.lock().ring.first_free() };
        let reservations = ops
            .iter_mut()
            .filter_map(|op| op.reservation.take())
            .collect();
        pool.commit_append(new_first_free, reservations)
    }

    /// Undo a batch whose publish aborted: the head was not advanced, the
    /// reservations were cancelled by the pool, and the in-memory entries
    /// must disappear again.
    fn rollback_failed_append(&self, ops: &mut [LogOperation], reserve_count: u32) {
        let pool = self.pool().clone();
        self.metrics.append_tx_failures();
        error!(ops = ops.len(), "append batch failed; rolling back");

        let entries: Vec<_> = ops.iter().map(|op| op.entry.clone()).collect();
        self.map.remove_log_entries(&entries);

        let mut state = self.state.lock();
        for op in ops.iter_mut() {
            // A publish abort cancels reservations in the pool; flush-stage
            // failures leave them in the op.
            if let Some(reservation) = op.reservation.take() {
                pool.cancel(reservation);
            }
            let entry = &op.entry;
            state.log_entries.retain(|e| !std::sync::Arc::ptr_eq(e, entry));
            state.dirty_entries.retain(|e| !std::sync::Arc::ptr_eq(e, entry));
        }
        let count = ops.len() as u32;
        state.ring.unassign(count);
        state.ring.unreserve(count);
        debug_assert!(state.unpublished_reserves >= reserve_count);
        state.unpublished_reserves -= reserve_count;
    }

    /// Fail a batch that never reached index assignment (payload flush
    /// error): release its slots, buffers and map entries, and fan the
    /// error out to every persist completion.
    pub(crate) fn fail_unappended_ops(&self, ops: Vec<LogOperation>, err: CacheError) {
        let pool = self.pool().clone();
        self.metrics.append_tx_failures();
        error!(ops = ops.len(), error = %err, "payload flush failed; failing batch");

        let entries: Vec<_> = ops.iter().map(|op| op.entry.clone()).collect();
        self.map.remove_log_entries(&entries);
        {
            let mut state = self.state.lock();
            let slot_count = ops.iter().filter(|op| op.slot_reserved).count() as u32;
            let reserve_count = ops.iter().filter(|op| op.reservation.is_some()).count() as u32;
            state.ring.unreserve(slot_count);
            debug_assert!(state.unpublished_reserves >= reserve_count);
            state.unpublished_reserves -= reserve_count;
        }
        let mut failed = Vec::with_capacity(ops.len());
        for mut op in ops {
            if let Some(reservation) = op.reservation.take() {
                pool.cancel(reservation);
            }
            failed.push(op);
        }
        self.complete_op_log_entries(failed, Err(err));
    }

    /// Fan the append result out to the batch on the completion finisher.
    pub(crate) fn complete_op_log_entries(
        &self,
        ops: Vec<LogOperation>,
        result: CacheResult<()>,
    ) {
        let inner = self.arc();
        self.tracker.start_op();
        self.completion_finisher.queue(move || {
            for op in ops {
                op.entry.set_completed();
                if op.entry.is_sync_point() {
                    // Nothing to write back for a sync point.
                    op.entry.set_flushed();
                }
                if let Some(sync_point) = &op.sync_point {
                    sync_point.record_write_completed();
                }
                if let Some(on_persist) = op.on_persist {
                    on_persist(result.clone());
                }
            }
            {
                let mut state = inner.state.lock();
                // New entries may be flushable.
                inner.wake_up_locked(&mut state);
            }
            inner.tracker.finish_op();
        });
    }
}
