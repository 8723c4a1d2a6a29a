//! Writeback of dirty entries to the image and retirement of clean ones.
//!
//! `wake_up` schedules `process_work` on the general work queue; each pass
//! dispatches deferred writes, pushes dirty entries down to the image within
//! the in-flight caps, and retires flushed entries in ring order, reclaiming
//! their descriptor slots and payload space in pool transactions.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::cache::{CacheInner, CoreState};
use crate::entry::{LogEntry, PayloadBorrow};
use crate::extent::ImageExtent;
use crate::image::{Completion, WriteSource};

const PROCESS_WORK_MAX_ITERATIONS: u32 = 4;

impl CacheInner {
    pub(crate) fn wake_up_locked(&self, state: &mut CoreState) {
        if !state.wake_up_enabled {
            debug!("deferred processing disabled");
            return;
        }
        if state.wake_up_requested && state.wake_up_scheduled {
            return;
        }
        state.wake_up_requested = true;
        if state.wake_up_scheduled {
            return;
        }
        state.wake_up_scheduled = true;
        let inner = self.arc();
        self.tracker.start_op();
        self.work_queue.queue(move || {
            inner.process_work();
            inner.tracker.finish_op();
        });
    }

    pub(crate) fn process_work(&self) {
        let mut iterations = PROCESS_WORK_MAX_ITERATIONS;
        loop {
            {
                self.state.lock().wake_up_requested = false;
            }
            self.dispatch_deferred_writes();
            self.process_writeback_dirty_entries();
            while self.retire_entries() {}

            iterations -= 1;
            let requested = { self.state.lock().wake_up_requested };
            if !requested || iterations == 0 {
                break;
            }
        }
        let mut state = self.state.lock();
        state.wake_up_scheduled = false;
        if state.wake_up_requested {
            self.wake_up_locked(&mut state);
        }
    }

    fn can_flush_entry(&self, state: &CoreState, entry: &Arc<LogEntry>) -> bool {
        entry.completed()
            && state.flush_ops_in_flight <= self.config.writeback_ops_limit
            && state.flush_bytes_in_flight <= self.config.writeback_bytes_limit
    }

    /// Send the oldest flushable dirty entries to the image.
    pub(crate) fn process_writeback_dirty_entries(&self) {
        let mut writes: Vec<(Arc<LogEntry>, PayloadBorrow)> = Vec::new();
        let all_clean;
        {
            let _entry_readers = self.entry_reader.read();
            let mut state = self.state.lock();
            loop {
                let Some(front) = state.dirty_entries.front() else {
                    break;
                };
                if !self.can_flush_entry(&state, front) {
                    break;
                }
                let entry = state.dirty_entries.pop_front().expect("front");
                state.flush_ops_in_flight += 1;
                state.flush_bytes_in_flight += entry.write_bytes();
                entry.set_flushing(true);
                let borrow = PayloadBorrow::new(
                    self.pool().clone(),
                    entry.clone(),
                    0,
                    entry.write_bytes(),
                );
                writes.push((entry, borrow));
            }
            all_clean = state.flush_ops_in_flight == 0 && state.dirty_entries.is_empty();
        }

        for (entry, borrow) in writes {
            self.writeback_entry(entry, borrow);
        }

        if all_clean {
            self.drain_flush_complete_waiters();
        }
    }

    fn writeback_entry(&self, entry: Arc<LogEntry>, borrow: PayloadBorrow) {
        let offset = entry.image_offset_bytes();
        let length = entry.write_bytes();
        self.metrics.writeback_op(length);
        let inner = self.arc();
        self.tracker.start_op();
        self.image.aio_write(
            vec![ImageExtent::new(offset, length)],
            WriteSource::Logged(borrow),
            Box::new(move |result| {
                {
                    let mut state = inner.state.lock();
                    state.flush_ops_in_flight -= 1;
                    state.flush_bytes_in_flight -= length;
                    entry.set_flushing(false);
                    match result {
                        Ok(()) => {
                            debug!(index = entry.index(), "entry flushed to image");
                            entry.set_flushed();
                        }
                        Err(err) => {
                            // Never user-visible; retried from the head of
                            // the dirty list.
                            warn!(index = entry.index(), error = %err, "writeback failed");
                            inner.metrics.writeback_failures();
                            state.dirty_entries.push_front(entry.clone());
                        }
                    }
                    inner.wake_up_locked(&mut state);
                }
                inner.tracker.finish_op();
            }),
        );
    }

    fn can_retire_entry(entry: &Arc<LogEntry>) -> bool {
        entry.flushed() && entry.reader_count() == 0
    }

    /// Retire up to a transaction's worth of the oldest eligible entries.
    /// Returns true if anything was retired.
    pub(crate) fn retire_entries(&self) -> bool {
        let mut retiring: Vec<Arc<LogEntry>> = Vec::new();
        {
            // Readers can't be added while the entry reader lock is held
            // exclusively.
            let _entry_readers = self.entry_reader.write();
            let mut state = self.state.lock();
            while retiring.len() < self.config.retire_batch_ops {
                let Some(front) = state.log_entries.front() else {
                    break;
                };
                if !Self::can_retire_entry(front) {
                    break;
                }
                let entry = state.log_entries.pop_front().expect("front");
                debug_assert!(!entry.flushing());
                debug_assert!(entry.completed());
                // Remove map intervals first so no new readers can appear.
                self.map.remove_log_entry(&entry);
                debug_assert_eq!(entry.reader_count(), 0);
                debug_assert_eq!(entry.referring_map_entries(), 0);
                retiring.push(entry);
            }
        }

        if retiring.is_empty() {
            return false;
        }
        let count = retiring.len() as u32;
        debug!(count, "retiring entries");

        let commit = {
            let _append_guard = self.append_lock.lock();
            let frees: Vec<(u64, u64)> = retiring
                .iter()
                .filter(|entry| entry.has_data())
                .map(|entry| (entry.payload_handle(), entry.write_bytes()))
                .collect();
            let new_first_valid = {
                let state = self.state.lock();
                (state.ring.first_valid() + count) % state.ring.total()
            };
            self.pool().commit_retire(new_first_valid, &frees)
        };

        match commit {
            Ok(()) => {
                let kick_appender = {
                    let mut state = self.state.lock();
                    state.ring.retire(count);
                    // A sync point op may have been waiting for a slot.
                    !state.ops_to_append.is_empty()
                };
                self.metrics.add_retired(count as u64);
                if kick_appender {
                    self.kick_append_worker();
                }
                true
            }
            Err(err) => {
                error!(error = %err, "retire transaction failed; requeueing entries");
                let mut state = self.state.lock();
                for entry in retiring.into_iter().rev() {
                    // Map intervals stay dropped; the data is already on the
                    // image, so reads miss through correctly.
                    state.log_entries.push_front(entry);
                }
                false
            }
        }
    }

    pub(crate) fn drain_flush_complete_waiters(&self) {
        let waiters = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.flush_complete_waiters)
        };
        for waiter in waiters {
            waiter(Ok(()));
        }
    }

    /// Internal flush: completes once every dirty entry has reached the
    /// image. Repeated flushes on a clean cache complete immediately.
    pub(crate) fn flush_dirty(&self, on_done: Completion) {
        self.metrics.internal_flush_ops();
        let all_clean = {
            let state = self.state.lock();
            state.flush_ops_in_flight == 0 && state.dirty_entries.is_empty()
        };
        if all_clean {
            debug!("no dirty entries");
            on_done(Ok(()));
            return;
        }
        debug!("dirty entries remain");
        let inner = self.arc();
        let retry: Completion = Box::new(move |_| {
            inner.flush_dirty(on_done);
        });
        let mut state = self.state.lock();
        state.flush_complete_waiters.push(retry);
        self.wake_up_locked(&mut state);
    }
}
