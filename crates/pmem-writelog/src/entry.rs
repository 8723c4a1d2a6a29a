//! In-memory log entries and zero-copy payload borrows.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::descriptor::{DescriptorRecord, FLAG_HAS_DATA};
use crate::extent::BlockExtent;
use crate::pool::LogPool;

pub(crate) const INVALID_INDEX: u32 = u32::MAX;

/// One logged write (or sync point) while its descriptor slot is live.
///
/// The descriptor image is built up under `ram` until the append worker
/// copies it into the entry's pool slot; lifecycle bits and the two
/// reference counts are atomics so readers and the writeback path never
/// take the descriptor mutex.
pub struct LogEntry {
    ram: Mutex<DescriptorRecord>,
    index: AtomicU32,
    reader_count: AtomicU32,
    referring_map_entries: AtomicU32,
    completed: AtomicBool,
    flushing: AtomicBool,
    flushed: AtomicBool,
}

impl LogEntry {
    pub(crate) fn new_write(image_offset_bytes: u64, write_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            ram: Mutex::new(DescriptorRecord::for_write(image_offset_bytes, write_bytes)),
            index: AtomicU32::new(INVALID_INDEX),
            reader_count: AtomicU32::new(0),
            referring_map_entries: AtomicU32::new(0),
            completed: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            flushed: AtomicBool::new(false),
        })
    }

    pub(crate) fn new_sync_point(sync_gen_number: u64, final_op_sequence: u64) -> Arc<Self> {
        Arc::new(Self {
            ram: Mutex::new(DescriptorRecord::for_sync_point(
                sync_gen_number,
                final_op_sequence,
            )),
            index: AtomicU32::new(INVALID_INDEX),
            reader_count: AtomicU32::new(0),
            referring_map_entries: AtomicU32::new(0),
            completed: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            flushed: AtomicBool::new(false),
        })
    }

    pub(crate) fn from_recovered(index: u32, record: DescriptorRecord) -> Arc<Self> {
        let sync_point = record.is_sync_point();
        Arc::new(Self {
            ram: Mutex::new(record),
            index: AtomicU32::new(index),
            reader_count: AtomicU32::new(0),
            referring_map_entries: AtomicU32::new(0),
            completed: AtomicBool::new(true),
            flushing: AtomicBool::new(false),
            // Sync points carry no data to write back.
            flushed: AtomicBool::new(sync_point),
        })
    }

    pub(crate) fn record(&self) -> DescriptorRecord {
        *self.ram.lock()
    }

    pub(crate) fn update_record<F>(&self, update: F)
    where
        F: FnOnce(&mut DescriptorRecord),
    {
        update(&mut self.ram.lock());
    }

    pub fn block_extent(&self) -> BlockExtent {
        self.ram.lock().block_extent()
    }

    pub fn image_offset_bytes(&self) -> u64 {
        self.ram.lock().image_offset_bytes
    }

    pub fn write_bytes(&self) -> u64 {
        self.ram.lock().write_bytes
    }

    pub fn payload_handle(&self) -> u64 {
        self.ram.lock().payload_handle
    }

    pub fn is_sync_point(&self) -> bool {
        self.ram.lock().is_sync_point()
    }

    pub fn has_data(&self) -> bool {
        self.ram.lock().flag(FLAG_HAS_DATA)
    }

    #[inline]
    pub(crate) fn set_index(&self, index: u32) {
        self.index.store(index, Ordering::Release);
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index.load(Ordering::Acquire)
    }

    #[inline]
    pub fn add_reader(&self) {
        self.reader_count.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn remove_reader(&self) {
        let previous = self.reader_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
    }

    #[inline]
    pub fn reader_count(&self) -> u32 {
        self.reader_count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn map_ref_added(&self) {
        self.referring_map_entries.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn map_ref_removed(&self) {
        let previous = self.referring_map_entries.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
    }

    #[inline]
    pub fn referring_map_entries(&self) -> u32 {
        self.referring_map_entries.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_flushing(&self, value: bool) {
        self.flushing.store(value, Ordering::Release);
    }

    #[inline]
    pub fn flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_flushed(&self) {
        self.flushed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn flushed(&self) -> bool {
        self.flushed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = self.record();
        f.debug_struct("LogEntry")
            .field("index", &self.index())
            .field("record", &record)
            .field("readers", &self.reader_count())
            .field("map_refs", &self.referring_map_entries())
            .field("completed", &self.completed())
            .field("flushing", &self.flushing())
            .field("flushed", &self.flushed())
            .finish()
    }
}

/// Zero-copy view of (part of) an entry's pool-resident payload.
///
/// Holds a reader reference on the entry; the entry cannot retire while any
/// borrow is alive. Dropping the borrow releases the reference.
pub struct PayloadBorrow {
    _pool: Arc<LogPool>,
    entry: Arc<LogEntry>,
    ptr: *const u8,
    len: usize,
}

unsafe impl Send for PayloadBorrow {}
unsafe impl Sync for PayloadBorrow {}

impl PayloadBorrow {
    /// Borrow `len` bytes starting `offset` bytes into the entry's payload.
    pub(crate) fn new(
        pool: Arc<LogPool>,
        entry: Arc<LogEntry>,
        offset: u64,
        len: u64,
    ) -> Self {
        let record = entry.record();
        debug_assert!(record.has_data());
        debug_assert!(offset + len <= record.write_bytes);
        entry.add_reader();
        let ptr = pool.payload_ptr(record.payload_handle + offset, len);
        Self {
            _pool: pool,
            entry,
            ptr,
            len: len as usize,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for PayloadBorrow {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for PayloadBorrow {
    fn drop(&mut self) {
        self.entry.remove_reader();
    }
}

impl fmt::Debug for PayloadBorrow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadBorrow")
            .field("entry", &self.entry.index())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::FLAG_ENTRY_VALID;
    use tempfile::TempDir;

    #[test]
    fn lifecycle_flags() {
        let entry = LogEntry::new_write(0, 512);
        assert!(!entry.completed());
        assert!(!entry.flushed());
        entry.set_completed();
        entry.set_flushing(true);
        assert!(entry.flushing());
        entry.set_flushing(false);
        entry.set_flushed();
        assert!(entry.completed() && entry.flushed() && !entry.flushing());
    }

    #[test]
    fn reader_and_map_counts() {
        let entry = LogEntry::new_write(512, 512);
        entry.add_reader();
        entry.add_reader();
        entry.map_ref_added();
        assert_eq!(entry.reader_count(), 2);
        assert_eq!(entry.referring_map_entries(), 1);
        entry.remove_reader();
        entry.remove_reader();
        entry.map_ref_removed();
        assert_eq!(entry.reader_count(), 0);
        assert_eq!(entry.referring_map_entries(), 0);
    }

    #[test]
    fn recovered_sync_point_is_already_flushed() {
        let record = DescriptorRecord::for_sync_point(4, 9);
        let entry = LogEntry::from_recovered(17, record);
        assert!(entry.completed());
        assert!(entry.flushed());
        assert_eq!(entry.index(), 17);
    }

    #[test]
    fn borrow_guards_reader_count() {
        let dir = TempDir::new().expect("tempdir");
        let pool = Arc::new(
            LogPool::create(&dir.path().join("p.pool"), 8 * 1024 * 1024, 512).expect("pool"),
        );
        let reservation = pool.reserve(1024).expect("reserve").expect("space");
        let handle = reservation.handle();
        pool.write_payload(handle, &vec![7u8; 1024]);

        let entry = LogEntry::new_write(0, 1024);
        entry.update_record(|record| {
            record.payload_handle = handle;
            record.set_flag(FLAG_HAS_DATA, true);
            record.set_flag(FLAG_ENTRY_VALID, true);
        });

        {
            let borrow = PayloadBorrow::new(pool.clone(), entry.clone(), 512, 512);
            assert_eq!(entry.reader_count(), 1);
            assert_eq!(&borrow[..4], &[7, 7, 7, 7]);
            assert_eq!(borrow.len(), 512);
        }
        assert_eq!(entry.reader_count(), 0);
        pool.cancel(reservation);
    }
}
