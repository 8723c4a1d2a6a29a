//! Memory-mapped persistent pool.
//!
//! The pool file holds a 64-byte root, a contiguous table of 64-byte
//! descriptors and a payload heap. Payload reservations are volatile until
//! the descriptor that records them is published; the descriptor ring is the
//! allocation journal, so the payload allocator is rebuilt from live
//! descriptors when an existing pool is opened.
//!
//! Durability contract: `flush_*` starts an asynchronous writeback of the
//! range and `drain` completes every pending range synchronously. The two
//! commit operations publish a single aligned root word after their
//! dependencies are drained; a crash before the publish leaves the batch
//! unobservable, which is what makes them transactions.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapMut;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{payload_alloc_size, ring_entries_for_pool, POOL_LAYOUT_VERSION};
use crate::descriptor::{DescriptorRecord, DESCRIPTOR_SIZE};
use crate::error::{CacheError, CacheResult};

pub(crate) const ROOT_SIZE: u64 = 64;
pub(crate) const DESCRIPTOR_TABLE_OFFSET: u64 = ROOT_SIZE;

const ROOT_VERSION_OFFSET: usize = 0;
const ROOT_BLOCK_SIZE_OFFSET: usize = 4;
const ROOT_NUM_ENTRIES_OFFSET: usize = 8;
const ROOT_FIRST_FREE_OFFSET: usize = 12;
const ROOT_FIRST_VALID_OFFSET: usize = 16;

/// Decoded pool root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRoot {
    pub layout_version: u8,
    pub block_size: u32,
    pub num_log_entries: u32,
    pub first_free_entry: u32,
    pub first_valid_entry: u32,
}

/// A reserved-but-unpublished payload allocation.
///
/// Consumes no durable state; it becomes durable when the descriptor naming
/// its handle is published, and is returned to the allocator by
/// [`LogPool::cancel`] otherwise.
#[derive(Debug)]
#[must_use = "reservations must be published or cancelled"]
pub struct PayloadReservation {
    handle: u64,
    alloc_len: u64,
}

impl PayloadReservation {
    #[inline]
    pub fn handle(&self) -> u64 {
        self.handle
    }

    #[inline]
    pub fn alloc_len(&self) -> u64 {
        self.alloc_len
    }
}

#[derive(Debug)]
struct PayloadAllocator {
    // offset -> length of each free range, coalesced
    free: BTreeMap<u64, u64>,
    free_bytes: u64,
}

impl PayloadAllocator {
    fn new(base: u64, len: u64) -> Self {
        let mut free = BTreeMap::new();
        if len > 0 {
            free.insert(base, len);
        }
        Self {
            free,
            free_bytes: len,
        }
    }

    fn alloc(&mut self, len: u64) -> Option<u64> {
        let offset = self
            .free
            .iter()
            .find(|(_, range_len)| **range_len >= len)
            .map(|(offset, _)| *offset)?;
        let range_len = self.free.remove(&offset).expect("free range");
        if range_len > len {
            self.free.insert(offset + len, range_len - len);
        }
        self.free_bytes -= len;
        Some(offset)
    }

    fn free(&mut self, offset: u64, len: u64) {
        let mut start = offset;
        let mut length = len;
        if let Some((&prev_start, &prev_len)) = self.free.range(..offset).next_back() {
            debug_assert!(prev_start + prev_len <= offset);
            if prev_start + prev_len == offset {
                self.free.remove(&prev_start);
                start = prev_start;
                length += prev_len;
            }
        }
        if let Some((&next_start, &next_len)) = self.free.range(offset..).next() {
            debug_assert!(offset + len <= next_start);
            if offset + len == next_start {
                self.free.remove(&next_start);
                length += next_len;
            }
        }
        self.free.insert(start, length);
        self.free_bytes += len;
    }

    /// Carve an already-live allocation out of the free map (pool reopen).
    fn mark_allocated(&mut self, offset: u64, len: u64) -> bool {
        let Some((&range_start, &range_len)) = self.free.range(..=offset).next_back() else {
            return false;
        };
        if offset + len > range_start + range_len {
            return false;
        }
        self.free.remove(&range_start);
        if offset > range_start {
            self.free.insert(range_start, offset - range_start);
        }
        let tail = (range_start + range_len) - (offset + len);
        if tail > 0 {
            self.free.insert(offset + len, tail);
        }
        self.free_bytes -= len;
        true
    }
}

/// The memory-mapped pool and its payload allocator.
#[derive(Debug)]
pub struct LogPool {
    path: PathBuf,
    mmap: Mutex<MmapMut>,
    data: AtomicPtr<u8>,
    len: u64,
    ring_slots: u32,
    payload_base: u64,
    payload_len: u64,
    alloc: Mutex<PayloadAllocator>,
    pending_flush: Mutex<Vec<(u64, u64)>>,
}

unsafe impl Send for LogPool {}
unsafe impl Sync for LogPool {}

fn payload_base_for(ring_slots: u32) -> u64 {
    let table_end = DESCRIPTOR_TABLE_OFFSET + ring_slots as u64 * DESCRIPTOR_SIZE as u64;
    table_end.div_ceil(crate::config::MIN_WRITE_ALLOC_SIZE) * crate::config::MIN_WRITE_ALLOC_SIZE
}

impl LogPool {
    /// Create a fresh pool of `pool_size` bytes and persist its root.
    pub fn create(path: &Path, pool_size: u64, block_size: u32) -> CacheResult<Self> {
        let ring_slots = ring_entries_for_pool(pool_size);
        let payload_base = payload_base_for(ring_slots);
        if payload_base >= pool_size {
            return Err(CacheError::invalid_config(
                "pool too small for its descriptor table",
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(pool_size)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let data = mmap.as_mut_ptr();

        let pool = Self {
            path: path.to_path_buf(),
            mmap: Mutex::new(mmap),
            data: AtomicPtr::new(data),
            len: pool_size,
            ring_slots,
            payload_base,
            payload_len: pool_size - payload_base,
            alloc: Mutex::new(PayloadAllocator::new(payload_base, pool_size - payload_base)),
            pending_flush: Mutex::new(Vec::new()),
        };

        // Fresh mapping is zero; only the root needs stores.
        {
            let root = pool.slice_mut(0, ROOT_SIZE);
            root[ROOT_VERSION_OFFSET] = POOL_LAYOUT_VERSION;
            LittleEndian::write_u32(&mut root[ROOT_BLOCK_SIZE_OFFSET..], block_size);
            LittleEndian::write_u32(&mut root[ROOT_NUM_ENTRIES_OFFSET..], ring_slots);
            LittleEndian::write_u32(&mut root[ROOT_FIRST_FREE_OFFSET..], 0);
            LittleEndian::write_u32(&mut root[ROOT_FIRST_VALID_OFFSET..], 0);
        }
        pool.flush_root()?;
        debug!(
            path = %path.display(),
            pool_size,
            ring_slots,
            payload_bytes = pool.payload_len,
            "created log pool"
        );
        Ok(pool)
    }

    /// Open an existing pool, validating layout version and block size.
    pub fn open(path: &Path, expected_block_size: u32) -> CacheResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let pool_size = file.metadata()?.len();
        if pool_size < ROOT_SIZE {
            return Err(CacheError::corruption("pool file smaller than its root"));
        }
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let data = mmap.as_mut_ptr();

        let root_buf = &mmap[..ROOT_SIZE as usize];
        let layout_version = root_buf[ROOT_VERSION_OFFSET];
        if layout_version != POOL_LAYOUT_VERSION {
            return Err(CacheError::LayoutMismatch {
                expected: POOL_LAYOUT_VERSION,
                found: layout_version,
            });
        }
        let block_size = LittleEndian::read_u32(&root_buf[ROOT_BLOCK_SIZE_OFFSET..]);
        if block_size != expected_block_size {
            return Err(CacheError::BlockSizeMismatch {
                expected: expected_block_size,
                found: block_size,
            });
        }
        let ring_slots = LittleEndian::read_u32(&root_buf[ROOT_NUM_ENTRIES_OFFSET..]);
        let payload_base = payload_base_for(ring_slots);
        if ring_slots == 0 || payload_base >= pool_size {
            return Err(CacheError::corruption(format!(
                "descriptor table of {ring_slots} slots does not fit pool of {pool_size} bytes"
            )));
        }

        let pool = Self {
            path: path.to_path_buf(),
            mmap: Mutex::new(mmap),
            data: AtomicPtr::new(data),
            len: pool_size,
            ring_slots,
            payload_base,
            payload_len: pool_size - payload_base,
            alloc: Mutex::new(PayloadAllocator::new(payload_base, pool_size - payload_base)),
            pending_flush: Mutex::new(Vec::new()),
        };
        let root = pool.root();
        if root.first_free_entry >= ring_slots || root.first_valid_entry >= ring_slots {
            return Err(CacheError::corruption("ring indices out of range"));
        }
        debug!(path = %path.display(), ?root, "opened log pool");
        Ok(pool)
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn ring_slots(&self) -> u32 {
        self.ring_slots
    }

    #[inline]
    pub fn payload_capacity(&self) -> u64 {
        self.payload_len
    }

    pub fn free_payload_bytes(&self) -> u64 {
        self.alloc.lock().free_bytes
    }

    pub fn root(&self) -> PoolRoot {
        let root = self.slice(0, ROOT_SIZE);
        PoolRoot {
            layout_version: root[ROOT_VERSION_OFFSET],
            block_size: LittleEndian::read_u32(&root[ROOT_BLOCK_SIZE_OFFSET..]),
            num_log_entries: LittleEndian::read_u32(&root[ROOT_NUM_ENTRIES_OFFSET..]),
            first_free_entry: LittleEndian::read_u32(&root[ROOT_FIRST_FREE_OFFSET..]),
            first_valid_entry: LittleEndian::read_u32(&root[ROOT_FIRST_VALID_OFFSET..]),
        }
    }

    fn slice(&self, offset: u64, len: u64) -> &[u8] {
        assert!(offset + len <= self.len);
        unsafe {
            std::slice::from_raw_parts(
                self.data.load(Ordering::Acquire).add(offset as usize),
                len as usize,
            )
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn slice_mut(&self, offset: u64, len: u64) -> &mut [u8] {
        assert!(offset + len <= self.len);
        unsafe {
            std::slice::from_raw_parts_mut(
                self.data.load(Ordering::Acquire).add(offset as usize),
                len as usize,
            )
        }
    }

    /// Reserve payload space. `Ok(None)` means the heap is exhausted and the
    /// caller should defer; an error means the reservation can never succeed.
    pub fn reserve(&self, write_bytes: u64) -> CacheResult<Option<PayloadReservation>> {
        let alloc_len = payload_alloc_size(write_bytes);
        if alloc_len > self.payload_len {
            return Err(CacheError::PayloadTooLarge {
                requested: alloc_len,
                capacity: self.payload_len,
            });
        }
        let mut alloc = self.alloc.lock();
        match alloc.alloc(alloc_len) {
            Some(handle) => Ok(Some(PayloadReservation { handle, alloc_len })),
            None => Ok(None),
        }
    }

    /// Return an unpublished reservation to the allocator.
    pub fn cancel(&self, reservation: PayloadReservation) {
        self.alloc
            .lock()
            .free(reservation.handle, reservation.alloc_len);
    }

    /// Re-register a live allocation found in a descriptor (pool reopen).
    pub fn seed_allocation(&self, handle: u64, write_bytes: u64) -> CacheResult<()> {
        let alloc_len = payload_alloc_size(write_bytes);
        if handle < self.payload_base || handle + alloc_len > self.len {
            return Err(CacheError::corruption(format!(
                "payload handle {handle} out of bounds"
            )));
        }
        if !self.alloc.lock().mark_allocated(handle, alloc_len) {
            return Err(CacheError::corruption(format!(
                "payload handle {handle} overlaps another allocation"
            )));
        }
        Ok(())
    }

    pub fn write_payload(&self, handle: u64, data: &[u8]) {
        let dst = self.slice_mut(handle, data.len() as u64);
        dst.copy_from_slice(data);
    }

    /// Raw pointer into the payload heap, for zero-copy read borrows. The
    /// caller must hold a reader reference on the owning entry.
    pub(crate) fn payload_ptr(&self, handle: u64, len: u64) -> *const u8 {
        assert!(handle + len <= self.len);
        unsafe { self.data.load(Ordering::Acquire).add(handle as usize) }
    }

    fn push_pending(&self, offset: u64, len: u64) {
        self.pending_flush.lock().push((offset, len));
    }

    /// Start persisting a payload range.
    pub fn flush_payload(&self, handle: u64, len: u64) -> CacheResult<()> {
        let mmap = self.mmap.lock();
        mmap.flush_async_range(handle as usize, len as usize)?;
        drop(mmap);
        self.push_pending(handle, len);
        Ok(())
    }

    /// Start persisting `count` descriptor slots beginning at `first_index`.
    /// The range must not wrap the ring; callers split batches at the wrap.
    pub fn flush_descriptors(&self, first_index: u32, count: u32) -> CacheResult<()> {
        debug_assert!(first_index + count <= self.ring_slots);
        let offset = self.descriptor_offset(first_index);
        let len = count as u64 * DESCRIPTOR_SIZE as u64;
        let mmap = self.mmap.lock();
        mmap.flush_async_range(offset as usize, len as usize)?;
        drop(mmap);
        self.push_pending(offset, len);
        Ok(())
    }

    /// Complete every pending flush; afterwards all preceding stores to the
    /// flushed ranges are durable.
    pub fn drain(&self) -> CacheResult<()> {
        let pending = std::mem::take(&mut *self.pending_flush.lock());
        if pending.is_empty() {
            return Ok(());
        }
        let mmap = self.mmap.lock();
        for (offset, len) in pending {
            mmap.flush_range(offset as usize, len as usize)?;
        }
        Ok(())
    }

    fn descriptor_offset(&self, index: u32) -> u64 {
        assert!(index < self.ring_slots);
        DESCRIPTOR_TABLE_OFFSET + index as u64 * DESCRIPTOR_SIZE as u64
    }

    pub fn write_descriptor(&self, index: u32, record: &DescriptorRecord) {
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        record.encode(&mut buf);
        let dst = self.slice_mut(self.descriptor_offset(index), DESCRIPTOR_SIZE as u64);
        dst.copy_from_slice(&buf);
    }

    pub fn read_descriptor(&self, index: u32) -> DescriptorRecord {
        let src = self.slice(self.descriptor_offset(index), DESCRIPTOR_SIZE as u64);
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        buf.copy_from_slice(src);
        DescriptorRecord::decode(&buf)
    }

    fn store_root_u32(&self, offset: usize, value: u32) {
        let dst = self.slice_mut(offset as u64, 4);
        // Aligned four-byte store; readers after a crash see either value.
        unsafe {
            ptr::write_volatile(dst.as_mut_ptr() as *mut u32, value.to_le());
        }
    }

    fn flush_root(&self) -> CacheResult<()> {
        let mmap = self.mmap.lock();
        mmap.flush_range(0, ROOT_SIZE as usize)?;
        Ok(())
    }

    /// Transaction: advance the ring head and publish the batch's payload
    /// reservations. Every descriptor and payload of the batch must already
    /// be drained. On error the head is unchanged and the reservations are
    /// cancelled, leaving the batch unobservable.
    pub fn commit_append(
        &self,
        new_first_free: u32,
        reservations: Vec<PayloadReservation>,
    ) -> CacheResult<()> {
        debug_assert!(new_first_free < self.ring_slots);
        let previous = self.root().first_free_entry;
        self.store_root_u32(ROOT_FIRST_FREE_OFFSET, new_first_free);
        if let Err(err) = self.flush_root() {
            warn!(path = %self.path.display(), error = %err, "append publish failed");
            self.store_root_u32(ROOT_FIRST_FREE_OFFSET, previous);
            for reservation in reservations {
                self.cancel(reservation);
            }
            return Err(CacheError::TransactionAborted(err.to_string()));
        }
        // Published: the descriptors now own their payload allocations.
        for reservation in reservations {
            std::mem::forget(reservation);
        }
        Ok(())
    }

    /// Transaction: advance the ring tail and free the retired payloads.
    pub fn commit_retire(&self, new_first_valid: u32, frees: &[(u64, u64)]) -> CacheResult<()> {
        debug_assert!(new_first_valid < self.ring_slots);
        let previous = self.root().first_valid_entry;
        self.store_root_u32(ROOT_FIRST_VALID_OFFSET, new_first_valid);
        if let Err(err) = self.flush_root() {
            warn!(path = %self.path.display(), error = %err, "retire publish failed");
            self.store_root_u32(ROOT_FIRST_VALID_OFFSET, previous);
            return Err(CacheError::TransactionAborted(err.to_string()));
        }
        let mut alloc = self.alloc.lock();
        for (handle, write_bytes) in frees {
            alloc.free(*handle, payload_alloc_size(*write_bytes));
        }
        Ok(())
    }

    /// Flush the whole mapping; used on shutdown.
    pub fn close(&self) -> CacheResult<()> {
        self.drain()?;
        let mmap = self.mmap.lock();
        mmap.flush()?;
        Ok(())
    }
}
