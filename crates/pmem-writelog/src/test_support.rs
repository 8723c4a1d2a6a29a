//! Shared helpers for unit and integration tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::CacheResult;
use crate::extent::ImageExtent;
use crate::image::{CompareCompletion, Completion, ImageStore, ReadCompletion, WriteSource};

/// In-memory lower image. Reads of never-written ranges return zeros.
#[derive(Default)]
pub struct RamImage {
    data: Mutex<Vec<u8>>,
    pub writes: AtomicU64,
    pub reads: AtomicU64,
    pub flushes: AtomicU64,
    pub discards: AtomicU64,
    pub invalidates: AtomicU64,
}

impl RamImage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn ensure_len(data: &mut Vec<u8>, end: usize) {
        if data.len() < end {
            data.resize(end, 0);
        }
    }

    /// Bytes currently stored at `offset`, zero-filled past the end.
    pub fn contents(&self, offset: u64, length: u64) -> Vec<u8> {
        let data = self.data.lock();
        let mut out = vec![0u8; length as usize];
        let start = offset as usize;
        if start < data.len() {
            let end = data.len().min(start + length as usize);
            out[..end - start].copy_from_slice(&data[start..end]);
        }
        out
    }
}

impl ImageStore for RamImage {
    fn aio_read(&self, extents: Vec<ImageExtent>, on_done: ReadCompletion) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut out = Vec::new();
        for extent in extents {
            out.extend_from_slice(&self.contents(extent.offset, extent.length));
        }
        on_done(Ok(out));
    }

    fn aio_write(&self, extents: Vec<ImageExtent>, data: WriteSource, on_done: Completion) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let bytes = data.as_ref();
        let mut stored = self.data.lock();
        let mut offset = 0usize;
        for extent in extents {
            let end = (extent.offset + extent.length) as usize;
            Self::ensure_len(&mut stored, end);
            stored[extent.offset as usize..end]
                .copy_from_slice(&bytes[offset..offset + extent.length as usize]);
            offset += extent.length as usize;
        }
        drop(stored);
        on_done(Ok(()));
    }

    fn aio_flush(&self, on_done: Completion) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        on_done(Ok(()));
    }

    fn aio_discard(&self, offset: u64, length: u64, _skip_partial: bool, on_done: Completion) {
        self.discards.fetch_add(1, Ordering::SeqCst);
        let mut stored = self.data.lock();
        let start = (offset as usize).min(stored.len());
        let end = ((offset + length) as usize).min(stored.len());
        stored[start..end].fill(0);
        drop(stored);
        on_done(Ok(()));
    }

    fn aio_writesame(&self, offset: u64, length: u64, data: Vec<u8>, on_done: Completion) {
        let mut pattern = Vec::with_capacity(length as usize);
        while (pattern.len() as u64) < length {
            pattern.extend_from_slice(&data);
        }
        pattern.truncate(length as usize);
        self.aio_write(
            vec![ImageExtent::new(offset, length)],
            WriteSource::Owned(pattern),
            on_done,
        );
    }

    fn aio_compare_and_write(
        &self,
        extents: Vec<ImageExtent>,
        compare: Vec<u8>,
        data: Vec<u8>,
        on_done: CompareCompletion,
    ) {
        let mut current = Vec::new();
        for extent in &extents {
            current.extend_from_slice(&self.contents(extent.offset, extent.length));
        }
        if let Some(mismatch) = current.iter().zip(&compare).position(|(a, b)| a != b) {
            on_done(Ok(()), Some(mismatch as u64));
            return;
        }
        self.aio_write(
            extents,
            WriteSource::Owned(data),
            Box::new(move |result| on_done(result, None)),
        );
    }

    fn init(&self, on_done: Completion) {
        on_done(Ok(()));
    }

    fn shut_down(&self, on_done: Completion) {
        on_done(Ok(()));
    }

    fn invalidate(&self, on_done: Completion) {
        self.invalidates.fetch_add(1, Ordering::SeqCst);
        on_done(Ok(()));
    }
}

/// A lower image whose writes never complete. Keeps log entries dirty so
/// crash-recovery tests can observe them.
#[derive(Default)]
pub struct StallingImage {
    stalled: Mutex<Vec<(Vec<ImageExtent>, WriteSource, Completion)>>,
}

impl StallingImage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stalled_writes(&self) -> usize {
        self.stalled.lock().len()
    }
}

impl ImageStore for StallingImage {
    fn aio_read(&self, extents: Vec<ImageExtent>, on_done: ReadCompletion) {
        let total: u64 = extents.iter().map(|extent| extent.length).sum();
        on_done(Ok(vec![0u8; total as usize]));
    }

    fn aio_write(&self, extents: Vec<ImageExtent>, data: WriteSource, on_done: Completion) {
        self.stalled.lock().push((extents, data, on_done));
    }

    fn aio_flush(&self, on_done: Completion) {
        on_done(Ok(()));
    }

    fn aio_discard(&self, _offset: u64, _length: u64, _skip_partial: bool, on_done: Completion) {
        on_done(Ok(()));
    }

    fn aio_writesame(&self, _offset: u64, _length: u64, _data: Vec<u8>, on_done: Completion) {
        on_done(Ok(()));
    }

    fn aio_compare_and_write(
        &self,
        _extents: Vec<ImageExtent>,
        _compare: Vec<u8>,
        _data: Vec<u8>,
        on_done: CompareCompletion,
    ) {
        on_done(Ok(()), None);
    }

    fn init(&self, on_done: Completion) {
        on_done(Ok(()));
    }

    fn shut_down(&self, on_done: Completion) {
        on_done(Ok(()));
    }

    fn invalidate(&self, on_done: Completion) {
        on_done(Ok(()));
    }
}

/// A completion wired to a channel, for synchronous test waits.
pub fn done_channel() -> (Completion, Receiver<CacheResult<()>>) {
    let (tx, rx) = channel();
    (
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
        rx,
    )
}

/// A read completion wired to a channel.
pub fn read_channel() -> (ReadCompletion, Receiver<CacheResult<Vec<u8>>>) {
    let (tx, rx) = channel();
    (
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
        rx,
    )
}

/// Wait for a completion with a generous timeout.
pub fn wait_done<T>(rx: &Receiver<CacheResult<T>>) -> CacheResult<T> {
    rx.recv_timeout(Duration::from_secs(30))
        .expect("completion within timeout")
}
