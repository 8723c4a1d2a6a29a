//! Contract of the layer below the write log.
//!
//! The lower image is the writeback target: another cache layer or the raw
//! image. Every operation completes through a continuation; nothing blocks
//! the caller thread.

use std::fmt;

use crate::entry::PayloadBorrow;
use crate::error::CacheResult;
use crate::extent::ImageExtent;

/// Continuation for operations that complete with a status.
pub type Completion = Box<dyn FnOnce(CacheResult<()>) + Send>;

/// Continuation for reads, delivering the concatenated bytes of every
/// requested extent.
pub type ReadCompletion = Box<dyn FnOnce(CacheResult<Vec<u8>>) + Send>;

/// Continuation for compare-and-write; on mismatch the offset of the first
/// differing byte is reported.
pub type CompareCompletion = Box<dyn FnOnce(CacheResult<()>, Option<u64>) + Send>;

/// Bytes handed to the lower image: either an owned buffer or a zero-copy
/// borrow of pool-resident payload.
pub enum WriteSource {
    Owned(Vec<u8>),
    Logged(PayloadBorrow),
}

impl AsRef<[u8]> for WriteSource {
    fn as_ref(&self) -> &[u8] {
        match self {
            WriteSource::Owned(bytes) => bytes,
            WriteSource::Logged(borrow) => borrow,
        }
    }
}

impl fmt::Debug for WriteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteSource::Owned(bytes) => f.debug_tuple("Owned").field(&bytes.len()).finish(),
            WriteSource::Logged(borrow) => f.debug_tuple("Logged").field(borrow).finish(),
        }
    }
}

/// The lower image's asynchronous API surface.
pub trait ImageStore: Send + Sync + 'static {
    fn aio_read(&self, extents: Vec<ImageExtent>, on_done: ReadCompletion);

    fn aio_write(&self, extents: Vec<ImageExtent>, data: WriteSource, on_done: Completion);

    fn aio_flush(&self, on_done: Completion);

    fn aio_discard(&self, offset: u64, length: u64, skip_partial: bool, on_done: Completion);

    fn aio_writesame(&self, offset: u64, length: u64, data: Vec<u8>, on_done: Completion);

    fn aio_compare_and_write(
        &self,
        extents: Vec<ImageExtent>,
        compare: Vec<u8>,
        data: Vec<u8>,
        on_done: CompareCompletion,
    );

    fn init(&self, on_done: Completion);

    fn shut_down(&self, on_done: Completion);

    fn invalidate(&self, on_done: Completion);
}
