//! Persistent-memory-backed write-back log cache for block images.
//!
//! Writes are absorbed into a circular log living in a memory-mapped,
//! byte-addressable pool: the payload is copied into a reserved pool
//! region, persisted, and its 64-byte descriptor is published atomically
//! with the log head advance. Reads are served zero-copy from the log
//! where it holds the newest data. A background loop writes dirty entries
//! down to the image and retires clean ones, reclaiming ring slots and
//! payload space.
//!
//! ## Architecture
//!
//! - **Block-extent guard**: overlapping IOs are serialized per block
//!   range with FIFO deferral queues; disjoint IOs proceed concurrently.
//! - **Persistent log ring**: a fixed table of 64-byte descriptors with
//!   durable `first_valid`/`first_free` indices; one slot is always kept
//!   free so full and empty are distinguishable.
//! - **Write pipeline**: admit → detain → reserve → dispatch → copy →
//!   flush → append → complete → writeback → retire, with resources
//!   (lanes, slots, payload bytes) reserved all-or-nothing and a FIFO
//!   deferred queue under pressure.
//! - **Interval map**: block extents map to the log entries holding their
//!   newest bytes; newer writes occlude, shrink or split older intervals.
//! - **Sync points**: ordering fences between write generations; a sync
//!   point's descriptor is appended only once every write of its
//!   generation and its predecessor are durable.
//!
//! ## Persistence modes
//!
//! *Persist-on-write* completes the user callback only after the write's
//! descriptor is durable. *Persist-on-flush* completes at dispatch and
//! defers durability to the next sync point, which `aio_flush` forces.
//! By default the cache starts in persist-on-write and switches on the
//! first client flush.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pmem_writelog::{CacheConfig, RamImage, WriteLogCache};
//!
//! let config = CacheConfig {
//!     pool_dir: "/pmem".into(),
//!     pool_name: "image0".to_string(),
//!     ..CacheConfig::default()
//! };
//! let cache = WriteLogCache::new(config, RamImage::new()).unwrap();
//! cache.init(Box::new(|result| result.unwrap()));
//! ```

mod appender;
mod cache;
mod guard;
mod map;
mod ring;
mod sync;
mod worker;
mod write;
mod writeback;

pub mod config;
pub mod descriptor;
pub mod entry;
pub mod error;
pub mod extent;
pub mod image;
pub mod metrics;
pub mod pool;
pub mod test_support;

pub use cache::WriteLogCache;
pub use config::CacheConfig;
pub use entry::PayloadBorrow;
pub use error::{CacheError, CacheResult};
pub use extent::{BlockExtent, ImageExtent, BLOCK_SIZE};
pub use image::{CompareCompletion, Completion, ImageStore, ReadCompletion, WriteSource};
pub use metrics::{CacheMetrics, CacheMetricsSnapshot};
pub use pool::{LogPool, PoolRoot};
pub use test_support::RamImage;
