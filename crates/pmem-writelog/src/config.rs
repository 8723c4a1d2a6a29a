use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{CacheError, CacheResult};
use crate::extent::BLOCK_SIZE;

/// Minimum payload reservation for any write, in bytes.
pub const MIN_WRITE_ALLOC_SIZE: u64 = 512;

/// Maximum descriptors published (and entries retired) per pool transaction.
pub const MAX_ALLOC_PER_TRANSACTION: usize = 8;

/// Payload buffers flushed together before one drain.
pub const OPS_FLUSHED_TOGETHER: usize = 4;

/// Default number of write-concurrency lanes.
pub const MAX_CONCURRENT_WRITES: u32 = 256;

/// Concurrent writeback cap, in operations.
pub const IN_FLIGHT_FLUSH_WRITE_LIMIT: u32 = 8;

/// Concurrent writeback cap, in bytes.
pub const IN_FLIGHT_FLUSH_BYTES_LIMIT: u64 = 1024 * 1024;

/// Default and minimum pool size. Pools below this cannot hold a useful ring.
pub const MIN_POOL_SIZE: u64 = 1 << 30;

pub const DEFAULT_POOL_SIZE: u64 = MIN_POOL_SIZE;

/// Fraction of the pool usable for log entries when sizing the ring.
pub const USABLE_SIZE_NUMERATOR: u64 = 7;
pub const USABLE_SIZE_DENOMINATOR: u64 = 10;

/// Estimated per-allocation overhead when sizing the ring.
pub const BLOCK_ALLOC_OVERHEAD_BYTES: u64 = 16;

/// Hard cap on ring length.
pub const MAX_LOG_ENTRIES: u32 = 1 << 20;

/// On-pmem layout version understood by this build.
pub const POOL_LAYOUT_VERSION: u8 = 1;

/// Configuration for a [`WriteLogCache`](crate::WriteLogCache).
///
/// Defaults mirror the production tuning: one 1 GiB pool, persist-on-write
/// until the first client flush, 256 lanes, small PMEM batches and a bounded
/// writeback window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding the pool file.
    pub pool_dir: PathBuf,
    /// Pool file stem; `<stem>.poolset` is preferred over `<stem>.pool`.
    pub pool_name: String,
    /// Pool size in bytes, clamped up to [`MIN_POOL_SIZE`].
    pub pool_size: u64,
    /// Reject writes, flushes and discards with `ReadOnly`.
    pub read_only: bool,
    /// Start in persist-on-write mode and switch to persist-on-flush when the
    /// first client flush arrives.
    pub persist_on_write_until_flush: bool,
    /// Start in persist-on-flush mode.
    pub persist_on_flush: bool,
    /// Write-concurrency lanes.
    pub max_concurrent_writes: u32,
    /// Payload buffers flushed per drain.
    pub flush_batch_ops: usize,
    /// Descriptors published per pool transaction.
    pub append_batch_ops: usize,
    /// Entries retired per pool transaction.
    pub retire_batch_ops: usize,
    /// Writeback in-flight operation cap.
    pub writeback_ops_limit: u32,
    /// Writeback in-flight byte cap.
    pub writeback_bytes_limit: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            pool_dir: PathBuf::from("."),
            pool_name: "writelog".to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            read_only: false,
            persist_on_write_until_flush: true,
            persist_on_flush: false,
            max_concurrent_writes: MAX_CONCURRENT_WRITES,
            flush_batch_ops: OPS_FLUSHED_TOGETHER,
            append_batch_ops: MAX_ALLOC_PER_TRANSACTION,
            retire_batch_ops: MAX_ALLOC_PER_TRANSACTION,
            writeback_ops_limit: IN_FLIGHT_FLUSH_WRITE_LIMIT,
            writeback_bytes_limit: IN_FLIGHT_FLUSH_BYTES_LIMIT,
        }
    }
}

impl CacheConfig {
    /// Validate and normalize the configuration.
    pub fn validated(mut self) -> CacheResult<Self> {
        if self.pool_name.is_empty() {
            return Err(CacheError::invalid_config("pool_name must not be empty"));
        }
        if self.max_concurrent_writes == 0 {
            return Err(CacheError::invalid_config(
                "max_concurrent_writes must be at least 1",
            ));
        }
        if self.append_batch_ops == 0 || self.flush_batch_ops == 0 || self.retire_batch_ops == 0 {
            return Err(CacheError::invalid_config("batch sizes must be at least 1"));
        }
        self.pool_size = self.pool_size.max(MIN_POOL_SIZE);
        Ok(self)
    }

    /// Pool file candidates, most-preferred first.
    pub fn pool_candidates(&self) -> [PathBuf; 2] {
        [
            self.pool_dir.join(format!("{}.poolset", self.pool_name)),
            self.pool_dir.join(format!("{}.pool", self.pool_name)),
        ]
    }

    /// Path used when creating a fresh pool.
    pub fn pool_create_path(&self) -> PathBuf {
        self.pool_dir.join(format!("{}.pool", self.pool_name))
    }
}

/// Ring length for a pool of `pool_size` bytes: the usable fraction divided
/// by the footprint of the smallest write, capped at [`MAX_LOG_ENTRIES`].
pub fn ring_entries_for_pool(pool_size: u64) -> u32 {
    let usable = pool_size / USABLE_SIZE_DENOMINATOR * USABLE_SIZE_NUMERATOR;
    let small_write = MIN_WRITE_ALLOC_SIZE
        + BLOCK_ALLOC_OVERHEAD_BYTES
        + crate::descriptor::DESCRIPTOR_SIZE as u64;
    let entries = usable / small_write;
    entries.min(MAX_LOG_ENTRIES as u64) as u32
}

/// Round a payload length up to the reservation granularity.
pub fn payload_alloc_size(write_bytes: u64) -> u64 {
    let len = write_bytes.max(MIN_WRITE_ALLOC_SIZE);
    len.div_ceil(MIN_WRITE_ALLOC_SIZE) * MIN_WRITE_ALLOC_SIZE
}

const _: () = {
    assert!(MIN_WRITE_ALLOC_SIZE >= 512);
    assert!(MIN_WRITE_ALLOC_SIZE % BLOCK_SIZE == 0);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = CacheConfig::default().validated().expect("default config");
        assert_eq!(cfg.pool_size, MIN_POOL_SIZE);
        assert_eq!(cfg.max_concurrent_writes, MAX_CONCURRENT_WRITES);
    }

    #[test]
    fn pool_size_clamped_to_minimum() {
        let cfg = CacheConfig {
            pool_size: 1 << 20,
            ..CacheConfig::default()
        };
        let cfg = cfg.validated().expect("config");
        assert_eq!(cfg.pool_size, MIN_POOL_SIZE);
    }

    #[test]
    fn rejects_zero_lanes() {
        let cfg = CacheConfig {
            max_concurrent_writes: 0,
            ..CacheConfig::default()
        };
        assert!(cfg.validated().is_err());
    }

    #[test]
    fn poolset_preferred_over_pool() {
        let cfg = CacheConfig {
            pool_name: "img7".to_string(),
            ..CacheConfig::default()
        };
        let [first, second] = cfg.pool_candidates();
        assert!(first.ends_with("img7.poolset"));
        assert!(second.ends_with("img7.pool"));
    }

    #[test]
    fn ring_sizing_is_capped() {
        let entries = ring_entries_for_pool(MIN_POOL_SIZE);
        assert!(entries > 0);
        assert!(entries <= MAX_LOG_ENTRIES);
        assert_eq!(ring_entries_for_pool(u64::MAX / 2), MAX_LOG_ENTRIES);
    }

    #[test]
    fn payload_allocation_rounds_up() {
        assert_eq!(payload_alloc_size(1), MIN_WRITE_ALLOC_SIZE);
        assert_eq!(payload_alloc_size(512), 512);
        assert_eq!(payload_alloc_size(513), 1024);
        assert_eq!(payload_alloc_size(4096), 4096);
    }
}
