//! Cache event counters.
//!
//! An injected sink with a fixed event set. The cache increments atomics on
//! the hot paths; observers take [`CacheMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct CacheMetrics {
    rd_req: AtomicU64,
    rd_bytes: AtomicU64,
    rd_hit_req: AtomicU64,
    rd_hit_bytes: AtomicU64,
    rd_part_hit_req: AtomicU64,
    wr_req: AtomicU64,
    wr_bytes: AtomicU64,
    wr_deferred: AtomicU64,
    wr_detained: AtomicU64,
    log_ops: AtomicU64,
    log_op_bytes: AtomicU64,
    aio_flush_ops: AtomicU64,
    internal_flush_ops: AtomicU64,
    discard_ops: AtomicU64,
    writesame_ops: AtomicU64,
    compare_write_ops: AtomicU64,
    invalidate_ops: AtomicU64,
    writeback_ops: AtomicU64,
    writeback_bytes: AtomicU64,
    writeback_failures: AtomicU64,
    retired_entries: AtomicU64,
    append_tx_failures: AtomicU64,
    sync_points: AtomicU64,
    wr_latency_ns: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    pub rd_req: u64,
    pub rd_bytes: u64,
    pub rd_hit_req: u64,
    pub rd_hit_bytes: u64,
    pub rd_part_hit_req: u64,
    pub wr_req: u64,
    pub wr_bytes: u64,
    pub wr_deferred: u64,
    pub wr_detained: u64,
    pub log_ops: u64,
    pub log_op_bytes: u64,
    pub aio_flush_ops: u64,
    pub internal_flush_ops: u64,
    pub discard_ops: u64,
    pub writesame_ops: u64,
    pub compare_write_ops: u64,
    pub invalidate_ops: u64,
    pub writeback_ops: u64,
    pub writeback_bytes: u64,
    pub writeback_failures: u64,
    pub retired_entries: u64,
    pub append_tx_failures: u64,
    pub sync_points: u64,
    /// Total arrival-to-persist latency over all writes, for averaging
    /// against `wr_req`.
    pub wr_latency_ns: u64,
}

macro_rules! incr {
    ($name:ident) => {
        #[inline]
        pub fn $name(&self) {
            self.$name.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl CacheMetrics {
    incr!(rd_req);
    incr!(rd_hit_req);
    incr!(rd_part_hit_req);
    incr!(wr_req);
    incr!(wr_deferred);
    incr!(wr_detained);
    incr!(aio_flush_ops);
    incr!(internal_flush_ops);
    incr!(discard_ops);
    incr!(writesame_ops);
    incr!(compare_write_ops);
    incr!(invalidate_ops);
    incr!(writeback_failures);
    incr!(append_tx_failures);
    incr!(sync_points);

    #[inline]
    pub fn add_rd_bytes(&self, bytes: u64) {
        self.rd_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_rd_hit_bytes(&self, bytes: u64) {
        self.rd_hit_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_wr_bytes(&self, bytes: u64) {
        self.wr_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn log_op(&self, bytes: u64) {
        self.log_ops.fetch_add(1, Ordering::Relaxed);
        self.log_op_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn writeback_op(&self, bytes: u64) {
        self.writeback_ops.fetch_add(1, Ordering::Relaxed);
        self.writeback_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_retired(&self, count: u64) {
        self.retired_entries.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_wr_latency_ns(&self, nanos: u64) {
        self.wr_latency_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            rd_req: self.rd_req.load(Ordering::Relaxed),
            rd_bytes: self.rd_bytes.load(Ordering::Relaxed),
            rd_hit_req: self.rd_hit_req.load(Ordering::Relaxed),
            rd_hit_bytes: self.rd_hit_bytes.load(Ordering::Relaxed),
            rd_part_hit_req: self.rd_part_hit_req.load(Ordering::Relaxed),
            wr_req: self.wr_req.load(Ordering::Relaxed),
            wr_bytes: self.wr_bytes.load(Ordering::Relaxed),
            wr_deferred: self.wr_deferred.load(Ordering::Relaxed),
            wr_detained: self.wr_detained.load(Ordering::Relaxed),
            log_ops: self.log_ops.load(Ordering::Relaxed),
            log_op_bytes: self.log_op_bytes.load(Ordering::Relaxed),
            aio_flush_ops: self.aio_flush_ops.load(Ordering::Relaxed),
            internal_flush_ops: self.internal_flush_ops.load(Ordering::Relaxed),
            discard_ops: self.discard_ops.load(Ordering::Relaxed),
            writesame_ops: self.writesame_ops.load(Ordering::Relaxed),
            compare_write_ops: self.compare_write_ops.load(Ordering::Relaxed),
            invalidate_ops: self.invalidate_ops.load(Ordering::Relaxed),
            writeback_ops: self.writeback_ops.load(Ordering::Relaxed),
            writeback_bytes: self.writeback_bytes.load(Ordering::Relaxed),
            writeback_failures: self.writeback_failures.load(Ordering::Relaxed),
            retired_entries: self.retired_entries.load(Ordering::Relaxed),
            append_tx_failures: self.append_tx_failures.load(Ordering::Relaxed),
            sync_points: self.sync_points.load(Ordering::Relaxed),
            wr_latency_ns: self.wr_latency_ns.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_land_in_snapshot() {
        let metrics = CacheMetrics::default();
        metrics.wr_req();
        metrics.add_wr_bytes(4096);
        metrics.log_op(512);
        metrics.log_op(1024);
        metrics.writeback_op(512);
        metrics.add_retired(3);
        let snap = metrics.snapshot();
        assert_eq!(snap.wr_req, 1);
        assert_eq!(snap.wr_bytes, 4096);
        assert_eq!(snap.log_ops, 2);
        assert_eq!(snap.log_op_bytes, 1536);
        assert_eq!(snap.writeback_ops, 1);
        assert_eq!(snap.writeback_bytes, 512);
        assert_eq!(snap.retired_entries, 3);
    }
}
