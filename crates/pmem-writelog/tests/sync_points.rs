//! Persistence modes and sync point semantics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pmem_writelog::test_support::{done_channel, read_channel, wait_done, RamImage, StallingImage};
use pmem_writelog::{CacheConfig, ImageExtent, ImageStore, WriteLogCache, BLOCK_SIZE};
use tempfile::TempDir;

const B: u64 = BLOCK_SIZE;

fn config_for(dir: &TempDir) -> CacheConfig {
    CacheConfig {
        pool_dir: dir.path().to_path_buf(),
        pool_name: "img-sync".to_string(),
        ..CacheConfig::default()
    }
}

fn init_cache(config: CacheConfig, image: Arc<dyn ImageStore>) -> WriteLogCache {
    let cache = WriteLogCache::new(config, image).expect("cache");
    let (done, rx) = done_channel();
    cache.init(done);
    wait_done(&rx).expect("init");
    cache
}

#[test]
fn persist_on_flush_completes_user_before_flush() {
    let dir = TempDir::new().expect("tempdir");
    let config = CacheConfig {
        persist_on_flush: true,
        persist_on_write_until_flush: false,
        ..config_for(&dir)
    };
    let cache = init_cache(config, RamImage::new());

    let (done, rx) = done_channel();
    cache.aio_write(vec![ImageExtent::new(0, B)], vec![b'A'; B as usize], done);
    wait_done(&rx).expect("write completes at dispatch");

    // The flush creates a new sync point and completes once it persists.
    let (done, rx) = done_channel();
    cache.aio_flush(done);
    wait_done(&rx).expect("flush");
    assert!(cache.metrics().sync_points >= 2);

    let (done, rx) = read_channel();
    cache.aio_read(vec![ImageExtent::new(0, B)], done);
    assert_eq!(wait_done(&rx).expect("read"), vec![b'A'; B as usize]);

    let (done, rx) = done_channel();
    cache.shut_down(done);
    wait_done(&rx).expect("shutdown");
}

#[test]
fn first_flush_switches_to_persist_on_flush() {
    let dir = TempDir::new().expect("tempdir");
    // Defaults: persist-on-write until the first client flush.
    let cache = init_cache(config_for(&dir), RamImage::new());

    let (done, rx) = done_channel();
    cache.aio_write(vec![ImageExtent::new(0, B)], vec![1u8; B as usize], done);
    wait_done(&rx).expect("write");

    let flushes_before = cache.metrics().aio_flush_ops;
    let (done, rx) = done_channel();
    cache.aio_flush(done);
    wait_done(&rx).expect("flush");
    assert_eq!(cache.metrics().aio_flush_ops, flushes_before + 1);

    // Now in persist-on-flush mode; another write and flush still land.
    let (done, rx) = done_channel();
    cache.aio_write(vec![ImageExtent::new(B, B)], vec![2u8; B as usize], done);
    wait_done(&rx).expect("second write");
    let (done, rx) = done_channel();
    cache.aio_flush(done);
    wait_done(&rx).expect("second flush");

    let (done, rx) = read_channel();
    cache.aio_read(vec![ImageExtent::new(0, 2 * B)], done);
    let bytes = wait_done(&rx).expect("read");
    assert_eq!(&bytes[..B as usize], &vec![1u8; B as usize][..]);
    assert_eq!(&bytes[B as usize..], &vec![2u8; B as usize][..]);

    let (done, rx) = done_channel();
    cache.shut_down(done);
    wait_done(&rx).expect("shutdown");
}

#[test]
fn flush_without_new_writes_completes_without_a_new_sync_point() {
    let dir = TempDir::new().expect("tempdir");
    let config = CacheConfig {
        persist_on_flush: true,
        persist_on_write_until_flush: false,
        ..config_for(&dir)
    };
    let cache = init_cache(config, RamImage::new());

    let (done, rx) = done_channel();
    cache.aio_write(vec![ImageExtent::new(0, B)], vec![7u8; B as usize], done);
    wait_done(&rx).expect("write");

    let (done, rx) = done_channel();
    cache.aio_flush(done);
    wait_done(&rx).expect("first flush");
    let points_after_first = cache.metrics().sync_points;

    // No writes since the last sync point: no new sync point needed.
    let (done, rx) = done_channel();
    cache.aio_flush(done);
    wait_done(&rx).expect("second flush");
    assert_eq!(cache.metrics().sync_points, points_after_first);

    let (done, rx) = done_channel();
    cache.shut_down(done);
    wait_done(&rx).expect("shutdown");
}

#[test]
fn persist_on_write_flush_completes_immediately() {
    let dir = TempDir::new().expect("tempdir");
    let config = CacheConfig {
        persist_on_write_until_flush: false,
        persist_on_flush: false,
        ..config_for(&dir)
    };
    let cache = init_cache(config, RamImage::new());

    let (done, rx) = done_channel();
    cache.aio_write(vec![ImageExtent::new(0, B)], vec![9u8; B as usize], done);
    wait_done(&rx).expect("write");

    // Completed writes are already durable in this mode.
    let fired = Arc::new(AtomicBool::new(false));
    let observed = fired.clone();
    cache.aio_flush(Box::new(move |result| {
        result.expect("flush");
        observed.store(true, Ordering::SeqCst);
    }));
    assert!(fired.load(Ordering::SeqCst));

    let (done, rx) = done_channel();
    cache.shut_down(done);
    wait_done(&rx).expect("shutdown");
}

#[test]
fn persist_on_flush_data_survives_a_crash() {
    let dir = TempDir::new().expect("tempdir");
    let config = CacheConfig {
        persist_on_flush: true,
        persist_on_write_until_flush: false,
        ..config_for(&dir)
    };

    // Stalled writeback: nothing reaches the image before the "crash".
    let stalling = StallingImage::new();
    {
        let cache = init_cache(config.clone(), stalling.clone());
        let (done, rx) = done_channel();
        cache.aio_write(vec![ImageExtent::new(0, B)], vec![b'R'; B as usize], done);
        wait_done(&rx).expect("write");
        let (done, rx) = done_channel();
        cache.aio_flush(done);
        wait_done(&rx).expect("flush");
        // Dropped without shutdown: a crash with a durable log.
    }

    // A fresh image: the data can only come from the recovered log.
    let cache = init_cache(config, RamImage::new());
    let (done, rx) = read_channel();
    cache.aio_read(vec![ImageExtent::new(0, B)], done);
    assert_eq!(wait_done(&rx).expect("read"), vec![b'R'; B as usize]);

    let (done, rx) = done_channel();
    cache.shut_down(done);
    wait_done(&rx).expect("shutdown");
}
