//! Pool reopen and crash recovery.

use std::sync::Arc;

use pmem_writelog::test_support::{done_channel, read_channel, wait_done, RamImage, StallingImage};
use pmem_writelog::{
    CacheConfig, CacheError, ImageExtent, ImageStore, LogPool, WriteLogCache, BLOCK_SIZE,
};
use tempfile::TempDir;

const B: u64 = BLOCK_SIZE;

fn config_for(dir: &TempDir) -> CacheConfig {
    CacheConfig {
        pool_dir: dir.path().to_path_buf(),
        pool_name: "img-rec".to_string(),
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
fn reopen_preserves_ring_indices_and_descriptors() {
    let dir = TempDir::new().expect("tempdir");
    let config = config_for(&dir);

    // Stall writeback so the entries stay in the ring across the reopen.
    let stalling = StallingImage::new();
    {
        let cache = init_cache(config.clone(), stalling.clone());
        for block in 0..3u64 {
            let (done, rx) = done_channel();
            cache.aio_write(
                vec![ImageExtent::new(block * B, B)],
                vec![b'p'; B as usize],
                done,
            );
            wait_done(&rx).expect("write");
        }
        // Crash: no shutdown.
    }

    let pool = LogPool::open(&config.pool_create_path(), B as u32).expect("open");
    let root = pool.root();
    assert_eq!(root.first_valid_entry, 0);
    assert_eq!(root.first_free_entry, 3);
    for index in 0..3u32 {
        let record = pool.read_descriptor(index);
        assert!(record.entry_valid());
        assert!(record.has_data());
        assert_eq!(record.image_offset_bytes, index as u64 * B);
        assert_eq!(record.write_bytes, B);
        assert_eq!(record.write_sequence_number, index as u64 + 1);
    }
    drop(pool);

    // A recovered cache over a fresh image serves the data from the log.
    let cache = init_cache(config, RamImage::new());
    let (done, rx) = read_channel();
    cache.aio_read(vec![ImageExtent::new(0, 3 * B)], done);
    assert_eq!(wait_done(&rx).expect("read"), vec![b'p'; 3 * B as usize]);

    let (done, rx) = done_channel();
    cache.shut_down(done);
    wait_done(&rx).expect("shutdown");
}

#[test]
fn recovered_entries_write_back_to_the_new_image() {
    let dir = TempDir::new().expect("tempdir");
    let config = config_for(&dir);

    let stalling = StallingImage::new();
    {
        let cache = init_cache(config.clone(), stalling.clone());
        let (done, rx) = done_channel();
        cache.aio_write(vec![ImageExtent::new(0, B)], vec![b'z'; B as usize], done);
        wait_done(&rx).expect("write");
    }

    let image = RamImage::new();
    let cache = init_cache(config, image.clone());
    // A clean shutdown forces the recovered entry down to the image.
    let (done, rx) = done_channel();
    cache.shut_down(done);
    wait_done(&rx).expect("shutdown");
    assert_eq!(image.contents(0, B), vec![b'z'; B as usize]);
}

#[test]
fn sync_generation_resumes_past_the_recovered_log() {
    let dir = TempDir::new().expect("tempdir");
    let config = CacheConfig {
        persist_on_flush: true,
        persist_on_write_until_flush: false,
        ..config_for(&dir)
    };

    let stalling = StallingImage::new();
    {
        let cache = init_cache(config.clone(), stalling.clone());
        let (done, rx) = done_channel();
        cache.aio_write(vec![ImageExtent::new(0, B)], vec![1u8; B as usize], done);
        wait_done(&rx).expect("write");
        let (done, rx) = done_channel();
        cache.aio_flush(done);
        wait_done(&rx).expect("flush");
        let (done, rx) = done_channel();
        cache.aio_write(vec![ImageExtent::new(B, B)], vec![2u8; B as usize], done);
        wait_done(&rx).expect("write in the next generation");
        // Persist the second generation before the crash.
        let (done, rx) = done_channel();
        cache.aio_flush(done);
        wait_done(&rx).expect("second flush");
    }

    // Recover and write again; newer writes occlude recovered ones.
    let cache = init_cache(config, RamImage::new());
    let (done, rx) = done_channel();
    cache.aio_write(vec![ImageExtent::new(0, B)], vec![3u8; B as usize], done);
    wait_done(&rx).expect("write after recovery");

    let (done, rx) = read_channel();
    cache.aio_read(vec![ImageExtent::new(0, 2 * B)], done);
    let bytes = wait_done(&rx).expect("read");
    assert_eq!(&bytes[..B as usize], &vec![3u8; B as usize][..]);
    assert_eq!(&bytes[B as usize..], &vec![2u8; B as usize][..]);

    let (done, rx) = done_channel();
    cache.shut_down(done);
    wait_done(&rx).expect("shutdown");
}

#[test]
fn block_size_mismatch_fails_open() {
    let dir = TempDir::new().expect("tempdir");
    let config = config_for(&dir);
    {
        let cache = init_cache(config.clone(), RamImage::new());
        let (done, rx) = done_channel();
        cache.shut_down(done);
        wait_done(&rx).expect("shutdown");
    }
    let err = LogPool::open(&config.pool_create_path(), 4096).unwrap_err();
    assert!(matches!(err, CacheError::BlockSizeMismatch { found, .. } if found == B as u32));
}

#[test]
fn poolset_file_is_preferred_when_present() {
    let dir = TempDir::new().expect("tempdir");
    let config = config_for(&dir);

    // Seed a pool, then rename it to the poolset form.
    {
        let cache = init_cache(config.clone(), RamImage::new());
        let (done, rx) = done_channel();
        cache.shut_down(done);
        wait_done(&rx).expect("shutdown");
    }
    let [poolset, pool] = config.pool_candidates();
    std::fs::rename(&pool, &poolset).expect("rename to poolset");

    // Reinitializing must pick the poolset file up rather than creating a
    // fresh simple pool.
    let cache = init_cache(config.clone(), RamImage::new());
    drop(cache);
    assert!(poolset.exists());
    assert!(!pool.exists());
}
