use kernel_block::{Disk, RamDisk, SECTOR_SIZE, SectorNumber};
use kernel_fs::{BufferCache, CACHE_ENTRIES, CacheStats};
use std::sync::{Arc, Barrier};
use std::thread;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn s(n: u32) -> SectorNumber {
    SectorNumber::new(n)
}

fn cache_over(sectors: u32) -> BufferCache<RamDisk> {
    BufferCache::new(Arc::new(Disk::new(RamDisk::new(sectors))))
}

#[test]
fn second_read_of_a_sector_is_a_hit() {
    init_logging();
    let cache = cache_over(128);
    let mut buf = [0u8; 16];

    cache.read(s(42), 0, &mut buf).unwrap();
    cache.read(s(42), 100, &mut buf).unwrap();

    assert_eq!(cache.disk().stats().reads, 1);
    assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
}

#[test]
fn sixty_fifth_sector_evicts_the_first_admitted() {
    init_logging();
    let cache = cache_over(256);
    assert_eq!(cache.capacity(), CACHE_ENTRIES);
    let mut byte = [0u8; 1];

    for n in 0..=64 {
        cache.read(s(n), 0, &mut byte).unwrap();
    }
    assert_eq!(cache.disk().stats().reads, 65);
    assert!(!cache.contains(s(0)));
    assert!((1..=64).all(|n| cache.contains(s(n))));

    // cold again
    cache.read(s(0), 0, &mut byte).unwrap();
    assert_eq!(cache.disk().stats().reads, 66);
}

#[test]
fn writes_stay_in_the_cache_until_flushed() {
    init_logging();
    let cache = cache_over(64);
    cache.write(s(3), 10, b"hello").unwrap();
    cache.write(s(4), 0, &[9; SECTOR_SIZE]).unwrap();

    let on_disk = cache.disk().with_device(|d| *d.sector(s(3)).unwrap());
    assert_eq!(&on_disk[10..15], &[0; 5]);

    assert_eq!(cache.flush_all().unwrap(), 2);
    let on_disk = cache.disk().with_device(|d| *d.sector(s(3)).unwrap());
    assert_eq!(&on_disk[10..15], b"hello");

    // nothing left to flush
    assert_eq!(cache.flush_all().unwrap(), 0);
}

#[test]
fn flush_all_reports_errors_but_flushes_the_rest() {
    let cache = cache_over(64);
    cache.write(s(1), 0, &[1]).unwrap();
    cache.write(s(2), 0, &[2]).unwrap();
    cache.disk().with_device(|d| d.fail_sector(s(1)));

    assert!(cache.flush_all().is_err());
    let second = cache.disk().with_device(|d| d.sector(s(2)).unwrap()[0]);
    assert_eq!(second, 2);

    // the failed entry is still dirty and goes out once the disk recovers
    cache.disk().with_device(|d| d.heal_sector(s(1)));
    assert_eq!(cache.flush_all().unwrap(), 1);
}

#[test]
fn lookup_pins_only_resident_sectors() {
    let cache = cache_over(16);
    assert!(cache.lookup(s(5)).is_none());
    cache.write(s(5), 0, &[0x5A]).unwrap();

    let pinned = cache.lookup(s(5)).expect("resident");
    assert_eq!(pinned.sector(), s(5));
    assert_eq!(pinned.data()[0], 0x5A);
    assert!(pinned.is_dirty());
}

#[test]
fn concurrent_writers_on_distinct_sectors() {
    init_logging();
    let cache = Arc::new(cache_over(512));
    let threads = 8u8;
    let start = Arc::new(Barrier::new(usize::from(threads)));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                // each thread owns 32 sectors; together they overflow the cache
                for round in 0..4u8 {
                    for i in 0..32 {
                        let sector = s(u32::from(t) * 32 + i);
                        cache.write(sector, 0, &[round, t]).unwrap();
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mut buf = [0u8; 2];
    for t in 0..threads {
        for i in 0..32 {
            cache.read(s(u32::from(t) * 32 + i), 0, &mut buf).unwrap();
            assert_eq!(buf, [3, t]);
        }
    }
}
