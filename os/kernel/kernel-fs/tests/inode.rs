use kernel_block::{BlockError, Disk, RamDisk, SECTOR_SIZE, SectorNumber};
use kernel_fs::{BufferCache, File, FreeMap, FsError, MAX_FILE_LENGTH, Volume};
use std::sync::Arc;

const SECTORS: u32 = 4096;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn volume() -> Arc<Volume<RamDisk>> {
    init_logging();
    Arc::new(Volume::new(Arc::new(Disk::new(RamDisk::new(SECTORS)))))
}

#[test]
fn create_open_write_read() {
    let vol = volume();
    let sector = vol.create_file(0).unwrap();
    let inode = vol.open(sector).unwrap();

    assert_eq!(inode.write_at(b"hello, disk", 0).unwrap(), 11);
    assert_eq!(inode.length().unwrap(), 11);

    let mut buf = [0u8; 32];
    assert_eq!(inode.read_at(&mut buf, 7).unwrap(), 4);
    assert_eq!(&buf[..4], b"disk");
    assert_eq!(inode.read_at(&mut buf, 11).unwrap(), 0);

    vol.close(&inode).unwrap();
}

#[test]
fn created_files_read_as_zeros() {
    let vol = volume();
    let sector = vol.create_file(3 * SECTOR_SIZE as u64 + 7).unwrap();
    let inode = vol.open(sector).unwrap();
    assert_eq!(inode.allocated_sectors(), 4);

    let mut buf = vec![0xFFu8; 4 * SECTOR_SIZE];
    assert_eq!(inode.read_at(&mut buf, 0).unwrap(), 3 * SECTOR_SIZE + 7);
    assert!(buf[..3 * SECTOR_SIZE + 7].iter().all(|&b| b == 0));
}

#[test]
fn writes_spanning_sector_boundaries() {
    let vol = volume();
    let inode = vol.open(vol.create_file(0).unwrap()).unwrap();

    let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(inode.write_at(&data, 100).unwrap(), data.len());
    assert_eq!(inode.length().unwrap(), 3100);

    let mut back = vec![0u8; data.len()];
    inode.read_at(&mut back, 100).unwrap();
    assert_eq!(back, data);

    // the gap before the first write reads as zeros
    let mut head = [0xFFu8; 100];
    inode.read_at(&mut head, 0).unwrap();
    assert_eq!(head, [0; 100]);
}

#[test]
fn write_at_the_first_indirect_offset_lands_in_the_indirect_tier() {
    let vol = volume();
    let inode = vol.open(vol.create_file(0).unwrap()).unwrap();
    let offset = 124 * SECTOR_SIZE as u64;

    inode.write_at(b"x", offset).unwrap();
    let record = inode.record().unwrap();
    let indirect = record.indirect.expect("indirect block allocated");
    assert_eq!(record.double_indirect, None);
    assert!(record.direct.iter().all(Option::is_some));

    // the data sector is the first pointer of the indirect block
    let sector = inode.sector_for(offset).unwrap();
    let mut pointer = [0u8; 4];
    vol.cache().read(indirect, 0, &mut pointer).unwrap();
    assert_eq!(u32::from_le_bytes(pointer), sector.as_u32());
}

#[test]
fn write_at_the_first_double_indirect_offset() {
    let vol = volume();
    let inode = vol.open(vol.create_file(0).unwrap()).unwrap();
    let offset = (124 + 128) * SECTOR_SIZE as u64;

    inode.write_at(b"y", offset).unwrap();
    let record = inode.record().unwrap();
    assert!(record.indirect.is_some());
    assert!(record.double_indirect.is_some());

    let mut buf = [0u8; 1];
    inode.read_at(&mut buf, offset).unwrap();
    assert_eq!(&buf, b"y");
}

#[test]
fn opening_twice_shares_the_inode() {
    let vol = volume();
    let sector = vol.create_file(10).unwrap();
    let a = vol.open(sector).unwrap();
    let b = vol.open(sector).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.open_count(), 2);
    assert_eq!(vol.open_inodes(), 1);

    vol.close(&a).unwrap();
    assert_eq!(vol.open_inodes(), 1);
    vol.close(&b).unwrap();
    assert_eq!(vol.open_inodes(), 0);
}

#[test]
fn removed_inode_is_released_on_last_close() {
    let vol = volume();
    let free_before = vol.free_map().free_count();

    let sector = vol.create_file(300 * SECTOR_SIZE as u64).unwrap();
    // 300 data sectors, 1 indirect, 1 double-indirect, 1 inner, 1 inode
    assert_eq!(free_before - vol.free_map().free_count(), 304);

    let first = vol.open(sector).unwrap();
    let second = vol.reopen(&first);
    first.remove();

    vol.close(&first).unwrap();
    assert!(vol.free_map().is_allocated(sector));

    vol.close(&second).unwrap();
    assert_eq!(vol.free_map().free_count(), free_before);
}

#[test]
fn denied_writes_return_zero() {
    let vol = volume();
    let inode = vol.open(vol.create_file(4).unwrap()).unwrap();
    inode.deny_write();
    assert_eq!(inode.write_at(b"nope", 0).unwrap(), 0);
    inode.allow_write();
    assert_eq!(inode.write_at(b"okay", 0).unwrap(), 4);
}

#[test]
fn opening_a_non_inode_sector_fails() {
    let vol = volume();
    let err = vol.open(SectorNumber::new(7)).err().unwrap();
    assert_eq!(
        err,
        FsError::BadMagic {
            sector: SectorNumber::new(7),
            magic: 0
        }
    );
}

#[test]
fn growth_beyond_the_volume_fails_cleanly() {
    let vol = Arc::new(Volume::new(Arc::new(Disk::new(RamDisk::new(64)))));
    let inode = vol.open(vol.create_file(0).unwrap()).unwrap();
    let free = vol.free_map().free_count();

    let big = vec![1u8; 100 * SECTOR_SIZE];
    assert_eq!(inode.write_at(&big, 0), Err(FsError::DiskFull));
    assert_eq!(inode.length().unwrap(), 0);
    assert_eq!(vol.free_map().free_count(), free);

    assert_eq!(
        vol.create_file(MAX_FILE_LENGTH + 1),
        Err(FsError::FileTooLarge {
            length: MAX_FILE_LENGTH + 1
        })
    );
}

#[test]
fn file_handles_close_on_drop() {
    let vol = volume();
    let sector = vol.create_file(0).unwrap();
    let file = File::open(&vol, sector).unwrap();
    let dup = file.reopen();
    assert_eq!(file.inode().open_count(), 2);

    dup.write_at(b"shared", 0).unwrap();
    drop(dup);
    assert_eq!(file.inode().open_count(), 1);
    assert_eq!(file.length().unwrap(), 6);

    drop(file);
    assert_eq!(vol.open_inodes(), 0);
}

#[test]
fn shutdown_makes_data_durable() {
    let vol = volume();
    let inode = vol.open(vol.create_file(0).unwrap()).unwrap();
    inode.write_at(b"persist me", 0).unwrap();
    let data_sector = inode.sector_for(0).unwrap();

    vol.shutdown().unwrap();
    let raw = vol
        .cache()
        .disk()
        .with_device(|d| *d.sector(data_sector).unwrap());
    assert_eq!(&raw[..10], b"persist me");
}

#[test]
fn failed_release_keeps_the_removed_inode_open() {
    init_logging();
    let disk = Arc::new(Disk::new(RamDisk::new(SECTORS)));
    let cache = BufferCache::with_capacity(Arc::clone(&disk), 2);
    let vol = Volume::with_cache(cache, FreeMap::new(SECTORS));
    let free_before = vol.free_map().free_count();

    let sector = vol.create_file(130 * SECTOR_SIZE as u64).unwrap();
    let inode = vol.open(sector).unwrap();
    let indirect = inode.record().unwrap().indirect.unwrap();
    inode.remove();

    // Push the index block out of the two-entry cache.
    let mut buf = [0; SECTOR_SIZE];
    vol.cache().read_sector(SectorNumber::new(SECTORS - 1), &mut buf).unwrap();
    vol.cache().read_sector(SectorNumber::new(SECTORS - 2), &mut buf).unwrap();
    assert!(!vol.cache().contains(indirect));

    disk.with_device(|d| d.fail_sector(indirect));
    assert_eq!(
        vol.close(&inode),
        Err(FsError::Block(BlockError::Io(indirect)))
    );
    assert_eq!(vol.open_inodes(), 1);
    assert_eq!(inode.open_count(), 1);
    assert!(vol.free_map().is_allocated(sector));
    assert!(vol.free_map().is_allocated(indirect));

    disk.with_device(|d| d.heal_sector(indirect));
    vol.close(&inode).unwrap();
    assert_eq!(vol.open_inodes(), 0);
    assert_eq!(vol.free_map().free_count(), free_before);
}
