//! End-to-end tests against in-memory FAT16 and FAT32 images.
//!
//! The sector store is sparse: unwritten sectors read back as zeroes,
//! which matches a freshly formatted medium and keeps the FAT32 image
//! (which needs 65,525+ clusters to classify as FAT32) cheap.

use fatfs_rs::{
    BlockDevice, DeviceError, DirEntryInfo, Error, Volume, Whence, MAX_OPEN_FILES, SECTOR_SIZE,
};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

struct RamDisk {
    sectors: Mutex<BTreeMap<u32, [u8; SECTOR_SIZE]>>,
    total_sectors: u32,
    writable: bool,
}

impl RamDisk {
    fn new(total_sectors: u32) -> Self {
        Self {
            sectors: Mutex::new(BTreeMap::new()),
            total_sectors,
            writable: true,
        }
    }

    fn read_only(total_sectors: u32) -> Self {
        Self {
            writable: false,
            ..Self::new(total_sectors)
        }
    }

    fn read_raw(&self, lba: u32) -> [u8; SECTOR_SIZE] {
        self.sectors
            .lock()
            .unwrap()
            .get(&lba)
            .copied()
            .unwrap_or([0u8; SECTOR_SIZE])
    }

    fn write_raw(&self, lba: u32, buf: &[u8]) {
        let mut sector = [0u8; SECTOR_SIZE];
        sector[..buf.len()].copy_from_slice(buf);
        self.sectors.lock().unwrap().insert(lba, sector);
    }

    fn snapshot(&self) -> BTreeMap<u32, [u8; SECTOR_SIZE]> {
        self.sectors.lock().unwrap().clone()
    }
}

impl BlockDevice for RamDisk {
    fn read_sector(&self, lba: u32, buf: &mut [u8]) -> Result<(), DeviceError> {
        if lba >= self.total_sectors {
            return Err(DeviceError::ReadError);
        }
        buf[..SECTOR_SIZE].copy_from_slice(&self.read_raw(lba));
        Ok(())
    }

    fn write_sector(&self, lba: u32, buf: &[u8]) -> Result<(), DeviceError> {
        if !self.writable || lba >= self.total_sectors {
            return Err(DeviceError::WriteError);
        }
        self.write_raw(lba, &buf[..SECTOR_SIZE]);
        Ok(())
    }

    fn supports_write(&self) -> bool {
        self.writable
    }
}

// FAT32 image geometry: 1 sector per cluster, 32 reserved, two FATs of
// 513 sectors, 65,600 data clusters.
const FAT32_RESERVED: u32 = 32;
const FAT32_FAT_SECTORS: u32 = 513;
const FAT32_TOTAL: u32 = FAT32_RESERVED + 2 * FAT32_FAT_SECTORS + 65_600;

fn mkfs_fat32(disk: &RamDisk) {
    let mut boot = [0u8; SECTOR_SIZE];
    boot[0] = 0xEB;
    boot[1] = 0x3C;
    boot[2] = 0x90;
    boot[11..13].copy_from_slice(&512u16.to_le_bytes());
    boot[13] = 1; // sectors per cluster
    boot[14..16].copy_from_slice(&(FAT32_RESERVED as u16).to_le_bytes());
    boot[16] = 2; // FAT copies
    boot[21] = 0xF8;
    boot[32..36].copy_from_slice(&FAT32_TOTAL.to_le_bytes());
    boot[36..40].copy_from_slice(&FAT32_FAT_SECTORS.to_le_bytes());
    boot[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
    boot[510] = 0x55;
    boot[511] = 0xAA;
    disk.write_raw(0, &boot);

    // FAT[0]: media byte, FAT[1]: EOC, FAT[2]: root directory chain.
    let mut fat = [0u8; SECTOR_SIZE];
    fat[0..4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
    fat[4..8].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
    fat[8..12].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
    disk.write_raw(FAT32_RESERVED, &fat);
}

fn fat32_disk() -> Arc<RamDisk> {
    let disk = Arc::new(RamDisk::new(FAT32_TOTAL));
    mkfs_fat32(&disk);
    disk
}

fn fat32_volume() -> (Arc<RamDisk>, Volume) {
    let disk = fat32_disk();
    let volume = Volume::attach(disk.clone() as Arc<dyn BlockDevice>).unwrap();
    (disk, volume)
}

/// Raw FAT32 entry, bypassing the engine.
fn fat32_entry(disk: &RamDisk, cluster: u32) -> u32 {
    let lba = FAT32_RESERVED + cluster * 4 / SECTOR_SIZE as u32;
    let sector = disk.read_raw(lba);
    let off = (cluster as usize * 4) % SECTOR_SIZE;
    u32::from_le_bytes(sector[off..off + 4].try_into().unwrap()) & 0x0FFF_FFFF
}

fn is_eoc(entry: u32) -> bool {
    entry >= 0x0FFF_FFF8
}

/// Chain length walked over the raw FAT; panics on runaway chains.
fn fat32_chain_len(disk: &RamDisk, start: u32) -> u32 {
    let mut len = 0;
    let mut cluster = start;
    loop {
        len += 1;
        assert!(len <= 1_000, "chain from {start} does not terminate");
        let entry = fat32_entry(disk, cluster);
        if is_eoc(entry) {
            return len;
        }
        assert!(entry >= 2, "chain from {start} hits free/bad entry");
        cluster = entry;
    }
}

fn entry_named(entries: &[DirEntryInfo], name: &str) -> DirEntryInfo {
    entries
        .iter()
        .find(|e| e.name.eq_ignore_ascii_case(name))
        .unwrap_or_else(|| panic!("{name} not listed"))
        .clone()
}

// FAT16 image geometry: 1 sector per cluster, 4 reserved, two FATs of 20
// sectors, 512 root entries (32 sectors), 5,000 data clusters.
const FAT16_RESERVED: u32 = 4;
const FAT16_FAT_SECTORS: u32 = 20;
const FAT16_ROOT_SECTORS: u32 = 32;
const FAT16_TOTAL: u32 = FAT16_RESERVED + 2 * FAT16_FAT_SECTORS + FAT16_ROOT_SECTORS + 5_000;

fn mkfs_fat16(disk: &RamDisk) {
    let mut boot = [0u8; SECTOR_SIZE];
    boot[0] = 0xEB;
    boot[1] = 0x3C;
    boot[2] = 0x90;
    boot[11..13].copy_from_slice(&512u16.to_le_bytes());
    boot[13] = 1;
    boot[14..16].copy_from_slice(&(FAT16_RESERVED as u16).to_le_bytes());
    boot[16] = 2;
    boot[17..19].copy_from_slice(&512u16.to_le_bytes()); // root entries
    boot[21] = 0xF8;
    boot[22..24].copy_from_slice(&(FAT16_FAT_SECTORS as u16).to_le_bytes());
    boot[32..36].copy_from_slice(&FAT16_TOTAL.to_le_bytes());
    boot[510] = 0x55;
    boot[511] = 0xAA;
    disk.write_raw(0, &boot);

    let mut fat = [0u8; SECTOR_SIZE];
    fat[0..2].copy_from_slice(&0xFFF8u16.to_le_bytes());
    fat[2..4].copy_from_slice(&0xFFFFu16.to_le_bytes());
    disk.write_raw(FAT16_RESERVED, &fat);
}

fn fat16_volume() -> (Arc<RamDisk>, Volume) {
    let disk = Arc::new(RamDisk::new(FAT16_TOTAL));
    mkfs_fat16(&disk);
    let volume = Volume::attach(disk.clone() as Arc<dyn BlockDevice>).unwrap();
    (disk, volume)
}

#[test]
fn create_write_read_back() {
    let (disk, mut volume) = fat32_volume();

    let fid = volume.open("/a.txt", "w").unwrap();
    assert_eq!(volume.write(fid, b"hello").unwrap(), 5);
    volume.close(fid).unwrap();

    let fid = volume.open("/a.txt", "r").unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(volume.read(fid, &mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
    assert!(volume.eof(fid).unwrap());
    assert_eq!(volume.read(fid, &mut buf).unwrap(), 0);
    volume.close(fid).unwrap();

    let info = entry_named(&volume.list_dir("/").unwrap(), "a.txt");
    assert_eq!(info.size, 5);
    assert!(!info.is_dir());
    // One chain of exactly one cluster.
    assert_eq!(fat32_chain_len(&disk, info.first_cluster), 1);
    assert!(is_eoc(fat32_entry(&disk, info.first_cluster)));
}

#[test]
fn append_mode_accumulates() {
    let (_disk, mut volume) = fat32_volume();

    let fid = volume.open("/log", "a").unwrap();
    assert_eq!(volume.write(fid, b"X").unwrap(), 1);
    volume.close(fid).unwrap();

    let fid = volume.open("/log", "a").unwrap();
    assert_eq!(volume.write(fid, b"Y").unwrap(), 1);
    assert_eq!(volume.tell(fid).unwrap(), 2);
    volume.close(fid).unwrap();

    let fid = volume.open("/log", "r").unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(volume.read(fid, &mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], b"XY");
    volume.close(fid).unwrap();
}

#[test]
fn multi_cluster_chain() {
    let (disk, mut volume) = fat32_volume();
    let cluster_bytes = SECTOR_SIZE; // 1 sector per cluster in this image
    let payload = vec![7u8; 3 * cluster_bytes + 17];

    let fid = volume.open("/big", "w").unwrap();
    assert_eq!(volume.write(fid, &payload).unwrap(), payload.len());
    volume.close(fid).unwrap();

    let info = entry_named(&volume.list_dir("/").unwrap(), "big");
    assert_eq!(info.size as usize, payload.len());
    assert_eq!(fat32_chain_len(&disk, info.first_cluster), 4);

    let fid = volume.open("/big", "r").unwrap();
    let mut back = vec![0u8; payload.len() + 32];
    assert_eq!(volume.read(fid, &mut back).unwrap(), payload.len());
    assert_eq!(&back[..payload.len()], &payload[..]);
    volume.close(fid).unwrap();
}

#[test]
fn subdirectory_create_write_remove() {
    let (disk, mut volume) = fat32_volume();

    volume.create_directory("/d").unwrap();
    assert!(volume.is_dir("/d").unwrap());
    // A directory is not openable as a file.
    assert_eq!(volume.open("/d", "r").unwrap_err(), Error::NotAFile);

    let dir_cluster = entry_named(&volume.list_dir("/").unwrap(), "d").first_cluster;
    assert_eq!(fat32_chain_len(&disk, dir_cluster), 1);

    let fid = volume.open("/d/f", "w").unwrap();
    volume.write(fid, b"hi").unwrap();
    volume.close(fid).unwrap();
    assert_eq!(entry_named(&volume.list_dir("/d").unwrap(), "f").size, 2);

    volume.remove("/d/f").unwrap();
    assert_eq!(volume.open("/d/f", "r").unwrap_err(), Error::NotFound);
    assert!(volume.list_dir("/d").unwrap().is_empty());

    // The directory itself is untouched.
    assert!(volume.is_dir("/d").unwrap());
    assert_eq!(fat32_chain_len(&disk, dir_cluster), 1);
}

#[test]
fn long_filenames_round_trip_with_valid_checksums() {
    let (disk, mut volume) = fat32_volume();

    let name = "name-with-long-filename.txt";
    let fid = volume.open(&format!("/{name}"), "w").unwrap();
    volume.close(fid).unwrap();

    let entries = volume.list_dir("/").unwrap();
    let info = entry_named(&entries, name);
    assert_eq!(info.short_name, "NAME-WIT.TXT");

    // Raw scan of the root directory: every LFN record must carry the
    // checksum of the short entry that closes its run.
    let root_lba = FAT32_RESERVED + 2 * FAT32_FAT_SECTORS; // cluster 2
    let sector = disk.read_raw(root_lba);
    let mut lfn_checksums: Vec<u8> = Vec::new();
    let mut verified = 0;
    for record in sector.chunks(32) {
        if record[0] == 0x00 {
            break;
        }
        if record[11] == 0x0F {
            lfn_checksums.push(record[13]);
            continue;
        }
        let mut sum: u8 = 0;
        for &b in &record[0..11] {
            sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b);
        }
        for c in lfn_checksums.drain(..) {
            assert_eq!(c, sum);
            verified += 1;
        }
    }
    assert!(verified >= 3, "expected an LFN run over several records");

    // Reopen by the long name, case folded.
    let fid = volume.open("/NAME-WITH-LONG-FILENAME.TXT", "r").unwrap();
    volume.close(fid).unwrap();
}

#[test]
fn short_name_tails_disambiguate() {
    let (_disk, mut volume) = fat32_volume();

    let a = volume.open("/duplicate-name-one.txt", "w").unwrap();
    volume.close(a).unwrap();
    let b = volume.open("/duplicate-name-two.txt", "w").unwrap();
    volume.close(b).unwrap();

    let entries = volume.list_dir("/").unwrap();
    let one = entry_named(&entries, "duplicate-name-one.txt");
    let two = entry_named(&entries, "duplicate-name-two.txt");
    assert_eq!(one.short_name, "DUPLICAT.TXT");
    assert_eq!(two.short_name, "DUPLIC~1.TXT");
}

#[test]
fn sparse_write_past_end_reads_zeroes() {
    let (_disk, mut volume) = fat32_volume();

    let fid = volume.open("/a", "w").unwrap();
    volume.seek(fid, 100, Whence::Set).unwrap();
    assert_eq!(volume.write(fid, b"Z").unwrap(), 1);
    volume.close(fid).unwrap();

    let fid = volume.open("/a", "r").unwrap();
    volume.seek(fid, 0, Whence::End).unwrap();
    assert_eq!(volume.tell(fid).unwrap(), 101);

    volume.seek(fid, 50, Whence::Set).unwrap();
    let mut byte = [0xFFu8; 1];
    assert_eq!(volume.read(fid, &mut byte).unwrap(), 1);
    assert_eq!(byte[0], 0);

    volume.seek(fid, 100, Whence::Set).unwrap();
    assert_eq!(volume.read(fid, &mut byte).unwrap(), 1);
    assert_eq!(byte[0], b'Z');
    volume.close(fid).unwrap();
}

#[test]
fn seek_rules() {
    let (_disk, mut volume) = fat32_volume();

    let fid = volume.open("/s.bin", "w+").unwrap();
    volume.write(fid, b"0123456789").unwrap();

    assert_eq!(
        volume.seek(fid, 1, Whence::End).unwrap_err(),
        Error::InvalidSeek
    );

    volume.seek(fid, 0, Whence::End).unwrap();
    assert_eq!(volume.tell(fid).unwrap(), 10);

    // Negative relative seeks clamp at the start of the file.
    volume.seek(fid, -4, Whence::Cur).unwrap();
    assert_eq!(volume.tell(fid).unwrap(), 6);
    volume.seek(fid, -100, Whence::Cur).unwrap();
    assert_eq!(volume.tell(fid).unwrap(), 0);

    let mut buf = [0u8; 4];
    assert_eq!(volume.read(fid, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"0123");
    volume.close(fid).unwrap();
}

#[test]
fn seek_flushes_pending_bytes() {
    let (_disk, mut volume) = fat32_volume();

    let fid = volume.open("/flushed", "w+").unwrap();
    volume.write(fid, b"data").unwrap();
    // Repositioning must not discard the buffered sector.
    volume.seek(fid, 0, Whence::Set).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(volume.read(fid, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"data");
    volume.close(fid).unwrap();
}

#[test]
fn reopen_for_update_preserves_length() {
    let (_disk, mut volume) = fat32_volume();

    let fid = volume.open("/keep.dat", "w").unwrap();
    volume.write(fid, b"keep me around").unwrap();
    volume.close(fid).unwrap();

    let fid = volume.open("/keep.dat", "r+").unwrap();
    volume.seek(fid, 0, Whence::End).unwrap();
    assert_eq!(volume.tell(fid).unwrap(), 14);
    volume.close(fid).unwrap();

    // "w" on an existing file does not truncate in this engine.
    let fid = volume.open("/keep.dat", "w").unwrap();
    volume.close(fid).unwrap();
    assert_eq!(entry_named(&volume.list_dir("/").unwrap(), "keep.dat").size, 14);
}

#[test]
fn handle_pool_and_uniqueness() {
    let (_disk, mut volume) = fat32_volume();

    let fid = volume.open("/solo.txt", "w").unwrap();
    assert_eq!(volume.open("/solo.txt", "r").unwrap_err(), Error::AlreadyOpen);
    assert_eq!(volume.remove("/solo.txt").unwrap_err(), Error::AlreadyOpen);
    volume.close(fid).unwrap();

    let mut open = Vec::new();
    for i in 0..MAX_OPEN_FILES {
        open.push(volume.open(&format!("/pool{i}.txt"), "w").unwrap());
    }
    assert_eq!(
        volume.open("/overflow.txt", "w").unwrap_err(),
        Error::NoSpace
    );
    for fid in open {
        volume.close(fid).unwrap();
    }
    assert!(volume.open("/overflow.txt", "w").is_ok());
}

#[test]
fn read_only_devices_reject_mutation() {
    let disk = Arc::new(RamDisk::read_only(FAT32_TOTAL));
    // Format through a writable twin sharing nothing; simplest is to
    // format a writable disk and copy the sectors over.
    let writable = fat32_disk();
    {
        let fid = Volume::attach(writable.clone() as Arc<dyn BlockDevice>)
            .and_then(|mut v| {
                let fid = v.open("/ro.txt", "w")?;
                v.write(fid, b"frozen")?;
                v.close(fid)?;
                v.shutdown()?;
                Ok(fid)
            })
            .unwrap();
        let _ = fid;
    }
    for (lba, sector) in writable.snapshot() {
        disk.sectors.lock().unwrap().insert(lba, sector);
    }

    let mut volume = Volume::attach(disk.clone() as Arc<dyn BlockDevice>).unwrap();

    // Write-ish modes degrade to plain opens on read-only media.
    assert_eq!(volume.open("/new.txt", "w").unwrap_err(), Error::NotFound);
    assert_eq!(volume.remove("/ro.txt").unwrap_err(), Error::ReadOnly);
    assert_eq!(volume.create_directory("/d").unwrap_err(), Error::ReadOnly);

    let fid = volume.open("/ro.txt", "r").unwrap();
    assert_eq!(volume.write(fid, b"x").unwrap_err(), Error::ReadOnly);
    let mut buf = [0u8; 8];
    assert_eq!(volume.read(fid, &mut buf).unwrap(), 6);
    assert_eq!(&buf[..6], b"frozen");
    volume.close(fid).unwrap();
}

#[test]
fn sector_aligned_read() {
    let (_disk, mut volume) = fat32_volume();

    let payload: Vec<u8> = (0..SECTOR_SIZE + 40).map(|i| i as u8).collect();
    let fid = volume.open("/aligned.bin", "w+").unwrap();
    volume.write(fid, &payload).unwrap();
    volume.seek(fid, 0, Whence::Set).unwrap();

    let mut sector = [0u8; SECTOR_SIZE];
    assert_eq!(volume.read_sector_aligned(fid, &mut sector).unwrap(), SECTOR_SIZE);
    assert_eq!(&sector[..], &payload[..SECTOR_SIZE]);

    // Second sector is short: only the tail of the file comes back.
    assert_eq!(volume.read_sector_aligned(fid, &mut sector).unwrap(), 40);
    assert_eq!(&sector[..40], &payload[SECTOR_SIZE..]);

    // Unaligned cursors are rejected.
    volume.seek(fid, 3, Whence::Set).unwrap();
    assert_eq!(
        volume.read_sector_aligned(fid, &mut sector).unwrap_err(),
        Error::InvalidSeek
    );
    volume.close(fid).unwrap();
}

#[test]
fn attach_without_writes_leaves_volume_bytes_identical() {
    let disk = fat32_disk();
    {
        let mut volume = Volume::attach(disk.clone() as Arc<dyn BlockDevice>).unwrap();
        let fid = volume.open("/seed.txt", "w").unwrap();
        volume.write(fid, b"seed").unwrap();
        volume.close(fid).unwrap();
        volume.shutdown().unwrap();
    }

    let before = disk.snapshot();
    {
        let mut volume = Volume::attach(disk.clone() as Arc<dyn BlockDevice>).unwrap();
        let fid = volume.open("/seed.txt", "r").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(volume.read(fid, &mut buf).unwrap(), 4);
        volume.close(fid).unwrap();
        volume.shutdown().unwrap();
    }
    assert_eq!(before, disk.snapshot());
}

#[test]
fn rejects_garbage_boot_sector() {
    let disk = Arc::new(RamDisk::new(64));
    disk.write_raw(0, &[0u8; SECTOR_SIZE]);
    match Volume::attach(disk as Arc<dyn BlockDevice>) {
        Err(e) => assert_eq!(e, Error::BadFormat),
        Ok(_) => panic!("garbage boot sector accepted"),
    }
}

#[test]
fn fat16_basic_roundtrip_in_fixed_root() {
    let (disk, mut volume) = fat16_volume();

    let fid = volume.open("/first.txt", "w").unwrap();
    volume.write(fid, b"fat16 payload").unwrap();
    volume.close(fid).unwrap();

    let entries = volume.list_dir("/").unwrap();
    let info = entry_named(&entries, "first.txt");
    assert_eq!(info.size, 13);

    // The entry landed in the fixed root region, not in a cluster.
    let root_first = FAT16_RESERVED + 2 * FAT16_FAT_SECTORS;
    let sector = disk.read_raw(root_first);
    assert_ne!(sector[0], 0, "root region should hold the first record");

    let fid = volume.open("/first.txt", "r").unwrap();
    let mut buf = [0u8; 32];
    assert_eq!(volume.read(fid, &mut buf).unwrap(), 13);
    assert_eq!(&buf[..13], b"fat16 payload");
    volume.close(fid).unwrap();
}

#[test]
fn fat16_subdirectories_use_cluster_chains() {
    let (_disk, mut volume) = fat16_volume();

    volume.create_directory("/nested").unwrap();
    assert!(volume.is_dir("/nested").unwrap());

    let fid = volume.open("/nested/deep.txt", "w").unwrap();
    volume.write(fid, b"below the fixed root").unwrap();
    volume.close(fid).unwrap();

    let info = entry_named(&volume.list_dir("/nested").unwrap(), "deep.txt");
    assert_eq!(info.size, 20);

    volume.remove("/nested/deep.txt").unwrap();
    assert!(volume.list_dir("/nested").unwrap().is_empty());
    assert!(volume.is_dir("/nested").unwrap());
}

#[test]
fn fat16_many_files_spill_across_root_sectors() {
    let (_disk, mut volume) = fat16_volume();

    // 40 files at 2 records each (LFN + SFN) spans several root sectors.
    for i in 0..40 {
        let fid = volume.open(&format!("/file{i:02}.txt"), "w").unwrap();
        volume.write(fid, b"x").unwrap();
        volume.close(fid).unwrap();
    }
    let entries = volume.list_dir("/").unwrap();
    assert_eq!(entries.len(), 40);
    for i in 0..40 {
        let _ = entry_named(&entries, &format!("file{i:02}.txt"));
    }
}

#[test]
fn directory_growth_allocates_new_cluster() {
    let (disk, mut volume) = fat32_volume();

    volume.create_directory("/crowded").unwrap();
    let dir_cluster = entry_named(&volume.list_dir("/").unwrap(), "crowded").first_cluster;
    assert_eq!(fat32_chain_len(&disk, dir_cluster), 1);

    // One cluster is one 512-byte sector here: 16 records. Each file
    // burns two (LFN + SFN), so a dozen files must overflow it.
    for i in 0..12 {
        let fid = volume.open(&format!("/crowded/f{i:02}.txt"), "w").unwrap();
        volume.close(fid).unwrap();
    }
    assert!(fat32_chain_len(&disk, dir_cluster) >= 2);
    assert_eq!(volume.list_dir("/crowded").unwrap().len(), 12);
}
