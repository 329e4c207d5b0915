//! Directory codec
//!
//! On disk a directory is laid out low address to high as
//!
//! ```text
//! fileA_lfn_n .. fileA_lfn_1, fileA_sfn, fileB_lfn_n .. fileB_sfn, ...
//! ```
//!
//! so every lookup walks records in order, accumulating long-name
//! fragments until the short-name record that closes the set arrives; the
//! set is only trusted when the ordinals ran 1..=n and every fragment
//! carries the checksum of that short name.
//!
//! Traversal is uniform over the two directory shapes: a cluster chain, or
//! the fixed root region of a FAT16 volume (which can never be extended).

use crate::bpb::FatType;
use crate::entry::{LongDirEntry, ShortDirEntry};
use crate::fs::FileSystem;
use crate::{
    compare_names, long_name_split, sfn_checksum, Error, Result, DIRENT_SIZE, DIR_ENTRY_END,
    DIR_ENTRY_FREE, FAT16_ROOT_CLUSTER, LAST_LONG_ENTRY, MAX_LONG_FILENAME, SECTOR_SIZE,
};

use alloc::string::String;
use alloc::vec::Vec;

/// Directory stream state for `read_dir`: the directory's start cluster
/// plus the index of the next record to examine.
#[derive(Debug, Clone, Copy)]
pub struct Dir {
    pub(crate) cluster: u32,
    pub(crate) entry_index: u32,
}

impl Dir {
    pub(crate) fn new(cluster: u32) -> Self {
        Self {
            cluster,
            entry_index: 0,
        }
    }
}

/// One enumerated directory entry.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    /// Long name when the entry carries one, otherwise the 8.3 rendering.
    pub name: String,
    /// `NAME.EXT` rendering of the short name.
    pub short_name: String,
    pub attr: u8,
    pub first_cluster: u32,
    pub size: u32,
}

impl DirEntryInfo {
    pub fn is_dir(&self) -> bool {
        self.attr & crate::ATTR_DIRECTORY != 0
    }
}

/// Sector-by-sector traversal of one directory.
pub(crate) struct DirWalker {
    /// Current cluster; [`FAT16_ROOT_CLUSTER`] selects the fixed region.
    pub cluster: u32,
    sector_index: u32,
}

/// Reassembles a long name from its record run, rejecting orphans.
struct LfnAssembler {
    units: [u16; MAX_LONG_FILENAME],
    total: usize,
    next_ord: usize,
    checksum: u8,
    valid: bool,
}

impl LfnAssembler {
    fn new() -> Self {
        Self {
            units: [0xFFFF; MAX_LONG_FILENAME],
            total: 0,
            next_ord: 0,
            checksum: 0,
            valid: false,
        }
    }

    fn reset(&mut self) {
        self.valid = false;
        self.total = 0;
        self.next_ord = 0;
    }

    fn push(&mut self, lde: &LongDirEntry) {
        let ord = lde.order_index();
        if lde.is_set_start() {
            if ord == 0 || ord * crate::CHARS_PER_LFN > MAX_LONG_FILENAME {
                self.reset();
                return;
            }
            self.total = ord;
            self.next_ord = ord;
            self.checksum = lde.checksum();
            self.valid = true;
        } else if !self.valid || ord != self.next_ord || lde.checksum() != self.checksum {
            self.reset();
            return;
        }
        let base = (ord - 1) * crate::CHARS_PER_LFN;
        self.units[base..base + crate::CHARS_PER_LFN].copy_from_slice(&lde.fragment());
        self.next_ord = ord - 1;
    }

    /// Yield the reconstructed name if the run just closed cleanly over
    /// this short entry. Resets either way.
    fn take(&mut self, sde: &ShortDirEntry) -> Option<String> {
        let complete = self.valid && self.next_ord == 0 && self.checksum == sde.checksum();
        let name = if complete {
            let span = &self.units[..self.total * crate::CHARS_PER_LFN];
            let len = span
                .iter()
                .position(|&u| u == 0 || u == 0xFFFF)
                .unwrap_or(span.len());
            Some(String::from_utf16_lossy(&span[..len]))
        } else {
            None
        };
        self.reset();
        name
    }
}

impl FileSystem {
    fn is_fat16_root(&self, cluster: u32) -> bool {
        cluster == FAT16_ROOT_CLUSTER && self.bpb.fat_type() == FatType::Fat16
    }

    pub(crate) fn dir_walker(&self, dir_cluster: u32) -> DirWalker {
        DirWalker {
            cluster: dir_cluster,
            sector_index: 0,
        }
    }

    /// LBA of the next directory sector, or `Ok(None)` past the end. The
    /// walker is left in place at the end so a caller may extend the chain
    /// (the walker's `cluster` is then the chain tail) and retry.
    pub(crate) fn dir_next_sector(&mut self, walker: &mut DirWalker) -> Result<Option<u32>> {
        if self.is_fat16_root(walker.cluster) {
            if walker.sector_index >= self.bpb.root_dir_sectors {
                return Ok(None);
            }
            let lba = self.bpb.root_dir_first_sector + walker.sector_index;
            walker.sector_index += 1;
            return Ok(Some(lba));
        }

        let spc = self.bpb.sectors_per_cluster();
        if walker.sector_index == spc {
            let next = self.fat.next(walker.cluster)?;
            if next == crate::END_OF_CHAIN {
                return Ok(None);
            }
            walker.cluster = next;
            walker.sector_index = 0;
        }
        let lba = self.bpb.lba_of_cluster(walker.cluster) + walker.sector_index;
        walker.sector_index += 1;
        Ok(Some(lba))
    }

    /// Look `name` up in the directory starting at `dir_cluster`. Both the
    /// reconstructed long name and the 8.3 rendering are candidates, ASCII
    /// case folded.
    pub(crate) fn find_entry(
        &mut self,
        dir_cluster: u32,
        name: &str,
    ) -> Result<Option<ShortDirEntry>> {
        let mut walker = self.dir_walker(dir_cluster);
        let mut sector = [0u8; SECTOR_SIZE];
        let mut lfn = LfnAssembler::new();

        while let Some(lba) = self.dir_next_sector(&mut walker)? {
            self.read_sector(lba, &mut sector)?;
            for off in (0..SECTOR_SIZE).step_by(DIRENT_SIZE) {
                let sde = ShortDirEntry::from_bytes(&sector[off..off + DIRENT_SIZE]);
                if sde.is_end() {
                    return Ok(None);
                }
                if sde.is_deleted() {
                    lfn.reset();
                    continue;
                }
                if sde.is_lfn() {
                    lfn.push(&LongDirEntry::from_bytes(&sector[off..off + DIRENT_SIZE]));
                    continue;
                }
                if sde.is_volume_label() {
                    lfn.reset();
                    continue;
                }

                let long = lfn.take(&sde);
                if let Some(long) = long {
                    if compare_names(&long, name) {
                        return Ok(Some(sde));
                    }
                }
                if compare_names(&sde.display_name(), name) {
                    return Ok(Some(sde));
                }
            }
        }
        Ok(None)
    }

    /// Yield the next live entry of `dir`, advancing its cursor.
    pub(crate) fn read_dir_next(&mut self, dir: &mut Dir) -> Result<Option<DirEntryInfo>> {
        let mut walker = self.dir_walker(dir.cluster);
        let mut sector = [0u8; SECTOR_SIZE];
        let mut lfn = LfnAssembler::new();
        let mut index: u32 = 0;
        let records_per_sector = (SECTOR_SIZE / DIRENT_SIZE) as u32;

        while let Some(lba) = self.dir_next_sector(&mut walker)? {
            // Sectors fully behind the cursor only advance the count.
            if index + records_per_sector <= dir.entry_index {
                index += records_per_sector;
                continue;
            }
            self.read_sector(lba, &mut sector)?;
            for off in (0..SECTOR_SIZE).step_by(DIRENT_SIZE) {
                let record_index = index;
                index += 1;
                if record_index < dir.entry_index {
                    continue;
                }

                let sde = ShortDirEntry::from_bytes(&sector[off..off + DIRENT_SIZE]);
                if sde.is_end() {
                    return Ok(None);
                }
                if sde.is_deleted() {
                    lfn.reset();
                    continue;
                }
                if sde.is_lfn() {
                    lfn.push(&LongDirEntry::from_bytes(&sector[off..off + DIRENT_SIZE]));
                    continue;
                }
                if sde.is_volume_label() {
                    lfn.reset();
                    continue;
                }

                let short_name = sde.display_name();
                let name = lfn.take(&sde).unwrap_or_else(|| short_name.clone());
                dir.entry_index = record_index + 1;
                return Ok(Some(DirEntryInfo {
                    name,
                    short_name,
                    attr: sde.attr(),
                    first_cluster: sde.first_cluster(),
                    size: sde.file_size(),
                }));
            }
        }
        Ok(None)
    }

    /// Exact 11-byte short-name scan.
    pub(crate) fn sfn_exists(&mut self, dir_cluster: u32, short_name: &[u8; 11]) -> Result<bool> {
        let mut walker = self.dir_walker(dir_cluster);
        let mut sector = [0u8; SECTOR_SIZE];

        while let Some(lba) = self.dir_next_sector(&mut walker)? {
            self.read_sector(lba, &mut sector)?;
            for off in (0..SECTOR_SIZE).step_by(DIRENT_SIZE) {
                let sde = ShortDirEntry::from_bytes(&sector[off..off + DIRENT_SIZE]);
                if sde.is_end() {
                    return Ok(false);
                }
                if sde.is_deleted() || sde.is_lfn() || sde.is_volume_label() {
                    continue;
                }
                if sde.name_bytes() == *short_name {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Write the LFN run plus short entry for a new file or directory into
    /// the first run of free record slots, extending the directory by one
    /// zeroed cluster when no run fits. The run may straddle sectors and
    /// clusters.
    pub(crate) fn add_entry(
        &mut self,
        dir_cluster: u32,
        long_name: &str,
        short_name: &[u8; 11],
        first_cluster: u32,
        size: u32,
        is_dir: bool,
    ) -> Result<()> {
        let fragments = long_name_split(long_name);
        let checksum = sfn_checksum(short_name);

        // On-disk order: highest ordinal first, short entry last.
        let mut records: Vec<[u8; DIRENT_SIZE]> = Vec::with_capacity(fragments.len() + 1);
        for i in (0..fragments.len()).rev() {
            let mut ord = (i + 1) as u8;
            if i == fragments.len() - 1 {
                ord |= LAST_LONG_ENTRY;
            }
            records.push(LongDirEntry::new(ord, checksum, &fragments[i]).to_bytes_array());
        }
        records.push(ShortDirEntry::new(short_name, first_cluster, size, is_dir).to_bytes_array());

        let mut run: Vec<(u32, usize)> = Vec::with_capacity(records.len());
        let mut walker = self.dir_walker(dir_cluster);
        let mut sector = [0u8; SECTOR_SIZE];

        'scan: loop {
            let lba = match self.dir_next_sector(&mut walker)? {
                Some(lba) => lba,
                None => {
                    // The FAT16 root region has a fixed capacity.
                    if self.is_fat16_root(walker.cluster) {
                        return Err(Error::NoSpace);
                    }
                    let mut tail = walker.cluster;
                    self.fat.add_free_space(&mut tail)?;
                    self.zero_cluster(tail)?;
                    continue;
                }
            };
            self.read_sector(lba, &mut sector)?;
            for off in (0..SECTOR_SIZE).step_by(DIRENT_SIZE) {
                let first = sector[off];
                if first == DIR_ENTRY_END || first == DIR_ENTRY_FREE {
                    run.push((lba, off));
                    if run.len() == records.len() {
                        break 'scan;
                    }
                } else {
                    run.clear();
                }
            }
        }

        self.patch_dir_records(&run, &records)
    }

    /// Rewrite the first byte of the short entry for `short_name`, and of
    /// every immediately preceding LFN record carrying its checksum, to
    /// the deleted marker. The directory is not shrunk.
    pub(crate) fn mark_deleted(&mut self, dir_cluster: u32, short_name: &[u8; 11]) -> Result<()> {
        let checksum = sfn_checksum(short_name);
        let mut pending: Vec<(u32, usize)> = Vec::new();
        let mut walker = self.dir_walker(dir_cluster);
        let mut sector = [0u8; SECTOR_SIZE];

        while let Some(lba) = self.dir_next_sector(&mut walker)? {
            self.read_sector(lba, &mut sector)?;
            for off in (0..SECTOR_SIZE).step_by(DIRENT_SIZE) {
                let sde = ShortDirEntry::from_bytes(&sector[off..off + DIRENT_SIZE]);
                if sde.is_end() {
                    return Err(Error::NotFound);
                }
                if sde.is_deleted() {
                    pending.clear();
                    continue;
                }
                if sde.is_lfn() {
                    let lde = LongDirEntry::from_bytes(&sector[off..off + DIRENT_SIZE]);
                    if lde.checksum() == checksum {
                        pending.push((lba, off));
                    } else {
                        pending.clear();
                    }
                    continue;
                }
                if sde.name_bytes() == *short_name {
                    pending.push((lba, off));
                    return self.mark_records_deleted(&pending);
                }
                pending.clear();
            }
        }
        Err(Error::NotFound)
    }

    /// Locate the short entry for `short_name` and apply `patch` to it in
    /// place.
    pub(crate) fn modify_sde<F>(
        &mut self,
        dir_cluster: u32,
        short_name: &[u8; 11],
        patch: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut ShortDirEntry),
    {
        let mut patch = Some(patch);
        let mut walker = self.dir_walker(dir_cluster);
        let mut sector = [0u8; SECTOR_SIZE];

        while let Some(lba) = self.dir_next_sector(&mut walker)? {
            self.read_sector(lba, &mut sector)?;
            for off in (0..SECTOR_SIZE).step_by(DIRENT_SIZE) {
                let mut sde = ShortDirEntry::from_bytes(&sector[off..off + DIRENT_SIZE]);
                if sde.is_end() {
                    return Err(Error::NotFound);
                }
                if sde.is_deleted() || sde.is_lfn() || sde.is_volume_label() {
                    continue;
                }
                if sde.name_bytes() == *short_name {
                    if let Some(patch) = patch.take() {
                        patch(&mut sde);
                    }
                    sector[off..off + DIRENT_SIZE].copy_from_slice(sde.as_bytes());
                    return self.write_sector(lba, &sector);
                }
            }
        }
        Err(Error::NotFound)
    }

    fn mark_records_deleted(&mut self, slots: &[(u32, usize)]) -> Result<()> {
        let mut sector = [0u8; SECTOR_SIZE];
        let mut i = 0;
        while i < slots.len() {
            let lba = slots[i].0;
            self.read_sector(lba, &mut sector)?;
            let mut j = i;
            while j < slots.len() && slots[j].0 == lba {
                sector[slots[j].1] = DIR_ENTRY_FREE;
                j += 1;
            }
            self.write_sector(lba, &sector)?;
            i = j;
        }
        Ok(())
    }

    fn patch_dir_records(
        &mut self,
        slots: &[(u32, usize)],
        records: &[[u8; DIRENT_SIZE]],
    ) -> Result<()> {
        debug_assert_eq!(slots.len(), records.len());
        let mut sector = [0u8; SECTOR_SIZE];
        let mut i = 0;
        while i < slots.len() {
            let lba = slots[i].0;
            self.read_sector(lba, &mut sector)?;
            let mut j = i;
            while j < slots.len() && slots[j].0 == lba {
                let off = slots[j].1;
                sector[off..off + DIRENT_SIZE].copy_from_slice(&records[j]);
                j += 1;
            }
            self.write_sector(lba, &sector)?;
            i = j;
        }
        Ok(())
    }
}
