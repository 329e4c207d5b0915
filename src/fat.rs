//! File Allocation Table manager
//!
//! One entry per data cluster, 16 or 32 bits little-endian; a FAT32 entry
//! is really a 28-bit value whose high 4 bits must be preserved on write.
//! The manager owns the single write-back FAT sector buffer: `set` patches
//! the buffered sector in place and only touches the device when the
//! target entry lives in a different sector, or when [`FatTable::purge`]
//! flushes it (close, flush, shutdown).
//!
//! Only FAT #1 is maintained; a secondary copy is left for external repair
//! tooling to resynchronize.

use crate::bpb::{BiosParameterBlock, FatType};
use crate::device::BlockDevice;
use crate::{
    read_le_u16, read_le_u32, write_le_u16, write_le_u32, Error, Result, BAD_CLUSTER,
    END_OF_CHAIN, FREE_CLUSTER, INVALID_SECTOR, SECTOR_SIZE,
};

use alloc::sync::Arc;

pub struct FatTable {
    device: Arc<dyn BlockDevice>,
    fat_begin_lba: u32,
    fat_type: FatType,
    total_data_clusters: u32,
    buffer: [u8; SECTOR_SIZE],
    buffered_lba: u32,
    dirty: bool,
}

impl FatTable {
    pub(crate) fn new(device: Arc<dyn BlockDevice>, bpb: &BiosParameterBlock) -> Self {
        Self {
            device,
            fat_begin_lba: bpb.fat_begin_lba,
            fat_type: bpb.fat_type,
            total_data_clusters: bpb.total_data_clusters,
            buffer: [0; SECTOR_SIZE],
            buffered_lba: INVALID_SECTOR,
            dirty: false,
        }
    }

    fn entry_bytes(&self) -> u32 {
        match self.fat_type {
            FatType::Fat16 => 2,
            FatType::Fat32 => 4,
        }
    }

    /// FAT sector holding the entry for `cluster`, plus the byte offset of
    /// the entry within that sector.
    fn entry_pos(&self, cluster: u32) -> (u32, usize) {
        let offset = cluster * self.entry_bytes();
        (
            self.fat_begin_lba + offset / SECTOR_SIZE as u32,
            (offset % SECTOR_SIZE as u32) as usize,
        )
    }

    /// Largest valid cluster number plus one.
    fn cluster_limit(&self) -> u32 {
        self.total_data_clusters + 2
    }

    fn load(&mut self, lba: u32) -> Result<()> {
        if self.buffered_lba == lba {
            return Ok(());
        }
        self.purge()?;
        self.device.read_sector(lba, &mut self.buffer)?;
        self.buffered_lba = lba;
        Ok(())
    }

    /// Flush the buffered FAT sector if it carries unwritten updates.
    pub fn purge(&mut self) -> Result<()> {
        if self.dirty {
            log::trace!("fat: purging sector {}", self.buffered_lba);
            self.device.write_sector(self.buffered_lba, &self.buffer)?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Entry for `cluster`, with every reserved end-of-chain encoding
    /// folded onto [`END_OF_CHAIN`].
    pub fn next(&mut self, cluster: u32) -> Result<u32> {
        let (lba, offset) = self.entry_pos(cluster);
        self.load(lba)?;
        let value = match self.fat_type {
            FatType::Fat16 => {
                let raw = read_le_u16(&self.buffer[offset..]) as u32;
                if raw >= 0xFFF8 {
                    END_OF_CHAIN
                } else {
                    raw
                }
            }
            FatType::Fat32 => {
                let raw = read_le_u32(&self.buffer[offset..]) & 0x0FFF_FFFF;
                if raw >= 0x0FFF_FFF8 {
                    END_OF_CHAIN
                } else {
                    raw
                }
            }
        };
        Ok(value)
    }

    /// Point `cluster`'s entry at `value` through the write-back buffer.
    /// The sector is left dirty; nothing reaches the device until a purge
    /// or a buffer switch.
    pub fn set(&mut self, cluster: u32, value: u32) -> Result<()> {
        let (lba, offset) = self.entry_pos(cluster);
        self.load(lba)?;
        match self.fat_type {
            FatType::Fat16 => {
                let raw = if value == END_OF_CHAIN {
                    0xFFFF
                } else {
                    value as u16
                };
                write_le_u16(&mut self.buffer[offset..], raw);
            }
            FatType::Fat32 => {
                // Preserve the reserved high 4 bits.
                let old = read_le_u32(&self.buffer[offset..]) & 0xF000_0000;
                write_le_u32(&mut self.buffer[offset..], old | (value & 0x0FFF_FFFF));
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Walk `hops` links starting from `cluster`. Returns [`END_OF_CHAIN`]
    /// when the chain ends early.
    pub fn walk(&mut self, cluster: u32, hops: u32) -> Result<u32> {
        let mut current = cluster;
        for _ in 0..hops {
            if current == END_OF_CHAIN {
                return Ok(END_OF_CHAIN);
            }
            current = self.next(current)?;
        }
        Ok(current)
    }

    /// Linear scan for a free entry starting at `start_hint` (clamped to
    /// cluster 2), wrapping is not attempted.
    pub fn find_free(&mut self, start_hint: u32) -> Result<u32> {
        let start = core::cmp::max(start_hint, 2);
        for cluster in start..self.cluster_limit() {
            let (lba, offset) = self.entry_pos(cluster);
            self.load(lba)?;
            let raw = match self.fat_type {
                FatType::Fat16 => read_le_u16(&self.buffer[offset..]) as u32,
                FatType::Fat32 => read_le_u32(&self.buffer[offset..]) & 0x0FFF_FFFF,
            };
            if raw == FREE_CLUSTER && cluster != BAD_CLUSTER {
                return Ok(cluster);
            }
        }
        log::warn!("fat: no free clusters past {}", start);
        Err(Error::NoSpace)
    }

    /// Claim `count` free clusters and stitch them into one chain ending
    /// in [`END_OF_CHAIN`]. Clusters already claimed are released again
    /// when the scan comes up short.
    pub fn allocate_chain(&mut self, count: u32) -> Result<u32> {
        debug_assert!(count > 0);

        let first = self.find_free(2)?;
        self.set(first, END_OF_CHAIN)?;

        let mut tail = first;
        for _ in 1..count {
            match self.extend_chain(tail) {
                Ok(next) => tail = next,
                Err(e) => {
                    self.free_chain(first)?;
                    return Err(e);
                }
            }
        }
        Ok(first)
    }

    /// Allocate one cluster and splice it onto the chain whose tail is
    /// `last_cluster`. Returns the new tail.
    pub fn add_free_space(&mut self, last_cluster: &mut u32) -> Result<()> {
        let next = self.extend_chain(*last_cluster)?;
        *last_cluster = next;
        Ok(())
    }

    fn extend_chain(&mut self, tail: u32) -> Result<u32> {
        let fresh = self.find_free(2)?;
        self.set(fresh, END_OF_CHAIN)?;
        self.set(tail, fresh)?;
        Ok(fresh)
    }

    /// Walk the chain from `first`, freeing every entry. A one-cluster
    /// chain (entry already at end-of-chain) is legal input.
    pub fn free_chain(&mut self, first: u32) -> Result<()> {
        let mut current = first;
        // Bounded by the cluster count so a corrupt cyclic chain cannot
        // spin forever.
        for _ in 0..self.cluster_limit() {
            if current < 2 || current >= self.cluster_limit() {
                break;
            }
            let next = self.next(current)?;
            self.set(current, FREE_CLUSTER)?;
            if next == END_OF_CHAIN {
                break;
            }
            current = next;
        }
        Ok(())
    }
}
