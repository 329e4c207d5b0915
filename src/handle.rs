//! Fixed-capacity open-file arena
//!
//! A pool of [`MAX_OPEN_FILES`] slots threaded onto two index-linked
//! lists, `free` and `open`. Every slot is on exactly one list, and no two
//! open slots may carry the same `(path, name)` pair; enforcement of the
//! latter is split between [`HandleTable::is_open`] and the engine.

use crate::file::FileHandle;
use crate::{compare_names, MAX_OPEN_FILES};

use alloc::vec::Vec;

struct Slot {
    file: Option<FileHandle>,
    next: Option<usize>,
}

pub(crate) struct HandleTable {
    slots: Vec<Slot>,
    free_head: Option<usize>,
    open_head: Option<usize>,
}

impl HandleTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_OPEN_FILES);
        // Chain every slot onto the free list.
        for i in 0..MAX_OPEN_FILES {
            let next = if i + 1 < MAX_OPEN_FILES {
                Some(i + 1)
            } else {
                None
            };
            slots.push(Slot { file: None, next });
        }
        Self {
            slots,
            free_head: if MAX_OPEN_FILES > 0 { Some(0) } else { None },
            open_head: None,
        }
    }

    pub fn has_free(&self) -> bool {
        self.free_head.is_some()
    }

    /// Pop a slot off the free list and push it onto the open list.
    /// `None` when the pool is exhausted.
    pub fn allocate(&mut self, file: FileHandle) -> Option<usize> {
        let index = self.free_head?;
        self.free_head = self.slots[index].next;

        self.slots[index].file = Some(file);
        self.slots[index].next = self.open_head;
        self.open_head = Some(index);
        Some(index)
    }

    /// Unlink a slot from the open list and return it to the free list,
    /// yielding the handle it held.
    pub fn release(&mut self, index: usize) -> Option<FileHandle> {
        if index >= self.slots.len() || self.slots[index].file.is_none() {
            return None;
        }

        // O(N) unlink, N is the pool capacity.
        let mut cursor = self.open_head;
        let mut previous: Option<usize> = None;
        while let Some(i) = cursor {
            if i == index {
                match previous {
                    Some(p) => self.slots[p].next = self.slots[i].next,
                    None => self.open_head = self.slots[i].next,
                }
                break;
            }
            previous = cursor;
            cursor = self.slots[i].next;
        }

        let file = self.slots[index].file.take();
        self.slots[index].next = self.free_head;
        self.free_head = Some(index);
        file
    }

    pub fn get(&self, index: usize) -> Option<&FileHandle> {
        self.slots.get(index).and_then(|s| s.file.as_ref())
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut FileHandle> {
        self.slots.get_mut(index).and_then(|s| s.file.as_mut())
    }

    /// Whether some open handle already names this `(path, leaf)` pair.
    pub fn is_open(&self, path: &str, name: &str) -> bool {
        let mut cursor = self.open_head;
        while let Some(i) = cursor {
            if let Some(file) = self.slots[i].file.as_ref() {
                if compare_names(&file.path, path) && compare_names(&file.name, name) {
                    return true;
                }
            }
            cursor = self.slots[i].next;
        }
        false
    }
}
