//! The power-of-two free-list allocator.
//!
//! Twenty-eight size classes (2^4 through 2^31 bytes) are each backed by an
//! on-disk doubly-linked chain of 2048-byte free-list blocks; the tail of
//! the chain is the only block ever appended to, and a block that falls
//! behind the tail is never mutated again except through its `next`
//! pointer at the moment it stops being the tail.
//!
//! Everything past the free lists is served from a bump area at the end of
//! the file, grown in [`PREALLOC_SIZE`](crate::config::PREALLOC_SIZE)
//! chunks, as many at a time as a single request needs.

use std::rc::Rc;

use crate::codec::{read_u64, write_u64};
use crate::config::*;
use crate::device::ByteDevice;
use crate::error::{Error, Result};

/// Smallest extent ever handed out: an 8-byte size header plus 8 bytes of
/// payload.
const MIN_REALSIZE: u64 = 16;

/// Largest realsize the 28 size classes can represent (2^31, the top of
/// the class range in spec.md §3).
const MAX_REALSIZE: u64 = 1 << 31;

fn realsize_of(size: u64) -> Result<u64> {
    let realsize = std::cmp::max(MIN_REALSIZE, (size + 8).next_power_of_two());
    if realsize > MAX_REALSIZE {
        return Err(Error::InvalidArgument(format!(
            "allocation of {} bytes needs a size class beyond the 2 GiB ceiling",
            size
        )));
    }
    Ok(realsize)
}

/// Size-class index for an already-power-of-two `realsize`.
pub fn size_class_for_realsize(realsize: u64) -> usize {
    (63 - realsize.leading_zeros() - MIN_SIZE_CLASS_EXP) as usize
}

fn class_of(size: u64) -> Result<(u64, usize)> {
    let realsize = realsize_of(size)?;
    Ok((realsize, size_class_for_realsize(realsize)))
}

/// Payload size of a free-list block: 3 `u64` header fields plus 252 item
/// slots, chosen so the whole extent (header + payload) is exactly
/// [`FREELIST_BLOCK_SIZE`] bytes.
const FREELIST_BLOCK_PAYLOAD: u64 = FREELIST_BLOCK_SIZE - 8;

const FL_PREV_OFF: u64 = 0;
const FL_NEXT_OFF: u64 = 8;
const FL_NUMITEMS_OFF: u64 = 16;
const FL_ITEMS_OFF: u64 = 24;

fn fl_item_off(index: usize) -> u64 {
    FL_ITEMS_OFF + (index as u64) * 8
}

fn head_block_offset(class: usize) -> u64 {
    HDR_FREELIST_POS + (class as u64) * FREELIST_BLOCK_SIZE
}

/// Append `value` to `vec`, growing its capacity fallibly first so an
/// in-memory allocation failure surfaces as [`Error::OutOfMemory`] instead
/// of aborting the process.
fn try_push(vec: &mut Vec<u64>, value: u64) -> Result<()> {
    vec.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
    vec.push(value);
    Ok(())
}

/// In-memory bookkeeping for one size class's on-disk chain.
struct Chain {
    /// Payload offsets of every block in the chain, head first.
    blocks: Vec<u64>,
    /// Number of live entries in the tail block, mirroring its on-disk
    /// `numitems` field.
    last_items: usize,
}

pub struct Allocator {
    device: Rc<dyn ByteDevice>,
    free: u64,
    freeoff: u64,
    chains: Vec<Chain>,
    write_barrier: bool,
}

impl Allocator {
    /// Build the in-memory allocator state from an already-laid-out file:
    /// read `free`/`freeoff` from the header and walk each class's on-disk
    /// chain starting at its fixed head block.
    pub fn open(device: Rc<dyn ByteDevice>) -> Result<Allocator> {
        let free = read_u64(&*device, HDR_FREE_POS)?;
        let freeoff = read_u64(&*device, HDR_FREEOFF_POS)?;

        let mut chains = Vec::with_capacity(FREELIST_COUNT);
        for class in 0..FREELIST_COUNT {
            let head = head_block_offset(class);
            let mut blocks = vec![head];
            let mut cur = head;
            loop {
                let next = read_u64(&*device, cur + FL_NEXT_OFF)?;
                if next == 0 {
                    break;
                }
                try_push(&mut blocks, next)?;
                cur = next;
            }
            let last_items = read_u64(&*device, cur + FL_NUMITEMS_OFF)? as usize;
            chains.push(Chain { blocks, last_items });
        }

        Ok(Allocator {
            device,
            free,
            freeoff,
            chains,
            write_barrier: true,
        })
    }

    pub fn set_write_barrier(&mut self, enabled: bool) {
        self.write_barrier = enabled;
    }

    fn barrier(&self) -> Result<()> {
        if self.write_barrier {
            self.device.sync()?;
        }
        Ok(())
    }

    fn persist_free_header(&self) -> Result<()> {
        write_u64(&*self.device, HDR_FREE_POS, self.free)?;
        write_u64(&*self.device, HDR_FREEOFF_POS, self.freeoff)?;
        Ok(())
    }

    /// Returns the original `size` argument passed to `allocate` for the
    /// extent whose payload begins at `offset`.
    pub fn size_of(&self, offset: u64) -> Result<u64> {
        read_u64(&*self.device, offset - 8)
    }

    /// Allocate a writable extent of at least `size` bytes. Returns the
    /// file offset of the caller-visible payload (8 bytes past the
    /// extent's own size header).
    pub fn allocate(&mut self, size: u64) -> Result<u64> {
        let (realsize, class) = class_of(size)?;

        if let Some(payload_off) = self.pop(class, size)? {
            return Ok(payload_off);
        }

        self.bump_allocate(size, realsize)
    }

    fn bump_allocate(&mut self, size: u64, realsize: u64) -> Result<u64> {
        // A single PREALLOC_SIZE chunk only covers requests up to that size;
        // a value blob (or node) bigger than the grow granularity needs the
        // tail grown by as many chunks as it takes to cover `realsize`, or
        // `self.free -= realsize` below would underflow.
        while self.free < realsize {
            let cur_len = self.device.len()?;
            self.device.resize(cur_len + PREALLOC_SIZE)?;
            self.free += PREALLOC_SIZE;
        }
        let header_off = self.freeoff;
        self.freeoff += realsize;
        self.free -= realsize;
        self.persist_free_header()?;
        write_u64(&*self.device, header_off, size)?;
        self.barrier()?;
        Ok(header_off + 8)
    }

    /// Pop protocol for `class`. Returns `Ok(None)` if the class's free
    /// list has nothing to offer and the caller should fall back to
    /// bump allocation.
    fn pop(&mut self, class: usize, requested_size: u64) -> Result<Option<u64>> {
        loop {
            let tail = *self.chains[class].blocks.last().unwrap();
            let last_items = self.chains[class].last_items;

            if last_items == 0 {
                if self.chains[class].blocks.len() > 1 {
                    // Drop the empty tail, unlinking it from its predecessor.
                    let removed = self.chains[class].blocks.pop().unwrap();
                    let prev = *self.chains[class].blocks.last().unwrap();
                    write_u64(&*self.device, prev + FL_NEXT_OFF, 0)?;
                    self.barrier()?;
                    self.chains[class].last_items = FREELIST_BLOCK_ITEMS;

                    if class == freelist_block_class() {
                        // The removed block is itself exactly the size
                        // this request needs: short-circuit and hand it
                        // back directly instead of looping through free().
                        if requested_size != FREELIST_BLOCK_PAYLOAD {
                            write_u64(&*self.device, removed - 8, requested_size)?;
                            self.barrier()?;
                        }
                        return Ok(Some(removed));
                    }
                    self.free(removed)?;
                    continue;
                }
                // Head block is empty and there is nothing before it.
                return Ok(None);
            }

            let entry_off = fl_item_off(last_items - 1);
            let entry = read_u64(&*self.device, tail + entry_off)?;
            self.chains[class].last_items -= 1;
            write_u64(&*self.device, tail + FL_NUMITEMS_OFF, (last_items - 1) as u64)?;
            self.barrier()?;

            let existing_size = read_u64(&*self.device, entry)?;
            if existing_size != requested_size {
                write_u64(&*self.device, entry, requested_size)?;
                self.barrier()?;
            }
            return Ok(Some(entry + 8));
        }
    }

    /// Release an extent previously returned by `allocate`. `offset` is the
    /// caller's payload pointer; the size header sits 8 bytes earlier.
    pub fn free(&mut self, offset: u64) -> Result<()> {
        let header_off = offset - 8;
        let user_size = read_u64(&*self.device, header_off)?;
        let (_, class) = class_of(user_size)?;

        let tail = *self.chains[class].blocks.last().unwrap();
        let tail_full = self.chains[class].last_items == FREELIST_BLOCK_ITEMS;

        if tail_full && class == freelist_block_class() {
            // Re-entrancy special case: the extent being freed is exactly
            // sized to serve as the next free-list block. Adopt it
            // directly instead of asking the allocator (which would pop
            // from the very list we are trying to grow).
            write_u64(&*self.device, offset + FL_PREV_OFF, tail)?;
            write_u64(&*self.device, offset + FL_NEXT_OFF, 0)?;
            write_u64(&*self.device, offset + FL_NUMITEMS_OFF, 0)?;
            self.barrier()?;
            write_u64(&*self.device, tail + FL_NEXT_OFF, offset)?;
            self.barrier()?;
            try_push(&mut self.chains[class].blocks, offset)?;
            self.chains[class].last_items = 0;
            return Ok(());
        }

        let target_tail = if tail_full {
            let new_block = self.allocate(FREELIST_BLOCK_PAYLOAD)?;
            write_u64(&*self.device, new_block + FL_PREV_OFF, tail)?;
            write_u64(&*self.device, new_block + FL_NEXT_OFF, 0)?;
            write_u64(&*self.device, new_block + FL_NUMITEMS_OFF, 0)?;
            self.barrier()?;
            write_u64(&*self.device, tail + FL_NEXT_OFF, new_block)?;
            self.barrier()?;
            try_push(&mut self.chains[class].blocks, new_block)?;
            self.chains[class].last_items = 0;
            new_block
        } else {
            tail
        };

        let items = self.chains[class].last_items;
        write_u64(&*self.device, target_tail + fl_item_off(items), header_off)?;
        self.barrier()?;
        self.chains[class].last_items += 1;
        write_u64(
            &*self.device,
            target_tail + FL_NUMITEMS_OFF,
            self.chains[class].last_items as u64,
        )?;
        self.barrier()?;
        Ok(())
    }
}

pub fn freelist_block_class() -> usize {
    size_class_for_realsize(FREELIST_BLOCK_SIZE)
}

/// Zero every free-list head block in a freshly laid out file.
pub fn init_empty_heads(device: &dyn ByteDevice) -> Result<()> {
    let zeros = [0u8; FREELIST_BLOCK_SIZE as usize];
    for class in 0..FREELIST_COUNT {
        device.pwrite(&zeros, head_block_offset(class))?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::OsFileDevice;
    use tempfile::tempdir;

    fn fresh_allocator() -> (tempfile::TempDir, Allocator) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let device: Rc<dyn ByteDevice> = Rc::new(OsFileDevice::create_or_open(&path).unwrap());
        device.resize(HDR_SIZE).unwrap();
        init_empty_heads(&*device).unwrap();
        write_u64(&*device, HDR_FREE_POS, 0).unwrap();
        write_u64(&*device, HDR_FREEOFF_POS, HDR_SIZE).unwrap();
        let alloc = Allocator::open(device).unwrap();
        (dir, alloc)
    }

    #[test]
    fn realsize_matches_power_of_two_floor() {
        assert_eq!(realsize_of(0).unwrap(), 16);
        assert_eq!(realsize_of(8).unwrap(), 16);
        assert_eq!(realsize_of(9).unwrap(), 32);
        assert_eq!(realsize_of(100).unwrap(), 128);
    }

    #[test]
    fn allocate_rejects_oversize_request() {
        assert!(matches!(
            realsize_of(1u64 << 31),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn size_of_round_trips_through_allocate() {
        let (_dir, mut alloc) = fresh_allocator();
        for n in [0u64, 1, 15, 100, 4096, 1 << 20] {
            let off = alloc.allocate(n).unwrap();
            assert_eq!(alloc.size_of(off).unwrap(), n);
        }
    }

    #[test]
    fn allocation_larger_than_one_prealloc_chunk_grows_the_tail_enough() {
        // A value blob bigger than a single PREALLOC_SIZE chunk must grow
        // the bump area by as many chunks as it needs, not just one.
        let (_dir, mut alloc) = fresh_allocator();
        let size = PREALLOC_SIZE * 3;
        let off = alloc.allocate(size).unwrap();
        assert_eq!(alloc.size_of(off).unwrap(), size);
        assert!(alloc.freeoff >= off + size);
    }

    #[test]
    fn freed_extent_is_reused_by_same_class() {
        let (_dir, mut alloc) = fresh_allocator();
        let a = alloc.allocate(100).unwrap();
        alloc.free(a).unwrap();
        let freeoff_before = alloc.freeoff;
        let b = alloc.allocate(100).unwrap();
        assert_eq!(a, b);
        assert_eq!(alloc.freeoff, freeoff_before);
    }

    #[test]
    fn many_allocate_free_cycles_bound_growth() {
        let (_dir, mut alloc) = fresh_allocator();
        let mut offsets = Vec::new();
        for _ in 0..2000 {
            offsets.push(alloc.allocate(100).unwrap());
        }
        for off in offsets.into_iter().rev() {
            alloc.free(off).unwrap();
        }
        let freeoff_after_first_pass = alloc.freeoff;
        for _ in 0..2000 {
            alloc.allocate(100).unwrap();
        }
        // All reuse should come from the free list built above; no net
        // growth of the bump area.
        assert_eq!(alloc.freeoff, freeoff_after_first_pass);
    }

    #[test]
    fn freelist_blocks_other_than_tail_stay_full() {
        let (_dir, mut alloc) = fresh_allocator();
        let mut offsets = Vec::new();
        for _ in 0..(FREELIST_BLOCK_ITEMS * 3) {
            offsets.push(alloc.allocate(100).unwrap());
        }
        for off in offsets {
            alloc.free(off).unwrap();
        }
        let (_, class) = class_of(100).unwrap();
        let chain = &alloc.chains[class];
        for &block in &chain.blocks[..chain.blocks.len() - 1] {
            let numitems = read_u64(&*alloc.device, block + FL_NUMITEMS_OFF).unwrap();
            assert_eq!(numitems, FREELIST_BLOCK_ITEMS as u64);
        }
    }
}
