//! Physical memory manager: a pure buddy allocator over the regions the
//! bootloader's memory map declares free.
//!
//! Grounded on the teacher's hybrid bitmap+buddy frame allocator, cut down
//! to the buddy half only -- no NUMA, no bitmap small-allocation path, no
//! per-CPU page cache. Orders run 0..=MAX_ORDER (4 KiB .. 2 MiB blocks).

use spin::Once;

use crate::config::{BUDDY_DESCRIPTOR_POOL_SIZE, FRAME_SIZE, MAX_ORDER};
use crate::error::KernelError;
use crate::sync::IrqSpinlock;

/// Physical page frame number (`PhysicalAddress >> 12`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(u64);

impl FrameNumber {
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn as_addr(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * FRAME_SIZE as u64)
    }
}

/// Physical memory address. Opaque 64-bit integer, page-aligned for the
/// uses the PMM and PCD care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub const fn as_frame(self) -> FrameNumber {
        FrameNumber::new(self.0 / FRAME_SIZE as u64)
    }

    pub const fn is_aligned_to_order(self, order: usize) -> bool {
        self.0 % block_size(order) == 0
    }

    pub const fn checked_add(self, offset: u64) -> Self {
        Self::new(self.0 + offset)
    }
}

/// Number of bytes a block of the given order covers: `4096 << order`.
pub const fn block_size(order: usize) -> u64 {
    (FRAME_SIZE as u64) << order
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Free,
    Allocated,
}

#[derive(Debug, Clone, Copy)]
struct Descriptor {
    base: PhysicalAddress,
    order: u8,
    state: BlockState,
    /// Index of the next free descriptor on this order's free list, or
    /// `NONE` if this is the list tail. Reused as the free-descriptor-pool
    /// free list when `state == Allocated`'s slot is returned to the pool.
    next: u32,
}

const NONE: u32 = u32::MAX;

/// Buddy allocator over a fixed-size static descriptor pool.
///
/// The pool itself never grows; `BUDDY_DESCRIPTOR_POOL_SIZE` is the hard
/// ceiling on the number of simultaneously-tracked blocks (free or
/// allocated). Exhausting it is a distinct fatal condition from ordinary
/// out-of-memory, logged and reported through `KernelError::DescriptorPoolExhausted`.
pub struct BuddyAllocator {
    inner: IrqSpinlock<Inner>,
}

struct Inner {
    descriptors: [Descriptor; BUDDY_DESCRIPTOR_POOL_SIZE],
    /// Head index into `descriptors` for each order's free list.
    free_list_heads: [u32; MAX_ORDER + 1],
    /// Free list of unused descriptor slots.
    pool_free_head: u32,
    pool_len: usize,
    total_pages: u64,
    free_pages: u64,
}

impl Inner {
    const fn new() -> Self {
        const EMPTY: Descriptor = Descriptor {
            base: PhysicalAddress::new(0),
            order: 0,
            state: BlockState::Free,
            next: NONE,
        };
        Self {
            descriptors: [EMPTY; BUDDY_DESCRIPTOR_POOL_SIZE],
            free_list_heads: [NONE; MAX_ORDER + 1],
            pool_free_head: NONE,
            pool_len: 0,
            total_pages: 0,
            free_pages: 0,
        }
    }

    fn alloc_descriptor(&mut self, base: PhysicalAddress, order: usize, state: BlockState) -> Option<u32> {
        let idx = if self.pool_free_head != NONE {
            let idx = self.pool_free_head;
            self.pool_free_head = self.descriptors[idx as usize].next;
            idx
        } else if self.pool_len < BUDDY_DESCRIPTOR_POOL_SIZE {
            let idx = self.pool_len as u32;
            self.pool_len += 1;
            idx
        } else {
            return None;
        };

        self.descriptors[idx as usize] = Descriptor {
            base,
            order: order as u8,
            state,
            next: NONE,
        };
        Some(idx)
    }

    fn release_descriptor(&mut self, idx: u32) {
        self.descriptors[idx as usize].next = self.pool_free_head;
        self.pool_free_head = idx;
    }

    fn push_free(&mut self, order: usize, idx: u32) {
        self.descriptors[idx as usize].next = self.free_list_heads[order];
        self.descriptors[idx as usize].state = BlockState::Free;
        self.free_list_heads[order] = idx;
    }

    /// Remove and return the descriptor index for `base` at `order` from
    /// that order's free list, if present.
    fn remove_free(&mut self, order: usize, base: PhysicalAddress) -> Option<u32> {
        let mut cur = self.free_list_heads[order];
        let mut prev: Option<u32> = None;

        while cur != NONE {
            if self.descriptors[cur as usize].base == base {
                let next = self.descriptors[cur as usize].next;
                match prev {
                    Some(p) => self.descriptors[p as usize].next = next,
                    None => self.free_list_heads[order] = next,
                }
                return Some(cur);
            }
            prev = Some(cur);
            cur = self.descriptors[cur as usize].next;
        }
        None
    }

    fn pop_free_at_or_above(&mut self, min_order: usize) -> Option<(u32, usize)> {
        for order in min_order..=MAX_ORDER {
            let head = self.free_list_heads[order];
            if head != NONE {
                self.free_list_heads[order] = self.descriptors[head as usize].next;
                return Some((head, order));
            }
        }
        None
    }
}

impl BuddyAllocator {
    pub const fn new() -> Self {
        Self {
            inner: IrqSpinlock::new(Inner::new()),
        }
    }

    /// Split the page-aligned window `[base, base+size)` into the largest
    /// aligned free blocks that fit, inserting each into its order's free
    /// list.
    pub fn add_region(&self, base: PhysicalAddress, size: u64) -> Result<(), KernelError> {
        let mut inner = self.inner.lock();
        let mut cursor = base.as_u64();
        let end = base.as_u64() + size;

        while cursor < end {
            let remaining = end - cursor;
            let mut order = MAX_ORDER;
            loop {
                let sz = block_size(order);
                if cursor % sz == 0 && sz <= remaining {
                    break;
                }
                if order == 0 {
                    break;
                }
                order -= 1;
            }
            let sz = block_size(order);

            let idx = inner
                .alloc_descriptor(PhysicalAddress::new(cursor), order, BlockState::Free)
                .ok_or(KernelError::DescriptorPoolExhausted)?;
            inner.push_free(order, idx);
            inner.total_pages += 1u64 << order;
            inner.free_pages += 1u64 << order;

            cursor += sz;
        }
        Ok(())
    }

    /// Carve `[base, base+size)` out of whatever free blocks intersect it,
    /// used to punch out the kernel image, the AP trampoline page, and the
    /// boot stacks before the allocator is handed out.
    pub fn reserve_region(&self, base: PhysicalAddress, size: u64) -> Result<(), KernelError> {
        let reserve_start = base.as_u64();
        let reserve_end = reserve_start + size;

        // Collect every free block that intersects the reserved window,
        // re-adding the non-intersecting prefix/suffix via add_region.
        let intersecting: alloc::vec::Vec<(PhysicalAddress, usize)> = {
            let mut inner = self.inner.lock();
            let mut hits = alloc::vec::Vec::new();
            for order in 0..=MAX_ORDER {
                let mut cur = inner.free_list_heads[order];
                let mut prev: Option<u32> = None;
                while cur != NONE {
                    let d = inner.descriptors[cur as usize];
                    let block_start = d.base.as_u64();
                    let block_end = block_start + block_size(order);
                    let next = d.next;
                    if block_start < reserve_end && block_end > reserve_start {
                        match prev {
                            Some(p) => inner.descriptors[p as usize].next = next,
                            None => inner.free_list_heads[order] = next,
                        }
                        inner.total_pages -= 1u64 << order;
                        inner.free_pages -= 1u64 << order;
                        inner.release_descriptor(cur);
                        hits.push((d.base, order));
                    } else {
                        prev = Some(cur);
                    }
                    cur = next;
                }
            }
            hits
        };

        for (block_base, order) in intersecting {
            let block_start = block_base.as_u64();
            let block_end = block_start + block_size(order);

            if block_start < reserve_start {
                self.add_region(block_base, reserve_start - block_start)?;
            }
            if block_end > reserve_end {
                self.add_region(PhysicalAddress::new(reserve_end), block_end - reserve_end)?;
            }
        }
        Ok(())
    }

    /// Lowest-address first-fit among orders >= `order`; splits the chosen
    /// block's high half back into the free list until the target order is
    /// reached.
    pub fn alloc(&self, order: usize) -> Result<PhysicalAddress, KernelError> {
        if order > MAX_ORDER {
            return Err(KernelError::OutOfMemory { order });
        }
        let mut inner = self.inner.lock();

        let (mut idx, mut cur_order) = inner
            .pop_free_at_or_above(order)
            .ok_or(KernelError::OutOfMemory { order })?;

        while cur_order > order {
            cur_order -= 1;
            let base = inner.descriptors[idx as usize].base;
            let high_half = base.checked_add(block_size(cur_order));

            let high_idx = inner
                .alloc_descriptor(high_half, cur_order, BlockState::Free)
                .ok_or(KernelError::DescriptorPoolExhausted)?;
            inner.push_free(cur_order, high_idx);

            inner.descriptors[idx as usize].order = cur_order as u8;
        }

        inner.descriptors[idx as usize].state = BlockState::Allocated;
        inner.free_pages -= 1u64 << order;
        Ok(inner.descriptors[idx as usize].base)
    }

    /// Return a block to its order's free list, then iteratively coalesce
    /// with its buddy while the buddy is free and of equal order.
    pub fn free(&self, addr: PhysicalAddress, order: usize) -> Result<(), KernelError> {
        let mut inner = self.inner.lock();
        inner.free_pages += 1u64 << order;

        let mut base = addr;
        let mut cur_order = order;

        loop {
            if cur_order >= MAX_ORDER {
                let idx = inner
                    .alloc_descriptor(base, cur_order, BlockState::Free)
                    .ok_or(KernelError::DescriptorPoolExhausted)?;
                inner.push_free(cur_order, idx);
                break;
            }

            let buddy_base = PhysicalAddress::new(base.as_u64() ^ block_size(cur_order));
            match inner.remove_free(cur_order, buddy_base) {
                Some(buddy_idx) => {
                    inner.release_descriptor(buddy_idx);
                    base = PhysicalAddress::new(base.as_u64().min(buddy_base.as_u64()));
                    cur_order += 1;
                }
                None => {
                    let idx = inner
                        .alloc_descriptor(base, cur_order, BlockState::Free)
                        .ok_or(KernelError::DescriptorPoolExhausted)?;
                    inner.push_free(cur_order, idx);
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> BuddyStats {
        let inner = self.inner.lock();
        BuddyStats {
            total_pages: inner.total_pages,
            free_pages: inner.free_pages,
            descriptors_in_use: inner.pool_len,
        }
    }
}

impl Default for BuddyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BuddyStats {
    pub total_pages: u64,
    pub free_pages: u64,
    pub descriptors_in_use: usize,
}

// The static descriptor pool (spec §3) is monitor-private: every write to it
// happens either before the OuterView is live or from inside
// `monitor::trampoline::dispatch` (running on the MonitorView CR3), never
// directly from outer-kernel code. `.monitor_private` keeps it out of the
// general cede of the kernel image's read-write data (spec §4.5.1/§9).
#[link_section = ".monitor_private"]
static PMM: Once<BuddyAllocator> = Once::new();

/// Global PMM instance, brought up once from the multiboot2 memory map.
pub fn pmm() -> &'static BuddyAllocator {
    PMM.call_once(BuddyAllocator::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> BuddyAllocator {
        let pmm = BuddyAllocator::new();
        pmm.add_region(PhysicalAddress::new(0), block_size(MAX_ORDER) * 4)
            .unwrap();
        pmm
    }

    #[test_case]
    fn conservation_across_alloc_free() {
        let pmm = fresh();
        let before = pmm.stats().free_pages;
        let a = pmm.alloc(2).unwrap();
        let b = pmm.alloc(0).unwrap();
        pmm.free(a, 2).unwrap();
        pmm.free(b, 0).unwrap();
        assert_eq!(pmm.stats().free_pages, before);
    }

    #[test_case]
    fn alloc_is_order_aligned() {
        let pmm = fresh();
        for order in 0..=3 {
            let addr = pmm.alloc(order).unwrap();
            assert_eq!(addr.as_u64() % block_size(order), 0);
        }
    }

    #[test_case]
    fn freeing_buddies_coalesces() {
        let pmm = BuddyAllocator::new();
        pmm.add_region(PhysicalAddress::new(0), block_size(1)).unwrap();
        let a = pmm.alloc(0).unwrap();
        let b = pmm.alloc(0).unwrap();
        assert_ne!(a, b);
        pmm.free(a, 0).unwrap();
        pmm.free(b, 0).unwrap();
        // The pair should have recombined into a single order-1 block.
        let merged = pmm.alloc(1).unwrap();
        assert_eq!(merged, PhysicalAddress::new(0));
    }

    #[test_case]
    fn exhaustion_reports_out_of_memory() {
        let pmm = BuddyAllocator::new();
        pmm.add_region(PhysicalAddress::new(0), block_size(0)).unwrap();
        assert!(pmm.alloc(0).is_ok());
        assert_eq!(pmm.alloc(0), Err(KernelError::OutOfMemory { order: 0 }));
    }
}
