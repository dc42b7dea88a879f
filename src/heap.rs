//! # Event Heap
//!
//! Fixed-region memory classes backing events and EPA workspaces.
//!
//! [`Heap`] is a boundary-tag, first-fit allocator over an inline byte
//! array. Memory is carved into 8-byte granules and every block starts with
//! a one-granule header:
//!
//! ```text
//!  byte  0..2   size in granules (bit 15 = free)
//!  byte  2..4   granule index of the physically preceding block
//!  byte  4..6   next block on the free list   (free blocks only)
//!  byte  6..8   previous block on the free list (free blocks only)
//! ```
//!
//! Handles are granule indices, not pointers. The arena is bracketed by two
//! permanently allocated one-granule sentinels: the head sentinel doubles as
//! the anchor of the circular free list, the tail sentinel stops successor
//! coalescing. With both in place the first allocation and the last free
//! need no boundary special cases.
//!
//! ```text
//!  ┌──────┬──────────────────────────────────────────────┬──────┐
//!  │ head │              one free block                  │ tail │
//!  └──────┴──────────────────────────────────────────────┴──────┘
//!   g = 0   g = 1                                          g = G-1
//! ```
//!
//! Allocation walks the free list for the first block that fits and splits
//! it when the remainder can hold a header plus one payload granule.
//! Deallocation merges with free physical neighbours in O(1) through the
//! stored back index.

use core::num::NonZeroU16;

use crate::config::HEAP_GRANULE;
use crate::contract::{require, violated};
use crate::error::KernelError;

/// Handle to an allocated block: the granule index of its first payload
/// granule. Never zero, so `Option<BlockRef>` costs nothing extra.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef(NonZeroU16);

impl BlockRef {
    fn from_granule(g: usize) -> Self {
        // Payload granules always follow a header, so `g >= 1`.
        match NonZeroU16::new(g as u16) {
            Some(n) => Self(n),
            None => unreachable!(),
        }
    }

    #[inline]
    fn granule(self) -> usize {
        self.0.get() as usize
    }

    /// Byte offset of the block's payload within its arena.
    #[inline]
    pub fn offset(self) -> usize {
        self.granule() * HEAP_GRANULE
    }
}

/// A memory class: the allocate/deallocate/block-size triplet consumed by
/// EPA and event creation.
pub trait MemClass {
    fn allocate(&mut self, size: usize) -> Result<BlockRef, KernelError>;
    fn deallocate(&mut self, block: BlockRef);
    /// Usable payload bytes of `block`; at least the size requested.
    fn block_size(&self, block: BlockRef) -> usize;
}

/// A memory class whose blocks can be read and written in place.
pub trait Arena: MemClass {
    fn bytes(&self, block: BlockRef) -> &[u8];
    fn bytes_mut(&mut self, block: BlockRef) -> &mut [u8];
}

/// Allocation statistics, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Largest single allocation on a fresh arena.
    pub capacity: usize,
    /// Bytes currently free, headers included.
    pub free: usize,
    /// Lowest value `free` has ever reached.
    pub min_free: usize,
    pub allocations: u32,
    pub deallocations: u32,
}

// ---------------------------------------------------------------------------
// Boundary-tag heap
// ---------------------------------------------------------------------------

const SIZE: usize = 0;
const PREV_PHYS: usize = 2;
const NEXT_FREE: usize = 4;
const PREV_FREE: usize = 6;

const FREE_BIT: u16 = 0x8000;
const SIZE_MASK: u16 = 0x7fff;

/// Granule index of the head sentinel and free-list anchor.
const HEAD: usize = 0;

/// Remainders smaller than this stay attached to the allocated block.
const MIN_SPLIT: usize = 2;

const fn put16(mem: &mut [u8], at: usize, v: u16) {
    let b = v.to_le_bytes();
    mem[at] = b[0];
    mem[at + 1] = b[1];
}

/// Boundary-tag first-fit heap over `N` inline bytes.
pub struct Heap<const N: usize> {
    mem: [u8; N],
    free_granules: usize,
    min_free_granules: usize,
    allocations: u32,
    deallocations: u32,
}

impl<const N: usize> Heap<N> {
    const GRANULES: usize = N / HEAP_GRANULE;
    const TAIL: usize = Self::GRANULES - 1;

    /// Build a formatted arena: head sentinel, one free block, tail
    /// sentinel.
    pub const fn new() -> Self {
        assert!(N % HEAP_GRANULE == 0);
        assert!(Self::GRANULES >= 4 && Self::GRANULES <= SIZE_MASK as usize);

        let mut mem = [0u8; N];
        let first = 1;
        let span = Self::GRANULES - 2;

        // Head sentinel: allocated, anchors the free list.
        let h = HEAD * HEAP_GRANULE;
        put16(&mut mem, h + SIZE, 1);
        put16(&mut mem, h + PREV_PHYS, HEAD as u16);
        put16(&mut mem, h + NEXT_FREE, first as u16);
        put16(&mut mem, h + PREV_FREE, first as u16);

        let f = first * HEAP_GRANULE;
        put16(&mut mem, f + SIZE, span as u16 | FREE_BIT);
        put16(&mut mem, f + PREV_PHYS, HEAD as u16);
        put16(&mut mem, f + NEXT_FREE, HEAD as u16);
        put16(&mut mem, f + PREV_FREE, HEAD as u16);

        // Tail sentinel: allocated, never coalesced.
        let t = Self::TAIL * HEAP_GRANULE;
        put16(&mut mem, t + SIZE, 1);
        put16(&mut mem, t + PREV_PHYS, first as u16);

        Self {
            mem,
            free_granules: span,
            min_free_granules: span,
            allocations: 0,
            deallocations: 0,
        }
    }

    /// Largest request a fresh arena can satisfy.
    pub const fn capacity(&self) -> usize {
        (Self::GRANULES - 3) * HEAP_GRANULE
    }

    /// Bytes currently free, block headers included.
    pub fn free_space(&self) -> usize {
        self.free_granules * HEAP_GRANULE
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            capacity: self.capacity(),
            free: self.free_space(),
            min_free: self.min_free_granules * HEAP_GRANULE,
            allocations: self.allocations,
            deallocations: self.deallocations,
        }
    }

    // --- header access ---

    #[inline]
    fn get(&self, g: usize, field: usize) -> usize {
        let at = g * HEAP_GRANULE + field;
        u16::from_le_bytes([self.mem[at], self.mem[at + 1]]) as usize
    }

    #[inline]
    fn set(&mut self, g: usize, field: usize, v: usize) {
        put16(&mut self.mem, g * HEAP_GRANULE + field, v as u16);
    }

    #[inline]
    fn size_of(&self, g: usize) -> usize {
        self.get(g, SIZE) & SIZE_MASK as usize
    }

    #[inline]
    fn is_free(&self, g: usize) -> bool {
        self.get(g, SIZE) & FREE_BIT as usize != 0
    }

    #[inline]
    fn set_size(&mut self, g: usize, granules: usize, free: bool) {
        let flag = if free { FREE_BIT as usize } else { 0 };
        self.set(g, SIZE, granules | flag);
    }

    // --- free list ---

    fn link(&mut self, g: usize) {
        let next = self.get(HEAD, NEXT_FREE);
        self.set(g, NEXT_FREE, next);
        self.set(g, PREV_FREE, HEAD);
        self.set(next, PREV_FREE, g);
        self.set(HEAD, NEXT_FREE, g);
    }

    fn unlink(&mut self, g: usize) {
        let prev = self.get(g, PREV_FREE);
        let next = self.get(g, NEXT_FREE);
        self.set(prev, NEXT_FREE, next);
        self.set(next, PREV_FREE, prev);
    }

    /// Header granule of `block` if it names a live allocation.
    fn header_of(&self, block: BlockRef) -> Option<usize> {
        let g = block.granule().checked_sub(1)?;
        if g == HEAD || g >= Self::TAIL || self.is_free(g) {
            return None;
        }
        let end = g + self.size_of(g);
        if end > Self::TAIL || self.get(end, PREV_PHYS) != g {
            return None;
        }
        Some(g)
    }

    /// Whether `block` currently names a live allocation.
    pub fn is_allocated(&self, block: BlockRef) -> bool {
        self.header_of(block).is_some()
    }

    fn live(&self, block: BlockRef) -> usize {
        match self.header_of(block) {
            Some(g) => g,
            None => {
                violated!("block handle does not name a live allocation");
                block.granule().saturating_sub(1).clamp(1, Self::TAIL - 1)
            }
        }
    }
}

impl<const N: usize> Default for Heap<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> MemClass for Heap<N> {
    fn allocate(&mut self, size: usize) -> Result<BlockRef, KernelError> {
        if size == 0 || size > self.capacity() {
            return Err(KernelError::InvalidSize(size));
        }
        let need = 1 + size.div_ceil(HEAP_GRANULE);

        let mut g = self.get(HEAD, NEXT_FREE);
        while g != HEAD {
            let have = self.size_of(g);
            if have >= need {
                self.unlink(g);
                let taken = if have - need >= MIN_SPLIT {
                    let rest = g + need;
                    self.set_size(rest, have - need, true);
                    self.set(rest, PREV_PHYS, g);
                    self.set(g + have, PREV_PHYS, rest);
                    self.link(rest);
                    need
                } else {
                    have
                };
                self.set_size(g, taken, false);

                self.free_granules -= taken;
                self.min_free_granules = self.min_free_granules.min(self.free_granules);
                self.allocations = self.allocations.wrapping_add(1);
                return Ok(BlockRef::from_granule(g + 1));
            }
            g = self.get(g, NEXT_FREE);
        }
        Err(KernelError::OutOfMemory)
    }

    fn deallocate(&mut self, block: BlockRef) {
        let Some(mut g) = self.header_of(block) else {
            violated!("deallocating a block that is not allocated");
            return;
        };
        let mut size = self.size_of(g);
        self.free_granules += size;
        self.deallocations = self.deallocations.wrapping_add(1);

        let next = g + size;
        if self.is_free(next) {
            self.unlink(next);
            size += self.size_of(next);
        }

        let prev = self.get(g, PREV_PHYS);
        if self.is_free(prev) {
            // `prev` is already on the free list; grow it in place.
            size += self.size_of(prev);
            g = prev;
            self.set_size(g, size, true);
        } else {
            self.set_size(g, size, true);
            self.link(g);
        }
        self.set(g + size, PREV_PHYS, g);
    }

    fn block_size(&self, block: BlockRef) -> usize {
        let g = self.live(block);
        (self.size_of(g) - 1) * HEAP_GRANULE
    }
}

impl<const N: usize> Arena for Heap<N> {
    fn bytes(&self, block: BlockRef) -> &[u8] {
        let g = self.live(block);
        let end = (g + self.size_of(g)) * HEAP_GRANULE;
        &self.mem[block.offset()..end]
    }

    fn bytes_mut(&mut self, block: BlockRef) -> &mut [u8] {
        let g = self.live(block);
        let end = (g + self.size_of(g)) * HEAP_GRANULE;
        &mut self.mem[block.offset()..end]
    }
}

// ---------------------------------------------------------------------------
// Static pool
// ---------------------------------------------------------------------------

/// Static memory class: bump allocation, never frees.
///
/// Suited to objects created once at startup (EPA workspaces, permanent
/// events). Each block carries a one-granule size prefix so `block_size`
/// works.
pub struct StaticPool<const N: usize> {
    mem: [u8; N],
    next: usize,
}

impl<const N: usize> StaticPool<N> {
    const GRANULES: usize = N / HEAP_GRANULE;

    pub const fn new() -> Self {
        assert!(N % HEAP_GRANULE == 0 && N / HEAP_GRANULE <= u16::MAX as usize);
        Self {
            mem: [0u8; N],
            next: 0,
        }
    }

    /// Bytes not yet handed out, prefixes included.
    pub fn remaining(&self) -> usize {
        (Self::GRANULES - self.next) * HEAP_GRANULE
    }

    fn span(&self, block: BlockRef) -> (usize, usize) {
        let g = block.granule();
        require!(g >= 1 && g <= self.next, "block does not belong to this pool");
        let at = (g - 1) * HEAP_GRANULE;
        let granules = u16::from_le_bytes([self.mem[at], self.mem[at + 1]]) as usize;
        (block.offset(), (g + granules) * HEAP_GRANULE)
    }
}

impl<const N: usize> Default for StaticPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> MemClass for StaticPool<N> {
    fn allocate(&mut self, size: usize) -> Result<BlockRef, KernelError> {
        if size == 0 || size > N.saturating_sub(HEAP_GRANULE) {
            return Err(KernelError::InvalidSize(size));
        }
        let granules = size.div_ceil(HEAP_GRANULE);
        if self.next + 1 + granules > Self::GRANULES {
            return Err(KernelError::OutOfMemory);
        }
        let header = self.next;
        put16(&mut self.mem, header * HEAP_GRANULE, granules as u16);
        self.next += 1 + granules;
        Ok(BlockRef::from_granule(header + 1))
    }

    fn deallocate(&mut self, block: BlockRef) {
        log::debug!("static pool: ignoring free of block {}", block.offset());
    }

    fn block_size(&self, block: BlockRef) -> usize {
        let (start, end) = self.span(block);
        end - start
    }
}

impl<const N: usize> Arena for StaticPool<N> {
    fn bytes(&self, block: BlockRef) -> &[u8] {
        let (start, end) = self.span(block);
        &self.mem[start..end]
    }

    fn bytes_mut(&mut self, block: BlockRef) -> &mut [u8] {
        let (start, end) = self.span(block);
        &mut self.mem[start..end]
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
