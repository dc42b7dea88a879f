//! # Events
//!
//! Event identifiers, the reserved pseudo-events, and the reference-counted
//! event pool.
//!
//! Heap events live in a block of the event heap with a small header ahead
//! of the payload:
//!
//! ```text
//!  byte  0..2   event id
//!  byte  2..4   ref word: bits 0..=14 extra references, bit 15 static
//!  byte  4..6   payload size in bytes
//!  byte  6      generator priority (0xFF = none)
//!  byte  8..12  timestamp from the port
//! ```
//!
//! ## Reference counting
//!
//! A freshly created event has a count of zero, meaning exactly one
//! implicit owner: the creator. Posting hands that ownership to the target
//! queue without touching the count. Each additional owner (a second post
//! target, a deferral, an application keeping a copy) adds one. Releasing
//! at zero drops the last owner and frees the block, unless the event is
//! static, in which case nothing is ever freed.
//!
//! All pool operations take `&mut self`; the kernel keeps its pool inside
//! a [`KernelCell`](crate::sync::KernelCell), so every count change happens
//! inside a critical section.

use core::fmt;

use crate::contract::require;
use crate::epa::Priority;
use crate::error::KernelError;
use crate::heap::{Arena, BlockRef};

/// Event signal identifier. Values `0..USER` are reserved for the
/// dispatcher's pseudo-events.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub u16);

impl EventId {
    /// Probe with no meaning; states treat it like any unhandled event.
    pub const EMPTY: Self = Self(0);
    /// Superstate query: every state except the top answers `Super(parent)`.
    pub const SUPER: Self = Self(1);
    pub const ENTRY: Self = Self(2);
    pub const EXIT: Self = Self(3);
    /// Initial-transition probe sent after a state is entered.
    pub const INIT: Self = Self(4);
    /// First identifier available to applications.
    pub const USER: Self = Self(5);

    #[inline]
    pub const fn is_reserved(self) -> bool {
        self.0 < Self::USER.0
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::EMPTY => f.write_str("EMPTY"),
            Self::SUPER => f.write_str("SUPER"),
            Self::ENTRY => f.write_str("ENTRY"),
            Self::EXIT => f.write_str("EXIT"),
            Self::INIT => f.write_str("INIT"),
            Self(n) => write!(f, "#{}", n),
        }
    }
}

/// Handle to a heap event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventRef(BlockRef);

impl EventRef {
    #[inline]
    pub fn block(self) -> BlockRef {
        self.0
    }
}

/// The event a state handler sees: an id plus, for heap events, the handle
/// of its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    id: EventId,
    body: Option<EventRef>,
}

impl Event {
    pub const EMPTY: Self = Self::signal(EventId::EMPTY);
    pub const SUPER: Self = Self::signal(EventId::SUPER);
    pub const ENTRY: Self = Self::signal(EventId::ENTRY);
    pub const EXIT: Self = Self::signal(EventId::EXIT);
    pub const INIT: Self = Self::signal(EventId::INIT);

    /// An event with no body. Used for pseudo-events.
    pub(crate) const fn signal(id: EventId) -> Self {
        Self { id, body: None }
    }

    pub(crate) fn heap(id: EventId, body: EventRef) -> Self {
        Self {
            id,
            body: Some(body),
        }
    }

    #[inline]
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Heap handle, or `None` for pseudo-events.
    #[inline]
    pub fn body(&self) -> Option<EventRef> {
        self.body
    }
}

/// Packed reference count and static flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefWord(u16);

impl RefWord {
    const STATIC: u16 = 0x8000;
    const COUNT: u16 = 0x7fff;

    /// Extra references beyond the implicit owner.
    #[inline]
    pub fn count(self) -> u16 {
        self.0 & Self::COUNT
    }

    #[inline]
    pub fn is_static(self) -> bool {
        self.0 & Self::STATIC != 0
    }

    fn with_count(self, count: u16) -> Self {
        Self((self.0 & Self::STATIC) | (count & Self::COUNT))
    }

    fn with_static(self, on: bool) -> Self {
        if on {
            Self(self.0 | Self::STATIC)
        } else {
            Self(self.0 & !Self::STATIC)
        }
    }
}

const ID: usize = 0;
const REFS: usize = 2;
const SIZE: usize = 4;
const GENERATOR: usize = 6;
const STAMP: usize = 8;

/// Bytes of header in front of every event payload.
pub const HEADER_BYTES: usize = 12;

const NO_GENERATOR: u8 = 0xFF;

/// Reference-counted events over an arena memory class.
pub struct EventPool<H> {
    heap: H,
}

impl<H: Arena> EventPool<H> {
    pub const fn new(heap: H) -> Self {
        Self { heap }
    }

    pub fn heap(&self) -> &H {
        &self.heap
    }

    /// Allocate and initialize an event with a zeroed payload of `size`
    /// bytes. The creator holds the single implicit reference.
    pub fn create(
        &mut self,
        size: usize,
        id: EventId,
        generator: Option<Priority>,
        stamp: u32,
    ) -> Result<EventRef, KernelError> {
        require!(!id.is_reserved(), "reserved event ids are never allocated");
        require!(
            generator != Some(NO_GENERATOR),
            "generator priority collides with the none marker"
        );
        if size > u16::MAX as usize {
            return Err(KernelError::InvalidSize(size));
        }
        let block = self.heap.allocate(HEADER_BYTES + size)?;
        let bytes = self.heap.bytes_mut(block);
        bytes.fill(0);
        bytes[ID..ID + 2].copy_from_slice(&id.0.to_le_bytes());
        bytes[SIZE..SIZE + 2].copy_from_slice(&(size as u16).to_le_bytes());
        bytes[GENERATOR] = generator.unwrap_or(NO_GENERATOR);
        bytes[STAMP..STAMP + 4].copy_from_slice(&stamp.to_le_bytes());
        log::trace!("event {:?} created ({} bytes)", id, size);
        Ok(EventRef(block))
    }

    fn header(&self, ev: EventRef) -> &[u8] {
        &self.heap.bytes(ev.0)[..HEADER_BYTES]
    }

    fn read16(&self, ev: EventRef, at: usize) -> u16 {
        let h = self.header(ev);
        u16::from_le_bytes([h[at], h[at + 1]])
    }

    pub fn id(&self, ev: EventRef) -> EventId {
        EventId(self.read16(ev, ID))
    }

    pub fn refs(&self, ev: EventRef) -> RefWord {
        RefWord(self.read16(ev, REFS))
    }

    fn set_refs(&mut self, ev: EventRef, w: RefWord) {
        self.heap.bytes_mut(ev.0)[REFS..REFS + 2].copy_from_slice(&w.0.to_le_bytes());
    }

    /// Payload size requested at creation.
    pub fn size(&self, ev: EventRef) -> usize {
        self.read16(ev, SIZE) as usize
    }

    /// Priority of the EPA that was running when the event was created.
    pub fn generator(&self, ev: EventRef) -> Option<Priority> {
        match self.header(ev)[GENERATOR] {
            NO_GENERATOR => None,
            p => Some(p),
        }
    }

    pub fn timestamp(&self, ev: EventRef) -> u32 {
        let h = self.header(ev);
        u32::from_le_bytes([h[STAMP], h[STAMP + 1], h[STAMP + 2], h[STAMP + 3]])
    }

    pub fn payload(&self, ev: EventRef) -> &[u8] {
        let size = self.size(ev);
        &self.heap.bytes(ev.0)[HEADER_BYTES..HEADER_BYTES + size]
    }

    pub fn payload_mut(&mut self, ev: EventRef) -> &mut [u8] {
        let size = self.size(ev);
        &mut self.heap.bytes_mut(ev.0)[HEADER_BYTES..HEADER_BYTES + size]
    }

    pub fn add_reference(&mut self, ev: EventRef) {
        let w = self.refs(ev);
        require!(w.count() < RefWord::COUNT, "event reference count overflow");
        self.set_refs(ev, w.with_count(w.count() + 1));
    }

    /// Drop one reference. Returns `true` if that was the last owner and
    /// the block went back to the heap.
    pub fn release(&mut self, ev: EventRef) -> bool {
        let w = self.refs(ev);
        if w.count() > 0 {
            self.set_refs(ev, w.with_count(w.count() - 1));
            false
        } else if w.is_static() {
            false
        } else {
            log::trace!("event {:?} freed", self.id(ev));
            self.heap.deallocate(ev.0);
            true
        }
    }

    /// Exempt `ev` from freeing until `unmark_static`.
    pub fn mark_static(&mut self, ev: EventRef) {
        let w = self.refs(ev);
        self.set_refs(ev, w.with_static(true));
    }

    pub fn unmark_static(&mut self, ev: EventRef) {
        let w = self.refs(ev);
        self.set_refs(ev, w.with_static(false));
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Heap, MemClass};
    use proptest::prelude::*;

    /// Heap wrapper counting trips through the free path.
    struct Counting {
        heap: Heap<1024>,
        frees: usize,
    }

    impl MemClass for Counting {
        fn allocate(&mut self, size: usize) -> Result<BlockRef, KernelError> {
            self.heap.allocate(size)
        }
        fn deallocate(&mut self, block: BlockRef) {
            self.frees += 1;
            self.heap.deallocate(block);
        }
        fn block_size(&self, block: BlockRef) -> usize {
            self.heap.block_size(block)
        }
    }

    impl Arena for Counting {
        fn bytes(&self, block: BlockRef) -> &[u8] {
            self.heap.bytes(block)
        }
        fn bytes_mut(&mut self, block: BlockRef) -> &mut [u8] {
            self.heap.bytes_mut(block)
        }
    }

    fn pool() -> EventPool<Counting> {
        EventPool::new(Counting {
            heap: Heap::new(),
            frees: 0,
        })
    }

    const PING: EventId = EventId(10);

    #[test]
    fn test_reserved_ids() {
        assert!(EventId::INIT.is_reserved());
        assert!(!EventId::USER.is_reserved());
        assert_eq!(Event::ENTRY.id(), EventId::ENTRY);
        assert_eq!(Event::ENTRY.body(), None);
    }

    #[test]
    fn test_generator_covers_every_priority() {
        let mut pool = pool();
        let top = (crate::config::MAX_EPA - 1) as Priority;
        let ev = pool.create(0, PING, Some(top), 0).unwrap();
        assert_eq!(pool.generator(ev), Some(top));
        let none = pool.create(0, PING, None, 0).unwrap();
        assert_eq!(pool.generator(none), None);
    }

    #[test]
    fn test_create_initializes_header() {
        let mut pool = pool();
        let ev = pool.create(6, PING, Some(3), 0xDEAD_BEEF).unwrap();
        assert_eq!(pool.id(ev), PING);
        assert_eq!(pool.size(ev), 6);
        assert_eq!(pool.generator(ev), Some(3));
        assert_eq!(pool.timestamp(ev), 0xDEAD_BEEF);
        assert_eq!(pool.refs(ev).count(), 0);
        assert!(!pool.refs(ev).is_static());
        assert_eq!(pool.payload(ev), &[0u8; 6]);
    }

    #[test]
    fn test_payload_round_trip() {
        let mut pool = pool();
        let ev = pool.create(3, PING, None, 0).unwrap();
        pool.payload_mut(ev).copy_from_slice(b"abc");
        assert_eq!(pool.payload(ev), b"abc");
        assert_eq!(pool.generator(ev), None);
    }

    #[test]
    fn test_single_owner_release_frees() {
        let mut pool = pool();
        let ev = pool.create(0, PING, None, 0).unwrap();
        assert!(pool.release(ev));
        assert_eq!(pool.heap().frees, 1);
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let mut pool = pool();
        let big = pool.heap().heap.capacity() - HEADER_BYTES;
        let ev = pool.create(big, PING, None, 0).unwrap();
        assert_eq!(pool.create(0, PING, None, 0), Err(KernelError::OutOfMemory));
        pool.release(ev);
        assert!(pool.create(0, PING, None, 0).is_ok());
    }

    #[test]
    #[should_panic(expected = "reserved event ids")]
    fn test_reserved_id_cannot_be_created() {
        let mut pool = pool();
        let _ = pool.create(0, EventId::ENTRY, None, 0);
    }

    #[test]
    fn test_static_flag_survives_count_changes() {
        let mut pool = pool();
        let ev = pool.create(0, PING, None, 0).unwrap();
        pool.mark_static(ev);
        pool.add_reference(ev);
        assert!(pool.refs(ev).is_static());
        assert_eq!(pool.refs(ev).count(), 1);
        assert!(!pool.release(ev));
        assert!(!pool.release(ev));
        assert!(!pool.release(ev));
        assert_eq!(pool.heap().frees, 0);
        pool.unmark_static(ev);
        assert!(pool.release(ev));
    }

    fn interleaving() -> impl Strategy<Value = Vec<bool>> {
        (0usize..=100).prop_flat_map(|k| {
            let mut ops = vec![true; k];
            ops.extend(core::iter::repeat(false).take(k));
            Just(ops).prop_shuffle()
        })
    }

    proptest! {
        #[test]
        fn refcount_frees_exactly_once(ops in interleaving()) {
            let mut pool = pool();
            let ev = pool.create(4, PING, None, 0).unwrap();
            let mut owners = 1usize;
            let mut deferred = 0usize;

            for add in ops {
                if add {
                    pool.add_reference(ev);
                    owners += 1;
                } else if owners > 1 {
                    prop_assert!(!pool.release(ev));
                    owners -= 1;
                } else {
                    deferred += 1;
                }
            }
            for _ in 0..deferred {
                prop_assert!(!pool.release(ev));
                owners -= 1;
            }
            prop_assert_eq!(owners, 1);
            prop_assert_eq!(pool.heap().frees, 0);
            prop_assert!(pool.release(ev));
            prop_assert_eq!(pool.heap().frees, 1);
        }

        #[test]
        fn static_events_are_never_freed(adds in 0u16..=100, releases in 0usize..=300) {
            let mut pool = pool();
            let ev = pool.create(0, PING, None, 0).unwrap();
            pool.mark_static(ev);
            for _ in 0..adds {
                pool.add_reference(ev);
            }
            for _ in 0..releases {
                prop_assert!(!pool.release(ev));
            }
            prop_assert_eq!(pool.heap().frees, 0);
            prop_assert_eq!(
                pool.refs(ev).count() as usize,
                (adds as usize).saturating_sub(releases)
            );
        }
    }
}
