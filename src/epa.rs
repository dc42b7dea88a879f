//! # Event Processing Agents
//!
//! An EPA couples one state machine with one event queue and a fixed
//! priority; it is the unit of scheduling. The application owns the state
//! machine half (an [`Agent`](crate::hsm::Agent), usually a `static`); the
//! kernel owns the queue and the priority slot and refers to the agent
//! through the object-safe [`Dispatch`] trait.
//!
//! State handlers receive a [`Context`] naming the EPA being dispatched and
//! giving access to the kernel, so they can create and post events.

use crate::config::{MAX_NEST_DEPTH, QUEUE_MAX};
use crate::contract::require;
use crate::error::KernelError;
use crate::event::{Event, EventId, EventRef};
use crate::hsm::Dispatched;
use crate::kernel::Kernel;

/// EPA priority. Larger is more urgent; valid range `0..MAX_EPA`.
pub type Priority = u8;

/// Handle to a registered EPA. Stable across priority changes.
///
/// Carries the slot index and the slot's generation at registration, so a
/// handle kept past `epa_destroy` never reaches the next EPA registered in
/// the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EpaHandle {
    index: u8,
    generation: u8,
}

impl EpaHandle {
    pub(crate) const fn new(index: usize, generation: u8) -> Self {
        Self {
            index: index as u8,
            generation,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn generation(self) -> u8 {
        self.generation
    }

    /// Packed form, for carrying a handle in an event payload.
    pub const fn to_bits(self) -> u16 {
        (self.generation as u16) << 8 | self.index as u16
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self {
            index: bits as u8,
            generation: (bits >> 8) as u8,
        }
    }
}

/// Static description of an EPA, consumed by `Kernel::epa_create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpaDef {
    /// Diagnostic only.
    pub name: &'static str,
    /// Unique among registered EPAs.
    pub priority: Priority,
    /// Bytes of workspace reserved from the memory class at creation.
    /// Zero reserves nothing.
    pub workspace_size: usize,
    /// Event queue capacity, `1..=QUEUE_MAX`.
    pub queue_depth: usize,
    /// Deepest state nesting used by the machine, counting the top state,
    /// `2..=MAX_NEST_DEPTH`.
    pub max_depth: usize,
}

impl EpaDef {
    pub const fn new(name: &'static str, priority: Priority) -> Self {
        Self {
            name,
            priority,
            workspace_size: 0,
            queue_depth: QUEUE_MAX,
            max_depth: MAX_NEST_DEPTH,
        }
    }

    pub const fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    pub const fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub const fn workspace(mut self, bytes: usize) -> Self {
        self.workspace_size = bytes;
        self
    }

    pub(crate) fn validate(&self) {
        require!(
            self.queue_depth >= 1 && self.queue_depth <= QUEUE_MAX,
            "EPA queue depth out of range"
        );
        require!(
            self.max_depth >= 2 && self.max_depth <= MAX_NEST_DEPTH,
            "EPA hierarchy depth out of range"
        );
    }
}

/// The kernel's view of an agent.
///
/// Implemented by [`Agent`](crate::hsm::Agent); applications with unusual
/// needs can implement it directly.
pub trait Dispatch: Sync {
    fn definition(&self) -> &EpaDef;

    /// Run the initial transition. Called exactly once, before the first
    /// `dispatch`.
    fn start(&self, ctx: &Context<'_, '_>);

    /// Process one event to completion.
    fn dispatch(&self, ctx: &Context<'_, '_>, ev: &Event) -> Dispatched;
}

/// What a state handler can reach: the kernel, and the identity of the EPA
/// it runs in.
pub struct Context<'c, 'a> {
    kernel: &'c Kernel<'a>,
    me: EpaHandle,
}

impl<'c, 'a> Context<'c, 'a> {
    pub(crate) fn new(kernel: &'c Kernel<'a>, me: EpaHandle) -> Self {
        Self { kernel, me }
    }

    #[inline]
    pub fn kernel(&self) -> &'c Kernel<'a> {
        self.kernel
    }

    /// The EPA being dispatched.
    #[inline]
    pub fn me(&self) -> EpaHandle {
        self.me
    }

    /// Create a heap event carrying a copy of `payload`.
    pub fn create(&self, id: EventId, payload: &[u8]) -> Result<EventRef, KernelError> {
        self.kernel.event_create_from(id, payload)
    }

    pub fn post(&self, to: EpaHandle, ev: EventRef) -> Result<(), KernelError> {
        self.kernel.post(to, ev)
    }

    pub fn post_self(&self, ev: EventRef) -> Result<(), KernelError> {
        self.kernel.post(self.me, ev)
    }

    /// Run `f` over the payload of `ev`. `None` for pseudo-events.
    ///
    /// `f` runs inside a critical section; it must not post or create
    /// events.
    pub fn payload<R>(&self, ev: &Event, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        ev.body().map(|body| self.kernel.with_payload(body, f))
    }
}
