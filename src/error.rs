//! Resource errors reported to callers.
//!
//! Only recoverable conditions live here. Programming errors (bad handles,
//! invalid handler answers, depth overflow) go through `contract` instead.

use crate::epa::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    /// No free block large enough in the event heap or memory class.
    #[error("out of memory")]
    OutOfMemory,
    /// Zero-sized request, or larger than the arena can ever satisfy.
    #[error("invalid allocation size: {0} bytes")]
    InvalidSize(usize),
    /// The target EPA's queue has no free slot. The caller still owns its
    /// reference to the event.
    #[error("event queue of priority {0} is full")]
    QueueFull(Priority),
    /// Another EPA is already registered at this priority.
    #[error("priority {0} is already in use")]
    PriorityInUse(Priority),
    /// All `MAX_EPA` registry slots are taken.
    #[error("no free EPA slot")]
    NoFreeSlot,
    /// The handle does not name a registered EPA. Only reported when
    /// contract checks are compiled out.
    #[error("no EPA registered under this handle")]
    UnknownEpa,
    /// The EPA has an event in flight. Only reported when contract checks
    /// are compiled out.
    #[error("EPA is dispatching")]
    Dispatching,
}
