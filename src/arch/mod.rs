//! # Architecture Abstraction Layer
//!
//! The kernel needs two things from the hardware: a way to get
//! `Kernel::schedule` called soon after an event makes a more urgent EPA
//! ready, and an optional timestamp source for event metadata. Both are
//! behind the [`Port`] trait.
//!
//! Critical sections are not part of the port; they come from the
//! `critical-section` crate, whose implementation is picked at link time.
//!
//! Currently implements the Cortex-M4 port; extensible to other
//! architectures by adding sibling modules.

use crate::epa::Priority;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;

pub trait Port: Sync {
    /// `priority` just became ready and outranks the running priority.
    ///
    /// Called with the kernel's critical section held, so it must only
    /// request scheduling (pend an interrupt, set a flag), never run it.
    fn notify_ready(&self, _priority: Priority) {}

    /// Free-running timestamp stored in every event created.
    fn timestamp(&self) -> u32 {
        0
    }
}

/// Port for hosted builds and tests. The application drives
/// `Kernel::schedule` itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostPort;

impl Port for HostPort {}
