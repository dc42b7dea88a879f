//! # Synchronization Primitives
//!
//! Interrupt-safe critical section abstractions. All shared kernel state
//! (queues, bitmap words, reference counts, the heap) lives in a
//! [`KernelCell`] and can only be touched with a [`CriticalSection`] token,
//! so the "all mutation under lock" rule is checked by the type system.
//!
//! On Cortex-M4 the section is provided by `cortex-m`'s single-core
//! implementation (PRIMASK save/disable/restore); host builds use the
//! `critical-section` crate's `std` implementation.

use core::cell::{Ref, RefCell, RefMut, UnsafeCell};
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

pub use critical_section::CriticalSection;
use critical_section::Mutex;

/// Execute a closure within a critical section (interrupts disabled).
///
/// This is the acquiring half of the kernel's two calling conventions:
/// plain kernel operations call this, `_i` variants take the token from a
/// caller that already holds the section. The previous interrupt state is
/// restored on every exit path, including unwinding.
///
/// Keep critical sections as short as possible to minimize interrupt
/// latency.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    ::critical_section::with(f)
}

/// Shared mutable kernel state, accessible only inside a critical section.
pub struct KernelCell<T> {
    inner: Mutex<RefCell<T>>,
}

impl<T> KernelCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(value)),
        }
    }

    #[inline]
    pub fn borrow<'cs>(&'cs self, cs: CriticalSection<'cs>) -> Ref<'cs, T> {
        self.inner.borrow(cs).borrow()
    }

    #[inline]
    pub fn borrow_mut<'cs>(&'cs self, cs: CriticalSection<'cs>) -> RefMut<'cs, T> {
        self.inner.borrow(cs).borrow_mut()
    }
}

/// Cell holding an agent's state machine.
///
/// The drain loop claims it outside any critical section while the agent
/// handles an event. Only the loop frame running at the agent's priority
/// ever claims it, and priorities strictly increase as frames nest, so two
/// claims never overlap in a correct program. The claim is an atomic flag:
/// a second one, from a re-entrant dispatch or from another thread, fails
/// instead of aliasing the contents.
pub struct AgentCell<T> {
    claimed: AtomicBool,
    inner: UnsafeCell<T>,
}

// Safety: the contents are only reachable through an `AgentGuard`, and at
// most one guard exists at a time because `claimed` is taken with an
// acquiring compare-exchange and released with a releasing store.
unsafe impl<T: Send> Sync for AgentCell<T> {}

impl<T> AgentCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            claimed: AtomicBool::new(false),
            inner: UnsafeCell::new(value),
        }
    }

    /// Exclusive access, or `None` while someone else holds it.
    #[inline]
    pub fn claim(&self) -> Option<AgentGuard<'_, T>> {
        self.claimed
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| AgentGuard { cell: self })
    }
}

/// Proof of exclusive access to an [`AgentCell`]. Releases it on drop.
pub struct AgentGuard<'c, T> {
    cell: &'c AgentCell<T>,
}

impl<T> Deref for AgentGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard is the only live claim on the cell.
        unsafe { &*self.cell.inner.get() }
    }
}

impl<T> DerefMut for AgentGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: as above, and `&mut self` makes this borrow unique.
        unsafe { &mut *self.cell.inner.get() }
    }
}

impl<T> Drop for AgentGuard<'_, T> {
    fn drop(&mut self) {
        self.cell.claimed.store(false, Ordering::Release);
    }
}
