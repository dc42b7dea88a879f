//! # Kernel
//!
//! Top-level kernel object and public API.
//!
//! A [`Kernel`] owns everything the scheduler touches: the EPA registry,
//! the ready set, the running priority, the per-EPA event queues and the
//! event heap. It is usually a `static`, built with the `const`
//! constructor, so interrupt handlers can reach it:
//!
//! ```ignore
//! static PORT: CortexM4Port = CortexM4Port;
//! static KERNEL: Kernel<'static> = Kernel::new(&PORT);
//! ```
//!
//! Hosted tests instantiate as many kernels as they like.
//!
//! ## Startup Sequence
//!
//! ```text
//! main()
//!   ├─► KERNEL.init()          ← Reset registry and event heap
//!   ├─► KERNEL.epa_create()    ← Register agents (×N)
//!   └─► KERNEL.start()         ← Run initial transitions, drain
//!         └─► schedule()
//! ISR
//!   └─► KERNEL.post_i()        ← Queue event, pend the scheduler
//!         └─► Port::notify_ready()
//! ```
//!
//! ## Calling Conventions
//!
//! Operations that touch shared state come in two forms. The plain form
//! (`post`, `event_create`, ...) takes a critical section itself. The `_i`
//! form (`post_i`, `event_create_i`, ...) takes the caller's
//! [`CriticalSection`] token, for interrupt handlers that group several
//! operations under one section.

use crate::arch::Port;
use crate::bitmap::ReadySet;
use crate::config::{EVENT_HEAP_BYTES, MAX_EPA};
use crate::contract::{require, violated};
use crate::epa::{Context, Dispatch, EpaHandle, Priority};
use crate::error::KernelError;
use crate::event::{EventId, EventPool, EventRef};
use crate::heap::{BlockRef, Heap, HeapStats, MemClass};
use crate::queue::{EventQueue, Full, QueueStats};
use crate::sync::{critical_section, CriticalSection, KernelCell};

/// Lifecycle state reported by `Kernel::status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelStatus {
    Stopped,
    Running,
}

/// `true` if `p` preempts `running`. Idle (`None`) is below every priority.
#[inline]
pub(crate) fn outranks(p: Priority, running: Option<Priority>) -> bool {
    running.map_or(true, |r| p > r)
}

// ---------------------------------------------------------------------------
// Registry state
// ---------------------------------------------------------------------------

/// One registered EPA.
pub(crate) struct Slot<'a> {
    pub(crate) agent: &'a dyn Dispatch,
    generation: u8,
    pub(crate) priority: Priority,
    pub(crate) queue: EventQueue,
    workspace: Option<BlockRef>,
    /// Set once the initial transition has run. Until then, posted events
    /// queue up but the EPA is not marked ready.
    pub(crate) started: bool,
}

impl<'a> Slot<'a> {
    const EMPTY: Option<Self> = None;
}

/// Everything guarded by the kernel's critical section.
///
/// Invariant: priority `p` is in `ready` exactly when `by_prio[p]` names a
/// started EPA whose queue is non-empty.
pub(crate) struct State<'a> {
    pub(crate) status: KernelStatus,
    pub(crate) ready: ReadySet,
    /// Priority of the innermost drain-loop frame, `None` when idle.
    pub(crate) running: Option<Priority>,
    /// Priorities of every drain-loop frame with an event in flight,
    /// preempted frames included.
    pub(crate) dispatching: ReadySet,
    pub(crate) slots: [Option<Slot<'a>>; MAX_EPA],
    /// Generation the next EPA registered in each slot will carry.
    generations: [u8; MAX_EPA],
    pub(crate) by_prio: [Option<EpaHandle>; MAX_EPA],
    pub(crate) events: EventPool<Heap<EVENT_HEAP_BYTES>>,
}

impl<'a> State<'a> {
    const fn new() -> Self {
        Self {
            status: KernelStatus::Stopped,
            ready: ReadySet::new(),
            running: None,
            dispatching: ReadySet::new(),
            slots: [Slot::EMPTY; MAX_EPA],
            generations: [0; MAX_EPA],
            by_prio: [None; MAX_EPA],
            events: EventPool::new(Heap::new()),
        }
    }

    /// The slot `h` names, if it is still registered.
    pub(crate) fn lookup_mut(&mut self, h: EpaHandle) -> Option<&mut Slot<'a>> {
        self.slots
            .get_mut(h.index())
            .and_then(Option::as_mut)
            .filter(|slot| slot.generation == h.generation())
    }

    fn lookup(&self, h: EpaHandle) -> Option<&Slot<'a>> {
        self.slots
            .get(h.index())
            .and_then(Option::as_ref)
            .filter(|slot| slot.generation == h.generation())
    }

    pub(crate) fn slot_mut(&mut self, h: EpaHandle) -> Result<&mut Slot<'a>, KernelError> {
        match self.lookup_mut(h) {
            Some(slot) => Ok(slot),
            None => {
                violated!("no EPA registered under this handle");
                Err(KernelError::UnknownEpa)
            }
        }
    }

    fn slot(&self, h: EpaHandle) -> Result<&Slot<'a>, KernelError> {
        match self.lookup(h) {
            Some(slot) => Ok(slot),
            None => {
                violated!("no EPA registered under this handle");
                Err(KernelError::UnknownEpa)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel API
// ---------------------------------------------------------------------------

pub struct Kernel<'a> {
    pub(crate) port: &'a dyn Port,
    pub(crate) state: KernelCell<State<'a>>,
}

impl<'a> Kernel<'a> {
    pub const fn new(port: &'a dyn Port) -> Self {
        Self {
            port,
            state: KernelCell::new(State::new()),
        }
    }

    /// Reset the kernel: forget every registered EPA and empty the event
    /// heap. Must not be called on a running kernel.
    pub fn init(&self) {
        critical_section(|cs| {
            let mut st = self.state.borrow_mut(cs);
            require!(
                st.status == KernelStatus::Stopped,
                "init on a running kernel"
            );
            let generations = st.generations.map(|g| g.wrapping_add(1));
            *st = State::new();
            st.generations = generations;
        });
        log::debug!(
            "kernel initialized: {} priorities, {} byte event heap",
            MAX_EPA,
            EVENT_HEAP_BYTES
        );
    }

    /// Run the initial transition of every registered EPA, most urgent
    /// first, then start draining. Returns once every queue is empty.
    pub fn start(&self) {
        require!(
            self.status() == KernelStatus::Stopped,
            "kernel started twice"
        );
        while let Some((h, agent)) = critical_section(|cs| self.next_unstarted(cs)) {
            self.start_agent(h, agent);
        }
        critical_section(|cs| self.state.borrow_mut(cs).status = KernelStatus::Running);
        log::debug!("kernel started");
        self.schedule();
    }

    pub fn status(&self) -> KernelStatus {
        critical_section(|cs| self.state.borrow(cs).status)
    }

    /// Priority of the EPA currently dispatching, `None` when idle.
    pub fn running(&self) -> Option<Priority> {
        critical_section(|cs| self.state.borrow(cs).running)
    }

    fn next_unstarted(&self, cs: CriticalSection<'_>) -> Option<(EpaHandle, &'a dyn Dispatch)> {
        let st = self.state.borrow(cs);
        let next = st.by_prio.iter().rev().flatten().find_map(|&h| {
            let slot = st.lookup(h)?;
            (!slot.started).then_some((h, slot.agent))
        });
        next
    }

    fn start_agent(&self, h: EpaHandle, agent: &'a dyn Dispatch) {
        log::debug!("starting EPA {}", agent.definition().name);
        agent.start(&Context::new(self, h));
        critical_section(|cs| {
            let mut st = self.state.borrow_mut(cs);
            let st = &mut *st;
            if let Some(slot) = st.lookup_mut(h) {
                slot.started = true;
                let pending = !slot.queue.is_empty();
                let prio = slot.priority;
                if pending {
                    st.ready.insert(prio);
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // EPA management
    // -----------------------------------------------------------------------

    /// Register `agent`, reserving its workspace from `mem`.
    ///
    /// On a running kernel the agent's initial transition runs before this
    /// returns; otherwise it runs in `start`.
    pub fn epa_create<C>(
        &self,
        mem: &mut C,
        agent: &'a dyn Dispatch,
    ) -> Result<EpaHandle, KernelError>
    where
        C: MemClass + ?Sized,
    {
        let def = *agent.definition();
        def.validate();
        let p = def.priority;
        require!((p as usize) < MAX_EPA, "EPA priority out of range");

        let workspace = match def.workspace_size {
            0 => None,
            n => Some(mem.allocate(n)?),
        };

        let registered = critical_section(|cs| {
            let mut st = self.state.borrow_mut(cs);
            if st.by_prio[p as usize].is_some() {
                violated!("EPA priority already in use");
                return Err(KernelError::PriorityInUse(p));
            }
            let index = st
                .slots
                .iter()
                .position(Option::is_none)
                .ok_or(KernelError::NoFreeSlot)?;
            let generation = st.generations[index];
            let h = EpaHandle::new(index, generation);
            st.slots[index] = Some(Slot {
                agent,
                generation,
                priority: p,
                queue: EventQueue::with_depth(def.queue_depth),
                workspace,
                started: false,
            });
            st.by_prio[p as usize] = Some(h);
            Ok((h, st.status == KernelStatus::Running))
        });

        let (h, running) = match registered {
            Ok(r) => r,
            Err(e) => {
                if let Some(block) = workspace {
                    mem.deallocate(block);
                }
                return Err(e);
            }
        };
        log::debug!("EPA {} created at priority {}", def.name, p);

        if running {
            self.start_agent(h, agent);
            self.schedule();
        }
        Ok(h)
    }

    /// Unregister an EPA. Pending events are released and the workspace is
    /// returned to `mem`.
    pub fn epa_destroy<C>(&self, h: EpaHandle, mem: &mut C) -> Result<(), KernelError>
    where
        C: MemClass + ?Sized,
    {
        let workspace = critical_section(|cs| {
            let mut st = self.state.borrow_mut(cs);
            let st = &mut *st;
            st.slot(h)?;
            let Some(mut slot) = st.slots[h.index()].take() else {
                return Err(KernelError::UnknownEpa);
            };
            st.generations[h.index()] = slot.generation.wrapping_add(1);
            st.by_prio[slot.priority as usize] = None;
            st.ready.remove(slot.priority);
            let mut drained = 0;
            while let Some(ev) = slot.queue.pop_front() {
                st.events.release(ev);
                drained += 1;
            }
            log::debug!(
                "EPA {} destroyed, {} pending events released",
                slot.agent.definition().name,
                drained
            );
            Ok(slot.workspace)
        })?;
        if let Some(block) = workspace {
            mem.deallocate(block);
        }
        Ok(())
    }

    pub fn epa_priority(&self, h: EpaHandle) -> Result<Priority, KernelError> {
        critical_section(|cs| Ok(self.state.borrow(cs).slot(h)?.priority))
    }

    /// Move an EPA to another free priority. Not allowed while that EPA has
    /// an event in flight, even in a preempted drain-loop frame.
    pub fn epa_set_priority(&self, h: EpaHandle, p: Priority) -> Result<(), KernelError> {
        require!((p as usize) < MAX_EPA, "EPA priority out of range");
        critical_section(|cs| {
            let mut st = self.state.borrow_mut(cs);
            let st = &mut *st;
            let old = st.slot(h)?.priority;
            if old == p {
                return Ok(());
            }
            if st.by_prio[p as usize].is_some() {
                violated!("EPA priority already in use");
                return Err(KernelError::PriorityInUse(p));
            }
            if st.dispatching.contains(old) {
                violated!("priority change while the EPA is dispatching");
                return Err(KernelError::Dispatching);
            }
            st.slot_mut(h)?.priority = p;
            st.by_prio[old as usize] = None;
            st.by_prio[p as usize] = Some(h);
            if st.ready.contains(old) {
                st.ready.remove(old);
                st.ready.insert(p);
                if st.status == KernelStatus::Running && outranks(p, st.running) {
                    self.port.notify_ready(p);
                }
            }
            log::debug!("EPA priority {} -> {}", old, p);
            Ok(())
        })
    }

    pub fn queue_stats(&self, h: EpaHandle) -> Result<QueueStats, KernelError> {
        critical_section(|cs| Ok(self.state.borrow(cs).slot(h)?.queue.stats()))
    }

    /// Block reserved for the EPA at creation, if it asked for one.
    pub fn epa_workspace(&self, h: EpaHandle) -> Result<Option<BlockRef>, KernelError> {
        critical_section(|cs| Ok(self.state.borrow(cs).slot(h)?.workspace))
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Allocate an event with a zeroed `size`-byte payload. The caller owns
    /// the only reference until it posts or destroys the event.
    pub fn event_create(&self, size: usize, id: EventId) -> Result<EventRef, KernelError> {
        critical_section(|cs| self.event_create_i(cs, size, id))
    }

    pub fn event_create_i(
        &self,
        cs: CriticalSection<'_>,
        size: usize,
        id: EventId,
    ) -> Result<EventRef, KernelError> {
        let stamp = self.port.timestamp();
        let mut st = self.state.borrow_mut(cs);
        let generator = st.running;
        st.events.create(size, id, generator, stamp)
    }

    /// Allocate an event whose payload is a copy of `bytes`.
    pub fn event_create_from(&self, id: EventId, bytes: &[u8]) -> Result<EventRef, KernelError> {
        critical_section(|cs| {
            let ev = self.event_create_i(cs, bytes.len(), id)?;
            self.state
                .borrow_mut(cs)
                .events
                .payload_mut(ev)
                .copy_from_slice(bytes);
            Ok(ev)
        })
    }

    /// Drop one reference; the event is freed when the last owner lets go
    /// and it is not reserved.
    pub fn event_destroy(&self, ev: EventRef) {
        critical_section(|cs| self.event_destroy_i(cs, ev))
    }

    pub fn event_destroy_i(&self, cs: CriticalSection<'_>, ev: EventRef) {
        self.state.borrow_mut(cs).events.release(ev);
    }

    /// Exempt an event from freeing, so it can be posted any number of
    /// times. Typical for periodic ticks.
    pub fn event_reserve(&self, ev: EventRef) {
        critical_section(|cs| self.state.borrow_mut(cs).events.mark_static(ev));
    }

    pub fn event_unreserve(&self, ev: EventRef) {
        critical_section(|cs| self.state.borrow_mut(cs).events.unmark_static(ev));
    }

    /// Record an extra owner of `ev`.
    pub fn event_add_reference(&self, ev: EventRef) {
        critical_section(|cs| self.state.borrow_mut(cs).events.add_reference(ev));
    }

    pub fn event_id(&self, ev: EventRef) -> EventId {
        critical_section(|cs| self.state.borrow(cs).events.id(ev))
    }

    /// Priority that was running when `ev` was created.
    pub fn event_generator(&self, ev: EventRef) -> Option<Priority> {
        critical_section(|cs| self.state.borrow(cs).events.generator(ev))
    }

    pub fn event_timestamp(&self, ev: EventRef) -> u32 {
        critical_section(|cs| self.state.borrow(cs).events.timestamp(ev))
    }

    /// Run `f` over the payload of `ev` inside a critical section.
    pub fn with_payload<R>(&self, ev: EventRef, f: impl FnOnce(&[u8]) -> R) -> R {
        critical_section(|cs| f(self.state.borrow(cs).events.payload(ev)))
    }

    pub fn with_payload_mut<R>(&self, ev: EventRef, f: impl FnOnce(&mut [u8]) -> R) -> R {
        critical_section(|cs| f(self.state.borrow_mut(cs).events.payload_mut(ev)))
    }

    pub fn heap_stats(&self) -> HeapStats {
        critical_section(|cs| self.state.borrow(cs).events.heap().stats())
    }

    // -----------------------------------------------------------------------
    // Posting
    // -----------------------------------------------------------------------

    /// Queue `ev` at the tail of `to`'s queue, handing over the caller's
    /// reference. On `QueueFull` the caller keeps it.
    pub fn post(&self, to: EpaHandle, ev: EventRef) -> Result<(), KernelError> {
        critical_section(|cs| self.post_i(cs, to, ev))
    }

    pub fn post_i(
        &self,
        cs: CriticalSection<'_>,
        to: EpaHandle,
        ev: EventRef,
    ) -> Result<(), KernelError> {
        self.enqueue(cs, to, ev, false)
    }

    /// Queue `ev` ahead of everything pending for `to`.
    pub fn post_ahead(&self, to: EpaHandle, ev: EventRef) -> Result<(), KernelError> {
        critical_section(|cs| self.post_ahead_i(cs, to, ev))
    }

    pub fn post_ahead_i(
        &self,
        cs: CriticalSection<'_>,
        to: EpaHandle,
        ev: EventRef,
    ) -> Result<(), KernelError> {
        self.enqueue(cs, to, ev, true)
    }

    /// Post one event to several EPAs.
    ///
    /// Each target gets its own reference. A target whose queue is full is
    /// skipped and its reference released, so the caller never has to
    /// clean up; the first error is returned after every target was tried.
    pub fn publish(&self, ev: EventRef, targets: &[EpaHandle]) -> Result<(), KernelError> {
        critical_section(|cs| {
            {
                let mut st = self.state.borrow_mut(cs);
                if targets.is_empty() {
                    st.events.release(ev);
                    return Ok(());
                }
                for _ in 1..targets.len() {
                    st.events.add_reference(ev);
                }
            }
            let mut first_err = None;
            for &to in targets {
                if let Err(e) = self.enqueue(cs, to, ev, false) {
                    self.state.borrow_mut(cs).events.release(ev);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
            first_err.map_or(Ok(()), Err)
        })
    }

    fn enqueue(
        &self,
        cs: CriticalSection<'_>,
        to: EpaHandle,
        ev: EventRef,
        ahead: bool,
    ) -> Result<(), KernelError> {
        let mut st = self.state.borrow_mut(cs);
        let st = &mut *st;
        let id = st.events.id(ev);
        let slot = st.slot_mut(to)?;
        let p = slot.priority;
        let name = slot.agent.definition().name;
        let pushed = if ahead {
            slot.queue.push_front(ev)
        } else {
            slot.queue.push_back(ev)
        };
        let started = slot.started;
        match pushed {
            Ok(was_empty) => {
                log::trace!("post {:?} -> {} (prio {})", id, name, p);
                if was_empty && started {
                    st.ready.insert(p);
                    if st.status == KernelStatus::Running && outranks(p, st.running) {
                        self.port.notify_ready(p);
                    }
                }
                Ok(())
            }
            Err(Full) => {
                log::warn!("queue of {} (prio {}) full, {:?} not posted", name, p, id);
                Err(KernelError::QueueFull(p))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
