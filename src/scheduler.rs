//! # Scheduler
//!
//! The drain loop. One call to [`Kernel::schedule`] dispatches events, one
//! per iteration, to every ready EPA that outranks the priority running
//! when the call was made, most urgent first.
//!
//! ## Preemption
//!
//! There is no context switch. An interrupt that makes a more urgent EPA
//! ready pends the scheduler (`Port::notify_ready`, PendSV on Cortex-M4);
//! the nested `schedule` call drains everything above the interrupted
//! frame's priority and returns into it. The native call stack is the
//! stack of running priorities:
//!
//! ```text
//!   thread   schedule()                         running = None
//!              dispatch -> EPA 5                running = 5
//!   PendSV       schedule()                     saved   = 5
//!                  dispatch -> EPA 9            running = 9
//!                returns                        running = 5
//!              EPA 5 resumes
//! ```
//!
//! ## Per-event cycle
//!
//! 1. Locked: running = highest ready priority; pop one event, clearing
//!    the ready bit if the queue became empty.
//! 2. Unlocked: dispatch to the EPA's state machine.
//! 3. Locked: on `Deferred`, add a reference and push the event back to the
//!    tail; release the dispatch reference; select the next priority.
//!
//! The loop ends when nothing outranks the saved priority, which is then
//! restored.

use crate::contract::violated;
use crate::epa::{Context, Dispatch, EpaHandle, Priority};
use crate::event::{Event, EventId, EventRef};
use crate::hsm::Dispatched;
use crate::kernel::{outranks, Kernel, KernelStatus};
use crate::queue::Full;
use crate::sync::{critical_section, CriticalSection};

/// An event taken off a queue, on its way to dispatch.
struct Job<'a> {
    handle: EpaHandle,
    priority: Priority,
    agent: &'a dyn Dispatch,
    ev: EventRef,
    id: EventId,
}

impl<'a> Kernel<'a> {
    /// Drain every ready EPA above the current running priority.
    ///
    /// Call from the thread loop after `start`, and from the interrupt the
    /// port pends in `notify_ready`. No-op on a stopped kernel.
    pub fn schedule(&self) {
        let saved = critical_section(|cs| {
            let st = self.state.borrow(cs);
            if st.status != KernelStatus::Running {
                return None;
            }
            match st.ready.highest() {
                Some(p) if outranks(p, st.running) => Some(st.running),
                _ => None,
            }
        });
        let Some(saved) = saved else {
            return;
        };

        let mut next = critical_section(|cs| self.begin_next(cs, saved));
        while let Some(job) = next {
            let ctx = Context::new(self, job.handle);
            let ev = Event::heap(job.id, job.ev);
            let outcome = job.agent.dispatch(&ctx, &ev);
            log::trace!(
                "{} (prio {}) {:?}: {:?}",
                job.agent.definition().name,
                job.priority,
                job.id,
                outcome
            );
            next = critical_section(|cs| {
                self.complete(cs, &job, outcome);
                self.begin_next(cs, saved)
            });
        }
    }

    /// Select the most urgent ready EPA above `saved` and take its next
    /// event. Restores `saved` as the running priority when there is none.
    fn begin_next(&self, cs: CriticalSection<'_>, saved: Option<Priority>) -> Option<Job<'a>> {
        let mut st = self.state.borrow_mut(cs);
        let st = &mut *st;
        loop {
            let p = match st.ready.highest() {
                Some(p) if outranks(p, saved) => p,
                _ => {
                    st.running = saved;
                    return None;
                }
            };
            let Some(handle) = st.by_prio[p as usize] else {
                violated!("ready bit set for an unregistered priority");
                st.ready.remove(p);
                continue;
            };
            let Some(slot) = st.lookup_mut(handle) else {
                violated!("ready bit set for a destroyed EPA");
                st.ready.remove(p);
                continue;
            };
            let Some(ev) = slot.queue.pop_front() else {
                violated!("fetch from an empty event queue");
                st.ready.remove(p);
                continue;
            };
            let agent = slot.agent;
            if slot.queue.is_empty() {
                st.ready.remove(p);
            }
            st.running = Some(p);
            st.dispatching.insert(p);
            return Some(Job {
                handle,
                priority: p,
                agent,
                ev,
                id: st.events.id(ev),
            });
        }
    }

    /// Finish a dispatched event: push it back if it was deferred, then
    /// drop the reference the queue handed to the dispatch.
    fn complete(&self, cs: CriticalSection<'_>, job: &Job<'a>, outcome: Dispatched) {
        let mut st = self.state.borrow_mut(cs);
        let st = &mut *st;
        st.dispatching.remove(job.priority);
        if outcome == Dispatched::Deferred {
            st.events.add_reference(job.ev);
            let pushed = st.lookup_mut(job.handle).map(|slot| {
                let name = slot.agent.definition().name;
                (slot.queue.push_back(job.ev), slot.started, slot.priority, name)
            });
            match pushed {
                Some((Ok(true), true, p, _)) => st.ready.insert(p),
                Some((Ok(_), ..)) => {}
                Some((Err(Full), _, _, name)) => {
                    log::warn!("{}: queue full, deferred {:?} dropped", name, job.id);
                    st.events.release(job.ev);
                }
                None => {
                    log::warn!("deferred {:?} dropped: EPA destroyed", job.id);
                    st.events.release(job.ev);
                }
            }
        }
        st.events.release(job.ev);
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::arch::Port;
    use crate::epa::{Context, EpaHandle, Priority};
    use crate::event::{Event, EventId};
    use crate::kernel::tests::{no_mem, probe, taken, Trace, PORT};
    use crate::kernel::Kernel;
    use std::sync::Mutex;

    const WAKE: EventId = EventId(40);
    const URGENT: EventId = EventId(50);

    /// Reads the packed handle at `at` in a payload.
    fn handle_at(at: usize) -> impl Fn(&[u8]) -> EpaHandle {
        move |b: &[u8]| EpaHandle::from_bits(u16::from_le_bytes([b[at], b[at + 1]]))
    }

    /// Posts `URGENT` to the EPA named at the start of the payload, then
    /// lets it preempt.
    fn escalate(ctx: &Context<'_, '_>, ev: &Event) {
        if ev.id() != WAKE {
            return;
        }
        let target = ctx.payload(ev, handle_at(0)).unwrap();
        let urgent = ctx.create(URGENT, &[]).unwrap();
        ctx.post(target, urgent).unwrap();
        ctx.kernel().schedule();
    }

    #[test]
    fn test_preemption_sandwich() {
        let trace = Trace::default();
        let low = probe("low", 5, &trace, Some(escalate));
        let high = probe("high", 9, &trace, None);
        let kernel = Kernel::new(&PORT);
        let hl = kernel.epa_create(&mut no_mem(), &low).unwrap();
        let hh = kernel.epa_create(&mut no_mem(), &high).unwrap();
        kernel.start();
        let fresh = kernel.heap_stats().free;

        let wake = kernel
            .event_create_from(WAKE, &hh.to_bits().to_le_bytes())
            .unwrap();
        kernel.post(hl, wake).unwrap();
        kernel.schedule();

        assert_eq!(taken(&trace), ["low:40", "high:50", "low:done@Some(5)"]);
        assert_eq!(kernel.running(), None);
        assert_eq!(kernel.heap_stats().free, fresh);
    }

    #[test]
    #[should_panic(expected = "priority change while the EPA is dispatching")]
    fn test_priority_change_of_preempted_epa_is_fatal() {
        /// Wakes the EPA named in the payload with an event naming itself.
        fn wake_with_me(ctx: &Context<'_, '_>, ev: &Event) {
            if ev.id() != WAKE {
                return;
            }
            let target = ctx.payload(ev, handle_at(0)).unwrap();
            let urgent = ctx.create(URGENT, &ctx.me().to_bits().to_le_bytes()).unwrap();
            ctx.post(target, urgent).unwrap();
            ctx.kernel().schedule();
        }
        /// Tries to lift the sender above itself.
        fn promote_sender(ctx: &Context<'_, '_>, ev: &Event) {
            if ev.id() != URGENT {
                return;
            }
            let sender = ctx.payload(ev, handle_at(0)).unwrap();
            let _ = ctx.kernel().epa_set_priority(sender, 12);
        }
        let trace = Trace::default();
        let low = probe("low", 5, &trace, Some(wake_with_me));
        let high = probe("high", 9, &trace, Some(promote_sender));
        let kernel = Kernel::new(&PORT);
        let hl = kernel.epa_create(&mut no_mem(), &low).unwrap();
        let hh = kernel.epa_create(&mut no_mem(), &high).unwrap();
        kernel.start();

        let wake = kernel
            .event_create_from(WAKE, &hh.to_bits().to_le_bytes())
            .unwrap();
        kernel.post(hl, wake).unwrap();
        kernel.schedule();
    }

    #[test]
    fn test_priority_change_after_frame_returns() {
        fn wake(ctx: &Context<'_, '_>, ev: &Event) {
            if ev.id() != WAKE {
                return;
            }
            let target = ctx.payload(ev, handle_at(0)).unwrap();
            ctx.post(target, ctx.create(URGENT, &[]).unwrap()).unwrap();
            ctx.kernel().schedule();
        }
        let trace = Trace::default();
        let low = probe("low", 5, &trace, Some(wake));
        let high = probe("high", 9, &trace, None);
        let kernel = Kernel::new(&PORT);
        let hl = kernel.epa_create(&mut no_mem(), &low).unwrap();
        let hh = kernel.epa_create(&mut no_mem(), &high).unwrap();
        kernel.start();
        let wake_ev = kernel
            .event_create_from(WAKE, &hh.to_bits().to_le_bytes())
            .unwrap();
        kernel.post(hl, wake_ev).unwrap();
        kernel.schedule();
        assert_eq!(taken(&trace), ["low:40", "high:50", "low:done@Some(5)"]);

        kernel.epa_set_priority(hl, 12).unwrap();
        assert_eq!(kernel.epa_priority(hl), Ok(12));
    }

    #[test]
    fn test_nested_schedule_ignores_less_urgent_work() {
        let trace = Trace::default();
        let high = probe("high", 9, &trace, Some(escalate));
        let low = probe("low", 5, &trace, None);
        let kernel = Kernel::new(&PORT);
        let hh = kernel.epa_create(&mut no_mem(), &high).unwrap();
        let hl = kernel.epa_create(&mut no_mem(), &low).unwrap();
        kernel.start();

        // The nested call made from priority 9 must not run priority 5.
        let wake = kernel
            .event_create_from(WAKE, &hl.to_bits().to_le_bytes())
            .unwrap();
        kernel.post(hh, wake).unwrap();
        kernel.schedule();

        assert_eq!(taken(&trace), ["high:40", "high:done@Some(9)", "low:50"]);
    }

    #[test]
    fn test_schedule_is_noop_when_stopped_or_idle() {
        let trace = Trace::default();
        let agent = probe("p", 1, &trace, None);
        let kernel = Kernel::new(&PORT);
        let h = kernel.epa_create(&mut no_mem(), &agent).unwrap();
        kernel.post(h, kernel.event_create(0, WAKE).unwrap()).unwrap();

        kernel.schedule();
        assert!(taken(&trace).is_empty());

        kernel.start();
        kernel.schedule();
        assert_eq!(taken(&trace), ["p:40"]);
    }

    #[test]
    fn test_priority_zero_is_scheduled() {
        let trace = Trace::default();
        let agent = probe("zero", 0, &trace, None);
        let kernel = Kernel::new(&PORT);
        let h = kernel.epa_create(&mut no_mem(), &agent).unwrap();
        kernel.post(h, kernel.event_create(0, WAKE).unwrap()).unwrap();
        kernel.start();
        assert_eq!(taken(&trace), ["zero:40"]);
    }

    /// Records every `notify_ready` call.
    #[derive(Default)]
    struct Pender {
        pended: Mutex<Vec<Priority>>,
    }

    impl Port for Pender {
        fn notify_ready(&self, p: Priority) {
            self.pended.lock().unwrap().push(p);
        }
    }

    #[test]
    fn test_notify_only_when_target_outranks_running() {
        fn post_both(ctx: &Context<'_, '_>, ev: &Event) {
            if ev.id() != WAKE {
                return;
            }
            let targets = ctx
                .payload(ev, |b| [handle_at(0)(b), handle_at(2)(b)])
                .unwrap();
            for target in targets {
                let e = ctx.create(URGENT, &[]).unwrap();
                ctx.post(target, e).unwrap();
            }
        }
        let pender = Pender::default();
        let trace = Trace::default();
        let low = probe("low", 2, &trace, None);
        let mid = probe("mid", 4, &trace, Some(post_both));
        let high = probe("high", 6, &trace, None);
        let kernel = Kernel::new(&pender);
        let hl = kernel.epa_create(&mut no_mem(), &low).unwrap();
        let hm = kernel.epa_create(&mut no_mem(), &mid).unwrap();
        let hh = kernel.epa_create(&mut no_mem(), &high).unwrap();
        kernel.start();
        pender.pended.lock().unwrap().clear();

        let mut pair = [0u8; 4];
        pair[..2].copy_from_slice(&hl.to_bits().to_le_bytes());
        pair[2..].copy_from_slice(&hh.to_bits().to_le_bytes());
        let wake = kernel.event_create_from(WAKE, &pair).unwrap();
        kernel.post(hm, wake).unwrap();
        assert_eq!(*pender.pended.lock().unwrap(), [4]);

        kernel.schedule();
        // Only the post to 6 from inside priority 4 outranks it.
        assert_eq!(*pender.pended.lock().unwrap(), [4, 6]);
        assert_eq!(
            taken(&trace),
            ["mid:40", "mid:done@Some(4)", "high:50", "low:50"]
        );
    }
}
