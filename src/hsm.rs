//! # Hierarchical State Machines
//!
//! A state machine is an application type implementing [`StateMachine`]:
//! its states are values of an enum, and one `handle` function answers
//! every event for every state. Nesting is expressed through answers rather
//! than data: a state that does not handle an event answers
//! `Response::Super(parent)`, and the dispatcher retries the event one
//! level up. The implicit [`StateMachine::TOP`] state ignores everything
//! and is the root of every hierarchy.
//!
//! The dispatcher owns the bookkeeping: the current leaf state, and two
//! scratch paths used to compute transitions. A transition from a source
//! state to a target state exits every state from the current leaf up to
//! (not including) their least common ancestor, then enters every state
//! from below that ancestor down to the target, then chases initial
//! transitions (`INIT`) until the leaf settles.
//!
//! Reserved pseudo-events:
//!
//! | event   | expected answer                                   |
//! |---------|---------------------------------------------------|
//! | `SUPER` | `Super(parent)`                                   |
//! | `ENTRY` | `Handled`, `Ignored` or `Super`; never transition |
//! | `EXIT`  | `Handled`, `Ignored` or `Super`; never transition |
//! | `INIT`  | `Transition(child)` to drill down, else anything  |
//!
//! ```text
//!            TOP
//!           /   \
//!          A     D
//!         / \     \
//!        B   C     E
//!
//!   B -> C : EXIT(B)          ENTRY(C)
//!   B -> E : EXIT(B) EXIT(A)  ENTRY(D) ENTRY(E)
//!   B -> B : EXIT(B)          ENTRY(B)
//! ```

use core::fmt;

use crate::config::MAX_NEST_DEPTH;
use crate::contract::{require, violated};
use crate::epa::{Context, Dispatch, EpaDef};
use crate::event::Event;
use crate::sync::AgentCell;

/// A state handler's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response<S> {
    Handled,
    Ignored,
    /// Put the event back at the tail of this EPA's queue.
    Deferred,
    Transition(S),
    /// Not handled here; try the parent state.
    Super(S),
}

/// Outcome of dispatching one event, as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Handled,
    Ignored,
    Deferred,
    Transitioned,
}

/// Hierarchical machines walk ancestor chains on transitions; flat machines
/// have no superstates and transition with a single EXIT/ENTRY pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Hierarchical,
    Flat,
}

pub trait StateMachine: Send + 'static {
    type State: Copy + Eq + fmt::Debug + Send;

    /// Root of the hierarchy. Its handler must ignore everything and must
    /// never be a transition target.
    const TOP: Self::State;

    fn handle(
        &mut self,
        state: Self::State,
        ctx: &Context<'_, '_>,
        ev: &Event,
    ) -> Response<Self::State>;
}

/// Dispatcher state for one machine.
pub struct Hsm<M: StateMachine> {
    current: M::State,
    initial: M::State,
    kind: Kind,
    max_depth: usize,
    exit_path: [M::State; MAX_NEST_DEPTH],
    entry_path: [M::State; MAX_NEST_DEPTH],
}

impl<M: StateMachine> Hsm<M> {
    /// `initial` is the pseudo-state whose `INIT` answer names the first
    /// real state.
    pub const fn new(initial: M::State, kind: Kind, max_depth: usize) -> Self {
        Self {
            current: M::TOP,
            initial,
            kind,
            max_depth,
            exit_path: [M::TOP; MAX_NEST_DEPTH],
            entry_path: [M::TOP; MAX_NEST_DEPTH],
        }
    }

    #[inline]
    pub fn current(&self) -> M::State {
        self.current
    }

    #[inline]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    fn depth(&self) -> usize {
        self.max_depth.clamp(2, MAX_NEST_DEPTH)
    }

    /// Take the initial transition and settle into the first leaf state.
    pub fn start(&mut self, app: &mut M, ctx: &Context<'_, '_>) {
        require!(
            self.max_depth >= 2 && self.max_depth <= MAX_NEST_DEPTH,
            "hierarchy depth out of range"
        );
        let target = match app.handle(self.initial, ctx, &Event::INIT) {
            Response::Transition(t) => t,
            _ => {
                violated!("initial pseudo-state must answer INIT with a transition");
                return;
            }
        };
        log::trace!("start -> {:?}", target);
        match self.kind {
            Kind::Hierarchical => {
                self.current = M::TOP;
                self.transition(app, ctx, M::TOP, target);
                self.drill(app, ctx);
            }
            Kind::Flat => {
                self.current = target;
                Self::enter(app, ctx, target);
            }
        }
    }

    /// Run one event to completion.
    pub fn dispatch(&mut self, app: &mut M, ctx: &Context<'_, '_>, ev: &Event) -> Dispatched {
        require!(!ev.id().is_reserved(), "pseudo-events are never dispatched");
        let depth = self.depth();
        let mut s = self.current;
        let mut hops = 0;
        loop {
            match app.handle(s, ctx, ev) {
                Response::Handled => return Dispatched::Handled,
                Response::Ignored => return Dispatched::Ignored,
                Response::Deferred => return Dispatched::Deferred,
                Response::Super(parent) => {
                    if self.kind == Kind::Flat {
                        violated!("flat machines have no superstates");
                        return Dispatched::Ignored;
                    }
                    hops += 1;
                    if hops >= depth {
                        violated!("event bubbled past the configured hierarchy depth");
                        return Dispatched::Ignored;
                    }
                    s = parent;
                }
                Response::Transition(target) => {
                    log::trace!("{:?}: {:?} -> {:?}", ev.id(), s, target);
                    match self.kind {
                        Kind::Hierarchical => {
                            self.transition(app, ctx, s, target);
                            self.drill(app, ctx);
                        }
                        Kind::Flat => {
                            Self::exit(app, ctx, self.current);
                            self.current = target;
                            Self::enter(app, ctx, target);
                        }
                    }
                    return Dispatched::Transitioned;
                }
            }
        }
    }

    fn enter(app: &mut M, ctx: &Context<'_, '_>, s: M::State) {
        match app.handle(s, ctx, &Event::ENTRY) {
            Response::Handled | Response::Ignored | Response::Super(_) => {}
            Response::Transition(_) | Response::Deferred => {
                violated!("ENTRY must not transition or defer")
            }
        }
    }

    fn exit(app: &mut M, ctx: &Context<'_, '_>, s: M::State) {
        match app.handle(s, ctx, &Event::EXIT) {
            Response::Handled | Response::Ignored | Response::Super(_) => {}
            Response::Transition(_) | Response::Deferred => {
                violated!("EXIT must not transition or defer")
            }
        }
    }

    fn parent(app: &mut M, ctx: &Context<'_, '_>, s: M::State) -> M::State {
        match app.handle(s, ctx, &Event::SUPER) {
            Response::Super(p) => p,
            _ => {
                violated!("superstate query must be answered with Super");
                M::TOP
            }
        }
    }

    /// Fill `path` with `s` and its ancestors, ending at `TOP`. Returns the
    /// number of entries written.
    fn ancestry(
        app: &mut M,
        ctx: &Context<'_, '_>,
        mut s: M::State,
        path: &mut [M::State; MAX_NEST_DEPTH],
        depth: usize,
    ) -> usize {
        let mut n = 0;
        loop {
            if n == depth {
                violated!("state nesting deeper than the configured hierarchy depth");
                path[n - 1] = M::TOP;
                return n;
            }
            path[n] = s;
            n += 1;
            if s == M::TOP {
                return n;
            }
            s = Self::parent(app, ctx, s);
        }
    }

    /// Move from the current leaf to `target` on behalf of `source`, the
    /// state whose handler requested the transition.
    fn transition(
        &mut self,
        app: &mut M,
        ctx: &Context<'_, '_>,
        source: M::State,
        target: M::State,
    ) {
        require!(target != M::TOP, "the top state is never a transition target");
        let depth = self.depth();
        let na = Self::ancestry(app, ctx, source, &mut self.exit_path, depth);
        let nb = Self::ancestry(app, ctx, target, &mut self.entry_path, depth);

        // Both paths end at TOP; count how far they agree from that end.
        let mut shared = 0;
        while shared < na
            && shared < nb
            && self.exit_path[na - 1 - shared] == self.entry_path[nb - 1 - shared]
        {
            shared += 1;
        }
        // Self-transitions and transitions to an ancestor of the source
        // leave and re-enter the target, so the LCA is the target's parent.
        let lca_at = (nb - shared).max(1);
        let lca = self.entry_path[lca_at];

        let mut s = self.current;
        let mut hops = 0;
        while s != lca {
            if hops == depth {
                violated!("transition source is not an ancestor of the current state");
                break;
            }
            Self::exit(app, ctx, s);
            s = Self::parent(app, ctx, s);
            hops += 1;
        }
        for i in (0..lca_at).rev() {
            Self::enter(app, ctx, self.entry_path[i]);
        }
        self.current = target;
    }

    /// Follow `INIT` transitions from the current state until one is
    /// declined.
    fn drill(&mut self, app: &mut M, ctx: &Context<'_, '_>) {
        let depth = self.depth();
        let mut hops = 0;
        loop {
            match app.handle(self.current, ctx, &Event::INIT) {
                Response::Transition(t) => {
                    if hops == depth {
                        violated!("initial transitions do not settle within the hierarchy depth");
                        return;
                    }
                    hops += 1;
                    let from = self.current;
                    self.transition(app, ctx, from, t);
                }
                Response::Deferred => {
                    violated!("INIT must not defer");
                    return;
                }
                _ => return,
            }
        }
    }
}

struct Machine<M: StateMachine> {
    app: M,
    hsm: Hsm<M>,
}

/// An application state machine bound to its EPA definition, ready to be
/// handed to `Kernel::epa_create`. Usually a `static`.
pub struct Agent<M: StateMachine> {
    def: EpaDef,
    cell: AgentCell<Machine<M>>,
}

impl<M: StateMachine> Agent<M> {
    pub const fn new(def: EpaDef, app: M, initial: M::State) -> Self {
        Self::with_kind(def, app, initial, Kind::Hierarchical)
    }

    /// An agent whose machine has no nesting.
    pub const fn flat(def: EpaDef, app: M, initial: M::State) -> Self {
        Self::with_kind(def, app, initial, Kind::Flat)
    }

    const fn with_kind(def: EpaDef, app: M, initial: M::State, kind: Kind) -> Self {
        let hsm = Hsm::new(initial, kind, def.max_depth);
        Self {
            def,
            cell: AgentCell::new(Machine { app, hsm }),
        }
    }

    /// Look at the application data and current state between dispatches.
    ///
    /// `None` while the agent is handling an event, including from inside
    /// its own handler.
    pub fn inspect<R>(&self, f: impl FnOnce(&M, M::State) -> R) -> Option<R> {
        let m = self.cell.claim()?;
        Some(f(&m.app, m.hsm.current()))
    }

    pub fn current(&self) -> Option<M::State> {
        self.inspect(|_, state| state)
    }
}

impl<M: StateMachine> Dispatch for Agent<M> {
    fn definition(&self) -> &EpaDef {
        &self.def
    }

    fn start(&self, ctx: &Context<'_, '_>) {
        let Some(mut m) = self.cell.claim() else {
            violated!("agent started while it is dispatching");
            return;
        };
        let Machine { app, hsm } = &mut *m;
        hsm.start(app, ctx);
    }

    fn dispatch(&self, ctx: &Context<'_, '_>, ev: &Event) -> Dispatched {
        let Some(mut m) = self.cell.claim() else {
            violated!("agent dispatched re-entrantly");
            return Dispatched::Ignored;
        };
        let Machine { app, hsm } = &mut *m;
        hsm.dispatch(app, ctx, ev)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
