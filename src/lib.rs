//! # EPA Kernel
//!
//! A small real-time kernel for event-driven embedded applications on ARM
//! Cortex-M4 microcontrollers.
//!
//! ## Overview
//!
//! Applications are built from **Event Processing Agents** (EPAs). Each
//! EPA owns a hierarchical state machine, an event queue and a unique
//! priority. Agents never block and never share state: they communicate
//! only by posting events to one another's queues.
//!
//! - **Run-to-completion**: each event is fully processed, including any
//!   chained transitions, before the same EPA sees the next one.
//! - **Preemptive by priority**: a more urgent EPA made ready by an
//!   interrupt (or by another EPA) runs to completion in a nested drain
//!   loop, then the interrupted EPA resumes. No per-EPA stacks.
//! - **Reference-counted events**: events live in a fixed event heap and
//!   are freed exactly when their last owner releases them. Reserved
//!   events are never freed and can be posted from interrupts repeatedly.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │             Application agents (hsm::Agent)             │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                  │
//! │   init · start · epa_create · event_create · post      │
//! ├──────────────┬────────────────────┬───────────────────┤
//! │  Scheduler   │   HSM Dispatcher   │  Sync Primitives  │
//! │  scheduler.rs│   hsm.rs           │  sync.rs          │
//! │  bitmap.rs   │   ─ transitions    │  ─ critical_section│
//! │  ─ schedule()│   ─ INIT chasing   │  ─ KernelCell     │
//! ├──────────────┴────────────────────┴───────────────────┤
//! │   Events (event.rs) · Queues (queue.rs) · Heap (heap.rs)│
//! ├────────────────────────────────────────────────────────┤
//! │            Arch Port (arch/cortex_m4.rs)                │
//! │        PendSV · SysTick · DWT timestamps · ITM          │
//! ├────────────────────────────────────────────────────────┤
//! │         ARM Cortex-M4 Hardware (Thumb-2)                │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **No `alloc`**: Pure `core` only
//! - **Fixed tables**: `MAX_EPA` registry slots, inline queues of
//!   `QUEUE_MAX` entries
//! - **Event heap**: `EVENT_HEAP_BYTES` inside the kernel, handles are
//!   16-bit granule indices
//! - **Critical sections**: the `critical-section` crate; all shared
//!   kernel state sits in a `KernelCell`
//!
//! ## Contracts
//!
//! Usage errors (bad handles, duplicate priorities, invalid handler
//! answers) are checked by `require!` when `debug_assertions` or the
//! `contracts` feature is on, and are fatal. Resource exhaustion is
//! reported as [`KernelError`].

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod bitmap;
pub mod config;
pub mod contract;
pub mod epa;
pub mod error;
pub mod event;
pub mod heap;
pub mod hsm;
pub mod kernel;
pub mod queue;
pub mod scheduler;
pub mod sync;

pub use arch::{HostPort, Port};
pub use epa::{Context, Dispatch, EpaDef, EpaHandle, Priority};
pub use error::KernelError;
pub use event::{Event, EventId, EventRef};
pub use heap::{Arena, BlockRef, Heap, HeapStats, MemClass, StaticPool};
pub use hsm::{Agent, Dispatched, Hsm, Kind, Response, StateMachine};
pub use kernel::{Kernel, KernelStatus};
pub use queue::QueueStats;
