//! # Kernel Configuration
//!
//! Compile-time constants governing the kernel tables and the event heap.
//! All limits are fixed at compile time; nothing is allocated dynamically.

/// Number of distinct EPA priorities, and therefore the maximum number of
/// EPAs registered at once. Priorities run `0..MAX_EPA`; a larger number is
/// more urgent. Must be a multiple of 32 and below 256: event headers
/// store the generator priority in one byte and keep 0xFF for "none".
pub const MAX_EPA: usize = 64;

/// Upper bound on any single EPA's event queue depth. Each EPA's ring is
/// stored inline at this size; `EpaDef::queue_depth` picks the usable part.
pub const QUEUE_MAX: usize = 16;

/// Maximum state nesting depth, counting the top state. Bounds the two
/// scratch paths in every `Hsm` and the length of any superstate walk.
pub const MAX_NEST_DEPTH: usize = 8;

/// Size of the kernel's event heap in bytes. Must be a multiple of
/// `HEAP_GRANULE`.
pub const EVENT_HEAP_BYTES: usize = 4096;

/// Allocation granule of the event heap. Every block (header included) is
/// a whole number of granules.
pub const HEAP_GRANULE: usize = 8;

/// SysTick frequency in Hz. Only used by the demo firmware to pace its
/// tick event; the kernel itself has no notion of time.
pub const TICK_HZ: u32 = 1000;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

const _: () = assert!(MAX_EPA % 32 == 0 && MAX_EPA < 256);
const _: () = assert!(EVENT_HEAP_BYTES % HEAP_GRANULE == 0);
const _: () = assert!(QUEUE_MAX <= u8::MAX as usize);
