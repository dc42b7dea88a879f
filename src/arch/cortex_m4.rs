//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor.
//!
//! ## Scheduling Mechanism
//!
//! There is no context switch: EPAs are run-to-completion and share the
//! main stack. When an event makes a more urgent EPA ready,
//! [`CortexM4Port::notify_ready`] pends PendSV, and the application's
//! `PendSV` handler calls `Kernel::schedule`. Since PendSV runs at the
//! lowest exception priority it tail-chains after every other ISR and
//! preempts the thread-mode drain loop.
//!
//! PendSV cannot preempt itself: an EPA made ready while PendSV is
//! already draining runs once the current event completes, not in the
//! middle of it.
//!
//! ## Interrupt Priorities
//!
//! - SysTick: 0x80, so the tick can interrupt a PendSV drain
//! - PendSV: 0xFF (lowest), runs only when no other ISR is active

use core::fmt::Write as _;

use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{DCB, DWT, ITM, SYST};

use crate::arch::Port;
use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::epa::Priority;

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Kernel port for a single-core Cortex-M4.
pub struct CortexM4Port;

impl Port for CortexM4Port {
    #[inline]
    fn notify_ready(&self, _priority: Priority) {
        trigger_pendsv();
    }

    /// DWT cycle counter; see [`enable_cycle_counter`].
    #[inline]
    fn timestamp(&self) -> u32 {
        DWT::cycle_count()
    }
}

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure the SysTick timer to fire at `TICK_HZ` using the processor
/// clock. The kernel itself has no tick; the application's `SysTick`
/// handler typically posts a reserved tick event.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Start the DWT cycle counter used for event timestamps.
pub fn enable_cycle_counter(dcb: &mut DCB, dwt: &mut DWT) {
    dcb.enable_trace();
    DWT::unlock();
    dwt.enable_cycle_counter();
}

// ---------------------------------------------------------------------------
// PendSV trigger
// ---------------------------------------------------------------------------

/// Request a scheduler pass by pending PendSV.
///
/// Sets the PENDSVSET bit in the Interrupt Control and State Register (ICSR).
#[inline]
pub fn trigger_pendsv() {
    // ICSR address: 0xE000_ED04, PENDSVSET = bit 28
    const ICSR: *mut u32 = 0xE000_ED04 as *mut u32;
    unsafe {
        core::ptr::write_volatile(ICSR, 1 << 28);
    }
}

// ---------------------------------------------------------------------------
// Interrupt priority configuration
// ---------------------------------------------------------------------------

/// Put PendSV at the lowest priority and SysTick just above the middle.
pub fn set_interrupt_priorities() {
    unsafe {
        // System Handler Priority Register 3 (SHPR3): 0xE000_ED20
        // Bits [23:16] = PendSV priority
        // Bits [31:24] = SysTick priority
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = core::ptr::read_volatile(shpr3) & 0x0000_FFFF;
        let val = val | (0xFF << 16) | (0x80 << 24);
        core::ptr::write_volatile(shpr3, val);
    }
}

// ---------------------------------------------------------------------------
// ITM logging
// ---------------------------------------------------------------------------

/// `log` backend writing one line per record to ITM stimulus port 0.
pub struct ItmLogger {
    level: log::LevelFilter,
}

impl ItmLogger {
    pub const fn new(level: log::LevelFilter) -> Self {
        Self { level }
    }

    /// Install as the global logger.
    pub fn install(&'static self) -> Result<(), log::SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.level);
        Ok(())
    }
}

impl log::Log for ItmLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        critical_section::with(|_| unsafe {
            let stim = &mut (*ITM::PTR).stim[0];
            let mut out = StimWriter(stim);
            let _ = writeln!(out, "{:<5} {}: {}", record.level(), record.target(), record.args());
        });
    }

    fn flush(&self) {}
}

struct StimWriter<'s>(&'s mut cortex_m::peripheral::itm::Stim);

impl core::fmt::Write for StimWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        cortex_m::itm::write_str(self.0, s);
        Ok(())
    }
}
