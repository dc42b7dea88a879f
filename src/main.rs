//! # EPA Kernel Example Firmware
//!
//! Two agents on an STM32F4-class Cortex-M4:
//!
//! | Agent | Kind | Priority | Behavior |
//! |-------|------|----------|----------|
//! | `blinker` | Hierarchical | 2 | `Operating` ⊃ {`Off`, `On`}, toggles every half second |
//! | `monitor` | Flat | 5 | Logs every toggle reported by the blinker |
//!
//! SysTick posts one reserved `TICK` event to the blinker per millisecond,
//! from interrupt context, with `post_i`. The event is never freed. Each
//! time the blinker enters `On` it creates a `TOGGLED` event carrying the
//! toggle count and posts it to the monitor, which preempts it.
//!
//! Logging goes to ITM stimulus port 0.

#![no_std]
#![no_main]

use core::cell::Cell;

use cortex_m_rt::{entry, exception};
use critical_section::Mutex;
use panic_halt as _;

use epakernel::arch::cortex_m4::{self, CortexM4Port, ItmLogger};
use epakernel::config::TICK_HZ;
use epakernel::{
    Agent, Context, EpaDef, EpaHandle, Event, EventId, EventRef, Kernel, Response, StateMachine,
    StaticPool,
};

static PORT: CortexM4Port = CortexM4Port;
static KERNEL: Kernel<'static> = Kernel::new(&PORT);
static LOGGER: ItmLogger = ItmLogger::new(log::LevelFilter::Info);

const TICK: EventId = EventId::USER;
const TOGGLED: EventId = EventId(EventId::USER.0 + 1);

/// Target of the SysTick event, set once the blinker exists.
static TICK_TARGET: Mutex<Cell<Option<(EpaHandle, EventRef)>>> = Mutex::new(Cell::new(None));
static MONITOR_HANDLE: Mutex<Cell<Option<EpaHandle>>> = Mutex::new(Cell::new(None));

// ---------------------------------------------------------------------------
// Blinker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Led {
    Top,
    Init,
    Operating,
    Off,
    On,
}

struct Blinker {
    ticks: u32,
    toggles: u32,
}

const HALF_PERIOD: u32 = TICK_HZ / 2;

impl Blinker {
    fn count(&mut self, next: Led) -> Response<Led> {
        self.ticks += 1;
        if self.ticks < HALF_PERIOD {
            Response::Handled
        } else {
            Response::Transition(next)
        }
    }
}

impl StateMachine for Blinker {
    type State = Led;
    const TOP: Led = Led::Top;

    fn handle(&mut self, state: Led, ctx: &Context<'_, '_>, ev: &Event) -> Response<Led> {
        match (state, ev.id()) {
            (Led::Top, _) => Response::Ignored,
            (Led::Init, EventId::INIT) => Response::Transition(Led::Operating),

            (Led::Operating, EventId::ENTRY) => {
                log::info!("blinker operating");
                Response::Handled
            }
            (Led::Operating, EventId::INIT) => Response::Transition(Led::Off),

            (Led::Off, EventId::ENTRY) => {
                self.ticks = 0;
                Response::Handled
            }
            (Led::Off, TICK) => self.count(Led::On),

            (Led::On, EventId::ENTRY) => {
                self.ticks = 0;
                self.toggles = self.toggles.wrapping_add(1);
                report(ctx, self.toggles);
                Response::Handled
            }
            (Led::On, TICK) => self.count(Led::Off),

            (Led::Off | Led::On, _) => Response::Super(Led::Operating),
            (Led::Init | Led::Operating, _) => Response::Super(Led::Top),
        }
    }
}

fn report(ctx: &Context<'_, '_>, toggles: u32) {
    let Some(monitor) = critical_section::with(|cs| MONITOR_HANDLE.borrow(cs).get()) else {
        return;
    };
    match ctx.create(TOGGLED, &toggles.to_le_bytes()) {
        Ok(ev) => {
            if let Err(e) = ctx.post(monitor, ev) {
                log::warn!("toggle report lost: {}", e);
                ctx.kernel().event_destroy(ev);
            }
        }
        Err(e) => log::warn!("toggle report lost: {}", e),
    }
}

static BLINKER: Agent<Blinker> = Agent::new(
    EpaDef::new("blinker", 2).queue_depth(8).max_depth(3),
    Blinker {
        ticks: 0,
        toggles: 0,
    },
    Led::Init,
);

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mon {
    Top,
    Init,
    Watching,
}

struct Monitor;

impl StateMachine for Monitor {
    type State = Mon;
    const TOP: Mon = Mon::Top;

    fn handle(&mut self, state: Mon, ctx: &Context<'_, '_>, ev: &Event) -> Response<Mon> {
        match (state, ev.id()) {
            (Mon::Init, EventId::INIT) => Response::Transition(Mon::Watching),
            (Mon::Watching, TOGGLED) => {
                let count = ctx.payload(ev, |b| {
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(&b[..4]);
                    u32::from_le_bytes(raw)
                });
                log::info!(
                    "toggle #{} at cycle {}",
                    count.unwrap_or(0),
                    ev.body().map_or(0, |b| ctx.kernel().event_timestamp(b))
                );
                Response::Handled
            }
            _ => Response::Ignored,
        }
    }
}

static MONITOR: Agent<Monitor> = Agent::flat(
    EpaDef::new("monitor", 5).queue_depth(4).max_depth(2).workspace(64),
    Monitor,
    Mon::Init,
);

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Firmware entry point. Registers the agents, arms SysTick and drains
/// events forever.
#[entry]
fn main() -> ! {
    let mut cp = cortex_m::Peripherals::take().expect("core peripherals taken twice");
    cortex_m4::enable_cycle_counter(&mut cp.DCB, &mut cp.DWT);
    LOGGER.install().ok();

    KERNEL.init();

    // Agent workspaces live for the lifetime of the firmware.
    let mut pool: StaticPool<256> = StaticPool::new();
    let monitor = KERNEL
        .epa_create(&mut pool, &MONITOR)
        .expect("Failed to create monitor");
    let blinker = KERNEL
        .epa_create(&mut pool, &BLINKER)
        .expect("Failed to create blinker");
    critical_section::with(|cs| MONITOR_HANDLE.borrow(cs).set(Some(monitor)));

    let tick = KERNEL.event_create(0, TICK).expect("Failed to create tick");
    KERNEL.event_reserve(tick);
    critical_section::with(|cs| TICK_TARGET.borrow(cs).set(Some((blinker, tick))));

    cortex_m4::set_interrupt_priorities();
    cortex_m4::configure_systick(&mut cp.SYST);

    KERNEL.start();
    loop {
        KERNEL.schedule();
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// Exception handlers
// ---------------------------------------------------------------------------

#[exception]
fn SysTick() {
    critical_section::with(|cs| {
        if let Some((blinker, tick)) = TICK_TARGET.borrow(cs).get() {
            // A full queue means the blinker is behind; this tick is skipped.
            let _ = KERNEL.post_i(cs, blinker, tick);
        }
    });
}

#[exception]
fn PendSV() {
    KERNEL.schedule();
}
