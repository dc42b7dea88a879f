//! # Contract Checks
//!
//! Precondition and protocol checks for argument errors and usage
//! violations. A failed check is fatal: it logs the violation, runs the
//! application's hook (if any), then panics. On target `panic-halt` parks
//! the core so a debugger can inspect it.
//!
//! Checks are active when `debug_assertions` is on or the `contracts`
//! feature is enabled, and compiled out otherwise. Release builds without
//! `contracts` trade the checks for size and speed; misuse then goes
//! undetected.

use core::cell::Cell;
use core::fmt;

use critical_section::Mutex;

/// Diagnostic context handed to the violation hook.
#[derive(Debug, Clone, Copy)]
pub struct Violation<'a> {
    /// Module path of the failing check.
    pub module: &'a str,
    /// Text of the condition that did not hold.
    pub condition: &'a str,
    pub file: &'a str,
    pub line: u32,
}

impl fmt::Display for Violation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "contract violated in {} ({}:{}): {}",
            self.module, self.file, self.line, self.condition
        )
    }
}

static HOOK: Mutex<Cell<Option<fn(&Violation<'_>)>>> = Mutex::new(Cell::new(None));

/// Install a function to run on every contract violation before the kernel
/// panics. Typical uses: flush a trace buffer, light an error LED, or
/// trigger a breakpoint.
pub fn set_violation_hook(hook: fn(&Violation<'_>)) {
    critical_section::with(|cs| HOOK.borrow(cs).set(Some(hook)));
}

/// Whether `require!` checks are compiled into this build.
pub const CHECKED: bool = cfg!(any(debug_assertions, feature = "contracts"));

/// Report a violated contract. Never returns.
#[cold]
#[inline(never)]
pub fn violation(module: &str, condition: &str, file: &str, line: u32) -> ! {
    let v = Violation {
        module,
        condition,
        file,
        line,
    };
    log::error!("{}", v);
    let hook = critical_section::with(|cs| HOOK.borrow(cs).get());
    if let Some(hook) = hook {
        hook(&v);
    }
    panic!("{}", v);
}

/// Check a kernel contract. Compiled out unless `CHECKED`.
macro_rules! require {
    ($cond:expr, $what:literal) => {
        if $crate::contract::CHECKED && !($cond) {
            $crate::contract::violation(module_path!(), $what, file!(), line!());
        }
    };
}

/// Unconditionally report a contract violation from a checked build.
/// In unchecked builds this expands to nothing and execution continues.
macro_rules! violated {
    ($what:literal) => {
        if $crate::contract::CHECKED {
            $crate::contract::violation(module_path!(), $what, file!(), line!());
        }
    };
}

pub(crate) use require;
pub(crate) use violated;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checks_active_in_test_builds() {
        assert!(CHECKED);
    }

    #[test]
    #[should_panic(expected = "queue must not be empty")]
    fn test_require_panics_with_condition() {
        let len = 0;
        require!(len > 0, "queue must not be empty");
    }

    #[test]
    fn test_require_passes() {
        require!(1 + 1 == 2, "arithmetic");
    }

    #[test]
    fn test_violation_hook_runs_before_panic() {
        use core::sync::atomic::{AtomicBool, Ordering};

        static HOOKED: AtomicBool = AtomicBool::new(false);
        fn record(v: &Violation<'_>) {
            if v.condition == "hooked check" {
                HOOKED.store(true, Ordering::SeqCst);
            }
        }
        set_violation_hook(record);

        let outcome = std::panic::catch_unwind(|| {
            require!(1 + 1 == 3, "hooked check");
        });
        assert!(outcome.is_err());
        assert!(HOOKED.load(Ordering::SeqCst));
    }

    #[test]
    fn test_violation_display() {
        let v = Violation {
            module: "epakernel::queue",
            condition: "len > 0",
            file: "src/queue.rs",
            line: 12,
        };
        let text = std::format!("{}", v);
        assert_eq!(
            text,
            "contract violated in epakernel::queue (src/queue.rs:12): len > 0"
        );
    }
}
