//! x86_64 hardware implementation.
//!
//! CPU identity comes from the initial APIC id, and interrupt masking from the `x86_64`
//! crate. Blocking is delegated to whatever scheduler the kernel installs; until one is
//! installed (early boot, a single context per CPU) waiters spin.

use core::arch::x86_64::__cpuid;

use super::ContextId;
use crate::cpu::MAX_CPUS;

/// Hooks the kernel's scheduler provides so that blocking locks can park their waiters.
pub trait Scheduler: Sync {
    /// Returns the context running on this CPU.
    fn current_context(&self) -> ContextId;

    /// Parks the current context on `channel` for as long as `blocked` returns true.
    ///
    /// Implementations must evaluate `blocked` under the same lock `wake_one` takes, so a
    /// wakeup sent between the check and the sleep is not lost.
    fn sleep_while(&self, channel: usize, blocked: &dyn Fn() -> bool);

    /// Makes one context parked on `channel` runnable again.
    fn wake_one(&self, channel: usize);
}

static SCHEDULER: spin::Once<&'static dyn Scheduler> = spin::Once::new();

/// Installs the scheduler used by every [`WaitQueue`].
///
/// # Panics
///
/// Panics if a scheduler has already been installed.
pub fn install_scheduler(scheduler: &'static dyn Scheduler) {
    if SCHEDULER.get().is_some() {
        panic!("scheduler already installed");
    }
    SCHEDULER.call_once(|| scheduler);
    log::info!("ksync: scheduler installed, sleep locks now block");
}

/// Returns the CPU the caller runs on.
pub fn current_cpu() -> usize {
    // SAFETY: CPUID leaf 1 is available on every x86_64 processor.
    #[allow(unused_unsafe)]
    let leaf = unsafe { __cpuid(1) };
    ((leaf.ebx >> 24) as usize) % MAX_CPUS
}

/// Returns the context running on this CPU.
///
/// Before a scheduler exists each CPU runs exactly one context.
pub fn current_context() -> ContextId {
    match SCHEDULER.get() {
        Some(scheduler) => scheduler.current_context(),
        None => ContextId(current_cpu() + 1),
    }
}

/// Runs `f` with interrupts disabled so the caller cannot be preempted or migrated.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(f)
}

/// Queue of contexts blocked on one lock.
///
/// The queue's address is the channel handed to the scheduler.
pub struct WaitQueue {
    _channel: u8,
}

impl WaitQueue {
    /// Creates an empty wait queue.
    pub const fn new() -> Self {
        Self { _channel: 0 }
    }

    fn channel(&self) -> usize {
        self as *const Self as usize
    }

    /// Blocks the calling context for as long as `blocked` returns true.
    pub fn wait_while(&self, blocked: impl Fn() -> bool) {
        match SCHEDULER.get() {
            Some(scheduler) => scheduler.sleep_while(self.channel(), &blocked),
            None => {
                while blocked() {
                    core::hint::spin_loop();
                }
            }
        }
    }

    /// Wakes one blocked context, if any.
    pub fn wake_one(&self) {
        if let Some(scheduler) = SCHEDULER.get() {
            scheduler.wake_one(self.channel());
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
