#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Kernel synchronization primitives
//!
//! Small layer shared by the memory manager and the buffer cache:
//!
//! - CPU identity and the "no migration" region that per-CPU state is accessed under.
//! - Execution context identity, used to decide who holds a [`SleepLock`].
//! - [`SleepLock`], the long-held blocking lock that protects content which may be held
//!   across slow operations such as device I/O.
//!
//! Short-held metadata locks are plain [`spin::Mutex`]es and are not wrapped here.
//!
//! On x86_64 hardware the blocking behaviour is delegated to the scheduler through
//! [`install_scheduler`]. With the `software-emulation` feature (and in tests) host threads
//! stand in for both CPUs and processes.

mod arch;
mod cpu;
mod sleep_lock;

pub use arch::{ContextId, WaitQueue};
#[cfg(not(any(test, feature = "software-emulation")))]
pub use arch::{Scheduler, install_scheduler};
#[cfg(any(test, feature = "software-emulation"))]
pub use arch::bind_cpu;
pub use cpu::{MAX_CPUS, context_id, cpu_id, with_cpu};
pub use sleep_lock::{SleepLock, SleepLockGuard};
