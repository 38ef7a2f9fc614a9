//! Software emulation of execution contexts for testing and development.
//!
//! Every host thread is one execution context. Threads are spread over the emulated CPUs
//! round-robin in creation order unless a test pins one with [`bind_cpu`]. A host thread
//! never changes its emulated CPU on its own, so the no-migration region needs no work.

use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use super::ContextId;
use crate::cpu::MAX_CPUS;

static NEXT_CONTEXT: AtomicUsize = AtomicUsize::new(1);

std::thread_local! {
    static CONTEXT: ContextId = ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed));
    static CPU: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Returns the emulated CPU the calling thread runs on.
pub fn current_cpu() -> usize {
    CPU.with(|cpu| match cpu.get() {
        Some(id) => id,
        None => {
            let id = (current_context().0 - 1) % MAX_CPUS;
            cpu.set(Some(id));
            id
        }
    })
}

/// Pins the calling thread to an emulated CPU.
///
/// # Panics
///
/// Panics if `cpu` is not below [`MAX_CPUS`].
pub fn bind_cpu(cpu: usize) {
    assert!(cpu < MAX_CPUS, "bind_cpu: cpu {cpu} out of range");
    CPU.with(|slot| slot.set(Some(cpu)));
}

/// Returns the execution context of the calling thread.
pub fn current_context() -> ContextId {
    CONTEXT.with(|id| *id)
}

/// Runs `f` as if interrupts were disabled.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    f()
}

/// Queue of contexts blocked on one lock, backed by a host condition variable.
pub struct WaitQueue {
    lock: Mutex<()>,
    wakeup: Condvar,
}

impl WaitQueue {
    /// Creates an empty wait queue.
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            wakeup: Condvar::new(),
        }
    }

    /// Blocks the calling context for as long as `blocked` returns true.
    ///
    /// `blocked` is evaluated with the queue lock held, so a [`wake_one`](Self::wake_one)
    /// issued after the condition changes cannot be lost.
    pub fn wait_while(&self, blocked: impl Fn() -> bool) {
        let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        while blocked() {
            guard = self
                .wakeup
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Wakes one blocked context, if any.
    pub fn wake_one(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.wakeup.notify_one();
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
