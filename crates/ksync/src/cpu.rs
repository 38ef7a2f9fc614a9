//! CPU and execution context identity.

use crate::arch::{self, ContextId};

/// Maximum number of CPUs the kernel supports. Per-CPU state is sized by this.
pub const MAX_CPUS: usize = 8;

/// Returns the id of the CPU the caller currently runs on.
///
/// The answer may be stale by the time it is used: the caller can be preempted and
/// resumed elsewhere. Use [`with_cpu`] when the id selects per-CPU state.
pub fn cpu_id() -> usize {
    arch::current_cpu()
}

/// Runs `f` with the current CPU id, pinned to that CPU for the duration of `f`.
///
/// Reading the id and locking the state it selects form one region; nothing in between
/// can move the caller to another CPU.
pub fn with_cpu<R>(f: impl FnOnce(usize) -> R) -> R {
    arch::without_interrupts(|| f(arch::current_cpu()))
}

/// Returns the execution context (process or kernel thread) of the caller.
pub fn context_id() -> ContextId {
    arch::current_context()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_id_is_in_range() {
        assert!(cpu_id() < MAX_CPUS);
    }

    #[test]
    fn bound_cpu_is_reported() {
        std::thread::spawn(|| {
            arch::bind_cpu(3);
            assert_eq!(cpu_id(), 3);
            assert_eq!(with_cpu(|cpu| cpu), 3);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn threads_are_distinct_contexts() {
        let here = context_id();
        let there = std::thread::spawn(context_id).join().unwrap();
        assert_ne!(here, there);
        assert_ne!(here, ContextId::NONE);
    }
}
