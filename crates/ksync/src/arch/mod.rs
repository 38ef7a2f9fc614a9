//! Architecture-specific execution context support.
//!
//! This module conditionally imports either the hardware implementation or the software
//! emulation based on the target architecture and features.

// NOTE: We DO include the module even during tests so that rust-analyzer can see it.
#[cfg(target_arch = "x86_64")]
#[cfg_attr(any(test, feature = "software-emulation"), allow(dead_code))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::*;

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use self::software::*;

/// Identifies one execution context (a process or kernel thread).
///
/// Zero is never a valid context; it marks "nobody" in lock holder fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ContextId(pub usize);

impl ContextId {
    /// The context id that never belongs to a running context.
    pub const NONE: ContextId = ContextId(0);
}
