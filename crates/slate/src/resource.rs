//! Resource limits the VM enforces against the host stack.
//!
//! Narrower than the teacher's allocation/time/memory tracker family: an
//! embeddable language core without a sandboxing requirement only needs to
//! stop deeply recursive closures from overflowing the host stack before
//! the VM itself notices anything is wrong.

/// Maximum call-frame depth before `interpret`/`execute` fail with
/// [`crate::error::ErrorKind::Value`] ("maximum recursion depth exceeded").
pub const DEFAULT_MAX_CALL_DEPTH: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub max_call_depth: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self { max_call_depth: DEFAULT_MAX_CALL_DEPTH }
    }
}

impl ResourceLimits {
    #[must_use]
    pub fn new(max_call_depth: usize) -> Self {
        Self { max_call_depth }
    }
}
