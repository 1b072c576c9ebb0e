//! Stack allocation for fibers.
//!
//! Delegates to [`context::stack::ProtectedFixedSizeStack`], which `mmap`s
//! the stack and `mprotect`s its last page to `PROT_NONE` so a stack
//! overflow faults immediately instead of silently corrupting whatever
//! memory happens to sit below it. The original runtime used a plain
//! `malloc`ed buffer with no such guard; we don't see a reason to give up
//! the safety net a stackful coroutine runtime can get for free.

use context::stack::ProtectedFixedSizeStack;

pub use context::stack::Stack as StackTrait;

/// An owned, guard-paged fiber stack.
pub struct FiberStack {
    inner: ProtectedFixedSizeStack,
    size: usize,
}

impl FiberStack {
    /// Allocates a new stack of exactly `size` bytes (rounded up to a page
    /// boundary by the underlying `mmap`). Fatal on allocation failure:
    /// there's nothing a caller can sensibly do with a fiber that has no
    /// stack to run on.
    pub fn new(size: usize) -> FiberStack {
        let inner = ProtectedFixedSizeStack::new(size).unwrap_or_else(|e| {
            crate::log::fatal(&format!("failed to allocate {size}-byte fiber stack: {e}"))
        });
        FiberStack { inner, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn as_context_stack(&self) -> &ProtectedFixedSizeStack {
        &self.inner
    }
}
