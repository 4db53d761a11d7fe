//! Owned fiber stack allocation.

use context::stack::ProtectedFixedSizeStack;

/// A guard-paged, fixed-size stack owned by exactly one [`super::Fiber`].
pub struct FiberStack(ProtectedFixedSizeStack);

impl FiberStack {
    pub fn new(size: usize) -> std::io::Result<Self> {
        ProtectedFixedSizeStack::new(size)
            .map(FiberStack)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }

    pub(crate) fn inner(&self) -> &ProtectedFixedSizeStack {
        &self.0
    }
}
