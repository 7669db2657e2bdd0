//! Critical-section callbacks the embedder may supply to make the otherwise
//! non-thread-safe core safe to call from contexts that can race each other
//! (e.g. an ISR preempting a mutator on the same core).

/// A pair of optional hooks bracketing the mutating body of `allocate` and
/// `free`. Each call invokes `enter` (if present) exactly once before
/// touching any shared state, and `leave` (if present) exactly once
/// afterwards; `init` invokes neither, and neither hook is ever entered
/// recursively.
///
/// An empty pair (the default) yields a non-thread-safe core. Supplying
/// interrupt-disable/restore functions yields interrupt-safe usage without
/// requiring a full mutex.
#[derive(Clone, Copy, Default)]
pub struct CriticalSectionHooks {
    enter: Option<fn()>,
    leave: Option<fn()>,
}

impl CriticalSectionHooks {
    /// No hooks: the core is left non-thread-safe.
    pub const fn none() -> Self {
        Self {
            enter: None,
            leave: None,
        }
    }

    /// Supply either or both halves of the critical-section bracket. Either
    /// side may be `None` on its own — an interrupt-disable hook with no
    /// corresponding restore, or vice versa, is a legitimate (if unusual)
    /// configuration and is not rejected here.
    pub const fn new(enter: Option<fn()>, leave: Option<fn()>) -> Self {
        Self { enter, leave }
    }

    #[inline]
    pub(crate) fn enter(&self) {
        if let Some(enter) = self.enter {
            enter();
        }
    }

    #[inline]
    pub(crate) fn leave(&self) {
        if let Some(leave) = self.leave {
            leave();
        }
    }
}
