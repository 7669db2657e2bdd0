//! Safe entry point for embedders who own their own arena storage (a linker
//! symbol, a `static mut` region, `Box::leak`-ed memory, ...) instead of
//! letting [`crate::Allocator`] own a compile-time-sized array.

use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::diagnostics::Diagnostics;
use crate::heap::{HeapState, InvalidPointer};
use crate::hooks::CriticalSectionHooks;

/// A heap instance bound to a caller-supplied `&'a mut [u8]` arena.
///
/// The arena is exclusively owned by the instance for as long as it is
/// alive: the exclusive `&'a mut [u8]` borrow is the safety mechanism, since
/// the borrow checker guarantees nothing else can read or write the bytes
/// this instance manages.
pub struct Heap<'a> {
    state: HeapState,
    _arena: PhantomData<&'a mut [u8]>,
}

impl<'a> Heap<'a> {
    /// `arena` need not be aligned or sized to any particular boundary —
    /// unusable leading/trailing bytes are silently dropped, as is any
    /// excess past `MAX_FRAGMENT_SIZE`. Returns `None` if fewer than
    /// [`crate::MIN_FRAGMENT_SIZE`] bytes remain after alignment.
    pub fn new(arena: &'a mut [u8], hooks: CriticalSectionHooks) -> Option<Self> {
        let base = NonNull::new(arena.as_mut_ptr())?;
        let len = arena.len();
        // SAFETY: `arena` is a live, exclusively-borrowed `&'a mut [u8]` of
        // `len` bytes; the returned `HeapState` is wrapped in a `Heap<'a>`
        // that cannot outlive that borrow, so its pointers into `arena`
        // remain valid for as long as the `HeapState` does.
        let state = unsafe { HeapState::init(base, len, hooks) }?;
        Some(Self {
            state,
            _arena: PhantomData,
        })
    }

    /// `amount` of `0` returns `None` without touching any counter; an
    /// unsatisfiable request returns `None` and increments `oom_count`.
    pub fn allocate(&mut self, amount: usize) -> Option<NonNull<u8>> {
        self.state.allocate(amount)
    }

    /// `None` is a silent no-op (no hooks invoked). A `Some` pointer must
    /// have been returned by [`Heap::allocate`] on this same instance and
    /// not since freed.
    ///
    /// # Safety
    /// See [`HeapState::free`]: passing a pointer that did not originate
    /// from this instance, or that has already been freed, is undefined
    /// behavior beyond what the heuristic audit happens to catch.
    pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>) -> Result<(), InvalidPointer> {
        match ptr {
            // SAFETY: forwarded from the caller's contract.
            Some(ptr) => unsafe { self.state.free(ptr) },
            None => Ok(()),
        }
    }

    /// A pure read of the running counters.
    pub fn diagnostics(&self) -> Diagnostics {
        self.state.diagnostics()
    }

    /// Structural self-check, suitable for periodic runtime self-test.
    pub fn invariants_hold(&self) -> bool {
        self.state.invariants_hold()
    }
}
