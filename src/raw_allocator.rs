//! The engine behind [`crate::Allocator`]: a compile-time-sized,
//! alignment-guaranteed byte array plus the bin-indexed [`HeapState`].
//!
//! `RawAllocator<N>` itself is not `Sync`; [`crate::Allocator`] is the piece
//! that adds a `spin::Mutex` around it to satisfy [`core::alloc::GlobalAlloc`].

use core::mem::MaybeUninit;
use core::ptr::NonNull;

use crate::diagnostics::Diagnostics;
use crate::heap::{HeapState, InvalidPointer};
use crate::hooks::CriticalSectionHooks;

/// `N` bytes aligned to 32, which is a multiple of both possible values of
/// `ALIGNMENT` (16 on 32-bit targets, 32 on 64-bit targets). This guarantees
/// the storage's own address already satisfies `ALIGNMENT`, so the
/// byte-skipping search in `HeapState::init` never has to skip anything here
/// (unlike [`crate::Heap`], which accepts an arbitrary caller-supplied slice
/// this crate cannot control the layout of).
#[repr(align(32))]
struct AlignedStorage<const N: usize>([MaybeUninit<u8>; N]);

impl<const N: usize> AlignedStorage<N> {
    const fn uninit() -> Self {
        // SAFETY: an array of `MaybeUninit<u8>` needs no initialization.
        Self([MaybeUninit::uninit(); N])
    }
}

/// The inner, non-`Sync` engine locked by [`crate::Allocator`].
///
/// Constructing one does not yet carve out the root fragment: `HeapState`
/// holds raw pointers into `storage`, which only has its final address once
/// `self` has stopped moving (e.g. once placed in its `static`). Computing
/// those pointers inside `const fn new()` would bake in a bogus
/// compile-time address, so initialization is deferred to the first call
/// that needs it and cached in `state` from then on.
///
/// Consequently `RawAllocator<N>` must not be moved once `state` has been
/// populated — see the "A note on moving" section on [`crate::Allocator`].
pub(crate) struct RawAllocator<const N: usize> {
    storage: AlignedStorage<N>,
    state: Option<HeapState>,
}

impl<const N: usize> RawAllocator<N> {
    pub(crate) const fn new() -> Self {
        Self {
            storage: AlignedStorage::uninit(),
            state: None,
        }
    }

    /// Lazily carve the root fragment out of `storage` on first use.
    ///
    /// # Panics
    /// Panics if `N` is too small to hold even one `MIN_FRAGMENT_SIZE`
    /// fragment after alignment. Since `N` is fixed at compile time by the
    /// embedder, there is no sensible runtime fallback for an undersized
    /// buffer, so this panics rather than silently degrading.
    fn state(&mut self) -> &mut HeapState {
        if self.state.is_none() {
            // SAFETY: `self` is behind `&mut self`, so it has reached its
            // final address for this call's lifetime (and, for a `static`,
            // for the remainder of the program) — unlike in `const fn new`,
            // taking this address is sound here.
            let base = unsafe {
                NonNull::new_unchecked(self.storage.0.as_mut_ptr().cast::<u8>())
            };
            // SAFETY: `storage` is `N` live, writable bytes owned outright by
            // `self`, which outlives the `HeapState` we are about to store
            // back into `self.state`.
            let state = unsafe { HeapState::init(base, N, CriticalSectionHooks::none()) };
            self.state = Some(
                state.expect("RawAllocator<N>: N is too small to hold a single fragment"),
            );
        }
        // SAFETY: populated immediately above if it was empty.
        unsafe { self.state.as_mut().unwrap_unchecked() }
    }

    pub(crate) fn alloc(&mut self, amount: usize) -> Option<NonNull<u8>> {
        self.state().allocate(amount)
    }

    /// # Safety
    /// `ptr` must have been returned by a prior [`RawAllocator::alloc`] on
    /// this same instance and not since freed.
    pub(crate) unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<(), InvalidPointer> {
        // SAFETY: forwarded from the caller's contract.
        unsafe { self.state().free(ptr) }
    }

    pub(crate) fn diagnostics(&mut self) -> Diagnostics {
        self.state().diagnostics()
    }

    pub(crate) fn invariants_hold(&mut self) -> bool {
        self.state().invariants_hold()
    }
}
