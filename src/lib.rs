//! A constant-time, bounded-fragmentation allocator for embedded systems.
//!
//! This crate provides a single type called [`Allocator`]. This type implements
//! the [`core::alloc::GlobalAlloc`]-trait, which is required to use the
//! [`alloc`-crate][alloc] on `#![no_std]`-targets. Unlike a naive linear-scan
//! allocator, every public operation here — `allocate`, `free`, even the
//! diagnostics snapshot — runs in time independent of how many blocks are
//! currently live, which is the property that matters for hard-real-time and
//! safety-critical targets: a worst-case allocation burst cannot blow a
//! deadline budget no matter how fragmented the heap has gotten.
//!
//! # Usage
//! The usage is simple: just copy and paste the following code snippet into
//! your binary crate and potentially adjust the number of bytes of the heap
//! (here 4K):
//! ```
//! #[global_allocator]
//! static ALLOCATOR: ctalloc::Allocator<4096> = ctalloc::Allocator::new();
//!
//! extern crate alloc;
//! ```
//! Afterwards you don't need to interact with the crate or the variable
//! `ALLOCATOR` anymore. Now you can just `use alloc::vec::Vec` or even
//! `use alloc::collections::BTreeMap`, i.e. every fancy collection which is
//! normally provided by the `std`.
//!
//! If you own your arena already — a linker-provided region, a `static mut`
//! buffer, memory handed to you by a bootloader — use [`Heap`] instead, which
//! binds the same engine to an arbitrary `&mut [u8]` rather than a
//! compile-time-sized array.
//!
//! Note to users with things like `MPU`s, `MMU`s, etc.: your device might
//! support things like memory remapping or memory protection with setting
//! read/write/execution rights. This crate _doesn't use_ those features at all!
//! If that is desired, you should take the address of the buffer and use that
//! along with the known size `N` to protect the heap memory. To users with a
//! fully-working MMU: it is recommended, that you use an allocator, that
//! actually supports paging, etc. This crate might still be helpful, e.g.
//! before setting up the MMU.
//!
//! # Implementation
//! Free blocks ("fragments") are organized into power-of-two size classes
//! ("bins"), each a doubly-linked free list, with a bitmask recording which
//! bins are currently non-empty:
//! 1.  `allocate(amount)` rounds `amount` up to a fragment size that is both
//!     large enough to hold the request plus its header and a power of two
//!     (this bound on worst-case external fragmentation is due to Herter,
//!     *Timing-Predictable Memory Allocation In Hard Real-Time Systems*).
//!     It then isolates the lowest set bit of the bitmask at or above the
//!     bin that guarantees a large-enough block — a handful of bitwise
//!     operations, not a search — pops that bin's head fragment, and splits
//!     off any leftover too large to discard.
//! 2.  `free(ptr)` clears the fragment's `used` flag and inspects its two
//!     physical neighbors (tracked via an address-ordered doubly-linked
//!     list). Any neighbor that is itself free is merged in, and the
//!     resulting fragment — whatever its final size — is pushed back onto
//!     the free list for its size class. At most two neighbors are ever
//!     inspected, so this is also O(1) regardless of heap occupancy.
//!
//! Both directions keep a running set of diagnostic counters (`capacity`,
//! `allocated`, `peak_allocated`, `peak_request_size`, `oom_count`) available
//! through [`Heap::diagnostics`]/the `Allocator`-internal engine, and a
//! constant-time structural self-check (`invariants_hold`) suitable for
//! periodic runtime self-testing on safety-critical targets.
//!
//! [alloc]: https://doc.rust-lang.org/alloc/index.html
#![cfg_attr(not(test), no_std)]
#![warn(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

mod arena_heap;
mod arith;
mod bins;
mod diagnostics;
mod fragment;
mod heap;
mod hooks;
mod raw_allocator;

pub use arena_heap::Heap;
pub use diagnostics::Diagnostics;
pub use heap::InvalidPointer;
pub use hooks::CriticalSectionHooks;

use raw_allocator::RawAllocator;

use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr::{self, NonNull};

/// Every fragment's payload begins this many bytes past its header, and
/// every payload pointer `allocate` ever returns satisfies this alignment.
/// `4 * size_of::<usize>()`: 16 bytes on 32-bit targets, 32 bytes on 64-bit
/// targets.
pub const ALIGNMENT: usize = 4 * size_of::<usize>();

/// The smallest possible fragment, header included: `2 * ALIGNMENT`. No
/// fragment — used or free — is ever smaller than this.
pub const MIN_FRAGMENT_SIZE: usize = 2 * ALIGNMENT;

/// The largest fragment size `allocate` will ever produce: the top power of
/// two representable in a `usize`. Also the cap silently applied to a
/// too-large arena at `init` time.
pub const MAX_FRAGMENT_SIZE: usize = (usize::MAX >> 1) + 1;

/// One bin per bit of a `usize`; a few of the highest bins are structurally
/// unreachable (no representable fragment size maps to them) but their
/// presence is harmless and keeps every bin index trivially in bounds.
pub(crate) const NUM_BINS: usize = usize::BITS as usize;

/// The memory allocator for embedded systems.
///
/// This is the core type of this crate: it is an allocator with a predefined
/// heap size. Therefore the heap memory usage is statically limited to an upper
/// value, which also helps to prevent issues with heap/stack-smashes, as the
/// heap is counted to the static memory (e.g. `.data`/`.bss`-sections). Such a
/// smash might still happen though, if the stack pointer grows into the heap,
/// but the heap cannot grow into the stack pointer.
///
/// Its usage is simple: just copy and paste the following in the binary crate
/// you're developing. The memory size of the heap is `4096` or 4K in this
/// example. Adjust that value to your needs.
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: ctalloc::Allocator<4096> = ctalloc::Allocator::new();
/// ```
/// Also please refer to the [crate-level](crate)-documentation for
/// recommendations on the buffer size and general usage.
///
/// # A note on moving
/// Internally, free fragments are linked by their own addresses (per the
/// design rationale in `DESIGN.md`), and those addresses live inside `self`.
/// Moving an `Allocator` after it has served at least one `alloc`/`dealloc`
/// call would leave every stored link pointing at the old, now-stale
/// location. This is a non-issue for the documented `#[global_allocator]
/// static` usage above — `static` items never move for the life of the
/// program — but an `Allocator` built as a local or struct field must likewise
/// never be relocated once used. `Heap` (for externally-owned arenas) has no
/// such restriction, since its links point into the borrowed arena, not into
/// `Heap` itself.
pub struct Allocator<const N: usize> {
    /// The internal raw allocator.
    ///
    /// The raw allocator handles allocations of contiguous byte slices without
    /// needing to worry about over-alignment. It is protected by a
    /// `spin::Mutex` to make it usable with shared references (requirement of
    /// [`GlobalAlloc`]); the engine's own optional critical-section hooks
    /// (see [`CriticalSectionHooks`]) remain available underneath that lock
    /// for embedders who also need interrupt-safety, since a spinlock alone
    /// cannot prevent an ISR on the same core from preempting the lock
    /// holder.
    raw: spin::Mutex<RawAllocator<N>>,
}
impl<const N: usize> Allocator<N> {
    /// Create a new [`Allocator`].
    ///
    /// This function is a `const fn`, therefore you can call it directly when
    /// creating the allocator.
    ///
    /// Please see the [crate-level](crate)-documentation for recommendations on
    /// the buffer size and general usage.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Self {
        let raw = spin::Mutex::new(RawAllocator::new());
        Self { raw }
    }

    /// A pure read of the running diagnostic counters: `capacity`,
    /// `allocated`, `peak_allocated`, `peak_request_size`, `oom_count`.
    pub fn diagnostics(&self) -> Diagnostics {
        self.raw.lock().diagnostics()
    }

    /// A constant-time structural self-check, suitable for periodic runtime
    /// self-testing on safety-critical targets.
    pub fn invariants_hold(&self) -> bool {
        self.raw.lock().invariants_hold()
    }

    /// Align a given pointer to the specified alignment.
    ///
    /// # Safety
    /// This function requires `align` to be a power of two and requires the
    /// `ptr` to point to a memory region, that is large enough, so that the
    /// aligned pointer is still in that memory region.
    unsafe fn align_to(ptr: *mut u8, align: usize) -> *mut u8 {
        let addr = ptr as usize;
        let mismatch = addr & (align - 1);
        let offset = if mismatch != 0 { align - mismatch } else { 0 };
        // SAFETY: "in-bounds"-requirement is part of the safety-contract of
        // this function, therefore the caller is responsible for it.
        unsafe { ptr.add(offset) }
    }
}
impl<const N: usize> Default for Allocator<N> {
    fn default() -> Self {
        Self::new()
    }
}
// SAFETY: the safety contract of `GlobalAlloc` is a bit lengthy, but in
// short: the implementation does not panic (at least not on purpose — if it
// would, that's a bug) and it actually adheres to the layout requirements
// (ensured by tests).
unsafe impl<const N: usize> GlobalAlloc for Allocator<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let align = layout.align();
        if align <= ALIGNMENT {
            // Every fragment this engine hands out is already ALIGNMENT-
            // aligned, so smaller (or equal) alignments are satisfied for
            // free.
            match self.raw.lock().alloc(layout.size()) {
                Some(memory) => memory.as_ptr(),
                None => ptr::null_mut(),
            }
        } else {
            // Over-alignment requires over-allocating and adjusting the
            // returned pointer forward. Because `dealloc` must later recover
            // the *original* pointer (the one `free` actually expects,
            // exactly `ALIGNMENT` bytes past the fragment header), the real
            // pointer is stashed in a `usize`-sized slot immediately before
            // the adjusted pointer we hand back.
            let header_room = size_of::<usize>();
            let Some(request) = layout
                .size()
                .checked_add(align)
                .and_then(|v| v.checked_add(header_room))
            else {
                return ptr::null_mut();
            };
            match self.raw.lock().alloc(request) {
                Some(real) => {
                    // SAFETY: `real` is valid for `request` bytes, which is
                    // at least `header_room` bytes more than
                    // `layout.size() + align`, so offsetting by
                    // `header_room` and then aligning forward by up to
                    // `align - 1` more bytes stays in bounds.
                    let shifted = unsafe { real.as_ptr().add(header_room) };
                    // SAFETY: `shifted` has at least `layout.size() + align`
                    // bytes ahead of it, so the aligned pointer (at most
                    // `align - 1` bytes further) is still in bounds.
                    let aligned = unsafe { Self::align_to(shifted, align) };
                    // SAFETY: `aligned` has at least `header_room` readable/
                    // writable bytes immediately before it (the `shifted`
                    // offset reserved them), so this write is in bounds.
                    unsafe {
                        aligned
                            .cast::<usize>()
                            .sub(1)
                            .write(real.as_ptr() as usize);
                    }
                    aligned
                }
                None => ptr::null_mut(),
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let real_ptr = if layout.align() <= ALIGNMENT {
            ptr
        } else {
            // SAFETY: `ptr` was produced by this same `alloc` for a layout
            // with `align() > ALIGNMENT`, which always stashes the real
            // pointer in the `usize` slot immediately before it.
            unsafe { ptr::read(ptr.cast::<usize>().sub(1)) as *mut u8 }
        };
        // `free()`'s heuristic audit might detect a corrupted/foreign
        // pointer, but `GlobalAlloc::dealloc` has no error return — by its
        // contract, a well-behaved caller never passes such a pointer, so
        // any detected mismatch here is silently ignored rather than raised.
        if let Some(real_ptr) = NonNull::new(real_ptr) {
            // SAFETY: `real_ptr` is the pointer a matching `alloc` call
            // obtained from the raw allocator, forwarded per `GlobalAlloc`'s
            // own contract that `ptr`/`layout` match a prior `alloc`.
            let _ = unsafe { self.raw.lock().free(real_ptr) };
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Allocator;
    use core::alloc::{GlobalAlloc, Layout};
    use core::ptr;

    #[test]
    fn alignment_of_align_to() {
        // create buffer memory for proper indexing. One could use random
        // integers and cast them to pointers, but this would violate the strict
        // provenance rules and `miri` would detect that. Therefore this uses a
        // valid and suitable aligned buffer and uses pointers into that buffer.
        #[repr(align(64))]
        struct Align([u8; 64]);
        let mut just_a_buffer_to_get_a_valid_address = Align([0_u8; 64]);
        let base: *mut u8 = ptr::addr_of_mut!(just_a_buffer_to_get_a_valid_address.0).cast();

        // create some pointers to the buffer with some offsets
        let ptr_0x10 = base;
        let ptr_0x11 = base.wrapping_add(1);
        let ptr_0x14 = base.wrapping_add(4);
        let ptr_0x1c = base.wrapping_add(0xc);
        let ptr_0x20 = base.wrapping_add(0x10);

        // the actual test for the alignment of `align_to()`
        assert_eq!(unsafe { Allocator::<8>::align_to(ptr_0x11, 4) }, ptr_0x14);
        assert_eq!(unsafe { Allocator::<8>::align_to(ptr_0x10, 4) }, ptr_0x10);

        assert_eq!(unsafe { Allocator::<8>::align_to(ptr_0x11, 1) }, ptr_0x11);

        assert_eq!(unsafe { Allocator::<8>::align_to(ptr_0x1c, 16) }, ptr_0x20);
    }

    // the following tests ensure, that a pointer with the requested alignment
    // is returned

    /// Assert the given alignment of pointers.
    macro_rules! assert_alignment {
        ($ptr:expr, $align:expr) => {{
            assert_eq!(($ptr as usize) % $align, 0, "Alignment not fulfilled");
        }};
    }

    #[test]
    fn small_alignments() {
        let allocator = Allocator::<256>::new();

        let ptr = unsafe { allocator.alloc(Layout::from_size_align(8, 2).unwrap()) };
        assert_alignment!(ptr, 1);
        assert_ne!(ptr, ptr::null_mut());

        let ptr = unsafe { allocator.alloc(Layout::from_size_align(4, 4).unwrap()) };
        assert_alignment!(ptr, 4);
        assert_ne!(ptr, ptr::null_mut());
    }

    #[test]
    fn medium_alignments() {
        let allocator = Allocator::<512>::new();

        let layout = Layout::from_size_align(4, 8).unwrap();
        let ptr = unsafe { allocator.alloc(layout) };
        assert_alignment!(ptr, 8);
        assert_ne!(ptr, ptr::null_mut());
        unsafe { allocator.dealloc(ptr, layout) };

        let layout = Layout::from_size_align(4, 64).unwrap();
        let ptr = unsafe { allocator.alloc(layout) };
        assert_alignment!(ptr, 64);
        assert_ne!(ptr, ptr::null_mut());
        unsafe { allocator.dealloc(ptr, layout) };
    }

    #[cfg(not(miri))] // too slow
    #[test]
    fn huge_alignment() {
        const FOUR_MEG: usize = 4 * 1024 * 1024;

        static ALLOCATOR: Allocator<{ 10 * 1024 * 1024 }> = Allocator::new();
        let layout = Layout::from_size_align(4, FOUR_MEG).unwrap();
        let ptr = unsafe { ALLOCATOR.alloc(layout) };

        assert_alignment!(ptr, FOUR_MEG);
        assert_ne!(ptr, ptr::null_mut());
        unsafe { ALLOCATOR.dealloc(ptr, layout) };
    }

    #[test]
    fn example_usage() {
        // do some example allocations. There is an intermediate deallocation,
        // different allocation/deallocation-orders, different alignments and
        // different sizes.
        static ALLOCATOR: Allocator<4096> = Allocator::new();

        unsafe {
            let layout1 = Layout::new::<u32>();
            let ptr1 = ALLOCATOR.alloc(layout1);
            assert_ne!(ptr1, ptr::null_mut());

            let layout2 = Layout::new::<f64>();
            let ptr2 = ALLOCATOR.alloc(layout2);
            assert_ne!(ptr2, ptr::null_mut());

            let layout3 = Layout::new::<[u16; 12]>();
            let ptr3 = ALLOCATOR.alloc(layout3);
            assert_ne!(ptr3, ptr::null_mut());

            ALLOCATOR.dealloc(ptr2, layout2);

            let layout4 = Layout::new::<[u128; 3]>();
            let ptr4 = ALLOCATOR.alloc(layout4);
            assert_ne!(ptr4, ptr::null_mut());

            let layout5 = Layout::new::<f32>();
            let ptr5 = ALLOCATOR.alloc(layout5);
            assert_ne!(ptr5, ptr::null_mut());

            ALLOCATOR.dealloc(ptr3, layout3);
            ALLOCATOR.dealloc(ptr4, layout4);
            ALLOCATOR.dealloc(ptr5, layout5);
            ALLOCATOR.dealloc(ptr1, layout1);
        }
    }

    #[test]
    fn diagnostics_track_allocations() {
        let allocator = Allocator::<1024>::new();
        let before = allocator.diagnostics();
        assert_eq!(before.allocated, 0);

        let layout = Layout::new::<[u8; 64]>();
        let ptr = unsafe { allocator.alloc(layout) };
        assert_ne!(ptr, ptr::null_mut());

        let after = allocator.diagnostics();
        assert!(after.allocated > before.allocated);
        assert!(allocator.invariants_hold());

        unsafe { allocator.dealloc(ptr, layout) };
        assert_eq!(allocator.diagnostics().allocated, 0);
    }

    #[test]
    fn oom_is_reported_without_panicking() {
        let allocator = Allocator::<64>::new();
        let layout = Layout::from_size_align(4096, 8).unwrap();
        let ptr = unsafe { allocator.alloc(layout) };
        assert_eq!(ptr, ptr::null_mut());
        assert!(allocator.diagnostics().oom_count >= 1);
    }
}
