//! Physical block header and the doubly-linked physical/free-list layout.
//!
//! Every fragment starts with a [`FragmentHeader`], sized to fit in exactly
//! [`crate::ALIGNMENT`] bytes. While a fragment is free, the bytes immediately
//! following the header (i.e. the first `ALIGNMENT` bytes of what would
//! otherwise be the payload) hold a [`FreeLinks`] record. This is safe because
//! every fragment is at least [`crate::MIN_FRAGMENT_SIZE`] (`2 * ALIGNMENT`)
//! bytes long, and a used fragment's payload is never read as a `FreeLinks`
//! record since bin operations only ever touch free fragments.

use core::ptr::NonNull;

use crate::ALIGNMENT;

/// The in-band header every fragment carries, regardless of `used`/free state.
#[repr(C)]
pub(crate) struct FragmentHeader {
    pub(crate) prev_phys: Option<NonNull<FragmentHeader>>,
    pub(crate) next_phys: Option<NonNull<FragmentHeader>>,
    pub(crate) size: usize,
    pub(crate) used: bool,
}

/// The free-list record overlapping the start of a free fragment's payload.
#[repr(C)]
pub(crate) struct FreeLinks {
    pub(crate) prev_free: Option<NonNull<FragmentHeader>>,
    pub(crate) next_free: Option<NonNull<FragmentHeader>>,
}

const _: () = assert!(core::mem::size_of::<FragmentHeader>() <= ALIGNMENT);
const _: () = assert!(core::mem::size_of::<FreeLinks>() <= ALIGNMENT);

/// A handle to a fragment living somewhere inside an arena. Thin wrapper
/// around a raw pointer to the fragment's header; every accessor is `unsafe`
/// because the pointer's validity can only be guaranteed by the caller (it is
/// either freshly computed from a known-good offset, or it came from a bin/
/// physical-list slot that the engine itself only ever populates with valid
/// pointers).
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fragment(pub(crate) NonNull<FragmentHeader>);

impl Fragment {
    /// # Safety
    /// `ptr` must point to a live, correctly aligned `FragmentHeader` within
    /// an arena this engine owns.
    #[inline]
    pub(crate) unsafe fn from_header_ptr(ptr: NonNull<FragmentHeader>) -> Self {
        Self(ptr)
    }

    /// The address of this fragment's header, i.e. the fragment's own start
    /// address.
    #[inline]
    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// The payload pointer: `ALIGNMENT` bytes past the fragment start.
    #[inline]
    pub(crate) fn payload(self) -> NonNull<u8> {
        // SAFETY: the fragment occupies at least MIN_FRAGMENT_SIZE (>= ALIGNMENT)
        // bytes, so offsetting by ALIGNMENT stays within (or one-past) the
        // fragment, which is in-bounds of the arena the fragment lives in.
        unsafe { NonNull::new_unchecked(self.0.as_ptr().cast::<u8>().add(ALIGNMENT)) }
    }

    /// Recover the fragment handle from a payload pointer previously returned
    /// by [`Fragment::payload`].
    ///
    /// # Safety
    /// `payload` must have been produced by [`Fragment::payload`] on some
    /// live fragment.
    #[inline]
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        // SAFETY: forwarded from the caller's contract.
        let header = unsafe { payload.as_ptr().sub(ALIGNMENT).cast::<FragmentHeader>() };
        // SAFETY: `payload` is non-null and ALIGNMENT bytes past a valid
        // header, so subtracting ALIGNMENT recovers a non-null pointer.
        Self(unsafe { NonNull::new_unchecked(header) })
    }

    #[inline]
    pub(crate) fn free_links_ptr(self) -> NonNull<FreeLinks> {
        // SAFETY: only ever dereferenced while the fragment is free, at which
        // point the first ALIGNMENT payload bytes are reserved for this record.
        unsafe { NonNull::new_unchecked(self.0.as_ptr().cast::<u8>().add(ALIGNMENT).cast()) }
    }

    // SAFETY (all accessors below): `self.0` must point at a live header
    // within an arena this engine owns and no other alias is being used to
    // mutate it concurrently. The engine upholds this by only ever handing
    // out a `Fragment` while holding the caller's critical section.

    #[inline]
    pub(crate) unsafe fn size(self) -> usize {
        unsafe { (*self.0.as_ptr()).size }
    }

    #[inline]
    pub(crate) unsafe fn set_size(self, size: usize) {
        unsafe { (*self.0.as_ptr()).size = size }
    }

    #[inline]
    pub(crate) unsafe fn used(self) -> bool {
        unsafe { (*self.0.as_ptr()).used }
    }

    #[inline]
    pub(crate) unsafe fn set_used(self, used: bool) {
        unsafe { (*self.0.as_ptr()).used = used }
    }

    #[inline]
    pub(crate) unsafe fn prev_phys(self) -> Option<Fragment> {
        unsafe { (*self.0.as_ptr()).prev_phys.map(Fragment) }
    }

    #[inline]
    pub(crate) unsafe fn set_prev_phys(self, prev: Option<Fragment>) {
        unsafe { (*self.0.as_ptr()).prev_phys = prev.map(|f| f.0) }
    }

    #[inline]
    pub(crate) unsafe fn next_phys(self) -> Option<Fragment> {
        unsafe { (*self.0.as_ptr()).next_phys.map(Fragment) }
    }

    #[inline]
    pub(crate) unsafe fn set_next_phys(self, next: Option<Fragment>) {
        unsafe { (*self.0.as_ptr()).next_phys = next.map(|f| f.0) }
    }

    #[inline]
    pub(crate) unsafe fn prev_free(self) -> Option<Fragment> {
        unsafe { (*self.free_links_ptr().as_ptr()).prev_free.map(Fragment) }
    }

    #[inline]
    pub(crate) unsafe fn set_prev_free(self, prev: Option<Fragment>) {
        unsafe { (*self.free_links_ptr().as_ptr()).prev_free = prev.map(|f| f.0) }
    }

    #[inline]
    pub(crate) unsafe fn next_free(self) -> Option<Fragment> {
        unsafe { (*self.free_links_ptr().as_ptr()).next_free.map(Fragment) }
    }

    #[inline]
    pub(crate) unsafe fn set_next_free(self, next: Option<Fragment>) {
        unsafe { (*self.free_links_ptr().as_ptr()).next_free = next.map(|f| f.0) }
    }

    /// Write a brand-new header at `ptr`, covering `size` bytes, initially free
    /// with no physical or free-list neighbors.
    ///
    /// # Safety
    /// `ptr` must point to at least `size >= MIN_FRAGMENT_SIZE` writable,
    /// `ALIGNMENT`-aligned bytes.
    pub(crate) unsafe fn write_new(ptr: NonNull<FragmentHeader>, size: usize) -> Self {
        // SAFETY: forwarded from the caller's contract; `ptr` is valid for a
        // `FragmentHeader`-sized, -aligned write.
        unsafe {
            ptr.as_ptr().write(FragmentHeader {
                prev_phys: None,
                next_phys: None,
                size,
                used: false,
            });
        }
        Self(ptr)
    }
}

/// Link `left.next_phys = right` and `right.prev_phys = left`, tolerating an
/// absent neighbor on either side (arena boundary).
///
/// # Safety
/// Any present fragment handle must point to a live header this engine owns.
pub(crate) unsafe fn interlink(left: Option<Fragment>, right: Option<Fragment>) {
    // SAFETY: forwarded from the caller's contract.
    unsafe {
        if let Some(left) = left {
            left.set_next_phys(right);
        }
        if let Some(right) = right {
            right.set_prev_phys(left);
        }
    }
}
