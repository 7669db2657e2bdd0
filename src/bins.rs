//! Size-class free-list index: one doubly-linked free list per power-of-two
//! size class, plus a bitmask that always mirrors which lists are non-empty.
//!
//! Bin `i` holds every free fragment whose size falls in
//! `[MIN_FRAGMENT_SIZE << i, MIN_FRAGMENT_SIZE << (i + 1))`; a fragment's bin
//! is always `log2_floor(size / MIN_FRAGMENT_SIZE)`. Both operations below are
//! O(1): insertion is a push to the list head, removal uses the fragment's own
//! `prev_free`/`next_free` links rather than a linear search.

use crate::arith::log2_floor;
use crate::fragment::Fragment;
use crate::{MIN_FRAGMENT_SIZE, NUM_BINS};

/// The bin index a free fragment of `size` bytes belongs to.
#[inline]
pub(crate) fn bin_index_for_size(size: usize) -> usize {
    log2_floor(size / MIN_FRAGMENT_SIZE) as usize
}

/// The array of free-list heads plus the non-empty bitmask, kept consistent
/// by [`Bins::insert`] and [`Bins::remove`].
pub(crate) struct Bins {
    heads: [Option<Fragment>; NUM_BINS],
    nonempty_mask: usize,
}

impl Bins {
    pub(crate) const fn empty() -> Self {
        Self {
            heads: [None; NUM_BINS],
            nonempty_mask: 0,
        }
    }

    #[inline]
    pub(crate) fn nonempty_mask(&self) -> usize {
        self.nonempty_mask
    }

    #[inline]
    pub(crate) fn head(&self, idx: usize) -> Option<Fragment> {
        self.heads[idx]
    }

    /// Push `frag` to the front of its size class's free list.
    ///
    /// # Safety
    /// `frag` must point to a live, currently-free fragment not already in
    /// any bin.
    pub(crate) unsafe fn insert(&mut self, frag: Fragment) {
        // SAFETY: forwarded from the caller's contract.
        let size = unsafe { frag.size() };
        let idx = bin_index_for_size(size);
        let old_head = self.heads[idx];
        // SAFETY: `frag` is a live fragment the caller is handing us ownership
        // of within the free-list structure.
        unsafe {
            frag.set_prev_free(None);
            frag.set_next_free(old_head);
            if let Some(old_head) = old_head {
                old_head.set_prev_free(Some(frag));
            }
        }
        self.heads[idx] = Some(frag);
        self.nonempty_mask |= 1usize << idx;
    }

    /// Unlink `frag` from its size class's free list.
    ///
    /// # Safety
    /// `frag` must point to a live fragment that is currently linked into
    /// this `Bins` (i.e. previously passed to [`Bins::insert`] and not since
    /// removed).
    pub(crate) unsafe fn remove(&mut self, frag: Fragment) {
        // SAFETY: forwarded from the caller's contract.
        let size = unsafe { frag.size() };
        let idx = bin_index_for_size(size);
        // SAFETY: forwarded from the caller's contract.
        let (prev, next) = unsafe { (frag.prev_free(), frag.next_free()) };
        match prev {
            // SAFETY: `prev` is a live fragment linked in the same list.
            Some(prev) => unsafe { prev.set_next_free(next) },
            None => self.heads[idx] = next,
        }
        if let Some(next) = next {
            // SAFETY: `next` is a live fragment linked in the same list.
            unsafe { next.set_prev_free(prev) };
        }
        if self.heads[idx].is_none() {
            self.nonempty_mask &= !(1usize << idx);
        }
    }
}
