//! The constant-time engine: allocation, deallocation, initialization, and
//! the heuristic pointer audit. Everything above this module (`Heap<'a>`,
//! `RawAllocator<N>`) is a thin safe wrapper that owns the arena storage and
//! forwards to [`HeapState`].

use core::ptr::NonNull;

use crate::arith::{log2_ceil, log2_floor, pow2};
use crate::bins::Bins;
use crate::diagnostics::Diagnostics;
use crate::fragment::{interlink, Fragment, FragmentHeader};
use crate::hooks::CriticalSectionHooks;
use crate::{ALIGNMENT, MAX_FRAGMENT_SIZE, MIN_FRAGMENT_SIZE, NUM_BINS};

/// Returned by [`HeapState::free`] when the heuristic pointer audit rejects
/// the argument. In debug builds the engine also fires a
/// `debug_assert!` before returning this; in release builds it is silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidPointer;

impl core::fmt::Display for InvalidPointer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("pointer did not originate from this heap instance")
    }
}

/// All mutable bookkeeping for one heap instance, kept outside the arena it
/// describes (see `DESIGN.md` on instance placement). `base`/`capacity`
/// together bound the arena for the pointer audit in [`HeapState::free`].
pub(crate) struct HeapState {
    bins: Bins,
    hooks: CriticalSectionHooks,
    diagnostics: Diagnostics,
    arena_start: usize,
}

impl HeapState {
    /// Carve a single root fragment out of `[base, base + size)` and return
    /// the bookkeeping instance for it, or `None` if the region is too small
    /// to hold even one fragment after alignment.
    ///
    /// # Safety
    /// `[base, base + size)` must be valid for reads and writes for the
    /// entire lifetime of the returned `HeapState`, and must not be accessed
    /// through any other pointer while the instance is alive.
    pub(crate) unsafe fn init(
        base: NonNull<u8>,
        size: usize,
        hooks: CriticalSectionHooks,
    ) -> Option<Self> {
        let mut addr = base.as_ptr() as usize;
        let mut remaining = size;
        while addr % ALIGNMENT != 0 {
            if remaining == 0 {
                return None;
            }
            addr += 1;
            remaining -= 1;
        }
        if remaining < MIN_FRAGMENT_SIZE {
            return None;
        }
        if remaining > MAX_FRAGMENT_SIZE {
            remaining = MAX_FRAGMENT_SIZE;
        }
        remaining -= remaining % MIN_FRAGMENT_SIZE;
        if remaining < MIN_FRAGMENT_SIZE {
            return None;
        }

        // SAFETY: `addr` is ALIGNMENT-aligned and non-zero (derived from the
        // non-null `base`), and `[addr, addr + remaining)` is a subrange of
        // the caller-guaranteed-valid `[base, base + size)`.
        let root_ptr = unsafe { NonNull::new_unchecked(addr as *mut FragmentHeader) };
        // SAFETY: `root_ptr` is valid for a `remaining >= MIN_FRAGMENT_SIZE`
        // byte write, per the caller's contract on `[base, base + size)`.
        let root = unsafe { Fragment::write_new(root_ptr, remaining) };

        let mut bins = Bins::empty();
        // SAFETY: `root` is a freshly written, currently-unbinned fragment.
        unsafe { bins.insert(root) };

        Some(Self {
            bins,
            hooks,
            diagnostics: Diagnostics::new(remaining),
            arena_start: addr,
        })
    }

    pub(crate) fn diagnostics(&self) -> Diagnostics {
        self.hooks.enter();
        let snapshot = self.diagnostics;
        self.hooks.leave();
        snapshot
    }

    /// Returns `None` on a zero-sized request (without touching any
    /// counter) or on OOM (incrementing `oom_count`).
    pub(crate) fn allocate(&mut self, amount: usize) -> Option<NonNull<u8>> {
        if amount == 0 {
            return None;
        }

        // fragment_size = pow2(log2_ceil(amount + ALIGNMENT)), guarding every
        // overflow/oversize boundary along the way.
        let with_header = amount.checked_add(ALIGNMENT)?;
        let ceil = log2_ceil(with_header);
        if ceil >= usize::BITS {
            self.hooks.enter();
            self.diagnostics.record_oom(amount);
            self.hooks.leave();
            return None;
        }
        let fragment_size = pow2(ceil);
        if fragment_size > MAX_FRAGMENT_SIZE {
            self.hooks.enter();
            self.diagnostics.record_oom(amount);
            self.hooks.leave();
            return None;
        }
        let optimal_idx = log2_ceil(fragment_size / MIN_FRAGMENT_SIZE) as usize;

        self.hooks.enter();

        let suitable = self.bins.nonempty_mask() & !(pow2(optimal_idx as u32).wrapping_sub(1));
        let smallest = suitable & suitable.wrapping_neg();
        if smallest == 0 {
            self.diagnostics.record_oom(amount);
            self.hooks.leave();
            return None;
        }
        let chosen_idx = log2_floor(smallest) as usize;
        debug_assert!(chosen_idx < NUM_BINS);
        // SAFETY: `chosen_idx`'s bit is set in the mask, so its list head is
        // non-empty by the mask/heads invariant `Bins` maintains.
        let f = unsafe { self.bins.head(chosen_idx).unwrap_unchecked() };
        // SAFETY: `f` is the live head of `bins[chosen_idx]`.
        unsafe { self.bins.remove(f) };

        // SAFETY: `f` is a live fragment just unlinked from its bin.
        let f_size = unsafe { f.size() };
        let leftover = f_size - fragment_size;
        if leftover >= MIN_FRAGMENT_SIZE {
            // SAFETY: `f`'s header is at `f.addr()`; `fragment_size` bytes
            // past it is still inside `f`'s (now too-large) span, which the
            // caller guaranteed is valid memory for `init`'s lifetime.
            let r_ptr = unsafe {
                NonNull::new_unchecked(
                    (f.0.as_ptr().cast::<u8>().add(fragment_size)).cast::<FragmentHeader>(),
                )
            };
            // SAFETY: `[r_ptr, r_ptr + leftover)` is the tail of `f`'s span
            // past the first `fragment_size` bytes, `leftover >=
            // MIN_FRAGMENT_SIZE` by the branch condition.
            let r = unsafe { Fragment::write_new(r_ptr, leftover) };
            // SAFETY: `f` is live; forwarded from the caller's contract.
            let old_next = unsafe { f.next_phys() };
            // SAFETY: `f` and `r` are both live, freshly-sized fragments.
            unsafe {
                f.set_size(fragment_size);
                interlink(Some(f), Some(r));
                interlink(Some(r), old_next);
                self.bins.insert(r);
            }
        }

        // SAFETY: `f` is live and now finalized as the used fragment we hand
        // back to the caller.
        unsafe { f.set_used(true) };
        self.diagnostics.record_allocation(fragment_size, amount);
        self.hooks.leave();
        Some(f.payload())
    }

    /// `ptr` must have been returned by a prior `allocate` on this same
    /// instance and not since freed; violating this is undefined behavior,
    /// though the heuristic audit below catches many (not all) misuses.
    ///
    /// # Safety
    /// `ptr` must have been produced by [`Fragment::payload`] on a fragment
    /// still owned by this instance.
    pub(crate) unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<(), InvalidPointer> {
        // SAFETY: forwarded from the caller's contract; `audit` itself never
        // assumes `ptr` is valid beyond reading the header it would imply.
        if !unsafe { self.audit(ptr) } {
            debug_assert!(
                false,
                "free() called with a pointer that failed the heuristic audit"
            );
            return Err(InvalidPointer);
        }
        // SAFETY: audited above; forwarded from the caller's contract.
        let f = unsafe { Fragment::from_payload(ptr) };

        self.hooks.enter();

        // SAFETY: `f` passed the audit, so it is a live, used fragment.
        let size = unsafe { f.size() };
        unsafe { f.set_used(false) };
        self.diagnostics.record_free(size);

        // SAFETY: `f` is live.
        let prev = unsafe { f.prev_phys() };
        let next = unsafe { f.next_phys() };
        // SAFETY: `prev`/`next`, if present, are live physical neighbors.
        let join_left = matches!(prev, Some(p) if unsafe { !p.used() });
        let join_right = matches!(next, Some(n) if unsafe { !n.used() });

        match (join_left, join_right) {
            (true, true) => {
                // SAFETY: `prev`/`next` are `Some` because `join_left`/
                // `join_right` were derived from them being `Some`.
                let (p, n) = unsafe { (prev.unwrap_unchecked(), next.unwrap_unchecked()) };
                // SAFETY: `p`, `n` are live fragments currently binned.
                unsafe {
                    self.bins.remove(p);
                    self.bins.remove(n);
                    let n_size = n.size();
                    p.set_size(p.size() + size + n_size);
                    let n_next = n.next_phys();
                    interlink(Some(p), n_next);
                    self.bins.insert(p);
                }
            }
            (true, false) => {
                // SAFETY: `prev` is `Some` because `join_left` was derived
                // from it being `Some`.
                let p = unsafe { prev.unwrap_unchecked() };
                // SAFETY: `p` is a live fragment currently binned.
                unsafe {
                    self.bins.remove(p);
                    p.set_size(p.size() + size);
                    interlink(Some(p), next);
                    self.bins.insert(p);
                }
            }
            (false, true) => {
                // SAFETY: `next` is `Some` because `join_right` was derived
                // from it being `Some`.
                let n = unsafe { next.unwrap_unchecked() };
                // SAFETY: `n` is a live fragment currently binned; `f` is the
                // fragment being freed.
                unsafe {
                    self.bins.remove(n);
                    f.set_size(size + n.size());
                    let n_next = n.next_phys();
                    interlink(Some(f), n_next);
                    self.bins.insert(f);
                }
            }
            (false, false) => {
                // SAFETY: `f` is a live, now-free, currently-unbinned
                // fragment.
                unsafe { self.bins.insert(f) };
            }
        }

        self.hooks.leave();
        Ok(())
    }

    /// Heuristic validity check for a pointer claimed to have come from
    /// this instance. No false positives on genuinely valid pointers;
    /// occasional false negatives on adversarial corrupt input are accepted.
    ///
    /// # Safety
    /// `ptr` is treated as untrusted input and is never dereferenced except
    /// through reads gated by the bounds/alignment checks performed first;
    /// nonetheless the caller must ensure the memory at `ptr - ALIGNMENT` is
    /// at least readable (i.e. within the arena's address range, which a
    /// wildly invalid pointer may not be).
    unsafe fn audit(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        if addr % ALIGNMENT != 0 {
            return false;
        }
        let Some(header_addr) = addr.checked_sub(ALIGNMENT) else {
            return false;
        };
        let capacity = self.diagnostics.capacity;
        if header_addr < self.arena_start || header_addr >= self.arena_start + capacity {
            return false;
        }

        // SAFETY: `header_addr` lies within the arena this instance owns, so
        // reading a `FragmentHeader`-sized region there is in-bounds; the
        // fields read are only ever used for the heuristic checks below, not
        // trusted for anything unsafe.
        let f = unsafe { Fragment::from_payload(ptr) };
        // SAFETY: see above.
        let (used, size) = unsafe { (f.used(), f.size()) };
        if !used {
            return false;
        }
        if size < MIN_FRAGMENT_SIZE || size > capacity || size % MIN_FRAGMENT_SIZE != 0 {
            return false;
        }

        // SAFETY: see above; neighbor pointers are only compared, not mutated.
        if let Some(p) = unsafe { f.prev_phys() } {
            if p.addr() < self.arena_start || p.addr() >= header_addr {
                return false;
            }
            // SAFETY: `p.addr()` was just bounds-checked against the arena
            // range this instance owns, so reading its header is in-bounds.
            if unsafe { p.next_phys() } != Some(f) {
                return false;
            }
        }
        // SAFETY: see above.
        if let Some(n) = unsafe { f.next_phys() } {
            if n.addr() <= header_addr || n.addr() >= self.arena_start + capacity {
                return false;
            }
            // SAFETY: `n` lies within the audited bounds established above.
            if unsafe { n.prev_phys() } != Some(f) {
                return false;
            }
        }
        true
    }

    /// A constant-time structural sanity check, bounded by `NUM_BINS`
    /// (itself bounded by the pointer width, so genuinely O(1)).
    pub(crate) fn invariants_hold(&self) -> bool {
        if self.diagnostics.capacity > MAX_FRAGMENT_SIZE {
            return false;
        }
        if self.diagnostics.allocated > self.diagnostics.capacity {
            return false;
        }
        if self.diagnostics.peak_allocated < self.diagnostics.allocated {
            return false;
        }
        for idx in 0..NUM_BINS {
            let bit_set = (self.bins.nonempty_mask() >> idx) & 1 == 1;
            if bit_set != self.bins.head(idx).is_some() {
                return false;
            }
        }
        true
    }
}
