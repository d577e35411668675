//! Slot array shared by every ring variant.
//!
//! Each slot is an `AtomicPtr` to a boxed item; null means empty. Positions are
//! monotonic `u64` counters and only their masked low bits address a slot.
//! Nothing here synchronizes positions: the counter protocol of the owning ring
//! decides which positions a thread may touch.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam::utils::Backoff;

use crate::constants::MIN_RING_CAPACITY;
use crate::error::{Result, RingError};

pub struct RingStorage<T> {
    slots: Box<[AtomicPtr<T>]>,
    mask: u64,
    _owns: PhantomData<Box<T>>,
}

// Items move between threads by value; shared references only escape through
// the unsafe getters whose callers require `T: Sync`.
unsafe impl<T: Send> Send for RingStorage<T> {}
unsafe impl<T: Send> Sync for RingStorage<T> {}

impl<T> RingStorage<T> {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < MIN_RING_CAPACITY || !capacity.is_power_of_two() {
            return Err(RingError::config(format!(
                "Ring capacity must be a power of 2 and at least {MIN_RING_CAPACITY}, got {capacity}"
            )));
        }

        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            slots,
            mask: (capacity - 1) as u64,
            _owns: PhantomData,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot(&self, pos: u64) -> &AtomicPtr<T> {
        &self.slots[(pos & self.mask) as usize]
    }

    /// Publish `value` at `pos` with a sequentially consistent store.
    #[inline]
    pub fn set(&self, pos: u64, value: T) {
        let ptr = Box::into_raw(Box::new(value));
        self.slot(pos).store(ptr, Ordering::SeqCst);
    }

    /// Publish `value` at `pos` with a release store.
    ///
    /// Used by the single-producer variants, where the head counter is bumped
    /// afterwards with its own release store.
    #[inline]
    pub fn set_lazy(&self, pos: u64, value: T) {
        let ptr = Box::into_raw(Box::new(value));
        self.slot(pos).store(ptr, Ordering::Release);
    }

    /// Remove the item at `pos`, spinning until the producer's write lands.
    ///
    /// The caller must own `pos`: it lies in `[tail, head)` and no other
    /// consumer can take it.
    pub fn take_and_clear(&self, pos: u64) -> T {
        let slot = self.slot(pos);
        let backoff = Backoff::new();
        loop {
            let ptr = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                // SAFETY: non-null pointers in a slot always come from Box::into_raw
                // and the swap transferred ownership to us.
                return unsafe { *Box::from_raw(ptr) };
            }
            backoff.snooze();
        }
    }

    /// Remove the item at `pos` if one is published, without waiting.
    #[inline]
    pub fn poll_and_clear(&self, pos: u64) -> Option<T> {
        let ptr = self.slot(pos).swap(ptr::null_mut(), Ordering::AcqRel);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: see take_and_clear
            Some(unsafe { *Box::from_raw(ptr) })
        }
    }

    /// Borrow the item at `pos` without removing it.
    ///
    /// # Safety
    ///
    /// The caller must guarantee no thread takes the item at `pos` while the
    /// returned reference is alive. Pipeline stages get this from the counter
    /// ordering: the next stage cannot pass this stage's tail.
    #[inline]
    pub unsafe fn get(&self, pos: u64) -> Option<&T> {
        let ptr = self.slot(pos).load(Ordering::Acquire);
        ptr.as_ref()
    }

    /// Borrow the item at `pos`, spinning until it is visible.
    ///
    /// # Safety
    ///
    /// Same contract as [`RingStorage::get`]; additionally `pos` must be below
    /// the head so a write is guaranteed to arrive.
    pub unsafe fn spin_get(&self, pos: u64) -> &T {
        let slot = self.slot(pos);
        let backoff = Backoff::new();
        loop {
            let ptr = slot.load(Ordering::Acquire);
            if let Some(item) = ptr.as_ref() {
                return item;
            }
            backoff.snooze();
        }
    }

    /// Clone the item at `pos` while the position is still unconsumed.
    ///
    /// The item is moved out of the slot for the duration of the clone so a
    /// concurrent consumer cannot free it, then put back. `still_valid` is
    /// checked after the item is held; a failed check means the slot belonged to
    /// a later lap and the clone is discarded.
    pub fn clone_at<F>(&self, pos: u64, still_valid: F) -> Option<T>
    where
        T: Clone,
        F: FnOnce() -> bool,
    {
        let slot = self.slot(pos);
        let ptr = slot.swap(ptr::null_mut(), Ordering::AcqRel);
        if ptr.is_null() {
            return None;
        }

        let _restore = Restore { slot, ptr };
        if still_valid() {
            // SAFETY: we hold the only pointer to the item until Restore drops.
            Some(unsafe { (*ptr).clone() })
        } else {
            None
        }
    }
}

/// Puts a borrowed item back into its slot, also on unwind.
struct Restore<'a, T> {
    slot: &'a AtomicPtr<T>,
    ptr: *mut T,
}

impl<T> Drop for Restore<'_, T> {
    fn drop(&mut self) {
        self.slot.store(self.ptr, Ordering::Release);
    }
}

impl<T> Drop for RingStorage<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            let ptr = *slot.get_mut();
            if !ptr.is_null() {
                // SAFETY: exclusive access during drop; pointer came from Box::into_raw
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

impl<T> std::fmt::Debug for RingStorage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingStorage").field("capacity", &self.capacity()).finish()
    }
}
