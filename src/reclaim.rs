//! Typed pointers for memory that is reclaimed through `seize`.
//!
//! Bins, nodes, values and whole tables are all allocated with [`Shared::boxed`], published
//! through an [`Atomic`], and unlinked and handed to [`RetireShared::retire_shared`] once no
//! new reader can reach them.

pub(crate) use seize::{Collector, Guard, Linked};

use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::Ordering;

pub(crate) struct Atomic<T> {
    inner: seize::AtomicPtr<T>,
}

impl<T> Atomic<T> {
    pub(crate) fn null() -> Self {
        Atomic {
            inner: seize::AtomicPtr::default(),
        }
    }

    /// Reads the pointer and protects the pointee for the lifetime of `guard`.
    pub(crate) fn load<'g>(&self, ordering: Ordering, guard: &'g Guard<'_>) -> Shared<'g, T> {
        Shared::from(guard.protect(&self.inner, ordering))
    }

    /// Reads the pointer with no protection at all.
    ///
    /// # Safety
    ///
    /// Nothing may retire the pointee while the result is alive, which in practice means the
    /// caller holds `&mut` to whatever owns this `Atomic`.
    pub(crate) unsafe fn load_unprotected<'g>(&self, ordering: Ordering) -> Shared<'g, T> {
        Shared::from(self.inner.load(ordering))
    }

    pub(crate) fn store(&self, value: Shared<'_, T>, ordering: Ordering) {
        self.inner.store(value.raw, ordering);
    }

    /// Publishes `value` and returns what was there before.
    ///
    /// The previous pointee stays readable until `guard` is dropped.
    pub(crate) fn swap<'g>(
        &self,
        value: Shared<'_, T>,
        ordering: Ordering,
        _guard: &'g Guard<'_>,
    ) -> Shared<'g, T> {
        Shared::from(self.inner.swap(value.raw, ordering))
    }

    pub(crate) fn compare_exchange<'g>(
        &self,
        expected: Shared<'_, T>,
        new: Shared<'g, T>,
        success: Ordering,
        failure: Ordering,
        _guard: &'g Guard<'_>,
    ) -> Result<Shared<'g, T>, CompareExchangeError<'g, T>> {
        self.inner
            .compare_exchange(expected.raw, new.raw, success, failure)
            .map(Shared::from)
            .map_err(|actual| CompareExchangeError {
                current: Shared::from(actual),
                new,
            })
    }
}

impl<T> From<Shared<'_, T>> for Atomic<T> {
    fn from(value: Shared<'_, T>) -> Self {
        Atomic {
            inner: seize::AtomicPtr::new(value.raw),
        }
    }
}

impl<T> std::fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Pointer::fmt(&self.inner.load(Ordering::SeqCst), f)
    }
}

/// Returned when [`Atomic::compare_exchange`] finds something other than what it expected.
///
/// The rejected pointer comes back as `new`; it was never visible to another thread, so the
/// caller still owns it.
pub(crate) struct CompareExchangeError<'g, T> {
    pub(crate) current: Shared<'g, T>,
    pub(crate) new: Shared<'g, T>,
}

/// A possibly-null pointer that stays valid until the guard it was read under goes away.
pub(crate) struct Shared<'g, T> {
    raw: *mut Linked<T>,
    guard: PhantomData<&'g ()>,
}

impl<'g, T> Shared<'g, T> {
    pub(crate) fn null() -> Self {
        Shared::from(ptr::null_mut())
    }

    pub(crate) fn boxed(value: T, collector: &Collector) -> Self {
        Shared::from(collector.link_boxed(value))
    }

    pub(crate) fn is_null(&self) -> bool {
        self.raw.is_null()
    }

    /// # Safety
    ///
    /// Same contract as `<*const T>::as_ref`, with the pointee alive for `'g`.
    pub(crate) unsafe fn as_ref(&self) -> Option<&'g Linked<T>> {
        unsafe { self.raw.as_ref() }
    }

    /// # Safety
    ///
    /// The pointer is non-null and the pointee is alive for `'g`.
    pub(crate) unsafe fn deref(&self) -> &'g Linked<T> {
        unsafe { &*self.raw }
    }

    /// Takes back ownership of the allocation.
    ///
    /// # Safety
    ///
    /// The pointer is non-null and unreachable from every other thread, both now and through
    /// any reference obtained earlier.
    pub(crate) unsafe fn into_box(self) -> Box<Linked<T>> {
        unsafe { Box::from_raw(self.raw) }
    }
}

impl<T> From<*mut Linked<T>> for Shared<'_, T> {
    fn from(raw: *mut Linked<T>) -> Self {
        Shared {
            raw,
            guard: PhantomData,
        }
    }
}

impl<T> Clone for Shared<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Shared<'_, T> {}

impl<T> PartialEq for Shared<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.raw, other.raw)
    }
}

impl<T> Eq for Shared<'_, T> {}

impl<T> std::fmt::Debug for Shared<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Pointer::fmt(&self.raw, f)
    }
}

pub(crate) trait RetireShared {
    /// Schedules `shared` to be freed after every guard that may have loaded it is gone.
    ///
    /// # Safety
    ///
    /// `shared` is non-null, has already been unlinked so that later loads cannot return it,
    /// and is not retired twice.
    unsafe fn retire_shared<T>(&self, shared: Shared<'_, T>);
}

impl RetireShared for Guard<'_> {
    unsafe fn retire_shared<T>(&self, shared: Shared<'_, T>) {
        unsafe { self.retire(shared.raw, seize::reclaim::boxed::<T>) }
    }
}

/// The guard behind a [`HashMapRef`](crate::HashMapRef): created by `pin`, or lent by the caller
/// through `with_guard`.
pub(crate) enum GuardRef<'g> {
    Owned(Guard<'g>),
    Ref(&'g Guard<'g>),
}

impl<'g> Deref for GuardRef<'g> {
    type Target = Guard<'g>;

    fn deref(&self) -> &Guard<'g> {
        match self {
            GuardRef::Owned(guard) => guard,
            GuardRef::Ref(guard) => guard,
        }
    }
}
