//! Typed construction and destruction over raw slots
//!
//! This is the only boundary where object lifecycle is coupled to slot
//! management: `create` moves a value into freshly acquired storage,
//! `destroy` drops it in place before the storage goes back to its arena.
//! Everything below this file deals in raw, untyped bytes.

use super::allocator::{fallback_acquire, fallback_release, SlabPool};
use super::size_class::{class_index, natural_align, slot_size};
use crate::error::Result;
use std::alloc::Layout;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Where a layout's storage comes from.
enum Route {
    Class(usize),
    Fallback,
}

/// A type is pooled only while its class's slots also satisfy its
/// alignment; over-aligned types take the fallback path with their exact
/// layout.
fn route(layout: Layout) -> Route {
    match class_index(layout.size()) {
        Some(class) if layout.align() <= natural_align(slot_size(class)) => Route::Class(class),
        _ => Route::Fallback,
    }
}

impl SlabPool {
    /// Move `value` into pool-owned storage and return the typed pointer.
    ///
    /// Zero-sized values occupy no slot and yield a dangling (well-aligned,
    /// never-dereferenced-as-storage) pointer. On allocation failure the
    /// error propagates and nothing is constructed.
    ///
    /// The returned pointer must eventually go back through
    /// [`destroy`](Self::destroy) on this same pool. Prefer
    /// [`boxed`](Self::boxed), which does that automatically.
    pub fn create<T>(&self, value: T) -> Result<NonNull<T>> {
        let layout = Layout::new::<T>();
        if layout.size() == 0 {
            let ptr = NonNull::<T>::dangling();
            // A zero-sized write: moves the value without touching memory.
            unsafe { ptr.as_ptr().write(value) };
            return Ok(ptr);
        }

        let raw = match route(layout) {
            Route::Class(class) => self.class_arena(class).allocate()?,
            Route::Fallback => fallback_acquire(layout)?,
        };
        let ptr = raw.cast::<T>();
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }

    /// Drop the value in place and release its storage.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`create`](Self::create) on this pool,
    /// must point to a still-live value, and must not be used afterwards.
    pub unsafe fn destroy<T>(&self, ptr: NonNull<T>) {
        unsafe { std::ptr::drop_in_place(ptr.as_ptr()) };
        let layout = Layout::new::<T>();
        if layout.size() == 0 {
            return;
        }
        unsafe { self.release_storage(ptr.cast::<u8>(), layout) };
    }

    /// Construct `value` in the pool behind a safe owning handle.
    pub fn boxed<T>(&self, value: T) -> Result<PoolBox<'_, T>> {
        Ok(PoolBox {
            ptr: self.create(value)?,
            pool: self,
        })
    }

    /// Release typed storage without dropping the value.
    ///
    /// # Safety
    ///
    /// `raw` must have been acquired for exactly this `layout` via
    /// [`create`](Self::create)'s routing, and must not be referenced
    /// again.
    pub(crate) unsafe fn release_storage(&self, raw: NonNull<u8>, layout: Layout) {
        match route(layout) {
            Route::Class(class) => unsafe { self.class_arena(class).deallocate(raw) },
            Route::Fallback => unsafe { fallback_release(raw, layout) },
        }
    }
}

/// Owning handle to a pool-constructed value.
///
/// Dereferences to `T`; dropping it destroys the value and returns the
/// slot to the pool.
pub struct PoolBox<'p, T> {
    ptr: NonNull<T>,
    pool: &'p SlabPool,
}

impl<'p, T> PoolBox<'p, T> {
    /// Move the value out, releasing the slot without running `T`'s
    /// destructor on it twice.
    pub fn into_inner(self) -> T {
        let value = unsafe { self.ptr.as_ptr().read() };
        let layout = Layout::new::<T>();
        if layout.size() != 0 {
            unsafe { self.pool.release_storage(self.ptr.cast::<u8>(), layout) };
        }
        std::mem::forget(self);
        value
    }

    /// Raw pointer to the value, for callers interoperating with raw-slot
    /// code. The handle still owns the slot.
    pub fn as_ptr(&self) -> NonNull<T> {
        self.ptr
    }
}

impl<T> Deref for PoolBox<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for PoolBox<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for PoolBox<'_, T> {
    fn drop(&mut self) {
        // The handle exclusively owns both the value and its slot.
        unsafe { self.pool.destroy(self.ptr) };
    }
}

impl<T: fmt::Debug> fmt::Debug for PoolBox<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

// The handle owns a T and a reference to the (Sync) pool.
unsafe impl<T: Send> Send for PoolBox<'_, T> {}
unsafe impl<T: Sync> Sync for PoolBox<'_, T> {}
