use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::{Relaxed, Acquire, Release};

/// A trait for types that maintain their own thread-safe, internal reference count,
/// rather than relying on external reference counting like `Arc` does. This is more
/// compact than `Arc` (which stores two separate `usize` counters) when the refcount
/// can be packed alongside other per-object state, as `Writer` does.
pub trait AtomicRefCounted {
    /// Current reference count. May have changed by the time the caller observes it.
    fn refcount(&self) -> u32;
    /// Increase the shared, internal reference count.
    fn incref(&self);
    /// Decrease the shared, internal reference count. Returns true if it reached 0.
    fn decref(&self) -> bool;
}

/// `Ark<T>` is an atomic, internally-refcounted pointer to a `T: AtomicRefCounted`.
/// Cheaper than `Arc<T>` for types that already track their own refcount, and allows
/// atomically swapping which `T` is referenced.
pub struct Ark<T: AtomicRefCounted> {
    ptr: AtomicPtr<T>,
    phantom: PhantomData<T>,
}

impl<T: AtomicRefCounted> Ark<T> {
    pub fn new(obj: T) -> Self {
        debug_assert_eq!(obj.refcount(), 1);
        Self {
            ptr: AtomicPtr::new(Box::leak(Box::new(obj)) as *mut T),
            phantom: PhantomData,
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        self.ptr.load(Relaxed).is_null()
    }

    #[inline]
    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    /// Construct an Ark pointing at `obj` without modifying its refcount.
    /// Safety: caller must own one unit of refcount on `obj` that is being transferred here.
    pub unsafe fn from_raw(obj: *mut T) -> Self {
        Self { ptr: AtomicPtr::new(obj), phantom: PhantomData }
    }

    #[inline]
    pub fn load(&self) -> Option<&T> {
        let p = self.ptr.load(Acquire);
        if p.is_null() { None } else { Some(unsafe { &*p }) }
    }
}

impl<T: AtomicRefCounted> Deref for Ark<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.load().expect("Ark is None")
    }
}

impl<T: AtomicRefCounted> Drop for Ark<T> {
    fn drop(&mut self) {
        if let Some(obj) = self.load() {
            if obj.decref() {
                unsafe { drop(Box::from_raw(obj as *const T as *mut T)); }
            }
        }
    }
}

impl<T: AtomicRefCounted> Default for Ark<T> {
    fn default() -> Self {
        Self { ptr: AtomicPtr::new(std::ptr::null_mut()), phantom: PhantomData }
    }
}

impl<T: AtomicRefCounted> Clone for Ark<T> {
    fn clone(&self) -> Self {
        if let Some(obj) = self.load() {
            obj.incref();
            Self { ptr: AtomicPtr::new(obj as *const T as *mut T), phantom: PhantomData }
        } else {
            Self::default()
        }
    }
}

unsafe impl<T: Sync + Send + AtomicRefCounted> Send for Ark<T> {}
unsafe impl<T: Sync + Send + AtomicRefCounted> Sync for Ark<T> {}
