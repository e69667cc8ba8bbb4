//! Allocation and release functions that keep the registry in sync with live allocations.
//!
//! Every allocation is recorded before the caller sees the pointer, and every release removes
//! the record before the memory is freed. Single objects and arrays are released through
//! separate functions, mirroring the allocation functions they came from.
//!
//! Once the registry of a thread has been torn down, which only happens when a thread-local
//! destructor runs after the one that dumps the registry, allocations made on that thread
//! are not recorded and releases free their memory without consulting the registry. The
//! final report for the thread has already been made by then.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use scopeguard::ScopeGuard;

use crate::{AllocationRecord, CallSite, Error, Shape, scope, tracking_enabled};

/// Moves `value` into a new heap allocation and records it in the registry of this thread.
///
/// The allocation is attributed to the caller of this function. Returns `None` if the system
/// allocator cannot satisfy the request, in which case `value` is dropped and nothing is
/// recorded. There is no way to recover from that beyond what the caller decides;
/// [`std::alloc::handle_alloc_error()`] is the conventional response.
///
/// Release the allocation with [`release()`], on the same thread unless the `shared_registry`
/// feature is enabled.
///
/// # Examples
///
/// ```
/// use std::alloc::{Layout, handle_alloc_error};
///
/// use leak_tracker::{allocate, release};
///
/// let Some(point) = allocate((1_i32, 2_i32)) else {
///     handle_alloc_error(Layout::new::<(i32, i32)>());
/// };
///
/// // SAFETY: The allocation is live and we have exclusive access to it.
/// assert_eq!(unsafe { point.as_ref() }, &(1, 2));
///
/// // SAFETY: The pointer came from `allocate()` on this thread and is not used afterwards.
/// unsafe { release(point) };
/// ```
#[must_use = "the allocation is leaked if the pointer is dropped"]
#[track_caller]
pub fn allocate<T>(value: T) -> Option<NonNull<T>> {
    allocate_at(CallSite::caller(), value)
}

/// Like [`allocate()`] but attributes the allocation to `call_site`.
#[must_use = "the allocation is leaked if the pointer is dropped"]
pub fn allocate_at<T>(call_site: CallSite, value: T) -> Option<NonNull<T>> {
    let layout = Layout::new::<T>();
    let ptr = allocate_storage(layout)?.cast::<T>();

    // SAFETY: The storage was just allocated with the layout of T, so it is valid for writes
    // and properly aligned. Nobody else has the pointer yet.
    unsafe {
        ptr.write(value);
    }

    if tracking_enabled() {
        let record = AllocationRecord::object::<T>(call_site);
        // Unrecorded if the registry of this thread is already torn down.
        _ = scope::with_registry(|registry| registry.register(address_of(ptr), record));
    }

    Some(ptr)
}

/// Allocates an array of `len` default values and records it in the registry of this thread.
///
/// The allocation is attributed to the caller of this function. Returns `None` if the system
/// allocator cannot satisfy the request or the array size overflows `isize`.
///
/// Release the allocation with [`release_array()`], never with [`release()`].
///
/// # Examples
///
/// ```
/// use leak_tracker::{allocate_array, release_array};
///
/// let buffer = allocate_array::<u8>(1000).expect("out of memory");
///
/// // SAFETY: The allocation is live and we have exclusive access to it.
/// assert!(unsafe { buffer.as_ref() }.iter().all(|&byte| byte == 0));
///
/// // SAFETY: The pointer came from `allocate_array()` on this thread and is not used afterwards.
/// unsafe { release_array(buffer) };
/// ```
#[must_use = "the allocation is leaked if the pointer is dropped"]
#[track_caller]
pub fn allocate_array<T: Default>(len: usize) -> Option<NonNull<[T]>> {
    allocate_array_with_at(CallSite::caller(), len, |_| T::default())
}

/// Like [`allocate_array()`] but attributes the allocation to `call_site`.
#[must_use = "the allocation is leaked if the pointer is dropped"]
pub fn allocate_array_at<T: Default>(call_site: CallSite, len: usize) -> Option<NonNull<[T]>> {
    allocate_array_with_at(call_site, len, |_| T::default())
}

/// Allocates an array of `len` values produced by `init` and records it in the registry of
/// this thread.
///
/// `init` is called with the index of each element, in order. If it panics, the elements
/// produced so far are dropped, the memory is freed and nothing is recorded.
///
/// The allocation is attributed to the caller of this function.
///
/// # Examples
///
/// ```
/// use leak_tracker::{allocate_array_with, release_array};
///
/// let squares = allocate_array_with(4, |index| index * index).expect("out of memory");
///
/// // SAFETY: The allocation is live and we have exclusive access to it.
/// assert_eq!(unsafe { squares.as_ref() }, &[0, 1, 4, 9]);
///
/// // SAFETY: The pointer came from `allocate_array_with()` on this thread and is not used
/// // afterwards.
/// unsafe { release_array(squares) };
/// ```
#[must_use = "the allocation is leaked if the pointer is dropped"]
#[track_caller]
pub fn allocate_array_with<T>(len: usize, init: impl FnMut(usize) -> T) -> Option<NonNull<[T]>> {
    allocate_array_with_at(CallSite::caller(), len, init)
}

/// Like [`allocate_array_with()`] but attributes the allocation to `call_site`.
#[must_use = "the allocation is leaked if the pointer is dropped"]
pub fn allocate_array_with_at<T>(
    call_site: CallSite,
    len: usize,
    mut init: impl FnMut(usize) -> T,
) -> Option<NonNull<[T]>> {
    let layout = Layout::array::<T>(len).ok()?;
    let base = allocate_storage(layout)?.cast::<T>();

    // Holds the number of initialized elements. Disarmed once the array is complete.
    let mut initialized = scopeguard::guard(0_usize, |initialized| {
        // SAFETY: Exactly the first `initialized` elements have been written and nobody else
        // has seen the pointer. The storage was allocated with `layout` just above.
        unsafe {
            NonNull::slice_from_raw_parts(base, initialized).drop_in_place();
        }

        // SAFETY: The storage was allocated with `layout` and its elements are dropped.
        unsafe {
            release_storage(base.cast(), layout);
        }
    });

    for index in 0..len {
        *initialized = index;

        // SAFETY: `index` is below `len`, so the offset stays inside the allocation.
        let element = unsafe { base.add(index) };
        let value = init(index);

        // SAFETY: The element is inside the allocation, which is aligned for T, and has not
        // been written yet.
        unsafe {
            element.write(value);
        }
    }

    ScopeGuard::into_inner(initialized);

    let array = NonNull::slice_from_raw_parts(base, len);

    if tracking_enabled() {
        let record = AllocationRecord::array::<T>(len, layout.size(), call_site);
        // Unrecorded if the registry of this thread is already torn down.
        _ = scope::with_registry(|registry| registry.register(address_of(array), record));
    }

    Some(array)
}

/// Removes a single object from the registry, drops it and frees its memory.
///
/// # Safety
///
/// `ptr` must have been returned by [`allocate()`] or [`allocate_at()`] and not released yet.
/// Without the `shared_registry` feature, it must be released on the thread that allocated it.
/// The pointer and any reference derived from it must not be used afterwards.
///
/// # Panics
///
/// When tracking is enabled, panics without touching the memory if `ptr` is not recorded as a
/// single object of the size of `T` in the registry of this thread. This catches double
/// releases, releases on the wrong thread, releases as a type of another size and releases of
/// arrays through this function.
pub unsafe fn release<T>(ptr: NonNull<T>) {
    // SAFETY: Forwarding the guarantees of our caller.
    if let Err(error) = unsafe { try_release(ptr) } {
        panic!("{error}");
    }
}

/// Like [`release()`] but returns protocol violations as an error instead of panicking.
///
/// # Safety
///
/// Same as [`release()`]. With tracking enabled, a pointer that is not recorded as a single
/// object is rejected before it is dereferenced.
///
/// # Errors
///
/// Returns [`Error::NotRegistered`] or [`Error::ShapeMismatch`] if tracking is enabled and the
/// registry of this thread does not hold `ptr` as a single object. Returns
/// [`Error::SizeMismatch`] if it was allocated as a type of a different size than `T`.
/// Nothing is released then.
pub unsafe fn try_release<T>(ptr: NonNull<T>) -> Result<(), Error> {
    untrack(address_of(ptr), Shape::Object, size_of::<T>())?;

    // SAFETY: Our caller guarantees the pointer came from `allocate()`, so it holds a live T
    // that nobody else will access again.
    unsafe {
        ptr.drop_in_place();
    }

    // SAFETY: `allocate()` allocated the storage with the layout of T and the value is dropped.
    unsafe {
        release_storage(ptr.cast(), Layout::new::<T>());
    }

    Ok(())
}

/// Removes an array from the registry, drops its elements and frees its memory.
///
/// # Safety
///
/// `ptr` must have been returned by one of the `allocate_array` functions, with its length
/// unchanged, and not released yet. Without the `shared_registry` feature, it must be released
/// on the thread that allocated it. The pointer and any reference derived from it must not be
/// used afterwards.
///
/// # Panics
///
/// When tracking is enabled, panics without touching the memory if `ptr` is not recorded as an
/// array of this length and element size in the registry of this thread.
pub unsafe fn release_array<T>(ptr: NonNull<[T]>) {
    // SAFETY: Forwarding the guarantees of our caller.
    if let Err(error) = unsafe { try_release_array(ptr) } {
        panic!("{error}");
    }
}

/// Like [`release_array()`] but returns protocol violations as an error instead of panicking.
///
/// # Safety
///
/// Same as [`release_array()`]. With tracking enabled, a pointer that is not recorded as an
/// array of this length is rejected before it is dereferenced.
///
/// # Errors
///
/// Returns [`Error::NotRegistered`] or [`Error::ShapeMismatch`] if tracking is enabled and the
/// registry of this thread does not hold `ptr` as an array of `ptr.len()` elements. Returns
/// [`Error::SizeMismatch`] if the array was allocated with elements of a different size than
/// `T`. Nothing is released then.
pub unsafe fn try_release_array<T>(ptr: NonNull<[T]>) -> Result<(), Error> {
    let len = ptr.len();

    untrack(
        address_of(ptr),
        Shape::Array { len },
        size_of::<T>().saturating_mul(len),
    )?;

    let layout = Layout::array::<T>(len)
        .expect("the layout was valid when the array was allocated with this length");

    // SAFETY: Our caller guarantees the pointer came from an `allocate_array` function with
    // this length, so it holds `len` live elements that nobody else will access again.
    unsafe {
        ptr.drop_in_place();
    }

    // SAFETY: The storage was allocated with the array layout for `len` elements and the
    // elements are dropped.
    unsafe {
        release_storage(ptr.cast(), layout);
    }

    Ok(())
}

/// Removes `address` from the registry if it is recorded with the given shape and size.
///
/// The registry is left untouched on error. Succeeds without checking anything when tracking
/// is disabled or the registry of this thread has been torn down.
fn untrack(address: usize, shape: Shape, size: usize) -> Result<(), Error> {
    if !tracking_enabled() {
        return Ok(());
    }

    scope::with_registry(|registry| {
        if let Some(record) = registry.get(address) {
            if record.shape() == shape && record.size() != size {
                return Err(Error::SizeMismatch {
                    address,
                    recorded: record.size(),
                    requested: size,
                });
            }
        }

        registry.unregister(address, shape)?;
        Ok(())
    })
    .unwrap_or(Ok(()))
}

fn address_of<T: ?Sized>(ptr: NonNull<T>) -> usize {
    ptr.as_ptr().addr()
}

/// Zero-sized requests still get one byte so that every live allocation has its own address.
fn storage_layout(layout: Layout) -> Layout {
    Layout::from_size_align(layout.size().max(1), layout.align())
        .expect("growing a valid layout from zero to one byte keeps it valid")
}

fn allocate_storage(layout: Layout) -> Option<NonNull<u8>> {
    // SAFETY: The storage layout never has zero size.
    NonNull::new(unsafe { alloc::alloc(storage_layout(layout)) })
}

/// # Safety
///
/// `ptr` must come from `allocate_storage(layout)` and must not be used afterwards.
unsafe fn release_storage(ptr: NonNull<u8>, layout: Layout) {
    // SAFETY: Forwarding the guarantees of our caller; the storage layout is derived the same
    // way as on allocation.
    unsafe {
        alloc::dealloc(ptr.as_ptr(), storage_layout(layout));
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::rc::Rc;

    use super::*;

    fn is_tracked(address: usize) -> bool {
        scope::with_registry(|registry| registry.get(address).is_some()).unwrap()
    }

    struct DropCounter(Rc<Cell<usize>>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn allocate_moves_value_and_records_it() {
        let ptr = allocate(0x5eed_u64).unwrap();

        // SAFETY: Live allocation, exclusive access.
        assert_eq!(unsafe { *ptr.as_ref() }, 0x5eed);
        assert_eq!(is_tracked(address_of(ptr)), tracking_enabled());

        // SAFETY: Allocated above on this thread, not used afterwards.
        unsafe { release(ptr) };

        // A shared registry may already hold a new allocation from a parallel test here.
        #[cfg(not(feature = "shared_registry"))]
        assert!(!is_tracked(address_of(ptr)));
    }

    #[test]
    fn release_drops_value() {
        let drops = Rc::new(Cell::new(0));
        let ptr = allocate(DropCounter(Rc::clone(&drops))).unwrap();

        // SAFETY: Allocated above on this thread, not used afterwards.
        unsafe { release(ptr) };

        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn zero_sized_allocations_have_distinct_addresses() {
        let first = allocate(()).unwrap();
        let second = allocate(()).unwrap();

        assert_ne!(address_of(first), address_of(second));

        // SAFETY: Allocated above on this thread, not used afterwards.
        unsafe {
            release(first);
        }
        // SAFETY: Allocated above on this thread, not used afterwards.
        unsafe {
            release(second);
        }
    }

    #[test]
    fn array_elements_are_initialized_in_order_and_dropped() {
        let drops = Rc::new(Cell::new(0));
        let array = allocate_array_with(3, |_| DropCounter(Rc::clone(&drops))).unwrap();

        assert_eq!(array.len(), 3);

        // SAFETY: Allocated above on this thread, not used afterwards.
        unsafe { release_array(array) };

        assert_eq!(drops.get(), 3);
    }

    #[test]
    fn empty_array_is_tracked_and_released() {
        let array = allocate_array::<u64>(0).unwrap();

        assert_eq!(is_tracked(address_of(array)), tracking_enabled());

        // SAFETY: Allocated above on this thread, not used afterwards.
        unsafe { release_array(array) };
    }

    #[test]
    fn oversized_array_is_none() {
        assert!(allocate_array::<u64>(usize::MAX).is_none());
    }

    #[test]
    fn panicking_initializer_drops_written_elements_and_records_nothing() {
        let drops = Rc::new(Cell::new(0));

        let result = catch_unwind(AssertUnwindSafe(|| {
            allocate_array_with(5, |index| {
                assert!(index < 2, "initializer failure");
                DropCounter(Rc::clone(&drops))
            })
        }));

        assert!(result.is_err());
        assert_eq!(drops.get(), 2);
        #[cfg(not(feature = "shared_registry"))]
        assert!(scope::with_registry(|registry| registry.is_empty()).unwrap());
    }

    #[test]
    fn array_record_covers_all_elements() {
        let array = allocate_array::<u32>(5).unwrap();

        if tracking_enabled() {
            let (size, shape) = scope::with_registry(|registry| {
                let record = registry.get(address_of(array)).unwrap();
                (record.size(), record.shape())
            })
            .unwrap();
            assert_eq!(size, 20);
            assert_eq!(shape, Shape::Array { len: 5 });
        }

        // SAFETY: Allocated above on this thread, not used afterwards.
        unsafe { release_array(array) };
    }

    #[test]
    #[cfg(any(debug_assertions, feature = "always_on"))]
    fn array_released_as_object_is_rejected() {
        let array = allocate_array::<u32>(4).unwrap();

        // SAFETY: Tracking is enabled, so the mismatched release is rejected before the
        // pointer is used.
        let result = unsafe { try_release(array.cast::<u32>()) };
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));

        // SAFETY: Allocated above on this thread, not used afterwards.
        unsafe { release_array(array) };
    }

    #[test]
    #[cfg(any(debug_assertions, feature = "always_on"))]
    fn object_released_as_array_is_rejected() {
        let object = allocate(7_u32).unwrap();

        // SAFETY: Tracking is enabled, so the mismatched release is rejected before the
        // pointer is used.
        let result = unsafe { try_release_array(NonNull::slice_from_raw_parts(object, 1)) };
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));

        // SAFETY: Allocated above on this thread, not used afterwards.
        unsafe { release(object) };
    }

    #[test]
    #[cfg(any(debug_assertions, feature = "always_on"))]
    fn untracked_pointer_is_rejected() {
        let mut local = 5_u32;

        // SAFETY: Tracking is enabled, so the untracked pointer is rejected before it is used.
        let result = unsafe { try_release(NonNull::from(&mut local)) };

        assert!(matches!(result, Err(Error::NotRegistered { .. })));
        assert_eq!(local, 5);
    }

    #[test]
    #[cfg(any(debug_assertions, feature = "always_on"))]
    fn object_released_as_type_of_other_size_is_rejected() {
        let object = allocate(0x1234_5678_u64).unwrap();

        // SAFETY: Tracking is enabled, so the mismatched release is rejected before the
        // pointer is used.
        let result = unsafe { try_release(object.cast::<u32>()) };
        assert!(matches!(
            result,
            Err(Error::SizeMismatch {
                recorded: 8,
                requested: 4,
                ..
            })
        ));

        // The rejected release leaves the allocation recorded.
        assert!(is_tracked(address_of(object)));

        // SAFETY: Allocated above on this thread, not used afterwards.
        unsafe { release(object) };
    }

    #[test]
    #[cfg(any(debug_assertions, feature = "always_on"))]
    fn array_released_with_elements_of_other_size_is_rejected() {
        let array = allocate_array::<u32>(4).unwrap();

        // SAFETY: Tracking is enabled, so the mismatched release is rejected before the
        // pointer is used.
        let result = unsafe {
            try_release_array(NonNull::slice_from_raw_parts(array.cast::<u16>(), 4))
        };
        assert!(matches!(
            result,
            Err(Error::SizeMismatch {
                recorded: 16,
                requested: 8,
                ..
            })
        ));
        assert!(is_tracked(address_of(array)));

        // SAFETY: Allocated above on this thread, not used afterwards.
        unsafe { release_array(array) };
    }
}
