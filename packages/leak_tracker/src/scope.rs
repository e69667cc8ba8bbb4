//! Which registry the interception functions record into.
//!
//! By default every thread owns a registry in thread-local storage. It is created on first use
//! and dumped when the thread ends. With the `shared_registry` feature, all threads record into
//! one registry behind a mutex, which is only dumped on request.

use std::marker::PhantomData;

/// Whether allocations made through this crate are being recorded.
///
/// Tracking is compiled in when `debug_assertions` are enabled or the `always_on` feature is
/// active. Otherwise the allocation functions forward straight to the system allocator and
/// dumps report nothing.
#[must_use]
#[inline]
pub const fn tracking_enabled() -> bool {
    cfg!(any(debug_assertions, feature = "always_on"))
}

#[cfg(not(feature = "shared_registry"))]
pub(crate) use per_thread::{dump, with_registry};
#[cfg(feature = "shared_registry")]
pub(crate) use shared::{dump, with_registry};

#[cfg(not(feature = "shared_registry"))]
mod per_thread {
    use std::cell::RefCell;

    use crate::Registry;

    /// Owns the registry of one thread and reports its leftovers when the thread ends.
    struct ThreadRegistry {
        registry: RefCell<Registry>,
    }

    impl Drop for ThreadRegistry {
        // Thread-local destructors also run when the thread is unwinding from a panic,
        // so leaks are reported no matter how the thread ended.
        fn drop(&mut self) {
            let registry = self.registry.get_mut();

            if registry.is_empty() {
                return;
            }

            tracing::trace!(
                leaks = registry.len(),
                "thread registry torn down with unreleased allocations"
            );
            registry.dump();
        }
    }

    thread_local! {
        static REGISTRY: ThreadRegistry = ThreadRegistry {
            registry: RefCell::new(Registry::new()),
        };
    }

    /// Runs `f` with exclusive access to the registry of the current thread.
    ///
    /// Returns `None` without calling `f` once the registry of this thread has been torn
    /// down, which happens when another thread-local destructor runs after ours.
    ///
    /// # Panics
    ///
    /// Panics if called from a reporting callback while the registry is being dumped.
    pub(crate) fn with_registry<R>(f: impl FnOnce(&mut Registry) -> R) -> Option<R> {
        REGISTRY
            .try_with(|local| f(&mut local.registry.borrow_mut()))
            .ok()
    }

    pub(crate) fn dump() {
        // Once torn down, the registry has already been dumped for the last time.
        _ = REGISTRY.try_with(|local| local.registry.borrow().dump());
    }
}

#[cfg(feature = "shared_registry")]
mod shared {
    use std::sync::{LazyLock, Mutex};

    use crate::Registry;
    use crate::constants::ERR_POISONED_LOCK;

    // Held for the whole of every register, unregister and dump.
    static REGISTRY: LazyLock<Mutex<Registry>> = LazyLock::new(|| Mutex::new(Registry::new()));

    /// Runs `f` with exclusive access to the process-wide registry. Always returns `Some`.
    pub(crate) fn with_registry<R>(f: impl FnOnce(&mut Registry) -> R) -> Option<R> {
        Some(f(&mut REGISTRY.lock().expect(ERR_POISONED_LOCK)))
    }

    pub(crate) fn dump() {
        REGISTRY.lock().expect(ERR_POISONED_LOCK).dump();
    }
}

/// Reports every allocation still recorded in the registry of the current thread.
///
/// With the `shared_registry` feature, this reports the allocations of all threads instead.
/// Each remaining allocation is passed to the reporting callback once per call; nothing is
/// removed, so calling this again reports the same allocations until they are released.
///
/// Per-thread registries are also dumped automatically when their thread ends.
///
/// # Examples
///
/// ```
/// use leak_tracker::{allocate, dump_current_thread_registry, release};
///
/// let value = allocate(String::from("forgotten")).expect("out of memory");
///
/// // Prints one line about the `String` to stderr.
/// dump_current_thread_registry();
///
/// // SAFETY: The pointer came from `allocate()` on this thread and is not used afterwards.
/// unsafe { release(value) };
/// ```
pub fn dump_current_thread_registry() {
    if tracking_enabled() {
        dump();
    }
}

/// Creates a guard that dumps the registry of the current thread when dropped.
///
/// Hold one at the top of `main()` to get a leak report when the program finishes. This is
/// the way to get a final report with the `shared_registry` feature, which has no automatic
/// teardown, and on platforms that do not run thread-local destructors for the main thread.
///
/// # Examples
///
/// ```
/// fn main() {
///     let _leak_report = leak_tracker::dump_on_drop();
///
///     // ... the program ...
/// } // Unreleased allocations are reported here.
/// ```
pub fn dump_on_drop() -> DumpGuard {
    DumpGuard {
        _single_threaded: PhantomData,
    }
}

/// Dumps the registry of the current thread when dropped. Created by [`dump_on_drop()`].
///
/// The guard is bound to the thread that created it, so it dumps the registry of that thread.
#[derive(Debug)]
#[must_use = "the registry is dumped when the guard is dropped"]
pub struct DumpGuard {
    _single_threaded: PhantomData<*const ()>,
}

impl Drop for DumpGuard {
    fn drop(&mut self) {
        dump_current_thread_registry();
    }
}
