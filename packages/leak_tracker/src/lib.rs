#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Opt-in allocation tracking that reports every allocation a thread never released.
//!
//! Allocate through this package instead of `Box::new()` or the raw allocator APIs and each
//! live allocation is recorded together with its type, size and source location. When a
//! thread ends, everything it allocated but did not release is reported as a leak. Reports
//! can also be requested at any time.
//!
//! The core functionality includes:
//! - [`allocate()`] and [`release()`] - allocate and release single objects
//! - [`allocate_array()`] and [`release_array()`] - allocate and release arrays
//! - [`dump_current_thread_registry()`] - report the allocations not yet released
//! - [`set_reporting_callback()`] - decide where leak reports go
//! - [`Registry`] - the address-to-record map behind all of the above
//!
//! This package is not a heap allocator and does not detect use-after-free or buffer overruns.
//! It delegates to the system allocator and only keeps metadata.
//!
//! # Simple usage
//!
//! ```
//! use leak_tracker::{allocate, dump_current_thread_registry, release};
//!
//! #[derive(Default)]
//! struct Session {
//!     id: u64,
//! }
//!
//! let kept = allocate(Session { id: 1 }).expect("out of memory");
//! let forgotten = allocate(Session::default()).expect("out of memory");
//!
//! // SAFETY: The pointer came from `allocate()` on this thread and is not used afterwards.
//! unsafe { release(kept) };
//!
//! // Reports `forgotten` on stderr, naming the `Session` type and this line.
//! dump_current_thread_registry();
//! # // SAFETY: As above.
//! # unsafe { release(forgotten) };
//! ```
//!
//! # Reporting
//!
//! By default, each leak is printed as one line to stderr by [`report_to_stderr()`]. Use
//! [`set_reporting_callback()`] to send reports elsewhere, such as [`report_to_tracing()`]
//! or a collector of your own. The callback is process-wide and can be replaced at any time.
//!
//! # Registry policy
//!
//! By default every thread records into its own [`Registry`], without any synchronization
//! between threads. An allocation must then be released on the thread that made it, and each
//! registry is dumped automatically when its thread ends, including when it ends by panicking.
//!
//! Enable the `shared_registry` feature to record all threads into one registry behind a mutex.
//! Allocations may then be released on any thread, at the cost of contention. The shared
//! registry is never dumped automatically; use [`dump_current_thread_registry()`] or
//! [`dump_on_drop()`].
//!
//! # Build configuration
//!
//! Tracking is active in builds with `debug_assertions`. In other builds the allocation
//! functions go straight to the system allocator with no tracking overhead, unless the
//! `always_on` feature is enabled. See [`tracking_enabled()`].
//!
//! # Protocol violations
//!
//! Releasing an address that is not recorded, releasing an array as a single object (or
//! the other way around), or releasing as a type of another size is a bug in the caller. While tracking is active, [`release()`] and
//! [`release_array()`] panic on such violations before touching the memory, in every build
//! profile. [`try_release()`] and [`try_release_array()`] return an [`Error`] instead.

mod constants;
mod error;
mod intercept;
mod leak;
mod record;
mod registry;
mod reporting;
mod scope;

pub use error::*;
pub use intercept::*;
pub use leak::Leak;
pub use record::{AllocationRecord, CallSite, Shape};
pub use registry::Registry;
pub use reporting::{
    report_to_stderr, report_to_tracing, reset_reporting_callback, set_reporting_callback,
};
pub use scope::{DumpGuard, dump_current_thread_registry, dump_on_drop, tracking_enabled};
