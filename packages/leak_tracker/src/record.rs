//! Provenance captured for each tracked allocation.

use std::any::type_name;
use std::fmt;
use std::panic::Location;
use std::thread::{self, ThreadId};

/// A source location that an allocation is attributed to.
///
/// The allocation functions without an `_at` suffix capture their caller automatically. Use
/// [`call_site!`][crate::call_site] or [`CallSite::new()`] when the location has to be supplied
/// explicitly, for example when a helper function allocates on behalf of its own caller.
///
/// # Examples
///
/// ```
/// use leak_tracker::{CallSite, call_site};
///
/// let here = call_site!();
/// assert_eq!(here.file(), file!());
///
/// let elsewhere = CallSite::new("parser.rs", 120);
/// assert_eq!(elsewhere.line(), 120);
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CallSite {
    file: &'static str,
    line: u32,
}

impl CallSite {
    /// Creates a call site from a file name and a line number.
    #[must_use]
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }

    /// Captures the location of the caller of the current function.
    ///
    /// Inside a `#[track_caller]` function this resolves to the caller of that function,
    /// recursively.
    #[must_use]
    #[track_caller]
    pub fn caller() -> Self {
        Location::caller().into()
    }

    /// The source file the allocation is attributed to.
    #[must_use]
    pub const fn file(self) -> &'static str {
        self.file
    }

    /// The line within [`file()`][Self::file] the allocation is attributed to.
    #[must_use]
    pub const fn line(self) -> u32 {
        self.line
    }
}

impl From<&'static Location<'static>> for CallSite {
    fn from(location: &'static Location<'static>) -> Self {
        Self::new(location.file(), location.line())
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Expands to the [`CallSite`] of the macro invocation.
///
/// # Examples
///
/// ```
/// use leak_tracker::{allocate_at, call_site, release};
///
/// let value = allocate_at(call_site!(), 7_u16).expect("out of memory");
///
/// // SAFETY: The pointer came from `allocate_at()` on this thread and is not used afterwards.
/// unsafe { release(value) };
/// ```
#[macro_export]
macro_rules! call_site {
    () => {
        $crate::CallSite::new(::core::file!(), ::core::line!())
    };
}

/// Whether a tracked allocation holds a single object or an array of objects.
///
/// Memory must be released through the same flavour of release function it was allocated
/// with, so the shape is part of every record and is verified on release.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Shape {
    /// One value, from [`allocate()`][crate::allocate] or [`allocate_at()`][crate::allocate_at].
    Object,

    /// A contiguous run of values, from one of the `allocate_array` functions.
    Array {
        /// Number of elements in the array.
        len: usize,
    },
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object => write!(f, "single object"),
            Self::Array { len } => write!(f, "array of {len}"),
        }
    }
}

/// Describes one live allocation: what it holds, how large it is and where it came from.
///
/// Records are immutable. The registry that holds a record owns it and drops it when the
/// allocation is released.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AllocationRecord {
    type_name: &'static str,
    size: usize,
    call_site: CallSite,
    shape: Shape,
    thread: ThreadId,
}

impl AllocationRecord {
    /// Creates a record from its parts.
    ///
    /// The interception functions build records themselves; this is for callers that
    /// manage a [`Registry`][crate::Registry] directly.
    #[must_use]
    pub const fn new(
        type_name: &'static str,
        size: usize,
        call_site: CallSite,
        shape: Shape,
        thread: ThreadId,
    ) -> Self {
        Self {
            type_name,
            size,
            call_site,
            shape,
            thread,
        }
    }

    pub(crate) fn object<T>(call_site: CallSite) -> Self {
        Self::new(
            type_name::<T>(),
            size_of::<T>(),
            call_site,
            Shape::Object,
            thread::current().id(),
        )
    }

    pub(crate) fn array<T>(len: usize, size: usize, call_site: CallSite) -> Self {
        Self::new(
            type_name::<[T]>(),
            size,
            call_site,
            Shape::Array { len },
            thread::current().id(),
        )
    }

    /// Name of the allocated type, as reported by [`std::any::type_name()`].
    ///
    /// Arrays are named as slices of their element type, e.g. `[u8]`.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Number of bytes requested for the allocation. For arrays, this covers all elements.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Where the allocation was made.
    #[must_use]
    pub fn call_site(&self) -> CallSite {
        self.call_site
    }

    /// The source file the allocation is attributed to.
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.call_site.file()
    }

    /// The source line the allocation is attributed to.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.call_site.line()
    }

    /// Whether the allocation holds one object or an array.
    #[must_use]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// The thread that made the allocation.
    #[must_use]
    pub fn thread(&self) -> ThreadId {
        self.thread
    }
}
