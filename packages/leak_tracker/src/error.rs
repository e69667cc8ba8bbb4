use thiserror::Error;

use crate::Shape;

/// Protocol violations detected when an allocation is released through the tracker.
///
/// These indicate a bug in the calling code (a double release, a release on the wrong thread,
/// a release as the wrong type or through the wrong release function), not a runtime condition to
/// recover from. The regular release functions panic with this error; the `try_` variants
/// hand it back to the caller without touching the memory.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The address is not a key in the registry consulted by the release.
    #[error(
        "allocation at {address:#x} is not tracked by this registry - it was already released, \
        belongs to another thread or was never allocated through the tracker"
    )]
    NotRegistered {
        /// The address that was being released.
        address: usize,
    },

    /// The address is tracked but was allocated with a different shape than it is being
    /// released with (object versus array, or an array of a different length).
    #[error("allocation at {address:#x} was allocated as {recorded} but released as {requested}")]
    ShapeMismatch {
        /// The address that was being released.
        address: usize,

        /// The shape recorded when the allocation was made.
        recorded: Shape,

        /// The shape implied by the release function that was called.
        requested: Shape,
    },

    /// The address is tracked with the right shape but the type it is being released as has a
    /// different size than the type it was allocated as.
    #[error(
        "allocation at {address:#x} holds {recorded} bytes but was released as a type of \
        {requested} bytes"
    )]
    SizeMismatch {
        /// The address that was being released.
        address: usize,

        /// The size in bytes recorded when the allocation was made.
        recorded: usize,

        /// The size in bytes of the type the release function was called with.
        requested: usize,
    },
}
