//! Mapping from live allocation addresses to their records.

use std::collections::hash_map::Entry;

use foldhash::{HashMap, HashMapExt};

use crate::{AllocationRecord, Error, Leak, Shape, reporting};

/// The set of live allocations made through the tracker, keyed by address.
///
/// The interception functions maintain one registry per thread (or one for the whole process
/// with the `shared_registry` feature) and there is normally no need to touch this type.
/// It is public for callers that want to keep a registry of their own, for example one handed
/// to each worker when it is spawned.
///
/// Addresses are opaque keys. The registry never dereferences them.
///
/// # Examples
///
/// ```
/// use std::thread;
///
/// use leak_tracker::{AllocationRecord, CallSite, Registry, Shape};
///
/// let mut registry = Registry::new();
/// registry.register(
///     0x1000,
///     AllocationRecord::new(
///         "u64",
///         8,
///         CallSite::new("file.rs", 1),
///         Shape::Object,
///         thread::current().id(),
///     ),
/// );
///
/// let mut leaks = Vec::new();
/// registry.dump_to(|leak| leaks.push(leak.address()));
/// assert_eq!(leaks, [0x1000]);
///
/// registry.unregister(0x1000, Shape::Object).unwrap();
/// assert!(registry.is_empty());
/// ```
///
/// # Thread safety
///
/// This type is thread-mobile ([`Send`]) and can be shared ([`Sync`]) for reading. All mutation
/// requires exclusive access, so a registry used from several threads must sit behind a lock.
#[derive(Debug, Default)]
pub struct Registry {
    // Keys are addresses, which are never attacker-controlled.
    allocations: HashMap<usize, AllocationRecord>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            allocations: HashMap::new(),
        }
    }

    /// Starts tracking the allocation at `address`.
    ///
    /// # Panics
    ///
    /// Panics if `address` is already tracked. Live allocations cannot share an address, so
    /// this means an allocation was released without going through the tracker.
    pub fn register(&mut self, address: usize, record: AllocationRecord) {
        match self.allocations.entry(address) {
            Entry::Occupied(existing) => panic!(
                "allocation at {address:#x} registered twice - already tracking {} from {}",
                existing.get().type_name(),
                existing.get().call_site()
            ),
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }
    }

    /// Stops tracking the allocation at `address`, returning its record.
    ///
    /// `shape` is the shape the caller is about to release the memory as. It must match the
    /// shape the allocation was registered with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRegistered`] if `address` is not tracked and [`Error::ShapeMismatch`]
    /// if it is tracked with a different shape. The registry is unchanged in both cases.
    pub fn unregister(&mut self, address: usize, shape: Shape) -> Result<AllocationRecord, Error> {
        match self.allocations.entry(address) {
            Entry::Vacant(_) => Err(Error::NotRegistered { address }),
            Entry::Occupied(entry) if entry.get().shape() != shape => Err(Error::ShapeMismatch {
                address,
                recorded: entry.get().shape(),
                requested: shape,
            }),
            Entry::Occupied(entry) => Ok(entry.remove()),
        }
    }

    /// Reports every tracked allocation to the process-wide reporting callback.
    ///
    /// Nothing is removed: dumping again reports the same allocations until they are released.
    ///
    /// The callback is looked up once per dump, so replacing it while a dump is in progress
    /// affects only later dumps.
    pub fn dump(&self) {
        let reporter = reporting::current();
        self.dump_to(|leak| reporter.report(leak));
    }

    /// Reports every tracked allocation to `reporter` instead of the process-wide callback.
    pub fn dump_to(&self, mut reporter: impl FnMut(&Leak<'_>)) {
        for (&address, record) in &self.allocations {
            reporter(&Leak::new(address, record));
        }
    }

    /// The record of the allocation at `address`, if it is tracked.
    #[must_use]
    pub fn get(&self, address: usize) -> Option<&AllocationRecord> {
        self.allocations.get(&address)
    }

    /// Number of tracked allocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    /// Whether no allocations are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::CallSite;

    fn record(size: usize, shape: Shape) -> AllocationRecord {
        AllocationRecord::new(
            "test::Item",
            size,
            CallSite::new("file.ext", 10),
            shape,
            thread::current().id(),
        )
    }

    fn dumped_addresses(registry: &Registry) -> Vec<usize> {
        let mut addresses = Vec::new();
        registry.dump_to(|leak| addresses.push(leak.address()));
        addresses.sort_unstable();
        addresses
    }

    #[test]
    fn new_registry_is_empty() {
        let registry = Registry::new();

        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(dumped_addresses(&registry).is_empty());
    }

    #[test]
    fn register_then_unregister_in_any_order_leaves_nothing() {
        let mut registry = Registry::new();

        for address in (0x100..0x110).step_by(8) {
            registry.register(address, record(8, Shape::Object));
        }
        assert_eq!(registry.len(), 2);

        for address in [0x108, 0x100] {
            registry.unregister(address, Shape::Object).unwrap();
        }

        assert!(registry.is_empty());
        assert!(dumped_addresses(&registry).is_empty());
    }

    #[test]
    fn unregister_returns_record() {
        let mut registry = Registry::new();
        registry.register(0x40, record(24, Shape::Object));

        let removed = registry.unregister(0x40, Shape::Object).unwrap();

        assert_eq!(removed.size(), 24);
        assert_eq!(removed.file(), "file.ext");
        assert_eq!(removed.line(), 10);
    }

    #[test]
    fn unregister_absent_address_is_error() {
        let mut registry = Registry::new();

        let result = registry.unregister(0x40, Shape::Object);

        assert!(matches!(result, Err(Error::NotRegistered { address: 0x40 })));
    }

    #[test]
    fn unregister_twice_is_error() {
        let mut registry = Registry::new();
        registry.register(0x40, record(8, Shape::Object));
        registry.unregister(0x40, Shape::Object).unwrap();

        let result = registry.unregister(0x40, Shape::Object);

        assert!(matches!(result, Err(Error::NotRegistered { .. })));
    }

    #[test]
    fn shape_mismatch_is_error_and_keeps_entry() {
        let mut registry = Registry::new();
        registry.register(0x40, record(32, Shape::Array { len: 4 }));

        let as_object = registry.unregister(0x40, Shape::Object);
        assert!(matches!(
            as_object,
            Err(Error::ShapeMismatch {
                address: 0x40,
                recorded: Shape::Array { len: 4 },
                requested: Shape::Object,
            })
        ));

        let wrong_len = registry.unregister(0x40, Shape::Array { len: 5 });
        assert!(matches!(wrong_len, Err(Error::ShapeMismatch { .. })));

        assert_eq!(registry.len(), 1);
        registry.unregister(0x40, Shape::Array { len: 4 }).unwrap();
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn register_twice_panics() {
        let mut registry = Registry::new();
        registry.register(0x40, record(8, Shape::Object));
        registry.register(0x40, record(8, Shape::Object));
    }

    #[test]
    fn dump_reports_every_entry_and_keeps_them() {
        let mut registry = Registry::new();
        registry.register(0x10, record(24, Shape::Object));
        registry.register(0x20, record(4, Shape::Object));

        assert_eq!(dumped_addresses(&registry), [0x10, 0x20]);
        assert_eq!(dumped_addresses(&registry), [0x10, 0x20]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn dump_passes_record_details() {
        let mut registry = Registry::new();
        registry.register(0x10, record(24, Shape::Object));

        let mut reported = Vec::new();
        registry.dump_to(|leak| reported.push((leak.size(), leak.file(), leak.line())));

        assert_eq!(reported, [(24, "file.ext", 10)]);
    }

    #[test]
    fn get_finds_tracked_address_only() {
        let mut registry = Registry::new();
        registry.register(0x10, record(24, Shape::Object));

        assert_eq!(registry.get(0x10).map(AllocationRecord::size), Some(24));
        assert!(registry.get(0x20).is_none());
    }

    static_assertions::assert_impl_all!(Registry: Send, Sync);
}
