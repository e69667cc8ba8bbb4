use std::fmt;
use std::thread::ThreadId;

use crate::{AllocationRecord, CallSite, Shape};

/// One allocation that was still registered when a registry was dumped.
///
/// This is what the reporting callback receives, once per remaining allocation. The `Display`
/// implementation renders the single line the default callback prints.
#[derive(Clone, Copy, Debug)]
pub struct Leak<'a> {
    address: usize,
    record: &'a AllocationRecord,
}

impl<'a> Leak<'a> {
    pub(crate) fn new(address: usize, record: &'a AllocationRecord) -> Self {
        Self { address, record }
    }

    /// Address of the allocation. It is only meant for display and must not be dereferenced.
    #[must_use]
    pub fn address(&self) -> usize {
        self.address
    }

    /// The full record of the allocation.
    #[must_use]
    pub fn record(&self) -> &'a AllocationRecord {
        self.record
    }

    /// Name of the allocated type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.record.type_name()
    }

    /// Size of the allocation in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.record.size()
    }

    /// Where the allocation was made.
    #[must_use]
    pub fn call_site(&self) -> CallSite {
        self.record.call_site()
    }

    /// The source file the allocation is attributed to.
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.record.file()
    }

    /// The source line the allocation is attributed to.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.record.line()
    }

    /// Whether the allocation holds one object or an array.
    #[must_use]
    pub fn shape(&self) -> Shape {
        self.record.shape()
    }

    /// The thread that made the allocation.
    #[must_use]
    pub fn thread(&self) -> ThreadId {
        self.record.thread()
    }
}

impl fmt::Display for Leak<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?}] unreleased allocation at {:#x} ({} bytes) of type {} [{}]",
            self.thread(),
            self.address,
            self.size(),
            self.type_name(),
            self.call_site()
        )
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn display_contains_provenance() {
        let record = AllocationRecord::new(
            "my_crate::Widget",
            24,
            CallSite::new("file.ext", 10),
            Shape::Object,
            thread::current().id(),
        );
        let leak = Leak::new(0x1000, &record);

        let line = leak.to_string();
        assert!(line.contains("0x1000"));
        assert!(line.contains("24 bytes"));
        assert!(line.contains("my_crate::Widget"));
        assert!(line.contains("file.ext:10"));
        assert!(line.contains(&format!("{:?}", thread::current().id())));
    }

    #[test]
    fn accessors_forward_to_record() {
        let record = AllocationRecord::new(
            "u8",
            1,
            CallSite::new("x.rs", 3),
            Shape::Array { len: 1 },
            thread::current().id(),
        );
        let leak = Leak::new(42, &record);

        assert_eq!(leak.address(), 42);
        assert_eq!(leak.type_name(), "u8");
        assert_eq!(leak.size(), 1);
        assert_eq!(leak.file(), "x.rs");
        assert_eq!(leak.line(), 3);
        assert_eq!(leak.shape(), Shape::Array { len: 1 });
        assert_eq!(leak.record(), &record);
    }
}
