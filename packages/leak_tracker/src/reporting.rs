//! The process-wide callback that receives leaked allocations when a registry is dumped.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, LazyLock, Mutex};

use arc_swap::ArcSwap;

use crate::Leak;
use crate::constants::ERR_POISONED_LOCK;

type ReportFn = dyn Fn(&Leak<'_>) + Send + Sync;

/// An installed reporting callback.
pub(crate) struct Reporter {
    report: Box<ReportFn>,
}

impl Reporter {
    fn new(report: impl Fn(&Leak<'_>) + Send + Sync + 'static) -> Self {
        Self {
            report: Box::new(report),
        }
    }

    #[inline]
    pub(crate) fn report(&self, leak: &Leak<'_>) {
        (self.report)(leak);
    }
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("report", &"<callback>")
            .finish()
    }
}

// Dumps load the slot without locking. Swapping is atomic, so a dump sees either the old or
// the new callback in full.
static CALLBACK: LazyLock<ArcSwap<Reporter>> =
    LazyLock::new(|| ArcSwap::from_pointee(Reporter::new(report_to_stderr)));

// Serializes writers of CALLBACK. Registry locks are never taken while holding this.
static CALLBACK_WRITER: Mutex<()> = Mutex::new(());

// Keeps lines from concurrent dumps on different threads from interleaving.
static STDERR_OUTPUT: Mutex<()> = Mutex::new(());

/// The callback in effect right now.
pub(crate) fn current() -> Arc<Reporter> {
    CALLBACK.load_full()
}

fn install(reporter: Reporter) {
    let _writer = CALLBACK_WRITER.lock().expect(ERR_POISONED_LOCK);
    CALLBACK.store(Arc::new(reporter));
}

/// Replaces the callback that every registry reports leaked allocations to.
///
/// The new callback takes effect for all dumps that start after this returns, on every
/// thread. A dump already in progress on another thread finishes with the callback it
/// started with.
///
/// The callback runs while the registry being dumped is borrowed (or locked, with the
/// `shared_registry` feature), so it must not allocate or release memory through this crate.
/// Allocating through the standard library is fine.
///
/// # Examples
///
/// ```
/// use leak_tracker::{reset_reporting_callback, set_reporting_callback};
///
/// set_reporting_callback(|leak| {
///     eprintln!("{} was left unreleased at {}", leak.type_name(), leak.call_site());
/// });
///
/// // Back to the built-in report on stderr.
/// reset_reporting_callback();
/// ```
pub fn set_reporting_callback<F>(callback: F)
where
    F: Fn(&Leak<'_>) + Send + Sync + 'static,
{
    install(Reporter::new(callback));
    tracing::debug!("leak reporting callback replaced");
}

/// Restores the default callback, [`report_to_stderr()`].
pub fn reset_reporting_callback() {
    install(Reporter::new(report_to_stderr));
    tracing::debug!("leak reporting callback reset to default");
}

/// The default reporting callback: prints one line per leaked allocation to stderr.
///
/// The line names the allocating thread, the address, the size, the type and the call site.
/// Output from concurrent dumps is serialized so lines never interleave.
#[cfg_attr(test, mutants::skip)] // Output goes to stderr, which tests cannot observe reliably.
pub fn report_to_stderr(leak: &Leak<'_>) {
    let _serialized = STDERR_OUTPUT.lock().expect(ERR_POISONED_LOCK);

    // This may run in a thread-local destructor, where panicking aborts the process.
    // Losing a diagnostic line is preferable.
    _ = writeln!(io::stderr().lock(), "{leak}");
}

/// A reporting callback that emits one `tracing` warning event per leaked allocation.
///
/// Install it with [`set_reporting_callback(report_to_tracing)`][set_reporting_callback] to
/// route leak reports through whatever subscriber the application has configured.
pub fn report_to_tracing(leak: &Leak<'_>) {
    let address = format!("{:#x}", leak.address());

    tracing::warn!(
        address = %address,
        type_name = leak.type_name(),
        size = leak.size(),
        file = leak.file(),
        line = leak.line(),
        thread = ?leak.thread(),
        "allocation was never released"
    );
}
