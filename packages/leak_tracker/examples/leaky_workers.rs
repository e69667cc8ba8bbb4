//! Three worker threads that each leak some memory, reported as each worker ends.
//!
//! The main thread then dumps its own registry explicitly, installs a custom reporting
//! callback and leaks once more, which is reported when `main()` returns.
//!
//! Run with: `cargo run --example leaky_workers`.

use std::alloc::{Layout, handle_alloc_error};
use std::ptr::NonNull;
use std::thread;

use leak_tracker::{
    allocate, allocate_array, allocate_array_with, dump_current_thread_registry, dump_on_drop,
    release, set_reporting_callback, tracking_enabled,
};

#[derive(Debug, Default)]
#[expect(dead_code, reason = "the fields exist to give the type a size")]
struct UserStructure {
    x: i32,
    y: i32,
    z: i32,
}

/// Allocation failure has no recovery path, so treat it like the standard library does.
fn or_abort<T: ?Sized>(ptr: Option<NonNull<T>>, layout: Layout) -> NonNull<T> {
    ptr.unwrap_or_else(|| handle_alloc_error(layout))
}

fn leak_some_memory() {
    let _leaked_integer = or_abort(allocate(0_i32), Layout::new::<i32>());

    let released_integer = or_abort(allocate(1_i32), Layout::new::<i32>());
    // SAFETY: Allocated above on this thread, not used afterwards.
    unsafe { release(released_integer) };

    let _leaked_text = or_abort(
        allocate_array_with(1000, |_| b'\0'),
        Layout::new::<[u8; 1000]>(),
    );

    let released_structure = or_abort(
        allocate(UserStructure::default()),
        Layout::new::<UserStructure>(),
    );
    // SAFETY: Allocated above on this thread, not used afterwards.
    unsafe { release(released_structure) };

    let _leaked_structure = or_abort(
        allocate(UserStructure { x: 1, y: 2, z: 3 }),
        Layout::new::<UserStructure>(),
    );

    let _leaked_structures = or_abort(
        allocate_array::<UserStructure>(1000),
        Layout::new::<[UserStructure; 1000]>(),
    );
}

fn main() {
    // Reports whatever the main thread still holds when main() returns. Platforms that run
    // thread-local destructors for the main thread report it once more at process exit.
    let _final_report = dump_on_drop();

    if !tracking_enabled() {
        println!("Tracking is disabled in this build; run without --release or enable `always_on`.");
    }

    let workers: Vec<_> = [2, 2, 3]
        .into_iter()
        .map(|rounds| {
            thread::spawn(move || {
                for _ in 0..rounds {
                    leak_some_memory();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("worker threads do not panic");
    }

    // The workers' leaks were reported as each of them ended. The main thread has none yet.
    dump_current_thread_registry();

    println!("Custom reporting callback set");
    set_reporting_callback(|leak| {
        println!("My dump: {} was left unreleased!", leak.type_name());
    });

    let released = or_abort(allocate(0_i32), Layout::new::<i32>());
    // SAFETY: Allocated above on this thread, not used afterwards.
    unsafe { release(released) };

    let _leaked = or_abort(allocate(0_i32), Layout::new::<i32>());

    println!("Program exit, the final report follows");
}
