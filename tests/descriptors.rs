//! Descriptor accounting across a full process lifetime
//!
//! Kept in its own test binary: other tests opening devices concurrently
//! would skew the count.

#![cfg(target_os = "linux")]

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use mochi_ptyproc::{ProcessConfig, PtyDevice, PtyProcess};

fn open_fds() -> usize {
    fs::read_dir("/proc/self/fd").unwrap().count()
}

#[test]
fn test_destroy_returns_every_descriptor() {
    // Warm up anything opened lazily on first use
    let warmup = PtyProcess::start(ProcessConfig::new(["/bin/true"]).console(true)).unwrap();
    let real_pty = warmup.channels().primary().is_console();
    warmup.wait_for();
    drop(warmup);

    let before = open_fds();
    let process = PtyProcess::start(
        ProcessConfig::new(["/bin/sleep", "30"])
            .console(true)
            .auxiliary_channel(real_pty),
    )
    .unwrap();
    assert!(open_fds() > before);

    process.destroy().unwrap();
    // The slave hold is dropped by the reaper right after it publishes the status
    let deadline = Instant::now() + Duration::from_secs(2);
    while open_fds() > before && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(
        open_fds() <= before,
        "leaked {} descriptors",
        open_fds() - before
    );
}
