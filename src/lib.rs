//! Mochi PTY Process - child processes attached to pseudoterminals
//!
//! This crate starts a child process whose stdin/stdout (and optionally a
//! separate stderr and an auxiliary control stream) are bound to
//! pseudoterminal devices, and manages its lifecycle from any thread.
//!
//! Key features:
//! - Primary, error and auxiliary channels, each a PTY device pair
//! - A dedicated reaper thread per child that executes and waits for it
//! - Concurrent wait, signal, resize and stream access on one handle
//! - Graceful stop: terminate, grace period, kill
//! - POSIX pty devices (with a pipe fallback) and Windows pseudo consoles
//!
//! ```no_run
//! use std::io::Write;
//! use mochi_ptyproc::{ProcessConfig, PtyProcess, WindowSize};
//!
//! let config = ProcessConfig::new(["/bin/sh"]).size(WindowSize::new(120, 40));
//! let process = PtyProcess::start(config)?;
//! (&*process.writer()?).write_all(b"exit 3\n")?;
//! assert_eq!(process.wait_for().code(), 3);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod channel;
pub mod config;
mod error;
pub mod process;
pub mod pty;
mod reaper;
pub mod signal;
mod size;
mod spawn;
pub mod stream;

pub use channel::PtyChannelSet;
pub use config::{ProcessConfig, AUX_PLACEHOLDER};
pub use error::{Error, Result};
pub use process::{ProcessState, PtyProcess, DEFAULT_GRACE_PERIOD};
pub use pty::{Backend, ChannelKind, PtyBackend, PtyDevice};
pub use signal::{ExitStatus, SignalKind};
pub use size::WindowSize;
pub use stream::{PtyReader, PtyWriter};
