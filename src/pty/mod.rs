//! Platform backends
//!
//! A backend is the capability set the lifecycle layer is built on:
//! allocate device pairs, execute a child bound to the slave sides, block
//! until it exits, and raise signals against it. Each platform has one
//! variant (two on Windows); [`Backend`] is the tagged union chosen once
//! from platform detection plus the legacy-emulation flag.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use crate::error::Result;
use crate::signal::{ExitStatus, SignalKind};
use crate::size::WindowSize;

#[cfg(test)]
pub(crate) mod mock;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::{PosixBackend, PosixDevice};
#[cfg(windows)]
pub use windows::{ConsoleHostBackend, LegacyBackend, WinDevice};

/// Device type produced by the host's [`Backend`]
#[cfg(unix)]
pub type PlatformDevice = PosixDevice;
/// Device type produced by the host's [`Backend`]
#[cfg(windows)]
pub type PlatformDevice = WinDevice;

/// The role a device pair plays for the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// stdin/stdout (and stderr unless an error channel exists)
    Primary,
    /// stderr in full-console mode
    Error,
    /// Independent control/debug stream
    Auxiliary,
}

/// Everything the native execute primitive needs, borrowed from the spawn plan
pub struct SpawnRequest<'a, D> {
    /// Executable path
    pub program: &'a str,
    /// Full argument vector, `argv[0]` included
    pub argv: &'a [String],
    /// Complete child environment
    pub envp: &'a BTreeMap<String, String>,
    /// Working directory
    pub directory: &'a Path,
    pub primary: &'a D,
    pub error: Option<&'a D>,
    pub auxiliary: Option<&'a D>,
    /// Full-console mode was requested
    pub console: bool,
}

/// Read side of a device's master
pub trait MasterRead: Send + Sync {
    /// Blocks until data, end-of-stream, or a read break
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Wake any blocked read; later reads return end-of-stream
    fn close(&self);
}

/// Write side of a device's master
pub trait MasterWrite: Send + Sync {
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    fn flush(&self) -> io::Result<()>;

    fn close(&self);
}

/// One allocated device pair, owned by the lifecycle layer
pub trait PtyDevice: Send + Sync + 'static {
    /// Identifier handed to the child (tty path, pipe name)
    fn slave_name(&self) -> &str;

    /// True for a genuine terminal/console device, false for a pipe-pair fallback
    fn is_console(&self) -> bool;

    fn open_reader(&self) -> io::Result<Box<dyn MasterRead>>;

    fn open_writer(&self) -> io::Result<Box<dyn MasterWrite>>;

    fn window_size(&self) -> Result<WindowSize>;

    fn set_window_size(&self, size: WindowSize) -> Result<()>;

    /// Make every pending and future read observe end-of-stream once drained
    fn break_read(&self);

    /// Drop the device's own hold on its descriptors.
    ///
    /// Streams already opened keep theirs until they are closed; no new
    /// stream can be opened afterwards.
    fn release(&self);
}

/// Native capability set for one platform variant
pub trait PtyBackend: Send + Sync + 'static {
    type Device: PtyDevice;

    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Whether a distinct stderr channel can be wired up
    fn supports_error_channel(&self) -> bool {
        true
    }

    /// Whether an auxiliary channel can be allocated
    fn supports_auxiliary(&self) -> bool {
        true
    }

    /// Allocate a device pair before spawn
    fn allocate(
        &self,
        kind: ChannelKind,
        console: bool,
        size: Option<WindowSize>,
    ) -> Result<Self::Device>;

    /// Start the child; returns its pid. Runs on the reaper thread.
    fn execute(&self, request: &SpawnRequest<'_, Self::Device>) -> Result<u32>;

    /// Block until `pid` exits. Called exactly once, on the thread that executed it.
    fn wait_for(&self, pid: u32) -> Result<ExitStatus>;

    /// Deliver a control; `Ok(false)` when the process no longer exists
    fn raise(&self, pid: u32, signal: SignalKind) -> Result<bool>;
}

/// The host platform's backend
#[derive(Debug)]
pub enum Backend {
    /// POSIX pty devices, fork/exec, POSIX signals
    #[cfg(unix)]
    Posix(PosixBackend),
    /// Windows pseudo console hosted by conhost
    #[cfg(windows)]
    ConsoleHost(ConsoleHostBackend),
    /// Pipe-backed emulation for hosts without a usable pseudo console
    #[cfg(windows)]
    LegacyEmulation(LegacyBackend),
}

impl Backend {
    /// Pick the backend for this host. `legacy_emulation` only matters on Windows.
    pub fn detect(legacy_emulation: bool) -> Self {
        #[cfg(unix)]
        {
            if legacy_emulation {
                tracing::debug!("legacy emulation requested on a POSIX host; using pty devices");
            }
            Backend::Posix(PosixBackend::new())
        }
        #[cfg(windows)]
        {
            if legacy_emulation {
                Backend::LegacyEmulation(LegacyBackend::new())
            } else {
                Backend::ConsoleHost(ConsoleHostBackend::new())
            }
        }
    }
}

macro_rules! dispatch {
    ($self:expr, $b:ident => $body:expr) => {
        match $self {
            #[cfg(unix)]
            Backend::Posix($b) => $body,
            #[cfg(windows)]
            Backend::ConsoleHost($b) => $body,
            #[cfg(windows)]
            Backend::LegacyEmulation($b) => $body,
        }
    };
}

impl PtyBackend for Backend {
    type Device = PlatformDevice;

    fn name(&self) -> &'static str {
        dispatch!(self, b => b.name())
    }

    fn supports_error_channel(&self) -> bool {
        dispatch!(self, b => b.supports_error_channel())
    }

    fn supports_auxiliary(&self) -> bool {
        dispatch!(self, b => b.supports_auxiliary())
    }

    fn allocate(
        &self,
        kind: ChannelKind,
        console: bool,
        size: Option<WindowSize>,
    ) -> Result<PlatformDevice> {
        dispatch!(self, b => b.allocate(kind, console, size))
    }

    fn execute(&self, request: &SpawnRequest<'_, PlatformDevice>) -> Result<u32> {
        dispatch!(self, b => b.execute(request))
    }

    fn wait_for(&self, pid: u32) -> Result<ExitStatus> {
        dispatch!(self, b => b.wait_for(pid))
    }

    fn raise(&self, pid: u32, signal: SignalKind) -> Result<bool> {
        dispatch!(self, b => b.raise(pid, signal))
    }
}
